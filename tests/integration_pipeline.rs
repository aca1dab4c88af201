//! Push/Pull distribution.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{init_tracing, inproc_url, wait_for_pipes};
use scalemsg::{Error, Pull0, Push0};

#[tokio::test]
async fn work_round_robins_across_pullers() -> Result<()> {
    init_tracing();
    let url = inproc_url("pipeline-rr");

    let push = Push0::open()?;
    push.listen(&url).await?;

    let pull1 = Pull0::open()?;
    let pull2 = Pull0::open()?;
    pull1.set_recv_timeout(Some(Duration::from_secs(2)))?;
    pull2.set_recv_timeout(Some(Duration::from_secs(2)))?;
    pull1.dial(&url).await?;
    pull2.dial(&url).await?;
    assert!(wait_for_pipes(push.socket(), 2).await);

    push.asend(b"A").await?;
    push.asend(b"B").await?;

    // Each puller gets exactly one of the two, order unspecified.
    let got1 = pull1.arecv().await?;
    let got2 = pull2.arecv().await?;
    let mut both = vec![got1.clone(), got2.clone()];
    both.sort();
    assert_eq!(both, vec![b"A".to_vec(), b"B".to_vec()]);

    pull1.set_recv_timeout(Some(Duration::from_millis(100)))?;
    pull2.set_recv_timeout(Some(Duration::from_millis(100)))?;
    assert_eq!(pull1.arecv().await.unwrap_err(), Error::Timeout);
    assert_eq!(pull2.arecv().await.unwrap_err(), Error::Timeout);
    Ok(())
}

#[tokio::test]
async fn wrong_directions_are_not_supported() -> Result<()> {
    init_tracing();
    let push = Push0::open()?;
    let pull = Pull0::open()?;
    assert_eq!(push.arecv().await.unwrap_err(), Error::NotSupported);
    assert_eq!(pull.asend(b"no").await.unwrap_err(), Error::NotSupported);
    Ok(())
}

#[tokio::test]
async fn push_with_no_capacity_times_out() -> Result<()> {
    init_tracing();
    let push = Push0::open()?;
    push.set_send_timeout(Some(Duration::from_millis(50)))?;
    // No peer at all: the send has nowhere to go and times out.
    assert_eq!(push.asend(b"stranded").await.unwrap_err(), Error::Timeout);
    Ok(())
}
