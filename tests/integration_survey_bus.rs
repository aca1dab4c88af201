//! Surveyor/Respondent windows and Bus mesh delivery.

mod common;

use std::time::{Duration, Instant};

use anyhow::Result;
use common::{init_tracing, inproc_url, wait_for_pipes};
use scalemsg::{Bus0, Error, Respondent0, Surveyor0};

#[tokio::test]
async fn survey_collects_answers_from_every_respondent() -> Result<()> {
    init_tracing();
    let url = inproc_url("survey-collect");

    let surveyor = Surveyor0::open()?;
    surveyor.set_recv_timeout(Some(Duration::from_secs(4)))?;
    surveyor.set_survey_time(Duration::from_secs(8))?;
    surveyor.listen(&url).await?;

    let resp1 = Respondent0::open()?;
    let resp2 = Respondent0::open()?;
    resp1.set_recv_timeout(Some(Duration::from_secs(4)))?;
    resp2.set_recv_timeout(Some(Duration::from_secs(4)))?;
    resp1.dial(&url).await?;
    resp2.dial(&url).await?;
    assert!(wait_for_pipes(surveyor.socket(), 2).await);

    surveyor.asend(b"how's it going?").await?;
    assert_eq!(resp1.arecv().await?, b"how's it going?");
    assert_eq!(resp2.arecv().await?, b"how's it going?");

    resp1.asend(b"not too bad").await?;
    resp2.asend(b"thanks for asking").await?;

    let mut answers = vec![surveyor.arecv().await?, surveyor.arecv().await?];
    answers.sort();
    assert_eq!(answers, vec![b"not too bad".to_vec(), b"thanks for asking".to_vec()]);

    // One answer per survey: a second send without a new question is a
    // state error.
    assert_eq!(resp2.asend(b"me again").await.unwrap_err(), Error::BadState);
    Ok(())
}

#[tokio::test]
async fn survey_window_expires_into_timeout() -> Result<()> {
    init_tracing();
    let url = inproc_url("survey-window");

    let surveyor = Surveyor0::open()?;
    surveyor.set_survey_time(Duration::from_millis(10))?;
    surveyor.listen(&url).await?;

    // A respondent that never answers.
    let quiet = Respondent0::open()?;
    quiet.dial(&url).await?;
    assert!(wait_for_pipes(surveyor.socket(), 1).await);

    let asked_at = Instant::now();
    surveyor.asend(b"anyone?").await?;
    assert_eq!(surveyor.arecv().await.unwrap_err(), Error::Timeout);
    assert!(asked_at.elapsed() < Duration::from_millis(500));

    // The window stays shut until the next survey opens.
    assert_eq!(surveyor.arecv().await.unwrap_err(), Error::Timeout);
    Ok(())
}

#[tokio::test]
async fn new_survey_discards_stale_answers() -> Result<()> {
    init_tracing();
    let url = inproc_url("survey-stale");

    let surveyor = Surveyor0::open()?;
    surveyor.set_recv_timeout(Some(Duration::from_millis(200)))?;
    surveyor.listen(&url).await?;

    let resp = Respondent0::open()?;
    resp.set_recv_timeout(Some(Duration::from_secs(2)))?;
    resp.dial(&url).await?;
    assert!(wait_for_pipes(surveyor.socket(), 1).await);

    surveyor.asend(b"first question").await?;
    assert_eq!(resp.arecv().await?, b"first question");

    // The answer arrives only after a second survey opened: it carries the
    // old survey id and is dropped.
    surveyor.asend(b"second question").await?;
    resp.asend(b"answer to the first").await?;
    assert_eq!(surveyor.arecv().await.unwrap_err(), Error::Timeout);
    Ok(())
}

#[tokio::test]
async fn bus_reaches_every_direct_peer() -> Result<()> {
    init_tracing();
    let url = inproc_url("bus-mesh");

    let s0 = Bus0::open()?;
    let s1 = Bus0::open()?;
    let s2 = Bus0::open()?;
    for s in [&s0, &s1, &s2] {
        s.set_recv_timeout(Some(Duration::from_millis(500)))?;
    }
    s0.listen(&url).await?;
    s1.dial(&url).await?;
    s2.dial(&url).await?;
    assert!(wait_for_pipes(s0.socket(), 2).await);

    s0.asend(b"s1 and s2 get this").await?;
    assert_eq!(s1.arecv().await?, b"s1 and s2 get this");
    assert_eq!(s2.arecv().await?, b"s1 and s2 get this");

    // s1 and s2 are not connected to each other, so s1's message reaches
    // only s0; there is no transitive forwarding through the listener.
    s1.asend(b"only s0 gets this").await?;
    assert_eq!(s0.arecv().await?, b"only s0 gets this");
    assert_eq!(s2.arecv().await.unwrap_err(), Error::Timeout);
    Ok(())
}
