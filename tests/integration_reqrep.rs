//! Request/Reply semantics: state errors, routing, retries and contexts.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{init_tracing, inproc_url, wait_for_pipes};
use scalemsg::{Error, Rep0, Req0};

#[tokio::test]
async fn request_reply_exchange() -> Result<()> {
    init_tracing();
    let url = inproc_url("reqrep-basic");

    let req = Req0::open()?;
    let rep = Rep0::open()?;
    req.set_recv_timeout(Some(Duration::from_secs(2)))?;
    rep.set_recv_timeout(Some(Duration::from_secs(2)))?;
    req.listen(&url).await?;
    rep.dial(&url).await?;
    assert!(wait_for_pipes(&req, 1).await);

    req.asend(b"random.random()").await?;
    assert_eq!(rep.arecv().await?, b"random.random()");
    rep.asend(b"4").await?;
    assert_eq!(req.arecv().await?, b"4");

    // A requester with nothing outstanding has nothing to receive.
    assert_eq!(req.arecv().await.unwrap_err(), Error::BadState);
    // A replier cannot reply before it heard a question.
    assert_eq!(rep.asend(b"eager").await.unwrap_err(), Error::BadState);
    Ok(())
}

#[tokio::test]
async fn unanswered_request_is_resent_on_another_pipe() -> Result<()> {
    init_tracing();
    let url1 = inproc_url("reqrep-resend-a");
    let url2 = inproc_url("reqrep-resend-b");

    let req = Req0::open()?;
    req.set_resend_time(Some(Duration::from_millis(100)))?;
    req.set_recv_timeout(Some(Duration::from_secs(5)))?;

    let rep1 = Rep0::open()?;
    let rep2 = Rep0::open()?;
    rep1.set_recv_timeout(Some(Duration::from_secs(5)))?;
    rep2.set_recv_timeout(Some(Duration::from_secs(5)))?;
    rep1.listen(&url1).await?;
    rep2.listen(&url2).await?;
    req.dial(&url1).await?;
    req.dial(&url2).await?;
    assert!(wait_for_pipes(&req, 2).await);

    // Whichever replier hears the request first stays silent; the request
    // must then show up at the other one via the resend path.
    let first_heard = Arc::new(AtomicBool::new(false));
    let mut servers = Vec::new();
    for rep in [rep1, rep2] {
        let first_heard = first_heard.clone();
        servers.push(tokio::spawn(async move {
            let question = rep.arecv().await?;
            assert_eq!(question, b"anybody?");
            if first_heard.swap(true, Ordering::SeqCst) {
                rep.asend(b"me, eventually").await?;
            }
            Ok::<_, Error>(())
        }));
    }

    req.asend(b"anybody?").await?;
    assert_eq!(req.arecv().await?, b"me, eventually");
    for server in servers {
        server.await.unwrap()?;
    }
    Ok(())
}

#[tokio::test]
async fn contexts_run_concurrent_exchanges() -> Result<()> {
    init_tracing();
    let url = inproc_url("reqrep-contexts");

    let rep = Rep0::open()?;
    rep.set_recv_timeout(Some(Duration::from_secs(2)))?;
    rep.listen(&url).await?;

    let req1 = Req0::open()?;
    let req2 = Req0::open()?;
    req1.set_recv_timeout(Some(Duration::from_secs(2)))?;
    req2.set_recv_timeout(Some(Duration::from_secs(2)))?;
    req1.dial(&url).await?;
    req2.dial(&url).await?;
    assert!(wait_for_pipes(&rep, 2).await);

    // Two server contexts answer out of order: each holds its own routing
    // stash, so replies still reach the right requester.
    let mut workers = Vec::new();
    for _ in 0..2 {
        let ctx = rep.context()?;
        workers.push(tokio::spawn(async move {
            let question = ctx.arecv().await?;
            tokio::time::sleep(Duration::from_millis(50)).await;
            ctx.asend(&question).await?;
            Ok::<_, Error>(())
        }));
    }

    req1.asend(b"oh hi").await?;
    req2.asend(b"me toooo").await?;
    assert_eq!(req1.arecv().await?, b"oh hi");
    assert_eq!(req2.arecv().await?, b"me toooo");
    for worker in workers {
        worker.await.unwrap()?;
    }
    Ok(())
}

#[tokio::test]
async fn context_state_errors_match_socket_ones() -> Result<()> {
    init_tracing();
    let url = inproc_url("reqrep-ctx-state");

    let req = Req0::open()?;
    let rep = Rep0::open()?;
    req.listen(&url).await?;
    rep.dial(&url).await?;
    assert!(wait_for_pipes(&req, 1).await);

    let req_ctx = req.context()?;
    let rep_ctx = rep.context()?;
    assert_eq!(req_ctx.arecv().await.unwrap_err(), Error::BadState);
    assert_eq!(rep_ctx.asend(b"nope").await.unwrap_err(), Error::BadState);

    // Contexts are a Req/Rep-only feature.
    let pair = scalemsg::Pair0::open()?;
    assert_eq!(pair.context().unwrap_err(), Error::NotSupported);
    Ok(())
}

#[tokio::test]
async fn new_request_abandons_the_old_exchange() -> Result<()> {
    init_tracing();
    let url = inproc_url("reqrep-abandon");

    let req = Req0::open()?;
    let rep = Rep0::open()?;
    req.set_recv_timeout(Some(Duration::from_secs(2)))?;
    rep.set_recv_timeout(Some(Duration::from_secs(2)))?;
    req.listen(&url).await?;
    rep.dial(&url).await?;
    assert!(wait_for_pipes(&req, 1).await);

    req.asend(b"first").await?;
    assert_eq!(rep.arecv().await?, b"first");

    // Second request supersedes the first; the stale reply is discarded.
    req.asend(b"second").await?;
    rep.asend(b"answer to first").await?;
    assert_eq!(rep.arecv().await?, b"second");
    rep.asend(b"answer to second").await?;
    assert_eq!(req.arecv().await?, b"answer to second");
    Ok(())
}
