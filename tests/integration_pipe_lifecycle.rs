//! Pipe lifecycle: add/remove bookkeeping, callbacks, veto, reconnect.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use common::{init_tracing, inproc_url, wait_for_pipes};
use scalemsg::{OptionValue, Pair0, SockAddr};

#[tokio::test]
async fn pipes_get_added_and_removed() -> Result<()> {
    init_tracing();
    let url = inproc_url("lifecycle-add-remove");

    let s0 = Pair0::open()?;
    let s1 = Pair0::open()?;
    assert!(s0.pipes().is_empty());
    assert!(s1.pipes().is_empty());

    s0.listen(&url).await?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);
    assert!(wait_for_pipes(&s1, 1).await);

    s1.close();
    assert!(wait_for_pipes(&s0, 0).await);
    Ok(())
}

#[tokio::test]
async fn closing_a_pipe_evicts_it_and_the_dialer_reconnects() -> Result<()> {
    init_tracing();
    let url = inproc_url("lifecycle-reconnect");

    let s0 = Pair0::open()?;
    let s1 = Pair0::open()?;
    s1.set_option("reconnect-time-min", OptionValue::Ms(5))?;
    s0.listen(&url).await?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);
    let first_id = s0.pipes()[0].id();

    s0.pipes()[0].close();

    // The dialer notices and re-establishes; the replacement pipe has a
    // fresh (strictly larger) id, never a recycled one.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let pipes = s0.pipes();
        if pipes.len() == 1 && pipes[0].id() != first_id {
            assert!(pipes[0].id() > first_id);
            break;
        }
        assert!(Instant::now() < deadline, "dialer never reconnected");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

#[tokio::test]
async fn callbacks_fire_in_lifecycle_order() -> Result<()> {
    init_tracing();
    let url = inproc_url("lifecycle-callbacks");

    let s0 = Pair0::open()?;
    let pre = Arc::new(AtomicUsize::new(0));
    let post = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    {
        let pre = pre.clone();
        s0.add_pre_pipe_connect_cb(move |_| {
            pre.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let post = post.clone();
        s0.add_post_pipe_connect_cb(move |_| {
            post.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let removed = removed.clone();
        s0.add_post_pipe_remove_cb(move |_| {
            removed.fetch_add(1, Ordering::SeqCst);
        });
    }

    s0.listen(&url).await?;
    let s1 = Pair0::open()?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);
    assert_eq!(pre.load(Ordering::SeqCst), 1);
    assert_eq!(post.load(Ordering::SeqCst), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 0);

    s0.close();
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn closing_in_pre_add_vetoes_the_pipe() -> Result<()> {
    init_tracing();
    let url = inproc_url("lifecycle-veto");

    let s0 = Pair0::open()?;
    let pre_called = Arc::new(AtomicBool::new(false));
    let post_called = Arc::new(AtomicBool::new(false));
    let removed_called = Arc::new(AtomicBool::new(false));
    {
        let pre_called = pre_called.clone();
        s0.add_pre_pipe_connect_cb(move |pipe| {
            pipe.close();
            pre_called.store(true, Ordering::SeqCst);
        });
    }
    {
        let post_called = post_called.clone();
        s0.add_post_pipe_connect_cb(move |_| post_called.store(true, Ordering::SeqCst));
    }
    {
        let removed_called = removed_called.clone();
        s0.add_post_pipe_remove_cb(move |_| removed_called.store(true, Ordering::SeqCst));
    }
    s0.listen(&url).await?;

    let s1 = Pair0::open()?;
    // Keep the dialer from hammering retries while we observe the veto.
    s1.set_option("reconnect-time-min", OptionValue::Ms(60_000))?;
    s1.dial(&url).await?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !pre_called.load(Ordering::SeqCst) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(pre_called.load(Ordering::SeqCst));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Vetoed pipes never reach post-add (or post-remove), and never join
    // the socket.
    assert!(!post_called.load(Ordering::SeqCst));
    assert!(!removed_called.load(Ordering::SeqCst));
    assert!(s0.pipes().is_empty());
    Ok(())
}

#[tokio::test]
async fn panicking_callbacks_do_not_break_the_dispatcher() -> Result<()> {
    init_tracing();
    let url = inproc_url("lifecycle-panic");

    let s0 = Pair0::open()?;
    let well_behaved = Arc::new(AtomicBool::new(false));
    s0.add_pre_pipe_connect_cb(|_| panic!("misbehaving callback"));
    {
        let well_behaved = well_behaved.clone();
        s0.add_pre_pipe_connect_cb(move |_| well_behaved.store(true, Ordering::SeqCst));
    }
    s0.listen(&url).await?;

    let s1 = Pair0::open()?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);
    assert!(well_behaved.load(Ordering::SeqCst));

    // The socket still works.
    s1.asend(b"survived").await?;
    assert_eq!(s0.arecv().await?, b"survived");
    Ok(())
}

#[tokio::test]
async fn removed_callbacks_stop_firing() -> Result<()> {
    init_tracing();
    let url = inproc_url("lifecycle-cb-removal");

    let s0 = Pair0::open()?;
    let count = Arc::new(AtomicUsize::new(0));
    let handle = {
        let count = count.clone();
        s0.add_post_pipe_connect_cb(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    s0.listen(&url).await?;

    let s1 = Pair0::open()?;
    // Preempted dialers would otherwise reconnect and fight over the pair.
    s1.set_option("reconnect-time-min", OptionValue::Ms(60_000))?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    s0.remove_pipe_cb(handle);
    let s2 = Pair0::open()?;
    s2.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await); // s2 preempts s1 on pair0
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn pipe_addresses_and_directed_send() -> Result<()> {
    init_tracing();
    let url = inproc_url("lifecycle-addresses");
    let name = url.trim_start_matches("inproc://").to_owned();

    let s0 = Pair0::open()?;
    let s1 = Pair0::open()?;
    s0.listen(&url).await?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);

    let pipe = &s0.pipes()[0];
    assert_eq!(pipe.local_address(), SockAddr::Inproc { name: name.clone() });
    assert_eq!(pipe.remote_address(), SockAddr::Inproc { name });

    pipe.asend(b"straight down the pipe").await?;
    assert_eq!(s1.arecv().await?, b"straight down the pipe");
    Ok(())
}
