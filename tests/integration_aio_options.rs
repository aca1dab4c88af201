//! The AIO operation surface and the option system.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{init_tracing, inproc_url, wait_for_pipes};
use scalemsg::{Error, Message, OptionValue, Pair0, Req0, Sub0};

#[tokio::test]
async fn aio_recv_completes_with_a_message() -> Result<()> {
    init_tracing();
    let url = inproc_url("aio-recv");

    let s0 = Pair0::open()?;
    let s1 = Pair0::open()?;
    s0.listen(&url).await?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);

    let aio = s0.start_recv(Some(Duration::from_secs(2)));
    s1.asend(b"delivered via aio").await?;
    aio.wait_async().await?;
    let msg = aio.take_msg().expect("completed recv carries a message");
    assert_eq!(msg.body()?, b"delivered via aio");
    Ok(())
}

#[tokio::test]
async fn aio_cancel_and_deadline() -> Result<()> {
    init_tracing();
    let url = inproc_url("aio-cancel");
    let s0 = Pair0::open()?;
    s0.listen(&url).await?;

    // Nothing will ever arrive; cancellation wins.
    let aio = s0.start_recv(None);
    aio.cancel();
    assert_eq!(aio.wait_async().await.unwrap_err(), Error::Canceled);
    // Idempotent after completion.
    aio.cancel();
    assert_eq!(aio.result(), Some(Err(Error::Canceled)));

    // And a deadline on its own produces Timeout.
    let aio = s0.start_recv(Some(Duration::from_millis(30)));
    assert_eq!(aio.wait_async().await.unwrap_err(), Error::Timeout);
    Ok(())
}

#[tokio::test]
async fn aio_completion_callback_wakes_the_caller() -> Result<()> {
    init_tracing();
    let url = inproc_url("aio-callback");

    let s0 = Pair0::open()?;
    let s1 = Pair0::open()?;
    s0.listen(&url).await?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let aio = s0.start_recv_with_callback(Some(Duration::from_secs(2)), move || {
        let _ = tx.send(());
    });
    s1.asend(b"ding").await?;
    rx.await.expect("completion callback should fire");
    assert_eq!(aio.result(), Some(Ok(())));
    Ok(())
}

#[tokio::test]
async fn aio_send_consumes_the_message() -> Result<()> {
    init_tracing();
    let url = inproc_url("aio-send");

    let s0 = Pair0::open()?;
    let s1 = Pair0::open()?;
    s0.listen(&url).await?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);

    let mut msg = Message::new(&b"pushed through aio"[..]);
    let aio = s1.start_send(&mut msg, Some(Duration::from_secs(2)))?;
    aio.wait_async().await?;
    assert_eq!(s0.arecv().await?, b"pushed through aio");

    assert_eq!(
        s1.start_send(&mut msg, None).unwrap_err(),
        Error::AlreadySent
    );
    Ok(())
}

#[tokio::test]
async fn identity_options_are_read_only_and_typed() -> Result<()> {
    init_tracing();
    let req = Req0::open()?;

    assert_eq!(req.get_option("protocol")?.as_int()?, 0x30);
    assert_eq!(req.get_option("peer")?.as_int()?, 0x31);
    assert_eq!(req.get_option("protocol-name")?.as_str()?, "req");
    assert_eq!(req.get_option("peer-name")?.as_str()?, "rep");
    assert!(!req.get_option("raw")?.as_bool()?);

    assert_eq!(
        req.set_option("protocol", OptionValue::Int(1)).unwrap_err(),
        Error::ReadOnly
    );
    assert_eq!(
        req.set_option("raw", OptionValue::Bool(true)).unwrap_err(),
        Error::ReadOnly
    );
    assert_eq!(
        req.get_option("definitely-not-an-option").unwrap_err(),
        Error::NotSupported
    );

    // Wrong value type is its own error.
    assert_eq!(
        req.set_option("recv-timeout", OptionValue::Str("soon".into()))
            .unwrap_err(),
        Error::BadType
    );
    Ok(())
}

#[tokio::test]
async fn protocol_options_route_to_the_right_protocol() -> Result<()> {
    init_tracing();
    let req = Req0::open()?;
    assert_eq!(req.get_option("req:resend-time")?.as_ms()?, 60_000);
    req.set_option("req:resend-time", OptionValue::Ms(1234))?;
    assert_eq!(req.get_option("req:resend-time")?.as_ms()?, 1234);

    // A context can override the socket-wide value without touching it.
    let ctx = req.context()?;
    ctx.set_option("req:resend-time", OptionValue::Ms(99))?;
    assert_eq!(ctx.get_option("req:resend-time")?.as_ms()?, 99);
    assert_eq!(req.get_option("req:resend-time")?.as_ms()?, 1234);

    // Options of other protocols do not exist here.
    let sub = Sub0::open()?;
    assert_eq!(
        sub.get_option("req:resend-time").unwrap_err(),
        Error::NotSupported
    );
    Ok(())
}

#[tokio::test]
async fn socket_names_are_free_form() -> Result<()> {
    init_tracing();
    let s = Pair0::open()?;
    // Defaults to the socket id, i.e. something numeric.
    assert!(s.name().parse::<u32>().is_ok());
    s.set_name("weather-feed")?;
    assert_eq!(s.name(), "weather-feed");
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn abstract_sockets_auto_bind_and_round_trip() -> Result<()> {
    init_tracing();
    let s0 = Pair0::open()?;
    // Empty name: the listener picks one and reports it.
    let listener = s0.listen("abstract://").await?;
    let url = listener.local_address().to_string();
    assert!(url.starts_with("abstract://"));
    assert_ne!(url, "abstract://");

    let s1 = Pair0::open()?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);

    s1.asend(b"invisible socket file").await?;
    assert_eq!(s0.arecv().await?, b"invisible socket file");
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn abstract_names_may_contain_escaped_nul_bytes() -> Result<()> {
    init_tracing();
    let url = format!("abstract://scale%00msg-{}", std::process::id());

    let s0 = Pair0::open()?;
    let s1 = Pair0::open()?;
    s0.listen(&url).await?;
    s1.dial(&url).await?;
    assert!(wait_for_pipes(&s0, 1).await);

    s1.asend(b"null-riddled name").await?;
    assert_eq!(s0.arecv().await?, b"null-riddled name");
    Ok(())
}
