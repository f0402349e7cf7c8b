//! Remote references over the in-process channel dispatcher.

use std::sync::Arc;
use std::time::Duration;

use exoref::ChannelDispatcher;
use exoref::Dispatcher;
use exoref::RefId;
use exoref::RemoteEnd;
use exoref::RemoteRef;
use exoref::channel::Request;
use exoref::dispatcher::Error as DispatchError;
use exoref::reference;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spawns a remote side that answers every request and reports it on a channel.
fn spawn_counter_remote(remote: RemoteEnd) -> mpsc::UnboundedReceiver<Request> {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(remote.serve(move |request| {
        let _ = seen_tx.send(request.clone());
        match request.method.as_str() {
            "getValue" => Ok(json!(7)),
            "echo" => Ok(Value::Array(request.args.clone())),
            "whoami" => Ok(json!(request.target.map(|id| id.0))),
            "explode" => Err("remote blew up".into()),
            _ => Ok(Value::Null),
        }
    }));
    seen_rx
}

fn drain(seen: &mut mpsc::UnboundedReceiver<Request>) -> Vec<Request> {
    let mut out = Vec::new();
    while let Ok(request) = seen.try_recv() {
        out.push(request);
    }
    out
}

#[tokio::test]
async fn test_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let (dispatcher, remote) = ChannelDispatcher::pair();
    let mut seen = spawn_counter_remote(remote);

    let handle = RemoteRef::new(Arc::new(dispatcher), RefId(42));
    let value: i64 = handle.invoke("getValue", vec![]).await?;
    let echoed: Vec<String> = handle.invoke("echo", vec![json!("a"), json!("b")]).await?;

    assert_eq!(value, 7);
    assert_eq!(echoed, vec!["a", "b"]);

    let requests = drain(&mut seen);
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.target == Some(RefId(42))));
    assert_ne!(requests[0].seq, requests[1].seq);
    Ok(())
}

#[tokio::test]
async fn test_release_reaches_remote_once() -> anyhow::Result<()> {
    init_tracing();
    let (dispatcher, remote) = ChannelDispatcher::pair();
    let mut seen = spawn_counter_remote(remote);

    let handle = RemoteRef::new(Arc::new(dispatcher), RefId(5));
    handle.dispose().await;
    handle.dispose().await;

    let requests = drain(&mut seen);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "release");
    assert_eq!(requests[0].target, None);
    assert_eq!(requests[0].args, vec![json!(5)]);
    Ok(())
}

#[tokio::test]
async fn test_custom_release_method() -> anyhow::Result<()> {
    let (dispatcher, remote) = ChannelDispatcher::pair();
    let dispatcher = dispatcher.with_release_method("dropRef");
    let mut seen = spawn_counter_remote(remote);

    let handle = RemoteRef::new(Arc::new(dispatcher), RefId(8));
    handle.dispose().await;

    let requests = drain(&mut seen);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "dropRef");
    Ok(())
}

#[tokio::test]
async fn test_remote_failure_propagates() {
    let (dispatcher, remote) = ChannelDispatcher::pair();
    let _seen = spawn_counter_remote(remote);

    let handle = RemoteRef::new(Arc::new(dispatcher), RefId(1));
    let err = handle.invoke::<Value>("explode", vec![]).await.unwrap_err();

    assert_eq!(
        err,
        reference::Error::Dispatch(DispatchError::Remote("remote blew up".into()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_handles_share_one_dispatcher() -> anyhow::Result<()> {
    init_tracing();
    let (dispatcher, remote) = ChannelDispatcher::pair();
    let _seen = spawn_counter_remote(remote);
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);

    let tasks: Vec<_> = (1..=16u64)
        .map(|raw| {
            let handle = RemoteRef::new(dispatcher.clone(), RefId(raw));
            tokio::spawn(async move {
                let seen: Option<u64> = handle.invoke("whoami", vec![]).await?;
                handle.dispose().await;
                Ok::<_, reference::Error>((raw, seen))
            })
        })
        .collect();

    for task in tasks {
        let (raw, seen) = task.await??;
        assert_eq!(seen, Some(raw));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispose_over_channel() -> anyhow::Result<()> {
    let (dispatcher, remote) = ChannelDispatcher::pair();
    let mut seen = spawn_counter_remote(remote);
    let handle = Arc::new(RemoteRef::new(Arc::new(dispatcher), RefId(77)));

    let tasks: Vec<_> = (0..24)
        .map(|_| {
            let handle = handle.clone();
            tokio::spawn(async move { handle.dispose().await })
        })
        .collect();
    for task in tasks {
        task.await?;
    }

    let releases: Vec<_> = drain(&mut seen)
        .into_iter()
        .filter(|r| r.method == "release")
        .collect();
    assert_eq!(releases.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_frees_pending_slot() -> anyhow::Result<()> {
    let (dispatcher, mut remote) = ChannelDispatcher::pair();
    let dispatcher = Arc::new(dispatcher);
    let handle = RemoteRef::new(dispatcher.clone(), RefId(3));

    let cancel = CancellationToken::new();
    let call = tokio::spawn({
        let cancel = cancel.clone();
        async move { handle.invoke_with_cancel::<Value>("slow", cancel, vec![]).await }
    });

    // Hold the request without answering, then cancel.
    let request = remote.recv().await.expect("request");
    assert_eq!(request.method, "slow");
    assert_eq!(dispatcher.in_flight(), 1);
    cancel.cancel();

    let err = call.await?.unwrap_err();
    assert_eq!(err, reference::Error::Dispatch(DispatchError::Cancelled));
    assert_eq!(dispatcher.in_flight(), 0);

    // A late answer is dropped by the pump.
    remote.reply(request.seq, Ok(json!("too late")))?;
    Ok(())
}

#[tokio::test]
async fn test_timeout_over_channel() -> anyhow::Result<()> {
    let (dispatcher, mut remote) = ChannelDispatcher::pair();
    let handle = RemoteRef::new(Arc::new(dispatcher), RefId(4));

    let silent = tokio::spawn(async move {
        // Keep the remote end alive without answering.
        let request = remote.recv().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        request
    });

    let err = handle
        .invoke_with_timeout::<Value>("slow", Duration::from_millis(20), vec![])
        .await
        .unwrap_err();
    assert_eq!(err, reference::Error::Dispatch(DispatchError::Cancelled));
    assert!(!handle.is_disposed());

    assert!(silent.await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_remote_gone_mid_call_fails_pending() -> anyhow::Result<()> {
    let (dispatcher, mut remote) = ChannelDispatcher::pair();
    let handle = RemoteRef::new(Arc::new(dispatcher), RefId(6));

    tokio::spawn(async move {
        let _ = remote.recv().await;
        drop(remote);
    });

    let err = handle.invoke::<Value>("getValue", vec![]).await.unwrap_err();
    assert!(matches!(err, reference::Error::Dispatch(DispatchError::Disconnected(_))));
    Ok(())
}

#[tokio::test]
async fn test_dispose_succeeds_when_remote_is_gone() {
    init_tracing();
    let (dispatcher, remote) = ChannelDispatcher::pair();
    drop(remote);

    let handle = RemoteRef::new(Arc::new(dispatcher), RefId(10));
    handle.dispose().await;

    assert!(handle.is_disposed());
    let err = handle.invoke::<Value>("getValue", vec![]).await.unwrap_err();
    assert!(matches!(err, reference::Error::Disposed { .. }));
}

#[tokio::test]
async fn test_drop_sends_no_release() -> anyhow::Result<()> {
    let (dispatcher, remote) = ChannelDispatcher::pair();
    let mut seen = spawn_counter_remote(remote);
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(dispatcher);

    let handle = RemoteRef::new(dispatcher.clone(), RefId(12));
    let _: i64 = handle.invoke("getValue", vec![]).await?;
    drop(handle);

    // A call on a fresh handle flushes anything the dropped one might have sent.
    let other = RemoteRef::new(dispatcher, RefId(13));
    let _: i64 = other.invoke("getValue", vec![]).await?;

    let requests = drain(&mut seen);
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.method == "getValue"));
    Ok(())
}

#[tokio::test]
async fn test_dropped_calls_free_pending_slots() -> anyhow::Result<()> {
    let (dispatcher, mut remote) = ChannelDispatcher::pair();
    let dispatcher = Arc::new(dispatcher);
    let handle = RemoteRef::new(dispatcher.clone(), RefId(14));

    for _ in 0..3 {
        let call = handle.invoke::<Value>("slow", vec![]);
        let outcome = tokio::time::timeout(Duration::from_millis(10), call).await;
        assert!(outcome.is_err());
    }

    // The remote end received all three but never answered.
    for _ in 0..3 {
        assert_eq!(remote.recv().await.expect("request").method, "slow");
    }
    assert_eq!(dispatcher.in_flight(), 0);

    // A task aborted mid-call frees its slot too.
    let aborted = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.invoke(RefId(15), "slow", vec![], None).await }
    });
    let request = remote.recv().await.expect("request");
    assert_eq!(dispatcher.in_flight(), 1);
    aborted.abort();
    assert!(aborted.await.unwrap_err().is_cancelled());
    assert_eq!(dispatcher.in_flight(), 0);

    remote.reply(request.seq, Ok(json!("too late")))?;
    Ok(())
}
