//! # In-Process Channel Dispatcher
//!
//! A [`Dispatcher`] whose remote side lives in the same process, reached
//! through tokio channels. Useful for hosting both sides in one binary and
//! for tests that want real async round trips.
//!
//! Calls go out over one channel tagged with a sequence number. Replies come
//! back over another and are picked up by a background pump task, which
//! routes each to the caller waiting on that sequence number.
//!
//! ## Invariants
//!
//! - Every call gets a distinct sequence number.
//! - A reply for a sequence number nobody waits on (e.g. a cancelled call)
//!   is dropped.
//! - When the remote end goes away, every waiting caller fails with
//!   `Error::Disconnected`.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::DEFAULT_RELEASE_METHOD;
use crate::dispatcher::Dispatcher;
use crate::dispatcher::Error;
use crate::dispatcher::Result;
use crate::handles::RefId;

/// A call as seen by the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub seq: u64,
    /// The object the call is addressed to, `None` for `invoke_void`.
    pub target: Option<RefId>,
    pub method: String,
    pub args: Vec<Value>,
}

/// Outcome of a request as reported by the remote side.
pub type Outcome = std::result::Result<Value, String>;

#[derive(Debug)]
struct Reply {
    seq: u64,
    outcome: Outcome,
}

type Pending = DashMap<u64, oneshot::Sender<Result<Value>>>;

/// Clears a call's pending slot when the call ends, however it ends.
///
/// A no-op if the pump already took the slot to deliver the reply.
struct PendingGuard<'a> {
    pending: &'a Pending,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.seq);
    }
}

/// Dispatcher half of an in-process channel pair.
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Request>,
    pending: Arc<Pending>,
    seq_gen: AtomicU64,
    release_method: String,
}

/// Remote half of an in-process channel pair.
///
/// Receives requests and answers them by sequence number.
pub struct RemoteEnd {
    // Must drop before `tx` so the pump only stops once no request can be delivered.
    rx: mpsc::UnboundedReceiver<Request>,
    tx: mpsc::UnboundedSender<Reply>,
}

impl ChannelDispatcher {
    /// Creates a connected dispatcher and remote end, spawning the reply pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn pair() -> (Self, RemoteEnd) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(DashMap::new());

        tokio::spawn(Self::pump(reply_rx, pending.clone()));

        let dispatcher = Self {
            tx: request_tx,
            pending,
            seq_gen: AtomicU64::new(1),
            release_method: DEFAULT_RELEASE_METHOD.to_string(),
        };

        let remote = RemoteEnd {
            rx: request_rx,
            tx: reply_tx,
        };

        (dispatcher, remote)
    }

    /// Uses `method` instead of `"release"` for release notifications.
    pub fn with_release_method(mut self, method: impl Into<String>) -> Self {
        self.release_method = method.into();
        self
    }

    /// Number of calls still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Routes replies to their callers until the remote end hangs up.
    async fn pump(mut replies: mpsc::UnboundedReceiver<Reply>, pending: Arc<Pending>) {
        while let Some(reply) = replies.recv().await {
            // No pending request for this sequence: cancelled or very late.
            let Some((_, waiter)) = pending.remove(&reply.seq) else {
                tracing::trace!(seq = reply.seq, "dropping reply with no waiting caller");
                continue;
            };

            // Ignore if the caller went away.
            let _ = waiter.send(reply.outcome.map_err(Error::Remote));
        }

        let orphaned = pending.len();
        if orphaned > 0 {
            tracing::warn!(orphaned, "remote end closed with calls in flight");
        }
        Self::notify_all_pending(&pending, Error::Disconnected("remote end closed".into()));
    }

    fn notify_all_pending(pending: &Pending, error: Error) {
        let keys: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, waiter)) = pending.remove(&key) {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Registers a pending call and returns its sequence number and reply slot.
    fn prepare_call(&self) -> (u64, oneshot::Receiver<Result<Value>>) {
        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        (seq, rx)
    }

    async fn call(
        &self,
        target: Option<RefId>,
        method: &str,
        args: Vec<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<Value> {
        if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(Error::Cancelled);
        }

        let (seq, rx) = self.prepare_call();
        let _guard = PendingGuard {
            pending: &self.pending,
            seq,
        };
        let request = Request {
            seq,
            target,
            method: method.to_string(),
            args,
        };

        if self.tx.send(request).is_err() {
            return Err(Error::Disconnected("remote end closed".into()));
        }

        let Some(cancel) = cancel else {
            return Self::await_reply(rx).await;
        };

        tokio::select! {
            reply = Self::await_reply(rx) => reply,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn await_reply(rx: oneshot::Receiver<Result<Value>>) -> Result<Value> {
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected("reply channel closed".into())),
        }
    }
}

#[async_trait::async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn invoke(
        &self,
        id: RefId,
        method: &str,
        args: Vec<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<Value> {
        self.call(Some(id), method, args, cancel).await
    }

    async fn invoke_void(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.call(None, method, args, None).await.map(|_| ())
    }

    fn release_method(&self) -> &str {
        &self.release_method
    }
}

impl RemoteEnd {
    /// Waits for the next request. `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Request> {
        self.rx.recv().await
    }

    /// Answers the request with sequence number `seq`.
    pub fn reply(&self, seq: u64, outcome: Outcome) -> Result<()> {
        self.tx
            .send(Reply { seq, outcome })
            .map_err(|_| Error::Disconnected("dispatcher closed".into()))
    }

    /// Answers every request with `handler` until the dispatcher is gone.
    pub async fn serve<F>(mut self, mut handler: F)
    where
        F: FnMut(&Request) -> Outcome + Send,
    {
        while let Some(request) = self.recv().await {
            let outcome = handler(&request);
            if self.reply(request.seq, outcome).is_err() {
                break;
            }
        }
    }
}
