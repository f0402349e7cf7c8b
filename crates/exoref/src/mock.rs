//! A scripted dispatcher that records what it is asked to do.
//!
//! Intended for tests of code built on [`RemoteRef`](crate::RemoteRef):
//! script replies per method, then inspect the calls that got through.

use std::time::Duration;

use dashmap::DashMap;
use dashmap::DashSet;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::Outcome;
use crate::dispatcher::DEFAULT_RELEASE_METHOD;
use crate::dispatcher::Dispatcher;
use crate::dispatcher::Error;
use crate::dispatcher::Result;
use crate::handles::RefId;

/// One call as the dispatcher received it.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// `None` for `invoke_void`.
    pub target: Option<RefId>,
    pub method: String,
    pub args: Vec<Value>,
    pub cancellable: bool,
}

/// Dispatcher double with scripted replies and a call log.
///
/// Methods without a scripted reply resolve to `null`.
#[derive(Default)]
pub struct RecordingDispatcher {
    calls: Mutex<Vec<Call>>,
    replies: DashMap<String, Outcome>,
    hanging: DashSet<String>,
    fail_release: bool,
    latency: Option<Duration>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies to `method` with `value`.
    pub fn respond(self, method: &str, value: Value) -> Self {
        self.replies.insert(method.to_string(), Ok(value));
        self
    }

    /// Fails `method` with a remote error carrying `message`.
    pub fn fail(self, method: &str, message: &str) -> Self {
        self.replies.insert(method.to_string(), Err(message.to_string()));
        self
    }

    /// Makes `method` wait until its cancellation token fires.
    ///
    /// Without a token the call never completes.
    pub fn hang(self, method: &str) -> Self {
        self.hanging.insert(method.to_string());
        self
    }

    /// Makes release notifications fail as if the remote side were gone.
    pub fn fail_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// Delays every reply by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// All calls received so far, in arrival order.
    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    /// Calls received for `method`.
    pub async fn calls_to(&self, method: &str) -> Vec<Call> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Release notifications received so far.
    pub async fn releases(&self) -> Vec<Call> {
        self.calls_to(DEFAULT_RELEASE_METHOD).await
    }

    async fn record(&self, call: Call) {
        self.calls.lock().await.push(call);
    }

    async fn reply(&self, method: &str, cancel: Option<CancellationToken>) -> Result<Value> {
        if self.hanging.contains(method) {
            match cancel {
                Some(cancel) => cancel.cancelled().await,
                None => std::future::pending::<()>().await,
            }
            return Err(Error::Cancelled);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.replies.get(method) {
            Some(outcome) => outcome.value().clone().map_err(Error::Remote),
            None => Ok(Value::Null),
        }
    }
}

#[async_trait::async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn invoke(
        &self,
        id: RefId,
        method: &str,
        args: Vec<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<Value> {
        self.record(Call {
            target: Some(id),
            method: method.to_string(),
            args,
            cancellable: cancel.is_some(),
        })
        .await;

        self.reply(method, cancel).await
    }

    async fn invoke_void(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.record(Call {
            target: None,
            method: method.to_string(),
            args,
            cancellable: false,
        })
        .await;

        if self.fail_release && method == self.release_method() {
            return Err(Error::Disconnected("transport shut down".into()));
        }

        self.reply(method, None).await.map(|_| ())
    }
}
