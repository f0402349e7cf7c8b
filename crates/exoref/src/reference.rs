//! # Remote References
//!
//! A `RemoteRef` stands in for an object that lives on the remote side. It
//! carries the object's identifier and forwards calls through a shared
//! dispatcher; it never holds the object itself.
//!
//! ## Lifecycle
//!
//! A reference is either live or disposed, and only ever moves from the
//! first state to the second. Disposal has two halves:
//!
//! - the local half marks the reference disposed. It is synchronous and
//!   always safe, so it is also what `Drop` runs;
//! - the remote half tells the other side it may release the object. It is
//!   async, and only [`RemoteRef::dispose`] performs it.
//!
//! A reference that is dropped without `dispose` therefore never notifies the
//! remote side. The object leaks there until the remote side cleans up on its
//! own (for example when the session ends).
//!
//! ## Invariants
//!
//! - The identifier is fixed at construction.
//! - At most one release notification is sent per reference, no matter how
//!   many tasks race to dispose it.
//! - Once a call observes the reference as disposed it fails locally and the
//!   dispatcher never sees it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dispatcher;
use crate::dispatcher::Dispatcher;
use crate::handles::RefId;

/// Errors returned by calls on a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The reference was already disposed; nothing was sent.
    ///
    /// `type_name` is the short name of the handle type, e.g. `RemoteRef`.
    Disposed { type_name: &'static str },
    /// The dispatcher failed the call. Passed through as-is.
    Dispatch(dispatcher::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed { type_name } => write!(f, "Cannot access a disposed object: {}", type_name),
            Self::Dispatch(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dispatch(e) => Some(e),
            Self::Disposed { .. } => None,
        }
    }
}

impl From<dispatcher::Error> for Error {
    fn from(e: dispatcher::Error) -> Self {
        Self::Dispatch(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Local proxy for an object on the remote side.
///
/// Share it behind an `Arc` to call or dispose it from several tasks.
pub struct RemoteRef {
    id: RefId,
    disposed: AtomicBool,
    dispatcher: Arc<dyn Dispatcher>,
}

impl RemoteRef {
    /// Wraps an identifier that was already allocated on the remote side.
    pub fn new(dispatcher: Arc<dyn Dispatcher>, id: RefId) -> Self {
        Self {
            id,
            disposed: AtomicBool::new(false),
            dispatcher,
        }
    }

    /// The identifier of the remote object.
    pub fn id(&self) -> RefId {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Calls `method` on the remote object and decodes its reply.
    pub async fn invoke<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        self.ensure_live()?;
        tracing::trace!(id = %self.id, method, "forwarding call");

        Ok(self.dispatcher.invoke_typed(self.id, method, args, None).await?)
    }

    /// Like [`invoke`](Self::invoke), handing `cancel` to the dispatcher.
    ///
    /// Cancelling does not guarantee the remote call is aborted; the outcome
    /// is whatever the dispatcher resolves a cancelled call with.
    pub async fn invoke_with_cancel<T: DeserializeOwned>(
        &self,
        method: &str,
        cancel: CancellationToken,
        args: Vec<Value>,
    ) -> Result<T> {
        self.ensure_live()?;
        tracing::trace!(id = %self.id, method, "forwarding cancellable call");

        Ok(self.dispatcher.invoke_typed(self.id, method, args, Some(cancel)).await?)
    }

    /// Cancels the call once `timeout` elapses.
    ///
    /// The timer only fires the token; the call still resolves through the
    /// dispatcher, so a reply that wins the race is returned as usual.
    pub async fn invoke_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        timeout: Duration,
        args: Vec<Value>,
    ) -> Result<T> {
        self.ensure_live()?;

        let cancel = CancellationToken::new();
        let timer = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            }
        });

        let result = self.invoke_with_cancel(method, cancel, args).await;
        timer.abort();
        result
    }

    /// Calls `method` on the remote object, ignoring whatever it returns.
    pub async fn invoke_void(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.ensure_live()?;
        tracing::trace!(id = %self.id, method, "forwarding void call");

        self.dispatcher.invoke(self.id, method, args, None).await?;
        Ok(())
    }

    /// Disposes the reference and tells the remote side to release the object.
    ///
    /// Only the first caller to flip the reference to disposed sends the
    /// notification; everyone else returns straight away. A notification
    /// that cannot be delivered is logged and not retried, and disposal
    /// still succeeds.
    pub async fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let method = self.dispatcher.release_method();
        match self.dispatcher.invoke_void(method, vec![Value::from(self.id)]).await {
            Ok(()) => tracing::debug!(id = %self.id, "released remote reference"),
            Err(e) => tracing::warn!(id = %self.id, error = %e, "failed to release remote reference"),
        }
    }

    /// Marks the reference disposed without notifying the remote side.
    ///
    /// Returns whether this call did the marking. Used by `Drop`, and by
    /// owners that know the remote side is already gone.
    pub fn abandon(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Fails with [`Error::Disposed`] once the reference is disposed.
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed {
                type_name: "RemoteRef",
            });
        }
        Ok(())
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteRef")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Drop for RemoteRef {
    fn drop(&mut self) {
        if self.abandon() {
            tracing::debug!(id = %self.id, "remote reference dropped without dispose; remote object not released");
        }
    }
}
