//! # Dispatcher Abstraction
//!
//! The capability that actually reaches the remote side. Given an object
//! identifier, a method name and arguments, a dispatcher delivers the call
//! and resolves the reply.
//!
//! ## Philosophy
//!
//! - **Opaque**: How a call is encoded, carried and matched to its reply is
//!   the dispatcher's business. Handles never look inside.
//! - **Shared**: One dispatcher serves many handles at once, so it must be
//!   safe for concurrent use (`Arc<dyn Dispatcher>`).
//! - **Cooperative cancellation**: A cancellation token is advisory. What a
//!   cancelled call resolves to is defined by the implementation.

use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::handles::RefId;

/// Method name used for release notifications unless a dispatcher says otherwise.
pub const DEFAULT_RELEASE_METHOD: &str = "release";

/// Failures surfaced by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The remote side is unreachable or went away mid-call.
    Disconnected(String),
    /// The call was cancelled through its token before a reply arrived.
    Cancelled,
    /// The remote side received the call and reported a failure.
    Remote(String),
    /// The reply did not have the shape the caller asked for.
    Decode(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(msg) => write!(f, "Dispatcher disconnected: {}", msg),
            Self::Cancelled => write!(f, "Call cancelled"),
            Self::Remote(msg) => write!(f, "Remote failure: {}", msg),
            Self::Decode(msg) => write!(f, "Failed to decode reply: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Delivers identifier-keyed calls to the remote side.
///
/// This trait is designed to be object-safe (`Arc<dyn Dispatcher>`).
#[async_trait::async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Calls `method` on the remote object `id` and waits for its reply.
    ///
    /// # invariants
    /// - Must pass `id` through untouched.
    /// - If `cancel` fires first, must resolve according to the
    ///   implementation's cancellation contract (usually `Error::Cancelled`).
    async fn invoke(
        &self,
        id: RefId,
        method: &str,
        args: Vec<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<Value>;

    /// Sends a call that is not addressed to any object and has no result.
    ///
    /// Completes once the remote side acknowledged it.
    async fn invoke_void(&self, method: &str, args: Vec<Value>) -> Result<()>;

    /// The method the remote side recognizes as "this reference is no longer used".
    fn release_method(&self) -> &str {
        DEFAULT_RELEASE_METHOD
    }
}

impl dyn Dispatcher {
    /// Like [`Dispatcher::invoke`], decoding the reply into `T`.
    pub async fn invoke_typed<T: DeserializeOwned>(
        &self,
        id: RefId,
        method: &str,
        args: Vec<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<T> {
        let reply = self.invoke(id, method, args, cancel).await?;
        serde_json::from_value(reply).map_err(|e| Error::Decode(e.to_string()))
    }
}
