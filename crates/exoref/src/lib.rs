//! # exoref
//!
//! Local handles for objects that live on a remote side.
//!
//! A [`RemoteRef`] carries the identifier of a remote object and forwards
//! calls to it through a shared [`Dispatcher`]. Disposing the reference sends
//! exactly one release notification; dropping it without disposing only
//! marks it disposed locally.

pub mod channel;
pub mod dispatcher;
pub mod handles;
pub mod mock;
pub mod reference;

pub use channel::ChannelDispatcher;
pub use channel::RemoteEnd;
pub use dispatcher::Dispatcher;
pub use handles::RefId;
pub use reference::RemoteRef;
