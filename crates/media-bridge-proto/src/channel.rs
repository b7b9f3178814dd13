//! Contracts between a session facade and whatever carries its calls.
//!
//! The socket transport in `session-client` implements these; tests use
//! in-memory fakes.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::messages::{Event, EventKind, Request, Response};

/// Callback invoked for every event of the subscribed kind.
///
/// Runs on the transport's reader thread, so it must not block.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Opaque handle returned by [`RemoteChannel::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionTag(pub u64);

#[derive(Debug, Error)]
pub enum CallError {
    #[error("channel disconnected")]
    Disconnected,
    /// The server executed the call and reported a failure.
    #[error("{0}")]
    Remote(String),
    #[error("unexpected response to {op}: {response:?}")]
    UnexpectedResponse { op: &'static str, response: Response },
    #[error("subscription to {0:?} rejected")]
    SubscribeRejected(EventKind),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A connected, remote-callable channel.
pub trait RemoteChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Blocking call; returns once the peer replied or the channel died.
    fn call(&self, request: Request) -> Result<Response, CallError>;

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Result<SubscriptionTag, CallError>;

    /// Returns `false` if the tag was unknown.
    fn unsubscribe(&self, tag: SubscriptionTag) -> bool;
}

/// Owner of the underlying connection.
pub trait TransportClient: Send + Sync {
    /// Current channel, if one exists. It may already be disconnected.
    fn channel(&self) -> Option<Arc<dyn RemoteChannel>>;

    /// Drop the current connection and establish a new one.
    fn reconnect(&self) -> bool;
}
