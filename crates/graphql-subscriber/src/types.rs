//! Public types for the graphql-subscriber crate.

use std::future::Future;
use std::pin::Pin;

use crate::protocol::ProtocolMessage;
use crate::transport::TransportError;

/// A boxed error type for handler callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A future returned by a subscription handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// Callback invoked once per inbound event addressed to a subscription.
///
/// Receives the full envelope so it can distinguish `data` frames from
/// per-operation `error` frames. A returned error is fed to the client's
/// error policy (see [`SubscriptionClient::on_error`]).
///
/// [`SubscriptionClient::on_error`]: crate::SubscriptionClient::on_error
pub type SubscriptionHandler =
    std::sync::Arc<dyn Fn(ProtocolMessage) -> HandlerFuture + Send + Sync>;

/// Callback fired when the server acknowledges the connection.
pub type ConnectedCallback = Box<dyn Fn() + Send + Sync>;

/// Callback fired when the connect retry budget is exhausted.
pub type DisconnectedCallback = Box<dyn Fn() + Send + Sync>;

/// Bottom-level error policy.
///
/// Invoked for handler-reported errors and for socket read errors that are
/// neither a closure nor a dropped stream. Returning `None` resumes the run
/// loop; returning `Some(error)` terminates it with that error.
pub type ErrorPolicy = Box<dyn Fn(Error) -> Option<Error> + Send + Sync>;

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("frame encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid endpoint URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported endpoint URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(String),

    #[error("connect retry budget exhausted")]
    RetryExhausted(#[source] Box<Error>),

    #[error("subscription handler failed: {0}")]
    Handler(BoxError),
}
