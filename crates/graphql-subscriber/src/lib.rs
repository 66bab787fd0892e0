//! GraphQL subscription client over a persistent WebSocket connection.
//!
//! Implements the client side of the Apollo `subscriptions-transport-ws`
//! protocol (`graphql-ws` subprotocol): any number of independent
//! long-lived operations multiplexed over one connection, with inbound
//! frames demultiplexed to per-subscription handlers.
//!
//! # Features
//! - Connection handshake with optional params (auth tokens)
//! - Automatic reconnect with bounded retry and full subscription replay
//! - Per-subscription handler tasks — a slow handler never stalls the pump
//! - Caller-supplied error policy deciding recoverable vs. fatal
//! - Pluggable transport, so tests run against fake channels
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), graphql_subscriber::Error> {
//! use graphql_subscriber::{SubscriptionClient, Variables};
//!
//! let client = SubscriptionClient::new("wss://example.com/graphql");
//!
//! let id = client
//!     .subscribe("subscription { tick }", Variables::new(), |msg| {
//!         Box::pin(async move {
//!             println!("event: {msg}");
//!             Ok(())
//!         })
//!     })
//!     .await?;
//!
//! client.run().await?;
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod protocol;
pub mod transport;
mod types;

pub use client::SubscriptionClient;
pub use protocol::{MessageKind, ProtocolMessage, StartPayload, Variables};
pub use transport::{
    BoxTransport, Transport, TransportConfig, TransportError, TransportFactory, TransportFuture,
    WsTransport,
};
pub use types::{
    BoxError, ConnectedCallback, DisconnectedCallback, Error, ErrorPolicy, HandlerFuture,
    SubscriptionHandler,
};
