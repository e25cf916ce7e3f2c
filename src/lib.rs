//! # robofleet-link
//!
//! Client-side pub/sub transport for the Robofleet relay server.
//!
//! One multiplexed WebSocket connection carries every topic this client
//! cares about. The crate owns the connection lifecycle (automatic
//! reconnection on a fixed delay, identity-token auth frame on every
//! connect), tracks regex topic subscriptions with reference counting
//! (one subscribe wire message per pattern, re-sent after reconnect), and
//! dispatches each inbound binary envelope to all listeners whose pattern
//! matches the topic in its metadata. Payloads are opaque; the envelope
//! codec is pluggable.
//!
//! ```rust,no_run
//! use robofleet_link::{RobofleetLinkClient, TopicPattern};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = RobofleetLinkClient::builder()
//!     .server_url("ws://localhost:8080")
//!     .build()?;
//! let conn = client.connect().await?;
//!
//! let _status = conn
//!     .listen(TopicPattern::any_topic_under("robot1")?, |msg, m| {
//!         println!("{}: {} bytes", m.suffix().unwrap_or("?"), msg.bytes().len());
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod event_handlers;
mod listeners;
pub mod options;
mod subscriptions;
mod time_travel;
pub mod topics;

pub use client::{AuthOp, RobofleetLinkClient, RobofleetLinkClientBuilder};
pub use codec::FramedCodec;
pub use connection::{Connection, ConnectionState, ListenerGuard, Subscription};
pub use envelope::{EnvelopeCodec, EnvelopeMeta, RawMessage, SubscriptionAction, SUBSCRIPTIONS_TOPIC};
pub use error::{RobofleetLinkError, Result};
pub use event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
pub use listeners::ListenerId;
pub use options::ConnectionOptions;
pub use subscriptions::SubscriptionInfo;
pub use topics::{TopicMatch, TopicPattern};
