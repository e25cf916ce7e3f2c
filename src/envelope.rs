//! The message envelope contract.
//!
//! Every frame on the wire is an opaque binary envelope whose metadata
//! (topic, type name) must be readable without decoding the payload. The
//! concrete encoding is supplied by an [`EnvelopeCodec`] implementation;
//! the transport core never interprets payload bytes. A length-prefixed
//! reference codec ships in [`crate::codec`]; deployments with a
//! schema-compiled codec plug their own into the client builder.

use crate::error::Result;
use bytes::Bytes;
use std::fmt;

/// The well-known control topic carrying subscribe/unsubscribe messages.
pub const SUBSCRIPTIONS_TOPIC: &str = "/subscriptions";

/// Metadata common to every message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeMeta {
    /// Path-like message subject, e.g. `"robot1/odometry/raw"`.
    pub topic: String,
    /// Schema type name, informational only.
    pub type_name: String,
}

/// Subscription control action sent to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for SubscriptionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionAction::Subscribe => write!(f, "subscribe"),
            SubscriptionAction::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// Minimal codec contract the transport depends on.
///
/// `decode_meta` must not require decoding the full payload; the payload
/// shape is listener-specific and possibly unknown to this client.
pub trait EnvelopeCodec: Send + Sync {
    /// Read the metadata of an inbound frame.
    fn decode_meta(&self, frame: &Bytes) -> Result<EnvelopeMeta>;

    /// Build the subscription control envelope for the relay: an envelope
    /// on [`SUBSCRIPTIONS_TOPIC`] carrying the pattern source string and
    /// the action.
    fn encode_subscription(&self, topic_regex: &str, action: SubscriptionAction) -> Result<Bytes>;
}

/// An inbound frame plus its decoded metadata, as handed to listeners.
///
/// The frame bytes are immutable and cheaply cloneable; listeners that
/// keep data past the dispatch call must copy it out.
#[derive(Debug, Clone)]
pub struct RawMessage {
    frame: Bytes,
    meta: EnvelopeMeta,
}

impl RawMessage {
    pub(crate) fn new(frame: Bytes, meta: EnvelopeMeta) -> Self {
        Self { frame, meta }
    }

    /// The complete frame as received, payload included.
    pub fn bytes(&self) -> &Bytes {
        &self.frame
    }

    /// The topic embedded in the envelope metadata.
    pub fn topic(&self) -> &str {
        &self.meta.topic
    }

    /// The schema type name embedded in the envelope metadata.
    pub fn type_name(&self) -> &str {
        &self.meta.type_name
    }
}
