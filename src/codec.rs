//! Reference envelope codec.
//!
//! A compact length-prefixed framing used as the default codec and by the
//! test relay:
//!
//! ```text
//! [topic_len: u16 LE][topic: utf8][type_len: u16 LE][type_name: utf8][payload...]
//! ```
//!
//! Subscription control messages use the same framing on
//! [`SUBSCRIPTIONS_TOPIC`] with payload
//! `[regex_len: u16 LE][topic_regex: utf8][action: u8]`.
//!
//! Production deployments that encode messages with a schema-compiled
//! codec implement [`EnvelopeCodec`] over that schema instead and pass it
//! to the client builder; the transport only ever touches metadata.

use crate::envelope::{EnvelopeCodec, EnvelopeMeta, SubscriptionAction, SUBSCRIPTIONS_TOPIC};
use crate::error::{RobofleetLinkError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Type name carried by subscription control envelopes.
pub const SUBSCRIPTION_TYPE_NAME: &str = "RobofleetSubscription";

const ACTION_SUBSCRIBE: u8 = 1;
const ACTION_UNSUBSCRIBE: u8 = 2;

/// The built-in length-prefixed codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedCodec;

fn read_prefixed<'a>(frame: &'a [u8], offset: usize, what: &str) -> Result<(&'a str, usize)> {
    let len_end = offset + 2;
    if frame.len() < len_end {
        return Err(RobofleetLinkError::Decode(format!(
            "Frame truncated before {} length ({} bytes)",
            what,
            frame.len()
        )));
    }
    let len = u16::from_le_bytes([frame[offset], frame[offset + 1]]) as usize;
    let end = len_end + len;
    if frame.len() < end {
        return Err(RobofleetLinkError::Decode(format!(
            "Frame truncated inside {} ({} bytes, need {})",
            what,
            frame.len(),
            end
        )));
    }
    let text = std::str::from_utf8(&frame[len_end..end])
        .map_err(|e| RobofleetLinkError::Decode(format!("Invalid utf-8 in {}: {}", what, e)))?;
    Ok((text, end))
}

fn put_prefixed(buf: &mut BytesMut, text: &str) {
    buf.put_u16_le(text.len() as u16);
    buf.put_slice(text.as_bytes());
}

impl FramedCodec {
    /// Build a complete application message envelope.
    pub fn encode_message(&self, topic: &str, type_name: &str, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + topic.len() + type_name.len() + payload.len());
        put_prefixed(&mut buf, topic);
        put_prefixed(&mut buf, type_name);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// The payload region of a frame, after the metadata header.
    pub fn payload<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        let (_, offset) = read_prefixed(frame, 0, "topic")?;
        let (_, offset) = read_prefixed(frame, offset, "type name")?;
        Ok(&frame[offset..])
    }

    /// Decode a subscription control envelope back into its pattern source
    /// string and action. Used by tooling and the test relay.
    pub fn decode_subscription(&self, frame: &Bytes) -> Result<(String, SubscriptionAction)> {
        let meta = self.decode_meta(frame)?;
        if meta.topic != SUBSCRIPTIONS_TOPIC {
            return Err(RobofleetLinkError::Decode(format!(
                "Not a subscription envelope (topic '{}')",
                meta.topic
            )));
        }
        let payload = self.payload(frame)?;
        let (topic_regex, offset) = read_prefixed(payload, 0, "topic regex")?;
        let action = match payload.get(offset) {
            Some(&ACTION_SUBSCRIBE) => SubscriptionAction::Subscribe,
            Some(&ACTION_UNSUBSCRIBE) => SubscriptionAction::Unsubscribe,
            Some(other) => {
                return Err(RobofleetLinkError::Decode(format!(
                    "Unknown subscription action {}",
                    other
                )))
            }
            None => {
                return Err(RobofleetLinkError::Decode(
                    "Subscription payload truncated before action".to_string(),
                ))
            }
        };
        Ok((topic_regex.to_string(), action))
    }
}

impl EnvelopeCodec for FramedCodec {
    fn decode_meta(&self, frame: &Bytes) -> Result<EnvelopeMeta> {
        let (topic, offset) = read_prefixed(frame, 0, "topic")?;
        let (type_name, _) = read_prefixed(frame, offset, "type name")?;
        if topic.is_empty() {
            return Err(RobofleetLinkError::Decode(
                "Envelope has an empty topic".to_string(),
            ));
        }
        Ok(EnvelopeMeta {
            topic: topic.to_string(),
            type_name: type_name.to_string(),
        })
    }

    fn encode_subscription(&self, topic_regex: &str, action: SubscriptionAction) -> Result<Bytes> {
        let mut payload = BytesMut::with_capacity(3 + topic_regex.len());
        put_prefixed(&mut payload, topic_regex);
        payload.put_u8(match action {
            SubscriptionAction::Subscribe => ACTION_SUBSCRIBE,
            SubscriptionAction::Unsubscribe => ACTION_UNSUBSCRIBE,
        });
        Ok(self.encode_message(SUBSCRIPTIONS_TOPIC, SUBSCRIPTION_TYPE_NAME, &payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_decodes_without_touching_payload() {
        let codec = FramedCodec;
        let frame = codec.encode_message("robot1/status", "amrl_msgs/RobofleetStatus", &[0xde, 0xad]);
        let meta = codec.decode_meta(&frame).unwrap();
        assert_eq!(meta.topic, "robot1/status");
        assert_eq!(meta.type_name, "amrl_msgs/RobofleetStatus");
        assert_eq!(codec.payload(&frame).unwrap(), &[0xde, 0xad]);
    }

    #[test]
    fn test_truncated_frame_is_a_decode_error() {
        let codec = FramedCodec;
        let frame = codec.encode_message("robot1/status", "T", b"xyz");
        let truncated = frame.slice(0..5);
        assert!(matches!(
            codec.decode_meta(&truncated),
            Err(RobofleetLinkError::Decode(_))
        ));
    }

    #[test]
    fn test_empty_topic_is_rejected() {
        let codec = FramedCodec;
        let frame = codec.encode_message("", "T", b"");
        assert!(codec.decode_meta(&frame).is_err());
    }

    #[test]
    fn test_subscription_envelope_round_trip() {
        let codec = FramedCodec;
        let frame = codec
            .encode_subscription("^robot1/(?P<topic>.+)$", SubscriptionAction::Subscribe)
            .unwrap();

        let meta = codec.decode_meta(&frame).unwrap();
        assert_eq!(meta.topic, SUBSCRIPTIONS_TOPIC);
        assert_eq!(meta.type_name, SUBSCRIPTION_TYPE_NAME);

        let (regex, action) = codec.decode_subscription(&frame).unwrap();
        assert_eq!(regex, "^robot1/(?P<topic>.+)$");
        assert_eq!(action, SubscriptionAction::Subscribe);
    }

    #[test]
    fn test_non_control_frame_is_not_a_subscription() {
        let codec = FramedCodec;
        let frame = codec.encode_message("robot1/status", "T", b"");
        assert!(codec.decode_subscription(&frame).is_err());
    }
}
