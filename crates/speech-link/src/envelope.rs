//! Protocol envelopes and wire framing.
//!
//! Frames without a payload travel as WebSocket text messages holding the
//! envelope JSON. Frames with a binary payload travel as one binary message:
//! a big-endian `u32` envelope length, the envelope JSON, then the raw
//! payload bytes.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::{LinkError, Result};

/// Identifies one audio fragment in flight between the service and the
/// processor. Echoed back unchanged on the response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    pub id: String,
    pub stream_id: String,
    pub batch_number: u64,
    pub content_type: String,
    pub size: u64,
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

impl FragmentDescriptor {
    pub fn new(
        stream_id: impl Into<String>,
        batch_number: u64,
        content_type: impl Into<String>,
        size: u64,
        duration: f64,
    ) -> Self {
        let stream_id = stream_id.into();
        Self {
            id: fragment_id(&stream_id, batch_number),
            stream_id,
            batch_number,
            content_type: content_type.into(),
            size,
            duration,
            timestamp: Utc::now(),
        }
    }
}

/// Canonical fragment id: `{stream_id}_batch-{N}`.
pub fn fragment_id(stream_id: &str, batch_number: u64) -> String {
    format!("{stream_id}_batch-{batch_number}")
}

/// Parse a fragment id back into its batch number.
pub fn batch_number_of(fragment_id: &str) -> Option<u64> {
    fragment_id.rsplit_once("_batch-")?.1.parse().ok()
}

/// JSON envelope shared by both directions of the protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "subscribe")]
    Subscribe { stream_id: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { stream_id: String },

    #[serde(rename = "subscribed")]
    Subscribed { stream_id: String },

    #[serde(rename = "fragment:ack")]
    FragmentAck { fragment_id: String },

    /// A processing request; the audio fragment rides as the binary payload.
    #[serde(rename = "fragment:data")]
    FragmentData { fragment: FragmentDescriptor },

    /// A processing result; the substituted audio rides as the binary payload.
    #[serde(rename = "fragment:processed")]
    FragmentProcessed {
        fragment: FragmentDescriptor,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },

    #[serde(rename = "fragment:error")]
    FragmentError {
        fragment_id: String,
        message: String,
    },

    #[serde(rename = "stream:complete")]
    StreamComplete { stream_id: String },

    #[serde(rename = "error")]
    Error { message: String },
}

/// One decoded protocol frame: envelope plus optional binary payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub envelope: Envelope,
    pub payload: Option<Bytes>,
}

impl Frame {
    pub fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            payload: None,
        }
    }

    pub fn with_payload(envelope: Envelope, payload: Bytes) -> Self {
        Self {
            envelope,
            payload: Some(payload),
        }
    }

    /// Encode into a WebSocket message.
    pub fn encode(&self) -> Result<Message> {
        match &self.payload {
            None => Ok(Message::text(serde_json::to_string(&self.envelope)?)),
            Some(payload) => {
                let json = serde_json::to_vec(&self.envelope)?;
                let mut buf = BytesMut::with_capacity(4 + json.len() + payload.len());
                buf.put_u32(json.len() as u32);
                buf.put_slice(&json);
                buf.put_slice(payload);
                Ok(Message::binary(buf.freeze()))
            }
        }
    }

    /// Decode a WebSocket message into a frame.
    ///
    /// Returns `None` for control messages (ping/pong/close). Binary payloads
    /// above `max_payload` are rejected.
    pub fn decode(message: Message, max_payload: usize) -> Result<Option<Frame>> {
        match message {
            Message::Text(text) => {
                let envelope = serde_json::from_str(text.as_str())?;
                Ok(Some(Frame::new(envelope)))
            }
            Message::Binary(data) => {
                if data.len() < 4 {
                    return Err(LinkError::MalformedFrame(format!(
                        "Binary frame of {} bytes is too short for a header",
                        data.len()
                    )));
                }
                let json_len =
                    u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
                let Some(payload_start) = json_len.checked_add(4) else {
                    return Err(LinkError::MalformedFrame(
                        "Envelope length overflows".to_string(),
                    ));
                };
                if payload_start > data.len() {
                    return Err(LinkError::MalformedFrame(format!(
                        "Envelope length {json_len} exceeds frame size {}",
                        data.len()
                    )));
                }
                let payload_len = data.len() - payload_start;
                if payload_len > max_payload {
                    return Err(LinkError::PayloadTooLarge {
                        size: payload_len,
                        limit: max_payload,
                    });
                }
                let envelope = serde_json::from_slice(&data[4..payload_start])?;
                let payload = Bytes::copy_from_slice(&data[payload_start..]);
                Ok(Some(Frame::with_payload(envelope, payload)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 10 * 1024 * 1024;

    #[test]
    fn fragment_id_round_trip() {
        let id = fragment_id("stream-a", 7);
        assert_eq!(id, "stream-a_batch-7");
        assert_eq!(batch_number_of(&id), Some(7));
        assert_eq!(batch_number_of("garbage"), None);
    }

    #[test]
    fn text_frame_round_trip() {
        let frame = Frame::new(Envelope::Subscribe {
            stream_id: "s1".to_string(),
        });
        let message = frame.encode().unwrap();
        assert!(message.is_text());

        let decoded = Frame::decode(message, MAX).unwrap().unwrap();
        assert!(decoded.payload.is_none());
        match decoded.envelope {
            Envelope::Subscribe { stream_id } => assert_eq!(stream_id, "s1"),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn binary_frame_round_trip() {
        let descriptor = FragmentDescriptor::new("s1", 3, "audio/mp4", 4, 6.0);
        let frame = Frame::with_payload(
            Envelope::FragmentData {
                fragment: descriptor.clone(),
            },
            Bytes::from_static(b"mp4a"),
        );
        let message = frame.encode().unwrap();
        assert!(message.is_binary());

        let decoded = Frame::decode(message, MAX).unwrap().unwrap();
        assert_eq!(decoded.payload.as_deref(), Some(b"mp4a".as_slice()));
        match decoded.envelope {
            Envelope::FragmentData { fragment } => assert_eq!(fragment, descriptor),
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn envelope_tag_names_match_protocol() {
        let json = serde_json::to_string(&Envelope::FragmentAck {
            fragment_id: "s1_batch-0".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"fragment:ack""#));

        let json = serde_json::to_string(&Envelope::StreamComplete {
            stream_id: "s1".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"stream:complete""#));
    }

    #[test]
    fn oversized_payload_rejected() {
        let frame = Frame::with_payload(
            Envelope::FragmentData {
                fragment: FragmentDescriptor::new("s1", 0, "audio/mp4", 8, 1.0),
            },
            Bytes::from(vec![0u8; 64]),
        );
        let message = frame.encode().unwrap();
        let err = Frame::decode(message, 16).unwrap_err();
        assert!(matches!(err, LinkError::PayloadTooLarge { size: 64, .. }));
    }

    #[test]
    fn truncated_binary_frame_rejected() {
        let message = Message::binary(Bytes::from_static(&[0, 0, 0, 99, b'{']));
        assert!(Frame::decode(message, MAX).is_err());

        let message = Message::binary(Bytes::from_static(&[0, 0]));
        assert!(Frame::decode(message, MAX).is_err());
    }
}
