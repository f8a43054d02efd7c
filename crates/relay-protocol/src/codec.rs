//! Framed JSON codec.
//!
//! Frames are newline-delimited JSON envelopes. Encoding appends the frame
//! separator; decoding enforces the size cap, the protocol version, and the
//! per-kind required fields, so the rest of the daemon never sees a
//! half-valid envelope.

use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{ProtocolError, Result};
use crate::{MAX_FRAME_SIZE, PROTOCOL_VERSION};

/// Encodes an envelope into a single frame, including the trailing newline.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame exceeds
/// [`MAX_FRAME_SIZE`].
pub fn encode_frame(envelope: &Envelope) -> Result<String> {
    let mut frame = serde_json::to_string(envelope)?;
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    frame.push('\n');
    Ok(frame)
}

/// Decodes one frame into a validated envelope.
///
/// # Errors
///
/// Returns an error for oversized frames, invalid JSON, version mismatches,
/// or missing required fields.
pub fn decode_frame(frame: &str) -> Result<Envelope> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let envelope: Envelope = serde_json::from_str(frame.trim_end())
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    validate(&envelope)?;
    Ok(envelope)
}

/// Validates protocol version and kind-specific required fields.
///
/// # Errors
///
/// Returns an error describing the first violated requirement.
pub fn validate(envelope: &Envelope) -> Result<()> {
    if envelope.v != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            got: envelope.v,
            want: PROTOCOL_VERSION,
        });
    }

    match envelope.kind {
        EnvelopeKind::Hello => {
            let hello = envelope.hello_payload()?;
            if hello.agent_name.trim().is_empty() {
                return Err(ProtocolError::Malformed("HELLO without agentName".into()));
            }
        }
        EnvelopeKind::HelloAck => {
            envelope.payload_as::<crate::HelloAckPayload>()?;
        }
        EnvelopeKind::Send => {
            if envelope.to.as_deref().unwrap_or("").is_empty() {
                return Err(ProtocolError::Malformed("SEND without to".into()));
            }
            envelope.send_payload()?;
        }
        EnvelopeKind::Deliver => {
            envelope.delivery_info()?;
        }
        EnvelopeKind::Ack => {
            envelope.ack_payload()?;
        }
        EnvelopeKind::Subscribe | EnvelopeKind::Unsubscribe => {
            if envelope.topic.as_deref().unwrap_or("").is_empty() {
                return Err(ProtocolError::Malformed(format!(
                    "{} without topic",
                    envelope.kind
                )));
            }
        }
        EnvelopeKind::ChannelJoin | EnvelopeKind::ChannelLeave | EnvelopeKind::ChannelMessage => {
            let payload = envelope.channel_payload()?;
            if payload.channel.trim().is_empty() {
                return Err(ProtocolError::Malformed(format!(
                    "{} without channel",
                    envelope.kind
                )));
            }
            if envelope.kind == EnvelopeKind::ChannelMessage && payload.body.is_none() {
                return Err(ProtocolError::Malformed(
                    "CHANNEL_MESSAGE without body".into(),
                ));
            }
        }
        EnvelopeKind::Ping | EnvelopeKind::Pong => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{HelloPayload, SendPayload};

    #[test]
    fn frame_roundtrip() {
        let env = Envelope::send("alice", "bob", None, &SendPayload::message("hi")).unwrap();
        let frame = encode_frame(&env).unwrap();
        assert!(frame.ends_with('\n'));

        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.id, env.id);
        assert_eq!(decoded.kind, EnvelopeKind::Send);
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut env = Envelope::ping();
        env.v = 99;
        let frame = serde_json::to_string(&env).unwrap();
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::VersionMismatch { got: 99, .. })
        ));
    }

    #[test]
    fn rejects_send_without_target() {
        let frame = format!(
            r#"{{"v":1,"type":"SEND","id":"{}","ts":0,"payload":{{"body":"hi"}}}}"#,
            uuid::Uuid::new_v4()
        );
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_hello_without_name() {
        let env = Envelope::hello(&HelloPayload::new("  ")).unwrap();
        let frame = serde_json::to_string(&env).unwrap();
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            decode_frame("not json at all"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_channel_message_without_body() {
        let frame = format!(
            r##"{{"v":1,"type":"CHANNEL_MESSAGE","id":"{}","ts":0,"from":"a","payload":{{"channel":"#general"}}}}"##,
            uuid::Uuid::new_v4()
        );
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let frame = format!(
            r#"{{"v":1,"type":"NOT_A_KIND","id":"{}","ts":0}}"#,
            uuid::Uuid::new_v4()
        );
        assert!(matches!(
            decode_frame(&frame),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
