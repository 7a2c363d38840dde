use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;

use crate::control::ControlMessage;

pub const AUDIO_TAG: u8 = 0x00;
pub const CONTROL_TAG: u8 = 0x01;

/// Transport payload normalized at the boundary. The caller unwraps whatever
/// its transport delivers (binary frame, text frame, blob) into one of these
/// two shapes before handing it to [`decode`].
#[derive(Debug, Clone)]
pub enum RawMessage {
    Binary(Bytes),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Raw PCM16 bytes, mono, 16 kHz, little-endian.
    Audio(Bytes),
    Control(ControlMessage),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("control payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Decode one inbound message into a [`Frame`].
///
/// Binary input reads byte 0 as the tag: `0x00` audio, `0x01` JSON control.
/// Text input is first base64-decoded and reinterpreted through the tag
/// rules; if base64 decoding fails, the text is treated as a legacy untagged
/// all-JSON control payload.
///
/// `Ok(None)` means the message was a deliberate no-op (empty payload or an
/// unrecognized tag). A `DecodeError` is a single bad frame, never a reason
/// to tear the session down.
pub fn decode(raw: RawMessage) -> Result<Option<Frame>, DecodeError> {
    match raw {
        RawMessage::Binary(buf) => decode_tagged(buf),
        RawMessage::Text(text) => match BASE64.decode(text.as_bytes()) {
            Ok(bytes) => decode_tagged(Bytes::from(bytes)),
            Err(_) => {
                let control = serde_json::from_str(&text)?;
                Ok(Some(Frame::Control(control)))
            }
        },
    }
}

/// Encode an outbound PCM chunk for the wire.
///
/// The tag byte exists only on inbound traffic; the upstream producer
/// expects raw untagged PCM16 on outbound binary frames.
pub fn encode_audio(pcm: Bytes) -> Bytes {
    pcm
}

fn decode_tagged(buf: Bytes) -> Result<Option<Frame>, DecodeError> {
    let Some(&tag) = buf.first() else {
        tracing::debug!("empty_frame");
        return Ok(None);
    };

    let payload = buf.slice(1..);
    if payload.is_empty() && (tag == AUDIO_TAG || tag == CONTROL_TAG) {
        tracing::debug!(tag, "empty_frame_payload");
        return Ok(None);
    }

    match tag {
        AUDIO_TAG => Ok(Some(Frame::Audio(payload))),
        CONTROL_TAG => {
            let text = std::str::from_utf8(&payload)?;
            let control = serde_json::from_str(text)?;
            Ok(Some(Frame::Control(control)))
        }
        other => {
            tracing::warn!(tag = other, "unknown_frame_tag");
            Ok(None)
        }
    }
}
