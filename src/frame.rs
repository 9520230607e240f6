//! Splitting the byte stream into frames.
//!
//! Three frame shapes arrive from a daemon, told apart by their first byte:
//!
//! | marker | shape | length |
//! |--------|-------|--------|
//! | `0x2f` | checked frame | from the body header's length field |
//! | `0x4c` | legacy text chunk | 147 bytes, repeated while text remains |
//! | `0x4e` | legacy record | 147 bytes |
//!
//! The decoders here only cut complete frames off the buffer. Checksums are
//! verified by [`into_reply`], so a corrupted frame is still consumed whole
//! and the stream stays aligned.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Bytes, BytesMut};

use crate::checksum::{
    self, CHECKED_MARKER, CHECKED_PREFIX_LEN, GREETING_MARKER, LEGACY_RECORD_LEN,
};
use crate::error::{ChecksumError, WireError};
use crate::message::layout::{LEGACY_RECORD_MARKER, LEGACY_TEXT_MARKER};
use crate::message::render::{LEGACY_CHUNK_TEXT, LEGACY_CHUNK_TEXT_OFFSET};
use crate::message::{Framing, Reply, BODY_HEADER_LEN};

/// Bytes needed before the length of a checked frame is known.
const CHECKED_LENGTH_PEEK: usize = CHECKED_PREFIX_LEN + 2;

/// Put `body` on the wire the way `framing` says. Follow-up kinds send
/// nothing.
pub fn frame_request(framing: Framing, body: &[u8]) -> Option<Bytes> {
    match framing {
        Framing::Greeting => Some(checksum::greeting_frame(body)),
        Framing::Checked(_) => Some(checksum::frame(Bytes::copy_from_slice(body)).raw_bytes()),
        Framing::Legacy(marker) => Some(checksum::legacy_frame(marker, body)),
        Framing::FollowUp => None,
    }
}

/// A complete inbound frame, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawReply {
    Checked(BytesMut),
    /// All chunks of one legacy text reply, back to back.
    LegacyText(BytesMut),
    LegacyRecord(BytesMut),
}

/// Length announced by a checked frame, once enough bytes are buffered.
fn checked_len(src: &[u8]) -> Result<Option<usize>, WireError> {
    if src.len() < CHECKED_LENGTH_PEEK {
        return Ok(None);
    }
    let len = usize::from(BigEndian::read_u16(&src[CHECKED_PREFIX_LEN..CHECKED_LENGTH_PEEK]));
    if len < CHECKED_PREFIX_LEN + BODY_HEADER_LEN {
        return Err(WireError::Malformed {
            marker: CHECKED_MARKER,
            detail: format!("length field {len} is shorter than the frame header"),
        });
    }
    Ok(Some(len))
}

/// Remaining text length announced by a legacy chunk.
fn chunk_remaining(chunk: &[u8]) -> Result<usize, WireError> {
    let field = &chunk[2..LEGACY_CHUNK_TEXT_OFFSET];
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .ok_or_else(|| WireError::Malformed {
            marker: LEGACY_TEXT_MARKER,
            detail: format!("bad remaining-length field {:?}", String::from_utf8_lossy(field)),
        })
}

/// Bytes taken by a complete legacy text reply starting at `src[0]`.
fn legacy_text_len(src: &[u8]) -> Result<Option<usize>, WireError> {
    let mut offset = 0;
    loop {
        let Some(chunk) = src.get(offset..offset + LEGACY_RECORD_LEN) else {
            return Ok(None);
        };
        if chunk[0] != LEGACY_TEXT_MARKER {
            return Err(WireError::Malformed {
                marker: LEGACY_TEXT_MARKER,
                detail: format!("continuation chunk starts with {:#04x}", chunk[0]),
            });
        }
        offset += LEGACY_RECORD_LEN;
        if chunk_remaining(chunk)? <= LEGACY_CHUNK_TEXT {
            return Ok(Some(offset));
        }
    }
}

/// Cut one complete reply off the front of `src`.
///
/// Returns `Ok(None)` and leaves `src` untouched while the frame is still
/// incomplete.
pub fn try_decode_reply(src: &mut BytesMut) -> Result<Option<RawReply>, WireError> {
    let Some(&marker) = src.first() else {
        return Ok(None);
    };
    match marker {
        CHECKED_MARKER => {
            let Some(len) = checked_len(src)? else {
                src.reserve(CHECKED_LENGTH_PEEK);
                return Ok(None);
            };
            if src.len() < len {
                src.reserve(len - src.len());
                return Ok(None);
            }
            Ok(Some(RawReply::Checked(src.split_to(len))))
        }
        LEGACY_TEXT_MARKER => match legacy_text_len(src)? {
            Some(len) => Ok(Some(RawReply::LegacyText(src.split_to(len)))),
            None => {
                src.reserve(LEGACY_RECORD_LEN);
                Ok(None)
            }
        },
        LEGACY_RECORD_MARKER => {
            if src.len() < LEGACY_RECORD_LEN {
                src.reserve(LEGACY_RECORD_LEN - src.len());
                return Ok(None);
            }
            Ok(Some(RawReply::LegacyRecord(src.split_to(LEGACY_RECORD_LEN))))
        }
        other => Err(ChecksumError::UnknownMarker(other).into()),
    }
}

/// Validate a raw reply and strip its framing.
pub fn into_reply(raw: RawReply) -> Result<Reply, ChecksumError> {
    match raw {
        RawReply::Checked(bytes) => {
            let bytes = bytes.freeze();
            checksum::validate(&bytes)?;
            Ok(Reply::Checked(bytes.slice(CHECKED_PREFIX_LEN..)))
        }
        RawReply::LegacyText(bytes) => {
            let mut text = BytesMut::new();
            for chunk in bytes.chunks(LEGACY_RECORD_LEN) {
                text.extend_from_slice(&chunk[LEGACY_CHUNK_TEXT_OFFSET..]);
            }
            Ok(Reply::LegacyText(text.freeze()))
        }
        RawReply::LegacyRecord(bytes) => Ok(Reply::LegacyRecord(bytes.freeze().slice(2..))),
    }
}

/// A request as seen by a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Greeting body, after the four byte greeting prefix.
    Greeting(Bytes),
    /// Validated body of a checked frame.
    Checked(Bytes),
    /// Legacy record payload, after marker and sum byte.
    Legacy { marker: u8, payload: Bytes },
}

/// Offset and width of the vendor field inside a greeting body.
const GREETING_VENDOR: std::ops::Range<usize> = 54..64;

impl ClientMessage {
    /// Message type of a checked request.
    pub fn message_type(&self) -> Option<u16> {
        match self {
            ClientMessage::Checked(body) if body.len() >= 4 => {
                Some(BigEndian::read_u16(&body[2..4]))
            }
            _ => None,
        }
    }

    /// Vendor named in a greeting, if any.
    pub fn greeting_vendor(&self) -> Option<String> {
        let ClientMessage::Greeting(body) = self else {
            return None;
        };
        let field = body.get(GREETING_VENDOR)?;
        let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
        (end > 0).then(|| String::from_utf8_lossy(&field[..end]).into_owned())
    }
}

/// Server-side counterpart of [`try_decode_reply`].
pub fn try_decode_request(src: &mut BytesMut) -> Result<Option<ClientMessage>, WireError> {
    let Some(&marker) = src.first() else {
        return Ok(None);
    };
    if marker == CHECKED_MARKER {
        let Some(len) = checked_len(src)? else {
            return Ok(None);
        };
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        let raw = src.split_to(len).freeze();
        checksum::validate(&raw)?;
        return Ok(Some(ClientMessage::Checked(raw.slice(CHECKED_PREFIX_LEN..))));
    }

    // greetings and legacy requests are both one full record
    if src.len() < LEGACY_RECORD_LEN {
        src.reserve(LEGACY_RECORD_LEN - src.len());
        return Ok(None);
    }
    let record = src.split_to(LEGACY_RECORD_LEN).freeze();
    if marker == GREETING_MARKER {
        Ok(Some(ClientMessage::Greeting(record.slice(4..))))
    } else {
        Ok(Some(ClientMessage::Legacy {
            marker,
            payload: record.slice(2..),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::render;

    #[test]
    fn test_partial_checked_frame_waits() {
        let raw = render::text(["hello"], 1);
        for cut in 0..raw.len() {
            let mut buf = BytesMut::from(&raw[..cut]);
            assert_eq!(try_decode_reply(&mut buf).unwrap(), None, "cut at {cut}");
            assert_eq!(buf.len(), cut);
        }
        let mut buf = BytesMut::from(&raw[..]);
        assert!(matches!(try_decode_reply(&mut buf), Ok(Some(RawReply::Checked(_)))));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&render::text(["one"], 1));
        buf.extend_from_slice(&render::text(["two"], 2));
        let first = into_reply(try_decode_reply(&mut buf).unwrap().unwrap()).unwrap();
        let second = into_reply(try_decode_reply(&mut buf).unwrap().unwrap()).unwrap();
        assert_ne!(first, second);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_short_length_field_is_malformed() {
        let mut buf = BytesMut::from(&[CHECKED_MARKER, 0, 0, 0, 0x00, 0x05][..]);
        assert!(matches!(
            try_decode_reply(&mut buf),
            Err(WireError::Malformed { marker: CHECKED_MARKER, .. })
        ));
    }

    #[test]
    fn test_corrupted_frame_is_consumed_then_rejected() {
        let mut raw = render::text(["payload"], 9).to_vec();
        let last = raw.len() - 2;
        raw[last] ^= 0xff;
        let mut buf = BytesMut::from(&raw[..]);
        let frame = try_decode_reply(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert!(matches!(into_reply(frame), Err(ChecksumError::CrcMismatch { .. })));
    }

    #[test]
    fn test_unknown_marker() {
        let mut buf = BytesMut::from(&[0x99, 1, 2, 3][..]);
        assert!(matches!(
            try_decode_reply(&mut buf),
            Err(WireError::Checksum(ChecksumError::UnknownMarker(0x99)))
        ));
    }

    #[test]
    fn test_legacy_text_waits_for_all_chunks() {
        let text = "feature ".repeat(40);
        let raw = render::legacy_text(&text);
        assert_eq!(raw.len(), 3 * LEGACY_RECORD_LEN);

        let mut buf = BytesMut::from(&raw[..2 * LEGACY_RECORD_LEN]);
        assert_eq!(try_decode_reply(&mut buf).unwrap(), None);

        let mut buf = BytesMut::from(&raw[..]);
        let Reply::LegacyText(joined) = into_reply(try_decode_reply(&mut buf).unwrap().unwrap())
            .unwrap()
        else {
            panic!("expected legacy text");
        };
        assert!(joined.starts_with(text.as_bytes()));
        assert!(joined[text.len()..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_request_greeting_vendor() {
        let mut record = vec![GREETING_MARKER, 0, 0x31, 0x33];
        let mut body = vec![0u8; 143];
        body[54..60].copy_from_slice(b"acmed\0");
        record.extend_from_slice(&body);
        let mut buf = BytesMut::from(&record[..]);
        let message = try_decode_request(&mut buf).unwrap().unwrap();
        assert_eq!(message.greeting_vendor().as_deref(), Some("acmed"));
        assert_eq!(message.message_type(), None);
    }
}
