//! Checksum layer.
//!
//! Every checked frame on the wire looks like this:
//!
//! ```text
//! [0x2f][check byte][CRC-14, 2 bytes BE][body ...]
//! ```
//!
//! The CRC covers the whole body. The check byte is the modular sum of the
//! marker, both CRC bytes and the first [`SUM_SPAN`] body bytes, which is the
//! fixed-size message header.
//!
//! Greeting (hello) requests and requests to pre-11.10 vendor daemons use
//! simpler sum-only framings, also built here.

use bytes::{BufMut, Bytes, BytesMut};
use crc_any::CRCu16;

use crate::error::ChecksumError;

/// CRC register width in bits.
pub const CRC_WIDTH: u8 = 14;
/// CRC polynomial, normal (MSB-first) form.
pub const CRC_POLY: u16 = 0x2e97;
/// The same polynomial bit-reversed over [`CRC_WIDTH`] bits.
/// `crc-any` takes the reversed form for reflected models.
pub const CRC_POLY_REFLECTED: u16 = reflect(CRC_POLY, CRC_WIDTH);
pub const CRC_INIT: u16 = 0x0000;
pub const CRC_XOR_OUT: u16 = 0x0000;
/// CRC of the ASCII string `123456789`.
pub const CRC_CHECK: u16 = 0x3076;
/// CRC bytes on the wire.
pub const CRC_LEN: usize = 2;

/// Leading byte of every checked frame.
pub const CHECKED_MARKER: u8 = 0x2f;
/// Marker, check byte and CRC.
pub const CHECKED_PREFIX_LEN: usize = 1 + 1 + CRC_LEN;
/// Number of body bytes covered by the check byte.
pub const SUM_SPAN: usize = 16;

/// Leading byte of a greeting request.
pub const GREETING_MARKER: u8 = 0x68;
/// Constant bytes following the greeting check byte.
pub const GREETING_TAG: [u8; 2] = [0x31, 0x33];
/// Trailing greeting body bytes left out of the check byte.
pub const GREETING_UNSUMMED_TAIL: usize = 2;

/// Size of every request and reply record in the legacy dialect.
pub const LEGACY_RECORD_LEN: usize = 147;

const fn reflect(value: u16, width: u8) -> u16 {
    let mut out = 0u16;
    let mut i = 0u8;
    while i < width {
        if (value >> i) & 1 == 1 {
            out |= 1 << (width - 1 - i);
        }
        i += 1;
    }
    out
}

/// CRC-14 over `data` with the pinned protocol parameters.
pub fn crc14(data: &[u8]) -> u16 {
    let mut crc = CRCu16::create_crc(CRC_POLY_REFLECTED, CRC_WIDTH, CRC_INIT, CRC_XOR_OUT, true);
    crc.digest(data);
    crc.get_crc()
}

fn byte_sum(seed: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(seed, |acc, b| acc.wrapping_add(*b))
}

fn check_byte(crc: u16, body: &[u8]) -> u8 {
    let covered = &body[..body.len().min(SUM_SPAN)];
    byte_sum(byte_sum(CHECKED_MARKER, &crc.to_be_bytes()), covered)
}

/// A checked frame: check byte, CRC and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    checksum: u8,
    crc: u16,
    body: Bytes,
}

impl Frame {
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Total length on the wire.
    pub fn len(&self) -> usize {
        CHECKED_PREFIX_LEN + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Wire bytes: marker, check byte, CRC, body.
    pub fn raw_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        buf.put_u8(CHECKED_MARKER);
        buf.put_u8(self.checksum);
        buf.put_u16(self.crc);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

/// Build a checked frame around `body`. Any byte sequence is frame-able.
pub fn frame(body: impl Into<Bytes>) -> Frame {
    let body = body.into();
    let crc = crc14(&body);
    Frame {
        checksum: check_byte(crc, &body),
        crc,
        body,
    }
}

/// Validate a checked frame exactly as received and return its body.
pub fn validate(raw: &[u8]) -> Result<&[u8], ChecksumError> {
    if raw.len() < CHECKED_PREFIX_LEN {
        return Err(ChecksumError::Truncated {
            len: raw.len(),
            min: CHECKED_PREFIX_LEN,
        });
    }
    if raw[0] != CHECKED_MARKER {
        return Err(ChecksumError::UnknownMarker(raw[0]));
    }

    let actual_sum = raw[1];
    let actual_crc = u16::from_be_bytes([raw[2], raw[3]]);
    let body = &raw[CHECKED_PREFIX_LEN..];

    let expected_sum = check_byte(actual_crc, body);
    if expected_sum != actual_sum {
        return Err(ChecksumError::Mismatch {
            expected: expected_sum,
            actual: actual_sum,
        });
    }

    let expected_crc = crc14(body);
    if expected_crc != actual_crc {
        return Err(ChecksumError::CrcMismatch {
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    Ok(body)
}

/// Frame a greeting body: `[0x68][sum][0x31][0x33][body]`.
pub fn greeting_frame(body: &[u8]) -> Bytes {
    let summed = &body[..body.len().saturating_sub(GREETING_UNSUMMED_TAIL)];
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u8(GREETING_MARKER);
    buf.put_u8(byte_sum(0, summed));
    buf.put_slice(&GREETING_TAG);
    buf.put_slice(body);
    buf.freeze()
}

/// Frame a legacy-dialect request: `[marker][sum][payload]` zero-padded to a
/// full record. Payload bytes beyond the record are dropped.
pub fn legacy_frame(marker: u8, payload: &[u8]) -> Bytes {
    let payload = &payload[..payload.len().min(LEGACY_RECORD_LEN - 2)];
    let mut buf = BytesMut::with_capacity(LEGACY_RECORD_LEN);
    buf.put_u8(marker);
    buf.put_u8(byte_sum(marker, payload));
    buf.put_slice(payload);
    buf.resize(LEGACY_RECORD_LEN, 0);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_body(rng: &mut StdRng) -> Vec<u8> {
        let len = rng.gen_range(0..300);
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_crc_parameters() {
        assert_eq!(CRC_POLY_REFLECTED, 0x3a5d);
        assert_eq!(crc14(b"123456789"), CRC_CHECK);
        assert_eq!(crc14(b""), 0);
        assert!(crc14(&[0xff; 64]) < (1 << CRC_WIDTH));
    }

    #[test]
    fn test_known_features_request_frame() {
        let mut body = vec![0x00, 0x18, 0x01, 0x3b];
        body.extend_from_slice(&[0u8; 12]);
        body.extend_from_slice(b"1\x000\x00");

        let frame = frame(body);
        assert_eq!(frame.crc(), 0x3b60);
        assert_eq!(frame.checksum(), 0x1e);
        assert_eq!(&frame.raw_bytes()[..4], &[0x2f, 0x1e, 0x3b, 0x60]);
        assert_eq!(frame.len(), 24);
    }

    #[test]
    fn test_round_trip_random_bodies() {
        let mut rng = StdRng::seed_from_u64(0x2e97);
        for _ in 0..500 {
            let body = random_body(&mut rng);
            let raw = frame(body.clone()).raw_bytes();
            assert_eq!(validate(&raw), Ok(&body[..]));
        }
    }

    #[test]
    fn test_single_bit_flips_in_header_detected() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let body = random_body(&mut rng);
            let raw = frame(body).raw_bytes().to_vec();
            // check byte and both CRC bytes
            for byte in 1..CHECKED_PREFIX_LEN {
                for bit in 0..8 {
                    let mut corrupted = raw.clone();
                    corrupted[byte] ^= 1 << bit;
                    assert!(validate(&corrupted).is_err(), "byte {byte} bit {bit}");
                }
            }
        }
    }

    #[test]
    fn test_body_corruption_past_sum_span_is_crc_mismatch() {
        let body: Vec<u8> = (0..64u8).collect();
        let mut raw = frame(body).raw_bytes().to_vec();
        raw[CHECKED_PREFIX_LEN + 40] ^= 0x10;
        assert!(matches!(validate(&raw), Err(ChecksumError::CrcMismatch { .. })));
    }

    #[test]
    fn test_check_byte_corruption_is_mismatch() {
        let mut raw = frame(vec![1, 2, 3]).raw_bytes().to_vec();
        raw[1] = raw[1].wrapping_add(1);
        assert!(matches!(validate(&raw), Err(ChecksumError::Mismatch { .. })));
    }

    #[test]
    fn test_truncated_input() {
        for len in 0..CHECKED_PREFIX_LEN {
            let raw = vec![CHECKED_MARKER; len];
            assert_eq!(
                validate(&raw),
                Err(ChecksumError::Truncated { len, min: CHECKED_PREFIX_LEN })
            );
        }
    }

    #[test]
    fn test_unknown_marker() {
        let mut raw = frame(vec![9; 20]).raw_bytes().to_vec();
        raw[0] = 0x4c;
        assert_eq!(validate(&raw), Err(ChecksumError::UnknownMarker(0x4c)));
    }

    #[test]
    fn test_greeting_frame_sum_skips_tail() {
        let framed = greeting_frame(&[1, 2, 3, 200, 200]);
        assert_eq!(&framed[..], &[0x68, 6, 0x31, 0x33, 1, 2, 3, 200, 200]);
    }

    #[test]
    fn test_legacy_features_record() {
        let record = legacy_frame(0x3d, b"l1");
        assert_eq!(record.len(), LEGACY_RECORD_LEN);
        assert_eq!(&record[..4], &[0x3d, 0xda, 0x6c, 0x31]);
        assert!(record[4..].iter().all(|b| *b == 0));
    }
}
