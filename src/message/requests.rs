//! Request body encoders, one per kind.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use super::layout::{Framing, LEGACY_FEATURE_WIDTH, LEGACY_SIGNATURE_WIDTH};
use super::{Context, Request, BODY_HEADER_LEN};
use crate::checksum::CHECKED_PREFIX_LEN;

// Greeting field widths, each followed by a terminating NUL.
const USER_WIDTH: usize = 20;
const HOST_WIDTH: usize = 32;
const VENDOR_WIDTH: usize = 10;
const TTY_WIDTH: usize = 32;
const OPTION_WIDTH: usize = 12;
const PID_WIDTH: usize = 10;
const ARCH_WIDTH: usize = 12;
/// Constant flag byte in the greeting's option field.
const GREETING_OPTION: u8 = 0x84;
/// Constant greeting trailer.
const GREETING_TAIL: &[u8] = b"78\x0014\x00";

/// Prefix of every manager command.
const COMMAND_PREFIX: [u8; 2] = [0x01, 0x04];
const FEATURES_DATA: &[u8] = b"1\x000\x00";
const LICENSE_SETS_DATA: &[u8] = &[0x01, 0x00, 0x00, 0x00, 0x00];
const STATUS_TRAILER: &[u8] = &[0x00, 0x00, 0x00, 0x00, 0x01];
/// Signature characters sent in a status request.
const STATUS_SIGNATURE_LEN: usize = 20;

const LEGACY_FEATURES_DATA: &[u8] = b"l1";
const LEGACY_STATUS_TRAILER: u8 = b'1';

/// Current time as the protocol's 32-bit unix timestamp.
pub fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn truncated(value: &str, width: usize) -> &[u8] {
    let bytes = value.as_bytes();
    &bytes[..bytes.len().min(width)]
}

/// NUL-pad to `width`, then terminate.
fn put_padded(buf: &mut BytesMut, value: &[u8], width: usize) {
    let value = &value[..value.len().min(width)];
    buf.put_slice(value);
    buf.put_bytes(0, width - value.len() + 1);
}

/// NUL-pad to exactly `width`; a value that fills the slot has no terminator.
fn put_slot(buf: &mut BytesMut, value: &[u8], width: usize) {
    let value = &value[..value.len().min(width)];
    buf.put_slice(value);
    buf.put_bytes(0, width - value.len());
}

fn put_terminated(buf: &mut BytesMut, value: &[u8]) {
    buf.put_slice(value);
    buf.put_u8(0);
}

fn checked_body(message_type: u16, timestamp: u32, data: &[u8]) -> BytesMut {
    let total = CHECKED_PREFIX_LEN + BODY_HEADER_LEN + data.len();
    let mut buf = BytesMut::with_capacity(total - CHECKED_PREFIX_LEN);
    buf.put_u16(u16::try_from(total).unwrap_or(u16::MAX));
    buf.put_u16(message_type);
    buf.put_u32(timestamp);
    buf.put_bytes(0, BODY_HEADER_LEN - 8);
    buf.put_slice(data);
    buf
}

/// Wrap `data` in the checked-body header for `request`'s message type.
fn checked(request: &Request, ctx: &Context<'_>, data: &[u8]) -> BytesMut {
    match request.kind().framing() {
        Framing::Checked(message_type) => checked_body(message_type, ctx.timestamp, data),
        _ => BytesMut::from(data),
    }
}

fn greeting_body(ctx: &Context<'_>, vendor: &str) -> BytesMut {
    let id = ctx.identity;
    let mut buf = BytesMut::with_capacity(143);
    put_padded(&mut buf, id.user.as_bytes(), USER_WIDTH);
    put_padded(&mut buf, id.host.as_bytes(), HOST_WIDTH);
    put_padded(&mut buf, vendor.as_bytes(), VENDOR_WIDTH);
    put_padded(&mut buf, id.tty.as_bytes(), TTY_WIDTH);
    put_padded(&mut buf, &[GREETING_OPTION], OPTION_WIDTH);
    put_padded(&mut buf, id.pid.as_bytes(), PID_WIDTH);
    put_padded(&mut buf, id.arch.as_bytes(), ARCH_WIDTH);
    buf.put_u8(ctx.client_version.major);
    buf.put_u8(ctx.client_version.minor);
    buf.put_slice(GREETING_TAIL);
    buf
}

fn command_data(ctx: &Context<'_>, command: &str) -> BytesMut {
    let id = ctx.identity;
    let mut data = BytesMut::new();
    data.put_slice(&COMMAND_PREFIX);
    for field in [id.user.as_str(), id.host.as_str(), ctx.daemon, id.tty.as_str(), command] {
        put_terminated(&mut data, field.as_bytes());
    }
    data
}

fn status_data(feature: &str, signature: &str) -> BytesMut {
    let mut data = BytesMut::new();
    put_terminated(&mut data, feature.as_bytes());
    data.put_slice(truncated(signature, STATUS_SIGNATURE_LEN));
    data.put_slice(STATUS_TRAILER);
    data
}

fn legacy_status_payload(feature: &str, signature: &str) -> BytesMut {
    let mut payload = BytesMut::new();
    put_slot(&mut payload, feature.as_bytes(), LEGACY_FEATURE_WIDTH);
    put_slot(&mut payload, signature.as_bytes(), LEGACY_SIGNATURE_WIDTH);
    payload.put_u8(LEGACY_STATUS_TRAILER);
    payload
}

/// Render the body of `request`, before framing.
///
/// Greeting fields longer than their slot are truncated so that the record
/// keeps its fixed size.
pub fn encode(request: &Request, ctx: &Context<'_>) -> Bytes {
    let body = match request {
        Request::Hello { vendor } => greeting_body(ctx, vendor.as_deref().unwrap_or("")),
        Request::LocateVendor { vendor } => greeting_body(ctx, vendor),
        Request::LicensePath => checked(request, ctx, &command_data(ctx, "getpaths")),
        Request::LicenseFile => checked(request, ctx, &command_data(ctx, "")),
        Request::VendorList => checked(request, ctx, &command_data(ctx, "dlist")),
        Request::Features => checked(request, ctx, FEATURES_DATA),
        Request::LicenseSets => checked(request, ctx, LICENSE_SETS_DATA),
        Request::LicenseStatus { feature, signature } => {
            checked(request, ctx, &status_data(feature, signature))
        }
        Request::LegacyFeatures => BytesMut::from(LEGACY_FEATURES_DATA),
        Request::LegacyLicenseStatus { feature, signature } => {
            legacy_status_payload(feature, signature)
        }
    };
    body.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::LEGACY_RECORD_LEN;
    use crate::message::layout::{TYPE_COMMAND, TYPE_LICENSE_STATUS};
    use crate::types::{ClientIdentity, ServerVersion};

    fn identity() -> ClientIdentity {
        ClientIdentity {
            user: "alice".into(),
            host: "ws01".into(),
            tty: "/dev/pts/1".into(),
            pid: "4242".into(),
            arch: "x64_lsb".into(),
            version: ServerVersion::new(11, 11),
        }
    }

    fn ctx(identity: &ClientIdentity) -> Context<'_> {
        Context {
            identity,
            daemon: "lmgrd",
            client_version: ServerVersion::new(11, 11),
            timestamp: 0x5f5e_1000,
        }
    }

    #[test]
    fn test_greeting_body_is_fixed_size() {
        let id = identity();
        let body = encode(&Request::Hello { vendor: None }, &ctx(&id));
        // with the 4 byte greeting prefix this fills one legacy-sized record
        assert_eq!(body.len() + 4, LEGACY_RECORD_LEN);
        assert_eq!(&body[..6], b"alice\0");
        assert_eq!(body[20], 0);
        assert_eq!(&body[21..25], b"ws01");
        assert_eq!(&body[body.len() - 8..], &[11, 11, b'7', b'8', 0, b'1', b'4', 0]);
    }

    #[test]
    fn test_greeting_truncates_long_fields() {
        let mut id = identity();
        id.user = "u".repeat(64);
        let body = encode(
            &Request::LocateVendor {
                vendor: "averyveryverylongvendor".into(),
            },
            &ctx(&id),
        );
        assert_eq!(body.len() + 4, LEGACY_RECORD_LEN);
        assert_eq!(&body[54..64], b"averyveryv");
        assert_eq!(body[64], 0);
    }

    #[test]
    fn test_manager_command_layout() {
        let id = identity();
        let body = encode(&Request::VendorList, &ctx(&id));
        assert_eq!(u16::from_be_bytes([body[0], body[1]]) as usize, body.len() + 4);
        assert_eq!(u16::from_be_bytes([body[2], body[3]]), TYPE_COMMAND);
        assert_eq!(&body[4..8], &0x5f5e_1000u32.to_be_bytes());
        assert!(body[8..16].iter().all(|b| *b == 0));
        assert_eq!(&body[16..], b"\x01\x04alice\0ws01\0lmgrd\0/dev/pts/1\0dlist\0");
    }

    #[test]
    fn test_status_request_truncates_signature() {
        let id = identity();
        let body = encode(
            &Request::LicenseStatus {
                feature: "solver".into(),
                signature: "0123456789ABCDEF0123456789".into(),
            },
            &ctx(&id),
        );
        assert_eq!(u16::from_be_bytes([body[2], body[3]]), TYPE_LICENSE_STATUS);
        assert_eq!(&body[16..], b"solver\x000123456789ABCDEF0123\0\0\0\0\x01");
    }

    #[test]
    fn test_legacy_status_payload() {
        let id = identity();
        let body = encode(
            &Request::LegacyLicenseStatus {
                feature: "solver".into(),
                signature: "ABC".into(),
            },
            &ctx(&id),
        );
        assert_eq!(body.len(), 31 + 21 + 1);
        assert_eq!(&body[..6], b"solver");
        assert_eq!(&body[31..34], b"ABC");
        assert_eq!(body[52], b'1');
    }

    #[test]
    fn test_legacy_status_keeps_full_width_feature() {
        let id = identity();
        let feature = "f".repeat(31);
        let body = encode(
            &Request::LegacyLicenseStatus {
                feature: feature.clone(),
                signature: "0A1B2C3D".into(),
            },
            &ctx(&id),
        );
        assert_eq!(body.len(), 31 + 21 + 1);
        assert_eq!(&body[..31], feature.as_bytes());
        assert_eq!(&body[31..39], b"0A1B2C3D");

        // longer names are cut to the slot
        let body = encode(
            &Request::LegacyLicenseStatus {
                feature: "g".repeat(40),
                signature: "S".into(),
            },
            &ctx(&id),
        );
        assert_eq!(body.len(), 31 + 21 + 1);
        assert_eq!(&body[..31], "g".repeat(31).as_bytes());
        assert_eq!(body[31], b'S');
    }
}
