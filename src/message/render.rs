//! Server-side rendering of replies.
//!
//! The client never sends these. They exist so that the mock daemon in
//! [`crate::tcp::server`] and the tests can produce byte-exact replies for
//! every layout the decoders accept.

use bytes::{BufMut, Bytes, BytesMut};

use super::layout::{
    reply_header_len, LEGACY_RECORD_MARKER, LEGACY_TEXT_MARKER, TYPE_GREETING_REPLY,
    TYPE_LICENSE_SETS_REPLY, TYPE_REDIRECT_REPLY, TYPE_STATUS_REPLY, TYPE_TEXT_REPLY,
    TYPE_USAGE_REPLY,
};
use super::{
    Greeting, LicenseSet, LicenseStatus, RequestKind, Response, Usage, VendorRedirect,
    BODY_HEADER_LEN,
};
use crate::checksum::{self, CHECKED_PREFIX_LEN, LEGACY_RECORD_LEN};

/// Text bytes carried by one legacy text chunk.
pub const LEGACY_CHUNK_TEXT: usize = 134;
/// Offset of the text inside a legacy chunk.
pub const LEGACY_CHUNK_TEXT_OFFSET: usize = 13;

/// Build a checked reply frame. `tail` fills the type-specific header bytes
/// past the common 16 and is zero-padded to the type's header length.
fn checked_reply(message_type: u16, word: u32, tail: &[u8], data: &[u8]) -> Bytes {
    let header_len = reply_header_len(message_type).unwrap_or(BODY_HEADER_LEN);
    let total = CHECKED_PREFIX_LEN + header_len + data.len();

    let mut body = BytesMut::with_capacity(total);
    body.put_u16(u16::try_from(total).unwrap_or(u16::MAX));
    body.put_u16(message_type);
    body.put_u32(word);
    body.put_bytes(0, 8);
    let tail = &tail[..tail.len().min(header_len - BODY_HEADER_LEN)];
    body.put_slice(tail);
    body.put_bytes(0, header_len - BODY_HEADER_LEN - tail.len());
    body.put_slice(data);
    checksum::frame(body.freeze()).raw_bytes()
}

fn terminated<'a>(fields: impl IntoIterator<Item = &'a str>) -> BytesMut {
    let mut data = BytesMut::new();
    for field in fields {
        data.put_slice(field.as_bytes());
        data.put_u8(0);
    }
    data
}

pub fn greeting(greeting: &Greeting) -> Bytes {
    let data = terminated([greeting.hostname.as_str(), greeting.daemon.as_str()]);
    let tail = [greeting.version.major, greeting.version.minor, 0, 0];
    checked_reply(TYPE_GREETING_REPLY, greeting.token, &tail, &data)
}

pub fn redirect(redirect: &VendorRedirect, timestamp: u32) -> Bytes {
    let mut data = terminated([redirect.host.as_str()]);
    data.put_u32(u32::from(redirect.port));
    checked_reply(TYPE_REDIRECT_REPLY, timestamp, &[], &data)
}

/// Generic text reply; the text length goes in the last header bytes.
pub fn text<'a>(fields: impl IntoIterator<Item = &'a str>, timestamp: u32) -> Bytes {
    let data = terminated(fields);
    let text_len = u16::try_from(data.len()).unwrap_or(u16::MAX).to_be_bytes();
    checked_reply(TYPE_TEXT_REPLY, timestamp, &[0, 0, text_len[0], text_len[1]], &data)
}

/// License sets, separated by the binary runs real daemons put between them.
pub fn license_sets(sets: &[LicenseSet], timestamp: u32) -> Bytes {
    let mut data = BytesMut::new();
    for set in sets {
        data.put_slice(&terminated([
            set.fid.as_str(),
            set.signature.as_str(),
            set.names.as_str(),
            set.date1.as_str(),
            set.date2.as_str(),
            set.fid.as_str(),
            set.url.as_str(),
            set.license_text.as_str(),
        ]));
        data.put_slice(&[0x01, 0x07, 0x00]);
    }
    checked_reply(TYPE_LICENSE_SETS_REPLY, timestamp, &[], &data)
}

/// Status reply only; usage records are rendered separately.
pub fn license_status(status: &LicenseStatus, timestamp: u32) -> Bytes {
    let mut data = BytesMut::new();
    data.put_slice(&status.flags);
    data.put_slice(&terminated([
        status.used.to_string().as_str(),
        status.total.to_string().as_str(),
        status.timestamp.to_string().as_str(),
    ]));
    checked_reply(TYPE_STATUS_REPLY, timestamp, &[], &data)
}

pub fn usage(usage: &Usage, timestamp: u32) -> Bytes {
    let mut data = BytesMut::new();
    match usage {
        Usage::Checkout {
            user,
            host,
            display,
            version,
            since,
            handle,
        } => {
            data.put_slice(&terminated([
                user.as_str(),
                host.as_str(),
                display.as_str(),
                version.as_str(),
            ]));
            data.put_u8(0x01);
            data.put_u32(0);
            data.put_u32(*since);
            data.put_u64(*handle);
        }
        Usage::GroupReservation { group } => {
            data.put_u8(b'G');
            data.put_slice(&terminated([group.as_str(), "", "", ""]));
            data.put_u8(0x01);
            data.put_bytes(0, 16);
        }
    }
    checked_reply(TYPE_USAGE_REPLY, timestamp, &[], &data)
}

/// Chunked legacy text reply.
pub fn legacy_text(text: &str) -> Bytes {
    let text = text.as_bytes();
    let chunks = text.len().div_ceil(LEGACY_CHUNK_TEXT).max(1);
    let mut out = BytesMut::with_capacity(chunks * LEGACY_RECORD_LEN);
    for index in 0..chunks {
        let start = index * LEGACY_CHUNK_TEXT;
        let end = (start + LEGACY_CHUNK_TEXT).min(text.len());
        let remaining = (text.len() - start).to_string();

        out.put_u8(LEGACY_TEXT_MARKER);
        out.put_u8(0);
        out.put_slice(remaining.as_bytes());
        out.put_bytes(0, LEGACY_CHUNK_TEXT_OFFSET - 2 - remaining.len());
        out.put_slice(&text[start..end]);
        out.put_bytes(0, LEGACY_CHUNK_TEXT - (end - start));
    }
    out.freeze()
}

pub fn legacy_status(status: &LicenseStatus) -> Bytes {
    let mut out = BytesMut::with_capacity(LEGACY_RECORD_LEN);
    out.put_u8(LEGACY_RECORD_MARKER);
    out.put_u8(0);
    out.put_slice(&terminated([
        status.used.to_string().as_str(),
        status.total.to_string().as_str(),
        status.timestamp.to_string().as_str(),
    ]));
    out.resize(LEGACY_RECORD_LEN, 0);
    out.freeze()
}

/// Legacy usage record, sent as a chunked text reply.
pub fn legacy_usage(usage: &Usage) -> Bytes {
    let text = match usage {
        Usage::Checkout {
            user,
            host,
            display,
            version,
            since,
            handle,
        } => [
            user.as_str(),
            host.as_str(),
            display.as_str(),
            version.as_str(),
            since.to_string().as_str(),
            handle.to_string().as_str(),
        ]
        .join("\0"),
        Usage::GroupReservation { group } => format!("G{group}"),
    };
    legacy_text(&text)
}

/// Every frame a daemon sends in answer to `kind`, status replies followed
/// by their usage records.
pub fn reply(kind: RequestKind, response: &Response, timestamp: u32) -> Vec<Bytes> {
    match (kind, response) {
        (_, Response::Greeting(g)) => vec![greeting(g)],
        (_, Response::Redirect(r)) => vec![redirect(r, timestamp)],
        (_, Response::LicensePath(path)) => vec![text([path.as_str()], timestamp)],
        (_, Response::LicenseFile(file)) => vec![text([file.as_str()], timestamp)],
        (_, Response::VendorList(names)) => vec![text([names.join(" ").as_str()], timestamp)],
        (RequestKind::LegacyFeatures, Response::Features(names)) => {
            vec![legacy_text(&names.join(" "))]
        }
        (_, Response::Features(names)) => vec![text([names.join(" ").as_str()], timestamp)],
        (_, Response::LicenseSets(sets)) => vec![license_sets(sets, timestamp)],
        (RequestKind::LegacyLicenseStatus, Response::LicenseStatus(status)) => {
            let mut frames = vec![legacy_status(status)];
            frames.extend(status.usage.iter().map(legacy_usage));
            frames
        }
        (_, Response::LicenseStatus(status)) => {
            let mut frames = vec![license_status(status, timestamp)];
            frames.extend(status.usage.iter().map(|u| usage(u, timestamp)));
            frames
        }
        (RequestKind::LegacyLicenseUsage, Response::Usage(u)) => vec![legacy_usage(u)],
        (_, Response::Usage(u)) => vec![usage(u, timestamp)],
    }
}
