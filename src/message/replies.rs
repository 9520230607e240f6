//! Reply decoders, referenced from the layout table.

use byteorder::{BigEndian, ByteOrder};

use super::{Greeting, LicenseSet, LicenseStatus, ReplyView, Response, Usage, VendorRedirect};
use crate::error::DecodeError;
use crate::types::ServerVersion;

/// Fields per license set in a license-set reply.
const LICENSE_SET_FIELDS: usize = 8;
/// Binary segment of a usage reply: 4 unknown bytes, timestamp, handle.
const USAGE_BINARY_LEN: usize = 16;
const USAGE_SEPARATOR: u8 = 0x01;

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// NUL-separated text, empty fields dropped.
pub(crate) fn text_fields(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == 0)
        .filter(|field| !field.is_empty())
        .map(lossy)
        .collect()
}

fn parse_count(view: &ReplyView<'_>, field: &'static str, text: &str) -> Result<u32, DecodeError> {
    let text = text.trim();
    match text.parse::<i64>() {
        Ok(value) => u32::try_from(value).map_err(|_| DecodeError::range(view.kind, field, value)),
        Err(_) => Err(DecodeError::format(
            view.kind,
            format!("`{field}` is not a number: {text:?}"),
        )),
    }
}

fn counts(view: &ReplyView<'_>, fields: &[String]) -> Result<(u32, u32, u32), DecodeError> {
    match fields {
        [used, total, timestamp, ..] => Ok((
            parse_count(view, "used", used)?,
            parse_count(view, "total", total)?,
            parse_count(view, "timestamp", timestamp)?,
        )),
        _ => Err(DecodeError::format(
            view.kind,
            format!("expected used/total/timestamp, got {} fields", fields.len()),
        )),
    }
}

pub(super) fn greeting(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    let body = view.body;
    let fields = text_fields(view.data);
    let [hostname, daemon, ..] = fields.as_slice() else {
        return Err(DecodeError::format(view.kind, "missing hostname or daemon name"));
    };
    Ok(Response::Greeting(Greeting {
        hostname: hostname.clone(),
        daemon: daemon.clone(),
        version: ServerVersion::new(body[16], body[17]),
        token: BigEndian::read_u32(&body[4..8]),
    }))
}

pub(super) fn redirect(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    let data = view.data;
    let end = data
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| DecodeError::format(view.kind, "hostname is not NUL-terminated"))?;
    if end == 0 {
        return Err(DecodeError::format(view.kind, "empty vendor hostname"));
    }
    let rest = &data[end + 1..];
    if rest.len() < 4 {
        return Err(DecodeError::format(
            view.kind,
            format!("port needs 4 bytes, {} left", rest.len()),
        ));
    }
    let port = BigEndian::read_u32(&rest[..4]);
    let port = match u16::try_from(port) {
        Ok(port) if port != 0 => port,
        _ => return Err(DecodeError::range(view.kind, "port", port)),
    };
    Ok(Response::Redirect(VendorRedirect {
        host: lossy(&data[..end]),
        port,
    }))
}

pub(super) fn license_path(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    text_fields(view.data)
        .into_iter()
        .next()
        .map(Response::LicensePath)
        .ok_or_else(|| DecodeError::format(view.kind, "empty license path"))
}

pub(super) fn license_file(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    let text = text_fields(view.data).into_iter().next().unwrap_or_default();
    Ok(Response::LicenseFile(text))
}

fn first_field_words(view: &ReplyView<'_>) -> Vec<String> {
    text_fields(view.data)
        .first()
        .map(|field| field.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

pub(super) fn vendor_list(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    Ok(Response::VendorList(first_field_words(view)))
}

pub(super) fn features(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    Ok(Response::Features(first_field_words(view)))
}

pub(super) fn license_sets(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    let fields: Vec<String> = view
        .data
        .split(|b| *b == 0)
        .map(|field| {
            lossy(field)
                .trim_matches(|c: char| c == '\u{1}' || c == '\u{7}')
                .to_string()
        })
        .filter(|field| !field.trim().is_empty())
        .collect();

    if fields.len() % LICENSE_SET_FIELDS != 0 {
        return Err(DecodeError::format(
            view.kind,
            format!(
                "{} fields is not a multiple of {LICENSE_SET_FIELDS}",
                fields.len()
            ),
        ));
    }

    // fid, signature, names, date1, date2, fid again, url, license text
    let sets = fields
        .chunks_exact(LICENSE_SET_FIELDS)
        .map(|c| LicenseSet {
            fid: c[0].clone(),
            signature: c[1].clone(),
            names: c[2].clone(),
            date1: c[3].clone(),
            date2: c[4].clone(),
            url: c[6].clone(),
            license_text: c[7].clone(),
        })
        .collect();
    Ok(Response::LicenseSets(sets))
}

pub(super) fn license_status(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    let data = view.data;
    if data.len() < 2 {
        return Err(DecodeError::format(view.kind, "missing status flags"));
    }
    let (used, total, timestamp) = counts(view, &text_fields(&data[2..]))?;
    Ok(Response::LicenseStatus(LicenseStatus {
        flags: [data[0], data[1]],
        used,
        total,
        timestamp,
        usage: Vec::new(),
    }))
}

pub(super) fn legacy_license_status(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    let (used, total, timestamp) = counts(view, &text_fields(view.data))?;
    Ok(Response::LicenseStatus(LicenseStatus {
        flags: [0, 0],
        used,
        total,
        timestamp,
        usage: Vec::new(),
    }))
}

/// Legacy usage record: NUL-separated user, host, display, version, checkout
/// time and handle, or a lone `G<group>` field for a group reservation.
pub(super) fn legacy_usage(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    let fields = text_fields(view.data);
    match fields.as_slice() {
        [name] if name.starts_with('G') => Ok(Response::Usage(Usage::GroupReservation {
            group: name[1..].to_string(),
        })),
        [user, host, display, version, rest @ ..] => {
            let since = match rest.first() {
                Some(since) => parse_count(view, "since", since)?,
                None => 0,
            };
            let handle = match rest.get(1) {
                Some(handle) => handle.trim().parse::<u64>().map_err(|_| {
                    DecodeError::format(view.kind, format!("`handle` is not a number: {handle:?}"))
                })?,
                None => 0,
            };
            Ok(Response::Usage(Usage::Checkout {
                user: user.clone(),
                host: host.clone(),
                display: display.clone(),
                version: version.clone(),
                since,
                handle,
            }))
        }
        _ => Err(DecodeError::format(
            view.kind,
            format!("expected user/host/display/version, got {} fields", fields.len()),
        )),
    }
}

pub(super) fn usage(view: &ReplyView<'_>) -> Result<Response, DecodeError> {
    let data = view.data;
    let split = data
        .iter()
        .position(|b| *b == USAGE_SEPARATOR)
        .ok_or_else(|| DecodeError::format(view.kind, "missing binary segment"))?;
    let text: Vec<String> = data[..split].split(|b| *b == 0).map(lossy).collect();
    let binary = &data[split + 1..];

    let name = text.first().map(String::as_str).unwrap_or("");
    if binary.iter().all(|b| *b == 0) {
        if let Some(group) = name.strip_prefix('G') {
            return Ok(Response::Usage(Usage::GroupReservation {
                group: group.to_string(),
            }));
        }
    }

    let [user, host, display, version, ..] = text.as_slice() else {
        return Err(DecodeError::format(
            view.kind,
            format!("expected user/host/display/version, got {} fields", text.len()),
        ));
    };
    if binary.len() < USAGE_BINARY_LEN {
        return Err(DecodeError::format(
            view.kind,
            format!("binary segment is {} bytes, need {USAGE_BINARY_LEN}", binary.len()),
        ));
    }
    Ok(Response::Usage(Usage::Checkout {
        user: user.clone(),
        host: host.clone(),
        display: display.clone(),
        version: version.clone(),
        since: BigEndian::read_u32(&binary[4..8]),
        handle: BigEndian::read_u64(&binary[8..16]),
    }))
}
