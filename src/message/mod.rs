//! Message codec: typed requests to frame bodies, validated reply bodies to
//! typed responses.
//!
//! The set of message shapes is closed. [`RequestKind`] enumerates them and
//! [`layout::LAYOUTS`] holds one entry per kind.
//!
//! Checked-frame bodies (requests and replies alike) start with a 16 byte
//! header:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 2    | frame length, including marker, check byte and CRC (BE) |
//! | 2      | 2    | message type (BE) |
//! | 4      | 4    | unix timestamp, or a server token in greeting replies (BE) |
//! | 8      | 8    | zero in requests, type-specific in replies |

pub mod layout;
mod replies;
pub mod render;
mod requests;

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use serde::Serialize;

use crate::error::DecodeError;
use crate::types::{ClientIdentity, ServerVersion};

pub use requests::{encode, unix_timestamp};
pub use layout::{Accepts, Framing, Layout, LAYOUTS};

/// Checked-frame body header length.
pub const BODY_HEADER_LEN: usize = 16;

/// Every query shape the protocol supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Greeting that opens every session.
    Hello,
    /// Greeting naming a vendor; the manager answers with its location.
    LocateVendor,
    LicensePath,
    LicenseFile,
    VendorList,
    Features,
    LicenseSets,
    LicenseStatus,
    /// Checkout records that follow a status reply.
    LicenseUsage,
    LegacyFeatures,
    LegacyLicenseStatus,
    /// Legacy checkout records that follow a legacy status reply.
    LegacyLicenseUsage,
}

impl RequestKind {
    pub const COUNT: usize = 12;

    pub fn layout(self) -> &'static Layout {
        &LAYOUTS[self as usize]
    }

    pub fn framing(self) -> Framing {
        self.layout().framing
    }

    /// Kind of the records a daemon sends after answering this kind, one per
    /// used license.
    pub fn follow_up(self) -> Option<RequestKind> {
        match self {
            RequestKind::LicenseStatus => Some(RequestKind::LicenseUsage),
            RequestKind::LegacyLicenseStatus => Some(RequestKind::LegacyLicenseUsage),
            _ => None,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A query intent, consumed once by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Greeting. `vendor` is set when greeting a vendor daemon directly.
    Hello { vendor: Option<String> },
    /// Ask a manager where a vendor daemon listens.
    LocateVendor { vendor: String },
    /// Path of the license file, relative to the manager installation.
    LicensePath,
    /// Full license file text.
    LicenseFile,
    /// Names of the vendor daemons the manager runs.
    VendorList,
    Features,
    LicenseSets,
    /// Usage of one license, identified by feature name and signature.
    LicenseStatus { feature: String, signature: String },
    LegacyFeatures,
    LegacyLicenseStatus { feature: String, signature: String },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Hello { .. } => RequestKind::Hello,
            Request::LocateVendor { .. } => RequestKind::LocateVendor,
            Request::LicensePath => RequestKind::LicensePath,
            Request::LicenseFile => RequestKind::LicenseFile,
            Request::VendorList => RequestKind::VendorList,
            Request::Features => RequestKind::Features,
            Request::LicenseSets => RequestKind::LicenseSets,
            Request::LicenseStatus { .. } => RequestKind::LicenseStatus,
            Request::LegacyFeatures => RequestKind::LegacyFeatures,
            Request::LegacyLicenseStatus { .. } => RequestKind::LegacyLicenseStatus,
        }
    }
}

/// Values a request body needs besides the request itself.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub identity: &'a ClientIdentity,
    /// Manager daemon name learned from the greeting reply.
    pub daemon: &'a str,
    /// Version announced in greetings.
    pub client_version: ServerVersion,
    pub timestamp: u32,
}

/// Server greeting reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Greeting {
    pub hostname: String,
    pub daemon: String,
    pub version: ServerVersion,
    pub token: u32,
}

/// Where a vendor daemon listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VendorRedirect {
    pub host: String,
    pub port: u16,
}

/// A license group as reported by a vendor daemon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LicenseSet {
    pub fid: String,
    pub signature: String,
    pub names: String,
    pub date1: String,
    pub date2: String,
    pub url: String,
    /// License-file formatted text of the licenses in this set.
    pub license_text: String,
}

/// One holder of a license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Usage {
    Checkout {
        user: String,
        host: String,
        display: String,
        version: String,
        /// Checkout time, unix seconds.
        since: u32,
        handle: u64,
    },
    GroupReservation { group: String },
}

/// Usage counts for one license.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LicenseStatus {
    /// Two leading bytes of unknown meaning, kept verbatim.
    pub flags: [u8; 2],
    pub used: u32,
    pub total: u32,
    /// Server clock, unix seconds.
    pub timestamp: u32,
    pub usage: Vec<Usage>,
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Greeting(Greeting),
    Redirect(VendorRedirect),
    LicensePath(String),
    LicenseFile(String),
    VendorList(Vec<String>),
    Features(Vec<String>),
    LicenseSets(Vec<LicenseSet>),
    LicenseStatus(LicenseStatus),
    Usage(Usage),
}

/// An inbound message that passed frame validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Body of a checked frame.
    Checked(Bytes),
    /// Text collected from the chunks of a legacy text reply.
    LegacyText(Bytes),
    /// Legacy status record without its two leading bytes.
    LegacyRecord(Bytes),
}

impl Reply {
    /// Message type of a checked reply, or the marker of a legacy one.
    pub fn message_type(&self) -> u16 {
        match self {
            Reply::Checked(body) if body.len() >= 4 => BigEndian::read_u16(&body[2..4]),
            Reply::Checked(_) => 0,
            Reply::LegacyText(_) => u16::from(layout::LEGACY_TEXT_MARKER),
            Reply::LegacyRecord(_) => u16::from(layout::LEGACY_RECORD_MARKER),
        }
    }
}

/// What a decoder sees: the whole body and the data after the reply header.
#[derive(Debug, Clone, Copy)]
pub struct ReplyView<'a> {
    pub kind: RequestKind,
    pub message_type: u16,
    pub body: &'a [u8],
    pub data: &'a [u8],
}

/// Decode a validated reply as the answer to `kind`.
pub fn decode(kind: RequestKind, reply: &Reply) -> Result<Response, DecodeError> {
    let layout = kind.layout();
    let unexpected = || DecodeError::UnexpectedMessage {
        kind,
        message_type: reply.message_type(),
    };

    let view = match (layout.accepts, reply) {
        (Accepts::Checked(types), Reply::Checked(body)) => {
            if body.len() < 4 {
                return Err(DecodeError::format(
                    kind,
                    format!("{} byte body has no message type", body.len()),
                ));
            }
            let message_type = reply.message_type();
            if !types.contains(&message_type) {
                return Err(unexpected());
            }
            let header_len = layout::reply_header_len(message_type).ok_or_else(unexpected)?;
            if body.len() < header_len {
                return Err(DecodeError::format(
                    kind,
                    format!("{} byte body shorter than {header_len} byte header", body.len()),
                ));
            }
            ReplyView {
                kind,
                message_type,
                body,
                data: &body[header_len..],
            }
        }
        (Accepts::LegacyText, Reply::LegacyText(text))
        | (Accepts::LegacyRecord, Reply::LegacyRecord(text))
        | (Accepts::Legacy, Reply::LegacyText(text) | Reply::LegacyRecord(text)) => ReplyView {
            kind,
            message_type: reply.message_type(),
            body: text,
            data: text,
        },
        _ => return Err(unexpected()),
    };

    (layout.decode)(&view)
}

#[cfg(test)]
mod tests {
    use super::layout::TYPE_LICENSE_SETS_REPLY;
    use super::*;
    use crate::checksum;
    use crate::frame::{into_reply, try_decode_reply};
    use bytes::{BufMut, BytesMut};

    const STAMP: u32 = 1_700_000_000;

    /// Feed rendered frames back through the client side, follow-ups
    /// included, the way a session reads them.
    fn read_back(kind: RequestKind, frames: &[Bytes]) -> Response {
        let mut buf = BytesMut::new();
        for frame in frames {
            buf.extend_from_slice(frame);
        }
        let mut next = |kind: RequestKind| {
            let raw = try_decode_reply(&mut buf).unwrap().unwrap();
            decode(kind, &into_reply(raw).unwrap()).unwrap()
        };

        let mut response = next(kind);
        if let (Response::LicenseStatus(status), Some(follow_up)) =
            (&mut response, kind.follow_up())
        {
            for _ in 0..status.used {
                match next(follow_up) {
                    Response::Usage(usage) => status.usage.push(usage),
                    other => panic!("expected usage, got {other:?}"),
                }
            }
        }
        assert!(buf.is_empty(), "{} bytes left over for {kind}", buf.len());
        response
    }

    fn checkout(user: &str, since: u32, handle: u64) -> Usage {
        Usage::Checkout {
            user: user.into(),
            host: "h".repeat(32),
            display: "/dev/pts/17".into(),
            version: "v11.16".into(),
            since,
            handle,
        }
    }

    fn status(used: u32, total: u32, timestamp: u32, usage: Vec<Usage>) -> Response {
        Response::LicenseStatus(LicenseStatus {
            flags: [0, 0],
            used,
            total,
            timestamp,
            usage,
        })
    }

    fn set(fid: &str) -> LicenseSet {
        LicenseSet {
            fid: fid.into(),
            signature: "0123456789ABCDEF0123".into(),
            names: "solver mesher".into(),
            date1: "1-jan-2024".into(),
            date2: "31-dec-2030".into(),
            url: "http://licenses.example/acme".into(),
            license_text: "FEATURE solver acmed 2.0 31-dec-2030 5 SIGN=\"AAAA\"".into(),
        }
    }

    #[test]
    fn test_every_layout_reads_back_what_was_rendered() {
        let group = Usage::GroupReservation {
            group: "design".into(),
        };
        let cases = vec![
            (
                RequestKind::Hello,
                Response::Greeting(Greeting {
                    hostname: "h".repeat(32),
                    daemon: "v".repeat(10),
                    version: ServerVersion::new(u8::MAX, u8::MAX),
                    token: u32::MAX,
                }),
            ),
            (
                RequestKind::LocateVendor,
                Response::Redirect(VendorRedirect {
                    host: "h".repeat(32),
                    port: u16::MAX,
                }),
            ),
            (
                RequestKind::LicensePath,
                Response::LicensePath("/opt/flexlm/licenses/license.dat".into()),
            ),
            (RequestKind::LicenseFile, Response::LicenseFile(String::new())),
            (
                RequestKind::LicenseFile,
                Response::LicenseFile("SERVER a ID=1 27000\nVENDOR acmed\n".into()),
            ),
            (RequestKind::VendorList, Response::VendorList(Vec::new())),
            (
                RequestKind::VendorList,
                Response::VendorList(vec!["acmed".into(), "v".repeat(10)]),
            ),
            (RequestKind::Features, Response::Features(Vec::new())),
            (
                RequestKind::Features,
                Response::Features(vec!["solver".into(), "mesher".into()]),
            ),
            (RequestKind::LicenseSets, Response::LicenseSets(Vec::new())),
            (
                RequestKind::LicenseSets,
                Response::LicenseSets(vec![set("fid-1"), set("fid-2")]),
            ),
            (RequestKind::LicenseStatus, status(0, 0, 0, Vec::new())),
            (
                RequestKind::LicenseStatus,
                status(
                    2,
                    u32::MAX,
                    u32::MAX,
                    vec![checkout(&"u".repeat(20), u32::MAX, u64::MAX), group.clone()],
                ),
            ),
            (
                RequestKind::LicenseUsage,
                Response::Usage(checkout("alice", 0, 0)),
            ),
            (RequestKind::LicenseUsage, Response::Usage(group.clone())),
            (RequestKind::LegacyFeatures, Response::Features(Vec::new())),
            (
                RequestKind::LegacyFeatures,
                // spans several chunks
                Response::Features((0..40).map(|i| format!("feature{i}")).collect()),
            ),
            (RequestKind::LegacyLicenseStatus, status(0, 0, 0, Vec::new())),
            (
                RequestKind::LegacyLicenseStatus,
                status(
                    2,
                    u32::MAX,
                    u32::MAX,
                    vec![checkout(&"u".repeat(20), u32::MAX, u64::MAX), group.clone()],
                ),
            ),
            (
                RequestKind::LegacyLicenseUsage,
                Response::Usage(checkout("bob", 1_699_990_000, 7)),
            ),
            (RequestKind::LegacyLicenseUsage, Response::Usage(group)),
        ];

        for layout in &LAYOUTS {
            assert!(
                cases.iter().any(|(kind, _)| *kind == layout.kind),
                "no case for {}",
                layout.kind
            );
        }
        for (kind, expected) in &cases {
            let frames = render::reply(*kind, expected, STAMP);
            assert_eq!(&read_back(*kind, &frames), expected, "{kind}");
        }
    }

    #[test]
    fn test_features_in_license_set_reply() {
        let data = b"solver mesher\0\x01\x07\0";
        let total = checksum::CHECKED_PREFIX_LEN + BODY_HEADER_LEN + data.len();
        let mut body = BytesMut::new();
        body.put_u16(total as u16);
        body.put_u16(TYPE_LICENSE_SETS_REPLY);
        body.put_u32(STAMP);
        body.put_bytes(0, 8);
        body.put_slice(data);
        let frame = checksum::frame(body.freeze()).raw_bytes();

        assert_eq!(
            read_back(RequestKind::Features, &[frame]),
            Response::Features(vec!["solver".into(), "mesher".into()])
        );
    }

    #[test]
    fn test_reply_of_wrong_type_is_unexpected() {
        let frame = render::text(["/opt/license.dat"], STAMP);
        let mut buf = BytesMut::from(&frame[..]);
        let reply = into_reply(try_decode_reply(&mut buf).unwrap().unwrap()).unwrap();
        let err = decode(RequestKind::LicenseStatus, &reply).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedMessage { .. }));
        assert_eq!(err.kind(), RequestKind::LicenseStatus);
    }
}
