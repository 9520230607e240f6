//! Per-kind message layouts.
//!
//! Everything the client knows about the shape of a message lives in
//! [`LAYOUTS`]: how the request is framed, which reply types may answer it and
//! which decoder reads the reply. Adding a query kind means adding an entry
//! here plus its body encoder and decoder; framing code is untouched.

use super::replies;
use super::{ReplyView, RequestKind, Response};
use crate::error::DecodeError;

/// Manager command (`getpaths`, `dlist`, license file).
pub const TYPE_COMMAND: u16 = 0x0108;
/// Vendor feature list request.
pub const TYPE_FEATURES: u16 = 0x013b;
/// Vendor license-set request.
pub const TYPE_LICENSE_SETS: u16 = 0x0127;
/// Vendor license status request.
pub const TYPE_LICENSE_STATUS: u16 = 0x013c;

/// Greeting reply from a manager or vendor daemon.
pub const TYPE_GREETING_REPLY: u16 = 0x010e;
/// Greeting reply pointing at a vendor daemon's host and port.
pub const TYPE_REDIRECT_REPLY: u16 = 0x0113;
/// Generic NUL-separated text reply.
pub const TYPE_TEXT_REPLY: u16 = 0x0146;
/// License sets, text interleaved with binary runs.
pub const TYPE_LICENSE_SETS_REPLY: u16 = 0x0128;
/// Usage counts for one license.
pub const TYPE_STATUS_REPLY: u16 = 0x004e;
/// One checkout or group reservation, sent after a status reply.
pub const TYPE_USAGE_REPLY: u16 = 0x0114;

/// Marker of a chunked legacy text reply.
pub const LEGACY_TEXT_MARKER: u8 = 0x4c;
/// Marker of a single legacy status record.
pub const LEGACY_RECORD_MARKER: u8 = 0x4e;
/// Marker of a legacy feature list request.
pub const LEGACY_FEATURES_MARKER: u8 = 0x3d;
/// Marker of a legacy license status request.
pub const LEGACY_STATUS_MARKER: u8 = 0x6c;
/// Feature name slot of a legacy status request. Names that fill it are sent
/// without a terminator.
pub const LEGACY_FEATURE_WIDTH: usize = 31;
/// Signature slot of a legacy status request.
pub const LEGACY_SIGNATURE_WIDTH: usize = 21;

/// Body header length for each reply type: where the kind-specific data
/// starts, counted from the first body byte.
pub const REPLY_HEADER_LENS: [(u16, usize); 6] = [
    (TYPE_STATUS_REPLY, 16),
    (TYPE_GREETING_REPLY, 20),
    (TYPE_REDIRECT_REPLY, 16),
    (TYPE_USAGE_REPLY, 16),
    (TYPE_LICENSE_SETS_REPLY, 16),
    (TYPE_TEXT_REPLY, 20),
];

pub fn reply_header_len(message_type: u16) -> Option<usize> {
    REPLY_HEADER_LENS
        .iter()
        .find(|(t, _)| *t == message_type)
        .map(|(_, len)| *len)
}

/// How a request goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Sum-framed greeting record.
    Greeting,
    /// Checked frame carrying this message type.
    Checked(u16),
    /// Sum-framed 147-byte record with this marker.
    Legacy(u8),
    /// Nothing is sent; the reply follows an earlier one.
    FollowUp,
}

/// Which replies may answer a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepts {
    Checked(&'static [u16]),
    LegacyText,
    LegacyRecord,
    /// Either legacy shape.
    Legacy,
}

pub type DecodeFn = fn(&ReplyView<'_>) -> Result<Response, DecodeError>;

#[derive(Clone, Copy)]
pub struct Layout {
    pub kind: RequestKind,
    pub framing: Framing,
    pub accepts: Accepts,
    pub decode: DecodeFn,
}

impl std::fmt::Debug for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layout")
            .field("kind", &self.kind)
            .field("framing", &self.framing)
            .field("accepts", &self.accepts)
            .finish()
    }
}

/// One entry per [`RequestKind`], in declaration order.
pub static LAYOUTS: [Layout; RequestKind::COUNT] = [
    Layout {
        kind: RequestKind::Hello,
        framing: Framing::Greeting,
        accepts: Accepts::Checked(&[TYPE_GREETING_REPLY]),
        decode: replies::greeting,
    },
    Layout {
        kind: RequestKind::LocateVendor,
        framing: Framing::Greeting,
        accepts: Accepts::Checked(&[TYPE_REDIRECT_REPLY]),
        decode: replies::redirect,
    },
    Layout {
        kind: RequestKind::LicensePath,
        framing: Framing::Checked(TYPE_COMMAND),
        accepts: Accepts::Checked(&[TYPE_TEXT_REPLY]),
        decode: replies::license_path,
    },
    Layout {
        kind: RequestKind::LicenseFile,
        framing: Framing::Checked(TYPE_COMMAND),
        accepts: Accepts::Checked(&[TYPE_TEXT_REPLY]),
        decode: replies::license_file,
    },
    Layout {
        kind: RequestKind::VendorList,
        framing: Framing::Checked(TYPE_COMMAND),
        accepts: Accepts::Checked(&[TYPE_TEXT_REPLY]),
        decode: replies::vendor_list,
    },
    Layout {
        kind: RequestKind::Features,
        framing: Framing::Checked(TYPE_FEATURES),
        accepts: Accepts::Checked(&[TYPE_TEXT_REPLY, TYPE_LICENSE_SETS_REPLY]),
        decode: replies::features,
    },
    Layout {
        kind: RequestKind::LicenseSets,
        framing: Framing::Checked(TYPE_LICENSE_SETS),
        accepts: Accepts::Checked(&[TYPE_LICENSE_SETS_REPLY]),
        decode: replies::license_sets,
    },
    Layout {
        kind: RequestKind::LicenseStatus,
        framing: Framing::Checked(TYPE_LICENSE_STATUS),
        accepts: Accepts::Checked(&[TYPE_STATUS_REPLY]),
        decode: replies::license_status,
    },
    Layout {
        kind: RequestKind::LicenseUsage,
        framing: Framing::FollowUp,
        accepts: Accepts::Checked(&[TYPE_USAGE_REPLY]),
        decode: replies::usage,
    },
    Layout {
        kind: RequestKind::LegacyFeatures,
        framing: Framing::Legacy(LEGACY_FEATURES_MARKER),
        accepts: Accepts::LegacyText,
        decode: replies::features,
    },
    Layout {
        kind: RequestKind::LegacyLicenseStatus,
        framing: Framing::Legacy(LEGACY_STATUS_MARKER),
        accepts: Accepts::LegacyRecord,
        decode: replies::legacy_license_status,
    },
    Layout {
        kind: RequestKind::LegacyLicenseUsage,
        framing: Framing::FollowUp,
        accepts: Accepts::Legacy,
        decode: replies::legacy_usage,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_order_matches_kinds() {
        for (index, layout) in LAYOUTS.iter().enumerate() {
            assert_eq!(layout.kind as usize, index);
            assert_eq!(layout.kind.layout().kind, layout.kind);
        }
    }

    #[test]
    fn test_every_accepted_type_has_header_len() {
        for layout in &LAYOUTS {
            if let Accepts::Checked(types) = layout.accepts {
                for t in types {
                    assert!(reply_header_len(*t).is_some(), "{:?} {t:#06x}", layout.kind);
                }
            }
        }
    }
}
