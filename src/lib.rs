//! # flexstat - FlexNet license manager status client
//!
//! A read-only client for the binary protocol spoken by FlexNet (FlexLM)
//! license managers (`lmgrd`) and their vendor daemons. It asks a fleet of
//! license servers what they serve and who is using it, the way `lmstat`
//! does, and never checks a license out.
//!
//! * **Layered**: checksum, frame splitting, message codec, session, fleet
//! * **Strict**: every corrupted frame is an error, never a guess
//! * **Isolated**: one broken server never spoils the rest of a fleet run
//!
//! ## Quick Start
//!
//! ```no_run
//! use flexstat::{Fleet, FleetOptions, QueryKind, ServerTarget};
//!
//! # async fn demo() -> Result<(), flexstat::ConfigError> {
//! let targets: Vec<ServerTarget> = vec!["27000@licsrv01".parse()?];
//! let fleet = Fleet::new(FleetOptions::default());
//! let result = fleet.run(&targets, &[QueryKind::VendorList]).await;
//!
//! for (target, outcome) in result.entries() {
//!     match outcome {
//!         Ok(status) => println!("{target}: {:?}", status.vendor_names),
//!         Err(e) => println!("{target}: {} ({e})", e.class()),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocol Overview
//!
//! Checked frames have the following wire format:
//!
//! - MARKER (1B): `0x2f`
//! - CHECK (1B): modular sum of marker, CRC bytes and the first 16 body bytes
//! - CRC (2B BE): CRC-14 over the body, polynomial `0x2e97`, reflected
//! - BODY: 16 byte header (length, type, timestamp) followed by data
//!
//! Greetings use a sum-only `0x68` frame instead, and servers older than
//! 11.10 answer vendor queries with 147-byte records.
//!
//! ## Message Types
//!
//! | Type   | Name              | Direction       | Description                     |
//! |--------|-------------------|-----------------|---------------------------------|
//! | 0x0108 | COMMAND           | Client → Server | `getpaths`, `dlist`, file text  |
//! | 0x013b | FEATURES          | Client → Vendor | Feature list                    |
//! | 0x0127 | LICENSE SETS      | Client → Vendor | Licenses the daemon knows about |
//! | 0x013c | LICENSE STATUS    | Client → Vendor | Usage of one license            |
//! | 0x010e | GREETING          | Server → Client | Hostname, daemon, version       |
//! | 0x0113 | REDIRECT          | Server → Client | Vendor daemon host and port     |
//! | 0x0146 | TEXT              | Server → Client | NUL-separated text              |
//! | 0x0128 | LICENSE SETS      | Vendor → Client | License sets                    |
//! | 0x004e | STATUS            | Vendor → Client | Used, total, server time        |
//! | 0x0114 | USAGE             | Vendor → Client | One checkout per used license   |

pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod fleet;
pub mod frame;
pub mod license_file;
pub mod message;
pub mod status;
pub mod tcp;
pub mod types;

// Re-export main types for convenience
pub use error::{
    ChecksumError, ConfigError, DecodeError, ErrorClass, SessionError, SessionFault, TargetError,
    TransportError, WireError,
};
pub use types::{ClientIdentity, ServerTarget, ServerVersion};

pub use config::FleetConfig;
pub use fleet::{Fleet, FleetOptions, FleetQueryResult, QueryKind};
pub use message::{Request, RequestKind, Response};
pub use status::ServerStatus;
pub use tcp::{Session, SessionConfig, SessionPhase};
