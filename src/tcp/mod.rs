//! TCP transport: the client session and a scripted daemon for tests.

pub mod server;
pub mod session;

pub use server::{DaemonProfile, MockLicenseServer};
pub use session::{Session, SessionConfig, SessionPhase};
