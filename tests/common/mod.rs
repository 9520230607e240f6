#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use flexstat::codec::ServerCodec;
use flexstat::frame::ClientMessage;
use flexstat::message::{LicenseStatus, Usage};
use flexstat::tcp::{DaemonProfile, MockLicenseServer};
use flexstat::{ClientIdentity, FleetOptions, ServerTarget, ServerVersion, SessionConfig};

pub fn identity() -> ClientIdentity {
    ClientIdentity {
        user: "monitor".into(),
        host: "probe01".into(),
        tty: "/dev/pts/1".into(),
        pid: "4242".into(),
        arch: "x64_lsb".into(),
        version: ServerVersion::new(11, 11),
    }
}

pub fn session_config(io_ms: u64) -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_millis(500),
        io_timeout: Duration::from_millis(io_ms),
    }
}

pub fn fleet_options(io_ms: u64) -> FleetOptions {
    FleetOptions {
        max_concurrency: 4,
        retries: 1,
        session: session_config(io_ms),
        identity: identity(),
        follow_manager_host: true,
    }
}

pub fn target(addr: SocketAddr) -> ServerTarget {
    ServerTarget::new(addr.ip().to_string(), addr.port())
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub async fn spawn_with<F>(handler: F) -> (SocketAddr, JoinHandle<()>)
where
    F: Fn(u64, ClientMessage) -> Vec<Bytes> + Send + Sync + Clone + 'static,
{
    let server = MockLicenseServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    (addr, server.spawn(handler))
}

pub async fn spawn_daemon(profile: DaemonProfile) -> (SocketAddr, JoinHandle<()>) {
    spawn_with(profile.into_handler()).await
}

/// Answer requests on the far end of an in-memory pipe.
pub fn serve_duplex<F>(io: DuplexStream, handler: F) -> JoinHandle<()>
where
    F: Fn(ClientMessage) -> Vec<Bytes> + Send + 'static,
{
    tokio::spawn(async move {
        let mut framed = Framed::new(io, ServerCodec);
        while let Some(Ok(message)) = framed.next().await {
            for reply in handler(message) {
                if framed.send(reply).await.is_err() {
                    return;
                }
            }
        }
    })
}

pub fn serve_profile(io: DuplexStream, profile: DaemonProfile) -> JoinHandle<()> {
    serve_duplex(io, move |message| profile.respond(&message))
}

/// Answer greetings only; everything else goes unanswered.
pub fn greet_only(io: DuplexStream, profile: DaemonProfile) -> JoinHandle<()> {
    serve_duplex(io, move |message| match message {
        ClientMessage::Greeting(_) => profile.respond(&message),
        _ => Vec::new(),
    })
}

/// Flip the last byte of every frame, past the check-byte span.
pub fn corrupt(frames: Vec<Bytes>) -> Vec<Bytes> {
    frames
        .into_iter()
        .map(|frame| {
            let mut bytes = frame.to_vec();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xff;
            Bytes::from(bytes)
        })
        .collect()
}

pub fn checkout(user: &str, since: u32) -> Usage {
    Usage::Checkout {
        user: user.into(),
        host: format!("{user}-ws"),
        display: "/dev/tty".into(),
        version: "v2.0".into(),
        since,
        handle: 0x0100 + u64::from(since % 16),
    }
}

pub fn status(used: u32, total: u32, usage: Vec<Usage>) -> LicenseStatus {
    LicenseStatus {
        flags: [0, 1],
        used,
        total,
        timestamp: 1_700_000_000,
        usage,
    }
}

pub fn manager(hostname: &str) -> DaemonProfile {
    DaemonProfile {
        hostname: hostname.into(),
        license_path: "/opt/flexlm/licenses/license.dat".into(),
        license_file: "SERVER licsrv01 ID=1234 27000\nVENDOR acmed\n".into(),
        ..DaemonProfile::default()
    }
}
