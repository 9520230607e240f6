use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use crate::codec::ServerCodec;
use crate::error::WireError;
use crate::frame::ClientMessage;
use crate::message::layout::{
    LEGACY_FEATURES_MARKER, LEGACY_FEATURE_WIDTH, LEGACY_STATUS_MARKER, TYPE_COMMAND,
    TYPE_FEATURES, TYPE_LICENSE_SETS, TYPE_LICENSE_STATUS,
};
use crate::message::{
    render, unix_timestamp, Greeting, LicenseSet, LicenseStatus, RequestKind, Response,
    VendorRedirect, BODY_HEADER_LEN,
};
use crate::types::ServerVersion;

/// Scripted license daemon speaking the server side of the protocol.
///
/// Used by the integration tests and the demo. Each accepted connection gets
/// its own task; every decoded request is handed to the handler and whatever
/// frames it returns are written back in order. An empty answer means the
/// daemon stays silent.
pub struct MockLicenseServer {
    listener: TcpListener,
    next_session_id: Arc<AtomicU64>,
}

impl MockLicenseServer {
    /// Bind to the specified address
    pub async fn bind(addr: &str) -> Result<Self, WireError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Mock license daemon bound to {}", addr);

        Ok(Self {
            listener,
            next_session_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, WireError> {
        self.listener.local_addr().map_err(WireError::Io)
    }

    /// Run the accept loop with the provided handler function
    pub async fn run<F>(self, handler: F) -> Result<(), WireError>
    where
        F: Fn(u64, ClientMessage) -> Vec<Bytes> + Send + Sync + Clone + 'static,
    {
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    debug!("New connection from {}", addr);

                    let handler = handler.clone();
                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(socket, handler, session_id).await
                        {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Run in the background until the returned task is aborted.
    pub fn spawn<F>(self, handler: F) -> JoinHandle<()>
    where
        F: Fn(u64, ClientMessage) -> Vec<Bytes> + Send + Sync + Clone + 'static,
    {
        tokio::spawn(async move {
            if let Err(e) = self.run(handler).await {
                error!("Mock license daemon stopped: {}", e);
            }
        })
    }

    /// Handle a single client connection
    async fn handle_connection<F>(
        socket: TcpStream,
        handler: F,
        session_id: u64,
    ) -> Result<(), WireError>
    where
        F: Fn(u64, ClientMessage) -> Vec<Bytes> + Send + Sync + Clone + 'static,
    {
        let mut framed = Framed::new(socket, ServerCodec);

        loop {
            match framed.try_next().await {
                Ok(Some(message)) => {
                    debug!("Session {} received {:?}", session_id, message);
                    for reply in handler(session_id, message) {
                        framed.send(reply).await?;
                    }
                }
                Ok(None) => {
                    debug!("Session {} connection closed", session_id);
                    break;
                }
                Err(e) => {
                    error!("Session {} frame error: {}", session_id, e);
                    break;
                }
            }
        }

        Ok(())
    }
}

/// What a scripted daemon answers. A manager profile lists `redirects`; a
/// vendor daemon profile carries features, license sets and usage.
#[derive(Debug, Clone)]
pub struct DaemonProfile {
    pub hostname: String,
    /// Daemon name: `lmgrd` for a manager, the vendor name otherwise.
    pub daemon: String,
    pub version: ServerVersion,
    pub token: u32,
    pub license_path: String,
    pub license_file: String,
    /// Vendor name and where its daemon listens.
    pub redirects: Vec<(String, VendorRedirect)>,
    pub features: Vec<String>,
    pub license_sets: Vec<LicenseSet>,
    /// Status per feature name.
    pub statuses: Vec<(String, LicenseStatus)>,
}

impl Default for DaemonProfile {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            daemon: "lmgrd".to_string(),
            version: ServerVersion::new(11, 16),
            token: 0x1234_5678,
            license_path: String::new(),
            license_file: String::new(),
            redirects: Vec::new(),
            features: Vec::new(),
            license_sets: Vec::new(),
            statuses: Vec::new(),
        }
    }
}

fn first_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl DaemonProfile {
    fn status_of(&self, feature: &str) -> LicenseStatus {
        self.statuses
            .iter()
            .find(|(name, _)| name == feature)
            .map(|(_, status)| status.clone())
            .unwrap_or(LicenseStatus {
                flags: [0, 0],
                used: 0,
                total: 0,
                timestamp: unix_timestamp(),
                usage: Vec::new(),
            })
    }

    fn greet(&self, vendor: Option<String>) -> Vec<Bytes> {
        match vendor {
            Some(vendor) if vendor != self.daemon => {
                match self.redirects.iter().find(|(name, _)| *name == vendor) {
                    Some((_, redirect)) => {
                        render::reply(
                            RequestKind::LocateVendor,
                            &Response::Redirect(redirect.clone()),
                            unix_timestamp(),
                        )
                    }
                    // unknown vendor: no answer
                    None => Vec::new(),
                }
            }
            _ => vec![render::greeting(&Greeting {
                hostname: self.hostname.clone(),
                daemon: self.daemon.clone(),
                version: self.version,
                token: self.token,
            })],
        }
    }

    fn command(&self, data: &[u8]) -> Vec<Bytes> {
        // 01 04 user host daemon tty command
        let fields: Vec<String> = data
            .get(2..)
            .unwrap_or_default()
            .split(|b| *b == 0)
            .map(first_field)
            .collect();
        let stamp = unix_timestamp();
        match fields.get(4).map(String::as_str) {
            Some("getpaths") => vec![render::text([self.license_path.as_str()], stamp)],
            Some("dlist") => {
                let names: Vec<&str> = self.redirects.iter().map(|(n, _)| n.as_str()).collect();
                vec![render::text([names.join(" ").as_str()], stamp)]
            }
            _ => vec![render::text([self.license_file.as_str()], stamp)],
        }
    }

    /// Frames answering one client message.
    pub fn respond(&self, message: &ClientMessage) -> Vec<Bytes> {
        let stamp = unix_timestamp();
        match message {
            ClientMessage::Greeting(_) => self.greet(message.greeting_vendor()),
            ClientMessage::Checked(body) => {
                let data = body.get(BODY_HEADER_LEN..).unwrap_or_default();
                match message.message_type() {
                    Some(TYPE_COMMAND) => self.command(data),
                    Some(TYPE_FEATURES) => render::reply(
                        RequestKind::Features,
                        &Response::Features(self.features.clone()),
                        stamp,
                    ),
                    Some(TYPE_LICENSE_SETS) => vec![render::license_sets(&self.license_sets, stamp)],
                    Some(TYPE_LICENSE_STATUS) => render::reply(
                        RequestKind::LicenseStatus,
                        &Response::LicenseStatus(self.status_of(&first_field(data))),
                        stamp,
                    ),
                    _ => Vec::new(),
                }
            }
            ClientMessage::Legacy { marker, payload } => match *marker {
                LEGACY_FEATURES_MARKER => vec![render::legacy_text(&self.features.join(" "))],
                LEGACY_STATUS_MARKER => {
                    let slot = &payload[..payload.len().min(LEGACY_FEATURE_WIDTH)];
                    render::reply(
                        RequestKind::LegacyLicenseStatus,
                        &Response::LicenseStatus(self.status_of(&first_field(slot))),
                        stamp,
                    )
                }
                _ => Vec::new(),
            },
        }
    }

    /// Handler for [`MockLicenseServer::run`].
    pub fn into_handler(
        self,
    ) -> impl Fn(u64, ClientMessage) -> Vec<Bytes> + Send + Sync + Clone + 'static {
        let profile = Arc::new(self);
        move |_, message| profile.respond(&message)
    }
}
