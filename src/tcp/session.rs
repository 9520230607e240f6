//! One conversation with one daemon over one TCP connection.
//!
//! A [`Session`] owns its connection outright and runs at most one exchange
//! at a time. Once anything goes wrong the session moves to
//! [`SessionPhase::Errored`] and drops the connection; it is never reused.

use std::fmt;
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::codec::ClientCodec;
use crate::error::{ErrorClass, Result, SessionError, SessionFault, TransportError};
use crate::frame;
use crate::message::{self, Context, Greeting, Reply, Request, RequestKind, Response};
use crate::types::{ClientIdentity, ServerTarget, ServerVersion};

/// Times a legacy status request is repeated while the daemon answers with
/// text instead of a status record.
const LEGACY_STATUS_RESENDS: u32 = 3;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Unestablished,
    Handshaking,
    Ready,
    Closed,
    Errored(ErrorClass),
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Unestablished => f.write_str("unestablished"),
            SessionPhase::Handshaking => f.write_str("handshaking"),
            SessionPhase::Ready => f.write_str("ready"),
            SessionPhase::Closed => f.write_str("closed"),
            SessionPhase::Errored(class) => write!(f, "errored ({class})"),
        }
    }
}

/// Per-operation timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// Applies to every single write and every single frame read.
    pub io_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
        }
    }
}

/// Client side of one daemon connection.
pub struct Session<T = TcpStream> {
    target: ServerTarget,
    config: SessionConfig,
    identity: ClientIdentity,
    client_version: ServerVersion,
    /// Vendor named in the greeting when talking to a vendor daemon.
    vendor: Option<String>,
    phase: SessionPhase,
    connection: Option<Framed<T, ClientCodec>>,
    greeting: Option<Greeting>,
    exchanges: u64,
    in_flight: bool,
}

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("vendor", &self.vendor)
            .field("phase", &self.phase)
            .field("exchanges", &self.exchanges)
            .finish()
    }
}

impl Session<TcpStream> {
    /// A session that has not connected yet.
    pub fn new(target: ServerTarget, identity: ClientIdentity, config: SessionConfig) -> Self {
        let client_version = target.manager_hint.unwrap_or(identity.version);
        Self {
            target,
            config,
            identity,
            client_version,
            vendor: None,
            phase: SessionPhase::Unestablished,
            connection: None,
            greeting: None,
            exchanges: 0,
            in_flight: false,
        }
    }

    /// Open the TCP connection.
    pub async fn connect(&mut self) -> Result<()> {
        self.expect_phase("connect", SessionPhase::Unestablished)?;

        let addr = self.target.socket_addr();
        let after = self.config.connect_timeout;
        debug!("Connecting to {}", self.target);

        let stream = match timeout(after, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(self.fail(TransportError::Connect { addr, source })),
            Err(_) => {
                return Err(self.fail(TransportError::Connect {
                    addr,
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no answer within {after:?}"),
                    ),
                }))
            }
        };
        // requests are small and latency bound
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot disable Nagle on {}: {}", self.target, e);
        }

        self.connection = Some(Framed::new(stream, ClientCodec));
        self.phase = SessionPhase::Handshaking;
        Ok(())
    }
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// A session over an already open transport, ready to handshake.
    pub fn from_transport(
        target: ServerTarget,
        io: T,
        identity: ClientIdentity,
        config: SessionConfig,
    ) -> Self {
        let client_version = target.manager_hint.unwrap_or(identity.version);
        Self {
            target,
            config,
            identity,
            client_version,
            vendor: None,
            phase: SessionPhase::Handshaking,
            connection: Some(Framed::new(io, ClientCodec)),
            greeting: None,
            exchanges: 0,
            in_flight: false,
        }
    }

    /// Greet as a client of `vendor`'s daemon instead of the manager.
    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn target(&self) -> &ServerTarget {
        &self.target
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Greeting received during the handshake.
    pub fn greeting(&self) -> Option<&Greeting> {
        self.greeting.as_ref()
    }

    /// Completed request/reply exchanges, the handshake included.
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Whether the server greeted with a pre-11.10 version.
    pub fn is_legacy(&self) -> bool {
        self.greeting.as_ref().is_some_and(|g| g.version.is_legacy())
    }

    /// Send the greeting and wait for the server's. Handshaking → Ready.
    pub async fn handshake(&mut self) -> Result<&Greeting> {
        self.expect_phase("handshake", SessionPhase::Handshaking)?;

        let hello = Request::Hello {
            vendor: self.vendor.clone(),
        };
        let greeting = match self.exchange(&hello).await {
            Ok(Response::Greeting(greeting)) => greeting,
            Ok(other) => return Err(self.fail(unexpected(RequestKind::Hello, &other))),
            Err(fault) => return Err(self.fail(fault)),
        };

        info!(
            "Session with {} ready: {} on {} version {}",
            self.target, greeting.daemon, greeting.hostname, greeting.version
        );
        self.phase = SessionPhase::Ready;
        Ok(self.greeting.insert(greeting))
    }

    /// Run one request/reply exchange. Only valid in `Ready`.
    ///
    /// A license status query also reads the usage records the server sends
    /// after the status reply, so the stream is aligned again on return.
    pub async fn query(&mut self, request: &Request) -> Result<Response> {
        self.expect_phase("query", SessionPhase::Ready)?;
        if self.in_flight {
            return Err(self.fail(SessionFault::Desynchronized));
        }

        match self.exchange(request).await {
            Ok(response) => Ok(response),
            Err(fault) => Err(self.fail(fault)),
        }
    }

    /// Any phase → Closed. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut framed) = self.connection.take() {
            match timeout(self.config.io_timeout, framed.close()).await {
                Ok(Ok(())) => debug!("Session with {} closed", self.target),
                Ok(Err(e)) => debug!("Session with {} closed uncleanly: {}", self.target, e),
                Err(_) => debug!("Session with {} dropped, shutdown timed out", self.target),
            }
        }
        self.phase = SessionPhase::Closed;
    }

    fn expect_phase(&self, operation: &'static str, expected: SessionPhase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(SessionError::new(
                self.phase,
                SessionFault::InvalidPhase {
                    operation,
                    phase: self.phase,
                },
            ))
        }
    }

    /// Record a failure: the session becomes unusable and the connection is
    /// released.
    fn fail(&mut self, fault: impl Into<SessionFault>) -> SessionError {
        let fault = fault.into();
        let phase = self.phase;
        warn!("Session with {} failed while {}: {}", self.target, phase, fault);

        self.phase = SessionPhase::Errored(fault.class());
        self.connection = None;
        self.in_flight = false;
        SessionError::new(phase, fault)
    }

    async fn exchange(&mut self, request: &Request) -> std::result::Result<Response, SessionFault> {
        let kind = request.kind();
        let body = {
            let ctx = Context {
                identity: &self.identity,
                daemon: self.greeting.as_ref().map_or("", |g| g.daemon.as_str()),
                client_version: self.client_version,
                timestamp: message::unix_timestamp(),
            };
            message::encode(request, &ctx)
        };

        self.in_flight = true;
        self.send(kind, &body).await?;
        let mut reply = self.receive(kind).await?;

        // some legacy daemons answer a status request with a stray text
        // record first; asking again yields the status record
        if kind == RequestKind::LegacyLicenseStatus {
            let mut resends = 0;
            while matches!(reply, Reply::LegacyText(_)) && resends < LEGACY_STATUS_RESENDS {
                resends += 1;
                debug!(
                    "Discarding legacy text from {} in place of a status, asking again ({}/{})",
                    self.target, resends, LEGACY_STATUS_RESENDS
                );
                self.send(kind, &body).await?;
                reply = self.receive(kind).await?;
            }
        }

        let mut response = message::decode(kind, &reply)?;
        if let (Response::LicenseStatus(status), Some(follow_up)) =
            (&mut response, kind.follow_up())
        {
            for _ in 0..status.used {
                let reply = self.receive(follow_up).await?;
                match message::decode(follow_up, &reply)? {
                    Response::Usage(usage) => status.usage.push(usage),
                    other => return Err(unexpected(follow_up, &other)),
                }
            }
        }

        self.in_flight = false;
        self.exchanges += 1;
        Ok(response)
    }

    async fn send(
        &mut self,
        kind: RequestKind,
        body: &[u8],
    ) -> std::result::Result<(), SessionFault> {
        let Some(bytes) = frame::frame_request(kind.framing(), body) else {
            return Ok(());
        };
        let after = self.config.io_timeout;
        let framed = self.connection.as_mut().ok_or(TransportError::Closed)?;
        debug!("Sending {} ({} bytes) to {}", kind, bytes.len(), self.target);
        trace!("-> {:02x?}", &bytes[..]);
        match timeout(after, framed.send(bytes)).await {
            Ok(sent) => Ok(sent?),
            Err(_) => Err(TransportError::Timeout {
                operation: "write",
                after,
            }
            .into()),
        }
    }

    /// Read and validate the next reply frame.
    async fn receive(&mut self, kind: RequestKind) -> std::result::Result<Reply, SessionFault> {
        let after = self.config.io_timeout;
        let framed = self.connection.as_mut().ok_or(TransportError::Closed)?;

        let raw = match timeout(after, framed.next()).await {
            Ok(Some(raw)) => raw?,
            Ok(None) => return Err(TransportError::Closed.into()),
            Err(_) => {
                return Err(TransportError::Timeout {
                    operation: "read",
                    after,
                }
                .into())
            }
        };
        trace!("<- {:?}", raw);
        let reply = frame::into_reply(raw)?;
        debug!("Received {:#06x} reply for {}", reply.message_type(), kind);
        Ok(reply)
    }
}

fn unexpected(kind: RequestKind, response: &Response) -> SessionFault {
    SessionFault::Decode(crate::error::DecodeError::UnexpectedFormat {
        kind,
        detail: format!("decoded to {response:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(SessionPhase::Ready.to_string(), "ready");
        assert_eq!(
            SessionPhase::Errored(ErrorClass::Timeout).to_string(),
            "errored (timeout)"
        );
    }

    #[tokio::test]
    async fn test_query_before_handshake_is_rejected() {
        let (client, _server) = tokio::io::duplex(64);
        let mut session = Session::from_transport(
            ServerTarget::new("localhost", 27000),
            client,
            ClientIdentity::default(),
            SessionConfig::default(),
        );
        let err = session.query(&Request::LicensePath).await.unwrap_err();
        assert!(matches!(err.fault, SessionFault::InvalidPhase { operation: "query", .. }));
        assert_eq!(err.phase, SessionPhase::Handshaking);
        // a misuse does not poison the session
        assert_eq!(session.phase(), SessionPhase::Handshaking);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = tokio::io::duplex(64);
        let mut session = Session::from_transport(
            ServerTarget::new("localhost", 27000),
            client,
            ClientIdentity::default(),
            SessionConfig::default(),
        );
        session.close().await;
        session.close().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_close_after_peer_hung_up() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut session = Session::from_transport(
            ServerTarget::new("localhost", 27000),
            client,
            ClientIdentity::default(),
            SessionConfig {
                connect_timeout: Duration::from_millis(100),
                io_timeout: Duration::from_millis(100),
            },
        );
        timeout(Duration::from_secs(1), session.close())
            .await
            .expect("close is bounded by the I/O timeout");
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(!session.is_connected());
    }
}
