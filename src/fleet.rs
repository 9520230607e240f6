//! Query orchestrator: runs one task per license manager, bounded by a
//! concurrency limit, and collects one result per target.
//!
//! Targets share nothing. A failing target only ever affects its own entry in
//! the [`FleetQueryResult`]; the run as a whole never fails.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DecodeError, SessionError, SessionFault, TargetError};
use crate::license_file::{License, LicenseFile};
use crate::message::{Greeting, Request, Response, VendorRedirect};
use crate::status::{
    Failure, LicenseReport, LicenseSetReport, Outcome, ServerStatus, TargetReport, VendorDetails,
    VendorStatus,
};
use crate::tcp::{Session, SessionConfig, SessionPhase};
use crate::types::{ClientIdentity, ServerTarget};

/// What to ask each license manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    LicensePath,
    LicenseFile,
    VendorList,
    /// Locate every vendor daemon and collect features, license sets and
    /// per-license usage. Implies `LicenseFile` and `VendorList`.
    Vendors,
}

impl QueryKind {
    pub const ALL: [QueryKind; 4] = [
        QueryKind::LicensePath,
        QueryKind::LicenseFile,
        QueryKind::VendorList,
        QueryKind::Vendors,
    ];
}

#[derive(Debug, Clone)]
pub struct FleetOptions {
    /// Targets queried at the same time.
    pub max_concurrency: usize,
    /// Extra attempts with a fresh connection after a transient failure.
    pub retries: u32,
    pub session: SessionConfig,
    pub identity: ClientIdentity,
    /// Reconnect to the hostname a manager names in its greeting, as
    /// redundant manager setups expect.
    pub follow_manager_host: bool,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            retries: 1,
            session: SessionConfig::default(),
            identity: ClientIdentity::from_env(),
            follow_manager_host: true,
        }
    }
}

/// One entry per target, in the order the targets were given.
#[derive(Debug)]
pub struct FleetQueryResult {
    entries: Vec<(ServerTarget, Result<ServerStatus, TargetError>)>,
}

impl FleetQueryResult {
    pub fn entries(&self) -> &[(ServerTarget, Result<ServerStatus, TargetError>)] {
        &self.entries
    }

    pub fn get(&self, target: &ServerTarget) -> Option<&Result<ServerStatus, TargetError>> {
        self.entries
            .iter()
            .find(|(t, _)| t == target)
            .map(|(_, result)| result)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|(_, r)| r.is_ok()).count()
    }

    /// Serializable report, failures included.
    pub fn report(&self) -> Vec<TargetReport> {
        self.entries
            .iter()
            .map(|(target, result)| TargetReport {
                target: target.to_string(),
                outcome: match result {
                    Ok(status) => Outcome::Ok {
                        status: status.clone(),
                    },
                    Err(err) => Outcome::Error { error: err.into() },
                },
            })
            .collect()
    }
}

/// A connection that reopens itself for the next request after a failure.
///
/// Used for the longer conversations (vendor location, per-license status)
/// where each request is its own item: a failed one is recorded against that
/// item and the next gets a fresh connection.
struct Conn<'a> {
    fleet: &'a Fleet,
    target: ServerTarget,
    vendor: Option<String>,
    session: Option<Session>,
}

impl<'a> Conn<'a> {
    fn new(fleet: &'a Fleet, target: ServerTarget, vendor: Option<String>) -> Self {
        Self {
            fleet,
            target,
            vendor,
            session: None,
        }
    }

    fn with_session(fleet: &'a Fleet, session: Session) -> Self {
        Self {
            fleet,
            target: session.target().clone(),
            vendor: None,
            session: Some(session),
        }
    }

    async fn ready(&mut self) -> Result<&mut Session, SessionError> {
        let session = match self.session.take() {
            Some(session) if session.phase() == SessionPhase::Ready => session,
            previous => {
                if let Some(previous) = previous {
                    debug!("Reopening connection to {} ({})", self.target, previous.phase());
                }
                self.fleet
                    .open(self.target.clone(), self.vendor.clone())
                    .await?
            }
        };
        Ok(self.session.insert(session))
    }

    async fn query(&mut self, request: &Request) -> Result<Response, SessionError> {
        self.ready().await?.query(request).await
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

/// A reply that decoded fine but to the wrong response variant.
fn unexpected(request: &Request, response: Response) -> SessionError {
    SessionError::new(
        SessionPhase::Ready,
        DecodeError::UnexpectedFormat {
            kind: request.kind(),
            detail: format!("unexpected response {response:?}"),
        },
    )
}

/// Runs queries against a fleet of license managers.
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    options: FleetOptions,
}

impl Fleet {
    pub fn new(options: FleetOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &FleetOptions {
        &self.options
    }

    /// Query every target. Never fails as a whole.
    pub async fn run(&self, targets: &[ServerTarget], kinds: &[QueryKind]) -> FleetQueryResult {
        self.run_until(targets, kinds, CancellationToken::new()).await
    }

    /// Like [`Fleet::run`], but stops when `cancel` fires. Targets still in
    /// progress are dropped together with their connections and reported as
    /// [`TargetError::Cancelled`].
    pub async fn run_until(
        &self,
        targets: &[ServerTarget],
        kinds: &[QueryKind],
        cancel: CancellationToken,
    ) -> FleetQueryResult {
        info!(
            "Querying {} license servers, {} at a time",
            targets.len(),
            self.options.max_concurrency
        );

        let mut slots: Vec<Option<Result<ServerStatus, TargetError>>> =
            targets.iter().map(|_| None).collect();
        {
            let tasks = targets.iter().enumerate().map(|(index, target)| async move {
                (index, self.query_target(target, kinds).await)
            });
            let mut results =
                futures::stream::iter(tasks).buffer_unordered(self.options.max_concurrency.max(1));

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        warn!("Fleet run cancelled");
                        break;
                    }
                    next = results.next() => match next {
                        Some((index, result)) => slots[index] = Some(result),
                        None => break,
                    },
                }
            }
        }

        let entries = targets
            .iter()
            .cloned()
            .zip(slots)
            .map(|(target, slot)| (target, slot.unwrap_or(Err(TargetError::Cancelled))))
            .collect();
        FleetQueryResult { entries }
    }

    async fn query_target(
        &self,
        target: &ServerTarget,
        kinds: &[QueryKind],
    ) -> Result<ServerStatus, TargetError> {
        let mut attempt = 0;
        loop {
            match self.query_once(target, kinds).await {
                Ok(status) => {
                    info!("{}: ok", target);
                    return Ok(status);
                }
                Err(e) if e.class().is_transient() && attempt < self.options.retries => {
                    attempt += 1;
                    warn!("{}: {}, retrying ({}/{})", target, e, attempt, self.options.retries);
                }
                Err(e) => {
                    warn!("{}: {}", target, e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Connect and handshake, greeting `vendor`'s daemon when given.
    async fn open(
        &self,
        target: ServerTarget,
        vendor: Option<String>,
    ) -> Result<Session, SessionError> {
        let mut session = Session::new(target, self.options.identity.clone(), self.options.session);
        if let Some(vendor) = vendor {
            session = session.with_vendor(vendor);
        }
        session.connect().await?;
        session.handshake().await?;
        Ok(session)
    }

    /// Open the manager session, moving to the host named in the greeting
    /// when it differs. Falls back to the first connection if that fails.
    async fn open_manager(&self, target: &ServerTarget) -> Result<(Session, Greeting), SessionError> {
        let session = self.open(target.clone(), None).await?;
        let greeting = session.greeting().cloned().ok_or_else(|| {
            SessionError::new(
                session.phase(),
                SessionFault::InvalidPhase {
                    operation: "read greeting",
                    phase: session.phase(),
                },
            )
        })?;

        if !self.options.follow_manager_host
            || greeting.hostname.is_empty()
            || greeting.hostname.eq_ignore_ascii_case(&target.host)
        {
            return Ok((session, greeting));
        }

        let named = ServerTarget {
            host: greeting.hostname.clone(),
            ..target.clone()
        };
        let mut first = session;
        match self.open(named, None).await {
            Ok(moved) => {
                debug!("{}: following manager to {}", target, greeting.hostname);
                first.close().await;
                let greeting = moved.greeting().cloned().unwrap_or(greeting);
                Ok((moved, greeting))
            }
            Err(e) => {
                debug!("{}: cannot reach {} ({}), staying", target, greeting.hostname, e);
                Ok((first, greeting))
            }
        }
    }

    async fn query_once(
        &self,
        target: &ServerTarget,
        kinds: &[QueryKind],
    ) -> Result<ServerStatus, SessionError> {
        let (session, greeting) = self.open_manager(target).await?;
        let mut status = ServerStatus {
            target: target.clone(),
            connected_host: session.target().host.clone(),
            hostname: greeting.hostname.clone(),
            daemon: greeting.daemon.clone(),
            version: greeting.version,
            license_path: None,
            license_file_text: None,
            license_file: None,
            vendor_names: None,
            vendors: Vec::new(),
        };

        let mut manager = Conn::with_session(self, session);
        if let Err(e) = self.manager_queries(&mut manager, kinds, &mut status).await {
            manager.close().await;
            return Err(e);
        }

        if kinds.contains(&QueryKind::Vendors) {
            let vendors = self.query_vendors(target, &mut manager, &status).await;
            status.vendors = vendors;
        }
        manager.close().await;
        Ok(status)
    }

    async fn manager_queries(
        &self,
        manager: &mut Conn<'_>,
        kinds: &[QueryKind],
        status: &mut ServerStatus,
    ) -> Result<(), SessionError> {
        let wants = |kind| kinds.contains(&kind);
        let want_vendors = wants(QueryKind::Vendors);

        if wants(QueryKind::LicensePath) {
            let request = Request::LicensePath;
            match manager.query(&request).await? {
                Response::LicensePath(path) => status.license_path = Some(path),
                other => return Err(unexpected(&request, other)),
            }
        }
        if wants(QueryKind::LicenseFile) || want_vendors {
            let request = Request::LicenseFile;
            match manager.query(&request).await? {
                Response::LicenseFile(text) => {
                    status.license_file = Some(LicenseFile::parse(&text));
                    status.license_file_text = Some(text);
                }
                other => return Err(unexpected(&request, other)),
            }
        }
        if wants(QueryKind::VendorList) || want_vendors {
            let request = Request::VendorList;
            match manager.query(&request).await? {
                Response::VendorList(names) => status.vendor_names = Some(names),
                other => return Err(unexpected(&request, other)),
            }
        }
        Ok(())
    }

    async fn query_vendors(
        &self,
        target: &ServerTarget,
        manager: &mut Conn<'_>,
        status: &ServerStatus,
    ) -> Vec<VendorStatus> {
        let names = status.vendor_names.clone().unwrap_or_default();
        let file = status.license_file.clone().unwrap_or_default();

        // locate every vendor first, while the manager connection is open
        let mut vendors = Vec::with_capacity(names.len());
        for name in &names {
            let mut vendor = VendorStatus::new(name.as_str());
            let request = Request::LocateVendor {
                vendor: name.clone(),
            };
            match manager.query(&request).await {
                Ok(Response::Redirect(redirect)) => vendor.location = Some(redirect),
                Ok(other) => vendor.error = Some(Failure::from(&unexpected(&request, other))),
                Err(e) => vendor.error = Some(Failure::from(&e)),
            }
            vendors.push(vendor);
        }
        manager.close().await;

        for vendor in &mut vendors {
            let Some(location) = vendor.location.clone() else {
                continue;
            };
            let licenses: Vec<License> = file.licenses_for(&vendor.name).cloned().collect();
            let result = self
                .vendor_details(target, &vendor.name, &location, licenses)
                .await;
            match result {
                Ok(details) => vendor.details = Some(details),
                Err(e) => {
                    warn!("{}: vendor {} failed: {}", target, vendor.name, e);
                    vendor.error = Some(Failure::from(&e));
                }
            }
        }
        vendors
    }

    async fn vendor_details(
        &self,
        manager: &ServerTarget,
        name: &str,
        location: &VendorRedirect,
        file_licenses: Vec<License>,
    ) -> Result<VendorDetails, SessionError> {
        let target = ServerTarget {
            host: location.host.clone(),
            port: location.port,
            manager_hint: manager.manager_hint,
        };
        let mut conn = Conn::new(self, target, Some(name.to_string()));

        let session = conn.ready().await?;
        let legacy = session.is_legacy();
        let version = session.greeting().map(|g| g.version);
        let mut details = VendorDetails {
            version,
            legacy,
            ..VendorDetails::default()
        };

        let features = if legacy {
            Request::LegacyFeatures
        } else {
            Request::Features
        };
        match conn.query(&features).await? {
            Response::Features(names) => details.features = names,
            other => return Err(unexpected(&features, other)),
        }

        if !legacy {
            let request = Request::LicenseSets;
            match conn.query(&request).await? {
                Response::LicenseSets(sets) => {
                    details.license_sets = sets.iter().map(LicenseSetReport::new).collect();
                }
                other => return Err(unexpected(&request, other)),
            }
        }
        details.licenses = file_licenses.into_iter().map(LicenseReport::new).collect();

        let reports = details
            .license_sets
            .iter_mut()
            .flat_map(|set| set.licenses.iter_mut())
            .chain(details.licenses.iter_mut());
        for report in reports {
            license_status(&mut conn, legacy, report).await;
        }

        conn.close().await;
        Ok(details)
    }
}

/// Fill in the status of one license. Failures stay on the license.
async fn license_status(conn: &mut Conn<'_>, legacy: bool, report: &mut LicenseReport) {
    let Some(signature) = report.license.signature() else {
        debug!("{}: no signature, skipping status", report.license.feature);
        return;
    };
    let feature = report.license.feature.clone();
    let signature = signature.to_string();
    let request = if legacy {
        Request::LegacyLicenseStatus { feature, signature }
    } else {
        Request::LicenseStatus { feature, signature }
    };
    match conn.query(&request).await {
        Ok(Response::LicenseStatus(status)) => report.status = Some(status),
        Ok(other) => report.error = Some(Failure::from(&unexpected(&request, other))),
        Err(e) => report.error = Some(Failure::from(&e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_kinds_deserialize_snake_case() {
        let kinds: Vec<QueryKind> =
            serde_json::from_str(r#"["license_path", "vendor_list", "vendors"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![QueryKind::LicensePath, QueryKind::VendorList, QueryKind::Vendors]
        );
    }

    #[tokio::test]
    async fn test_empty_fleet() {
        let result = Fleet::default().run(&[], &QueryKind::ALL).await;
        assert!(result.is_empty());
        assert_eq!(result.succeeded(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let targets = [ServerTarget::new("192.0.2.1", 27000)];
        let result = Fleet::default()
            .run_until(&targets, &[QueryKind::LicensePath], cancel)
            .await;
        assert!(matches!(result.get(&targets[0]), Some(Err(TargetError::Cancelled))));
    }
}
