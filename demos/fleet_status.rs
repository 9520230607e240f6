use std::error::Error;

use flexstat::tcp::{DaemonProfile, MockLicenseServer};
use flexstat::{Fleet, FleetConfig, FleetOptions, QueryKind, ServerTarget};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // With a config path, query the configured fleet. Without one, query a
    // scripted manager on localhost.
    let (targets, kinds, options) = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading fleet config from {}", path);
            let config = FleetConfig::load(&path)?;
            let options = config.options();
            (config.targets, config.queries, options)
        }
        None => {
            let server = MockLicenseServer::bind("127.0.0.1:0").await?;
            let addr = server.local_addr()?;
            let profile = DaemonProfile {
                hostname: "127.0.0.1".into(),
                license_path: "/opt/flexlm/licenses/license.dat".into(),
                ..DaemonProfile::default()
            };
            server.spawn(profile.into_handler());
            info!("Started scripted license manager on {}", addr);

            (
                vec![ServerTarget::new(addr.ip().to_string(), addr.port())],
                vec![QueryKind::LicensePath, QueryKind::VendorList],
                FleetOptions::default(),
            )
        }
    };

    let fleet = Fleet::new(options);
    let result = fleet.run(&targets, &kinds).await;
    info!(
        "{} of {} license servers answered",
        result.succeeded(),
        result.len()
    );

    println!("{}", serde_json::to_string_pretty(&result.report())?);
    Ok(())
}
