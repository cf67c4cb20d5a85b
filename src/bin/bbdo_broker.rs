//! bbdo-broker: monitoring event broker
//!
//! Accepts events from pollers and feeds them to storage and other
//! brokers over BBDO.
//!
//! ## Architecture
//! ```text
//! [poller] --(BBDO)--> [input] --> [engine] --> [output] --(BBDO)--> [central]
//!                                      |
//!                                      +------> [output] --(file)--> archive
//! ```
//!
//! ## Configuration
//! - First argument or BROKER_CONFIG: YAML configuration file
//! - BROKER__*: overrides, e.g. BROKER__SHUTDOWN_TIMEOUT_MS=5000
//! - BROKER_LOG: tracing filter (default: info)
//!
//! SIGHUP reloads the endpoint list; SIGTERM or Ctrl-C stops the broker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use bbdo_broker::events::builtin_catalogue;
use bbdo_broker::utils::bootstrap::{init_tracing, shutdown_signal, ReloadSignal};
use bbdo_broker::{Broker, Config};

const REAP_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    let catalogue = Arc::new(builtin_catalogue()?);

    let mut broker = Broker::start(config, catalogue).await?;
    info!(endpoints = broker.status().len(), "bbdo-broker started");

    let mut reload = ReloadSignal::new()?;
    let mut reap = tokio::time::interval(REAP_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = reap.tick() => {
                let failed = broker.reap().await.iter().filter(|r| r.is_failure()).count();
                if failed > 0 {
                    error!(failed, "Endpoints gave up; reload to restart them");
                }
            }
            _ = reload.recv() => {
                info!("Reloading configuration");
                match Config::load(path.as_deref()) {
                    Ok(config) => {
                        if let Err(e) = broker.apply(config.endpoints).await {
                            error!(error = %e, "Reload incomplete");
                        }
                    }
                    Err(e) => error!(error = %e, "Configuration rejected, keeping current endpoints"),
                }
            }
        }
    }

    let reports = broker.shutdown().await;
    info!(endpoints = reports.len(), "bbdo-broker stopped");
    Ok(())
}
