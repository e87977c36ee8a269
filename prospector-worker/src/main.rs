//! `prospector-worker`: keeps the shared store healthy for a set of campaigns.
//!
//! Returns expired leases to their queues, compacts record logs and re-runs
//! waiting workflow stages until interrupted.

mod daemon;

use prospector_config::{ConfigSource, DEFAULT_FILTER, ProspectorConfig, init_tracing, load_dotenv};
use tracing::{error, info};

use crate::daemon::Daemon;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file_loaded = load_dotenv()?;
    let (config, source) = ProspectorConfig::load_from_env()?;
    init_tracing(DEFAULT_FILTER)?;

    if env_file_loaded {
        info!("loaded .env file");
    }
    match &source {
        ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!(path = %path.display(), "loaded configuration file");
        }
        ConfigSource::EnvInline => info!("loaded configuration from PROSPECTOR_CONFIG_JSON"),
        ConfigSource::Default => info!("no configuration file found; using defaults"),
    }

    if let Err(err) = config.validate() {
        for problem in &err.problems {
            error!("{problem}");
        }
        return Err(err.into());
    }

    let store = config.storage.open().await?;
    info!(
        backend = config.storage.backend_name(),
        campaigns = config.worker.campaigns.len(),
        "opened object store"
    );

    let mut daemon = Daemon::new(config, store);
    daemon.start()?;

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    daemon.shutdown().await;
    Ok(())
}
