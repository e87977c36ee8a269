//! Configuration for Prospector processes.
//!
//! A [`ProspectorConfig`] is read from `$PROSPECTOR_CONFIG_PATH`,
//! `$PROSPECTOR_CONFIG_JSON`, a `prospector.toml`/`prospector.json` in the
//! working directory, or falls back to defaults. A few environment variables
//! override individual fields afterwards; see
//! [`ProspectorConfig::load_from_env`].
//!
//! ```toml
//! [storage]
//! backend = "local"
//! root = "/var/lib/prospector"
//!
//! [queue.lease]
//! lease_ttl_secs = 600
//!
//! [worker]
//! campaigns = ["plumbers-tx"]
//! compaction_interval = "10m"
//!
//! [geocoding.locations]
//! "Austin, TX" = "30.2672,-97.7431"
//! ```

pub mod loader;
pub mod models;
pub mod telemetry;
pub mod validation;

pub use loader::{ConfigSource, load_dotenv};
pub use models::{GeocodingConfig, ProspectorConfig, StorageConfig, WorkerDaemonConfig};
pub use telemetry::{DEFAULT_FILTER, init_tracing};
pub use validation::ConfigValidationError;
