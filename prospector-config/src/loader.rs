use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tracing::debug;

use crate::models::{ProspectorConfig, StorageConfig};

const CONFIG_PATH_VAR: &str = "PROSPECTOR_CONFIG_PATH";
const CONFIG_JSON_VAR: &str = "PROSPECTOR_CONFIG_JSON";
const DATA_HOME_VAR: &str = "PROSPECTOR_DATA_HOME";
const WORKER_ID_VAR: &str = "PROSPECTOR_WORKER_ID";
const CAMPAIGNS_VAR: &str = "PROSPECTOR_CAMPAIGNS";

const DEFAULT_CANDIDATES: &[&str] = &[
    "prospector.toml",
    "prospector.json",
    "config/prospector.toml",
    "config/prospector.json",
];

/// Where the configuration was read from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl ProspectorConfig {
    /// Load configuration, then apply environment overrides.
    ///
    /// Evaluation order:
    /// 1) `$PROSPECTOR_CONFIG_PATH` (TOML or JSON file),
    /// 2) `$PROSPECTOR_CONFIG_JSON` (inline JSON),
    /// 3) the first existing default file (`prospector.toml`, ...),
    /// 4) defaults.
    ///
    /// `$PROSPECTOR_DATA_HOME` replaces the local storage root,
    /// `$PROSPECTOR_WORKER_ID` the worker id and `$PROSPECTOR_CAMPAIGNS` (comma
    /// separated) the maintained campaigns.
    pub fn load_from_env() -> anyhow::Result<(Self, ConfigSource)> {
        let (mut config, source) = Self::load_base()?;
        config.apply_env_overrides();
        Ok((config, source))
    }

    fn load_base() -> anyhow::Result<(Self, ConfigSource)> {
        if let Ok(path_str) = env::var(CONFIG_PATH_VAR)
            && !path_str.trim().is_empty()
        {
            let path = PathBuf::from(path_str);
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::EnvPath(path)));
        }

        if let Ok(raw) = env::var(CONFIG_JSON_VAR)
            && !raw.trim().is_empty()
        {
            let parsed =
                Self::parse_json(&raw).with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?;
            return Ok((parsed, ConfigSource::EnvInline));
        }

        if let Some(path) = Self::find_default_file() {
            let config = Self::load_from_file(&path)?;
            return Ok((config, ConfigSource::File(path)));
        }

        Ok((Self::default(), ConfigSource::Default))
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents)
                .with_context(|| format!("invalid config {}", path.display())),
            Some("toml") => toml::from_str(&contents)
                .map_err(|err| anyhow!("invalid config {}: {}", path.display(), err)),
            _ => Self::parse_from_str(&contents, &path.display().to_string()),
        }
    }

    /// Try TOML, then JSON.
    pub fn parse_from_str(contents: &str, origin: &str) -> anyhow::Result<Self> {
        toml::from_str(contents).or_else(|toml_err| {
            serde_json::from_str(contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse config {}: toml error: {}; json error: {}",
                    origin,
                    toml_err,
                    json_err
                )
            })
        })
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow!("invalid config json: {err}"))
    }

    fn find_default_file() -> Option<PathBuf> {
        DEFAULT_CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = env::var(DATA_HOME_VAR)
            && !root.trim().is_empty()
        {
            match &mut self.storage {
                StorageConfig::Local { root: current } => *current = PathBuf::from(root),
                other => {
                    debug!(backend = other.backend_name(), "{DATA_HOME_VAR} ignored for non-local storage");
                }
            }
        }

        if let Ok(id) = env::var(WORKER_ID_VAR)
            && !id.trim().is_empty()
        {
            self.worker.worker_id = Some(id.trim().to_string());
        }

        if let Some(campaigns) = parse_csv_var(CAMPAIGNS_VAR) {
            self.worker.campaigns = campaigns;
        }
    }
}

/// Read `.env` from the working directory if present. Returns whether a file
/// was loaded.
pub fn load_dotenv() -> anyhow::Result<bool> {
    match dotenvy::dotenv() {
        Ok(_) => Ok(true),
        Err(dotenvy::Error::Io(_)) => Ok(false),
        Err(err) => Err(err).context("failed to parse .env"),
    }
}

fn parse_csv_var(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    })
}
