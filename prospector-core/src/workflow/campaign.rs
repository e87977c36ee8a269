use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use super::state::CampaignState;
use crate::context::CampaignContext;
use crate::error::{ProspectorError, Result};

/// Search parameters from the `[prospecting]` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProspectingParams {
    #[serde(default, alias = "target-locations")]
    pub locations: Vec<String>,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default = "default_radius_miles")]
    pub radius_miles: f64,
    #[serde(default)]
    pub ttl_days: Option<u32>,
    #[serde(default)]
    pub overlap_threshold: Option<f64>,
}

fn default_radius_miles() -> f64 {
    10.0
}

impl Default for ProspectingParams {
    fn default() -> Self {
        Self {
            locations: Vec::new(),
            queries: Vec::new(),
            radius_miles: default_radius_miles(),
            ttl_days: None,
            overlap_threshold: None,
        }
    }
}

/// A campaign's `config.toml`, kept as a raw table so keys this crate does
/// not know about survive a load/save cycle.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CampaignDocument {
    table: Table,
}

impl CampaignDocument {
    pub fn new(name: &str, prospecting: &ProspectingParams) -> Result<Self> {
        let mut doc = Self::default();
        doc.with_campaign(|campaign| {
            campaign.insert("name".into(), Value::String(name.to_string()));
        });
        let value = Value::try_from(prospecting)?;
        doc.table.insert("prospecting".into(), value);
        doc.set_state(CampaignState::Idle, Utc::now());
        Ok(doc)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let table: Table = toml::from_str(raw)?;
        Ok(Self { table })
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(&self.table)?)
    }

    fn with_campaign(&mut self, edit: impl FnOnce(&mut Table)) {
        let mut campaign = match self.table.remove("campaign") {
            Some(Value::Table(table)) => table,
            _ => Table::new(),
        };
        edit(&mut campaign);
        self.table.insert("campaign".into(), Value::Table(campaign));
    }

    fn campaign_str(&self, key: &str) -> Option<&str> {
        self.table.get("campaign")?.get(key)?.as_str()
    }

    /// Persisted state; missing means the campaign never started.
    pub fn state(&self) -> Result<CampaignState> {
        match self.campaign_str("current_state") {
            Some(raw) => raw.parse(),
            None => Ok(CampaignState::Idle),
        }
    }

    pub fn set_state(&mut self, state: CampaignState, at: DateTime<Utc>) {
        self.with_campaign(|campaign| {
            campaign.insert("current_state".into(), Value::String(state.to_string()));
            campaign.insert(
                "updated_at".into(),
                Value::String(at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
        });
    }

    pub fn last_error(&self) -> Option<&str> {
        self.campaign_str("last_error")
    }

    pub fn failed_stage(&self) -> Result<Option<CampaignState>> {
        self.campaign_str("failed_stage").map(str::parse).transpose()
    }

    pub fn record_failure(&mut self, stage: CampaignState, error: &str) {
        self.with_campaign(|campaign| {
            campaign.insert("failed_stage".into(), Value::String(stage.to_string()));
            campaign.insert("last_error".into(), Value::String(error.to_string()));
        });
    }

    pub fn clear_failure(&mut self) {
        self.with_campaign(|campaign| {
            campaign.remove("failed_stage");
            campaign.remove("last_error");
        });
    }

    pub fn prospecting(&self) -> Result<ProspectingParams> {
        match self.table.get("prospecting") {
            Some(value) => value.clone().try_into().map_err(|err: toml::de::Error| {
                ProspectorError::Configuration(format!("invalid [prospecting]: {err}"))
            }),
            None => Ok(ProspectingParams::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.table.get(key)
    }
}

/// Loads and saves a campaign's `config.toml` through the object store.
#[derive(Clone, Debug)]
pub struct CampaignStore {
    ctx: CampaignContext,
}

impl CampaignStore {
    pub fn new(ctx: CampaignContext) -> Self {
        Self { ctx }
    }

    pub async fn load(&self) -> Result<CampaignDocument> {
        let key = self.ctx.paths().config();
        let bytes = self.ctx.store().get(&key).await?.ok_or_else(|| {
            ProspectorError::Configuration(format!(
                "campaign {} has no config at {key}",
                self.ctx.name()
            ))
        })?;
        let raw = String::from_utf8(bytes).map_err(|err| {
            ProspectorError::Configuration(format!("{key} is not UTF-8: {err}"))
        })?;
        CampaignDocument::parse(&raw)
    }

    pub async fn save(&self, doc: &CampaignDocument) -> Result<()> {
        let body = doc.to_toml_string()?;
        self.ctx
            .store()
            .put(&self.ctx.paths().config(), body.into_bytes())
            .await?;
        Ok(())
    }
}
