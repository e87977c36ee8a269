use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use super::campaign::{CampaignDocument, CampaignStore};
use super::stages::{StageActions, StageContext, StageOutcome};
use super::state::{CampaignState, TransitionTable, Trigger};
use crate::context::CampaignContext;
use crate::error::{ProspectorError, Result};

/// Drives one campaign through its lifecycle.
///
/// Every transition is written to the campaign config before the entered
/// state's action runs, so a restarted process resumes from the persisted
/// state and re-runs that action.
pub struct CampaignWorkflow {
    ctx: CampaignContext,
    store: CampaignStore,
    table: Arc<TransitionTable>,
    actions: Arc<dyn StageActions>,
    document: CampaignDocument,
    state: CampaignState,
}

impl fmt::Debug for CampaignWorkflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CampaignWorkflow")
            .field("campaign", &self.ctx.name())
            .field("state", &self.state)
            .field("actions", &self.actions)
            .finish()
    }
}

impl CampaignWorkflow {
    /// Load the persisted state of `ctx`'s campaign.
    pub async fn load(
        ctx: CampaignContext,
        table: Arc<TransitionTable>,
        actions: Arc<dyn StageActions>,
    ) -> Result<Self> {
        let store = CampaignStore::new(ctx.clone());
        let document = store.load().await?;
        let state = document.state()?;
        info!(campaign = %ctx.name(), %state, "loaded campaign workflow");
        Ok(Self {
            ctx,
            store,
            table,
            actions,
            document,
            state,
        })
    }

    pub fn state(&self) -> CampaignState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.document.last_error()
    }

    pub fn failed_stage(&self) -> Result<Option<CampaignState>> {
        self.document.failed_stage()
    }

    pub fn document(&self) -> &CampaignDocument {
        &self.document
    }

    /// Triggers accepted from the current state, including the recovery
    /// trigger when the campaign has failed.
    pub fn available_triggers(&self) -> Vec<Trigger> {
        let mut triggers = self.table.triggers_from(self.state);
        if self.state == CampaignState::Failed
            && let Ok(Some(stage)) = self.document.failed_stage()
        {
            triggers.extend(
                Trigger::ALL
                    .into_iter()
                    .filter(|t| self.table.enters(*t, stage)),
            );
            triggers.sort();
            triggers.dedup();
        }
        triggers
    }

    fn resolve(&self, trigger: Trigger) -> Result<CampaignState> {
        if let Some(dest) = self.table.next(self.state, trigger) {
            return Ok(dest);
        }
        if self.state == CampaignState::Failed
            && let Some(stage) = self.document.failed_stage()?
            && self.table.enters(trigger, stage)
        {
            return Ok(stage);
        }
        Err(ProspectorError::InvalidTransition {
            state: self.state.to_string(),
            trigger: trigger.to_string(),
        })
    }

    /// Apply `trigger`, then run stage actions until one asks to wait or a
    /// terminal state is reached. Returns the resulting state.
    ///
    /// A failing stage action moves the campaign to `failed` and is reported
    /// through [`last_error`](Self::last_error), not as an `Err`.
    pub async fn fire(&mut self, trigger: Trigger) -> Result<CampaignState> {
        if trigger == Trigger::FailCampaign {
            return self.fail("fail_campaign triggered").await;
        }
        let dest = self.resolve(trigger)?;
        self.enter(dest, trigger).await?;
        self.run_stage().await
    }

    /// Re-run the action of the persisted state, e.g. after a restart or to
    /// poll a waiting stage.
    pub async fn resume(&mut self) -> Result<CampaignState> {
        self.run_stage().await
    }

    /// Move to `failed`, recording the current stage and `reason`.
    pub async fn fail(&mut self, reason: &str) -> Result<CampaignState> {
        let stage = self.state;
        if stage.is_terminal() {
            return Err(ProspectorError::InvalidTransition {
                state: stage.to_string(),
                trigger: Trigger::FailCampaign.to_string(),
            });
        }
        error!(campaign = %self.ctx.name(), %stage, reason, "campaign failed");
        self.document.record_failure(stage, reason);
        self.enter(CampaignState::Failed, Trigger::FailCampaign).await?;
        Ok(self.state)
    }

    async fn enter(&mut self, dest: CampaignState, trigger: Trigger) -> Result<()> {
        let from = self.state;
        if from == CampaignState::Failed && dest != CampaignState::Failed {
            self.document.clear_failure();
        }
        self.document.set_state(dest, Utc::now());
        self.store.save(&self.document).await?;
        self.state = dest;
        info!(campaign = %self.ctx.name(), %from, %trigger, to = %dest, "campaign transition");
        Ok(())
    }

    async fn run_stage(&mut self) -> Result<CampaignState> {
        while !self.state.is_terminal() {
            let params = match self.document.prospecting() {
                Ok(params) => params,
                Err(err) => {
                    self.fail(&err.to_string()).await?;
                    break;
                }
            };
            let stage = StageContext {
                campaign: &self.ctx,
                params: &params,
            };
            let outcome = self.actions.run(self.state, &stage).await;

            match outcome {
                Ok(StageOutcome::Wait) => break,
                Ok(StageOutcome::Advance(trigger)) => match self.resolve(trigger) {
                    Ok(dest) => self.enter(dest, trigger).await?,
                    Err(err) => {
                        self.fail(&err.to_string()).await?;
                        break;
                    }
                },
                Err(err) => {
                    self.fail(&err.to_string()).await?;
                    break;
                }
            }
        }
        Ok(self.state)
    }
}
