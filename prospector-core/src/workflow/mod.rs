//! Campaign lifecycle.
//!
//! A campaign moves through a fixed set of states driven by named triggers.
//! The current state lives in the campaign's `config.toml` and is written
//! before the entered state's action runs, so a crash between the two leaves
//! the campaign in the new state with its action still to do. Stage actions
//! are therefore idempotent.

mod campaign;
mod machine;
mod stages;
mod state;

pub use campaign::{CampaignDocument, CampaignStore, ProspectingParams};
pub use machine::CampaignWorkflow;
pub use stages::{ProspectingStages, ScrapePlan, StageActions, StageContext, StageOutcome};
pub use state::{CAMPAIGN_EDGES, CampaignState, Transition, TransitionTable, Trigger, edge};
