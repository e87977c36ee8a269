use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProspectorError, Result};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Idle,
    ImportCustomers,
    ProspectingScraping,
    ProspectingIngesting,
    ProspectingImporting,
    ProspectingEnriching,
    Outreach,
    Completed,
    Failed,
}

impl CampaignState {
    pub const ALL: [CampaignState; 9] = [
        CampaignState::Idle,
        CampaignState::ImportCustomers,
        CampaignState::ProspectingScraping,
        CampaignState::ProspectingIngesting,
        CampaignState::ProspectingImporting,
        CampaignState::ProspectingEnriching,
        CampaignState::Outreach,
        CampaignState::Completed,
        CampaignState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignState::Idle => "idle",
            CampaignState::ImportCustomers => "import_customers",
            CampaignState::ProspectingScraping => "prospecting_scraping",
            CampaignState::ProspectingIngesting => "prospecting_ingesting",
            CampaignState::ProspectingImporting => "prospecting_importing",
            CampaignState::ProspectingEnriching => "prospecting_enriching",
            CampaignState::Outreach => "outreach",
            CampaignState::Completed => "completed",
            CampaignState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignState::Completed | CampaignState::Failed)
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignState {
    type Err = ProspectorError;

    fn from_str(s: &str) -> Result<Self> {
        CampaignState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| {
                ProspectorError::Configuration(format!("unknown campaign state: {s}"))
            })
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    StartImport,
    StartProspecting,
    FinishScraping,
    FinishIngesting,
    FinishProspectingImport,
    FinishEnriching,
    StartOutreach,
    CompleteCampaign,
    FailCampaign,
}

impl Trigger {
    pub const ALL: [Trigger; 9] = [
        Trigger::StartImport,
        Trigger::StartProspecting,
        Trigger::FinishScraping,
        Trigger::FinishIngesting,
        Trigger::FinishProspectingImport,
        Trigger::FinishEnriching,
        Trigger::StartOutreach,
        Trigger::CompleteCampaign,
        Trigger::FailCampaign,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::StartImport => "start_import",
            Trigger::StartProspecting => "start_prospecting",
            Trigger::FinishScraping => "finish_scraping",
            Trigger::FinishIngesting => "finish_ingesting",
            Trigger::FinishProspectingImport => "finish_prospecting_import",
            Trigger::FinishEnriching => "finish_enriching",
            Trigger::StartOutreach => "start_outreach",
            Trigger::CompleteCampaign => "complete_campaign",
            Trigger::FailCampaign => "fail_campaign",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = ProspectorError;

    fn from_str(s: &str) -> Result<Self> {
        Trigger::ALL
            .into_iter()
            .find(|trigger| trigger.as_str() == s)
            .ok_or_else(|| ProspectorError::Configuration(format!("unknown trigger: {s}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub source: CampaignState,
    pub trigger: Trigger,
    pub dest: CampaignState,
}

pub const fn edge(source: CampaignState, trigger: Trigger, dest: CampaignState) -> Transition {
    Transition {
        source,
        trigger,
        dest,
    }
}

/// Forward edges of the campaign lifecycle. `fail_campaign` edges are added
/// for every non-terminal state by [`TransitionTable::standard`].
pub const CAMPAIGN_EDGES: &[Transition] = &[
    edge(CampaignState::Idle, Trigger::StartImport, CampaignState::ImportCustomers),
    edge(
        CampaignState::Idle,
        Trigger::StartProspecting,
        CampaignState::ProspectingScraping,
    ),
    edge(
        CampaignState::ImportCustomers,
        Trigger::StartProspecting,
        CampaignState::ProspectingScraping,
    ),
    edge(
        CampaignState::ProspectingScraping,
        Trigger::FinishScraping,
        CampaignState::ProspectingIngesting,
    ),
    edge(
        CampaignState::ProspectingIngesting,
        Trigger::FinishIngesting,
        CampaignState::ProspectingImporting,
    ),
    edge(
        CampaignState::ProspectingImporting,
        Trigger::FinishProspectingImport,
        CampaignState::ProspectingEnriching,
    ),
    edge(
        CampaignState::ProspectingEnriching,
        Trigger::FinishEnriching,
        CampaignState::Outreach,
    ),
    edge(
        CampaignState::ProspectingImporting,
        Trigger::StartOutreach,
        CampaignState::Outreach,
    ),
    edge(CampaignState::Outreach, Trigger::StartOutreach, CampaignState::Outreach),
    edge(
        CampaignState::Outreach,
        Trigger::CompleteCampaign,
        CampaignState::Completed,
    ),
];

/// Validated `(state, trigger) -> state` map.
#[derive(Clone, Debug)]
pub struct TransitionTable {
    edges: HashMap<(CampaignState, Trigger), CampaignState>,
}

impl TransitionTable {
    /// The campaign lifecycle plus a `fail_campaign` edge from every
    /// non-terminal state.
    pub fn standard() -> Result<Self> {
        let fail_edges = CampaignState::ALL
            .into_iter()
            .filter(|state| !state.is_terminal())
            .map(|state| edge(state, Trigger::FailCampaign, CampaignState::Failed));
        Self::from_edges(CAMPAIGN_EDGES.iter().copied().chain(fail_edges))
    }

    /// Build and validate a table. Rejects conflicting duplicates, edges out
    /// of terminal states, non-terminal states without a `fail_campaign`
    /// edge, and states unreachable from `idle`.
    pub fn from_edges(transitions: impl IntoIterator<Item = Transition>) -> Result<Self> {
        let mut edges = HashMap::new();
        for t in transitions {
            if t.source.is_terminal() {
                return Err(invalid_table(format!(
                    "terminal state {} has outgoing edge {}",
                    t.source, t.trigger
                )));
            }
            if let Some(existing) = edges.insert((t.source, t.trigger), t.dest)
                && existing != t.dest
            {
                return Err(invalid_table(format!(
                    "{} from {} leads to both {existing} and {}",
                    t.trigger, t.source, t.dest
                )));
            }
        }

        let table = Self { edges };
        for state in CampaignState::ALL.into_iter().filter(|s| !s.is_terminal()) {
            if table.next(state, Trigger::FailCampaign) != Some(CampaignState::Failed) {
                return Err(invalid_table(format!("{state} cannot fail_campaign")));
            }
        }

        let reachable = table.reachable_from(CampaignState::Idle);
        if let Some(orphan) = CampaignState::ALL
            .into_iter()
            .find(|state| !reachable.contains(state))
        {
            return Err(invalid_table(format!("{orphan} is unreachable from idle")));
        }
        Ok(table)
    }

    pub fn next(&self, state: CampaignState, trigger: Trigger) -> Option<CampaignState> {
        self.edges.get(&(state, trigger)).copied()
    }

    /// Triggers accepted from `state`, sorted.
    pub fn triggers_from(&self, state: CampaignState) -> Vec<Trigger> {
        let mut triggers: Vec<Trigger> = self
            .edges
            .keys()
            .filter(|(source, _)| *source == state)
            .map(|(_, trigger)| *trigger)
            .collect();
        triggers.sort();
        triggers
    }

    /// Whether some edge labelled `trigger` enters `dest`. Used to accept a
    /// manual re-trigger of a failed stage.
    pub fn enters(&self, trigger: Trigger, dest: CampaignState) -> bool {
        self.edges
            .iter()
            .any(|((_, t), d)| *t == trigger && *d == dest)
    }

    fn reachable_from(&self, start: CampaignState) -> BTreeSet<CampaignState> {
        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(state) = queue.pop_front() {
            for ((source, _), dest) in &self.edges {
                if *source == state && seen.insert(*dest) {
                    queue.push_back(*dest);
                }
            }
        }
        seen
    }
}

fn invalid_table(message: String) -> ProspectorError {
    ProspectorError::Configuration(format!("invalid transition table: {message}"))
}
