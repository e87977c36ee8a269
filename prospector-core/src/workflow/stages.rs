use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::campaign::ProspectingParams;
use super::state::{CampaignState, Trigger};
use crate::context::{CampaignContext, slugify};
use crate::coverage::CoverageIndex;
use crate::error::{ProspectorError, Result};
use crate::geocode::Geocoder;
use crate::planning::generate_grid;
use crate::queue::{
    DETAILS_QUEUE, DetailsTask, ENRICHMENT_QUEUE, EnrichmentTask, ObjectStoreQueue, QueueConfig,
    SCRAPE_QUEUE, ScrapeTask, TaskPayload, TaskQueue,
};
use crate::records::{RecordLog, RecordLogConfig};

/// What a stage action asks the workflow to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Fire this trigger immediately.
    Advance(Trigger),
    /// Stay in the current state until re-run or triggered externally.
    Wait,
}

/// Inputs available to a stage action.
#[derive(Debug)]
pub struct StageContext<'a> {
    pub campaign: &'a CampaignContext,
    pub params: &'a ProspectingParams,
}

/// Side effects run on entering a state. Must be idempotent: a restart
/// re-runs the action of the persisted state.
#[async_trait]
pub trait StageActions: Send + Sync + fmt::Debug {
    async fn run(&self, state: CampaignState, stage: &StageContext<'_>) -> Result<StageOutcome>;
}

/// Counts from one pass of the scraping stage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScrapePlan {
    pub tiles: usize,
    pub enqueued: usize,
    pub already_queued: usize,
    pub covered: usize,
    pub unknown_locations: usize,
}

/// Stage actions of the prospecting pipeline.
#[derive(Clone, Debug)]
pub struct ProspectingStages {
    geocoder: Arc<dyn Geocoder>,
    coverage: CoverageIndex,
    queue_config: QueueConfig,
    records_config: RecordLogConfig,
}

impl ProspectingStages {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        coverage: CoverageIndex,
        queue_config: QueueConfig,
        records_config: RecordLogConfig,
    ) -> Self {
        Self {
            geocoder,
            coverage,
            queue_config,
            records_config,
        }
    }

    fn queue(&self, campaign: &CampaignContext, name: &str) -> ObjectStoreQueue {
        ObjectStoreQueue::new(campaign, name, self.queue_config.clone())
    }

    /// Push a scrape task for every (tile, phrase) not already covered.
    pub async fn plan_scrapes(&self, stage: &StageContext<'_>) -> Result<ScrapePlan> {
        let params = stage.params;
        if params.locations.is_empty() || params.queries.is_empty() {
            return Err(ProspectorError::Configuration(format!(
                "campaign {} needs prospecting locations and queries",
                stage.campaign.name()
            )));
        }

        let defaults = self.coverage.config();
        let ttl_days = params.ttl_days.or(defaults.ttl_days);
        let threshold = params
            .overlap_threshold
            .unwrap_or(defaults.overlap_threshold_percent);
        let queue = self.queue(stage.campaign, SCRAPE_QUEUE);
        let mut plan = ScrapePlan::default();

        for location in &params.locations {
            let Some(point) = self.geocoder.geocode(location).await? else {
                warn!(campaign = %stage.campaign.name(), %location, "location could not be geocoded");
                plan.unknown_locations += 1;
                continue;
            };

            for tile in generate_grid(point, params.radius_miles) {
                plan.tiles += 1;
                if self.coverage.is_wilderness_area(&tile.bounds).await?.is_some() {
                    plan.covered += params.queries.len();
                    continue;
                }
                for phrase in &params.queries {
                    let covered = self.coverage.is_tile_scraped(phrase, tile.id, ttl_days).await?.is_some()
                        || self
                            .coverage
                            .is_area_scraped(phrase, &tile.bounds, ttl_days, threshold)
                            .await?
                            .is_some();
                    if covered {
                        plan.covered += 1;
                        continue;
                    }

                    let task = TaskPayload::Scrape(ScrapeTask {
                        campaign: stage.campaign.name().to_string(),
                        phrase: phrase.clone(),
                        latitude: tile.center.latitude,
                        longitude: tile.center.longitude,
                        tile_id: Some(tile.id.to_string()),
                        radius_miles: None,
                        ttl_days,
                        force_refresh: false,
                    });
                    if queue.push(task).await?.accepted() {
                        plan.enqueued += 1;
                    } else {
                        plan.already_queued += 1;
                    }
                }
            }
        }

        if plan.tiles == 0 {
            return Err(ProspectorError::StageFailure {
                stage: CampaignState::ProspectingScraping.to_string(),
                message: "none of the campaign locations could be geocoded".to_string(),
            });
        }
        info!(
            campaign = %stage.campaign.name(),
            tiles = plan.tiles,
            enqueued = plan.enqueued,
            already_queued = plan.already_queued,
            covered = plan.covered,
            "planned scrape tasks"
        );
        Ok(plan)
    }

    async fn scraping(&self, stage: &StageContext<'_>) -> Result<StageOutcome> {
        self.plan_scrapes(stage).await?;
        let stats = self.queue(stage.campaign, SCRAPE_QUEUE).stats().await?;
        // Failed tiles are settled; re-planning does not re-drive them.
        if stats.outstanding() == 0 {
            if stats.failed > 0 {
                warn!(campaign = %stage.campaign.name(), failed = stats.failed, "scraping finished with failed tiles");
            }
            Ok(StageOutcome::Advance(Trigger::FinishScraping))
        } else {
            debug!(campaign = %stage.campaign.name(), outstanding = stats.outstanding(), "scrape queue still busy");
            Ok(StageOutcome::Wait)
        }
    }

    async fn ingesting(&self, stage: &StageContext<'_>) -> Result<StageOutcome> {
        let log = RecordLog::new(stage.campaign.clone(), self.records_config);
        match log.compact().await {
            Ok(_) => Ok(StageOutcome::Advance(Trigger::FinishIngesting)),
            Err(ProspectorError::CompactionLocked { owner, .. }) => {
                debug!(campaign = %stage.campaign.name(), %owner, "compaction in progress elsewhere");
                Ok(StageOutcome::Wait)
            }
            Err(err) => Err(err),
        }
    }

    async fn importing(&self, stage: &StageContext<'_>) -> Result<StageOutcome> {
        let log = RecordLog::new(stage.campaign.clone(), self.records_config);
        let snapshot = log.read_all().await?;
        let enrichment = self.queue(stage.campaign, ENRICHMENT_QUEUE);
        let details = self.queue(stage.campaign, DETAILS_QUEUE);
        let campaign = stage.campaign.name().to_string();

        let mut enrich_pushed = 0usize;
        let mut details_pushed = 0usize;
        for record in snapshot.records.values() {
            if let Some(domain) = record.domain.as_deref().filter(|d| !d.trim().is_empty()) {
                let company = record.name.as_deref().unwrap_or(domain);
                let task = TaskPayload::Enrichment(EnrichmentTask {
                    campaign: campaign.clone(),
                    domain: domain.to_string(),
                    company_slug: slugify(company),
                    force_refresh: false,
                });
                if enrichment.push(task).await?.accepted() {
                    enrich_pushed += 1;
                }
            }
            if record.is_hollow()
                && let Some(place_id) = record.place_id.as_deref()
            {
                let task = TaskPayload::Details(DetailsTask {
                    campaign: campaign.clone(),
                    place_id: place_id.to_string(),
                    name: record.name.clone(),
                });
                if details.push(task).await?.accepted() {
                    details_pushed += 1;
                }
            }
        }

        info!(
            campaign = %campaign,
            records = snapshot.len(),
            enrichment = enrich_pushed,
            details = details_pushed,
            "queued follow-up work for imported records"
        );
        Ok(StageOutcome::Advance(Trigger::FinishProspectingImport))
    }

    async fn enriching(&self, stage: &StageContext<'_>) -> Result<StageOutcome> {
        let stats = self.queue(stage.campaign, ENRICHMENT_QUEUE).stats().await?;
        if stats.outstanding() == 0 {
            Ok(StageOutcome::Advance(Trigger::FinishEnriching))
        } else {
            Ok(StageOutcome::Wait)
        }
    }
}

#[async_trait]
impl StageActions for ProspectingStages {
    async fn run(&self, state: CampaignState, stage: &StageContext<'_>) -> Result<StageOutcome> {
        match state {
            CampaignState::ImportCustomers => Ok(StageOutcome::Advance(Trigger::StartProspecting)),
            CampaignState::ProspectingScraping => self.scraping(stage).await,
            CampaignState::ProspectingIngesting => self.ingesting(stage).await,
            CampaignState::ProspectingImporting => self.importing(stage).await,
            CampaignState::ProspectingEnriching => self.enriching(stage).await,
            CampaignState::Idle
            | CampaignState::Outreach
            | CampaignState::Completed
            | CampaignState::Failed => Ok(StageOutcome::Wait),
        }
    }
}
