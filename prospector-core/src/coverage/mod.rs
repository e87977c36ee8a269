//! Geospatial record of which rectangles have been scraped for which phrase.
//!
//! Entries are partitioned by slugged phrase and by the integer-degree cell
//! of their south-west corner. A lookup scans the nine cells around the query
//! centre and decides from filenames alone whether a file can match, so only
//! candidates that pass the overlap test are ever opened.

mod area;
mod geometry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use area::{AreaFileName, NewArea, ScrapedArea};
pub use geometry::{
    Bounds, GeoPoint, GridCell, MILES_PER_DEGREE_LAT, TILE_SIZE_DEGREES, TileId,
    miles_per_degree_lon,
};

use crate::context::{DataPaths, slugify};
use crate::error::Result;
use crate::storage::ObjectStore;

/// Partition holding areas that returned nothing. Slugs never start with `_`,
/// so this cannot collide with a real phrase.
pub const WILDERNESS_PHRASE: &str = "_wilderness";

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Minimum share of the query (percent) an entry must cover to count.
    pub overlap_threshold_percent: f64,
    /// Entries older than this are ignored. `None` keeps them forever.
    pub ttl_days: Option<u32>,
    /// Threshold used for wilderness lookups.
    pub wilderness_threshold_percent: f64,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            overlap_threshold_percent: 60.0,
            ttl_days: Some(30),
            wilderness_threshold_percent: 60.0,
        }
    }
}

/// A stored area satisfying a lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct AreaMatch {
    pub key: String,
    pub area: ScrapedArea,
    pub overlap_percent: f64,
}

/// All areas stored for a phrase, with the number of files that could not
/// be used.
#[derive(Clone, Debug, Default)]
pub struct PhraseCoverage {
    pub areas: Vec<ScrapedArea>,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct CoverageIndex {
    store: Arc<dyn ObjectStore>,
    paths: DataPaths,
    config: CoverageConfig,
}

impl std::fmt::Debug for CoverageIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoverageIndex")
            .field("root", &self.paths.scraped_areas())
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish()
    }
}

impl CoverageIndex {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        paths: DataPaths,
        config: CoverageConfig,
    ) -> Self {
        Self {
            store,
            paths,
            config,
        }
    }

    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    fn phrase_dir(phrase: &str) -> String {
        if phrase == WILDERNESS_PHRASE {
            WILDERNESS_PHRASE.to_string()
        } else {
            slugify(phrase)
        }
    }

    fn cell_prefix(&self, phrase_dir: &str, cell: GridCell) -> String {
        format!(
            "{}/{phrase_dir}/{}",
            self.paths.scraped_areas(),
            cell.dir_name()
        )
    }

    fn key_for(&self, phrase_dir: &str, name: &AreaFileName) -> String {
        let corner = name.bounds();
        let cell = match name {
            AreaFileName::Tile(tile) => tile.cell(),
            AreaFileName::Bounds(_) => {
                GridCell::containing(corner.lat_min, corner.lon_min)
            }
        };
        format!("{}/{}", self.cell_prefix(phrase_dir, cell), name.file_name())
    }

    /// Record a scraped rectangle. Returns the key written, or `None` when
    /// the write failed; failures are logged and never retried.
    pub async fn add_area(&self, request: NewArea) -> Option<String> {
        let phrase_dir = Self::phrase_dir(&request.phrase);
        if phrase_dir.is_empty() {
            warn!(phrase = %request.phrase, "refusing to index an empty phrase");
            return None;
        }
        let name = match request.tile_id {
            Some(tile) => AreaFileName::Tile(tile),
            None => AreaFileName::Bounds(request.bounds),
        };
        let key = self.key_for(&phrase_dir, &name);
        let entry = ScrapedArea {
            phrase: phrase_dir,
            scrape_date: request.scrape_date.unwrap_or_else(Utc::now),
            lat_min: request.bounds.lat_min,
            lat_max: request.bounds.lat_max,
            lon_min: request.bounds.lon_min,
            lon_max: request.bounds.lon_max,
            lat_miles: request.lat_miles,
            lon_miles: request.lon_miles,
            items_found: request.items_found,
            tile_id: request.tile_id,
        };

        let body = match serde_json::to_vec_pretty(&entry) {
            Ok(body) => body,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to serialize scraped area");
                return None;
            }
        };
        match self.store.put(&key, body).await {
            Ok(()) => {
                debug!(key = %key, items = entry.items_found, "recorded scraped area");
                Some(key)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "failed to record scraped area");
                None
            }
        }
    }

    /// First fresh stored area covering at least `threshold_percent` of
    /// `bounds`.
    pub async fn is_area_scraped(
        &self,
        phrase: &str,
        bounds: &Bounds,
        ttl_days: Option<u32>,
        threshold_percent: f64,
    ) -> Result<Option<AreaMatch>> {
        self.is_area_scraped_at(phrase, bounds, ttl_days, threshold_percent, Utc::now())
            .await
    }

    pub async fn is_area_scraped_at(
        &self,
        phrase: &str,
        bounds: &Bounds,
        ttl_days: Option<u32>,
        threshold_percent: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<AreaMatch>> {
        if bounds.area() <= 0.0 {
            return Ok(None);
        }
        let phrase_dir = Self::phrase_dir(phrase);
        if phrase_dir.is_empty() {
            return Ok(None);
        }

        let center = bounds.center();
        let home = GridCell::containing(center.latitude, center.longitude);
        for cell in home.neighborhood() {
            let prefix = self.cell_prefix(&phrase_dir, cell);
            for meta in self.store.list(&prefix).await? {
                let Some(name) = AreaFileName::parse(meta.file_name()) else {
                    debug!(key = %meta.key, "skipping unrecognised coverage file");
                    continue;
                };
                // The widened name overstates coverage, never understates it.
                let approx = name.covering_bounds().coverage_of(bounds);
                if approx <= 0.0 || approx < threshold_percent {
                    continue;
                }

                let Some(area) = self.load_area(&meta.key).await? else {
                    continue;
                };
                if !area.is_fresh(ttl_days, now) {
                    continue;
                }
                let overlap_area = area.bounds().overlap_area(bounds);
                let overlap_percent = area.bounds().coverage_of(bounds);
                if overlap_area <= 0.0 || overlap_percent < threshold_percent {
                    continue;
                }
                return Ok(Some(AreaMatch {
                    key: meta.key,
                    area,
                    overlap_percent,
                }));
            }
        }
        Ok(None)
    }

    /// Exact lookup of a grid-aligned entry.
    pub async fn is_tile_scraped(
        &self,
        phrase: &str,
        tile: TileId,
        ttl_days: Option<u32>,
    ) -> Result<Option<ScrapedArea>> {
        self.is_tile_scraped_at(phrase, tile, ttl_days, Utc::now()).await
    }

    pub async fn is_tile_scraped_at(
        &self,
        phrase: &str,
        tile: TileId,
        ttl_days: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Option<ScrapedArea>> {
        let phrase_dir = Self::phrase_dir(phrase);
        if phrase_dir.is_empty() {
            return Ok(None);
        }
        let key = self.key_for(&phrase_dir, &AreaFileName::Tile(tile));
        Ok(self
            .load_area(&key)
            .await?
            .filter(|area| area.is_fresh(ttl_days, now)))
    }

    /// Whether a rectangle is known to contain nothing, for any phrase.
    pub async fn is_wilderness_area(
        &self,
        bounds: &Bounds,
    ) -> Result<Option<AreaMatch>> {
        self.is_area_scraped(
            WILDERNESS_PHRASE,
            bounds,
            None,
            self.config.wilderness_threshold_percent,
        )
        .await
    }

    /// Record a finished scrape. Empty results go to the wilderness
    /// partition so later lookups for any phrase can skip the area.
    pub async fn mark_scraped(&self, request: NewArea) -> Option<String> {
        if request.items_found == 0 {
            info!(phrase = %request.phrase, "no results; marking area as wilderness");
            let mut wilderness = request;
            wilderness.phrase = WILDERNESS_PHRASE.to_string();
            return self.add_area(wilderness).await;
        }
        self.add_area(request).await
    }

    /// False when the rectangle is wilderness or already covered for
    /// `phrase` under the configured threshold and TTL.
    pub async fn should_scrape(&self, phrase: &str, bounds: &Bounds) -> Result<bool> {
        if let Some(hit) = self.is_wilderness_area(bounds).await? {
            debug!(key = %hit.key, "skipping wilderness area");
            return Ok(false);
        }
        let covered = self
            .is_area_scraped(
                phrase,
                bounds,
                self.config.ttl_days,
                self.config.overlap_threshold_percent,
            )
            .await?;
        Ok(covered.is_none())
    }

    /// Every stored area for a phrase, in key order.
    pub async fn areas_for_phrase(&self, phrase: &str) -> Result<PhraseCoverage> {
        let phrase_dir = Self::phrase_dir(phrase);
        let mut coverage = PhraseCoverage::default();
        if phrase_dir.is_empty() {
            return Ok(coverage);
        }
        let prefix = format!("{}/{phrase_dir}", self.paths.scraped_areas());
        for meta in self.store.list(&prefix).await? {
            if AreaFileName::parse(meta.file_name()).is_none() {
                coverage.skipped += 1;
                continue;
            }
            match self.load_area(&meta.key).await? {
                Some(area) => coverage.areas.push(area),
                None => coverage.skipped += 1,
            }
        }
        Ok(coverage)
    }

    async fn load_area(&self, key: &str) -> Result<Option<ScrapedArea>> {
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<ScrapedArea>(&bytes) {
            Ok(area) => Ok(Some(area)),
            Err(err) => {
                warn!(key = %key, error = %err, "skipping unreadable coverage file");
                Ok(None)
            }
        }
    }
}
