//! Location name to coordinates.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::context::slugify;
use crate::coverage::GeoPoint;
use crate::error::Result;

#[async_trait]
pub trait Geocoder: Send + Sync + std::fmt::Debug {
    /// `Ok(None)` when the location is unknown to this geocoder.
    async fn geocode(&self, location: &str) -> Result<Option<GeoPoint>>;
}

/// Fixed lookup table, keyed by slugged location name. Also accepts literal
/// `"lat,lon"` strings.
#[derive(Clone, Debug, Default)]
pub struct StaticGeocoder {
    known: HashMap<String, GeoPoint>,
}

impl StaticGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, location: &str, point: GeoPoint) -> Self {
        self.insert(location, point);
        self
    }

    pub fn insert(&mut self, location: &str, point: GeoPoint) {
        self.known.insert(slugify(location), point);
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn geocode(&self, location: &str) -> Result<Option<GeoPoint>> {
        if let Ok(point) = location.parse::<GeoPoint>() {
            return Ok(Some(point));
        }
        Ok(self.known.get(&slugify(location)).copied())
    }
}
