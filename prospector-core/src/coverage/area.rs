use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::geometry::{Bounds, TileId};

/// One coverage entry as stored on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScrapedArea {
    pub phrase: String,
    pub scrape_date: DateTime<Utc>,
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_miles: f64,
    pub lon_miles: f64,
    pub items_found: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_id: Option<TileId>,
}

impl ScrapedArea {
    pub fn bounds(&self) -> Bounds {
        Bounds {
            lat_min: self.lat_min,
            lat_max: self.lat_max,
            lon_min: self.lon_min,
            lon_max: self.lon_max,
        }
    }

    /// Entries older than `ttl_days` are ignored; `None` never expires.
    pub fn is_fresh(&self, ttl_days: Option<u32>, now: DateTime<Utc>) -> bool {
        match ttl_days {
            None => true,
            Some(days) => now - self.scrape_date <= Duration::days(i64::from(days)),
        }
    }
}

/// Request to record a scraped rectangle.
#[derive(Clone, Debug)]
pub struct NewArea {
    pub phrase: String,
    pub bounds: Bounds,
    pub lat_miles: f64,
    pub lon_miles: f64,
    pub items_found: u32,
    pub scrape_date: Option<DateTime<Utc>>,
    pub tile_id: Option<TileId>,
}

impl NewArea {
    pub fn new(phrase: impl Into<String>, bounds: Bounds, items_found: u32) -> Self {
        let (lat_miles, lon_miles) = bounds.size_miles();
        Self {
            phrase: phrase.into(),
            bounds,
            lat_miles,
            lon_miles,
            items_found,
            scrape_date: None,
            tile_id: None,
        }
    }

    /// Grid-aligned entry; bounds and size come from the tile.
    pub fn for_tile(phrase: impl Into<String>, tile: TileId, items_found: u32) -> Self {
        let mut area = Self::new(phrase, tile.bounds(), items_found);
        area.tile_id = Some(tile);
        area
    }

    pub fn size_miles(mut self, lat_miles: f64, lon_miles: f64) -> Self {
        self.lat_miles = lat_miles;
        self.lon_miles = lon_miles;
        self
    }

    pub fn scraped_at(mut self, date: DateTime<Utc>) -> Self {
        self.scrape_date = Some(date);
        self
    }
}

/// Names carry five decimals, so they sit within half of this of the
/// stored bounds.
const NAME_ROUNDING_DEGREES: f64 = 1e-5;

/// What a coverage filename says about its contents, readable without
/// opening the file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AreaFileName {
    /// `{lat_min}_{lat_max}_{lon_min}_{lon_max}.json`, five decimals each.
    Bounds(Bounds),
    /// `{tile_id}.json`, valid only for grid-aligned tiles.
    Tile(TileId),
}

impl AreaFileName {
    pub fn file_name(&self) -> String {
        match self {
            AreaFileName::Bounds(b) => format!(
                "{:.5}_{:.5}_{:.5}_{:.5}.json",
                b.lat_min, b.lat_max, b.lon_min, b.lon_max
            ),
            AreaFileName::Tile(tile) => format!("{tile}.json"),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".json")?;
        let parts: Vec<&str> = stem.split('_').collect();
        match parts.len() {
            4 => {
                let mut values = [0f64; 4];
                for (slot, part) in values.iter_mut().zip(&parts) {
                    *slot = part.parse().ok()?;
                }
                let bounds =
                    Bounds::new(values[0], values[1], values[2], values[3]).ok()?;
                Some(AreaFileName::Bounds(bounds))
            }
            2 => stem.parse().ok().map(AreaFileName::Tile),
            _ => None,
        }
    }

    pub fn bounds(&self) -> Bounds {
        match self {
            AreaFileName::Bounds(bounds) => *bounds,
            AreaFileName::Tile(tile) => tile.bounds(),
        }
    }

    /// Bounds widened by one unit of the name's last decimal on every side.
    /// Always contains the stored bounds the name was rounded from.
    pub fn covering_bounds(&self) -> Bounds {
        let b = self.bounds();
        Bounds {
            lat_min: b.lat_min - NAME_ROUNDING_DEGREES,
            lat_max: b.lat_max + NAME_ROUNDING_DEGREES,
            lon_min: b.lon_min - NAME_ROUNDING_DEGREES,
            lon_max: b.lon_max + NAME_ROUNDING_DEGREES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_names_use_five_decimals() {
        let bounds = Bounds::new(30.1, 30.2, -97.8, -97.7).unwrap();
        let name = AreaFileName::Bounds(bounds).file_name();
        assert_eq!(name, "30.10000_30.20000_-97.80000_-97.70000.json");
        assert_eq!(AreaFileName::parse(&name), Some(AreaFileName::Bounds(bounds)));
    }

    #[test]
    fn tile_names_parse_to_tile_bounds() {
        let parsed = AreaFileName::parse("30.1_-97.8.json").unwrap();
        let bounds = parsed.bounds();
        assert!((bounds.lat_min - 30.1).abs() < 1e-9);
        assert!((bounds.lon_max - -97.7).abs() < 1e-9);
    }

    #[test]
    fn covering_bounds_contain_the_unrounded_rectangle() {
        let exact = Bounds::new(30.123456, 30.123466, -97.700004, -97.699994).unwrap();
        let parsed = AreaFileName::parse(&AreaFileName::Bounds(exact).file_name()).unwrap();
        let rounded = parsed.bounds();
        assert!(rounded.coverage_of(&exact) < 100.0);
        assert_eq!(parsed.covering_bounds().coverage_of(&exact), 100.0);
    }

    #[test]
    fn malformed_names_are_rejected() {
        for name in [
            "notes.txt",
            "30.1_30.2_-97.8.json",
            "a_b_c_d.json",
            "30.2_30.1_-97.8_-97.7.json",
            ".json",
        ] {
            assert_eq!(AreaFileName::parse(name), None, "{name}");
        }
    }

    #[test]
    fn freshness_is_inclusive_of_ttl() {
        let now = Utc::now();
        let area = ScrapedArea {
            phrase: "tow-trucks".into(),
            scrape_date: now - Duration::days(30),
            lat_min: 30.0,
            lat_max: 30.1,
            lon_min: -97.8,
            lon_max: -97.7,
            lat_miles: 6.9,
            lon_miles: 6.0,
            items_found: 3,
            tile_id: None,
        };
        assert!(area.is_fresh(Some(30), now));
        assert!(!area.is_fresh(Some(29), now));
        assert!(area.is_fresh(None, now));
    }
}
