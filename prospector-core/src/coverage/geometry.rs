use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProspectorError, Result};

/// Statute miles per degree of latitude.
pub const MILES_PER_DEGREE_LAT: f64 = 69.0;

/// Edge length of a grid tile in degrees.
pub const TILE_SIZE_DEGREES: f64 = 0.1;

/// Axis-aligned lat/lon rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}

impl Bounds {
    pub fn new(
        lat_min: f64,
        lat_max: f64,
        lon_min: f64,
        lon_max: f64,
    ) -> Result<Self> {
        let finite = [lat_min, lat_max, lon_min, lon_max]
            .iter()
            .all(|v| v.is_finite());
        if !finite || lat_min > lat_max || lon_min > lon_max {
            return Err(ProspectorError::InvalidBounds(format!(
                "lat {lat_min}..{lat_max}, lon {lon_min}..{lon_max}"
            )));
        }
        Ok(Self {
            lat_min,
            lat_max,
            lon_min,
            lon_max,
        })
    }

    /// Square box around a point, `radius_miles` from the centre to each edge.
    pub fn around(center: GeoPoint, radius_miles: f64) -> Result<Self> {
        let lat_delta = radius_miles / MILES_PER_DEGREE_LAT;
        let lon_delta = radius_miles / miles_per_degree_lon(center.latitude);
        Self::new(
            center.latitude - lat_delta,
            center.latitude + lat_delta,
            center.longitude - lon_delta,
            center.longitude + lon_delta,
        )
    }

    /// Area in square degrees.
    pub fn area(&self) -> f64 {
        (self.lat_max - self.lat_min) * (self.lon_max - self.lon_min)
    }

    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            latitude: (self.lat_min + self.lat_max) / 2.0,
            longitude: (self.lon_min + self.lon_max) / 2.0,
        }
    }

    /// Area of the intersection. Touching edges give zero.
    pub fn overlap_area(&self, other: &Bounds) -> f64 {
        let lat = (self.lat_max.min(other.lat_max)
            - self.lat_min.max(other.lat_min))
        .max(0.0);
        let lon = (self.lon_max.min(other.lon_max)
            - self.lon_min.max(other.lon_min))
        .max(0.0);
        lat * lon
    }

    /// Share of `query` covered by `self`, in percent.
    pub fn coverage_of(&self, query: &Bounds) -> f64 {
        let query_area = query.area();
        if query_area <= 0.0 {
            return 0.0;
        }
        self.overlap_area(query) / query_area * 100.0
    }

    /// Height and width in miles, measured at the box centre.
    pub fn size_miles(&self) -> (f64, f64) {
        let lat_miles = (self.lat_max - self.lat_min) * MILES_PER_DEGREE_LAT;
        let lon_miles = (self.lon_max - self.lon_min)
            * miles_per_degree_lon(self.center().latitude);
        (lat_miles, lon_miles)
    }
}

pub fn miles_per_degree_lon(latitude: f64) -> f64 {
    (MILES_PER_DEGREE_LAT * latitude.to_radians().cos()).max(f64::EPSILON)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl FromStr for GeoPoint {
    type Err = ProspectorError;

    /// Parses a `"lat,lon"` literal.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            ProspectorError::InvalidBounds(format!("not a coordinate pair: {s}"))
        };
        let (lat, lon) = s.split_once(',').ok_or_else(invalid)?;
        let latitude: f64 = lat.trim().parse().map_err(|_| invalid())?;
        let longitude: f64 = lon.trim().parse().map_err(|_| invalid())?;
        if !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return Err(invalid());
        }
        Ok(Self::new(latitude, longitude))
    }
}

/// Integer-degree bucket that coverage files are partitioned into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCell {
    pub lat: i32,
    pub lon: i32,
}

impl GridCell {
    pub fn containing(lat: f64, lon: f64) -> Self {
        Self {
            lat: lat.floor() as i32,
            lon: lon.floor() as i32,
        }
    }

    /// The cell and its eight neighbours, row by row from the south-west.
    pub fn neighborhood(&self) -> [GridCell; 9] {
        let mut cells = [*self; 9];
        let mut idx = 0;
        for dlat in -1..=1 {
            for dlon in -1..=1 {
                cells[idx] = GridCell {
                    lat: self.lat + dlat,
                    lon: self.lon + dlon,
                };
                idx += 1;
            }
        }
        cells
    }

    pub fn dir_name(&self) -> String {
        format!("lat{}_lon{}", self.lat, self.lon)
    }
}

/// 0.1 degree tile named by its south-west corner, e.g. `30.1_-97.8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    lat_tenths: i32,
    lon_tenths: i32,
}

impl TileId {
    pub fn from_tenths(lat_tenths: i32, lon_tenths: i32) -> Self {
        Self {
            lat_tenths,
            lon_tenths,
        }
    }

    /// Tile containing a point.
    pub fn containing(point: GeoPoint) -> Self {
        Self::from_tenths(
            to_tenths_floor(point.latitude),
            to_tenths_floor(point.longitude),
        )
    }

    pub fn lat_tenths(&self) -> i32 {
        self.lat_tenths
    }

    pub fn lon_tenths(&self) -> i32 {
        self.lon_tenths
    }

    pub fn bounds(&self) -> Bounds {
        let lat_min = f64::from(self.lat_tenths) / 10.0;
        let lon_min = f64::from(self.lon_tenths) / 10.0;
        Bounds {
            lat_min,
            lat_max: f64::from(self.lat_tenths + 1) / 10.0,
            lon_min,
            lon_max: f64::from(self.lon_tenths + 1) / 10.0,
        }
    }

    /// Integer-degree cell holding this tile's coverage file.
    pub fn cell(&self) -> GridCell {
        GridCell {
            lat: self.lat_tenths.div_euclid(10),
            lon: self.lon_tenths.div_euclid(10),
        }
    }
}

fn to_tenths_floor(value: f64) -> i32 {
    // Absorb representation error such as 30.3 * 10 = 302.99999999999997.
    (value * 10.0 + 1e-9).floor() as i32
}

fn format_tenths(value: i32) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    format!("{sign}{}.{}", abs / 10, abs % 10)
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}",
            format_tenths(self.lat_tenths),
            format_tenths(self.lon_tenths)
        )
    }
}

impl FromStr for TileId {
    type Err = ProspectorError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProspectorError::InvalidTileId(s.to_string());
        let (lat, lon) = s.split_once('_').ok_or_else(invalid)?;
        let parse = |part: &str| -> Result<i32> {
            // Exactly one decimal place.
            let (_, frac) = part.split_once('.').ok_or_else(invalid)?;
            if frac.len() != 1 {
                return Err(invalid());
            }
            let value: f64 = part.parse().map_err(|_| invalid())?;
            if !value.is_finite() {
                return Err(invalid());
            }
            Ok((value * 10.0).round() as i32)
        };
        let lat_tenths = parse(lat)?;
        let lon_tenths = parse(lon)?;
        if !(-900..900).contains(&lat_tenths)
            || !(-1800..1800).contains(&lon_tenths)
        {
            return Err(invalid());
        }
        Ok(Self::from_tenths(lat_tenths, lon_tenths))
    }
}

impl Serialize for TileId {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TileId {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(lat_min: f64, lat_max: f64, lon_min: f64, lon_max: f64) -> Bounds {
        Bounds::new(lat_min, lat_max, lon_min, lon_max).unwrap()
    }

    #[test]
    fn overlap_is_symmetric_and_zero_when_touching() {
        let a = rect(30.0, 30.2, -97.8, -97.6);
        let b = rect(30.1, 30.3, -97.7, -97.5);
        assert!((a.overlap_area(&b) - b.overlap_area(&a)).abs() < 1e-12);
        assert!(a.overlap_area(&b) > 0.0);

        let touching = rect(30.2, 30.4, -97.8, -97.6);
        assert_eq!(a.overlap_area(&touching), 0.0);
        let disjoint = rect(31.0, 31.1, -97.8, -97.6);
        assert_eq!(a.overlap_area(&disjoint), 0.0);
    }

    #[test]
    fn coverage_of_degenerate_query_is_zero() {
        let area = rect(30.0, 30.2, -97.8, -97.6);
        let line = rect(30.1, 30.1, -97.8, -97.6);
        assert_eq!(area.coverage_of(&line), 0.0);
    }

    #[test]
    fn tile_ids_round_trip_negative_and_small_values() {
        for raw in ["30.1_-97.8", "-0.5_0.0", "0.0_-0.1", "-33.9_151.2"] {
            let tile: TileId = raw.parse().unwrap();
            assert_eq!(tile.to_string(), raw);
        }
        assert!("30.15_-97.8".parse::<TileId>().is_err());
        assert!("30_-97".parse::<TileId>().is_err());
        assert!("abc".parse::<TileId>().is_err());
    }

    #[test]
    fn tile_for_point_absorbs_float_error() {
        let tile = TileId::containing(GeoPoint::new(30.3, -97.75));
        assert_eq!(tile.to_string(), "30.3_-97.8");
        assert_eq!(tile.cell(), GridCell { lat: 30, lon: -98 });
    }

    #[test]
    fn neighborhood_scans_south_west_first() {
        let cells = GridCell::containing(30.5, -97.5).neighborhood();
        assert_eq!(cells[0], GridCell { lat: 29, lon: -99 });
        assert_eq!(cells[4], GridCell { lat: 30, lon: -98 });
        assert_eq!(cells[8], GridCell { lat: 31, lon: -97 });
    }

    #[test]
    fn coordinate_literals_parse() {
        let point: GeoPoint = "30.27, -97.74".parse().unwrap();
        assert_eq!(point, GeoPoint::new(30.27, -97.74));
        assert!("Austin, TX".parse::<GeoPoint>().is_err());
        assert!("91,0".parse::<GeoPoint>().is_err());
    }
}
