//! Grid tiles covering a search radius.

use crate::coverage::{
    Bounds, GeoPoint, MILES_PER_DEGREE_LAT, TileId, miles_per_degree_lon,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridTile {
    pub id: TileId,
    pub bounds: Bounds,
    pub center: GeoPoint,
}

/// Every 0.1 degree tile intersecting the square box of half-width
/// `radius_miles` around `center`, south-west first, row-major.
pub fn generate_grid(center: GeoPoint, radius_miles: f64) -> Vec<GridTile> {
    let radius = radius_miles.max(0.0);
    let lat_delta = radius / MILES_PER_DEGREE_LAT;
    let lon_delta = radius / miles_per_degree_lon(center.latitude);

    let lat_start = tenths_floor(center.latitude - lat_delta).max(-900);
    let lat_end = tenths_floor(center.latitude + lat_delta).min(899);
    let lon_start = tenths_floor(center.longitude - lon_delta).max(-1800);
    let lon_end = tenths_floor(center.longitude + lon_delta).min(1799);

    let mut tiles = Vec::new();
    for lat in lat_start..=lat_end {
        for lon in lon_start..=lon_end {
            let id = TileId::from_tenths(lat, lon);
            let bounds = id.bounds();
            tiles.push(GridTile {
                id,
                bounds,
                center: bounds.center(),
            });
        }
    }
    tiles
}

fn tenths_floor(value: f64) -> i32 {
    (value * 10.0 + 1e-9).floor() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_radius_yields_the_containing_tile() {
        let tiles = generate_grid(GeoPoint::new(30.27, -97.74), 0.0);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].id.to_string(), "30.2_-97.8");
    }

    #[test]
    fn grid_covers_the_radius_without_gaps() {
        let center = GeoPoint::new(30.27, -97.74);
        let tiles = generate_grid(center, 10.0);
        let lat_min = tiles.iter().map(|t| t.bounds.lat_min).fold(f64::MAX, f64::min);
        let lat_max = tiles.iter().map(|t| t.bounds.lat_max).fold(f64::MIN, f64::max);
        assert!(lat_min <= center.latitude - 10.0 / MILES_PER_DEGREE_LAT);
        assert!(lat_max >= center.latitude + 10.0 / MILES_PER_DEGREE_LAT);

        let mut ids: Vec<String> = tiles.iter().map(|t| t.id.to_string()).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }
}
