//! In-memory R-tree over active stops, rebuilt wholesale on every ingest.
//!
//! An `RTree<IndexedStop>` queried by bounding box / nearest-point, rather
//! than maintained incrementally.

use rstar::{RTree, RTreeObject, AABB};

use crate::model::Stop;

/// Mean Earth radius in meters, matching the sphere used by the Feed
/// Merger's stop-distance scorer.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone)]
pub struct IndexedStop {
    pub stop: Stop,
}

impl RTreeObject for IndexedStop {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.stop.lon, self.stop.lat])
    }
}

/// An R-tree over the stops referenced by at least one `stop_time`, built
/// once per ingest and handed to the Manager for atomic swap alongside the
/// Store and Block-Layover Index. Never mutated in place.
pub struct SpatialIndex {
    tree: RTree<IndexedStop>,
}

impl SpatialIndex {
    pub fn build(active_stops: Vec<Stop>) -> Self {
        let items: Vec<IndexedStop> = active_stops.into_iter().map(|stop| IndexedStop { stop }).collect();
        Self {
            tree: RTree::bulk_load(items),
        }
    }

    pub fn empty() -> Self {
        Self { tree: RTree::new() }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Stops whose (lat, lon) falls within the axis-aligned rectangle.
    pub fn stops_within_bbox(
        &self,
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    ) -> Vec<&Stop> {
        let envelope = AABB::from_corners([min_lon, min_lat], [max_lon, max_lat]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|item| &item.stop)
            .collect()
    }

    /// Stops within `radius_m` meters of `(center_lat, center_lon)` by
    /// great-circle (haversine) distance. Queries a conservative bounding
    /// box first, then filters by the exact distance.
    pub fn stops_within_radius(
        &self,
        center_lat: f64,
        center_lon: f64,
        radius_m: f64,
    ) -> Vec<&Stop> {
        let lat_span = (radius_m / EARTH_RADIUS_M).to_degrees();
        let lon_span = if center_lat.abs() >= 90.0 {
            180.0
        } else {
            (radius_m / (EARTH_RADIUS_M * center_lat.to_radians().cos().abs().max(1e-9)))
                .to_degrees()
        };

        self.stops_within_bbox(
            center_lat - lat_span,
            center_lat + lat_span,
            center_lon - lon_span,
            center_lon + lon_span,
        )
        .into_iter()
        .filter(|s| haversine_distance_m(center_lat, center_lon, s.lat, s.lon) <= radius_m)
        .collect()
    }
}

/// Great-circle distance in meters between two (lat, lon) points in
/// degrees, on a sphere of radius [`EARTH_RADIUS_M`].
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocationType;

    fn stop(id: &str, lat: f64, lon: f64) -> Stop {
        Stop {
            id: id.to_string(),
            code: None,
            name: Some(id.to_string()),
            lat,
            lon,
            parent_station: None,
            location_type: LocationType::Stop,
            wheelchair_boarding: None,
            direction: None,
        }
    }

    #[test]
    fn bbox_query_finds_contained_stops_only() {
        let idx = SpatialIndex::build(vec![
            stop("a", 40.58, -122.39),
            stop("b", 50.0, -122.39),
        ]);
        let hits = idx.stops_within_bbox(40.0, 41.0, -123.0, -122.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[test]
    fn radius_query_respects_haversine_distance() {
        let idx = SpatialIndex::build(vec![stop("a", 40.589123, -122.390830)]);
        assert_eq!(idx.stops_within_radius(40.589123, -122.390830, 2000.0).len(), 1);
        assert_eq!(idx.stops_within_radius(47.589123, -122.390830, 2000.0).len(), 0);
    }

    #[test]
    fn haversine_zero_distance_for_identical_points() {
        assert_eq!(haversine_distance_m(10.0, 20.0, 10.0, 20.0), 0.0);
    }

    #[test]
    fn empty_index_has_no_stops() {
        let idx = SpatialIndex::empty();
        assert!(idx.is_empty());
        assert!(idx.stops_within_bbox(-90.0, 90.0, -180.0, 180.0).is_empty());
    }
}
