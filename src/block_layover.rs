//! In-memory block-layover index: per-block trip ordering and the layover
//! records between consecutive trips of the same block.
//!
//! Preserves the upstream "cross-route contamination" behavior verbatim:
//! layover records are pooled by `layover_stop_id` alone, and the pooled
//! object is registered against *every* route_id that has at least one
//! trip with a layover at that stop. A query for route R can therefore
//! return records whose own `route_id` differs from R. This is
//! intentional — see the design notes on the source behavior this index
//! reproduces.

use std::collections::HashMap;

use crate::model::{StopTime, Trip};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoverRecord {
    pub next_trip_id: String,
    pub route_id: String,
    pub block_id: String,
    pub service_id: String,
    pub layover_stop_id: String,
    pub layover_start: i32,
    pub layover_end: i32,
}

/// All layover records sharing one `layover_stop_id`.
#[derive(Debug, Clone, Default)]
pub struct LayoverPool {
    pub records: Vec<LayoverRecord>,
}

pub struct BlockLayoverIndex {
    /// Denormalized per-block trip order, for `trips_by_block_ordered`.
    block_trip_order: HashMap<String, Vec<String>>,
    /// layover_stop_id -> pooled records.
    by_stop: HashMap<String, LayoverPool>,
    /// route_id -> every stop-pool that has at least one layover record
    /// involving a trip on that route. Deliberately not filtered to
    /// records whose own route_id equals the key.
    by_route: HashMap<String, Vec<String>>,
}

struct TripContext<'a> {
    trip: &'a Trip,
    first_departure: i32,
    first_arrival: i32,
    first_stop_id: String,
    last_departure: i32,
    last_stop_id: String,
}

impl BlockLayoverIndex {
    pub fn empty() -> Self {
        Self {
            block_trip_order: HashMap::new(),
            by_stop: HashMap::new(),
            by_route: HashMap::new(),
        }
    }

    /// Builds the index from the full parsed trip and stop_time sets.
    /// `stop_times_by_trip` must be sorted by `stop_sequence` per trip.
    pub fn build(trips: &[Trip], stop_times_by_trip: &HashMap<String, Vec<StopTime>>) -> Self {
        let mut by_block: HashMap<String, Vec<TripContext>> = HashMap::new();

        for trip in trips {
            let Some(block_id) = &trip.block_id else {
                continue;
            };
            let Some(sts) = stop_times_by_trip.get(&trip.id) else {
                continue;
            };
            let (Some(first), Some(last)) = (sts.first(), sts.last()) else {
                continue;
            };
            let (Some(first_departure), Some(first_arrival), Some(last_departure)) =
                (first.departure_time, first.arrival_time, last.departure_time)
            else {
                continue;
            };

            by_block.entry(block_id.clone()).or_default().push(TripContext {
                trip,
                first_departure,
                first_arrival,
                first_stop_id: first.stop_id.clone(),
                last_departure,
                last_stop_id: last.stop_id.clone(),
            });
        }

        let mut block_trip_order = HashMap::new();
        let mut by_stop: HashMap<String, LayoverPool> = HashMap::new();
        let mut by_route: HashMap<String, Vec<String>> = HashMap::new();

        for (block_id, mut ctxs) in by_block {
            ctxs.sort_by_key(|c| c.first_departure);
            block_trip_order.insert(
                block_id.clone(),
                ctxs.iter().map(|c| c.trip.id.clone()).collect(),
            );

            for pair in ctxs.windows(2) {
                let (prev, next) = (&pair[0], &pair[1]);
                if prev.last_stop_id != next.first_stop_id {
                    continue;
                }
                let record = LayoverRecord {
                    next_trip_id: next.trip.id.clone(),
                    route_id: next.trip.route_id.clone(),
                    block_id: block_id.clone(),
                    service_id: next.trip.service_id.clone(),
                    layover_stop_id: prev.last_stop_id.clone(),
                    layover_start: prev.last_departure,
                    layover_end: next.first_arrival,
                };

                let pool = by_stop.entry(record.layover_stop_id.clone()).or_default();
                pool.records.push(record.clone());

                let routes_at_stop = by_route
                    .entry(prev.trip.route_id.clone())
                    .or_default();
                if !routes_at_stop.contains(&record.layover_stop_id) {
                    routes_at_stop.push(record.layover_stop_id.clone());
                }
                let routes_at_stop = by_route
                    .entry(next.trip.route_id.clone())
                    .or_default();
                if !routes_at_stop.contains(&record.layover_stop_id) {
                    routes_at_stop.push(record.layover_stop_id.clone());
                }
            }
        }

        Self {
            block_trip_order,
            by_stop,
            by_route,
        }
    }

    pub fn trips_by_block_ordered(&self, block_id: &str) -> Option<&[String]> {
        self.block_trip_order.get(block_id).map(|v| v.as_slice())
    }

    /// Every layover record belonging to `block_id`, for persistence
    /// alongside the block's trip order.
    pub fn records_for_block(&self, block_id: &str) -> Vec<&LayoverRecord> {
        self.by_stop
            .values()
            .flat_map(|pool| pool.records.iter())
            .filter(|r| r.block_id == block_id)
            .collect()
    }

    pub fn layovers_at_stop(&self, layover_stop_id: &str) -> Option<&LayoverPool> {
        self.by_stop.get(layover_stop_id)
    }

    /// Indices registered against `route_id`. May include pools whose own
    /// records carry a different `route_id` — preserved intentionally.
    pub fn layovers_for_route(&self, route_id: &str) -> Vec<&LayoverPool> {
        self.by_route
            .get(route_id)
            .into_iter()
            .flatten()
            .filter_map(|stop_id| self.by_stop.get(stop_id))
            .collect()
    }

    /// Half-open interval overlap test: `block_id`s with at least one
    /// layover record whose interval intersects `[window_start, window_end)`.
    pub fn blocks_active_in_window(&self, window_start: i32, window_end: i32) -> Vec<String> {
        let mut out: Vec<String> = self
            .by_stop
            .values()
            .flat_map(|pool| pool.records.iter())
            .filter(|r| r.layover_start < window_end && r.layover_end > window_start)
            .map(|r| r.block_id.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExceptionType, PickupDropOffType};

    fn trip(id: &str, route_id: &str, block_id: &str) -> Trip {
        Trip {
            id: id.to_string(),
            route_id: route_id.to_string(),
            service_id: "svc".to_string(),
            headsign: None,
            short_name: None,
            direction_id: None,
            block_id: Some(block_id.to_string()),
            shape_id: None,
            wheelchair_accessible: None,
            bikes_allowed: None,
        }
    }

    fn stop_time(trip_id: &str, seq: i32, stop_id: &str, arr: i32, dep: i32) -> StopTime {
        StopTime {
            trip_id: trip_id.to_string(),
            stop_sequence: seq,
            stop_id: stop_id.to_string(),
            arrival_time: Some(arr),
            departure_time: Some(dep),
            pickup_type: PickupDropOffType::RegularlyScheduled,
            drop_off_type: PickupDropOffType::RegularlyScheduled,
            shape_dist_traveled: None,
        }
    }

    #[test]
    fn emits_one_layover_record_per_consecutive_pair_sharing_a_terminal_stop() {
        let trips = vec![
            trip("t1", "r1", "b1"),
            trip("t2", "r1", "b1"),
        ];
        let mut sts = HashMap::new();
        sts.insert(
            "t1".to_string(),
            vec![
                stop_time("t1", 1, "A", 0, 0),
                stop_time("t1", 2, "B", 600, 650),
            ],
        );
        sts.insert(
            "t2".to_string(),
            vec![
                stop_time("t2", 1, "B", 700, 700),
                stop_time("t2", 2, "C", 1300, 1300),
            ],
        );

        let idx = BlockLayoverIndex::build(&trips, &sts);
        let pool = idx.layovers_at_stop("B").expect("pool at B");
        assert_eq!(pool.records.len(), 1);
        let rec = &pool.records[0];
        assert_eq!(rec.next_trip_id, "t2");
        assert_eq!(rec.layover_start, 650);
        assert_eq!(rec.layover_end, 700);
        assert_eq!(rec.block_id, "b1");

        assert_eq!(idx.trips_by_block_ordered("b1"), Some(&["t1".to_string(), "t2".to_string()][..]));
    }

    #[test]
    fn cross_route_layover_is_registered_against_both_routes() {
        let trips = vec![
            trip("t1", "r1", "b1"),
            trip("t2", "r2", "b1"),
        ];
        let mut sts = HashMap::new();
        sts.insert("t1".to_string(), vec![stop_time("t1", 1, "A", 0, 0), stop_time("t1", 2, "B", 600, 650)]);
        sts.insert("t2".to_string(), vec![stop_time("t2", 1, "B", 700, 700), stop_time("t2", 2, "C", 1300, 1300)]);

        let idx = BlockLayoverIndex::build(&trips, &sts);
        let for_r1 = idx.layovers_for_route("r1");
        let for_r2 = idx.layovers_for_route("r2");
        assert_eq!(for_r1.len(), 1);
        assert_eq!(for_r2.len(), 1);
        // r1's own trips never continue as the next leg, yet r1 still
        // surfaces the pool whose record.route_id is "r2" — contamination.
        assert_eq!(for_r1[0].records[0].route_id, "r2");
    }

    #[test]
    fn blocks_active_in_window_uses_half_open_overlap() {
        let trips = vec![trip("t1", "r1", "b1"), trip("t2", "r1", "b1")];
        let mut sts = HashMap::new();
        sts.insert("t1".to_string(), vec![stop_time("t1", 1, "A", 0, 0), stop_time("t1", 2, "B", 600, 650)]);
        sts.insert("t2".to_string(), vec![stop_time("t2", 1, "B", 700, 700), stop_time("t2", 2, "C", 1300, 1300)]);
        let idx = BlockLayoverIndex::build(&trips, &sts);

        assert_eq!(idx.blocks_active_in_window(640, 660), vec!["b1".to_string()]);
        // The layover record spans [650, 700); a window equal to that
        // exact interval still overlaps it under the half-open rule.
        assert_eq!(idx.blocks_active_in_window(650, 700), vec!["b1".to_string()]);
        assert!(idx.blocks_active_in_window(0, 640).is_empty());
        assert!(idx.blocks_active_in_window(700, 750).is_empty());
    }

    #[test]
    fn exception_type_codes_round_trip() {
        assert_eq!(ExceptionType::from_gtfs_code(1), Some(ExceptionType::Added));
        assert_eq!(ExceptionType::from_gtfs_code(2), Some(ExceptionType::Removed));
        assert_eq!(ExceptionType::from_gtfs_code(9), None);
    }
}
