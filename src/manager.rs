//! The Manager: owns the live Store/Spatial-Index/Block-Layover-Index
//! triplet and the realtime snapshot, exposes the read-path API, and runs
//! the `ForceUpdate` hot-swap protocol.
//!
//! One `RwLock`-guarded state struct, a background task per data source,
//! cooperative shutdown via a broadcast channel, generalized from a
//! single-table sync to the swap of three independently-built artifacts
//! (Store, Spatial Index, Block-Layover Index) plus a best-effort async
//! Direction Precomputer pass that trails the swap instead of gating it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::block_layover::BlockLayoverIndex;
use crate::config::{AuthHeader, Config, DataPath};
use crate::direction::{self, CancellationToken};
use crate::error::DataPlaneError;
use crate::ingest;
use crate::model::{Route, StaticFeed, Stop};
use crate::realtime::{AlertRecord, RealtimeFeedUrls, RealtimeTables, TripUpdateRecord, VehicleRecord};
use crate::spatial::SpatialIndex;
use crate::store::{queries, Store};

struct LiveState {
    store: Store,
    feed: StaticFeed,
    spatial: SpatialIndex,
    block_layover: BlockLayoverIndex,
}

/// Owns everything needed to answer read queries and to swap itself out
/// wholesale when a new static feed is ingested.
pub struct Manager {
    state: RwLock<LiveState>,
    realtime: Arc<RealtimeTables>,
    route_cache: RwLock<HashMap<String, Vec<Route>>>,
    client: reqwest::Client,
    source: String,
    auth_header: Option<AuthHeader>,
    gtfstidy_binary: Option<String>,
    batch_size: usize,
    shutdown_tx: broadcast::Sender<()>,
    realtime_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
    direction_cancel: RwLock<Option<CancellationToken>>,
}

fn active_stops(feed: &StaticFeed) -> Vec<Stop> {
    let active_ids: std::collections::HashSet<&str> =
        feed.stop_times.iter().map(|st| st.stop_id.as_str()).collect();
    feed.stops
        .iter()
        .filter(|s| active_ids.contains(s.id.as_str()))
        .cloned()
        .collect()
}

fn stop_times_by_trip(feed: &StaticFeed) -> HashMap<String, Vec<crate::model::StopTime>> {
    let mut by_trip: HashMap<String, Vec<crate::model::StopTime>> = HashMap::new();
    for st in &feed.stop_times {
        by_trip.entry(st.trip_id.clone()).or_default().push(st.clone());
    }
    for sts in by_trip.values_mut() {
        sts.sort_by_key(|s| s.stop_sequence);
    }
    by_trip
}

/// Builds the per-stop direction-precompute inputs (shape references, the
/// next-stop bearing fallback, and author-supplied direction) from a
/// parsed feed.
fn build_direction_inputs(
    feed: &StaticFeed,
) -> (
    Vec<(direction::StopContext, (f64, f64))>,
    HashMap<String, Vec<direction::ShapePoint>>,
) {
    let stop_lat_lon: HashMap<String, (f64, f64)> =
        feed.stops.iter().map(|s| (s.id.clone(), (s.lat, s.lon))).collect();

    let mut shapes_by_id: HashMap<String, Vec<direction::ShapePoint>> = HashMap::new();
    for (shape_id, pt) in &feed.shapes {
        shapes_by_id.entry(shape_id.clone()).or_default().push(direction::ShapePoint {
            sequence: pt.shape_pt_sequence as i64,
            lat: pt.lat,
            lon: pt.lon,
            dist_traveled: pt.shape_dist_traveled,
        });
    }
    for points in shapes_by_id.values_mut() {
        points.sort_by_key(|p| p.sequence);
    }

    let by_trip = stop_times_by_trip(feed);
    let trips_by_id: HashMap<&str, &crate::model::Trip> =
        feed.trips.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut shape_refs: HashMap<String, Vec<(String, Option<f64>)>> = HashMap::new();
    let mut next_stop_bearing: HashMap<String, f64> = HashMap::new();

    for (trip_id, sts) in &by_trip {
        let Some(trip) = trips_by_id.get(trip_id.as_str()) else {
            continue;
        };
        if let Some(shape_id) = &trip.shape_id {
            for st in sts {
                shape_refs
                    .entry(st.stop_id.clone())
                    .or_default()
                    .push((shape_id.clone(), st.shape_dist_traveled));
            }
        }
        for (stop_id, bearing) in direction::next_stop_bearings_from_trip(sts, &stop_lat_lon) {
            next_stop_bearing.entry(stop_id).or_insert(bearing);
        }
    }

    let stops: Vec<(direction::StopContext, (f64, f64))> = feed
        .stops
        .iter()
        .map(|s| {
            let ctx = direction::StopContext {
                stop_id: s.id.clone(),
                author_direction: s.direction,
                shape_refs: shape_refs.get(&s.id).cloned().unwrap_or_default(),
                next_stop_bearing: next_stop_bearing.get(&s.id).copied(),
            };
            (ctx, (s.lat, s.lon))
        })
        .collect();

    (stops, shapes_by_id)
}

impl Manager {
    /// Opens the initial store, runs the first ingest, builds the
    /// in-memory indices, and returns a ready-to-serve Manager. Does not
    /// start the realtime loop or the direction precompute — call
    /// [`Manager::start_realtime`] / [`Manager::spawn_direction_precompute`]
    /// once the caller is ready to hand out a reference.
    pub async fn bootstrap(config: &Config) -> Result<Self, DataPlaneError> {
        config.validate()?;

        let client = reqwest::Client::new();
        let store = Store::open(&config.data_path).await?;
        let feed = ingest::ingest_feed(
            &client,
            &store,
            &config.gtfs_static_feed.url,
            config.gtfs_static_feed.auth_header.as_ref(),
            None,
            crate::store::DEFAULT_BATCH_SIZE,
        )
        .await?;

        let spatial = SpatialIndex::build(active_stops(&feed));
        let block_layover = BlockLayoverIndex::build(&feed.trips, &stop_times_by_trip(&feed));

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            state: RwLock::new(LiveState { store, feed, spatial, block_layover }),
            realtime: Arc::new(RealtimeTables::empty()),
            route_cache: RwLock::new(HashMap::new()),
            client,
            source: config.gtfs_static_feed.url.clone(),
            auth_header: config.gtfs_static_feed.auth_header.clone(),
            gtfstidy_binary: None,
            batch_size: crate::store::DEFAULT_BATCH_SIZE,
            shutdown_tx,
            realtime_handle: RwLock::new(None),
            direction_cancel: RwLock::new(None),
        })
    }

    /// Starts the background realtime refresh loop against the first
    /// configured feed source, if any.
    pub async fn start_realtime(self: &Arc<Self>, sources: &[crate::config::RealtimeFeedSource], interval: Duration) {
        let Some(first) = sources.first() else {
            return;
        };
        let urls = RealtimeFeedUrls {
            trip_updates_url: first.trip_updates_url.clone(),
            vehicle_positions_url: first.vehicle_positions_url.clone(),
            service_alerts_url: first.service_alerts_url.clone(),
            auth_header: first.auth_header.clone(),
        };
        let handle = crate::realtime::spawn_refresh_loop(
            self.client.clone(),
            urls,
            Arc::clone(&self.realtime),
            interval,
            self.shutdown_tx.subscribe(),
        );
        *self.realtime_handle.write().await = Some(handle);
    }

    /// Kicks off the Direction Precomputer against the currently live
    /// store, in the background. Cancels (via the cooperative token) any
    /// precompute still running from a previous ingest.
    pub async fn spawn_direction_precompute(self: &Arc<Self>) {
        if let Some(prev) = self.direction_cancel.write().await.take() {
            prev.cancel();
        }
        let cancellation = CancellationToken::new();
        *self.direction_cancel.write().await = Some(cancellation.clone());

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let (stops, shapes_by_id, pool) = {
                let guard = manager.state.read().await;
                let (stops, shapes_by_id) = build_direction_inputs(&guard.feed);
                (stops, shapes_by_id, guard.store.pool().clone())
            };
            match direction::precompute_directions(
                &pool,
                stops,
                shapes_by_id,
                direction::DEFAULT_THRESHOLD,
                cancellation,
            )
            .await
            {
                Ok(written) => info!(written, "direction precompute finished"),
                Err(e) => warn!(error = %e, "direction precompute failed"),
            }
        });
    }

    /// Hot-swaps in a freshly ingested static feed: builds a brand new
    /// Store/Spatial-Index/Block-Layover-Index off to the side, and only
    /// swaps the live pointer once every step has succeeded. The old store
    /// is closed (and its backing file removed, if any) only after the
    /// swap, so in-flight reads against it are unaffected.
    pub async fn force_update(self: &Arc<Self>) -> Result<(), DataPlaneError> {
        let new_data_path = {
            let guard = self.state.read().await;
            match guard.store.path() {
                Some(_) => {
                    let tmp = tempfile::Builder::new()
                        .prefix("gtfs-dataplane-")
                        .suffix(".db")
                        .tempfile()
                        .map_err(crate::error::StoreError::Io)?;
                    let (_, path) = tmp.keep().map_err(|e| crate::error::StoreError::Io(e.error))?;
                    DataPath::File(path.to_string_lossy().into_owned())
                }
                None => DataPath::Memory,
            }
        };

        let new_store = Store::open(&new_data_path).await?;

        let ingest_result = ingest::ingest_feed(
            &self.client,
            &new_store,
            &self.source,
            self.auth_header.as_ref(),
            self.gtfstidy_binary.as_deref(),
            self.batch_size,
        )
        .await;

        let new_feed = match ingest_result {
            Ok(feed) => feed,
            Err(e) => {
                new_store.close().await;
                if let DataPath::File(path) = &new_data_path {
                    let _ = tokio::fs::remove_file(path).await;
                }
                return Err(DataPlaneError::Ingest(e));
            }
        };

        let new_spatial = SpatialIndex::build(active_stops(&new_feed));
        let new_block_layover = BlockLayoverIndex::build(&new_feed.trips, &stop_times_by_trip(&new_feed));

        let old_state = {
            let mut guard = self.state.write().await;
            std::mem::replace(
                &mut *guard,
                LiveState {
                    store: new_store,
                    feed: new_feed,
                    spatial: new_spatial,
                    block_layover: new_block_layover,
                },
            )
        };
        self.route_cache.write().await.clear();

        let old_path = old_state.store.path().map(str::to_string);
        old_state.store.close().await;
        if let Some(path) = old_path {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path, error = %e, "failed to remove retired store file");
            }
        }

        info!("force update complete, store swapped");
        self.spawn_direction_precompute().await;
        Ok(())
    }

    /// Idempotent shutdown: cancels any in-flight direction precompute,
    /// signals the realtime loop to stop and joins it, closes the store.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(cancel) = self.direction_cancel.write().await.take() {
            cancel.cancel();
        }
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.realtime_handle.write().await.take() {
            let _ = handle.await;
        }
        self.state.read().await.store.close().await;
        info!("manager shutdown complete");
    }

    // --- read-path API ---

    pub async fn stops_within_bbox(&self, min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Vec<Stop> {
        let guard = self.state.read().await;
        guard.spatial.stops_within_bbox(min_lat, max_lat, min_lon, max_lon).into_iter().cloned().collect()
    }

    pub async fn stops_within_radius(&self, lat: f64, lon: f64, radius_m: f64) -> Vec<Stop> {
        let guard = self.state.read().await;
        guard.spatial.stops_within_radius(lat, lon, radius_m).into_iter().cloned().collect()
    }

    pub async fn search_routes(&self, raw_query: &str) -> Result<Vec<Route>, DataPlaneError> {
        let guard = self.state.read().await;
        let ids = queries::search_routes_fts(guard.store.pool(), raw_query).await?;
        Ok(guard.feed.routes.iter().filter(|r| ids.contains(&r.id)).cloned().collect())
    }

    /// Routes for one agency, cached until the next `force_update`.
    pub async fn routes_for_agency(&self, agency_id: &str) -> Result<Vec<Route>, DataPlaneError> {
        if let Some(cached) = self.route_cache.read().await.get(agency_id) {
            return Ok(cached.clone());
        }
        let guard = self.state.read().await;
        let routes = queries::routes_for_agency(guard.store.pool(), agency_id).await?;
        self.route_cache.write().await.insert(agency_id.to_string(), routes.clone());
        Ok(routes)
    }

    pub async fn active_service_ids_on_date(&self, date: NaiveDate) -> Result<Vec<String>, DataPlaneError> {
        let guard = self.state.read().await;
        Ok(queries::active_service_ids_on_date(guard.store.pool(), date).await?)
    }

    pub async fn trips_by_block_ordered(&self, block_id: &str) -> Vec<String> {
        let guard = self.state.read().await;
        guard
            .block_layover
            .trips_by_block_ordered(block_id)
            .map(|v| v.to_vec())
            .unwrap_or_default()
    }

    pub async fn layovers_for_route(&self, route_id: &str) -> usize {
        let guard = self.state.read().await;
        guard.block_layover.layovers_for_route(route_id).len()
    }

    pub async fn get_stop(&self, stop_id: &str) -> Option<Stop> {
        let guard = self.state.read().await;
        guard.feed.stops.iter().find(|s| s.id == stop_id).cloned()
    }

    pub async fn trip_update(&self, trip_id: &str) -> Option<TripUpdateRecord> {
        self.realtime.trip_update(trip_id).await
    }

    pub async fn vehicle_by_id(&self, vehicle_id: &str) -> Option<VehicleRecord> {
        self.realtime.vehicle_by_id(vehicle_id).await
    }

    pub async fn vehicle_for_trip(&self, trip_id: &str) -> Option<VehicleRecord> {
        self.realtime.vehicle_for_trip(trip_id).await
    }

    pub async fn alerts_for_stop(&self, stop_id: &str) -> Vec<AlertRecord> {
        self.realtime.alerts_for_stop(stop_id).await
    }

    pub async fn alerts_for_trip(&self, trip_id: &str) -> Vec<AlertRecord> {
        let (route_id, agency_id) = {
            let guard = self.state.read().await;
            let route_id = guard.feed.trips.iter().find(|t| t.id == trip_id).map(|t| t.route_id.clone());
            let agency_id = route_id
                .as_ref()
                .and_then(|rid| guard.feed.routes.iter().find(|r| &r.id == rid))
                .and_then(|r| r.agency_id.clone());
            (route_id, agency_id)
        };
        self.realtime.alerts_for_trip(trip_id, route_id.as_deref(), agency_id.as_deref()).await
    }

    pub async fn alerts_for_route(&self, route_id: &str) -> Vec<AlertRecord> {
        let agency_id = {
            let guard = self.state.read().await;
            guard.feed.routes.iter().find(|r| r.id == route_id).and_then(|r| r.agency_id.clone())
        };
        self.realtime.alerts_for_route(route_id, agency_id.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExceptionType, LocationType, PickupDropOffType, Trip};

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

    fn trip(id: &str, route_id: &str, shape_id: Option<&str>) -> Trip {
        Trip {
            id: id.to_string(),
            route_id: route_id.to_string(),
            service_id: "svc".to_string(),
            headsign: None,
            short_name: None,
            direction_id: None,
            block_id: None,
            shape_id: shape_id.map(str::to_string),
            wheelchair_accessible: None,
            bikes_allowed: None,
        }
    }

    fn stop_time(trip_id: &str, seq: i32, stop_id: &str) -> crate::model::StopTime {
        crate::model::StopTime {
            trip_id: trip_id.to_string(),
            stop_sequence: seq,
            stop_id: stop_id.to_string(),
            arrival_time: Some(seq as i32 * 60),
            departure_time: Some(seq as i32 * 60),
            pickup_type: PickupDropOffType::RegularlyScheduled,
            drop_off_type: PickupDropOffType::RegularlyScheduled,
            shape_dist_traveled: None,
        }
    }

    #[test]
    fn active_stops_excludes_stops_with_no_stop_time() {
        let mut feed = StaticFeed::new();
        feed.stops = vec![stop("a", 0.0, 0.0), stop("b", 1.0, 1.0)];
        feed.stop_times = vec![stop_time("t1", 1, "a")];
        let active = active_stops(&feed);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[test]
    fn direction_inputs_carry_shape_refs_from_the_owning_trip() {
        let mut feed = StaticFeed::new();
        feed.stops = vec![stop("a", 0.0, 0.0), stop("b", 0.0, 1.0)];
        feed.trips = vec![trip("t1", "r1", Some("shape-1"))];
        feed.stop_times = vec![stop_time("t1", 1, "a"), stop_time("t1", 2, "b")];

        let (stops, _) = build_direction_inputs(&feed);
        let ctx_a = stops.iter().find(|(c, _)| c.stop_id == "a").unwrap();
        assert_eq!(ctx_a.0.shape_refs.len(), 1);
        assert_eq!(ctx_a.0.shape_refs[0].0, "shape-1");
    }

    #[test]
    fn exception_codes_used_in_active_service_ids_match_model() {
        assert_eq!(ExceptionType::Added.to_gtfs_code(), 1);
        assert_eq!(ExceptionType::Removed.to_gtfs_code(), 2);
    }
}
