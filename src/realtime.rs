//! Background realtime feed updater: fetches trip-updates, vehicle-positions
//! and (optionally) service-alerts on a fixed cadence, decodes the
//! GTFS-Realtime protobuf payloads, and merges each stream into the held
//! snapshot independently — a stream that fails or isn't configured this
//! tick keeps whatever it held from the last successful fetch.
//!
//! Fetch-then-decode shape (reqwest + size guard + prost decode) driven by
//! a `tokio::spawn` + `tokio::time::interval` background task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::AuthHeader;
use crate::error::RealtimeError;

/// Cap on a single realtime protobuf response.
const MAX_PROTOBUF_SIZE: usize = 50 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TripUpdateRecord {
    pub trip_id: String,
    pub route_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub stop_time_updates: Vec<StopTimeUpdateRecord>,
}

#[derive(Debug, Clone)]
pub struct StopTimeUpdateRecord {
    pub stop_id: Option<String>,
    pub stop_sequence: Option<i32>,
    pub arrival_delay: Option<i32>,
    pub departure_delay: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct VehicleRecord {
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InformedEntity {
    pub agency_id: Option<String>,
    pub route_id: Option<String>,
    pub trip_id: Option<String>,
    pub stop_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub id: String,
    pub header_text: Option<String>,
    pub description_text: Option<String>,
    pub informed_entities: Vec<InformedEntity>,
}

/// The currently held realtime data, merged in per stream as ticks arrive.
#[derive(Debug, Clone, Default)]
pub struct RealtimeSnapshot {
    pub trip_updates: Vec<TripUpdateRecord>,
    pub vehicles: Vec<VehicleRecord>,
    pub alerts: Vec<AlertRecord>,
}

/// One tick's fetch outcome per stream: `None` means that stream's source
/// URL isn't configured, or the fetch/decode failed this tick — in either
/// case the previously held data for that stream is left untouched.
#[derive(Debug, Default)]
pub struct FetchedTick {
    pub trip_updates: Option<Vec<TripUpdateRecord>>,
    pub vehicles: Option<Vec<VehicleRecord>>,
    pub alerts: Option<Vec<AlertRecord>>,
}

#[derive(Default)]
struct SecondaryIndices {
    trip_id_to_trip_update: HashMap<String, usize>,
    trip_id_to_vehicle: HashMap<String, usize>,
    vehicle_id_to_vehicle: HashMap<String, usize>,
}

impl SecondaryIndices {
    fn build(snapshot: &RealtimeSnapshot) -> Self {
        let mut idx = SecondaryIndices::default();
        for (i, tu) in snapshot.trip_updates.iter().enumerate() {
            idx.trip_id_to_trip_update.insert(tu.trip_id.clone(), i);
        }
        for (i, v) in snapshot.vehicles.iter().enumerate() {
            idx.vehicle_id_to_vehicle.insert(v.vehicle_id.clone(), i);
            if let Some(trip_id) = &v.trip_id {
                idx.trip_id_to_vehicle.insert(trip_id.clone(), i);
            }
        }
        idx
    }
}

/// Holds the published realtime snapshot and its secondary lookup maps
/// under one lock. Each tick merges in only the streams that fetched
/// cleanly; a stream missing from the tick keeps its previously held data.
pub struct RealtimeTables {
    inner: RwLock<(RealtimeSnapshot, SecondaryIndices)>,
}

impl RealtimeTables {
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new((RealtimeSnapshot::default(), SecondaryIndices::default())),
        }
    }

    pub async fn publish(&self, tick: FetchedTick) {
        let mut guard = self.inner.write().await;
        if let Some(trip_updates) = tick.trip_updates {
            guard.0.trip_updates = trip_updates;
        }
        if let Some(vehicles) = tick.vehicles {
            guard.0.vehicles = vehicles;
        }
        if let Some(alerts) = tick.alerts {
            guard.0.alerts = alerts;
        }
        guard.1 = SecondaryIndices::build(&guard.0);
    }

    pub async fn trip_update(&self, trip_id: &str) -> Option<TripUpdateRecord> {
        let guard = self.inner.read().await;
        let (snapshot, idx) = &*guard;
        idx.trip_id_to_trip_update
            .get(trip_id)
            .map(|&i| snapshot.trip_updates[i].clone())
    }

    pub async fn vehicle_by_id(&self, vehicle_id: &str) -> Option<VehicleRecord> {
        let guard = self.inner.read().await;
        let (snapshot, idx) = &*guard;
        idx.vehicle_id_to_vehicle
            .get(vehicle_id)
            .map(|&i| snapshot.vehicles[i].clone())
    }

    pub async fn vehicle_for_trip(&self, trip_id: &str) -> Option<VehicleRecord> {
        let guard = self.inner.read().await;
        let (snapshot, idx) = &*guard;
        idx.trip_id_to_vehicle
            .get(trip_id)
            .map(|&i| snapshot.vehicles[i].clone())
    }

    /// Alerts informing `route_id` directly, or transitively via
    /// `agency_id` (any alert scoped to the route's agency also counts).
    pub async fn alerts_for_route(&self, route_id: &str, agency_id: Option<&str>) -> Vec<AlertRecord> {
        let guard = self.inner.read().await;
        guard
            .0
            .alerts
            .iter()
            .filter(|a| {
                a.informed_entities.iter().any(|e| {
                    e.route_id.as_deref() == Some(route_id)
                        || (agency_id.is_some() && e.agency_id.as_deref() == agency_id)
                })
            })
            .cloned()
            .collect()
    }

    /// Alerts informing `trip_id` directly, or transitively via the
    /// trip's route and the route's agency.
    pub async fn alerts_for_trip(&self, trip_id: &str, route_id: Option<&str>, agency_id: Option<&str>) -> Vec<AlertRecord> {
        let guard = self.inner.read().await;
        guard
            .0
            .alerts
            .iter()
            .filter(|a| {
                a.informed_entities.iter().any(|e| {
                    e.trip_id.as_deref() == Some(trip_id)
                        || (route_id.is_some() && e.route_id.as_deref() == route_id)
                        || (agency_id.is_some() && e.agency_id.as_deref() == agency_id)
                })
            })
            .cloned()
            .collect()
    }

    pub async fn alerts_for_stop(&self, stop_id: &str) -> Vec<AlertRecord> {
        let guard = self.inner.read().await;
        guard
            .0
            .alerts
            .iter()
            .filter(|a| a.informed_entities.iter().any(|e| e.stop_id.as_deref() == Some(stop_id)))
            .cloned()
            .collect()
    }
}

async fn fetch_feed_message(
    client: &reqwest::Client,
    url: &str,
    auth_header: Option<&AuthHeader>,
) -> Result<gtfs_realtime::FeedMessage, RealtimeError> {
    let mut req = client.get(url).timeout(FETCH_TIMEOUT);
    if let Some(h) = auth_header {
        req = req.header(h.name.as_str(), h.value.as_str());
    }
    let response = req.send().await?;
    if !response.status().is_success() {
        return Err(RealtimeError::NetworkMessage(format!(
            "realtime feed HTTP {}",
            response.status()
        )));
    }
    let bytes = response.bytes().await?;
    if bytes.len() > MAX_PROTOBUF_SIZE {
        return Err(RealtimeError::NetworkMessage(format!(
            "realtime feed too large: {} bytes",
            bytes.len()
        )));
    }
    gtfs_realtime::FeedMessage::decode(bytes.as_ref()).map_err(RealtimeError::from)
}

fn convert_trip_updates(feed: &gtfs_realtime::FeedMessage) -> Vec<TripUpdateRecord> {
    feed.entity
        .iter()
        .filter_map(|e| e.trip_update.as_ref())
        .filter_map(|tu| {
            let trip_id = tu.trip.trip_id.clone()?;
            Some(TripUpdateRecord {
                trip_id,
                route_id: tu.trip.route_id.clone(),
                vehicle_id: tu.vehicle.as_ref().and_then(|v| v.id.clone()),
                stop_time_updates: tu
                    .stop_time_update
                    .iter()
                    .map(|stu| StopTimeUpdateRecord {
                        stop_id: stu.stop_id.clone(),
                        stop_sequence: stu.stop_sequence.map(|s| s as i32),
                        arrival_delay: stu.arrival.as_ref().and_then(|a| a.delay),
                        departure_delay: stu.departure.as_ref().and_then(|d| d.delay),
                    })
                    .collect(),
            })
        })
        .collect()
}

/// Vehicles missing a `vehicle_id` are dropped entirely, per the vehicle
/// replacement semantics for this stream.
fn convert_vehicles(feed: &gtfs_realtime::FeedMessage) -> Vec<VehicleRecord> {
    feed.entity
        .iter()
        .filter_map(|e| e.vehicle.as_ref())
        .filter_map(|v| {
            let vehicle_id = v.vehicle.as_ref().and_then(|d| d.id.clone())?;
            let position = v.position.as_ref()?;
            Some(VehicleRecord {
                vehicle_id,
                trip_id: v.trip.as_ref().and_then(|t| t.trip_id.clone()),
                route_id: v.trip.as_ref().and_then(|t| t.route_id.clone()),
                lat: position.latitude as f64,
                lon: position.longitude as f64,
                bearing: position.bearing,
                speed: position.speed,
                timestamp: v.timestamp,
            })
        })
        .collect()
}

fn convert_alerts(feed: &gtfs_realtime::FeedMessage) -> Vec<AlertRecord> {
    feed.entity
        .iter()
        .filter_map(|e| {
            let alert = e.alert.as_ref()?;
            Some(AlertRecord {
                id: e.id.clone(),
                header_text: alert.header_text.as_ref().and_then(|t| t.translation.first()).map(|t| t.text.clone()),
                description_text: alert.description_text.as_ref().and_then(|t| t.translation.first()).map(|t| t.text.clone()),
                informed_entities: alert
                    .informed_entity
                    .iter()
                    .map(|ie| InformedEntity {
                        agency_id: ie.agency_id.clone(),
                        route_id: ie.route_id.clone(),
                        trip_id: ie.trip.as_ref().and_then(|t| t.trip_id.clone()),
                        stop_id: ie.stop_id.clone(),
                    })
                    .collect(),
            })
        })
        .collect()
}

pub struct RealtimeFeedUrls {
    pub trip_updates_url: Option<String>,
    pub vehicle_positions_url: Option<String>,
    pub service_alerts_url: Option<String>,
    pub auth_header: Option<AuthHeader>,
}

/// Fetches all three streams concurrently. Each stream resolves to `None`
/// if its URL isn't configured or its fetch/decode failed this tick — the
/// caller keeps whatever data it held for that stream, rather than
/// treating the failure as "now empty". Returns `None` only when nothing
/// at all fetched cleanly (nothing to merge in this tick).
pub async fn fetch_tick(client: &reqwest::Client, urls: &RealtimeFeedUrls) -> Option<FetchedTick> {
    let (trip_updates, vehicles, alerts) = tokio::join!(
        async {
            match &urls.trip_updates_url {
                Some(url) => fetch_feed_message(client, url, urls.auth_header.as_ref())
                    .await
                    .map(|f| convert_trip_updates(&f))
                    .map_err(|e| warn!(error = %e, "trip-updates fetch failed"))
                    .ok(),
                None => None,
            }
        },
        async {
            match &urls.vehicle_positions_url {
                Some(url) => fetch_feed_message(client, url, urls.auth_header.as_ref())
                    .await
                    .map(|f| convert_vehicles(&f))
                    .map_err(|e| warn!(error = %e, "vehicle-positions fetch failed"))
                    .ok(),
                None => None,
            }
        },
        async {
            match &urls.service_alerts_url {
                Some(url) => fetch_feed_message(client, url, urls.auth_header.as_ref())
                    .await
                    .map(|f| convert_alerts(&f))
                    .map_err(|e| warn!(error = %e, "service-alerts fetch failed"))
                    .ok(),
                None => None,
            }
        },
    );

    if trip_updates.is_none() && vehicles.is_none() && alerts.is_none() {
        return None;
    }

    Some(FetchedTick {
        trip_updates,
        vehicles,
        alerts,
    })
}

/// Spawns the background refresh loop. The returned handle's task observes
/// `shutdown` and exits before the next tick once cancellation fires.
pub fn spawn_refresh_loop(
    client: reqwest::Client,
    urls: RealtimeFeedUrls,
    tables: Arc<RealtimeTables>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(tick) = fetch_tick(&client, &urls).await {
                        info!(
                            trip_updates = ?tick.trip_updates.as_ref().map(Vec::len),
                            vehicles = ?tick.vehicles.as_ref().map(Vec::len),
                            alerts = ?tick.alerts.as_ref().map(Vec::len),
                            "merging realtime tick (None = stream kept its previous data)"
                        );
                        tables.publish(tick).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("realtime updater shutting down");
                    break;
                }
            }
        }
    })
}
