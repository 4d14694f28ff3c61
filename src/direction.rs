//! Parallel, per-stop compass-direction precomputation.
//!
//! Execution model follows the phase split named for this component:
//! phase 0 loads shapes into an in-memory map, phase 1 fans N=CPU-count
//! worker threads out over all stops via `std::thread::scope` with results
//! collected over an `mpsc` channel (not async/rayon — this stage is pure
//! CPU-bound geometry, and the batch writer below is the only place that
//! touches the database), phase 2 collects on a single writer, phase 3
//! batches the writeback into transactions of `BATCH_SIZE`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::model::{Direction, StopTime};
use crate::spatial::haversine_distance_m;
use crate::store::queries;

/// Reference batch size for the writeback transactions.
const WRITE_BATCH_SIZE: usize = 500;
/// Circular-variance rejection threshold; above this the from-shape
/// bearings are considered too inconsistent to trust.
const DEFAULT_VARIANCE_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, Copy)]
pub struct ShapePoint {
    pub sequence: i64,
    pub lat: f64,
    pub lon: f64,
    pub dist_traveled: Option<f64>,
}

pub struct StopContext {
    pub stop_id: String,
    pub author_direction: Option<Direction>,
    /// `(shape_id, shape_dist_traveled)` for every trip serving this stop.
    pub shape_refs: Vec<(String, Option<f64>)>,
    /// Bearing to the next stop in the most common trip serving this stop,
    /// used as the next-stop fallback when no shape is available.
    pub next_stop_bearing: Option<f64>,
}

/// Cooperative cancellation flag shared between the fan-out workers and
/// the batch writer; checked between stops and between write transactions.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn bearing_degrees(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlon = (lon2 - lon1).to_radians();
    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    y.atan2(x).to_degrees()
}

/// Finds the shape point nearest `(lat, lon)` and returns the bearing from
/// it to the next point in sequence, or `None` if the shape has fewer than
/// two points or nothing is closer than `f64::MAX`.
fn bearing_from_nearest_shape_point(points: &[ShapePoint], lat: f64, lon: f64) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let (idx, _) = points
        .iter()
        .enumerate()
        .map(|(i, p)| (i, haversine_distance_m(lat, lon, p.lat, p.lon)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())?;
    let next = points.get(idx + 1).or_else(|| points.get(idx.wrapping_sub(1)))?;
    let current = &points[idx];
    Some(bearing_degrees(current.lat, current.lon, next.lat, next.lon))
}

/// Bearing of the shape segment straddling `dist_traveled`, when available
/// directly from the stop_time's `shape_dist_traveled`.
fn bearing_at_distance(points: &[ShapePoint], dist_traveled: f64) -> Option<f64> {
    let idx = points
        .windows(2)
        .position(|w| match (w[0].dist_traveled, w[1].dist_traveled) {
            (Some(a), Some(b)) => dist_traveled >= a && dist_traveled <= b,
            _ => false,
        })?;
    Some(bearing_degrees(
        points[idx].lat,
        points[idx].lon,
        points[idx + 1].lat,
        points[idx + 1].lon,
    ))
}

/// Circular mean and variance (1 - mean resultant length) of a set of
/// bearings in degrees.
fn circular_mean_and_variance(bearings: &[f64]) -> (f64, f64) {
    let (sum_sin, sum_cos) = bearings.iter().fold((0.0, 0.0), |(s, c), &b| {
        let r = b.to_radians();
        (s + r.sin(), c + r.cos())
    });
    let n = bearings.len() as f64;
    let (mean_sin, mean_cos) = (sum_sin / n, sum_cos / n);
    let r = (mean_sin.powi(2) + mean_cos.powi(2)).sqrt();
    let mean_angle = mean_sin.atan2(mean_cos).to_degrees();
    (mean_angle, 1.0 - r)
}

fn compute_direction_for_stop(
    ctx: &StopContext,
    shapes_by_id: &HashMap<String, Vec<ShapePoint>>,
    stop_lat_lon: (f64, f64),
    variance_threshold: f64,
) -> Option<Direction> {
    if let Some(d) = ctx.author_direction {
        return Some(d);
    }

    let bearings: Vec<f64> = ctx
        .shape_refs
        .iter()
        .filter_map(|(shape_id, dist_traveled)| {
            let points = shapes_by_id.get(shape_id)?;
            match dist_traveled {
                Some(d) => bearing_at_distance(points, *d)
                    .or_else(|| bearing_from_nearest_shape_point(points, stop_lat_lon.0, stop_lat_lon.1)),
                None => bearing_from_nearest_shape_point(points, stop_lat_lon.0, stop_lat_lon.1),
            }
        })
        .collect();

    if !bearings.is_empty() {
        let bearing = if bearings.len() == 1 {
            Some(bearings[0])
        } else {
            let (mean, variance) = circular_mean_and_variance(&bearings);
            if variance > variance_threshold {
                None
            } else {
                Some(mean)
            }
        };
        if let Some(b) = bearing {
            return Some(Direction::from_bearing_degrees(b));
        }
        return None;
    }

    ctx.next_stop_bearing.map(Direction::from_bearing_degrees)
}

/// Runs the full fan-out/collect/batch-write pipeline against the supplied
/// pool. Returns the number of stops whose direction was written.
pub async fn precompute_directions(
    pool: &SqlitePool,
    stops: Vec<(StopContext, (f64, f64))>,
    shapes_by_id: HashMap<String, Vec<ShapePoint>>,
    variance_threshold: f64,
    cancellation: CancellationToken,
) -> Result<usize, StoreError> {
    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    info!(worker_count, stop_count = stops.len(), "starting direction precompute");

    let shapes_by_id = Arc::new(shapes_by_id);
    let (tx, rx) = mpsc::channel::<(String, Option<Direction>)>();

    std::thread::scope(|scope| {
        let chunk_size = stops.len().div_ceil(worker_count.max(1)).max(1);
        for chunk in stops.chunks(chunk_size) {
            let tx = tx.clone();
            let shapes_by_id = Arc::clone(&shapes_by_id);
            let cancellation = cancellation.clone();
            scope.spawn(move || {
                for (ctx, lat_lon) in chunk {
                    if cancellation.is_cancelled() {
                        break;
                    }
                    let direction = compute_direction_for_stop(ctx, &shapes_by_id, *lat_lon, variance_threshold);
                    if tx.send((ctx.stop_id.clone(), direction)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);
    });

    let results: Vec<(String, Option<Direction>)> = rx.into_iter().collect();
    let mut written = 0usize;

    for batch in results.chunks(WRITE_BATCH_SIZE) {
        if cancellation.is_cancelled() {
            warn!(written, "direction precompute cancelled before completion");
            break;
        }
        let mut tx = pool.begin().await?;
        queries::update_stop_directions_batch(&mut tx, batch).await?;
        tx.commit().await?;
        written += batch.len();
        debug!(written, total = results.len(), "wrote direction batch");
    }

    info!(written, "direction precompute complete");
    Ok(written)
}

/// Groups a trip's ordered stop_times into `(stop_id, next_stop_id)`
/// bearings input for the next-stop fallback, keyed by stop_id with the
/// first trip encountered winning (the "most common trip" tie-break is
/// approximated by first-seen, since trip frequency isn't tracked here).
pub fn next_stop_bearings_from_trip(stop_times: &[StopTime], stop_lat_lon: &HashMap<String, (f64, f64)>) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    for pair in stop_times.windows(2) {
        let (from, to) = (&pair[0], &pair[1]);
        if out.contains_key(&from.stop_id) {
            continue;
        }
        if let (Some(&(lat1, lon1)), Some(&(lat2, lon2))) =
            (stop_lat_lon.get(&from.stop_id), stop_lat_lon.get(&to.stop_id))
        {
            out.insert(from.stop_id.clone(), bearing_degrees(lat1, lon1, lat2, lon2));
        }
    }
    out
}

pub const DEFAULT_THRESHOLD: f64 = DEFAULT_VARIANCE_THRESHOLD;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearing_due_east_is_roughly_ninety_degrees() {
        let b = bearing_degrees(40.0, -122.0, 40.0, -121.0);
        assert!((b - 90.0).abs() < 1.0, "bearing was {b}");
    }

    #[test]
    fn circular_mean_of_identical_bearings_has_zero_variance() {
        let (mean, variance) = circular_mean_and_variance(&[45.0, 45.0, 45.0]);
        assert!((mean - 45.0).abs() < 1e-6);
        assert!(variance < 1e-9);
    }

    #[test]
    fn circular_variance_is_high_for_opposite_bearings() {
        let (_, variance) = circular_mean_and_variance(&[0.0, 180.0]);
        assert!(variance > 0.9, "variance was {variance}");
    }

    #[test]
    fn author_supplied_direction_wins_over_shape_derivation() {
        let ctx = StopContext {
            stop_id: "s1".to_string(),
            author_direction: Some(Direction::N),
            shape_refs: vec![],
            next_stop_bearing: Some(90.0),
        };
        let result = compute_direction_for_stop(&ctx, &HashMap::new(), (0.0, 0.0), DEFAULT_THRESHOLD);
        assert_eq!(result, Some(Direction::N));
    }

    #[test]
    fn falls_back_to_next_stop_bearing_when_no_shape_available() {
        let ctx = StopContext {
            stop_id: "s1".to_string(),
            author_direction: None,
            shape_refs: vec![],
            next_stop_bearing: Some(90.0),
        };
        let result = compute_direction_for_stop(&ctx, &HashMap::new(), (0.0, 0.0), DEFAULT_THRESHOLD);
        assert_eq!(result, Some(Direction::E));
    }

    #[test]
    fn high_variance_from_shape_bearings_yields_unknown() {
        let shapes = HashMap::from([(
            "shape-a".to_string(),
            vec![
                ShapePoint { sequence: 0, lat: 0.0, lon: 0.0, dist_traveled: None },
                ShapePoint { sequence: 1, lat: 0.0, lon: 1.0, dist_traveled: None },
            ],
        ), (
            "shape-b".to_string(),
            vec![
                ShapePoint { sequence: 0, lat: 0.0, lon: 0.0, dist_traveled: None },
                ShapePoint { sequence: 1, lat: -1.0, lon: 0.0, dist_traveled: None },
            ],
        )]);
        let ctx = StopContext {
            stop_id: "s1".to_string(),
            author_direction: None,
            shape_refs: vec![("shape-a".to_string(), None), ("shape-b".to_string(), None)],
            next_stop_bearing: None,
        };
        let result = compute_direction_for_stop(&ctx, &shapes, (0.0, 0.0), DEFAULT_THRESHOLD);
        assert_eq!(result, None);
    }
}
