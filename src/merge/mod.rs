//! Feed Merger: combines an ordered list of parsed static feeds into one.
//!
//! Feeds are numbered by caller position; the last is "newest" and is
//! copied wholesale, older feeds are merged into the accumulator in
//! reverse order so that renamed collisions always belong to the older
//! side. Processing per feed is dependency-ordered (agencies -> stops ->
//! routes -> shapes -> trips+frequencies -> services -> transfers) so that
//! every outbound reference can be rewritten against an already-complete
//! replacement map before the entity that carries it is itself merged.
//!
//! Uses the same arena + id-indirection model as the rest of the crate
//! (see `crate::model`): merging is a linear walk over id fields rather
//! than a pointer-graph rewrite.

pub mod scorers;

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, MergeError};
use crate::model::{Agency, Calendar, Frequency, Route, StaticFeed, Stop, StopTime, Transfer, Trip};

const AUTO_SAMPLE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStrategy {
    Identity,
    Fuzzy,
    None,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenameMode {
    Context,
    /// Not implemented: prefixing collisions by `agency_id` instead of feed
    /// index. Selecting it is a construction-time `ConfigError`, not a
    /// silent fallback to `Context`.
    Agency,
}

#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,
    pub rename_mode: RenameMode,
    pub fuzzy_threshold: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Auto,
            rename_mode: RenameMode::Context,
            fuzzy_threshold: 0.5,
        }
    }
}

/// Merges `feeds` per `config`. `feeds` is treated as oldest-to-newest;
/// the last element is copied wholesale and older ones are folded in.
pub fn merge_feeds(mut feeds: Vec<StaticFeed>, config: &MergeConfig) -> Result<StaticFeed, MergeError> {
    if config.rename_mode == RenameMode::Agency {
        return Err(MergeError::Config(ConfigError::AgencyRenameModeUnimplemented));
    }
    let Some(mut acc) = feeds.pop() else {
        return Ok(StaticFeed::new());
    };
    for (feed_idx, feed) in feeds.into_iter().enumerate().rev() {
        acc = merge_one(acc, feed, feed_idx, config)?;
    }
    Ok(acc)
}

fn merge_one(mut acc: StaticFeed, incoming: StaticFeed, feed_idx: usize, config: &MergeConfig) -> Result<StaticFeed, MergeError> {
    let strategy = match config.strategy {
        MergeStrategy::Auto => detect_strategy(&acc, &incoming, config.fuzzy_threshold),
        other => other,
    };

    let StaticFeed {
        agencies,
        stops,
        routes,
        calendars,
        calendar_dates,
        trips,
        mut stop_times,
        shapes,
        mut transfers,
        frequencies,
    } = incoming;

    let agency_map = merge_agencies(&mut acc, agencies, strategy, config.fuzzy_threshold, feed_idx);

    let stop_map = merge_stops(&mut acc, stops, strategy, config.fuzzy_threshold, feed_idx);
    for st in &mut stop_times {
        st.stop_id = resolve_id(&stop_map, &st.stop_id, "stop")?;
    }
    for t in &mut transfers {
        t.from_stop_id = resolve_id(&stop_map, &t.from_stop_id, "stop")?;
        t.to_stop_id = resolve_id(&stop_map, &t.to_stop_id, "stop")?;
    }

    let route_map = merge_routes(&mut acc, routes, &agency_map, strategy, config.fuzzy_threshold, feed_idx)?;
    let shape_map = merge_shapes(&mut acc, shapes, strategy, feed_idx);

    let mut trips = trips;
    for trip in &mut trips {
        trip.route_id = resolve_id(&route_map, &trip.route_id, "route")?;
        if let Some(shape_id) = trip.shape_id.take() {
            trip.shape_id = Some(resolve_id(&shape_map, &shape_id, "shape")?);
        }
    }

    let acc_trip_stops = stop_ids_by_trip(&acc.stop_times);
    let incoming_trip_stops = stop_ids_by_trip(&stop_times);
    let (trip_map, deferred_service_rewrites) = merge_trips(
        &mut acc,
        trips,
        frequencies,
        strategy,
        config.fuzzy_threshold,
        feed_idx,
        &acc_trip_stops,
        &incoming_trip_stops,
    );

    for st in &mut stop_times {
        st.trip_id = resolve_id(&trip_map, &st.trip_id, "trip")?;
    }
    acc.stop_times.extend(stop_times);

    let service_map = merge_services(&mut acc, calendars, calendar_dates, strategy, config.fuzzy_threshold, feed_idx);
    for (acc_index, original_service_id) in deferred_service_rewrites {
        acc.trips[acc_index].service_id = resolve_id(&service_map, &original_service_id, "service")?;
    }

    merge_transfers(&mut acc, transfers, strategy, config.fuzzy_threshold);

    Ok(acc)
}

/// Samples up to `AUTO_SAMPLE_SIZE` stops from each side. IDENTITY if most
/// of A's sampled ids reappear in B and those pairs score well on average;
/// else FUZZY if a majority of A's sample has some match in B above
/// threshold; else NONE.
fn detect_strategy(acc: &StaticFeed, incoming: &StaticFeed, threshold: f64) -> MergeStrategy {
    let sample_a: Vec<&Stop> = acc.stops.iter().take(AUTO_SAMPLE_SIZE).collect();
    let sample_b: Vec<&Stop> = incoming.stops.iter().take(AUTO_SAMPLE_SIZE).collect();
    if sample_a.is_empty() || sample_b.is_empty() {
        return MergeStrategy::None;
    }

    let id_overlap: Vec<(&Stop, &Stop)> = sample_a
        .iter()
        .filter_map(|a| sample_b.iter().find(|b| b.id == a.id).map(|b| (*a, *b)))
        .collect();
    let overlap_fraction = id_overlap.len() as f64 / sample_a.len() as f64;
    if overlap_fraction > 0.5 {
        let avg_similarity =
            id_overlap.iter().map(|(a, b)| scorers::score_stop(a, b)).sum::<f64>() / id_overlap.len() as f64;
        if avg_similarity > 0.5 {
            return MergeStrategy::Identity;
        }
    }

    let matched = sample_a
        .iter()
        .filter(|a| sample_b.iter().any(|b| scorers::score_stop(a, b) >= threshold))
        .count();
    if matched as f64 / sample_a.len() as f64 > 0.5 {
        MergeStrategy::Fuzzy
    } else {
        MergeStrategy::None
    }
}

fn identity_matches<T>(
    haystack: &[T],
    candidates: &[T],
    id_of: impl Fn(&T) -> &str,
    eq: impl Fn(&T, &T) -> bool,
) -> HashMap<usize, String> {
    let mut out = HashMap::new();
    for (i, c) in candidates.iter().enumerate() {
        if let Some(h) = haystack.iter().find(|h| eq(h, c)) {
            out.insert(i, id_of(h).to_string());
        }
    }
    out
}

/// Each worker scans a disjoint slice of `haystack` (the accumulator side)
/// against every entry of `candidates` (the incoming side), emitting
/// above-threshold scores on a shared channel; the best score per
/// candidate is kept.
fn parallel_fuzzy_matches<T: Sync>(
    haystack: &[T],
    candidates: &[T],
    threshold: f64,
    score: impl Fn(&T, &T) -> f64 + Sync,
    id_of: impl Fn(&T) -> &str + Sync,
) -> HashMap<usize, String> {
    if haystack.is_empty() || candidates.is_empty() {
        return HashMap::new();
    }
    let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let chunk_size = haystack.len().div_ceil(worker_count.max(1)).max(1);
    let (tx, rx) = mpsc::channel::<(usize, String, f64)>();

    std::thread::scope(|scope| {
        let score = &score;
        let id_of = &id_of;
        for chunk in haystack.chunks(chunk_size) {
            let tx = tx.clone();
            scope.spawn(move || {
                for h in chunk {
                    let h_id = id_of(h).to_string();
                    for (i, c) in candidates.iter().enumerate() {
                        let s = score(h, c);
                        if s >= threshold && tx.send((i, h_id.clone(), s)).is_err() {
                            return;
                        }
                    }
                }
            });
        }
        drop(tx);
    });

    let mut best: HashMap<usize, (String, f64)> = HashMap::new();
    for (idx, id, s) in rx {
        best.entry(idx).and_modify(|e| if s > e.1 { *e = (id.clone(), s); }).or_insert((id, s));
    }
    best.into_iter().map(|(k, (id, _))| (k, id)).collect()
}

fn compute_matches<T: Sync>(
    haystack: &[T],
    candidates: &[T],
    strategy: MergeStrategy,
    threshold: f64,
    id_of: impl Fn(&T) -> &str + Sync,
    eq: impl Fn(&T, &T) -> bool,
    score: impl Fn(&T, &T) -> f64 + Sync,
) -> HashMap<usize, String> {
    match strategy {
        MergeStrategy::None => HashMap::new(),
        MergeStrategy::Identity => identity_matches(haystack, candidates, id_of, eq),
        MergeStrategy::Fuzzy => parallel_fuzzy_matches(haystack, candidates, threshold, score, id_of),
        MergeStrategy::Auto => unreachable!("strategy is resolved to a concrete variant before matching"),
    }
}

/// `a`, `b`, `c`, ... `z`, `aa`, `ab`, ... by feed index, for `CONTEXT`
/// rename prefixing.
fn prefix_for_index(index: usize) -> String {
    let mut n = index;
    let mut out = Vec::new();
    loop {
        out.push((b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.iter().rev().collect()
}

fn assign_id(existing: &HashSet<String>, original: &str, prefix: &str) -> String {
    if !existing.contains(original) {
        return original.to_string();
    }
    let base = format!("{prefix}-{original}");
    if !existing.contains(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !existing.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Follows `old_id -> new_id` chains with a visited-set cycle guard. Ids
/// absent from the map belong to entities that weren't touched this round
/// (already-canonical acc entities) and resolve to themselves.
fn resolve_id(map: &HashMap<String, String>, id: &str, entity_type: &'static str) -> Result<String, MergeError> {
    let mut current = id.to_string();
    let mut visited = HashSet::new();
    while let Some(next) = map.get(&current) {
        if next == &current {
            break;
        }
        if !visited.insert(current.clone()) {
            return Err(MergeError::ReferenceCycle { entity_type, id: id.to_string() });
        }
        current = next.clone();
    }
    Ok(current)
}

fn stop_ids_by_trip(stop_times: &[StopTime]) -> HashMap<String, HashSet<String>> {
    let mut out: HashMap<String, HashSet<String>> = HashMap::new();
    for st in stop_times {
        out.entry(st.trip_id.clone()).or_default().insert(st.stop_id.clone());
    }
    out
}

fn merge_agencies(
    acc: &mut StaticFeed,
    incoming: Vec<Agency>,
    strategy: MergeStrategy,
    threshold: f64,
    feed_idx: usize,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut existing_ids: HashSet<String> = acc.agencies.iter().map(|a| a.id.clone()).collect();
    let prefix = prefix_for_index(feed_idx);

    let matches = compute_matches(
        &acc.agencies,
        &incoming,
        strategy,
        threshold,
        |a: &Agency| a.id.as_str(),
        |a, b| a.id == b.id,
        scorers::score_agency,
    );

    for (i, mut agency) in incoming.into_iter().enumerate() {
        if let Some(target) = matches.get(&i) {
            map.insert(agency.id.clone(), target.clone());
        } else {
            let new_id = assign_id(&existing_ids, &agency.id, &prefix);
            existing_ids.insert(new_id.clone());
            map.insert(agency.id.clone(), new_id.clone());
            agency.id = new_id;
            acc.agencies.push(agency);
        }
    }
    map
}

fn merge_stops(
    acc: &mut StaticFeed,
    incoming: Vec<Stop>,
    strategy: MergeStrategy,
    threshold: f64,
    feed_idx: usize,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut existing_ids: HashSet<String> = acc.stops.iter().map(|s| s.id.clone()).collect();
    let prefix = prefix_for_index(feed_idx);

    let matches = compute_matches(
        &acc.stops,
        &incoming,
        strategy,
        threshold,
        |s: &Stop| s.id.as_str(),
        |a, b| a.id == b.id,
        scorers::score_stop,
    );

    let mut to_insert = Vec::new();
    for (i, mut stop) in incoming.into_iter().enumerate() {
        if let Some(target) = matches.get(&i) {
            map.insert(stop.id.clone(), target.clone());
        } else {
            let new_id = assign_id(&existing_ids, &stop.id, &prefix);
            existing_ids.insert(new_id.clone());
            map.insert(stop.id.clone(), new_id.clone());
            stop.id = new_id;
            to_insert.push(stop);
        }
    }

    for mut stop in to_insert {
        if let Some(parent) = stop.parent_station.take() {
            stop.parent_station = Some(map.get(&parent).cloned().unwrap_or(parent));
        }
        acc.stops.push(stop);
    }

    map
}

fn merge_routes(
    acc: &mut StaticFeed,
    incoming: Vec<Route>,
    agency_map: &HashMap<String, String>,
    strategy: MergeStrategy,
    threshold: f64,
    feed_idx: usize,
) -> Result<HashMap<String, String>, MergeError> {
    let mut incoming = incoming;
    for route in &mut incoming {
        if let Some(a) = route.agency_id.take() {
            route.agency_id = Some(resolve_id(agency_map, &a, "agency")?);
        }
    }

    let mut map = HashMap::new();
    let mut existing_ids: HashSet<String> = acc.routes.iter().map(|r| r.id.clone()).collect();
    let prefix = prefix_for_index(feed_idx);

    let matches = compute_matches(
        &acc.routes,
        &incoming,
        strategy,
        threshold,
        |r: &Route| r.id.as_str(),
        |a, b| a.id == b.id,
        scorers::score_route,
    );

    for (i, mut route) in incoming.into_iter().enumerate() {
        if let Some(target) = matches.get(&i) {
            map.insert(route.id.clone(), target.clone());
        } else {
            let new_id = assign_id(&existing_ids, &route.id, &prefix);
            existing_ids.insert(new_id.clone());
            map.insert(route.id.clone(), new_id.clone());
            route.id = new_id;
            acc.routes.push(route);
        }
    }
    Ok(map)
}

/// Shapes have no dedicated scorer; an equal `shape_id` under a
/// dedup-aware strategy is treated as the same polyline, otherwise a
/// collision is simply renamed.
fn merge_shapes(
    acc: &mut StaticFeed,
    incoming: Vec<(String, crate::model::ShapePoint)>,
    strategy: MergeStrategy,
    feed_idx: usize,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut existing_ids: HashSet<String> = acc.shapes.iter().map(|(id, _)| id.clone()).collect();
    let prefix = prefix_for_index(feed_idx);

    let mut order = Vec::new();
    let mut grouped: HashMap<String, Vec<crate::model::ShapePoint>> = HashMap::new();
    for (id, point) in incoming {
        if !grouped.contains_key(&id) {
            order.push(id.clone());
        }
        grouped.entry(id).or_default().push(point);
    }

    for shape_id in order {
        let points = grouped.remove(&shape_id).unwrap_or_default();
        if strategy != MergeStrategy::None && existing_ids.contains(&shape_id) {
            map.insert(shape_id.clone(), shape_id);
            continue;
        }
        let new_id = assign_id(&existing_ids, &shape_id, &prefix);
        existing_ids.insert(new_id.clone());
        map.insert(shape_id, new_id.clone());
        for point in points {
            acc.shapes.push((new_id.clone(), point));
        }
    }

    map
}

#[allow(clippy::too_many_arguments)]
fn merge_trips(
    acc: &mut StaticFeed,
    incoming_trips: Vec<Trip>,
    incoming_frequencies: Vec<Frequency>,
    strategy: MergeStrategy,
    threshold: f64,
    feed_idx: usize,
    acc_trip_stops: &HashMap<String, HashSet<String>>,
    incoming_trip_stops: &HashMap<String, HashSet<String>>,
) -> (HashMap<String, String>, Vec<(usize, String)>) {
    let mut map = HashMap::new();
    let mut deferred_service_rewrites = Vec::new();
    let mut existing_ids: HashSet<String> = acc.trips.iter().map(|t| t.id.clone()).collect();
    let prefix = prefix_for_index(feed_idx);

    let acc_ctx: Vec<(Trip, HashSet<String>)> = acc
        .trips
        .iter()
        .cloned()
        .map(|t| {
            let stops = acc_trip_stops.get(&t.id).cloned().unwrap_or_default();
            (t, stops)
        })
        .collect();
    let inc_ctx: Vec<(Trip, HashSet<String>)> = incoming_trips
        .iter()
        .cloned()
        .map(|t| {
            let stops = incoming_trip_stops.get(&t.id).cloned().unwrap_or_default();
            (t, stops)
        })
        .collect();

    let matches = compute_matches(
        &acc_ctx,
        &inc_ctx,
        strategy,
        threshold,
        |(t, _): &(Trip, HashSet<String>)| t.id.as_str(),
        |(a, _), (b, _)| a.id == b.id && a.route_id == b.route_id,
        |(a, as_), (b, bs)| scorers::score_trip(a, as_, b, bs),
    );

    let mut freq_by_trip: HashMap<String, Vec<Frequency>> = HashMap::new();
    for f in incoming_frequencies {
        freq_by_trip.entry(f.trip_id.clone()).or_default().push(f);
    }

    for (i, mut trip) in incoming_trips.into_iter().enumerate() {
        let original_id = trip.id.clone();
        let original_service = trip.service_id.clone();

        if let Some(target_id) = matches.get(&i) {
            map.insert(original_id.clone(), target_id.clone());
            if let Some(freqs) = freq_by_trip.remove(&original_id) {
                for f in freqs {
                    let duplicate = acc
                        .frequencies
                        .iter()
                        .any(|existing| existing.trip_id == *target_id && scorers::frequencies_are_duplicates(existing, &f));
                    if !duplicate {
                        acc.frequencies.push(Frequency { trip_id: target_id.clone(), ..f });
                    }
                }
            }
        } else {
            let new_id = assign_id(&existing_ids, &original_id, &prefix);
            existing_ids.insert(new_id.clone());
            map.insert(original_id.clone(), new_id.clone());
            trip.id = new_id.clone();
            acc.trips.push(trip);
            deferred_service_rewrites.push((acc.trips.len() - 1, original_service));

            if let Some(freqs) = freq_by_trip.remove(&original_id) {
                for f in freqs {
                    acc.frequencies.push(Frequency { trip_id: new_id.clone(), ..f });
                }
            }
        }
    }

    (map, deferred_service_rewrites)
}

/// Merges calendars and, separately, calendar date exceptions. A date kept
/// in both `Added` and `Removed` for the same service after merging two
/// conflicting sources is preserved as-is, not reconciled — a deliberate
/// non-resolution the consumer must handle.
fn merge_services(
    acc: &mut StaticFeed,
    incoming_calendars: Vec<Calendar>,
    incoming_dates: Vec<(String, crate::model::CalendarDate)>,
    strategy: MergeStrategy,
    threshold: f64,
    feed_idx: usize,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut existing_ids: HashSet<String> = acc.calendars.iter().map(|c| c.service_id.clone()).collect();
    let prefix = prefix_for_index(feed_idx);

    let matches = compute_matches(
        &acc.calendars,
        &incoming_calendars,
        strategy,
        threshold,
        |c: &Calendar| c.service_id.as_str(),
        |a, b| a.service_id == b.service_id,
        scorers::score_service,
    );

    for (i, mut cal) in incoming_calendars.into_iter().enumerate() {
        if let Some(target) = matches.get(&i) {
            map.insert(cal.service_id.clone(), target.clone());
        } else {
            let new_id = assign_id(&existing_ids, &cal.service_id, &prefix);
            existing_ids.insert(new_id.clone());
            map.insert(cal.service_id.clone(), new_id.clone());
            cal.service_id = new_id;
            acc.calendars.push(cal);
        }
    }

    for (service_id, date) in incoming_dates {
        let target = map.get(&service_id).cloned().unwrap_or(service_id);
        let already_present = acc
            .calendar_dates
            .iter()
            .any(|(sid, d)| *sid == target && d.date == date.date && d.exception_type == date.exception_type);
        if !already_present {
            acc.calendar_dates.push((target, date));
        }
    }
    acc.calendar_dates.sort_by(|(sid_a, a), (sid_b, b)| sid_a.cmp(sid_b).then(a.date.cmp(&b.date)));

    map
}

/// Transfers carry no id of their own; a match just drops the incoming
/// duplicate, it never feeds a reference map.
fn merge_transfers(acc: &mut StaticFeed, incoming: Vec<Transfer>, strategy: MergeStrategy, threshold: f64) {
    let matches = compute_matches(
        &acc.transfers,
        &incoming,
        strategy,
        threshold,
        |_: &Transfer| "",
        |a, b| a.from_stop_id == b.from_stop_id && a.to_stop_id == b.to_stop_id,
        scorers::score_transfer,
    );
    for (i, transfer) in incoming.into_iter().enumerate() {
        if !matches.contains_key(&i) {
            acc.transfers.push(transfer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContinuousPolicy, LocationType};

    fn stop(id: &str, name: &str, lat: f64, lon: f64) -> Stop {
        Stop {
            id: id.to_string(),
            code: None,
            name: Some(name.to_string()),
            lat,
            lon,
            parent_station: None,
            location_type: LocationType::Stop,
            wheelchair_boarding: None,
            direction: None,
        }
    }

    fn route(id: &str) -> Route {
        Route {
            id: id.to_string(),
            agency_id: None,
            short_name: Some(id.to_string()),
            long_name: None,
            description: None,
            route_type: 3,
            url: None,
            color: None,
            text_color: None,
            continuous_pickup: ContinuousPolicy::NotAvailable,
            continuous_drop_off: ContinuousPolicy::NotAvailable,
        }
    }

    fn trip(id: &str, route_id: &str) -> Trip {
        Trip {
            id: id.to_string(),
            route_id: route_id.to_string(),
            service_id: "svc".to_string(),
            headsign: None,
            short_name: None,
            direction_id: None,
            block_id: None,
            shape_id: None,
            wheelchair_accessible: None,
            bikes_allowed: None,
        }
    }

    #[test]
    fn fuzzy_stop_merge_collapses_near_duplicates_and_rewrites_trip_stop_times() {
        let mut feed_a = StaticFeed::new();
        feed_a.stops.push(stop("stop1", "Main St", 40.7589, -73.9851));
        feed_a.routes.push(route("r1"));
        feed_a.trips.push(trip("t1", "r1"));
        feed_a.stop_times.push(StopTime {
            trip_id: "t1".to_string(),
            stop_sequence: 1,
            stop_id: "stop1".to_string(),
            arrival_time: Some(0),
            departure_time: Some(0),
            pickup_type: crate::model::PickupDropOffType::RegularlyScheduled,
            drop_off_type: crate::model::PickupDropOffType::RegularlyScheduled,
            shape_dist_traveled: None,
        });

        let mut feed_b = StaticFeed::new();
        feed_b.stops.push(stop("different-id", "Main St", 40.7590, -73.9851));
        feed_b.routes.push(route("r1"));

        let config = MergeConfig { strategy: MergeStrategy::Fuzzy, rename_mode: RenameMode::Context, fuzzy_threshold: 0.5 };
        let merged = merge_feeds(vec![feed_a, feed_b], &config).expect("merge succeeds");

        assert_eq!(merged.stops.len(), 1);
        assert_eq!(merged.stop_times[0].stop_id, merged.stops[0].id);
    }

    #[test]
    fn none_strategy_renames_colliding_route_ids() {
        let mut feed_a = StaticFeed::new();
        feed_a.routes.push(route("route1"));
        feed_a.trips.push(trip("t1", "route1"));

        let mut feed_b = StaticFeed::new();
        feed_b.routes.push(route("route1"));

        let config = MergeConfig { strategy: MergeStrategy::None, rename_mode: RenameMode::Context, fuzzy_threshold: 0.5 };
        let merged = merge_feeds(vec![feed_b, feed_a], &config).expect("merge succeeds");

        let ids: HashSet<&str> = merged.routes.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains("route1"));
        assert!(ids.contains("a-route1"));
    }

    #[test]
    fn agency_rename_mode_is_rejected_at_merge_time() {
        let config = MergeConfig { strategy: MergeStrategy::Identity, rename_mode: RenameMode::Agency, fuzzy_threshold: 0.5 };
        let err = merge_feeds(vec![StaticFeed::new(), StaticFeed::new()], &config).unwrap_err();
        assert!(matches!(err, MergeError::Config(ConfigError::AgencyRenameModeUnimplemented)));
    }

    #[test]
    fn prefix_for_index_follows_spreadsheet_style_base26() {
        assert_eq!(prefix_for_index(0), "a");
        assert_eq!(prefix_for_index(25), "z");
        assert_eq!(prefix_for_index(26), "aa");
    }
}
