//! Exercises the Feed Merger as a whole through its public API: two small,
//! hand-built `StaticFeed`s combined under each strategy.

use gtfs_dataplane::error::{ConfigError, MergeError};
use gtfs_dataplane::merge::{merge_feeds, MergeConfig, MergeStrategy, RenameMode};
use gtfs_dataplane::model::{
    Agency, Calendar, ContinuousPolicy, LocationType, PickupDropOffType, Route, StaticFeed, Stop, StopTime, Trip,
};
use chrono::NaiveDate;

fn agency(id: &str) -> Agency {
    Agency {
        id: id.to_string(),
        name: "Metro Transit".to_string(),
        url: "https://example.com".to_string(),
        timezone: "America/Los_Angeles".to_string(),
        lang: None,
        phone: None,
        email: None,
        fare_url: None,
    }
}

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

fn route(id: &str, agency_id: &str) -> Route {
    Route {
        id: id.to_string(),
        agency_id: Some(agency_id.to_string()),
        short_name: Some("1".to_string()),
        long_name: Some("Downtown Loop".to_string()),
        description: None,
        route_type: 3,
        url: None,
        color: None,
        text_color: None,
        continuous_pickup: ContinuousPolicy::NotAvailable,
        continuous_drop_off: ContinuousPolicy::NotAvailable,
    }
}

fn calendar(service_id: &str) -> Calendar {
    Calendar {
        service_id: service_id.to_string(),
        days: [true, true, true, true, true, false, false],
        start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
    }
}

fn trip(id: &str, route_id: &str, service_id: &str) -> Trip {
    Trip {
        id: id.to_string(),
        route_id: route_id.to_string(),
        service_id: service_id.to_string(),
        headsign: None,
        short_name: None,
        direction_id: Some(0),
        block_id: None,
        shape_id: None,
        wheelchair_accessible: None,
        bikes_allowed: None,
    }
}

fn stop_time(trip_id: &str, seq: i32, stop_id: &str) -> StopTime {
    StopTime {
        trip_id: trip_id.to_string(),
        stop_sequence: seq,
        stop_id: stop_id.to_string(),
        arrival_time: Some(seq as i32 * 600),
        departure_time: Some(seq as i32 * 600),
        pickup_type: PickupDropOffType::RegularlyScheduled,
        drop_off_type: PickupDropOffType::RegularlyScheduled,
        shape_dist_traveled: None,
    }
}

/// Two feeds describing the same agency's network, but with a slightly
/// jittered coordinate for the shared stop and otherwise-disjoint ids —
/// the shape a regional aggregator sees combining two adjacent operators'
/// exports of a shared transfer point.
fn two_feeds_sharing_one_stop() -> (StaticFeed, StaticFeed) {
    let mut feed_a = StaticFeed::new();
    feed_a.agencies.push(agency("agency-a"));
    feed_a.stops.push(stop("stop-shared-a", "Central Station", 47.6097, -122.3331));
    feed_a.stops.push(stop("stop-a2", "A Loop End", 47.62, -122.35));
    feed_a.routes.push(route("route-a", "agency-a"));
    feed_a.calendars.push(calendar("service-a"));
    feed_a.trips.push(trip("trip-a", "route-a", "service-a"));
    feed_a.stop_times.push(stop_time("trip-a", 1, "stop-shared-a"));
    feed_a.stop_times.push(stop_time("trip-a", 2, "stop-a2"));

    let mut feed_b = StaticFeed::new();
    feed_b.agencies.push(agency("agency-b"));
    // Same real-world stop, near-identical name, coordinates 10m off.
    feed_b.stops.push(stop("stop-shared-b", "Central Station", 47.60975, -122.33315));
    feed_b.stops.push(stop("stop-b2", "B Loop End", 47.63, -122.36));
    feed_b.routes.push(route("route-b", "agency-b"));
    feed_b.calendars.push(calendar("service-b"));
    feed_b.trips.push(trip("trip-b", "route-b", "service-b"));
    feed_b.stop_times.push(stop_time("trip-b", 1, "stop-shared-b"));
    feed_b.stop_times.push(stop_time("trip-b", 2, "stop-b2"));

    (feed_a, feed_b)
}

#[test]
fn fuzzy_merge_collapses_near_duplicate_stop_and_keeps_both_trips() {
    let (feed_a, feed_b) = two_feeds_sharing_one_stop();
    let config = MergeConfig {
        strategy: MergeStrategy::Fuzzy,
        rename_mode: RenameMode::Context,
        fuzzy_threshold: 0.5,
    };

    let merged = merge_feeds(vec![feed_a, feed_b], &config).expect("merge should succeed");

    // The two near-identical "Central Station" stops collapse into one.
    assert_eq!(merged.stops.len(), 3, "shared stop dedups, the two loop-end stops stay distinct");
    assert_eq!(merged.trips.len(), 2, "both operators' trips survive the merge");

    let stop_ids: std::collections::HashSet<&str> = merged.stops.iter().map(|s| s.id.as_str()).collect();
    for st in &merged.stop_times {
        assert!(stop_ids.contains(st.stop_id.as_str()), "stop_time {:?} references a dropped stop id", st);
    }
}

#[test]
fn none_strategy_renames_colliding_ids_instead_of_deduping() {
    let mut feed_a = StaticFeed::new();
    feed_a.agencies.push(agency("agency-1"));
    feed_a.routes.push(route("route1", "agency-1"));

    let mut feed_b = StaticFeed::new();
    feed_b.agencies.push(agency("agency-1"));
    feed_b.routes.push(route("route1", "agency-1"));

    let config = MergeConfig {
        strategy: MergeStrategy::None,
        rename_mode: RenameMode::Context,
        fuzzy_threshold: 0.5,
    };

    let merged = merge_feeds(vec![feed_a, feed_b], &config).expect("merge should succeed");

    assert_eq!(merged.routes.len(), 2, "NONE never dedups, only renames on collision");
    let ids: std::collections::HashSet<&str> = merged.routes.iter().map(|r| r.id.as_str()).collect();
    assert!(ids.contains("route1"));
    assert!(ids.iter().any(|id| *id != "route1"), "the colliding id must be renamed, not dropped");
}

#[test]
fn agency_rename_mode_is_rejected_up_front() {
    let config = MergeConfig {
        strategy: MergeStrategy::Identity,
        rename_mode: RenameMode::Agency,
        fuzzy_threshold: 0.5,
    };

    let err = merge_feeds(vec![StaticFeed::new(), StaticFeed::new()], &config).expect_err("AGENCY rename mode is unimplemented");
    assert!(matches!(err, MergeError::Config(ConfigError::AgencyRenameModeUnimplemented)));
}

#[test]
fn merging_a_single_feed_returns_it_unchanged() {
    let (feed_a, _) = two_feeds_sharing_one_stop();
    let expected_stop_count = feed_a.stops.len();
    let config = MergeConfig::default();

    let merged = merge_feeds(vec![feed_a], &config).expect("merge of one feed should succeed");
    assert_eq!(merged.stops.len(), expected_stop_count);
}
