//! Per-entity-type similarity scorers used by the FUZZY merge strategy.
//!
//! Every scorer returns a value in `[0, 1]`; the merger treats anything
//! `>= threshold` (default 0.5) as "same real-world entity". Kept as free
//! functions rather than a trait object registry — the entity set is closed
//! (GTFS defines the tables), so a sum type dispatching to these functions
//! is enough and keeps the hot FUZZY-scan loop free of vtable calls.

use std::collections::HashSet;

use crate::model::{Agency, Calendar, Route, Stop, Trip};
use crate::spatial::haversine_distance_m;

/// Case/whitespace-normalized exact-name comparison. Uses `strsim`'s
/// Jaro-Winkler distance only to tolerate incidental Unicode whitespace
/// noise between feeds that otherwise agree on the name; this is not a
/// fuzzy "close enough" match — 0.97 is far above the similarity two
/// genuinely different names would score.
fn names_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim().to_lowercase(), b.trim().to_lowercase());
    a == b || strsim::jaro_winkler(&a, &b) >= 0.97
}

fn optional_names_match(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => names_match(a, b),
        _ => false,
    }
}

/// `None` if the field should be skipped (absent or empty on either side),
/// `Some(matched)` otherwise.
fn field_match(a: Option<&str>, b: Option<&str>) -> Option<bool> {
    let a = a.filter(|s| !s.is_empty())?;
    let b = b.filter(|s| !s.is_empty())?;
    Some(a.eq_ignore_ascii_case(b))
}

fn average_matches(fields: &[Option<bool>]) -> f64 {
    let present: Vec<bool> = fields.iter().filter_map(|f| *f).collect();
    if present.is_empty() {
        return 0.0;
    }
    present.iter().filter(|m| **m).count() as f64 / present.len() as f64
}

fn distance_bucket(distance_m: f64) -> f64 {
    if distance_m < 50.0 {
        1.0
    } else if distance_m < 100.0 {
        0.75
    } else if distance_m < 500.0 {
        0.5
    } else {
        0.0
    }
}

/// 0.5 x exact-name-match + 0.5 x distance-bucket(haversine).
pub fn score_stop(a: &Stop, b: &Stop) -> f64 {
    let name = if optional_names_match(a.name.as_deref(), b.name.as_deref()) { 1.0 } else { 0.0 };
    let distance = distance_bucket(haversine_distance_m(a.lat, a.lon, b.lat, b.lon));
    0.5 * name + 0.5 * distance
}

/// Average of {agency-id match, short-name match, long-name match}, fields
/// absent on either side skipped from the average.
pub fn score_route(a: &Route, b: &Route) -> f64 {
    average_matches(&[
        field_match(a.agency_id.as_deref(), b.agency_id.as_deref()),
        field_match(a.short_name.as_deref(), b.short_name.as_deref()),
        field_match(a.long_name.as_deref(), b.long_name.as_deref()),
    ])
}

/// Average of matches over {name, timezone, url, phone, email, language,
/// fare_url}, fields empty on either side skipped.
pub fn score_agency(a: &Agency, b: &Agency) -> f64 {
    average_matches(&[
        field_match(Some(a.name.as_str()), Some(b.name.as_str())),
        field_match(Some(a.timezone.as_str()), Some(b.timezone.as_str())),
        field_match(Some(a.url.as_str()), Some(b.url.as_str())),
        field_match(a.phone.as_deref(), b.phone.as_deref()),
        field_match(a.email.as_deref(), b.email.as_deref()),
        field_match(a.lang.as_deref(), b.lang.as_deref()),
        field_match(a.fare_url.as_deref(), b.fare_url.as_deref()),
    ])
}

/// Mean of (weekday-pattern-match-fraction over 7 days, Jaccard of date
/// ranges measured in day-count). The Jaccard term treats each calendar's
/// `[start_date, end_date]` as an interval and compares overlap/union in
/// days, since the two calendars' individual active-date sets are exactly
/// the weekday pattern folded over that interval — already captured by the
/// first term.
pub fn score_service(a: &Calendar, b: &Calendar) -> f64 {
    let weekday_fraction = a
        .days
        .iter()
        .zip(b.days.iter())
        .filter(|(x, y)| x == y)
        .count() as f64
        / 7.0;

    let overlap_start = a.start_date.max(b.start_date);
    let overlap_end = a.end_date.min(b.end_date);
    let overlap_days = (overlap_end - overlap_start).num_days() + 1;
    let overlap_days = overlap_days.max(0);

    let a_days = (a.end_date - a.start_date).num_days() + 1;
    let b_days = (b.end_date - b.start_date).num_days() + 1;
    let union_days = a_days + b_days - overlap_days;

    let jaccard = if union_days <= 0 {
        0.0
    } else {
        overlap_days as f64 / union_days as f64
    };

    (weekday_fraction + jaccard) / 2.0
}

/// 0 if routes differ; else mean of {route-match=1, Jaccard of stop-id
/// sets, direction-id match}.
pub fn score_trip(a: &Trip, a_stop_ids: &HashSet<String>, b: &Trip, b_stop_ids: &HashSet<String>) -> f64 {
    if a.route_id != b.route_id {
        return 0.0;
    }

    let intersection = a_stop_ids.intersection(b_stop_ids).count();
    let union = a_stop_ids.union(b_stop_ids).count();
    let stop_jaccard = if union == 0 { 0.0 } else { intersection as f64 / union as f64 };

    let direction_match = if a.direction_id == b.direction_id { 1.0 } else { 0.0 };

    (1.0 + stop_jaccard + direction_match) / 3.0
}

/// 0 unless from- and to-stop IDs both match; otherwise the average of
/// type-match and (when both sides carry a `min_transfer_time`) time-match.
pub fn score_transfer(a: &crate::model::Transfer, b: &crate::model::Transfer) -> f64 {
    if a.from_stop_id != b.from_stop_id || a.to_stop_id != b.to_stop_id {
        return 0.0;
    }
    let type_match = if a.transfer_type == b.transfer_type { 1.0 } else { 0.0 };
    match (a.min_transfer_time, b.min_transfer_time) {
        (Some(x), Some(y)) => {
            let time_match = if x == y { 1.0 } else { 0.0 };
            (type_match + time_match) / 2.0
        }
        _ => type_match,
    }
}

/// Identity by `(start_time, end_time)` only — used to dedup frequencies
/// within a merged trip, not a continuous similarity.
pub fn frequencies_are_duplicates(a: &crate::model::Frequency, b: &crate::model::Frequency) -> bool {
    a.start_time == b.start_time && a.end_time == b.end_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContinuousPolicy, LocationType, TransferType};
    use chrono::NaiveDate;

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

    fn route(id: &str, agency_id: Option<&str>, short: Option<&str>, long: Option<&str>) -> Route {
        Route {
            id: id.to_string(),
            agency_id: agency_id.map(String::from),
            short_name: short.map(String::from),
            long_name: long.map(String::from),
            description: None,
            route_type: 3,
            url: None,
            color: None,
            text_color: None,
            continuous_pickup: ContinuousPolicy::NotAvailable,
            continuous_drop_off: ContinuousPolicy::NotAvailable,
        }
    }

    #[test]
    fn identical_name_and_close_stops_score_one() {
        let a = stop("stop1", "Main St", 40.7589, -73.9851);
        let b = stop("different-id", "Main St", 40.7590, -73.9851);
        assert!(score_stop(&a, &b) >= 0.5);
    }

    #[test]
    fn far_apart_stops_score_low_even_with_matching_name() {
        let a = stop("s1", "Main St", 40.0, -73.0);
        let b = stop("s2", "Main St", 41.0, -73.0);
        assert_eq!(score_stop(&a, &b), 0.5);
    }

    #[test]
    fn route_scorer_skips_absent_fields() {
        let a = route("r1", Some("a1"), Some("10"), None);
        let b = route("r2", Some("a1"), Some("10"), None);
        assert_eq!(score_route(&a, &b), 1.0);
    }

    #[test]
    fn service_scorer_weights_weekday_and_date_overlap() {
        let a = Calendar {
            service_id: "s1".to_string(),
            days: [true, true, true, true, true, false, false],
            start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 12, 31).unwrap(),
        };
        let b = a.clone();
        assert_eq!(score_service(&a, &b), 1.0);
    }

    #[test]
    fn transfer_scorer_requires_endpoint_match() {
        let a = crate::model::Transfer {
            from_stop_id: "a".to_string(),
            to_stop_id: "b".to_string(),
            transfer_type: TransferType::Recommended,
            min_transfer_time: Some(60),
        };
        let mut b = a.clone();
        b.from_stop_id = "z".to_string();
        assert_eq!(score_transfer(&a, &b), 0.0);

        b.from_stop_id = "a".to_string();
        b.min_transfer_time = Some(60);
        assert_eq!(score_transfer(&a, &b), 1.0);
    }
}
