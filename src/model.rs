//! In-memory representations of GTFS static entities.
//!
//! Parsed entities are kept in flat, index-addressed vectors rather than a
//! pointer graph — trips, stops, shapes etc. reference each other by id
//! string, resolved against the [`crate::store::Store`] or the in-memory
//! [`StaticFeed`] arena. This sidesteps the reference cycles a pointer-based
//! model would need (trip -> route -> agency, stop_time -> trip -> stop, ...)
//! and keeps the Merger's reference-rewrite pass a linear walk over id
//! fields instead of a graph mutation.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agency {
    pub id: String,
    pub name: String,
    pub url: String,
    pub timezone: String,
    pub lang: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub fare_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationType {
    Stop,
    Station,
    EntranceExit,
    GenericNode,
    BoardingArea,
}

impl LocationType {
    pub fn from_gtfs_code(code: Option<i32>) -> Self {
        match code {
            Some(1) => Self::Station,
            Some(2) => Self::EntranceExit,
            Some(3) => Self::GenericNode,
            Some(4) => Self::BoardingArea,
            _ => Self::Stop,
        }
    }
}

/// 8-point compass direction, precomputed by the Direction Precomputer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    N,
    Ne,
    E,
    Se,
    S,
    Sw,
    W,
    Nw,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::N,
        Direction::Ne,
        Direction::E,
        Direction::Se,
        Direction::S,
        Direction::Sw,
        Direction::W,
        Direction::Nw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::N => "N",
            Direction::Ne => "NE",
            Direction::E => "E",
            Direction::Se => "SE",
            Direction::S => "S",
            Direction::Sw => "SW",
            Direction::W => "W",
            Direction::Nw => "NW",
        }
    }

    pub fn from_str_any_case(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "N" => Some(Self::N),
            "NE" => Some(Self::Ne),
            "E" => Some(Self::E),
            "SE" => Some(Self::Se),
            "S" => Some(Self::S),
            "SW" => Some(Self::Sw),
            "W" => Some(Self::W),
            "NW" => Some(Self::Nw),
            _ => None,
        }
    }

    /// Maps a geographic bearing (0deg=N, 90deg=E, clockwise) to the
    /// 8-sector whose center (k*45deg) is within 22.5deg of it.
    pub fn from_bearing_degrees(bearing: f64) -> Self {
        let normalized = ((bearing % 360.0) + 360.0) % 360.0;
        let sector = ((normalized / 45.0).round() as i64).rem_euclid(8) as usize;
        Self::ALL[sector]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: String,
    pub code: Option<String>,
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub parent_station: Option<String>,
    pub location_type: LocationType,
    pub wheelchair_boarding: Option<i32>,
    pub direction: Option<Direction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContinuousPolicy {
    Continuous,
    NotAvailable,
    MustPhone,
    MustCoordinateWithDriver,
}

impl ContinuousPolicy {
    pub fn from_gtfs_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::Continuous,
            Some(2) => Self::MustPhone,
            Some(3) => Self::MustCoordinateWithDriver,
            _ => Self::NotAvailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub agency_id: Option<String>,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub description: Option<String>,
    pub route_type: i32,
    pub url: Option<String>,
    pub color: Option<String>,
    pub text_color: Option<String>,
    pub continuous_pickup: ContinuousPolicy,
    pub continuous_drop_off: ContinuousPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    pub service_id: String,
    pub days: [bool; 7],
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionType {
    Added,
    Removed,
}

impl ExceptionType {
    pub fn from_gtfs_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Added),
            2 => Some(Self::Removed),
            _ => None,
        }
    }

    pub fn to_gtfs_code(self) -> i32 {
        match self {
            Self::Added => 1,
            Self::Removed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDate {
    pub date: NaiveDate,
    pub exception_type: ExceptionType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    pub route_id: String,
    pub service_id: String,
    pub headsign: Option<String>,
    pub short_name: Option<String>,
    pub direction_id: Option<i32>,
    pub block_id: Option<String>,
    pub shape_id: Option<String>,
    pub wheelchair_accessible: Option<i32>,
    pub bikes_allowed: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PickupDropOffType {
    RegularlyScheduled,
    NoService,
    MustPhone,
    MustCoordinateWithDriver,
}

impl PickupDropOffType {
    pub fn from_gtfs_code(code: Option<i32>) -> Self {
        match code {
            Some(1) => Self::NoService,
            Some(2) => Self::MustPhone,
            Some(3) => Self::MustCoordinateWithDriver,
            _ => Self::RegularlyScheduled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub stop_sequence: i32,
    pub stop_id: String,
    /// Seconds since the start of the service day (may exceed 86400).
    pub arrival_time: Option<i32>,
    /// Seconds since the start of the service day (may exceed 86400).
    pub departure_time: Option<i32>,
    pub pickup_type: PickupDropOffType,
    pub drop_off_type: PickupDropOffType,
    pub shape_dist_traveled: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapePoint {
    pub shape_pt_sequence: i32,
    pub lat: f64,
    pub lon: f64,
    pub shape_dist_traveled: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    Recommended,
    Timed,
    MinimumTime,
    NotPossible,
    InSeatTransfer,
    InSeatTransferNotAllowed,
}

impl TransferType {
    pub fn from_gtfs_code(code: Option<i32>) -> Self {
        match code {
            Some(1) => Self::Timed,
            Some(2) => Self::MinimumTime,
            Some(3) => Self::NotPossible,
            Some(4) => Self::InSeatTransfer,
            Some(5) => Self::InSeatTransferNotAllowed,
            _ => Self::Recommended,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub from_stop_id: String,
    pub to_stop_id: String,
    pub transfer_type: TransferType,
    pub min_transfer_time: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExactTimes {
    FrequencyBased,
    ScheduleBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frequency {
    pub trip_id: String,
    pub start_time: i32,
    pub end_time: i32,
    pub headway_secs: i32,
    pub exact_times: ExactTimes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemReportTrip {
    pub id: i64,
    pub trip_id: String,
    pub service_date: NaiveDate,
    pub description: String,
    pub reported_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemReportStop {
    pub id: i64,
    pub stop_id: String,
    pub description: String,
    pub reported_at: chrono::DateTime<chrono::Utc>,
}

/// One row per completed ingest, recording provenance for operator queries
/// ("when did this data last change and from what source").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportMetadata {
    pub id: i64,
    pub source: String,
    pub imported_at: chrono::DateTime<chrono::Utc>,
    pub content_sha256: String,
    pub agency_count: i64,
    pub stop_count: i64,
    pub route_count: i64,
    pub trip_count: i64,
    pub stop_time_count: i64,
}

/// The fully parsed contents of one static feed, addressed by id rather
/// than pointer — every cross-reference (`Trip::route_id`,
/// `StopTime::stop_id`, ...) is a lookup key into the sibling vector here
/// or into the [`crate::store::Store`] once persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticFeed {
    pub agencies: Vec<Agency>,
    pub stops: Vec<Stop>,
    pub routes: Vec<Route>,
    pub calendars: Vec<Calendar>,
    pub calendar_dates: Vec<(String, CalendarDate)>,
    pub trips: Vec<Trip>,
    pub stop_times: Vec<StopTime>,
    pub shapes: Vec<(String, ShapePoint)>,
    pub transfers: Vec<Transfer>,
    pub frequencies: Vec<Frequency>,
}

impl StaticFeed {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Parse a GTFS `"HH:MM:SS"` time (hours may be >= 24) into seconds since
/// the start of the service day.
pub fn parse_gtfs_time(s: &str) -> Option<i32> {
    let mut parts = s.trim().splitn(3, ':');
    let hours: i32 = parts.next()?.parse().ok()?;
    let minutes: i32 = parts.next()?.parse().ok()?;
    let seconds: i32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Parse a GTFS `"YYYYMMDD"` date into a [`NaiveDate`].
pub fn parse_gtfs_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[4..6].parse().ok()?;
    let day: u32 = s[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn format_gtfs_date(d: NaiveDate) -> String {
    format!("{:04}{:02}{:02}", d.year_ce().1, d.month(), d.day())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_times_past_midnight() {
        assert_eq!(parse_gtfs_time("08:30:00"), Some(30600));
        assert_eq!(parse_gtfs_time("25:30:00"), Some(91800));
        assert_eq!(parse_gtfs_time("00:00:00"), Some(0));
        assert_eq!(parse_gtfs_time("bad"), None);
        assert_eq!(parse_gtfs_time("08:30"), None);
        assert_eq!(parse_gtfs_time("08:60:00"), None);
    }

    #[test]
    fn parses_dates() {
        assert_eq!(
            parse_gtfs_date("20260201"),
            Some(NaiveDate::from_ymd_opt(2026, 2, 1).unwrap())
        );
        assert_eq!(parse_gtfs_date("20260230"), None);
        assert_eq!(parse_gtfs_date("bad"), None);
    }

    #[test]
    fn date_roundtrips_through_gtfs_format() {
        let d = NaiveDate::from_ymd_opt(2026, 7, 4).unwrap();
        assert_eq!(format_gtfs_date(d), "20260704");
        assert_eq!(parse_gtfs_date(&format_gtfs_date(d)), Some(d));
    }

    #[test]
    fn bearing_maps_to_nearest_sector() {
        assert_eq!(Direction::from_bearing_degrees(0.0), Direction::N);
        assert_eq!(Direction::from_bearing_degrees(90.0), Direction::E);
        assert_eq!(Direction::from_bearing_degrees(180.0), Direction::S);
        assert_eq!(Direction::from_bearing_degrees(270.0), Direction::W);
        assert_eq!(Direction::from_bearing_degrees(44.0), Direction::Ne);
        assert_eq!(Direction::from_bearing_degrees(-10.0), Direction::N);
        assert_eq!(Direction::from_bearing_degrees(360.0), Direction::N);
        assert_eq!(Direction::from_bearing_degrees(720.0 + 45.0), Direction::Ne);
    }

    #[test]
    fn direction_string_roundtrips_any_case() {
        assert_eq!(Direction::from_str_any_case("ne"), Some(Direction::Ne));
        assert_eq!(Direction::from_str_any_case("Ne"), Some(Direction::Ne));
        assert_eq!(Direction::from_str_any_case("nonsense"), None);
    }
}
