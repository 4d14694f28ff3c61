//! Typed read queries: per-row gets/lists, the derived queries named in
//! the component design (stops-within-bbox, routes FTS match,
//! active-services-on-date, trips-by-block-ordered, shape points with
//! distance), and the `stops.direction` writeback used by the Direction
//! Precomputer.

use chrono::{Datelike, NaiveDate};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use crate::error::StoreError;
use crate::model::*;

#[derive(FromRow)]
struct AgencyRow {
    id: String,
    name: String,
    url: String,
    timezone: String,
    lang: Option<String>,
    phone: Option<String>,
    email: Option<String>,
    fare_url: Option<String>,
}

impl From<AgencyRow> for Agency {
    fn from(r: AgencyRow) -> Self {
        Agency {
            id: r.id,
            name: r.name,
            url: r.url,
            timezone: r.timezone,
            lang: r.lang,
            phone: r.phone,
            email: r.email,
            fare_url: r.fare_url,
        }
    }
}

pub async fn list_agencies(pool: &SqlitePool) -> Result<Vec<Agency>, StoreError> {
    let rows: Vec<AgencyRow> = sqlx::query_as("SELECT * FROM agency ORDER BY id").fetch_all(pool).await?;
    Ok(rows.into_iter().map(Agency::from).collect())
}

#[derive(FromRow)]
struct RouteRow {
    id: String,
    agency_id: Option<String>,
    short_name: Option<String>,
    long_name: Option<String>,
    description: Option<String>,
    route_type: i64,
    url: Option<String>,
    color: Option<String>,
    text_color: Option<String>,
    continuous_pickup: String,
    continuous_drop_off: String,
}

fn parse_continuous_policy(s: &str) -> ContinuousPolicy {
    match s {
        "continuous" => ContinuousPolicy::Continuous,
        "must_phone" => ContinuousPolicy::MustPhone,
        "must_coordinate_with_driver" => ContinuousPolicy::MustCoordinateWithDriver,
        _ => ContinuousPolicy::NotAvailable,
    }
}

impl From<RouteRow> for Route {
    fn from(r: RouteRow) -> Self {
        Route {
            id: r.id,
            agency_id: r.agency_id,
            short_name: r.short_name,
            long_name: r.long_name,
            description: r.description,
            route_type: r.route_type as i32,
            url: r.url,
            color: r.color,
            text_color: r.text_color,
            continuous_pickup: parse_continuous_policy(&r.continuous_pickup),
            continuous_drop_off: parse_continuous_policy(&r.continuous_drop_off),
        }
    }
}

pub async fn routes_for_agency(
    pool: &SqlitePool,
    agency_id: &str,
) -> Result<Vec<Route>, StoreError> {
    let rows: Vec<RouteRow> =
        sqlx::query_as("SELECT * FROM routes WHERE agency_id = ? ORDER BY id")
            .bind(agency_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(Route::from).collect())
}

/// Escapes a raw user search string into a safe FTS5 MATCH expression:
/// every whitespace-delimited token is quoted and suffixed with `*`
/// (prefix match). Never interpolate raw user input into a MATCH clause.
pub fn escape_fts_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|tok| format!("\"{}\"*", tok.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(FromRow)]
struct RouteMatchRow {
    id: String,
}

pub async fn search_routes_fts(
    pool: &SqlitePool,
    raw_query: &str,
) -> Result<Vec<String>, StoreError> {
    let escaped = escape_fts_query(raw_query);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<RouteMatchRow> = sqlx::query_as(
        "SELECT routes.id as id FROM routes_fts
         JOIN routes ON routes.rowid = routes_fts.rowid
         WHERE routes_fts MATCH ?
         ORDER BY rank",
    )
    .bind(escaped)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.id).collect())
}

#[derive(FromRow)]
struct StopRow {
    id: String,
    code: Option<String>,
    name: Option<String>,
    lat: f64,
    lon: f64,
    parent_station: Option<String>,
    location_type: String,
    wheelchair_boarding: Option<i64>,
    direction: Option<String>,
}

fn parse_location_type(s: &str) -> LocationType {
    match s {
        "station" => LocationType::Station,
        "entrance_exit" => LocationType::EntranceExit,
        "generic_node" => LocationType::GenericNode,
        "boarding_area" => LocationType::BoardingArea,
        _ => LocationType::Stop,
    }
}

impl From<StopRow> for Stop {
    fn from(r: StopRow) -> Self {
        Stop {
            id: r.id,
            code: r.code,
            name: r.name,
            lat: r.lat,
            lon: r.lon,
            parent_station: r.parent_station,
            location_type: parse_location_type(&r.location_type),
            wheelchair_boarding: r.wheelchair_boarding.map(|v| v as i32),
            direction: r.direction.as_deref().and_then(Direction::from_str_any_case),
        }
    }
}

/// Stops whose (lat, lon) falls within the axis-aligned rectangle
/// `[min_lat, max_lat] x [min_lon, max_lon]`.
pub async fn stops_within_bbox(
    pool: &SqlitePool,
    min_lat: f64,
    max_lat: f64,
    min_lon: f64,
    max_lon: f64,
) -> Result<Vec<Stop>, StoreError> {
    let rows: Vec<StopRow> = sqlx::query_as(
        "SELECT * FROM stops WHERE lat BETWEEN ? AND ? AND lon BETWEEN ? AND ?",
    )
    .bind(min_lat)
    .bind(max_lat)
    .bind(min_lon)
    .bind(max_lon)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Stop::from).collect())
}

pub async fn get_stop(pool: &SqlitePool, stop_id: &str) -> Result<Option<Stop>, StoreError> {
    let row: Option<StopRow> = sqlx::query_as("SELECT * FROM stops WHERE id = ?")
        .bind(stop_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Stop::from))
}

pub async fn list_all_stops(pool: &SqlitePool) -> Result<Vec<Stop>, StoreError> {
    let rows: Vec<StopRow> = sqlx::query_as("SELECT * FROM stops").fetch_all(pool).await?;
    Ok(rows.into_iter().map(Stop::from).collect())
}

/// Stops referenced by at least one `stop_time` row — the population the
/// Spatial Index is built from.
pub async fn active_stops(pool: &SqlitePool) -> Result<Vec<Stop>, StoreError> {
    let rows: Vec<StopRow> = sqlx::query_as(
        "SELECT DISTINCT stops.* FROM stops
         JOIN stop_times ON stop_times.stop_id = stops.id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Stop::from).collect())
}

pub async fn update_stop_direction(
    pool: &SqlitePool,
    stop_id: &str,
    direction: Option<Direction>,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE stops SET direction = ? WHERE id = ?")
        .bind(direction.map(|d| d.as_str()))
        .bind(stop_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_stop_directions_batch(
    tx: &mut Transaction<'_, Sqlite>,
    updates: &[(String, Option<Direction>)],
) -> Result<(), StoreError> {
    for (stop_id, direction) in updates {
        sqlx::query("UPDATE stops SET direction = ? WHERE id = ?")
            .bind(direction.map(|d| d.as_str()))
            .bind(stop_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[derive(FromRow)]
struct CalendarRow {
    service_id: String,
    monday: bool,
    tuesday: bool,
    wednesday: bool,
    thursday: bool,
    friday: bool,
    saturday: bool,
    sunday: bool,
    start_date: String,
    end_date: String,
}

/// All service ids whose regular calendar weekday flag is set and whose
/// date range contains `date`, unioned with `calendar_dates` additions and
/// minus removals.
pub async fn active_service_ids_on_date(
    pool: &SqlitePool,
    date: NaiveDate,
) -> Result<Vec<String>, StoreError> {
    let date_str = format_gtfs_date(date);
    let weekday_col = match date.weekday() {
        chrono::Weekday::Mon => "monday",
        chrono::Weekday::Tue => "tuesday",
        chrono::Weekday::Wed => "wednesday",
        chrono::Weekday::Thu => "thursday",
        chrono::Weekday::Fri => "friday",
        chrono::Weekday::Sat => "saturday",
        chrono::Weekday::Sun => "sunday",
    };

    let calendars: Vec<CalendarRow> = sqlx::query_as("SELECT * FROM calendar").fetch_all(pool).await?;

    let mut active: std::collections::HashSet<String> = calendars
        .into_iter()
        .filter(|c| {
            let in_range = c.start_date.as_str() <= date_str.as_str() && date_str.as_str() <= c.end_date.as_str();
            let day_set = match weekday_col {
                "monday" => c.monday,
                "tuesday" => c.tuesday,
                "wednesday" => c.wednesday,
                "thursday" => c.thursday,
                "friday" => c.friday,
                "saturday" => c.saturday,
                _ => c.sunday,
            };
            in_range && day_set
        })
        .map(|c| c.service_id)
        .collect();

    #[derive(FromRow)]
    struct ExceptionRow {
        service_id: String,
        exception_type: i64,
    }
    let exceptions: Vec<ExceptionRow> = sqlx::query_as(
        "SELECT service_id, exception_type FROM calendar_dates WHERE date = ?",
    )
    .bind(&date_str)
    .fetch_all(pool)
    .await?;

    for e in exceptions {
        match e.exception_type {
            1 => {
                active.insert(e.service_id);
            }
            2 => {
                active.remove(&e.service_id);
            }
            _ => {}
        }
    }

    Ok(active.into_iter().collect())
}

#[derive(FromRow)]
pub struct ShapePointRow {
    pub lat: f64,
    pub lon: f64,
    pub shape_dist_traveled: Option<f64>,
    pub shape_pt_sequence: i64,
}

pub async fn shape_points_with_distance(
    pool: &SqlitePool,
    shape_id: &str,
) -> Result<Vec<ShapePointRow>, StoreError> {
    let rows: Vec<ShapePointRow> = sqlx::query_as(
        "SELECT lat, lon, shape_dist_traveled, shape_pt_sequence FROM shapes
         WHERE shape_id = ? ORDER BY shape_pt_sequence",
    )
    .bind(shape_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(FromRow, Debug, Clone)]
pub struct BlockTripEntryRow {
    pub block_id: String,
    pub position: i64,
    pub trip_id: String,
    pub layover_stop_id: Option<String>,
    pub layover_start: Option<i64>,
    pub layover_end: Option<i64>,
    pub route_id: Option<String>,
    pub service_id: Option<String>,
}

pub async fn trips_by_block_ordered(
    pool: &SqlitePool,
    block_id: &str,
) -> Result<Vec<BlockTripEntryRow>, StoreError> {
    let rows: Vec<BlockTripEntryRow> = sqlx::query_as(
        "SELECT * FROM block_trip_entry WHERE block_id = ? ORDER BY position",
    )
    .bind(block_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_and_prefix_matches_each_token() {
        assert_eq!(escape_fts_query("main st"), "\"main\"* \"st\"*");
        assert_eq!(escape_fts_query("o'brien"), "\"o'brien\"*");
        assert_eq!(escape_fts_query("say \"hi\""), "\"say\"* \"\"\"hi\"\"\"*");
        assert_eq!(escape_fts_query(""), "");
    }
}
