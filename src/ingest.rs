//! The Ingestor: turns raw GTFS zip bytes into a fully populated Store.
//!
//! Conditional HTTP GET, zip-bomb guard, header-index CSV parsing, a
//! transaction-backed `Store` write, plus an optional gtfstidy pass and
//! the import-metadata/FTS bookkeeping the component design calls for.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, warn};

use crate::config::{AuthHeader, FeedSource};
use crate::error::IngestError;
use crate::model::*;
use crate::store::bulk::{self, BlockTripEntryRow, ImportCounts};
use crate::store::Store;

/// Cap on a single GTFS zip download.
const MAX_DOWNLOAD_SIZE: u64 = 500 * 1024 * 1024;
/// Cap on total decompressed content, a zip-bomb guard.
const MAX_DECOMPRESSED_SIZE: u64 = 2 * 1024 * 1024 * 1024;

const REQUIRED_FILES: &[&str] = &[
    "agency.txt",
    "routes.txt",
    "stops.txt",
    "trips.txt",
    "stop_times.txt",
];

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Downloads `source.url` (an http(s) URL) with an optional single auth
/// header, enforcing the download-size guard, and returns the raw bytes.
pub async fn download_zip(client: &reqwest::Client, source: &FeedSource) -> Result<Vec<u8>, IngestError> {
    let mut req = client.get(&source.url);
    if let Some(AuthHeader { name, value }) = &source.auth_header {
        req = req.header(name.as_str(), value.as_str());
    }
    let response = req
        .timeout(std::time::Duration::from_secs(60))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(IngestError::NetworkMessage(format!(
            "GTFS download HTTP {}",
            response.status()
        )));
    }
    if let Some(len) = response.content_length() {
        if len > MAX_DOWNLOAD_SIZE {
            return Err(IngestError::NetworkMessage(format!(
                "GTFS download too large: {len} bytes (max {MAX_DOWNLOAD_SIZE} bytes)"
            )));
        }
    }

    let bytes = response.bytes().await?;
    if bytes.len() as u64 > MAX_DOWNLOAD_SIZE {
        return Err(IngestError::NetworkMessage(format!(
            "GTFS download exceeded size limit at {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes.to_vec())
}

/// Reads a local zip file from disk.
pub async fn read_local_zip(path: &str) -> Result<Vec<u8>, IngestError> {
    Ok(tokio::fs::read(path).await?)
}

/// Optionally pipes the zip through an external `gtfstidy` binary with a
/// fixed flag set, returning the (possibly rewritten) zip bytes.
pub async fn run_gtfstidy(zip_bytes: Vec<u8>, binary_path: &str) -> Result<Vec<u8>, IngestError> {
    let in_dir = tempfile::tempdir().map_err(IngestError::Io)?;
    let in_path = in_dir.path().join("in.zip");
    let out_path = in_dir.path().join("out.zip");
    tokio::fs::write(&in_path, &zip_bytes).await?;

    let binary_path = binary_path.to_string();
    let in_path_owned = in_path.clone();
    let out_path_owned = out_path.clone();
    let status = tokio::task::spawn_blocking(move || {
        std::process::Command::new(&binary_path)
            .arg("-fix")
            .arg("-compress")
            .arg("-o")
            .arg(&out_path_owned)
            .arg(&in_path_owned)
            .status()
    })
    .await??;

    if !status.success() {
        return Err(IngestError::GtfstidyFailed(status.code().unwrap_or(-1)));
    }

    Ok(tokio::fs::read(out_path).await?)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Parses raw GTFS zip bytes into an in-memory [`StaticFeed`]. This is a
/// blocking CPU/IO-bound operation; callers on an async runtime should
/// drive it via `spawn_blocking`.
pub fn parse_zip(zip_bytes: &[u8]) -> Result<StaticFeed, IngestError> {
    let cursor = std::io::Cursor::new(zip_bytes);
    let mut archive = zip::ZipArchive::new(cursor)?;

    let mut total_uncompressed: u64 = 0;
    let mut names: Vec<String> = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        total_uncompressed += entry.size();
        names.push(entry.name().to_string());
    }
    if total_uncompressed > MAX_DECOMPRESSED_SIZE {
        return Err(IngestError::Malformed(format!(
            "decompressed size {total_uncompressed} bytes exceeds limit {MAX_DECOMPRESSED_SIZE} bytes"
        )));
    }

    for required in REQUIRED_FILES {
        if !names.iter().any(|n| n == required) {
            return Err(IngestError::MissingRequiredFile(required));
        }
    }
    let has_calendar = names.iter().any(|n| n == "calendar.txt");
    let has_calendar_dates = names.iter().any(|n| n == "calendar_dates.txt");
    if !has_calendar && !has_calendar_dates {
        return Err(IngestError::MissingRequiredFile("calendar.txt or calendar_dates.txt"));
    }

    let mut feed = StaticFeed::new();
    feed.agencies = parse_agencies(&mut archive)?;
    feed.stops = parse_stops(&mut archive)?;
    feed.routes = parse_routes(&mut archive)?;
    if has_calendar {
        feed.calendars = parse_calendars(&mut archive)?;
    }
    if has_calendar_dates {
        feed.calendar_dates = parse_calendar_dates(&mut archive)?;
    }
    feed.trips = parse_trips(&mut archive)?;
    feed.stop_times = parse_stop_times(&mut archive)?;
    if names.iter().any(|n| n == "shapes.txt") {
        feed.shapes = parse_shapes(&mut archive)?;
    }
    if names.iter().any(|n| n == "transfers.txt") {
        feed.transfers = parse_transfers(&mut archive)?;
    }
    if names.iter().any(|n| n == "frequencies.txt") {
        feed.frequencies = parse_frequencies(&mut archive)?;
    }

    validate_referential_integrity(&feed)?;
    validate_stop_time_ordering(&feed)?;
    validate_shape_ordering(&feed)?;

    Ok(feed)
}

fn header_index(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|h| h == name)
}

fn reader_for<'a, R: std::io::Read>(
    archive: &'a mut zip::ZipArchive<R>,
    name: &str,
) -> Result<csv::Reader<zip::read::ZipFile<'a>>, IngestError> {
    let file = archive.by_name(name)?;
    Ok(csv::Reader::from_reader(file))
}

fn parse_agencies<R: Read>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<Agency>, IngestError> {
    let mut rdr = reader_for(archive, "agency.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_id = header_index(&headers, "agency_id");
    let idx_name = header_index(&headers, "agency_name")
        .ok_or_else(|| IngestError::Malformed("agency.txt missing agency_name".into()))?;
    let idx_url = header_index(&headers, "agency_url")
        .ok_or_else(|| IngestError::Malformed("agency.txt missing agency_url".into()))?;
    let idx_tz = header_index(&headers, "agency_timezone")
        .ok_or_else(|| IngestError::Malformed("agency.txt missing agency_timezone".into()))?;
    let idx_lang = header_index(&headers, "agency_lang");
    let idx_phone = header_index(&headers, "agency_phone");
    let idx_email = header_index(&headers, "agency_email");
    let idx_fare_url = header_index(&headers, "agency_fare_url");

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        out.push(Agency {
            id: idx_id.and_then(|i| record.get(i)).map(str::to_string).unwrap_or_default(),
            name: record.get(idx_name).unwrap_or("").to_string(),
            url: record.get(idx_url).unwrap_or("").to_string(),
            timezone: record.get(idx_tz).unwrap_or("").to_string(),
            lang: idx_lang.and_then(|i| record.get(i)).and_then(non_empty),
            phone: idx_phone.and_then(|i| record.get(i)).and_then(non_empty),
            email: idx_email.and_then(|i| record.get(i)).and_then(non_empty),
            fare_url: idx_fare_url.and_then(|i| record.get(i)).and_then(non_empty),
        });
    }
    info!(count = out.len(), "parsed agency.txt");
    Ok(out)
}

fn parse_stops<R: Read>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<Stop>, IngestError> {
    let mut rdr = reader_for(archive, "stops.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_id = header_index(&headers, "stop_id")
        .ok_or_else(|| IngestError::Malformed("stops.txt missing stop_id".into()))?;
    let idx_code = header_index(&headers, "stop_code");
    let idx_name = header_index(&headers, "stop_name");
    let idx_lat = header_index(&headers, "stop_lat")
        .ok_or_else(|| IngestError::Malformed("stops.txt missing stop_lat".into()))?;
    let idx_lon = header_index(&headers, "stop_lon")
        .ok_or_else(|| IngestError::Malformed("stops.txt missing stop_lon".into()))?;
    let idx_parent = header_index(&headers, "parent_station");
    let idx_location_type = header_index(&headers, "location_type");
    let idx_wheelchair = header_index(&headers, "wheelchair_boarding");
    let idx_direction = header_index(&headers, "direction");

    let mut out = Vec::new();
    let mut skipped = 0usize;
    for result in rdr.records() {
        let record = result?;
        let Some(id) = record.get(idx_id).filter(|s| !s.is_empty()).map(str::to_string) else {
            skipped += 1;
            continue;
        };
        let lat: f64 = record.get(idx_lat).unwrap_or("").parse().unwrap_or(0.0);
        let lon: f64 = record.get(idx_lon).unwrap_or("").parse().unwrap_or(0.0);
        let location_code: Option<i32> = idx_location_type
            .and_then(|i| record.get(i))
            .and_then(|s| s.parse().ok());
        let author_direction = idx_direction
            .and_then(|i| record.get(i))
            .and_then(parse_author_direction);

        out.push(Stop {
            id,
            code: idx_code.and_then(|i| record.get(i)).and_then(non_empty),
            name: idx_name.and_then(|i| record.get(i)).and_then(non_empty),
            lat,
            lon,
            parent_station: idx_parent.and_then(|i| record.get(i)).and_then(non_empty),
            location_type: LocationType::from_gtfs_code(location_code),
            wheelchair_boarding: idx_wheelchair.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            direction: author_direction,
        });
    }
    if skipped > 0 {
        warn!(skipped, "skipped stops.txt rows with empty stop_id");
    }
    info!(count = out.len(), "parsed stops.txt");
    Ok(out)
}

/// Accepts either a compass word (any case) or a numeric bearing (any
/// value, taken mod 360).
fn parse_author_direction(raw: &str) -> Option<Direction> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(d) = Direction::from_str_any_case(trimmed) {
        return Some(d);
    }
    trimmed.parse::<f64>().ok().map(Direction::from_bearing_degrees)
}

fn parse_routes<R: Read>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<Route>, IngestError> {
    let mut rdr = reader_for(archive, "routes.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_id = header_index(&headers, "route_id")
        .ok_or_else(|| IngestError::Malformed("routes.txt missing route_id".into()))?;
    let idx_agency = header_index(&headers, "agency_id");
    let idx_short = header_index(&headers, "route_short_name");
    let idx_long = header_index(&headers, "route_long_name");
    let idx_desc = header_index(&headers, "route_desc");
    let idx_type = header_index(&headers, "route_type")
        .ok_or_else(|| IngestError::Malformed("routes.txt missing route_type".into()))?;
    let idx_url = header_index(&headers, "route_url");
    let idx_color = header_index(&headers, "route_color");
    let idx_text_color = header_index(&headers, "route_text_color");
    let idx_cp = header_index(&headers, "continuous_pickup");
    let idx_cd = header_index(&headers, "continuous_drop_off");

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        out.push(Route {
            id: record.get(idx_id).unwrap_or("").to_string(),
            agency_id: idx_agency.and_then(|i| record.get(i)).and_then(non_empty),
            short_name: idx_short.and_then(|i| record.get(i)).and_then(non_empty),
            long_name: idx_long.and_then(|i| record.get(i)).and_then(non_empty),
            description: idx_desc.and_then(|i| record.get(i)).and_then(non_empty),
            route_type: record.get(idx_type).unwrap_or("3").parse().unwrap_or(3),
            url: idx_url.and_then(|i| record.get(i)).and_then(non_empty),
            color: idx_color.and_then(|i| record.get(i)).and_then(non_empty),
            text_color: idx_text_color.and_then(|i| record.get(i)).and_then(non_empty),
            continuous_pickup: ContinuousPolicy::from_gtfs_code(
                idx_cp.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            ),
            continuous_drop_off: ContinuousPolicy::from_gtfs_code(
                idx_cd.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            ),
        });
    }
    info!(count = out.len(), "parsed routes.txt");
    Ok(out)
}

fn parse_calendars<R: Read>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<Calendar>, IngestError> {
    let mut rdr = reader_for(archive, "calendar.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_service = header_index(&headers, "service_id")
        .ok_or_else(|| IngestError::Malformed("calendar.txt missing service_id".into()))?;
    let day_cols = ["monday", "tuesday", "wednesday", "thursday", "friday", "saturday", "sunday"];
    let day_idx: Vec<usize> = day_cols
        .iter()
        .map(|c| header_index(&headers, c).ok_or_else(|| IngestError::Malformed(format!("calendar.txt missing {c}"))))
        .collect::<Result<_, _>>()?;
    let idx_start = header_index(&headers, "start_date")
        .ok_or_else(|| IngestError::Malformed("calendar.txt missing start_date".into()))?;
    let idx_end = header_index(&headers, "end_date")
        .ok_or_else(|| IngestError::Malformed("calendar.txt missing end_date".into()))?;

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let mut days = [false; 7];
        for (i, idx) in day_idx.iter().enumerate() {
            days[i] = record.get(*idx).unwrap_or("0") == "1";
        }
        let start_date = parse_gtfs_date(record.get(idx_start).unwrap_or(""))
            .ok_or_else(|| IngestError::Malformed("calendar.txt invalid start_date".into()))?;
        let end_date = parse_gtfs_date(record.get(idx_end).unwrap_or(""))
            .ok_or_else(|| IngestError::Malformed("calendar.txt invalid end_date".into()))?;
        if start_date > end_date {
            return Err(IngestError::Malformed(format!(
                "calendar.txt service {} has start_date after end_date",
                record.get(idx_service).unwrap_or("")
            )));
        }
        out.push(Calendar {
            service_id: record.get(idx_service).unwrap_or("").to_string(),
            days,
            start_date,
            end_date,
        });
    }
    info!(count = out.len(), "parsed calendar.txt");
    Ok(out)
}

fn parse_calendar_dates<R: Read>(
    archive: &mut zip::ZipArchive<R>,
) -> Result<Vec<(String, CalendarDate)>, IngestError> {
    let mut rdr = reader_for(archive, "calendar_dates.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_service = header_index(&headers, "service_id")
        .ok_or_else(|| IngestError::Malformed("calendar_dates.txt missing service_id".into()))?;
    let idx_date = header_index(&headers, "date")
        .ok_or_else(|| IngestError::Malformed("calendar_dates.txt missing date".into()))?;
    let idx_exc = header_index(&headers, "exception_type")
        .ok_or_else(|| IngestError::Malformed("calendar_dates.txt missing exception_type".into()))?;

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let date = parse_gtfs_date(record.get(idx_date).unwrap_or(""))
            .ok_or_else(|| IngestError::Malformed("calendar_dates.txt invalid date".into()))?;
        let code: i32 = record.get(idx_exc).unwrap_or("").parse().unwrap_or(0);
        let exception_type = ExceptionType::from_gtfs_code(code)
            .ok_or_else(|| IngestError::Malformed(format!("calendar_dates.txt invalid exception_type {code}")))?;
        out.push((
            record.get(idx_service).unwrap_or("").to_string(),
            CalendarDate { date, exception_type },
        ));
    }
    info!(count = out.len(), "parsed calendar_dates.txt");
    Ok(out)
}

fn parse_trips<R: Read>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<Trip>, IngestError> {
    let mut rdr = reader_for(archive, "trips.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_id = header_index(&headers, "trip_id")
        .ok_or_else(|| IngestError::Malformed("trips.txt missing trip_id".into()))?;
    let idx_route = header_index(&headers, "route_id")
        .ok_or_else(|| IngestError::Malformed("trips.txt missing route_id".into()))?;
    let idx_service = header_index(&headers, "service_id")
        .ok_or_else(|| IngestError::Malformed("trips.txt missing service_id".into()))?;
    let idx_headsign = header_index(&headers, "trip_headsign");
    let idx_short = header_index(&headers, "trip_short_name");
    let idx_direction = header_index(&headers, "direction_id");
    let idx_block = header_index(&headers, "block_id");
    let idx_shape = header_index(&headers, "shape_id");
    let idx_wheelchair = header_index(&headers, "wheelchair_accessible");
    let idx_bikes = header_index(&headers, "bikes_allowed");

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        out.push(Trip {
            id: record.get(idx_id).unwrap_or("").to_string(),
            route_id: record.get(idx_route).unwrap_or("").to_string(),
            service_id: record.get(idx_service).unwrap_or("").to_string(),
            headsign: idx_headsign.and_then(|i| record.get(i)).and_then(non_empty),
            short_name: idx_short.and_then(|i| record.get(i)).and_then(non_empty),
            direction_id: idx_direction.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            block_id: idx_block.and_then(|i| record.get(i)).and_then(non_empty),
            shape_id: idx_shape.and_then(|i| record.get(i)).and_then(non_empty),
            wheelchair_accessible: idx_wheelchair.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            bikes_allowed: idx_bikes.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
        });
    }
    info!(count = out.len(), "parsed trips.txt");
    Ok(out)
}

fn parse_stop_times<R: Read>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<StopTime>, IngestError> {
    let mut rdr = reader_for(archive, "stop_times.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_trip = header_index(&headers, "trip_id")
        .ok_or_else(|| IngestError::Malformed("stop_times.txt missing trip_id".into()))?;
    let idx_seq = header_index(&headers, "stop_sequence")
        .ok_or_else(|| IngestError::Malformed("stop_times.txt missing stop_sequence".into()))?;
    let idx_stop = header_index(&headers, "stop_id")
        .ok_or_else(|| IngestError::Malformed("stop_times.txt missing stop_id".into()))?;
    let idx_arrival = header_index(&headers, "arrival_time");
    let idx_departure = header_index(&headers, "departure_time");
    let idx_pickup = header_index(&headers, "pickup_type");
    let idx_dropoff = header_index(&headers, "drop_off_type");
    let idx_dist = header_index(&headers, "shape_dist_traveled");

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        out.push(StopTime {
            trip_id: record.get(idx_trip).unwrap_or("").to_string(),
            stop_sequence: record.get(idx_seq).unwrap_or("").parse().unwrap_or(0),
            stop_id: record.get(idx_stop).unwrap_or("").to_string(),
            arrival_time: idx_arrival.and_then(|i| record.get(i)).and_then(parse_gtfs_time),
            departure_time: idx_departure.and_then(|i| record.get(i)).and_then(parse_gtfs_time),
            pickup_type: PickupDropOffType::from_gtfs_code(
                idx_pickup.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            ),
            drop_off_type: PickupDropOffType::from_gtfs_code(
                idx_dropoff.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            ),
            shape_dist_traveled: idx_dist.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
        });
    }
    info!(count = out.len(), "parsed stop_times.txt");
    Ok(out)
}

fn parse_shapes<R: Read>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<(String, ShapePoint)>, IngestError> {
    let mut rdr = reader_for(archive, "shapes.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_id = header_index(&headers, "shape_id")
        .ok_or_else(|| IngestError::Malformed("shapes.txt missing shape_id".into()))?;
    let idx_seq = header_index(&headers, "shape_pt_sequence")
        .ok_or_else(|| IngestError::Malformed("shapes.txt missing shape_pt_sequence".into()))?;
    let idx_lat = header_index(&headers, "shape_pt_lat")
        .ok_or_else(|| IngestError::Malformed("shapes.txt missing shape_pt_lat".into()))?;
    let idx_lon = header_index(&headers, "shape_pt_lon")
        .ok_or_else(|| IngestError::Malformed("shapes.txt missing shape_pt_lon".into()))?;
    let idx_dist = header_index(&headers, "shape_dist_traveled");

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let shape_id = record.get(idx_id).unwrap_or("").to_string();
        let point = ShapePoint {
            shape_pt_sequence: record.get(idx_seq).unwrap_or("").parse().unwrap_or(0),
            lat: record.get(idx_lat).unwrap_or("").parse().unwrap_or(0.0),
            lon: record.get(idx_lon).unwrap_or("").parse().unwrap_or(0.0),
            shape_dist_traveled: idx_dist.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
        };
        out.push((shape_id, point));
    }
    info!(count = out.len(), "parsed shapes.txt");
    Ok(out)
}

fn parse_transfers<R: Read>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<Transfer>, IngestError> {
    let mut rdr = reader_for(archive, "transfers.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_from = header_index(&headers, "from_stop_id")
        .ok_or_else(|| IngestError::Malformed("transfers.txt missing from_stop_id".into()))?;
    let idx_to = header_index(&headers, "to_stop_id")
        .ok_or_else(|| IngestError::Malformed("transfers.txt missing to_stop_id".into()))?;
    let idx_type = header_index(&headers, "transfer_type");
    let idx_time = header_index(&headers, "min_transfer_time");

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        out.push(Transfer {
            from_stop_id: record.get(idx_from).unwrap_or("").to_string(),
            to_stop_id: record.get(idx_to).unwrap_or("").to_string(),
            transfer_type: TransferType::from_gtfs_code(
                idx_type.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
            ),
            min_transfer_time: idx_time.and_then(|i| record.get(i)).and_then(|s| s.parse().ok()),
        });
    }
    info!(count = out.len(), "parsed transfers.txt");
    Ok(out)
}

fn parse_frequencies<R: Read>(archive: &mut zip::ZipArchive<R>) -> Result<Vec<Frequency>, IngestError> {
    let mut rdr = reader_for(archive, "frequencies.txt")?;
    let headers = rdr.headers()?.clone();
    let idx_trip = header_index(&headers, "trip_id")
        .ok_or_else(|| IngestError::Malformed("frequencies.txt missing trip_id".into()))?;
    let idx_start = header_index(&headers, "start_time")
        .ok_or_else(|| IngestError::Malformed("frequencies.txt missing start_time".into()))?;
    let idx_end = header_index(&headers, "end_time")
        .ok_or_else(|| IngestError::Malformed("frequencies.txt missing end_time".into()))?;
    let idx_headway = header_index(&headers, "headway_secs")
        .ok_or_else(|| IngestError::Malformed("frequencies.txt missing headway_secs".into()))?;
    let idx_exact = header_index(&headers, "exact_times");

    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        out.push(Frequency {
            trip_id: record.get(idx_trip).unwrap_or("").to_string(),
            start_time: parse_gtfs_time(record.get(idx_start).unwrap_or("")).unwrap_or(0),
            end_time: parse_gtfs_time(record.get(idx_end).unwrap_or("")).unwrap_or(0),
            headway_secs: record.get(idx_headway).unwrap_or("").parse().unwrap_or(0),
            exact_times: match idx_exact.and_then(|i| record.get(i)) {
                Some("1") => ExactTimes::FrequencyBased,
                _ => ExactTimes::ScheduleBased,
            },
        });
    }
    info!(count = out.len(), "parsed frequencies.txt");
    Ok(out)
}

fn validate_referential_integrity(feed: &StaticFeed) -> Result<(), IngestError> {
    let agency_ids: std::collections::HashSet<&str> = feed.agencies.iter().map(|a| a.id.as_str()).collect();
    let stop_ids: std::collections::HashSet<&str> = feed.stops.iter().map(|s| s.id.as_str()).collect();
    let route_ids: std::collections::HashSet<&str> = feed.routes.iter().map(|r| r.id.as_str()).collect();
    let trip_ids: std::collections::HashSet<&str> = feed.trips.iter().map(|t| t.id.as_str()).collect();
    let service_ids: std::collections::HashSet<&str> = feed
        .calendars
        .iter()
        .map(|c| c.service_id.as_str())
        .chain(feed.calendar_dates.iter().map(|(service_id, _)| service_id.as_str()))
        .collect();

    for r in &feed.routes {
        if let Some(a) = &r.agency_id {
            if !agency_ids.contains(a.as_str()) {
                return Err(IngestError::Malformed(format!("route {} references unknown agency {a}", r.id)));
            }
        }
    }
    for s in &feed.stops {
        if let Some(p) = &s.parent_station {
            if !stop_ids.contains(p.as_str()) {
                return Err(IngestError::Malformed(format!("stop {} references unknown parent_station {p}", s.id)));
            }
        }
    }
    for t in &feed.trips {
        if !route_ids.contains(t.route_id.as_str()) {
            return Err(IngestError::Malformed(format!("trip {} references unknown route {}", t.id, t.route_id)));
        }
        if !service_ids.contains(t.service_id.as_str()) {
            return Err(IngestError::Malformed(format!("trip {} references unknown service {}", t.id, t.service_id)));
        }
        if let Some(shape_id) = &t.shape_id {
            if !feed.shapes.iter().any(|(id, _)| id == shape_id) {
                return Err(IngestError::Malformed(format!("trip {} references unknown shape {shape_id}", t.id)));
            }
        }
    }
    for st in &feed.stop_times {
        if !trip_ids.contains(st.trip_id.as_str()) {
            return Err(IngestError::Malformed(format!("stop_time references unknown trip {}", st.trip_id)));
        }
        if !stop_ids.contains(st.stop_id.as_str()) {
            return Err(IngestError::Malformed(format!("stop_time references unknown stop {}", st.stop_id)));
        }
    }
    for tr in &feed.transfers {
        if !stop_ids.contains(tr.from_stop_id.as_str()) || !stop_ids.contains(tr.to_stop_id.as_str()) {
            return Err(IngestError::Malformed("transfer references unknown stop".into()));
        }
    }
    Ok(())
}

fn validate_stop_time_ordering(feed: &StaticFeed) -> Result<(), IngestError> {
    let mut by_trip: HashMap<&str, Vec<&StopTime>> = HashMap::new();
    for st in &feed.stop_times {
        by_trip.entry(st.trip_id.as_str()).or_default().push(st);
    }
    for (trip_id, mut sts) in by_trip {
        sts.sort_by_key(|st| st.stop_sequence);
        for pair in sts.windows(2) {
            if pair[0].stop_sequence >= pair[1].stop_sequence {
                return Err(IngestError::Malformed(format!(
                    "trip {trip_id} has non-increasing stop_sequence"
                )));
            }
            if let (Some(dep), Some(arr)) = (pair[0].departure_time, pair[1].arrival_time) {
                if dep > arr {
                    return Err(IngestError::Malformed(format!(
                        "trip {trip_id} has overlapping stop_times at sequence {}",
                        pair[1].stop_sequence
                    )));
                }
            }
        }
        for st in &sts {
            if let (Some(arr), Some(dep)) = (st.arrival_time, st.departure_time) {
                if dep < arr {
                    return Err(IngestError::Malformed(format!(
                        "trip {trip_id} stop_sequence {} has departure before arrival",
                        st.stop_sequence
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_shape_ordering(feed: &StaticFeed) -> Result<(), IngestError> {
    let mut by_shape: HashMap<&str, Vec<&ShapePoint>> = HashMap::new();
    for (shape_id, pt) in &feed.shapes {
        by_shape.entry(shape_id.as_str()).or_default().push(pt);
    }
    for (shape_id, mut pts) in by_shape {
        pts.sort_by_key(|p| p.shape_pt_sequence);
        for pair in pts.windows(2) {
            if pair[0].shape_pt_sequence >= pair[1].shape_pt_sequence {
                return Err(IngestError::Malformed(format!(
                    "shape {shape_id} has non-increasing shape_pt_sequence"
                )));
            }
            if let (Some(a), Some(b)) = (pair[0].shape_dist_traveled, pair[1].shape_dist_traveled) {
                if b < a {
                    return Err(IngestError::Malformed(format!(
                        "shape {shape_id} has decreasing shape_dist_traveled"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Builds the per-block denormalized trip ordering rows for persistence,
/// from the already-built [`crate::block_layover::BlockLayoverIndex`].
fn block_trip_rows(feed: &StaticFeed, index: &crate::block_layover::BlockLayoverIndex) -> (Vec<String>, Vec<BlockTripEntryRow>) {
    let mut block_ids: Vec<String> = feed
        .trips
        .iter()
        .filter_map(|t| t.block_id.clone())
        .collect();
    block_ids.sort();
    block_ids.dedup();

    let mut entries = Vec::new();
    for block_id in &block_ids {
        let Some(ordered_trips) = index.trips_by_block_ordered(block_id) else {
            continue;
        };
        let block_layovers = index.records_for_block(block_id);

        for (position, trip_id) in ordered_trips.iter().enumerate() {
            let trip = feed.trips.iter().find(|t| &t.id == trip_id);
            let layover = block_layovers.iter().find(|r| &r.next_trip_id == trip_id);

            entries.push(BlockTripEntryRow {
                block_id: block_id.clone(),
                position: position as i32,
                trip_id: trip_id.clone(),
                layover_stop_id: layover.map(|r| r.layover_stop_id.clone()),
                layover_start: layover.map(|r| r.layover_start),
                layover_end: layover.map(|r| r.layover_end),
                route_id: trip.map(|t| t.route_id.clone()),
                service_id: trip.map(|t| t.service_id.clone()),
            });
        }
    }
    (block_ids, entries)
}

/// Runs the full ingest pipeline against `store`: a single transaction
/// bulk-writing every table, the block-trip index, the import_metadata
/// row, and the FTS rebuild. Commits only if every step succeeds.
pub async fn ingest_into_store(
    store: &Store,
    feed: &StaticFeed,
    source: &str,
    content_sha256: &str,
    batch_size: usize,
) -> Result<(), IngestError> {
    let mut tx: Transaction<'_, Sqlite> = store.begin().await.map_err(IngestError::Store)?;

    bulk::insert_agencies(&mut tx, &feed.agencies).await.map_err(IngestError::Store)?;
    bulk::insert_stops(&mut tx, &feed.stops, batch_size).await.map_err(IngestError::Store)?;
    bulk::insert_routes(&mut tx, &feed.routes).await.map_err(IngestError::Store)?;
    bulk::insert_calendars(&mut tx, &feed.calendars).await.map_err(IngestError::Store)?;
    bulk::insert_calendar_dates(&mut tx, &feed.calendar_dates, batch_size).await.map_err(IngestError::Store)?;
    bulk::insert_trips(&mut tx, &feed.trips).await.map_err(IngestError::Store)?;
    bulk::insert_stop_times(&mut tx, &feed.stop_times, batch_size).await.map_err(IngestError::Store)?;
    bulk::insert_shapes(&mut tx, &feed.shapes, batch_size).await.map_err(IngestError::Store)?;
    bulk::insert_transfers(&mut tx, &feed.transfers).await.map_err(IngestError::Store)?;
    bulk::insert_frequencies(&mut tx, &feed.frequencies).await.map_err(IngestError::Store)?;

    let mut stop_times_by_trip: HashMap<String, Vec<StopTime>> = HashMap::new();
    for st in &feed.stop_times {
        stop_times_by_trip.entry(st.trip_id.clone()).or_default().push(st.clone());
    }
    for sts in stop_times_by_trip.values_mut() {
        sts.sort_by_key(|s| s.stop_sequence);
    }
    let block_index = crate::block_layover::BlockLayoverIndex::build(&feed.trips, &stop_times_by_trip);
    let (block_ids, entries) = block_trip_rows(feed, &block_index);
    bulk::insert_block_trip_entries(&mut tx, &block_ids, &entries).await.map_err(IngestError::Store)?;

    bulk::rebuild_fts(&mut tx).await.map_err(IngestError::Store)?;

    let counts = ImportCounts {
        agency_count: feed.agencies.len() as i64,
        stop_count: feed.stops.len() as i64,
        route_count: feed.routes.len() as i64,
        trip_count: feed.trips.len() as i64,
        stop_time_count: feed.stop_times.len() as i64,
    };
    bulk::record_import_metadata(&mut tx, source, content_sha256, &counts).await.map_err(IngestError::Store)?;

    tx.commit().await.map_err(|e| IngestError::Store(e.into()))?;
    info!(source, %content_sha256, "ingest committed");
    Ok(())
}

/// End-to-end: obtain bytes (download or local read), optionally tidy,
/// parse, and ingest into `store`. Returns the parsed feed so callers (the
/// Manager's hot-swap path) can build the Spatial Index and Block-Layover
/// Index from it without re-querying the store they just wrote.
pub async fn ingest_feed(
    client: &reqwest::Client,
    store: &Store,
    source_path_or_url: &str,
    auth_header: Option<&AuthHeader>,
    gtfstidy_binary: Option<&str>,
    batch_size: usize,
) -> Result<StaticFeed, IngestError> {
    let is_url = source_path_or_url.starts_with("http://") || source_path_or_url.starts_with("https://");
    let mut zip_bytes = if is_url {
        download_zip(
            client,
            &FeedSource {
                url: source_path_or_url.to_string(),
                auth_header: auth_header.cloned(),
            },
        )
        .await?
    } else {
        read_local_zip(source_path_or_url).await?
    };

    if let Some(binary) = gtfstidy_binary {
        zip_bytes = run_gtfstidy(zip_bytes, binary).await?;
    }

    let content_sha256 = sha256_hex(&zip_bytes);
    let feed = {
        let bytes = zip_bytes.clone();
        tokio::task::spawn_blocking(move || parse_zip(&bytes)).await??
    };

    ingest_into_store(store, &feed, source_path_or_url, &content_sha256, batch_size).await?;
    debug!(path = ?Path::new(source_path_or_url), "ingest_feed complete");
    Ok(feed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_minimal_gtfs_zip() -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let opts = SimpleFileOptions::default();

            writer.start_file("agency.txt", opts).unwrap();
            writer
                .write_all(b"agency_id,agency_name,agency_url,agency_timezone\n25,Redding Area Bus Authority,https://example.com,America/Los_Angeles\n")
                .unwrap();

            writer.start_file("stops.txt", opts).unwrap();
            writer
                .write_all(b"stop_id,stop_name,stop_lat,stop_lon\nS1,Main St,40.589123,-122.390830\nS2,Oak Ave,40.6,-122.4\n")
                .unwrap();

            writer.start_file("routes.txt", opts).unwrap();
            writer
                .write_all(b"route_id,agency_id,route_short_name,route_type\nR1,25,1,3\n")
                .unwrap();

            writer.start_file("trips.txt", opts).unwrap();
            writer
                .write_all(b"trip_id,route_id,service_id,block_id\nT1,R1,SVC1,B1\n")
                .unwrap();

            writer.start_file("stop_times.txt", opts).unwrap();
            writer
                .write_all(b"trip_id,stop_sequence,stop_id,arrival_time,departure_time\nT1,1,S1,08:00:00,08:00:00\nT1,2,S2,08:10:00,08:10:00\n")
                .unwrap();

            writer.start_file("calendar.txt", opts).unwrap();
            writer
                .write_all(b"service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nSVC1,1,1,1,1,1,0,0,20260101,20261231\n")
                .unwrap();

            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn parses_a_minimal_well_formed_feed() {
        let zip_bytes = build_minimal_gtfs_zip();
        let feed = parse_zip(&zip_bytes).expect("parse");
        assert_eq!(feed.agencies.len(), 1);
        assert_eq!(feed.agencies[0].id, "25");
        assert_eq!(feed.stops.len(), 2);
        assert_eq!(feed.routes.len(), 1);
        assert_eq!(feed.trips.len(), 1);
        assert_eq!(feed.stop_times.len(), 2);
    }

    #[test]
    fn rejects_a_feed_missing_a_required_file() {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            writer.start_file("agency.txt", SimpleFileOptions::default()).unwrap();
            writer.write_all(b"agency_id,agency_name,agency_url,agency_timezone\n").unwrap();
            writer.finish().unwrap();
        }
        let err = parse_zip(&buf).unwrap_err();
        assert!(matches!(err, IngestError::MissingRequiredFile(_)));
    }

    #[test]
    fn rejects_a_trip_referencing_an_unknown_route() {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let opts = SimpleFileOptions::default();
            writer.start_file("agency.txt", opts).unwrap();
            writer.write_all(b"agency_id,agency_name,agency_url,agency_timezone\n25,A,https://e,UTC\n").unwrap();
            writer.start_file("stops.txt", opts).unwrap();
            writer.write_all(b"stop_id,stop_lat,stop_lon\nS1,1.0,1.0\n").unwrap();
            writer.start_file("routes.txt", opts).unwrap();
            writer.write_all(b"route_id,route_type\nR1,3\n").unwrap();
            writer.start_file("trips.txt", opts).unwrap();
            writer.write_all(b"trip_id,route_id,service_id\nT1,DOES-NOT-EXIST,SVC1\n").unwrap();
            writer.start_file("stop_times.txt", opts).unwrap();
            writer.write_all(b"trip_id,stop_sequence,stop_id\nT1,1,S1\n").unwrap();
            writer.start_file("calendar_dates.txt", opts).unwrap();
            writer.write_all(b"service_id,date,exception_type\nSVC1,20260101,1\n").unwrap();
            writer.finish().unwrap();
        }
        let err = parse_zip(&buf).unwrap_err();
        assert!(matches!(err, IngestError::Malformed(_)));
    }

    #[test]
    fn sha256_hex_is_deterministic() {
        assert_eq!(sha256_hex(b"abc"), sha256_hex(b"abc"));
        assert_ne!(sha256_hex(b"abc"), sha256_hex(b"abd"));
    }
}
