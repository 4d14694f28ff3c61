//! Batch inserts for the three large tables (`stop_times`, `shapes`,
//! `calendar_dates`) plus per-row inserts for everything else. Bulk writers
//! take an open `Transaction` so the Ingestor can compose every table write
//! and the FTS rebuild into one all-or-nothing commit.

use sqlx::{QueryBuilder, Sqlite, Transaction};

use crate::error::StoreError;
use crate::model::*;

/// Reference batch size: large enough to amortize per-statement overhead,
/// small enough to stay well clear of the embedded engine's per-statement
/// bind-parameter ceiling for tables with this many columns.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

fn resolve_batch_size(requested: usize) -> usize {
    if requested == 0 {
        DEFAULT_BATCH_SIZE
    } else {
        requested
    }
}

fn continuous_policy_str(p: ContinuousPolicy) -> &'static str {
    match p {
        ContinuousPolicy::Continuous => "continuous",
        ContinuousPolicy::NotAvailable => "not_available",
        ContinuousPolicy::MustPhone => "must_phone",
        ContinuousPolicy::MustCoordinateWithDriver => "must_coordinate_with_driver",
    }
}

fn pickup_drop_off_str(p: PickupDropOffType) -> &'static str {
    match p {
        PickupDropOffType::RegularlyScheduled => "regularly_scheduled",
        PickupDropOffType::NoService => "no_service",
        PickupDropOffType::MustPhone => "must_phone",
        PickupDropOffType::MustCoordinateWithDriver => "must_coordinate_with_driver",
    }
}

fn transfer_type_str(t: TransferType) -> &'static str {
    match t {
        TransferType::Recommended => "recommended",
        TransferType::Timed => "timed",
        TransferType::MinimumTime => "minimum_time",
        TransferType::NotPossible => "not_possible",
        TransferType::InSeatTransfer => "in_seat_transfer",
        TransferType::InSeatTransferNotAllowed => "in_seat_transfer_not_allowed",
    }
}

fn location_type_str(t: LocationType) -> &'static str {
    match t {
        LocationType::Stop => "stop",
        LocationType::Station => "station",
        LocationType::EntranceExit => "entrance_exit",
        LocationType::GenericNode => "generic_node",
        LocationType::BoardingArea => "boarding_area",
    }
}

fn exact_times_str(t: ExactTimes) -> &'static str {
    match t {
        ExactTimes::FrequencyBased => "frequency_based",
        ExactTimes::ScheduleBased => "schedule_based",
    }
}

pub async fn insert_agencies(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[Agency],
) -> Result<(), StoreError> {
    for a in rows {
        sqlx::query(
            "INSERT INTO agency (id, name, url, timezone, lang, phone, email, fare_url)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&a.id)
        .bind(&a.name)
        .bind(&a.url)
        .bind(&a.timezone)
        .bind(&a.lang)
        .bind(&a.phone)
        .bind(&a.email)
        .bind(&a.fare_url)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn insert_stops(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[Stop],
    batch_size: usize,
) -> Result<usize, StoreError> {
    let batch_size = resolve_batch_size(batch_size);
    let mut inserted = 0usize;
    for chunk in rows.chunks(batch_size) {
        if chunk.is_empty() {
            continue;
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO stops (id, code, name, lat, lon, parent_station, location_type, wheelchair_boarding, direction) ",
        );
        qb.push_values(chunk, |mut b, s| {
            b.push_bind(&s.id)
                .push_bind(&s.code)
                .push_bind(&s.name)
                .push_bind(s.lat)
                .push_bind(s.lon)
                .push_bind(&s.parent_station)
                .push_bind(location_type_str(s.location_type))
                .push_bind(s.wheelchair_boarding)
                .push_bind(s.direction.map(|d| d.as_str()));
        });
        qb.build().execute(&mut **tx).await?;
        inserted += chunk.len();
    }
    Ok(inserted)
}

pub async fn insert_routes(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[Route],
) -> Result<(), StoreError> {
    for r in rows {
        sqlx::query(
            "INSERT INTO routes (id, agency_id, short_name, long_name, description, route_type, url, color, text_color, continuous_pickup, continuous_drop_off)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&r.id)
        .bind(&r.agency_id)
        .bind(&r.short_name)
        .bind(&r.long_name)
        .bind(&r.description)
        .bind(r.route_type)
        .bind(&r.url)
        .bind(&r.color)
        .bind(&r.text_color)
        .bind(continuous_policy_str(r.continuous_pickup))
        .bind(continuous_policy_str(r.continuous_drop_off))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn insert_calendars(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[Calendar],
) -> Result<(), StoreError> {
    for c in rows {
        sqlx::query(
            "INSERT INTO calendar (service_id, monday, tuesday, wednesday, thursday, friday, saturday, sunday, start_date, end_date)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&c.service_id)
        .bind(c.days[0])
        .bind(c.days[1])
        .bind(c.days[2])
        .bind(c.days[3])
        .bind(c.days[4])
        .bind(c.days[5])
        .bind(c.days[6])
        .bind(format_gtfs_date(c.start_date))
        .bind(format_gtfs_date(c.end_date))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn insert_calendar_dates(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[(String, CalendarDate)],
    batch_size: usize,
) -> Result<usize, StoreError> {
    let batch_size = resolve_batch_size(batch_size);
    let mut inserted = 0usize;
    for chunk in rows.chunks(batch_size) {
        if chunk.is_empty() {
            continue;
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("INSERT INTO calendar_dates (service_id, date, exception_type) ");
        qb.push_values(chunk, |mut b, (service_id, cd)| {
            b.push_bind(service_id)
                .push_bind(format_gtfs_date(cd.date))
                .push_bind(cd.exception_type.to_gtfs_code());
        });
        qb.build().execute(&mut **tx).await?;
        inserted += chunk.len();
    }
    Ok(inserted)
}

pub async fn insert_trips(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[Trip],
) -> Result<(), StoreError> {
    for t in rows {
        sqlx::query(
            "INSERT INTO trips (id, route_id, service_id, headsign, short_name, direction_id, block_id, shape_id, wheelchair_accessible, bikes_allowed)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&t.id)
        .bind(&t.route_id)
        .bind(&t.service_id)
        .bind(&t.headsign)
        .bind(&t.short_name)
        .bind(t.direction_id)
        .bind(&t.block_id)
        .bind(&t.shape_id)
        .bind(t.wheelchair_accessible)
        .bind(t.bikes_allowed)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Inserts `stop_times` rows for a single trip (or a pre-sorted mixed set)
/// in chunks of `batch_size`, returning the number of rows written. Used
/// directly by the bulk-insert boundary tests (0, 1, 1000, 1001, 2500).
pub async fn insert_stop_times(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[StopTime],
    batch_size: usize,
) -> Result<usize, StoreError> {
    let batch_size = resolve_batch_size(batch_size);
    let mut inserted = 0usize;
    for chunk in rows.chunks(batch_size) {
        if chunk.is_empty() {
            continue;
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO stop_times (trip_id, stop_sequence, stop_id, arrival_time, departure_time, pickup_type, drop_off_type, shape_dist_traveled) ",
        );
        qb.push_values(chunk, |mut b, st| {
            b.push_bind(&st.trip_id)
                .push_bind(st.stop_sequence)
                .push_bind(&st.stop_id)
                .push_bind(st.arrival_time)
                .push_bind(st.departure_time)
                .push_bind(pickup_drop_off_str(st.pickup_type))
                .push_bind(pickup_drop_off_str(st.drop_off_type))
                .push_bind(st.shape_dist_traveled);
        });
        qb.build().execute(&mut **tx).await?;
        inserted += chunk.len();
    }
    Ok(inserted)
}

pub async fn insert_shapes(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[(String, ShapePoint)],
    batch_size: usize,
) -> Result<usize, StoreError> {
    let batch_size = resolve_batch_size(batch_size);
    let mut inserted = 0usize;
    for chunk in rows.chunks(batch_size) {
        if chunk.is_empty() {
            continue;
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO shapes (shape_id, shape_pt_sequence, lat, lon, shape_dist_traveled) ",
        );
        qb.push_values(chunk, |mut b, (shape_id, pt)| {
            b.push_bind(shape_id)
                .push_bind(pt.shape_pt_sequence)
                .push_bind(pt.lat)
                .push_bind(pt.lon)
                .push_bind(pt.shape_dist_traveled);
        });
        qb.build().execute(&mut **tx).await?;
        inserted += chunk.len();
    }
    Ok(inserted)
}

pub async fn insert_transfers(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[Transfer],
) -> Result<(), StoreError> {
    for t in rows {
        sqlx::query(
            "INSERT INTO transfers (from_stop_id, to_stop_id, transfer_type, min_transfer_time)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&t.from_stop_id)
        .bind(&t.to_stop_id)
        .bind(transfer_type_str(t.transfer_type))
        .bind(t.min_transfer_time)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn insert_frequencies(
    tx: &mut Transaction<'_, Sqlite>,
    rows: &[Frequency],
) -> Result<(), StoreError> {
    for f in rows {
        sqlx::query(
            "INSERT INTO frequencies (trip_id, start_time, end_time, headway_secs, exact_times)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&f.trip_id)
        .bind(f.start_time)
        .bind(f.end_time)
        .bind(f.headway_secs)
        .bind(exact_times_str(f.exact_times))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Rebuilds both FTS5 shadow tables from their parent tables. Must run in
/// the same transaction as the table writes it shadows.
pub async fn rebuild_fts(tx: &mut Transaction<'_, Sqlite>) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM routes_fts").execute(&mut **tx).await?;
    sqlx::query(
        "INSERT INTO routes_fts (rowid, short_name, long_name, description)
         SELECT rowid, short_name, long_name, description FROM routes",
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM stops_fts").execute(&mut **tx).await?;
    sqlx::query(
        "INSERT INTO stops_fts (rowid, name) SELECT rowid, name FROM stops",
    )
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// One row of the denormalized per-block trip ordering, as persisted to
/// `block_trip_index`/`block_trip_entry`.
pub struct BlockTripEntryRow {
    pub block_id: String,
    pub position: i32,
    pub trip_id: String,
    pub layover_stop_id: Option<String>,
    pub layover_start: Option<i32>,
    pub layover_end: Option<i32>,
    pub route_id: Option<String>,
    pub service_id: Option<String>,
}

pub async fn insert_block_trip_entries(
    tx: &mut Transaction<'_, Sqlite>,
    block_ids: &[String],
    entries: &[BlockTripEntryRow],
) -> Result<(), StoreError> {
    for block_id in block_ids {
        sqlx::query("INSERT INTO block_trip_index (block_id) VALUES (?)")
            .bind(block_id)
            .execute(&mut **tx)
            .await?;
    }
    for e in entries {
        sqlx::query(
            "INSERT INTO block_trip_entry (block_id, position, trip_id, layover_stop_id, layover_start, layover_end, route_id, service_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&e.block_id)
        .bind(e.position)
        .bind(&e.trip_id)
        .bind(&e.layover_stop_id)
        .bind(e.layover_start)
        .bind(e.layover_end)
        .bind(&e.route_id)
        .bind(&e.service_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub struct ImportCounts {
    pub agency_count: i64,
    pub stop_count: i64,
    pub route_count: i64,
    pub trip_count: i64,
    pub stop_time_count: i64,
}

pub async fn record_import_metadata(
    tx: &mut Transaction<'_, Sqlite>,
    source: &str,
    content_sha256: &str,
    counts: &ImportCounts,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO import_metadata (source, imported_at, content_sha256, agency_count, stop_count, route_count, trip_count, stop_time_count)
         VALUES (?, datetime('now'), ?, ?, ?, ?, ?, ?)",
    )
    .bind(source)
    .bind(content_sha256)
    .bind(counts.agency_count)
    .bind(counts.stop_count)
    .bind(counts.route_count)
    .bind(counts.trip_count)
    .bind(counts.stop_time_count)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
