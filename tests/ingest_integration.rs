//! End-to-end ingest tests: build a minimal GTFS zip in memory with
//! `zip::ZipWriter` and drive it through `ingest::parse_zip` and
//! `ingest::ingest_into_store` against a real `:memory:` SQLite store.

use std::io::{Cursor, Write};

use gtfs_dataplane::error::IngestError;
use gtfs_dataplane::ingest;
use gtfs_dataplane::store::{queries, Store};

fn write_file(zip: &mut zip::ZipWriter<&mut Cursor<Vec<u8>>>, name: &str, contents: &str) {
    zip.start_file(name, zip::write::SimpleFileOptions::default()).unwrap();
    zip.write_all(contents.as_bytes()).unwrap();
}

/// A minimal, referentially-sound single-route, single-trip, two-stop feed.
fn minimal_feed_zip() -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);

        write_file(
            &mut zip,
            "agency.txt",
            "agency_id,agency_name,agency_url,agency_timezone\na1,Test Agency,https://example.com,America/Los_Angeles\n",
        );
        write_file(
            &mut zip,
            "stops.txt",
            "stop_id,stop_name,stop_lat,stop_lon\n\
             s1,First St,47.6097,-122.3331\n\
             s2,Second St,47.6205,-122.3493\n",
        );
        write_file(
            &mut zip,
            "routes.txt",
            "route_id,agency_id,route_short_name,route_long_name,route_type\nr1,a1,1,Downtown Loop,3\n",
        );
        write_file(
            &mut zip,
            "calendar.txt",
            "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
             svc1,1,1,1,1,1,0,0,20260101,20261231\n",
        );
        write_file(
            &mut zip,
            "trips.txt",
            "trip_id,route_id,service_id,block_id\nt1,r1,svc1,b1\n",
        );
        write_file(
            &mut zip,
            "stop_times.txt",
            "trip_id,stop_sequence,stop_id,arrival_time,departure_time\n\
             t1,1,s1,08:00:00,08:00:00\n\
             t1,2,s2,08:10:00,08:10:00\n",
        );

        zip.finish().unwrap();
    }
    cursor.into_inner()
}

#[test]
fn parses_minimal_well_formed_feed() {
    let feed = ingest::parse_zip(&minimal_feed_zip()).expect("minimal feed should parse");

    assert_eq!(feed.agencies.len(), 1);
    assert_eq!(feed.stops.len(), 2);
    assert_eq!(feed.routes.len(), 1);
    assert_eq!(feed.trips.len(), 1);
    assert_eq!(feed.stop_times.len(), 2);

    let trip = &feed.trips[0];
    assert_eq!(trip.route_id, "r1");
    assert_eq!(trip.service_id, "svc1");
    assert_eq!(trip.block_id.as_deref(), Some("b1"));

    // stop_times.arrival_time/departure_time are seconds since midnight
    // (Open Question #2), not nanoseconds.
    assert_eq!(feed.stop_times[0].arrival_time, Some(8 * 3600));
    assert_eq!(feed.stop_times[1].departure_time, Some(8 * 3600 + 600));
}

#[test]
fn rejects_stop_time_referencing_unknown_trip() {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        write_file(&mut zip, "agency.txt", "agency_id,agency_name,agency_url,agency_timezone\na1,Test Agency,https://example.com,America/Los_Angeles\n");
        write_file(&mut zip, "stops.txt", "stop_id,stop_name,stop_lat,stop_lon\ns1,First St,47.6,-122.3\n");
        write_file(&mut zip, "routes.txt", "route_id,agency_id,route_short_name,route_type\nr1,a1,1,3\n");
        write_file(
            &mut zip,
            "calendar.txt",
            "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nsvc1,1,1,1,1,1,0,0,20260101,20261231\n",
        );
        write_file(&mut zip, "trips.txt", "trip_id,route_id,service_id\nt1,r1,svc1\n");
        // References a trip_id that doesn't exist in trips.txt.
        write_file(
            &mut zip,
            "stop_times.txt",
            "trip_id,stop_sequence,stop_id\nghost,1,s1\n",
        );
        zip.finish().unwrap();
    }

    let err = ingest::parse_zip(&cursor.into_inner()).expect_err("dangling trip_id must be rejected");
    assert!(matches!(err, IngestError::Malformed(_)), "expected Malformed, got {err:?}");
}

#[test]
fn rejects_non_increasing_stop_sequence() {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        write_file(&mut zip, "agency.txt", "agency_id,agency_name,agency_url,agency_timezone\na1,Test Agency,https://example.com,America/Los_Angeles\n");
        write_file(&mut zip, "stops.txt", "stop_id,stop_name,stop_lat,stop_lon\ns1,First St,47.6,-122.3\ns2,Second St,47.62,-122.35\n");
        write_file(&mut zip, "routes.txt", "route_id,agency_id,route_short_name,route_type\nr1,a1,1,3\n");
        write_file(
            &mut zip,
            "calendar.txt",
            "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nsvc1,1,1,1,1,1,0,0,20260101,20261231\n",
        );
        write_file(&mut zip, "trips.txt", "trip_id,route_id,service_id\nt1,r1,svc1\n");
        write_file(
            &mut zip,
            "stop_times.txt",
            "trip_id,stop_sequence,stop_id\nt1,2,s1\nt1,1,s2\n",
        );
        zip.finish().unwrap();
    }

    let err = ingest::parse_zip(&cursor.into_inner()).expect_err("non-increasing stop_sequence must be rejected");
    assert!(matches!(err, IngestError::Malformed(_)), "expected Malformed, got {err:?}");
}

#[test]
fn rejects_feed_missing_required_file() {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut cursor);
        write_file(&mut zip, "agency.txt", "agency_id,agency_name,agency_url,agency_timezone\na1,Test Agency,https://example.com,America/Los_Angeles\n");
        // stops.txt, routes.txt, trips.txt, stop_times.txt are all missing.
        zip.finish().unwrap();
    }

    let err = ingest::parse_zip(&cursor.into_inner()).expect_err("missing required files must be rejected");
    assert!(matches!(err, IngestError::MissingRequiredFile(_)), "expected MissingRequiredFile, got {err:?}");
}

#[tokio::test]
async fn ingest_into_store_round_trips_through_queries() {
    let feed = ingest::parse_zip(&minimal_feed_zip()).expect("minimal feed should parse");
    let store = Store::open_memory().await.expect("open in-memory store");

    ingest::ingest_into_store(&store, &feed, "test-fixture.zip", "deadbeef", 1000)
        .await
        .expect("ingest should commit");

    let agencies = queries::list_agencies(store.pool()).await.expect("list_agencies");
    assert_eq!(agencies.len(), 1);
    assert_eq!(agencies[0].id, "a1");

    let active = queries::active_stops(store.pool()).await.expect("active_stops");
    assert_eq!(active.len(), 2, "both stops are referenced by stop_times and so are active");

    let missing = queries::get_stop(store.pool(), "nonexistent").await.expect("get_stop");
    assert!(missing.is_none());

    let found = queries::get_stop(store.pool(), "s1").await.expect("get_stop").expect("s1 exists");
    assert_eq!(found.name.as_deref(), Some("First St"));
}
