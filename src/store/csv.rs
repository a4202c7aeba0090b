//! Append-only CSV store.
//!
//! Writes three files under an output directory:
//! - `poll_events.csv`: one `start` row when a poll opens, one `end` row when it closes
//! - `requests.csv`: one row per accepted board, payload as JSON text
//! - `records.csv`: one row per stored train record
//!
//! A poll with a `start` row and no `end` row was aborted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use super::{NewRequest, PollId, RequestId, Store};
use crate::ntas::TrainRecord;

const POLL_EVENTS: &str = "poll_events.csv";
const REQUESTS: &str = "requests.csv";
const RECORDS: &str = "records.csv";

#[derive(Serialize)]
struct PollEventRow {
    poll_id: i64,
    event: &'static str,
    at: DateTime<Utc>,
}

#[derive(Serialize)]
struct RequestRow<'a> {
    request_id: i64,
    poll_id: i64,
    station_id: u32,
    line_id: u8,
    all_stations: bool,
    create_date: Option<NaiveDateTime>,
    request_date: DateTime<Utc>,
    payload: &'a str,
}

#[derive(Serialize)]
struct RecordRow<'a> {
    request_id: i64,
    id: i64,
    station_char: &'a str,
    subway_line: &'a str,
    system_message_type: &'a str,
    time_int: f64,
    train_direction: &'a str,
    train_id: i64,
    train_message: &'a str,
}

impl<'a> RecordRow<'a> {
    fn new(request_id: RequestId, r: &'a TrainRecord) -> Self {
        Self {
            request_id: request_id.0,
            id: r.id,
            station_char: &r.station_id,
            subway_line: &r.subway_line,
            system_message_type: &r.system_message_type,
            time_int: r.time_int,
            train_direction: &r.train_direction,
            train_id: r.train_id,
            train_message: &r.train_message,
        }
    }
}

#[derive(Deserialize)]
struct PollIdColumn {
    poll_id: i64,
}

#[derive(Deserialize)]
struct RequestIdColumn {
    request_id: i64,
}

pub struct CsvStore {
    dir: PathBuf,
    next_poll: AtomicI64,
    next_request: AtomicI64,
}

impl CsvStore {
    /// Opens (creating if needed) a store in `dir`.
    ///
    /// Id counters continue from the highest ids already on disk.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;

        let last_poll = max_id(&dir.join(POLL_EVENTS), |r: &PollIdColumn| r.poll_id)?;
        let last_request = max_id(&dir.join(REQUESTS), |r: &RequestIdColumn| r.request_id)?;
        debug!(dir = %dir.display(), last_poll, last_request, "Opened CSV store");

        Ok(Self {
            dir,
            next_poll: AtomicI64::new(last_poll + 1),
            next_request: AtomicI64::new(last_request + 1),
        })
    }
}

fn max_id<T, F>(path: &Path, id: F) -> Result<i64>
where
    T: for<'de> Deserialize<'de>,
    F: Fn(&T) -> i64,
{
    if !path.exists() {
        return Ok(0);
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut max = 0;
    for row in reader.deserialize::<T>() {
        max = max.max(id(&row?));
    }
    Ok(max)
}

/// Appends rows to a CSV file, writing the header only when the file is new.
fn append_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, rows = rows.len(), "Appending CSV rows");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;

    Ok(())
}

#[async_trait]
impl Store for CsvStore {
    async fn begin_poll(&self, started_at: DateTime<Utc>) -> Result<PollId> {
        let poll_id = self.next_poll.fetch_add(1, Ordering::SeqCst);
        append_rows(
            &self.dir.join(POLL_EVENTS),
            &[PollEventRow {
                poll_id,
                event: "start",
                at: started_at,
            }],
        )?;
        Ok(PollId(poll_id))
    }

    async fn end_poll(&self, poll: PollId, ended_at: DateTime<Utc>) -> Result<()> {
        append_rows(
            &self.dir.join(POLL_EVENTS),
            &[PollEventRow {
                poll_id: poll.0,
                event: "end",
                at: ended_at,
            }],
        )
    }

    async fn insert_request(&self, request: &NewRequest) -> Result<RequestId> {
        let request_id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let payload = serde_json::to_string(&request.payload)?;
        append_rows(
            &self.dir.join(REQUESTS),
            &[RequestRow {
                request_id,
                poll_id: request.poll_id.0,
                station_id: request.station,
                line_id: request.line.number(),
                all_stations: request.all_stations,
                create_date: request.created_at,
                request_date: request.requested_at,
                payload: &payload,
            }],
        )?;
        Ok(RequestId(request_id))
    }

    async fn insert_record(&self, request: RequestId, record: &TrainRecord) -> Result<()> {
        append_rows(&self.dir.join(RECORDS), &[RecordRow::new(request, record)])
    }

    async fn save_request(
        &self,
        request: &NewRequest,
        records: &[&TrainRecord],
    ) -> Result<RequestId> {
        let request_id = self.insert_request(request).await?;
        let rows: Vec<_> = records
            .iter()
            .map(|r| RecordRow::new(request_id, r))
            .collect();
        if !rows.is_empty() {
            append_rows(&self.dir.join(RECORDS), &rows)?;
        }
        Ok(request_id)
    }
}
