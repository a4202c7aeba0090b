//! Persistence of polls, accepted requests and train records.
//!
//! [`Store`] is the gateway the orchestrator writes through. Implementations:
//! [`PgStore`] (Postgres), [`CsvStore`] (append-only CSV files) and
//! [`MemoryStore`] (in-process, for dry runs and tests).

mod csv;
mod memory;
mod postgres;

pub use self::csv::CsvStore;
pub use memory::{MemoryStore, StoredPoll};
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use std::fmt;

use crate::ntas::TrainRecord;
use crate::registry::{LineId, StationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PollId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub i64);

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An accepted board, ready to be stored under a poll.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub poll_id: PollId,
    pub station: StationId,
    pub line: LineId,
    pub all_stations: bool,
    /// `createDate` of the first record.
    pub created_at: Option<NaiveDateTime>,
    pub payload: Value,
    pub requested_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a poll and returns its id.
    async fn begin_poll(&self, started_at: DateTime<Utc>) -> Result<PollId>;

    /// Closes a poll.
    async fn end_poll(&self, poll: PollId, ended_at: DateTime<Utc>) -> Result<()>;

    async fn insert_request(&self, request: &NewRequest) -> Result<RequestId>;

    async fn insert_record(&self, request: RequestId, record: &TrainRecord) -> Result<()>;

    /// Stores a request together with its records.
    ///
    /// Stores with transactions override this so that a request and its
    /// records are committed as one unit.
    async fn save_request(
        &self,
        request: &NewRequest,
        records: &[&TrainRecord],
    ) -> Result<RequestId> {
        let request_id = self.insert_request(request).await?;
        for record in records {
            self.insert_record(request_id, record).await?;
        }
        Ok(request_id)
    }
}
