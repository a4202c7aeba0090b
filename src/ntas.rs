//! Wire types for the NTAS (next train arrival) endpoint.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// `trainMessage` value for trains that have not yet reached the platform.
pub const ARRIVING: &str = "Arriving";

/// Body returned by `loadNtas.action` for one (line, station) query.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NtasResponse {
    #[serde(default)]
    pub all_stations: bool,
    #[serde(default)]
    pub ntas_data: Option<Vec<TrainRecord>>,
}

/// One train observation inside `ntasData`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainRecord {
    pub id: i64,
    /// Station character code, e.g. `"YUS-9"`.
    #[serde(default)]
    pub station_id: String,
    #[serde(default)]
    pub subway_line: String,
    #[serde(default)]
    pub system_message_type: String,
    #[serde(default)]
    pub time_int: f64,
    #[serde(default)]
    pub train_direction: String,
    #[serde(default)]
    pub train_id: i64,
    #[serde(default)]
    pub train_message: String,
    #[serde(default)]
    pub create_date: Option<String>,
}

impl NtasResponse {
    pub fn records(&self) -> &[TrainRecord] {
        self.ntas_data.as_deref().unwrap_or(&[])
    }

    /// Creation time of the board, taken from the first record.
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        self.records()
            .first()
            .and_then(|r| r.create_date.as_deref())
            .and_then(parse_create_date)
    }
}

impl TrainRecord {
    /// Arriving trains are not final observations and are never stored.
    pub fn is_final(&self) -> bool {
        self.train_message != ARRIVING
    }
}

/// Parses `createDate`, which uses either `T` or a space as the date/time separator.
pub fn parse_create_date(raw: &str) -> Option<NaiveDateTime> {
    let normalized = raw.replace('T', " ");
    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f").ok()
}
