//! Scripted transport for exercising pollers without network access.
//!
//! Each `(line, station)` pair replays its own queue of [`Step`]s; once the
//! queue is drained (or for pairs with no script) the fallback step is used.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::error::TransportError;
use super::transport::{StationQuery, Transport, TransportResponse};
use crate::registry::{LineId, StationId};

/// What the transport does for one call.
#[derive(Debug, Clone)]
pub enum Step {
    /// Answer with this JSON body.
    Body(Value),
    /// Answer with a non-success status.
    Status(u16),
    /// Fail immediately with a timeout error.
    Timeout,
    /// Never answer; the caller's own timeout has to fire.
    Hang,
}

pub struct ScriptedTransport {
    scripts: Mutex<HashMap<(LineId, StationId), VecDeque<Step>>>,
    fallback: Step,
    calls: Mutex<HashMap<(LineId, StationId), Vec<Instant>>>,
}

impl ScriptedTransport {
    /// Every unscripted call gets `fallback`.
    pub fn new(fallback: Step) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(self, line: LineId, station: StationId, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((line, station), steps.into());
        self
    }

    /// Times at which `(line, station)` was fetched, in call order.
    pub fn calls(&self, line: LineId, station: StationId) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(line, station))
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    fn next_step(&self, key: (LineId, StationId)) -> Step {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .push(Instant::now());
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        query: &StationQuery,
        _timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        match self.next_step((query.line, query.station)) {
            Step::Body(body) => Ok(TransportResponse {
                received_at: Utc::now(),
                body,
            }),
            Step::Status(status) => Err(TransportError::Status(status)),
            Step::Timeout => Err(TransportError::Timeout),
            Step::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::Timeout)
            }
        }
    }
}

/// A board with one record per `(subwayLine, trainMessage)` entry.
pub fn board(records: &[(&str, &str)]) -> Value {
    let records: Vec<Value> = records
        .iter()
        .enumerate()
        .map(|(i, (line, message))| {
            json!({
                "id": i + 1,
                "stationId": format!("{line}-{i}"),
                "subwayLine": line,
                "systemMessageType": "Normal",
                "timeInt": 2.0,
                "trainDirection": "North",
                "trainId": 100 + i,
                "trainMessage": message,
                "createDate": "2017-04-05T10:12:34.567",
            })
        })
        .collect();
    json!({ "allStations": false, "ntasData": records })
}
