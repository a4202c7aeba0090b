use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{NewRequest, PollId, RequestId, Store};
use crate::ntas::TrainRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPoll {
    pub id: PollId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Tables {
    polls: Vec<StoredPoll>,
    requests: Vec<(RequestId, NewRequest)>,
    records: Vec<(RequestId, TrainRecord)>,
    last_poll: i64,
    last_request: i64,
}

impl Tables {
    /// Drops the oldest polls, with their requests and records, until at
    /// most `keep` remain.
    fn prune(&mut self, keep: usize) {
        let excess = self.polls.len().saturating_sub(keep);
        if excess == 0 {
            return;
        }
        let dropped: Vec<PollId> = self.polls.drain(..excess).map(|p| p.id).collect();
        let mut dropped_requests = Vec::new();
        self.requests.retain(|(id, r)| {
            let keep = !dropped.contains(&r.poll_id);
            if !keep {
                dropped_requests.push(*id);
            }
            keep
        });
        self.records.retain(|(id, _)| !dropped_requests.contains(id));
        debug!(polls = excess, requests = dropped_requests.len(), "Pruned memory store");
    }
}

/// Keeps everything in memory. Ids start at 1.
///
/// Unbounded by default; [`MemoryStore::with_retention`] keeps only the
/// most recent polls.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    retention: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `polls` polls (at least one); older ones are dropped
    /// when a new poll begins. Ids keep increasing across pruning.
    pub fn with_retention(polls: usize) -> Self {
        Self {
            tables: Mutex::default(),
            retention: Some(polls.max(1)),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn polls(&self) -> Vec<StoredPoll> {
        self.tables().polls.clone()
    }

    pub fn requests(&self) -> Vec<(RequestId, NewRequest)> {
        self.tables().requests.clone()
    }

    pub fn records(&self) -> Vec<(RequestId, TrainRecord)> {
        self.tables().records.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin_poll(&self, started_at: DateTime<Utc>) -> Result<PollId> {
        let mut tables = self.tables();
        tables.last_poll += 1;
        let id = PollId(tables.last_poll);
        tables.polls.push(StoredPoll {
            id,
            started_at,
            ended_at: None,
        });
        if let Some(keep) = self.retention {
            tables.prune(keep);
        }
        Ok(id)
    }

    async fn end_poll(&self, poll: PollId, ended_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables();
        let Some(row) = tables.polls.iter_mut().find(|p| p.id == poll) else {
            bail!("poll {poll} does not exist");
        };
        row.ended_at = Some(ended_at);
        Ok(())
    }

    async fn insert_request(&self, request: &NewRequest) -> Result<RequestId> {
        let mut tables = self.tables();
        if !tables.polls.iter().any(|p| p.id == request.poll_id) {
            bail!("poll {} does not exist", request.poll_id);
        }
        tables.last_request += 1;
        let id = RequestId(tables.last_request);
        tables.requests.push((id, request.clone()));
        Ok(id)
    }

    async fn insert_record(&self, request: RequestId, record: &TrainRecord) -> Result<()> {
        let mut tables = self.tables();
        if !tables.requests.iter().any(|(id, _)| *id == request) {
            bail!("request {request} does not exist");
        }
        tables.records.push((request, record.clone()));
        Ok(())
    }
}
