//! Bounded-retry fetch-and-validate cycle for a single station.
//!
//! A poll walks `Attempting(1) -> Attempting(2) -> ...` until either a
//! complete board is received or `max_attempts` attempts have failed. Failed
//! attempts are followed by a fixed delay, except the last one.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::fetch::{StationQuery, Transport, TransportError};
use crate::ntas::NtasResponse;
use crate::oracle::is_missing;
use crate::parser::parse_response;
use crate::registry::{LineId, Registry, StationId};

/// Attempts per station when all stations are polled concurrently.
pub const CONCURRENT_ATTEMPTS: u32 = 4;
/// Attempts per station on the sequential path.
pub const SEQUENTIAL_ATTEMPTS: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
pub const CONCURRENT_TIMEOUT: Duration = Duration::from_secs(5);
pub const SEQUENTIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How many times to try a station, how long to wait in between, and how
/// long a single attempt may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn concurrent() -> Self {
        Self {
            max_attempts: CONCURRENT_ATTEMPTS,
            retry_delay: RETRY_DELAY,
            timeout: CONCURRENT_TIMEOUT,
        }
    }

    pub fn sequential() -> Self {
        Self {
            max_attempts: SEQUENTIAL_ATTEMPTS,
            retry_delay: RETRY_DELAY,
            timeout: SEQUENTIAL_TIMEOUT,
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A validated board and the time it was received.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub response: NtasResponse,
    pub raw: Value,
    pub received_at: DateTime<Utc>,
}

/// Result of one station poll.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched(Fetched),
    /// Every attempt failed or returned incomplete data.
    Missing,
}

impl FetchOutcome {
    pub fn is_missing(&self) -> bool {
        matches!(self, FetchOutcome::Missing)
    }

    pub fn fetched(&self) -> Option<&Fetched> {
        match self {
            FetchOutcome::Fetched(f) => Some(f),
            FetchOutcome::Missing => None,
        }
    }
}

enum PollState {
    Attempting(u32),
    Success(Fetched),
    Exhausted,
}

/// Why an attempt did not produce a usable board.
enum AttemptError {
    Transport(TransportError),
    Undecodable(anyhow::Error),
    Incomplete,
}

pub struct StationPoller<T> {
    transport: Arc<T>,
    registry: Arc<Registry>,
    policy: RetryPolicy,
}

impl<T> Clone for StationPoller<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            policy: self.policy,
        }
    }
}

impl<T: Transport> StationPoller<T> {
    pub fn new(transport: Arc<T>, registry: Arc<Registry>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            registry,
            policy,
        }
    }

    /// Fetches `(line, station)` until a complete board arrives or attempts run out.
    ///
    /// Never fails: transport and decoding errors are logged and retried, and
    /// exhaustion is reported as [`FetchOutcome::Missing`].
    #[tracing::instrument(name = "poll_station", skip(self, line), fields(line = %line))]
    pub async fn poll(&self, line: LineId, station: StationId) -> FetchOutcome {
        let query = StationQuery::new(line, station);
        let mut state = PollState::Attempting(1);

        loop {
            state = match state {
                PollState::Attempting(attempt) => match self.attempt(&query).await {
                    Ok(fetched) => PollState::Success(fetched),
                    Err(err) => {
                        match err {
                            AttemptError::Transport(e) => {
                                error!(attempt, error = %e, fault = "unexpected", "Request error");
                            }
                            AttemptError::Undecodable(e) => {
                                error!(attempt, error = %e, fault = "unexpected", "Undecodable board");
                            }
                            AttemptError::Incomplete => debug!(attempt, "Missing data"),
                        }
                        debug!(attempt, "Try {attempt} for station {station} failed");

                        if attempt >= self.policy.max_attempts {
                            PollState::Exhausted
                        } else {
                            debug!(delay = ?self.policy.retry_delay, "Sleeping before retry");
                            tokio::time::sleep(self.policy.retry_delay).await;
                            PollState::Attempting(attempt + 1)
                        }
                    }
                },
                PollState::Success(fetched) => return FetchOutcome::Fetched(fetched),
                PollState::Exhausted => return FetchOutcome::Missing,
            };
        }
    }

    async fn attempt(&self, query: &StationQuery) -> Result<Fetched, AttemptError> {
        let timeout = self.policy.timeout;
        let response = tokio::time::timeout(timeout, self.transport.fetch(query, timeout))
            .await
            .map_err(|_| AttemptError::Transport(TransportError::Timeout))?
            .map_err(AttemptError::Transport)?;

        let parsed = parse_response(&response.body).map_err(AttemptError::Undecodable)?;
        if is_missing(&self.registry, query.station, query.line, Some(&parsed)) {
            return Err(AttemptError::Incomplete);
        }

        Ok(Fetched {
            response: parsed,
            raw: response.body,
            received_at: response.received_at,
        })
    }
}
