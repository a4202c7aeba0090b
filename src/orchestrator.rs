//! Poll cycle driver.
//!
//! A cycle opens a poll, fetches every `(line, station)` pair in the
//! registry, stores what came back and closes the poll. Fetching is
//! concurrent (one task per pair, joined before anything is stored) or, on
//! the sequential path, one pair at a time. Storage is always serial.
//!
//! Store errors abort the cycle and leave the poll without an end time.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::fetch::Transport;
use crate::ntas::TrainRecord;
use crate::poller::{FetchOutcome, RetryPolicy, StationPoller};
use crate::registry::{LineId, Registry, StationId};
use crate::stats::CycleSummary;
use crate::store::{NewRequest, PollId, Store};

pub struct Orchestrator<T, S> {
    registry: Arc<Registry>,
    transport: Arc<T>,
    store: S,
    concurrent: RetryPolicy,
    sequential: RetryPolicy,
    max_concurrency: Option<usize>,
}

impl<T, S> Orchestrator<T, S>
where
    T: Transport + 'static,
    S: Store,
{
    pub fn new(registry: Arc<Registry>, transport: Arc<T>, store: S) -> Self {
        Self {
            registry,
            transport,
            store,
            concurrent: RetryPolicy::concurrent(),
            sequential: RetryPolicy::sequential(),
            max_concurrency: None,
        }
    }

    pub fn with_concurrent_policy(mut self, policy: RetryPolicy) -> Self {
        self.concurrent = policy;
        self
    }

    pub fn with_sequential_policy(mut self, policy: RetryPolicy) -> Self {
        self.sequential = policy;
        self
    }

    /// Caps how many stations are fetched at once. Unbounded by default.
    pub fn with_max_concurrency(mut self, limit: Option<usize>) -> Self {
        self.max_concurrency = limit.map(|n| n.max(1));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one cycle with all stations fetched concurrently.
    #[tracing::instrument(name = "poll_cycle", skip(self), fields(mode = "concurrent"))]
    pub async fn run_poll_cycle(&self) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let poll_id = self.store.begin_poll(started_at).await?;
        info!(poll_id = poll_id.0, stations = self.registry.len(), "Poll started");

        let mut outcomes = self.fetch_all().await;

        let mut summary = CycleSummary::new(poll_id, started_at, self.registry.len());
        for (line, station) in self.registry.pairs() {
            let outcome = outcomes
                .remove(&(line, station))
                .unwrap_or(FetchOutcome::Missing);
            self.persist(&mut summary, poll_id, line, station, outcome)
                .await?;
        }

        self.close(poll_id, summary).await
    }

    /// Runs one cycle fetching and storing one station at a time.
    #[tracing::instrument(name = "poll_cycle", skip(self), fields(mode = "sequential"))]
    pub async fn run_poll_cycle_sequential(&self) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let poll_id = self.store.begin_poll(started_at).await?;
        info!(poll_id = poll_id.0, stations = self.registry.len(), "Poll started");

        let poller = StationPoller::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            self.sequential,
        );

        let mut summary = CycleSummary::new(poll_id, started_at, self.registry.len());
        for (line, station) in self.registry.pairs() {
            let outcome = poller.poll(line, station).await;
            self.persist(&mut summary, poll_id, line, station, outcome)
                .await?;
        }

        self.close(poll_id, summary).await
    }

    /// Spawns one poller per pair and waits for all of them.
    async fn fetch_all(&self) -> HashMap<(LineId, StationId), FetchOutcome> {
        let poller = StationPoller::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            self.concurrent,
        );
        let semaphore = self.max_concurrency.map(|n| Arc::new(Semaphore::new(n)));

        let mut tasks = Vec::with_capacity(self.registry.len());
        for (line, station) in self.registry.pairs() {
            let poller = poller.clone();
            let semaphore = semaphore.clone();

            let task = tokio::spawn(async move {
                let _permit = match semaphore {
                    Some(sem) => sem.acquire_owned().await.ok(),
                    None => None,
                };
                poller.poll(line, station).await
            });

            tasks.push(((line, station), task));
        }

        let mut outcomes = HashMap::with_capacity(tasks.len());
        for ((line, station), task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(line = %line, station, error = %e, fault = "unexpected", "Station task failed");
                    FetchOutcome::Missing
                }
            };
            outcomes.insert((line, station), outcome);
        }
        outcomes
    }

    /// Stores one pair's outcome, or reports it missing.
    async fn persist(
        &self,
        summary: &mut CycleSummary,
        poll_id: PollId,
        line: LineId,
        station: StationId,
        outcome: FetchOutcome,
    ) -> Result<()> {
        let FetchOutcome::Fetched(fetched) = outcome else {
            error!(line = %line, station, "No data for line {line}, station {station}");
            summary.missing.push((line, station));
            return Ok(());
        };

        let request = NewRequest {
            poll_id,
            station,
            line,
            all_stations: fetched.response.all_stations,
            created_at: fetched.response.created_at(),
            payload: fetched.raw,
            requested_at: fetched.received_at,
        };

        let (stored, arriving): (Vec<&TrainRecord>, Vec<&TrainRecord>) = fetched
            .response
            .records()
            .iter()
            .partition(|r| r.is_final());

        let request_id = self.store.save_request(&request, &stored).await?;
        debug!(
            request_id = request_id.0,
            line = %line,
            station,
            records = stored.len(),
            arriving = arriving.len(),
            "Request stored"
        );

        summary.requests += 1;
        summary.records += stored.len();
        summary.arriving_skipped += arriving.len();
        Ok(())
    }

    async fn close(&self, poll_id: PollId, mut summary: CycleSummary) -> Result<CycleSummary> {
        let ended_at = Utc::now().max(summary.started_at);
        self.store.end_poll(poll_id, ended_at).await?;
        summary.ended_at = Some(ended_at);

        info!(
            poll_id = poll_id.0,
            requests = summary.requests,
            records = summary.records,
            arriving_skipped = summary.arriving_skipped,
            missing = summary.missing.len(),
            coverage_pct = summary.coverage_pct(),
            "Poll ended"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::mock::{ScriptedTransport, Step, board};
    use crate::fetch::{StationQuery, TransportError, TransportResponse};
    use crate::store::{MemoryStore, RequestId};
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::time::Duration;

    fn small_registry() -> Arc<Registry> {
        Arc::new(Registry::new(
            [
                (LineId::YongeUniversity, vec![5, 9]),
                (LineId::BloorDanforth, vec![40]),
            ],
            [9],
        ))
    }

    fn good_board() -> Step {
        Step::Body(board(&[
            ("YUS", "AtStation"),
            ("BD", "Delayed"),
            ("YUS", "Arriving"),
        ]))
    }

    fn orchestrator(
        transport: ScriptedTransport,
    ) -> (Arc<ScriptedTransport>, Orchestrator<ScriptedTransport, MemoryStore>) {
        let transport = Arc::new(transport);
        let orchestrator =
            Orchestrator::new(small_registry(), Arc::clone(&transport), MemoryStore::new());
        (transport, orchestrator)
    }

    /// Delegates to a [`MemoryStore`] but refuses requests for one station.
    struct FailingStore {
        inner: MemoryStore,
        fail_station: StationId,
    }

    #[async_trait]
    impl Store for FailingStore {
        async fn begin_poll(&self, started_at: DateTime<Utc>) -> Result<PollId> {
            self.inner.begin_poll(started_at).await
        }

        async fn end_poll(&self, poll: PollId, ended_at: DateTime<Utc>) -> Result<()> {
            self.inner.end_poll(poll, ended_at).await
        }

        async fn insert_request(&self, request: &NewRequest) -> Result<RequestId> {
            if request.station == self.fail_station {
                bail!("connection reset");
            }
            self.inner.insert_request(request).await
        }

        async fn insert_record(&self, request: RequestId, record: &TrainRecord) -> Result<()> {
            self.inner.insert_record(request, record).await
        }
    }

    /// Panics when asked for one pair and defers to a script otherwise.
    struct PanickingTransport {
        inner: ScriptedTransport,
        panic_on: (LineId, StationId),
    }

    #[async_trait]
    impl Transport for PanickingTransport {
        async fn fetch(
            &self,
            query: &StationQuery,
            timeout: Duration,
        ) -> Result<TransportResponse, TransportError> {
            if (query.line, query.station) == self.panic_on {
                panic!("board for station {} blew up", query.station);
            }
            self.inner.fetch(query, timeout).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_stores_every_station() {
        let (_transport, orchestrator) = orchestrator(ScriptedTransport::new(good_board()));

        let summary = orchestrator.run_poll_cycle().await.unwrap();
        assert_eq!(summary.stations, 3);
        assert_eq!(summary.requests, 3);
        assert_eq!(summary.records, 6);
        assert_eq!(summary.arriving_skipped, 3);
        assert!(summary.is_complete());

        let store = orchestrator.store();
        let polls = store.polls();
        assert_eq!(polls.len(), 1);
        let ended = polls[0].ended_at.unwrap();
        assert!(polls[0].started_at <= ended);

        let requests = store.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|(_, r)| r.poll_id == polls[0].id));
        let keys: Vec<_> = requests.iter().map(|(_, r)| (r.line, r.station)).collect();
        assert_eq!(
            keys,
            vec![
                (LineId::YongeUniversity, 5),
                (LineId::YongeUniversity, 9),
                (LineId::BloorDanforth, 40),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_arriving_records_never_reach_the_store() {
        let (_transport, orchestrator) = orchestrator(ScriptedTransport::new(good_board()));
        orchestrator.run_poll_cycle().await.unwrap();

        let records = orchestrator.store().records();
        assert!(!records.is_empty());
        assert!(records.iter().all(|(_, r)| r.train_message != "Arriving"));
        assert!(records.iter().any(|(_, r)| r.train_message == "Delayed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_station_is_skipped_and_poll_still_closed() {
        let transport = ScriptedTransport::new(good_board()).script(
            LineId::BloorDanforth,
            40,
            vec![Step::Status(500); 4],
        );
        let (transport, orchestrator) = orchestrator(transport);

        let summary = orchestrator.run_poll_cycle().await.unwrap();
        assert_eq!(summary.missing, vec![(LineId::BloorDanforth, 40)]);
        assert_eq!(summary.requests, 2);
        assert_eq!(transport.calls(LineId::BloorDanforth, 40).len(), 4);

        let store = orchestrator.store();
        assert!(store.requests().iter().all(|(_, r)| r.station != 40));
        assert!(store.polls()[0].ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interchange_with_only_other_line_is_missing() {
        let transport = ScriptedTransport::new(good_board()).script(
            LineId::YongeUniversity,
            9,
            vec![Step::Body(board(&[("BD", "AtStation")])); 4],
        );
        let (_transport, orchestrator) = orchestrator(transport);

        let summary = orchestrator.run_poll_cycle().await.unwrap();
        assert_eq!(summary.missing, vec![(LineId::YongeUniversity, 9)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_is_stored() {
        let transport = ScriptedTransport::new(good_board()).script(
            LineId::YongeUniversity,
            5,
            vec![
                Step::Timeout,
                Step::Status(502),
                Step::Body(serde_json::json!({"ntasData": []})),
                good_board(),
            ],
        );
        let (_transport, orchestrator) = orchestrator(transport);

        let summary = orchestrator.run_poll_cycle().await.unwrap();
        assert!(summary.is_complete());
        assert_eq!(summary.requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stations_are_fetched_concurrently() {
        let transport = ScriptedTransport::new(good_board())
            .script(LineId::YongeUniversity, 5, vec![Step::Status(500); 2])
            .script(LineId::YongeUniversity, 9, vec![Step::Status(500); 2])
            .script(LineId::BloorDanforth, 40, vec![Step::Status(500); 2]);
        let (_transport, orchestrator) = orchestrator(transport);

        let start = tokio::time::Instant::now();
        orchestrator.run_poll_cycle().await.unwrap();
        // Each station waits twice; concurrently that is 4s, serially 12s.
        assert!(start.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_serializes_fetches() {
        let transport = ScriptedTransport::new(good_board())
            .script(LineId::YongeUniversity, 5, vec![Step::Status(500); 2])
            .script(LineId::YongeUniversity, 9, vec![Step::Status(500); 2])
            .script(LineId::BloorDanforth, 40, vec![Step::Status(500); 2]);
        let transport = Arc::new(transport);
        let orchestrator = Orchestrator::new(small_registry(), transport, MemoryStore::new())
            .with_max_concurrency(Some(1));

        let start = tokio::time::Instant::now();
        let summary = orchestrator.run_poll_cycle().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert_eq!(summary.requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_aborts_cycle_and_leaves_poll_open() {
        let transport = Arc::new(ScriptedTransport::new(good_board()));
        let store = FailingStore {
            inner: MemoryStore::new(),
            fail_station: 9,
        };
        let orchestrator = Orchestrator::new(small_registry(), transport, store);

        let result = orchestrator.run_poll_cycle().await;
        assert!(result.is_err());

        let inner = &orchestrator.store().inner;
        assert_eq!(inner.polls().len(), 1);
        assert!(inner.polls()[0].ended_at.is_none());
        // Station 5 was stored before the failure; station 40 never was.
        let stations: Vec<_> = inner.requests().iter().map(|(_, r)| r.station).collect();
        assert_eq!(stations, vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_cycle_uses_sequential_policy() {
        let transport = ScriptedTransport::new(good_board()).script(
            LineId::YongeUniversity,
            5,
            vec![Step::Status(500); 4],
        );
        let (transport, orchestrator) = orchestrator(transport);

        let summary = orchestrator.run_poll_cycle_sequential().await.unwrap();
        assert_eq!(summary.missing, vec![(LineId::YongeUniversity, 5)]);
        assert_eq!(summary.requests, 2);
        assert_eq!(transport.calls(LineId::YongeUniversity, 5).len(), 3);

        let polls = orchestrator.store().polls();
        assert_eq!(polls.len(), 1);
        assert!(polls[0].ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_station_task_is_missing() {
        let transport = Arc::new(PanickingTransport {
            inner: ScriptedTransport::new(good_board()),
            panic_on: (LineId::YongeUniversity, 9),
        });
        let orchestrator = Orchestrator::new(small_registry(), transport, MemoryStore::new());

        let summary = orchestrator.run_poll_cycle().await.unwrap();
        assert_eq!(summary.missing, vec![(LineId::YongeUniversity, 9)]);
        assert_eq!(summary.requests, 2);

        let store = orchestrator.store();
        assert!(store.requests().iter().all(|(_, r)| r.station != 9));
        assert!(store.polls()[0].ended_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_registry_station_is_polled_once() {
        let registry = Arc::new(Registry::new(
            [(LineId::YongeUniversity, vec![5, 5, 9, 5])],
            [9],
        ));
        let transport = Arc::new(ScriptedTransport::new(good_board()));
        let orchestrator =
            Orchestrator::new(registry, Arc::clone(&transport), MemoryStore::new());

        let summary = orchestrator.run_poll_cycle().await.unwrap();
        assert_eq!(summary.stations, 2);
        assert_eq!(summary.requests, 2);
        assert!(summary.is_complete());
        assert_eq!(transport.calls(LineId::YongeUniversity, 5).len(), 1);

        let summary = orchestrator.run_poll_cycle_sequential().await.unwrap();
        assert!(summary.is_complete());
        let second_poll = orchestrator.store().polls()[1].id;
        let stored_for_5 = orchestrator
            .store()
            .requests()
            .iter()
            .filter(|(_, r)| r.poll_id == second_poll && r.station == 5)
            .count();
        assert_eq!(stored_for_5, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_still_opens_and_closes_poll() {
        let orchestrator = Orchestrator::new(
            Arc::new(Registry::new([], [])),
            Arc::new(ScriptedTransport::new(good_board())),
            MemoryStore::new(),
        );

        let summary = orchestrator.run_poll_cycle().await.unwrap();
        assert_eq!(summary.stations, 0);
        assert!(orchestrator.store().polls()[0].ended_at.is_some());
    }
}
