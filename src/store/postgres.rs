use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Row};
use tracing::{debug, info};

use super::{NewRequest, PollId, RequestId, Store};
use crate::ntas::TrainRecord;
use crate::registry::StationId;

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS polls (
        poll_id BIGSERIAL PRIMARY KEY,
        poll_start TIMESTAMPTZ NOT NULL,
        poll_end TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS requests (
        request_id BIGSERIAL PRIMARY KEY,
        poll_id BIGINT NOT NULL REFERENCES polls (poll_id),
        station_id INTEGER NOT NULL,
        line_id SMALLINT NOT NULL,
        all_stations BOOLEAN NOT NULL,
        create_date TIMESTAMP,
        request_date TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ntas_data (
        request_id BIGINT NOT NULL REFERENCES requests (request_id),
        id BIGINT NOT NULL,
        station_char TEXT NOT NULL,
        subway_line TEXT NOT NULL,
        system_message_type TEXT NOT NULL,
        time_int DOUBLE PRECISION NOT NULL,
        train_direction TEXT NOT NULL,
        train_id BIGINT NOT NULL,
        train_message TEXT NOT NULL
    )
    "#,
];

const INSERT_RECORD: &str = r#"
    INSERT INTO ntas_data (
        request_id, id, station_char, subway_line, system_message_type,
        time_int, train_direction, train_id, train_message
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
"#;

/// `station_id` is an `INTEGER` column; ids past `i32::MAX` are refused.
fn station_column(station: StationId) -> Result<i32> {
    i32::try_from(station)
        .with_context(|| format!("station id {station} does not fit the station_id column"))
}

/// Postgres-backed store.
///
/// The orchestrator writes serially, so a single connection is enough.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    /// Creates the `polls`, `requests` and `ntas_data` tables if absent.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to create schema")?;
        }
        info!("Database schema ready");
        Ok(())
    }

    async fn insert_request_on(conn: &mut PgConnection, request: &NewRequest) -> Result<RequestId> {
        let station = station_column(request.station)?;
        let row = sqlx::query(
            r#"
            INSERT INTO requests (
                poll_id, station_id, line_id, all_stations, create_date, request_date, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING request_id
            "#,
        )
        .bind(request.poll_id.0)
        .bind(station)
        .bind(i16::from(request.line.number()))
        .bind(request.all_stations)
        .bind(request.created_at)
        .bind(request.requested_at)
        .bind(&request.payload)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| {
            format!(
                "failed to insert request for line {} station {}",
                request.line, request.station
            )
        })?;

        let request_id = RequestId(row.get("request_id"));
        debug!(request_id = request_id.0, poll_id = request.poll_id.0, "Request stored");
        Ok(request_id)
    }

    async fn insert_record_on(
        conn: &mut PgConnection,
        request: RequestId,
        record: &TrainRecord,
    ) -> Result<()> {
        sqlx::query(INSERT_RECORD)
            .bind(request.0)
            .bind(record.id)
            .bind(&record.station_id)
            .bind(&record.subway_line)
            .bind(&record.system_message_type)
            .bind(record.time_int)
            .bind(&record.train_direction)
            .bind(record.train_id)
            .bind(&record.train_message)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("failed to insert record {} for request {request}", record.id))?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin_poll(&self, started_at: DateTime<Utc>) -> Result<PollId> {
        let row = sqlx::query("INSERT INTO polls (poll_start) VALUES ($1) RETURNING poll_id")
            .bind(started_at)
            .fetch_one(&self.pool)
            .await
            .context("failed to open poll")?;
        let poll_id = PollId(row.get("poll_id"));
        debug!(poll_id = poll_id.0, started_at = %started_at, "Poll started");
        Ok(poll_id)
    }

    async fn end_poll(&self, poll: PollId, ended_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE polls SET poll_end = $1 WHERE poll_id = $2")
            .bind(ended_at)
            .bind(poll.0)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to close poll {poll}"))?;
        debug!(poll_id = poll.0, ended_at = %ended_at, "Poll ended");
        Ok(())
    }

    async fn insert_request(&self, request: &NewRequest) -> Result<RequestId> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_request_on(&mut conn, request).await
    }

    async fn insert_record(&self, request: RequestId, record: &TrainRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_record_on(&mut conn, request, record).await
    }

    async fn save_request(
        &self,
        request: &NewRequest,
        records: &[&TrainRecord],
    ) -> Result<RequestId> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        let request_id = Self::insert_request_on(&mut tx, request).await?;
        for record in records {
            Self::insert_record_on(&mut tx, request_id, record).await?;
        }

        tx.commit().await.context("failed to commit request")?;
        Ok(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_station_column_accepts_registry_ids() {
        assert_eq!(station_column(68).unwrap(), 68);
        assert_eq!(station_column(i32::MAX as StationId).unwrap(), i32::MAX);
    }

    #[test]
    fn test_station_column_rejects_oversized_ids() {
        let err = station_column(i32::MAX as StationId + 1).unwrap_err();
        assert!(err.to_string().contains("does not fit"));
    }
}
