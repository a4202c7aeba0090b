//! Station-level transport over the NTAS HTTP endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use super::client::HttpClient;
use super::error::TransportError;
use super::fetch_json;
use crate::registry::{LineId, StationId};

/// Production NTAS endpoint.
pub const DEFAULT_BASE_URL: &str = "http://www.ttc.ca/Subway/loadNtas.action";

/// The (line, station) a single fetch asks about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationQuery {
    pub line: LineId,
    pub station: StationId,
}

impl StationQuery {
    pub fn new(line: LineId, station: StationId) -> Self {
        Self { line, station }
    }

    /// Query parameters as the endpoint expects them.
    pub fn params(&self) -> [(&'static str, String); 3] {
        [
            ("subwayLine", self.line.number().to_string()),
            ("stationId", self.station.to_string()),
            ("searchCriteria", String::new()),
        ]
    }
}

/// A JSON body plus the wall-clock time it was received.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub received_at: DateTime<Utc>,
    pub body: Value,
}

/// Fetches the raw board for one station.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        query: &StationQuery,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] that issues GET requests through an [`HttpClient`].
pub struct HttpTransport<C> {
    client: C,
    base_url: reqwest::Url,
}

impl<C: HttpClient> HttpTransport<C> {
    pub fn new(client: C, base_url: &str) -> Result<Self, TransportError> {
        let base_url = base_url
            .parse()
            .map_err(|_| TransportError::InvalidUrl(base_url.to_string()))?;
        Ok(Self { client, base_url })
    }

    pub fn url_for(&self, query: &StationQuery) -> reqwest::Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut().extend_pairs(query.params());
        url
    }
}

#[async_trait]
impl<C: HttpClient> Transport for HttpTransport<C> {
    async fn fetch(
        &self,
        query: &StationQuery,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let (received_at, body) = fetch_json(&self.client, self.url_for(query), timeout).await?;
        Ok(TransportResponse { received_at, body })
    }
}
