mod basic;
mod client;
mod error;
pub mod mock;
mod transport;

pub use basic::BasicClient;
pub use client::HttpClient;
pub use error::TransportError;
pub use transport::{
    DEFAULT_BASE_URL, HttpTransport, StationQuery, Transport, TransportResponse,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

/// Sends a GET for `url` with a per-request timeout and returns the JSON body
/// together with the time the response headers arrived.
pub async fn fetch_json<C: HttpClient>(
    client: &C,
    url: reqwest::Url,
    timeout: Duration,
) -> Result<(DateTime<Utc>, Value), TransportError> {
    let mut req = reqwest::Request::new(reqwest::Method::GET, url);
    *req.timeout_mut() = Some(timeout);

    let resp = client.execute(req).await?;
    let received_at = Utc::now();

    let status = resp.status();
    if !status.is_success() {
        return Err(TransportError::Status(status.as_u16()));
    }

    let body = resp.json::<Value>().await?;
    Ok((received_at, body))
}
