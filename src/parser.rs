//! JSON parser for NTAS responses.

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;

use crate::ntas::NtasResponse;

/// Decodes an [`NtasResponse`] from a JSON body already received by the transport.
///
/// # Errors
///
/// Returns an error if the body does not have the shape of an NTAS response.
pub fn parse_response(body: &Value) -> Result<NtasResponse> {
    Ok(NtasResponse::deserialize(body)?)
}
