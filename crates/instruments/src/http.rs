//! Shared `ureq` plumbing.

use std::time::Duration;

use serde_json::Value;

use crate::error::InstrumentError;

/// Agent with a global timeout. Status codes are left to the caller so
/// envelope bodies on 4xx/5xx can still be read.
pub(crate) fn agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into()
}

pub(crate) fn transport(endpoint: &str, err: ureq::Error) -> InstrumentError {
    InstrumentError::Transport {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    }
}

/// Read a plain-text body, treating non-2xx as an error.
pub(crate) fn text_body(
    endpoint: &str,
    response: ureq::http::Response<ureq::Body>,
) -> Result<String, InstrumentError> {
    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        return Err(InstrumentError::Status {
            endpoint: endpoint.to_string(),
            status,
        });
    }
    response
        .into_body()
        .read_to_string()
        .map_err(|e| transport(endpoint, e))
}

pub(crate) fn json_body(
    endpoint: &str,
    response: ureq::http::Response<ureq::Body>,
) -> Result<Value, InstrumentError> {
    let status = response.status().as_u16();
    response
        .into_body()
        .read_json::<Value>()
        .map_err(|e| InstrumentError::Decode {
            endpoint: endpoint.to_string(),
            message: format!("HTTP {} with non-JSON body: {}", status, e),
        })
}
