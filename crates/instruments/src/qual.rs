//! Qualitative-analysis service: peak finding on a `.D` data folder.

use std::time::Duration;

use lims_protocol::Peak;
use serde_json::{json, Value};

use crate::error::InstrumentError;
use crate::http;

pub trait PeakFinder: Send + Sync {
    /// Peaks above `relative_area_percent` (0..=100) of the total ion
    /// chromatogram of `data_dir`.
    fn find_peaks(
        &self,
        data_dir: &str,
        relative_area_percent: f64,
    ) -> Result<Vec<Peak>, InstrumentError>;
}

#[derive(Debug, Clone)]
pub struct QualClient {
    base_url: String,
    agent: ureq::Agent,
}

impl QualClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent: http::agent(timeout),
        }
    }
}

/// Request body: smoothed TIC over all MS levels and scan types.
fn find_peaks_request(data_dir: &str, relative_area_percent: f64) -> Value {
    json!({
        "dataDir": data_dir,
        "filter": {
            "msLevel": "All",
            "scanType": "All",
            "chromatogramType": "TotalIon",
            "smoothFunction": "Gaussian",
            "smoothGaussianWidth": 5,
            "smoothFunctionWidth": 15,
            "relativeAreaPercent": relative_area_percent / 100.0,
        }
    })
}

fn number(v: &Value, key: &str) -> f64 {
    match v.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Reduce the service's peak objects to the fields the UI plots.
pub(crate) fn simplify_peaks(endpoint: &str, body: &Value) -> Result<Vec<Peak>, InstrumentError> {
    let items = body.as_array().ok_or_else(|| InstrumentError::Decode {
        endpoint: endpoint.to_string(),
        message: "peak list is not an array".into(),
    })?;
    Ok(items
        .iter()
        .filter(|p| p.is_object())
        .map(|p| Peak {
            center_x: number(p, "centerX"),
            area: number(p, "area"),
            start_x: number(p, "startX"),
            end_x: number(p, "endX"),
            width: number(p, "width"),
            baseline_is_linear: p.get("baselineIsLinear").and_then(Value::as_bool),
        })
        .collect())
}

impl PeakFinder for QualClient {
    fn find_peaks(
        &self,
        data_dir: &str,
        relative_area_percent: f64,
    ) -> Result<Vec<Peak>, InstrumentError> {
        let endpoint = "qual/findPeaks";
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .agent
            .post(&url)
            .send_json(find_peaks_request(data_dir, relative_area_percent))
            .map_err(|e| http::transport(endpoint, e))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(InstrumentError::Status {
                endpoint: endpoint.to_string(),
                status,
            });
        }
        let body = http::json_body(endpoint, response)?;
        simplify_peaks(endpoint, &body)
    }
}
