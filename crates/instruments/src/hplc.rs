//! HPLC events API client.
//!
//! Every endpoint answers `{"statusCode": 0, "data": ..., "message": ...}`
//! on success. Any other `statusCode` is returned as
//! [`InstrumentError::Api`] and never retried here. `CheckInstrumentIdle`
//! is the one exception: a non-zero code there just means "busy".

use std::time::Duration;

use serde_json::Value;

use crate::error::InstrumentError;
use crate::http;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HplcCredentials {
    pub username: String,
    pub password: String,
}

/// Instrument calls used by the HPLC station procedure.
pub trait HplcControl: Send {
    fn login(&mut self, credentials: &HplcCredentials) -> Result<(), InstrumentError>;
    fn system_info(&self) -> Result<Value, InstrumentError>;
    fn instrument_info(&self, cds_id: u32) -> Result<Value, InstrumentError>;
    fn batch_set_samples(&self, lims_data: &Value) -> Result<(), InstrumentError>;
    fn samples_by_batch(&self, batch_id: &str) -> Result<Value, InstrumentError>;
    fn active_workplans(&self, is_active: u32, lab_name: &str) -> Result<Value, InstrumentError>;
    fn generate_workplan(
        &self,
        work_plan_no: &str,
        lab_name: &str,
        samples: &Value,
    ) -> Result<(), InstrumentError>;
    fn remove_workplan_item(&self, item_id: &str) -> Result<(), InstrumentError>;
    fn ready_to_place(&self, cds_id: u32, injector_id: &str) -> Result<Value, InstrumentError>;
    fn apply_place_position(
        &self,
        cds_id: u32,
        injector_id: &str,
        pos: &str,
    ) -> Result<Value, InstrumentError>;
    fn place_complete(
        &self,
        cds_id: u32,
        injector_id: &str,
        placed_vials: &Value,
    ) -> Result<(), InstrumentError>;
    fn start_analysis(&self, cds_id: u32, job: &Value) -> Result<(), InstrumentError>;
    fn check_idle(&self, cds_id: u32) -> Result<bool, InstrumentError>;
    fn ready_to_clear(&self, cds_id: u32, injector_id: &str) -> Result<Value, InstrumentError>;
    fn apply_clear_position(
        &self,
        cds_id: u32,
        injector_id: &str,
        pos: &str,
    ) -> Result<Value, InstrumentError>;
    fn clear_complete(
        &self,
        cds_id: u32,
        injector_id: &str,
        positions: &Value,
    ) -> Result<(), InstrumentError>;
}

/// Split an envelope into its `data`, or the API error it reports.
pub(crate) fn unwrap_envelope(endpoint: &str, body: Value) -> Result<Value, InstrumentError> {
    match body.get("statusCode").and_then(Value::as_i64) {
        Some(0) => Ok(body.get("data").cloned().unwrap_or(Value::Null)),
        Some(code) => {
            let message = ["errorMessage", "message", "errorCode"]
                .iter()
                .find_map(|k| body.get(*k).filter(|v| !v.is_null()))
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .unwrap_or_default();
            Err(InstrumentError::Api {
                endpoint: endpoint.to_string(),
                code,
                message,
            })
        }
        None => Err(InstrumentError::Decode {
            endpoint: endpoint.to_string(),
            message: format!("missing statusCode in {}", body),
        }),
    }
}

#[derive(Clone, Copy)]
enum Method {
    Get,
    Put,
    Post,
    Delete,
}

#[derive(Debug, Clone)]
pub struct HplcClient {
    base_url: String,
    agent: ureq::Agent,
    token: Option<String>,
}

impl HplcClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent: http::agent(timeout),
            token: None,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.token.is_some()
    }

    /// Perform a call and return the raw envelope.
    fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, InstrumentError> {
        let url = format!("{}/api/v1/{}", self.base_url, path);
        let token = self.token.as_deref();
        let auth = token.map(|t| format!("Bearer {}", t));

        let response = match method {
            Method::Get | Method::Delete => {
                let mut request = match method {
                    Method::Get => self.agent.get(&url),
                    _ => self.agent.delete(&url),
                };
                for (k, v) in query {
                    request = request.query(*k, v);
                }
                if let Some(ref auth) = auth {
                    request = request.header("Authorization", auth);
                }
                request.call()
            }
            Method::Put | Method::Post => {
                let mut request = match method {
                    Method::Put => self.agent.put(&url),
                    _ => self.agent.post(&url),
                };
                for (k, v) in query {
                    request = request.query(*k, v);
                }
                if let Some(ref auth) = auth {
                    request = request.header("Authorization", auth);
                }
                request = request.header("Accept", "application/json,text/json");
                match body {
                    Some(body) => request.send_json(body),
                    None => request.send_empty(),
                }
            }
        }
        .map_err(|e| http::transport(path, e))?;

        http::json_body(path, response)
    }

    fn authed(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, InstrumentError> {
        if self.token.is_none() {
            return Err(InstrumentError::NotLoggedIn);
        }
        let envelope = self.call(method, path, query, body)?;
        tracing::debug!(endpoint = path, "hplc call ok");
        unwrap_envelope(path, envelope)
    }
}

fn cds_injector(cds_id: u32, injector_id: &str) -> Vec<(&'static str, String)> {
    vec![("cdsId", cds_id.to_string()), ("injectorId", injector_id.to_string())]
}

impl HplcControl for HplcClient {
    fn login(&mut self, credentials: &HplcCredentials) -> Result<(), InstrumentError> {
        let path = "Authentication";
        let envelope = self.call(
            Method::Put,
            path,
            &[
                ("userName", credentials.username.clone()),
                ("userPassword", credentials.password.clone()),
            ],
            None,
        )?;
        let data = unwrap_envelope(path, envelope)?;
        let token = data
            .get("authenticationToken")
            .and_then(Value::as_str)
            .ok_or_else(|| InstrumentError::Decode {
                endpoint: path.to_string(),
                message: "no authenticationToken in login response".into(),
            })?;
        self.token = Some(token.to_string());
        tracing::info!(user = %credentials.username, "hplc login ok");
        Ok(())
    }

    fn system_info(&self) -> Result<Value, InstrumentError> {
        self.authed(Method::Get, "SystemInfo", &[], None)
    }

    fn instrument_info(&self, cds_id: u32) -> Result<Value, InstrumentError> {
        self.authed(
            Method::Get,
            "Instrument/auto/cdsid",
            &[("cdsId", cds_id.to_string())],
            None,
        )
    }

    fn batch_set_samples(&self, lims_data: &Value) -> Result<(), InstrumentError> {
        self.authed(Method::Post, "Sample/batch", &[], Some(lims_data))
            .map(drop)
    }

    fn samples_by_batch(&self, batch_id: &str) -> Result<Value, InstrumentError> {
        self.authed(
            Method::Get,
            "Sample/batchId",
            &[("batchId", batch_id.to_string())],
            None,
        )
    }

    fn active_workplans(&self, is_active: u32, lab_name: &str) -> Result<Value, InstrumentError> {
        self.authed(
            Method::Get,
            "Workplan/active",
            &[("isActive", is_active.to_string()), ("labName", lab_name.to_string())],
            None,
        )
    }

    fn generate_workplan(
        &self,
        work_plan_no: &str,
        lab_name: &str,
        samples: &Value,
    ) -> Result<(), InstrumentError> {
        self.authed(
            Method::Put,
            "Events/GenerateWorkplan",
            &[
                ("workPlanNo", work_plan_no.to_string()),
                ("labName", lab_name.to_string()),
            ],
            Some(samples),
        )
        .map(drop)
    }

    fn remove_workplan_item(&self, item_id: &str) -> Result<(), InstrumentError> {
        self.authed(Method::Delete, "Workplan", &[("id", item_id.to_string())], None)
            .map(drop)
    }

    fn ready_to_place(&self, cds_id: u32, injector_id: &str) -> Result<Value, InstrumentError> {
        self.authed(
            Method::Put,
            "Events/ReadyToPlaceVialToInstrument",
            &cds_injector(cds_id, injector_id),
            None,
        )
    }

    fn apply_place_position(
        &self,
        cds_id: u32,
        injector_id: &str,
        pos: &str,
    ) -> Result<Value, InstrumentError> {
        let mut query = cds_injector(cds_id, injector_id);
        query.push(("pos", pos.to_string()));
        self.authed(
            Method::Put,
            "Events/ApplyInstrumentPositionToPlaceVial",
            &query,
            None,
        )
    }

    fn place_complete(
        &self,
        cds_id: u32,
        injector_id: &str,
        placed_vials: &Value,
    ) -> Result<(), InstrumentError> {
        self.authed(
            Method::Put,
            "Events/PlaceVialsToInstrumentComplete",
            &cds_injector(cds_id, injector_id),
            Some(placed_vials),
        )
        .map(drop)
    }

    fn start_analysis(&self, cds_id: u32, job: &Value) -> Result<(), InstrumentError> {
        self.authed(
            Method::Put,
            "Events/StartAnalysis",
            &[("cdsId", cds_id.to_string())],
            Some(job),
        )
        .map(drop)
    }

    fn check_idle(&self, cds_id: u32) -> Result<bool, InstrumentError> {
        if self.token.is_none() {
            return Err(InstrumentError::NotLoggedIn);
        }
        let path = "Events/CheckInstrumentIdle";
        let envelope = self.call(Method::Put, path, &[("cdsId", cds_id.to_string())], None)?;
        match unwrap_envelope(path, envelope) {
            Ok(_) => Ok(true),
            Err(InstrumentError::Api { code, message, .. }) => {
                tracing::debug!(code, message = %message, "hplc not idle yet");
                Ok(false)
            }
            Err(other) => Err(other),
        }
    }

    fn ready_to_clear(&self, cds_id: u32, injector_id: &str) -> Result<Value, InstrumentError> {
        self.authed(
            Method::Put,
            "Events/ReadyToClearInstrument",
            &cds_injector(cds_id, injector_id),
            None,
        )
    }

    fn apply_clear_position(
        &self,
        cds_id: u32,
        injector_id: &str,
        pos: &str,
    ) -> Result<Value, InstrumentError> {
        let mut query = cds_injector(cds_id, injector_id);
        query.push(("pos", pos.to_string()));
        self.authed(
            Method::Put,
            "Events/ApplyClearInstrumentPosition",
            &query,
            None,
        )
    }

    fn clear_complete(
        &self,
        cds_id: u32,
        injector_id: &str,
        positions: &Value,
    ) -> Result<(), InstrumentError> {
        self.authed(
            Method::Put,
            "Events/ClearInstrumentVialsComplete",
            &cds_injector(cds_id, injector_id),
            Some(positions),
        )
        .map(drop)
    }
}
