//! GC-MS control service client.
//!
//! The service answers in plain text (often a JSON string literal such as
//! `"NotRun"`), takes form-encoded POSTs for commands and one JSON POST for
//! submitting a whole sequence.

use std::time::Duration;

use serde_json::Value;

use crate::error::InstrumentError;
use crate::http;

/// What the GC-MS station procedure needs from the instrument.
pub trait GcmsControl: Send {
    fn status(&self) -> Result<String, InstrumentError>;
    fn run_status(&self) -> Result<String, InstrumentError>;
    fn run_mode(&self) -> Result<String, InstrumentError>;
    fn model(&self) -> Result<String, InstrumentError>;
    fn laboratory(&self) -> Result<String, InstrumentError>;
    fn move_tower(&self, position: u32, bottle: u32) -> Result<String, InstrumentError>;
    fn start_acquisition_file(
        &self,
        sequence_path: &str,
        start_index: u32,
        rename_existing: bool,
    ) -> Result<String, InstrumentError>;

    /// Reachability probe: a status read succeeds.
    fn is_reachable(&self) -> bool {
        self.status().is_ok()
    }
}

/// `true` once the instrument reports it is no longer acquiring.
pub fn is_not_run(run_mode: &str) -> bool {
    run_mode.trim().trim_matches('"').eq_ignore_ascii_case("NotRun")
}

#[derive(Debug, Clone)]
pub struct GcmsClient {
    base_url: String,
    agent: ureq::Agent,
}

impl GcmsClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            agent: http::agent(timeout),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> Result<String, InstrumentError> {
        let response = self
            .agent
            .get(&self.url(path))
            .call()
            .map_err(|e| http::transport(path, e))?;
        http::text_body(path, response)
    }

    fn get_query(&self, path: &str, query: &[(&str, &str)]) -> Result<String, InstrumentError> {
        let mut request = self.agent.get(&self.url(path));
        for (key, value) in query {
            request = request.query(*key, *value);
        }
        let response = request.call().map_err(|e| http::transport(path, e))?;
        http::text_body(path, response)
    }

    fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<String, InstrumentError> {
        tracing::debug!(endpoint = path, "gcms command");
        let response = self
            .agent
            .post(&self.url(path))
            .send_form(form.iter().map(|(k, v)| (*k, v.as_str())))
            .map_err(|e| http::transport(path, e))?;
        http::text_body(path, response)
    }

    pub fn sequence_info(&self, sequence_path: &str) -> Result<String, InstrumentError> {
        self.get_query(
            "Instrument/Sequence",
            &[
                ("ValidDataAcquisition", "False"),
                ("Absolute", "False"),
                ("SequencePath", sequence_path),
            ],
        )
    }

    pub fn sequence_result_info(&self, sequence_path: &str) -> Result<String, InstrumentError> {
        self.get_query(
            "Instrument/SequenceResult",
            &[("SequencePath", sequence_path)],
        )
    }

    /// Submit a complete sequence document and start it.
    pub fn submit_and_run(&self, sequence: &Value) -> Result<String, InstrumentError> {
        let path = "Instrument/StartDataAcquisition";
        let response = self
            .agent
            .post(&self.url(path))
            .send_json(sequence)
            .map_err(|e| http::transport(path, e))?;
        http::text_body(path, response)
    }

    pub fn is_paused(&self) -> Result<bool, InstrumentError> {
        let raw = self.get("Instrument/Paused")?;
        Ok(raw.trim().trim_matches('"').eq_ignore_ascii_case("true"))
    }

    pub fn pause(&self) -> Result<String, InstrumentError> {
        self.post_form("Instrument/PauseDataAcquisition", &[])
    }

    pub fn resume(&self) -> Result<String, InstrumentError> {
        self.post_form("Instrument/ContinueDataAcquisition", &[])
    }

    pub fn park_tray(&self, park: u32, block: bool) -> Result<String, InstrumentError> {
        self.post_form(
            "Instrument/Tray/Park",
            &[("Park", park.to_string()), ("Block", block.to_string())],
        )
    }

    pub fn release_lock(&self) -> Result<String, InstrumentError> {
        self.post_form("Test/ReleaseLock", &[])
    }
}

impl GcmsControl for GcmsClient {
    fn status(&self) -> Result<String, InstrumentError> {
        self.get("Instrument/Status")
    }

    fn run_status(&self) -> Result<String, InstrumentError> {
        self.get("Instrument/RunStatus")
    }

    fn run_mode(&self) -> Result<String, InstrumentError> {
        self.get("Instrument/RunMode")
    }

    fn model(&self) -> Result<String, InstrumentError> {
        self.get("Instrument/model")
    }

    fn laboratory(&self) -> Result<String, InstrumentError> {
        self.get("Instrument/Laboratory")
    }

    fn move_tower(&self, position: u32, bottle: u32) -> Result<String, InstrumentError> {
        self.post_form(
            "Instrument/Tower/Pos",
            &[("Position", position.to_string()), ("Bottle", bottle.to_string())],
        )
    }

    fn start_acquisition_file(
        &self,
        sequence_path: &str,
        start_index: u32,
        rename_existing: bool,
    ) -> Result<String, InstrumentError> {
        // The service parses Python-style booleans.
        let rename = if rename_existing { "True" } else { "False" };
        self.post_form(
            "Instrument/StartDataAcquisition/File",
            &[
                ("SequencePath", sequence_path.to_string()),
                ("StartIndex", start_index.to_string()),
                ("RenameExistingData", rename.to_string()),
            ],
        )
    }
}
