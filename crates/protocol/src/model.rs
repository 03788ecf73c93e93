//! Value types shared by drivers, orchestrators and the relay.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// Client identity
// ──────────────────────────────────────────────

/// Prefix that marks a web observer identity.
pub const WEB_PREFIX: &str = "web_";
/// Prefix used by dispensing station device clients.
pub const STATION_PREFIX: &str = "gypl_station_";
/// Shared group every web observer joins.
pub const OBSERVER_GROUP: &str = "station_observers";

/// Identity of one relay connection, fixed for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Identity from the connect route, or a generated web identity when
    /// the route carried none.
    pub fn from_route(requested: Option<&str>) -> Self {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => Self(id.to_string()),
            None => Self::generate_web(),
        }
    }

    pub fn generate_web() -> Self {
        let suffix: u64 = rand::thread_rng().gen();
        Self(format!("{WEB_PREFIX}{suffix:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Web observers join the shared observer group; device clients do not.
    pub fn is_observer(&self) -> bool {
        self.0.starts_with(WEB_PREFIX)
    }

    /// Name of the single-member group used for targeted delivery.
    pub fn private_group(&self) -> String {
        format!("client_{}", self.0)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ──────────────────────────────────────────────
// Dispensing
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispenseMode {
    #[default]
    Standard,
    Precision,
}

impl DispenseMode {
    pub fn register_value(self) -> u16 {
        match self {
            DispenseMode::Standard => 0x0000,
            DispenseMode::Precision => 0x0001,
        }
    }
}

/// Bottle heights the dispenser head can be positioned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BottleHeight {
    #[serde(rename = "5ml")]
    Ml5,
    #[serde(rename = "15ml")]
    Ml15,
    #[serde(rename = "20ml")]
    Ml20,
}

impl BottleHeight {
    pub fn register_value(self) -> u16 {
        match self {
            BottleHeight::Ml5 => 0x0005,
            BottleHeight::Ml15 => 0x000A,
            BottleHeight::Ml20 => 0x0020,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported bottle height '{0}', expected one of 5ml, 15ml, 20ml")]
pub struct UnsupportedBottleHeight(pub String);

impl FromStr for BottleHeight {
    type Err = UnsupportedBottleHeight;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "5ml" => Ok(BottleHeight::Ml5),
            "15ml" => Ok(BottleHeight::Ml15),
            "20ml" => Ok(BottleHeight::Ml20),
            _ => Err(UnsupportedBottleHeight(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispenseRequest {
    pub target_mass_mg: f64,
    pub mode: DispenseMode,
    pub bottle_height: BottleHeight,
}

/// Outcome of one dispense cycle. Deviation fields are always derived from
/// `target_mg` and `actual_mg`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispenseResult {
    pub success: bool,
    pub target_mg: f64,
    pub actual_mg: f64,
    pub deviation_mg: f64,
    pub deviation_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispenseResult {
    pub fn measured(target_mg: f64, actual_mg: f64) -> Self {
        Self {
            success: true,
            target_mg,
            actual_mg,
            deviation_mg: round3(actual_mg - target_mg),
            deviation_percent: deviation_percent(target_mg, actual_mg),
            error: None,
        }
    }

    pub fn failed(target_mg: f64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            target_mg,
            actual_mg: 0.0,
            deviation_mg: 0.0,
            deviation_percent: 0.0,
            error: Some(error.into()),
        }
    }
}

/// `(actual - target) / target * 100`, or `0` for a zero target.
pub fn deviation_percent(target_mg: f64, actual_mg: f64) -> f64 {
    if target_mg == 0.0 {
        return 0.0;
    }
    round3((actual_mg - target_mg) / target_mg * 100.0)
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

// ──────────────────────────────────────────────
// Device state
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Execution state of a jbi program on the arm controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JbiState {
    Stopped,
    Paused,
    EmergencyStop,
    Running,
    Error,
}

impl JbiState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JbiState::Stopped),
            1 => Some(JbiState::Paused),
            2 => Some(JbiState::EmergencyStop),
            3 => Some(JbiState::Running),
            4 => Some(JbiState::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotMode {
    Auto,
    Teach,
    Remote,
}

impl RobotMode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(RobotMode::Auto),
            1 => Some(RobotMode::Teach),
            2 => Some(RobotMode::Remote),
            _ => None,
        }
    }
}

/// Connectivity snapshot published by the dispensing station.
///
/// `busy` marks a snapshot taken while a batch held a device; the flags of a
/// held device are its last observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub arm: bool,
    pub balance: bool,
    pub powder_dispenser: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub busy: bool,
}

// ──────────────────────────────────────────────
// Analysis runs
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Complete,
    Error,
}

/// One accepted start-analysis request. `archive_id` is set only once the
/// result file has been copied into the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub bottle_num: u32,
    pub sequence_index: Option<u32>,
    pub status: RunStatus,
    pub archive_id: Option<String>,
}

impl AnalysisRun {
    pub fn queued(bottle_num: u32, sequence_index: Option<u32>) -> Self {
        Self {
            bottle_num,
            sequence_index,
            status: RunStatus::Queued,
            archive_id: None,
        }
    }
}

// ──────────────────────────────────────────────
// Result payloads
// ──────────────────────────────────────────────

/// An x/y series (chromatogram or mass spectrum).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.x.len().min(self.y.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep every n-th point so that roughly `target` points remain.
    /// Series at or under `threshold` points are returned unchanged.
    pub fn decimated(self, threshold: usize, target: usize) -> Self {
        let len = self.len();
        if len <= threshold || target == 0 {
            return self;
        }
        let step = len.div_ceil(target).max(1);
        Series {
            x: self.x.into_iter().step_by(step).collect(),
            y: self.y.into_iter().step_by(step).collect(),
        }
    }
}

/// One chromatographic peak as reported by the qualitative analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peak {
    pub center_x: f64,
    pub area: f64,
    pub start_x: f64,
    pub end_x: f64,
    pub width: f64,
    pub baseline_is_linear: Option<bool>,
}

/// One line of the sequence catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEntry {
    pub index: u32,
    pub name: String,
}
