//! Worker commands decoded once at the relay boundary.
//!
//! Three inbound shapes are accepted and all decode into [`WorkerCommand`]:
//!
//! 1. structured: `{"kind": "start_analysis", "version": 1, "bottle": 7, "sequence": 3}`
//! 2. legacy room frames: `{"message": "start_analysis_7_3", "sender": "web_..."}`
//! 3. hub frames: `{"command": "gtcl_all", "payload": {...}}`, or a bare
//!    JSON string carrying a legacy command name.
//!
//! Legacy names keep their positional suffixes (`start_analysis_<bottle>[_<seq>]`,
//! `get_result_<bottle>_<seq>[_<archive>]`, ...). Anything that cannot be
//! decoded yields a [`CommandError`], never a panic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::WORKER_SENDER;

/// Structured commands carry this version; frames without one are treated as v1.
pub const COMMAND_VERSION: u64 = 1;

const DEFAULT_PEAK_PERCENT: f64 = 1.0;

fn default_peak_percent() -> f64 {
    DEFAULT_PEAK_PERCENT
}

/// Parameters of one dispensing-station batch (`gtcl_all`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Target mass in mg per hopper, indexed by hopper position - 1.
    pub solids_list: Vec<f64>,
    /// Volume in mL per beaker, indexed by beaker position - 1.
    pub liquids_list: Vec<f64>,
    pub bottle_15ml_pos: u32,
    /// Tip availability flags (1 available, 0 used).
    pub start_tip_pos: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerCommand {
    GetStatus,
    GetArmStatus,
    GetInstrumentInfo,
    GetSequenceList,
    MoveTower,
    StartAnalysis {
        bottle: u32,
        #[serde(default)]
        sequence: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    GetResult {
        #[serde(default)]
        bottle: Option<u32>,
        #[serde(default)]
        sequence: Option<u32>,
        #[serde(default)]
        archive_id: Option<String>,
    },
    GetMassSpectrum {
        sequence: u32,
        retention_time: f64,
        #[serde(default)]
        archive_id: Option<String>,
    },
    GetPeaks {
        sequence: u32,
        #[serde(default = "default_peak_percent")]
        relative_percent: f64,
        #[serde(default)]
        archive_id: Option<String>,
    },
    RunBatch {
        batch: BatchRequest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
    },
    ForceStop,
}

impl WorkerCommand {
    /// Wire name, used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::GetStatus => "get_status",
            WorkerCommand::GetArmStatus => "get_arm_status",
            WorkerCommand::GetInstrumentInfo => "get_instrument_info",
            WorkerCommand::GetSequenceList => "get_sequence_list",
            WorkerCommand::MoveTower => "move_tower",
            WorkerCommand::StartAnalysis { .. } => "start_analysis",
            WorkerCommand::GetResult { .. } => "get_result",
            WorkerCommand::GetMassSpectrum { .. } => "get_mass_spectrum",
            WorkerCommand::GetPeaks { .. } => "get_peaks",
            WorkerCommand::RunBatch { .. } => "run_batch",
            WorkerCommand::ForceStop => "force_stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("指令格式错误: {0}")]
    Format(String),

    #[error("未知指令: {0}")]
    Unknown(String),

    #[error("invalid payload for {command}: {reason}")]
    InvalidPayload { command: String, reason: String },

    #[error("unsupported command version {0}")]
    UnsupportedVersion(u64),

    #[error("无法解析消息: {0}")]
    Malformed(String),
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Command(WorkerCommand),
    /// Our own echo, or a relay acknowledgment; nothing to do.
    Ignored,
}

/// Decode a raw websocket text frame.
pub fn decode_frame(text: &str) -> Result<Inbound, CommandError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CommandError::Malformed(e.to_string()))?;
    decode_value(&value)
}

/// Decode an already-parsed frame.
pub fn decode_value(value: &Value) -> Result<Inbound, CommandError> {
    match value {
        Value::String(name) => parse_legacy(name).map(Inbound::Command),
        Value::Object(map) => {
            if map.get("sender").and_then(Value::as_str) == Some(WORKER_SENDER) {
                return Ok(Inbound::Ignored);
            }
            let addressed = map.contains_key("kind") || map.contains_key("command");
            if !addressed && map.contains_key("status") {
                return Ok(Inbound::Ignored);
            }
            if map.contains_key("kind") {
                return decode_structured(value).map(Inbound::Command);
            }
            if let Some(command) = map.get("command").and_then(Value::as_str) {
                return decode_hub(command, map.get("payload")).map(Inbound::Command);
            }
            match map.get("message") {
                // Room frames carry the member's raw text, which may itself be JSON.
                Some(Value::String(text)) if text.trim_start().starts_with('{') => decode_frame(text),
                Some(inner @ (Value::String(_) | Value::Object(_))) => decode_value(inner),
                _ => Err(CommandError::Malformed(value.to_string())),
            }
        }
        other => Err(CommandError::Malformed(other.to_string())),
    }
}

fn decode_structured(value: &Value) -> Result<WorkerCommand, CommandError> {
    let version = value
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(COMMAND_VERSION);
    if version != COMMAND_VERSION {
        return Err(CommandError::UnsupportedVersion(version));
    }
    let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
    serde_json::from_value(value.clone()).map_err(|e| {
        if e.to_string().contains("unknown variant") {
            CommandError::Unknown(kind.to_string())
        } else {
            CommandError::InvalidPayload {
                command: kind.to_string(),
                reason: e.to_string(),
            }
        }
    })
}

fn decode_hub(command: &str, payload: Option<&Value>) -> Result<WorkerCommand, CommandError> {
    match command {
        "gtcl_all" | "run_batch" => {
            let payload = payload.ok_or_else(|| CommandError::InvalidPayload {
                command: command.to_string(),
                reason: "missing payload".to_string(),
            })?;
            let batch: BatchRequest =
                serde_json::from_value(payload.clone()).map_err(|e| CommandError::InvalidPayload {
                    command: command.to_string(),
                    reason: e.to_string(),
                })?;
            let task_id = payload
                .get("task_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(WorkerCommand::RunBatch { batch, task_id })
        }
        other => parse_legacy(other),
    }
}

// ──────────────────────────────────────────────
// Legacy command strings
// ──────────────────────────────────────────────

/// Parse a legacy command name such as `get_peaks_3_5_20250101_120000_seq3`.
pub fn parse_legacy(command: &str) -> Result<WorkerCommand, CommandError> {
    let command = command.trim();
    match command {
        "get_status" => return Ok(WorkerCommand::GetStatus),
        "get_arm_status" => return Ok(WorkerCommand::GetArmStatus),
        "get_instrument_info" => return Ok(WorkerCommand::GetInstrumentInfo),
        "get_sequence_list" => return Ok(WorkerCommand::GetSequenceList),
        "move_tower" => return Ok(WorkerCommand::MoveTower),
        "force_stop" => return Ok(WorkerCommand::ForceStop),
        _ => {}
    }

    let format_error = || CommandError::Format(command.to_string());

    if let Some(rest) = command.strip_prefix("start_analysis_") {
        let parts: Vec<&str> = rest.split('_').collect();
        let (bottle, sequence) = match parts.as_slice() {
            [bottle] => (parse_u32(bottle), None),
            [bottle, sequence] => (parse_u32(bottle), Some(parse_u32(sequence).ok_or_else(format_error)?)),
            _ => return Err(format_error()),
        };
        return Ok(WorkerCommand::StartAnalysis {
            bottle: bottle.ok_or_else(format_error)?,
            sequence,
            task_id: None,
        });
    }

    if let Some(rest) = command.strip_prefix("get_result_") {
        let parts: Vec<&str> = rest.split('_').collect();
        return match parts.as_slice() {
            [] | [""] => Err(format_error()),
            [b, s, tail @ ..] if is_digits(b) && is_digits(s) => Ok(WorkerCommand::GetResult {
                bottle: parse_u32(b),
                sequence: parse_u32(s),
                archive_id: join_archive(tail),
            }),
            [s, tail @ ..] if is_digits(s) => Ok(WorkerCommand::GetResult {
                bottle: None,
                sequence: parse_u32(s),
                archive_id: join_archive(tail),
            }),
            // A non-numeric suffix is a bare archive id.
            _ => Ok(WorkerCommand::GetResult {
                bottle: None,
                sequence: None,
                archive_id: Some(rest.to_string()),
            }),
        };
    }

    if let Some(rest) = command.strip_prefix("get_mass_spectrum_") {
        let parts: Vec<&str> = rest.split('_').collect();
        let [sequence, rt, tail @ ..] = parts.as_slice() else {
            return Err(format_error());
        };
        let retention_time = rt
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(format_error)?;
        return Ok(WorkerCommand::GetMassSpectrum {
            sequence: parse_u32(sequence).ok_or_else(format_error)?,
            retention_time,
            archive_id: join_archive(tail),
        });
    }

    if let Some(rest) = command.strip_prefix("get_peaks_") {
        let parts: Vec<&str> = rest.split('_').collect();
        let [sequence, tail @ ..] = parts.as_slice() else {
            return Err(format_error());
        };
        let sequence = parse_u32(sequence).ok_or_else(format_error)?;
        // The token after the sequence is a percentage only when it is a
        // number within 0..=100; otherwise it starts the archive id.
        let (relative_percent, archive_tail) = match tail.split_first() {
            Some((token, after)) => match token.parse::<f64>() {
                Ok(v) if (0.0..=100.0).contains(&v) => (v, after),
                _ => (DEFAULT_PEAK_PERCENT, tail),
            },
            None => (DEFAULT_PEAK_PERCENT, tail),
        };
        return Ok(WorkerCommand::GetPeaks {
            sequence,
            relative_percent,
            archive_id: join_archive(archive_tail),
        });
    }

    Err(CommandError::Unknown(command.to_string()))
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_u32(s: &str) -> Option<u32> {
    if is_digits(s) {
        s.parse().ok()
    } else {
        None
    }
}

fn join_archive(parts: &[&str]) -> Option<String> {
    let joined = parts.join("_");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}
