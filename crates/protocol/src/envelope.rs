//! JSON envelopes exchanged over the relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEVICE_STATUS_UPDATE: &str = "device_status_update";
pub const SEND_TO_CLIENT: &str = "send_to_client";

/// Sender tag carried by every message a station worker publishes.
pub const WORKER_SENDER: &str = "worker";

/// Inbound frame at the relay hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

impl RelayEnvelope {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            payload: None,
            target_client_id: None,
            message: None,
        }
    }

    pub fn device_status(payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(DEVICE_STATUS_UPDATE)
        }
    }

    pub fn send_to(target: impl Into<String>, message: Value) -> Self {
        Self {
            target_client_id: Some(target.into()),
            message: Some(message),
            ..Self::new(SEND_TO_CLIENT)
        }
    }
}

/// Rebroadcast delivered to observers for each `device_status_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusBroadcast {
    #[serde(rename = "type")]
    pub kind: String,
    pub station_id: String,
    pub status: Value,
}

impl DeviceStatusBroadcast {
    pub fn new(station_id: impl Into<String>, status: Value) -> Self {
        Self {
            kind: "device_status".to_string(),
            station_id: station_id.into(),
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
    Info,
}

/// Reply sent by the relay to the connection that issued a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAck {
    pub status: AckStatus,
    pub message: String,
    /// Connections the forwarded message reached (`send_to_client` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipients: Option<usize>,
}

impl RelayAck {
    pub fn forwarded(target: &str, recipients: usize) -> Self {
        Self {
            status: AckStatus::Success,
            message: format!("指令已成功转发给客户端 {target}"),
            recipients: Some(recipients),
        }
    }

    pub fn unknown_command(command: &str) -> Self {
        Self {
            status: AckStatus::Info,
            message: format!("收到未知指令: {command}"),
            recipients: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            message: message.into(),
            recipients: None,
        }
    }

    pub fn invalid_json() -> Self {
        Self::error("无效的JSON格式。")
    }
}

/// Default body forwarded when a `send_to_client` carries no message.
pub fn empty_forward_message() -> Value {
    Value::String("无消息内容".to_string())
}

/// Outbound wrapper used by workers: `{message, sender}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub message: Value,
    pub sender: String,
}

impl WorkerMessage {
    pub fn from_worker(message: Value) -> Self {
        Self {
            message,
            sender: WORKER_SENDER.to_string(),
        }
    }

    pub fn is_from_worker(&self) -> bool {
        self.sender == WORKER_SENDER
    }
}

/// Room broadcast: every member receives `{message: <raw text>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub message: String,
}
