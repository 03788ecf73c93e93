//! How a worker's outbound messages are framed for the relay it talks to.

use lims_protocol::{DeviceStatus, RelayEnvelope, WorkerEvent, WorkerMessage};
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_REPLY_TARGET: &str = "web_client";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LinkMode {
    /// `/ws/relay/{client_id}`: events are forwarded to `reply_to` with
    /// `send_to_client`; device status goes out as `device_status_update`.
    Hub { reply_to: String },
    /// `/ws/room/{room}`: everything is broadcast to the room.
    #[default]
    Room,
}

fn text(value: &impl Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| Value::Null.to_string())
}

impl LinkMode {
    pub fn encode_event(&self, event: &WorkerEvent) -> String {
        let wrapped = WorkerMessage::from_worker(event.to_value());
        match self {
            LinkMode::Hub { reply_to } => {
                let message = serde_json::to_value(&wrapped).unwrap_or(Value::Null);
                text(&RelayEnvelope::send_to(reply_to.clone(), message))
            }
            LinkMode::Room => text(&wrapped),
        }
    }

    pub fn encode_device_status(&self, status: &DeviceStatus) -> String {
        let payload = serde_json::to_value(status).unwrap_or(Value::Null);
        match self {
            LinkMode::Hub { .. } => text(&RelayEnvelope::device_status(payload)),
            LinkMode::Room => {
                let event = WorkerEvent::DeviceStatus {
                    status: *status,
                    timestamp: lims_protocol::local_timestamp(),
                };
                text(&WorkerMessage::from_worker(event.to_value()))
            }
        }
    }
}
