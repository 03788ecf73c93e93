//! lims-protocol: wire-level types shared by every LIMS station component.
//!
//! - [`crc`] computes and verifies the Modbus CRC16 that frames every
//!   serial command to the balance / powder dispenser.
//! - [`frame`] builds and validates those serial frames.
//! - [`envelope`] describes the JSON envelopes exchanged with the relay hub.
//! - [`command`] decodes inbound worker commands into a tagged enum,
//!   accepting both the structured form and the legacy command strings.
//! - [`event`] describes the progress / result events workers emit.
//! - [`model`] holds the small value types (dispense requests, run state,
//!   client identities) used across crates.

pub mod command;
pub mod crc;
pub mod envelope;
pub mod event;
pub mod frame;
pub mod model;

pub use command::{decode_frame, decode_value, BatchRequest, CommandError, Inbound, WorkerCommand};
pub use crc::{append_checksum, crc16, verify};
pub use envelope::{RelayEnvelope, WorkerMessage};
pub use event::{archive_stamp, local_timestamp, Stage, WorkerEvent};
pub use frame::FrameError;
pub use model::*;
