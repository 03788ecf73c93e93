//! lims-worker: the process that sits next to a station's hardware.
//!
//! A worker holds one relay connection ([`WorkerClient`]), decodes every
//! inbound frame into a [`WorkerCommand`](lims_protocol::WorkerCommand)
//! and hands it to the [`Dispatcher`]. Hardware and instrument calls run on
//! the blocking pool so the socket loop keeps answering status queries
//! while an analysis is in progress.

pub mod client;
pub mod dispatch;
mod error;
pub mod link;
pub mod station;

pub use client::{WorkerClient, WorkerConfig};
pub use dispatch::{Dispatcher, EventSender};
pub use error::WorkerError;
pub use link::{LinkMode, DEFAULT_REPLY_TARGET};
pub use station::{DispensingHandle, GcmsHandle, HplcHandle, StationHandle, StationKind};
