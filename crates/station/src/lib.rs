//! lims-station: the procedures a LIMS station runs on its hardware.
//!
//! - [`DispensingStation`] doses powders and pipettes liquids into a tube
//!   on the balance, tracking tip consumption.
//! - [`GcmsStation`] and [`HplcStation`] carry one vial through a full
//!   instrument run and archive the result.
//! - [`ResultQueries`] answers result, peak and mass-spectrum requests
//!   from the archive.
//!
//! Everything here is blocking and runs on worker threads. Analysis runs
//! report each [`Stage`](lims_protocol::Stage) through a [`ProgressSink`]
//! and stop early when their [`CancelFlag`](lims_devices::CancelFlag) is
//! raised.

pub mod dispensing;
mod error;
pub mod gcms;
pub mod grid;
pub mod hplc;
pub mod results;
mod run;

pub use dispensing::{BatchHistory, BatchOutcome, DispensingSettings, DispensingStation, LiquidRecord, SolidRecord};
pub use error::StationError;
pub use gcms::{GcmsSettings, GcmsStation, GcmsTiming, InstrumentStatus};
pub use grid::{map_to_grid, Rack, TipInventory};
pub use hplc::{status_from_system_info, HplcSettings, HplcStation, HplcTiming};
pub use results::ResultQueries;
pub use run::{ProgressSink, RunContext};
