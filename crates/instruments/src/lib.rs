//! lims-instruments: the instrument side of a LIMS station.
//!
//! - [`GcmsClient`]: GC-MS control service (plain-text REST).
//! - [`HplcClient`]: HPLC events API with the `statusCode` envelope and
//!   bearer-token login.
//! - [`QualClient`]: qualitative-analysis peak finding.
//! - [`share`]: before/after listing of the instrument's result share.
//! - [`mzml`]: `msconvert` wrapper and retention-time spectrum lookup.
//!
//! All clients are blocking; callers run them on worker threads. The
//! [`GcmsControl`], [`HplcControl`] and [`PeakFinder`] traits are the seams
//! the station orchestrators are written against.

mod error;
pub mod gcms;
pub mod hplc;
mod http;
pub mod mzml;
pub mod qual;
pub mod share;

pub use error::InstrumentError;
pub use gcms::{is_not_run, GcmsClient, GcmsControl};
pub use hplc::{HplcClient, HplcControl, HplcCredentials};
pub use mzml::{MsConverter, MzmlCache, Spectrum, SpectrumIndex, SpectrumMatch};
pub use qual::{PeakFinder, QualClient};
pub use share::ShareWatcher;
