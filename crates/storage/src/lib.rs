//! lims-storage: persistence seams of a LIMS station.
//!
//! - [`TaskStore`] is the only interface the orchestration core needs from
//!   the LIMS web application: fetch task parameters, submit task results.
//!   [`InMemoryTaskStore`] and [`HttpTaskStore`] implement it, and
//!   [`conformance`] checks any implementation against the shared contract.
//! - [`ResultArchive`] copies finished instrument result files into an
//!   append-only directory keyed by archive id.
//! - [`SequenceCatalog`] maps sequence numbers to instrument sequence files
//!   and data folders.

pub mod archive;
pub mod catalog;
pub mod conformance;
mod error;
pub mod http;
pub mod memory;
mod record;
mod traits;

pub use archive::{parse_series, ArchivedResult, ResultArchive};
pub use catalog::{SequenceCatalog, SequenceParams};
pub use error::StorageError;
pub use http::HttpTaskStore;
pub use memory::InMemoryTaskStore;
pub use record::{ArchiveMeta, TaskParameters, TaskResult, TaskStatus};
pub use traits::TaskStore;
