use lims_protocol::FrameError;

/// Failures surfaced by the hardware drivers.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device handle is not open / the socket is not connected.
    #[error("{device} is not connected")]
    NotConnected { device: &'static str },

    /// Opening the port or socket failed.
    #[error("failed to open {device}: {reason}")]
    Open { device: &'static str, reason: String },

    /// No reply within the bounded number of polls.
    #[error("{device} did not answer {operation}")]
    Timeout {
        device: &'static str,
        operation: String,
    },

    /// A reply arrived but failed header / checksum / JSON validation.
    #[error("invalid reply to {operation}: {source}")]
    Frame {
        operation: String,
        #[source]
        source: FrameError,
    },

    /// The device answered but reported a failure.
    #[error("{operation} rejected: {detail}")]
    Rejected { operation: String, detail: String },

    #[error("program {0} not found on the arm controller")]
    ProgramMissing(String),

    /// The arm kept failing after the allowed number of operator recovery cycles.
    #[error("program {program} still failing after {cycles} recovery cycles")]
    RecoveryExhausted { program: String, cycles: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{device} I/O error: {source}")]
    Io {
        device: &'static str,
        #[source]
        source: std::io::Error,
    },
}
