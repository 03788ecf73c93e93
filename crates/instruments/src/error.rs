use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    /// The request never produced a usable HTTP response.
    #[error("{endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// Non-2xx status from a plain-text endpoint.
    #[error("{endpoint}: HTTP {status}")]
    Status { endpoint: String, status: u16 },

    /// The envelope reported `statusCode != 0`.
    #[error("{endpoint} failed with code {code}: {message}")]
    Api {
        endpoint: String,
        code: i64,
        message: String,
    },

    #[error("{endpoint}: unexpected response: {message}")]
    Decode { endpoint: String, message: String },

    /// An authenticated call was made before `login`.
    #[error("not logged in")]
    NotLoggedIn,

    #[error("mzML conversion failed: {0}")]
    Converter(String),

    #[error("mzML parse error: {0}")]
    Mzml(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InstrumentError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InstrumentError::Io {
            path: path.into(),
            source,
        }
    }
}
