use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("could not connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    /// The relay connection failed after it was established.
    #[error("relay connection lost: {0}")]
    Connection(#[from] tungstenite::Error),
}
