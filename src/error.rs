use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("unknown channel {0}")]
    UnknownChannel(i32),
    #[error("unknown port {0}")]
    UnknownPort(String),
    #[error("already registered: {0}")]
    AlreadyRegistered(String),
    #[error("driver not initialized")]
    NotInitialized,

    #[error("short write: wrote {written} of {requested} bytes")]
    TransportWriteShort { requested: usize, written: usize },
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("device rejected command (reply {reply:?})")]
    DeviceRejected { reply: String },

    #[error("definition error: {0}")]
    Definition(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MuxError {
    /// True for failures that leave the link in an unknown state and therefore
    /// trigger the disconnect/connect pulse.
    #[must_use]
    pub const fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::TransportWriteShort { .. } | Self::TransportFailure(_)
        )
    }
}
