/// A `Result` alias where the `Err` case is `gantry_core::Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid ir for {key}: {source}")]
    InvalidIr {
        key: String,
        #[source]
        source: gantry_api::Error,
    },

    #[error("failed to compile {name}: {reason}")]
    Compile { name: String, reason: String },

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("failed to reconcile infra for {name}: {reason}")]
    Infra { name: String, reason: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport failed: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl Error {
    /// Returns `true` if this error should stop the runner that hit it.
    ///
    /// Only transport failures stop a runner. Everything else is scoped to a
    /// single IR, resource, or stream.
    pub(crate) fn is_fatal_to_runner(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Io { .. })
    }
}
