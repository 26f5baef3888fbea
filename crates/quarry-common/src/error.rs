use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid version in {name:?}: {reason}")]
    Format { name: String, reason: String },

    #[error("execution error: {0}")]
    Execution(String),

    #[error("integrity check failed:\n{details}")]
    IntegrityViolation { details: String },

    #[error("foreign key check failed:\n{details}")]
    ForeignKeyViolation { details: String },

    #[error("invalid parameter: {0}")]
    Parameter(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the post-step consistency failures raised by the verifier.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            Error::IntegrityViolation { .. } | Error::ForeignKeyViolation { .. }
        )
    }
}
