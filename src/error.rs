use thiserror::Error;

/// Application level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum SirenError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Referenced alarm id is not registered with the manager
    #[error("Alarm not found: {0}")]
    NotFound(String),

    /// A state value that is not usable for the requested operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested state change is not legal from the current state
    #[error("Invalid transition for alarm '{id}': {reason}")]
    InvalidTransition {
        /// Alarm the transition was attempted on
        id: String,
        /// Why the transition was refused
        reason: String,
    },
}

/// Convenient alias over [`Result`] using [`SirenError`]
pub type Result<T> = std::result::Result<T, SirenError>;

impl SirenError {
    pub(crate) fn invalid_transition(id: impl Into<String>, reason: impl Into<String>) -> Self {
        SirenError::InvalidTransition {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
