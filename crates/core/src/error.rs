/// Result alias that carries the custom [`BeatEmitterError`] type.
pub type Result<T> = std::result::Result<T, BeatEmitterError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatEmitterError {
    /// A tempo, measure length or other setting was rejected. The call that
    /// tried to apply it leaves the previous state untouched.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The external signal source could not be opened or read.
    #[error("signal acquisition failed: {0}")]
    AcquisitionFailure(String),
    /// A listener failed while an event was being dispatched. Only ever
    /// logged by the event bus; it never reaches the emitter's caller.
    #[error("listener for `{event}` failed: {reason}")]
    ListenerFailure { event: String, reason: String },
    /// Internal faults such as a poisoned lock.
    #[error("{0}")]
    Message(String),
    /// Malformed JSON configuration.
    #[error("{0}")]
    Config(#[from] serde_json::Error),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl BeatEmitterError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn invalid<T: Into<String>>(reason: T) -> Self {
        Self::InvalidConfiguration(reason.into())
    }

    pub fn acquisition<T: Into<String>>(reason: T) -> Self {
        Self::AcquisitionFailure(reason.into())
    }

    /// Returns `true` for [`BeatEmitterError::InvalidConfiguration`].
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_))
    }
}

impl From<&str> for BeatEmitterError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BeatEmitterError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
