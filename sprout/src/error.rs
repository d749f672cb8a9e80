//! Error handling for the sprout control system.

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure a capture or lighting request can report. None of these
/// terminate the hosting process, they are returned to whoever asked.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No controllable LED panel is registered, or it has been closed.
    #[error("No controllable lighting actuator is available")]
    ActuatorUnavailable,

    /// Another lease holds the actuator and the policy is fail fast.
    #[error("Lighting actuator is held by another lease")]
    ActuatorBusy,

    /// Writing intensities to the actuator failed.
    #[error("Lighting actuator I/O error: {0}")]
    ActuatorIo(String),

    /// A channel intensity outside [0, 100] was requested.
    #[error("Intensity {value} for channel {channel} is outside 0..=100")]
    InvalidIntensity {
        /// Channel name as used in light messages.
        channel: &'static str,
        /// Requested intensity.
        value: u8,
    },

    /// Pixel processing or image encoding failed.
    #[error("Processing error: {0}")]
    Processing(String),

    /// The capture needs lighting control but the kit has none.
    #[error("Incompatible configuration: {0}")]
    IncompatibleConfiguration(String),

    /// Capture command string is not recognised.
    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),

    /// The camera failed to produce a frame.
    #[error("Camera error: {0}")]
    Camera(String),

    /// The configured camera model is not supported.
    #[error("Unknown camera model: {0:?}")]
    UnknownCamera(String),

    /// A schedule entry could not be parsed.
    #[error("Invalid schedule entry: {0}")]
    InvalidSchedule(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The process is shutting down and the capture was abandoned.
    #[error("Capture cancelled by shutdown")]
    Cancelled,

    /// An offloaded blocking task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Task(String),
}

impl Error {
    /// True when the failure came from a hardware transport rather than
    /// from a bad request or configuration.
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            Error::ActuatorIo(_) | Error::Camera(_) | Error::Io(_) | Error::Task(_)
        )
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Task(e.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Processing(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Error::ActuatorIo("pwm".into()), true)]
    #[case(Error::Camera("timeout".into()), true)]
    #[case(Error::UnknownCommand("flash".into()), false)]
    #[case(Error::ActuatorBusy, false)]
    #[case(Error::Cancelled, false)]
    fn test_hardware_classification(#[case] error: Error, #[case] expected: bool) {
        assert_eq!(error.is_hardware(), expected);
    }

    #[test]
    fn test_unknown_command_message_quotes_input() {
        let message = Error::UnknownCommand("flash".into()).to_string();
        assert_eq!(message, "Unknown command: \"flash\"");
    }
}
