use std::path::PathBuf;

/// Result alias that carries the custom [`MotionAlarmError`] type.
pub type Result<T> = std::result::Result<T, MotionAlarmError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MotionAlarmError {
    /// Free-form error used where no dedicated variant exists.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Configuration file could not be parsed.
    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),
    /// Frame decoding or clip encoding failed.
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
    /// Configuration parsed but violates a controller invariant.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The clip storage directory is missing and could not be created.
    #[error("clips directory `{}` is unusable: {reason}", path.display())]
    ClipsDirectory { path: PathBuf, reason: String },
    /// The frame source could not be opened or never produced a frame.
    #[error("frame stream unavailable: {0}")]
    StreamUnavailable(String),
    /// A raster did not match the dimensions the consumer was built for.
    #[error("frame is {}x{}, expected {}x{}", actual.0, actual.1, expected.0, expected.1)]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

impl MotionAlarmError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }
}

impl From<&str> for MotionAlarmError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MotionAlarmError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
