//! Error types for the video action fine-tuning workspace.

use thiserror::Error;

/// Main error type shared by the library crates.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame decoding or image processing error
    #[error("Image processing error: {0}")]
    Image(String),

    /// Configuration error (bad flag, unknown dataset or architecture, bad override)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset error
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Model construction or forward error
    #[error("Model error: {0}")]
    Model(String),

    /// Checkpoint read/write error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Collective communication error
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Image(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(err: safetensors::SafeTensorError) -> Self {
        Error::Checkpoint(err.to_string())
    }
}

/// Specialized Result type for fine-tuning operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("unknown dataset 'ssv2'".to_string());
        assert_eq!(err.to_string(), "Configuration error: unknown dataset 'ssv2'");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_yaml_error_is_config_error() {
        let parse: std::result::Result<serde_yaml::Value, _> = serde_yaml::from_str("a: [1, 2");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Config(_)));
    }
}
