use thiserror::Error;

use crate::depth::ElementType;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while crossing the runtime boundary
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Object of type {found} is not an array")]
    NotAnArray { found: &'static str },

    #[error("Argument data type {element_type} is not supported")]
    UnsupportedDataType { element_type: ElementType },

    #[error("Dimensionality of argument is too high: {rank} (maximum {max})")]
    DimensionalityTooHigh { rank: usize, max: usize },

    #[error("Matrix has {rank} dimensions, more than the 2 allowed")]
    TooManyDimensions { rank: usize },

    #[error("Calling {target} failed: {message}")]
    Invocation { target: String, message: String },

    #[error("Segmentation collaborator initialization failed: {0}")]
    Initialization(String),

    #[error("Runtime teardown refused: {outstanding} native holds still alive")]
    Teardown { outstanding: usize },

    #[error("Interpreter lock is not held by the current thread")]
    LockNotHeld,

    #[error("Invalid array: {0}")]
    InvalidArray(String),

    #[error("Invalid matrix: {0}")]
    InvalidMatrix(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image format error: {0}")]
    ImageError(#[from] image::ImageError),
}

impl BridgeError {
    /// Returns true if the caller may drop the current frame and carry on
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotAnArray { .. }
                | Self::UnsupportedDataType { .. }
                | Self::DimensionalityTooHigh { .. }
                | Self::TooManyDimensions { .. }
                | Self::Invocation { .. }
                | Self::InvalidArray(_)
                | Self::InvalidMatrix(_)
        )
    }

    /// Returns true if the process cannot continue without the collaborator
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Initialization(_) | Self::Settings(_))
    }

    /// Returns true for the errors produced by array to matrix conversion
    pub const fn is_conversion_error(&self) -> bool {
        matches!(
            self,
            Self::NotAnArray { .. }
                | Self::UnsupportedDataType { .. }
                | Self::DimensionalityTooHigh { .. }
                | Self::TooManyDimensions { .. }
        )
    }
}
