//! Error handling for the BSP streaming pipeline
//!
//! Only programming and configuration errors surface as `BspError`. Runtime
//! degradation on the sample path (malformed fields, missing coefficients,
//! queue overflow) is recovered locally and never reaches the caller.

use core::fmt;

/// Result type alias for BSP operations
pub type BspResult<T> = Result<T, BspError>;

/// Error type for all BSP operations
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum BspError {
    /// Invalid pipeline or processor configuration
    ConfigurationError {
        /// Description of the configuration error
        message: String,
    },

    /// Sampling rate is zero, negative or not finite
    InvalidSamplingRate {
        /// Provided sampling rate
        rate: f64,
    },

    /// FFT size is not a power of two of at least 2
    InvalidFftSize {
        /// Requested transform size
        size: usize,
    },

    /// FFT input length differs from the engine's transform size
    FftSizeMismatch {
        /// Engine transform size
        expected: usize,
        /// Provided input length
        actual: usize,
    },

    /// Channel index outside the declared channel width
    ChannelOutOfRange {
        /// Requested channel index
        index: usize,
        /// Declared channel count
        channel_count: usize,
    },

    /// Input record has an unusable shape
    MalformedRecord {
        /// Description of the record issue
        reason: String,
    },

    /// Serialization/deserialization error
    SerializationError {
        /// Serialization error description
        message: String,
    },

    /// Background worker has shut down or dropped the reply
    WorkerUnavailable,
}

impl fmt::Display for BspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BspError::ConfigurationError { message } => {
                write!(f, "Configuration error: {}", message)
            }
            BspError::InvalidSamplingRate { rate } => {
                write!(f, "Invalid sampling rate: {}Hz", rate)
            }
            BspError::InvalidFftSize { size } => {
                write!(f, "Invalid FFT size {}: must be a power of two >= 2", size)
            }
            BspError::FftSizeMismatch { expected, actual } => {
                write!(f, "FFT input length mismatch: expected {}, got {}",
                       expected, actual)
            }
            BspError::ChannelOutOfRange { index, channel_count } => {
                write!(f, "Channel index {} out of range for {} channels",
                       index, channel_count)
            }
            BspError::MalformedRecord { reason } => {
                write!(f, "Malformed record: {}", reason)
            }
            BspError::SerializationError { message } => {
                write!(f, "Serialization error: {}", message)
            }
            BspError::WorkerUnavailable => {
                write!(f, "Analysis worker unavailable")
            }
        }
    }
}

impl std::error::Error for BspError {}

impl From<serde_json::Error> for BspError {
    fn from(err: serde_json::Error) -> Self {
        BspError::SerializationError {
            message: err.to_string(),
        }
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::BspError::ConfigurationError {
            message: format!($($arg)*),
        }
    };
}
