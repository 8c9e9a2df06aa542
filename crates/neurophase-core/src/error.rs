//! Error types for synchronization and configuration.
//!
//! Configuration problems are reported synchronously at configuration time;
//! the streaming path never sees them. Synchronization errors indicate a
//! violated usage contract (two producers, two consumers, or a lockout while
//! a role is held), not a runtime race.

use thiserror::Error;

/// Errors from the triple-buffer exchange primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A producer role is already checked out for this resource
    #[error("writer role already checked out")]
    WriterCheckedOut,

    /// A consumer role is already checked out for this resource
    #[error("reader role already checked out")]
    ReaderCheckedOut,

    /// Exclusive lockout failed because a role is currently held
    #[error("cannot lock out resource: a reader or writer is active")]
    Busy,
}

/// Result alias for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised when validating pipeline configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Analysis window does not fit inside the segment
    #[error("window length {window_s} s exceeds segment length {segment_s} s")]
    WindowExceedsSegment {
        /// Requested window length in seconds
        window_s: f64,
        /// Configured segment length in seconds
        segment_s: f64,
    },

    /// Frequency range contains no frequencies of interest
    #[error("frequency range [{start_hz}, {end_hz}] Hz with step {step_hz} Hz is empty")]
    EmptyFrequencyRange {
        /// Start of the range in Hz
        start_hz: f64,
        /// End of the range in Hz
        end_hz: f64,
        /// Step between frequencies in Hz
        step_hz: f64,
    },

    /// Step length must be positive and no larger than the window
    #[error("invalid step length {step_s} s")]
    InvalidStepLength {
        /// Requested step length in seconds
        step_s: f64,
    },

    /// AR model order incompatible with the available history
    #[error("AR order {order} requires at least {required} samples, history holds {available}")]
    InvalidArOrder {
        /// Requested model order
        order: usize,
        /// Minimum samples needed for this order
        required: usize,
        /// Samples actually available after striding
        available: usize,
    },

    /// Stride must be at least 1
    #[error("invalid stride {stride}")]
    InvalidStride {
        /// Requested stride
        stride: usize,
    },

    /// Channel sample rate is not a multiple of the processing rate
    #[error("sample rate {rate_hz} Hz is not an integer multiple of {required_hz} Hz")]
    UnsupportedSampleRate {
        /// Channel sample rate in Hz
        rate_hz: f64,
        /// Required base processing rate in Hz
        required_hz: f64,
    },

    /// Requested passband is not covered by any transformer band
    #[error("passband [{low_hz}, {high_hz}] Hz is outside every supported band")]
    PassbandOutOfRange {
        /// Low cutoff in Hz
        low_hz: f64,
        /// High cutoff in Hz
        high_hz: f64,
    },

    /// Exponential weighting decay must be non-negative
    #[error("invalid exponential weighting alpha {alpha}")]
    InvalidAlpha {
        /// Requested decay constant
        alpha: f64,
    },

    /// FFT interpolation ratio must be at least 1
    #[error("invalid interpolation ratio {ratio}")]
    InvalidInterpRatio {
        /// Requested ratio
        ratio: usize,
    },

    /// At least one channel is required in each analysis group
    #[error("channel group {group} is empty")]
    EmptyChannelGroup {
        /// Which group (1 or 2) was empty
        group: u8,
    },
}

/// Result alias for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let err = ConfigError::InvalidArOrder {
            order: 20,
            required: 21,
            available: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("20"));
        assert!(msg.contains("21"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_sync_error_is_copy() {
        let err = SyncError::Busy;
        let copy = err;
        assert_eq!(err, copy);
    }
}
