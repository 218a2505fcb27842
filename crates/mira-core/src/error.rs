//! Error taxonomy for the MIRA crates.
//!
//! One enum for the whole workspace. Variants are grouped by subsystem and
//! each group owns a stable error-code range so log scrapers and operators
//! can match on numbers rather than display strings.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MiraError>;

#[derive(Debug, Error)]
pub enum MiraError {
    // ── Data access (1xx) ──
    /// The image has no descriptor yet; `create_2d`/`create_3d` was never
    /// called.
    #[error("image is uninitialized: no storage has been created")]
    UninitializedData,

    /// A read overlapped a write, or two writes overlapped. This is a wiring
    /// bug in the caller's pipeline, not a transient condition.
    #[error("concurrent access violation: {0}")]
    ConcurrentAccess(&'static str),

    /// Residency bookkeeping found no up-to-date copy to transfer from.
    /// Internal invariant violation.
    #[error("no up-to-date data location exists for this image")]
    NoValidSource,

    // ── Streaming (2xx) ──
    /// A blocking wait was interrupted by `stop()`. Raised during teardown;
    /// worker threads treat it as a signal to exit, not a failure.
    #[error("thread stopped while waiting")]
    ThreadStopped,

    /// The requested frame is not (or no longer) retained.
    #[error("no frame available at frame number {0}")]
    NoFramesAvailable(u64),

    /// The producer signaled end of stream and every retained frame has been
    /// consumed.
    #[error("end of stream reached")]
    EndOfStream,

    /// A blocking wait exceeded its configured deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    // ── Device layer (3xx) ──
    /// The accelerator backend reported a failure.
    #[error("device error: {0}")]
    Device(String),

    /// Image dimensions, channel count or data size do not form a valid
    /// storage request.
    #[error("invalid image descriptor: {0}")]
    InvalidDescriptor(String),
}

impl MiraError {
    /// Stable integer code for logs and metrics. Ranges: 1xx data access,
    /// 2xx streaming, 3xx device layer.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::UninitializedData => 101,
            Self::ConcurrentAccess(_) => 102,
            Self::NoValidSource => 103,

            Self::ThreadStopped => 201,
            Self::NoFramesAvailable(_) => 202,
            Self::EndOfStream => 203,
            Self::Timeout(_) => 204,

            Self::Device(_) => 301,
            Self::InvalidDescriptor(_) => 302,
        }
    }

    /// Whether the caller can reasonably retry or continue after this error.
    /// Streaming conditions are part of normal flow control; the data-access
    /// and device variants indicate bugs or broken hardware state.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ThreadStopped | Self::NoFramesAvailable(_) | Self::EndOfStream | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_grouped_by_subsystem() {
        assert_eq!(MiraError::UninitializedData.error_code(), 101);
        assert_eq!(MiraError::ThreadStopped.error_code(), 201);
        assert_eq!(MiraError::Device("x".into()).error_code(), 301);
    }

    #[test]
    fn streaming_errors_are_recoverable() {
        assert!(MiraError::EndOfStream.is_recoverable());
        assert!(MiraError::Timeout(Duration::from_millis(5)).is_recoverable());
        assert!(!MiraError::NoValidSource.is_recoverable());
        assert!(!MiraError::ConcurrentAccess("two writers").is_recoverable());
    }
}
