use std::time::Duration;

use thiserror::Error;

/// A boxed error produced by a caller-supplied unit of work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when publishing or loading an [`AllocatorConfig`][crate::AllocatorConfig].
///
/// A rejected configuration is never partially applied - the previously published
/// configuration remains in effect.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The candidate violates a validation constraint of its schema version.
    #[error("invalid allocator configuration: {reason}")]
    Invalid {
        /// Human-readable description of the first constraint that failed.
        reason: String,
    },

    /// The candidate declares a schema version this registry does not know how to validate.
    #[error("unsupported allocator configuration version '{version}'")]
    UnsupportedVersion {
        /// The version string found in the configuration document.
        version: String,
    },

    /// The configuration document could not be decoded.
    #[error("failed to parse allocator configuration as {format}: {message}")]
    Parse {
        /// The document format that was being parsed ("json" or "toml").
        format: &'static str,

        /// The decoder's description of the problem.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Errors that can be returned to callers of [`Allocator::acquire()`][crate::Allocator::acquire].
///
/// Transient memory pressure is handled internally (compaction, growth retry) and never
/// surfaces as an error. Only invalid input and irrecoverable exhaustion are reported.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum AllocError {
    /// The requested size was zero.
    #[error("allocation size must be greater than zero")]
    InvalidSize,

    /// The device could not provide a block of the requested size even after reclamation
    /// and an exact-size retry.
    #[error("out of device memory while allocating {requested} bytes")]
    OutOfMemory {
        /// The number of bytes the caller requested.
        requested: u64,
    },
}

/// A failure reported by a [`DeviceMemory`][crate::DeviceMemory] implementation.
///
/// The allocator treats this as a normal, recoverable outcome and applies its own retry
/// policy before mapping it to [`AllocError::OutOfMemory`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("device could not allocate {size} bytes: {reason}")]
pub struct DeviceError {
    size: u64,
    reason: String,
}

impl DeviceError {
    /// Creates a new device error for a failed allocation of `size` bytes.
    #[must_use]
    pub fn new(size: u64, reason: impl Into<String>) -> Self {
        Self {
            size,
            reason: reason.into(),
        }
    }

    /// The size of the allocation that failed.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Errors that can be returned by [`Pipeline::execute()`][crate::Pipeline::execute].
///
/// Whatever the outcome, any block acquired for the call has been released by the time
/// the error is returned.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecError {
    /// No memory could be obtained for the batch, even after falling back to smaller batches.
    #[error("allocation failed after batch-size fallback")]
    AllocationFailed(#[source] AllocError),

    /// The caller-supplied unit of work returned an error.
    #[error("unit of work failed")]
    WorkFailed(#[source] BoxError),

    /// The unit of work did not complete within the pipeline timeout.
    #[error("unit of work did not complete within {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::error::Error as _;
    use std::fmt::Debug;
    use std::io;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(ConfigError: Send, Sync, Debug);
    assert_impl_all!(AllocError: Send, Sync, Debug, Copy);
    assert_impl_all!(DeviceError: Send, Sync, Debug);
    assert_impl_all!(ExecError: Send, Sync, Debug);

    #[test]
    fn invalid_config_message_names_reason() {
        let error = ConfigError::invalid("growth_factor must be greater than 1.0");

        assert_eq!(
            error.to_string(),
            "invalid allocator configuration: growth_factor must be greater than 1.0"
        );
    }

    #[test]
    fn work_failed_exposes_inner_error_as_source() {
        let inner: BoxError = Box::new(io::Error::other("disk on fire"));
        let error = ExecError::WorkFailed(inner);

        let source = error.source().expect("work failure must carry its cause");
        assert_eq!(source.to_string(), "disk on fire");
    }

    #[test]
    fn allocation_failed_exposes_alloc_error_as_source() {
        let error = ExecError::AllocationFailed(AllocError::OutOfMemory { requested: 64 });

        let source = error.source().expect("allocation failure must carry its cause");
        assert_eq!(
            source.to_string(),
            "out of device memory while allocating 64 bytes"
        );
    }
}
