//! Error types for the likelihood engine.
//!
//! Every public entry point returns [`Result`]. Callers that need the small
//! fixed code set at a foreign boundary use [`Error::code`] or
//! [`ResultCode::from_result`].

use std::fmt;

use thiserror::Error;

/// Which family of buffers an index refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Partial-likelihood buffers, indexed by node.
    Partials,
    /// Compact tip-state buffers, indexed by tip.
    TipStates,
    /// Transition-probability matrices, indexed by matrix.
    Matrix,
    /// Eigendecomposition slots, indexed by substitution model.
    Eigen,
    /// Per-node scaling-factor buffers.
    ScalingFactors,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferKind::Partials => "partials",
            BufferKind::TipStates => "tip-states",
            BufferKind::Matrix => "transition-matrix",
            BufferKind::Eigen => "eigendecomposition",
            BufferKind::ScalingFactors => "scaling-factor",
        };
        f.write_str(name)
    }
}

/// Engine error type
#[derive(Error, Debug)]
pub enum Error {
    /// The platform reported no usable accelerator device.
    #[error("no accelerator device found")]
    NoDevice,

    /// A device allocation could not be satisfied.
    #[error("out of device memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes asked for.
        requested: u64,
        /// Bytes the device still had.
        available: u64,
    },

    /// A caller-supplied index is outside the allocated range.
    #[error("{kind} index {index} out of range (0..{len})")]
    IndexOutOfRange {
        /// Buffer family.
        kind: BufferKind,
        /// Offending index.
        index: usize,
        /// Number of slots allocated.
        len: usize,
    },

    /// The slot exists but holds no data yet.
    #[error("{kind} buffer {index} has not been set")]
    BufferUnset {
        /// Buffer family.
        kind: BufferKind,
        /// Slot index.
        index: usize,
    },

    /// Parallel arrays or input blocks have the wrong length.
    #[error("{what}: expected length {expected}, got {actual}")]
    LengthMismatch {
        /// Name of the mismatched input.
        what: &'static str,
        /// Length required.
        expected: usize,
        /// Length received.
        actual: usize,
    },

    /// Any other caller-contract violation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Host/device transfer failed.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// The operation is part of the public contract but not implemented.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Fixed result codes reported across a foreign-function boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    /// Call completed.
    Success = 0,
    /// Unspecified failure, including missing devices and transfer errors.
    GeneralError = -1,
    /// Device or host memory exhausted.
    OutOfMemory = -2,
    /// Caller passed an index or length outside the instance's shape.
    OutOfRange = -3,
    /// The requested feature is not implemented by this engine.
    NotSupported = -4,
}

impl ResultCode {
    /// Collapse a result into its boundary code.
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}

impl Error {
    /// Boundary code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::OutOfMemory { .. } => ResultCode::OutOfMemory,
            Error::IndexOutOfRange { .. } | Error::LengthMismatch { .. } => ResultCode::OutOfRange,
            Error::NotSupported(_) => ResultCode::NotSupported,
            Error::NoDevice
            | Error::BufferUnset { .. }
            | Error::InvalidArgument(_)
            | Error::Transfer(_) => ResultCode::GeneralError,
        }
    }

    pub(crate) fn out_of_range(kind: BufferKind, index: usize, len: usize) -> Self {
        Error::IndexOutOfRange { kind, index, len }
    }

    pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Error::LengthMismatch { what, expected, actual })
        }
    }
}
