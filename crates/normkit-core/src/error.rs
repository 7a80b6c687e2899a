use std::fmt;

use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within normkit.
///
/// Argument-contract problems, library failures and trace lookups all travel
/// through this one type so callers can `?` across crate boundaries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An argument broke the input contract of a checked entry point.
    /// Detected before any GPU work is issued.
    #[error("{violation} (while checking arguments for {checked_from})")]
    ContractViolation {
        checked_from: &'static str,
        violation: Violation,
    },

    /// The primitives library returned a non-success status.
    #[error("{op} failed: {status}")]
    PrimitiveFailure { op: &'static str, status: Status },

    /// A buffer referenced during symbolic export has no trace value.
    #[error("buffer {buffer} has no value in the trace; register it before exporting")]
    TraceLookupFailure { buffer: String },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Storage length does not match the requested shape.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// The contract violation carried by this error, if any.
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            Error::ContractViolation { violation, .. } => Some(violation),
            _ => None,
        }
    }
}

/// Result alias used throughout normkit.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted [`Error::Msg`].
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

/// Role name and 1-based position of a checked argument, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgName {
    pub name: &'static str,
    pub pos: usize,
}

impl fmt::Display for ArgName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "argument #{} '{}'", self.pos, self.name)
    }
}

/// The specific input-contract rule an argument broke.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("expected a defined tensor for {arg}, but it was undefined")]
    Undefined { arg: ArgName },

    #[error("expected {arg} to be on a GPU, but it is on {device}")]
    NotOnGpu { arg: ArgName, device: String },

    #[error("expected {arg} and {other} to be on the same GPU, but found {device} and {other_device}")]
    DeviceMismatch {
        arg: ArgName,
        device: String,
        other: ArgName,
        other_device: String,
    },

    #[error("expected scalar type {expected} for {arg}, but got {got}")]
    ScalarType {
        arg: ArgName,
        expected: DType,
        got: DType,
    },

    #[error("expected {arg} and {other} to have the same dtype, but got {dtype} and {other_dtype}")]
    TypeMismatch {
        arg: ArgName,
        dtype: DType,
        other: ArgName,
        other_dtype: DType,
    },

    #[error("expected contiguous tensor, but got non-contiguous tensor for {arg}")]
    NotContiguous { arg: ArgName },

    #[error("expected {min} to {max} dims for {arg}, but got {rank} dims")]
    DimRange {
        arg: ArgName,
        rank: usize,
        min: usize,
        max: usize,
    },

    #[error("expected {arg} to have {expected} elements, but got {got}")]
    Numel {
        arg: ArgName,
        expected: usize,
        got: usize,
    },

    #[error("expected {arg} ({shape}) to have the same size as {other} ({other_shape})")]
    SizeMismatch {
        arg: ArgName,
        shape: Shape,
        other: ArgName,
        other_shape: Shape,
    },

    #[error("invalid {name} = {value}: expected {expected}")]
    InvalidScalar {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },
}

/// Non-success status codes of the primitives library.
///
/// Numbering follows cuDNN's `cudnnStatus_t`; codes the library may add
/// later come through as [`Status::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    NotInitialized,
    AllocFailed,
    BadParam,
    InternalError,
    InvalidValue,
    ArchMismatch,
    MappingError,
    ExecutionFailed,
    NotSupported,
    LicenseError,
    Other(i32),
}

impl Status {
    pub fn code(&self) -> i32 {
        match self {
            Status::NotInitialized => 1,
            Status::AllocFailed => 2,
            Status::BadParam => 3,
            Status::InternalError => 4,
            Status::InvalidValue => 5,
            Status::ArchMismatch => 6,
            Status::MappingError => 7,
            Status::ExecutionFailed => 8,
            Status::NotSupported => 9,
            Status::LicenseError => 10,
            Status::Other(code) => *code,
        }
    }

    /// Map a raw status code; `None` for success (0).
    pub fn from_code(code: i32) -> Option<Status> {
        let status = match code {
            0 => return None,
            1 => Status::NotInitialized,
            2 => Status::AllocFailed,
            3 => Status::BadParam,
            4 => Status::InternalError,
            5 => Status::InvalidValue,
            6 => Status::ArchMismatch,
            7 => Status::MappingError,
            8 => Status::ExecutionFailed,
            9 => Status::NotSupported,
            10 => Status::LicenseError,
            other => Status::Other(other),
        };
        Some(status)
    }

    fn name(&self) -> &'static str {
        match self {
            Status::NotInitialized => "NOT_INITIALIZED",
            Status::AllocFailed => "ALLOC_FAILED",
            Status::BadParam => "BAD_PARAM",
            Status::InternalError => "INTERNAL_ERROR",
            Status::InvalidValue => "INVALID_VALUE",
            Status::ArchMismatch => "ARCH_MISMATCH",
            Status::MappingError => "MAPPING_ERROR",
            Status::ExecutionFailed => "EXECUTION_FAILED",
            Status::NotSupported => "NOT_SUPPORTED",
            Status::LicenseError => "LICENSE_ERROR",
            Status::Other(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "STATUS_{} ({})", self.name(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::from_code(0), None);
        assert_eq!(Status::from_code(3), Some(Status::BadParam));
        assert_eq!(Status::from_code(42), Some(Status::Other(42)));
        assert_eq!(Status::ExecutionFailed.code(), 8);
    }

    #[test]
    fn test_violation_message_names_argument() {
        let err = Error::ContractViolation {
            checked_from: "batch_norm_forward",
            violation: Violation::NotContiguous {
                arg: ArgName {
                    name: "weight",
                    pos: 2,
                },
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("argument #2 'weight'"), "{msg}");
        assert!(msg.contains("batch_norm_forward"), "{msg}");
    }

    #[test]
    fn test_primitive_failure_message() {
        let err = Error::PrimitiveFailure {
            op: "forward_training",
            status: Status::BadParam,
        };
        assert_eq!(err.to_string(), "forward_training failed: STATUS_BAD_PARAM (3)");
    }
}
