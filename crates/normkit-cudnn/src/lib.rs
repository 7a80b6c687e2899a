//! # normkit-cudnn
//!
//! Validated batch-normalization dispatch onto a GPU primitives library.
//!
//! [`BatchNormExecutor`] checks every argument against the contract the
//! library expects, picks a [`BatchNormMode`](normkit_core::BatchNormMode),
//! builds [`TensorDescriptor`]s and issues exactly one library call per
//! forward or backward. The library itself sits behind the
//! [`BatchNormPrimitives`] trait:
//!
//! - [`emulated::EmulatedPrimitives`] computes in host memory with the same
//!   semantics and records what was dispatched
//! - `cudnn::CudnnPrimitives` (feature `cudnn`) calls cuDNN through cudarc

pub mod batch_norm;
pub mod checks;
pub mod descriptor;
pub mod emulated;
pub mod primitives;

#[cfg(feature = "cudnn")]
pub mod cudnn;

pub use batch_norm::{
    check_backward_args, check_forward_args, BatchNormExecutor, ExecutorConfig, BACKWARD, FORWARD,
    MAX_RANK, MIN_RANK,
};
pub use checks::{CheckedFrom, TensorArg};
pub use descriptor::{expand_scale, DataType, TensorDescriptor, DESCRIPTOR_RANK};
pub use emulated::{Dispatch, EmulatedBackend, EmulatedDevice, EmulatedPrimitives, EmulatedStorage};
pub use primitives::{BatchNormPrimitives, PrimitiveOp};
