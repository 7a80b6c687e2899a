//! # normkit-core
//!
//! Shared vocabulary for normkit's batch-normalization dispatch and export.
//!
//! This crate provides:
//! - [`Tensor`]: an owned n-dimensional buffer with a [`TensorId`]
//! - [`Shape`] / [`Layout`]: dimensions, strides and contiguity
//! - [`DType`]: element types (F16, BF16, F32, F64)
//! - [`Backend`] trait: where tensor memory lives
//! - [`Phase`] / [`BatchNormMode`] / [`select_mode`]: the single rule both
//!   the executors and the IR exporter use to branch on training
//! - [`Error`]: the error type every normkit crate returns

pub mod backend;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod mode;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage};
pub use dtype::{DType, WithDType};
pub use error::{ArgName, Error, Result, Status, Violation};
pub use layout::Layout;
pub use mode::{select_mode, BatchNormMode, LibraryVersion, Phase};
pub use shape::Shape;
pub use tensor::{Tensor, TensorId};
