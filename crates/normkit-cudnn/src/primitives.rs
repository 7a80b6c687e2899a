// BatchNormPrimitives: the call contract of the GPU primitives library
//
// The executors never compute anything themselves. They validate, build
// descriptors and then hand raw storage to one of three library calls. This
// trait is that seam: `cudnn::CudnnPrimitives` forwards to cuDNN, while
// `emulated::EmulatedPrimitives` reproduces the same semantics in host memory.
//
// Scaling factors (alpha = 1, beta = 0, i.e. "overwrite the output") are
// part of the contract and therefore not passed explicitly.

use std::fmt;

use normkit_core::{Backend, BatchNormMode, LibraryVersion, Status};

use crate::descriptor::TensorDescriptor;

/// The library calls normkit issues, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveOp {
    Handle,
    ForwardTraining,
    ForwardInference,
    Backward,
}

impl PrimitiveOp {
    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveOp::Handle => "get_handle",
            PrimitiveOp::ForwardTraining => "batch_norm_forward_training",
            PrimitiveOp::ForwardInference => "batch_norm_forward_inference",
            PrimitiveOp::Backward => "batch_norm_backward",
        }
    }
}

impl fmt::Display for PrimitiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Buffers of a training forward call.
///
/// Computes batch mean and inverse std into `save_mean` / `save_inv_var`,
/// folds them into the running statistics with `exponential_average_factor`
/// and writes the normalized output to `y`.
pub struct ForwardTraining<'a, B: Backend> {
    pub mode: BatchNormMode,
    pub x_desc: &'a TensorDescriptor,
    pub x: &'a B::Storage,
    pub y: &'a mut B::Storage,
    pub param_desc: &'a TensorDescriptor,
    pub scale: &'a B::Storage,
    pub bias: &'a B::Storage,
    pub exponential_average_factor: f64,
    pub running_mean: &'a mut B::Storage,
    pub running_var: &'a mut B::Storage,
    pub epsilon: f64,
    pub save_mean: &'a mut B::Storage,
    pub save_inv_var: &'a mut B::Storage,
}

/// Buffers of an inference forward call. Running statistics are read-only.
pub struct ForwardInference<'a, B: Backend> {
    pub mode: BatchNormMode,
    pub x_desc: &'a TensorDescriptor,
    pub x: &'a B::Storage,
    pub y: &'a mut B::Storage,
    pub param_desc: &'a TensorDescriptor,
    pub scale: &'a B::Storage,
    pub bias: &'a B::Storage,
    pub running_mean: &'a B::Storage,
    pub running_var: &'a B::Storage,
    pub epsilon: f64,
}

/// Buffers of a backward call. Gradients are derived from the statistics a
/// training forward saved, not from the running statistics.
pub struct Backward<'a, B: Backend> {
    pub mode: BatchNormMode,
    pub x_desc: &'a TensorDescriptor,
    pub x: &'a B::Storage,
    pub dy_desc: &'a TensorDescriptor,
    pub dy: &'a B::Storage,
    pub dx_desc: &'a TensorDescriptor,
    pub dx: &'a mut B::Storage,
    pub param_desc: &'a TensorDescriptor,
    pub scale: &'a B::Storage,
    pub d_scale: &'a mut B::Storage,
    pub d_bias: &'a mut B::Storage,
    pub epsilon: f64,
    pub save_mean: &'a B::Storage,
    pub save_inv_var: &'a B::Storage,
}

/// A batch-normalization primitives library for backend `B`.
pub trait BatchNormPrimitives<B: Backend> {
    /// Execution handle bound to a device and its current stream.
    type Handle;

    /// Library version; gates `BatchNormMode::SpatialPersistent`.
    fn version(&self) -> LibraryVersion;

    /// The handle for `device`'s current stream. Queried once per call.
    fn handle(&self, device: &B::Device) -> Result<Self::Handle, Status>;

    fn forward_training(
        &self,
        handle: &Self::Handle,
        args: ForwardTraining<'_, B>,
    ) -> Result<(), Status>;

    fn forward_inference(
        &self,
        handle: &Self::Handle,
        args: ForwardInference<'_, B>,
    ) -> Result<(), Status>;

    fn backward(&self, handle: &Self::Handle, args: Backward<'_, B>) -> Result<(), Status>;
}
