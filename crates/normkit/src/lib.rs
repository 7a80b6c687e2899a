//! # normkit
//!
//! GPU batch normalization with strict argument validation and a matching
//! symbolic export.
//!
//! normkit is organized as a workspace of crates:
//!
//! - **normkit-core**: tensors, dtypes, layouts, the error type and the
//!   shared phase/mode rules
//! - **normkit-cudnn**: contract checks, descriptors and the forward and
//!   backward executors over a primitives library (emulated or cuDNN)
//! - **normkit-ir**: trace graph, batch-norm symbolic export and ONNX
//!   serialization
//!
//! This crate re-exports all of them and adds the [`BatchNorm`] layer, which
//! drives both the executors and the exporter from one set of parameters.
//!
//! ## Quick Start
//!
//! ```ignore
//! use normkit::prelude::*;
//!
//! let dev = EmulatedDevice::Gpu(0);
//! let exec = BatchNormExecutor::new(EmulatedPrimitives::new());
//! let mut bn = BatchNorm::<EmulatedBackend>::new(3, 1e-5, 0.1, DType::F32, &dev)?;
//!
//! let x = Tensor::<EmulatedBackend>::ones([8, 3, 32, 32], DType::F32, &dev)?;
//! let y = bn.forward(&exec, &x)?;
//!
//! let mut ctx = TraceContext::new();
//! let input = ctx.trace_input(&x);
//! let (scale, bias) = bn.trace_parameters(&mut ctx);
//! let out = bn.symbolic(&mut ctx, &[input, scale, bias], None)?;
//! ctx.graph_mut().add_output(out);
//! normkit::onnx::save(ctx.graph(), "bn.onnx")?;
//! ```

pub mod layer;

pub use normkit_core;
pub use normkit_cudnn;
pub use normkit_ir;

pub use normkit_core::{
    bail, select_mode, Backend, BackendDevice, BackendStorage, BatchNormMode, DType, Error, Layout,
    LibraryVersion, Phase, Result, Shape, Status, Tensor, TensorId, Violation,
};
pub use normkit_cudnn::{
    BatchNormExecutor, BatchNormPrimitives, EmulatedBackend, EmulatedDevice, EmulatedPrimitives,
    ExecutorConfig,
};
pub use normkit_ir::{
    export_batch_norm, onnx, BatchNormSymbolic, Graph, SourceLocation, TraceContext, ValueId,
    ValueType,
};

pub use layer::BatchNorm;

#[cfg(feature = "cudnn")]
pub use normkit_cudnn::cudnn::{CudaBackend, CudaDevice, CudnnPrimitives};

/// Common imports.
pub mod prelude {
    pub use crate::layer::BatchNorm;
    pub use normkit_core::{Backend, BatchNormMode, DType, Error, Phase, Result, Shape, Tensor};
    pub use normkit_cudnn::{
        BatchNormExecutor, BatchNormPrimitives, EmulatedBackend, EmulatedDevice,
        EmulatedPrimitives, ExecutorConfig,
    };
    pub use normkit_ir::{export_batch_norm, BatchNormSymbolic, Graph, TraceContext, ValueId};
}
