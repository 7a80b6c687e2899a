use crate::dtype::DType;
use crate::error::Result;
use std::fmt;

// Backend: where tensor memory lives
//
// normkit does not do tensor math of its own; the only thing it needs from a
// backend is memory: allocate it on a device, tell which device and dtype it
// has, and move values in and out for initialization and inspection. The
// numerical work goes through the primitives library, which is handed raw
// storage by the executors.

/// A device that tensor memory can live on.
pub trait BackendDevice: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Human-readable name, e.g. "cuda:0".
    fn name(&self) -> String;

    /// Ordinal of the GPU this device denotes, `None` for host memory.
    fn gpu_ordinal(&self) -> Option<usize>;
}

/// A flat buffer of elements of one dtype.
pub trait BackendStorage: Send + Sync + 'static {
    fn dtype(&self) -> DType;

    /// Number of elements the buffer holds.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A memory backend for [`crate::Tensor`].
pub trait Backend: Clone + fmt::Debug + Send + Sync + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    fn name() -> &'static str;

    /// Allocate `len` zeroed elements on `device`.
    fn zeros(device: &Self::Device, dtype: DType, len: usize) -> Result<Self::Storage>;

    /// Allocate storage holding `data`, rounded to `dtype`.
    fn from_f64_slice(device: &Self::Device, dtype: DType, data: &[f64]) -> Result<Self::Storage>;

    /// Copy the whole buffer out as f64, in storage order.
    fn to_f64_vec(storage: &Self::Storage) -> Result<Vec<f64>>;
}
