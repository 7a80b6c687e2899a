// Descriptors: the shape/stride/type view the primitives library consumes
//
// The library describes every buffer with a descriptor of at least four
// dimensions. Two descriptors are built per call:
//
//   data  : input / output / gradient tensors, [N, C, ...] padded to rank 4
//   param : scale, bias and all statistics, [C] viewed as [1, C, 1, ...]
//           with the input's rank, then padded to rank 4 as well
//
// Both are pure metadata over contiguous storage; no data moves.

use normkit_core::{DType, Error, Layout, Result, Shape};
use tracing::trace;

/// Minimum descriptor rank the library accepts.
pub const DESCRIPTOR_RANK: usize = 4;

/// Element type tag understood by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Half,
    BFloat16,
    Float,
    Double,
}

impl From<DType> for DataType {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::F16 => DataType::Half,
            DType::BF16 => DataType::BFloat16,
            DType::F32 => DataType::Float,
            DType::F64 => DataType::Double,
        }
    }
}

/// Dims and strides of one buffer, as the library's `i32`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    data_type: DataType,
    dims: Vec<i32>,
    strides: Vec<i32>,
}

impl TensorDescriptor {
    /// Describe `layout`, appending size-1 dims (stride 1) until the rank is
    /// at least `pad`. Higher ranks are kept as they are.
    pub fn new(dtype: DType, layout: &Layout, pad: usize) -> Result<Self> {
        let mut dims = Vec::with_capacity(layout.rank().max(pad));
        let mut strides = Vec::with_capacity(layout.rank().max(pad));
        for (&d, &s) in layout.dims().iter().zip(layout.strides()) {
            dims.push(to_i32(d, "dimension")?);
            strides.push(to_i32(s, "stride")?);
        }
        while dims.len() < pad {
            dims.push(1);
            strides.push(1);
        }
        trace!(?dtype, ?dims, ?strides, "tensor descriptor");
        Ok(TensorDescriptor {
            data_type: dtype.into(),
            dims,
            strides,
        })
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn dims(&self) -> &[i32] {
        &self.dims
    }

    pub fn strides(&self) -> &[i32] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn elem_count(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }
}

fn to_i32(v: usize, what: &str) -> Result<i32> {
    i32::try_from(v).map_err(|_| Error::msg(format!("{what} {v} does not fit the library's i32")))
}

/// View a rank-1 per-channel layout `[C]` as `[1, C, 1, ...]` of rank `dim`.
///
/// This is a reshape of contiguous data: element order and count are kept.
pub fn expand_scale(layout: &Layout, dim: usize) -> Result<Layout> {
    let mut size = vec![1, layout.elem_count()];
    while size.len() < dim {
        size.push(1);
    }
    layout.view(Shape::new(size))
}
