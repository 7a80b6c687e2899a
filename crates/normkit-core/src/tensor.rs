use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{Backend, BackendDevice, BackendStorage};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Tensor: an owned n-dimensional buffer on one device
//
// Unlike a general-purpose tensor library, normkit's tensors own their
// storage outright: there is no shared, reference-counted buffer behind a
// handle. Writing into a tensor needs `&mut Tensor`, so the borrow checker is
// what keeps two calls from updating the same running statistics at once.
//
// Each tensor gets a process-unique `TensorId` at construction. Trace
// contexts key their buffer tables on it, which lets a symbolic export refer
// to a module's running statistics without borrowing them.

/// Process-unique identity of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        TensorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

/// An n-dimensional array owned by a single handle.
pub struct Tensor<B: Backend> {
    id: TensorId,
    storage: B::Storage,
    layout: Layout,
    device: B::Device,
}

impl<B: Backend> fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(id={}, shape={}, dtype={}, device={})",
            self.id,
            self.layout.shape(),
            self.dtype(),
            self.device.name(),
        )
    }
}

impl<B: Backend> Clone for Tensor<B>
where
    B::Storage: Clone,
{
    /// Deep copy. The copy is a different tensor and gets a fresh id.
    fn clone(&self) -> Self {
        Tensor {
            id: TensorId::new(),
            storage: self.storage.clone(),
            layout: self.layout.clone(),
            device: self.device.clone(),
        }
    }
}

impl<B: Backend> Tensor<B> {
    /// Wrap existing storage. The layout must stay inside the buffer.
    pub fn from_storage(storage: B::Storage, layout: Layout, device: B::Device) -> Result<Self> {
        let extent = required_extent(&layout);
        if extent > storage.len() {
            return Err(Error::ElementCountMismatch {
                shape: layout.shape().clone(),
                expected: extent,
                got: storage.len(),
            });
        }
        Ok(Tensor {
            id: TensorId::new(),
            storage,
            layout,
            device,
        })
    }

    /// A contiguous, zero-filled tensor.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(device, dtype, shape.elem_count())?;
        Self::from_storage(storage, Layout::contiguous(shape), device.clone())
    }

    /// A contiguous tensor filled with `value`.
    pub fn full(
        shape: impl Into<Shape>,
        value: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let data = vec![value; shape.elem_count()];
        Self::from_f64_slice(&data, shape, dtype, device)
    }

    pub fn ones(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 1.0, dtype, device)
    }

    /// A contiguous tensor holding `data` in row-major order.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(device, dtype, data)?;
        Self::from_storage(storage, Layout::contiguous(shape), device.clone())
    }

    /// Logical elements in row-major order, following strides and offset.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let flat = B::to_f64_vec(&self.storage)?;
        if self.is_contiguous() {
            return Ok(flat[..self.elem_count()].to_vec());
        }
        Ok(strided_offsets(&self.layout)
            .into_iter()
            .map(|i| flat[i])
            .collect())
    }

    /// Swap two dimensions, keeping the storage in place.
    pub fn transpose(self, dim0: usize, dim1: usize) -> Result<Self> {
        let layout = self.layout.transpose(dim0, dim1)?;
        Ok(Tensor {
            id: TensorId::new(),
            storage: self.storage,
            layout,
            device: self.device,
        })
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    /// Size of dimension `dim`.
    pub fn size(&self, dim: usize) -> Result<usize> {
        self.layout.shape().dim(dim)
    }

    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    pub fn storage(&self) -> &B::Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut B::Storage {
        &mut self.storage
    }
}

/// One past the largest storage index the layout can touch.
fn required_extent(layout: &Layout) -> usize {
    if layout.elem_count() == 0 {
        return 0;
    }
    let last: usize = layout
        .dims()
        .iter()
        .zip(layout.strides())
        .map(|(&d, &s)| (d - 1) * s)
        .sum();
    layout.offset() + last + 1
}

/// Storage index of every logical element, in row-major order.
fn strided_offsets(layout: &Layout) -> Vec<usize> {
    let dims = layout.dims();
    let strides = layout.strides();
    let mut out = Vec::with_capacity(layout.elem_count());
    if layout.elem_count() == 0 {
        return out;
    }
    let mut index = vec![0usize; dims.len()];
    loop {
        let pos: usize = index.iter().zip(strides).map(|(&i, &s)| i * s).sum();
        out.push(layout.offset() + pos);
        let mut d = dims.len();
        loop {
            if d == 0 {
                return out;
            }
            d -= 1;
            index[d] += 1;
            if index[d] < dims[d] {
                break;
            }
            index[d] = 0;
        }
    }
}
