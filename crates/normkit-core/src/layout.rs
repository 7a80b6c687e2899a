use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout: how a logical shape maps onto flat storage
//
// The primitives library only accepts densely packed row-major data, so the
// property that matters most here is `is_contiguous`. Views (`view`,
// `transpose`) change the layout without touching storage; `view` is how a
// rank-1 per-channel tensor is presented as [1, C, 1, 1] to the library.

/// Shape, strides and storage offset of a tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Row-major layout starting at offset 0.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Layout with explicit strides and offset.
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Result<Self> {
        if strides.len() != shape.rank() {
            return Err(Error::msg(format!(
                "layout for shape {shape} needs {} strides, got {}",
                shape.rank(),
                strides.len()
            )));
        }
        Ok(Layout {
            shape,
            strides,
            offset,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Whether the data is densely packed in row-major order from offset 0.
    ///
    /// Strides of size-1 dimensions are ignored: they never move the read
    /// position, so `[1, C]` with strides `[7, 1]` is still contiguous.
    pub fn is_contiguous(&self) -> bool {
        if self.offset != 0 {
            return false;
        }
        let expected = self.shape.stride_contiguous();
        self.dims()
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(&d, (&s, &e))| d == 1 || s == e)
    }

    /// Reinterpret the same elements under a new shape without copying.
    ///
    /// Only contiguous layouts can be viewed; element count and order are
    /// preserved exactly.
    pub fn view(&self, shape: Shape) -> Result<Layout> {
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        if !self.is_contiguous() {
            return Err(Error::msg(format!(
                "cannot view non-contiguous layout {} (strides {:?}) as {shape}",
                self.shape, self.strides
            )));
        }
        Ok(Layout::contiguous(shape))
    }

    /// Swap two dimensions. The result is generally not contiguous.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout {
            shape: Shape::new(dims),
            strides,
            offset: self.offset,
        })
    }
}
