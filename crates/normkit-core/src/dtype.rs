use std::fmt;

// DType: Element types a normalized tensor may carry
//
// Batch normalization only runs on floating-point data. The reduced
// precision types (F16, BF16) are special: the library keeps per-channel
// parameters and statistics in F32 for them, so the parameter dtype of a
// call is not always the dtype of its activation.

/// Element data type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
}

impl DType {
    /// Whether this is a reduced precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// The dtype per-channel parameters must use alongside an activation of
    /// this dtype: F32 for reduced precision, the same dtype otherwise.
    pub fn param_dtype(&self) -> DType {
        if self.is_half() {
            DType::F32
        } else {
            *self
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// Rust element types that can back a tensor.
///
/// Values cross into f64 for host-side arithmetic and come back through
/// `from_f64`, which rounds to the target precision.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_dtype() {
        assert_eq!(DType::F16.param_dtype(), DType::F32);
        assert_eq!(DType::BF16.param_dtype(), DType::F32);
        assert_eq!(DType::F32.param_dtype(), DType::F32);
        assert_eq!(DType::F64.param_dtype(), DType::F64);
    }

    #[test]
    fn test_half_roundtrip_rounds() {
        let v = <half::f16 as WithDType>::from_f64(0.1).to_f32() as f64;
        assert!((v - 0.1).abs() < 1e-3);
        assert_ne!(v, 0.1);
    }
}
