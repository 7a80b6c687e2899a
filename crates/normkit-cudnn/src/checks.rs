// Argument checks: fail-fast validation of tensor arguments
//
// Every check takes the name of the entry point being checked (`CheckedFrom`)
// and a list of `TensorArg`s, and reports the first offending argument by role
// and position. Undefined arguments (`None`) are only an error for
// `check_all_defined`; every other check skips them, which is how optional
// tensors such as inference-time save statistics pass through.
//
// The checks read metadata only. Nothing here touches storage.

use normkit_core::{
    ArgName, Backend, BackendDevice, DType, Error, Result, Tensor, Violation,
};

/// Name of the entry point a check runs on behalf of.
pub type CheckedFrom = &'static str;

/// A possibly-undefined tensor together with its role name and position.
pub struct TensorArg<'a, B: Backend> {
    pub tensor: Option<&'a Tensor<B>>,
    pub name: &'static str,
    pub pos: usize,
}

impl<B: Backend> Clone for TensorArg<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for TensorArg<'_, B> {}

impl<'a, B: Backend> TensorArg<'a, B> {
    pub fn new(tensor: &'a Tensor<B>, name: &'static str, pos: usize) -> Self {
        TensorArg {
            tensor: Some(tensor),
            name,
            pos,
        }
    }

    pub fn optional(tensor: Option<&'a Tensor<B>>, name: &'static str, pos: usize) -> Self {
        TensorArg { tensor, name, pos }
    }

    pub fn arg_name(&self) -> ArgName {
        ArgName {
            name: self.name,
            pos: self.pos,
        }
    }
}

fn fail(c: CheckedFrom, violation: Violation) -> Error {
    Error::ContractViolation {
        checked_from: c,
        violation,
    }
}

/// Defined arguments paired with their tensors.
fn defined<'a, 'b, B: Backend>(
    args: &'b [TensorArg<'a, B>],
) -> impl Iterator<Item = (ArgName, &'a Tensor<B>)> + 'b {
    args.iter()
        .filter_map(|a| a.tensor.map(|t| (a.arg_name(), t)))
}

pub fn check_all_defined<B: Backend>(c: CheckedFrom, args: &[TensorArg<'_, B>]) -> Result<()> {
    match args.iter().find(|a| a.tensor.is_none()) {
        Some(a) => Err(fail(c, Violation::Undefined { arg: a.arg_name() })),
        None => Ok(()),
    }
}

/// Every defined argument lives on a GPU, and all on the same one.
pub fn check_all_same_gpu<B: Backend>(c: CheckedFrom, args: &[TensorArg<'_, B>]) -> Result<()> {
    let mut first: Option<(ArgName, &Tensor<B>, usize)> = None;
    for (arg, t) in defined(args) {
        let Some(ordinal) = t.device().gpu_ordinal() else {
            return Err(fail(
                c,
                Violation::NotOnGpu {
                    arg,
                    device: t.device().name(),
                },
            ));
        };
        match first {
            None => first = Some((arg, t, ordinal)),
            Some((first_arg, first_t, first_ordinal)) if first_ordinal != ordinal => {
                return Err(fail(
                    c,
                    Violation::DeviceMismatch {
                        arg: first_arg,
                        device: first_t.device().name(),
                        other: arg,
                        other_device: t.device().name(),
                    },
                ));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

pub fn check_scalar_type<B: Backend>(
    c: CheckedFrom,
    arg: TensorArg<'_, B>,
    dtype: DType,
) -> Result<()> {
    match arg.tensor {
        Some(t) if t.dtype() != dtype => Err(fail(
            c,
            Violation::ScalarType {
                arg: arg.arg_name(),
                expected: dtype,
                got: t.dtype(),
            },
        )),
        _ => Ok(()),
    }
}

/// All defined arguments share the dtype of the first defined one.
pub fn check_all_same_type<B: Backend>(c: CheckedFrom, args: &[TensorArg<'_, B>]) -> Result<()> {
    let mut iter = defined(args);
    let Some((first_arg, first)) = iter.next() else {
        return Ok(());
    };
    for (arg, t) in iter {
        if t.dtype() != first.dtype() {
            return Err(fail(
                c,
                Violation::TypeMismatch {
                    arg: first_arg,
                    dtype: first.dtype(),
                    other: arg,
                    other_dtype: t.dtype(),
                },
            ));
        }
    }
    Ok(())
}

pub fn check_all_contiguous<B: Backend>(c: CheckedFrom, args: &[TensorArg<'_, B>]) -> Result<()> {
    match defined(args).find(|(_, t)| !t.is_contiguous()) {
        Some((arg, _)) => Err(fail(c, Violation::NotContiguous { arg })),
        None => Ok(()),
    }
}

/// Rank of `arg` lies in `[min, max)`.
pub fn check_dim_range<B: Backend>(
    c: CheckedFrom,
    arg: TensorArg<'_, B>,
    min: usize,
    max: usize,
) -> Result<()> {
    match arg.tensor {
        Some(t) if t.rank() < min || t.rank() >= max => Err(fail(
            c,
            Violation::DimRange {
                arg: arg.arg_name(),
                rank: t.rank(),
                min,
                max: max - 1,
            },
        )),
        _ => Ok(()),
    }
}

pub fn check_numel<B: Backend>(c: CheckedFrom, arg: TensorArg<'_, B>, numel: usize) -> Result<()> {
    match arg.tensor {
        Some(t) if t.elem_count() != numel => Err(fail(
            c,
            Violation::Numel {
                arg: arg.arg_name(),
                expected: numel,
                got: t.elem_count(),
            },
        )),
        _ => Ok(()),
    }
}

pub fn check_same_size<B: Backend>(
    c: CheckedFrom,
    a: TensorArg<'_, B>,
    b: TensorArg<'_, B>,
) -> Result<()> {
    match (a.tensor, b.tensor) {
        (Some(ta), Some(tb)) if ta.shape() != tb.shape() => Err(fail(
            c,
            Violation::SizeMismatch {
                arg: a.arg_name(),
                shape: ta.shape().clone(),
                other: b.arg_name(),
                other_shape: tb.shape().clone(),
            },
        )),
        _ => Ok(()),
    }
}

/// `value` is finite and strictly positive.
pub fn check_positive(c: CheckedFrom, name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(fail(
            c,
            Violation::InvalidScalar {
                name,
                value,
                expected: "a finite value > 0",
            },
        ))
    }
}

/// `value` lies in `(0, 1]`.
pub fn check_unit_interval(c: CheckedFrom, name: &'static str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(fail(
            c,
            Violation::InvalidScalar {
                name,
                value,
                expected: "a value in (0, 1]",
            },
        ))
    }
}
