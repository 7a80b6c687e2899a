// Batch-norm executors: validated forward and backward dispatch
//
// Each call runs the same pipeline:
//
//   1. check every argument (no side effects; the only abortable step)
//   2. fetch the library handle for the input's device, once
//   3. pick the library mode from rank + phase + library version
//   4. build the data and parameter descriptors
//   5. allocate fresh outputs and issue exactly one library call
//
// A library status other than success becomes `Error::PrimitiveFailure`.
// Nothing is retried and no partial output is returned.

use normkit_core::{
    select_mode, Backend, BatchNormMode, Error, LibraryVersion, Phase, Result, Status, Tensor,
};
use tracing::{debug, warn};

use crate::checks::{
    check_all_contiguous, check_all_defined, check_all_same_gpu, check_all_same_type,
    check_dim_range, check_numel, check_positive, check_same_size, check_scalar_type,
    check_unit_interval, CheckedFrom, TensorArg,
};
use crate::descriptor::{expand_scale, TensorDescriptor, DESCRIPTOR_RANK};
use crate::primitives::{
    Backward, BatchNormPrimitives, ForwardInference, ForwardTraining, PrimitiveOp,
};

pub const FORWARD: CheckedFrom = "batch_norm_forward";
pub const BACKWARD: CheckedFrom = "batch_norm_backward";

/// Input rank bounds, `[MIN_RANK, MAX_RANK)`.
pub const MIN_RANK: usize = 2;
pub const MAX_RANK: usize = 6;

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Allow the persistent spatial mode when the library supports it.
    pub persistent_spatial: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            persistent_spatial: true,
        }
    }
}

impl ExecutorConfig {
    pub fn with_persistent_spatial(mut self, enabled: bool) -> Self {
        self.persistent_spatial = enabled;
        self
    }
}

/// Validates arguments and dispatches batch normalization to a primitives
/// library `P`.
#[derive(Debug, Clone)]
pub struct BatchNormExecutor<P> {
    lib: P,
    config: ExecutorConfig,
}

impl<P> BatchNormExecutor<P> {
    pub fn new(lib: P) -> Self {
        Self::with_config(lib, ExecutorConfig::default())
    }

    pub fn with_config(lib: P, config: ExecutorConfig) -> Self {
        Self { lib, config }
    }

    pub fn library(&self) -> &P {
        &self.lib
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Forward batch normalization.
    ///
    /// Training computes batch statistics into `save_mean` / `save_var`
    /// (mean and inverse std), updates `running_mean` / `running_var` in
    /// place with `new = old * (1 - f) + batch * f` and returns the
    /// normalized output. Inference normalizes with the running statistics
    /// and leaves every statistics tensor untouched; `save_mean` /
    /// `save_var` may then be `None`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward<B>(
        &self,
        input: &Tensor<B>,
        weight: &Tensor<B>,
        bias: &Tensor<B>,
        running_mean: &mut Tensor<B>,
        running_var: &mut Tensor<B>,
        save_mean: Option<&mut Tensor<B>>,
        save_var: Option<&mut Tensor<B>>,
        training: bool,
        exponential_average_factor: f64,
        epsilon: f64,
    ) -> Result<Tensor<B>>
    where
        B: Backend,
        P: BatchNormPrimitives<B>,
    {
        let phase = Phase::from_training(training);
        check_forward_args(
            input,
            weight,
            bias,
            running_mean,
            running_var,
            save_mean.as_deref(),
            save_var.as_deref(),
            phase,
            exponential_average_factor,
            epsilon,
        )?;

        let handle = self
            .lib
            .handle(input.device())
            .map_err(|status| primitive_failure(PrimitiveOp::Handle, status))?;
        let mode = self.resolve_mode(input.rank(), phase, self.lib.version());

        let x_desc = TensorDescriptor::new(input.dtype(), input.layout(), DESCRIPTOR_RANK)?;
        let param_desc = TensorDescriptor::new(
            weight.dtype(),
            &expand_scale(weight.layout(), input.rank())?,
            DESCRIPTOR_RANK,
        )?;

        let mut output = Tensor::<B>::zeros(input.shape().clone(), input.dtype(), input.device())?;

        debug!(
            ?phase,
            %mode,
            shape = %input.shape(),
            dtype = %input.dtype(),
            "batch norm forward"
        );

        match (phase, save_mean, save_var) {
            (Phase::Training, Some(save_mean), Some(save_var)) => {
                let op = PrimitiveOp::ForwardTraining;
                self.lib
                    .forward_training(
                        &handle,
                        ForwardTraining {
                            mode,
                            x_desc: &x_desc,
                            x: input.storage(),
                            y: output.storage_mut(),
                            param_desc: &param_desc,
                            scale: weight.storage(),
                            bias: bias.storage(),
                            exponential_average_factor,
                            running_mean: running_mean.storage_mut(),
                            running_var: running_var.storage_mut(),
                            epsilon,
                            save_mean: save_mean.storage_mut(),
                            save_inv_var: save_var.storage_mut(),
                        },
                    )
                    .map_err(|status| primitive_failure(op, status))?;
            }
            (Phase::Training, _, _) => {
                // check_forward_args requires both save tensors when training
                return Err(Error::msg("training forward reached dispatch without save statistics"));
            }
            (Phase::Inference, _, _) => {
                let op = PrimitiveOp::ForwardInference;
                self.lib
                    .forward_inference(
                        &handle,
                        ForwardInference {
                            mode,
                            x_desc: &x_desc,
                            x: input.storage(),
                            y: output.storage_mut(),
                            param_desc: &param_desc,
                            scale: weight.storage(),
                            bias: bias.storage(),
                            running_mean: running_mean.storage(),
                            running_var: running_var.storage(),
                            epsilon,
                        },
                    )
                    .map_err(|status| primitive_failure(op, status))?;
            }
        }

        Ok(output)
    }

    /// Backward batch normalization.
    ///
    /// Returns `(grad_input, grad_weight, grad_bias)` computed from the
    /// statistics a training forward saved. Backward only exists for
    /// training, so the mode is always derived as for a training call; the
    /// `training` flag is accepted for symmetry with `forward` and logged.
    #[allow(clippy::too_many_arguments)]
    pub fn backward<B>(
        &self,
        input: &Tensor<B>,
        grad_output: &Tensor<B>,
        weight: &Tensor<B>,
        save_mean: Option<&Tensor<B>>,
        save_var: Option<&Tensor<B>>,
        training: bool,
        epsilon: f64,
    ) -> Result<(Tensor<B>, Tensor<B>, Tensor<B>)>
    where
        B: Backend,
        P: BatchNormPrimitives<B>,
    {
        check_backward_args(input, grad_output, weight, save_mean, save_var, epsilon)?;
        let (Some(save_mean), Some(save_var)) = (save_mean, save_var) else {
            return Err(Error::msg("backward reached dispatch without save statistics"));
        };

        let handle = self
            .lib
            .handle(input.device())
            .map_err(|status| primitive_failure(PrimitiveOp::Handle, status))?;
        let mode = self.resolve_mode(input.rank(), Phase::Training, self.lib.version());

        let x_desc = TensorDescriptor::new(input.dtype(), input.layout(), DESCRIPTOR_RANK)?;
        let dy_desc = TensorDescriptor::new(grad_output.dtype(), grad_output.layout(), DESCRIPTOR_RANK)?;
        let param_desc = TensorDescriptor::new(
            weight.dtype(),
            &expand_scale(weight.layout(), input.rank())?,
            DESCRIPTOR_RANK,
        )?;

        let mut grad_input =
            Tensor::<B>::zeros(input.shape().clone(), input.dtype(), input.device())?;
        let mut grad_weight =
            Tensor::<B>::zeros(weight.shape().clone(), weight.dtype(), weight.device())?;
        let mut grad_bias =
            Tensor::<B>::zeros(weight.shape().clone(), weight.dtype(), weight.device())?;

        debug!(
            training,
            %mode,
            shape = %input.shape(),
            dtype = %input.dtype(),
            "batch norm backward"
        );

        self.lib
            .backward(
                &handle,
                Backward {
                    mode,
                    x_desc: &x_desc,
                    x: input.storage(),
                    dy_desc: &dy_desc,
                    dy: grad_output.storage(),
                    dx_desc: &x_desc,
                    dx: grad_input.storage_mut(),
                    param_desc: &param_desc,
                    scale: weight.storage(),
                    d_scale: grad_weight.storage_mut(),
                    d_bias: grad_bias.storage_mut(),
                    epsilon,
                    save_mean: save_mean.storage(),
                    save_inv_var: save_var.storage(),
                },
            )
            .map_err(|status| primitive_failure(PrimitiveOp::Backward, status))?;

        Ok((grad_input, grad_weight, grad_bias))
    }

    /// The library mode a call of this rank and phase runs in, e.g.
    /// `executor.mode::<EmulatedBackend>(4, Phase::Training)`.
    pub fn mode<B>(&self, rank: usize, phase: Phase) -> BatchNormMode
    where
        B: Backend,
        P: BatchNormPrimitives<B>,
    {
        self.resolve_mode(rank, phase, self.lib.version())
    }

    fn resolve_mode(&self, rank: usize, phase: Phase, version: LibraryVersion) -> BatchNormMode {
        let mode = select_mode(rank, phase, version);
        if mode == BatchNormMode::SpatialPersistent && !self.config.persistent_spatial {
            BatchNormMode::Spatial
        } else {
            mode
        }
    }
}

fn primitive_failure(op: PrimitiveOp, status: Status) -> Error {
    warn!(%op, %status, "primitive call failed");
    Error::PrimitiveFailure {
        op: op.name(),
        status,
    }
}

/// Argument contract of [`BatchNormExecutor::forward`].
///
/// Order: defined → same GPU → dtype → contiguity → rank → element counts →
/// scalars. The first violation wins.
#[allow(clippy::too_many_arguments)]
pub fn check_forward_args<B: Backend>(
    input: &Tensor<B>,
    weight: &Tensor<B>,
    bias: &Tensor<B>,
    running_mean: &Tensor<B>,
    running_var: &Tensor<B>,
    save_mean: Option<&Tensor<B>>,
    save_var: Option<&Tensor<B>>,
    phase: Phase,
    exponential_average_factor: f64,
    epsilon: f64,
) -> Result<()> {
    let c = FORWARD;
    let input = TensorArg::new(input, "input", 1);
    let weight = TensorArg::new(weight, "weight", 2);
    let bias = TensorArg::new(bias, "bias", 3);
    let running_mean = TensorArg::new(running_mean, "running_mean", 4);
    let running_var = TensorArg::new(running_var, "running_var", 5);
    let save_mean = TensorArg::optional(save_mean, "save_mean", 6);
    let save_var = TensorArg::optional(save_var, "save_var", 7);

    check_all_defined(c, &[input, weight, bias, running_mean, running_var])?;
    if phase.is_training() {
        check_all_defined(c, &[save_mean, save_var])?;
    }
    let all = [input, weight, bias, running_mean, running_var, save_mean, save_var];
    check_all_same_gpu(c, &all)?;
    check_input_weight_types(c, input, weight)?;
    check_all_same_type(c, &[weight, bias, running_mean, running_var, save_mean, save_var])?;
    check_all_contiguous(c, &all)?;
    check_dim_range(c, input, MIN_RANK, MAX_RANK)?;
    let num_features = channels(input)?;
    for t in [weight, bias, running_mean, running_var, save_mean, save_var] {
        check_numel(c, t, num_features)?;
    }
    check_positive(c, "epsilon", epsilon)?;
    if phase.is_training() {
        check_unit_interval(c, "exponential_average_factor", exponential_average_factor)?;
    }
    Ok(())
}

/// Argument contract of [`BatchNormExecutor::backward`].
///
/// Order: defined → same GPU → dtype → contiguity → rank → element counts →
/// input/grad_output shape → epsilon.
pub fn check_backward_args<B: Backend>(
    input: &Tensor<B>,
    grad_output: &Tensor<B>,
    weight: &Tensor<B>,
    save_mean: Option<&Tensor<B>>,
    save_var: Option<&Tensor<B>>,
    epsilon: f64,
) -> Result<()> {
    let c = BACKWARD;
    let input = TensorArg::new(input, "input", 1);
    let grad_output = TensorArg::new(grad_output, "grad_output", 2);
    let weight = TensorArg::new(weight, "weight", 3);
    let save_mean = TensorArg::optional(save_mean, "save_mean", 4);
    let save_var = TensorArg::optional(save_var, "save_var", 5);

    let all = [input, grad_output, weight, save_mean, save_var];
    check_all_defined(c, &all)?;
    check_all_same_gpu(c, &all)?;
    check_input_weight_types(c, input, weight)?;
    check_all_same_type(c, &[input, grad_output])?;
    check_all_same_type(c, &[weight, save_mean, save_var])?;
    check_all_contiguous(c, &all)?;
    check_dim_range(c, input, MIN_RANK, MAX_RANK)?;
    let num_features = channels(input)?;
    for t in [weight, save_mean, save_var] {
        check_numel(c, t, num_features)?;
    }
    check_same_size(c, input, grad_output)?;
    check_positive(c, "epsilon", epsilon)?;
    Ok(())
}

/// Reduced precision input needs f32 parameters; otherwise input and weight
/// share a dtype.
fn check_input_weight_types<B: Backend>(
    c: CheckedFrom,
    input: TensorArg<'_, B>,
    weight: TensorArg<'_, B>,
) -> Result<()> {
    match input.tensor {
        Some(t) if t.dtype().is_half() => check_scalar_type(c, weight, t.dtype().param_dtype()),
        _ => check_all_same_type(c, &[input, weight]),
    }
}

fn channels<B: Backend>(input: TensorArg<'_, B>) -> Result<usize> {
    match input.tensor {
        Some(t) => t.size(1),
        None => Err(Error::msg(format!("{} is undefined", input.arg_name()))),
    }
}
