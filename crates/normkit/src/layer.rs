// BatchNorm: a batch-normalization layer over the validated executors
//
// The layer owns every tensor the operator touches:
//
//   weight, bias               learnable [C], initialized to 1 and 0
//   running_mean, running_var  EMA buffers [C], initialized to 0 and 1
//   save_mean, save_var        batch statistics of the last training
//                              forward, consumed by backward
//
// One set of runtime parameters (training flag, eps, momentum) drives both
// the numeric path (`forward` / `backward` through a `BatchNormExecutor`)
// and the symbolic path (`symbolic` through the IR exporter), so the traced
// node always describes what the executor would do.
//
// Parameters of a half-precision layer are f32, as the library requires.

use normkit_core::{Backend, DType, Error, Result, Tensor};
use normkit_cudnn::{BatchNormExecutor, BatchNormPrimitives};
use normkit_ir::{export_batch_norm, BatchNormSymbolic, SourceLocation, TraceContext, ValueId};
use tracing::trace;

/// Batch normalization over the channel dimension of `[N, C, ...]` input.
///
/// # Examples
/// ```ignore
/// let exec = BatchNormExecutor::new(EmulatedPrimitives::new());
/// let mut bn = BatchNorm::<EmulatedBackend>::new(16, 1e-5, 0.1, DType::F32, &dev)?;
/// let y = bn.forward(&exec, &x)?; // training: updates running stats
/// bn.eval();
/// let y = bn.forward(&exec, &x)?; // inference: uses running stats
/// ```
#[derive(Debug)]
pub struct BatchNorm<B: Backend> {
    weight: Tensor<B>,
    bias: Tensor<B>,
    running_mean: Tensor<B>,
    running_var: Tensor<B>,
    save_mean: Tensor<B>,
    save_var: Tensor<B>,
    num_features: usize,
    eps: f64,
    momentum: f64,
    training: bool,
}

impl<B: Backend> BatchNorm<B> {
    /// Create a layer for `num_features` channels of `dtype` input.
    ///
    /// `momentum` is the weight of the batch statistic in the running
    /// average (typically 0.1). The layer starts in training mode.
    pub fn new(
        num_features: usize,
        eps: f64,
        momentum: f64,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let pdt = dtype.param_dtype();
        let weight = Tensor::<B>::ones([num_features], pdt, device)?;
        let bias = Tensor::<B>::zeros([num_features], pdt, device)?;
        Self::from_tensors(weight, bias, eps, momentum)
    }

    /// Build a layer around existing weight and bias tensors.
    /// Running statistics start at mean 0, variance 1.
    pub fn from_tensors(weight: Tensor<B>, bias: Tensor<B>, eps: f64, momentum: f64) -> Result<Self> {
        if weight.rank() != 1 || weight.shape() != bias.shape() {
            return Err(Error::msg(format!(
                "BatchNorm: weight {} and bias {} must be the same [C] shape",
                weight.shape(),
                bias.shape()
            )));
        }
        let num_features = weight.elem_count();
        let (dtype, device) = (weight.dtype(), weight.device().clone());
        Ok(BatchNorm {
            running_mean: Tensor::zeros([num_features], dtype, &device)?,
            running_var: Tensor::ones([num_features], dtype, &device)?,
            save_mean: Tensor::zeros([num_features], dtype, &device)?,
            save_var: Tensor::zeros([num_features], dtype, &device)?,
            weight,
            bias,
            num_features,
            eps,
            momentum,
            training: true,
        })
    }

    /// Use batch statistics and update the running ones.
    pub fn train(&mut self) {
        self.training = true;
    }

    /// Use the running statistics; nothing is updated.
    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn weight(&self) -> &Tensor<B> {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor<B> {
        &self.bias
    }

    pub fn running_mean(&self) -> &Tensor<B> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Tensor<B> {
        &self.running_var
    }

    pub fn save_mean(&self) -> &Tensor<B> {
        &self.save_mean
    }

    /// Inverse standard deviation of the last training batch.
    pub fn save_var(&self) -> &Tensor<B> {
        &self.save_var
    }

    /// Normalize `x`. In training mode this also refreshes the save
    /// statistics and folds the batch into the running statistics.
    pub fn forward<P>(&mut self, executor: &BatchNormExecutor<P>, x: &Tensor<B>) -> Result<Tensor<B>>
    where
        P: BatchNormPrimitives<B>,
    {
        let (save_mean, save_var) = if self.training {
            (Some(&mut self.save_mean), Some(&mut self.save_var))
        } else {
            (None, None)
        };
        executor.forward(
            x,
            &self.weight,
            &self.bias,
            &mut self.running_mean,
            &mut self.running_var,
            save_mean,
            save_var,
            self.training,
            self.momentum,
            self.eps,
        )
    }

    /// Gradients `(grad_input, grad_weight, grad_bias)` for the last training
    /// forward over `x`.
    pub fn backward<P>(
        &self,
        executor: &BatchNormExecutor<P>,
        x: &Tensor<B>,
        grad_output: &Tensor<B>,
    ) -> Result<(Tensor<B>, Tensor<B>, Tensor<B>)>
    where
        P: BatchNormPrimitives<B>,
    {
        executor.backward(
            x,
            grad_output,
            &self.weight,
            Some(&self.save_mean),
            Some(&self.save_var),
            self.training,
            self.eps,
        )
    }

    /// The runtime parameters the exporter sees for this layer.
    pub fn symbolic_params(&self) -> BatchNormSymbolic {
        BatchNormSymbolic {
            training: self.training,
            eps: self.eps,
            momentum: self.momentum,
            running_mean: self.running_mean.id(),
            running_var: self.running_var.id(),
        }
    }

    /// Bind the running statistics to graph values in `ctx`.
    pub fn register_buffers(&self, ctx: &mut TraceContext, running_mean: ValueId, running_var: ValueId) {
        ctx.register_buffer(self.running_mean.id(), running_mean);
        ctx.register_buffer(self.running_var.id(), running_var);
    }

    /// Add weight, bias and both running statistics as graph inputs,
    /// registering the statistics as buffers. Returns `(scale, bias)`.
    pub fn trace_parameters(&self, ctx: &mut TraceContext) -> (ValueId, ValueId) {
        let scale = ctx.trace_input(&self.weight);
        let bias = ctx.trace_input(&self.bias);
        ctx.trace_input(&self.running_mean);
        ctx.trace_input(&self.running_var);
        (scale, bias)
    }

    /// Append this layer's `BatchNormalization` node for `[x, scale, bias]`
    /// and return its primary output.
    pub fn symbolic(
        &self,
        ctx: &mut TraceContext,
        inputs: &[ValueId],
        loc: Option<SourceLocation>,
    ) -> Result<ValueId> {
        trace!(training = self.training, "tracing batch norm layer");
        export_batch_norm(ctx, inputs, &self.symbolic_params(), loc)
    }
}
