// Emulated primitives: cuDNN batch-norm semantics in host memory
//
// `EmulatedBackend` keeps tensor data in host vectors but tags each buffer
// with the device it stands in for, so the executors' device checks behave
// exactly as they would on real GPUs. `EmulatedPrimitives` implements the
// three library calls with the library's numerics:
//
//   PerActivation : one statistic per (c, spatial) feature, reduced over N
//   Spatial(*)    : one statistic per channel, reduced over N × spatial
//
//   save_mean     = batch mean
//   save_inv_var  = 1 / sqrt(biased batch variance + eps)
//   running_mean  = (1 - f) * running_mean + f * batch mean
//   running_var   = (1 - f) * running_var  + f * unbiased batch variance
//
// Arithmetic runs in f64 and is rounded to each buffer's dtype on store.
// Every dispatched call is recorded so tests can see which primitive ran and
// in which mode.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use half::{bf16, f16};
use normkit_core::{
    Backend, BackendDevice, BackendStorage, BatchNormMode, DType, LibraryVersion, Result, Status,
    WithDType,
};

use crate::descriptor::TensorDescriptor;
use crate::primitives::{
    Backward, BatchNormPrimitives, ForwardInference, ForwardTraining, PrimitiveOp,
};

/// Where an emulated buffer claims to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmulatedDevice {
    Host,
    Gpu(usize),
}

impl BackendDevice for EmulatedDevice {
    fn name(&self) -> String {
        match self {
            EmulatedDevice::Host => "cpu".to_string(),
            EmulatedDevice::Gpu(n) => format!("cuda:{n}"),
        }
    }

    fn gpu_ordinal(&self) -> Option<usize> {
        match self {
            EmulatedDevice::Host => None,
            EmulatedDevice::Gpu(n) => Some(*n),
        }
    }
}

/// Host buffer of one dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum EmulatedStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl EmulatedStorage {
    fn from_f64(dtype: DType, data: &[f64]) -> Self {
        fn cast<T: WithDType>(data: &[f64]) -> Vec<T> {
            data.iter().map(|&v| T::from_f64(v)).collect()
        }
        match dtype {
            DType::F16 => EmulatedStorage::F16(cast(data)),
            DType::BF16 => EmulatedStorage::BF16(cast(data)),
            DType::F32 => EmulatedStorage::F32(cast(data)),
            DType::F64 => EmulatedStorage::F64(data.to_vec()),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        fn widen<T: WithDType>(data: &[T]) -> Vec<f64> {
            data.iter().map(|&v| WithDType::to_f64(v)).collect()
        }
        match self {
            EmulatedStorage::F16(v) => widen(v),
            EmulatedStorage::BF16(v) => widen(v),
            EmulatedStorage::F32(v) => widen(v),
            EmulatedStorage::F64(v) => v.clone(),
        }
    }

    /// Overwrite the buffer with `values`, keeping its dtype.
    fn store(&mut self, values: &[f64]) {
        *self = EmulatedStorage::from_f64(self.dtype(), values);
    }
}

impl BackendStorage for EmulatedStorage {
    fn dtype(&self) -> DType {
        match self {
            EmulatedStorage::F16(_) => DType::F16,
            EmulatedStorage::BF16(_) => DType::BF16,
            EmulatedStorage::F32(_) => DType::F32,
            EmulatedStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            EmulatedStorage::F16(v) => v.len(),
            EmulatedStorage::BF16(v) => v.len(),
            EmulatedStorage::F32(v) => v.len(),
            EmulatedStorage::F64(v) => v.len(),
        }
    }
}

/// Host-memory backend standing in for GPU memory.
#[derive(Debug, Clone)]
pub struct EmulatedBackend;

impl Backend for EmulatedBackend {
    type Device = EmulatedDevice;
    type Storage = EmulatedStorage;

    fn name() -> &'static str {
        "emulated"
    }

    fn zeros(_device: &EmulatedDevice, dtype: DType, len: usize) -> Result<EmulatedStorage> {
        Ok(EmulatedStorage::from_f64(dtype, &vec![0.0; len]))
    }

    fn from_f64_slice(_device: &EmulatedDevice, dtype: DType, data: &[f64]) -> Result<EmulatedStorage> {
        Ok(EmulatedStorage::from_f64(dtype, data))
    }

    fn to_f64_vec(storage: &EmulatedStorage) -> Result<Vec<f64>> {
        Ok(storage.to_f64_vec())
    }
}

/// Handle of the emulated library: just the GPU it was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatedHandle {
    pub ordinal: usize,
}

/// One call the emulated library executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub op: PrimitiveOp,
    pub mode: BatchNormMode,
    pub ordinal: usize,
    pub data_dims: Vec<i32>,
    pub param_dims: Vec<i32>,
}

/// The emulated primitives library.
#[derive(Debug)]
pub struct EmulatedPrimitives {
    version: LibraryVersion,
    failure: Option<(PrimitiveOp, Status)>,
    handle_queries: AtomicUsize,
    dispatches: Mutex<Vec<Dispatch>>,
}

impl Default for EmulatedPrimitives {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedPrimitives {
    /// Default version: 8.9.7, which has the persistent spatial mode.
    pub const DEFAULT_VERSION: LibraryVersion = LibraryVersion(8907);

    pub fn new() -> Self {
        Self::with_version(Self::DEFAULT_VERSION)
    }

    pub fn with_version(version: LibraryVersion) -> Self {
        Self {
            version,
            failure: None,
            handle_queries: AtomicUsize::new(0),
            dispatches: Mutex::new(Vec::new()),
        }
    }

    /// Make `op` fail with `status` instead of running.
    pub fn with_failure(mut self, op: PrimitiveOp, status: Status) -> Self {
        self.failure = Some((op, status));
        self
    }

    /// How many times a handle was requested.
    pub fn handle_queries(&self) -> usize {
        self.handle_queries.load(Ordering::Relaxed)
    }

    /// Calls executed so far, oldest first.
    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatch_log().clone()
    }

    // A panic while the log was held cannot leave a partial entry behind.
    fn dispatch_log(&self) -> MutexGuard<'_, Vec<Dispatch>> {
        self.dispatches.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn last_dispatch(&self) -> Option<Dispatch> {
        self.dispatches().pop()
    }

    fn begin(
        &self,
        handle: &EmulatedHandle,
        op: PrimitiveOp,
        mode: BatchNormMode,
        data: &TensorDescriptor,
        param: &TensorDescriptor,
    ) -> std::result::Result<(), Status> {
        if let Some((failing, status)) = self.failure {
            if failing == op {
                return Err(status);
            }
        }
        self.dispatch_log().push(Dispatch {
            op,
            mode,
            ordinal: handle.ordinal,
            data_dims: data.dims().to_vec(),
            param_dims: param.dims().to_vec(),
        });
        Ok(())
    }
}

/// How elements map onto statistics for one call.
struct Grouping {
    channels: usize,
    spatial: usize,
    per_activation: bool,
    /// Number of statistics (= parameter elements).
    groups: usize,
    /// Elements reduced into each statistic.
    count: usize,
}

impl Grouping {
    fn new(
        mode: BatchNormMode,
        data: &TensorDescriptor,
        param: &TensorDescriptor,
    ) -> std::result::Result<Self, Status> {
        let dims: Vec<usize> = data.dims().iter().map(|&d| d as usize).collect();
        if dims.len() < 4 || param.rank() != dims.len() {
            return Err(Status::BadParam);
        }
        let (n, channels) = (dims[0], dims[1]);
        let spatial: usize = dims[2..].iter().product();
        let per_activation = !mode.is_spatial();
        let groups = if per_activation {
            channels * spatial
        } else {
            channels
        };
        if param.elem_count() != groups || n == 0 {
            return Err(Status::BadParam);
        }
        // Empty channel or spatial extents have no statistics to compute.
        if groups == 0 || spatial == 0 {
            return Err(Status::BadParam);
        }
        Ok(Grouping {
            channels,
            spatial,
            per_activation,
            groups,
            count: data.elem_count() / groups,
        })
    }

    /// Statistic index of flat element `e` of an NC(spatial) buffer.
    fn group_of(&self, e: usize) -> usize {
        let s = e % self.spatial;
        let c = (e / self.spatial) % self.channels;
        if self.per_activation {
            c * self.spatial + s
        } else {
            c
        }
    }

    /// Per-group biased mean and variance of `x`.
    fn moments(&self, x: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let mut mean = vec![0.0; self.groups];
        for (e, &v) in x.iter().enumerate() {
            mean[self.group_of(e)] += v;
        }
        mean.iter_mut().for_each(|m| *m /= self.count as f64);
        let mut var = vec![0.0; self.groups];
        for (e, &v) in x.iter().enumerate() {
            let g = self.group_of(e);
            var[g] += (v - mean[g]) * (v - mean[g]);
        }
        var.iter_mut().for_each(|v| *v /= self.count as f64);
        (mean, var)
    }

    /// `y = scale * (x - mean) * inv_std + bias`, per group.
    fn normalize(&self, x: &[f64], mean: &[f64], inv_std: &[f64], scale: &[f64], bias: &[f64]) -> Vec<f64> {
        x.iter()
            .enumerate()
            .map(|(e, &v)| {
                let g = self.group_of(e);
                scale[g] * (v - mean[g]) * inv_std[g] + bias[g]
            })
            .collect()
    }
}

fn check_len(storage: &EmulatedStorage, expected: usize) -> std::result::Result<(), Status> {
    if storage.len() == expected {
        Ok(())
    } else {
        Err(Status::BadParam)
    }
}

impl BatchNormPrimitives<EmulatedBackend> for EmulatedPrimitives {
    type Handle = EmulatedHandle;

    fn version(&self) -> LibraryVersion {
        self.version
    }

    fn handle(&self, device: &EmulatedDevice) -> std::result::Result<EmulatedHandle, Status> {
        self.handle_queries.fetch_add(1, Ordering::Relaxed);
        if let Some((PrimitiveOp::Handle, status)) = self.failure {
            return Err(status);
        }
        match device.gpu_ordinal() {
            Some(ordinal) => Ok(EmulatedHandle { ordinal }),
            None => Err(Status::NotInitialized),
        }
    }

    fn forward_training(
        &self,
        handle: &EmulatedHandle,
        args: ForwardTraining<'_, EmulatedBackend>,
    ) -> std::result::Result<(), Status> {
        let grouping = Grouping::new(args.mode, args.x_desc, args.param_desc)?;
        check_len(args.x, args.x_desc.elem_count())?;
        check_len(args.y, args.x_desc.elem_count())?;
        for p in [args.scale, args.bias] {
            check_len(p, grouping.groups)?;
        }
        for p in [
            &*args.running_mean,
            &*args.running_var,
            &*args.save_mean,
            &*args.save_inv_var,
        ] {
            check_len(p, grouping.groups)?;
        }
        self.begin(handle, PrimitiveOp::ForwardTraining, args.mode, args.x_desc, args.param_desc)?;

        let x = args.x.to_f64_vec();
        let (mean, var) = grouping.moments(&x);
        let inv_std: Vec<f64> = var
            .iter()
            .map(|v| 1.0 / (v + args.epsilon).sqrt())
            .collect();
        let y = grouping.normalize(
            &x,
            &mean,
            &inv_std,
            &args.scale.to_f64_vec(),
            &args.bias.to_f64_vec(),
        );

        let f = args.exponential_average_factor;
        let m = grouping.count as f64;
        let unbiased = if grouping.count > 1 { m / (m - 1.0) } else { 1.0 };
        let running_mean: Vec<f64> = args
            .running_mean
            .to_f64_vec()
            .iter()
            .zip(&mean)
            .map(|(old, batch)| old * (1.0 - f) + batch * f)
            .collect();
        let running_var: Vec<f64> = args
            .running_var
            .to_f64_vec()
            .iter()
            .zip(&var)
            .map(|(old, batch)| old * (1.0 - f) + batch * unbiased * f)
            .collect();

        args.y.store(&y);
        args.running_mean.store(&running_mean);
        args.running_var.store(&running_var);
        args.save_mean.store(&mean);
        args.save_inv_var.store(&inv_std);
        Ok(())
    }

    fn forward_inference(
        &self,
        handle: &EmulatedHandle,
        args: ForwardInference<'_, EmulatedBackend>,
    ) -> std::result::Result<(), Status> {
        let grouping = Grouping::new(args.mode, args.x_desc, args.param_desc)?;
        check_len(args.x, args.x_desc.elem_count())?;
        check_len(args.y, args.x_desc.elem_count())?;
        for p in [args.scale, args.bias, args.running_mean, args.running_var] {
            check_len(p, grouping.groups)?;
        }
        self.begin(handle, PrimitiveOp::ForwardInference, args.mode, args.x_desc, args.param_desc)?;

        let inv_std: Vec<f64> = args
            .running_var
            .to_f64_vec()
            .iter()
            .map(|v| 1.0 / (v + args.epsilon).sqrt())
            .collect();
        let y = grouping.normalize(
            &args.x.to_f64_vec(),
            &args.running_mean.to_f64_vec(),
            &inv_std,
            &args.scale.to_f64_vec(),
            &args.bias.to_f64_vec(),
        );
        args.y.store(&y);
        Ok(())
    }

    fn backward(
        &self,
        handle: &EmulatedHandle,
        args: Backward<'_, EmulatedBackend>,
    ) -> std::result::Result<(), Status> {
        let grouping = Grouping::new(args.mode, args.x_desc, args.param_desc)?;
        if args.dy_desc.dims() != args.x_desc.dims() || args.dx_desc.dims() != args.x_desc.dims() {
            return Err(Status::BadParam);
        }
        for buf in [args.x, args.dy, &*args.dx] {
            check_len(buf, args.x_desc.elem_count())?;
        }
        for p in [args.scale, args.save_mean, args.save_inv_var, &*args.d_scale, &*args.d_bias] {
            check_len(p, grouping.groups)?;
        }
        self.begin(handle, PrimitiveOp::Backward, args.mode, args.x_desc, args.param_desc)?;

        let x = args.x.to_f64_vec();
        let dy = args.dy.to_f64_vec();
        let scale = args.scale.to_f64_vec();
        let mean = args.save_mean.to_f64_vec();
        let inv_std = args.save_inv_var.to_f64_vec();

        let x_hat = |e: usize| {
            let g = grouping.group_of(e);
            (x[e] - mean[g]) * inv_std[g]
        };
        let mut d_bias = vec![0.0; grouping.groups];
        let mut d_scale = vec![0.0; grouping.groups];
        for (e, &g_out) in dy.iter().enumerate() {
            let g = grouping.group_of(e);
            d_bias[g] += g_out;
            d_scale[g] += g_out * x_hat(e);
        }
        let m = grouping.count as f64;
        let dx: Vec<f64> = dy
            .iter()
            .enumerate()
            .map(|(e, &g_out)| {
                let g = grouping.group_of(e);
                scale[g] * inv_std[g] / m * (m * g_out - d_bias[g] - x_hat(e) * d_scale[g])
            })
            .collect();

        args.dx.store(&dx);
        args.d_scale.store(&d_scale);
        args.d_bias.store(&d_bias);
        Ok(())
    }
}
