// cuDNN binding: the real primitives library, through cudarc
//
// Built only with the `cudnn` feature. `CudaBackend` keeps tensor data in
// cudarc device slices (F16/BF16 stored as raw u16 bits), and
// `CudnnPrimitives` forwards each batch-norm call to cuDNN with tensor
// descriptors created for the duration of the call.
//
// One cuDNN handle is created per `CudnnPrimitives`, bound to the stream of
// the device it was created for; asking for a handle on another device is a
// `NotInitialized` status.

use std::ffi::{c_int, c_void};
use std::fmt;
use std::sync::Arc;

use cudarc::cudnn::{result as cudnn_result, sys, CudnnError};
use cudarc::driver::{CudaContext, CudaSlice, CudaStream, DevicePtr, DevicePtrMut, SyncOnDrop};
use half::{bf16, f16};
use normkit_core::{
    Backend, BackendDevice, BackendStorage, BatchNormMode, DType, Error, LibraryVersion, Result,
    Status, WithDType,
};

use crate::descriptor::{DataType, TensorDescriptor};
use crate::primitives::{Backward, BatchNormPrimitives, ForwardInference, ForwardTraining};

/// A CUDA device and the stream work is issued on.
#[derive(Clone)]
pub struct CudaDevice {
    stream: Arc<CudaStream>,
    ordinal: usize,
}

impl CudaDevice {
    pub fn new(ordinal: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal)
            .map_err(|e| Error::msg(format!("CUDA device creation failed: {e}")))?;
        Ok(CudaDevice {
            stream: ctx.default_stream(),
            ordinal,
        })
    }

    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaDevice({})", self.ordinal)
    }
}

impl PartialEq for CudaDevice {
    fn eq(&self, other: &Self) -> bool {
        self.ordinal == other.ordinal
    }
}

impl BackendDevice for CudaDevice {
    fn name(&self) -> String {
        format!("cuda:{}", self.ordinal)
    }

    fn gpu_ordinal(&self) -> Option<usize> {
        Some(self.ordinal)
    }
}

/// Device memory of one dtype.
pub enum CudaStorage {
    F16(CudaSlice<u16>),
    BF16(CudaSlice<u16>),
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
}

impl BackendStorage for CudaStorage {
    fn dtype(&self) -> DType {
        match self {
            CudaStorage::F16(_) => DType::F16,
            CudaStorage::BF16(_) => DType::BF16,
            CudaStorage::F32(_) => DType::F32,
            CudaStorage::F64(_) => DType::F64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CudaStorage::F16(s) | CudaStorage::BF16(s) => s.len(),
            CudaStorage::F32(s) => s.len(),
            CudaStorage::F64(s) => s.len(),
        }
    }
}

fn driver_err(e: impl fmt::Display) -> Error {
    Error::msg(format!("CUDA driver error: {e}"))
}

#[derive(Debug, Clone)]
pub struct CudaBackend;

impl Backend for CudaBackend {
    type Device = CudaDevice;
    type Storage = CudaStorage;

    fn name() -> &'static str {
        "cuda"
    }

    fn zeros(device: &CudaDevice, dtype: DType, len: usize) -> Result<CudaStorage> {
        let s = &device.stream;
        Ok(match dtype {
            DType::F16 => CudaStorage::F16(s.alloc_zeros::<u16>(len).map_err(driver_err)?),
            DType::BF16 => CudaStorage::BF16(s.alloc_zeros::<u16>(len).map_err(driver_err)?),
            DType::F32 => CudaStorage::F32(s.alloc_zeros::<f32>(len).map_err(driver_err)?),
            DType::F64 => CudaStorage::F64(s.alloc_zeros::<f64>(len).map_err(driver_err)?),
        })
    }

    fn from_f64_slice(device: &CudaDevice, dtype: DType, data: &[f64]) -> Result<CudaStorage> {
        let s = &device.stream;
        Ok(match dtype {
            DType::F16 => {
                let bits: Vec<u16> = data.iter().map(|&v| f16::from_f64(v).to_bits()).collect();
                CudaStorage::F16(s.memcpy_stod(&bits).map_err(driver_err)?)
            }
            DType::BF16 => {
                let bits: Vec<u16> = data.iter().map(|&v| bf16::from_f64(v).to_bits()).collect();
                CudaStorage::BF16(s.memcpy_stod(&bits).map_err(driver_err)?)
            }
            DType::F32 => {
                let host: Vec<f32> = data.iter().map(|&v| v as f32).collect();
                CudaStorage::F32(s.memcpy_stod(&host).map_err(driver_err)?)
            }
            DType::F64 => CudaStorage::F64(s.memcpy_stod(data).map_err(driver_err)?),
        })
    }

    fn to_f64_vec(storage: &CudaStorage) -> Result<Vec<f64>> {
        Ok(match storage {
            CudaStorage::F16(v) => {
                let bits = v.stream().memcpy_dtov(v).map_err(driver_err)?;
                bits.into_iter().map(|b| f16::from_bits(b).to_f64()).collect()
            }
            CudaStorage::BF16(v) => {
                let bits = v.stream().memcpy_dtov(v).map_err(driver_err)?;
                bits.into_iter().map(|b| bf16::from_bits(b).to_f64()).collect()
            }
            CudaStorage::F32(v) => {
                let host = v.stream().memcpy_dtov(v).map_err(driver_err)?;
                host.into_iter().map(WithDType::to_f64).collect()
            }
            CudaStorage::F64(v) => v.stream().memcpy_dtov(v).map_err(driver_err)?,
        })
    }
}

fn status(e: CudnnError) -> Status {
    Status::from_code(e.0 as i32).unwrap_or(Status::InternalError)
}

fn data_type(t: DataType) -> sys::cudnnDataType_t {
    match t {
        DataType::Half => sys::cudnnDataType_t::CUDNN_DATA_HALF,
        DataType::BFloat16 => sys::cudnnDataType_t::CUDNN_DATA_BFLOAT16,
        DataType::Float => sys::cudnnDataType_t::CUDNN_DATA_FLOAT,
        DataType::Double => sys::cudnnDataType_t::CUDNN_DATA_DOUBLE,
    }
}

fn mode(m: BatchNormMode) -> sys::cudnnBatchNormMode_t {
    match m {
        BatchNormMode::PerActivation => sys::cudnnBatchNormMode_t::CUDNN_BATCHNORM_PER_ACTIVATION,
        BatchNormMode::Spatial => sys::cudnnBatchNormMode_t::CUDNN_BATCHNORM_SPATIAL,
        BatchNormMode::SpatialPersistent => {
            sys::cudnnBatchNormMode_t::CUDNN_BATCHNORM_SPATIAL_PERSISTENT
        }
    }
}

/// A cuDNN tensor descriptor, destroyed on drop.
struct Desc(sys::cudnnTensorDescriptor_t);

impl Desc {
    fn new(d: &TensorDescriptor) -> std::result::Result<Self, Status> {
        let desc = Desc(cudnn_result::create_tensor_descriptor().map_err(status)?);
        unsafe {
            cudnn_result::set_tensor_nd_descriptor(
                desc.0,
                data_type(d.data_type()),
                d.rank() as c_int,
                d.dims().as_ptr(),
                d.strides().as_ptr(),
            )
        }
        .map_err(status)?;
        Ok(desc)
    }
}

impl Drop for Desc {
    fn drop(&mut self) {
        unsafe {
            let _ = cudnn_result::destroy_tensor_descriptor(self.0);
        }
    }
}

/// Scaling constants (1, 0) in the library's compute type for `t`.
enum Scaling {
    Single(f32, f32),
    Double(f64, f64),
}

impl Scaling {
    fn for_type(t: DataType) -> Self {
        match t {
            DataType::Double => Scaling::Double(1.0, 0.0),
            _ => Scaling::Single(1.0, 0.0),
        }
    }

    fn one(&self) -> *const c_void {
        match self {
            Scaling::Single(one, _) => one as *const f32 as *const c_void,
            Scaling::Double(one, _) => one as *const f64 as *const c_void,
        }
    }

    fn zero(&self) -> *const c_void {
        match self {
            Scaling::Single(_, zero) => zero as *const f32 as *const c_void,
            Scaling::Double(_, zero) => zero as *const f64 as *const c_void,
        }
    }
}

fn ptr<'a>(s: &'a CudaStorage, stream: &'a CudaStream) -> (*const c_void, SyncOnDrop<'a>) {
    let (p, guard) = match s {
        CudaStorage::F16(v) | CudaStorage::BF16(v) => v.device_ptr(stream),
        CudaStorage::F32(v) => v.device_ptr(stream),
        CudaStorage::F64(v) => v.device_ptr(stream),
    };
    (p as *const c_void, guard)
}

fn ptr_mut<'a>(s: &'a mut CudaStorage, stream: &'a CudaStream) -> (*mut c_void, SyncOnDrop<'a>) {
    let (p, guard) = match s {
        CudaStorage::F16(v) | CudaStorage::BF16(v) => v.device_ptr_mut(stream),
        CudaStorage::F32(v) => v.device_ptr_mut(stream),
        CudaStorage::F64(v) => v.device_ptr_mut(stream),
    };
    (p as *mut c_void, guard)
}

/// cuDNN as a [`BatchNormPrimitives`] library.
pub struct CudnnPrimitives {
    handle: sys::cudnnHandle_t,
    device: CudaDevice,
    version: LibraryVersion,
}

impl CudnnPrimitives {
    /// Create a cuDNN handle bound to `device`'s stream.
    pub fn new(device: &CudaDevice) -> Result<Self> {
        let handle = cudnn_result::create_handle()
            .map_err(|e| Error::msg(format!("cuDNN init failed: {e:?}")))?;
        unsafe { cudnn_result::set_stream(handle, device.stream.cu_stream() as sys::cudaStream_t) }
            .map_err(|e| Error::msg(format!("cuDNN set stream failed: {e:?}")))?;
        let version = LibraryVersion(unsafe { sys::cudnnGetVersion() } as u32);
        Ok(CudnnPrimitives {
            handle,
            device: device.clone(),
            version,
        })
    }
}

impl Drop for CudnnPrimitives {
    fn drop(&mut self) {
        unsafe {
            let _ = cudnn_result::destroy_handle(self.handle);
        }
    }
}

impl BatchNormPrimitives<CudaBackend> for CudnnPrimitives {
    type Handle = sys::cudnnHandle_t;

    fn version(&self) -> LibraryVersion {
        self.version
    }

    fn handle(&self, device: &CudaDevice) -> std::result::Result<sys::cudnnHandle_t, Status> {
        if device.ordinal != self.device.ordinal {
            return Err(Status::NotInitialized);
        }
        Ok(self.handle)
    }

    fn forward_training(
        &self,
        handle: &sys::cudnnHandle_t,
        args: ForwardTraining<'_, CudaBackend>,
    ) -> std::result::Result<(), Status> {
        let stream = &*self.device.stream;
        let x_desc = Desc::new(args.x_desc)?;
        let p_desc = Desc::new(args.param_desc)?;
        let scaling = Scaling::for_type(args.x_desc.data_type());
        let (x, _gx) = ptr(args.x, stream);
        let (y, _gy) = ptr_mut(args.y, stream);
        let (scale, _gs) = ptr(args.scale, stream);
        let (bias, _gb) = ptr(args.bias, stream);
        let (rm, _grm) = ptr_mut(args.running_mean, stream);
        let (rv, _grv) = ptr_mut(args.running_var, stream);
        let (sm, _gsm) = ptr_mut(args.save_mean, stream);
        let (sv, _gsv) = ptr_mut(args.save_inv_var, stream);
        unsafe {
            sys::cudnnBatchNormalizationForwardTraining(
                *handle,
                mode(args.mode),
                scaling.one(),
                scaling.zero(),
                x_desc.0,
                x,
                x_desc.0,
                y,
                p_desc.0,
                scale,
                bias,
                args.exponential_average_factor,
                rm,
                rv,
                args.epsilon,
                sm,
                sv,
            )
        }
        .result()
        .map_err(status)
    }

    fn forward_inference(
        &self,
        handle: &sys::cudnnHandle_t,
        args: ForwardInference<'_, CudaBackend>,
    ) -> std::result::Result<(), Status> {
        let stream = &*self.device.stream;
        let x_desc = Desc::new(args.x_desc)?;
        let p_desc = Desc::new(args.param_desc)?;
        let scaling = Scaling::for_type(args.x_desc.data_type());
        let (x, _gx) = ptr(args.x, stream);
        let (y, _gy) = ptr_mut(args.y, stream);
        let (scale, _gs) = ptr(args.scale, stream);
        let (bias, _gb) = ptr(args.bias, stream);
        let (rm, _grm) = ptr(args.running_mean, stream);
        let (rv, _grv) = ptr(args.running_var, stream);
        unsafe {
            sys::cudnnBatchNormalizationForwardInference(
                *handle,
                mode(args.mode),
                scaling.one(),
                scaling.zero(),
                x_desc.0,
                x,
                x_desc.0,
                y,
                p_desc.0,
                scale,
                bias,
                rm,
                rv,
                args.epsilon,
            )
        }
        .result()
        .map_err(status)
    }

    fn backward(
        &self,
        handle: &sys::cudnnHandle_t,
        args: Backward<'_, CudaBackend>,
    ) -> std::result::Result<(), Status> {
        let stream = &*self.device.stream;
        let x_desc = Desc::new(args.x_desc)?;
        let dy_desc = Desc::new(args.dy_desc)?;
        let dx_desc = Desc::new(args.dx_desc)?;
        let p_desc = Desc::new(args.param_desc)?;
        let scaling = Scaling::for_type(args.x_desc.data_type());
        let (x, _gx) = ptr(args.x, stream);
        let (dy, _gdy) = ptr(args.dy, stream);
        let (dx, _gdx) = ptr_mut(args.dx, stream);
        let (scale, _gs) = ptr(args.scale, stream);
        let (d_scale, _gds) = ptr_mut(args.d_scale, stream);
        let (d_bias, _gdb) = ptr_mut(args.d_bias, stream);
        let (sm, _gsm) = ptr(args.save_mean, stream);
        let (sv, _gsv) = ptr(args.save_inv_var, stream);
        unsafe {
            sys::cudnnBatchNormalizationBackward(
                *handle,
                mode(args.mode),
                scaling.one(),
                scaling.zero(),
                scaling.one(),
                scaling.zero(),
                x_desc.0,
                x,
                dy_desc.0,
                dy,
                dx_desc.0,
                dx,
                p_desc.0,
                scale,
                d_scale,
                d_bias,
                args.epsilon,
                sm,
                sv,
            )
        }
        .result()
        .map_err(status)
    }
}
