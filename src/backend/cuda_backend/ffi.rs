//! CUDA runtime FFI signatures
//!
//! Only the memory-pool statistics entry points are bound. Resolved from
//! `libcudart` at run time.

use std::ffi::{c_char, c_int, c_void};

/// `cudaMemPool_t`
pub type CudaMemPool = *mut c_void;

pub type CudaGetDeviceCountFn = unsafe extern "C" fn(count: *mut c_int) -> c_int;
pub type CudaDeviceGetDefaultMemPoolFn =
    unsafe extern "C" fn(pool: *mut CudaMemPool, device: c_int) -> c_int;
pub type CudaMemPoolSetAttributeFn =
    unsafe extern "C" fn(pool: CudaMemPool, attr: c_int, value: *mut c_void) -> c_int;
pub type CudaGetErrorStringFn = unsafe extern "C" fn(error: c_int) -> *const c_char;

/// `cudaSuccess`
pub const CUDA_SUCCESS: c_int = 0;

/// `cudaErrorInsufficientDriver`
pub const CUDA_ERROR_INSUFFICIENT_DRIVER: c_int = 35;

/// `cudaErrorNoDevice`
pub const CUDA_ERROR_NO_DEVICE: c_int = 100;

/// `cudaMemPoolAttrReservedMemHigh` (peak reserved bytes, resettable to 0)
pub const CUDA_MEM_POOL_ATTR_RESERVED_MEM_HIGH: c_int = 6;

/// `cudaMemPoolAttrUsedMemHigh` (peak used bytes, resettable to 0)
pub const CUDA_MEM_POOL_ATTR_USED_MEM_HIGH: c_int = 8;
