//! HIP FFI signatures
//!
//! Function pointer types for the subset of the HIP runtime API used to
//! release cached device memory. Resolved from `libamdhip64` at run time,
//! so nothing here is linked at build time.

use std::ffi::{c_char, c_int, c_void};

/// `hipMemPool_t`
pub type HipMemPool = *mut c_void;

pub type HipInitFn = unsafe extern "C" fn(flags: u32) -> c_int;
pub type HipGetDeviceCountFn = unsafe extern "C" fn(count: *mut c_int) -> c_int;
pub type HipGetDeviceFn = unsafe extern "C" fn(device: *mut c_int) -> c_int;
pub type HipSetDeviceFn = unsafe extern "C" fn(device: c_int) -> c_int;
pub type HipDeviceGetAttributeFn =
    unsafe extern "C" fn(value: *mut c_int, attr: c_int, device: c_int) -> c_int;
pub type HipDeviceSynchronizeFn = unsafe extern "C" fn() -> c_int;
pub type HipGetErrorStringFn = unsafe extern "C" fn(error: c_int) -> *const c_char;
pub type HipDeviceGetDefaultMemPoolFn =
    unsafe extern "C" fn(pool: *mut HipMemPool, device: c_int) -> c_int;
pub type HipMemPoolTrimToFn =
    unsafe extern "C" fn(pool: HipMemPool, min_bytes_to_hold: usize) -> c_int;

/// HIP success code
pub const HIP_SUCCESS: c_int = 0;

/// `hipErrorNoDevice`
pub const HIP_ERROR_NO_DEVICE: c_int = 100;

/// `hipDeviceAttributeIntegrated` (APU sharing memory with the host)
pub const HIP_DEVICE_ATTRIBUTE_INTEGRATED: c_int = 16;
