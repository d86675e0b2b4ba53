//! CUDA device statistics backend
//!
//! Binds `libcudart` at run time and implements [`DeviceStatsBackend`] by
//! resetting the peak-usage watermarks of each device's default memory pool.

pub mod ffi;

use std::ffi::{c_int, c_void};
use std::ptr;

use crate::backend::dylib::{self, LoadedLibrary};
use crate::backend::{DeviceStatsBackend, PhysicalDevice};
use crate::error::{ReclaimError, ReclaimResult};

/// Watermarks cleared by a statistics reset
const RESET_ATTRIBUTES: [(c_int, &str); 2] = [
    (ffi::CUDA_MEM_POOL_ATTR_RESERVED_MEM_HIGH, "ReservedMemHigh"),
    (ffi::CUDA_MEM_POOL_ATTR_USED_MEM_HIGH, "UsedMemHigh"),
];

#[derive(Clone, Copy)]
struct CudaApi {
    get_device_count: ffi::CudaGetDeviceCountFn,
    device_get_default_mem_pool: ffi::CudaDeviceGetDefaultMemPoolFn,
    mem_pool_set_attribute: ffi::CudaMemPoolSetAttributeFn,
    get_error_string: ffi::CudaGetErrorStringFn,
}

impl CudaApi {
    /// # Safety
    /// `library` must export the CUDA runtime ABI described in [`ffi`].
    unsafe fn resolve(library: &LoadedLibrary) -> ReclaimResult<Self> {
        Ok(CudaApi {
            get_device_count: library.required("cudaGetDeviceCount")?,
            device_get_default_mem_pool: library.required("cudaDeviceGetDefaultMemPool")?,
            mem_pool_set_attribute: library.required("cudaMemPoolSetAttribute")?,
            get_error_string: library.required("cudaGetErrorString")?,
        })
    }
}

/// CUDA runtime loaded from a shared library
pub struct CudaRuntime {
    api: CudaApi,
    library_name: String,
    _library: Option<LoadedLibrary>,
}

impl CudaRuntime {
    /// Probe for the CUDA runtime
    ///
    /// Returns `Ok(None)` when none of `candidates` can be opened. A runtime
    /// without the memory-pool API (pre 11.2) is an error: it cannot reset
    /// statistics at all.
    pub fn probe(candidates: &[String]) -> ReclaimResult<Option<Self>> {
        let library = match dylib::open_first(candidates) {
            Some(library) => library,
            None => {
                tracing::debug!("CUDA runtime not found, tried {:?}", candidates);
                return Ok(None);
            }
        };

        // SAFETY: every type alias in `ffi` mirrors the CUDA runtime header.
        let api = unsafe { CudaApi::resolve(&library)? };
        let name = library.name().to_string();
        tracing::debug!("CUDA runtime bound from {}", name);
        Ok(Some(Self::from_api(api, name, Some(library))))
    }

    fn from_api(api: CudaApi, library_name: String, library: Option<LoadedLibrary>) -> Self {
        CudaRuntime {
            api,
            library_name,
            _library: library,
        }
    }

    /// Number of visible CUDA devices (0 when no device or driver is usable)
    pub fn device_count(&self) -> ReclaimResult<usize> {
        let mut count: c_int = 0;
        // SAFETY: `count` is a valid out-pointer for the duration of the call.
        let code = unsafe { (self.api.get_device_count)(&mut count) };
        match code {
            ffi::CUDA_ERROR_NO_DEVICE | ffi::CUDA_ERROR_INSUFFICIENT_DRIVER => {
                tracing::debug!("CUDA reports no usable device (code {})", code);
                Ok(0)
            }
            _ => {
                self.check("cudaGetDeviceCount", code)?;
                Ok(count.max(0) as usize)
            }
        }
    }

    fn check(&self, api: &str, code: c_int) -> ReclaimResult<()> {
        if code == ffi::CUDA_SUCCESS {
            return Ok(());
        }
        // SAFETY: cudaGetErrorString returns a static string for any code.
        let message = unsafe { dylib::c_message((self.api.get_error_string)(code)) };
        Err(ReclaimError::runtime_call(api, code, message))
    }
}

impl DeviceStatsBackend for CudaRuntime {
    fn name(&self) -> &str {
        "CUDA"
    }

    fn library(&self) -> Option<&str> {
        Some(&self.library_name)
    }

    fn physical_gpus(&self) -> ReclaimResult<Vec<PhysicalDevice>> {
        let count = self.device_count()?;
        Ok((0..count as i32)
            .map(|ordinal| PhysicalDevice::new(ordinal, format!("cuda:{}", ordinal)))
            .collect())
    }

    fn reset_memory_stats(&self, device: &PhysicalDevice) -> ReclaimResult<()> {
        let device_error = |e: ReclaimError| ReclaimError::Device {
            device: device.label.clone(),
            reason: e.to_string(),
        };

        let mut pool: ffi::CudaMemPool = ptr::null_mut();
        // SAFETY: `pool` is a valid out-pointer; the ordinal is validated by CUDA.
        let code = unsafe { (self.api.device_get_default_mem_pool)(&mut pool, device.ordinal) };
        self.check("cudaDeviceGetDefaultMemPool", code)
            .map_err(device_error)?;

        for (attr, attr_name) in RESET_ATTRIBUTES {
            // High watermarks only accept 0
            let mut zero: u64 = 0;
            // SAFETY: both watermark attributes take a `cuuint64_t*`.
            let code = unsafe {
                (self.api.mem_pool_set_attribute)(pool, attr, &mut zero as *mut u64 as *mut c_void)
            };
            self.check("cudaMemPoolSetAttribute", code)
                .map_err(device_error)?;
            tracing::trace!("Reset {} on {}", attr_name, device);
        }

        Ok(())
    }
}
