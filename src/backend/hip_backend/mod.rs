//! ROCm/HIP cache backend
//!
//! Binds `libamdhip64` at run time and implements [`CacheBackend`]:
//!
//! - every discrete device gets its default memory pool trimmed to zero
//! - integrated devices (APUs) are reported as unified-memory devices,
//!   for which there is no explicit cache-clear primitive

pub mod ffi;

use std::ffi::c_int;
use std::ptr;

use once_cell::sync::OnceCell;

use crate::backend::dylib::{self, LoadedLibrary};
use crate::backend::CacheBackend;
use crate::error::{ReclaimError, ReclaimResult};

/// HIP entry points resolved from the runtime library
#[derive(Clone, Copy)]
struct HipApi {
    init: ffi::HipInitFn,
    get_device_count: ffi::HipGetDeviceCountFn,
    get_device: ffi::HipGetDeviceFn,
    set_device: ffi::HipSetDeviceFn,
    device_get_attribute: ffi::HipDeviceGetAttributeFn,
    device_synchronize: ffi::HipDeviceSynchronizeFn,
    get_error_string: ffi::HipGetErrorStringFn,
    // Stream-ordered allocator entry points (ROCm 5.2+)
    device_get_default_mem_pool: Option<ffi::HipDeviceGetDefaultMemPoolFn>,
    mem_pool_trim_to: Option<ffi::HipMemPoolTrimToFn>,
}

impl HipApi {
    /// # Safety
    /// `library` must export the HIP runtime ABI described in [`ffi`].
    unsafe fn resolve(library: &LoadedLibrary) -> ReclaimResult<Self> {
        Ok(HipApi {
            init: library.required("hipInit")?,
            get_device_count: library.required("hipGetDeviceCount")?,
            get_device: library.required("hipGetDevice")?,
            set_device: library.required("hipSetDevice")?,
            device_get_attribute: library.required("hipDeviceGetAttribute")?,
            device_synchronize: library.required("hipDeviceSynchronize")?,
            get_error_string: library.required("hipGetErrorString")?,
            device_get_default_mem_pool: library.optional("hipDeviceGetDefaultMemPool"),
            mem_pool_trim_to: library.optional("hipMemPoolTrimTo"),
        })
    }
}

/// HIP runtime loaded from a shared library
pub struct HipRuntime {
    api: HipApi,
    library_name: String,
    // Keeps the code behind `api` mapped
    _library: Option<LoadedLibrary>,
    initialized: OnceCell<Result<(), ReclaimError>>,
}

impl HipRuntime {
    /// Probe for the HIP runtime
    ///
    /// Returns `Ok(None)` when none of `candidates` can be opened, and an
    /// error when a library opened but lacks a required entry point.
    pub fn probe(candidates: &[String]) -> ReclaimResult<Option<Self>> {
        let library = match dylib::open_first(candidates) {
            Some(library) => library,
            None => {
                tracing::debug!("HIP runtime not found, tried {:?}", candidates);
                return Ok(None);
            }
        };

        // SAFETY: every type alias in `ffi` mirrors the HIP runtime header.
        let api = unsafe { HipApi::resolve(&library)? };
        let name = library.name().to_string();
        tracing::debug!("HIP runtime bound from {}", name);
        Ok(Some(Self::from_api(api, name, Some(library))))
    }

    fn from_api(api: HipApi, library_name: String, library: Option<LoadedLibrary>) -> Self {
        HipRuntime {
            api,
            library_name,
            _library: library,
            initialized: OnceCell::new(),
        }
    }

    /// Number of visible HIP devices (0 when the runtime reports none)
    pub fn device_count(&self) -> ReclaimResult<usize> {
        match self.ensure_initialized() {
            Ok(()) => {}
            Err(ReclaimError::RuntimeCall { code, .. }) if code == ffi::HIP_ERROR_NO_DEVICE => {
                return Ok(0)
            }
            Err(e) => return Err(e),
        }

        let mut count: c_int = 0;
        // SAFETY: `count` is a valid out-pointer for the duration of the call.
        let code = unsafe { (self.api.get_device_count)(&mut count) };
        if code == ffi::HIP_ERROR_NO_DEVICE {
            return Ok(0);
        }
        self.check("hipGetDeviceCount", code)?;
        Ok(count.max(0) as usize)
    }

    /// Whether device `ordinal` is an integrated (host-memory) device
    pub fn is_integrated(&self, ordinal: i32) -> ReclaimResult<bool> {
        let mut value: c_int = 0;
        // SAFETY: `value` is a valid out-pointer; ordinal validity is checked by HIP.
        let code = unsafe {
            (self.api.device_get_attribute)(
                &mut value,
                ffi::HIP_DEVICE_ATTRIBUTE_INTEGRATED,
                ordinal,
            )
        };
        self.check("hipDeviceGetAttribute", code)
            .map_err(|e| ReclaimError::Device {
                device: format!("hip:{}", ordinal),
                reason: e.to_string(),
            })?;
        Ok(value != 0)
    }

    /// Integrated flag for every visible device
    fn integrated_flags(&self) -> ReclaimResult<Vec<bool>> {
        let count = self.device_count()?;
        (0..count as i32).map(|ordinal| self.is_integrated(ordinal)).collect()
    }

    /// Synchronize `ordinal` and trim its default pool to zero
    fn trim_device(
        &self,
        ordinal: c_int,
        get_pool: ffi::HipDeviceGetDefaultMemPoolFn,
        trim_to: ffi::HipMemPoolTrimToFn,
    ) -> ReclaimResult<()> {
        // SAFETY: takes no pointers; ordinal validity is checked by HIP.
        self.check("hipSetDevice", unsafe { (self.api.set_device)(ordinal) })?;

        // Pending frees only return to the pool once the device is idle
        // SAFETY: no arguments.
        self.check("hipDeviceSynchronize", unsafe {
            (self.api.device_synchronize)()
        })?;

        let mut pool: ffi::HipMemPool = ptr::null_mut();
        // SAFETY: `pool` is a valid out-pointer.
        self.check("hipDeviceGetDefaultMemPool", unsafe {
            get_pool(&mut pool, ordinal)
        })?;

        // SAFETY: `pool` was just returned by the runtime for this device.
        self.check("hipMemPoolTrimTo", unsafe { trim_to(pool, 0) })
    }

    fn ensure_initialized(&self) -> ReclaimResult<()> {
        self.initialized
            .get_or_init(|| {
                // SAFETY: hipInit takes no pointers and is idempotent.
                let code = unsafe { (self.api.init)(0) };
                self.check("hipInit", code)
            })
            .clone()
    }

    fn check(&self, api: &str, code: c_int) -> ReclaimResult<()> {
        if code == ffi::HIP_SUCCESS {
            return Ok(());
        }
        // SAFETY: hipGetErrorString returns a static string for any code.
        let message = unsafe { dylib::c_message((self.api.get_error_string)(code)) };
        Err(ReclaimError::runtime_call(api, code, message))
    }

    fn missing(&self, symbol: &str) -> ReclaimError {
        ReclaimError::SymbolMissing {
            library: self.library_name.clone(),
            symbol: symbol.to_string(),
        }
    }
}

impl CacheBackend for HipRuntime {
    fn name(&self) -> &str {
        "HIP"
    }

    fn library(&self) -> Option<&str> {
        Some(&self.library_name)
    }

    fn gpu_available(&self) -> ReclaimResult<bool> {
        Ok(self.integrated_flags()?.iter().any(|integrated| !integrated))
    }

    fn unified_memory_available(&self) -> ReclaimResult<bool> {
        Ok(self.integrated_flags()?.iter().any(|integrated| *integrated))
    }

    /// Trim the default pool of every discrete device
    ///
    /// A failing device does not stop the others; all failures are
    /// returned together once every device was attempted. The caller's
    /// current device is restored afterwards.
    fn empty_cache(&self) -> ReclaimResult<()> {
        let get_pool = self
            .api
            .device_get_default_mem_pool
            .ok_or_else(|| self.missing("hipDeviceGetDefaultMemPool"))?;
        let trim_to = self
            .api
            .mem_pool_trim_to
            .ok_or_else(|| self.missing("hipMemPoolTrimTo"))?;
        let flags = self.integrated_flags()?;

        let mut current: c_int = 0;
        // SAFETY: `current` is a valid out-pointer.
        self.check("hipGetDevice", unsafe { (self.api.get_device)(&mut current) })?;

        let mut failures = Vec::new();
        for (ordinal, _) in flags.iter().enumerate().filter(|(_, integrated)| !**integrated) {
            let ordinal = ordinal as c_int;
            match self.trim_device(ordinal, get_pool, trim_to) {
                Ok(()) => tracing::debug!("Trimmed HIP default memory pool on hip:{}", ordinal),
                Err(e) => failures.push((format!("hip:{}", ordinal), e.to_string())),
            }
        }

        // SAFETY: `current` came from hipGetDevice.
        if let Err(e) = self.check("hipSetDevice", unsafe { (self.api.set_device)(current) }) {
            failures.push((
                format!("hip:{}", current),
                format!("restoring current device: {}", e),
            ));
        }

        if failures.is_empty() {
            return Ok(());
        }
        let (devices, reasons): (Vec<String>, Vec<String>) = failures.into_iter().unzip();
        Err(ReclaimError::Device {
            device: devices.join(", "),
            reason: reasons.join("; "),
        })
    }
}
