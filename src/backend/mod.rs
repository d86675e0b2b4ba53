//! GPU runtime backends
//!
//! Two seams are exposed here, one per kind of reclaim request:
//!
//! - [`CacheBackend`]: a runtime that keeps a device memory cache and can be
//!   asked to empty it (HIP).
//! - [`DeviceStatsBackend`]: a runtime that enumerates physical devices and
//!   can reset their memory statistics (CUDA).
//!
//! Neither runtime is linked at build time. Each one is opened with
//! `libloading` when probed, and a missing library is reported as
//! [`Probed::Absent`] rather than an error.

pub mod cuda_backend;
pub(crate) mod dylib;
pub mod hip_backend;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{ReclaimError, ReclaimResult};

pub use cuda_backend::CudaRuntime;
pub use hip_backend::HipRuntime;

/// Runtime with an on-device memory cache that can be emptied
pub trait CacheBackend: Send + Sync {
    /// Short backend name used in log records
    fn name(&self) -> &str;

    /// Shared library the backend was loaded from, if any
    fn library(&self) -> Option<&str> {
        None
    }

    /// Whether a discrete GPU device is active
    fn gpu_available(&self) -> ReclaimResult<bool>;

    /// Whether a unified-memory (host-shared) device is active
    ///
    /// Such devices have no explicit cache-clear primitive.
    fn unified_memory_available(&self) -> ReclaimResult<bool>;

    /// Release cached device memory back to the allocator
    fn empty_cache(&self) -> ReclaimResult<()>;
}

/// Runtime that tracks per-device memory statistics
pub trait DeviceStatsBackend: Send + Sync {
    /// Short backend name used in log records
    fn name(&self) -> &str;

    /// Shared library the backend was loaded from, if any
    fn library(&self) -> Option<&str> {
        None
    }

    /// Enumerate physical GPU devices
    fn physical_gpus(&self) -> ReclaimResult<Vec<PhysicalDevice>>;

    /// Reset the memory statistics of one device
    fn reset_memory_stats(&self, device: &PhysicalDevice) -> ReclaimResult<()>;
}

/// Physical device handle as reported by a backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PhysicalDevice {
    /// Runtime device ordinal
    pub ordinal: i32,
    /// Printable label, e.g. `cuda:0`
    pub label: String,
}

impl PhysicalDevice {
    pub fn new(ordinal: i32, label: impl Into<String>) -> Self {
        Self {
            ordinal,
            label: label.into(),
        }
    }
}

impl fmt::Display for PhysicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Outcome of probing for an optional backend
pub enum Probed<T: ?Sized> {
    /// The runtime library is not installed
    Absent,
    /// The runtime is loaded and usable
    Ready(Arc<T>),
    /// The runtime library is installed but unusable
    Broken(ReclaimError),
}

impl<T: ?Sized> Probed<T> {
    /// Convert a probe result into a [`Probed`] value
    pub fn from_probe(result: ReclaimResult<Option<Arc<T>>>) -> Self {
        match result {
            Ok(Some(backend)) => Probed::Ready(backend),
            Ok(None) => Probed::Absent,
            Err(e) => Probed::Broken(e),
        }
    }

    /// Short description for status output
    pub fn describe(&self) -> String {
        match self {
            Probed::Absent => "absent".to_string(),
            Probed::Ready(_) => "ready".to_string(),
            Probed::Broken(e) => format!("broken: {}", e),
        }
    }
}

impl<T: ?Sized> Clone for Probed<T> {
    fn clone(&self) -> Self {
        match self {
            Probed::Absent => Probed::Absent,
            Probed::Ready(backend) => Probed::Ready(Arc::clone(backend)),
            Probed::Broken(e) => Probed::Broken(e.clone()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Probed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Probed::Absent => f.write_str("Absent"),
            Probed::Ready(_) => f.write_str("Ready(..)"),
            Probed::Broken(e) => f.debug_tuple("Broken").field(e).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCache;

    impl CacheBackend for NoopCache {
        fn name(&self) -> &str {
            "noop"
        }
        fn gpu_available(&self) -> ReclaimResult<bool> {
            Ok(false)
        }
        fn unified_memory_available(&self) -> ReclaimResult<bool> {
            Ok(false)
        }
        fn empty_cache(&self) -> ReclaimResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_probed_from_result() {
        let ready: Probed<dyn CacheBackend> =
            Probed::from_probe(Ok(Some(Arc::new(NoopCache) as Arc<dyn CacheBackend>)));
        assert!(matches!(&ready, Probed::Ready(backend) if backend.library().is_none()));
        assert_eq!(ready.describe(), "ready");

        let absent: Probed<dyn CacheBackend> = Probed::from_probe(Ok(None));
        assert!(matches!(absent, Probed::Absent));
        assert_eq!(absent.describe(), "absent");

        let broken: Probed<dyn CacheBackend> =
            Probed::from_probe(Err(ReclaimError::Internal("boom".to_string())));
        assert_eq!(broken.describe(), "broken: Internal error: boom");
    }

    #[test]
    fn test_physical_device_display_uses_label() {
        let device = PhysicalDevice::new(3, "cuda:3");
        assert_eq!(device.to_string(), "cuda:3");
        assert_eq!(device.ordinal, 3);
    }
}
