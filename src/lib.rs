//! memreclaim - GPU and host memory reclamation
//!
//! Best-effort release of cached device memory held by optional GPU
//! runtimes, followed by a host heap trim. Host applications call
//! [`clear_gpu_memory`] between processing stages to lower peak memory use.
//!
//! Neither the HIP nor the CUDA runtime is a build dependency: both are
//! opened at run time and simply skipped when not installed.

#![allow(clippy::missing_safety_doc)] // FFI helpers documented at module level

pub mod backend;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod reclaim;

pub use backend::{CacheBackend, DeviceStatsBackend, PhysicalDevice, Probed};
pub use config::ReclaimConfig;
pub use error::{ReclaimError, ReclaimResult};
pub use host::{HostReclaimer, MallocTrim};
pub use reclaim::{
    clear_gpu_memory, BackendStatus, CacheReport, DeviceStatsReport, HostReport, ReclaimReport,
    Reclaimer, ReclaimerBuilder, StepStatus,
};
