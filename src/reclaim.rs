//! Reclaim orchestration
//!
//! A reclaim pass runs three independent steps, in order:
//!
//! 1. empty the device cache of the [`CacheBackend`] (HIP), or run host
//!    reclamation in its place for unified-memory devices
//! 2. reset memory statistics of every device of the
//!    [`DeviceStatsBackend`] (CUDA), one device at a time
//! 3. run the [`HostReclaimer`] unconditionally
//!
//! Every failure is caught at the smallest scope it can occur in and
//! logged as a warning. Nothing is ever returned to the caller as an error.
//! A panic inside one step fails that step only; the later steps still run.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::backend::{
    CacheBackend, CudaRuntime, DeviceStatsBackend, HipRuntime, PhysicalDevice, Probed,
};
use crate::config::ReclaimConfig;
use crate::error::{ReclaimError, ReclaimResult};
use crate::host::{HostReclaimer, MallocTrim};

/// Reclaimer used by [`clear_gpu_memory`], probed on first use
static DEFAULT_RECLAIMER: Lazy<Reclaimer> =
    Lazy::new(|| Reclaimer::probe(&ReclaimConfig::default()));

/// Release cached GPU memory and run a host reclamation pass.
///
/// Best effort: every failure is logged as a warning and swallowed, so the
/// caller always proceeds as if the call succeeded. Runtime libraries are
/// probed once per process; devices are queried again on every call.
///
/// # Example
///
/// ```no_run
/// memreclaim::clear_gpu_memory();
/// ```
pub fn clear_gpu_memory() {
    // Steps guard themselves; this covers loading the runtimes on first use
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        DEFAULT_RECLAIMER.run();
    }));
    if let Err(payload) = result {
        tracing::warn!(
            "Memory reclamation aborted while loading runtimes: {}",
            panic_message(payload.as_ref())
        );
    }
}

/// Run one step, turning a panic into a failed step report
fn guard_step<R>(
    step: &str,
    run: impl FnOnce() -> R,
    on_panic: impl FnOnce(StepStatus) -> R,
) -> R {
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(report) => report,
        Err(payload) => {
            let reason = format!("panicked: {}", panic_message(payload.as_ref()));
            tracing::warn!("Failed to run {}: {}", step, reason);
            on_panic(StepStatus::Failed { reason })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Outcome of a single reclaim step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    /// The backend is not installed
    #[default]
    Skipped,
    /// The step ran; see the step report for what it did
    Completed,
    /// The step failed and was logged
    Failed { reason: String },
}

impl StepStatus {
    fn failed(err: &ReclaimError) -> Self {
        StepStatus::Failed {
            reason: err.to_string(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepStatus::Failed { .. })
    }
}

/// Report for the device cache step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheReport {
    #[serde(flatten)]
    pub status: StepStatus,
    /// An explicit cache-empty request was issued
    pub cache_emptied: bool,
    /// Host reclamation ran in place of a cache clear (unified memory)
    pub unified_memory_reclaimed: bool,
}

/// Report for the device statistics step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatsReport {
    #[serde(flatten)]
    pub status: StepStatus,
    pub devices_reset: Vec<String>,
    pub devices_failed: Vec<String>,
}

/// Report for the host reclamation step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostReport {
    #[serde(flatten)]
    pub status: StepStatus,
    /// The allocator reported memory returned to the OS
    pub released: bool,
}

/// What a reclaim pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub device_cache: CacheReport,
    pub device_stats: DeviceStatsReport,
    pub host: HostReport,
}

impl ReclaimReport {
    /// Number of logged failures, counting each failed device
    pub fn failure_count(&self) -> usize {
        usize::from(self.device_cache.status.is_failed())
            + usize::from(self.device_stats.status.is_failed())
            + self.device_stats.devices_failed.len()
            + usize::from(self.host.status.is_failed())
    }
}

/// Detected state of the cache backend
#[derive(Debug, Clone, Serialize)]
pub struct CacheBackendStatus {
    pub backend: Option<String>,
    /// Shared library the backend was loaded from
    pub library: Option<String>,
    pub probe: String,
    pub gpu_available: Option<bool>,
    pub unified_memory_available: Option<bool>,
    pub error: Option<String>,
}

/// Detected state of the device statistics backend
#[derive(Debug, Clone, Serialize)]
pub struct StatsBackendStatus {
    pub backend: Option<String>,
    pub library: Option<String>,
    pub probe: String,
    pub devices: Vec<PhysicalDevice>,
    pub error: Option<String>,
}

/// Snapshot of detected backends, produced without reclaiming anything
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub device_cache: CacheBackendStatus,
    pub device_stats: StatsBackendStatus,
    pub host: String,
}

/// Runs reclaim passes against a fixed set of backends
pub struct Reclaimer {
    cache: Probed<dyn CacheBackend>,
    stats: Probed<dyn DeviceStatsBackend>,
    host: Arc<dyn HostReclaimer>,
}

impl Reclaimer {
    /// Probe the HIP and CUDA runtimes named in `config`
    pub fn probe(config: &ReclaimConfig) -> Self {
        let cache = Probed::from_probe(
            HipRuntime::probe(&config.hip_libraries)
                .map(|rt| rt.map(|rt| Arc::new(rt) as Arc<dyn CacheBackend>)),
        );
        let stats = Probed::from_probe(
            CudaRuntime::probe(&config.cuda_libraries)
                .map(|rt| rt.map(|rt| Arc::new(rt) as Arc<dyn DeviceStatsBackend>)),
        );
        tracing::debug!(
            "Reclaim backends probed: cache={}, stats={}",
            cache.describe(),
            stats.describe()
        );

        Reclaimer {
            cache,
            stats,
            host: Arc::new(MallocTrim::new(config.trim_pad)),
        }
    }

    /// Start building a reclaimer from explicit collaborators
    pub fn builder() -> ReclaimerBuilder {
        ReclaimerBuilder::default()
    }

    /// Run one reclaim pass
    pub fn run(&self) -> ReclaimReport {
        let report = ReclaimReport {
            device_cache: guard_step(
                "GPU memory cache clear",
                || self.clear_device_cache(),
                |status| CacheReport {
                    status,
                    ..Default::default()
                },
            ),
            device_stats: guard_step(
                "GPU memory statistics reset",
                || self.reset_device_stats(),
                |status| DeviceStatsReport {
                    status,
                    ..Default::default()
                },
            ),
            host: guard_step(
                "host memory reclamation",
                || self.reclaim_host(),
                |status| HostReport {
                    status,
                    released: false,
                },
            ),
        };
        tracing::debug!("Reclaim pass finished with {} failure(s)", report.failure_count());
        report
    }

    /// Query the backends without issuing any reclaim request
    pub fn status(&self) -> BackendStatus {
        let device_cache = match &self.cache {
            Probed::Ready(backend) => {
                let queried = backend
                    .gpu_available()
                    .and_then(|gpu| backend.unified_memory_available().map(|unified| (gpu, unified)));
                let (gpu, unified, error) = match queried {
                    Ok((gpu, unified)) => (Some(gpu), Some(unified), None),
                    Err(e) => (None, None, Some(e.to_string())),
                };
                CacheBackendStatus {
                    backend: Some(backend.name().to_string()),
                    library: backend.library().map(str::to_string),
                    probe: self.cache.describe(),
                    gpu_available: gpu,
                    unified_memory_available: unified,
                    error,
                }
            }
            other => CacheBackendStatus {
                backend: None,
                library: None,
                probe: other.describe(),
                gpu_available: None,
                unified_memory_available: None,
                error: None,
            },
        };

        let device_stats = match &self.stats {
            Probed::Ready(backend) => {
                let (devices, error) = match backend.physical_gpus() {
                    Ok(devices) => (devices, None),
                    Err(e) => (Vec::new(), Some(e.to_string())),
                };
                StatsBackendStatus {
                    backend: Some(backend.name().to_string()),
                    library: backend.library().map(str::to_string),
                    probe: self.stats.describe(),
                    devices,
                    error,
                }
            }
            other => StatsBackendStatus {
                backend: None,
                library: None,
                probe: other.describe(),
                devices: Vec::new(),
                error: None,
            },
        };

        BackendStatus {
            device_cache,
            device_stats,
            host: self.host.name().to_string(),
        }
    }

    fn clear_device_cache(&self) -> CacheReport {
        let mut report = CacheReport::default();
        let backend = match &self.cache {
            Probed::Absent => {
                tracing::debug!("No device cache runtime installed, skipping cache clear");
                return report;
            }
            Probed::Broken(e) => {
                tracing::warn!("Failed to clear GPU memory cache: {}", e);
                report.status = StepStatus::failed(e);
                return report;
            }
            Probed::Ready(backend) => backend,
        };

        match self.try_clear_device_cache(backend.as_ref(), &mut report) {
            Ok(()) => report.status = StepStatus::Completed,
            Err(e) => {
                tracing::warn!("Failed to clear {} GPU memory: {}", backend.name(), e);
                report.status = StepStatus::failed(&e);
            }
        }
        report
    }

    fn try_clear_device_cache(
        &self,
        backend: &dyn CacheBackend,
        report: &mut CacheReport,
    ) -> ReclaimResult<()> {
        if backend.gpu_available()? {
            tracing::info!("Clearing {} GPU memory cache", backend.name());
            backend.empty_cache()?;
            report.cache_emptied = true;
        }

        if backend.unified_memory_available()? {
            tracing::info!(
                "{} unified-memory device detected - explicit cache clearing is not supported, running {} instead",
                backend.name(),
                self.host.name()
            );
            self.host.reclaim()?;
            report.unified_memory_reclaimed = true;
        }

        Ok(())
    }

    fn reset_device_stats(&self) -> DeviceStatsReport {
        let mut report = DeviceStatsReport::default();
        let backend = match &self.stats {
            Probed::Absent => {
                tracing::debug!("No device statistics runtime installed, skipping reset");
                return report;
            }
            Probed::Broken(e) => {
                tracing::warn!("Failed to reset GPU memory statistics: {}", e);
                report.status = StepStatus::failed(e);
                return report;
            }
            Probed::Ready(backend) => backend,
        };

        let devices = match backend.physical_gpus() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Failed to clear {} GPU memory: {}", backend.name(), e);
                report.status = StepStatus::failed(&e);
                return report;
            }
        };

        if !devices.is_empty() {
            tracing::info!(
                "Resetting {} memory statistics for {} GPU device(s)",
                backend.name(),
                devices.len()
            );
            // A failing device must not stop the rest
            for device in &devices {
                match backend.reset_memory_stats(device) {
                    Ok(()) => report.devices_reset.push(device.label.clone()),
                    Err(e) => {
                        tracing::warn!("Failed to reset memory stats for device {}: {}", device, e);
                        report.devices_failed.push(device.label.clone());
                    }
                }
            }
        }

        report.status = StepStatus::Completed;
        report
    }

    fn reclaim_host(&self) -> HostReport {
        tracing::debug!("Running host memory reclamation via {}", self.host.name());
        match self.host.reclaim() {
            Ok(released) => HostReport {
                status: StepStatus::Completed,
                released,
            },
            Err(e) => {
                tracing::warn!("Failed to run host memory reclamation: {}", e);
                HostReport {
                    status: StepStatus::failed(&e),
                    released: false,
                }
            }
        }
    }
}

/// Builder for a [`Reclaimer`] with injected backends
///
/// Backends left unset are treated as not installed. The host reclaimer
/// defaults to [`MallocTrim`].
pub struct ReclaimerBuilder {
    cache: Probed<dyn CacheBackend>,
    stats: Probed<dyn DeviceStatsBackend>,
    host: Arc<dyn HostReclaimer>,
}

impl Default for ReclaimerBuilder {
    fn default() -> Self {
        Self {
            cache: Probed::Absent,
            stats: Probed::Absent,
            host: Arc::new(MallocTrim::default()),
        }
    }
}

impl ReclaimerBuilder {
    /// Use a ready cache backend
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache = Probed::Ready(backend);
        self
    }

    /// Use an explicit cache probe outcome
    pub fn cache_probe(mut self, probe: Probed<dyn CacheBackend>) -> Self {
        self.cache = probe;
        self
    }

    /// Use a ready device statistics backend
    pub fn stats_backend(mut self, backend: Arc<dyn DeviceStatsBackend>) -> Self {
        self.stats = Probed::Ready(backend);
        self
    }

    /// Use an explicit device statistics probe outcome
    pub fn stats_probe(mut self, probe: Probed<dyn DeviceStatsBackend>) -> Self {
        self.stats = probe;
        self
    }

    /// Replace the host reclaimer
    pub fn host_reclaimer(mut self, host: Arc<dyn HostReclaimer>) -> Self {
        self.host = host;
        self
    }

    pub fn build(self) -> Reclaimer {
        Reclaimer {
            cache: self.cache,
            stats: self.stats,
            host: self.host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingHost;

    impl HostReclaimer for FailingHost {
        fn name(&self) -> &str {
            "failing"
        }
        fn reclaim(&self) -> ReclaimResult<bool> {
            Err(ReclaimError::HostReclaim("allocator refused".to_string()))
        }
    }

    struct PanickingHost;

    impl HostReclaimer for PanickingHost {
        fn name(&self) -> &str {
            "panicking"
        }
        fn reclaim(&self) -> ReclaimResult<bool> {
            panic!("{} arena poisoned", 2)
        }
    }

    #[test]
    fn test_empty_builder_only_runs_host_step() {
        let report = Reclaimer::builder().build().run();
        assert_eq!(report.device_cache.status, StepStatus::Skipped);
        assert_eq!(report.device_stats.status, StepStatus::Skipped);
        assert_eq!(report.host.status, StepStatus::Completed);
        assert_eq!(report.failure_count(), 0);
    }

    #[test]
    fn test_host_failure_is_reported_not_raised() {
        let report = Reclaimer::builder()
            .host_reclaimer(Arc::new(FailingHost))
            .build()
            .run();
        assert_eq!(
            report.host.status,
            StepStatus::Failed {
                reason: "Host memory reclamation failed: allocator refused".to_string()
            }
        );
        assert!(!report.host.released);
        assert_eq!(report.failure_count(), 1);
    }

    #[test]
    fn test_panicking_host_step_is_reported_as_failed() {
        let report = Reclaimer::builder()
            .host_reclaimer(Arc::new(PanickingHost))
            .build()
            .run();
        assert_eq!(
            report.host.status,
            StepStatus::Failed {
                reason: "panicked: 2 arena poisoned".to_string()
            }
        );
        assert!(!report.host.released);
        assert_eq!(report.device_cache.status, StepStatus::Skipped);
        assert_eq!(report.failure_count(), 1);
    }

    #[test]
    fn test_panic_message_of_unknown_payload() {
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_broken_backend_fails_step_only() {
        let broken = ReclaimError::SymbolMissing {
            library: "libamdhip64.so".to_string(),
            symbol: "hipInit".to_string(),
        };
        let report = Reclaimer::builder()
            .cache_probe(Probed::Broken(broken))
            .build()
            .run();
        assert!(report.device_cache.status.is_failed());
        assert_eq!(report.device_stats.status, StepStatus::Skipped);
        assert_eq!(report.host.status, StepStatus::Completed);
    }

    #[test]
    fn test_missing_libraries_are_skipped() {
        let config = ReclaimConfig::new()
            .with_hip_libraries(["libamdhip64-memreclaim-missing.so"])
            .with_cuda_libraries(["libcudart-memreclaim-missing.so"]);
        let reclaimer = Reclaimer::probe(&config);

        let status = reclaimer.status();
        assert_eq!(status.device_cache.probe, "absent");
        assert_eq!(status.device_stats.probe, "absent");
        assert!(status.device_stats.devices.is_empty());
        assert_eq!(status.host, "malloc_trim");

        let report = reclaimer.run();
        assert_eq!(report.device_cache.status, StepStatus::Skipped);
        assert_eq!(report.device_stats.status, StepStatus::Skipped);
    }

    #[test]
    fn test_clear_gpu_memory_returns_normally() {
        clear_gpu_memory();
        clear_gpu_memory();
    }

    #[test]
    fn test_step_status_serializes_with_tag() {
        let json = serde_json::to_string(&StepStatus::Failed {
            reason: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"failed","reason":"boom"}"#);
        assert_eq!(
            serde_json::to_string(&StepStatus::Skipped).unwrap(),
            r#"{"status":"skipped"}"#
        );
    }
}
