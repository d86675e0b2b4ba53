//! Shared fixtures for reclaim tests
//!
//! - scripted backends that count every request they receive
//! - a `tracing` layer that captures emitted records for assertions

#![allow(dead_code)]

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memreclaim::{
    CacheBackend, DeviceStatsBackend, HostReclaimer, PhysicalDevice, ReclaimError, ReclaimResult,
};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

// ========== Scripted cache backend ==========

#[derive(Default)]
pub struct MockCache {
    pub gpu: bool,
    pub unified: bool,
    pub query_error: Option<String>,
    pub empty_error: Option<String>,
    pub empty_calls: AtomicUsize,
}

impl MockCache {
    pub fn gpu() -> Arc<Self> {
        Arc::new(Self {
            gpu: true,
            ..Default::default()
        })
    }

    pub fn unified() -> Arc<Self> {
        Arc::new(Self {
            unified: true,
            ..Default::default()
        })
    }

    pub fn idle() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn empty_calls(&self) -> usize {
        self.empty_calls.load(Ordering::SeqCst)
    }

    fn query(&self, value: bool) -> ReclaimResult<bool> {
        match &self.query_error {
            Some(reason) => Err(ReclaimError::runtime_call("mockQuery", 2, reason.clone())),
            None => Ok(value),
        }
    }
}

impl CacheBackend for MockCache {
    fn name(&self) -> &str {
        "MockA"
    }

    fn gpu_available(&self) -> ReclaimResult<bool> {
        self.query(self.gpu)
    }

    fn unified_memory_available(&self) -> ReclaimResult<bool> {
        self.query(self.unified)
    }

    fn empty_cache(&self) -> ReclaimResult<()> {
        self.empty_calls.fetch_add(1, Ordering::SeqCst);
        match &self.empty_error {
            Some(reason) => Err(ReclaimError::runtime_call("mockEmptyCache", 1, reason.clone())),
            None => Ok(()),
        }
    }
}

/// Cache backend whose device query panics
pub struct PanickingCache;

impl CacheBackend for PanickingCache {
    fn name(&self) -> &str {
        "PanicA"
    }

    fn gpu_available(&self) -> ReclaimResult<bool> {
        panic!("device table corrupted")
    }

    fn unified_memory_available(&self) -> ReclaimResult<bool> {
        Ok(false)
    }

    fn empty_cache(&self) -> ReclaimResult<()> {
        Ok(())
    }
}

// ========== Scripted device statistics backend ==========

#[derive(Default)]
pub struct MockStats {
    pub devices: Vec<PhysicalDevice>,
    pub failing: HashSet<i32>,
    pub enumerate_error: Option<String>,
    pub attempts: Mutex<Vec<i32>>,
}

impl MockStats {
    pub fn with_devices(count: i32) -> Self {
        Self {
            devices: (0..count)
                .map(|i| PhysicalDevice::new(i, format!("mock:{}", i)))
                .collect(),
            ..Default::default()
        }
    }

    pub fn failing_on(mut self, ordinal: i32) -> Self {
        self.failing.insert(ordinal);
        self
    }

    pub fn attempts(&self) -> Vec<i32> {
        self.attempts.lock().unwrap().clone()
    }
}

impl DeviceStatsBackend for MockStats {
    fn name(&self) -> &str {
        "MockB"
    }

    fn library(&self) -> Option<&str> {
        Some("libmockb.so")
    }

    fn physical_gpus(&self) -> ReclaimResult<Vec<PhysicalDevice>> {
        match &self.enumerate_error {
            Some(reason) => Err(ReclaimError::runtime_call("mockListDevices", 3, reason.clone())),
            None => Ok(self.devices.clone()),
        }
    }

    fn reset_memory_stats(&self, device: &PhysicalDevice) -> ReclaimResult<()> {
        self.attempts.lock().unwrap().push(device.ordinal);
        if self.failing.contains(&device.ordinal) {
            return Err(ReclaimError::Device {
                device: device.label.clone(),
                reason: "reset rejected".to_string(),
            });
        }
        Ok(())
    }
}

// ========== Counting host reclaimer ==========

#[derive(Default)]
pub struct CountingHost {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl CountingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HostReclaimer for CountingHost {
    fn name(&self) -> &str {
        "counting"
    }

    fn reclaim(&self) -> ReclaimResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ReclaimError::HostReclaim("heap locked".to_string()));
        }
        Ok(true)
    }
}

// ========== Log capture ==========

#[derive(Debug, Clone)]
pub struct CapturedRecord {
    pub level: Level,
    pub message: String,
}

#[derive(Clone, Default)]
pub struct LogCapture {
    records: Arc<Mutex<Vec<CapturedRecord>>>,
}

impl LogCapture {
    pub fn records(&self) -> Vec<CapturedRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn at(&self, level: Level) -> Vec<String> {
        self.records()
            .into_iter()
            .filter(|r| r.level == level)
            .map(|r| r.message)
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.at(Level::WARN)
    }

    pub fn infos(&self) -> Vec<String> {
        self.at(Level::INFO)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.records.lock().unwrap().push(CapturedRecord {
            level: *event.metadata().level(),
            message: visitor.message,
        });
    }
}

/// Run `f` with a thread-local subscriber capturing every record
pub fn with_captured_logs<R>(f: impl FnOnce() -> R) -> (R, LogCapture) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, capture)
}
