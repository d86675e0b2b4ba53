//! Host memory reclamation
//!
//! The general reclamation pass asks the C allocator to hand free heap
//! pages back to the operating system. It runs once at the end of every
//! reclaim pass, and in place of an explicit cache clear on unified-memory
//! devices.

use crate::error::ReclaimResult;

/// Process-wide memory reclamation primitive
pub trait HostReclaimer: Send + Sync {
    /// Short name used in log records
    fn name(&self) -> &str;

    /// Run one reclamation pass
    ///
    /// Returns whether the allocator reported memory returned to the OS.
    fn reclaim(&self) -> ReclaimResult<bool>;
}

/// Reclaims free heap via glibc `malloc_trim`
///
/// On targets without `malloc_trim` this is a no-op that reports nothing
/// released.
#[derive(Debug, Clone, Copy, Default)]
pub struct MallocTrim {
    pad: usize,
}

impl MallocTrim {
    /// Keep `pad` bytes of free space at the top of the heap
    pub fn new(pad: usize) -> Self {
        Self { pad }
    }
}

impl HostReclaimer for MallocTrim {
    fn name(&self) -> &str {
        "malloc_trim"
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    fn reclaim(&self) -> ReclaimResult<bool> {
        // SAFETY: malloc_trim only walks allocator-internal state.
        let released = unsafe { libc::malloc_trim(self.pad) };
        tracing::trace!("malloc_trim({}) returned {}", self.pad, released);
        Ok(released != 0)
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    fn reclaim(&self) -> ReclaimResult<bool> {
        tracing::trace!("malloc_trim unavailable on this target");
        Ok(false)
    }
}
