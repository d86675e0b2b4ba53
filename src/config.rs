//! Reclaim configuration
//!
//! The set of backends is fixed (HIP and CUDA). Configuration only controls
//! where their runtime libraries are looked up and how much heap padding the
//! host pass keeps.

/// Shared library names tried, in order, when probing for the HIP runtime
pub const DEFAULT_HIP_LIBRARIES: &[&str] =
    &["libamdhip64.so", "libamdhip64.so.6", "libamdhip64.so.5"];

/// Shared library names tried, in order, when probing for the CUDA runtime
pub const DEFAULT_CUDA_LIBRARIES: &[&str] =
    &["libcudart.so", "libcudart.so.12", "libcudart.so.11.0"];

/// Configuration for building a [`Reclaimer`](crate::Reclaimer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimConfig {
    /// Candidate file names or paths for the HIP runtime
    pub hip_libraries: Vec<String>,
    /// Candidate file names or paths for the CUDA runtime
    pub cuda_libraries: Vec<String>,
    /// Bytes of free heap to keep at the top of the heap when trimming
    pub trim_pad: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            hip_libraries: DEFAULT_HIP_LIBRARIES.iter().map(|s| s.to_string()).collect(),
            cuda_libraries: DEFAULT_CUDA_LIBRARIES.iter().map(|s| s.to_string()).collect(),
            trim_pad: 0,
        }
    }
}

impl ReclaimConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the HIP library candidates
    pub fn with_hip_libraries<I, S>(mut self, libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hip_libraries = libraries.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the CUDA library candidates
    pub fn with_cuda_libraries<I, S>(mut self, libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cuda_libraries = libraries.into_iter().map(Into::into).collect();
        self
    }

    /// Set the padding passed to the host trim call
    pub fn with_trim_pad(mut self, trim_pad: usize) -> Self {
        self.trim_pad = trim_pad;
        self
    }
}
