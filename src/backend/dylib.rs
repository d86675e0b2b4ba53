//! Runtime loading of GPU runtime libraries

use std::ffi::{c_char, CStr};

use libloading::Library;

use crate::error::{ReclaimError, ReclaimResult};

/// A shared library opened from one of several candidate names
pub(crate) struct LoadedLibrary {
    library: Library,
    name: String,
}

impl LoadedLibrary {
    /// Name the library was opened under
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Resolve a required entry point, copying the function pointer out
    ///
    /// # Safety
    /// `T` must match the C signature of `symbol`.
    pub(crate) unsafe fn required<T: Copy>(&self, symbol: &str) -> ReclaimResult<T> {
        self.library
            .get::<T>(symbol.as_bytes())
            .map(|s| *s)
            .map_err(|e| {
                tracing::debug!("{}: {} unresolved: {}", self.name, symbol, e);
                ReclaimError::SymbolMissing {
                    library: self.name.clone(),
                    symbol: symbol.to_string(),
                }
            })
    }

    /// Resolve an entry point that older runtimes may lack
    ///
    /// # Safety
    /// `T` must match the C signature of `symbol`.
    pub(crate) unsafe fn optional<T: Copy>(&self, symbol: &str) -> Option<T> {
        self.required(symbol).ok()
    }
}

/// Open the first candidate that the dynamic loader accepts
///
/// Returns `None` when no candidate loads; a missing runtime is a normal
/// condition, so failures are only logged at debug level.
pub(crate) fn open_first(candidates: &[String]) -> Option<LoadedLibrary> {
    for candidate in candidates {
        // SAFETY: GPU runtimes are built to be dlopen'ed; their initializers
        // have no preconditions on the calling process.
        match unsafe { Library::new(candidate) } {
            Ok(library) => {
                tracing::debug!("Loaded runtime library {}", candidate);
                return Some(LoadedLibrary {
                    library,
                    name: candidate.clone(),
                });
            }
            Err(e) => {
                tracing::debug!("Runtime library {} not loadable: {}", candidate, e);
            }
        }
    }
    None
}

/// Copy a runtime-owned C error string
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
pub(crate) unsafe fn c_message(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return "unknown error".to_string();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}
