//! Dynamic library loading and symbol resolution
//!
//! Platform-agnostic wrapper around libloading. On unix the binding mode and
//! symbol visibility map to RTLD_LAZY/RTLD_NOW and RTLD_GLOBAL/RTLD_LOCAL.

use crate::config::LibraryConfig;
use crate::error::{NfiError, Result};
use crate::value::NativeAddress;
use core::ffi::c_void;
use std::ffi::CString;

/// How a library is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadFlags {
    /// Resolve symbols on first use instead of at load time
    pub lazy: bool,
    /// Make the library's symbols available to later loads
    pub global: bool,
}

impl Default for LoadFlags {
    fn default() -> Self {
        Self {
            lazy: true,
            global: false,
        }
    }
}

impl LoadFlags {
    pub fn from_config(config: &LibraryConfig) -> Self {
        Self {
            lazy: config.lazy_binding,
            global: config.global_symbols,
        }
    }

    #[cfg(unix)]
    fn raw(self) -> i32 {
        use libloading::os::unix::{RTLD_GLOBAL, RTLD_LAZY, RTLD_LOCAL, RTLD_NOW};
        let binding = if self.lazy { RTLD_LAZY } else { RTLD_NOW };
        let visibility = if self.global { RTLD_GLOBAL } else { RTLD_LOCAL };
        binding | visibility
    }
}

/// Handle to a loaded library (or the running process)
pub struct Library {
    name: String,
    handle: libloading::Library,
}

impl Library {
    /// Load a library by path or by name searched in the standard paths
    pub fn open(path: &str, flags: LoadFlags) -> Result<Self> {
        let handle = Self::open_impl(path, flags).map_err(|e| NfiError::LibraryNotFound {
            name: path.to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!(event = "library_loaded", library = path, lazy = flags.lazy, global = flags.global, "Library loaded");

        Ok(Self {
            name: path.to_string(),
            handle,
        })
    }

    #[cfg(unix)]
    fn open_impl(path: &str, flags: LoadFlags) -> std::result::Result<libloading::Library, libloading::Error> {
        // SAFETY: running library initializers is inherent to loading native code
        unsafe { libloading::os::unix::Library::open(Some(path), flags.raw()).map(Into::into) }
    }

    #[cfg(windows)]
    fn open_impl(path: &str, _flags: LoadFlags) -> std::result::Result<libloading::Library, libloading::Error> {
        // SAFETY: as above; Windows has no lazy/global distinction
        unsafe { libloading::Library::new(path) }
    }

    /// Symbols of the running process and its loaded dependencies
    pub fn this() -> Result<Self> {
        Ok(Self {
            name: "<default>".to_string(),
            handle: Self::this_impl()?,
        })
    }

    #[cfg(unix)]
    fn this_impl() -> Result<libloading::Library> {
        Ok(libloading::os::unix::Library::this().into())
    }

    #[cfg(windows)]
    fn this_impl() -> Result<libloading::Library> {
        libloading::os::windows::Library::this()
            .map(Into::into)
            .map_err(|e| NfiError::LibraryNotFound {
                name: "<default>".to_string(),
                reason: e.to_string(),
            })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve an exported symbol to its address
    pub fn symbol(&self, name: &str) -> Result<NativeAddress> {
        let not_found = || NfiError::SymbolNotFound {
            name: name.to_string(),
        };
        let c_name = CString::new(name).map_err(|_| not_found())?;

        // SAFETY: the symbol is only read as an address, never called here
        let symbol = unsafe { self.handle.get::<*mut c_void>(c_name.as_bytes_with_nul()) }
            .map_err(|_| not_found())?;
        Ok(NativeAddress::from_ptr(*symbol))
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Library({})", self.name)
    }
}
