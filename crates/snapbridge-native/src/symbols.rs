use crate::error::{BridgeError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Address of a resolved native entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddr(NonNull<c_void>);

// Code addresses are immutable for the life of the loaded image.
unsafe impl Send for SymbolAddr {}
unsafe impl Sync for SymbolAddr {}

impl SymbolAddr {
    /// Wrap a raw address, rejecting null
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Source of native symbol addresses
///
/// `NativeLibrary` is the real implementation; `MockLibrary` stands in for
/// it in tests.
pub trait SymbolLookup: Send + Sync {
    /// Look up `name`, returning a description of the failure if absent
    fn lookup(&self, name: &str) -> std::result::Result<SymbolAddr, String>;
}

/// A loaded native library image searched with `dlsym`
pub struct NativeLibrary {
    handle: *mut c_void,
    path: Option<String>,
}

// dlsym/dlclose on a handle are thread-safe.
unsafe impl Send for NativeLibrary {}
unsafe impl Sync for NativeLibrary {}

impl NativeLibrary {
    /// Search every image already loaded into the process
    pub fn process() -> Self {
        Self {
            handle: libc::RTLD_DEFAULT,
            path: None,
        }
    }

    /// `dlopen` a shared library by path or soname
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let display_path = path.as_ref().display().to_string();
        let c_path = CString::new(display_path.clone())
            .map_err(|_| BridgeError::library_load(&display_path, "path contains a NUL byte"))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            let message = last_dl_error().unwrap_or_else(|| "unknown dlopen error".to_string());
            return Err(BridgeError::library_load(display_path, message));
        }

        info!("Loaded native library {}", display_path);
        Ok(Self {
            handle,
            path: Some(display_path),
        })
    }

    /// Path the library was opened from, `None` for the process image
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }
}

impl SymbolLookup for NativeLibrary {
    fn lookup(&self, name: &str) -> std::result::Result<SymbolAddr, String> {
        let c_name = CString::new(name).map_err(|_| "symbol name contains a NUL byte".to_string())?;

        // dlerror state is per thread; clear it so a stale message is not reported.
        unsafe { libc::dlerror() };
        let addr = unsafe { libc::dlsym(self.handle, c_name.as_ptr()) };

        SymbolAddr::new(addr).ok_or_else(|| {
            last_dl_error().unwrap_or_else(|| format!("undefined symbol: {}", name))
        })
    }
}

impl Drop for NativeLibrary {
    fn drop(&mut self) {
        if self.path.is_some() && !self.handle.is_null() {
            unsafe { libc::dlclose(self.handle) };
        }
    }
}

fn last_dl_error() -> Option<String> {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        None
    } else {
        Some(unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned())
    }
}

type Resolution = std::result::Result<SymbolAddr, String>;

/// Resolves optional native entry points once per name and caches the outcome
///
/// Each name gets its own `OnceLock`. Concurrent first callers block on it
/// until the single lookup finishes, and every caller then sees the same
/// address or the same failure. Failures are cached too: a missing symbol is
/// a property of the loaded library build and is never retried.
pub struct SymbolResolver<L> {
    library: L,
    cache: RwLock<HashMap<String, Arc<OnceLock<Resolution>>>>,
}

impl<L: SymbolLookup> SymbolResolver<L> {
    pub fn new(library: L) -> Self {
        Self {
            library,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve `name`, returning `NotImplemented` if the library lacks it
    pub fn resolve(&self, name: &str) -> Result<SymbolAddr> {
        let cell = self.cell(name);
        let resolution = cell.get_or_init(|| {
            let outcome = self.library.lookup(name);
            match &outcome {
                Ok(addr) => debug!("Resolved symbol {} at {:p}", name, addr.as_ptr()),
                Err(reason) => info!("Symbol {} is not available: {}", name, reason),
            }
            outcome
        });

        resolution
            .clone()
            .map_err(|reason| BridgeError::not_implemented(name, reason))
    }

    /// True when `name` resolves in the underlying library
    pub fn is_available(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// The library this resolver searches
    pub fn library(&self) -> &L {
        &self.library
    }

    fn cell(&self, name: &str) -> Arc<OnceLock<Resolution>> {
        if let Some(cell) = self.cache.read().get(name) {
            return Arc::clone(cell);
        }
        Arc::clone(
            self.cache
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceLock::new())),
        )
    }
}

impl SymbolResolver<NativeLibrary> {
    /// Process-wide resolver over every image already loaded
    pub fn global() -> &'static SymbolResolver<NativeLibrary> {
        static GLOBAL: OnceLock<SymbolResolver<NativeLibrary>> = OnceLock::new();
        GLOBAL.get_or_init(|| SymbolResolver::new(NativeLibrary::process()))
    }
}
