use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use hexgraph_core::{HexError, Result};

/// Reference-counted registry of loaded libraries, plus the set of device
/// ids that currently own an execution context.
///
/// Owned explicitly and shared with every backend that should see the
/// same loaded handles (usually one per process, one per test).
pub struct LibraryRegistry<T> {
    inner: Mutex<RegistryState<T>>,
}

struct RegistryState<T> {
    libraries: HashMap<PathBuf, Entry<T>>,
    live_devices: HashSet<u32>,
}

struct Entry<T> {
    handle: Arc<T>,
    refs: usize,
}

/// Registry of dynamically loaded accelerator libraries.
pub type SdkLibraries = LibraryRegistry<libloading::Library>;

impl<T> Default for LibraryRegistry<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RegistryState {
                libraries: HashMap::new(),
                live_devices: HashSet::new(),
            }),
        }
    }
}

impl<T> LibraryRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the handle for `path`, calling `loader` only if it is not
    /// loaded yet. Each successful call must be paired with [`release`].
    ///
    /// [`release`]: LibraryRegistry::release
    pub fn acquire_with<F>(&self, path: &Path, loader: F) -> Result<Arc<T>>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        let mut state = self.inner.lock();
        if let Some(entry) = state.libraries.get_mut(path) {
            entry.refs += 1;
            tracing::debug!(path = %path.display(), refs = entry.refs, "reusing loaded library");
            return Ok(Arc::clone(&entry.handle));
        }
        let handle = Arc::new(loader(path)?);
        tracing::info!(path = %path.display(), "loaded library");
        state.libraries.insert(
            path.to_path_buf(),
            Entry {
                handle: Arc::clone(&handle),
                refs: 1,
            },
        );
        Ok(handle)
    }

    /// Drop one reference. Returns true when this was the last one and the
    /// registry let go of the handle.
    pub fn release(&self, path: &Path) -> bool {
        let mut state = self.inner.lock();
        let Some(entry) = state.libraries.get_mut(path) else {
            tracing::warn!(path = %path.display(), "release of unknown library");
            return false;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }
        state.libraries.remove(path);
        tracing::info!(path = %path.display(), "unloaded library");
        true
    }

    pub fn ref_count(&self, path: &Path) -> usize {
        self.inner.lock().libraries.get(path).map_or(0, |e| e.refs)
    }

    /// Mark `device` as owning a live context.
    pub fn claim_device(&self, device: u32) -> Result<()> {
        if !self.inner.lock().live_devices.insert(device) {
            return Err(HexError::AlreadyInitialized { device });
        }
        Ok(())
    }

    pub fn release_device(&self, device: u32) {
        self.inner.lock().live_devices.remove(&device);
    }

    pub fn is_device_live(&self, device: u32) -> bool {
        self.inner.lock().live_devices.contains(&device)
    }
}

/// Load a shared library from `path`.
pub fn load_library(path: &Path) -> Result<libloading::Library> {
    unsafe { libloading::Library::new(path) }
        .map_err(|e| HexError::Library(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_second_acquire_reuses_handle() {
        let registry = LibraryRegistry::<String>::new();
        let loads = AtomicUsize::new(0);
        let loader = |p: &Path| {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(p.display().to_string())
        };
        let path = Path::new("libhexsdk_npu.so");
        let a = registry.acquire_with(path, loader).unwrap();
        let b = registry.acquire_with(path, loader).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count(path), 2);

        assert!(!registry.release(path));
        assert!(registry.release(path));
        assert_eq!(registry.ref_count(path), 0);

        registry.acquire_with(path, loader).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let registry = LibraryRegistry::<()>::new();
        let path = Path::new("missing.so");
        assert!(registry
            .acquire_with(path, |_| Err(HexError::Library("nope".into())))
            .is_err());
        assert_eq!(registry.ref_count(path), 0);
    }

    #[test]
    fn test_device_claimed_once() {
        let registry = LibraryRegistry::<()>::new();
        registry.claim_device(2).unwrap();
        assert!(matches!(
            registry.claim_device(2),
            Err(HexError::AlreadyInitialized { device: 2 })
        ));
        registry.release_device(2);
        registry.claim_device(2).unwrap();
    }

    #[test]
    fn test_load_missing_library_fails() {
        assert!(matches!(
            load_library(Path::new("/nonexistent/libhexsdk.so")),
            Err(HexError::Library(_))
        ));
    }
}
