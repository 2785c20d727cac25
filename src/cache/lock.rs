use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

struct KeyLocks {
    held: Mutex<BTreeSet<PathBuf>>,
    released: Condvar,
}

static CACHE_LOCKS: KeyLocks = KeyLocks {
    held: Mutex::new(BTreeSet::new()),
    released: Condvar::new(),
};

/// Exclusive hold on one cache location within this process. Released on drop.
#[derive(Debug)]
pub struct CacheKeyGuard {
    location: PathBuf,
}

impl CacheKeyGuard {
    pub fn location(&self) -> &Path {
        &self.location
    }
}

/// Blocks until no other compile in this process holds `location`.
pub fn lock_cache_location(location: &Path) -> CacheKeyGuard {
    let mut held = CACHE_LOCKS.held.lock();
    while held.contains(location) {
        log::trace!("Waiting for cache lock on {}", location.display());
        CACHE_LOCKS.released.wait(&mut held);
    }
    held.insert(location.to_path_buf());
    CacheKeyGuard {
        location: location.to_path_buf(),
    }
}

impl Drop for CacheKeyGuard {
    fn drop(&mut self) {
        CACHE_LOCKS.held.lock().remove(&self.location);
        CACHE_LOCKS.released.notify_all();
    }
}
