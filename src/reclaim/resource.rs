//! Shared slot for a native resource with a single destroyer

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::sync::Arc;

/// A native resource that owners use while a destructor can take it exactly once
///
/// Readers hold the read lock for the duration of a use (e.g. a native call
/// through a call interface); `take` waits for them.
pub struct NativeResource<T>(Arc<RwLock<Option<T>>>);

impl<T> NativeResource<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(Some(value))))
    }

    /// Borrow the resource unless it was already destroyed
    ///
    /// Recursive so a callback can reenter a call through the same resource
    /// while a destroyer is waiting.
    pub fn get(&self) -> Option<MappedRwLockReadGuard<'_, T>> {
        RwLockReadGuard::try_map(self.0.read_recursive(), |slot| slot.as_ref()).ok()
    }

    /// Remove the resource; only the first caller gets it
    pub fn take(&self) -> Option<T> {
        self.0.write().take()
    }

    pub fn is_live(&self) -> bool {
        self.0.read_recursive().is_some()
    }
}

impl<T> Clone for NativeResource<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> std::fmt::Debug for NativeResource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeResource(live: {})", self.is_live())
    }
}
