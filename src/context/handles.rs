//! Object handle table
//!
//! Managed objects cross into native code as opaque handles. A handle is
//! valid while pinned: for the duration of a call when passed as an argument,
//! or until `release_object_handle` when returned from a callback.

use crate::error::{NfiError, Result};
use crate::value::{NativeAddress, Value};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// First handle value; keeps handles clear of NULL and small integers
const HANDLE_BASE: usize = 0x1000;
const HANDLE_STRIDE: usize = 16;

pub(crate) struct ObjectHandles {
    next: AtomicUsize,
    entries: DashMap<usize, Value>,
}

impl ObjectHandles {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicUsize::new(HANDLE_BASE),
            entries: DashMap::new(),
        }
    }

    pub(crate) fn pin(&self, value: Value) -> NativeAddress {
        let handle = self.next.fetch_add(HANDLE_STRIDE, Ordering::Relaxed);
        self.entries.insert(handle, value);
        NativeAddress(handle)
    }

    pub(crate) fn resolve(&self, handle: NativeAddress) -> Result<Value> {
        self.entries
            .get(&handle.0)
            .map(|entry| entry.value().clone())
            .ok_or(NfiError::UnknownObjectHandle(handle.0))
    }

    pub(crate) fn release(&self, handle: NativeAddress) -> Result<Value> {
        self.entries
            .remove(&handle.0)
            .map(|(_, value)| value)
            .ok_or(NfiError::UnknownObjectHandle(handle.0))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }
}
