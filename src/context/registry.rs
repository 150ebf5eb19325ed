//! Live contexts addressable by their env pointer
//!
//! Native code only ever sees the injected env pointer. It is resolved here
//! instead of being dereferenced, so a stale or foreign pointer is an error
//! rather than undefined behavior.

use super::{ContextInner, NativeContext};
use crate::value::NativeAddress;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, Weak};

static LIVE_CONTEXTS: Lazy<DashMap<usize, Weak<ContextInner>>> = Lazy::new(DashMap::new);

pub(super) fn register(inner: &Arc<ContextInner>) {
    LIVE_CONTEXTS.insert(Arc::as_ptr(inner) as usize, Arc::downgrade(inner));
}

pub(super) fn unregister(inner: &ContextInner) {
    LIVE_CONTEXTS.remove(&(inner as *const ContextInner as usize));
}

pub(super) fn resolve(env: NativeAddress) -> Option<NativeContext> {
    let inner = LIVE_CONTEXTS.get(&env.0)?.value().upgrade()?;
    Some(NativeContext::from_inner(inner))
}
