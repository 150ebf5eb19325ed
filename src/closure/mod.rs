//! Closures - native trampolines for managed callables
//!
//! Design: a manually reference-counted native pointer on top of `Arc`
//! 1. `ClosureNativePointer` owns the trampoline and a strong reference to the
//!    callable; native-side data only holds `Weak` handles back
//! 2. Each managed `NativeClosure` wrapper owns one reference; native code
//!    owns references through `NativeContext::new_closure_ref`
//! 3. The 1 -> 0 transition happens under the context's lookup-map lock and
//!    removes the trampoline from the map
//! 4. The trampoline memory is freed by the reclamation queue once the last
//!    `Arc<ClosureNativePointer>` is gone, never directly on refcount zero
//!
//! State machine: `Live(ref >= 1)` -> `Unreachable-from-lookup` -> `Freed`.

pub mod entry;


pub use entry::{last_error, ReturnShape};

use crate::backend::ClosureMemory;
use crate::context::{ContextInner, NativeContext};
use crate::error::{NfiError, Result};
use crate::logging::{log_closure_allocated, log_closure_unregistered};
use crate::reclaim::{NativeAllocation, NativeResource};
use crate::signature::Signature;
use crate::value::{Callable, NativeAddress};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Native-side view of a closure, reachable from the trampoline
///
/// Holds only weak references so the managed side alone decides liveness.
pub struct ClosureData {
    signature: Arc<Signature>,
    callable: Weak<dyn Callable>,
    owner: OnceCell<(NativeAddress, Weak<ClosureNativePointer>)>,
    context: Weak<ContextInner>,
    shape: ReturnShape,
}

impl ClosureData {
    pub fn signature(&self) -> &Arc<Signature> {
        &self.signature
    }

    pub fn shape(&self) -> ReturnShape {
        self.shape
    }

    /// Code pointer of the owning trampoline, once allocated
    pub fn code_pointer(&self) -> NativeAddress {
        self.owner.get().map(|(code, _)| *code).unwrap_or_default()
    }

    pub(crate) fn owner(&self) -> Option<Arc<ClosureNativePointer>> {
        self.owner.get().and_then(|(_, owner)| owner.upgrade())
    }

    pub(crate) fn callable(&self) -> Option<Arc<dyn Callable>> {
        self.callable.upgrade()
    }

    pub(crate) fn context(&self) -> Option<NativeContext> {
        self.context.upgrade().map(NativeContext::from_inner)
    }
}

/// The native trampoline backing one exported callable
pub struct ClosureNativePointer {
    code: NativeAddress,
    ref_count: AtomicUsize,
    callable: Arc<dyn Callable>,
    signature: Arc<Signature>,
    context: Weak<ContextInner>,
    memory: NativeResource<Box<dyn ClosureMemory>>,
    _allocation: NativeAllocation,
}

impl ClosureNativePointer {
    #[inline]
    pub fn code_pointer(&self) -> NativeAddress {
        self.code
    }

    #[inline]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn signature(&self) -> &Arc<Signature> {
        &self.signature
    }

    pub fn callable(&self) -> &Arc<dyn Callable> {
        &self.callable
    }

    /// Whether the trampoline memory is still allocated
    pub fn is_allocated(&self) -> bool {
        self.memory.is_live()
    }

    /// Add one reference
    ///
    /// # Panics
    /// If the closure already reached zero: reviving a dead closure is an
    /// engine bug.
    pub fn add_ref(&self) {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then(|| count + 1)
            });
        if previous.is_err() {
            panic!("add_ref on dead closure {}", self.code);
        }
    }

    /// Drop one reference; the last one removes the trampoline from the
    /// context's lookup map
    ///
    /// # Panics
    /// On release of a closure whose count is already zero.
    pub fn release_ref(&self) {
        match self.context.upgrade() {
            Some(context) => {
                let mut map = context.closures.lock();
                let removed = self.release_locked(&mut map);
                // the map's Arc is dropped outside the lock
                drop(map);
                drop(removed);
            }
            None => {
                self.decrement();
            }
        }
    }

    /// Decrement while the caller holds the lookup-map lock; returns the
    /// removed map entry on the 1 -> 0 transition
    pub(crate) fn release_locked(
        &self,
        map: &mut HashMap<usize, Arc<ClosureNativePointer>>,
    ) -> Option<Arc<ClosureNativePointer>> {
        if self.decrement() != 1 {
            return None;
        }
        let registered = map
            .get(&self.code.0)
            .map_or(false, |entry| std::ptr::eq(Arc::as_ptr(entry), self));
        if !registered {
            return None;
        }
        log_closure_unregistered(self.code.0);
        map.remove(&self.code.0)
    }

    fn decrement(&self) -> usize {
        match self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
        {
            Ok(previous) => previous,
            Err(_) => panic!("release_ref on dead closure {}", self.code),
        }
    }
}

impl fmt::Debug for ClosureNativePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureNativePointer")
            .field("code", &self.code)
            .field("ref_count", &self.ref_count())
            .field("signature", &self.signature.descriptor().to_string())
            .finish()
    }
}

/// Managed wrapper owning one closure reference
///
/// Cloning adds a reference, dropping releases one.
pub struct NativeClosure {
    inner: Arc<ClosureNativePointer>,
}

impl NativeClosure {
    /// Wrap a reference the caller already owns
    pub(crate) fn adopt(inner: Arc<ClosureNativePointer>) -> Self {
        Self { inner }
    }

    /// Wrap `inner`, adding a reference for the new wrapper
    pub fn retain(inner: Arc<ClosureNativePointer>) -> Self {
        inner.add_ref();
        Self { inner }
    }

    #[inline]
    pub fn code_pointer(&self) -> NativeAddress {
        self.inner.code
    }

    pub fn ref_count(&self) -> usize {
        self.inner.ref_count()
    }

    pub fn signature(&self) -> &Arc<Signature> {
        &self.inner.signature
    }

    pub fn native_pointer(&self) -> &Arc<ClosureNativePointer> {
        &self.inner
    }

    /// Hand one reference to native code and return the code pointer
    ///
    /// The receiver releases it through `NativeContext::release_closure_ref`,
    /// or from C with `typthon_nfi_release_closure_ref(env, code)`.
    pub fn export(&self) -> NativeAddress {
        self.inner.add_ref();
        self.inner.code
    }
}

impl Clone for NativeClosure {
    fn clone(&self) -> Self {
        Self::retain(self.inner.clone())
    }
}

impl Drop for NativeClosure {
    fn drop(&mut self) {
        self.inner.release_ref();
    }
}

impl fmt::Debug for NativeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeClosure({}, refs: {})", self.inner.code, self.ref_count())
    }
}

/// Allocate a trampoline for `callable` and register it in the lookup map
pub(crate) fn allocate(
    ctx: &NativeContext,
    signature: &Arc<Signature>,
    callable: Arc<dyn Callable>,
) -> Result<NativeClosure> {
    ctx.ensure_live()?;
    if !signature.direction().native_to_managed {
        return Err(NfiError::InvalidCallDirection {
            signature: signature.descriptor().to_string(),
            direction: "from native code",
        });
    }

    let data = Arc::new(ClosureData {
        signature: signature.clone(),
        callable: Arc::downgrade(&callable),
        owner: OnceCell::new(),
        context: ctx.downgrade(),
        shape: ReturnShape::for_type(signature.ret_type()),
    });

    let memory = ctx.backend().allocate_closure(signature, data.clone())?;
    let code = memory.code_pointer();
    let memory = NativeResource::new(memory);
    let allocation = {
        let memory = memory.clone();
        ctx.queue()
            .register_native_allocation(ctx.id(), move || drop(memory.take()))
    };

    let inner = Arc::new(ClosureNativePointer {
        code,
        ref_count: AtomicUsize::new(1),
        callable,
        signature: signature.clone(),
        context: ctx.downgrade(),
        memory,
        _allocation: allocation,
    });
    let _ = data.owner.set((code, Arc::downgrade(&inner)));

    ctx.register_closure(inner.clone())?;
    log_closure_allocated(code.0, &signature.descriptor().to_string());

    Ok(NativeClosure::adopt(inner))
}
