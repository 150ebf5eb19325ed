//! Native context - the owner of everything a set of native calls shares
//!
//! Design: one `Arc<ContextInner>` behind a cheap handle
//! - Signature interning: weak cache keyed by descriptor, first-time
//!   compilation serialized by a reentrant lock so nested closure signatures
//!   compile under it
//! - Closure lookup map: code pointer -> `ClosureNativePointer`, the single
//!   source of truth for trampoline liveness; every access holds its lock
//! - Object handle table, loaded libraries, reclamation queue
//!
//! Disposal refuses new work, clears the lookup map, destroys every
//! outstanding native allocation synchronously, then releases handles and
//! libraries and stops a local reaper.

mod handles;
mod registry;

#[cfg(test)]
mod tests;

use crate::backend::{Library, LibffiBackend, LoadFlags, NativeBackend};
use crate::closure::{self, ClosureNativePointer, NativeClosure};
use crate::config::NfiConfig;
use crate::error::{NfiError, Result};
use crate::logging::log_context_disposed;
use crate::reclaim::NativeAllocationQueue;
use crate::signature::{self, Signature, SignatureDescriptor};
use crate::types::{NativeType, TypeDescriptor};
use crate::value::{Callable, NativeAddress, Value};
use dashmap::DashMap;
use handles::ObjectHandles;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ContextInner {
    id: u64,
    backend: Arc<dyn NativeBackend>,
    config: NfiConfig,
    signatures: DashMap<SignatureDescriptor, Weak<Signature>>,
    compile_lock: ReentrantMutex<()>,
    pub(crate) closures: Mutex<HashMap<usize, Arc<ClosureNativePointer>>>,
    handles: ObjectHandles,
    queue: NativeAllocationQueue,
    owns_queue: bool,
    libraries: Mutex<Vec<Arc<Library>>>,
    default_library: Mutex<Option<Arc<Library>>>,
    disposed: AtomicBool,
}

impl ContextInner {
    fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let closures: Vec<Arc<ClosureNativePointer>> = {
            let mut map = self.closures.lock();
            map.drain().map(|(_, closure)| closure).collect()
        };
        let allocations = self.queue.destroy_group(self.id);

        self.handles.clear();
        self.signatures.clear();
        self.libraries.lock().clear();
        *self.default_library.lock() = None;
        if self.owns_queue {
            self.queue.shutdown();
        }

        log_context_disposed(self.id, closures.len(), allocations);
        drop(closures);
        true
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.dispose();
        registry::unregister(self);
    }
}

/// Handle to a native context; clones share the same state
#[derive(Clone)]
pub struct NativeContext {
    inner: Arc<ContextInner>,
}

impl NativeContext {
    /// libffi-backed context configured from `.typthon-nfi.toml` and the environment
    pub fn new() -> Self {
        Self::with_config(NfiConfig::discover())
    }

    pub fn with_config(config: NfiConfig) -> Self {
        Self::with_backend(Arc::new(LibffiBackend::new()), config)
    }

    pub fn with_backend(backend: Arc<dyn NativeBackend>, config: NfiConfig) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (queue, owns_queue) = if config.reclamation.shared_queue {
            (NativeAllocationQueue::global().clone(), false)
        } else {
            let name = format!("{}-{}", config.reclamation.reaper_thread_name, id);
            (NativeAllocationQueue::new(name), true)
        };

        tracing::debug!(event = "context_created", context = id, backend = backend.name(), "Native context created");

        let inner = Arc::new(ContextInner {
            id,
            backend,
            config,
            signatures: DashMap::new(),
            compile_lock: ReentrantMutex::new(()),
            closures: Mutex::new(HashMap::new()),
            handles: ObjectHandles::new(),
            queue,
            owns_queue,
            libraries: Mutex::new(Vec::new()),
            default_library: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        registry::register(&inner);
        Self { inner }
    }

    /// Live context whose `env_pointer` is `env`
    pub fn from_env(env: NativeAddress) -> Option<Self> {
        registry::resolve(env)
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &NfiConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.inner.backend
    }

    pub fn queue(&self) -> &NativeAllocationQueue {
        &self.inner.queue
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(NfiError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Pointer injected for `env` arguments
    pub fn env_pointer(&self) -> NativeAddress {
        NativeAddress::from_ptr(Arc::as_ptr(&self.inner))
    }

    // ------------------------------------------------------------------
    // Types and signatures
    // ------------------------------------------------------------------

    pub fn resolve_type(&self, descriptor: &TypeDescriptor) -> Result<NativeType> {
        Ok(match descriptor {
            TypeDescriptor::Void => NativeType::Void,
            TypeDescriptor::Simple(kind) => NativeType::Simple(*kind),
            TypeDescriptor::String => NativeType::String,
            TypeDescriptor::Object => NativeType::Object,
            TypeDescriptor::Nullable => NativeType::Nullable,
            TypeDescriptor::Env => NativeType::Env,
            TypeDescriptor::Array(kind) => NativeType::Array(*kind),
            TypeDescriptor::Closure(signature) => NativeType::Closure(self.compile_signature(signature)?),
        })
    }

    fn cached_signature(&self, descriptor: &SignatureDescriptor) -> Option<Arc<Signature>> {
        self.inner
            .signatures
            .get(descriptor)
            .and_then(|entry| entry.value().upgrade())
    }

    /// Compile `descriptor`, or return the live signature already interned for it
    pub fn compile_signature(&self, descriptor: &SignatureDescriptor) -> Result<Arc<Signature>> {
        self.ensure_live()?;
        if let Some(signature) = self.cached_signature(descriptor) {
            return Ok(signature);
        }

        let _guard = self.inner.compile_lock.lock();
        if let Some(signature) = self.cached_signature(descriptor) {
            return Ok(signature);
        }

        let signature = Arc::new(signature::compile(self, descriptor)?);
        self.inner.signatures.retain(|_, cached| cached.strong_count() > 0);
        self.inner
            .signatures
            .insert(descriptor.clone(), Arc::downgrade(&signature));
        Ok(signature)
    }

    pub fn cached_signature_count(&self) -> usize {
        self.inner
            .signatures
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    // ------------------------------------------------------------------
    // Closures
    // ------------------------------------------------------------------

    /// Export `callable` through a fresh trampoline with `signature`
    pub fn create_closure(
        &self,
        signature: &Arc<Signature>,
        callable: Arc<dyn Callable>,
    ) -> Result<NativeClosure> {
        closure::allocate(self, signature, callable)
    }

    pub(crate) fn register_closure(&self, closure: Arc<ClosureNativePointer>) -> Result<()> {
        let mut map = self.inner.closures.lock();
        // checked under the lock so disposal cannot miss the entry
        self.ensure_live()?;
        map.insert(closure.code_pointer().0, closure);
        Ok(())
    }

    pub fn lookup_closure(&self, code: NativeAddress) -> Option<Arc<ClosureNativePointer>> {
        self.inner.closures.lock().get(&code.0).cloned()
    }

    /// New managed wrapper for a live trampoline of this context
    pub fn retain_closure(&self, code: NativeAddress) -> Option<NativeClosure> {
        let map = self.inner.closures.lock();
        map.get(&code.0).map(|closure| NativeClosure::retain(closure.clone()))
    }

    /// Reference taken by native code
    pub fn new_closure_ref(&self, code: NativeAddress) -> Result<()> {
        let map = self.inner.closures.lock();
        let closure = map.get(&code.0).ok_or(NfiError::DeadClosure(code.0))?;
        closure.add_ref();
        Ok(())
    }

    /// Reference dropped by native code
    pub fn release_closure_ref(&self, code: NativeAddress) -> Result<()> {
        let mut map = self.inner.closures.lock();
        let closure = map
            .get(&code.0)
            .cloned()
            .ok_or(NfiError::DeadClosure(code.0))?;
        let removed = closure.release_locked(&mut map);
        drop(map);
        drop(removed);
        Ok(())
    }

    pub fn closure_count(&self) -> usize {
        self.inner.closures.lock().len()
    }

    // ------------------------------------------------------------------
    // Object handles
    // ------------------------------------------------------------------

    pub fn pin_object_handle(&self, value: Value) -> NativeAddress {
        self.inner.handles.pin(value)
    }

    pub fn resolve_object_handle(&self, handle: NativeAddress) -> Result<Value> {
        self.inner.handles.resolve(handle)
    }

    pub fn release_object_handle(&self, handle: NativeAddress) -> Result<()> {
        self.inner.handles.release(handle).map(drop)
    }

    pub fn object_handle_count(&self) -> usize {
        self.inner.handles.len()
    }

    // ------------------------------------------------------------------
    // Libraries
    // ------------------------------------------------------------------

    pub fn load_library(&self, path: &str, flags: LoadFlags) -> Result<Arc<Library>> {
        self.ensure_live()?;
        let library = Arc::new(Library::open(path, flags)?);
        self.inner.libraries.lock().push(library.clone());
        Ok(library)
    }

    /// Symbols of the running process
    pub fn default_library(&self) -> Result<Arc<Library>> {
        self.ensure_live()?;
        let mut slot = self.inner.default_library.lock();
        if let Some(library) = slot.as_ref() {
            return Ok(library.clone());
        }
        let library = Arc::new(Library::this()?);
        *slot = Some(library.clone());
        Ok(library)
    }

    /// Search loaded libraries in load order, then the process itself
    pub fn lookup_symbol(&self, name: &str) -> Result<NativeAddress> {
        let libraries = self.inner.libraries.lock().clone();
        for library in &libraries {
            if let Ok(address) = library.symbol(name) {
                return Ok(address);
            }
        }
        self.default_library()?.symbol(name)
    }

    // ------------------------------------------------------------------
    // Calls and teardown
    // ------------------------------------------------------------------

    /// Call the native function at `address` through `signature`
    ///
    /// # Safety
    /// `address` must point to a function with exactly this C signature.
    pub unsafe fn invoke(
        &self,
        signature: &Arc<Signature>,
        address: NativeAddress,
        args: &[Value],
    ) -> Result<Value> {
        crate::call::invoke(self, signature, address, args)
    }

    /// Tear the context down; returns false when it already was
    pub fn dispose(&self) -> bool {
        self.inner.dispose()
    }
}

impl Default for NativeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NativeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeContext")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend.name())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
