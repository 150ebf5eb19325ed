//! Deferred native-resource reclamation
//!
//! Design: owner-scoped handles plus a reaper thread
//! 1. `register_native_allocation` stores the destructor in a slot and hands
//!    back a `NativeAllocation` the managed owner keeps as a field
//! 2. Dropping the owner drops the handle, which enqueues the slot
//! 3. The queue's reaper thread removes the bookkeeping entry and runs the
//!    destructor exactly once
//!
//! `destroy_now` / `destroy_group` bypass the reaper for deterministic
//! teardown; a slot already destroyed is skipped when its handle drops.

mod resource;


pub use resource::NativeResource;

use crate::logging::log_reclaimed;
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Process-wide queue for allocations whose destructors cannot reach their owner
static GLOBAL_QUEUE: Lazy<NativeAllocationQueue> =
    Lazy::new(|| NativeAllocationQueue::new("typthon-nfi-reaper"));

/// Frees one native resource
pub trait Destructor: Send {
    fn destroy(self: Box<Self>);
}

impl<F: FnOnce() + Send> Destructor for F {
    fn destroy(self: Box<Self>) {
        (*self)()
    }
}

struct AllocationSlot {
    id: u64,
    group: u64,
    destructor: Mutex<Option<Box<dyn Destructor>>>,
}

impl AllocationSlot {
    /// Run the destructor if nobody did yet
    fn run(&self) -> bool {
        let destructor = self.destructor.lock().take();
        match destructor {
            Some(d) => {
                if panic::catch_unwind(AssertUnwindSafe(|| d.destroy())).is_err() {
                    error!(event = "destructor_panicked", allocation = self.id, "Native destructor panicked");
                }
                true
            }
            None => false,
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destructor.lock().is_none()
    }
}

/// Bookkeeping shared between a queue, its handles and its reaper
struct Registry {
    name: String,
    live: DashMap<u64, Arc<AllocationSlot>>,
    next_id: AtomicU64,
    registered: AtomicU64,
    reclaimed: AtomicU64,
    closed: AtomicBool,
}

impl Registry {
    fn reclaim(&self, slot: &AllocationSlot) {
        self.live.remove(&slot.id);
        if slot.run() {
            self.reclaimed.fetch_add(1, Ordering::Relaxed);
            log_reclaimed(&self.name, slot.id);
        }
    }
}

enum Message {
    Reclaim(Arc<AllocationSlot>),
    Flush(Sender<()>),
    Shutdown,
}

struct QueueInner {
    registry: Arc<Registry>,
    sender: Sender<Message>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        shutdown(&self.registry, &self.sender, &self.reaper);
    }
}

/// Queue statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub registered: u64,
    pub reclaimed: u64,
    pub live: usize,
}

/// A reclamation queue with its own reaper thread
#[derive(Clone)]
pub struct NativeAllocationQueue {
    inner: Arc<QueueInner>,
}

impl NativeAllocationQueue {
    /// Create a local queue; its reaper thread carries `name`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let registry = Arc::new(Registry {
            name: name.clone(),
            live: DashMap::new(),
            next_id: AtomicU64::new(1),
            registered: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let (sender, receiver) = channel::unbounded();

        let reaper = {
            let registry = registry.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || reaper_loop(registry, receiver))
        };
        let reaper = match reaper {
            Ok(handle) => Some(handle),
            Err(err) => {
                // Without a reaper every handle destroys inline on drop
                warn!(event = "reaper_spawn_failed", queue = %name, error = %err, "Reaper thread unavailable");
                registry.closed.store(true, Ordering::Release);
                None
            }
        };

        debug!(event = "queue_created", queue = %name, "Reclamation queue created");

        Self {
            inner: Arc::new(QueueInner {
                registry,
                sender,
                reaper: Mutex::new(reaper),
            }),
        }
    }

    /// The shared process-wide queue
    pub fn global() -> &'static NativeAllocationQueue {
        &GLOBAL_QUEUE
    }

    pub fn name(&self) -> &str {
        &self.inner.registry.name
    }

    /// Register a destructor that runs once the returned handle is dropped
    pub fn register_native_allocation<D>(&self, group: u64, destructor: D) -> NativeAllocation
    where
        D: Destructor + 'static,
    {
        let registry = &self.inner.registry;
        let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(AllocationSlot {
            id,
            group,
            destructor: Mutex::new(Some(Box::new(destructor))),
        });
        registry.live.insert(id, slot.clone());
        registry.registered.fetch_add(1, Ordering::Relaxed);

        NativeAllocation {
            slot,
            registry: registry.clone(),
            sender: self.inner.sender.clone(),
        }
    }

    /// Synchronously destroy every live allocation of `group`
    pub fn destroy_group(&self, group: u64) -> usize {
        let registry = &self.inner.registry;
        let slots: Vec<Arc<AllocationSlot>> = registry
            .live
            .iter()
            .filter(|entry| entry.value().group == group)
            .map(|entry| entry.value().clone())
            .collect();

        let mut destroyed = 0;
        for slot in slots {
            registry.live.remove(&slot.id);
            if slot.run() {
                registry.reclaimed.fetch_add(1, Ordering::Relaxed);
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Block until everything enqueued before this call has been processed
    pub fn flush(&self) {
        if self.inner.registry.closed.load(Ordering::Acquire) {
            return;
        }
        let (done_tx, done_rx) = channel::bounded(1);
        if self.inner.sender.send(Message::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }

    /// Stop the reaper after draining what is already queued
    pub fn shutdown(&self) {
        shutdown(&self.inner.registry, &self.inner.sender, &self.inner.reaper);
    }

    pub fn stats(&self) -> QueueStats {
        let registry = &self.inner.registry;
        QueueStats {
            registered: registry.registered.load(Ordering::Relaxed),
            reclaimed: registry.reclaimed.load(Ordering::Relaxed),
            live: registry.live.len(),
        }
    }
}

fn shutdown(registry: &Registry, sender: &Sender<Message>, reaper: &Mutex<Option<JoinHandle<()>>>) {
    if registry.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    let _ = sender.send(Message::Shutdown);
    if let Some(handle) = reaper.lock().take() {
        // A destructor may drop the last queue handle on the reaper itself
        if handle.thread().id() != thread::current().id() {
            let _ = handle.join();
        }
    }
    debug!(event = "queue_shutdown", queue = %registry.name, "Reclamation queue stopped");
}

fn reaper_loop(registry: Arc<Registry>, receiver: Receiver<Message>) {
    for message in receiver.iter() {
        match message {
            Message::Reclaim(slot) => registry.reclaim(&slot),
            Message::Flush(done) => {
                let _ = done.send(());
            }
            Message::Shutdown => break,
        }
    }

    // Drain stragglers enqueued around shutdown
    for message in receiver.try_iter() {
        match message {
            Message::Reclaim(slot) => registry.reclaim(&slot),
            Message::Flush(done) => {
                let _ = done.send(());
            }
            Message::Shutdown => {}
        }
    }
}

/// Handle tying one native resource to its managed owner's lifetime
///
/// Store it as a field of the owner. Dropping it schedules the destructor on
/// the reaper thread.
pub struct NativeAllocation {
    slot: Arc<AllocationSlot>,
    registry: Arc<Registry>,
    sender: Sender<Message>,
}

impl NativeAllocation {
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    pub fn is_destroyed(&self) -> bool {
        self.slot.is_destroyed()
    }

    /// Run the destructor on the calling thread, bypassing the reaper
    pub fn destroy_now(&self) -> bool {
        self.registry.live.remove(&self.slot.id);
        let destroyed = self.slot.run();
        if destroyed {
            self.registry.reclaimed.fetch_add(1, Ordering::Relaxed);
        }
        destroyed
    }
}

impl Drop for NativeAllocation {
    fn drop(&mut self) {
        if self.slot.is_destroyed() {
            self.registry.live.remove(&self.slot.id);
            return;
        }
        if self.registry.closed.load(Ordering::Acquire) {
            self.registry.reclaim(&self.slot);
            return;
        }
        if let Err(channel::SendError(Message::Reclaim(slot))) =
            self.sender.send(Message::Reclaim(self.slot.clone()))
        {
            self.registry.reclaim(&slot);
        }
    }
}

impl std::fmt::Debug for NativeAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeAllocation")
            .field("id", &self.slot.id)
            .field("queue", &self.registry.name)
            .field("destroyed", &self.slot.is_destroyed())
            .finish()
    }
}
