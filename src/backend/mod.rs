//! Native backends - call-interface preparation and invocation primitives
//!
//! Architecture:
//! - `ffi.rs` - real calls and trampolines through libffi
//! - `recording.rs` - simulated native side that records what it observes
//! - `bridge.rs` - pins patch payloads and resolves them to native pointers
//! - `library.rs` - dynamic library loading and symbol resolution
//!
//! The engine only talks to `NativeBackend`, `CallInterface` and
//! `ClosureMemory`; everything ABI-specific lives behind them.

mod bridge;
mod ffi;
mod library;
mod recording;

pub use bridge::PinnedPatches;
pub use ffi::LibffiBackend;
pub use library::{Library, LoadFlags};
pub use recording::{RecordedCall, RecordingBackend};

use crate::buffer::TypeTag;
use crate::closure::ClosureData;
use crate::error::Result;
use crate::signature::Signature;
use crate::types::NativeType;
use crate::value::NativeAddress;
use std::sync::Arc;

/// Patch after pinning: the native pointer substituted at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPatch {
    pub tag: TypeTag,
    pub offset: usize,
    pub pointer: NativeAddress,
}

/// Everything a backend needs for one outbound call
#[derive(Debug)]
pub struct NativeCall<'a> {
    /// Serialized primitive region, placeholders still zero
    pub primitive: &'a [u8],
    /// Start of each argument inside `primitive`
    pub arg_offsets: &'a [usize],
    pub patches: &'a [ResolvedPatch],
}

impl NativeCall<'_> {
    /// Primitive region with every placeholder replaced by its pinned pointer,
    /// in word-aligned storage
    pub fn materialize(&self) -> Vec<u64> {
        let mut storage = vec![0u64; (self.primitive.len() + 7) / 8];
        // SAFETY: storage spans at least primitive.len() bytes
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(storage.as_mut_ptr() as *mut u8, self.primitive.len())
        };
        bytes.copy_from_slice(self.primitive);
        for patch in self.patches {
            let raw = patch.pointer.0.to_ne_bytes();
            bytes[patch.offset..patch.offset + raw.len()].copy_from_slice(&raw);
        }
        storage
    }
}

/// A prepared call interface for one signature
pub trait CallInterface: Send + Sync {
    /// Call returning a primitive in a register carrier
    ///
    /// # Safety
    /// `target` must be a function whose C signature matches the one this
    /// interface was prepared for, and every pointer in `call` must be valid.
    unsafe fn call_primitive(&self, target: NativeAddress, call: &NativeCall<'_>) -> u64;

    /// Call returning a pointer-sized object, string or handle
    ///
    /// # Safety
    /// As for `call_primitive`.
    unsafe fn call_object(&self, target: NativeAddress, call: &NativeCall<'_>) -> NativeAddress;

    /// Call writing its result into `ret`
    ///
    /// # Safety
    /// As for `call_primitive`; `ret` must be at least the return type's size.
    unsafe fn call_buffer(&self, target: NativeAddress, call: &NativeCall<'_>, ret: &mut [u8]);
}

/// Native memory of one allocated trampoline; freed on drop
pub trait ClosureMemory: Send + Sync {
    fn code_pointer(&self) -> NativeAddress;
}

/// The ABI provider behind a context
pub trait NativeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare a call interface; `fixed_arg_count` marks a variadic function
    fn prepare_cif(
        &self,
        ret: &NativeType,
        args: &[NativeType],
        fixed_arg_count: Option<usize>,
    ) -> Result<Box<dyn CallInterface>>;

    /// Allocate a trampoline that forwards native calls to `data`
    fn allocate_closure(
        &self,
        signature: &Signature,
        data: Arc<ClosureData>,
    ) -> Result<Box<dyn ClosureMemory>>;
}
