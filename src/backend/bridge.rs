//! Patch pinning for the duration of one native call
//!
//! Strings are copied into C strings, arrays stay locked and pass their data
//! pointer, objects get handle-table entries, closures contribute their code
//! pointer and env slots the context pointer. Everything is released when the
//! `PinnedPatches` drops, after the result has been deserialized.

use super::ResolvedPatch;
use crate::buffer::{Patch, PatchValue};
use crate::context::NativeContext;
use crate::error::{NfiError, Result};
use crate::value::{ArrayData, NativeAddress};
use parking_lot::MutexGuard;
use smallvec::SmallVec;
use std::ffi::CString;
use std::sync::Arc;

pub struct PinnedPatches<'a> {
    ctx: &'a NativeContext,
    resolved: SmallVec<[ResolvedPatch; 4]>,
    strings: SmallVec<[CString; 2]>,
    arrays: SmallVec<[(usize, MutexGuard<'a, ArrayData>); 2]>,
    handles: SmallVec<[NativeAddress; 2]>,
}

impl<'a> PinnedPatches<'a> {
    pub fn pin(ctx: &'a NativeContext, patches: &'a [Patch]) -> Result<Self> {
        let mut pinned = Self {
            ctx,
            resolved: SmallVec::with_capacity(patches.len()),
            strings: SmallVec::new(),
            arrays: SmallVec::new(),
            handles: SmallVec::new(),
        };

        for patch in patches {
            let pointer = pinned.resolve(&patch.value)?;
            pinned.resolved.push(ResolvedPatch {
                tag: patch.tag,
                offset: patch.offset,
                pointer,
            });
        }

        Ok(pinned)
    }

    fn resolve(&mut self, value: &'a PatchValue) -> Result<NativeAddress> {
        Ok(match value {
            PatchValue::Null => NativeAddress::NULL,
            PatchValue::Pointer(p) => *p,
            PatchValue::Env => self.ctx.env_pointer(),
            PatchValue::Closure(closure) => closure.code_pointer(),
            PatchValue::String(s) => {
                let c = CString::new(s.as_bytes())
                    .map_err(|_| NfiError::unsupported("string", "string with interior NUL"))?;
                let pointer = NativeAddress::from_ptr(c.as_ptr());
                self.strings.push(c);
                pointer
            }
            PatchValue::Object(value) => {
                let handle = self.ctx.pin_object_handle(value.clone());
                self.handles.push(handle);
                handle
            }
            PatchValue::Array(array) => {
                let key = Arc::as_ptr(array) as usize;
                // the same array passed twice is locked once
                match self.arrays.iter().position(|(k, _)| *k == key) {
                    Some(index) => NativeAddress::from_ptr(self.arrays[index].1.data_ptr()),
                    None => {
                        let mut guard = array.lock();
                        let pointer = NativeAddress::from_ptr(guard.data_ptr());
                        self.arrays.push((key, guard));
                        pointer
                    }
                }
            }
        })
    }

    pub fn resolved(&self) -> &[ResolvedPatch] {
        &self.resolved
    }
}

impl Drop for PinnedPatches<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = self.ctx.release_object_handle(handle);
        }
    }
}
