//! Recording backend - a simulated native side
//!
//! Nothing is executed natively. Every outbound call is recorded byte for byte
//! (primitive region before and after patch substitution, resolved patches,
//! the text behind string patches) and answered by a scriptable handler.
//! Closures get fake code pointers that `invoke_closure` dispatches through
//! the same entry point real trampolines use.

use super::{CallInterface, ClosureMemory, NativeBackend, NativeCall, ResolvedPatch};
use crate::buffer::TypeTag;
use crate::closure::{entry, ClosureData};
use crate::error::{NfiError, Result};
use crate::signature::Signature;
use crate::types::{NativeType, SimpleKind};
use crate::value::{NativeAddress, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const FIRST_CODE_POINTER: usize = 0x7f00_0000;
const CODE_POINTER_STRIDE: usize = 16;

type Handler = Arc<dyn Fn(NativeAddress, &RecordedCall) -> u64 + Send + Sync>;

/// One observed native call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub target: NativeAddress,
    /// Primitive region as serialized, placeholders zero
    pub primitive: Vec<u8>,
    /// Primitive region as native code would see it
    pub substituted: Vec<u8>,
    pub arg_offsets: Vec<usize>,
    pub patches: Vec<ResolvedPatch>,
    /// Contents of every string patch, in patch order
    pub strings: Vec<String>,
}

impl RecordedCall {
    fn read<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut raw = [0u8; N];
        raw.copy_from_slice(&self.substituted[offset..offset + N]);
        raw
    }

    pub fn u32_at(&self, offset: usize) -> u32 {
        u32::from_ne_bytes(self.read(offset))
    }

    pub fn u64_at(&self, offset: usize) -> u64 {
        u64::from_ne_bytes(self.read(offset))
    }

    pub fn f64_at(&self, offset: usize) -> f64 {
        f64::from_ne_bytes(self.read(offset))
    }

    pub fn pointer_at(&self, offset: usize) -> NativeAddress {
        NativeAddress(usize::from_ne_bytes(self.read(offset)))
    }
}

struct Recorder {
    prepared: AtomicUsize,
    fail_next_prepare: AtomicBool,
    retain_calls: AtomicBool,
    calls: Mutex<Vec<RecordedCall>>,
    handler: RwLock<Option<Handler>>,
    next_code: AtomicUsize,
    closures: Mutex<HashMap<usize, Arc<ClosureData>>>,
    freed: AtomicUsize,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            prepared: AtomicUsize::new(0),
            fail_next_prepare: AtomicBool::new(false),
            retain_calls: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            handler: RwLock::new(None),
            next_code: AtomicUsize::new(FIRST_CODE_POINTER),
            closures: Mutex::new(HashMap::new()),
            freed: AtomicUsize::new(0),
        }
    }
}

impl Recorder {
    fn record(&self, target: NativeAddress, call: &NativeCall<'_>) -> u64 {
        let storage = call.materialize();
        // SAFETY: materialize allocates at least primitive.len() bytes
        let substituted = unsafe {
            std::slice::from_raw_parts(storage.as_ptr() as *const u8, call.primitive.len())
        }
        .to_vec();

        let strings = call
            .patches
            .iter()
            .filter(|patch| patch.tag == TypeTag::String && !patch.pointer.is_null())
            .map(|patch| {
                // SAFETY: string patches point at C strings pinned for this call
                let s = unsafe { CStr::from_ptr(patch.pointer.as_ptr() as *const c_char) };
                s.to_string_lossy().into_owned()
            })
            .collect();

        let recorded = RecordedCall {
            target,
            primitive: call.primitive.to_vec(),
            substituted,
            arg_offsets: call.arg_offsets.to_vec(),
            patches: call.patches.to_vec(),
            strings,
        };

        let handler = self.handler.read().clone();
        let result = handler.map_or(0, |handler| handler(target, &recorded));
        if self.retain_calls.load(Ordering::Acquire) {
            self.calls.lock().push(recorded);
        }
        result
    }
}

struct RecordingCif {
    recorder: Arc<Recorder>,
}

impl CallInterface for RecordingCif {
    unsafe fn call_primitive(&self, target: NativeAddress, call: &NativeCall<'_>) -> u64 {
        self.recorder.record(target, call)
    }

    unsafe fn call_object(&self, target: NativeAddress, call: &NativeCall<'_>) -> NativeAddress {
        NativeAddress(self.recorder.record(target, call) as usize)
    }

    unsafe fn call_buffer(&self, target: NativeAddress, call: &NativeCall<'_>, ret: &mut [u8]) {
        let carrier = self.recorder.record(target, call).to_ne_bytes();
        let len = ret.len().min(carrier.len());
        ret[..len].copy_from_slice(&carrier[..len]);
    }
}

struct RecordingClosure {
    recorder: Arc<Recorder>,
    code: NativeAddress,
}

impl ClosureMemory for RecordingClosure {
    fn code_pointer(&self) -> NativeAddress {
        self.code
    }
}

impl Drop for RecordingClosure {
    fn drop(&mut self) {
        let data = self.recorder.closures.lock().remove(&self.code.0);
        drop(data);
        self.recorder.freed.fetch_add(1, Ordering::AcqRel);
    }
}

/// Backend that simulates native code instead of calling it
#[derive(Clone, Default)]
pub struct RecordingBackend {
    recorder: Arc<Recorder>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call with `raw` in the return carrier
    pub fn set_return(&self, raw: u64) {
        self.set_handler(move |_, _| raw);
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(NativeAddress, &RecordedCall) -> u64 + Send + Sync + 'static,
    {
        *self.recorder.handler.write() = Some(Arc::new(handler));
    }

    /// Make the next `prepare_cif` fail as if the ABI rejected it
    pub fn fail_next_prepare(&self) {
        self.recorder.fail_next_prepare.store(true, Ordering::Release);
    }

    /// Stop keeping call records; handlers still see every call
    pub fn discard_calls(&self) {
        self.recorder.retain_calls.store(false, Ordering::Release);
        self.recorder.calls.lock().clear();
    }

    /// Call interfaces prepared so far
    pub fn prepared_count(&self) -> usize {
        self.recorder.prepared.load(Ordering::Acquire)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.recorder.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.recorder.calls.lock().len()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.recorder.calls.lock().last().cloned()
    }

    /// Trampolines whose native memory is still allocated
    pub fn live_closures(&self) -> usize {
        self.recorder.closures.lock().len()
    }

    pub fn freed_closures(&self) -> usize {
        self.recorder.freed.load(Ordering::Acquire)
    }

    /// Call a trampoline the way native code would, with raw argument bytes
    /// laid out by its signature
    pub fn invoke_closure(&self, code: NativeAddress, args: &[u8]) -> u64 {
        let data = self.recorder.closures.lock().get(&code.0).cloned();
        let data = match data {
            Some(data) => data,
            None => {
                entry::set_last_error(&NfiError::DeadClosure(code.0));
                return 0;
            }
        };

        let mut buffer = data.signature().new_buffer();
        let len = args.len().min(buffer.size());
        buffer.write_at(0, &args[..len]);
        entry::native_entry(&data, buffer)
    }

    /// Like `invoke_closure`, packing scalar and pointer values first
    ///
    /// Pointer-like slots take `Value::Pointer`/`Value::Null`; env slots are
    /// passed as NULL.
    pub fn invoke_closure_with(&self, code: NativeAddress, args: &[Value]) -> Result<u64> {
        let data = self.recorder.closures.lock().get(&code.0).cloned();
        let data = data.ok_or(NfiError::DeadClosure(code.0))?;

        let signature = data.signature();
        let mut buffer = signature.new_buffer();
        let mut values = args.iter();
        for ty in signature.arg_types() {
            if ty.injected() {
                buffer.put_pointer(NativeAddress::NULL);
                continue;
            }
            let value = values.next().ok_or(NfiError::Arity {
                expected: signature.real_arg_count(),
                actual: args.len(),
            })?;
            match ty {
                NativeType::Simple(kind) => kind.serialize(&mut buffer, value)?,
                _ => SimpleKind::Pointer.serialize(&mut buffer, value)?,
            }
        }
        buffer.rewind();
        Ok(entry::native_entry(&data, buffer))
    }
}

impl std::fmt::Debug for RecordingBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingBackend")
            .field("prepared", &self.prepared_count())
            .field("calls", &self.call_count())
            .field("live_closures", &self.live_closures())
            .finish()
    }
}

impl NativeBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn prepare_cif(
        &self,
        _ret: &NativeType,
        _args: &[NativeType],
        _fixed_arg_count: Option<usize>,
    ) -> Result<Box<dyn CallInterface>> {
        if self.recorder.fail_next_prepare.swap(false, Ordering::AcqRel) {
            return Err(NfiError::Backend("call interface rejected".to_string()));
        }
        self.recorder.prepared.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(RecordingCif {
            recorder: self.recorder.clone(),
        }))
    }

    fn allocate_closure(
        &self,
        _signature: &Signature,
        data: Arc<ClosureData>,
    ) -> Result<Box<dyn ClosureMemory>> {
        let code = NativeAddress(
            self.recorder
                .next_code
                .fetch_add(CODE_POINTER_STRIDE, Ordering::Relaxed),
        );
        self.recorder.closures.lock().insert(code.0, data);
        Ok(Box::new(RecordingClosure {
            recorder: self.recorder.clone(),
            code,
        }))
    }
}
