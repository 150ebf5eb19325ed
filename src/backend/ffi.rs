//! libffi backend
//!
//! Call interfaces are `middle::Cif`s (raw `ffi_prep_cif_var` cifs for
//! variadic functions) invoked through `raw::ffi_call`; trampolines are
//! `middle::Closure`s whose userdata is the closure's `ClosureData`.

use super::{CallInterface, ClosureMemory, NativeBackend, NativeCall};
use crate::buffer::ArgumentBuffer;
use crate::closure::{entry, ClosureData};
use crate::error::{NfiError, Result};
use crate::signature::Signature;
use crate::types::{NativeType, SimpleKind};
use crate::value::NativeAddress;
use ::libffi::low::{self, ffi_cif, ffi_type};
use ::libffi::middle::{Cif, Closure, Type};
use ::libffi::raw;
use core::ffi::c_void;
use smallvec::SmallVec;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Backend performing real native calls
#[derive(Debug, Default, Clone, Copy)]
pub struct LibffiBackend;

impl LibffiBackend {
    pub fn new() -> Self {
        Self
    }
}

fn ffi_type(ty: &NativeType) -> Type {
    match ty {
        NativeType::Void => Type::void(),
        NativeType::Simple(kind) => match kind {
            SimpleKind::UInt8 => Type::u8(),
            SimpleKind::SInt8 => Type::i8(),
            SimpleKind::UInt16 => Type::u16(),
            SimpleKind::SInt16 => Type::i16(),
            SimpleKind::UInt32 => Type::u32(),
            SimpleKind::SInt32 => Type::i32(),
            SimpleKind::UInt64 => Type::u64(),
            SimpleKind::SInt64 => Type::i64(),
            SimpleKind::Float => Type::f32(),
            SimpleKind::Double => Type::f64(),
            SimpleKind::Pointer => Type::pointer(),
        },
        _ => Type::pointer(),
    }
}

fn build_cif(ret: &NativeType, args: &[NativeType]) -> Result<Cif> {
    let ret = ffi_type(ret);
    let args: Vec<Type> = args.iter().map(ffi_type).collect();
    // middle::Cif panics when ffi_prep_cif rejects the type list
    panic::catch_unwind(AssertUnwindSafe(move || Cif::new(args, ret)))
        .map_err(|_| NfiError::Backend("ffi_prep_cif rejected the signature".to_string()))
}

/// Variadic call interface prepared through `ffi_prep_cif_var`
///
/// `middle::Cif` has no variadic constructor, so the raw cif is kept next to
/// the type list it points into.
struct VariadicCif {
    cif: Box<ffi_cif>,
    _arg_types: Vec<*mut ffi_type>,
    _args: Vec<Type>,
    _ret: Type,
}

impl VariadicCif {
    fn new(ret: &NativeType, args: &[NativeType], fixed_arg_count: usize) -> Result<Self> {
        let ret = ffi_type(ret);
        let args: Vec<Type> = args.iter().map(ffi_type).collect();
        let mut arg_types: Vec<*mut ffi_type> = args.iter().map(Type::as_raw_ptr).collect();
        let mut cif: Box<ffi_cif> = Box::default();

        // SAFETY: every pointer handed to libffi is owned by the returned value
        unsafe {
            low::prep_cif_var(
                &mut *cif,
                low::ffi_abi_FFI_DEFAULT_ABI,
                fixed_arg_count,
                args.len(),
                ret.as_raw_ptr(),
                arg_types.as_mut_ptr(),
            )
        }
        .map_err(|e| NfiError::Backend(format!("ffi_prep_cif_var rejected the signature: {:?}", e)))?;

        Ok(Self {
            cif,
            _arg_types: arg_types,
            _args: args,
            _ret: ret,
        })
    }
}

enum PreparedCif {
    Fixed(Cif),
    Variadic(VariadicCif),
}

impl PreparedCif {
    fn as_raw_ptr(&self) -> *mut ffi_cif {
        match self {
            Self::Fixed(cif) => cif.as_raw_ptr(),
            Self::Variadic(variadic) => &*variadic.cif as *const ffi_cif as *mut ffi_cif,
        }
    }
}

struct LibffiCif {
    cif: PreparedCif,
}

// SAFETY: the cif is immutable after preparation; ffi_call only reads it
unsafe impl Send for LibffiCif {}
unsafe impl Sync for LibffiCif {}

impl LibffiCif {
    unsafe fn raw_call(&self, target: NativeAddress, call: &NativeCall<'_>, rvalue: *mut c_void) {
        let mut storage = call.materialize();
        let base = storage.as_mut_ptr() as *mut u8;
        let mut args: SmallVec<[*mut c_void; 8]> = call
            .arg_offsets
            .iter()
            .map(|offset| base.add(*offset) as *mut c_void)
            .collect();
        let function = std::mem::transmute::<usize, unsafe extern "C" fn()>(target.0);
        raw::ffi_call(self.cif.as_raw_ptr(), Some(function), rvalue, args.as_mut_ptr());
    }
}

impl CallInterface for LibffiCif {
    unsafe fn call_primitive(&self, target: NativeAddress, call: &NativeCall<'_>) -> u64 {
        // wide enough for ffi_arg-widened integers and doubles
        let mut carrier = 0u64;
        self.raw_call(target, call, &mut carrier as *mut u64 as *mut c_void);
        carrier
    }

    unsafe fn call_object(&self, target: NativeAddress, call: &NativeCall<'_>) -> NativeAddress {
        let mut carrier = 0usize;
        self.raw_call(target, call, &mut carrier as *mut usize as *mut c_void);
        NativeAddress(carrier)
    }

    unsafe fn call_buffer(&self, target: NativeAddress, call: &NativeCall<'_>, ret: &mut [u8]) {
        if ret.len() >= std::mem::size_of::<u64>() {
            self.raw_call(target, call, ret.as_mut_ptr() as *mut c_void);
        } else {
            let mut carrier = 0u64;
            self.raw_call(target, call, &mut carrier as *mut u64 as *mut c_void);
            ret.copy_from_slice(&carrier.to_ne_bytes()[..ret.len()]);
        }
    }
}

struct LibffiClosure {
    // dropped before `_data`, which it points into
    closure: Closure<'static>,
    code: NativeAddress,
    _data: Arc<ClosureData>,
}

// SAFETY: the trampoline is immutable once prepared and ClosureData is Sync
unsafe impl Send for LibffiClosure {}
unsafe impl Sync for LibffiClosure {}

impl ClosureMemory for LibffiClosure {
    fn code_pointer(&self) -> NativeAddress {
        self.code
    }
}

impl std::fmt::Debug for LibffiClosure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LibffiClosure({}, {:p})", self.code, self.closure.code_ptr())
    }
}

/// Trampoline target: copy the native arguments into a buffer laid out by the
/// signature and hand it to the shared entry
unsafe extern "C" fn closure_entry(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    data: &ClosureData,
) {
    let signature = data.signature();
    let mut buffer: ArgumentBuffer = signature.new_buffer();
    for (i, (ty, offset)) in signature
        .arg_types()
        .iter()
        .zip(signature.arg_offsets())
        .enumerate()
    {
        let source = *args.add(i) as *const u8;
        buffer.write_at(*offset, std::slice::from_raw_parts(source, ty.size()));
    }

    let carrier = entry::native_entry(data, buffer);
    if !matches!(signature.ret_type(), NativeType::Void) {
        *result = carrier;
    }
}

impl NativeBackend for LibffiBackend {
    fn name(&self) -> &'static str {
        "libffi"
    }

    fn prepare_cif(
        &self,
        ret: &NativeType,
        args: &[NativeType],
        fixed_arg_count: Option<usize>,
    ) -> Result<Box<dyn CallInterface>> {
        let cif = match fixed_arg_count {
            Some(fixed) => PreparedCif::Variadic(VariadicCif::new(ret, args, fixed)?),
            None => PreparedCif::Fixed(build_cif(ret, args)?),
        };
        Ok(Box::new(LibffiCif { cif }))
    }

    fn allocate_closure(
        &self,
        signature: &Signature,
        data: Arc<ClosureData>,
    ) -> Result<Box<dyn ClosureMemory>> {
        let cif = build_cif(signature.ret_type(), signature.arg_types())?;
        // SAFETY: the returned memory owns `data` and drops the closure first
        let userdata: &'static ClosureData = unsafe { &*Arc::as_ptr(&data) };
        let closure = panic::catch_unwind(AssertUnwindSafe(|| {
            Closure::new(cif, closure_entry, userdata)
        }))
        .map_err(|_| NfiError::Backend("closure allocation failed".to_string()))?;
        let code = NativeAddress(*closure.code_ptr() as usize);

        Ok(Box::new(LibffiClosure {
            closure,
            code,
            _data: data,
        }))
    }
}
