//! Call dispatch - managed -> native
//!
//! Design: validate, serialize, pin, invoke, deserialize
//! 1. Refuse calls on a disposed context or a signature that cannot be
//!    called from managed code
//! 2. Check arity before any buffer exists
//! 3. Serialize every argument in declaration order; injected slots get an
//!    engine placeholder
//! 4. Pin patches, call through the entry point matching the return category
//! 5. Deserialize the result while the patches are still pinned
//!
//! `cache.rs` layers the tiered call-site cache on top; every tier ends in
//! `execute`.

mod cache;


pub use cache::{CallSite, Tier};

use crate::backend::{NativeCall, PinnedPatches};
use crate::buffer::ArgumentBuffer;
use crate::context::NativeContext;
use crate::error::{NfiError, Result};
use crate::logging::log_native_call;
use crate::signature::Signature;
use crate::types::NativeType;
use crate::value::{NativeAddress, Value};

/// How a native function hands back its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCategory {
    /// Register return reinterpreted through `from_primitive`
    Primitive,
    /// Pointer-sized string, object or handle
    Object,
    /// Result written into a return buffer
    Buffer,
}

impl ReturnCategory {
    pub fn of(ret: &NativeType) -> Self {
        match ret {
            NativeType::Void | NativeType::Simple(_) => Self::Primitive,
            NativeType::String | NativeType::Object | NativeType::Nullable => Self::Object,
            _ => Self::Buffer,
        }
    }
}

/// Call `address` through `signature` with managed arguments
///
/// # Safety
/// `address` must point to a function with exactly this C signature.
pub unsafe fn invoke(
    ctx: &NativeContext,
    signature: &Signature,
    address: NativeAddress,
    args: &[Value],
) -> Result<Value> {
    check_callable(ctx, signature, args.len())?;
    let mut buffer = signature.new_buffer();
    serialize_arguments(ctx, signature, &mut buffer, args)?;
    execute(ctx, signature, address, buffer)
}

/// Context, direction and arity checks shared by every tier
pub(crate) fn check_callable(ctx: &NativeContext, signature: &Signature, actual: usize) -> Result<()> {
    ctx.ensure_live()?;
    if !signature.direction().managed_to_native {
        return Err(NfiError::InvalidCallDirection {
            signature: signature.descriptor().to_string(),
            direction: "from managed code",
        });
    }
    let expected = signature.real_arg_count();
    if actual != expected {
        return Err(NfiError::Arity { expected, actual });
    }
    Ok(())
}

/// Generic serializer: resolve each type's behavior per call
pub(crate) fn serialize_arguments(
    ctx: &NativeContext,
    signature: &Signature,
    buffer: &mut ArgumentBuffer,
    args: &[Value],
) -> Result<()> {
    let mut values = args.iter();
    for ty in signature.arg_types() {
        if ty.injected() {
            ty.serialize(buffer, &Value::Null, ctx)?;
        } else {
            let value = values.next().ok_or(NfiError::Arity {
                expected: signature.real_arg_count(),
                actual: args.len(),
            })?;
            ty.serialize(buffer, value, ctx)?;
        }
    }
    Ok(())
}

/// Pin, invoke and deserialize a fully serialized buffer
pub(crate) unsafe fn execute(
    ctx: &NativeContext,
    signature: &Signature,
    address: NativeAddress,
    mut buffer: ArgumentBuffer,
) -> Result<Value> {
    if address.is_null() {
        return Err(NfiError::Backend("call through a null function pointer".to_string()));
    }
    debug_assert_eq!(buffer.patches().len(), signature.object_slot_count());

    let cif = signature.call_interface().ok_or(NfiError::Disposed)?;
    let (primitive, patches) = buffer.split_mut();
    let pinned = PinnedPatches::pin(ctx, patches)?;
    let call = NativeCall {
        primitive,
        arg_offsets: signature.arg_offsets(),
        patches: pinned.resolved(),
    };

    if ctx.config().call.trace_calls {
        log_native_call(&signature.descriptor().to_string(), address.0, signature.real_arg_count());
    }

    let ret = signature.ret_type();
    let result = match ReturnCategory::of(ret) {
        ReturnCategory::Primitive => {
            let raw = cif.call_primitive(address, &call);
            Ok(ret.from_primitive(raw))
        }
        ReturnCategory::Object => {
            let pointer = cif.call_object(address, &call);
            ret.from_pointer(pointer, ctx)
        }
        ReturnCategory::Buffer => {
            let mut out = ArgumentBuffer::new(ret.size());
            cif.call_buffer(address, &call, out.bytes_mut());
            ret.deserialize(&mut out, ctx)
        }
    };

    drop(pinned);
    result
}
