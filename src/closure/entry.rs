//! Native -> managed dispatch
//!
//! Every trampoline lands in `native_entry` with its arguments already laid
//! out in an `ArgumentBuffer`. The return shape only changes how the result
//! reaches native code:
//! - `Object` pins the result in the handle table and returns the handle
//! - `String` returns a C string owned by the calling thread until its next
//!   string-returning callback
//! - `Void` discards the result
//! - `Buffer` serializes the result and widens it into a register carrier
//!
//! Errors and panics stop here. They are logged, recorded in the thread's
//! last-error slot and replaced by a zeroed result.

use super::ClosureData;
use crate::buffer::ArgumentBuffer;
use crate::context::NativeContext;
use crate::error::{NfiError, Result};
use crate::logging::log_callback_error;
use crate::types::NativeType;
use crate::value::{NativeAddress, Value};
use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::panic::{self, AssertUnwindSafe};

thread_local! {
    static LAST_ERROR: Cell<i32> = Cell::new(0);
    static STRING_RETURN: RefCell<Option<CString>> = RefCell::new(None);
}

/// Status of the last failed callback on this thread (0 when none)
pub fn last_error() -> i32 {
    LAST_ERROR.with(Cell::get)
}

pub fn clear_last_error() {
    LAST_ERROR.with(|e| e.set(0));
}

pub(crate) fn set_last_error(error: &NfiError) {
    LAST_ERROR.with(|e| e.set(error.status_code()));
}

/// Entry-point shape, chosen from the return type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    Object,
    String,
    Void,
    Buffer,
}

impl ReturnShape {
    pub fn for_type(ret: &NativeType) -> Self {
        match ret {
            NativeType::Object | NativeType::Nullable => Self::Object,
            NativeType::String => Self::String,
            NativeType::Void => Self::Void,
            _ => Self::Buffer,
        }
    }
}

/// Result of one callback, before it is turned into a carrier
#[derive(Debug)]
pub(crate) enum ClosureReturn {
    Void,
    Pointer(NativeAddress),
    Buffer(ArgumentBuffer),
}

impl ClosureReturn {
    fn into_carrier(self, ret: &NativeType) -> u64 {
        match self {
            Self::Void => 0,
            Self::Pointer(p) => p.0 as u64,
            Self::Buffer(buffer) => ret.carrier_from_bytes(buffer.bytes()),
        }
    }
}

/// Run one callback; never unwinds into native code
pub(crate) fn native_entry(data: &ClosureData, args: ArgumentBuffer) -> u64 {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(data, args)));
    let error = match outcome {
        Ok(Ok(result)) => return result.into_carrier(data.signature().ret_type()),
        Ok(Err(error)) => error,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            NfiError::Managed(format!("callback panicked: {}", message))
        }
    };

    log_callback_error(data.code_pointer().0, &error.to_string());
    set_last_error(&error);
    0
}

/// Deserialize arguments, call the managed callable, shape the result
pub(crate) fn dispatch(data: &ClosureData, mut args: ArgumentBuffer) -> Result<ClosureReturn> {
    let code = data.code_pointer();
    let owner = data.owner().ok_or(NfiError::DeadClosure(code.0))?;
    if owner.ref_count() == 0 {
        return Err(NfiError::DeadClosure(code.0));
    }
    let ctx = data.context().ok_or(NfiError::Disposed)?;
    ctx.ensure_live()?;
    let callable = data.callable().ok_or(NfiError::DeadClosure(code.0))?;

    let signature = data.signature();
    let mut values = Vec::with_capacity(signature.real_arg_count());
    for ty in signature.arg_types() {
        let value = ty.deserialize(&mut args, &ctx)?;
        if !ty.injected() {
            values.push(value);
        }
    }

    let result = callable.call(&values)?;
    drop(values);

    match data.shape() {
        ReturnShape::Void => Ok(ClosureReturn::Void),
        ReturnShape::Object => object_return(signature.ret_type(), result, &ctx),
        ReturnShape::String => string_return(result),
        ReturnShape::Buffer => {
            let ret = signature.ret_type();
            let mut buffer = ArgumentBuffer::new(ret.size());
            ret.serialize_return(&mut buffer, &result, &ctx)?;
            Ok(ClosureReturn::Buffer(buffer))
        }
    }
}

fn object_return(ret: &NativeType, result: Value, ctx: &NativeContext) -> Result<ClosureReturn> {
    if result.is_null() {
        return match ret {
            NativeType::Nullable => Ok(ClosureReturn::Pointer(NativeAddress::NULL)),
            _ => Err(NfiError::unsupported("object", "null")),
        };
    }
    // stays pinned until native code calls typthon_nfi_release_object_handle
    Ok(ClosureReturn::Pointer(ctx.pin_object_handle(result)))
}

fn string_return(result: Value) -> Result<ClosureReturn> {
    if result.is_null() {
        return Ok(ClosureReturn::Pointer(NativeAddress::NULL));
    }
    let s = result
        .as_string()
        .ok_or_else(|| NfiError::unsupported("string", result.type_name()))?;
    let c = CString::new(s).map_err(|_| NfiError::unsupported("string", "string with interior NUL"))?;
    let pointer = NativeAddress::from_ptr(c.as_ptr());
    STRING_RETURN.with(|slot| *slot.borrow_mut() = Some(c));
    Ok(ClosureReturn::Pointer(pointer))
}
