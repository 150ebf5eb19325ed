//! Typthon NFI - native function interface for the Typthon runtime
//!
//! Managed code calls C-ABI functions through compiled signatures; native code
//! calls managed callables through trampolines. Values cross the boundary via
//! a type-directed serializer over an argument buffer with object patches.
//!
//! Architecture:
//! - `types` / `signature` - the native type system and compiled signatures
//! - `buffer` - primitive region plus patch list for one call
//! - `call` - managed -> native dispatch and the tiered call-site cache
//! - `closure` - reference-counted trampolines, native -> managed dispatch
//! - `reclaim` - deferred, exactly-once native resource reclamation
//! - `context` - interning, closure lookup, handles, libraries, disposal
//! - `backend` - libffi, library loading and a recording backend

pub mod backend;
pub mod buffer;
pub mod call;
pub mod closure;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod reclaim;
pub mod signature;
pub mod types;
pub mod value;

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};

// Re-export commonly used items
pub use backend::{LibffiBackend, Library, LoadFlags, NativeBackend, RecordedCall, RecordingBackend};
pub use buffer::{ArgumentBuffer, TypeTag};
pub use call::{invoke, CallSite, ReturnCategory, Tier};
pub use closure::{last_error, ClosureNativePointer, NativeClosure, ReturnShape};
pub use config::NfiConfig;
pub use context::NativeContext;
pub use error::{ConfigError, NfiError, Result};
pub use reclaim::{NativeAllocation, NativeAllocationQueue, NativeResource};
pub use signature::{Signature, SignatureBuilder, SignatureDescriptor};
pub use types::{CallDirection, NativeType, SimpleKind, TypeDescriptor};
pub use value::{ArrayData, Callable, ForeignValue, NativeAddress, ObjectRef, Value};

/// Install the log subscriber from `TYPTHON_NFI_LOG_*`
pub fn init() {
    logging::init();
}

/// Status of the last failed callback on the calling thread, 0 when none
#[no_mangle]
pub extern "C" fn typthon_nfi_last_error() -> i32 {
    closure::last_error()
}

/// Reset the calling thread's callback status
#[no_mangle]
pub extern "C" fn typthon_nfi_clear_error() {
    closure::entry::clear_last_error();
}

/// Run `op` against the context behind `env` and report its status to C
fn native_status(env: *const c_void, op: impl FnOnce(&NativeContext) -> Result<()>) -> i32 {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let ctx = NativeContext::from_env(NativeAddress::from_ptr(env)).ok_or(NfiError::Disposed)?;
        ctx.ensure_live()?;
        op(&ctx)
    }))
    .unwrap_or_else(|_| Err(NfiError::Backend("reference operation panicked".into())));

    match outcome {
        Ok(()) => 0,
        Err(error) => {
            tracing::warn!(event = "native_ref_failed", status = error.status_code(), error = %error, "Native reference operation failed");
            closure::entry::set_last_error(&error);
            error.status_code()
        }
    }
}

/// Take a reference to the trampoline `code` of the context behind `env`
///
/// Returns 0, or the status of the failure (also stored as the last error).
#[no_mangle]
pub extern "C" fn typthon_nfi_new_closure_ref(env: *const c_void, code: *const c_void) -> i32 {
    native_status(env, |ctx| ctx.new_closure_ref(NativeAddress::from_ptr(code)))
}

/// Drop a reference to `code`; the trampoline is reclaimed with its last one
#[no_mangle]
pub extern "C" fn typthon_nfi_release_closure_ref(env: *const c_void, code: *const c_void) -> i32 {
    native_status(env, |ctx| ctx.release_closure_ref(NativeAddress::from_ptr(code)))
}

/// Unpin an object handle a callback returned to native code
#[no_mangle]
pub extern "C" fn typthon_nfi_release_object_handle(env: *const c_void, handle: *const c_void) -> i32 {
    native_status(env, |ctx| ctx.release_object_handle(NativeAddress::from_ptr(handle)))
}
