//! Tests for the native context

use super::*;
use crate::backend::RecordingBackend;
use crate::signature::SignatureBuilder;
use crate::types::SimpleKind;
use crate::value::ObjectRef;

fn context() -> (NativeContext, RecordingBackend) {
    let backend = RecordingBackend::new();
    let ctx = NativeContext::with_backend(Arc::new(backend.clone()), NfiConfig::default());
    (ctx, backend)
}

fn noop() -> Arc<dyn Callable> {
    Arc::new(|_: &[Value]| -> Result<Value> { Ok(Value::Null) })
}

#[test]
fn test_contexts_have_distinct_ids_and_queues() {
    let (a, _) = context();
    let (b, _) = context();
    assert_ne!(a.id(), b.id());
    assert_eq!(a.queue().name(), format!("typthon-nfi-reaper-{}", a.id()));
    assert_ne!(a.env_pointer(), b.env_pointer());
    assert!(!a.env_pointer().is_null());
}

#[test]
fn test_shared_queue_config() {
    let mut config = NfiConfig::default();
    config.reclamation.shared_queue = true;
    let ctx = NativeContext::with_backend(Arc::new(RecordingBackend::new()), config);
    assert_eq!(ctx.queue().name(), NativeAllocationQueue::global().name());

    // disposal of a shared-queue context leaves the global reaper running
    ctx.dispose();
    let marker = NativeAllocationQueue::global().register_native_allocation(u64::MAX, || {});
    drop(marker);
    NativeAllocationQueue::global().flush();
}

#[test]
fn test_object_handles() {
    let (ctx, _) = context();
    let object = Value::Object(ObjectRef::new(42u64));
    let handle = ctx.pin_object_handle(object.clone());

    assert!(!handle.is_null());
    assert_eq!(ctx.resolve_object_handle(handle).unwrap(), object);
    assert_eq!(ctx.object_handle_count(), 1);

    ctx.release_object_handle(handle).unwrap();
    assert!(matches!(
        ctx.resolve_object_handle(handle),
        Err(NfiError::UnknownObjectHandle(h)) if h == handle.0
    ));
    assert!(ctx.release_object_handle(handle).is_err());
}

#[test]
fn test_retain_closure_adds_reference() {
    let (ctx, _) = context();
    let signature = SignatureBuilder::new().build(&ctx).unwrap();
    let closure = ctx.create_closure(&signature, noop()).unwrap();

    let again = ctx.retain_closure(closure.code_pointer()).unwrap();
    assert_eq!(closure.ref_count(), 2);
    drop(again);
    assert_eq!(closure.ref_count(), 1);
    assert!(ctx.retain_closure(NativeAddress(0x10)).is_none());
}

#[test]
fn test_dispose_refuses_new_work() {
    let (ctx, _) = context();
    let signature = SignatureBuilder::new()
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();

    assert!(ctx.dispose());
    assert!(!ctx.dispose());
    assert!(ctx.is_disposed());

    assert_eq!(
        ctx.compile_signature(signature.descriptor()).unwrap_err(),
        NfiError::Disposed
    );
    assert_eq!(
        ctx.create_closure(&signature, noop()).unwrap_err(),
        NfiError::Disposed
    );
    let err = unsafe { ctx.invoke(&signature, NativeAddress(0x1000), &[]) }.unwrap_err();
    assert_eq!(err, NfiError::Disposed);
    assert!(ctx.load_library("libm.so.6", LoadFlags::default()).is_err());
}

#[test]
fn test_dispose_frees_native_memory_synchronously() {
    let (ctx, backend) = context();
    let signature = SignatureBuilder::new()
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();
    let closure = ctx.create_closure(&signature, noop()).unwrap();
    let handle = ctx.pin_object_handle(Value::Int(1));

    ctx.dispose();
    assert_eq!(backend.freed_closures(), 1);
    assert_eq!(backend.live_closures(), 0);
    assert!(signature.is_released());
    assert!(!closure.native_pointer().is_allocated());
    assert_eq!(ctx.closure_count(), 0);
    assert_eq!(ctx.cached_signature_count(), 0);
    assert!(ctx.resolve_object_handle(handle).is_err());

    // wrappers outliving the context release without touching freed memory
    let extra = closure.clone();
    drop(closure);
    drop(extra);
    drop(signature);
    assert_eq!(backend.freed_closures(), 1);
}

#[test]
fn test_trampoline_dead_after_dispose() {
    let (ctx, backend) = context();
    let signature = SignatureBuilder::new()
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();
    let closure = ctx.create_closure(&signature, noop()).unwrap();
    let code = closure.code_pointer();

    ctx.dispose();
    crate::closure::entry::clear_last_error();
    assert_eq!(backend.invoke_closure(code, &[]), 0);
    assert_eq!(crate::closure::last_error(), NfiError::DeadClosure(code.0).status_code());
}

#[test]
fn test_dropping_last_handle_disposes() {
    let (ctx, backend) = context();
    let signature = SignatureBuilder::new().build(&ctx).unwrap();
    let closure = ctx.create_closure(&signature, noop()).unwrap();
    drop(closure);
    drop(signature);
    drop(ctx);
    assert_eq!(backend.freed_closures(), 1);
}

#[test]
fn test_missing_library_and_symbol() {
    let (ctx, _) = context();
    let err = ctx
        .load_library("/nonexistent/libtypthon_missing.so", LoadFlags::default())
        .unwrap_err();
    assert!(matches!(err, NfiError::LibraryNotFound { .. }));

    let err = ctx
        .lookup_symbol("typthon_nfi_symbol_that_does_not_exist")
        .unwrap_err();
    assert!(matches!(err, NfiError::SymbolNotFound { .. }));
}

#[cfg(unix)]
#[test]
fn test_default_library_resolves_libc() {
    let (ctx, _) = context();
    let library = ctx.default_library().unwrap();
    assert!(Arc::ptr_eq(&library, &ctx.default_library().unwrap()));
    assert!(!ctx.lookup_symbol("strlen").unwrap().is_null());
}
