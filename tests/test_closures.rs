//! Native -> managed calls through libffi trampolines

use std::ffi::c_void;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use typthon_nfi::{
    typthon_nfi_last_error, typthon_nfi_release_closure_ref, typthon_nfi_release_object_handle,
    Callable, ObjectRef, NativeAddress, NativeContext, NfiConfig, NfiError,
    SignatureBuilder, SignatureDescriptor, SimpleKind, TypeDescriptor, Value,
};

type IntCallback = extern "C" fn(i32) -> i32;

extern "C" fn apply_twice(callback: IntCallback, value: i32) -> i32 {
    callback(callback(value))
}

extern "C" fn sum_with(callback: extern "C" fn(f64, i64) -> f64, n: i64) -> f64 {
    (0..n).map(|i| callback(0.5, i)).sum()
}

/// Gets a callback from `factory`, uses it, then drops the reference it was handed
extern "C" fn use_and_release(
    env: *const c_void,
    factory: extern "C" fn() -> IntCallback,
    value: i32,
) -> i32 {
    let callback = factory();
    let result = callback(value);
    if typthon_nfi_release_closure_ref(env, callback as *const c_void) != 0 {
        return -1;
    }
    result
}

extern "C" fn take_object(env: *const c_void, produce: extern "C" fn() -> *const c_void) -> i32 {
    typthon_nfi_release_object_handle(env, produce())
}

fn context() -> NativeContext {
    NativeContext::with_config(NfiConfig::default())
}

fn int_callback() -> SignatureDescriptor {
    SignatureDescriptor::new(vec![SimpleKind::SInt32.into()], SimpleKind::SInt32.into())
}

fn callable<F>(f: F) -> Arc<dyn Callable>
where
    F: Fn(&[Value]) -> typthon_nfi::Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[test]
fn test_trampoline_called_directly() {
    let ctx = context();
    let signature = ctx.compile_signature(&int_callback()).unwrap();
    let closure = ctx
        .create_closure(
            &signature,
            callable(|args| Ok(Value::Int(args[0].as_i64().unwrap_or_default() * 10))),
        )
        .unwrap();

    let function: IntCallback = unsafe { std::mem::transmute(closure.code_pointer().as_ptr()) };
    assert_eq!(function(4), 40);
    assert_eq!(function(-3), -30);
}

#[test]
fn test_callable_argument_round_trip() {
    let ctx = context();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let signature = SignatureBuilder::new()
        .arg(TypeDescriptor::closure(int_callback()))
        .arg(SimpleKind::SInt32)
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();
    let increment = Value::callable(move |args| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Int(args[0].as_i64().unwrap_or_default() + 1))
    });

    let result = unsafe {
        ctx.invoke(&signature, NativeAddress(apply_twice as usize), &[increment, Value::Int(5)])
    }
    .unwrap();
    assert_eq!(result, Value::Int(7));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // the temporary trampoline is gone with the call
    assert_eq!(ctx.closure_count(), 0);
}

#[test]
fn test_mixed_argument_callback() {
    let ctx = context();
    let callback = SignatureDescriptor::new(
        vec![SimpleKind::Double.into(), SimpleKind::SInt64.into()],
        SimpleKind::Double.into(),
    );
    let signature = SignatureBuilder::new()
        .arg(TypeDescriptor::closure(callback.clone()))
        .arg(SimpleKind::SInt64)
        .returns(SimpleKind::Double)
        .build(&ctx)
        .unwrap();
    let closure = ctx
        .create_closure(
            &ctx.compile_signature(&callback).unwrap(),
            callable(|args| {
                let x = args[0].as_f64().unwrap_or_default();
                let i = args[1].as_f64().unwrap_or_default();
                Ok(Value::Double(x * i))
            }),
        )
        .unwrap();

    let result = unsafe {
        ctx.invoke(
            &signature,
            NativeAddress(sum_with as usize),
            &[Value::Closure(closure.clone()), Value::Int(4)],
        )
    }
    .unwrap();
    assert_eq!(result, Value::Double(3.0));
    assert_eq!(closure.ref_count(), 1);
}

#[test]
fn test_string_and_void_callbacks() {
    let ctx = context();
    let hits = Arc::new(AtomicUsize::new(0));

    let void_sig = SignatureBuilder::new().arg(SimpleKind::SInt32).build(&ctx).unwrap();
    let counter = hits.clone();
    let sink = ctx
        .create_closure(
            &void_sig,
            callable(move |args| {
                counter.fetch_add(args[0].as_i64().unwrap_or_default() as usize, Ordering::SeqCst);
                Ok(Value::Null)
            }),
        )
        .unwrap();
    let sink_fn: extern "C" fn(i32) = unsafe { std::mem::transmute(sink.code_pointer().as_ptr()) };
    sink_fn(3);
    sink_fn(4);
    assert_eq!(hits.load(Ordering::SeqCst), 7);

    let string_sig = SignatureBuilder::new()
        .arg(TypeDescriptor::String)
        .returns(TypeDescriptor::String)
        .build(&ctx)
        .unwrap();
    let shout = ctx
        .create_closure(
            &string_sig,
            callable(|args| Ok(Value::string(args[0].as_string().unwrap_or_default().to_uppercase()))),
        )
        .unwrap();
    let shout_fn: extern "C" fn(*const c_char) -> *const c_char =
        unsafe { std::mem::transmute(shout.code_pointer().as_ptr()) };
    let input = std::ffi::CString::new("quiet").unwrap();
    let output = unsafe { std::ffi::CStr::from_ptr(shout_fn(input.as_ptr())) };
    assert_eq!(output.to_str().unwrap(), "QUIET");
}

#[test]
fn test_failing_callback_reports_status() {
    let ctx = context();
    let signature = ctx.compile_signature(&int_callback()).unwrap();
    let closure = ctx
        .create_closure(
            &signature,
            callable(|_| Err(NfiError::Managed("refused".to_string()))),
        )
        .unwrap();
    let function: IntCallback = unsafe { std::mem::transmute(closure.code_pointer().as_ptr()) };

    typthon_nfi::closure::entry::clear_last_error();
    assert_eq!(function(1), 0);
    assert_eq!(typthon_nfi_last_error(), NfiError::Managed(String::new()).status_code());
}

#[test]
fn test_released_trampoline_refuses_calls() {
    let ctx = context();
    let signature = ctx.compile_signature(&int_callback()).unwrap();
    let closure = ctx
        .create_closure(&signature, callable(|args| Ok(args[0].clone())))
        .unwrap();
    let pointer = closure.native_pointer().clone();
    let function: IntCallback = unsafe { std::mem::transmute(closure.code_pointer().as_ptr()) };
    drop(closure);

    // memory is still mapped while `pointer` lives, but the closure is dead
    typthon_nfi::closure::entry::clear_last_error();
    assert_eq!(function(9), 0);
    assert_eq!(typthon_nfi_last_error(), 6);
    drop(pointer);
}

#[test]
fn test_concurrent_native_callers() {
    let ctx = context();
    let signature = ctx.compile_signature(&int_callback()).unwrap();
    let closure = ctx
        .create_closure(
            &signature,
            callable(|args| Ok(Value::Int(args[0].as_i64().unwrap_or_default() + 1))),
        )
        .unwrap();
    let code = closure.code_pointer().0;

    let workers: Vec<_> = (0..4)
        .map(|t| {
            thread::spawn(move || {
                let function: IntCallback = unsafe { std::mem::transmute(code) };
                (0..500).map(|i| function(t * 1000 + i) as i64).sum::<i64>()
            })
        })
        .collect();
    let total: i64 = workers.into_iter().map(|w| w.join().unwrap()).sum();

    let expected: i64 = (0..4)
        .flat_map(|t| (0..500).map(move |i| (t * 1000 + i + 1) as i64))
        .sum();
    assert_eq!(total, expected);
    drop(closure);
}

#[test]
fn test_native_code_releases_returned_callback() {
    let ctx = context();
    let signature = SignatureBuilder::new()
        .arg(TypeDescriptor::Env)
        .arg(TypeDescriptor::closure(SignatureDescriptor::new(
            vec![],
            TypeDescriptor::closure(int_callback()),
        )))
        .arg(SimpleKind::SInt32)
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();
    let factory = Value::callable(|_| {
        Ok(Value::callable(|args| Ok(Value::Int(args[0].as_i64().unwrap_or_default() * 3))))
    });
    ctx.queue().flush();
    let before = ctx.queue().stats();

    for i in 0..100 {
        let result = unsafe {
            ctx.invoke(&signature, NativeAddress(use_and_release as usize), &[factory.clone(), Value::Int(i)])
        }
        .unwrap();
        assert_eq!(result, Value::Int(i * 3));
        assert_eq!(ctx.closure_count(), 0);
    }

    ctx.queue().flush();
    let after = ctx.queue().stats();
    // one temporary factory trampoline and one returned callback per call
    assert!(after.reclaimed - before.reclaimed >= 200);
    assert_eq!(after.live, before.live);
}

#[test]
fn test_native_code_releases_returned_object() {
    let ctx = context();
    let signature = SignatureBuilder::new()
        .arg(TypeDescriptor::Env)
        .arg(TypeDescriptor::closure(SignatureDescriptor::new(vec![], TypeDescriptor::Object)))
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();
    let produce = Value::callable(|_| Ok(Value::Object(ObjectRef::new(String::from("payload")))));

    for _ in 0..100 {
        let status = unsafe {
            ctx.invoke(&signature, NativeAddress(take_object as usize), &[produce.clone()])
        }
        .unwrap();
        assert_eq!(status, Value::Int(0));
    }
    assert_eq!(ctx.object_handle_count(), 0);
}
