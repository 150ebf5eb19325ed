//! Real native calls through the libffi backend

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::Arc;
use typthon_nfi::{
    ArrayData, NativeAddress, NativeContext, NfiConfig, NfiError, ObjectRef, SignatureBuilder,
    SimpleKind, TypeDescriptor, Value,
};

extern "C" fn add_i32(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn scale(x: f64, factor: f32) -> f64 {
    x * factor as f64
}

extern "C" fn half(x: f32) -> f32 {
    x / 2.0
}

extern "C" fn negate_i8(x: i8) -> i8 {
    x.wrapping_neg()
}

extern "C" fn widen_u16(x: u16) -> u64 {
    x as u64 * 3
}

extern "C" fn sum_i32(data: *const i32, len: u32) -> i64 {
    let values = unsafe { std::slice::from_raw_parts(data, len as usize) };
    values.iter().map(|v| *v as i64).sum()
}

extern "C" fn fill_f64(data: *mut f64, len: u32, value: f64) {
    let values = unsafe { std::slice::from_raw_parts_mut(data, len as usize) };
    values.iter_mut().for_each(|v| *v = value);
}

extern "C" fn greeting() -> *const c_char {
    b"hello from native\0".as_ptr() as *const c_char
}

extern "C" fn count_bytes(s: *const c_char) -> u32 {
    if s.is_null() {
        return u32::MAX;
    }
    unsafe { CStr::from_ptr(s) }.to_bytes().len() as u32
}

extern "C" fn identity(handle: *const u8) -> *const u8 {
    handle
}

extern "C" fn env_is_set(env: *const u8, tag: i32) -> i32 {
    if env.is_null() {
        -1
    } else {
        tag
    }
}

fn address(f: usize) -> NativeAddress {
    NativeAddress(f)
}

fn context() -> NativeContext {
    NativeContext::with_config(NfiConfig::default())
}

#[test]
fn test_integer_call() {
    let ctx = context();
    let signature = SignatureBuilder::new()
        .args([SimpleKind::SInt32, SimpleKind::SInt32])
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();

    let result = unsafe {
        ctx.invoke(&signature, address(add_i32 as usize), &[Value::Int(40), Value::Int(2)])
    }
    .unwrap();
    assert_eq!(result, Value::Int(42));

    let result = unsafe {
        ctx.invoke(&signature, address(add_i32 as usize), &[Value::Int(i32::MAX as i64), Value::Int(1)])
    }
    .unwrap();
    assert_eq!(result, Value::Int(i32::MIN as i64));
}

#[test]
fn test_mixed_float_call() {
    let ctx = context();
    let signature = SignatureBuilder::new()
        .args([SimpleKind::Double, SimpleKind::Float])
        .returns(SimpleKind::Double)
        .build(&ctx)
        .unwrap();
    let result = unsafe {
        ctx.invoke(&signature, address(scale as usize), &[Value::Double(1.5), Value::Float(4.0)])
    }
    .unwrap();
    assert_eq!(result, Value::Double(6.0));

    let signature = SignatureBuilder::new()
        .arg(SimpleKind::Float)
        .returns(SimpleKind::Float)
        .build(&ctx)
        .unwrap();
    let result = unsafe { ctx.invoke(&signature, address(half as usize), &[Value::Float(5.0)]) }.unwrap();
    assert_eq!(result, Value::Float(2.5));
}

#[test]
fn test_small_integer_returns() {
    let ctx = context();
    let signature = SignatureBuilder::new()
        .arg(SimpleKind::SInt8)
        .returns(SimpleKind::SInt8)
        .build(&ctx)
        .unwrap();
    let result = unsafe { ctx.invoke(&signature, address(negate_i8 as usize), &[Value::Int(5)]) }.unwrap();
    assert_eq!(result, Value::Int(-5));

    let signature = SignatureBuilder::new()
        .arg(SimpleKind::UInt16)
        .returns(SimpleKind::UInt64)
        .build(&ctx)
        .unwrap();
    let result = unsafe {
        ctx.invoke(&signature, address(widen_u16 as usize), &[Value::Int(u16::MAX as i64)])
    }
    .unwrap();
    assert_eq!(result, Value::UInt(u16::MAX as u64 * 3));
}

#[test]
fn test_arrays() {
    let ctx = context();
    let sum = SignatureBuilder::new()
        .arg(TypeDescriptor::Array(SimpleKind::SInt32))
        .arg(SimpleKind::UInt32)
        .returns(SimpleKind::SInt64)
        .build(&ctx)
        .unwrap();
    let data = Value::array(ArrayData::I32(vec![1, -2, 30, 400]));
    let result = unsafe { ctx.invoke(&sum, address(sum_i32 as usize), &[data, Value::Int(4)]) }.unwrap();
    assert_eq!(result, Value::Int(429));

    let fill = SignatureBuilder::new()
        .args([
            TypeDescriptor::Array(SimpleKind::Double),
            SimpleKind::UInt32.into(),
            SimpleKind::Double.into(),
        ])
        .build(&ctx)
        .unwrap();
    let target = Value::array(ArrayData::F64(vec![0.0; 3]));
    unsafe {
        ctx.invoke(&fill, address(fill_f64 as usize), &[target.clone(), Value::Int(3), Value::Double(0.25)])
    }
    .unwrap();
    match target {
        Value::Array(array) => assert!(matches!(&*array.lock(), ArrayData::F64(v) if v.iter().all(|x| *x == 0.25))),
        _ => unreachable!(),
    }
}

#[test]
fn test_strings() {
    let ctx = context();
    let signature = SignatureBuilder::new()
        .returns(TypeDescriptor::String)
        .build(&ctx)
        .unwrap();
    let result = unsafe { ctx.invoke(&signature, address(greeting as usize), &[]) }.unwrap();
    assert_eq!(result, Value::string("hello from native"));

    let count = SignatureBuilder::new()
        .arg(TypeDescriptor::String)
        .returns(SimpleKind::UInt32)
        .build(&ctx)
        .unwrap();
    let result = unsafe { ctx.invoke(&count, address(count_bytes as usize), &[Value::string("héllo")]) }.unwrap();
    assert_eq!(result, Value::Int(6));
    let result = unsafe { ctx.invoke(&count, address(count_bytes as usize), &[Value::Null]) }.unwrap();
    assert_eq!(result, Value::Int(u32::MAX as i64));
}

#[test]
fn test_object_round_trip() {
    let ctx = context();
    let signature = SignatureBuilder::new()
        .arg(TypeDescriptor::Object)
        .returns(TypeDescriptor::Object)
        .build(&ctx)
        .unwrap();
    let object = Value::Object(ObjectRef::new(String::from("managed")));
    let result = unsafe { ctx.invoke(&signature, address(identity as usize), &[object.clone()]) }.unwrap();
    assert_eq!(result, object);
    assert_eq!(ctx.object_handle_count(), 0);
}

#[test]
fn test_env_argument() {
    let ctx = context();
    let signature = SignatureBuilder::new()
        .arg(TypeDescriptor::Env)
        .arg(SimpleKind::SInt32)
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();
    assert_eq!(signature.real_arg_count(), 1);
    let result = unsafe { ctx.invoke(&signature, address(env_is_set as usize), &[Value::Int(11)]) }.unwrap();
    assert_eq!(result, Value::Int(11));
}

#[cfg(unix)]
#[test]
fn test_libc_symbols() {
    let ctx = context();
    let strlen = ctx.lookup_symbol("strlen").unwrap();
    let signature = SignatureBuilder::new()
        .arg(TypeDescriptor::String)
        .returns(SimpleKind::UInt64)
        .build(&ctx)
        .unwrap();
    let result = unsafe { ctx.invoke(&signature, strlen, &[Value::string("typthon")]) }.unwrap();
    assert_eq!(result, Value::UInt(7));
}

#[cfg(unix)]
#[test]
fn test_variadic_snprintf() {
    let ctx = context();
    let snprintf = ctx.lookup_symbol("snprintf").unwrap();
    let signature = SignatureBuilder::new()
        .arg(TypeDescriptor::Array(SimpleKind::UInt8))
        .arg(SimpleKind::UInt64)
        .arg(TypeDescriptor::String)
        .varargs()
        .arg(SimpleKind::SInt32)
        .arg(TypeDescriptor::String)
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();
    assert_eq!(signature.fixed_arg_count(), Some(3));

    let out = Value::array(ArrayData::U8(vec![0; 32]));
    let written = unsafe {
        ctx.invoke(
            &signature,
            snprintf,
            &[out.clone(), Value::Int(32), Value::string("%d-%s"), Value::Int(42), Value::string("nfi")],
        )
    }
    .unwrap();
    assert_eq!(written, Value::Int(6));
    match out {
        Value::Array(array) => match &*array.lock() {
            ArrayData::U8(bytes) => assert_eq!(&bytes[..7], b"42-nfi\0"),
            other => panic!("unexpected array {:?}", other),
        },
        _ => unreachable!(),
    }
}

#[cfg(unix)]
#[test]
fn test_variadic_wide_arguments() {
    let ctx = context();
    let snprintf = ctx.lookup_symbol("snprintf").unwrap();
    let signature = SignatureBuilder::new()
        .arg(TypeDescriptor::Array(SimpleKind::UInt8))
        .arg(SimpleKind::UInt64)
        .arg(TypeDescriptor::String)
        .varargs()
        .arg(SimpleKind::Double)
        .arg(SimpleKind::SInt64)
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();

    for _ in 0..2 {
        let out = Value::array(ArrayData::U8(vec![0; 32]));
        let written = unsafe {
            ctx.invoke(
                &signature,
                snprintf,
                &[out.clone(), Value::Int(32), Value::string("%.2f|%lld"), Value::Double(2.5), Value::Int(-7_000_000_000)],
            )
        }
        .unwrap();
        assert_eq!(written, Value::Int(16));
        match out {
            Value::Array(array) => match &*array.lock() {
                ArrayData::U8(bytes) => assert_eq!(&bytes[..17], b"2.50|-7000000000\0"),
                other => panic!("unexpected array {:?}", other),
            },
            _ => unreachable!(),
        }
    }
}

#[test]
fn test_signature_interning_across_clones() {
    let ctx = context();
    let clone = ctx.clone();
    let a = SignatureBuilder::new().arg(SimpleKind::Pointer).build(&ctx).unwrap();
    let b = SignatureBuilder::new().arg(SimpleKind::Pointer).build(&clone).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn test_calls_after_dispose_fail() {
    let ctx = context();
    let signature = SignatureBuilder::new()
        .args([SimpleKind::SInt32, SimpleKind::SInt32])
        .returns(SimpleKind::SInt32)
        .build(&ctx)
        .unwrap();
    ctx.dispose();
    let err = unsafe { ctx.invoke(&signature, address(add_i32 as usize), &[Value::Int(1), Value::Int(2)]) }
        .unwrap_err();
    assert_eq!(err, NfiError::Disposed);
    assert!(signature.is_released());
}
