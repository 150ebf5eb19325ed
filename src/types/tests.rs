//! Tests for the native type system

use super::*;
use crate::backend::RecordingBackend;
use crate::config::NfiConfig;
use crate::signature::SignatureDescriptor;
use crate::value::{ArrayData, ObjectRef};

fn context() -> NativeContext {
    NativeContext::with_backend(Arc::new(RecordingBackend::new()), NfiConfig::default())
}

fn round_trip(kind: SimpleKind, value: Value) -> Value {
    let mut buffer = ArgumentBuffer::new(kind.size());
    kind.serialize(&mut buffer, &value).unwrap();
    buffer.rewind();
    kind.deserialize(&mut buffer)
}

#[test]
fn test_simple_round_trip_extremes() {
    let cases: Vec<(SimpleKind, Vec<Value>)> = vec![
        (SimpleKind::UInt8, vec![Value::Int(0), Value::Int(u8::MAX as i64), Value::Int(17)]),
        (SimpleKind::SInt8, vec![Value::Int(i8::MIN as i64), Value::Int(i8::MAX as i64), Value::Int(0), Value::Int(-1)]),
        (SimpleKind::UInt16, vec![Value::Int(0), Value::Int(u16::MAX as i64)]),
        (SimpleKind::SInt16, vec![Value::Int(i16::MIN as i64), Value::Int(i16::MAX as i64), Value::Int(-300)]),
        (SimpleKind::UInt32, vec![Value::Int(0), Value::Int(u32::MAX as i64)]),
        (SimpleKind::SInt32, vec![Value::Int(i32::MIN as i64), Value::Int(i32::MAX as i64), Value::Int(-42)]),
        (SimpleKind::UInt64, vec![Value::UInt(0), Value::UInt(u64::MAX), Value::UInt(1 << 63)]),
        (SimpleKind::SInt64, vec![Value::Int(i64::MIN), Value::Int(i64::MAX), Value::Int(0), Value::Int(-7)]),
        (SimpleKind::Float, vec![Value::Float(0.0), Value::Float(f32::MIN), Value::Float(f32::MAX), Value::Float(-1.5)]),
        (SimpleKind::Double, vec![Value::Double(0.0), Value::Double(f64::MIN), Value::Double(f64::MAX), Value::Double(-2.25)]),
        (SimpleKind::Pointer, vec![Value::Pointer(NativeAddress::NULL), Value::Pointer(NativeAddress(usize::MAX))]),
    ];

    for (kind, values) in cases {
        for value in values {
            assert_eq!(round_trip(kind, value.clone()), value, "{} round trip", kind);
        }
    }
}

#[test]
fn test_simple_narrowing() {
    assert_eq!(round_trip(SimpleKind::UInt8, Value::Int(0x1ff)), Value::Int(0xff));
    assert_eq!(round_trip(SimpleKind::SInt8, Value::Int(0xff)), Value::Int(-1));
    assert_eq!(round_trip(SimpleKind::SInt32, Value::Bool(true)), Value::Int(1));
    assert_eq!(round_trip(SimpleKind::UInt32, Value::Char('λ')), Value::Int('λ' as i64));
    assert_eq!(round_trip(SimpleKind::Double, Value::Int(3)), Value::Double(3.0));
    assert_eq!(round_trip(SimpleKind::SInt32, Value::Double(8.0)), Value::Int(8));
    assert_eq!(
        round_trip(SimpleKind::UInt64, Value::Double(1.5e19)),
        Value::UInt(15_000_000_000_000_000_000)
    );
    assert_eq!(round_trip(SimpleKind::UInt64, Value::Int(-1)), Value::UInt(u64::MAX));
}

#[test]
fn test_simple_rejects_non_numeric() {
    let mut buffer = ArgumentBuffer::new(8);
    let err = SimpleKind::SInt32
        .serialize(&mut buffer, &Value::string("12"))
        .unwrap_err();
    assert!(matches!(err, NfiError::UnsupportedType { .. }));

    let err = SimpleKind::SInt64
        .serialize(&mut buffer, &Value::Double(1.5))
        .unwrap_err();
    assert!(matches!(err, NfiError::UnsupportedType { .. }));
}

#[test]
fn test_sizes_and_slots() {
    assert_eq!(NativeType::Void.size(), 0);
    assert_eq!(NativeType::Simple(SimpleKind::SInt16).size(), 2);
    assert_eq!(NativeType::Simple(SimpleKind::Double).alignment(), 8);
    for ty in [NativeType::String, NativeType::Object, NativeType::Nullable, NativeType::Env, NativeType::Array(SimpleKind::Double)] {
        assert_eq!(ty.size(), POINTER_SIZE, "{}", ty);
        assert_eq!(ty.object_slot_count(), 1, "{}", ty);
    }
    assert_eq!(NativeType::Simple(SimpleKind::Pointer).object_slot_count(), 0);
    assert!(NativeType::Env.injected());
    assert!(!NativeType::String.injected());
}

#[test]
fn test_directions() {
    assert_eq!(NativeType::String.direction(), CallDirection::BOTH);
    assert_eq!(
        NativeType::Array(SimpleKind::SInt32).direction(),
        CallDirection::MANAGED_TO_NATIVE_ONLY
    );

    let m2n = CallDirection::MANAGED_TO_NATIVE_ONLY;
    let n2m = CallDirection::NATIVE_TO_MANAGED_ONLY;
    assert!(m2n.intersect(n2m).is_empty());
    assert_eq!(CallDirection::BOTH.intersect(m2n), m2n);
}

#[test]
fn test_closure_direction_follows_nested_signature() {
    let ctx = context();
    let callback = ctx
        .compile_signature(&SignatureDescriptor::new(vec![SimpleKind::SInt32.into()], TypeDescriptor::Void))
        .unwrap();
    assert_eq!(NativeType::Closure(callback).direction(), CallDirection::BOTH);

    // a callback taking an array can only be received, never exported
    let receive_only = ctx
        .compile_signature(&SignatureDescriptor::new(
            vec![TypeDescriptor::Array(SimpleKind::UInt8)],
            TypeDescriptor::Void,
        ))
        .unwrap();
    assert_eq!(
        NativeType::Closure(receive_only).direction(),
        CallDirection::NATIVE_TO_MANAGED_ONLY
    );
}

#[test]
fn test_string_serializes_as_patch() {
    let ctx = context();
    let mut buffer = ArgumentBuffer::new(POINTER_SIZE);
    NativeType::String
        .serialize(&mut buffer, &Value::string("hello"), &ctx)
        .unwrap();

    assert!(buffer.bytes().iter().all(|b| *b == 0));
    let patches = buffer.patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].tag, TypeTag::String);
    assert_eq!(patches[0].offset, 0);
    assert!(matches!(&patches[0].value, PatchValue::String(s) if &**s == "hello"));
}

#[test]
fn test_object_rejects_null_nullable_accepts() {
    let ctx = context();
    let mut buffer = ArgumentBuffer::new(POINTER_SIZE * 2);

    let err = NativeType::Object
        .serialize(&mut buffer, &Value::Null, &ctx)
        .unwrap_err();
    assert!(matches!(err, NfiError::UnsupportedType { .. }));

    NativeType::Nullable
        .serialize(&mut buffer, &Value::Null, &ctx)
        .unwrap();
    NativeType::Nullable
        .serialize(&mut buffer, &Value::Object(ObjectRef::new(1u8)), &ctx)
        .unwrap();
    assert!(matches!(buffer.patches()[0].value, PatchValue::Null));
    assert!(matches!(buffer.patches()[1].value, PatchValue::Object(_)));
}

#[test]
fn test_array_element_kind_checked() {
    let ctx = context();
    let mut buffer = ArgumentBuffer::new(POINTER_SIZE);
    let ints = Value::array(ArrayData::I32(vec![1, 2, 3]));

    let err = NativeType::Array(SimpleKind::Double)
        .serialize(&mut buffer, &ints, &ctx)
        .unwrap_err();
    assert!(matches!(err, NfiError::UnsupportedType { .. }));
    assert!(buffer.patches().is_empty());

    NativeType::Array(SimpleKind::SInt32)
        .serialize(&mut buffer, &ints, &ctx)
        .unwrap();
    assert_eq!(buffer.patches()[0].tag, TypeTag::IntArray);
}

#[test]
fn test_env_takes_no_value() {
    let ctx = context();
    let mut buffer = ArgumentBuffer::new(POINTER_SIZE);
    NativeType::Env
        .serialize(&mut buffer, &Value::Null, &ctx)
        .unwrap();
    assert_eq!(buffer.patches()[0].tag, TypeTag::Env);
    assert!(matches!(buffer.patches()[0].value, PatchValue::Env));
}

#[test]
fn test_float_carrier() {
    let kind = SimpleKind::Float;
    let carrier = kind.carrier_from_bytes(&1.5f32.to_ne_bytes());
    assert_eq!(kind.from_primitive(carrier), Value::Float(1.5));

    let carrier = SimpleKind::SInt8.carrier_from_bytes(&[0xff]);
    assert_eq!(carrier, u64::MAX);
    assert_eq!(SimpleKind::SInt8.from_primitive(carrier), Value::Int(-1));
    assert_eq!(SimpleKind::UInt16.from_primitive(0xdead_0001), Value::Int(1));
}

#[test]
fn test_from_pointer() {
    let ctx = context();
    assert_eq!(NativeType::String.from_pointer(NativeAddress::NULL, &ctx).unwrap(), Value::Null);

    let text = std::ffi::CString::new("native").unwrap();
    let value = NativeType::String
        .from_pointer(NativeAddress::from_ptr(text.as_ptr()), &ctx)
        .unwrap();
    assert_eq!(value, Value::string("native"));

    let err = NativeType::Object
        .from_pointer(NativeAddress(0xdead0), &ctx)
        .unwrap_err();
    assert!(matches!(err, NfiError::UnknownObjectHandle(_)));
}

#[test]
fn test_unknown_closure_pointer_stays_pointer() {
    let ctx = context();
    let signature = ctx
        .compile_signature(&SignatureDescriptor::new(vec![], SimpleKind::SInt32.into()))
        .unwrap();
    let value = NativeType::Closure(signature)
        .from_pointer(NativeAddress(0x4000), &ctx)
        .unwrap();
    assert_eq!(value, Value::Pointer(NativeAddress(0x4000)));
}

#[test]
fn test_descriptor_names() {
    assert_eq!(TypeDescriptor::from_name("sint32"), Some(TypeDescriptor::Simple(SimpleKind::SInt32)));
    assert_eq!(TypeDescriptor::from_name("[double]"), Some(TypeDescriptor::Array(SimpleKind::Double)));
    assert_eq!(TypeDescriptor::from_name("env"), Some(TypeDescriptor::Env));
    assert_eq!(TypeDescriptor::from_name("int"), None);
    assert_eq!(TypeDescriptor::Array(SimpleKind::UInt8).to_string(), "[uint8]");
    for kind in SimpleKind::ALL {
        assert_eq!(SimpleKind::from_name(kind.name()), Some(kind));
    }
}
