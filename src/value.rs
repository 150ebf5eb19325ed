//! Managed values crossing the native boundary
//!
//! `Value` is what callers hand to `invoke` and what managed callables receive
//! from native code. Host runtimes plug their own objects in through two small
//! capability traits: `Callable` (invoke with an argument array) and
//! `ForeignValue` (probe and coerce to number / string / pointer).

use crate::closure::NativeClosure;
use crate::error::Result;
use core::ffi::c_void;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Raw native address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct NativeAddress(pub usize);

impl NativeAddress {
    pub const NULL: Self = Self(0);

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

impl fmt::Debug for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeAddress({:#x})", self.0)
    }
}

impl fmt::Display for NativeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A managed callable: the one host capability closures need
pub trait Callable: Send + Sync {
    fn call(&self, args: &[Value]) -> Result<Value>;
}

impl<F> Callable for F
where
    F: Fn(&[Value]) -> Result<Value> + Send + Sync,
{
    fn call(&self, args: &[Value]) -> Result<Value> {
        self(args)
    }
}

/// Coercion surface for host objects the engine does not know natively
pub trait ForeignValue: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &str;

    fn is_null(&self) -> bool {
        false
    }

    fn as_i64(&self) -> Option<i64> {
        None
    }

    fn as_f64(&self) -> Option<f64> {
        None
    }

    fn as_string(&self) -> Option<String> {
        None
    }

    fn as_pointer(&self) -> Option<NativeAddress> {
        None
    }
}

/// Opaque managed object passed to native code by handle
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn Any + Send + Sync>);

impl ObjectRef {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", Arc::as_ptr(&self.0) as *const u8)
    }
}

/// Primitive array storage, passed to native code by data pointer
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Bool(Vec<bool>),
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::U64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pointer to the first element; stays valid while the array is locked
    pub fn data_ptr(&mut self) -> *mut c_void {
        match self {
            Self::Bool(v) => v.as_mut_ptr().cast(),
            Self::I8(v) => v.as_mut_ptr().cast(),
            Self::U8(v) => v.as_mut_ptr().cast(),
            Self::I16(v) => v.as_mut_ptr().cast(),
            Self::U16(v) => v.as_mut_ptr().cast(),
            Self::I32(v) => v.as_mut_ptr().cast(),
            Self::U32(v) => v.as_mut_ptr().cast(),
            Self::I64(v) => v.as_mut_ptr().cast(),
            Self::U64(v) => v.as_mut_ptr().cast(),
            Self::F32(v) => v.as_mut_ptr().cast(),
            Self::F64(v) => v.as_mut_ptr().cast(),
        }
    }

    pub fn element_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::I8(_) => "i8",
            Self::U8(_) => "u8",
            Self::I16(_) => "i16",
            Self::U16(_) => "u16",
            Self::I32(_) => "i32",
            Self::U32(_) => "u32",
            Self::I64(_) => "i64",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
        }
    }
}

/// Shared, lockable primitive array; native code may write into it
pub type ArrayRef = Arc<Mutex<ArrayData>>;

/// A managed value
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Char(char),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    String(Arc<str>),
    Pointer(NativeAddress),
    Object(ObjectRef),
    Array(ArrayRef),
    Closure(NativeClosure),
    Callable(Arc<dyn Callable>),
    Foreign(Arc<dyn ForeignValue>),
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Self::String(Arc::from(s.as_ref()))
    }

    pub fn array(data: ArrayData) -> Self {
        Self::Array(Arc::new(Mutex::new(data)))
    }

    pub fn callable<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        Self::Callable(Arc::new(f))
    }

    pub fn type_name(&self) -> String {
        match self {
            Self::Null => "null".into(),
            Self::Bool(_) => "bool".into(),
            Self::Char(_) => "char".into(),
            Self::Int(_) => "int".into(),
            Self::UInt(_) => "uint".into(),
            Self::Float(_) => "float".into(),
            Self::Double(_) => "double".into(),
            Self::String(_) => "string".into(),
            Self::Pointer(_) => "pointer".into(),
            Self::Object(_) => "object".into(),
            Self::Array(a) => format!("array<{}>", a.lock().element_name()),
            Self::Closure(_) => "closure".into(),
            Self::Callable(_) => "callable".into(),
            Self::Foreign(f) => f.type_name().to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Foreign(f) => f.is_null(),
            _ => false,
        }
    }

    /// Exact integer view: booleans and characters widen, integral floats convert
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(*b as i64),
            Self::Char(c) => Some(*c as u32 as i64),
            Self::Int(i) => Some(*i),
            Self::UInt(u) => Some(*u as i64),
            Self::Float(f) => integral(*f as f64),
            Self::Double(d) => integral(*d),
            Self::Foreign(f) => f.as_i64().or_else(|| f.as_f64().and_then(integral)),
            _ => None,
        }
    }

    /// Unsigned view for 64-bit unsigned targets: negative integers wrap,
    /// integral floats convert exactly up to `u64::MAX`
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(u) => Some(*u),
            Self::Float(f) => unsigned_integral(*f as f64).or_else(|| integral(*f as f64).map(|i| i as u64)),
            Self::Double(d) => unsigned_integral(*d).or_else(|| integral(*d).map(|i| i as u64)),
            Self::Foreign(f) => f
                .as_i64()
                .map(|i| i as u64)
                .or_else(|| f.as_f64().and_then(unsigned_integral)),
            other => other.as_i64().map(|i| i as u64),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Char(c) => Some(*c as u32 as f64),
            Self::Int(i) => Some(*i as f64),
            Self::UInt(u) => Some(*u as f64),
            Self::Float(f) => Some(*f as f64),
            Self::Double(d) => Some(*d),
            Self::Foreign(f) => f.as_f64().or_else(|| f.as_i64().map(|i| i as f64)),
            _ => None,
        }
    }

    /// Unboxes to a string; only string-like values qualify
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.to_string()),
            Self::Foreign(f) => f.as_string(),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<NativeAddress> {
        match self {
            Self::Null => Some(NativeAddress::NULL),
            Self::Pointer(p) => Some(*p),
            Self::Int(i) => Some(NativeAddress(*i as usize)),
            Self::UInt(u) => Some(NativeAddress(*u as usize)),
            Self::Closure(c) => Some(c.code_pointer()),
            Self::Foreign(f) if f.is_null() => Some(NativeAddress::NULL),
            Self::Foreign(f) => f.as_pointer(),
            _ => None,
        }
    }
}

fn integral(d: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is already out of range
    if d.fract() == 0.0 && d >= i64::MIN as f64 && d < i64::MAX as f64 {
        Some(d as i64)
    } else {
        None
    }
}

fn unsigned_integral(d: f64) -> Option<u64> {
    // u64::MAX as f64 rounds up to 2^64
    if d.fract() == 0.0 && d >= 0.0 && d < u64::MAX as f64 {
        Some(d as u64)
    } else {
        None
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Char(a), Self::Char(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Pointer(a), Self::Pointer(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a.ptr_eq(b),
            (Self::Array(a), Self::Array(b)) => Arc::ptr_eq(a, b),
            (Self::Closure(a), Self::Closure(b)) => a.code_pointer() == b.code_pointer(),
            (Self::Callable(a), Self::Callable(b)) => Arc::ptr_eq(a, b),
            (Self::Foreign(a), Self::Foreign(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({})", b),
            Self::Char(c) => write!(f, "Char({:?})", c),
            Self::Int(i) => write!(f, "Int({})", i),
            Self::UInt(u) => write!(f, "UInt({})", u),
            Self::Float(x) => write!(f, "Float({})", x),
            Self::Double(x) => write!(f, "Double({})", x),
            Self::String(s) => write!(f, "String({:?})", s),
            Self::Pointer(p) => write!(f, "Pointer({})", p),
            Self::Object(o) => write!(f, "{:?}", o),
            Self::Array(a) => write!(f, "Array({:?})", a.lock()),
            Self::Closure(c) => write!(f, "Closure({})", c.code_pointer()),
            Self::Callable(_) => write!(f, "Callable"),
            Self::Foreign(x) => write!(f, "Foreign({:?})", x),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::string(v)
    }
}

impl From<NativeAddress> for Value {
    fn from(v: NativeAddress) -> Self {
        Self::Pointer(v)
    }
}
