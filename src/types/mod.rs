//! Native type system - ABI description and marshalling of single values
//!
//! Design: a closed tagged union, matched exhaustively at every
//! serialization site:
//! - `simple.rs` - scalar kinds and their C-style conversions
//! - `descriptor.rs` - hashable descriptions used for interning
//!
//! Pointer-like types (string, object, array, closure, env) never store the
//! managed value in the primitive region. They write a zero placeholder and
//! record a patch the bridge resolves right before the native call.

mod descriptor;
mod simple;

#[cfg(test)]
mod tests;

pub use descriptor::TypeDescriptor;
pub use simple::{SimpleKind, POINTER_SIZE};

use crate::buffer::{ArgumentBuffer, PatchValue, TypeTag};
use crate::context::NativeContext;
use crate::error::{NfiError, Result};
use crate::signature::Signature;
use crate::value::{NativeAddress, Value};
use std::ffi::CStr;
use std::fmt;
use std::sync::Arc;

/// Call directions a type (or signature) may take part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallDirection {
    pub managed_to_native: bool,
    pub native_to_managed: bool,
}

impl CallDirection {
    pub const BOTH: Self = Self {
        managed_to_native: true,
        native_to_managed: true,
    };
    pub const MANAGED_TO_NATIVE_ONLY: Self = Self {
        managed_to_native: true,
        native_to_managed: false,
    };
    pub const NATIVE_TO_MANAGED_ONLY: Self = Self {
        managed_to_native: false,
        native_to_managed: true,
    };

    #[inline]
    pub const fn intersect(self, other: Self) -> Self {
        Self {
            managed_to_native: self.managed_to_native && other.managed_to_native,
            native_to_managed: self.native_to_managed && other.native_to_managed,
        }
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        !self.managed_to_native && !self.native_to_managed
    }
}

/// One ABI type
#[derive(Clone)]
pub enum NativeType {
    Void,
    Simple(SimpleKind),
    /// NUL-terminated UTF-8, passed by pointer
    String,
    /// Opaque managed object, passed by handle
    Object,
    /// `Object` that also admits null
    Nullable,
    /// Primitive array, passed by data pointer; managed to native only
    Array(SimpleKind),
    /// Function pointer carrying the callback's own signature
    Closure(Arc<Signature>),
    /// Engine-injected context pointer
    Env,
}

impl NativeType {
    #[inline]
    pub fn size(&self) -> usize {
        match self {
            Self::Void => 0,
            Self::Simple(kind) => kind.size(),
            _ => POINTER_SIZE,
        }
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        match self {
            Self::Void => 1,
            Self::Simple(kind) => kind.alignment(),
            _ => POINTER_SIZE,
        }
    }

    /// Patch slots one serialization of this type records
    #[inline]
    pub fn object_slot_count(&self) -> usize {
        match self {
            Self::Void | Self::Simple(_) => 0,
            _ => 1,
        }
    }

    pub fn direction(&self) -> CallDirection {
        match self {
            Self::Array(_) => CallDirection::MANAGED_TO_NATIVE_ONLY,
            Self::Closure(signature) if signature.direction().native_to_managed => {
                CallDirection::BOTH
            }
            // a native function pointer can still be received and called
            Self::Closure(_) => CallDirection::NATIVE_TO_MANAGED_ONLY,
            _ => CallDirection::BOTH,
        }
    }

    /// Supplied by the engine rather than the caller
    #[inline]
    pub fn injected(&self) -> bool {
        matches!(self, Self::Env)
    }

    pub fn descriptor(&self) -> TypeDescriptor {
        match self {
            Self::Void => TypeDescriptor::Void,
            Self::Simple(kind) => TypeDescriptor::Simple(*kind),
            Self::String => TypeDescriptor::String,
            Self::Object => TypeDescriptor::Object,
            Self::Nullable => TypeDescriptor::Nullable,
            Self::Array(kind) => TypeDescriptor::Array(*kind),
            Self::Closure(signature) => TypeDescriptor::closure(signature.descriptor().clone()),
            Self::Env => TypeDescriptor::Env,
        }
    }

    /// Serialize one argument at the buffer's aligned cursor
    pub fn serialize(
        &self,
        buffer: &mut ArgumentBuffer,
        value: &Value,
        ctx: &NativeContext,
    ) -> Result<()> {
        match self {
            Self::Void => Err(NfiError::unsupported("void", value.type_name())),
            Self::Simple(kind) => kind.serialize(buffer, value),
            Self::String => {
                let patch = match value {
                    Value::Null => PatchValue::Null,
                    Value::String(s) => PatchValue::String(s.clone()),
                    Value::Pointer(p) => PatchValue::Pointer(*p),
                    other => match other.as_string() {
                        Some(s) => PatchValue::String(Arc::from(s)),
                        None if other.is_null() => PatchValue::Null,
                        None => return Err(NfiError::unsupported("string", other.type_name())),
                    },
                };
                buffer.put_patch(TypeTag::String, patch);
                Ok(())
            }
            Self::Object => {
                if value.is_null() {
                    return Err(NfiError::unsupported("object", "null"));
                }
                buffer.put_patch(TypeTag::Object, PatchValue::Object(value.clone()));
                Ok(())
            }
            Self::Nullable => {
                let patch = if value.is_null() {
                    PatchValue::Null
                } else {
                    PatchValue::Object(value.clone())
                };
                buffer.put_patch(TypeTag::Object, patch);
                Ok(())
            }
            Self::Array(kind) => {
                let (tag, patch) = match value {
                    Value::Array(array) => {
                        let data = array.lock();
                        if !kind.accepts_array(&data) {
                            return Err(NfiError::unsupported(
                                format!("[{}]", kind),
                                format!("array<{}>", data.element_name()),
                            ));
                        }
                        (TypeTag::for_array(&data), PatchValue::Array(array.clone()))
                    }
                    Value::Null => (TypeTag::for_kind(*kind), PatchValue::Null),
                    Value::Pointer(p) => (TypeTag::for_kind(*kind), PatchValue::Pointer(*p)),
                    other => {
                        return Err(NfiError::unsupported(format!("[{}]", kind), other.type_name()))
                    }
                };
                buffer.put_patch(tag, patch);
                Ok(())
            }
            Self::Closure(signature) => {
                let patch = match value {
                    Value::Null => PatchValue::Null,
                    Value::Pointer(p) => PatchValue::Pointer(*p),
                    Value::Closure(closure) => PatchValue::Closure(closure.clone()),
                    Value::Callable(callable) => {
                        // lives as long as the patch, i.e. for the duration of the call
                        PatchValue::Closure(ctx.create_closure(signature, callable.clone())?)
                    }
                    other => match other.as_pointer() {
                        Some(p) => PatchValue::Pointer(p),
                        None => {
                            return Err(NfiError::unsupported(
                                signature.descriptor().to_string(),
                                other.type_name(),
                            ))
                        }
                    },
                };
                buffer.put_patch(TypeTag::Closure, patch);
                Ok(())
            }
            Self::Env => {
                buffer.put_patch(TypeTag::Env, PatchValue::Env);
                Ok(())
            }
        }
    }

    /// Serialize a callback result into a return buffer
    ///
    /// Only register-sized results go through a buffer. A closure returned to
    /// native code carries one reference the receiver now owns.
    pub fn serialize_return(
        &self,
        buffer: &mut ArgumentBuffer,
        value: &Value,
        ctx: &NativeContext,
    ) -> Result<()> {
        match self {
            Self::Void => Ok(()),
            Self::Simple(kind) => kind.serialize(buffer, value),
            Self::Closure(signature) => {
                let code = match value {
                    Value::Null => NativeAddress::NULL,
                    Value::Pointer(p) => *p,
                    Value::Closure(closure) => closure.export(),
                    Value::Callable(callable) => {
                        ctx.create_closure(signature, callable.clone())?.export()
                    }
                    other => other.as_pointer().ok_or_else(|| {
                        NfiError::unsupported(signature.descriptor().to_string(), other.type_name())
                    })?,
                };
                buffer.put_pointer(code);
                Ok(())
            }
            other => Err(NfiError::unsupported(other.to_string(), value.type_name())),
        }
    }

    /// Read one value at the buffer's aligned cursor
    pub fn deserialize(&self, buffer: &mut ArgumentBuffer, ctx: &NativeContext) -> Result<Value> {
        match self {
            Self::Void => Ok(Value::Null),
            Self::Simple(kind) => Ok(kind.deserialize(buffer)),
            _ => {
                let address = buffer.get_pointer();
                self.from_pointer(address, ctx)
            }
        }
    }

    /// Convert a pointer produced by native code into a managed value
    pub fn from_pointer(&self, address: NativeAddress, ctx: &NativeContext) -> Result<Value> {
        match self {
            Self::Env => Ok(Value::Null),
            Self::Simple(SimpleKind::Pointer) => Ok(Value::Pointer(address)),
            _ if address.is_null() => Ok(Value::Null),
            Self::String => {
                // SAFETY: native code hands out NUL-terminated strings for this type
                let s = unsafe { CStr::from_ptr(address.as_ptr() as *const std::os::raw::c_char) };
                Ok(Value::String(Arc::from(s.to_string_lossy().as_ref())))
            }
            Self::Object | Self::Nullable => ctx.resolve_object_handle(address),
            Self::Closure(_) => Ok(ctx
                .retain_closure(address)
                .map(Value::Closure)
                .unwrap_or(Value::Pointer(address))),
            other => Err(NfiError::unsupported(other.to_string(), "native pointer")),
        }
    }

    /// Reinterpret a register-return carrier
    pub fn from_primitive(&self, raw: u64) -> Value {
        match self {
            Self::Void => Value::Null,
            Self::Simple(kind) => kind.from_primitive(raw),
            _ => Value::Pointer(NativeAddress(raw as usize)),
        }
    }

    /// Widen serialized return bytes into a register carrier
    pub fn carrier_from_bytes(&self, bytes: &[u8]) -> u64 {
        match self {
            Self::Void => 0,
            Self::Simple(kind) => kind.carrier_from_bytes(bytes),
            _ => SimpleKind::Pointer.carrier_from_bytes(bytes),
        }
    }
}

impl PartialEq for NativeType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Simple(a), Self::Simple(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Closure(a), Self::Closure(b)) => Arc::ptr_eq(a, b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Simple(kind) => f.write_str(kind.name()),
            Self::String => f.write_str("string"),
            Self::Object => f.write_str("object"),
            Self::Nullable => f.write_str("nullable"),
            Self::Array(kind) => write!(f, "[{}]", kind),
            Self::Closure(signature) => write!(f, "{}", signature.descriptor()),
            Self::Env => f.write_str("env"),
        }
    }
}

impl fmt::Debug for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeType({})", self)
    }
}
