//! Scalar ABI kinds
//!
//! Serialization performs the narrowing a C call would: the managed value is
//! coerced to an integer or float and truncated to the target width.

use crate::buffer::ArgumentBuffer;
use crate::error::{NfiError, Result};
use crate::value::{ArrayData, NativeAddress, Value};
use std::fmt;

pub const POINTER_SIZE: usize = std::mem::size_of::<usize>();

/// Scalar kinds with a fixed C representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SimpleKind {
    UInt8,
    SInt8,
    UInt16,
    SInt16,
    UInt32,
    SInt32,
    UInt64,
    SInt64,
    Float,
    Double,
    Pointer,
}

impl SimpleKind {
    pub const ALL: [SimpleKind; 11] = [
        Self::UInt8,
        Self::SInt8,
        Self::UInt16,
        Self::SInt16,
        Self::UInt32,
        Self::SInt32,
        Self::UInt64,
        Self::SInt64,
        Self::Float,
        Self::Double,
        Self::Pointer,
    ];

    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::UInt8 | Self::SInt8 => 1,
            Self::UInt16 | Self::SInt16 => 2,
            Self::UInt32 | Self::SInt32 | Self::Float => 4,
            Self::UInt64 | Self::SInt64 | Self::Double => 8,
            Self::Pointer => POINTER_SIZE,
        }
    }

    /// Natural alignment
    #[inline]
    pub const fn alignment(self) -> usize {
        self.size()
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::SInt8 | Self::SInt16 | Self::SInt32 | Self::SInt64)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::UInt8 => "uint8",
            Self::SInt8 => "sint8",
            Self::UInt16 => "uint16",
            Self::SInt16 => "sint16",
            Self::UInt32 => "uint32",
            Self::SInt32 => "sint32",
            Self::UInt64 => "uint64",
            Self::SInt64 => "sint64",
            Self::Float => "float",
            Self::Double => "double",
            Self::Pointer => "pointer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Whether an array with this element kind may carry `data`
    pub fn accepts_array(self, data: &ArrayData) -> bool {
        use ArrayData as A;
        match self {
            Self::UInt8 | Self::SInt8 => matches!(data, A::Bool(_) | A::I8(_) | A::U8(_)),
            Self::UInt16 | Self::SInt16 => matches!(data, A::I16(_) | A::U16(_)),
            Self::UInt32 | Self::SInt32 => matches!(data, A::I32(_) | A::U32(_)),
            Self::UInt64 | Self::SInt64 => matches!(data, A::I64(_) | A::U64(_)),
            Self::Float => matches!(data, A::F32(_)),
            Self::Double => matches!(data, A::F64(_)),
            Self::Pointer => false,
        }
    }

    fn integer(self, value: &Value) -> Result<i64> {
        value
            .as_i64()
            .ok_or_else(|| NfiError::unsupported(self.name(), value.type_name()))
    }

    fn unsigned(self, value: &Value) -> Result<u64> {
        value
            .as_u64()
            .ok_or_else(|| NfiError::unsupported(self.name(), value.type_name()))
    }

    fn float(self, value: &Value) -> Result<f64> {
        value
            .as_f64()
            .ok_or_else(|| NfiError::unsupported(self.name(), value.type_name()))
    }

    /// Write one value at the buffer's aligned cursor
    pub fn serialize(self, buffer: &mut ArgumentBuffer, value: &Value) -> Result<()> {
        match self {
            Self::UInt8 | Self::SInt8 => buffer.put_u8(self.integer(value)? as u8),
            Self::UInt16 | Self::SInt16 => buffer.put_u16(self.integer(value)? as u16),
            Self::UInt32 | Self::SInt32 => buffer.put_u32(self.integer(value)? as u32),
            Self::UInt64 => buffer.put_u64(self.unsigned(value)?),
            Self::SInt64 => buffer.put_u64(self.integer(value)? as u64),
            Self::Float => buffer.put_f32(self.float(value)? as f32),
            Self::Double => buffer.put_f64(self.float(value)?),
            Self::Pointer => {
                let address = value
                    .as_pointer()
                    .ok_or_else(|| NfiError::unsupported(self.name(), value.type_name()))?;
                buffer.put_pointer(address);
            }
        }
        Ok(())
    }

    /// Read one value at the buffer's aligned cursor
    pub fn deserialize(self, buffer: &mut ArgumentBuffer) -> Value {
        match self {
            Self::UInt8 => Value::Int(buffer.get_u8() as i64),
            Self::SInt8 => Value::Int(buffer.get_u8() as i8 as i64),
            Self::UInt16 => Value::Int(buffer.get_u16() as i64),
            Self::SInt16 => Value::Int(buffer.get_u16() as i16 as i64),
            Self::UInt32 => Value::Int(buffer.get_u32() as i64),
            Self::SInt32 => Value::Int(buffer.get_u32() as i32 as i64),
            Self::UInt64 => Value::UInt(buffer.get_u64()),
            Self::SInt64 => Value::Int(buffer.get_u64() as i64),
            Self::Float => Value::Float(buffer.get_f32()),
            Self::Double => Value::Double(buffer.get_f64()),
            Self::Pointer => Value::Pointer(buffer.get_pointer()),
        }
    }

    /// Reinterpret a register-return carrier
    pub fn from_primitive(self, raw: u64) -> Value {
        match self {
            Self::UInt8 => Value::Int(raw as u8 as i64),
            Self::SInt8 => Value::Int(raw as u8 as i8 as i64),
            Self::UInt16 => Value::Int(raw as u16 as i64),
            Self::SInt16 => Value::Int(raw as u16 as i16 as i64),
            Self::UInt32 => Value::Int(raw as u32 as i64),
            Self::SInt32 => Value::Int(raw as u32 as i32 as i64),
            Self::UInt64 => Value::UInt(raw),
            Self::SInt64 => Value::Int(raw as i64),
            Self::Float => Value::Float(f32::from_bits(float_bits(raw))),
            Self::Double => Value::Double(f64::from_bits(raw)),
            Self::Pointer => Value::Pointer(NativeAddress(raw as usize)),
        }
    }

    /// Widen a serialized value into a register-return carrier
    ///
    /// Integers are sign or zero extended to the full word. A float keeps its
    /// bits in the first four bytes of the carrier.
    pub fn carrier_from_bytes(self, bytes: &[u8]) -> u64 {
        match self {
            Self::UInt8 => bytes[0] as u64,
            Self::SInt8 => bytes[0] as i8 as i64 as u64,
            Self::UInt16 => u16::from_ne_bytes(take(bytes)) as u64,
            Self::SInt16 => i16::from_ne_bytes(take(bytes)) as i64 as u64,
            Self::UInt32 => u32::from_ne_bytes(take(bytes)) as u64,
            Self::SInt32 => i32::from_ne_bytes(take(bytes)) as i64 as u64,
            Self::UInt64 | Self::SInt64 | Self::Double => u64::from_ne_bytes(take(bytes)),
            Self::Float => {
                let mut carrier = [0u8; 8];
                carrier[..4].copy_from_slice(&bytes[..4]);
                u64::from_ne_bytes(carrier)
            }
            Self::Pointer => usize::from_ne_bytes(take(bytes)) as u64,
        }
    }
}

impl fmt::Display for SimpleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn take<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[cfg(target_endian = "little")]
#[inline]
fn float_bits(raw: u64) -> u32 {
    raw as u32
}

#[cfg(target_endian = "big")]
#[inline]
fn float_bits(raw: u64) -> u32 {
    (raw >> 32) as u32
}
