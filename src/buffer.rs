//! Per-call argument buffer
//!
//! Design: flat primitive region plus a side list of patches
//! - Storage is `u64`-backed so every slot is naturally aligned for the ABI
//! - The cursor only moves forward; each write aligns it first
//! - Pointer-like values leave a zero placeholder and a `(tag, offset)` patch
//!   carrying the managed payload

use crate::closure::NativeClosure;
use crate::types::{SimpleKind, POINTER_SIZE};
use crate::value::{ArrayData, ArrayRef, NativeAddress, Value};
use smallvec::SmallVec;
use std::sync::Arc;

/// What a patch slot stands for, as seen by the native bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Object = 0,
    String = 1,
    Closure = 2,
    Env = 3,
    BoolArray = 4,
    ByteArray = 5,
    CharArray = 6,
    ShortArray = 7,
    IntArray = 8,
    LongArray = 9,
    FloatArray = 10,
    DoubleArray = 11,
    Pointer = 12,
}

impl TypeTag {
    const ALL: [TypeTag; 13] = [
        Self::Object,
        Self::String,
        Self::Closure,
        Self::Env,
        Self::BoolArray,
        Self::ByteArray,
        Self::CharArray,
        Self::ShortArray,
        Self::IntArray,
        Self::LongArray,
        Self::FloatArray,
        Self::DoubleArray,
        Self::Pointer,
    ];

    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::ALL.get(bits as usize).copied()
    }

    pub fn for_array(data: &ArrayData) -> Self {
        match data {
            ArrayData::Bool(_) => Self::BoolArray,
            ArrayData::I8(_) | ArrayData::U8(_) => Self::ByteArray,
            ArrayData::U16(_) => Self::CharArray,
            ArrayData::I16(_) => Self::ShortArray,
            ArrayData::I32(_) | ArrayData::U32(_) => Self::IntArray,
            ArrayData::I64(_) | ArrayData::U64(_) => Self::LongArray,
            ArrayData::F32(_) => Self::FloatArray,
            ArrayData::F64(_) => Self::DoubleArray,
        }
    }

    /// Tag used when an array slot carries no managed array (null or raw pointer)
    pub fn for_kind(kind: SimpleKind) -> Self {
        match kind {
            SimpleKind::UInt8 | SimpleKind::SInt8 => Self::ByteArray,
            SimpleKind::UInt16 | SimpleKind::SInt16 => Self::ShortArray,
            SimpleKind::UInt32 | SimpleKind::SInt32 => Self::IntArray,
            SimpleKind::UInt64 | SimpleKind::SInt64 => Self::LongArray,
            SimpleKind::Float => Self::FloatArray,
            SimpleKind::Double => Self::DoubleArray,
            SimpleKind::Pointer => Self::Pointer,
        }
    }

    #[inline]
    pub fn is_array(self) -> bool {
        matches!(self as u8, 4..=11)
    }
}

/// Managed payload of a patch
#[derive(Debug, Clone)]
pub enum PatchValue {
    String(Arc<str>),
    Object(Value),
    Array(ArrayRef),
    /// Holds one closure reference for as long as the buffer lives
    Closure(NativeClosure),
    Pointer(NativeAddress),
    Env,
    Null,
}

#[derive(Debug, Clone)]
pub struct Patch {
    pub tag: TypeTag,
    pub offset: usize,
    pub value: PatchValue,
}

impl Patch {
    /// Packed form `(offset << 4) | tag` consumed by native bridges
    #[inline]
    pub fn encoded(&self) -> u32 {
        encode_patch(self.tag, self.offset)
    }
}

#[inline]
pub fn encode_patch(tag: TypeTag, offset: usize) -> u32 {
    ((offset as u32) << 4) | tag as u32
}

#[inline]
pub fn decode_patch(encoded: u32) -> Option<(TypeTag, usize)> {
    let tag = TypeTag::from_bits((encoded & 0xf) as u8)?;
    Some((tag, (encoded >> 4) as usize))
}

pub type Patches = SmallVec<[Patch; 4]>;

/// Argument or return data for one call
#[derive(Debug)]
pub struct ArgumentBuffer {
    storage: Vec<u64>,
    size: usize,
    position: usize,
    patches: Patches,
}

impl ArgumentBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            storage: vec![0; (size + 7) / 8],
            size,
            position: 0,
            patches: SmallVec::new(),
        }
    }

    /// Buffer pre-filled with native bytes, cursor at the start
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::new(bytes.len());
        buffer.bytes_mut().copy_from_slice(bytes);
        buffer
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the u64 storage covers at least `size` initialized bytes
        unsafe { std::slice::from_raw_parts(self.storage.as_ptr() as *const u8, self.size) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and the borrow is unique
        unsafe { std::slice::from_raw_parts_mut(self.storage.as_mut_ptr() as *mut u8, self.size) }
    }

    #[inline]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Primitive bytes and patches borrowed together for the bridge
    pub fn split_mut(&mut self) -> (&mut [u8], &[Patch]) {
        let size = self.size;
        // SAFETY: storage and patches are disjoint fields
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.storage.as_mut_ptr() as *mut u8, size)
        };
        (bytes, &self.patches)
    }

    /// Move the cursor to the next multiple of `alignment`
    #[inline]
    pub fn align(&mut self, alignment: usize) {
        debug_assert!(alignment.is_power_of_two());
        self.position = (self.position + alignment - 1) & !(alignment - 1);
    }

    fn write(&mut self, bytes: &[u8]) {
        self.align(bytes.len());
        let start = self.position;
        let end = start + bytes.len();
        assert!(end <= self.size, "argument buffer overflow at {}", start);
        self.bytes_mut()[start..end].copy_from_slice(bytes);
        self.position = end;
    }

    fn read<const N: usize>(&mut self) -> [u8; N] {
        self.align(N);
        let start = self.position;
        assert!(start + N <= self.size, "argument buffer underflow at {}", start);
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes()[start..start + N]);
        self.position = start + N;
        out
    }

    pub fn put_u8(&mut self, v: u8) {
        self.write(&[v]);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.write(&v.to_ne_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.write(&v.to_ne_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.write(&v.to_ne_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.write(&v.to_ne_bytes());
    }

    pub fn put_f64(&mut self, v: f64) {
        self.write(&v.to_ne_bytes());
    }

    pub fn put_pointer(&mut self, v: NativeAddress) {
        self.write(&v.0.to_ne_bytes());
    }

    /// Zero placeholder plus a patch recording the managed payload
    pub fn put_patch(&mut self, tag: TypeTag, value: PatchValue) {
        self.align(POINTER_SIZE);
        let offset = self.position;
        self.put_pointer(NativeAddress::NULL);
        self.patches.push(Patch { tag, offset, value });
    }

    pub fn get_u8(&mut self) -> u8 {
        self.read::<1>()[0]
    }

    pub fn get_u16(&mut self) -> u16 {
        u16::from_ne_bytes(self.read())
    }

    pub fn get_u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.read())
    }

    pub fn get_u64(&mut self) -> u64 {
        u64::from_ne_bytes(self.read())
    }

    pub fn get_f32(&mut self) -> f32 {
        f32::from_ne_bytes(self.read())
    }

    pub fn get_f64(&mut self) -> f64 {
        f64::from_ne_bytes(self.read())
    }

    pub fn get_pointer(&mut self) -> NativeAddress {
        NativeAddress(usize::from_ne_bytes(self.read()))
    }

    /// Write raw bytes at an absolute offset without moving the cursor
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        self.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }
}
