//! Compiled call signatures
//!
//! Design: one validation + layout pass, then the backend prepares the call
//! interface. Nothing is allocated natively until every check passed, so a
//! rejected descriptor leaves no trace. The prepared interface is registered
//! with the context's reclamation queue and freed after the last
//! `Arc<Signature>` is gone.

mod descriptor;


pub use descriptor::{SignatureBuilder, SignatureDescriptor};

use crate::backend::CallInterface;
use crate::buffer::ArgumentBuffer;
use crate::context::NativeContext;
use crate::error::{NfiError, Result};
use crate::logging::log_signature_compiled;
use crate::reclaim::{NativeAllocation, NativeResource};
use crate::types::{CallDirection, NativeType, SimpleKind, TypeDescriptor};
use parking_lot::MappedRwLockReadGuard;
use std::fmt;

/// Primitive-region layout of an argument list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub offsets: Vec<usize>,
    pub primitive_size: usize,
    pub object_slot_count: usize,
    pub real_arg_count: usize,
}

impl Layout {
    pub fn of(types: &[NativeType]) -> Self {
        let mut offsets = Vec::with_capacity(types.len());
        let mut position = 0usize;
        let mut object_slot_count = 0;
        let mut real_arg_count = 0;

        for ty in types {
            let align = ty.alignment();
            position = (position + align - 1) & !(align - 1);
            offsets.push(position);
            position += ty.size();
            object_slot_count += ty.object_slot_count();
            if !ty.injected() {
                real_arg_count += 1;
            }
        }

        Self {
            offsets,
            primitive_size: position,
            object_slot_count,
            real_arg_count,
        }
    }
}

/// A compiled, immutable function type
pub struct Signature {
    descriptor: SignatureDescriptor,
    arg_types: Vec<NativeType>,
    ret_type: NativeType,
    direction: CallDirection,
    layout: Layout,
    fixed_arg_count: Option<usize>,
    cif: NativeResource<Box<dyn CallInterface>>,
    _allocation: NativeAllocation,
}

impl Signature {
    pub fn descriptor(&self) -> &SignatureDescriptor {
        &self.descriptor
    }

    pub fn arg_types(&self) -> &[NativeType] {
        &self.arg_types
    }

    pub fn ret_type(&self) -> &NativeType {
        &self.ret_type
    }

    #[inline]
    pub fn real_arg_count(&self) -> usize {
        self.layout.real_arg_count
    }

    #[inline]
    pub fn primitive_size(&self) -> usize {
        self.layout.primitive_size
    }

    #[inline]
    pub fn object_slot_count(&self) -> usize {
        self.layout.object_slot_count
    }

    #[inline]
    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn arg_offsets(&self) -> &[usize] {
        &self.layout.offsets
    }

    pub fn fixed_arg_count(&self) -> Option<usize> {
        self.fixed_arg_count
    }

    /// Fresh argument buffer sized for one call
    #[inline]
    pub fn new_buffer(&self) -> ArgumentBuffer {
        ArgumentBuffer::new(self.layout.primitive_size)
    }

    /// The prepared call interface, held for the duration of a call
    pub fn call_interface(&self) -> Option<MappedRwLockReadGuard<'_, Box<dyn CallInterface>>> {
        self.cif.get()
    }

    /// Whether the native call interface was already freed (context disposal)
    pub fn is_released(&self) -> bool {
        !self.cif.is_live()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signature")
            .field("descriptor", &self.descriptor.to_string())
            .field("primitive_size", &self.layout.primitive_size)
            .field("object_slot_count", &self.layout.object_slot_count)
            .field("direction", &self.direction)
            .finish()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.descriptor, f)
    }
}

/// Reject types used in positions they cannot occupy
fn validate_positions(descriptor: &SignatureDescriptor) -> Result<()> {
    match &descriptor.ret {
        TypeDescriptor::Array(_) => {
            return Err(NfiError::invalid_signature(format!(
                "{}: array types cannot be returned",
                descriptor
            )))
        }
        TypeDescriptor::Env => {
            return Err(NfiError::invalid_signature(format!(
                "{}: env cannot be returned",
                descriptor
            )))
        }
        _ => {}
    }

    for arg in &descriptor.args {
        match arg {
            TypeDescriptor::Void => {
                return Err(NfiError::invalid_signature(format!(
                    "{}: void is not an argument type",
                    descriptor
                )))
            }
            TypeDescriptor::Array(SimpleKind::Pointer) => {
                return Err(NfiError::invalid_signature(format!(
                    "{}: pointer arrays are not supported",
                    descriptor
                )))
            }
            _ => {}
        }
    }

    if let Some(fixed) = descriptor.fixed_arg_count {
        if fixed > descriptor.args.len() {
            return Err(NfiError::invalid_signature(format!(
                "{}: {} fixed arguments declared for {} arguments",
                descriptor,
                fixed,
                descriptor.args.len()
            )));
        }
    }

    Ok(())
}

/// Compile a descriptor without consulting the cache
///
/// Nested closure types resolve through `ctx`, which interns them.
pub(crate) fn compile(ctx: &NativeContext, descriptor: &SignatureDescriptor) -> Result<Signature> {
    validate_positions(descriptor)?;

    let ret_type = ctx.resolve_type(&descriptor.ret)?;
    let arg_types = descriptor
        .args
        .iter()
        .map(|arg| ctx.resolve_type(arg))
        .collect::<Result<Vec<_>>>()?;

    // trampolines have no variadic form
    let base = if descriptor.is_variadic() {
        CallDirection::MANAGED_TO_NATIVE_ONLY
    } else {
        CallDirection::BOTH
    };
    let direction = arg_types
        .iter()
        .chain(std::iter::once(&ret_type))
        .fold(base, |acc, ty| acc.intersect(ty.direction()));
    if direction.is_empty() {
        return Err(NfiError::invalid_signature(format!(
            "{}: conflicting call directions",
            descriptor
        )));
    }

    let layout = Layout::of(&arg_types);

    let cif = ctx
        .backend()
        .prepare_cif(&ret_type, &arg_types, descriptor.fixed_arg_count)?;
    let cif = NativeResource::new(cif);
    let allocation = {
        let cif = cif.clone();
        ctx.queue().register_native_allocation(ctx.id(), move || drop(cif.take()))
    };

    log_signature_compiled(
        &descriptor.to_string(),
        layout.primitive_size,
        layout.object_slot_count,
    );

    Ok(Signature {
        descriptor: descriptor.clone(),
        arg_types,
        ret_type,
        direction,
        layout,
        fixed_arg_count: descriptor.fixed_arg_count,
        cif,
        _allocation: allocation,
    })
}
