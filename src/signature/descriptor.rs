//! Signature descriptions and the fluent builder

use crate::context::NativeContext;
use crate::error::Result;
use crate::signature::Signature;
use crate::types::TypeDescriptor;
use std::fmt;
use std::sync::Arc;

/// Structural description of a function type; the per-context cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureDescriptor {
    pub args: Vec<TypeDescriptor>,
    pub ret: TypeDescriptor,
    /// Number of fixed arguments when the function is variadic
    pub fixed_arg_count: Option<usize>,
}

impl SignatureDescriptor {
    pub fn new(args: Vec<TypeDescriptor>, ret: TypeDescriptor) -> Self {
        Self {
            args,
            ret,
            fixed_arg_count: None,
        }
    }

    pub fn variadic(args: Vec<TypeDescriptor>, fixed_arg_count: usize, ret: TypeDescriptor) -> Self {
        Self {
            args,
            ret,
            fixed_arg_count: Some(fixed_arg_count),
        }
    }

    #[inline]
    pub fn is_variadic(&self) -> bool {
        self.fixed_arg_count.is_some()
    }
}

impl fmt::Display for SignatureDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if self.fixed_arg_count == Some(i) {
                f.write_str("...")?;
            }
            write!(f, "{}", arg)?;
        }
        if self.fixed_arg_count == Some(self.args.len()) {
            f.write_str(if self.args.is_empty() { "..." } else { ", ..." })?;
        }
        write!(f, "):{}", self.ret)
    }
}

/// Fluent construction of signature descriptors
///
/// ```ignore
/// let printf = SignatureBuilder::new()
///     .arg(TypeDescriptor::String)
///     .varargs()
///     .arg(SimpleKind::SInt32)
///     .returns(SimpleKind::SInt32)
///     .build(&ctx)?;
/// ```
#[derive(Debug, Clone)]
pub struct SignatureBuilder {
    args: Vec<TypeDescriptor>,
    ret: TypeDescriptor,
    fixed_arg_count: Option<usize>,
}

impl Default for SignatureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureBuilder {
    pub fn new() -> Self {
        Self {
            args: Vec::new(),
            ret: TypeDescriptor::Void,
            fixed_arg_count: None,
        }
    }

    pub fn arg(mut self, ty: impl Into<TypeDescriptor>) -> Self {
        self.args.push(ty.into());
        self
    }

    pub fn args<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TypeDescriptor>,
    {
        self.args.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn returns(mut self, ty: impl Into<TypeDescriptor>) -> Self {
        self.ret = ty.into();
        self
    }

    /// Arguments added after this point form the variadic tail
    pub fn varargs(mut self) -> Self {
        self.fixed_arg_count = Some(self.args.len());
        self
    }

    pub fn descriptor(self) -> SignatureDescriptor {
        SignatureDescriptor {
            args: self.args,
            ret: self.ret,
            fixed_arg_count: self.fixed_arg_count,
        }
    }

    /// Compile (or fetch the interned) signature in `ctx`
    pub fn build(self, ctx: &NativeContext) -> Result<Arc<Signature>> {
        ctx.compile_signature(&self.descriptor())
    }
}
