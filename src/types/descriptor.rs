//! Structural type descriptions, used as interning keys

use super::simple::SimpleKind;
use crate::signature::SignatureDescriptor;
use std::fmt;

/// Context-independent description of a native type
///
/// Two equal descriptors always resolve to equivalent `NativeType`s; closure
/// descriptors resolve to the same interned `Signature` within a context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Void,
    Simple(SimpleKind),
    String,
    Object,
    Nullable,
    Env,
    Array(SimpleKind),
    Closure(Box<SignatureDescriptor>),
}

impl TypeDescriptor {
    pub fn closure(signature: SignatureDescriptor) -> Self {
        Self::Closure(Box::new(signature))
    }

    /// Parse a single type name such as `sint32`, `string` or `[double]`
    ///
    /// Closure types have no name form; build them with `closure`.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        if let Some(inner) = name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
            return SimpleKind::from_name(inner.trim()).map(Self::Array);
        }
        match name {
            "void" => Some(Self::Void),
            "string" => Some(Self::String),
            "object" => Some(Self::Object),
            "nullable" => Some(Self::Nullable),
            "env" => Some(Self::Env),
            other => SimpleKind::from_name(other).map(Self::Simple),
        }
    }
}

impl From<SimpleKind> for TypeDescriptor {
    fn from(kind: SimpleKind) -> Self {
        Self::Simple(kind)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Simple(kind) => f.write_str(kind.name()),
            Self::String => f.write_str("string"),
            Self::Object => f.write_str("object"),
            Self::Nullable => f.write_str("nullable"),
            Self::Env => f.write_str("env"),
            Self::Array(kind) => write!(f, "[{}]", kind),
            Self::Closure(signature) => write!(f, "{}", signature),
        }
    }
}
