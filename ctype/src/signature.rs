use std::fmt;

use crate::{TypeId, TypeRef};

/// Calling conventions. Only x86 distinguishes them; other ABIs accept and
/// ignore everything but `Cdecl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallConv {
    #[default]
    Cdecl,
    Stdcall,
    Fastcall,
    Thiscall,
}

impl CallConv {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CallConv::Cdecl => "cdecl",
            CallConv::Stdcall => "stdcall",
            CallConv::Fastcall => "fastcall",
            CallConv::Thiscall => "thiscall",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<CallConv> {
        [
            CallConv::Cdecl,
            CallConv::Stdcall,
            CallConv::Fastcall,
            CallConv::Thiscall,
        ]
        .into_iter()
        .find(|conv| conv.name() == name)
    }
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    In,
    Out,
    InOut,
}

impl Direction {
    /// Whether the pointee is written back after the call.
    #[must_use]
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

#[derive(Debug, Clone)]
pub struct ParameterDescriptor {
    pub ty: TypeRef,
    pub direction: Direction,
    pub variadic: bool,
    /// Position in the caller's argument list.
    pub offset: usize,
}

/// Declared signature of a native function. For variadic functions this
/// holds the fixed part; [`FunctionSignature::with_variadic`] produces the
/// concrete signature of one call.
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub name: String,
    pub conv: CallConv,
    pub params: Vec<ParameterDescriptor>,
    pub ret: TypeRef,
    pub variadic: bool,
    /// Number of fixed parameters.
    pub required: usize,
}

impl FunctionSignature {
    #[must_use]
    pub fn new(name: impl Into<String>, ret: TypeRef) -> Self {
        Self {
            name: name.into(),
            conv: CallConv::Cdecl,
            params: Vec::new(),
            ret,
            variadic: false,
            required: 0,
        }
    }

    #[must_use]
    pub fn conv(mut self, conv: CallConv) -> Self {
        self.conv = conv;
        self
    }

    #[must_use]
    pub fn param(self, ty: TypeRef) -> Self {
        self.param_with(ty, Direction::In)
    }

    #[must_use]
    pub fn out_param(self, ty: TypeRef) -> Self {
        self.param_with(ty, Direction::Out)
    }

    #[must_use]
    pub fn inout_param(self, ty: TypeRef) -> Self {
        self.param_with(ty, Direction::InOut)
    }

    #[must_use]
    pub fn param_with(mut self, ty: TypeRef, direction: Direction) -> Self {
        let offset = self.params.len();
        self.params.push(ParameterDescriptor {
            ty,
            direction,
            variadic: false,
            offset,
        });
        self.required = self.params.len();
        self
    }

    /// Marks the declaration as ending in `...`.
    #[must_use]
    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    /// Concrete signature for one variadic call with the given extra
    /// argument types appended.
    #[must_use]
    pub fn with_variadic(&self, extra: &[TypeRef]) -> FunctionSignature {
        let mut sig = self.clone();
        sig.params.truncate(self.required);
        for ty in extra {
            let offset = sig.params.len();
            sig.params.push(ParameterDescriptor {
                ty: ty.clone(),
                direction: Direction::In,
                variadic: true,
                offset,
            });
        }
        sig
    }

    #[must_use]
    pub fn key(&self) -> SignatureKey {
        SignatureKey {
            conv: self.conv,
            ret: self.ret.id(),
            variadic: self.variadic,
            params: self
                .params
                .iter()
                .map(|p| (p.ty.id(), p.direction, p.variadic))
                .collect(),
        }
    }
}

/// Identity of a signature for analysis caching. Two signatures with the
/// same key classify identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureKey {
    conv: CallConv,
    ret: TypeId,
    variadic: bool,
    params: Vec<(TypeId, Direction, bool)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataModel, PrimitiveKind, TypeDescriptor};

    fn prim(kind: PrimitiveKind) -> TypeRef {
        TypeDescriptor::scalar(kind, DataModel::LP64).expect("scalar")
    }

    #[test]
    fn variadic_calls_extend_the_fixed_part() {
        let int = prim(PrimitiveKind::Int32);
        let base = FunctionSignature::new("printf", int.clone())
            .param(TypeDescriptor::string(PrimitiveKind::String, DataModel::LP64).expect("str"))
            .variadic();
        let call = base.with_variadic(&[prim(PrimitiveKind::Float64), int]);
        assert_eq!(call.required, 1);
        assert_eq!(call.params.len(), 3);
        assert!(!call.params[0].variadic);
        assert!(call.params[1].variadic && call.params[2].variadic);
        assert_eq!(call.params[2].offset, 2);
        assert_ne!(base.key(), call.key());
    }

    #[test]
    fn keys_depend_on_type_identity() {
        let a = prim(PrimitiveKind::Int32);
        let b = prim(PrimitiveKind::Int32);
        let void = prim(PrimitiveKind::Void);
        let f1 = FunctionSignature::new("f", void.clone()).param(a.clone());
        let f2 = FunctionSignature::new("g", void.clone()).param(a);
        let f3 = FunctionSignature::new("f", void).param(b);
        assert_eq!(f1.key(), f2.key());
        assert_ne!(f1.key(), f3.key());
    }

    #[test]
    fn conventions_parse_by_name() {
        assert_eq!(CallConv::from_name("fastcall"), Some(CallConv::Fastcall));
        assert_eq!(CallConv::from_name("pascal"), None);
    }
}
