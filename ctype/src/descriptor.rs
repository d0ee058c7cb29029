use std::{
    collections::HashSet,
    fmt,
    ops::ControlFlow,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;

use crate::{DataModel, FunctionSignature, PrimitiveKind};

static NEXT_TYPE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a descriptor. Handles carry it so a pointer
/// can only be reinterpreted through an explicit cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u64);

impl TypeId {
    fn next() -> TypeId {
        TypeId(NEXT_TYPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

pub type TypeRef = Arc<TypeDescriptor>;

/// Called with the address of a returned value once it has been decoded.
pub type Disposer = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{kind:?} is not a scalar kind")]
    NotScalar { kind: PrimitiveKind },
    #[error("member `{name}` is declared twice in `{owner}`")]
    DuplicateMember { owner: String, name: String },
    #[error("member `{name}` of `{owner}` has type void")]
    VoidMember { owner: String, name: String },
    #[error("`{owner}` has no members")]
    Empty { owner: String },
    #[error("pack value {pack} is not a power of two")]
    BadPack { pack: usize },
    #[error("array of {element} cannot be decoded as a string")]
    StringHint { element: String },
    #[error("array of {len} x {element} overflows")]
    ArrayOverflow { element: String, len: usize },
    #[error("`{name}` is not a function prototype")]
    NotPrototype { name: String },
    #[error("disposers only apply to pointers and strings, not `{name}`")]
    NotDisposable { name: String },
}

/// How an array member decodes back into a runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArrayHint {
    /// A value array, element by element.
    #[default]
    Array,
    /// A byte buffer holding the raw elements.
    Typed,
    /// A string up to the first NUL (char arrays only).
    String,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub ty: TypeRef,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub enum Shape {
    Scalar,
    /// `None` is an untyped (`void *`) pointer.
    Pointer { pointee: Option<TypeRef> },
    Array {
        element: TypeRef,
        len: usize,
        hint: ArrayHint,
    },
    Record { members: Vec<Member> },
    Union { members: Vec<Member> },
    /// Function pointer; `proto` is a prototype descriptor.
    Callback { proto: TypeRef },
    Prototype(Box<FunctionSignature>),
}

#[derive(Clone)]
pub struct TypeDescriptor {
    id: TypeId,
    name: String,
    kind: PrimitiveKind,
    size: usize,
    align: usize,
    shape: Shape,
    disposer: Option<Disposer>,
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("disposer", &self.disposer.is_some())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

impl TypeDescriptor {
    fn build(
        name: impl Into<String>,
        kind: PrimitiveKind,
        size: usize,
        align: usize,
        shape: Shape,
    ) -> TypeRef {
        Arc::new(TypeDescriptor {
            id: TypeId::next(),
            name: name.into(),
            kind,
            size,
            align,
            shape,
            disposer: None,
        })
    }

    /// Plain scalar: void, bool, integers, floats and untyped pointers.
    pub fn scalar(
        kind: PrimitiveKind,
        model: DataModel,
    ) -> Result<TypeRef, LayoutError> {
        if kind.is_string() || kind == PrimitiveKind::Callback {
            return Err(LayoutError::NotScalar { kind });
        }
        let (size, align) = kind
            .scalar_layout(model)
            .ok_or(LayoutError::NotScalar { kind })?;
        let shape = if kind == PrimitiveKind::Pointer {
            Shape::Pointer { pointee: None }
        } else {
            Shape::Scalar
        };
        Ok(Self::build(kind.keyword(), kind, size, align, shape))
    }

    #[must_use]
    pub fn pointer(pointee: TypeRef, model: DataModel) -> TypeRef {
        let size = model.pointer_size;
        Self::build(
            format!("{}*", pointee.name),
            PrimitiveKind::Pointer,
            size,
            size,
            Shape::Pointer {
                pointee: Some(pointee),
            },
        )
    }

    /// NUL-terminated string of 1, 2 or 4 byte code units.
    pub fn string(
        kind: PrimitiveKind,
        model: DataModel,
    ) -> Result<TypeRef, LayoutError> {
        if !kind.is_string() {
            return Err(LayoutError::NotScalar { kind });
        }
        let size = model.pointer_size;
        Ok(Self::build(kind.keyword(), kind, size, size, Shape::Scalar))
    }

    pub fn array(
        element: TypeRef,
        len: usize,
        hint: ArrayHint,
    ) -> Result<TypeRef, LayoutError> {
        if hint == ArrayHint::String
            && !(element.kind.is_integer() && matches!(element.size, 1 | 2 | 4))
        {
            return Err(LayoutError::StringHint {
                element: element.name.clone(),
            });
        }
        let size = element.size.checked_mul(len).ok_or_else(|| {
            LayoutError::ArrayOverflow {
                element: element.name.clone(),
                len,
            }
        })?;
        let align = element.align;
        Ok(Self::build(
            format!("{}[{len}]", element.name),
            PrimitiveKind::Array,
            size,
            align,
            Shape::Array { element, len, hint },
        ))
    }

    #[must_use]
    pub fn prototype(signature: FunctionSignature) -> TypeRef {
        let name = signature.name.clone();
        Self::build(
            name,
            PrimitiveKind::Prototype,
            0,
            1,
            Shape::Prototype(Box::new(signature)),
        )
    }

    pub fn callback(
        proto: TypeRef,
        model: DataModel,
    ) -> Result<TypeRef, LayoutError> {
        if proto.kind != PrimitiveKind::Prototype {
            return Err(LayoutError::NotPrototype {
                name: proto.name.clone(),
            });
        }
        let size = model.pointer_size;
        Ok(Self::build(
            format!("{}*", proto.name),
            PrimitiveKind::Callback,
            size,
            size,
            Shape::Callback { proto },
        ))
    }

    /// Derives a distinct pointer or string type whose returned values are
    /// handed to `disposer` after decoding.
    pub fn with_disposer(
        base: &TypeRef,
        disposer: Disposer,
    ) -> Result<TypeRef, LayoutError> {
        if !(base.kind == PrimitiveKind::Pointer || base.kind.is_string()) {
            return Err(LayoutError::NotDisposable {
                name: base.name.clone(),
            });
        }
        let mut derived = TypeDescriptor::clone(base);
        derived.id = TypeId::next();
        derived.name = format!("{}!", base.name);
        derived.disposer = Some(disposer);
        Ok(Arc::new(derived))
    }

    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> PrimitiveKind {
        self.kind
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn align(&self) -> usize {
        self.align
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn disposer(&self) -> Option<&Disposer> {
        self.disposer.as_ref()
    }

    /// Members of a record or union, empty for everything else.
    #[must_use]
    pub fn members(&self) -> &[Member] {
        match &self.shape {
            Shape::Record { members } | Shape::Union { members } => members,
            _ => &[],
        }
    }

    #[must_use]
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members().iter().find(|m| m.name == name)
    }

    #[must_use]
    pub fn pointee(&self) -> Option<&TypeRef> {
        match &self.shape {
            Shape::Pointer { pointee } => pointee.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn element(&self) -> Option<(&TypeRef, usize, ArrayHint)> {
        match &self.shape {
            Shape::Array { element, len, hint } => Some((element, *len, *hint)),
            _ => None,
        }
    }

    /// The prototype signature of a callback or prototype descriptor.
    #[must_use]
    pub fn signature(&self) -> Option<&FunctionSignature> {
        match &self.shape {
            Shape::Prototype(sig) => Some(sig),
            Shape::Callback { proto } => proto.signature(),
            _ => None,
        }
    }

    #[must_use]
    pub fn proto(&self) -> Option<&TypeRef> {
        match &self.shape {
            Shape::Callback { proto } => Some(proto),
            _ => None,
        }
    }

    /// Visits every scalar leaf with its absolute offset. Arrays expand to
    /// their elements; unions report themselves as a single opaque leaf.
    pub fn for_each_leaf(&self, base: usize, f: &mut dyn FnMut(usize, &TypeDescriptor)) {
        let _ = self.try_for_each_leaf(base, &mut |offset, leaf| {
            f(offset, leaf);
            ControlFlow::Continue(())
        });
    }

    /// Like [`TypeDescriptor::for_each_leaf`], stopping at the first
    /// `Break`.
    pub fn try_for_each_leaf(
        &self,
        base: usize,
        f: &mut dyn FnMut(usize, &TypeDescriptor) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        match &self.shape {
            Shape::Record { members } => {
                for member in members {
                    member.ty.try_for_each_leaf(base + member.offset, f)?;
                }
                ControlFlow::Continue(())
            }
            Shape::Array { element, len, .. } => {
                for i in 0..*len {
                    element.try_for_each_leaf(base + i * element.size, f)?;
                }
                ControlFlow::Continue(())
            }
            _ => f(base, self),
        }
    }
}

fn check_members(
    owner: &str,
    members: &[(String, TypeRef)],
) -> Result<(), LayoutError> {
    if members.is_empty() {
        return Err(LayoutError::Empty {
            owner: owner.to_string(),
        });
    }
    let mut seen = HashSet::new();
    for (name, ty) in members {
        if ty.kind == PrimitiveKind::Void || ty.kind == PrimitiveKind::Prototype {
            return Err(LayoutError::VoidMember {
                owner: owner.to_string(),
                name: name.clone(),
            });
        }
        if !seen.insert(name.as_str()) {
            return Err(LayoutError::DuplicateMember {
                owner: owner.to_string(),
                name: name.clone(),
            });
        }
    }
    Ok(())
}

/// Lays out a C struct: members in declaration order, each at its natural
/// alignment (capped by `pack`), total size rounded to the record alignment.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    name: String,
    pack: Option<usize>,
    members: Vec<(String, TypeRef)>,
}

impl RecordBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn pack(mut self, pack: usize) -> Self {
        self.pack = Some(pack);
        self
    }

    #[must_use]
    pub fn member(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.members.push((name.into(), ty));
        self
    }

    pub fn build(self) -> Result<TypeRef, LayoutError> {
        check_members(&self.name, &self.members)?;
        if let Some(pack) = self.pack
            && !pack.is_power_of_two()
        {
            return Err(LayoutError::BadPack { pack });
        }
        let cap = self.pack.unwrap_or(usize::MAX);

        let mut offset = 0;
        let mut align = 1;
        let mut members = Vec::with_capacity(self.members.len());
        for (name, ty) in self.members {
            let member_align = ty.align.min(cap);
            offset = align_up(offset, member_align);
            align = align.max(member_align);
            let size = ty.size;
            members.push(Member { name, ty, offset });
            offset += size;
        }
        let size = align_up(offset, align);
        Ok(TypeDescriptor::build(
            self.name,
            PrimitiveKind::Record,
            size,
            align,
            Shape::Record { members },
        ))
    }
}

/// All members at offset zero; size is the largest member rounded to the
/// largest alignment.
#[derive(Debug, Default)]
pub struct UnionBuilder {
    name: String,
    members: Vec<(String, TypeRef)>,
}

impl UnionBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    #[must_use]
    pub fn member(mut self, name: impl Into<String>, ty: TypeRef) -> Self {
        self.members.push((name.into(), ty));
        self
    }

    pub fn build(self) -> Result<TypeRef, LayoutError> {
        check_members(&self.name, &self.members)?;
        let align = self.members.iter().map(|(_, t)| t.align).max().unwrap_or(1);
        let largest = self.members.iter().map(|(_, t)| t.size).max().unwrap_or(0);
        let members = self
            .members
            .into_iter()
            .map(|(name, ty)| Member { name, ty, offset: 0 })
            .collect();
        Ok(TypeDescriptor::build(
            self.name,
            PrimitiveKind::Union,
            align_up(largest, align),
            align,
            Shape::Union { members },
        ))
    }
}
