use std::collections::HashMap;

use crate::{DataModel, LayoutError, PrimitiveKind, TypeDescriptor, TypeRef};

/// Interns scalar descriptors for one data model and keeps user types by
/// name, so equal keywords always resolve to the same `TypeId`.
#[derive(Debug)]
pub struct TypeRegistry {
    model: DataModel,
    primitives: HashMap<PrimitiveKind, TypeRef>,
    named: HashMap<String, TypeRef>,
}

impl TypeRegistry {
    #[must_use]
    pub fn new(model: DataModel) -> Self {
        Self {
            model,
            primitives: HashMap::new(),
            named: HashMap::new(),
        }
    }

    #[must_use]
    pub fn host() -> Self {
        Self::new(DataModel::host())
    }

    #[must_use]
    pub fn model(&self) -> DataModel {
        self.model
    }

    /// Shared descriptor of a scalar or string kind.
    pub fn primitive(&mut self, kind: PrimitiveKind) -> Result<TypeRef, LayoutError> {
        if let Some(ty) = self.primitives.get(&kind) {
            return Ok(ty.clone());
        }
        let ty = if kind.is_string() {
            TypeDescriptor::string(kind, self.model)?
        } else {
            TypeDescriptor::scalar(kind, self.model)?
        };
        self.primitives.insert(kind, ty.clone());
        Ok(ty)
    }

    /// Resolves a scalar keyword or a registered type name.
    pub fn lookup(&mut self, name: &str) -> Option<TypeRef> {
        if let Some(kind) = PrimitiveKind::from_keyword(name) {
            return self.primitive(kind).ok();
        }
        self.named.get(name).cloned()
    }

    /// Registers `ty` under its own name, replacing any earlier entry.
    pub fn register(&mut self, ty: TypeRef) -> Option<TypeRef> {
        self.named.insert(ty.name().to_string(), ty)
    }

    #[must_use]
    pub fn pointer_to(&self, ty: TypeRef) -> TypeRef {
        TypeDescriptor::pointer(ty, self.model)
    }
}
