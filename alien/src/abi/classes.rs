//! Aggregate analyses shared by several backends.

use std::ops::ControlFlow;

use ctype::{PrimitiveKind, TypeDescriptor};

/// Homogeneous floating-point aggregate: 1 to 4 members of one float kind
/// and nothing else. Unions are opaque and never qualify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hfa {
    pub kind: PrimitiveKind,
    pub count: u32,
}

impl Hfa {
    #[must_use]
    pub fn element_size(&self) -> u32 {
        if self.kind == PrimitiveKind::Float32 { 4 } else { 8 }
    }
}

#[must_use]
pub fn hfa(ty: &TypeDescriptor) -> Option<Hfa> {
    if !matches!(ty.kind(), PrimitiveKind::Record | PrimitiveKind::Array) {
        return None;
    }
    let mut kind = None;
    let mut count = 0u32;
    let mut uniform = true;
    let walk = ty.try_for_each_leaf(0, &mut |_, leaf| {
        count += 1;
        let k = leaf.kind();
        if !k.is_float() || kind.is_some_and(|seen| seen != k) {
            uniform = false;
        }
        kind = Some(k);
        if uniform && count <= 4 {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    });
    if walk.is_break() {
        return None;
    }
    let kind = kind?;
    let hfa = Hfa { kind, count };
    let exact = ty.size() as u32 == count * hfa.element_size();
    (uniform && exact && (1..=4).contains(&count)).then_some(hfa)
}

/// x86-64 System V eightbyte classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    None,
    Integer,
    Sse,
    Memory,
}

impl ArgClass {
    #[must_use]
    pub fn merge(self, other: ArgClass) -> ArgClass {
        use ArgClass::*;
        match (self, other) {
            (a, b) if a == b => a,
            (None, x) | (x, None) => x,
            (Memory, _) | (_, Memory) => Memory,
            (Integer, _) | (_, Integer) => Integer,
            _ => Sse,
        }
    }
}

/// Classes of each eightbyte of `ty`, or `[Memory]`.
#[must_use]
pub fn eightbytes(ty: &TypeDescriptor) -> Vec<ArgClass> {
    let size = ty.size();
    if size == 0 {
        return Vec::new();
    }
    if size > 16 {
        return vec![ArgClass::Memory];
    }
    let mut classes = vec![ArgClass::None; size.div_ceil(8)];
    let mut mark = |offset: usize, leaf: &TypeDescriptor| {
        let class = if leaf.kind().is_float() {
            ArgClass::Sse
        } else {
            ArgClass::Integer
        };
        let misaligned = offset % leaf.align() != 0;
        let end = (offset + leaf.size()).max(offset + 1);
        for slot in offset / 8..end.div_ceil(8).min(classes.len()) {
            let merged = if misaligned { ArgClass::Memory } else { class };
            classes[slot] = classes[slot].merge(merged);
        }
    };
    if ty.kind() == PrimitiveKind::Union {
        mark(0, ty);
    } else {
        ty.for_each_leaf(0, &mut mark);
    }
    if classes.contains(&ArgClass::Memory) {
        return vec![ArgClass::Memory];
    }
    classes
        .into_iter()
        .map(|c| if c == ArgClass::None { ArgClass::Integer } else { c })
        .collect()
}

/// One scalar field of a flattened aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: u32,
    pub size: u32,
    pub float: bool,
    pub signed: bool,
}

/// RISC-V hardware floating-point calling convention flattening: the
/// aggregate is at most two scalars and at least one is a float. Returns
/// `None` when the integer convention applies.
#[must_use]
pub fn flatten(ty: &TypeDescriptor) -> Option<Vec<Field>> {
    if !matches!(ty.kind(), PrimitiveKind::Record | PrimitiveKind::Array) {
        return None;
    }
    let mut fields = Vec::new();
    let mut opaque = false;
    ty.for_each_leaf(0, &mut |offset, leaf| {
        let kind = leaf.kind();
        if kind == PrimitiveKind::Union || leaf.size() > 8 {
            opaque = true;
        }
        fields.push(Field {
            offset: offset as u32,
            size: leaf.size() as u32,
            float: kind.is_float(),
            signed: kind.is_signed(),
        });
    });
    let floats = fields.iter().filter(|f| f.float).count();
    let ok = !opaque && (1..=2).contains(&fields.len()) && floats >= 1;
    ok.then_some(fields)
}
