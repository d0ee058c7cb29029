//! Dynamic values exchanged with native code.
//!
//! Arrays, objects and buffers are shared and interior-mutable so output
//! parameters can be written back into the caller's value after a call.

use std::{collections::BTreeMap, fmt, sync::Arc};

use ctype::{PrimitiveKind, TypeId, TypeRef};
use parking_lot::RwLock;

use crate::{AlienError, AlienResult, ArgPosition, codec};

/// Largest integer a `Number` represents exactly.
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

pub type ArrayRef = Arc<RwLock<Vec<Value>>>;
pub type ObjectRef = Arc<RwLock<BTreeMap<String, Value>>>;
pub type BufferRef = Arc<RwLock<Vec<u8>>>;
pub type TextRef = Arc<TextBuffer>;

type CallFn = dyn Fn(Option<&Value>, &[Value]) -> AlienResult<Value> + Send + Sync;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(Arc<str>),
    /// A string native code may overwrite.
    Text(TextRef),
    Array(ArrayRef),
    Object(ObjectRef),
    Buffer(BufferRef),
    External(Handle),
    Function(Function),
    Union(UnionValue),
}

impl Value {
    #[must_use]
    pub fn string(s: impl Into<Arc<str>>) -> Value {
        Value::String(s.into())
    }

    /// A string with room for `capacity` code units besides the
    /// terminator, for output parameters.
    #[must_use]
    pub fn text(initial: &str, capacity: usize) -> Value {
        Value::Text(Arc::new(TextBuffer {
            text: RwLock::new(initial.to_string()),
            capacity,
        }))
    }

    #[must_use]
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    #[must_use]
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Value {
        let map = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Value::Object(Arc::new(RwLock::new(map)))
    }

    #[must_use]
    pub fn buffer(bytes: Vec<u8>) -> Value {
        Value::Buffer(Arc::new(RwLock::new(bytes)))
    }

    pub fn function<F>(f: F) -> Value
    where
        F: Fn(&[Value]) -> AlienResult<Value> + Send + Sync + 'static,
    {
        Value::Function(Function::new(move |_, args| f(args)))
    }

    /// Integers in the safe range become numbers, the rest big integers.
    #[must_use]
    pub fn from_i64(v: i64) -> Value {
        if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&v) {
            Value::Number(v as f64)
        } else {
            Value::BigInt(i128::from(v))
        }
    }

    #[must_use]
    pub fn from_u64(v: u64) -> Value {
        if v <= MAX_SAFE_INTEGER as u64 {
            Value::Number(v as f64)
        } else {
            Value::BigInt(i128::from(v))
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Text(_) => "text",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Buffer(_) => "buffer",
            Value::External(_) => "external",
            Value::Function(_) => "function",
            Value::Union(_) => "union",
        }
    }

    #[must_use]
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::BigInt(b) => Some(*b as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Value::External(h) => Some(h),
            _ => None,
        }
    }

    /// Shallow field read on objects.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(obj) => obj.read().get(key).cloned(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

impl PartialEq for Value {
    /// Structural for scalars and strings, identity for shared containers.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Buffer(a), Value::Buffer(b)) => Arc::ptr_eq(a, b),
            (Value::External(a), Value::External(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(&a.call, &b.call),
            (Value::Union(a), Value::Union(b)) => {
                Arc::ptr_eq(&a.bytes, &b.bytes) || *a.bytes.read() == *b.bytes.read()
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::BigInt(b) => write!(f, "{b}n"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Text(t) => write!(f, "<text {:?}>", t.get()),
            Value::Array(a) => f.debug_list().entries(a.read().iter()).finish(),
            Value::Object(o) => f.debug_map().entries(o.read().iter()).finish(),
            Value::Buffer(b) => write!(f, "<buffer {} bytes>", b.read().len()),
            Value::External(h) => write!(f, "{h:?}"),
            Value::Function(_) => f.write_str("<function>"),
            Value::Union(u) => write!(f, "<union {}>", u.ty.name()),
        }
    }
}

/// Mutable string storage behind [`Value::Text`].
#[derive(Debug)]
pub struct TextBuffer {
    text: RwLock<String>,
    capacity: usize,
}

impl TextBuffer {
    #[must_use]
    pub fn get(&self) -> String {
        self.text.read().clone()
    }

    /// Code units native code may write, terminator excluded.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn set(&self, text: String) {
        *self.text.write() = text;
    }
}

/// An opaque native address tagged with the type it points to.
#[derive(Clone)]
pub struct Handle {
    addr: usize,
    ty: Option<TypeRef>,
}

impl Handle {
    #[must_use]
    pub fn new(addr: usize, ty: Option<TypeRef>) -> Handle {
        Handle { addr, ty }
    }

    #[must_use]
    pub fn addr(&self) -> usize {
        self.addr
    }

    #[must_use]
    pub fn ty(&self) -> Option<&TypeRef> {
        self.ty.as_ref()
    }

    #[must_use]
    pub fn type_id(&self) -> Option<TypeId> {
        self.ty.as_ref().map(|t| t.id())
    }

    /// Re-tags the address. This is the only way to change a handle's type.
    #[must_use]
    pub fn cast(&self, ty: Option<TypeRef>) -> Handle {
        Handle {
            addr: self.addr,
            ty,
        }
    }

    /// Untyped handles and `void *` targets accept anything; otherwise the
    /// type ids must match.
    #[must_use]
    pub fn fits(&self, expected: Option<&TypeRef>) -> bool {
        match (expected, &self.ty) {
            (None, _) | (_, None) => true,
            (Some(want), Some(have)) => {
                want.id() == have.id() || want.kind() == PrimitiveKind::Void
            }
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.type_id() == other.type_id()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.ty.as_ref().map_or("void", |t| t.name());
        write!(f, "<{name} @ {:#x}>", self.addr)
    }
}

/// A runtime function, optionally bound to a receiver.
#[derive(Clone)]
pub struct Function {
    call: Arc<CallFn>,
    this: Option<Arc<Value>>,
}

impl Function {
    pub fn new<F>(f: F) -> Function
    where
        F: Fn(Option<&Value>, &[Value]) -> AlienResult<Value> + Send + Sync + 'static,
    {
        Function {
            call: Arc::new(f),
            this: None,
        }
    }

    #[must_use]
    pub fn bind(&self, this: Value) -> Function {
        Function {
            call: self.call.clone(),
            this: Some(Arc::new(this)),
        }
    }

    pub fn call(&self, args: &[Value]) -> AlienResult<Value> {
        (self.call)(self.this.as_deref(), args)
    }
}

/// A union returned or read back from native memory. Members decode on
/// demand from the raw bytes.
#[derive(Clone)]
pub struct UnionValue {
    ty: TypeRef,
    bytes: BufferRef,
}

impl UnionValue {
    #[must_use]
    pub fn new(ty: TypeRef, bytes: &[u8]) -> UnionValue {
        UnionValue {
            ty,
            bytes: Arc::new(RwLock::new(bytes.to_vec())),
        }
    }

    #[must_use]
    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Replaces the raw bytes; every clone of this value sees them.
    pub(crate) fn store(&self, bytes: &[u8]) {
        let mut own = self.bytes.write();
        let n = own.len().min(bytes.len());
        own[..n].copy_from_slice(&bytes[..n]);
    }

    /// Interprets the bytes as the named member.
    ///
    /// # Safety
    /// Pointer members are followed when the member is a string, so any
    /// such address in the bytes must be valid or null.
    pub unsafe fn member(&self, name: &str) -> AlienResult<Value> {
        let member = self.ty.member(name).ok_or_else(|| {
            AlienError::conversion(
                ArgPosition::Return,
                format!("member of {}", self.ty.name()),
                name,
            )
        })?;
        let end = member.offset + member.ty.size();
        let bytes = self.bytes.read();
        // SAFETY: forwarded from the caller
        unsafe { codec::encode_value(&bytes[member.offset..end], &member.ty) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_switch_to_bigint_past_safe_range() {
        assert_eq!(Value::from_i64(MAX_SAFE_INTEGER), Value::Number(MAX_SAFE_INTEGER as f64));
        assert_eq!(
            Value::from_i64(MAX_SAFE_INTEGER + 1),
            Value::BigInt(i128::from(MAX_SAFE_INTEGER + 1))
        );
        assert_eq!(Value::from_i64(-MAX_SAFE_INTEGER - 1), Value::BigInt(-(1 << 53)));
        assert_eq!(Value::from_u64(u64::MAX), Value::BigInt(i128::from(u64::MAX)));
    }

    #[test]
    fn shared_containers_compare_by_identity() {
        let a = Value::array(vec![Value::Null]);
        let b = a.clone();
        assert_eq!(a, b);
        assert_ne!(a, Value::array(vec![Value::Null]));
    }

    #[test]
    fn bound_functions_see_their_receiver() {
        let f = Function::new(|this, args| {
            let base = this.and_then(Value::as_f64).unwrap_or(0.0);
            Ok(Value::Number(base + args.len() as f64))
        });
        assert_eq!(f.call(&[Value::Null]).expect("call"), Value::Number(1.0));
        let bound = f.bind(Value::Number(10.0));
        assert_eq!(bound.call(&[]).expect("call"), Value::Number(10.0));
    }
}
