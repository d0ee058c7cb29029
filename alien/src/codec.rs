//! Conversion between runtime values and native memory images.
//!
//! `decode_value` turns a value into the bytes of a C object of a given
//! type, allocating any indirect storage through a [`CallContext`].
//! `encode_value` reads such bytes back into a value.

use std::{collections::BTreeMap, ptr, sync::Arc};

use ctype::{ArrayHint, Direction, PrimitiveKind, Shape, TypeDescriptor, TypeRef};
use parking_lot::RwLock;

use crate::{
    AlienError, AlienResult, ArgPosition,
    value::{Function, Handle, TextBuffer, UnionValue, Value},
};

/// What conversion needs from the call in progress.
pub trait CallContext {
    /// Memory that stays valid until the call session ends.
    fn alloc_scratch(&mut self, size: usize, align: usize) -> AlienResult<*mut u8>;

    /// Publishes `func` as a native function pointer of callback type `ty`.
    fn reserve_trampoline(&mut self, ty: &TypeRef, func: &Function) -> AlienResult<usize>;

    /// Registers memory to be read back into `value` after the call.
    fn push_out(&mut self, out: OutArg);
}

/// An output argument waiting to be copied back.
#[derive(Debug, Clone)]
pub struct OutArg {
    pub value: Value,
    pub ptr: usize,
    /// Type of one element at `ptr`.
    pub ty: TypeRef,
    pub count: usize,
}

fn mismatch(position: ArgPosition, ty: &TypeDescriptor, value: &Value) -> AlienError {
    AlienError::conversion(position, ty.name(), value.kind_name())
}

pub(crate) fn write_uint(dst: &mut [u8], v: u64, swap: bool) {
    let bytes = v.to_le_bytes();
    let n = dst.len().min(8);
    dst[..n].copy_from_slice(&bytes[..n]);
    if swap {
        dst[..n].reverse();
    }
}

pub(crate) fn read_uint(src: &[u8], swap: bool) -> u64 {
    let mut bytes = [0u8; 8];
    let n = src.len().min(8);
    bytes[..n].copy_from_slice(&src[..n]);
    if swap {
        bytes[..n].reverse();
    }
    u64::from_le_bytes(bytes)
}

pub(crate) fn read_int(src: &[u8], swap: bool) -> i64 {
    let n = src.len().min(8);
    if n == 0 {
        return 0;
    }
    let shift = 64 - 8 * n as u32;
    ((read_uint(src, swap) << shift) as i64) >> shift
}

fn integer_of(value: &Value) -> Option<i128> {
    match value {
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Some(*n as i128),
        Value::BigInt(b) => Some(*b),
        _ => None,
    }
}

fn integer_bounds(size: usize, signed: bool) -> (i128, i128) {
    let bits = 8 * size as u32;
    if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    }
}

fn write_pointer(
    dst: &mut [u8],
    addr: usize,
    position: ArgPosition,
    ty: &TypeDescriptor,
) -> AlienResult<()> {
    if dst.len() < 8 && (addr as u64) >> (8 * dst.len()) != 0 {
        return Err(AlienError::conversion(
            position,
            format!("{}-bit {}", 8 * dst.len(), ty.name()),
            format!("address {addr:#x}"),
        ));
    }
    write_uint(dst, addr as u64, false);
    Ok(())
}

/// Native code units of `s` for a string kind, NUL included.
#[must_use]
pub fn string_units(s: &str, kind: PrimitiveKind) -> Vec<u8> {
    match kind.char_size() {
        2 => s
            .encode_utf16()
            .chain(Some(0))
            .flat_map(u16::to_le_bytes)
            .collect(),
        4 => s
            .chars()
            .map(u32::from)
            .chain(Some(0))
            .flat_map(u32::to_le_bytes)
            .collect(),
        _ => s.bytes().chain(Some(0)).collect(),
    }
}

fn units_to_string(units: &[u8], char_size: usize) -> String {
    match char_size {
        2 => {
            let wide: Vec<u16> = units
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&wide)
        }
        4 => units
            .chunks_exact(4)
            .map(|c| {
                let unit = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                char::from_u32(unit).unwrap_or(char::REPLACEMENT_CHARACTER)
            })
            .collect(),
        _ => String::from_utf8_lossy(units).into_owned(),
    }
}

/// Reads a NUL-terminated string of `char_size` byte units, stopping early
/// after `max` units.
///
/// # Safety
/// `addr` must point to readable memory up to the terminator or `max`.
pub unsafe fn read_c_string(addr: usize, char_size: usize, max: Option<usize>) -> String {
    let base = addr as *const u8;
    let mut len = 0;
    loop {
        if max.is_some_and(|m| len >= m) {
            break;
        }
        // SAFETY: caller guarantees the unit is readable
        let unit = unsafe { std::slice::from_raw_parts(base.add(len * char_size), char_size) };
        if unit.iter().all(|&b| b == 0) {
            break;
        }
        len += 1;
    }
    // SAFETY: `len` units were just read
    let units = unsafe { std::slice::from_raw_parts(base, len * char_size) };
    units_to_string(units, char_size)
}

// Copies the text into scratch with room for its capacity plus the
// terminator. Returns the address and the capacity in units.
fn stage_text(
    ctx: &mut dyn CallContext,
    text: &TextBuffer,
    char_size: usize,
) -> AlienResult<(usize, usize)> {
    let units = string_units(&text.get(), char_kind(char_size));
    let capacity = text.capacity().max(units.len() / char_size - 1);
    let len = (capacity + 1) * char_size;
    let p = ctx.alloc_scratch(len, char_size)?;
    // SAFETY: scratch holds `len` bytes and `units.len() <= len`
    unsafe {
        ptr::write_bytes(p, 0, len);
        ptr::copy_nonoverlapping(units.as_ptr(), p, units.len());
    }
    Ok((p as usize, capacity))
}

/// Writes `value` as a C object of type `ty` into `dst`, which is exactly
/// `ty.size()` bytes.
pub fn decode_value(
    ctx: &mut dyn CallContext,
    value: &Value,
    ty: &TypeRef,
    direction: Direction,
    dst: &mut [u8],
    position: ArgPosition,
) -> AlienResult<()> {
    let kind = ty.kind();
    match kind {
        PrimitiveKind::Void | PrimitiveKind::Prototype => Err(AlienError::conversion(
            position,
            "a value type",
            ty.name(),
        )),
        PrimitiveKind::Bool => match value {
            Value::Bool(b) => {
                dst.fill(0);
                dst[0] = u8::from(*b);
                Ok(())
            }
            _ => Err(mismatch(position, ty, value)),
        },
        _ if kind.is_integer() => {
            let n = integer_of(value).ok_or_else(|| mismatch(position, ty, value))?;
            let (lo, hi) = integer_bounds(ty.size(), kind.is_signed());
            if n < lo || n > hi {
                return Err(AlienError::conversion(position, ty.name(), format!("{n}")));
            }
            write_uint(dst, n as u64, kind.is_swapped());
            Ok(())
        }
        PrimitiveKind::Float32 => {
            let v = value.as_f64().ok_or_else(|| mismatch(position, ty, value))?;
            dst.copy_from_slice(&(v as f32).to_le_bytes());
            Ok(())
        }
        PrimitiveKind::Float64 => {
            let v = value.as_f64().ok_or_else(|| mismatch(position, ty, value))?;
            dst.copy_from_slice(&v.to_le_bytes());
            Ok(())
        }
        _ if kind.is_string() => {
            let addr = match value {
                Value::Null | Value::Undefined => 0,
                Value::String(_) if direction.is_output() => {
                    return Err(AlienError::conversion(
                        position,
                        format!("text for output {}", ty.name()),
                        "string",
                    ));
                }
                Value::Text(text) => {
                    let (p, capacity) = stage_text(ctx, text, kind.char_size())?;
                    if direction.is_output() {
                        ctx.push_out(OutArg {
                            value: value.clone(),
                            ptr: p,
                            ty: ty.clone(),
                            count: capacity,
                        });
                    }
                    p
                }
                Value::String(s) => {
                    let units = string_units(s, kind);
                    let p = ctx.alloc_scratch(units.len(), kind.char_size())?;
                    // SAFETY: scratch was sized for the units
                    unsafe { ptr::copy_nonoverlapping(units.as_ptr(), p, units.len()) };
                    p as usize
                }
                Value::External(h) => h.addr(),
                _ => return Err(mismatch(position, ty, value)),
            };
            write_pointer(dst, addr, position, ty)
        }
        PrimitiveKind::Callback => {
            let addr = match value {
                Value::Null | Value::Undefined => 0,
                Value::Function(f) => ctx.reserve_trampoline(ty, f)?,
                Value::External(h) if h.fits(Some(ty)) || h.fits(ty.proto()) => h.addr(),
                _ => return Err(mismatch(position, ty, value)),
            };
            write_pointer(dst, addr, position, ty)
        }
        PrimitiveKind::Pointer => {
            let addr = decode_pointer(ctx, value, ty, direction, position)?;
            write_pointer(dst, addr, position, ty)
        }
        PrimitiveKind::Record => match value {
            Value::Object(obj) => {
                let fields = obj.read().clone();
                dst.fill(0);
                for member in ty.members() {
                    let Some(field) = fields.get(&member.name) else {
                        continue;
                    };
                    if field.is_nullish() && !member.ty.kind().is_pointer_like() {
                        continue;
                    }
                    let end = member.offset + member.ty.size();
                    decode_value(
                        ctx,
                        field,
                        &member.ty,
                        Direction::In,
                        &mut dst[member.offset..end],
                        position,
                    )?;
                }
                Ok(())
            }
            Value::Buffer(buf) => copy_raw(&buf.read(), dst, position, ty),
            _ => Err(mismatch(position, ty, value)),
        },
        PrimitiveKind::Union => match value {
            Value::Union(u) if u.ty().id() == ty.id() => {
                dst.copy_from_slice(&u.bytes());
                Ok(())
            }
            Value::Object(obj) => {
                let fields = obj.read().clone();
                let mut chosen = ty
                    .members()
                    .iter()
                    .filter_map(|m| fields.get(&m.name).map(|v| (m, v)));
                let (Some((member, field)), None) = (chosen.next(), chosen.next()) else {
                    return Err(AlienError::conversion(
                        position,
                        format!("exactly one member of {}", ty.name()),
                        "object",
                    ));
                };
                dst.fill(0);
                decode_value(
                    ctx,
                    field,
                    &member.ty,
                    Direction::In,
                    &mut dst[..member.ty.size()],
                    position,
                )
            }
            Value::Buffer(buf) => copy_raw(&buf.read(), dst, position, ty),
            _ => Err(mismatch(position, ty, value)),
        },
        PrimitiveKind::Array => {
            let Some((element, len, _)) = ty.element() else {
                return Err(mismatch(position, ty, value));
            };
            decode_array(ctx, value, ty, element, len, dst, position)
        }
        _ => Err(mismatch(position, ty, value)),
    }
}

fn copy_raw(
    src: &[u8],
    dst: &mut [u8],
    position: ArgPosition,
    ty: &TypeDescriptor,
) -> AlienResult<()> {
    if src.len() < dst.len() {
        return Err(AlienError::conversion(
            position,
            format!("{} bytes for {}", dst.len(), ty.name()),
            format!("buffer of {} bytes", src.len()),
        ));
    }
    let n = dst.len();
    dst.copy_from_slice(&src[..n]);
    Ok(())
}

fn decode_array(
    ctx: &mut dyn CallContext,
    value: &Value,
    ty: &TypeRef,
    element: &TypeRef,
    len: usize,
    dst: &mut [u8],
    position: ArgPosition,
) -> AlienResult<()> {
    dst.fill(0);
    match value {
        Value::Array(items) => {
            let items = items.read().clone();
            if items.len() > len {
                return Err(AlienError::conversion(
                    position,
                    ty.name(),
                    format!("array of {} elements", items.len()),
                ));
            }
            let size = element.size();
            for (i, item) in items.iter().enumerate() {
                decode_value(
                    ctx,
                    item,
                    element,
                    Direction::In,
                    &mut dst[i * size..(i + 1) * size],
                    position,
                )?;
            }
            Ok(())
        }
        Value::String(s) if element.kind().is_integer() => {
            let mut units = string_units(s, char_kind(element.size()));
            // keep room for the terminator
            let cap = dst.len().saturating_sub(element.size());
            units.truncate(cap);
            dst[..units.len()].copy_from_slice(&units);
            Ok(())
        }
        Value::Buffer(buf) => {
            let buf = buf.read();
            let n = buf.len().min(dst.len());
            dst[..n].copy_from_slice(&buf[..n]);
            swap_elements(&mut dst[..n], element);
            Ok(())
        }
        _ => Err(mismatch(position, ty, value)),
    }
}

fn char_kind(size: usize) -> PrimitiveKind {
    match size {
        2 => PrimitiveKind::String16,
        4 => PrimitiveKind::String32,
        _ => PrimitiveKind::String,
    }
}

/// Buffers hold host order; swapped element kinds store the reverse.
fn swap_elements(bytes: &mut [u8], element: &TypeDescriptor) {
    if element.kind().is_swapped() {
        for chunk in bytes.chunks_exact_mut(element.size()) {
            chunk.reverse();
        }
    }
}

fn is_char(ty: &TypeRef) -> bool {
    ty.kind().is_integer() && matches!(ty.size(), 1 | 2 | 4)
}

fn is_aggregate(ty: &TypeRef) -> bool {
    matches!(ty.kind(), PrimitiveKind::Record | PrimitiveKind::Union)
}

fn decode_pointer(
    ctx: &mut dyn CallContext,
    value: &Value,
    ty: &TypeRef,
    direction: Direction,
    position: ArgPosition,
) -> AlienResult<usize> {
    let pointee = ty.pointee();
    match value {
        Value::Null | Value::Undefined => Ok(0),
        Value::External(h) if h.fits(pointee) => Ok(h.addr()),
        Value::External(h) => Err(AlienError::conversion(
            position,
            ty.name(),
            format!("{h:?}"),
        )),
        Value::Buffer(buf) => {
            let bytes = buf.read().clone();
            let p = ctx.alloc_scratch(bytes.len().max(1), 16)?;
            // SAFETY: scratch holds at least `bytes.len()` bytes
            let dst = unsafe { std::slice::from_raw_parts_mut(p, bytes.len()) };
            dst.copy_from_slice(&bytes);
            if let Some(element) = pointee {
                swap_elements(dst, element);
            }
            if direction.is_output() {
                ctx.push_out(OutArg {
                    value: value.clone(),
                    ptr: p as usize,
                    ty: pointee.cloned().unwrap_or_else(|| ty.clone()),
                    count: bytes.len(),
                });
            }
            Ok(p as usize)
        }
        Value::Text(text) if pointee.is_some_and(is_char) => {
            let Some(element) = pointee else {
                return Err(mismatch(position, ty, value));
            };
            let (p, capacity) = stage_text(ctx, text, element.size())?;
            if direction.is_output() {
                ctx.push_out(OutArg {
                    value: value.clone(),
                    ptr: p,
                    ty: element.clone(),
                    count: capacity,
                });
            }
            Ok(p)
        }
        Value::String(s) if pointee.is_some_and(|p| p.kind().is_integer()) => {
            let size = pointee.map_or(1, |p| p.size());
            let units = string_units(s, char_kind(size));
            let p = ctx.alloc_scratch(units.len(), size)?;
            // SAFETY: scratch was sized for the units
            unsafe { ptr::copy_nonoverlapping(units.as_ptr(), p, units.len()) };
            Ok(p as usize)
        }
        Value::Array(items) if pointee.is_some() => {
            let Some(element) = pointee else {
                return Err(mismatch(position, ty, value));
            };
            let items = items.read().clone();
            let count = items.len().max(1);
            let size = element.size();
            let p = ctx.alloc_scratch(size * count, element.align())?;
            // SAFETY: scratch holds `count` elements
            let dst = unsafe { std::slice::from_raw_parts_mut(p, size * count) };
            dst.fill(0);
            if direction != Direction::Out {
                for (i, item) in items.iter().enumerate() {
                    decode_value(
                        ctx,
                        item,
                        element,
                        Direction::In,
                        &mut dst[i * size..(i + 1) * size],
                        position,
                    )?;
                }
            }
            if direction.is_output() {
                ctx.push_out(OutArg {
                    value: value.clone(),
                    ptr: p as usize,
                    ty: element.clone(),
                    count: items.len(),
                });
            }
            Ok(p as usize)
        }
        Value::Object(_) | Value::Union(_) if pointee.is_some_and(is_aggregate) => {
            let Some(record) = pointee else {
                return Err(mismatch(position, ty, value));
            };
            if let Value::Union(u) = value
                && u.ty().id() != record.id()
            {
                return Err(mismatch(position, ty, value));
            }
            let p = ctx.alloc_scratch(record.size().max(1), record.align())?;
            // SAFETY: scratch holds one record
            let dst = unsafe { std::slice::from_raw_parts_mut(p, record.size()) };
            dst.fill(0);
            if direction != Direction::Out {
                decode_value(ctx, value, record, Direction::In, dst, position)?;
            }
            if direction.is_output() {
                ctx.push_out(OutArg {
                    value: value.clone(),
                    ptr: p as usize,
                    ty: record.clone(),
                    count: 1,
                });
            }
            Ok(p as usize)
        }
        _ => Err(mismatch(position, ty, value)),
    }
}

/// Reads the C object in `src` back into a value.
///
/// # Safety
/// String pointers inside `src` must be null or point to terminated
/// strings.
pub unsafe fn encode_value(src: &[u8], ty: &TypeRef) -> AlienResult<Value> {
    let kind = ty.kind();
    let value = match kind {
        PrimitiveKind::Void | PrimitiveKind::Prototype => Value::Undefined,
        PrimitiveKind::Bool => Value::Bool(src.first().is_some_and(|&b| b != 0)),
        _ if kind.is_integer() && kind.is_signed() => {
            Value::from_i64(read_int(&src[..ty.size()], kind.is_swapped()))
        }
        _ if kind.is_integer() => Value::from_u64(read_uint(&src[..ty.size()], kind.is_swapped())),
        PrimitiveKind::Float32 => {
            let bits = read_uint(&src[..4], false) as u32;
            Value::Number(f64::from(f32::from_bits(bits)))
        }
        PrimitiveKind::Float64 => Value::Number(f64::from_bits(read_uint(&src[..8], false))),
        _ if kind.is_string() => {
            let addr = read_uint(&src[..ty.size()], false) as usize;
            if addr == 0 {
                Value::Null
            } else {
                // SAFETY: forwarded from the caller
                Value::string(unsafe { read_c_string(addr, kind.char_size(), None) })
            }
        }
        PrimitiveKind::Pointer => {
            let addr = read_uint(&src[..ty.size()], false) as usize;
            if addr == 0 {
                Value::Null
            } else {
                Value::External(Handle::new(addr, ty.pointee().cloned()))
            }
        }
        PrimitiveKind::Callback => {
            let addr = read_uint(&src[..ty.size()], false) as usize;
            if addr == 0 {
                Value::Null
            } else {
                Value::External(Handle::new(addr, Some(ty.clone())))
            }
        }
        PrimitiveKind::Record => {
            let mut fields = BTreeMap::new();
            for member in ty.members() {
                let end = member.offset + member.ty.size();
                // SAFETY: forwarded from the caller
                let v = unsafe { encode_value(&src[member.offset..end], &member.ty)? };
                fields.insert(member.name.clone(), v);
            }
            Value::Object(Arc::new(RwLock::new(fields)))
        }
        PrimitiveKind::Union => Value::Union(UnionValue::new(ty.clone(), &src[..ty.size()])),
        PrimitiveKind::Array => match ty.shape() {
            Shape::Array {
                element,
                len,
                hint: ArrayHint::String,
            } => {
                let size = element.size();
                let bytes = &src[..size * len];
                let end = bytes
                    .chunks_exact(size)
                    .position(|c| c.iter().all(|&b| b == 0))
                    .unwrap_or(*len);
                Value::string(units_to_string(&bytes[..end * size], size))
            }
            Shape::Array {
                element,
                len,
                hint: ArrayHint::Typed,
            } => {
                let mut bytes = src[..element.size() * len].to_vec();
                swap_elements(&mut bytes, element);
                Value::buffer(bytes)
            }
            Shape::Array { element, len, .. } => {
                let size = element.size();
                let mut items = Vec::with_capacity(*len);
                for i in 0..*len {
                    // SAFETY: forwarded from the caller
                    items.push(unsafe { encode_value(&src[i * size..(i + 1) * size], element)? });
                }
                Value::array(items)
            }
            _ => Value::Undefined,
        },
        _ => Value::Undefined,
    };
    Ok(value)
}

/// Copies an output argument back into its value.
///
/// # Safety
/// `out.ptr` must still hold `out.count` elements of `out.ty`.
pub unsafe fn pop_out(out: &OutArg) -> AlienResult<()> {
    let size = out.ty.size();
    match &out.value {
        Value::Array(items) => {
            let mut decoded = Vec::with_capacity(out.count);
            for i in 0..out.count {
                // SAFETY: caller guarantees `count` elements at `ptr`
                let bytes = unsafe {
                    std::slice::from_raw_parts((out.ptr + i * size) as *const u8, size)
                };
                // SAFETY: the element was written by native code of that type
                decoded.push(unsafe { encode_value(bytes, &out.ty)? });
            }
            *items.write() = decoded;
        }
        Value::Text(text) => {
            let kind = out.ty.kind();
            let char_size = if kind.is_string() { kind.char_size() } else { size };
            // SAFETY: the text was staged with `count` units plus a terminator
            text.set(unsafe { read_c_string(out.ptr, char_size, Some(out.count)) });
        }
        Value::Union(u) => {
            // SAFETY: caller guarantees one union at `ptr`
            u.store(unsafe { std::slice::from_raw_parts(out.ptr as *const u8, size) });
        }
        Value::Object(obj) if out.ty.kind() == PrimitiveKind::Union => {
            // SAFETY: caller guarantees one union at `ptr`
            let bytes = unsafe { std::slice::from_raw_parts(out.ptr as *const u8, size) };
            let mut fields = obj.write();
            for member in out.ty.members() {
                if let Some(field) = fields.get_mut(&member.name) {
                    let end = member.offset + member.ty.size();
                    // SAFETY: the member was written by native code of that type
                    *field = unsafe { encode_value(&bytes[member.offset..end], &member.ty)? };
                }
            }
        }
        Value::Object(obj) => {
            // SAFETY: caller guarantees one record at `ptr`
            let bytes = unsafe { std::slice::from_raw_parts(out.ptr as *const u8, size) };
            // SAFETY: as above
            if let Value::Object(fresh) = unsafe { encode_value(bytes, &out.ty)? } {
                let fresh = fresh.read().clone();
                obj.write().extend(fresh);
            }
        }
        Value::Buffer(buf) => {
            // SAFETY: the buffer was copied to `ptr` with `count` bytes
            let bytes = unsafe { std::slice::from_raw_parts(out.ptr as *const u8, out.count) };
            let mut bytes = bytes.to_vec();
            swap_elements(&mut bytes, &out.ty);
            let mut buf = buf.write();
            let n = buf.len().min(bytes.len());
            buf[..n].copy_from_slice(&bytes[..n]);
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ctype::{DataModel, RecordBuilder, TypeDescriptor, UnionBuilder};

    /// Scratch from the global allocator, leaked for the test's lifetime.
    #[derive(Default)]
    pub(crate) struct TestContext {
        pub blocks: Vec<Vec<u64>>,
        pub outs: Vec<OutArg>,
        pub reserved: usize,
    }

    impl CallContext for TestContext {
        fn alloc_scratch(&mut self, size: usize, _align: usize) -> AlienResult<*mut u8> {
            let mut block = vec![0u64; size.div_ceil(8).max(1)];
            let p = block.as_mut_ptr().cast::<u8>();
            self.blocks.push(block);
            Ok(p)
        }

        fn reserve_trampoline(&mut self, _ty: &TypeRef, _func: &Function) -> AlienResult<usize> {
            self.reserved += 1;
            Ok(0x1000 * self.reserved)
        }

        fn push_out(&mut self, out: OutArg) {
            self.outs.push(out);
        }
    }

    fn prim(kind: PrimitiveKind) -> TypeRef {
        TypeDescriptor::scalar(kind, DataModel::LP64).expect("scalar")
    }

    fn decode(ty: &TypeRef, value: &Value) -> AlienResult<Vec<u8>> {
        let mut ctx = TestContext::default();
        let mut bytes = vec![0u8; ty.size()];
        decode_value(&mut ctx, value, ty, Direction::In, &mut bytes, ArgPosition::Param(0))?;
        Ok(bytes)
    }

    #[test]
    fn integers_are_range_checked() {
        let i8_ = prim(PrimitiveKind::Int8);
        assert_eq!(decode(&i8_, &Value::Number(-128.0)).expect("in range"), vec![0x80]);
        let err = decode(&i8_, &Value::Number(128.0)).expect_err("out of range");
        assert!(matches!(err, AlienError::Conversion { .. }));
        assert!(decode(&i8_, &Value::Number(1.5)).is_err());
        assert!(decode(&prim(PrimitiveKind::UInt32), &Value::Number(-1.0)).is_err());
    }

    #[test]
    fn swapped_u16_writes_big_endian() {
        let ty = prim(PrimitiveKind::UInt16S);
        let bytes = decode(&ty, &Value::Number(f64::from(0x1234))).expect("u16s");
        assert_eq!(bytes, vec![0x12, 0x34]);
        // SAFETY: no pointers involved
        let back = unsafe { encode_value(&bytes, &ty) }.expect("encode");
        assert_eq!(back, Value::Number(f64::from(0x1234)));
    }

    #[test]
    fn sixty_four_bit_values_cross_the_safe_boundary() {
        let i64_ = prim(PrimitiveKind::Int64);
        let u64_ = prim(PrimitiveKind::UInt64);
        let big = Value::BigInt(i128::from(i64::MIN));
        let bytes = decode(&i64_, &big).expect("i64 min");
        // SAFETY: no pointers involved
        assert_eq!(unsafe { encode_value(&bytes, &i64_) }.expect("encode"), big);

        let bytes = decode(&u64_, &Value::Number(9007199254740991.0)).expect("safe max");
        // SAFETY: no pointers involved
        let v = unsafe { encode_value(&bytes, &u64_) }.expect("encode");
        assert_eq!(v, Value::Number(9007199254740991.0));

        let bytes = (1u64 << 53).to_le_bytes();
        // SAFETY: no pointers involved
        let v = unsafe { encode_value(&bytes, &u64_) }.expect("encode");
        assert_eq!(v, Value::BigInt(1 << 53));
    }

    #[test]
    fn narrow_pointers_reject_high_addresses() {
        let ptr32 = TypeDescriptor::scalar(PrimitiveKind::Pointer, DataModel::ILP32)
            .expect("ptr");
        let handle = Value::External(Handle::new(0x1_0000_0000, None));
        assert!(decode(&ptr32, &handle).is_err());
        let low = Value::External(Handle::new(0x1000, None));
        assert_eq!(decode(&ptr32, &low).expect("fits"), vec![0, 0x10, 0, 0]);
    }

    #[test]
    fn records_decode_field_by_field() {
        let rec = RecordBuilder::new("P")
            .member("x", prim(PrimitiveKind::Int32))
            .member("y", prim(PrimitiveKind::Float32))
            .build()
            .expect("record");
        let value = Value::object([("x", Value::Number(7.0)), ("y", Value::Number(0.5))]);
        let bytes = decode(&rec, &value).expect("record");
        assert_eq!(&bytes[..4], &7i32.to_le_bytes());
        assert_eq!(&bytes[4..], &0.5f32.to_le_bytes());
        // SAFETY: no pointers involved
        let back = unsafe { encode_value(&bytes, &rec) }.expect("encode");
        assert_eq!(back.get("y"), Some(Value::Number(0.5)));
    }

    #[test]
    fn strings_go_through_scratch() {
        let ty = TypeDescriptor::string(PrimitiveKind::String16, DataModel::host()).expect("str16");
        let mut ctx = TestContext::default();
        let mut bytes = vec![0u8; ty.size()];
        decode_value(
            &mut ctx,
            &Value::string("hé"),
            &ty,
            Direction::In,
            &mut bytes,
            ArgPosition::Param(0),
        )
        .expect("string");
        assert_eq!(ctx.blocks.len(), 1);
        // SAFETY: the pointer refers to the scratch block above
        let back = unsafe { encode_value(&bytes, &ty) }.expect("encode");
        assert_eq!(back, Value::string("hé"));
    }

    #[test]
    fn out_arrays_are_popped_after_the_call() {
        let i32_ = prim(PrimitiveKind::Int32);
        let ptr = TypeDescriptor::pointer(i32_, DataModel::host());
        let target = Value::array(vec![Value::Number(1.0), Value::Number(2.0)]);
        let mut ctx = TestContext::default();
        let mut bytes = vec![0u8; ptr.size()];
        decode_value(&mut ctx, &target, &ptr, Direction::InOut, &mut bytes, ArgPosition::Param(0))
            .expect("pointer");
        let out = ctx.outs.pop().expect("out arg");
        // SAFETY: out.ptr is the live scratch block; simulate the callee
        unsafe { *(out.ptr as *mut i32).add(1) = 42 };
        // SAFETY: still alive
        unsafe { pop_out(&out) }.expect("pop");
        let Value::Array(items) = &target else {
            unreachable!()
        };
        assert_eq!(*items.read(), vec![Value::Number(1.0), Value::Number(42.0)]);
    }

    fn stage(ty: &TypeRef, value: &Value, direction: Direction) -> AlienResult<TestContext> {
        let mut ctx = TestContext::default();
        let mut bytes = vec![0u8; ty.size()];
        decode_value(&mut ctx, value, ty, direction, &mut bytes, ArgPosition::Param(0))?;
        Ok(ctx)
    }

    #[test]
    fn empty_out_arrays_stay_empty() {
        let ptr = TypeDescriptor::pointer(prim(PrimitiveKind::Int32), DataModel::host());
        let target = Value::array(Vec::new());
        let mut ctx = stage(&ptr, &target, Direction::Out).expect("pointer");
        let out = ctx.outs.pop().expect("out arg");
        assert_eq!(out.count, 0);
        // SAFETY: out.ptr is the live scratch block
        unsafe { pop_out(&out) }.expect("pop");
        let Value::Array(items) = &target else {
            unreachable!()
        };
        assert!(items.read().is_empty());
    }

    #[test]
    fn out_buffers_swap_back_to_host_order() {
        let ptr = TypeDescriptor::pointer(prim(PrimitiveKind::UInt16S), DataModel::host());
        let target = Value::buffer(vec![0x34, 0x12]);
        let mut ctx = stage(&ptr, &target, Direction::InOut).expect("pointer");
        let out = ctx.outs.pop().expect("out arg");
        // SAFETY: out.ptr is the live scratch block; simulate the callee
        unsafe {
            let staged = std::slice::from_raw_parts_mut(out.ptr as *mut u8, 2);
            assert_eq!(staged, [0x12, 0x34]);
            staged.copy_from_slice(&[0xAB, 0xCD]);
        }
        // SAFETY: still alive
        unsafe { pop_out(&out) }.expect("pop");
        let Value::Buffer(buf) = &target else {
            unreachable!()
        };
        assert_eq!(*buf.read(), vec![0xCD, 0xAB]);
    }

    #[test]
    fn out_records_keep_unwritten_fields() {
        let point = RecordBuilder::new("point")
            .member("x", prim(PrimitiveKind::Int32))
            .member("y", prim(PrimitiveKind::Float32))
            .build()
            .expect("record");
        let ptr = TypeDescriptor::pointer(point, DataModel::host());
        let target = Value::object([("x", Value::Number(1.0)), ("y", Value::Number(2.5))]);
        let mut ctx = stage(&ptr, &target, Direction::InOut).expect("pointer");
        let out = ctx.outs.pop().expect("out arg");
        // SAFETY: out.ptr is the live scratch block; simulate the callee
        unsafe { *(out.ptr as *mut i32) = 5 };
        // SAFETY: still alive
        unsafe { pop_out(&out) }.expect("pop");
        assert_eq!(target.get("x"), Some(Value::Number(5.0)));
        assert_eq!(target.get("y"), Some(Value::Number(2.5)));
    }

    #[test]
    fn out_unions_are_written_back_as_raw_bytes() {
        let un = UnionBuilder::new("U")
            .member("i", prim(PrimitiveKind::Int32))
            .member("f", prim(PrimitiveKind::Float32))
            .build()
            .expect("union");
        let ptr = TypeDescriptor::pointer(un.clone(), DataModel::host());

        let target = Value::Union(UnionValue::new(un.clone(), &7i32.to_le_bytes()));
        let mut ctx = stage(&ptr, &target, Direction::InOut).expect("union pointer");
        let out = ctx.outs.pop().expect("out arg");
        // SAFETY: out.ptr is the live scratch block; simulate the callee
        unsafe {
            assert_eq!(*(out.ptr as *const i32), 7);
            *(out.ptr as *mut i32) = 42;
        }
        // SAFETY: still alive
        unsafe { pop_out(&out) }.expect("pop");
        let Value::Union(u) = &target else {
            unreachable!()
        };
        // SAFETY: no pointer members
        assert_eq!(unsafe { u.member("i") }.expect("member"), Value::Number(42.0));

        let target = Value::object([("f", Value::Number(0.0))]);
        let mut ctx = stage(&ptr, &target, Direction::Out).expect("object pointer");
        let out = ctx.outs.pop().expect("out arg");
        // SAFETY: as above
        unsafe { *(out.ptr as *mut f32) = 1.5 };
        // SAFETY: still alive
        unsafe { pop_out(&out) }.expect("pop");
        assert_eq!(target.get("f"), Some(Value::Number(1.5)));
        assert_eq!(target.get("i"), None);

        let other = UnionBuilder::new("V")
            .member("i", prim(PrimitiveKind::Int32))
            .build()
            .expect("union");
        let stranger = Value::Union(UnionValue::new(other, &[0; 4]));
        assert!(stage(&ptr, &stranger, Direction::InOut).is_err());
    }

    #[test]
    fn out_strings_are_read_back_up_to_their_capacity() {
        let string = TypeDescriptor::string(PrimitiveKind::String, DataModel::host()).expect("string");
        let target = Value::text("abc", 8);
        let mut ctx = stage(&string, &target, Direction::InOut).expect("text");
        let out = ctx.outs.pop().expect("out arg");
        assert_eq!(out.count, 8);
        // SAFETY: out.ptr is the live scratch block of 9 bytes; simulate the callee
        unsafe {
            let staged = std::slice::from_raw_parts_mut(out.ptr as *mut u8, 9);
            assert_eq!(&staged[..4], b"abc\0");
            staged[..6].copy_from_slice(b"hello\0");
        }
        // SAFETY: still alive
        unsafe { pop_out(&out) }.expect("pop");
        let Value::Text(text) = &target else {
            unreachable!()
        };
        assert_eq!(text.get(), "hello");

        // a callee that fills every unit leaves no terminator in range
        let chars = TypeDescriptor::pointer(prim(PrimitiveKind::UInt8), DataModel::host());
        let target = Value::text("", 3);
        let mut ctx = stage(&chars, &target, Direction::Out).expect("text");
        let out = ctx.outs.pop().expect("out arg");
        // SAFETY: out.ptr is the live scratch block of 4 bytes
        unsafe { std::slice::from_raw_parts_mut(out.ptr as *mut u8, 4).copy_from_slice(b"abcd") };
        // SAFETY: still alive
        unsafe { pop_out(&out) }.expect("pop");
        let Value::Text(text) = &target else {
            unreachable!()
        };
        assert_eq!(text.get(), "abc");

        assert!(stage(&string, &Value::string("fixed"), Direction::InOut).is_err());
    }

    #[test]
    fn char_arrays_truncate_strings() {
        let u8_ = prim(PrimitiveKind::UInt8);
        let arr = TypeDescriptor::array(u8_, 4, ArrayHint::String).expect("array");
        let bytes = decode(&arr, &Value::string("hello")).expect("chars");
        assert_eq!(bytes, b"hel\0".to_vec());
        // SAFETY: no pointers involved
        assert_eq!(unsafe { encode_value(&bytes, &arr) }.expect("encode"), Value::string("hel"));
    }
}
