//! Result decoding: raw result registers or hidden-pointer memory back into
//! a value.

use ctype::{Disposer, Extend, FunctionLayout, PassMode, TypeRef};

use crate::{
    AlienError, AlienResult,
    abi::FrameShape,
    codec::{encode_value, read_uint},
    dispatch::RawResult,
};

/// Reassembles the memory image of the return value.
///
/// Register pieces are compacted back into the declared layout; indirect
/// returns are copied out of the buffer at `hidden`.
///
/// # Safety
/// For indirect returns `hidden` must point to `ret.size()` readable bytes.
pub unsafe fn result_image(
    layout: &FunctionLayout,
    shape: &FrameShape,
    ret: &TypeRef,
    raw: &RawResult,
    hidden: Option<usize>,
) -> AlienResult<Vec<u8>> {
    let size = ret.size();
    let mut image = vec![0u8; size];
    match layout.ret.mode {
        PassMode::Ignore => {}
        PassMode::Indirect => {
            let addr = hidden.ok_or(AlienError::FrameOverflow {
                needed: size,
                capacity: 0,
            })?;
            // SAFETY: caller guarantees the buffer
            let src = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
            image.copy_from_slice(src);
        }
        PassMode::Direct => {
            for piece in &layout.ret.pieces {
                let from = piece.src as usize;
                let to = from + piece.len as usize;
                let capacity = image.len();
                let dst = image
                    .get_mut(from..to)
                    .ok_or(AlienError::FrameOverflow { needed: to, capacity })?;
                if piece.extend == Extend::X87 {
                    let mut bits = [0u8; 8];
                    raw.read(piece.dest, shape.vec_slot, &mut bits);
                    let double = f64::from_bits(u64::from_le_bytes(bits));
                    match dst.len() {
                        4 => dst.copy_from_slice(&(double as f32).to_le_bytes()),
                        _ => dst.copy_from_slice(&bits[..dst.len().min(8)]),
                    }
                } else if !raw.read(piece.dest, shape.vec_slot, dst) {
                    return Err(AlienError::FrameOverflow {
                        needed: to,
                        capacity: 48,
                    });
                }
            }
        }
    }
    Ok(image)
}

/// Runs a type's disposer on drop, so it fires even when decoding fails.
pub struct DisposeGuard {
    disposer: Option<(Disposer, usize)>,
}

impl DisposeGuard {
    #[must_use]
    pub fn new(ret: &TypeRef, image: &[u8]) -> DisposeGuard {
        let disposer = ret.disposer().and_then(|d| {
            let addr = read_uint(&image[..ret.size().min(image.len())], false) as usize;
            (addr != 0).then(|| (d.clone(), addr))
        });
        DisposeGuard { disposer }
    }
}

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        if let Some((disposer, addr)) = self.disposer.take() {
            disposer(addr);
        }
    }
}

/// Decodes the return value of a completed call; the disposer, if any,
/// runs exactly once afterwards.
///
/// # Safety
/// As for [`result_image`]; returned strings must be terminated.
pub unsafe fn decode_result(
    layout: &FunctionLayout,
    shape: &FrameShape,
    ret: &TypeRef,
    raw: &RawResult,
    hidden: Option<usize>,
) -> AlienResult<crate::Value> {
    // SAFETY: forwarded from the caller
    let image = unsafe { result_image(layout, shape, ret, raw, hidden)? };
    let _guard = DisposeGuard::new(ret, &image);
    // SAFETY: forwarded from the caller
    unsafe { encode_value(&image, ret) }
}
