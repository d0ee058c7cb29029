//! Frame images: `[gpr image | vec image | stack image]`, contiguous and
//! 16-byte aligned, filled piece by piece from a [`FunctionLayout`].
//!
//! The same placement code runs in reverse for the relay, which reads
//! incoming arguments out of a saved register image and the caller's
//! stack.

use std::ptr::NonNull;

use ctype::{Extend, Fixup, FunctionLayout, Location, Piece};
use log::trace;

use crate::{
    AlienError, AlienResult, ArgPosition,
    abi::FrameShape,
    arena::StackArena,
    codec::{read_int, read_uint, write_uint},
};

/// Where a location lives: an offset into the register images or into the
/// stack image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Regs(usize),
    Stack(usize),
}

fn resolve(shape: &FrameShape, loc: Location) -> Slot {
    match shape.register_offset(loc) {
        Some(off) => Slot::Regs(off),
        None => match loc {
            Location::Stack(off) => Slot::Stack(off as usize),
            _ => Slot::Stack(0),
        },
    }
}

fn region<'a>(
    regs: &'a mut [u8],
    stack: &'a mut [u8],
    slot: Slot,
    width: usize,
) -> AlienResult<&'a mut [u8]> {
    let (bytes, off) = match slot {
        Slot::Regs(off) => (regs, off),
        Slot::Stack(off) => (stack, off),
    };
    let capacity = bytes.len();
    bytes
        .get_mut(off..off + width)
        .ok_or(AlienError::FrameOverflow {
            needed: off + width,
            capacity,
        })
}

/// Writes the `piece` of the value image `src` into its destination,
/// applying the piece's extension.
pub fn store(
    shape: &FrameShape,
    regs: &mut [u8],
    stack: &mut [u8],
    piece: &Piece,
    src: &[u8],
) -> AlienResult<()> {
    let from = piece.src as usize;
    let len = piece.len as usize;
    let bytes = src.get(from..from + len).ok_or(AlienError::FrameOverflow {
        needed: from + len,
        capacity: src.len(),
    })?;
    let dst = region(regs, stack, resolve(shape, piece.dest), piece.width as usize)?;
    match piece.extend {
        Extend::None | Extend::X87 => {
            dst[..len].copy_from_slice(bytes);
            dst[len..].fill(0);
        }
        Extend::Sign => write_uint(dst, read_int(bytes, false) as u64, false),
        Extend::Zero => write_uint(dst, read_uint(bytes, false), false),
        Extend::NanBox => {
            dst[..len].copy_from_slice(bytes);
            dst[len..].fill(0xff);
        }
        Extend::Promote => {
            let single = f32::from_bits(read_uint(bytes, false) as u32);
            write_uint(dst, f64::from(single).to_bits(), false);
        }
    }
    if dst.len() > 8 && matches!(piece.extend, Extend::Sign | Extend::Zero | Extend::Promote) {
        dst[8..].fill(0);
    }
    Ok(())
}

/// Reads the `piece` back from its location into the value image `dst`.
pub fn fetch(
    shape: &FrameShape,
    regs: &[u8],
    stack: &[u8],
    piece: &Piece,
    dst: &mut [u8],
) -> AlienResult<()> {
    let (bytes, off) = match resolve(shape, piece.dest) {
        Slot::Regs(off) => (regs, off),
        Slot::Stack(off) => (stack, off),
    };
    let width = if piece.extend == Extend::Promote {
        8
    } else {
        piece.len as usize
    };
    let raw = bytes.get(off..off + width).ok_or(AlienError::FrameOverflow {
        needed: off + width,
        capacity: bytes.len(),
    })?;
    let to = piece.src as usize;
    let dst_len = dst.len();
    let out = dst
        .get_mut(to..to + piece.len as usize)
        .ok_or(AlienError::FrameOverflow {
            needed: to + piece.len as usize,
            capacity: dst_len,
        })?;
    if piece.extend == Extend::Promote {
        let double = f64::from_bits(read_uint(raw, false));
        write_uint(out, u64::from((double as f32).to_bits()), false);
    } else {
        out.copy_from_slice(raw);
    }
    Ok(())
}

/// Little-endian image of a native address for a slot of `width` bytes.
pub(crate) fn address_image(
    addr: usize,
    width: usize,
    position: ArgPosition,
) -> AlienResult<[u8; 8]> {
    if width < 8 && (addr as u64) >> (8 * width) != 0 {
        return Err(AlienError::conversion(
            position,
            format!("{}-bit address", 8 * width),
            format!("{addr:#x}"),
        ));
    }
    Ok((addr as u64).to_le_bytes())
}

/// A frame image carved out of a stack arena.
#[derive(Debug)]
pub struct Frame {
    base: NonNull<u8>,
    shape: FrameShape,
    args_size: usize,
    // arena bounds, for hosts that track stack limits
    stack_base: usize,
    stack_limit: usize,
}

// SAFETY: the frame points into an arena owned by the same call session
unsafe impl Send for Frame {}

impl Frame {
    /// Carves a zeroed frame off the arena top.
    pub fn carve(
        arena: &mut StackArena,
        shape: FrameShape,
        args_size: usize,
    ) -> AlienResult<Frame> {
        let len = shape.prefix() + args_size;
        let base = arena.carve(len, 16, 0)?;
        // SAFETY: `carve` returned `len` writable bytes
        unsafe { std::ptr::write_bytes(base.as_ptr(), 0, len) };
        trace!("frame of {len} bytes at {:#x}", base.as_ptr() as usize);
        Ok(Frame {
            base,
            shape,
            args_size,
            stack_base: arena.end(),
            stack_limit: arena.floor(),
        })
    }

    /// Wraps caller-provided memory.
    ///
    /// # Safety
    /// `base` must be 16-byte aligned and valid for `shape.prefix() +
    /// args_size` bytes for as long as the frame is used.
    #[must_use]
    pub unsafe fn from_raw(base: NonNull<u8>, shape: FrameShape, args_size: usize) -> Frame {
        let end = base.as_ptr() as usize + shape.prefix() + args_size;
        Frame {
            base,
            shape,
            args_size,
            stack_base: end,
            stack_limit: base.as_ptr() as usize,
        }
    }

    #[must_use]
    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.prefix() + self.args_size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Address the callee sees as its stack pointer at entry.
    #[must_use]
    pub fn stack_addr(&self) -> usize {
        self.base() + self.shape.prefix()
    }

    #[must_use]
    pub fn args_size(&self) -> usize {
        self.args_size
    }

    #[must_use]
    pub fn stack_bounds(&self) -> (usize, usize) {
        (self.stack_base, self.stack_limit)
    }

    #[must_use]
    pub fn image(&self) -> &[u8] {
        // SAFETY: upheld by the constructors
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len()) }
    }

    pub fn image_mut(&mut self) -> &mut [u8] {
        // SAFETY: upheld by the constructors
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len()) }
    }

    #[must_use]
    pub fn gpr(&self) -> &[u8] {
        &self.image()[..self.shape.gpr_bytes()]
    }

    #[must_use]
    pub fn vec(&self) -> &[u8] {
        &self.image()[self.shape.gpr_bytes()..self.shape.prefix()]
    }

    #[must_use]
    pub fn stack(&self) -> &[u8] {
        &self.image()[self.shape.prefix()..]
    }

    /// Word `i` of the general register image.
    #[must_use]
    pub fn gpr_word(&self, i: usize) -> u64 {
        let slot = self.shape.gpr_slot as usize;
        read_uint(&self.gpr()[i * slot..(i + 1) * slot], false)
    }

    pub fn place(&mut self, piece: &Piece, src: &[u8]) -> AlienResult<()> {
        let shape = self.shape;
        let prefix = shape.prefix();
        let (regs, stack) = self.image_mut().split_at_mut(prefix);
        store(&shape, regs, stack, piece, src)
    }

    /// Writes a native address into `loc` using the slot width.
    pub fn place_address(&mut self, loc: Location, addr: usize, position: ArgPosition) -> AlienResult<()> {
        let width = self.shape.gpr_slot;
        let image = address_image(addr, width as usize, position)?;
        self.place(&Piece::raw(0, width, loc), &image)
    }

    pub fn apply_fixups(&mut self, layout: &FunctionLayout) -> AlienResult<()> {
        for fixup in &layout.fixups {
            let (reg, value) = match *fixup {
                Fixup::StackAddress(reg) => (reg, self.stack_addr()),
                Fixup::StackSize(reg) => (reg, self.args_size),
            };
            self.place_address(Location::Gpr(reg), value, ArgPosition::Return)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::classifier;
    use ctype::Abi;

    fn shape() -> FrameShape {
        classifier(Abi::X64SysV).shape()
    }

    #[test]
    fn sign_and_zero_extension_fill_the_slot() {
        let shape = shape();
        let mut regs = vec![0u8; shape.prefix()];
        let mut stack = vec![0u8; 16];
        let minus_one = (-1i16).to_le_bytes();
        let sign = Piece::widened(0, 2, Location::Gpr(1), Extend::Sign, 8);
        store(&shape, &mut regs, &mut stack, &sign, &minus_one).expect("store");
        assert_eq!(&regs[8..16], &[0xff; 8]);
        let zero = Piece::widened(0, 2, Location::Stack(8), Extend::Zero, 8);
        store(&shape, &mut regs, &mut stack, &zero, &minus_one).expect("store");
        assert_eq!(&stack[8..16], &[0xff, 0xff, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn nan_boxing_sets_the_upper_word() {
        let shape = classifier(Abi::RiscV64).shape();
        let mut regs = vec![0u8; shape.prefix()];
        let one = 1.0f32.to_le_bytes();
        let piece = Piece::widened(0, 4, Location::Vec(0), Extend::NanBox, 8);
        store(&shape, &mut regs, &mut [], &piece, &one).expect("store");
        let off = shape.gpr_bytes();
        assert_eq!(&regs[off..off + 4], &one);
        assert_eq!(&regs[off + 4..off + 8], &[0xff; 4]);
    }

    #[test]
    fn promotion_round_trips_through_fetch() {
        let shape = shape();
        let mut regs = vec![0u8; shape.prefix()];
        let value = 2.5f32.to_le_bytes();
        let piece = Piece::widened(0, 4, Location::Vec(2), Extend::Promote, 8);
        store(&shape, &mut regs, &mut [], &piece, &value).expect("store");
        let off = shape.gpr_bytes() + 16;
        assert_eq!(read_uint(&regs[off..off + 8], false), 2.5f64.to_bits());
        let mut back = [0u8; 4];
        fetch(&shape, &regs, &[], &piece, &mut back).expect("fetch");
        assert_eq!(back, value);
    }

    #[test]
    fn writes_past_the_stack_image_overflow() {
        let shape = shape();
        let mut regs = vec![0u8; shape.prefix()];
        let mut stack = vec![0u8; 16];
        let piece = Piece::raw(0, 8, Location::Stack(12));
        assert!(matches!(
            store(&shape, &mut regs, &mut stack, &piece, &[0u8; 8]),
            Err(AlienError::FrameOverflow { needed: 20, capacity: 16 })
        ));
    }

    #[test]
    fn carved_frames_are_aligned_and_sized() {
        let mut arena = StackArena::new(64 << 10, 256).expect("arena");
        let mut frame = Frame::carve(&mut arena, shape(), 32).expect("frame");
        assert_eq!(frame.base() % 16, 0);
        assert_eq!(frame.len(), 112 + 32);
        assert_eq!(frame.stack_addr(), frame.base() + 112);
        frame
            .place_address(Location::Gpr(0), 0xdead_beef, ArgPosition::Return)
            .expect("address");
        assert_eq!(frame.gpr_word(0), 0xdead_beef);
        assert!(frame.stack().iter().all(|&b| b == 0));
    }

    #[test]
    fn narrow_slots_reject_wide_addresses() {
        assert!(address_image(0x1_0000_0000, 4, ArgPosition::Param(0)).is_err());
        assert!(address_image(0xffff_0000, 4, ArgPosition::Param(0)).is_ok());
    }
}
