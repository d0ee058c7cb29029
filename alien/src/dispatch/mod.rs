//! The forward-call primitive: switch to a prepared frame, call, and hand
//! back the raw result registers.

use ctype::{FunctionLayout, Location};

use crate::frame::Frame;

pub mod host;

pub use host::HostForwardCall;

/// Result registers as the forward primitive leaves them: the first two
/// integer result registers, then up to 32 bytes of vector results laid
/// out with the ABI's vector slot stride.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawResult {
    pub gpr: [u64; 2],
    pub vec: [u64; 4],
}

const GPR_BYTES: usize = 16;
pub(crate) const RAW_BYTES: usize = GPR_BYTES + 32;

impl RawResult {
    fn offset(loc: Location, vec_slot: u32) -> Option<usize> {
        match loc {
            Location::Gpr(i) if i < 2 => Some(8 * i as usize),
            Location::Vec(i) => Some(GPR_BYTES + i as usize * vec_slot as usize),
            _ => None,
        }
    }

    pub(crate) fn to_bytes(self) -> [u8; RAW_BYTES] {
        let mut bytes = [0u8; RAW_BYTES];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(self.gpr.iter().chain(&self.vec)) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8; RAW_BYTES]) -> RawResult {
        let mut words = bytes.chunks_exact(8).map(|c| {
            let mut w = [0u8; 8];
            w.copy_from_slice(c);
            u64::from_le_bytes(w)
        });
        let mut raw = RawResult::default();
        for slot in raw.gpr.iter_mut().chain(raw.vec.iter_mut()) {
            *slot = words.next().unwrap_or(0);
        }
        raw
    }

    /// Copies `dst.len()` bytes out of result register `loc`. Returns
    /// false when `loc` is not a result register.
    pub fn read(&self, loc: Location, vec_slot: u32, dst: &mut [u8]) -> bool {
        let bytes = self.to_bytes();
        match Self::offset(loc, vec_slot) {
            Some(off) if off + dst.len() <= RAW_BYTES => {
                dst.copy_from_slice(&bytes[off..off + dst.len()]);
                true
            }
            _ => false,
        }
    }

    /// Copies `src` into result register `loc`.
    pub fn write(&mut self, loc: Location, vec_slot: u32, src: &[u8]) -> bool {
        let mut bytes = self.to_bytes();
        match Self::offset(loc, vec_slot) {
            Some(off) if off + src.len() <= RAW_BYTES => {
                bytes[off..off + src.len()].copy_from_slice(src);
                *self = RawResult::from_bytes(&bytes);
                true
            }
            _ => false,
        }
    }
}

/// Performs one native call on a prepared frame.
///
/// An implementation loads the register images, switches the stack pointer
/// to `frame.stack_addr()`, calls `func`, and stores the result registers
/// `layout.forward` names. It must not touch any managed state.
/// [`HostForwardCall`] picks one primitive per `ForwardKind`.
pub trait ForwardCall: Send + Sync {
    /// # Safety
    /// `func` must be a native function whose signature matches `layout`,
    /// and `frame` must have been built from `layout`.
    unsafe fn forward(&self, func: usize, layout: &FunctionLayout, frame: &Frame) -> RawResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_registers_use_the_vector_stride() {
        let mut raw = RawResult::default();
        assert!(raw.write(Location::Vec(3), 4, &1.5f32.to_le_bytes()));
        assert_eq!(raw.vec[1] >> 32, u64::from(1.5f32.to_bits()));
        let mut back = [0u8; 4];
        assert!(raw.read(Location::Vec(3), 4, &mut back));
        assert_eq!(f32::from_le_bytes(back), 1.5);

        assert!(raw.write(Location::Gpr(1), 8, &7u64.to_le_bytes()));
        assert_eq!(raw.gpr, [0, 7]);
        assert!(!raw.write(Location::Gpr(2), 8, &[0]));
        assert!(!raw.read(Location::Stack(0), 8, &mut back));
    }
}
