use std::fmt;

use crate::Abi;

/// Destination of a piece of an argument, or source of a piece of a result.
///
/// Register indices are positions in the ABI's register image; `Vec` slots
/// are 4 bytes wide on ARM32 (s-registers) and 8 bytes everywhere else.
/// `Stack` is a byte offset from the first stack argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Gpr(u8),
    Vec(u8),
    Stack(u32),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Gpr(i) => write!(f, "gpr{i}"),
            Location::Vec(i) => write!(f, "vec{i}"),
            Location::Stack(off) => write!(f, "stack+{off}"),
        }
    }
}

/// How the `len` source bytes of a piece fill its `width` byte slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Extend {
    /// Raw copy, remaining bytes zeroed.
    #[default]
    None,
    Sign,
    Zero,
    /// f32 in a 64-bit FP register with the upper half all ones.
    NanBox,
    /// f32 widened to f64 (variadic promotion).
    Promote,
    /// Result comes back on the x87 stack as an f64.
    X87,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Piece {
    /// Byte offset inside the value's memory image.
    pub src: u32,
    pub len: u32,
    pub dest: Location,
    pub extend: Extend,
    /// Bytes written at `dest`; at least `len`.
    pub width: u32,
}

impl Piece {
    #[must_use]
    pub fn raw(src: u32, len: u32, dest: Location) -> Piece {
        Piece {
            src,
            len,
            dest,
            extend: Extend::None,
            width: len,
        }
    }

    #[must_use]
    pub fn widened(src: u32, len: u32, dest: Location, extend: Extend, width: u32) -> Piece {
        Piece {
            src,
            len,
            dest,
            extend,
            width: width.max(len),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PassMode {
    /// Nothing is transferred (void, empty aggregates).
    Ignore,
    /// The value bytes themselves are placed by the pieces.
    #[default]
    Direct,
    /// A copy lives in scratch memory and its address is placed by the
    /// pieces.
    Indirect,
}

/// Placement of one parameter, computed once per signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParamLayout {
    pub mode: PassMode,
    pub pieces: Vec<Piece>,
    pub gpr_count: u8,
    pub vec_count: u8,
    /// Passed through memory: by hidden pointer or entirely on the stack.
    pub use_memory: bool,
    /// For two-register aggregates, whether the general bank comes first.
    pub gpr_first: bool,
    /// Natural size of each eightbyte (x86-64 SysV, RISC-V).
    pub sizes: [u8; 2],
    pub stack_bytes: u32,
}

impl ParamLayout {
    #[must_use]
    pub fn ignored() -> ParamLayout {
        ParamLayout {
            mode: PassMode::Ignore,
            ..ParamLayout::default()
        }
    }

    #[must_use]
    pub fn on_stack(&self) -> bool {
        self.pieces
            .iter()
            .any(|p| matches!(p.dest, Location::Stack(_)))
    }
}

/// Placement of the return value. Pieces read from result registers;
/// `hidden` is where the caller passes the result buffer address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReturnLayout {
    pub mode: PassMode,
    pub hidden: Option<Location>,
    pub pieces: Vec<Piece>,
}

/// Shapes of the forward primitive, chosen from the return layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardKind {
    Void,
    Gpr,
    GprPair,
    Float32,
    Float64,
    VecPair,
    GprVec,
    VecGpr,
    /// Up to four consecutive vector registers (HFA returns).
    VecQuad,
    X87,
    /// Result written through the hidden pointer.
    Memory,
}

/// Extra register writes that depend on the finished frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fixup {
    /// Address of the first stack argument goes into this register.
    StackAddress(u8),
    /// Byte size of the stack arguments goes into this register.
    StackSize(u8),
}

/// Result of classifying a signature for one ABI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionLayout {
    pub abi: Abi,
    pub params: Vec<ParamLayout>,
    pub ret: ReturnLayout,
    pub forward: ForwardKind,
    /// Any parameter travels in a vector register.
    pub forward_fp: bool,
    /// Outgoing stack image size, shadow space included, 16-byte aligned.
    pub args_size: u32,
    pub vec_used: u8,
    /// Bytes the callee pops on return (x86 stdcall family).
    pub callee_pops: u32,
    pub decorated_name: Option<String>,
    pub fixups: Vec<Fixup>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widened_piece_never_shrinks() {
        let p = Piece::widened(0, 8, Location::Gpr(0), Extend::Sign, 4);
        assert_eq!(p.width, 8);
        let q = Piece::widened(0, 2, Location::Stack(16), Extend::Zero, 8);
        assert_eq!(q.width, 8);
        assert_eq!(q.dest.to_string(), "stack+16");
    }

    #[test]
    fn stack_detection_looks_at_every_piece() {
        let split = ParamLayout {
            pieces: vec![
                Piece::raw(0, 4, Location::Gpr(3)),
                Piece::raw(4, 4, Location::Stack(0)),
            ],
            ..ParamLayout::default()
        };
        assert!(split.on_stack());
        assert!(!ParamLayout::ignored().on_stack());
    }
}
