//! Per-ABI classification: decides once per signature where every byte of
//! every argument and of the return value travels.

mod arm32;
mod arm64;
pub mod classes;
mod riscv64;
mod x64_sysv;
mod x64_win;
mod x86;

use ctype::{
    Abi, Extend, ForwardKind, FunctionLayout, FunctionSignature, Location, PassMode,
    Piece, PrimitiveKind, ReturnLayout, TypeDescriptor,
};
use log::debug;

use crate::{AlienError, AlienResult};

/// Byte layout of the register and stack images for one ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameShape {
    pub gpr_count: u8,
    pub gpr_slot: u32,
    pub vec_count: u8,
    pub vec_slot: u32,
    pub stack_slot: u32,
    /// Home space the caller reserves above the stack arguments.
    pub shadow: u32,
}

impl FrameShape {
    #[must_use]
    pub fn gpr_bytes(&self) -> usize {
        (self.gpr_count as usize * self.gpr_slot as usize).next_multiple_of(16)
    }

    #[must_use]
    pub fn vec_bytes(&self) -> usize {
        (self.vec_count as usize * self.vec_slot as usize).next_multiple_of(16)
    }

    /// Size of the register images that precede the stack image.
    #[must_use]
    pub fn prefix(&self) -> usize {
        self.gpr_bytes() + self.vec_bytes()
    }

    /// Byte offset of `loc` inside a register image, `None` for stack.
    #[must_use]
    pub fn register_offset(&self, loc: Location) -> Option<usize> {
        match loc {
            Location::Gpr(i) => Some(i as usize * self.gpr_slot as usize),
            Location::Vec(i) => Some(self.gpr_bytes() + i as usize * self.vec_slot as usize),
            Location::Stack(_) => None,
        }
    }
}

/// One backend per calling convention family.
pub trait Classifier: Sync {
    fn abi(&self) -> Abi;

    fn shape(&self) -> FrameShape;

    fn classify(&self, sig: &FunctionSignature) -> AlienResult<FunctionLayout>;

    /// Rejects prototypes that cannot be exposed as native callbacks.
    fn check_callback(&self, _sig: &FunctionSignature) -> AlienResult<()> {
        Ok(())
    }

    /// Assembly name of an argument location, for listings.
    fn register_name(&self, loc: Location) -> String;

    /// Assembly name of a result register.
    fn return_register_name(&self, loc: Location) -> String {
        self.register_name(loc)
    }
}

static X64_SYSV: x64_sysv::SysV = x64_sysv::SysV;
static X64_WIN: x64_win::Win64 = x64_win::Win64;
static X86_SYSV: x86::X86 = x86::X86 { windows: false };
static X86_WIN: x86::X86 = x86::X86 { windows: true };
static ARM32: arm32::Arm32 = arm32::Arm32 { vfp: false };
static ARM32_VFP: arm32::Arm32 = arm32::Arm32 { vfp: true };
static ARM64: arm64::Arm64 = arm64::Arm64 {
    flavor: arm64::Flavor::Standard,
};
static ARM64_APPLE: arm64::Arm64 = arm64::Arm64 {
    flavor: arm64::Flavor::Apple,
};
static ARM64_WIN: arm64::Arm64 = arm64::Arm64 {
    flavor: arm64::Flavor::Windows,
};
static ARM64_EC: arm64::Arm64 = arm64::Arm64 {
    flavor: arm64::Flavor::Ec,
};
static RISCV64: riscv64::RiscV64 = riscv64::RiscV64;

#[must_use]
pub fn classifier(abi: Abi) -> &'static dyn Classifier {
    match abi {
        Abi::X64SysV => &X64_SYSV,
        Abi::X64Windows => &X64_WIN,
        Abi::X86SysV => &X86_SYSV,
        Abi::X86Windows => &X86_WIN,
        Abi::Arm32 => &ARM32,
        Abi::Arm32Vfp => &ARM32_VFP,
        Abi::Arm64 => &ARM64,
        Abi::Arm64Apple => &ARM64_APPLE,
        Abi::Arm64Windows => &ARM64_WIN,
        Abi::Arm64Ec => &ARM64_EC,
        Abi::RiscV64 => &RISCV64,
    }
}

fn validate(abi: Abi, sig: &FunctionSignature) -> AlienResult<()> {
    let fail = |message: String| Err(AlienError::classification(&sig.name, abi, message));
    match sig.ret.kind() {
        PrimitiveKind::Prototype | PrimitiveKind::Array => {
            return fail(format!("cannot return {} by value", sig.ret.name()));
        }
        _ => {}
    }
    for (i, param) in sig.params.iter().enumerate() {
        let ty = &param.ty;
        match ty.kind() {
            PrimitiveKind::Void | PrimitiveKind::Prototype | PrimitiveKind::Array => {
                return fail(format!("parameter {} cannot be passed as {}", i + 1, ty.name()));
            }
            _ => {}
        }
        if param.direction.is_output() && ty.pointee().is_none() {
            return fail(format!(
                "output parameter {} needs a typed pointer, not {}",
                i + 1,
                ty.name()
            ));
        }
        if param.variadic && !sig.variadic {
            return fail(format!("parameter {} is variadic in a fixed signature", i + 1));
        }
    }
    if sig.conv != ctype::CallConv::Cdecl && !matches!(abi, Abi::X86SysV | Abi::X86Windows) {
        debug!("{}: {} ignored for {abi}", sig.name, sig.conv);
    }
    Ok(())
}

/// Classifies `sig` for `abi`.
pub fn classify(abi: Abi, sig: &FunctionSignature) -> AlienResult<FunctionLayout> {
    validate(abi, sig)?;
    let layout = classifier(abi).classify(sig)?;
    debug!(
        "classified {} for {abi}: {} params, {} stack bytes, {:?}",
        sig.name,
        layout.params.len(),
        layout.args_size,
        layout.forward
    );
    Ok(layout)
}

/// Classifies a callback prototype; stricter than `classify` on x86.
pub fn classify_callback(abi: Abi, sig: &FunctionSignature) -> AlienResult<FunctionLayout> {
    classifier(abi).check_callback(sig)?;
    classify(abi, sig)
}

/// Extension applied when a scalar is widened to a register or slot.
pub(crate) fn scalar_extend(ty: &TypeDescriptor) -> Extend {
    let kind = ty.kind();
    if kind.is_integer() {
        if kind.is_signed() {
            Extend::Sign
        } else {
            Extend::Zero
        }
    } else if kind == PrimitiveKind::Bool {
        Extend::Zero
    } else {
        Extend::None
    }
}

/// Splits `size` bytes starting at `src` into consecutive register pieces.
pub(crate) fn register_run(
    src: u32,
    size: u32,
    slot: u32,
    first: u8,
    bank: fn(u8) -> Location,
) -> Vec<Piece> {
    (0..size.div_ceil(slot))
        .map(|i| {
            let off = i * slot;
            let len = slot.min(size - off);
            Piece::widened(src + off, len, bank(first + i as u8), Extend::None, slot)
        })
        .collect()
}

/// Places an argument image of `size` bytes on the stack at `offset`.
pub(crate) fn stack_piece(size: u32, offset: u32, slot: u32, extend: Extend) -> Piece {
    Piece::widened(0, size, Location::Stack(offset), extend, size.next_multiple_of(slot))
}

/// Picks the forward primitive from the return placement.
pub(crate) fn forward_kind(ret: &ReturnLayout) -> ForwardKind {
    match ret.mode {
        PassMode::Ignore => return ForwardKind::Void,
        PassMode::Indirect => return ForwardKind::Memory,
        PassMode::Direct => {}
    }
    if ret.pieces.iter().any(|p| p.extend == Extend::X87) {
        return ForwardKind::X87;
    }
    let banks: Vec<bool> = ret
        .pieces
        .iter()
        .map(|p| matches!(p.dest, Location::Vec(_)))
        .collect();
    match banks.as_slice() {
        [] => ForwardKind::Void,
        [false] => ForwardKind::Gpr,
        [false, false] => ForwardKind::GprPair,
        [true] if ret.pieces[0].len <= 4 => ForwardKind::Float32,
        [true] => ForwardKind::Float64,
        [true, true] => ForwardKind::VecPair,
        [false, true] => ForwardKind::GprVec,
        [true, false] => ForwardKind::VecGpr,
        _ if banks.iter().all(|&v| v) => ForwardKind::VecQuad,
        _ => ForwardKind::GprPair,
    }
}

/// Fills the fields every backend derives the same way.
pub(crate) fn finish(
    abi: Abi,
    params: Vec<ctype::ParamLayout>,
    ret: ReturnLayout,
    stack_bytes: u32,
) -> FunctionLayout {
    let vec_used = params.iter().map(|p| p.vec_count).sum();
    FunctionLayout {
        abi,
        forward_fp: params.iter().any(|p| p.vec_count > 0),
        forward: forward_kind(&ret),
        params,
        ret,
        args_size: stack_bytes.next_multiple_of(16),
        vec_used,
        callee_pops: 0,
        decorated_name: None,
        fixups: Vec::new(),
    }
}
