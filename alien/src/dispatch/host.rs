//! Forward primitives for the hosts this crate can call natively:
//! x86-64 System V, x86-64 Windows and AArch64 (Linux, macOS).
//!
//! Every primitive receives one [`Forward`] block. It loads the argument
//! registers from the frame's register images before it switches the
//! stack pointer, so nothing below the new stack pointer is read. The
//! primitives differ only in which result registers they store back,
//! chosen from the layout's [`ForwardKind`].

use ctype::{Abi, ForwardKind, FunctionLayout};

use super::{ForwardCall, RawResult};
use crate::frame::Frame;

#[repr(C)]
struct Forward {
    func: usize,
    base: usize,
    stack: usize,
    out: *mut RawResult,
    vec_used: u64,
    stack_base: usize,
    stack_limit: usize,
}

type Primitive = unsafe extern "C" fn(*const Forward);

/// Result registers a primitive stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capture {
    Nothing,
    Gpr,
    GprPair,
    Vec,
    VecPair,
    /// One integer and one vector register, in either order.
    Mixed,
    All,
}

fn capture(kind: ForwardKind) -> Capture {
    match kind {
        ForwardKind::Void => Capture::Nothing,
        // the hidden pointer comes back in the first integer register
        ForwardKind::Gpr | ForwardKind::Memory => Capture::Gpr,
        ForwardKind::GprPair => Capture::GprPair,
        ForwardKind::Float32 | ForwardKind::Float64 => Capture::Vec,
        ForwardKind::VecPair => Capture::VecPair,
        ForwardKind::GprVec | ForwardKind::VecGpr => Capture::Mixed,
        ForwardKind::VecQuad | ForwardKind::X87 => Capture::All,
    }
}

/// Whether this build can call functions of `abi` directly.
#[must_use]
pub fn supports(abi: Abi) -> bool {
    if cfg!(all(target_arch = "x86_64", windows)) {
        abi == Abi::X64Windows
    } else if cfg!(target_arch = "x86_64") {
        abi == Abi::X64SysV
    } else if cfg!(all(target_arch = "aarch64", target_vendor = "apple")) {
        abi == Abi::Arm64Apple
    } else if cfg!(all(target_arch = "aarch64", not(windows))) {
        abi == Abi::Arm64
    } else {
        false
    }
}

/// Calls through the host primitive matching `layout.forward`. Only
/// constructed when [`supports`] holds for the configured ABI.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostForwardCall;

impl ForwardCall for HostForwardCall {
    unsafe fn forward(&self, func: usize, layout: &FunctionLayout, frame: &Frame) -> RawResult {
        let mut out = RawResult::default();
        let (stack_base, stack_limit) = frame.stack_bounds();
        let block = Forward {
            func,
            base: frame.base(),
            stack: frame.stack_addr(),
            out: &raw mut out,
            vec_used: u64::from(layout.vec_used),
            stack_base,
            stack_limit,
        };
        let primitive = native::primitive(capture(layout.forward));
        // SAFETY: forwarded from the caller; the block outlives the call
        unsafe { primitive(&block) };
        out
    }
}

#[cfg(all(target_arch = "x86_64", not(windows)))]
mod native {
    use super::{Capture, Forward, Primitive};

    macro_rules! primitive {
        ($name:ident $(, $store:literal)*) => {
            #[unsafe(naked)]
            unsafe extern "C" fn $name(_block: *const Forward) {
                core::arch::naked_asm!(
                    "push rbp",
                    "mov rbp, rsp",
                    "push rbx",
                    "sub rsp, 8",
                    "mov rbx, rdi",
                    "mov r10, [rbx + 8]",
                    "movsd xmm0, [r10 + 48]",
                    "movsd xmm1, [r10 + 56]",
                    "movsd xmm2, [r10 + 64]",
                    "movsd xmm3, [r10 + 72]",
                    "movsd xmm4, [r10 + 80]",
                    "movsd xmm5, [r10 + 88]",
                    "movsd xmm6, [r10 + 96]",
                    "movsd xmm7, [r10 + 104]",
                    "mov rdi, [r10]",
                    "mov rsi, [r10 + 8]",
                    "mov rdx, [r10 + 16]",
                    "mov rcx, [r10 + 24]",
                    "mov r8, [r10 + 32]",
                    "mov r9, [r10 + 40]",
                    "mov rax, [rbx + 32]",
                    "mov r11, [rbx]",
                    "mov rsp, [rbx + 16]",
                    "call r11",
                    "mov r10, [rbx + 24]",
                    $($store,)*
                    "lea rsp, [rbp - 8]",
                    "pop rbx",
                    "pop rbp",
                    "ret",
                );
            }
        };
    }

    primitive!(forward_void);
    primitive!(forward_gpr, "mov [r10], rax");
    primitive!(forward_gpr_pair, "mov [r10], rax", "mov [r10 + 8], rdx");
    primitive!(forward_vec, "movsd [r10 + 16], xmm0");
    primitive!(forward_vec_pair, "movsd [r10 + 16], xmm0", "movsd [r10 + 24], xmm1");
    primitive!(forward_mixed, "mov [r10], rax", "movsd [r10 + 16], xmm0");
    primitive!(
        forward_all,
        "mov [r10], rax",
        "mov [r10 + 8], rdx",
        "movsd [r10 + 16], xmm0",
        "movsd [r10 + 24], xmm1"
    );

    pub(super) fn primitive(capture: Capture) -> Primitive {
        match capture {
            Capture::Nothing => forward_void,
            Capture::Gpr => forward_gpr,
            Capture::GprPair => forward_gpr_pair,
            Capture::Vec => forward_vec,
            Capture::VecPair => forward_vec_pair,
            Capture::Mixed => forward_mixed,
            Capture::All => forward_all,
        }
    }
}

// The TEB stack bounds are moved to the arena for the duration of the call
// and put back before returning. An unwind through the forward frame skips
// the restore and leaves them pointing at the pool stack.
#[cfg(all(target_arch = "x86_64", windows))]
mod native {
    use super::{Capture, Forward, Primitive};

    macro_rules! primitive {
        ($name:ident $(, $store:literal)*) => {
            #[unsafe(naked)]
            unsafe extern "C" fn $name(_block: *const Forward) {
                core::arch::naked_asm!(
                    "push rbp",
                    "mov rbp, rsp",
                    "push rbx",
                    "push rsi",
                    "push rdi",
                    "push r12",
                    "mov rbx, rcx",
                    "mov rsi, qword ptr gs:[0x08]",
                    "mov rdi, qword ptr gs:[0x10]",
                    "mov rax, [rbx + 40]",
                    "mov qword ptr gs:[0x08], rax",
                    "mov rax, [rbx + 48]",
                    "mov qword ptr gs:[0x10], rax",
                    "mov r10, [rbx + 8]",
                    "movsd xmm0, [r10 + 32]",
                    "movsd xmm1, [r10 + 40]",
                    "movsd xmm2, [r10 + 48]",
                    "movsd xmm3, [r10 + 56]",
                    "mov rcx, [r10]",
                    "mov rdx, [r10 + 8]",
                    "mov r8, [r10 + 16]",
                    "mov r9, [r10 + 24]",
                    "mov r11, [rbx]",
                    "mov rsp, [rbx + 16]",
                    "call r11",
                    "mov r10, [rbx + 24]",
                    $($store,)*
                    "mov qword ptr gs:[0x08], rsi",
                    "mov qword ptr gs:[0x10], rdi",
                    "lea rsp, [rbp - 32]",
                    "pop r12",
                    "pop rdi",
                    "pop rsi",
                    "pop rbx",
                    "pop rbp",
                    "ret",
                );
            }
        };
    }

    primitive!(forward_void);
    primitive!(forward_gpr, "mov [r10], rax");
    primitive!(forward_vec, "movsd [r10 + 16], xmm0");
    primitive!(forward_all, "mov [r10], rax", "movsd [r10 + 16], xmm0");

    // Win64 returns at most one register.
    pub(super) fn primitive(capture: Capture) -> Primitive {
        match capture {
            Capture::Nothing => forward_void,
            Capture::Gpr => forward_gpr,
            Capture::Vec => forward_vec,
            Capture::GprPair | Capture::VecPair | Capture::Mixed | Capture::All => forward_all,
        }
    }
}

#[cfg(all(target_arch = "aarch64", not(windows)))]
mod native {
    use super::{Capture, Forward, Primitive};

    macro_rules! primitive {
        ($name:ident $(, $store:literal)*) => {
            #[unsafe(naked)]
            unsafe extern "C" fn $name(_block: *const Forward) {
                core::arch::naked_asm!(
                    "stp x29, x30, [sp, #-32]!",
                    "mov x29, sp",
                    "str x19, [sp, #16]",
                    "mov x19, x0",
                    "ldr x9, [x19, #8]",
                    "ldp d0, d1, [x9, #80]",
                    "ldp d2, d3, [x9, #96]",
                    "ldp d4, d5, [x9, #112]",
                    "ldp d6, d7, [x9, #128]",
                    "ldp x0, x1, [x9]",
                    "ldp x2, x3, [x9, #16]",
                    "ldp x4, x5, [x9, #32]",
                    "ldp x6, x7, [x9, #48]",
                    "ldr x8, [x9, #64]",
                    "ldr x16, [x19]",
                    "ldr x10, [x19, #16]",
                    "mov sp, x10",
                    "blr x16",
                    "ldr x9, [x19, #24]",
                    $($store,)*
                    "mov sp, x29",
                    "ldr x19, [sp, #16]",
                    "ldp x29, x30, [sp], #32",
                    "ret",
                );
            }
        };
    }

    primitive!(forward_void);
    primitive!(forward_gpr, "str x0, [x9]");
    primitive!(forward_gpr_pair, "stp x0, x1, [x9]");
    primitive!(forward_vec, "str d0, [x9, #16]");
    primitive!(forward_vec_pair, "stp d0, d1, [x9, #16]");
    primitive!(
        forward_all,
        "stp x0, x1, [x9]",
        "stp d0, d1, [x9, #16]",
        "stp d2, d3, [x9, #32]"
    );

    pub(super) fn primitive(capture: Capture) -> Primitive {
        match capture {
            Capture::Nothing => forward_void,
            Capture::Gpr => forward_gpr,
            Capture::GprPair => forward_gpr_pair,
            Capture::Vec => forward_vec,
            Capture::VecPair => forward_vec_pair,
            Capture::Mixed | Capture::All => forward_all,
        }
    }
}

#[cfg(not(any(
    target_arch = "x86_64",
    all(target_arch = "aarch64", not(windows))
)))]
mod native {
    use super::{Capture, Forward, Primitive};

    // `supports` is false on every other host; the result stays zeroed
    unsafe extern "C" fn forward_none(_block: *const Forward) {}

    pub(super) fn primitive(_capture: Capture) -> Primitive {
        forward_none
    }
}
