//! Native entry points for trampoline slots.
//!
//! One naked function holds `MAX_TRAMPOLINES` fixed-size stubs followed by
//! a shared entry. A stub records its own address and jumps to the shared
//! entry, which derives the slot index from it, saves the argument
//! registers in the frame-image layout of the host ABI and calls
//! [`relay_entry`](crate::relay::relay_entry). The result registers are
//! loaded back from the returned [`RawResult`](crate::dispatch::RawResult).
//!
//! Hosts without a thunk table get synthetic addresses, so slots can still
//! be reserved and relayed by hand.

use crate::config::MAX_TRAMPOLINES;

#[cfg(all(target_arch = "aarch64", not(windows)))]
const STRIDE: usize = 8;
#[cfg(not(all(target_arch = "aarch64", not(windows))))]
const STRIDE: usize = 16;

/// Base of the fake address range handed out on hosts without thunks.
#[cfg(not(any(target_arch = "x86_64", all(target_arch = "aarch64", not(windows)))))]
const SYNTHETIC_BASE: usize = 0x7ff0_0000;

// Calling the table itself returns the address of the first stub.
#[cfg(all(target_arch = "x86_64", not(windows)))]
#[unsafe(naked)]
unsafe extern "C" fn thunk_table() -> usize {
    core::arch::naked_asm!(
        "lea rax, [rip + 2f]",
        "ret",
        ".balign 16, 0xcc",
        "2:",
        ".rept {count}",
        "lea r10, [rip]",
        "jmp 3f",
        ".balign 16, 0xcc",
        ".endr",
        "3:",
        "push rbp",
        "mov rbp, rsp",
        "sub rsp, 160",
        "mov [rsp], rdi",
        "mov [rsp + 8], rsi",
        "mov [rsp + 16], rdx",
        "mov [rsp + 24], rcx",
        "mov [rsp + 32], r8",
        "mov [rsp + 40], r9",
        "movsd [rsp + 48], xmm0",
        "movsd [rsp + 56], xmm1",
        "movsd [rsp + 64], xmm2",
        "movsd [rsp + 72], xmm3",
        "movsd [rsp + 80], xmm4",
        "movsd [rsp + 88], xmm5",
        "movsd [rsp + 96], xmm6",
        "movsd [rsp + 104], xmm7",
        "lea r11, [rip + 2b]",
        "mov rdi, r10",
        "sub rdi, r11",
        "shr rdi, 4",
        "mov rsi, rsp",
        "lea rdx, [rbp + 16]",
        "lea rcx, [rsp + 112]",
        "call {relay}",
        "mov rax, [rsp + 112]",
        "mov rdx, [rsp + 120]",
        "movsd xmm0, [rsp + 128]",
        "movsd xmm1, [rsp + 136]",
        "mov rsp, rbp",
        "pop rbp",
        "ret",
        count = const MAX_TRAMPOLINES,
        relay = sym crate::relay::relay_entry,
    );
}

// 32 bytes of home space sit below the saved register image.
#[cfg(all(target_arch = "x86_64", windows))]
#[unsafe(naked)]
unsafe extern "C" fn thunk_table() -> usize {
    core::arch::naked_asm!(
        "lea rax, [rip + 2f]",
        "ret",
        ".balign 16, 0xcc",
        "2:",
        ".rept {count}",
        "lea r10, [rip]",
        "jmp 3f",
        ".balign 16, 0xcc",
        ".endr",
        "3:",
        "push rbp",
        "mov rbp, rsp",
        "sub rsp, 144",
        "mov [rsp + 32], rcx",
        "mov [rsp + 40], rdx",
        "mov [rsp + 48], r8",
        "mov [rsp + 56], r9",
        "movsd [rsp + 64], xmm0",
        "movsd [rsp + 72], xmm1",
        "movsd [rsp + 80], xmm2",
        "movsd [rsp + 88], xmm3",
        "lea r11, [rip + 2b]",
        "mov rcx, r10",
        "sub rcx, r11",
        "shr rcx, 4",
        "lea rdx, [rsp + 32]",
        "lea r8, [rbp + 16]",
        "lea r9, [rsp + 96]",
        "call {relay}",
        "mov rax, [rsp + 96]",
        "movsd xmm0, [rsp + 112]",
        "mov rsp, rbp",
        "pop rbp",
        "ret",
        count = const MAX_TRAMPOLINES,
        relay = sym crate::relay::relay_entry,
    );
}

#[cfg(all(target_arch = "aarch64", not(windows)))]
#[unsafe(naked)]
unsafe extern "C" fn thunk_table() -> usize {
    core::arch::naked_asm!(
        "adr x0, 2f",
        "ret",
        "2:",
        ".rept {count}",
        "adr x9, .",
        "b 3f",
        ".endr",
        "3:",
        "stp x29, x30, [sp, #-16]!",
        "mov x29, sp",
        "sub sp, sp, #192",
        "stp x0, x1, [sp]",
        "stp x2, x3, [sp, #16]",
        "stp x4, x5, [sp, #32]",
        "stp x6, x7, [sp, #48]",
        "str x8, [sp, #64]",
        "stp d0, d1, [sp, #80]",
        "stp d2, d3, [sp, #96]",
        "stp d4, d5, [sp, #112]",
        "stp d6, d7, [sp, #128]",
        "adr x10, 2b",
        "sub x0, x9, x10",
        "lsr x0, x0, #3",
        "mov x1, sp",
        "add x2, x29, #16",
        "add x3, sp, #144",
        "bl {relay}",
        "ldp x0, x1, [sp, #144]",
        "ldp d0, d1, [sp, #160]",
        "ldp d2, d3, [sp, #176]",
        "mov sp, x29",
        "ldp x29, x30, [sp], #16",
        "ret",
        count = const MAX_TRAMPOLINES,
        relay = sym crate::relay::relay_entry,
    );
}

/// Whether slot addresses are real, callable code.
#[must_use]
pub fn native() -> bool {
    cfg!(any(
        target_arch = "x86_64",
        all(target_arch = "aarch64", not(windows))
    ))
}

#[cfg(any(target_arch = "x86_64", all(target_arch = "aarch64", not(windows))))]
fn table_base() -> usize {
    // SAFETY: the prologue only computes an address
    unsafe { thunk_table() }
}

#[cfg(not(any(target_arch = "x86_64", all(target_arch = "aarch64", not(windows)))))]
fn table_base() -> usize {
    SYNTHETIC_BASE
}

/// Native address of slot `index`.
#[must_use]
pub fn address(index: usize) -> Option<usize> {
    (index < MAX_TRAMPOLINES).then(|| table_base() + index * STRIDE)
}

/// Slot index of a thunk address.
#[must_use]
pub fn index_of(addr: usize) -> Option<usize> {
    let offset = addr.checked_sub(table_base())?;
    (offset % STRIDE == 0 && offset / STRIDE < MAX_TRAMPOLINES).then_some(offset / STRIDE)
}
