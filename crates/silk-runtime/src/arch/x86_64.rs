//! x86_64 context switch
//!
//! Voluntary switches happen at well-defined call sites, so only the System V
//! callee-saved set plus stack and instruction pointers need to move.

use std::arch::naked_asm;

/// Saved register block for a suspended fiber
///
/// Offsets are load-bearing: the assembly below addresses fields by constant
/// displacement.
#[repr(C)]
#[derive(Default)]
pub struct Context {
    pub sp: u64,  // 0x00
    pub pc: u64,  // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

/// Initialize a fresh fiber context
///
/// When first switched to, execution starts in the trampoline with `entry`
/// in r12. The stack pointer is 16-byte aligned; the `call` inside the
/// trampoline then produces the entry alignment the ABI promises callees.
///
/// # Safety
///
/// `stack_top` must be the highest address of a mapped stack with enough
/// room below it for `entry` to run.
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: usize) {
    *ctx = Context::default();
    ctx.sp = (stack_top as u64) & !0xF;
    ctx.pc = fiber_trampoline as usize as u64;
    ctx.r12 = entry as u64;
}

/// First-switch landing pad: calls the entry function held in r12
///
/// The entry function terminates the fiber by switching away; control never
/// falls past the call.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "call r12", //
        "ud2",
    );
}

/// Swap execution contexts
///
/// Saves the callee-saved registers, stack pointer and continuation address
/// into `save`, then loads the same set from `load` and jumps. Returns when
/// some later switch loads `save` again.
///
/// # Safety
///
/// `load` must hold a context produced by `init_context` or a prior save,
/// whose stack is still mapped. Both contexts must belong to the calling
/// thread's fiber graph; switches are intra-thread only.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save into `save` (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from `load` (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Continuation for the saved context
        "2:",
        "ret",
    );
}
