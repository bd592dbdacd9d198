//! x86_64 implementation of context switching

use std::arch::asm;
use std::arch::naked_asm;

/// Saved CPU context for context switching
///
/// On x86_64 System V ABI, these are the callee-saved registers
/// that must be preserved across function calls, plus the resume
/// address. The resume address lives in the context rather than on
/// the target stack: switching into a fiber whose physical stack is
/// currently held by another fiber (shared-stack mode) must not read
/// that stack before the saved image has been copied back in.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Stack pointer
    rsp: u64,
    /// Frame pointer
    rbp: u64,
    /// General purpose (callee-saved)
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    /// Resume address (entry point for a fresh context)
    rip: u64,
}

impl Context {
    /// Create a new context for a fiber.
    ///
    /// - `stack_top`: The top of the stack (highest address)
    /// - `entry`: The entry point function address
    ///
    /// The first switch into this context jumps to `entry` with the
    /// stack pointer just below `stack_top`. System V requires RSP to
    /// be 16n+8 at function entry (as if a `call` had pushed a return
    /// address), so the initial RSP is aligned down and offset by 8.
    /// Nothing is written to the stack itself.
    pub fn new(stack_top: usize, entry: usize) -> Self {
        let initial_rsp = (stack_top & !0xF) - 8;

        Context {
            rsp: initial_rsp as u64,
            rip: entry as u64,
            ..Default::default()
        }
    }
}

/// Read the current stack pointer.
///
/// Used by the switch protocol to bound a fiber's live stack range
/// from below immediately before a switch. Always inlined: the value
/// must be the caller's own frame bottom, so that return addresses
/// pushed by later calls in the switch path land below the recorded
/// address, outside the range that copy-in rewrites.
#[inline(always)]
pub fn stack_pointer() -> *mut u8 {
    let sp: usize;
    unsafe {
        asm!(
            "mov {}, rsp",
            out(reg) sp,
            options(nomem, nostack, preserves_flags)
        );
    }
    sp as *mut u8
}

/// Switch from one context to another
///
/// Saves the current CPU state into `old` and restores state from `new`.
/// This function returns when another context switches back to `old`.
///
/// The return address is captured into `old` and the target is entered
/// with `jmp` from the restored `rip`, so no memory on the target stack
/// is read during the switch.
///
/// # Safety
/// Both pointers must be valid. The `new` context must have been properly
/// initialized (either by a previous `context_switch` or by `Context::new`).
#[unsafe(naked)]
pub extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Capture the resume point into old (rdi): the return address
        // currently at [rsp], and rsp as if the call had returned
        "mov rax, [rsp]",
        "mov [rdi + 0x38], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x00], rax",
        // Save callee-saved registers to old context
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Load callee-saved registers from new context (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // Enter the new context at its saved resume address
        // For a fresh fiber: jumps to the entry trampoline
        // For a suspended fiber: continues after its context_switch call
        "mov rax, [rsi + 0x38]",
        "jmp rax",
    );
}
