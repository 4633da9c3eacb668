//! Saved execution context and the architecture specific switch

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    ".pushsection .text.xen_sched_switch_context, \"ax\"",
    ".global xen_sched_switch_context",
    ".p2align 4",
    // rdi: *mut Context of the thread being left, rsi: *const Context to resume
    "xen_sched_switch_context:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "lea rax, [rip + .Lswitch_resume]",
    "mov [rdi + 8], rax",
    "mov rsp, [rsi]",
    "jmp qword ptr [rsi + 8]",
    ".Lswitch_resume:",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".global xen_sched_thread_trampoline",
    ".p2align 4",
    "xen_sched_thread_trampoline:",
    "pop rdi",
    "pop rax",
    "call rax",
    "ud2",
    ".popsection",
);

#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    ".pushsection .text.xen_sched_switch_context, \"ax\"",
    ".global xen_sched_switch_context",
    ".p2align 4",
    // x0: *mut Context of the thread being left, x1: *const Context to resume
    "xen_sched_switch_context:",
    "sub sp, sp, #160",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x9, sp",
    "str x9, [x0]",
    "adr x9, .Lswitch_resume",
    "str x9, [x0, #8]",
    "ldr x9, [x1]",
    "mov sp, x9",
    "ldr x9, [x1, #8]",
    "br x9",
    ".Lswitch_resume:",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8, d9, [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #160",
    "ret",
    "",
    ".global xen_sched_thread_trampoline",
    ".p2align 4",
    "xen_sched_thread_trampoline:",
    "ldp x0, x9, [sp], #16",
    "blr x9",
    "brk #0",
    ".popsection",
);

extern "C" {
    fn xen_sched_switch_context(prev: *mut Context, next: *const Context);
    fn xen_sched_thread_trampoline();
}

/// Entry point of a new thread, receives the argument stored with it
pub type Entry = extern "C" fn(*mut u8) -> !;

/// Stack and instruction pointer of a thread that is not running
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    /// Saved stack pointer
    pub sp: usize,
    /// Address execution resumes at
    pub ip: usize,
}

impl Context {
    /// Context that starts `entry(arg)` on the stack ending at `stack_top`
    ///
    /// The argument and entry are stored in the top two words of the stack, where the trampoline
    /// pops them from, so the first switch into the thread takes the same path as every later one.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the 16 byte aligned end of a writable stack
    pub unsafe fn new(stack_top: *mut u8, entry: Entry, arg: *mut u8) -> Self {
        let top = stack_top as *mut usize;

        top.sub(2).write(arg as usize);
        top.sub(1).write(entry as usize);

        Self {
            sp: top.sub(2) as usize,
            ip: xen_sched_thread_trampoline as usize,
        }
    }

    /// Saves the running context into `prev` and resumes `next`
    ///
    /// Returns once another switch resumes `prev`.
    ///
    /// # Safety
    ///
    /// `next` must hold a context saved by `switch` or created by `new` whose stack is still
    /// allocated, and both must stay valid until `prev` is resumed
    pub unsafe fn switch(prev: *mut Context, next: *const Context) {
        xen_sched_switch_context(prev, next)
    }
}
