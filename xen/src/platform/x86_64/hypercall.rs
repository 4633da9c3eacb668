//! x86_64 hypercall functions
//!
//! Arguments are passed in `rdi`, `rsi`, `rdx`, `r10` and `r8`, the result is
//! returned in `rax`. Unused argument registers are zeroed.

use {
    core::{arch::asm, ptr::addr_of},
    cty::c_long,
};

#[repr(C)]
struct HypercallEntry([u8; 32]);

extern "C" {
    static hypercall_page: [HypercallEntry; 128];
}

/// Makes hypercall with 5 arguments
///
/// # Safety
///
/// `offset` must be a valid offset into `hypercall_page` and the arguments
/// must be valid for the hypercall it selects
pub unsafe fn hypercall5(
    offset: u32,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
) -> c_long {
    let entry = addr_of!(hypercall_page)
        .cast::<HypercallEntry>()
        .add(offset as usize);
    let res: c_long;

    asm!(
        "call {}",
        in(reg) entry,
        inlateout("rdi") arg0 => _,
        inlateout("rsi") arg1 => _,
        inlateout("rdx") arg2 => _,
        inlateout("r10") arg3 => _,
        inlateout("r8") arg4 => _,
        lateout("rax") res,
        clobber_abi("C"),
    );

    res
}

/// Makes hypercall with 0 arguments
///
/// # Safety
///
/// See [`hypercall5`]
pub unsafe fn hypercall0(offset: u32) -> c_long {
    hypercall5(offset, 0, 0, 0, 0, 0)
}

/// Makes hypercall with 1 argument
///
/// # Safety
///
/// See [`hypercall5`]
pub unsafe fn hypercall1(offset: u32, arg0: u64) -> c_long {
    hypercall5(offset, arg0, 0, 0, 0, 0)
}

/// Makes hypercall with 2 arguments
///
/// # Safety
///
/// See [`hypercall5`]
pub unsafe fn hypercall2(offset: u32, arg0: u64, arg1: u64) -> c_long {
    hypercall5(offset, arg0, arg1, 0, 0, 0)
}

/// Makes hypercall with 3 arguments
///
/// # Safety
///
/// See [`hypercall5`]
pub unsafe fn hypercall3(offset: u32, arg0: u64, arg1: u64, arg2: u64) -> c_long {
    hypercall5(offset, arg0, arg1, arg2, 0, 0)
}

/// Makes hypercall with 4 arguments
///
/// # Safety
///
/// See [`hypercall5`]
pub unsafe fn hypercall4(offset: u32, arg0: u64, arg1: u64, arg2: u64, arg3: u64) -> c_long {
    hypercall5(offset, arg0, arg1, arg2, arg3, 0)
}
