//! Memory utility functions and types
//!
//! Consists of wrapper types representing different kinds of memory locations. The following diagram describes the conversions between them:
//!
//! ```text
//! ┌──────────────────┐           ┌───────────────┐
//! │MachineFrameNumber│◀─────────▶│PageFrameNumber│
//! └──────────────────┘           └───────────────┘
//!      ▲                                 ▲
//!      │                                 │
//!      │                         ┌──────────────┐       ┌──────────────┐
//!      └────────────────────────▶│VirtualAddress│◀─────▶│MachineAddress│
//!                                └──────────────┘       └──────────────┘
//!                                        ▲
//!                                        ▼
//!                                ┌───────────────┐
//!                                │PhysicalAddress│
//!                                └───────────────┘
//! ```
//!
//! Translations go through the hypervisor's machine-to-physical table and the
//! guest's MFN list, so they are only available in the kernel itself.

use {
    crate::platform::consts::PAGE_SIZE,
    alloc::alloc::{alloc_zeroed, dealloc, Layout},
    bitflags::bitflags,
    core::ptr::NonNull,
};

mod wrappers;

pub use wrappers::*;

bitflags! {
    /// TLB flush behaviour of `update_va_mapping`
    pub struct TLBFlushFlags: u64 {
        /// No flush
        const NONE = xen_sys::UVMF_NONE as u64;
        /// Flush the entire TLB
        const TLB_FLUSH = xen_sys::UVMF_TLB_FLUSH as u64;
        /// Flush only the updated mapping
        const INVLPG = xen_sys::UVMF_INVLPG as u64;
        /// Flush on every vCPU
        const ALL = xen_sys::UVMF_ALL as u64;
    }
}

/// Pointer to the beginning of the machine frame number list
///
/// **Must** be set to the `mfn_list` field of the start info structure before
/// translating between page and machine frame numbers.
#[cfg(target_os = "none")]
static mut MFN_LIST: *mut usize = core::ptr::null_mut();

/// MFN_LIST must be initialized before converting between PageFrameNumber and MachineFrameNumber
#[cfg(target_os = "none")]
pub(crate) fn init_mfn_list(mfn_list_addr: usize) {
    unsafe { MFN_LIST = mfn_list_addr as *mut usize }
}

/// Replaces the page table entry mapping `va`
#[cfg(target_os = "none")]
pub fn update_va_mapping(
    va: VirtualAddress,
    entry: PageEntry,
    flags: TLBFlushFlags,
) -> Result<(), crate::hypercall::Error> {
    unsafe {
        crate::hypercall!(
            xen_sys::__HYPERVISOR_update_va_mapping,
            va.0 as u64,
            entry.0 as u64,
            flags.bits()
        )
    }
    .map(|_| ())
}

fn page_layout(order: u32) -> Option<Layout> {
    Layout::from_size_align(PAGE_SIZE.checked_shl(order)?, PAGE_SIZE).ok()
}

/// Allocates 2^`order` zeroed, contiguous pages
pub fn alloc_pages(order: u32) -> Option<NonNull<u8>> {
    let layout = page_layout(order)?;
    NonNull::new(unsafe { alloc_zeroed(layout) })
}

/// Frees pages allocated by [`alloc_pages`]
///
/// # Safety
///
/// `pages` must have been returned by `alloc_pages` with the same `order`
/// and must not be used afterwards
pub unsafe fn free_pages(pages: NonNull<u8>, order: u32) {
    if let Some(layout) = page_layout(order) {
        dealloc(pages.as_ptr(), layout);
    }
}
