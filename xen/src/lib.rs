//! Interface with Xen hypervisor
//!
//! The kernel core of a paravirtualized guest: event channels, the grant
//! table, shared rings, a cooperative scheduler and a XenStore client. All of
//! it talks to Xen through [`hypercall::Hypervisor`], so everything except the
//! boot glue builds and runs on the host under `cargo test`.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(target_os = "none")]
use {
    crate::{
        memory::{update_va_mapping, PageEntry, TLBFlushFlags, VirtualAddress},
        platform::consts::L1_PROT,
        shared_info::SharedInfo,
    },
    xen_sys::{shared_info, start_info},
};

pub use xen_sys;

pub mod console;
pub mod events;
#[cfg(test)]
mod fake;
pub mod grant_table;
pub mod hypercall;
pub mod memory;
pub mod platform;
pub mod ring;
pub mod scheduler;
#[cfg(target_os = "none")]
pub mod sections;
pub mod shared_info;
pub mod xenstore;

/// Domain ID of this domain
pub const DOMID_SELF: xen_sys::domid_t = 0x7FF0;

/// Xen static startup information
#[cfg(target_os = "none")]
pub static mut START_INFO: *mut start_info = core::ptr::null_mut();

#[cfg(target_os = "none")]
extern "C" {
    /// Page reserved by the boot code for mapping the shared info page
    #[link_name = "shared_info"]
    static mut SHARED_INFO_PAGE: u8;
}

/// Records the start info page and maps the shared info page
///
/// # Safety
///
/// `start_info` must point to the start info page Xen passed to the boot entry and must only be
/// called once
#[cfg(target_os = "none")]
pub unsafe fn init_info(
    start_info: *mut start_info,
) -> Result<&'static SharedInfo, hypercall::Error> {
    START_INFO = start_info;

    memory::init_mfn_list((*start_info).mfn_list as usize);

    let page = &mut SHARED_INFO_PAGE as *mut u8;
    update_va_mapping(
        VirtualAddress(page as usize),
        PageEntry((*start_info).shared_info as usize | L1_PROT),
        TLBFlushFlags::INVLPG,
    )?;

    Ok(SharedInfo::from_ptr(page as *mut shared_info))
}
