//! Typed view of the shared info page
//!
//! The hypervisor writes this page concurrently with the guest so every field
//! that is read or written by the guest is an atomic. The layout is identical
//! to `xen_sys::shared_info`.

use {
    alloc::{
        alloc::{alloc_zeroed, handle_alloc_error, Layout},
        boxed::Box,
    },
    core::{
        mem::size_of,
        sync::atomic::{AtomicI8, AtomicU32, AtomicU64, AtomicU8, Ordering},
    },
    xen_sys::{evtchn_port_t, shared_info, vcpu_info, XEN_LEGACY_MAX_VCPUS},
};

/// Number of 64-bit words in the pending and mask bitmaps
pub const EVENT_WORDS: usize = 64;

/// Number of ports covered by one bitmap word
pub const BITS_PER_WORD: usize = 64;

/// Per-vCPU time information
#[repr(C)]
#[derive(Debug)]
pub struct VcpuTimeInfo {
    /// Odd while the hypervisor is updating the record
    pub version: AtomicU32,
    _pad0: u32,
    /// TSC at the last update of `system_time`
    pub tsc_timestamp: AtomicU64,
    /// Nanoseconds since boot at `tsc_timestamp`
    pub system_time: AtomicU64,
    /// TSC to nanoseconds multiplier, 32.32 fixed point
    pub tsc_to_system_mul: AtomicU32,
    /// TSC shift applied before multiplying
    pub tsc_shift: AtomicI8,
    /// Time flags
    pub flags: AtomicU8,
    _pad1: [u8; 2],
}

/// Per-vCPU event delivery state
#[repr(C)]
#[derive(Debug)]
pub struct VcpuInfo {
    /// Set by the hypervisor when an upcall is pending
    pub evtchn_upcall_pending: AtomicU8,
    /// Upcalls are not delivered while non-zero
    pub evtchn_upcall_mask: AtomicU8,
    /// Selector of the pending bitmap words that have new events
    pub evtchn_pending_sel: AtomicU64,
    _arch: [AtomicU64; 2],
    /// Time information
    pub time: VcpuTimeInfo,
}

/// Shared info page
#[repr(C)]
#[derive(Debug)]
pub struct SharedInfo {
    /// Per-vCPU state, only the first entry is used
    pub vcpu_info: [VcpuInfo; XEN_LEGACY_MAX_VCPUS],
    /// Pending event bitmap
    pub evtchn_pending: [AtomicU64; EVENT_WORDS],
    /// Masked event bitmap
    pub evtchn_mask: [AtomicU64; EVENT_WORDS],
    /// Odd while the wall clock is being updated
    pub wc_version: AtomicU32,
    /// Wall clock seconds at boot
    pub wc_sec: AtomicU32,
    /// Wall clock nanoseconds at boot
    pub wc_nsec: AtomicU32,
    /// Upper 32 bits of the wall clock seconds
    pub wc_sec_hi: AtomicU32,
    _arch: [AtomicU64; 6],
}

const _: () = assert!(size_of::<SharedInfo>() == size_of::<shared_info>());
const _: () = assert!(size_of::<VcpuInfo>() == size_of::<vcpu_info>());

impl SharedInfo {
    /// Creates a view of a mapped shared info page
    ///
    /// # Safety
    ///
    /// `ptr` must point to the mapped shared info page, which stays mapped for
    /// the rest of the program
    pub unsafe fn from_ptr(ptr: *mut shared_info) -> &'static Self {
        &*(ptr as *const Self)
    }

    /// Allocates a zeroed page, used when the guest plays the hypervisor's part
    pub fn new_zeroed() -> Box<Self> {
        let layout = Layout::new::<Self>();

        // SAFETY: all-zero bytes are a valid value for every field, atomics included
        unsafe {
            let ptr = alloc_zeroed(layout) as *mut Self;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            Box::from_raw(ptr)
        }
    }

    /// State of the only vCPU
    pub fn vcpu(&self) -> &VcpuInfo {
        &self.vcpu_info[0]
    }

    /// Marks `port` pending the way the hypervisor does when the port is signalled
    ///
    /// An upcall is flagged only if the port is unmasked and its selector bit
    /// was not already set.
    pub fn raise(&self, port: evtchn_port_t) {
        let (word, bit) = split_port(port);

        if self.evtchn_pending[word].fetch_or(bit, Ordering::SeqCst) & bit != 0 {
            return;
        }

        if self.evtchn_mask[word].load(Ordering::SeqCst) & bit != 0 {
            return;
        }

        let vcpu = self.vcpu();
        let sel = 1 << word;
        if vcpu.evtchn_pending_sel.fetch_or(sel, Ordering::SeqCst) & sel == 0 {
            vcpu.evtchn_upcall_pending.store(1, Ordering::SeqCst);
        }
    }
}

/// Splits a port into its bitmap word index and bit mask
pub(crate) fn split_port(port: evtchn_port_t) -> (usize, u64) {
    let port = port as usize;
    (port / BITS_PER_WORD, 1 << (port % BITS_PER_WORD))
}
