//! Raw Xen public interface definitions for x86_64 paravirtualized guests
//!
//! Names follow the Xen public headers (`xen/include/public`) so that code
//! written against them reads the same as the C interface.

#![cfg_attr(not(test), no_std)]
#![allow(non_camel_case_types, non_upper_case_globals, non_snake_case)]
#![allow(missing_docs)]

use cty::{c_char, c_long, c_ulong};

pub type domid_t = u16;
pub type evtchn_port_t = u32;
pub type grant_ref_t = u32;
pub type grant_handle_t = u32;
pub type xen_pfn_t = c_ulong;
pub type xen_ulong_t = c_ulong;
pub type RING_IDX = u32;
pub type XENSTORE_RING_IDX = u32;
pub type XENCONS_RING_IDX = u32;

pub const DOMID_SELF: domid_t = 0x7FF0;

pub const __HYPERVISOR_VIRT_START: c_ulong = 0xFFFF_8000_0000_0000;
pub const MACH2PHYS_VIRT_START: c_ulong = 0xFFFF_8000_0000_0000;

pub const XENFEAT_NR_SUBMAPS: u32 = 1;
pub const XEN_LEGACY_MAX_VCPUS: usize = 32;

// hypercall numbers
pub const __HYPERVISOR_set_trap_table: u32 = 0;
pub const __HYPERVISOR_mmu_update: u32 = 1;
pub const __HYPERVISOR_set_gdt: u32 = 2;
pub const __HYPERVISOR_stack_switch: u32 = 3;
pub const __HYPERVISOR_set_callbacks: u32 = 4;
pub const __HYPERVISOR_fpu_taskswitch: u32 = 5;
pub const __HYPERVISOR_sched_op_compat: u32 = 6;
pub const __HYPERVISOR_memory_op: u32 = 12;
pub const __HYPERVISOR_multicall: u32 = 13;
pub const __HYPERVISOR_update_va_mapping: u32 = 14;
pub const __HYPERVISOR_set_timer_op: u32 = 15;
pub const __HYPERVISOR_xen_version: u32 = 17;
pub const __HYPERVISOR_console_io: u32 = 18;
pub const __HYPERVISOR_grant_table_op: u32 = 20;
pub const __HYPERVISOR_vm_assist: u32 = 21;
pub const __HYPERVISOR_iret: u32 = 23;
pub const __HYPERVISOR_vcpu_op: u32 = 24;
pub const __HYPERVISOR_mmuext_op: u32 = 26;
pub const __HYPERVISOR_sched_op: u32 = 29;
pub const __HYPERVISOR_callback_op: u32 = 30;
pub const __HYPERVISOR_event_channel_op: u32 = 32;
pub const __HYPERVISOR_physdev_op: u32 = 33;

// update_va_mapping flags
pub const UVMF_NONE: u32 = 0;
pub const UVMF_TLB_FLUSH: u32 = 1;
pub const UVMF_INVLPG: u32 = 2;
pub const UVMF_ALL: u32 = 4;

pub const MMU_NORMAL_PT_UPDATE: u32 = 0;
pub const MMU_MACHPHYS_UPDATE: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct mmu_update {
    pub ptr: u64,
    pub val: u64,
}
pub type mmu_update_t = mmu_update;

// console_io
pub const CONSOLEIO_write: u32 = 0;
pub const CONSOLEIO_read: u32 = 1;

// event channels
pub const EVTCHNOP_bind_interdomain: u32 = 0;
pub const EVTCHNOP_bind_virq: u32 = 1;
pub const EVTCHNOP_bind_pirq: u32 = 2;
pub const EVTCHNOP_close: u32 = 3;
pub const EVTCHNOP_send: u32 = 4;
pub const EVTCHNOP_status: u32 = 5;
pub const EVTCHNOP_alloc_unbound: u32 = 6;
pub const EVTCHNOP_bind_ipi: u32 = 7;
pub const EVTCHNOP_bind_vcpu: u32 = 8;
pub const EVTCHNOP_unmask: u32 = 9;
pub const EVTCHNOP_reset: u32 = 10;

pub const VIRQ_TIMER: u32 = 0;
pub const VIRQ_DEBUG: u32 = 1;
pub const VIRQ_CONSOLE: u32 = 2;
pub const VIRQ_DOM_EXC: u32 = 3;
pub const VIRQ_TBUF: u32 = 4;
pub const VIRQ_DEBUGGER: u32 = 6;
pub const VIRQ_XENOPROF: u32 = 7;
pub const VIRQ_CON_RING: u32 = 8;
pub const NR_VIRQS: u32 = 24;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct evtchn_alloc_unbound {
    pub dom: domid_t,
    pub remote_dom: domid_t,
    pub port: evtchn_port_t,
}
pub type evtchn_alloc_unbound_t = evtchn_alloc_unbound;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct evtchn_bind_interdomain {
    pub remote_dom: domid_t,
    pub remote_port: evtchn_port_t,
    pub local_port: evtchn_port_t,
}
pub type evtchn_bind_interdomain_t = evtchn_bind_interdomain;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct evtchn_bind_virq {
    pub virq: u32,
    pub vcpu: u32,
    pub port: evtchn_port_t,
}
pub type evtchn_bind_virq_t = evtchn_bind_virq;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct evtchn_close {
    pub port: evtchn_port_t,
}
pub type evtchn_close_t = evtchn_close;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct evtchn_send {
    pub port: evtchn_port_t,
}
pub type evtchn_send_t = evtchn_send;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct evtchn_unmask {
    pub port: evtchn_port_t,
}
pub type evtchn_unmask_t = evtchn_unmask;

// scheduler operations
pub const SCHEDOP_yield: u32 = 0;
pub const SCHEDOP_block: u32 = 1;
pub const SCHEDOP_shutdown: u32 = 2;
pub const SCHEDOP_poll: u32 = 3;
pub const SCHEDOP_remote_shutdown: u32 = 4;
pub const SCHEDOP_shutdown_code: u32 = 5;
pub const SCHEDOP_watchdog: u32 = 6;
pub const SCHEDOP_pin_override: u32 = 7;

pub const SHUTDOWN_poweroff: u32 = 0;
pub const SHUTDOWN_reboot: u32 = 1;
pub const SHUTDOWN_suspend: u32 = 2;
pub const SHUTDOWN_crash: u32 = 3;
pub const SHUTDOWN_watchdog: u32 = 4;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct sched_shutdown {
    pub reason: u32,
}
pub type sched_shutdown_t = sched_shutdown;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct sched_poll {
    pub ports: *mut evtchn_port_t,
    pub nr_ports: u32,
    pub timeout: u64,
}
pub type sched_poll_t = sched_poll;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct sched_remote_shutdown {
    pub domain_id: domid_t,
    pub reason: u32,
}
pub type sched_remote_shutdown_t = sched_remote_shutdown;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct sched_watchdog {
    pub id: u32,
    pub timeout: u32,
}
pub type sched_watchdog_t = sched_watchdog;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct sched_pin_override {
    pub pcpu: i32,
}
pub type sched_pin_override_t = sched_pin_override;

// grant tables
pub const GNTTABOP_map_grant_ref: u32 = 0;
pub const GNTTABOP_unmap_grant_ref: u32 = 1;
pub const GNTTABOP_setup_table: u32 = 2;
pub const GNTTABOP_dump_table: u32 = 3;
pub const GNTTABOP_transfer: u32 = 4;
pub const GNTTABOP_copy: u32 = 5;
pub const GNTTABOP_query_size: u32 = 6;
pub const GNTTABOP_unmap_and_replace: u32 = 7;

pub const GTF_invalid: u32 = 0;
pub const GTF_permit_access: u32 = 1;
pub const GTF_accept_transfer: u32 = 2;
pub const GTF_transitive: u32 = 3;
pub const GTF_type_mask: u32 = 3;
pub const GTF_readonly: u32 = 1 << 2;
pub const GTF_reading: u32 = 1 << 3;
pub const GTF_writing: u32 = 1 << 4;
pub const GTF_PWT: u32 = 1 << 5;
pub const GTF_PCD: u32 = 1 << 6;
pub const GTF_PAT: u32 = 1 << 7;
pub const GTF_sub_page: u32 = 1 << 8;
pub const GTF_transfer_committed: u32 = 1 << 2;
pub const GTF_transfer_completed: u32 = 1 << 3;

pub const GNTMAP_device_map: u32 = 1 << 0;
pub const GNTMAP_host_map: u32 = 1 << 1;
pub const GNTMAP_readonly: u32 = 1 << 2;
pub const GNTMAP_application_map: u32 = 1 << 3;
pub const GNTMAP_contains_pte: u32 = 1 << 4;

pub const GNTST_okay: i16 = 0;
pub const GNTST_general_error: i16 = -1;
pub const GNTST_bad_domain: i16 = -2;
pub const GNTST_bad_gntref: i16 = -3;
pub const GNTST_bad_handle: i16 = -4;
pub const GNTST_bad_virt_addr: i16 = -5;
pub const GNTST_bad_dev_addr: i16 = -6;
pub const GNTST_no_device_space: i16 = -7;
pub const GNTST_permission_denied: i16 = -8;
pub const GNTST_bad_page: i16 = -9;
pub const GNTST_bad_copy_arg: i16 = -10;
pub const GNTST_address_too_big: i16 = -11;
pub const GNTST_eagain: i16 = -12;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct grant_entry_v1 {
    pub flags: u16,
    pub domid: domid_t,
    pub frame: u32,
}
pub type grant_entry_t = grant_entry_v1;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct gnttab_setup_table {
    pub dom: domid_t,
    pub nr_frames: u32,
    pub status: i16,
    pub frame_list: *mut xen_pfn_t,
}
pub type gnttab_setup_table_t = gnttab_setup_table;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct gnttab_map_grant_ref {
    pub host_addr: u64,
    pub flags: u32,
    pub ref_: grant_ref_t,
    pub dom: domid_t,
    pub status: i16,
    pub handle: grant_handle_t,
    pub dev_bus_addr: u64,
}
pub type gnttab_map_grant_ref_t = gnttab_map_grant_ref;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct gnttab_unmap_grant_ref {
    pub host_addr: u64,
    pub dev_bus_addr: u64,
    pub handle: grant_handle_t,
    pub status: i16,
}
pub type gnttab_unmap_grant_ref_t = gnttab_unmap_grant_ref;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct gnttab_dump_table {
    pub dom: domid_t,
    pub status: i16,
}
pub type gnttab_dump_table_t = gnttab_dump_table;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct gnttab_query_size {
    pub dom: domid_t,
    pub nr_frames: u32,
    pub max_nr_frames: u32,
    pub status: i16,
}
pub type gnttab_query_size_t = gnttab_query_size;

// shared and start info pages
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vcpu_time_info {
    pub version: u32,
    pub pad0: u32,
    pub tsc_timestamp: u64,
    pub system_time: u64,
    pub tsc_to_system_mul: u32,
    pub tsc_shift: i8,
    pub flags: u8,
    pub pad1: [u8; 2],
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct arch_vcpu_info {
    pub cr2: c_ulong,
    pub pad: c_ulong,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct vcpu_info {
    pub evtchn_upcall_pending: u8,
    pub evtchn_upcall_mask: u8,
    pub evtchn_pending_sel: xen_ulong_t,
    pub arch: arch_vcpu_info,
    pub time: vcpu_time_info,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct arch_shared_info {
    pub max_pfn: c_ulong,
    pub pfn_to_mfn_frame_list_list: xen_pfn_t,
    pub nmi_reason: c_ulong,
    pub p2m_cr3: c_ulong,
    pub p2m_vaddr: c_ulong,
    pub p2m_generation: c_ulong,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct shared_info {
    pub vcpu_info: [vcpu_info; XEN_LEGACY_MAX_VCPUS],
    pub evtchn_pending: [xen_ulong_t; 64],
    pub evtchn_mask: [xen_ulong_t; 64],
    pub wc_version: u32,
    pub wc_sec: u32,
    pub wc_nsec: u32,
    pub wc_sec_hi: u32,
    pub arch: arch_shared_info,
}
pub type shared_info_t = shared_info;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct start_info__bindgen_ty_1__bindgen_ty_1 {
    pub mfn: xen_pfn_t,
    pub evtchn: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct start_info__bindgen_ty_1__bindgen_ty_2 {
    pub info_off: u32,
    pub info_size: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union start_info__bindgen_ty_1 {
    pub domU: start_info__bindgen_ty_1__bindgen_ty_1,
    pub dom0: start_info__bindgen_ty_1__bindgen_ty_2,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct start_info {
    pub magic: [c_char; 32],
    pub nr_pages: c_ulong,
    pub shared_info: c_ulong,
    pub flags: u32,
    pub store_mfn: xen_pfn_t,
    pub store_evtchn: u32,
    pub console: start_info__bindgen_ty_1,
    pub pt_base: c_ulong,
    pub nr_pt_frames: c_ulong,
    pub mfn_list: c_ulong,
    pub mod_start: c_ulong,
    pub mod_len: c_ulong,
    pub cmd_line: [i8; 1024],
    pub first_p2m_pfn: c_ulong,
    pub nr_p2m_frames: c_ulong,
}
pub type start_info_t = start_info;

// console ring
#[repr(C)]
#[derive(Copy, Clone)]
pub struct xencons_interface {
    pub in_: [c_char; 1024],
    pub out: [c_char; 2048],
    pub in_cons: XENCONS_RING_IDX,
    pub in_prod: XENCONS_RING_IDX,
    pub out_cons: XENCONS_RING_IDX,
    pub out_prod: XENCONS_RING_IDX,
}

// xenstore ring and wire protocol
pub const XENSTORE_RING_SIZE: u32 = 1024;
pub const XENSTORE_PAYLOAD_MAX: u32 = 4096;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct xenstore_domain_interface {
    pub req: [c_char; XENSTORE_RING_SIZE as usize],
    pub rsp: [c_char; XENSTORE_RING_SIZE as usize],
    pub req_cons: XENSTORE_RING_IDX,
    pub req_prod: XENSTORE_RING_IDX,
    pub rsp_cons: XENSTORE_RING_IDX,
    pub rsp_prod: XENSTORE_RING_IDX,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct xsd_sockmsg {
    pub type_: u32,
    pub req_id: u32,
    pub tx_id: u32,
    pub len: u32,
}

pub type xsd_sockmsg_type = u32;
pub const xsd_sockmsg_type_XS_CONTROL: xsd_sockmsg_type = 0;
pub const xsd_sockmsg_type_XS_DIRECTORY: xsd_sockmsg_type = 1;
pub const xsd_sockmsg_type_XS_READ: xsd_sockmsg_type = 2;
pub const xsd_sockmsg_type_XS_GET_PERMS: xsd_sockmsg_type = 3;
pub const xsd_sockmsg_type_XS_WATCH: xsd_sockmsg_type = 4;
pub const xsd_sockmsg_type_XS_UNWATCH: xsd_sockmsg_type = 5;
pub const xsd_sockmsg_type_XS_TRANSACTION_START: xsd_sockmsg_type = 6;
pub const xsd_sockmsg_type_XS_TRANSACTION_END: xsd_sockmsg_type = 7;
pub const xsd_sockmsg_type_XS_INTRODUCE: xsd_sockmsg_type = 8;
pub const xsd_sockmsg_type_XS_RELEASE: xsd_sockmsg_type = 9;
pub const xsd_sockmsg_type_XS_GET_DOMAIN_PATH: xsd_sockmsg_type = 10;
pub const xsd_sockmsg_type_XS_WRITE: xsd_sockmsg_type = 11;
pub const xsd_sockmsg_type_XS_MKDIR: xsd_sockmsg_type = 12;
pub const xsd_sockmsg_type_XS_RM: xsd_sockmsg_type = 13;
pub const xsd_sockmsg_type_XS_SET_PERMS: xsd_sockmsg_type = 14;
pub const xsd_sockmsg_type_XS_WATCH_EVENT: xsd_sockmsg_type = 15;
pub const xsd_sockmsg_type_XS_ERROR: xsd_sockmsg_type = 16;
pub const xsd_sockmsg_type_XS_IS_DOMAIN_INTRODUCED: xsd_sockmsg_type = 17;
pub const xsd_sockmsg_type_XS_RESUME: xsd_sockmsg_type = 18;
pub const xsd_sockmsg_type_XS_SET_TARGET: xsd_sockmsg_type = 19;
pub const xsd_sockmsg_type_XS_RESET_WATCHES: xsd_sockmsg_type = 21;
pub const xsd_sockmsg_type_XS_DIRECTORY_PART: xsd_sockmsg_type = 22;
pub const xsd_sockmsg_type_XS_TYPE_COUNT: xsd_sockmsg_type = 23;

pub type XenbusState = u32;
pub const xenbus_state_XenbusStateUnknown: XenbusState = 0;
pub const xenbus_state_XenbusStateInitialising: XenbusState = 1;
pub const xenbus_state_XenbusStateInitWait: XenbusState = 2;
pub const xenbus_state_XenbusStateInitialised: XenbusState = 3;
pub const xenbus_state_XenbusStateConnected: XenbusState = 4;
pub const xenbus_state_XenbusStateClosing: XenbusState = 5;
pub const xenbus_state_XenbusStateClosed: XenbusState = 6;
pub const xenbus_state_XenbusStateReconfiguring: XenbusState = 7;
pub const xenbus_state_XenbusStateReconfigured: XenbusState = 8;

// block device ring slots
pub const BLKIF_OP_READ: u8 = 0;
pub const BLKIF_OP_WRITE: u8 = 1;
pub const BLKIF_OP_WRITE_BARRIER: u8 = 2;
pub const BLKIF_OP_FLUSH_DISKCACHE: u8 = 3;
pub const BLKIF_MAX_SEGMENTS_PER_REQUEST: usize = 11;
pub const BLKIF_RSP_ERROR: i16 = -1;
pub const BLKIF_RSP_OKAY: i16 = 0;

pub type blkif_vdev_t = u16;
pub type blkif_sector_t = u64;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct blkif_request_segment {
    pub gref: grant_ref_t,
    pub first_sect: u8,
    pub last_sect: u8,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct blkif_request {
    pub operation: u8,
    pub nr_segments: u8,
    pub handle: blkif_vdev_t,
    pub id: u64,
    pub sector_number: blkif_sector_t,
    pub seg: [blkif_request_segment; BLKIF_MAX_SEGMENTS_PER_REQUEST],
}
pub type blkif_request_t = blkif_request;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct blkif_response {
    pub id: u64,
    pub operation: u8,
    pub status: i16,
}
pub type blkif_response_t = blkif_response;

// network device ring slots
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct netif_tx_request {
    pub gref: grant_ref_t,
    pub offset: u16,
    pub flags: u16,
    pub id: u16,
    pub size: u16,
}
pub type netif_tx_request_t = netif_tx_request;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct netif_tx_response {
    pub id: u16,
    pub status: i16,
}
pub type netif_tx_response_t = netif_tx_response;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct netif_rx_request {
    pub id: u16,
    pub gref: grant_ref_t,
}
pub type netif_rx_request_t = netif_rx_request;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct netif_rx_response {
    pub id: u16,
    pub offset: u16,
    pub flags: u16,
    pub status: i16,
}
pub type netif_rx_response_t = netif_rx_response;

/// Raw hypercall return type
pub type hypercall_ret_t = c_long;

#[cfg(test)]
mod tests {
    use {super::*, core::mem::size_of};

    #[test]
    fn shared_page_layouts_match_abi() {
        assert_eq!(size_of::<vcpu_time_info>(), 32);
        assert_eq!(size_of::<vcpu_info>(), 64);
        assert_eq!(size_of::<shared_info>(), 32 * 64 + 2 * 512 + 16 + 48);
        assert_eq!(size_of::<xencons_interface>(), 1024 + 2048 + 16);
        assert_eq!(size_of::<xenstore_domain_interface>(), 2048 + 16);
        assert_eq!(size_of::<xsd_sockmsg>(), 16);
        assert_eq!(size_of::<grant_entry_v1>(), 8);
    }

    #[test]
    fn ring_slot_layouts_match_abi() {
        assert_eq!(size_of::<blkif_request>(), 112);
        assert_eq!(size_of::<blkif_response>(), 16);
        assert_eq!(size_of::<netif_tx_request>(), 12);
        assert_eq!(size_of::<netif_rx_request>(), 8);
        assert_eq!(size_of::<netif_rx_response>(), 8);
    }

    #[test]
    fn hypercall_argument_layouts_match_abi() {
        assert_eq!(size_of::<evtchn_alloc_unbound>(), 8);
        assert_eq!(size_of::<evtchn_bind_interdomain>(), 12);
        assert_eq!(size_of::<evtchn_bind_virq>(), 12);
        assert_eq!(size_of::<gnttab_setup_table>(), 24);
        assert_eq!(size_of::<gnttab_map_grant_ref>(), 32);
        assert_eq!(size_of::<sched_poll>(), 24);
    }
}
