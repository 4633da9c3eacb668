//! Safe grant table operation wrappers

use {
    crate::{
        grant_table::{error::check_status, Error},
        hypercall::{self, Hypervisor},
        DOMID_SELF,
    },
    core::convert::TryInto,
    xen_sys::{
        domid_t, gnttab_dump_table_t, gnttab_map_grant_ref_t, gnttab_query_size_t,
        gnttab_setup_table_t, gnttab_unmap_grant_ref_t, grant_ref_t, xen_pfn_t, GNTMAP_host_map,
        GNTMAP_readonly, GNTTABOP_dump_table, GNTTABOP_map_grant_ref, GNTTABOP_query_size,
        GNTTABOP_setup_table, GNTTABOP_unmap_grant_ref,
    },
};

/// Handle to track a mapping created via a grant reference
///
/// Fields are private so that a handle cannot be constructed other than by `map_grant_entry`.
#[derive(Debug)]
pub struct GrantHandle {
    host_addr: u64,
    handle: u32,
}

impl GrantHandle {
    /// Unmaps the mapped grant reference
    pub fn unmap(self, hypervisor: &dyn Hypervisor) -> Result<(), Error> {
        let mut arg = gnttab_unmap_grant_ref_t {
            // INPUT
            host_addr: self.host_addr,
            dev_bus_addr: 0,
            handle: self.handle,
            // OUTPUT
            status: 0,
        };

        unsafe { grant_table_op(hypervisor, GNTTABOP_unmap_grant_ref, &mut arg as *mut _ as u64)? };

        check_status(arg.status)
    }
}

/// Maps a grant reference of `domain` at `address`
///
/// # Safety
///
/// `address` must be a page-aligned virtual address whose mapping may be replaced
pub unsafe fn map_grant_entry(
    hypervisor: &dyn Hypervisor,
    address: *const u8,
    reference: grant_ref_t,
    domain: domid_t,
    readonly: bool,
) -> Result<GrantHandle, Error> {
    let mut arg = gnttab_map_grant_ref_t {
        // INPUT
        host_addr: address as u64,
        flags: GNTMAP_host_map,
        ref_: reference,
        dom: domain,
        // OUTPUT
        status: 0,
        handle: 0,
        dev_bus_addr: 0,
    };

    if readonly {
        arg.flags |= GNTMAP_readonly;
    }

    grant_table_op(hypervisor, GNTTABOP_map_grant_ref, &mut arg as *mut _ as u64)?;
    check_status(arg.status)?;

    Ok(GrantHandle {
        host_addr: arg.host_addr,
        handle: arg.handle,
    })
}

/// Sets up the grant table of `domain` with one frame per element of `frames`
///
/// The hypervisor fills `frames` with the machine frames backing the table,
/// an empty slice releases the table.
pub fn setup_table(
    hypervisor: &dyn Hypervisor,
    domain: domid_t,
    frames: &mut [xen_pfn_t],
) -> Result<(), Error> {
    let mut arg = gnttab_setup_table_t {
        // INPUT
        dom: domain,
        nr_frames: frames
            .len()
            .try_into()
            .map_err(|_| Error::Hypercall(hypercall::Error::InvalidArgument))?,
        frame_list: frames.as_mut_ptr(),
        // OUTPUT
        status: 0,
    };

    unsafe { grant_table_op(hypervisor, GNTTABOP_setup_table, &mut arg as *mut _ as u64)? };

    check_status(arg.status)
}

/// Dumps contents of grant table to the hypervisor console
pub fn dump_table(hypervisor: &dyn Hypervisor) -> Result<(), Error> {
    let mut arg = gnttab_dump_table_t {
        // INPUT
        dom: DOMID_SELF,
        // OUTPUT
        status: 0,
    };

    unsafe { grant_table_op(hypervisor, GNTTABOP_dump_table, &mut arg as *mut _ as u64) }?;

    check_status(arg.status)
}

/// Queries the current and maximum sizes of the shared grant table
pub fn query_size(hypervisor: &dyn Hypervisor) -> Result<(u32, u32), Error> {
    let mut arg = gnttab_query_size_t {
        dom: DOMID_SELF,
        nr_frames: 0,
        max_nr_frames: 0,
        status: 0,
    };

    unsafe { grant_table_op(hypervisor, GNTTABOP_query_size, &mut arg as *mut _ as u64) }?;
    check_status(arg.status)?;

    Ok((arg.nr_frames, arg.max_nr_frames))
}

/// Performs a single `grant_table_op` hypercall
unsafe fn grant_table_op(
    hypervisor: &dyn Hypervisor,
    cmd: u32,
    arg_ptr: u64,
) -> Result<u64, hypercall::Error> {
    hypervisor.grant_table_op(cmd, arg_ptr, 1)
}
