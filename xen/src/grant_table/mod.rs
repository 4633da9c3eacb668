//! Interface for Xen Grant Tables
//!
//! "The grant table mechanism [..] allows memory pages to be transferred or shared between virtual machines"
//!
//! The table is an array of v1 entries shared with the hypervisor. Free references are threaded
//! through a shadow array whose first element is the head of the list, the low
//! [`NUM_RESERVED_ENTRIES`] references are never handed out.

use {
    crate::{
        hypercall::Hypervisor,
        memory::MachineFrameNumber,
        platform::consts::PAGE_SIZE,
        ring::{rmb, wmb},
        DOMID_SELF,
    },
    alloc::vec,
    alloc::vec::Vec,
    bitflags::bitflags,
    core::{
        convert::TryFrom,
        hint::spin_loop,
        mem::size_of,
        slice,
        sync::atomic::{AtomicU16, AtomicU32, Ordering},
    },
    log::{trace, warn},
    spin::Mutex,
    xen_sys::{
        domid_t, grant_entry_t, grant_ref_t, xen_pfn_t, GTF_accept_transfer, GTF_permit_access,
        GTF_readonly, GTF_reading, GTF_transfer_committed, GTF_transfer_completed, GTF_writing,
    },
};

pub use error::{Error, GrantStatusError};

mod error;
pub mod operations;

/// Number of grant frames
pub const NUM_GRANT_FRAMES: usize = 4;

/// References kept back for the toolstack (console and XenStore pages)
pub const NUM_RESERVED_ENTRIES: usize = 8;

/// Number of v1 entries in [`NUM_GRANT_FRAMES`] frames
pub const NUM_GRANT_ENTRIES: usize = (NUM_GRANT_FRAMES * PAGE_SIZE) / size_of::<grant_entry_t>();

/// Compare-and-swap attempts before `end_access` gives up
pub const END_ACCESS_RETRIES: usize = 64;

const TRANSFER_POLLS: usize = 1 << 16;

bitflags! {
    /// Flags word of a grant entry (`GTF_*`)
    pub struct GrantFlags: u16 {
        /// Remote domain may map the frame
        const PERMIT_ACCESS = GTF_permit_access as u16;
        /// Remote domain may transfer a frame into this entry
        const ACCEPT_TRANSFER = GTF_accept_transfer as u16;
        /// Mappings must be read-only
        const READONLY = GTF_readonly as u16;
        /// Remote domain is reading the frame
        const READING = GTF_reading as u16;
        /// Remote domain is writing the frame
        const WRITING = GTF_writing as u16;
        /// Transfer is committed, the entry may no longer be released
        const TRANSFER_COMMITTED = GTF_transfer_committed as u16;
        /// Transferred frame number is valid
        const TRANSFER_COMPLETED = GTF_transfer_completed as u16;
    }
}

const BUSY: u16 = (GTF_reading | GTF_writing) as u16;

/// Grant table entry as shared with the hypervisor
#[repr(C)]
#[derive(Debug, Default)]
pub struct GrantEntry {
    flags: AtomicU16,
    domid: AtomicU16,
    frame: AtomicU32,
}

const _: () = assert!(size_of::<GrantEntry>() == size_of::<grant_entry_t>());

impl GrantEntry {
    /// Current flags
    pub fn flags(&self) -> GrantFlags {
        GrantFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Domain the entry is granted to
    pub fn domid(&self) -> domid_t {
        self.domid.load(Ordering::SeqCst)
    }

    /// Granted frame, or the transferred frame once a transfer completed
    pub fn frame(&self) -> u32 {
        self.frame.load(Ordering::SeqCst)
    }

    fn publish(&self, domain: domid_t, frame: MachineFrameNumber, flags: GrantFlags) {
        let frame = u32::try_from(frame.0)
            .unwrap_or_else(|_| panic!("frame {:#x} does not fit a v1 grant entry", frame.0));

        self.frame.store(frame, Ordering::Relaxed);
        self.domid.store(domain, Ordering::Relaxed);

        wmb();

        self.flags.store(flags.bits(), Ordering::SeqCst);
    }
}

/// Outcome of [`GrantTable::end_transfer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEnd {
    /// No transfer was committed, the reference has been released
    Released,
    /// Transfer finished, carries the frame received
    Completed(u32),
    /// Transfer is committed but has not completed yet
    InProgress,
}

struct FreeList {
    list: Vec<grant_ref_t>,
    free: usize,
}

impl FreeList {
    fn put(&mut self, reference: grant_ref_t) {
        self.list[reference as usize] = self.list[0];
        self.list[0] = reference;
        self.free += 1;
    }

    fn get(&mut self) -> Option<grant_ref_t> {
        let reference = self.list[0];
        if reference == 0 {
            return None;
        }

        self.list[0] = self.list[reference as usize];
        self.free -= 1;
        Some(reference)
    }
}

/// Grant table of this domain
pub struct GrantTable {
    entries: &'static [GrantEntry],
    free: Mutex<FreeList>,
}

impl GrantTable {
    /// Builds the free list over `entries`
    pub fn new(entries: &'static [GrantEntry]) -> Self {
        assert!(
            entries.len() > NUM_RESERVED_ENTRIES,
            "grant table of {} entries has no unreserved entries",
            entries.len()
        );

        let mut free = FreeList {
            list: vec![0; entries.len()],
            free: 0,
        };

        for reference in NUM_RESERVED_ENTRIES..entries.len() {
            free.put(reference as grant_ref_t);
        }

        trace!("grant table with {} entries at {:p}", entries.len(), entries.as_ptr());

        Self {
            entries,
            free: Mutex::new(free),
        }
    }

    /// Builds a table over `count` entries starting at `table`
    ///
    /// # Safety
    ///
    /// `table` must point to `count` entries that stay mapped for the rest of the program
    pub unsafe fn from_raw(table: *mut grant_entry_t, count: usize) -> Self {
        Self::new(slice::from_raw_parts(table as *const GrantEntry, count))
    }

    /// Total number of entries, reserved ones included
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of references that can currently be granted
    pub fn free_count(&self) -> usize {
        self.free.lock().free
    }

    /// Entry of `reference`
    pub fn entry(&self, reference: grant_ref_t) -> &GrantEntry {
        let index = reference as usize;
        assert!(
            (NUM_RESERVED_ENTRIES..self.entries.len()).contains(&index),
            "grant reference {} out of range",
            reference
        );

        &self.entries[index]
    }

    /// Grants `domain` access to `frame` using a newly allocated reference
    pub fn grant_access(
        &self,
        domain: domid_t,
        frame: MachineFrameNumber,
        readonly: bool,
    ) -> Result<grant_ref_t, Error> {
        let reference = self.free.lock().get().ok_or(Error::Exhausted)?;

        self.grant_access_ref(reference, domain, frame, readonly);

        Ok(reference)
    }

    /// Grants `domain` access to `frame` through the already allocated `reference`
    pub fn grant_access_ref(
        &self,
        reference: grant_ref_t,
        domain: domid_t,
        frame: MachineFrameNumber,
        readonly: bool,
    ) {
        let mut flags = GrantFlags::PERMIT_ACCESS;
        if readonly {
            flags |= GrantFlags::READONLY;
        }

        self.entry(reference).publish(domain, frame, flags);

        trace!(
            "granting access {} {:#x} {:?} {}",
            domain,
            frame.0,
            flags,
            reference
        );
    }

    /// Revokes access through `reference` and releases it
    ///
    /// Returns `false` while the remote domain still reads or writes the frame, the grant then
    /// stays valid and ending it may be retried.
    pub fn end_access(&self, reference: grant_ref_t) -> bool {
        let entry = self.entry(reference);
        let mut flags = entry.flags.load(Ordering::SeqCst);

        for _ in 0..END_ACCESS_RETRIES {
            if flags & BUSY != 0 {
                warn!("grant reference {} still in use", reference);
                return false;
            }

            match entry
                .flags
                .compare_exchange(flags, 0, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.free.lock().put(reference);
                    return true;
                }
                Err(current) => flags = current,
            }
        }

        warn!("grant reference {} flags kept changing", reference);
        false
    }

    /// Lets `domain` transfer a frame into a newly allocated reference
    pub fn grant_transfer(
        &self,
        domain: domid_t,
        frame: MachineFrameNumber,
    ) -> Result<grant_ref_t, Error> {
        let reference = self.free.lock().get().ok_or(Error::Exhausted)?;

        self.entry(reference)
            .publish(domain, frame, GrantFlags::ACCEPT_TRANSFER);

        Ok(reference)
    }

    /// Ends a transfer grant
    ///
    /// An uncommitted transfer is cancelled. A committed one is waited on (bounded) and the
    /// received frame returned.
    pub fn end_transfer(&self, reference: grant_ref_t) -> TransferEnd {
        let entry = self.entry(reference);
        let mut flags = entry.flags.load(Ordering::SeqCst);
        let mut retries = 0;

        while flags & GTF_transfer_committed as u16 == 0 {
            if retries == END_ACCESS_RETRIES {
                return TransferEnd::InProgress;
            }
            retries += 1;

            match entry
                .flags
                .compare_exchange(flags, 0, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.free.lock().put(reference);
                    return TransferEnd::Released;
                }
                Err(current) => flags = current,
            }
        }

        for _ in 0..TRANSFER_POLLS {
            if flags & GTF_transfer_completed as u16 != 0 {
                rmb();
                let frame = entry.frame.load(Ordering::SeqCst);
                entry.flags.store(0, Ordering::SeqCst);
                self.free.lock().put(reference);
                return TransferEnd::Completed(frame);
            }

            spin_loop();
            flags = entry.flags.load(Ordering::SeqCst);
        }

        warn!("transfer through grant reference {} not completed", reference);
        TransferEnd::InProgress
    }
}

/// Sets up [`NUM_GRANT_FRAMES`] grant frames for this domain and returns them
pub fn setup(hypervisor: &dyn Hypervisor) -> Result<[xen_pfn_t; NUM_GRANT_FRAMES], Error> {
    let mut frames = [0; NUM_GRANT_FRAMES];

    operations::setup_table(hypervisor, DOMID_SELF, &mut frames)?;

    Ok(frames)
}

/// Releases the grant frames of this domain
pub fn fini(hypervisor: &dyn Hypervisor) -> Result<(), Error> {
    operations::setup_table(hypervisor, DOMID_SELF, &mut [])
}

/// Sets up the grant frames and maps them into a freshly allocated virtual range
#[cfg(target_os = "none")]
pub fn init(hypervisor: &dyn Hypervisor) -> Result<GrantTable, Error> {
    use crate::{
        memory::{alloc_pages, update_va_mapping, PageEntry, TLBFlushFlags, VirtualAddress},
        platform::consts::L1_PROT,
    };

    let frames = setup(hypervisor)?;

    let order = NUM_GRANT_FRAMES.trailing_zeros();
    let base = alloc_pages(order).ok_or(Error::Exhausted)?.as_ptr() as usize;

    for (i, frame) in frames.iter().enumerate() {
        update_va_mapping(
            VirtualAddress(base + i * PAGE_SIZE),
            PageEntry::new(MachineFrameNumber(*frame as usize), L1_PROT),
            TLBFlushFlags::INVLPG,
        )?;
    }

    Ok(unsafe { GrantTable::from_raw(base as *mut grant_entry_t, NUM_GRANT_ENTRIES) })
}
