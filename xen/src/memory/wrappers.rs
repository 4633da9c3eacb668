use crate::platform::consts::{L1_PAGETABLE_SHIFT, PADDR_MASK, PAGE_MASK, PAGE_SHIFT};

#[cfg(target_os = "none")]
use {super::MFN_LIST, crate::sections::text_start, xen_sys::MACH2PHYS_VIRT_START};

/// Page Entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageEntry(pub usize);

impl PageEntry {
    /// Entry mapping `mfn` with the protection bits `prot`
    pub fn new(mfn: MachineFrameNumber, prot: usize) -> Self {
        Self((mfn.0 << PAGE_SHIFT) | prot)
    }
}

/// Number for page frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageFrameNumber(pub usize);

/// Number of a page in the machine's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MachineFrameNumber(pub usize);

// pte_to_mfn
impl From<PageEntry> for MachineFrameNumber {
    fn from(pte: PageEntry) -> Self {
        Self(((pte.0) & (PADDR_MASK & PAGE_MASK)) >> L1_PAGETABLE_SHIFT)
    }
}

/// Virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub usize);

/// Pseudo-Physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub usize);

/// Machine address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MachineAddress(pub usize);

// mfn_to_pfn
#[cfg(target_os = "none")]
impl From<MachineFrameNumber> for PageFrameNumber {
    fn from(mfn: MachineFrameNumber) -> Self {
        Self(unsafe { *(MACH2PHYS_VIRT_START as *const usize).add(mfn.0) })
    }
}

// pfn_to_mfn
#[cfg(target_os = "none")]
impl From<PageFrameNumber> for MachineFrameNumber {
    fn from(pfn: PageFrameNumber) -> Self {
        Self(unsafe { *MFN_LIST.add(pfn.0) })
    }
}

// virt_to_pfn
#[cfg(target_os = "none")]
impl From<VirtualAddress> for PageFrameNumber {
    fn from(virt: VirtualAddress) -> Self {
        Self(PhysicalAddress::from(virt).0 >> L1_PAGETABLE_SHIFT)
    }
}

// virt_to_mfn
#[cfg(target_os = "none")]
impl From<VirtualAddress> for MachineFrameNumber {
    fn from(virt: VirtualAddress) -> Self {
        Self::from(PageFrameNumber::from(virt))
    }
}

// to_virt
#[cfg(target_os = "none")]
impl From<PhysicalAddress> for VirtualAddress {
    fn from(phys: PhysicalAddress) -> Self {
        Self(phys.0 + text_start())
    }
}

// mfn_to_virt
#[cfg(target_os = "none")]
impl From<MachineFrameNumber> for VirtualAddress {
    fn from(mfn: MachineFrameNumber) -> Self {
        Self::from(PhysicalAddress(PageFrameNumber::from(mfn).0 << PAGE_SHIFT))
    }
}

// to_phys
#[cfg(target_os = "none")]
impl From<VirtualAddress> for PhysicalAddress {
    fn from(virt: VirtualAddress) -> Self {
        Self(virt.0 - text_start())
    }
}

// virt_to_mach
#[cfg(target_os = "none")]
impl From<VirtualAddress> for MachineAddress {
    fn from(virt: VirtualAddress) -> Self {
        let phys = PhysicalAddress::from(virt);
        let mfn = MachineFrameNumber::from(PageFrameNumber(phys.0 >> PAGE_SHIFT));
        Self((mfn.0 << PAGE_SHIFT) | (phys.0 & !PAGE_MASK))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_entry_round_trips_frame_number() {
        let entry = PageEntry::new(MachineFrameNumber(0x1234), 0x67);

        assert_eq!(entry.0 & 0xFFF, 0x67);
        assert_eq!(MachineFrameNumber::from(entry), MachineFrameNumber(0x1234));
    }
}
