//! Paging constants shared by every Xen guest architecture

/// Number of bits in a page offset
pub const PAGE_SHIFT: usize = 12;

/// Size of a page in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask selecting the page-aligned part of an address
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Shift of a frame number within an L1 page table entry
pub const L1_PAGETABLE_SHIFT: usize = PAGE_SHIFT;

/// Physical address bits usable in a page table entry
pub const PADDR_MASK: usize = (1 << 52) - 1;

/// Present bit of a page table entry
pub const PAGE_PRESENT: usize = 0x001;

/// Writable bit of a page table entry
pub const PAGE_RW: usize = 0x002;

/// User-accessible bit of a page table entry
pub const PAGE_USER: usize = 0x004;

/// Accessed bit of a page table entry
pub const PAGE_ACCESSED: usize = 0x020;

/// Dirty bit of a page table entry
pub const PAGE_DIRTY: usize = 0x040;

/// Protection bits for kernel data pages
pub const L1_PROT: usize = PAGE_PRESENT | PAGE_RW | PAGE_ACCESSED;
