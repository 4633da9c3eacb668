//! Kernel heap

use {buddy_system_allocator::LockedHeap, core::ptr::addr_of_mut};

/// Size of the kernel heap
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

#[repr(C, align(4096))]
struct Arena([u8; HEAP_SIZE]);

static mut ARENA: Arena = Arena([0; HEAP_SIZE]);

/// Kernel heap allocator
#[global_allocator]
pub static ALLOCATOR: LockedHeap<32> = LockedHeap::<32>::empty();

/// Hands the heap arena to the allocator, must run before anything allocates
pub fn init() {
    // SAFETY: the arena is only ever touched through the allocator
    let start = unsafe { addr_of_mut!(ARENA) } as usize;

    unsafe { ALLOCATOR.lock().init(start, HEAP_SIZE) };
}
