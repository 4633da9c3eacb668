//! Addresses of the kernel image, from symbols defined by the linker script

/// Returns the address of the start of the `.text` section
#[inline]
pub fn text_start() -> usize {
    extern "C" {
        static mut _text: u8;
    }

    unsafe { &_text as *const u8 as usize }
}

/// Returns the address of the end of the kernel image
#[inline]
pub fn end() -> usize {
    extern "C" {
        static mut _end: u8;
    }

    unsafe { &_end as *const u8 as usize }
}
