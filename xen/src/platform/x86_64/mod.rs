//! x86_64 platform code

pub mod hypercall;
pub mod time;
