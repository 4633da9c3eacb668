//! Platform-agnostic hypercall interface
//!
//! Every subsystem issues its hypercalls through the [`Hypervisor`] trait so
//! that it can be driven by a software hypervisor in host tests. [`Xen`] is
//! the implementation backed by the hypercall page.

use {
    core::convert::TryFrom,
    displaydoc::Display,
    xen_sys::hypercall_ret_t,
};

/// Software trap from a domain to the hypervisor used to request privileged operations
///
/// Evaluates to `Result<u64, hypercall::Error>`.
#[cfg(target_os = "none")]
#[macro_export]
macro_rules! hypercall {
    ($offset:expr) => {
        $crate::hypercall::Error::check($crate::platform::hypercall::hypercall0($offset))
    };
    ($offset:expr, $arg0:expr) => {
        $crate::hypercall::Error::check($crate::platform::hypercall::hypercall1(
            $offset,
            u64::from($arg0),
        ))
    };
    ($offset:expr, $arg0:expr, $arg1:expr) => {
        $crate::hypercall::Error::check($crate::platform::hypercall::hypercall2(
            $offset,
            u64::from($arg0),
            u64::from($arg1),
        ))
    };
    ($offset:expr, $arg0:expr, $arg1:expr, $arg2:expr) => {
        $crate::hypercall::Error::check($crate::platform::hypercall::hypercall3(
            $offset,
            u64::from($arg0),
            u64::from($arg1),
            u64::from($arg2),
        ))
    };
    ($offset:expr, $arg0:expr, $arg1:expr, $arg2:expr, $arg3:expr) => {
        $crate::hypercall::Error::check($crate::platform::hypercall::hypercall4(
            $offset,
            u64::from($arg0),
            u64::from($arg1),
            u64::from($arg2),
            u64::from($arg3),
        ))
    };
    ($offset:expr, $arg0:expr, $arg1:expr, $arg2:expr, $arg3:expr, $arg4:expr) => {
        $crate::hypercall::Error::check($crate::platform::hypercall::hypercall5(
            $offset,
            u64::from($arg0),
            u64::from($arg1),
            u64::from($arg2),
            u64::from($arg3),
            u64::from($arg4),
        ))
    };
}

/// Error returned by the hypervisor
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Operation not permitted
    NotPermitted,
    /// No such file or directory
    NoEntry,
    /// No such process
    NoSuchProcess,
    /// Interrupted system call
    Interrupted,
    /// I/O error
    Io,
    /// No such device or address
    NoDeviceOrAddress,
    /// Argument list too long
    ArgumentListTooLong,
    /// Try again
    TryAgain,
    /// Out of memory
    OutOfMemory,
    /// Permission denied
    PermissionDenied,
    /// Bad address
    BadAddress,
    /// Device or resource busy
    Busy,
    /// File exists
    Exists,
    /// No such device
    NoDevice,
    /// Invalid argument
    InvalidArgument,
    /// No space left on device
    NoSpace,
    /// Function not implemented
    NotImplemented,
    /// Unknown error code {0}
    Unknown(i64),
}

impl Error {
    /// Converts a raw hypercall return value, negative values being errors
    pub fn check(rc: hypercall_ret_t) -> Result<u64, Self> {
        let rc = i64::from(rc);

        match u64::try_from(rc) {
            Ok(value) => Ok(value),
            Err(_) => Err(Self::from_errno(-rc)),
        }
    }

    /// Maps a positive Xen errno value
    pub fn from_errno(errno: i64) -> Self {
        match errno {
            1 => Self::NotPermitted,
            2 => Self::NoEntry,
            3 => Self::NoSuchProcess,
            4 => Self::Interrupted,
            5 => Self::Io,
            6 => Self::NoDeviceOrAddress,
            7 => Self::ArgumentListTooLong,
            11 => Self::TryAgain,
            12 => Self::OutOfMemory,
            13 => Self::PermissionDenied,
            14 => Self::BadAddress,
            16 => Self::Busy,
            17 => Self::Exists,
            19 => Self::NoDevice,
            22 => Self::InvalidArgument,
            28 => Self::NoSpace,
            38 => Self::NotImplemented,
            e => Self::Unknown(e),
        }
    }

    /// Xen errno value of this error
    pub fn errno(&self) -> i64 {
        match self {
            Self::NotPermitted => 1,
            Self::NoEntry => 2,
            Self::NoSuchProcess => 3,
            Self::Interrupted => 4,
            Self::Io => 5,
            Self::NoDeviceOrAddress => 6,
            Self::ArgumentListTooLong => 7,
            Self::TryAgain => 11,
            Self::OutOfMemory => 12,
            Self::PermissionDenied => 13,
            Self::BadAddress => 14,
            Self::Busy => 16,
            Self::Exists => 17,
            Self::NoDevice => 19,
            Self::InvalidArgument => 22,
            Self::NoSpace => 28,
            Self::NotImplemented => 38,
            Self::Unknown(e) => *e,
        }
    }
}

/// Hypercalls used by the kernel core
///
/// Arguments are passed the way the hypercall ABI takes them: `arg` is the
/// address of the argument structure `cmd` expects.
pub trait Hypervisor: Send + Sync {
    /// `HYPERVISOR_event_channel_op`
    ///
    /// # Safety
    ///
    /// `arg` must point to a valid, writable argument structure for `cmd`
    unsafe fn event_channel_op(&self, cmd: u32, arg: u64) -> Result<u64, Error>;

    /// `HYPERVISOR_grant_table_op`
    ///
    /// # Safety
    ///
    /// `arg` must point to `count` valid, writable argument structures for `cmd`
    unsafe fn grant_table_op(&self, cmd: u32, arg: u64, count: u32) -> Result<u64, Error>;

    /// `HYPERVISOR_sched_op`
    ///
    /// # Safety
    ///
    /// `arg` must be zero or point to a valid argument structure for `cmd`
    unsafe fn sched_op(&self, cmd: u32, arg: u64) -> Result<u64, Error>;

    /// `HYPERVISOR_console_io`
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `len` bytes
    unsafe fn console_io(&self, cmd: u32, len: u32, buf: *mut u8) -> Result<u64, Error>;
}

/// Hypervisor reached through the hypercall page
#[cfg(target_os = "none")]
#[derive(Debug, Default, Clone, Copy)]
pub struct Xen;

#[cfg(target_os = "none")]
impl Hypervisor for Xen {
    unsafe fn event_channel_op(&self, cmd: u32, arg: u64) -> Result<u64, Error> {
        hypercall!(xen_sys::__HYPERVISOR_event_channel_op, cmd, arg)
    }

    unsafe fn grant_table_op(&self, cmd: u32, arg: u64, count: u32) -> Result<u64, Error> {
        hypercall!(xen_sys::__HYPERVISOR_grant_table_op, cmd, arg, count)
    }

    unsafe fn sched_op(&self, cmd: u32, arg: u64) -> Result<u64, Error> {
        hypercall!(xen_sys::__HYPERVISOR_sched_op, cmd, arg)
    }

    unsafe fn console_io(&self, cmd: u32, len: u32, buf: *mut u8) -> Result<u64, Error> {
        hypercall!(xen_sys::__HYPERVISOR_console_io, cmd, len, buf as u64)
    }
}
