use {
    crate::hypercall,
    displaydoc::Display,
    xen_sys::{
        GNTST_address_too_big, GNTST_bad_copy_arg, GNTST_bad_dev_addr, GNTST_bad_domain,
        GNTST_bad_gntref, GNTST_bad_handle, GNTST_bad_page, GNTST_bad_virt_addr, GNTST_eagain,
        GNTST_general_error, GNTST_no_device_space, GNTST_permission_denied,
    },
};

/// Grant table error
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Grant table hypercall failed: {0}
    Hypercall(hypercall::Error),
    /// Grant table operation returned status: {0}
    Status(GrantStatusError),
    /// No free grant references left
    Exhausted,
}

impl From<hypercall::Error> for Error {
    fn from(e: hypercall::Error) -> Self {
        Self::Hypercall(e)
    }
}

impl From<GrantStatusError> for Error {
    fn from(e: GrantStatusError) -> Self {
        Self::Status(e)
    }
}

/// Per-operation status reported by grant table hypercalls (`GNTST_*`)
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum GrantStatusError {
    /// general undefined error
    General,
    /// unrecognised domain id
    BadDomain,
    /// unrecognised or inappropriate grant reference
    BadGrantReference,
    /// unrecognised or inappropriate handle
    BadHandle,
    /// inappropriate virtual address to map
    BadVirtualAddress,
    /// inappropriate device address to unmap
    BadDeviceAddress,
    /// out of space in I/O MMU
    NoDeviceSpace,
    /// not enough privilege for operation
    PermissionDenied,
    /// specified page was invalid for op
    BadPage,
    /// copy arguments cross page boundary
    BadCopyArgument,
    /// page address size too large
    AddressTooBig,
    /// operation not done; try again
    Again,
    /// unknown status {0}
    Unknown(i16),
}

impl From<i16> for GrantStatusError {
    #[allow(non_upper_case_globals)]
    fn from(status: i16) -> Self {
        match status {
            GNTST_general_error => Self::General,
            GNTST_bad_domain => Self::BadDomain,
            GNTST_bad_gntref => Self::BadGrantReference,
            GNTST_bad_handle => Self::BadHandle,
            GNTST_bad_virt_addr => Self::BadVirtualAddress,
            GNTST_bad_dev_addr => Self::BadDeviceAddress,
            GNTST_no_device_space => Self::NoDeviceSpace,
            GNTST_permission_denied => Self::PermissionDenied,
            GNTST_bad_page => Self::BadPage,
            GNTST_bad_copy_arg => Self::BadCopyArgument,
            GNTST_address_too_big => Self::AddressTooBig,
            GNTST_eagain => Self::Again,
            s => Self::Unknown(s),
        }
    }
}

/// Turns a `GNTST_*` status into a result
pub(super) fn check_status(status: i16) -> Result<(), Error> {
    if status == 0 {
        Ok(())
    } else {
        Err(GrantStatusError::from(status).into())
    }
}
