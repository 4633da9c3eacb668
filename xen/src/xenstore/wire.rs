//! XenStore message framing and the values carried in it

use {
    core::convert::TryFrom,
    xen_sys::{
        xenbus_state_XenbusStateClosed, xenbus_state_XenbusStateClosing,
        xenbus_state_XenbusStateConnected, xenbus_state_XenbusStateInitWait,
        xenbus_state_XenbusStateInitialised, xenbus_state_XenbusStateInitialising,
        xenbus_state_XenbusStateReconfigured, xenbus_state_XenbusStateReconfiguring,
        xenbus_state_XenbusStateUnknown, xsd_sockmsg_type_XS_CONTROL,
        xsd_sockmsg_type_XS_DIRECTORY, xsd_sockmsg_type_XS_DIRECTORY_PART,
        xsd_sockmsg_type_XS_ERROR, xsd_sockmsg_type_XS_GET_DOMAIN_PATH,
        xsd_sockmsg_type_XS_GET_PERMS, xsd_sockmsg_type_XS_INTRODUCE,
        xsd_sockmsg_type_XS_IS_DOMAIN_INTRODUCED, xsd_sockmsg_type_XS_MKDIR,
        xsd_sockmsg_type_XS_READ, xsd_sockmsg_type_XS_RELEASE, xsd_sockmsg_type_XS_RESET_WATCHES,
        xsd_sockmsg_type_XS_RESUME, xsd_sockmsg_type_XS_RM, xsd_sockmsg_type_XS_SET_PERMS,
        xsd_sockmsg_type_XS_SET_TARGET, xsd_sockmsg_type_XS_TRANSACTION_END,
        xsd_sockmsg_type_XS_TRANSACTION_START, xsd_sockmsg_type_XS_UNWATCH,
        xsd_sockmsg_type_XS_WATCH, xsd_sockmsg_type_XS_WATCH_EVENT, xsd_sockmsg_type_XS_WRITE,
    },
};

/// Size of the header preceding every message
pub const HEADER_SIZE: usize = 16;

/// Transaction identifier, `XBT_NIL` outside of transactions
pub type TransactionId = u32;

/// Operations that are not part of a transaction
pub const XBT_NIL: TransactionId = 0;

/// Message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Control command, also carries debug output
    Control,
    /// List the children of a node
    Directory,
    /// List part of the children of a node
    DirectoryPart,
    /// Read a node
    Read,
    /// Read the permissions of a node
    GetPerms,
    /// Register a watch
    Watch,
    /// Remove a watch
    Unwatch,
    /// Open a transaction
    TransactionStart,
    /// Commit or abort a transaction
    TransactionEnd,
    /// Introduce a domain to the store
    Introduce,
    /// Release a domain
    Release,
    /// Home path of a domain
    GetDomainPath,
    /// Write a node
    Write,
    /// Create a node
    MakeDirectory,
    /// Remove a node and its children
    Remove,
    /// Set the permissions of a node
    SetPerms,
    /// Asynchronous notification that a watched node changed
    WatchEvent,
    /// Error reply, the payload names the errno
    Error,
    /// Whether a domain was introduced
    IsDomainIntroduced,
    /// Resume a domain
    Resume,
    /// Give a domain privileges over another
    SetTarget,
    /// Remove every watch of the caller
    ResetWatches,
    /// Any value this client does not know
    Invalid,
}

impl From<u32> for Kind {
    #[allow(non_upper_case_globals)]
    fn from(value: u32) -> Self {
        match value {
            xsd_sockmsg_type_XS_CONTROL => Kind::Control,
            xsd_sockmsg_type_XS_DIRECTORY => Kind::Directory,
            xsd_sockmsg_type_XS_READ => Kind::Read,
            xsd_sockmsg_type_XS_GET_PERMS => Kind::GetPerms,
            xsd_sockmsg_type_XS_WATCH => Kind::Watch,
            xsd_sockmsg_type_XS_UNWATCH => Kind::Unwatch,
            xsd_sockmsg_type_XS_TRANSACTION_START => Kind::TransactionStart,
            xsd_sockmsg_type_XS_TRANSACTION_END => Kind::TransactionEnd,
            xsd_sockmsg_type_XS_INTRODUCE => Kind::Introduce,
            xsd_sockmsg_type_XS_RELEASE => Kind::Release,
            xsd_sockmsg_type_XS_GET_DOMAIN_PATH => Kind::GetDomainPath,
            xsd_sockmsg_type_XS_WRITE => Kind::Write,
            xsd_sockmsg_type_XS_MKDIR => Kind::MakeDirectory,
            xsd_sockmsg_type_XS_RM => Kind::Remove,
            xsd_sockmsg_type_XS_SET_PERMS => Kind::SetPerms,
            xsd_sockmsg_type_XS_WATCH_EVENT => Kind::WatchEvent,
            xsd_sockmsg_type_XS_ERROR => Kind::Error,
            xsd_sockmsg_type_XS_IS_DOMAIN_INTRODUCED => Kind::IsDomainIntroduced,
            xsd_sockmsg_type_XS_RESUME => Kind::Resume,
            xsd_sockmsg_type_XS_SET_TARGET => Kind::SetTarget,
            xsd_sockmsg_type_XS_RESET_WATCHES => Kind::ResetWatches,
            xsd_sockmsg_type_XS_DIRECTORY_PART => Kind::DirectoryPart,
            _ => Kind::Invalid,
        }
    }
}

impl From<Kind> for u32 {
    fn from(k: Kind) -> Self {
        match k {
            Kind::Control => xsd_sockmsg_type_XS_CONTROL,
            Kind::Directory => xsd_sockmsg_type_XS_DIRECTORY,
            Kind::Read => xsd_sockmsg_type_XS_READ,
            Kind::GetPerms => xsd_sockmsg_type_XS_GET_PERMS,
            Kind::Watch => xsd_sockmsg_type_XS_WATCH,
            Kind::Unwatch => xsd_sockmsg_type_XS_UNWATCH,
            Kind::TransactionStart => xsd_sockmsg_type_XS_TRANSACTION_START,
            Kind::TransactionEnd => xsd_sockmsg_type_XS_TRANSACTION_END,
            Kind::Introduce => xsd_sockmsg_type_XS_INTRODUCE,
            Kind::Release => xsd_sockmsg_type_XS_RELEASE,
            Kind::GetDomainPath => xsd_sockmsg_type_XS_GET_DOMAIN_PATH,
            Kind::Write => xsd_sockmsg_type_XS_WRITE,
            Kind::MakeDirectory => xsd_sockmsg_type_XS_MKDIR,
            Kind::Remove => xsd_sockmsg_type_XS_RM,
            Kind::SetPerms => xsd_sockmsg_type_XS_SET_PERMS,
            Kind::WatchEvent => xsd_sockmsg_type_XS_WATCH_EVENT,
            Kind::Error => xsd_sockmsg_type_XS_ERROR,
            Kind::IsDomainIntroduced => xsd_sockmsg_type_XS_IS_DOMAIN_INTRODUCED,
            Kind::Resume => xsd_sockmsg_type_XS_RESUME,
            Kind::SetTarget => xsd_sockmsg_type_XS_SET_TARGET,
            Kind::ResetWatches => xsd_sockmsg_type_XS_RESET_WATCHES,
            Kind::DirectoryPart => xsd_sockmsg_type_XS_DIRECTORY_PART,
            Kind::Invalid => 0xFFFF,
        }
    }
}

/// Header of a XenStore message, `len` bytes of payload follow it on the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type
    pub kind: Kind,
    /// Request ID, echoed in the reply
    pub request_id: u32,
    /// Transaction ID
    pub transaction_id: TransactionId,
    /// Payload length
    pub len: u32,
}

impl MessageHeader {
    /// Encodes the header in the layout of `xsd_sockmsg`
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];

        bytes[0..4].copy_from_slice(&u32::from(self.kind).to_ne_bytes());
        bytes[4..8].copy_from_slice(&self.request_id.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.transaction_id.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.len.to_ne_bytes());

        bytes
    }

    /// Decodes a header read from the ring
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let word = |i: usize| u32::from_ne_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        Self {
            kind: Kind::from(word(0)),
            request_id: word(4),
            transaction_id: word(8),
            len: word(12),
        }
    }
}

/// State of a XenBus device, as stored in its `state` node
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Initial state of the device on the bus, before either end has been connected
    Unknown = xenbus_state_XenbusStateUnknown,
    /// Backend is in process of initializing itself
    Initialising = xenbus_state_XenbusStateInitialising,
    /// Entered by the back end while it is waiting for information before completing initialization
    InitWait = xenbus_state_XenbusStateInitWait,
    /// Backend is now ready for connection
    Initialised = xenbus_state_XenbusStateInitialised,
    /// Normal state of the bus
    Connected = xenbus_state_XenbusStateConnected,
    /// Device has become unavailable, backend is no longer doing useful work
    Closing = xenbus_state_XenbusStateClosing,
    /// Both halves of driver have disconnected
    Closed = xenbus_state_XenbusStateClosed,
    /// Device is being reconfigured
    Reconfiguring = xenbus_state_XenbusStateReconfiguring,
    /// Device reconfiguring has finished
    Reconfigured = xenbus_state_XenbusStateReconfigured,
}

impl TryFrom<u32> for State {
    type Error = u32;

    #[allow(non_upper_case_globals)]
    fn try_from(value: u32) -> Result<Self, u32> {
        Ok(match value {
            xenbus_state_XenbusStateUnknown => State::Unknown,
            xenbus_state_XenbusStateInitialising => State::Initialising,
            xenbus_state_XenbusStateInitWait => State::InitWait,
            xenbus_state_XenbusStateInitialised => State::Initialised,
            xenbus_state_XenbusStateConnected => State::Connected,
            xenbus_state_XenbusStateClosing => State::Closing,
            xenbus_state_XenbusStateClosed => State::Closed,
            xenbus_state_XenbusStateReconfiguring => State::Reconfiguring,
            xenbus_state_XenbusStateReconfigured => State::Reconfigured,
            _ => return Err(value),
        })
    }
}

/// Access granted to a domain by `set_perms`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// No access
    None,
    /// Read only
    Read,
    /// Write only
    Write,
    /// Read and write
    Both,
}

impl Permission {
    /// Letter used for the permission on the wire
    pub fn as_char(self) -> char {
        match self {
            Permission::None => 'n',
            Permission::Read => 'r',
            Permission::Write => 'w',
            Permission::Both => 'b',
        }
    }
}

/// Splits a NUL separated payload into its non-empty parts
pub(super) fn split_strings(payload: &[u8]) -> impl Iterator<Item = &[u8]> {
    payload.split(|b| *b == 0).filter(|part| !part.is_empty())
}

/// Payload without its terminating NUL, if any
pub(super) fn trim_nul(payload: &[u8]) -> &[u8] {
    match payload.split_last() {
        Some((0, rest)) => rest,
        _ => payload,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, alloc::vec::Vec, xen_sys::xsd_sockmsg};

    #[test]
    fn header_matches_sockmsg_layout() {
        let header = MessageHeader {
            kind: Kind::Write,
            request_id: 3,
            transaction_id: 9,
            len: 21,
        };

        let bytes = header.to_bytes();
        let raw = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const xsd_sockmsg) };

        assert_eq!(raw.type_, xsd_sockmsg_type_XS_WRITE);
        assert_eq!(raw.req_id, 3);
        assert_eq!(raw.tx_id, 9);
        assert_eq!(raw.len, 21);
        assert_eq!(MessageHeader::from_bytes(&bytes), header);
    }

    #[test]
    fn unknown_kinds_decode_as_invalid() {
        assert_eq!(Kind::from(20), Kind::Invalid);
        assert_eq!(Kind::from(xsd_sockmsg_type_XS_ERROR), Kind::Error);
        assert_eq!(u32::from(Kind::Control), 0);
    }

    #[test]
    fn states_follow_xenbus_numbering() {
        assert_eq!(State::Connected as u32, 4);
        assert_eq!(State::try_from(6), Ok(State::Closed));
        assert_eq!(State::try_from(9), Err(9));
    }

    #[test]
    fn payload_helpers() {
        let parts = split_strings(b"backend\0device\0\0").collect::<Vec<_>>();
        assert_eq!(parts, vec![&b"backend"[..], &b"device"[..]]);

        assert_eq!(trim_nul(b"4\0"), b"4");
        assert_eq!(trim_nul(b"4"), b"4");
        assert_eq!(trim_nul(b""), b"");
    }
}
