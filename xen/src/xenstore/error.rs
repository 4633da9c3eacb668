use {crate::events, alloc::string::String, displaydoc::Display};

/// XenStore error
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum Error {
    /// XenStore replied with {0}
    Remote(String),
    /// Request payload of {0} bytes does not fit the ring
    TooLarge(usize),
    /// Reply does not match its request
    Malformed,
    /// Reply is not valid UTF-8
    Utf8,
    /// No watch registered with token {0}
    UnknownWatch(String),
    /// Value {0} is not an integer
    InvalidInteger(String),
    /// Value {0} is not a XenBus state
    InvalidState(u32),
    /// Binding the XenStore port failed: {0}
    Event(events::Error),
}

impl From<events::Error> for Error {
    fn from(e: events::Error) -> Self {
        Self::Event(e)
    }
}

impl Error {
    /// Whether this is the errno reply `name`, such as `"ENOENT"`
    pub fn is_remote(&self, name: &str) -> bool {
        matches!(self, Error::Remote(remote) if remote == name)
    }
}
