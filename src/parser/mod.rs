use std::fmt;

mod ascii;
pub(crate) use ascii::parse_ascii_response;

/// A value returned by a memcached backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    /// The key of the item.
    pub key: Vec<u8>,
    /// CAS identifier, when the backend sent one.
    pub cas: Option<u64>,
    /// Client-defined flags stored alongside the item.
    pub flags: u32,
    /// The payload.
    pub data: Vec<u8>,
}

/// Status of a backend reply.
#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    /// The value was stored.
    Stored,
    /// The value was not stored, but not because of an error.
    NotStored,
    /// The key was deleted.
    Deleted,
    /// The key was not found.
    NotFound,
    /// An error occurred for the given operation.
    Error(ErrorKind),
}

/// Errors related to a backend operation.
#[derive(Clone, Debug, PartialEq)]
pub enum ErrorKind {
    /// The command sent by the client does not exist.
    NonexistentCommand,
    /// Protocol-level error i.e. an invalid response from the backend for the given operation.
    Protocol(Option<String>),
    /// An error from the backend about the request the client sent.
    Client(String),
    /// An error from the backend itself.
    Server(String),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Response {
    Status(Status),
    Data(Option<Vec<Value>>),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Stored => write!(f, "stored"),
            Self::NotStored => write!(f, "not stored"),
            Self::Deleted => write!(f, "deleted"),
            Self::NotFound => write!(f, "not found"),
            Self::Error(ek) => write!(f, "error: {}", ek),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::NonexistentCommand => write!(f, "command does not exist"),
            Self::Protocol(Some(s)) => write!(f, "protocol: {}", s),
            Self::Protocol(None) => write!(f, "protocol"),
            Self::Client(s) => write!(f, "client: {}", s),
            Self::Server(s) => write!(f, "server: {}", s),
        }
    }
}
