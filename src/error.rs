//! Error types of the socket creation, addressing and descriptor exchange operations.
//!
//! Every error type here carries the underlying [`io::Error`] (and thus the OS error code, where
//! there is one) and, for the operations that take a path, the path that was attempted. All of
//! them convert into [`io::Error`] losslessly, so `?` works in functions returning
//! [`io::Result`].
//!
//! Would-block conditions never appear in these types: they are absorbed by reactor
//! registrations.

use std::{
    error::Error,
    fmt::{self, Debug, Display, Formatter},
    io,
    path::{Path, PathBuf},
};

/// What made a path unencodable as a socket address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressEncodingErrorKind {
    /// The path, together with its nul terminator, does not fit into the path field of the
    /// platform's socket address structure.
    TooLong {
        /// Length of the path in bytes, excluding the terminator.
        len: usize,
        /// Capacity of the path field in bytes, including space for the terminator.
        capacity: usize,
    },
    /// The path contains a nul byte, which would terminate it early.
    InteriorNul {
        /// Offset of the first nul byte.
        position: usize,
    },
}

/// A path could not be encoded into a socket address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressEncodingError {
    pub(crate) path: PathBuf,
    pub(crate) kind: AddressEncodingErrorKind,
}
impl AddressEncodingError {
    /// The path that failed to encode.
    #[inline]
    pub fn path(&self) -> &Path { &self.path }
    /// What went wrong.
    #[inline]
    pub fn kind(&self) -> AddressEncodingErrorKind { self.kind }
}
impl Display for AddressEncodingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            AddressEncodingErrorKind::TooLong { len, capacity } => write!(
                f,
                "socket path {:?} is {len} bytes long, which exceeds the capacity of sun_path \
                ({capacity} bytes including the terminator)",
                self.path
            ),
            AddressEncodingErrorKind::InteriorNul { position } => {
                write!(f, "socket path {:?} contains a nul byte at offset {position}", self.path)
            }
        }
    }
}
impl Error for AddressEncodingError {}
impl From<AddressEncodingError> for io::Error {
    fn from(e: AddressEncodingError) -> Self { io::Error::new(io::ErrorKind::InvalidInput, e) }
}

macro_rules! os_error {
    ($(#[doc = $doc:literal])* $name:ident, $msg:literal) => {
        $(#[doc = $doc])*
        #[derive(Debug)]
        pub struct $name {
            pub(crate) source: io::Error,
        }
        impl $name {
            /// The raw OS error code, if the failure came from a system call.
            #[inline]
            pub fn raw_os_error(&self) -> Option<i32> { self.source.raw_os_error() }
            /// The kind of the underlying I/O error.
            #[inline]
            pub fn io_kind(&self) -> io::ErrorKind { self.source.kind() }
            /// Unwraps into the underlying I/O error.
            #[inline]
            pub fn into_io(self) -> io::Error { self.source }
        }
        impl From<io::Error> for $name {
            #[inline]
            fn from(source: io::Error) -> Self { Self { source } }
        }
        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, concat!($msg, ": {}"), self.source)
            }
        }
        impl Error for $name {
            fn source(&self) -> Option<&(dyn Error + 'static)> { Some(&self.source) }
        }
        impl From<$name> for io::Error {
            #[inline]
            fn from(e: $name) -> Self { e.source }
        }
    };
}

macro_rules! path_error {
    ($(#[doc = $doc:literal])* $name:ident, $verb:literal) => {
        $(#[doc = $doc])*
        #[derive(Debug)]
        pub struct $name {
            pub(crate) path: PathBuf,
            pub(crate) source: io::Error,
        }
        impl $name {
            pub(crate) fn new(path: &Path, source: impl Into<io::Error>) -> Self {
                Self { path: path.to_owned(), source: source.into() }
            }
            /// The path that the operation was attempted with.
            #[inline]
            pub fn path(&self) -> &Path { &self.path }
            /// The raw OS error code, if the failure came from a system call.
            ///
            /// This is `None` if the path could not be encoded into a socket address or if the
            /// endpoint was in the wrong state for the operation.
            #[inline]
            pub fn raw_os_error(&self) -> Option<i32> { self.source.raw_os_error() }
            /// The kind of the underlying I/O error.
            #[inline]
            pub fn io_kind(&self) -> io::ErrorKind { self.source.kind() }
            /// Returns the address encoding error that caused this one, if that's what happened.
            pub fn address_error(&self) -> Option<&AddressEncodingError> {
                self.source.get_ref()?.downcast_ref()
            }
            /// Unwraps into the underlying I/O error.
            #[inline]
            pub fn into_io(self) -> io::Error { self.source }
        }
        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, concat!("failed to ", $verb, " {:?}: {}"), self.path, self.source)
            }
        }
        impl Error for $name {
            fn source(&self) -> Option<&(dyn Error + 'static)> { Some(&self.source) }
        }
        impl From<$name> for io::Error {
            fn from(e: $name) -> Self { io::Error::new(e.source.kind(), e) }
        }
    };
}

os_error! {
    /// Allocation of a socket descriptor, or switching it into nonblocking mode, failed.
    SocketCreationError, "failed to create local socket"
}
os_error! {
    /// Sending a file descriptor failed for a reason other than a full socket buffer.
    SendDescriptorError, "failed to send file descriptor"
}
os_error! {
    /// Receiving a file descriptor failed for a reason other than an empty socket buffer.
    ReceiveDescriptorError, "failed to receive file descriptor"
}

path_error! {
    /// Binding an endpoint to a path failed.
    BindError, "bind local socket to"
}
path_error! {
    /// Connecting an endpoint to a path failed.
    ConnectError, "connect local socket to"
}

#[cold]
pub(crate) fn wrong_state(op: &str, state: impl Debug) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("cannot {op} an endpoint in state {state:?}"))
}
