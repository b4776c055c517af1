//! Encoding of filesystem paths into `sockaddr_un` byte layouts, and back.
//!
//! Two incompatible layouts of `sockaddr_un` exist across Unix-like systems:
//!
//! | Offset | Width | [`FamilyTagged`] (Linux, Solaris) | [`LengthPrefixed`] (BSD, macOS, Haiku) |
//! |--------|-------|-----------------------------------|----------------------------------------|
//! | 0      | 1     | `sun_family`, low byte            | `sun_len`: total address length        |
//! | 1      | 1     | `sun_family`, high byte           | `sun_family`                           |
//! | 2      | *n*   | path bytes                        | path bytes                             |
//! | 2 + *n*| 1     | nul terminator                    | nul terminator                         |
//!
//! The family tag of [`FamilyTagged`] is a 16-bit value stored in native byte order, which is
//! little-endian on every target where that layout is in use in practice. [`NativeLayout`] is
//! the strategy selected by the build script for the target platform, and the free functions
//! [`encode`] and [`decode`] use it.
//!
//! Nothing in this module performs I/O.

use {
    crate::error::{AddressEncodingError, AddressEncodingErrorKind},
    libc::{sockaddr_un, socklen_t},
    std::{
        ffi::OsStr,
        fmt::{self, Debug, Formatter},
        mem::{size_of, zeroed},
        os::unix::ffi::OsStrExt,
        path::{Path, PathBuf},
    },
};

/// Size of the family header that precedes the path in both layouts.
pub const HEADER_LEN: usize = 2;

/// Capacity of the `sun_path` field on the target platform, terminator included.
pub const SUN_PATH_LEN: usize = {
    let sun = unsafe { zeroed::<sockaddr_un>() };
    sun.sun_path.len()
};

/// Capacity of a [`RawAddress`]: the size of `sockaddr_un` on the target platform.
pub const RAW_ADDR_CAPACITY: usize = HEADER_LEN + SUN_PATH_LEN;

/// Upper bound on how far [`decode`] scans for a nul terminator.
pub const DECODE_SCAN_LIMIT: usize = 1024;

const _: () = assert!(
    RAW_ADDR_CAPACITY == size_of::<sockaddr_un>(),
    "unsupported sockaddr_un layout"
);
#[cfg(uds_sockaddr_un_len_108)]
const _: () = assert!(SUN_PATH_LEN == 108, "build script disagrees with libc on sun_path");
#[cfg(uds_sockaddr_un_len_104)]
const _: () = assert!(SUN_PATH_LEN == 104, "build script disagrees with libc on sun_path");
#[cfg(uds_sockaddr_un_len_126)]
const _: () = assert!(SUN_PATH_LEN == 126, "build script disagrees with libc on sun_path");

#[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
const AF_UNIX: u16 = libc::AF_UNIX as u16;

/// A path encoded as a `sockaddr_un`, plus the exact length to pass alongside it to `bind` or
/// `connect`.
///
/// The length covers the header, the path and its nul terminator.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct RawAddress {
    bytes: [u8; RAW_ADDR_CAPACITY],
    len: usize,
}
impl RawAddress {
    /// The encoded address, exactly as long as its declared length.
    #[inline]
    #[allow(clippy::indexing_slicing)] // len <= capacity
    pub fn as_bytes(&self) -> &[u8] { &self.bytes[..self.len] }
    /// The declared length of the address.
    #[inline]
    pub fn len(&self) -> usize { self.len }
    /// Whether the address is empty. Encoded addresses never are.
    #[inline]
    pub fn is_empty(&self) -> bool { self.len == 0 }
    #[inline]
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    pub(crate) fn socklen(&self) -> socklen_t { self.len as socklen_t }
}
impl Debug for RawAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawAddress")
            .field("bytes", &self.as_bytes())
            .field("len", &self.len)
            .finish()
    }
}

/// A `sockaddr_un` layout strategy.
///
/// Implementors only describe the two header bytes; the path field is laid out identically by
/// every strategy.
pub trait AddressLayout {
    /// Writes the family header for an address whose total length (header, path and terminator)
    /// is `total_len`.
    fn write_header(&self, header: &mut [u8; HEADER_LEN], total_len: usize);

    /// Encodes `path` as a nul-terminated string following the family header.
    ///
    /// Fails if the path contains a nul byte, or if the path and its terminator do not fit into
    /// `sun_path`. Nothing is allocated on failure other than the error itself.
    fn encode(&self, path: &Path) -> Result<RawAddress, AddressEncodingError> {
        let bytes = path.as_os_str().as_bytes();
        let err = |kind| AddressEncodingError { path: path.to_owned(), kind };
        if bytes.len() >= SUN_PATH_LEN {
            return Err(err(AddressEncodingErrorKind::TooLong {
                len: bytes.len(),
                capacity: SUN_PATH_LEN,
            }));
        }
        if let Some(position) = bytes.iter().position(|&b| b == 0) {
            return Err(err(AddressEncodingErrorKind::InteriorNul { position }));
        }

        // Cannot overflow: the path is shorter than SUN_PATH_LEN
        #[allow(clippy::arithmetic_side_effects)]
        let total_len = HEADER_LEN + bytes.len() + 1;
        let mut raw = RawAddress { bytes: [0; RAW_ADDR_CAPACITY], len: total_len };
        let (header, rest) = raw.bytes.split_at_mut(HEADER_LEN);
        if let Ok(header) = <&mut [u8; HEADER_LEN]>::try_from(header) {
            self.write_header(header, total_len);
        }
        // The terminator is already there thanks to zero-initialization.
        if let Some(dst) = rest.get_mut(..bytes.len()) {
            dst.copy_from_slice(bytes);
        }
        Ok(raw)
    }

    /// Reads the path out of an address buffer.
    ///
    /// The path is everything from the start of the path field up to the first nul byte, the end
    /// of the buffer or [`DECODE_SCAN_LIMIT`] bytes, whichever comes first. A buffer with no path
    /// in it, such as the one returned for an unnamed socket, decodes to an empty path.
    fn decode(&self, buffer: &[u8]) -> PathBuf {
        let Some(path_field) = buffer.get(HEADER_LEN..) else { return PathBuf::new() };
        let scan = path_field.get(..DECODE_SCAN_LIMIT).unwrap_or(path_field);
        let end = scan.iter().position(|&b| b == 0).unwrap_or(scan.len());
        let path = scan.get(..end).unwrap_or_default();
        PathBuf::from(OsStr::from_bytes(path))
    }
}

/// Two-byte family tag, no length byte.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FamilyTagged;
impl AddressLayout for FamilyTagged {
    #[inline]
    fn write_header(&self, header: &mut [u8; HEADER_LEN], _total_len: usize) {
        *header = AF_UNIX.to_ne_bytes();
    }
}

/// One-byte total length prefix followed by a one-byte family tag.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LengthPrefixed;
impl AddressLayout for LengthPrefixed {
    #[inline]
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    fn write_header(&self, header: &mut [u8; HEADER_LEN], total_len: usize) {
        // RAW_ADDR_CAPACITY is well below 256 on every platform with this layout
        *header = [u8::try_from(total_len).unwrap_or(u8::MAX), AF_UNIX as u8];
    }
}

cfg_if::cfg_if! {
    if #[cfg(uds_sun_len)] {
        /// The address layout of the target platform.
        pub type NativeLayout = LengthPrefixed;
        /// The address layout strategy of the target platform.
        pub const NATIVE: NativeLayout = LengthPrefixed;
    } else {
        /// The address layout of the target platform.
        pub type NativeLayout = FamilyTagged;
        /// The address layout strategy of the target platform.
        pub const NATIVE: NativeLayout = FamilyTagged;
    }
}

/// Encodes `path` using the [native layout](NativeLayout).
#[inline]
pub fn encode(path: impl AsRef<Path>) -> Result<RawAddress, AddressEncodingError> {
    NATIVE.encode(path.as_ref())
}
/// Decodes a raw address buffer returned by the OS using the [native layout](NativeLayout).
#[inline]
pub fn decode(buffer: &[u8]) -> PathBuf { NATIVE.decode(buffer) }
