//! The control message buffer used for descriptor passing.
//!
//! Only a single `SCM_RIGHTS` message carrying a single descriptor is ever sent or accepted. The
//! position and width of every header field is taken from the platform's `cmsghdr` rather than
//! assumed, so that the same code serves targets where `cmsg_len` is a `size_t` and targets where
//! it's a `socklen_t`.

use {
    libc::{c_int, c_uint, cmsghdr, SCM_RIGHTS, SOL_SOCKET},
    std::{
        mem::{align_of, offset_of, size_of},
        os::fd::RawFd,
    },
};

cfg_if::cfg_if! {
    if #[cfg(uds_cmsghdr_len_size_t)] {
        type CmsgLen = libc::size_t;
    } else {
        type CmsgLen = libc::socklen_t;
    }
}

/// Value of the descriptor slot in a receive buffer before the kernel fills it in.
pub(crate) const NO_FD: RawFd = -1;

const FD_SIZE: usize = size_of::<RawFd>();

/// Size of the control buffer: room for one header and one descriptor, padded as the platform
/// requires.
#[allow(clippy::as_conversions)]
pub(crate) const CONTROL_LEN: usize = unsafe { libc::CMSG_SPACE(FD_SIZE as c_uint) } as usize;
/// Value of `cmsg_len` for a message carrying one descriptor.
#[allow(clippy::as_conversions)]
const CMSG_LEN_ONE_FD: usize = unsafe { libc::CMSG_LEN(FD_SIZE as c_uint) } as usize;
#[allow(clippy::as_conversions)]
const DATA_OFFSET: usize = unsafe { libc::CMSG_LEN(0) } as usize;

const LEN_OFFSET: usize = offset_of!(cmsghdr, cmsg_len);
const LEVEL_OFFSET: usize = offset_of!(cmsghdr, cmsg_level);
const TYPE_OFFSET: usize = offset_of!(cmsghdr, cmsg_type);

const _: () = {
    assert!(LEN_OFFSET + size_of::<CmsgLen>() <= LEVEL_OFFSET, "cmsg_len overlaps cmsg_level");
    assert!(DATA_OFFSET + FD_SIZE <= CONTROL_LEN, "descriptor does not fit into the buffer");
    assert!(align_of::<cmsghdr>() <= align_of::<ControlBuffer>(), "control buffer underaligned");
};

#[repr(C, align(8))]
#[derive(Copy, Clone)]
struct ControlBuffer([u8; CONTROL_LEN]);

/// An aligned control buffer holding one `SCM_RIGHTS` message.
#[derive(Copy, Clone)]
pub(crate) struct AncillaryMessage {
    buf: ControlBuffer,
}
impl AncillaryMessage {
    /// A message that transfers `fd`.
    pub(crate) fn for_send(fd: RawFd) -> Self {
        let mut msg = Self { buf: ControlBuffer([0; CONTROL_LEN]) };
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
        msg.put(LEN_OFFSET, &(CMSG_LEN_ONE_FD as CmsgLen).to_ne_bytes());
        msg.put(LEVEL_OFFSET, &SOL_SOCKET.to_ne_bytes());
        msg.put(TYPE_OFFSET, &SCM_RIGHTS.to_ne_bytes());
        msg.put(DATA_OFFSET, &fd.to_ne_bytes());
        msg
    }
    /// An empty buffer for `recvmsg` to fill in. The descriptor slot holds [`NO_FD`].
    pub(crate) fn for_receive() -> Self {
        let mut msg = Self { buf: ControlBuffer([0; CONTROL_LEN]) };
        msg.put(DATA_OFFSET, &NO_FD.to_ne_bytes());
        msg
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 { self.buf.0.as_mut_ptr() }

    /// Lists the descriptors in a buffer filled in by `recvmsg`, given the returned
    /// `msg_controllen`.
    ///
    /// Yields nothing if no `SCM_RIGHTS` message arrived. A message carrying more than one
    /// descriptor yields every one of them that fit into the buffer, since the kernel has already
    /// installed those and they have to be closed by someone.
    pub(crate) fn received_fds(&self, controllen: usize) -> impl Iterator<Item = RawFd> + '_ {
        let len = self.get(LEN_OFFSET).map(CmsgLen::from_ne_bytes);
        let level = self.get(LEVEL_OFFSET).map(c_int::from_ne_bytes);
        let ty = self.get(TYPE_OFFSET).map(c_int::from_ne_bytes);
        let rights =
            controllen >= DATA_OFFSET && level == Some(SOL_SOCKET) && ty == Some(SCM_RIGHTS);
        #[allow(clippy::as_conversions)]
        let end = match len {
            Some(len) if rights => (len as usize).min(controllen).min(CONTROL_LEN),
            _ => DATA_OFFSET,
        };
        let count = end.saturating_sub(DATA_OFFSET) / FD_SIZE;
        (0..count)
            .filter_map(move |i| self.get(DATA_OFFSET.saturating_add(i * FD_SIZE)))
            .map(RawFd::from_ne_bytes)
            .filter(|&fd| fd != NO_FD)
    }

    fn put(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset.saturating_add(bytes.len());
        if let Some(dst) = self.buf.0.get_mut(offset..end) {
            dst.copy_from_slice(bytes);
        }
    }
    fn get<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        self.buf.0.get(offset..offset.saturating_add(N))?.try_into().ok()
    }
}
