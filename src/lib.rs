#![doc = include_str!("../README.md")]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]
// If this was in Cargo.toml, it would cover examples as well
#![warn(
    missing_docs,
    clippy::panic_in_result_fn,
    clippy::missing_assert_message,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
#![cfg(uds_supported)]

#[macro_use]
mod macros;

mod c_wrappers;
mod misc;
pub(crate) use misc::*;

pub mod addr;
pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod pending;
pub mod reactor;

#[cfg(feature = "tokio")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "tokio")))]
pub mod tokio;

pub use {
    endpoint::{options::ConnectOptions, Endpoint, EndpointState},
    pending::PendingOperation,
    reactor::{poll::PollReactor, Interest, Readiness, Reactor, Registration, Timer},
};

/// Describes how a client connection operation should wait for the server to accept it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectWaitMode {
    /// Readiness is awaited for up to the given amount of time. If the connection does not become
    /// established within that timeframe, the completion callback receives `Ok(None)`.
    ///
    /// A zero duration resolves as a timeout unless the connection completes synchronously.
    Timeout(std::time::Duration),
    /// Readiness is awaited for an indefinite amount of time.
    #[default]
    Unbounded,
}
impl ConnectWaitMode {
    /// Converts to the reactor's timeout representation, where `None` means no timeout.
    #[inline]
    pub const fn timeout(self) -> Option<std::time::Duration> {
        match self {
            Self::Timeout(t) => Some(t),
            Self::Unbounded => None,
        }
    }
}
impl From<Option<std::time::Duration>> for ConnectWaitMode {
    #[inline]
    fn from(timeout: Option<std::time::Duration>) -> Self {
        match timeout {
            Some(t) => Self::Timeout(t),
            None => Self::Unbounded,
        }
    }
}

#[cfg(test)]
#[path = "../tests/index.rs"]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects, clippy::indexing_slicing)]
mod tests;
