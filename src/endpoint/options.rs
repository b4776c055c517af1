//! [`ConnectOptions`], a builder for connecting to a listening endpoint by path.

use {
    super::Endpoint,
    crate::{error::ConnectError, reactor::Reactor, ConnectWaitMode},
    std::{
        borrow::Cow,
        fmt::{self, Debug, Formatter},
        path::Path,
        rc::Rc,
    },
};

/// Client-side builder for [endpoints](Endpoint).
#[derive(Clone)]
pub struct ConnectOptions<'p> {
    path: Cow<'p, Path>,
    wait_mode: ConnectWaitMode,
}

/// Creation.
impl ConnectOptions<'_> {
    /// Returns a default set of client options, with an empty path and
    /// [unbounded waiting](ConnectWaitMode::Unbounded).
    #[inline]
    pub fn new() -> Self { Self { path: Cow::Borrowed(Path::new("")), wait_mode: ConnectWaitMode::Unbounded } }
}

/// Option setters.
impl<'p> ConnectOptions<'p> {
    /// Sets the path of the socket the client will connect to.
    #[must_use = builder_must_use!()]
    #[inline(always)]
    pub fn path(mut self, path: impl Into<Cow<'p, Path>>) -> Self {
        self.path = path.into();
        self
    }
    builder_setters! {
        /// Sets the [wait mode](ConnectWaitMode) of the connection operation.
        ///
        /// This defaults to [unbounded waiting](ConnectWaitMode::Unbounded).
        wait_mode: ConnectWaitMode,
    }
}

/// Option getters.
impl ConnectOptions<'_> {
    /// The path that will be connected to.
    #[inline]
    pub fn get_path(&self) -> &Path { &self.path }
    /// The wait mode of the connection operation.
    #[inline]
    pub fn get_wait_mode(&self) -> ConnectWaitMode { self.wait_mode }
}

/// Endpoint constructors.
impl ConnectOptions<'_> {
    /// Creates an [`Endpoint`] driven by `reactor` and [connects](Endpoint::connect) it to the
    /// configured path.
    ///
    /// Socket creation failures are reported as connection failures.
    pub fn connect(
        &self,
        reactor: Rc<dyn Reactor>,
        on_complete: impl FnOnce(Result<Option<Endpoint>, ConnectError>) + 'static,
    ) -> Result<(), ConnectError> {
        let endpoint = Endpoint::create(reactor).map_err(|e| ConnectError::new(&self.path, e))?;
        endpoint.connect(&self.path, self.wait_mode, on_complete)
    }
    /// Connects a [Tokio endpoint](crate::tokio::Endpoint) to the configured path.
    #[cfg(feature = "tokio")]
    #[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "tokio")))]
    pub async fn connect_tokio(&self) -> Result<Option<crate::tokio::Endpoint>, ConnectError> {
        crate::tokio::Endpoint::connect(&self.path, self.wait_mode).await
    }
}

impl Default for ConnectOptions<'_> {
    #[inline]
    fn default() -> Self { Self::new() }
}

impl Debug for ConnectOptions<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("path", &self.path)
            .field("wait_mode", &self.wait_mode)
            .finish()
    }
}
