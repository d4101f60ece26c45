use std::{convert::TryFrom, fmt, net::SocketAddr, time::Duration};

use http::header::{HeaderName, HeaderValue};

use crate::{
    backend::{
        load_async_backend, load_sync_backend, normalize_backend, Backend, SocketOption,
        TlsConfig,
    },
    client::{AsyncPoolManager, PoolConfig, PoolManager},
    error::Error,
    retry::Retry,
    timeout::Timeout,
};

/// A [`PoolManager`] or [`AsyncPoolManager`] builder.
///
/// ```
/// use std::time::Duration;
/// use hip::{PoolManagerBuilder, Retry};
///
/// let http = PoolManagerBuilder::new()
///     .num_pools(4)
///     .maxsize(2)
///     .block(true)
///     .timeout(Duration::from_secs(5))
///     .retries(Retry::new(5).backoff_factor(0.2))
///     .header("user-agent", "hip")
///     .finish()
///     .unwrap();
/// # drop(http);
/// ```
pub struct PoolManagerBuilder {
    num_pools: usize,
    backend: Option<Backend>,
    config: PoolConfig,
    err: Option<Error>,
}

impl Default for PoolManagerBuilder {
    fn default() -> Self {
        PoolManagerBuilder::new()
    }
}

impl PoolManagerBuilder {
    pub fn new() -> Self {
        PoolManagerBuilder {
            num_pools: crate::client::DEFAULT_NUM_POOLS,
            backend: None,
            config: PoolConfig::default(),
            err: None,
        }
    }

    /// Sets how many per-host pools are kept before the least recently used one is closed.
    ///
    /// By default, 10 pools are kept.
    pub fn num_pools(mut self, num_pools: usize) -> Self {
        self.num_pools = num_pools;
        self
    }

    /// Sets the I/O backend by name.
    ///
    /// By default, `"sync"` is used by [`finish`](Self::finish) and `"tokio"` by
    /// [`finish_async`](Self::finish_async).
    pub fn backend(mut self, backend: impl Into<Backend>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Replaces the whole pool configuration.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// See [`PoolConfig::maxsize`].
    pub fn maxsize(mut self, maxsize: usize) -> Self {
        self.config = self.config.maxsize(maxsize);
        self
    }

    /// See [`PoolConfig::block`].
    pub fn block(mut self, block: bool) -> Self {
        self.config = self.config.block(block);
        self
    }

    /// See [`PoolConfig::pool_timeout`].
    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.pool_timeout(timeout);
        self
    }

    /// See [`PoolConfig::timeout`].
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.config = self.config.timeout(timeout);
        self
    }

    /// See [`PoolConfig::retries`].
    pub fn retries(mut self, retries: Retry) -> Self {
        self.config = self.config.retries(retries);
        self
    }

    /// Add a default header, sent with every request unless the request sets its own.
    ///
    /// An invalid name or value is reported by [`finish`](Self::finish).
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        match HeaderName::try_from(key) {
            Ok(key) => match HeaderValue::try_from(value) {
                Ok(value) => {
                    self.config.headers.append(key, value);
                }
                Err(err) => self.err = Some(invalid_header(err.into())),
            },
            Err(err) => self.err = Some(invalid_header(err.into())),
        }
        self
    }

    /// See [`PoolConfig::source_address`].
    pub fn source_address(mut self, addr: SocketAddr) -> Self {
        self.config = self.config.source_address(addr);
        self
    }

    /// See [`PoolConfig::socket_options`].
    pub fn socket_options(mut self, options: Vec<SocketOption>) -> Self {
        self.config = self.config.socket_options(options);
        self
    }

    /// See [`PoolConfig::tls_config`].
    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.config = self.config.tls_config(tls);
        self
    }

    /// Finish building a blocking [`PoolManager`].
    ///
    /// Fails with [`Error::InvalidBackend`] when the chosen backend is unknown or non-blocking.
    pub fn finish(self) -> Result<PoolManager, Error> {
        if let Some(err) = self.err {
            return Err(err);
        }

        let backend = normalize_backend(self.backend, false)?;
        let backend = load_sync_backend(&backend)?;

        Ok(PoolManager::with_backend(self.num_pools, self.config, backend))
    }

    /// Finish building an [`AsyncPoolManager`].
    ///
    /// Fails with [`Error::InvalidBackend`] when the chosen backend is unknown or blocking.
    pub fn finish_async(self) -> Result<AsyncPoolManager, Error> {
        if let Some(err) = self.err {
            return Err(err);
        }

        let backend = normalize_backend(self.backend, true)?;
        let backend = load_async_backend(&backend)?;

        Ok(AsyncPoolManager::with_backend(
            self.num_pools,
            self.config,
            backend,
        ))
    }
}

impl fmt::Debug for PoolManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManagerBuilder")
            .field("num_pools", &self.num_pools)
            .field("backend", &self.backend)
            .field("config", &self.config)
            .finish()
    }
}

fn invalid_header(err: http::Error) -> Error {
    Error::InvalidRequest(format!("invalid header: {}", err))
}
