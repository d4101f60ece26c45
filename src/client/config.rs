use std::{net::SocketAddr, time::Duration};

use http::HeaderMap;

use crate::{
    backend::{default_socket_options, SocketOption, TlsConfig},
    retry::Retry,
    timeout::Timeout,
};

/// Connection pool configuration, shared by every pool a manager creates.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub(crate) maxsize: usize,
    pub(crate) block: bool,
    pub(crate) pool_timeout: Option<Duration>,
    pub(crate) timeout: Timeout,
    pub(crate) retries: Retry,
    pub(crate) headers: HeaderMap,
    pub(crate) source_address: Option<SocketAddr>,
    pub(crate) socket_options: Vec<SocketOption>,
    pub(crate) tls: Option<TlsConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            maxsize: 10,
            block: false,
            pool_timeout: None,
            timeout: Timeout::default(),
            retries: Retry::default(),
            headers: HeaderMap::new(),
            source_address: None,
            socket_options: default_socket_options(),
            tls: None,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of connections a pool holds, idle and checked out together.
    ///
    /// By default, the limit is 10.
    pub fn maxsize(mut self, maxsize: usize) -> Self {
        self.maxsize = maxsize;
        self
    }

    /// Sets the policy for acquiring from an exhausted pool.
    ///
    /// When `true`, callers wait (up to the pool timeout) for a connection to be released and
    /// fail with [`Error::EmptyPoolTimeout`](crate::Error::EmptyPoolTimeout). When `false`, they
    /// fail immediately with [`Error::FullPool`](crate::Error::FullPool).
    ///
    /// By default, the pool does not block.
    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Sets how long a blocking pool waits for a released connection.
    ///
    /// By default, the wait is unbounded.
    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = Some(timeout);
        self
    }

    /// Sets connect and read timeouts applied when a request does not set its own.
    ///
    /// By default, no timeout is applied.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Sets the retry policy applied when a request does not set its own.
    ///
    /// By default, 3 retries in total.
    pub fn retries(mut self, retries: Retry) -> Self {
        self.retries = retries;
        self
    }

    /// Sets headers sent with every request. Request headers of the same name take precedence.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the local address connections are bound to.
    pub fn source_address(mut self, addr: SocketAddr) -> Self {
        self.source_address = Some(addr);
        self
    }

    /// Sets options applied to every new socket.
    ///
    /// By default, only `TCP_NODELAY` is enabled.
    pub fn socket_options(mut self, options: Vec<SocketOption>) -> Self {
        self.socket_options = options;
        self
    }

    /// Sets the TLS configuration used for `https` connections.
    ///
    /// Without one, connecting to an `https` host fails.
    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}
