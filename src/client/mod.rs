//! Connection pools and the managers that route requests to them.

use std::{collections::VecDeque, fmt};

use crate::{
    error::{Error, LocationParseError},
    url::{default_port, Url},
};

mod async_connection;
mod async_manager;
mod async_pool;
mod config;
mod connection;
mod manager;
mod pool;

pub use self::{
    async_connection::AsyncHttpConnection,
    async_manager::AsyncPoolManager,
    async_pool::{AsyncConnectionPool, AsyncPooledConnection},
    config::PoolConfig,
    connection::HttpConnection,
    manager::PoolManager,
    pool::{ConnectionPool, PooledConnection},
};

pub(crate) use self::manager::DEFAULT_NUM_POOLS;

/// Identity of a connection pool: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    scheme: String,
    host: String,
    port: u16,
}

impl PoolKey {
    /// Key for `scheme://host:port`; the port defaults per scheme.
    ///
    /// Only `http` and `https` are supported.
    pub fn new(scheme: &str, host: &str, port: Option<u16>) -> Result<Self, Error> {
        let scheme = scheme.to_ascii_lowercase();

        let default = default_port(&scheme)
            .ok_or_else(|| Error::NotSupported(format!("Not supported URL scheme {}", scheme)))?;

        if host.is_empty() {
            return Err(LocationParseError::MissingHost(host.to_owned()).into());
        }

        Ok(PoolKey {
            scheme,
            host: host.to_ascii_lowercase(),
            port: port.unwrap_or(default),
        })
    }

    /// Key for the host a URL points at. A URL without a scheme is treated as `http`.
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let host = url
            .host()
            .ok_or_else(|| LocationParseError::MissingHost(url.to_string()))?;

        PoolKey::new(url.scheme().unwrap_or("http"), host, url.port())
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host as it appears in a URL; IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host suitable for resolving and for TLS server name indication.
    pub fn hostname(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(&self.host)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Resolve a URL against this key. Relative URLs are anchored here; absolute ones must point
    /// at the same host.
    pub(crate) fn resolve(&self, raw: &str) -> Result<Url, Error> {
        let url = Url::parse(raw)?;

        if url.host().is_none() {
            let mut builder = Url::builder().scheme(self.scheme.as_str()).host(self.host.as_str());
            if Some(self.port) != default_port(&self.scheme) {
                builder = builder.port(self.port);
            }
            if let Some(path) = url.path() {
                builder = builder.path(path);
            }
            if let Some(query) = url.query() {
                builder = builder.query(query);
            }
            return Ok(builder.build());
        }

        match PoolKey::from_url(&url) {
            Ok(key) if key == *self => Ok(url),
            _ => Err(Error::HostChanged {
                url: raw.to_owned(),
            }),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Pools in least-recently-used order, most recent first.
pub(crate) struct PoolMap<P> {
    pools: VecDeque<(PoolKey, P)>,
    capacity: usize,
}

impl<P: Clone> PoolMap<P> {
    pub(crate) fn new(capacity: usize) -> Self {
        PoolMap {
            pools: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Look up a pool, marking it most recently used.
    pub(crate) fn get(&mut self, key: &PoolKey) -> Option<P> {
        let idx = self.pools.iter().position(|(k, _)| k == key)?;
        let entry = self.pools.remove(idx)?;
        let pool = entry.1.clone();
        self.pools.push_front(entry);
        Some(pool)
    }

    /// Insert a pool, returning the one evicted to stay within capacity.
    pub(crate) fn insert(&mut self, key: PoolKey, pool: P) -> Option<P> {
        self.pools.push_front((key, pool));

        if self.pools.len() > self.capacity {
            self.pools.pop_back().map(|(_, pool)| pool)
        } else {
            None
        }
    }

    pub(crate) fn drain(&mut self) -> Vec<P> {
        self.pools.drain(..).map(|(_, pool)| pool).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pools.len()
    }
}
