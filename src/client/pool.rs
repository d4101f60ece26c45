//! Blocking connection pool for a single host.

use std::{
    convert::TryFrom,
    fmt, mem,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use http::{header::RETRY_AFTER, Method};

use super::{config::PoolConfig, connection::HttpConnection, PoolKey};
use crate::{
    backend::SyncBackend,
    body::Body,
    error::Error,
    request::{PreparedRequest, RequestOptions},
    response::Response,
    retry::{Outcome, Retry},
    timeout::Timeout,
};

struct PoolState {
    /// Idle connections, most recently released last.
    idle: Vec<HttpConnection>,
    /// Slots not checked out; at least `idle.len()`.
    available: usize,
    closed: bool,
}

/// A bounded set of reusable connections to one host.
///
/// Holds at most `maxsize` connections, idle and checked out together. Connections are opened
/// lazily and the most recently released idle one is handed out first.
pub struct ConnectionPool {
    key: PoolKey,
    config: PoolConfig,
    backend: Arc<dyn SyncBackend>,
    state: Mutex<PoolState>,
    released: Condvar,
    num_connections: AtomicUsize,
    num_requests: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(key: PoolKey, config: PoolConfig, backend: Arc<dyn SyncBackend>) -> Self {
        let available = config.maxsize;

        ConnectionPool {
            key,
            config,
            backend,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(available),
                available,
                closed: false,
            }),
            released: Condvar::new(),
            num_connections: AtomicUsize::new(0),
            num_requests: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Slots not checked out, whether or not they hold an open connection. Zero once closed.
    pub fn idle_count(&self) -> usize {
        let state = self.lock();
        if state.closed {
            0
        } else {
            state.available
        }
    }

    /// Connections currently checked out. Zero once closed.
    pub fn outstanding_count(&self) -> usize {
        let state = self.lock();
        if state.closed {
            0
        } else {
            self.config.maxsize.saturating_sub(state.available)
        }
    }

    /// Connections opened over the pool's lifetime.
    pub fn num_connections(&self) -> usize {
        self.num_connections.load(Ordering::Relaxed)
    }

    /// Requests sent over the pool's lifetime.
    pub fn num_requests(&self) -> usize {
        self.num_requests.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Check out a connection, opening one if no idle connection is available.
    ///
    /// `pool_timeout` bounds the wait on a blocking pool; `None` waits indefinitely. A
    /// non-blocking pool fails with [`Error::FullPool`] right away when exhausted.
    pub fn acquire(
        self: &Arc<Self>,
        pool_timeout: Option<Duration>,
    ) -> Result<PooledConnection, Error> {
        let mut timeout = self.config.timeout.fresh();
        timeout.start_connect();
        self.acquire_with(pool_timeout, &timeout)
    }

    fn acquire_with(
        self: &Arc<Self>,
        pool_timeout: Option<Duration>,
        timeout: &Timeout,
    ) -> Result<PooledConnection, Error> {
        let conn = match self.take_slot(pool_timeout)? {
            Some(mut conn) if conn.is_dropped() => {
                log::debug!("Resetting dropped connection: {}", self.key.host());
                conn.close();
                None
            }
            conn => conn,
        };

        // the slot goes back to the pool when this handle drops, even if connecting fails
        let mut pooled = PooledConnection {
            conn: None,
            pool: Arc::clone(self),
            reusable: false,
        };

        let mut conn = match conn {
            Some(conn) => conn,
            None => self.new_conn(timeout)?,
        };
        conn.set_idle(false);
        pooled.conn = Some(conn);

        Ok(pooled)
    }

    fn take_slot(&self, pool_timeout: Option<Duration>) -> Result<Option<HttpConnection>, Error> {
        let deadline = pool_timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.lock();

        loop {
            if state.closed {
                return Err(Error::ClosedPool);
            }

            if state.available > 0 {
                state.available -= 1;
                return Ok(state.idle.pop());
            }

            if !self.config.block {
                return Err(Error::FullPool);
            }

            state = match deadline {
                None => self
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::EmptyPoolTimeout);
                    }
                    self.released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn new_conn(&self, timeout: &Timeout) -> Result<HttpConnection, Error> {
        let n = self.num_connections.fetch_add(1, Ordering::Relaxed) + 1;
        log::debug!(
            "Starting new {} connection ({}): {}:{}",
            if self.key.is_tls() { "HTTPS" } else { "HTTP" },
            n,
            self.key.host(),
            self.key.port()
        );

        HttpConnection::connect(self.backend.as_ref(), &self.key, &self.config, timeout)
    }

    /// Return a slot, with its connection if that is still usable.
    fn put_slot(&self, conn: Option<HttpConnection>) {
        let mut state = self.lock();

        if state.closed {
            if let Some(mut conn) = conn {
                conn.close();
            }
            return;
        }

        if state.available >= self.config.maxsize {
            if let Some(mut conn) = conn {
                log::warn!(
                    "Connection pool is full, discarding connection: {}",
                    self.key.host()
                );
                conn.close();
            }
            return;
        }

        state.available += 1;
        if let Some(mut conn) = conn {
            conn.set_idle(true);
            state.idle.push(conn);
        }

        drop(state);
        self.released.notify_one();
    }

    /// Close every idle connection and refuse further checkouts.
    ///
    /// Checked-out connections are closed when they are released.
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock();
            state.closed = true;
            mem::take(&mut state.idle)
        };

        for mut conn in idle {
            conn.close();
        }

        self.released.notify_all();
    }

    /// Send one request to this pool's host, retrying connection errors and retryable statuses.
    ///
    /// Redirect responses are returned as they are; following them is up to the
    /// [`PoolManager`](crate::PoolManager). `url` is either a path or an absolute URL on this
    /// pool's host; another host fails with [`Error::HostChanged`].
    pub fn urlopen<M>(
        self: &Arc<Self>,
        method: M,
        url: &str,
        opts: RequestOptions,
    ) -> Result<Response, Error>
    where
        Method: TryFrom<M>,
        <Method as TryFrom<M>>::Error: Into<http::Error>,
    {
        let method = Method::try_from(method)
            .map_err(|err| Error::InvalidRequest(err.into().to_string()))?;
        let url = self.key.resolve(url)?;

        let parts = opts.prepare(method, url, &self.config.headers, &self.config.retries)?;
        let timeout = parts.timeout.unwrap_or(self.config.timeout);
        let pool_timeout = parts.pool_timeout.or(self.config.pool_timeout);

        let mut request = parts.request;
        self.urlopen_prepared(&mut request, parts.retries, &timeout, pool_timeout)
    }

    pub(crate) fn urlopen_prepared(
        self: &Arc<Self>,
        request: &mut PreparedRequest<Body>,
        mut retries: Retry,
        timeout: &Timeout,
        pool_timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        if request.body_pos.is_none() {
            request.body_pos = Some(request.body.record_position());
        }

        loop {
            let url = request.url.to_string();

            let response = match self.send_once(request, timeout, pool_timeout) {
                Ok(response) => response,
                Err(err) if err.is_retryable() => {
                    let reason = err.to_string();
                    retries = retries.increment(&request.method, &url, Outcome::Error(err))?;

                    log::warn!(
                        "Retrying ({}) after connection broken by '{}': {}",
                        retries,
                        reason,
                        request.url.request_uri()
                    );

                    sleep(retries.next_wait(None)?);
                    rewind_body(request)?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let has_retry_after = response.headers().contains_key(RETRY_AFTER);
            if !retries.is_retry(&request.method, response.status(), has_retry_after) {
                return Ok(response.with_retries(retries));
            }

            let status = response.status();
            retries = match retries.increment(&request.method, &url, Outcome::Status(status)) {
                Ok(next) => next,
                Err(Error::MaxRetry(_)) if !retries.is_raise_on_status() => {
                    return Ok(response.with_retries(retries));
                }
                Err(err) => return Err(err),
            };

            log::debug!("Retry: {}", url);

            sleep(retries.next_wait(Some(response.headers()))?);
            rewind_body(request)?;
        }
    }

    fn send_once(
        self: &Arc<Self>,
        request: &mut PreparedRequest<Body>,
        timeout: &Timeout,
        pool_timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        let mut timeout = timeout.fresh();
        timeout.start_connect();

        let mut conn = self.acquire_with(pool_timeout, &timeout)?;
        self.num_requests.fetch_add(1, Ordering::Relaxed);

        let res = conn.send_request(request, &timeout);
        let reusable = res.is_ok() && conn.is_reusable();
        conn.release(reusable);

        res
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("key", &self.key)
            .field("backend", &self.backend.name())
            .field("maxsize", &self.config.maxsize)
            .field("idle", &self.idle_count())
            .finish()
    }
}

pub(crate) fn rewind_body(request: &mut PreparedRequest<Body>) -> Result<(), Error> {
    match request.body_pos {
        Some(pos) => request.body.rewind(pos),
        None => Ok(()),
    }
}

pub(crate) fn sleep(wait: Duration) {
    if !wait.is_zero() {
        thread::sleep(wait);
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping the handle without [`release`](Self::release) discards the connection and frees its
/// slot.
pub struct PooledConnection {
    conn: Option<HttpConnection>,
    pool: Arc<ConnectionPool>,
    reusable: bool,
}

impl PooledConnection {
    /// Give the connection back. With `reusable` unset it is closed instead of kept idle.
    pub fn release(mut self, reusable: bool) {
        self.reusable = reusable;
    }

    pub fn connection(&self) -> Option<&HttpConnection> {
        self.conn.as_ref()
    }

    pub fn is_reusable(&self) -> bool {
        self.conn.as_ref().is_some_and(HttpConnection::is_reusable)
    }

    pub(crate) fn send_request(
        &mut self,
        request: &mut PreparedRequest<Body>,
        timeout: &Timeout,
    ) -> Result<Response, Error> {
        match self.conn.as_mut() {
            Some(conn) => conn.send_request(request, timeout),
            None => Err(Error::ClosedPool),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("pool", &self.pool.key)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) if self.reusable && conn.is_reusable() => Some(conn),
            Some(mut conn) => {
                conn.close();
                None
            }
            None => None,
        };

        self.pool.put_slot(conn);
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::atomic::AtomicBool};

    use bytes::Bytes;
    use http::StatusCode;

    use super::*;
    use crate::{
        backend::{ConnectOptions, LoopControl, SyncSocket, TlsConfig},
        error::ProtocolError,
    };

    /// Backend whose sockets answer every request with a canned response.
    struct MockBackend {
        response: &'static [u8],
        refuse: bool,
        eager: bool,
        stale: Arc<AtomicBool>,
        connects: AtomicUsize,
    }

    impl MockBackend {
        fn new(response: &'static [u8]) -> Self {
            MockBackend {
                response,
                refuse: false,
                eager: false,
                stale: Arc::new(AtomicBool::new(false)),
                connects: AtomicUsize::new(0),
            }
        }

        /// Answers as soon as the first chunk of a request arrives.
        fn eager(response: &'static [u8]) -> Self {
            MockBackend {
                eager: true,
                ..MockBackend::new(response)
            }
        }

        fn refusing() -> Self {
            MockBackend {
                refuse: true,
                ..MockBackend::new(b"")
            }
        }
    }

    impl SyncBackend for MockBackend {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn connect(&self, _: &ConnectOptions<'_>) -> Result<Box<dyn SyncSocket>, Error> {
            self.connects.fetch_add(1, Ordering::SeqCst);

            if self.refuse {
                return Err(Error::NewConnection(io::ErrorKind::ConnectionRefused.into()));
            }

            Ok(Box::new(MockSocket {
                response: Bytes::from_static(self.response),
                eager: self.eager,
                stale: Arc::clone(&self.stale),
            }))
        }
    }

    struct MockSocket {
        response: Bytes,
        eager: bool,
        stale: Arc<AtomicBool>,
    }

    impl SyncSocket for MockSocket {
        fn start_tls(
            self: Box<Self>,
            _: &str,
            _: &TlsConfig,
        ) -> Result<Box<dyn SyncSocket>, Error> {
            Err(Error::NotSupported("mock".to_owned()))
        }

        fn receive_some(&mut self, _: Option<Duration>) -> Result<Bytes, Error> {
            Ok(Bytes::new())
        }

        fn send_and_receive_for_a_while(
            &mut self,
            produce: &mut dyn Iterator<Item = Result<Bytes, Error>>,
            consume: &mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
            _: &Timeout,
        ) -> Result<(), Error> {
            for chunk in produce {
                chunk?;

                // the producer is not polled again once the response is complete
                if self.eager && consume(self.response.clone())? == LoopControl::Abort {
                    return Ok(());
                }
            }

            if consume(self.response.clone())? == LoopControl::Abort {
                return Ok(());
            }

            match consume(Bytes::new())? {
                LoopControl::Abort => Ok(()),
                LoopControl::Continue => Err(ProtocolError::ConnectionClosed.into()),
            }
        }

        fn forceful_close(&mut self) {}

        fn is_readable(&self) -> bool {
            self.stale.load(Ordering::SeqCst)
        }
    }

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    const TEAPOT: &[u8] = b"HTTP/1.1 418 I'm a teapot\r\nContent-Length: 0\r\n\r\n";

    fn pool_with(config: PoolConfig, backend: &Arc<MockBackend>) -> Arc<ConnectionPool> {
        let key = PoolKey::new("http", "localhost", Some(8080)).unwrap();
        let backend: Arc<dyn SyncBackend> = backend.clone();
        Arc::new(ConnectionPool::new(key, config, backend))
    }

    #[test]
    fn test_connections_are_reused() {
        let backend = Arc::new(MockBackend::new(OK));
        let pool = pool_with(PoolConfig::default(), &backend);

        for _ in 0..3 {
            let res = pool.urlopen("GET", "/", RequestOptions::new()).unwrap();
            assert_eq!(res.status(), StatusCode::OK);
            assert_eq!(res.body().as_ref(), b"ok");
        }

        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_connections(), 1);
        assert_eq!(pool.num_requests(), 3);
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_failed_connect_does_not_leak_slot() {
        let _ = env_logger::try_init();

        let backend = Arc::new(MockBackend::refusing());
        let pool = pool_with(PoolConfig::default().maxsize(3), &backend);

        let err = pool.urlopen("GET", "/", RequestOptions::new()).unwrap_err();
        assert!(matches!(err, Error::MaxRetry(_)));

        // default policy allows three retries
        assert_eq!(backend.connects.load(Ordering::SeqCst), 4);
        assert_eq!(pool.idle_count() + pool.outstanding_count(), 3);
        assert_eq!(pool.idle_count(), 3);

        let err = pool
            .urlopen("GET", "/", RequestOptions::new().retries(false))
            .unwrap_err();
        assert!(matches!(err, Error::NewConnection(_)));
        assert_eq!(pool.idle_count(), 3);
    }

    #[test]
    fn test_nonblocking_pool_is_full() {
        let backend = Arc::new(MockBackend::new(OK));
        let pool = pool_with(PoolConfig::default().maxsize(1), &backend);

        let conn = pool.acquire(None).unwrap();
        assert_eq!(pool.outstanding_count(), 1);
        assert!(matches!(pool.acquire(None), Err(Error::FullPool)));

        conn.release(true);
        assert_eq!(pool.outstanding_count(), 0);
        assert!(pool.acquire(None).is_ok());
    }

    #[test]
    fn test_blocking_pool_times_out() {
        let backend = Arc::new(MockBackend::new(OK));
        let pool = pool_with(PoolConfig::default().maxsize(1).block(true), &backend);

        let _conn = pool.acquire(None).unwrap();
        let res = pool.acquire(Some(Duration::from_millis(20)));
        assert!(matches!(res, Err(Error::EmptyPoolTimeout)));
    }

    #[test]
    fn test_blocking_pool_waits_for_release() {
        let backend = Arc::new(MockBackend::new(OK));
        let pool = pool_with(PoolConfig::default().maxsize(1).block(true), &backend);

        let conn = pool.acquire(None).unwrap();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(conn);
        });

        let conn = pool.acquire(Some(Duration::from_secs(5))).unwrap();
        releaser.join().unwrap();

        // an unreleased handle is discarded, so the second checkout opened a new connection
        assert!(conn.connection().is_some());
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_closed_pool() {
        let backend = Arc::new(MockBackend::new(OK));
        let pool = pool_with(PoolConfig::default(), &backend);

        let conn = pool.acquire(None).unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire(None), Err(Error::ClosedPool)));

        conn.release(true);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_counts_after_close_with_released_connections() {
        let backend = Arc::new(MockBackend::new(OK));
        let pool = pool_with(PoolConfig::default().maxsize(3), &backend);

        let a = pool.acquire(None).unwrap();
        let b = pool.acquire(None).unwrap();
        assert_eq!(pool.outstanding_count(), 2);

        pool.close();
        a.release(true);
        b.release(false);

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_idle_connection_preferred_over_free_slot() {
        let backend = Arc::new(MockBackend::new(OK));
        let pool = pool_with(PoolConfig::default().maxsize(2), &backend);

        let a = pool.acquire(None).unwrap();
        let b = pool.acquire(None).unwrap();
        a.release(true);
        b.release(false);
        assert_eq!(pool.idle_count(), 2);

        let conn = pool.acquire(None).unwrap();
        assert!(conn.connection().is_some());
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.num_connections(), 2);
    }

    #[test]
    fn test_reused_when_response_beats_end_of_request() {
        let backend = Arc::new(MockBackend::eager(OK));
        let pool = pool_with(PoolConfig::default(), &backend);

        for _ in 0..3 {
            let res = pool.urlopen("GET", "/", RequestOptions::new()).unwrap();
            assert_eq!(res.status(), StatusCode::OK);
        }

        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);

        // a chunked body is still unsent when the response arrives
        let body = Body::reader(io::Cursor::new(b"payload".to_vec()));
        pool.urlopen("POST", "/", RequestOptions::new().body(body)).unwrap();
        pool.urlopen("GET", "/", RequestOptions::new()).unwrap();
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stale_connection_replaced() {
        let backend = Arc::new(MockBackend::new(OK));
        let pool = pool_with(PoolConfig::default(), &backend);

        pool.urlopen("GET", "/", RequestOptions::new()).unwrap();
        backend.stale.store(true, Ordering::SeqCst);
        pool.urlopen("GET", "/", RequestOptions::new()).unwrap();

        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_status_retry_returns_last_response() {
        let backend = Arc::new(MockBackend::new(TEAPOT));
        let pool = pool_with(PoolConfig::default(), &backend);

        let retry = Retry::new(1)
            .status_forcelist([418])
            .raise_on_status(false);
        let res = pool
            .urlopen("GET", "/", RequestOptions::new().retries(retry))
            .unwrap();

        assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(pool.num_requests(), 2);

        let history = res.retries().unwrap().history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, Some(StatusCode::IM_A_TEAPOT));
    }

    #[test]
    fn test_status_retry_exhausted() {
        let backend = Arc::new(MockBackend::new(TEAPOT));
        let pool = pool_with(PoolConfig::default(), &backend);

        let retry = Retry::new(1).status_forcelist([418]);
        let err = pool
            .urlopen("GET", "/", RequestOptions::new().retries(retry))
            .unwrap_err();

        match err {
            Error::MaxRetry(err) => {
                assert_eq!(err.history().len(), 2);
                assert_eq!(err.url(), "http://localhost:8080/");
            }
            err => panic!("unexpected error: {}", err),
        }
    }

    #[test]
    fn test_foreign_host_rejected() {
        let backend = Arc::new(MockBackend::new(OK));
        let pool = pool_with(PoolConfig::default(), &backend);

        let err = pool
            .urlopen("GET", "http://example.com/", RequestOptions::new())
            .unwrap_err();
        assert!(matches!(err, Error::HostChanged { .. }));
        assert_eq!(backend.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unrewindable_body_on_retry() {
        let backend = Arc::new(MockBackend::new(TEAPOT));
        let pool = pool_with(PoolConfig::default(), &backend);

        let body = Body::stream(io::Cursor::new(b"payload".to_vec()));
        let retry = Retry::new(1).status_forcelist([418]).any_method();
        let err = pool
            .urlopen(
                "POST",
                "/",
                RequestOptions::new().body(body).retries(retry),
            )
            .unwrap_err();

        assert!(matches!(err, Error::UnrewindableBody(_)));
    }
}
