//! Connection pool for a single host on the current task's runtime.

use std::{
    cell::{Cell, RefCell},
    convert::TryFrom,
    fmt, mem,
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use actix_rt::time::{sleep, timeout};
use http::{header::RETRY_AFTER, Method};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use super::{async_connection::AsyncHttpConnection, config::PoolConfig, PoolKey};
use crate::{
    backend::AsyncBackend,
    body::AsyncBody,
    error::Error,
    request::{AsyncRequestOptions, PreparedRequest},
    response::Response,
    retry::{Outcome, Retry},
    timeout::Timeout,
};

/// Non-blocking counterpart of [`ConnectionPool`](super::ConnectionPool).
///
/// Cloning is cheap and yields a handle to the same pool. The pool lives on one thread; the
/// bounded wait on a blocking pool is a semaphore with `maxsize` permits.
#[derive(Clone)]
pub struct AsyncConnectionPool(Rc<AsyncPoolInner>);

struct AsyncPoolInner {
    key: PoolKey,
    config: PoolConfig,
    backend: Rc<dyn AsyncBackend>,
    idle: RefCell<Vec<AsyncHttpConnection>>,
    permits: Arc<Semaphore>,
    closed: Cell<bool>,
    num_connections: Cell<usize>,
    num_requests: Cell<usize>,
}

impl AsyncConnectionPool {
    pub fn new(key: PoolKey, config: PoolConfig, backend: Rc<dyn AsyncBackend>) -> Self {
        let permits = Arc::new(Semaphore::new(config.maxsize));

        AsyncConnectionPool(Rc::new(AsyncPoolInner {
            key,
            config,
            backend,
            idle: RefCell::new(Vec::new()),
            permits,
            closed: Cell::new(false),
            num_connections: Cell::new(0),
            num_requests: Cell::new(0),
        }))
    }

    pub fn key(&self) -> &PoolKey {
        &self.0.key
    }

    pub fn config(&self) -> &PoolConfig {
        &self.0.config
    }

    /// Slots not checked out, whether or not they hold an open connection.
    pub fn idle_count(&self) -> usize {
        self.0.permits.available_permits()
    }

    pub fn outstanding_count(&self) -> usize {
        self.0.config.maxsize.saturating_sub(self.idle_count())
    }

    pub fn num_connections(&self) -> usize {
        self.0.num_connections.get()
    }

    pub fn num_requests(&self) -> usize {
        self.0.num_requests.get()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.get()
    }

    /// Check out a connection; see [`ConnectionPool::acquire`](super::ConnectionPool::acquire).
    pub async fn acquire(
        &self,
        pool_timeout: Option<Duration>,
    ) -> Result<AsyncPooledConnection, Error> {
        let mut timeout = self.0.config.timeout.fresh();
        timeout.start_connect();
        self.acquire_with(pool_timeout, &timeout).await
    }

    async fn acquire_with(
        &self,
        pool_timeout: Option<Duration>,
        timeout: &Timeout,
    ) -> Result<AsyncPooledConnection, Error> {
        let permit = self.take_permit(pool_timeout).await?;

        let conn = match self.0.idle.borrow_mut().pop() {
            Some(mut conn) if conn.is_dropped() => {
                log::debug!("Resetting dropped connection: {}", self.0.key.host());
                conn.close();
                None
            }
            conn => conn,
        };

        // dropping the handle releases the permit, even if connecting fails
        let mut pooled = AsyncPooledConnection {
            conn: None,
            pool: self.clone(),
            reusable: false,
            _permit: permit,
        };

        let mut conn = match conn {
            Some(conn) => conn,
            None => self.new_conn(timeout).await?,
        };
        conn.set_idle(false);
        pooled.conn = Some(conn);

        Ok(pooled)
    }

    async fn take_permit(
        &self,
        pool_timeout: Option<Duration>,
    ) -> Result<OwnedSemaphorePermit, Error> {
        if self.is_closed() {
            return Err(Error::ClosedPool);
        }

        match Arc::clone(&self.0.permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(Error::ClosedPool),
            Err(TryAcquireError::NoPermits) if !self.0.config.block => {
                return Err(Error::FullPool)
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        let acquire = Arc::clone(&self.0.permits).acquire_owned();
        let res = match pool_timeout {
            Some(dur) => timeout(dur, acquire)
                .await
                .map_err(|_| Error::EmptyPoolTimeout)?,
            None => acquire.await,
        };

        res.map_err(|_| Error::ClosedPool)
    }

    async fn new_conn(&self, timeout: &Timeout) -> Result<AsyncHttpConnection, Error> {
        let n = self.0.num_connections.get() + 1;
        self.0.num_connections.set(n);

        log::debug!(
            "Starting new {} connection ({}): {}:{}",
            if self.0.key.is_tls() { "HTTPS" } else { "HTTP" },
            n,
            self.0.key.host(),
            self.0.key.port()
        );

        AsyncHttpConnection::connect(self.0.backend.as_ref(), &self.0.key, &self.0.config, timeout)
            .await
    }

    fn put_conn(&self, mut conn: AsyncHttpConnection) {
        if self.is_closed() {
            conn.close();
        } else {
            conn.set_idle(true);
            self.0.idle.borrow_mut().push(conn);
        }
    }

    /// Close every idle connection and refuse further checkouts, waking any waiters.
    pub fn close(&self) {
        self.0.closed.set(true);
        self.0.permits.close();

        let idle = mem::take(&mut *self.0.idle.borrow_mut());
        for mut conn in idle {
            conn.close();
        }
    }

    /// Send one request to this pool's host; see
    /// [`ConnectionPool::urlopen`](super::ConnectionPool::urlopen).
    pub async fn urlopen<M>(
        &self,
        method: M,
        url: &str,
        opts: AsyncRequestOptions,
    ) -> Result<Response, Error>
    where
        Method: TryFrom<M>,
        <Method as TryFrom<M>>::Error: Into<http::Error>,
    {
        let method = Method::try_from(method)
            .map_err(|err| Error::InvalidRequest(err.into().to_string()))?;
        let url = self.0.key.resolve(url)?;

        let parts = opts.prepare(method, url, &self.0.config.headers, &self.0.config.retries)?;
        let timeout = parts.timeout.unwrap_or(self.0.config.timeout);
        let pool_timeout = parts.pool_timeout.or(self.0.config.pool_timeout);

        let mut request = parts.request;
        self.urlopen_prepared(&mut request, parts.retries, &timeout, pool_timeout)
            .await
    }

    pub(crate) async fn urlopen_prepared(
        &self,
        request: &mut PreparedRequest<AsyncBody>,
        mut retries: Retry,
        timeout: &Timeout,
        pool_timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        if request.body_pos.is_none() {
            request.body_pos = Some(request.body.record_position().await);
        }

        loop {
            let url = request.url.to_string();

            let response = match self.send_once(request, timeout, pool_timeout).await {
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

                    wait(retries.next_wait(None)?).await;
                    rewind_body(request).await?;
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

            wait(retries.next_wait(Some(response.headers()))?).await;
            rewind_body(request).await?;
        }
    }

    async fn send_once(
        &self,
        request: &mut PreparedRequest<AsyncBody>,
        timeout: &Timeout,
        pool_timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        let mut timeout = timeout.fresh();
        timeout.start_connect();

        let mut conn = self.acquire_with(pool_timeout, &timeout).await?;
        self.0.num_requests.set(self.0.num_requests.get() + 1);

        let res = conn.send_request(request, &timeout).await;
        let reusable = res.is_ok() && conn.is_reusable();
        conn.release(reusable);

        res
    }
}

impl fmt::Debug for AsyncConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncConnectionPool")
            .field("key", &self.0.key)
            .field("backend", &self.0.backend.name())
            .field("maxsize", &self.0.config.maxsize)
            .field("idle", &self.idle_count())
            .finish()
    }
}

pub(crate) async fn rewind_body(request: &mut PreparedRequest<AsyncBody>) -> Result<(), Error> {
    match request.body_pos {
        Some(pos) => request.body.rewind(pos).await,
        None => Ok(()),
    }
}

pub(crate) async fn wait(dur: Duration) {
    if !dur.is_zero() {
        sleep(dur).await;
    }
}

/// A connection checked out of an [`AsyncConnectionPool`]; holds one of the pool's permits.
pub struct AsyncPooledConnection {
    conn: Option<AsyncHttpConnection>,
    pool: AsyncConnectionPool,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl AsyncPooledConnection {
    /// Give the connection back. With `reusable` unset it is closed instead of kept idle.
    pub fn release(mut self, reusable: bool) {
        self.reusable = reusable;
    }

    pub fn connection(&self) -> Option<&AsyncHttpConnection> {
        self.conn.as_ref()
    }

    pub fn is_reusable(&self) -> bool {
        self.conn
            .as_ref()
            .is_some_and(AsyncHttpConnection::is_reusable)
    }

    pub(crate) async fn send_request(
        &mut self,
        request: &mut PreparedRequest<AsyncBody>,
        timeout: &Timeout,
    ) -> Result<Response, Error> {
        match self.conn.as_mut() {
            Some(conn) => conn.send_request(request, timeout).await,
            None => Err(Error::ClosedPool),
        }
    }
}

impl fmt::Debug for AsyncPooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPooledConnection")
            .field("conn", &self.conn)
            .field("pool", &self.pool.0.key)
            .finish()
    }
}

impl Drop for AsyncPooledConnection {
    fn drop(&mut self) {
        // the permit is released after this returns, so the connection is back in place first
        match self.conn.take() {
            Some(conn) if self.reusable && conn.is_reusable() => self.pool.put_conn(conn),
            Some(mut conn) => conn.close(),
            None => {}
        }
    }
}
