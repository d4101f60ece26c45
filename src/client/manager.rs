use std::{
    convert::TryFrom,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use http::Method;

use super::{
    config::PoolConfig,
    pool::{rewind_body, sleep},
    ConnectionPool, PoolKey, PoolMap,
};
use crate::{
    backend::{BlockingBackend, SyncBackend},
    body::Body,
    error::Error,
    redirect,
    request::{PreparedRequest, RequestOptions},
    response::Response,
    retry::{Outcome, Retry},
    url::Url,
};

/// Default number of pools a manager keeps.
pub(crate) const DEFAULT_NUM_POOLS: usize = 10;

/// Routes requests to per-host [`ConnectionPool`]s and follows redirects across them.
///
/// A manager is cheap to share: it is `Send + Sync`, and pools are created on first use and
/// evicted least-recently-used once more than `num_pools` hosts have been contacted.
///
/// ```no_run
/// use hip::{PoolManager, RequestOptions};
///
/// let http = PoolManager::new();
/// let res = http
///     .request("GET", "http://example.com/", RequestOptions::new())
///     .unwrap();
/// println!("{}: {}", res.status(), res.text());
/// ```
pub struct PoolManager {
    pools: Mutex<PoolMap<Arc<ConnectionPool>>>,
    config: PoolConfig,
    backend: Arc<dyn SyncBackend>,
}

impl Default for PoolManager {
    fn default() -> Self {
        PoolManager::new()
    }
}

impl PoolManager {
    /// Manager with default configuration over blocking sockets.
    ///
    /// Use [`PoolManagerBuilder`](crate::PoolManagerBuilder) to configure it.
    pub fn new() -> Self {
        PoolManager::with_backend(
            DEFAULT_NUM_POOLS,
            PoolConfig::default(),
            Arc::new(BlockingBackend),
        )
    }

    /// Manager over a custom backend.
    pub fn with_backend(
        num_pools: usize,
        config: PoolConfig,
        backend: Arc<dyn SyncBackend>,
    ) -> Self {
        PoolManager {
            pools: Mutex::new(PoolMap::new(num_pools)),
            config,
            backend,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn pools(&self) -> MutexGuard<'_, PoolMap<Arc<ConnectionPool>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of pools currently kept.
    pub fn num_pools(&self) -> usize {
        self.pools().len()
    }

    /// Pool for `scheme://host:port`, created if needed.
    ///
    /// `scheme` defaults to `http` and `port` to the scheme's default.
    pub fn connection_from_host(
        &self,
        scheme: Option<&str>,
        host: &str,
        port: Option<u16>,
    ) -> Result<Arc<ConnectionPool>, Error> {
        let key = PoolKey::new(scheme.unwrap_or("http"), host, port)?;
        Ok(self.connection_from_key(key))
    }

    /// Pool for the host `url` points at, created if needed.
    pub fn connection_from_url(&self, url: &str) -> Result<Arc<ConnectionPool>, Error> {
        let url = Url::parse(url)?;
        let key = PoolKey::from_url(&url)?;
        Ok(self.connection_from_key(key))
    }

    fn connection_from_key(&self, key: PoolKey) -> Arc<ConnectionPool> {
        let mut pools = self.pools();

        if let Some(pool) = pools.get(&key) {
            return pool;
        }

        let pool = Arc::new(ConnectionPool::new(
            key.clone(),
            self.config.clone(),
            Arc::clone(&self.backend),
        ));

        if let Some(evicted) = pools.insert(key, Arc::clone(&pool)) {
            log::debug!("Evicting pool for {}", evicted.key());
            evicted.close();
        }

        pool
    }

    /// Close and forget every pool.
    pub fn clear(&self) {
        let pools = self.pools().drain();
        for pool in pools {
            pool.close();
        }
    }

    /// Send a request to an absolute URL, following redirects.
    ///
    /// Connection errors and retryable statuses are retried by the target host's pool;
    /// redirects are followed here and may move the request to another pool. Redirect and
    /// retry budgets come from the request's retry option, or the manager's default.
    pub fn request<M>(&self, method: M, url: &str, opts: RequestOptions) -> Result<Response, Error>
    where
        Method: TryFrom<M>,
        <Method as TryFrom<M>>::Error: Into<http::Error>,
    {
        let method = Method::try_from(method)
            .map_err(|err| Error::InvalidRequest(err.into().to_string()))?;
        let url = Url::parse(url)?;

        let parts = opts.prepare(method, url, &self.config.headers, &self.config.retries)?;
        let timeout = parts.timeout.unwrap_or(self.config.timeout);
        let pool_timeout = parts.pool_timeout.or(self.config.pool_timeout);

        let mut request = parts.request;
        let mut retries = parts.retries;

        loop {
            let pool = self.connection_from_key(PoolKey::from_url(&request.url)?);

            let mut response =
                pool.urlopen_prepared(&mut request, retries.clone(), &timeout, pool_timeout)?;
            if let Some(spent) = response.take_retries() {
                retries = spent;
            }

            let location = match response.redirect_location() {
                Some(location) if parts.redirect => location,
                _ => return Ok(response.with_retries(retries)),
            };

            match follow_redirect(&mut request, retries, &response, &location)? {
                Redirect::Follow { retries: next, wait } => {
                    sleep(wait);
                    retries = next;
                }
                Redirect::Stop(spent) => return Ok(response.with_retries(spent)),
            }

            rewind_or_drop_body(&mut request)?;
        }
    }
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("backend", &self.backend.name())
            .field("num_pools", &self.num_pools())
            .field("config", &self.config)
            .finish()
    }
}

pub(crate) enum Redirect {
    Follow { retries: Retry, wait: Duration },
    /// The redirect budget ran out and the redirect response is returned as it is.
    Stop(Retry),
}

/// Spend a redirect and point `request` at its target.
///
/// The body is left in place; `request.body_pos` is cleared when it must be dropped.
pub(crate) fn follow_redirect<B>(
    request: &mut PreparedRequest<B>,
    retries: Retry,
    response: &Response,
    location: &str,
) -> Result<Redirect, Error> {
    let status = response.status();
    let plan = redirect::plan(
        &retries,
        &request.method,
        &request.headers,
        &request.url,
        status,
        location,
    )?;

    let from = request.url.to_string();
    let next = match retries.increment(
        &request.method,
        &from,
        Outcome::Redirect {
            status,
            location: plan.url.to_string(),
        },
    ) {
        Ok(next) => next,
        Err(Error::MaxRetry(_)) if !retries.is_raise_on_redirect() => {
            return Ok(Redirect::Stop(retries));
        }
        Err(err) => return Err(err),
    };

    let wait = next.redirect_wait(response.headers())?;

    log::info!("Redirecting {} -> {}", from, plan.url);

    request.method = plan.method;
    request.headers = plan.headers;
    request.url = plan.url;
    if plan.drop_body {
        request.body_pos = None;
    }

    Ok(Redirect::Follow {
        retries: next,
        wait,
    })
}

fn rewind_or_drop_body(request: &mut PreparedRequest<Body>) -> Result<(), Error> {
    match request.body_pos {
        Some(_) => rewind_body(request),
        None => {
            request.body = Body::Empty;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{header, StatusCode};
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{
        backend::{ConnectOptions, LoopControl, SyncSocket, TlsConfig},
        error::ProtocolError,
        timeout::Timeout,
    };

    assert_impl_all!(PoolManager: Send, Sync);

    /// Serves one canned response per host and records every request head it receives.
    #[derive(Default)]
    struct RoutingBackend {
        routes: Vec<(&'static str, &'static [u8])>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl SyncBackend for RoutingBackend {
        fn name(&self) -> &'static str {
            "routing"
        }

        fn connect(&self, opts: &ConnectOptions<'_>) -> Result<Box<dyn SyncSocket>, Error> {
            let response = self
                .routes
                .iter()
                .find(|(host, _)| *host == opts.host)
                .map(|(_, response)| Bytes::from_static(response))
                .ok_or_else(|| {
                    Error::NewConnection(std::io::ErrorKind::ConnectionRefused.into())
                })?;

            Ok(Box::new(RoutingSocket {
                response,
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    struct RoutingSocket {
        response: Bytes,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl SyncSocket for RoutingSocket {
        fn start_tls(
            self: Box<Self>,
            _: &str,
            _: &TlsConfig,
        ) -> Result<Box<dyn SyncSocket>, Error> {
            Err(Error::NotSupported("routing".to_owned()))
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
            let mut request = Vec::new();
            for chunk in produce {
                request.extend_from_slice(&chunk?);
            }
            self.sent
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&request).into_owned());

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
            false
        }
    }

    type Sent = Arc<Mutex<Vec<String>>>;

    fn manager(routes: Vec<(&'static str, &'static [u8])>) -> (PoolManager, Sent) {
        let backend = RoutingBackend {
            routes,
            ..RoutingBackend::default()
        };
        let sent = Arc::clone(&backend.sent);
        let manager =
            PoolManager::with_backend(DEFAULT_NUM_POOLS, PoolConfig::default(), Arc::new(backend));
        (manager, sent)
    }

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone";
    const TO_B: &[u8] =
        b"HTTP/1.1 302 Found\r\nLocation: http://b.test/landing\r\nContent-Length: 0\r\n\r\n";
    const SEE_OTHER: &[u8] =
        b"HTTP/1.1 303 See Other\r\nLocation: http://b.test/done\r\nContent-Length: 0\r\n\r\n";
    const LOOP: &[u8] =
        b"HTTP/1.1 302 Found\r\nLocation: /again\r\nContent-Length: 0\r\n\r\n";

    #[test]
    fn test_pools_are_shared_per_host() {
        let (http, _) = manager(vec![("a.test", OK)]);

        let first = http.connection_from_url("http://a.test/x").unwrap();
        let second = http.connection_from_host(None, "A.TEST", Some(80)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = http.connection_from_url("http://a.test:8080/").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(http.num_pools(), 2);

        http.clear();
        assert_eq!(http.num_pools(), 0);
        assert!(first.is_closed());
    }

    #[test]
    fn test_evicted_pool_is_closed() {
        let backend = RoutingBackend::default();
        let http = PoolManager::with_backend(1, PoolConfig::default(), Arc::new(backend));

        let first = http.connection_from_url("http://a.test/").unwrap();
        let _second = http.connection_from_url("http://b.test/").unwrap();
        assert_eq!(http.num_pools(), 1);
        assert!(first.is_closed());
    }

    #[test]
    fn test_cross_host_redirect_strips_authorization() {
        let _ = env_logger::try_init();

        let (http, sent) = manager(vec![("a.test", TO_B), ("b.test", OK)]);

        let res = http
            .request(
                "GET",
                "http://a.test/start",
                RequestOptions::new().header(header::AUTHORIZATION, "foo"),
            )
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.url().to_string(), "http://b.test/landing");

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("authorization: foo"));
        assert!(sent[1].starts_with("GET /landing HTTP/1.1\r\n"));
        assert!(!sent[1].contains("authorization"));

        let history = res.retries().unwrap().history();
        assert_eq!(history.len(), 1);
        assert_eq!(
            history[0].redirect_location.as_deref(),
            Some("http://b.test/landing")
        );
    }

    #[test]
    fn test_see_other_drops_body() {
        let (http, sent) = manager(vec![("a.test", SEE_OTHER), ("b.test", OK)]);

        let res = http
            .request(
                "PUT",
                "http://a.test/upload",
                RequestOptions::new().body("payload"),
            )
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let sent = sent.lock().unwrap();
        assert!(sent[0].ends_with("payload"));
        assert!(sent[1].starts_with("GET /done HTTP/1.1\r\n"));
        assert!(!sent[1].contains("payload"));
        assert!(!sent[1].to_ascii_lowercase().contains("content-length: 7"));
    }

    #[test]
    fn test_redirect_budget_exhausted() {
        let (http, _) = manager(vec![("a.test", LOOP)]);

        let retry = Retry::new(None).redirect(2);
        let err = http
            .request("GET", "http://a.test/", RequestOptions::new().retries(retry))
            .unwrap_err();
        match err {
            Error::MaxRetry(err) => assert_eq!(err.history().len(), 3),
            err => panic!("unexpected error: {}", err),
        }

        let retry = Retry::new(None).redirect(2).raise_on_redirect(false);
        let res = http
            .request("GET", "http://a.test/", RequestOptions::new().retries(retry))
            .unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(res.retries().unwrap().history().len(), 2);
    }

    #[test]
    fn test_redirects_disabled() {
        let (http, sent) = manager(vec![("a.test", TO_B), ("b.test", OK)]);

        let res = http
            .request("GET", "http://a.test/", RequestOptions::new().redirect(false))
            .unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);

        let res = http
            .request("GET", "http://a.test/", RequestOptions::new().retries(false))
            .unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);

        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unsupported_scheme() {
        let (http, _) = manager(vec![]);

        let err = http
            .request("GET", "ftp://a.test/", RequestOptions::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }
}
