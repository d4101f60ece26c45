use std::{cell::RefCell, convert::TryFrom, fmt, rc::Rc};

use http::Method;

use super::{
    async_pool::{rewind_body, wait},
    config::PoolConfig,
    manager::{follow_redirect, Redirect, DEFAULT_NUM_POOLS},
    AsyncConnectionPool, PoolKey, PoolMap,
};
use crate::{
    backend::{AsyncBackend, TokioBackend},
    body::AsyncBody,
    error::Error,
    request::{AsyncRequestOptions, PreparedRequest},
    response::Response,
    url::Url,
};

/// Non-blocking counterpart of [`PoolManager`](crate::PoolManager).
///
/// Lives on a single thread; cloning shares the same pools.
///
/// ```no_run
/// use hip::{AsyncPoolManager, AsyncRequestOptions};
///
/// #[actix_rt::main]
/// async fn main() {
///     let http = AsyncPoolManager::new();
///     let res = http
///         .request("GET", "http://example.com/", AsyncRequestOptions::new())
///         .await
///         .unwrap();
///     println!("{}", res.status());
/// }
/// ```
#[derive(Clone)]
pub struct AsyncPoolManager(Rc<ManagerInner>);

struct ManagerInner {
    pools: RefCell<PoolMap<AsyncConnectionPool>>,
    config: PoolConfig,
    backend: Rc<dyn AsyncBackend>,
}

impl Default for AsyncPoolManager {
    fn default() -> Self {
        AsyncPoolManager::new()
    }
}

impl AsyncPoolManager {
    /// Manager with default configuration over the tokio backend.
    pub fn new() -> Self {
        AsyncPoolManager::with_backend(
            DEFAULT_NUM_POOLS,
            PoolConfig::default(),
            Rc::new(TokioBackend),
        )
    }

    /// Manager over a custom backend.
    pub fn with_backend(
        num_pools: usize,
        config: PoolConfig,
        backend: Rc<dyn AsyncBackend>,
    ) -> Self {
        AsyncPoolManager(Rc::new(ManagerInner {
            pools: RefCell::new(PoolMap::new(num_pools)),
            config,
            backend,
        }))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.0.config
    }

    pub fn num_pools(&self) -> usize {
        self.0.pools.borrow().len()
    }

    pub fn connection_from_host(
        &self,
        scheme: Option<&str>,
        host: &str,
        port: Option<u16>,
    ) -> Result<AsyncConnectionPool, Error> {
        let key = PoolKey::new(scheme.unwrap_or("http"), host, port)?;
        Ok(self.connection_from_key(key))
    }

    pub fn connection_from_url(&self, url: &str) -> Result<AsyncConnectionPool, Error> {
        let url = Url::parse(url)?;
        let key = PoolKey::from_url(&url)?;
        Ok(self.connection_from_key(key))
    }

    fn connection_from_key(&self, key: PoolKey) -> AsyncConnectionPool {
        let mut pools = self.0.pools.borrow_mut();

        if let Some(pool) = pools.get(&key) {
            return pool;
        }

        let pool = AsyncConnectionPool::new(
            key.clone(),
            self.0.config.clone(),
            Rc::clone(&self.0.backend),
        );

        if let Some(evicted) = pools.insert(key, pool.clone()) {
            log::debug!("Evicting pool for {}", evicted.key());
            evicted.close();
        }

        pool
    }

    /// Close and forget every pool.
    pub fn clear(&self) {
        let pools = self.0.pools.borrow_mut().drain();
        for pool in pools {
            pool.close();
        }
    }

    /// Send a request to an absolute URL, following redirects.
    pub async fn request<M>(
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
        let url = Url::parse(url)?;

        let parts = opts.prepare(method, url, &self.0.config.headers, &self.0.config.retries)?;
        let timeout = parts.timeout.unwrap_or(self.0.config.timeout);
        let pool_timeout = parts.pool_timeout.or(self.0.config.pool_timeout);

        let mut request = parts.request;
        let mut retries = parts.retries;

        loop {
            let pool = self.connection_from_key(PoolKey::from_url(&request.url)?);

            let mut response = pool
                .urlopen_prepared(&mut request, retries.clone(), &timeout, pool_timeout)
                .await?;
            if let Some(spent) = response.take_retries() {
                retries = spent;
            }

            let location = match response.redirect_location() {
                Some(location) if parts.redirect => location,
                _ => return Ok(response.with_retries(retries)),
            };

            match follow_redirect(&mut request, retries, &response, &location)? {
                Redirect::Follow { retries: next, wait: dur } => {
                    wait(dur).await;
                    retries = next;
                }
                Redirect::Stop(spent) => return Ok(response.with_retries(spent)),
            }

            rewind_or_drop_body(&mut request).await?;
        }
    }
}

impl fmt::Debug for AsyncPoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPoolManager")
            .field("backend", &self.0.backend.name())
            .field("num_pools", &self.num_pools())
            .finish()
    }
}

async fn rewind_or_drop_body(request: &mut PreparedRequest<AsyncBody>) -> Result<(), Error> {
    match request.body_pos {
        Some(_) => rewind_body(request).await,
        None => {
            request.body = AsyncBody::Empty;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use futures_core::future::LocalBoxFuture;
    use futures_util::StreamExt as _;
    use http::{header, StatusCode};

    use super::*;
    use crate::{
        backend::{AsyncSocket, ConnectOptions, LoopControl, Producer, TlsConfig},
        error::ProtocolError,
        retry::Retry,
        timeout::Timeout,
    };

    type Sent = Rc<RefCell<Vec<String>>>;

    #[derive(Default)]
    struct RoutingBackend {
        routes: Vec<(&'static str, &'static [u8])>,
        sent: Sent,
    }

    impl AsyncBackend for RoutingBackend {
        fn name(&self) -> &'static str {
            "routing"
        }

        fn connect<'a>(
            &'a self,
            opts: ConnectOptions<'a>,
        ) -> LocalBoxFuture<'a, Result<Box<dyn AsyncSocket>, Error>> {
            Box::pin(async move {
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
                    sent: Rc::clone(&self.sent),
                }) as Box<dyn AsyncSocket>)
            })
        }
    }

    struct RoutingSocket {
        response: Bytes,
        sent: Sent,
    }

    impl AsyncSocket for RoutingSocket {
        fn start_tls(
            self: Box<Self>,
            _: String,
            _: TlsConfig,
        ) -> LocalBoxFuture<'static, Result<Box<dyn AsyncSocket>, Error>> {
            Box::pin(async { Err(Error::NotSupported("routing".to_owned())) })
        }

        fn receive_some<'a>(
            &'a mut self,
            _: Option<Duration>,
        ) -> LocalBoxFuture<'a, Result<Bytes, Error>> {
            Box::pin(async { Ok(Bytes::new()) })
        }

        fn send_and_receive_for_a_while<'a>(
            &'a mut self,
            mut produce: Producer<'a>,
            consume: &'a mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
            _: &'a Timeout,
        ) -> LocalBoxFuture<'a, Result<(), Error>> {
            Box::pin(async move {
                let mut request = Vec::new();
                while let Some(chunk) = produce.next().await {
                    request.extend_from_slice(&chunk?);
                }
                self.sent
                    .borrow_mut()
                    .push(String::from_utf8_lossy(&request).into_owned());

                if consume(self.response.clone())? == LoopControl::Abort {
                    return Ok(());
                }

                match consume(Bytes::new())? {
                    LoopControl::Abort => Ok(()),
                    LoopControl::Continue => Err(ProtocolError::ConnectionClosed.into()),
                }
            })
        }

        fn forceful_close(&mut self) {}

        fn is_readable(&self) -> bool {
            false
        }
    }

    fn manager(routes: Vec<(&'static str, &'static [u8])>) -> (AsyncPoolManager, Sent) {
        let backend = RoutingBackend {
            routes,
            ..RoutingBackend::default()
        };
        let sent = Rc::clone(&backend.sent);
        let manager = AsyncPoolManager::with_backend(
            DEFAULT_NUM_POOLS,
            PoolConfig::default(),
            Rc::new(backend),
        );
        (manager, sent)
    }

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone";
    const TO_B: &[u8] =
        b"HTTP/1.1 307 Temporary Redirect\r\nLocation: http://b.test/landing\r\nContent-Length: 0\r\n\r\n";
    const LOOP: &[u8] = b"HTTP/1.1 302 Found\r\nLocation: /again\r\nContent-Length: 0\r\n\r\n";

    #[actix_rt::test]
    async fn test_cross_host_redirect_keeps_body() {
        let (http, sent) = manager(vec![("a.test", TO_B), ("b.test", OK)]);

        let res = http
            .request(
                "POST",
                "http://a.test/start",
                AsyncRequestOptions::new()
                    .header(header::AUTHORIZATION, "foo")
                    .body("payload"),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.text(), "done");
        assert_eq!(http.num_pools(), 2);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].starts_with("POST /landing HTTP/1.1\r\n"));
        assert!(sent[1].ends_with("payload"));
        assert!(!sent[1].contains("authorization"));
    }

    #[actix_rt::test]
    async fn test_redirect_budget_exhausted() {
        let (http, _) = manager(vec![("a.test", LOOP)]);

        let retry = Retry::new(None).redirect(1);
        let err = http
            .request(
                "GET",
                "http://a.test/",
                AsyncRequestOptions::new().retries(retry),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MaxRetry(_)));

        let res = http
            .request(
                "GET",
                "http://a.test/",
                AsyncRequestOptions::new().redirect(false),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
    }

    #[actix_rt::test]
    async fn test_clear_closes_pools() {
        let (http, _) = manager(vec![("a.test", OK)]);

        let pool = http.connection_from_url("http://a.test/").unwrap();
        let same = http.connection_from_host(Some("http"), "a.test", None).unwrap();
        assert_eq!(same.key(), pool.key());
        assert_eq!(http.num_pools(), 1);

        http.clear();
        assert!(pool.is_closed());
        assert_eq!(http.num_pools(), 0);
    }
}
