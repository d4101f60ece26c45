use std::{convert::TryFrom, time::Duration};

use bytes::Bytes;
use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, Method,
};
use serde::Serialize;

use crate::{
    body::{AsyncBody, Body, BodyPosition},
    error::Error,
    h1,
    retry::{Retries, Retry},
    timeout::Timeout,
    url::{default_port, Url},
};

/// Per-request options for [`PoolManager::request`](crate::PoolManager::request) and
/// [`ConnectionPool::urlopen`](crate::ConnectionPool::urlopen).
///
/// ```no_run
/// use hip::{PoolManager, RequestOptions};
///
/// let http = PoolManager::new();
/// let res = http
///     .request(
///         "POST",
///         "http://localhost:8080/upload",
///         RequestOptions::new()
///             .header("x-request-id", "42")
///             .body("payload")
///             .retries(5),
///     )
///     .unwrap();
/// assert!(res.status().is_success());
/// ```
pub struct RequestOptions<B = Body> {
    pub(crate) headers: HeaderMap,
    pub(crate) body: B,
    pub(crate) fields: Option<String>,
    pub(crate) retries: Option<Retries>,
    pub(crate) timeout: Option<Timeout>,
    pub(crate) redirect: bool,
    pub(crate) pool_timeout: Option<Duration>,
    err: Option<Error>,
}

/// Request options carrying an [`AsyncBody`].
pub type AsyncRequestOptions = RequestOptions<AsyncBody>;

impl<B: Default> Default for RequestOptions<B> {
    fn default() -> Self {
        RequestOptions {
            headers: HeaderMap::new(),
            body: B::default(),
            fields: None,
            retries: None,
            timeout: None,
            redirect: true,
            pool_timeout: None,
            err: None,
        }
    }
}

impl<B: Default> RequestOptions<B> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B> RequestOptions<B> {
    /// Append a header.
    ///
    /// An invalid name or value is reported when the request is sent.
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
                    self.headers.append(key, value);
                }
                Err(err) => self.err = Some(invalid_header(err.into())),
            },
            Err(err) => self.err = Some(invalid_header(err.into())),
        }
        self
    }

    /// Replace all headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<B>) -> Self {
        self.body = body.into();
        self
    }

    /// URL-encoded fields; sent in the query string for GET, HEAD, DELETE and OPTIONS, and as an
    /// `application/x-www-form-urlencoded` body otherwise.
    pub fn fields<T: Serialize + ?Sized>(mut self, fields: &T) -> Self {
        match serde_urlencoded::to_string(fields) {
            Ok(encoded) => self.fields = Some(encoded),
            Err(err) => {
                self.err = Some(Error::InvalidRequest(format!(
                    "form serialization error: {}",
                    err
                )))
            }
        }
        self
    }

    /// Retry policy: a count, `false` to disable, or a full [`Retry`].
    ///
    /// By default, the pool's retry configuration applies.
    pub fn retries(mut self, retries: impl Into<Retries>) -> Self {
        self.retries = Some(retries.into());
        self
    }

    /// Override the pool's timeouts for this request.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    /// Whether redirects are followed.
    ///
    /// By default, they are.
    pub fn redirect(mut self, redirect: bool) -> Self {
        self.redirect = redirect;
        self
    }

    /// How long a blocking pool waits for a free connection.
    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = Some(timeout);
        self
    }
}

fn invalid_header(err: http::Error) -> Error {
    Error::InvalidRequest(format!("invalid header: {}", err))
}

/// A request ready to be written, plus where its body restarts on a resend.
#[derive(Debug)]
pub(crate) struct PreparedRequest<B> {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: B,
    pub(crate) body_pos: Option<BodyPosition>,
}

/// Everything resolved from [`RequestOptions`] against pool defaults.
pub(crate) struct RequestParts<B> {
    pub(crate) request: PreparedRequest<B>,
    pub(crate) retries: Retry,
    pub(crate) timeout: Option<Timeout>,
    pub(crate) redirect: bool,
    pub(crate) pool_timeout: Option<Duration>,
}

impl<B: From<Bytes>> RequestOptions<B> {
    pub(crate) fn prepare(
        self,
        method: Method,
        url: Url,
        default_headers: &HeaderMap,
        default_retry: &Retry,
    ) -> Result<RequestParts<B>, Error> {
        if let Some(err) = self.err {
            return Err(err);
        }

        let mut headers = merge_headers(default_headers, self.headers);
        let mut url = url;
        let mut body = self.body;

        if let Some(fields) = self.fields {
            if encodes_fields_in_url(&method) {
                let query = match url.query() {
                    Some(query) if !query.is_empty() => format!("{}&{}", query, fields),
                    _ => fields,
                };
                url = url.with_query(Some(query));
            } else {
                if !headers.contains_key(header::CONTENT_TYPE) {
                    let content_type =
                        HeaderValue::from_str(mime::APPLICATION_WWW_FORM_URLENCODED.as_ref())
                            .map_err(|err| Error::InvalidRequest(err.to_string()))?;
                    headers.insert(header::CONTENT_TYPE, content_type);
                }
                body = B::from(Bytes::from(fields));
            }
        }

        let retries = Retry::from_option(self.retries, self.redirect, default_retry);

        Ok(RequestParts {
            request: PreparedRequest {
                method,
                url,
                headers,
                body,
                body_pos: None,
            },
            retries,
            timeout: self.timeout,
            redirect: self.redirect,
            pool_timeout: self.pool_timeout,
        })
    }
}

fn encodes_fields_in_url(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS
    )
}

/// Overlay per-request headers on defaults; a request header replaces every default value of
/// the same name.
pub(crate) fn merge_headers(defaults: &HeaderMap, overrides: HeaderMap) -> HeaderMap {
    let mut merged = defaults.clone();

    let mut current = None;
    for (name, value) in overrides {
        if let Some(name) = name {
            merged.remove(&name);
            current = Some(name);
        }
        if let Some(name) = &current {
            merged.append(name.clone(), value);
        }
    }

    merged
}

/// Build the request head, adding `Host` and body framing headers.
pub(crate) fn encode_request_head(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body_size: Option<u64>,
) -> Result<Bytes, Error> {
    let target = url.request_uri();
    if target.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(Error::InvalidRequest(format!(
            "invalid request target: {:?}",
            target
        )));
    }

    let mut headers = headers.clone();

    if !headers.contains_key(header::HOST) {
        if let Some(host) = url.host() {
            let scheme = url.scheme().unwrap_or("http");
            let value = match url.port() {
                Some(port) if Some(port) != default_port(scheme) => format!("{}:{}", host, port),
                _ => host.to_owned(),
            };
            let value = HeaderValue::try_from(value)
                .map_err(|err| Error::InvalidRequest(format!("invalid host header: {}", err)))?;
            headers.insert(header::HOST, value);
        }
    }

    if !headers.contains_key(header::CONTENT_LENGTH)
        && !headers.contains_key(header::TRANSFER_ENCODING)
    {
        match body_size {
            Some(0) if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) => {}
            Some(len) => {
                let mut buf = itoa::Buffer::new();
                headers.insert(
                    header::CONTENT_LENGTH,
                    HeaderValue::from_str(buf.format(len))
                        .map_err(|err| Error::InvalidRequest(err.to_string()))?,
                );
            }
            None => {
                headers.insert(
                    header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
            }
        }
    }

    Ok(h1::encode_head(method, &target, &headers))
}
