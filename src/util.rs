//! Helpers for building common request headers.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap,
};

use crate::error::Error;

/// Codings a response may use without extra decoders.
pub const DEFAULT_ACCEPT_ENCODING: &str = "gzip,deflate";

/// Headers to generate with [`make_headers`]. Unset fields add nothing.
#[derive(Debug, Clone, Default)]
pub struct MakeHeaders {
    /// `Connection: keep-alive`.
    pub keep_alive: bool,

    /// `Accept-Encoding`; [`DEFAULT_ACCEPT_ENCODING`] is the usual value.
    pub accept_encoding: Option<String>,

    pub user_agent: Option<String>,

    /// `user:password` sent as `Authorization: Basic ...`.
    pub basic_auth: Option<String>,

    /// `user:password` sent as `Proxy-Authorization: Basic ...`.
    pub proxy_basic_auth: Option<String>,

    /// `Cache-Control: no-cache`.
    pub disable_cache: bool,
}

/// Build a header map from common header shortcuts.
///
/// ```
/// use hip::util::{make_headers, MakeHeaders};
///
/// let headers = make_headers(MakeHeaders {
///     basic_auth: Some("foo:bar".to_owned()),
///     ..MakeHeaders::default()
/// })
/// .unwrap();
/// assert_eq!(headers["authorization"], "Basic Zm9vOmJhcg==");
/// ```
pub fn make_headers(opts: MakeHeaders) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();

    if let Some(encoding) = opts.accept_encoding {
        insert(&mut headers, header::ACCEPT_ENCODING, encoding)?;
    }

    if let Some(user_agent) = opts.user_agent {
        insert(&mut headers, header::USER_AGENT, user_agent)?;
    }

    if opts.keep_alive {
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    }

    if let Some(credentials) = opts.basic_auth {
        insert(&mut headers, header::AUTHORIZATION, basic(&credentials))?;
    }

    if let Some(credentials) = opts.proxy_basic_auth {
        insert(&mut headers, header::PROXY_AUTHORIZATION, basic(&credentials))?;
    }

    if opts.disable_cache {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    }

    Ok(headers)
}

fn basic(credentials: &str) -> String {
    format!("Basic {}", STANDARD.encode(credentials))
}

fn insert(headers: &mut HeaderMap, name: HeaderName, value: String) -> Result<(), Error> {
    let value = HeaderValue::try_from(value)
        .map_err(|err| Error::InvalidHeader(format!("invalid value for {}: {}", name, err)))?;
    headers.insert(name, value);
    Ok(())
}
