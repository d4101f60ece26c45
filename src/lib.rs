//! `hip` is an HTTP/1.1 client engine with per-host connection pooling, retries, redirects and
//! pluggable I/O backends, usable from blocking code and from async tasks.
//!
//! # Making a GET request
//! ```no_run
//! # fn main() -> Result<(), hip::Error> {
//! let http = hip::PoolManager::new();
//! let res = http.request("GET", "http://www.rust-lang.org", hip::RequestOptions::new())?;
//!
//! println!("Response: {:?}", res);
//! # Ok(())
//! # }
//! ```
//!
//! # Retries and redirects
//! Connection errors, selected statuses and redirects share one [`Retry`] budget per request.
//! ```no_run
//! # fn main() -> Result<(), hip::Error> {
//! use hip::{PoolManager, RequestOptions, Retry};
//!
//! let http = PoolManager::new();
//! let retry = Retry::new(5)
//!     .redirect(2)
//!     .status_forcelist([502, 503])
//!     .backoff_factor(0.1);
//!
//! let res = http.request(
//!     "GET",
//!     "http://httpbin.org/redirect/1",
//!     RequestOptions::new().retries(retry),
//! )?;
//! println!("{} redirects", res.retries().map_or(0, |r| r.history().len()));
//! # Ok(())
//! # }
//! ```
//!
//! # Async
//! ```no_run
//! # #[actix_rt::main]
//! # async fn main() -> Result<(), hip::Error> {
//! let http = hip::PoolManagerBuilder::new().backend("tokio").finish_async()?;
//! let res = http
//!     .request(
//!         "POST",
//!         "http://httpbin.org/post",
//!         hip::AsyncRequestOptions::new().fields(&[("lang", "rust")]),
//!     )
//!     .await?;
//! # drop(res);
//! # Ok(())
//! # }
//! ```

#![deny(rust_2018_idioms, nonstandard_style)]
#![warn(future_incompatible)]
#![allow(clippy::type_complexity, clippy::needless_doctest_main)]

pub mod backend;
mod body;
mod builder;
mod client;
pub mod error;
mod h1;
pub mod redirect;
mod request;
mod response;
pub mod retry;
mod timeout;
mod url;
pub mod util;

pub use self::backend::{Backend, SocketOption, TlsConfig};
pub use self::body::{AsyncBody, Body};
pub use self::builder::PoolManagerBuilder;
pub use self::client::{
    AsyncConnectionPool, AsyncHttpConnection, AsyncPoolManager, AsyncPooledConnection,
    ConnectionPool, HttpConnection, PoolConfig, PoolKey, PoolManager, PooledConnection,
};
pub use self::error::{Error, LocationParseError, MaxRetryError, ProtocolError};
pub use self::request::{AsyncRequestOptions, RequestOptions};
pub use self::response::Response;
pub use self::retry::{Retries, Retry};
pub use self::timeout::Timeout;
pub use self::url::{Url, UrlBuilder};

pub mod http {
    //! Various HTTP related types.

    pub use ::http::{header, HeaderMap, Method, StatusCode, Version};
}
