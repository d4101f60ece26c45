//! Transport backends.
//!
//! A backend knows how to open a TCP connection, upgrade it to TLS and drive the duplex
//! send/receive loop an HTTP/1.1 exchange needs. [`SyncBackend`] runs every operation on the
//! calling thread; [`AsyncBackend`] suspends the current task instead.

use std::{fmt, io, net::SocketAddr, rc::Rc, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_core::{future::LocalBoxFuture, stream::LocalBoxStream};

use crate::{error::Error, timeout::Timeout};

mod sync_backend;
mod tokio_backend;

pub use self::{
    sync_backend::{BlockingBackend, BlockingSocket},
    tokio_backend::{TokioBackend, TokioSocket},
};

/// Size of a single socket read.
pub(crate) const BUFSIZE: usize = 65_536;

cfg_if::cfg_if! {
    if #[cfg(feature = "rustls")] {
        /// TLS client configuration handed to [`SyncSocket::start_tls`] and
        /// [`AsyncSocket::start_tls`].
        pub type TlsConfig = Arc<rustls::ClientConfig>;
    } else {
        /// Placeholder TLS configuration; TLS support is compiled out.
        #[derive(Debug, Clone)]
        pub struct TlsConfig {
            _priv: (),
        }
    }
}

/// Returned by the consumer of [`SyncSocket::send_and_receive_for_a_while`] after each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Keep sending and receiving.
    Continue,

    /// The consumer has everything it needs; stop both directions.
    Abort,
}

/// Option applied to a socket right after it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SocketOption {
    /// `TCP_NODELAY`.
    NoDelay(bool),

    /// `SO_KEEPALIVE`.
    KeepAlive(bool),

    /// `SO_RCVBUF`.
    RecvBufferSize(usize),

    /// `SO_SNDBUF`.
    SendBufferSize(usize),

    /// `SO_LINGER`.
    Linger(Option<Duration>),

    /// Arbitrary integer option passed straight to `setsockopt`.
    Raw { level: i32, name: i32, value: i32 },
}

/// Options applied to every new connection unless configured otherwise.
pub fn default_socket_options() -> Vec<SocketOption> {
    vec![SocketOption::NoDelay(true)]
}

/// Where and how to connect.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions<'a> {
    pub host: &'a str,
    pub port: u16,
    pub connect_timeout: Option<Duration>,
    pub source_address: Option<SocketAddr>,
    pub socket_options: &'a [SocketOption],
}

/// Opens blocking connections.
pub trait SyncBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Establish a TCP connection, applying socket options once connected.
    ///
    /// Fails with [`Error::ConnectTimeout`] when the connect budget runs out and with
    /// [`Error::NewConnection`] for any other transport failure.
    fn connect(&self, opts: &ConnectOptions<'_>) -> Result<Box<dyn SyncSocket>, Error>;
}

/// A connected, blocking socket.
pub trait SyncSocket: Send {
    /// Perform a TLS handshake over this transport.
    fn start_tls(
        self: Box<Self>,
        server_hostname: &str,
        tls: &TlsConfig,
    ) -> Result<Box<dyn SyncSocket>, Error>;

    /// DER encoding of the peer's leaf certificate, when TLS is active.
    fn peer_certificate(&self) -> Option<Bytes> {
        None
    }

    /// Wait for incoming data. An empty buffer signals an orderly close by the peer.
    fn receive_some(&mut self, read_timeout: Option<Duration>) -> Result<Bytes, Error>;

    /// Send everything `produce` yields while handing every incoming chunk to `consume`.
    ///
    /// The loop ends once `consume` returns [`LoopControl::Abort`]. End of stream is delivered to
    /// `consume` as an empty chunk; if it still asks to continue, the loop fails with
    /// [`ProtocolError::ConnectionClosed`](crate::ProtocolError::ConnectionClosed).
    ///
    /// Both directions make progress independently, so a response that arrives while the request
    /// is still going out is delivered. Every wait is bounded by `timeout`'s per-read limit and
    /// whatever is left of its total budget. If `consume` aborts before the request is fully
    /// written, the connection is closed.
    fn send_and_receive_for_a_while(
        &mut self,
        produce: &mut dyn Iterator<Item = Result<Bytes, Error>>,
        consume: &mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
        timeout: &Timeout,
    ) -> Result<(), Error>;

    /// Tear the connection down immediately without waiting for pending I/O.
    fn forceful_close(&mut self);

    /// Whether the peer has sent data or closed the connection. Never consumes data.
    fn is_readable(&self) -> bool;

    /// Toggle readability monitoring. Checking needs no setup on these sockets.
    fn set_readable_watch_state(&mut self, _enabled: bool) {}
}

/// Outgoing request chunks for the non-blocking duplex loop.
pub type Producer<'a> = LocalBoxStream<'a, Result<Bytes, Error>>;

/// Opens connections on the current task.
pub trait AsyncBackend {
    fn name(&self) -> &'static str;

    /// Establish a TCP connection; see [`SyncBackend::connect`].
    fn connect<'a>(
        &'a self,
        opts: ConnectOptions<'a>,
    ) -> LocalBoxFuture<'a, Result<Box<dyn AsyncSocket>, Error>>;
}

/// A connected, non-blocking socket. Mirrors [`SyncSocket`].
pub trait AsyncSocket {
    fn start_tls(
        self: Box<Self>,
        server_hostname: String,
        tls: TlsConfig,
    ) -> LocalBoxFuture<'static, Result<Box<dyn AsyncSocket>, Error>>;

    fn peer_certificate(&self) -> Option<Bytes> {
        None
    }

    fn receive_some<'a>(
        &'a mut self,
        read_timeout: Option<Duration>,
    ) -> LocalBoxFuture<'a, Result<Bytes, Error>>;

    /// Sending and receiving run concurrently on the current task. The first failure of either
    /// direction ends the loop and the other direction is dropped.
    fn send_and_receive_for_a_while<'a>(
        &'a mut self,
        produce: Producer<'a>,
        consume: &'a mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
        timeout: &'a Timeout,
    ) -> LocalBoxFuture<'a, Result<(), Error>>;

    fn forceful_close(&mut self);

    fn is_readable(&self) -> bool;

    fn set_readable_watch_state(&mut self, _enabled: bool) {}
}

/// Name of an I/O backend.
///
/// Known names are `"sync"` for blocking sockets and `"tokio"` for the tokio reactor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    name: String,
}

impl Backend {
    pub fn new(name: impl Into<String>) -> Self {
        Backend { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl From<&str> for Backend {
    fn from(name: &str) -> Self {
        Backend::new(name)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

const SYNC_BACKENDS: &[&str] = &["sync"];
const ASYNC_BACKENDS: &[&str] = &["tokio"];

/// Resolve a backend for the given mode, picking the mode's default when none is given.
pub fn normalize_backend(backend: Option<Backend>, async_mode: bool) -> Result<Backend, Error> {
    let backend = match backend {
        Some(backend) => backend,
        None if async_mode => return Ok(Backend::new(ASYNC_BACKENDS[0])),
        None => return Ok(Backend::new(SYNC_BACKENDS[0])),
    };

    let is_sync = SYNC_BACKENDS.contains(&backend.name());
    let is_async = ASYNC_BACKENDS.contains(&backend.name());

    if !is_sync && !is_async {
        return Err(Error::InvalidBackend(format!(
            "unknown backend specifier {}",
            backend
        )));
    }

    if async_mode && !is_async {
        return Err(Error::InvalidBackend(format!(
            "{} backend needs to be run in sync mode",
            backend
        )));
    }

    if !async_mode && !is_sync {
        return Err(Error::InvalidBackend(format!(
            "{} backend needs to be run in async mode",
            backend
        )));
    }

    Ok(backend)
}

/// Instantiate a blocking backend by name.
pub fn load_sync_backend(backend: &Backend) -> Result<Arc<dyn SyncBackend>, Error> {
    let backend = normalize_backend(Some(backend.clone()), false)?;
    match backend.name() {
        "sync" => Ok(Arc::new(BlockingBackend)),
        _ => Err(Error::InvalidBackend(format!(
            "unknown backend specifier {}",
            backend
        ))),
    }
}

/// Instantiate a non-blocking backend by name.
pub fn load_async_backend(backend: &Backend) -> Result<Rc<dyn AsyncBackend>, Error> {
    let backend = normalize_backend(Some(backend.clone()), true)?;
    match backend.name() {
        "tokio" => Ok(Rc::new(TokioBackend)),
        _ => Err(Error::InvalidBackend(format!(
            "unknown backend specifier {}",
            backend
        ))),
    }
}

/// Apply socket options to a freshly connected socket.
pub(crate) fn apply_socket_options(
    sock: &socket2::Socket,
    options: &[SocketOption],
) -> io::Result<()> {
    for option in options {
        match *option {
            SocketOption::NoDelay(enabled) => sock.set_nodelay(enabled)?,
            SocketOption::KeepAlive(enabled) => sock.set_keepalive(enabled)?,
            SocketOption::RecvBufferSize(size) => sock.set_recv_buffer_size(size)?,
            SocketOption::SendBufferSize(size) => sock.set_send_buffer_size(size)?,
            SocketOption::Linger(linger) => sock.set_linger(linger)?,
            SocketOption::Raw { level, name, value } => set_raw_option(sock, level, name, value)?,
        }
    }

    Ok(())
}

#[cfg(unix)]
fn set_raw_option(sock: &socket2::Socket, level: i32, name: i32, value: i32) -> io::Result<()> {
    use std::os::unix::io::AsRawFd as _;

    // SAFETY: the fd is owned by `sock` for the duration of the call and `value` outlives it;
    // the length matches the pointed-to integer.
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            level,
            name,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };

    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(not(unix))]
fn set_raw_option(_: &socket2::Socket, level: i32, name: i32, _: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("raw socket option ({}, {}) is not supported on this platform", level, name),
    ))
}

/// Non-consuming readability check on a socket in non-blocking mode.
pub(crate) fn peek_readable(sock: &socket2::Socket) -> bool {
    let mut buf = [std::mem::MaybeUninit::<u8>::uninit(); 1];
    match sock.peek(&mut buf) {
        // data pending or orderly close
        Ok(_) => true,
        Err(err) => err.kind() != io::ErrorKind::WouldBlock,
    }
}
