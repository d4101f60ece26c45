use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs as _},
    time::{Duration, Instant},
};

use bytes::{Buf as _, Bytes, BytesMut};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use super::{
    apply_socket_options, peek_readable, ConnectOptions, LoopControl, SyncBackend, SyncSocket,
    TlsConfig, BUFSIZE,
};
use crate::{
    error::{Error, ProtocolError},
    timeout::Timeout,
};

/// Backend running every operation on the calling thread with std sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockingBackend;

impl SyncBackend for BlockingBackend {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn connect(&self, opts: &ConnectOptions<'_>) -> Result<Box<dyn SyncSocket>, Error> {
        let addrs = (opts.host, opts.port)
            .to_socket_addrs()
            .map_err(Error::NewConnection)?;

        let mut last_err = None;

        for addr in addrs {
            match connect_addr(addr, opts) {
                Ok(stream) => {
                    apply_socket_options(&SockRef::from(&stream), opts.socket_options)
                        .map_err(Error::NewConnection)?;
                    stream.set_nonblocking(true).map_err(Error::NewConnection)?;

                    return Ok(Box::new(BlockingSocket::new(Stream::Plain(stream))));
                }
                Err(err) => {
                    log::trace!("connecting to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::NewConnection(io::Error::new(
                io::ErrorKind::NotFound,
                format!("could not resolve {}", opts.host),
            ))
        }))
    }
}

fn connect_addr(addr: SocketAddr, opts: &ConnectOptions<'_>) -> Result<TcpStream, Error> {
    let timed_out = || Error::ConnectTimeout {
        host: opts.host.to_owned(),
        port: opts.port,
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::NewConnection)?;

    if let Some(source) = opts.source_address {
        socket.bind(&source.into()).map_err(Error::NewConnection)?;
    }

    let res = match opts.connect_timeout {
        Some(timeout) if timeout.is_zero() => return Err(timed_out()),
        Some(timeout) => socket.connect_timeout(&addr.into(), timeout),
        None => socket.connect(&addr.into()),
    };

    match res {
        Ok(()) => Ok(socket.into()),
        Err(err) if is_timeout(&err) => Err(timed_out()),
        Err(err) => Err(Error::NewConnection(err)),
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

fn io_error(err: io::Error) -> Error {
    if is_timeout(&err) {
        Error::ReadTimeout
    } else {
        Error::Protocol(ProtocolError::Io(err))
    }
}

fn is_retry(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Block until the socket is readable (or writable, with `write` set) or `limit` passes.
///
/// Returning does not guarantee readiness; callers retry their non-blocking operation.
#[cfg(unix)]
fn wait_ready(tcp: &TcpStream, write: bool, limit: Option<Duration>) -> io::Result<()> {
    use std::os::unix::io::AsRawFd as _;

    let mut events = libc::POLLIN;
    if write {
        events |= libc::POLLOUT;
    }

    let mut fd = libc::pollfd {
        fd: tcp.as_raw_fd(),
        events,
        revents: 0,
    };

    let timeout_ms = match limit {
        Some(limit) => limit
            .as_nanos()
            .div_ceil(1_000_000)
            .min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };

    // SAFETY: `fd` points to one valid pollfd that outlives the call; the fd is owned by `tcp`.
    let ret = unsafe { libc::poll(&mut fd, 1, timeout_ms) };

    if ret == -1 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    Ok(())
}

#[cfg(not(unix))]
fn wait_ready(_: &TcpStream, _: bool, limit: Option<Duration>) -> io::Result<()> {
    const BACKOFF: Duration = Duration::from_millis(1);

    std::thread::sleep(limit.map_or(BACKOFF, |limit| limit.min(BACKOFF)));
    Ok(())
}

#[cfg(feature = "rustls")]
struct TlsStream {
    tcp: TcpStream,
    conn: rustls::ClientConnection,
}

#[cfg(feature = "rustls")]
impl TlsStream {
    fn handshake(&mut self) -> io::Result<()> {
        while self.conn.is_handshaking() {
            if self.conn.wants_write() {
                match self.conn.write_tls(&mut self.tcp) {
                    Ok(_) => {}
                    Err(err) if is_retry(&err) => wait_ready(&self.tcp, true, None)?,
                    Err(err) => return Err(err),
                }
                continue;
            }

            match self.conn.read_tls(&mut self.tcp) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => {
                    self.conn.process_new_packets().map_err(tls_error)?;
                }
                Err(err) if is_retry(&err) => wait_ready(&self.tcp, false, None)?,
                Err(err) => return Err(err),
            }
        }

        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.tcp) {
                Ok(_) => {}
                Err(err) if is_retry(&err) => wait_ready(&self.tcp, true, None)?,
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    fn read_plaintext(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                res => return res,
            }

            // no plaintext buffered; pull more records off the socket
            if self.conn.read_tls(&mut self.tcp)? == 0 {
                return Ok(0);
            }
            self.conn.process_new_packets().map_err(tls_error)?;
        }
    }

    /// Push buffered records to the socket, returning how many bytes went out.
    fn flush_records(&mut self) -> io::Result<usize> {
        let mut written = 0;

        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.tcp) {
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        Ok(written)
    }
}

#[cfg(feature = "rustls")]
fn tls_error(err: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Non-blocking TCP stream, optionally wrapped in TLS.
enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "rustls")]
    Tls(Box<TlsStream>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(tcp) => tcp,
            #[cfg(feature = "rustls")]
            Stream::Tls(tls) => &tls.tcp,
        }
    }

    /// Whatever has arrived, without blocking. `None` means nothing yet; an empty buffer means
    /// the peer closed.
    fn read_available(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(BUFSIZE);

        loop {
            let res = match self {
                Stream::Plain(tcp) => tcp.read(&mut buf),
                #[cfg(feature = "rustls")]
                Stream::Tls(tls) => tls.read_plaintext(&mut buf),
            };

            match res {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf.freeze()));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                // peer closed without a TLS close_notify
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(Some(Bytes::new()))
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Write a prefix of `data` without blocking; zero when nothing was accepted.
    fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        let res = match self {
            Stream::Plain(tcp) => tcp.write(data),
            #[cfg(feature = "rustls")]
            Stream::Tls(tls) => tls.conn.writer().write(data),
        };

        match res {
            Err(err) if is_retry(&err) => Ok(0),
            res => res,
        }
    }

    /// Bytes moved from TLS buffers onto the socket.
    fn flush_some(&mut self) -> io::Result<usize> {
        match self {
            Stream::Plain(_) => Ok(0),
            #[cfg(feature = "rustls")]
            Stream::Tls(tls) => tls.flush_records(),
        }
    }

    /// Output is buffered above the socket.
    fn has_buffered_output(&self) -> bool {
        match self {
            Stream::Plain(_) => false,
            #[cfg(feature = "rustls")]
            Stream::Tls(tls) => tls.conn.wants_write(),
        }
    }
}

/// Blocking TCP connection, optionally wrapped in TLS.
///
/// The socket itself stays non-blocking; every wait goes through `poll` so that sending and
/// receiving never hold each other up.
pub struct BlockingSocket {
    stream: Stream,
}

impl BlockingSocket {
    fn new(stream: Stream) -> Self {
        BlockingSocket { stream }
    }

    /// Hand every chunk that has already arrived to `consume`.
    ///
    /// Returns `Ok(true)` once `consume` has everything it needs.
    fn drain(
        &mut self,
        consume: &mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
        progress: &mut bool,
    ) -> Result<bool, Error> {
        while let Some(data) = self.stream.read_available().map_err(io_error)? {
            *progress = true;
            if deliver(consume, data)? == LoopControl::Abort {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// A write failed; the peer may still have answered before it stopped reading.
    fn finish_after_write_error(
        &mut self,
        err: io::Error,
        consume: &mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
    ) -> Result<(), Error> {
        let mut progress = false;
        match self.drain(consume, &mut progress) {
            Ok(true) => {
                log::debug!("response received after the request failed to send: {}", err);
                self.forceful_close();
                Ok(())
            }
            _ => Err(io_error(err)),
        }
    }
}

fn deliver(
    consume: &mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
    data: Bytes,
) -> Result<LoopControl, Error> {
    let eof = data.is_empty();
    match consume(data)? {
        LoopControl::Continue if eof => Err(ProtocolError::ConnectionClosed.into()),
        control => Ok(control),
    }
}

impl SyncSocket for BlockingSocket {
    #[cfg(feature = "rustls")]
    fn start_tls(
        self: Box<Self>,
        server_hostname: &str,
        tls: &TlsConfig,
    ) -> Result<Box<dyn SyncSocket>, Error> {
        use rustls::pki_types::ServerName;

        let tcp = match self.stream {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(_) => {
                return Err(Error::NotSupported("TLS is already active".to_owned()));
            }
        };

        let name = ServerName::try_from(server_hostname)
            .map_err(|err| Error::Ssl(Box::new(err)))?
            .to_owned();
        let conn = rustls::ClientConnection::new(std::sync::Arc::clone(tls), name)
            .map_err(|err| Error::Ssl(Box::new(err)))?;

        let mut stream = TlsStream { tcp, conn };
        stream.handshake().map_err(|err| Error::Ssl(Box::new(err)))?;

        log::trace!(
            "TLS handshake with {} done ({:?})",
            server_hostname,
            stream.conn.protocol_version()
        );

        Ok(Box::new(BlockingSocket::new(Stream::Tls(Box::new(stream)))))
    }

    #[cfg(not(feature = "rustls"))]
    fn start_tls(
        self: Box<Self>,
        _server_hostname: &str,
        _tls: &TlsConfig,
    ) -> Result<Box<dyn SyncSocket>, Error> {
        Err(Error::NotSupported(
            "TLS support is not enabled; build with the `rustls` feature".to_owned(),
        ))
    }

    fn peer_certificate(&self) -> Option<Bytes> {
        match &self.stream {
            Stream::Plain(_) => None,
            #[cfg(feature = "rustls")]
            Stream::Tls(tls) => tls
                .conn
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| Bytes::copy_from_slice(cert.as_ref())),
        }
    }

    fn receive_some(&mut self, read_timeout: Option<Duration>) -> Result<Bytes, Error> {
        if read_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(Error::ReadTimeout);
        }

        let started = Instant::now();

        loop {
            if let Some(data) = self.stream.read_available().map_err(io_error)? {
                return Ok(data);
            }

            let limit = read_timeout.map(|timeout| timeout.saturating_sub(started.elapsed()));
            if limit.is_some_and(|limit| limit.is_zero()) {
                return Err(Error::ReadTimeout);
            }

            wait_ready(self.stream.tcp(), false, limit).map_err(io_error)?;
        }
    }

    fn send_and_receive_for_a_while(
        &mut self,
        produce: &mut dyn Iterator<Item = Result<Bytes, Error>>,
        consume: &mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
        timeout: &Timeout,
    ) -> Result<(), Error> {
        if timeout.read_timeout().is_some_and(|limit| limit.is_zero()) {
            return Err(Error::ReadTimeout);
        }

        let mut pending = Bytes::new();
        let mut producing = true;
        let mut idle_since = Instant::now();

        loop {
            let mut progress = false;

            while pending.is_empty() && producing {
                match produce.next() {
                    Some(chunk) => pending = chunk?,
                    None => producing = false,
                }
            }

            if !pending.is_empty() {
                match self.stream.write_some(&pending) {
                    Ok(0) => {}
                    Ok(n) => {
                        pending.advance(n);
                        progress = true;
                    }
                    Err(err) => return self.finish_after_write_error(err, consume),
                }
            }

            match self.stream.flush_some() {
                Ok(0) => {}
                Ok(_) => progress = true,
                Err(err) => return self.finish_after_write_error(err, consume),
            }

            if self.drain(consume, &mut progress)? {
                if !pending.is_empty() || self.stream.has_buffered_output() {
                    log::trace!("response complete while the request was being written, closing");
                    self.forceful_close();
                }
                return Ok(());
            }

            if progress {
                idle_since = Instant::now();
                continue;
            }

            let limit = timeout.read_remaining(idle_since.elapsed());
            if limit.is_some_and(|limit| limit.is_zero()) {
                return Err(Error::ReadTimeout);
            }

            let sending = !pending.is_empty() || self.stream.has_buffered_output();
            wait_ready(self.stream.tcp(), sending, limit).map_err(io_error)?;
        }
    }

    fn forceful_close(&mut self) {
        let _ = self.stream.tcp().shutdown(Shutdown::Both);
    }

    fn is_readable(&self) -> bool {
        peek_readable(&SockRef::from(self.stream.tcp()))
    }
}
