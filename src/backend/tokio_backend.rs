use std::{
    cell::Cell,
    io,
    net::Shutdown,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use actix_rt::time::timeout;
use bytes::{Bytes, BytesMut};
use futures_core::future::LocalBoxFuture;
use futures_util::{
    future::{self, Either},
    pin_mut, StreamExt as _,
};
use socket2::SockRef;
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf, ReadHalf, WriteHalf},
    net::{TcpSocket, TcpStream},
};

use super::{
    apply_socket_options, peek_readable, AsyncBackend, AsyncSocket, ConnectOptions, LoopControl,
    Producer, SocketOption, TlsConfig, BUFSIZE,
};
use crate::{
    error::{Error, ProtocolError},
    timeout::Timeout,
};

/// Backend driving sockets on the tokio reactor of the current `actix-rt` system.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioBackend;

impl AsyncBackend for TokioBackend {
    fn name(&self) -> &'static str {
        "tokio"
    }

    fn connect<'a>(
        &'a self,
        opts: ConnectOptions<'a>,
    ) -> LocalBoxFuture<'a, Result<Box<dyn AsyncSocket>, Error>> {
        Box::pin(async move {
            if let Some(option) = opts
                .socket_options
                .iter()
                .find(|option| matches!(option, SocketOption::Raw { .. }))
            {
                return Err(Error::NotSupported(format!(
                    "socket option {:?} is not supported by this backend",
                    option
                )));
            }

            let stream = match opts.connect_timeout {
                Some(dur) => timeout(dur, connect_any(&opts))
                    .await
                    .map_err(|_| Error::ConnectTimeout {
                        host: opts.host.to_owned(),
                        port: opts.port,
                    })??,
                None => connect_any(&opts).await?,
            };

            apply_socket_options(&SockRef::from(&stream), opts.socket_options)
                .map_err(Error::NewConnection)?;

            Ok(Box::new(TokioSocket {
                stream: TokioStream::Plain(stream),
            }) as Box<dyn AsyncSocket>)
        })
    }
}

async fn connect_any(opts: &ConnectOptions<'_>) -> Result<TcpStream, Error> {
    let addrs = tokio::net::lookup_host((opts.host, opts.port))
        .await
        .map_err(Error::NewConnection)?;

    let mut last_err = None;

    for addr in addrs {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(Error::NewConnection)?;

        if let Some(source) = opts.source_address {
            if let Err(err) = socket.bind(source) {
                last_err = Some(err);
                continue;
            }
        }

        match socket.connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                log::trace!("connecting to {} failed: {}", addr, err);
                last_err = Some(err);
            }
        }
    }

    Err(Error::NewConnection(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("could not resolve {}", opts.host),
        )
    })))
}

fn io_error(err: io::Error) -> Error {
    Error::Protocol(ProtocolError::Io(err))
}

enum TokioStream {
    Plain(TcpStream),
    #[cfg(feature = "rustls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl TokioStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            TokioStream::Plain(tcp) => tcp,
            #[cfg(feature = "rustls")]
            TokioStream::Tls(tls) => tls.get_ref().0,
        }
    }
}

impl AsyncRead for TokioStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TokioStream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            #[cfg(feature = "rustls")]
            TokioStream::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TokioStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TokioStream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            #[cfg(feature = "rustls")]
            TokioStream::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TokioStream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            #[cfg(feature = "rustls")]
            TokioStream::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TokioStream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            #[cfg(feature = "rustls")]
            TokioStream::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

/// TCP connection on the tokio reactor, optionally wrapped in TLS.
pub struct TokioSocket {
    stream: TokioStream,
}

/// Read once, mapping timeouts and an unannounced TLS close.
async fn read_some<R: AsyncRead + Unpin>(
    rd: &mut R,
    read_timeout: Option<Duration>,
) -> Result<Bytes, Error> {
    let mut buf = BytesMut::with_capacity(BUFSIZE);

    let res = match read_timeout {
        Some(dur) if dur.is_zero() => return Err(Error::ReadTimeout),
        Some(dur) => timeout(dur, rd.read_buf(&mut buf))
            .await
            .map_err(|_| Error::ReadTimeout)?,
        None => rd.read_buf(&mut buf).await,
    };

    match res {
        Ok(_) => Ok(buf.freeze()),
        // peer closed without a TLS close_notify
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(Bytes::new()),
        Err(err) => Err(io_error(err)),
    }
}

/// `writing` is set while a chunk is partly written.
async fn send_all(
    wr: &mut WriteHalf<&mut TokioStream>,
    mut produce: Producer<'_>,
    writing: &Cell<bool>,
) -> Result<(), Error> {
    while let Some(chunk) = produce.next().await {
        let chunk = chunk?;
        writing.set(true);
        wr.write_all(&chunk).await.map_err(io_error)?;
        writing.set(false);
    }

    writing.set(true);
    wr.flush().await.map_err(io_error)?;
    writing.set(false);
    Ok(())
}

/// Every read gets whatever is left of the budget at the time it starts.
async fn receive_all(
    rd: &mut ReadHalf<&mut TokioStream>,
    consume: &mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
    timeout: Option<&Timeout>,
) -> Result<(), Error> {
    loop {
        let data = read_some(rd, timeout.and_then(Timeout::read_timeout)).await?;
        let eof = data.is_empty();

        match consume(data)? {
            LoopControl::Abort => return Ok(()),
            LoopControl::Continue if eof => return Err(ProtocolError::ConnectionClosed.into()),
            LoopControl::Continue => {}
        }
    }
}

impl AsyncSocket for TokioSocket {
    #[cfg(feature = "rustls")]
    fn start_tls(
        self: Box<Self>,
        server_hostname: String,
        tls: TlsConfig,
    ) -> LocalBoxFuture<'static, Result<Box<dyn AsyncSocket>, Error>> {
        use rustls::pki_types::ServerName;

        Box::pin(async move {
            let tcp = match self.stream {
                TokioStream::Plain(tcp) => tcp,
                TokioStream::Tls(_) => {
                    return Err(Error::NotSupported("TLS is already active".to_owned()));
                }
            };

            let name = ServerName::try_from(server_hostname.clone())
                .map_err(|err| Error::Ssl(Box::new(err)))?;

            let stream = tokio_rustls::TlsConnector::from(tls)
                .connect(name, tcp)
                .await
                .map_err(|err| Error::Ssl(Box::new(err)))?;

            log::trace!("TLS handshake with {} done", server_hostname);

            Ok(Box::new(TokioSocket {
                stream: TokioStream::Tls(Box::new(stream)),
            }) as Box<dyn AsyncSocket>)
        })
    }

    #[cfg(not(feature = "rustls"))]
    fn start_tls(
        self: Box<Self>,
        _server_hostname: String,
        _tls: TlsConfig,
    ) -> LocalBoxFuture<'static, Result<Box<dyn AsyncSocket>, Error>> {
        Box::pin(future::ready(Err(Error::NotSupported(
            "TLS support is not enabled; build with the `rustls` feature".to_owned(),
        ))))
    }

    fn peer_certificate(&self) -> Option<Bytes> {
        match &self.stream {
            TokioStream::Plain(_) => None,
            #[cfg(feature = "rustls")]
            TokioStream::Tls(tls) => tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| Bytes::copy_from_slice(cert.as_ref())),
        }
    }

    fn receive_some<'a>(
        &'a mut self,
        read_timeout: Option<Duration>,
    ) -> LocalBoxFuture<'a, Result<Bytes, Error>> {
        Box::pin(read_some(&mut self.stream, read_timeout))
    }

    fn send_and_receive_for_a_while<'a>(
        &'a mut self,
        produce: Producer<'a>,
        consume: &'a mut dyn FnMut(Bytes) -> Result<LoopControl, Error>,
        timeout: &'a Timeout,
    ) -> LocalBoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if timeout.read_timeout().is_some_and(|dur| dur.is_zero()) {
                return Err(Error::ReadTimeout);
            }

            let writing = Cell::new(false);
            let (mut rd, mut wr) = tokio::io::split(&mut self.stream);

            // While the request is still going out an early response may arrive; the read
            // budget only starts once everything is sent.
            let sent = {
                let send = send_all(&mut wr, produce, &writing);
                let receive = receive_all(&mut rd, &mut *consume, None);
                pin_mut!(send, receive);

                match future::select(send, receive).await {
                    Either::Left((Ok(()), _)) => None,
                    Either::Left((Err(err), _)) => Some(Err(err)),
                    Either::Right((res, _)) => Some(res),
                }
            };

            let res = match sent {
                Some(res) => res,
                None => receive_all(&mut rd, consume, Some(timeout)).await,
            };
            drop((rd, wr));

            if res.is_ok() && writing.get() {
                log::trace!("response complete while the request was being written, closing");
                self.forceful_close();
            }

            res
        })
    }

    fn forceful_close(&mut self) {
        let _ = SockRef::from(self.stream.tcp()).shutdown(Shutdown::Both);
    }

    fn is_readable(&self) -> bool {
        // tokio sockets are always non-blocking
        peek_readable(&SockRef::from(self.stream.tcp()))
    }
}
