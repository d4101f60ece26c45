use std::{cell::Cell, fmt, time::Instant};

use bytes::Bytes;

use super::{config::PoolConfig, PoolKey};
use crate::{
    backend::{AsyncBackend, AsyncSocket, ConnectOptions, LoopControl},
    body::{async_chunks, AsyncBody},
    error::{Error, ProtocolError},
    h1::ResponseReader,
    request::{encode_request_head, PreparedRequest},
    response::Response,
    timeout::Timeout,
};

/// Non-blocking counterpart of [`HttpConnection`](super::HttpConnection).
pub struct AsyncHttpConnection {
    sock: Box<dyn AsyncSocket>,
    key: PoolKey,
    created: Instant,
    num_requests: usize,
    reusable: bool,
}

impl AsyncHttpConnection {
    pub(crate) async fn connect(
        backend: &dyn AsyncBackend,
        key: &PoolKey,
        config: &PoolConfig,
        timeout: &Timeout,
    ) -> Result<Self, Error> {
        let sock = backend
            .connect(ConnectOptions {
                host: key.hostname(),
                port: key.port(),
                connect_timeout: timeout.connect_timeout(),
                source_address: config.source_address,
                socket_options: &config.socket_options,
            })
            .await?;

        let sock = if key.is_tls() {
            let tls = config.tls.clone().ok_or_else(|| {
                Error::Ssl(format!("no TLS configuration to connect to {}", key).into())
            })?;
            sock.start_tls(key.hostname().to_owned(), tls).await?
        } else {
            sock
        };

        Ok(AsyncHttpConnection {
            sock,
            key: key.clone(),
            created: Instant::now(),
            num_requests: 0,
            reusable: true,
        })
    }

    pub(crate) async fn send_request(
        &mut self,
        request: &mut PreparedRequest<AsyncBody>,
        timeout: &Timeout,
    ) -> Result<Response, Error> {
        self.reusable = false;
        self.num_requests += 1;

        let head = encode_request_head(
            &request.method,
            &request.url,
            &request.headers,
            request.body.size(),
        )?;

        let sent = Cell::new(false);
        let mut reader = ResponseReader::new(&request.method);

        {
            let chunks = async_chunks(head, &mut request.body, &sent);
            let mut consume = |data: Bytes| -> Result<LoopControl, Error> {
                if reader.feed(&data)? {
                    Ok(LoopControl::Abort)
                } else {
                    Ok(LoopControl::Continue)
                }
            };

            self.sock
                .send_and_receive_for_a_while(chunks, &mut consume, timeout)
                .await?;
        }

        self.reusable = sent.get() && reader.is_reusable();

        let (head, body) = reader
            .into_response()
            .ok_or(Error::Protocol(ProtocolError::ConnectionClosed))?;

        log::debug!(
            "\"{} {} HTTP/1.1\" {} {}",
            request.method,
            request.url.request_uri(),
            head.status.as_u16(),
            body.len()
        );

        Ok(Response::new(head, body, request.url.clone()))
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn num_requests(&self) -> usize {
        self.num_requests
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub fn is_dropped(&self) -> bool {
        self.sock.is_readable()
    }

    pub fn peer_certificate(&self) -> Option<Bytes> {
        self.sock.peer_certificate()
    }

    pub(crate) fn set_idle(&mut self, idle: bool) {
        self.sock.set_readable_watch_state(idle);
    }

    pub fn close(&mut self) {
        self.reusable = false;
        self.sock.forceful_close();
    }
}

impl fmt::Debug for AsyncHttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHttpConnection")
            .field("key", &self.key)
            .field("age", &self.created.elapsed())
            .field("num_requests", &self.num_requests)
            .field("reusable", &self.reusable)
            .finish()
    }
}
