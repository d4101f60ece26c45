use std::{fmt, time::Instant};

use bytes::Bytes;

use super::{config::PoolConfig, PoolKey};
use crate::{
    backend::{ConnectOptions, LoopControl, SyncBackend, SyncSocket},
    body::{Body, BodyChunks},
    error::{Error, ProtocolError},
    h1::ResponseReader,
    request::{encode_request_head, PreparedRequest},
    response::Response,
    timeout::Timeout,
};

/// A blocking HTTP/1.1 connection to one host.
pub struct HttpConnection {
    sock: Box<dyn SyncSocket>,
    key: PoolKey,
    created: Instant,
    num_requests: usize,
    reusable: bool,
}

impl HttpConnection {
    /// Connect to `key`, upgrading to TLS for `https`.
    pub(crate) fn connect(
        backend: &dyn SyncBackend,
        key: &PoolKey,
        config: &PoolConfig,
        timeout: &Timeout,
    ) -> Result<Self, Error> {
        let sock = backend.connect(&ConnectOptions {
            host: key.hostname(),
            port: key.port(),
            connect_timeout: timeout.connect_timeout(),
            source_address: config.source_address,
            socket_options: &config.socket_options,
        })?;

        let sock = if key.is_tls() {
            let tls = config.tls.as_ref().ok_or_else(|| {
                Error::Ssl(format!("no TLS configuration to connect to {}", key).into())
            })?;
            sock.start_tls(key.hostname(), tls)?
        } else {
            sock
        };

        Ok(HttpConnection {
            sock,
            key: key.clone(),
            created: Instant::now(),
            num_requests: 0,
            reusable: true,
        })
    }

    /// Send `request` and read the complete response.
    ///
    /// The connection stays reusable only if the request went out in full and the response
    /// allows keep-alive.
    pub(crate) fn send_request(
        &mut self,
        request: &mut PreparedRequest<Body>,
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

        let mut reader = ResponseReader::new(&request.method);
        let mut chunks = BodyChunks::new(head, &mut request.body);

        self.sock.send_and_receive_for_a_while(
            &mut chunks,
            &mut |data: Bytes| {
                if reader.feed(&data)? {
                    Ok(LoopControl::Abort)
                } else {
                    Ok(LoopControl::Continue)
                }
            },
            timeout,
        )?;

        let sent = chunks.is_finished();
        self.reusable = sent && reader.is_reusable();

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

    /// Requests sent over this connection so far.
    pub fn num_requests(&self) -> usize {
        self.num_requests
    }

    /// The last exchange left the connection fit for another request.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// The peer closed the connection or sent unsolicited data while it sat idle.
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

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("key", &self.key)
            .field("age", &self.created.elapsed())
            .field("num_requests", &self.num_requests)
            .field("reusable", &self.reusable)
            .finish()
    }
}
