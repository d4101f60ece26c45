//! HTTP/1.1 wire format, without I/O.
//!
//! The connection layer feeds received bytes into a [`ResponseReader`] until it reports a complete
//! response, and sends what [`encode_head`] and [`encode_chunk`] produce.

use std::task::Poll;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, Method, StatusCode, Version,
};

use crate::error::ProtocolError;

pub(crate) const MAX_BUFFER_SIZE: usize = 131_072;
const MAX_HEADERS: usize = 100;

/// Serialize a request line and headers.
pub(crate) fn encode_head(method: &Method, target: &str, headers: &HeaderMap) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.extend_from_slice(method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    for (name, value) in headers {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

/// Frame one chunk of a chunked request body.
pub(crate) fn encode_chunk(data: &[u8]) -> Bytes {
    let size = format!("{:X}\r\n", data.len());
    let mut buf = BytesMut::with_capacity(size.len() + data.len() + 2);
    buf.extend_from_slice(size.as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

/// Parsed status line and headers.
#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}

macro_rules! byte (
    ($rdr:ident) => ({
        if !$rdr.is_empty() {
            let b = $rdr[0];
            $rdr.advance(1);
            b
        } else {
            return Poll::Pending
        }
    })
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    EndCr,
    EndLf,
    End,
}

impl ChunkedState {
    fn step(
        self,
        rdr: &mut BytesMut,
        size: &mut u64,
        out: &mut BytesMut,
    ) -> Poll<Result<ChunkedState, ProtocolError>> {
        use ChunkedState::*;

        match self {
            Size => ChunkedState::read_size(rdr, size),
            SizeLws => ChunkedState::read_size_lws(rdr),
            Extension => ChunkedState::read_extension(rdr),
            SizeLf => ChunkedState::read_size_lf(rdr, *size),
            Body => ChunkedState::read_body(rdr, size, out),
            BodyCr => ChunkedState::expect(rdr, b'\r', BodyLf),
            BodyLf => ChunkedState::expect(rdr, b'\n', Size),
            Trailer => ChunkedState::read_trailer(rdr),
            EndCr => ChunkedState::read_end_cr(rdr),
            EndLf => ChunkedState::expect(rdr, b'\n', End),
            End => Poll::Ready(Ok(End)),
        }
    }

    fn read_size(rdr: &mut BytesMut, size: &mut u64) -> Poll<Result<ChunkedState, ProtocolError>> {
        let rem = match byte!(rdr) {
            b @ b'0'..=b'9' => b - b'0',
            b @ b'a'..=b'f' => b + 10 - b'a',
            b @ b'A'..=b'F' => b + 10 - b'A',
            b'\t' | b' ' => return Poll::Ready(Ok(ChunkedState::SizeLws)),
            b';' => return Poll::Ready(Ok(ChunkedState::Extension)),
            b'\r' => return Poll::Ready(Ok(ChunkedState::SizeLf)),
            _ => return Poll::Ready(Err(ProtocolError::Chunked)),
        };

        match size.checked_mul(16) {
            Some(n) => {
                *size = n + u64::from(rem);
                Poll::Ready(Ok(ChunkedState::Size))
            }
            None => {
                log::debug!("chunk size would overflow u64");
                Poll::Ready(Err(ProtocolError::Chunked))
            }
        }
    }

    fn read_size_lws(rdr: &mut BytesMut) -> Poll<Result<ChunkedState, ProtocolError>> {
        match byte!(rdr) {
            b'\t' | b' ' => Poll::Ready(Ok(ChunkedState::SizeLws)),
            b';' => Poll::Ready(Ok(ChunkedState::Extension)),
            b'\r' => Poll::Ready(Ok(ChunkedState::SizeLf)),
            _ => Poll::Ready(Err(ProtocolError::Chunked)),
        }
    }

    fn read_extension(rdr: &mut BytesMut) -> Poll<Result<ChunkedState, ProtocolError>> {
        match byte!(rdr) {
            b'\r' => Poll::Ready(Ok(ChunkedState::SizeLf)),
            0x00..=0x08 | 0x0a..=0x1f | 0x7f => Poll::Ready(Err(ProtocolError::Chunked)),
            _ => Poll::Ready(Ok(ChunkedState::Extension)),
        }
    }

    fn read_size_lf(rdr: &mut BytesMut, size: u64) -> Poll<Result<ChunkedState, ProtocolError>> {
        match byte!(rdr) {
            b'\n' if size > 0 => Poll::Ready(Ok(ChunkedState::Body)),
            b'\n' => Poll::Ready(Ok(ChunkedState::EndCr)),
            _ => Poll::Ready(Err(ProtocolError::Chunked)),
        }
    }

    fn read_body(
        rdr: &mut BytesMut,
        rem: &mut u64,
        out: &mut BytesMut,
    ) -> Poll<Result<ChunkedState, ProtocolError>> {
        if rdr.is_empty() {
            return Poll::Pending;
        }

        let len = rdr.len() as u64;
        if *rem > len {
            out.extend_from_slice(&rdr.split());
            *rem -= len;
            Poll::Ready(Ok(ChunkedState::Body))
        } else {
            // rem <= len, which fits in usize
            out.extend_from_slice(&rdr.split_to(*rem as usize));
            *rem = 0;
            Poll::Ready(Ok(ChunkedState::BodyCr))
        }
    }

    fn read_trailer(rdr: &mut BytesMut) -> Poll<Result<ChunkedState, ProtocolError>> {
        match byte!(rdr) {
            b'\n' => Poll::Ready(Ok(ChunkedState::EndCr)),
            _ => Poll::Ready(Ok(ChunkedState::Trailer)),
        }
    }

    fn read_end_cr(rdr: &mut BytesMut) -> Poll<Result<ChunkedState, ProtocolError>> {
        match byte!(rdr) {
            b'\r' => Poll::Ready(Ok(ChunkedState::EndLf)),
            _ => Poll::Ready(Ok(ChunkedState::Trailer)),
        }
    }

    fn expect(
        rdr: &mut BytesMut,
        expected: u8,
        next: ChunkedState,
    ) -> Poll<Result<ChunkedState, ProtocolError>> {
        if byte!(rdr) == expected {
            Poll::Ready(Ok(next))
        } else {
            Poll::Ready(Err(ProtocolError::Chunked))
        }
    }
}

#[derive(Debug)]
enum Framing {
    /// No body follows the head.
    Empty,
    Length { remaining: u64, expected: u64 },
    Chunked { state: ChunkedState, size: u64 },
    /// Body ends when the server closes the connection.
    Eof,
}

/// Incremental HTTP/1.1 response parser.
#[derive(Debug)]
pub(crate) struct ResponseReader {
    head_request: bool,
    buf: BytesMut,
    head: Option<ResponseHead>,
    framing: Framing,
    body: BytesMut,
    keep_alive: bool,
    complete: bool,
}

impl ResponseReader {
    pub(crate) fn new(method: &Method) -> Self {
        ResponseReader {
            head_request: *method == Method::HEAD,
            buf: BytesMut::new(),
            head: None,
            framing: Framing::Empty,
            body: BytesMut::new(),
            keep_alive: false,
            complete: false,
        }
    }

    /// Feed received bytes; an empty slice signals that the peer closed the connection.
    ///
    /// Returns `true` once a full response has been read.
    pub(crate) fn feed(&mut self, data: &[u8]) -> Result<bool, ProtocolError> {
        if data.is_empty() {
            return self.feed_eof();
        }

        if self.complete {
            // bytes after a complete response leave the connection in an unknown state
            self.keep_alive = false;
            return Ok(true);
        }

        self.buf.extend_from_slice(data);

        if self.head.is_none() && !self.parse_head()? {
            return Ok(false);
        }

        self.read_body()?;
        Ok(self.complete)
    }

    fn feed_eof(&mut self) -> Result<bool, ProtocolError> {
        self.keep_alive = false;

        if self.complete {
            return Ok(true);
        }

        match self.framing {
            _ if self.head.is_none() => Err(ProtocolError::ConnectionClosed),
            Framing::Eof => {
                self.complete = true;
                Ok(true)
            }
            Framing::Length {
                remaining,
                expected,
            } => Err(ProtocolError::IncompleteBody {
                expected,
                received: expected - remaining,
            }),
            Framing::Chunked { .. } => Err(ProtocolError::Chunked),
            Framing::Empty => {
                self.complete = true;
                Ok(true)
            }
        }
    }

    /// Parse heads off the buffer until a final one is found.
    fn parse_head(&mut self) -> Result<bool, ProtocolError> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut res = httparse::Response::new(&mut headers);

            let len = match res.parse(&self.buf).map_err(ProtocolError::Head)? {
                httparse::Status::Complete(len) => len,
                httparse::Status::Partial => {
                    if self.buf.len() >= MAX_BUFFER_SIZE {
                        log::error!("MAX_BUFFER_SIZE unprocessed data reached, closing");
                        return Err(ProtocolError::Header);
                    }
                    return Ok(false);
                }
            };

            let version = match res.version {
                Some(1) => Version::HTTP_11,
                Some(_) => Version::HTTP_10,
                None => return Err(ProtocolError::Status),
            };

            let status = res
                .code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .ok_or(ProtocolError::Status)?;

            let mut map = HeaderMap::with_capacity(res.headers.len());
            for h in res.headers.iter() {
                let name =
                    HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| ProtocolError::Header)?;
                let value = HeaderValue::from_bytes(h.value).map_err(|_| ProtocolError::Header)?;
                map.append(name, value);
            }

            self.buf.advance(len);

            if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                log::trace!("skipping informational response {}", status);
                continue;
            }

            self.set_head(ResponseHead {
                status,
                version,
                headers: map,
            })?;
            return Ok(true);
        }
    }

    fn set_head(&mut self, head: ResponseHead) -> Result<(), ProtocolError> {
        let mut content_length = None;
        let mut chunked = false;

        for value in head.headers.get_all(header::CONTENT_LENGTH) {
            let len = value
                .to_str()
                .ok()
                .map(str::trim)
                .filter(|len| !len.starts_with('+'))
                .and_then(|len| len.parse::<u64>().ok())
                .ok_or(ProtocolError::ContentLength)?;

            if content_length.map_or(false, |prev| prev != len) {
                log::debug!("conflicting Content-Length headers");
                return Err(ProtocolError::ContentLength);
            }
            content_length = Some(len);
        }

        let has_te = head.headers.contains_key(header::TRANSFER_ENCODING);
        if has_te && head.version == Version::HTTP_11 {
            chunked = head
                .headers
                .get_all(header::TRANSFER_ENCODING)
                .iter()
                .last()
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.rsplit(',').next())
                .map_or(false, |coding| coding.trim().eq_ignore_ascii_case("chunked"));
        }

        let connection = head
            .headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .map(str::trim);

        let mut close = false;
        let mut keep_alive = false;
        for token in connection {
            if token.eq_ignore_ascii_case("close") {
                close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        }

        let status = head.status;
        self.framing = if self.head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            Framing::Empty
        } else if chunked {
            Framing::Chunked {
                state: ChunkedState::Size,
                size: 0,
            }
        } else if has_te {
            Framing::Eof
        } else if let Some(len) = content_length {
            Framing::Length {
                remaining: len,
                expected: len,
            }
        } else {
            Framing::Eof
        };

        self.keep_alive = !close
            && status != StatusCode::SWITCHING_PROTOCOLS
            && !matches!(self.framing, Framing::Eof)
            && (head.version == Version::HTTP_11 || keep_alive);

        self.head = Some(head);
        Ok(())
    }

    fn read_body(&mut self) -> Result<(), ProtocolError> {
        match &mut self.framing {
            Framing::Empty => {
                self.complete = true;
            }

            Framing::Length { remaining, .. } => {
                let take = (*remaining).min(self.buf.len() as u64);
                // take <= buf.len(), which fits in usize
                self.body.extend_from_slice(&self.buf.split_to(take as usize));
                *remaining -= take;
                self.complete = *remaining == 0;
            }

            Framing::Chunked { state, size } => loop {
                *state = match state.step(&mut self.buf, size, &mut self.body) {
                    Poll::Pending => break,
                    Poll::Ready(Ok(state)) => state,
                    Poll::Ready(Err(err)) => return Err(err),
                };

                if *state == ChunkedState::End {
                    log::trace!("end of chunked response body");
                    self.complete = true;
                    break;
                }
            },

            Framing::Eof => {
                self.body.extend_from_slice(&self.buf.split());
            }
        }

        if self.complete && !self.buf.is_empty() {
            self.keep_alive = false;
        }

        Ok(())
    }

    /// The connection can carry another request.
    pub(crate) fn is_reusable(&self) -> bool {
        self.complete && self.keep_alive
    }

    pub(crate) fn into_response(self) -> Option<(ResponseHead, Bytes)> {
        let head = self.head?;
        Some((head, self.body.freeze()))
    }
}
