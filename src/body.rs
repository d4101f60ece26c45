//! Request bodies.
//!
//! Bodies that might be resent after a retry or redirect record their position before the first
//! attempt and are rewound to it before every later one.

use std::{
    cell::Cell,
    fmt,
    io::{self, Read, Seek, SeekFrom},
};

use bytes::{Bytes, BytesMut};
use futures_core::stream::LocalBoxStream;
use futures_util::{stream, StreamExt as _};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncSeek, AsyncSeekExt as _};

use crate::{error::Error, h1};

const CHUNK_SIZE: usize = 8192;

const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

const RECORD_FAILED: &str =
    "Unable to record file position for rewinding request body during a redirect/retry.";

const REWIND_FAILED: &str = "An error occurred when rewinding request body for redirect/retry.";

/// Blocking reader that can be rewound.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Non-blocking reader that can be rewound.
pub trait AsyncReadSeek: AsyncRead + AsyncSeek + Unpin {}

impl<T: AsyncRead + AsyncSeek + Unpin> AsyncReadSeek for T {}

/// Where to rewind a body to before resending it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPosition {
    At(u64),
    /// Position could not be recorded; the body cannot be resent.
    Failed,
}

fn rewind_error(pos: BodyPosition) -> Error {
    match pos {
        BodyPosition::Failed => Error::UnrewindableBody(RECORD_FAILED),
        BodyPosition::At(_) => Error::UnrewindableBody(REWIND_FAILED),
    }
}

/// Request body for the blocking client.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,

    /// In-memory payload sent with `Content-Length`.
    Bytes(Bytes),

    /// Seekable payload sent with chunked transfer coding.
    Reader(Box<dyn ReadSeek>),

    /// One-shot payload sent with chunked transfer coding; cannot be resent.
    Stream(Box<dyn Read + Send>),
}

impl Body {
    pub fn reader<R: Read + Seek + Send + 'static>(reader: R) -> Self {
        Body::Reader(Box::new(reader))
    }

    pub fn stream<R: Read + Send + 'static>(reader: R) -> Self {
        Body::Stream(Box::new(reader))
    }

    /// Length in bytes when known up front.
    pub fn size(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len() as u64),
            Body::Reader(_) | Body::Stream(_) => None,
        }
    }

    pub(crate) fn record_position(&mut self) -> BodyPosition {
        match self {
            Body::Empty | Body::Bytes(_) => BodyPosition::At(0),
            Body::Reader(reader) => match reader.stream_position() {
                Ok(pos) => BodyPosition::At(pos),
                Err(err) => {
                    log::debug!("Failed to record request body position: {}", err);
                    BodyPosition::Failed
                }
            },
            Body::Stream(_) => BodyPosition::Failed,
        }
    }

    pub(crate) fn rewind(&mut self, pos: BodyPosition) -> Result<(), Error> {
        match (self, pos) {
            (_, BodyPosition::Failed) => Err(rewind_error(pos)),
            (Body::Reader(reader), BodyPosition::At(at)) => reader
                .seek(SeekFrom::Start(at))
                .map(|_| ())
                .map_err(|_| rewind_error(pos)),
            (Body::Stream(_), _) => Err(rewind_error(BodyPosition::Failed)),
            (Body::Empty | Body::Bytes(_), _) => Ok(()),
        }
    }

    fn read_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        let reader: &mut dyn Read = match self {
            Body::Reader(reader) => reader,
            Body::Stream(reader) => reader,
            Body::Empty | Body::Bytes(_) => return Ok(None),
        };

        let mut buf = BytesMut::zeroed(CHUNK_SIZE);
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf.freeze()));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Body(err)),
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(bytes) => write!(f, "Body::Bytes({:?})", bytes),
            Body::Reader(_) => f.write_str("Body::Reader(..)"),
            Body::Stream(_) => f.write_str("Body::Stream(..)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Body::Bytes(Bytes::from_static(bytes))
    }
}

/// Request body for the async client.
#[derive(Default)]
pub enum AsyncBody {
    #[default]
    Empty,

    /// In-memory payload sent with `Content-Length`.
    Bytes(Bytes),

    /// Seekable payload sent with chunked transfer coding.
    Reader(Box<dyn AsyncReadSeek>),
}

impl AsyncBody {
    pub fn reader<R: AsyncRead + AsyncSeek + Unpin + 'static>(reader: R) -> Self {
        AsyncBody::Reader(Box::new(reader))
    }

    /// Length in bytes when known up front.
    pub fn size(&self) -> Option<u64> {
        match self {
            AsyncBody::Empty => Some(0),
            AsyncBody::Bytes(bytes) => Some(bytes.len() as u64),
            AsyncBody::Reader(_) => None,
        }
    }

    pub(crate) async fn record_position(&mut self) -> BodyPosition {
        match self {
            AsyncBody::Empty | AsyncBody::Bytes(_) => BodyPosition::At(0),
            AsyncBody::Reader(reader) => match reader.stream_position().await {
                Ok(pos) => BodyPosition::At(pos),
                Err(err) => {
                    log::debug!("Failed to record request body position: {}", err);
                    BodyPosition::Failed
                }
            },
        }
    }

    pub(crate) async fn rewind(&mut self, pos: BodyPosition) -> Result<(), Error> {
        match (self, pos) {
            (_, BodyPosition::Failed) => Err(rewind_error(pos)),
            (AsyncBody::Reader(reader), BodyPosition::At(at)) => reader
                .seek(SeekFrom::Start(at))
                .await
                .map(|_| ())
                .map_err(|_| rewind_error(pos)),
            (AsyncBody::Empty | AsyncBody::Bytes(_), _) => Ok(()),
        }
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        let AsyncBody::Reader(reader) = self else {
            return Ok(None);
        };

        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        match reader.read_buf(&mut buf).await {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf.freeze())),
            Err(err) => Err(Error::Body(err)),
        }
    }
}

impl fmt::Debug for AsyncBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncBody::Empty => f.write_str("AsyncBody::Empty"),
            AsyncBody::Bytes(bytes) => write!(f, "AsyncBody::Bytes({:?})", bytes),
            AsyncBody::Reader(_) => f.write_str("AsyncBody::Reader(..)"),
        }
    }
}

impl From<Bytes> for AsyncBody {
    fn from(bytes: Bytes) -> Self {
        AsyncBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for AsyncBody {
    fn from(bytes: Vec<u8>) -> Self {
        AsyncBody::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for AsyncBody {
    fn from(s: String) -> Self {
        AsyncBody::Bytes(Bytes::from(s))
    }
}

impl From<&'static str> for AsyncBody {
    fn from(s: &'static str) -> Self {
        AsyncBody::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for AsyncBody {
    fn from(bytes: &'static [u8]) -> Self {
        AsyncBody::Bytes(Bytes::from_static(bytes))
    }
}

/// Outgoing byte chunks of one request: encoded head, then the framed body.
pub(crate) struct BodyChunks<'a> {
    head: Option<Bytes>,
    pending: Option<Bytes>,
    body: &'a mut Body,
    chunked: bool,
    done: bool,
    finished: bool,
}

impl<'a> BodyChunks<'a> {
    pub(crate) fn new(head: Bytes, body: &'a mut Body) -> Self {
        let chunked = body.size().is_none();
        let pending = match body {
            Body::Bytes(bytes) if !bytes.is_empty() => Some(bytes.clone()),
            _ => None,
        };

        BodyChunks {
            head: Some(head),
            pending,
            body,
            chunked,
            done: false,
            finished: false,
        }
    }

    /// Every chunk, including the terminating one, was handed out.
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Iterator for BodyChunks<'_> {
    type Item = Result<Bytes, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = if let Some(head) = self.head.take() {
            head
        } else if let Some(bytes) = self.pending.take() {
            bytes
        } else if self.done || !self.chunked {
            return None;
        } else {
            match self.body.read_chunk() {
                Ok(Some(chunk)) => h1::encode_chunk(&chunk),
                Ok(None) => {
                    self.done = true;
                    self.finished = true;
                    return Some(Ok(Bytes::from_static(LAST_CHUNK)));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        };

        // a sized body is complete once its payload is out
        if !self.chunked && self.pending.is_none() {
            self.finished = true;
        }

        Some(Ok(chunk))
    }
}

struct AsyncChunks<'a> {
    head: Option<Bytes>,
    pending: Option<Bytes>,
    body: &'a mut AsyncBody,
    chunked: bool,
    done: bool,
    finished: &'a Cell<bool>,
}

async fn next_async_chunk(
    mut state: AsyncChunks<'_>,
) -> Result<Option<(Bytes, AsyncChunks<'_>)>, Error> {
    let chunk = if let Some(head) = state.head.take() {
        head
    } else if let Some(bytes) = state.pending.take() {
        bytes
    } else if state.done || !state.chunked {
        return Ok(None);
    } else {
        match state.body.read_chunk().await {
            Ok(Some(chunk)) => h1::encode_chunk(&chunk),
            Ok(None) => {
                state.done = true;
                state.finished.set(true);
                return Ok(Some((Bytes::from_static(LAST_CHUNK), state)));
            }
            Err(err) => return Err(err),
        }
    };

    if !state.chunked && state.pending.is_none() {
        state.finished.set(true);
    }

    Ok(Some((chunk, state)))
}

/// Async counterpart of [`BodyChunks`]; `finished` is set as soon as the last chunk is yielded.
pub(crate) fn async_chunks<'a>(
    head: Bytes,
    body: &'a mut AsyncBody,
    finished: &'a Cell<bool>,
) -> LocalBoxStream<'a, Result<Bytes, Error>> {
    let chunked = body.size().is_none();
    let pending = match body {
        AsyncBody::Bytes(bytes) if !bytes.is_empty() => Some(bytes.clone()),
        _ => None,
    };

    let state = AsyncChunks {
        head: Some(head),
        pending,
        body,
        chunked,
        done: false,
        finished,
    };

    stream::try_unfold(state, next_async_chunk).boxed_local()
}
