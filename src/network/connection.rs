//! Connection plumbing shared by client and server
//!
//! Manages:
//! - Reading packages from an arbitrarily chunked byte stream
//! - Serialized package writes from any task
//! - The error type both peer roles report

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::ConnectionState;
use crate::protocol::{
    encode_into, BodyError, Message, MessageError, Package, PackageDecoder, PackageError,
    PackageType,
};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Package(#[from] PackageError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Body codec error: {0}")]
    Body(#[from] BodyError),

    #[error("Handshake payload error: {0}")]
    Handshake(#[from] serde_json::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Handshake rejected by server (code {0})")]
    HandshakeRejected(u16),

    #[error("Client version rejected by server; upgrade the client")]
    VersionRejected,

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("Request timeout")]
    RequestTimeout,

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Kicked by server: {0}")]
    Kicked(String),

    #[error("Connection is {0}, not working")]
    NotWorking(ConnectionState),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

pub(crate) type BoxedRead = Pin<Box<dyn AsyncRead + Send>>;
pub(crate) type BoxedWrite = Pin<Box<dyn AsyncWrite + Send>>;

/// Split any duplex stream into boxed halves
pub(crate) fn split_stream<S>(stream: S) -> (BoxedRead, BoxedWrite)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (Box::pin(read), Box::pin(write))
}

const READ_CHUNK: usize = 4096;

/// Reads whole packages off a byte stream
pub struct PackageReader<R> {
    reader: R,
    decoder: PackageDecoder,
    ready: VecDeque<Package>,
    buf: Box<[u8]>,
    bytes_received: u64,
}

impl<R: AsyncRead + Unpin> PackageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: PackageDecoder::new(),
            ready: VecDeque::new(),
            buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
            bytes_received: 0,
        }
    }

    /// Next package, or `None` on a clean end of stream
    ///
    /// Cancel safe: packages completed by a read are queued before this
    /// returns, so dropping the future between reads loses nothing.
    pub async fn next(&mut self) -> ConnectionResult<Option<Package>> {
        loop {
            if let Some(package) = self.ready.pop_front() {
                return Ok(Some(package));
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return if self.decoder.buffered() == 0 {
                    Ok(None)
                } else {
                    Err(ConnectionError::Closed)
                };
            }

            self.bytes_received += n as u64;
            self.ready.extend(self.decoder.feed(&self.buf[..n])?);
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

/// Cloneable handle for writing packages
///
/// All writes on a connection go through one lock, so packages from
/// different tasks never interleave on the wire.
#[derive(Clone)]
pub struct PackageWriter {
    inner: Arc<Mutex<WriterInner>>,
}

struct WriterInner {
    stream: Option<BoxedWrite>,
    buf: BytesMut,
}

impl PackageWriter {
    pub(crate) fn new(stream: BoxedWrite) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WriterInner {
                stream: Some(stream),
                buf: BytesMut::with_capacity(READ_CHUNK),
            })),
        }
    }

    /// Write one package and flush
    pub async fn send(&self, package_type: PackageType, body: &[u8]) -> ConnectionResult<()> {
        let mut inner = self.inner.lock().await;
        let WriterInner { stream, buf } = &mut *inner;
        let stream = stream.as_mut().ok_or(ConnectionError::Closed)?;

        buf.clear();
        encode_into(package_type, body, buf)?;
        stream.write_all(buf).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn send_empty(&self, package_type: PackageType) -> ConnectionResult<()> {
        self.send(package_type, &[]).await
    }

    /// Encode `message` and send it in a Data package
    pub async fn send_message(&self, message: &Message) -> ConnectionResult<()> {
        let body: Bytes = message.encode()?;
        self.send(PackageType::Data, &body).await
    }

    /// Shut the write side down; later sends fail with `Closed`
    pub async fn shutdown(&self) {
        let stream = self.inner.lock().await.stream.take();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Shutdown error: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for PackageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageWriter").finish_non_exhaustive()
    }
}
