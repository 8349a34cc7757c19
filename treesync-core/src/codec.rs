use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{Envelope, MAX_MESSAGE_SIZE, ProtocolError};

pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 64 * 1024;

/// JSON messages written back-to-back on a byte stream, with no length prefix.
///
/// Bytes read past the end of a message stay buffered, so raw transfer data
/// that follows a message is handed out by [`MessageStream::read_raw`] first.
pub struct MessageStream<S> {
    inner: S,
    buf: Vec<u8>,
    timeout: Duration,
    max_message: usize,
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            timeout: SOCKET_TIMEOUT,
            max_message: MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_message(mut self, max_message: usize) -> Self {
        self.max_message = max_message.max(1);
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let bytes = serde_json::to_vec(envelope)?;
        if bytes.len() > self.max_message {
            return Err(ProtocolError::MessageTooLarge(self.max_message));
        }
        self.write_raw(&bytes).await
    }

    /// Reads the next message. A syntactically complete JSON value that is not
    /// a valid envelope is consumed and reported as [`ProtocolError::Json`], so
    /// the stream stays aligned for the next message.
    pub async fn recv(&mut self) -> Result<Envelope, ProtocolError> {
        loop {
            if let Some((value, used)) = split_message(&self.buf)? {
                self.buf.drain(..used);
                if used > self.max_message {
                    return Err(ProtocolError::MessageTooLarge(self.max_message));
                }
                return Ok(serde_json::from_value(value)?);
            }
            if self.buf.len() >= self.max_message {
                return Err(ProtocolError::MessageTooLarge(self.max_message));
            }
            if self.fill().await? == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    /// Sends `request` and waits for the matching response.
    pub async fn exchange(&mut self, request: &Envelope) -> Result<Envelope, ProtocolError> {
        self.send(request).await?;
        let response = self.recv().await?;
        if response.command != request.command {
            return Err(ProtocolError::CommandMismatch {
                expected: request.command,
                actual: response.command,
            });
        }
        Ok(response)
    }

    pub async fn read_raw(&mut self, out: &mut [u8]) -> Result<usize, ProtocolError> {
        if out.is_empty() {
            return Ok(0);
        }
        if !self.buf.is_empty() {
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.drain(..n);
            return Ok(n);
        }
        let read = tokio::time::timeout(self.timeout, self.inner.read(out))
            .await
            .map_err(|_| ProtocolError::Timeout)??;
        Ok(read)
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let inner = &mut self.inner;
        tokio::time::timeout(self.timeout, async move {
            inner.write_all(data).await?;
            inner.flush().await
        })
        .await
        .map_err(|_| ProtocolError::Timeout)??;
        Ok(())
    }

    async fn fill(&mut self) -> Result<usize, ProtocolError> {
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);
        let result = tokio::time::timeout(self.timeout, self.inner.read(&mut self.buf[start..])).await;
        let read = match result {
            Ok(Ok(read)) => read,
            Ok(Err(err)) => {
                self.buf.truncate(start);
                return Err(err.into());
            }
            Err(_) => {
                self.buf.truncate(start);
                return Err(ProtocolError::Timeout);
            }
        };
        self.buf.truncate(start + read);
        Ok(read)
    }
}

/// Finds the first complete JSON value in `buf`. `None` means more bytes are needed.
fn split_message(buf: &[u8]) -> Result<Option<(Value, usize)>, ProtocolError> {
    let mut values = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    match values.next() {
        None => Ok(None),
        Some(Ok(value)) => Ok(Some((value, values.byte_offset()))),
        Some(Err(err)) if err.is_eof() => Ok(None),
        Some(Err(err)) => Err(err.into()),
    }
}
