// packages/relay/src/transport/rpc.rs
//! Request/response RPC between the relay and the in-container driver
//!
//! Messages are CBOR-encoded and carried over circuit framing. Every field is
//! `#[serde(default)]`, so either side may add fields without breaking an
//! older peer.
//!
//! A message may span several frames. The reader keeps a [`PartialBuffer`]
//! and retries decoding after each frame. Running out of bytes
//! ([`Decoded::Incomplete`]) is a normal outcome, while bytes that can never
//! decode are a [`RelayError::Decode`]. Continuation frames must arrive within
//! a short deadline so a stalled peer cannot wedge the caller.

use crate::transport::framed::{FramedReader, FramedWriter};
use crate::transport::header::CircuitHeader;
use crate::utils::errors::{RelayError, Result};
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

/// Deadline for each frame that continues a partially decoded message
pub const CONTINUATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on frames buffered for a single message
pub const MAX_PARTIAL_FRAMES: usize = 1024;

/// Largest payload written per frame; bigger messages are split
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Command execution request sent to the driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecRequest {
    /// Executable path inside the environment
    pub executable: String,

    /// Extra process arguments
    pub args: Vec<String>,

    /// Environment as `KEY=VALUE` entries
    pub env: Vec<String>,

    /// Bytes written to the process's stdin
    #[serde(with = "serde_bytes")]
    pub stdin: Vec<u8>,

    /// Ask the driver to exit instead of executing
    pub die: bool,
}

impl ExecRequest {
    pub fn die() -> Self {
        Self {
            die: true,
            ..Default::default()
        }
    }
}

/// Outcome of an execution, returned by the driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecResult {
    #[serde(with = "serde_bytes")]
    pub stdout: Vec<u8>,

    #[serde(with = "serde_bytes")]
    pub stderr: Vec<u8>,

    /// Process exited with status zero
    pub success: bool,

    /// Wall-clock execution time
    pub elapsed_ms: u64,
}

/// Result of a decode attempt over buffered bytes
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<T> {
    Complete(T),
    Incomplete,
}

/// Accumulates frame payloads until a whole message decodes
#[derive(Debug)]
pub struct PartialBuffer {
    buf: BytesMut,
    frames: usize,
    max_frames: usize,
}

impl PartialBuffer {
    pub fn new(max_frames: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            frames: 0,
            max_frames,
        }
    }

    /// Append one frame's payload
    pub fn push(&mut self, frame: &[u8]) -> Result<()> {
        if self.frames >= self.max_frames {
            return Err(RelayError::Decode(format!(
                "message still incomplete after {} frames ({} bytes)",
                self.frames,
                self.buf.len()
            )));
        }
        self.buf.extend_from_slice(frame);
        self.frames += 1;
        Ok(())
    }

    /// Try to decode one message from the front of the buffer.
    ///
    /// Consumed bytes are removed; trailing bytes stay for the next message.
    pub fn try_decode<T: DeserializeOwned>(&mut self) -> Result<Decoded<T>> {
        if self.buf.is_empty() {
            return Ok(Decoded::Incomplete);
        }

        let (result, consumed) = {
            let mut de = serde_cbor::Deserializer::from_slice(&self.buf);
            let result = T::deserialize(&mut de);
            (result, de.byte_offset())
        };

        match result {
            Ok(message) => {
                self.buf.advance(consumed);
                self.frames = if self.buf.is_empty() { 0 } else { 1 };
                Ok(Decoded::Complete(message))
            }
            Err(e) if e.is_eof() => Ok(Decoded::Incomplete),
            Err(e) => Err(RelayError::Decode(e.to_string())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

impl Default for PartialBuffer {
    fn default() -> Self {
        Self::new(MAX_PARTIAL_FRAMES)
    }
}

/// Reads CBOR messages from circuit frames
pub struct RpcReader<R> {
    frames: FramedReader<R, CircuitHeader>,
    buffer: PartialBuffer,
    first_frame_timeout: Option<Duration>,
    continuation_timeout: Duration,
}

impl<R> RpcReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            frames: FramedReader::new(inner, CircuitHeader),
            buffer: PartialBuffer::default(),
            first_frame_timeout: None,
            continuation_timeout: CONTINUATION_TIMEOUT,
        }
    }

    pub fn with_continuation_timeout(mut self, timeout: Duration) -> Self {
        self.continuation_timeout = timeout;
        self
    }

    /// Bound the wait for the first frame of the next message
    pub fn set_first_frame_timeout(&mut self, timeout: Option<Duration>) {
        self.first_frame_timeout = timeout;
    }

    /// Read the next complete message
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        if let Decoded::Complete(message) = self.buffer.try_decode()? {
            return Ok(message);
        }

        loop {
            let deadline = if self.buffer.is_empty() {
                self.first_frame_timeout
            } else {
                Some(self.continuation_timeout)
            };

            let frame = match deadline {
                Some(limit) => tokio::time::timeout(limit, self.frames.read_frame())
                    .await
                    .map_err(|_| {
                        RelayError::Timeout(format!(
                            "no frame within {:?} ({} bytes buffered)",
                            limit,
                            self.buffer.len()
                        ))
                    })??,
                None => self.frames.read_frame().await?,
            };

            self.buffer.push(&frame)?;
            match self.buffer.try_decode()? {
                Decoded::Complete(message) => return Ok(message),
                Decoded::Incomplete => {
                    trace!("Partial message buffered: {} bytes", self.buffer.len());
                }
            }
        }
    }
}

/// Writes CBOR messages as circuit frames
pub struct RpcWriter<W> {
    frames: FramedWriter<W, CircuitHeader>,
    chunk_size: usize,
}

impl<W> RpcWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            frames: FramedWriter::new(inner, CircuitHeader),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Encode and send one message, split across frames of at most `chunk_size`
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let encoded = serde_cbor::to_vec(message).map_err(|e| RelayError::Encode(e.to_string()))?;
        debug!("Sending {} byte message", encoded.len());

        for chunk in encoded.chunks(self.chunk_size) {
            self.frames.write_frame(chunk).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.frames.shutdown().await
    }

    pub fn into_inner(self) -> W {
        self.frames.into_inner()
    }
}

/// Relay side of the driver RPC: one request out, one result back
pub struct RpcClient<R, W> {
    reader: RpcReader<R>,
    writer: RpcWriter<W>,
}

impl<R, W> RpcClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: RpcReader<R>, writer: RpcWriter<W>) -> Self {
        Self { reader, writer }
    }

    /// Execute a request and wait for its result
    pub async fn call(&mut self, request: &ExecRequest, timeout: Option<Duration>) -> Result<ExecResult> {
        self.writer.send(request).await?;
        self.reader.set_first_frame_timeout(timeout);
        self.reader.read_message().await
    }

    /// Tell the driver to exit; no reply is expected
    pub async fn send_die(&mut self) -> Result<()> {
        self.writer.send(&ExecRequest::die()).await?;
        self.writer.shutdown().await
    }
}
