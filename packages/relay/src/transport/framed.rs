// packages/relay/src/transport/framed.rs
//! Framed reader and writer over async byte streams
//!
//! Both halves loop until a whole header or payload has moved. A read or
//! write that reports zero bytes without an error is never treated as
//! progress:
//!
//! - a zero-byte read before the first header byte is [`RelayError::StreamClosed`]
//! - a zero-byte read anywhere else is [`RelayError::ShortRead`]
//! - a zero-byte write is [`RelayError::ShortWrite`]

use crate::transport::header::{HeaderGenerator, HeaderParser};
use crate::utils::errors::{RelayError, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::trace;

/// Byte-level view over the accepted frames of a [`FramedReader`]
pub type FrameByteReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Write all of `buf`, failing on a write that makes no progress
pub async fn write_full<W>(writer: &mut W, buf: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]).await {
            Ok(0) => {
                return Err(RelayError::ShortWrite {
                    expected: buf.len(),
                    written,
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Fill all of `buf`, failing on a read that makes no progress.
///
/// `at_boundary` marks the start of a frame, where a clean end of stream is
/// reported as [`RelayError::StreamClosed`].
pub async fn read_full<R>(reader: &mut R, buf: &mut [u8], at_boundary: bool) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) if filled == 0 && at_boundary => return Err(RelayError::StreamClosed),
            Ok(0) => {
                return Err(RelayError::ShortRead {
                    expected: buf.len(),
                    received: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Writes header-prefixed frames
pub struct FramedWriter<W, G> {
    inner: W,
    generator: G,
    buf: BytesMut,
}

impl<W, G> FramedWriter<W, G>
where
    W: AsyncWrite + Unpin,
    G: HeaderGenerator,
{
    pub fn new(inner: W, generator: G) -> Self {
        Self {
            inner,
            generator,
            buf: BytesMut::new(),
        }
    }

    /// Write one frame: header and payload go out as a single buffer
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        self.buf.reserve(self.generator.header_len() + payload.len());
        self.generator.generate(payload.len(), &mut self.buf)?;
        self.buf.extend_from_slice(payload);

        trace!("Writing frame of {} payload bytes", payload.len());
        write_full(&mut self.inner, &self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shut down the write side of the underlying stream
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads header-prefixed frames, skipping frames the parser does not accept
pub struct FramedReader<R, P> {
    inner: R,
    parser: P,
    header: Vec<u8>,
}

impl<R, P> FramedReader<R, P>
where
    R: AsyncRead + Unpin,
    P: HeaderParser,
{
    pub fn new(inner: R, parser: P) -> Self {
        let header = vec![0; parser.header_len()];
        Self {
            inner,
            parser,
            header,
        }
    }

    /// Read the next accepted frame's payload
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        loop {
            read_full(&mut self.inner, &mut self.header, true).await?;
            let header = self.parser.parse(&self.header)?;

            if !self.parser.accepts(&header) {
                trace!(
                    "Discarding {} bytes on channel {:?}",
                    header.len,
                    header.channel
                );
                self.discard(header.len).await?;
                continue;
            }

            let mut payload = BytesMut::zeroed(header.len);
            read_full(&mut self.inner, &mut payload, false).await?;
            return Ok(payload.freeze());
        }
    }

    /// Drain `len` bytes without buffering them
    async fn discard(&mut self, len: usize) -> Result<()> {
        let mut limited = (&mut self.inner).take(len as u64);
        let drained = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        if drained < len as u64 {
            return Err(RelayError::ShortRead {
                expected: len,
                received: drained as usize,
            });
        }
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R, P> FramedReader<R, P>
where
    R: AsyncRead + Unpin + Send + 'static,
    P: HeaderParser + 'static,
{
    /// Stream of accepted payloads; ends on a clean close, yields one error
    /// and then ends on any other failure
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.read_frame().await {
                Ok(frame) => Some((Ok(frame), Some(reader))),
                Err(RelayError::StreamClosed) => None,
                Err(e) => Some((Err(e.into_io()), None)),
            }
        })
        .boxed()
    }

    /// Concatenated payloads of accepted frames as a plain byte reader
    pub fn into_async_read(self) -> FrameByteReader {
        StreamReader::new(self.into_stream())
    }
}


#[cfg(test)]
mod tests {
    use super::test_io::{ChunkedReader, ChunkedWriter};
    use super::*;
    use crate::transport::header::{Channel, CircuitHeader, ContainerStreamHeader};
    use proptest::prelude::*;

    async fn encode_frames<G: HeaderGenerator>(generator: G, payloads: &[Vec<u8>], chunk: usize) -> Vec<u8> {
        let mut writer = FramedWriter::new(ChunkedWriter::new(chunk), generator);
        for payload in payloads {
            writer.write_frame(payload).await.unwrap();
        }
        writer.into_inner().data
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn prop_circuit_round_trip(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), 1..8),
            write_chunk in 1usize..17,
            read_chunk in 1usize..17,
        ) {
            let decoded = runtime().block_on(async {
                let wire = encode_frames(CircuitHeader, &payloads, write_chunk).await;
                let mut reader = FramedReader::new(ChunkedReader::new(wire, read_chunk), CircuitHeader);
                let mut out = Vec::new();
                for _ in 0..payloads.len() {
                    out.push(reader.read_frame().await.unwrap().to_vec());
                }
                assert!(matches!(reader.read_frame().await, Err(RelayError::StreamClosed)));
                out
            });
            prop_assert_eq!(decoded, payloads);
        }

        #[test]
        fn prop_demux_keeps_only_stdout(
            frames in proptest::collection::vec((any::<bool>(), proptest::collection::vec(any::<u8>(), 0..256)), 0..12),
            read_chunk in 1usize..13,
        ) {
            let (stdout, received) = runtime().block_on(async {
                let mut wire = Vec::new();
                let mut stdout = Vec::new();
                for (is_stdout, payload) in &frames {
                    let channel = if *is_stdout { Channel::Stdout } else { Channel::Stderr };
                    if *is_stdout {
                        stdout.extend_from_slice(payload);
                    }
                    let mut buf = BytesMut::new();
                    ContainerStreamHeader::new(channel).generate(payload.len(), &mut buf).unwrap();
                    wire.extend_from_slice(&buf);
                    wire.extend_from_slice(payload);
                }

                let reader = FramedReader::new(
                    ChunkedReader::new(wire, read_chunk),
                    ContainerStreamHeader::stdout(),
                );
                let mut bytes = reader.into_async_read();
                let mut received = Vec::new();
                bytes.read_to_end(&mut received).await.unwrap();
                (stdout, received)
            });
            prop_assert_eq!(received, stdout);
        }
    }

    #[tokio::test]
    async fn test_demux_discards_stderr_frames() {
        let mut wire = Vec::new();
        for (channel, payload) in [
            (Channel::Stderr, &b"warning: noisy"[..]),
            (Channel::Stdout, &b"hello "[..]),
            (Channel::Stderr, &b"more noise"[..]),
            (Channel::Stdout, &b"world"[..]),
        ] {
            let mut buf = BytesMut::new();
            ContainerStreamHeader::new(channel).generate(payload.len(), &mut buf).unwrap();
            wire.extend_from_slice(&buf);
            wire.extend_from_slice(payload);
        }

        let mut reader = FramedReader::new(ChunkedReader::new(wire, 3), ContainerStreamHeader::stdout());
        assert_eq!(&reader.read_frame().await.unwrap()[..], b"hello ");
        assert_eq!(&reader.read_frame().await.unwrap()[..], b"world");
        assert!(matches!(reader.read_frame().await, Err(RelayError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_short_read() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");

        let mut reader = FramedReader::new(ChunkedReader::new(wire, 2), CircuitHeader);
        match reader.read_frame().await {
            Err(RelayError::ShortRead { expected, received }) => {
                assert_eq!(expected, 10);
                assert_eq!(received, 3);
            }
            other => panic!("expected short read, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_header_is_short_read() {
        let mut reader = FramedReader::new(ChunkedReader::new(vec![0, 0], 4), CircuitHeader);
        assert!(matches!(
            reader.read_frame().await,
            Err(RelayError::ShortRead { expected: 4, received: 2 })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_header_ends_byte_stream_with_error() {
        let wire = vec![1, 9, 0, 0, 0, 0, 0, 1, b'x'];
        let reader = FramedReader::new(ChunkedReader::new(wire, 8), ContainerStreamHeader::stdout());
        let mut bytes = reader.into_async_read();
        let mut out = Vec::new();
        let err = bytes.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_zero_progress_write_is_error() {
        let mut writer = FramedWriter::new(ChunkedWriter::new(0), CircuitHeader);
        let err = writer.write_frame(b"payload").await.unwrap_err();
        assert!(matches!(err, RelayError::ShortWrite { expected: 11, written: 0 }));
    }
}
