// packages/relay/src/transport/header.rs
//! Frame header schemes
//!
//! Two schemes share the same reader and writer:
//!
//! ```text
//! circuit:            [len:u32be][payload...]
//! container stream:   [chan:u8][0][0][0][len:u32be][payload...]
//! ```
//!
//! The container-stream layout is what the Docker engine produces on an
//! attached, non-TTY connection: stdout and stderr share one socket and each
//! chunk is tagged with its channel.

use crate::utils::errors::{RelayError, Result};
use bytes::{BufMut, BytesMut};

/// Circuit header size
pub const CIRCUIT_HEADER_LEN: usize = 4;

/// Container-stream header size
pub const CONTAINER_HEADER_LEN: usize = 8;

/// Largest payload accepted in a single frame (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Logical channel of a multiplexed container stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    pub fn id(self) -> u8 {
        match self {
            Channel::Stdout => 1,
            Channel::Stderr => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Channel::Stdout),
            2 => Some(Channel::Stderr),
            _ => None,
        }
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Channel tag, for multiplexed schemes
    pub channel: Option<Channel>,

    /// Payload length in bytes
    pub len: usize,
}

/// Produces the header written in front of each payload
pub trait HeaderGenerator: Send + Sync {
    /// Size of the generated header
    fn header_len(&self) -> usize;

    /// Append the header for a payload of `payload_len` bytes to `dst`
    fn generate(&self, payload_len: usize, dst: &mut BytesMut) -> Result<()>;
}

/// Decodes headers read from the stream
pub trait HeaderParser: Send + Sync {
    /// Number of bytes to read before calling [`HeaderParser::parse`]
    fn header_len(&self) -> usize;

    /// Validate and decode a header of exactly `header_len()` bytes
    fn parse(&self, header: &[u8]) -> Result<FrameHeader>;

    /// Whether frames with this header belong to the reader.
    ///
    /// Frames that are not accepted are drained from the stream and dropped.
    fn accepts(&self, _header: &FrameHeader) -> bool {
        true
    }
}

fn check_len(len: usize) -> Result<u32> {
    if len > MAX_FRAME_SIZE {
        return Err(RelayError::Encode(format!(
            "payload of {} bytes exceeds frame limit of {} bytes",
            len, MAX_FRAME_SIZE
        )));
    }
    u32::try_from(len).map_err(|_| RelayError::Encode(format!("payload length {} overflows u32", len)))
}

/// Fixed 4-byte big-endian length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitHeader;

impl HeaderGenerator for CircuitHeader {
    fn header_len(&self) -> usize {
        CIRCUIT_HEADER_LEN
    }

    fn generate(&self, payload_len: usize, dst: &mut BytesMut) -> Result<()> {
        let len = check_len(payload_len)?;
        dst.put_u32(len);
        Ok(())
    }
}

impl HeaderParser for CircuitHeader {
    fn header_len(&self) -> usize {
        CIRCUIT_HEADER_LEN
    }

    fn parse(&self, header: &[u8]) -> Result<FrameHeader> {
        let bytes: [u8; CIRCUIT_HEADER_LEN] = header
            .try_into()
            .map_err(|_| RelayError::CorruptStream(format!("circuit header of {} bytes", header.len())))?;
        let len = u32::from_be_bytes(bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(RelayError::CorruptStream(format!(
                "frame length {} exceeds limit {}",
                len, MAX_FRAME_SIZE
            )));
        }
        Ok(FrameHeader { channel: None, len })
    }
}

/// 8-byte channel-tagged header used by attached container streams
///
/// As a parser it accepts only frames for its channel; as a generator it tags
/// every frame with its channel.
#[derive(Debug, Clone, Copy)]
pub struct ContainerStreamHeader {
    channel: Channel,
}

impl ContainerStreamHeader {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn stdout() -> Self {
        Self::new(Channel::Stdout)
    }

    pub fn stderr() -> Self {
        Self::new(Channel::Stderr)
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }
}

impl HeaderGenerator for ContainerStreamHeader {
    fn header_len(&self) -> usize {
        CONTAINER_HEADER_LEN
    }

    fn generate(&self, payload_len: usize, dst: &mut BytesMut) -> Result<()> {
        let len = check_len(payload_len)?;
        dst.put_u8(self.channel.id());
        dst.put_slice(&[0, 0, 0]);
        dst.put_u32(len);
        Ok(())
    }
}

impl HeaderParser for ContainerStreamHeader {
    fn header_len(&self) -> usize {
        CONTAINER_HEADER_LEN
    }

    fn parse(&self, header: &[u8]) -> Result<FrameHeader> {
        if header.len() != CONTAINER_HEADER_LEN {
            return Err(RelayError::CorruptStream(format!(
                "container header of {} bytes",
                header.len()
            )));
        }
        if header[1..4] != [0, 0, 0] {
            return Err(RelayError::CorruptStream(format!(
                "non-zero padding in container header: {:02x?}",
                &header[..4]
            )));
        }
        let channel = Channel::from_id(header[0]).ok_or_else(|| {
            RelayError::CorruptStream(format!("unknown channel id {}", header[0]))
        })?;
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(RelayError::CorruptStream(format!(
                "frame length {} exceeds limit {}",
                len, MAX_FRAME_SIZE
            )));
        }
        Ok(FrameHeader {
            channel: Some(channel),
            len,
        })
    }

    fn accepts(&self, header: &FrameHeader) -> bool {
        header.channel == Some(self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_header_layout() {
        let mut buf = BytesMut::new();
        CircuitHeader.generate(258, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 1, 2]);

        let header = CircuitHeader.parse(&buf).unwrap();
        assert_eq!(header, FrameHeader { channel: None, len: 258 });
    }

    #[test]
    fn test_container_header_layout() {
        let mut buf = BytesMut::new();
        ContainerStreamHeader::stderr().generate(5, &mut buf).unwrap();
        assert_eq!(&buf[..], &[2, 0, 0, 0, 0, 0, 0, 5]);

        let header = ContainerStreamHeader::stdout().parse(&buf).unwrap();
        assert_eq!(header.channel, Some(Channel::Stderr));
        assert_eq!(header.len, 5);
        assert!(!ContainerStreamHeader::stdout().accepts(&header));
        assert!(ContainerStreamHeader::stderr().accepts(&header));
    }

    #[test]
    fn test_container_header_rejects_padding() {
        let raw = [1, 0, 7, 0, 0, 0, 0, 1];
        let err = ContainerStreamHeader::stdout().parse(&raw).unwrap_err();
        assert!(matches!(err, RelayError::CorruptStream(_)));
    }

    #[test]
    fn test_container_header_rejects_unknown_channel() {
        let raw = [9, 0, 0, 0, 0, 0, 0, 1];
        let err = ContainerStreamHeader::stdout().parse(&raw).unwrap_err();
        assert!(matches!(err, RelayError::CorruptStream(_)));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let raw = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        assert!(matches!(
            CircuitHeader.parse(&raw),
            Err(RelayError::CorruptStream(_))
        ));

        let mut buf = BytesMut::new();
        assert!(matches!(
            CircuitHeader.generate(MAX_FRAME_SIZE + 1, &mut buf),
            Err(RelayError::Encode(_))
        ));
        assert!(buf.is_empty());
    }
}
