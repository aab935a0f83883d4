// packages/relay/src/transport/mod.rs
//! Framed stream transport
//!
//! This module packetizes byte streams for the two conversations the relay
//! has with a bundle container:
//!
//! - **Header**: pluggable header schemes (circuit length prefix, Docker
//!   container-stream multiplexing)
//! - **Framed**: loop-until-complete frame reader/writer with channel demux
//! - **RPC**: CBOR request/response codec with partial-decode retry
//!
//! # Architecture
//!
//! ```text
//!  relay                                   container
//!  ─────                                   ─────────
//!  RpcWriter ─ circuit frames ─────────▶ stdin ─▶ relay-driver
//!                                                     │
//!  RpcReader ◀─ circuit frames ◀─ StreamReader         │
//!                                    ▲                 │
//!              FramedReader(stdout) ◀┴─ [1|0|0|0|len] ◀┘ stdout
//!                   (stderr frames drained and dropped)
//! ```

pub mod framed;
pub mod header;
pub mod rpc;

// Re-export commonly used types
pub use framed::{FrameByteReader, FramedReader, FramedWriter};
pub use header::{Channel, CircuitHeader, ContainerStreamHeader, FrameHeader, HeaderGenerator, HeaderParser};
pub use rpc::{Decoded, ExecRequest, ExecResult, PartialBuffer, RpcClient, RpcReader, RpcWriter};
