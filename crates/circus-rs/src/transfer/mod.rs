//! Multiplexed slice transfers over one duplex connection.
//!
//! # Architecture
//!
//! - **protocol**: wire message types and volume identifiers
//! - **codec**: header+payload frame encoding, stream framing
//! - **transport**: physical connections (TCP, in-memory)
//! - **channel**: single-flight connection manager with fan-out dispatch
//! - **registry**: transfer ids, per-transfer slice routing and control

pub mod channel;
pub mod codec;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use channel::{
    ChannelConfig, ChannelError, ChannelState, DuplexChannel, HandlerId, LinkId,
};
pub use codec::{FrameCodec, ProtocolError};
pub use protocol::{
    DescriptorError, Message, PartialVolumeDescriptor, TransferId, VolumeSpecifier,
};
pub use registry::{SliceHandler, TransferConnection, TransferRegistry, TransferState};
pub use transport::{BoxedStream, Connector, MemoryConnector, MemoryListener, TcpConnector};
