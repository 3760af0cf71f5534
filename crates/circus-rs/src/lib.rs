//! circus-rs: progressive volume streaming and single-flight rendering for
//! CIRCUS RS clients.
//!
//! Slices of a volume stream in over one shared duplex connection while the
//! viewer draws whatever has arrived:
//!
//! - [`transfer`]: frame codec, duplex channel, transfer multiplexing
//! - [`volume`]: metadata, incrementally-filled buffers, the volume loader
//! - [`render`]: view states, image sources, the render scheduler

pub mod render;
pub mod transfer;
pub mod volume;

/// Crate version from Cargo.toml.
pub const CIRCUS_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use render::{
    DrawResult, ImageData, ImageSource, Painter, Quality, RenderError, RenderScheduler,
    SliceImageSource, ViewState, ViewportSize,
};
pub use transfer::{
    ChannelConfig, ChannelError, DuplexChannel, Message, PartialVolumeDescriptor,
    ProtocolError, TransferConnection, TransferId, TransferRegistry, VolumeSpecifier,
};
pub use volume::{
    LoadError, LoaderConfig, MetadataSource, Progress, VolumeBuffer, VolumeCache,
    VolumeLoader, VolumeMetadata,
};
