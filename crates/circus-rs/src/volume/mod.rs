//! Progressive volume loading.
//!
//! - **metadata**: volume geometry and the metadata collaborator
//! - **buffer**: write-once per-slice storage readers can use while it fills
//! - **cache**: optional best-effort cache for metadata and finished volumes
//! - **loader**: memoized metadata/volume loads, priority queueing, progress

pub mod buffer;
pub mod cache;
pub mod loader;
pub mod metadata;

pub use buffer::{BufferError, VolumeBuffer};
pub use cache::{CacheKey, MemoryCache, NullCache, VolumeCache};
pub use loader::{LoadError, LoaderConfig, Progress, VolumeLoader};
pub use metadata::{DisplayWindow, MetadataSource, PixelFormat, StaticMetadata, VolumeMetadata};
