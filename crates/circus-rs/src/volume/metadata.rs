//! Volume geometry and the metadata collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::loader::LoadError;
use crate::transfer::protocol::{PartialVolumeDescriptor, VolumeSpecifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    UInt8,
    Int8,
    UInt16,
    Int16,
    Binary,
}

impl PixelFormat {
    pub fn bytes_per_voxel(self) -> usize {
        match self {
            Self::UInt8 | Self::Int8 | Self::Binary => 1,
            Self::UInt16 | Self::Int16 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayWindow {
    pub level: f32,
    pub width: f32,
}

/// Immutable description of a volume: dimensions, spacing, voxel format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    /// `[x, y, z]`; z is the slice count.
    pub voxel_count: [u32; 3],
    /// Millimetres per voxel along each axis.
    pub voxel_size: [f32; 3],
    pub pixel_format: PixelFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_window: Option<DisplayWindow>,
}

impl VolumeMetadata {
    pub fn width(&self) -> u32 {
        self.voxel_count[0]
    }

    pub fn height(&self) -> u32 {
        self.voxel_count[1]
    }

    pub fn depth(&self) -> u32 {
        self.voxel_count[2]
    }

    pub fn slice_bytes(&self) -> usize {
        self.width() as usize * self.height() as usize * self.pixel_format.bytes_per_voxel()
    }

    /// Geometry of the strided sub-volume selected by `pvd`.
    pub fn for_partial(&self, pvd: &PartialVolumeDescriptor) -> Self {
        let mut sub = self.clone();
        sub.voxel_count[2] = pvd.slice_count() as u32;
        sub.voxel_size[2] = self.voxel_size[2] * pvd.delta as f32;
        sub
    }
}

/// Resolves metadata for a volume. Implemented by the REST client.
#[async_trait]
pub trait MetadataSource: Send + Sync + 'static {
    async fn fetch_metadata(&self, volume: &VolumeSpecifier) -> Result<VolumeMetadata, LoadError>;
}

/// Source that answers every request with the same metadata.
#[derive(Debug, Clone)]
pub struct StaticMetadata(pub VolumeMetadata);

#[async_trait]
impl MetadataSource for StaticMetadata {
    async fn fetch_metadata(&self, _volume: &VolumeSpecifier) -> Result<VolumeMetadata, LoadError> {
        Ok(self.0.clone())
    }
}
