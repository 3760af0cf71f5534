//! Wire protocol types for slice transfers.
//!
//! One duplex channel carries any number of transfers. Every message names
//! the transfer it belongs to; only `TransferImage` carries binary payload.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// Identifier of one logical streaming request on a channel.
///
/// Allocated by the transfer registry, starting at 1; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(u64);

impl TransferId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    #[error("partial volume delta must be positive")]
    ZeroDelta,
    #[error("partial volume start {start} is after end {end}")]
    Reversed { start: u32, end: u32 },
}

/// Strided subrange of acquisition indices: `start, start + delta, ..` up to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialVolumeDescriptor {
    pub start: u32,
    pub end: u32,
    pub delta: u32,
}

impl PartialVolumeDescriptor {
    pub fn new(start: u32, end: u32, delta: u32) -> Result<Self, DescriptorError> {
        let pvd = Self { start, end, delta };
        pvd.validate()?;
        Ok(pvd)
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.delta == 0 {
            return Err(DescriptorError::ZeroDelta);
        }
        if self.start > self.end {
            return Err(DescriptorError::Reversed {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Number of slices in the sub-volume. Assumes a validated descriptor.
    pub fn slice_count(&self) -> usize {
        ((self.end - self.start) / self.delta) as usize + 1
    }

    /// Buffer slot of an acquisition index, if the index belongs to this sub-volume.
    pub fn slot_of(&self, image_index: u32) -> Option<usize> {
        if image_index < self.start || image_index > self.end {
            return None;
        }
        let offset = image_index - self.start;
        (offset % self.delta == 0).then_some((offset / self.delta) as usize)
    }

    /// Acquisition index stored at a buffer slot.
    pub fn image_index_of(&self, slot: usize) -> Option<u32> {
        if slot >= self.slice_count() {
            return None;
        }
        Some(self.start + slot as u32 * self.delta)
    }

    pub fn image_indices(&self) -> impl Iterator<Item = u32> {
        (self.start..=self.end).step_by(self.delta as usize)
    }
}

impl std::fmt::Display for PartialVolumeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.start, self.end, self.delta)
    }
}

/// Identifies a logical volume independent of any one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeSpecifier {
    pub series_uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_volume_descriptor: Option<PartialVolumeDescriptor>,
}

impl VolumeSpecifier {
    pub fn new(series_uid: impl Into<String>) -> Self {
        Self {
            series_uid: series_uid.into(),
            partial_volume_descriptor: None,
        }
    }

    pub fn with_partial(mut self, pvd: PartialVolumeDescriptor) -> Self {
        self.partial_volume_descriptor = Some(pvd);
        self
    }
}

impl std::fmt::Display for VolumeSpecifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.partial_volume_descriptor {
            Some(pvd) => write!(f, "{}[{}]", self.series_uid, pvd),
            None => f.write_str(&self.series_uid),
        }
    }
}

/// Messages exchanged over the duplex channel.
///
/// Client → server: `BeginTransfer`, `SetPriority`, `Pause`, `Resume`, `Stop`.
/// Server → client: `TransferImage`.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    BeginTransfer {
        transfer_id: TransferId,
        volume: VolumeSpecifier,
    },

    /// Priority hint for the remote sender; not a delivery-order guarantee.
    SetPriority {
        transfer_id: TransferId,
        image_indices: Vec<u32>,
        priority: i32,
    },

    Pause {
        transfer_id: TransferId,
    },

    Resume {
        transfer_id: TransferId,
    },

    Stop {
        transfer_id: TransferId,
    },

    TransferImage {
        transfer_id: TransferId,
        image_index: u32,
        payload: Bytes,
    },
}

impl Message {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            Self::BeginTransfer { transfer_id, .. }
            | Self::SetPriority { transfer_id, .. }
            | Self::Pause { transfer_id }
            | Self::Resume { transfer_id }
            | Self::Stop { transfer_id }
            | Self::TransferImage { transfer_id, .. } => *transfer_id,
        }
    }

    /// Wire tag of this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BeginTransfer { .. } => "begin_transfer",
            Self::SetPriority { .. } => "set_priority",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Stop { .. } => "stop",
            Self::TransferImage { .. } => "transfer_image",
        }
    }
}
