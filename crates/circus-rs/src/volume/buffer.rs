//! Incrementally-filled volume storage.
//!
//! Each slice slot is a write-once cell. A write publishes the whole slice at
//! once, so readers never see a partial slice and never block: an unwritten
//! slot reads as zeros.

use std::sync::OnceLock;

use tokio::sync::watch;
use tokio_util::bytes::{Bytes, BytesMut};

use super::metadata::VolumeMetadata;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("slot {slot} out of range for {total} slices")]
    OutOfRange { slot: usize, total: usize },

    #[error("slice is {actual} bytes, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

pub struct VolumeBuffer {
    metadata: VolumeMetadata,
    slice_bytes: usize,
    slices: Box<[OnceLock<Bytes>]>,
    received: watch::Sender<usize>,
}

impl VolumeBuffer {
    /// Empty buffer sized from `metadata` (depth = slice count).
    pub fn new(metadata: VolumeMetadata) -> Self {
        let total = metadata.depth() as usize;
        let slices = (0..total).map(|_| OnceLock::new()).collect();
        Self {
            slice_bytes: metadata.slice_bytes(),
            metadata,
            slices,
            received: watch::Sender::new(0),
        }
    }

    /// Complete buffer from a contiguous image, e.g. a cache hit.
    pub fn from_bytes(metadata: VolumeMetadata, data: Bytes) -> Result<Self, BufferError> {
        let buffer = Self::new(metadata);
        buffer.fill_from(data)?;
        Ok(buffer)
    }

    /// Fill every still-empty slot from a contiguous image.
    pub fn fill_from(&self, data: Bytes) -> Result<(), BufferError> {
        let expected = self.byte_len();
        if data.len() != expected {
            return Err(BufferError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        for slot in 0..self.slices.len() {
            let start = slot * self.slice_bytes;
            self.write_slice(slot, data.slice(start..start + self.slice_bytes))?;
        }
        Ok(())
    }

    pub fn metadata(&self) -> &VolumeMetadata {
        &self.metadata
    }

    pub fn slice_bytes(&self) -> usize {
        self.slice_bytes
    }

    pub fn total_slices(&self) -> usize {
        self.slices.len()
    }

    pub fn byte_len(&self) -> usize {
        self.slice_bytes * self.slices.len()
    }

    fn cell(&self, slot: usize) -> Result<&OnceLock<Bytes>, BufferError> {
        self.slices.get(slot).ok_or(BufferError::OutOfRange {
            slot,
            total: self.slices.len(),
        })
    }

    /// Store one slice. Returns `Ok(false)` if the slot was already filled;
    /// the earlier contents are kept.
    pub fn write_slice(&self, slot: usize, data: Bytes) -> Result<bool, BufferError> {
        let cell = self.cell(slot)?;
        if data.len() != self.slice_bytes {
            return Err(BufferError::SizeMismatch {
                expected: self.slice_bytes,
                actual: data.len(),
            });
        }
        if cell.set(data).is_err() {
            return Ok(false);
        }
        self.received.send_modify(|n| *n += 1);
        Ok(true)
    }

    pub fn slice(&self, slot: usize) -> Option<Bytes> {
        self.slices.get(slot)?.get().cloned()
    }

    /// Slice contents, or zeros if it has not arrived yet.
    pub fn slice_or_zeroed(&self, slot: usize) -> Result<Bytes, BufferError> {
        let cell = self.cell(slot)?;
        Ok(cell
            .get()
            .cloned()
            .unwrap_or_else(|| Bytes::from(vec![0u8; self.slice_bytes])))
    }

    pub fn is_received(&self, slot: usize) -> bool {
        self.slices.get(slot).is_some_and(|cell| cell.get().is_some())
    }

    pub fn received_slots(&self) -> Vec<usize> {
        self.slices
            .iter()
            .enumerate()
            .filter_map(|(slot, cell)| cell.get().map(|_| slot))
            .collect()
    }

    pub fn received_count(&self) -> usize {
        *self.received.borrow()
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.slices.len()
    }

    pub async fn wait_until_complete(&self) {
        let total = self.slices.len();
        let mut rx = self.received.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|n| *n == total).await;
    }

    /// Wait until `slot` has been written and return it.
    pub async fn wait_for_slice(&self, slot: usize) -> Result<Bytes, BufferError> {
        let cell = self.cell(slot)?;
        let mut rx = self.received.subscribe();
        let _ = rx.wait_for(|_| cell.get().is_some()).await;
        Ok(cell.get().cloned().unwrap_or_default())
    }

    /// Contiguous image of the whole volume; missing slices are zeros.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::zeroed(self.byte_len());
        for (slot, cell) in self.slices.iter().enumerate() {
            if let Some(data) = cell.get() {
                let start = slot * self.slice_bytes;
                out[start..start + self.slice_bytes].copy_from_slice(data);
            }
        }
        out.freeze()
    }
}

impl std::fmt::Debug for VolumeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeBuffer")
            .field("voxel_count", &self.metadata.voxel_count)
            .field("received", &self.received_count())
            .field("total", &self.total_slices())
            .finish()
    }
}
