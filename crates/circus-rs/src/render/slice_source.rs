//! Image source showing acquired slices straight from a loading volume.

use std::sync::OnceLock;

use async_trait::async_trait;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::image_source::{DrawResult, ImageData, ImageSource, RenderError, ViewportSize};
use super::view_state::{TwoDimensionalViewState, ViewState};
use crate::volume::loader::VolumeLoader;
use crate::volume::metadata::VolumeMetadata;

/// Priority sent for the slice currently on screen.
pub const VIEWED_SLICE_PRIORITY: i32 = 10;

/// Draws `TwoD` view states from a [`VolumeLoader`] while it fills.
///
/// A slice that has not arrived is drawn as a zero-filled draft and bumped
/// to the front of the transfer; the final image follows when it lands.
pub struct SliceImageSource {
    loader: VolumeLoader,
    metadata: OnceLock<VolumeMetadata>,
    priority: i32,
}

impl SliceImageSource {
    pub fn new(loader: VolumeLoader) -> Self {
        Self {
            loader,
            metadata: OnceLock::new(),
            priority: VIEWED_SLICE_PRIORITY,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn loader(&self) -> &VolumeLoader {
        &self.loader
    }

    fn metadata(&self) -> Result<&VolumeMetadata, RenderError> {
        self.metadata.get().ok_or(RenderError::NotInitialized)
    }
}

fn slice_image(metadata: &VolumeMetadata, pixels: Bytes) -> ImageData {
    ImageData {
        width: metadata.width(),
        height: metadata.height(),
        pixel_format: metadata.pixel_format,
        pixels,
    }
}

#[async_trait]
impl ImageSource for SliceImageSource {
    /// Loads metadata and starts streaming the volume in the background.
    async fn ready(&self) -> Result<(), RenderError> {
        let metadata = self.loader.load_meta().await?;
        let _ = self.metadata.set(metadata);

        let loader = self.loader.clone();
        tokio::spawn(async move {
            if let Err(e) = loader.load_volume().await {
                tracing::warn!(
                    series_uid = %loader.volume_specifier().series_uid,
                    error = %e,
                    "Volume load failed"
                );
            }
        });
        Ok(())
    }

    fn initial_state(&self, _viewport: ViewportSize) -> Result<ViewState, RenderError> {
        let metadata = self.metadata()?;
        let depth = match self.loader.partial_volume_descriptor() {
            Some(pvd) => pvd.slice_count(),
            None => metadata.depth() as usize,
        };
        Ok(ViewState::TwoD(TwoDimensionalViewState {
            image_number: depth / 2,
            window: metadata.display_window,
            flip_horizontal: false,
        }))
    }

    async fn draw(
        &self,
        state: &ViewState,
        _viewport: ViewportSize,
        cancel: CancellationToken,
    ) -> Result<DrawResult, RenderError> {
        let ViewState::TwoD(view) = state else {
            return Err(RenderError::UnsupportedViewState(state.kind()));
        };
        let metadata = self.metadata()?.clone();
        let buffer = self.loader.volume().ok_or(RenderError::NotInitialized)?;
        let slot = view.image_number;

        if let Some(pixels) = buffer.slice(slot) {
            return Ok(DrawResult::Final(slice_image(&metadata, pixels)));
        }
        let draft = buffer
            .slice_or_zeroed(slot)
            .map_err(|e| RenderError::Draw(e.to_string()))?;

        if let Some(image_index) = self.loader.image_index_of(slot) {
            tracing::debug!(image_index, "Raising priority of viewed slice");
            if let Err(e) = self
                .loader
                .set_priority(vec![image_index], self.priority)
                .await
            {
                tracing::debug!(image_index, error = %e, "Failed to raise slice priority");
            }
        }

        let draft = slice_image(&metadata, draft);
        Ok(DrawResult::draft(draft, async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(RenderError::Cancelled),
                pixels = buffer.wait_for_slice(slot) => pixels
                    .map(|pixels| DrawResult::Final(slice_image(&metadata, pixels)))
                    .map_err(|e| RenderError::Draw(e.to_string())),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::view_state::{MprViewState, Section};
    use crate::transfer::channel::DuplexChannel;
    use crate::transfer::codec::FrameCodec;
    use crate::transfer::protocol::Message;
    use crate::transfer::protocol::VolumeSpecifier;
    use crate::transfer::registry::TransferRegistry;
    use crate::transfer::transport::{MemoryConnector, MemoryListener};
    use crate::volume::metadata::{DisplayWindow, PixelFormat, StaticMetadata};
    use futures::StreamExt;
    use std::sync::Arc;
    use tokio_util::codec::Framed;

    /// The listener must outlive the test so the transfer can begin.
    fn source(depth: u32) -> (SliceImageSource, MemoryListener) {
        let (connector, listener) = MemoryConnector::pair(1024);
        let registry = TransferRegistry::new(Arc::new(DuplexChannel::new(connector)));
        let metadata = VolumeMetadata {
            voxel_count: [2, 1, depth],
            voxel_size: [1.0, 1.0, 1.0],
            pixel_format: PixelFormat::UInt8,
            display_window: Some(DisplayWindow {
                level: 50.0,
                width: 100.0,
            }),
        };
        let loader =
            VolumeLoader::new(VolumeSpecifier::new("S"), StaticMetadata(metadata), registry)
                .unwrap();
        (SliceImageSource::new(loader), listener)
    }

    #[tokio::test]
    async fn initial_state_is_middle_slice() {
        let (source, _listener) = source(9);
        let viewport = ViewportSize::new(4, 4);
        assert!(matches!(
            source.initial_state(viewport),
            Err(RenderError::NotInitialized)
        ));

        source.ready().await.unwrap();
        let ViewState::TwoD(view) = source.initial_state(viewport).unwrap() else {
            panic!("expected a 2d view");
        };
        assert_eq!(view.image_number, 4);
        assert_eq!(view.window.unwrap().width, 100.0);
    }

    #[tokio::test]
    async fn mpr_is_unsupported() {
        let (source, _listener) = source(3);
        source.ready().await.unwrap();
        let mpr = ViewState::Mpr(MprViewState {
            section: Section {
                origin: [0.0; 3],
                x_axis: [1.0, 0.0, 0.0],
                y_axis: [0.0, 1.0, 0.0],
            },
            window: None,
            interpolation: false,
        });
        let result = source
            .draw(&mpr, ViewportSize::new(4, 4), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RenderError::UnsupportedViewState(_))));
    }

    #[tokio::test]
    async fn missing_slice_drafts_then_finalizes() {
        let (source, _listener) = source(3);
        source.ready().await.unwrap();
        let buffer = source.loader().volume().unwrap();

        let result = source
            .draw(&ViewState::two_d(1), ViewportSize::new(4, 4), CancellationToken::new())
            .await
            .unwrap();
        let DrawResult::Draft { draft, next } = result else {
            panic!("expected a draft");
        };
        assert_eq!(&draft.pixels[..], &[0, 0]);

        buffer.write_slice(1, Bytes::from_static(&[3, 4])).unwrap();
        let DrawResult::Final(image) = next.await.unwrap() else {
            panic!("expected the final image");
        };
        assert_eq!(&image.pixels[..], &[3, 4]);

        // now loaded: straight to final
        let result = source
            .draw(&ViewState::two_d(1), ViewportSize::new(4, 4), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(result, DrawResult::Final(_)));
    }

    #[tokio::test]
    async fn drafted_slice_is_requested_at_configured_priority() {
        let (source, mut listener) = source(3);
        let source = source.with_priority(42);
        source.ready().await.unwrap();

        let result = source
            .draw(&ViewState::two_d(2), ViewportSize::new(4, 4), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(result, DrawResult::Draft { .. }));

        let mut peer = Framed::new(listener.accept().await.unwrap(), FrameCodec::default());
        let begin = peer.next().await.unwrap().unwrap().unwrap();
        assert!(matches!(begin, Message::BeginTransfer { .. }));
        let priority = peer.next().await.unwrap().unwrap().unwrap();
        assert!(matches!(
            priority,
            Message::SetPriority { ref image_indices, priority: 42, .. } if image_indices == &[2]
        ));
    }

    #[tokio::test]
    async fn cancelled_continuation_ends() {
        let (source, _listener) = source(3);
        source.ready().await.unwrap();
        let cancel = CancellationToken::new();

        let result = source
            .draw(&ViewState::two_d(0), ViewportSize::new(4, 4), cancel.clone())
            .await
            .unwrap();
        let DrawResult::Draft { next, .. } = result else {
            panic!("expected a draft");
        };
        cancel.cancel();
        assert!(matches!(next.await, Err(RenderError::Cancelled)));
    }
}
