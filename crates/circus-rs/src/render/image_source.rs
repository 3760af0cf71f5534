//! The draw contract between the scheduler and whatever produces pixels.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::view_state::{ViewState, ViewStateKind};
use crate::volume::loader::LoadError;
use crate::volume::metadata::PixelFormat;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("image source cannot draw {0} view states")]
    UnsupportedViewState(ViewStateKind),

    #[error("no image source or view state attached")]
    NotInitialized,

    #[error("draw cancelled")]
    Cancelled,

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("draw failed: {0}")]
    Draw(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

impl ViewportSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub pixels: Bytes,
}

impl ImageData {
    pub fn zeroed(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        let len = width as usize * height as usize * pixel_format.bytes_per_voxel();
        Self {
            width,
            height,
            pixel_format,
            pixels: Bytes::from(vec![0u8; len]),
        }
    }
}

/// Produces the next refinement of a draw. Polled at most once to completion.
pub type DrawContinuation = BoxFuture<'static, Result<DrawResult, RenderError>>;

pub enum DrawResult {
    Final(ImageData),
    /// A provisional image, followed by a better one once `next` resolves.
    Draft {
        draft: ImageData,
        next: DrawContinuation,
    },
}

impl DrawResult {
    pub fn draft<F>(draft: ImageData, next: F) -> Self
    where
        F: Future<Output = Result<DrawResult, RenderError>> + Send + 'static,
    {
        Self::Draft {
            draft,
            next: next.boxed(),
        }
    }
}

impl std::fmt::Debug for DrawResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Final(image) => f.debug_tuple("Final").field(image).finish(),
            Self::Draft { draft, .. } => f
                .debug_struct("Draft")
                .field("draft", draft)
                .finish_non_exhaustive(),
        }
    }
}

/// Something that can draw view states into images.
///
/// `draw` should check `cancel` at its suspension points; once it fires the
/// scheduler ignores anything produced, so continuations may end early with
/// [`RenderError::Cancelled`].
#[async_trait]
pub trait ImageSource: Send + Sync + 'static {
    /// Resolves once the source can produce an initial state.
    async fn ready(&self) -> Result<(), RenderError> {
        Ok(())
    }

    fn initial_state(&self, viewport: ViewportSize) -> Result<ViewState, RenderError>;

    async fn draw(
        &self,
        state: &ViewState,
        viewport: ViewportSize,
        cancel: CancellationToken,
    ) -> Result<DrawResult, RenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Draft,
    Final,
}

/// Puts images on screen. Called from the scheduler; must not block.
pub trait Painter: Send + Sync + 'static {
    fn paint(&self, state: &Arc<ViewState>, image: &ImageData, quality: Quality);
}

impl<F> Painter for F
where
    F: Fn(&Arc<ViewState>, &ImageData, Quality) + Send + Sync + 'static,
{
    fn paint(&self, state: &Arc<ViewState>, image: &ImageData, quality: Quality) {
        self(state, image, quality)
    }
}
