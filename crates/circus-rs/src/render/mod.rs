//! Render scheduling over progressively-loading volumes.
//!
//! - **view_state**: what a viewer shows (`Mpr`, `Vr`, `TwoD`)
//! - **image_source**: the draw contract, draft/final results, painting
//! - **scheduler**: single-flight, coalescing render loop
//! - **slice_source**: `TwoD` image source backed by a volume loader

pub mod image_source;
pub mod scheduler;
pub mod slice_source;
pub mod view_state;

pub use image_source::{
    DrawContinuation, DrawResult, ImageData, ImageSource, Painter, Quality, RenderError,
    ViewportSize,
};
pub use scheduler::RenderScheduler;
pub use slice_source::SliceImageSource;
pub use view_state::{
    MprViewState, Section, TwoDimensionalViewState, ViewState, ViewStateKind, VrViewState,
};
