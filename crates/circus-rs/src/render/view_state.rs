//! What a viewer shows.
//!
//! View states are immutable. The scheduler shares them as `Arc<ViewState>`
//! and detects changes by pointer, so changing the view means building a new
//! value, never mutating one in place.

use crate::volume::metadata::DisplayWindow;

/// A plane through the volume, in volume millimetres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Section {
    pub origin: [f32; 3],
    pub x_axis: [f32; 3],
    pub y_axis: [f32; 3],
}

/// Multiplanar reconstruction: an arbitrary section through the volume.
#[derive(Debug, Clone, PartialEq)]
pub struct MprViewState {
    pub section: Section,
    pub window: Option<DisplayWindow>,
    pub interpolation: bool,
}

/// Volume rendering seen through `section`.
#[derive(Debug, Clone, PartialEq)]
pub struct VrViewState {
    pub section: Section,
    pub window: Option<DisplayWindow>,
    /// Ray sampling step, in voxels.
    pub step: f32,
}

/// One acquired slice, shown as is.
#[derive(Debug, Clone, PartialEq)]
pub struct TwoDimensionalViewState {
    /// Slot in the volume buffer (not the acquisition index).
    pub image_number: usize,
    pub window: Option<DisplayWindow>,
    pub flip_horizontal: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewState {
    Mpr(MprViewState),
    Vr(VrViewState),
    TwoD(TwoDimensionalViewState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewStateKind {
    Mpr,
    Vr,
    TwoD,
}

impl std::fmt::Display for ViewStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mpr => write!(f, "mpr"),
            Self::Vr => write!(f, "vr"),
            Self::TwoD => write!(f, "2d"),
        }
    }
}

impl ViewState {
    pub fn kind(&self) -> ViewStateKind {
        match self {
            Self::Mpr(_) => ViewStateKind::Mpr,
            Self::Vr(_) => ViewStateKind::Vr,
            Self::TwoD(_) => ViewStateKind::TwoD,
        }
    }

    pub fn two_d(image_number: usize) -> Self {
        Self::TwoD(TwoDimensionalViewState {
            image_number,
            window: None,
            flip_horizontal: false,
        })
    }
}

impl From<TwoDimensionalViewState> for ViewState {
    fn from(state: TwoDimensionalViewState) -> Self {
        Self::TwoD(state)
    }
}

impl From<MprViewState> for ViewState {
    fn from(state: MprViewState) -> Self {
        Self::Mpr(state)
    }
}

impl From<VrViewState> for ViewState {
    fn from(state: VrViewState) -> Self {
        Self::Vr(state)
    }
}
