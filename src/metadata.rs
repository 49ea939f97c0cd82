//! Per-frame metadata consumed by the descriptor builder.

use crate::enums::ScalingSource;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of a single source frame, e.g. a SOP instance UID or URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(Arc<str>);

impl FrameId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FrameId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FrameId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId(Arc<str>);

impl VolumeId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Spatial placement of a frame in patient space.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePlane {
    pub position: [f64; 3],
    pub row_cosines: [f64; 3],
    pub column_cosines: [f64; 3],
    /// (row spacing, column spacing), as stored in Pixel Spacing.
    pub pixel_spacing: Option<[f64; 2]>,
    pub slice_thickness: Option<f64>,
    pub frame_of_reference: Option<String>,
}

/// Intrinsic raster layout of a frame's stored samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterFormat {
    pub columns: u32,
    pub rows: u32,
    pub bits_allocated: u16,
    pub signed: bool,
    pub samples_per_pixel: u16,
    pub floating_point: bool,
}

impl RasterFormat {
    pub fn pixels(&self) -> usize {
        self.columns as usize * self.rows as usize
    }
}

/// Affine intensity scaling of a frame plus an optional quantitative factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingParameters {
    pub slope: f64,
    pub intercept: f64,
    pub quantitative_factor: Option<f64>,
    pub source: ScalingSource,
}

impl ScalingParameters {
    pub fn rescale(slope: f64, intercept: f64) -> Self {
        Self {
            slope,
            intercept,
            quantitative_factor: None,
            source: ScalingSource::Modality,
        }
    }

    pub fn quantitative(slope: f64, intercept: f64, factor: f64) -> Self {
        Self {
            slope,
            intercept,
            quantitative_factor: Some(factor),
            source: ScalingSource::Quantitative,
        }
    }

    /// Same numeric scaling, ignoring the source tag.
    pub fn same_scale(&self, other: &ScalingParameters) -> bool {
        self.slope == other.slope
            && self.intercept == other.intercept
            && self.quantitative_factor == other.quantitative_factor
    }

    /// Whether stored unsigned values can map to negative output.
    pub fn produces_negative(&self) -> bool {
        self.slope < 0.0 || self.intercept < 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLevel {
    pub center: f64,
    pub width: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub plane: ImagePlane,
    pub raster: RasterFormat,
    pub scaling: Option<ScalingParameters>,
    pub window: Option<WindowLevel>,
}

/// Resolves a frame identifier to its metadata.
pub trait MetadataProvider {
    fn frame_metadata(&self, frame_id: &FrameId) -> Option<FrameMetadata>;
}

impl MetadataProvider for HashMap<FrameId, FrameMetadata> {
    fn frame_metadata(&self, frame_id: &FrameId) -> Option<FrameMetadata> {
        self.get(frame_id).cloned()
    }
}

impl<M: MetadataProvider + ?Sized> MetadataProvider for Arc<M> {
    fn frame_metadata(&self, frame_id: &FrameId) -> Option<FrameMetadata> {
        (**self).frame_metadata(frame_id)
    }
}
