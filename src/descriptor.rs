//! Volume geometry and frame ordering derived from per-frame metadata.

use crate::enums::{ElementType, FrameOrdering};
use crate::error::ConstructionError;
use crate::metadata::{
    FrameId, FrameMetadata, MetadataProvider, RasterFormat, ScalingParameters, WindowLevel,
};

use std::collections::HashSet;
use tracing::{debug, warn};

/// Element layout of the samples stored for each voxel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    /// Width of one element in bytes.
    pub element_width: usize,
    pub signed: bool,
    pub floating_point: bool,
    pub components: usize,
}

impl SampleFormat {
    pub fn of_element(element: ElementType, components: usize) -> Self {
        Self {
            element_width: element.width(),
            signed: element.is_signed(),
            floating_point: !element.is_integer(),
            components,
        }
    }

    fn of_raster(raster: &RasterFormat) -> Self {
        Self {
            element_width: (raster.bits_allocated as usize).div_ceil(8),
            signed: raster.signed,
            floating_point: raster.floating_point,
            components: raster.samples_per_pixel as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisDirections {
    pub row: [f64; 3],
    pub column: [f64; 3],
    /// Scan-axis normal, `row × column`.
    pub normal: [f64; 3],
}

/// Immutable geometry of an assembled volume.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeDescriptor {
    /// (columns, rows, frames)
    pub dimensions: [usize; 3],
    pub spacing: [f64; 3],
    pub origin: [f64; 3],
    pub axis_directions: AxisDirections,
    pub sample_format: SampleFormat,
    pub size_in_bytes: usize,
    pub frame_of_reference: Option<String>,
}

impl VolumeDescriptor {
    pub fn frame_count(&self) -> usize {
        self.dimensions[2]
    }

    pub fn voxels_per_frame(&self) -> usize {
        self.dimensions[0] * self.dimensions[1]
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.voxels_per_frame() * self.sample_format.components * self.sample_format.element_width
    }

    /// Byte offset of the slot holding the frame at `sequence_index`.
    pub fn frame_offset(&self, sequence_index: usize) -> usize {
        sequence_index * self.bytes_per_frame()
    }

    /// Same geometry expressed in another sample format.
    ///
    /// # Errors
    ///
    /// [`ConstructionError::VolumeTooLarge`] when the byte size does not fit
    /// in `usize`.
    pub fn with_sample_format(
        &self,
        sample_format: SampleFormat,
    ) -> Result<Self, ConstructionError> {
        let [columns, rows, frames] = self.dimensions;
        let size_in_bytes = columns
            .checked_mul(rows)
            .and_then(|n| n.checked_mul(sample_format.components))
            .and_then(|n| n.checked_mul(sample_format.element_width))
            .and_then(|n| n.checked_mul(frames))
            .ok_or(ConstructionError::VolumeTooLarge {
                dimensions: self.dimensions,
            })?;
        let mut descriptor = self.clone();
        descriptor.sample_format = sample_format;
        descriptor.size_in_bytes = size_in_bytes;
        Ok(descriptor)
    }
}

/// One source frame and its place in the sorted volume.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEntry {
    pub frame_id: FrameId,
    pub sequence_index: usize,
    pub scaling: Option<ScalingParameters>,
    pub window: Option<WindowLevel>,
    pub completed: bool,
}

/// Result of a descriptor build.
#[derive(Debug, Clone)]
pub struct BuiltVolume {
    pub descriptor: VolumeDescriptor,
    /// Source raster layout shared by all frames.
    pub raster: RasterFormat,
    /// Frames in sequence order.
    pub frames: Vec<FrameEntry>,
    pub scaling_target: Option<ScalingParameters>,
    pub has_negative_rescale: bool,
}

pub struct VolumeDescriptorBuilder<'a, M: MetadataProvider + ?Sized> {
    provider: &'a M,
    ordering: FrameOrdering,
    strict_spacing: bool,
}

impl<'a, M: MetadataProvider + ?Sized> VolumeDescriptorBuilder<'a, M> {
    pub fn new(provider: &'a M) -> Self {
        Self {
            provider,
            ordering: FrameOrdering::default(),
            strict_spacing: false,
        }
    }

    pub fn ordering(mut self, ordering: FrameOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Treat a zero slice spacing as a fatal construction error.
    pub fn strict_spacing(mut self, strict: bool) -> Self {
        self.strict_spacing = strict;
        self
    }

    /// Derive the geometry and the sequence order of `frame_ids`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConstructionError`] when metadata is missing or
    /// inconsistent, or when the geometry is degenerate.
    pub fn build(&self, frame_ids: &[FrameId]) -> Result<BuiltVolume, ConstructionError> {
        let first_id = frame_ids.first().ok_or(ConstructionError::NoFrames)?;
        let mut seen = HashSet::with_capacity(frame_ids.len());
        if let Some(duplicate) = frame_ids.iter().find(|id| !seen.insert(*id)) {
            return Err(ConstructionError::DuplicateFrame(duplicate.clone()));
        }
        let first = self.resolve(first_id)?;
        let normal = scan_axis_normal(&first)?;
        let reference = first.plane.position;

        let (sorted, spacing) = match self.ordering {
            FrameOrdering::Unordered => self.sort_all(frame_ids, &first, reference, normal)?,
            FrameOrdering::ProtocolOrdered => self.order_from_middle(frame_ids, &first, reference, normal)?,
        };

        let count = sorted.len();
        let slice_spacing = self.resolve_spacing(spacing, count, &first)?;

        let origin = match &sorted[0].1 {
            Some(metadata) => metadata.plane.position,
            None => self.resolve(&sorted[0].0)?.plane.position,
        };

        let raster = first.raster;
        let [row_spacing, column_spacing] = first.plane.pixel_spacing.unwrap_or([1.0, 1.0]);
        let sample_format = SampleFormat::of_raster(&raster);
        let dimensions = [raster.columns as usize, raster.rows as usize, count];
        let descriptor = VolumeDescriptor {
            dimensions,
            spacing: [column_spacing, row_spacing, slice_spacing],
            origin,
            axis_directions: AxisDirections {
                row: first.plane.row_cosines,
                column: first.plane.column_cosines,
                normal,
            },
            sample_format,
            size_in_bytes: 0,
            frame_of_reference: first.plane.frame_of_reference.clone(),
        }
        .with_sample_format(sample_format)?;

        let scaling_target = sorted
            .iter()
            .find_map(|(_, metadata)| metadata.as_ref().and_then(|m| m.scaling));
        let has_negative_rescale = sorted
            .iter()
            .filter_map(|(_, metadata)| metadata.as_ref().and_then(|m| m.scaling))
            .chain(first.scaling)
            .any(|scaling| scaling.produces_negative());

        let frames = sorted
            .into_iter()
            .enumerate()
            .map(|(sequence_index, (frame_id, metadata))| FrameEntry {
                frame_id,
                sequence_index,
                scaling: metadata.as_ref().and_then(|m| m.scaling),
                window: metadata.as_ref().and_then(|m| m.window),
                completed: false,
            })
            .collect();

        debug!(
            frames = count,
            spacing = ?descriptor.spacing,
            "derived volume geometry"
        );

        Ok(BuiltVolume {
            descriptor,
            raster,
            frames,
            scaling_target,
            has_negative_rescale,
        })
    }

    fn resolve(&self, frame_id: &FrameId) -> Result<FrameMetadata, ConstructionError> {
        self.provider
            .frame_metadata(frame_id)
            .ok_or_else(|| ConstructionError::MissingMetadata(frame_id.clone()))
    }

    #[allow(clippy::type_complexity)]
    fn sort_all(
        &self,
        frame_ids: &[FrameId],
        first: &FrameMetadata,
        reference: [f64; 3],
        normal: [f64; 3],
    ) -> Result<(Vec<(FrameId, Option<FrameMetadata>)>, f64), ConstructionError> {
        let mut with_distance = Vec::with_capacity(frame_ids.len());
        for frame_id in frame_ids {
            let metadata = self.resolve(frame_id)?;
            if !same_layout(&metadata.raster, &first.raster) {
                return Err(ConstructionError::InconsistentRaster {
                    frame_id: frame_id.clone(),
                });
            }
            let distance = dot(sub(reference, metadata.plane.position), normal);
            with_distance.push((distance, frame_id.clone(), metadata));
        }

        // Stable: ties keep their input order.
        with_distance.sort_by(|a, b| b.0.total_cmp(&a.0));

        let count = with_distance.len();
        let spacing = if count > 1 {
            (with_distance[count - 1].0 - with_distance[0].0).abs() / (count - 1) as f64
        } else {
            0.0
        };

        let sorted = with_distance
            .into_iter()
            .map(|(_, frame_id, metadata)| (frame_id, Some(metadata)))
            .collect();
        Ok((sorted, spacing))
    }

    #[allow(clippy::type_complexity)]
    fn order_from_middle(
        &self,
        frame_ids: &[FrameId],
        first: &FrameMetadata,
        reference: [f64; 3],
        normal: [f64; 3],
    ) -> Result<(Vec<(FrameId, Option<FrameMetadata>)>, f64), ConstructionError> {
        let count = frame_ids.len();
        let mut sorted: Vec<(FrameId, Option<FrameMetadata>)> =
            frame_ids.iter().map(|id| (id.clone(), None)).collect();
        sorted[0].1 = Some(first.clone());
        if count == 1 {
            return Ok((sorted, 0.0));
        }

        let middle_index = count / 2;
        let middle = self.resolve(&frame_ids[middle_index])?;
        if !same_layout(&middle.raster, &first.raster) {
            return Err(ConstructionError::InconsistentRaster {
                frame_id: frame_ids[middle_index].clone(),
            });
        }
        let distance = dot(sub(reference, middle.plane.position), normal);
        let spacing = distance.abs() / middle_index as f64;
        sorted[middle_index].1 = Some(middle);

        // The sorted order runs by descending distance from the first frame.
        if distance > 0.0 {
            sorted.reverse();
        }
        Ok((sorted, spacing))
    }

    fn resolve_spacing(
        &self,
        spacing: f64,
        count: usize,
        first: &FrameMetadata,
    ) -> Result<f64, ConstructionError> {
        if !spacing.is_finite() {
            return Err(ConstructionError::NonFiniteSpacing);
        }
        if spacing != 0.0 {
            return Ok(spacing);
        }
        if self.strict_spacing && count > 1 {
            return Err(ConstructionError::ZeroSpacing);
        }
        let fallback = first
            .plane
            .slice_thickness
            .filter(|thickness| thickness.is_finite() && *thickness > 0.0)
            .unwrap_or(1.0);
        warn!(
            frames = count,
            fallback, "slice spacing could not be derived, volume geometry is degraded"
        );
        Ok(fallback)
    }
}

fn same_layout(a: &RasterFormat, b: &RasterFormat) -> bool {
    a.columns == b.columns
        && a.rows == b.rows
        && a.bits_allocated == b.bits_allocated
        && a.signed == b.signed
        && a.floating_point == b.floating_point
        && a.samples_per_pixel == b.samples_per_pixel
}

fn scan_axis_normal(metadata: &FrameMetadata) -> Result<[f64; 3], ConstructionError> {
    let normal = cross(metadata.plane.row_cosines, metadata.plane.column_cosines);
    let length = dot(normal, normal).sqrt();
    if !length.is_finite() || length < f64::EPSILON {
        return Err(ConstructionError::DegenerateOrientation);
    }
    Ok(normal.map(|c| c / length))
}

#[inline]
fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}
