use crate::enums::ElementType;
use crate::metadata::{FrameId, ScalingParameters, WindowLevel};
use crate::samples::{DecodedFrame, FrameSamples, Sample, StorageMapping, min_max};

use image::{GrayImage, ImageBuffer};
use ndarray::ArrayView2;
use rayon::prelude::*;

/// Borrowed samples of one frame slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameData<'a> {
    U8(&'a [u8]),
    I16(&'a [i16]),
    U16(&'a [u16]),
    F32(&'a [f32]),
}

macro_rules! dispatch_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            FrameData::U8($v) => $body,
            FrameData::I16($v) => $body,
            FrameData::U16($v) => $body,
            FrameData::F32($v) => $body,
        }
    };
}

impl FrameData<'_> {
    pub fn len(&self) -> usize {
        dispatch_data!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_owned_samples(self) -> FrameSamples {
        match self {
            FrameData::U8(v) => FrameSamples::U8(v.to_vec()),
            FrameData::I16(v) => FrameSamples::I16(v.to_vec()),
            FrameData::U16(v) => FrameSamples::U16(v.to_vec()),
            FrameData::F32(v) => FrameSamples::F32(v.to_vec()),
        }
    }

    fn value_at(&self, index: usize) -> Option<f64> {
        dispatch_data!(self, v => v.get(index).map(|s| s.to_f64()))
    }
}

/// A frame of the volume, viewed in place without copying.
#[derive(Debug, Clone)]
pub struct FrameView<'a> {
    pub frame_id: FrameId,
    pub sequence_index: usize,
    pub columns: usize,
    pub rows: usize,
    pub components: usize,
    pub data: FrameData<'a>,
    /// Inverse of a range remap applied when the frame was stored.
    pub storage_mapping: Option<StorageMapping>,
    /// Scale the values are expressed in.
    pub scaling: Option<ScalingParameters>,
    pub(crate) window_hint: Option<WindowLevel>,
}

impl<'a> FrameView<'a> {
    /// Stored value at (column, row) for single-component frames, with any
    /// storage remap undone.
    pub fn value(&self, column: usize, row: usize) -> Option<f64> {
        if column >= self.columns || row >= self.rows {
            return None;
        }
        let index = (row * self.columns + column) * self.components;
        let stored = self.data.value_at(index)?;
        Some(self.unmap(stored))
    }

    #[inline]
    fn unmap(&self, stored: f64) -> f64 {
        match self.storage_mapping {
            Some(mapping) => mapping.apply(stored),
            None => stored,
        }
    }

    /// Smallest and largest value in the frame.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        let (low, high) = dispatch_data!(self.data, v => min_max(v))?;
        let (a, b) = (self.unmap(low), self.unmap(high));
        Some((a.min(b), a.max(b)))
    }

    /// Window from the frame's metadata, or spanning its value range.
    pub fn window(&self) -> Option<WindowLevel> {
        if let Some(hint) = self.window_hint {
            return Some(hint);
        }
        let (min, max) = self.min_max()?;
        Some(WindowLevel {
            center: (max + min) / 2.0,
            width: (max - min).max(1.0),
        })
    }

    /// Rows × columns view of a single-component frame stored as `T`.
    pub fn to_ndarray<T: Sample>(&self) -> Option<ArrayView2<'a, T>> {
        if self.components != 1 || T::ELEMENT != self.element() {
            return None;
        }
        let values: &'a [T] = match self.data {
            FrameData::U8(v) => bytemuck::try_cast_slice(v).ok()?,
            FrameData::I16(v) => bytemuck::try_cast_slice(v).ok()?,
            FrameData::U16(v) => bytemuck::try_cast_slice(v).ok()?,
            FrameData::F32(v) => bytemuck::try_cast_slice(v).ok()?,
        };
        ArrayView2::from_shape((self.rows, self.columns), values).ok()
    }

    pub fn element(&self) -> ElementType {
        match self.data {
            FrameData::U8(_) => ElementType::U8,
            FrameData::I16(_) => ElementType::I16,
            FrameData::U16(_) => ElementType::U16,
            FrameData::F32(_) => ElementType::F32,
        }
    }

    /// Render a single-component frame to 8-bit grayscale through `window`,
    /// defaulting to [`FrameView::window`].
    pub fn to_image(&self, window: Option<WindowLevel>) -> Option<GrayImage> {
        if self.components != 1 {
            return None;
        }
        let window = window.or_else(|| self.window())?;
        let low = window.center - window.width / 2.0;
        let width = window.width.max(f64::EPSILON);
        let pixel_data: Vec<u8> = dispatch_data!(self.data, v => v
            .par_iter()
            .map(|&s| Self::normalize_to_u8(self.unmap(s.to_f64()), low, width))
            .collect());
        ImageBuffer::from_raw(self.columns as u32, self.rows as u32, pixel_data)
    }

    #[inline]
    fn normalize_to_u8(value: f64, low: f64, width: f64) -> u8 {
        (((value - low) / width) * 255.0).clamp(0.0, 255.0) as u8
    }

    /// Owned copy in the volume's scale, suitable for the single-frame cache.
    pub fn to_decoded_frame(&self) -> DecodedFrame {
        let samples = match self.storage_mapping {
            Some(mapping) => FrameSamples::F32(dispatch_data!(self.data, v => v
                .par_iter()
                .map(|&s| mapping.apply(s.to_f64()) as f32)
                .collect())),
            None => self.data.to_owned_samples(),
        };
        DecodedFrame {
            samples,
            scaling: self.scaling,
            columns: self.columns as u32,
            rows: self.rows as u32,
            components: self.components as u16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(data: FrameData<'_>) -> FrameView<'_> {
        FrameView {
            frame_id: FrameId::new("f"),
            sequence_index: 0,
            columns: 3,
            rows: 2,
            components: 1,
            data,
            storage_mapping: None,
            scaling: None,
            window_hint: None,
        }
    }

    #[test]
    fn ndarray_view_is_row_major() {
        let values = [0u16, 1, 2, 10, 11, 12];
        let frame = view(FrameData::U16(&values));
        let array = frame.to_ndarray::<u16>().unwrap();
        assert_eq!(array.dim(), (2, 3));
        assert_eq!(array[[1, 2]], 12);
        assert!(frame.to_ndarray::<f32>().is_none());
        assert_eq!(frame.value(2, 1), Some(12.0));
        assert_eq!(frame.value(3, 0), None);
    }

    #[test]
    fn window_defaults_to_value_range() {
        let values = [-100.0f32, 0.0, 100.0, 50.0, 25.0, 0.0];
        let frame = view(FrameData::F32(&values));
        assert_eq!(frame.min_max(), Some((-100.0, 100.0)));
        assert_eq!(
            frame.window(),
            Some(WindowLevel {
                center: 0.0,
                width: 200.0
            })
        );
    }

    #[test]
    fn image_is_windowed_to_eight_bits() {
        let values = [0u16, 50, 100, 150, 200, 400];
        let frame = view(FrameData::U16(&values));
        let image = frame
            .to_image(Some(WindowLevel {
                center: 100.0,
                width: 200.0,
            }))
            .unwrap();
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(0, 0).0[0], 0);
        assert_eq!(image.get_pixel(2, 0).0[0], 127);
        assert_eq!(image.get_pixel(2, 1).0[0], 255);
    }

    #[test]
    fn storage_mapping_is_undone() {
        let values = [0u16, 2, 0, 0, 0, 0];
        let mut frame = view(FrameData::U16(&values));
        frame.storage_mapping = Some(StorageMapping {
            slope: 0.5,
            intercept: 0.5,
        });
        assert_eq!(frame.value(1, 0), Some(1.5));
        assert_eq!(frame.min_max(), Some((0.5, 1.5)));
        let FrameSamples::F32(copy) = frame.to_decoded_frame().samples else {
            panic!("remapped frames are copied as f32");
        };
        assert_eq!(copy[1], 1.5);
    }
}
