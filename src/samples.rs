//! Typed sample storage shared by decoders, the normalizer and the buffer.

use crate::enums::ElementType;
use crate::metadata::ScalingParameters;

use rayon::prelude::*;

/// Element types the destination buffer can hold.
pub trait Sample: bytemuck::Pod + Send + Sync + PartialOrd {
    const ELEMENT: ElementType;

    fn to_f64(self) -> f64;

    /// Rounds and saturates into the element's range.
    fn from_f64(value: f64) -> Self;
}

macro_rules! integer_sample {
    ($ty:ty, $element:expr) => {
        impl Sample for $ty {
            const ELEMENT: ElementType = $element;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value.round() as $ty
            }
        }
    };
}

integer_sample!(u8, ElementType::U8);
integer_sample!(i16, ElementType::I16);
integer_sample!(u16, ElementType::U16);

impl Sample for f32 {
    const ELEMENT: ElementType = ElementType::F32;

    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

/// Decoded samples of one frame, interleaved when multi-component.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameSamples {
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

macro_rules! dispatch {
    ($samples:expr, $v:ident => $body:expr) => {
        match $samples {
            FrameSamples::U8($v) => $body,
            FrameSamples::I16($v) => $body,
            FrameSamples::U16($v) => $body,
            FrameSamples::F32($v) => $body,
        }
    };
}

impl FrameSamples {
    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            FrameSamples::U8(_) => ElementType::U8,
            FrameSamples::I16(_) => ElementType::I16,
            FrameSamples::U16(_) => ElementType::U16,
            FrameSamples::F32(_) => ElementType::F32,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        dispatch!(self, v => bytemuck::cast_slice(v.as_slice()))
    }

    /// Smallest and largest sample, `None` when empty.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        dispatch!(self, v => min_max(v))
    }

    /// Applies `value * slope + intercept` to every sample in one pass.
    pub fn map_affine(&self, slope: f64, intercept: f64) -> Vec<f32> {
        dispatch!(self, v => v
            .par_iter()
            .map(|&s| s.to_f64().mul_add(slope, intercept) as f32)
            .collect())
    }

    /// Converts into `T`, rounding and saturating integer targets.
    pub fn convert<T: Sample>(&self) -> Vec<T> {
        dispatch!(self, v => v.par_iter().map(|&s| T::from_f64(s.to_f64())).collect())
    }
}

pub(crate) fn min_max<T: Sample>(values: &[T]) -> Option<(f64, f64)> {
    values
        .par_iter()
        .map(|&v| {
            let v = v.to_f64();
            (v, v)
        })
        .reduce_with(|a, b| (a.0.min(b.0), a.1.max(b.1)))
}

/// Inverse map recorded when a frame was range-remapped into an integer
/// destination: `value = stored * slope + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageMapping {
    pub slope: f64,
    pub intercept: f64,
}

impl StorageMapping {
    #[inline]
    pub fn apply(&self, stored: f64) -> f64 {
        stored.mul_add(self.slope, self.intercept)
    }
}

/// A frame as returned by the decode/cache collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub samples: FrameSamples,
    /// Scaling the samples are currently expressed in.
    pub scaling: Option<ScalingParameters>,
    pub columns: u32,
    pub rows: u32,
    pub components: u16,
}

impl DecodedFrame {
    pub fn size_in_bytes(&self) -> usize {
        self.samples.as_bytes().len()
    }
}
