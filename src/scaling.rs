use crate::enums::ElementType;
use crate::error::ScalingError;
use crate::metadata::ScalingParameters;
use crate::samples::{FrameSamples, Sample, StorageMapping};

use rayon::prelude::*;
use std::borrow::Cow;
use std::sync::OnceLock;
use tracing::warn;

/// Volume-wide reference scaling, set at most once.
#[derive(Debug, Default)]
pub struct ScalingTarget {
    target: OnceLock<ScalingParameters>,
}

impl ScalingTarget {
    pub fn new(target: Option<ScalingParameters>) -> Self {
        let cell = OnceLock::new();
        if let Some(target) = target {
            let _ = cell.set(target);
        }
        Self { target: cell }
    }

    pub fn get(&self) -> Option<&ScalingParameters> {
        self.target.get()
    }

    /// Returns the established target, adopting `candidate` if none exists.
    pub fn resolve(&self, candidate: Option<&ScalingParameters>) -> Option<&ScalingParameters> {
        match (self.target.get(), candidate) {
            (Some(target), _) => Some(target),
            (None, Some(candidate)) => {
                let adopted = self.target.get_or_init(|| *candidate);
                if adopted == candidate {
                    warn!(
                        slope = adopted.slope,
                        intercept = adopted.intercept,
                        "scaling target adopted from the first decoded frame, result depends on load order"
                    );
                }
                Some(adopted)
            }
            (None, None) => None,
        }
    }
}

/// Combined affine correction from a frame's scale to the target scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleCorrection {
    pub slope: f64,
    pub intercept: f64,
}

pub struct ScalingNormalizer;

impl ScalingNormalizer {
    /// Express `samples` in the target scale.
    ///
    /// Samples already in the target scale are returned borrowed; callers
    /// never mutate decoded frames in place.
    pub fn normalize<'a>(
        samples: &'a FrameSamples,
        frame: Option<&ScalingParameters>,
        target: Option<&ScalingParameters>,
    ) -> Result<Cow<'a, FrameSamples>, ScalingError> {
        match Self::correction(frame, target)? {
            None => Ok(Cow::Borrowed(samples)),
            Some(correction) => Ok(Cow::Owned(FrameSamples::F32(
                samples.map_affine(correction.slope, correction.intercept),
            ))),
        }
    }

    /// Fold rescale and quantitative corrections into one affine map.
    /// `None` when the frame is already in the target scale.
    pub fn correction(
        frame: Option<&ScalingParameters>,
        target: Option<&ScalingParameters>,
    ) -> Result<Option<ScaleCorrection>, ScalingError> {
        let (frame, target) = match (frame, target) {
            (None, None) => return Ok(None),
            (None, Some(_)) => return Err(ScalingError::MissingFrameScaling),
            // Nothing to reconcile against.
            (Some(_), None) => return Ok(None),
            (Some(frame), Some(target)) => (frame, target),
        };
        if frame.same_scale(target) {
            return Ok(None);
        }
        if target.slope == 0.0 {
            return Err(ScalingError::ZeroTargetSlope);
        }

        let factor = match (frame.quantitative_factor, target.quantitative_factor) {
            (None, None) => 1.0,
            (Some(_), Some(t)) if t == 0.0 => return Err(ScalingError::ZeroTargetFactor),
            (Some(f), Some(t)) => f / t,
            _ => return Err(ScalingError::FactorMismatch),
        };

        let ratio = frame.slope / target.slope;
        Ok(Some(ScaleCorrection {
            slope: ratio * factor,
            intercept: (frame.intercept - target.intercept * ratio) * factor,
        }))
    }
}

/// Samples converted to the destination element type.
#[derive(Debug)]
pub struct StoredFrame<'a> {
    pub samples: Cow<'a, FrameSamples>,
    pub mapping: Option<StorageMapping>,
}

/// Convert normalized samples into `element`.
///
/// Floating-point samples that an integer destination cannot represent
/// exactly are remapped by their observed range; the inverse map is returned
/// alongside.
pub fn encode_for_storage(samples: Cow<'_, FrameSamples>, element: ElementType) -> StoredFrame<'_> {
    if samples.element_type() == element {
        return StoredFrame {
            samples,
            mapping: None,
        };
    }
    match element {
        ElementType::F32 => exact(FrameSamples::F32(samples.convert::<f32>())),
        ElementType::U8 => encode_integer::<u8>(&samples, FrameSamples::U8),
        ElementType::I16 => encode_integer::<i16>(&samples, FrameSamples::I16),
        ElementType::U16 => encode_integer::<u16>(&samples, FrameSamples::U16),
    }
}

fn exact<'a>(samples: FrameSamples) -> StoredFrame<'a> {
    StoredFrame {
        samples: Cow::Owned(samples),
        mapping: None,
    }
}

fn encode_integer<'a, T: Sample>(
    samples: &FrameSamples,
    wrap: fn(Vec<T>) -> FrameSamples,
) -> StoredFrame<'a> {
    let (low, high) = T::ELEMENT.range();
    let Some((min, max)) = samples.min_max() else {
        return exact(wrap(Vec::new()));
    };
    let integral = match samples {
        FrameSamples::F32(values) => values.par_iter().all(|v| v.fract() == 0.0),
        _ => true,
    };
    if integral && min >= low && max <= high {
        return exact(wrap(samples.convert::<T>()));
    }

    let scale = if max > min { (high - low) / (max - min) } else { 1.0 };
    let remapped = samples
        .map_affine(scale, scale.mul_add(-min, low))
        .into_par_iter()
        .map(|v| T::from_f64(f64::from(v)))
        .collect();
    StoredFrame {
        samples: Cow::Owned(wrap(remapped)),
        mapping: Some(StorageMapping {
            slope: 1.0 / scale,
            intercept: min - low / scale,
        }),
    }
}
