use crate::cache::{DecodeOptions, FrameDecoder};
use crate::enums::ElementType;
use crate::error::FrameError;
use crate::metadata::{
    FrameId, FrameMetadata, ImagePlane, MetadataProvider, RasterFormat, ScalingParameters,
    WindowLevel,
};
use crate::samples::{DecodedFrame, FrameSamples};

use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom::pixeldata::PixelDecoder;
use dicom_dictionary_std::tags;
use futures::FutureExt;
use futures::future::BoxFuture;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("No valid DICOM images found")]
    NoValidImages,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// Frames backed by DICOM files, one frame per file.
///
/// Serves both frame metadata and decoded frames, so a single source can
/// drive a [`StreamingVolume`](crate::StreamingVolume) end to end.
pub struct DicomFrameSource {
    objects: HashMap<FrameId, Arc<FileDicomObject<InMemDicomObject>>>,
    frame_ids: Vec<FrameId>,
}

impl DicomFrameSource {
    /// Index DICOM objects by their SOP Instance UID.
    ///
    /// # Errors
    ///
    /// Returns error if none of the objects describes an image
    pub fn from_dicom_objects(
        dicom_objects: Vec<FileDicomObject<InMemDicomObject>>,
    ) -> Result<Self, SourceError> {
        let mut objects = HashMap::with_capacity(dicom_objects.len());
        let mut frame_ids = Vec::with_capacity(dicom_objects.len());
        for (index, object) in dicom_objects.into_iter().enumerate() {
            if Self::read_metadata(&object).is_none() {
                warn!(index, "skipping DICOM object without image attributes");
                continue;
            }
            let frame_id = Self::text(&object, tags::SOP_INSTANCE_UID)
                .map(FrameId::new)
                .unwrap_or_else(|| FrameId::new(format!("instance-{index}")));
            if objects.insert(frame_id.clone(), Arc::new(object)).is_none() {
                frame_ids.push(frame_id);
            }
        }

        if frame_ids.is_empty() {
            return Err(SourceError::NoValidImages);
        }
        debug!(frames = frame_ids.len(), "indexed DICOM frames");
        Ok(Self { objects, frame_ids })
    }

    /// Load DICOM files in parallel
    pub fn load_from_file_paths(paths: &[impl AsRef<Path> + Sync]) -> Result<Self, SourceError> {
        let objects: Result<Vec<_>, _> = paths
            .par_iter()
            .map(|path| open_file(path.as_ref()))
            .collect();

        Self::from_dicom_objects(objects?)
    }

    /// Load every .dcm file of a directory
    pub fn load_from_directory(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let paths: Vec<_> = fs::read_dir(path.as_ref())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(SourceError::NoValidImages);
        }

        Self::load_from_file_paths(&paths)
    }

    /// Frame identifiers in the order the objects were supplied.
    pub fn frame_ids(&self) -> &[FrameId] {
        &self.frame_ids
    }

    pub fn len(&self) -> usize {
        self.frame_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_ids.is_empty()
    }

    fn text(object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
        let value = object.element(tag).ok()?.to_str().ok()?;
        let value = value.trim_end_matches(['\0', ' ']);
        (!value.is_empty()).then(|| value.to_string())
    }

    fn float(object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<f64> {
        object.element(tag).ok()?.to_float64().ok()
    }

    fn floats<const N: usize>(object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<[f64; N]> {
        let values = object.element(tag).ok()?.to_multi_float64().ok()?;
        values.get(..N)?.try_into().ok()
    }

    fn uint(object: &InMemDicomObject, tag: dicom::core::Tag) -> Option<u32> {
        object.element(tag).ok()?.to_int::<u32>().ok()
    }

    pub(crate) fn read_metadata(object: &InMemDicomObject) -> Option<FrameMetadata> {
        let position = Self::floats::<3>(object, tags::IMAGE_POSITION_PATIENT)?;
        let orientation = Self::floats::<6>(object, tags::IMAGE_ORIENTATION_PATIENT)?;
        let raster = RasterFormat {
            columns: Self::uint(object, tags::COLUMNS)?,
            rows: Self::uint(object, tags::ROWS)?,
            bits_allocated: Self::uint(object, tags::BITS_ALLOCATED)? as u16,
            signed: Self::uint(object, tags::PIXEL_REPRESENTATION) == Some(1),
            samples_per_pixel: Self::uint(object, tags::SAMPLES_PER_PIXEL).unwrap_or(1) as u16,
            floating_point: object.element(tags::FLOAT_PIXEL_DATA).is_ok(),
        };

        let scaling = match (
            Self::float(object, tags::RESCALE_SLOPE),
            Self::float(object, tags::RESCALE_INTERCEPT),
        ) {
            (Some(slope), Some(intercept)) => Some(ScalingParameters::rescale(slope, intercept)),
            (Some(slope), None) => Some(ScalingParameters::rescale(slope, 0.0)),
            (None, Some(intercept)) => Some(ScalingParameters::rescale(1.0, intercept)),
            (None, None) => None,
        };
        let window = match (
            Self::floats::<1>(object, tags::WINDOW_CENTER),
            Self::floats::<1>(object, tags::WINDOW_WIDTH),
        ) {
            (Some([center]), Some([width])) => Some(WindowLevel { center, width }),
            _ => None,
        };

        Some(FrameMetadata {
            plane: ImagePlane {
                position,
                row_cosines: [orientation[0], orientation[1], orientation[2]],
                column_cosines: [orientation[3], orientation[4], orientation[5]],
                pixel_spacing: Self::floats::<2>(object, tags::PIXEL_SPACING),
                slice_thickness: Self::float(object, tags::SLICE_THICKNESS),
                frame_of_reference: Self::text(object, tags::FRAME_OF_REFERENCE_UID),
            },
            raster,
            scaling,
            window,
        })
    }

    fn source_element(raster: &RasterFormat) -> Result<ElementType, FrameError> {
        match (raster.bits_allocated, raster.signed, raster.floating_point) {
            (8, false, false) => Ok(ElementType::U8),
            (16, true, false) => Ok(ElementType::I16),
            (16, false, false) => Ok(ElementType::U16),
            (32, _, true) => Ok(ElementType::F32),
            (bits, signed, _) => Err(FrameError::Decode(format!(
                "unsupported pixel layout: {bits} bits allocated, signed: {signed}"
            ))),
        }
    }

    /// Native samples of `bytes`, which hold one frame in native byte order.
    pub(crate) fn samples_from_bytes(bytes: &[u8], element: ElementType) -> FrameSamples {
        match element {
            ElementType::U8 => FrameSamples::U8(bytes.to_vec()),
            ElementType::I16 => FrameSamples::I16(
                bytes
                    .par_chunks_exact(2)
                    .map(|b| i16::from_ne_bytes([b[0], b[1]]))
                    .collect(),
            ),
            ElementType::U16 => FrameSamples::U16(
                bytes
                    .par_chunks_exact(2)
                    .map(|b| u16::from_ne_bytes([b[0], b[1]]))
                    .collect(),
            ),
            ElementType::F32 => FrameSamples::F32(
                bytes
                    .par_chunks_exact(4)
                    .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
            ),
        }
    }

    fn decode_first_frame(
        frame_id: &FrameId,
        object: &FileDicomObject<InMemDicomObject>,
    ) -> Result<DecodedFrame, FrameError> {
        let metadata = Self::read_metadata(object)
            .ok_or_else(|| FrameError::Decode(format!("{frame_id} has no image attributes")))?;
        let raster = metadata.raster;
        let element = Self::source_element(&raster)?;

        let pixel_data = object
            .decode_pixel_data()
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        let frame_len = raster
            .pixels()
            .checked_mul(raster.samples_per_pixel as usize * element.width())
            .ok_or_else(|| FrameError::Decode(format!("{frame_id} raster is too large")))?;
        let bytes = pixel_data
            .data()
            .get(..frame_len)
            .ok_or_else(|| FrameError::SampleCount {
                expected: frame_len / element.width(),
                actual: pixel_data.data().len() / element.width(),
            })?;

        Ok(DecodedFrame {
            samples: Self::samples_from_bytes(bytes, element),
            scaling: metadata.scaling,
            columns: raster.columns,
            rows: raster.rows,
            components: raster.samples_per_pixel,
        })
    }
}

impl MetadataProvider for DicomFrameSource {
    fn frame_metadata(&self, frame_id: &FrameId) -> Option<FrameMetadata> {
        Self::read_metadata(self.objects.get(frame_id)?)
    }
}

impl FrameDecoder for DicomFrameSource {
    /// Decodes the first frame of the object on the blocking thread pool.
    fn decode(
        &self,
        frame_id: &FrameId,
        _options: &DecodeOptions,
    ) -> BoxFuture<'static, Result<DecodedFrame, FrameError>> {
        let Some(object) = self.objects.get(frame_id).cloned() else {
            let error = FrameError::Decode(format!("unknown frame {frame_id}"));
            return futures::future::ready(Err(error)).boxed();
        };
        let frame_id = frame_id.clone();
        async move {
            tokio::task::spawn_blocking(move || Self::decode_first_frame(&frame_id, &object))
                .await
                .map_err(|e| FrameError::Decode(e.to_string()))?
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};

    fn image_object(z: f64) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::IMAGE_POSITION_PATIENT,
                VR::DS,
                dicom_value!(F64, [0.0, 0.0, z]),
            ),
            DataElement::new(
                tags::IMAGE_ORIENTATION_PATIENT,
                VR::DS,
                dicom_value!(F64, [1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            ),
            DataElement::new(tags::PIXEL_SPACING, VR::DS, dicom_value!(F64, [0.5, 0.7])),
            DataElement::new(tags::ROWS, VR::US, PrimitiveValue::from(3_u16)),
            DataElement::new(tags::COLUMNS, VR::US, PrimitiveValue::from(4_u16)),
            DataElement::new(tags::BITS_ALLOCATED, VR::US, PrimitiveValue::from(16_u16)),
            DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, PrimitiveValue::from(1_u16)),
            DataElement::new(tags::RESCALE_SLOPE, VR::DS, dicom_value!(F64, [2.0])),
            DataElement::new(tags::RESCALE_INTERCEPT, VR::DS, dicom_value!(F64, [-1024.0])),
            DataElement::new(
                tags::FRAME_OF_REFERENCE_UID,
                VR::UI,
                PrimitiveValue::from("1.2.840.1\0"),
            ),
        ])
    }

    #[test]
    fn image_attributes_are_read_from_tags() {
        let metadata = DicomFrameSource::read_metadata(&image_object(12.5)).unwrap();
        assert_eq!(metadata.plane.position, [0.0, 0.0, 12.5]);
        assert_eq!(metadata.plane.column_cosines, [0.0, 1.0, 0.0]);
        assert_eq!(metadata.plane.pixel_spacing, Some([0.5, 0.7]));
        assert_eq!(metadata.plane.slice_thickness, None);
        assert_eq!(metadata.plane.frame_of_reference.as_deref(), Some("1.2.840.1"));
        assert_eq!(metadata.raster.pixels(), 12);
        assert!(metadata.raster.signed);
        assert_eq!(metadata.raster.samples_per_pixel, 1);
        assert_eq!(
            metadata.scaling,
            Some(ScalingParameters::rescale(2.0, -1024.0))
        );
        assert_eq!(metadata.window, None);
    }

    #[test]
    fn objects_without_geometry_are_not_images() {
        let object = InMemDicomObject::from_element_iter([DataElement::new(
            tags::ROWS,
            VR::US,
            PrimitiveValue::from(3_u16),
        )]);
        assert!(DicomFrameSource::read_metadata(&object).is_none());
    }

    #[test]
    fn native_bytes_become_typed_samples() {
        let values = [-5i16, 300, i16::MIN];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(
            DicomFrameSource::samples_from_bytes(&bytes, ElementType::I16),
            FrameSamples::I16(values.to_vec())
        );
    }

    #[test]
    fn unsupported_layouts_fail_to_decode() {
        let raster = RasterFormat {
            columns: 1,
            rows: 1,
            bits_allocated: 32,
            signed: false,
            samples_per_pixel: 1,
            floating_point: false,
        };
        assert!(matches!(
            DicomFrameSource::source_element(&raster),
            Err(FrameError::Decode(_))
        ));
    }
}
