use crate::buffer::DestinationBuffer;
use crate::cache::FrameCache;
use crate::descriptor::{SampleFormat, VolumeDescriptor};
use crate::enums::{ElementType, SharingMode};
use crate::error::{AllocationError, ConstructionError, VolumeError};
use crate::metadata::{RasterFormat, VolumeId};

use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationOptions {
    pub prefer_reduced_precision: bool,
    pub has_negative_rescale: bool,
    pub sharing: SharingMode,
    /// Whether the environment permits shared memory at all.
    pub shared_memory_available: bool,
}

#[derive(Debug)]
pub struct Allocation {
    /// Descriptor re-derived for the destination sample format.
    pub descriptor: VolumeDescriptor,
    pub buffer: Arc<DestinationBuffer>,
}

pub struct BufferAllocator;

impl BufferAllocator {
    /// Destination element and component count for a source raster.
    pub fn destination_element(
        raster: &RasterFormat,
        options: &AllocationOptions,
    ) -> Result<(ElementType, usize), ConstructionError> {
        let components = raster.samples_per_pixel as usize;
        let unsupported = || ConstructionError::UnsupportedFormat {
            bits_allocated: raster.bits_allocated,
            components: raster.samples_per_pixel,
            signed: raster.signed,
        };

        let element = match (raster.bits_allocated, components, raster.floating_point) {
            (8, 1 | 3 | 4, false) if !raster.signed => ElementType::U8,
            (16, 1, false) if options.prefer_reduced_precision => {
                if raster.signed || options.has_negative_rescale {
                    ElementType::I16
                } else {
                    ElementType::U16
                }
            }
            (16, 1, false) => ElementType::F32,
            (32, 1, true) => ElementType::F32,
            _ => return Err(unsupported()),
        };
        Ok((element, components))
    }

    /// Reserve room in the cache and allocate the destination buffer.
    ///
    /// # Errors
    ///
    /// [`ConstructionError::UnsupportedFormat`] for rasters without a
    /// destination type, [`AllocationError::Capacity`] when the cache cannot
    /// admit the volume, and [`AllocationError::SharedMemoryUnavailable`] when
    /// shared memory is required but cannot be provided.
    pub fn allocate(
        volume_id: &VolumeId,
        descriptor: &VolumeDescriptor,
        raster: &RasterFormat,
        options: &AllocationOptions,
        cache: &dyn FrameCache,
    ) -> Result<Allocation, VolumeError> {
        let (element, components) = Self::destination_element(raster, options)?;
        let descriptor =
            descriptor.with_sample_format(SampleFormat::of_element(element, components))?;
        let size = descriptor.size_in_bytes;

        if !cache.admit(size) {
            return Err(AllocationError::Capacity { requested: size }.into());
        }
        let freed = cache.evict_until_fits(size);
        if freed > 0 {
            debug!(%volume_id, freed, "evicted cached frames to fit volume");
        }

        let buffer = Self::allocate_buffer(&descriptor, element, options)?;
        cache.reserve_volume(volume_id, size);
        info!(
            %volume_id,
            size,
            %element,
            shared = buffer.is_shared(),
            "allocated volume buffer"
        );
        Ok(Allocation {
            descriptor,
            buffer: Arc::new(buffer),
        })
    }

    fn allocate_buffer(
        descriptor: &VolumeDescriptor,
        element: ElementType,
        options: &AllocationOptions,
    ) -> Result<DestinationBuffer, AllocationError> {
        let frames = descriptor.frame_count();
        let bytes_per_frame = descriptor.bytes_per_frame();
        match options.sharing {
            SharingMode::Private => DestinationBuffer::private(frames, bytes_per_frame, element),
            SharingMode::Required if !options.shared_memory_available => Err(
                AllocationError::SharedMemoryUnavailable("disabled by the environment".into()),
            ),
            SharingMode::Required => DestinationBuffer::shared(frames, bytes_per_frame, element),
            SharingMode::Preferred if !options.shared_memory_available => {
                DestinationBuffer::private(frames, bytes_per_frame, element)
            }
            SharingMode::Preferred => DestinationBuffer::shared(frames, bytes_per_frame, element)
                .or_else(|err| {
                    warn!(%err, "shared memory unavailable, using a private buffer");
                    DestinationBuffer::private(frames, bytes_per_frame, element)
                }),
        }
    }
}
