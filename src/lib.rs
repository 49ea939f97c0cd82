//! # DICOM volume streaming library
//!
//! This crate assembles a 3-D voxel volume from image frames that are fetched
//! and decoded independently, merging each frame into one contiguous buffer
//! as soon as it arrives.
//!
//! The volume geometry (dimensions, spacing, origin and axis directions) is
//! derived up front from per-frame metadata, so the buffer is allocated once
//! and every frame writes only to its own slot. Frames of a volume may carry
//! different intensity scaling; they are rescaled into a single target scale
//! while being merged. Loading is driven through a prioritized scheduler,
//! reports progress after every frame and can be cancelled at any point.
//!
//! Frames are described by three collaborators:
//!  - a [`MetadataProvider`] resolving the geometry of each frame
//!  - a [`FrameCache`] decoding frames and accounting for memory
//!  - a [`Scheduler`] running the frame requests
//!
//! [`DicomFrameSource`] provides metadata and decoded frames straight from
//! DICOM files, [`LruFrameCache`] and [`PriorityScheduler`] are ready-made
//! cache and scheduler implementations.
//!
//! DICOM files are assumed to have the following attributes:
//!   - No multiframe (always the first frame is used)
//!   - Images from the same series and frame of reference
//!
//! # Examples
//!
//! ## Streaming a directory of DICOM files into a volume
//!
//! ```no_run
//! # use dicom_volume_stream::*;
//! # use std::sync::Arc;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let source = Arc::new(DicomFrameSource::load_from_directory("dicom")?);
//! let frame_ids = source.frame_ids().to_vec();
//! let collaborators = VolumeCollaborators {
//!     cache: Arc::new(LruFrameCache::new(source.clone(), 1 << 30)),
//!     scheduler: Arc::new(PriorityScheduler::new(8)?),
//!     events: Arc::new(NullEventSink),
//! };
//! let volume = StreamingVolume::create(
//!     VolumeId::new("series"),
//!     &frame_ids,
//!     &source,
//!     collaborators,
//!     AssemblerConfig::default(),
//! )?;
//! let completion = volume.completion();
//! volume.load(None)?;
//! let summary = completion.await?;
//! println!("{} of {} frames loaded", summary.frames_loaded, summary.total_frames);
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod buffer;
pub mod cache;
pub mod descriptor;
pub mod dicom_source;
pub mod enums;
pub mod error;
pub mod events;
pub mod frame_view;
pub mod metadata;
pub mod request;
pub mod samples;
pub mod scaling;
pub mod scheduler;
pub mod volume;

pub use cache::{DecodeOptions, FrameCache, FrameDecoder, LruFrameCache};
pub use descriptor::{FrameEntry, VolumeDescriptor, VolumeDescriptorBuilder};
pub use dicom_source::{DicomFrameSource, SourceError};
pub use enums::{
    AssemblerState, ElementType, FrameOrdering, RequestClass, ScalingSource, SharingMode,
};
pub use error::{
    AllocationError, ConstructionError, FrameError, ScalingError, SchedulerError, VolumeError,
};
pub use events::{
    ChannelEventSink, EventSink, FrameLoadError, LoadProgress, LoadSummary, NullEventSink,
    ProgressCallback, VolumeEvent,
};
pub use frame_view::{FrameData, FrameView};
pub use metadata::{
    FrameId, FrameMetadata, ImagePlane, MetadataProvider, RasterFormat, ScalingParameters,
    VolumeId, WindowLevel,
};
pub use samples::{DecodedFrame, FrameSamples, Sample};
pub use scheduler::{PriorityScheduler, RequestMeta, Scheduler, Task, TaskHandle};
pub use volume::{AssemblerConfig, DecacheReport, StreamingVolume, VolumeCollaborators};
