use crate::enums::{AssemblerState, ElementType};
use crate::metadata::FrameId;

use thiserror::Error;

/// Fatal errors raised while deriving the volume geometry.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("No frames were supplied")]
    NoFrames,

    #[error("Missing metadata for frame {0}")]
    MissingMetadata(FrameId),

    #[error("Frame {0} was supplied more than once")]
    DuplicateFrame(FrameId),

    #[error("Degenerate image orientation: row and column cosines are parallel")]
    DegenerateOrientation,

    #[error("Frame {frame_id} has a raster layout inconsistent with the first frame")]
    InconsistentRaster { frame_id: FrameId },

    #[error("Volume of {dimensions:?} voxels exceeds the addressable size")]
    VolumeTooLarge { dimensions: [usize; 3] },

    #[error("Computed slice spacing is zero and strict spacing is enforced")]
    ZeroSpacing,

    #[error("Computed slice spacing is not finite")]
    NonFiniteSpacing,

    #[error(
        "Unsupported raster format: {bits_allocated} bits, {components} component(s), signed: {signed}"
    )]
    UnsupportedFormat {
        bits_allocated: u16,
        components: u16,
        signed: bool,
    },
}

/// Fatal errors raised while reserving the destination buffer.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Volume of {requested} bytes cannot be admitted by the cache")]
    Capacity { requested: usize },

    #[error("Shared memory was required but is not available: {0}")]
    SharedMemoryUnavailable(String),

    #[error("Invalid buffer layout of {0} bytes")]
    InvalidLayout(usize),

    #[error("{frames} frames of {bytes_per_frame} bytes exceed the addressable size")]
    SizeOverflow {
        frames: usize,
        bytes_per_frame: usize,
    },
}

/// A frame's scaling could not be reconciled with the volume target.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScalingError {
    #[error("Frame carries no scaling parameters but the volume requires them")]
    MissingFrameScaling,

    #[error("Target scaling has a zero slope")]
    ZeroTargetSlope,

    #[error("Quantitative factor present on only one side of the reconciliation")]
    FactorMismatch,

    #[error("Target quantitative factor is zero")]
    ZeroTargetFactor,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("Slot {0} is already issued for this generation")]
    AlreadyIssued(usize),

    #[error("Slot {0} is out of range")]
    OutOfRange(usize),

    #[error("Slot write of {actual} bytes does not match the slot length {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("Slot {0} was revoked before the write")]
    Revoked(usize),
}

/// A single frame failed to load or merge. Never fatal to the volume.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Scaling inconsistency: {0}")]
    Scaling(#[from] ScalingError),

    #[error("Decoded {actual} samples, expected {expected}")]
    SampleCount { expected: usize, actual: usize },

    #[error("Frame could not be stored as {0}")]
    Storage(ElementType),

    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No tokio runtime is available: {0}")]
    NoRuntime(String),
}

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("Operation not permitted in state {0:?}")]
    InvalidState(AssemblerState),

    #[error("Unknown frame {0}")]
    UnknownFrame(FrameId),

    #[error("No frame at sequence index {0}")]
    SequenceIndex(usize),

    #[error("Frame {0} has not been loaded")]
    FrameNotLoaded(FrameId),

    #[error("Volume elements are {actual}, requested {requested}")]
    ElementMismatch {
        requested: ElementType,
        actual: ElementType,
    },

    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),
}
