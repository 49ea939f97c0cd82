//! Notifications to the rendering collaborator and progress reporting types.

use crate::error::FrameError;
use crate::metadata::{FrameId, VolumeId};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum VolumeEvent {
    /// New data is available; a redraw may be worthwhile.
    RenderHint { volume_id: VolumeId },
    /// One frame was merged into the buffer.
    Modified {
        volume_id: VolumeId,
        sequence_index: usize,
    },
    LoadCompleted {
        volume_id: VolumeId,
        frame_of_reference: Option<String>,
    },
    FrameFailed {
        volume_id: VolumeId,
        frame_id: FrameId,
        error: FrameError,
    },
}

/// Fire-and-forget receiver of [`VolumeEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: VolumeEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: VolumeEvent) {}
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: UnboundedSender<VolumeEvent>,
}

impl ChannelEventSink {
    pub fn channel() -> (Self, UnboundedReceiver<VolumeEvent>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: VolumeEvent) {
        // A closed receiver means nobody is rendering.
        let _ = self.sender.unbounded_send(event);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameLoadError {
    pub frame_id: FrameId,
    pub sequence_index: usize,
    pub error: FrameError,
}

/// Snapshot delivered to progress callbacks after every processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub volume_id: VolumeId,
    pub frame_id: Option<FrameId>,
    pub sequence_index: Option<usize>,
    pub frames_loaded: usize,
    pub frames_processed: usize,
    pub total_frames: usize,
    pub error: Option<FrameError>,
    /// Set on the final delivery, together with the summary.
    pub summary: Option<LoadSummary>,
}

impl LoadProgress {
    pub fn is_complete(&self) -> bool {
        self.summary.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadSummary {
    pub volume_id: VolumeId,
    pub frames_loaded: usize,
    pub frames_processed: usize,
    pub total_frames: usize,
    pub errors: Vec<FrameLoadError>,
    pub elapsed: Duration,
}

impl LoadSummary {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub type ProgressCallback = Arc<dyn Fn(&LoadProgress) + Send + Sync>;
