use crate::buffer::{DestinationBuffer, FrameSlot};
use crate::cache::{DecodeOptions, FrameCache};
use crate::descriptor::FrameEntry;
use crate::error::{FrameError, SlotError};
use crate::metadata::{FrameId, ScalingParameters, VolumeId};
use crate::samples::StorageMapping;
use crate::scaling::{ScalingNormalizer, ScalingTarget, encode_for_storage};
use crate::scheduler::{RequestMeta, Task};

use futures::FutureExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// What a successful frame merge reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMerged {
    pub storage_mapping: Option<StorageMapping>,
    pub scaling: Option<ScalingParameters>,
}

/// Receives the outcome of every frame task that was not cancelled.
pub trait CompletionSink: Send + Sync + 'static {
    fn frame_processed(
        &self,
        generation: u64,
        sequence_index: usize,
        outcome: Result<FrameMerged, FrameError>,
    );
}

/// State shared by all requests of one load generation.
pub struct RequestContext {
    pub volume_id: VolumeId,
    pub generation: u64,
    pub cache: Arc<dyn FrameCache>,
    pub scaling_target: Arc<ScalingTarget>,
    pub cancelled: Arc<AtomicBool>,
    pub decode_options: DecodeOptions,
    pub sink: Arc<dyn CompletionSink>,
}

enum MergeError {
    Cancelled,
    Failed(FrameError),
}

impl From<FrameError> for MergeError {
    fn from(error: FrameError) -> Self {
        MergeError::Failed(error)
    }
}

/// One cancelable load-and-merge unit targeting a single frame slot.
pub struct FrameRequest {
    frame_id: FrameId,
    slot: FrameSlot,
    context: Arc<RequestContext>,
}

impl FrameRequest {
    pub fn meta(&self) -> RequestMeta {
        RequestMeta {
            volume_id: self.context.volume_id.clone(),
            frame_id: self.frame_id.clone(),
            sequence_index: self.slot.index(),
        }
    }

    pub fn sequence_index(&self) -> usize {
        self.slot.index()
    }

    pub fn offset(&self) -> usize {
        self.slot.offset()
    }

    pub fn into_task(self) -> Task {
        self.run().boxed()
    }

    /// Decode, normalize, write, report. Errors never escape the task.
    pub async fn run(self) {
        let FrameRequest {
            frame_id,
            slot,
            context,
        } = self;
        let sequence_index = slot.index();

        match Self::merge(&context, &frame_id, slot).await {
            Ok(merged) => {
                debug!(%frame_id, sequence_index, "frame merged");
                context
                    .sink
                    .frame_processed(context.generation, sequence_index, Ok(merged));
            }
            Err(MergeError::Cancelled) => {
                debug!(%frame_id, sequence_index, "frame discarded after cancellation");
            }
            Err(MergeError::Failed(_)) if context.cancelled.load(Ordering::Acquire) => {
                debug!(%frame_id, sequence_index, "frame failed after cancellation");
            }
            Err(MergeError::Failed(err)) => {
                error!(%frame_id, sequence_index, %err, "frame load failed");
                context
                    .sink
                    .frame_processed(context.generation, sequence_index, Err(err));
            }
        }
    }

    async fn merge(
        context: &RequestContext,
        frame_id: &FrameId,
        slot: FrameSlot,
    ) -> Result<FrameMerged, MergeError> {
        if context.cancelled.load(Ordering::Acquire) {
            return Err(MergeError::Cancelled);
        }
        let decoded = context
            .cache
            .decode_frame(frame_id, context.decode_options)
            .await?;

        let element = slot.element();
        let expected = slot.len() / element.width();
        if decoded.samples.len() != expected {
            return Err(FrameError::SampleCount {
                expected,
                actual: decoded.samples.len(),
            }
            .into());
        }

        let target = context
            .scaling_target
            .resolve(decoded.scaling.as_ref())
            .copied();
        let normalized = ScalingNormalizer::normalize(
            &decoded.samples,
            decoded.scaling.as_ref(),
            target.as_ref(),
        )
        .map_err(FrameError::from)?;
        let stored = encode_for_storage(normalized, element);
        if stored.samples.element_type() != element {
            return Err(FrameError::Storage(element).into());
        }

        if context.cancelled.load(Ordering::Acquire) {
            return Err(MergeError::Cancelled);
        }
        slot.write(stored.samples.as_bytes()).map_err(|err| match err {
            SlotError::Revoked(_) => MergeError::Cancelled,
            other => MergeError::Failed(other.into()),
        })?;

        Ok(FrameMerged {
            storage_mapping: stored.mapping,
            scaling: decoded.scaling,
        })
    }
}

pub struct FrameRequestGenerator {
    context: Arc<RequestContext>,
    buffer: Arc<DestinationBuffer>,
}

impl FrameRequestGenerator {
    pub fn new(context: RequestContext, buffer: Arc<DestinationBuffer>) -> Self {
        Self {
            context: Arc::new(context),
            buffer,
        }
    }

    /// One request per uncompleted frame, last sequence index first.
    ///
    /// # Errors
    ///
    /// Fails when a slot is already issued for this generation.
    pub fn generate(&self, frames: &[FrameEntry]) -> Result<Vec<FrameRequest>, SlotError> {
        frames
            .iter()
            .rev()
            .filter(|frame| !frame.completed)
            .map(|frame| -> Result<FrameRequest, SlotError> {
                let slot = self
                    .buffer
                    .issue_slot(frame.sequence_index, self.context.generation)?;
                Ok(FrameRequest {
                    frame_id: frame.frame_id.clone(),
                    slot,
                    context: Arc::clone(&self.context),
                })
            })
            .collect()
    }
}
