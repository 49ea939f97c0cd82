use crate::allocator::{AllocationOptions, BufferAllocator};
use crate::buffer::DestinationBuffer;
use crate::cache::{DecodeOptions, FrameCache};
use crate::descriptor::{BuiltVolume, FrameEntry, VolumeDescriptor, VolumeDescriptorBuilder};
use crate::enums::{AssemblerState, ElementType, FrameOrdering, RequestClass, SharingMode};
use crate::error::{FrameError, VolumeError};
use crate::events::{
    EventSink, FrameLoadError, LoadProgress, LoadSummary, ProgressCallback, VolumeEvent,
};
use crate::frame_view::{FrameData, FrameView};
use crate::metadata::{FrameId, MetadataProvider, ScalingParameters, VolumeId};
use crate::request::{CompletionSink, FrameMerged, FrameRequestGenerator, RequestContext};
use crate::samples::{Sample, StorageMapping};
use crate::scaling::ScalingTarget;
use crate::scheduler::{RequestMeta, Scheduler, TaskHandle};

use futures::channel::oneshot;
use ndarray::ArrayView3;
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use web_time::Instant;

/// Tuning of a streaming volume.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    pub ordering: FrameOrdering,
    pub strict_spacing: bool,
    pub prefer_reduced_precision: bool,
    pub sharing: SharingMode,
    pub shared_memory_available: bool,
    /// Fraction of the frame count between render hints.
    pub render_hint_fraction: f64,
    pub request_class: RequestClass,
    pub priority: i32,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            ordering: FrameOrdering::default(),
            strict_spacing: false,
            prefer_reduced_precision: false,
            sharing: SharingMode::default(),
            shared_memory_available: true,
            render_hint_fraction: 0.02,
            request_class: RequestClass::default(),
            priority: 0,
        }
    }
}

/// External collaborators a volume talks to.
#[derive(Clone)]
pub struct VolumeCollaborators {
    pub cache: Arc<dyn FrameCache>,
    pub scheduler: Arc<dyn Scheduler>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecacheReport {
    /// Frames handed back to the single-frame cache, in sequence order.
    pub retained_frames: Vec<FrameId>,
    pub released_bytes: usize,
}

struct LoadStatus {
    generation: u64,
    state: AssemblerState,
    cancelled: Arc<AtomicBool>,
    frames: Vec<FrameEntry>,
    cached_frames: Vec<bool>,
    settled: Vec<bool>,
    storage_mappings: Vec<Option<StorageMapping>>,
    frames_loaded: usize,
    frames_processed: usize,
    errors: Vec<FrameLoadError>,
    callbacks: Vec<ProgressCallback>,
    waiters: Vec<oneshot::Sender<LoadSummary>>,
    handles: Vec<TaskHandle>,
    next_render_target: f64,
    started_at: Option<Instant>,
    summary: Option<LoadSummary>,
}

impl LoadStatus {
    fn new(generation: u64, frames: Vec<FrameEntry>, render_step: f64) -> Self {
        let count = frames.len();
        Self {
            generation,
            state: AssemblerState::Idle,
            cancelled: Arc::new(AtomicBool::new(false)),
            frames,
            cached_frames: vec![false; count],
            settled: vec![false; count],
            storage_mappings: vec![None; count],
            frames_loaded: 0,
            frames_processed: 0,
            errors: Vec::new(),
            callbacks: Vec::new(),
            waiters: Vec::new(),
            handles: Vec::new(),
            next_render_target: render_step,
            started_at: None,
            summary: None,
        }
    }
}

/// Work gathered under the status lock and performed after releasing it.
#[derive(Default)]
struct Deliveries {
    events: Vec<VolumeEvent>,
    callbacks: Vec<ProgressCallback>,
    progress: Option<LoadProgress>,
    waiters: Vec<oneshot::Sender<LoadSummary>>,
    summary: Option<LoadSummary>,
}

impl Deliveries {
    fn deliver(self, events: &dyn EventSink) {
        for event in self.events {
            events.emit(event);
        }
        if let Some(progress) = &self.progress {
            for callback in &self.callbacks {
                callback(progress);
            }
        }
        if let Some(summary) = self.summary {
            for waiter in self.waiters {
                let _ = waiter.send(summary.clone());
            }
        }
    }
}

struct VolumeInner {
    id: VolumeId,
    descriptor: VolumeDescriptor,
    /// Frame entries as built, used to replace the load status on reset.
    template: Vec<FrameEntry>,
    index: HashMap<FrameId, usize>,
    buffer: Arc<DestinationBuffer>,
    scaling_target: Arc<ScalingTarget>,
    collaborators: VolumeCollaborators,
    config: AssemblerConfig,
    render_step: f64,
    status: Mutex<LoadStatus>,
}

impl VolumeInner {
    fn status(&self) -> MutexGuard<'_, LoadStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn total(&self) -> usize {
        self.template.len()
    }

    fn progress(&self, status: &LoadStatus) -> LoadProgress {
        LoadProgress {
            volume_id: self.id.clone(),
            frame_id: None,
            sequence_index: None,
            frames_loaded: status.frames_loaded,
            frames_processed: status.frames_processed,
            total_frames: self.total(),
            error: None,
            summary: status.summary.clone(),
        }
    }
}

impl CompletionSink for VolumeInner {
    fn frame_processed(
        &self,
        generation: u64,
        sequence_index: usize,
        outcome: Result<FrameMerged, FrameError>,
    ) {
        let mut deliveries = Deliveries::default();
        {
            let mut status = self.status();
            if status.generation != generation
                || status.state != AssemblerState::Loading
                || status.settled.get(sequence_index).is_none_or(|&settled| settled)
            {
                debug!(volume_id = %self.id, sequence_index, "ignoring stale frame outcome");
                return;
            }
            status.settled[sequence_index] = true;
            status.frames_processed += 1;
            let frame_id = status.frames[sequence_index].frame_id.clone();

            let error = match outcome {
                Ok(merged) => {
                    status.cached_frames[sequence_index] = true;
                    status.storage_mappings[sequence_index] = merged.storage_mapping;
                    let entry = &mut status.frames[sequence_index];
                    entry.completed = true;
                    entry.scaling = entry.scaling.or(merged.scaling);
                    status.frames_loaded += 1;
                    self.buffer.mark_modified();
                    deliveries.events.push(VolumeEvent::Modified {
                        volume_id: self.id.clone(),
                        sequence_index,
                    });
                    None
                }
                Err(error) => {
                    status.errors.push(FrameLoadError {
                        frame_id: frame_id.clone(),
                        sequence_index,
                        error: error.clone(),
                    });
                    deliveries.events.push(VolumeEvent::FrameFailed {
                        volume_id: self.id.clone(),
                        frame_id: frame_id.clone(),
                        error: error.clone(),
                    });
                    Some(error)
                }
            };

            let processed = status.frames_processed as f64;
            if self.render_step > 0.0 && processed > status.next_render_target {
                while processed > status.next_render_target {
                    status.next_render_target += self.render_step;
                }
                deliveries.events.push(VolumeEvent::RenderHint {
                    volume_id: self.id.clone(),
                });
            }

            if status.frames_processed == self.total() {
                status.state = AssemblerState::Loaded;
                let elapsed = status
                    .started_at
                    .map(|started| started.elapsed())
                    .unwrap_or_default();
                let summary = LoadSummary {
                    volume_id: self.id.clone(),
                    frames_loaded: status.frames_loaded,
                    frames_processed: status.frames_processed,
                    total_frames: self.total(),
                    errors: status.errors.clone(),
                    elapsed,
                };
                info!(
                    volume_id = %self.id,
                    loaded = summary.frames_loaded,
                    failed = summary.errors.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "volume load finished"
                );
                status.summary = Some(summary.clone());
                status.handles.clear();
                deliveries.events.push(VolumeEvent::RenderHint {
                    volume_id: self.id.clone(),
                });
                deliveries.events.push(VolumeEvent::LoadCompleted {
                    volume_id: self.id.clone(),
                    frame_of_reference: self.descriptor.frame_of_reference.clone(),
                });
                deliveries.callbacks = mem::take(&mut status.callbacks);
                deliveries.waiters = mem::take(&mut status.waiters);
                deliveries.summary = Some(summary);
            } else {
                deliveries.callbacks = status.callbacks.clone();
            }

            let mut progress = self.progress(&status);
            progress.frame_id = Some(frame_id);
            progress.sequence_index = Some(sequence_index);
            progress.error = error;
            deliveries.progress = Some(progress);
        }
        deliveries.deliver(self.collaborators.events.as_ref());
    }
}

/// A volume assembled frame by frame into one contiguous buffer.
pub struct StreamingVolume {
    inner: Arc<VolumeInner>,
}

impl StreamingVolume {
    /// Derive the geometry of `frame_ids` and allocate the volume.
    ///
    /// # Errors
    ///
    /// Construction and allocation errors are returned before any frame is
    /// requested.
    pub fn create<M: MetadataProvider + ?Sized>(
        volume_id: VolumeId,
        frame_ids: &[FrameId],
        provider: &M,
        collaborators: VolumeCollaborators,
        config: AssemblerConfig,
    ) -> Result<Self, VolumeError> {
        let built = VolumeDescriptorBuilder::new(provider)
            .ordering(config.ordering)
            .strict_spacing(config.strict_spacing)
            .build(frame_ids)?;
        Self::from_built(volume_id, built, collaborators, config)
    }

    pub fn from_built(
        volume_id: VolumeId,
        built: BuiltVolume,
        collaborators: VolumeCollaborators,
        config: AssemblerConfig,
    ) -> Result<Self, VolumeError> {
        let options = AllocationOptions {
            prefer_reduced_precision: config.prefer_reduced_precision,
            has_negative_rescale: built.has_negative_rescale,
            sharing: config.sharing,
            shared_memory_available: config.shared_memory_available,
        };
        let allocation = BufferAllocator::allocate(
            &volume_id,
            &built.descriptor,
            &built.raster,
            &options,
            collaborators.cache.as_ref(),
        )?;

        let index = built
            .frames
            .iter()
            .map(|frame| (frame.frame_id.clone(), frame.sequence_index))
            .collect();
        let render_step = if config.render_hint_fraction.is_finite() {
            built.frames.len() as f64 * config.render_hint_fraction
        } else {
            0.0
        };
        let status = LoadStatus::new(0, built.frames.clone(), render_step);

        Ok(Self {
            inner: Arc::new(VolumeInner {
                id: volume_id,
                descriptor: allocation.descriptor,
                template: built.frames,
                index,
                buffer: allocation.buffer,
                scaling_target: Arc::new(ScalingTarget::new(built.scaling_target)),
                collaborators,
                config,
                render_step,
                status: Mutex::new(status),
            }),
        })
    }

    pub fn id(&self) -> &VolumeId {
        &self.inner.id
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.inner.descriptor
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        let [columns, rows, frames] = self.inner.descriptor.dimensions;
        (frames, rows, columns)
    }

    pub fn state(&self) -> AssemblerState {
        self.inner.status().state
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == AssemblerState::Loaded
    }

    pub fn progress(&self) -> LoadProgress {
        let status = self.inner.status();
        self.inner.progress(&status)
    }

    pub fn errors(&self) -> Vec<FrameLoadError> {
        self.inner.status().errors.clone()
    }

    /// Frame entries in sequence order.
    pub fn frames(&self) -> Vec<FrameEntry> {
        self.inner.status().frames.clone()
    }

    /// Completion bitmap indexed by sequence index.
    pub fn cached_frames(&self) -> Vec<bool> {
        self.inner.status().cached_frames.clone()
    }

    pub fn scaling_target(&self) -> Option<ScalingParameters> {
        self.inner.scaling_target.get().copied()
    }

    /// Whether frames were merged since the flag was last taken.
    pub fn take_modified(&self) -> bool {
        self.inner.buffer.take_modified()
    }

    /// Element type frames are stored as.
    pub fn element(&self) -> ElementType {
        self.inner.buffer.element()
    }

    pub fn is_shared(&self) -> bool {
        self.inner.buffer.is_shared()
    }

    /// Start streaming every outstanding frame. Returns once all requests are
    /// submitted.
    ///
    /// While loading, `on_progress` is only registered. Once loaded, it is
    /// invoked immediately with the final progress.
    ///
    /// # Errors
    ///
    /// [`VolumeError::InvalidState`] after cancellation or decache.
    pub fn load(&self, on_progress: Option<ProgressCallback>) -> Result<(), VolumeError> {
        let inner = &self.inner;
        let (requests, generation) = {
            let mut status = inner.status();
            match status.state {
                AssemblerState::Loaded => {
                    let progress = inner.progress(&status);
                    drop(status);
                    if let Some(callback) = on_progress {
                        callback(&progress);
                    }
                    return Ok(());
                }
                AssemblerState::Loading => {
                    status.callbacks.extend(on_progress);
                    return Ok(());
                }
                state @ (AssemblerState::Cancelled | AssemblerState::Decached) => {
                    return Err(VolumeError::InvalidState(state));
                }
                AssemblerState::Idle => {}
            }

            let sink: Arc<dyn CompletionSink> = inner.clone();
            let generator = FrameRequestGenerator::new(
                RequestContext {
                    volume_id: inner.id.clone(),
                    generation: status.generation,
                    cache: Arc::clone(&inner.collaborators.cache),
                    scaling_target: Arc::clone(&inner.scaling_target),
                    cancelled: Arc::clone(&status.cancelled),
                    decode_options: DecodeOptions {
                        target_element: inner.buffer.element(),
                        cache_result: false,
                    },
                    sink,
                },
                Arc::clone(&inner.buffer),
            );
            let requests = generator.generate(&status.frames)?;

            status.state = AssemblerState::Loading;
            status.started_at = Some(Instant::now());
            status.callbacks.extend(on_progress);
            (requests, status.generation)
        };

        info!(
            volume_id = %inner.id,
            frames = requests.len(),
            element = %inner.buffer.element(),
            "streaming volume frames"
        );
        let handles: Vec<TaskHandle> = requests
            .into_iter()
            .map(|request| {
                let meta = request.meta();
                inner.collaborators.scheduler.submit(
                    request.into_task(),
                    inner.config.request_class,
                    meta,
                    inner.config.priority,
                )
            })
            .collect();

        let mut status = inner.status();
        if status.generation == generation && status.state == AssemblerState::Loading {
            status.handles.extend(handles);
        }
        Ok(())
    }

    /// Resolves with the final summary once every frame is processed. The
    /// sender is dropped if the load is cancelled.
    pub fn completion(&self) -> oneshot::Receiver<LoadSummary> {
        let (sender, receiver) = oneshot::channel();
        let mut status = self.inner.status();
        match status.state {
            AssemblerState::Loaded => {
                if let Some(summary) = status.summary.clone() {
                    let _ = sender.send(summary);
                }
            }
            AssemblerState::Idle | AssemblerState::Loading => status.waiters.push(sender),
            AssemblerState::Cancelled | AssemblerState::Decached => {}
        }
        receiver
    }

    /// Stop an in-progress load. Returns false when nothing was loading.
    pub fn cancel_loading(&self) -> bool {
        let inner = &self.inner;
        let (generation, handles) = {
            let mut status = inner.status();
            if status.state != AssemblerState::Loading {
                return false;
            }
            status.cancelled.store(true, Ordering::Release);
            status.state = AssemblerState::Cancelled;
            status.callbacks.clear();
            status.waiters.clear();
            (status.generation, mem::take(&mut status.handles))
        };

        let revoked = inner.buffer.revoke_issued(generation);
        let volume_id = inner.id.clone();
        let dropped = inner
            .collaborators
            .scheduler
            .cancel_all_matching(&|meta: &RequestMeta| meta.volume_id == volume_id);
        for handle in &handles {
            handle.cancel();
        }
        info!(volume_id = %inner.id, revoked, dropped, "volume load cancelled");
        true
    }

    /// Replace the load status with a fresh generation, forgetting every
    /// completed frame. Cancels a running load first.
    ///
    /// # Errors
    ///
    /// [`VolumeError::InvalidState`] once decached.
    pub fn reset(&mut self) -> Result<(), VolumeError> {
        self.cancel_loading();
        let mut status = self.inner.status();
        if status.state == AssemblerState::Decached {
            return Err(VolumeError::InvalidState(status.state));
        }
        let generation = status.generation + 1;
        *status = LoadStatus::new(generation, self.inner.template.clone(), self.inner.render_step);
        debug!(volume_id = %self.inner.id, generation, "load status reset");
        Ok(())
    }

    /// View the frame `frame_id` in place.
    ///
    /// # Errors
    ///
    /// [`VolumeError::UnknownFrame`] for identifiers outside this volume and
    /// [`VolumeError::FrameNotLoaded`] for frames not merged yet.
    pub fn get_frame(&self, frame_id: &FrameId) -> Result<FrameView<'_>, VolumeError> {
        let sequence_index = *self
            .inner
            .index
            .get(frame_id)
            .ok_or_else(|| VolumeError::UnknownFrame(frame_id.clone()))?;
        self.frame_at(sequence_index)
    }

    /// View the frame at `sequence_index` in place.
    pub fn frame_at(&self, sequence_index: usize) -> Result<FrameView<'_>, VolumeError> {
        let inner = &self.inner;
        let (frame_id, mapping, window, completed) = {
            let status = inner.status();
            let entry = status
                .frames
                .get(sequence_index)
                .ok_or(VolumeError::SequenceIndex(sequence_index))?;
            (
                entry.frame_id.clone(),
                status.storage_mappings[sequence_index],
                entry.window,
                status.cached_frames[sequence_index],
            )
        };
        if !completed {
            return Err(VolumeError::FrameNotLoaded(frame_id));
        }
        let data = self
            .slot_data(sequence_index)
            .ok_or_else(|| VolumeError::FrameNotLoaded(frame_id.clone()))?;

        let [columns, rows, _] = inner.descriptor.dimensions;
        Ok(FrameView {
            frame_id,
            sequence_index,
            columns,
            rows,
            components: inner.descriptor.sample_format.components,
            data,
            storage_mapping: mapping,
            scaling: inner.scaling_target.get().copied(),
            window_hint: window,
        })
    }

    fn slot_data(&self, sequence_index: usize) -> Option<FrameData<'_>> {
        let buffer = &self.inner.buffer;
        Some(match buffer.element() {
            ElementType::U8 => FrameData::U8(buffer.read_slot_as(sequence_index)?),
            ElementType::I16 => FrameData::I16(buffer.read_slot_as(sequence_index)?),
            ElementType::U16 => FrameData::U16(buffer.read_slot_as(sequence_index)?),
            ElementType::F32 => FrameData::F32(buffer.read_slot_as(sequence_index)?),
        })
    }

    /// The whole volume as (depth, height, width × components), once loaded.
    ///
    /// # Errors
    ///
    /// [`VolumeError::InvalidState`] before the load finished and
    /// [`VolumeError::ElementMismatch`] when `T` is not the stored type.
    pub fn volume_array<T: Sample>(&self) -> Result<ArrayView3<'_, T>, VolumeError> {
        let state = self.state();
        if state != AssemblerState::Loaded {
            return Err(VolumeError::InvalidState(state));
        }
        let buffer = &self.inner.buffer;
        let values = buffer
            .read_all_as::<T>()
            .ok_or(VolumeError::ElementMismatch {
                requested: T::ELEMENT,
                actual: buffer.element(),
            })?;
        let (depth, height, width) = self.dim();
        let components = self.inner.descriptor.sample_format.components;
        ArrayView3::from_shape((depth, height, width * components), values).map_err(|_| {
            VolumeError::ElementMismatch {
                requested: T::ELEMENT,
                actual: buffer.element(),
            }
        })
    }

    /// Release the volume buffer.
    ///
    /// With `completely_remove` the volume simply leaves the cache. Otherwise
    /// completed frames are handed back to the single-frame cache, in sequence
    /// order, while they fit its remaining capacity.
    pub fn decache(self, completely_remove: bool) -> DecacheReport {
        self.cancel_loading();
        let inner = &self.inner;
        let cache = inner.collaborators.cache.as_ref();
        cache.remove_volume(&inner.id);

        let mut retained_frames = Vec::new();
        if !completely_remove {
            let completed: Vec<usize> = {
                let status = inner.status();
                status
                    .cached_frames
                    .iter()
                    .enumerate()
                    .filter_map(|(index, &cached)| cached.then_some(index))
                    .collect()
            };
            for sequence_index in completed {
                let Ok(view) = self.frame_at(sequence_index) else {
                    continue;
                };
                let frame = view.to_decoded_frame();
                if frame.size_in_bytes() > cache.remaining_capacity() {
                    break;
                }
                if !cache.put_frame(view.frame_id.clone(), Arc::new(frame)) {
                    break;
                }
                retained_frames.push(view.frame_id);
            }
        }

        {
            let mut status = inner.status();
            status.state = AssemblerState::Decached;
            status.callbacks.clear();
            status.waiters.clear();
        }
        if !retained_frames.is_empty() && retained_frames.len() < inner.total() {
            warn!(
                volume_id = %inner.id,
                retained = retained_frames.len(),
                "only part of the volume fit back into the frame cache"
            );
        }
        info!(
            volume_id = %inner.id,
            retained = retained_frames.len(),
            completely_remove,
            "volume decached"
        );
        DecacheReport {
            retained_frames,
            released_bytes: inner.buffer.size_in_bytes(),
        }
    }
}

impl Drop for StreamingVolume {
    fn drop(&mut self) {
        self.cancel_loading();
    }
}
