use dicom_volume_stream::{
    AssemblerConfig, AssemblerState, ChannelEventSink, DecodeOptions, DecodedFrame, ElementType,
    FrameDecoder, FrameError, FrameId, FrameMetadata, FrameSamples, ImagePlane, LoadSummary,
    LruFrameCache, NullEventSink, PriorityScheduler, RasterFormat, ScalingParameters,
    StreamingVolume, VolumeCollaborators, VolumeEvent, VolumeId,
};

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

const COLUMNS: u32 = 4;
const ROWS: u32 = 3;
const PIXELS: usize = (COLUMNS * ROWS) as usize;

/// Serves pre-built frames, failing the ones marked as unreachable.
#[derive(Clone, Default)]
struct SyntheticDecoder {
    frames: HashMap<FrameId, DecodedFrame>,
    failing: HashSet<FrameId>,
    gate: Option<Arc<Semaphore>>,
    calls: Arc<AtomicUsize>,
}

impl FrameDecoder for SyntheticDecoder {
    fn decode(
        &self,
        frame_id: &FrameId,
        _options: &DecodeOptions,
    ) -> BoxFuture<'static, Result<DecodedFrame, FrameError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if self.failing.contains(frame_id) {
            Err(FrameError::Decode(format!("network error fetching {frame_id}")))
        } else {
            self.frames
                .get(frame_id)
                .cloned()
                .ok_or_else(|| FrameError::Decode(format!("no frame {frame_id}")))
        };
        let gate = self.gate.clone();
        async move {
            if let Some(gate) = gate {
                let _permit = gate
                    .acquire_owned()
                    .await
                    .map_err(|e| FrameError::Decode(e.to_string()))?;
            }
            result
        }
        .boxed()
    }
}

struct Series {
    ids: Vec<FrameId>,
    metadata: HashMap<FrameId, FrameMetadata>,
    decoder: SyntheticDecoder,
}

fn raster(signed: bool) -> RasterFormat {
    RasterFormat {
        columns: COLUMNS,
        rows: ROWS,
        bits_allocated: 16,
        signed,
        samples_per_pixel: 1,
        floating_point: false,
    }
}

/// Axial frames at `distances` along z; frame `i` holds the constant `i * 10`.
fn series(
    distances: &[f64],
    raster: RasterFormat,
    scaling: Option<ScalingParameters>,
) -> Series {
    let mut metadata = HashMap::new();
    let mut decoder = SyntheticDecoder::default();
    let ids = distances
        .iter()
        .enumerate()
        .map(|(i, &z)| {
            let id = FrameId::new(format!("1.2.3.{i}"));
            metadata.insert(
                id.clone(),
                FrameMetadata {
                    plane: ImagePlane {
                        position: [0.0, 0.0, z],
                        row_cosines: [1.0, 0.0, 0.0],
                        column_cosines: [0.0, 1.0, 0.0],
                        pixel_spacing: Some([0.5, 0.5]),
                        slice_thickness: None,
                        frame_of_reference: Some("1.2.3".into()),
                    },
                    raster,
                    scaling,
                    window: None,
                },
            );
            let value = (i * 10) as u16;
            let samples = if raster.signed {
                FrameSamples::I16(vec![value as i16; PIXELS])
            } else {
                FrameSamples::U16(vec![value; PIXELS])
            };
            decoder.frames.insert(
                id.clone(),
                DecodedFrame {
                    samples,
                    scaling,
                    columns: COLUMNS,
                    rows: ROWS,
                    components: 1,
                },
            );
            id
        })
        .collect();
    Series {
        ids,
        metadata,
        decoder,
    }
}

fn assemble(
    series: &Series,
    cache_bytes: usize,
    config: AssemblerConfig,
) -> (StreamingVolume, Arc<LruFrameCache<SyntheticDecoder>>) {
    let cache = Arc::new(LruFrameCache::new(series.decoder.clone(), cache_bytes));
    let volume = StreamingVolume::create(
        VolumeId::new("series"),
        &series.ids,
        &series.metadata,
        VolumeCollaborators {
            cache: cache.clone(),
            scheduler: Arc::new(PriorityScheduler::new(2).unwrap()),
            events: Arc::new(NullEventSink),
        },
        config,
    )
    .unwrap();
    (volume, cache)
}

async fn load_to_completion(volume: &StreamingVolume) -> LoadSummary {
    let completion = volume.completion();
    volume.load(None).unwrap();
    tokio::time::timeout(Duration::from_secs(5), completion)
        .await
        .expect("load should finish")
        .expect("completion should not be cancelled")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uniform_series_loads_into_float_volume() {
    let series = series(&[0.0, 2.0, 4.0, 6.0], raster(false), None);
    let (volume, _) = assemble(&series, 1 << 20, AssemblerConfig::default());

    let descriptor = volume.descriptor();
    assert_eq!(descriptor.spacing[2], 2.0);
    assert_eq!(volume.element(), ElementType::F32);
    assert_eq!(descriptor.bytes_per_frame(), PIXELS * 4);

    let summary = load_to_completion(&volume).await;
    assert_eq!(summary.frames_loaded, 4);
    assert_eq!(summary.frames_processed, 4);
    assert!(summary.is_success());
    assert!(volume.is_loaded());

    let array = volume.volume_array::<f32>().unwrap();
    assert_eq!(array.dim(), (4, 3, 4));
    for (i, id) in series.ids.iter().enumerate() {
        let frame = volume.get_frame(id).unwrap();
        assert_eq!(frame.sequence_index, i);
        assert_eq!(array[[i, 2, 3]], (i * 10) as f32);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_frame_does_not_stop_the_volume() {
    let mut series = series(&[0.0, 2.0, 4.0, 6.0], raster(false), None);
    let broken = series.ids[2].clone();
    series.decoder.failing.insert(broken.clone());

    let (sink, mut events) = ChannelEventSink::channel();
    let volume = StreamingVolume::create(
        VolumeId::new("series"),
        &series.ids,
        &series.metadata,
        VolumeCollaborators {
            cache: Arc::new(LruFrameCache::new(series.decoder.clone(), 1 << 20)),
            scheduler: Arc::new(PriorityScheduler::new(2).unwrap()),
            events: Arc::new(sink),
        },
        AssemblerConfig::default(),
    )
    .unwrap();

    let summary = load_to_completion(&volume).await;
    assert_eq!(summary.frames_processed, 4);
    assert_eq!(summary.frames_loaded, 3);
    assert!(volume.is_loaded());
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].frame_id, broken);

    for (i, id) in series.ids.iter().enumerate().filter(|(_, id)| **id != broken) {
        assert_eq!(volume.get_frame(id).unwrap().value(0, 0), Some((i * 10) as f64));
    }
    assert!(volume.get_frame(&broken).is_err());

    let failures: Vec<FrameId> = std::iter::from_fn(|| events.try_next().ok().flatten())
        .filter_map(|event| match event {
            VolumeEvent::FrameFailed { frame_id, .. } => Some(frame_id),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![broken]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_load_does_not_duplicate_work() {
    let series = series(&[0.0, 1.0, 2.0], raster(false), None);
    let (volume, _) = assemble(&series, 1 << 20, AssemblerConfig::default());

    volume.load(None).unwrap();
    volume.load(None).unwrap();
    let summary = load_to_completion(&volume).await;
    volume.load(None).unwrap();

    assert_eq!(summary.frames_loaded, 3);
    assert_eq!(volume.progress().frames_loaded, 3);
    assert_eq!(series.decoder.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_volume_ignores_late_frames() {
    let mut series = series(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], raster(false), None);
    let gate = Arc::new(Semaphore::new(0));
    series.decoder.gate = Some(gate.clone());
    let (volume, _) = assemble(&series, 1 << 20, AssemblerConfig::default());

    volume.load(None).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(volume.cancel_loading());
    gate.add_permits(16);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(volume.state(), AssemblerState::Cancelled);
    assert_eq!(volume.progress().frames_processed, 0);
    assert!(volume.cached_frames().iter().all(|cached| !cached));
    assert!(!volume.take_modified());
    // Only the requests already in flight reached the decoder.
    assert!(series.decoder.calls.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_after_cancel_loads_again() {
    let mut series = series(&[0.0, 1.0, 2.0], raster(false), None);
    let gate = Arc::new(Semaphore::new(0));
    series.decoder.gate = Some(gate.clone());
    let (mut volume, _) = assemble(&series, 1 << 20, AssemblerConfig::default());

    volume.load(None).unwrap();
    volume.cancel_loading();
    volume.reset().unwrap();
    gate.add_permits(64);

    let summary = load_to_completion(&volume).await;
    assert_eq!(summary.frames_loaded, 3);
    assert_eq!(volume.get_frame(&series.ids[2]).unwrap().value(1, 1), Some(20.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reduced_precision_keeps_signed_sources_signed() {
    let series = series(&[0.0, 1.0], raster(true), Some(ScalingParameters::rescale(1.0, 0.0)));
    let config = AssemblerConfig {
        prefer_reduced_precision: true,
        ..AssemblerConfig::default()
    };
    let (volume, _) = assemble(&series, 1 << 20, config);
    assert_eq!(volume.element(), ElementType::I16);

    load_to_completion(&volume).await;
    let array = volume.volume_array::<i16>().unwrap();
    assert_eq!(array[[1, 0, 0]], 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsigned_values_beyond_signed_storage_survive_reduced_precision() {
    let mut series = series(&[0.0, 1.0], raster(false), Some(ScalingParameters::rescale(1.0, -1024.0)));
    let bright = series.ids[1].clone();
    if let Some(frame) = series.decoder.frames.get_mut(&bright) {
        frame.samples = FrameSamples::U16(vec![40000; PIXELS]);
    }
    let config = AssemblerConfig {
        prefer_reduced_precision: true,
        ..AssemblerConfig::default()
    };
    let (volume, _) = assemble(&series, 1 << 20, config);
    assert_eq!(volume.element(), ElementType::I16);

    load_to_completion(&volume).await;
    let frame = volume.get_frame(&bright).unwrap();
    assert!(frame.storage_mapping.is_some());
    assert_eq!(frame.value(3, 2), Some(40000.0));
    assert_eq!(volume.get_frame(&series.ids[0]).unwrap().value(0, 0), Some(0.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mixed_rescale_is_normalized_to_the_first_frame() {
    let mut series = series(&[0.0, 1.0], raster(false), Some(ScalingParameters::rescale(1.0, 0.0)));
    // Frame 1 stores 10 with slope 2, i.e. 20 in the volume's scale.
    let second = series.ids[1].clone();
    let mut metadata = series.metadata[&second].clone();
    metadata.scaling = Some(ScalingParameters::rescale(2.0, 0.0));
    series.metadata.insert(second.clone(), metadata);
    if let Some(frame) = series.decoder.frames.get_mut(&second) {
        frame.scaling = Some(ScalingParameters::rescale(2.0, 0.0));
    }

    let (volume, _) = assemble(&series, 1 << 20, AssemblerConfig::default());
    load_to_completion(&volume).await;
    assert_eq!(volume.scaling_target(), Some(ScalingParameters::rescale(1.0, 0.0)));
    assert_eq!(volume.get_frame(&second).unwrap().value(2, 2), Some(20.0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn volume_larger_than_the_cache_is_rejected() {
    let series = series(&[0.0, 1.0, 2.0], raster(false), None);
    let cache = Arc::new(LruFrameCache::new(series.decoder.clone(), PIXELS * 4));
    let result = StreamingVolume::create(
        VolumeId::new("series"),
        &series.ids,
        &series.metadata,
        VolumeCollaborators {
            cache,
            scheduler: Arc::new(PriorityScheduler::new(2).unwrap()),
            events: Arc::new(NullEventSink),
        },
        AssemblerConfig::default(),
    );
    assert!(result.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decache_hands_frames_back_to_the_cache() {
    let series = series(&[0.0, 1.0, 2.0], raster(false), None);
    let (volume, cache) = assemble(&series, 1 << 20, AssemblerConfig::default());
    load_to_completion(&volume).await;

    let report = volume.decache(false);
    assert_eq!(report.retained_frames, series.ids);
    assert_eq!(report.released_bytes, 3 * PIXELS * 4);
    let frame = cache.cached_frame(&series.ids[1]).unwrap();
    assert_eq!(frame.samples, FrameSamples::F32(vec![10.0; PIXELS]));
}
