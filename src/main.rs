use std::{env, error::Error, path::PathBuf, sync::Arc};

use dicom_volume_stream::{
    AssemblerConfig, ChannelEventSink, DicomFrameSource, LoadProgress, LruFrameCache,
    PriorityScheduler, ProgressCallback, StreamingVolume, VolumeCollaborators, VolumeEvent,
    VolumeId,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const CACHE_BYTES: usize = 2 << 30;
const MAX_IN_FLIGHT: usize = 8;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let directory = env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("dicom"), PathBuf::from);
    let source = Arc::new(DicomFrameSource::load_from_directory(&directory)?);
    let frame_ids = source.frame_ids().to_vec();

    let (events, mut receiver) = ChannelEventSink::channel();
    let volume = StreamingVolume::create(
        VolumeId::new(directory.display().to_string()),
        &frame_ids,
        &source,
        VolumeCollaborators {
            cache: Arc::new(LruFrameCache::new(Arc::clone(&source), CACHE_BYTES)),
            scheduler: Arc::new(PriorityScheduler::new(MAX_IN_FLIGHT)?),
            events: Arc::new(events),
        },
        AssemblerConfig::default(),
    )?;

    let on_progress: ProgressCallback = Arc::new(|progress: &LoadProgress| match &progress.error {
        Some(error) => warn!(frame_id = ?progress.frame_id, %error, "frame failed"),
        None => debug!(
            processed = progress.frames_processed,
            total = progress.total_frames,
            "frame merged"
        ),
    });
    let completion = volume.completion();
    volume.load(Some(on_progress))?;
    let summary = completion.await?;

    let render_hints = std::iter::from_fn(|| receiver.try_next().ok().flatten())
        .filter(|event| matches!(event, VolumeEvent::RenderHint { .. }))
        .count();
    info!(
        loaded = summary.frames_loaded,
        failed = summary.errors.len(),
        render_hints,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "volume ready"
    );

    let (depth, _, _) = volume.dim();
    let image = volume
        .frame_at(depth / 2)?
        .to_image(None)
        .ok_or("middle frame cannot be rendered as grayscale")?;
    image.save("result.png")?;
    Ok(())
}
