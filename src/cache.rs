//! Interface to the single-frame decode/cache collaborator, and a byte-capped
//! LRU implementation of it.

use crate::enums::ElementType;
use crate::error::FrameError;
use crate::metadata::{FrameId, VolumeId};
use crate::samples::DecodedFrame;

use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Element type the frame will be stored as.
    pub target_element: ElementType,
    /// Insert the decoded frame into the single-frame cache.
    pub cache_result: bool,
}

/// Turns a frame identifier into decoded samples.
pub trait FrameDecoder: Send + Sync + 'static {
    fn decode(
        &self,
        frame_id: &FrameId,
        options: &DecodeOptions,
    ) -> BoxFuture<'static, Result<DecodedFrame, FrameError>>;
}

impl<D: FrameDecoder + ?Sized> FrameDecoder for Arc<D> {
    fn decode(
        &self,
        frame_id: &FrameId,
        options: &DecodeOptions,
    ) -> BoxFuture<'static, Result<DecodedFrame, FrameError>> {
        (**self).decode(frame_id, options)
    }
}

/// Shared cache consulted for decoding, admission and eviction.
pub trait FrameCache: Send + Sync {
    /// Decoded frame, served from the cache when present.
    fn decode_frame(
        &self,
        frame_id: &FrameId,
        options: DecodeOptions,
    ) -> BoxFuture<'static, Result<Arc<DecodedFrame>, FrameError>>;

    fn is_cached(&self, frame_id: &FrameId) -> bool;

    /// Whether `size_in_bytes` could fit after evicting everything evictable.
    fn admit(&self, size_in_bytes: usize) -> bool;

    /// Evict least recently used frames until `size_in_bytes` fits. Returns the
    /// number of bytes freed.
    fn evict_until_fits(&self, size_in_bytes: usize) -> usize;

    /// Account for a volume buffer; volumes are never evicted by the cache.
    fn reserve_volume(&self, volume_id: &VolumeId, size_in_bytes: usize);

    fn remove_volume(&self, volume_id: &VolumeId);

    fn remaining_capacity(&self) -> usize;

    /// Insert an already decoded frame. Returns false when it does not fit.
    fn put_frame(&self, frame_id: FrameId, frame: Arc<DecodedFrame>) -> bool;
}

struct CachedFrame {
    frame: Arc<DecodedFrame>,
    /// Key of this frame in the recency index.
    stamp: u64,
}

#[derive(Default)]
struct CacheState {
    frames: HashMap<FrameId, CachedFrame>,
    /// Recency index, least recently used first.
    lru: BTreeMap<u64, FrameId>,
    clock: u64,
    volumes: HashMap<VolumeId, usize>,
    frame_bytes: usize,
    volume_bytes: usize,
}

impl CacheState {
    fn used(&self) -> usize {
        self.frame_bytes.saturating_add(self.volume_bytes)
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn frame(&self, frame_id: &FrameId) -> Option<Arc<DecodedFrame>> {
        self.frames.get(frame_id).map(|cached| Arc::clone(&cached.frame))
    }

    fn touch(&mut self, frame_id: &FrameId) {
        let stamp = self.next_stamp();
        if let Some(cached) = self.frames.get_mut(frame_id) {
            self.lru.remove(&cached.stamp);
            cached.stamp = stamp;
            self.lru.insert(stamp, frame_id.clone());
        }
    }

    fn evict_until(&mut self, max_bytes: usize, incoming: usize) -> usize {
        let mut freed = 0;
        while self.used().saturating_add(incoming) > max_bytes {
            let Some((_, oldest)) = self.lru.pop_first() else {
                break;
            };
            if let Some(evicted) = self.frames.remove(&oldest) {
                let bytes = evicted.frame.size_in_bytes();
                self.frame_bytes = self.frame_bytes.saturating_sub(bytes);
                freed += bytes;
                debug!(frame_id = %oldest, bytes, "evicted cached frame");
            }
        }
        freed
    }

    fn insert(&mut self, max_bytes: usize, frame_id: FrameId, frame: Arc<DecodedFrame>) -> bool {
        let bytes = frame.size_in_bytes();
        if let Some(old) = self.frames.remove(&frame_id) {
            self.frame_bytes = self.frame_bytes.saturating_sub(old.frame.size_in_bytes());
            self.lru.remove(&old.stamp);
        }
        if self.volume_bytes.saturating_add(bytes) > max_bytes {
            return false;
        }
        self.evict_until(max_bytes, bytes);
        self.frame_bytes += bytes;
        let stamp = self.next_stamp();
        self.lru.insert(stamp, frame_id.clone());
        self.frames.insert(frame_id, CachedFrame { frame, stamp });
        true
    }
}

/// Byte-capped LRU cache of decoded frames in front of a [`FrameDecoder`].
pub struct LruFrameCache<D> {
    decoder: Arc<D>,
    max_bytes: usize,
    state: Arc<Mutex<CacheState>>,
}

impl<D: FrameDecoder> LruFrameCache<D> {
    pub fn new(decoder: D, max_bytes: usize) -> Self {
        Self {
            decoder: Arc::new(decoder),
            max_bytes,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn cached_frame_count(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn cached_frame(&self, frame_id: &FrameId) -> Option<Arc<DecodedFrame>> {
        self.lock().frame(frame_id)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: FrameDecoder> FrameCache for LruFrameCache<D> {
    fn decode_frame(
        &self,
        frame_id: &FrameId,
        options: DecodeOptions,
    ) -> BoxFuture<'static, Result<Arc<DecodedFrame>, FrameError>> {
        {
            let mut state = self.lock();
            if let Some(frame) = state.frame(frame_id) {
                state.touch(frame_id);
                debug!(%frame_id, "frame served from cache");
                return futures::future::ready(Ok(frame)).boxed();
            }
        }

        let pending = self.decoder.decode(frame_id, &options);
        let state = Arc::clone(&self.state);
        let max_bytes = self.max_bytes;
        let frame_id = frame_id.clone();
        async move {
            let frame = Arc::new(pending.await?);
            if options.cache_result {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.insert(max_bytes, frame_id, Arc::clone(&frame));
            }
            Ok::<_, FrameError>(frame)
        }
        .boxed()
    }

    fn is_cached(&self, frame_id: &FrameId) -> bool {
        self.lock().frames.contains_key(frame_id)
    }

    fn admit(&self, size_in_bytes: usize) -> bool {
        self.lock()
            .volume_bytes
            .checked_add(size_in_bytes)
            .is_some_and(|total| total <= self.max_bytes)
    }

    fn evict_until_fits(&self, size_in_bytes: usize) -> usize {
        self.lock().evict_until(self.max_bytes, size_in_bytes)
    }

    fn reserve_volume(&self, volume_id: &VolumeId, size_in_bytes: usize) {
        let mut state = self.lock();
        if let Some(previous) = state.volumes.insert(volume_id.clone(), size_in_bytes) {
            state.volume_bytes = state.volume_bytes.saturating_sub(previous);
        }
        state.volume_bytes += size_in_bytes;
    }

    fn remove_volume(&self, volume_id: &VolumeId) {
        let mut state = self.lock();
        if let Some(size) = state.volumes.remove(volume_id) {
            state.volume_bytes = state.volume_bytes.saturating_sub(size);
        }
    }

    fn remaining_capacity(&self) -> usize {
        self.max_bytes.saturating_sub(self.lock().used())
    }

    fn put_frame(&self, frame_id: FrameId, frame: Arc<DecodedFrame>) -> bool {
        self.lock().insert(self.max_bytes, frame_id, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samples::FrameSamples;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDecoder {
        calls: Arc<AtomicUsize>,
    }

    impl FrameDecoder for CountingDecoder {
        fn decode(
            &self,
            _frame_id: &FrameId,
            _options: &DecodeOptions,
        ) -> BoxFuture<'static, Result<DecodedFrame, FrameError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(frame(8))).boxed()
        }
    }

    fn frame(len: usize) -> DecodedFrame {
        DecodedFrame {
            samples: FrameSamples::U8(vec![0; len]),
            scaling: None,
            columns: len as u32,
            rows: 1,
            components: 1,
        }
    }

    fn options(cache_result: bool) -> DecodeOptions {
        DecodeOptions {
            target_element: ElementType::U8,
            cache_result,
        }
    }

    #[tokio::test]
    async fn cached_frames_are_not_decoded_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = LruFrameCache::new(CountingDecoder { calls: calls.clone() }, 1024);
        let id = FrameId::new("a");

        cache.decode_frame(&id, options(true)).await.unwrap();
        assert!(cache.is_cached(&id));
        cache.decode_frame(&id, options(true)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn uncached_decodes_leave_the_cache_untouched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = LruFrameCache::new(CountingDecoder { calls }, 1024);
        let id = FrameId::new("a");
        cache.decode_frame(&id, options(false)).await.unwrap();
        assert!(!cache.is_cached(&id));
        assert_eq!(cache.remaining_capacity(), 1024);
    }

    #[test]
    fn least_recently_used_frames_are_evicted_first() {
        let cache = LruFrameCache::new(CountingDecoder { calls: Arc::default() }, 24);
        for id in ["a", "b", "c"] {
            assert!(cache.put_frame(FrameId::new(id), Arc::new(frame(8))));
        }
        cache.lock().touch(&FrameId::new("a"));
        assert!(cache.put_frame(FrameId::new("d"), Arc::new(frame(8))));
        assert!(cache.is_cached(&FrameId::new("a")));
        assert!(!cache.is_cached(&FrameId::new("b")));
    }

    #[tokio::test]
    async fn cache_hits_refresh_recency() {
        let cache = LruFrameCache::new(CountingDecoder { calls: Arc::default() }, 24);
        for id in ["a", "b", "c"] {
            cache.decode_frame(&FrameId::new(id), options(true)).await.unwrap();
        }
        cache.decode_frame(&FrameId::new("a"), options(true)).await.unwrap();
        cache.decode_frame(&FrameId::new("b"), options(true)).await.unwrap();
        // Replacing an entry leaves a single recency record for it.
        assert!(cache.put_frame(FrameId::new("b"), Arc::new(frame(8))));
        assert_eq!(cache.lock().lru.len(), 3);

        assert!(cache.put_frame(FrameId::new("d"), Arc::new(frame(8))));
        assert!(!cache.is_cached(&FrameId::new("c")));
        assert!(cache.put_frame(FrameId::new("e"), Arc::new(frame(8))));
        assert!(!cache.is_cached(&FrameId::new("a")));
        assert!(cache.is_cached(&FrameId::new("b")));
        assert_eq!(cache.cached_frame_count(), 3);
    }

    #[test]
    fn volumes_constrain_admission_but_are_not_evicted() {
        let cache = LruFrameCache::new(CountingDecoder { calls: Arc::default() }, 100);
        cache.put_frame(FrameId::new("a"), Arc::new(frame(40)));
        assert!(cache.admit(100));
        assert_eq!(cache.evict_until_fits(80), 40);
        cache.reserve_volume(&VolumeId::new("v"), 80);
        assert!(!cache.admit(30));
        assert_eq!(cache.remaining_capacity(), 20);
        assert!(!cache.put_frame(FrameId::new("b"), Arc::new(frame(30))));

        cache.remove_volume(&VolumeId::new("v"));
        assert_eq!(cache.remaining_capacity(), 100);
        assert!(!cache.admit(usize::MAX));
    }
}
