//! Interface to the prioritized request scheduler, and a tokio implementation
//! with bounded concurrency.

use crate::enums::RequestClass;
use crate::error::SchedulerError;
use crate::metadata::{FrameId, VolumeId};

use futures::future::BoxFuture;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::debug;

pub type Task = BoxFuture<'static, ()>;

/// Identity of a submitted frame request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub volume_id: VolumeId,
    pub frame_id: FrameId,
    pub sequence_index: usize,
}

/// Cancels a submitted task if it has not started yet.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

pub trait Scheduler: Send + Sync {
    fn submit(
        &self,
        task: Task,
        class: RequestClass,
        meta: RequestMeta,
        priority: i32,
    ) -> TaskHandle;

    /// Drop every queued, not yet started task whose metadata matches.
    /// Returns how many were dropped.
    fn cancel_all_matching(&self, predicate: &dyn Fn(&RequestMeta) -> bool) -> usize;
}

struct Queued {
    class: RequestClass,
    priority: i32,
    sequence: u64,
    meta: RequestMeta,
    handle: TaskHandle,
    task: Task,
}

impl Queued {
    fn key(&self) -> (RequestClass, i32, std::cmp::Reverse<u64>) {
        (self.class, self.priority, std::cmp::Reverse(self.sequence))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap pops the greatest: lowest class, lowest priority value,
    // most recent submission.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<Queued>>,
    in_flight: AtomicUsize,
    max_in_flight: usize,
    submitted: AtomicU64,
    runtime: Handle,
}

impl SchedulerInner {
    fn queue(&self) -> MutexGuard<'_, BinaryHeap<Queued>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs tasks on a tokio runtime, at most `max_in_flight` at a time, in
/// request-class then priority order. Equal requests run most recently
/// submitted first.
#[derive(Clone)]
pub struct PriorityScheduler {
    inner: Arc<SchedulerInner>,
}

impl PriorityScheduler {
    /// Create a scheduler on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NoRuntime`] outside a tokio runtime.
    pub fn new(max_in_flight: usize) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|e| SchedulerError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(runtime, max_in_flight))
    }

    pub fn with_handle(runtime: Handle, max_in_flight: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Mutex::new(BinaryHeap::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: max_in_flight.max(1),
                submitted: AtomicU64::new(0),
                runtime,
            }),
        }
    }

    pub fn queued(&self) -> usize {
        self.inner.queue().len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    fn pump(inner: &Arc<SchedulerInner>) {
        loop {
            let next = {
                let mut queue = inner.queue();
                let reserved = inner
                    .in_flight
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < inner.max_in_flight).then_some(n + 1)
                    })
                    .is_ok();
                if !reserved {
                    return;
                }
                match queue.pop() {
                    Some(next) => next,
                    None => {
                        inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                        return;
                    }
                }
            };

            if next.handle.is_cancelled() {
                inner.in_flight.fetch_sub(1, Ordering::AcqRel);
                continue;
            }

            let worker = Arc::clone(inner);
            inner.runtime.spawn(async move {
                next.task.await;
                worker.in_flight.fetch_sub(1, Ordering::AcqRel);
                Self::pump(&worker);
            });
        }
    }
}

impl Scheduler for PriorityScheduler {
    fn submit(
        &self,
        task: Task,
        class: RequestClass,
        meta: RequestMeta,
        priority: i32,
    ) -> TaskHandle {
        let handle = TaskHandle::new();
        let sequence = self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.queue().push(Queued {
            class,
            priority,
            sequence,
            meta,
            handle: handle.clone(),
            task,
        });
        Self::pump(&self.inner);
        handle
    }

    fn cancel_all_matching(&self, predicate: &dyn Fn(&RequestMeta) -> bool) -> usize {
        let mut queue = self.inner.queue();
        let before = queue.len();
        queue.retain(|queued| !predicate(&queued.meta));
        let dropped = before - queue.len();
        debug!(dropped, "dropped queued requests");
        dropped
    }
}
