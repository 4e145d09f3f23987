//! Unsolicited event ingestion.
//!
//! The read path hands pushed user-data PDUs to [`EventPipeline::ingest`]
//! without awaiting. A classifier task turns them into [`S7Event`]s and a
//! dispatcher task fans them out to per-subscriber lanes, so a slow or
//! panicking callback only ever stalls its own lane.
//!
//! The dispatcher enqueues to lanes in registration order, and each lane sees
//! events in classification order. Lanes run as separate tasks, so callbacks
//! of different subscribers for the same event may run in any order or at the
//! same time. A full lane drops the event for that subscriber only; the drop
//! is counted and surfaces through [`EventPipeline::lane_overflow`].
mod classify;

pub use classify::{
    classify, is_push, AlarmIndication, AlarmObject, CpuMode, CyclicData, CyclicItem,
    DiagnosticEntry, EventDetails, RawEvent, S7Event, USER_EVENT_IDS,
};

use super::frame::{S7Pdu, S7Tag};
use crate::types::EventCategory;
use plcwire_sdk::{DriverError, DriverResult};
use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// Subscriber callback. Runs on the subscriber's own lane task.
pub type EventCallback = Arc<dyn Fn(&S7Event) + Send + Sync + 'static>;

/// Returned by [`EventPipeline::register`]; pass back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    id: u64,
    category: EventCategory,
}

impl EventHandle {
    #[inline]
    pub fn category(&self) -> EventCategory {
        self.category
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineCapacity {
    pub raw: usize,
    pub dispatch: usize,
    pub lane: usize,
}

struct Subscriber {
    id: u64,
    category: EventCategory,
    lane: mpsc::Sender<S7Event>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    /// Registration order is dispatch order
    subscribers: Vec<Subscriber>,
    /// Most recent cyclic sample that arrived with nobody listening
    held_cyclic: Option<S7Event>,
}

type CyclicJobs = Arc<Mutex<HashMap<u8, Vec<S7Tag>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded classifier/dispatcher pair plus the subscriber registry.
pub struct EventPipeline {
    raw_tx: mpsc::Sender<RawEvent>,
    capacity: PipelineCapacity,
    registry: Arc<Mutex<Registry>>,
    cyclic_jobs: CyclicJobs,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("capacity", &self.capacity)
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

impl EventPipeline {
    /// Spawn the classifier and dispatcher tasks.
    pub fn start(capacity: PipelineCapacity) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel(capacity.raw.max(1));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity.dispatch.max(1));
        let registry = Arc::new(Mutex::new(Registry::default()));
        let cyclic_jobs: CyclicJobs = Arc::default();
        let dropped = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        tokio::spawn(run_classifier(
            raw_rx,
            dispatch_tx,
            Arc::clone(&cyclic_jobs),
            cancel.child_token(),
        ));
        tokio::spawn(run_dispatcher(
            dispatch_rx,
            Arc::clone(&registry),
            Arc::clone(&dropped),
            cancel.child_token(),
        ));

        Self {
            raw_tx,
            capacity,
            registry,
            cyclic_jobs,
            dropped,
            cancel,
        }
    }

    /// Queue a pushed PDU without waiting.
    ///
    /// A full raw queue means the consumer side cannot keep up; that is
    /// reported as [`DriverError::EventQueueOverflow`] and the caller is
    /// expected to treat it as fatal for the connection.
    pub fn ingest(&self, pdu: S7Pdu) -> DriverResult<()> {
        match self.raw_tx.try_send(RawEvent::now(pdu)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DriverError::EventQueueOverflow {
                capacity: self.capacity.raw,
            }),
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("event pipeline stopped, push discarded");
                Ok(())
            }
        }
    }

    /// Register a callback for one category. Multiple callbacks per category are allowed.
    ///
    /// The first cyclic registration receives the held sample, if any.
    pub fn register<F>(&self, category: EventCategory, callback: F) -> EventHandle
    where
        F: Fn(&S7Event) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        let (lane_tx, lane_rx) = mpsc::channel(self.capacity.lane.max(1));

        let mut reg = lock(&self.registry);
        reg.next_id += 1;
        let handle = EventHandle {
            id: reg.next_id,
            category,
        };
        if category == EventCategory::Cyclic {
            if let Some(held) = reg.held_cyclic.take() {
                tracing::debug!("replaying held cyclic sample to new subscriber");
                // Fresh lane, capacity >= 1
                let _ = lane_tx.try_send(held);
            }
        }
        reg.subscribers.push(Subscriber {
            id: handle.id,
            category,
            lane: lane_tx,
        });
        drop(reg);

        tokio::spawn(run_lane(
            handle,
            lane_rx,
            callback,
            self.cancel.child_token(),
        ));
        tracing::debug!(
            category = category.short_name(),
            id = handle.id,
            "event callback registered"
        );
        handle
    }

    /// Remove a registration. Events already queued on its lane are still delivered.
    pub fn unregister(&self, handle: EventHandle) -> bool {
        let mut reg = lock(&self.registry);
        let before = reg.subscribers.len();
        reg.subscribers.retain(|s| s.id != handle.id);
        before != reg.subscribers.len()
    }

    pub fn subscriber_count(&self, category: EventCategory) -> usize {
        lock(&self.registry)
            .subscribers
            .iter()
            .filter(|s| s.category == category)
            .count()
    }

    /// Remember which tags a cyclic job delivers so samples decode to values.
    pub fn bind_cyclic_job(&self, job_id: u8, tags: Vec<S7Tag>) {
        lock(&self.cyclic_jobs).insert(job_id, tags);
    }

    pub fn unbind_cyclic_job(&self, job_id: u8) {
        lock(&self.cyclic_jobs).remove(&job_id);
    }

    /// Events dropped because a subscriber lane was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// `EventQueueOverflow` with the lane capacity once any lane has dropped an event.
    pub fn lane_overflow(&self) -> Option<DriverError> {
        (self.dropped_events() > 0).then_some(DriverError::EventQueueOverflow {
            capacity: self.capacity.lane.max(1),
        })
    }

    /// Stop every pipeline task. Pending events are discarded.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("event pipeline stopping");
        }
        self.cancel.cancel();
        let mut reg = lock(&self.registry);
        reg.subscribers.clear();
        reg.held_cyclic = None;
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for EventPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_classifier(
    mut raw_rx: mpsc::Receiver<RawEvent>,
    dispatch_tx: mpsc::Sender<S7Event>,
    cyclic_jobs: CyclicJobs,
    cancel: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };
        let event = {
            let jobs = lock(&cyclic_jobs);
            classify(&raw, &jobs)
        };
        let Some(event) = event else {
            tracing::debug!(param = ?raw.pdu.param, "unclassified push dropped");
            continue;
        };
        tracing::trace!(category = event.category.short_name(), "event classified");
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = dispatch_tx.send(event) => if sent.is_err() { break },
        }
    }
}

async fn run_dispatcher(
    mut dispatch_rx: mpsc::Receiver<S7Event>,
    registry: Arc<Mutex<Registry>>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = dispatch_rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        let mut reg = lock(&registry);
        let category = event.category;
        let mut delivered = 0usize;
        for sub in reg.subscribers.iter().filter(|s| s.category == category) {
            delivered += 1;
            match sub.lane.try_send(event.clone()) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        category = category.short_name(),
                        id = sub.id,
                        "subscriber lane full, event dropped"
                    );
                }
            }
        }
        if delivered == 0 && category == EventCategory::Cyclic {
            reg.held_cyclic = Some(event);
        }
    }
}

async fn run_lane(
    handle: EventHandle,
    mut lane_rx: mpsc::Receiver<S7Event>,
    callback: EventCallback,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = lane_rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
            tracing::warn!(
                category = handle.category.short_name(),
                id = handle.id,
                "event callback panicked"
            );
        }
    }
}
