//! Background region loading.
//!
//! Workers pull jobs from a bounded crossbeam queue and answer through a
//! one-slot reply channel held by the submitter's `LoadTicket`. Nothing a
//! worker does touches simulation state; results are only observed when the
//! simulation thread polls the ticket.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};

use crate::config::{FullQueuePolicy, LoaderConfig};
use crate::error::{StoreError, StreamError};
use crate::region::Region;
use crate::spatial::RegionCoord;
use crate::store::{LoadKind, RegionStore, provide_region};

type Reply = Result<Region, StreamError>;

struct Job {
    coord: RegionCoord,
    kind: LoadKind,
    cancelled: Arc<AtomicBool>,
    reply: Sender<Reply>,
}

/// Outcome of polling a `LoadTicket`.
#[derive(Debug)]
pub enum LoadPoll {
    Pending,
    Ready(Region),
    Failed(StreamError),
}

/// Handle to one submitted load. Dropping it without `cancel` leaves the
/// job running; its result is then discarded by the closed reply channel.
#[derive(Debug)]
pub struct LoadTicket {
    coord: RegionCoord,
    kind: LoadKind,
    cancelled: Arc<AtomicBool>,
    reply: Receiver<Reply>,
    finished: bool,
}

impl LoadTicket {
    pub fn coord(&self) -> RegionCoord {
        self.coord
    }

    pub fn kind(&self) -> LoadKind {
        self.kind
    }

    /// Non-blocking check for the job's result. A result is handed out once.
    pub fn poll(&mut self) -> LoadPoll {
        if self.finished {
            return LoadPoll::Failed(StreamError::InvariantViolation(format!(
                "ticket for region {} polled after completion",
                self.coord
            )));
        }
        match self.reply.try_recv() {
            Ok(Ok(region)) => {
                self.finished = true;
                LoadPoll::Ready(region)
            }
            Ok(Err(err)) => {
                self.finished = true;
                LoadPoll::Failed(err)
            }
            Err(TryRecvError::Empty) => LoadPoll::Pending,
            Err(TryRecvError::Disconnected) => {
                self.finished = true;
                LoadPoll::Failed(StreamError::LoaderShutdown)
            }
        }
    }

    /// Best-effort cancel: a queued job is skipped, a running job finishes
    /// and its result is thrown away.
    pub fn cancel(self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Bounded pool of region worker threads.
pub struct AsyncRegionLoader {
    jobs: Option<Sender<Job>>,
    capacity: usize,
    policy: FullQueuePolicy,
    in_flight: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncRegionLoader {
    /// Spawn `config.workers` threads sharing a queue of `config.max_queued` jobs.
    pub fn new(store: Arc<dyn RegionStore>, config: &LoaderConfig) -> Result<Self, StreamError> {
        let worker_count = config.workers.max(1);
        let capacity = config.max_queued.max(1);
        let (tx, rx) = bounded::<Job>(capacity);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let store = Arc::clone(&store);
            let rx = rx.clone();
            let in_flight = Arc::clone(&in_flight);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("region-worker-{i}"))
                .spawn(move || worker_loop(store, rx, in_flight, shutdown))?;
            workers.push(handle);
        }
        tracing::debug!(workers = worker_count, capacity, "region loader started");

        Ok(Self {
            jobs: Some(tx),
            capacity,
            policy: config.when_full,
            in_flight,
            shutdown,
            workers,
        })
    }

    /// Queue a load. Under `FullQueuePolicy::Block` this waits for room.
    pub fn submit(&self, coord: RegionCoord, kind: LoadKind) -> Result<LoadTicket, StreamError> {
        let jobs = self.jobs.as_ref().ok_or(StreamError::LoaderShutdown)?;
        let (reply_tx, reply_rx) = bounded(1);
        let cancelled = Arc::new(AtomicBool::new(false));
        let job = Job {
            coord,
            kind,
            cancelled: Arc::clone(&cancelled),
            reply: reply_tx,
        };

        // Counted before the send so a fast worker can never decrement first.
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let sent = match self.policy {
            FullQueuePolicy::Reject => jobs.try_send(job).map_err(|e| match e {
                TrySendError::Full(_) => StreamError::QueueFull {
                    capacity: self.capacity,
                },
                TrySendError::Disconnected(_) => StreamError::LoaderShutdown,
            }),
            FullQueuePolicy::Block => jobs.send(job).map_err(|_| StreamError::LoaderShutdown),
        };
        if let Err(err) = sent {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }

        tracing::trace!(%coord, ?kind, "region job submitted");
        Ok(LoadTicket {
            coord,
            kind,
            cancelled,
            reply: reply_rx,
            finished: false,
        })
    }

    /// Jobs submitted and not yet finished (queued or running).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Maximum number of queued jobs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for AsyncRegionLoader {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.jobs.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("region worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(
    store: Arc<dyn RegionStore>,
    jobs: Receiver<Job>,
    in_flight: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
) {
    while let Ok(job) = jobs.recv() {
        if shutdown.load(Ordering::Acquire) || job.cancelled.load(Ordering::Acquire) {
            tracing::trace!(coord = %job.coord, "skipping cancelled region job");
            in_flight.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        let _span = tracing::debug_span!("region_job", coord = %job.coord).entered();
        let result = catch_unwind(AssertUnwindSafe(|| {
            provide_region(store.as_ref(), job.coord, job.kind)
        }))
        .unwrap_or_else(|_| {
            Err(StreamError::GenerationFailure {
                coord: job.coord,
                source: StoreError::new("region store panicked"),
            })
        });
        in_flight.fetch_sub(1, Ordering::AcqRel);

        if job.cancelled.load(Ordering::Acquire) {
            tracing::debug!(coord = %job.coord, "discarding result of cancelled region job");
            continue;
        }
        // The ticket may already be gone; that is a discard too.
        let _ = job.reply.send(result);
    }
}
