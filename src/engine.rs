//! Dispatch engine: lanes, the disk probe, coalescing and delivery.
//!
//! `submit` hands each request to the unbounded distributor (a spawned task
//! per probe, so the cheap synchronous disk check never queues behind pixel
//! work). The probe routes the load task onto the cache-hit or network lane;
//! each lane is an unbounded FIFO queue drained by at most N concurrent
//! workers, gated by a semaphore. Completions are posted to the caller's
//! delivery channel with a non-blocking send.
//!
//! Identical in-flight requests (same key, size and mode) are coalesced:
//! later submissions attach as extra delivery tickets to the running task
//! instead of starting duplicate work.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, trace, warn};

use crate::request::{DisplayTarget, ImageEvent, LoadRequest, LoadedFrom, RequestId};
use crate::task::{LoadTask, PipelineContext};

type LaneJob = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A bounded execution lane: unbounded FIFO queue, at most `workers`
/// concurrently running jobs.
struct Lane {
    tx: mpsc::UnboundedSender<LaneJob>,
}

impl Lane {
    fn spawn(name: &'static str, workers: usize) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LaneJob>();
        let semaphore = Arc::new(Semaphore::new(workers));
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                });
            }
            trace!(lane = name, "lane drained and closed");
        });
        Self { tx }
    }

    /// Queues a job. Returns `false` when the lane task is gone, i.e. during
    /// teardown; the job is dropped unrun and the caller must still deliver.
    #[must_use]
    fn enqueue(&self, job: LaneJob) -> bool {
        self.tx.send(job).is_ok()
    }

    #[cfg(test)]
    fn closed() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// A pending delivery attached to an in-flight load.
struct Ticket {
    id: RequestId,
    locator: String,
    target: Arc<dyn DisplayTarget>,
}

pub(crate) struct DispatchEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    ctx: Arc<PipelineContext>,
    events: mpsc::UnboundedSender<ImageEvent>,
    cache_lane: Lane,
    network_lane: Lane,
    in_flight: Mutex<HashMap<String, Vec<Ticket>>>,
}

impl DispatchEngine {
    pub(crate) fn new(ctx: Arc<PipelineContext>, events: mpsc::UnboundedSender<ImageEvent>) -> Self {
        let cache_lane = Lane::spawn("cache-hit", ctx.config.cache_lane_workers);
        let network_lane = Lane::spawn("network", ctx.config.network_lane_workers);
        Self {
            shared: Arc::new(EngineShared {
                ctx,
                events,
                cache_lane,
                network_lane,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Enqueues a probe for `request` on the distributor lane. Returns
    /// immediately; the result arrives on the delivery channel.
    pub(crate) fn submit(&self, request: LoadRequest, target: Arc<dyn DisplayTarget>) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.distribute(request, target);
        });
    }

    /// Aborts in-flight copies and closes the disk store.
    pub(crate) fn shutdown(&self) {
        self.shared.ctx.stop.store(true, Ordering::Relaxed);
        self.shared.ctx.store.close();
        debug!("dispatch engine shut down");
    }
}

impl EngineShared {
    /// The distributor probe: coalesce or route to a lane by disk presence.
    fn distribute(self: Arc<Self>, request: LoadRequest, target: Arc<dyn DisplayTarget>) {
        let correlation = request.correlation_key();
        let ticket = Ticket {
            id: request.id,
            locator: request.locator.clone(),
            target,
        };

        {
            let mut in_flight = self.in_flight.lock();
            if let Some(waiters) = in_flight.get_mut(&correlation) {
                trace!(id = %request.id, locator = %request.locator, "attached to in-flight load");
                waiters.push(ticket);
                return;
            }
            in_flight.insert(correlation.clone(), vec![ticket]);
        }

        // Cheap synchronous presence check decides the lane.
        let cached = self
            .ctx
            .store
            .get(&request.cache_key)
            .is_some_and(|entry| entry.len > 0);
        debug!(
            id = %request.id,
            locator = %request.locator,
            lane = if cached { "cache-hit" } else { "network" },
            "routing request"
        );

        let shared = Arc::clone(&self);
        let job_correlation = correlation.clone();
        let job: LaneJob = Box::pin(async move {
            let task = LoadTask::new(Arc::clone(&shared.ctx), request);
            let (bitmap, loaded_from) = task.run().await;
            shared.deliver(&job_correlation, bitmap, loaded_from);
        });

        let enqueued = if cached {
            self.cache_lane.enqueue(job)
        } else {
            self.network_lane.enqueue(job)
        };
        if !enqueued {
            warn!(correlation = %correlation, "lane closed, delivering absent");
            self.deliver(&correlation, None, LoadedFrom::Network);
        }
    }

    /// Completes the delivery step for every ticket that attached to this
    /// load, the originating request included. Fire-and-forget channel send;
    /// never blocks the worker.
    fn deliver(
        &self,
        correlation: &str,
        bitmap: Option<Arc<image::DynamicImage>>,
        loaded_from: LoadedFrom,
    ) {
        let tickets = self
            .in_flight
            .lock()
            .remove(correlation)
            .unwrap_or_default();

        for ticket in tickets {
            let event = ImageEvent {
                request_id: ticket.id,
                locator: ticket.locator,
                target: ticket.target,
                bitmap: bitmap.clone(),
                loaded_from,
            };
            if self.events.send(event).is_err() {
                warn!("delivery channel closed, dropping event");
            }
        }
    }
}
