//! Pending-event queue with size- and time-triggered batch flushes.
//!
//! Flushing captures and clears the pending list before the network call, so
//! `enqueue` never waits on delivery. A failed batch is put back in front of
//! whatever arrived meanwhile. At most one flush is in flight; concurrent
//! triggers are coalesced into it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_core::config::QueueConfig;
use beacon_core::types::{Event, EventBatch};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::delivery::{Collector, Connectivity};
use crate::session::SessionTracker;

/// What a call to [`EventQueue::flush`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Empty,
    /// Offline and not forced; events stay queued.
    Offline,
    /// Another flush is outstanding; this trigger was coalesced into it.
    InFlight,
    /// The batch was accepted by the collector.
    Delivered(usize),
    /// Delivery failed or timed out; the batch is back at the queue head.
    Requeued(usize),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub requeued: u64,
    pub failed_flushes: u64,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct EventQueue {
    app_id: String,
    pending: Mutex<Vec<Event>>,
    in_flight: AtomicBool,
    collector: Arc<dyn Collector>,
    session: Arc<SessionTracker>,
    connectivity: Arc<Connectivity>,
    batch_size: usize,
    max_pending: usize,
    flush_interval: Duration,
    send_timeout: Duration,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    requeued: AtomicU64,
    failed_flushes: AtomicU64,
    shutdown: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    pub fn new(
        app_id: impl Into<String>,
        config: &QueueConfig,
        collector: Arc<dyn Collector>,
        session: Arc<SessionTracker>,
        connectivity: Arc<Connectivity>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let batch_size = config.batch_size.max(1);
        Arc::new(Self {
            app_id: app_id.into(),
            pending: Mutex::new(Vec::with_capacity(batch_size)),
            in_flight: AtomicBool::new(false),
            collector,
            session,
            connectivity,
            batch_size,
            max_pending: config.max_pending.max(batch_size),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
            send_timeout: Duration::from_millis(config.send_timeout_ms.max(1)),
            enqueued: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            shutdown,
            timer: Mutex::new(None),
        })
    }

    /// Append an event. Reaching the batch size schedules a flush on the
    /// current tokio runtime; without one, the timer or shutdown picks it up.
    pub fn enqueue(self: &Arc<Self>, event: Event) {
        let flush_due = {
            let mut pending = self.pending.lock();
            pending.push(event);
            if pending.len() > self.max_pending {
                let excess = pending.len() - self.max_pending;
                pending.drain(..excess);
                self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
                metrics::counter!("beacon.queue.dropped").increment(excess as u64);
                warn!(dropped = excess, max_pending = self.max_pending, "queue full, oldest events dropped");
            }
            pending.len() >= self.batch_size
        };
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("beacon.queue.enqueued").increment(1);

        if flush_due {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let queue = Arc::clone(self);
                handle.spawn(async move {
                    queue.flush(false).await;
                });
            } else {
                debug!("batch size reached outside a runtime, deferring flush");
            }
        }
    }

    /// Deliver everything pending as one batch.
    pub async fn flush(&self, force: bool) -> FlushOutcome {
        if self.pending.lock().is_empty() {
            return FlushOutcome::Empty;
        }
        if !force && !self.connectivity.is_online() {
            debug!("offline, flush skipped");
            return FlushOutcome::Offline;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("flush already in flight, coalesced");
            return FlushOutcome::InFlight;
        }
        let _guard = InFlightGuard(&self.in_flight);

        let events = std::mem::take(&mut *self.pending.lock());
        if events.is_empty() {
            return FlushOutcome::Empty;
        }

        let batch = EventBatch {
            batch_id: Uuid::new_v4(),
            app_id: self.app_id.clone(),
            events,
            session: self.session.snapshot(),
            sent_at: Utc::now(),
        };
        let count = batch.events.len();
        debug!(count, batch_id = %batch.batch_id, collector = self.collector.name(), "flushing batch");

        let failure = match tokio::time::timeout(self.send_timeout, self.collector.deliver(&batch)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("send timed out after {:?}", self.send_timeout)),
        };

        match failure {
            None => {
                self.delivered.fetch_add(count as u64, Ordering::Relaxed);
                metrics::counter!("beacon.queue.flushed").increment(count as u64);
                debug!(count, "batch delivered");
                FlushOutcome::Delivered(count)
            }
            Some(reason) => {
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("beacon.queue.flush_errors").increment(1);
                error!(error = %reason, count, "batch delivery failed, requeueing");
                self.requeue(batch.events);
                FlushOutcome::Requeued(count)
            }
        }
    }

    /// Put a failed batch back ahead of anything enqueued since.
    fn requeue(&self, mut events: Vec<Event>) {
        let count = events.len();
        let mut pending = self.pending.lock();
        events.append(&mut pending);
        *pending = events;
        self.requeued.fetch_add(count as u64, Ordering::Relaxed);
        metrics::counter!("beacon.queue.requeued").increment(count as u64);
    }

    /// Spawn the periodic flush loop. It also flushes when connectivity
    /// comes back. Calling it twice keeps the first loop.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }

        let queue = Arc::clone(self);
        let mut online = self.connectivity.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        let period = self.flush_interval;

        *timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        queue.flush(false).await;
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *online.borrow_and_update() {
                            info!("back online, flushing queue");
                            queue.flush(false).await;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("flush loop stopped");
        }));
        info!(interval_ms = period.as_millis() as u64, batch_size = self.batch_size, "flush loop started");
    }

    /// Stop the timer and force a final flush. Waits out an in-flight flush
    /// first so the final batch contains whatever that one requeues.
    pub async fn shutdown(&self) -> FlushOutcome {
        self.shutdown.send_replace(true);
        let timer = self.timer.lock().take();
        if let Some(handle) = timer {
            if let Err(e) = handle.await {
                warn!(error = %e, "flush loop ended abnormally");
            }
        }

        loop {
            match self.flush(true).await {
                FlushOutcome::InFlight => tokio::time::sleep(Duration::from_millis(5)).await,
                outcome => {
                    info!(outcome = ?outcome, "queue shut down");
                    return outcome;
                }
            }
        }
    }

    /// Discard everything pending. Used when consent is revoked.
    pub fn clear(&self) -> usize {
        let discarded = std::mem::take(&mut *self.pending.lock()).len();
        if discarded > 0 {
            info!(discarded, "pending events discarded");
        }
        discarded
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_events(&self) -> Vec<Event> {
        self.pending.lock().clone()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending_len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }
}
