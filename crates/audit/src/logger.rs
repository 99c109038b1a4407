//! Buffered, checksum-chained audit logger.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::chain::compute_checksum;
use crate::event::PendingEvent;
use crate::{
    AuditEvent, AuditEventType, AuditSink, ChainHead, Error, GENESIS_CHECKSUM, IntegrityError,
    Result, SearchCriteria, SearchOptions, verify_chain,
};

const SUBSCRIBER_CAPACITY: usize = 1024;

/// Buffering and retention limits.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Buffer depth that triggers an early flush.
    pub buffer_size: usize,
    /// Period of the background flush.
    pub flush_interval: Duration,
    /// Upper bound on a single sink write.
    pub flush_timeout: Duration,
    /// Events held per queue (unflushed buffer, per-sink retry queue) before
    /// the oldest is dropped.
    pub max_buffered: usize,
    /// Flushed events kept in memory for search and integrity checks.
    pub retained_events: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            flush_interval: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(5),
            max_buffered: 10_000,
            retained_events: 10_000,
        }
    }
}

/// Counters reported by [`AuditLogger::get_stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditStats {
    pub events_logged: u64,
    pub events_flushed: u64,
    pub flush_count: u64,
    pub flush_failures: u64,
    pub events_dropped: u64,
    pub buffer_depth: usize,
    /// Events chained but not yet accepted by every sink.
    pub pending_retry: usize,
    pub uptime: Duration,
}

struct ChainState {
    /// Set once the sinks' stored heads have been read.
    resumed: bool,
    next_sequence: u64,
    last_checksum: String,
    /// One retry queue per sink, in sink order.
    outboxes: Vec<VecDeque<AuditEvent>>,
}

#[derive(Default)]
struct Counters {
    events_logged: AtomicU64,
    events_flushed: AtomicU64,
    flush_count: AtomicU64,
    flush_failures: AtomicU64,
    events_dropped: AtomicU64,
    pending_retry: AtomicUsize,
}

/// Append-only audit log.
///
/// [`log_event`](Self::log_event) only touches an in-memory buffer, so it is
/// safe on validation hot paths. Sequence numbers and checksums are assigned
/// when the buffer is flushed; flushes are serialized so the chain stays
/// linear. The first flush continues after the highest event any sink
/// already stores, so a restarted logger extends a persistent log.
pub struct AuditLogger {
    config: AuditConfig,
    sinks: Vec<Arc<dyn AuditSink>>,
    buffer: Mutex<VecDeque<PendingEvent>>,
    chain: tokio::sync::Mutex<ChainState>,
    retained: Mutex<VecDeque<AuditEvent>>,
    flush_needed: Notify,
    events_tx: broadcast::Sender<AuditEvent>,
    counters: Counters,
    started: Instant,
}

impl AuditLogger {
    pub fn new(config: AuditConfig, sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        let (events_tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let outboxes = sinks.iter().map(|_| VecDeque::new()).collect();
        Self {
            config,
            sinks,
            buffer: Mutex::new(VecDeque::new()),
            chain: tokio::sync::Mutex::new(ChainState {
                resumed: false,
                next_sequence: 1,
                last_checksum: GENESIS_CHECKSUM.to_string(),
                outboxes,
            }),
            retained: Mutex::new(VecDeque::new()),
            flush_needed: Notify::new(),
            events_tx,
            counters: Counters::default(),
            started: Instant::now(),
        }
    }

    /// Enqueue an event without waiting for any sink.
    pub fn log_event(
        &self,
        event_type: AuditEventType,
        details: serde_json::Value,
        principal_id: Option<&str>,
    ) {
        let event = PendingEvent {
            event_type,
            details,
            principal_id: principal_id.map(str::to_string),
            timestamp: Utc::now(),
        };

        let depth = {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.config.max_buffered {
                buffer.pop_front();
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    max_buffered = self.config.max_buffered,
                    "audit buffer full, dropping oldest unflushed event"
                );
            }
            buffer.push_back(event);
            buffer.len()
        };

        self.counters.events_logged.fetch_add(1, Ordering::Relaxed);
        if depth >= self.config.buffer_size {
            self.flush_needed.notify_one();
        }
    }

    /// Enqueue an event and flush before returning.
    ///
    /// Returns an error if any sink did not accept the event; the event stays
    /// queued for that sink and is retried on the next flush.
    pub async fn log_event_sync(
        &self,
        event_type: AuditEventType,
        details: serde_json::Value,
        principal_id: Option<&str>,
    ) -> Result<()> {
        self.log_event(event_type, details, principal_id);
        self.flush().await.map(|_| ())
    }

    /// Chain buffered events and write everything outstanding to the sinks.
    ///
    /// Returns the number of newly chained events.
    pub async fn flush(&self) -> Result<usize> {
        let mut chain = self.chain.lock().await;

        if !chain.resumed {
            match self.stored_head().await {
                Ok(Some(head)) => {
                    info!(
                        sequence = head.sequence,
                        "continuing audit chain from stored events"
                    );
                    chain.next_sequence = head.sequence + 1;
                    chain.last_checksum = head.checksum;
                }
                Ok(None) => {}
                Err(e) => {
                    // Nothing is chained until the stored head is known.
                    self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
            chain.resumed = true;
        }

        let pending: Vec<PendingEvent> = self.buffer.lock().drain(..).collect();
        let mut fresh = Vec::with_capacity(pending.len());
        for event in pending {
            let sequence = chain.next_sequence;
            chain.next_sequence += 1;
            let checksum = compute_checksum(
                &chain.last_checksum,
                sequence,
                event.event_type,
                &event.timestamp,
                event.principal_id.as_deref(),
                &event.details,
            );
            let prev_checksum = std::mem::replace(&mut chain.last_checksum, checksum.clone());
            fresh.push(AuditEvent {
                sequence,
                event_type: event.event_type,
                details: event.details,
                principal_id: event.principal_id,
                timestamp: event.timestamp,
                prev_checksum,
                checksum,
            });
        }

        if !fresh.is_empty() {
            let mut retained = self.retained.lock();
            retained.extend(fresh.iter().cloned());
            while retained.len() > self.config.retained_events {
                retained.pop_front();
            }
        }

        let mut first_error = None;
        let mut pending_retry = 0;
        for (sink, outbox) in self.sinks.iter().zip(chain.outboxes.iter_mut()) {
            outbox.extend(fresh.iter().cloned());
            while outbox.len() > self.config.max_buffered {
                outbox.pop_front();
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(sink = sink.name(), "audit retry queue full, dropping oldest event");
            }
            if outbox.is_empty() {
                continue;
            }

            let batch: Vec<AuditEvent> = outbox.iter().cloned().collect();
            match self.write_with_timeout(sink, batch).await {
                Ok(()) => outbox.clear(),
                Err(e) => {
                    self.counters.flush_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        sink = sink.name(),
                        error = %e,
                        queued = outbox.len(),
                        "audit sink write failed, will retry"
                    );
                    pending_retry += outbox.len();
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(chain);

        self.counters.pending_retry.store(pending_retry, Ordering::Relaxed);
        self.counters.flush_count.fetch_add(1, Ordering::Relaxed);
        self.counters
            .events_flushed
            .fetch_add(fresh.len() as u64, Ordering::Relaxed);
        if !fresh.is_empty() {
            debug!(count = fresh.len(), "flushed audit events");
        }

        for event in &fresh {
            // No subscribers is fine.
            let _ = self.events_tx.send(event.clone());
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(fresh.len()),
        }
    }

    /// Highest stored event across all sinks.
    async fn stored_head(&self) -> Result<Option<ChainHead>> {
        let mut heads = Vec::new();
        for sink in &self.sinks {
            heads.extend(self.with_timeout(sink, |sink| sink.resume_point()).await?);
        }
        Ok(heads.into_iter().max_by_key(|head| head.sequence))
    }

    async fn write_with_timeout(
        &self,
        sink: &Arc<dyn AuditSink>,
        batch: Vec<AuditEvent>,
    ) -> Result<()> {
        self.with_timeout(sink, move |sink| sink.write_batch(&batch)).await
    }

    /// Run a blocking sink call on the blocking pool, bounded by `flush_timeout`.
    async fn with_timeout<T, F>(&self, sink: &Arc<dyn AuditSink>, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn AuditSink) -> Result<T> + Send + 'static,
    {
        let name = sink.name().to_string();
        let sink = Arc::clone(sink);
        let task = tokio::task::spawn_blocking(move || call(sink.as_ref()));

        match tokio::time::timeout(self.config.flush_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(Error::Sink {
                sink: name,
                reason: join.to_string(),
            }),
            Err(_) => Err(Error::Timeout { sink: name }),
        }
    }

    /// Flush periodically and whenever the buffer reaches `buffer_size`.
    ///
    /// The task stops once the logger is dropped.
    pub fn spawn_flusher(self: &Arc<Self>) -> JoinHandle<()> {
        let logger = Arc::downgrade(self);
        let period = self.config.flush_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let Some(logger) = logger.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = logger.flush_needed.notified() => {}
                }
                if let Err(e) = logger.flush().await {
                    warn!(error = %e, "background audit flush failed");
                }
            }
        })
    }

    /// Recompute the checksum chain over the retained events.
    pub fn verify_integrity(&self) -> std::result::Result<(), IntegrityError> {
        let retained = self.retained.lock();
        verify_chain(retained.iter())
    }

    /// Search retained (flushed) events.
    pub fn search_events(
        &self,
        criteria: &SearchCriteria,
        options: &SearchOptions,
    ) -> Vec<AuditEvent> {
        let retained = self.retained.lock();
        let matching = |event: &&AuditEvent| criteria.matches(event);
        if options.newest_first {
            retained
                .iter()
                .rev()
                .filter(matching)
                .take(options.limit)
                .cloned()
                .collect()
        } else {
            retained
                .iter()
                .filter(matching)
                .take(options.limit)
                .cloned()
                .collect()
        }
    }

    /// Receive every event as it is flushed.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.events_tx.subscribe()
    }

    pub fn get_stats(&self) -> AuditStats {
        AuditStats {
            events_logged: self.counters.events_logged.load(Ordering::Relaxed),
            events_flushed: self.counters.events_flushed.load(Ordering::Relaxed),
            flush_count: self.counters.flush_count.load(Ordering::Relaxed),
            flush_failures: self.counters.flush_failures.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
            buffer_depth: self.buffer.lock().len(),
            pending_retry: self.counters.pending_retry.load(Ordering::Relaxed),
            uptime: self.started.elapsed(),
        }
    }
}
