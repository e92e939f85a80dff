//! Request scheduling: dedup, rolling latency, adaptive concurrency
//!
//! One in-flight network call per distinct (url, params) key; concurrent
//! callers join the pending call and share its outcome. Completed calls feed
//! an exponentially-weighted rolling latency that drives an additive
//! increase / additive decrease concurrency ceiling. The ceiling is advisory:
//! callers read it to size their own batches, the scheduler never reorders
//! in-flight work.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::layer::ChunkEnvelope;
use crate::transport::{ChunkRequest, ChunkTransport};
use crate::{FetchError, Result};

/// Concurrency ceiling band and adaptation tuning.
pub const MIN_CONCURRENCY: usize = 5;
pub const MAX_CONCURRENCY: usize = 25;
const INITIAL_CONCURRENCY: usize = 15;
const CONCURRENCY_STEP: usize = 2;
const STREAK_LEN: u32 = 3;
const SLOW_FACTOR: f64 = 1.5;
const FAST_FACTOR: f64 = 0.8;
const EWMA_OLD: f64 = 0.7;
const EWMA_NEW: f64 = 0.3;

type SharedOutcome = Result<Arc<ChunkEnvelope>>;

struct PendingRequest {
    tx: watch::Sender<Option<SharedOutcome>>,
    #[allow(dead_code)]
    priority: i32,
}

/// Rolling latency and the adaptive ceiling it drives.
///
/// Additive increase / additive decrease, tuned for smoothing rather than
/// aggressive backoff: ±2 after three consecutive slow/fast samples, always
/// clamped to [`MIN_CONCURRENCY`]..=[`MAX_CONCURRENCY`].
#[derive(Debug)]
struct AdaptiveState {
    avg_ms: f64,
    samples: u64,
    slow_streak: u32,
    fast_streak: u32,
    limit: usize,
}

impl AdaptiveState {
    fn new() -> Self {
        Self {
            avg_ms: 0.0,
            samples: 0,
            slow_streak: 0,
            fast_streak: 0,
            limit: INITIAL_CONCURRENCY,
        }
    }

    fn record(&mut self, elapsed_ms: f64) {
        if self.samples == 0 {
            // First sample seeds the average and is not classified.
            self.avg_ms = elapsed_ms;
            self.samples = 1;
            return;
        }

        // Classify against the average before folding the sample in.
        let avg = self.avg_ms;
        self.avg_ms = EWMA_OLD * avg + EWMA_NEW * elapsed_ms;
        self.samples += 1;

        if elapsed_ms > avg * SLOW_FACTOR {
            self.slow_streak += 1;
            self.fast_streak = 0;
            if self.slow_streak >= STREAK_LEN {
                let next = self.limit.saturating_sub(CONCURRENCY_STEP).max(MIN_CONCURRENCY);
                if next != self.limit {
                    tracing::debug!(from = self.limit, to = next, "lowering concurrency ceiling");
                }
                self.limit = next;
                self.slow_streak = 0;
            }
        } else if elapsed_ms < avg * FAST_FACTOR {
            self.fast_streak += 1;
            self.slow_streak = 0;
            if self.fast_streak >= STREAK_LEN {
                let next = (self.limit + CONCURRENCY_STEP).min(MAX_CONCURRENCY);
                if next != self.limit {
                    tracing::debug!(from = self.limit, to = next, "raising concurrency ceiling");
                }
                self.limit = next;
                self.fast_streak = 0;
            }
        } else {
            // A neutral sample breaks both streaks: adjustments require
            // consecutive evidence.
            self.slow_streak = 0;
            self.fast_streak = 0;
        }
    }
}

/// Deduplicating network scheduler over a [`ChunkTransport`].
pub struct RequestScheduler<T: ChunkTransport> {
    transport: T,
    pending: DashMap<String, PendingRequest>,
    adaptive: Mutex<AdaptiveState>,
    shutdown: CancellationToken,
}

impl<T: ChunkTransport> RequestScheduler<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pending: DashMap::new(),
            adaptive: Mutex::new(AdaptiveState::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Fetch one chunk, collapsing onto an already in-flight identical
    /// request when one exists.
    ///
    /// Cancellation (either the caller's token or [`cancel_all`]) returns
    /// [`FetchError::Cancelled`] and is excluded from latency tracking.
    ///
    /// [`cancel_all`]: RequestScheduler::cancel_all
    pub async fn schedule(
        &self,
        req: &ChunkRequest,
        cancel: &CancellationToken,
    ) -> SharedOutcome {
        let key = req.dedup_key();

        // Check-then-insert stays atomic relative to other callers: the entry
        // guard covers it and no suspension happens while it is held.
        let joined = match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => Some(entry.get().tx.subscribe()),
            Entry::Vacant(slot) => {
                let (tx, _rx) = watch::channel(None);
                slot.insert(PendingRequest {
                    tx,
                    priority: req.priority,
                });
                None
            }
        };

        if let Some(mut rx) = joined {
            loop {
                let current = rx.borrow().clone();
                if let Some(outcome) = current {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    // The issuing side went away without publishing a result.
                    return Err(FetchError::Cancelled);
                }
            }
        }

        // This caller owns the network call.
        let started = Instant::now();
        let outcome: SharedOutcome = tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            _ = self.shutdown.cancelled() => Err(FetchError::Cancelled),
            result = self.transport.fetch(req) => result.map(Arc::new),
        };

        if !matches!(outcome, Err(FetchError::Cancelled)) {
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.adaptive.lock().unwrap().record(elapsed_ms);
        }

        if let Some((_, pending)) = self.pending.remove(&key) {
            let _ = pending.tx.send(Some(outcome.clone()));
        }
        outcome
    }

    /// Current advisory concurrency ceiling, always within
    /// [`MIN_CONCURRENCY`]..=[`MAX_CONCURRENCY`].
    pub fn current_concurrency_limit(&self) -> usize {
        self.adaptive.lock().unwrap().limit
    }

    /// Rolling average latency in milliseconds (0 before the first sample).
    pub fn average_latency_ms(&self) -> f64 {
        self.adaptive.lock().unwrap().avg_ms
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Abort every pending request. Used on viewer teardown; the scheduler
    /// does not accept new work afterwards (every call resolves cancelled).
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    #[cfg(test)]
    pub(crate) fn transport_for_tests(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Feature, Geometry, ViewContext};
    use geo::{Coord, Rect};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockTransport {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl MockTransport {
        fn with_delay(ms: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(ms),
            }
        }
    }

    impl ChunkTransport for MockTransport {
        async fn fetch(&self, req: &ChunkRequest) -> Result<ChunkEnvelope> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(ChunkEnvelope {
                features: vec![Feature {
                    id: Some(req.chunk_id as i64),
                    geometry: Some(Geometry::Point {
                        coordinates: [0.0, 0.0],
                    }),
                    properties: serde_json::Map::new(),
                }],
                chunk_info: None,
            })
        }
    }

    fn request(chunk_id: u32, priority: i32) -> ChunkRequest {
        let view = ViewContext {
            bounds: Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }),
            zoom: 10,
        };
        ChunkRequest::new(1, chunk_id, &view, priority)
    }

    #[tokio::test(start_paused = true)]
    async fn identical_concurrent_requests_share_one_call() {
        let scheduler = RequestScheduler::new(MockTransport::with_delay(10));
        let cancel = CancellationToken::new();

        let req = request(1, 5);
        let req_hi = request(1, 9);
        let (a, b, c) = tokio::join!(
            scheduler.schedule(&req, &cancel),
            scheduler.schedule(&req, &cancel),
            scheduler.schedule(&req_hi, &cancel), // priority differs, same key
        );

        assert_eq!(scheduler.transport.calls.load(Ordering::SeqCst), 1);
        let a = a.unwrap();
        assert_eq!(a.features.len(), 1);
        assert!(Arc::ptr_eq(&a, &b.unwrap()));
        assert!(Arc::ptr_eq(&a, &c.unwrap()));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_requests_are_not_collapsed() {
        let scheduler = RequestScheduler::new(MockTransport::with_delay(10));
        let cancel = CancellationToken::new();

        let req1 = request(1, 5);
        let req2 = request(2, 5);
        let (a, b) = tokio::join!(
            scheduler.schedule(&req1, &cancel),
            scheduler.schedule(&req2, &cancel),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(scheduler.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_samples_feed_the_rolling_average() {
        let scheduler = RequestScheduler::new(MockTransport::with_delay(100));
        let cancel = CancellationToken::new();

        scheduler.schedule(&request(1, 5), &cancel).await.unwrap();
        assert!((scheduler.average_latency_ms() - 100.0).abs() < 1.0);

        scheduler.schedule(&request(2, 5), &cancel).await.unwrap();
        // 0.7 * 100 + 0.3 * 100 = 100
        assert!((scheduler.average_latency_ms() - 100.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_aborts_pending_requests() {
        let scheduler = RequestScheduler::new(MockTransport::with_delay(60_000));
        let cancel = CancellationToken::new();

        let req = request(1, 5);
        let (outcome, _) = tokio::join!(scheduler.schedule(&req, &cancel), async {
            scheduler.cancel_all();
        });
        assert_eq!(outcome.unwrap_err(), FetchError::Cancelled);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_token_cancels_a_single_scope() {
        let scheduler = RequestScheduler::new(MockTransport::with_delay(60_000));
        let cancel = CancellationToken::new();

        let req = request(1, 5);
        let (outcome, _) = tokio::join!(scheduler.schedule(&req, &cancel), async {
            cancel.cancel();
        });
        assert_eq!(outcome.unwrap_err(), FetchError::Cancelled);
    }

    #[test]
    fn three_consecutive_slow_samples_lower_the_ceiling_by_two() {
        let mut state = AdaptiveState::new();
        state.record(100.0);
        for _ in 0..3 {
            state.record(1_000.0);
        }
        assert_eq!(state.limit, INITIAL_CONCURRENCY - CONCURRENCY_STEP);
        assert_eq!(state.slow_streak, 0);
    }

    #[test]
    fn a_neutral_sample_breaks_a_streak() {
        let mut state = AdaptiveState::new();
        state.record(100.0);
        state.record(1_000.0);
        state.record(1_000.0);
        // Roughly equal to the running average: neither slow nor fast.
        state.record(state.avg_ms);
        state.record(1_000.0);
        state.record(1_000.0);
        assert_eq!(state.limit, INITIAL_CONCURRENCY);
    }

    #[test]
    fn ceiling_never_leaves_the_configured_band() {
        let mut state = AdaptiveState::new();
        state.record(100.0);
        // Arbitrarily long slow streak: elapsed always 10x the average.
        for _ in 0..500 {
            state.record(state.avg_ms * 10.0);
        }
        assert_eq!(state.limit, MIN_CONCURRENCY);

        // Arbitrarily long fast streak.
        for _ in 0..500 {
            state.record(state.avg_ms * 0.1);
        }
        assert_eq!(state.limit, MAX_CONCURRENCY);
    }
}
