//! Chunked layer loading
//!
//! Orchestrates paginated retrieval of one layer's data through the
//! scheduler, merges chunks into the cache, and serves both operating modes:
//! eager preload of every layer at project open, and lazy load when a layer
//! is first toggled visible. Batches are strictly sequential; requests within
//! a batch are concurrent and the merge is order-independent.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::LayerCache;
use crate::layer::{FeatureCollection, LayerDescriptor, LayerId, ViewContext};
use crate::scheduler::RequestScheduler;
use crate::transport::{ChunkRequest, ChunkTransport};
use crate::{FetchError, Result};

/// Hard cap on chunks requested per batch, even when the scheduler's
/// ceiling is higher.
const MAX_BATCH: usize = 15;
/// First chunks gate everything else, so they run above the layer's base
/// priority.
const FIRST_CHUNK_BOOST: i32 = 2;
/// Batch member priority degrades one step per this many positions, so
/// earlier chunks still win contention over later ones.
const PRIORITY_STEP_EVERY: usize = 3;

type LoadOutcome = Result<Arc<FeatureCollection>>;

/// Paginated loader over a [`RequestScheduler`] and a [`LayerCache`].
pub struct LayerLoader<T: ChunkTransport> {
    scheduler: Arc<RequestScheduler<T>>,
    cache: Arc<LayerCache>,
    pending: DashMap<LayerId, watch::Sender<Option<LoadOutcome>>>,
}

impl<T: ChunkTransport> LayerLoader<T> {
    pub fn new(scheduler: Arc<RequestScheduler<T>>, cache: Arc<LayerCache>) -> Self {
        Self {
            scheduler,
            cache,
            pending: DashMap::new(),
        }
    }

    pub fn is_layer_loading(&self, layer_id: LayerId) -> bool {
        self.pending.contains_key(&layer_id)
    }

    /// Load one layer's merged feature collection.
    ///
    /// Returns immediately on a cache hit; otherwise follows the server's
    /// continuation pointers chunk-batch by chunk-batch. Concurrent calls for
    /// the same layer join the pending load instead of issuing another one.
    ///
    /// Per-chunk failures degrade to an empty subset for that chunk;
    /// cancellation propagates as [`FetchError::Cancelled`] and nothing is
    /// cached.
    pub async fn load_layer(
        &self,
        descriptor: &LayerDescriptor,
        view: &ViewContext,
        cancel: &CancellationToken,
    ) -> LoadOutcome {
        if let Some(entry) = self.cache.get(descriptor.id) {
            return Ok(entry.features);
        }

        let joined = match self.pending.entry(descriptor.id) {
            Entry::Occupied(entry) => Some(entry.get().subscribe()),
            Entry::Vacant(slot) => {
                let (tx, _rx) = watch::channel(None);
                slot.insert(tx);
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
                    return Err(FetchError::Cancelled);
                }
            }
        }

        let outcome = self.fetch_and_merge(descriptor, view, cancel).await;
        if let Some((_, tx)) = self.pending.remove(&descriptor.id) {
            let _ = tx.send(Some(outcome.clone()));
        }
        outcome
    }

    async fn fetch_and_merge(
        &self,
        descriptor: &LayerDescriptor,
        view: &ViewContext,
        cancel: &CancellationToken,
    ) -> LoadOutcome {
        let base = descriptor.base_priority();
        let mut merged = FeatureCollection::new();
        let mut seen_ids = HashSet::new();
        let mut fetched: HashSet<u32> = HashSet::new();

        let first = ChunkRequest::new(descriptor.id, 1, view, base - FIRST_CHUNK_BOOST);
        fetched.insert(1);
        let mut next = match self.scheduler.schedule(&first, cancel).await {
            Ok(envelope) => {
                merged.merge_chunk(envelope.features.clone(), &mut seen_ids);
                envelope.continuation()
            }
            Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
            Err(err) => {
                tracing::warn!(layer = descriptor.id, %err, "first chunk failed");
                None
            }
        };

        while let Some(start) = next {
            // The server reports continuations per chunk; the batch resumes
            // from the maximum seen. A pointer back into already-fetched
            // territory means the pagination is done (or the server loops).
            if fetched.contains(&start) {
                tracing::debug!(
                    layer = descriptor.id,
                    continuation = start,
                    "continuation points at an already-fetched chunk; done"
                );
                break;
            }
            // Positions are counted after the already-fetched filter so the
            // priority step reflects actual batch depth.
            let batch: Vec<ChunkRequest> = (0..self.batch_size())
                .map(|i| start + i as u32)
                .filter(|chunk_id| !fetched.contains(chunk_id))
                .enumerate()
                .map(|(position, chunk_id)| {
                    ChunkRequest::new(
                        descriptor.id,
                        chunk_id,
                        view,
                        base + (position / PRIORITY_STEP_EVERY) as i32,
                    )
                })
                .collect();
            for req in &batch {
                fetched.insert(req.chunk_id);
            }

            let results = join_all(
                batch
                    .iter()
                    .map(|req| self.scheduler.schedule(req, cancel)),
            )
            .await;

            let mut continuation: Option<u32> = None;
            for (req, result) in batch.iter().zip(results) {
                match result {
                    Ok(envelope) => {
                        merged.merge_chunk(envelope.features.clone(), &mut seen_ids);
                        if let Some(n) = envelope.continuation() {
                            continuation = Some(continuation.map_or(n, |c| c.max(n)));
                        }
                    }
                    Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                    Err(err) => {
                        // Degrade to an empty subset for this chunk and keep
                        // whatever the rest of the batch produced.
                        tracing::warn!(
                            layer = descriptor.id,
                            chunk = req.chunk_id,
                            %err,
                            "chunk failed; continuing without it"
                        );
                    }
                }
            }
            next = continuation;
        }

        let features = Arc::new(merged);
        self.cache
            .insert(descriptor.id, descriptor.name.clone(), features.clone());
        tracing::debug!(
            layer = descriptor.id,
            features = features.len(),
            "layer load complete"
        );
        Ok(features)
    }

    fn batch_size(&self) -> usize {
        self.scheduler.current_concurrency_limit().min(MAX_BATCH)
    }

    /// Eagerly load every layer, default-visible layers first, in waves sized
    /// by the scheduler's current ceiling.
    ///
    /// Individual layer failures are logged and skipped; cancellation stops
    /// the sweep.
    pub async fn preload_all(
        &self,
        descriptors: &[LayerDescriptor],
        view: &ViewContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut sorted: Vec<&LayerDescriptor> = descriptors.iter().collect();
        sorted.sort_by_key(|d| d.base_priority());

        let mut index = 0;
        while index < sorted.len() {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let wave_len = self
                .scheduler
                .current_concurrency_limit()
                .min(sorted.len() - index);
            let wave = &sorted[index..index + wave_len];

            let results = join_all(
                wave.iter()
                    .map(|descriptor| self.load_layer(descriptor, view, cancel)),
            )
            .await;

            for (descriptor, result) in wave.iter().zip(results) {
                match result {
                    Ok(_) => {}
                    Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                    Err(err) => {
                        tracing::warn!(layer = descriptor.id, %err, "preload failed for layer");
                    }
                }
            }
            index += wave_len;
        }
        Ok(())
    }
}
