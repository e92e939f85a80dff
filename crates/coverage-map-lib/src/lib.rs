//! Coverage Map Library - Adaptive Layer Streaming for Interactive Map Viewers
//!
//! This library provides the data plane of a coverage-map viewer: adaptive
//! fetching of paginated spatial layer chunks, in-memory caching of merged
//! feature collections, zoom-driven layer visibility, and derived distance
//! buffers with viewport culling for large buffer sets.
//!
//! # Architecture
//!
//! - **[`RequestScheduler`]**: deduplicated network calls with rolling-latency
//!   driven concurrency adaptation
//! - **[`LayerCache`]**: per-layer merged feature collections, last-write-wins
//! - **[`LayerLoader`]**: paginated chunk retrieval with eager and lazy modes
//! - **[`ZoomVisibilityManager`]**: user intent vs. zoom permission, with
//!   typed toggle/hint events
//! - **[`BufferLayerManager`]** / **[`ViewportCuller`]**: concentric distance
//!   buffers around point features, culled to the viewport when large
//!
//! # Concurrency Model
//!
//! Single logical thread, cooperative scheduling: suspension points are
//! network awaits and debounce timers only. Shared tables are mutated
//! synchronously within one turn (no lock is held across an `.await`), so
//! check-then-insert sequences stay atomic.

mod buffer;
mod cache;
mod culling;
mod layer;
mod loader;
mod map;
mod scheduler;
mod transport;
pub mod utils;
mod visibility;

// Public API exports
pub use buffer::{BufferConfig, BufferLayerManager, BufferSummary, BufferVisibility};
pub use cache::{CacheEntry, LayerCache};
pub use culling::{CullConfig, ViewportCuller};
pub use layer::{
    ChunkEnvelope, ChunkInfo, Feature, FeatureCollection, Geometry, LayerDescriptor, LayerId,
    LayerKind, ViewContext,
};
pub use loader::LayerLoader;
pub use map::{BufferStyle, CircleSpec, MapEngine, RenderHandle};
pub use scheduler::{MAX_CONCURRENCY, MIN_CONCURRENCY, RequestScheduler};
pub use transport::{ChunkRequest, ChunkTransport, HttpChunkTransport};
pub use visibility::{
    BufferVisibilityHook, LayerToggle, TOWER_MIN_ZOOM, ToggleReason, ZoomHint, ZoomStatus,
    ZoomVisibilityManager,
};

/// Error type for chunk retrieval and loading.
///
/// Cloneable (string payloads) so that callers joined onto one deduplicated
/// in-flight request can all receive the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The request was aborted through a cancellation token. Distinguished
    /// from data errors so callers can tell "no data" from "aborted".
    #[error("request cancelled")]
    Cancelled,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed chunk payload: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, FetchError>;
