//! Debounced viewport culling for large circle sets
//!
//! A culler owns the circle specs of one buffer layer and keeps only the
//! circles intersecting the (expanded) viewport materialized on the map.
//! Small sets and low zoom levels render everything; recomputes are debounced
//! so a pan gesture triggers one diff, not one per move event.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use geo::Rect;

use crate::map::{CircleSpec, MapEngine, RenderHandle};
use crate::utils::{expand_rect, rects_intersect, rects_similar};

/// Culling thresholds and timing.
#[derive(Debug, Clone)]
pub struct CullConfig {
    /// Quiet window after the last viewport change before recomputing.
    pub debounce: Duration,
    /// Sets below this size render in full, no culling.
    pub max_unculled: usize,
    /// Below this zoom everything renders (circles are tiny anyway).
    pub min_culling_zoom: f64,
    /// Viewport expansion factor, so edge circles don't pop during a pan.
    pub bounds_expand: f64,
    /// Bounds deltas under this many degrees are jitter and skip the
    /// recompute.
    pub similar_eps: f64,
}

impl Default for CullConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(150),
            max_unculled: 500,
            min_culling_zoom: 11.0,
            bounds_expand: 1.2,
            similar_eps: 0.002,
        }
    }
}

struct CullState {
    specs: Vec<CircleSpec>,
    rendered: HashSet<RenderHandle>,
    last_bounds: Option<Rect<f64>>,
    passes: u64,
}

/// Viewport-driven materializer for one culled circle set.
pub struct ViewportCuller {
    map: Arc<dyn MapEngine>,
    config: CullConfig,
    state: Mutex<CullState>,
    generation: AtomicU64,
    active: AtomicBool,
}

impl ViewportCuller {
    pub fn new(map: Arc<dyn MapEngine>, config: CullConfig) -> Self {
        Self {
            map,
            config,
            state: Mutex::new(CullState {
                specs: Vec::new(),
                rendered: HashSet::new(),
                last_bounds: None,
                passes: 0,
            }),
            generation: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }

    /// Replace the spec set. Anything already materialized that is no longer
    /// in the set is removed; an active culler recomputes immediately.
    pub fn set_specs(&self, specs: Vec<CircleSpec>) {
        {
            let mut state = self.state.lock().unwrap();
            let keep: HashSet<RenderHandle> = specs.iter().map(|s| s.handle).collect();
            for handle in state.rendered.iter().filter(|h| !keep.contains(h)) {
                self.map.remove_layer(*handle);
            }
            state.rendered.retain(|h| keep.contains(h));
            state.specs = specs;
            state.last_bounds = None;
        }
        if self.active.load(Ordering::SeqCst) {
            self.recompute_now();
        }
    }

    /// Start materializing: runs one full recompute against the current
    /// viewport.
    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.state.lock().unwrap().last_bounds = None;
        self.recompute_now();
    }

    /// Stop materializing and remove everything this culler rendered.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        // Void any debounced recompute still in flight.
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        for handle in state.rendered.drain() {
            self.map.remove_layer(handle);
        }
        state.last_bounds = None;
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn rendered_count(&self) -> usize {
        self.state.lock().unwrap().rendered.len()
    }

    /// Notify the culler the viewport moved or zoomed.
    ///
    /// Schedules a debounced recompute; only the most recent notification
    /// within the quiet window actually runs.
    pub fn viewport_changed(self: &Arc<Self>) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let scheduled = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let culler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(culler.config.debounce).await;
            if culler.generation.load(Ordering::SeqCst) == scheduled {
                culler.recompute_now();
            }
        });
    }

    /// Diff the materialized set against the current viewport.
    pub fn recompute_now(&self) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let bounds = self.map.bounds();
        let zoom = self.map.zoom();
        let mut state = self.state.lock().unwrap();

        if let Some(last) = &state.last_bounds {
            if rects_similar(last, &bounds, self.config.similar_eps) {
                return;
            }
        }

        let render_all =
            state.specs.len() < self.config.max_unculled || zoom < self.config.min_culling_zoom;
        let expanded = expand_rect(bounds, self.config.bounds_expand);
        let target: HashSet<RenderHandle> = state
            .specs
            .iter()
            .filter(|spec| render_all || rects_intersect(&spec.bbox, &expanded))
            .map(|spec| spec.handle)
            .collect();

        let stale: Vec<RenderHandle> = state
            .rendered
            .iter()
            .filter(|h| !target.contains(h))
            .copied()
            .collect();
        for handle in stale {
            self.map.remove_layer(handle);
            state.rendered.remove(&handle);
        }
        for spec in &state.specs {
            if target.contains(&spec.handle) && !state.rendered.contains(&spec.handle) {
                self.map.add_layer(spec);
            }
        }
        state.rendered.extend(target);

        state.last_bounds = Some(bounds);
        state.passes += 1;
        tracing::debug!(
            rendered = state.rendered.len(),
            total = state.specs.len(),
            render_all,
            "culling pass complete"
        );
    }

    #[cfg(test)]
    fn passes(&self) -> u64 {
        self.state.lock().unwrap().passes
    }
}
