//! Zoom-dependent layer visibility
//!
//! A layer is effectively visible only when the user wants it on AND the
//! current zoom permits it; the two bits are orthogonal and zoom changes
//! never overwrite user intent. Transitions are published over broadcast
//! channels so host glue can sync checkboxes and show "zoom in to see X"
//! hints, and tower-layer transitions drive the buffer side-channel through
//! an installed [`BufferVisibilityHook`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::layer::{LayerId, LayerKind};
use crate::map::MapEngine;

/// Tower layers stay hidden below this zoom unless registered with a custom
/// threshold.
pub const TOWER_MIN_ZOOM: f64 = 11.0;

const EVENT_CAPACITY: usize = 64;

/// Why a layer's effective visibility changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleReason {
    /// The user flipped the layer on or off.
    User,
    /// The zoom level crossed the layer's threshold.
    Zoom,
}

/// Effective-visibility transition for one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerToggle {
    pub layer_id: LayerId,
    pub visible: bool,
    pub reason: ToggleReason,
}

/// Human-readable nudge emitted when a layer the user wants on is suppressed
/// by the current zoom.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoomHint {
    pub layer_id: LayerId,
    pub min_zoom: f64,
    pub message: String,
}

/// Zoom permission for one layer at the current zoom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomStatus {
    pub can_show: bool,
    pub min_zoom: f64,
}

/// Side-channel into the buffer manager, driven on tower-layer transitions.
///
/// Both paths are render-state only: a forced hide must preserve each
/// buffer's remembered user flag, and reapply must re-apply each buffer's own
/// flag rather than forcing everything on.
pub trait BufferVisibilityHook: Send + Sync {
    fn force_hide_for_parent(&self, parent_id: LayerId, map: &dyn MapEngine);
    fn reapply_for_parent(&self, parent_id: LayerId, map: &dyn MapEngine);
}

struct LayerVisibility {
    name: String,
    kind: LayerKind,
    min_zoom: f64,
    user_visible: bool,
    zoom_allowed: bool,
}

impl LayerVisibility {
    fn effective(&self) -> bool {
        self.user_visible && self.zoom_allowed
    }
}

/// Tracks user intent and zoom permission per layer and publishes
/// transitions.
pub struct ZoomVisibilityManager {
    layers: Mutex<HashMap<LayerId, LayerVisibility>>,
    current_zoom: Mutex<f64>,
    hook: Mutex<Option<Arc<dyn BufferVisibilityHook>>>,
    toggles: broadcast::Sender<LayerToggle>,
    hints: broadcast::Sender<ZoomHint>,
}

impl ZoomVisibilityManager {
    pub fn new(initial_zoom: f64) -> Self {
        let (toggles, _) = broadcast::channel(EVENT_CAPACITY);
        let (hints, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            layers: Mutex::new(HashMap::new()),
            current_zoom: Mutex::new(initial_zoom),
            hook: Mutex::new(None),
            toggles,
            hints,
        }
    }

    /// Install the buffer side-channel. Explicit service wiring; there are no
    /// globals involved.
    pub fn set_buffer_hook(&self, hook: Arc<dyn BufferVisibilityHook>) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    /// Track a layer. Tower layers default to a minimum zoom of
    /// [`TOWER_MIN_ZOOM`], generic layers to 0 (always permitted).
    pub fn register_layer(
        &self,
        id: LayerId,
        name: &str,
        kind: LayerKind,
        initial_visible: bool,
        custom_min_zoom: Option<f64>,
    ) {
        let min_zoom = custom_min_zoom.unwrap_or(if kind.is_tower() {
            TOWER_MIN_ZOOM
        } else {
            0.0
        });
        let zoom = *self.current_zoom.lock().unwrap();
        self.layers.lock().unwrap().insert(
            id,
            LayerVisibility {
                name: name.to_owned(),
                kind,
                min_zoom,
                user_visible: initial_visible,
                zoom_allowed: zoom >= min_zoom,
            },
        );
    }

    pub fn layer_zoom_status(&self, id: LayerId) -> Option<ZoomStatus> {
        self.layers.lock().unwrap().get(&id).map(|layer| ZoomStatus {
            can_show: layer.zoom_allowed,
            min_zoom: layer.min_zoom,
        })
    }

    /// Effective visibility: user intent AND zoom permission.
    pub fn effective_visibility(&self, id: LayerId) -> bool {
        self.layers
            .lock()
            .unwrap()
            .get(&id)
            .is_some_and(LayerVisibility::effective)
    }

    pub fn subscribe_toggles(&self) -> broadcast::Receiver<LayerToggle> {
        self.toggles.subscribe()
    }

    pub fn subscribe_hints(&self) -> broadcast::Receiver<ZoomHint> {
        self.hints.subscribe()
    }

    /// Recompute every layer's zoom permission against the new zoom level.
    ///
    /// Layers whose effective visibility flips get a `reason: Zoom` toggle;
    /// layers the user wants on but the zoom now suppresses additionally get
    /// a [`ZoomHint`]. Tower-layer flips drive the buffer hook.
    pub fn set_zoom(&self, zoom: f64, map: &dyn MapEngine) {
        *self.current_zoom.lock().unwrap() = zoom;

        struct Transition {
            id: LayerId,
            kind: LayerKind,
            allowed: bool,
            min_zoom: f64,
            name: String,
        }

        let mut transitions = Vec::new();
        {
            let mut layers = self.layers.lock().unwrap();
            for (&id, layer) in layers.iter_mut() {
                let allowed = zoom >= layer.min_zoom;
                if allowed == layer.zoom_allowed {
                    continue;
                }
                layer.zoom_allowed = allowed;
                // Only user-visible layers observably change; permission for
                // a user-hidden layer flips silently.
                if layer.user_visible {
                    transitions.push(Transition {
                        id,
                        kind: layer.kind,
                        allowed,
                        min_zoom: layer.min_zoom,
                        name: layer.name.clone(),
                    });
                }
            }
        }

        let hook = self.hook.lock().unwrap().clone();
        for t in transitions {
            let _ = self.toggles.send(LayerToggle {
                layer_id: t.id,
                visible: t.allowed,
                reason: ToggleReason::Zoom,
            });
            if !t.allowed {
                let _ = self.hints.send(ZoomHint {
                    layer_id: t.id,
                    min_zoom: t.min_zoom,
                    message: format!("Zoom in to level {} to see {}", t.min_zoom, t.name),
                });
            }
            if t.kind.is_tower() {
                if let Some(hook) = &hook {
                    if t.allowed {
                        hook.reapply_for_parent(t.id, map);
                    } else {
                        hook.force_hide_for_parent(t.id, map);
                    }
                }
            }
        }
    }

    /// Record the user's intent for a layer and publish the resulting
    /// effective-visibility change (if any) with `reason: User`.
    ///
    /// Returns the layer's effective visibility afterwards. Turning a layer
    /// on while the zoom suppresses it records the intent, emits a hint, and
    /// changes nothing on the map.
    pub fn set_user_visible(&self, id: LayerId, visible: bool, map: &dyn MapEngine) -> bool {
        let outcome = {
            let mut layers = self.layers.lock().unwrap();
            let Some(layer) = layers.get_mut(&id) else {
                tracing::warn!(layer = id, "user toggle for unregistered layer");
                return false;
            };
            let was_effective = layer.effective();
            layer.user_visible = visible;
            let now_effective = layer.effective();
            (
                was_effective,
                now_effective,
                layer.kind,
                layer.min_zoom,
                layer.name.clone(),
                layer.zoom_allowed,
            )
        };
        let (was_effective, now_effective, kind, min_zoom, name, zoom_allowed) = outcome;

        if visible && !zoom_allowed {
            let _ = self.hints.send(ZoomHint {
                layer_id: id,
                min_zoom,
                message: format!("Zoom in to level {min_zoom} to see {name}"),
            });
        }

        if now_effective != was_effective {
            let _ = self.toggles.send(LayerToggle {
                layer_id: id,
                visible: now_effective,
                reason: ToggleReason::User,
            });
            if kind.is_tower() {
                let hook = self.hook.lock().unwrap().clone();
                if let Some(hook) = hook {
                    if now_effective {
                        hook.reapply_for_parent(id, map);
                    } else {
                        hook.force_hide_for_parent(id, map);
                    }
                }
            }
        }
        now_effective
    }
}
