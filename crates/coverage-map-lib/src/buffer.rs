//! Buffer ring generation around point features
//!
//! For every point feature of a parent layer, one circle per configured ring
//! distance (planar radii). Small rings render directly; large rings go
//! through a [`ViewportCuller`]. A buffer layer's render state is gated by
//! its parent: the user flag is always remembered, but circles only
//! materialize while the parent is effectively visible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::culling::{CullConfig, ViewportCuller};
use crate::layer::{FeatureCollection, LayerId};
use crate::map::{BufferStyle, CircleSpec, MapEngine, RenderHandle};
use crate::utils::METERS_PER_MILE;
use crate::visibility::BufferVisibilityHook;

const EVENT_CAPACITY: usize = 64;

/// Ring distances, unit conversion, and styling.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Ring distances in `meters_per_unit` units, one buffer layer each.
    pub distances: Vec<f64>,
    /// Planar conversion from ring distance units to meters.
    pub meters_per_unit: f64,
    /// Point counts at or below this render directly, above it through a
    /// culler.
    pub direct_limit: usize,
    /// Style per company/group key; unknown keys fall back to
    /// `default_style`.
    pub palette: HashMap<String, BufferStyle>,
    pub default_style: BufferStyle,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            distances: vec![2.0, 5.0],
            meters_per_unit: METERS_PER_MILE,
            direct_limit: 100,
            palette: HashMap::new(),
            default_style: BufferStyle::default(),
        }
    }
}

impl BufferConfig {
    fn style_for(&self, group: Option<&str>) -> BufferStyle {
        group
            .and_then(|key| self.palette.get(key))
            .unwrap_or(&self.default_style)
            .clone()
    }
}

/// Outcome of generating one buffer layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSummary {
    pub id: String,
    pub parent_layer_id: LayerId,
    pub distance: f64,
    pub circle_count: usize,
    /// True when the set exceeded the direct limit and renders through a
    /// culler.
    pub culled: bool,
}

/// Render-state change for one buffer layer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferVisibility {
    pub buffer_id: String,
    pub user_visible: bool,
    pub rendered: bool,
}

struct VirtualBufferLayer {
    parent_layer_id: LayerId,
    circles: Vec<CircleSpec>,
    user_visible: bool,
    rendered: bool,
    culler: Option<Arc<ViewportCuller>>,
}

impl VirtualBufferLayer {
    fn materialize(&mut self, map: &dyn MapEngine) {
        if self.rendered {
            return;
        }
        match &self.culler {
            Some(culler) => culler.activate(),
            None => {
                for circle in &self.circles {
                    map.add_layer(circle);
                }
            }
        }
        self.rendered = true;
    }

    fn dematerialize(&mut self, map: &dyn MapEngine) {
        if !self.rendered {
            return;
        }
        match &self.culler {
            Some(culler) => culler.deactivate(),
            None => {
                for circle in &self.circles {
                    map.remove_layer(circle.handle);
                }
            }
        }
        self.rendered = false;
    }
}

/// Owns every virtual buffer layer and its render state.
pub struct BufferLayerManager {
    config: BufferConfig,
    cull_config: CullConfig,
    buffers: Mutex<HashMap<String, VirtualBufferLayer>>,
    next_handle: AtomicU64,
    visibility: broadcast::Sender<BufferVisibility>,
}

impl BufferLayerManager {
    pub fn new(config: BufferConfig) -> Self {
        let (visibility, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            cull_config: CullConfig::default(),
            buffers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            visibility,
        }
    }

    pub fn with_cull_config(mut self, cull_config: CullConfig) -> Self {
        self.cull_config = cull_config;
        self
    }

    pub fn subscribe_visibility(&self) -> broadcast::Receiver<BufferVisibility> {
        self.visibility.subscribe()
    }

    fn buffer_id(parent_id: LayerId, distance: f64) -> String {
        format!("layer-{parent_id}-buffer-{distance}")
    }

    /// Cullers of this parent's buffer layers, for host glue that forwards
    /// viewport changes.
    pub fn cullers_for_parent(&self, parent_id: LayerId) -> Vec<Arc<ViewportCuller>> {
        self.buffers
            .lock()
            .unwrap()
            .values()
            .filter(|b| b.parent_layer_id == parent_id)
            .filter_map(|b| b.culler.clone())
            .collect()
    }

    /// Build one buffer layer per configured ring distance from the parent's
    /// point features and materialize them.
    ///
    /// Regeneration is idempotent: any previous buffers for this parent are
    /// torn down first. Non-point and malformed features contribute no
    /// circles.
    pub fn generate_buffers_from_features(
        &self,
        features: &FeatureCollection,
        parent_id: LayerId,
        parent_name: &str,
        map: &Arc<dyn MapEngine>,
    ) -> Vec<BufferSummary> {
        self.teardown_for_parent(parent_id, map.as_ref());

        let centers: Vec<_> = features
            .features
            .iter()
            .filter_map(|f| {
                let center = f.geometry.as_ref()?.point()?;
                Some((center, self.config.style_for(f.group_key())))
            })
            .collect();

        let mut summaries = Vec::with_capacity(self.config.distances.len());
        let mut buffers = self.buffers.lock().unwrap();
        for &distance in &self.config.distances {
            let radius_m = distance * self.config.meters_per_unit;
            let circles: Vec<CircleSpec> = centers
                .iter()
                .map(|(center, style)| {
                    let handle = RenderHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
                    CircleSpec::new(handle, *center, radius_m, style.clone())
                })
                .collect();

            let id = Self::buffer_id(parent_id, distance);
            let culled = circles.len() > self.config.direct_limit;
            let culler = culled.then(|| {
                let culler = Arc::new(ViewportCuller::new(
                    Arc::clone(map),
                    self.cull_config.clone(),
                ));
                culler.set_specs(circles.clone());
                culler
            });

            let mut layer = VirtualBufferLayer {
                parent_layer_id: parent_id,
                circles,
                user_visible: true,
                rendered: false,
                culler,
            };
            layer.materialize(map.as_ref());

            summaries.push(BufferSummary {
                id: id.clone(),
                parent_layer_id: parent_id,
                distance,
                circle_count: layer.circles.len(),
                culled,
            });
            buffers.insert(id, layer);
        }
        drop(buffers);

        tracing::debug!(
            parent = parent_id,
            parent_name,
            points = centers.len(),
            rings = self.config.distances.len(),
            "generated buffer layers"
        );
        summaries
    }

    /// Record the user flag for one buffer layer and materialize it only when
    /// both the flag and the parent's effective visibility allow.
    ///
    /// Returns whether the buffer is rendered afterwards.
    pub fn toggle_buffer_layer(
        &self,
        buffer_id: &str,
        visible: bool,
        map: &dyn MapEngine,
        parent_visible: bool,
    ) -> bool {
        let mut buffers = self.buffers.lock().unwrap();
        let Some(layer) = buffers.get_mut(buffer_id) else {
            tracing::warn!(buffer_id, "toggle for unknown buffer layer");
            return false;
        };

        layer.user_visible = visible;
        if visible && parent_visible {
            layer.materialize(map);
        } else {
            layer.dematerialize(map);
        }
        let event = BufferVisibility {
            buffer_id: buffer_id.to_owned(),
            user_visible: layer.user_visible,
            rendered: layer.rendered,
        };
        let rendered = layer.rendered;
        drop(buffers);
        let _ = self.visibility.send(event);
        rendered
    }

    fn teardown_for_parent(&self, parent_id: LayerId, map: &dyn MapEngine) {
        let mut buffers = self.buffers.lock().unwrap();
        buffers.retain(|_, layer| {
            if layer.parent_layer_id != parent_id {
                return true;
            }
            layer.dematerialize(map);
            false
        });
    }
}

impl BufferVisibilityHook for BufferLayerManager {
    /// Render-state-only hide: every buffer of the parent comes off the map,
    /// user flags untouched.
    fn force_hide_for_parent(&self, parent_id: LayerId, map: &dyn MapEngine) {
        let mut buffers = self.buffers.lock().unwrap();
        for layer in buffers.values_mut() {
            if layer.parent_layer_id == parent_id {
                layer.dematerialize(map);
            }
        }
    }

    /// Re-apply each buffer's own remembered flag; never forces anything on.
    fn reapply_for_parent(&self, parent_id: LayerId, map: &dyn MapEngine) {
        let mut buffers = self.buffers.lock().unwrap();
        for layer in buffers.values_mut() {
            if layer.parent_layer_id == parent_id {
                if layer.user_visible {
                    layer.materialize(map);
                } else {
                    layer.dematerialize(map);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::{Feature, Geometry};
    use crate::map::mock::MockMap;

    fn point(id: i64, x: f64, y: f64, company: Option<&str>) -> Feature {
        let mut properties = serde_json::Map::new();
        if let Some(company) = company {
            properties.insert("company".into(), company.into());
        }
        Feature {
            id: Some(id),
            geometry: Some(Geometry::Point {
                coordinates: [x, y],
            }),
            properties,
        }
    }

    fn towers(count: usize) -> FeatureCollection {
        FeatureCollection {
            features: (0..count)
                .map(|i| point(i as i64, i as f64 * 0.01, 0.0, None))
                .collect(),
        }
    }

    fn world_map(zoom: f64) -> (Arc<MockMap>, Arc<dyn MapEngine>) {
        let mock = Arc::new(MockMap::whole_world(zoom));
        let map: Arc<dyn MapEngine> = mock.clone();
        (mock, map)
    }

    #[tokio::test(start_paused = true)]
    async fn one_circle_per_point_per_ring_distance() {
        let manager = BufferLayerManager::new(BufferConfig::default());
        let (mock, map) = world_map(12.0);

        let summaries =
            manager.generate_buffers_from_features(&towers(3), 7, "Cell Towers", &map);

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, "layer-7-buffer-2");
        assert_eq!(summaries[1].id, "layer-7-buffer-5");
        assert!(summaries.iter().all(|s| s.circle_count == 3 && !s.culled));
        assert_eq!(mock.rendered_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn regeneration_is_idempotent() {
        let manager = BufferLayerManager::new(BufferConfig::default());
        let (mock, map) = world_map(12.0);

        manager.generate_buffers_from_features(&towers(3), 7, "Cell Towers", &map);
        let again = manager.generate_buffers_from_features(&towers(3), 7, "Cell Towers", &map);

        assert_eq!(again.len(), 2);
        assert_eq!(mock.rendered_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn non_point_features_contribute_no_circles() {
        let manager = BufferLayerManager::new(BufferConfig::default());
        let (_mock, map) = world_map(12.0);

        let mut features = towers(2);
        features.features.push(Feature {
            id: Some(99),
            geometry: Some(Geometry::Polygon {
                coordinates: vec![vec![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]]],
            }),
            properties: serde_json::Map::new(),
        });
        features.features.push(Feature {
            id: Some(100),
            geometry: None,
            properties: serde_json::Map::new(),
        });

        let summaries =
            manager.generate_buffers_from_features(&features, 7, "Cell Towers", &map);
        assert!(summaries.iter().all(|s| s.circle_count == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn large_sets_route_through_the_culler() {
        let manager = BufferLayerManager::new(BufferConfig {
            distances: vec![2.0],
            ..BufferConfig::default()
        });
        let (mock, map) = world_map(9.0); // below the culling zoom: everything renders

        let summaries =
            manager.generate_buffers_from_features(&towers(150), 7, "Cell Towers", &map);

        assert!(summaries[0].culled);
        assert_eq!(summaries[0].circle_count, 150);
        assert_eq!(mock.rendered_count(), 150);
        assert_eq!(manager.cullers_for_parent(7).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn company_palette_styles_circles_with_default_fallback() {
        let mut palette = HashMap::new();
        palette.insert(
            "acme".to_string(),
            BufferStyle {
                color: "#ff0000".to_string(),
                ..BufferStyle::default()
            },
        );
        let manager = BufferLayerManager::new(BufferConfig {
            distances: vec![2.0],
            palette,
            ..BufferConfig::default()
        });
        let (_mock, map) = world_map(12.0);

        let features = FeatureCollection {
            features: vec![
                point(1, 0.0, 0.0, Some("acme")),
                point(2, 0.1, 0.0, Some("unknown")),
            ],
        };
        manager.generate_buffers_from_features(&features, 7, "Cell Towers", &map);

        let buffers = manager.buffers.lock().unwrap();
        let layer = &buffers["layer-7-buffer-2"];
        assert_eq!(layer.circles[0].style.color, "#ff0000");
        assert_eq!(layer.circles[1].style.color, BufferStyle::default().color);
    }

    #[tokio::test(start_paused = true)]
    async fn a_buffer_never_renders_without_its_parent() {
        let manager = BufferLayerManager::new(BufferConfig::default());
        let (mock, map) = world_map(12.0);
        manager.generate_buffers_from_features(&towers(3), 7, "Cell Towers", &map);
        manager.force_hide_for_parent(7, map.as_ref());
        assert_eq!(mock.rendered_count(), 0);

        // User flag is recorded but nothing materializes while the parent is
        // hidden.
        let rendered =
            manager.toggle_buffer_layer("layer-7-buffer-2", true, map.as_ref(), false);
        assert!(!rendered);
        assert_eq!(mock.rendered_count(), 0);

        manager.reapply_for_parent(7, map.as_ref());
        assert_eq!(mock.rendered_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn reapply_restores_exactly_the_user_flagged_buffers() {
        let manager = BufferLayerManager::new(BufferConfig::default());
        let (mock, map) = world_map(12.0);
        manager.generate_buffers_from_features(&towers(3), 7, "Cell Towers", &map);

        // User turns the 5-unit ring off, then zoom hides the parent.
        manager.toggle_buffer_layer("layer-7-buffer-5", false, map.as_ref(), true);
        assert_eq!(mock.rendered_count(), 3);
        manager.force_hide_for_parent(7, map.as_ref());
        assert_eq!(mock.rendered_count(), 0);

        // Zoom shows the parent again: only the 2-unit ring comes back.
        manager.reapply_for_parent(7, map.as_ref());
        assert_eq!(mock.rendered_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn toggles_publish_visibility_events() {
        let manager = BufferLayerManager::new(BufferConfig::default());
        let (_mock, map) = world_map(12.0);
        manager.generate_buffers_from_features(&towers(1), 7, "Cell Towers", &map);
        let mut events = manager.subscribe_visibility();

        manager.toggle_buffer_layer("layer-7-buffer-2", false, map.as_ref(), true);
        assert_eq!(
            events.try_recv().unwrap(),
            BufferVisibility {
                buffer_id: "layer-7-buffer-2".to_string(),
                user_visible: false,
                rendered: false,
            }
        );
    }
}
