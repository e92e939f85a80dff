//! Map engine collaborator interface
//!
//! The rendering surface is external to this crate: it can add and remove
//! renderable primitives and report the current viewport. Everything here is
//! the seam the host glue implements; tests use [`mock::MockMap`].

use geo::{Coord, Rect};

use crate::utils::circle_bbox;

/// Identifier for one rendered primitive on the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderHandle(pub u64);

/// Visual style for a buffer circle, resolved from the company/group palette.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferStyle {
    pub color: String,
    pub fill_opacity: f64,
    pub stroke_weight: f64,
}

impl Default for BufferStyle {
    fn default() -> Self {
        Self {
            color: "#3388ff".to_string(),
            fill_opacity: 0.15,
            stroke_weight: 1.0,
        }
    }
}

/// One renderable buffer circle.
#[derive(Debug, Clone)]
pub struct CircleSpec {
    pub handle: RenderHandle,
    pub center: Coord<f64>,
    pub radius_m: f64,
    /// Precomputed planar bounding box, used for viewport culling.
    pub bbox: Rect<f64>,
    pub style: BufferStyle,
}

impl CircleSpec {
    pub fn new(handle: RenderHandle, center: Coord<f64>, radius_m: f64, style: BufferStyle) -> Self {
        Self {
            handle,
            center,
            radius_m,
            bbox: circle_bbox(center, radius_m),
            style,
        }
    }
}

/// Abstract rendering surface.
///
/// Provided to the core by the host, never implemented here. `bounds` and
/// `zoom` report the current viewport; move/zoom notifications arrive through
/// the host calling [`crate::ViewportCuller::viewport_changed`] and
/// [`crate::ZoomVisibilityManager::set_zoom`].
pub trait MapEngine: Send + Sync {
    fn add_layer(&self, circle: &CircleSpec);
    fn remove_layer(&self, handle: RenderHandle);
    fn has_layer(&self, handle: RenderHandle) -> bool;
    fn bounds(&self) -> Rect<f64>;
    fn zoom(&self) -> f64;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Test double recording which handles are currently rendered.
    pub struct MockMap {
        rendered: Mutex<HashSet<RenderHandle>>,
        bounds: Mutex<Rect<f64>>,
        zoom: Mutex<f64>,
    }

    impl MockMap {
        pub fn new(bounds: Rect<f64>, zoom: f64) -> Self {
            Self {
                rendered: Mutex::new(HashSet::new()),
                bounds: Mutex::new(bounds),
                zoom: Mutex::new(zoom),
            }
        }

        pub fn whole_world(zoom: f64) -> Self {
            Self::new(
                Rect::new(
                    Coord {
                        x: -180.0,
                        y: -85.0,
                    },
                    Coord { x: 180.0, y: 85.0 },
                ),
                zoom,
            )
        }

        pub fn set_bounds(&self, bounds: Rect<f64>) {
            *self.bounds.lock().unwrap() = bounds;
        }

        pub fn set_zoom(&self, zoom: f64) {
            *self.zoom.lock().unwrap() = zoom;
        }

        pub fn rendered_count(&self) -> usize {
            self.rendered.lock().unwrap().len()
        }

        pub fn rendered_handles(&self) -> HashSet<RenderHandle> {
            self.rendered.lock().unwrap().clone()
        }
    }

    impl MapEngine for MockMap {
        fn add_layer(&self, circle: &CircleSpec) {
            self.rendered.lock().unwrap().insert(circle.handle);
        }

        fn remove_layer(&self, handle: RenderHandle) {
            self.rendered.lock().unwrap().remove(&handle);
        }

        fn has_layer(&self, handle: RenderHandle) -> bool {
            self.rendered.lock().unwrap().contains(&handle)
        }

        fn bounds(&self) -> Rect<f64> {
            *self.bounds.lock().unwrap()
        }

        fn zoom(&self) -> f64 {
            *self.zoom.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockMap;
    use super::*;

    #[test]
    fn mock_map_tracks_rendered_handles() {
        let map = MockMap::whole_world(10.0);
        let circle = CircleSpec::new(
            RenderHandle(1),
            Coord { x: 0.0, y: 0.0 },
            3_218.68,
            BufferStyle::default(),
        );

        assert!(!map.has_layer(circle.handle));
        map.add_layer(&circle);
        assert!(map.has_layer(circle.handle));
        map.remove_layer(circle.handle);
        assert_eq!(map.rendered_count(), 0);
    }
}
