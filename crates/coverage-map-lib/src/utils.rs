//! Utility functions for planar distance conversions and viewport math

use geo::{Coord, Rect};

/// Planar approximation: meters per degree of latitude (and of longitude at
/// the equator). Buffer radii do not require projection exactness.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Meters per ring distance unit (statute mile).
pub const METERS_PER_MILE: f64 = 1_609.34;

/// Convert a radius in meters to degrees under the planar approximation.
#[inline]
pub fn meters_to_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEGREE
}

/// Axis-aligned bounding box of a circle centered at `center` (degrees) with
/// the given radius in meters.
#[inline]
pub fn circle_bbox(center: Coord<f64>, radius_m: f64) -> Rect<f64> {
    let r = meters_to_degrees(radius_m);
    Rect::new(
        Coord {
            x: center.x - r,
            y: center.y - r,
        },
        Coord {
            x: center.x + r,
            y: center.y + r,
        },
    )
}

/// Expand a rect by `factor` around its center (1.0 = unchanged).
pub fn expand_rect(rect: Rect<f64>, factor: f64) -> Rect<f64> {
    let center = rect.center();
    let half_w = rect.width() / 2.0 * factor;
    let half_h = rect.height() / 2.0 * factor;
    Rect::new(
        Coord {
            x: center.x - half_w,
            y: center.y - half_h,
        },
        Coord {
            x: center.x + half_w,
            y: center.y + half_h,
        },
    )
}

/// Axis-aligned intersection test.
#[inline]
pub fn rects_intersect(a: &Rect<f64>, b: &Rect<f64>) -> bool {
    a.min().x <= b.max().x && a.max().x >= b.min().x && a.min().y <= b.max().y && a.max().y >= b.min().y
}

/// Whether two viewports differ by less than `eps` degrees on every corner
/// coordinate. Used to suppress recomputation from minor pan jitter.
pub fn rects_similar(a: &Rect<f64>, b: &Rect<f64>, eps: f64) -> bool {
    (a.min().x - b.min().x).abs() < eps
        && (a.min().y - b.min().y).abs() < eps
        && (a.max().x - b.max().x).abs() < eps
        && (a.max().y - b.max().y).abs() < eps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Rect<f64> {
        Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y })
    }

    #[test]
    fn circle_bbox_is_centered() {
        let bbox = circle_bbox(Coord { x: 10.0, y: 20.0 }, METERS_PER_DEGREE);
        assert!((bbox.min().x - 9.0).abs() < 1e-9);
        assert!((bbox.max().y - 21.0).abs() < 1e-9);
    }

    #[test]
    fn expand_rect_grows_around_center() {
        let r = expand_rect(rect(0.0, 0.0, 2.0, 2.0), 1.5);
        assert!((r.min().x - -0.5).abs() < 1e-9);
        assert!((r.max().x - 2.5).abs() < 1e-9);
        let center = r.center();
        assert!((center.x - 1.0).abs() < 1e-9);
    }

    #[test]
    fn intersection_includes_touching_edges() {
        let a = rect(0.0, 0.0, 1.0, 1.0);
        let b = rect(1.0, 1.0, 2.0, 2.0);
        let c = rect(1.1, 1.1, 2.0, 2.0);
        assert!(rects_intersect(&a, &b));
        assert!(!rects_intersect(&a, &c));
    }

    #[test]
    fn similarity_uses_all_corners() {
        let a = rect(0.0, 0.0, 1.0, 1.0);
        let jitter = rect(0.001, 0.0005, 1.001, 1.0005);
        let pan = rect(0.5, 0.0, 1.5, 1.0);
        assert!(rects_similar(&a, &jitter, 0.002));
        assert!(!rects_similar(&a, &pan, 0.002));
    }
}
