//! Layer descriptors, the feature data model, and the chunk wire format
//!
//! Layers are identified by a numeric id; towers are an explicit
//! classification on the descriptor rather than a property of the name.
//! Features follow the GeoJSON shape the chunk endpoint serves.

use geo::{Coord, Rect};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Stable numeric layer identifier.
pub type LayerId = u32;

/// Explicit layer classification.
///
/// The upstream system classified tower layers by substring-matching display
/// names; that partition is preserved by [`LayerKind::from_legacy_name`] but
/// new callers should always set the kind explicitly on the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Generic,
    Tower,
}

impl LayerKind {
    /// Reproduce the legacy display-name partition ("tower" substring,
    /// case-insensitive). Known fragility: a generic layer renamed to contain
    /// the word becomes a tower layer. Kept only for descriptors arriving
    /// from sources that never stored an explicit kind.
    pub fn from_legacy_name(name: &str) -> Self {
        if name.to_ascii_lowercase().contains("tower") {
            LayerKind::Tower
        } else {
            LayerKind::Generic
        }
    }

    pub fn is_tower(self) -> bool {
        matches!(self, LayerKind::Tower)
    }
}

/// Static description of one map layer.
#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    pub id: LayerId,
    pub name: String,
    pub kind: LayerKind,
    /// Layers visible on project open load at elevated priority.
    pub visible_by_default: bool,
}

impl LayerDescriptor {
    /// Base scheduling priority for this layer's chunks (lower = more
    /// urgent). Default-visible layers gate the first paint.
    pub fn base_priority(&self) -> i32 {
        if self.visible_by_default { 5 } else { 10 }
    }
}

/// GeoJSON-shaped geometry. Only the variants the chunk endpoint serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: [f64; 2] },
    Polygon { coordinates: Vec<Vec<[f64; 2]>> },
}

impl Geometry {
    /// A geometry is well-formed when every coordinate is finite.
    pub fn is_well_formed(&self) -> bool {
        match self {
            Geometry::Point { coordinates } => coordinates.iter().all(|c| c.is_finite()),
            Geometry::Polygon { coordinates } => coordinates
                .iter()
                .flatten()
                .all(|pair| pair.iter().all(|c| c.is_finite())),
        }
    }

    /// Center coordinate for point geometries.
    pub fn point(&self) -> Option<Coord<f64>> {
        match self {
            Geometry::Point { coordinates } => Some(Coord {
                x: coordinates[0],
                y: coordinates[1],
            }),
            Geometry::Polygon { .. } => None,
        }
    }
}

/// One feature as served by the chunk endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Feature {
    /// Company/group key used for buffer styling, when present.
    pub fn group_key(&self) -> Option<&str> {
        self.properties.get("company").and_then(|v| v.as_str())
    }
}

/// Merged feature set for one layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Merge a chunk into the collection.
    ///
    /// Order-independent (plain concatenation) so chunks within a batch can
    /// complete in any order. Features carrying an id are deduplicated so a
    /// server that repeats features across chunks cannot inflate the merge;
    /// malformed features (no geometry, non-finite coordinates) are skipped
    /// with a diagnostic.
    pub fn merge_chunk(&mut self, features: Vec<Feature>, seen_ids: &mut HashSet<i64>) {
        for feature in features {
            match &feature.geometry {
                Some(geometry) if geometry.is_well_formed() => {}
                _ => {
                    tracing::warn!(feature_id = ?feature.id, "skipping malformed feature");
                    continue;
                }
            }
            if let Some(id) = feature.id {
                if !seen_ids.insert(id) {
                    continue;
                }
            }
            self.features.push(feature);
        }
    }
}

/// Pagination metadata attached to a chunk response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkInfo {
    #[serde(default)]
    pub next_chunk: Option<u32>,
}

/// One chunk as served by the data endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub chunk_info: Option<ChunkInfo>,
}

impl ChunkEnvelope {
    /// Next chunk to request, normalized: `next_chunk` of 0 or absent means
    /// the pagination is complete.
    pub fn continuation(&self) -> Option<u32> {
        self.chunk_info
            .as_ref()
            .and_then(|info| info.next_chunk)
            .filter(|&n| n > 0)
    }
}

/// Viewport context attached to chunk requests as a server-side filter hint.
#[derive(Debug, Clone, Copy)]
pub struct ViewContext {
    pub bounds: Rect<f64>,
    pub zoom: u8,
}

impl ViewContext {
    /// Bounds query parameter: "minLng,minLat,maxLng,maxLat".
    pub fn bounds_param(&self) -> String {
        format!(
            "{},{},{},{}",
            self.bounds.min().x,
            self.bounds.min().y,
            self.bounds.max().x,
            self.bounds.max().y
        )
    }
}
