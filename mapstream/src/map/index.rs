//! R-tree over map bounding boxes in lon/lat degrees

use std::collections::HashMap;

use rstar::{RTree, RTreeObject, AABB};

use super::MapId;
use crate::geo::Bbox;

/// Entry in the spatial index: a map id and its lon/lat bounding box
#[derive(Debug, Clone, PartialEq)]
struct MapEntry {
    id: MapId,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for MapEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn to_aabb(bbox: &Bbox) -> AABB<[f64; 2]> {
    AABB::from_corners([bbox.min_x, bbox.min_y], [bbox.max_x, bbox.max_y])
}

/// Spatial index used to cull maps against the viewport
#[derive(Default)]
pub struct SpatialMapIndex {
    tree: RTree<MapEntry>,
    envelopes: HashMap<MapId, AABB<[f64; 2]>>,
}

impl SpatialMapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a map, replacing any previous geometry for the same id
    pub fn upsert(&mut self, id: &MapId, bbox: &Bbox) {
        self.remove(id);
        let envelope = to_aabb(bbox);
        self.tree.insert(MapEntry { id: id.clone(), envelope });
        self.envelopes.insert(id.clone(), envelope);
    }

    pub fn remove(&mut self, id: &MapId) -> bool {
        match self.envelopes.remove(id) {
            Some(envelope) => self
                .tree
                .remove(&MapEntry { id: id.clone(), envelope })
                .is_some(),
            None => false,
        }
    }

    /// Ids whose bounding box intersects `bbox`, in no particular order
    pub fn query(&self, bbox: &Bbox) -> Vec<MapId> {
        self.tree
            .locate_in_envelope_intersecting(&to_aabb(bbox))
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn contains(&self, id: &MapId) -> bool {
        self.envelopes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn clear(&mut self) {
        self.tree = RTree::new();
        self.envelopes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_after_upsert_moves_entry() {
        let mut index = SpatialMapIndex::new();
        let id: MapId = "a".into();
        index.upsert(&id, &Bbox::new(0.0, 0.0, 1.0, 1.0));
        assert_eq!(index.query(&Bbox::new(0.5, 0.5, 2.0, 2.0)), vec![id.clone()]);

        index.upsert(&id, &Bbox::new(10.0, 10.0, 11.0, 11.0));
        assert!(index.query(&Bbox::new(0.5, 0.5, 2.0, 2.0)).is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut index = SpatialMapIndex::new();
        let id: MapId = "a".into();
        index.upsert(&id, &Bbox::new(0.0, 0.0, 1.0, 1.0));
        assert!(index.remove(&id));
        assert!(!index.remove(&id));
        assert!(index.is_empty());
        assert!(index.query(&Bbox::new(-5.0, -5.0, 5.0, 5.0)).is_empty());
    }
}
