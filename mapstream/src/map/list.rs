//! The authoritative collection of warped maps, their z-order and spatial index

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::events::Event;
use super::index::SpatialMapIndex;
use super::options::{MapOptions, OptionKey, OptionLayers};
use super::tile::ImageInfo;
use super::warped::{GeoreferencedMap, WarpedMap};
use super::MapId;
use crate::error::{Error, Result};
use crate::geo::{convex_hull, Bbox, Point, Projection, Ring};
use crate::transform::{PolynomialFactory, TransformerFactory};

/// Options a presentation layer is expected to transition smoothly
pub const ANIMATED_OPTIONS: [OptionKey; 3] = [
    OptionKey::TransformationType,
    OptionKey::Projection,
    OptionKey::Opacity,
];

/// Offset applied after doubling indices in `bring_forward`/`send_backward`
const STEP_OFFSET: i64 = 3;

/// Filter for selection queries
#[derive(Clone, Debug, Default)]
pub struct Selection {
    /// Takes precedence over `lon_lat_bbox`
    pub ids: Option<Vec<MapId>>,
    pub only_visible: bool,
    pub lon_lat_bbox: Option<Bbox>,
}

impl Selection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ids(ids: impl IntoIterator<Item = MapId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn in_bbox(lon_lat_bbox: Bbox) -> Self {
        Self {
            lon_lat_bbox: Some(lon_lat_bbox),
            ..Default::default()
        }
    }

    pub fn visible(mut self) -> Self {
        self.only_visible = true;
        self
    }
}

pub struct WarpedMapList {
    maps: HashMap<MapId, WarpedMap>,
    z_indices: HashMap<MapId, i64>,
    index: Option<SpatialMapIndex>,
    options: OptionLayers,
    factory: Box<dyn TransformerFactory>,
    max_geometry_warnings: u32,
    events: Vec<Event>,
}

impl Default for WarpedMapList {
    fn default() -> Self {
        Self::new(Box::new(PolynomialFactory), true)
    }
}

impl WarpedMapList {
    pub fn new(factory: Box<dyn TransformerFactory>, spatial_index: bool) -> Self {
        Self {
            maps: HashMap::new(),
            z_indices: HashMap::new(),
            index: spatial_index.then(SpatialMapIndex::new),
            options: OptionLayers::default(),
            factory,
            max_geometry_warnings: 5,
            events: Vec::new(),
        }
    }

    pub fn set_max_geometry_warnings(&mut self, max: u32) {
        self.max_geometry_warnings = max;
    }

    /// Drain events emitted since the last call
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn contains(&self, id: &MapId) -> bool {
        self.maps.contains_key(id)
    }

    pub fn get_map(&self, id: &MapId) -> Option<&WarpedMap> {
        self.maps.get(id)
    }

    pub fn get_map_mut(&mut self, id: &MapId) -> Option<&mut WarpedMap> {
        self.maps.get_mut(id)
    }

    pub fn spatial_index(&self) -> Option<&SpatialMapIndex> {
        self.index.as_ref()
    }

    // Lifecycle

    /// Validate and add a map; it is placed on top of the z-order
    pub fn add_map(&mut self, georeference: GeoreferencedMap) -> Result<MapId> {
        georeference.validate()?;
        let id = georeference.map_id()?;

        let own = MapOptions {
            transformation_type: georeference.transformation.map(|t| t.kind),
            ..Default::default()
        };
        let resolved = self.options.preview(&own);
        // On failure an existing map with the same id stays untouched
        let map = WarpedMap::new(id.clone(), georeference, resolved, self.factory.as_ref())?;

        self.options.remove_map(&id);
        self.options.set_map(&id, &own);
        if let Some(index) = &mut self.index {
            index.upsert(&id, &map.lon_lat_bbox());
        }
        self.maps.insert(id.clone(), map);
        self.z_indices.remove(&id);
        self.z_indices.insert(id.clone(), self.z_indices.len() as i64);
        self.renumber();

        log::info!("Added map {id}");
        self.events.push(Event::MapAdded(id.clone()));
        Ok(id)
    }

    /// Add several maps; failures don't affect the other items
    pub fn add_from_batch(&mut self, georeferences: impl IntoIterator<Item = GeoreferencedMap>) -> Vec<Result<MapId>> {
        georeferences.into_iter().map(|g| self.add_map(g)).collect()
    }

    /// Remove the map described by a georeference
    pub fn remove_map(&mut self, georeference: &GeoreferencedMap) -> Result<MapId> {
        let id = georeference.map_id()?;
        self.remove_map_by_id(&id)
    }

    pub fn remove_map_by_id(&mut self, id: &MapId) -> Result<MapId> {
        if self.maps.remove(id).is_none() {
            return Err(Error::NotFound(id.clone()));
        }
        self.z_indices.remove(id);
        if let Some(index) = &mut self.index {
            index.remove(id);
        }
        self.options.remove_map(id);
        self.renumber();

        log::info!("Removed map {id}");
        self.events.push(Event::MapRemoved(id.clone()));
        Ok(id.clone())
    }

    /// Remove several maps, collecting per-item results
    pub fn remove_from_batch<'a>(
        &mut self,
        georeferences: impl IntoIterator<Item = &'a GeoreferencedMap>,
    ) -> Vec<Result<MapId>> {
        georeferences.into_iter().map(|g| self.remove_map(g)).collect()
    }

    pub fn clear(&mut self) {
        self.maps.clear();
        self.z_indices.clear();
        if let Some(index) = &mut self.index {
            index.clear();
        }
        self.options.clear_maps();
        log::info!("Cleared map list");
        self.events.push(Event::Cleared);
    }

    pub fn set_image_info(&mut self, id: &MapId, info: Arc<ImageInfo>) -> Result<()> {
        let map = self.maps.get_mut(id).ok_or_else(|| Error::NotFound(id.clone()))?;
        map.set_image_info(info);
        Ok(())
    }

    // Selection

    /// Maps matching `selection`, bottom of the z-order first
    pub fn select(&self, selection: &Selection) -> Vec<&WarpedMap> {
        let mut maps: Vec<&WarpedMap> = if let Some(ids) = &selection.ids {
            let mut seen = HashSet::new();
            ids.iter()
                .filter(|id| seen.insert(*id))
                .filter_map(|id| self.maps.get(id))
                .collect()
        } else if let Some(bbox) = &selection.lon_lat_bbox {
            match &self.index {
                Some(index) => index
                    .query(bbox)
                    .iter()
                    .filter_map(|id| self.maps.get(id))
                    .collect(),
                None => self
                    .maps
                    .values()
                    .filter(|m| m.lon_lat_bbox().intersects(bbox))
                    .collect(),
            }
        } else {
            self.maps.values().collect()
        };

        if selection.only_visible {
            maps.retain(|m| m.is_visible());
        }
        maps.sort_by_key(|m| (self.z_indices.get(&m.id).copied().unwrap_or(i64::MAX), m.id.clone()));
        maps
    }

    pub fn get_map_ids(&self, selection: &Selection) -> Vec<MapId> {
        self.select(selection).into_iter().map(|m| m.id.clone()).collect()
    }

    pub fn get_maps(&self, selection: &Selection) -> Vec<&WarpedMap> {
        self.select(selection)
    }

    fn geo_mask_points(&self, selection: &Selection, target: Option<Projection>) -> Vec<Point> {
        self.select(selection)
            .into_iter()
            .flat_map(|m| {
                let from = m.projection();
                m.projected_geo_mask()
                    .iter()
                    .map(move |p| match target {
                        Some(to) => from.reproject(*p, to),
                        None => from.to_lon_lat(*p),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Bbox of the selected warped masks, in lon/lat or in `target`
    pub fn get_maps_bbox(&self, selection: &Selection, target: Option<Projection>) -> Option<Bbox> {
        Bbox::from_points(&self.geo_mask_points(selection, target))
    }

    pub fn get_maps_center(&self, selection: &Selection, target: Option<Projection>) -> Option<Point> {
        self.get_maps_bbox(selection, target).map(|b| b.center())
    }

    pub fn get_maps_convex_hull(&self, selection: &Selection, target: Option<Projection>) -> Option<Ring> {
        let hull = convex_hull(&self.geo_mask_points(selection, target));
        (!hull.is_empty()).then_some(hull)
    }

    // Z-order

    pub fn get_z_index(&self, id: &MapId) -> Option<usize> {
        self.z_indices.get(id).map(|z| *z as usize)
    }

    /// Ids bottom to top
    pub fn ordered_ids(&self) -> Vec<MapId> {
        let mut ids: Vec<(&MapId, i64)> = self.z_indices.iter().map(|(id, z)| (id, *z)).collect();
        ids.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn known_unique(&self, ids: &[MapId]) -> Vec<MapId> {
        let mut seen = HashSet::new();
        ids.iter()
            .filter(|id| self.z_indices.contains_key(*id) && seen.insert(*id))
            .cloned()
            .collect()
    }

    pub fn bring_to_front(&mut self, ids: &[MapId]) {
        let ids = self.known_unique(ids);
        let start = self.z_indices.len() as i64;
        for (i, id) in ids.iter().enumerate() {
            self.z_indices.insert(id.clone(), start + i as i64);
        }
        self.finish_reorder(ids);
    }

    pub fn send_to_back(&mut self, ids: &[MapId]) {
        let ids = self.known_unique(ids);
        let start = -(ids.len() as i64);
        for (i, id) in ids.iter().enumerate() {
            self.z_indices.insert(id.clone(), start + i as i64);
        }
        self.finish_reorder(ids);
    }

    pub fn bring_forward(&mut self, ids: &[MapId]) {
        self.step(ids, STEP_OFFSET);
    }

    pub fn send_backward(&mut self, ids: &[MapId]) {
        self.step(ids, -STEP_OFFSET);
    }

    fn step(&mut self, ids: &[MapId], offset: i64) {
        let ids = self.known_unique(ids);
        // Doubling leaves a gap of 2 between neighbours so +-3 passes exactly one
        for z in self.z_indices.values_mut() {
            *z *= 2;
        }
        for id in &ids {
            if let Some(z) = self.z_indices.get_mut(id) {
                *z += offset;
            }
        }
        self.finish_reorder(ids);
    }

    fn finish_reorder(&mut self, ids: Vec<MapId>) {
        self.renumber();
        if !ids.is_empty() {
            self.events.push(Event::ZIndicesChanged(ids));
        }
    }

    /// Reassign dense indices `0..N` keeping the current relative order
    fn renumber(&mut self) {
        for (z, id) in self.ordered_ids().into_iter().enumerate() {
            self.z_indices.insert(id, z as i64);
        }
    }

    // Visibility

    pub fn show(&mut self, ids: &[MapId]) {
        self.set_visible(ids, true);
    }

    pub fn hide(&mut self, ids: &[MapId]) {
        self.set_visible(ids, false);
    }

    fn set_visible(&mut self, ids: &[MapId], visible: bool) {
        let changed: Vec<MapId> = self
            .known_unique(ids)
            .into_iter()
            .filter(|id| self.maps.get_mut(id).is_some_and(|m| m.set_visible(visible)))
            .collect();
        if !changed.is_empty() {
            self.events.push(Event::VisibilityChanged(changed));
        }
    }

    // Options

    pub fn set_map_options(&mut self, ids: &[MapId], options: &MapOptions) {
        let ids = self.known_unique(ids);
        for id in &ids {
            self.options.set_map(id, options);
        }
        self.propagate_options(ids);
    }

    pub fn set_list_options(&mut self, options: MapOptions) {
        self.options.set_list(options);
        self.propagate_options(self.ordered_ids());
    }

    pub fn set_default_options(&mut self, options: MapOptions) {
        self.options.set_defaults(options);
        self.propagate_options(self.ordered_ids());
    }

    pub fn set_override_options(&mut self, options: MapOptions) {
        self.options.set_overrides(options);
        self.propagate_options(self.ordered_ids());
    }

    pub fn list_options(&self) -> &MapOptions {
        self.options.list()
    }

    /// Apply re-resolved options: prepare, mutate, reindex, then immediate/animated
    fn propagate_options(&mut self, ids: Vec<MapId>) {
        let mut pending = Vec::new();
        let mut all_keys: Vec<OptionKey> = Vec::new();
        for id in ids {
            let Some(map) = self.maps.get(&id) else { continue };
            let resolved = self.options.resolve(&id);
            let keys = map.options().changed_keys(&resolved);
            if keys.is_empty() {
                continue;
            }
            for key in &keys {
                if !all_keys.contains(key) {
                    all_keys.push(*key);
                }
            }
            pending.push((id, resolved));
        }
        if pending.is_empty() {
            return;
        }
        all_keys.sort();
        let map_ids: Vec<MapId> = pending.iter().map(|(id, _)| id.clone()).collect();
        self.events.push(Event::PrepareChange {
            map_ids: map_ids.clone(),
            keys: all_keys.clone(),
        });

        for (id, resolved) in pending {
            let Some(map) = self.maps.get_mut(&id) else { continue };
            let keys = map.apply_options(resolved, self.factory.as_ref(), self.max_geometry_warnings);
            if keys.iter().any(OptionKey::affects_geometry) {
                if let Some(index) = &mut self.index {
                    index.upsert(&id, &map.lon_lat_bbox());
                }
            }
        }

        let (animated, immediate): (Vec<OptionKey>, Vec<OptionKey>) =
            all_keys.into_iter().partition(|k| ANIMATED_OPTIONS.contains(k));
        if !immediate.is_empty() {
            self.events.push(Event::ImmediateChange {
                map_ids: map_ids.clone(),
                keys: immediate,
            });
        }
        if !animated.is_empty() {
            self.events.push(Event::AnimatedChange { map_ids, keys: animated });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::warped::Resource;
    use crate::transform::Gcp;

    fn georef(id: &str, x: f64, y: f64) -> GeoreferencedMap {
        GeoreferencedMap {
            id: Some(id.into()),
            resource: Resource {
                id: format!("img-{id}"),
                width: 100,
                height: 100,
            },
            gcps: vec![
                Gcp { resource: [0.0, 0.0], geo: [x, y + 1.0] },
                Gcp { resource: [100.0, 0.0], geo: [x + 1.0, y + 1.0] },
                Gcp { resource: [0.0, 100.0], geo: [x, y] },
            ],
            resource_mask: Vec::new(),
            transformation: None,
        }
    }

    fn list_of(n: usize) -> WarpedMapList {
        let mut list = WarpedMapList::default();
        for i in 0..n {
            list.add_map(georef(&format!("m{i}"), i as f64 * 2.0, 0.0)).unwrap();
        }
        list.take_events();
        list
    }

    fn ids(names: &[&str]) -> Vec<MapId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_add_assigns_top_z_and_emits() {
        let mut list = WarpedMapList::default();
        let a = list.add_map(georef("a", 0.0, 0.0)).unwrap();
        let b = list.add_map(georef("b", 5.0, 5.0)).unwrap();
        assert_eq!(list.get_z_index(&a), Some(0));
        assert_eq!(list.get_z_index(&b), Some(1));
        assert_eq!(list.take_events(), vec![Event::MapAdded(a), Event::MapAdded(b)]);
    }

    #[test]
    fn test_invalid_map_leaves_list_untouched() {
        let mut list = list_of(2);
        let mut bad = georef("bad", 0.0, 0.0);
        bad.gcps.truncate(2);
        assert!(matches!(list.add_map(bad), Err(Error::InvalidMap(_))));
        assert_eq!(list.len(), 2);
        assert!(list.take_events().is_empty());
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let mut list = list_of(1);
        assert!(matches!(list.remove_map_by_id(&"nope".into()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_front_and_back() {
        let mut list = list_of(4);
        list.bring_to_front(&ids(&["m0", "m1"]));
        assert_eq!(list.ordered_ids(), ids(&["m2", "m3", "m0", "m1"]));
        list.send_to_back(&ids(&["m1"]));
        assert_eq!(list.ordered_ids(), ids(&["m1", "m2", "m3", "m0"]));
        assert_eq!(
            list.take_events(),
            vec![
                Event::ZIndicesChanged(ids(&["m0", "m1"])),
                Event::ZIndicesChanged(ids(&["m1"])),
            ]
        );
    }

    #[test]
    fn test_step_passes_one_neighbour() {
        let mut list = list_of(4);
        list.bring_forward(&ids(&["m1"]));
        assert_eq!(list.ordered_ids(), ids(&["m0", "m2", "m1", "m3"]));
        list.send_backward(&ids(&["m3"]));
        assert_eq!(list.ordered_ids(), ids(&["m0", "m2", "m3", "m1"]));
        // Already on top: nothing left to pass
        list.bring_forward(&ids(&["m1"]));
        assert_eq!(list.ordered_ids(), ids(&["m0", "m2", "m3", "m1"]));
    }

    #[test]
    fn test_selection_precedence_and_order() {
        let mut list = list_of(3);
        list.bring_to_front(&ids(&["m0"]));
        // ids win over bbox and come back in z-order
        let selection = Selection {
            ids: Some(ids(&["m0", "m2", "m0", "missing"])),
            lon_lat_bbox: Some(Bbox::new(100.0, 100.0, 101.0, 101.0)),
            only_visible: false,
        };
        assert_eq!(list.get_map_ids(&selection), ids(&["m2", "m0"]));

        list.hide(&ids(&["m2"]));
        let visible = Selection::in_bbox(Bbox::new(-1.0, -1.0, 10.0, 1.0)).visible();
        assert_eq!(list.get_map_ids(&visible), ids(&["m1", "m0"]));
    }

    #[test]
    fn test_full_scan_without_index() {
        let mut list = WarpedMapList::new(Box::new(PolynomialFactory), false);
        list.add_map(georef("a", 0.0, 0.0)).unwrap();
        list.add_map(georef("b", 10.0, 10.0)).unwrap();
        assert!(list.spatial_index().is_none());
        let found = list.get_map_ids(&Selection::in_bbox(Bbox::new(9.5, 9.5, 10.5, 10.5)));
        assert_eq!(found, ids(&["b"]));
    }

    #[test]
    fn test_visibility_events_only_for_changes() {
        let mut list = list_of(2);
        list.hide(&ids(&["m0"]));
        list.hide(&ids(&["m0", "m1"]));
        list.show(&ids(&["m1"]));
        assert_eq!(
            list.take_events(),
            vec![
                Event::VisibilityChanged(ids(&["m0"])),
                Event::VisibilityChanged(ids(&["m1"])),
                Event::VisibilityChanged(ids(&["m1"])),
            ]
        );
    }

    #[test]
    fn test_failed_transform_keeps_last_geometry() {
        let mut list = list_of(1);
        let id: MapId = "m0".into();
        let before = list.get_map(&id).unwrap().lon_lat_bbox();
        list.set_map_options(
            &[id.clone()],
            &MapOptions {
                transformation_type: Some(crate::transform::TransformationType::ThinPlateSpline),
                ..Default::default()
            },
        );
        let map = list.get_map(&id).unwrap();
        assert_eq!(map.lon_lat_bbox(), before);
        assert_eq!(map.geometry_errors(), 1);
        assert!(list.take_events().iter().any(|e| matches!(e, Event::AnimatedChange { .. })));
    }

    #[test]
    fn test_batch_add_isolates_invalid_items() {
        let mut list = WarpedMapList::default();
        let mut bad = georef("bad", 5.0, 5.0);
        bad.gcps.truncate(2);

        let results = list.add_from_batch([georef("a", 0.0, 0.0), bad, georef("b", 2.0, 0.0)]);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().ok(), Some(&"a".to_string()));
        assert!(matches!(results[1], Err(Error::InvalidMap(_))));
        assert_eq!(results[2].as_ref().ok(), Some(&"b".to_string()));

        assert_eq!(list.len(), 2);
        assert_eq!(list.get_z_index(&"a".into()), Some(0));
        assert_eq!(list.get_z_index(&"b".into()), Some(1));
        assert!(!list.contains(&"bad".into()));
    }

    #[test]
    fn test_batch_remove_reports_unknown_maps() {
        let mut list = WarpedMapList::default();
        let known = georef("a", 0.0, 0.0);
        list.add_map(known.clone()).unwrap();
        list.take_events();

        let unknown = georef("ghost", 3.0, 3.0);
        let results = list.remove_from_batch([&known, &unknown]);
        assert_eq!(results[0].as_ref().ok(), Some(&"a".to_string()));
        assert!(matches!(&results[1], Err(Error::NotFound(id)) if id == "ghost"));

        assert!(list.is_empty());
        assert_eq!(list.take_events(), vec![Event::MapRemoved("a".into())]);
    }

    #[test]
    fn test_selection_center_and_hull() {
        use approx::assert_abs_diff_eq;

        let mut list = WarpedMapList::default();
        list.add_map(georef("a", 0.0, 0.0)).unwrap();
        list.add_map(georef("b", 5.0, 5.0)).unwrap();
        let corners: [Point; 6] = [[0.0, 0.0], [1.0, 0.0], [6.0, 5.0], [6.0, 6.0], [5.0, 6.0], [0.0, 1.0]];

        let assert_hull = |hull: &Ring, expected: &[Point], eps: f64| {
            for corner in expected {
                assert!(
                    hull.iter().any(|p| (p[0] - corner[0]).abs() < eps && (p[1] - corner[1]).abs() < eps),
                    "hull misses {corner:?}"
                );
            }
        };

        // Lon/lat
        let center = list.get_maps_center(&Selection::all(), None).unwrap();
        assert_abs_diff_eq!(center[0], 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(center[1], 3.0, epsilon = 1e-6);
        let hull = list.get_maps_convex_hull(&Selection::all(), None).unwrap();
        assert_hull(&hull, &corners, 1e-6);
        let inside = |v: f64| (-1e-6..=6.0 + 1e-6).contains(&v);
        assert!(hull.iter().all(|p| inside(p[0]) && inside(p[1])));

        // Web Mercator
        let mercator = Projection::WebMercator;
        let center = list.get_maps_center(&Selection::all(), Some(mercator)).unwrap();
        let top = mercator.from_lon_lat([6.0, 6.0]);
        assert_abs_diff_eq!(center[0], top[0] / 2.0, epsilon = 1e-3);
        assert_abs_diff_eq!(center[1], top[1] / 2.0, epsilon = 1e-3);
        let hull = list.get_maps_convex_hull(&Selection::all(), Some(mercator)).unwrap();
        let projected: Vec<Point> = corners.iter().map(|c| mercator.from_lon_lat(*c)).collect();
        assert_hull(&hull, &projected, 1e-3);

        // Selections narrow the result
        let only_b = list.get_maps_bbox(&Selection::ids(["b".to_string()]), None).unwrap();
        assert_abs_diff_eq!(only_b.min_x, 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(only_b.max_y, 6.0, epsilon = 1e-6);
    }
}
