//! Layered map options
//!
//! Four layers are merged with precedence default < per-map < list < override.
//! The merged result is immutable and cached per map until a layer changes.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::MapId;
use crate::geo::{Projection, Ring};
use crate::transform::TransformationType;

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum OptionKey {
    ResourceMask,
    TransformationType,
    Projection,
    Opacity,
}

impl OptionKey {
    /// Changing this option moves the map's indexed geometry
    pub fn affects_geometry(&self) -> bool {
        matches!(
            self,
            OptionKey::ResourceMask | OptionKey::TransformationType | OptionKey::Projection
        )
    }
}

/// One layer of options; unset fields fall through to lower layers
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapOptions {
    pub resource_mask: Option<Ring>,
    pub transformation_type: Option<TransformationType>,
    pub projection: Option<Projection>,
    pub opacity: Option<f64>,
}

impl MapOptions {
    fn overlay(&mut self, upper: &MapOptions) {
        if upper.resource_mask.is_some() {
            self.resource_mask = upper.resource_mask.clone();
        }
        if upper.transformation_type.is_some() {
            self.transformation_type = upper.transformation_type;
        }
        if upper.projection.is_some() {
            self.projection = upper.projection;
        }
        if upper.opacity.is_some() {
            self.opacity = upper.opacity;
        }
    }
}

/// Fully merged options for one map
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedOptions {
    /// `None` keeps the mask from the georeference
    pub resource_mask: Option<Ring>,
    pub transformation_type: TransformationType,
    pub projection: Projection,
    pub opacity: f64,
}

impl ResolvedOptions {
    fn from_merged(merged: MapOptions) -> Self {
        Self {
            resource_mask: merged.resource_mask,
            transformation_type: merged.transformation_type.unwrap_or_default(),
            projection: merged.projection.unwrap_or_default(),
            opacity: merged.opacity.unwrap_or(1.0),
        }
    }

    pub fn changed_keys(&self, other: &ResolvedOptions) -> Vec<OptionKey> {
        let mut keys = Vec::new();
        if self.resource_mask != other.resource_mask {
            keys.push(OptionKey::ResourceMask);
        }
        if self.transformation_type != other.transformation_type {
            keys.push(OptionKey::TransformationType);
        }
        if self.projection != other.projection {
            keys.push(OptionKey::Projection);
        }
        if self.opacity != other.opacity {
            keys.push(OptionKey::Opacity);
        }
        keys
    }
}

#[derive(Default)]
pub struct OptionLayers {
    defaults: MapOptions,
    per_map: HashMap<MapId, MapOptions>,
    list: MapOptions,
    overrides: MapOptions,
    resolved: HashMap<MapId, Arc<ResolvedOptions>>,
}

impl OptionLayers {
    pub fn new(defaults: MapOptions) -> Self {
        Self {
            defaults,
            ..Default::default()
        }
    }

    pub fn set_defaults(&mut self, options: MapOptions) {
        self.defaults = options;
        self.resolved.clear();
    }

    pub fn set_list(&mut self, options: MapOptions) {
        self.list = options;
        self.resolved.clear();
    }

    pub fn set_overrides(&mut self, options: MapOptions) {
        self.overrides = options;
        self.resolved.clear();
    }

    /// Merge `options` into the map's own layer
    pub fn set_map(&mut self, id: &MapId, options: &MapOptions) {
        self.per_map.entry(id.clone()).or_default().overlay(options);
        self.resolved.remove(id);
    }

    pub fn list(&self) -> &MapOptions {
        &self.list
    }

    pub fn remove_map(&mut self, id: &MapId) {
        self.per_map.remove(id);
        self.resolved.remove(id);
    }

    pub fn clear_maps(&mut self) {
        self.per_map.clear();
        self.resolved.clear();
    }

    pub fn resolve(&mut self, id: &MapId) -> Arc<ResolvedOptions> {
        if let Some(resolved) = self.resolved.get(id) {
            return resolved.clone();
        }
        let resolved = Arc::new(self.merge(self.per_map.get(id)));
        self.resolved.insert(id.clone(), resolved.clone());
        resolved
    }

    /// Resolve with `own` as the per-map layer, without touching the cache
    pub fn preview(&self, own: &MapOptions) -> Arc<ResolvedOptions> {
        Arc::new(self.merge(Some(own)))
    }

    fn merge(&self, own: Option<&MapOptions>) -> ResolvedOptions {
        let mut merged = self.defaults.clone();
        if let Some(own) = own {
            merged.overlay(own);
        }
        merged.overlay(&self.list);
        merged.overlay(&self.overrides);
        ResolvedOptions::from_merged(merged)
    }
}
