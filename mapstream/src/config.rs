//! Tunables for the tile requirement engine

use serde::{Deserialize, Serialize};

use crate::geo::Projection;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MapSystemConfig {
    /// Viewport buffer for tiles fetched right away
    pub request_buffer_ratio: f64,
    /// Buffer for overview tiles while the user is interacting
    pub overview_request_buffer_ratio: f64,
    /// Tiles of maps inside this buffer are kept at their current level
    pub prune_buffer_ratio: f64,
    /// Outermost buffer; only overview tiles survive here
    pub overview_prune_buffer_ratio: f64,

    /// In log2 units, positive picks sharper levels
    pub zoom_level_bias: f64,
    /// TPS maps with more GCPs than this use a polynomial for backward lookups
    pub tps_approximation_gcp_threshold: usize,
    /// Overview fetching stops once requested pixels exceed this many canvases
    pub max_total_resolution_ratio: f64,
    /// Pixel budget for an overview level
    pub overview_max_resolution: u64,

    pub fetch_workers: usize,
    /// Threads loading pyramid metadata
    pub image_info_workers: usize,
    pub spatial_index: bool,
    pub max_geometry_warnings: u32,
    pub animation_duration_ms: u64,

    /// Projection maps are warped into unless their options say otherwise
    pub projection: Projection,
}

impl Default for MapSystemConfig {
    fn default() -> Self {
        Self {
            request_buffer_ratio: 0.0,
            overview_request_buffer_ratio: 2.0,
            prune_buffer_ratio: 4.0,
            overview_prune_buffer_ratio: 10.0,
            zoom_level_bias: 0.4,
            tps_approximation_gcp_threshold: 10,
            max_total_resolution_ratio: 10.0,
            overview_max_resolution: 1024 * 1024,
            fetch_workers: 6,
            image_info_workers: 2,
            spatial_index: true,
            max_geometry_warnings: 5,
            animation_duration_ms: 750,
            projection: Projection::default(),
        }
    }
}

impl MapSystemConfig {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
