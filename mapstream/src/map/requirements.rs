//! Which maps and tiles a viewport needs
//!
//! Four buffer tiers are queried per pass. Tiles are computed for the prune
//! tier but only fetched for the request tier; prune info covers the widest
//! tier so maps just outside the view keep their tiles warm.

use std::collections::{HashMap, HashSet};

use super::cache::PruneInfo;
use super::camera::Viewport;
use super::list::{Selection, WarpedMapList};
use super::loader::ImagePyramidProvider;
use super::tile::{all_tiles, overview_zoom_level, tiles_covering, zoom_level_for_scale, FetchableTile, GridTile, ImageInfo};
use super::warped::WarpedMap;
use super::MapId;
use crate::config::MapSystemConfig;
use crate::geo::{squared_distance, Bbox, Point, Ring};

/// Segments per viewport edge before transforming backward
const EDGE_SEGMENTS: usize = 4;

/// Tier names in ascending buffer order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Request,
    OverviewRequest,
    Prune,
    OverviewPrune,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Request, Tier::OverviewRequest, Tier::Prune, Tier::OverviewPrune];

    pub fn buffer_ratio(&self, config: &MapSystemConfig) -> f64 {
        match self {
            Tier::Request => config.request_buffer_ratio,
            Tier::OverviewRequest => config.overview_request_buffer_ratio,
            Tier::Prune => config.prune_buffer_ratio,
            Tier::OverviewPrune => config.overview_prune_buffer_ratio,
        }
    }
}

/// Everything one viewport pass decided
#[derive(Debug, Default)]
pub struct Requirements {
    /// Map ids per tier, closest first
    pub request: Vec<MapId>,
    pub overview_request: Vec<MapId>,
    pub prune: Vec<MapId>,
    pub overview_prune: Vec<MapId>,
    pub tiles: Vec<FetchableTile>,
    pub overview_tiles: Vec<FetchableTile>,
    pub prune_info: HashMap<MapId, PruneInfo>,
    /// Maps in the prune tier still waiting for pyramid metadata
    pub image_info_needed: Vec<MapId>,
}

/// Visible maps intersecting the viewport buffered by `buffer_ratio`, closest first
pub fn find_maps(list: &WarpedMapList, viewport: &Viewport, buffer_ratio: f64) -> Vec<MapId> {
    let bbox = viewport.buffered_lon_lat_bbox(buffer_ratio);
    let mut maps: Vec<(f64, MapId)> = list
        .select(&Selection::in_bbox(bbox).visible())
        .into_iter()
        .map(|m| (distance_to_center(m, viewport), m.id.clone()))
        .collect();
    // Stable: equal distances keep z-order
    maps.sort_by(|a, b| a.0.total_cmp(&b.0));
    maps.into_iter().map(|(_, id)| id).collect()
}

fn distance_to_center(map: &WarpedMap, viewport: &Viewport) -> f64 {
    let center = map
        .projection()
        .reproject(map.projected_geo_mask_bbox().center(), viewport.projection);
    squared_distance(center, viewport.center)
}

fn densify(corners: &[Point; 4]) -> Ring {
    let mut ring = Vec::with_capacity(4 * EDGE_SEGMENTS);
    for i in 0..4 {
        let a = corners[i];
        let b = corners[(i + 1) % 4];
        for s in 0..EDGE_SEGMENTS {
            let t = s as f64 / EDGE_SEGMENTS as f64;
            ring.push([a[0] + (b[0] - a[0]) * t, a[1] + (b[1] - a[1]) * t]);
        }
    }
    ring
}

/// Backward-transformed buffered viewport, and its bbox clipped to the mask bbox
fn resource_viewport(
    map: &WarpedMap,
    viewport: &Viewport,
    buffer_ratio: f64,
    config: &MapSystemConfig,
) -> (Option<Ring>, Option<Bbox>) {
    let ring = densify(&viewport.buffered_rectangle(buffer_ratio));
    match map.viewport_ring_to_resource(&ring, viewport.projection, config.tps_approximation_gcp_threshold) {
        Ok(resource_ring) => {
            let bbox = Bbox::from_points(&resource_ring).and_then(|b| b.intersection(&map.resource_mask_bbox()));
            (Some(resource_ring), bbox)
        }
        Err(err) => {
            log::debug!("Backward transform failed for map {}: {}", map.id, err);
            (None, None)
        }
    }
}

fn materialize(
    map: &WarpedMap,
    info: &ImageInfo,
    zoom_level: usize,
    grid: Vec<GridTile>,
    provider: &dyn ImagePyramidProvider,
) -> Vec<FetchableTile> {
    let Some(level) = info.level(zoom_level) else {
        return Vec::new();
    };
    grid.into_iter()
        .map(|t| FetchableTile {
            key: super::tile::TileKey::new(map.id.clone(), zoom_level, t.column, t.row),
            bounds: t.bounds,
            url: provider.tile_url(map.image_id(), info, zoom_level, t.column, t.row),
            resolution: t.resolution(level),
        })
        .collect()
}

/// Run one requirement pass, recomputing every map's per-viewport state
pub fn compute(
    list: &mut WarpedMapList,
    viewport: &Viewport,
    config: &MapSystemConfig,
    provider: &dyn ImagePyramidProvider,
    anticipate_interaction: bool,
) -> Requirements {
    let mut req = Requirements {
        request: find_maps(list, viewport, Tier::Request.buffer_ratio(config)),
        overview_request: find_maps(list, viewport, Tier::OverviewRequest.buffer_ratio(config)),
        prune: find_maps(list, viewport, Tier::Prune.buffer_ratio(config)),
        overview_prune: find_maps(list, viewport, Tier::OverviewPrune.buffer_ratio(config)),
        ..Default::default()
    };

    for id in list.ordered_ids() {
        if let Some(map) = list.get_map_mut(&id) {
            map.reset_viewport_state();
        }
    }

    let request: HashSet<&MapId> = req.request.iter().collect();
    let prune: HashSet<&MapId> = req.prune.iter().collect();
    let mut total_resolution: u64 = 0;

    for id in &req.overview_prune {
        let Some(map) = list.get_map_mut(id) else { continue };
        let in_prune = prune.contains(id);
        let Some(info) = map.image_info().cloned() else {
            if in_prune {
                req.image_info_needed.push(id.clone());
            }
            continue;
        };

        let scale = map.resource_to_canvas_scale(viewport);
        let Some(zoom_level) = zoom_level_for_scale(&info.levels, scale, config.zoom_level_bias) else {
            continue;
        };
        let overview = overview_zoom_level(&info, zoom_level, config.overview_max_resolution);

        let retention_ratio = if in_prune {
            Tier::Prune.buffer_ratio(config)
        } else {
            Tier::OverviewPrune.buffer_ratio(config)
        };
        let (ring, retention_bbox) = resource_viewport(map, viewport, retention_ratio, config);

        map.viewport.tile_zoom_level = in_prune.then_some(zoom_level);
        map.viewport.overview_zoom_level = overview;
        map.viewport.resource_viewport_ring = ring;
        map.viewport.resource_viewport_bbox = retention_bbox;

        req.prune_info.insert(
            id.clone(),
            PruneInfo {
                zoom_level: in_prune.then_some(zoom_level),
                overview_zoom_level: overview,
                resource_viewport_bbox: retention_bbox,
            },
        );

        if !request.contains(id) {
            continue;
        }
        let request_ratio = Tier::Request.buffer_ratio(config);
        let request_bbox = if request_ratio == retention_ratio {
            retention_bbox
        } else {
            resource_viewport(map, viewport, request_ratio, config).1
        };
        let Some(area) = request_bbox else { continue };
        let Some(level) = info.level(zoom_level) else { continue };

        let grid = tiles_covering(level, info.width, info.height, &area);
        let tiles = materialize(map, &info, zoom_level, grid, provider);
        total_resolution += tiles.iter().map(|t| t.resolution).sum::<u64>();
        map.viewport.fetchable_tiles = tiles.clone();
        req.tiles.extend(tiles);
    }

    if anticipate_interaction {
        let budget = viewport.canvas_resolution() * config.max_total_resolution_ratio;
        for id in &req.overview_request {
            if total_resolution as f64 > budget {
                log::debug!("Skipping overview tiles, {total_resolution} px already requested");
                break;
            }
            let Some(map) = list.get_map_mut(id) else { continue };
            let (Some(info), Some(overview), Some(retention_bbox)) = (
                map.image_info().cloned(),
                map.viewport.overview_zoom_level,
                map.viewport.resource_viewport_bbox,
            ) else {
                continue;
            };
            let Some(level) = info.level(overview) else { continue };

            // Whole-image tiles, limited to what pruning would keep
            let grid: Vec<GridTile> = all_tiles(level, info.width, info.height)
                .into_iter()
                .filter(|t| t.bounds.intersects(&retention_bbox))
                .collect();
            let tiles = materialize(map, &info, overview, grid, provider);
            total_resolution += tiles.iter().map(|t| t.resolution).sum::<u64>();
            map.viewport.overview_tiles = tiles.clone();
            req.overview_tiles.extend(tiles);
        }
    }

    req
}
