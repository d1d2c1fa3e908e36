//! Image pyramid geometry and tile identifiers
//! Resource pixel space: origin top-left, one unit per full-resolution pixel

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::MapId;
use crate::geo::{squared_distance, Bbox};

/// Unique identifier for a map tile
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TileKey {
    pub map_id: MapId,
    pub zoom_level: usize,
    pub column: u32,
    pub row: u32,
}

impl TileKey {
    pub fn new(map_id: impl Into<MapId>, zoom_level: usize, column: u32, row: u32) -> Self {
        Self {
            map_id: map_id.into(),
            zoom_level,
            column,
            row,
        }
    }
}

/// One resolution tier of an image pyramid
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileZoomLevel {
    /// Resource pixels per level pixel (1 = full resolution)
    pub scale_factor: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub columns: u32,
    pub rows: u32,
}

impl TileZoomLevel {
    pub fn new(scale_factor: u32, tile_width: u32, tile_height: u32, image_width: u32, image_height: u32) -> Self {
        let scale_factor = scale_factor.max(1);
        let resource_w = u64::from(tile_width.max(1)) * u64::from(scale_factor);
        let resource_h = u64::from(tile_height.max(1)) * u64::from(scale_factor);
        Self {
            scale_factor,
            tile_width,
            tile_height,
            columns: u64::from(image_width).div_ceil(resource_w) as u32,
            rows: u64::from(image_height).div_ceil(resource_h) as u32,
        }
    }

    /// Width of one tile in resource pixels
    pub fn resource_tile_width(&self) -> f64 {
        f64::from(self.tile_width) * f64::from(self.scale_factor)
    }

    pub fn resource_tile_height(&self) -> f64 {
        f64::from(self.tile_height) * f64::from(self.scale_factor)
    }

    /// Total pixel count of the whole image at this level
    pub fn resolution(&self, image_width: u32, image_height: u32) -> u64 {
        let sf = u64::from(self.scale_factor);
        u64::from(image_width).div_ceil(sf) * u64::from(image_height).div_ceil(sf)
    }

    /// Resource-space bounds of a tile, clipped to the image
    pub fn tile_bounds(&self, column: u32, row: u32, image_width: u32, image_height: u32) -> Bbox {
        let tw = self.resource_tile_width();
        let th = self.resource_tile_height();
        let min_x = f64::from(column) * tw;
        let min_y = f64::from(row) * th;
        Bbox::new(
            min_x,
            min_y,
            (min_x + tw).min(f64::from(image_width)),
            (min_y + th).min(f64::from(image_height)),
        )
    }
}

/// Image pyramid metadata, levels sorted finest first
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub levels: Vec<TileZoomLevel>,
}

impl ImageInfo {
    /// Build from `(scale_factor, tile_width, tile_height)` triples
    pub fn new(width: u32, height: u32, levels: impl IntoIterator<Item = (u32, u32, u32)>) -> Self {
        let mut levels: Vec<TileZoomLevel> = levels
            .into_iter()
            .map(|(sf, tw, th)| TileZoomLevel::new(sf, tw, th, width, height))
            .collect();
        levels.sort_by_key(|l| l.scale_factor);
        levels.dedup_by_key(|l| l.scale_factor);
        Self { width, height, levels }
    }

    pub fn level(&self, zoom_level: usize) -> Option<&TileZoomLevel> {
        self.levels.get(zoom_level)
    }
}

/// A tile that should be present in the cache
///
/// Equality and hashing only look at the key.
#[derive(Clone, Debug)]
pub struct FetchableTile {
    pub key: TileKey,
    /// Resource-space pixel bounds
    pub bounds: Bbox,
    pub url: String,
    /// Pixel count of the tile at its own level
    pub resolution: u64,
}

impl PartialEq for FetchableTile {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for FetchableTile {}

impl Hash for FetchableTile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Grid cell of one zoom level, before a url is attached
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridTile {
    pub column: u32,
    pub row: u32,
    pub bounds: Bbox,
}

impl GridTile {
    pub fn resolution(&self, level: &TileZoomLevel) -> u64 {
        let sf = f64::from(level.scale_factor);
        ((self.bounds.width() / sf).ceil() * (self.bounds.height() / sf).ceil()) as u64
    }
}

/// Pick the zoom level whose native resolution best matches the canvas.
///
/// `resource_to_canvas_scale` is resource pixels per canvas pixel. `bias` is in
/// log2 units; positive values favour finer levels.
pub fn zoom_level_for_scale(levels: &[TileZoomLevel], resource_to_canvas_scale: f64, bias: f64) -> Option<usize> {
    if levels.is_empty() {
        return None;
    }
    if !resource_to_canvas_scale.is_finite() || resource_to_canvas_scale <= 0.0 {
        // Degenerate scale: coarsest is the safe choice
        return Some(levels.len() - 1);
    }
    let target = resource_to_canvas_scale.log2() - bias;
    let mut best = 0;
    let mut best_diff = f64::INFINITY;
    for (i, level) in levels.iter().enumerate() {
        let diff = (f64::from(level.scale_factor).log2() - target).abs();
        if diff < best_diff {
            best = i;
            best_diff = diff;
        }
    }
    Some(best)
}

/// Grid tiles of `level` covering `area`, closest to the area center first
pub fn tiles_covering(level: &TileZoomLevel, image_width: u32, image_height: u32, area: &Bbox) -> Vec<GridTile> {
    if level.columns == 0 || level.rows == 0 {
        return Vec::new();
    }
    let tw = level.resource_tile_width();
    let th = level.resource_tile_height();

    let clamp_col = |v: f64| (v.max(0.0) as u32).min(level.columns);
    let clamp_row = |v: f64| (v.max(0.0) as u32).min(level.rows);

    let min_col = clamp_col((area.min_x / tw).floor());
    let max_col = clamp_col((area.max_x / tw).ceil());
    let min_row = clamp_row((area.min_y / th).floor());
    let max_row = clamp_row((area.max_y / th).ceil());

    let mut tiles = Vec::new();
    for row in min_row..max_row {
        for column in min_col..max_col {
            tiles.push(GridTile {
                column,
                row,
                bounds: level.tile_bounds(column, row, image_width, image_height),
            });
        }
    }

    let center = area.center();
    // sort_by is stable, equal distances keep row-major order
    tiles.sort_by(|a, b| {
        squared_distance(a.bounds.center(), center).total_cmp(&squared_distance(b.bounds.center(), center))
    });
    tiles
}

/// Every tile of a level, used for overview fallbacks
pub fn all_tiles(level: &TileZoomLevel, image_width: u32, image_height: u32) -> Vec<GridTile> {
    let full = Bbox::new(0.0, 0.0, f64::from(image_width), f64::from(image_height));
    tiles_covering(level, image_width, image_height, &full)
}

/// Coarsest level strictly coarser than `primary` whose whole-image resolution fits `max_resolution`
pub fn overview_zoom_level(info: &ImageInfo, primary: usize, max_resolution: u64) -> Option<usize> {
    let primary_scale = info.level(primary)?.scale_factor;
    info.levels
        .iter()
        .enumerate()
        .filter(|(_, l)| l.scale_factor > primary_scale)
        .filter(|(_, l)| l.resolution(info.width, info.height) <= max_resolution)
        .last()
        .map(|(i, _)| i)
}
