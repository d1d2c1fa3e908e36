//! IIIF Image API pyramids: `info.json` parsing and tile urls

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::map::loader::ImagePyramidProvider;
use crate::map::tile::ImageInfo;

#[derive(Deserialize)]
struct InfoJson {
    width: u32,
    height: u32,
    #[serde(default)]
    tiles: Vec<TileSpec>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TileSpec {
    width: u32,
    height: Option<u32>,
    scale_factors: Vec<u32>,
}

/// Parse an `info.json` document (Image API 2 or 3) into pyramid levels
pub fn parse_info_json(json: &str) -> Result<ImageInfo> {
    let info: InfoJson = serde_json::from_str(json)?;
    if info.width == 0 || info.height == 0 {
        return Err(Error::ImageInfo("image has zero size".into()));
    }

    let mut levels = Vec::new();
    for spec in &info.tiles {
        let height = spec.height.unwrap_or(spec.width);
        if spec.width == 0 || height == 0 {
            return Err(Error::ImageInfo("tile size must be positive".into()));
        }
        levels.extend(spec.scale_factors.iter().filter(|sf| **sf > 0).map(|sf| (*sf, spec.width, height)));
    }
    // Untiled images are served as one region at full size
    if levels.is_empty() {
        levels.push((1, info.width, info.height));
    }
    Ok(ImageInfo::new(info.width, info.height, levels))
}

/// Region/size url for one tile
pub fn tile_url(image_id: &str, info: &ImageInfo, zoom_level: usize, column: u32, row: u32) -> String {
    let base = image_id.trim_end_matches('/');
    let Some(level) = info.level(zoom_level) else {
        return format!("{base}/full/max/0/default.jpg");
    };
    let b = level.tile_bounds(column, row, info.width, info.height);
    let sf = f64::from(level.scale_factor);
    let size_w = (b.width() / sf).ceil() as u32;
    format!(
        "{base}/{},{},{},{}/{size_w},/0/default.jpg",
        b.min_x as u32,
        b.min_y as u32,
        b.width() as u32,
        b.height() as u32
    )
}

/// Fetches `info.json` over HTTP
#[cfg(not(target_arch = "wasm32"))]
pub struct IiifImageProvider {
    client: reqwest::blocking::Client,
}

#[cfg(not(target_arch = "wasm32"))]
impl IiifImageProvider {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl ImagePyramidProvider for IiifImageProvider {
    fn load_image_info(&self, image_id: &str) -> anyhow::Result<ImageInfo> {
        let url = format!("{}/info.json", image_id.trim_end_matches('/'));
        log::debug!("Fetching {}", url);
        let response = self.client.get(&url).send()?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {} for {}", response.status(), url);
        }
        Ok(parse_info_json(&response.text()?)?)
    }

    fn tile_url(&self, image_id: &str, info: &ImageInfo, zoom_level: usize, column: u32, row: u32) -> String {
        tile_url(image_id, info, zoom_level, column, row)
    }
}
