//! Georeference input and per-map runtime state

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::camera::Viewport;
use super::options::{OptionKey, ResolvedOptions};
use super::tile::{FetchableTile, ImageInfo};
use super::MapId;
use crate::error::{Error, Result};
use crate::geo::{is_finite_point, ring_area, Bbox, Point, Projection, Ring};
use crate::transform::{Gcp, TransformOptions, TransformationType, Transformer, TransformerFactory};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Image service id, handed to the image pyramid provider
    pub id: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    #[serde(rename = "type")]
    pub kind: TransformationType,
}

/// Raw georeference input for one map
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoreferencedMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub resource: Resource,
    pub gcps: Vec<Gcp>,
    /// Empty means the whole image
    #[serde(default)]
    pub resource_mask: Ring,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<Transformation>,
}

impl GeoreferencedMap {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resource.width == 0 || self.resource.height == 0 {
            return Err(Error::InvalidMap(format!(
                "resource {} has zero size",
                self.resource.id
            )));
        }
        if self.gcps.len() < 3 {
            return Err(Error::InvalidMap(format!(
                "need at least 3 gcps, got {}",
                self.gcps.len()
            )));
        }
        if self
            .gcps
            .iter()
            .any(|g| !is_finite_point(&g.resource) || !is_finite_point(&g.geo))
        {
            return Err(Error::InvalidMap("gcp with non-finite coordinates".into()));
        }
        if !self.resource_mask.is_empty() && self.resource_mask.len() < 3 {
            return Err(Error::InvalidMap(format!(
                "resource mask needs at least 3 points, got {}",
                self.resource_mask.len()
            )));
        }
        if !self.resource_mask.iter().all(is_finite_point) {
            return Err(Error::InvalidMap("resource mask with non-finite coordinates".into()));
        }
        Ok(())
    }

    /// Explicit id, or a checksum of the content
    pub fn map_id(&self) -> Result<MapId> {
        match &self.id {
            Some(id) => Ok(id.clone()),
            None => self.checksum(),
        }
    }

    /// blake3 of the canonical json encoding without the id field
    pub fn checksum(&self) -> Result<String> {
        let anonymous = GeoreferencedMap {
            id: None,
            ..self.clone()
        };
        let bytes = serde_json::to_vec(&anonymous)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn transformation_type(&self) -> TransformationType {
        self.transformation.map(|t| t.kind).unwrap_or_default()
    }

    fn full_mask(&self) -> Ring {
        let w = f64::from(self.resource.width);
        let h = f64::from(self.resource.height);
        vec![[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]]
    }
}

/// State recomputed on every viewport pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewportState {
    pub tile_zoom_level: Option<usize>,
    pub overview_zoom_level: Option<usize>,
    /// Buffered viewport transformed backward into resource space
    pub resource_viewport_ring: Option<Ring>,
    /// Intersection of that ring's bbox with the mask bbox
    pub resource_viewport_bbox: Option<Bbox>,
    pub fetchable_tiles: Vec<FetchableTile>,
    pub overview_tiles: Vec<FetchableTile>,
}

/// Geometry derived from options and the transformer
struct Geometry {
    resource_mask: Ring,
    resource_mask_bbox: Bbox,
    projected_geo_mask: Ring,
    projected_geo_mask_bbox: Bbox,
    lon_lat_bbox: Bbox,
}

pub struct WarpedMap {
    pub id: MapId,
    pub georeference: GeoreferencedMap,
    options: Arc<ResolvedOptions>,
    transformer: Box<dyn Transformer>,
    geometry: Geometry,
    image_info: Option<Arc<ImageInfo>>,
    visible: bool,
    geometry_errors: u32,
    pub viewport: ViewportState,
    /// Advisory copy of the last pass
    pub previous_viewport: ViewportState,
}

impl WarpedMap {
    pub fn new(
        id: MapId,
        georeference: GeoreferencedMap,
        options: Arc<ResolvedOptions>,
        factory: &dyn TransformerFactory,
    ) -> Result<Self> {
        georeference.validate()?;
        let transformer = build_transformer(&georeference, &options, factory)?;
        let geometry = compute_geometry(&georeference, &options, transformer.as_ref())?;
        Ok(Self {
            id,
            georeference,
            options,
            transformer,
            geometry,
            image_info: None,
            visible: true,
            geometry_errors: 0,
            viewport: ViewportState::default(),
            previous_viewport: ViewportState::default(),
        })
    }

    /// Apply newly resolved options, returning the keys that changed.
    ///
    /// If the new transformer or geometry cannot be built the last good one
    /// is kept and the failure is counted.
    pub fn apply_options(
        &mut self,
        options: Arc<ResolvedOptions>,
        factory: &dyn TransformerFactory,
        max_warnings: u32,
    ) -> Vec<OptionKey> {
        let keys = self.options.changed_keys(&options);
        if keys.is_empty() {
            return keys;
        }
        if keys.iter().any(OptionKey::affects_geometry) {
            let rebuilt = build_transformer(&self.georeference, &options, factory).and_then(|transformer| {
                let geometry = compute_geometry(&self.georeference, &options, transformer.as_ref())?;
                Ok((transformer, geometry))
            });
            match rebuilt {
                Ok((transformer, geometry)) => {
                    self.transformer = transformer;
                    self.geometry = geometry;
                }
                Err(err) => self.record_geometry_error(&err, max_warnings),
            }
        }
        self.options = options;
        keys
    }

    fn record_geometry_error(&mut self, err: &Error, max_warnings: u32) {
        self.geometry_errors += 1;
        if self.geometry_errors <= max_warnings {
            log::warn!("Keeping previous geometry for map {}: {}", self.id, err);
            if self.geometry_errors == max_warnings {
                log::warn!("Further geometry errors for map {} are not logged", self.id);
            }
        }
    }

    pub fn geometry_errors(&self) -> u32 {
        self.geometry_errors
    }

    pub fn options(&self) -> &ResolvedOptions {
        &self.options
    }

    pub fn projection(&self) -> Projection {
        self.options.projection
    }

    pub fn transformation_type(&self) -> TransformationType {
        self.options.transformation_type
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub(crate) fn set_visible(&mut self, visible: bool) -> bool {
        let changed = self.visible != visible;
        self.visible = visible;
        changed
    }

    pub fn has_image_info(&self) -> bool {
        self.image_info.is_some()
    }

    pub fn image_info(&self) -> Option<&Arc<ImageInfo>> {
        self.image_info.as_ref()
    }

    pub fn set_image_info(&mut self, info: Arc<ImageInfo>) {
        self.image_info = Some(info);
    }

    pub fn image_id(&self) -> &str {
        &self.georeference.resource.id
    }

    pub fn resource_mask(&self) -> &[Point] {
        &self.geometry.resource_mask
    }

    pub fn resource_mask_bbox(&self) -> Bbox {
        self.geometry.resource_mask_bbox
    }

    /// Mask warped into the map projection
    pub fn projected_geo_mask(&self) -> &[Point] {
        &self.geometry.projected_geo_mask
    }

    pub fn projected_geo_mask_bbox(&self) -> Bbox {
        self.geometry.projected_geo_mask_bbox
    }

    /// Indexed geometry
    pub fn lon_lat_bbox(&self) -> Bbox {
        self.geometry.lon_lat_bbox
    }

    /// Whether backward lookups should use the cheap polynomial
    pub fn uses_backward_approximation(&self, gcp_threshold: usize) -> bool {
        self.transformation_type().is_expensive() && self.georeference.gcps.len() > gcp_threshold
    }

    /// Resource pixels per canvas (device) pixel at the viewport's scale
    pub fn resource_to_canvas_scale(&self, viewport: &Viewport) -> f64 {
        let geo_mask = self.projection().reproject_ring(&self.geometry.projected_geo_mask, viewport.projection);
        let canvas_per_projected = viewport.device_pixel_ratio / viewport.scale;
        let canvas_area = ring_area(&geo_mask) * canvas_per_projected * canvas_per_projected;
        let resource_area = ring_area(&self.geometry.resource_mask);
        (resource_area / canvas_area).sqrt()
    }

    /// Transform a ring given in the viewport projection back into resource space
    pub fn viewport_ring_to_resource(
        &self,
        ring: &[Point],
        from: Projection,
        gcp_threshold: usize,
    ) -> Result<Ring> {
        let projected = from.reproject_ring(ring, self.projection());
        let options = TransformOptions {
            approximate: self.uses_backward_approximation(gcp_threshold),
        };
        self.transformer
            .transform_backward(&projected, options)
            .map_err(|e| Error::Transform(e.to_string()))
    }

    /// Start a new pass: current state becomes the advisory previous state
    pub(crate) fn reset_viewport_state(&mut self) {
        self.previous_viewport = std::mem::take(&mut self.viewport);
    }
}

fn build_transformer(
    georeference: &GeoreferencedMap,
    options: &ResolvedOptions,
    factory: &dyn TransformerFactory,
) -> Result<Box<dyn Transformer>> {
    let gcps: Vec<Gcp> = georeference
        .gcps
        .iter()
        .map(|g| Gcp {
            resource: g.resource,
            geo: options.projection.from_lon_lat(g.geo),
        })
        .collect();
    factory
        .build(&gcps, options.transformation_type)
        .map_err(|e| Error::Transform(e.to_string()))
}

fn compute_geometry(
    georeference: &GeoreferencedMap,
    options: &ResolvedOptions,
    transformer: &dyn Transformer,
) -> Result<Geometry> {
    let resource_mask = match &options.resource_mask {
        Some(mask) => mask.clone(),
        None if georeference.resource_mask.is_empty() => georeference.full_mask(),
        None => georeference.resource_mask.clone(),
    };
    if resource_mask.len() < 3 || !resource_mask.iter().all(is_finite_point) {
        return Err(Error::Transform("resource mask is degenerate".into()));
    }
    let resource_mask_bbox =
        Bbox::from_points(&resource_mask).ok_or_else(|| Error::Transform("empty resource mask".into()))?;

    let projected_geo_mask = transformer
        .transform_forward(&resource_mask, TransformOptions::default())
        .map_err(|e| Error::Transform(e.to_string()))?;
    if !projected_geo_mask.iter().all(is_finite_point) {
        return Err(Error::Transform("warped mask has non-finite coordinates".into()));
    }
    let projected_geo_mask_bbox = Bbox::from_points(&projected_geo_mask)
        .ok_or_else(|| Error::Transform("warped mask is empty".into()))?;
    let lon_lat_bbox = options
        .projection
        .lon_lat_bbox(&projected_geo_mask)
        .ok_or_else(|| Error::Transform("warped mask is empty".into()))?;

    Ok(Geometry {
        resource_mask,
        resource_mask_bbox,
        projected_geo_mask,
        projected_geo_mask_bbox,
        lon_lat_bbox,
    })
}
