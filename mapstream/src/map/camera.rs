//! Viewport state, panning, zooming and buffered rectangles

use crate::geo::{Bbox, Point, Projection};

/// What part of projected space is shown on the canvas
#[derive(Clone, Debug, PartialEq)]
pub struct Viewport {
    /// Viewport size in CSS pixels
    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Center in projected coordinates
    pub center: Point,

    /// Projected units per CSS pixel
    pub scale: f64,

    /// Counter-clockwise rotation in radians
    pub rotation: f64,

    pub device_pixel_ratio: f64,
    pub projection: Projection,
}

impl Viewport {
    pub fn new(center: Point, scale: f64, width: u32, height: u32, projection: Projection) -> Self {
        Self {
            viewport_width: width,
            viewport_height: height,
            center,
            scale,
            rotation: 0.0,
            device_pixel_ratio: 1.0,
            projection,
        }
    }

    /// Viewport showing all of `bbox` (projected) inside a canvas
    pub fn fit_bbox(bbox: &Bbox, width: u32, height: u32, projection: Projection) -> Self {
        let scale = (bbox.width() / f64::from(width.max(1))).max(bbox.height() / f64::from(height.max(1)));
        Self::new(bbox.center(), scale, width, height, projection)
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_device_pixel_ratio(mut self, ratio: f64) -> Self {
        self.device_pixel_ratio = ratio;
        self
    }

    /// Canvas pixel count (device pixels)
    pub fn canvas_resolution(&self) -> f64 {
        let dpr = self.device_pixel_ratio;
        f64::from(self.viewport_width) * dpr * f64::from(self.viewport_height) * dpr
    }

    fn rotate(&self, v: Point) -> Point {
        let (sin, cos) = self.rotation.sin_cos();
        [v[0] * cos - v[1] * sin, v[0] * sin + v[1] * cos]
    }

    /// Pan the viewport by a pixel delta (screen y points down)
    pub fn pan(&mut self, dx_pixels: f64, dy_pixels: f64) {
        let d = self.rotate([dx_pixels * self.scale, -dy_pixels * self.scale]);
        self.center = [self.center[0] - d[0], self.center[1] - d[1]];
    }

    /// Zoom by `factor` (> 1 zooms in) keeping the point under the cursor fixed
    pub fn zoom_at(&mut self, factor: f64, screen_x: f64, screen_y: f64) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        let anchor = self.canvas_to_projected(screen_x, screen_y);
        self.scale /= factor;
        self.center = [
            anchor[0] + (self.center[0] - anchor[0]) / factor,
            anchor[1] + (self.center[1] - anchor[1]) / factor,
        ];
    }

    /// Simple zoom (centered)
    pub fn zoom_by(&mut self, factor: f64) {
        if factor.is_finite() && factor > 0.0 {
            self.scale /= factor;
        }
    }

    /// Convert a CSS pixel position to projected coordinates
    pub fn canvas_to_projected(&self, screen_x: f64, screen_y: f64) -> Point {
        let offset_x = screen_x - f64::from(self.viewport_width) / 2.0;
        let offset_y = screen_y - f64::from(self.viewport_height) / 2.0;
        let d = self.rotate([offset_x * self.scale, -offset_y * self.scale]);
        [self.center[0] + d[0], self.center[1] + d[1]]
    }

    /// Corners of the viewport grown by `buffer_ratio` times its size.
    ///
    /// Ratio 0 is the visible rectangle, ratio 2 triples each side.
    pub fn buffered_rectangle(&self, buffer_ratio: f64) -> [Point; 4] {
        let grow = 1.0 + buffer_ratio.max(0.0);
        let hw = f64::from(self.viewport_width) / 2.0 * self.scale * grow;
        let hh = f64::from(self.viewport_height) / 2.0 * self.scale * grow;
        [[-hw, -hh], [hw, -hh], [hw, hh], [-hw, hh]].map(|v| {
            let r = self.rotate(v);
            [self.center[0] + r[0], self.center[1] + r[1]]
        })
    }

    /// Projected bbox of the buffered rectangle
    pub fn buffered_bbox(&self, buffer_ratio: f64) -> Bbox {
        let corners = self.buffered_rectangle(buffer_ratio);
        let mut bbox = Bbox::new(corners[0][0], corners[0][1], corners[0][0], corners[0][1]);
        for c in &corners[1..] {
            bbox = bbox.union(&Bbox::new(c[0], c[1], c[0], c[1]));
        }
        bbox
    }

    /// Lon/lat bbox of the buffered rectangle, used to query the spatial index
    pub fn buffered_lon_lat_bbox(&self, buffer_ratio: f64) -> Bbox {
        let corners = self.buffered_rectangle(buffer_ratio);
        let lon_lat = corners.map(|c| self.projection.to_lon_lat(c));
        let mut bbox = Bbox::new(lon_lat[0][0], lon_lat[0][1], lon_lat[0][0], lon_lat[0][1]);
        for c in &lon_lat[1..] {
            bbox = bbox.union(&Bbox::new(c[0], c[1], c[0], c[1]));
        }
        bbox
    }
}

impl Default for Viewport {
    fn default() -> Self {
        // Whole web mercator square on an 800x600 canvas
        let half = std::f64::consts::PI * crate::geo::EARTH_RADIUS;
        Self::fit_bbox(&Bbox::new(-half, -half, half, half), 800, 600, Projection::WebMercator)
    }
}
