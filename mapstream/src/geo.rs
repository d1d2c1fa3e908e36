//! Planar geometry helpers and projections
//! Points are `[x, y]`; lon/lat degrees are used as the common geographic frame

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

pub type Point = [f64; 2];
pub type Ring = Vec<Point>;

/// Earth radius used by EPSG:3857
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Latitude limit of the Web Mercator square
pub const MAX_MERCATOR_LATITUDE: f64 = 85.05112878;

/// Axis-aligned bounding box
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bbox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// Bounding box of a set of points, `None` when empty
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut bbox = Bbox::new(first[0], first[1], first[0], first[1]);
        for p in rest {
            bbox.min_x = bbox.min_x.min(p[0]);
            bbox.min_y = bbox.min_y.min(p[1]);
            bbox.max_x = bbox.max_x.max(p[0]);
            bbox.max_y = bbox.max_y.max(p[1]);
        }
        Some(bbox)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> Point {
        [
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        ]
    }

    /// Closed intersection test (touching boxes intersect)
    pub fn intersects(&self, other: &Bbox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Overlap of two boxes, `None` when they don't intersect
    pub fn intersection(&self, other: &Bbox) -> Option<Bbox> {
        if !self.intersects(other) {
            return None;
        }
        Some(Bbox::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        ))
    }

    pub fn union(&self, other: &Bbox) -> Bbox {
        Bbox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }
}

/// Absolute area of a ring (shoelace)
pub fn ring_area(ring: &[Point]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..ring.len() {
        let a = ring[i];
        let b = ring[(i + 1) % ring.len()];
        sum += a[0] * b[1] - b[0] * a[1];
    }
    (sum / 2.0).abs()
}

pub fn squared_distance(a: Point, b: Point) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    dx * dx + dy * dy
}

pub fn is_finite_point(p: &Point) -> bool {
    p[0].is_finite() && p[1].is_finite()
}

/// Convex hull using Andrew's monotone chain, counter-clockwise, not closed
pub fn convex_hull(points: &[Point]) -> Ring {
    let mut pts: Vec<Point> = points.iter().copied().filter(is_finite_point).collect();
    pts.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    fn cross(o: Point, a: Point, b: Point) -> f64 {
        (a[0] - o[0]) * (b[1] - o[1]) - (a[1] - o[1]) * (b[0] - o[0])
    }

    let mut lower: Ring = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Ring = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Projected coordinate systems a map or viewport can live in
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Projection {
    /// EPSG:3857, meters
    #[default]
    #[serde(rename = "EPSG:3857")]
    WebMercator,
    /// EPSG:4326 used as a plate carrée, degrees
    #[serde(rename = "EPSG:4326")]
    Equirectangular,
}

impl Projection {
    /// Projected coordinates to lon/lat degrees
    pub fn to_lon_lat(&self, p: Point) -> Point {
        match self {
            Projection::WebMercator => {
                let lon = (p[0] / EARTH_RADIUS).to_degrees();
                let lat = (2.0 * (p[1] / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
                [lon, lat]
            }
            Projection::Equirectangular => p,
        }
    }

    /// Lon/lat degrees to projected coordinates
    pub fn from_lon_lat(&self, p: Point) -> Point {
        match self {
            Projection::WebMercator => {
                let lat = p[1].clamp(-MAX_MERCATOR_LATITUDE, MAX_MERCATOR_LATITUDE);
                let x = EARTH_RADIUS * p[0].to_radians();
                let y = EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
                [x, y]
            }
            Projection::Equirectangular => p,
        }
    }

    /// Reproject a point from this projection into `to`
    pub fn reproject(&self, p: Point, to: Projection) -> Point {
        if *self == to {
            return p;
        }
        to.from_lon_lat(self.to_lon_lat(p))
    }

    pub fn reproject_ring(&self, ring: &[Point], to: Projection) -> Ring {
        ring.iter().map(|p| self.reproject(*p, to)).collect()
    }

    /// Lon/lat bounding box of a projected ring
    pub fn lon_lat_bbox(&self, ring: &[Point]) -> Option<Bbox> {
        let points: Ring = ring.iter().map(|p| self.to_lon_lat(*p)).collect();
        Bbox::from_points(&points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bbox_intersection() {
        let a = Bbox::new(0.0, 0.0, 10.0, 10.0);
        let b = Bbox::new(5.0, 5.0, 20.0, 20.0);
        assert_eq!(a.intersection(&b), Some(Bbox::new(5.0, 5.0, 10.0, 10.0)));
        assert_eq!(a.intersection(&Bbox::new(11.0, 0.0, 12.0, 1.0)), None);
        assert!(a.intersects(&Bbox::new(10.0, 10.0, 12.0, 12.0)));
    }

    #[test]
    fn test_ring_area() {
        let square = vec![[0.0, 0.0], [4.0, 0.0], [4.0, 4.0], [0.0, 4.0]];
        assert_relative_eq!(ring_area(&square), 16.0);
    }

    #[test]
    fn test_convex_hull_drops_interior_points() {
        let points = vec![[0.0, 0.0], [2.0, 0.0], [1.0, 1.0], [2.0, 2.0], [0.0, 2.0]];
        let hull = convex_hull(&points);
        assert_eq!(hull.len(), 4);
        assert!(!hull.contains(&[1.0, 1.0]));
    }

    #[test]
    fn test_web_mercator_round_trip() {
        // Seoul
        let lon_lat = [126.9780, 37.5665];
        let projected = Projection::WebMercator.from_lon_lat(lon_lat);
        let back = Projection::WebMercator.to_lon_lat(projected);
        assert_relative_eq!(back[0], lon_lat[0], epsilon = 1e-9);
        assert_relative_eq!(back[1], lon_lat[1], epsilon = 1e-9);
    }
}
