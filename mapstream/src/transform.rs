//! Transformer interface between resource pixels and projected geo coordinates
//!
//! The warp math itself belongs to the host. This module only defines the
//! seam, plus a least-squares first-order polynomial used as the default and
//! as the cheap stand-in for expensive transformation types.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::geo::{Point, Ring};

#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransformationType {
    #[default]
    Polynomial,
    Helmert,
    ThinPlateSpline,
    Projective,
}

impl TransformationType {
    /// Types whose backward evaluation is costly enough to approximate
    pub fn is_expensive(&self) -> bool {
        matches!(self, TransformationType::ThinPlateSpline)
    }
}

/// Ground control point: resource pixel and its geo location (lon/lat)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gcp {
    pub resource: Point,
    pub geo: Point,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransformOptions {
    /// Use the backward first-order polynomial instead of the exact transform
    pub approximate: bool,
}

/// Warps rings between resource space and projected geo space
pub trait Transformer {
    fn transform_forward(&self, ring: &[Point], options: TransformOptions) -> Result<Ring>;
    fn transform_backward(&self, ring: &[Point], options: TransformOptions) -> Result<Ring>;
}

/// Builds transformers from control points already expressed in the map projection
pub trait TransformerFactory {
    fn build(&self, gcps: &[Gcp], kind: TransformationType) -> Result<Box<dyn Transformer>>;
}

/// Affine transform fitted by least squares
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransformer {
    /// Row-major `[a, b, c, d, e, f]` with `x' = a*x + b*y + c`, `y' = d*x + e*y + f`
    forward: [f64; 6],
    backward: [f64; 6],
}

impl AffineTransformer {
    pub fn from_gcps(gcps: &[Gcp]) -> Result<Self> {
        if gcps.len() < 3 {
            bail!("affine transform needs at least 3 gcps, got {}", gcps.len());
        }
        let forward = fit_affine(gcps.iter().map(|g| (g.resource, g.geo)))?;
        let backward = invert_affine(&forward)?;
        Ok(Self { forward, backward })
    }

    fn apply(m: &[f64; 6], p: Point) -> Point {
        [m[0] * p[0] + m[1] * p[1] + m[2], m[3] * p[0] + m[4] * p[1] + m[5]]
    }
}

impl Transformer for AffineTransformer {
    fn transform_forward(&self, ring: &[Point], _options: TransformOptions) -> Result<Ring> {
        Ok(ring.iter().map(|p| Self::apply(&self.forward, *p)).collect())
    }

    fn transform_backward(&self, ring: &[Point], _options: TransformOptions) -> Result<Ring> {
        Ok(ring.iter().map(|p| Self::apply(&self.backward, *p)).collect())
    }
}

/// Default factory: first-order polynomial only
#[derive(Clone, Copy, Debug, Default)]
pub struct PolynomialFactory;

impl TransformerFactory for PolynomialFactory {
    fn build(&self, gcps: &[Gcp], kind: TransformationType) -> Result<Box<dyn Transformer>> {
        match kind {
            TransformationType::Polynomial => Ok(Box::new(AffineTransformer::from_gcps(gcps)?)),
            other => bail!("{other:?} transformation needs a host transformer factory"),
        }
    }
}

fn fit_affine(pairs: impl Iterator<Item = (Point, Point)>) -> Result<[f64; 6]> {
    // Normal equations shared by both output axes
    let mut ata = [[0.0f64; 3]; 3];
    let mut atx = [0.0f64; 3];
    let mut aty = [0.0f64; 3];
    for (src, dst) in pairs {
        let row = [src[0], src[1], 1.0];
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += row[i] * row[j];
            }
            atx[i] += row[i] * dst[0];
            aty[i] += row[i] * dst[1];
        }
    }
    let x = solve3(ata, atx)?;
    let y = solve3(ata, aty)?;
    Ok([x[0], x[1], x[2], y[0], y[1], y[2]])
}

fn solve3(m: [[f64; 3]; 3], v: [f64; 3]) -> Result<[f64; 3]> {
    let det = det3(&m);
    if det.abs() < 1e-12 || !det.is_finite() {
        bail!("control points are degenerate (collinear or duplicated)");
    }
    let mut out = [0.0; 3];
    for (col, slot) in out.iter_mut().enumerate() {
        let mut replaced = m;
        for row in 0..3 {
            replaced[row][col] = v[row];
        }
        *slot = det3(&replaced) / det;
    }
    Ok(out)
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

fn invert_affine(m: &[f64; 6]) -> Result<[f64; 6]> {
    let det = m[0] * m[4] - m[1] * m[3];
    if det.abs() < 1e-12 || !det.is_finite() {
        bail!("affine transform is not invertible");
    }
    let a = m[4] / det;
    let b = -m[1] / det;
    let d = -m[3] / det;
    let e = m[0] / det;
    let c = -(a * m[2] + b * m[5]);
    let f = -(d * m[2] + e * m[5]);
    Ok([a, b, c, d, e, f])
}
