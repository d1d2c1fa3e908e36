use thiserror::Error;

use crate::map::MapId;

/// Errors surfaced by map list and map system operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Georeference input failed validation
    #[error("invalid map: {0}")]
    InvalidMap(String),

    #[error("map {0} not found")]
    NotFound(MapId),

    #[error("invalid georeference json: {0}")]
    Json(#[from] serde_json::Error),

    /// The transformer could not be built or evaluated
    #[error("transform failed: {0}")]
    Transform(String),

    #[error("image info unavailable: {0}")]
    ImageInfo(String),
}

pub type Result<T> = std::result::Result<T, Error>;
