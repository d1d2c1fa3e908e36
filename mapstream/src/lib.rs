//! Viewport-driven tile streaming for georeferenced map images
//!
//! A [`MapSystem`] holds a list of warped maps, decides which image pyramid
//! tiles each viewport needs and keeps a deduplicated cache of them. Tile
//! fetching, decoding and pyramid metadata are pluggable through the traits
//! in [`map::loader`].

pub mod config;
pub mod error;
pub mod geo;
pub mod iiif;
pub mod map;
pub mod transform;

pub use config::MapSystemConfig;
pub use error::{Error, Result};
pub use map::camera::Viewport;
pub use map::events::{Event, EventKind};
pub use map::list::Selection;
pub use map::warped::GeoreferencedMap;
pub use map::{Collaborators, MapId, MapSystem};
