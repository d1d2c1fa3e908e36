//! Tile cache with fetch deduplication and viewport-relative pruning

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use web_time::Instant;

use super::events::Event;
use super::loader::{tile_memory_size, CancelToken, TileDecoder, TileFetcher, TileImage, TileLoadResult, TileLoader};
use super::tile::{FetchableTile, TileKey};
use super::MapId;
use crate::geo::Bbox;

/// Loaded tile data
pub struct CachedTile {
    pub image: Arc<TileImage>,
    pub memory_size: usize,
    pub created_at: Instant,
}

enum TileState {
    Pending { request_id: u64, cancel: CancelToken },
    Loaded(CachedTile),
    Errored(String),
}

struct CacheEntry {
    tile: FetchableTile,
    state: TileState,
}

/// Lifecycle state of a cache entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileStatus {
    Pending,
    Loaded,
    Errored,
}

/// What a map still needs, computed for every viewport pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PruneInfo {
    pub zoom_level: Option<usize>,
    pub overview_zoom_level: Option<usize>,
    /// Resource-space bbox of the buffered viewport intersected with the mask
    pub resource_viewport_bbox: Option<Bbox>,
}

impl PruneInfo {
    /// A cached tile survives if it sits on a wanted level and overlaps the viewport
    pub fn keeps(&self, key: &TileKey, bounds: &Bbox) -> bool {
        let level_wanted =
            self.zoom_level == Some(key.zoom_level) || self.overview_zoom_level == Some(key.zoom_level);
        level_wanted
            && self
                .resource_viewport_bbox
                .is_some_and(|bbox| bbox.intersects(bounds))
    }
}

/// Tile cache keyed by tile identity
pub struct TileCache {
    entries: BTreeMap<TileKey, CacheEntry>,
    loader: TileLoader,
    next_request_id: u64,
    loaded_per_map: HashMap<MapId, usize>,
    current_memory: usize,
    events: Vec<Event>,
}

impl TileCache {
    /// Create a new tile cache
    /// - fetcher/decoder: collaborators run on `workers` background threads
    pub fn new(fetcher: Arc<dyn TileFetcher>, decoder: Arc<dyn TileDecoder>, workers: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            loader: TileLoader::new(fetcher, decoder, workers),
            next_request_id: 0,
            loaded_per_map: HashMap::new(),
            current_memory: 0,
            events: Vec::new(),
        }
    }

    /// Drain events emitted since the last call
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Start fetches for tiles that are neither loaded nor pending.
    ///
    /// Errored tiles are fetched again. Returns the number of fetches started.
    pub fn request(&mut self, tiles: &[FetchableTile]) -> usize {
        let mut started = 0;
        for tile in tiles {
            match self.entries.get(&tile.key).map(|e| &e.state) {
                Some(TileState::Pending { .. }) | Some(TileState::Loaded(_)) => continue,
                Some(TileState::Errored(_)) | None => {}
            }

            self.next_request_id += 1;
            let request_id = self.next_request_id;
            let cancel = CancelToken::new();
            if !self
                .loader
                .request(tile.key.clone(), tile.url.clone(), request_id, cancel.clone())
            {
                log::warn!("Tile loader is gone, cannot fetch {:?}", tile.key);
                continue;
            }
            self.entries.insert(
                tile.key.clone(),
                CacheEntry {
                    tile: tile.clone(),
                    state: TileState::Pending { request_id, cancel },
                },
            );
            started += 1;
        }
        started
    }

    /// Apply every completed fetch; returns how many results were drained
    pub fn poll(&mut self) -> usize {
        let mut drained = 0;
        while let Some(result) = self.loader.poll() {
            self.apply(result);
            drained += 1;
        }
        drained
    }

    /// Wait up to `timeout` for one completed fetch, then drain the rest
    pub fn poll_timeout(&mut self, timeout: Duration) -> usize {
        match self.loader.poll_timeout(timeout) {
            Some(result) => {
                self.apply(result);
                1 + self.poll()
            }
            None => 0,
        }
    }

    fn apply(&mut self, result: TileLoadResult) {
        let key = result.key().clone();
        // Stale-arrival guard: the entry must still wait for this very request
        let current = match self.entries.get(&key).map(|e| &e.state) {
            Some(TileState::Pending { request_id, .. }) => *request_id == result.request_id(),
            _ => false,
        };
        if !current {
            log::debug!("Discarding stale result for tile {:?}", key);
            return;
        }
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };

        match result {
            TileLoadResult::Success { image, .. } => {
                let memory_size = tile_memory_size(image.width(), image.height());
                self.current_memory += memory_size;
                entry.state = TileState::Loaded(CachedTile {
                    image,
                    memory_size,
                    created_at: Instant::now(),
                });
                log::debug!("Loaded tile {:?}", key);

                let map_id = key.map_id.clone();
                let loaded = self.loaded_per_map.entry(map_id.clone()).or_insert(0);
                *loaded += 1;
                let first = *loaded == 1;

                self.events.push(Event::TileLoaded(key));
                if first {
                    self.events.push(Event::FirstTileLoadedForMap(map_id.clone()));
                }
                if self.pending_for_map(&map_id) == 0 {
                    self.events.push(Event::AllRequestedTilesLoadedForMap(map_id));
                }
            }
            TileLoadResult::Failed { message, .. } => {
                log::warn!("Failed to load tile {:?}: {}", key, message);
                entry.state = TileState::Errored(message.clone());
                let map_id = key.map_id.clone();
                self.events.push(Event::TileError { key, message });
                // Errored tiles count as settled
                if self.pending_for_map(&map_id) == 0 {
                    self.events.push(Event::AllRequestedTilesLoadedForMap(map_id));
                }
            }
        }
    }

    fn map_range(&self, map_id: &MapId) -> impl Iterator<Item = (&TileKey, &CacheEntry)> {
        let start = TileKey::new(map_id.clone(), 0, 0, 0);
        self.entries
            .range(start..)
            .take_while(move |(k, _)| &k.map_id == map_id)
    }

    fn pending_for_map(&self, map_id: &MapId) -> usize {
        self.map_range(map_id)
            .filter(|(_, e)| matches!(e.state, TileState::Pending { .. }))
            .count()
    }

    /// Evict tiles no longer relevant.
    ///
    /// Maps missing from `prune_info` lose all of their tiles.
    pub fn prune(&mut self, prune_info: &HashMap<MapId, PruneInfo>) -> usize {
        let evict: Vec<TileKey> = self
            .entries
            .iter()
            .filter(|(key, entry)| {
                prune_info
                    .get(&key.map_id)
                    .is_none_or(|info| !info.keeps(key, &entry.tile.bounds))
            })
            .map(|(key, _)| key.clone())
            .collect();
        self.evict(evict)
    }

    /// Evict every tile of one map
    pub fn remove_map(&mut self, map_id: &MapId) -> usize {
        let evict: Vec<TileKey> = self.map_range(map_id).map(|(k, _)| k.clone()).collect();
        self.evict(evict)
    }

    fn evict(&mut self, keys: Vec<TileKey>) -> usize {
        let count = keys.len();
        for key in keys {
            let Some(entry) = self.entries.remove(&key) else {
                continue;
            };
            match entry.state {
                TileState::Pending { cancel, .. } => cancel.cancel(),
                TileState::Loaded(cached) => {
                    self.current_memory -= cached.memory_size;
                    if let Some(loaded) = self.loaded_per_map.get_mut(&key.map_id) {
                        *loaded = loaded.saturating_sub(1);
                        if *loaded == 0 {
                            self.loaded_per_map.remove(&key.map_id);
                        }
                    }
                }
                TileState::Errored(_) => {}
            }
            log::debug!("Evicted tile {:?}", key);
            self.events.push(Event::TileRemoved(key));
        }
        count
    }

    /// Clear all tiles from cache
    pub fn clear(&mut self) -> usize {
        let keys: Vec<TileKey> = self.entries.keys().cloned().collect();
        self.evict(keys)
    }

    /// Decoded pixels of a loaded tile
    pub fn get(&self, key: &TileKey) -> Option<Arc<TileImage>> {
        match &self.entries.get(key)?.state {
            TileState::Loaded(cached) => Some(cached.image.clone()),
            _ => None,
        }
    }

    pub fn status(&self, key: &TileKey) -> Option<TileStatus> {
        self.entries.get(key).map(|e| match e.state {
            TileState::Pending { .. } => TileStatus::Pending,
            TileState::Loaded(_) => TileStatus::Loaded,
            TileState::Errored(_) => TileStatus::Errored,
        })
    }

    pub fn error(&self, key: &TileKey) -> Option<&str> {
        match &self.entries.get(key)?.state {
            TileState::Errored(message) => Some(message),
            _ => None,
        }
    }

    /// Check if tile exists in cache, in any state
    pub fn contains(&self, key: &TileKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Loaded tiles of a map with their descriptors
    pub fn loaded_tiles_for_map<'a>(&'a self, map_id: &'a MapId) -> impl Iterator<Item = (&'a FetchableTile, Arc<TileImage>)> + 'a {
        self.map_range(map_id).filter_map(|(_, e)| match &e.state {
            TileState::Loaded(cached) => Some((&e.tile, cached.image.clone())),
            _ => None,
        })
    }

    pub fn keys_for_map<'a>(&'a self, map_id: &'a MapId) -> impl Iterator<Item = &'a TileKey> + 'a {
        self.map_range(map_id).map(|(k, _)| k)
    }

    /// Iterate over all cached tile keys
    pub fn tile_keys(&self) -> impl Iterator<Item = &TileKey> {
        self.entries.keys()
    }

    /// Get number of entries, any state
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            memory_used: self.current_memory,
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.state {
                TileState::Pending { .. } => stats.pending_count += 1,
                TileState::Loaded(_) => stats.tile_count += 1,
                TileState::Errored(_) => stats.errored_count += 1,
            }
        }
        stats
    }
}

/// Cache statistics for debugging/UI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub tile_count: usize,
    pub pending_count: usize,
    pub errored_count: usize,
    pub memory_used: usize,
}
