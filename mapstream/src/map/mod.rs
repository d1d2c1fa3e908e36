//! Map system: warped map list, tile requirements and tile cache

pub mod cache;
pub mod camera;
pub mod events;
pub mod index;
pub mod list;
pub mod loader;
pub mod options;
pub mod requirements;
pub mod tile;
pub mod transition;
pub mod warped;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cache::{CacheStats, TileCache, TileStatus};
use camera::Viewport;
use events::{Event, EventBus, EventKind, SubscriptionId};
use list::{Selection, WarpedMapList};
use loader::{ImageDecoder, ImageInfoLoader, ImageInfoResult, ImagePyramidProvider, TileDecoder, TileFetcher};
use options::{MapOptions, OptionKey};
use tile::FetchableTile;
use transition::{Clock, SystemClock, Transition};
use warped::{GeoreferencedMap, WarpedMap};

use crate::config::MapSystemConfig;
use crate::error::Result;
use crate::geo::{Bbox, Point, Projection, Ring};
use crate::transform::{PolynomialFactory, TransformerFactory};

/// Maps are identified by a string, usually a checksum of the georeference
pub type MapId = String;

/// Pluggable pieces the map system runs on
pub struct Collaborators {
    pub fetcher: Arc<dyn TileFetcher>,
    pub decoder: Arc<dyn TileDecoder>,
    pub provider: Arc<dyn ImagePyramidProvider>,
    pub transformer_factory: Box<dyn TransformerFactory>,
    pub clock: Box<dyn Clock>,
}

impl Collaborators {
    /// PNG/JPEG decoding, affine transforms and the system clock
    pub fn new(fetcher: Arc<dyn TileFetcher>, provider: Arc<dyn ImagePyramidProvider>) -> Self {
        Self {
            fetcher,
            decoder: Arc::new(ImageDecoder),
            provider,
            transformer_factory: Box::new(PolynomialFactory),
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn TileDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_transformer_factory(mut self, factory: Box<dyn TransformerFactory>) -> Self {
        self.transformer_factory = factory;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Integrated map system
pub struct MapSystem {
    config: MapSystemConfig,
    list: WarpedMapList,
    tile_cache: TileCache,
    info_loader: ImageInfoLoader,
    events: EventBus,
    clock: Box<dyn Clock>,

    viewport: Option<Viewport>,
    anticipate_interaction: bool,

    /// Request-tier maps of the last pass
    maps_in_viewport: HashSet<MapId>,
    /// Maps whose metadata failed to load; not retried until re-added
    info_failed: HashSet<MapId>,
    transitions: HashMap<MapId, Transition>,
}

impl MapSystem {
    pub fn new(config: MapSystemConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            fetcher,
            decoder,
            provider,
            transformer_factory,
            clock,
        } = collaborators;

        let mut list = WarpedMapList::new(transformer_factory, config.spatial_index);
        list.set_max_geometry_warnings(config.max_geometry_warnings);
        list.set_default_options(MapOptions {
            projection: Some(config.projection),
            ..Default::default()
        });

        Self {
            tile_cache: TileCache::new(fetcher, decoder, config.fetch_workers),
            info_loader: ImageInfoLoader::new(provider, config.image_info_workers),
            list,
            events: EventBus::new(),
            clock,
            viewport: None,
            anticipate_interaction: false,
            maps_in_viewport: HashSet::new(),
            info_failed: HashSet::new(),
            transitions: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &MapSystemConfig {
        &self.config
    }

    pub fn list(&self) -> &WarpedMapList {
        &self.list
    }

    pub fn tile_cache(&self) -> &TileCache {
        &self.tile_cache
    }

    pub fn get_map(&self, id: &MapId) -> Option<&WarpedMap> {
        self.list.get_map(id)
    }

    pub fn viewport(&self) -> Option<&Viewport> {
        self.viewport.as_ref()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.tile_cache.stats()
    }

    /// Metadata loads still in flight
    pub fn pending_image_info(&self) -> usize {
        self.info_loader.pending_count()
    }

    // Events

    pub fn subscribe(&mut self, listener: impl FnMut(&Event) + 'static) -> SubscriptionId {
        self.events.subscribe(listener)
    }

    pub fn subscribe_to(&mut self, kind: EventKind, listener: impl FnMut(&Event) + 'static) -> SubscriptionId {
        self.events.subscribe_to(kind, listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Forward buffered list and cache events to subscribers
    fn flush_events(&mut self) {
        let mut events = self.list.take_events();
        events.extend(self.tile_cache.take_events());

        let mut geometry_changed = false;
        for event in &events {
            match event {
                Event::AnimatedChange { map_ids, keys } => {
                    let now = self.clock.now();
                    let duration = Duration::from_millis(self.config.animation_duration_ms);
                    for id in map_ids {
                        self.transitions.insert(id.clone(), Transition::new(now, duration));
                    }
                    geometry_changed |= keys.iter().any(OptionKey::affects_geometry);
                }
                Event::ImmediateChange { keys, .. } => {
                    geometry_changed |= keys.iter().any(OptionKey::affects_geometry);
                }
                _ => {}
            }
        }
        self.events.emit_all(events);

        if geometry_changed {
            self.update_requirements();
            let pruned = self.tile_cache.take_events();
            self.events.emit_all(pruned);
        }
    }

    // Lifecycle

    pub fn add_map(&mut self, georeference: GeoreferencedMap) -> Result<MapId> {
        let result = self.list.add_map(georeference);
        if let Ok(id) = &result {
            self.info_failed.remove(id);
        }
        self.flush_events();
        result
    }

    pub fn add_from_batch(&mut self, georeferences: impl IntoIterator<Item = GeoreferencedMap>) -> Vec<Result<MapId>> {
        let results = self.list.add_from_batch(georeferences);
        for id in results.iter().flatten() {
            self.info_failed.remove(id);
        }
        self.flush_events();
        results
    }

    pub fn remove_map(&mut self, georeference: &GeoreferencedMap) -> Result<MapId> {
        let id = georeference.map_id()?;
        self.remove_map_by_id(&id)
    }

    /// Remove a map and evict every cached tile it owns
    pub fn remove_map_by_id(&mut self, id: &MapId) -> Result<MapId> {
        let removed = self.list.remove_map_by_id(id)?;
        self.forget_map(&removed);
        self.flush_events();
        Ok(removed)
    }

    pub fn remove_from_batch<'a>(
        &mut self,
        georeferences: impl IntoIterator<Item = &'a GeoreferencedMap>,
    ) -> Vec<Result<MapId>> {
        let results = self.list.remove_from_batch(georeferences);
        for id in results.iter().flatten() {
            self.forget_map(id);
        }
        self.flush_events();
        results
    }

    fn forget_map(&mut self, id: &MapId) {
        let evicted = self.tile_cache.remove_map(id);
        log::debug!("Evicted {} tiles of removed map {}", evicted, id);
        self.maps_in_viewport.remove(id);
        self.info_failed.remove(id);
        self.transitions.remove(id);
    }

    pub fn clear(&mut self) {
        self.list.clear();
        self.tile_cache.clear();
        self.maps_in_viewport.clear();
        self.info_failed.clear();
        self.transitions.clear();
        self.flush_events();
    }

    // Viewport

    /// Run a full requirement pass for a new viewport
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
        self.update_requirements();
        self.flush_events();
    }

    /// While interacting, overview tiles are fetched for nearby maps too
    pub fn set_anticipate_interaction(&mut self, anticipate: bool) {
        if self.anticipate_interaction != anticipate {
            self.anticipate_interaction = anticipate;
            self.update_requirements();
            self.flush_events();
        }
    }

    /// Visible maps in `viewport` buffered by `buffer_ratio`, closest first
    pub fn find_maps(&self, viewport: &Viewport, buffer_ratio: f64) -> Vec<MapId> {
        requirements::find_maps(&self.list, viewport, buffer_ratio)
    }

    fn update_requirements(&mut self) {
        let Some(viewport) = self.viewport.clone() else {
            return;
        };
        let provider = self.info_loader.provider().clone();

        // 1. Decide tiers and tiles
        let req = requirements::compute(
            &mut self.list,
            &viewport,
            &self.config,
            provider.as_ref(),
            self.anticipate_interaction,
        );

        // 2. Ask for missing metadata
        for id in &req.image_info_needed {
            if self.info_failed.contains(id) {
                continue;
            }
            let Some(image_id) = self.list.get_map(id).map(|m| m.image_id().to_string()) else {
                continue;
            };
            if self.info_loader.request(id, &image_id) {
                self.events.emit(&Event::ImageInfoNeeded(id.clone()));
            }
        }

        // 3. Viewport membership
        let now_in: HashSet<MapId> = req.request.iter().cloned().collect();
        for id in &req.request {
            if !self.maps_in_viewport.contains(id) {
                self.events.emit(&Event::MapEnteredViewport(id.clone()));
            }
        }
        let mut left: Vec<&MapId> = self.maps_in_viewport.difference(&now_in).collect();
        left.sort();
        for id in left {
            self.events.emit(&Event::MapLeftViewport(id.clone()));
        }
        self.maps_in_viewport = now_in;

        // 4. Fetch, skipping tiles that already failed
        let wanted: Vec<FetchableTile> = req
            .tiles
            .iter()
            .chain(req.overview_tiles.iter())
            .filter(|t| self.tile_cache.status(&t.key) != Some(TileStatus::Errored))
            .cloned()
            .collect();
        let started = self.tile_cache.request(&wanted);

        // 5. Drop what no tier needs any more
        let pruned = self.tile_cache.prune(&req.prune_info);
        log::debug!(
            "Viewport pass: {} maps in view, {} tiles wanted, {} fetches started, {} pruned",
            req.request.len(),
            wanted.len(),
            started,
            pruned
        );
    }

    /// Request specific tiles, retrying errored ones
    pub fn request_tiles(&mut self, tiles: &[FetchableTile]) -> usize {
        let started = self.tile_cache.request(tiles);
        self.flush_events();
        started
    }

    // Background results

    /// Apply finished metadata loads and tile fetches without blocking
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Some(result) = self.info_loader.poll() {
            self.apply_image_info(result);
            applied += 1;
        }
        applied += self.tile_cache.poll();
        self.flush_events();
        applied
    }

    /// Wait up to `timeout` for a tile result, then apply everything ready
    pub fn poll_timeout(&mut self, timeout: Duration) -> usize {
        let ready = self.poll();
        if ready > 0 {
            return ready;
        }
        // Metadata unblocks tile requests, so wait on it first
        if self.info_loader.pending_count() > 0 {
            if let Some(result) = self.info_loader.poll_timeout(timeout) {
                self.apply_image_info(result);
                return 1 + self.poll();
            }
            return 0;
        }
        let applied = self.tile_cache.poll_timeout(timeout);
        self.flush_events();
        applied
    }

    fn apply_image_info(&mut self, result: ImageInfoResult) {
        match result {
            ImageInfoResult::Loaded { map_id, info } => {
                if self.list.set_image_info(&map_id, info).is_err() {
                    log::debug!("Image info arrived for removed map {}", map_id);
                    return;
                }
                self.events.emit(&Event::ImageInfoLoaded(map_id));
                self.update_requirements();
            }
            ImageInfoResult::Failed { map_id, message } => {
                log::warn!("Failed to load image info for map {}: {}", map_id, message);
                self.info_failed.insert(map_id.clone());
                self.events.emit(&Event::ImageInfoError { map_id, message });
            }
        }
    }

    // Transitions

    /// Finish elapsed transitions; returns the maps whose transition ended
    pub fn tick(&mut self) -> Vec<MapId> {
        let now = self.clock.now();
        let mut finished: Vec<MapId> = self
            .transitions
            .iter()
            .filter(|(_, t)| t.is_finished(now))
            .map(|(id, _)| id.clone())
            .collect();
        finished.sort();
        for id in &finished {
            self.transitions.remove(id);
        }
        finished
    }

    /// Eased progress of a running transition
    pub fn animation_progress(&self, id: &MapId) -> Option<f64> {
        self.transitions.get(id).map(|t| t.eased_progress(self.clock.now()))
    }

    pub fn is_animating(&self) -> bool {
        !self.transitions.is_empty()
    }

    // Selection

    pub fn get_map_ids(&self, selection: &Selection) -> Vec<MapId> {
        self.list.get_map_ids(selection)
    }

    pub fn get_maps(&self, selection: &Selection) -> Vec<&WarpedMap> {
        self.list.get_maps(selection)
    }

    pub fn get_maps_bbox(&self, selection: &Selection, projection: Option<Projection>) -> Option<Bbox> {
        self.list.get_maps_bbox(selection, projection)
    }

    pub fn get_maps_center(&self, selection: &Selection, projection: Option<Projection>) -> Option<Point> {
        self.list.get_maps_center(selection, projection)
    }

    pub fn get_maps_convex_hull(&self, selection: &Selection, projection: Option<Projection>) -> Option<Ring> {
        self.list.get_maps_convex_hull(selection, projection)
    }

    // Z-order

    pub fn get_z_index(&self, id: &MapId) -> Option<usize> {
        self.list.get_z_index(id)
    }

    pub fn bring_to_front(&mut self, ids: &[MapId]) {
        self.list.bring_to_front(ids);
        self.flush_events();
    }

    pub fn send_to_back(&mut self, ids: &[MapId]) {
        self.list.send_to_back(ids);
        self.flush_events();
    }

    pub fn bring_forward(&mut self, ids: &[MapId]) {
        self.list.bring_forward(ids);
        self.flush_events();
    }

    pub fn send_backward(&mut self, ids: &[MapId]) {
        self.list.send_backward(ids);
        self.flush_events();
    }

    // Visibility

    pub fn show(&mut self, ids: &[MapId]) {
        self.list.show(ids);
        self.flush_events();
    }

    pub fn hide(&mut self, ids: &[MapId]) {
        self.list.hide(ids);
        self.flush_events();
    }

    // Options

    pub fn set_map_options(&mut self, ids: &[MapId], options: &MapOptions) {
        self.list.set_map_options(ids, options);
        self.flush_events();
    }

    pub fn set_list_options(&mut self, options: MapOptions) {
        self.list.set_list_options(options);
        self.flush_events();
    }

    pub fn set_default_options(&mut self, options: MapOptions) {
        self.list.set_default_options(options);
        self.flush_events();
    }

    pub fn set_override_options(&mut self, options: MapOptions) {
        self.list.set_override_options(options);
        self.flush_events();
    }
}
