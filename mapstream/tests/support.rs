use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use web_time::Instant;

use mapstream::geo::Projection;
use mapstream::map::loader::{CancelToken, ImagePyramidProvider, TileDecoder, TileFetcher, TileImage};
use mapstream::map::tile::ImageInfo;
use mapstream::map::warped::{GeoreferencedMap, Resource, Transformation};
use mapstream::transform::{
    AffineTransformer, Gcp, TransformOptions, TransformationType, Transformer, TransformerFactory,
};
use mapstream::{Collaborators, Event, MapSystem, MapSystemConfig};

/// Fetcher that blocks until opened, counts calls and fails chosen urls.
#[allow(dead_code)]
pub struct FakeFetcher {
    open: Mutex<bool>,
    gate: Condvar,
    calls: AtomicUsize,
    urls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
}

#[allow(dead_code)]
impl FakeFetcher {
    pub fn open() -> Arc<Self> {
        Arc::new(Self::with_gate(true))
    }

    pub fn closed() -> Arc<Self> {
        Arc::new(Self::with_gate(false))
    }

    fn with_gate(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            gate: Condvar::new(),
            calls: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.gate.notify_all();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub fn fail(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn heal(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    /// Wait until at least `n` fetches have started
    pub fn wait_for_calls(&self, n: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.calls() < n {
            if Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }
}

impl TileFetcher for FakeFetcher {
    fn fetch(&self, url: &str, _cancel: &CancelToken) -> anyhow::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.gate.wait(open).unwrap();
        }
        drop(open);
        if self.failing.lock().unwrap().contains(url) {
            anyhow::bail!("HTTP 503");
        }
        Ok(url.as_bytes().to_vec())
    }
}

/// Every tile decodes to a 2x2 image
pub struct PixelDecoder;

impl TileDecoder for PixelDecoder {
    fn decode(&self, _bytes: &[u8]) -> anyhow::Result<TileImage> {
        Ok(TileImage::new(2, 2))
    }
}

/// Serves the same pyramid for every image unless told otherwise
#[allow(dead_code)]
pub struct FixedProvider {
    pub info: ImageInfo,
    missing: Mutex<HashSet<String>>,
    loads: AtomicUsize,
}

#[allow(dead_code)]
impl FixedProvider {
    /// 1000x1000 image with 64px tiles at scale factors 1, 2, 4 and 8
    pub fn new() -> Arc<Self> {
        Self::with_info(pyramid())
    }

    pub fn with_info(info: ImageInfo) -> Arc<Self> {
        Arc::new(Self {
            info,
            missing: Mutex::new(HashSet::new()),
            loads: AtomicUsize::new(0),
        })
    }

    pub fn make_missing(&self, image_id: &str) {
        self.missing.lock().unwrap().insert(image_id.to_string());
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ImagePyramidProvider for FixedProvider {
    fn load_image_info(&self, image_id: &str) -> anyhow::Result<ImageInfo> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.missing.lock().unwrap().contains(image_id) {
            anyhow::bail!("no such image: {image_id}");
        }
        Ok(self.info.clone())
    }

    fn tile_url(&self, image_id: &str, _info: &ImageInfo, zoom_level: usize, column: u32, row: u32) -> String {
        format!("mem://{image_id}/{zoom_level}/{column}/{row}")
    }
}

#[allow(dead_code)]
pub fn pyramid() -> ImageInfo {
    ImageInfo::new(1000, 1000, [(1, 64, 64), (2, 64, 64), (4, 64, 64), (8, 64, 64)])
}

/// Affine for every type, recording whether backward calls were approximate
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct RecordingFactory {
    pub approximate_calls: Arc<Mutex<Vec<bool>>>,
}

struct RecordingTransformer {
    inner: AffineTransformer,
    approximate_calls: Arc<Mutex<Vec<bool>>>,
}

impl Transformer for RecordingTransformer {
    fn transform_forward(&self, ring: &[[f64; 2]], options: TransformOptions) -> anyhow::Result<Vec<[f64; 2]>> {
        self.inner.transform_forward(ring, options)
    }

    fn transform_backward(&self, ring: &[[f64; 2]], options: TransformOptions) -> anyhow::Result<Vec<[f64; 2]>> {
        self.approximate_calls.lock().unwrap().push(options.approximate);
        self.inner.transform_backward(ring, options)
    }
}

impl TransformerFactory for RecordingFactory {
    fn build(&self, gcps: &[Gcp], _kind: TransformationType) -> anyhow::Result<Box<dyn Transformer>> {
        Ok(Box::new(RecordingTransformer {
            inner: AffineTransformer::from_gcps(gcps)?,
            approximate_calls: self.approximate_calls.clone(),
        }))
    }
}

/// 1000x1000 image covering `size` degrees north-east of `origin`
#[allow(dead_code)]
pub fn square_map(id: &str, origin: [f64; 2], size: f64) -> GeoreferencedMap {
    let [x, y] = origin;
    let s = 1000.0;
    GeoreferencedMap {
        id: Some(id.to_string()),
        resource: Resource {
            id: format!("img-{id}"),
            width: 1000,
            height: 1000,
        },
        gcps: vec![
            Gcp { resource: [0.0, 0.0], geo: [x, y + size] },
            Gcp { resource: [s, 0.0], geo: [x + size, y + size] },
            Gcp { resource: [0.0, s], geo: [x, y] },
            Gcp { resource: [s, s], geo: [x + size, y] },
        ],
        resource_mask: Vec::new(),
        transformation: None,
    }
}

/// Like [`square_map`] but with a dense grid of `n * n` gcps and a TPS transform
#[allow(dead_code)]
pub fn tps_map(id: &str, origin: [f64; 2], size: f64, n: usize) -> GeoreferencedMap {
    let mut map = square_map(id, origin, size);
    map.gcps = (0..n)
        .flat_map(|i| (0..n).map(move |j| (i, j)))
        .map(|(i, j)| {
            let u = i as f64 / (n - 1) as f64;
            let v = j as f64 / (n - 1) as f64;
            Gcp {
                resource: [u * 1000.0, v * 1000.0],
                geo: [origin[0] + u * size, origin[1] + (1.0 - v) * size],
            }
        })
        .collect();
    map.transformation = Some(Transformation {
        kind: TransformationType::ThinPlateSpline,
    });
    map
}

/// Plate carrée so degrees are projected units
#[allow(dead_code)]
pub fn test_config() -> MapSystemConfig {
    MapSystemConfig {
        projection: Projection::Equirectangular,
        fetch_workers: 2,
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn collaborators(fetcher: Arc<FakeFetcher>, provider: Arc<FixedProvider>) -> Collaborators {
    Collaborators::new(fetcher, provider).with_decoder(Arc::new(PixelDecoder))
}

#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[allow(dead_code)]
pub fn system_with(fetcher: Arc<FakeFetcher>, provider: Arc<FixedProvider>) -> MapSystem {
    init_logging();
    MapSystem::new(test_config(), collaborators(fetcher, provider))
}

#[allow(dead_code)]
pub fn record_events(system: &mut MapSystem) -> Rc<RefCell<Vec<Event>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    system.subscribe(move |event| sink.borrow_mut().push(event.clone()));
    events
}

/// Poll until `done` holds or two seconds pass
#[allow(dead_code)]
pub fn poll_until(system: &mut MapSystem, mut done: impl FnMut(&MapSystem) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        system.poll_timeout(Duration::from_millis(10));
        if done(system) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
    }
}

/// Poll until nothing is pending anywhere
#[allow(dead_code)]
pub fn settle(system: &mut MapSystem) -> bool {
    poll_until(system, |s| s.cache_stats().pending_count == 0 && s.pending_image_info() == 0)
}

#[allow(dead_code)]
pub fn count_by_map(events: &[Event]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for event in events {
        if let Event::TileRemoved(key) = event {
            *counts.entry(key.map_id.clone()).or_insert(0) += 1;
        }
    }
    counts
}
