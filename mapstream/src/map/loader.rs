//! Threaded tile and image info loading with pluggable collaborators

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;

use super::tile::{ImageInfo, TileKey};
use super::MapId;

/// Decoded tile pixels
pub type TileImage = image::RgbaImage;

/// Shared flag a fetch checks to stop early; cancellation is best effort
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fetches raw tile bytes; hosts plug in their own HTTP or caching layer
pub trait TileFetcher: Send + Sync {
    fn fetch(&self, url: &str, cancel: &CancelToken) -> anyhow::Result<Vec<u8>>;
}

/// Turns fetched bytes into pixels
pub trait TileDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<TileImage>;
}

/// Image pyramid metadata and tile addressing for one image service
pub trait ImagePyramidProvider: Send + Sync {
    /// May block; always called off the owning thread
    fn load_image_info(&self, image_id: &str) -> anyhow::Result<ImageInfo>;

    fn tile_url(&self, image_id: &str, info: &ImageInfo, zoom_level: usize, column: u32, row: u32) -> String;
}

/// Decodes PNG and JPEG tiles with the `image` crate
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageDecoder;

impl TileDecoder for ImageDecoder {
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<TileImage> {
        Ok(decode_tile_image(bytes)?)
    }
}

/// Blocking HTTP fetcher
#[cfg(not(target_arch = "wasm32"))]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(not(target_arch = "wasm32"))]
impl HttpFetcher {
    pub fn new(user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl TileFetcher for HttpFetcher {
    fn fetch(&self, url: &str, cancel: &CancelToken) -> anyhow::Result<Vec<u8>> {
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled");
        }
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }
        let bytes = response.bytes()?;
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled");
        }
        Ok(bytes.to_vec())
    }
}

/// Result of a tile load operation
#[derive(Debug)]
pub enum TileLoadResult {
    Success {
        key: TileKey,
        request_id: u64,
        image: Arc<TileImage>,
    },
    Failed {
        key: TileKey,
        request_id: u64,
        message: String,
    },
}

impl TileLoadResult {
    pub fn key(&self) -> &TileKey {
        match self {
            TileLoadResult::Success { key, .. } | TileLoadResult::Failed { key, .. } => key,
        }
    }

    pub fn request_id(&self) -> u64 {
        match self {
            TileLoadResult::Success { request_id, .. } | TileLoadResult::Failed { request_id, .. } => *request_id,
        }
    }
}

/// Tile loading request
#[derive(Debug, Clone)]
struct TileRequest {
    key: TileKey,
    url: String,
    request_id: u64,
    cancel: CancelToken,
}

/// Fixed pool of worker threads fetching and decoding tiles
pub struct TileLoader {
    result_rx: Receiver<TileLoadResult>,
    request_tx: Sender<TileRequest>,
    _workers: Vec<JoinHandle<()>>,
}

impl TileLoader {
    pub fn new(fetcher: Arc<dyn TileFetcher>, decoder: Arc<dyn TileDecoder>, workers: usize) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<TileRequest>();
        let (result_tx, result_rx) = mpsc::channel::<TileLoadResult>();
        let request_rx = Arc::new(Mutex::new(request_rx));

        let _workers = (0..workers.max(1))
            .map(|_| {
                let request_rx = request_rx.clone();
                let result_tx = result_tx.clone();
                let fetcher = fetcher.clone();
                let decoder = decoder.clone();
                std::thread::spawn(move || {
                    Self::worker_thread(request_rx, result_tx, fetcher, decoder);
                })
            })
            .collect();

        Self {
            result_rx,
            request_tx,
            _workers,
        }
    }

    /// Queue a fetch; false if the workers are gone
    pub fn request(&self, key: TileKey, url: String, request_id: u64, cancel: CancelToken) -> bool {
        debug!("Requesting tile {url}");
        self.request_tx
            .send(TileRequest {
                key,
                url,
                request_id,
                cancel,
            })
            .is_ok()
    }

    /// Poll for a completed tile load
    pub fn poll(&self) -> Option<TileLoadResult> {
        match self.result_rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for a completed tile load
    pub fn poll_timeout(&self, timeout: Duration) -> Option<TileLoadResult> {
        match self.result_rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn worker_thread(
        request_rx: Arc<Mutex<Receiver<TileRequest>>>,
        result_tx: Sender<TileLoadResult>,
        fetcher: Arc<dyn TileFetcher>,
        decoder: Arc<dyn TileDecoder>,
    ) {
        loop {
            let next = match request_rx.lock() {
                Ok(rx) => rx.recv(),
                Err(_) => break,
            };
            let Ok(request) = next else {
                break; // Loader dropped
            };
            if request.cancel.is_cancelled() {
                continue;
            }

            let result = fetcher
                .fetch(&request.url, &request.cancel)
                .and_then(|bytes| decoder.decode(&bytes));

            if request.cancel.is_cancelled() {
                debug!("Dropping cancelled tile {:?}", request.key);
                continue;
            }

            let result = match result {
                Ok(image) => TileLoadResult::Success {
                    key: request.key,
                    request_id: request.request_id,
                    image: Arc::new(image),
                },
                Err(e) => TileLoadResult::Failed {
                    key: request.key,
                    request_id: request.request_id,
                    message: format!("{e:#}"),
                },
            };

            if result_tx.send(result).is_err() {
                break; // Receiver dropped, exit thread
            }
        }
    }
}

/// Result of an image info load
#[derive(Debug)]
pub enum ImageInfoResult {
    Loaded { map_id: MapId, info: Arc<ImageInfo> },
    Failed { map_id: MapId, message: String },
}

#[derive(Debug)]
struct ImageInfoRequest {
    map_id: MapId,
    image_id: String,
}

/// Loads pyramid metadata on a small worker pool, one load per map at a time
pub struct ImageInfoLoader {
    provider: Arc<dyn ImagePyramidProvider>,
    request_tx: Sender<ImageInfoRequest>,
    result_rx: Receiver<ImageInfoResult>,
    pending: HashSet<MapId>,
    _workers: Vec<JoinHandle<()>>,
}

impl ImageInfoLoader {
    pub fn new(provider: Arc<dyn ImagePyramidProvider>, workers: usize) -> Self {
        let (request_tx, request_rx) = mpsc::channel::<ImageInfoRequest>();
        let (result_tx, result_rx) = mpsc::channel::<ImageInfoResult>();
        let request_rx = Arc::new(Mutex::new(request_rx));

        let _workers = (0..workers.max(1))
            .map(|_| {
                let request_rx = request_rx.clone();
                let result_tx = result_tx.clone();
                let provider = provider.clone();
                std::thread::spawn(move || {
                    Self::worker_thread(request_rx, result_tx, provider);
                })
            })
            .collect();

        Self {
            provider,
            request_tx,
            result_rx,
            pending: HashSet::new(),
            _workers,
        }
    }

    pub fn provider(&self) -> &Arc<dyn ImagePyramidProvider> {
        &self.provider
    }

    /// Queue a load unless one is already pending for this map
    pub fn request(&mut self, map_id: &MapId, image_id: &str) -> bool {
        if !self.pending.insert(map_id.clone()) {
            return false;
        }
        debug!("Requesting image info for {map_id}");
        let sent = self
            .request_tx
            .send(ImageInfoRequest {
                map_id: map_id.clone(),
                image_id: image_id.to_string(),
            })
            .is_ok();
        if !sent {
            self.pending.remove(map_id);
        }
        sent
    }

    fn worker_thread(
        request_rx: Arc<Mutex<Receiver<ImageInfoRequest>>>,
        result_tx: Sender<ImageInfoResult>,
        provider: Arc<dyn ImagePyramidProvider>,
    ) {
        loop {
            let next = match request_rx.lock() {
                Ok(rx) => rx.recv(),
                Err(_) => break,
            };
            let Ok(ImageInfoRequest { map_id, image_id }) = next else {
                break;
            };
            let result = match provider.load_image_info(&image_id) {
                Ok(info) => ImageInfoResult::Loaded {
                    map_id,
                    info: Arc::new(info),
                },
                Err(e) => ImageInfoResult::Failed {
                    map_id,
                    message: format!("{e:#}"),
                },
            };
            if result_tx.send(result).is_err() {
                break;
            }
        }
    }

    pub fn poll(&mut self) -> Option<ImageInfoResult> {
        let result = self.result_rx.try_recv().ok()?;
        self.settle(&result);
        Some(result)
    }

    pub fn poll_timeout(&mut self, timeout: Duration) -> Option<ImageInfoResult> {
        let result = self.result_rx.recv_timeout(timeout).ok()?;
        self.settle(&result);
        Some(result)
    }

    fn settle(&mut self, result: &ImageInfoResult) {
        match result {
            ImageInfoResult::Loaded { map_id, .. } | ImageInfoResult::Failed { map_id, .. } => {
                self.pending.remove(map_id);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Decode PNG/JPEG bytes into RGBA pixels
pub fn decode_tile_image(data: &[u8]) -> Result<image::RgbaImage, image::ImageError> {
    let img = image::load_from_memory(data)?;
    Ok(img.to_rgba8())
}

/// Calculate memory size for a decoded tile
pub fn tile_memory_size(width: u32, height: u32) -> usize {
    (width as usize) * (height as usize) * 4 // RGBA8 = 4 bytes per pixel
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoFetcher;

    impl TileFetcher for EchoFetcher {
        fn fetch(&self, url: &str, _cancel: &CancelToken) -> anyhow::Result<Vec<u8>> {
            if url.contains("missing") {
                anyhow::bail!("HTTP 404 Not Found");
            }
            Ok(url.as_bytes().to_vec())
        }
    }

    struct SizeDecoder;

    impl TileDecoder for SizeDecoder {
        fn decode(&self, bytes: &[u8]) -> anyhow::Result<TileImage> {
            Ok(TileImage::new(bytes.len() as u32, 1))
        }
    }

    fn loader() -> TileLoader {
        TileLoader::new(Arc::new(EchoFetcher), Arc::new(SizeDecoder), 2)
    }

    #[test]
    fn test_success_and_failure_results() {
        let loader = loader();
        assert!(loader.request(TileKey::new("m", 0, 0, 0), "abc".into(), 1, CancelToken::new()));
        assert!(loader.request(TileKey::new("m", 0, 1, 0), "missing".into(), 2, CancelToken::new()));

        let mut results: Vec<TileLoadResult> = (0..2)
            .filter_map(|_| loader.poll_timeout(Duration::from_secs(5)))
            .collect();
        results.sort_by_key(|r| r.request_id());
        match &results[0] {
            TileLoadResult::Success { image, .. } => assert_eq!(image.width(), 3),
            other => panic!("unexpected {other:?}"),
        }
        match &results[1] {
            TileLoadResult::Failed { message, .. } => assert!(message.contains("404")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_request_is_dropped() {
        let loader = loader();
        let cancel = CancelToken::new();
        cancel.cancel();
        loader.request(TileKey::new("m", 0, 0, 0), "abc".into(), 1, cancel);
        assert!(loader.poll_timeout(Duration::from_millis(200)).is_none());
    }

    /// Tracks how many loads run at once
    #[derive(Default)]
    struct SlowProvider {
        active: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    impl ImagePyramidProvider for SlowProvider {
        fn load_image_info(&self, image_id: &str) -> anyhow::Result<ImageInfo> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            self.active.fetch_sub(1, Ordering::SeqCst);
            if image_id == "missing" {
                anyhow::bail!("HTTP 404 Not Found");
            }
            Ok(ImageInfo::new(100, 100, [(1, 64, 64)]))
        }

        fn tile_url(&self, image_id: &str, _info: &ImageInfo, z: usize, column: u32, row: u32) -> String {
            format!("{image_id}/{z}/{column}/{row}")
        }
    }

    #[test]
    fn test_image_info_loads_share_a_bounded_pool() {
        let provider = Arc::new(SlowProvider::default());
        let mut loader = ImageInfoLoader::new(provider.clone(), 2);

        for i in 0..12 {
            let image_id = if i == 5 { "missing".to_string() } else { format!("img-{i}") };
            assert!(loader.request(&format!("m{i}"), &image_id));
        }
        // Already pending
        assert!(!loader.request(&"m0".to_string(), "img-0"));
        assert_eq!(loader.pending_count(), 12);

        let mut failed = Vec::new();
        for _ in 0..12 {
            match loader.poll_timeout(Duration::from_secs(5)) {
                Some(ImageInfoResult::Failed { map_id, .. }) => failed.push(map_id),
                Some(ImageInfoResult::Loaded { .. }) => {}
                None => panic!("timed out waiting for image info"),
            }
        }
        assert_eq!(failed, vec!["m5".to_string()]);
        assert_eq!(loader.pending_count(), 0);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ImageDecoder.decode(b"not an image").is_err());
    }

    #[test]
    fn test_tile_memory_size() {
        assert_eq!(tile_memory_size(256, 256), 262_144);
    }
}
