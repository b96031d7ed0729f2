//! Bounded thumbnail cache.
//!
//! Lookups, insertions and evictions all run under one lock, so a reader never
//! sees a half-evicted entry. Decodes run on the blocking pool and notify every
//! waiter for the key once.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use image::RgbaImage;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::CacheConfig;

const BYTES_PER_PIXEL: u64 = 4;
const FAILURE_COST: u64 = 64;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported or corrupt image: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has no pixels")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

impl CanvasSize {
    pub fn byte_cost(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * BYTES_PER_PIXEL
    }
}

/// RGBA8 pixels of a fitted image centered on a fixed-size canvas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub pixels: Vec<u8>,
}

impl Thumbnail {
    pub fn byte_cost(&self) -> u64 {
        self.pixels.len() as u64
    }
}

pub trait ImageDecoder: Send + Sync + 'static {
    fn decode(&self, path: &Path, canvas: CanvasSize) -> Result<Thumbnail, DecodeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThumbnailDecoder;

impl ImageDecoder for ThumbnailDecoder {
    fn decode(&self, path: &Path, canvas: CanvasSize) -> Result<Thumbnail, DecodeError> {
        let bytes = std::fs::read(path)?;
        let source = image::load_from_memory(&bytes)?;
        let (source_width, source_height) = (source.width(), source.height());
        if source_width == 0 || source_height == 0 {
            return Err(DecodeError::Empty);
        }

        let (fit_width, fit_height) = fit_within(source_width, source_height, canvas);
        let fitted = source.resize_exact(fit_width, fit_height, FilterType::Triangle);

        let mut surface = RgbaImage::new(canvas.width, canvas.height);
        let x = (canvas.width - fit_width) / 2;
        let y = (canvas.height - fit_height) / 2;
        image::imageops::overlay(&mut surface, &fitted.to_rgba8(), i64::from(x), i64::from(y));

        Ok(Thumbnail {
            width: canvas.width,
            height: canvas.height,
            source_width,
            source_height,
            pixels: surface.into_raw(),
        })
    }
}

/// Largest size with the source aspect ratio that fits `bounds`. Never upscales.
pub fn fit_within(width: u32, height: u32, bounds: CanvasSize) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let scale = (f64::from(bounds.width) / f64::from(width))
        .min(f64::from(bounds.height) / f64::from(height))
        .min(1.0);
    let fit = |side: u32, limit: u32| ((f64::from(side) * scale).round() as u32).max(1).min(limit);
    (fit(width, bounds.width), fit(height, bounds.height))
}

#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    pub max_bytes: u64,
    pub canvas: CanvasSize,
    pub failure_retry: Duration,
}

impl From<&CacheConfig> for CacheSettings {
    fn from(value: &CacheConfig) -> Self {
        Self {
            max_bytes: value.max_bytes,
            canvas: CanvasSize {
                width: value.canvas_width,
                height: value.canvas_height,
            },
            failure_retry: value.failure_retry(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub in_flight: usize,
    pub decodes: u64,
}

pub enum Lookup {
    Ready(Arc<Thumbnail>),
    /// The key failed recently; show a placeholder.
    Placeholder,
    Pending(PendingImage),
}

impl Lookup {
    pub fn ready(&self) -> Option<&Arc<Thumbnail>> {
        match self {
            Self::Ready(thumbnail) => Some(thumbnail),
            _ => None,
        }
    }
}

/// Resolves once when the decode for its key completes; `None` means placeholder.
pub struct PendingImage {
    rx: oneshot::Receiver<Option<Arc<Thumbnail>>>,
}

impl PendingImage {
    pub async fn wait(self) -> Option<Arc<Thumbnail>> {
        self.rx.await.ok().flatten()
    }
}

type Waiter = oneshot::Sender<Option<Arc<Thumbnail>>>;

enum Slot {
    Image(Arc<Thumbnail>),
    Failed { at: Instant },
}

struct CacheEntry {
    slot: Slot,
    cost: u64,
    last_access: Instant,
}

struct CacheState {
    entries: LruCache<PathBuf, CacheEntry>,
    total_bytes: u64,
    in_flight: HashMap<PathBuf, Vec<Waiter>>,
}

impl CacheState {
    fn store(&mut self, key: PathBuf, entry: CacheEntry, max_bytes: u64) {
        if let Some(previous) = self.entries.pop(&key) {
            self.total_bytes -= previous.cost;
        }
        if entry.cost > max_bytes {
            tracing::debug!(path = %key.display(), cost = entry.cost, "entry larger than cache bound, not stored");
            return;
        }
        while self.total_bytes + entry.cost > max_bytes {
            let Some((evicted, old)) = self.entries.pop_lru() else {
                break;
            };
            self.total_bytes -= old.cost;
            tracing::trace!(path = %evicted.display(), idle_ms = old.last_access.elapsed().as_millis() as u64, "evicted");
        }
        self.total_bytes += entry.cost;
        self.entries.put(key, entry);
    }
}

struct Inner {
    state: Mutex<CacheState>,
    decoder: Arc<dyn ImageDecoder>,
    settings: CacheSettings,
    runtime: Handle,
    decodes: AtomicU64,
}

#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<Inner>,
}

impl ImageCache {
    pub fn new(settings: CacheSettings, decoder: Arc<dyn ImageDecoder>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState {
                    entries: LruCache::unbounded(),
                    total_bytes: 0,
                    in_flight: HashMap::new(),
                }),
                decoder,
                settings,
                runtime,
                decodes: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.inner.settings
    }

    /// Cached bitmap, recent-failure placeholder, or a handle to the one decode for `path`.
    pub fn get(&self, path: &Path) -> Lookup {
        let now = Instant::now();
        let mut state = self.inner.state.lock();

        if let Some(entry) = state.entries.get_mut(path) {
            entry.last_access = now;
            match &entry.slot {
                Slot::Image(thumbnail) => return Lookup::Ready(thumbnail.clone()),
                Slot::Failed { at } if now.duration_since(*at) < self.inner.settings.failure_retry => {
                    return Lookup::Placeholder;
                }
                Slot::Failed { .. } => {}
            }
        }

        let (tx, rx) = oneshot::channel();
        let first = match state.in_flight.entry(path.to_path_buf()) {
            Entry::Occupied(mut waiters) => {
                waiters.get_mut().push(tx);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![tx]);
                true
            }
        };
        drop(state);

        if first {
            self.spawn_decode(path.to_path_buf());
        }
        Lookup::Pending(PendingImage { rx })
    }

    /// Starts decodes for a page of results without waiting on them.
    pub fn prefetch<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) {
        for path in paths {
            let _ = self.get(path);
        }
    }

    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.total_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            max_bytes: self.inner.settings.max_bytes,
            in_flight: state.in_flight.len(),
            decodes: self.inner.decodes.load(Ordering::Relaxed),
        }
    }

    fn spawn_decode(&self, path: PathBuf) {
        self.inner.decodes.fetch_add(1, Ordering::Relaxed);
        let guard = DecodeGuard {
            inner: self.inner.clone(),
            path: Some(path),
        };
        self.inner.runtime.spawn_blocking(move || guard.run());
    }
}

/// Settles the in-flight key exactly once, even if the decoder panics.
struct DecodeGuard {
    inner: Arc<Inner>,
    path: Option<PathBuf>,
}

impl DecodeGuard {
    fn run(mut self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let decoded = match self.inner.decoder.decode(path, self.inner.settings.canvas) {
            Ok(thumbnail) => Some(Arc::new(thumbnail)),
            Err(error) => {
                tracing::debug!(path = %path.display(), %error, "decode failed, caching placeholder");
                None
            }
        };
        if let Some(path) = self.path.take() {
            self.inner.complete(path, decoded);
        }
    }
}

impl Drop for DecodeGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            tracing::warn!(path = %path.display(), "decoder did not finish, caching placeholder");
            self.inner.complete(path, None);
        }
    }
}

impl Inner {
    fn complete(&self, path: PathBuf, decoded: Option<Arc<Thumbnail>>) {
        let now = Instant::now();
        let entry = match &decoded {
            Some(thumbnail) => CacheEntry {
                cost: thumbnail.byte_cost(),
                slot: Slot::Image(thumbnail.clone()),
                last_access: now,
            },
            None => CacheEntry {
                cost: FAILURE_COST,
                slot: Slot::Failed { at: now },
                last_access: now,
            },
        };

        let waiters = {
            let mut state = self.state.lock();
            state.store(path.clone(), entry, self.settings.max_bytes);
            state.in_flight.remove(&path).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(decoded.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{fit_within, CanvasSize};

    const BOX: CanvasSize = CanvasSize {
        width: 256,
        height: 256,
    };

    #[test]
    fn landscape_fits_width() {
        assert_eq!(fit_within(1024, 512, BOX), (256, 128));
    }

    #[test]
    fn portrait_fits_height() {
        assert_eq!(fit_within(300, 1200, BOX), (64, 256));
    }

    #[test]
    fn small_images_are_not_upscaled() {
        assert_eq!(fit_within(40, 20, BOX), (40, 20));
    }

    #[test]
    fn extreme_ratios_keep_one_pixel() {
        assert_eq!(fit_within(10_000, 1, BOX), (256, 1));
    }
}
