use crate::remote::client::RemoteResult;
use image::DynamicImage;
use imghash::{ImageHasher, perceptual::PerceptualHasher};
use indexmap::IndexMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

pub const CACHE_TTL: Duration = Duration::from_secs(10);
pub const CACHE_CAPACITY: usize = 32;
const BRIGHTNESS_BUCKET: f64 = 20.0;

/// Content key: perceptual hash of the image plus a coarse brightness bucket,
/// so the same pose under different lighting is looked up separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    phash: String,
    bucket: u32,
}

impl CacheKey {
    pub fn from_parts(phash: impl Into<String>, mean_luma: f64) -> Self {
        Self {
            phash: phash.into(),
            bucket: (mean_luma.max(0.0) / BRIGHTNESS_BUCKET).floor() as u32,
        }
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        let phash = PerceptualHasher::default().hash_from_img(image).encode();
        let gray = image.to_luma8();
        let pixels = gray.len().max(1) as f64;
        let mean = gray.iter().map(|v| f64::from(*v)).sum::<f64>() / pixels;
        Self::from_parts(phash, mean)
    }

    pub fn bucket(&self) -> u32 {
        self.bucket
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.phash, self.bucket)
    }
}

/// LRU result cache with per-entry TTL. Holds both positive and negative results.
#[derive(Debug, Clone)]
pub struct ResultCache {
    ttl: Duration,
    capacity: usize,
    entries: IndexMap<CacheKey, (Instant, RemoteResult)>,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CACHE_TTL, CACHE_CAPACITY)
    }
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: IndexMap::new(),
        }
    }

    pub fn get(&mut self, key: &CacheKey, now: Instant) -> Option<RemoteResult> {
        let (stored_at, result) = self.entries.shift_remove(key)?;
        if now.saturating_duration_since(stored_at) > self.ttl {
            return None;
        }
        // Reinsert at the back to mark it most recently used.
        self.entries.insert(key.clone(), (stored_at, result.clone()));
        Some(result)
    }

    pub fn insert(&mut self, key: CacheKey, result: RemoteResult, now: Instant) {
        self.entries.shift_remove(&key);
        self.entries.insert(key, (now, result));
        while self.entries.len() > self.capacity {
            self.entries.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
