//! LRU store of rendered tile bitmaps keyed by grid position. Owns memory
//! accounting and the protected set that keeps currently-visible tiles alive
//! across concurrent re-renders.
//!
//! Invariants:
//! - `sum(entry.memory_bytes()) == total_memory()` always.
//! - After any public operation, `total_memory() <= max_memory_bytes` unless
//!   every entry is protected.
//! - `get` returns only clean entries; `get_stale` returns any entry.
//! - Protection is monotone within a render cycle.
//! - `last_access` is non-decreasing across accesses to the same entry.

use scene_protocol::{RasterSurface, StrokeId, SurfaceAcquisitionError, WorldRect};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tile_types::{TileEntry, TileFreshness, TileKey, ZoomBand};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    pub max_memory_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            // 256 MiB, a generous default for an interactive session.
            max_memory_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// Spec.md §7 "surface-acquisition failure": the tile is not cached and
    /// the caller should log and retry on the next authoritative call.
    SurfaceAcquisitionFailed(SurfaceAcquisitionError),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::SurfaceAcquisitionFailed(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for CacheError {}

pub struct TileCache {
    config: CacheConfig,
    entries: HashMap<TileKey, TileEntry>,
    protected: HashSet<TileKey>,
    total_memory: u64,
}

impl TileCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            protected: HashSet::new(),
            total_memory: 0,
        }
    }

    pub fn memory_usage(&self) -> u64 {
        self.total_memory
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.config.max_memory_bytes
    }

    /// Reuses the existing entry at `key` if present (resizing its pixel
    /// surface if the band changed), or creates a new one, evicting as
    /// needed. Always marks the result `Stale`, clears `stroke_ids`, and
    /// bumps `last_access`.
    pub fn allocate(
        &mut self,
        key: TileKey,
        world_bounds: WorldRect,
        band: ZoomBand,
        tile_physical: u32,
        scale: f64,
    ) -> Result<&mut TileEntry, CacheError> {
        let now = Instant::now();
        let new_bytes = (tile_physical as u64) * (tile_physical as u64) * 4;
        let existing_bytes = self.entries.get(&key).map(|e| e.memory_bytes()).unwrap_or(0);
        let same_size_reuse = self
            .entries
            .get(&key)
            .is_some_and(|entry| entry.pixels.width() == tile_physical && entry.pixels.height() == tile_physical);

        if !same_size_reuse {
            self.ensure_capacity(existing_bytes, new_bytes, Some(key))?;
        }

        match self.entries.get_mut(&key) {
            Some(entry) if same_size_reuse => {
                // Same physical size: preserve pixel-buffer identity, avoid
                // surface churn (spec.md §4.2 edge case).
                entry.world_bounds = world_bounds;
                entry.freshness = TileFreshness::Stale(band);
                entry.stroke_ids.clear();
                entry.last_access = now;
            }
            Some(entry) => {
                tracing::trace!(tile = %key_log(key), "tile_cache: resizing entry for new band");
                self.total_memory -= entry.memory_bytes();
                entry.pixels =
                    RasterSurface::new(tile_physical, tile_physical, scale, world_bounds.min_x, world_bounds.min_y);
                self.total_memory += entry.memory_bytes();
                entry.world_bounds = world_bounds;
                entry.freshness = TileFreshness::Stale(band);
                entry.stroke_ids.clear();
                entry.last_access = now;
            }
            None => {
                tracing::trace!(tile = %key_log(key), "tile_cache: allocating new entry");
                let entry = TileEntry {
                    key,
                    pixels: RasterSurface::new(
                        tile_physical,
                        tile_physical,
                        scale,
                        world_bounds.min_x,
                        world_bounds.min_y,
                    ),
                    world_bounds,
                    freshness: TileFreshness::Stale(band),
                    stroke_ids: Vec::new(),
                    last_access: now,
                };
                self.total_memory += entry.memory_bytes();
                self.entries.insert(key, entry);
            }
        }

        self.assert_memory_accounting();
        Ok(self.entries.get_mut(&key).expect("just allocated"))
    }

    pub fn get(&mut self, key: TileKey) -> Option<&TileEntry> {
        let is_clean = self.entries.get(&key).is_some_and(|e| e.freshness.is_clean());
        if !is_clean {
            return None;
        }
        self.touch(key);
        self.entries.get(&key)
    }

    pub fn get_stale(&mut self, key: TileKey) -> Option<&TileEntry> {
        if self.entries.contains_key(&key) {
            self.touch(key);
        }
        self.entries.get(&key)
    }

    fn touch(&mut self, key: TileKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            let now = Instant::now();
            if now >= entry.last_access {
                entry.last_access = now;
            }
        }
    }

    pub fn mark_clean(&mut self, key: TileKey) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.freshness = TileFreshness::Clean(entry.freshness.rendered_at_band());
        }
    }

    /// Replaces pixels from a worker result and marks the entry clean.
    /// Returns `false` (and does nothing) if the entry is missing or its
    /// dimensions disagree with `tile_physical` — the caller (scheduler) is
    /// responsible for re-allocating first if the band changed in flight.
    pub fn upload_bitmap(
        &mut self,
        key: TileKey,
        band: ZoomBand,
        pixels: RasterSurface,
        stroke_ids: Vec<StrokeId>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        if entry.pixels.width() != pixels.width() || entry.pixels.height() != pixels.height() {
            return false;
        }
        self.total_memory -= entry.memory_bytes();
        entry.pixels = pixels;
        self.total_memory += entry.memory_bytes();
        entry.stroke_ids = stroke_ids;
        entry.freshness = TileFreshness::Clean(band);
        entry.last_access = Instant::now();
        self.assert_memory_accounting();
        true
    }

    pub fn invalidate(&mut self, keys: &[TileKey]) {
        for key in keys {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.freshness = entry.freshness.mark_stale();
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.freshness = entry.freshness.mark_stale();
        }
    }

    /// Marks every entry whose `stroke_ids` contains `id` as stale; returns
    /// the affected keys (for logging/diagnostics).
    pub fn invalidate_stroke(&mut self, id: StrokeId) -> Vec<TileKey> {
        let mut affected = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.contains_stroke(id) {
                entry.freshness = entry.freshness.mark_stale();
                affected.push(entry.key);
            }
        }
        affected
    }

    /// All stale entries, ordered so members of `visible_keys` sort before
    /// non-members (stable within each group).
    pub fn dirty_tiles(&self, visible_keys: &[TileKey]) -> Vec<&TileEntry> {
        let visible: HashSet<TileKey> = visible_keys.iter().copied().collect();
        let mut dirty: Vec<&TileEntry> = self
            .entries
            .values()
            .filter(|entry| !entry.freshness.is_clean())
            .collect();
        dirty.sort_by_key(|entry| !visible.contains(&entry.key));
        dirty
    }

    pub fn protect(&mut self, keys: &[TileKey]) {
        self.protected = keys.iter().copied().collect();
    }

    pub fn unprotect(&mut self) {
        self.protected.clear();
    }

    pub fn is_protected(&self, key: TileKey) -> bool {
        self.protected.contains(&key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.protected.clear();
        self.total_memory = 0;
    }

    /// Evicts the least-recently-used unprotected entries until `new_bytes`
    /// fits within `(max_memory_bytes - budget_already_committed)`, or until
    /// only protected entries remain (in which case the cache is permitted
    /// to exceed budget — correctness over eviction, per spec.md §4.2).
    fn ensure_capacity(
        &mut self,
        excluded_key_current_bytes: u64,
        new_bytes: u64,
        excluding: Option<TileKey>,
    ) -> Result<(), CacheError> {
        loop {
            let budget_committed = self.total_memory - excluded_key_current_bytes;
            if budget_committed + new_bytes <= self.config.max_memory_bytes {
                return Ok(());
            }

            let victim = self
                .entries
                .values()
                .filter(|entry| !self.protected.contains(&entry.key) && Some(entry.key) != excluding)
                .min_by_key(|entry| entry.last_access)
                .map(|entry| entry.key);

            match victim {
                Some(key) => {
                    tracing::trace!(tile = %key_log(key), "tile_cache: evicting lru entry");
                    let bytes = self.entries.remove(&key).expect("victim exists").memory_bytes();
                    self.total_memory -= bytes;
                }
                None => {
                    // Every remaining entry is protected (or excluded): the
                    // cache may temporarily exceed budget.
                    tracing::warn!(
                        requested_bytes = new_bytes,
                        current_bytes = self.total_memory,
                        max_bytes = self.config.max_memory_bytes,
                        "tile_cache: budget exceeded, all remaining entries protected"
                    );
                    return Ok(());
                }
            }
        }
    }

    fn assert_memory_accounting(&self) {
        debug_assert_eq!(
            self.entries.values().map(|e| e.memory_bytes()).sum::<u64>(),
            self.total_memory,
            "tile cache memory accounting drifted"
        );
    }
}

fn key_log(key: TileKey) -> String {
    format!("({}, {})", key.col, key.row)
}
