//! Value types shared by the grid, cache, renderer, compositor and scheduler:
//! `TileKey`, zoom-band arithmetic, grid configuration, and the tile cache
//! entry itself.

use scene_protocol::{RasterSurface, StrokeId, WorldRect};
use std::time::Instant;

/// Grid coordinate of one tile. A tile covers the half-open world rectangle
/// `[col*W, (col+1)*W) x [row*W, (row+1)*W)` where `W` is
/// `GridConfig::tile_world_size`. The grid never changes with zoom: a given
/// `(col, row)` maps to the same world rectangle forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    pub col: i32,
    pub row: i32,
}

impl TileKey {
    pub fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }

    /// Packs the key into a single `u64` for compact logging and as a dense
    /// hash key:
    /// | row (32, zigzag) | col (32, zigzag) |
    /// 63               32 31              0
    pub fn encode(self) -> u64 {
        (zigzag_encode(self.row) as u64) << 32 | zigzag_encode(self.col) as u64
    }

    pub fn decode(packed: u64) -> Self {
        let col = zigzag_decode((packed & 0xFFFF_FFFF) as u32);
        let row = zigzag_decode((packed >> 32) as u32);
        Self { col, row }
    }

    /// Manhattan distance of this tile's *center* from `(center_col,
    /// center_row)` in tile-grid units, used for visible-tile ordering
    /// (spec.md §4.1 step 4). Accepts fractional centers since the viewport
    /// center rarely lands on an integer tile coordinate.
    pub fn manhattan_distance_from(&self, center_col: f64, center_row: f64) -> f64 {
        (self.col as f64 + 0.5 - center_col).abs() + (self.row as f64 + 0.5 - center_row).abs()
    }
}

fn zigzag_encode(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Configuration for the tile grid, fixed for the lifetime of a
/// `TiledStaticLayer`. Defaults match the literal values used by spec.md's
/// end-to-end scenarios.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridConfig {
    pub tile_world_size: f64,
    pub overscan_tiles: i32,
    pub dpr: f64,
    pub min_tile_physical: u32,
    pub max_tile_physical: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            tile_world_size: 512.0,
            overscan_tiles: 1,
            dpr: 2.0,
            min_tile_physical: 64,
            max_tile_physical: 2048,
        }
    }
}

/// A discrete, integer zoom band at root-2 spacing:
/// `band = floor(log2(zoom) * 2)`. A tile rendered at band `b` is scaled by
/// at most ~1.41x before it should be promoted to the next band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoomBand(pub i32);

impl ZoomBand {
    pub fn from_zoom(zoom: f64) -> Self {
        debug_assert!(zoom > 0.0, "zoom must be positive");
        ZoomBand((zoom.log2() * 2.0).floor() as i32)
    }

    /// The zoom level at which a tile rendered for this band is at its
    /// native (1:1) resolution.
    pub fn base_zoom(self) -> f64 {
        2f64.powf(self.0 as f64 / 2.0)
    }

    /// Physical pixel size of a tile rendered at this band, clamped to the
    /// configured min/max.
    pub fn tile_physical_size(self, config: &GridConfig) -> u32 {
        let ideal = config.tile_world_size * self.base_zoom() * config.dpr;
        (ideal.round() as u32).clamp(config.min_tile_physical, config.max_tile_physical)
    }
}

/// Tagged freshness state for a cache entry, replacing a scattered
/// `dirty: bool` + `renderedAtBand` pair with one field that cannot express
/// an invalid combination (spec.md §9 design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileFreshness {
    /// Pixels reflect current document state, rendered at `ZoomBand`.
    Clean(ZoomBand),
    /// Pixels may be stale (edited document) or rendered at the wrong band;
    /// still usable for compositing.
    Stale(ZoomBand),
}

impl TileFreshness {
    pub fn rendered_at_band(self) -> ZoomBand {
        match self {
            TileFreshness::Clean(band) | TileFreshness::Stale(band) => band,
        }
    }

    pub fn is_clean(self) -> bool {
        matches!(self, TileFreshness::Clean(_))
    }

    pub fn mark_stale(self) -> Self {
        TileFreshness::Stale(self.rendered_at_band())
    }
}

/// One occupied grid position's cached bitmap and bookkeeping.
#[derive(Debug)]
pub struct TileEntry {
    pub key: TileKey,
    pub pixels: RasterSurface,
    /// Redundant with `key` given a `GridConfig`; cached on the entry so
    /// hot paths (render, composite) don't need the grid in scope.
    pub world_bounds: WorldRect,
    pub freshness: TileFreshness,
    pub stroke_ids: Vec<StrokeId>,
    pub last_access: Instant,
}

impl TileEntry {
    pub fn memory_bytes(&self) -> u64 {
        self.pixels.byte_len() as u64
    }

    pub fn contains_stroke(&self, id: StrokeId) -> bool {
        self.stroke_ids.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_key_encode_decode_round_trips_negative_and_positive() {
        for (col, row) in [(0, 0), (5, -5), (-1000, 1000), (i32::MAX, i32::MIN)] {
            let key = TileKey::new(col, row);
            assert_eq!(TileKey::decode(key.encode()), key);
        }
    }

    #[test]
    fn zoom_band_base_zoom_is_monotonic() {
        let low = ZoomBand::from_zoom(0.5);
        let high = ZoomBand::from_zoom(4.0);
        assert!(low.base_zoom() < high.base_zoom());
    }

    #[test]
    fn zoom_band_bracket_contains_the_zoom_it_was_derived_from() {
        for raw_zoom in [0.1, 0.33, 1.0, 1.41, 2.0, 3.9, 5.0] {
            let band = ZoomBand::from_zoom(raw_zoom);
            let base = band.base_zoom();
            assert!(base <= raw_zoom + 1e-9, "zoom={raw_zoom} base={base}");
            assert!(
                raw_zoom < base * std::f64::consts::SQRT_2 + 1e-9,
                "zoom={raw_zoom} base={base}"
            );
        }
    }

    #[test]
    fn tile_physical_size_clamps_to_configured_bounds() {
        let config = GridConfig {
            min_tile_physical: 64,
            max_tile_physical: 256,
            ..GridConfig::default()
        };
        let tiny_band = ZoomBand::from_zoom(0.01);
        let huge_band = ZoomBand::from_zoom(100.0);
        assert_eq!(tiny_band.tile_physical_size(&config), 64);
        assert_eq!(huge_band.tile_physical_size(&config), 256);
    }

    #[test]
    fn tile_physical_size_at_native_zoom_matches_default_config() {
        let config = GridConfig::default();
        let band = ZoomBand::from_zoom(1.0);
        assert_eq!(band.0, 0);
        assert_eq!(band.tile_physical_size(&config), 1024);
    }

    #[test]
    fn mark_stale_preserves_band() {
        let clean = TileFreshness::Clean(ZoomBand(3));
        assert_eq!(clean.mark_stale(), TileFreshness::Stale(ZoomBand(3)));
    }
}
