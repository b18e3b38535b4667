//! Orchestrator: the one object the host talks to. Owns the grid, the cache,
//! the scheduler, and the camera/gesture state; wires `tile_renderer` and
//! `tile_compositor` together behind four authoritative calls and two
//! invalidation calls. See spec.md §4.6.

use scene_protocol::{Camera, Document, PageBackgroundRenderer, PageLayout, RasterSurface, SpatialIndex, Stroke, StrokeId, StrokeRenderer};
use std::collections::HashSet;
use std::sync::Arc;
use tile_cache::{CacheConfig, TileCache};
use tile_compositor::composite;
use tile_grid::TileGrid;
use tile_renderer::RenderContext;
use tile_scheduler::{SchedulerConfig, TileJob, TileScheduler};
use tile_types::{GridConfig, TileKey, ZoomBand};

/// Construction-time configuration, fixed for the layer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiledStaticLayerConfig {
    pub grid: GridConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for TiledStaticLayerConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Cache stats the host may want to read for diagnostics (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_bytes: u64,
    pub tile_count: usize,
}

/// The most recent authoritative call's inputs, kept around so `gesture_update`
/// (which per spec.md §4.6 takes only `(surface, screenW, screenH)`) can still
/// build jobs for missing tiles without re-querying the host.
struct CachedContext {
    document: Document,
    page_layout: PageLayout,
    spatial_index: Arc<dyn SpatialIndex>,
    is_dark_mode: bool,
}

pub struct TiledStaticLayer {
    grid: TileGrid,
    cache: TileCache,
    scheduler: TileScheduler,
    stroke_renderer: Arc<dyn StrokeRenderer>,
    page_background_renderer: Arc<dyn PageBackgroundRenderer>,
    doc_version: u64,
    current_band: ZoomBand,
    gesture_active: bool,
    cached: Option<CachedContext>,
}

impl TiledStaticLayer {
    pub fn new(
        config: TiledStaticLayerConfig,
        stroke_renderer: Arc<dyn StrokeRenderer>,
        page_background_renderer: Arc<dyn PageBackgroundRenderer>,
    ) -> Self {
        let scheduler = TileScheduler::new(config.scheduler, stroke_renderer.clone(), page_background_renderer.clone());
        Self {
            grid: TileGrid::new(config.grid),
            cache: TileCache::new(config.cache),
            scheduler,
            stroke_renderer,
            page_background_renderer,
            doc_version: 0,
            current_band: ZoomBand(0),
            gesture_active: false,
            cached: None,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            memory_bytes: self.cache.memory_usage(),
            tile_count: self.cache.size(),
        }
    }

    pub fn gesture_active(&self) -> bool {
        self.gesture_active
    }

    /// Authoritative render: load, undo/redo, theme change, or any other
    /// point where the visible set must be pixel-correct once this returns.
    /// Spec.md §4.6 `renderVisible`.
    #[allow(clippy::too_many_arguments)]
    pub fn render_visible(
        &mut self,
        destination: &mut RasterSurface,
        camera: &dyn Camera,
        screen_w: f64,
        screen_h: f64,
        document: Document,
        page_layout: PageLayout,
        spatial_index: Arc<dyn SpatialIndex>,
        is_dark_mode: bool,
    ) {
        self.doc_version += 1;
        self.scheduler.cancel();
        self.current_band = ZoomBand::from_zoom(camera.zoom());
        let band = self.current_band;

        let visible = self.grid.visible_tiles(camera, screen_w, screen_h);
        let visible_set: HashSet<TileKey> = visible.iter().copied().collect();
        self.cache.protect(&visible);

        let ctx = RenderContext {
            document: &document,
            page_layout: &page_layout,
            is_dark_mode,
        };

        for key in &visible {
            if self.cache.get_stale(*key).is_some() {
                continue;
            }
            self.render_tile_inline(*key, band, &ctx, spatial_index.as_ref());
        }

        let mut to_schedule: Vec<TileKey> = visible.iter().copied().filter(|key| self.needs_rerender(*key, band)).collect();
        for entry in self.cache.dirty_tiles(&visible) {
            if !visible_set.contains(&entry.key) {
                to_schedule.push(entry.key);
            }
        }

        // Sync the document snapshot to workers *before* dispatching jobs
        // that depend on it — otherwise a worker could dequeue a job ahead
        // of the doc-sync message and render against the stale snapshot
        // (spec.md §5 version-counter discipline).
        self.scheduler.sync_document(self.doc_version, document.clone(), page_layout.clone());
        self.dispatch(to_schedule, &visible_set, band, spatial_index.as_ref(), is_dark_mode);

        self.cached = Some(CachedContext {
            document,
            page_layout,
            spatial_index,
            is_dark_mode,
        });

        self.composite_now(destination, camera, screen_w, screen_h);
    }

    /// A single ink stroke was just finalized. Every tile it overlaps is
    /// fully re-rendered synchronously — not an overlay, since later strokes
    /// must occlude correctly and the stroke renderer is the only authority
    /// on pixel output. Spec.md §4.6 `bakeStroke`.
    #[allow(clippy::too_many_arguments)]
    pub fn bake_stroke(
        &mut self,
        destination: &mut RasterSurface,
        camera: &dyn Camera,
        screen_w: f64,
        screen_h: f64,
        stroke: &Stroke,
        document: Document,
        page_layout: PageLayout,
        spatial_index: Arc<dyn SpatialIndex>,
        is_dark_mode: bool,
    ) {
        self.doc_version += 1;
        let band = self.current_band;
        let touched = self.grid.tiles_for_world_bbox(&stroke.bbox);
        let visible = self.grid.visible_tiles(camera, screen_w, screen_h);
        self.cache.protect(&visible);

        let ctx = RenderContext {
            document: &document,
            page_layout: &page_layout,
            is_dark_mode,
        };

        for key in &touched {
            self.render_tile_inline(*key, band, &ctx, spatial_index.as_ref());
        }

        self.cache.unprotect();
        self.scheduler.sync_document(self.doc_version, document.clone(), page_layout.clone());

        self.cached = Some(CachedContext {
            document,
            page_layout,
            spatial_index,
            is_dark_mode,
        });

        self.composite_now(destination, camera, screen_w, screen_h);
    }

    /// Cheap per-frame update during an in-progress pan/zoom gesture:
    /// composites whatever is cached (including stale tiles at other
    /// resolutions) and schedules only tiles that are missing outright —
    /// present-but-wrong-band tiles are left alone until the gesture ends.
    /// Spec.md §4.6 `gestureUpdate`.
    pub fn gesture_update(&mut self, destination: &mut RasterSurface, camera: &dyn Camera, screen_w: f64, screen_h: f64) {
        self.gesture_active = true;
        self.current_band = ZoomBand::from_zoom(camera.zoom());

        self.composite_now(destination, camera, screen_w, screen_h);

        let visible = self.grid.visible_tiles(camera, screen_w, screen_h);
        let visible_set: HashSet<TileKey> = visible.iter().copied().collect();
        self.cache.protect(&visible);

        let missing: Vec<TileKey> = visible.into_iter().filter(|key| self.cache.get_stale(*key).is_none()).collect();
        if missing.is_empty() {
            return;
        }

        let Some(cached) = &self.cached else {
            tracing::trace!("tiled_static_layer: gesture_update with no prior authoritative call, nothing to schedule");
            return;
        };

        let band = self.current_band;
        let tile_world_size = self.grid.config().tile_world_size;
        let tile_physical = band.tile_physical_size(self.grid.config());
        let scale = tile_physical as f64 / tile_world_size;
        let jobs: Vec<TileJob> = missing
            .into_iter()
            .map(|key| {
                let bounds = self.grid.tile_bounds(key);
                TileJob {
                    key,
                    world_bounds: bounds,
                    band,
                    tile_physical,
                    scale,
                    stroke_ids: cached.spatial_index.query_rect(bounds),
                    is_dark_mode: cached.is_dark_mode,
                }
            })
            .collect();
        self.scheduler.schedule(jobs, &visible_set);
    }

    /// Ends the current gesture. The host is expected to follow with
    /// `render_visible`.
    pub fn end_gesture(&mut self) {
        self.gesture_active = false;
        self.scheduler.cancel();
        self.cache.unprotect();
    }

    /// No immediate rerender — the next authoritative call handles it.
    pub fn invalidate_stroke(&mut self, id: StrokeId) -> Vec<TileKey> {
        self.cache.invalidate_stroke(id)
    }

    pub fn invalidate_all(&mut self) {
        self.cache.invalidate_all();
    }

    pub fn destroy(self) {
        self.scheduler.destroy();
    }

    /// Drains completed async renders and applies them to the cache. Must be
    /// called once per host frame tick. Composites afterward unless a
    /// gesture is in progress — compositing newly-arrived tiles under a
    /// stale mid-gesture camera snapshot would cause edge flicker (spec.md
    /// §4.6 invariant).
    pub fn poll_scheduler(&mut self, destination: &mut RasterSurface, camera: &dyn Camera, screen_w: f64, screen_h: f64) -> usize {
        let results = self.scheduler.poll_completed();
        let mut applied = 0;
        for result in results {
            let existing_dims = match self.cache.get_stale(result.key) {
                Some(entry) => (entry.pixels.width(), entry.pixels.height()),
                None => {
                    tracing::debug!(tile = ?result.key, "tiled_static_layer: discarding result for an entry evicted while in flight");
                    continue;
                }
            };
            // The band changed while this tile was in flight: its entry is
            // still sized for the old band. Re-allocate at the dispatched
            // band before uploading rather than dropping the result — spec.md
            // §4.5 "Result handling" step 2 treats this as the normal
            // band-promotion path, not the evicted/unknown-key case.
            if existing_dims != (result.pixels.width(), result.pixels.height()) {
                tracing::trace!(tile = ?result.key, "tiled_static_layer: band changed in flight, re-allocating entry to accept result");
                let bounds = self.grid.tile_bounds(result.key);
                let tile_physical = result.band.tile_physical_size(self.grid.config());
                let scale = tile_physical as f64 / self.grid.config().tile_world_size;
                if self.cache.allocate(result.key, bounds, result.band, tile_physical, scale).is_err() {
                    tracing::warn!(tile = ?result.key, "tiled_static_layer: surface acquisition failed while re-allocating for band change, discarding result");
                    continue;
                }
            }
            if self.cache.upload_bitmap(result.key, result.band, result.pixels, result.stroke_ids) {
                applied += 1;
            } else {
                tracing::debug!(tile = ?result.key, "tiled_static_layer: discarding result, dimensions disagree with the current entry");
            }
        }

        if applied > 0 && !self.gesture_active {
            self.composite_now(destination, camera, screen_w, screen_h);
        }
        applied
    }

    fn composite_now(&mut self, destination: &mut RasterSurface, camera: &dyn Camera, screen_w: f64, screen_h: f64) {
        composite(destination, camera, screen_w, screen_h, &self.grid, &mut self.cache);
    }

    fn needs_rerender(&mut self, key: TileKey, band: ZoomBand) -> bool {
        match self.cache.get_stale(key) {
            None => true,
            Some(entry) => !entry.freshness.is_clean() || entry.freshness.rendered_at_band() != band,
        }
    }

    fn render_tile_inline(&mut self, key: TileKey, band: ZoomBand, ctx: &RenderContext, spatial_index: &dyn SpatialIndex) {
        let bounds = self.grid.tile_bounds(key);
        let tile_physical = band.tile_physical_size(self.grid.config());
        let scale = tile_physical as f64 / self.grid.config().tile_world_size;
        let stroke_renderer = self.stroke_renderer.clone();
        let page_background_renderer = self.page_background_renderer.clone();
        let Ok(entry) = self.cache.allocate(key, bounds, band, tile_physical, scale) else {
            tracing::warn!(tile = ?key, "tiled_static_layer: surface acquisition failed, leaving tile dirty");
            return;
        };
        tile_renderer::render_tile(entry, ctx, spatial_index, stroke_renderer.as_ref(), page_background_renderer.as_ref());
        self.cache.mark_clean(key);
    }

    fn dispatch(
        &mut self,
        keys: Vec<TileKey>,
        visible_set: &HashSet<TileKey>,
        band: ZoomBand,
        spatial_index: &dyn SpatialIndex,
        is_dark_mode: bool,
    ) {
        let tile_world_size = self.grid.config().tile_world_size;
        let tile_physical = band.tile_physical_size(self.grid.config());
        let scale = tile_physical as f64 / tile_world_size;
        let jobs: Vec<TileJob> = keys
            .into_iter()
            .map(|key| {
                let bounds = self.grid.tile_bounds(key);
                TileJob {
                    key,
                    world_bounds: bounds,
                    band,
                    tile_physical,
                    scale,
                    stroke_ids: spatial_index.query_rect(bounds),
                    is_dark_mode,
                }
            })
            .collect();
        self.scheduler.schedule(jobs, visible_set);
    }
}
