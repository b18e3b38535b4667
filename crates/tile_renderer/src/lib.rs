//! Produces the pixel content of one tile: desk color, page backgrounds,
//! strokes clipped per page. See spec.md §4.3.
//!
//! By the time `render_tile` runs, `entry.pixels` already exists (allocation
//! and its surface-acquisition failure mode live in `tile_cache`); this crate
//! is infallible — it only writes pixels and `stroke_ids`.

use scene_protocol::{
    Document, LodLevel, PageBackgroundRenderer, PageLayout, SpatialIndex, Stroke, StrokeId, StrokeRenderer,
};
use std::collections::HashSet;
use tile_types::TileEntry;

/// Bundles exactly what `render_tile` needs from the host, replacing the
/// "ambient context object" the source passes around (spec.md §9) with one
/// explicit struct.
pub struct RenderContext<'a> {
    pub document: &'a Document,
    pub page_layout: &'a PageLayout,
    pub is_dark_mode: bool,
}

/// Desk (page-gutter background) fill color for the given theme. Not part of
/// any host trait — spec.md §4.3 treats it as a core-owned constant, not a
/// delegated concern.
fn desk_color(is_dark_mode: bool) -> [u8; 4] {
    if is_dark_mode {
        [30, 30, 32, 255]
    } else {
        [225, 225, 230, 255]
    }
}

/// Writes a complete image of `entry.world_bounds` into `entry.pixels` and
/// replaces `entry.stroke_ids` with exactly the strokes drawn. Queries
/// `spatial_index` itself — the path the orchestrator's synchronous render
/// calls take (spec.md §4.6), where the index is in scope on the same
/// thread.
///
/// Determinism: identical `entry.world_bounds`/`entry.freshness` band, `ctx`,
/// spatial index result and renderer impls must produce pixel-identical
/// output, on any thread (spec.md §4.3 "Determinism").
pub fn render_tile(
    entry: &mut TileEntry,
    ctx: &RenderContext,
    spatial_index: &dyn SpatialIndex,
    stroke_renderer: &dyn StrokeRenderer,
    page_background_renderer: &dyn PageBackgroundRenderer,
) {
    let stroke_ids = spatial_index.query_rect(entry.world_bounds);
    render_tile_with_stroke_ids(entry, ctx, &stroke_ids, stroke_renderer, page_background_renderer, &mut || false);
}

/// Same algorithm as `render_tile`, but takes an already-queried stroke id
/// list instead of a `SpatialIndex` — the path scheduler workers take, since
/// they do not share the index (spec.md §4.5: "Pre-queries the spatial index
/// on the orchestrator thread and sends the stroke-id list with each job").
///
/// `should_abort` is polled between strokes; the source's workers "check
/// between strokes" for cancellation (spec.md §5). Returns `false` (and
/// leaves `entry` in a partially-rendered state the caller must discard) if
/// aborted, `true` if the render ran to completion.
pub fn render_tile_with_stroke_ids(
    entry: &mut TileEntry,
    ctx: &RenderContext,
    stroke_ids: &[StrokeId],
    stroke_renderer: &dyn StrokeRenderer,
    page_background_renderer: &dyn PageBackgroundRenderer,
    should_abort: &mut dyn FnMut() -> bool,
) -> bool {
    let world_bounds = entry.world_bounds;
    let band = entry.freshness.rendered_at_band();
    let lod = LodLevel(band.base_zoom());

    entry.pixels.reset_clip();
    entry.pixels.fill(desk_color(ctx.is_dark_mode));

    let pages: Vec<_> = ctx.page_layout.pages_intersecting(&world_bounds).copied().collect();

    for page_rect in &pages {
        let Some(page) = ctx.document.pages.get(page_rect.page_index.0 as usize) else {
            tracing::warn!(page_index = page_rect.page_index.0, "tile_renderer: page_rect has no matching page");
            continue;
        };
        entry.pixels.set_clip_world_rect(page_rect.world_rect());
        page_background_renderer.render(&mut entry.pixels, page, page_rect.world_rect(), ctx.is_dark_mode);
    }

    let queried: HashSet<_> = stroke_ids.iter().copied().collect();
    entry.stroke_ids.clear();

    for page_rect in &pages {
        entry.pixels.set_clip_world_rect(page_rect.world_rect());
        for stroke in &ctx.document.strokes {
            if stroke.page_index != page_rect.page_index || !queried.contains(&stroke.id) {
                continue;
            }
            if should_abort() {
                entry.pixels.reset_clip();
                return false;
            }
            stroke_renderer.render(&mut entry.pixels, stroke, lod, ctx.is_dark_mode);
            entry.stroke_ids.push(stroke.id);
        }
    }

    entry.pixels.reset_clip();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use scene_protocol::{
        Margins, Page, PageBackground, PageIndex, PageRect, PaperType, RasterSurface, StrokeId, StrokeStyleId,
        WorldRect,
    };
    use tile_types::{GridConfig, TileFreshness, TileKey, ZoomBand};

    struct RecordingStrokeRenderer;
    impl StrokeRenderer for RecordingStrokeRenderer {
        fn render(&self, target: &mut RasterSurface, stroke: &Stroke, _lod: LodLevel, _is_dark: bool) {
            let (x, y) = target.world_to_surface(stroke.bbox.min_x, stroke.bbox.min_y);
            target.fill_rect(x as i64, y as i64, x as i64 + 2, y as i64 + 2, [0, 0, 0, 255]);
        }
    }

    struct FlatPaperRenderer;
    impl PageBackgroundRenderer for FlatPaperRenderer {
        fn render(&self, target: &mut RasterSurface, _page: &Page, page_rect: WorldRect, _is_dark: bool) {
            let (x0, y0) = target.world_to_surface(page_rect.min_x, page_rect.min_y);
            let (x1, y1) = target.world_to_surface(page_rect.max_x, page_rect.max_y);
            target.fill_rect(x0 as i64, y0 as i64, x1 as i64, y1 as i64, [255, 255, 255, 255]);
        }
    }

    struct AllStrokesIndex(Vec<StrokeId>);
    impl SpatialIndex for AllStrokesIndex {
        fn query_rect(&self, _rect: WorldRect) -> Vec<StrokeId> {
            self.0.clone()
        }
    }

    fn make_entry(key: TileKey, config: &GridConfig) -> TileEntry {
        let bounds = WorldRect::new(
            key.col as f64 * config.tile_world_size,
            key.row as f64 * config.tile_world_size,
            (key.col + 1) as f64 * config.tile_world_size,
            (key.row + 1) as f64 * config.tile_world_size,
        );
        let band = ZoomBand(0);
        let physical = band.tile_physical_size(config);
        let scale = physical as f64 / config.tile_world_size;
        TileEntry {
            key,
            pixels: RasterSurface::new(physical, physical, scale, bounds.min_x, bounds.min_y),
            world_bounds: bounds,
            freshness: TileFreshness::Stale(band),
            stroke_ids: Vec::new(),
            last_access: std::time::Instant::now(),
        }
    }

    #[test]
    fn render_tile_fills_desk_color_when_no_pages_or_strokes() {
        let config = GridConfig::default();
        let mut entry = make_entry(TileKey::new(0, 0), &config);
        let doc = Document::default();
        let layout = scene_protocol::PageLayout::default();
        let ctx = RenderContext {
            document: &doc,
            page_layout: &layout,
            is_dark_mode: false,
        };
        let index = AllStrokesIndex(Vec::new());
        render_tile(&mut entry, &ctx, &index, &RecordingStrokeRenderer, &FlatPaperRenderer);
        assert_eq!(&entry.pixels.pixels()[0..4], &desk_color(false));
        assert!(entry.stroke_ids.is_empty());
    }

    #[test]
    fn render_tile_records_exactly_the_strokes_it_drew() {
        let config = GridConfig::default();
        let mut entry = make_entry(TileKey::new(0, 0), &config);
        let page_rect = PageRect {
            page_index: PageIndex(0),
            x: 0.0,
            y: 0.0,
            width: 400.0,
            height: 400.0,
        };
        let layout = scene_protocol::PageLayout { pages: vec![page_rect] };
        let doc = Document {
            strokes: vec![Stroke {
                id: StrokeId(1),
                bbox: WorldRect::new(10.0, 10.0, 20.0, 20.0),
                page_index: PageIndex(0),
                style: StrokeStyleId(0),
            }],
            pages: vec![Page {
                background: PageBackground {
                    paper_type: PaperType::Blank,
                    margins: Margins::default(),
                },
            }],
        };
        let ctx = RenderContext {
            document: &doc,
            page_layout: &layout,
            is_dark_mode: false,
        };
        let index = AllStrokesIndex(vec![StrokeId(1)]);
        render_tile(&mut entry, &ctx, &index, &RecordingStrokeRenderer, &FlatPaperRenderer);
        assert_eq!(entry.stroke_ids, vec![StrokeId(1)]);
    }

    #[test]
    fn render_tile_skips_strokes_on_a_different_page() {
        let config = GridConfig::default();
        let mut entry = make_entry(TileKey::new(0, 0), &config);
        let page_rect = PageRect {
            page_index: PageIndex(0),
            x: 0.0,
            y: 0.0,
            width: 400.0,
            height: 400.0,
        };
        let layout = scene_protocol::PageLayout { pages: vec![page_rect] };
        let doc = Document {
            strokes: vec![Stroke {
                id: StrokeId(2),
                bbox: WorldRect::new(10.0, 10.0, 20.0, 20.0),
                page_index: PageIndex(1),
                style: StrokeStyleId(0),
            }],
            pages: vec![Page {
                background: PageBackground {
                    paper_type: PaperType::Blank,
                    margins: Margins::default(),
                },
            }],
        };
        let ctx = RenderContext {
            document: &doc,
            page_layout: &layout,
            is_dark_mode: false,
        };
        let index = AllStrokesIndex(vec![StrokeId(2)]);
        render_tile(&mut entry, &ctx, &index, &RecordingStrokeRenderer, &FlatPaperRenderer);
        assert!(entry.stroke_ids.is_empty());
    }

    #[test]
    fn render_tile_is_deterministic_given_identical_inputs() {
        let config = GridConfig::default();
        let mut entry_a = make_entry(TileKey::new(3, -2), &config);
        let mut entry_b = make_entry(TileKey::new(3, -2), &config);
        let doc = Document {
            strokes: vec![Stroke {
                id: StrokeId(9),
                bbox: WorldRect::new(1536.0 + 5.0, -1024.0 + 5.0, 1536.0 + 15.0, -1024.0 + 15.0),
                page_index: PageIndex(0),
                style: StrokeStyleId(0),
            }],
            pages: vec![Page {
                background: PageBackground {
                    paper_type: PaperType::Blank,
                    margins: Margins::default(),
                },
            }],
        };
        let layout = scene_protocol::PageLayout {
            pages: vec![PageRect {
                page_index: PageIndex(0),
                x: 1536.0,
                y: -1024.0,
                width: 512.0,
                height: 512.0,
            }],
        };
        let ctx = RenderContext {
            document: &doc,
            page_layout: &layout,
            is_dark_mode: true,
        };
        let index = AllStrokesIndex(vec![StrokeId(9)]);
        render_tile(&mut entry_a, &ctx, &index, &RecordingStrokeRenderer, &FlatPaperRenderer);
        render_tile(&mut entry_b, &ctx, &index, &RecordingStrokeRenderer, &FlatPaperRenderer);
        assert_eq!(entry_a.pixels.pixels(), entry_b.pixels.pixels());
        assert_eq!(entry_a.stroke_ids, entry_b.stroke_ids);
    }

    #[test]
    fn render_tile_with_stroke_ids_reports_abort_and_leaves_stroke_ids_incomplete() {
        let config = GridConfig::default();
        let mut entry = make_entry(TileKey::new(0, 0), &config);
        let page_rect = PageRect {
            page_index: PageIndex(0),
            x: 0.0,
            y: 0.0,
            width: 400.0,
            height: 400.0,
        };
        let layout = scene_protocol::PageLayout { pages: vec![page_rect] };
        let doc = Document {
            strokes: vec![
                Stroke {
                    id: StrokeId(1),
                    bbox: WorldRect::new(10.0, 10.0, 20.0, 20.0),
                    page_index: PageIndex(0),
                    style: StrokeStyleId(0),
                },
                Stroke {
                    id: StrokeId(2),
                    bbox: WorldRect::new(30.0, 30.0, 40.0, 40.0),
                    page_index: PageIndex(0),
                    style: StrokeStyleId(0),
                },
            ],
            pages: vec![Page {
                background: PageBackground {
                    paper_type: PaperType::Blank,
                    margins: Margins::default(),
                },
            }],
        };
        let ctx = RenderContext {
            document: &doc,
            page_layout: &layout,
            is_dark_mode: false,
        };
        let completed = render_tile_with_stroke_ids(
            &mut entry,
            &ctx,
            &[StrokeId(1), StrokeId(2)],
            &RecordingStrokeRenderer,
            &FlatPaperRenderer,
            &mut || true,
        );
        assert!(!completed);
        assert!(entry.stroke_ids.is_empty());
    }
}
