//! Draws the intersection of the tile grid with the viewport onto a
//! destination surface at the current camera transform. See spec.md §4.4.

use scene_protocol::{Camera, RasterSurface};
use tile_cache::TileCache;
use tile_grid::TileGrid;

/// Composites one frame's worth of visible, currently-cached tiles.
///
/// Tolerates stale-but-present tiles (`TileCache::get_stale`): a slightly
/// blurry result from another band beats a blank hole. A key with no entry
/// at all is simply skipped — desk color never reached that tile yet, which
/// is the only case spec.md permits a blank region.
///
/// Works in physical pixel space with destination rect corners rounded to
/// integers independently (not derived as `x0 + width`), so adjoining tiles
/// agree on the shared edge and no seam opens up between them.
///
/// Returns the number of tiles actually drawn (handy for tests and metrics).
pub fn composite(
    destination: &mut RasterSurface,
    camera: &dyn Camera,
    screen_w: f64,
    screen_h: f64,
    grid: &TileGrid,
    cache: &mut TileCache,
) -> usize {
    destination.reset_clip();
    destination.fill([0, 0, 0, 0]);

    let tile_world_size = grid.config().tile_world_size;
    let zoom = camera.zoom();
    let mut drawn = 0;

    for key in grid.visible_tiles(camera, screen_w, screen_h) {
        let Some(entry) = cache.get_stale(key) else {
            continue;
        };

        let world_x0 = key.col as f64 * tile_world_size;
        let world_y0 = key.row as f64 * tile_world_size;
        let world_x1 = world_x0 + tile_world_size;
        let world_y1 = world_y0 + tile_world_size;

        let dst_x0 = ((world_x0 - camera.x()) * zoom).round() as i64;
        let dst_y0 = ((world_y0 - camera.y()) * zoom).round() as i64;
        let dst_x1 = ((world_x1 - camera.x()) * zoom).round() as i64;
        let dst_y1 = ((world_y1 - camera.y()) * zoom).round() as i64;

        blit_nearest_neighbor(destination, entry.pixels.pixels(), entry.pixels.width(), entry.pixels.height(), dst_x0, dst_y0, dst_x1, dst_y1);
        drawn += 1;
    }

    drawn
}

/// Nearest-neighbor scaled blit of a source RGBA8 buffer into the
/// destination's `[dst_x0, dst_x1) x [dst_y0, dst_y1)` rect, clipped to the
/// destination's bounds. No smoothing, per spec.md §4.4 step 3.
#[allow(clippy::too_many_arguments)]
fn blit_nearest_neighbor(
    destination: &mut RasterSurface,
    src_pixels: &[u8],
    src_w: u32,
    src_h: u32,
    dst_x0: i64,
    dst_y0: i64,
    dst_x1: i64,
    dst_y1: i64,
) {
    if dst_x1 <= dst_x0 || dst_y1 <= dst_y0 || src_w == 0 || src_h == 0 {
        return;
    }
    let dest_w = destination.width() as i64;
    let dest_h = destination.height() as i64;
    let clamped_x0 = dst_x0.clamp(0, dest_w);
    let clamped_x1 = dst_x1.clamp(0, dest_w);
    let clamped_y0 = dst_y0.clamp(0, dest_h);
    let clamped_y1 = dst_y1.clamp(0, dest_h);
    if clamped_x0 >= clamped_x1 || clamped_y0 >= clamped_y1 {
        return;
    }

    let dst_span_x = (dst_x1 - dst_x0).max(1) as f64;
    let dst_span_y = (dst_y1 - dst_y0).max(1) as f64;

    for dy in clamped_y0..clamped_y1 {
        let v = (dy - dst_y0) as f64 / dst_span_y;
        let sy = ((v * src_h as f64) as i64).clamp(0, src_h as i64 - 1) as u32;
        for dx in clamped_x0..clamped_x1 {
            let u = (dx - dst_x0) as f64 / dst_span_x;
            let sx = ((u * src_w as f64) as i64).clamp(0, src_w as i64 - 1) as u32;
            let src_offset = ((sy as usize) * (src_w as usize) + sx as usize) * 4;
            let pixel: [u8; 4] = src_pixels[src_offset..src_offset + 4].try_into().expect("rgba8 pixel");
            destination.fill_rect(dx, dy, dx + 1, dy + 1, pixel);
        }
    }
}
