// Pattern placement: percentage geometry to pixels, bounds checking, and
// alpha pastes onto a square transparent canvas.

use image::imageops::FilterType;
use image::{imageops, RgbaImage};

use super::blend_channel;
use crate::core::errors::{CompositorError, CompositorResult};
use crate::core::types::{PixelRect, PlacementGeometry};

/// Resolve percentages (of the canvas height) to whole pixels.
///
/// Rounds half to even, matching the preview tooling the stored geometries
/// were authored against. Percentages must be finite and within 0..=100.
pub fn resolve_rect(geometry: &PlacementGeometry, canvas: u32) -> CompositorResult<PixelRect> {
    let fields = [geometry.left, geometry.top, geometry.width, geometry.height];
    if fields.iter().any(|pct| !pct.is_finite() || !(0.0..=100.0).contains(pct)) {
        // Raw percentages, truncated for the report
        return Err(CompositorError::Geometry {
            x: geometry.left as i64,
            y: geometry.top as i64,
            width: geometry.width as i64,
            height: geometry.height as i64,
            canvas,
        });
    }

    let to_px = |pct: f64| (pct / 100.0 * f64::from(canvas)).round_ties_even() as i64;
    Ok(PixelRect {
        x: to_px(geometry.left),
        y: to_px(geometry.top),
        width: to_px(geometry.width),
        height: to_px(geometry.height),
    })
}

/// Reject rectangles that leave the canvas or have no area.
pub fn check_bounds(rect: &PixelRect, canvas: u32) -> CompositorResult<()> {
    let limit = i64::from(canvas);
    let fits = |start: i64, extent: i64| {
        start >= 0 && extent > 0 && start.checked_add(extent).is_some_and(|end| end <= limit)
    };

    if !fits(rect.x, rect.width) || !fits(rect.y, rect.height) {
        return Err(CompositorError::Geometry {
            x: rect.x,
            y: rect.y,
            width: rect.width,
            height: rect.height,
            canvas,
        });
    }
    Ok(())
}

/// Paste `overlay` at (x, y) weighted by its own alpha, clipped to `canvas`.
pub fn paste_with_alpha(canvas: &mut RgbaImage, overlay: &RgbaImage, x: i64, y: i64) {
    let (cw, ch) = (i64::from(canvas.width()), i64::from(canvas.height()));

    for (ox, oy, src) in overlay.enumerate_pixels() {
        let tx = x + i64::from(ox);
        let ty = y + i64::from(oy);
        if tx < 0 || ty < 0 || tx >= cw || ty >= ch {
            continue;
        }
        let weight = src[3];
        if weight == 0 {
            continue;
        }
        let dst = canvas.get_pixel_mut(tx as u32, ty as u32);
        for c in 0..4 {
            dst[c] = blend_channel(dst[c], src[c], weight);
        }
    }
}

/// Build the garment preview: pattern first, garment on top.
///
/// The pattern is resized to (height, width) of the resolved rectangle, in
/// that order, so both the stored rectangle and the swapped footprint have
/// to lie on the canvas.
pub fn compose_preview(
    pattern: &RgbaImage,
    garment: &RgbaImage,
    geometry: &PlacementGeometry,
) -> CompositorResult<RgbaImage> {
    let canvas_size = garment.height();
    let rect = resolve_rect(geometry, canvas_size)?;
    check_bounds(&rect, canvas_size)?;
    // The pasted footprint is the swapped rectangle; it must fit as well.
    check_bounds(
        &PixelRect {
            width: rect.height,
            height: rect.width,
            ..rect
        },
        canvas_size,
    )?;

    let resized = imageops::resize(
        pattern,
        rect.height as u32,
        rect.width as u32,
        FilterType::CatmullRom,
    );

    let mut canvas = RgbaImage::new(canvas_size, canvas_size);
    paste_with_alpha(&mut canvas, &resized, rect.x, rect.y);
    paste_with_alpha(&mut canvas, garment, 0, 0);
    Ok(canvas)
}
