// Key-color masking: mask normalization, exact color range, elliptical
// morphology, and key removal over raw pixel buffers.

use image::{GrayImage, RgbaImage};
use rayon::prelude::*;

use super::blend_channel;

/// Mask colors left untouched by normalization
pub const IGNORED_COLORS: [[u8; 4]; 3] = [
    [255, 255, 255, 255], // opaque white
    [255, 255, 255, 0],   // transparent white
    [0, 0, 0, 0],         // transparent black
];

/// 5x5 elliptical structuring element
const ELLIPSE_5X5: [[bool; 5]; 5] = [
    [false, false, true, false, false],
    [true, true, true, true, true],
    [true, true, true, true, true],
    [true, true, true, true, true],
    [false, false, true, false, false],
];

const KERNEL_RADIUS: i64 = 2;

/// Rewrite every pixel that is neither the key color nor an ignored color to
/// the key color.
pub fn normalize_mask(mask: &mut RgbaImage, key: [u8; 4]) {
    mask.par_chunks_exact_mut(4).for_each(|px| {
        let current = [px[0], px[1], px[2], px[3]];
        if current != key && !IGNORED_COLORS.contains(&current) {
            px.copy_from_slice(&key);
        }
    });
}

/// Blend `mask` over `source` using the mask's own alpha as the weight,
/// on all four channels. Both images must share dimensions.
pub fn blend_mask_over(mask: &RgbaImage, source: &RgbaImage) -> RgbaImage {
    let mut out = source.clone();
    out.par_chunks_exact_mut(4)
        .zip(mask.par_chunks_exact(4))
        .for_each(|(dst, over)| {
            let weight = over[3];
            for c in 0..4 {
                dst[c] = blend_channel(dst[c], over[c], weight);
            }
        });
    out
}

/// 255 where the pixel matches `key` exactly on all four channels, else 0
pub fn key_range_mask(img: &RgbaImage, key: [u8; 4]) -> GrayImage {
    let (width, height) = img.dimensions();
    let mut mask = GrayImage::new(width, height);
    let cells: &mut [u8] = &mut mask;
    cells
        .par_iter_mut()
        .zip(img.par_chunks_exact(4))
        .for_each(|(m, px)| {
            *m = if *px == key[..] { 255 } else { 0 };
        });
    mask
}

/// Grayscale erosion (min) or dilation (max) with the elliptical kernel.
/// Out-of-bounds neighbors are ignored.
fn morph(src: &GrayImage, dilate: bool) -> GrayImage {
    let (width, height) = src.dimensions();
    let mut out = GrayImage::new(width, height);
    if width == 0 || height == 0 {
        return out;
    }

    let (w, h) = (i64::from(width), i64::from(height));
    out.par_chunks_exact_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as i64;
            for (x, slot) in row.iter_mut().enumerate() {
                let x = x as i64;
                let mut acc: u8 = if dilate { 0 } else { 255 };
                for (ky, kernel_row) in ELLIPSE_5X5.iter().enumerate() {
                    let sy = y + ky as i64 - KERNEL_RADIUS;
                    if sy < 0 || sy >= h {
                        continue;
                    }
                    for (kx, &on) in kernel_row.iter().enumerate() {
                        let sx = x + kx as i64 - KERNEL_RADIUS;
                        if !on || sx < 0 || sx >= w {
                            continue;
                        }
                        let v = src.get_pixel(sx as u32, sy as u32)[0];
                        acc = if dilate { acc.max(v) } else { acc.min(v) };
                    }
                }
                *slot = acc;
            }
        });
    out
}

/// Dilate then erode: fills pinholes inside the keyed region
pub fn close(mask: &GrayImage) -> GrayImage {
    morph(&morph(mask, true), false)
}

/// Erode then dilate: drops isolated keyed speckles
pub fn open(mask: &GrayImage) -> GrayImage {
    morph(&morph(mask, false), true)
}

/// Zero every pixel (alpha included) where `keyed` is set
pub fn erase_keyed(img: &mut RgbaImage, keyed: &GrayImage) {
    let cells: &[u8] = keyed;
    img.par_chunks_exact_mut(4)
        .zip(cells.par_iter())
        .for_each(|(px, &m)| {
            if m != 0 {
                px.copy_from_slice(&[0, 0, 0, 0]);
            }
        });
}

/// Full key removal on an already-composited image
pub fn remove_key_color(composite: &RgbaImage, key: [u8; 4]) -> RgbaImage {
    let keyed = open(&close(&key_range_mask(composite, key)));
    let mut out = composite.clone();
    erase_keyed(&mut out, &keyed);
    out
}

/// Count of pixels that are neither `key` nor ignored; zero after normalization
pub fn stray_pixel_count(mask: &RgbaImage, key: [u8; 4]) -> usize {
    mask.pixels()
        .filter(|p| p.0 != key && !IGNORED_COLORS.contains(&p.0))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::DEFAULT_KEY_COLOR;
    use image::{Luma, Rgba};

    const KEY: [u8; 4] = DEFAULT_KEY_COLOR;

    fn is_set(mask: &GrayImage, x: u32, y: u32) -> bool {
        mask.get_pixel(x, y) == &Luma([255])
    }

    #[test]
    fn test_normalization_leaves_only_key_and_ignored() {
        let mut mask = RgbaImage::new(16, 16);
        for (x, y, px) in mask.enumerate_pixels_mut() {
            *px = match (x + y) % 6 {
                0 => Rgba([255, 255, 255, 255]),
                1 => Rgba([255, 255, 255, 0]),
                2 => Rgba([0, 0, 0, 0]),
                3 => Rgba(KEY),
                4 => Rgba([80, 176, 40, 200]), // anti-aliased edge
                _ => Rgba([(x * 13) as u8, (y * 7) as u8, 3, 128]),
            };
        }
        assert!(stray_pixel_count(&mask, KEY) > 0);

        normalize_mask(&mut mask, KEY);
        assert_eq!(stray_pixel_count(&mask, KEY), 0);
        assert_eq!(mask.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
        assert_eq!(mask.get_pixel(4, 0), &Rgba(KEY));
    }

    #[test]
    fn test_blend_extremes() {
        let source = RgbaImage::from_pixel(2, 1, Rgba([10, 20, 30, 255]));
        let mut mask = RgbaImage::new(2, 1);
        mask.put_pixel(0, 0, Rgba(KEY));
        mask.put_pixel(1, 0, Rgba([0, 0, 0, 0]));

        let out = blend_mask_over(&mask, &source);
        assert_eq!(out.get_pixel(0, 0), &Rgba(KEY));
        assert_eq!(out.get_pixel(1, 0), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn test_close_fills_pinhole_and_open_drops_speck() {
        let mut mask = GrayImage::from_pixel(9, 9, Luma([255]));
        mask.put_pixel(4, 4, Luma([0]));
        let closed = close(&mask);
        assert!(is_set(&closed, 4, 4));

        let mut speck = GrayImage::new(9, 9);
        speck.put_pixel(4, 4, Luma([255]));
        let opened = open(&speck);
        assert!(opened.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_morphology_preserves_half_plane() {
        let mut mask = GrayImage::new(12, 12);
        for y in 0..12 {
            for x in 0..6 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        assert_eq!(open(&close(&mask)), mask);
    }

    #[test]
    fn test_remove_key_color_erases_to_transparent() {
        let mut img = RgbaImage::from_pixel(10, 10, Rgba([1, 2, 3, 255]));
        for y in 0..10 {
            for x in 0..5 {
                img.put_pixel(x, y, Rgba(KEY));
            }
        }
        let out = remove_key_color(&img, KEY);
        assert_eq!(out.get_pixel(0, 0), &Rgba([0, 0, 0, 0]));
        assert_eq!(out.get_pixel(4, 9), &Rgba([0, 0, 0, 0]));
        assert_eq!(out.get_pixel(5, 0), &Rgba([1, 2, 3, 255]));
    }
}
