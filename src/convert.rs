//! CPU-side pixel conversion.
//!
//! Used whenever [`negotiate`](crate::format::negotiate) plans a
//! [`Conversion::Cpu`] upload, for glyph coverage, and for downscaling
//! oversized pictures. All functions expect a buffer that passed
//! [`PixelBuffer::validate`].

use std::borrow::Cow;

use image::imageops::{self, FilterType};

use crate::format::{Conversion, PixelBuffer, PixelLayout, UploadPlan};

/// Bytes to hand to the GPU for `plan`, rows tightly packed.
#[must_use]
pub fn prepare<'a>(image: &PixelBuffer<'a>, plan: &UploadPlan) -> Cow<'a, [u8]> {
    match plan.conversion {
        Conversion::None | Conversion::Gpu => tight_rows(image),
        Conversion::Cpu => Cow::Owned(convert(image, plan.layout)),
    }
}

/// Pixel rows with any pitch padding removed.
#[must_use]
pub fn tight_rows<'a>(image: &PixelBuffer<'a>) -> Cow<'a, [u8]> {
    let len = image.row_bytes() * image.height as usize;
    if image.is_tight() {
        return Cow::Borrowed(&image.data[..len]);
    }
    let mut out = Vec::with_capacity(len);
    for y in 0..image.height {
        out.extend_from_slice(image.row(y));
    }
    Cow::Owned(out)
}

/// Re-encode every pixel of `image` in `target`.
///
/// Targets that cannot be sampled directly are produced as RGBA8.
#[must_use]
pub fn convert(image: &PixelBuffer<'_>, target: PixelLayout) -> Vec<u8> {
    let target = if target.is_sampleable() {
        target
    } else {
        PixelLayout::Rgba8
    };
    let bpp = image.layout.bytes_per_pixel() as usize;
    let mut out =
        Vec::with_capacity(image.width as usize * image.height as usize * target.bytes_per_pixel() as usize);
    for y in 0..image.height {
        for px in image.row(y).chunks_exact(bpp) {
            encode(decode(image.layout, px, image.palette), target, &mut out);
        }
    }
    out
}

/// Expand glyph coverage into white texels whose alpha is the coverage.
///
/// Non-gray buffers are converted to RGBA8 unchanged.
#[must_use]
pub fn coverage_to_rgba(image: &PixelBuffer<'_>) -> Vec<u8> {
    if image.layout != PixelLayout::Gray8 {
        return convert(image, PixelLayout::Rgba8);
    }
    let mut out = Vec::with_capacity(image.width as usize * image.height as usize * 4);
    for y in 0..image.height {
        for &a in image.row(y) {
            out.extend_from_slice(&[0xFF, 0xFF, 0xFF, a]);
        }
    }
    out
}

/// Size that fits `width`×`height` into a `limit`-sided square, preserving
/// aspect ratio. `None` when no scaling is needed.
#[must_use]
pub fn fit_size(width: u32, height: u32, limit: u32) -> Option<(u32, u32)> {
    if width <= limit && height <= limit {
        return None;
    }
    let scale = f64::from(limit) / f64::from(width.max(height));
    // The product is at most `limit`, well within u32.
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = |v: u32| ((f64::from(v) * scale).round() as u32).clamp(1, limit);
    Some((scaled(width), scaled(height)))
}

/// Downscale tightly packed RGBA8 pixels so neither side exceeds `limit`.
///
/// Returns `None` when the input already fits or the byte count does not
/// match the dimensions.
#[must_use]
pub fn downscale_rgba(pixels: Vec<u8>, width: u32, height: u32, limit: u32) -> Option<(Vec<u8>, u32, u32)> {
    let (w, h) = fit_size(width, height, limit)?;
    let source = image::RgbaImage::from_raw(width, height, pixels)?;
    let scaled = imageops::resize(&source, w, h, FilterType::Triangle);
    Some((scaled.into_raw(), w, h))
}

/// A view of the top-left `max`×`max` region of `image`.
#[must_use]
pub fn crop<'a>(image: &PixelBuffer<'a>, max: u32) -> PixelBuffer<'a> {
    PixelBuffer {
        width: image.width.min(max),
        height: image.height.min(max),
        ..*image
    }
}

#[expect(clippy::cast_possible_truncation)]
fn expand5(v: u16) -> u8 {
    let v = (v & 0x1F) as u8;
    (v << 3) | (v >> 2)
}

#[expect(clippy::cast_possible_truncation)]
fn expand6(v: u16) -> u8 {
    let v = (v & 0x3F) as u8;
    (v << 2) | (v >> 4)
}

#[expect(clippy::cast_possible_truncation)]
fn expand4(v: u16) -> u8 {
    (v & 0xF) as u8 * 17
}

#[expect(clippy::cast_possible_truncation)]
fn decode(layout: PixelLayout, px: &[u8], palette: Option<&[[u8; 4]]>) -> [u8; 4] {
    let half = || u16::from_le_bytes([px[0], px[1]]);
    match layout {
        PixelLayout::Rgba8 => [px[0], px[1], px[2], px[3]],
        PixelLayout::Bgra8 => [px[2], px[1], px[0], px[3]],
        PixelLayout::Rgb8 => [px[0], px[1], px[2], 0xFF],
        PixelLayout::Bgr8 => [px[2], px[1], px[0], 0xFF],
        PixelLayout::Rgba5551 => {
            let v = half();
            [expand5(v >> 11), expand5(v >> 6), expand5(v >> 1), (v & 1) as u8 * 0xFF]
        }
        PixelLayout::Bgra5551 => {
            let v = half();
            [expand5(v >> 1), expand5(v >> 6), expand5(v >> 11), (v & 1) as u8 * 0xFF]
        }
        PixelLayout::Rgb565 => {
            let v = half();
            [expand5(v >> 11), expand6(v >> 5), expand5(v), 0xFF]
        }
        PixelLayout::Bgr565 => {
            let v = half();
            [expand5(v), expand6(v >> 5), expand5(v >> 11), 0xFF]
        }
        PixelLayout::Rgba4444 => {
            let v = half();
            [expand4(v >> 12), expand4(v >> 8), expand4(v >> 4), expand4(v)]
        }
        PixelLayout::Rgb10a2 => {
            let v = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
            [
                ((v & 0x3FF) >> 2) as u8,
                (((v >> 10) & 0x3FF) >> 2) as u8,
                (((v >> 20) & 0x3FF) >> 2) as u8,
                (v >> 30) as u8 * 85,
            ]
        }
        PixelLayout::Gray8 => [px[0], px[0], px[0], 0xFF],
        PixelLayout::Indexed8 => palette
            .and_then(|p| p.get(usize::from(px[0])))
            .copied()
            .unwrap_or([0; 4]),
    }
}

fn encode([r, g, b, a]: [u8; 4], layout: PixelLayout, out: &mut Vec<u8>) {
    let (r16, g16, b16, a16) = (u16::from(r), u16::from(g), u16::from(b), u16::from(a));
    let word = match layout {
        PixelLayout::Rgba5551 => ((r16 >> 3) << 11) | ((g16 >> 3) << 6) | ((b16 >> 3) << 1) | (a16 >> 7),
        PixelLayout::Bgra5551 => ((b16 >> 3) << 11) | ((g16 >> 3) << 6) | ((r16 >> 3) << 1) | (a16 >> 7),
        PixelLayout::Rgb565 => ((r16 >> 3) << 11) | ((g16 >> 2) << 5) | (b16 >> 3),
        PixelLayout::Bgr565 => ((b16 >> 3) << 11) | ((g16 >> 2) << 5) | (r16 >> 3),
        PixelLayout::Rgba4444 => ((r16 >> 4) << 12) | ((g16 >> 4) << 8) | ((b16 >> 4) << 4) | (a16 >> 4),
        PixelLayout::Bgra8 => return out.extend_from_slice(&[b, g, r, a]),
        PixelLayout::Rgb10a2 => {
            let expand10 = |c: u8| (u32::from(c) << 2) | (u32::from(c) >> 6);
            let v = expand10(r) | (expand10(g) << 10) | (expand10(b) << 20) | ((u32::from(a) >> 6) << 30);
            return out.extend_from_slice(&v.to_le_bytes());
        }
        _ => return out.extend_from_slice(&[r, g, b, a]),
    };
    out.extend_from_slice(&word.to_le_bytes());
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::format::{negotiate, FormatCaps};

    fn assert_within(actual: &[u8], expected: &[u8], step: u8) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!(a.abs_diff(*e) <= step, "expected {expected:?}, got {actual:?}");
        }
    }

    #[test]
    fn bgr_with_pitch_to_rgba() {
        // Two 2-pixel rows with two bytes of padding each.
        let data = [
            1, 2, 3, 4, 5, 6, 0xAA, 0xAA, //
            7, 8, 9, 10, 11, 12, 0xAA, 0xAA,
        ];
        let image = PixelBuffer::new(&data, 2, 2, PixelLayout::Bgr8).with_pitch(8);
        assert_eq!(
            convert(&image, PixelLayout::Rgba8),
            vec![3, 2, 1, 255, 6, 5, 4, 255, 9, 8, 7, 255, 12, 11, 10, 255]
        );
    }

    #[test]
    fn tight_rows_borrows_when_possible() {
        let data = [0u8; 16];
        let image = PixelBuffer::new(&data, 2, 2, PixelLayout::Rgba8);
        assert!(matches!(tight_rows(&image), Cow::Borrowed(_)));

        let padded = PixelBuffer::new(&data, 1, 2, PixelLayout::Rgba8).with_pitch(8);
        let rows = tight_rows(&padded);
        assert!(matches!(rows, Cow::Owned(_)));
        assert_eq!(rows.len(), 8);
    }

    #[test]
    fn squashed_round_trip_within_one_step() {
        let source = [200u8, 100, 37, 255, 12, 250, 129, 0];
        let image = PixelBuffer::new(&source, 2, 1, PixelLayout::Rgba8);
        for (target, step) in [
            (PixelLayout::Rgba5551, 8),
            (PixelLayout::Bgra5551, 8),
            (PixelLayout::Rgba4444, 17),
        ] {
            let packed = convert(&image, target);
            assert_eq!(packed.len(), 4);
            let back = convert(&PixelBuffer::new(&packed, 2, 1, target), PixelLayout::Rgba8);
            assert_within(&back, &source, step);
        }

        let opaque = [200u8, 100, 37, 255];
        let image = PixelBuffer::new(&opaque, 1, 1, PixelLayout::Rgba8);
        for target in [PixelLayout::Rgb565, PixelLayout::Bgr565] {
            let packed = convert(&image, target);
            let back = convert(&PixelBuffer::new(&packed, 1, 1, target), PixelLayout::Rgba8);
            assert_within(&back, &opaque, 8);
        }
    }

    #[test]
    fn known_565_encoding() {
        let red = [0xFFu8, 0, 0, 0xFF];
        let image = PixelBuffer::new(&red, 1, 1, PixelLayout::Rgba8);
        assert_eq!(convert(&image, PixelLayout::Rgb565), 0xF800u16.to_le_bytes());
        assert_eq!(convert(&image, PixelLayout::Bgr565), 0x001Fu16.to_le_bytes());
    }

    #[test]
    fn rgb10a2_keeps_extremes() {
        let white = 0xFFFF_FFFFu32.to_le_bytes();
        let image = PixelBuffer::new(&white, 1, 1, PixelLayout::Rgb10a2);
        assert_eq!(convert(&image, PixelLayout::Rgba8), vec![255, 255, 255, 255]);
        let red = 0x3FFu32 | (3 << 30);
        let red = red.to_le_bytes();
        let image = PixelBuffer::new(&red, 1, 1, PixelLayout::Rgb10a2);
        assert_eq!(convert(&image, PixelLayout::Rgba8), vec![255, 0, 0, 255]);
    }

    #[test]
    fn indexed_uses_palette_and_tolerates_short_palette() {
        let palette = [[10, 20, 30, 40], [50, 60, 70, 80]];
        let data = [1u8, 0, 9];
        let image = PixelBuffer::new(&data, 3, 1, PixelLayout::Indexed8).with_palette(&palette);
        assert_eq!(
            convert(&image, PixelLayout::Rgba8),
            vec![50, 60, 70, 80, 10, 20, 30, 40, 0, 0, 0, 0]
        );
    }

    #[test]
    fn coverage_becomes_white_alpha() {
        let data = [0u8, 128, 255];
        let image = PixelBuffer::new(&data, 3, 1, PixelLayout::Gray8);
        assert_eq!(
            coverage_to_rgba(&image),
            vec![255, 255, 255, 0, 255, 255, 255, 128, 255, 255, 255, 255]
        );
    }

    #[test]
    fn prepare_follows_plan() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let image = PixelBuffer::new(&data, 2, 1, PixelLayout::Rgb8);
        let plan = negotiate(PixelLayout::Rgb8, &FormatCaps::rgba_only(), Compression::None);
        assert_eq!(&*prepare(&image, &plan), &[1, 2, 3, 255, 4, 5, 6, 255]);

        let gpu = UploadPlan {
            conversion: Conversion::Gpu,
            ..plan
        };
        assert_eq!(&*prepare(&image, &gpu), &data);
    }

    #[test]
    fn fit_size_preserves_aspect() {
        assert_eq!(fit_size(100, 50, 200), None);
        assert_eq!(fit_size(4000, 2000, 1000), Some((1000, 500)));
        assert_eq!(fit_size(10, 5000, 100), Some((1, 100)));
    }

    #[test]
    fn downscale_produces_expected_size() {
        let pixels = vec![255u8; 64 * 32 * 4];
        let (scaled, w, h) = downscale_rgba(pixels, 64, 32, 16).unwrap();
        assert_eq!((w, h), (16, 8));
        assert_eq!(scaled.len(), 16 * 8 * 4);
        assert!(scaled.iter().all(|&b| b == 255));
    }

    #[test]
    fn crop_limits_dimensions_only() {
        let data = [0u8; 64];
        let image = PixelBuffer::new(&data, 8, 2, PixelLayout::Rgba8);
        let cropped = crop(&image, 4);
        assert_eq!((cropped.width, cropped.height), (4, 2));
        assert_eq!(cropped.pitch, 32);
        assert!(cropped.validate().is_ok());
    }
}
