//! Turning widget-supplied pixel buffers into ready-to-upload data.
//!
//! Backends call one of the `plan_*` functions, then create a GPU image of
//! [`Upload::plan`]'s layout and copy [`Upload::bytes`] into it. Every failure
//! is logged here and reported as `None`.

use std::borrow::Cow;

use crate::config::Compression;
use crate::convert;
use crate::format::{negotiate, Conversion, FormatCaps, PixelBuffer, PixelLayout, UploadPlan};

/// Sampling filter of a texture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    /// Bilinear, for pictures and icons.
    Linear,
    /// Nearest texel, for pixel-exact text.
    Nearest,
}

/// Pixel data and layout decision for one texture.
#[derive(Debug)]
pub struct Upload<'a> {
    /// Tightly packed rows, in the plan's layout or, for
    /// [`Conversion::Gpu`], in the source layout.
    pub bytes: Cow<'a, [u8]>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Layout decision.
    pub plan: UploadPlan,
    /// Layout of `bytes` before any GPU conversion.
    pub source: PixelLayout,
    /// Palette for GPU-side indexed expansion.
    pub palette: Option<&'a [[u8; 4]]>,
    /// Sampling filter.
    pub filter: Filter,
}

/// Inputs shared by every plan.
#[derive(Copy, Clone, Debug)]
pub struct UploadContext<'c> {
    /// Device capabilities.
    pub caps: &'c FormatCaps,
    /// Requested compression.
    pub compression: Compression,
    /// Device texture edge limit.
    pub max_texture_size: u32,
}

/// Plan an image upload; `None` when invalid or larger than the device allows.
#[must_use]
pub fn plan_image<'a>(image: &PixelBuffer<'a>, ctx: UploadContext<'_>) -> Option<Upload<'a>> {
    if let Err(err) = image.validate() {
        tracing::warn!(%err, "rejecting texture source");
        return None;
    }
    if image.width > ctx.max_texture_size || image.height > ctx.max_texture_size {
        tracing::warn!(
            width = image.width,
            height = image.height,
            max = ctx.max_texture_size,
            "image exceeds device texture limit"
        );
        return None;
    }
    let plan = negotiate(image.layout, ctx.caps, ctx.compression);
    Some(Upload {
        bytes: convert::prepare(image, &plan),
        width: image.width,
        height: image.height,
        plan,
        source: image.layout,
        palette: image.palette,
        filter: Filter::Linear,
    })
}

/// Plan a picture upload, downscaling so neither side exceeds `limit`.
#[must_use]
pub fn plan_picture<'a>(image: &PixelBuffer<'a>, ctx: UploadContext<'_>, limit: u32) -> Option<Upload<'a>> {
    let limit = limit.min(ctx.max_texture_size);
    if image.width <= limit && image.height <= limit {
        return plan_image(image, ctx);
    }
    if let Err(err) = image.validate() {
        tracing::warn!(%err, "rejecting picture source");
        return None;
    }
    let rgba = convert::convert(image, PixelLayout::Rgba8);
    let Some((pixels, width, height)) = convert::downscale_rgba(rgba, image.width, image.height, limit) else {
        tracing::warn!(width = image.width, height = image.height, "picture downscale failed");
        return None;
    };
    tracing::debug!(
        from = ?(image.width, image.height),
        to = ?(width, height),
        "downscaled picture"
    );
    let plan = negotiate(PixelLayout::Rgba8, ctx.caps, ctx.compression);
    let bytes = if plan.conversion == Conversion::Cpu {
        convert::convert(&PixelBuffer::new(&pixels, width, height, PixelLayout::Rgba8), plan.layout)
    } else {
        pixels
    };
    Some(Upload {
        bytes: Cow::Owned(bytes),
        width,
        height,
        plan,
        source: PixelLayout::Rgba8,
        palette: None,
        filter: Filter::Linear,
    })
}

/// Plan a text upload: crop to the device limit, expand coverage to RGBA8.
#[must_use]
pub fn plan_text<'a>(image: &PixelBuffer<'a>, ctx: UploadContext<'_>) -> Option<Upload<'a>> {
    let cropped = convert::crop(image, ctx.max_texture_size);
    if let Err(err) = cropped.validate() {
        tracing::warn!(%err, "rejecting text source");
        return None;
    }
    Some(Upload {
        bytes: Cow::Owned(convert::coverage_to_rgba(&cropped)),
        width: cropped.width,
        height: cropped.height,
        plan: UploadPlan {
            layout: PixelLayout::Rgba8,
            conversion: Conversion::Cpu,
            compressed: false,
        },
        source: PixelLayout::Rgba8,
        palette: None,
        filter: Filter::Nearest,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ctx(caps: &FormatCaps, compression: Compression, max: u32) -> UploadContext<'_> {
        UploadContext {
            caps,
            compression,
            max_texture_size: max,
        }
    }

    #[test]
    fn oversized_image_is_rejected() {
        let data = vec![0u8; 8 * 4 * 4];
        let image = PixelBuffer::new(&data, 8, 4, PixelLayout::Rgba8);
        let caps = FormatCaps::rgba_only();
        assert!(plan_image(&image, ctx(&caps, Compression::None, 4)).is_none());
        assert!(plan_image(&image, ctx(&caps, Compression::None, 8)).is_some());
    }

    #[test]
    fn direct_image_borrows_source() {
        let data = vec![7u8; 4 * 4];
        let image = PixelBuffer::new(&data, 2, 2, PixelLayout::Rgba8);
        let caps = FormatCaps::rgba_only();
        let upload = plan_image(&image, ctx(&caps, Compression::None, 64)).unwrap();
        assert!(matches!(upload.bytes, Cow::Borrowed(_)));
        assert_eq!(upload.filter, Filter::Linear);
    }

    #[test]
    fn picture_is_downscaled_and_squashed() {
        let data = vec![255u8; 32 * 16 * 4];
        let image = PixelBuffer::new(&data, 32, 16, PixelLayout::Rgba8);
        let caps = FormatCaps::from_layouts([PixelLayout::Rgba5551]);
        let upload = plan_picture(&image, ctx(&caps, Compression::Squashed, 1024), 8).unwrap();
        assert_eq!((upload.width, upload.height), (8, 4));
        assert_eq!(upload.plan.layout, PixelLayout::Rgba5551);
        assert_eq!(upload.bytes.len(), 8 * 4 * 2);
    }

    #[test]
    fn picture_limit_is_capped_by_device() {
        let data = vec![0u8; 20 * 10 * 4];
        let image = PixelBuffer::new(&data, 20, 10, PixelLayout::Rgba8);
        let caps = FormatCaps::rgba_only();
        let upload = plan_picture(&image, ctx(&caps, Compression::None, 10), 1000).unwrap();
        assert_eq!((upload.width, upload.height), (10, 5));
    }

    #[test]
    fn text_is_cropped_and_nearest() {
        let data = vec![200u8; 6 * 2];
        let image = PixelBuffer::new(&data, 6, 2, PixelLayout::Gray8);
        let caps = FormatCaps::rgba_only();
        let upload = plan_text(&image, ctx(&caps, Compression::Squashed, 4)).unwrap();
        assert_eq!((upload.width, upload.height), (4, 2));
        assert_eq!(upload.filter, Filter::Nearest);
        assert_eq!(upload.plan.layout, PixelLayout::Rgba8);
        assert_eq!(&upload.bytes[..4], &[255, 255, 255, 200]);
        assert_eq!(upload.bytes.len(), 4 * 2 * 4);
    }
}
