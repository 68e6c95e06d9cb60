//! Pixel layouts, device capability tables and upload negotiation.
//!
//! [`negotiate`] is the single decision point for how a source image lands on
//! the GPU. It is a pure function of the source layout, the device's
//! [`FormatCaps`] and the requested [`Compression`], so every backend makes
//! the same choice for the same inputs.

use crate::config::Compression;
use crate::error::{RendererError, Result};

/// Memory layout of a source or GPU pixel.
///
/// Byte-wise layouts (`Rgba8`, `Bgra8`, `Rgb8`, `Bgr8`) list channels in
/// memory order. Packed 16-bit layouts are little-endian words with the first
/// named channel in the most significant bits. `Rgb10a2` is a little-endian
/// word with red in the low ten bits and alpha in the top two.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// 8-bit red, green, blue, alpha.
    Rgba8,
    /// 8-bit blue, green, red, alpha.
    Bgra8,
    /// 8-bit red, green, blue.
    Rgb8,
    /// 8-bit blue, green, red.
    Bgr8,
    /// 5-bit red, green, blue and 1-bit alpha.
    Rgba5551,
    /// 5-bit blue, green, red and 1-bit alpha.
    Bgra5551,
    /// 5-bit red, 6-bit green, 5-bit blue.
    Rgb565,
    /// 5-bit blue, 6-bit green, 5-bit red.
    Bgr565,
    /// 4 bits per channel.
    Rgba4444,
    /// 10 bits per color channel, 2-bit alpha.
    Rgb10a2,
    /// 8-bit single channel, used for glyph coverage.
    Gray8,
    /// 8-bit palette index.
    Indexed8,
}

impl PixelLayout {
    /// Every layout, in capability-table order.
    pub const ALL: [PixelLayout; 12] = [
        Self::Rgba8,
        Self::Bgra8,
        Self::Rgb8,
        Self::Bgr8,
        Self::Rgba5551,
        Self::Bgra5551,
        Self::Rgb565,
        Self::Bgr565,
        Self::Rgba4444,
        Self::Rgb10a2,
        Self::Gray8,
        Self::Indexed8,
    ];

    /// Bytes occupied by one pixel.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8 | Self::Bgra8 | Self::Rgb10a2 => 4,
            Self::Rgb8 | Self::Bgr8 => 3,
            Self::Rgba5551 | Self::Bgra5551 | Self::Rgb565 | Self::Bgr565 | Self::Rgba4444 => 2,
            Self::Gray8 | Self::Indexed8 => 1,
        }
    }

    /// Whether the layout stores an alpha channel.
    #[must_use]
    pub const fn has_alpha(self) -> bool {
        !matches!(
            self,
            Self::Rgb8 | Self::Bgr8 | Self::Rgb565 | Self::Bgr565 | Self::Gray8
        )
    }

    /// Whether a GPU could ever sample this layout as-is.
    ///
    /// Three-byte and indexed layouts always go through a converter.
    #[must_use]
    pub const fn is_sampleable(self) -> bool {
        !matches!(self, Self::Rgb8 | Self::Bgr8 | Self::Gray8 | Self::Indexed8)
    }

    /// Whether the layout is one of the reduced-depth squash targets.
    #[must_use]
    pub const fn is_squashed(self) -> bool {
        matches!(
            self,
            Self::Rgba5551 | Self::Bgra5551 | Self::Rgb565 | Self::Bgr565 | Self::Rgba4444
        )
    }

    const fn bit(self) -> u16 {
        1 << self as u16
    }
}

/// Borrowed pixel data handed over by the image or font layer.
#[derive(Copy, Clone, Debug)]
pub struct PixelBuffer<'a> {
    /// Raw bytes, `pitch` bytes per row.
    pub data: &'a [u8],
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes between the starts of consecutive rows.
    pub pitch: u32,
    /// Layout of each pixel.
    pub layout: PixelLayout,
    /// Palette for [`PixelLayout::Indexed8`], RGBA entries.
    pub palette: Option<&'a [[u8; 4]]>,
}

impl<'a> PixelBuffer<'a> {
    /// Describe tightly packed rows.
    #[must_use]
    pub fn new(data: &'a [u8], width: u32, height: u32, layout: PixelLayout) -> Self {
        Self {
            data,
            width,
            height,
            pitch: width.saturating_mul(layout.bytes_per_pixel()),
            layout,
            palette: None,
        }
    }

    /// Override the row pitch.
    #[must_use]
    pub fn with_pitch(mut self, pitch: u32) -> Self {
        self.pitch = pitch;
        self
    }

    /// Attach a palette.
    #[must_use]
    pub fn with_palette(mut self, palette: &'a [[u8; 4]]) -> Self {
        self.palette = Some(palette);
        self
    }

    /// Bytes of visible pixel data per row.
    #[must_use]
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.layout.bytes_per_pixel() as usize
    }

    /// Whether rows are stored back to back.
    #[must_use]
    pub fn is_tight(&self) -> bool {
        self.pitch as usize == self.row_bytes()
    }

    /// The bytes of row `y`, without padding.
    #[must_use]
    pub fn row(&self, y: u32) -> &'a [u8] {
        let start = y as usize * self.pitch as usize;
        &self.data[start..start + self.row_bytes()]
    }

    /// Check that the declared geometry fits in `data`.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::InvalidImage`] for empty images, a pitch
    /// smaller than a row, a short buffer, or indexed data without a palette.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(RendererError::invalid_image(format!(
                "empty image {}x{}",
                self.width, self.height
            )));
        }
        if (self.pitch as usize) < self.row_bytes() {
            return Err(RendererError::invalid_image(format!(
                "pitch {} shorter than row of {} bytes",
                self.pitch,
                self.row_bytes()
            )));
        }
        let needed = (self.height as usize - 1) * self.pitch as usize + self.row_bytes();
        if self.data.len() < needed {
            return Err(RendererError::invalid_image(format!(
                "{} bytes supplied, {needed} required",
                self.data.len()
            )));
        }
        if self.layout == PixelLayout::Indexed8 && self.palette.is_none() {
            return Err(RendererError::invalid_image("indexed image without palette"));
        }
        Ok(())
    }
}

/// Layouts and features a device offers for sampled textures.
///
/// Built once per renderer and read-only afterwards. [`PixelLayout::Rgba8`]
/// is always present.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FormatCaps {
    sampleable: u16,
    /// A GPU compute converter for three-byte and indexed layouts exists.
    pub gpu_converter: bool,
    /// Block-compressed storage can be requested.
    pub compressed: bool,
}

impl Default for FormatCaps {
    fn default() -> Self {
        Self::rgba_only()
    }
}

impl FormatCaps {
    /// The mandatory minimum: RGBA8 only.
    #[must_use]
    pub const fn rgba_only() -> Self {
        Self {
            sampleable: PixelLayout::Rgba8.bit(),
            gpu_converter: false,
            compressed: false,
        }
    }

    /// Capabilities from a list of supported layouts.
    ///
    /// Layouts that can never be sampled directly are ignored.
    #[must_use]
    pub fn from_layouts(layouts: impl IntoIterator<Item = PixelLayout>) -> Self {
        let mut caps = Self::rgba_only();
        for layout in layouts {
            caps.set(layout, true);
        }
        caps
    }

    /// Mark `layout` as (un)supported. RGBA8 cannot be removed.
    pub fn set(&mut self, layout: PixelLayout, supported: bool) {
        if !layout.is_sampleable() || layout == PixelLayout::Rgba8 {
            return;
        }
        if supported {
            self.sampleable |= layout.bit();
        } else {
            self.sampleable &= !layout.bit();
        }
    }

    /// Whether the device can sample `layout` directly.
    #[must_use]
    pub const fn supports(&self, layout: PixelLayout) -> bool {
        self.sampleable & layout.bit() != 0
    }

    /// Supported layouts in table order.
    pub fn layouts(&self) -> impl Iterator<Item = PixelLayout> + '_ {
        PixelLayout::ALL.into_iter().filter(|&l| self.supports(l))
    }

    /// Compression modes worth offering to the user on this device.
    #[must_use]
    pub fn compressions(&self) -> Vec<Compression> {
        let mut modes = vec![Compression::None];
        if squash_target(true, self).is_some() || squash_target(false, self).is_some() {
            modes.push(Compression::Squashed);
        }
        if self.compressed {
            modes.push(Compression::Compressed);
        }
        modes
    }
}

/// Where a layout change happens.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Conversion {
    /// Bytes are uploaded unchanged.
    None,
    /// Reformatted on the CPU before upload.
    Cpu,
    /// Reformatted by the GPU format converter.
    Gpu,
}

/// Outcome of [`negotiate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UploadPlan {
    /// Layout the GPU image is created with.
    pub layout: PixelLayout,
    /// How source bytes reach that layout.
    pub conversion: Conversion,
    /// Ask the driver for block-compressed storage.
    pub compressed: bool,
}

/// Choose how an image of `source` layout is uploaded.
///
/// In priority order: the source layout itself when the device samples it
/// (unless squashing was requested for a deeper-than-16-bit source); a
/// device-supported squashed layout when [`Compression::Squashed`] is set; the
/// mandatory RGBA8 layout otherwise. Three-byte and indexed sources go to RGBA8
/// through the GPU converter when the device has one.
#[must_use]
pub fn negotiate(source: PixelLayout, caps: &FormatCaps, compression: Compression) -> UploadPlan {
    let compressed = compression == Compression::Compressed && caps.compressed;
    let plan = |layout, conversion| UploadPlan {
        layout,
        conversion,
        compressed,
    };

    let gpu_convertible = matches!(
        source,
        PixelLayout::Rgb8 | PixelLayout::Bgr8 | PixelLayout::Indexed8
    );
    if gpu_convertible && caps.gpu_converter {
        return plan(PixelLayout::Rgba8, Conversion::Gpu);
    }

    let wants_squash = compression == Compression::Squashed && source.bytes_per_pixel() > 2;
    if caps.supports(source) && !wants_squash {
        return plan(source, Conversion::None);
    }
    if wants_squash {
        if let Some(target) = squash_target(source.has_alpha(), caps) {
            return plan(target, Conversion::Cpu);
        }
    }
    if caps.supports(source) {
        return plan(source, Conversion::None);
    }
    plan(PixelLayout::Rgba8, Conversion::Cpu)
}

fn squash_target(alpha: bool, caps: &FormatCaps) -> Option<PixelLayout> {
    let candidates: &[PixelLayout] = if alpha {
        &[PixelLayout::Rgba5551, PixelLayout::Rgba4444]
    } else {
        &[PixelLayout::Rgb565, PixelLayout::Rgba5551]
    };
    candidates.iter().copied().find(|&l| caps.supports(l))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn desktop_caps() -> FormatCaps {
        FormatCaps::from_layouts([
            PixelLayout::Bgra8,
            PixelLayout::Rgba5551,
            PixelLayout::Bgra5551,
            PixelLayout::Rgb565,
            PixelLayout::Bgr565,
            PixelLayout::Rgba4444,
        ])
    }

    #[test]
    fn direct_upload_when_sampleable() {
        let plan = negotiate(PixelLayout::Bgra8, &desktop_caps(), Compression::None);
        assert_eq!(plan.layout, PixelLayout::Bgra8);
        assert_eq!(plan.conversion, Conversion::None);
        assert!(!plan.compressed);
    }

    #[test]
    fn squash_prefers_5551_for_alpha_and_565_for_opaque() {
        let caps = desktop_caps();
        let alpha = negotiate(PixelLayout::Rgba8, &caps, Compression::Squashed);
        assert_eq!(alpha.layout, PixelLayout::Rgba5551);
        assert_eq!(alpha.conversion, Conversion::Cpu);

        let opaque = negotiate(PixelLayout::Rgb8, &caps, Compression::Squashed);
        assert_eq!(opaque.layout, PixelLayout::Rgb565);
        assert_eq!(opaque.conversion, Conversion::Cpu);
    }

    #[test]
    fn already_shallow_source_is_not_resquashed() {
        let plan = negotiate(PixelLayout::Bgr565, &desktop_caps(), Compression::Squashed);
        assert_eq!(plan.layout, PixelLayout::Bgr565);
        assert_eq!(plan.conversion, Conversion::None);
    }

    #[test]
    fn squash_without_device_support_keeps_source() {
        let caps = FormatCaps::from_layouts([PixelLayout::Bgra8]);
        let plan = negotiate(PixelLayout::Bgra8, &caps, Compression::Squashed);
        assert_eq!(plan.layout, PixelLayout::Bgra8);
        assert_eq!(plan.conversion, Conversion::None);
    }

    #[test]
    fn three_byte_never_direct() {
        let caps = FormatCaps::from_layouts([PixelLayout::Rgb8, PixelLayout::Bgr8]);
        assert!(!caps.supports(PixelLayout::Rgb8));
        let plan = negotiate(PixelLayout::Bgr8, &caps, Compression::None);
        assert_eq!(plan.layout, PixelLayout::Rgba8);
        assert_eq!(plan.conversion, Conversion::Cpu);
    }

    #[test]
    fn gpu_converter_takes_odd_layouts() {
        let caps = FormatCaps {
            gpu_converter: true,
            ..desktop_caps()
        };
        for source in [PixelLayout::Rgb8, PixelLayout::Bgr8, PixelLayout::Indexed8] {
            let plan = negotiate(source, &caps, Compression::None);
            assert_eq!(plan.layout, PixelLayout::Rgba8);
            assert_eq!(plan.conversion, Conversion::Gpu);
        }
        // Gray coverage stays on the CPU path.
        let gray = negotiate(PixelLayout::Gray8, &caps, Compression::None);
        assert_eq!(gray.conversion, Conversion::Cpu);
    }

    #[test]
    fn unsupported_packed_source_falls_back_to_rgba() {
        let plan = negotiate(PixelLayout::Rgb10a2, &FormatCaps::rgba_only(), Compression::None);
        assert_eq!(plan.layout, PixelLayout::Rgba8);
        assert_eq!(plan.conversion, Conversion::Cpu);
    }

    #[test]
    fn compressed_flag_requires_device_support() {
        let mut caps = desktop_caps();
        assert!(!negotiate(PixelLayout::Rgba8, &caps, Compression::Compressed).compressed);
        caps.compressed = true;
        let plan = negotiate(PixelLayout::Rgba8, &caps, Compression::Compressed);
        assert!(plan.compressed);
        assert_eq!(plan.conversion, Conversion::None);
    }

    #[test]
    fn negotiation_is_deterministic() {
        let caps = [
            FormatCaps::rgba_only(),
            desktop_caps(),
            FormatCaps {
                gpu_converter: true,
                compressed: true,
                ..desktop_caps()
            },
        ];
        let modes = [Compression::None, Compression::Squashed, Compression::Compressed];
        for cap in &caps {
            for mode in modes {
                for layout in PixelLayout::ALL {
                    assert_eq!(negotiate(layout, cap, mode), negotiate(layout, cap, mode));
                    let plan = negotiate(layout, cap, mode);
                    assert!(cap.supports(plan.layout), "{layout:?} -> {plan:?}");
                }
            }
        }
    }

    #[test]
    fn rgba8_cannot_be_removed() {
        let mut caps = FormatCaps::rgba_only();
        caps.set(PixelLayout::Rgba8, false);
        assert!(caps.supports(PixelLayout::Rgba8));
        assert_eq!(caps.layouts().collect::<Vec<_>>(), vec![PixelLayout::Rgba8]);
    }

    #[test]
    fn compressions_reflect_caps() {
        assert_eq!(FormatCaps::rgba_only().compressions(), vec![Compression::None]);
        let caps = FormatCaps {
            compressed: true,
            ..desktop_caps()
        };
        assert_eq!(
            caps.compressions(),
            vec![Compression::None, Compression::Squashed, Compression::Compressed]
        );
    }

    #[test]
    fn validate_rejects_short_buffers() {
        let data = [0u8; 15];
        let short = PixelBuffer::new(&data, 2, 2, PixelLayout::Rgba8);
        assert!(short.validate().is_err());

        let padded = PixelBuffer::new(&data, 1, 2, PixelLayout::Rgb8).with_pitch(8);
        assert!(padded.validate().is_ok());
        assert!(!padded.is_tight());
        assert_eq!(padded.row(1).len(), 3);

        let indexed = PixelBuffer::new(&data, 2, 2, PixelLayout::Indexed8);
        assert!(indexed.validate().is_err());
    }
}
