//! Texture storage for the GL backend: layout mapping and uploads.

use glow::{HasContext, PixelUnpackData};

use crate::error::{RendererError, Result};
use crate::format::{FormatCaps, PixelLayout};
use crate::upload::{Filter, Upload};

/// Convert a `u32` size to the `GLsizei` that `call` takes.
pub(crate) fn gl_size(call: &'static str, value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| RendererError::api(call, format!("size {value} exceeds GLsizei")))
}

/// `glTexImage2D` arguments for one layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct GlFormat {
    /// Internal (storage) format.
    pub internal: u32,
    /// Client pixel format.
    pub format: u32,
    /// Client pixel type.
    pub ty: u32,
}

/// Map a sampleable layout to GL upload arguments.
///
/// Packed 16-bit types name their first component in the most significant
/// bits, which matches [`PixelLayout`]'s packing; the `_REV` types cover the
/// layouts stored the other way round. `compressed` swaps the internal
/// format for a generic compressed one and leaves the client side alone.
pub(crate) fn gl_format(layout: PixelLayout, compressed: bool) -> Option<GlFormat> {
    let (internal, format, ty) = match layout {
        PixelLayout::Rgba8 => (glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE),
        PixelLayout::Bgra8 => (glow::RGBA8, glow::BGRA, glow::UNSIGNED_BYTE),
        PixelLayout::Rgba5551 => (glow::RGB5_A1, glow::RGBA, glow::UNSIGNED_SHORT_5_5_5_1),
        PixelLayout::Bgra5551 => (glow::RGB5_A1, glow::BGRA, glow::UNSIGNED_SHORT_5_5_5_1),
        PixelLayout::Rgb565 => (glow::RGB565, glow::RGB, glow::UNSIGNED_SHORT_5_6_5),
        PixelLayout::Bgr565 => (glow::RGB565, glow::RGB, glow::UNSIGNED_SHORT_5_6_5_REV),
        PixelLayout::Rgba4444 => (glow::RGBA4, glow::RGBA, glow::UNSIGNED_SHORT_4_4_4_4),
        PixelLayout::Rgb10a2 => (glow::RGB10_A2, glow::RGBA, glow::UNSIGNED_INT_2_10_10_10_REV),
        PixelLayout::Rgb8 | PixelLayout::Bgr8 | PixelLayout::Gray8 | PixelLayout::Indexed8 => {
            return None;
        }
    };
    let internal = match (compressed, layout.has_alpha()) {
        (false, _) => internal,
        (true, true) => glow::COMPRESSED_RGBA,
        (true, false) => glow::COMPRESSED_RGB,
    };
    Some(GlFormat {
        internal,
        format,
        ty,
    })
}

/// Layouts a desktop OpenGL 3.1 context samples natively.
///
/// The packed formats and `GL_BGRA` are core; generic compressed internal
/// formats are accepted by every desktop driver.
pub(crate) fn desktop_caps() -> FormatCaps {
    let mut caps =
        FormatCaps::from_layouts(PixelLayout::ALL.into_iter().filter(|l| gl_format(*l, false).is_some()));
    caps.compressed = true;
    caps
}

/// Create a texture and fill it from `upload`.
///
/// # Safety
///
/// Requires a current OpenGL context.
///
/// # Errors
///
/// Returns [`RendererError::Api`] if the texture cannot be created or the
/// driver rejects the image.
pub(crate) unsafe fn create(gl: &glow::Context, upload: &Upload<'_>) -> Result<glow::Texture> {
    let texture = unsafe { gl.create_texture() }.map_err(|err| RendererError::api("glGenTextures", err))?;
    if let Err(err) = unsafe { fill(gl, texture, upload) } {
        unsafe { gl.delete_texture(texture) };
        return Err(err);
    }
    Ok(texture)
}

/// Respecify `texture` with the contents of `upload`.
///
/// Respecification may change size and layout; GL keeps the old storage
/// alive for any draw still referencing it.
///
/// # Safety
///
/// Requires a current OpenGL context sharing objects with the one that
/// created `texture`.
///
/// # Errors
///
/// Returns [`RendererError::Api`] if the driver rejects the image.
pub(crate) unsafe fn fill(gl: &glow::Context, texture: glow::Texture, upload: &Upload<'_>) -> Result<()> {
    let Some(fmt) = gl_format(upload.plan.layout, upload.plan.compressed) else {
        return Err(RendererError::api(
            "glTexImage2D",
            format!("layout {:?} is not sampleable", upload.plan.layout),
        ));
    };

    let (width, height) = (
        gl_size("glTexImage2D", upload.width)?,
        gl_size("glTexImage2D", upload.height)?,
    );
    unsafe {
        // Drain stale errors so the check below only sees this upload.
        for _ in 0..16 {
            if gl.get_error() == glow::NO_ERROR {
                break;
            }
        }

        // GL enum values fit in i32.
        #[expect(clippy::cast_possible_wrap)]
        let internal = fmt.internal as i32;
        gl.bind_texture(glow::TEXTURE_2D, Some(texture));
        gl.tex_image_2d(
            glow::TEXTURE_2D,
            0,
            internal,
            width,
            height,
            0,
            fmt.format,
            fmt.ty,
            PixelUnpackData::Slice(Some(&upload.bytes)),
        );
        set_tex_params(gl, upload.filter);
        gl.bind_texture(glow::TEXTURE_2D, None);

        match gl.get_error() {
            glow::NO_ERROR => Ok(()),
            code => Err(RendererError::api("glTexImage2D", format!("0x{code:04X}"))),
        }
    }
}

/// Create the 1×1 white texture sampled by untextured draws.
///
/// # Safety
///
/// Requires a current OpenGL context.
///
/// # Errors
///
/// Returns [`RendererError::Api`] if the texture cannot be created.
pub(crate) unsafe fn create_blank(gl: &glow::Context) -> Result<glow::Texture> {
    let white = [255u8; 4];
    let upload = Upload {
        bytes: std::borrow::Cow::Borrowed(&white),
        width: 1,
        height: 1,
        plan: crate::format::UploadPlan {
            layout: PixelLayout::Rgba8,
            conversion: crate::format::Conversion::None,
            compressed: false,
        },
        source: PixelLayout::Rgba8,
        palette: None,
        filter: Filter::Nearest,
    };
    unsafe { create(gl, &upload) }
}

/// Filtering and wrapping for the bound texture.
unsafe fn set_tex_params(gl: &glow::Context, filter: Filter) {
    let filter = match filter {
        Filter::Linear => glow::LINEAR,
        Filter::Nearest => glow::NEAREST,
    };
    // GL constant values are small enough that the cast is always safe.
    #[expect(clippy::cast_possible_wrap)]
    unsafe {
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::Compression;
    use crate::format::{negotiate, Conversion};

    #[test]
    fn sizes_past_glsizei_are_errors() {
        assert_eq!(gl_size("glViewport", 800).unwrap(), 800);
        assert_eq!(gl_size("glViewport", u32::try_from(i32::MAX).unwrap()).unwrap(), i32::MAX);
        let err = gl_size("glTexImage2D", u32::MAX).unwrap_err();
        assert!(matches!(err, RendererError::Api { call: "glTexImage2D", .. }), "{err}");
    }

    #[test]
    fn odd_layouts_have_no_gl_format() {
        for layout in [PixelLayout::Rgb8, PixelLayout::Bgr8, PixelLayout::Gray8, PixelLayout::Indexed8] {
            assert_eq!(gl_format(layout, false), None, "{layout:?}");
        }
    }

    #[test]
    fn every_sampleable_layout_maps() {
        for layout in PixelLayout::ALL {
            assert_eq!(gl_format(layout, false).is_some(), layout.is_sampleable(), "{layout:?}");
        }
    }

    #[test]
    fn reversed_packings_use_rev_types() {
        assert_eq!(gl_format(PixelLayout::Bgr565, false).unwrap().ty, glow::UNSIGNED_SHORT_5_6_5_REV);
        assert_eq!(gl_format(PixelLayout::Rgb10a2, false).unwrap().ty, glow::UNSIGNED_INT_2_10_10_10_REV);
        assert_eq!(gl_format(PixelLayout::Bgra5551, false).unwrap().format, glow::BGRA);
    }

    #[test]
    fn compression_only_changes_storage() {
        let plain = gl_format(PixelLayout::Rgb565, false).unwrap();
        let packed = gl_format(PixelLayout::Rgb565, true).unwrap();
        assert_eq!(packed.internal, glow::COMPRESSED_RGB);
        assert_eq!((plain.format, plain.ty), (packed.format, packed.ty));
        assert_eq!(gl_format(PixelLayout::Rgba8, true).unwrap().internal, glow::COMPRESSED_RGBA);
    }

    #[test]
    fn desktop_caps_squash_and_compress() {
        let caps = desktop_caps();
        assert!(caps.supports(PixelLayout::Bgra8));
        assert!(!caps.gpu_converter);
        assert_eq!(
            caps.compressions(),
            vec![Compression::None, Compression::Squashed, Compression::Compressed]
        );
        let plan = negotiate(PixelLayout::Rgb8, &caps, Compression::None);
        assert_eq!((plan.layout, plan.conversion), (PixelLayout::Rgba8, Conversion::Cpu));
    }
}
