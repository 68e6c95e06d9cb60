//! Immediate pipeline on OpenGL 3.1 via [`glow`].
//!
//! Every [`draw_rect`](Renderer::draw_rect) is one uniform update and one
//! four-vertex triangle strip into the window's default framebuffer. Each
//! window has its own context; all contexts share one object namespace, so
//! programs and textures are created once while vertex arrays and
//! framebuffers (which are never shared) exist per view.
//!
//! The pick pass renders into a per-view 1×1 `RGBA32UI` framebuffer and reads
//! it back with `glReadPixels`, which blocks until the GPU is done.

mod texture;

use std::sync::Arc;

use glow::{HasContext, PixelPackData};

use crate::arena::Arena;
use crate::config::{Compression, DeviceId, RendererSettings};
use crate::error::{RendererError, Result};
use crate::format::{FormatCaps, PixelBuffer};
use crate::identity::WidgetId;
use crate::present::PresentConfig;
use crate::quad::{PickInstance, QuadInstance, ViewUniform};
use crate::renderer::{DeviceEntry, DeviceInfo, FrameStatus, Renderer, Texture};
use crate::shaders;
use crate::types::{Color, Point, Rect, ViewId, ViewInfo};
use crate::upload::{self, Upload, UploadContext};
use crate::view::{self, NativeWindow, View, ViewTarget};

/// A window that owns an OpenGL context.
///
/// All contexts handed to one [`GlRenderer`] must share objects with each
/// other and be usable through the same [`glow::Context`] function table.
pub trait GlWindow: NativeWindow {
    /// Make this window's context current on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the windowing layer's error string.
    fn make_current(&self) -> std::result::Result<(), String>;

    /// Present the back buffer.
    ///
    /// # Errors
    ///
    /// Returns the windowing layer's error string.
    fn swap_buffers(&self) -> std::result::Result<(), String>;

    /// Set the swap interval of the current context: `0` off, `1` vsync,
    /// `-1` adaptive vsync.
    ///
    /// # Errors
    ///
    /// Returns the windowing layer's error string, e.g. when adaptive vsync
    /// is unsupported.
    fn set_swap_interval(&self, interval: i32) -> std::result::Result<(), String>;
}

/// Cached uniform locations for the quad program.
struct QuadUniforms {
    /// `u_pview`: view origin and half size.
    pview: glow::UniformLocation,
    /// `u_rect`: clipped rectangle.
    rect: glow::UniformLocation,
    /// `u_uv`: texture window.
    uv: glow::UniformLocation,
    /// `u_color`: tint.
    color: glow::UniformLocation,
}

/// Cached uniform locations for the pick program.
struct PickUniforms {
    /// `u_pview`: pick transform.
    pview: glow::UniformLocation,
    /// `u_rect`: clipped rectangle.
    rect: glow::UniformLocation,
    /// `u_id`: widget token halves.
    id: glow::UniformLocation,
}

/// Objects shared by every context.
struct Shared {
    quad_program: glow::Program,
    quad_uniforms: QuadUniforms,
    pick_program: glow::Program,
    pick_uniforms: PickUniforms,
    /// 1×1 white texture bound for untextured draws.
    blank: glow::Texture,
}

impl Shared {
    /// Compile both programs and create the blank texture.
    ///
    /// On failure everything created so far is deleted.
    unsafe fn new(gl: &glow::Context) -> Result<Self> {
        let quad_program =
            unsafe { shaders::compile_program(gl, shaders::GL_QUAD_VERTEX_SRC, shaders::GL_QUAD_FRAGMENT_SRC)? };
        let pick_program =
            match unsafe { shaders::compile_program(gl, shaders::GL_PICK_VERTEX_SRC, shaders::GL_PICK_FRAGMENT_SRC) } {
                Ok(program) => program,
                Err(err) => {
                    unsafe { gl.delete_program(quad_program) };
                    return Err(err);
                }
            };

        let built = unsafe { Self::finish(gl, quad_program, pick_program) };
        if built.is_err() {
            unsafe {
                gl.delete_program(quad_program);
                gl.delete_program(pick_program);
            }
        }
        built
    }

    unsafe fn finish(gl: &glow::Context, quad_program: glow::Program, pick_program: glow::Program) -> Result<Self> {
        let quad_uniforms = unsafe {
            QuadUniforms {
                pview: shaders::uniform(gl, quad_program, "u_pview")?,
                rect: shaders::uniform(gl, quad_program, "u_rect")?,
                uv: shaders::uniform(gl, quad_program, "u_uv")?,
                color: shaders::uniform(gl, quad_program, "u_color")?,
            }
        };
        let pick_uniforms = unsafe {
            PickUniforms {
                pview: shaders::uniform(gl, pick_program, "u_pview")?,
                rect: shaders::uniform(gl, pick_program, "u_rect")?,
                id: shaders::uniform(gl, pick_program, "u_id")?,
            }
        };
        unsafe {
            let sampler = shaders::uniform(gl, quad_program, "u_texture")?;
            gl.use_program(Some(quad_program));
            gl.uniform_1_i32(Some(&sampler), 0);
            gl.use_program(None);
        }
        let blank = unsafe { texture::create_blank(gl)? };

        Ok(Self {
            quad_program,
            quad_uniforms,
            pick_program,
            pick_uniforms,
            blank,
        })
    }

    unsafe fn destroy(&self, gl: &glow::Context) {
        unsafe {
            gl.delete_program(self.quad_program);
            gl.delete_program(self.pick_program);
            gl.delete_texture(self.blank);
        }
    }
}

/// Per-context objects of one view.
struct GlViewState {
    /// Empty vertex array; geometry comes from `gl_VertexID`.
    vao: glow::VertexArray,
    /// Framebuffer of the pick pass.
    pick_fbo: glow::Framebuffer,
    /// 1×1 `RGBA32UI` color attachment of [`pick_fbo`](Self::pick_fbo).
    pick_texture: glow::Texture,
}

impl GlViewState {
    /// Make `window` current and create its per-context objects.
    unsafe fn new(gl: &glow::Context, window: &impl GlWindow) -> Result<Self> {
        window
            .make_current()
            .map_err(|err| RendererError::api("MakeCurrent", err))?;

        unsafe {
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.disable(glow::DITHER);

            let vao = gl
                .create_vertex_array()
                .map_err(|err| RendererError::api("glGenVertexArrays", err))?;
            let pick_texture = match gl.create_texture() {
                Ok(tex) => tex,
                Err(err) => {
                    gl.delete_vertex_array(vao);
                    return Err(RendererError::api("glGenTextures", err));
                }
            };
            let pick_fbo = match gl.create_framebuffer() {
                Ok(fbo) => fbo,
                Err(err) => {
                    gl.delete_texture(pick_texture);
                    gl.delete_vertex_array(vao);
                    return Err(RendererError::api("glGenFramebuffers", err));
                }
            };
            let state = Self {
                vao,
                pick_fbo,
                pick_texture,
            };

            // GL enum values fit in i32.
            #[expect(clippy::cast_possible_wrap)]
            let internal = glow::RGBA32UI as i32;
            gl.bind_texture(glow::TEXTURE_2D, Some(pick_texture));
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                internal,
                1,
                1,
                0,
                glow::RGBA_INTEGER,
                glow::UNSIGNED_INT,
                glow::PixelUnpackData::Slice(None),
            );
            #[expect(clippy::cast_possible_wrap)]
            {
                gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
                gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::NEAREST as i32);
            }
            gl.bind_texture(glow::TEXTURE_2D, None);

            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(pick_fbo));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(pick_texture),
                0,
            );
            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            if status != glow::FRAMEBUFFER_COMPLETE {
                state.destroy(gl);
                return Err(RendererError::api(
                    "glCheckFramebufferStatus",
                    format!("0x{status:04X}"),
                ));
            }
            Ok(state)
        }
    }

    /// Delete the objects; the owning context must be current.
    unsafe fn destroy(&self, gl: &glow::Context) {
        unsafe {
            gl.delete_framebuffer(self.pick_fbo);
            gl.delete_texture(self.pick_texture);
            gl.delete_vertex_array(self.vao);
        }
    }
}

/// The draw or pick cycle in progress.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Cycle {
    /// Drawing into view `index`.
    Frame(usize),
    /// A frame on view `index` that draws nothing.
    Skipped(usize),
    /// Picking on view `index`.
    Pick(usize),
}

/// The OpenGL backend.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use widget_renderer::gl::{GlRenderer, GlWindow};
/// # use widget_renderer::{Rect, Renderer, RendererSettings, ViewId, ViewTarget, WHITE};
/// # fn example<W: GlWindow>(gl: Arc<glow::Context>, window: W) -> widget_renderer::Result<()> {
/// let settings = RendererSettings::default();
/// let mut renderer = unsafe { GlRenderer::new(gl, vec![ViewTarget::single(window)], &settings)? };
///
/// renderer.begin_frame(ViewId::Single)?;
/// renderer.draw_rect(None, Rect::new(10, 10, 100, 40), Rect::new(0, 0, 800, 600), WHITE);
/// renderer.end_frame(ViewId::Single)?;
/// # Ok(())
/// # }
/// ```
pub struct GlRenderer<W: GlWindow> {
    /// The OpenGL function table shared by every context.
    gl: Arc<glow::Context>,
    /// Views in creation order.
    views: Vec<View<W, GlViewState>>,
    /// Programs and the blank texture.
    shared: Shared,
    /// Widget textures.
    textures: Arena<glow::Texture>,
    /// Layouts the driver samples natively.
    caps: FormatCaps,
    /// `GL_MAX_TEXTURE_SIZE`, the minimum over all contexts.
    max_texture_size: u32,
    /// `GL_RENDERER` of the first context.
    device_name: String,
    /// Background fill.
    clear_color: Color,
    /// Vsync bookkeeping.
    present: PresentConfig,
    /// Storage mode for new textures.
    compression: Compression,
    /// Picture edge limit from the settings.
    max_picture_res: u32,
    /// View whose context is current.
    current: usize,
    /// Cycle in progress, if any.
    cycle: Option<Cycle>,
}

impl<W: GlWindow> GlRenderer<W> {
    /// Create the renderer with one view per target.
    ///
    /// Each target's context is made current in turn. If any step fails,
    /// every object created so far is deleted before the error is returned.
    ///
    /// # Safety
    ///
    /// `gl` must load functions valid for every target's context, those
    /// contexts must share objects, and the renderer must be used and dropped
    /// on the thread that owns them while the windows are alive.
    ///
    /// # Errors
    ///
    /// Returns an error if a context cannot be made current, a shader fails
    /// to build, or a GL object cannot be created.
    #[tracing::instrument(skip_all, fields(views = targets.len()))]
    pub unsafe fn new(gl: Arc<glow::Context>, targets: Vec<ViewTarget<W>>, settings: &RendererSettings) -> Result<Self> {
        let views = view::build_views(
            targets,
            |window, _| unsafe { GlViewState::new(&gl, window) },
            |view| {
                if view.window.make_current().is_ok() {
                    unsafe { view.present.destroy(&gl) };
                }
            },
        )?;

        let mut max_texture_size = u32::MAX;
        let mut current = views.len() - 1;
        for (index, view) in views.iter().enumerate() {
            if let Err(err) = view.window.make_current() {
                tracing::warn!(%err, view = ?view.id, "cannot query texture limit");
                continue;
            }
            current = index;
            let limit = unsafe { gl.get_parameter_i32(glow::MAX_TEXTURE_SIZE) };
            max_texture_size = max_texture_size.min(u32::try_from(limit).unwrap_or(0));
        }
        let max_texture_size = max_texture_size.clamp(1, 1 << 16);

        let shared = match unsafe { Shared::new(&gl) } {
            Ok(shared) => shared,
            Err(err) => {
                for view in views.iter().rev() {
                    if view.window.make_current().is_ok() {
                        unsafe { view.present.destroy(&gl) };
                    }
                }
                return Err(err);
            }
        };
        let device_name = unsafe { gl.get_parameter_string(glow::RENDERER) };
        tracing::info!(device = %device_name, max_texture_size, "OpenGL renderer ready");

        let mut renderer = Self {
            gl,
            views,
            shared,
            textures: Arena::new(),
            caps: texture::desktop_caps(),
            max_texture_size,
            device_name,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            present: PresentConfig::new(settings.vsync),
            compression: settings.compression,
            max_picture_res: settings.max_picture_res,
            current,
            cycle: None,
        };
        renderer.apply_swap_interval()?;
        Ok(renderer)
    }

    /// Make view `index`'s context current if it is not already.
    fn bind_context(&mut self, index: usize) -> Result<()> {
        if self.current != index {
            self.views[index]
                .window
                .make_current()
                .map_err(|err| RendererError::api("MakeCurrent", err))?;
            self.current = index;
        }
        Ok(())
    }

    /// Apply the vsync setting to every context.
    fn apply_swap_interval(&mut self) -> Result<()> {
        let vsync = self.present.vsync();
        for index in 0..self.views.len() {
            self.bind_context(index)?;
            swap_interval(&self.views[index].window, vsync)?;
        }
        tracing::debug!(vsync, "swap interval applied");
        Ok(())
    }

    fn upload_context(&self) -> UploadContext<'_> {
        UploadContext {
            caps: &self.caps,
            compression: self.compression,
            max_texture_size: self.max_texture_size,
        }
    }

    /// Create a texture from a finished plan.
    fn create_texture(&mut self, upload: Option<Upload<'_>>) -> Option<Texture> {
        let upload = upload?;
        // Objects are shared, so any context will do.
        let raw = unsafe { texture::create(&self.gl, &upload) }
            .map_err(|err| tracing::warn!(%err, "texture creation failed"))
            .ok()?;
        match self.textures.insert(raw) {
            Ok(key) => Some(Texture::new(key, upload.width, upload.height)),
            Err(raw) => {
                tracing::warn!("texture table full");
                unsafe { self.gl.delete_texture(raw) };
                None
            }
        }
    }

    /// Index of the view a cycle is running on, checking the closing call's id.
    fn close_cycle(&mut self, id: ViewId, pick: bool) -> Result<Cycle> {
        let index = view::find_view(&self.views, id)?;
        close(&mut self.cycle, index, pick)
    }
}

/// Set the current context's swap interval for `vsync`.
///
/// Vsync tries adaptive sync first and falls back to plain vsync, then
/// to no sync at all.
fn swap_interval(window: &impl GlWindow, vsync: bool) -> Result<()> {
    let applied = if vsync {
        window
            .set_swap_interval(-1)
            .or_else(|_| window.set_swap_interval(1))
    } else {
        window.set_swap_interval(0)
    };
    if let Err(err) = applied {
        tracing::warn!(%err, vsync, "swap interval rejected, presenting unsynchronized");
        window
            .set_swap_interval(0)
            .map_err(|err| RendererError::api("SetSwapInterval", err))?;
    }
    Ok(())
}

/// Take the running cycle if it is the kind `pick` closes on view `index`.
fn close(cycle: &mut Option<Cycle>, index: usize, pick: bool) -> Result<Cycle> {
    match cycle.take() {
        Some(open @ (Cycle::Frame(i) | Cycle::Skipped(i))) if !pick && i == index => Ok(open),
        Some(open @ Cycle::Pick(i)) if pick && i == index => Ok(open),
        other => {
            *cycle = other;
            Err(RendererError::InvalidState {
                state: cycle_name(other),
                event: if pick { "end_pick" } else { "end_frame" },
            })
        }
    }
}

/// Token stored in the first two channels of an `RGBA32UI` pick texel.
fn pick_token(texel: [u8; 16]) -> Option<WidgetId> {
    let words: [u32; 4] = bytemuck::cast(texel);
    WidgetId::from_halves([words[0], words[1]])
}

fn cycle_name(cycle: Option<Cycle>) -> &'static str {
    match cycle {
        None => "Idle",
        Some(Cycle::Frame(_) | Cycle::Skipped(_)) => "Recording",
        Some(Cycle::Pick(_)) => "Picking",
    }
}

impl<W: GlWindow> Renderer for GlRenderer<W> {
    fn views(&self) -> Vec<ViewInfo> {
        self.views.iter().map(View::info).collect()
    }

    fn set_clear_color(&mut self, color: Color) {
        self.clear_color = color;
    }

    fn set_vsync(&mut self, vsync: bool) -> Result<()> {
        if self.present.set_vsync(vsync) {
            self.apply_swap_interval()?;
        }
        Ok(())
    }

    fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    fn update_view(&mut self, id: ViewId, rect: Option<Rect>) -> Result<()> {
        let index = view::find_view(&self.views, id)?;
        let view = &mut self.views[index];
        view.rect = view.resized_rect(rect);
        tracing::debug!(view = ?id, rect = ?view.rect, "view resized");
        Ok(())
    }

    fn begin_frame(&mut self, id: ViewId) -> Result<FrameStatus> {
        let index = view::find_view(&self.views, id)?;
        if self.cycle.is_some() {
            return Err(RendererError::InvalidState {
                state: cycle_name(self.cycle),
                event: "begin_frame",
            });
        }
        let (w, h) = self.views[index].rect.size();
        if w == 0 || h == 0 {
            self.cycle = Some(Cycle::Skipped(index));
            return Ok(FrameStatus::Skipped);
        }
        self.bind_context(index)?;

        let gl = &self.gl;
        let view = &self.views[index];
        let [r, g, b, a] = self.clear_color;
        let [px, py, pw, ph] = ViewUniform::for_view(view.rect).pview;
        let (vw, vh) = (texture::gl_size("glViewport", w)?, texture::gl_size("glViewport", h)?);
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            gl.viewport(0, 0, vw, vh);
            gl.enable(glow::BLEND);
            gl.blend_func_separate(
                glow::SRC_ALPHA,
                glow::ONE_MINUS_SRC_ALPHA,
                glow::ONE,
                glow::ONE_MINUS_SRC_ALPHA,
            );
            gl.clear_color(r, g, b, a);
            gl.clear(glow::COLOR_BUFFER_BIT);

            gl.use_program(Some(self.shared.quad_program));
            gl.uniform_4_f32(Some(&self.shared.quad_uniforms.pview), px, py, pw, ph);
            gl.bind_vertex_array(Some(view.present.vao));
            gl.active_texture(glow::TEXTURE0);
        }
        self.cycle = Some(Cycle::Frame(index));
        Ok(FrameStatus::Ready)
    }

    fn draw_rect(&mut self, texture: Option<&Texture>, rect: Rect, frame: Rect, color: Color) {
        if !matches!(self.cycle, Some(Cycle::Frame(_))) {
            return;
        }
        let raw = texture
            .and_then(|t| self.textures.get(t.key()).copied())
            .unwrap_or(self.shared.blank);
        let quad = QuadInstance::new(rect, frame, color);
        let u = &self.shared.quad_uniforms;
        let gl = &self.gl;
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(raw));
            gl.uniform_4_f32_slice(Some(&u.rect), &quad.rect);
            gl.uniform_4_f32_slice(Some(&u.uv), &quad.uv);
            gl.uniform_4_f32_slice(Some(&u.color), &quad.color);
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
        }
    }

    fn end_frame(&mut self, id: ViewId) -> Result<()> {
        let cycle = self.close_cycle(id, false)?;
        let Cycle::Frame(index) = cycle else {
            return Ok(());
        };
        unsafe {
            self.gl.bind_vertex_array(None);
            self.gl.bind_texture(glow::TEXTURE_2D, None);
        }
        self.views[index]
            .window
            .swap_buffers()
            .map_err(|err| RendererError::api("SwapBuffers", err))
    }

    fn begin_pick(&mut self, id: ViewId, point: Point) -> Result<()> {
        let index = view::find_view(&self.views, id)?;
        if self.cycle.is_some() {
            return Err(RendererError::InvalidState {
                state: cycle_name(self.cycle),
                event: "begin_pick",
            });
        }
        self.bind_context(index)?;

        let gl = &self.gl;
        let view = &self.views[index];
        let [px, py, pw, ph] = ViewUniform::for_pick(point).pview;
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(view.present.pick_fbo));
            gl.viewport(0, 0, 1, 1);
            gl.disable(glow::BLEND);
            gl.clear_buffer_u32_slice(glow::COLOR, 0, &[0; 4]);

            gl.use_program(Some(self.shared.pick_program));
            gl.uniform_4_f32(Some(&self.shared.pick_uniforms.pview), px, py, pw, ph);
            gl.bind_vertex_array(Some(view.present.vao));
        }
        self.cycle = Some(Cycle::Pick(index));
        Ok(())
    }

    fn draw_sel_rect(&mut self, widget: WidgetId, rect: Rect, frame: Rect) {
        if !matches!(self.cycle, Some(Cycle::Pick(_))) {
            return;
        }
        let pick = PickInstance::new(widget, rect, frame);
        let u = &self.shared.pick_uniforms;
        let gl = &self.gl;
        unsafe {
            gl.uniform_4_f32_slice(Some(&u.rect), &pick.rect);
            gl.uniform_2_u32(Some(&u.id), pick.id[0], pick.id[1]);
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
        }
    }

    fn end_pick(&mut self, id: ViewId) -> Result<Option<WidgetId>> {
        self.close_cycle(id, true)?;
        let mut texel = [0u8; 16];
        let gl = &self.gl;
        unsafe {
            gl.read_pixels(
                0,
                0,
                1,
                1,
                glow::RGBA_INTEGER,
                glow::UNSIGNED_INT,
                PixelPackData::Slice(Some(&mut texel)),
            );
            gl.bind_vertex_array(None);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
        Ok(pick_token(texel))
    }

    fn texture_from_image(&mut self, image: &PixelBuffer<'_>) -> Option<Texture> {
        let upload = upload::plan_image(image, self.upload_context());
        self.create_texture(upload)
    }

    fn texture_from_picture(&mut self, image: &PixelBuffer<'_>) -> Option<Texture> {
        let limit = self.max_picture_res;
        let upload = upload::plan_picture(image, self.upload_context(), limit);
        self.create_texture(upload)
    }

    fn texture_from_text(&mut self, image: &PixelBuffer<'_>) -> Option<Texture> {
        let upload = upload::plan_text(image, self.upload_context());
        self.create_texture(upload)
    }

    fn replace_texture(&mut self, texture: &mut Texture, image: &PixelBuffer<'_>) -> bool {
        let Some(&raw) = self.textures.get(texture.key()) else {
            tracing::warn!("replacing a texture this renderer does not own");
            return false;
        };
        let Some(upload) = upload::plan_image(image, self.upload_context()) else {
            return false;
        };
        match unsafe { texture::fill(&self.gl, raw, &upload) } {
            Ok(()) => {
                texture.set_size(upload.width, upload.height);
                true
            }
            Err(err) => {
                tracing::warn!(%err, "texture replacement failed");
                false
            }
        }
    }

    fn free_texture(&mut self, texture: Texture) {
        // GL defers the deletion until no pending draw uses the texture.
        if let Some(raw) = self.textures.remove(texture.key()) {
            unsafe { self.gl.delete_texture(raw) };
        }
    }

    fn synch_transfers(&mut self) {
        unsafe { self.gl.finish() };
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            devices: vec![DeviceEntry {
                id: DeviceId::default(),
                name: self.device_name.clone(),
            }],
            max_texture_size: self.max_texture_size,
            compressions: self.caps.compressions(),
            current: self.compression,
        }
    }
}

impl<W: GlWindow> Drop for GlRenderer<W> {
    fn drop(&mut self) {
        let gl = &self.gl;
        for view in self.views.iter().rev() {
            if let Err(err) = view.window.make_current() {
                tracing::warn!(%err, view = ?view.id, "leaking view objects, context unavailable");
                continue;
            }
            unsafe { view.present.destroy(gl) };
        }
        unsafe {
            for raw in self.textures.drain() {
                gl.delete_texture(raw);
            }
            self.shared.destroy(gl);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Window whose context accepts only the listed swap intervals.
    struct Intervals {
        accepted: &'static [i32],
        calls: RefCell<Vec<i32>>,
    }

    impl Intervals {
        fn new(accepted: &'static [i32]) -> Self {
            Self {
                accepted,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl NativeWindow for Intervals {
        fn window_id(&self) -> u64 {
            1
        }

        fn drawable_size(&self) -> (u32, u32) {
            (640, 480)
        }
    }

    impl GlWindow for Intervals {
        fn make_current(&self) -> std::result::Result<(), String> {
            Ok(())
        }

        fn swap_buffers(&self) -> std::result::Result<(), String> {
            Ok(())
        }

        fn set_swap_interval(&self, interval: i32) -> std::result::Result<(), String> {
            self.calls.borrow_mut().push(interval);
            if self.accepted.contains(&interval) {
                Ok(())
            } else {
                Err(format!("interval {interval} unsupported"))
            }
        }
    }

    #[test]
    fn vsync_prefers_adaptive_sync() {
        let window = Intervals::new(&[-1, 0, 1]);
        swap_interval(&window, true).unwrap();
        assert_eq!(*window.calls.borrow(), [-1]);
    }

    #[test]
    fn vsync_falls_back_to_plain_then_none() {
        let window = Intervals::new(&[0, 1]);
        swap_interval(&window, true).unwrap();
        assert_eq!(*window.calls.borrow(), [-1, 1]);

        let window = Intervals::new(&[0]);
        swap_interval(&window, true).unwrap();
        assert_eq!(*window.calls.borrow(), [-1, 1, 0]);
    }

    #[test]
    fn unsynchronized_presentation_is_required() {
        let window = Intervals::new(&[1]);
        let err = swap_interval(&window, false).unwrap_err();
        assert!(matches!(err, RendererError::Api { call: "SetSwapInterval", .. }));
        assert_eq!(*window.calls.borrow(), [0, 0]);
    }

    #[test]
    fn pick_texel_decodes_both_halves() {
        let mut texel = [0u8; 16];
        assert_eq!(pick_token(texel), None);

        let widget = WidgetId::from_raw(0x5_0000_0003).unwrap();
        let [low, high] = widget.to_halves();
        texel[..4].copy_from_slice(&low.to_ne_bytes());
        texel[4..8].copy_from_slice(&high.to_ne_bytes());
        // Blue and alpha channels carry nothing.
        texel[8..].fill(0xff);
        assert_eq!(pick_token(texel), Some(widget));
    }

    #[test]
    fn cycles_close_only_on_their_view_and_kind() {
        let mut cycle = Some(Cycle::Frame(1));
        let err = close(&mut cycle, 0, false).unwrap_err();
        assert!(matches!(
            err,
            RendererError::InvalidState {
                state: "Recording",
                event: "end_frame"
            }
        ));
        assert!(close(&mut cycle, 1, true).is_err());
        assert_eq!(cycle, Some(Cycle::Frame(1)));
        assert_eq!(close(&mut cycle, 1, false).unwrap(), Cycle::Frame(1));
        assert_eq!(cycle, None);

        let mut cycle = Some(Cycle::Skipped(0));
        assert_eq!(close(&mut cycle, 0, false).unwrap(), Cycle::Skipped(0));

        let mut cycle = Some(Cycle::Pick(2));
        assert!(close(&mut cycle, 2, false).is_err());
        assert_eq!(close(&mut cycle, 2, true).unwrap(), Cycle::Pick(2));

        let mut cycle = None;
        let err = close(&mut cycle, 0, true).unwrap_err();
        assert!(matches!(err, RendererError::InvalidState { state: "Idle", .. }));
    }
}
