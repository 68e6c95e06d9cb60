//! Explicit pipeline on Vulkan via [`ash`].
//!
//! Each view owns a swapchain and records into one of two command buffers,
//! so the CPU can prepare a frame while the previous one is still on the
//! GPU. Acquire, submit and present are ordered by per-frame semaphores and
//! a fence; an out-of-date swapchain is rebuilt and the frame skipped.
//!
//! Texture uploads go through two staging slots on the graphics queue.
//! Three-byte and indexed sources are expanded by a compute shader instead of the
//! CPU. The pick pass renders into a 1×1 `R32G32_UINT` image whose texel is
//! copied to a mapped buffer and read after a fence wait.
//!
//! Shaders are written in WGSL and translated to SPIR-V with [`naga`] when
//! the renderer is built.

mod device;
mod memory;
mod pick;
mod pipeline;
mod swapchain;
mod texture;
mod transfer;

use std::borrow::Cow;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::arena::{Arena, Key};
use crate::config::{Compression, RendererSettings};
use crate::error::{RendererError, Result};
use crate::format::{Conversion, FormatCaps, PixelBuffer, PixelLayout, UploadPlan};
use crate::identity::WidgetId;
use crate::present::{PresentConfig, PresentEvent};
use crate::quad::{PickInstance, QuadInstance, ViewUniform};
use crate::renderer::{DeviceInfo, FrameStatus, Renderer, Texture};
use crate::types::{Color, Point, Rect, ViewId, ViewInfo};
use crate::upload::{self, Filter, Upload, UploadContext};
use crate::view::{self, NativeWindow, View, ViewTarget};

use device::{Gpu, Instance};
use pick::PickTarget;
use pipeline::{PickPush, Pipelines, QuadPush, PUSH_STAGES};
use swapchain::Swapchain;
use texture::{DescriptorPools, VkTexture};
use transfer::Transfers;

/// A window Vulkan can present to.
pub trait VulkanWindow: NativeWindow + HasWindowHandle + HasDisplayHandle {}

impl<T: NativeWindow + HasWindowHandle + HasDisplayHandle> VulkanWindow for T {}

/// Device objects shared by every view.
struct Shared {
    pipelines: Pipelines,
    descriptors: DescriptorPools,
    transfers: Transfers,
    pick: PickTarget,
    /// 1×1 white texture bound for untextured draws.
    blank: VkTexture,
}

impl Shared {
    /// Build pipelines, upload slots, the pick target and the blank texture.
    ///
    /// On failure everything created so far is destroyed.
    fn new(gpu: &Gpu, format: vk::Format) -> Result<Self> {
        let mut pipelines = Pipelines::new(&gpu.raw, format)?;
        let mut transfers = match Transfers::new(gpu) {
            Ok(transfers) => transfers,
            Err(err) => {
                pipelines.destroy(&gpu.raw);
                return Err(err);
            }
        };
        let mut descriptors = DescriptorPools::default();
        let built = PickTarget::new(gpu, &pipelines).and_then(|mut pick| {
            match create_blank(gpu, &mut descriptors, &pipelines, &mut transfers) {
                Ok(blank) => Ok((pick, blank)),
                Err(err) => {
                    pick.destroy(gpu);
                    Err(err)
                }
            }
        });
        match built {
            Ok((pick, blank)) => Ok(Self {
                pipelines,
                descriptors,
                transfers,
                pick,
                blank,
            }),
            Err(err) => {
                gpu.wait_idle();
                transfers.destroy(gpu);
                descriptors.destroy(&gpu.raw);
                pipelines.destroy(&gpu.raw);
                Err(err)
            }
        }
    }

    /// Destroy everything. The device must be idle.
    fn destroy(&mut self, gpu: &Gpu) {
        self.transfers.destroy(gpu);
        self.pick.destroy(gpu);
        self.blank.destroy(&gpu.raw);
        self.descriptors.destroy(&gpu.raw);
        self.pipelines.destroy(&gpu.raw);
    }
}

fn create_blank(
    gpu: &Gpu,
    descriptors: &mut DescriptorPools,
    pipelines: &Pipelines,
    transfers: &mut Transfers,
) -> Result<VkTexture> {
    let white = [0xFF_u8; 4];
    let upload = Upload {
        bytes: Cow::Borrowed(white.as_slice()),
        width: 1,
        height: 1,
        plan: UploadPlan {
            layout: PixelLayout::Rgba8,
            conversion: Conversion::None,
            compressed: false,
        },
        source: PixelLayout::Rgba8,
        palette: None,
        filter: Filter::Nearest,
    };
    let extent = vk::Extent2D { width: 1, height: 1 };
    let mut blank = VkTexture::new(gpu, descriptors, pipelines, extent, vk::Format::R8G8B8A8_UNORM, Filter::Nearest)?;
    if let Err(err) = transfers.upload(gpu, &blank.image, &upload) {
        blank.destroy(&gpu.raw);
        return Err(err);
    }
    transfers.wait_all(gpu);
    Ok(blank)
}

fn create_surface<W: VulkanWindow>(instance: &Instance, window: &W) -> Result<vk::SurfaceKHR> {
    let display = window
        .display_handle()
        .map_err(|err| RendererError::surface(err.to_string()))?;
    let handle = window
        .window_handle()
        .map_err(|err| RendererError::surface(err.to_string()))?;
    unsafe { ash_window::create_surface(&instance.entry, &instance.raw, display.as_raw(), handle.as_raw(), None) }
        .map_err(|err| RendererError::api("vkCreateSurfaceKHR", err))
}

/// Best surface format every view supports.
fn common_format(lists: &[Vec<vk::SurfaceFormatKHR>]) -> Option<vk::SurfaceFormatKHR> {
    let (first, rest) = lists.split_first()?;
    let shared: Vec<_> = first
        .iter()
        .copied()
        .filter(|f| {
            rest.iter().all(|list| {
                list.iter()
                    .any(|g| g.format == f.format && g.color_space == f.color_space)
            })
        })
        .collect();
    swapchain::choose_surface_format(&shared)
}

/// The draw or pick cycle in progress.
#[derive(Copy, Clone)]
enum Cycle {
    /// Recording into view `view`'s command buffer `cmd`.
    Frame {
        view: usize,
        cmd: vk::CommandBuffer,
        uniform: ViewUniform,
    },
    /// A frame on view `index` that draws nothing.
    Skipped(usize),
    /// Picking on view `view`.
    Pick { view: usize, uniform: ViewUniform },
}

fn cycle_name(cycle: Option<Cycle>) -> &'static str {
    match cycle {
        None => "Idle",
        Some(Cycle::Frame { .. } | Cycle::Skipped(_)) => "Recording",
        Some(Cycle::Pick { .. }) => "Picking",
    }
}

/// The Vulkan backend.
///
/// # Example
///
/// ```no_run
/// # use widget_renderer::vulkan::{VulkanRenderer, VulkanWindow};
/// # use widget_renderer::{Rect, Renderer, RendererSettings, ViewId, ViewTarget, WHITE};
/// # fn example<W: VulkanWindow>(window: W) -> widget_renderer::Result<()> {
/// let settings = RendererSettings::default();
/// let mut renderer = VulkanRenderer::new(vec![ViewTarget::single(window)], &settings)?;
///
/// renderer.begin_frame(ViewId::Single)?;
/// renderer.draw_rect(None, Rect::new(10, 10, 100, 40), Rect::new(0, 0, 800, 600), WHITE);
/// renderer.end_frame(ViewId::Single)?;
/// # Ok(())
/// # }
/// ```
pub struct VulkanRenderer<W: VulkanWindow> {
    /// Views in creation order, each with its swapchain.
    views: Vec<View<W, Swapchain>>,
    shared: Shared,
    /// Widget textures.
    textures: Arena<VkTexture>,
    /// Layouts the device samples natively.
    caps: FormatCaps,
    /// Background fill.
    clear_color: Color,
    /// Vsync bookkeeping.
    present: PresentConfig,
    /// Storage mode for new textures.
    compression: Compression,
    /// Picture edge limit from the settings.
    max_picture_res: u32,
    /// Cycle in progress, if any.
    cycle: Option<Cycle>,
    // Dropped after every device object above, and before the instance.
    gpu: Gpu,
    instance: Instance,
}

impl<W: VulkanWindow> VulkanRenderer<W> {
    /// Create the renderer with one view per target.
    ///
    /// Every view presents through a surface of the same device and format.
    /// If any step fails, every object created so far is destroyed before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::NoDevice`] when no device can present to all
    /// windows, or an API error when an object cannot be created.
    #[tracing::instrument(skip_all, fields(views = targets.len()))]
    pub fn new(targets: Vec<ViewTarget<W>>, settings: &RendererSettings) -> Result<Self> {
        let display = targets
            .first()
            .ok_or_else(|| RendererError::surface("no windows to create views for"))?
            .window
            .display_handle()
            .map_err(|err| RendererError::surface(err.to_string()))?
            .as_raw();
        let instance = Instance::new(display)?;
        let views = view::build_views(
            targets,
            |window, _| create_surface(&instance, window),
            |view| unsafe { instance.surface.destroy_surface(view.present, None) },
        )?;
        Self::assemble(instance, views, settings)
    }

    fn assemble(
        instance: Instance,
        views: Vec<View<W, vk::SurfaceKHR>>,
        settings: &RendererSettings,
    ) -> Result<Self> {
        let destroy_surfaces = |views: &[View<W, vk::SurfaceKHR>]| {
            for view in views.iter().rev() {
                unsafe { instance.surface.destroy_surface(view.present, None) };
            }
        };
        let surfaces: Vec<vk::SurfaceKHR> = views.iter().map(|view| view.present).collect();
        let gpu = match Gpu::new(&instance, &surfaces, settings.device) {
            Ok(gpu) => gpu,
            Err(err) => {
                destroy_surfaces(&views);
                return Err(err);
            }
        };
        let format = match surface_format(&instance, &gpu, &surfaces) {
            Ok(format) => format,
            Err(err) => {
                destroy_surfaces(&views);
                return Err(err);
            }
        };
        let mut shared = match Shared::new(&gpu, format.format) {
            Ok(shared) => shared,
            Err(err) => {
                destroy_surfaces(&views);
                return Err(err);
            }
        };

        let vsync = PresentConfig::new(settings.vsync).vsync();
        let mut built: Vec<View<W, Swapchain>> = Vec::with_capacity(views.len());
        let mut pending = views.into_iter();
        while let Some(view) = pending.next() {
            let size = view.window.drawable_size();
            let chain = Swapchain::new(
                &instance,
                &gpu,
                view.present,
                format,
                shared.pipelines.render_pass,
                size,
                vsync,
            );
            match chain {
                Ok(chain) => built.push(View {
                    id: view.id,
                    window: view.window,
                    rect: view.rect,
                    present: chain,
                }),
                Err(err) => {
                    tracing::warn!(view = ?view.id, %err, "swapchain creation failed, releasing {} views", built.len());
                    for rest in pending {
                        unsafe { instance.surface.destroy_surface(rest.present, None) };
                    }
                    gpu.wait_idle();
                    for mut view in built.into_iter().rev() {
                        view.present.destroy(&instance, &gpu);
                    }
                    shared.destroy(&gpu);
                    return Err(err);
                }
            }
        }

        tracing::debug!(format = ?format.format, "swapchains built");
        Ok(Self::from_parts(instance, gpu, shared, built, settings))
    }

    /// Wrap fully built device objects and views.
    fn from_parts(
        instance: Instance,
        gpu: Gpu,
        shared: Shared,
        views: Vec<View<W, Swapchain>>,
        settings: &RendererSettings,
    ) -> Self {
        let caps = texture::device_caps(&instance, gpu.physical, shared.transfers.has_converter());
        tracing::info!(
            device = %gpu.name,
            id = ?gpu.id,
            max_texture_size = gpu.max_texture_size,
            gpu_converter = caps.gpu_converter,
            "Vulkan renderer ready"
        );
        Self {
            views,
            shared,
            textures: Arena::new(),
            caps,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            present: PresentConfig::new(settings.vsync),
            compression: settings.compression,
            max_picture_res: settings.max_picture_res,
            cycle: None,
            gpu,
            instance,
        }
    }

    /// Rebuild view `index`'s swapchain for its window's current size.
    fn rebuild(&mut self, index: usize) -> Result<()> {
        let view = &mut self.views[index];
        let size = view.window.drawable_size();
        let built = view.present.rebuild(
            &self.instance,
            &self.gpu,
            self.shared.pipelines.render_pass,
            size,
            self.present.vsync(),
        )?;
        if !built {
            tracing::debug!(view = ?view.id, "window has no area, keeping swapchain");
        }
        Ok(())
    }

    /// Rebuild a stale swapchain and return its view to `Idle`.
    fn recover(&mut self, index: usize) -> Result<()> {
        let rebuilt = self.rebuild(index);
        self.views[index].present.state.apply(PresentEvent::Rebuilt)?;
        rebuilt
    }

    fn upload_context(&self) -> UploadContext<'_> {
        UploadContext {
            caps: &self.caps,
            compression: self.compression,
            max_texture_size: self.gpu.max_texture_size,
        }
    }

    /// Create an image for `upload` and queue its contents.
    fn build_texture(&mut self, upload: &Upload<'_>) -> Result<VkTexture> {
        let format = texture::vk_format(upload.plan.layout)
            .ok_or_else(|| RendererError::invalid_image(format!("{:?} has no Vulkan format", upload.plan.layout)))?;
        let extent = vk::Extent2D {
            width: upload.width,
            height: upload.height,
        };
        let mut created = VkTexture::new(
            &self.gpu,
            &mut self.shared.descriptors,
            &self.shared.pipelines,
            extent,
            format,
            upload.filter,
        )?;
        if let Err(err) = self.shared.transfers.upload(&self.gpu, &created.image, upload) {
            created.destroy(&self.gpu.raw);
            return Err(err);
        }
        Ok(created)
    }

    fn create_texture(&mut self, upload: Option<Upload<'_>>) -> Option<Texture> {
        let upload = upload?;
        let created = self
            .build_texture(&upload)
            .map_err(|err| tracing::warn!(%err, "texture creation failed"))
            .ok()?;
        match self.textures.insert(created) {
            Ok(key) => Some(Texture::new(key, upload.width, upload.height)),
            Err(mut created) => {
                tracing::warn!("texture table full");
                self.shared.transfers.wait_all(&self.gpu);
                created.destroy(&self.gpu.raw);
                None
            }
        }
    }

    /// Swap a new image in for `key` once nothing uses the old one.
    fn swap_texture(&mut self, key: Key, upload: &Upload<'_>) -> Result<()> {
        self.gpu.wait_idle();
        let fresh = self.build_texture(upload)?;
        if let Some(slot) = self.textures.get_mut(key) {
            let mut old = std::mem::replace(slot, fresh);
            old.destroy(&self.gpu.raw);
        }
        Ok(())
    }

    /// Index of the view a cycle is running on, checking the closing call's id.
    fn close_cycle(&mut self, id: ViewId, pick: bool) -> Result<Cycle> {
        let index = view::find_view(&self.views, id)?;
        match self.cycle.take() {
            Some(cycle @ (Cycle::Frame { view: i, .. } | Cycle::Skipped(i))) if !pick && i == index => Ok(cycle),
            Some(cycle @ Cycle::Pick { view: i, .. }) if pick && i == index => Ok(cycle),
            other => {
                self.cycle = other;
                Err(RendererError::InvalidState {
                    state: cycle_name(other),
                    event: if pick { "end_pick" } else { "end_frame" },
                })
            }
        }
    }

    /// Record one clipped quad into `cmd`, which must be inside the main
    /// render pass with the quad pipeline bound.
    fn record_quad(
        &self,
        cmd: vk::CommandBuffer,
        uniform: ViewUniform,
        texture: Option<&Texture>,
        (rect, frame): (Rect, Rect),
        color: Color,
    ) {
        let quad = QuadInstance::new(rect, frame, color);
        if quad.is_degenerate() {
            return;
        }
        let set = texture
            .and_then(|t| self.textures.get(t.key()))
            .unwrap_or(&self.shared.blank)
            .set;
        let push = QuadPush { view: uniform, quad };
        let layout = self.shared.pipelines.quad_layout;
        let device = &self.gpu.raw;
        unsafe {
            device.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, layout, 0, &[set], &[]);
            device.cmd_push_constants(cmd, layout, PUSH_STAGES, 0, bytemuck::bytes_of(&push));
            device.cmd_draw(cmd, 4, 1, 0, 0);
        }
    }

    fn ensure_idle(&self, event: &'static str) -> Result<()> {
        match self.cycle {
            None => Ok(()),
            cycle => Err(RendererError::InvalidState {
                state: cycle_name(cycle),
                event,
            }),
        }
    }
}

fn surface_format(instance: &Instance, gpu: &Gpu, surfaces: &[vk::SurfaceKHR]) -> Result<vk::SurfaceFormatKHR> {
    let lists = surfaces
        .iter()
        .map(|&surface| {
            unsafe { instance.surface.get_physical_device_surface_formats(gpu.physical, surface) }
                .map_err(|err| RendererError::api("vkGetPhysicalDeviceSurfaceFormatsKHR", err))
        })
        .collect::<Result<Vec<_>>>()?;
    common_format(&lists).ok_or_else(|| RendererError::surface("views share no surface format"))
}

impl<W: VulkanWindow> Renderer for VulkanRenderer<W> {
    fn views(&self) -> Vec<ViewInfo> {
        self.views.iter().map(View::info).collect()
    }

    fn set_clear_color(&mut self, color: Color) {
        self.clear_color = color;
    }

    fn set_vsync(&mut self, vsync: bool) -> Result<()> {
        self.ensure_idle("set_vsync")?;
        if self.present.set_vsync(vsync) {
            for index in 0..self.views.len() {
                self.rebuild(index)?;
            }
            tracing::debug!(vsync, "swapchains rebuilt for vsync change");
        }
        Ok(())
    }

    fn set_compression(&mut self, compression: Compression) {
        self.compression = compression;
    }

    fn update_view(&mut self, id: ViewId, rect: Option<Rect>) -> Result<()> {
        let index = view::find_view(&self.views, id)?;
        self.ensure_idle("update_view")?;
        let view = &mut self.views[index];
        view.rect = view.resized_rect(rect);
        tracing::debug!(view = ?id, rect = ?view.rect, "view resized");
        let (w, h) = view.window.drawable_size();
        let extent = view.present.extent;
        if (extent.width, extent.height) != (w, h) {
            self.rebuild(index)?;
        }
        Ok(())
    }

    fn begin_frame(&mut self, id: ViewId) -> Result<FrameStatus> {
        let index = view::find_view(&self.views, id)?;
        self.ensure_idle("begin_frame")?;
        let rect = self.views[index].rect;
        let (w, h) = rect.size();
        if w == 0 || h == 0 {
            self.cycle = Some(Cycle::Skipped(index));
            return Ok(FrameStatus::Skipped);
        }

        let view = &mut self.views[index];
        let Some(cmd) = view.present.acquire(&self.gpu)? else {
            tracing::debug!(view = ?id, "swapchain out of date, skipping frame");
            self.recover(index)?;
            self.cycle = Some(Cycle::Skipped(index));
            return Ok(FrameStatus::Skipped);
        };
        view.present
            .begin_pass(&self.gpu, self.shared.pipelines.render_pass, self.clear_color);
        unsafe {
            self.gpu
                .raw
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.shared.pipelines.quad);
        }
        self.cycle = Some(Cycle::Frame {
            view: index,
            cmd,
            uniform: ViewUniform::for_view(rect),
        });
        Ok(FrameStatus::Ready)
    }

    fn draw_rect(&mut self, texture: Option<&Texture>, rect: Rect, frame: Rect, color: Color) {
        let Some(Cycle::Frame { cmd, uniform, .. }) = self.cycle else {
            return;
        };
        self.record_quad(cmd, uniform, texture, (rect, frame), color);
    }

    fn end_frame(&mut self, id: ViewId) -> Result<()> {
        let Cycle::Frame { view: index, .. } = self.close_cycle(id, false)? else {
            return Ok(());
        };
        let stale = self.views[index].present.submit_and_present(&self.gpu)?;
        if stale {
            tracing::debug!(view = ?id, "swapchain stale after present");
            self.recover(index)?;
        }
        Ok(())
    }

    fn begin_pick(&mut self, id: ViewId, point: Point) -> Result<()> {
        let index = view::find_view(&self.views, id)?;
        self.ensure_idle("begin_pick")?;
        self.shared.pick.begin(&self.gpu, &self.shared.pipelines)?;
        self.cycle = Some(Cycle::Pick {
            view: index,
            uniform: ViewUniform::for_pick(point),
        });
        Ok(())
    }

    fn draw_sel_rect(&mut self, widget: WidgetId, rect: Rect, frame: Rect) {
        let Some(Cycle::Pick { uniform, .. }) = self.cycle else {
            return;
        };
        let push = PickPush {
            view: uniform,
            pick: PickInstance::new(widget, rect, frame),
        };
        self.shared.pick.draw(&self.gpu, &self.shared.pipelines, &push);
    }

    fn end_pick(&mut self, id: ViewId) -> Result<Option<WidgetId>> {
        self.close_cycle(id, true)?;
        let halves = self.shared.pick.finish(&self.gpu)?;
        Ok(WidgetId::from_halves(halves))
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
        let key = texture.key();
        let Some(current) = self.textures.get(key) else {
            tracing::warn!("replacing a texture this renderer does not own");
            return false;
        };
        let Some(upload) = upload::plan_image(image, self.upload_context()) else {
            return false;
        };
        let extent = vk::Extent2D {
            width: upload.width,
            height: upload.height,
        };
        let in_place =
            current.image.extent == extent && texture::vk_format(upload.plan.layout) == Some(current.image.format);
        let replaced = if in_place {
            self.shared.transfers.upload(&self.gpu, &current.image, &upload)
        } else {
            self.swap_texture(key, &upload)
        };
        match replaced {
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
        if let Some(mut freed) = self.textures.remove(texture.key()) {
            // Frames in flight may still sample it.
            self.gpu.wait_idle();
            freed.destroy(&self.gpu.raw);
        }
    }

    fn synch_transfers(&mut self) {
        self.shared.transfers.wait_all(&self.gpu);
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            devices: self.instance.device_entries(),
            max_texture_size: self.gpu.max_texture_size,
            compressions: self.caps.compressions(),
            current: self.compression,
        }
    }
}

impl<W: VulkanWindow> Drop for VulkanRenderer<W> {
    fn drop(&mut self) {
        self.gpu.wait_idle();
        for mut texture in self.textures.drain() {
            texture.destroy(&self.gpu.raw);
        }
        for view in self.views.iter_mut().rev() {
            view.present.destroy(&self.instance, &self.gpu);
        }
        self.shared.destroy(&self.gpu);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use raw_window_handle::{DisplayHandle, HandleError, WindowHandle};

    use super::*;
    use crate::identity::IdentityRegistry;
    use crate::types::WHITE;
    use memory::{Buffer, Image};

    const RED: Color = [1.0, 0.0, 0.0, 1.0];
    const TARGET_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
    const SIZE: u32 = 64;

    /// Window type of renderers built without views.
    struct NoWindow;

    impl NativeWindow for NoWindow {
        fn window_id(&self) -> u64 {
            0
        }

        fn drawable_size(&self) -> (u32, u32) {
            (0, 0)
        }
    }

    impl HasWindowHandle for NoWindow {
        fn window_handle(&self) -> std::result::Result<WindowHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    impl HasDisplayHandle for NoWindow {
        fn display_handle(&self) -> std::result::Result<DisplayHandle<'_>, HandleError> {
            Err(HandleError::Unavailable)
        }
    }

    /// Renderer on a surfaceless instance with no views, or `None` without a
    /// Vulkan device.
    fn renderer() -> Option<VulkanRenderer<NoWindow>> {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let instance = match Instance::headless() {
            Ok(instance) => instance,
            Err(err) => {
                tracing::warn!(%err, "no Vulkan loader, skipping GPU scenario");
                return None;
            }
        };
        let gpu = match Gpu::new(&instance, &[], None) {
            Ok(gpu) => gpu,
            Err(RendererError::NoDevice) => {
                tracing::warn!("no Vulkan device available, skipping GPU scenario");
                return None;
            }
            Err(err) => panic!("device creation failed: {err}"),
        };
        let shared = Shared::new(&gpu, TARGET_FORMAT).unwrap();
        Some(VulkanRenderer::from_parts(
            instance,
            gpu,
            shared,
            Vec::new(),
            &RendererSettings::default(),
        ))
    }

    /// A 64×64 image drawn with the main render pass and read back.
    struct Target {
        image: Image,
        framebuffer: vk::Framebuffer,
        readback: Buffer,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
    }

    impl Target {
        fn new(renderer: &VulkanRenderer<NoWindow>) -> Self {
            let gpu = &renderer.gpu;
            let image = Image::new(
                gpu,
                vk::Extent2D {
                    width: SIZE,
                    height: SIZE,
                },
                TARGET_FORMAT,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            )
            .unwrap();
            let attachments = [image.view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(renderer.shared.pipelines.render_pass)
                .attachments(&attachments)
                .width(SIZE)
                .height(SIZE)
                .layers(1);
            let framebuffer = unsafe { gpu.raw.create_framebuffer(&info, None) }.unwrap();
            Self {
                image,
                framebuffer,
                readback: Buffer::new(gpu, u64::from(SIZE * SIZE * 4), vk::BufferUsageFlags::TRANSFER_DST, true)
                    .unwrap(),
                cmd: gpu.command_buffers(1).unwrap()[0],
                fence: gpu.fence(false).unwrap(),
            }
        }

        /// Clear to black, draw `quads` in order and return the RGBA8 pixels.
        fn render(
            &mut self,
            renderer: &VulkanRenderer<NoWindow>,
            quads: &[(Option<&Texture>, Rect, Rect, Color)],
        ) -> Vec<u8> {
            let gpu = &renderer.gpu;
            let device = &gpu.raw;
            let area = vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.image.extent,
            };
            let clear = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            }];
            unsafe {
                device
                    .begin_command_buffer(
                        self.cmd,
                        &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                    )
                    .unwrap();
                let info = vk::RenderPassBeginInfo::default()
                    .render_pass(renderer.shared.pipelines.render_pass)
                    .framebuffer(self.framebuffer)
                    .render_area(area)
                    .clear_values(&clear);
                device.cmd_begin_render_pass(self.cmd, &info, vk::SubpassContents::INLINE);
                device.cmd_set_viewport(
                    self.cmd,
                    0,
                    &[vk::Viewport {
                        x: 0.0,
                        y: 0.0,
                        width: 64.0,
                        height: 64.0,
                        min_depth: 0.0,
                        max_depth: 1.0,
                    }],
                );
                device.cmd_set_scissor(self.cmd, 0, &[area]);
                device.cmd_bind_pipeline(
                    self.cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    renderer.shared.pipelines.quad,
                );
            }
            let uniform = ViewUniform::for_view(Rect::from_size(SIZE, SIZE));
            for &(texture, rect, frame, color) in quads {
                renderer.record_quad(self.cmd, uniform, texture, (rect, frame), color);
            }
            unsafe { device.cmd_end_render_pass(self.cmd) };
            memory::transition(
                device,
                self.cmd,
                self.image.raw,
                (vk::ImageLayout::PRESENT_SRC_KHR, vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
                (
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                    vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                ),
                (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_READ),
            );
            unsafe {
                device.cmd_copy_image_to_buffer(
                    self.cmd,
                    self.image.raw,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.readback.raw,
                    &[memory::image_copy(self.image.extent)],
                );
                let readable = vk::BufferMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::HOST_READ)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(self.readback.raw)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                device.cmd_pipeline_barrier(
                    self.cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[readable],
                    &[],
                );
                device.end_command_buffer(self.cmd).unwrap();
                let cmds = [self.cmd];
                device
                    .queue_submit(gpu.queue, &[vk::SubmitInfo::default().command_buffers(&cmds)], self.fence)
                    .unwrap();
            }
            gpu.wait(self.fence).unwrap();
            unsafe { device.reset_fences(&[self.fence]) }.unwrap();
            self.readback.contents().unwrap().to_vec()
        }

        fn destroy(mut self, gpu: &Gpu) {
            gpu.wait_idle();
            unsafe {
                gpu.raw.destroy_fence(self.fence, None);
                gpu.raw.free_command_buffers(gpu.command_pool, &[self.cmd]);
                gpu.raw.destroy_framebuffer(self.framebuffer, None);
            }
            self.readback.destroy(&gpu.raw);
            self.image.destroy(&gpu.raw);
        }
    }

    fn pixel(pixels: &[u8], x: u32, y: u32) -> [u8; 4] {
        let at = usize::try_from((y * SIZE + x) * 4).unwrap();
        pixels[at..at + 4].try_into().unwrap()
    }

    fn assert_pixel(pixels: &[u8], x: u32, y: u32, expected: [u8; 4]) {
        assert_eq!(pixel(pixels, x, y), expected, "pixel ({x}, {y})");
    }

    /// Three-byte texels encoding their coordinates: `[x * 8, y * 8, 100]`.
    fn coordinate_texels(width: u8, height: u8) -> Vec<u8> {
        let mut data = Vec::with_capacity(usize::from(width) * usize::from(height) * 3);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x * 8, y * 8, 100]);
            }
        }
        data
    }

    fn whole() -> Rect {
        Rect::from_size(SIZE, SIZE)
    }

    /// Run a pick pass at `point` over `widgets`, drawn in order.
    fn pick_at(renderer: &mut VulkanRenderer<NoWindow>, point: Point, widgets: &[(WidgetId, Rect, Rect)]) -> Option<WidgetId> {
        let gpu = &renderer.gpu;
        let pipelines = &renderer.shared.pipelines;
        renderer.shared.pick.begin(gpu, pipelines).unwrap();
        for &(widget, rect, frame) in widgets {
            let push = PickPush {
                view: ViewUniform::for_pick(point),
                pick: PickInstance::new(widget, rect, frame),
            };
            renderer.shared.pick.draw(gpu, pipelines, &push);
        }
        WidgetId::from_halves(renderer.shared.pick.finish(gpu).unwrap())
    }

    #[test]
    fn untextured_rect_covers_only_its_clip() {
        let Some(renderer) = renderer() else { return };
        let mut target = Target::new(&renderer);
        let pixels = target.render(
            &renderer,
            &[(None, Rect::new(8, 8, 32, 32), Rect::new(16, 16, 48, 48), RED)],
        );
        assert_pixel(&pixels, 12, 12, [0, 0, 0, 255]);
        assert_pixel(&pixels, 15, 30, [0, 0, 0, 255]);
        assert_pixel(&pixels, 16, 16, [255, 0, 0, 255]);
        assert_pixel(&pixels, 39, 39, [255, 0, 0, 255]);
        assert_pixel(&pixels, 40, 39, [0, 0, 0, 255]);
        target.destroy(&renderer.gpu);
    }

    #[test]
    fn converter_expands_rgb_and_bgr() {
        let Some(mut renderer) = renderer() else { return };
        assert!(renderer.caps.gpu_converter);
        assert!(renderer.shared.transfers.has_converter());
        // 70 texels: one partly used workgroup.
        let data = coordinate_texels(10, 7);
        let rgb = renderer
            .texture_from_image(&PixelBuffer::new(&data, 10, 7, PixelLayout::Rgb8))
            .unwrap();
        let bgr = renderer
            .texture_from_image(&PixelBuffer::new(&data, 10, 7, PixelLayout::Bgr8))
            .unwrap();
        assert_eq!(rgb.size(), (10, 7));

        let mut target = Target::new(&renderer);
        let pixels = target.render(
            &renderer,
            &[
                (Some(&rgb), Rect::new(0, 0, 10, 7), whole(), WHITE),
                (Some(&bgr), Rect::new(20, 0, 10, 7), whole(), WHITE),
            ],
        );
        assert_pixel(&pixels, 0, 0, [0, 0, 100, 255]);
        assert_pixel(&pixels, 3, 5, [24, 40, 100, 255]);
        assert_pixel(&pixels, 9, 6, [72, 48, 100, 255]);
        assert_pixel(&pixels, 23, 5, [100, 40, 24, 255]);
        assert_pixel(&pixels, 29, 6, [100, 48, 72, 255]);
        assert_pixel(&pixels, 15, 3, [0, 0, 0, 255]);
        target.destroy(&renderer.gpu);
        renderer.free_texture(rgb);
        renderer.free_texture(bgr);
    }

    #[test]
    fn converter_resolves_indexed_texels() {
        let Some(mut renderer) = renderer() else { return };
        let palette = [[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255], [40, 50, 60, 255]];
        let indices: Vec<u8> = (0..15u8).map(|i| i % 4).collect();
        let image = PixelBuffer::new(&indices, 5, 3, PixelLayout::Indexed8).with_palette(&palette);
        let texture = renderer.texture_from_image(&image).unwrap();

        let mut target = Target::new(&renderer);
        let pixels = target.render(&renderer, &[(Some(&texture), Rect::new(0, 0, 5, 3), whole(), WHITE)]);
        for (i, &index) in (0u32..).zip(&indices) {
            assert_pixel(&pixels, i % 5, i / 5, palette[usize::from(index)]);
        }
        target.destroy(&renderer.gpu);
        renderer.free_texture(texture);
    }

    #[test]
    fn converter_splits_dispatches_at_device_limit() {
        let Some(mut renderer) = renderer() else { return };
        // 320 texels need three workgroups, one per dispatch.
        renderer.gpu.max_dispatch = 1;
        let data = coordinate_texels(20, 16);
        let texture = renderer
            .texture_from_image(&PixelBuffer::new(&data, 20, 16, PixelLayout::Rgb8))
            .unwrap();

        let mut target = Target::new(&renderer);
        let pixels = target.render(&renderer, &[(Some(&texture), Rect::new(0, 0, 20, 16), whole(), WHITE)]);
        // First texel of each workgroup, then the last texel.
        for (x, y) in [(0, 0), (8, 6), (16, 12), (19, 15)] {
            let (tx, ty) = (u8::try_from(x).unwrap(), u8::try_from(y).unwrap());
            assert_pixel(&pixels, x, y, [tx * 8, ty * 8, 100, 255]);
        }
        target.destroy(&renderer.gpu);
        renderer.free_texture(texture);
    }

    #[test]
    fn pick_returns_later_widget_and_both_halves() {
        let Some(mut renderer) = renderer() else { return };
        let mut registry = IdentityRegistry::new();
        let below = registry.register("below").unwrap();
        let above = WidgetId::from_halves([3, 5]).unwrap();
        let frame = whole();

        let widgets = [
            (below, Rect::new(0, 0, 40, 40), frame),
            (above, Rect::new(10, 10, 40, 40), frame),
        ];
        assert_eq!(pick_at(&mut renderer, Point::new(20, 20), &widgets), Some(above));
        assert_eq!(pick_at(&mut renderer, Point::new(5, 5), &widgets), Some(below));
        assert_eq!(registry.resolve(below.to_halves()), Some(&"below"));
        assert_eq!(pick_at(&mut renderer, Point::new(60, 60), &widgets), None);
    }

    #[test]
    fn pick_respects_clip_frame() {
        let Some(mut renderer) = renderer() else { return };
        let widget = WidgetId::from_halves([7, 1]).unwrap();
        let clipped = [(widget, Rect::new(0, 0, 40, 40), Rect::new(20, 20, 40, 40))];
        assert_eq!(pick_at(&mut renderer, Point::new(10, 10), &clipped), None);
        assert_eq!(pick_at(&mut renderer, Point::new(25, 25), &clipped), Some(widget));
    }

    #[test]
    fn replace_texture_in_place_and_resized() {
        let Some(mut renderer) = renderer() else { return };
        let red = [255u8, 0, 0, 255].repeat(4);
        let blue = [0u8, 0, 255, 255].repeat(4);
        let green = [0u8, 255, 0, 255].repeat(16);
        let mut texture = renderer
            .texture_from_image(&PixelBuffer::new(&red, 2, 2, PixelLayout::Rgba8))
            .unwrap();
        let key = texture.key();

        assert!(renderer.replace_texture(&mut texture, &PixelBuffer::new(&blue, 2, 2, PixelLayout::Rgba8)));
        assert_eq!(texture.key(), key);
        let mut target = Target::new(&renderer);
        let pixels = target.render(&renderer, &[(Some(&texture), Rect::new(0, 0, 2, 2), whole(), WHITE)]);
        assert_pixel(&pixels, 1, 1, [0, 0, 255, 255]);

        assert!(renderer.replace_texture(&mut texture, &PixelBuffer::new(&green, 8, 2, PixelLayout::Rgba8)));
        assert_eq!(texture.size(), (8, 2));
        assert_eq!(renderer.textures.get(key).unwrap().image.extent.width, 8);
        let pixels = target.render(&renderer, &[(Some(&texture), Rect::new(0, 0, 8, 2), whole(), WHITE)]);
        assert_pixel(&pixels, 7, 1, [0, 255, 0, 255]);

        assert!(!renderer.replace_texture(&mut texture, &PixelBuffer::new(&green[..4], 8, 2, PixelLayout::Rgba8)));
        assert_eq!(texture.size(), (8, 2));
        target.destroy(&renderer.gpu);
        renderer.synch_transfers();
        renderer.free_texture(texture);
        assert!(renderer.textures.get(key).is_none());
        assert!(renderer.textures.is_empty());
    }

    #[test]
    fn freed_texture_draws_blank() {
        let Some(mut renderer) = renderer() else { return };
        let red = [255u8, 0, 0, 255].repeat(4);
        let texture = renderer
            .texture_from_image(&PixelBuffer::new(&red, 2, 2, PixelLayout::Rgba8))
            .unwrap();
        let stale = Texture::new(texture.key(), 2, 2);
        renderer.free_texture(texture);

        let mut target = Target::new(&renderer);
        let pixels = target.render(&renderer, &[(Some(&stale), Rect::new(0, 0, 4, 4), whole(), WHITE)]);
        assert_pixel(&pixels, 2, 2, [255, 255, 255, 255]);
        target.destroy(&renderer.gpu);
    }

    #[test]
    fn device_info_lists_physical_devices() {
        let Some(renderer) = renderer() else { return };
        let info = renderer.device_info();
        assert!(info.devices.iter().any(|entry| entry.id == renderer.gpu.id));
        assert!(info.max_texture_size >= 4096);
        assert_eq!(info.current, Compression::None);
    }

    #[test]
    fn headless_renderer_rejects_unknown_views() {
        let Some(mut renderer) = renderer() else { return };
        assert!(renderer.views().is_empty());
        assert!(matches!(
            renderer.begin_frame(ViewId::Single),
            Err(RendererError::UnknownView(ViewId::Single))
        ));
        assert!(renderer.end_pick(ViewId::Single).is_err());
    }

    fn formats(list: &[vk::Format]) -> Vec<vk::SurfaceFormatKHR> {
        list.iter()
            .map(|&format| vk::SurfaceFormatKHR {
                format,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            })
            .collect()
    }

    #[test]
    fn views_agree_on_a_format() {
        let lists = [
            formats(&[vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM]),
            formats(&[vk::Format::R8G8B8A8_UNORM]),
        ];
        assert_eq!(common_format(&lists).unwrap().format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn single_view_takes_its_preference() {
        let lists = [formats(&[vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_UNORM])];
        assert_eq!(common_format(&lists).unwrap().format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn disjoint_views_have_no_format() {
        let lists = [
            formats(&[vk::Format::B8G8R8A8_UNORM]),
            formats(&[vk::Format::R8G8B8A8_UNORM]),
        ];
        assert!(common_format(&lists).is_none());
        assert!(common_format(&[]).is_none());
    }

    #[test]
    fn cycle_names_follow_the_bracket() {
        assert_eq!(cycle_name(None), "Idle");
        assert_eq!(cycle_name(Some(Cycle::Skipped(0))), "Recording");
        assert_eq!(
            cycle_name(Some(Cycle::Pick {
                view: 0,
                uniform: ViewUniform::for_pick(Point::new(0, 0)),
            })),
            "Picking"
        );
    }
}
