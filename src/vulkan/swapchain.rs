//! Per-view swapchains and the frame-in-flight ring.
//!
//! Each view records into one of [`FRAMES_IN_FLIGHT`] command buffers and
//! drives its [`PresentState`] through acquire, record, submit and present.
//! An out-of-date or suboptimal swapchain moves the state to `Recreating`;
//! the renderer rebuilds the chain and reports `Rebuilt`.

use ash::vk;

use super::device::{Gpu, Instance};
use super::memory;
use crate::error::{RendererError, Result};
use crate::present::{choose_present_mode, PresentEvent, PresentMode, PresentState};
use crate::types::Color;

/// Frames a view may have queued at once.
pub(crate) const FRAMES_IN_FLIGHT: u32 = 2;

/// What the host knows about a frame slot's fence.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FenceState {
    /// Signalled, or owned by a submission that will signal it.
    Waitable,
    /// Reset with no submission behind it; waiting would never return.
    Orphaned,
}

impl FenceState {
    /// State after resetting the fence and attempting the submit.
    fn after_submit(accepted: bool) -> Self {
        if accepted {
            Self::Waitable
        } else {
            Self::Orphaned
        }
    }
}

/// Synchronization of one frame slot.
struct FrameSync {
    cmd: vk::CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    fence: FenceState,
    /// `image_available` has a signal no submit consumed.
    acquired: bool,
}

impl FrameSync {
    /// Whether the slot needs fresh sync objects before it can be reused.
    fn needs_recovery(&self) -> bool {
        self.fence == FenceState::Orphaned || self.acquired
    }

    /// Replace an orphaned fence and a signalled semaphore after a failed
    /// frame.
    fn recover(&mut self, gpu: &Gpu) -> Result<()> {
        gpu.wait_idle();
        if self.fence == FenceState::Orphaned {
            unsafe { gpu.raw.destroy_fence(self.in_flight, None) };
            self.in_flight = vk::Fence::null();
            self.in_flight = gpu.fence(true)?;
            self.fence = FenceState::Waitable;
        }
        if self.acquired {
            unsafe { gpu.raw.destroy_semaphore(self.image_available, None) };
            self.image_available = vk::Semaphore::null();
            self.image_available = gpu.semaphore()?;
            self.acquired = false;
        }
        tracing::debug!("frame slot recovered after a failed submit");
        Ok(())
    }
}

/// Surface format preference: 8-bit UNORM, BGRA first, sRGB color space.
pub(crate) fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM]
        .into_iter()
        .find_map(|wanted| {
            formats
                .iter()
                .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        })
        .or_else(|| formats.first())
        .copied()
}

/// Swap extent for a window of `size` pixels.
///
/// The surface's current extent wins when it reports one; otherwise `size`
/// is clamped to the supported range.
pub(crate) fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, (width, height): (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One image more than the minimum, within the maximum when there is one.
pub(crate) fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

fn composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&flag| supported.contains(flag))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

pub(crate) fn from_vk_mode(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => Some(PresentMode::Immediate),
        vk::PresentModeKHR::MAILBOX => Some(PresentMode::Mailbox),
        vk::PresentModeKHR::FIFO_RELAXED => Some(PresentMode::FifoRelaxed),
        vk::PresentModeKHR::FIFO => Some(PresentMode::Fifo),
        _ => None,
    }
}

pub(crate) fn to_vk_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
    }
}

/// A view's surface, swapchain, framebuffers and frame ring.
pub(crate) struct Swapchain {
    surface: vk::SurfaceKHR,
    format: vk::SurfaceFormatKHR,
    raw: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    frames: Vec<FrameSync>,
    frame: usize,
    image_index: u32,
    pub state: PresentState,
}

impl Swapchain {
    /// Take ownership of `surface` and build a swapchain for it.
    ///
    /// On failure the device objects are released and the surface is
    /// destroyed.
    pub fn new(
        instance: &Instance,
        gpu: &Gpu,
        surface: vk::SurfaceKHR,
        format: vk::SurfaceFormatKHR,
        render_pass: vk::RenderPass,
        size: (u32, u32),
        vsync: bool,
    ) -> Result<Self> {
        let mut chain = Self {
            surface,
            format,
            raw: vk::SwapchainKHR::null(),
            extent: vk::Extent2D::default(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            frames: Vec::with_capacity(FRAMES_IN_FLIGHT as usize),
            frame: 0,
            image_index: 0,
            state: PresentState::Idle,
        };
        let built = chain
            .create_frames(gpu)
            .and_then(|()| chain.create_chain(instance, gpu, render_pass, size, vsync));
        if let Err(err) = built {
            chain.destroy(instance, gpu);
            return Err(err);
        }
        Ok(chain)
    }

    fn create_frames(&mut self, gpu: &Gpu) -> Result<()> {
        for cmd in gpu.command_buffers(FRAMES_IN_FLIGHT)? {
            self.frames.push(FrameSync {
                cmd,
                image_available: vk::Semaphore::null(),
                render_finished: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
                fence: FenceState::Waitable,
                acquired: false,
            });
        }
        for sync in &mut self.frames {
            sync.image_available = gpu.semaphore()?;
            sync.render_finished = gpu.semaphore()?;
            sync.in_flight = gpu.fence(true)?;
        }
        Ok(())
    }

    /// (Re)create the swapchain for the surface's current state.
    ///
    /// Returns `false` and keeps the old chain when the surface has no area.
    fn create_chain(
        &mut self,
        instance: &Instance,
        gpu: &Gpu,
        render_pass: vk::RenderPass,
        size: (u32, u32),
        vsync: bool,
    ) -> Result<bool> {
        let caps = unsafe {
            instance
                .surface
                .get_physical_device_surface_capabilities(gpu.physical, self.surface)
        }
        .map_err(|err| RendererError::api("vkGetPhysicalDeviceSurfaceCapabilitiesKHR", err))?;
        let extent = choose_extent(&caps, size);
        if extent.width == 0 || extent.height == 0 {
            return Ok(false);
        }
        let modes: Vec<PresentMode> = unsafe {
            instance
                .surface
                .get_physical_device_surface_present_modes(gpu.physical, self.surface)
        }
        .map_err(|err| RendererError::api("vkGetPhysicalDeviceSurfacePresentModesKHR", err))?
        .into_iter()
        .filter_map(from_vk_mode)
        .collect();
        let present_mode = to_vk_mode(choose_present_mode(vsync, &modes));

        let old = self.raw;
        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count(&caps))
            .image_format(self.format.format)
            .image_color_space(self.format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(composite_alpha(caps.supported_composite_alpha))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);
        let raw = unsafe { gpu.swapchain.create_swapchain(&info, None) }
            .map_err(|err| RendererError::api("vkCreateSwapchainKHR", err))?;

        self.release_images(gpu);
        unsafe { gpu.swapchain.destroy_swapchain(old, None) };
        self.raw = raw;
        self.extent = extent;

        let images = unsafe { gpu.swapchain.get_swapchain_images(raw) }
            .map_err(|err| RendererError::api("vkGetSwapchainImagesKHR", err))?;
        for image in images {
            let view = memory::create_view(&gpu.raw, image, self.format.format)?;
            self.image_views.push(view);
            let attachments = [view];
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = unsafe { gpu.raw.create_framebuffer(&info, None) }
                .map_err(|err| RendererError::api("vkCreateFramebuffer", err))?;
            self.framebuffers.push(framebuffer);
        }
        tracing::debug!(
            width = extent.width,
            height = extent.height,
            mode = ?present_mode,
            images = self.image_views.len(),
            "swapchain built"
        );
        Ok(true)
    }

    /// Rebuild after staleness, resize or a vsync change.
    ///
    /// Waits for the device to go idle so no frame still uses the old images.
    pub fn rebuild(
        &mut self,
        instance: &Instance,
        gpu: &Gpu,
        render_pass: vk::RenderPass,
        size: (u32, u32),
        vsync: bool,
    ) -> Result<bool> {
        gpu.wait_idle();
        self.create_chain(instance, gpu, render_pass, size, vsync)
    }

    /// Wait for the current slot, acquire an image and begin recording.
    ///
    /// `None` means the swapchain is stale; the state is then `Recreating`.
    /// The slot's fence is left signalled until the frame is submitted.
    pub fn acquire(&mut self, gpu: &Gpu) -> Result<Option<vk::CommandBuffer>> {
        self.state.apply(PresentEvent::Acquire)?;
        let sync = &mut self.frames[self.frame];
        let ready = if sync.needs_recovery() {
            sync.recover(gpu)
        } else {
            gpu.wait(sync.in_flight)
        };
        if let Err(err) = ready {
            self.state = PresentState::Idle;
            return Err(err);
        }
        let acquired = unsafe {
            gpu.swapchain
                .acquire_next_image(self.raw, u64::MAX, sync.image_available, vk::Fence::null())
        };
        match acquired {
            Ok((index, _)) => {
                self.image_index = index;
                sync.acquired = true;
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.state.apply(PresentEvent::Stale)?;
                return Ok(None);
            }
            Err(err) => {
                self.state = PresentState::Idle;
                return Err(RendererError::api("vkAcquireNextImageKHR", err));
            }
        }

        let begun = unsafe {
            gpu.raw
                .reset_command_buffer(sync.cmd, vk::CommandBufferResetFlags::empty())
                .and_then(|()| {
                    gpu.raw.begin_command_buffer(
                        sync.cmd,
                        &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                    )
                })
        };
        if let Err(err) = begun {
            self.state = PresentState::Idle;
            return Err(RendererError::api("vkBeginCommandBuffer", err));
        }
        self.state.apply(PresentEvent::Acquired)?;
        Ok(Some(sync.cmd))
    }

    /// Begin the render pass on the acquired image with full-target
    /// viewport and scissor.
    pub fn begin_pass(&self, gpu: &Gpu, render_pass: vk::RenderPass, clear: Color) {
        let cmd = self.frames[self.frame].cmd;
        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: self.extent,
        };
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue { float32: clear },
        }];
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(self.framebuffers[self.image_index as usize])
            .render_area(area)
            .clear_values(&clear_values);
        #[expect(clippy::cast_precision_loss)]
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.extent.width as f32,
            height: self.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            gpu.raw.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
            gpu.raw.cmd_set_viewport(cmd, 0, &[viewport]);
            gpu.raw.cmd_set_scissor(cmd, 0, &[area]);
        }
    }

    /// End recording, submit and present.
    ///
    /// Returns `true` when the swapchain went stale and must be rebuilt.
    pub fn submit_and_present(&mut self, gpu: &Gpu) -> Result<bool> {
        let sync = &mut self.frames[self.frame];
        let ended = unsafe {
            gpu.raw.cmd_end_render_pass(sync.cmd);
            gpu.raw.end_command_buffer(sync.cmd)
        };
        if let Err(err) = ended {
            self.state = PresentState::Idle;
            return Err(RendererError::api("vkEndCommandBuffer", err));
        }
        if let Err(err) = unsafe { gpu.raw.reset_fences(&[sync.in_flight]) } {
            self.state = PresentState::Idle;
            return Err(RendererError::api("vkResetFences", err));
        }
        let wait = [sync.image_available];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmds = [sync.cmd];
        let signal = [sync.render_finished];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal);
        let submitted = unsafe { gpu.raw.queue_submit(gpu.queue, &[submit], sync.in_flight) };
        sync.fence = FenceState::after_submit(submitted.is_ok());
        if let Err(err) = submitted {
            self.state = PresentState::Idle;
            // Nothing will signal the fence; a failed recovery is retried on
            // the next acquire.
            if let Err(recovery) = sync.recover(gpu) {
                tracing::warn!(%recovery, "frame slot recovery failed");
            }
            return Err(RendererError::api("vkQueueSubmit", err));
        }
        sync.acquired = false;
        self.state.apply(PresentEvent::Submit)?;

        let chains = [self.raw];
        let indices = [self.image_index];
        let present = vk::PresentInfoKHR::default()
            .wait_semaphores(&signal)
            .swapchains(&chains)
            .image_indices(&indices);
        let presented = unsafe { gpu.swapchain.queue_present(gpu.queue, &present) };
        self.state.apply(PresentEvent::Present)?;
        self.frame = (self.frame + 1) % FRAMES_IN_FLIGHT as usize;
        match presented {
            Ok(false) => {
                self.state.apply(PresentEvent::Presented)?;
                Ok(false)
            }
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.state.apply(PresentEvent::Stale)?;
                Ok(true)
            }
            Err(err) => {
                self.state = PresentState::Idle;
                Err(RendererError::api("vkQueuePresentKHR", err))
            }
        }
    }

    fn release_images(&mut self, gpu: &Gpu) {
        unsafe {
            for framebuffer in self.framebuffers.drain(..) {
                gpu.raw.destroy_framebuffer(framebuffer, None);
            }
            for view in self.image_views.drain(..) {
                gpu.raw.destroy_image_view(view, None);
            }
        }
    }

    /// Destroy everything including the surface. The device must be idle.
    pub fn destroy(&mut self, instance: &Instance, gpu: &Gpu) {
        self.release_images(gpu);
        unsafe {
            for sync in self.frames.drain(..) {
                gpu.raw.destroy_fence(sync.in_flight, None);
                gpu.raw.destroy_semaphore(sync.render_finished, None);
                gpu.raw.destroy_semaphore(sync.image_available, None);
                gpu.raw.free_command_buffers(gpu.command_pool, &[sync.cmd]);
            }
            gpu.swapchain.destroy_swapchain(self.raw, None);
            instance.surface.destroy_surface(self.surface, None);
        }
        self.raw = vk::SwapchainKHR::null();
        self.surface = vk::SurfaceKHR::null();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn bgra_unorm_is_preferred() {
        let formats = [
            format(vk::Format::B8G8R8A8_SRGB),
            format(vk::Format::R8G8B8A8_UNORM),
            format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(
            choose_surface_format(&formats[..2]).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert_eq!(
            choose_surface_format(&formats[..1]).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn surface_extent_overrides_window_size() {
        assert_eq!(
            choose_extent(&caps((640, 480), 2, 3), (800, 600)),
            vk::Extent2D {
                width: 640,
                height: 480
            }
        );
        assert_eq!(
            choose_extent(&caps((u32::MAX, u32::MAX), 2, 3), (9000, 600)),
            vk::Extent2D {
                width: 4096,
                height: 600
            }
        );
    }

    #[test]
    fn image_count_respects_maximum() {
        assert_eq!(image_count(&caps((1, 1), 2, 0)), 3);
        assert_eq!(image_count(&caps((1, 1), 2, 2)), 2);
    }

    #[test]
    fn present_modes_round_trip_through_vulkan() {
        for mode in [
            PresentMode::Immediate,
            PresentMode::Mailbox,
            PresentMode::FifoRelaxed,
            PresentMode::Fifo,
        ] {
            assert_eq!(from_vk_mode(to_vk_mode(mode)), Some(mode));
        }
        assert_eq!(from_vk_mode(vk::PresentModeKHR::SHARED_DEMAND_REFRESH), None);
    }

    fn slot(fence: FenceState, acquired: bool) -> FrameSync {
        FrameSync {
            cmd: vk::CommandBuffer::null(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
            fence,
            acquired,
        }
    }

    #[test]
    fn rejected_submit_orphans_the_fence() {
        assert_eq!(FenceState::after_submit(true), FenceState::Waitable);
        assert_eq!(FenceState::after_submit(false), FenceState::Orphaned);
    }

    #[test]
    fn failed_frames_are_recovered_before_waiting() {
        // Submitted normally: wait on the fence.
        assert!(!slot(FenceState::after_submit(true), false).needs_recovery());
        // Submit rejected after the reset: the fence would never signal.
        assert!(slot(FenceState::after_submit(false), true).needs_recovery());
        // Recording failed after acquire: the fence is intact but the
        // semaphore still holds the acquire's signal.
        assert!(slot(FenceState::Waitable, true).needs_recovery());
    }

    #[test]
    fn opaque_alpha_preferred() {
        let all = vk::CompositeAlphaFlagsKHR::OPAQUE | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED;
        assert_eq!(composite_alpha(all), vk::CompositeAlphaFlagsKHR::OPAQUE);
        assert_eq!(
            composite_alpha(vk::CompositeAlphaFlagsKHR::INHERIT),
            vk::CompositeAlphaFlagsKHR::INHERIT
        );
    }
}
