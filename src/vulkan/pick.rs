//! The 1×1 integer target of the pick pass and its readback.

use ash::vk;

use super::device::Gpu;
use super::memory::{self, Buffer, Image};
use super::pipeline::{Pipelines, PickPush, PICK_FORMAT, PUSH_STAGES};
use crate::error::{RendererError, Result};

const EXTENT: vk::Extent2D = vk::Extent2D { width: 1, height: 1 };

/// Pick target, framebuffer and readback buffer.
pub(crate) struct PickTarget {
    image: Image,
    framebuffer: vk::Framebuffer,
    readback: Buffer,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

impl PickTarget {
    pub fn new(gpu: &Gpu, pipelines: &Pipelines) -> Result<Self> {
        let mut target = Self {
            image: Image::new(
                gpu,
                EXTENT,
                PICK_FORMAT,
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            )?,
            framebuffer: vk::Framebuffer::null(),
            readback: Buffer::NULL,
            cmd: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
        };
        if let Err(err) = target.build(gpu, pipelines) {
            target.destroy(gpu);
            return Err(err);
        }
        Ok(target)
    }

    fn build(&mut self, gpu: &Gpu, pipelines: &Pipelines) -> Result<()> {
        let attachments = [self.image.view];
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(pipelines.pick_pass)
            .attachments(&attachments)
            .width(1)
            .height(1)
            .layers(1);
        self.framebuffer = unsafe { gpu.raw.create_framebuffer(&info, None) }
            .map_err(|err| RendererError::api("vkCreateFramebuffer", err))?;
        self.readback = Buffer::new(gpu, 8, vk::BufferUsageFlags::TRANSFER_DST, true)?;
        self.fence = gpu.fence(false)?;
        let mut cmds = gpu.command_buffers(1)?;
        self.cmd = cmds.pop().unwrap_or_default();
        Ok(())
    }

    /// Begin recording a pick pass cleared to the zero token.
    pub fn begin(&self, gpu: &Gpu, pipelines: &Pipelines) -> Result<()> {
        let device = &gpu.raw;
        unsafe {
            device
                .reset_command_buffer(self.cmd, vk::CommandBufferResetFlags::empty())
                .and_then(|()| {
                    device.begin_command_buffer(
                        self.cmd,
                        &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                    )
                })
                .map_err(|err| RendererError::api("vkBeginCommandBuffer", err))?;

            let area = vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: EXTENT,
            };
            let clear = [vk::ClearValue {
                color: vk::ClearColorValue { uint32: [0; 4] },
            }];
            let info = vk::RenderPassBeginInfo::default()
                .render_pass(pipelines.pick_pass)
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
                    width: 1.0,
                    height: 1.0,
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            device.cmd_set_scissor(self.cmd, 0, &[area]);
            device.cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, pipelines.pick);
        }
        Ok(())
    }

    pub fn draw(&self, gpu: &Gpu, pipelines: &Pipelines, push: &PickPush) {
        unsafe {
            gpu.raw
                .cmd_push_constants(self.cmd, pipelines.pick_layout, PUSH_STAGES, 0, bytemuck::bytes_of(push));
            gpu.raw.cmd_draw(self.cmd, 4, 1, 0, 0);
        }
    }

    /// End the pass, copy the texel to the host and wait for it.
    pub fn finish(&mut self, gpu: &Gpu) -> Result<[u32; 2]> {
        let device = &gpu.raw;
        unsafe {
            device.cmd_end_render_pass(self.cmd);
            device.cmd_copy_image_to_buffer(
                self.cmd,
                self.image.raw,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.readback.raw,
                &[memory::image_copy(EXTENT)],
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
            let cmds = [self.cmd];
            device
                .end_command_buffer(self.cmd)
                .and_then(|()| device.queue_submit(gpu.queue, &[vk::SubmitInfo::default().command_buffers(&cmds)], self.fence))
                .map_err(|err| RendererError::api("vkQueueSubmit", err))?;
        }
        gpu.wait(self.fence)?;
        unsafe { device.reset_fences(&[self.fence]) }.map_err(|err| RendererError::api("vkResetFences", err))?;

        let bytes = self
            .readback
            .contents()
            .ok_or_else(|| RendererError::api("vkMapMemory", "readback buffer not mapped"))?;
        let mut texel = [0u8; 8];
        texel.copy_from_slice(&bytes[..8]);
        Ok(bytemuck::cast(texel))
    }

    pub fn destroy(&mut self, gpu: &Gpu) {
        unsafe {
            if self.cmd != vk::CommandBuffer::null() {
                gpu.raw.free_command_buffers(gpu.command_pool, &[self.cmd]);
            }
            gpu.raw.destroy_fence(self.fence, None);
            gpu.raw.destroy_framebuffer(self.framebuffer, None);
        }
        self.readback.destroy(&gpu.raw);
        self.image.destroy(&gpu.raw);
    }
}
