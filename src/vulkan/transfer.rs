//! Texture uploads and the compute format converter.
//!
//! Uploads alternate between [`TRANSFER_SLOTS`] slots. A slot's fence is
//! waited on before its staging memory is reused, so a texture call only
//! blocks when both slots still have work queued. All uploads are submitted
//! to the graphics queue, which orders them before any later frame that
//! samples the texture.
//!
//! Three-byte and indexed sources are expanded to RGBA8 on the GPU: the
//! converter writes an output buffer that is then copied into the image.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::device::Gpu;
use super::memory::{self, Buffer, Image};
use super::pipeline;
use crate::error::{RendererError, Result};
use crate::format::{Conversion, PixelLayout};
use crate::shaders;
use crate::upload::Upload;

/// Independent upload slots.
pub(crate) const TRANSFER_SLOTS: usize = 2;

/// Threads per converter workgroup.
const WORKGROUP_SIZE: u32 = 32;

/// Texels one converter workgroup expands.
pub(crate) const TEXELS_PER_GROUP: u32 = WORKGROUP_SIZE * 4;

/// Smallest staging buffer.
const MIN_STAGING: u64 = 64 * 1024;

/// Palette entries the converter reads.
const PALETTE_LEN: usize = 256;

/// Push constants of the converter.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct ConvertParams {
    /// Texels in the image.
    pub texels: u32,
    /// Source bytes are blue first.
    pub bgr: u32,
    /// First invocation of this dispatch.
    pub offset: u32,
}

/// Buffer sizes and workgroup count of one conversion.
///
/// Both buffers are padded to whole workgroups so the kernels never read or
/// write past them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ConvertSizes {
    pub groups: u32,
    pub input: u64,
    pub output: u64,
}

impl ConvertSizes {
    pub fn new(texels: u32, source: PixelLayout) -> Self {
        let groups = texels.div_ceil(TEXELS_PER_GROUP);
        let padded = u64::from(groups) * u64::from(TEXELS_PER_GROUP);
        Self {
            groups,
            input: padded * u64::from(source.bytes_per_pixel()),
            output: padded * 4,
        }
    }
}

/// Split `groups` workgroups into dispatches of at most `max` groups.
///
/// Yields `(offset, count)` with `offset` in invocations, as the kernels
/// expect it.
pub(crate) fn dispatches(groups: u32, max: u32) -> impl Iterator<Item = (u32, u32)> {
    let max = max.max(1);
    (0..groups)
        .step_by(max as usize)
        .map(move |first| (first * WORKGROUP_SIZE, (groups - first).min(max)))
}

/// Staging capacity for `needed` bytes.
fn grown(needed: u64) -> u64 {
    needed.max(MIN_STAGING).next_power_of_two()
}

/// Compute pipelines of the converter.
struct Converter {
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pool: vk::DescriptorPool,
    rgb: vk::Pipeline,
    indexed: vk::Pipeline,
}

impl Converter {
    fn new(device: &ash::Device) -> Result<Self> {
        let mut converter = Self {
            set_layout: vk::DescriptorSetLayout::null(),
            layout: vk::PipelineLayout::null(),
            pool: vk::DescriptorPool::null(),
            rgb: vk::Pipeline::null(),
            indexed: vk::Pipeline::null(),
        };
        if let Err(err) = converter.build(device) {
            converter.destroy(device);
            return Err(err);
        }
        Ok(converter)
    }

    fn build(&mut self, device: &ash::Device) -> Result<()> {
        let bindings: Vec<_> = (0..3)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        self.set_layout = unsafe {
            device.create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings), None)
        }
        .map_err(|err| RendererError::api("vkCreateDescriptorSetLayout", err))?;

        let push = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: std::mem::size_of::<ConvertParams>() as u32,
        }];
        let set_layouts = [self.set_layout];
        self.layout = unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(&set_layouts)
                    .push_constant_ranges(&push),
                None,
            )
        }
        .map_err(|err| RendererError::api("vkCreatePipelineLayout", err))?;

        let sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 3 * TRANSFER_SLOTS as u32,
        }];
        self.pool = unsafe {
            device.create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default()
                    .max_sets(TRANSFER_SLOTS as u32)
                    .pool_sizes(&sizes),
                None,
            )
        }
        .map_err(|err| RendererError::api("vkCreateDescriptorPool", err))?;

        let module = pipeline::shader_module(device, shaders::VK_CONVERT_WGSL)?;
        let stages = [c"expand_rgb", c"expand_indexed"].map(|entry| {
            vk::ComputePipelineCreateInfo::default()
                .stage(
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(vk::ShaderStageFlags::COMPUTE)
                        .module(module)
                        .name(entry),
                )
                .layout(self.layout)
        });
        let created = unsafe { device.create_compute_pipelines(vk::PipelineCache::null(), &stages, None) };
        unsafe { device.destroy_shader_module(module, None) };
        let pipelines = created.map_err(|(partial, err)| {
            for pipeline in partial {
                unsafe { device.destroy_pipeline(pipeline, None) };
            }
            RendererError::api("vkCreateComputePipelines", err)
        })?;
        self.rgb = pipelines[0];
        self.indexed = pipelines[1];
        Ok(())
    }

    fn allocate_sets(&self, device: &ash::Device) -> Result<Vec<vk::DescriptorSet>> {
        let layouts = [self.set_layout; TRANSFER_SLOTS];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        unsafe { device.allocate_descriptor_sets(&info) }.map_err(|err| RendererError::api("vkAllocateDescriptorSets", err))
    }

    fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_pipeline(self.indexed, None);
            device.destroy_pipeline(self.rgb, None);
            device.destroy_descriptor_pool(self.pool, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Staging memory and synchronization of one upload slot.
struct Slot {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    /// Host-visible source bytes, also the converter's input.
    input: Buffer,
    /// Converter output, device local.
    output: Buffer,
    /// Host-visible palette of indexed sources.
    palette: Buffer,
    /// Converter bindings; null without a converter.
    set: vk::DescriptorSet,
    /// `set` points at the current buffers.
    bound: bool,
}

impl Slot {
    fn destroy(&mut self, gpu: &Gpu) {
        self.input.destroy(&gpu.raw);
        self.output.destroy(&gpu.raw);
        self.palette.destroy(&gpu.raw);
        unsafe {
            gpu.raw.destroy_fence(self.fence, None);
            gpu.raw.free_command_buffers(gpu.command_pool, &[self.cmd]);
        }
    }
}

/// The upload queue.
pub(crate) struct Transfers {
    slots: Vec<Slot>,
    next: usize,
    converter: Option<Converter>,
}

impl Transfers {
    /// Create both slots and, unless it fails to build, the converter.
    ///
    /// A converter failure is logged and leaves conversion to the CPU.
    pub fn new(gpu: &Gpu) -> Result<Self> {
        let mut transfers = Self {
            slots: Vec::with_capacity(TRANSFER_SLOTS),
            next: 0,
            converter: None,
        };
        if let Err(err) = transfers.build(gpu) {
            transfers.destroy(gpu);
            return Err(err);
        }
        Ok(transfers)
    }

    fn build(&mut self, gpu: &Gpu) -> Result<()> {
        for cmd in gpu.command_buffers(TRANSFER_SLOTS as u32)? {
            let fence = match gpu.fence(true) {
                Ok(fence) => fence,
                Err(err) => {
                    unsafe { gpu.raw.free_command_buffers(gpu.command_pool, &[cmd]) };
                    return Err(err);
                }
            };
            self.slots.push(Slot {
                cmd,
                fence,
                input: Buffer::NULL,
                output: Buffer::NULL,
                palette: Buffer::NULL,
                set: vk::DescriptorSet::null(),
                bound: false,
            });
        }

        match Converter::new(&gpu.raw) {
            Ok(mut converter) => {
                let sets = converter.allocate_sets(&gpu.raw).and_then(|sets| {
                    for slot in &mut self.slots {
                        slot.palette = Buffer::new(
                            gpu,
                            (PALETTE_LEN * 4) as u64,
                            vk::BufferUsageFlags::STORAGE_BUFFER,
                            true,
                        )?;
                    }
                    Ok(sets)
                });
                match sets {
                    Ok(sets) => {
                        for (slot, set) in self.slots.iter_mut().zip(sets) {
                            slot.set = set;
                        }
                        self.converter = Some(converter);
                    }
                    Err(err) => {
                        tracing::warn!(%err, "format converter unavailable");
                        converter.destroy(&gpu.raw);
                    }
                }
            }
            Err(err) => tracing::warn!(%err, "format converter unavailable"),
        }
        Ok(())
    }

    /// Whether three-byte and indexed sources can be converted on the GPU.
    pub fn has_converter(&self) -> bool {
        self.converter.is_some()
    }

    /// Queue the upload of `upload` into `image`.
    ///
    /// The image is left in `SHADER_READ_ONLY_OPTIMAL`. Previous contents
    /// are discarded.
    pub fn upload(&mut self, gpu: &Gpu, image: &Image, upload: &Upload<'_>) -> Result<()> {
        let convert = upload.plan.conversion == Conversion::Gpu;
        if convert && self.converter.is_none() {
            return Err(RendererError::invalid_image("GPU conversion requested without a converter"));
        }
        let texels = upload.width * upload.height;
        let sizes = ConvertSizes::new(texels, upload.source);

        let index = self.next;
        self.next = (self.next + 1) % TRANSFER_SLOTS;
        let slot = &mut self.slots[index];
        gpu.wait(slot.fence)?;

        let staged = if convert { sizes.input } else { upload.bytes.len() as u64 };
        if slot.input.size < staged {
            slot.input.destroy(&gpu.raw);
            slot.input = Buffer::new(
                gpu,
                grown(staged),
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::STORAGE_BUFFER,
                true,
            )?;
            slot.bound = false;
        }
        if convert && slot.output.size < sizes.output {
            slot.output.destroy(&gpu.raw);
            slot.output = Buffer::new(
                gpu,
                grown(sizes.output),
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::STORAGE_BUFFER,
                false,
            )?;
            slot.bound = false;
        }
        let contents = slot
            .input
            .contents()
            .ok_or_else(|| RendererError::api("vkMapMemory", "staging buffer not mapped"))?;
        contents[..upload.bytes.len()].copy_from_slice(&upload.bytes);
        if convert {
            if let (Some(palette), Some(words)) = (upload.palette, slot.palette.contents()) {
                words.fill(0);
                let bytes: &[u8] = bytemuck::cast_slice(&palette[..palette.len().min(PALETTE_LEN)]);
                words[..bytes.len()].copy_from_slice(bytes);
            }
            if !slot.bound {
                bind_converter(gpu, slot);
            }
        }

        unsafe { gpu.raw.reset_fences(&[slot.fence]) }.map_err(|err| RendererError::api("vkResetFences", err))?;
        let recorded = record(gpu, slot, self.converter.as_ref().filter(|_| convert), image, upload, sizes);
        if let Err(err) = recorded {
            // The fence was reset but nothing will signal it.
            gpu.wait_idle();
            unsafe { gpu.raw.destroy_fence(slot.fence, None) };
            slot.fence = gpu.fence(true)?;
            return Err(err);
        }
        tracing::trace!(
            width = upload.width,
            height = upload.height,
            layout = ?upload.plan.layout,
            convert,
            slot = index,
            "upload queued"
        );
        Ok(())
    }

    /// Block until every queued upload has completed.
    pub fn wait_all(&self, gpu: &Gpu) {
        let fences: Vec<_> = self.slots.iter().map(|slot| slot.fence).collect();
        if fences.is_empty() {
            return;
        }
        if let Err(err) = unsafe { gpu.raw.wait_for_fences(&fences, true, u64::MAX) } {
            tracing::warn!(%err, "waiting for uploads failed");
        }
    }

    /// Release every slot and the converter. The device must be idle.
    pub fn destroy(&mut self, gpu: &Gpu) {
        for mut slot in self.slots.drain(..) {
            slot.destroy(gpu);
        }
        if let Some(mut converter) = self.converter.take() {
            converter.destroy(&gpu.raw);
        }
    }
}

fn bind_converter(gpu: &Gpu, slot: &mut Slot) {
    let infos = [&slot.input, &slot.output, &slot.palette].map(|buffer| {
        [vk::DescriptorBufferInfo {
            buffer: buffer.raw,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }]
    });
    let writes: Vec<_> = infos
        .iter()
        .zip(0..)
        .map(|(info, binding)| {
            vk::WriteDescriptorSet::default()
                .dst_set(slot.set)
                .dst_binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(info)
        })
        .collect();
    unsafe { gpu.raw.update_descriptor_sets(&writes, &[]) };
    slot.bound = true;
}

/// Record and submit one upload on `slot`.
fn record(
    gpu: &Gpu,
    slot: &Slot,
    converter: Option<&Converter>,
    image: &Image,
    upload: &Upload<'_>,
    sizes: ConvertSizes,
) -> Result<()> {
    let device = &gpu.raw;
    let cmd = slot.cmd;
    unsafe {
        device
            .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            .and_then(|()| {
                device.begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
            })
            .map_err(|err| RendererError::api("vkBeginCommandBuffer", err))?;
    }

    // Earlier frames may still sample the old contents.
    memory::transition(
        device,
        cmd,
        image.raw,
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
        (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::empty()),
        (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
    );

    let source = if let Some(converter) = converter {
        let pipeline = if upload.source == PixelLayout::Indexed8 {
            converter.indexed
        } else {
            converter.rgb
        };
        let bgr = u32::from(upload.source == PixelLayout::Bgr8);
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline);
            device.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::COMPUTE, converter.layout, 0, &[slot.set], &[]);
            for (offset, count) in dispatches(sizes.groups, gpu.max_dispatch) {
                let params = ConvertParams {
                    texels: upload.width * upload.height,
                    bgr,
                    offset,
                };
                device.cmd_push_constants(
                    cmd,
                    converter.layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&params),
                );
                device.cmd_dispatch(cmd, count, 1, 1);
            }
            let written = vk::BufferMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(slot.output.raw)
                .offset(0)
                .size(vk::WHOLE_SIZE);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[written],
                &[],
            );
        }
        slot.output.raw
    } else {
        slot.input.raw
    };

    unsafe {
        device.cmd_copy_buffer_to_image(
            cmd,
            source,
            image.raw,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[memory::image_copy(image.extent)],
        );
    }
    memory::transition(
        device,
        cmd,
        image.raw,
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
        (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
        (vk::PipelineStageFlags::FRAGMENT_SHADER, vk::AccessFlags::SHADER_READ),
    );

    let cmds = [cmd];
    let submit = vk::SubmitInfo::default().command_buffers(&cmds);
    unsafe {
        device
            .end_command_buffer(cmd)
            .and_then(|()| device.queue_submit(gpu.queue, &[submit], slot.fence))
    }
    .map_err(|err| RendererError::api("vkQueueSubmit", err))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn conversion_buffers_cover_whole_workgroups() {
        let sizes = ConvertSizes::new(130, PixelLayout::Rgb8);
        assert_eq!(sizes.groups, 2);
        assert_eq!(sizes.input, 256 * 3);
        assert_eq!(sizes.output, 256 * 4);

        let indexed = ConvertSizes::new(128, PixelLayout::Indexed8);
        assert_eq!(indexed.groups, 1);
        assert_eq!(indexed.input, 128);
    }

    #[test]
    fn input_is_word_aligned() {
        for texels in [1, 3, 5, 127, 129, 1000] {
            assert_eq!(ConvertSizes::new(texels, PixelLayout::Bgr8).input % 4, 0, "{texels}");
        }
    }

    #[test]
    fn dispatches_split_at_device_limit() {
        let chunks: Vec<_> = dispatches(5, 2).collect();
        assert_eq!(chunks, [(0, 2), (64, 2), (128, 1)]);
        assert_eq!(dispatches(3, 65535).collect::<Vec<_>>(), [(0, 3)]);
        assert_eq!(dispatches(0, 16).count(), 0);
    }

    #[test]
    fn params_match_shader_block() {
        assert_eq!(std::mem::size_of::<ConvertParams>(), 12);
    }

    #[test]
    fn staging_grows_in_powers_of_two() {
        assert_eq!(grown(1), MIN_STAGING);
        assert_eq!(grown(MIN_STAGING + 1), MIN_STAGING * 2);
    }
}
