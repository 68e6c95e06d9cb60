//! Render passes, pipelines and samplers of the Vulkan backend.
//!
//! Both passes draw four-vertex strips with every per-draw value in push
//! constants, so neither pipeline has vertex input.

use std::ffi::CStr;

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::error::{RendererError, Result};
use crate::quad::{PickInstance, QuadInstance, ViewUniform};
use crate::shaders;
use crate::upload::Filter;

/// Format of the 1×1 pick target.
pub(crate) const PICK_FORMAT: vk::Format = vk::Format::R32G32_UINT;

/// Stages that read the push constants.
pub(crate) const PUSH_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::VERTEX.as_raw() | vk::ShaderStageFlags::FRAGMENT.as_raw(),
);

/// Push constants of one textured quad.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct QuadPush {
    pub view: ViewUniform,
    pub quad: QuadInstance,
}

/// Push constants of one pick rectangle.
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct PickPush {
    pub view: ViewUniform,
    pub pick: PickInstance,
}

/// Every pipeline object shared by the views.
///
/// All views present the same surface format, so one render pass and one
/// quad pipeline serve them all.
pub(crate) struct Pipelines {
    /// Clears and draws into a swapchain image, leaving it presentable.
    pub render_pass: vk::RenderPass,
    /// Clears and draws into the pick target, leaving it ready for copy.
    pub pick_pass: vk::RenderPass,
    /// Set 0 of the quad pipeline: sampled image and sampler.
    pub texture_layout: vk::DescriptorSetLayout,
    pub quad_layout: vk::PipelineLayout,
    pub pick_layout: vk::PipelineLayout,
    pub quad: vk::Pipeline,
    pub pick: vk::Pipeline,
    linear: vk::Sampler,
    nearest: vk::Sampler,
}

impl Pipelines {
    /// Build every pass and pipeline for swapchains of `format`.
    #[tracing::instrument(skip(device))]
    pub fn new(device: &ash::Device, format: vk::Format) -> Result<Self> {
        let mut pipelines = Self {
            render_pass: vk::RenderPass::null(),
            pick_pass: vk::RenderPass::null(),
            texture_layout: vk::DescriptorSetLayout::null(),
            quad_layout: vk::PipelineLayout::null(),
            pick_layout: vk::PipelineLayout::null(),
            quad: vk::Pipeline::null(),
            pick: vk::Pipeline::null(),
            linear: vk::Sampler::null(),
            nearest: vk::Sampler::null(),
        };
        if let Err(err) = pipelines.build(device, format) {
            pipelines.destroy(device);
            return Err(err);
        }
        Ok(pipelines)
    }

    fn build(&mut self, device: &ash::Device, format: vk::Format) -> Result<()> {
        self.render_pass = render_pass(device, format, vk::ImageLayout::PRESENT_SRC_KHR)?;
        self.pick_pass = render_pass(device, PICK_FORMAT, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;

        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
        ];
        self.texture_layout = unsafe {
            device.create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings), None)
        }
        .map_err(|err| RendererError::api("vkCreateDescriptorSetLayout", err))?;

        self.quad_layout = pipeline_layout(device, &[self.texture_layout], size_of_push::<QuadPush>())?;
        self.pick_layout = pipeline_layout(device, &[], size_of_push::<PickPush>())?;

        let blend = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        self.quad = graphics_pipeline(device, shaders::VK_QUAD_WGSL, self.quad_layout, self.render_pass, blend)?;

        let overwrite = vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::R | vk::ColorComponentFlags::G);
        self.pick = graphics_pipeline(device, shaders::VK_PICK_WGSL, self.pick_layout, self.pick_pass, overwrite)?;

        self.linear = sampler(device, vk::Filter::LINEAR)?;
        self.nearest = sampler(device, vk::Filter::NEAREST)?;
        Ok(())
    }

    pub fn sampler(&self, filter: Filter) -> vk::Sampler {
        match filter {
            Filter::Linear => self.linear,
            Filter::Nearest => self.nearest,
        }
    }

    /// Destroy everything; handles never created are null and skipped by
    /// the driver.
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_sampler(self.nearest, None);
            device.destroy_sampler(self.linear, None);
            device.destroy_pipeline(self.pick, None);
            device.destroy_pipeline(self.quad, None);
            device.destroy_pipeline_layout(self.pick_layout, None);
            device.destroy_pipeline_layout(self.quad_layout, None);
            device.destroy_descriptor_set_layout(self.texture_layout, None);
            device.destroy_render_pass(self.pick_pass, None);
            device.destroy_render_pass(self.render_pass, None);
        }
    }
}

fn size_of_push<T>() -> u32 {
    u32::try_from(std::mem::size_of::<T>()).unwrap_or(u32::MAX)
}

/// A single-subpass pass that clears its only attachment and leaves it in
/// `final_layout`.
fn render_pass(device: &ash::Device, format: vk::Format, final_layout: vk::ImageLayout) -> Result<vk::RenderPass> {
    let attachments = [vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(final_layout)];
    let color = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color)];
    let dependencies = [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::TRANSFER)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_READ),
    ];
    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.create_render_pass(&info, None) }.map_err(|err| RendererError::api("vkCreateRenderPass", err))
}

fn pipeline_layout(device: &ash::Device, sets: &[vk::DescriptorSetLayout], push_size: u32) -> Result<vk::PipelineLayout> {
    let ranges = [vk::PushConstantRange {
        stage_flags: PUSH_STAGES,
        offset: 0,
        size: push_size,
    }];
    let info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(sets)
        .push_constant_ranges(&ranges);
    unsafe { device.create_pipeline_layout(&info, None) }.map_err(|err| RendererError::api("vkCreatePipelineLayout", err))
}

/// Compile WGSL to a shader module.
pub(crate) fn shader_module(device: &ash::Device, wgsl: &str) -> Result<vk::ShaderModule> {
    let words = shaders::wgsl_to_spirv(wgsl)?;
    let info = vk::ShaderModuleCreateInfo::default().code(&words);
    unsafe { device.create_shader_module(&info, None) }.map_err(|err| RendererError::api("vkCreateShaderModule", err))
}

const VS_MAIN: &CStr = c"vs_main";
const FS_MAIN: &CStr = c"fs_main";

fn graphics_pipeline(
    device: &ash::Device,
    wgsl: &str,
    layout: vk::PipelineLayout,
    render_pass: vk::RenderPass,
    attachment: vk::PipelineColorBlendAttachmentState,
) -> Result<vk::Pipeline> {
    let module = shader_module(device, wgsl)?;
    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(module)
            .name(VS_MAIN),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(module)
            .name(FS_MAIN),
    ];
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(vk::PrimitiveTopology::TRIANGLE_STRIP);
    let viewport = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let attachments = [attachment];
    let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
    let dynamic = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic);

    let info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);
    let result = unsafe { device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None) };
    unsafe { device.destroy_shader_module(module, None) };
    result
        .map(|pipelines| pipelines[0])
        .map_err(|(_, err)| RendererError::api("vkCreateGraphicsPipelines", err))
}

fn sampler(device: &ash::Device, filter: vk::Filter) -> Result<vk::Sampler> {
    let info = vk::SamplerCreateInfo::default()
        .mag_filter(filter)
        .min_filter(filter)
        .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
        .max_lod(0.0);
    unsafe { device.create_sampler(&info, None) }.map_err(|err| RendererError::api("vkCreateSampler", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_blocks_fit_guaranteed_limit() {
        // 128 bytes is the minimum maxPushConstantsSize.
        assert_eq!(size_of_push::<QuadPush>(), 64);
        assert_eq!(size_of_push::<PickPush>(), 48);
    }

    #[test]
    fn push_stages_cover_both_shaders() {
        assert!(PUSH_STAGES.contains(vk::ShaderStageFlags::VERTEX));
        assert!(PUSH_STAGES.contains(vk::ShaderStageFlags::FRAGMENT));
    }
}
