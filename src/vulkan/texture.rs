//! Texture images, their descriptor sets and the device format table.

use ash::vk;

use super::device::{Gpu, Instance};
use super::memory::Image;
use super::pipeline::Pipelines;
use crate::error::{RendererError, Result};
use crate::format::{FormatCaps, PixelLayout};
use crate::upload::Filter;

/// Descriptor sets per pool.
const SETS_PER_POOL: u32 = 128;

/// Vulkan format holding texels of `layout` unchanged, if there is one.
///
/// Packed layouts name their channels from the most significant bit, which
/// is Vulkan's `PACK16` order.
pub(crate) fn vk_format(layout: PixelLayout) -> Option<vk::Format> {
    Some(match layout {
        PixelLayout::Rgba8 => vk::Format::R8G8B8A8_UNORM,
        PixelLayout::Bgra8 => vk::Format::B8G8R8A8_UNORM,
        PixelLayout::Rgba5551 => vk::Format::R5G5B5A1_UNORM_PACK16,
        PixelLayout::Bgra5551 => vk::Format::B5G5R5A1_UNORM_PACK16,
        PixelLayout::Rgb565 => vk::Format::R5G6B5_UNORM_PACK16,
        PixelLayout::Bgr565 => vk::Format::B5G6R5_UNORM_PACK16,
        PixelLayout::Rgba4444 => vk::Format::R4G4B4A4_UNORM_PACK16,
        PixelLayout::Rgb10a2 => vk::Format::A2B10G10R10_UNORM_PACK32,
        PixelLayout::Rgb8 | PixelLayout::Bgr8 | PixelLayout::Gray8 | PixelLayout::Indexed8 => return None,
    })
}

/// Features a texture format needs with optimal tiling.
fn required_features() -> vk::FormatFeatureFlags {
    vk::FormatFeatureFlags::SAMPLED_IMAGE
        | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
        | vk::FormatFeatureFlags::TRANSFER_DST
}

/// Layouts `physical` samples natively.
pub(crate) fn device_caps(instance: &Instance, physical: vk::PhysicalDevice, gpu_converter: bool) -> FormatCaps {
    let supported = PixelLayout::ALL.into_iter().filter(|&layout| {
        vk_format(layout).is_some_and(|format| {
            let props = unsafe { instance.raw.get_physical_device_format_properties(physical, format) };
            props.optimal_tiling_features.contains(required_features())
        })
    });
    let mut caps = FormatCaps::from_layouts(supported);
    caps.gpu_converter = gpu_converter;
    caps
}

/// Growable set of descriptor pools for texture sets.
///
/// Sets are freed individually; when every pool is exhausted or fragmented a
/// new one is added.
#[derive(Default)]
pub(crate) struct DescriptorPools {
    pools: Vec<vk::DescriptorPool>,
}

impl DescriptorPools {
    /// Allocate one set of `layout`, returning it with its pool.
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<(vk::DescriptorPool, vk::DescriptorSet)> {
        for &pool in self.pools.iter().rev() {
            match allocate_set(device, pool, layout) {
                Ok(set) => return Ok((pool, set)),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {}
                Err(err) => return Err(RendererError::api("vkAllocateDescriptorSets", err)),
            }
        }
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: SETS_PER_POOL,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: SETS_PER_POOL,
            },
        ];
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&sizes);
        let pool = unsafe { device.create_descriptor_pool(&info, None) }
            .map_err(|err| RendererError::api("vkCreateDescriptorPool", err))?;
        self.pools.push(pool);
        tracing::debug!(pools = self.pools.len(), "descriptor pool added");
        allocate_set(device, pool, layout)
            .map(|set| (pool, set))
            .map_err(|err| RendererError::api("vkAllocateDescriptorSets", err))
    }

    pub fn free(device: &ash::Device, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
        if let Err(err) = unsafe { device.free_descriptor_sets(pool, &[set]) } {
            tracing::warn!(%err, "vkFreeDescriptorSets failed");
        }
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for pool in self.pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
    }
}

fn allocate_set(
    device: &ash::Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> std::result::Result<vk::DescriptorSet, vk::Result> {
    let layouts = [layout];
    let info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    unsafe { device.allocate_descriptor_sets(&info) }.map(|sets| sets[0])
}

/// A sampled image bound to its own descriptor set.
pub(crate) struct VkTexture {
    pub image: Image,
    pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
}

impl VkTexture {
    /// Create an uninitialized image of `extent` and bind it for sampling.
    ///
    /// The contents are undefined until a transfer fills them.
    pub fn new(
        gpu: &Gpu,
        pools: &mut DescriptorPools,
        pipelines: &Pipelines,
        extent: vk::Extent2D,
        format: vk::Format,
        filter: Filter,
    ) -> Result<Self> {
        let mut image = Image::new(
            gpu,
            extent,
            format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let (pool, set) = match pools.allocate(&gpu.raw, pipelines.texture_layout) {
            Ok(allocated) => allocated,
            Err(err) => {
                image.destroy(&gpu.raw);
                return Err(err);
            }
        };

        let image_info = [vk::DescriptorImageInfo::default()
            .image_view(image.view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let sampler_info = [vk::DescriptorImageInfo::default().sampler(pipelines.sampler(filter))];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&image_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(&sampler_info),
        ];
        unsafe { gpu.raw.update_descriptor_sets(&writes, &[]) };
        Ok(Self { image, pool, set })
    }

    /// Release the set and the image. Nothing in flight may use them.
    pub fn destroy(&mut self, device: &ash::Device) {
        DescriptorPools::free(device, self.pool, self.set);
        self.image.destroy(device);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn three_byte_and_single_channel_layouts_have_no_format() {
        for layout in [PixelLayout::Rgb8, PixelLayout::Bgr8, PixelLayout::Gray8, PixelLayout::Indexed8] {
            assert_eq!(vk_format(layout), None, "{layout:?}");
        }
    }

    #[test]
    fn every_sampleable_layout_maps_to_a_format() {
        for layout in PixelLayout::ALL.into_iter().filter(|l| l.is_sampleable()) {
            assert!(vk_format(layout).is_some(), "{layout:?}");
        }
    }

    #[test]
    fn packed_formats_keep_channel_order() {
        assert_eq!(vk_format(PixelLayout::Rgb565), Some(vk::Format::R5G6B5_UNORM_PACK16));
        assert_eq!(vk_format(PixelLayout::Bgr565), Some(vk::Format::B5G6R5_UNORM_PACK16));
        assert_eq!(vk_format(PixelLayout::Rgb10a2), Some(vk::Format::A2B10G10R10_UNORM_PACK32));
    }
}
