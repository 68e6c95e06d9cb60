//! Device memory, buffers and images.

use std::ptr::NonNull;

use ash::vk;

use super::device::Gpu;
use crate::error::{RendererError, Result};

/// Index of the first memory type allowed by `type_bits` that has `flags`.
pub(crate) fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    props
        .memory_types
        .iter()
        .take(props.memory_type_count as usize)
        .zip(0u32..)
        .find(|&(ty, index)| type_bits & (1 << index) != 0 && ty.property_flags.contains(flags))
        .map(|(_, index)| index)
}

/// Allocate memory for `requirements`, preferring `flags` and falling back
/// to `fallback` when no type has them.
pub(crate) fn allocate(
    gpu: &Gpu,
    requirements: vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
    fallback: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let type_index = find_memory_type(&gpu.memory, requirements.memory_type_bits, flags)
        .or_else(|| find_memory_type(&gpu.memory, requirements.memory_type_bits, fallback))
        .ok_or_else(|| RendererError::api("vkAllocateMemory", format!("no memory type with {flags:?}")))?;
    let info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(type_index);
    unsafe { gpu.raw.allocate_memory(&info, None) }.map_err(|err| RendererError::api("vkAllocateMemory", err))
}

/// A buffer with its own allocation, persistently mapped when host visible.
pub(crate) struct Buffer {
    pub raw: vk::Buffer,
    memory: vk::DeviceMemory,
    pub size: u64,
    mapped: Option<NonNull<u8>>,
}

impl Buffer {
    /// A buffer nothing was allocated for; destroying it is a no-op.
    pub const NULL: Self = Self {
        raw: vk::Buffer::null(),
        memory: vk::DeviceMemory::null(),
        size: 0,
        mapped: None,
    };

    /// Create a buffer of `size` bytes.
    ///
    /// Host-visible buffers are coherent and stay mapped for their lifetime;
    /// the others prefer device-local memory.
    pub fn new(gpu: &Gpu, size: u64, usage: vk::BufferUsageFlags, host_visible: bool) -> Result<Self> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let raw = unsafe { gpu.raw.create_buffer(&info, None) }.map_err(|err| RendererError::api("vkCreateBuffer", err))?;
        let mut buffer = Self {
            raw,
            memory: vk::DeviceMemory::null(),
            size,
            mapped: None,
        };
        if let Err(err) = buffer.bind(gpu, host_visible) {
            buffer.destroy(&gpu.raw);
            return Err(err);
        }
        Ok(buffer)
    }

    fn bind(&mut self, gpu: &Gpu, host_visible: bool) -> Result<()> {
        let requirements = unsafe { gpu.raw.get_buffer_memory_requirements(self.raw) };
        let (flags, fallback) = if host_visible {
            let coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
            (coherent, coherent)
        } else {
            (vk::MemoryPropertyFlags::DEVICE_LOCAL, vk::MemoryPropertyFlags::empty())
        };
        self.memory = allocate(gpu, requirements, flags, fallback)?;
        unsafe { gpu.raw.bind_buffer_memory(self.raw, self.memory, 0) }
            .map_err(|err| RendererError::api("vkBindBufferMemory", err))?;
        if host_visible {
            let ptr = unsafe { gpu.raw.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
                .map_err(|err| RendererError::api("vkMapMemory", err))?;
            self.mapped = NonNull::new(ptr.cast::<u8>());
        }
        Ok(())
    }

    /// The mapped contents, `None` for device-local buffers.
    pub fn contents(&mut self) -> Option<&mut [u8]> {
        let ptr = self.mapped?;
        let len = usize::try_from(self.size).ok()?;
        // The mapping covers the whole buffer and lives until `destroy`.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }

    /// Release the buffer and its memory; null handles are skipped.
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.mapped.take().is_some() {
                device.unmap_memory(self.memory);
            }
            if self.raw != vk::Buffer::null() {
                device.destroy_buffer(self.raw, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
        *self = Self::NULL;
    }
}

/// A 2D image with its allocation and a color view.
pub(crate) struct Image {
    pub raw: vk::Image,
    memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Image {
    /// Create a single-mip, device-local image and its view.
    pub fn new(gpu: &Gpu, extent: vk::Extent2D, format: vk::Format, usage: vk::ImageUsageFlags) -> Result<Self> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let raw = unsafe { gpu.raw.create_image(&info, None) }.map_err(|err| RendererError::api("vkCreateImage", err))?;
        let mut image = Self {
            raw,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            format,
            extent,
        };
        if let Err(err) = image.bind(gpu) {
            image.destroy(&gpu.raw);
            return Err(err);
        }
        Ok(image)
    }

    fn bind(&mut self, gpu: &Gpu) -> Result<()> {
        let requirements = unsafe { gpu.raw.get_image_memory_requirements(self.raw) };
        self.memory = allocate(
            gpu,
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        )?;
        unsafe { gpu.raw.bind_image_memory(self.raw, self.memory, 0) }
            .map_err(|err| RendererError::api("vkBindImageMemory", err))?;
        self.view = create_view(&gpu.raw, self.raw, self.format)?;
        Ok(())
    }

    /// Release view, image and memory; null handles are skipped.
    pub fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
            }
            if self.raw != vk::Image::null() {
                device.destroy_image(self.raw, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                device.free_memory(self.memory, None);
            }
        }
        self.view = vk::ImageView::null();
        self.raw = vk::Image::null();
        self.memory = vk::DeviceMemory::null();
    }
}

/// A plain 2D color view of `image`.
pub(crate) fn create_view(device: &ash::Device, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
    let info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(COLOR_RANGE);
    unsafe { device.create_image_view(&info, None) }.map_err(|err| RendererError::api("vkCreateImageView", err))
}

/// The single mip level and layer of a color image.
pub(crate) const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Record a layout transition of a whole color image.
pub(crate) fn transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    (old, new): (vk::ImageLayout, vk::ImageLayout),
    (src_stage, src_access): (vk::PipelineStageFlags, vk::AccessFlags),
    (dst_stage, dst_access): (vk::PipelineStageFlags, vk::AccessFlags),
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Copy region for a whole tightly packed image.
pub(crate) fn image_copy(extent: vk::Extent2D) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_offset: vk::Offset3D::default(),
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn props(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: u32::try_from(flags.len()).unwrap(),
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(flags) {
            slot.property_flags = flags;
        }
        props
    }

    #[test]
    fn memory_type_respects_allowed_bits() {
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let table = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL, host, host]);
        assert_eq!(find_memory_type(&table, 0b111, host), Some(1));
        assert_eq!(find_memory_type(&table, 0b100, host), Some(2));
        assert_eq!(find_memory_type(&table, 0b001, host), None);
    }

    #[test]
    fn flags_must_all_be_present() {
        let table = props(&[vk::MemoryPropertyFlags::HOST_VISIBLE]);
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&table, u32::MAX, wanted), None);
        assert_eq!(find_memory_type(&table, u32::MAX, vk::MemoryPropertyFlags::empty()), Some(0));
    }

    #[test]
    fn types_past_the_count_are_ignored() {
        let mut table = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        table.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(find_memory_type(&table, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE), None);
    }

    #[test]
    fn whole_image_copy_is_tight() {
        let region = image_copy(vk::Extent2D { width: 7, height: 3 });
        assert_eq!(region.buffer_row_length, 0);
        assert_eq!((region.image_extent.width, region.image_extent.height), (7, 3));
    }
}
