//! Instance creation, physical device selection and the logical device.

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::config::DeviceId;
use crate::error::{RendererError, Result};
use crate::renderer::DeviceEntry;

/// Loader entry, instance and the surface extension.
///
/// Dropping it destroys the instance; every surface and device created from
/// it must be gone by then.
pub(crate) struct Instance {
    /// The loader; must outlive the instance.
    pub entry: ash::Entry,
    pub raw: ash::Instance,
    pub surface: ash::khr::surface::Instance,
}

impl Instance {
    /// Load Vulkan and create an instance able to present to `display`.
    #[tracing::instrument(skip_all)]
    pub fn new(display: RawDisplayHandle) -> Result<Self> {
        let extensions = ash_window::enumerate_required_extensions(display)
            .map_err(|err| RendererError::api("vkEnumerateInstanceExtensionProperties", err))?;
        Self::with_extensions(extensions)
    }

    /// An instance with only the surface extension, for rendering without
    /// windows.
    #[cfg(test)]
    pub fn headless() -> Result<Self> {
        Self::with_extensions(&[ash::khr::surface::NAME.as_ptr()])
    }

    fn with_extensions(extensions: &[*const std::ffi::c_char]) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|err| RendererError::api("vkGetInstanceProcAddr", err))?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"widget-renderer")
            .engine_name(c"widget-renderer")
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(extensions);
        let raw = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|err| RendererError::api("vkCreateInstance", err))?;
        let surface = ash::khr::surface::Instance::new(&entry, &raw);
        Ok(Self {
            entry,
            raw,
            surface,
        })
    }

    /// Every physical device with a readable name.
    pub fn device_entries(&self) -> Vec<DeviceEntry> {
        let devices = match unsafe { self.raw.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(err) => {
                tracing::warn!(%err, "cannot list physical devices");
                return Vec::new();
            }
        };
        devices
            .into_iter()
            .map(|pdev| {
                let props = unsafe { self.raw.get_physical_device_properties(pdev) };
                DeviceEntry {
                    id: DeviceId {
                        vendor: props.vendor_id,
                        device: props.device_id,
                    },
                    name: device_name(&props),
                }
            })
            .collect()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe { self.raw.destroy_instance(None) };
    }
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .map_or_else(|_| String::from("unknown device"), |name| name.to_string_lossy().into_owned())
}

/// Coarse class of a physical device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DeviceKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

impl DeviceKind {
    fn from_vk(ty: vk::PhysicalDeviceType) -> Self {
        match ty {
            vk::PhysicalDeviceType::DISCRETE_GPU => Self::Discrete,
            vk::PhysicalDeviceType::INTEGRATED_GPU => Self::Integrated,
            vk::PhysicalDeviceType::VIRTUAL_GPU => Self::Virtual,
            vk::PhysicalDeviceType::CPU => Self::Cpu,
            _ => Self::Other,
        }
    }

    const fn rank(self) -> u64 {
        match self {
            Self::Discrete => 16,
            Self::Integrated => 8,
            Self::Virtual => 4,
            Self::Cpu => 2,
            Self::Other => 0,
        }
    }
}

/// What selection needs to know about a physical device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub max_texture_size: u32,
    /// Has the swapchain extension and a queue that draws and presents to
    /// every surface.
    pub usable: bool,
}

/// Preference score; the device class dominates, limits break ties.
pub(crate) fn score(candidate: &Candidate) -> u64 {
    candidate.kind.rank() * 1_000_000 + u64::from(candidate.max_texture_size / 2048)
}

/// Index of the device to use: the usable `wanted` device if present,
/// otherwise the best-scoring usable one.
pub(crate) fn pick_device(candidates: &[Candidate], wanted: Option<DeviceId>) -> Option<usize> {
    if let Some(wanted) = wanted {
        if let Some(index) = candidates.iter().position(|c| c.usable && c.id == wanted) {
            return Some(index);
        }
        tracing::warn!(?wanted, "configured device unavailable, choosing automatically");
    }
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.usable)
        .max_by_key(|(_, c)| score(c))
        .map(|(index, _)| index)
}

/// The logical device and everything derived from the chosen physical one.
pub(crate) struct Gpu {
    pub physical: vk::PhysicalDevice,
    pub raw: ash::Device,
    pub swapchain: ash::khr::swapchain::Device,
    pub queue: vk::Queue,
    pub command_pool: vk::CommandPool,
    pub memory: vk::PhysicalDeviceMemoryProperties,
    pub max_texture_size: u32,
    /// Largest compute dispatch along X.
    pub max_dispatch: u32,
    pub id: DeviceId,
    pub name: String,
}

impl Gpu {
    /// Select a physical device able to present to all `surfaces` and create
    /// the logical device on it.
    #[tracing::instrument(skip_all)]
    pub fn new(instance: &Instance, surfaces: &[vk::SurfaceKHR], wanted: Option<DeviceId>) -> Result<Self> {
        let devices = unsafe { instance.raw.enumerate_physical_devices() }
            .map_err(|err| RendererError::api("vkEnumeratePhysicalDevices", err))?;
        let inspected: Vec<(Candidate, Option<u32>)> =
            devices.iter().map(|&pdev| inspect(instance, pdev, surfaces)).collect();
        let candidates: Vec<Candidate> = inspected.iter().map(|(c, _)| *c).collect();
        let index = pick_device(&candidates, wanted).ok_or(RendererError::NoDevice)?;
        let (physical, (candidate, family)) = (devices[index], inspected[index]);
        let family = family.ok_or(RendererError::NoDevice)?;

        let props = unsafe { instance.raw.get_physical_device_properties(physical) };
        let name = device_name(&props);
        tracing::info!(device = %name, kind = ?candidate.kind, queue_family = family, "vulkan device selected");

        let priorities = [1.0];
        let queue_info = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(family)
            .queue_priorities(&priorities)];
        let extensions = [ash::khr::swapchain::NAME.as_ptr()];
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_info)
            .enabled_extension_names(&extensions);
        let raw = unsafe { instance.raw.create_device(physical, &create_info, None) }
            .map_err(|err| RendererError::api("vkCreateDevice", err))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(family);
        let command_pool = match unsafe { raw.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(err) => {
                unsafe { raw.destroy_device(None) };
                return Err(RendererError::api("vkCreateCommandPool", err));
            }
        };

        Ok(Self {
            physical,
            swapchain: ash::khr::swapchain::Device::new(&instance.raw, &raw),
            queue: unsafe { raw.get_device_queue(family, 0) },
            raw,
            command_pool,
            memory: unsafe { instance.raw.get_physical_device_memory_properties(physical) },
            max_texture_size: props.limits.max_image_dimension2_d,
            max_dispatch: props.limits.max_compute_work_group_count[0],
            id: candidate.id,
            name,
        })
    }

    /// Allocate primary command buffers from the shared pool.
    pub fn command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.raw.allocate_command_buffers(&info) }.map_err(|err| RendererError::api("vkAllocateCommandBuffers", err))
    }

    pub fn fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe { self.raw.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
            .map_err(|err| RendererError::api("vkCreateFence", err))
    }

    pub fn semaphore(&self) -> Result<vk::Semaphore> {
        unsafe { self.raw.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
            .map_err(|err| RendererError::api("vkCreateSemaphore", err))
    }

    /// Block until `fence` signals; no timeout.
    pub fn wait(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.raw.wait_for_fences(&[fence], true, u64::MAX) }
            .map_err(|err| RendererError::api("vkWaitForFences", err))
    }

    /// Wait for all queued work; failures are only logged.
    pub fn wait_idle(&self) {
        if let Err(err) = unsafe { self.raw.device_wait_idle() } {
            tracing::warn!(%err, "vkDeviceWaitIdle failed");
        }
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        unsafe {
            self.raw.destroy_command_pool(self.command_pool, None);
            self.raw.destroy_device(None);
        }
    }
}

/// Gather selection facts for one physical device.
fn inspect(instance: &Instance, pdev: vk::PhysicalDevice, surfaces: &[vk::SurfaceKHR]) -> (Candidate, Option<u32>) {
    let props = unsafe { instance.raw.get_physical_device_properties(pdev) };
    let has_swapchain = unsafe { instance.raw.enumerate_device_extension_properties(pdev) }.is_ok_and(|exts| {
        exts.iter()
            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == ash::khr::swapchain::NAME))
    });
    let families = unsafe { instance.raw.get_physical_device_queue_family_properties(pdev) };
    let family = (0u32..)
        .zip(&families)
        .find(|(index, family)| {
            family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && surfaces.iter().all(|&surface| {
                    unsafe {
                        instance
                            .surface
                            .get_physical_device_surface_support(pdev, *index, surface)
                    }
                    .unwrap_or(false)
                })
        })
        .map(|(index, _)| index);

    let candidate = Candidate {
        id: DeviceId {
            vendor: props.vendor_id,
            device: props.device_id,
        },
        kind: DeviceKind::from_vk(props.device_type),
        max_texture_size: props.limits.max_image_dimension2_d,
        usable: has_swapchain && family.is_some(),
    };
    tracing::debug!(device = %device_name(&props), ?candidate, "inspected physical device");
    (candidate, family)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn candidate(vendor: u32, kind: DeviceKind, max: u32, usable: bool) -> Candidate {
        Candidate {
            id: DeviceId { vendor, device: 1 },
            kind,
            max_texture_size: max,
            usable,
        }
    }

    #[test]
    fn discrete_beats_integrated_with_larger_limits() {
        let devices = [
            candidate(1, DeviceKind::Integrated, 32768, true),
            candidate(2, DeviceKind::Discrete, 8192, true),
            candidate(3, DeviceKind::Cpu, 65536, true),
        ];
        assert_eq!(pick_device(&devices, None), Some(1));
    }

    #[test]
    fn limits_break_ties_within_a_class() {
        let devices = [
            candidate(1, DeviceKind::Integrated, 8192, true),
            candidate(2, DeviceKind::Integrated, 16384, true),
        ];
        assert!(score(&devices[1]) > score(&devices[0]));
        assert_eq!(pick_device(&devices, None), Some(1));
    }

    #[test]
    fn configured_device_wins_when_usable() {
        let devices = [
            candidate(1, DeviceKind::Discrete, 16384, true),
            candidate(2, DeviceKind::Integrated, 8192, true),
        ];
        let wanted = Some(DeviceId { vendor: 2, device: 1 });
        assert_eq!(pick_device(&devices, wanted), Some(1));
    }

    #[test]
    fn unusable_devices_are_skipped() {
        let devices = [
            candidate(1, DeviceKind::Discrete, 16384, false),
            candidate(2, DeviceKind::Virtual, 4096, true),
        ];
        let wanted = Some(DeviceId { vendor: 1, device: 1 });
        assert_eq!(pick_device(&devices, wanted), Some(1));
        assert_eq!(pick_device(&devices[..1], None), None);
    }

    #[test]
    fn device_classes_map_from_vulkan() {
        assert_eq!(DeviceKind::from_vk(vk::PhysicalDeviceType::DISCRETE_GPU), DeviceKind::Discrete);
        assert_eq!(DeviceKind::from_vk(vk::PhysicalDeviceType::OTHER), DeviceKind::Other);
    }
}
