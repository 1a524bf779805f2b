//! Physical and logical device management
//!
//! Device enumeration and selection, queue family policy, logical device
//! and queue creation, and the memory-type lookup used by every allocation.
//!
//! Selection policy: devices are listed and picked by a configurable index
//! (default 0); there is no "best GPU" heuristic. The engine requires a
//! single queue family supporting both graphics and presentation and fails
//! fast when the two capabilities live in different families.

use std::ffi::CStr;

use ash::extensions::khr::{Surface as SurfaceLoader, Swapchain as SwapchainLoader};
use ash::{vk, Device, Instance};

use super::error::{VulkanError, VulkanResult};

/// Queue family capabilities relevant to the selection policy
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilyCaps {
    /// Family supports graphics commands
    pub graphics: bool,
    /// Family can present to the target surface
    pub present: bool,
}

/// Select the queue family index used for both graphics and presentation.
///
/// Prefers the first family supporting both capabilities. If no such family
/// exists but graphics and presentation are available separately, the engine
/// rejects the device: split graphics/present queues are unsupported.
pub fn select_queue_family(families: &[QueueFamilyCaps]) -> VulkanResult<u32> {
    if let Some(index) = families.iter().position(|f| f.graphics && f.present) {
        return Ok(index as u32);
    }

    let graphics = families
        .iter()
        .position(|f| f.graphics)
        .ok_or_else(|| VulkanError::Initialization("No graphics queue family found".to_string()))?;
    let present = families
        .iter()
        .position(|f| f.present)
        .ok_or_else(|| VulkanError::Initialization("No present queue family found".to_string()))?;

    Err(VulkanError::QueueFamilyMismatch {
        graphics: graphics as u32,
        present: present as u32,
    })
}

/// Physical device selection result and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heap and type table, used for allocation decisions
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Index of the combined graphics+present queue family
    pub queue_family_index: u32,
}

impl PhysicalDeviceInfo {
    /// Enumerate all devices, log them, and select one by index
    pub fn select(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &SurfaceLoader,
        device_index: usize,
    ) -> VulkanResult<Self> {
        let devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(VulkanError::from)?
        };

        if devices.is_empty() {
            return Err(VulkanError::Initialization(
                "No Vulkan-compatible devices found".to_string(),
            ));
        }

        for (i, &device) in devices.iter().enumerate() {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy();
            log::info!(
                "Device {i}: {name} (vendor 0x{:x}, {:?})",
                properties.vendor_id,
                properties.device_type
            );
        }

        let device = *devices.get(device_index).ok_or_else(|| {
            VulkanError::Initialization(format!(
                "Device index {device_index} out of range ({} devices)",
                devices.len()
            ))
        })?;

        let info = Self::evaluate(instance, device, surface, surface_loader)?;
        log::info!("Selected device {device_index}: {}", unsafe {
            CStr::from_ptr(info.properties.device_name.as_ptr()).to_string_lossy()
        });

        Ok(info)
    }

    fn evaluate(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &SurfaceLoader,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let features = unsafe { instance.get_physical_device_features(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };

        let mut caps = Vec::with_capacity(queue_families.len());
        for (index, family) in queue_families.iter().enumerate() {
            let present = unsafe {
                surface_loader
                    .get_physical_device_surface_support(device, index as u32, surface)
                    .map_err(VulkanError::from)?
            };
            caps.push(QueueFamilyCaps {
                graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                present,
            });
        }

        let queue_family_index = select_queue_family(&caps)?;

        // Swapchain extension is required for any presentation
        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::from)?
        };
        let has_swapchain = extensions.iter().any(|available| {
            let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
            name == SwapchainLoader::name()
        });
        if !has_swapchain {
            return Err(VulkanError::Initialization(
                "Device does not support the swapchain extension".to_string(),
            ));
        }

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            queue_family_index,
        })
    }

    /// Minimum uniform-buffer offset alignment reported by the device
    pub fn min_ubo_alignment(&self) -> vk::DeviceSize {
        self.properties.limits.min_uniform_buffer_offset_alignment
    }

    /// Find a memory type index matching the filter and property flags
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<u32> {
        for i in 0..self.memory_properties.memory_type_count {
            if (type_filter & (1 << i)) != 0
                && self.memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
            {
                return Ok(i);
            }
        }

        Err(VulkanError::NoSuitableMemoryType)
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Combined graphics+present queue
    pub queue: vk::Queue,
    /// Index of the queue family the queue belongs to
    pub queue_family_index: u32,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
}

impl LogicalDevice {
    /// Create the logical device with a single graphics+present queue
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let queue_priorities = [1.0];
        let queue_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical.queue_family_index)
            .queue_priorities(&queue_priorities)
            .build();

        let required_extensions = [SwapchainLoader::name().as_ptr()];

        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical.features.sampler_anisotropy == vk::TRUE)
            .build();

        let queue_infos = [queue_info];
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&device_features);

        let device = unsafe {
            instance
                .create_device(physical.device, &create_info, None)
                .map_err(VulkanError::from)?
        };

        let queue = unsafe { device.get_device_queue(physical.queue_family_index, 0) };
        let swapchain_loader = SwapchainLoader::new(instance, &device);

        Ok(Self {
            device,
            queue,
            queue_family_index: physical.queue_family_index,
            swapchain_loader,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(graphics: bool, present: bool) -> QueueFamilyCaps {
        QueueFamilyCaps { graphics, present }
    }

    #[test]
    fn test_combined_family_selected() {
        let families = [caps(true, false), caps(true, true), caps(false, true)];
        assert_eq!(select_queue_family(&families).unwrap(), 1);
    }

    #[test]
    fn test_first_combined_family_wins() {
        let families = [caps(true, true), caps(true, true)];
        assert_eq!(select_queue_family(&families).unwrap(), 0);
    }

    #[test]
    fn test_split_families_rejected() {
        let families = [caps(true, false), caps(false, true)];
        match select_queue_family(&families) {
            Err(VulkanError::QueueFamilyMismatch { graphics, present }) => {
                assert_eq!(graphics, 0);
                assert_eq!(present, 1);
            }
            other => panic!("expected QueueFamilyMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_graphics_family() {
        let families = [caps(false, true)];
        assert!(matches!(
            select_queue_family(&families),
            Err(VulkanError::Initialization(_))
        ));
    }

    #[test]
    fn test_missing_present_family() {
        let families = [caps(true, false)];
        assert!(matches!(
            select_queue_family(&families),
            Err(VulkanError::Initialization(_))
        ));
    }
}
