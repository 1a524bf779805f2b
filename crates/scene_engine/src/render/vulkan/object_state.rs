//! Per-object GPU state
//!
//! Each visible node owns a device-local geometry buffer and a texture
//! descriptor set, created lazily the first time the node is drawn and
//! kept until the node leaves the scene.

use std::collections::HashMap;

use ash::{vk, Device};

use super::buffer::{pack_geometry, upload_device_local, VulkanBuffer};
use super::commands::CommandPool;
use super::device::PhysicalDeviceInfo;
use super::error::{VulkanError, VulkanResult};
use super::pipeline::{VertexLayout, OBJECT_TEXTURE_SLOTS};
use super::texture::VulkanTexture;

/// Material texture slots, in descriptor array order
pub const TEXTURE_SLOTS: [&str; OBJECT_TEXTURE_SLOTS as usize] = [
    "diffuse",
    "normal",
    "specular",
    "ambient",
    "displacement",
    "alpha",
];

/// Descriptor array index for a material slot name
pub fn slot_index(name: &str) -> Option<usize> {
    TEXTURE_SLOTS.iter().position(|s| *s == name)
}

/// Interleaved vertex/index data in one device-local buffer
pub struct GeometryBuffer {
    pub buffer: VulkanBuffer,
    pub index_offset: vk::DeviceSize,
    pub index_count: u32,
    pub vertex_count: u32,
    pub layout: VertexLayout,
}

impl GeometryBuffer {
    /// Pack vertices and indices into one block and upload it device-local
    pub fn upload(
        device: Device,
        physical: &PhysicalDeviceInfo,
        pool: &CommandPool,
        queue: vk::Queue,
        vertex_data: &[u8],
        indices: &[u32],
        layout: VertexLayout,
    ) -> VulkanResult<Self> {
        if layout.stride() == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "Geometry upload requires a vertex layout".to_string(),
            });
        }
        let packed = pack_geometry(vertex_data, indices);
        let buffer = upload_device_local(
            device,
            physical,
            pool,
            queue,
            &packed.bytes,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        Ok(Self {
            buffer,
            index_offset: packed.index_offset,
            index_count: packed.index_count,
            vertex_count: (vertex_data.len() / layout.stride() as usize) as u32,
            layout,
        })
    }
}

/// GPU residency for one scene node
pub struct VulkanObjectState {
    pub geometry: Option<GeometryBuffer>,
    pub textures: HashMap<String, VulkanTexture>,
    pub texture_set: Option<vk::DescriptorSet>,
    pub topology: vk::PrimitiveTopology,
}

impl VulkanObjectState {
    pub fn new() -> Self {
        Self {
            geometry: None,
            textures: HashMap::new(),
            texture_set: None,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.geometry.is_some() && self.texture_set.is_some()
    }

    /// Allocate and fill this object's texture descriptor set. Slots with
    /// no texture bind `fallback`.
    pub fn write_texture_set(
        &mut self,
        device: &Device,
        descriptor_pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
        fallback: &VulkanTexture,
    ) -> VulkanResult<()> {
        let set = match self.texture_set {
            Some(set) => set,
            None => {
                let layouts = [layout];
                let alloc_info = vk::DescriptorSetAllocateInfo::builder()
                    .descriptor_pool(descriptor_pool)
                    .set_layouts(&layouts);
                let sets = unsafe {
                    device
                        .allocate_descriptor_sets(&alloc_info)
                        .map_err(VulkanError::from)?
                };
                self.texture_set = Some(sets[0]);
                sets[0]
            }
        };

        let image_infos: Vec<vk::DescriptorImageInfo> = TEXTURE_SLOTS
            .iter()
            .map(|slot| {
                self.textures
                    .get(*slot)
                    .unwrap_or(fallback)
                    .descriptor_info()
            })
            .collect();

        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_infos)
            .build();

        unsafe {
            device.update_descriptor_sets(&[write], &[]);
        }
        Ok(())
    }
}

impl Default for VulkanObjectState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_order_matches_descriptor_array() {
        assert_eq!(slot_index("diffuse"), Some(0));
        assert_eq!(slot_index("normal"), Some(1));
        assert_eq!(slot_index("alpha"), Some(5));
        assert_eq!(slot_index("emissive"), None);
    }

    #[test]
    fn test_slot_count_matches_layout_binding() {
        assert_eq!(TEXTURE_SLOTS.len(), OBJECT_TEXTURE_SLOTS as usize);
    }

    #[test]
    fn test_fresh_state_is_not_ready() {
        let state = VulkanObjectState::new();
        assert!(!state.is_ready());
        assert!(state.geometry.is_none());
    }
}
