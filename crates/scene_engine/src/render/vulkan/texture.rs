//! Texture loading and staged image upload
//!
//! Images are decoded to RGBA8, padded up to power-of-two dimensions, and
//! uploaded through a host-visible linear staging image into a device-local
//! optimally-tiled image, with explicit layout transitions around the copy.

use std::path::Path;

use ash::{vk, Device};
use log::{debug, warn};

use super::commands::CommandPool;
use super::device::PhysicalDeviceInfo;
use super::error::{VulkanError, VulkanResult};

/// Smallest power of two >= `value` (minimum 1)
pub fn next_power_of_two(value: u32) -> u32 {
    value.max(1).next_power_of_two()
}

/// Pad RGBA8 pixel data onto a power-of-two canvas.
///
/// The source image keeps its top-left origin; new rows and columns are
/// opaque black. Returns the original data untouched when both dimensions
/// are already powers of two.
pub fn pad_to_power_of_two(width: u32, height: u32, rgba: &[u8]) -> (u32, u32, Vec<u8>) {
    debug_assert_eq!(rgba.len(), (width * height * 4) as usize);

    let padded_width = next_power_of_two(width);
    let padded_height = next_power_of_two(height);
    if padded_width == width && padded_height == height {
        return (width, height, rgba.to_vec());
    }

    let mut canvas = [0u8, 0, 0, 255].repeat((padded_width * padded_height) as usize);
    let src_row = (width * 4) as usize;
    let dst_row = (padded_width * 4) as usize;
    for y in 0..height as usize {
        let src = y * src_row;
        let dst = y * dst_row;
        canvas[dst..dst + src_row].copy_from_slice(&rgba[src..src + src_row]);
    }

    (padded_width, padded_height, canvas)
}

/// Image, memory, view and sampler bundled for shader sampling
pub struct VulkanTexture {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: vk::Sampler,
    width: u32,
    height: u32,
}

impl VulkanTexture {
    /// Decode an image file and upload it. Returns `ResourceLoad` when the
    /// file cannot be read or decoded; callers fall back to the default
    /// texture.
    pub fn from_file(
        device: Device,
        physical: &PhysicalDeviceInfo,
        pool: &CommandPool,
        queue: vk::Queue,
        path: &Path,
    ) -> VulkanResult<Self> {
        let decoded = image::open(path)
            .map_err(|e| VulkanError::ResourceLoad(format!("{}: {e}", path.display())))?
            .to_rgba8();

        let (width, height) = decoded.dimensions();
        debug!(
            "Loaded texture {} ({width}x{height})",
            path.display()
        );

        Self::from_rgba8(device, physical, pool, queue, width, height, decoded.as_raw())
    }

    /// Upload raw RGBA8 pixels, padding to power-of-two first
    pub fn from_rgba8(
        device: Device,
        physical: &PhysicalDeviceInfo,
        pool: &CommandPool,
        queue: vk::Queue,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> VulkanResult<Self> {
        let (padded_width, padded_height, pixels) = pad_to_power_of_two(width, height, rgba);
        if padded_width != width || padded_height != height {
            debug!("Padded texture {width}x{height} to {padded_width}x{padded_height}");
        }

        let format = vk::Format::R8G8B8A8_UNORM;

        // Host-visible staging image with linear tiling, written through a
        // mapped pointer while still PREINITIALIZED
        let (staging_image, staging_memory) = create_image(
            &device,
            physical,
            padded_width,
            padded_height,
            format,
            vk::ImageTiling::LINEAR,
            vk::ImageUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::ImageLayout::PREINITIALIZED,
        )?;

        write_linear_image(&device, staging_image, staging_memory, padded_width, padded_height, &pixels)?;

        let (image, memory) = create_image(
            &device,
            physical,
            padded_width,
            padded_height,
            format,
            vk::ImageTiling::OPTIMAL,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::ImageLayout::UNDEFINED,
        )?;

        pool.transition_image_layout(
            queue,
            staging_image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::PREINITIALIZED,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )?;
        pool.transition_image_layout(
            queue,
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;

        pool.one_shot(queue, |dev, command_buffer| {
            let subresource = vk::ImageSubresourceLayers::builder()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .mip_level(0)
                .base_array_layer(0)
                .layer_count(1)
                .build();
            let region = vk::ImageCopy::builder()
                .src_subresource(subresource)
                .dst_subresource(subresource)
                .extent(vk::Extent3D {
                    width: padded_width,
                    height: padded_height,
                    depth: 1,
                })
                .build();
            unsafe {
                dev.cmd_copy_image(
                    command_buffer,
                    staging_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        })?;

        pool.transition_image_layout(
            queue,
            image,
            vk::ImageAspectFlags::COLOR,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )?;

        unsafe {
            device.destroy_image(staging_image, None);
            device.free_memory(staging_memory, None);
        }

        let view = create_view(&device, image, format, vk::ImageAspectFlags::COLOR)?;
        let sampler = create_sampler(&device, physical)?;

        Ok(Self {
            device,
            image,
            memory,
            view,
            sampler,
            width: padded_width,
            height: padded_height,
        })
    }

    /// 2x2 opaque gray placeholder bound wherever a material slot is empty
    pub fn default_texture(
        device: Device,
        physical: &PhysicalDeviceInfo,
        pool: &CommandPool,
        queue: vk::Queue,
    ) -> VulkanResult<Self> {
        let pixels = [128u8, 128, 128, 255].repeat(4);
        Self::from_rgba8(device, physical, pool, queue, 2, 2, &pixels)
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::builder()
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_view(self.view)
            .sampler(self.sampler)
            .build()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn create_image(
    device: &Device,
    physical: &PhysicalDeviceInfo,
    width: u32,
    height: u32,
    format: vk::Format,
    tiling: vk::ImageTiling,
    usage: vk::ImageUsageFlags,
    properties: vk::MemoryPropertyFlags,
    initial_layout: vk::ImageLayout,
) -> VulkanResult<(vk::Image, vk::DeviceMemory)> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(format)
        .tiling(tiling)
        .initial_layout(initial_layout)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .samples(vk::SampleCountFlags::TYPE_1);

    let image = unsafe {
        device
            .create_image(&image_info, None)
            .map_err(VulkanError::from)?
    };

    let reqs = unsafe { device.get_image_memory_requirements(image) };
    let memory_type_index = physical.find_memory_type(reqs.memory_type_bits, properties)?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(reqs.size)
        .memory_type_index(memory_type_index);

    let memory = unsafe {
        device.allocate_memory(&alloc_info, None).map_err(|e| {
            if e == vk::Result::ERROR_OUT_OF_DEVICE_MEMORY {
                VulkanError::OutOfDeviceMemory {
                    requested: reqs.size,
                }
            } else {
                VulkanError::from(e)
            }
        })?
    };

    unsafe {
        device
            .bind_image_memory(image, memory, 0)
            .map_err(VulkanError::from)?;
    }

    Ok((image, memory))
}

/// Copy pixels into a linearly-tiled image row by row, honoring the
/// driver-reported row pitch
fn write_linear_image(
    device: &Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    width: u32,
    height: u32,
    pixels: &[u8],
) -> VulkanResult<()> {
    let subresource = vk::ImageSubresource::builder()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .mip_level(0)
        .array_layer(0)
        .build();
    let layout = unsafe { device.get_image_subresource_layout(image, subresource) };

    let row_bytes = (width * 4) as usize;
    unsafe {
        let ptr = device
            .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            .map_err(VulkanError::from)?
            .cast::<u8>();
        let base = ptr.add(layout.offset as usize);
        if layout.row_pitch as usize == row_bytes {
            std::ptr::copy_nonoverlapping(pixels.as_ptr(), base, pixels.len());
        } else {
            for y in 0..height as usize {
                std::ptr::copy_nonoverlapping(
                    pixels.as_ptr().add(y * row_bytes),
                    base.add(y * layout.row_pitch as usize),
                    row_bytes,
                );
            }
        }
        device.unmap_memory(memory);
    }
    Ok(())
}

fn create_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> VulkanResult<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(
            vk::ImageSubresourceRange::builder()
                .aspect_mask(aspect_mask)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1)
                .build(),
        );

    unsafe {
        device
            .create_image_view(&view_info, None)
            .map_err(VulkanError::from)
    }
}

fn create_sampler(device: &Device, physical: &PhysicalDeviceInfo) -> VulkanResult<vk::Sampler> {
    let anisotropy = physical.features.sampler_anisotropy == vk::TRUE;
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(anisotropy)
        .max_anisotropy(if anisotropy { 16.0 } else { 1.0 })
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR);

    if !anisotropy {
        warn!("Anisotropic filtering not supported, sampling without it");
    }

    unsafe {
        device
            .create_sampler(&sampler_info, None)
            .map_err(VulkanError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_power_of_two() {
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(2), 2);
        assert_eq!(next_power_of_two(3), 4);
        assert_eq!(next_power_of_two(300), 512);
        assert_eq!(next_power_of_two(512), 512);
        assert_eq!(next_power_of_two(0), 1);
    }

    #[test]
    fn test_pad_300x200_lands_on_512x256() {
        let rgba = vec![200u8; 300 * 200 * 4];
        let (w, h, canvas) = pad_to_power_of_two(300, 200, &rgba);
        assert_eq!((w, h), (512, 256));
        assert_eq!(canvas.len(), 512 * 256 * 4);
        // original pixels keep the top-left origin
        assert_eq!(canvas[0], 200);
        assert_eq!(canvas[(300 * 4) - 1], 200);
        // padding to the right of row 0 is opaque black
        assert_eq!(&canvas[300 * 4..300 * 4 + 4], &[0, 0, 0, 255]);
        // rows below the source are opaque black
        assert_eq!(&canvas[200 * 512 * 4..200 * 512 * 4 + 4], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_padding_pixels_are_opaque_black() {
        let rgba = vec![200u8; 300 * 200 * 4];
        let (w, h, canvas) = pad_to_power_of_two(300, 200, &rgba);
        // every pixel outside the source rectangle is [0, 0, 0, 255]
        for y in 0..h as usize {
            for x in 0..w as usize {
                if x < 300 && y < 200 {
                    continue;
                }
                let offset = (y * w as usize + x) * 4;
                assert_eq!(
                    &canvas[offset..offset + 4],
                    &[0, 0, 0, 255],
                    "padding pixel at ({x}, {y})"
                );
            }
        }
    }

    #[test]
    fn test_pow2_image_passes_through() {
        let rgba = vec![7u8; 64 * 32 * 4];
        let (w, h, canvas) = pad_to_power_of_two(64, 32, &rgba);
        assert_eq!((w, h), (64, 32));
        assert_eq!(canvas, rgba);
    }

    #[test]
    fn test_padding_preserves_every_source_row() {
        let width = 3u32;
        let height = 2u32;
        let rgba: Vec<u8> = (0..(width * height * 4)).map(|i| i as u8).collect();
        let (w, _h, canvas) = pad_to_power_of_two(width, height, &rgba);
        assert_eq!(w, 4);
        for y in 0..height as usize {
            let src = &rgba[y * 12..y * 12 + 12];
            let dst = &canvas[y * 16..y * 16 + 12];
            assert_eq!(src, dst);
        }
    }
}
