//! Framebuffer and render-pass construction
//!
//! A builder collects named attachments (float color, unsigned color,
//! depth, or a borrowed swapchain image), then assembles the render pass
//! and framebuffer in one step. Attachment formats degrade to lower
//! channel depths when the device lacks support, with a logged warning.

use ash::{vk, Device};
use log::warn;

use super::device::PhysicalDeviceInfo;
use super::error::{VulkanError, VulkanResult};

/// Fallback chain for depth formats, tried in order after the requested one
const DEPTH_FALLBACKS: [vk::Format; 5] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// Pick a supported depth format, preferring `requested` and walking the
/// fallback chain otherwise
pub fn select_depth_format(
    requested: vk::Format,
    supported: impl Fn(vk::Format) -> bool,
) -> VulkanResult<vk::Format> {
    if supported(requested) {
        return Ok(requested);
    }
    for candidate in DEPTH_FALLBACKS {
        if candidate != requested && supported(candidate) {
            warn!(
                "Depth format {requested:?} unsupported, falling back to {candidate:?}"
            );
            return Ok(candidate);
        }
    }
    Err(VulkanError::Initialization(
        "No supported depth format found".to_string(),
    ))
}

fn float_format(bits: u32) -> Option<vk::Format> {
    match bits {
        32 => Some(vk::Format::R32G32B32A32_SFLOAT),
        16 => Some(vk::Format::R16G16B16A16_SFLOAT),
        8 => Some(vk::Format::R8G8B8A8_UNORM),
        _ => None,
    }
}

fn unsigned_format(bits: u32) -> Option<vk::Format> {
    match bits {
        32 => Some(vk::Format::R32G32B32A32_UINT),
        16 => Some(vk::Format::R16G16B16A16_UINT),
        8 => Some(vk::Format::R8G8B8A8_UINT),
        _ => None,
    }
}

/// Resolve a color format at the requested channel depth, stepping down
/// to narrower channels when the device cannot render to it
pub fn select_color_format(
    bits: u32,
    unsigned: bool,
    supported: impl Fn(vk::Format) -> bool,
) -> VulkanResult<vk::Format> {
    let table = if unsigned { unsigned_format } else { float_format };
    let requested = table(bits).ok_or_else(|| VulkanError::InvalidOperation {
        reason: format!("Unsupported channel depth {bits}"),
    })?;

    let mut candidate_bits = bits;
    loop {
        let format = table(candidate_bits).ok_or_else(|| {
            VulkanError::Initialization(format!(
                "No renderable color format at or below {bits} bits"
            ))
        })?;
        if supported(format) {
            if format != requested {
                warn!(
                    "Color format {requested:?} unsupported, downgraded to {format:?}"
                );
            }
            return Ok(format);
        }
        candidate_bits = match candidate_bits {
            32 => 16,
            16 => 8,
            _ => {
                return Err(VulkanError::Initialization(format!(
                    "No renderable color format at or below {bits} bits"
                )))
            }
        };
    }
}

enum AttachmentKind {
    Color,
    Depth,
    Swapchain,
}

/// One attachment of a framebuffer. Color and depth attachments own their
/// image and memory; swapchain attachments borrow the image from the
/// swapchain and own only the view.
pub struct FramebufferAttachment {
    device: Device,
    pub image: vk::Image,
    memory: Option<vk::DeviceMemory>,
    pub view: vk::ImageView,
    pub format: vk::Format,
    kind: AttachmentKind,
}

impl FramebufferAttachment {
    pub fn is_depth(&self) -> bool {
        matches!(self.kind, AttachmentKind::Depth)
    }
}

impl Drop for FramebufferAttachment {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            if let Some(memory) = self.memory {
                self.device.destroy_image(self.image, None);
                self.device.free_memory(memory, None);
            }
        }
    }
}

/// Collects attachments, then assembles render pass and framebuffer
pub struct FramebufferBuilder<'a> {
    device: Device,
    instance: &'a ash::Instance,
    physical: &'a PhysicalDeviceInfo,
    width: u32,
    height: u32,
    attachments: Vec<(String, FramebufferAttachment)>,
}

impl<'a> FramebufferBuilder<'a> {
    pub fn new(
        device: Device,
        instance: &'a ash::Instance,
        physical: &'a PhysicalDeviceInfo,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            device,
            instance,
            physical,
            width,
            height,
            attachments: Vec::new(),
        }
    }

    fn format_renderable(&self, format: vk::Format, depth: bool) -> bool {
        let props = unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical.device, format)
        };
        let wanted = if depth {
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::FormatFeatureFlags::COLOR_ATTACHMENT | vk::FormatFeatureFlags::SAMPLED_IMAGE
        };
        props.optimal_tiling_features.contains(wanted)
    }

    /// Add a float color attachment at the given channel depth (8/16/32)
    pub fn add_float_attachment(mut self, name: &str, bits: u32) -> VulkanResult<Self> {
        let format = select_color_format(bits, false, |f| self.format_renderable(f, false))?;
        let attachment = self.create_color_attachment(format)?;
        self.attachments.push((name.to_string(), attachment));
        Ok(self)
    }

    /// Add an unsigned integer color attachment at the given channel depth
    pub fn add_unsigned_attachment(mut self, name: &str, bits: u32) -> VulkanResult<Self> {
        let format = select_color_format(bits, true, |f| self.format_renderable(f, false))?;
        let attachment = self.create_color_attachment(format)?;
        self.attachments.push((name.to_string(), attachment));
        Ok(self)
    }

    /// Add a depth attachment, preferring the format matching `bits` and
    /// falling back through the support chain
    pub fn add_depth_attachment(mut self, name: &str, bits: u32) -> VulkanResult<Self> {
        let requested = match bits {
            32 => vk::Format::D32_SFLOAT,
            24 => vk::Format::D24_UNORM_S8_UINT,
            _ => vk::Format::D16_UNORM,
        };
        let format = select_depth_format(requested, |f| self.format_renderable(f, true))?;
        let attachment = self.create_depth_attachment(format)?;
        self.attachments.push((name.to_string(), attachment));
        Ok(self)
    }

    /// Add an attachment backed by a swapchain image; the image is borrowed
    /// and only the view is owned here
    pub fn add_swapchain_attachment(
        mut self,
        name: &str,
        image: vk::Image,
        format: vk::Format,
    ) -> VulkanResult<Self> {
        let view = self.create_view(image, format, vk::ImageAspectFlags::COLOR)?;
        self.attachments.push((
            name.to_string(),
            FramebufferAttachment {
                device: self.device.clone(),
                image,
                memory: None,
                view,
                format,
                kind: AttachmentKind::Swapchain,
            },
        ));
        Ok(self)
    }

    fn create_color_attachment(&self, format: vk::Format) -> VulkanResult<FramebufferAttachment> {
        let (image, memory, view) = self.create_image(
            format,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;
        Ok(FramebufferAttachment {
            device: self.device.clone(),
            image,
            memory: Some(memory),
            view,
            format,
            kind: AttachmentKind::Color,
        })
    }

    fn create_depth_attachment(&self, format: vk::Format) -> VulkanResult<FramebufferAttachment> {
        let (image, memory, view) = self.create_image(
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )?;
        Ok(FramebufferAttachment {
            device: self.device.clone(),
            image,
            memory: Some(memory),
            view,
            format,
            kind: AttachmentKind::Depth,
        })
    }

    fn create_image(
        &self,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> VulkanResult<(vk::Image, vk::DeviceMemory, vk::ImageView)> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe {
            self.device
                .create_image(&image_info, None)
                .map_err(VulkanError::from)?
        };

        let reqs = unsafe { self.device.get_image_memory_requirements(image) };
        let memory_type_index = self
            .physical
            .find_memory_type(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(reqs.size)
            .memory_type_index(memory_type_index);

        let memory = unsafe {
            self.device.allocate_memory(&alloc_info, None).map_err(|e| {
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
            self.device
                .bind_image_memory(image, memory, 0)
                .map_err(VulkanError::from)?;
        }

        let view = self.create_view(image, format, aspect)?;
        Ok((image, memory, view))
    }

    fn create_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VulkanResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::builder()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1)
                    .build(),
            );
        unsafe {
            self.device
                .create_image_view(&view_info, None)
                .map_err(VulkanError::from)
        }
    }

    /// Assemble the render pass and framebuffer from the collected
    /// attachments. `present` selects PRESENT_SRC_KHR as the final layout
    /// of swapchain attachments instead of SHADER_READ_ONLY_OPTIMAL.
    pub fn build(self, present: bool) -> VulkanResult<Framebuffer> {
        if self.attachments.is_empty() {
            return Err(VulkanError::InvalidOperation {
                reason: "Framebuffer needs at least one attachment".to_string(),
            });
        }

        let mut descriptions = Vec::new();
        let mut color_refs = Vec::new();
        let mut depth_ref = None;

        for (index, (_, attachment)) in self.attachments.iter().enumerate() {
            let (final_layout, reference_layout) = match attachment.kind {
                AttachmentKind::Depth => (
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                ),
                AttachmentKind::Swapchain if present => (
                    vk::ImageLayout::PRESENT_SRC_KHR,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
                _ => (
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ),
            };

            descriptions.push(
                vk::AttachmentDescription::builder()
                    .format(attachment.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(final_layout)
                    .build(),
            );

            let reference = vk::AttachmentReference {
                attachment: index as u32,
                layout: reference_layout,
            };
            if attachment.is_depth() {
                depth_ref = Some(reference);
            } else {
                color_refs.push(reference);
            }
        }

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(ref depth) = depth_ref {
            subpass = subpass.depth_stencil_attachment(depth);
        }
        let subpasses = [subpass.build()];

        let dependencies = [
            vk::SubpassDependency::builder()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
                .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .src_access_mask(vk::AccessFlags::MEMORY_READ)
                .dst_access_mask(
                    vk::AccessFlags::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                )
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build(),
            vk::SubpassDependency::builder()
                .src_subpass(0)
                .dst_subpass(vk::SUBPASS_EXTERNAL)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
                .src_access_mask(
                    vk::AccessFlags::COLOR_ATTACHMENT_READ
                        | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                )
                .dst_access_mask(vk::AccessFlags::MEMORY_READ)
                .dependency_flags(vk::DependencyFlags::BY_REGION)
                .build(),
        ];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&descriptions)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = unsafe {
            self.device
                .create_render_pass(&render_pass_info, None)
                .map_err(VulkanError::from)?
        };

        let views: Vec<vk::ImageView> =
            self.attachments.iter().map(|(_, a)| a.view).collect();
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&views)
            .width(self.width)
            .height(self.height)
            .layers(1);

        let framebuffer = unsafe {
            self.device
                .create_framebuffer(&framebuffer_info, None)
                .map_err(VulkanError::from)?
        };

        // one shared sampler for reading this framebuffer's attachments in
        // later passes
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);
        let sampler = unsafe {
            self.device
                .create_sampler(&sampler_info, None)
                .map_err(VulkanError::from)?
        };

        Ok(Framebuffer {
            device: self.device,
            render_pass,
            framebuffer,
            sampler,
            attachments: self.attachments,
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
        })
    }
}

/// Render pass, framebuffer, and owned attachments as one unit
pub struct Framebuffer {
    device: Device,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub sampler: vk::Sampler,
    attachments: Vec<(String, FramebufferAttachment)>,
    pub extent: vk::Extent2D,
}

impl Framebuffer {
    /// Look up an attachment by its configured name
    pub fn attachment(&self, name: &str) -> Option<&FramebufferAttachment> {
        self.attachments
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
    }

    pub fn color_attachment_count(&self) -> usize {
        self.attachments.iter().filter(|(_, a)| !a.is_depth()).count()
    }

    /// Clear values in attachment order: black for color, 1.0 for depth
    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        self.attachments
            .iter()
            .map(|(_, a)| {
                if a.is_depth() {
                    vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: 1.0,
                            stencil: 0,
                        },
                    }
                } else {
                    vk::ClearValue {
                        color: vk::ClearColorValue {
                            float32: [0.0, 0.0, 0.0, 1.0],
                        },
                    }
                }
            })
            .collect()
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_framebuffer(self.framebuffer, None);
            self.device.destroy_render_pass(self.render_pass, None);
        }
        self.attachments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_depth_format_wins_when_supported() {
        let format =
            select_depth_format(vk::Format::D24_UNORM_S8_UINT, |_| true).unwrap();
        assert_eq!(format, vk::Format::D24_UNORM_S8_UINT);
    }

    #[test]
    fn test_depth_fallback_chain_order() {
        // only D16 is available
        let format = select_depth_format(vk::Format::D32_SFLOAT, |f| {
            f == vk::Format::D16_UNORM
        })
        .unwrap();
        assert_eq!(format, vk::Format::D16_UNORM);

        // D24 available, should win over D16 per chain order
        let format = select_depth_format(vk::Format::D32_SFLOAT, |f| {
            f == vk::Format::D24_UNORM_S8_UINT || f == vk::Format::D16_UNORM
        })
        .unwrap();
        assert_eq!(format, vk::Format::D24_UNORM_S8_UINT);
    }

    #[test]
    fn test_no_depth_format_is_an_error() {
        assert!(select_depth_format(vk::Format::D32_SFLOAT, |_| false).is_err());
    }

    #[test]
    fn test_color_format_downgrades_channel_depth() {
        let format = select_color_format(32, false, |f| {
            f == vk::Format::R16G16B16A16_SFLOAT || f == vk::Format::R8G8B8A8_UNORM
        })
        .unwrap();
        assert_eq!(format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn test_color_format_exact_match() {
        let format = select_color_format(16, true, |_| true).unwrap();
        assert_eq!(format, vk::Format::R16G16B16A16_UINT);
    }

    #[test]
    fn test_color_format_exhausted_is_an_error() {
        assert!(select_color_format(8, false, |_| false).is_err());
        assert!(select_color_format(12, false, |_| true).is_err());
    }
}
