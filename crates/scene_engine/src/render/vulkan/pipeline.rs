//! Shader modules, descriptor layouts, and graphics pipeline assembly

use std::io::Cursor;
use std::path::Path;

use ash::{vk, Device};
use log::debug;

use super::error::{VulkanError, VulkanResult};

/// Number of texture slots bound per object (diffuse, normal, specular,
/// ambient, displacement, alpha)
pub const OBJECT_TEXTURE_SLOTS: u32 = 6;

/// Infer the pipeline stage from a shader file name.
///
/// A trailing `.spv` is ignored, so `shaders/main.vert.spv` and `main.vert`
/// both resolve to the vertex stage.
pub fn infer_shader_stage(file_name: &str) -> VulkanResult<vk::ShaderStageFlags> {
    let trimmed = file_name.strip_suffix(".spv").unwrap_or(file_name);
    let stage = match trimmed.rsplit('.').next() {
        Some("vert") => vk::ShaderStageFlags::VERTEX,
        Some("frag") => vk::ShaderStageFlags::FRAGMENT,
        Some("geom") => vk::ShaderStageFlags::GEOMETRY,
        Some("tesc") => vk::ShaderStageFlags::TESSELLATION_CONTROL,
        Some("tese") => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        Some("comp") => vk::ShaderStageFlags::COMPUTE,
        _ => {
            return Err(VulkanError::ResourceLoad(format!(
                "Cannot infer shader stage from '{file_name}'"
            )))
        }
    };
    Ok(stage)
}

/// SPIR-V shader module with its inferred stage
pub struct ShaderModule {
    device: Device,
    pub module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
}

impl ShaderModule {
    /// Load a compiled SPIR-V file; the stage comes from the file name
    pub fn from_file(device: Device, path: &Path) -> VulkanResult<Self> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VulkanError::ResourceLoad(format!("Bad shader path {}", path.display())))?;
        let stage = infer_shader_stage(file_name)?;

        let bytes = std::fs::read(path)
            .map_err(|e| VulkanError::ResourceLoad(format!("{}: {e}", path.display())))?;
        let code = ash::util::read_spv(&mut Cursor::new(&bytes))
            .map_err(|e| VulkanError::ResourceLoad(format!("{}: {e}", path.display())))?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
        let module = unsafe {
            device
                .create_shader_module(&create_info, None)
                .map_err(VulkanError::from)?
        };

        debug!("Loaded shader {} ({stage:?})", path.display());
        Ok(Self {
            device,
            module,
            stage,
        })
    }

    pub fn stage_info(&self, entry_point: &std::ffi::CStr) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.stage)
            .module(self.module)
            .name(entry_point)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Vertex attribute layouts supported by the geometry passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexLayout {
    /// position(3) + normal(3) + texcoord(2), 32 bytes
    PositionNormalTexcoord,
    /// position(3) + normal(3), 24 bytes
    PositionNormal,
    /// position(3) + texcoord(2), 20 bytes
    PositionTexcoord,
    /// no vertex input, for full-screen quad passes
    None,
}

impl VertexLayout {
    pub fn stride(&self) -> u32 {
        match self {
            VertexLayout::PositionNormalTexcoord => 32,
            VertexLayout::PositionNormal => 24,
            VertexLayout::PositionTexcoord => 20,
            VertexLayout::None => 0,
        }
    }

    pub fn binding_descriptions(&self) -> Vec<vk::VertexInputBindingDescription> {
        if *self == VertexLayout::None {
            return Vec::new();
        }
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride(),
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        let vec3 = vk::Format::R32G32B32_SFLOAT;
        let vec2 = vk::Format::R32G32_SFLOAT;
        match self {
            VertexLayout::PositionNormalTexcoord => vec![
                attr(0, vec3, 0),
                attr(1, vec3, 12),
                attr(2, vec2, 24),
            ],
            VertexLayout::PositionNormal => vec![attr(0, vec3, 0), attr(1, vec3, 12)],
            VertexLayout::PositionTexcoord => vec![attr(0, vec3, 0), attr(1, vec2, 12)],
            VertexLayout::None => Vec::new(),
        }
    }
}

fn attr(location: u32, format: vk::Format, offset: u32) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset,
    }
}

/// Descriptor set layouts shared by all object pipelines.
///
/// Set 0 carries the camera UBO (binding 0) and the dynamic per-object UBO
/// (binding 1); set 1 carries the object's texture slots.
pub struct DescriptorLayouts {
    device: Device,
    pub per_frame: vk::DescriptorSetLayout,
    pub object_textures: vk::DescriptorSetLayout,
}

impl DescriptorLayouts {
    pub fn new(device: Device) -> VulkanResult<Self> {
        let frame_bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .build(),
        ];
        let frame_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&frame_bindings);
        let per_frame = unsafe {
            device
                .create_descriptor_set_layout(&frame_info, None)
                .map_err(VulkanError::from)?
        };

        let texture_bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(OBJECT_TEXTURE_SLOTS)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build()];
        let texture_info =
            vk::DescriptorSetLayoutCreateInfo::builder().bindings(&texture_bindings);
        let object_textures = unsafe {
            device
                .create_descriptor_set_layout(&texture_info, None)
                .map_err(VulkanError::from)?
        };

        Ok(Self {
            device,
            per_frame,
            object_textures,
        })
    }

    pub fn all(&self) -> [vk::DescriptorSetLayout; 2] {
        [self.per_frame, self.object_textures]
    }
}

impl Drop for DescriptorLayouts {
    fn drop(&mut self) {
        unsafe {
            self.device
                .destroy_descriptor_set_layout(self.object_textures, None);
            self.device
                .destroy_descriptor_set_layout(self.per_frame, None);
        }
    }
}

/// Graphics pipeline plus its layout
pub struct Pipeline {
    device: Device,
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Assembles a graphics pipeline against a render pass.
///
/// Viewport and scissor are dynamic state, so pipelines survive swapchain
/// recreation untouched.
pub struct PipelineBuilder<'a> {
    device: Device,
    shaders: &'a [ShaderModule],
    vertex_layout: VertexLayout,
    topology: vk::PrimitiveTopology,
    cull_mode: vk::CullModeFlags,
    depth_test: bool,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(device: Device, shaders: &'a [ShaderModule]) -> Self {
        Self {
            device,
            shaders,
            vertex_layout: VertexLayout::PositionNormalTexcoord,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: true,
        }
    }

    pub fn vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn depth_test(mut self, enabled: bool) -> Self {
        self.depth_test = enabled;
        self
    }

    /// Full-screen quad preset: no vertex input, strip topology, front-face
    /// culling, no depth test
    pub fn quad_pass(self) -> Self {
        self.vertex_layout(VertexLayout::None)
            .topology(vk::PrimitiveTopology::TRIANGLE_STRIP)
            .cull_mode(vk::CullModeFlags::FRONT)
            .depth_test(false)
    }

    pub fn build(
        self,
        render_pass: vk::RenderPass,
        color_attachment_count: usize,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> VulkanResult<Pipeline> {
        let entry_point = std::ffi::CStr::from_bytes_with_nul(b"main\0")
            .map_err(|_| VulkanError::Initialization("Bad shader entry point".to_string()))?;
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = self
            .shaders
            .iter()
            .map(|s| s.stage_info(entry_point))
            .collect();

        let bindings = self.vertex_layout.binding_descriptions();
        let attributes = self.vertex_layout.attribute_descriptions();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.topology)
            .primitive_restart_enable(false);

        // actual viewport and scissor come from dynamic state
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(self.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_test)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0
            ..color_attachment_count)
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .blend_enable(false)
                    .build()
            })
            .collect();
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        let layout = unsafe {
            self.device
                .create_pipeline_layout(&layout_info, None)
                .map_err(VulkanError::from)?
        };

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipeline = unsafe {
            self.device
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    &[pipeline_info.build()],
                    None,
                )
                .map_err(|(_, e)| {
                    self.device.destroy_pipeline_layout(layout, None);
                    VulkanError::from(e)
                })?[0]
        };

        Ok(Pipeline {
            device: self.device,
            pipeline,
            layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_from_extension() {
        assert_eq!(
            infer_shader_stage("main.vert").unwrap(),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            infer_shader_stage("main.frag").unwrap(),
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            infer_shader_stage("tess.tesc").unwrap(),
            vk::ShaderStageFlags::TESSELLATION_CONTROL
        );
    }

    #[test]
    fn test_stage_ignores_spv_suffix() {
        assert_eq!(
            infer_shader_stage("deferred.frag.spv").unwrap(),
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            infer_shader_stage("quad.comp.spv").unwrap(),
            vk::ShaderStageFlags::COMPUTE
        );
    }

    #[test]
    fn test_unknown_extension_is_an_error() {
        assert!(infer_shader_stage("readme.md").is_err());
        assert!(infer_shader_stage("shader.spv").is_err());
    }

    #[test]
    fn test_vertex_layout_strides() {
        assert_eq!(VertexLayout::PositionNormalTexcoord.stride(), 32);
        assert_eq!(VertexLayout::PositionNormal.stride(), 24);
        assert_eq!(VertexLayout::PositionTexcoord.stride(), 20);
        assert_eq!(VertexLayout::None.stride(), 0);
    }

    #[test]
    fn test_attribute_offsets_are_packed() {
        let attrs = VertexLayout::PositionNormalTexcoord.attribute_descriptions();
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].offset, 12);
        assert_eq!(attrs[2].offset, 24);
    }

    #[test]
    fn test_quad_layout_has_no_input() {
        assert!(VertexLayout::None.binding_descriptions().is_empty());
        assert!(VertexLayout::None.attribute_descriptions().is_empty());
    }
}
