//! Frame orchestration
//!
//! Owns the full backend: instance, device, swapchain, the render graph's
//! framebuffers and pipelines, per-image uniform rings and command buffers.
//! Command buffers are recorded against a scene revision and reused until
//! the scene's structure changes; transforms flow through the uniform ring
//! every frame without re-recording.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ash::extensions::khr::Surface as SurfaceLoader;
use ash::{vk, Device};
use log::{debug, info, warn};

use crate::render::config::{PassConfig, PassType, ParamValue, RenderConfig, VIEWPORT_TARGET};
use crate::scene::{NodeKey, Scene, Topology};
use crate::settings::RendererSettings;

use super::buffer::{VulkanBuffer, DEFAULT_UBO_ALIGNMENT};
use super::commands::CommandPool;
use super::device::{LogicalDevice, PhysicalDeviceInfo};
use super::error::{VulkanError, VulkanResult};
use super::framebuffer::{Framebuffer, FramebufferBuilder};
use super::instance::VulkanInstance;
use super::object_state::{GeometryBuffer, VulkanObjectState};
use super::pipeline::{DescriptorLayouts, Pipeline, PipelineBuilder, ShaderModule, VertexLayout};
use super::swapchain::Swapchain;
use super::sync::{Semaphore, TargetCommandBuffer};
use super::texture::VulkanTexture;
use super::ubo::{FrameUniforms, ObjectUniforms, UboDescriptor, UboLayout, UboMember, UboRing};
use super::window::Window;

const DESCRIPTOR_POOL_SETS: u32 = 1024;

/// Pipeline variants are keyed by primitive topology and vertex layout;
/// nodes with the same topology but different strides must not share a
/// pipeline
pub type PipelineKey = (vk::PrimitiveTopology, VertexLayout);

/// Pipeline key for a piece of scene geometry
pub fn geometry_pipeline_key(geometry: &crate::scene::Geometry) -> PipelineKey {
    (map_topology(geometry.topology), geometry.layout)
}

/// Map scene topology to the Vulkan primitive topology
pub fn map_topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
    }
}

/// Build the std140 parameter block for a pass from its config values
pub fn parameter_layout(pass: &PassConfig) -> UboLayout {
    let mut layout = UboLayout::new();
    let mut names: Vec<&String> = pass.parameters.keys().collect();
    names.sort();
    for name in names {
        let member = match &pass.parameters[name] {
            ParamValue::Float(v) => UboMember::Float(*v),
            ParamValue::Int(v) => UboMember::Int(*v),
            ParamValue::Vec2(v) => UboMember::Vec2((*v).into()),
            ParamValue::Vec3(v) => UboMember::Vec3((*v).into()),
            ParamValue::Vec4(v) => UboMember::Vec4((*v).into()),
        };
        layout.add(name.clone(), member);
    }
    layout
}

/// Frame-rate derivation over one-second windows
struct FpsCounter {
    window_start: Instant,
    base_frames: u64,
    current: f32,
}

impl FpsCounter {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            base_frames: 0,
            current: 0.0,
        }
    }

    /// Fold `total_frames` into the running window; returns the new rate
    /// once a full second has elapsed
    fn tick(&mut self, now: Instant, total_frames: u64) -> Option<f32> {
        let elapsed = now.duration_since(self.window_start);
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let frames = total_frames.saturating_sub(self.base_frames);
        self.current = frames as f32 / elapsed.as_secs_f32();
        self.window_start = now;
        self.base_frames = total_frames;
        Some(self.current)
    }
}

/// Input attachments and parameter block of a quad pass
struct PassInputs {
    device: Device,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    /// Static parameter block, written once at build time
    _parameters: Option<VulkanBuffer>,
}

impl Drop for PassInputs {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// One pass of the render graph with its GPU-side resources
struct PassState {
    config: PassConfig,
    shaders: Vec<ShaderModule>,
    /// One framebuffer per swapchain image for viewport output, a single
    /// one for offscreen targets
    framebuffers: Vec<Framebuffer>,
    pipelines: HashMap<PipelineKey, Pipeline>,
    inputs: Option<PassInputs>,
}

impl PassState {
    fn framebuffer(&self, image_index: usize) -> &Framebuffer {
        if self.framebuffers.len() > 1 {
            &self.framebuffers[image_index]
        } else {
            &self.framebuffers[0]
        }
    }
}

/// Per-swapchain-image state: command buffer, uniform ring, camera UBO
struct FrameResources {
    commands: TargetCommandBuffer,
    ring: UboRing,
    frame_ubo: VulkanBuffer,
    descriptor_set: vk::DescriptorSet,
    render_finished: Semaphore,
}

/// The Vulkan backend
pub struct VulkanRenderer {
    // field order is drop order: everything device-dependent above the
    // device, the device above the instance
    object_states: HashMap<NodeKey, VulkanObjectState>,
    default_texture: VulkanTexture,
    frames: Vec<FrameResources>,
    acquire_semaphores: Vec<Semaphore>,
    passes: Vec<PassState>,
    descriptor_layouts: DescriptorLayouts,
    descriptor_pool: vk::DescriptorPool,
    command_pool: CommandPool,
    swapchain: Swapchain,
    logical: LogicalDevice,
    physical: PhysicalDeviceInfo,
    surface: vk::SurfaceKHR,
    surface_loader: SurfaceLoader,
    instance: VulkanInstance,
    window: Window,
    config: RenderConfig,
    settings: RendererSettings,
    ubo_alignment: u64,
    frame_counter: u64,
    fps: FpsCounter,
}

impl VulkanRenderer {
    /// Bring up the whole backend: window, instance, device, swapchain,
    /// render graph resources
    pub fn new(settings: RendererSettings) -> VulkanResult<Self> {
        let config = match &settings.render_config {
            Some(path) => RenderConfig::from_file(path).map_err(|e| {
                VulkanError::Initialization(format!("Render config: {e}"))
            })?,
            None => RenderConfig::forward(),
        };
        info!("Render configuration: {}", config.name);

        let mut window = Window::new(&settings.title, settings.width, settings.height)
            .map_err(|e| VulkanError::Initialization(e.to_string()))?;

        let instance = VulkanInstance::new(&window, &settings.title, settings.validation)?;
        let surface_loader = SurfaceLoader::new(&instance.entry, &instance.instance);
        let surface = window
            .create_vulkan_surface(instance.instance.handle())
            .map_err(|e| VulkanError::Initialization(e.to_string()))?;

        let physical = PhysicalDeviceInfo::select(
            &instance.instance,
            surface,
            &surface_loader,
            settings.device_index,
        )?;
        let logical = LogicalDevice::new(&instance.instance, &physical)?;
        let device = logical.device.clone();

        let (width, height) = window.framebuffer_size();
        let swapchain = Swapchain::new(
            device.clone(),
            logical.swapchain_loader.clone(),
            surface,
            &surface_loader,
            &physical,
            vk::Extent2D { width, height },
        )?;

        let command_pool = CommandPool::new(device.clone(), logical.queue_family_index)?;
        let descriptor_pool = create_descriptor_pool(&device)?;
        let descriptor_layouts = DescriptorLayouts::new(device.clone())?;

        let default_texture = VulkanTexture::default_texture(
            device.clone(),
            &physical,
            &command_pool,
            logical.queue,
        )?;

        let ubo_alignment = physical.min_ubo_alignment().max(DEFAULT_UBO_ALIGNMENT);

        let mut renderer = Self {
            object_states: HashMap::new(),
            default_texture,
            frames: Vec::new(),
            acquire_semaphores: Vec::new(),
            passes: Vec::new(),
            descriptor_layouts,
            descriptor_pool,
            command_pool,
            swapchain,
            logical,
            physical,
            surface,
            surface_loader,
            instance,
            window,
            config,
            settings,
            ubo_alignment,
            frame_counter: 0,
            fps: FpsCounter::new(Instant::now()),
        };

        renderer.build_passes()?;
        renderer.build_frames()?;

        info!(
            "Renderer ready: {} passes, {} swapchain images",
            renderer.passes.len(),
            renderer.swapchain.image_count()
        );
        Ok(renderer)
    }

    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut Window {
        &mut self.window
    }

    /// Frames presented since startup
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Frame rate measured over the most recent one second window
    pub fn fps(&self) -> f32 {
        self.fps.current
    }

    /// Build framebuffers, shaders, input sets, and pipelines for every
    /// configured pass
    fn build_passes(&mut self) -> VulkanResult<()> {
        let device = self.logical.device.clone();
        let extent = self.swapchain.extent();
        let config = self.config.clone();

        let mut passes = Vec::with_capacity(config.passes.len());
        for pass_config in &config.passes {
            let framebuffers = if pass_config.output == VIEWPORT_TARGET {
                self.build_viewport_framebuffers()?
            } else {
                vec![self.build_target_framebuffer(&pass_config.output, extent)?]
            };

            let mut shaders = Vec::with_capacity(pass_config.shaders.len());
            for name in &pass_config.shaders {
                let path = self.settings.shader_dir.join(name);
                shaders.push(ShaderModule::from_file(device.clone(), &path)?);
            }

            let inputs = if pass_config.pass_type == PassType::Quad {
                Some(self.build_pass_inputs(pass_config, &passes)?)
            } else {
                None
            };

            let mut state = PassState {
                config: pass_config.clone(),
                shaders,
                framebuffers,
                pipelines: HashMap::new(),
                inputs,
            };
            self.build_pipelines(&mut state)?;
            passes.push(state);
        }

        self.passes = passes;
        Ok(())
    }

    /// Swapchain color image plus a fresh depth attachment, one per image
    fn build_viewport_framebuffers(&self) -> VulkanResult<Vec<Framebuffer>> {
        let extent = self.swapchain.extent();
        let format = self.swapchain.format().format;
        let mut framebuffers = Vec::with_capacity(self.swapchain.image_count());
        for &image in self.swapchain.images() {
            let framebuffer = FramebufferBuilder::new(
                self.logical.device.clone(),
                &self.instance.instance,
                &self.physical,
                extent.width,
                extent.height,
            )
            .add_swapchain_attachment("color", image, format)?
            .add_depth_attachment("depth", 32)?
            .build(true)?;
            framebuffers.push(framebuffer);
        }
        Ok(framebuffers)
    }

    /// Offscreen target with the attachments its config declares
    fn build_target_framebuffer(
        &self,
        target_name: &str,
        extent: vk::Extent2D,
    ) -> VulkanResult<Framebuffer> {
        let target = self.config.target(target_name).ok_or_else(|| {
            VulkanError::Initialization(format!("Unknown render target '{target_name}'"))
        })?;

        let mut builder = FramebufferBuilder::new(
            self.logical.device.clone(),
            &self.instance.instance,
            &self.physical,
            extent.width,
            extent.height,
        );
        for attachment in &target.attachments {
            builder = if attachment.format.is_depth() {
                builder.add_depth_attachment(&attachment.name, attachment.format.bits())?
            } else if attachment.format.is_unsigned() {
                builder.add_unsigned_attachment(&attachment.name, attachment.format.bits())?
            } else {
                builder.add_float_attachment(&attachment.name, attachment.format.bits())?
            };
        }
        builder.build(false)
    }

    /// Descriptor set sampling the pass's input attachments, plus the
    /// static parameter block when the config declares one
    fn build_pass_inputs(
        &self,
        pass_config: &PassConfig,
        earlier: &[PassState],
    ) -> VulkanResult<PassInputs> {
        let device = self.logical.device.clone();

        // collect the color attachments of every input target, with the
        // sampler of the framebuffer they belong to
        let mut image_infos = Vec::new();
        for input in &pass_config.inputs {
            let source = earlier
                .iter()
                .find(|p| p.config.output == *input)
                .ok_or_else(|| {
                    VulkanError::Initialization(format!(
                        "Pass '{}' reads target '{input}' before it is written",
                        pass_config.name
                    ))
                })?;
            let framebuffer = &source.framebuffers[0];
            let target = self.config.target(input).ok_or_else(|| {
                VulkanError::Initialization(format!("Unknown render target '{input}'"))
            })?;
            for attachment in &target.attachments {
                if attachment.format.is_depth() {
                    continue;
                }
                let view = framebuffer
                    .attachment(&attachment.name)
                    .ok_or_else(|| {
                        VulkanError::Initialization(format!(
                            "Attachment '{}' missing on target '{input}'",
                            attachment.name
                        ))
                    })?
                    .view;
                image_infos.push(
                    vk::DescriptorImageInfo::builder()
                        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        .image_view(view)
                        .sampler(framebuffer.sampler)
                        .build(),
                );
            }
        }

        let params = parameter_layout(pass_config);
        let mut bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..image_infos.len() as u32)
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build()
            })
            .collect();
        let parameter_binding = image_infos.len() as u32;
        if !params.is_empty() {
            bindings.push(
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(parameter_binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build(),
            );
        }

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(VulkanError::from)?
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let set = unsafe {
            device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::from)?[0]
        };

        let mut writes = Vec::new();
        for (binding, info) in image_infos.iter().enumerate() {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding as u32)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info))
                    .build(),
            );
        }

        let parameters = if params.is_empty() {
            None
        } else {
            let bytes = params.to_bytes();
            let buffer = VulkanBuffer::new(
                device.clone(),
                &self.physical,
                bytes.len() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            buffer.copy_from(&bytes, 0)?;
            Some(buffer)
        };
        let buffer_info;
        if let Some(buffer) = &parameters {
            buffer_info = [vk::DescriptorBufferInfo {
                buffer: buffer.handle(),
                offset: 0,
                range: buffer.size(),
            }];
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(parameter_binding)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(&buffer_info)
                    .build(),
            );
        }

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }

        Ok(PassInputs {
            device,
            layout,
            set,
            _parameters: parameters,
        })
    }

    /// Create the pass's pipelines. Quad passes get one strip pipeline;
    /// geometry passes start with a triangle-list pipeline and grow others
    /// on demand.
    fn build_pipelines(&self, pass: &mut PassState) -> VulkanResult<()> {
        match pass.config.pass_type {
            PassType::Quad => {
                let layouts = match &pass.inputs {
                    Some(inputs) => vec![self.descriptor_layouts.per_frame, inputs.layout],
                    None => vec![self.descriptor_layouts.per_frame],
                };
                let pipeline = PipelineBuilder::new(self.logical.device.clone(), &pass.shaders)
                    .quad_pass()
                    .build(
                        pass.framebuffers[0].render_pass,
                        pass.framebuffers[0].color_attachment_count(),
                        &layouts,
                    )?;
                pass.pipelines.insert(
                    (vk::PrimitiveTopology::TRIANGLE_STRIP, VertexLayout::None),
                    pipeline,
                );
            }
            PassType::Geometry => {
                let pipeline = self.build_geometry_pipeline(
                    pass,
                    vk::PrimitiveTopology::TRIANGLE_LIST,
                    VertexLayout::PositionNormalTexcoord,
                )?;
                pass.pipelines.insert(
                    (
                        vk::PrimitiveTopology::TRIANGLE_LIST,
                        VertexLayout::PositionNormalTexcoord,
                    ),
                    pipeline,
                );
            }
        }
        Ok(())
    }

    fn build_geometry_pipeline(
        &self,
        pass: &PassState,
        topology: vk::PrimitiveTopology,
        layout: VertexLayout,
    ) -> VulkanResult<Pipeline> {
        PipelineBuilder::new(self.logical.device.clone(), &pass.shaders)
            .vertex_layout(layout)
            .topology(topology)
            .build(
                pass.framebuffers[0].render_pass,
                pass.framebuffers[0].color_attachment_count(),
                &self.descriptor_layouts.all(),
            )
    }

    /// Per-image command buffers, uniform rings, camera UBOs, semaphores
    fn build_frames(&mut self) -> VulkanResult<()> {
        let device = self.logical.device.clone();
        let image_count = self.swapchain.image_count();

        let mut frames = Vec::with_capacity(image_count);
        let mut acquire_semaphores = Vec::with_capacity(image_count);
        for _ in 0..image_count {
            let ring_buffer = VulkanBuffer::new(
                device.clone(),
                &self.physical,
                self.settings.ubo_ring_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;
            let ring = UboRing::new(ring_buffer, self.ubo_alignment);

            let frame_ubo = VulkanBuffer::new(
                device.clone(),
                &self.physical,
                std::mem::size_of::<FrameUniforms>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )?;

            let descriptor_set = self.allocate_frame_set(&frame_ubo, &ring)?;

            frames.push(FrameResources {
                commands: TargetCommandBuffer::new(device.clone(), &self.command_pool)?,
                ring,
                frame_ubo,
                descriptor_set,
                render_finished: Semaphore::new(device.clone())?,
            });
            acquire_semaphores.push(Semaphore::new(device.clone())?);
        }

        self.frames = frames;
        self.acquire_semaphores = acquire_semaphores;
        Ok(())
    }

    /// Set 0: camera UBO at binding 0, dynamic object UBO at binding 1
    fn allocate_frame_set(
        &self,
        frame_ubo: &VulkanBuffer,
        ring: &UboRing,
    ) -> VulkanResult<vk::DescriptorSet> {
        let device = &self.logical.device;
        let layouts = [self.descriptor_layouts.per_frame];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let set = unsafe {
            device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(VulkanError::from)?[0]
        };

        let frame_info = [vk::DescriptorBufferInfo {
            buffer: frame_ubo.handle(),
            offset: 0,
            range: frame_ubo.size(),
        }];
        let object_info = [vk::DescriptorBufferInfo {
            buffer: ring.buffer().handle(),
            offset: 0,
            range: std::mem::size_of::<ObjectUniforms>() as vk::DeviceSize,
        }];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&frame_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&object_info)
                .build(),
        ];
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
        Ok(set)
    }

    /// Upload geometry and textures for nodes that gained them, drop state
    /// for nodes that left the scene, and make sure every needed pipeline
    /// key exists
    fn synchronize_scene(&mut self, scene: &Scene) -> VulkanResult<()> {
        let device = self.logical.device.clone();
        let queue = self.logical.queue;

        let live: Vec<NodeKey> = scene.renderable().map(|(key, _)| key).collect();
        self.object_states.retain(|key, _| live.contains(key));

        for (key, node) in scene.renderable() {
            let geometry = node.geometry.as_ref().ok_or_else(|| {
                VulkanError::InvalidOperation {
                    reason: "Renderable node lost its geometry".to_string(),
                }
            })?;

            let state = self.object_states.entry(key).or_default();
            state.topology = map_topology(geometry.topology);

            if state.geometry.is_none() {
                state.geometry = Some(GeometryBuffer::upload(
                    device.clone(),
                    &self.physical,
                    &self.command_pool,
                    queue,
                    &geometry.data,
                    &geometry.indices,
                    geometry.layout,
                )?);
                debug!(
                    "Uploaded geometry for '{}' ({} vertices, {} indices)",
                    node.name,
                    geometry.vertex_count(),
                    geometry.indices.len()
                );
            }

            if state.texture_set.is_none() {
                for (slot, path) in &node.material.textures {
                    match VulkanTexture::from_file(
                        device.clone(),
                        &self.physical,
                        &self.command_pool,
                        queue,
                        path,
                    ) {
                        Ok(texture) => {
                            state.textures.insert(slot.clone(), texture);
                        }
                        Err(e) => {
                            warn!(
                                "Texture '{}' for '{}' failed to load, using fallback: {e}",
                                path.display(),
                                node.name
                            );
                        }
                    }
                }
                state.write_texture_set(
                    &device,
                    self.descriptor_pool,
                    self.descriptor_layouts.object_textures,
                    &self.default_texture,
                )?;
            }
        }

        // grow geometry pipelines for any topology/layout pair the scene
        // now uses
        let needed: Vec<PipelineKey> = self
            .object_states
            .values()
            .filter_map(|s| s.geometry.as_ref().map(|g| (s.topology, g.layout)))
            .collect();
        for index in 0..self.passes.len() {
            if self.passes[index].config.pass_type != PassType::Geometry {
                continue;
            }
            for key in &needed {
                if !self.passes[index].pipelines.contains_key(key) {
                    let pipeline = self.build_geometry_pipeline(
                        &self.passes[index],
                        key.0,
                        key.1,
                    )?;
                    self.passes[index].pipelines.insert(*key, pipeline);
                }
            }
        }

        Ok(())
    }

    /// Render one frame of `scene`. Swapchain staleness is handled
    /// internally by recreating and skipping the frame.
    pub fn draw_frame(&mut self, scene: &Scene) -> VulkanResult<()> {
        if self.window.take_recreate_flag() {
            self.recreate_swapchain()?;
        }

        self.synchronize_scene(scene)?;

        let acquire_index = (self.frame_counter as usize) % self.acquire_semaphores.len();
        let acquire = self.acquire_semaphores[acquire_index].handle();

        let image_index = match self.swapchain.acquire_next_image(acquire) {
            Ok(index) => index,
            Err(e) if e.is_recoverable() => {
                debug!("Swapchain stale on acquire: {e}");
                self.recreate_swapchain()?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // fence wait precedes any touch of this image's ring or commands
        self.frames[image_index as usize].commands.wait_for_reuse()?;

        let offsets = self.write_uniforms(scene, image_index as usize)?;

        let revision = scene.revision();
        if self.frames[image_index as usize].commands.recorded_revision != Some(revision) {
            self.record_commands(scene, image_index as usize, &offsets)?;
            self.frames[image_index as usize].commands.recorded_revision = Some(revision);
        }

        let render_finished = self.frames[image_index as usize].render_finished.handle();
        self.frames[image_index as usize].commands.submit(
            &self.logical.device,
            self.logical.queue,
            acquire,
            render_finished,
        )?;

        match self
            .swapchain
            .present(self.logical.queue, image_index, render_finished)
        {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                debug!("Swapchain stale on present: {e}");
                self.recreate_swapchain()?;
            }
            Err(e) => return Err(e),
        }

        self.frame_counter += 1;
        if let Some(fps) = self.fps.tick(Instant::now(), self.frame_counter) {
            debug!("Frame rate: {fps:.1} fps");
        }
        Ok(())
    }

    /// Reset this image's ring, write camera uniforms once, and push one
    /// object uniform slice per renderable node in draw order
    fn write_uniforms(
        &mut self,
        scene: &Scene,
        image_index: usize,
    ) -> VulkanResult<Vec<(NodeKey, UboDescriptor)>> {
        let frame = &mut self.frames[image_index];

        let (width, height) = self.window.framebuffer_size();
        let aspect = width as f32 / height.max(1) as f32;
        let uniforms = FrameUniforms::new(
            &scene.camera.view_matrix(),
            &scene.camera.projection_matrix(aspect),
            &scene.camera.position.coords,
        );
        frame.frame_ubo.copy_from(bytemuck::bytes_of(&uniforms), 0)?;

        frame.ring.reset();
        let mut offsets = Vec::new();
        for (key, node) in scene.renderable() {
            let object = ObjectUniforms::new(&node.transform, node.is_billboard);
            let descriptor = frame.ring.push(bytemuck::bytes_of(&object))?;
            offsets.push((key, descriptor));
        }
        Ok(offsets)
    }

    /// Record every pass of the graph into this image's command buffer
    fn record_commands(
        &mut self,
        scene: &Scene,
        image_index: usize,
        offsets: &[(NodeKey, UboDescriptor)],
    ) -> VulkanResult<()> {
        let device = self.logical.device.clone();
        let command_buffer = self.frames[image_index].commands.handle();
        let frame_set = self.frames[image_index].descriptor_set;

        unsafe {
            device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(VulkanError::from)?;
            let begin_info = vk::CommandBufferBeginInfo::builder();
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::from)?;
        }

        for pass in &self.passes {
            let framebuffer = pass.framebuffer(image_index);
            let clear_values = framebuffer.clear_values();
            let render_pass_begin = vk::RenderPassBeginInfo::builder()
                .render_pass(framebuffer.render_pass)
                .framebuffer(framebuffer.framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: framebuffer.extent,
                })
                .clear_values(&clear_values);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: framebuffer.extent.width as f32,
                height: framebuffer.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            let scissor = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: framebuffer.extent,
            };

            unsafe {
                device.cmd_begin_render_pass(
                    command_buffer,
                    &render_pass_begin,
                    vk::SubpassContents::INLINE,
                );
                device.cmd_set_viewport(command_buffer, 0, &[viewport]);
                device.cmd_set_scissor(command_buffer, 0, &[scissor]);
            }

            match pass.config.pass_type {
                PassType::Geometry => {
                    record_geometry_pass(
                        &device,
                        command_buffer,
                        pass,
                        frame_set,
                        scene,
                        &self.object_states,
                        offsets,
                    );
                }
                PassType::Quad => {
                    record_quad_pass(&device, command_buffer, pass, frame_set);
                }
            }

            unsafe {
                device.cmd_end_render_pass(command_buffer);
            }
        }

        unsafe {
            device
                .end_command_buffer(command_buffer)
                .map_err(VulkanError::from)?;
        }
        Ok(())
    }

    /// Tear down and rebuild everything sized to the surface. The new
    /// swapchain is created with the old handle before the old one is
    /// dropped.
    fn recreate_swapchain(&mut self) -> VulkanResult<()> {
        unsafe {
            self.logical
                .device
                .device_wait_idle()
                .map_err(VulkanError::from)?;
        }

        let (mut width, mut height) = self.window.framebuffer_size();
        while width == 0 || height == 0 {
            // minimized; wait for a real size
            self.window.poll_events();
            let size = self.window.framebuffer_size();
            width = size.0;
            height = size.1;
            if self.window.should_close() {
                return Ok(());
            }
        }

        let new_swapchain = Swapchain::recreate(
            self.logical.device.clone(),
            self.logical.swapchain_loader.clone(),
            self.surface,
            &self.surface_loader,
            &self.physical,
            vk::Extent2D { width, height },
            self.swapchain.handle(),
        )?;
        let old = std::mem::replace(&mut self.swapchain, new_swapchain);
        drop(old);

        // pipelines use dynamic viewport state and survive; framebuffers,
        // rings, and command buffers are extent- or image-count-bound
        self.passes.clear();
        self.frames.clear();
        self.acquire_semaphores.clear();
        self.build_passes()?;
        self.build_frames()?;

        info!("Swapchain recreated at {width}x{height}");
        Ok(())
    }
}

fn record_geometry_pass(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    pass: &PassState,
    frame_set: vk::DescriptorSet,
    scene: &Scene,
    object_states: &HashMap<NodeKey, VulkanObjectState>,
    offsets: &[(NodeKey, UboDescriptor)],
) {
    for (key, _node) in scene.renderable() {
        let Some(state) = object_states.get(&key) else {
            continue;
        };
        let (Some(geometry), Some(texture_set)) = (&state.geometry, state.texture_set) else {
            continue;
        };
        let Some(pipeline) = pass.pipelines.get(&(state.topology, geometry.layout)) else {
            continue;
        };
        let Some((_, descriptor)) = offsets.iter().find(|(k, _)| *k == key) else {
            continue;
        };

        unsafe {
            device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                &[frame_set, texture_set],
                &[descriptor.offset as u32],
            );
            device.cmd_bind_vertex_buffers(
                command_buffer,
                0,
                &[geometry.buffer.handle()],
                &[0],
            );
            if geometry.index_count > 0 {
                device.cmd_bind_index_buffer(
                    command_buffer,
                    geometry.buffer.handle(),
                    geometry.index_offset,
                    vk::IndexType::UINT32,
                );
                device.cmd_draw_indexed(command_buffer, geometry.index_count, 1, 0, 0, 0);
            } else {
                device.cmd_draw(command_buffer, geometry.vertex_count, 1, 0, 0);
            }
        }
    }
}

fn record_quad_pass(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    pass: &PassState,
    frame_set: vk::DescriptorSet,
) {
    let Some(pipeline) = pass
        .pipelines
        .get(&(vk::PrimitiveTopology::TRIANGLE_STRIP, VertexLayout::None))
    else {
        return;
    };

    let mut sets = vec![frame_set];
    if let Some(inputs) = &pass.inputs {
        sets.push(inputs.set);
    }

    unsafe {
        device.cmd_bind_pipeline(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            pipeline.pipeline,
        );
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            pipeline.layout,
            0,
            &sets,
            &[],
        );
        // full-screen strip, positions derived from the vertex index
        device.cmd_draw(command_buffer, 4, 1, 0, 0);
    }
}

fn create_descriptor_pool(device: &Device) -> VulkanResult<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: DESCRIPTOR_POOL_SETS,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: DESCRIPTOR_POOL_SETS,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: DESCRIPTOR_POOL_SETS * 4,
        },
    ];
    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&pool_sizes)
        .max_sets(DESCRIPTOR_POOL_SETS);

    unsafe {
        device
            .create_descriptor_pool(&pool_info, None)
            .map_err(VulkanError::from)
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        unsafe {
            let _ = self.logical.device.device_wait_idle();
        }
        // resources that are plain handles, not RAII wrappers
        self.object_states.clear();
        self.frames.clear();
        self.passes.clear();
        unsafe {
            self.logical
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::config::RenderConfig;

    #[test]
    fn test_topology_mapping() {
        assert_eq!(
            map_topology(Topology::TriangleList),
            vk::PrimitiveTopology::TRIANGLE_LIST
        );
        assert_eq!(
            map_topology(Topology::LineList),
            vk::PrimitiveTopology::LINE_LIST
        );
        assert_eq!(
            map_topology(Topology::PointList),
            vk::PrimitiveTopology::POINT_LIST
        );
    }

    #[test]
    fn test_parameter_layout_is_sorted_and_sized() {
        let mut config = RenderConfig::forward();
        config.passes[0]
            .parameters
            .insert("exposure".to_string(), ParamValue::Float(1.5));
        config.passes[0]
            .parameters
            .insert("ambient".to_string(), ParamValue::Vec3([0.1, 0.1, 0.1]));

        let layout = parameter_layout(&config.passes[0]);
        // "ambient" sorts first: vec3 at 0..12, float at 12..16
        assert_eq!(layout.size(), 16);
        let bytes = layout.to_bytes();
        assert_eq!(&bytes[0..4], &0.1f32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &1.5f32.to_ne_bytes());
    }

    #[test]
    fn test_empty_parameter_layout() {
        let config = RenderConfig::forward();
        let layout = parameter_layout(&config.passes[0]);
        assert!(layout.is_empty());
        assert_eq!(layout.size(), 0);
    }

    #[test]
    fn test_pipeline_keys_differ_by_vertex_layout() {
        let full = crate::scene::Geometry {
            data: vec![0u8; 32],
            layout: VertexLayout::PositionNormalTexcoord,
            indices: vec![0],
            topology: Topology::TriangleList,
        };
        let mut slim = full.clone();
        slim.data = vec![0u8; 24];
        slim.layout = VertexLayout::PositionNormal;

        let full_key = geometry_pipeline_key(&full);
        let slim_key = geometry_pipeline_key(&slim);
        assert_ne!(full_key, slim_key);
        assert_eq!(full_key.0, slim_key.0);

        // The untextured quad pipeline never collides with a geometry one
        let quad_key = (vk::PrimitiveTopology::TRIANGLE_STRIP, VertexLayout::None);
        assert_ne!(full_key, quad_key);
        assert_ne!(slim_key, quad_key);
    }

    #[test]
    fn test_fps_counter_waits_a_full_second() {
        let t0 = Instant::now();
        let mut fps = FpsCounter::new(t0);
        assert_eq!(fps.tick(t0 + Duration::from_millis(500), 30), None);
        assert_eq!(fps.current, 0.0);
    }

    #[test]
    fn test_fps_counter_reports_frames_per_second() {
        let t0 = Instant::now();
        let mut fps = FpsCounter::new(t0);
        let rate = fps
            .tick(t0 + Duration::from_secs(2), 120)
            .expect("window elapsed");
        assert!((rate - 60.0).abs() < 0.01);
        assert_eq!(fps.current, rate);

        // Next window counts only frames since the last report
        let rate = fps
            .tick(t0 + Duration::from_secs(3), 150)
            .expect("window elapsed");
        assert!((rate - 30.0).abs() < 0.01);
    }
}
