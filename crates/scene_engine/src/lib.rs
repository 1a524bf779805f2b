//! Real-time scene graph rendering on Vulkan.
//!
//! A [`scene::Scene`] holds renderable nodes; a
//! [`render::vulkan::VulkanRenderer`] draws them every frame through a
//! data-driven render graph loaded from RON. Typical usage:
//!
//! ```no_run
//! use scene_engine::render::vulkan::VulkanRenderer;
//! use scene_engine::scene::{Node, Scene};
//! use scene_engine::settings::RendererSettings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut renderer = VulkanRenderer::new(RendererSettings::default())?;
//! let mut scene = Scene::new();
//! scene.add(Node::new("triangle"));
//!
//! while !renderer.window().should_close() {
//!     renderer.window_mut().poll_events();
//!     renderer.draw_frame(&scene)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod render;
pub mod scene;
pub mod settings;

pub use render::vulkan::{VulkanError, VulkanRenderer, VulkanResult};
pub use scene::{Node, NodeKey, Scene};
pub use settings::RendererSettings;
