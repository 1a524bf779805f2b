//! Rendering subsystem: the data-driven pass configuration and the Vulkan
//! backend that executes it

pub mod config;
pub mod vulkan;

pub use config::RenderConfig;
pub use vulkan::VulkanRenderer;
