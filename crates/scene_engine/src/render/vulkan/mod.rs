//! Vulkan rendering backend
//!
//! Built on ash with GLFW windowing. Every Vulkan handle lives in an RAII
//! wrapper; destruction order follows ownership, device last.

pub mod buffer;
pub mod commands;
pub mod device;
pub mod error;
pub mod framebuffer;
pub mod instance;
pub mod object_state;
pub mod pipeline;
pub mod renderer;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod ubo;
pub mod window;

pub use error::{VulkanError, VulkanResult};
pub use renderer::VulkanRenderer;
pub use window::Window;
