//! Vulkan error types
//!
//! Central translation of raw `vk::Result` codes into a typed error enum.
//! Swapchain-class errors are the only recoverable category; everything
//! else is fatal to the render loop.

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// Device memory allocation failed; the engine has no eviction policy
    #[error("Out of device memory (requested {requested} bytes)")]
    OutOfDeviceMemory {
        /// Number of bytes that were requested
        requested: u64,
    },

    /// The presentation surface was lost and cannot be reused
    #[error("Surface lost")]
    SurfaceLost,

    /// The logical device was lost; no recovery is attempted
    #[error("Device lost")]
    DeviceLost,

    /// Swapchain no longer matches the surface; triggers recreation
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Swapchain still usable but no longer optimal; triggers recreation
    #[error("Swapchain suboptimal")]
    SwapchainSuboptimal,

    /// A validation layer reported a failure
    #[error("Validation failure: {0}")]
    ValidationFailure(String),

    /// Bootstrap failed before a usable device context existed
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// Graphics-capable and present-capable queue families differ
    #[error("Presentation queue != graphics queue (graphics family {graphics}, present family {present})")]
    QueueFamilyMismatch {
        /// Index of the graphics-capable family
        graphics: u32,
        /// Index of the present-capable family
        present: u32,
    },

    /// A resource (shader file, texture image) could not be loaded
    #[error("Resource load failed: {0}")]
    ResourceLoad(String),

    /// Invalid operation attempted on a wrapper object
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// No memory type satisfies the requested property flags
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Any other Vulkan result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

impl From<vk::Result> for VulkanError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory { requested: 0 },
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            vk::Result::SUBOPTIMAL_KHR => Self::SwapchainSuboptimal,
            vk::Result::ERROR_VALIDATION_FAILED_EXT => {
                Self::ValidationFailure("validation layer reported failure".to_string())
            }
            other => Self::Api(other),
        }
    }
}

impl VulkanError {
    /// Whether the error is handled by rebuilding the swapchain rather
    /// than terminating the render loop
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate | Self::SwapchainSuboptimal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swapchain_errors_are_recoverable() {
        assert!(VulkanError::from(vk::Result::ERROR_OUT_OF_DATE_KHR).is_recoverable());
        assert!(VulkanError::from(vk::Result::SUBOPTIMAL_KHR).is_recoverable());
    }

    #[test]
    fn test_other_errors_are_fatal() {
        assert!(!VulkanError::from(vk::Result::ERROR_DEVICE_LOST).is_recoverable());
        assert!(!VulkanError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_recoverable());
        assert!(!VulkanError::from(vk::Result::ERROR_SURFACE_LOST_KHR).is_recoverable());
        assert!(!VulkanError::QueueFamilyMismatch { graphics: 0, present: 1 }.is_recoverable());
    }

    #[test]
    fn test_result_code_mapping() {
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            VulkanError::OutOfDeviceMemory { .. }
        ));
        assert!(matches!(
            VulkanError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            VulkanError::Api(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }
}
