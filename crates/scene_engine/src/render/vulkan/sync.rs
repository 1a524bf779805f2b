//! Vulkan synchronization primitives
//!
//! RAII wrappers for semaphores and fences, plus the per-render-target
//! command buffer wrapper that enforces the fence-before-reset rule.

use ash::{vk, Device};

use super::commands::CommandPool;
use super::error::{VulkanError, VulkanResult};

/// GPU-GPU synchronization primitive with automatic resource management
pub struct Semaphore {
    device: Device,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a new semaphore
    pub fn new(device: Device) -> VulkanResult<Self> {
        let create_info = vk::SemaphoreCreateInfo::builder();

        let semaphore = unsafe {
            device
                .create_semaphore(&create_info, None)
                .map_err(VulkanError::from)?
        };

        Ok(Self { device, semaphore })
    }

    /// Get the semaphore handle
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_semaphore(self.semaphore, None);
        }
    }
}

/// CPU-GPU synchronization primitive with RAII cleanup
pub struct Fence {
    device: Device,
    fence: vk::Fence,
}

impl Fence {
    /// Create a new fence, optionally already signalled
    pub fn new(device: Device, signaled: bool) -> VulkanResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let create_info = vk::FenceCreateInfo::builder().flags(flags);

        let fence = unsafe {
            device
                .create_fence(&create_info, None)
                .map_err(VulkanError::from)?
        };

        Ok(Self { device, fence })
    }

    /// Block until the fence is signalled
    pub fn wait(&self, timeout: u64) -> VulkanResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[self.fence], true, timeout)
                .map_err(VulkanError::from)
        }
    }

    /// Reset the fence to unsignalled
    pub fn reset(&self) -> VulkanResult<()> {
        unsafe {
            self.device
                .reset_fences(&[self.fence])
                .map_err(VulkanError::from)
        }
    }

    /// Get the fence handle
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Submission tracking for a reusable command buffer.
///
/// A buffer that was submitted must have its fence waited on before it may
/// be reset and re-recorded; a buffer never submitted may be recorded
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    /// Never submitted or fence already consumed
    Idle,
    /// In flight; the fence must be waited on before reuse
    Submitted,
}

impl SubmissionState {
    /// Whether the fence must be waited on before the buffer is reused
    pub fn must_wait(self) -> bool {
        self == Self::Submitted
    }
}

/// A recorded command buffer plus the fence gating its reuse
///
/// One exists per render target per swapchain image. The buffer is only
/// re-recorded when the scene revision it captured goes stale.
pub struct TargetCommandBuffer {
    command_buffer: vk::CommandBuffer,
    fence: Fence,
    state: SubmissionState,
    /// Scene revision the current recording reflects, if any
    pub recorded_revision: Option<u64>,
}

impl TargetCommandBuffer {
    /// Allocate a command buffer from `pool` with an unsignalled fence
    pub fn new(device: Device, pool: &CommandPool) -> VulkanResult<Self> {
        let command_buffer = pool.allocate_command_buffers(1)?[0];
        let fence = Fence::new(device, false)?;

        Ok(Self {
            command_buffer,
            fence,
            state: SubmissionState::Idle,
            recorded_revision: None,
        })
    }

    /// Get the command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    /// Current submission state
    pub fn state(&self) -> SubmissionState {
        self.state
    }

    /// Wait for the previous submission (if any) and reset the fence,
    /// making the buffer safe to reset and re-record.
    ///
    /// The wait always precedes the reset; an unsubmitted buffer skips both.
    pub fn wait_for_reuse(&mut self) -> VulkanResult<()> {
        if self.state.must_wait() {
            self.fence.wait(u64::MAX)?;
            self.fence.reset()?;
            self.state = SubmissionState::Idle;
        }
        Ok(())
    }

    /// Submit the buffer to `queue`, waiting on `wait_semaphore` at the
    /// color-output stage and signalling `signal_semaphore` on completion
    pub fn submit(
        &mut self,
        device: &Device,
        queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
        signal_semaphore: vk::Semaphore,
    ) -> VulkanResult<()> {
        if self.state.must_wait() {
            return Err(VulkanError::InvalidOperation {
                reason: "Command buffer resubmitted before its fence was waited on".to_string(),
            });
        }

        let wait_semaphores = [wait_semaphore];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [self.command_buffer];
        let signal_semaphores = [signal_semaphore];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            device
                .queue_submit(queue, &[submit_info], self.fence.handle())
                .map_err(VulkanError::from)?;
        }

        self.state = SubmissionState::Submitted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_buffer_needs_no_wait() {
        assert!(!SubmissionState::Idle.must_wait());
    }

    #[test]
    fn test_submitted_buffer_must_wait() {
        assert!(SubmissionState::Submitted.must_wait());
    }
}
