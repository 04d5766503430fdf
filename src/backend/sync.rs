// Synchronization primitives
//
// One fence and two semaphores per frame in flight.
// The fence is the GPU -> CPU "this slot is free again" signal; the
// semaphores order acquire -> render -> present on the GPU timeline.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;

use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
#[derive(Debug, Clone, Copy)]
pub struct FrameSync {
    /// Signalled by the presentation engine when the acquired image is writable
    pub swapchain_semaphore: vk::Semaphore,
    /// Signalled when this frame's commands finished; presentation waits on it
    pub render_semaphore: vk::Semaphore,
    /// Signalled when this frame's submission completed
    pub render_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let mut sync = Self {
            swapchain_semaphore: vk::Semaphore::null(),
            render_semaphore: vk::Semaphore::null(),
            render_fence: vk::Fence::null(),
        };

        if let Err(e) = sync.create_handles(&device.device) {
            // Null handles are ignored by the destroy calls
            sync.destroy(&device.device);
            return Err(e).context("Failed to create frame sync objects");
        }

        Ok(sync)
    }

    fn create_handles(&mut self, device: &ash::Device) -> VkResult<()> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Start signaled so the first wait on the slot returns at once
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            self.swapchain_semaphore = device.create_semaphore(&semaphore_info, None)?;
            self.render_semaphore = device.create_semaphore(&semaphore_info, None)?;
            self.render_fence = device.create_fence(&fence_info, None)?;
        }
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_fence(self.render_fence, None);
            device.destroy_semaphore(self.render_semaphore, None);
            device.destroy_semaphore(self.swapchain_semaphore, None);
        }
    }
}
