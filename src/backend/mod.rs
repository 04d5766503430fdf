// Backend module - Vulkan abstraction layer
//
// Per-frame resources (FrameSlot) and the swapchain are driven through the
// Gpu and PresentChain traits so the frame loop can run against a mock.

pub mod deletion_queue;
pub mod device;
pub mod frame;
pub mod gpu;
pub mod image;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub mod mock;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
