// Engine error taxonomy
//
// Frame-loop and resource errors are typed so the loop can tell a
// recoverable swapchain invalidation apart from a dead device.
// Bootstrap code keeps using anyhow and converts at the boundary.

use ash::vk;
use thiserror::Error;

/// Errors raised by the frame-lifecycle core.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A fence wait or image acquisition exceeded its bound
    #[error("GPU timed out during {operation}")]
    Timeout { operation: &'static str },

    /// The logical device was lost
    #[error("GPU device lost")]
    DeviceLost,

    /// The swapchain no longer matches the surface and must be rebuilt
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Rebuilding did not make the swapchain usable again
    #[error("Swapchain still out of date after {attempts} rebuilds")]
    RebuildExhausted { attempts: usize },

    /// Any other Vulkan failure
    #[error("Vulkan error during {operation}: {result}")]
    Vulkan {
        operation: &'static str,
        result: vk::Result,
    },

    /// GPU allocator error
    #[error("Allocator error: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// A second engine was initialized while one is still alive
    #[error("Engine already initialized in this process")]
    AlreadyInitialized,
}

impl EngineError {
    /// Classify a raw Vulkan result produced by `operation`.
    pub fn from_vk(operation: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::TIMEOUT | vk::Result::NOT_READY => Self::Timeout { operation },
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            result => Self::Vulkan { operation, result },
        }
    }

    /// Everything except a single swapchain invalidation ends the render loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SwapchainOutOfDate)
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Attach an operation name to a raw `VkResult`.
pub(crate) trait VkResultExt<T> {
    fn during(self, operation: &'static str) -> EngineResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn during(self, operation: &'static str) -> EngineResult<T> {
        self.map_err(|result| EngineError::from_vk(operation, result))
    }
}
