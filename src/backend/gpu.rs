// GPU command seam
//
// The frame loop only needs a handful of device calls. Routing them through
// a trait keeps the loop independent of a live device, so the ordering
// rules (fence before reuse, semaphores around submit/present) can be
// exercised against a recording mock.

use ash::vk;
use std::slice;

use super::VulkanDevice;
use crate::error::{EngineResult, VkResultExt};

/// Device operations used by frame slots, image transitions and the loop.
pub trait Gpu {
    /// Block until `fence` is signalled or `timeout_ns` elapses.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> EngineResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> EngineResult<()>;
    /// Signal `fence` once all prior work on the graphics queue completes.
    fn signal_fence(&self, fence: vk::Fence) -> EngineResult<()>;

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> EngineResult<()>;
    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> EngineResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> EngineResult<()>;

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &vk::ImageMemoryBarrier2);
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageBlit2,
        filter: vk::Filter,
    );
    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        range: &vk::ImageSubresourceRange,
    );

    /// Submit one command buffer to the graphics queue.
    fn queue_submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: &vk::SemaphoreSubmitInfo,
        signal: &vk::SemaphoreSubmitInfo,
        fence: vk::Fence,
    ) -> EngineResult<()>;

    fn wait_idle(&self) -> EngineResult<()>;
}

impl Gpu for VulkanDevice {
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> EngineResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }.during("fence wait")
    }

    fn reset_fence(&self, fence: vk::Fence) -> EngineResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }.during("fence reset")
    }

    fn signal_fence(&self, fence: vk::Fence) -> EngineResult<()> {
        // An empty batch still signals its fence
        unsafe { self.device.queue_submit2(self.graphics_queue, &[], fence) }
            .during("fence signal")
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> EngineResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .during("command buffer reset")
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> EngineResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(usage);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .during("command buffer begin")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> EngineResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }.during("command buffer end")
    }

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &vk::ImageMemoryBarrier2) {
        let dependency_info =
            vk::DependencyInfo::builder().image_memory_barriers(slice::from_ref(barrier));

        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        region: &vk::ImageBlit2,
        filter: vk::Filter,
    ) {
        let blit_info = vk::BlitImageInfo2::builder()
            .src_image(src)
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(dst)
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .filter(filter)
            .regions(slice::from_ref(region));

        unsafe { self.device.cmd_blit_image2(cmd, &blit_info) };
    }

    fn cmd_clear_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        range: &vk::ImageSubresourceRange,
    ) {
        unsafe {
            self.device
                .cmd_clear_color_image(cmd, image, layout, color, slice::from_ref(range))
        };
    }

    fn queue_submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: &vk::SemaphoreSubmitInfo,
        signal: &vk::SemaphoreSubmitInfo,
        fence: vk::Fence,
    ) -> EngineResult<()> {
        let cmd_info = vk::CommandBufferSubmitInfo::builder()
            .command_buffer(cmd)
            .device_mask(0)
            .build();

        let submit = vk::SubmitInfo2::builder()
            .wait_semaphore_infos(slice::from_ref(wait))
            .signal_semaphore_infos(slice::from_ref(signal))
            .command_buffer_infos(slice::from_ref(&cmd_info))
            .build();

        unsafe { self.device.queue_submit2(self.graphics_queue, &[submit], fence) }
            .during("queue submit")
    }

    fn wait_idle(&self) -> EngineResult<()> {
        unsafe { self.device.device_wait_idle() }.during("device idle wait")
    }
}
