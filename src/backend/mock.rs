// Mock GPU and swapchain for unit tests (no GPU required)
//
// Both mocks append to one shared event log so tests can assert on the
// exact interleaving of fence waits, recording, submission and present.

use ash::vk::{self, Handle};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::frame::FrameSlot;
use super::gpu::Gpu;
use super::swapchain::PresentChain;
use super::sync::FrameSync;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    WaitFence(vk::Fence),
    /// The simulated GPU finished the work guarded by this fence
    FenceCompleted(vk::Fence),
    ResetFence(vk::Fence),
    SignalFence(vk::Fence),
    ResetCommandBuffer(vk::CommandBuffer),
    Begin(vk::CommandBuffer),
    End(vk::CommandBuffer),
    Barrier {
        image: vk::Image,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    },
    Clear(vk::Image),
    Blit {
        src: vk::Image,
        dst: vk::Image,
        filter: vk::Filter,
    },
    Submit {
        cmd: vk::CommandBuffer,
        wait: (vk::Semaphore, vk::PipelineStageFlags2),
        signal: (vk::Semaphore, vk::PipelineStageFlags2),
        fence: vk::Fence,
    },
    WaitIdle,
    Acquire(vk::Semaphore),
    Present {
        wait: vk::Semaphore,
        index: u32,
    },
    DestroyChain,
    CreateChain(vk::Extent2D),
}

/// Simulated fence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signalled,
    /// Reset and never submitted; nothing will ever signal it
    Reset,
    /// Submitted; the simulated GPU signals it on completion
    Pending,
}

/// How pending fences react to a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceBehavior {
    /// The GPU finishes the pending work while the CPU waits
    CompleteOnWait,
    /// The GPU never finishes; waits time out
    Hang,
}

pub struct MockGpu {
    events: RefCell<Vec<Event>>,
    fences: RefCell<HashMap<vk::Fence, FenceState>>,
    fence_behavior: Cell<FenceBehavior>,
    barriers: RefCell<Vec<vk::ImageMemoryBarrier2>>,
    clear_colors: RefCell<Vec<[f32; 4]>>,
    last_begin_usage: Cell<Option<vk::CommandBufferUsageFlags>>,
}

impl MockGpu {
    pub fn new() -> Self {
        Self {
            events: RefCell::new(Vec::new()),
            fences: RefCell::new(HashMap::new()),
            fence_behavior: Cell::new(FenceBehavior::CompleteOnWait),
            barriers: RefCell::new(Vec::new()),
            clear_colors: RefCell::new(Vec::new()),
            last_begin_usage: Cell::new(None),
        }
    }

    /// A slot with distinct fake handles per index; its fence starts signalled.
    pub fn frame_slot(&self, index: u64) -> FrameSlot {
        let sync = FrameSync {
            swapchain_semaphore: vk::Semaphore::from_raw(300 + index),
            render_semaphore: vk::Semaphore::from_raw(400 + index),
            render_fence: vk::Fence::from_raw(500 + index),
        };
        self.fences
            .borrow_mut()
            .insert(sync.render_fence, FenceState::Signalled);

        FrameSlot::from_parts(
            vk::CommandPool::from_raw(100 + index),
            vk::CommandBuffer::from_raw(200 + index),
            sync,
        )
    }

    pub fn log(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    pub fn barriers(&self) -> Vec<vk::ImageMemoryBarrier2> {
        self.barriers.borrow().clone()
    }

    pub fn clear_colors(&self) -> Vec<[f32; 4]> {
        self.clear_colors.borrow().clone()
    }

    pub fn last_begin_usage(&self) -> Option<vk::CommandBufferUsageFlags> {
        self.last_begin_usage.get()
    }

    pub fn set_fence_behavior(&self, behavior: FenceBehavior) {
        self.fence_behavior.set(behavior);
    }

    fn fence_state(&self, fence: vk::Fence) -> FenceState {
        self.fences
            .borrow()
            .get(&fence)
            .copied()
            .unwrap_or(FenceState::Reset)
    }

    pub fn is_signalled(&self, fence: vk::Fence) -> bool {
        self.fence_state(fence) == FenceState::Signalled
    }

    /// Let the simulated GPU finish the work guarded by `fence`.
    pub fn complete(&self, fence: vk::Fence) {
        self.fences.borrow_mut().insert(fence, FenceState::Signalled);
        self.log(Event::FenceCompleted(fence));
    }
}

impl Gpu for MockGpu {
    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> EngineResult<()> {
        self.log(Event::WaitFence(fence));
        let timeout = EngineError::Timeout {
            operation: "fence wait",
        };

        match (self.fence_state(fence), self.fence_behavior.get()) {
            (FenceState::Signalled, _) => Ok(()),
            (FenceState::Reset, _) => Err(timeout),
            (FenceState::Pending, FenceBehavior::CompleteOnWait) => {
                self.complete(fence);
                Ok(())
            }
            (FenceState::Pending, FenceBehavior::Hang) => Err(timeout),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> EngineResult<()> {
        self.log(Event::ResetFence(fence));
        self.fences.borrow_mut().insert(fence, FenceState::Reset);
        Ok(())
    }

    fn signal_fence(&self, fence: vk::Fence) -> EngineResult<()> {
        // An empty batch; the mock queue has nothing ahead of it
        self.log(Event::SignalFence(fence));
        self.fences.borrow_mut().insert(fence, FenceState::Signalled);
        Ok(())
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> EngineResult<()> {
        self.log(Event::ResetCommandBuffer(cmd));
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) -> EngineResult<()> {
        self.last_begin_usage.set(Some(usage));
        self.log(Event::Begin(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> EngineResult<()> {
        self.log(Event::End(cmd));
        Ok(())
    }

    fn cmd_image_barrier(&self, _cmd: vk::CommandBuffer, barrier: &vk::ImageMemoryBarrier2) {
        self.barriers.borrow_mut().push(*barrier);
        self.log(Event::Barrier {
            image: barrier.image,
            from: barrier.old_layout,
            to: barrier.new_layout,
        });
    }

    fn cmd_blit_image(
        &self,
        _cmd: vk::CommandBuffer,
        src: vk::Image,
        dst: vk::Image,
        _region: &vk::ImageBlit2,
        filter: vk::Filter,
    ) {
        self.log(Event::Blit { src, dst, filter });
    }

    fn cmd_clear_color_image(
        &self,
        _cmd: vk::CommandBuffer,
        image: vk::Image,
        _layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        _range: &vk::ImageSubresourceRange,
    ) {
        self.clear_colors
            .borrow_mut()
            .push(unsafe { color.float32 });
        self.log(Event::Clear(image));
    }

    fn queue_submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: &vk::SemaphoreSubmitInfo,
        signal: &vk::SemaphoreSubmitInfo,
        fence: vk::Fence,
    ) -> EngineResult<()> {
        self.fences.borrow_mut().insert(fence, FenceState::Pending);
        self.log(Event::Submit {
            cmd,
            wait: (wait.semaphore, wait.stage_mask),
            signal: (signal.semaphore, signal.stage_mask),
            fence,
        });
        Ok(())
    }

    fn wait_idle(&self) -> EngineResult<()> {
        self.log(Event::WaitIdle);
        for state in self.fences.borrow_mut().values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signalled;
            }
        }
        Ok(())
    }
}

/// Scripted acquire results, consumed front to back before normal cycling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireScript {
    OutOfDate,
    Suboptimal,
    Timeout,
}

pub struct MockChain {
    gpu: Arc<MockGpu>,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    extent: vk::Extent2D,
    requested_images: u32,
    next_image: u32,
    generation: u64,
    acquire_script: VecDeque<AcquireScript>,
    present_script: VecDeque<bool>,
}

impl MockChain {
    pub fn new(gpu: Arc<MockGpu>, extent: vk::Extent2D, image_count: u32) -> Self {
        let mut chain = Self {
            gpu,
            images: Vec::new(),
            views: Vec::new(),
            extent,
            requested_images: image_count,
            next_image: 0,
            generation: 0,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
        };
        chain.build(extent);
        chain
    }

    fn build(&mut self, extent: vk::Extent2D) {
        self.generation += 1;
        let base = self.generation * 1000;
        self.images = (0..self.requested_images as u64)
            .map(|i| vk::Image::from_raw(base + i))
            .collect();
        self.views = (0..self.requested_images as u64)
            .map(|i| vk::ImageView::from_raw(base + 500 + i))
            .collect();
        self.extent = extent;
        self.next_image = 0;
    }

    pub fn script_acquire(&mut self, outcome: AcquireScript) {
        self.acquire_script.push_back(outcome);
    }

    pub fn script_present(&mut self, needs_rebuild: bool) {
        self.present_script.push_back(needs_rebuild);
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl PresentChain for MockChain {
    fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> EngineResult<(u32, bool)> {
        assert!(!self.images.is_empty(), "acquire on a destroyed swapchain");
        self.gpu.log(Event::Acquire(semaphore));

        let suboptimal = match self.acquire_script.pop_front() {
            Some(AcquireScript::OutOfDate) => return Err(EngineError::SwapchainOutOfDate),
            Some(AcquireScript::Timeout) => {
                return Err(EngineError::Timeout {
                    operation: "swapchain image acquire",
                })
            }
            Some(AcquireScript::Suboptimal) => true,
            None => false,
        };

        let index = self.next_image;
        self.next_image = (self.next_image + 1) % self.images.len() as u32;
        Ok((index, suboptimal))
    }

    fn present(&mut self, wait_semaphore: vk::Semaphore, image_index: u32) -> EngineResult<bool> {
        self.gpu.log(Event::Present {
            wait: wait_semaphore,
            index: image_index,
        });
        Ok(self.present_script.pop_front().unwrap_or(false))
    }

    fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn create(&mut self, extent: vk::Extent2D) -> EngineResult<()> {
        assert!(self.views.is_empty(), "create before destroy");
        self.gpu.log(Event::CreateChain(extent));
        self.build(extent);
        Ok(())
    }

    fn destroy(&mut self) {
        self.gpu.log(Event::DestroyChain);
        self.views.clear();
        self.images.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_wait_completes_only_submitted_work() {
        let gpu = MockGpu::new();
        let submitted = gpu.frame_slot(0);
        let reset_only = gpu.frame_slot(1);

        let wait = vk::SemaphoreSubmitInfo::default();
        gpu.reset_fence(submitted.render_fence()).unwrap();
        gpu.queue_submit(submitted.command_buffer(), &wait, &wait, submitted.render_fence())
            .unwrap();
        gpu.reset_fence(reset_only.render_fence()).unwrap();

        gpu.wait_idle().unwrap();

        assert!(gpu.is_signalled(submitted.render_fence()));
        assert!(!gpu.is_signalled(reset_only.render_fence()));
        assert!(gpu
            .wait_for_fence(reset_only.render_fence(), 1_000_000_000)
            .is_err());
    }
}
