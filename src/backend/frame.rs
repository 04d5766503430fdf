// Frame slots - per-frame recording and synchronization state
//
// Each frame in flight owns its own command pool/buffer, sync set and
// deletion queue, so frame k and frame k+1 never share a command buffer or
// a fence. A slot cycles Idle -> Recording -> Submitted -> (fence) -> Idle;
// the fence wait in `acquire_for_recording` is the only place the CPU blocks.

use anyhow::{Context, Result};
use ash::vk;

use super::deletion_queue::DeletionQueue;
use super::gpu::Gpu;
use super::sync::FrameSync;
use super::VulkanDevice;
use crate::error::EngineResult;

/// CPU-side view of where a slot is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Fence signalled (or about to be); nothing recorded
    Idle,
    /// Fence and command buffer reset, commands may be recorded
    Recording,
    /// Handed to the GPU; reusable once the fence signals
    Submitted,
}

/// Resources for one frame in flight.
pub struct FrameSlot {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    sync: FrameSync,
    /// Released once this slot's fence proves the GPU is done with them
    pub deletion_queue: DeletionQueue,
    state: SlotState,
}

impl FrameSlot {
    /// Create the command pool, its primary buffer and the sync set.
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            // RESET: the single buffer is reset every time the slot comes round
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let created = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffer")
            .and_then(|buffers| Ok((buffers[0], FrameSync::new(device)?)));

        match created {
            Ok((command_buffer, sync)) => Ok(Self::from_parts(command_pool, command_buffer, sync)),
            Err(e) => {
                // Destroying the pool frees its command buffer
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                Err(e)
            }
        }
    }

    pub fn from_parts(
        command_pool: vk::CommandPool,
        command_buffer: vk::CommandBuffer,
        sync: FrameSync,
    ) -> Self {
        Self {
            command_pool,
            command_buffer,
            sync,
            deletion_queue: DeletionQueue::new(),
            state: SlotState::Idle,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn swapchain_semaphore(&self) -> vk::Semaphore {
        self.sync.swapchain_semaphore
    }

    pub fn render_semaphore(&self) -> vk::Semaphore {
        self.sync.render_semaphore
    }

    pub fn render_fence(&self) -> vk::Fence {
        self.sync.render_fence
    }

    /// Wait until the GPU retired this slot's previous submission, then make
    /// the slot ready for recording.
    ///
    /// Order: fence wait, deletion queue flush, fence reset, command buffer
    /// reset. A timeout leaves the slot untouched.
    pub fn acquire_for_recording<G: Gpu + ?Sized>(
        &mut self,
        gpu: &G,
        timeout_ns: u64,
    ) -> EngineResult<()> {
        debug_assert_ne!(self.state, SlotState::Recording, "slot acquired twice");

        gpu.wait_for_fence(self.sync.render_fence, timeout_ns)?;
        self.state = SlotState::Idle;

        self.deletion_queue.flush();

        gpu.reset_fence(self.sync.render_fence)?;
        gpu.reset_command_buffer(self.command_buffer)?;
        self.state = SlotState::Recording;

        Ok(())
    }

    /// Record a one-time-submit command buffer; begin/end are handled here.
    pub fn record<G, F>(&mut self, gpu: &G, commands: F) -> EngineResult<()>
    where
        G: Gpu + ?Sized,
        F: FnOnce(vk::CommandBuffer),
    {
        debug_assert_eq!(self.state, SlotState::Recording, "record on an unacquired slot");

        gpu.begin_command_buffer(
            self.command_buffer,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
        )?;
        commands(self.command_buffer);
        gpu.end_command_buffer(self.command_buffer)
    }

    /// Submit the recorded buffer: wait on image-acquired at colour output,
    /// signal render-complete at all-commands, fence to this slot.
    pub fn submit<G: Gpu + ?Sized>(&mut self, gpu: &G) -> EngineResult<()> {
        debug_assert_eq!(self.state, SlotState::Recording, "submit without recording");

        let wait = semaphore_submit_info(
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            self.sync.swapchain_semaphore,
        );
        let signal = semaphore_submit_info(
            vk::PipelineStageFlags2::ALL_COMMANDS,
            self.sync.render_semaphore,
        );

        gpu.queue_submit(self.command_buffer, &wait, &signal, self.sync.render_fence)?;
        self.state = SlotState::Submitted;

        Ok(())
    }

    /// Give the slot back without submitting.
    ///
    /// The fence was already reset, so it is re-armed with an empty
    /// submission; otherwise the next wait on this slot would never return.
    pub fn abandon<G: Gpu + ?Sized>(&mut self, gpu: &G) -> EngineResult<()> {
        if self.state != SlotState::Recording {
            return Ok(());
        }

        gpu.signal_fence(self.sync.render_fence)?;
        self.state = SlotState::Submitted;

        Ok(())
    }

    /// Release everything the slot owns. The GPU must be idle.
    pub fn destroy(&mut self, device: &ash::Device) {
        self.deletion_queue.flush();
        unsafe {
            // Destroying the pool frees its command buffer
            device.destroy_command_pool(self.command_pool, None);
        }
        self.sync.destroy(device);
        self.state = SlotState::Idle;
    }
}

pub fn semaphore_submit_info(
    stage_mask: vk::PipelineStageFlags2,
    semaphore: vk::Semaphore,
) -> vk::SemaphoreSubmitInfo {
    vk::SemaphoreSubmitInfo::builder()
        .semaphore(semaphore)
        .stage_mask(stage_mask)
        .device_index(0)
        .value(1)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{Event, FenceBehavior, MockGpu};
    use std::cell::RefCell;
    use std::rc::Rc;

    const TIMEOUT: u64 = 1_000_000_000;

    #[test]
    fn fresh_slot_records_without_blocking() {
        let gpu = MockGpu::new();
        let mut slot = gpu.frame_slot(0);

        slot.acquire_for_recording(&gpu, TIMEOUT).unwrap();

        assert_eq!(slot.state(), SlotState::Recording);
        assert_eq!(
            gpu.events(),
            vec![
                Event::WaitFence(slot.render_fence()),
                Event::ResetFence(slot.render_fence()),
                Event::ResetCommandBuffer(slot.command_buffer()),
            ]
        );
    }

    #[test]
    fn recording_never_starts_before_the_fence_signals() {
        let gpu = MockGpu::new();
        let mut slot = gpu.frame_slot(0);

        slot.acquire_for_recording(&gpu, TIMEOUT).unwrap();
        slot.record(&gpu, |_| {}).unwrap();
        slot.submit(&gpu).unwrap();
        assert!(!gpu.is_signalled(slot.render_fence()));

        gpu.clear_events();
        slot.acquire_for_recording(&gpu, TIMEOUT).unwrap();
        slot.record(&gpu, |_| {}).unwrap();

        let events = gpu.events();
        let completed = events
            .iter()
            .position(|e| *e == Event::FenceCompleted(slot.render_fence()))
            .expect("fence completion");
        let begin = events
            .iter()
            .position(|e| *e == Event::Begin(slot.command_buffer()))
            .expect("begin");
        assert!(completed < begin);
    }

    #[test]
    fn timeout_leaves_slot_submitted_and_unrecorded() {
        let gpu = MockGpu::new();
        let mut slot = gpu.frame_slot(0);

        slot.acquire_for_recording(&gpu, TIMEOUT).unwrap();
        slot.record(&gpu, |_| {}).unwrap();
        slot.submit(&gpu).unwrap();

        gpu.set_fence_behavior(FenceBehavior::Hang);
        gpu.clear_events();

        let err = slot.acquire_for_recording(&gpu, TIMEOUT).unwrap_err();
        assert!(matches!(err, crate::error::EngineError::Timeout { .. }));
        assert_eq!(slot.state(), SlotState::Submitted);
        assert_eq!(gpu.events(), vec![Event::WaitFence(slot.render_fence())]);
    }

    #[test]
    fn deletion_queue_flushes_after_the_fence_wait() {
        let gpu = Rc::new(MockGpu::new());
        let mut slot = gpu.frame_slot(0);

        slot.acquire_for_recording(&*gpu, TIMEOUT).unwrap();
        slot.record(&*gpu, |_| {}).unwrap();
        slot.submit(&*gpu).unwrap();

        let observed = Rc::new(RefCell::new(None));
        {
            let gpu = gpu.clone();
            let observed = observed.clone();
            let fence = slot.render_fence();
            slot.deletion_queue
                .push(move || *observed.borrow_mut() = Some(gpu.is_signalled(fence)));
        }

        slot.acquire_for_recording(&*gpu, TIMEOUT).unwrap();

        assert_eq!(*observed.borrow(), Some(true));
        assert!(slot.deletion_queue.is_empty());
    }

    #[test]
    fn submit_waits_on_acquire_and_signals_render_complete() {
        let gpu = MockGpu::new();
        let mut slot = gpu.frame_slot(1);

        slot.acquire_for_recording(&gpu, TIMEOUT).unwrap();
        slot.record(&gpu, |_| {}).unwrap();
        slot.submit(&gpu).unwrap();

        let submit = gpu
            .events()
            .into_iter()
            .find_map(|e| match e {
                Event::Submit { wait, signal, fence, cmd } => Some((wait, signal, fence, cmd)),
                _ => None,
            })
            .expect("submit");

        assert_eq!(
            submit.0,
            (slot.swapchain_semaphore(), vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
        );
        assert_eq!(
            submit.1,
            (slot.render_semaphore(), vk::PipelineStageFlags2::ALL_COMMANDS)
        );
        assert_eq!(submit.2, slot.render_fence());
        assert_eq!(submit.3, slot.command_buffer());
        assert_eq!(slot.state(), SlotState::Submitted);
    }

    #[test]
    fn record_frames_commands_with_one_time_submit() {
        let gpu = MockGpu::new();
        let mut slot = gpu.frame_slot(0);
        slot.acquire_for_recording(&gpu, TIMEOUT).unwrap();
        gpu.clear_events();

        let mut seen = None;
        slot.record(&gpu, |cmd| seen = Some(cmd)).unwrap();

        assert_eq!(seen, Some(slot.command_buffer()));
        assert_eq!(
            gpu.events(),
            vec![
                Event::Begin(slot.command_buffer()),
                Event::End(slot.command_buffer()),
            ]
        );
        assert_eq!(
            gpu.last_begin_usage(),
            Some(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        );
    }

    #[test]
    fn abandoned_slot_rearms_its_fence() {
        let gpu = MockGpu::new();
        let mut slot = gpu.frame_slot(0);

        slot.acquire_for_recording(&gpu, TIMEOUT).unwrap();
        assert!(!gpu.is_signalled(slot.render_fence()));

        slot.abandon(&gpu).unwrap();
        gpu.set_fence_behavior(FenceBehavior::Hang);

        // Would time out had the fence stayed reset
        slot.acquire_for_recording(&gpu, TIMEOUT).unwrap();
    }
}
