// =============================================================================
// FRAME LOOP - Acquire -> Record -> Submit -> Present
// =============================================================================
//
// One call to `tick` drives one frame through the state machine:
//
// ┌──────────────────────────────────────────────────────────────────────┐
// │  wait slot fence ─> flush slot deletions ─> acquire image ─>         │
// │  record (draw target -> swapchain image) ─> submit ─> present ─> +1  │
// └──────────────────────────────────────────────────────────────────────┘
//
// The slot fence wait is the only blocking call. While suspended the loop
// touches nothing on the GPU; the caller idles instead.
//
// =============================================================================

use ash::vk;
use std::sync::Arc;

use crate::backend::frame::FrameSlot;
use crate::backend::gpu::Gpu;
use crate::backend::image;
use crate::backend::swapchain::PresentChain;
use crate::error::{EngineError, EngineResult};

/// Rebuild attempts allowed for one frame before out-of-date becomes fatal.
pub const MAX_REBUILD_ATTEMPTS: usize = 3;

/// The intermediate image every frame renders into before the blit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawTarget {
    pub image: vk::Image,
    pub extent: vk::Extent2D,
}

/// What a call to `tick` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and queued for display
    Presented { image_index: u32 },
    /// Nothing was rendered; idle before ticking again
    Suspended,
}

pub struct FrameLoop<G: Gpu, C: PresentChain> {
    gpu: Arc<G>,
    chain: C,
    slots: Vec<FrameSlot>,
    frame_number: u64,
    draw_target: DrawTarget,
    window_extent: vk::Extent2D,
    clear_color: [f32; 4],
    timeout_ns: u64,
    occluded: bool,
    needs_rebuild: bool,
}

impl<G: Gpu, C: PresentChain> FrameLoop<G, C> {
    pub fn new(
        gpu: Arc<G>,
        chain: C,
        slots: Vec<FrameSlot>,
        draw_target: DrawTarget,
        clear_color: [f32; 4],
        timeout_ns: u64,
    ) -> Self {
        assert!(!slots.is_empty(), "frame loop needs at least one slot");
        let window_extent = chain.extent();

        Self {
            gpu,
            chain,
            slots,
            frame_number: 0,
            draw_target,
            window_extent,
            clear_color,
            timeout_ns,
            occluded: false,
            needs_rebuild: false,
        }
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Rendering stops while the window is occluded or has no area.
    pub fn is_suspended(&self) -> bool {
        self.occluded || is_collapsed(self.window_extent)
    }

    pub fn chain(&self) -> &C {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut C {
        &mut self.chain
    }

    fn slot_index(&self, frame_number: u64) -> usize {
        (frame_number % self.slots.len() as u64) as usize
    }

    fn log_suspension_change(&self, was_suspended: bool) {
        let suspended = self.is_suspended();
        if suspended != was_suspended {
            log::debug!("Rendering {}", if suspended { "suspended" } else { "resumed" });
        }
    }

    /// Window hidden or shown again. Independent of its size.
    pub fn set_occluded(&mut self, occluded: bool) {
        let was_suspended = self.is_suspended();
        self.occluded = occluded;
        self.log_suspension_change(was_suspended);
    }

    /// New window size. Zero in either dimension suspends rendering until
    /// a non-zero size arrives.
    pub fn resize(&mut self, extent: vk::Extent2D) {
        let was_suspended = self.is_suspended();
        self.window_extent = extent;

        if !is_collapsed(extent) && extent != self.chain.extent() {
            self.needs_rebuild = true;
        }
        self.log_suspension_change(was_suspended);
    }

    /// Run `deletor` once the most recently submitted frame is retired.
    pub fn defer_until_retired<F>(&mut self, deletor: F)
    where
        F: FnOnce() + 'static,
    {
        let index = self.slot_index(self.frame_number.saturating_sub(1));
        self.slots[index].deletion_queue.push(deletor);
    }

    /// Drive one frame through Acquire, Record, Submit and Present.
    pub fn tick(&mut self) -> EngineResult<FrameOutcome> {
        if self.is_suspended() {
            return Ok(FrameOutcome::Suspended);
        }

        // ── Acquire ─────────────────────────────────────────────────────
        let index = self.slot_index(self.frame_number);
        self.slots[index].acquire_for_recording(&*self.gpu, self.timeout_ns)?;

        // The fence is reset from here on; a failed frame must re-arm it
        self.run_frame(index).map_err(|e| {
            if let Err(abandon_err) = self.slots[index].abandon(&*self.gpu) {
                log::error!("Could not re-arm frame slot {}: {}", index, abandon_err);
            }
            e
        })
    }

    fn run_frame(&mut self, index: usize) -> EngineResult<FrameOutcome> {
        if self.needs_rebuild && !self.rebuild_chain()? {
            self.slots[index].abandon(&*self.gpu)?;
            return Ok(FrameOutcome::Suspended);
        }

        let image_index = match self.acquire_image(index)? {
            Some(image_index) => image_index,
            None => {
                self.slots[index].abandon(&*self.gpu)?;
                return Ok(FrameOutcome::Suspended);
            }
        };

        // ── Record ──────────────────────────────────────────────────────
        let gpu = &*self.gpu;
        let draw = self.draw_target;
        let swapchain_image = self.chain.image(image_index);
        let swapchain_extent = self.chain.extent();
        let color = pulse(self.clear_color, self.frame_number);

        self.slots[index].record(gpu, |cmd| {
            record_frame(gpu, cmd, &draw, swapchain_image, swapchain_extent, color)
        })?;

        // ── Submit ──────────────────────────────────────────────────────
        self.slots[index].submit(gpu)?;

        // ── Present ─────────────────────────────────────────────────────
        let render_semaphore = self.slots[index].render_semaphore();
        if self.chain.present(render_semaphore, image_index)? {
            self.needs_rebuild = true;
        }

        self.frame_number += 1;
        Ok(FrameOutcome::Presented { image_index })
    }

    /// Acquire an image for slot `index`, rebuilding the chain when it is
    /// out of date. `None` means the window cannot be rendered to right now.
    fn acquire_image(&mut self, index: usize) -> EngineResult<Option<u32>> {
        let semaphore = self.slots[index].swapchain_semaphore();

        for _ in 0..MAX_REBUILD_ATTEMPTS {
            match self.chain.acquire_next_image(semaphore, self.timeout_ns) {
                Ok((image_index, suboptimal)) => {
                    // The semaphore is already pending; use the image, rebuild next frame
                    if suboptimal {
                        self.needs_rebuild = true;
                    }
                    return Ok(Some(image_index));
                }
                Err(EngineError::SwapchainOutOfDate) => {
                    log::debug!("Swapchain out of date on frame {}", self.frame_number);
                    if !self.rebuild_chain()? {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(EngineError::RebuildExhausted {
            attempts: MAX_REBUILD_ATTEMPTS,
        })
    }

    /// Idle, destroy, recreate. Returns false when the window has no area
    /// to build a chain for; rendering stays suspended until it does.
    fn rebuild_chain(&mut self) -> EngineResult<bool> {
        self.needs_rebuild = false;

        if is_collapsed(self.window_extent) {
            log::debug!("Swapchain rebuild deferred: window has no area");
            return Ok(false);
        }

        self.gpu.wait_idle()?;
        self.chain.destroy();
        self.chain.create(self.window_extent)?;

        log::debug!(
            "Swapchain rebuilt at {}x{} ({} images)",
            self.window_extent.width,
            self.window_extent.height,
            self.chain.image_count()
        );
        Ok(true)
    }

    /// Wait for the GPU, flush every slot's deletions and hand the slots
    /// back so their handles can be destroyed.
    pub fn teardown(&mut self) -> EngineResult<Vec<FrameSlot>> {
        self.gpu.wait_idle()?;

        for slot in &mut self.slots {
            slot.deletion_queue.flush();
        }

        Ok(std::mem::take(&mut self.slots))
    }
}

fn is_collapsed(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// Commands for one frame: clear the draw target, blit it into the
/// swapchain image, leave that image presentable.
pub fn record_frame<G: Gpu + ?Sized>(
    gpu: &G,
    cmd: vk::CommandBuffer,
    draw: &DrawTarget,
    swapchain_image: vk::Image,
    swapchain_extent: vk::Extent2D,
    color: [f32; 4],
) {
    image::transition(gpu, cmd, draw.image, vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL);

    draw_background(gpu, cmd, draw.image, color);

    image::transition(
        gpu,
        cmd,
        draw.image,
        vk::ImageLayout::GENERAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    );
    image::transition(
        gpu,
        cmd,
        swapchain_image,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    );

    image::copy(gpu, cmd, draw.image, swapchain_image, draw.extent, swapchain_extent);

    image::transition(
        gpu,
        cmd,
        swapchain_image,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::PRESENT_SRC_KHR,
    );
}

fn draw_background<G: Gpu + ?Sized>(gpu: &G, cmd: vk::CommandBuffer, image: vk::Image, color: [f32; 4]) {
    let clear_value = vk::ClearColorValue { float32: color };
    gpu.cmd_clear_color_image(
        cmd,
        image,
        vk::ImageLayout::GENERAL,
        &clear_value,
        &image::subresource_range(vk::ImageAspectFlags::COLOR),
    );
}

/// Scale the RGB channels by a slow |sin| wave over the frame count.
pub fn pulse(base: [f32; 4], frame_number: u64) -> [f32; 4] {
    let flash = (frame_number as f32 / 120.0).sin().abs();
    [base[0] * flash, base[1] * flash, base[2] * flash, base[3]]
}
