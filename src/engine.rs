// =============================================================================
// ENGINE - owns the device, the frame loop and the global deletion queue
// =============================================================================
//
// Lifecycle: init() -> tick() until quit -> cleanup().
//
// Process-lifetime resources (draw target, allocator) are registered on the
// global deletion queue as they are created and released newest-first at
// cleanup, after a full GPU idle wait. Per-frame resources go through the
// frame loop's slot queues instead.

use anyhow::{Context, Result};
use ash::vk;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use winit::window::Window;

use crate::backend::deletion_queue::DeletionQueue;
use crate::backend::frame::FrameSlot;
use crate::backend::image::{AllocatedImage, DRAW_IMAGE_FORMAT};
use crate::backend::swapchain::PresentChain;
use crate::backend::{Swapchain, VulkanDevice};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::frame_loop::{DrawTarget, FrameLoop, FrameOutcome};

static ENGINE_ALIVE: AtomicBool = AtomicBool::new(false);

/// Proof that this is the only engine in the process. Released on drop.
#[derive(Debug)]
pub struct InstanceGuard(());

impl InstanceGuard {
    pub fn acquire() -> EngineResult<Self> {
        ENGINE_ALIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(()))
            .map_err(|_| EngineError::AlreadyInitialized)
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        ENGINE_ALIVE.store(false, Ordering::Release);
    }
}

/// Owns GPU objects that are dropped normally unless `leak` was called.
///
/// Used when the GPU never went idle: leaking keeps every handle (and the
/// device they hang off) alive instead of destroying them under running work.
pub struct GpuOwned<T> {
    value: ManuallyDrop<T>,
    leaked: bool,
}

impl<T> GpuOwned<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            leaked: false,
        }
    }

    pub fn leak(&mut self) {
        self.leaked = true;
    }
}

impl<T> Deref for GpuOwned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for GpuOwned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for GpuOwned<T> {
    fn drop(&mut self) {
        if !self.leaked {
            // Only dropped here, and never touched again
            unsafe { ManuallyDrop::drop(&mut self.value) };
        }
    }
}

/// Create `count` values. If one fails, the ones already made are released.
fn create_each<T>(
    count: usize,
    mut create: impl FnMut() -> Result<T>,
    mut release: impl FnMut(T),
) -> Result<Vec<T>> {
    let mut created = Vec::with_capacity(count);
    for _ in 0..count {
        match create() {
            Ok(value) => created.push(value),
            Err(e) => {
                created.into_iter().rev().for_each(&mut release);
                return Err(e);
            }
        }
    }
    Ok(created)
}

pub struct Engine {
    device: Arc<VulkanDevice>,
    frame_loop: GpuOwned<FrameLoop<VulkanDevice, Swapchain>>,
    main_deletion_queue: DeletionQueue,
    is_initialized: bool,
    _guard: InstanceGuard,
}

impl Engine {
    /// Bring up device, swapchain, draw target and frame slots for `window`.
    pub fn init(window: &Window, config: &Config) -> Result<Self> {
        let guard = InstanceGuard::acquire()?;
        log::info!("Initializing engine...");

        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, window, enable_validation)?;

        let mut main_deletion_queue = DeletionQueue::new();
        {
            let device = device.clone();
            main_deletion_queue.push(move || device.destroy_allocator());
        }

        let size = window.inner_size();
        let window_extent = vk::Extent2D {
            width: size.width.max(1),
            height: size.height.max(1),
        };

        let swapchain = Swapchain::new(device.clone(), config.present_mode(), window_extent)
            .context("Failed to create swapchain");
        let swapchain = bail_flushing(swapchain, &mut main_deletion_queue)?;

        let draw_image = AllocatedImage::new(
            &device,
            "draw image",
            DRAW_IMAGE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::COLOR_ATTACHMENT,
            vk::Extent3D {
                width: window_extent.width,
                height: window_extent.height,
                depth: 1,
            },
        );
        let draw_image = bail_flushing(draw_image, &mut main_deletion_queue)?;
        let draw_target = DrawTarget {
            image: draw_image.image,
            extent: draw_image.extent_2d(),
        };
        {
            let device = device.clone();
            let mut draw_image = draw_image;
            main_deletion_queue.push(move || draw_image.destroy(&device));
        }

        let slots = create_each(
            config.frames_in_flight(),
            || FrameSlot::new(&device),
            |mut slot| slot.destroy(&device.device),
        );
        let slots = bail_flushing(slots, &mut main_deletion_queue)?;

        let mut frame_loop = GpuOwned::new(FrameLoop::new(
            device.clone(),
            swapchain,
            slots,
            draw_target,
            config.graphics.clear_color,
            config.frame_timeout_ns(),
        ));
        frame_loop.resize(vk::Extent2D {
            width: size.width,
            height: size.height,
        });

        log::info!(
            "Engine initialized: {} frames in flight, draw target {}x{}",
            frame_loop.frames_in_flight(),
            draw_target.extent.width,
            draw_target.extent.height
        );

        Ok(Self {
            device,
            frame_loop,
            main_deletion_queue,
            is_initialized: true,
            _guard: guard,
        })
    }

    pub fn is_suspended(&self) -> bool {
        self.frame_loop.is_suspended()
    }

    pub fn set_occluded(&mut self, occluded: bool) {
        self.frame_loop.set_occluded(occluded);
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.frame_loop.resize(vk::Extent2D { width, height });
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_loop.frame_number()
    }

    /// Render one frame, or nothing while suspended.
    pub fn tick(&mut self) -> EngineResult<FrameOutcome> {
        self.frame_loop.tick()
    }

    /// Tear everything down in reverse creation order. Safe to call twice.
    pub fn cleanup(&mut self) {
        if !self.is_initialized {
            return;
        }
        self.is_initialized = false;

        log::info!("Cleaning up engine resources...");

        let slots = match self.frame_loop.teardown() {
            Ok(slots) => slots,
            Err(e) => {
                // The frame loop holds the swapchain and device references;
                // leaking it keeps all of them alive
                log::error!("GPU did not go idle ({}); leaking GPU resources", e);
                self.frame_loop.leak();
                return;
            }
        };

        for mut slot in slots {
            slot.destroy(&self.device.device);
        }

        self.frame_loop.chain_mut().destroy();

        self.main_deletion_queue.flush();

        log::info!("Cleanup complete");
    }
}

/// Release what a half-finished init already registered before failing.
fn bail_flushing<T>(result: Result<T>, queue: &mut DeletionQueue) -> Result<T> {
    if result.is_err() {
        queue.flush();
    }
    result
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cleanup();
    }
}
