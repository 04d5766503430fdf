// Swapchain - Window presentation
//
// Manages the chain of images we copy the draw target into and present.
// The images belong to the presentation engine; only the views are ours,
// so teardown destroys the views and then the chain, never the images.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{EngineError, EngineResult, VkResultExt};

/// Preferred surface format; blits from the draw target convert into it.
pub const SWAPCHAIN_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

/// What the render loop needs from a presentable image chain.
pub trait PresentChain {
    /// Next writable image index; `semaphore` is signalled once it is ready.
    /// The flag is true when the chain still works but no longer matches
    /// the surface.
    fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> EngineResult<(u32, bool)>;

    /// Queue `image_index` for display once `wait_semaphore` signals.
    /// Returns true when the chain should be rebuilt.
    fn present(&mut self, wait_semaphore: vk::Semaphore, image_index: u32) -> EngineResult<bool>;

    fn image(&self, index: u32) -> vk::Image;
    fn extent(&self) -> vk::Extent2D;
    fn image_count(&self) -> usize;

    /// Build a new chain. The previous one must have been destroyed.
    fn create(&mut self, extent: vk::Extent2D) -> EngineResult<()>;
    /// Destroy views then the chain. The GPU must not be using any image.
    fn destroy(&mut self);
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    requested_present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
    ) -> EngineResult<Self> {
        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            format: SWAPCHAIN_FORMAT,
            present_mode: vk::PresentModeKHR::FIFO,
            extent,
            requested_present_mode: present_mode,
            device,
        };
        swapchain.create(extent)?;

        Ok(swapchain)
    }

    fn create_image_views(&self) -> EngineResult<Vec<vk::ImageView>> {
        let mut views = Vec::with_capacity(self.images.len());

        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            match unsafe { self.device.device.create_image_view(&create_info, None) } {
                Ok(view) => views.push(view),
                Err(result) => {
                    for view in views {
                        unsafe { self.device.device.destroy_image_view(view, None) };
                    }
                    return Err(EngineError::from_vk("swapchain image view creation", result));
                }
            }
        }

        Ok(views)
    }
}

impl PresentChain for Swapchain {
    fn acquire_next_image(
        &mut self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> EngineResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        }
        .during("swapchain image acquire")
    }

    fn present(&mut self, wait_semaphore: vk::Semaphore, image_index: u32) -> EngineResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.device.graphics_queue, &present_info)
        };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(EngineError::from_vk("present", e)),
        }
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
        debug_assert_eq!(self.swapchain, vk::SwapchainKHR::null(), "old swapchain still alive");

        let device = &self.device;
        let loader = &device.surface_loader;

        let (caps, formats, present_modes) = unsafe {
            (
                loader
                    .get_physical_device_surface_capabilities(device.physical_device, device.surface)
                    .during("surface capability query")?,
                loader
                    .get_physical_device_surface_formats(device.physical_device, device.surface)
                    .during("surface format query")?,
                loader
                    .get_physical_device_surface_present_modes(device.physical_device, device.surface)
                    .during("present mode query")?,
            )
        };

        let surface_format = choose_surface_format(&formats).ok_or(EngineError::Vulkan {
            operation: "surface format selection",
            result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        })?;
        let present_mode = choose_present_mode(&present_modes, self.requested_present_mode);
        let extent = choose_extent(&caps, extent);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .during("swapchain creation")?;

        let images = match unsafe { self.swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(EngineError::from_vk("swapchain image query", e));
            }
        };

        self.swapchain = swapchain;
        self.images = images;
        self.format = surface_format.format;
        self.present_mode = present_mode;
        self.extent = extent;

        match self.create_image_views() {
            Ok(views) => self.image_views = views,
            Err(e) => {
                self.destroy();
                return Err(e);
            }
        }

        log::info!("Created swapchain with {} images", self.images.len());
        Ok(())
    }

    fn destroy(&mut self) {
        if self.swapchain == vk::SwapchainKHR::null() {
            return;
        }

        unsafe {
            for view in self.image_views.drain(..) {
                self.device.device.destroy_image_view(view, None);
            }
            // Chain images go with the chain
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }

        self.images.clear();
        self.swapchain = vk::SwapchainKHR::null();
        log::debug!("Swapchain destroyed");
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// B8G8R8A8_UNORM with sRGB non-linear colour space, else whatever comes first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == SWAPCHAIN_FORMAT && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The requested mode when supported, FIFO (always available, vsync) otherwise.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&requested) {
        requested
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    // u32::MAX means the surface lets us pick
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: vk::Extent2D, min_images: u32, max_images: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_images,
            max_image_count: max_images,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 2048 },
            ..Default::default()
        }
    }

    #[test]
    fn preferred_format_wins_when_offered() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: SWAPCHAIN_FORMAT,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        assert_eq!(choose_surface_format(&formats).unwrap().format, SWAPCHAIN_FORMAT);
    }

    #[test]
    fn first_format_is_the_fallback() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];

        assert_eq!(
            choose_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn unsupported_present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];

        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn surface_extent_is_used_when_fixed() {
        let fixed = vk::Extent2D { width: 800, height: 600 };
        let extent = choose_extent(&caps(fixed, 2, 3), vk::Extent2D { width: 1700, height: 900 });

        assert_eq!(extent, fixed);
    }

    #[test]
    fn requested_extent_is_clamped_when_free() {
        let free = vk::Extent2D { width: u32::MAX, height: u32::MAX };
        let extent = choose_extent(&caps(free, 2, 3), vk::Extent2D { width: 8000, height: 0 });

        assert_eq!(extent, vk::Extent2D { width: 4096, height: 1 });
    }

    #[test]
    fn image_count_respects_the_maximum() {
        let any = vk::Extent2D { width: 1, height: 1 };

        assert_eq!(choose_image_count(&caps(any, 2, 0)), 3);
        assert_eq!(choose_image_count(&caps(any, 2, 2)), 2);
        assert_eq!(choose_image_count(&caps(any, 3, 8)), 4);
    }
}
