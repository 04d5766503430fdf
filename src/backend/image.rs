// Image layout transitions, blits and allocated images
//
// Layouts are not tracked: every call names both the layout the image is
// in and the one it should end up in. Barriers cover all commands on both
// sides.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::gpu::Gpu;
use super::VulkanDevice;
use crate::error::EngineError;

/// Format of the intermediate render target.
pub const DRAW_IMAGE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

pub fn aspect_for_layout(layout: vk::ImageLayout) -> vk::ImageAspectFlags {
    if layout == vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Every mip level and array layer of `aspect`.
pub fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: vk::REMAINING_MIP_LEVELS,
        base_array_layer: 0,
        layer_count: vk::REMAINING_ARRAY_LAYERS,
    }
}

/// The barrier `transition` records.
pub fn image_barrier(
    image: vk::Image,
    current_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> vk::ImageMemoryBarrier2 {
    vk::ImageMemoryBarrier2::builder()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_WRITE | vk::AccessFlags2::MEMORY_READ)
        .old_layout(current_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(subresource_range(aspect_for_layout(new_layout)))
        .image(image)
        .build()
}

/// Move `image` from `current_layout` to `new_layout`.
///
/// `current_layout` must be the layout the image really is in when the
/// barrier executes; nothing here checks it.
pub fn transition<G: Gpu + ?Sized>(
    gpu: &G,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    current_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    gpu.cmd_image_barrier(cmd, &image_barrier(image, current_layout, new_layout));
}

fn far_corner(extent: vk::Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Whole source region onto whole destination region.
pub fn blit_region(src_extent: vk::Extent2D, dst_extent: vk::Extent2D) -> vk::ImageBlit2 {
    vk::ImageBlit2::builder()
        .src_subresource(color_layers())
        .src_offsets([vk::Offset3D::default(), far_corner(src_extent)])
        .dst_subresource(color_layers())
        .dst_offsets([vk::Offset3D::default(), far_corner(dst_extent)])
        .build()
}

/// Scale-blit `src` into `dst`.
///
/// `src` must be in TRANSFER_SRC_OPTIMAL and `dst` in TRANSFER_DST_OPTIMAL.
pub fn copy<G: Gpu + ?Sized>(
    gpu: &G,
    cmd: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    src_extent: vk::Extent2D,
    dst_extent: vk::Extent2D,
) {
    gpu.cmd_blit_image(
        cmd,
        src,
        dst,
        &blit_region(src_extent, dst_extent),
        vk::Filter::LINEAR,
    );
}

/// Image + view + backing allocation from the memory allocator.
pub struct AllocatedImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    allocation: Option<Allocation>,
}

impl AllocatedImage {
    /// Create a device-local 2D image with one mip level and a full view.
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        extent: vk::Extent3D,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = {
            let mut allocator = device.allocator();
            let allocator = allocator.as_mut().context("Memory allocator already destroyed")?;
            allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(EngineError::from(e))
                    .with_context(|| format!("Failed to allocate memory for '{}'", name));
            }
        };

        let mut allocated = Self {
            image,
            view: vk::ImageView::null(),
            extent,
            format,
            allocation: Some(allocation),
        };

        let bound = unsafe {
            let allocation = allocated.allocation.as_ref().context("allocation missing")?;
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            allocated.destroy(device);
            return Err(e).with_context(|| format!("Failed to bind memory for '{}'", name));
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        match unsafe { device.device.create_image_view(&view_info, None) } {
            Ok(view) => allocated.view = view,
            Err(e) => {
                allocated.destroy(device);
                return Err(e).with_context(|| format!("Failed to create view for '{}'", name));
            }
        }

        log::debug!(
            "Allocated image '{}': {}x{} {:?}",
            name,
            extent.width,
            extent.height,
            format
        );
        Ok(allocated)
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    /// Destroy the view, the image, then hand the memory back.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            if self.view != vk::ImageView::null() {
                device.device.destroy_image_view(self.view, None);
                self.view = vk::ImageView::null();
            }
            if self.image != vk::Image::null() {
                device.device.destroy_image(self.image, None);
                self.image = vk::Image::null();
            }
        }

        if let Some(allocation) = self.allocation.take() {
            match device.allocator().as_mut() {
                Some(allocator) => {
                    if let Err(e) = allocator.free(allocation) {
                        log::error!("Failed to free image memory: {}", e);
                    }
                }
                None => log::warn!("Allocator gone before image memory was freed"),
            }
        }
    }
}
