// SPDX-License-Identifier: CEPL-1.0
use crate::device::Device;
use crate::error::{CheckVk, VkError, VkResult};
use crate::frame::{Acquired, PresentStatus};
use ash::vk;
use ember_render::{RenderSize, VsyncMode};
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Copy, Debug)]
pub struct SwapchainPrefs {
    pub size: RenderSize,
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
}

// Info only
fn pm_name(m: vk::PresentModeKHR) -> &'static str {
    match m {
        vk::PresentModeKHR::FIFO => "FIFO",
        vk::PresentModeKHR::MAILBOX => "MAILBOX",
        vk::PresentModeKHR::IMMEDIATE => "IMMEDIATE",
        vk::PresentModeKHR::FIFO_RELAXED => "FIFO_RELAXED",
        _ => "OTHER",
    }
}

pub(crate) fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    mode: VsyncMode,
) -> vk::PresentModeKHR {
    let order: &[vk::PresentModeKHR] = match (vsync, mode) {
        (false, _) => &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX],
        (true, VsyncMode::Mailbox) => &[vk::PresentModeKHR::MAILBOX],
        (true, VsyncMode::Fifo) => &[],
    };
    order
        .iter()
        .copied()
        .find(|m| modes.contains(m))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub(crate) fn extent_from_caps(caps: &vk::SurfaceCapabilitiesKHR, want: RenderSize) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: want
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: want
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Plain 8-bit UNORM first; the composite pass writes display-ready values.
pub(crate) fn pick_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    [
        vk::Format::B8G8R8A8_UNORM,
        vk::Format::R8G8B8A8_UNORM,
        vk::Format::B8G8R8A8_SRGB,
    ]
    .into_iter()
    .find_map(|want| formats.iter().copied().find(|f| f.format == want))
    .or_else(|| formats.first().copied())
}

pub(crate) fn image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    // One more than minimum, capped by max (0 == "no max").
    if caps.max_image_count == 0 {
        caps.min_image_count + 1
    } else {
        (caps.min_image_count + 1).min(caps.max_image_count)
    }
}

pub struct Swapchain {
    device: Arc<Device>,
    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

impl Swapchain {
    pub fn new(device: Arc<Device>, prefs: &SwapchainPrefs) -> VkResult<Self> {
        let mut sc = Self {
            device,
            handle: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            images: Vec::new(),
            views: Vec::new(),
        };
        sc.recreate(prefs)?;
        Ok(sc)
    }

    /// Caller must have waited for the device to go idle and destroyed
    /// every framebuffer that references the current views.
    pub fn recreate(&mut self, prefs: &SwapchainPrefs) -> VkResult<()> {
        let d = self.device.raw();
        let surf_i = self.device.surface_loader();
        let phys = self.device.physical();
        let surface = self.device.surface();

        // 1) Views of the old generation
        for iv in self.views.drain(..) {
            unsafe { d.destroy_image_view(iv, None) };
        }
        self.images.clear();

        // 2) Query surface state
        let caps = unsafe { surf_i.get_physical_device_surface_capabilities(phys, surface) }
            .check("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let formats = unsafe { surf_i.get_physical_device_surface_formats(phys, surface) }
            .check("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let modes = unsafe { surf_i.get_physical_device_surface_present_modes(phys, surface) }
            .check("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        let surf_format = pick_surface_format(&formats).ok_or(VkError::Api {
            call: "vkGetPhysicalDeviceSurfaceFormatsKHR",
            result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        })?;
        let present_mode = choose_present_mode(&modes, prefs.vsync, prefs.vsync_mode);
        let extent = extent_from_caps(&caps, prefs.size);
        let min_count = image_count(&caps);

        let pre_transform = if caps
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            caps.current_transform
        };

        let families = self.device.families();
        let family_indices = [families.graphics, families.present];
        let (sharing_mode, index_count) = if families.graphics != families.present {
            (vk::SharingMode::CONCURRENT, 2)
        } else {
            (vk::SharingMode::EXCLUSIVE, 0)
        };

        // 3) New swapchain, handing over the old one
        let old = self.handle;
        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface,
            min_image_count: min_count,
            image_format: surf_format.format,
            image_color_space: surf_format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: index_count,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: old,
            ..Default::default()
        };
        let loader = self.device.swapchain_loader();
        let created = unsafe { loader.create_swapchain(&swap_info, None) };
        if old != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(old, None) };
            self.handle = vk::SwapchainKHR::null();
        }
        self.handle = created.check("vkCreateSwapchainKHR")?;
        self.images =
            unsafe { loader.get_swapchain_images(self.handle) }.check("vkGetSwapchainImagesKHR")?;

        // 4) Views
        for &image in &self.images {
            let iv_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: surf_format.format,
                subresource_range: color_range(),
                ..Default::default()
            };
            let view = unsafe { d.create_image_view(&iv_info, None) }.check("vkCreateImageView")?;
            self.views.push(view);
        }

        self.format = surf_format;
        self.extent = extent;
        self.present_mode = present_mode;
        info!(
            "vk: swapchain {}x{} format={:?} present_mode={} images={}",
            extent.width,
            extent.height,
            surf_format.format,
            pm_name(present_mode),
            self.images.len()
        );
        Ok(())
    }

    pub fn acquire(&self, signal: vk::Semaphore) -> VkResult<Acquired> {
        let res = unsafe {
            self.device.swapchain_loader().acquire_next_image(
                self.handle,
                u64::MAX,
                signal,
                vk::Fence::null(),
            )
        };
        match res {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(e) => Err(VkError::Api {
                call: "vkAcquireNextImageKHR",
                result: e,
            }),
        }
    }

    pub fn present(&self, wait: vk::Semaphore, index: u32) -> VkResult<PresentStatus> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.handle,
            p_image_indices: &index,
            ..Default::default()
        };
        let res = unsafe {
            self.device
                .swapchain_loader()
                .queue_present(self.device.present_queue(), &present)
        };
        match res {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => Ok(PresentStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentStatus::OutOfDate),
            Err(e) => Err(VkError::Api {
                call: "vkQueuePresentKHR",
                result: e,
            }),
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }
    pub fn format(&self) -> vk::Format {
        self.format.format
    }
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }
    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

pub(crate) fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            let d = self.device.raw();
            for &iv in &self.views {
                d.destroy_image_view(iv, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                self.device
                    .swapchain_loader()
                    .destroy_swapchain(self.handle, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn unorm_formats_win_over_srgb() {
        let formats = [
            fmt(vk::Format::B8G8R8A8_SRGB),
            fmt(vk::Format::R8G8B8A8_UNORM),
        ];
        assert_eq!(
            pick_surface_format(&formats).unwrap().format,
            vk::Format::R8G8B8A8_UNORM
        );
        let odd = [fmt(vk::Format::A2B10G10R10_UNORM_PACK32)];
        assert_eq!(
            pick_surface_format(&odd).unwrap().format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
        assert!(pick_surface_format(&[]).is_none());
    }

    #[test]
    fn present_mode_follows_vsync_preferences() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(
            choose_present_mode(&all, false, VsyncMode::Mailbox),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&all, true, VsyncMode::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&all, true, VsyncMode::Fifo),
            vk::PresentModeKHR::FIFO
        );
        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, false, VsyncMode::Mailbox),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_uses_current_or_clamps_request() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let want = RenderSize {
            width: 4000,
            height: 300,
        };
        assert_eq!(extent_from_caps(&caps, want).width, 640);
        caps.current_extent.width = u32::MAX;
        let e = extent_from_caps(&caps, want);
        assert_eq!((e.width, e.height), (1920, 300));
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(image_count(&caps), 2);
    }
}
