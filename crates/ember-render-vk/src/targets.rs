// SPDX-License-Identifier: CEPL-1.0
//! Device-local images: the size-dependent offscreen targets and the
//! helpers textures are built from.

use crate::descriptors::{self, Descriptors, SamplerKind};
use crate::device::Device;
use crate::error::{CheckVk, VkResult};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use tracing::info;

pub struct ImageDesc<'a> {
    pub name: &'a str,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
    pub aspect: vk::ImageAspectFlags,
}

pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    allocation: Option<Allocation>,
}

impl GpuImage {
    pub fn new(device: &Device, desc: &ImageDesc<'_>) -> VkResult<Self> {
        let d = device.raw();
        let img_ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: desc.samples,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { d.create_image(&img_ci, None) }.check("vkCreateImage")?;
        let mut out = Self {
            image,
            view: vk::ImageView::null(),
            format: desc.format,
            extent: desc.extent,
            allocation: None,
        };

        let requirements = unsafe { d.get_image_memory_requirements(image) };
        let built = device
            .allocate(&AllocationCreateDesc {
                name: desc.name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .and_then(|a| {
                let bound = unsafe { d.bind_image_memory(image, a.memory(), a.offset()) };
                out.allocation = Some(a);
                bound.check("vkBindImageMemory")
            })
            .and_then(|()| {
                let view_ci = vk::ImageViewCreateInfo {
                    s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                    image,
                    view_type: vk::ImageViewType::TYPE_2D,
                    format: desc.format,
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask: desc.aspect,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    ..Default::default()
                };
                unsafe { d.create_image_view(&view_ci, None) }.check("vkCreateImageView")
            });
        match built {
            Ok(view) => {
                out.view = view;
                Ok(out)
            }
            Err(e) => {
                out.destroy(device);
                Err(e)
            }
        }
    }

    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            if self.view != vk::ImageView::null() {
                device.raw().destroy_image_view(self.view, None);
            }
            if self.image != vk::Image::null() {
                device.raw().destroy_image(self.image, None);
            }
        }
        self.view = vk::ImageView::null();
        self.image = vk::Image::null();
        if let Some(a) = self.allocation.take() {
            device.free(a);
        }
    }
}

/// First candidate the predicate accepts, else `fallback`.
pub(crate) fn first_supported(
    candidates: &[vk::Format],
    fallback: vk::Format,
    supported: impl Fn(vk::Format) -> bool,
) -> vk::Format {
    candidates
        .iter()
        .copied()
        .find(|&f| supported(f))
        .unwrap_or(fallback)
}

pub fn pick_depth_format(device: &Device) -> vk::Format {
    // Most to least precision
    let candidates = [
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::Format::D32_SFLOAT,
        vk::Format::D24_UNORM_S8_UINT,
        vk::Format::D16_UNORM_S8_UINT,
        vk::Format::D16_UNORM,
    ];
    first_supported(&candidates, vk::Format::D16_UNORM, |f| {
        device
            .format_properties(f)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

/// Offscreen attachments sized to the swapchain, plus the descriptor sets
/// that read them. Rebuilt wholesale on resize or sample-count change.
pub struct Targets {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
    /// World color (resolve target when MSAA is on).
    pub color: GpuImage,
    /// Output of the world-warp pass, composited in the UI pass.
    pub color_warp: GpuImage,
    pub depth: GpuImage,
    pub ui_depth: GpuImage,
    pub msaa: Option<GpuImage>,
    pub color_set: vk::DescriptorSet,
    pub color_warp_set: vk::DescriptorSet,
    pub input_set: vk::DescriptorSet,
}

impl Targets {
    pub fn new(
        device: Arc<Device>,
        descriptors: &Descriptors,
        extent: vk::Extent2D,
        color_format: vk::Format,
        depth_format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> VkResult<Self> {
        let color_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::INPUT_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED;
        let color_desc = |name| ImageDesc {
            name,
            extent,
            format: color_format,
            usage: color_usage,
            samples: vk::SampleCountFlags::TYPE_1,
            aspect: vk::ImageAspectFlags::COLOR,
        };
        let depth_desc = |name, samples| ImageDesc {
            name,
            extent,
            format: depth_format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            samples,
            aspect: vk::ImageAspectFlags::DEPTH,
        };

        let mut made: Vec<GpuImage> = Vec::with_capacity(5);
        let result = (|| -> VkResult<()> {
            made.push(GpuImage::new(&device, &color_desc("colorbuffer"))?);
            made.push(GpuImage::new(&device, &color_desc("colorbuffer warp"))?);
            made.push(GpuImage::new(&device, &depth_desc("depthbuffer", samples))?);
            made.push(GpuImage::new(
                &device,
                &depth_desc("ui depthbuffer", vk::SampleCountFlags::TYPE_1),
            )?);
            if samples != vk::SampleCountFlags::TYPE_1 {
                made.push(GpuImage::new(
                    &device,
                    &ImageDesc {
                        name: "msaa colorbuffer",
                        extent,
                        format: color_format,
                        usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                            | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                        samples,
                        aspect: vk::ImageAspectFlags::COLOR,
                    },
                )?);
            }
            Ok(())
        })();
        if let Err(e) = result {
            for mut img in made {
                img.destroy(&device);
            }
            return Err(e);
        }

        let mut it = made.into_iter();
        let (Some(color), Some(color_warp), Some(depth), Some(ui_depth)) =
            (it.next(), it.next(), it.next(), it.next())
        else {
            unreachable!("four targets pushed above");
        };
        let msaa = it.next();

        let mut t = Self {
            device,
            pool: descriptors.pool(),
            color,
            color_warp,
            depth,
            ui_depth,
            msaa,
            color_set: vk::DescriptorSet::null(),
            color_warp_set: vk::DescriptorSet::null(),
            input_set: vk::DescriptorSet::null(),
        };
        let layouts = descriptors.layouts();
        t.color_set = descriptors.allocate(layouts.sampler)?;
        t.color_warp_set = descriptors.allocate(layouts.sampler)?;
        t.input_set = descriptors.allocate(layouts.input_attachment)?;
        t.write_sets(descriptors.sampler(SamplerKind::Nearest));

        info!(
            "vk: offscreen targets {}x{} depth={:?} samples={:?}",
            extent.width, extent.height, depth_format, samples
        );
        Ok(t)
    }

    fn write_sets(&self, sampler: vk::Sampler) {
        let read = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        descriptors::write_image(
            &self.device,
            self.color_set,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            self.color.view,
            sampler,
            read,
        );
        descriptors::write_image(
            &self.device,
            self.color_warp_set,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            self.color_warp.view,
            sampler,
            read,
        );
        descriptors::write_image(
            &self.device,
            self.input_set,
            vk::DescriptorType::INPUT_ATTACHMENT,
            self.color_warp.view,
            vk::Sampler::null(),
            read,
        );
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.color.extent
    }
}

impl Drop for Targets {
    fn drop(&mut self) {
        for set in [self.color_set, self.color_warp_set, self.input_set] {
            if set != vk::DescriptorSet::null() {
                descriptors::free_set(&self.device, self.pool, set);
            }
        }
        let device = self.device.clone();
        self.color.destroy(&device);
        self.color_warp.destroy(&device);
        self.depth.destroy(&device);
        self.ui_depth.destroy(&device);
        if let Some(m) = self.msaa.as_mut() {
            m.destroy(&device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_probe_takes_first_supported() {
        let candidates = [
            vk::Format::D32_SFLOAT_S8_UINT,
            vk::Format::D32_SFLOAT,
            vk::Format::D24_UNORM_S8_UINT,
        ];
        let f = first_supported(&candidates, vk::Format::D16_UNORM, |f| {
            f == vk::Format::D32_SFLOAT || f == vk::Format::D24_UNORM_S8_UINT
        });
        assert_eq!(f, vk::Format::D32_SFLOAT);
    }

    #[test]
    fn depth_probe_falls_back_when_nothing_qualifies() {
        let f = first_supported(&[vk::Format::D32_SFLOAT], vk::Format::D16_UNORM, |_| false);
        assert_eq!(f, vk::Format::D16_UNORM);
    }
}
