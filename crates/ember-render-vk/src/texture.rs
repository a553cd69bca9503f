// SPDX-License-Identifier: CEPL-1.0
//! Device-local resources filled through the staging ring: sampled RGBA8
//! textures and static vertex/index buffers.

use crate::descriptors::{self, Descriptors, SamplerKind};
use crate::device::Device;
use crate::error::{CheckVk, VkError, VkResult};
use crate::staging::{StagingDevice, StagingRing};
use crate::targets::{GpuImage, ImageDesc};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

pub(crate) fn rgba_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

/// Rejects empty textures and texel data that does not match the extent,
/// before anything is allocated.
fn check_texture_size(width: u32, height: u32, len: usize) -> VkResult<()> {
    if width == 0 || height == 0 || len != rgba_len(width, height) {
        return Err(VkError::TextureSize { width, height, len });
    }
    Ok(())
}

pub struct Texture {
    image: GpuImage,
    descriptor_set: vk::DescriptorSet,
    sampler: SamplerKind,
}

impl Texture {
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    pub fn sampler(&self) -> SamplerKind {
        self.sampler
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.image.extent
    }

    pub fn view(&self) -> vk::ImageView {
        self.image.view
    }
}

fn layout_barrier(
    image: vk::Image,
    from: vk::ImageLayout,
    to: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier {
        s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
        src_access_mask: src_access,
        dst_access_mask: dst_access,
        old_layout: from,
        new_layout: to,
        src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
        image,
        subresource_range: crate::swapchain::color_range(),
        ..Default::default()
    }
}

pub(crate) fn create_texture<D: StagingDevice>(
    device: &Device,
    staging: &mut StagingRing<D>,
    descriptors: &Descriptors,
    width: u32,
    height: u32,
    rgba: &[u8],
    sampler: SamplerKind,
) -> VkResult<Texture> {
    check_texture_size(width, height, rgba.len())?;
    let mut image = GpuImage::new(
        device,
        &ImageDesc {
            name: "texture",
            extent: vk::Extent2D { width, height },
            format: TEXTURE_FORMAT,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            samples: vk::SampleCountFlags::TYPE_1,
            aspect: vk::ImageAspectFlags::COLOR,
        },
    )?;

    let recorded = (|| -> VkResult<()> {
        let region = staging.region(rgba.len() as u64, 4)?;
        region.write(rgba);
        let d = device.raw();
        let cmd = region.command_buffer;
        let copy = vk::BufferImageCopy {
            buffer_offset: region.offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        unsafe {
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[layout_barrier(
                    image.image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                )],
            );
            d.cmd_copy_buffer_to_image(
                cmd,
                region.buffer,
                image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
            d.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[layout_barrier(
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                )],
            );
        }
        Ok(())
    })();
    if let Err(e) = recorded {
        image.destroy(device);
        return Err(e);
    }

    let set = match descriptors.allocate(descriptors.layouts().sampler) {
        Ok(set) => set,
        Err(e) => {
            image.destroy(device);
            return Err(e);
        }
    };
    let tex = Texture {
        image,
        descriptor_set: set,
        sampler,
    };
    write_texture_set(device, descriptors, &tex, sampler);
    Ok(tex)
}

fn write_texture_set(device: &Device, descriptors: &Descriptors, tex: &Texture, kind: SamplerKind) {
    descriptors::write_image(
        device,
        tex.descriptor_set,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        tex.image.view,
        descriptors.sampler(kind),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );
}

/// Points the texture's descriptor at another sampler. The set must not be in
/// use by a frame still recording.
pub(crate) fn update_texture_sampler(
    device: &Device,
    descriptors: &Descriptors,
    tex: &mut Texture,
    kind: SamplerKind,
) -> vk::Sampler {
    write_texture_set(device, descriptors, tex, kind);
    tex.sampler = kind;
    descriptors.sampler(kind)
}

/// Caller guarantees no submitted frame still samples the texture.
pub(crate) fn destroy_texture(device: &Device, descriptors: &Descriptors, mut tex: Texture) {
    descriptors.free(tex.descriptor_set);
    tex.image.destroy(device);
}

/// Immutable device-local buffer.
pub struct StaticBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
    allocation: Option<Allocation>,
}

impl StaticBuffer {
    pub fn upload<D: StagingDevice>(
        device: &Device,
        staging: &mut StagingRing<D>,
        usage: vk::BufferUsageFlags,
        name: &str,
        bytes: &[u8],
    ) -> VkResult<Self> {
        let d = device.raw();
        let size = bytes.len() as u64;
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let mut out = Self {
            buffer: unsafe { d.create_buffer(&bci, None) }.check("vkCreateBuffer")?,
            size,
            allocation: None,
        };
        let made = (|| -> VkResult<()> {
            let requirements = unsafe { d.get_buffer_memory_requirements(out.buffer) };
            let allocation = device.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;
            let bound =
                unsafe { d.bind_buffer_memory(out.buffer, allocation.memory(), allocation.offset()) };
            out.allocation = Some(allocation);
            bound.check("vkBindBufferMemory")?;

            let region = staging.region(size, 4)?;
            region.write(bytes);
            let copy = vk::BufferCopy {
                src_offset: region.offset,
                dst_offset: 0,
                size,
            };
            unsafe { d.cmd_copy_buffer(region.command_buffer, region.buffer, out.buffer, &[copy]) };
            Ok(())
        })();
        match made {
            Ok(()) => Ok(out),
            Err(e) => {
                out.destroy(device);
                Err(e)
            }
        }
    }

    pub fn destroy(&mut self, device: &Device) {
        if self.buffer != vk::Buffer::null() {
            unsafe { device.raw().destroy_buffer(self.buffer, None) };
            self.buffer = vk::Buffer::null();
        }
        if let Some(a) = self.allocation.take() {
            device.free(a);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_len_is_four_bytes_per_texel() {
        assert_eq!(rgba_len(1, 1), 4);
        assert_eq!(rgba_len(256, 128), 131_072);
        assert_eq!(rgba_len(0, 64), 0);
    }

    #[test]
    fn texture_size_must_match_texels() {
        assert!(check_texture_size(4, 2, 32).is_ok());
        assert!(check_texture_size(1, 1, 4).is_ok());
        for (w, h, len) in [(0, 4, 0), (4, 0, 0), (0, 0, 0), (4, 2, 31), (4, 2, 33), (2, 2, 0)] {
            match check_texture_size(w, h, len) {
                Err(VkError::TextureSize { width, height, len: got }) => {
                    assert_eq!((width, height, got), (w, h, len));
                }
                other => panic!("{w}x{h} with {len} bytes: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn size_mismatch_reports_dimensions() {
        let err = VkError::TextureSize {
            width: 2,
            height: 2,
            len: 15,
        };
        assert_eq!(err.to_string(), "texture 2x2 expects RGBA8 data, got 15 bytes");
        assert!(!err.is_fatal());
    }
}
