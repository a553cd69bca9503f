// SPDX-License-Identifier: CEPL-1.0
use crate::device::Device;
use crate::error::{CheckVk, VkResult};
use ash::vk;
use std::sync::Arc;
use tracing::{info, warn};

pub const MAX_TEXTURES: u32 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerKind {
    Nearest,
    Linear,
    MipmapNearest,
    MipmapLinear,
    AnisoNearest,
    AnisoLinear,
    AnisoMipmapNearest,
    AnisoMipmapLinear,
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 8] = [
        SamplerKind::Nearest,
        SamplerKind::Linear,
        SamplerKind::MipmapNearest,
        SamplerKind::MipmapLinear,
        SamplerKind::AnisoNearest,
        SamplerKind::AnisoLinear,
        SamplerKind::AnisoMipmapNearest,
        SamplerKind::AnisoMipmapLinear,
    ];

    fn linear(self) -> bool {
        matches!(
            self,
            SamplerKind::Linear
                | SamplerKind::MipmapLinear
                | SamplerKind::AnisoLinear
                | SamplerKind::AnisoMipmapLinear
        )
    }

    fn mipmapped(self) -> bool {
        matches!(
            self,
            SamplerKind::MipmapNearest
                | SamplerKind::MipmapLinear
                | SamplerKind::AnisoMipmapNearest
                | SamplerKind::AnisoMipmapLinear
        )
    }

    fn anisotropic(self) -> bool {
        matches!(
            self,
            SamplerKind::AnisoNearest
                | SamplerKind::AnisoLinear
                | SamplerKind::AnisoMipmapNearest
                | SamplerKind::AnisoMipmapLinear
        )
    }
}

/// `max_anisotropy` is `None` when the device lacks sampler anisotropy;
/// anisotropic kinds then degrade to their plain counterparts.
pub(crate) fn sampler_info(
    kind: SamplerKind,
    max_anisotropy: Option<f32>,
) -> vk::SamplerCreateInfo<'static> {
    let (filter, mipmap_mode) = if kind.linear() {
        (vk::Filter::LINEAR, vk::SamplerMipmapMode::LINEAR)
    } else {
        (vk::Filter::NEAREST, vk::SamplerMipmapMode::NEAREST)
    };
    let aniso = if kind.anisotropic() { max_anisotropy } else { None };
    vk::SamplerCreateInfo {
        s_type: vk::StructureType::SAMPLER_CREATE_INFO,
        mag_filter: filter,
        min_filter: filter,
        mipmap_mode,
        address_mode_u: vk::SamplerAddressMode::REPEAT,
        address_mode_v: vk::SamplerAddressMode::REPEAT,
        address_mode_w: vk::SamplerAddressMode::REPEAT,
        mip_lod_bias: 0.0,
        anisotropy_enable: aniso.is_some() as vk::Bool32,
        max_anisotropy: aniso.unwrap_or(1.0),
        compare_enable: vk::FALSE,
        compare_op: vk::CompareOp::ALWAYS,
        min_lod: 0.0,
        max_lod: if kind.mipmapped() { f32::MAX } else { 1.0 },
        border_color: vk::BorderColor::INT_OPAQUE_BLACK,
        unnormalized_coordinates: vk::FALSE,
        ..Default::default()
    }
}

fn layout_binding(
    ty: vk::DescriptorType,
    stage: vk::ShaderStageFlags,
) -> vk::DescriptorSetLayoutBinding<'static> {
    vk::DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: ty,
        descriptor_count: 1,
        stage_flags: stage,
        ..Default::default()
    }
}

fn create_layout(
    device: &Device,
    binding: vk::DescriptorSetLayoutBinding<'_>,
) -> VkResult<vk::DescriptorSetLayout> {
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: 1,
        p_bindings: &binding,
        ..Default::default()
    };
    unsafe { device.raw().create_descriptor_set_layout(&ci, None) }
        .check("vkCreateDescriptorSetLayout")
}

#[derive(Clone, Copy, Debug)]
pub struct SetLayouts {
    /// Dynamic uniform buffer, vertex stage.
    pub ubo: vk::DescriptorSetLayout,
    /// Combined image sampler, fragment stage.
    pub sampler: vk::DescriptorSetLayout,
    pub lightmap: vk::DescriptorSetLayout,
    /// Input attachment, fragment stage.
    pub input_attachment: vk::DescriptorSetLayout,
}

/// Set layouts, the shared descriptor pool and the sampler table.
pub struct Descriptors {
    device: Arc<Device>,
    layouts: SetLayouts,
    pool: vk::DescriptorPool,
    samplers: [vk::Sampler; 8],
}

impl Descriptors {
    pub fn new(device: Arc<Device>) -> VkResult<Self> {
        let mut d = Self {
            device,
            layouts: SetLayouts {
                ubo: vk::DescriptorSetLayout::null(),
                sampler: vk::DescriptorSetLayout::null(),
                lightmap: vk::DescriptorSetLayout::null(),
                input_attachment: vk::DescriptorSetLayout::null(),
            },
            pool: vk::DescriptorPool::null(),
            samplers: [vk::Sampler::null(); 8],
        };
        // partially built state is released by Drop on error
        let frag = vk::ShaderStageFlags::FRAGMENT;
        d.layouts.ubo = create_layout(
            &d.device,
            layout_binding(
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                vk::ShaderStageFlags::VERTEX,
            ),
        )?;
        d.layouts.sampler = create_layout(
            &d.device,
            layout_binding(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, frag),
        )?;
        d.layouts.lightmap = create_layout(
            &d.device,
            layout_binding(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, frag),
        )?;
        d.layouts.input_attachment = create_layout(
            &d.device,
            layout_binding(vk::DescriptorType::INPUT_ATTACHMENT, frag),
        )?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: 16,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: MAX_TEXTURES + 2,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::INPUT_ATTACHMENT,
                descriptor_count: 1,
            },
        ];
        let pool_ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
            max_sets: MAX_TEXTURES + 32,
            pool_size_count: pool_sizes.len() as u32,
            p_pool_sizes: pool_sizes.as_ptr(),
            ..Default::default()
        };
        d.pool = unsafe { d.device.raw().create_descriptor_pool(&pool_ci, None) }
            .check("vkCreateDescriptorPool")?;

        let max_aniso = if d.device.features().sampler_anisotropy {
            Some(d.device.limits().max_sampler_anisotropy)
        } else {
            warn!("vk: sampler anisotropy unsupported; aniso samplers fall back to plain filtering");
            None
        };
        for kind in SamplerKind::ALL {
            let ci = sampler_info(kind, max_aniso);
            d.samplers[kind as usize] =
                unsafe { d.device.raw().create_sampler(&ci, None) }.check("vkCreateSampler")?;
        }
        info!("vk: descriptor pool ready ({} texture sets)", MAX_TEXTURES);
        Ok(d)
    }

    pub fn layouts(&self) -> SetLayouts {
        self.layouts
    }

    pub fn pool(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn sampler(&self, kind: SamplerKind) -> vk::Sampler {
        self.samplers[kind as usize]
    }

    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> VkResult<vk::DescriptorSet> {
        allocate_set(&self.device, self.pool, layout)
    }

    pub fn free(&self, set: vk::DescriptorSet) {
        free_set(&self.device, self.pool, set);
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        unsafe {
            let d = self.device.raw();
            for &s in &self.samplers {
                if s != vk::Sampler::null() {
                    d.destroy_sampler(s, None);
                }
            }
            if self.pool != vk::DescriptorPool::null() {
                d.destroy_descriptor_pool(self.pool, None);
            }
            for l in [
                self.layouts.ubo,
                self.layouts.sampler,
                self.layouts.lightmap,
                self.layouts.input_attachment,
            ] {
                if l != vk::DescriptorSetLayout::null() {
                    d.destroy_descriptor_set_layout(l, None);
                }
            }
        }
    }
}

pub(crate) fn allocate_set(
    device: &Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> VkResult<vk::DescriptorSet> {
    let alloc = vk::DescriptorSetAllocateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
        descriptor_pool: pool,
        descriptor_set_count: 1,
        p_set_layouts: &layout,
        ..Default::default()
    };
    let sets = unsafe { device.raw().allocate_descriptor_sets(&alloc) }
        .check("vkAllocateDescriptorSets")?;
    Ok(sets[0])
}

pub(crate) fn free_set(device: &Device, pool: vk::DescriptorPool, set: vk::DescriptorSet) {
    if let Err(e) = unsafe { device.raw().free_descriptor_sets(pool, &[set]) } {
        warn!("vk: free_descriptor_sets: {}", crate::error_to_string(e));
    }
}

pub(crate) fn write_dynamic_ubo(
    device: &Device,
    set: vk::DescriptorSet,
    buffer: vk::Buffer,
    range: u64,
) {
    let info = vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range,
    };
    let write = vk::WriteDescriptorSet {
        s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
        dst_set: set,
        dst_binding: 0,
        descriptor_count: 1,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        p_buffer_info: &info,
        ..Default::default()
    };
    unsafe { device.raw().update_descriptor_sets(&[write], &[]) };
}

pub(crate) fn write_image(
    device: &Device,
    set: vk::DescriptorSet,
    ty: vk::DescriptorType,
    view: vk::ImageView,
    sampler: vk::Sampler,
    layout: vk::ImageLayout,
) {
    let info = vk::DescriptorImageInfo {
        sampler,
        image_view: view,
        image_layout: layout,
    };
    let write = vk::WriteDescriptorSet {
        s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
        dst_set: set,
        dst_binding: 0,
        descriptor_count: 1,
        descriptor_type: ty,
        p_image_info: &info,
        ..Default::default()
    };
    unsafe { device.raw().update_descriptor_sets(&[write], &[]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_kinds_have_unbounded_lod() {
        for kind in SamplerKind::ALL {
            let ci = sampler_info(kind, Some(16.0));
            let expect = if kind.mipmapped() { f32::MAX } else { 1.0 };
            assert_eq!(ci.max_lod, expect, "{kind:?}");
            assert_eq!(ci.address_mode_u, vk::SamplerAddressMode::REPEAT);
        }
    }

    #[test]
    fn linear_kinds_filter_linearly() {
        let ci = sampler_info(SamplerKind::MipmapLinear, None);
        assert_eq!(ci.min_filter, vk::Filter::LINEAR);
        assert_eq!(ci.mipmap_mode, vk::SamplerMipmapMode::LINEAR);
        let ci = sampler_info(SamplerKind::MipmapNearest, None);
        assert_eq!(ci.mag_filter, vk::Filter::NEAREST);
    }

    #[test]
    fn anisotropy_only_on_aniso_kinds_and_when_supported() {
        let ci = sampler_info(SamplerKind::AnisoLinear, Some(16.0));
        assert_eq!(ci.anisotropy_enable, vk::TRUE);
        assert_eq!(ci.max_anisotropy, 16.0);

        let ci = sampler_info(SamplerKind::Linear, Some(16.0));
        assert_eq!(ci.anisotropy_enable, vk::FALSE);

        let ci = sampler_info(SamplerKind::AnisoMipmapNearest, None);
        assert_eq!(ci.anisotropy_enable, vk::FALSE);
        assert_eq!(ci.max_lod, f32::MAX);
    }
}
