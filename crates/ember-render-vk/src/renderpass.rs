// SPDX-License-Identifier: CEPL-1.0
//! The three renderpasses a frame walks through: World (3D scene, optional
//! MSAA resolve), WorldWarp (fullscreen distortion of the world image) and
//! Ui (HUD subpass, then a composite subpass into the swapchain image).

use crate::device::Device;
use crate::error::{CheckVk, VkResult};
use crate::targets::Targets;
use ash::vk;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RenderpassKind {
    World,
    Ui,
    WorldWarp,
}

impl RenderpassKind {
    pub const ALL: [RenderpassKind; 3] =
        [RenderpassKind::World, RenderpassKind::Ui, RenderpassKind::WorldWarp];

    pub fn index(self) -> usize {
        match self {
            RenderpassKind::World => 0,
            RenderpassKind::Ui => 1,
            RenderpassKind::WorldWarp => 2,
        }
    }

    /// Position in the per-frame chain World -> WorldWarp -> Ui.
    pub fn order(self) -> u8 {
        match self {
            RenderpassKind::World => 0,
            RenderpassKind::WorldWarp => 1,
            RenderpassKind::Ui => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RenderpassKind::World => "world",
            RenderpassKind::Ui => "ui",
            RenderpassKind::WorldWarp => "world-warp",
        }
    }
}

pub(crate) fn sample_count_flags(samples: u32) -> Option<vk::SampleCountFlags> {
    Some(match samples {
        1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        64 => vk::SampleCountFlags::TYPE_64,
        _ => return None,
    })
}

/// Maps a requested MSAA level onto what the device supports for both color
/// and depth framebuffers. Unsupported levels fall back to single sampling.
pub fn resolve_sample_count(requested: u32, supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    let requested = requested.max(1);
    match sample_count_flags(requested) {
        Some(flags) if supported.contains(flags) => flags,
        _ => {
            if requested > 1 {
                info!("vk: {requested}x MSAA not supported, using 1x");
            }
            vk::SampleCountFlags::TYPE_1
        }
    }
}

fn external_dependencies() -> [vk::SubpassDependency; 2] {
    [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::SHADER_READ,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
    ]
}

/// Ui subpass 0 loads the color the warp pass wrote; subpass 1 reads the
/// HUD result as an input attachment.
fn ui_dependencies() -> [vk::SubpassDependency; 2] {
    [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::SHADER_READ,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: 1,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::INPUT_ATTACHMENT_READ,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
    ]
}

fn attachment(
    format: vk::Format,
    samples: vk::SampleCountFlags,
    load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
    initial: vk::ImageLayout,
    final_layout: vk::ImageLayout,
) -> vk::AttachmentDescription {
    vk::AttachmentDescription {
        flags: vk::AttachmentDescriptionFlags::empty(),
        format,
        samples,
        load_op,
        store_op,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: initial,
        final_layout,
    }
}

fn reference(index: u32, layout: vk::ImageLayout) -> vk::AttachmentReference {
    vk::AttachmentReference {
        attachment: index,
        layout,
    }
}

const COLOR_OPTIMAL: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
const DEPTH_OPTIMAL: vk::ImageLayout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
const READ_ONLY: vk::ImageLayout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

/// World attachments: resolved color, depth, and (MSAA only) the
/// multisampled color target. With MSAA the multisampled image is drawn to
/// and resolved into attachment 0.
pub(crate) fn world_attachments(
    color: vk::Format,
    depth: vk::Format,
    samples: vk::SampleCountFlags,
    color_load: vk::AttachmentLoadOp,
) -> Vec<vk::AttachmentDescription> {
    let msaa = samples != vk::SampleCountFlags::TYPE_1;
    let mut out = vec![
        attachment(
            color,
            vk::SampleCountFlags::TYPE_1,
            if msaa { vk::AttachmentLoadOp::DONT_CARE } else { color_load },
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            COLOR_OPTIMAL,
        ),
        attachment(
            depth,
            samples,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::UNDEFINED,
            DEPTH_OPTIMAL,
        ),
    ];
    if msaa {
        out.push(attachment(
            color,
            samples,
            color_load,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::UNDEFINED,
            COLOR_OPTIMAL,
        ));
    }
    out
}

pub(crate) fn warp_attachments(color: vk::Format) -> [vk::AttachmentDescription; 2] {
    [
        attachment(
            color,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::LOAD,
            vk::AttachmentStoreOp::DONT_CARE,
            COLOR_OPTIMAL,
            COLOR_OPTIMAL,
        ),
        // fully overwritten by the warp draw
        attachment(
            color,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::DONT_CARE,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            COLOR_OPTIMAL,
        ),
    ]
}

pub(crate) fn ui_attachments(
    color: vk::Format,
    depth: vk::Format,
    swapchain: vk::Format,
) -> [vk::AttachmentDescription; 3] {
    [
        attachment(
            color,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::LOAD,
            vk::AttachmentStoreOp::DONT_CARE,
            COLOR_OPTIMAL,
            COLOR_OPTIMAL,
        ),
        attachment(
            depth,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::DONT_CARE,
            vk::ImageLayout::UNDEFINED,
            DEPTH_OPTIMAL,
        ),
        attachment(
            swapchain,
            vk::SampleCountFlags::TYPE_1,
            vk::AttachmentLoadOp::DONT_CARE,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ),
    ]
}

/// Clear values in attachment order, trimmed to the pass's attachment count.
pub fn clear_values(kind: RenderpassKind, msaa: bool, color: [f32; 4]) -> Vec<vk::ClearValue> {
    let color = vk::ClearValue {
        color: vk::ClearColorValue { float32: color },
    };
    let depth = vk::ClearValue {
        depth_stencil: vk::ClearDepthStencilValue {
            depth: 1.0,
            stencil: 0,
        },
    };
    let all = [color, depth, color];
    let count = match kind {
        RenderpassKind::World if msaa => 3,
        RenderpassKind::World | RenderpassKind::Ui => 2,
        RenderpassKind::WorldWarp => 1,
    };
    all[..count].to_vec()
}

pub struct Renderpasses {
    device: Arc<Device>,
    passes: [vk::RenderPass; 3],
    samples: vk::SampleCountFlags,
}

impl Renderpasses {
    pub fn new(
        device: Arc<Device>,
        color: vk::Format,
        depth: vk::Format,
        swapchain: vk::Format,
        samples: vk::SampleCountFlags,
        clear_color: bool,
    ) -> VkResult<Self> {
        let mut out = Self {
            device,
            passes: [vk::RenderPass::null(); 3],
            samples,
        };
        let color_load = if clear_color {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::DONT_CARE
        };
        let deps = external_dependencies();

        // World
        {
            let msaa = samples != vk::SampleCountFlags::TYPE_1;
            let atts = world_attachments(color, depth, samples, color_load);
            let color_ref = [reference(if msaa { 2 } else { 0 }, COLOR_OPTIMAL)];
            let resolve_ref = [reference(0, COLOR_OPTIMAL)];
            let depth_ref = reference(1, DEPTH_OPTIMAL);
            let mut subpass = vk::SubpassDescription::default()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .color_attachments(&color_ref)
                .depth_stencil_attachment(&depth_ref);
            if msaa {
                subpass = subpass.resolve_attachments(&resolve_ref);
            }
            let subpasses = [subpass];
            let ci = vk::RenderPassCreateInfo::default()
                .attachments(&atts)
                .subpasses(&subpasses)
                .dependencies(&deps);
            out.passes[RenderpassKind::World.index()] = out.create(&ci)?;
        }

        // WorldWarp
        {
            let atts = warp_attachments(color);
            let input_ref = [reference(0, READ_ONLY)];
            let color_ref = [reference(1, COLOR_OPTIMAL)];
            let subpasses = [vk::SubpassDescription::default()
                .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                .input_attachments(&input_ref)
                .color_attachments(&color_ref)];
            let ci = vk::RenderPassCreateInfo::default()
                .attachments(&atts)
                .subpasses(&subpasses)
                .dependencies(&deps);
            out.passes[RenderpassKind::WorldWarp.index()] = out.create(&ci)?;
        }

        // Ui: HUD over the warped world, then composite into the swapchain
        {
            let atts = ui_attachments(color, depth, swapchain);
            let hud_color = [reference(0, COLOR_OPTIMAL)];
            let hud_depth = reference(1, DEPTH_OPTIMAL);
            let composite_input = [reference(0, READ_ONLY)];
            let composite_color = [reference(2, COLOR_OPTIMAL)];
            let subpasses = [
                vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&hud_color)
                    .depth_stencil_attachment(&hud_depth),
                vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .input_attachments(&composite_input)
                    .color_attachments(&composite_color),
            ];
            let ui_deps = ui_dependencies();
            let ci = vk::RenderPassCreateInfo::default()
                .attachments(&atts)
                .subpasses(&subpasses)
                .dependencies(&ui_deps);
            out.passes[RenderpassKind::Ui.index()] = out.create(&ci)?;
        }

        info!("vk: renderpasses created (samples={:?})", samples);
        Ok(out)
    }

    fn create(&self, ci: &vk::RenderPassCreateInfo<'_>) -> VkResult<vk::RenderPass> {
        unsafe { self.device.raw().create_render_pass(ci, None) }.check("vkCreateRenderPass")
    }

    pub fn get(&self, kind: RenderpassKind) -> vk::RenderPass {
        self.passes[kind.index()]
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub fn msaa(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1
    }
}

impl Drop for Renderpasses {
    fn drop(&mut self) {
        for rp in self.passes {
            if rp != vk::RenderPass::null() {
                unsafe { self.device.raw().destroy_render_pass(rp, None) };
            }
        }
    }
}

/// One framebuffer per swapchain image for each pass, indexed by
/// [`RenderpassKind::index`].
pub struct Framebuffers {
    device: Arc<Device>,
    per_pass: [Vec<vk::Framebuffer>; 3],
}

impl Framebuffers {
    pub fn new(
        device: Arc<Device>,
        passes: &Renderpasses,
        targets: &Targets,
        swapchain_views: &[vk::ImageView],
    ) -> VkResult<Self> {
        let mut out = Self {
            device,
            per_pass: Default::default(),
        };
        let extent = targets.extent();

        let mut world = vec![targets.color.view, targets.depth.view];
        if let Some(msaa) = &targets.msaa {
            world.push(msaa.view);
        }
        let warp = [targets.color.view, targets.color_warp.view];
        // partially built sets are released by Drop on error
        for &view in swapchain_views {
            let ui = [targets.color_warp.view, targets.ui_depth.view, view];
            for (kind, views) in [
                (RenderpassKind::World, &world[..]),
                (RenderpassKind::WorldWarp, &warp[..]),
                (RenderpassKind::Ui, &ui[..]),
            ] {
                let fb = out.create(passes.get(kind), views, extent)?;
                out.per_pass[kind.index()].push(fb);
            }
        }
        Ok(out)
    }

    fn create(
        &self,
        pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        let ci = vk::FramebufferCreateInfo::default()
            .render_pass(pass)
            .attachments(views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe { self.device.raw().create_framebuffer(&ci, None) }.check("vkCreateFramebuffer")
    }

    pub fn get(&self, kind: RenderpassKind, image_index: u32) -> vk::Framebuffer {
        self.per_pass[kind.index()]
            .get(image_index as usize)
            .copied()
            .unwrap_or(vk::Framebuffer::null())
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        let d = self.device.raw();
        for fb in self.per_pass.iter_mut().flat_map(|v| v.drain(..)) {
            unsafe { d.destroy_framebuffer(fb, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLOR: vk::Format = vk::Format::B8G8R8A8_UNORM;
    const DEPTH: vk::Format = vk::Format::D32_SFLOAT;

    #[test]
    fn unsupported_msaa_falls_back_to_single_sample() {
        let supported = vk::SampleCountFlags::TYPE_1
            | vk::SampleCountFlags::TYPE_2
            | vk::SampleCountFlags::TYPE_4;
        assert_eq!(resolve_sample_count(4, supported), vk::SampleCountFlags::TYPE_4);
        assert_eq!(resolve_sample_count(8, supported), vk::SampleCountFlags::TYPE_1);
        assert_eq!(resolve_sample_count(3, supported), vk::SampleCountFlags::TYPE_1);
        assert_eq!(resolve_sample_count(0, supported), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn world_without_msaa_has_two_attachments() {
        let atts = world_attachments(COLOR, DEPTH, vk::SampleCountFlags::TYPE_1, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(atts.len(), 2);
        assert_eq!(atts[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(atts[0].store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(atts[1].samples, vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn world_with_msaa_clears_the_multisampled_target() {
        let s = vk::SampleCountFlags::TYPE_4;
        let atts = world_attachments(COLOR, DEPTH, s, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(atts.len(), 3);
        // resolve target is overwritten by the resolve
        assert_eq!(atts[0].load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(atts[0].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(atts[1].samples, s);
        assert_eq!(atts[2].samples, s);
        assert_eq!(atts[2].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(atts[2].store_op, vk::AttachmentStoreOp::DONT_CARE);
    }

    #[test]
    fn ui_pass_ends_presentable() {
        let atts = ui_attachments(COLOR, DEPTH, COLOR);
        assert_eq!(atts[0].load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(atts[2].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        let warp = warp_attachments(COLOR);
        assert_eq!(warp[0].load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(warp[1].store_op, vk::AttachmentStoreOp::STORE);
    }

    #[test]
    fn ui_load_waits_for_the_warp_output() {
        let [external, composite] = ui_dependencies();
        assert_eq!(external.src_subpass, vk::SUBPASS_EXTERNAL);
        assert!(external
            .src_access_mask
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
        assert!(external
            .dst_access_mask
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_READ));
        assert_eq!((composite.src_subpass, composite.dst_subpass), (0, 1));
        assert_eq!(composite.dst_access_mask, vk::AccessFlags::INPUT_ATTACHMENT_READ);
    }

    #[test]
    fn clear_value_counts_follow_attachments() {
        let c = [1.0, 0.0, 0.5, 1.0];
        assert_eq!(clear_values(RenderpassKind::World, true, c).len(), 3);
        assert_eq!(clear_values(RenderpassKind::World, false, c).len(), 2);
        assert_eq!(clear_values(RenderpassKind::Ui, true, c).len(), 2);
        assert_eq!(clear_values(RenderpassKind::WorldWarp, false, c).len(), 1);

        let v = clear_values(RenderpassKind::World, false, c);
        unsafe {
            assert_eq!(v[0].color.float32, c);
            assert_eq!(v[1].depth_stencil.depth, 1.0);
        }
    }

    #[test]
    fn chain_order_is_world_warp_ui() {
        let mut kinds = RenderpassKind::ALL;
        kinds.sort_by_key(|k| k.order());
        assert_eq!(
            kinds,
            [RenderpassKind::World, RenderpassKind::WorldWarp, RenderpassKind::Ui]
        );
    }
}
