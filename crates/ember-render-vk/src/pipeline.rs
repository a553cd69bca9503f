// SPDX-License-Identifier: CEPL-1.0
//! Fixed table of graphics pipelines, one per draw style, built once against
//! the renderpasses and rebuilt wholesale when those change.

use crate::descriptors::SetLayouts;
use crate::device::Device;
use crate::error::{CheckVk, VkError, VkResult};
use crate::renderpass::{RenderpassKind, Renderpasses};
use crate::shaders::{ShaderId, ShaderLibrary, ShaderModule, ShaderStage};
use ash::vk;
use std::sync::Arc;
use tracing::info;

/// Floats in the vertex-stage push-constant block.
pub const PUSH_CONSTANT_FLOATS: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexLayout {
    None,
    Rg,
    Rgb,
    RgRg,
    RgbRg,
    RgbRgb,
    RgbRgba,
    RgbRgRg,
    RgbRgbaRg,
}

impl VertexLayout {
    /// Float count of each attribute, in location order.
    pub fn components(self) -> &'static [u32] {
        match self {
            VertexLayout::None => &[],
            VertexLayout::Rg => &[2],
            VertexLayout::Rgb => &[3],
            VertexLayout::RgRg => &[2, 2],
            VertexLayout::RgbRg => &[3, 2],
            VertexLayout::RgbRgb => &[3, 3],
            VertexLayout::RgbRgba => &[3, 4],
            VertexLayout::RgbRgRg => &[3, 2, 2],
            VertexLayout::RgbRgbaRg => &[3, 4, 2],
        }
    }

    pub fn stride(self) -> u32 {
        self.components().iter().sum::<u32>() * 4
    }

    pub fn attributes(self) -> Vec<vk::VertexInputAttributeDescription> {
        let mut offset = 0;
        self.components()
            .iter()
            .enumerate()
            .map(|(location, &n)| {
                let attr = vk::VertexInputAttributeDescription {
                    location: location as u32,
                    binding: 0,
                    format: match n {
                        2 => vk::Format::R32G32_SFLOAT,
                        3 => vk::Format::R32G32B32_SFLOAT,
                        _ => vk::Format::R32G32B32A32_SFLOAT,
                    },
                    offset,
                };
                offset += n * 4;
                attr
            })
            .collect()
    }

    pub fn bindings(self) -> Vec<vk::VertexInputBindingDescription> {
        if self == VertexLayout::None {
            return Vec::new();
        }
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride(),
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }
}

/// Descriptor-set layouts a pipeline layout is built from, in set order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetLayoutCombo {
    Ubo,
    Sampler,
    SamplerUbo,
    SamplerUboLightmap,
    SamplerInputAttachment,
}

impl SetLayoutCombo {
    pub fn resolve(self, l: &SetLayouts) -> Vec<vk::DescriptorSetLayout> {
        match self {
            SetLayoutCombo::Ubo => vec![l.ubo],
            SetLayoutCombo::Sampler => vec![l.sampler],
            SetLayoutCombo::SamplerUbo => vec![l.sampler, l.ubo],
            SetLayoutCombo::SamplerUboLightmap => vec![l.sampler, l.ubo, l.lightmap],
            SetLayoutCombo::SamplerInputAttachment => vec![l.sampler, l.input_attachment],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    Alpha,
    Additive,
}

impl BlendMode {
    pub fn attachment(self) -> vk::PipelineColorBlendAttachmentState {
        let (src, dst) = match self {
            BlendMode::Additive => (vk::BlendFactor::ONE, vk::BlendFactor::ONE),
            _ => (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE_MINUS_SRC_ALPHA),
        };
        vk::PipelineColorBlendAttachmentState {
            blend_enable: (self != BlendMode::Opaque).into(),
            src_color_blend_factor: src,
            dst_color_blend_factor: dst,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: src,
            dst_alpha_blend_factor: dst,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineConfig {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub blend: BlendMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            depth_test: true,
            depth_write: true,
            blend: BlendMode::Opaque,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineDesc {
    pub vertex: ShaderId,
    pub fragment: ShaderId,
    pub layout: VertexLayout,
    pub sets: SetLayoutCombo,
    pub pass: RenderpassKind,
    pub subpass: u32,
    pub push_constants: bool,
    pub config: PipelineConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    TexQuad,
    ColorQuadWorld,
    ColorQuadUi,
    NullModel,
    ModelStripWorld,
    ModelStripUi,
    ModelFanWorld,
    ModelFanUi,
    NoDepthModelStrip,
    NoDepthModelFan,
    LefthandModelStrip,
    LefthandModelFan,
    Particles,
    PointParticles,
    Sprite,
    Polygon,
    PolygonLightmap,
    PolygonWarp,
    Beam,
    Skybox,
    DynamicLight,
    ShowTris,
    ShadowsStrip,
    ShadowsFan,
    PostProcess,
    WorldWarp,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 26] = [
        PipelineKind::TexQuad,
        PipelineKind::ColorQuadWorld,
        PipelineKind::ColorQuadUi,
        PipelineKind::NullModel,
        PipelineKind::ModelStripWorld,
        PipelineKind::ModelStripUi,
        PipelineKind::ModelFanWorld,
        PipelineKind::ModelFanUi,
        PipelineKind::NoDepthModelStrip,
        PipelineKind::NoDepthModelFan,
        PipelineKind::LefthandModelStrip,
        PipelineKind::LefthandModelFan,
        PipelineKind::Particles,
        PipelineKind::PointParticles,
        PipelineKind::Sprite,
        PipelineKind::Polygon,
        PipelineKind::PolygonLightmap,
        PipelineKind::PolygonWarp,
        PipelineKind::Beam,
        PipelineKind::Skybox,
        PipelineKind::DynamicLight,
        PipelineKind::ShowTris,
        PipelineKind::ShadowsStrip,
        PipelineKind::ShadowsFan,
        PipelineKind::PostProcess,
        PipelineKind::WorldWarp,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The color-quad pipeline drawing into `pass`. The warp pass has none.
    pub fn color_quad(pass: RenderpassKind) -> VkResult<PipelineKind> {
        match pass {
            RenderpassKind::World => Ok(PipelineKind::ColorQuadWorld),
            RenderpassKind::Ui => Ok(PipelineKind::ColorQuadUi),
            RenderpassKind::WorldWarp => Err(VkError::RenderpassOrder {
                requested: pass.name(),
            }),
        }
    }

    pub fn desc(self) -> PipelineDesc {
        use PipelineKind as K;
        use RenderpassKind::{Ui, World, WorldWarp as Warp};
        use SetLayoutCombo as S;
        use ShaderId as Sh;
        use VertexLayout as V;

        let strip = vk::PrimitiveTopology::TRIANGLE_STRIP;
        let base = PipelineConfig::default();
        let alpha = PipelineConfig {
            blend: BlendMode::Alpha,
            ..base
        };
        let overlay = PipelineConfig {
            depth_test: false,
            depth_write: false,
            cull_mode: vk::CullModeFlags::NONE,
            ..base
        };
        let d = |vertex, fragment, layout, sets, pass, config| PipelineDesc {
            vertex,
            fragment,
            layout,
            sets,
            pass,
            subpass: 0,
            push_constants: true,
            config,
        };

        match self {
            K::TexQuad => d(
                Sh::Basic,
                Sh::Basic,
                V::RgRg,
                S::SamplerUbo,
                Ui,
                PipelineConfig {
                    depth_test: false,
                    ..base
                },
            ),
            K::ColorQuadWorld | K::ColorQuadUi => d(
                Sh::BasicColorQuad,
                Sh::BasicColorQuad,
                V::Rg,
                S::Ubo,
                if self == K::ColorQuadUi { Ui } else { World },
                PipelineConfig {
                    depth_test: false,
                    ..alpha
                },
            ),
            K::NullModel => d(
                Sh::NullModel,
                Sh::BasicColorQuad,
                V::RgbRgb,
                S::Ubo,
                World,
                PipelineConfig {
                    cull_mode: vk::CullModeFlags::NONE,
                    ..base
                },
            ),
            K::ModelStripWorld | K::ModelStripUi | K::ModelFanWorld | K::ModelFanUi => {
                let fan = matches!(self, K::ModelFanWorld | K::ModelFanUi);
                let ui = matches!(self, K::ModelStripUi | K::ModelFanUi);
                d(
                    Sh::Model,
                    Sh::Model,
                    V::RgbRgbaRg,
                    S::SamplerUbo,
                    if ui { Ui } else { World },
                    PipelineConfig {
                        topology: if fan { base.topology } else { strip },
                        ..alpha
                    },
                )
            }
            K::NoDepthModelStrip | K::NoDepthModelFan => d(
                Sh::Model,
                Sh::Model,
                V::RgbRgbaRg,
                S::SamplerUbo,
                World,
                PipelineConfig {
                    topology: if self == K::NoDepthModelFan { base.topology } else { strip },
                    depth_write: false,
                    ..alpha
                },
            ),
            K::LefthandModelStrip | K::LefthandModelFan => d(
                Sh::Model,
                Sh::Model,
                V::RgbRgbaRg,
                S::SamplerUbo,
                World,
                PipelineConfig {
                    topology: if self == K::LefthandModelFan { base.topology } else { strip },
                    cull_mode: vk::CullModeFlags::FRONT,
                    ..base
                },
            ),
            K::Particles => d(
                Sh::Particle,
                Sh::Basic,
                V::RgbRgbaRg,
                S::Sampler,
                World,
                PipelineConfig {
                    depth_write: false,
                    ..alpha
                },
            ),
            K::PointParticles => d(
                Sh::PointParticle,
                Sh::PointParticle,
                V::RgbRgba,
                S::Ubo,
                World,
                PipelineConfig {
                    topology: vk::PrimitiveTopology::POINT_LIST,
                    depth_write: false,
                    ..alpha
                },
            ),
            K::Sprite => d(Sh::Sprite, Sh::Basic, V::RgbRg, S::Sampler, World, alpha),
            K::Polygon => d(Sh::Polygon, Sh::Basic, V::RgbRg, S::SamplerUbo, World, alpha),
            K::PolygonLightmap => d(
                Sh::PolygonLightmap,
                Sh::PolygonLightmap,
                V::RgbRgRg,
                S::SamplerUboLightmap,
                World,
                base,
            ),
            K::PolygonWarp => d(Sh::PolygonWarp, Sh::Basic, V::RgbRg, S::SamplerUbo, World, alpha),
            K::Beam => d(
                Sh::Beam,
                Sh::BasicColorQuad,
                V::Rgb,
                S::Ubo,
                World,
                PipelineConfig {
                    topology: strip,
                    depth_write: false,
                    ..alpha
                },
            ),
            K::Skybox => d(Sh::Skybox, Sh::Basic, V::RgbRg, S::SamplerUbo, World, base),
            K::DynamicLight => d(
                Sh::DynamicLight,
                Sh::BasicColorQuad,
                V::RgbRgb,
                S::Ubo,
                World,
                PipelineConfig {
                    depth_write: false,
                    cull_mode: vk::CullModeFlags::FRONT,
                    blend: BlendMode::Additive,
                    ..base
                },
            ),
            K::ShowTris => d(
                Sh::DynamicLight,
                Sh::BasicColorQuad,
                V::RgbRgb,
                S::Ubo,
                World,
                PipelineConfig {
                    topology: vk::PrimitiveTopology::LINE_STRIP,
                    ..overlay
                },
            ),
            K::ShadowsStrip | K::ShadowsFan => d(
                Sh::Shadows,
                Sh::BasicColorQuad,
                V::Rgb,
                S::Ubo,
                World,
                PipelineConfig {
                    topology: if self == K::ShadowsFan { base.topology } else { strip },
                    ..alpha
                },
            ),
            K::PostProcess => PipelineDesc {
                subpass: 1,
                push_constants: false,
                ..d(
                    Sh::PostProcess,
                    Sh::PostProcess,
                    V::None,
                    S::SamplerInputAttachment,
                    Ui,
                    overlay,
                )
            },
            K::WorldWarp => d(
                Sh::WorldWarp,
                Sh::WorldWarp,
                V::None,
                S::SamplerInputAttachment,
                Warp,
                overlay,
            ),
        }
    }
}

/// Every (module, stage) pair the pipeline table references.
pub fn required_shaders() -> Vec<(ShaderId, ShaderStage)> {
    let mut out: Vec<_> = PipelineKind::ALL
        .iter()
        .flat_map(|k| {
            let d = k.desc();
            [(d.vertex, ShaderStage::Vertex), (d.fragment, ShaderStage::Fragment)]
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn push_constant_range() -> vk::PushConstantRange {
    vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: PUSH_CONSTANT_FLOATS * 4,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pipeline {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl Pipeline {
    const NULL: Pipeline = Pipeline {
        handle: vk::Pipeline::null(),
        layout: vk::PipelineLayout::null(),
    };
}

/// Everything a single pipeline build needs.
pub struct PipelineRequest<'a> {
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    pub vertex_layout: VertexLayout,
    pub config: &'a PipelineConfig,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub samples: vk::SampleCountFlags,
    pub stages: &'a [ShaderModule<'a>],
    pub push_constants: Option<vk::PushConstantRange>,
    pub min_sample_shading: Option<f32>,
}

pub struct PipelineCache {
    device: Arc<Device>,
    cache: vk::PipelineCache,
    pipelines: Vec<Pipeline>,
    sample_shading: Option<f32>,
}

impl PipelineCache {
    pub fn new(
        device: Arc<Device>,
        shaders: &ShaderLibrary,
        layouts: &SetLayouts,
        passes: &Renderpasses,
        sample_shading: Option<f32>,
    ) -> VkResult<Self> {
        let ci = vk::PipelineCacheCreateInfo::default();
        let cache = unsafe { device.raw().create_pipeline_cache(&ci, None) }
            .check("vkCreatePipelineCache")?;
        let sample_shading = sample_shading.filter(|_| device.features().sample_rate_shading);
        let mut out = Self {
            device,
            cache,
            pipelines: Vec::with_capacity(PipelineKind::ALL.len()),
            sample_shading,
        };
        out.build_all(shaders, layouts, passes)?;
        Ok(out)
    }

    /// Destroys every pipeline and builds the table again, e.g. after the
    /// renderpasses were recreated with a different sample count.
    pub fn rebuild(
        &mut self,
        shaders: &ShaderLibrary,
        layouts: &SetLayouts,
        passes: &Renderpasses,
    ) -> VkResult<()> {
        self.destroy_pipelines();
        self.build_all(shaders, layouts, passes)
    }

    fn build_all(
        &mut self,
        shaders: &ShaderLibrary,
        layouts: &SetLayouts,
        passes: &Renderpasses,
    ) -> VkResult<()> {
        for kind in PipelineKind::ALL {
            let desc = kind.desc();
            let stages = [
                ShaderModule::new(&self.device, shaders, desc.vertex, ShaderStage::Vertex)?,
                ShaderModule::new(&self.device, shaders, desc.fragment, ShaderStage::Fragment)?,
            ];
            let sets = desc.sets.resolve(layouts);
            let world = desc.pass == RenderpassKind::World;
            let samples = if world {
                passes.samples()
            } else {
                vk::SampleCountFlags::TYPE_1
            };
            let p = self.create_pipeline(&PipelineRequest {
                set_layouts: &sets,
                vertex_layout: desc.layout,
                config: &desc.config,
                render_pass: passes.get(desc.pass),
                subpass: desc.subpass,
                samples,
                stages: &stages,
                push_constants: desc.push_constants.then(push_constant_range),
                min_sample_shading: self.sample_shading.filter(|_| world && passes.msaa()),
            })?;
            self.pipelines.push(p);
        }
        info!("vk: {} pipelines built", self.pipelines.len());
        Ok(())
    }

    pub fn create_pipeline(&self, req: &PipelineRequest<'_>) -> VkResult<Pipeline> {
        let d = self.device.raw();
        let ranges: Vec<vk::PushConstantRange> = req.push_constants.into_iter().collect();
        let layout_ci = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(req.set_layouts)
            .push_constant_ranges(&ranges);
        let layout = unsafe { d.create_pipeline_layout(&layout_ci, None) }
            .check("vkCreatePipelineLayout")?;

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = req
            .stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage.flags())
                    .module(s.module)
                    .name(c"main")
            })
            .collect();
        let bindings = req.vertex_layout.bindings();
        let attributes = req.vertex_layout.attributes();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let cfg = req.config;
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(cfg.topology);
        // Viewport and scissor are dynamic; set each frame.
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let raster = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(cfg.polygon_mode)
            .cull_mode(cfg.cull_mode)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(req.samples)
            .sample_shading_enable(req.min_sample_shading.is_some())
            .min_sample_shading(req.min_sample_shading.unwrap_or(1.0));
        let depth = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(cfg.depth_test)
            .depth_write_enable(cfg.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0);
        let blend_attachments = [cfg.blend.attachment()];
        let blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op(vk::LogicOp::COPY)
            .attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let ci = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(req.render_pass)
            .subpass(req.subpass);

        match unsafe { d.create_graphics_pipelines(self.cache, &[ci], None) } {
            Ok(p) => Ok(Pipeline {
                handle: p[0],
                layout,
            }),
            Err((_, result)) => {
                unsafe { d.destroy_pipeline_layout(layout, None) };
                Err(VkError::Api {
                    call: "vkCreateGraphicsPipelines",
                    result,
                })
            }
        }
    }

    pub fn get(&self, kind: PipelineKind) -> Pipeline {
        self.pipelines
            .get(kind.index())
            .copied()
            .unwrap_or(Pipeline::NULL)
    }

    fn destroy_pipelines(&mut self) {
        let d = self.device.raw();
        for p in self.pipelines.drain(..) {
            unsafe {
                d.destroy_pipeline(p.handle, None);
                d.destroy_pipeline_layout(p.layout, None);
            }
        }
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        self.destroy_pipelines();
        unsafe { self.device.raw().destroy_pipeline_cache(self.cache, None) };
    }
}

/// One-entry bind cache for the active command buffer.
#[derive(Debug, Default)]
pub struct PipelineBinding {
    bound: Option<vk::Pipeline>,
}

impl PipelineBinding {
    /// True when `pipeline` differs from the bound one; records it as bound.
    pub fn needs_bind(&mut self, pipeline: vk::Pipeline) -> bool {
        if self.bound == Some(pipeline) {
            return false;
        }
        self.bound = Some(pipeline);
        true
    }

    pub fn reset(&mut self) {
        self.bound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn table_covers_every_kind_in_order() {
        for (i, k) in PipelineKind::ALL.iter().enumerate() {
            assert_eq!(k.index(), i);
        }
    }

    #[test]
    fn color_quads_match_their_pass() {
        for pass in [RenderpassKind::World, RenderpassKind::Ui] {
            let kind = PipelineKind::color_quad(pass).unwrap();
            assert_eq!(kind.desc().pass, pass);
        }
        match PipelineKind::color_quad(RenderpassKind::WorldWarp) {
            Err(VkError::RenderpassOrder { requested }) => assert_eq!(requested, "world-warp"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn only_post_process_runs_in_the_composite_subpass() {
        for k in PipelineKind::ALL {
            let d = k.desc();
            if k == PipelineKind::PostProcess {
                assert_eq!((d.pass, d.subpass), (RenderpassKind::Ui, 1));
                assert!(!d.push_constants);
            } else {
                assert_eq!(d.subpass, 0, "{k:?}");
                assert!(d.push_constants, "{k:?}");
            }
        }
        assert_eq!(PipelineKind::WorldWarp.desc().pass, RenderpassKind::WorldWarp);
    }

    #[test]
    fn fullscreen_passes_have_no_vertex_input() {
        for k in [PipelineKind::PostProcess, PipelineKind::WorldWarp] {
            let d = k.desc();
            assert_eq!(d.layout, VertexLayout::None);
            assert_eq!(d.sets, SetLayoutCombo::SamplerInputAttachment);
            assert!(!d.config.depth_test && !d.config.depth_write);
        }
    }

    #[test]
    fn dynamic_light_blends_additively() {
        let att = PipelineKind::DynamicLight.desc().config.blend.attachment();
        assert_eq!(att.blend_enable, vk::TRUE);
        assert_eq!(att.src_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(att.dst_color_blend_factor, vk::BlendFactor::ONE);

        let alpha = PipelineKind::Sprite.desc().config.blend.attachment();
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        let opaque = PipelineKind::Skybox.desc().config.blend.attachment();
        assert_eq!(opaque.blend_enable, vk::FALSE);
    }

    #[test]
    fn fans_draw_as_lists_and_strips_as_strips() {
        use vk::PrimitiveTopology as T;
        let topo = |k: PipelineKind| k.desc().config.topology;
        assert_eq!(topo(PipelineKind::ModelFanWorld), T::TRIANGLE_LIST);
        assert_eq!(topo(PipelineKind::ModelStripUi), T::TRIANGLE_STRIP);
        assert_eq!(topo(PipelineKind::ShadowsFan), T::TRIANGLE_LIST);
        assert_eq!(topo(PipelineKind::ShowTris), T::LINE_STRIP);
        assert_eq!(topo(PipelineKind::PointParticles), T::POINT_LIST);
    }

    #[test]
    fn vertex_layouts_pack_floats() {
        assert_eq!(VertexLayout::RgbRgbaRg.stride(), 36);
        let attrs = VertexLayout::RgbRgbaRg.attributes();
        let offsets: Vec<u32> = attrs.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, [0, 12, 28]);
        assert_eq!(attrs[1].format, vk::Format::R32G32B32A32_SFLOAT);
        assert!(VertexLayout::None.bindings().is_empty());
        assert_eq!(VertexLayout::RgRg.bindings()[0].stride, 16);
    }

    #[test]
    fn required_shaders_are_unique_and_complete() {
        let req = required_shaders();
        let mut dedup = req.clone();
        dedup.dedup();
        assert_eq!(req, dedup);
        assert!(req.contains(&(ShaderId::PolygonLightmap, ShaderStage::Fragment)));
        assert!(req.contains(&(ShaderId::PostProcess, ShaderStage::Vertex)));
        assert!(!req.contains(&(ShaderId::Sprite, ShaderStage::Fragment)));
    }

    #[test]
    fn push_constants_hold_32_floats() {
        let r = push_constant_range();
        assert_eq!(r.size, 128);
        assert_eq!(r.stage_flags, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn bind_cache_skips_repeats() {
        let mut b = PipelineBinding::default();
        let a = vk::Pipeline::from_raw(1);
        let c = vk::Pipeline::from_raw(2);
        assert!(b.needs_bind(a));
        assert!(!b.needs_bind(a));
        assert!(b.needs_bind(c));
        assert!(b.needs_bind(a));
        b.reset();
        assert!(b.needs_bind(a));
    }
}
