// SPDX-License-Identifier: CEPL-1.0
//! The Vulkan renderer: owns every engine object for a session and drives
//! the frame protocol from [`crate::frame`].

use crate::descriptors::{Descriptors, SamplerKind, SetLayouts};
use crate::device::{Device, DeviceRequest};
use crate::dynbuf::{BufferStats, DynamicBuffers, Suballocation, VkArenaBackend};
use crate::error::{CheckVk, VkError, VkResult};
use crate::frame::{Acquired, FrameOps, FramePhase, FrameState, PresentStatus};
use crate::pipeline::{required_shaders, Pipeline, PipelineBinding, PipelineCache, PipelineKind};
use crate::renderpass::{clear_values, resolve_sample_count, Framebuffers, RenderpassKind, Renderpasses};
use crate::shaders::ShaderLibrary;
use crate::staging::{StagingRegion, StagingRing, VkStaging};
use crate::swapchain::{Swapchain, SwapchainPrefs};
use crate::targets::{pick_depth_format, Targets};
use crate::texture::{self, StaticBuffer, Texture};
use crate::FRAMES_IN_FLIGHT;
use anyhow::Result;
use ash::vk;
use ember_render::{RenderConfig, RenderSize, Renderer};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Parameters of the world-warp pass.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WarpParams {
    /// Seconds, drives the wave phase.
    pub time: f32,
    /// 0 disables the distortion and the pass becomes a plain copy.
    pub intensity: f32,
}

/// Vertex/index buffers for the fixed-function rect helpers.
pub struct RectBuffers {
    pub textured: vk::Buffer,
    pub colored: vk::Buffer,
    pub indices: vk::Buffer,
}

struct StaticGeometry {
    device: Arc<Device>,
    tex_rect: StaticBuffer,
    color_rect: StaticBuffer,
    rect_indices: StaticBuffer,
}

impl StaticGeometry {
    fn new(device: Arc<Device>, staging: &mut StagingRing<VkStaging>) -> VkResult<Self> {
        // pos.xy, uv
        let tex_verts: [f32; 16] = [
            -1.0, -1.0, 0.0, 0.0, //
            1.0, 1.0, 1.0, 1.0, //
            -1.0, 1.0, 0.0, 1.0, //
            1.0, -1.0, 1.0, 0.0,
        ];
        let color_verts: [f32; 8] = [-1.0, -1.0, 1.0, 1.0, -1.0, 1.0, 1.0, -1.0];
        let indices: [u32; 6] = [0, 1, 2, 0, 3, 1];

        let vertex = vk::BufferUsageFlags::VERTEX_BUFFER;
        let mut tex_rect = StaticBuffer::upload(
            &device,
            staging,
            vertex,
            "textured rect",
            bytemuck::cast_slice(&tex_verts),
        )?;
        let mut color_rect = match StaticBuffer::upload(
            &device,
            staging,
            vertex,
            "colored rect",
            bytemuck::cast_slice(&color_verts),
        ) {
            Ok(b) => b,
            Err(e) => {
                tex_rect.destroy(&device);
                return Err(e);
            }
        };
        let rect_indices = match StaticBuffer::upload(
            &device,
            staging,
            vk::BufferUsageFlags::INDEX_BUFFER,
            "rect indices",
            bytemuck::cast_slice(&indices),
        ) {
            Ok(b) => b,
            Err(e) => {
                tex_rect.destroy(&device);
                color_rect.destroy(&device);
                return Err(e);
            }
        };
        Ok(Self {
            device,
            tex_rect,
            color_rect,
            rect_indices,
        })
    }
}

impl Drop for StaticGeometry {
    fn drop(&mut self) {
        let d = self.device.clone();
        self.tex_rect.destroy(&d);
        self.color_rect.destroy(&d);
        self.rect_indices.destroy(&d);
    }
}

/// Per-slot command buffers, fences and acquire semaphores, plus one
/// render-finished semaphore per swapchain image.
struct SyncObjects {
    device: Arc<Device>,
    pool: vk::CommandPool,
    cmds: Vec<vk::CommandBuffer>,
    image_available: Vec<vk::Semaphore>,
    fences: Vec<vk::Fence>,
    render_finished: Vec<vk::Semaphore>,
}

impl SyncObjects {
    fn new(device: Arc<Device>, image_count: usize) -> VkResult<Self> {
        let pool_ci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: device.families().graphics,
            ..Default::default()
        };
        let pool = unsafe { device.raw().create_command_pool(&pool_ci, None) }
            .check("vkCreateCommandPool")?;
        let mut s = Self {
            device,
            pool,
            cmds: Vec::new(),
            image_available: Vec::new(),
            fences: Vec::new(),
            render_finished: Vec::new(),
        };
        let d = s.device.raw();
        let alloc = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: FRAMES_IN_FLIGHT as u32,
            ..Default::default()
        };
        s.cmds = unsafe { d.allocate_command_buffers(&alloc) }.check("vkAllocateCommandBuffers")?;
        // signaled so the first wait on each slot returns at once
        let fence_ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        for _ in 0..FRAMES_IN_FLIGHT {
            let sem = unsafe { d.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
                .check("vkCreateSemaphore")?;
            s.image_available.push(sem);
            let fence = unsafe { d.create_fence(&fence_ci, None) }.check("vkCreateFence")?;
            s.fences.push(fence);
        }
        s.resize_render_finished(image_count)?;
        Ok(s)
    }

    /// The device must be idle.
    fn resize_render_finished(&mut self, image_count: usize) -> VkResult<()> {
        let d = self.device.raw();
        while self.render_finished.len() > image_count {
            if let Some(sem) = self.render_finished.pop() {
                unsafe { d.destroy_semaphore(sem, None) };
            }
        }
        while self.render_finished.len() < image_count {
            let sem = unsafe { d.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
                .check("vkCreateSemaphore")?;
            self.render_finished.push(sem);
        }
        Ok(())
    }
}

impl Drop for SyncObjects {
    fn drop(&mut self) {
        let d = self.device.raw();
        unsafe {
            for &f in &self.fences {
                d.destroy_fence(f, None);
            }
            for &s in self.image_available.iter().chain(&self.render_finished) {
                d.destroy_semaphore(s, None);
            }
            // frees the command buffers too
            d.destroy_command_pool(self.pool, None);
        }
    }
}

/// Recording steps the pass chain drives.
trait PassOps {
    fn open_pass(&mut self, kind: RenderpassKind) -> VkResult<()>;
    fn close_pass(&mut self);
    /// Warp draw into the open WorldWarp pass.
    fn record_warp(&mut self, params: WarpParams) -> VkResult<()>;
}

/// Where the frame is in the World -> WorldWarp -> Ui chain.
#[derive(Clone, Copy, Debug, Default)]
struct PassChain {
    open: Option<RenderpassKind>,
    next: u8,
}

impl PassChain {
    const SEQUENCE: [RenderpassKind; 3] =
        [RenderpassKind::World, RenderpassKind::WorldWarp, RenderpassKind::Ui];

    /// Passes that have to run before `kind` can open, or `None` when it is
    /// already open.
    fn skipped(&self, kind: RenderpassKind) -> VkResult<Option<Vec<RenderpassKind>>> {
        if self.open == Some(kind) {
            return Ok(None);
        }
        if kind.order() < self.next {
            return Err(VkError::RenderpassOrder {
                requested: kind.name(),
            });
        }
        Ok(Some(
            Self::SEQUENCE
                .into_iter()
                .filter(|p| p.order() >= self.next && p.order() < kind.order())
                .collect(),
        ))
    }

    fn opened(&mut self, kind: RenderpassKind) {
        self.open = Some(kind);
        self.next = kind.order() + 1;
    }

    fn open<O: PassOps>(&mut self, ops: &mut O, kind: RenderpassKind) -> VkResult<()> {
        ops.open_pass(kind)?;
        self.opened(kind);
        Ok(())
    }

    fn close<O: PassOps>(&mut self, ops: &mut O) {
        if self.open.take().is_some() {
            ops.close_pass();
        }
    }

    fn warp<O: PassOps>(&mut self, ops: &mut O, params: WarpParams) -> VkResult<()> {
        self.open(ops, RenderpassKind::WorldWarp)?;
        ops.record_warp(params)?;
        self.close(ops);
        Ok(())
    }

    /// Opens `kind`, first running any earlier pass the frame skipped. A
    /// skipped world pass is recorded empty and a skipped warp undistorted.
    fn begin<O: PassOps>(&mut self, ops: &mut O, kind: RenderpassKind) -> VkResult<()> {
        let Some(skipped) = self.skipped(kind)? else {
            return Ok(());
        };
        self.close(ops);
        for pass in skipped {
            if pass == RenderpassKind::World {
                self.open(ops, pass)?;
                self.close(ops);
            } else {
                self.warp(ops, WarpParams::default())?;
            }
        }
        self.open(ops, kind)
    }

    /// Closes the world pass, runs the warp over its color and opens Ui.
    fn end_world<O: PassOps>(&mut self, ops: &mut O, params: WarpParams) -> VkResult<()> {
        if self.next > RenderpassKind::World.order() && self.open != Some(RenderpassKind::World) {
            return Err(VkError::RenderpassOrder {
                requested: RenderpassKind::WorldWarp.name(),
            });
        }
        if self.open.is_none() {
            self.open(ops, RenderpassKind::World)?;
        }
        self.close(ops);
        self.warp(ops, params)?;
        self.open(ops, RenderpassKind::Ui)
    }
}

/// Every GPU object of a session. Fields drop top to bottom, which is the
/// teardown order: size-dependent objects first, the device last.
pub(crate) struct RenderCore {
    framebuffers: Option<Framebuffers>,
    targets: Option<Targets>,
    pipelines: PipelineCache,
    passes: Renderpasses,
    swapchain: Swapchain,
    geometry: StaticGeometry,
    staging: StagingRing<VkStaging>,
    buffers: DynamicBuffers<VkArenaBackend>,
    descriptors: Descriptors,
    sync: SyncObjects,
    shaders: ShaderLibrary,

    prefs: SwapchainPrefs,
    depth_format: vk::Format,
    clear_color: [f32; 4],
    clear_color_attachment: bool,
    binding: PipelineBinding,
    chain: PassChain,
    slot: usize,
    image: u32,
    paused: bool,
    needs_recreate: bool,
    device: Arc<Device>,
}

impl RenderCore {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderConfig,
    ) -> VkResult<Self> {
        let shaders = match &cfg.shader_dir {
            Some(dir) => ShaderLibrary::load_dir(dir, required_shaders())?,
            None => ShaderLibrary::embedded(required_shaders())?,
        };
        let device = Arc::new(Device::new(
            window,
            display,
            &DeviceRequest {
                preferred_index: cfg.device_index,
                validation: cfg.validation,
            },
        )?);
        let descriptors = Descriptors::new(device.clone())?;
        let prefs = SwapchainPrefs {
            size,
            vsync: cfg.vsync,
            vsync_mode: cfg.vsync_mode,
        };
        let swapchain = Swapchain::new(device.clone(), &prefs)?;

        let depth_format = pick_depth_format(&device);
        let samples = resolve_sample_count(cfg.msaa, device.framebuffer_sample_counts());
        let color_format = swapchain.format();
        let passes = Renderpasses::new(
            device.clone(),
            color_format,
            depth_format,
            color_format,
            samples,
            cfg.clear_color_attachment,
        )?;
        let pipelines = PipelineCache::new(
            device.clone(),
            &shaders,
            &descriptors.layouts(),
            &passes,
            cfg.sample_shading,
        )?;
        let targets = Targets::new(
            device.clone(),
            &descriptors,
            swapchain.extent(),
            color_format,
            depth_format,
            samples,
        )?;
        let framebuffers = Framebuffers::new(device.clone(), &passes, &targets, swapchain.views())?;

        let buffers = DynamicBuffers::new(VkArenaBackend::new(
            device.clone(),
            descriptors.pool(),
            descriptors.layouts().ubo,
        ))?;
        let mut staging = StagingRing::new(VkStaging::new(device.clone())?);
        let geometry = StaticGeometry::new(device.clone(), &mut staging)?;
        let sync = SyncObjects::new(device.clone(), swapchain.image_count())?;

        info!(
            "vk: renderer ready {}x{} depth={:?} msaa={:?}",
            swapchain.extent().width,
            swapchain.extent().height,
            depth_format,
            samples
        );
        Ok(Self {
            framebuffers: Some(framebuffers),
            targets: Some(targets),
            pipelines,
            passes,
            swapchain,
            geometry,
            staging,
            buffers,
            descriptors,
            sync,
            shaders,
            prefs,
            depth_format,
            clear_color: cfg.clear_color,
            clear_color_attachment: cfg.clear_color_attachment,
            binding: PipelineBinding::default(),
            chain: PassChain::default(),
            slot: 0,
            image: 0,
            paused: false,
            needs_recreate: false,
            device,
        })
    }

    fn cmd(&self) -> vk::CommandBuffer {
        self.sync.cmds[self.slot]
    }

    fn surface_is_empty(&self) -> VkResult<bool> {
        let caps = unsafe {
            self.device
                .surface_loader()
                .get_physical_device_surface_capabilities(self.device.physical(), self.device.surface())
        }
        .check("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        // u32::MAX means the surface follows the swapchain size
        let e = caps.current_extent;
        Ok(e.width == 0 || e.height == 0)
    }

    /// Rebuilds the swapchain and everything sized to it. A zero-sized
    /// window pauses rendering until the next non-empty resize.
    fn rebuild_swapchain(&mut self) -> VkResult<()> {
        if self.prefs.size.is_empty() || self.surface_is_empty()? {
            if !self.paused {
                info!("vk: surface is 0x0, paused");
            }
            self.paused = true;
            self.needs_recreate = true;
            return Ok(());
        }
        self.device.wait_idle();

        // STRICT ORDER: framebuffers, targets, then the swapchain itself
        self.framebuffers = None;
        self.targets = None;
        let old_format = self.swapchain.format();
        self.swapchain.recreate(&self.prefs)?;
        self.sync.resize_render_finished(self.swapchain.image_count())?;

        if self.swapchain.format() != old_format {
            info!("vk: swapchain format changed, rebuilding renderpasses");
            self.rebuild_passes(self.passes.samples())?;
        }
        self.rebuild_targets()?;
        self.paused = false;
        self.needs_recreate = false;
        Ok(())
    }

    fn rebuild_passes(&mut self, samples: vk::SampleCountFlags) -> VkResult<()> {
        let color = self.swapchain.format();
        self.passes = Renderpasses::new(
            self.device.clone(),
            color,
            self.depth_format,
            color,
            samples,
            self.clear_color_attachment,
        )?;
        self.pipelines
            .rebuild(&self.shaders, &self.descriptors.layouts(), &self.passes)
    }

    fn rebuild_targets(&mut self) -> VkResult<()> {
        let targets = Targets::new(
            self.device.clone(),
            &self.descriptors,
            self.swapchain.extent(),
            self.swapchain.format(),
            self.depth_format,
            self.passes.samples(),
        )?;
        let fbs = Framebuffers::new(
            self.device.clone(),
            &self.passes,
            &targets,
            self.swapchain.views(),
        )?;
        self.targets = Some(targets);
        self.framebuffers = Some(fbs);
        Ok(())
    }

    fn set_msaa(&mut self, samples: u32) -> VkResult<()> {
        let flags = resolve_sample_count(samples, self.device.framebuffer_sample_counts());
        if flags == self.passes.samples() {
            return Ok(());
        }
        self.device.wait_idle();
        self.framebuffers = None;
        self.targets = None;
        self.rebuild_passes(flags)?;
        self.rebuild_targets()?;
        info!("vk: msaa set to {:?}", flags);
        Ok(())
    }

    fn targets(&self) -> VkResult<&Targets> {
        self.targets.as_ref().ok_or(VkError::NotReady)
    }

    fn begin_renderpass(&mut self, kind: RenderpassKind) -> VkResult<()> {
        let mut chain = self.chain;
        let r = chain.begin(self, kind);
        self.chain = chain;
        r
    }

    fn end_world_renderpass(&mut self, params: WarpParams) -> VkResult<()> {
        let mut chain = self.chain;
        let r = chain.end_world(self, params);
        self.chain = chain;
        r
    }

    fn end_open_pass(&mut self) {
        if self.chain.open.take().is_some() {
            self.close_pass();
        }
    }

    /// Brings the frame to UI subpass 0, running whatever passes were skipped.
    fn complete_chain(&mut self) -> VkResult<()> {
        self.begin_renderpass(RenderpassKind::Ui)
    }

    fn composite(&mut self) -> VkResult<()> {
        let cmd = self.cmd();
        let p = self.pipelines.get(PipelineKind::PostProcess);
        let t = self.targets()?;
        let sets = [t.color_warp_set, t.input_set];
        let d = self.device.raw();
        unsafe {
            d.cmd_next_subpass(cmd, vk::SubpassContents::INLINE);
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, p.handle);
            d.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, p.layout, 0, &sets, &[]);
            d.cmd_draw(cmd, 3, 1, 0, 0);
        }
        self.end_open_pass();
        Ok(())
    }

    fn bind_pipeline(&mut self, kind: PipelineKind) -> Pipeline {
        let p = self.pipelines.get(kind);
        if self.binding.needs_bind(p.handle) {
            unsafe {
                self.device
                    .raw()
                    .cmd_bind_pipeline(self.cmd(), vk::PipelineBindPoint::GRAPHICS, p.handle)
            };
        }
        p
    }

    fn draw_rect(&mut self, kind: PipelineKind, vbo: vk::Buffer, sets: &[vk::DescriptorSet], offset: u32) {
        let p = self.bind_pipeline(kind);
        let cmd = self.cmd();
        let d = self.device.raw();
        unsafe {
            d.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, p.layout, 0, sets, &[offset]);
            d.cmd_bind_vertex_buffers(cmd, 0, &[vbo], &[0]);
            d.cmd_bind_index_buffer(
                cmd,
                self.geometry.rect_indices.buffer,
                0,
                vk::IndexType::UINT32,
            );
            d.cmd_draw_indexed(cmd, 6, 1, 0, 0, 0);
        }
    }

    fn write_ubo(&mut self, ubo: &[f32]) -> VkResult<Suballocation> {
        let alloc = self.buffers.uniform(std::mem::size_of_val(ubo) as u64)?;
        alloc.write(ubo);
        Ok(alloc)
    }
}

impl PassOps for RenderCore {
    fn open_pass(&mut self, kind: RenderpassKind) -> VkResult<()> {
        let fb = self
            .framebuffers
            .as_ref()
            .ok_or(VkError::NotReady)?
            .get(kind, self.image);
        let clears = clear_values(kind, self.passes.msaa(), self.clear_color);
        let begin = vk::RenderPassBeginInfo::default()
            .render_pass(self.passes.get(kind))
            .framebuffer(fb)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.swapchain.extent(),
            })
            .clear_values(&clears);
        unsafe {
            self.device
                .raw()
                .cmd_begin_render_pass(self.cmd(), &begin, vk::SubpassContents::INLINE)
        };
        Ok(())
    }

    fn close_pass(&mut self) {
        unsafe { self.device.raw().cmd_end_render_pass(self.cmd()) };
    }

    fn record_warp(&mut self, params: WarpParams) -> VkResult<()> {
        let cmd = self.cmd();
        let p = self.pipelines.get(PipelineKind::WorldWarp);
        let extent = self.swapchain.extent();
        let push = [
            params.time,
            params.intensity,
            extent.width as f32,
            extent.height as f32,
        ];
        let set = self.targets()?.color_set;
        let d = self.device.raw();
        unsafe {
            d.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, p.handle);
            d.cmd_bind_descriptor_sets(cmd, vk::PipelineBindPoint::GRAPHICS, p.layout, 0, &[set], &[]);
            d.cmd_push_constants(
                cmd,
                p.layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::cast_slice(&push),
            );
            d.cmd_draw(cmd, 3, 1, 0, 0);
        }
        self.binding.reset();
        Ok(())
    }
}

impl FrameOps for RenderCore {
    fn wait_fence(&mut self, slot: usize) -> VkResult<()> {
        unsafe {
            self.device
                .raw()
                .wait_for_fences(&[self.sync.fences[slot]], true, u64::MAX)
        }
        .check("vkWaitForFences")
    }

    fn reset_fence(&mut self, slot: usize) -> VkResult<()> {
        unsafe { self.device.raw().reset_fences(&[self.sync.fences[slot]]) }.check("vkResetFences")
    }

    fn acquire(&mut self, slot: usize) -> VkResult<Acquired> {
        self.swapchain.acquire(self.sync.image_available[slot])
    }

    fn recreate_swapchain(&mut self) -> VkResult<()> {
        self.rebuild_swapchain()
    }

    fn begin_recording(&mut self, slot: usize, image: u32) -> VkResult<()> {
        self.slot = slot;
        self.image = image;
        let released = self.buffers.release_retired();
        if released > 0 {
            debug!("vk: released {released} retired buffers");
        }
        self.buffers.begin_frame(slot)?;
        self.binding.reset();
        self.chain = PassChain::default();

        let cmd = self.cmd();
        let d = self.device.raw();
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        let extent = self.swapchain.extent();
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            d.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .check("vkResetCommandBuffer")?;
            d.begin_command_buffer(cmd, &begin)
                .check("vkBeginCommandBuffer")?;
            d.cmd_set_viewport(cmd, 0, &[viewport]);
            d.cmd_set_scissor(cmd, 0, &[scissor]);
        }
        Ok(())
    }

    fn finish_recording(&mut self, _slot: usize, _image: u32, force: bool) -> VkResult<()> {
        if force && self.chain.open != Some(RenderpassKind::Ui) {
            debug!("vk: forced end of frame with {:?} open", self.chain.open);
        }
        self.complete_chain()?;
        self.staging.submit_all()?;
        self.buffers.flush()?;
        self.composite()?;
        unsafe { self.device.raw().end_command_buffer(self.cmd()) }.check("vkEndCommandBuffer")
    }

    fn submit(&mut self, slot: usize) -> VkResult<()> {
        let waits = [self.sync.image_available[slot]];
        let stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let cmds = [self.sync.cmds[slot]];
        let signals = [self.sync.render_finished[self.image as usize]];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signals);
        unsafe {
            self.device
                .raw()
                .queue_submit(self.device.graphics_queue(), &[submit], self.sync.fences[slot])
        }
        .check("vkQueueSubmit")
    }

    fn present(&mut self, _slot: usize, image: u32) -> VkResult<PresentStatus> {
        self.swapchain
            .present(self.sync.render_finished[image as usize], image)
    }

    fn abandon(&mut self, slot: usize) -> VkResult<()> {
        self.chain = PassChain::default();
        let waits = [self.sync.image_available[slot]];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&waits)
            .wait_dst_stage_mask(&stages);
        // the acquired image is never presented; a new swapchain releases it
        self.needs_recreate = true;
        unsafe {
            self.device
                .raw()
                .queue_submit(self.device.graphics_queue(), &[submit], self.sync.fences[slot])
        }
        .check("vkQueueSubmit")
    }
}

impl Drop for RenderCore {
    fn drop(&mut self) {
        self.device.wait_idle();
    }
}

/// Frame-level API. Record between [`VkRenderer::begin_frame`] and
/// [`VkRenderer::end_frame`]; dynamic buffers can only be taken in between
/// and stay valid until the same frame slot comes around again.
pub struct VkRenderer {
    frame: FrameState,
    core: RenderCore,
}

impl VkRenderer {
    pub fn create(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderConfig,
    ) -> VkResult<Self> {
        Ok(Self {
            frame: FrameState::new(),
            core: RenderCore::new(window, display, size, cfg)?,
        })
    }

    pub fn begin_frame(&mut self) -> VkResult<()> {
        if self.frame.phase() == FramePhase::Idle && self.core.needs_recreate {
            self.core.rebuild_swapchain()?;
        }
        if self.core.paused {
            return Err(VkError::SwapchainOutOfDate);
        }
        self.frame.begin(&mut self.core)
    }

    pub fn end_frame(&mut self, force: bool) -> VkResult<PresentStatus> {
        self.frame.end(&mut self.core, force)
    }

    pub fn begin_renderpass(&mut self, kind: RenderpassKind) -> VkResult<()> {
        self.frame.recording()?;
        self.core.begin_renderpass(kind)
    }

    /// Closes the world pass, runs the warp over its color and opens the UI pass.
    pub fn end_world_renderpass(&mut self, params: WarpParams) -> VkResult<()> {
        self.frame.recording()?;
        self.core.end_world_renderpass(params)
    }

    pub fn recreate_swapchain(&mut self) -> VkResult<()> {
        if self.frame.phase() != FramePhase::Idle {
            self.core.needs_recreate = true;
            return Ok(());
        }
        self.core.rebuild_swapchain()
    }

    pub fn vertex_buffer(&mut self, size: u64) -> VkResult<Suballocation> {
        self.frame.recording()?;
        self.core.buffers.vertex(size)
    }

    pub fn index_buffer(&mut self, size: u64) -> VkResult<Suballocation> {
        self.frame.recording()?;
        self.core.buffers.index(size)
    }

    pub fn uniform_buffer(&mut self, size: u64) -> VkResult<Suballocation> {
        self.frame.recording()?;
        self.core.buffers.uniform(size)
    }

    /// Index buffer (u16) whose first `index_count` indices form a fan.
    pub fn triangle_fan_buffer(&mut self, index_count: u32) -> VkResult<vk::Buffer> {
        self.frame.recording()?;
        self.core.buffers.triangle_fan(index_count)
    }

    pub fn staging_region(&mut self, size: u64, alignment: u64) -> VkResult<StagingRegion> {
        self.frame.recording()?;
        self.core.staging.region(size, alignment)
    }

    pub fn bind_pipeline(&mut self, kind: PipelineKind) -> VkResult<Pipeline> {
        self.frame.recording()?;
        Ok(self.core.bind_pipeline(kind))
    }

    pub fn pipeline(&self, kind: PipelineKind) -> Pipeline {
        self.core.pipelines.get(kind)
    }

    /// Color quad in `pass`; `ubo` is the vertex shader's uniform block.
    pub fn draw_colored_rect(&mut self, ubo: &[f32], pass: RenderpassKind) -> VkResult<()> {
        self.frame.recording()?;
        let kind = PipelineKind::color_quad(pass)?;
        self.core.begin_renderpass(pass)?;
        let alloc = self.core.write_ubo(ubo)?;
        let vbo = self.core.geometry.color_rect.buffer;
        self.core.draw_rect(
            kind,
            vbo,
            &[alloc.descriptor_set],
            alloc.dynamic_offset(),
        );
        Ok(())
    }

    /// Textured quad in the UI pass.
    pub fn draw_textured_rect(&mut self, ubo: &[f32], texture: &Texture) -> VkResult<()> {
        self.frame.recording()?;
        self.core.begin_renderpass(RenderpassKind::Ui)?;
        let alloc = self.core.write_ubo(ubo)?;
        let vbo = self.core.geometry.tex_rect.buffer;
        self.core.draw_rect(
            PipelineKind::TexQuad,
            vbo,
            &[texture.descriptor_set(), alloc.descriptor_set],
            alloc.dynamic_offset(),
        );
        Ok(())
    }

    /// Uploads RGBA8 texels; the copy executes before the next frame's draws.
    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
        sampler: SamplerKind,
    ) -> VkResult<Texture> {
        let core = &mut self.core;
        texture::create_texture(
            &core.device,
            &mut core.staging,
            &core.descriptors,
            width,
            height,
            rgba,
            sampler,
        )
    }

    /// Rewrites the texture's descriptor, so only between frames and after
    /// every submitted frame has finished with it.
    pub fn update_texture_sampler(
        &mut self,
        texture: &mut Texture,
        kind: SamplerKind,
    ) -> VkResult<vk::Sampler> {
        self.frame.idle()?;
        self.core.device.wait_idle();
        Ok(texture::update_texture_sampler(
            &self.core.device,
            &self.core.descriptors,
            texture,
            kind,
        ))
    }

    /// Between frames only; waits for the device to go idle so no submitted
    /// frame still samples it. Mid-frame the texture is handed back.
    pub fn destroy_texture(&mut self, texture: Texture) -> Result<(), (VkError, Texture)> {
        if let Err(e) = self.frame.idle() {
            return Err((e, texture));
        }
        self.core.device.wait_idle();
        texture::destroy_texture(&self.core.device, &self.core.descriptors, texture);
        Ok(())
    }

    /// Command buffer of the frame being recorded.
    pub fn command_buffer(&self) -> Option<vk::CommandBuffer> {
        self.frame.image().map(|_| self.core.cmd())
    }

    pub fn set_layouts(&self) -> SetLayouts {
        self.core.descriptors.layouts()
    }

    pub fn rect_buffers(&self) -> RectBuffers {
        let g = &self.core.geometry;
        RectBuffers {
            textured: g.tex_rect.buffer,
            colored: g.color_rect.buffer,
            indices: g.rect_indices.buffer,
        }
    }

    pub fn stats(&self) -> BufferStats {
        self.core.buffers.stats()
    }

    pub fn frame_phase(&self) -> FramePhase {
        self.frame.phase()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame.frame()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.core.swapchain.extent()
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.core.device
    }

    /// Rebuilds renderpasses, targets and pipelines for a new sample count.
    pub fn set_msaa(&mut self, samples: u32) -> VkResult<()> {
        self.frame.idle()?;
        self.core.set_msaa(samples)
    }

    pub fn msaa(&self) -> vk::SampleCountFlags {
        self.core.passes.samples()
    }
}

impl Renderer for VkRenderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderConfig,
    ) -> Result<Self> {
        Ok(Self::create(window, display, size, cfg)?)
    }

    fn resize(&mut self, size: RenderSize) -> Result<()> {
        if size == self.core.prefs.size && !self.core.paused {
            return Ok(());
        }
        self.core.prefs.size = size;
        Ok(self.recreate_swapchain()?)
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.core.clear_color = rgba;
    }

    fn set_vsync(&mut self, on: bool) {
        if self.core.prefs.vsync == on {
            return;
        }
        self.core.prefs.vsync = on;
        self.core.needs_recreate = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Rec {
        Open(RenderpassKind),
        Close,
        Warp(WarpParams),
    }

    /// Records what the chain asks for; asserts passes never nest.
    #[derive(Default)]
    struct Recorder {
        recs: Vec<Rec>,
        open: bool,
    }

    impl PassOps for Recorder {
        fn open_pass(&mut self, kind: RenderpassKind) -> VkResult<()> {
            assert!(!self.open, "{kind:?} opened inside another pass");
            self.open = true;
            self.recs.push(Rec::Open(kind));
            Ok(())
        }

        fn close_pass(&mut self) {
            assert!(self.open, "close without an open pass");
            self.open = false;
            self.recs.push(Rec::Close);
        }

        fn record_warp(&mut self, params: WarpParams) -> VkResult<()> {
            assert!(self.open);
            self.recs.push(Rec::Warp(params));
            Ok(())
        }
    }

    const WAVY: WarpParams = WarpParams {
        time: 1.5,
        intensity: 0.25,
    };

    #[test]
    fn ui_alone_replays_an_empty_world_and_a_plain_warp() {
        let (mut chain, mut rec) = (PassChain::default(), Recorder::default());
        chain.begin(&mut rec, RenderpassKind::Ui).unwrap();
        assert_eq!(
            rec.recs,
            [
                Rec::Open(RenderpassKind::World),
                Rec::Close,
                Rec::Open(RenderpassKind::WorldWarp),
                Rec::Warp(WarpParams::default()),
                Rec::Close,
                Rec::Open(RenderpassKind::Ui),
            ]
        );
        assert_eq!(chain.open, Some(RenderpassKind::Ui));
    }

    #[test]
    fn warp_then_ui_does_not_replay_the_warp() {
        let (mut chain, mut rec) = (PassChain::default(), Recorder::default());
        chain.begin(&mut rec, RenderpassKind::WorldWarp).unwrap();
        assert_eq!(
            rec.recs,
            [
                Rec::Open(RenderpassKind::World),
                Rec::Close,
                Rec::Open(RenderpassKind::WorldWarp),
            ]
        );
        rec.recs.clear();

        chain.begin(&mut rec, RenderpassKind::Ui).unwrap();
        assert_eq!(rec.recs, [Rec::Close, Rec::Open(RenderpassKind::Ui)]);
        // reopening the current pass records nothing
        chain.begin(&mut rec, RenderpassKind::Ui).unwrap();
        assert_eq!(rec.recs.len(), 2);
    }

    #[test]
    fn end_world_runs_warp_with_params_and_opens_ui() {
        let (mut chain, mut rec) = (PassChain::default(), Recorder::default());
        chain.begin(&mut rec, RenderpassKind::World).unwrap();
        chain.end_world(&mut rec, WAVY).unwrap();
        assert_eq!(
            rec.recs,
            [
                Rec::Open(RenderpassKind::World),
                Rec::Close,
                Rec::Open(RenderpassKind::WorldWarp),
                Rec::Warp(WAVY),
                Rec::Close,
                Rec::Open(RenderpassKind::Ui),
            ]
        );
    }

    #[test]
    fn end_world_without_world_records_an_empty_one() {
        let (mut chain, mut rec) = (PassChain::default(), Recorder::default());
        chain.end_world(&mut rec, WAVY).unwrap();
        assert_eq!(rec.recs[..2], [Rec::Open(RenderpassKind::World), Rec::Close]);
        assert_eq!(chain.open, Some(RenderpassKind::Ui));
    }

    #[test]
    fn end_world_after_world_closed_is_rejected() {
        for kind in [RenderpassKind::WorldWarp, RenderpassKind::Ui] {
            let (mut chain, mut rec) = (PassChain::default(), Recorder::default());
            chain.begin(&mut rec, kind).unwrap();
            let n = rec.recs.len();
            match chain.end_world(&mut rec, WAVY) {
                Err(VkError::RenderpassOrder { requested }) => assert_eq!(requested, "world-warp"),
                other => panic!("after {kind:?}: unexpected {other:?}"),
            }
            assert_eq!(rec.recs.len(), n);
            assert_eq!(chain.open, Some(kind));
        }
    }

    #[test]
    fn going_back_records_nothing() {
        let (mut chain, mut rec) = (PassChain::default(), Recorder::default());
        chain.begin(&mut rec, RenderpassKind::Ui).unwrap();
        let n = rec.recs.len();
        assert!(chain.begin(&mut rec, RenderpassKind::WorldWarp).is_err());
        assert!(chain.begin(&mut rec, RenderpassKind::World).is_err());
        assert_eq!(rec.recs.len(), n);
    }

    #[test]
    fn ui_first_runs_world_and_warp() {
        let chain = PassChain::default();
        let skipped = chain.skipped(RenderpassKind::Ui).unwrap().unwrap();
        assert_eq!(skipped, vec![RenderpassKind::World, RenderpassKind::WorldWarp]);
    }

    #[test]
    fn open_pass_is_not_reopened() {
        let mut chain = PassChain::default();
        chain.opened(RenderpassKind::World);
        assert!(chain.skipped(RenderpassKind::World).unwrap().is_none());
        let skipped = chain.skipped(RenderpassKind::Ui).unwrap().unwrap();
        assert_eq!(skipped, vec![RenderpassKind::WorldWarp]);
    }

    #[test]
    fn earlier_pass_is_rejected() {
        let mut chain = PassChain::default();
        chain.opened(RenderpassKind::Ui);
        match chain.skipped(RenderpassKind::World) {
            Err(VkError::RenderpassOrder { requested }) => assert_eq!(requested, "world"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!VkError::RenderpassOrder { requested: "world" }.is_fatal());
    }

    #[test]
    fn warp_after_world_skips_nothing() {
        let mut chain = PassChain::default();
        chain.opened(RenderpassKind::World);
        chain.open = None;
        assert_eq!(
            chain.skipped(RenderpassKind::WorldWarp).unwrap().unwrap(),
            Vec::new()
        );
    }

    #[test]
    fn default_warp_is_undistorted() {
        let p = WarpParams::default();
        assert_eq!(p.intensity, 0.0);
        assert_eq!(p.time, 0.0);
    }
}
