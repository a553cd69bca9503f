// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
//! Vulkan backend: device bootstrap, swapchain, the world/warp/ui pass chain,
//! per-frame buffer arenas and the frame loop that ties them together.

pub mod descriptors;
pub mod device;
pub mod dynbuf;
pub mod error;
pub mod fan;
pub mod frame;
pub mod graveyard;
pub mod pipeline;
pub mod renderer;
pub mod renderpass;
pub mod shaders;
pub mod staging;
pub mod swapchain;
pub mod targets;
pub mod texture;

/// Frames the CPU may record ahead of the GPU.
pub const FRAMES_IN_FLIGHT: usize = 2;

pub use ash::vk;
pub use descriptors::{SamplerKind, SetLayouts, MAX_TEXTURES};
pub use dynbuf::{BufferStats, Suballocation, UNIFORM_ALLOC_SIZE};
pub use error::{error_to_string, VkError, VkResult};
pub use frame::{FramePhase, PresentStatus};
pub use pipeline::{Pipeline, PipelineKind};
pub use renderer::{RectBuffers, VkRenderer, WarpParams};
pub use renderpass::RenderpassKind;
pub use staging::{StagingRegion, STAGING_BUFFER_MAX};
pub use texture::Texture;
