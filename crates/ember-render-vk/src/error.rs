// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use gpu_allocator::AllocationError;
use thiserror::Error;

pub type VkResult<T> = std::result::Result<T, VkError>;

#[derive(Debug, Error)]
pub enum VkError {
    #[error("failed to load the Vulkan loader: {0}")]
    Loading(#[from] ash::LoadingError),
    #[error("{call} failed: {}", error_to_string(*.result))]
    Api {
        call: &'static str,
        result: vk::Result,
    },
    #[error("gpu allocator: {0}")]
    Allocation(#[from] AllocationError),
    #[error("window handle: {0}")]
    Window(#[from] raw_window_handle::HandleError),
    #[error("no physical device with graphics + present queues and swapchain support")]
    NoSuitableDevice,
    #[error("shader module {0}: missing or not SPIR-V")]
    InvalidShader(String),
    #[error("staging request of {requested} bytes exceeds the {max} byte staging buffer")]
    StagingOverflow { requested: u64, max: u64 },
    #[error("uniform block of {size} bytes exceeds the {max} byte descriptor range")]
    UniformTooLarge { size: u64, max: u64 },
    #[error("triangle fan of {requested} indices exceeds 16-bit index range")]
    FanTooLarge { requested: u32 },
    #[error("swapchain out of date; recreated, frame skipped")]
    SwapchainOutOfDate,
    #[error("frame not begun")]
    NotReady,
    #[error("frame already begun")]
    FrameInProgress,
    #[error("texture {width}x{height} expects RGBA8 data, got {len} bytes")]
    TextureSize { width: u32, height: u32, len: usize },
    #[error("renderpass {requested} was already recorded this frame")]
    RenderpassOrder { requested: &'static str },
}

impl VkError {
    /// Stale swapchains and frame-state misuse leave the renderer usable.
    /// Everything else ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            VkError::SwapchainOutOfDate
                | VkError::NotReady
                | VkError::FrameInProgress
                | VkError::RenderpassOrder { .. }
                | VkError::TextureSize { .. }
        )
    }
}

/// Turns raw API results into [`VkError::Api`] tagged with the failing call.
pub(crate) trait CheckVk<T> {
    fn check(self, call: &'static str) -> VkResult<T>;
}

impl<T> CheckVk<T> for Result<T, vk::Result> {
    fn check(self, call: &'static str) -> VkResult<T> {
        self.map_err(|result| VkError::Api { call, result })
    }
}

pub fn error_to_string(result: vk::Result) -> &'static str {
    match result {
        vk::Result::SUCCESS => "VK_SUCCESS",
        vk::Result::NOT_READY => "VK_NOT_READY",
        vk::Result::TIMEOUT => "VK_TIMEOUT",
        vk::Result::EVENT_SET => "VK_EVENT_SET",
        vk::Result::EVENT_RESET => "VK_EVENT_RESET",
        vk::Result::INCOMPLETE => "VK_INCOMPLETE",
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => "VK_ERROR_OUT_OF_HOST_MEMORY",
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => "VK_ERROR_OUT_OF_DEVICE_MEMORY",
        vk::Result::ERROR_INITIALIZATION_FAILED => "VK_ERROR_INITIALIZATION_FAILED",
        vk::Result::ERROR_DEVICE_LOST => "VK_ERROR_DEVICE_LOST",
        vk::Result::ERROR_MEMORY_MAP_FAILED => "VK_ERROR_MEMORY_MAP_FAILED",
        vk::Result::ERROR_LAYER_NOT_PRESENT => "VK_ERROR_LAYER_NOT_PRESENT",
        vk::Result::ERROR_EXTENSION_NOT_PRESENT => "VK_ERROR_EXTENSION_NOT_PRESENT",
        vk::Result::ERROR_FEATURE_NOT_PRESENT => "VK_ERROR_FEATURE_NOT_PRESENT",
        vk::Result::ERROR_INCOMPATIBLE_DRIVER => "VK_ERROR_INCOMPATIBLE_DRIVER",
        vk::Result::ERROR_TOO_MANY_OBJECTS => "VK_ERROR_TOO_MANY_OBJECTS",
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED => "VK_ERROR_FORMAT_NOT_SUPPORTED",
        vk::Result::ERROR_SURFACE_LOST_KHR => "VK_ERROR_SURFACE_LOST_KHR",
        vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR => "VK_ERROR_NATIVE_WINDOW_IN_USE_KHR",
        vk::Result::SUBOPTIMAL_KHR => "VK_SUBOPTIMAL_KHR",
        vk::Result::ERROR_OUT_OF_DATE_KHR => "VK_ERROR_OUT_OF_DATE_KHR",
        vk::Result::ERROR_INCOMPATIBLE_DISPLAY_KHR => "VK_ERROR_INCOMPATIBLE_DISPLAY_KHR",
        vk::Result::ERROR_VALIDATION_FAILED_EXT => "VK_ERROR_VALIDATION_FAILED_EXT",
        vk::Result::ERROR_INVALID_SHADER_NV => "VK_ERROR_INVALID_SHADER_NV",
        _ => "<unknown>",
    }
}
