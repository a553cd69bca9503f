// SPDX-License-Identifier: CEPL-1.0
use anyhow::Result;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VsyncMode {
    Fifo,    // Target monitor refresh rate
    #[default]
    Mailbox, // Smart Vsync, fps uncapped
}

/// `[render]` section of the app config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// World-pass sample count: 1, 2, 4, 8 or 16.
    pub msaa: u32,
    pub validation: bool,
    /// Preferred physical device index; ignored when that device is unsuitable.
    pub device_index: Option<usize>,
    /// Clear the world color attachment on load instead of leaving it undefined.
    pub clear_color_attachment: bool,
    pub vsync: bool,
    pub vsync_mode: VsyncMode,
    pub clear_color: [f32; 4],
    /// Directory holding `<name>.<vert|frag>.spv` blobs, used instead of the
    /// shaders built into the binary.
    pub shader_dir: Option<PathBuf>,
    /// Minimum sample shading fraction for world pipelines; needs MSAA and
    /// device support.
    pub sample_shading: Option<f32>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            msaa: 1,
            validation: false,
            device_index: None,
            clear_color_attachment: true,
            vsync: true,
            vsync_mode: VsyncMode::Mailbox,
            clear_color: [1.0, 0.0, 0.5, 1.0],
            shader_dir: None,
            sample_shading: None,
        }
    }
}

/// Window-facing lifecycle shared by backends. Frame recording stays on the
/// concrete backend type.
pub trait Renderer {
    fn new(
        window: &dyn HasWindowHandle,
        display: &dyn HasDisplayHandle,
        size: RenderSize,
        cfg: &RenderConfig,
    ) -> Result<Self>
    where
        Self: Sized;

    fn resize(&mut self, size: RenderSize) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
    fn set_vsync(&mut self, _on: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_uses_defaults() {
        let cfg: RenderConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.msaa, 1);
        assert!(cfg.clear_color_attachment);
        assert!(cfg.device_index.is_none());
        assert_eq!(cfg.vsync_mode, VsyncMode::Mailbox);
        assert!(cfg.sample_shading.is_none());
    }

    #[test]
    fn partial_table_overrides_fields() {
        let cfg: RenderConfig = toml::from_str(
            r#"
            msaa = 4
            validation = true
            device_index = 1
            vsync_mode = "fifo"
            clear_color = [0.0, 0.0, 0.0, 1.0]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.msaa, 4);
        assert!(cfg.validation);
        assert_eq!(cfg.device_index, Some(1));
        assert_eq!(cfg.vsync_mode, VsyncMode::Fifo);
        assert_eq!(cfg.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert!(cfg.vsync);
    }

    #[test]
    fn zero_sized_surface_is_empty() {
        assert!(RenderSize { width: 0, height: 10 }.is_empty());
        assert!(!RenderSize { width: 1, height: 1 }.is_empty());
    }
}
