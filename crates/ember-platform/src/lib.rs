// SPDX-License-Identifier: CEPL-1.0
pub use winit;

use ember_render::RenderSize;
use winit::dpi::PhysicalSize;

/// Physical window size as the renderer sees it. Zero stays zero so a
/// minimized window pauses rendering instead of building a 1x1 swapchain.
pub fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize {
        width: size.width,
        height: size.height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimized_window_maps_to_empty_size() {
        assert!(render_size(PhysicalSize::new(0, 0)).is_empty());
        assert_eq!(
            render_size(PhysicalSize::new(800, 600)),
            RenderSize {
                width: 800,
                height: 600
            }
        );
    }
}
