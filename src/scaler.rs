//! Image scaler – aspect-preserving output sizes within min/max bounds.

use serde::Serialize;

use crate::config::ImageBounds;

/// Output size of an embedded image, in whole sink units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Scale `natural_width × natural_height` to fit `bounds`, with the width cap
/// further limited by `available_width` (the cell's inner width).
///
/// When the lower bound and the upper bound cannot both hold, the lower bound
/// wins.
pub fn scale_image(
    natural_width: u32,
    natural_height: u32,
    bounds: &ImageBounds,
    available_width: f32,
) -> ImageSize {
    if natural_width == 0 || natural_height == 0 {
        return ImageSize {
            width: floor_unit(bounds.min_width),
            height: floor_unit(bounds.min_height),
        };
    }
    let (w, h) = (natural_width as f32, natural_height as f32);

    let max_w = bounds.max_width.min(available_width.max(1.0));
    let ratio_upper = (max_w / w).min(bounds.max_height / h);
    let ratio_lower = (bounds.min_width / w).max(bounds.min_height / h).max(0.0);

    // Never upscale past natural size, then clamp into [lower, upper].
    let ratio = ratio_upper.min(1.0).max(ratio_lower);

    ImageSize {
        width: floor_unit(w * ratio),
        height: floor_unit(h * ratio),
    }
}

fn floor_unit(v: f32) -> u32 {
    if v.is_finite() {
        (v.floor() as u32).max(1)
    } else {
        1
    }
}
