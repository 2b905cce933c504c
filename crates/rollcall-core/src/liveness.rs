//! Passive anti-spoofing over the pixels of a single photo.
//!
//! Two checks, each a pass/fail vote:
//!
//! - **Sharpness:** variance of the Laplacian of the grey image. Printed or
//!   re-photographed faces come out soft and score low.
//! - **Skin ratio:** share of pixels inside a skin-tone HSV band. A live
//!   face in frame sits between 15% and 60%; screens and flat prints
//!   usually fall outside it.
//!
//! The score is the fraction of checks passed. Neither check blocks
//! replayed video or 3D masks.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Laplacian variance below which a photo is considered too soft.
pub const DEFAULT_BLUR_THRESHOLD: f64 = 100.0;

/// Minimum score a photo needs to be accepted. With two checks this
/// means both must pass.
pub const DEFAULT_MIN_SCORE: f32 = 0.7;

const SKIN_RATIO_MIN: f64 = 0.15;
const SKIN_RATIO_MAX: f64 = 0.60;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessPolicy {
    /// Score below which a photo is rejected. `0.0` accepts every photo
    /// but still records the score.
    pub min_score: f32,
    pub blur_threshold: f64,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            min_score: DEFAULT_MIN_SCORE,
            blur_threshold: DEFAULT_BLUR_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessResult {
    pub is_live: bool,
    /// Fraction of checks passed, in [0, 1].
    pub score: f32,
    pub laplacian_variance: f64,
    pub skin_ratio: f64,
}

pub fn check_liveness(image: &DynamicImage, policy: &LivenessPolicy) -> LivenessResult {
    let laplacian_variance = laplacian_variance(image);
    let skin_ratio = skin_ratio(image);

    let sharp = laplacian_variance > policy.blur_threshold;
    let skin = skin_ratio > SKIN_RATIO_MIN && skin_ratio < SKIN_RATIO_MAX;
    let score = f32::from(u8::from(sharp) + u8::from(skin)) / 2.0;

    tracing::debug!(laplacian_variance, skin_ratio, score, "liveness scored");
    LivenessResult {
        is_live: score >= policy.min_score,
        score,
        laplacian_variance,
        skin_ratio,
    }
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
fn laplacian_variance(image: &DynamicImage) -> f64 {
    let gray = image.to_luma8();
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| f64::from(gray.get_pixel(x, y).0[0]);
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }
    let mean = sum / n;
    sum_sq / n - mean * mean
}

/// Share of pixels with hue 0..=40 degrees, saturation >= 20/255 and
/// value >= 70/255.
fn skin_ratio(image: &DynamicImage) -> f64 {
    let rgb = image.to_rgb8();
    let total = u64::from(rgb.width()) * u64::from(rgb.height());
    if total == 0 {
        return 0.0;
    }
    let skin = rgb.pixels().filter(|p| is_skin(p.0)).count() as u64;
    skin as f64 / total as f64
}

fn is_skin([r, g, b]: [u8; 3]) -> bool {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    if max < 70 {
        return false;
    }
    let chroma = f32::from(max - min);
    let saturation = 255.0 * chroma / f32::from(max);
    if saturation < 20.0 || chroma == 0.0 {
        return false;
    }

    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let hue = if r >= g && r >= b {
        (60.0 * (g - b) / chroma).rem_euclid(360.0)
    } else if g >= b {
        60.0 * (b - r) / chroma + 120.0
    } else {
        60.0 * (r - g) / chroma + 240.0
    };
    hue <= 40.0
}
