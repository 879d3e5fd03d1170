//! Stateless pieces of the feature transforms.

use crate::utils::deviation::Deviation;

/// Floor on the standard deviation used when z-scoring.
pub const MINIMUM_DEVIATION: f64 = 1e-3;

/// Clipped z-score of `value` under `stat`.
pub fn z_score(value: f64, stat: &Deviation, clip_factor: f64) -> f64 {
    let deviation = stat.deviation().max(MINIMUM_DEVIATION);
    ((value - stat.mean()) / deviation).clamp(-clip_factor, clip_factor)
}

/// Inverse of `z_score`, ignoring clipping.
pub fn denormalize(z: f64, stat: &Deviation) -> f64 {
    z * stat.deviation().max(MINIMUM_DEVIATION) + stat.mean()
}

/// Replace every shingle slot with its difference from the preceding slot,
/// channel by channel. The first slot has no predecessor and becomes zero.
pub fn difference(shingle: &mut [f64], channels: usize) {
    if channels == 0 {
        return;
    }
    let slots = shingle.len() / channels;
    for s in (1..slots).rev() {
        for c in 0..channels {
            shingle[s * channels + c] -= shingle[(s - 1) * channels + c];
        }
    }
    let head = channels.min(shingle.len());
    shingle[..head].iter_mut().for_each(|v| *v = 0.0);
}

/// Z-score each channel of every slot with that channel's statistics.
pub fn normalize(shingle: &mut [f64], stats: &[Deviation], clip_factor: f64) {
    let channels = stats.len();
    if channels == 0 {
        return;
    }
    for (i, v) in shingle.iter_mut().enumerate() {
        *v = z_score(*v, &stats[i % channels], clip_factor);
    }
}
