// Quality selection strategies: map (bandwidth estimate, buffer state) to a
// target rendition index.

use crate::media::Quality;

/// Inputs to a selection decision. `qualities` is sorted by bandwidth
/// ascending; `current_index` points into it.
pub struct SelectionContext<'a> {
    pub qualities: &'a [Quality],
    pub current_index: usize,
    pub bandwidth_bps: Option<f64>,
    pub buffer_ahead: f64,
    pub buffer_target: f64,
    pub switch_up_threshold: f64,
    pub switch_down_threshold: f64,
    /// Buffer bounds for strategies that reason about absolute fill.
    pub min_buffer: f64,
    pub max_buffer: f64,
}

impl SelectionContext<'_> {
    /// Buffer fill ratio bounded to [0, 1].
    pub fn buffer_ratio(&self) -> f64 {
        if self.buffer_target <= 0.0 {
            return 0.0;
        }
        (self.buffer_ahead / self.buffer_target).clamp(0.0, 1.0)
    }
}

pub trait QualitySelector: Send + Sync {
    fn name(&self) -> &'static str;

    /// The rendition to play next. Returning `current_index` holds.
    fn select(&self, ctx: &SelectionContext<'_>) -> usize;
}

/// Highest index above `current` whose bandwidth, scaled by `margin`, fits
/// within the estimate.
fn highest_affordable(ctx: &SelectionContext<'_>, margin: f64) -> Option<usize> {
    let bandwidth = ctx.bandwidth_bps?;
    ctx.qualities
        .iter()
        .enumerate()
        .skip(ctx.current_index + 1)
        .filter(|(_, q)| bandwidth > margin * q.bandwidth as f64)
        .map(|(i, _)| i)
        .next_back()
}

/// The default threshold strategy: step down under buffer pressure, jump to
/// the highest affordable rendition when the buffer is comfortable.
pub struct ThresholdSelector;

impl QualitySelector for ThresholdSelector {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> usize {
        let ratio = ctx.buffer_ratio();
        if ratio < ctx.switch_down_threshold {
            return ctx.current_index.saturating_sub(1);
        }
        if ratio > ctx.switch_up_threshold
            && let Some(target) = highest_affordable(ctx, 1.2)
        {
            return target;
        }
        ctx.current_index
    }
}

/// Up-switches only with a wide margin and a nearly full buffer.
pub struct ConservativeSelector;

impl QualitySelector for ConservativeSelector {
    fn name(&self) -> &'static str {
        "conservative"
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> usize {
        let ratio = ctx.buffer_ratio();
        if ratio < ctx.switch_down_threshold {
            return ctx.current_index.saturating_sub(1);
        }
        if ratio > 0.8
            && let Some(target) = highest_affordable(ctx, 1.5)
        {
            return target;
        }
        ctx.current_index
    }
}

/// Up-switches early with a thin margin.
pub struct AggressiveSelector;

impl QualitySelector for AggressiveSelector {
    fn name(&self) -> &'static str {
        "aggressive"
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> usize {
        let ratio = ctx.buffer_ratio();
        if ratio < ctx.switch_down_threshold {
            return ctx.current_index.saturating_sub(1);
        }
        if ratio > 0.5
            && let Some(target) = highest_affordable(ctx, 1.2)
        {
            return target;
        }
        ctx.current_index
    }
}

/// Ignores bandwidth entirely: the buffer ratio maps linearly onto the
/// rendition ladder.
pub struct BufferBasedSelector;

impl QualitySelector for BufferBasedSelector {
    fn name(&self) -> &'static str {
        "buffer-based"
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> usize {
        if ctx.qualities.is_empty() {
            return 0;
        }
        let ratio = ctx.buffer_ratio();
        (ratio * (ctx.qualities.len() - 1) as f64).floor() as usize
    }
}

/// Composite of bandwidth feasibility (0.6) and buffer fill (0.4); the
/// highest rendition with a full composite wins.
pub struct HybridSelector;

impl QualitySelector for HybridSelector {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> usize {
        let ratio = ctx.buffer_ratio();
        let Some(bandwidth) = ctx.bandwidth_bps else {
            return ctx.current_index;
        };
        let mut best = ctx.current_index.min(ctx.qualities.len().saturating_sub(1));
        let mut best_score = f64::MIN;
        for (i, quality) in ctx.qualities.iter().enumerate() {
            let feasibility = (bandwidth / (1.2 * quality.bandwidth as f64)).min(1.0);
            let score = 0.6 * feasibility + 0.4 * ratio;
            // Ties favor the higher rendition.
            if score >= best_score {
                best_score = score;
                best = i;
            }
        }
        best
    }
}

/// BOLA-style utility rule: utility = V·ln(bitrate/min) − buffer·bitrate,
/// with V = (maxBuffer − minBuffer)/ln 2 and bitrates normalized to the
/// lowest rendition.
pub struct BolaSelector;

impl QualitySelector for BolaSelector {
    fn name(&self) -> &'static str {
        "bola"
    }

    fn select(&self, ctx: &SelectionContext<'_>) -> usize {
        if ctx.qualities.is_empty() {
            return 0;
        }
        let min_bitrate = ctx.qualities[0].bandwidth.max(1) as f64;
        let v = (ctx.max_buffer - ctx.min_buffer).max(f64::EPSILON) / std::f64::consts::LN_2;
        let mut best = 0;
        let mut best_utility = f64::MIN;
        for (i, quality) in ctx.qualities.iter().enumerate() {
            let relative = quality.bandwidth as f64 / min_bitrate;
            let utility = v * relative.ln() - ctx.buffer_ahead * relative;
            if utility > best_utility {
                best_utility = utility;
                best = i;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> Vec<Quality> {
        [(480, 1_200_000u64), (720, 2_500_000), (1080, 5_000_000)]
            .iter()
            .map(|(h, bw)| Quality {
                id: format!("{h}p"),
                bandwidth: *bw,
                width: h * 16 / 9,
                height: *h,
                codecs: "avc1.640028,mp4a.40.2".into(),
                frame_rate: None,
            })
            .collect()
    }

    fn ctx<'a>(
        qualities: &'a [Quality],
        current: usize,
        bandwidth: Option<f64>,
        ahead: f64,
    ) -> SelectionContext<'a> {
        SelectionContext {
            qualities,
            current_index: current,
            bandwidth_bps: bandwidth,
            buffer_ahead: ahead,
            buffer_target: 30.0,
            switch_up_threshold: 0.8,
            switch_down_threshold: 0.3,
            min_buffer: 8.0,
            max_buffer: 60.0,
        }
    }

    #[test]
    fn threshold_steps_down_under_pressure() {
        let qualities = ladder();
        let c = ctx(&qualities, 2, Some(10_000_000.0), 3.0);
        assert_eq!(ThresholdSelector.select(&c), 1);
        // Already at the floor: stays.
        let c = ctx(&qualities, 0, Some(10_000_000.0), 3.0);
        assert_eq!(ThresholdSelector.select(&c), 0);
    }

    #[test]
    fn threshold_steps_up_with_headroom() {
        let qualities = ladder();
        // 27 s of 30 s target = 0.9 ratio; 7 Mbps > 1.2 * 5 Mbps.
        let c = ctx(&qualities, 1, Some(7_000_000.0), 27.0);
        assert_eq!(ThresholdSelector.select(&c), 2);
        // 5 Mbps is not enough for 1080p at the 1.2 margin.
        let c = ctx(&qualities, 1, Some(5_500_000.0), 27.0);
        assert_eq!(ThresholdSelector.select(&c), 1);
    }

    #[test]
    fn threshold_holds_in_the_middle_band() {
        let qualities = ladder();
        let c = ctx(&qualities, 1, Some(100_000_000.0), 15.0);
        assert_eq!(ThresholdSelector.select(&c), 1);
    }

    #[test]
    fn threshold_is_stable_across_calls() {
        let qualities = ladder();
        let c = ctx(&qualities, 1, Some(4_000_000.0), 15.0);
        let first = ThresholdSelector.select(&c);
        for _ in 0..10 {
            assert_eq!(ThresholdSelector.select(&c), first);
        }
    }

    #[test]
    fn conservative_needs_full_buffer_and_wide_margin() {
        let qualities = ladder();
        // 0.9 ratio but margin 1.5 requires > 7.5 Mbps for 1080p.
        let c = ctx(&qualities, 1, Some(7_000_000.0), 27.0);
        assert_eq!(ConservativeSelector.select(&c), 1);
        let c = ctx(&qualities, 1, Some(8_000_000.0), 27.0);
        assert_eq!(ConservativeSelector.select(&c), 2);
    }

    #[test]
    fn aggressive_switches_at_half_buffer() {
        let qualities = ladder();
        let c = ctx(&qualities, 0, Some(7_000_000.0), 16.0);
        assert_eq!(AggressiveSelector.select(&c), 2);
    }

    #[test]
    fn buffer_based_maps_ratio_to_ladder() {
        let qualities = ladder();
        assert_eq!(BufferBasedSelector.select(&ctx(&qualities, 0, None, 0.0)), 0);
        assert_eq!(BufferBasedSelector.select(&ctx(&qualities, 0, None, 16.0)), 1);
        assert_eq!(BufferBasedSelector.select(&ctx(&qualities, 0, None, 30.0)), 2);
    }

    #[test]
    fn hybrid_prefers_highest_feasible() {
        let qualities = ladder();
        let c = ctx(&qualities, 0, Some(100_000_000.0), 30.0);
        assert_eq!(HybridSelector.select(&c), 2);
        let c = ctx(&qualities, 2, Some(1_000_000.0), 3.0);
        assert_eq!(HybridSelector.select(&c), 0);
    }

    #[test]
    fn bola_picks_highest_on_empty_buffer() {
        let qualities = ladder();
        let c = ctx(&qualities, 0, None, 0.0);
        assert_eq!(BolaSelector.select(&c), 2);
    }

    #[test]
    fn bola_decays_with_buffer_fill() {
        let qualities = ladder();
        // With a large buffer the linear penalty dominates the log utility.
        let c = ctx(&qualities, 2, None, 200.0);
        assert_eq!(BolaSelector.select(&c), 0);
    }
}
