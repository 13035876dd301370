//! Decoding of the grounding model's raw outputs into ranked time windows.

use super::WindowPrediction;

/// Probability of the foreground class (index 0) after a softmax over the
/// two logits of one moment query.
pub(crate) fn foreground_score(logits: [f32; 2]) -> f32 {
    let max = logits[0].max(logits[1]);
    let fg = (logits[0] - max).exp();
    let bg = (logits[1] - max).exp();
    fg / (fg + bg)
}

/// `(center, width)` to `(start, end)`, both normalized to the video length.
pub(crate) fn cxw_to_xx(span: [f32; 2]) -> (f32, f32) {
    let [center, width] = span;
    (center - 0.5 * width, center + 0.5 * width)
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Scales every span by `duration`, ranks by descending foreground score and
/// rounds the numbers to four decimals.
pub(crate) fn rank_windows(
    logits: &[[f32; 2]],
    spans: &[[f32; 2]],
    duration: f64,
) -> Vec<WindowPrediction> {
    let mut windows: Vec<WindowPrediction> = logits
        .iter()
        .zip(spans)
        .map(|(&logits, &span)| {
            let (start, end) = cxw_to_xx(span);
            WindowPrediction {
                start: f64::from(start) * duration,
                end: f64::from(end) * duration,
                score: f64::from(foreground_score(logits)),
            }
        })
        .collect();
    windows.sort_by(|a, b| b.score.total_cmp(&a.score));
    for window in &mut windows {
        window.start = round4(window.start);
        window.end = round4(window.end);
        window.score = round4(window.score);
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_logits_give_even_odds() {
        assert!((foreground_score([0.3, 0.3]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn foreground_score_is_stable_for_large_logits() {
        let score = foreground_score([1000.0, 0.0]);
        assert!((score - 1.0).abs() < 1e-6);
        assert!(foreground_score([0.0, 1000.0]) < 1e-6);
    }

    #[test]
    fn center_width_converts_to_endpoints() {
        let (start, end) = cxw_to_xx([0.5, 0.2]);
        assert!((start - 0.4).abs() < 1e-6);
        assert!((end - 0.6).abs() < 1e-6);
    }

    #[test]
    fn rounding_keeps_four_decimals() {
        assert_eq!(round4(12.345_678), 12.3457);
        assert_eq!(round4(0.1), 0.1);
    }

    #[test]
    fn windows_are_ranked_and_scaled() {
        let logits = [[0.0, 2.0], [3.0, 0.0], [1.0, 1.0]];
        let spans = [[0.1, 0.1], [0.25, 0.1], [0.5, 0.5]];
        let windows = rank_windows(&logits, &spans, 60.0);

        assert_eq!(windows.len(), 3);
        assert!(windows.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(windows[0].start, 12.0);
        assert_eq!(windows[0].end, 18.0);
        assert_eq!(windows[1].score, 0.5);
        assert_eq!(windows[2].start, 3.0);
    }
}
