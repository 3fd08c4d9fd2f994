//! Row flagging from baseline-fit statistics.
//!
//! Each row carries RMS figures from the baseline fit; rows whose figures
//! stray too far from their neighbours, or from the radiometer expectation,
//! are flagged out of the gridding. Flags are advisory until the summary
//! flag folds them together.

use crate::config::ReduceParams;
use crate::reduction::table::DataTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Half-width of the running-mean window, in rows.
const RUNNING_MEAN_HALF_WIDTH: usize = 5;

/// Post-fit RMS may exceed the radiometer expectation by this factor.
const EXPECTED_RMS_RATIO: f64 = 1.333;

/// Per-statistic sigma thresholds, iteratively tightened.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlagThresholds {
    /// Sigma cut on the low-frequency (baseline-shape) RMS.
    pub low_freq: f64,
    /// Sigma cut on the post-fit RMS.
    pub post_fit: f64,
    /// Sigma cut on the pre-fit RMS.
    pub pre_fit: f64,
    /// Sigma cut on the post-fit running-mean deviation.
    pub post_fit_diff: f64,
    /// Sigma cut on the pre-fit running-mean deviation.
    pub pre_fit_diff: f64,
}

impl Default for FlagThresholds {
    fn default() -> Self {
        Self {
            low_freq: 4.5,
            post_fit: 4.0,
            pre_fit: 4.0,
            post_fit_diff: 4.5,
            pre_fit_diff: 4.5,
        }
    }
}

/// Counts of rows failing each flag after a flagging pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSummary {
    /// Rows examined.
    pub rows: usize,
    /// Rows failing the low-frequency RMS cut.
    pub low_freq: usize,
    /// Rows failing the post-fit RMS cut.
    pub post_fit: usize,
    /// Rows failing the pre-fit RMS cut.
    pub pre_fit: usize,
    /// Rows failing the post-fit running-mean cut.
    pub post_fit_diff: usize,
    /// Rows failing the pre-fit running-mean cut.
    pub pre_fit_diff: usize,
    /// Rows whose post-fit RMS exceeds the radiometer expectation.
    pub expected: usize,
    /// Rows flagged out by the operator.
    pub user: usize,
    /// Rows with the summary flag down after the pass.
    pub flagged: usize,
}

/// Fills in the running-mean deviation statistics for the selected rows.
///
/// For each row the mean post-fit and pre-fit RMS of up to
/// `RUNNING_MEAN_HALF_WIDTH` neighbours on each side (the row itself
/// excluded) is subtracted from the row's own figure.
pub fn compute_running_mean_deviation(rows: &mut DataTable, selected: &[usize]) {
    let post: Vec<Option<f64>> = selected
        .iter()
        .map(|&id| rows[id].stats.post_fit_rms)
        .collect();
    let pre: Vec<Option<f64>> = selected
        .iter()
        .map(|&id| rows[id].stats.pre_fit_rms)
        .collect();
    for (pos, &id) in selected.iter().enumerate() {
        let lo = pos.saturating_sub(RUNNING_MEAN_HALF_WIDTH);
        let hi = (pos + RUNNING_MEAN_HALF_WIDTH + 1).min(selected.len());
        let window_mean = |values: &[Option<f64>]| {
            let mut sum = 0.0;
            let mut count = 0usize;
            for (i, v) in values.iter().enumerate().take(hi).skip(lo) {
                if i == pos {
                    continue;
                }
                if let Some(v) = v {
                    sum += v;
                    count += 1;
                }
            }
            (count > 0).then(|| sum / count as f64)
        };
        let row = &mut rows[id];
        row.stats.post_fit_rms_diff = match (row.stats.post_fit_rms, window_mean(&post)) {
            (Some(own), Some(mean)) => Some(own - mean),
            _ => None,
        };
        row.stats.pre_fit_rms_diff = match (row.stats.pre_fit_rms, window_mean(&pre)) {
            (Some(own), Some(mean)) => Some(own - mean),
            _ => None,
        };
    }
}

/// Radiometer-equation RMS expectation for each selected row.
///
/// `Tsys / sqrt(bandwidth * exposure)` with the channel bandwidth taken
/// from the abscissa spacing in Hz.
pub fn compute_expected_rms(rows: &mut DataTable, selected: &[usize], channel_width_hz: f64) {
    for &id in selected {
        let row = &mut rows[id];
        if row.exposure > 0.0 && channel_width_hz > 0.0 {
            row.stats.expected_rms = Some(row.tsys / (channel_width_hz * row.exposure).sqrt());
        }
    }
}

/// Applies sigma-clip flags for one statistic across the selected rows.
///
/// Rows currently passing the flag define the mean and deviation; rows
/// beyond `threshold` sigma fail. Returns how many rows fail afterwards.
fn sigma_clip(
    rows: &mut DataTable,
    selected: &[usize],
    threshold: f64,
    stat: impl Fn(&crate::reduction::table::RowStatistics) -> Option<f64>,
    read: impl Fn(&crate::reduction::table::RowFlags) -> bool,
    write: impl Fn(&mut crate::reduction::table::RowFlags, bool),
) -> usize {
    let values: Vec<f64> = selected
        .iter()
        .filter(|&&id| read(&rows[id].flags))
        .filter_map(|&id| stat(&rows[id].stats))
        .collect();
    if values.len() < 2 {
        return 0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let sigma = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
        / values.len() as f64)
        .sqrt();
    let mut failed = 0;
    for &id in selected {
        let value = stat(&rows[id].stats);
        let pass = match value {
            Some(v) if sigma > 0.0 => (v - mean).abs() <= threshold * sigma,
            _ => true,
        };
        write(&mut rows[id].flags, pass);
        if !pass {
            failed += 1;
        }
    }
    failed
}

/// Runs the iterative flagging pass over the selected rows.
///
/// Each iteration re-derives the clip statistics from the rows that still
/// pass, so outliers stop biasing the mean once caught. Iteration stops
/// early when a pass changes nothing. The expected-RMS flag and user flags
/// are absolute and applied once.
pub fn flag_rows(
    rows: &mut DataTable,
    selected: &[usize],
    params: &ReduceParams,
    thresholds: &FlagThresholds,
) -> FlagSummary {
    for &id in selected {
        let row = &mut rows[id];
        row.flags.user = !params.user_flags.contains(&row.row);
        row.flags.expected = match (row.stats.post_fit_rms, row.stats.expected_rms) {
            (Some(post), Some(expected)) if expected > 0.0 => {
                post <= EXPECTED_RMS_RATIO * expected
            }
            _ => true,
        };
    }

    let mut summary = FlagSummary {
        rows: selected.len(),
        ..FlagSummary::default()
    };
    for iteration in 0..params.flag_iterations.max(1) {
        let next = FlagSummary {
            rows: selected.len(),
            low_freq: sigma_clip(
                rows,
                selected,
                thresholds.low_freq,
                |s| s.low_freq_rms,
                |f| f.low_freq,
                |f, pass| f.low_freq = pass,
            ),
            post_fit: sigma_clip(
                rows,
                selected,
                thresholds.post_fit,
                |s| s.post_fit_rms,
                |f| f.post_fit,
                |f, pass| f.post_fit = pass,
            ),
            pre_fit: sigma_clip(
                rows,
                selected,
                thresholds.pre_fit,
                |s| s.pre_fit_rms,
                |f| f.pre_fit,
                |f, pass| f.pre_fit = pass,
            ),
            post_fit_diff: sigma_clip(
                rows,
                selected,
                thresholds.post_fit_diff,
                |s| s.post_fit_rms_diff,
                |f| f.post_fit_diff,
                |f, pass| f.post_fit_diff = pass,
            ),
            pre_fit_diff: sigma_clip(
                rows,
                selected,
                thresholds.pre_fit_diff,
                |s| s.pre_fit_rms_diff,
                |f| f.pre_fit_diff,
                |f, pass| f.pre_fit_diff = pass,
            ),
            ..FlagSummary::default()
        };
        let converged = next == summary && iteration > 0;
        summary = next;
        if converged {
            debug!(iteration, "flagging converged");
            break;
        }
    }

    for &id in selected {
        let flags = &mut rows[id].flags;
        flags.update_summary();
        if !flags.summary {
            summary.flagged += 1;
        }
        if !flags.expected {
            summary.expected += 1;
        }
        if !flags.user {
            summary.user += 1;
        }
    }
    info!(
        rows = summary.rows,
        flagged = summary.flagged,
        "flagging pass complete"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::testkit::raster_observation;

    fn seed_stats(rows: &mut DataTable, selected: &[usize]) {
        for (pos, &id) in selected.iter().enumerate() {
            let base = 0.1 + 0.001 * (pos % 7) as f64;
            let row = &mut rows[id];
            row.stats.post_fit_rms = Some(base);
            row.stats.pre_fit_rms = Some(base * 1.5);
            row.stats.low_freq_rms = Some(base * 0.5);
        }
    }

    #[test]
    fn outlier_rms_is_flagged() {
        let mut obs = raster_observation(6, 6, 32);
        let selected: Vec<usize> = (0..obs.rows.len()).collect();
        seed_stats(&mut obs.rows, &selected);
        obs.rows[17].stats.post_fit_rms = Some(5.0);
        compute_running_mean_deviation(&mut obs.rows, &selected);
        let params = ReduceParams::default();
        let summary = flag_rows(&mut obs.rows, &selected, &params, &FlagThresholds::default());
        assert!(!obs.rows[17].flags.post_fit);
        assert!(!obs.rows[17].flags.summary);
        assert_eq!(summary.flagged, 1);
        // Its neighbours stay clean.
        assert!(obs.rows[16].flags.summary);
        assert!(obs.rows[18].flags.summary);
    }

    #[test]
    fn user_flags_are_absolute() {
        let mut obs = raster_observation(4, 4, 32);
        let selected: Vec<usize> = (0..obs.rows.len()).collect();
        seed_stats(&mut obs.rows, &selected);
        compute_running_mean_deviation(&mut obs.rows, &selected);
        let params = ReduceParams {
            user_flags: vec![3],
            ..ReduceParams::default()
        };
        let summary = flag_rows(&mut obs.rows, &selected, &params, &FlagThresholds::default());
        assert!(!obs.rows[3].flags.user);
        assert!(!obs.rows[3].flags.summary);
        assert_eq!(summary.user, 1);
    }

    #[test]
    fn expected_rms_ratio_is_enforced() {
        let mut obs = raster_observation(4, 4, 32);
        let selected: Vec<usize> = (0..obs.rows.len()).collect();
        seed_stats(&mut obs.rows, &selected);
        compute_expected_rms(&mut obs.rows, &selected, 1.0e6);
        // Tsys 100 K over 1 MHz x 1 s gives 0.1 K expected; a clean row
        // passes, a hot row fails the ratio.
        obs.rows[5].stats.post_fit_rms = Some(obs.rows[5].stats.expected_rms.unwrap() * 2.0);
        compute_running_mean_deviation(&mut obs.rows, &selected);
        let params = ReduceParams::default();
        flag_rows(&mut obs.rows, &selected, &params, &FlagThresholds::default());
        assert!(!obs.rows[5].flags.expected);
    }

    #[test]
    fn running_mean_excludes_the_row_itself() {
        let mut obs = raster_observation(3, 4, 16);
        let selected: Vec<usize> = (0..obs.rows.len()).collect();
        for &id in &selected {
            obs.rows[id].stats.post_fit_rms = Some(0.1);
        }
        obs.rows[6].stats.post_fit_rms = Some(1.0);
        compute_running_mean_deviation(&mut obs.rows, &selected);
        // The outlier's deviation is large and positive; a neighbour's is
        // slightly negative because the outlier inflates its window mean.
        assert!(obs.rows[6].stats.post_fit_rms_diff.unwrap() > 0.8);
        assert!(obs.rows[5].stats.post_fit_rms_diff.unwrap() < 0.0);
    }
}
