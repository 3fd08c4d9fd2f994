//! Spectral line detection and validation.

use crate::config::SpectrumWindow;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Speed of light in km/s, used for velocity-width window conversion.
const C_KMS: f64 = 299_792.458;

/// A detected line on one spectrum: inclusive channel range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMask {
    /// First channel of the line.
    pub start: usize,
    /// Last channel of the line, inclusive.
    pub end: usize,
}

impl LineMask {
    /// Number of channels covered.
    #[must_use]
    pub fn width(&self) -> usize {
        self.end - self.start + 1
    }

    /// Midpoint channel.
    #[must_use]
    pub fn center(&self) -> f64 {
        (self.start + self.end) as f64 / 2.0
    }
}

/// A line validated across spectra: the consensus channel range plus how
/// many spectra contributed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedLine {
    /// First channel of the consensus range.
    pub start: usize,
    /// Last channel of the consensus range, inclusive.
    pub end: usize,
    /// Number of per-spectrum detections merged into this line.
    pub votes: usize,
}

/// Robust noise scale: 1.4826 times the median absolute deviation.
#[must_use]
pub fn mad_sigma(spectrum: &[f64]) -> f64 {
    let median = crate::reduction::grouping::median(spectrum);
    let deviations: Vec<f64> = spectrum.iter().map(|&v| (v - median).abs()).collect();
    1.4826 * crate::reduction::grouping::median(&deviations)
}

/// Detects emission features above `threshold` sigma of the channel noise.
///
/// Runs of consecutive channels above the threshold become one mask; runs
/// separated by a single sub-threshold channel are bridged. Masks narrower
/// than two channels are discarded as spikes, and masks are clipped away
/// from the band edges given by `edge` channels on each side.
#[must_use]
pub fn detect_lines(spectrum: &[f64], threshold: f64, edge: (usize, usize)) -> Vec<LineMask> {
    let n = spectrum.len();
    let (left, right) = edge;
    if n == 0 || left + right >= n {
        return Vec::new();
    }
    let interior = &spectrum[left..n - right];
    let sigma = mad_sigma(interior);
    if sigma <= 0.0 {
        return Vec::new();
    }
    let median = crate::reduction::grouping::median(interior);
    let cut = median + threshold * sigma;

    let mut masks: Vec<LineMask> = Vec::new();
    let mut current: Option<usize> = None;
    for (offset, &v) in interior.iter().enumerate() {
        let channel = left + offset;
        if v > cut {
            if current.is_none() {
                current = Some(channel);
            }
        } else if let Some(start) = current.take() {
            masks.push(LineMask {
                start,
                end: channel - 1,
            });
        }
    }
    if let Some(start) = current {
        masks.push(LineMask {
            start,
            end: n - right - 1,
        });
    }

    // Bridge one-channel dips, then drop single-channel spikes.
    let mut bridged: Vec<LineMask> = Vec::new();
    for mask in masks {
        match bridged.last_mut() {
            Some(last) if mask.start <= last.end + 2 => last.end = mask.end,
            _ => bridged.push(mask),
        }
    }
    bridged.retain(|m| m.width() >= 2);
    debug!(lines = bridged.len(), sigma, "detected lines");
    bridged
}

/// Converts an operator-specified frequency window to a channel mask on the
/// given abscissa (GHz per channel).
///
/// The window spans the velocity range `[min_velocity, max_velocity]` km/s
/// around `center_freq`; returns `None` when it misses the band entirely.
#[must_use]
pub fn freq_window_to_channels(window: &SpectrumWindow, abscissa: &[f64]) -> Option<LineMask> {
    if abscissa.len() < 2 {
        return None;
    }
    let f_low = window.center_freq * (1.0 - window.max_velocity / C_KMS);
    let f_high = window.center_freq * (1.0 - window.min_velocity / C_KMS);
    let (f_min, f_max) = if f_low <= f_high {
        (f_low, f_high)
    } else {
        (f_high, f_low)
    };
    let mut channels = abscissa
        .iter()
        .enumerate()
        .filter(|(_, &f)| f >= f_min && f <= f_max)
        .map(|(i, _)| i);
    let start = channels.next()?;
    let end = channels.last().unwrap_or(start);
    Some(LineMask { start, end })
}

/// Validates per-spectrum detections against each other.
///
/// Detections are clustered greedily in (center, width) space: a detection
/// joins an existing cluster when its center lies within half the cluster
/// width and its width is within a factor of two. A cluster survives when at
/// least `min_votes` spectra contributed, which suppresses single-spectrum
/// noise excursions; the surviving range is the union of its members.
#[must_use]
pub fn cluster_lines(detections: &[Vec<LineMask>], min_votes: usize) -> Vec<ValidatedLine> {
    struct Cluster {
        start: usize,
        end: usize,
        center: f64,
        width: f64,
        votes: usize,
    }
    let mut clusters: Vec<Cluster> = Vec::new();
    for masks in detections {
        for mask in masks {
            let center = mask.center();
            let width = mask.width() as f64;
            let found = clusters.iter_mut().find(|c| {
                (center - c.center).abs() <= c.width / 2.0
                    && width <= 2.0 * c.width
                    && c.width <= 2.0 * width
            });
            match found {
                Some(c) => {
                    c.start = c.start.min(mask.start);
                    c.end = c.end.max(mask.end);
                    // Running mean keeps the cluster centred on consensus.
                    c.center += (center - c.center) / (c.votes + 1) as f64;
                    c.width += (width - c.width) / (c.votes + 1) as f64;
                    c.votes += 1;
                }
                None => clusters.push(Cluster {
                    start: mask.start,
                    end: mask.end,
                    center,
                    width,
                    votes: 1,
                }),
            }
        }
    }
    let mut lines: Vec<ValidatedLine> = clusters
        .into_iter()
        .filter(|c| c.votes >= min_votes)
        .map(|c| ValidatedLine {
            start: c.start,
            end: c.end,
            votes: c.votes,
        })
        .collect();
    lines.sort_by_key(|l| l.start);
    lines
}
