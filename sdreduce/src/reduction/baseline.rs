//! Baseline removal.
//!
//! Spectra sharing a pointing are accumulated to raise the signal-to-noise
//! of the baseline estimate, a polynomial order is chosen from the
//! low-frequency power of the accumulated spectrum, and each raw spectrum is
//! then fit with that order while masking detected lines out of the fit.

use crate::errors::ReduceError;
use crate::reduction::grouping::{PositionGroups, PositionRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Polynomial order chosen per position group, keyed by the leader row.
pub type FitOrders = BTreeMap<usize, usize>;

/// Outcome of fitting one spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineFit {
    /// Polynomial order used.
    pub order: usize,
    /// RMS before subtraction, outside the masked channels.
    pub pre_fit_rms: f64,
    /// RMS after subtraction, outside the masked channels.
    pub post_fit_rms: f64,
}

/// Removes a first-guess baseline: the mean and the straight line through
/// the spectrum ends. Keeps later line detection from being dragged around
/// by receiver drifts before the proper fit order is known.
#[must_use]
pub fn remove_tentative_baseline(spectrum: &[f64]) -> Vec<f64> {
    let n = spectrum.len();
    if n < 2 {
        return spectrum.to_vec();
    }
    // Endpoint estimates from the outer eighth of the band.
    let edge = (n / 8).max(1);
    let head: f64 = spectrum[..edge].iter().sum::<f64>() / edge as f64;
    let tail: f64 = spectrum[n - edge..].iter().sum::<f64>() / edge as f64;
    let slope = (tail - head) / (n - edge) as f64;
    let offset = head - slope * (edge as f64 / 2.0);
    spectrum
        .iter()
        .enumerate()
        .map(|(i, &v)| v - (offset + slope * i as f64))
        .collect()
}

/// Accumulates the spectra of each position group onto its leader.
///
/// Returns one averaged spectrum per leader row. Rows flagged out by the
/// summary flag still accumulate here; flagging decisions come later in the
/// pass and must not perturb the baseline estimate order.
#[must_use]
pub fn accumulate_by_position(
    spectra: &[Vec<f64>],
    groups: &PositionGroups,
) -> BTreeMap<usize, Vec<f64>> {
    let mut sums: BTreeMap<usize, (Vec<f64>, usize)> = BTreeMap::new();
    for (&id, role) in groups {
        let leader = match role {
            PositionRole::Leader => id,
            PositionRole::Member { leader } => *leader,
        };
        let spectrum = &spectra[id];
        let entry = sums
            .entry(leader)
            .or_insert_with(|| (vec![0.0; spectrum.len()], 0));
        for (acc, &v) in entry.0.iter_mut().zip(spectrum) {
            *acc += v;
        }
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(leader, (mut sum, count))| {
            for v in &mut sum {
                *v /= count as f64;
            }
            (leader, sum)
        })
        .collect()
}

/// Bridges masked channel ranges with a straight line between their
/// neighbours, so line emission does not leak into the spectral power used
/// for order selection. Ranges touching an edge take the nearest unmasked
/// value instead.
pub fn interpolate_masked(spectrum: &mut [f64], masks: &[(usize, usize)]) {
    let n = spectrum.len();
    for &(start, end) in masks {
        if start >= n {
            continue;
        }
        let end = end.min(n - 1);
        let left = start.checked_sub(1).map(|i| spectrum[i]);
        let right = (end + 1 < n).then(|| spectrum[end + 1]);
        match (left, right) {
            (Some(a), Some(b)) => {
                let span = (end - start + 2) as f64;
                for (step, value) in spectrum[start..=end].iter_mut().enumerate() {
                    *value = a + (b - a) * (step + 1) as f64 / span;
                }
            }
            (Some(a), None) => spectrum[start..=end].fill(a),
            (None, Some(b)) => spectrum[start..=end].fill(b),
            (None, None) => {}
        }
    }
}

/// Power of the lowest `max_order` Fourier modes of a spectrum, computed
/// directly. Only a handful of modes are needed, so a direct evaluation
/// beats setting up a full transform.
#[must_use]
pub fn low_order_power(spectrum: &[f64], max_order: usize) -> Vec<f64> {
    let n = spectrum.len();
    if n == 0 {
        return vec![0.0; max_order + 1];
    }
    let mean = spectrum.iter().sum::<f64>() / n as f64;
    (0..=max_order)
        .map(|k| {
            if k == 0 {
                return mean.abs();
            }
            let omega = 2.0 * std::f64::consts::PI * k as f64 / n as f64;
            let (mut re, mut im) = (0.0, 0.0);
            for (i, &v) in spectrum.iter().enumerate() {
                let phase = omega * i as f64;
                re += (v - mean) * phase.cos();
                im += (v - mean) * phase.sin();
            }
            (re * re + im * im).sqrt() / n as f64
        })
        .collect()
}

/// Chooses a polynomial order per position group from the accumulated
/// spectrum's low-frequency power.
///
/// The order tracks the highest Fourier mode whose power still stands above
/// the noise floor estimated from the modes above it. Two polynomial terms
/// per significant mode, clamped to `max_order`.
#[must_use]
pub fn determine_fit_orders(
    accumulated: &BTreeMap<usize, Vec<f64>>,
    max_order: usize,
) -> FitOrders {
    const PROBE_MODES: usize = 8;
    accumulated
        .iter()
        .map(|(&leader, spectrum)| {
            let power = low_order_power(spectrum, PROBE_MODES);
            // Roundoff leaves pure-noise modes at ~1e-16 of the signal
            // level; keep the floor above that.
            let level = spectrum.iter().map(|v| v.abs()).sum::<f64>()
                / spectrum.len().max(1) as f64;
            let floor = power[1..]
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min)
                .max(1e-9 * level)
                .max(f64::MIN_POSITIVE);
            let significant = power[1..]
                .iter()
                .rposition(|&p| p > 3.0 * floor)
                .map_or(0, |k| k + 1);
            let order = (2 * significant).clamp(1, max_order);
            debug!(leader, order, "fit order chosen");
            (leader, order)
        })
        .collect()
}

/// Fits a polynomial of `order` to the unmasked channels and subtracts it.
///
/// `masks` are inclusive channel ranges excluded from the fit (detected
/// lines). The fit itself is evaluated and subtracted over all channels.
///
/// # Errors
///
/// Fails with [`ReduceError::InvalidObservation`] when too few unmasked
/// channels remain to constrain the requested order.
pub fn fit_baseline(
    spectrum: &mut [f64],
    order: usize,
    masks: &[(usize, usize)],
) -> Result<BaselineFit, ReduceError> {
    let n = spectrum.len();
    let masked = |i: usize| masks.iter().any(|&(s, e)| i >= s && i <= e);
    let free: Vec<usize> = (0..n).filter(|&i| !masked(i)).collect();
    if free.len() <= order {
        return Err(ReduceError::InvalidObservation(format!(
            "{} unmasked channels cannot constrain order {order}",
            free.len()
        )));
    }

    let pre_fit_rms = rms(spectrum, &free);

    // Normal equations in a scaled abscissa; orders here are small enough
    // that the plain monomial basis stays well conditioned.
    let terms = order + 1;
    let scale = |i: usize| 2.0 * i as f64 / (n - 1).max(1) as f64 - 1.0;
    let mut ata = vec![vec![0.0; terms]; terms];
    let mut atb = vec![0.0; terms];
    for &i in &free {
        let x = scale(i);
        let mut basis = vec![1.0; terms];
        for t in 1..terms {
            basis[t] = basis[t - 1] * x;
        }
        for r in 0..terms {
            for c in 0..terms {
                ata[r][c] += basis[r] * basis[c];
            }
            atb[r] += basis[r] * spectrum[i];
        }
    }
    let coeffs = solve(&mut ata, &mut atb)?;

    for (i, v) in spectrum.iter_mut().enumerate() {
        let x = scale(i);
        let mut model = 0.0;
        let mut xn = 1.0;
        for &c in &coeffs {
            model += c * xn;
            xn *= x;
        }
        *v -= model;
    }
    let post_fit_rms = rms(spectrum, &free);
    Ok(BaselineFit {
        order,
        pre_fit_rms,
        post_fit_rms,
    })
}

/// RMS of the boxcar-smoothed spectrum: residual structure too slow to be
/// noise but too fast for the polynomial to have absorbed.
#[must_use]
pub fn low_frequency_rms(spectrum: &[f64], window: usize) -> f64 {
    let n = spectrum.len();
    if n == 0 {
        return 0.0;
    }
    let half = (window / 2).max(1);
    let smoothed: Vec<f64> = (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(n);
            spectrum[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect();
    let all: Vec<usize> = (0..n).collect();
    rms(&smoothed, &all)
}

/// RMS over the listed channels.
fn rms(spectrum: &[f64], channels: &[usize]) -> f64 {
    if channels.is_empty() {
        return 0.0;
    }
    let mean = channels.iter().map(|&i| spectrum[i]).sum::<f64>() / channels.len() as f64;
    let var = channels
        .iter()
        .map(|&i| (spectrum[i] - mean).powi(2))
        .sum::<f64>()
        / channels.len() as f64;
    var.sqrt()
}

/// Gaussian elimination with partial pivoting. `a` and `b` are consumed.
fn solve(a: &mut [Vec<f64>], b: &mut [f64]) -> Result<Vec<f64>, ReduceError> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&r, &s| a[r][col].abs().total_cmp(&a[s][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < 1e-12 {
            return Err(ReduceError::InvalidObservation(
                "singular baseline fit".to_string(),
            ));
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for c in col..n {
                a[row][c] -= factor * a[col][c];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for c in row + 1..n {
            sum -= a[row][c] * x[c];
        }
        x[row] = sum / a[row][row];
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::grouping::group_by_position;
    use crate::reduction::testkit::{pointed_observation, spectrum_with_line};

    #[test]
    fn tentative_removal_flattens_a_ramp() {
        let spectrum: Vec<f64> = (0..64).map(|i| 2.0 + 0.5 * i as f64).collect();
        let flat = remove_tentative_baseline(&spectrum);
        let peak = flat.iter().fold(0.0f64, |m, &v| m.max(v.abs()));
        assert!(peak < 1.0, "residual peak {peak}");
    }

    #[test]
    fn accumulation_averages_group_members() {
        let obs = pointed_observation(2, 4, 32);
        let selected: Vec<usize> = (0..obs.rows.len()).collect();
        let groups = group_by_position(&obs.rows, &selected, 0.0025, 0.00025);
        let accumulated = accumulate_by_position(&obs.spectra, &groups);
        assert_eq!(accumulated.len(), 2);
        for spectrum in accumulated.values() {
            assert_eq!(spectrum.len(), 32);
        }
    }

    #[test]
    fn ripple_raises_the_fit_order() {
        let n = 128;
        let flat: Vec<f64> = vec![0.1; n];
        let rippled: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * 3.0 * i as f64 / n as f64).sin())
            .collect();
        let mut accumulated = BTreeMap::new();
        accumulated.insert(0, flat);
        accumulated.insert(1, rippled);
        let orders = determine_fit_orders(&accumulated, 10);
        assert!(orders[&1] > orders[&0], "orders {orders:?}");
    }

    #[test]
    fn interpolation_bridges_a_line() {
        let mut spectrum: Vec<f64> = (0..16).map(f64::from).collect();
        spectrum[6] = 50.0;
        spectrum[7] = 80.0;
        spectrum[8] = 50.0;
        interpolate_masked(&mut spectrum, &[(6, 8)]);
        for (i, &v) in spectrum.iter().enumerate() {
            assert!((v - i as f64).abs() < 1e-12, "channel {i} holds {v}");
        }
        // An edge-touching range takes its inner neighbour.
        let mut edged = vec![9.0, 9.0, 1.0, 2.0];
        interpolate_masked(&mut edged, &[(0, 1)]);
        assert_eq!(edged, vec![1.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn fit_removes_polynomial_and_preserves_line() {
        let n = 128;
        let mut spectrum = spectrum_with_line(n, 60, 68, 5.0);
        for (i, v) in spectrum.iter_mut().enumerate() {
            let x = i as f64 / n as f64;
            *v += 1.0 + 2.0 * x - 3.0 * x * x;
        }
        let fit = fit_baseline(&mut spectrum, 2, &[(58, 70)]).unwrap();
        assert!(fit.post_fit_rms < fit.pre_fit_rms);
        // Line amplitude survives, baseline is gone.
        assert!(spectrum[64] > 4.0, "line peak {}", spectrum[64]);
        assert!(spectrum[10].abs() < 0.5, "residual {}", spectrum[10]);
    }

    #[test]
    fn over_masked_fit_is_rejected() {
        let mut spectrum = vec![0.0; 16];
        let err = fit_baseline(&mut spectrum, 3, &[(0, 13)]).unwrap_err();
        assert!(matches!(err, ReduceError::InvalidObservation(_)));
    }
}
