//! Observation data model: the per-row metadata table and its companions.

use crate::errors::ReduceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-row RMS statistics filled in by baseline fitting and flagging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowStatistics {
    /// RMS of the low-frequency (smoothed) residual.
    pub low_freq_rms: Option<f64>,
    /// RMS after baseline subtraction.
    pub post_fit_rms: Option<f64>,
    /// RMS before baseline subtraction.
    pub pre_fit_rms: Option<f64>,
    /// Deviation of the post-fit RMS from the running mean.
    pub post_fit_rms_diff: Option<f64>,
    /// Deviation of the pre-fit RMS from the running mean.
    pub pre_fit_rms_diff: Option<f64>,
    /// Radiometer-equation expectation for the RMS.
    pub expected_rms: Option<f64>,
}

/// Threshold flags; `true` means the row passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFlags {
    /// Low-frequency RMS within threshold.
    pub low_freq: bool,
    /// Post-fit RMS within threshold.
    pub post_fit: bool,
    /// Pre-fit RMS within threshold.
    pub pre_fit: bool,
    /// Post-fit running-mean deviation within threshold.
    pub post_fit_diff: bool,
    /// Pre-fit running-mean deviation within threshold.
    pub pre_fit_diff: bool,
    /// Post-fit RMS within the expected-RMS ratio.
    pub expected: bool,
    /// Permanent: weather.
    pub weather: bool,
    /// Permanent: system temperature.
    pub tsys: bool,
    /// Permanent: operator flag.
    pub user: bool,
    /// Conjunction of all of the above.
    pub summary: bool,
}

impl Default for RowFlags {
    fn default() -> Self {
        Self {
            low_freq: true,
            post_fit: true,
            pre_fit: true,
            post_fit_diff: true,
            pre_fit_diff: true,
            expected: true,
            weather: true,
            tsys: true,
            user: true,
            summary: true,
        }
    }
}

impl RowFlags {
    /// Recomputes the summary flag from the individual flags.
    pub fn update_summary(&mut self) {
        self.summary = self.low_freq
            && self.post_fit
            && self.pre_fit
            && self.post_fit_diff
            && self.pre_fit_diff
            && self.expected
            && self.weather
            && self.tsys
            && self.user;
    }
}

/// One spectrum's metadata row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    /// Row index into the spectral storage.
    pub row: usize,
    /// Scan number.
    pub scan: u32,
    /// Spectral window id.
    pub spw: u32,
    /// Polarization id.
    pub pol: u32,
    /// Beam id.
    pub beam: u32,
    /// Observation time, seconds since the epoch.
    pub time: f64,
    /// Seconds since the first integration of the observation.
    pub elapsed: f64,
    /// Integration time in seconds.
    pub exposure: f64,
    /// Right ascension in degrees.
    pub ra: f64,
    /// Declination in degrees.
    pub dec: f64,
    /// Number of spectral channels.
    pub nchan: usize,
    /// System temperature in K.
    pub tsys: f64,
    /// Target name.
    pub target: String,
    /// RMS statistics, filled in during reduction.
    #[serde(default)]
    pub stats: RowStatistics,
    /// Flag words, filled in during reduction.
    #[serde(default)]
    pub flags: RowFlags,
    /// Detected line masks `(start_channel, end_channel)` for this row.
    #[serde(default)]
    pub masks: Vec<(usize, usize)>,
}

/// The per-row metadata table threaded through the whole reduction.
pub type DataTable = Vec<DataRow>;

/// An observation handed to the driver: metadata rows, raw spectra, and the
/// frequency abscissa per spectral window (GHz per channel).
///
/// How the observation is read off disk is an external concern; the driver
/// only consumes this in-memory form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Per-row metadata.
    pub rows: DataTable,
    /// Raw spectra, one per metadata row.
    pub spectra: Vec<Vec<f64>>,
    /// Frequency axis per spectral window.
    pub abscissa: BTreeMap<u32, Vec<f64>>,
}

impl Observation {
    /// Validates internal consistency.
    ///
    /// # Errors
    ///
    /// Fails with [`ReduceError::InvalidObservation`] when the table,
    /// spectra, and abscissa disagree.
    pub fn validate(&self) -> Result<(), ReduceError> {
        if self.rows.is_empty() {
            return Err(ReduceError::InvalidObservation("no rows".to_string()));
        }
        if self.rows.len() != self.spectra.len() {
            return Err(ReduceError::InvalidObservation(format!(
                "{} rows but {} spectra",
                self.rows.len(),
                self.spectra.len()
            )));
        }
        for (index, (row, spectrum)) in self.rows.iter().zip(&self.spectra).enumerate() {
            if row.row != index {
                return Err(ReduceError::InvalidObservation(format!(
                    "row id {} at position {index}",
                    row.row
                )));
            }
            if spectrum.len() != row.nchan {
                return Err(ReduceError::InvalidObservation(format!(
                    "row {index}: nchan {} but spectrum has {} channels",
                    row.nchan,
                    spectrum.len()
                )));
            }
            if !self.abscissa.contains_key(&row.spw) {
                return Err(ReduceError::InvalidObservation(format!(
                    "row {index}: no abscissa for spw {}",
                    row.spw
                )));
            }
        }
        Ok(())
    }

    /// Distinct values present on one axis, ascending.
    #[must_use]
    pub fn axis_values(&self, pick: impl Fn(&DataRow) -> u32) -> Vec<u32> {
        let mut values: Vec<u32> = self.rows.iter().map(pick).collect();
        values.sort_unstable();
        values.dedup();
        values
    }
}

/// Metadata for one cell of the re-gridded output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridMeta {
    /// Spectral window id.
    pub spw: u32,
    /// Polarization id.
    pub pol: u32,
    /// Cell centre right ascension in degrees.
    pub ra: f64,
    /// Cell centre declination in degrees.
    pub dec: f64,
    /// Number of spectra combined into the cell.
    pub combined: usize,
    /// Number of spectra rejected by flagging.
    pub flagged: usize,
    /// RMS of the combined spectrum.
    pub rms: f64,
}

/// A spectral image cube assembled from the gridded spectra.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCube {
    /// Spectral window id the cube was built from.
    pub spw: u32,
    /// Polarization id the cube was built from.
    pub pol: u32,
    /// Grid width in cells.
    pub nx: usize,
    /// Grid height in cells.
    pub ny: usize,
    /// Number of channels per cell.
    pub nchan: usize,
    /// Cell size in degrees.
    pub cell: f64,
    /// Map centre `(ra, dec)` in degrees.
    pub center: (f64, f64),
    /// Cube data, `ny * nx * nchan`, row-major with the channel axis fastest.
    pub data: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduction::testkit::raster_observation;

    #[test]
    fn synthetic_observation_validates() {
        let obs = raster_observation(4, 4, 64);
        obs.validate().unwrap();
        assert_eq!(obs.axis_values(|r| r.spw), vec![0]);
        assert_eq!(obs.axis_values(|r| r.pol), vec![0]);
    }

    #[test]
    fn mismatched_spectra_are_rejected() {
        let mut obs = raster_observation(2, 2, 16);
        obs.spectra.pop();
        assert!(matches!(
            obs.validate(),
            Err(ReduceError::InvalidObservation(_))
        ));
    }

    #[test]
    fn summary_flag_is_the_conjunction() {
        let mut flags = RowFlags::default();
        assert!(flags.summary);
        flags.pre_fit = false;
        flags.update_summary();
        assert!(!flags.summary);
    }
}
