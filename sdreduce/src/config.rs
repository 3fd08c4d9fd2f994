//! Reduction parameters and axis selections.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Selection over one integer observation axis.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", untagged)]
pub enum AxisSelection {
    /// Every value present in the observation.
    #[default]
    #[serde(with = "all_marker")]
    All,
    /// Only the listed values.
    Only(Vec<u32>),
}

mod all_marker {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("all")
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<(), D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag == "all" {
            Ok(())
        } else {
            Err(serde::de::Error::custom("expected \"all\""))
        }
    }
}

impl AxisSelection {
    /// Checks whether `value` is selected.
    #[must_use]
    pub fn contains(&self, value: u32) -> bool {
        match self {
            Self::All => true,
            Self::Only(values) => values.contains(&value),
        }
    }

    /// Resolves the selection against the values present in the data.
    #[must_use]
    pub fn resolve(&self, available: &[u32]) -> Vec<u32> {
        match self {
            Self::All => available.to_vec(),
            Self::Only(values) => values
                .iter()
                .copied()
                .filter(|v| available.contains(v))
                .collect(),
        }
    }
}

/// Which spectra participate in the reduction.
///
/// `scans_base` / `rows_base` select the superset used only for emission-line
/// channel selection; they must include `scans` / `rows`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selection {
    /// Spectral windows to reduce.
    #[serde(default)]
    pub spws: AxisSelection,
    /// Polarizations to reduce.
    #[serde(default)]
    pub pols: AxisSelection,
    /// Beams to reduce.
    #[serde(default)]
    pub beams: AxisSelection,
    /// Scans contributing to the output.
    #[serde(default)]
    pub scans: AxisSelection,
    /// Scans used for line-channel selection.
    #[serde(default)]
    pub scans_base: AxisSelection,
    /// Row ids contributing to the output.
    #[serde(default)]
    pub rows: AxisSelection,
    /// Row ids used for line-channel selection.
    #[serde(default)]
    pub rows_base: AxisSelection,
}

/// A pre-defined spectrum window: lines are assumed inside it and baseline
/// fitting excludes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumWindow {
    /// Line rest centre frequency in GHz.
    pub center_freq: f64,
    /// Lower velocity bound in km/s.
    pub min_velocity: f64,
    /// Upper velocity bound in km/s.
    pub max_velocity: f64,
}

impl SpectrumWindow {
    /// A window symmetric in velocity around the centre frequency.
    #[must_use]
    pub fn symmetric(center_freq: f64, velocity: f64) -> Self {
        Self {
            center_freq,
            min_velocity: -velocity.abs(),
            max_velocity: velocity.abs(),
        }
    }
}

/// Parameters of one reduction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceParams {
    /// Beam radius in degrees; spectra within it are combined.
    #[serde(default = "default_combine_radius")]
    pub combine_radius: f64,
    /// Channels dropped at each spectrum edge for baseline fitting.
    #[serde(default)]
    pub edge: (usize, usize),
    /// Number of extra baseline-fit iterations (0 means a single pass).
    #[serde(default)]
    pub iterations: u32,
    /// Whether line detection also searches for broad components.
    #[serde(default)]
    pub broad_component: bool,
    /// Pre-defined spectrum windows; when non-empty the iteration count
    /// collapses to a single pass.
    #[serde(default)]
    pub spectrum_windows: Vec<SpectrumWindow>,
    /// Rows flagged unconditionally by the operator.
    #[serde(default)]
    pub user_flags: Vec<usize>,
    /// Whether to assemble image cubes for raster maps.
    #[serde(default = "default_true")]
    pub image_cube: bool,
    /// Line-detection threshold in units of the channel noise.
    #[serde(default = "default_line_threshold")]
    pub line_threshold: f64,
    /// Cluster validation threshold in sigma.
    #[serde(default = "default_cluster_nsigma")]
    pub cluster_nsigma: f64,
    /// Iterations of the flagging threshold loop.
    #[serde(default = "default_flag_iterations")]
    pub flag_iterations: u32,
    /// Axis selection.
    #[serde(default)]
    pub selection: Selection,
}

fn default_combine_radius() -> f64 {
    0.0025
}

fn default_true() -> bool {
    true
}

fn default_line_threshold() -> f64 {
    3.0
}

fn default_cluster_nsigma() -> f64 {
    4.0
}

fn default_flag_iterations() -> u32 {
    10
}

impl Default for ReduceParams {
    fn default() -> Self {
        Self {
            combine_radius: default_combine_radius(),
            edge: (0, 0),
            iterations: 0,
            broad_component: false,
            spectrum_windows: Vec::new(),
            user_flags: Vec::new(),
            image_cube: default_true(),
            line_threshold: default_line_threshold(),
            cluster_nsigma: default_cluster_nsigma(),
            flag_iterations: default_flag_iterations(),
            selection: Selection::default(),
        }
    }
}

impl ReduceParams {
    /// Creates parameters with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Position-grouping allowance radius.
    #[must_use]
    pub fn allowance_radius(&self) -> f64 {
        self.combine_radius / 10.0
    }

    /// Output grid spacing.
    #[must_use]
    pub fn spacing(&self) -> f64 {
        self.combine_radius / 3.0 * 2.0
    }

    /// Number of fit-iteration passes, after window collapse.
    #[must_use]
    pub fn iteration_passes(&self) -> u32 {
        if self.spectrum_windows.is_empty() {
            self.iterations + 1
        } else {
            1
        }
    }

    /// SHA-256 fingerprint of everything that renumbers stages when
    /// changed. Recorded in the run-level checkpoint; a resume against a
    /// different fingerprint is refused.
    #[must_use]
    pub fn selection_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        // BTreeMap-free canonical form: field order is fixed by the struct.
        let encoded = serde_json::to_string(&(
            &self.selection,
            self.iterations,
            &self.spectrum_windows,
            self.combine_radius,
        ))
        .unwrap_or_default();
        hasher.update(encoded.as_bytes());
        hex::encode(hasher.finalize())
    }
}
