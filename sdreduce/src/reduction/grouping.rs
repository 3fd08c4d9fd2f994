//! Spatial and temporal grouping of integrations.
//!
//! Rows are first binned into sky cells so that spectra taken at the same
//! pointing can share a baseline solution, then split in time wherever the
//! sampling shows a gap. The two segmentations are merged into one gap table
//! per beam before baseline fitting.

use crate::reduction::table::DataTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// A row's role within its position group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionRole {
    /// First row observed in the cell; owns the group.
    Leader,
    /// Subsequent row in the cell, pointing at the leader's row id.
    Member {
        /// Row id of the group's leader.
        leader: usize,
    },
}

/// Position-group dictionary: row id to role.
pub type PositionGroups = BTreeMap<usize, PositionRole>;

/// Gap tables derived from time-domain segmentation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeGaps {
    /// Row ids that start a new small-gap segment.
    pub small: Vec<usize>,
    /// Row ids that start a new large-gap segment.
    pub large: Vec<usize>,
}

/// Segment tables keyed by the first row of each segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTable {
    /// Small segments: consecutive rows closer than the small-gap threshold.
    pub small: Vec<Vec<usize>>,
    /// Large segments: consecutive rows closer than the large-gap threshold.
    pub large: Vec<Vec<usize>>,
}

/// Observing pattern inferred from the pointing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservingPattern {
    /// Scanning rows of closely spaced pointings.
    Raster,
    /// Repeated integrations on one position.
    SinglePoint,
    /// A handful of discrete positions visited in turn.
    MultiPoint,
}

impl std::fmt::Display for ObservingPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raster => f.write_str("raster"),
            Self::SinglePoint => f.write_str("single_point"),
            Self::MultiPoint => f.write_str("multi_point"),
        }
    }
}

/// Bins rows into sky cells of `combine_radius` degrees and records, per
/// row, whether it leads its cell or follows an earlier row.
///
/// Positions within `allowance_radius` of a cell's first row are treated as
/// the same pointing even when the cell boundary falls between them.
#[must_use]
pub fn group_by_position(
    rows: &DataTable,
    selected: &[usize],
    combine_radius: f64,
    allowance_radius: f64,
) -> PositionGroups {
    let mut groups = PositionGroups::new();
    if selected.is_empty() {
        return groups;
    }
    let cell = combine_radius * 2.0;
    // Cell index -> leader row id, plus the leader's exact position.
    let mut cells: BTreeMap<(i64, i64), (usize, f64, f64)> = BTreeMap::new();
    let allowance_sq = allowance_radius * allowance_radius;
    for &id in selected {
        let row = &rows[id];
        let ix = (row.ra / cell).floor() as i64;
        let iy = (row.dec / cell).floor() as i64;
        // A pointing can straddle a cell edge; check the neighbours too.
        let mut leader = None;
        'search: for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(&(lead, lra, ldec)) = cells.get(&(ix + dx, iy + dy)) {
                    let dra = row.ra - lra;
                    let ddec = row.dec - ldec;
                    let same_cell = dx == 0 && dy == 0;
                    if same_cell || dra * dra + ddec * ddec <= allowance_sq {
                        leader = Some(lead);
                        break 'search;
                    }
                }
            }
        }
        match leader {
            Some(lead) => {
                groups.insert(id, PositionRole::Member { leader: lead });
            }
            None => {
                cells.insert((ix, iy), (id, row.ra, row.dec));
                groups.insert(id, PositionRole::Leader);
            }
        }
    }
    let leaders = groups
        .values()
        .filter(|r| matches!(r, PositionRole::Leader))
        .count();
    debug!(rows = selected.len(), groups = leaders, "grouped by position");
    groups
}

/// Splits the selected rows into small- and large-gap time segments.
///
/// Thresholds are data-driven: a small gap is anything larger than five
/// times the median sampling interval, a large gap five times the median of
/// the small gaps themselves. With fewer than two distinct gaps everything
/// lands in a single segment.
#[must_use]
pub fn group_by_time(rows: &DataTable, selected: &[usize]) -> (TimeTable, TimeGaps) {
    let mut table = TimeTable::default();
    let mut gaps = TimeGaps::default();
    if selected.is_empty() {
        return (table, gaps);
    }
    let mut order: Vec<usize> = selected.to_vec();
    order.sort_by(|&a, &b| rows[a].time.total_cmp(&rows[b].time));

    let deltas: Vec<f64> = order
        .windows(2)
        .map(|w| rows[w[1]].time - rows[w[0]].time)
        .collect();
    let small_threshold = 5.0 * median(&deltas);
    let small_gaps: Vec<f64> = deltas
        .iter()
        .copied()
        .filter(|&d| d > small_threshold)
        .collect();
    let large_threshold = 5.0 * median(&small_gaps);

    let mut small_segment = vec![order[0]];
    let mut large_segment = vec![order[0]];
    for (w, &delta) in order.windows(2).zip(&deltas) {
        let next = w[1];
        if small_threshold > 0.0 && delta > small_threshold {
            table.small.push(std::mem::replace(&mut small_segment, vec![next]));
            gaps.small.push(next);
        } else {
            small_segment.push(next);
        }
        if large_threshold > 0.0 && delta > large_threshold {
            table.large.push(std::mem::replace(&mut large_segment, vec![next]));
            gaps.large.push(next);
        } else {
            large_segment.push(next);
        }
    }
    table.small.push(small_segment);
    table.large.push(large_segment);
    debug!(
        small_segments = table.small.len(),
        large_segments = table.large.len(),
        "grouped by time"
    );
    (table, gaps)
}

/// Merges position gaps into the time gap table, splitting per beam.
///
/// A position gap opens wherever the pointing steps by more than ten times
/// the median step; those boundaries are folded into the small-gap table so
/// baseline segments never span a pointing discontinuity. Multi-beam data is
/// segmented per beam, since beams sample the sky independently.
#[must_use]
pub fn merge_gap_tables(
    rows: &DataTable,
    selected: &[usize],
    time_table: &TimeTable,
    time_gaps: &TimeGaps,
) -> (TimeTable, TimeGaps) {
    let mut beams: Vec<u32> = selected.iter().map(|&id| rows[id].beam).collect();
    beams.sort_unstable();
    beams.dedup();

    let position_gaps = position_gap_rows(rows, selected);

    let mut merged = TimeTable::default();
    let mut gaps = time_gaps.clone();
    for segment in &time_table.small {
        for beam in &beams {
            let beam_rows: Vec<usize> = segment
                .iter()
                .copied()
                .filter(|&id| rows[id].beam == *beam)
                .collect();
            if beam_rows.is_empty() {
                continue;
            }
            let mut current = vec![beam_rows[0]];
            for &id in &beam_rows[1..] {
                if position_gaps.contains(&id) {
                    gaps.small.push(id);
                    merged.small.push(std::mem::replace(&mut current, vec![id]));
                } else {
                    current.push(id);
                }
            }
            merged.small.push(current);
        }
    }
    merged.large = time_table.large.clone();
    gaps.small.sort_unstable();
    gaps.small.dedup();
    (merged, gaps)
}

/// Rows at which the pointing jumps by more than ten times the median step.
fn position_gap_rows(rows: &DataTable, selected: &[usize]) -> Vec<usize> {
    let steps: Vec<f64> = selected
        .windows(2)
        .map(|w| {
            let (a, b) = (&rows[w[0]], &rows[w[1]]);
            ((b.ra - a.ra).powi(2) + (b.dec - a.dec).powi(2)).sqrt()
        })
        .collect();
    let threshold = 10.0 * median(&steps);
    if threshold <= 0.0 {
        return Vec::new();
    }
    selected
        .windows(2)
        .zip(&steps)
        .filter(|(_, &step)| step > threshold)
        .map(|(w, _)| w[1])
        .collect()
}

/// Infers the observing pattern from the position groups and time segments.
///
/// One pointing is a single-point observation. When the rows revisit few
/// distinct pointings relative to the time segmentation the data is a set of
/// discrete pointings; otherwise the scan is treated as a raster.
#[must_use]
pub fn analyse_pattern(groups: &PositionGroups, time_table: &TimeTable) -> ObservingPattern {
    let pointings = groups
        .values()
        .filter(|r| matches!(r, PositionRole::Leader))
        .count();
    if pointings <= 1 {
        return ObservingPattern::SinglePoint;
    }
    let segments = time_table.small.len().max(1);
    // Discrete pointing sets revisit each position across many segments; a
    // raster sweeps new positions continuously.
    if pointings <= segments {
        ObservingPattern::MultiPoint
    } else {
        ObservingPattern::Raster
    }
}

/// Median of a slice; zero when empty.
#[must_use]
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
