//! Drives the full reduction over a checkpointed stage sequence.
//!
//! The driver owns the loop structure: one preparatory stage, then a fixed
//! sequence of twelve science stages and one cube stage per spectral
//! window, polarization, and iteration pass. Stage numbering depends only
//! on which combinations carry rows, never on the data values inside them,
//! so a fresh run and a resumed run assign identical ids.

use crate::bundle::{slots, StateBundle};
use crate::checkpoint::CheckpointStore;
use crate::config::ReduceParams;
use crate::engine::{PipelineRunMode, StageRunner};
use crate::errors::ReduceError;
use crate::events::EventSink;
use crate::observability::RunIdentity;
use crate::reduction::baseline::{
    accumulate_by_position, determine_fit_orders, fit_baseline, interpolate_masked,
    low_frequency_rms, remove_tentative_baseline, FitOrders,
};
use crate::reduction::detection::{
    cluster_lines, detect_lines, freq_window_to_channels, LineMask, ValidatedLine,
};
use crate::reduction::flagging::{
    compute_expected_rms, compute_running_mean_deviation, flag_rows, FlagThresholds,
};
use crate::reduction::gridding::{
    assemble_cube, grid_spectra, GridGeometry, GridTable, GridWeight,
};
use crate::reduction::grouping::{
    analyse_pattern, group_by_position, group_by_time, merge_gap_tables, ObservingPattern,
    PositionGroups, PositionRole, TimeGaps, TimeTable,
};
use crate::reduction::table::{DataTable, ImageCube, Observation};
use std::sync::Arc;
use tracing::{debug, info};

/// Maximum baseline polynomial order.
const MAX_FIT_ORDER: usize = 10;

/// Everything a completed run hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionOutputs {
    /// Gridded spectra per spectral window and polarization.
    pub tables: Vec<GridTable>,
    /// Image cubes for raster observations.
    pub cubes: Vec<ImageCube>,
    /// The metadata table with final statistics and flags.
    pub rows: DataTable,
    /// Number of stages the run assigned.
    pub stages: u64,
}

/// The checkpointed reduction pipeline.
pub struct PipelineDriver<S: CheckpointStore> {
    params: ReduceParams,
    runner: StageRunner<S>,
    sink: Arc<dyn EventSink>,
    identity: RunIdentity,
}

impl<S: CheckpointStore> PipelineDriver<S> {
    /// Creates a driver for one run.
    ///
    /// # Errors
    ///
    /// Propagates [`StageRunner::new`] failures: an unclearable store on a
    /// fresh run, or a resume point beyond the recorded history.
    pub fn new(
        params: ReduceParams,
        mode: PipelineRunMode,
        store: S,
    ) -> Result<Self, ReduceError> {
        Ok(Self {
            params,
            runner: StageRunner::new(mode, store)?,
            sink: Arc::new(crate::events::NoOpEventSink),
            identity: RunIdentity::new(),
        })
    }

    /// Replaces the event sink for both the driver and its stage runner.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Arc::clone(&sink);
        self.runner = self.runner.with_sink(sink);
        self
    }

    /// Gives the store back, consuming the driver.
    pub fn into_store(self) -> S {
        self.runner.into_store()
    }

    /// Runs the reduction over `observation`.
    ///
    /// On a resumed run the same observation and parameters must be
    /// supplied again; a changed selection is refused via the fingerprint
    /// persisted with the first stage.
    ///
    /// # Errors
    ///
    /// Fails with [`ReduceError::SelectionMismatch`] when resuming under a
    /// different selection, and propagates stage and store failures.
    pub fn run(&mut self, observation: &Observation) -> Result<ReductionOutputs, ReduceError> {
        observation.validate()?;
        info!(
            run_id = %self.identity,
            mode = ?self.runner.mode(),
            rows = observation.rows.len(),
            "starting reduction"
        );
        let mut bundle = StateBundle::new();

        self.runner.run(
            "PreGrouping",
            &[slots::DATA_TABLE, slots::SP_RAW, slots::SELECTION_FINGERPRINT],
            &mut bundle,
            |b| {
                b.put(slots::DATA_TABLE, &observation.rows)?;
                b.put(slots::SP_RAW, &observation.spectra)?;
                b.put(
                    slots::SELECTION_FINGERPRINT,
                    &self.params.selection_fingerprint(),
                )
            },
        )?;
        let recorded: String = bundle.get(slots::SELECTION_FINGERPRINT)?;
        let current = self.params.selection_fingerprint();
        if recorded != current {
            return Err(ReduceError::SelectionMismatch { recorded, current });
        }

        let spws = self
            .params
            .selection
            .spws
            .resolve(&observation.axis_values(|r| r.spw));
        let pols = self
            .params
            .selection
            .pols
            .resolve(&observation.axis_values(|r| r.pol));
        let passes = self.params.iteration_passes();

        for &spw in &spws {
            for &pol in &pols {
                let selected = select_rows(observation, &self.params, spw, pol, false);
                if selected.is_empty() {
                    debug!(spw, pol, "no rows selected; combination skipped");
                    continue;
                }
                let base = select_rows(observation, &self.params, spw, pol, true);
                for iter in 0..passes {
                    self.science_pass(observation, &mut bundle, spw, pol, iter, &selected, &base)?;
                    self.cube_stage(observation, &mut bundle, spw, pol, iter, &selected)?;
                }
            }
        }

        let tables: Vec<GridTable> = if bundle.contains(slots::RESULT_TABLE) {
            bundle.get(slots::RESULT_TABLE)?
        } else {
            Vec::new()
        };
        let cubes: Vec<ImageCube> = if bundle.contains(slots::IMAGE_CUBE) {
            bundle.get(slots::IMAGE_CUBE)?
        } else {
            Vec::new()
        };
        let rows: DataTable = bundle.get(slots::DATA_TABLE)?;
        let stages = self.runner.current_stage().value();
        info!(stages, tables = tables.len(), cubes = cubes.len(), "reduction complete");
        self.sink.emit(
            "pipeline.completed",
            Some(serde_json::json!({
                "run_id": self.identity.run_id,
                "stages": stages,
                "tables": tables.len(),
                "cubes": cubes.len(),
            })),
        );
        Ok(ReductionOutputs {
            tables,
            cubes,
            rows,
            stages,
        })
    }

    /// One pass of the twelve-stage science sequence for a combination.
    #[allow(clippy::too_many_lines)]
    fn science_pass(
        &mut self,
        observation: &Observation,
        bundle: &mut StateBundle,
        spw: u32,
        pol: u32,
        iter: u32,
        selected: &[usize],
        base: &[usize],
    ) -> Result<(), ReduceError> {
        let params = self.params.clone();
        let tag = format!("spw={spw}:pol={pol}:iter={iter}");

        self.runner.run(
            &format!("PositionGrouping:{tag}"),
            &[slots::POS_DICT_ALL, slots::POS_DICT],
            bundle,
            |b| {
                let all = group_by_position(
                    &observation.rows,
                    base,
                    params.combine_radius,
                    params.allowance_radius(),
                );
                let groups = group_by_position(
                    &observation.rows,
                    selected,
                    params.combine_radius,
                    params.allowance_radius(),
                );
                b.put(slots::POS_DICT_ALL, &all)?;
                b.put(slots::POS_DICT, &groups)
            },
        )?;

        self.runner.run(
            &format!("TimeGrouping:{tag}"),
            &[slots::TIME_TABLE, slots::TIME_GAP],
            bundle,
            |b| {
                let (table, gaps) = group_by_time(&observation.rows, selected);
                b.put(slots::TIME_TABLE, &table)?;
                b.put(slots::TIME_GAP, &gaps)
            },
        )?;

        self.runner.run(
            &format!("GapMerge:{tag}"),
            &[slots::TIME_TABLE, slots::TIME_GAP],
            bundle,
            |b| {
                let table: TimeTable = b.get(slots::TIME_TABLE)?;
                let gaps: TimeGaps = b.get(slots::TIME_GAP)?;
                let (merged, merged_gaps) =
                    merge_gap_tables(&observation.rows, selected, &table, &gaps);
                b.put(slots::TIME_TABLE, &merged)?;
                b.put(slots::TIME_GAP, &merged_gaps)
            },
        )?;

        self.runner.run(
            &format!("PatternAnalysis:{tag}"),
            &[slots::PATTERN],
            bundle,
            |b| {
                let groups: PositionGroups = b.get(slots::POS_DICT)?;
                let table: TimeTable = b.get(slots::TIME_TABLE)?;
                let pattern = analyse_pattern(&groups, &table);
                info!(spw, pol, %pattern, "observing pattern");
                b.put(slots::PATTERN, &pattern)
            },
        )?;

        self.runner.run(
            &format!("TentativeBaseline:{tag}"),
            &[slots::SP_WORK],
            bundle,
            |b| {
                let raw: Vec<Vec<f64>> = b.get(slots::SP_RAW)?;
                let mut work = raw.clone();
                for &id in selected {
                    work[id] = remove_tentative_baseline(&raw[id]);
                }
                b.put(slots::SP_WORK, &work)
            },
        )?;

        self.runner.run(
            &format!("PositionAccumulation:{tag}"),
            &[slots::SP_ACCUMULATED],
            bundle,
            |b| {
                let groups: PositionGroups = b.get(slots::POS_DICT)?;
                let work: Vec<Vec<f64>> = b.get(slots::SP_WORK)?;
                let accumulated = accumulate_by_position(&work, &groups);
                b.put(slots::SP_ACCUMULATED, &accumulated)
            },
        )?;

        self.runner.run(
            &format!("LineDetection:{tag}"),
            &[slots::DETECTED_LINES],
            bundle,
            |b| {
                let detections: Vec<Vec<LineMask>> = if params.spectrum_windows.is_empty() {
                    if iter == 0 {
                        let work: Vec<Vec<f64>> = b.get(slots::SP_WORK)?;
                        selected
                            .iter()
                            .map(|&id| detect_lines(&work[id], params.line_threshold, params.edge))
                            .collect()
                    } else {
                        let gridded: Vec<Vec<f64>> = b.get(slots::SP_GRIDDED)?;
                        gridded
                            .iter()
                            .map(|s| detect_lines(s, params.cluster_nsigma, params.edge))
                            .collect()
                    }
                } else {
                    let abscissa = observation.abscissa.get(&spw).ok_or_else(|| {
                        ReduceError::InvalidObservation(format!("no abscissa for spw {spw}"))
                    })?;
                    let masks: Vec<LineMask> = params
                        .spectrum_windows
                        .iter()
                        .filter_map(|w| freq_window_to_channels(w, abscissa))
                        .collect();
                    selected.iter().map(|_| masks.clone()).collect()
                };
                b.put(slots::DETECTED_LINES, &detections)
            },
        )?;

        self.runner.run(
            &format!("LineValidation:{tag}"),
            &[slots::LINES],
            bundle,
            |b| {
                let detections: Vec<Vec<LineMask>> = b.get(slots::DETECTED_LINES)?;
                let lines = cluster_lines(&detections, min_votes(detections.len()));
                info!(spw, pol, iter, lines = lines.len(), "validated lines");
                b.put(slots::LINES, &lines)
            },
        )?;

        self.runner.run(
            &format!("FitOrderSelection:{tag}"),
            &[slots::FIT_ORDER],
            bundle,
            |b| {
                let mut accumulated: std::collections::BTreeMap<usize, Vec<f64>> =
                    b.get(slots::SP_ACCUMULATED)?;
                let lines: Vec<ValidatedLine> = b.get(slots::LINES)?;
                let masks: Vec<(usize, usize)> =
                    lines.iter().map(|l| (l.start, l.end)).collect();
                for spectrum in accumulated.values_mut() {
                    interpolate_masked(spectrum, &masks);
                }
                let orders = determine_fit_orders(&accumulated, MAX_FIT_ORDER);
                b.put(slots::FIT_ORDER, &orders)
            },
        )?;

        self.runner.run(
            &format!("BaselineFit:{tag}"),
            &[slots::SP_WORK, slots::DATA_TABLE],
            bundle,
            |b| {
                let mut rows: DataTable = b.get(slots::DATA_TABLE)?;
                let raw: Vec<Vec<f64>> = b.get(slots::SP_RAW)?;
                let mut work: Vec<Vec<f64>> = b.get(slots::SP_WORK)?;
                let orders: FitOrders = b.get(slots::FIT_ORDER)?;
                let lines: Vec<ValidatedLine> = b.get(slots::LINES)?;
                let groups: PositionGroups = b.get(slots::POS_DICT)?;
                let masks = line_masks(&lines, params.broad_component);
                for &id in selected {
                    let leader = match groups.get(&id) {
                        Some(PositionRole::Member { leader }) => *leader,
                        _ => id,
                    };
                    let order = orders.get(&leader).copied().unwrap_or(1);
                    let mut spectrum = raw[id].clone();
                    let fit = fit_baseline(&mut spectrum, order, &masks)?;
                    let row = &mut rows[id];
                    row.masks = masks.clone();
                    row.stats.pre_fit_rms = Some(fit.pre_fit_rms);
                    row.stats.post_fit_rms = Some(fit.post_fit_rms);
                    row.stats.low_freq_rms =
                        Some(low_frequency_rms(&spectrum, spectrum.len() / 16));
                    work[id] = spectrum;
                }
                b.put(slots::SP_WORK, &work)?;
                b.put(slots::DATA_TABLE, &rows)
            },
        )?;

        self.runner.run(
            &format!("Flagging:{tag}"),
            &[slots::DATA_TABLE],
            bundle,
            |b| {
                let mut rows: DataTable = b.get(slots::DATA_TABLE)?;
                compute_running_mean_deviation(&mut rows, selected);
                let channel_width_hz = observation
                    .abscissa
                    .get(&spw)
                    .and_then(|a| (a.len() > 1).then(|| (a[1] - a[0]).abs() * 1.0e9))
                    .unwrap_or(0.0);
                compute_expected_rms(&mut rows, selected, channel_width_hz);
                flag_rows(&mut rows, selected, &params, &FlagThresholds::default());
                b.put(slots::DATA_TABLE, &rows)
            },
        )?;

        self.runner.run(
            &format!("Gridding:{tag}"),
            &[slots::SP_GRIDDED, slots::GRID_TABLE, slots::RESULT_TABLE],
            bundle,
            |b| {
                let rows: DataTable = b.get(slots::DATA_TABLE)?;
                let work: Vec<Vec<f64>> = b.get(slots::SP_WORK)?;
                let pattern: ObservingPattern = b.get(slots::PATTERN)?;
                let geometry = GridGeometry::covering(&rows, selected, params.spacing())
                    .ok_or_else(|| {
                        ReduceError::InvalidObservation("empty grid geometry".to_string())
                    })?;
                let weight = if pattern == ObservingPattern::Raster {
                    GridWeight::Gaussian
                } else {
                    GridWeight::Uniform
                };
                let table = grid_spectra(&rows, &work, selected, &geometry, weight, spw, pol);
                let gridded: Vec<Vec<f64>> =
                    table.cells.iter().map(|c| c.spectrum.clone()).collect();
                let mut results: Vec<GridTable> = if b.contains(slots::RESULT_TABLE) {
                    b.get(slots::RESULT_TABLE)?
                } else {
                    Vec::new()
                };
                match results.iter_mut().find(|t| t.spw == spw && t.pol == pol) {
                    Some(existing) => *existing = table.clone(),
                    None => results.push(table.clone()),
                }
                b.put(slots::SP_GRIDDED, &gridded)?;
                b.put(slots::GRID_TABLE, &table)?;
                b.put(slots::RESULT_TABLE, &results)
            },
        )?;

        Ok(())
    }

    /// The cube stage always occupies a stage id for its combination;
    /// whether the body produces a cube depends on the pattern and the
    /// parameters, but the numbering must not.
    fn cube_stage(
        &mut self,
        observation: &Observation,
        bundle: &mut StateBundle,
        spw: u32,
        pol: u32,
        iter: u32,
        selected: &[usize],
    ) -> Result<(), ReduceError> {
        let params = self.params.clone();
        self.runner.run(
            &format!("ImageCubeWrite:spw={spw}:pol={pol}:iter={iter}"),
            &[slots::IMAGE_CUBE],
            bundle,
            |b| {
                let mut cubes: Vec<ImageCube> = if b.contains(slots::IMAGE_CUBE) {
                    b.get(slots::IMAGE_CUBE)?
                } else {
                    Vec::new()
                };
                let pattern: ObservingPattern = b.get(slots::PATTERN)?;
                if params.image_cube && pattern == ObservingPattern::Raster {
                    let table: GridTable = b.get(slots::GRID_TABLE)?;
                    let nchan = selected
                        .first()
                        .map_or(0, |&id| observation.rows[id].nchan);
                    let cube = assemble_cube(&table, nchan);
                    match cubes.iter_mut().find(|c| c.spw == spw && c.pol == pol) {
                        Some(existing) => *existing = cube,
                        None => cubes.push(cube),
                    }
                } else {
                    debug!(spw, pol, %pattern, "no image cube for this combination");
                }
                b.put(slots::IMAGE_CUBE, &cubes)
            },
        )?;
        Ok(())
    }
}

/// Rows of one spw/pol combination surviving the axis selections. With
/// `base` set the looser line-selection scans and rows apply instead.
fn select_rows(
    observation: &Observation,
    params: &ReduceParams,
    spw: u32,
    pol: u32,
    base: bool,
) -> Vec<usize> {
    let selection = &params.selection;
    let (scans, rows) = if base {
        (&selection.scans_base, &selection.rows_base)
    } else {
        (&selection.scans, &selection.rows)
    };
    observation
        .rows
        .iter()
        .filter(|r| {
            r.spw == spw
                && r.pol == pol
                && selection.beams.contains(r.beam)
                && scans.contains(r.scan)
                && rows.contains(r.row as u32)
        })
        .map(|r| r.row)
        .collect()
}

/// Agreement required before a detected line is believed: a tenth of the
/// spectra, at least two when there are that many.
fn min_votes(spectra: usize) -> usize {
    (spectra / 10).max(2).min(spectra.max(1))
}

/// Inclusive channel ranges excluded from baseline fitting. Broad-component
/// sources get each range widened by half its width on both sides.
fn line_masks(lines: &[ValidatedLine], broad_component: bool) -> Vec<(usize, usize)> {
    lines
        .iter()
        .map(|line| {
            if broad_component {
                let width = line.end - line.start + 1;
                (line.start.saturating_sub(width / 2), line.end + width / 2)
            } else {
                (line.start, line.end)
            }
        })
        .collect()
}

#[cfg(test)]
mod integration_tests;
