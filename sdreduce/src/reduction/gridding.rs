//! Spatial re-gridding of calibrated spectra.
//!
//! Flag-passing spectra are combined onto a regular grid of sky cells; the
//! gridded spectra feed the next line-detection iteration and, for raster
//! maps, the output image cube.

use crate::reduction::table::{DataRow, GridMeta, ImageCube};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Weighting applied when combining spectra into a cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridWeight {
    /// Every contributing spectrum counts equally.
    #[default]
    Uniform,
    /// Gaussian taper on the distance to the cell centre, falling to 1/e
    /// at half the cell spacing.
    Gaussian,
}

/// Geometry of the output grid for one spectral window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    /// Cells along right ascension.
    pub nx: usize,
    /// Cells along declination.
    pub ny: usize,
    /// Cell spacing in degrees.
    pub spacing: f64,
    /// Map centre `(ra, dec)` in degrees.
    pub center: (f64, f64),
}

impl GridGeometry {
    /// Lays a grid over the selected rows with the given cell spacing.
    /// Returns `None` when no rows are selected.
    #[must_use]
    pub fn covering(rows: &[DataRow], selected: &[usize], spacing: f64) -> Option<Self> {
        if selected.is_empty() || spacing <= 0.0 {
            return None;
        }
        let mut ra_min = f64::INFINITY;
        let mut ra_max = f64::NEG_INFINITY;
        let mut dec_min = f64::INFINITY;
        let mut dec_max = f64::NEG_INFINITY;
        for &id in selected {
            let row = &rows[id];
            ra_min = ra_min.min(row.ra);
            ra_max = ra_max.max(row.ra);
            dec_min = dec_min.min(row.dec);
            dec_max = dec_max.max(row.dec);
        }
        let nx = ((ra_max - ra_min) / spacing).floor() as usize + 1;
        let ny = ((dec_max - dec_min) / spacing).floor() as usize + 1;
        Some(Self {
            nx,
            ny,
            spacing,
            center: ((ra_min + ra_max) / 2.0, (dec_min + dec_max) / 2.0),
        })
    }

    /// Cell indices for a position; `None` when it falls off the grid.
    #[must_use]
    pub fn cell_of(&self, ra: f64, dec: f64) -> Option<(usize, usize)> {
        let origin_ra = self.center.0 - self.spacing * (self.nx as f64 - 1.0) / 2.0;
        let origin_dec = self.center.1 - self.spacing * (self.ny as f64 - 1.0) / 2.0;
        let ix = ((ra - origin_ra) / self.spacing + 0.5).floor();
        let iy = ((dec - origin_dec) / self.spacing + 0.5).floor();
        if ix < 0.0 || iy < 0.0 {
            return None;
        }
        let (ix, iy) = (ix as usize, iy as usize);
        (ix < self.nx && iy < self.ny).then_some((ix, iy))
    }

    /// Sky position of a cell centre.
    #[must_use]
    pub fn position_of(&self, ix: usize, iy: usize) -> (f64, f64) {
        let origin_ra = self.center.0 - self.spacing * (self.nx as f64 - 1.0) / 2.0;
        let origin_dec = self.center.1 - self.spacing * (self.ny as f64 - 1.0) / 2.0;
        (
            origin_ra + self.spacing * ix as f64,
            origin_dec + self.spacing * iy as f64,
        )
    }
}

/// One populated output cell: combined spectrum plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    /// Cell index along right ascension.
    pub ix: usize,
    /// Cell index along declination.
    pub iy: usize,
    /// Accumulation bookkeeping for the cell.
    pub meta: GridMeta,
    /// Weighted mean of the contributing spectra.
    pub spectrum: Vec<f64>,
}

/// Result of gridding one spectral-window / polarization combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridTable {
    /// Spectral window the table was gridded from.
    pub spw: u32,
    /// Polarization the table was gridded from.
    pub pol: u32,
    /// The grid laid over the selected pointings.
    pub geometry: GridGeometry,
    /// Populated cells, in row-major order.
    pub cells: Vec<GridCell>,
}

/// Combines the flag-passing spectra of one spw/pol onto the grid.
///
/// Rows whose summary flag is down contribute to the `flagged` count of
/// their cell but not to its spectrum. Cells nobody lands in are omitted.
#[must_use]
pub fn grid_spectra(
    rows: &[DataRow],
    spectra: &[Vec<f64>],
    selected: &[usize],
    geometry: &GridGeometry,
    weight: GridWeight,
    spw: u32,
    pol: u32,
) -> GridTable {
    struct Accumulator {
        sum: Vec<f64>,
        weight_sum: f64,
        combined: usize,
        flagged: usize,
    }
    let mut cells: std::collections::BTreeMap<(usize, usize), Accumulator> =
        std::collections::BTreeMap::new();
    let nchan = selected.first().map_or(0, |&id| spectra[id].len());
    for &id in selected {
        let row = &rows[id];
        let Some((ix, iy)) = geometry.cell_of(row.ra, row.dec) else {
            continue;
        };
        let acc = cells.entry((iy, ix)).or_insert_with(|| Accumulator {
            sum: vec![0.0; nchan],
            weight_sum: 0.0,
            combined: 0,
            flagged: 0,
        });
        if !row.flags.summary {
            acc.flagged += 1;
            continue;
        }
        let w = match weight {
            GridWeight::Uniform => 1.0,
            GridWeight::Gaussian => {
                let (cra, cdec) = geometry.position_of(ix, iy);
                let d2 = (row.ra - cra).powi(2) + (row.dec - cdec).powi(2);
                let half = geometry.spacing / 2.0;
                (-d2 / (half * half)).exp()
            }
        };
        for (s, &v) in acc.sum.iter_mut().zip(&spectra[id]) {
            *s += w * v;
        }
        acc.weight_sum += w;
        acc.combined += 1;
    }

    let cells: Vec<GridCell> = cells
        .into_iter()
        .filter(|(_, acc)| acc.combined > 0)
        .map(|((iy, ix), acc)| {
            let spectrum: Vec<f64> = acc.sum.iter().map(|&s| s / acc.weight_sum).collect();
            let mean = spectrum.iter().sum::<f64>() / spectrum.len().max(1) as f64;
            let rms = (spectrum.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / spectrum.len().max(1) as f64)
                .sqrt();
            let (ra, dec) = geometry.position_of(ix, iy);
            GridCell {
                ix,
                iy,
                meta: GridMeta {
                    spw,
                    pol,
                    ra,
                    dec,
                    combined: acc.combined,
                    flagged: acc.flagged,
                    rms,
                },
                spectrum,
            }
        })
        .collect();
    debug!(spw, pol, cells = cells.len(), "gridded spectra");
    GridTable {
        spw,
        pol,
        geometry: geometry.clone(),
        cells,
    }
}

/// Assembles a dense image cube from a grid table. Empty cells are filled
/// with zeros.
#[must_use]
pub fn assemble_cube(table: &GridTable, nchan: usize) -> ImageCube {
    let geometry = &table.geometry;
    let mut data = vec![0.0; geometry.nx * geometry.ny * nchan];
    for cell in &table.cells {
        let base = (cell.iy * geometry.nx + cell.ix) * nchan;
        for (slot, &v) in data[base..base + nchan].iter_mut().zip(&cell.spectrum) {
            *slot = v;
        }
    }
    info!(
        spw = table.spw,
        pol = table.pol,
        nx = geometry.nx,
        ny = geometry.ny,
        nchan,
        "assembled image cube"
    );
    ImageCube {
        spw: table.spw,
        pol: table.pol,
        nx: geometry.nx,
        ny: geometry.ny,
        nchan,
        cell: geometry.spacing,
        center: geometry.center,
        data,
    }
}
