//! The science payload: grouping, baseline removal, line detection,
//! flagging, and gridding. Everything here is deterministic and pure over
//! the in-memory observation; persistence and restart sit above it in the
//! driver.

pub mod baseline;
pub mod detection;
pub mod flagging;
pub mod gridding;
pub mod grouping;
pub mod table;

#[cfg(test)]
pub(crate) mod testkit {
    //! Synthetic observations for unit and integration tests.

    use super::table::{DataRow, Observation};
    use std::collections::BTreeMap;

    /// Deterministic low-level noise; stays well under 3 sigma of its own
    /// MAD scale so it never triggers line detection.
    fn noise(seed: usize, channel: usize) -> f64 {
        0.05 * ((seed as f64 * 0.7341 + channel as f64 * 12.9898).sin())
    }

    fn base_row(index: usize, ra: f64, dec: f64, time: f64, nchan: usize) -> DataRow {
        DataRow {
            row: index,
            scan: 0,
            spw: 0,
            pol: 0,
            beam: 0,
            time,
            elapsed: time,
            exposure: 1.0,
            ra,
            dec,
            nchan,
            tsys: 100.0,
            target: "M17SW".to_string(),
            stats: Default::default(),
            flags: Default::default(),
            masks: Vec::new(),
        }
    }

    fn abscissa(nchan: usize) -> BTreeMap<u32, Vec<f64>> {
        let mut map = BTreeMap::new();
        map.insert(0, (0..nchan).map(|i| 45.0 + 0.001 * i as f64).collect());
        map
    }

    /// An `nx` by `ny` raster scan: every pointing distinct, 0.001 degree
    /// spacing, uniform one-second sampling.
    pub fn raster_observation(nx: usize, ny: usize, nchan: usize) -> Observation {
        let mut rows = Vec::new();
        let mut spectra = Vec::new();
        for y in 0..ny {
            for x in 0..nx {
                let index = y * nx + x;
                rows.push(base_row(
                    index,
                    0.001 * x as f64,
                    0.001 * y as f64,
                    index as f64,
                    nchan,
                ));
                spectra.push((0..nchan).map(|c| noise(index, c)).collect());
            }
        }
        Observation {
            rows,
            spectra,
            abscissa: abscissa(nchan),
        }
    }

    /// `npoint` discrete pointings 0.1 degrees apart, `nper` integrations
    /// each, with a 600 second slew between pointings.
    pub fn pointed_observation(npoint: usize, nper: usize, nchan: usize) -> Observation {
        let mut rows = Vec::new();
        let mut spectra = Vec::new();
        let mut time = 0.0;
        for p in 0..npoint {
            for _ in 0..nper {
                let index = rows.len();
                rows.push(base_row(index, 0.1 * p as f64, 0.0, time, nchan));
                spectra.push((0..nchan).map(|c| noise(index, c)).collect());
                time += 1.0;
            }
            time += 600.0;
        }
        Observation {
            rows,
            spectra,
            abscissa: abscissa(nchan),
        }
    }

    /// Noise spectrum with a Gaussian line of the given amplitude between
    /// channels `start` and `end` inclusive. Amplitude zero gives pure
    /// noise.
    pub fn spectrum_with_line(nchan: usize, start: usize, end: usize, amp: f64) -> Vec<f64> {
        let center = (start + end) as f64 / 2.0;
        let sigma = ((end.saturating_sub(start)) as f64 / 4.0).max(1.0);
        (0..nchan)
            .map(|c| {
                let d = c as f64 - center;
                noise(7, c) + amp * (-d * d / (2.0 * sigma * sigma)).exp()
            })
            .collect()
    }
}
