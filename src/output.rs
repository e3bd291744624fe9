use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::blocks::TelescopeArray;
use crate::utils::DynError;

/// 2-D histogram axes: bin counts and edges for lateral distance (m) on x
/// and slant depth on y.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Binning {
    pub nx: usize,
    pub x_min: f64,
    pub x_max: f64,
    pub ny: usize,
    pub y_min: f64,
    pub y_max: f64,
}

/// Dense-count, sparsely-written 2-D accumulation surface. Fills outside
/// the axes (including non-finite coordinates) collect into a single
/// overflow weight.
pub struct Hist2D {
    name: String,
    binning: Binning,
    bins: Vec<f64>,
    overflow: f64,
}

impl Hist2D {
    pub fn new(name: impl Into<String>, binning: &Binning) -> Self {
        Hist2D {
            name: name.into(),
            binning: *binning,
            bins: vec![0.0; binning.nx * binning.ny],
            overflow: 0.0,
        }
    }

    fn bin_index(&self, x: f64, y: f64) -> Option<usize> {
        let b = &self.binning;
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        if x < b.x_min || x >= b.x_max || y < b.y_min || y >= b.y_max {
            return None;
        }
        let ix = ((x - b.x_min) / (b.x_max - b.x_min) * b.nx as f64) as usize;
        let iy = ((y - b.y_min) / (b.y_max - b.y_min) * b.ny as f64) as usize;
        // Exact-edge rounding can land one past the last bin.
        Some(iy.min(b.ny - 1) * b.nx + ix.min(b.nx - 1))
    }

    pub fn fill(&mut self, x: f64, y: f64, weight: f64) {
        match self.bin_index(x, y) {
            Some(i) => self.bins[i] += weight,
            None => self.overflow += weight,
        }
    }

    #[cfg(test)]
    pub fn total(&self) -> f64 {
        self.bins.iter().sum()
    }
}

/// Line-oriented persistent store for everything the analysis emits:
/// the per-run summary row, telescope rows, shower-plane histograms and
/// longitudinal-profile graphs.
pub struct OutputStore<W: Write> {
    out: W,
}

impl OutputStore<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self, DynError> {
        let file = File::create(path)
            .map_err(|e| format!("Error creating output file {}: {e}", path.display()))?;
        Ok(OutputStore {
            out: BufWriter::new(file),
        })
    }
}

impl<W: Write> OutputStore<W> {
    pub fn from_writer(out: W) -> Self {
        OutputStore { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn flush(&mut self) -> Result<(), DynError> {
        self.out.flush()?;
        Ok(())
    }

    /// Run summary row. Angles arrive in degrees; azimuth is normalized
    /// into [0, 360).
    pub fn write_summary(
        &mut self,
        run: i32,
        primary_id: i32,
        energy_tev: f64,
        zenith_deg: f64,
        azimuth_deg: f64,
    ) -> Result<(), DynError> {
        let mut azimuth = azimuth_deg;
        while azimuth < 0.0 {
            azimuth += 360.0;
        }
        while azimuth > 360.0 {
            azimuth -= 360.0;
        }
        writeln!(
            self.out,
            "summary {run} {primary_id} {energy_tev} {zenith_deg} {azimuth}"
        )?;
        Ok(())
    }

    /// One row per selected telescope, positions converted from cm to m.
    pub fn write_telescopes(&mut self, telescopes: &TelescopeArray) -> Result<(), DynError> {
        for i in 0..telescopes.len() {
            let Some(t) = telescopes.entry(i) else {
                break;
            };
            if t.id < 0 {
                continue;
            }
            writeln!(
                self.out,
                "telescope {} {} {} {} {}",
                t.id,
                0.01 * t.x,
                0.01 * t.y,
                0.01 * t.z,
                0.01 * t.r
            )?;
        }
        Ok(())
    }

    /// Emit one histogram as a sparse block of non-empty bins.
    pub fn write_hist(&mut self, group: &str, hist: &Hist2D) -> Result<(), DynError> {
        let b = &hist.binning;
        writeln!(
            self.out,
            "hist2d {}/{} {} {} {} {} {} {}",
            group, hist.name, b.nx, b.x_min, b.x_max, b.ny, b.y_min, b.y_max
        )?;
        for iy in 0..b.ny {
            for ix in 0..b.nx {
                let w = hist.bins[iy * b.nx + ix];
                if w != 0.0 {
                    writeln!(self.out, "bin {ix} {iy} {w}")?;
                }
            }
        }
        if hist.overflow != 0.0 {
            writeln!(self.out, "overflow {}", hist.overflow)?;
        }
        writeln!(self.out, "end")?;
        Ok(())
    }

    /// Emit one longitudinal-profile graph as depth/value points.
    pub fn write_profile(
        &mut self,
        name: &str,
        depths: &[f64],
        values: &[f32],
    ) -> Result<(), DynError> {
        writeln!(self.out, "profile {} {}", name, depths.len())?;
        for (d, v) in depths.iter().zip(values.iter()) {
            writeln!(self.out, "point {d} {v}")?;
        }
        writeln!(self.out, "end")?;
        Ok(())
    }
}
