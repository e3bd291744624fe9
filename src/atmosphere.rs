use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::utils::DynError;

/// Tabulated atmospheric optical depth vs. wavelength and emission height,
/// loaded once from a MODTRAN-style text table.
///
/// The header line `# H2= <ground> H1= <h...>` gives the ground altitude
/// and the tabulated heights (km above sea level); every following line
/// carries one wavelength (nm) and one optical-depth value per height
/// interval. The ground altitude is prepended as the first grid height.
#[derive(Debug, Clone)]
pub struct AtmosphericTable {
    ground_km: f64,
    log_heights_cm: Vec<f64>,
    wavelengths: Vec<i32>,
    optical_depth: Vec<Vec<f64>>,
}

fn parse_f64_token(token: &str) -> Result<f64, DynError> {
    let cleaned = token.trim().trim_matches(',');
    cleaned
        .parse()
        .map_err(|_| format!("Invalid number \"{token}\" in atmospheric transmission data").into())
}

impl AtmosphericTable {
    pub fn from_file(path: &Path) -> Result<Self, DynError> {
        let file = File::open(path).map_err(|e| {
            format!(
                "Unable to open atmospheric transmission file {}: {e}",
                path.display()
            )
        })?;
        Self::parse(BufReader::new(file))
            .map_err(|e| format!("{}: {e}", path.display()).into())
    }

    pub fn parse<R: BufRead>(input: R) -> Result<Self, DynError> {
        let mut lines = input.lines();

        let mut header = None;
        for line in lines.by_ref() {
            let line = line?;
            if line.starts_with("# H2=") {
                header = Some(line);
                break;
            }
        }
        let header =
            header.ok_or("No \"# H2=\" header line in atmospheric transmission data")?;

        // Ground altitude is the first number after "H2="; the height list
        // is everything after the next '=' (or the remaining tokens).
        let rest = &header[5..];
        let (ground_part, heights_part) = match rest.split_once('=') {
            Some((g, h)) => (g, h),
            None => (rest, ""),
        };
        let ground_km = parse_f64_token(
            ground_part
                .split_whitespace()
                .next()
                .ok_or("Missing ground altitude in header line")?,
        )?;
        let height_tokens: Vec<&str> = if heights_part.is_empty() {
            ground_part.split_whitespace().skip(1).collect()
        } else {
            heights_part.split_whitespace().collect()
        };

        let mut heights_km = vec![ground_km];
        for token in height_tokens {
            heights_km.push(parse_f64_token(token)?);
        }
        if heights_km.len() < 2 {
            return Err("Header line lists no tabulated heights".into());
        }
        let log_heights_cm: Vec<f64> = heights_km.iter().map(|h| (h * 1.0e5).log10()).collect();

        let mut wavelengths = Vec::new();
        let mut optical_depth: Vec<Vec<f64>> = Vec::new();
        for line in lines {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut tokens = trimmed.split_whitespace();
            let wl = parse_f64_token(tokens.next().unwrap_or_default())? as i32;
            let row: Vec<f64> = tokens
                .map(parse_f64_token)
                .collect::<Result<Vec<_>, _>>()?;
            if row.len() != heights_km.len() - 1 {
                return Err(format!(
                    "Wavelength {wl} row has {} optical depths, expected {}",
                    row.len(),
                    heights_km.len() - 1
                )
                .into());
            }
            wavelengths.push(wl);
            optical_depth.push(row);
        }
        if wavelengths.is_empty() {
            return Err("No wavelength rows in atmospheric transmission data".into());
        }

        Ok(AtmosphericTable {
            ground_km,
            log_heights_cm,
            wavelengths,
            optical_depth,
        })
    }

    /// Survival probability of a photon of the given wavelength (nm),
    /// emitted at `z_emission` (cm above sea level), traversing the
    /// atmosphere with the given relative airmass (1/cos of the incidence
    /// angle).
    ///
    /// Photons emitted below the ground altitude never survive. The
    /// wavelength is rounded onto the contiguous tabulated grid and
    /// clamped at its edges; optical depth is interpolated linearly in
    /// log10(height) between tabulated values.
    pub fn survival_probability(
        &self,
        wavelength: f64,
        z_emission: f64,
        rel_airmass: f64,
    ) -> f64 {
        if z_emission < self.ground_km * 1.0e5 {
            return 0.0;
        }

        let nwl = self.wavelengths.len();
        let iwl = ((wavelength.round() as i64) - self.wavelengths[0] as i64)
            .clamp(0, nwl as i64 - 1) as usize;
        let row = &self.optical_depth[iwl];

        let lh = &self.log_heights_cm;
        let nh = lh.len();
        let logz = z_emission.log10();

        let depth = if logz < lh[1] {
            // Between ground and the first tabulated height the depth
            // ramps linearly from zero.
            let frac = (logz - lh[0]) / (lh[1] - lh[0]);
            frac * row[0]
        } else if logz >= lh[nh - 1] {
            // At or above the table top the depth stays flat.
            row[nh - 2]
        } else {
            // lh[1] <= logz < lh[nh-1], so the bracketing interval always
            // has a tabulated value on both sides.
            let mut below = 1;
            for (i, h) in lh.iter().enumerate() {
                if *h > logz {
                    break;
                }
                below = i;
            }
            let below = below.min(nh - 2);
            let frac = (logz - lh[below]) / (lh[below + 1] - lh[below]);
            frac * (row[below] - row[below - 1]) + row[below - 1]
        };

        (-depth * rel_airmass).exp()
    }
}
