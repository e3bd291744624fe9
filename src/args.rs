use clap::Parser;
use std::path::PathBuf;

use crate::output::Binning;
use crate::utils::DynError;

pub const DEFAULT_BINS: &str = "100:-500:500:100:0:1100";
// IO buffer defaults: 100 MB initial, 1 GB hard cap per block.
pub const DEFAULT_BUFSIZE: usize = 100_000_000;
pub const DEFAULT_MAXBUF: usize = 1_000_000_000;

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Analyze CORSIKA IACT event streams and build shower-plane photon histograms",
    long_about = None,
    after_help = "Examples:\n  iact2hist -i run7.iact -o run7.hist\n  corsika < inputs | iact2hist -o run7.hist -m 100\n  iact2hist -i run7.iact --only-telescopes 1,5-10,14 -b 200:-1000:1000:110:0:1100\n  iact2hist -i run7.iact --dump-telescopes\n"
)]
pub struct Args {
    /// CORSIKA IACT input file (reads standard input when omitted)
    #[arg(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Output file name
    #[arg(short = 'o', long, default_value = "output.hist")]
    pub output: PathBuf,

    /// Atmospheric transmission data file (required with --detected)
    #[arg(short = 'a', long)]
    pub atmtrans: Option<PathBuf>,

    /// Maximum number of events to analyze (unlimited when omitted)
    #[arg(short = 'm', long)]
    pub maxevents: Option<i64>,

    /// 2D histogram binning as nX:Xmin:Xmax:nY:Ymin:Ymax
    #[arg(short = 'b', long, default_value = DEFAULT_BINS)]
    pub bins: String,

    /// Save longitudinal profiles to the output file
    #[arg(long)]
    pub longi: bool,

    /// Show telescope positions and stop analyzing
    #[arg(long)]
    pub dump_telescopes: bool,

    /// Echo CORSIKA input cards to standard output
    #[arg(long)]
    pub dump_inputs: bool,

    /// Analyze only specific telescopes, e.g. 1,5-10,14 (1-based array positions)
    #[arg(long)]
    pub only_telescopes: Option<String>,

    /// Sample individual photons against atmospheric transmission
    /// into a second set of histograms
    #[arg(long)]
    pub detected: bool,

    /// Random seed for --detected photon sampling
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Initial size of the input buffer (bytes)
    #[arg(long, default_value_t = DEFAULT_BUFSIZE)]
    pub bufsize: usize,

    /// Maximum accepted data-block size (bytes)
    #[arg(long, default_value_t = DEFAULT_MAXBUF)]
    pub maxbuf: usize,
}

/// Parse a colon-separated binning spec, nX:Xmin:Xmax:nY:Ymin:Ymax.
pub fn parse_bins(spec: &str) -> Result<Binning, DynError> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() != 6 {
        return Err(format!("Binning spec \"{spec}\" must have 6 colon-separated values").into());
    }
    let nums: Vec<f64> = parts
        .iter()
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Invalid binning spec \"{spec}\": {e}"))?;

    let binning = Binning {
        nx: nums[0] as usize,
        x_min: nums[1],
        x_max: nums[2],
        ny: nums[3] as usize,
        y_min: nums[4],
        y_max: nums[5],
    };
    if binning.nx == 0 || binning.ny == 0 {
        return Err("Binning spec needs at least one bin per axis".into());
    }
    if binning.x_max <= binning.x_min || binning.y_max <= binning.y_min {
        return Err("Binning spec needs max > min on both axes".into());
    }
    Ok(binning)
}
