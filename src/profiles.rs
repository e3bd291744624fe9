use std::io::Write;

use crate::blocks::StreamState;
use crate::eventio::ItemReader;
use crate::output::OutputStore;
use crate::utils::DynError;

// Profile order fixed by the CORSIKA IACT interface.
const PARTICLE_CLASSES: [&str; 9] = [
    "gamma", "e+", "e-", "mu+", "mu-", "hadrons", "charged", "nuclei", "cherenkov",
];

/// Decode a longitudinal-profile block and emit one graph per particle
/// class, named after the current run and event. The depth axis is
/// (i+1) * thickStep for each of the nThick sampling steps.
pub fn process_profiles<W: Write>(
    item: &mut ItemReader,
    state: &StreamState,
    store: &mut OutputStore<W>,
) -> Result<(), DynError> {
    let run = state.run_header.map(|r| r.run_number).unwrap_or(0);
    let event = state.event.as_ref().map(|e| e.event_number).unwrap_or(0);

    let _event_number = item.get_i32()?;
    let _profile_kind = item.get_i32()?;
    let n_profiles = item.get_i16()?.max(0) as usize;
    let n_thick = item.get_i16()?.max(0) as usize;
    let thick_step = item.get_f32()? as f64;

    let depths: Vec<f64> = (0..n_thick).map(|i| (i as f64 + 1.0) * thick_step).collect();

    for p in 0..n_profiles {
        let values = item.get_f32_vec(n_thick)?;
        let class = PARTICLE_CLASSES.get(p).copied().unwrap_or("unknown");
        let name = format!("run{run}_event{event}_{class}");
        store.write_profile(&name, &depths, &values)?;
    }
    Ok(())
}
