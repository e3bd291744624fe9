use crate::eventio::ItemReader;
use crate::utils::DynError;

// Block types written by the CORSIKA IACT interface (sim_telarray numbering).
pub const TYPE_RUN_HEADER: u16 = 1200;
pub const TYPE_TELESCOPES: u16 = 1201;
pub const TYPE_EVENT_HEADER: u16 = 1202;
pub const TYPE_TEL_OFFSETS: u16 = 1203;
pub const TYPE_TEL_ARRAY: u16 = 1204;
pub const TYPE_PHOTONS: u16 = 1205;
pub const TYPE_CAMERA_LAYOUT: u16 = 1206;
pub const TYPE_PHOTO_ELECTRONS: u16 = 1208;
pub const TYPE_EVENT_END: u16 = 1209;
pub const TYPE_RUN_END: u16 = 1210;
pub const TYPE_LONGI: u16 = 1211;
pub const TYPE_INPUT_CARDS: u16 = 1212;
pub const TYPE_ARRAY_HEAD: u16 = 1213;
pub const TYPE_ARRAY_END: u16 = 1214;

// CORSIKA header/trailer blocks are a fixed 273-word float vector plus a
// leading word count. Fields past the declared count read as 0.
const N_FIELDS: usize = 274;

fn read_corsika_fields(item: &mut ItemReader) -> Result<[f32; N_FIELDS], DynError> {
    let declared = item.get_i32()?;
    if declared < 0 {
        return Err("CORSIKA block declares a negative word count".into());
    }
    let mut fields = [0.0f32; N_FIELDS];
    fields[0] = declared as f32;
    for i in 0..declared as usize {
        let value = item.get_f32()?;
        if i + 1 < N_FIELDS {
            fields[i + 1] = value;
        }
    }
    Ok(fields)
}

#[derive(Debug, Clone, Copy)]
pub struct RunHeader {
    pub run_number: i32,
}

impl RunHeader {
    pub fn decode(item: &mut ItemReader) -> Result<Self, DynError> {
        let fields = read_corsika_fields(item)?;
        Ok(RunHeader {
            run_number: fields[2] as i32,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EventHeader {
    pub event_number: i32,
    pub primary_id: i32,
    /// Primary energy in GeV.
    pub primary_energy: f64,
    /// Zenith angle in radians.
    pub zenith: f64,
    /// Azimuth angle in radians.
    pub azimuth: f64,
    /// Observation-level altitudes in cm.
    #[allow(dead_code)]
    pub obs_levels: Vec<f64>,
    /// Cherenkov wavelength range in nm.
    pub wl_min: f64,
    pub wl_max: f64,
}

impl EventHeader {
    pub fn decode(item: &mut ItemReader) -> Result<Self, DynError> {
        let fields = read_corsika_fields(item)?;
        let n_levels = (fields[47] as usize).min(10);
        let obs_levels = (0..n_levels).map(|i| fields[48 + i] as f64).collect();
        Ok(EventHeader {
            event_number: fields[2] as i32,
            primary_id: fields[3] as i32,
            primary_energy: fields[4] as f64,
            zenith: fields[11] as f64,
            azimuth: fields[12] as f64,
            obs_levels,
            wl_min: fields[96] as f64,
            wl_max: fields[97] as f64,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunEnd {
    #[allow(dead_code)]
    pub run_number: i32,
}

impl RunEnd {
    pub fn decode(item: &mut ItemReader) -> Result<Self, DynError> {
        let fields = read_corsika_fields(item)?;
        Ok(RunEnd {
            run_number: fields[2] as i32,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EventEnd {
    #[allow(dead_code)]
    pub event_number: i32,
}

impl EventEnd {
    pub fn decode(item: &mut ItemReader) -> Result<Self, DynError> {
        let fields = read_corsika_fields(item)?;
        Ok(EventEnd {
            event_number: fields[2] as i32,
        })
    }
}

/// One telescope as seen by the projector: position and radius in cm,
/// plus the user-facing output ID (-1 when deselected).
#[derive(Debug, Clone, Copy)]
pub struct TelescopeEntry {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r: f64,
    pub id: i32,
}

/// Telescope positions from the array-definition block.
///
/// Positions are kept in cm and indexed by array position. The parallel
/// `id` vector starts as 1..N and can be rewritten once by a selection
/// string; entries left at -1 are excluded from all output.
#[derive(Debug, Clone, Default)]
pub struct TelescopeArray {
    x: Vec<f32>,
    y: Vec<f32>,
    z: Vec<f32>,
    r: Vec<f32>,
    id: Vec<i32>,
}

impl TelescopeArray {
    pub fn decode(item: &mut ItemReader) -> Result<Self, DynError> {
        let n = item.get_i32()?;
        if n < 0 {
            return Err("Telescope block declares a negative telescope count".into());
        }
        let n = n as usize;
        let x = item.get_f32_vec(n)?;
        let y = item.get_f32_vec(n)?;
        let z = item.get_f32_vec(n)?;
        let r = item.get_f32_vec(n)?;
        let id = (1..=n as i32).collect();
        Ok(TelescopeArray { x, y, z, r, id })
    }

    pub fn len(&self) -> usize {
        self.id.len()
    }

    pub fn entry(&self, index: usize) -> Option<TelescopeEntry> {
        if index >= self.id.len() {
            return None;
        }
        Some(TelescopeEntry {
            x: self.x[index] as f64,
            y: self.y[index] as f64,
            z: self.z[index] as f64,
            r: self.r[index] as f64,
            id: self.id[index],
        })
    }

    #[cfg(test)]
    pub fn ids(&self) -> &[i32] {
        &self.id
    }

    /// Rewrite output IDs from a selection string of 1-based array
    /// positions ("1,5-10,14"). Selected telescopes are renumbered by
    /// ascending position; everything else drops to -1.
    pub fn select(&mut self, selection: &str) -> Result<(), DynError> {
        let mut positions = parse_selection(selection)?;
        positions.sort_unstable();
        positions.dedup();
        for pos in &positions {
            if *pos < 1 || *pos > self.id.len() {
                return Err(format!(
                    "Telescope selection names position {} but the array has {} telescopes",
                    pos,
                    self.id.len()
                )
                .into());
            }
        }
        for id in self.id.iter_mut() {
            *id = -1;
        }
        for (rank, pos) in positions.iter().enumerate() {
            self.id[pos - 1] = rank as i32 + 1;
        }
        Ok(())
    }

    /// Print selected telescope positions, converted to meters.
    pub fn dump_positions(&self) {
        println!();
        println!("Telescope ID    X [m]    Y [m]    Z [m]    R [m]");
        println!();
        for i in 0..self.len() {
            if self.id[i] < 0 {
                continue;
            }
            println!(
                "{:>12} {:>8.2} {:>8.2} {:>8.2} {:>8.2}",
                self.id[i],
                0.01 * self.x[i],
                0.01 * self.y[i],
                0.01 * self.z[i],
                0.01 * self.r[i]
            );
        }
    }
}

/// Parse a comma-separated list of 1-based positions and inclusive
/// hyphenated ranges into a flat position list. Non-numeric tokens are a
/// fatal input error.
fn parse_selection(selection: &str) -> Result<Vec<usize>, DynError> {
    let mut positions = Vec::new();
    for token in selection.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('-') {
            None => {
                let pos: usize = token
                    .parse()
                    .map_err(|_| format!("Invalid telescope selection token \"{token}\""))?;
                positions.push(pos);
            }
            Some((first, last)) => {
                let first: usize = first
                    .trim()
                    .parse()
                    .map_err(|_| format!("Invalid telescope selection token \"{token}\""))?;
                let last: usize = last
                    .trim()
                    .parse()
                    .map_err(|_| format!("Invalid telescope selection token \"{token}\""))?;
                positions.extend(first..=last);
            }
        }
    }
    if positions.is_empty() {
        return Err("Telescope selection is empty".into());
    }
    Ok(positions)
}

/// Synthetic array-placement offsets for the current event. Ingested to
/// keep the stream state complete; only downstream consumers read them.
#[allow(dead_code)]
#[derive(Debug, Clone, Default)]
pub struct TelescopeOffsets {
    pub t_off: f64,
    pub x_off: Vec<f32>,
    pub y_off: Vec<f32>,
}

impl TelescopeOffsets {
    pub fn decode(item: &mut ItemReader) -> Result<Self, DynError> {
        let n = item.get_i32()?;
        if n < 0 {
            return Err("Offset block declares a negative array count".into());
        }
        let t_off = item.get_f32()? as f64;
        let x_off = item.get_f32_vec(n as usize)?;
        let y_off = item.get_f32_vec(n as usize)?;
        Ok(TelescopeOffsets { t_off, x_off, y_off })
    }
}

/// Current run/event/telescope context, updated in place by the block
/// dispatcher and read by the projector within the same call stack.
#[derive(Default)]
pub struct StreamState {
    pub run_header: Option<RunHeader>,
    pub run_end: Option<RunEnd>,
    pub event: Option<EventHeader>,
    pub event_end: Option<EventEnd>,
    pub telescopes: Option<TelescopeArray>,
    #[allow(dead_code)]
    pub offsets: Option<TelescopeOffsets>,
    pub events_seen: i64,
}

impl StreamState {
    pub fn new() -> Self {
        StreamState::default()
    }
}
