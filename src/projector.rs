use std::io::Write;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::atmosphere::AtmosphericTable;
use crate::blocks::{EventHeader, StreamState};
use crate::eventio::ItemReader;
use crate::output::{Binning, Hist2D, OutputStore};
use crate::utils::{cross, dot, normalize, DynError};

/// cos(5 deg): photon bunches more than 5 deg off the shower axis fall
/// outside the assumed 10 deg full-angle field of view.
pub const COS_FOV_HALF: f64 = 0.996_194_698_09;

// Piecewise vertical atmospheric depth vs. altitude (cm), five segments
// fitted offline; the last segment is linear rather than exponential.
const DEPTH_A: [f64; 5] = [-138.717, -28.0547, 0.466743, -0.000530414, 0.00157474];
const DEPTH_B: [f64; 5] = [1165.33, 1204.64, 1345.62, 557.063, 1.0];
const DEPTH_C: [f64; 5] = [994_186.0, 746_232.0, 636_143.0, 772_170.0, 7.43224e9];
const DEPTH_BREAKS: [f64; 5] = [900_000.0, 1_800_000.0, 4_600_000.0, 10_500_000.0, 11_704_000.0];

/// Vertical atmospheric depth (g/cm^2) at the given altitude above sea
/// level. Above the model top the depth is taken as zero.
pub fn vertical_depth(z_cm: f64) -> f64 {
    for seg in 0..4 {
        if z_cm <= DEPTH_BREAKS[seg] {
            return DEPTH_A[seg] + DEPTH_B[seg] * (-z_cm / DEPTH_C[seg]).exp();
        }
    }
    if z_cm <= DEPTH_BREAKS[4] {
        return DEPTH_A[4] - DEPTH_B[4] * z_cm / DEPTH_C[4];
    }
    0.0
}

/// Field-of-view cut: the bunch direction is compared against the shower
/// axis, accepting either sense of the axis.
fn passes_fov(axis: [f64; 3], dir: [f64; 3]) -> bool {
    dot(axis, dir).abs() >= COS_FOV_HALF
}

/// Projects photon bunches onto the shower plane and flushes one
/// accumulation surface per telescope block to the output store. The
/// optional `sample_photons` mode additionally draws every physical
/// photon against the atmospheric transmission table into a second,
/// "detected" surface.
pub struct Projector {
    binning: Binning,
    sample_photons: bool,
    atmosphere: Option<AtmosphericTable>,
    rng: ChaCha8Rng,
}

impl Projector {
    pub fn new(
        binning: Binning,
        sample_photons: bool,
        atmosphere: Option<AtmosphericTable>,
        seed: u64,
    ) -> Result<Self, DynError> {
        if sample_photons && atmosphere.is_none() {
            return Err("--detected needs an atmospheric transmission table (--atmtrans)".into());
        }
        Ok(Projector {
            binning,
            sample_photons,
            atmosphere,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Handle one telescope-bunch block: one call covers all bunches seen
    /// by a single telescope in a single event.
    pub fn process_bunches<W: Write>(
        &mut self,
        item: &mut ItemReader,
        state: &StreamState,
        store: &mut OutputStore<W>,
    ) -> Result<(), DynError> {
        let run = state
            .run_header
            .as_ref()
            .ok_or("Photon bunches arrived before any run header")?;
        let event = state
            .event
            .as_ref()
            .ok_or("Photon bunches arrived before any event header")?;
        let telescopes = state
            .telescopes
            .as_ref()
            .ok_or("Photon bunches arrived before any telescope definitions")?;

        let _array_number = item.get_i16()?;
        let tel_number = item.get_i16()?;
        let _photon_sum = item.get_f32()?;
        let n_bunches = item.get_i32()?;

        // The producer's telescope number indexes the registry directly
        // (historical convention, preserved as-is).
        let tel = match telescopes.entry(tel_number as usize) {
            Some(t) => t,
            None => {
                eprintln!(
                    "[warn] Photon block addresses telescope {tel_number} outside the array; skipped"
                );
                return Ok(());
            }
        };
        // Deselected telescope: skip before touching any bunch data.
        if tel.id < 0 {
            return Ok(());
        }

        // Shower-plane frame, fixed for the whole block. The axis points
        // against the primary's direction of travel; the in-plane
        // horizontal axis is orthogonal to both the axis and the
        // telescope position vector.
        let theta = event.zenith;
        let phi = event.azimuth;
        let axis = [
            -theta.sin() * phi.cos(),
            -theta.sin() * phi.sin(),
            theta.cos(),
        ];
        let tel_pos = [tel.x, tel.y, tel.z];
        // A telescope sitting exactly on the shower axis leaves no
        // in-plane direction to measure lateral distance along.
        let hori = match normalize(cross(axis, tel_pos)) {
            Ok(h) => h,
            Err(_) => {
                eprintln!(
                    "[warn] Telescope {} lies on the shower axis; block skipped",
                    tel.id
                );
                return Ok(());
            }
        };
        let plane_normal = cross(axis, hori);

        let name = format!(
            "run{}_event{}_tel{}",
            run.run_number, event.event_number, tel.id
        );
        let mut hist_all = Hist2D::new(format!("{name}_all"), &self.binning);
        let mut hist_det = if self.sample_photons {
            Some(Hist2D::new(format!("{name}_detected"), &self.binning))
        } else {
            None
        };

        for _ in 0..n_bunches.max(0) {
            let mut data = [0i16; 8];
            item.get_i16s(&mut data)?;

            // Packed fixed-point bunch fields and their scale factors.
            let n_photons = 0.01 * data[6] as f64;
            let _time_ns = 0.1 * data[4] as f64;
            let z_emission = 10.0_f64.powf(0.001 * data[5] as f64); // cm
            let cx = (data[2] as f64 / 3.0e4).clamp(-1.0, 1.0);
            let cy = (data[3] as f64 / 3.0e4).clamp(-1.0, 1.0);
            // cos(theta) of the bunch direction, downwards.
            let cz = -(1.0 - cx * cx - cy * cy).max(0.0).sqrt();
            let dir = [cx, cy, cz];
            // Bunch arrival position in the CORSIKA frame (cm).
            let phot = [
                0.1 * data[0] as f64 + tel.x,
                0.1 * data[1] as f64 + tel.y,
                tel.z,
            ];

            if !passes_fov(axis, dir) {
                continue;
            }

            // Intersect the bunch ray with the shower plane.
            let denom = dot(plane_normal, dir);
            if denom == 0.0 {
                continue; // travelling parallel to the plane
            }
            let d = -dot(plane_normal, phot) / denom;
            let int = [
                d * dir[0] + phot[0],
                d * dir[1] + phot[1],
                d * dir[2] + phot[2],
            ];
            if int[2] < 0.0 {
                continue; // below ground
            }

            let lateral = dot(int, hori);
            let slant = vertical_depth(int[2]) / theta.cos();

            hist_all.fill(lateral / 100.0, slant, n_photons);

            if let Some(hist) = hist_det.as_mut() {
                // Constructor guarantees the table exists in this mode.
                if let Some(table) = self.atmosphere.as_ref() {
                    sample_bunch_photons(
                        table,
                        &mut self.rng,
                        hist,
                        event,
                        data[7],
                        n_photons,
                        z_emission,
                        cz,
                        lateral / 100.0,
                        slant,
                    );
                }
            }
        }

        store.write_hist("allPhotons", &hist_all)?;
        if let Some(hist) = &hist_det {
            store.write_hist("detectedPhotons", hist)?;
        }
        Ok(())
    }
}

/// Per-photon survival sampling, weight 1 per physical photon. A
/// wavelength code of 0 means "unassigned": draw one uniformly over the
/// event's declared range (uniform in inverse wavelength). Codes above
/// 9900 or below 0 are invalid and drop the rest of the bunch.
#[allow(clippy::too_many_arguments)]
fn sample_bunch_photons(
    table: &AtmosphericTable,
    rng: &mut ChaCha8Rng,
    hist: &mut Hist2D,
    event: &EventHeader,
    wl_code: i16,
    n_photons: f64,
    z_emission: f64,
    cz: f64,
    lateral_m: f64,
    slant: f64,
) {
    let mut remaining = n_photons;
    while remaining > 0.0 {
        let wavelength = if wl_code == 0 {
            let u: f64 = rng.gen();
            1.0 / ((1.0 / event.wl_min) - u * ((1.0 / event.wl_min) - (1.0 / event.wl_max)))
        } else if !(0..=9900).contains(&wl_code) {
            break;
        } else {
            wl_code as f64
        };
        let survival = table.survival_probability(wavelength, z_emission, -1.0 / cz);
        if survival > rng.gen::<f64>() {
            hist.fill(lateral_m, slant, 1.0);
        }
        remaining -= 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::{passes_fov, vertical_depth, Projector, COS_FOV_HALF, DEPTH_BREAKS};
    use crate::atmosphere::AtmosphericTable;
    use crate::blocks::{EventHeader, RunHeader, StreamState, TelescopeArray, TYPE_PHOTONS, TYPE_TELESCOPES};
    use crate::eventio::build::StreamBuilder;
    use crate::eventio::EventIoReader;
    use crate::output::{Binning, OutputStore};

    fn default_binning() -> Binning {
        Binning {
            nx: 100,
            x_min: -500.0,
            x_max: 500.0,
            ny: 100,
            y_min: 0.0,
            y_max: 1100.0,
        }
    }

    fn decode_telescopes(xs: &[f32]) -> TelescopeArray {
        let n = xs.len();
        let mut b = StreamBuilder::new();
        b.block(TYPE_TELESCOPES, |p| {
            p.put_i32(n as i32);
            p.put_f32s(xs);
            p.put_f32s(&vec![0.0; n]);
            p.put_f32s(&vec![0.0; n]);
            p.put_f32s(&vec![500.0; n]);
        });
        let bytes = b.into_bytes();
        let mut reader = EventIoReader::new(&bytes[..], 1 << 20);
        let header = reader.find().unwrap().unwrap();
        let block = reader.read(&header).unwrap();
        TelescopeArray::decode(&mut block.reader()).unwrap()
    }

    fn vertical_event() -> EventHeader {
        EventHeader {
            event_number: 12,
            primary_id: 1,
            primary_energy: 1000.0,
            zenith: 0.0,
            azimuth: 0.0,
            obs_levels: vec![0.0],
            wl_min: 290.0,
            wl_max: 700.0,
        }
    }

    fn state_with(telescopes: TelescopeArray) -> StreamState {
        let mut state = StreamState::new();
        state.run_header = Some(RunHeader { run_number: 7 });
        state.event = Some(vertical_event());
        state.telescopes = Some(telescopes);
        state
    }

    /// Bunch block for one telescope with raw 8-field bunches.
    fn bunch_block(tel_number: i16, bunches: &[[i16; 8]]) -> Vec<u8> {
        let mut b = StreamBuilder::new();
        b.block(TYPE_PHOTONS, |p| {
            p.put_i16(0);
            p.put_i16(tel_number);
            p.put_f32(bunches.iter().map(|d| 0.01 * d[6] as f32).sum());
            p.put_i32(bunches.len() as i32);
            for bunch in bunches {
                for field in bunch {
                    p.put_i16(*field);
                }
            }
        });
        b.into_bytes()
    }

    fn run_projector(
        projector: &mut Projector,
        state: &StreamState,
        block_bytes: &[u8],
    ) -> String {
        let mut reader = EventIoReader::new(block_bytes, 1 << 20);
        let header = reader.find().unwrap().unwrap();
        let block = reader.read(&header).unwrap();
        let mut store = OutputStore::from_writer(Vec::new());
        projector
            .process_bunches(&mut block.reader(), state, &mut store)
            .unwrap();
        String::from_utf8(store.into_inner()).unwrap()
    }

    // Bunch aimed 2 deg off a vertical shower axis, at the telescope
    // position: intersects the shower plane at lateral 0.
    const OFF_AXIS_2DEG: [i16; 8] = [0, 0, 1047, 0, 10, 5000, 100, 350];

    #[test]
    fn depth_model_is_continuous_at_every_breakpoint() {
        for bp in &DEPTH_BREAKS[..4] {
            let below = vertical_depth(bp - 1.0);
            let above = vertical_depth(bp + 1.0);
            assert!(
                (below - above).abs() < 0.5,
                "depth jumps at {bp}: {below} vs {above}"
            );
        }
    }

    #[test]
    fn depth_decreases_with_altitude_and_vanishes_above_the_top() {
        let mut previous = f64::INFINITY;
        for z in [0.0, 5.0e5, 1.0e6, 3.0e6, 8.0e6, 1.15e7] {
            let depth = vertical_depth(z);
            assert!(depth < previous, "depth not decreasing at z = {z}");
            previous = depth;
        }
        assert_eq!(vertical_depth(1.2e7), 0.0);
    }

    #[test]
    fn fov_accepts_both_axis_senses_and_rejects_beyond_five_degrees() {
        let axis = [0.0, 0.0, 1.0];
        assert!(passes_fov(axis, [0.0, 0.0, -1.0]));
        assert!(passes_fov(axis, [0.0, 0.0, 1.0]));

        let just_outside = 5.0001_f64.to_radians();
        let dir = [just_outside.sin(), 0.0, -just_outside.cos()];
        assert!(!passes_fov(axis, dir));

        let just_inside = 4.9999_f64.to_radians();
        let dir = [just_inside.sin(), 0.0, -just_inside.cos()];
        assert!(passes_fov(axis, dir));

        // The threshold itself is cos(5 deg).
        assert!((COS_FOV_HALF - 5.0_f64.to_radians().cos()).abs() < 1e-9);
    }

    #[test]
    fn near_axis_bunch_at_the_telescope_lands_at_lateral_zero() {
        let state = state_with(decode_telescopes(&[10_000.0, 20_000.0]));
        let mut projector =
            Projector::new(default_binning(), false, None, 0).unwrap();

        // Telescope number 1 resolves to array position 1, x = 200 m.
        let text = run_projector(&mut projector, &state, &bunch_block(1, &[OFF_AXIS_2DEG]));

        assert!(text.contains("hist2d allPhotons/run7_event12_tel2_all 100 -500 500 100 0 1100"));
        // cx = 1047/30000 puts the plane crossing at x = 0, z = 572717 cm:
        // lateral 0 m (bin 50), slant depth 516.3 (bin 46), weight 1.
        assert!(text.contains("bin 50 46 1"));
        assert!(!text.contains("overflow"));
    }

    #[test]
    fn bunch_outside_the_field_of_view_is_dropped() {
        let state = state_with(decode_telescopes(&[10_000.0, 20_000.0]));
        let mut projector =
            Projector::new(default_binning(), false, None, 0).unwrap();

        // cx = 2615/30000 is 5.0005 deg off axis.
        let mut outside = OFF_AXIS_2DEG;
        outside[2] = 2615;
        let text = run_projector(&mut projector, &state, &bunch_block(1, &[outside]));

        assert!(text.contains("hist2d allPhotons/run7_event12_tel2_all"));
        assert!(!text.contains("bin "));
    }

    #[test]
    fn bunch_heading_away_from_the_ground_plane_is_dropped() {
        let state = state_with(decode_telescopes(&[10_000.0, 20_000.0]));
        let mut projector =
            Projector::new(default_binning(), false, None, 0).unwrap();

        // Mirror the 2 deg tilt: the ray now crosses the plane below
        // ground (intersection z < 0).
        let mut downhill = OFF_AXIS_2DEG;
        downhill[2] = -1047;
        let text = run_projector(&mut projector, &state, &bunch_block(1, &[downhill]));
        assert!(!text.contains("bin "));
    }

    #[test]
    fn deselected_telescope_produces_no_output_at_all() {
        let mut tels = decode_telescopes(&[10_000.0, 20_000.0]);
        tels.select("1").unwrap();
        let state = state_with(tels);
        let mut projector =
            Projector::new(default_binning(), false, None, 0).unwrap();

        let text = run_projector(&mut projector, &state, &bunch_block(1, &[OFF_AXIS_2DEG]));
        assert!(text.is_empty());
    }

    #[test]
    fn out_of_range_telescope_number_is_skipped_not_fatal() {
        let state = state_with(decode_telescopes(&[10_000.0, 20_000.0]));
        let mut projector =
            Projector::new(default_binning(), false, None, 0).unwrap();

        let text = run_projector(&mut projector, &state, &bunch_block(9, &[OFF_AXIS_2DEG]));
        assert!(text.is_empty());
    }

    #[test]
    fn telescope_on_the_shower_axis_is_skipped_not_fatal() {
        // A telescope at the array origin has a null cross product with
        // any shower axis; the block is dropped, later ones still run.
        let state = state_with(decode_telescopes(&[0.0, 20_000.0]));
        let mut projector =
            Projector::new(default_binning(), false, None, 0).unwrap();

        let text = run_projector(&mut projector, &state, &bunch_block(0, &[OFF_AXIS_2DEG]));
        assert!(text.is_empty());

        let text = run_projector(&mut projector, &state, &bunch_block(1, &[OFF_AXIS_2DEG]));
        assert!(text.contains("bin 50 46 1"));
    }

    #[test]
    fn replaying_a_block_reproduces_identical_accumulations() {
        let state = state_with(decode_telescopes(&[10_000.0, 20_000.0]));
        let block = bunch_block(1, &[OFF_AXIS_2DEG, OFF_AXIS_2DEG]);

        let mut first = Projector::new(default_binning(), false, None, 0).unwrap();
        let mut second = Projector::new(default_binning(), false, None, 0).unwrap();
        assert_eq!(
            run_projector(&mut first, &state, &block),
            run_projector(&mut second, &state, &block)
        );
    }

    const CLEAR_SKY_TABLE: &str = "\
# H2= 0.5 H1= 2.0 5.0 10.0
290 0.0 0.0 0.0
700 0.0 0.0 0.0
";

    #[test]
    fn detected_mode_samples_every_photon_through_a_clear_atmosphere() {
        let state = state_with(decode_telescopes(&[10_000.0, 20_000.0]));
        let table = AtmosphericTable::parse(CLEAR_SKY_TABLE.as_bytes()).unwrap();
        let mut projector =
            Projector::new(default_binning(), true, Some(table), 42).unwrap();

        // Emission at 10^5 cm = 1 km, above the 0.5 km ground; zero
        // optical depth means every photon survives.
        let mut bunch = OFF_AXIS_2DEG;
        bunch[6] = 300; // three photons
        let text = run_projector(&mut projector, &state, &bunch_block(1, &[bunch]));

        assert!(text.contains("hist2d allPhotons/run7_event12_tel2_all"));
        assert!(text.contains("hist2d detectedPhotons/run7_event12_tel2_detected"));
        assert!(text.contains("bin 50 46 3\nend\nhist2d detectedPhotons"));
        assert!(text.contains("bin 50 46 3\nend\n"));
    }

    #[test]
    fn invalid_wavelength_codes_drop_the_bunch_from_detection() {
        let state = state_with(decode_telescopes(&[10_000.0, 20_000.0]));
        let table = AtmosphericTable::parse(CLEAR_SKY_TABLE.as_bytes()).unwrap();
        let mut projector =
            Projector::new(default_binning(), true, Some(table), 42).unwrap();

        let mut bunch = OFF_AXIS_2DEG;
        bunch[7] = 9999;
        let text = run_projector(&mut projector, &state, &bunch_block(1, &[bunch]));

        // All-photon surface still fills; the detected surface stays empty.
        assert!(text.contains("bin 50 46 1"));
        let detected = text.split("detectedPhotons").nth(1).unwrap();
        assert!(!detected.contains("bin "));
    }

    #[test]
    fn detected_mode_without_a_table_is_a_setup_error() {
        assert!(Projector::new(default_binning(), true, None, 0).is_err());
    }
}
