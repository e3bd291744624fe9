mod args;
mod atmosphere;
mod blocks;
mod eventio;
mod output;
mod profiles;
mod projector;
mod utils;

use std::fs::File;
use std::io::{self, BufReader, Read, Write};

use clap::Parser;

use args::Args;
use atmosphere::AtmosphericTable;
use blocks::{
    EventEnd, EventHeader, RunEnd, RunHeader, StreamState, TelescopeArray, TelescopeOffsets,
    TYPE_ARRAY_END, TYPE_ARRAY_HEAD, TYPE_CAMERA_LAYOUT, TYPE_EVENT_END, TYPE_EVENT_HEADER,
    TYPE_INPUT_CARDS, TYPE_LONGI, TYPE_PHOTONS, TYPE_PHOTO_ELECTRONS, TYPE_RUN_END,
    TYPE_RUN_HEADER, TYPE_TELESCOPES, TYPE_TEL_ARRAY, TYPE_TEL_OFFSETS,
};
use eventio::EventIoReader;
use output::OutputStore;
use projector::Projector;
use utils::DynError;

// Block types discarded without decoding.
const SKIP_TYPES: [u16; 3] = [0, TYPE_CAMERA_LAYOUT, TYPE_PHOTO_ELECTRONS];

struct DispatchOptions {
    max_events: Option<i64>,
    /// Live input: keep draining after `done` so the producer never
    /// blocks on a full pipe.
    from_stdin: bool,
    dump_telescopes: bool,
    dump_inputs: bool,
    save_longi: bool,
    only_telescopes: Option<String>,
    quiet: bool,
}

impl DispatchOptions {
    fn from_args(args: &Args) -> Self {
        DispatchOptions {
            max_events: args.maxevents,
            from_stdin: args.input.is_none(),
            dump_telescopes: args.dump_telescopes,
            dump_inputs: args.dump_inputs,
            save_longi: args.longi,
            only_telescopes: args.only_telescopes.clone(),
            quiet: false,
        }
    }
}

/// Drive the event stream: pull one block at a time, update the stream
/// state for header blocks, hand bunch blocks to the projector.
///
/// The producer guarantees ordering (run header before event headers,
/// telescope definitions before bunches); violations surface as errors
/// from the consumers rather than being validated here.
fn dispatch<R: Read, W: Write>(
    reader: &mut EventIoReader<R>,
    state: &mut StreamState,
    projector: &mut Projector,
    store: &mut OutputStore<W>,
    opts: &DispatchOptions,
) -> Result<(), DynError> {
    let mut first_event = true;
    let mut done = false;

    while let Some(header) = reader.find()? {
        if let Some(max) = opts.max_events {
            if max > 0 && state.events_seen > max {
                done = true;
            }
        }
        // Once done, a finite file stops here; a live pipe drains.
        if done && !opts.from_stdin {
            break;
        }
        if done {
            reader.skip(&header)?;
            continue;
        }

        if SKIP_TYPES.contains(&header.block_type) {
            reader.skip(&header)?;
            continue;
        }

        let block = reader.read(&header)?;
        if !opts.quiet {
            show_progress(header.block_type);
        }
        let mut item = block.reader();

        match header.block_type {
            TYPE_RUN_HEADER => {
                state.run_header = Some(RunHeader::decode(&mut item)?);
            }
            TYPE_TELESCOPES => {
                let mut telescopes = TelescopeArray::decode(&mut item)?;
                if let Some(selection) = &opts.only_telescopes {
                    telescopes.select(selection)?;
                }
                if opts.dump_telescopes {
                    telescopes.dump_positions();
                    done = true;
                }
                state.telescopes = Some(telescopes);
            }
            TYPE_EVENT_HEADER => {
                state.event = Some(EventHeader::decode(&mut item)?);
                if first_event {
                    write_run_summary(state, store)?;
                }
                first_event = false;
                state.events_seen += 1;
            }
            TYPE_TEL_OFFSETS => {
                state.offsets = Some(TelescopeOffsets::decode(&mut item)?);
            }
            TYPE_TEL_ARRAY => {
                while item.peek_sub_type() == Some(TYPE_PHOTONS) {
                    let mut sub = item.sub_item()?;
                    projector.process_bunches(&mut sub.reader, state, store)?;
                }
            }
            TYPE_PHOTONS => {
                projector.process_bunches(&mut item, state, store)?;
            }
            TYPE_EVENT_END => {
                state.event_end = Some(EventEnd::decode(&mut item)?);
            }
            TYPE_RUN_END => {
                state.run_end = Some(RunEnd::decode(&mut item)?);
            }
            TYPE_LONGI => {
                if opts.save_longi {
                    profiles::process_profiles(&mut item, state, store)?;
                }
            }
            TYPE_INPUT_CARDS => {
                let n_lines = item.get_i32()?;
                for _ in 0..n_lines.max(0) {
                    let line = item.get_string16()?;
                    if opts.dump_inputs {
                        println!("{line}");
                    }
                }
            }
            TYPE_ARRAY_HEAD | TYPE_ARRAY_END => {}
            other => {
                eprintln!("[warn] Unknown block type {other} will be skipped");
            }
        }
    }
    Ok(())
}

/// Run/telescope summary rows, written once on the first event header.
/// Primary energy converts GeV to TeV, angles to degrees.
fn write_run_summary<W: Write>(
    state: &StreamState,
    store: &mut OutputStore<W>,
) -> Result<(), DynError> {
    let run = state.run_header.map(|r| r.run_number).unwrap_or(0);
    let event = state
        .event
        .as_ref()
        .ok_or("Run summary requested without an event header")?;
    store.write_summary(
        run,
        event.primary_id,
        0.001 * event.primary_energy,
        event.zenith.to_degrees(),
        event.azimuth.to_degrees(),
    )?;
    if let Some(telescopes) = &state.telescopes {
        store.write_telescopes(telescopes)?;
    }
    Ok(())
}

fn show_progress(block_type: u16) {
    match block_type {
        TYPE_RUN_HEADER => println!("1200: Reading CORSIKA run header"),
        TYPE_TELESCOPES => println!("1201: Reading position and sizes of telescopes"),
        TYPE_EVENT_HEADER => println!("1202: CORSIKA event header found"),
        TYPE_TEL_OFFSETS => println!("1203:   Reading telescope offsets for this event"),
        TYPE_TEL_ARRAY => println!("1204:   Start reading photon bunches"),
        TYPE_EVENT_END => println!("1209: CORSIKA event end found"),
        TYPE_RUN_END => println!("1210: CORSIKA run end found"),
        TYPE_LONGI => println!("1211:   Longitudinal profiles block found"),
        TYPE_INPUT_CARDS => println!("1212: Reading CORSIKA inputs"),
        TYPE_ARRAY_HEAD => println!("1213:   Start reading photon bunches (split data)"),
        TYPE_ARRAY_END => println!("1214:   Done reading photon bunches (split data)"),
        _ => {}
    }
}

fn main() -> Result<(), DynError> {
    let args = Args::parse();

    let binning = args::parse_bins(&args.bins)?;
    let table = match &args.atmtrans {
        Some(path) => Some(AtmosphericTable::from_file(path)?),
        None => None,
    };
    let mut projector = Projector::new(binning, args.detected, table, args.seed)?;

    let input: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(
            File::open(path)
                .map_err(|e| format!("Error opening input file {}: {e}", path.display()))?,
        ),
        None => Box::new(io::stdin().lock()),
    };
    let mut reader = EventIoReader::new(BufReader::with_capacity(args.bufsize, input), args.maxbuf);

    let mut store = OutputStore::create(&args.output)?;
    let mut state = StreamState::new();
    let opts = DispatchOptions::from_args(&args);

    dispatch(&mut reader, &mut state, &mut projector, &mut store, &opts)?;
    store.flush()?;
    Ok(())
}
