//! playthru - Real-time audio playthrough
//!
//! Routes live audio from an input device to an output device. The two
//! devices run on independent clocks, so captured frames go through a
//! time-addressed ring buffer and a varispeed stage that follows the
//! measured drift between them.
//!
//! While running, `input NAME` or `output NAME` on stdin switches one side
//! of the pair. An empty line stops.

use std::io::BufRead;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use clap::Parser;

mod analysis;
mod audio;
mod settings;

use audio::{find_device, list_devices, PlaythroughHost};
use settings::PlaythroughSettings;

/// How often the control loop checks for device events
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A line typed while the playthrough runs
#[derive(Debug, PartialEq)]
enum Command {
    Quit,
    Input(String),
    Output(String),
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() || line == "quit" {
            return Command::Quit;
        }
        match line.split_once(char::is_whitespace) {
            Some(("input", name)) => Command::Input(name.trim().to_string()),
            Some(("output", name)) => Command::Output(name.trim().to_string()),
            _ => Command::Unknown(line.to_string()),
        }
    }
}

#[derive(Parser)]
#[command(name = "playthru")]
#[command(about = "Play audio from an input device through an output device")]
struct Args {
    /// List input and output devices and exit
    #[arg(short, long)]
    list: bool,

    /// Input device name (defaults to the saved or system default device)
    #[arg(short, long)]
    input: Option<String>,

    /// Output device name (defaults to the saved or system default device)
    #[arg(short, long)]
    output: Option<String>,

    /// Buffer size to request from both devices, in frames
    #[arg(short, long)]
    buffer_frames: Option<u32>,

    /// Stop after this many seconds instead of waiting for Enter
    #[arg(short, long)]
    duration: Option<f64>,

    /// Disable the spectrum analysis path
    #[arg(long)]
    no_analysis: bool,

    /// Save the resulting settings as the new defaults
    #[arg(long)]
    save: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Starting playthru");

    let args = Args::parse();

    if args.list {
        return match print_devices() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                log::error!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    let mut settings = PlaythroughSettings::load();
    apply_args(&mut settings, &args);
    if args.save {
        settings.save();
    }

    match run(&settings, args.duration) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn apply_args(settings: &mut PlaythroughSettings, args: &Args) {
    if let Some(input) = &args.input {
        settings.input_device = Some(input.clone());
    }
    if let Some(output) = &args.output {
        settings.output_device = Some(output.clone());
    }
    if let Some(frames) = args.buffer_frames {
        settings.buffer_size_frames = frames;
    }
    if args.no_analysis {
        settings.analysis_enabled = false;
    }
}

fn print_devices() -> Result<(), audio::DeviceError> {
    for (label, is_input) in [("Input", true), ("Output", false)] {
        println!("{} devices:", label);
        for device in list_devices(is_input)? {
            println!(
                "  {} ({} ch, {} Hz, {:?})",
                device.name(),
                device.channel_count(),
                device.sample_rate(),
                device.sample_format()
            );
        }
    }
    Ok(())
}

fn run(settings: &PlaythroughSettings, duration: Option<f64>) -> Result<(), Box<dyn std::error::Error>> {
    let input = find_device(settings.input_device.as_deref(), true)?;
    let output = find_device(settings.output_device.as_deref(), false)?;
    log::info!("Input device: {:?}", input);
    log::info!("Output device: {:?}", output);

    let mut host = PlaythroughHost::new(input, output, settings.to_config())?;
    host.start()?;
    log_session(&host);

    let (command_tx, command_rx) = mpsc::channel();
    if duration.is_none() {
        println!("Press Enter to stop, or type 'input NAME' / 'output NAME' to switch devices");
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                let command = Command::parse(&line);
                let quit = command == Command::Quit;
                if command_tx.send(command).is_err() || quit {
                    return;
                }
            }
            let _ = command_tx.send(Command::Quit);
        });
    }

    let started = Instant::now();
    let deadline = duration.map(|secs| started + Duration::from_secs_f64(secs.max(0.0)));
    let stats_interval = Duration::from_secs_f64(settings.stats_interval_secs.max(0.1));
    let mut next_report = started + stats_interval;

    loop {
        match command_rx.recv_timeout(POLL_INTERVAL) {
            Ok(Command::Quit) => break,
            Ok(command) => handle_command(&mut host, command),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }

        if let Some(reason) = host.poll()? {
            log::info!("Playthrough rebuilt after {:?}", reason);
            log_session(&host);
        }

        if Instant::now() >= next_report {
            next_report += stats_interval;
            report(&mut host);
        }
    }

    host.stop()?;
    report(&mut host);
    Ok(())
}

/// Switch one side of the device pair, keeping the other
fn handle_command(host: &mut PlaythroughHost, command: Command) {
    let (input_name, output_name) = match &command {
        Command::Input(name) => (name.as_str(), host.output().name()),
        Command::Output(name) => (host.input().name(), name.as_str()),
        Command::Unknown(line) => {
            log::warn!("Unknown command '{}'", line);
            return;
        }
        Command::Quit => return,
    };

    let devices = find_device(Some(input_name), true)
        .and_then(|input| find_device(Some(output_name), false).map(|output| (input, output)));
    let (input, output) = match devices {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("{}", e);
            return;
        }
    };

    log::info!("Switching to '{}' -> '{}'", input.name(), output.name());
    match host.set_devices(input, output) {
        Ok(()) => log_session(host),
        Err(e) => log::error!("Could not switch devices: {}", e),
    }
}

fn log_session(host: &PlaythroughHost) {
    let Some(session) = host.session() else {
        return;
    };
    log::info!(
        "Playthrough '{}' -> '{}': {} channels, ring {} frames, thru offset {} frames",
        session.input_name(),
        session.output_name(),
        session.channel_count(),
        session.ring_capacity_frames(),
        session.thru_offset()
    );
}

fn report(host: &mut PlaythroughHost) {
    let Some(session) = host.session_mut() else {
        return;
    };

    let stats = session.stats();
    log::info!(
        "in {} / out {} callbacks, offset {:.0} frames, {} resyncs, {} dropped, {} overloads, {} clock misses",
        stats.input_callbacks,
        stats.output_callbacks,
        session.offset(),
        stats.resyncs,
        stats.dropped_writes,
        stats.overloads,
        stats.clock_misses
    );

    if let Some((freq, db)) = session.spectrum().and_then(|s| s.dominant_frequency()) {
        log::info!("Dominant frequency: {:.1} Hz at {:.1} dB", freq, db);
    }
}
