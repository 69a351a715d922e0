use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, Command};
use fieldburn::config::{PipelineConfig, app_name, version};
use fieldburn::device::{DefaultDevice, TransferMode, VideoFormat};
use fieldburn::pipeline::Pipeline;
use fieldburn::utils::sos::SignalOfStop;
use log::{error, info};
use std::time::Duration;
use std::{panic, process};

fn input_format(name: &str) -> Result<VideoFormat> {
    Ok(match name.to_lowercase().as_str() {
        "ntsc" | "525i2997" => VideoFormat::ntsc(),
        "pal" | "625i25" => VideoFormat::pal(),
        "1080i50" => VideoFormat::hd1080i50(),
        "1080i5994" => VideoFormat::hd1080i5994(),
        "720p5994" => VideoFormat::hd720p5994(),
        other => bail!("Unknown input format '{}'", other),
    })
}

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON pipeline configuration."),
        )
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("INDEX")
                .value_parser(clap::value_parser!(u32))
                .help("Device index, overrides the configuration."),
        )
        .arg(
            Arg::new("input-format")
                .short('i')
                .long("input-format")
                .value_name("FORMAT")
                .default_value("ntsc")
                .help("Signal fed to the simulated input (ntsc, pal, 1080i50, 1080i5994, 720p5994)."),
        )
        .arg(
            Arg::new("seconds")
                .short('s')
                .long("seconds")
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help("Stop after this many seconds instead of waiting for Ctrl-C."),
        )
        .arg(
            Arg::new("field")
                .long("field")
                .action(ArgAction::SetTrue)
                .conflicts_with_all(["frame", "split-fields"])
                .help("Circulate single fields, one transfer per field (default)."),
        )
        .arg(
            Arg::new("split-fields")
                .long("split-fields")
                .action(ArgAction::SetTrue)
                .conflicts_with("frame")
                .help("Circulate frames, transferring each field separately."),
        )
        .arg(
            Arg::new("frame")
                .long("frame")
                .action(ArgAction::SetTrue)
                .help("Transfer whole frames."),
        )
        .arg(
            Arg::new("no-audio")
                .long("no-audio")
                .action(ArgAction::SetTrue)
                .help("Do not transfer audio."),
        )
        .arg(
            Arg::new("no-anc")
                .long("no-anc")
                .action(ArgAction::SetTrue)
                .help("Do not transfer ancillary data."),
        )
        .arg(
            Arg::new("burn-line")
                .long("burn-line")
                .value_name("LINE")
                .value_parser(clap::value_parser!(usize))
                .help("Stamp the frame timecode into this line of each field."),
        )
        .get_matches();

    // kill the main thread as soon as a secondary thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => match PipelineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{:#}", e);
                process::exit(2);
            }
        },
        None => PipelineConfig::default(),
    };
    if let Some(index) = matches.get_one::<u32>("device") {
        config.device_index = *index;
    }
    if matches.get_flag("field") {
        config.transfer_mode = TransferMode::Fields;
    }
    if matches.get_flag("split-fields") {
        config.transfer_mode = TransferMode::SplitFields;
    }
    if matches.get_flag("frame") {
        config.transfer_mode = TransferMode::Frame;
    }
    if matches.get_flag("no-audio") {
        config.with_audio = false;
    }
    if matches.get_flag("no-anc") {
        config.with_anc = false;
    }
    if let Some(line) = matches.get_one::<usize>("burn-line") {
        config.burn_line = Some(*line);
    }

    let format = matches
        .get_one::<String>("input-format")
        .map_or(Ok(VideoFormat::ntsc()), |name| input_format(name));
    let seconds = matches.get_one::<u64>("seconds").copied();

    let result = format.and_then(|format| run(config, format, seconds));
    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn run(config: PipelineConfig, format: VideoFormat, seconds: Option<u64>) -> Result<()> {
    // One pulse per buffer the board circulates
    let pulse = format.rate.frame_period() / config.transfer_mode.pulses_per_frame();
    let mut pipeline = Pipeline::<DefaultDevice>::open(config)?;
    pipeline.device().set_input_format(Some(format));

    let clock_sos = SignalOfStop::new();
    let clock = DefaultDevice::spawn_clock(pipeline.device(), pulse, clock_sos.clone())
    .context("Failed to start device clock")?;

    // stop gracefully on SIGINT, SIGTERM, or SIGHUP
    let sos = pipeline.stop_signal();
    let handler_sos = sos.clone();
    ctrlc::set_handler(move || handler_sos.cancel()).context("Error setting Ctrl-C handler")?;

    let outcome = pipeline.init().and_then(|()| pipeline.run());
    if outcome.is_ok() {
        match seconds {
            Some(seconds) => {
                sos.wait_timeout(Duration::from_secs(seconds));
            }
            None => sos.wait_cancellation(),
        }
        info!("Stopping, {}", pipeline.status());
    }
    let outcome = outcome.and(pipeline.quit());

    clock_sos.cancel();
    if clock.join().is_err() {
        error!("Device clock panicked");
    }
    outcome
}
