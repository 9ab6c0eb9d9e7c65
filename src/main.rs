//! qr-cam-scan: generate QR codes and scan them from images or a camera.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use qr_cam_scan::device::device_available;
use qr_cam_scan::imageio::{load_frame_from_path, save_png};
use qr_cam_scan::logging::init_logging;
use qr_cam_scan::signal::{install_handler, EXIT_CODE_INTERRUPTED};
use qr_cam_scan::{
    decode, encode, parse_size, DecodeOutcome, EcLevel, ScanConfig, ScanSession, SessionObserver,
    SessionState, StatusEvent,
};

/// Exit code when an image holds no readable code.
const EXIT_CODE_NOT_FOUND: u8 = 2;

const NO_CODE_IN_IMAGE: &str = "No QR code found in image.";

#[derive(Debug, Parser)]
#[command(name = "qr-cam-scan", version, about)]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// TOML configuration for camera scanning
    #[arg(long, global = true, env = "QR_CAM_SCAN_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Render text as a QR code PNG
    Encode {
        /// Text to encode
        text: String,

        /// Image side in pixels, clamped to 80..=2000
        #[arg(short, long, default_value = "300")]
        size: String,

        /// Error correction level
        #[arg(short, long, value_enum, default_value_t = Level::M)]
        level: Level,

        /// Output file
        #[arg(short, long, default_value = "qrcode.png")]
        output: PathBuf,
    },
    /// Read a QR code from a PNG, JPEG or BMP image
    Decode {
        /// Image file
        image: PathBuf,
    },
    /// Scan continuously from a V4L2 camera until Ctrl+C
    Scan {
        /// Device index (/dev/videoN); overrides the config file
        #[arg(short, long)]
        device: Option<u32>,

        /// Stop after the first decoded code
        #[arg(long)]
        once: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Level {
    L,
    M,
    Q,
    H,
}

impl From<Level> for EcLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::L => Self::L,
            Level::M => Self::M,
            Level::Q => Self::Q,
            Level::H => Self::H,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Encode {
            text,
            size,
            level,
            output,
        } => run_encode(&text, &size, level, &output),
        Command::Decode { image } => run_decode(&image),
        Command::Scan { device, once } => run_scan(cli.config, device, once),
    }
}

fn run_encode(text: &str, size: &str, level: Level, output: &Path) -> anyhow::Result<ExitCode> {
    let side = parse_size(size);
    let grid = encode(text, side, side, level.into())?;
    save_png(&grid, output).with_context(|| format!("writing {}", output.display()))?;
    log::info!("Saved {side}x{side} QR code to {}", output.display());
    Ok(ExitCode::SUCCESS)
}

fn run_decode(image: &Path) -> anyhow::Result<ExitCode> {
    let frame =
        load_frame_from_path(image).with_context(|| format!("reading {}", image.display()))?;
    match decode(&frame) {
        DecodeOutcome::Decoded(text) if !text.trim().is_empty() => {
            println!("{text}");
            Ok(ExitCode::SUCCESS)
        }
        outcome => {
            log::debug!("decode outcome: {outcome:?}");
            eprintln!("{NO_CODE_IN_IMAGE}");
            Ok(ExitCode::from(EXIT_CODE_NOT_FOUND))
        }
    }
}

/// Prints results to stdout and routes status through the logger.
struct CliObserver {
    first_result: Option<Sender<()>>,
}

impl SessionObserver for CliObserver {
    fn on_result(&mut self, text: &str) {
        println!("{text}");
        if let Some(tx) = self.first_result.take() {
            let _ = tx.send(());
        }
    }

    fn on_status(&mut self, status: &StatusEvent) {
        if status.is_error {
            log::error!("{}", status.message);
        } else {
            log::info!("{}", status.message);
        }
    }
}

fn run_scan(config: Option<PathBuf>, device: Option<u32>, once: bool) -> anyhow::Result<ExitCode> {
    let mut config = ScanConfig::load_or_default(config.as_ref())?;
    if let Some(device) = device {
        config.device = device;
    }
    let source = config.frame_source()?;
    let index = config.device;

    let shutdown = install_handler()?;
    let session = ScanSession::with_timing(qr_cam_scan::RqrrEngine, config.scan_timing())
        .with_exclusive(config.exclusive);

    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let observer = CliObserver {
        first_result: once.then(|| result_tx.clone()),
    };

    if let Err(err) = session.start(move || device_available(index).then_some(source), observer) {
        // The observer already reported it.
        log::debug!("scan did not start: {err}");
        return Ok(ExitCode::FAILURE);
    }

    let code = wait_for_end(&session, &result_rx, || shutdown.is_shutdown_requested());
    session.stop();
    Ok(code)
}

fn wait_for_end<F: Fn() -> bool>(
    session: &ScanSession,
    first_result: &Receiver<()>,
    interrupted: F,
) -> ExitCode {
    loop {
        if interrupted() {
            return ExitCode::from(EXIT_CODE_INTERRUPTED);
        }
        match first_result.recv_timeout(Duration::from_millis(100)) {
            Ok(()) => return ExitCode::SUCCESS,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return ExitCode::FAILURE,
        }
        match session.state() {
            SessionState::Failed => return ExitCode::FAILURE,
            SessionState::Stopped => return ExitCode::SUCCESS,
            _ => {}
        }
    }
}
