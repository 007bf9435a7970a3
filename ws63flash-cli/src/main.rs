//! ws63flash CLI - flash FWPKG firmware onto WS63-class chips.
//!
//! Environment variables:
//!   WS63FLASH_PORT   - Default serial port
//!   WS63FLASH_BAUD   - Default baud rate (default: 921600)

use anyhow::{bail, Context, Result};
use clap::Parser;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use std::path::PathBuf;
use ws63flash::{Fwpkg, ImageKind, Ws63Flasher};

/// Baud rates known to work with the WS63 boot ROM. Other values are
/// accepted with a warning.
const RECOMMENDED_BAUDS: &[u32] = &[
    115_200, 230_400, 460_800, 500_000, 576_000, 921_600, 1_000_000, 1_152_000, 1_500_000,
    2_000_000,
];

/// Flash a FWPKG firmware package onto a WS63-class chip over UART.
#[derive(Parser)]
#[command(name = "ws63flash")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the FWPKG firmware file.
    firmware: PathBuf,

    /// Serial port to use (e.g., /dev/ttyUSB0 or COM3).
    #[arg(short, long, env = "WS63FLASH_PORT")]
    port: Option<String>,

    /// Target baud rate for data transfer.
    #[arg(
        short = 'b',
        long = "baudrate",
        default_value = "921600",
        env = "WS63FLASH_BAUD"
    )]
    baudrate: u32,

    /// Print the package contents and exit without flashing.
    #[arg(short, long)]
    show: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!("ws63flash v{}", env!("CARGO_PKG_VERSION"));

    let fwpkg = Fwpkg::from_file(&cli.firmware)
        .with_context(|| format!("Failed to load {}", cli.firmware.display()))?;

    if cli.show {
        show_package(&fwpkg);
        return Ok(());
    }

    let Some(port) = cli.port.as_deref() else {
        bail!("No serial port given (use --port or WS63FLASH_PORT)");
    };

    if !RECOMMENDED_BAUDS.contains(&cli.baudrate) {
        warn!(
            "Baud rate {} is not in the recommended set {RECOMMENDED_BAUDS:?}",
            cli.baudrate
        );
    }

    flash(&fwpkg, port, cli.baudrate)
}

/// Flash the package and reset the device.
fn flash(fwpkg: &Fwpkg, port: &str, baudrate: u32) -> Result<()> {
    eprintln!(
        "{} Using port {} at {} baud",
        style("→").cyan(),
        style(port).green(),
        baudrate
    );
    eprintln!(
        "{} Waiting for device (reset it into download mode)...",
        style("⏳").yellow()
    );

    let mut flasher =
        Ws63Flasher::open(port, baudrate).with_context(|| format!("Failed to open {port}"))?;

    let pb = progress_bar();
    let mut current_image = String::new();

    let result = flasher.run(fwpkg, |name: &str, current: usize, total: usize| {
        if name != current_image {
            current_image = name.to_string();
            pb.set_message(name.to_string());
        }
        if total > 0 {
            pb.set_position((current * 100 / total) as u64);
        }
    });
    result.context("Flashing failed")?;

    pb.finish_with_message("done");
    eprintln!("\n{} Flashing completed", style("✓").green().bold());
    Ok(())
}

fn progress_bar() -> ProgressBar {
    if console::Term::stderr().is_term() {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    } else {
        ProgressBar::hidden()
    }
}

fn kind_label(kind: ImageKind) -> String {
    match kind {
        ImageKind::Loader => style("LoaderBoot").yellow().to_string(),
        ImageKind::App => "App".to_string(),
        ImageKind::Other(v) => format!("Other({v})"),
    }
}

/// Print the package contents (`--show`).
fn show_package(fwpkg: &Fwpkg) {
    println!("{}", style("Firmware package").bold().underlined());
    println!("  Entries:    {}", fwpkg.entry_count());
    println!("  Total size: {} bytes", fwpkg.header.length);
    println!("  CRC:        0x{:04X}", fwpkg.header.crc);

    println!("\n{}", style("Entries").bold().underlined());
    for (i, bin) in fwpkg.bins.iter().enumerate() {
        println!("\n  [{:2}] {}", i, style(&bin.name).cyan().bold());
        println!("       Kind:      {}", kind_label(bin.kind));
        println!("       Offset:    0x{:08X}", bin.offset);
        println!("       Length:    {} bytes", bin.length);
        println!("       Burn addr: 0x{:08X}", bin.burn_addr);
        println!("       Burn size: {} bytes", bin.burn_size);
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_minimal() {
        let cli = Cli::try_parse_from(["ws63flash", "firmware.fwpkg"]).unwrap();
        assert_eq!(cli.firmware.to_str().unwrap(), "firmware.fwpkg");
        assert_eq!(cli.baudrate, 921_600);
        assert!(cli.port.is_none());
        assert!(!cli.show);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_parse_all_options() {
        let cli = Cli::try_parse_from([
            "ws63flash",
            "-p",
            "/dev/ttyUSB0",
            "-b",
            "460800",
            "-s",
            "-vv",
            "fw.fwpkg",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baudrate, 460_800);
        assert!(cli.show);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_parse_long_options() {
        let cli = Cli::try_parse_from([
            "ws63flash",
            "--port",
            "COM3",
            "--baudrate",
            "1000000",
            "--show",
            "fw.fwpkg",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("COM3"));
        assert_eq!(cli.baudrate, 1_000_000);
        assert!(cli.show);
    }

    #[test]
    fn test_cli_requires_firmware() {
        assert!(Cli::try_parse_from(["ws63flash"]).is_err());
    }

    #[test]
    fn test_cli_rejects_non_numeric_baud() {
        assert!(Cli::try_parse_from(["ws63flash", "-b", "fast", "fw.fwpkg"]).is_err());
    }

    #[test]
    fn test_recommended_bauds_contain_defaults() {
        assert!(RECOMMENDED_BAUDS.contains(&115_200));
        assert!(RECOMMENDED_BAUDS.contains(&921_600));
        assert!(!RECOMMENDED_BAUDS.contains(&12_345));
    }
}
