use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use peeler_core::oep::Oep;
use peeler_core::profile::ProtectorVersion;
use peeler_core::{UnpackConfig, UnpackConfigBuilder, UnpackReport, Unpacker};
use peeler_utils::{error, info, init_logging_with_level, warn, LogFormat, LogLevel, LoggingConfig};

/// Dynamic unpacker for Themida/WinLicense 2.x and 3.x protected executables.
#[derive(Parser, Debug)]
#[command(name = "peeler")]
#[command(version)]
#[command(about = "Dynamic unpacker for Themida/WinLicense 2.x and 3.x protected executables", long_about = None)]
struct Cli
{
    /// Protected EXE or DLL
    target: PathBuf,
    /// Arguments passed to the target (for DLLs: the export rundll32 calls)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
    /// Debug-level logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
    /// Wait for Enter at the OEP before the process is terminated
    #[arg(long, default_value_t = false)]
    pause_on_oep: bool,
    /// Keep the OEP-time import table instead of rebuilding it
    #[arg(long, default_value_t = false)]
    no_imports: bool,
    /// Use this OEP RVA instead of the heuristics (hex with 0x, or decimal)
    #[arg(long, value_parser = parse_rva)]
    force_oep: Option<u32>,
    /// Protector generation: 2, 3 or generic (default: probe the file)
    #[arg(long)]
    target_version: Option<ProtectorVersion>,
    /// Seconds to wait for the OEP (default: per profile)
    #[arg(long)]
    timeout: Option<u64>,
    /// Output path (default: unpacked_<name> next to the target)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main()
{
    let cli = Cli::parse();

    let format = match LoggingConfig::from_env() {
        Ok(config) => config.format,
        Err(e) => {
            eprintln!("{e}; falling back to pretty output");
            LogFormat::Pretty
        }
    };
    let _guard = match init_logging_with_level(LogLevel::from_verbose(cli.verbose), format) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        error!("{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>>
{
    let config = build_config(cli)?;
    info!("Unpacking {}", config.target.display());

    let pause = config.pause_on_oep;
    let mut unpacker = Unpacker::new(config);
    if pause {
        unpacker = unpacker.with_oep_hook(wait_for_enter);
    }
    let report = unpacker.run()?;
    print_report(&report, unpacker.config());
    Ok(())
}

fn build_config(cli: Cli) -> peeler_core::Result<UnpackConfig>
{
    let mut builder = UnpackConfigBuilder::new(cli.target)
        .with_args(cli.args)
        .skip_imports(cli.no_imports)
        .pause_on_oep(cli.pause_on_oep);
    if let Some(version) = cli.target_version {
        builder = builder.with_version(version);
    }
    if let Some(rva) = cli.force_oep {
        builder = builder.with_forced_oep(rva);
    }
    if let Some(seconds) = cli.timeout {
        builder = builder.with_timeout(Duration::from_secs(seconds));
    }
    if let Some(output) = cli.output {
        builder = builder.with_output(output);
    }
    builder.build()
}

fn wait_for_enter(oep: &Oep)
{
    println!(
        "Paused at OEP {} (RVA 0x{:x}, thread {}). Press Enter to continue...",
        oep.address,
        oep.rva,
        oep.thread.raw()
    );
    let _ = io::stdout().flush();
    let mut line = String::new();
    if let Err(e) = io::stdin().lock().read_line(&mut line) {
        warn!("Could not read from stdin: {e}");
    }
}

fn print_report(report: &UnpackReport, config: &UnpackConfig)
{
    info!(
        "Profile {} {} ({:?}){}",
        report.profile.version,
        report.profile.architecture,
        report.profile.kind,
        if report.profile.low_confidence { ", low confidence" } else { "" }
    );
    info!("OEP {} (RVA 0x{:x})", report.oep.address, report.oep.rva);
    info!(
        "Imports: {} resolved, {} unresolved, {} descriptors",
        report.imports.resolved().count(),
        report.imports.unresolved().count(),
        report.image.imports.len()
    );
    for entry in report.imports.unresolved() {
        warn!(
            "Unresolved thunk at {}: {}",
            entry.thunk,
            entry.reason.as_deref().unwrap_or("no diagnostic")
        );
    }
    if report.has_warnings() {
        warn!("Finished with warnings; review the output before relying on it");
    }
    println!("{}", config.output.display());
}

fn parse_rva(value: &str) -> Result<u32, String>
{
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid RVA '{value}': {e}"))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_parse_rva()
    {
        assert_eq!(parse_rva("0x1234"), Ok(0x1234));
        assert_eq!(parse_rva("4096"), Ok(4096));
        assert!(parse_rva("0xZZ").is_err());
    }

    #[test]
    fn test_flags_map_to_config()
    {
        let cli = Cli::parse_from([
            "peeler",
            "--no-imports",
            "--force-oep",
            "0x1000",
            "--target-version",
            "3",
            "--timeout",
            "20",
            "app.exe",
        ]);
        let config = build_config(cli).unwrap();
        assert!(config.skip_imports);
        assert_eq!(config.forced_oep, Some(0x1000));
        assert_eq!(config.forced_version, Some(ProtectorVersion::V3));
        assert_eq!(config.timeout, Some(Duration::from_secs(20)));
        assert!(config.output.ends_with("unpacked_app.exe"));
    }

    #[test]
    fn test_zero_timeout_is_rejected()
    {
        let cli = Cli::parse_from(["peeler", "--timeout", "0", "app.exe"]);
        assert!(build_config(cli).is_err());
    }
}
