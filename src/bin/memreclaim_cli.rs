use clap::{Parser, Subcommand};
use memreclaim::logging::{self, LogFormat, LogLevel, LoggingConfig};
use memreclaim::{BackendStatus, ReclaimConfig, ReclaimReport, Reclaimer, StepStatus};

#[derive(Parser, Debug)]
#[command(name = "memreclaim-cli", version)]
#[command(about = "Release cached GPU memory and trim the host heap", long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace); overrides MEMRECLAIM_LOG_LEVEL
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (human or json); overrides MEMRECLAIM_LOG_FORMAT
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// HIP runtime library to try instead of the defaults (repeatable)
    #[arg(long = "hip-lib", global = true)]
    hip_libs: Vec<String>,

    /// CUDA runtime library to try instead of the defaults (repeatable)
    #[arg(long = "cuda-lib", global = true)]
    cuda_libs: Vec<String>,

    /// Bytes of free heap to keep when trimming
    #[arg(long, global = true, default_value_t = 0)]
    trim_pad: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one reclaim pass and print what it did
    Run {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show detected runtimes and devices without reclaiming anything
    Probe {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let reclaimer = Reclaimer::probe(&reclaim_config(&cli));
    match cli.command {
        Commands::Run { json } => {
            let report = reclaimer.run();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Probe { json } => {
            let status = reclaimer.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
    }
    Ok(())
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let mut config = LoggingConfig::from_env();
    if let Some(level) = &cli.log_level {
        config.level = LogLevel::parse(level)
            .ok_or_else(|| anyhow::anyhow!("invalid log level: {}", level))?;
    }
    if let Some(format) = &cli.log_format {
        config.format = LogFormat::parse(format)
            .ok_or_else(|| anyhow::anyhow!("invalid log format: {}", format))?;
    }
    if let Err(e) = logging::init_with_config(&config) {
        eprintln!("WARN: logging disabled: {}", e);
    }
    Ok(())
}

fn reclaim_config(cli: &Cli) -> ReclaimConfig {
    let mut config = ReclaimConfig::new().with_trim_pad(cli.trim_pad);
    if !cli.hip_libs.is_empty() {
        config = config.with_hip_libraries(cli.hip_libs.iter().cloned());
    }
    if !cli.cuda_libs.is_empty() {
        config = config.with_cuda_libraries(cli.cuda_libs.iter().cloned());
    }
    config
}

fn status_label(status: &StepStatus) -> String {
    match status {
        StepStatus::Skipped => "skipped (runtime not installed)".to_string(),
        StepStatus::Completed => "completed".to_string(),
        StepStatus::Failed { reason } => format!("failed: {}", reason),
    }
}

fn print_report(report: &ReclaimReport) {
    let cache = &report.device_cache;
    println!("Device cache:      {}", status_label(&cache.status));
    if cache.cache_emptied {
        println!("  cache emptied");
    }
    if cache.unified_memory_reclaimed {
        println!("  unified-memory device: host reclamation substituted");
    }

    let stats = &report.device_stats;
    println!("Device statistics: {}", status_label(&stats.status));
    if !stats.devices_reset.is_empty() {
        println!("  reset: {}", stats.devices_reset.join(", "));
    }
    if !stats.devices_failed.is_empty() {
        println!("  failed: {}", stats.devices_failed.join(", "));
    }

    println!(
        "Host reclamation:  {}{}",
        status_label(&report.host.status),
        if report.host.released { " (memory released)" } else { "" }
    );
}

fn print_status(status: &BackendStatus) {
    let cache = &status.device_cache;
    println!(
        "Device cache runtime:      {} ({})",
        cache.backend.as_deref().unwrap_or("-"),
        cache.probe
    );
    if let Some(library) = &cache.library {
        println!("  library:               {}", library);
    }
    if let Some(gpu) = cache.gpu_available {
        println!("  GPU device:            {}", gpu);
    }
    if let Some(unified) = cache.unified_memory_available {
        println!("  unified-memory device: {}", unified);
    }
    if let Some(error) = &cache.error {
        println!("  error: {}", error);
    }

    let stats = &status.device_stats;
    println!(
        "Device statistics runtime: {} ({})",
        stats.backend.as_deref().unwrap_or("-"),
        stats.probe
    );
    if let Some(library) = &stats.library {
        println!("  library: {}", library);
    }
    for device in &stats.devices {
        println!("  {}", device);
    }
    if let Some(error) = &stats.error {
        println!("  error: {}", error);
    }

    println!("Host reclaimer:            {}", status.host);
}

#[cfg(test)]
mod tests {
    use super::*;
    use memreclaim::config::{DEFAULT_CUDA_LIBRARIES, DEFAULT_HIP_LIBRARIES};

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("memreclaim-cli").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_reclaim_config_keeps_defaults_without_overrides() {
        let config = reclaim_config(&parse(&["run"]));
        assert_eq!(config.hip_libraries, DEFAULT_HIP_LIBRARIES);
        assert_eq!(config.cuda_libraries, DEFAULT_CUDA_LIBRARIES);
        assert_eq!(config.trim_pad, 0);
    }

    #[test]
    fn test_reclaim_config_applies_library_overrides() {
        let cli = parse(&[
            "--hip-lib",
            "/opt/rocm/lib/libamdhip64.so",
            "--hip-lib",
            "libamdhip64.so.7",
            "--trim-pad",
            "4096",
            "probe",
            "--json",
        ]);
        let config = reclaim_config(&cli);

        assert_eq!(
            config.hip_libraries,
            vec!["/opt/rocm/lib/libamdhip64.so", "libamdhip64.so.7"]
        );
        // Only the overridden runtime changes
        assert_eq!(config.cuda_libraries, DEFAULT_CUDA_LIBRARIES);
        assert_eq!(config.trim_pad, 4096);
        assert!(matches!(cli.command, Commands::Probe { json: true }));
    }

    #[test]
    fn test_global_options_accepted_after_subcommand() {
        let cli = parse(&["run", "--cuda-lib", "libcudart.so.13"]);
        let config = reclaim_config(&cli);

        assert_eq!(config.cuda_libraries, vec!["libcudart.so.13"]);
        assert_eq!(config.hip_libraries, DEFAULT_HIP_LIBRARIES);
        assert!(matches!(cli.command, Commands::Run { json: false }));
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(Cli::try_parse_from(["memreclaim-cli"]).is_err());
    }

    #[test]
    fn test_status_label() {
        assert_eq!(
            status_label(&StepStatus::Skipped),
            "skipped (runtime not installed)"
        );
        assert_eq!(status_label(&StepStatus::Completed), "completed");
        assert_eq!(
            status_label(&StepStatus::Failed {
                reason: "hipInit failed with code 3: stub".to_string()
            }),
            "failed: hipInit failed with code 3: stub"
        );
    }
}
