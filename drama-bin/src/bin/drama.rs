use std::{
    fs::File,
    io::{BufWriter, Write},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use drama_bin::init_logging_with_progress;
use drama_core::config::DiscoveryConfig;
use drama_core::memory::PhysAddr;
use drama_core::oracle::HardwareOracle;
use drama_core::util::spawn_cancelable;
use drama_core::{Drama, DiscoveryReport, acquire_pool};
use drama_hugepage::HugepageAllocator;
use log::{info, warn};
use serde::Serialize;

/// CLI arguments for the `drama` binary.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// The discovery config file.
    #[clap(long = "config", default_value = "crates/drama-core/config/drama.json")]
    config: String,
    /// Override the configured pool size in MB.
    #[clap(long = "pool-size")]
    pool_size_mb: Option<usize>,
    /// Override the configured measurement threads.
    #[clap(long = "threads")]
    threads: Option<usize>,
    /// Override the configured seed.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// The timeout in minutes for the entire discovery run.
    #[clap(long = "timeout")]
    timeout: Option<u64>,
    /// Output file for the report (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
    /// Decode these physical addresses with the recovered functions.
    #[clap(long = "decode", value_parser = parse_addr)]
    decode: Vec<PhysAddr>,
}

fn parse_addr(s: &str) -> Result<PhysAddr, std::num::ParseIntError> {
    let addr = match s.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16)?,
        None => s.parse()?,
    };
    Ok(PhysAddr::new(addr))
}

fn save_report(report: &DiscoveryReport, filename: &str) -> Result<()> {
    let file = File::create(filename)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)?;
    writer.flush()?;
    info!("Report saved to {}", filename);
    Ok(())
}

fn print_decoded(report: &DiscoveryReport, config: &DiscoveryConfig, addrs: &[PhysAddr]) {
    if addrs.is_empty() {
        return;
    }
    let (Some(row), Some(col)) = (config.row_bits, config.col_bits) else {
        warn!("Decoding requires row_bits and col_bits in the config");
        return;
    };
    for &addr in addrs {
        let dram = report.functions.decode(addr, row, col);
        info!("{:?} -> {:?}", addr, dram);
    }
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;

    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);

    let mut config = DiscoveryConfig::from_jsonfile(&args.config)
        .with_context(|| format!("loading {}", args.config))?;
    if let Some(pool_size_mb) = args.pool_size_mb {
        config.pool_size_mb = pool_size_mb;
    }
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if args.seed.is_some() {
        config.seed = args.seed;
    }
    config.validate()?;

    let timeout = args.timeout.map(|t| Duration::from_secs(t * 60));
    let start_time = Instant::now();

    let run_config = config.clone();
    let worker = spawn_cancelable(move |running| -> Result<DiscoveryReport, String> {
        let mut allocator = HugepageAllocator::default();
        let pool = acquire_pool(&mut allocator, &run_config).map_err(|e| e.to_string())?;
        let oracle = HardwareOracle::new(&pool).map_err(|e| e.to_string())?;
        let drama = Drama::builder()
            .pool(&pool)
            .oracle(&oracle)
            .config(run_config)
            .progress(progress)
            .build()
            .map_err(|e| e.to_string())?;
        drama
            .run_with_cancel(&running)
            .map_err(|e| e.to_string())
    });

    while !worker.is_finished() {
        if let Some(timeout) = timeout
            && start_time.elapsed() >= timeout
            && worker.is_running()
        {
            warn!("Timeout reached, stopping after the current batch");
            worker.cancel();
        }
        thread::sleep(Duration::from_millis(100));
    }
    let report = match worker.wait() {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => bail!("Discovery failed: {}", e),
        Err(_) => bail!("Discovery thread panicked"),
    };

    info!("=== DISCOVERY SUMMARY ===");
    info!("Threshold: {} cycles", report.threshold.cycles);
    info!("Functions:\n{}", report.functions);
    for failure in &report.failures {
        warn!("Group {} failed: {}", failure.dimension, failure.error);
    }
    info!("Observations: {}", report.observations);
    info!("Confirmed: {}", report.confirmed);
    info!(
        "Total discovery time: {:.2}s",
        start_time.elapsed().as_secs_f64()
    );

    print_decoded(&report, &config, &args.decode);

    if let Some(output_file) = &args.output {
        save_report(&report, output_file)?;
    }
    Ok(())
}
