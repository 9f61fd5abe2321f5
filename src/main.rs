//! iodriver CLI entry point

use anyhow::{Context, Result};
use iodriver::config::cli::Cli;
use iodriver::config::{toml, validator, Config};
use iodriver::driver::{Driver, DriverError, DriverOptions};
use iodriver::output::json::{write_json_output, JsonRunSummary};
use iodriver::output::text::print_summary;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.debug);
    cli.validate()?;

    println!("iodriver v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let config = toml::load_config(&cli)?;
    validator::validate_config(&config).context("Configuration validation failed")?;

    print_configuration(&config);

    if cli.dry_run {
        println!();
        println!("{}", toml::to_toml_string(&config)?);
        println!("Dry run mode - configuration validated successfully");
        return Ok(());
    }

    // build every workload before running any of them
    let barrier_timeout = config.run.barrier_timeout.duration();
    let workloads = config
        .workloads
        .iter()
        .enumerate()
        .map(|(i, workload)| {
            workload
                .build(barrier_timeout)
                .with_context(|| format!("Workload {} ({})", i, workload.kind()))
        })
        .collect::<Result<Vec<_>>>()?;

    let endpoint = config.endpoint.build();
    let driver = Driver::new(
        &endpoint,
        DriverOptions {
            report_interval: config.run.report_interval.map(|interval| interval.duration()),
            validate: config.run.validate,
        },
    );

    let mut documents = Vec::with_capacity(workloads.len());
    let mut failed = 0usize;

    for workload in &workloads {
        println!();
        println!("Running {}...", workload.name());
        println!();

        match driver.run(workload) {
            Ok(summary) => {
                print_summary(&summary);
                documents.push(JsonRunSummary::new(&summary));
            }
            Err(err) => {
                print_summary(err.summary());
                tracing::error!(error = %err, "run failed");
                if let DriverError::Execution { source, .. } = &err {
                    if source.involves_timeout() {
                        tracing::warn!(workload = workload.name(), "failure involves a timeout, the run may be worth retrying");
                    }
                }
                documents.push(JsonRunSummary::new(err.summary()).with_error(&err));
                failed += 1;
                if !config.run.keep_going {
                    break;
                }
            }
        }
    }

    if let Some(path) = &config.run.json_output {
        write_json_output(path, &documents, true)?;
        println!();
        println!("JSON summary written to {}", path.display());
    }

    if failed > 0 {
        anyhow::bail!("{} of {} workload(s) failed", failed, workloads.len());
    }
    Ok(())
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_configuration(config: &Config) {
    println!("Configuration:");
    println!("  Endpoint: {}", config.endpoint.name);
    if let Some(latency) = config.endpoint.latency {
        println!("    Latency: {}", latency);
    }
    println!("    Throttle enforced: {}", config.endpoint.enforce_throttle);

    println!("  Run:");
    println!("    Barrier timeout: {}", config.run.barrier_timeout);
    if let Some(interval) = config.run.report_interval {
        println!("    Report interval: {}", interval);
    }
    println!("    Validate: {}", config.run.validate);

    println!("  Workloads:");
    for workload in &config.workloads {
        println!("    {}", workload);
    }
}
