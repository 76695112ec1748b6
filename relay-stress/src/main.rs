use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use relay_stress::cli::StressCli;
use relay_stress::config::StressConfig;
use relay_stress::{generate, logging, metrics_server};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = StressCli::parse();

    let mut config = StressConfig::load(&cli.config).await?;
    if let Some(level) = cli.log_level {
        config.relay.general.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.relay.general.log_format = format;
    }
    config.validate()?;

    if cli.validate {
        println!("configuration '{}' is valid", cli.config.display());
        return Ok(ExitCode::SUCCESS);
    }

    logging::init_tracing(&config.relay.general)?;

    if config.relay.metrics.enabled {
        metrics_server::install_metrics_recorder(&config.relay.metrics)?;
    }

    let stop = CancellationToken::new();
    if let Some(secs) = cli.duration_secs {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            tracing::info!(duration_secs = secs, "stress duration elapsed");
            stop.cancel();
        });
    }
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                stop.cancel();
            }
        });
    }

    tracing::info!(
        config = %cli.config.display(),
        generators = config.generate.worker,
        output = %config.relay.output.kind,
        "relay-stress starting"
    );

    let report = generate::run(&config, stop).await?;

    tracing::info!(
        generated = report.generated,
        published = report.published,
        acked = report.acked,
        dropped = report.dropped,
        errors = report.errors.len(),
        "relay-stress finished"
    );
    println!(
        "generated={} published={} acked={} dropped={}",
        report.generated, report.published, report.acked, report.dropped
    );

    if report.is_success() {
        return Ok(ExitCode::SUCCESS);
    }
    for error in &report.errors {
        eprintln!("error: {error}");
    }
    Ok(ExitCode::FAILURE)
}
