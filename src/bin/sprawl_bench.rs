use sprawl::config::HarnessConfig;
use sprawl::harness;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(?config, "starting harness");

    let mut consistent = true;
    for run in 0..config.runs {
        let comparison = harness::compare_queues(&config.queue)?;
        for report in [&comparison.ours, &comparison.reference] {
            info!(
                run,
                implementation = report.implementation,
                items = report.items,
                elapsed_ms = report.elapsed.as_secs_f64() * 1e3,
                ops_per_sec = report.throughput(),
                full_retries = report.full_retries,
                empty_retries = report.empty_retries,
                "queue run"
            );
            if !report.is_consistent() {
                error!(run, ?report, "queue run lost, duplicated or reordered items");
                consistent = false;
            }
        }

        let report = harness::run_multiaccess_workload(&config.multiaccess);
        info!(
            run,
            reads = report.reads,
            writes = report.writes,
            elapsed_ms = report.elapsed.as_secs_f64() * 1e3,
            ops_per_sec = report.throughput(),
            final_version = report.final_version,
            "multiaccess run"
        );
        if !report.is_consistent() {
            error!(run, ?report, "multiaccess run observed an inconsistent snapshot");
            consistent = false;
        }
    }

    if !consistent {
        std::process::exit(1);
    }
    Ok(())
}
