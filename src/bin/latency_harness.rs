//! Turn latency harness: simulated text sessions through the orchestrator.
//!
//! Usage: `buddy-latency-harness [sessions] [turns-per-session] [output.json]`

use buddy::host::latency::{BenchConfig, run_text_turn_bench, write_report};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let mut bench = BenchConfig::default();
    if let Some(sessions) = args.next() {
        bench.sessions = sessions.parse()?;
    }
    if let Some(turns) = args.next() {
        bench.turns_per_session = turns.parse()?;
    }
    let output = args.next();

    let report = run_text_turn_bench(bench)
        .await
        .map_err(|e| anyhow::anyhow!("latency harness failed: {e}"))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(output) = output {
        let path = std::path::Path::new(&output);
        write_report(&report, path).map_err(|e| anyhow::anyhow!("failed to save report: {e}"))?;
        eprintln!("saved latency report: {}", path.display());
    }
    Ok(())
}
