use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use nexus_telemetry::cli::{format_dashboard_line, Args, Command};
use nexus_telemetry::config::PipelineConfig;
use nexus_telemetry::pipeline::Pipeline;
use nexus_telemetry::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(tenant) = &args.tenant {
        cfg.default_tenant = tenant.clone();
    }

    let pipeline = Arc::new(Pipeline::from_config(&cfg));

    match args.command {
        Command::Serve { port } => {
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            eprintln!(
                "{}",
                format!("  Nexus telemetry running at http://localhost:{}", port).bright_green()
            );
            eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());

            let handle = pipeline.start();
            let server = tokio::spawn(server::serve(
                listener,
                pipeline.clone(),
                handle.shutdown_signal(),
            ));

            tokio::signal::ctrl_c().await?;
            handle.shutdown().await;
            server.await??;
        }
        Command::Monitor { interval_ms, ticks } => {
            let handle = pipeline.start();
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            let mut printed = 0u32;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let snap = pipeline.snapshot(pipeline.default_tenant(), 0);
                        println!("{}", format_dashboard_line(&snap));
                        printed += 1;
                        if ticks.is_some_and(|t| printed >= t) {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            handle.shutdown().await;
        }
        Command::Simulate { bursts } => {
            let report = pipeline.simulate_load(bursts);
            pipeline.sample_now();
            eprintln!(
                "{}",
                format!(
                    "  accepted {}  dropped {}  spans {}",
                    report.accepted, report.dropped, report.spans
                )
                .bright_cyan()
            );
            let snap = pipeline.snapshot(pipeline.default_tenant(), 5);
            println!("{}", serde_json::to_string_pretty(&snap)?);
        }
    }

    Ok(())
}
