//! Headless master over TCP

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use loadhive_core::stats::ReportFrame;
use loadhive_core::{Environment, RunState, Runner, StatsReporter, TcpAcceptor};
use loadhive_report::{CsvStatsWriter, JsonExporter};

use super::MasterArgs;

const FRAME_BUFFER: usize = 16;

/// Wait for workers, run until the run stops or Ctrl+C, then quit
pub async fn run_master(args: MasterArgs) -> Result<()> {
    let config = args.run_config()?;
    let report_interval = config.stats.report_interval();
    let env = Environment::builder().config(config).build()?;

    let acceptor = TcpAcceptor::bind(args.bind.as_str())
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    let master = env.master_runner(Box::new(acceptor)).await?;
    tracing::info!(
        addr = master.local_addr(),
        expect_workers = args.expect_workers,
        "Waiting for workers"
    );

    tokio::select! {
        joined = master.wait_for_workers(
            args.expect_workers,
            Duration::from_secs(args.worker_timeout),
        ) => joined?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted before the run started");
            master.quit().await?;
            return Ok(());
        }
    }

    master.start(args.users, args.spawn_rate).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_BUFFER);
    let reporter = StatsReporter::new(env.stats(), Arc::new(master.clone()), report_interval)
        .spawn(frame_tx, shutdown_tx.subscribe());
    let writer = tokio::spawn(consume_frames(frame_rx, args.csv.map(CsvStatsWriter::new)));

    let mut state_rx = master.subscribe_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl+C received, quitting"),
        _ = state_rx.wait_for(|state| *state == RunState::Stopped) => {
            tracing::info!("Run stopped");
        }
    }
    master.quit().await?;

    let _ = shutdown_tx.send(());
    reporter.await.context("stats reporter panicked")?;
    let last = writer.await.context("report writer panicked")?;

    if let (Some(path), Some(frame)) = (args.json, last) {
        JsonExporter::new(path).write(&frame)?;
    }
    if let Some(err) = master.last_error() {
        anyhow::bail!("run failed: {err}");
    }
    Ok(())
}

/// Log every frame and mirror it to CSV; returns the last frame
async fn consume_frames(
    mut rx: mpsc::Receiver<ReportFrame>,
    mut csv: Option<CsvStatsWriter>,
) -> Option<ReportFrame> {
    let mut last = None;
    while let Some(frame) = rx.recv().await {
        let total = &frame.snapshot.total;
        tracing::info!(
            state = %frame.state,
            users = frame.user_count,
            requests = total.num_requests,
            failures = total.num_failures,
            rps = total.current_rps,
            p95_ms = total.percentiles.p95,
            "Stats"
        );
        if let Some(writer) = csv.as_mut() {
            if let Err(e) = writer.write_frame(&frame) {
                tracing::warn!(error = %e, "Failed to write CSV stats");
            }
        }
        last = Some(frame);
    }
    last
}
