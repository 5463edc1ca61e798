//! Automated stop conditions

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::stats::RequestStats;

use super::Runner;

/// Quit the run once the fail ratio exceeds `threshold`
///
/// The check runs every `interval`. The quit itself happens in its own task
/// so that the runner can abort this monitor while it is quitting.
pub(crate) fn spawn_fail_ratio_monitor<R>(
    runner: R,
    stats: Arc<RequestStats>,
    threshold: f64,
    interval: Duration,
) -> JoinHandle<()>
where
    R: Runner + Clone + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let ratio = stats.fail_ratio();
            if stats.total_requests() > 0 && ratio > threshold {
                tracing::error!(
                    fail_ratio = ratio,
                    threshold,
                    "Fail ratio exceeded threshold, quitting"
                );
                tokio::spawn(async move {
                    if let Err(e) = runner.quit().await {
                        tracing::error!(error = %e, "Quit after fail ratio breach failed");
                    }
                });
                break;
            }
        }
    })
}

/// Stop the run after `run_time`
pub(crate) fn spawn_run_time_monitor<R>(runner: R, run_time: Duration) -> JoinHandle<()>
where
    R: Runner + Clone + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(run_time).await;
        tracing::info!(
            run_time_secs = run_time.as_secs_f64(),
            "Run time limit reached, stopping"
        );
        tokio::spawn(async move {
            if let Err(e) = runner.stop().await {
                tracing::error!(error = %e, "Stop after run time limit failed");
            }
        });
    })
}
