use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::engine::Reconciler;

/// Cron jobs for the periodic pass and the daily note refresh, or `None` when the scheduler
/// is disabled. A pass that is still running when the next tick fires makes that tick a
/// no-op.
pub async fn maybe_build_scheduler(reconciler: Arc<Reconciler>) -> Result<Option<JobScheduler>> {
    if !reconciler.config().scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(reconciler).await.map(Some)
}

pub async fn build_scheduler(reconciler: Arc<Reconciler>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let busy = Arc::new(Mutex::new(()));

    let sync_cron = reconciler.config().sync_cron.clone();
    let pass = {
        let reconciler = reconciler.clone();
        let busy = busy.clone();
        Job::new_async(sync_cron.as_str(), move |_uuid, _l| {
            let reconciler = reconciler.clone();
            let busy = busy.clone();
            Box::pin(async move {
                let Ok(_guard) = busy.try_lock() else {
                    warn!("previous pass still running; skipping tick");
                    return;
                };
                match reconciler.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        failed = summary.failed(),
                        skipped = summary.skipped.len(),
                        "scheduled pass done"
                    ),
                    Err(err) => error!(error = %err, "scheduled pass failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {sync_cron}"))?
    };
    sched.add(pass).await.context("adding sync job")?;

    let daily_cron = reconciler.config().daily_cron.clone();
    let notes = {
        let reconciler = reconciler.clone();
        Job::new_async(daily_cron.as_str(), move |_uuid, _l| {
            let reconciler = reconciler.clone();
            let busy = busy.clone();
            Box::pin(async move {
                let _guard = busy.lock().await;
                match reconciler.refresh_notes(false).await {
                    Ok(refreshed) => info!(refreshed, "scheduled note refresh done"),
                    Err(err) => error!(error = %err, "scheduled note refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {daily_cron}"))?
    };
    sched.add(notes).await.context("adding notes job")?;

    Ok(sched)
}
