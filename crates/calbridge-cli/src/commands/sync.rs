//! Sync subcommand: run passes on demand, inspect the queue, run the daemon.

use clap::Subcommand;
use calbridge_core::storage::SyncStatusStore;

use super::{runtime, CliResult, Context};

/// Sync actions for the connected calendar.
#[derive(Subcommand)]
pub enum SyncAction {
    /// Push every pending change, then pull provider edits
    Now {
        /// Skip the inbound pass
        #[arg(long)]
        outbound_only: bool,
    },
    /// Pull provider edits only
    Inbound {
        #[arg(long)]
        json: bool,
    },
    /// Show health and queue counts
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List queued and failed jobs
    Jobs,
    /// Move failed jobs back into the queue
    Retry,
}

pub fn run(user: &str, action: SyncAction) -> CliResult {
    let ctx = Context::open()?;
    match action {
        SyncAction::Now { outbound_only } => {
            let rt = runtime()?;
            let queued = ctx.engine.enqueue_pending(user)?;
            ctx.engine.refresh_routine_windows()?;
            let pushed = rt.block_on(ctx.engine.run_outbound_now())?;
            println!("outbound: {pushed} job(s) processed ({queued} newly queued)");
            if !outbound_only {
                let report = rt.block_on(ctx.engine.reconcile_inbound(user))?;
                println!("inbound:  {}", report.summary());
                for warning in &report.mapping_warnings {
                    println!("  warning: {warning}");
                }
            }
        }
        SyncAction::Inbound { json } => {
            let report = runtime()?.block_on(ctx.engine.reconcile_inbound(user))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.summary());
            }
        }
        SyncAction::Status { json } => {
            let status = ctx.engine.status(user)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            println!("health:        {}", status.health.as_str());
            if let Some(err) = &status.last_error {
                println!("last error:    {err}");
            }
            let fmt = |t: Option<chrono::DateTime<chrono::Utc>>| {
                t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
            };
            println!("last outbound: {}", fmt(status.last_outbound_sync_at));
            println!("last inbound:  {}", fmt(status.last_inbound_sync_at));
            println!(
                "queue:         {} pending, {} retrying, {} failed, {} skipped",
                status.counts.pending,
                status.counts.retrying,
                status.counts.failed,
                status.counts.skipped
            );
        }
        SyncAction::Jobs => {
            for job in ctx.store.list_jobs(user)? {
                println!(
                    "{:<8} {:>6} {:<7} {:<9} attempts={} {}",
                    job.entity_kind.as_str(),
                    job.entity_id,
                    job.change.as_str(),
                    job.state.as_str(),
                    job.attempts,
                    job.last_error.unwrap_or_default()
                );
            }
        }
        SyncAction::Retry => {
            let moved = ctx.engine.retry_failed(user)?;
            let pushed = runtime()?.block_on(ctx.engine.run_outbound_now())?;
            println!("requeued {moved} failed job(s), processed {pushed}");
        }
    }
    Ok(())
}

/// Run the background loops until Ctrl-C.
pub fn daemon() -> CliResult {
    let ctx = Context::open()?;
    let rt = runtime()?;
    rt.block_on(async {
        let handle = ctx.engine.start();
        tracing::info!(
            reconcile_every_secs = ctx.config.sync.reconcile_interval_secs,
            "daemon running, press Ctrl-C to stop"
        );
        let signal = tokio::signal::ctrl_c().await;
        handle.shutdown().await;
        signal
    })?;
    Ok(())
}
