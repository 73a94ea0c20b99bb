//! Serve command handler.
//!
//! Runs the supervisor against the config file until Ctrl-C, then performs
//! the bounded shutdown and label sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use upmux_core::{ConfigService, LabelSelector, Sandbox, UpstreamEvent};
use upmux_runtime::{ConfigFileWatcher, DEFAULT_POLL_INTERVAL, ShutdownReport, Supervisor};

use crate::bootstrap::CliContext;

pub struct ServeArgs {
    pub watch: bool,
    pub shutdown_timeout: Duration,
    pub no_sandbox: bool,
}

pub async fn execute(ctx: &CliContext, args: ServeArgs) -> Result<()> {
    let sandbox = if args.no_sandbox {
        None
    } else {
        ctx.sandbox().await
    };

    // A previous run of this instance may have crashed with containers up.
    if let Some(sandbox) = &sandbox {
        let selector = LabelSelector::Instance(sandbox.instance_id().to_string());
        match sandbox.stop_by_label(&selector).await {
            Ok(ids) if !ids.is_empty() => {
                warn!(count = ids.len(), "Stopped containers orphaned by a previous run");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Startup sweep failed"),
        }
    }

    let supervisor = ctx.supervisor(sandbox)?;
    if let Some(report) = supervisor.start_refresh().await {
        debug!(?report, "Refresh schedules resumed");
    }

    let cancel = CancellationToken::new();
    let reconcile = tokio::spawn({
        let supervisor = supervisor.clone();
        let source = ctx.config_source();
        async move { supervisor.run(source).await }
    });
    let events = tokio::spawn(log_events(supervisor.clone(), cancel.child_token()));
    let watcher = args.watch.then(|| {
        tokio::spawn(watch_config(Arc::clone(&ctx.config), cancel.child_token()))
    });

    println!(
        "upmux supervising {} server(s) (Press Ctrl+C to stop)",
        ctx.config_source().current().len()
    );
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    cancel.cancel();
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    let report = supervisor.shutdown(args.shutdown_timeout).await;
    let _ = reconcile.await;
    let _ = events.await;

    print_report(&report);
    Ok(())
}

async fn watch_config(config: Arc<ConfigService>, cancel: CancellationToken) {
    let Some(path) = config.path().map(std::path::Path::to_path_buf) else {
        return;
    };
    let changes = ConfigFileWatcher::new(path, DEFAULT_POLL_INTERVAL, cancel).changes();
    futures_util::pin_mut!(changes);

    while changes.next().await.is_some() {
        match config.reload_from_file() {
            Ok(Some(snapshot)) => info!(version = snapshot.version(), "Config reloaded"),
            Ok(None) => {}
            // Keep serving the last good config.
            Err(e) => error!(error = %e, "Rejected config change"),
        }
    }
}

async fn log_events(supervisor: Supervisor, cancel: CancellationToken) {
    let mut events = supervisor.subscribe();
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "Event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &UpstreamEvent) {
    match event {
        UpstreamEvent::ServerConnected { server, tool_count } => {
            info!(server = %server, tool_count, "Upstream connected");
        }
        UpstreamEvent::ServerStateChanged {
            server,
            from,
            to,
            error: Some(error),
        } => {
            warn!(server = %server, %from, %to, error = %error, "Upstream state changed");
        }
        UpstreamEvent::RefreshFailed { server, error, .. } => {
            warn!(server = %server, error = %error, "OAuth refresh gave up, login required");
        }
        UpstreamEvent::ReconciliationFailed { version, error } => {
            error!(version, error = %error, "Reconciliation action failed");
        }
        other => debug!(event = other.name(), server = ?other.server(), "Upstream event"),
    }
}

fn print_report(report: &ShutdownReport) {
    println!("Stopped {} actor(s)", report.stopped);
    if !report.stuck.is_empty() {
        println!("Aborted stuck actors: {}", report.stuck.join(", "));
    }
    if !report.swept.is_empty() {
        println!("Swept {} leftover container(s)", report.swept.len());
    }
    if let Some(error) = &report.sweep_error {
        println!("Container sweep failed: {error}");
        println!("Run `upmux sweep --force` to clean up.");
    }
}
