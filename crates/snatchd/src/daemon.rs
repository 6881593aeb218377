//! Daemon lifecycle: open local storage, recover crashed snatch tasks, start
//! the metrics server and the HTTP surface, shut down gracefully.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use snatch_core::config::SnatchConfig;
use snatch_engine::SnatchEngine;
use snatch_notify::NotificationSink;
use snatch_profiles::ProfileStore;
use snatch_registry::TaskRegistry;

use crate::http::{self, AppState};
use crate::metrics::{self, HealthState, Registry, SnatchMetrics};

pub async fn run(config: SnatchConfig) -> Result<()> {
    info!("daemon starting");

    let profiles = Arc::new(ProfileStore::new(
        config.profiles.path.clone(),
        config.profiles.default_ssh_key_path.clone(),
    ));

    let registry = Arc::new(TaskRegistry::open(&config.registry.path, config.registry.busy_timeout_ms)?);
    info!(path = %config.registry.path.display(), "task registry opened");

    let notify = Arc::new(NotificationSink::new());

    let mut prom_registry = Registry::default();
    let metrics = SnatchMetrics::new(&mut prom_registry);
    let health_state = HealthState {
        registry: Arc::new(prom_registry),
        storage_ready: Arc::new(AtomicBool::new(true)),
    };

    let metrics_addr = config.daemon.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_addr, health_state).await {
            error!("metrics server failed: {e}");
        }
    });

    recover_stuck_tasks(&registry, &profiles, &notify, &config, &metrics).await;

    notify_ready();

    let state = AppState {
        config: Arc::new(config.clone()),
        profiles,
        registry,
        notify,
        metrics,
    };

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&config.daemon.listen_addr).await?;
    info!(addr = %config.daemon.listen_addr, "http: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown complete");
    Ok(())
}

/// Re-dispatches any snatch task left `running` by a crash. Recovery itself
/// (deciding which rows are stuck and which must fail outright because
/// their profile is gone) lives in the registry; this just hands the
/// survivors back to fresh `SnatchEngine` runs.
async fn recover_stuck_tasks(
    registry: &Arc<TaskRegistry>,
    profiles: &Arc<ProfileStore>,
    notify: &Arc<NotificationSink>,
    config: &SnatchConfig,
    metrics: &Arc<SnatchMetrics>,
) {
    let profiles_for_check = profiles.clone();
    let recovered = match registry
        .recover_stuck_snatch_tasks(move |alias| profiles_for_check.get(alias).ok().flatten().is_some())
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!("recovery scan failed: {e}");
            return;
        }
    };

    if recovered.is_empty() {
        return;
    }
    info!(count = recovered.len(), "recovering snatch tasks stuck by a prior crash");

    for (task, progress) in recovered {
        let Ok(Some(profile)) = profiles.get(&task.account_alias) else {
            warn!(task_id = %task.id, "profile vanished between recovery scan and dispatch");
            continue;
        };

        let run = snatch_engine::SnatchRun {
            task_id: task.id.clone(),
            profile,
            progress,
            telegram: None,
            cloudflare: None,
        };

        let engine = SnatchEngine::new(
            registry.clone(),
            profiles.clone(),
            notify.clone(),
            config.engine.clone(),
            metrics.clone(),
        );
        tokio::spawn(async move {
            engine.run(run).await;
        });
    }
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating graceful shutdown");
        }
    }

    notify_stopping();
}

fn notify_ready() {
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}

fn notify_stopping() {
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"STOPPING=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd STOPPING=1");
        }
    }
}
