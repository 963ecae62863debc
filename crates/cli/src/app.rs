//! Application wiring and lifecycle.
//!
//! Construction order is store → cache → engine → listeners → bridge →
//! scheduler → HTTP, and shutdown walks back in the reverse service order:
//! scheduler, bridge, MQTT listener, HTTP servers, store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use mqmesh_api::{device_router, mgmt_router, ApiState};
use mqmesh_bridge::BridgeManager;
use mqmesh_broker::{Engine, Fanout, MqttServer};
use mqmesh_core::{BridgeIdentity, Config, DeviceCache};
use mqmesh_scheduler::{Scheduler, TaskStore};
use mqmesh_storage::Database;

/// Scheduler tick period.
const SCHEDULER_TICK: Duration = Duration::from_millis(1000);

/// Sweep period for demoting silent HTTP devices.
const HTTP_OFFLINE_SWEEP: Duration = Duration::from_secs(60);

/// Period of the timeseries retention check.
const TS_RETENTION_SWEEP: Duration = Duration::from_secs(6 * 3600);

pub async fn run(config: Config) -> anyhow::Result<()> {
    // Store first: failing to open the database is fatal.
    let db = Database::open(&config.data_dir)
        .await
        .context("failed to open database")?;
    db.bootstrap_default_device()
        .await
        .context("device bootstrap failed")?;

    let identity = BridgeIdentity::load_or_generate(&config).context("bridge identity")?;
    info!(broker_id = %identity.broker_id, federation = config.bridge_enabled, "broker identity ready");

    let cache = Arc::new(DeviceCache::new(
        Duration::from_millis(config.publish_rate_limit_ms),
        Duration::from_millis(config.message_expire_ms),
    ));
    let fanout = Arc::new(Fanout::new());
    let engine = Arc::new(Engine::new(
        Arc::clone(&cache),
        db.clone(),
        Arc::clone(&fanout),
        &identity,
        config.bridge_enabled,
        config.max_message_bytes,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // MQTT listener.
    let mqtt_addr = format!("{}:{}", config.mqtt_host, config.mqtt_port);
    let mqtt_listener = TcpListener::bind(&mqtt_addr)
        .await
        .with_context(|| format!("failed to bind MQTT listener on {mqtt_addr}"))?;
    let mqtt_handle = {
        let server = MqttServer::new(Arc::clone(&engine));
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(mqtt_listener, shutdown).await {
                error!("MQTT listener failed: {e}");
            }
        })
    };

    // Federation.
    let bridge = if config.bridge_enabled {
        let manager = Arc::new(BridgeManager::new(
            identity.clone(),
            Arc::clone(&cache),
            db.clone(),
            Duration::from_millis(config.bridge_reconnect_ms),
        ));
        match manager.reload_remotes().await {
            Ok(started) => info!(peers = started, "bridge peers started"),
            Err(e) => warn!("bridge startup reload failed: {e}"),
        }
        engine.set_bridge(manager.clone());
        Some(manager)
    } else {
        None
    };

    // Scheduler.
    let tasks = Arc::new(TaskStore::new());
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&tasks),
        Arc::clone(&cache),
        fanout,
        SCHEDULER_TICK,
    ));
    let scheduler_handle = Arc::clone(&scheduler).spawn(shutdown_rx.clone());

    // Maintenance timers.
    spawn_cache_cleanup(&config, Arc::clone(&cache), shutdown_rx.clone());
    spawn_http_offline_sweep(db.clone(), shutdown_rx.clone());
    spawn_ts_retention(&config, db.clone(), shutdown_rx.clone());

    // HTTP surfaces.
    let state = ApiState {
        config: Arc::new(config.clone()),
        db: db.clone(),
        cache,
        engine,
        tasks,
        bridge: bridge.clone(),
    };
    let device_handle = serve_http(
        format!("0.0.0.0:{}", config.http_port),
        device_router(state.clone()),
        shutdown_rx.clone(),
    )
    .await?;
    let mgmt_handle = serve_http(
        format!("0.0.0.0:{}", config.mgmt_port),
        mgmt_router(state),
        shutdown_rx.clone(),
    )
    .await?;

    info!(
        mqtt = %mqtt_addr,
        http = config.http_port,
        mgmt = config.mgmt_port,
        "mqmesh up"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    // Reverse order: scheduler, bridge, MQTT, HTTP, store.
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    if let Some(bridge) = bridge {
        bridge.stop();
    }
    let _ = mqtt_handle.await;
    let _ = device_handle.await;
    let _ = mgmt_handle.await;
    db.close().await;
    info!("shutdown complete");
    Ok(())
}

async fn serve_http(
    addr: String,
    router: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;
    info!(%addr, "HTTP listener started");
    Ok(tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        let result = axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
        if let Err(e) = result {
            error!(%addr, "HTTP server failed: {e}");
        }
    }))
}

fn spawn_cache_cleanup(
    config: &Config,
    cache: Arc<DeviceCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = Duration::from_millis(config.cache_cleanup_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => cache.clean_expired_messages(),
                _ = shutdown.changed() => return,
            }
        }
    });
}

fn spawn_http_offline_sweep(db: Database, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HTTP_OFFLINE_SWEEP);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match db.mark_inactive_http_devices_offline().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "demoted inactive http devices"),
                        Err(e) => warn!("http offline sweep failed: {e}"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}

fn spawn_ts_retention(config: &Config, db: Database, mut shutdown: watch::Receiver<bool>) {
    let retention_days = config.timeseries_retention_days;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TS_RETENTION_SWEEP);
        loop {
            // Ticks immediately on start, so retention also runs at boot.
            tokio::select! {
                _ = ticker.tick() => {
                    match db.cleanup_timeseries(retention_days).await {
                        Ok(0) => {}
                        Ok(dropped) => info!(dropped, "timeseries retention dropped shards"),
                        Err(e) => warn!("timeseries retention failed: {e}"),
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}
