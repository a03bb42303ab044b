//! Daemon assembly: wires backends, the orchestrator, and the API server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use cutover_core::CutoverConfig;
use cutover_core::config::PlatformMode;
use cutover_health::{HealthProber, HttpProbe, Probe, ProbeResult, ScriptedProbe};
use cutover_orchestrator::Orchestrator;
use cutover_platform::{SimCompute, SimLoadBalancer, SimRegistry};
use cutover_rollout::Services;
use cutover_router::TrafficRouter;
use cutover_state::StateStore;
use cutover_targets::TargetGroupModel;

pub struct Options {
    pub config: PathBuf,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub stale_retry_interval: Duration,
}

pub async fn run(options: Options) -> anyhow::Result<()> {
    info!("Cutover daemon starting");

    let mut config = CutoverConfig::from_file(&options.config)
        .with_context(|| format!("loading {}", options.config.display()))?;
    if let Some(port) = options.port {
        config.daemon.port = port;
    }
    if let Some(data_dir) = options.data_dir {
        config.daemon.data_dir = data_dir;
    }

    // Ensure data directory exists.
    std::fs::create_dir_all(&config.daemon.data_dir)?;
    let db_path = config.daemon.data_dir.join("cutover.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "history store opened");

    let orchestrator = assemble(&config, store)?;

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stale_handle = tokio::spawn(stale_retry_loop(
        orchestrator.clone(),
        options.stale_retry_interval,
        shutdown_rx,
    ));

    // ── API server ─────────────────────────────────────────────

    let router = cutover_api::build_router(orchestrator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.daemon.port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let draining = orchestrator.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
        draining.shutdown().await;
    });

    server.await?;
    let _ = stale_handle.await;

    info!("Cutover daemon stopped");
    Ok(())
}

/// Build the backends and the orchestrator, then load services.
///
/// Services restored from the store come first; `[[services]]` entries
/// in the config update them or add new ones.
pub fn assemble(config: &CutoverConfig, store: StateStore) -> anyhow::Result<Orchestrator> {
    let specs = config.service_specs()?;

    let registry = Arc::new(SimRegistry::new());
    let compute = Arc::new(SimCompute::new());
    let load_balancer = Arc::new(SimLoadBalancer::new());
    let probe: Arc<dyn Probe> = match config.platform.mode {
        PlatformMode::Simulated => Arc::new(ScriptedProbe::always(ProbeResult::Healthy)),
        PlatformMode::SimulatedHttpProbe => Arc::new(HttpProbe),
    };
    info!(mode = ?config.platform.mode, "platform backends initialized");

    let targets = Arc::new(TargetGroupModel::new(compute, config.limits.max_group_size));
    let services = Services {
        registry,
        prober: HealthProber::new(targets.clone(), probe),
        targets,
        router: Arc::new(TrafficRouter::new(load_balancer)),
    };

    let orchestrator = Orchestrator::new(services, Arc::new(store));
    let restored = orchestrator.restore()?;
    debug!(restored, configured = specs.len(), "loading services");

    for spec in specs {
        let id = spec.id.clone();
        orchestrator
            .register(spec)
            .with_context(|| format!("registering service {id}"))?;
    }
    Ok(orchestrator)
}

async fn stale_retry_loop(
    orchestrator: Orchestrator,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if orchestrator.stale_groups().is_empty() {
                    continue;
                }
                let retired = orchestrator.retry_stale_groups().await;
                let remaining = orchestrator.stale_groups().len();
                if remaining > 0 {
                    warn!(retired, remaining, "stale groups still pending");
                } else {
                    info!(retired, "stale groups retired");
                }
            }
        }
    }
}
