//! remeshd — the Remesh daemon.
//!
//! One binary, four modes:
//! - `manager`: process manager + control API
//! - `balancer`: load balancer proxy, pulling its table from a manager
//! - `agent`: on-call agent webhook + remediation loop
//! - `standalone`: all three in one process, table shared in memory
//!
//! # Usage
//!
//! ```text
//! remeshd standalone --replicas 3
//! remeshd manager --port 7000 --launch-cmd ./item-catalog
//! remeshd balancer --port 7100 --manager 127.0.0.1:7000
//! remeshd agent --port 7200 --manager 127.0.0.1:7000 --policy policy.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use remesh_agent::{HttpControlPlane, OnCallAgent, PolicyConfig};
use remesh_balancer::{BackendPicker, ControlPlaneSource, ProxyState};
use remesh_manager::{CommandLauncher, InstanceLauncher, ManagerConfig, NullLauncher, Reconciler};
use remesh_metrics::RequestMetrics;

#[derive(Parser)]
#[command(name = "remeshd", about = "Remesh self-healing mesh daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Clone)]
struct ManagerOpts {
    /// Host for launched instances.
    #[arg(long, default_value = "127.0.0.1")]
    instance_host: String,

    /// First port of the instance address pool.
    #[arg(long, default_value = "8001")]
    base_port: u16,

    /// Last port of the instance address pool (inclusive).
    #[arg(long, default_value = "8010")]
    max_port: u16,

    /// Desired replicas at startup.
    #[arg(long, default_value = "2")]
    replicas: u32,

    /// Replica ceiling.
    #[arg(long, default_value = "10")]
    max_replicas: u32,

    /// Health probe interval in seconds.
    #[arg(long, default_value = "5")]
    probe_interval: u64,

    /// Drain grace period in seconds.
    #[arg(long, default_value = "10")]
    drain_grace: u64,

    /// Command that starts one instance; receives `--host`/`--port`.
    /// Without it, instances are registry entries only.
    #[arg(long)]
    launch_cmd: Option<String>,

    /// Extra fixed arguments for the launch command.
    #[arg(long)]
    launch_arg: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the process manager and its control API.
    Manager {
        /// Control API port.
        #[arg(long, default_value = "7000")]
        port: u16,

        #[command(flatten)]
        opts: ManagerOpts,
    },

    /// Run the load balancer proxy.
    Balancer {
        /// Proxy listen port.
        #[arg(long, default_value = "7100")]
        port: u16,

        /// Manager control API authority.
        #[arg(long, default_value = "127.0.0.1:7000")]
        manager: String,

        /// Routing table refresh interval in seconds.
        #[arg(long, default_value = "2")]
        refresh_interval: u64,

        /// Consecutive transport errors before deprioritizing a backend.
        #[arg(long, default_value = "2")]
        penalty_threshold: u32,
    },

    /// Run the on-call agent webhook.
    Agent {
        /// Webhook listen port.
        #[arg(long, default_value = "7200")]
        port: u16,

        /// Manager control API authority.
        #[arg(long, default_value = "127.0.0.1:7000")]
        manager: String,

        /// Remediation policy TOML; defaults are compiled in.
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Cooldown sweep interval in seconds.
        #[arg(long, default_value = "30")]
        sweep_interval: u64,
    },

    /// Run manager, balancer, and agent in one process.
    Standalone {
        /// Control API port.
        #[arg(long, default_value = "7000")]
        manager_port: u16,

        /// Proxy listen port.
        #[arg(long, default_value = "7100")]
        balancer_port: u16,

        /// Webhook listen port.
        #[arg(long, default_value = "7200")]
        agent_port: u16,

        #[command(flatten)]
        opts: ManagerOpts,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,remeshd=debug,remesh=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Manager { port, opts } => run_manager(port, opts).await,
        Command::Balancer {
            port,
            manager,
            refresh_interval,
            penalty_threshold,
        } => run_balancer(port, manager, refresh_interval, penalty_threshold).await,
        Command::Agent {
            port,
            manager,
            policy,
            sweep_interval,
        } => run_agent(port, manager, policy, sweep_interval).await,
        Command::Standalone {
            manager_port,
            balancer_port,
            agent_port,
            opts,
        } => run_standalone(manager_port, balancer_port, agent_port, opts).await,
    }
}

fn manager_config(opts: &ManagerOpts) -> ManagerConfig {
    ManagerConfig {
        max_replicas: opts.max_replicas,
        initial_replicas: opts.replicas,
        probe_interval: Duration::from_secs(opts.probe_interval),
        drain_grace: Duration::from_secs(opts.drain_grace),
        host: opts.instance_host.clone(),
        base_port: opts.base_port,
        max_port: opts.max_port,
        ..ManagerConfig::default()
    }
}

fn launcher_from(opts: &ManagerOpts) -> Arc<dyn InstanceLauncher> {
    match &opts.launch_cmd {
        Some(program) => Arc::new(CommandLauncher::new(program.clone(), opts.launch_arg.clone())),
        None => Arc::new(NullLauncher),
    }
}

fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn serve(
    router: axum::Router,
    port: u16,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;
    Ok(())
}

async fn run_manager(port: u16, opts: ManagerOpts) -> anyhow::Result<()> {
    info!("remesh manager starting");

    let (reconciler, handle) = Reconciler::new(manager_config(&opts), launcher_from(&opts));
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx));

    serve(remesh_manager::api::router(handle), port, shutdown_tx).await?;
    let _ = reconciler_handle.await;

    info!("remesh manager stopped");
    Ok(())
}

async fn run_balancer(
    port: u16,
    manager: String,
    refresh_interval: u64,
    penalty_threshold: u32,
) -> anyhow::Result<()> {
    info!(%manager, "remesh balancer starting");

    let table = remesh_registry::SharedTable::new();
    let picker = Arc::new(BackendPicker::new(penalty_threshold));
    let state = ProxyState::new(table.clone(), picker.clone(), RequestMetrics::new());
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    let source = Arc::new(ControlPlaneSource::new(manager));
    let refresher = tokio::spawn(remesh_balancer::run_refresher(
        source,
        table,
        picker,
        Duration::from_secs(refresh_interval),
        shutdown_rx,
    ));

    serve(remesh_balancer::router(state), port, shutdown_tx).await?;
    let _ = refresher.await;

    info!("remesh balancer stopped");
    Ok(())
}

async fn run_agent(
    port: u16,
    manager: String,
    policy_path: Option<PathBuf>,
    sweep_interval: u64,
) -> anyhow::Result<()> {
    info!(%manager, "remesh agent starting");

    let policy = match policy_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            info!(path = ?path, "remediation policy loaded");
            PolicyConfig::from_toml(&raw)?
        }
        None => PolicyConfig::default(),
    };

    let agent = OnCallAgent::new(policy, Arc::new(HttpControlPlane::new(manager)));
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    let sweeper = tokio::spawn(
        agent
            .clone()
            .run_sweeper(Duration::from_secs(sweep_interval), shutdown_rx),
    );

    serve(remesh_agent::router(agent), port, shutdown_tx).await?;
    let _ = sweeper.await;

    info!("remesh agent stopped");
    Ok(())
}

async fn run_standalone(
    manager_port: u16,
    balancer_port: u16,
    agent_port: u16,
    opts: ManagerOpts,
) -> anyhow::Result<()> {
    info!("remesh standalone starting");

    let (reconciler, handle) = Reconciler::new(manager_config(&opts), launcher_from(&opts));
    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    let reconciler_handle = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    // The balancer reads the manager's table directly; no HTTP refresh
    // loop in standalone mode.
    let proxy_state = ProxyState::new(
        handle.shared_table(),
        Arc::new(BackendPicker::new(2)),
        RequestMetrics::new(),
    );

    let agent = OnCallAgent::new(
        PolicyConfig::default(),
        Arc::new(HttpControlPlane::new(format!("127.0.0.1:{manager_port}"))),
    );
    let sweeper = tokio::spawn(
        agent
            .clone()
            .run_sweeper(Duration::from_secs(30), shutdown_rx.clone()),
    );

    let manager_router = remesh_manager::api::router(handle);
    let balancer_router = remesh_balancer::router(proxy_state);
    let agent_router = remesh_agent::router(agent);

    let manager_listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], manager_port))).await?;
    let balancer_listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], balancer_port))).await?;
    let agent_listener =
        tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], agent_port))).await?;
    info!(manager_port, balancer_port, agent_port, "all listeners bound");

    let mut manager_shutdown = shutdown_rx.clone();
    let mut balancer_shutdown = shutdown_rx.clone();
    let mut agent_shutdown = shutdown_rx;
    let manager_srv = tokio::spawn(async move {
        axum::serve(manager_listener, manager_router)
            .with_graceful_shutdown(async move {
                let _ = manager_shutdown.changed().await;
            })
            .await
    });
    let balancer_srv = tokio::spawn(async move {
        axum::serve(balancer_listener, balancer_router)
            .with_graceful_shutdown(async move {
                let _ = balancer_shutdown.changed().await;
            })
            .await
    });
    let agent_srv = tokio::spawn(async move {
        axum::serve(agent_listener, agent_router)
            .with_graceful_shutdown(async move {
                let _ = agent_shutdown.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = manager_srv.await;
    let _ = balancer_srv.await;
    let _ = agent_srv.await;
    let _ = reconciler_handle.await;
    let _ = sweeper.await;

    info!("remesh standalone stopped");
    Ok(())
}
