//! Process roles and the cluster launcher
//!
//! `worker` and `monitor` run one role in this process. `launch` starts a
//! whole cluster: either child processes sharing a board file, or every
//! role as a task on the current runtime.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use futures_util::future::try_join_all;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BenchConfig;
use crate::error::{Error, Result};
use crate::net;
use crate::protocol::PeerAddress;
use crate::rendezvous::{
    wait_until, BarrierKind, Board, FileBoard, MemoryBoard, Monitor, MonitorOutcome,
    MonitorRendezvous, MonitorSettings, NotifyWait, PollingWait, Rendezvous,
    SharedStateRendezvous,
};
use crate::transport::{build_transport, Transport};
use crate::worker::{RunReport, Worker, WorkerSettings};

// ─────────────────────────────────────────────────────────────────
// Role Wiring
// ─────────────────────────────────────────────────────────────────

/// Rendezvous for one worker: monitor when a port is configured, else the board
fn build_rendezvous(
    config: &BenchConfig,
    transport: &Arc<dyn Transport>,
    board: Option<Arc<dyn Board>>,
    monitor_host: &str,
    cancel: &CancellationToken,
) -> Result<Box<dyn Rendezvous>> {
    if config.uses_monitor() {
        let monitor = PeerAddress::new(
            config.cluster.monitor_host.as_deref().unwrap_or(monitor_host),
            config.cluster.monitor_port,
        );
        return Ok(Box::new(MonitorRendezvous::new(
            Arc::clone(transport),
            monitor,
            config.cluster.num_workers,
            config.cluster.endpoints,
            config.retry_policy(),
            cancel.clone(),
        )));
    }

    let board = match board {
        Some(board) => board,
        None => {
            let path = config.board_path().ok_or_else(|| {
                Error::config_field_invalid(
                    "cluster.board",
                    "shared-state rendezvous needs a board file (--board) or a monitor port",
                )
            })?;
            Arc::new(FileBoard::open(path, config.cluster.num_workers)?)
        }
    };
    Ok(Box::new(SharedStateRendezvous::new(
        board,
        PollingWait::new(config.poll_interval()),
        PollingWait::new(config.completion_poll_interval()),
        cancel.clone(),
    )))
}

fn monitor_settings(config: &BenchConfig, host: String) -> MonitorSettings {
    MonitorSettings {
        num_workers: config.cluster.num_workers,
        endpoints: config.cluster.endpoints,
        host,
        port: match config.cluster.monitor_port {
            0 => None,
            port => Some(port),
        },
        poll_interval: config.poll_interval(),
    }
}

async fn bind_monitor(
    config: &BenchConfig,
    transport: &Arc<dyn Transport>,
    host: String,
    cancel: &CancellationToken,
) -> Result<Monitor> {
    let settings = monitor_settings(config, host);
    let monitor = Monitor::bind(transport.as_ref(), settings, cancel.clone()).await?;
    Ok(match config.timing.barrier {
        BarrierKind::Poll => monitor,
        BarrierKind::Notify => {
            let notify = monitor.listener().registry().notifier();
            monitor.with_waiter(Arc::new(NotifyWait::new(notify, config.poll_interval())))
        }
    })
}

/// Cancel `cancel` on Ctrl-C
fn cancel_on_interrupt(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
}

// ─────────────────────────────────────────────────────────────────
// Single Roles
// ─────────────────────────────────────────────────────────────────

/// Run one worker in this process and print its bandwidth summary
pub async fn run_worker(config: &BenchConfig, ordinal: usize, output: Option<&Path>) -> Result<RunReport> {
    let host = net::resolve_host(&config.network)?;
    let transport = build_transport(&config.transport);
    let cancel = CancellationToken::new();
    cancel_on_interrupt(&cancel);

    info!(
        ordinal,
        workers = config.cluster.num_workers,
        endpoints = config.cluster.endpoints,
        transport = %transport.kind(),
        machine = %net::hostname(),
        "Starting worker"
    );

    let rendezvous = build_rendezvous(config, &transport, None, &host, &cancel)?;
    let settings = WorkerSettings::from_config(config, ordinal, host);
    let report = Worker::new(settings, transport, rendezvous, cancel).run().await?;

    for line in report.summary_lines() {
        println!("{}", line);
    }
    if let Some(path) = output {
        report.write_json(path)?;
        info!(path = %path.display(), "Report written");
    }
    Ok(report)
}

/// Run the monitor in this process
///
/// With a board configured the bound port is published there for the
/// launcher to pick up.
pub async fn run_monitor(config: &BenchConfig) -> Result<MonitorOutcome> {
    let host = net::resolve_host(&config.network)?;
    let transport = build_transport(&config.transport);
    let cancel = CancellationToken::new();
    cancel_on_interrupt(&cancel);
    let monitor = bind_monitor(config, &transport, host, &cancel).await?;
    let port = monitor.port();

    if let Some(path) = config.board_path() {
        let board = FileBoard::open(&path, config.cluster.num_workers)?;
        board.publish_monitor_port(port)?;
        debug!(port, board = %path.display(), "Published monitor port");
    }
    println!("Monitor listening on port {}", port);

    let outcome = monitor.run().await?;
    info!(workers = outcome.roster.len(), "Monitor finished");
    Ok(outcome)
}

// ─────────────────────────────────────────────────────────────────
// Multi-Process Launch
// ─────────────────────────────────────────────────────────────────

/// How `launch` should start the cluster
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Rendezvous through a monitor process instead of the board
    pub monitor: bool,
    /// Config file handed to every child
    pub config_path: Option<String>,
    /// Verbosity handed to every child
    pub verbose: u8,
}

/// Spawn the monitor (optionally) and N workers as child processes
pub async fn launch(config: &BenchConfig, options: &LaunchOptions) -> Result<()> {
    let exe = std::env::current_exe().map_err(|e| Error::Internal(format!("cannot locate own executable: {}", e)))?;
    let board_path = std::env::temp_dir().join(format!("meshbench-{}.board", uuid::Uuid::new_v4()));
    let board = FileBoard::create(&board_path, config.cluster.num_workers)?;
    info!(
        workers = config.cluster.num_workers,
        endpoints = config.cluster.endpoints,
        monitor = options.monitor,
        board = %board_path.display(),
        "Launching cluster"
    );

    let result = launch_children(&exe, config, options, &board).await;

    if let Err(e) = std::fs::remove_file(&board_path) {
        debug!(error = %e, "Could not remove board file");
    }
    result
}

async fn launch_children(
    exe: &Path,
    config: &BenchConfig,
    options: &LaunchOptions,
    board: &FileBoard,
) -> Result<()> {
    let mut monitor = None;
    let mut monitor_port = None;
    if options.monitor {
        let mut child = spawn_role(exe, options, "monitor", monitor_args(config, board.path()))?;

        let cancel = CancellationToken::new();
        cancel_on_interrupt(&cancel);
        let waiter = PollingWait::new(config.poll_interval());
        wait_until(&waiter, &cancel, "monitor port", || {
            if let Some(status) = child.try_wait()? {
                return Err(Error::WorkerFailed {
                    role: "monitor".to_string(),
                    status: status.to_string(),
                });
            }
            Ok(board.monitor_port()?.is_some())
        })
        .await?;
        monitor_port = board.monitor_port()?;
        monitor = Some(child);
        info!(port = ?monitor_port, "Monitor is up");
    }

    let workers = (0..config.cluster.num_workers)
        .map(|ordinal| {
            let args = worker_args(config, ordinal, board.path(), monitor_port);
            spawn_role(exe, options, "worker", args).map(|child| (format!("worker {}", ordinal), child))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut waits: Vec<_> = workers
        .into_iter()
        .map(|(role, child)| wait_child(role, child))
        .collect();
    if let Some(child) = monitor {
        waits.push(wait_child("monitor".to_string(), child));
    }
    try_join_all(waits).await?;

    info!("All workers finished");
    Ok(())
}

fn common_args(config: &BenchConfig) -> Vec<String> {
    vec![
        "--workers".into(),
        config.cluster.num_workers.to_string(),
        "--endpoints".into(),
        config.cluster.endpoints.to_string(),
        "--transport".into(),
        config.transport.backend.to_string(),
    ]
}

fn monitor_args(config: &BenchConfig, board: &Path) -> Vec<String> {
    let mut args = common_args(config);
    args.push("--board".into());
    args.push(board.display().to_string());
    args
}

fn worker_args(config: &BenchConfig, ordinal: usize, board: &Path, monitor_port: Option<u16>) -> Vec<String> {
    let mut args = common_args(config);
    args.extend([
        "--ordinal".into(),
        ordinal.to_string(),
        "--payload-size".into(),
        config.exchange.payload_size.to_string(),
        "--iterations".into(),
        config.exchange.iterations.to_string(),
    ]);
    if config.exchange.gather {
        args.push("--gather".into());
    }
    match monitor_port {
        Some(port) => args.extend(["--monitor-port".into(), port.to_string()]),
        None => args.extend(["--board".into(), board.display().to_string()]),
    }
    args
}

fn spawn_role(exe: &Path, options: &LaunchOptions, role: &str, args: Vec<String>) -> Result<Child> {
    let mut cmd = Command::new(exe);
    if options.verbose > 0 {
        cmd.arg(format!("-{}", "v".repeat(options.verbose as usize)));
    }
    cmd.arg(role).args(&args);
    if let Some(path) = &options.config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.stdin(Stdio::null()).kill_on_drop(true);

    debug!(role, args = ?args, "Spawning");
    cmd.spawn().map_err(|e| Error::Internal(format!("failed to spawn {}: {}", role, e)))
}

async fn wait_child(role: String, mut child: Child) -> Result<()> {
    let status = child.wait().await?;
    if status.success() {
        debug!(role = %role, "Exited cleanly");
        Ok(())
    } else {
        Err(Error::WorkerFailed {
            role,
            status: status.to_string(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// In-Process Launch
// ─────────────────────────────────────────────────────────────────

/// Reports from an in-process cluster, in ordinal order
#[derive(Debug)]
pub struct InProcessOutcome {
    pub reports: Vec<RunReport>,
    pub monitor: Option<MonitorOutcome>,
}

/// Run every role as a task on the current runtime
///
/// Shared-state mode uses a [`MemoryBoard`]; monitor mode binds the
/// monitor on an ephemeral port first. The first failing role cancels
/// every other one and its error is returned.
pub async fn run_in_process(config: &BenchConfig, with_monitor: bool) -> Result<InProcessOutcome> {
    let host = net::resolve_host(&config.network)?;
    let transport = build_transport(&config.transport);
    let cancel = CancellationToken::new();
    let n = config.cluster.num_workers;

    let mut config = config.clone();
    let mut board: Option<Arc<dyn Board>> = None;
    let monitor_task = if with_monitor {
        config.cluster.monitor_port = 0;
        let monitor = bind_monitor(&config, &transport, host.clone(), &cancel).await?;
        config.cluster.monitor_port = monitor.port();
        config.cluster.monitor_host = Some(host.clone());
        Some(tokio::spawn(monitor.run()))
    } else {
        config.cluster.monitor_port = 0;
        board = Some(Arc::new(MemoryBoard::new(n)));
        None
    };

    let mut tasks = Vec::with_capacity(n);
    for ordinal in 0..n {
        let rendezvous = build_rendezvous(&config, &transport, board.clone(), &host, &cancel)?;
        let settings = WorkerSettings::from_config(&config, ordinal, host.clone());
        let worker = Worker::new(settings, Arc::clone(&transport), rendezvous, cancel.clone());
        tasks.push(tokio::spawn(worker.run()));
    }
    let aborts: Vec<_> = tasks
        .iter()
        .map(|t| t.abort_handle())
        .chain(monitor_task.as_ref().map(|t| t.abort_handle()))
        .collect();

    let workers = try_join_all(tasks.into_iter().enumerate().map(|(ordinal, task)| {
        settle_role(format!("worker {}", ordinal), task, &cancel)
    }));
    let monitor = async {
        match monitor_task {
            Some(task) => settle_role("monitor".to_string(), task, &cancel).await.map(Some),
            None => Ok(None),
        }
    };

    match tokio::try_join!(workers, monitor) {
        Ok((reports, monitor)) => Ok(InProcessOutcome { reports, monitor }),
        Err(e) => {
            for handle in &aborts {
                handle.abort();
            }
            Err(e)
        }
    }
}

/// Await one role, cancelling the rest of the cluster if it fails
async fn settle_role<T>(
    role: String,
    task: tokio::task::JoinHandle<Result<T>>,
    cancel: &CancellationToken,
) -> Result<T> {
    let result = match task.await {
        Ok(result) => result,
        Err(e) => Err(Error::Internal(format!("{} panicked: {}", role, e))),
    };
    if let Err(e) = &result {
        if !cancel.is_cancelled() {
            warn!(role = %role, error = %e, "Role failed, cancelling the cluster");
        }
        cancel.cancel();
    }
    result
}

/// Print every worker's summary, prefixed by ordinal
pub fn print_reports(reports: &[RunReport]) {
    for report in reports {
        for line in report.summary_lines() {
            println!("{}", line);
        }
    }
}
