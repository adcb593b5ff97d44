//! The supervising parent process.
//!
//! Spawns N worker subprocesses, polls them for exit and memory use, and
//! reacts to the worker exit-code contract (see [`crate::worker::exit_code`]):
//! clean completion, internal failure and explicit respawn requests get a
//! replacement process; config-load and handler-not-found are fatal for
//! that worker (respawning cannot fix them); a stop request removes the
//! worker permanently. A worker whose RSS crosses the configured ceiling
//! is killed and respawned no matter what it was doing. Ctrl-C kills all
//! children before returning. The run ends when no children remain.
//!
//! Worker stdout is piped and scanned for the one-line JSON
//! [`RunSummary`]; stderr stays inherited so worker logs flow through.

use crate::{
    Result,
    config::SupervisorConfig,
    worker::{RunSummary, exit_code},
};
use std::process::{ExitStatus, Stdio};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};
use tracing::{error, info, warn};

/// What the supervisor does in response to a worker exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Respawn,
    Remove,
    Fatal,
}

/// Exit-code dispatch. `None` means the worker died to a signal, which is
/// treated like an unknown code: respawn.
pub fn action_for_exit(code: Option<i32>) -> ExitAction {
    match code {
        Some(exit_code::CONFIG_LOAD) | Some(exit_code::HANDLER_NOT_FOUND) => ExitAction::Fatal,
        Some(exit_code::STOP) => ExitAction::Remove,
        Some(exit_code::COMPLETED)
        | Some(exit_code::FAILURE)
        | Some(exit_code::RESPAWN)
        | Some(_)
        | None => ExitAction::Respawn,
    }
}

struct SupervisedWorker {
    child: Child,
    summary: tokio::task::JoinHandle<Option<RunSummary>>,
}

fn spawn_worker(config: &SupervisorConfig) -> Result<SupervisedWorker> {
    let mut child = Command::new(&config.program)
        .args(&config.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()?;

    info!(
        program = %config.program.display(),
        pid = child.id(),
        "spawned worker subprocess"
    );

    // Drain stdout as it comes so a chatty worker cannot block on a full
    // pipe; keep whatever parses as the latest summary.
    let stdout = child.stdout.take();
    let summary = tokio::spawn(async move {
        let mut last = None;
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(parsed) = serde_json::from_str::<RunSummary>(&line) {
                    last = Some(parsed);
                }
            }
        }
        last
    });

    Ok(SupervisedWorker { child, summary })
}

pub struct Supervisor {
    config: SupervisorConfig,
    sys: System,
    workers: Vec<SupervisedWorker>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            sys: System::new(),
            workers: Vec::new(),
        }
    }

    /// Spawn the configured number of workers and babysit them until none
    /// remain or the supervisor itself is interrupted.
    pub async fn run(&mut self) -> Result<()> {
        for _ in 0..self.config.concurrent_workers {
            let worker = spawn_worker(&self.config)?;
            self.workers.push(worker);
        }

        info!(
            workers = self.config.concurrent_workers,
            "supervisor started"
        );

        loop {
            if self.workers.is_empty() {
                info!("no workers left, supervisor exiting");
                return Ok(());
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, killing all workers");
                    self.kill_all().await;
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            self.poll_workers().await;
        }
    }

    async fn poll_workers(&mut self) {
        let mut index = 0;

        while index < self.workers.len() {
            match self.workers[index].child.try_wait() {
                Ok(Some(status)) => {
                    let worker = self.workers.swap_remove(index);
                    let summary = worker.summary.await.ok().flatten();
                    self.handle_exit(status, summary);
                }
                Ok(None) => {
                    let pid = self.workers[index].child.id();
                    if self.over_memory_limit(pid) {
                        let mut worker = self.workers.swap_remove(index);
                        warn!("worker exceeded its memory ceiling, killing it");
                        if let Err(err) = worker.child.kill().await {
                            warn!("failed to kill oversized worker: {}", err);
                        }
                        worker.summary.abort();
                        self.respawn();
                    } else {
                        index += 1;
                    }
                }
                Err(err) => {
                    warn!("failed to poll worker: {}", err);
                    index += 1;
                }
            }
        }
    }

    fn handle_exit(&mut self, status: ExitStatus, summary: Option<RunSummary>) {
        let code = status.code();

        if let Some(summary) = &summary {
            match &summary.error {
                Some(error) => warn!(
                    worker = %summary.worker,
                    exit_code = summary.exit_code,
                    "worker reported: {}",
                    error
                ),
                None => info!(
                    worker = %summary.worker,
                    exit_code = summary.exit_code,
                    "worker summary received"
                ),
            }
        }

        match action_for_exit(code) {
            ExitAction::Respawn => {
                info!(code = ?code, "worker exited, respawning");
                self.respawn();
            }
            ExitAction::Remove => {
                info!("worker requested stop, removed permanently");
            }
            ExitAction::Fatal => {
                error!(
                    code = ?code,
                    "worker failed to even start; not respawning"
                );
            }
        }
    }

    fn respawn(&mut self) {
        match spawn_worker(&self.config) {
            Ok(worker) => self.workers.push(worker),
            Err(err) => error!("failed to respawn worker: {}", err),
        }
    }

    fn over_memory_limit(&mut self, pid: Option<u32>) -> bool {
        let Some(limit_mb) = self.config.max_worker_memory_mb else {
            return false;
        };
        let Some(pid) = pid else {
            return false;
        };

        let pid = Pid::from_u32(pid);
        self.sys
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match self.sys.process(pid) {
            Some(process) => process.memory() / (1024 * 1024) > limit_mb,
            None => false,
        }
    }

    async fn kill_all(&mut self) {
        for worker in &mut self.workers {
            if let Err(err) = worker.child.kill().await {
                warn!("failed to kill worker: {}", err);
            }
            worker.summary.abort();
        }
        self.workers.clear();
    }
}
