//! Out-of-process watchdog with escalating signals.
//!
//! The watchdog runs as its own OS process (the `taskmill-watchdog`
//! binary) so it can interrupt the monitored worker even when the worker
//! is blocked in uninterruptible code. Control flows over a loopback UDP
//! socket carrying the literal payloads `start`, `stop`, `reset` and
//! `stop_and_reset`; the watchdog reports its bound port back to the
//! parent as the first line of its stdout pipe.
//!
//! Escalation: once elapsed running time crosses a threshold the matching
//! signal fires exactly once (latched): SIGINT at the soft threshold,
//! SIGABRT at the hard one, SIGKILL at the critical one. A threshold of
//! zero is disabled. `reset` zeroes the elapsed clock and the latches;
//! `stop`/`start` do not, so a soft timeout that already fired stays
//! latched across a stop/start cycle until an explicit reset. The loop
//! exits, after a final SIGKILL, when the monitored pid is gone or has
//! become a zombie.

use crate::{Result, config::TimeoutConfig, error::TaskmillError};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    io::Write,
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::UdpSocket,
    process::{Child, Command},
};
use tracing::{debug, warn};

pub const WATCHDOG_PROGRAM: &str = "taskmill-watchdog";

const CMD_START: &[u8] = b"start";
const CMD_STOP: &[u8] = b"stop";
const CMD_RESET: &[u8] = b"reset";
const CMD_STOP_AND_RESET: &[u8] = b"stop_and_reset";

/// Parameters of one watchdog process.
#[derive(Debug, Clone)]
pub struct WatchdogOptions {
    pub pid: u32,
    pub soft_timeout: f64,
    pub hard_timeout: f64,
    pub critical_timeout: f64,
    pub tick_interval: f64,
}

/// Which stage of the escalation fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Soft,
    Hard,
    Critical,
}

impl Escalation {
    fn signal(self) -> Signal {
        match self {
            Escalation::Soft => Signal::SIGINT,
            Escalation::Hard => Signal::SIGABRT,
            Escalation::Critical => Signal::SIGKILL,
        }
    }
}

/// The watchdog's timer state machine, separated from I/O so the
/// transitions are testable.
#[derive(Debug)]
pub struct WatchdogState {
    options: WatchdogOptions,
    running: bool,
    elapsed: f64,
    soft_raised: bool,
    hard_raised: bool,
    critical_raised: bool,
}

impl WatchdogState {
    pub fn new(options: WatchdogOptions) -> Self {
        Self {
            options,
            running: false,
            elapsed: 0.0,
            soft_raised: false,
            hard_raised: false,
            critical_raised: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Apply one control payload. Unknown payloads are ignored.
    ///
    /// `start` is idempotent: re-starting while already running keeps the
    /// elapsed clock and the latches; only `reset` clears them.
    pub fn handle_command(&mut self, payload: &[u8]) {
        match payload {
            CMD_START => self.running = true,
            CMD_STOP => self.running = false,
            CMD_RESET => self.reset(),
            CMD_STOP_AND_RESET => {
                self.running = false;
                self.reset();
            }
            other => {
                debug!("ignoring unknown watchdog command: {:?}", other);
            }
        }
    }

    fn reset(&mut self) {
        self.elapsed = 0.0;
        self.soft_raised = false;
        self.hard_raised = false;
        self.critical_raised = false;
    }

    /// Advance the clock by `delta` and report which stages crossed their
    /// threshold on this tick. Time accrues only while running; each stage
    /// fires at most once until a reset.
    pub fn tick(&mut self, delta: Duration) -> Vec<Escalation> {
        if !self.running {
            return Vec::new();
        }

        self.elapsed += delta.as_secs_f64();
        let mut fired = Vec::new();

        if self.options.soft_timeout > 0.0
            && !self.soft_raised
            && self.elapsed >= self.options.soft_timeout
        {
            self.soft_raised = true;
            fired.push(Escalation::Soft);
        }

        if self.options.hard_timeout > 0.0
            && !self.hard_raised
            && self.elapsed >= self.options.hard_timeout
        {
            self.hard_raised = true;
            fired.push(Escalation::Hard);
        }

        if self.options.critical_timeout > 0.0
            && !self.critical_raised
            && self.elapsed >= self.options.critical_timeout
        {
            self.critical_raised = true;
            fired.push(Escalation::Critical);
        }

        fired
    }
}

fn send_signal(pid: u32, signal: Signal) {
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), signal) {
        warn!("failed to send {} to pid {}: {}", signal, pid, err);
    }
}

fn monitored_alive(sys: &mut System, pid: u32) -> bool {
    let pid = sysinfo::Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match sys.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// The watchdog process body. Blocks until the monitored process goes
/// away; entered from the `taskmill-watchdog` binary.
pub fn run_watchdog(options: WatchdogOptions) -> std::io::Result<()> {
    let socket = std::net::UdpSocket::bind(("127.0.0.1", 0))?;

    // Port hand-off to the parent over the stdout pipe.
    let port = socket.local_addr()?.port();
    println!("{}", port);
    std::io::stdout().flush()?;

    let tick = Duration::from_secs_f64(options.tick_interval);
    socket.set_read_timeout(Some(tick))?;

    let pid = options.pid;
    let mut state = WatchdogState::new(options);
    let mut sys = System::new();
    let mut buf = [0u8; 64];
    let mut last_tick = Instant::now();

    loop {
        match socket.recv_from(&mut buf) {
            Ok((len, _)) => state.handle_command(&buf[..len]),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err),
        }

        let now = Instant::now();
        for escalation in state.tick(now - last_tick) {
            debug!("escalating {:?} against pid {}", escalation, pid);
            send_signal(pid, escalation.signal());
        }
        last_tick = now;

        if !monitored_alive(&mut sys, pid) {
            // Reap anything that survived in a half-dead state.
            send_signal(pid, Signal::SIGKILL);
            return Ok(());
        }
    }
}

fn resolve_watchdog_program(config: &TimeoutConfig) -> PathBuf {
    if let Some(program) = &config.watchdog_program {
        return program.clone();
    }

    // Installed next to whatever binary is running, which also covers
    // cargo test layouts where the bin lands one directory up.
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(WATCHDOG_PROGRAM);
            if candidate.is_file() {
                return candidate;
            }
            if let Some(parent) = dir.parent() {
                let candidate = parent.join(WATCHDOG_PROGRAM);
                if candidate.is_file() {
                    return candidate;
                }
            }
        }
    }

    PathBuf::from(WATCHDOG_PROGRAM)
}

/// Client handle on a spawned watchdog process.
pub struct ProcessKiller {
    child: Child,
    socket: UdpSocket,
}

impl ProcessKiller {
    /// Spawn a watchdog monitoring `pid` and wait for its port hand-off.
    pub async fn spawn(config: &TimeoutConfig, pid: u32) -> Result<Self> {
        let program = resolve_watchdog_program(config);
        let mut child = Command::new(&program)
            .arg("--pid")
            .arg(pid.to_string())
            .arg("--soft-timeout")
            .arg(config.soft_timeout.to_string())
            .arg("--hard-timeout")
            .arg(config.hard_timeout.to_string())
            .arg("--critical-timeout")
            .arg(config.critical_timeout.to_string())
            .arg("--tick-interval")
            .arg(config.tick_interval.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TaskmillError::Watchdog {
                message: format!("failed to spawn {}: {}", program.display(), err),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| TaskmillError::Watchdog {
            message: "watchdog stdout was not captured".to_string(),
        })?;

        let mut lines = BufReader::new(stdout).lines();
        let port_line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .map_err(|_| TaskmillError::Watchdog {
                message: "timed out waiting for the watchdog port hand-off".to_string(),
            })??
            .ok_or_else(|| TaskmillError::Watchdog {
                message: "watchdog exited before handing off its port".to_string(),
            })?;

        let port: u16 = port_line.trim().parse().map_err(|_| TaskmillError::Watchdog {
            message: format!("invalid watchdog port hand-off: {:?}", port_line),
        })?;

        let socket = UdpSocket::bind(("127.0.0.1", 0)).await?;
        socket.connect(("127.0.0.1", port)).await?;

        debug!("watchdog for pid {} listening on port {}", pid, port);
        Ok(Self { child, socket })
    }

    async fn send(&self, command: &[u8]) -> Result<()> {
        self.socket.send(command).await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.send(CMD_START).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(CMD_STOP).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.send(CMD_RESET).await
    }

    pub async fn stop_and_reset(&self) -> Result<()> {
        self.send(CMD_STOP_AND_RESET).await
    }

    /// Stop the timer and tear the watchdog process down. A watchdog that
    /// already exited on its own is fine.
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.send(CMD_STOP).await;
        let _ = self.child.kill().await;
        Ok(())
    }
}
