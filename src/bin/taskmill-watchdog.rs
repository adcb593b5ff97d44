//! Out-of-process timeout watchdog.
//!
//! Spawned by the serial executor with the pid of the worker to monitor;
//! prints its UDP control port as the first stdout line and then runs the
//! escalation loop until the monitored process goes away. Not meant to be
//! started by hand.

use clap::Parser;
use taskmill::killer::{WatchdogOptions, run_watchdog};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "taskmill-watchdog",
    about = "Escalating timeout watchdog for taskmill workers"
)]
struct Args {
    /// Pid of the worker process to monitor.
    #[arg(long)]
    pid: u32,

    /// Seconds until the interruptible (SIGINT) stage; 0 disables it.
    #[arg(long, default_value_t = 0.0)]
    soft_timeout: f64,

    /// Seconds until the abort (SIGABRT) stage; 0 disables it.
    #[arg(long, default_value_t = 0.0)]
    hard_timeout: f64,

    /// Seconds until the forceful (SIGKILL) stage; 0 disables it.
    #[arg(long, default_value_t = 0.0)]
    critical_timeout: f64,

    /// Loop tick interval in seconds.
    #[arg(long, default_value_t = 0.1)]
    tick_interval: f64,
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    // Stdout is the port hand-off channel; logs go to stderr only.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .try_init();

    run_watchdog(WatchdogOptions {
        pid: args.pid,
        soft_timeout: args.soft_timeout,
        hard_timeout: args.hard_timeout,
        critical_timeout: args.critical_timeout,
        tick_interval: args.tick_interval.max(0.01),
    })
}
