//! OS processes backing components.

use crate::context::{LaunchStatus, OrchestratorContext};
use crate::registry::ComponentState;
use crate::startup::StartFn;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TERMINATE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// Exit code; `-1` when the process was ended by a signal
    Exited(i32),
}

pub trait ProcessHandle: Send {
    fn poll(&mut self) -> io::Result<ProcessStatus>;

    /// Ask the process to exit
    fn terminate(&mut self) -> io::Result<()>;

    fn kill(&mut self) -> io::Result<()>;

    fn pid(&self) -> Option<u32>;
}

/// A spawned child process
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn spawn(command: &str, args: &[String]) -> io::Result<Self> {
        let child = Command::new(command)
            .args(args)
            .kill_on_drop(true)
            .spawn()?;
        debug!("Spawned {} {:?} (pid {:?})", command, args, child.id());
        Ok(Self { child })
    }
}

impl ProcessHandle for ChildProcess {
    fn poll(&mut self) -> io::Result<ProcessStatus> {
        Ok(match self.child.try_wait()? {
            Some(status) => ProcessStatus::Exited(status.code().unwrap_or(-1)),
            None => ProcessStatus::Running,
        })
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // already reaped
            return Ok(());
        };
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Terminate, wait up to `grace` polling every 100 ms, then kill
pub async fn terminate_gracefully(
    mut handle: Box<dyn ProcessHandle>,
    grace: Duration,
) -> ProcessStatus {
    let pid = handle.pid();
    if let Err(e) = handle.terminate() {
        warn!("Failed to terminate process {:?}: {}", pid, e);
    }

    let deadline = Instant::now() + grace;
    loop {
        match handle.poll() {
            Ok(ProcessStatus::Exited(code)) => {
                debug!("Process {:?} exited with {}", pid, code);
                return ProcessStatus::Exited(code);
            }
            Ok(ProcessStatus::Running) => {}
            Err(e) => warn!("Failed to poll process {:?}: {}", pid, e),
        }

        if Instant::now() >= deadline {
            break;
        }
        sleep(TERMINATE_POLL).await;
    }

    warn!("Process {:?} ignored terminate, killing", pid);
    if let Err(e) = handle.kill() {
        error!("Failed to kill process {:?}: {}", pid, e);
    }
    handle.poll().unwrap_or(ProcessStatus::Running)
}

/// Start function that spawns `command` and tracks it under `id`.
///
/// Succeeds when the process is still alive after `settle`.
pub fn command_start_fn(
    ctx: Arc<OrchestratorContext>,
    id: &str,
    command: &str,
    args: Vec<String>,
    settle: Duration,
) -> StartFn {
    let id = id.to_string();
    let command = command.to_string();

    StartFn::from_async(move || {
        spawn_and_settle(
            Arc::clone(&ctx),
            id.clone(),
            command.clone(),
            args.clone(),
            settle,
        )
    })
}

async fn spawn_and_settle(
    ctx: Arc<OrchestratorContext>,
    id: String,
    command: String,
    args: Vec<String>,
    settle: Duration,
) -> anyhow::Result<bool> {
    let mut process = ChildProcess::spawn(&command, &args)?;
    sleep(settle).await;

    match process.poll()? {
        ProcessStatus::Running => {
            info!("{} running as pid {:?}", id, process.pid());
            ctx.track_process(&id, Box::new(process));
            Ok(true)
        }
        ProcessStatus::Exited(code) => {
            anyhow::bail!("{} exited with code {} during startup", command, code)
        }
    }
}

/// Watches tracked processes and folds their exits into the registry
pub struct ProcessMonitor {
    ctx: Arc<OrchestratorContext>,
    interval: Duration,
}

impl ProcessMonitor {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        let interval = Duration::from_millis(ctx.config().process.poll_interval_ms);
        Self { ctx, interval }
    }

    /// Poll every tracked process once; returns the exits observed
    pub fn check_once(&self) -> Vec<(String, i32)> {
        let exited: Vec<(String, i32)> = self.ctx.with_processes(|processes| {
            let mut exited = Vec::new();
            for (id, handle) in processes.iter_mut() {
                match handle.poll() {
                    Ok(ProcessStatus::Exited(code)) => exited.push((id.clone(), code)),
                    Ok(ProcessStatus::Running) => {}
                    Err(e) => warn!("Failed to poll process of {}: {}", id, e),
                }
            }
            for (id, _) in &exited {
                processes.remove(id);
            }
            exited
        });

        for (id, code) in &exited {
            self.ctx.with_state(|s| {
                if *code == 0 {
                    info!("Process of {} exited cleanly", id);
                    s.registry
                        .update_state(id, ComponentState::Stopping, "process exited");
                    s.registry
                        .update_state(id, ComponentState::Inactive, "process exited");
                    s.set_launch_status(id, LaunchStatus::Stopped);
                } else {
                    let reason = format!("process exited with code {}", code);
                    error!("Process of {} failed: {}", id, reason);
                    s.registry.escalate_to_failed(id, &reason);
                    s.set_launch_status(id, LaunchStatus::Failed);
                }
            });
        }

        exited
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Process monitor started (interval {:?})", self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.interval) => {
                    self.check_once();
                }
            }
        }
        info!("Process monitor stopped");
    }
}
