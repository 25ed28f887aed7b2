//! Subprocess strategy: `sh -c` in a fresh process group.
//!
//! The group is sampled from `/proc` on every tick and killed as a whole on
//! timeout, cancellation, a limit breach and after normal exit, so no
//! descendant outlives the run.

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::limits::{LimitMonitor, Violation};
use super::output::{read_bounded, BoundedOutput};
use super::sampler::GroupSampler;
use super::session::{RunReport, SandboxCommand, SessionStatus};
use crate::config::StrategyConfig;
use crate::error::{PlatformError, PlatformResult};
use crate::pipeline::CancelToken;

/// How long output readers may take to drain after the group is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    Violated(Violation),
}

/// Sends SIGKILL to the whole process group when dropped.
struct GroupGuard {
    pgid: Pid,
}

impl GroupGuard {
    fn kill(&self) {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = self.pgid.as_raw(), "Failed to kill process group: {}", e),
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

pub(crate) async fn run(
    session_id: &str,
    limits: &StrategyConfig,
    scratch: &Path,
    command: &SandboxCommand,
    timeout: Duration,
    cancel: &CancelToken,
) -> PlatformResult<RunReport> {
    let script = match limits.max_open_files {
        Some(n) => format!("ulimit -n {n} || exit 126\n{}", command.script),
        None => command.script.clone(),
    };
    let workdir = command.workdir.as_deref().unwrap_or(scratch);

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&script)
        .current_dir(workdir)
        .env("PHASERUN_SESSION", session_id)
        .env("PHASERUN_SCRATCH", scratch)
        .env("TMPDIR", scratch)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        PlatformError::sandbox(format!(
            "failed to spawn sandbox shell in {}: {e}",
            workdir.display()
        ))
    })?;
    let pid = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .ok_or_else(|| PlatformError::sandbox("sandbox shell exited before it could be tracked"))?;
    let pgid = Pid::from_raw(pid);
    let group = GroupGuard { pgid };
    debug!(session = session_id, pgid = pid, "Spawned sandbox process group");

    if let (Some(input), Some(mut stdin)) = (command.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("Sandbox stdin closed early: {}", e);
            }
        });
    }

    let limit = limits.output_limit_bytes;
    let mut stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(read_bounded(out, limit)));
    let mut stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(read_bounded(err, limit)));

    let mut sampler = GroupSampler::new(pgid);
    let mut monitor = LimitMonitor::new(limits);
    let mut ticker = tokio::time::interval(limits.sample_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let ending = loop {
        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => break Ending::Exited(status),
                    Err(e) => return Err(PlatformError::sandbox(format!("failed to wait for sandbox shell: {e}"))),
                }
            }
            () = &mut deadline => break Ending::TimedOut,
            () = cancel.cancelled() => break Ending::Cancelled,
            _ = ticker.tick() => {
                let usage = sampler.sample();
                if let Some(violation) = monitor.observe(usage.cpu_pct, usage.memory_mb) {
                    break Ending::Violated(violation);
                }
            }
        }
    };

    group.kill();
    let status = match &ending {
        Ending::Exited(status) => Some(*status),
        _ => child.wait().await.ok(),
    };
    let exit_code = status.and_then(|s| s.code().or_else(|| s.signal().map(|sig| 128 + sig)));

    let (stdout, stdout_dropped) = drain(&mut stdout_task).await.into_parts();
    let (stderr, stderr_dropped) = drain(&mut stderr_task).await.into_parts();

    let (outcome, cancelled, violation) = match ending {
        Ending::Exited(_) => (SessionStatus::Completed, false, None),
        Ending::TimedOut => {
            warn!(session = session_id, timeout_ms = timeout.as_millis() as u64, "Sandbox run timed out");
            (SessionStatus::TimedOut, false, None)
        }
        Ending::Cancelled => (SessionStatus::TimedOut, true, None),
        Ending::Violated(violation) => {
            warn!(session = session_id, %violation, "Sandbox run breached a hard limit");
            (SessionStatus::Violation, false, Some(violation))
        }
    };

    Ok(RunReport {
        outcome,
        exit_code,
        stdout,
        stderr,
        stdout_dropped,
        stderr_dropped,
        peak_cpu_pct: monitor.peak_cpu_pct(),
        peak_memory_mb: monitor.peak_memory_mb(),
        cancelled,
        violation,
    })
}

async fn drain(task: &mut Option<JoinHandle<BoundedOutput>>) -> BoundedOutput {
    let Some(handle) = task.as_mut() else {
        return BoundedOutput::new(0);
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut *handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            BoundedOutput::new(0)
        }
        Err(_) => {
            handle.abort();
            warn!("Output reader did not finish; a process outside the group holds the pipe");
            BoundedOutput::new(0)
        }
    }
}
