//! Container strategy: one Docker container per session.
//!
//! The container idles on `sleep infinity`; the run is an `exec` inside it.
//! Memory and CPU limits are applied through the container's cgroup, and a
//! kernel OOM kill (exit 137) is reported as a memory violation.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StatsOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, ResourcesUlimits};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::error::ContainerError;
use super::limits::{LimitKind, LimitMonitor, Violation};
use super::network::{allowlist_script, network_mode, NetworkPolicy};
use super::output::BoundedOutput;
use super::session::{RunReport, SandboxCommand, SessionStatus};
use crate::config::StrategyConfig;
use crate::error::PlatformResult;
use crate::pipeline::CancelToken;

/// Label carried by every container this crate creates.
pub(crate) const MANAGED_LABEL: &str = "phaserun.managed";
const WORKSPACE: &str = "/workspace";

pub(crate) fn connect() -> Result<Docker, ContainerError> {
    Docker::connect_with_local_defaults().map_err(|e| {
        ContainerError::docker_unavailable(format!("{e}. Is Docker running?"))
    })
}

enum Ending {
    Finished,
    TimedOut,
    Cancelled,
    Violated(Violation),
}

/// Creates the session container, runs `command` in it and reports.
/// The container name is stored in `container` as soon as it exists so
/// session cleanup can remove it on every path.
pub(crate) async fn run(
    docker: &Docker,
    container: &mut Option<String>,
    session_id: &str,
    limits: &StrategyConfig,
    command: &SandboxCommand,
    timeout: Duration,
    cancel: &CancelToken,
) -> PlatformResult<RunReport> {
    docker
        .ping()
        .await
        .map_err(|e| ContainerError::docker_unavailable(e.to_string()))?;

    let name = format!("phaserun-{session_id}");
    let config = build_container_config(limits, session_id, command.workdir.as_deref())?;

    debug!("Creating container: {}", name);
    docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.clone(),
                platform: None,
            }),
            config,
        )
        .await
        .map_err(|e| match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => ContainerError::image_not_found(limits.image.clone()),
            other => ContainerError::container_failed(format!("create: {other}")),
        })?;
    *container = Some(name.clone());

    docker
        .start_container::<String>(&name, None)
        .await
        .map_err(|e| ContainerError::container_failed(format!("start: {e}")))?;

    if limits.network.policy == NetworkPolicy::Allowlist {
        setup_allowlist(docker, &name, limits).await?;
    }

    let mut env: Vec<String> = vec![format!("PHASERUN_SESSION={session_id}")];
    env.extend(command.env.iter().map(|(k, v)| format!("{k}={v}")));
    let working_dir = if command.workdir.is_some() { WORKSPACE } else { "/tmp" };

    let exec = docker
        .create_exec(
            &name,
            CreateExecOptions {
                cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.script.clone()]),
                env: Some(env),
                working_dir: Some(working_dir.to_string()),
                attach_stdin: Some(command.stdin.is_some()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| ContainerError::container_failed(format!("exec: {e}")))?;

    let StartExecResults::Attached {
        output: mut stream,
        input: mut stdin,
    } = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| ContainerError::container_failed(format!("start exec: {e}")))?
    else {
        return Err(ContainerError::container_failed("exec started detached").into());
    };

    if let Some(input) = command.stdin.clone() {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("Container stdin closed early: {}", e);
            }
            let _ = stdin.shutdown().await;
        });
    }

    let mut stdout = BoundedOutput::new(limits.output_limit_bytes);
    let mut stderr = BoundedOutput::new(limits.output_limit_bytes);
    let mut monitor = LimitMonitor::new(limits);
    let mut last_cpu: Option<(u64, Instant)> = None;
    let mut ticker = tokio::time::interval(limits.sample_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let ending = loop {
        tokio::select! {
            chunk = stream.next() => match chunk {
                Some(Ok(LogOutput::StdOut { message })) => stdout.push(&message),
                Some(Ok(LogOutput::StdErr { message })) => stderr.push(&message),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Error reading exec output: {}", e);
                    break Ending::Finished;
                }
                None => break Ending::Finished,
            },
            () = &mut deadline => break Ending::TimedOut,
            () = cancel.cancelled() => break Ending::Cancelled,
            _ = ticker.tick() => {
                if let Some((core_pct, memory_mb)) = sample(docker, &name, &mut last_cpu).await {
                    if let Some(violation) = monitor.observe(core_pct, memory_mb) {
                        break Ending::Violated(violation);
                    }
                }
            }
        }
    };

    if !matches!(ending, Ending::Finished) {
        let killed = docker
            .kill_container(&name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await;
        if let Err(e) = killed {
            warn!(container = %name, "Failed to kill container: {}", e);
        }
    }

    let exit_code = docker
        .inspect_exec(&exec.id)
        .await
        .ok()
        .and_then(|inspect| inspect.exit_code)
        .and_then(|code| i32::try_from(code).ok());

    let (outcome, cancelled, violation) = match ending {
        Ending::Finished => match (exit_code, limits.memory_limit_mb) {
            (Some(137), Some(limit)) => {
                let limit = limit as f64;
                warn!(container = %name, "Container run was OOM killed");
                (
                    SessionStatus::Violation,
                    false,
                    Some(Violation {
                        limit: LimitKind::Memory,
                        observed: monitor.peak_memory_mb().max(limit),
                        threshold: limit,
                    }),
                )
            }
            _ => (SessionStatus::Completed, false, None),
        },
        Ending::TimedOut => (SessionStatus::TimedOut, false, None),
        Ending::Cancelled => (SessionStatus::TimedOut, true, None),
        Ending::Violated(violation) => (SessionStatus::Violation, false, Some(violation)),
    };

    let (stdout, stdout_dropped) = stdout.into_parts();
    let (stderr, stderr_dropped) = stderr.into_parts();
    info!(container = %name, %outcome, ?exit_code, "Container execution finished");
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

fn build_container_config(
    limits: &StrategyConfig,
    session_id: &str,
    workdir: Option<&Path>,
) -> Result<ContainerConfig<String>, ContainerError> {
    let mut binds = Vec::new();
    if let Some(dir) = workdir {
        binds.push(format!("{}:{WORKSPACE}:rw", dir.display()));
    }
    for mount in &limits.mounts {
        let host_path = expand_path(&mount.host)?;
        let mode = if mount.readonly { "ro" } else { "rw" };
        binds.push(format!("{}:{}:{}", host_path, mount.container, mode));
    }

    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    let nano_cpus = (limits.hard_cpu_limit_pct / 100.0 * cores as f64 * 1_000_000_000.0) as i64;
    let memory = limits
        .memory_limit_mb
        .and_then(|mb| i64::try_from(mb * 1024 * 1024).ok());

    let mut host_config = HostConfig {
        binds: Some(binds),
        memory,
        memory_swap: memory,
        nano_cpus: Some(nano_cpus),
        dns: Some(limits.network.dns.clone()),
        network_mode: network_mode(limits.network.policy),
        ..Default::default()
    };
    if let Some(n) = limits.max_open_files {
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        host_config.ulimits = Some(vec![ResourcesUlimits {
            name: Some("nofile".to_string()),
            soft: Some(n),
            hard: Some(n),
        }]);
    }
    if limits.network.policy == NetworkPolicy::Allowlist {
        host_config.cap_add = Some(vec!["NET_ADMIN".to_string()]);
    }

    Ok(ContainerConfig {
        image: Some(limits.image.clone()),
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        working_dir: Some(WORKSPACE.to_string()),
        labels: Some(HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            ("phaserun.session".to_string(), session_id.to_string()),
        ])),
        host_config: Some(host_config),
        ..Default::default()
    })
}

async fn setup_allowlist(
    docker: &Docker,
    name: &str,
    limits: &StrategyConfig,
) -> Result<(), ContainerError> {
    let script = allowlist_script(&limits.network.allowed, &limits.network.dns);
    let exec = docker
        .create_exec(
            name,
            CreateExecOptions {
                cmd: Some(vec!["sh".to_string(), "-c".to_string(), script]),
                user: Some("root".to_string()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| ContainerError::network_setup_failed(e.to_string()))?;

    let mut errors = String::new();
    if let StartExecResults::Attached { mut output, .. } = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| ContainerError::network_setup_failed(e.to_string()))?
    {
        while let Some(chunk) = output.next().await {
            if let Ok(LogOutput::StdErr { message }) = chunk {
                errors.push_str(&String::from_utf8_lossy(&message));
            }
        }
    }

    let code = docker
        .inspect_exec(&exec.id)
        .await
        .map_err(|e| ContainerError::network_setup_failed(e.to_string()))?
        .exit_code;
    if code != Some(0) {
        return Err(ContainerError::network_setup_failed(format!(
            "allowlist script exited with {code:?}: {}",
            errors.trim()
        )));
    }
    debug!(container = %name, domains = limits.network.allowed.len(), "Applied network allowlist");
    Ok(())
}

/// One-shot stats read: (percent of one core, memory MB).
async fn sample(
    docker: &Docker,
    name: &str,
    last_cpu: &mut Option<(u64, Instant)>,
) -> Option<(f64, f64)> {
    let mut stats = docker.stats(
        name,
        Some(StatsOptions {
            stream: false,
            one_shot: true,
        }),
    );
    let stats = stats.next().await?.ok()?;
    let now = Instant::now();
    let total = stats.cpu_stats.cpu_usage.total_usage;
    let core_pct = match *last_cpu {
        Some((previous, at)) => {
            let elapsed_ns = now.duration_since(at).as_nanos() as f64;
            if elapsed_ns > 0.0 {
                total.saturating_sub(previous) as f64 / elapsed_ns * 100.0
            } else {
                0.0
            }
        }
        None => 0.0,
    };
    *last_cpu = Some((total, now));
    let memory_mb = stats.memory_stats.usage.unwrap_or(0) as f64 / (1024.0 * 1024.0);
    Some((core_pct, memory_mb))
}

/// Force-removes containers left behind by an earlier process.
pub(crate) async fn cleanup_orphaned(docker: &Docker) -> Result<usize, ContainerError> {
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([(
                "label".to_string(),
                vec![format!("{MANAGED_LABEL}=true")],
            )]),
            ..Default::default()
        }))
        .await
        .map_err(|e| ContainerError::docker_unavailable(e.to_string()))?;

    let mut removed = 0;
    for id in containers.into_iter().filter_map(|c| c.id) {
        let result = docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(container = %id, "Failed to remove orphaned container: {}", e),
        }
    }
    if removed > 0 {
        info!(removed, "Removed orphaned sandbox containers");
    }
    Ok(removed)
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> Result<String, ContainerError> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir().ok_or_else(|| {
                ContainerError::container_failed("could not determine home directory for mount")
            })?;
            Ok(home.join(rest).display().to_string())
        }
        None => Ok(path.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mount, NetworkConfig};

    fn strategy() -> StrategyConfig {
        StrategyConfig {
            memory_limit_mb: Some(512),
            max_open_files: Some(256),
            mounts: vec![Mount {
                host: "/opt/cache".to_string(),
                container: "/cache".to_string(),
                readonly: true,
            }],
            ..StrategyConfig::default()
        }
    }

    #[test]
    fn test_container_config_applies_limits() {
        let config =
            build_container_config(&strategy(), "sbx-1", Some(Path::new("/src/project"))).unwrap();
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert!(host.nano_cpus.unwrap() > 0);
        let binds = host.binds.unwrap();
        assert_eq!(binds[0], "/src/project:/workspace:rw");
        assert_eq!(binds[1], "/opt/cache:/cache:ro");
        let ulimit = &host.ulimits.unwrap()[0];
        assert_eq!(ulimit.name.as_deref(), Some("nofile"));
        assert_eq!(ulimit.hard, Some(256));
        assert_eq!(
            config.labels.unwrap().get(MANAGED_LABEL).map(String::as_str),
            Some("true")
        );
        assert_eq!(host.network_mode, None);
    }

    #[test]
    fn test_deny_policy_disables_network() {
        let limits = StrategyConfig {
            network: NetworkConfig {
                policy: NetworkPolicy::Deny,
                ..NetworkConfig::default()
            },
            ..StrategyConfig::default()
        };
        let host = build_container_config(&limits, "sbx-2", None)
            .unwrap()
            .host_config
            .unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert!(host.binds.unwrap().is_empty());
    }

    #[test]
    fn test_allowlist_grants_net_admin() {
        let limits = StrategyConfig {
            network: NetworkConfig {
                policy: NetworkPolicy::Allowlist,
                allowed: vec!["github.com".to_string()],
                ..NetworkConfig::default()
            },
            ..StrategyConfig::default()
        };
        let host = build_container_config(&limits, "sbx-3", None)
            .unwrap()
            .host_config
            .unwrap();
        assert_eq!(host.cap_add, Some(vec!["NET_ADMIN".to_string()]));
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/usr/bin").unwrap(), "/usr/bin");
        if dirs::home_dir().is_some() {
            let expanded = expand_path("~/.ssh").unwrap();
            assert!(!expanded.starts_with('~'));
            assert!(expanded.ends_with("/.ssh"));
        }
    }
}
