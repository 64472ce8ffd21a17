//! Isolated task execution.
//!
//! Tasks run inside a throwaway container: no network, capped cpu and
//! memory, read-only root filesystem, and a hard wall-clock limit
//! enforced from inside the container. The node never interprets task
//! code itself unless the operator explicitly opts into unsandboxed
//! execution.

use std::io::Write;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use skiff_core::protocol::{TaskPayload, TaskResult};
use tokio::process::Command;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container image tasks run in.
    pub image: String,
    /// CPU quota passed to the container runtime.
    pub cpus: f64,
    /// Memory cap, in the runtime's own syntax ("1g").
    pub memory: String,
    /// Open file descriptor limit inside the container.
    pub open_files: u32,
    /// Wall-clock limit for one task.
    pub task_timeout: Duration,
    /// Extra slack before the outer watchdog forcibly kills the
    /// container, covering runtime startup cost.
    pub kill_grace: Duration,
    /// Run tasks directly on the host when no container runtime is
    /// available. Off by default; only for trusted environments.
    pub allow_unsandboxed: bool,
    /// Interpreter for "python_code" tasks.
    pub interpreter: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.11-slim".to_string(),
            cpus: 1.0,
            memory: "1g".to_string(),
            open_files: 256,
            task_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(10),
            allow_unsandboxed: false,
            interpreter: "python3".to_string(),
        }
    }
}

/// Anything that can turn a task into a result. The session driver
/// only sees this trait, which keeps it testable with a stub.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, task: TaskPayload) -> TaskResult;
}

pub struct SandboxExecutor {
    config: SandboxConfig,
    docker_available: bool,
}

impl SandboxExecutor {
    /// Probes for a usable container runtime and builds the executor.
    /// A missing runtime is not fatal: tasks are refused per-request
    /// (or run unsandboxed if the operator opted in).
    pub async fn probe(config: SandboxConfig) -> Self {
        let docker_available = match tokio::time::timeout(
            Duration::from_secs(5),
            Command::new("docker")
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await
        {
            Ok(Ok(status)) => status.success(),
            Ok(Err(_)) | Err(_) => false,
        };
        if docker_available {
            tracing::info!(target = "sandbox", image = %config.image, "container runtime available");
        } else {
            tracing::warn!(
                target = "sandbox",
                allow_unsandboxed = config.allow_unsandboxed,
                "container runtime unavailable"
            );
        }
        Self {
            config,
            docker_available,
        }
    }

    #[cfg(test)]
    pub fn with_availability(config: SandboxConfig, docker_available: bool) -> Self {
        Self {
            config,
            docker_available,
        }
    }

    /// Container invocation for a task script mounted at `guest_path`.
    /// The inner `timeout` enforces the wall-clock limit from inside
    /// the container so the limit applies to the task itself, not to
    /// image pull or container startup.
    fn docker_args(&self, container_name: &str, host_path: &str, guest_path: &str) -> Vec<String> {
        let cfg = &self.config;
        vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            container_name.into(),
            format!("--cpus={}", cfg.cpus),
            format!("--memory={}", cfg.memory),
            "--network=none".into(),
            format!("--ulimit=nofile={}:{}", cfg.open_files, cfg.open_files),
            "--read-only".into(),
            "--tmpfs=/tmp".into(),
            "-v".into(),
            format!("{host_path}:{guest_path}:ro"),
            cfg.image.clone(),
            "timeout".into(),
            cfg.task_timeout.as_secs().to_string(),
            cfg.interpreter.clone(),
            guest_path.into(),
        ]
    }

    async fn run_in_container(&self, code: &str) -> TaskResult {
        let started = Instant::now();
        let script = match write_script(code) {
            Ok(script) => script,
            Err(err) => {
                return TaskResult::unavailable(
                    format!("failed to stage task script: {err}"),
                    started.elapsed().as_secs_f64(),
                );
            }
        };
        let host_path = script.path().display().to_string();
        let container_name = format!("skiff-task-{}", Uuid::new_v4());
        let args = self.docker_args(&container_name, &host_path, "/opt/task.py");

        let child = Command::new("docker")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                return TaskResult::unavailable(
                    format!("failed to launch container: {err}"),
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        // The inner `timeout` should fire first; the outer watchdog
        // only triggers when the container itself wedges.
        let deadline = self.config.task_timeout + self.config.kill_grace;
        let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return TaskResult::unavailable(
                    format!("container wait failed: {err}"),
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(_) => {
                tracing::warn!(target = "sandbox", container = %container_name, "container wedged, killing");
                let _ = Command::new("docker")
                    .args(["kill", &container_name])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                return TaskResult::unavailable(
                    format!(
                        "task exceeded the {}s time limit",
                        self.config.task_timeout.as_secs()
                    ),
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        let elapsed = started.elapsed().as_secs_f64();
        finish(output, self.config.task_timeout, elapsed)
    }

    async fn run_on_host(&self, code: &str) -> TaskResult {
        let started = Instant::now();
        let script = match write_script(code) {
            Ok(script) => script,
            Err(err) => {
                return TaskResult::unavailable(
                    format!("failed to stage task script: {err}"),
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        let child = Command::new(&self.config.interpreter)
            .arg(script.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                return TaskResult::unavailable(
                    format!("failed to launch interpreter: {err}"),
                    started.elapsed().as_secs_f64(),
                );
            }
        };

        let output =
            match tokio::time::timeout(self.config.task_timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => {
                    return TaskResult::unavailable(
                        format!("interpreter wait failed: {err}"),
                        started.elapsed().as_secs_f64(),
                    );
                }
                Err(_) => {
                    return TaskResult::unavailable(
                        format!(
                            "task exceeded the {}s time limit",
                            self.config.task_timeout.as_secs()
                        ),
                        started.elapsed().as_secs_f64(),
                    );
                }
            };

        let elapsed = started.elapsed().as_secs_f64();
        let mut result = finish(output, self.config.task_timeout, elapsed);
        let warning = "warning: executed without isolation (docker unavailable)\n";
        result.stderr = format!("{warning}{}", result.stderr);
        result
    }
}

fn write_script(code: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(code.as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Maps process output to a result. GNU timeout exits 124 when the
/// limit fires, but a task may legitimately exit 124 itself, so 124 is
/// only classified as a timeout when the wall clock actually reached
/// the limit. A signal-killed process has no exit code. Timeouts and
/// signal kills use the reserved -1 exit code, which real task code
/// can never produce.
fn finish(output: std::process::Output, limit: Duration, elapsed: f64) -> TaskResult {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    match output.status.code() {
        Some(124) if elapsed >= limit.as_secs_f64() => TaskResult::unavailable(
            format!("task exceeded the {}s time limit", limit.as_secs()),
            elapsed,
        ),
        Some(code) => TaskResult {
            exit_code: code,
            stdout,
            stderr,
            execution_time: elapsed,
        },
        None => TaskResult::unavailable(format!("task terminated by signal; stderr: {stderr}"), elapsed),
    }
}

#[async_trait]
impl Executor for SandboxExecutor {
    async fn execute(&self, task: TaskPayload) -> TaskResult {
        if task.kind != "python_code" {
            return TaskResult::unavailable(
                format!("unsupported task type \"{}\"", task.kind),
                0.0,
            );
        }
        if self.docker_available {
            self.run_in_container(&task.code).await
        } else if self.config.allow_unsandboxed {
            tracing::warn!(target = "sandbox", "running task without isolation");
            self.run_on_host(&task.code).await
        } else {
            TaskResult::unavailable(
                "isolation runtime unavailable; refusing to execute task".to_string(),
                0.0,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::protocol::EXIT_CODE_UNAVAILABLE;

    fn python_task(code: &str) -> TaskPayload {
        TaskPayload {
            code: code.to_string(),
            kind: "python_code".to_string(),
        }
    }

    #[tokio::test]
    async fn refuses_tasks_when_runtime_missing_and_fallback_disabled() {
        let executor = SandboxExecutor::with_availability(SandboxConfig::default(), false);
        let result = executor.execute(python_task("print('hi')")).await;
        assert_eq!(result.exit_code, EXIT_CODE_UNAVAILABLE);
        assert!(result.stderr.contains("isolation runtime unavailable"));
        assert!(result.stdout.is_empty());
    }

    #[tokio::test]
    async fn rejects_unsupported_task_types() {
        let executor = SandboxExecutor::with_availability(SandboxConfig::default(), true);
        let result = executor
            .execute(TaskPayload {
                code: "ls".to_string(),
                kind: "shell".to_string(),
            })
            .await;
        assert_eq!(result.exit_code, EXIT_CODE_UNAVAILABLE);
        assert!(result.stderr.contains("unsupported task type"));
    }

    #[test]
    fn container_invocation_locks_down_the_task() {
        let executor = SandboxExecutor::with_availability(SandboxConfig::default(), true);
        let args = executor.docker_args("skiff-task-test", "/tmp/abc", "/opt/task.py");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--cpus=1".to_string()));
        assert!(args.contains(&"--memory=1g".to_string()));
        assert!(args.contains(&"--ulimit=nofile=256:256".to_string()));
        assert!(args.contains(&"/tmp/abc:/opt/task.py:ro".to_string()));
        // Wall-clock limit is enforced inside the container.
        let image_pos = args.iter().position(|a| a == "python:3.11-slim").unwrap();
        assert_eq!(args[image_pos + 1], "timeout");
        assert_eq!(args[image_pos + 2], "30");
    }

    #[tokio::test]
    async fn host_fallback_runs_the_task_and_flags_it() {
        let config = SandboxConfig {
            allow_unsandboxed: true,
            interpreter: "sh".to_string(),
            ..SandboxConfig::default()
        };
        let executor = SandboxExecutor::with_availability(config, false);
        let result = executor
            .execute(python_task("echo out; echo err >&2; exit 3"))
            .await;
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert!(result.stderr.starts_with("warning: executed without isolation"));
        assert!(result.stderr.contains("err\n"));
        assert!(result.execution_time >= 0.0);
    }

    #[tokio::test]
    async fn quick_exit_124_is_a_real_exit_code_not_a_timeout() {
        let config = SandboxConfig {
            allow_unsandboxed: true,
            interpreter: "sh".to_string(),
            ..SandboxConfig::default()
        };
        let executor = SandboxExecutor::with_availability(config, false);
        let result = executor.execute(python_task("exit 124")).await;
        assert_eq!(result.exit_code, 124);
        assert!(!result.stderr.contains("time limit"));
    }

    #[test]
    fn exit_124_at_the_limit_is_classified_as_a_timeout() {
        use std::os::unix::process::ExitStatusExt;

        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(124 << 8),
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let result = finish(output, Duration::from_secs(30), 31.0);
        assert_eq!(result.exit_code, EXIT_CODE_UNAVAILABLE);
        assert!(result.stderr.contains("time limit"));
    }

    #[tokio::test]
    async fn host_fallback_enforces_the_time_limit() {
        let config = SandboxConfig {
            allow_unsandboxed: true,
            interpreter: "sh".to_string(),
            task_timeout: Duration::from_millis(300),
            kill_grace: Duration::from_millis(100),
            ..SandboxConfig::default()
        };
        let executor = SandboxExecutor::with_availability(config, false);
        let started = Instant::now();
        let result = executor
            .execute(python_task("while true; do :; done"))
            .await;
        assert_eq!(result.exit_code, EXIT_CODE_UNAVAILABLE);
        assert!(result.stderr.contains("time limit"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
