//! Container backend driven through a Docker-compatible CLI.
//!
//! One long-lived container per session (`sleep infinity`), one `exec` per
//! command, `rm -f` on cleanup.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command as ProcessCommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::exec::{run_captured, run_captured_with_limit, ProcessOutput};
use super::{
    Command, CommandResult, EnvironmentState, EnvironmentStateMachine, ExecutionBackend,
    ExecutionEnvironment, ResourceUsage, RuntimeDescriptor, RuntimeType,
};
use crate::config::SessionConfig;
use crate::error::{Result, SandboxError};

const WORKSPACE: &str = "/workspace";

pub struct ContainerBackend {
    binary: String,
    images: HashMap<String, String>,
    languages: Vec<String>,
}

impl ContainerBackend {
    pub fn new(binary: impl Into<String>, images: HashMap<String, String>) -> Self {
        let images: HashMap<String, String> = images
            .into_iter()
            .map(|(lang, image)| (lang.to_ascii_lowercase(), image))
            .collect();
        let mut languages: Vec<String> = images.keys().cloned().collect();
        languages.sort();
        Self {
            binary: binary.into(),
            images,
            languages,
        }
    }

    fn cli(&self) -> ProcessCommand {
        let mut cmd = ProcessCommand::new(&self.binary);
        cmd.stdin(Stdio::null());
        cmd
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn name(&self) -> &str {
        "container"
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Container
    }

    fn supported_environments(&self) -> &[String] {
        &self.languages
    }

    async fn is_available(&self, cancel: &CancellationToken) -> bool {
        let mut check = self.cli();
        check.args(["version", "--format", "{{.Server.Version}}"]);
        match run_captured(check, None, cancel).await {
            Ok(out) if out.succeeded() => true,
            Ok(out) => {
                debug!(stderr = %out.stderr.trim(), "Container engine not reachable");
                false
            }
            Err(_) => false,
        }
    }

    async fn create_environment(
        &self,
        session_id: &str,
        config: &SessionConfig,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ExecutionEnvironment>> {
        let language = config.language.to_ascii_lowercase();
        let image = self.images.get(&language).ok_or_else(|| {
            SandboxError::RuntimeUnavailable(format!(
                "container backend has no image for {}",
                config.language
            ))
        })?;

        let name = format!("isolate-{}", session_id);
        let limits = &config.resource_limits;
        let mut run = self.cli();
        run.args(["run", "-d", "--name", &name, "--network", "none"])
            .arg("--memory")
            .arg(format!("{}m", limits.memory_mb))
            .arg("--pids-limit")
            .arg(limits.max_processes.to_string())
            .arg("--ulimit")
            .arg(format!("nofile={0}:{0}", limits.max_open_files))
            .args(["--workdir", WORKSPACE])
            .arg("--label")
            .arg(format!("isolate.session={}", session_id));
        if config.persist_filesystem {
            run.arg("-v").arg(format!("{}:{}", name, WORKSPACE));
        }
        run.args([image.as_str(), "sleep", "infinity"]);

        let output = match run_captured(run, None, cancel).await {
            Ok(output) => output,
            Err(e) => {
                remove_container(&self.binary, &name).await;
                return Err(e);
            }
        };
        if !output.succeeded() {
            remove_container(&self.binary, &name).await;
            return Err(SandboxError::BackendExecutionFailed(format!(
                "container start failed: {}",
                output.stderr.trim()
            )));
        }
        info!(session_id, container = %name, image = %image, "Started container");

        let env = ContainerEnvironment {
            id: name.clone(),
            binary: self.binary.clone(),
            language,
            persist: config.persist_filesystem,
            max_output: config.security.max_output_length,
            state: EnvironmentStateMachine::new(name),
        };
        env.state.mark_ready();
        Ok(Box::new(env))
    }

    fn capabilities(&self) -> RuntimeDescriptor {
        RuntimeDescriptor {
            startup_time_ms: 2000,
            memory_overhead_mb: 50,
            isolation_level: 8,
            supports_filesystem_persistence: false,
            supports_network_access: false,
            max_concurrent_executions: 5,
        }
    }
}

pub struct ContainerEnvironment {
    id: String,
    binary: String,
    language: String,
    persist: bool,
    max_output: usize,
    state: EnvironmentStateMachine,
}

impl ContainerEnvironment {
    async fn exec(
        &self,
        args: &[&str],
        stdin: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        let mut cmd = ProcessCommand::new(&self.binary);
        cmd.arg("exec");
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.args(["-w", WORKSPACE]).arg(&self.id).args(args);
        run_captured_with_limit(cmd, stdin, self.max_output, cancel).await
    }

    fn interpreter(&self) -> &'static [&'static str] {
        match self.language.as_str() {
            "python" => &["python3", "-"],
            "javascript" => &["node", "-"],
            "bash" => &["bash", "-s"],
            _ => &["sh", "-s"],
        }
    }

    async fn dispatch(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        let output = match command {
            Command::ExecuteCode { code, language } => {
                if let Some(lang) = language {
                    if !lang.eq_ignore_ascii_case(&self.language) {
                        return Ok(CommandResult::failure(format!(
                            "environment runs {}, not {}",
                            self.language, lang
                        )));
                    }
                }
                self.exec(self.interpreter(), Some(code.as_bytes().to_vec()), cancel)
                    .await?
            }
            Command::WriteFile { path, content } => {
                let script = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;
                self.exec(
                    &["sh", "-c", script, "sh", path],
                    Some(content.as_bytes().to_vec()),
                    cancel,
                )
                .await?
            }
            Command::ReadFile { path } => self.exec(&["cat", "--", path], None, cancel).await?,
            Command::CopyFile {
                source,
                destination,
            } => {
                self.exec(&["cp", "--", source, destination], None, cancel)
                    .await?
            }
            Command::CreateDirectory { path } => {
                self.exec(&["mkdir", "-p", "--", path], None, cancel).await?
            }
            Command::ShellCommand { command, args } => {
                let mut argv: Vec<&str> = vec![command.as_str()];
                argv.extend(args.iter().map(String::as_str));
                self.exec(&argv, None, cancel).await?
            }
            Command::InstallPackages { packages, manager } => {
                let manager = manager.as_deref().unwrap_or(match self.language.as_str() {
                    "javascript" => "npm",
                    _ => "pip",
                });
                let mut argv: Vec<&str> = match manager {
                    "pip" => vec!["python3", "-m", "pip", "install", "--quiet", "--user"],
                    "npm" => vec!["npm", "install", "--silent"],
                    other => {
                        return Ok(CommandResult::failure(format!(
                            "unsupported package manager: {}",
                            other
                        )))
                    }
                };
                argv.extend(packages.iter().map(String::as_str));
                self.exec(&argv, None, cancel).await?
            }
        };
        Ok(output.into_result())
    }
}

#[async_trait]
impl ExecutionEnvironment for ContainerEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::Container
    }

    fn state(&self) -> EnvironmentState {
        self.state.current()
    }

    fn workspace_root(&self) -> &Path {
        Path::new(WORKSPACE)
    }

    async fn execute(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        self.state.begin_command()?;
        debug!(env = %self.id, command = %command.summary(), "Executing");
        let result = self.dispatch(command, cancel).await;
        let faulted = matches!(&result, Err(e) if !matches!(e, SandboxError::Cancelled));
        self.state.finish_command(faulted);
        result
    }

    async fn resource_usage(&self) -> Option<ResourceUsage> {
        let mut cmd = ProcessCommand::new(&self.binary);
        cmd.args(["stats", "--no-stream", "--format", "{{.MemUsage}}|{{.PIDs}}"])
            .arg(&self.id);
        let output = run_captured(cmd, None, &CancellationToken::new()).await.ok()?;
        if !output.succeeded() {
            return None;
        }
        parse_stats(output.stdout.trim())
    }

    async fn cleanup(&self) -> Result<()> {
        if !self.state.begin_stop() {
            return Ok(());
        }
        let mut rm = ProcessCommand::new(&self.binary);
        rm.args(["rm", "-f", &self.id]);
        let output = run_captured(rm, None, &CancellationToken::new()).await?;
        if !output.succeeded() && !output.stderr.contains("No such container") {
            return Err(SandboxError::BackendExecutionFailed(format!(
                "container removal failed: {}",
                output.stderr.trim()
            )));
        }
        self.state.finish_stop();
        if self.persist {
            info!(container = %self.id, "Removed container, kept workspace volume");
        } else {
            info!(container = %self.id, "Removed container");
        }
        Ok(())
    }
}

impl Drop for ContainerEnvironment {
    fn drop(&mut self) {
        if self.state.begin_stop() {
            warn!(container = %self.id, "Container dropped without cleanup, removing");
            let _ = std::process::Command::new(&self.binary)
                .args(["rm", "-f", &self.id])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
        }
    }
}

async fn remove_container(binary: &str, name: &str) {
    let mut rm = ProcessCommand::new(binary);
    rm.args(["rm", "-f", name]);
    if let Err(e) = run_captured(rm, None, &CancellationToken::new()).await {
        warn!(container = %name, error = %e, "Failed to remove partial container");
    }
}

/// Parse `"12.5MiB / 512MiB|3"` as printed by `stats --format`.
fn parse_stats(line: &str) -> Option<ResourceUsage> {
    let (mem, pids) = line.split_once('|')?;
    let used = mem.split('/').next()?.trim();
    Some(ResourceUsage {
        memory_bytes: parse_size(used),
        process_count: pids.trim().parse().ok(),
        ..Default::default()
    })
}

fn parse_size(raw: &str) -> Option<u64> {
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let multiplier = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ContainerBackend {
        let images = [("Python", "python:3.12-slim"), ("javascript", "node:20-slim")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ContainerBackend::new("definitely-not-a-container-cli", images)
    }

    #[test]
    fn test_languages_from_images() {
        let backend = backend();
        assert_eq!(backend.supported_environments(), ["javascript", "python"]);
        assert!(backend.supports("PYTHON"));
        assert!(!backend.supports("bash"));
    }

    #[tokio::test]
    async fn test_missing_cli_is_unavailable() {
        assert!(!backend().is_available(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn test_create_fails_without_cli() {
        let result = backend()
            .create_environment(
                "abc",
                &SessionConfig::for_language("python"),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(SandboxError::BackendExecutionFailed(_))));
    }

    /// A CLI stand-in whose first `rm` fails.
    #[cfg(unix)]
    fn flaky_cli(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let marks = dir.display();
        let script = format!(
            "#!/bin/sh\n\
             case \"$1\" in\n\
             rm)\n\
               if [ ! -f {marks}/rm-failed ]; then touch {marks}/rm-failed; echo 'daemon busy' >&2; exit 1; fi\n\
               touch {marks}/removed ;;\n\
             esac\n\
             exit 0\n"
        );
        let path = dir.join("fake-cli");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_removal_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let images = [("python".to_string(), "python:3.12-slim".to_string())]
            .into_iter()
            .collect();
        let backend = ContainerBackend::new(flaky_cli(dir.path()), images);
        let cancel = CancellationToken::new();
        let env = backend
            .create_environment("abc", &SessionConfig::for_language("python"), &cancel)
            .await
            .unwrap();

        assert!(env.cleanup().await.is_err());
        assert_ne!(env.state(), EnvironmentState::Stopped);
        assert!(!dir.path().join("removed").exists());
        let run = Command::ExecuteCode {
            code: "print(1)".into(),
            language: None,
        };
        assert!(matches!(
            env.execute(&run, &cancel).await,
            Err(SandboxError::EnvironmentStopped(_))
        ));

        env.cleanup().await.unwrap();
        assert!(dir.path().join("removed").exists());
        assert_eq!(env.state(), EnvironmentState::Stopped);
    }

    #[test]
    fn test_parse_stats() {
        let usage = parse_stats("12.5MiB / 512MiB|3").unwrap();
        assert_eq!(usage.memory_bytes, Some(13_107_200));
        assert_eq!(usage.process_count, Some(3));
        assert_eq!(parse_size("1.5GB"), Some(1_500_000_000));
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("12 parsecs"), None);
    }
}
