//! Permissioned-subprocess backend.
//!
//! Each session gets a private workspace directory. Commands run as child
//! processes rooted there with a scrubbed environment and POSIX resource
//! limits applied before exec.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncReadExt;
use tokio::process::Command as ProcessCommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::exec::{run_captured, run_captured_with_limit, ProcessOutput};
use super::{
    Command, CommandResult, EnvironmentState, EnvironmentStateMachine, ExecutionBackend,
    ExecutionEnvironment, ResourceUsage, RuntimeDescriptor, RuntimeType,
};
use crate::config::{ResourceLimits, SessionConfig};
use crate::error::{Result, SandboxError};
use crate::security::validator::canonicalize;

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const SCRIPT_DIR: &str = ".isolate";
const PACKAGE_DIR: &str = ".packages";

/// How code in one language is run.
#[derive(Debug, Clone)]
pub struct Interpreter {
    pub language: String,
    pub program: String,
    pub extension: String,
}

impl Interpreter {
    pub fn new(language: &str, program: &str, extension: &str) -> Self {
        Self {
            language: language.to_string(),
            program: program.to_string(),
            extension: extension.to_string(),
        }
    }
}

fn default_interpreters() -> Vec<Interpreter> {
    vec![
        Interpreter::new("python", "python3", "py"),
        Interpreter::new("javascript", "node", "js"),
        Interpreter::new("bash", "bash", "sh"),
        Interpreter::new("shell", "sh", "sh"),
    ]
}

pub struct ProcessBackend {
    workspace_base: PathBuf,
    interpreters: Vec<Interpreter>,
    languages: Vec<String>,
}

impl ProcessBackend {
    pub fn new(workspace_base: impl Into<PathBuf>) -> Self {
        Self::with_interpreters(workspace_base, default_interpreters())
    }

    pub fn with_interpreters(
        workspace_base: impl Into<PathBuf>,
        interpreters: Vec<Interpreter>,
    ) -> Self {
        let languages = interpreters
            .iter()
            .map(|i| i.language.to_ascii_lowercase())
            .collect();
        Self {
            workspace_base: workspace_base.into(),
            interpreters,
            languages,
        }
    }

    fn interpreter(&self, language: &str) -> Option<&Interpreter> {
        self.interpreters
            .iter()
            .find(|i| i.language.eq_ignore_ascii_case(language))
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::PermissionedProcess
    }

    fn supported_environments(&self) -> &[String] {
        &self.languages
    }

    async fn is_available(&self, cancel: &CancellationToken) -> bool {
        if tokio::fs::create_dir_all(&self.workspace_base).await.is_err() {
            return false;
        }
        let mut check = ProcessCommand::new("sh");
        check.arg("-c").arg("exit 0");
        matches!(run_captured(check, None, cancel).await, Ok(out) if out.succeeded())
    }

    async fn create_environment(
        &self,
        session_id: &str,
        config: &SessionConfig,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn ExecutionEnvironment>> {
        let interpreter = self.interpreter(&config.language).cloned().ok_or_else(|| {
            SandboxError::RuntimeUnavailable(format!(
                "process backend does not support {}",
                config.language
            ))
        })?;

        let root = self.workspace_base.join(format!("sandbox-{}", session_id));
        if tokio::fs::metadata(&root).await.is_ok() {
            tokio::fs::remove_dir_all(&root).await?;
        }
        tokio::fs::create_dir_all(root.join(SCRIPT_DIR)).await?;
        info!(session_id, root = ?root, "Created process sandbox");

        let env = ProcessEnvironment {
            id: format!("proc-{}", session_id),
            root,
            interpreter,
            limits: config.resource_limits.clone(),
            persist: config.persist_filesystem,
            max_output: config.security.max_output_length,
            state: EnvironmentStateMachine::new(format!("proc-{}", session_id)),
            scripts: AtomicU64::new(0),
        };
        env.state.mark_ready();
        Ok(Box::new(env))
    }

    fn capabilities(&self) -> RuntimeDescriptor {
        RuntimeDescriptor {
            startup_time_ms: 50,
            memory_overhead_mb: 10,
            isolation_level: 3,
            supports_filesystem_persistence: true,
            supports_network_access: true,
            max_concurrent_executions: 10,
        }
    }
}

pub struct ProcessEnvironment {
    id: String,
    root: PathBuf,
    interpreter: Interpreter,
    limits: ResourceLimits,
    persist: bool,
    max_output: usize,
    state: EnvironmentStateMachine,
    scripts: AtomicU64,
}

impl ProcessEnvironment {
    fn command(&self, program: &str) -> ProcessCommand {
        let mut cmd = ProcessCommand::new(program);
        cmd.current_dir(&self.root)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", &self.root)
            .env("PYTHONPATH", self.root.join(PACKAGE_DIR))
            .env("NODE_PATH", self.root.join("node_modules"));
        apply_limits(&mut cmd, &self.limits);
        cmd
    }

    async fn run(&self, cmd: ProcessCommand, cancel: &CancellationToken) -> Result<ProcessOutput> {
        run_captured_with_limit(cmd, None, self.max_output, cancel).await
    }

    /// Map a sandbox path onto the workspace. Relative paths are taken from
    /// the workspace root and absolute paths literally, the same way the
    /// input validator resolves them.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let normalized = canonicalize(path, &self.root);
        if !normalized.starts_with(&self.root) {
            return Err(SandboxError::BackendExecutionFailed(format!(
                "path escapes workspace: {}",
                path
            )));
        }
        Ok(normalized)
    }

    async fn run_code(
        &self,
        code: &str,
        language: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        if let Some(lang) = language {
            if !lang.eq_ignore_ascii_case(&self.interpreter.language) {
                return Ok(CommandResult::failure(format!(
                    "environment runs {}, not {}",
                    self.interpreter.language, lang
                )));
            }
        }
        let n = self.scripts.fetch_add(1, Ordering::Relaxed);
        let script = self
            .root
            .join(SCRIPT_DIR)
            .join(format!("main-{}.{}", n, self.interpreter.extension));
        tokio::fs::write(&script, code).await?;

        let mut cmd = self.command(&self.interpreter.program);
        cmd.arg(&script);
        let output = self.run(cmd, cancel).await;
        let _ = tokio::fs::remove_file(&script).await;
        Ok(output?.into_result())
    }

    async fn install(
        &self,
        packages: &[String],
        manager: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let manager = manager.unwrap_or(match self.interpreter.language.as_str() {
            "javascript" => "npm",
            _ => "pip",
        });
        let mut cmd = match manager {
            "pip" => {
                let mut cmd = self.command("python3");
                cmd.args(["-m", "pip", "install", "--quiet", "--target"])
                    .arg(self.root.join(PACKAGE_DIR));
                cmd
            }
            "npm" => {
                let mut cmd = self.command("npm");
                cmd.args(["install", "--silent", "--prefix"]).arg(&self.root);
                cmd
            }
            other => {
                return Ok(CommandResult::failure(format!(
                    "unsupported package manager: {}",
                    other
                )))
            }
        };
        cmd.args(packages);
        Ok(self.run(cmd, cancel).await?.into_result())
    }

    async fn dispatch(&self, command: &Command, cancel: &CancellationToken) -> Result<CommandResult> {
        match command {
            Command::ExecuteCode { code, language } => {
                self.run_code(code, language.as_deref(), cancel).await
            }
            Command::WriteFile { path, content } => {
                let target = self.resolve(path)?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, content).await?;
                Ok(CommandResult::success(""))
            }
            Command::ReadFile { path } => {
                let target = self.resolve(path)?;
                match read_prefix(&target, self.max_output).await {
                    Ok((kept, total)) => Ok(ProcessOutput {
                        stdout_truncated_from: (total > kept.len()).then_some(total),
                        stdout: String::from_utf8_lossy(&kept).into_owned(),
                        exit_code: Some(0),
                        ..Default::default()
                    }
                    .into_result()),
                    Err(e) => Ok(CommandResult::failure(format!("read {}: {}", path, e))),
                }
            }
            Command::CopyFile {
                source,
                destination,
            } => {
                let from = self.resolve(source)?;
                let to = self.resolve(destination)?;
                if let Some(parent) = to.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                match tokio::fs::copy(&from, &to).await {
                    Ok(_) => Ok(CommandResult::success("")),
                    Err(e) => Ok(CommandResult::failure(format!("copy {}: {}", source, e))),
                }
            }
            Command::CreateDirectory { path } => {
                tokio::fs::create_dir_all(self.resolve(path)?).await?;
                Ok(CommandResult::success(""))
            }
            Command::ShellCommand { command, args } => {
                let mut cmd = self.command(command);
                cmd.args(args);
                Ok(self.run(cmd, cancel).await?.into_result())
            }
            Command::InstallPackages { packages, manager } => {
                self.install(packages, manager.as_deref(), cancel).await
            }
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for ProcessEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime_type(&self) -> RuntimeType {
        RuntimeType::PermissionedProcess
    }

    fn state(&self) -> EnvironmentState {
        self.state.current()
    }

    fn workspace_root(&self) -> &Path {
        &self.root
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
        let root = self.root.clone();
        let disk = tokio::task::spawn_blocking(move || dir_size(&root)).await.ok()?;
        Some(ResourceUsage {
            disk_bytes: Some(disk),
            ..Default::default()
        })
    }

    async fn cleanup(&self) -> Result<()> {
        if !self.state.begin_stop() {
            return Ok(());
        }
        if self.persist {
            self.state.finish_stop();
            info!(env = %self.id, root = ?self.root, "Keeping persistent workspace");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.state.finish_stop();
        info!(env = %self.id, "Removed process sandbox");
        Ok(())
    }
}

impl Drop for ProcessEnvironment {
    fn drop(&mut self) {
        if self.state.begin_stop() && !self.persist {
            if let Err(e) = std::fs::remove_dir_all(&self.root) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(env = %self.id, error = %e, "Failed to remove sandbox on drop");
                }
            }
        }
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// The first `limit` bytes of a file and its full length.
async fn read_prefix(path: &Path, limit: usize) -> std::io::Result<(Vec<u8>, usize)> {
    let file = tokio::fs::File::open(path).await?;
    let total = file.metadata().await?.len() as usize;
    let mut kept = Vec::with_capacity(total.min(limit));
    file.take(limit as u64).read_to_end(&mut kept).await?;
    Ok((kept, total))
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

#[cfg(target_os = "linux")]
fn apply_limits(cmd: &mut ProcessCommand, limits: &ResourceLimits) {
    let limits = limits.clone();
    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || set_resource_limits(&limits).map_err(std::io::Error::from));
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_limits(_cmd: &mut ProcessCommand, _limits: &ResourceLimits) {}

#[cfg(target_os = "linux")]
fn set_resource_limits(limits: &ResourceLimits) -> nix::Result<()> {
    use nix::sys::resource::Resource;

    let cpu_seconds = std::cmp::max(1, limits.cpu_time_ms / 1000);
    lower_limit(Resource::RLIMIT_CPU, cpu_seconds)?;
    lower_limit(Resource::RLIMIT_DATA, limits.memory_mb * 1024 * 1024)?;
    lower_limit(Resource::RLIMIT_FSIZE, limits.max_file_size_kb * 1024)?;
    lower_limit(Resource::RLIMIT_NOFILE, limits.max_open_files)?;
    lower_limit(Resource::RLIMIT_CORE, 0)?;
    lower_limit(Resource::RLIMIT_NPROC, limits.max_processes)?;
    Ok(())
}

/// Set both soft and hard limit, never above the current hard limit.
#[cfg(target_os = "linux")]
fn lower_limit(resource: nix::sys::resource::Resource, value: u64) -> nix::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, hard) = getrlimit(resource)?;
    let value = value.min(hard);
    setrlimit(resource, value, value)
}
