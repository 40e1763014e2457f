//! Commands passed through to execution environments, and their results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A unit of work submitted to a sandbox.
///
/// The orchestration layer only looks at the kind of command (for validation
/// dispatch and audit categorization); execution semantics belong to the
/// backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    ExecuteCode {
        code: String,
        #[serde(default)]
        language: Option<String>,
    },
    WriteFile {
        path: String,
        content: String,
    },
    ReadFile {
        path: String,
    },
    CopyFile {
        source: String,
        destination: String,
    },
    CreateDirectory {
        path: String,
    },
    ShellCommand {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    InstallPackages {
        packages: Vec<String>,
        #[serde(default)]
        manager: Option<String>,
    },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ExecuteCode { .. } => CommandKind::Code,
            Command::WriteFile { .. }
            | Command::ReadFile { .. }
            | Command::CopyFile { .. }
            | Command::CreateDirectory { .. } => CommandKind::File,
            Command::ShellCommand { .. } => CommandKind::Shell,
            Command::InstallPackages { .. } => CommandKind::Package,
        }
    }

    /// Short human-readable summary used in logs and audit descriptions.
    pub fn summary(&self) -> String {
        match self {
            Command::ExecuteCode { code, .. } => format!("execute code ({} chars)", code.len()),
            Command::WriteFile { path, content } => {
                format!("write file {} ({} bytes)", path, content.len())
            }
            Command::ReadFile { path } => format!("read file {}", path),
            Command::CopyFile {
                source,
                destination,
            } => format!("copy {} -> {}", source, destination),
            Command::CreateDirectory { path } => format!("create directory {}", path),
            Command::ShellCommand { command, args } => {
                if args.is_empty() {
                    format!("shell: {}", command)
                } else {
                    format!("shell: {} {}", command, args.join(" "))
                }
            }
            Command::InstallPackages { packages, .. } => {
                format!("install packages: {}", packages.join(", "))
            }
        }
    }
}

/// Coarse command category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Code,
    File,
    Shell,
    Package,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Code => "code",
            CommandKind::File => "file",
            CommandKind::Shell => "shell",
            CommandKind::Package => "package",
        };
        f.write_str(name)
    }
}

/// Why the security pipeline refused to run a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    RateLimited { retry_after_secs: u64, remaining: u32 },
    ValidationFailed { rule: String, message: String },
}

impl Rejection {
    pub fn into_error(self) -> crate::SandboxError {
        match self {
            Rejection::RateLimited {
                retry_after_secs,
                remaining,
            } => crate::SandboxError::RateLimited {
                retry_after_secs,
                remaining,
            },
            Rejection::ValidationFailed { rule, message } => crate::SandboxError::ValidationFailed {
                rule,
                reason: message,
            },
        }
    }
}

/// Result of running a command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CommandResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            exit_code: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn rejected(rejection: Rejection) -> Self {
        let error = match &rejection {
            Rejection::RateLimited {
                retry_after_secs, ..
            } => format!("rate limit exceeded, retry after {}s", retry_after_secs),
            Rejection::ValidationFailed { message, .. } => message.clone(),
        };
        Self {
            success: false,
            error: Some(error),
            rejection: Some(rejection),
            ..Default::default()
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

/// Best-effort resource usage snapshot of one environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub disk_bytes: Option<u64>,
    pub process_count: Option<u32>,
}
