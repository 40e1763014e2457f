//! Input validation and output sanitization.
//!
//! Patterns come from [`SecurityConfig`]; the validator only compiles and
//! applies them, so operators extend the deny lists through configuration.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::SecurityConfig;
use crate::error::Result;
use crate::runtime::process::normalize;
use crate::runtime::{Command, CommandResult};

const PACKAGE_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '\n', '\r'];

/// The rule a rejected command violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    EmptyCode,
    CodeTooLong,
    BlockedPattern,
    EmptyPath,
    PathTraversal,
    BlockedPath,
    DisallowedExtension,
    ShellDisabled,
    InvalidPackageName,
    PackageNameTooLong,
}

impl ValidationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationRule::EmptyCode => "empty_code",
            ValidationRule::CodeTooLong => "code_too_long",
            ValidationRule::BlockedPattern => "blocked_pattern",
            ValidationRule::EmptyPath => "empty_path",
            ValidationRule::PathTraversal => "path_traversal",
            ValidationRule::BlockedPath => "blocked_path",
            ValidationRule::DisallowedExtension => "disallowed_extension",
            ValidationRule::ShellDisabled => "shell_disabled",
            ValidationRule::InvalidPackageName => "invalid_package_name",
            ValidationRule::PackageNameTooLong => "package_name_too_long",
        }
    }

    /// Whether the violation looks like an attack rather than a malformed request.
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            ValidationRule::BlockedPattern
                | ValidationRule::PathTraversal
                | ValidationRule::BlockedPath
                | ValidationRule::ShellDisabled
                | ValidationRule::InvalidPackageName
        )
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: ValidationRule,
    pub message: String,
}

impl ValidationError {
    fn new(rule: ValidationRule, message: impl Into<String>) -> Self {
        Self {
            rule,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.message)
    }
}

pub struct InputValidator {
    max_code_length: usize,
    max_output_length: usize,
    max_package_name_length: usize,
    sandbox_filesystem: bool,
    allow_shell_commands: bool,
    code_patterns: Vec<Regex>,
    path_patterns: Vec<Regex>,
    allowed_extensions: Vec<String>,
}

impl InputValidator {
    /// Compile the patterns in `config`. Fails on an invalid regular expression.
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        let code_patterns = config
            .blocked_code_patterns
            .iter()
            .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let path_patterns = config
            .blocked_path_patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let allowed_extensions = config
            .allowed_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        Ok(Self {
            max_code_length: config.max_code_length,
            max_output_length: config.max_output_length,
            max_package_name_length: config.max_package_name_length,
            sandbox_filesystem: config.sandbox_filesystem,
            allow_shell_commands: config.allow_shell_commands,
            code_patterns,
            path_patterns,
            allowed_extensions,
        })
    }

    pub fn validate(
        &self,
        command: &Command,
        workspace_root: &Path,
    ) -> std::result::Result<(), ValidationError> {
        match command {
            Command::ExecuteCode { code, .. } => self.validate_code(code),
            Command::WriteFile { path, .. } | Command::ReadFile { path } => {
                self.validate_path(path, workspace_root, true)
            }
            Command::CopyFile {
                source,
                destination,
            } => {
                self.validate_path(source, workspace_root, true)?;
                self.validate_path(destination, workspace_root, true)
            }
            Command::CreateDirectory { path } => self.validate_path(path, workspace_root, false),
            Command::ShellCommand { command, args } => self.validate_shell(command, args),
            Command::InstallPackages { packages, .. } => self.validate_packages(packages),
        }
    }

    fn validate_code(&self, code: &str) -> std::result::Result<(), ValidationError> {
        if code.trim().is_empty() {
            return Err(ValidationError::new(ValidationRule::EmptyCode, "code is empty"));
        }
        if code.len() > self.max_code_length {
            return Err(ValidationError::new(
                ValidationRule::CodeTooLong,
                format!(
                    "code is {} bytes, limit is {}",
                    code.len(),
                    self.max_code_length
                ),
            ));
        }
        self.check_blocked(code)
    }

    fn validate_shell(&self, command: &str, args: &[String]) -> std::result::Result<(), ValidationError> {
        if !self.allow_shell_commands {
            return Err(ValidationError::new(
                ValidationRule::ShellDisabled,
                "shell commands are disabled for this sandbox",
            ));
        }
        let line = if args.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", command, args.join(" "))
        };
        self.check_blocked(&line)
    }

    fn validate_packages(&self, packages: &[String]) -> std::result::Result<(), ValidationError> {
        if packages.is_empty() {
            return Err(ValidationError::new(
                ValidationRule::InvalidPackageName,
                "no packages given",
            ));
        }
        for name in packages {
            if name.trim().is_empty() {
                return Err(ValidationError::new(
                    ValidationRule::InvalidPackageName,
                    "empty package name",
                ));
            }
            if name.contains(PACKAGE_METACHARACTERS) {
                return Err(ValidationError::new(
                    ValidationRule::InvalidPackageName,
                    format!("package name contains shell metacharacters: {:?}", name),
                ));
            }
            if name.len() > self.max_package_name_length {
                return Err(ValidationError::new(
                    ValidationRule::PackageNameTooLong,
                    format!(
                        "package name is {} chars, limit is {}",
                        name.len(),
                        self.max_package_name_length
                    ),
                ));
            }
        }
        Ok(())
    }

    fn validate_path(
        &self,
        path: &str,
        workspace_root: &Path,
        is_file: bool,
    ) -> std::result::Result<(), ValidationError> {
        if path.trim().is_empty() {
            return Err(ValidationError::new(ValidationRule::EmptyPath, "path is empty"));
        }

        let canonical = canonicalize(path, workspace_root);
        let root = normalize(workspace_root);
        if self.sandbox_filesystem && !canonical.starts_with(&root) {
            return Err(ValidationError::new(
                ValidationRule::PathTraversal,
                format!(
                    "path {} resolves to {} outside workspace {}",
                    path,
                    canonical.display(),
                    root.display()
                ),
            ));
        }

        let canonical_str = canonical.to_string_lossy();
        if let Some(pattern) = self
            .path_patterns
            .iter()
            .find(|re| re.is_match(&canonical_str) || re.is_match(path))
        {
            return Err(ValidationError::new(
                ValidationRule::BlockedPath,
                format!("path {} matches blocked pattern {}", path, pattern.as_str()),
            ));
        }

        if is_file && !self.allowed_extensions.is_empty() {
            let extension = canonical
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_lowercase());
            let allowed = extension
                .as_ref()
                .is_some_and(|ext| self.allowed_extensions.iter().any(|a| a == ext));
            if !allowed {
                return Err(ValidationError::new(
                    ValidationRule::DisallowedExtension,
                    format!(
                        "extension {} is not allowed",
                        extension.as_deref().unwrap_or("(none)")
                    ),
                ));
            }
        }
        Ok(())
    }

    fn check_blocked(&self, text: &str) -> std::result::Result<(), ValidationError> {
        match self.code_patterns.iter().find(|re| re.is_match(text)) {
            Some(pattern) => Err(ValidationError::new(
                ValidationRule::BlockedPattern,
                format!("input matches blocked pattern {}", pattern.as_str()),
            )),
            None => Ok(()),
        }
    }

    /// Cap stdout and stderr at the configured length.
    pub fn sanitize_output(&self, mut result: CommandResult) -> CommandResult {
        if result.metadata.contains_key(OUTPUT_TRUNCATED) {
            // already capped while it was being read
            return result;
        }
        let mut truncated = false;
        if let Some(s) = truncate(&result.stdout, self.max_output_length) {
            result.stdout = s;
            truncated = true;
        }
        if let Some(s) = truncate(&result.stderr, self.max_output_length) {
            result.stderr = s;
            truncated = true;
        }
        if truncated {
            result
                .metadata
                .insert(OUTPUT_TRUNCATED.to_string(), serde_json::Value::Bool(true));
        }
        result
    }
}

const OUTPUT_TRUNCATED: &str = "output_truncated";

/// Resolve `path` against `workspace_root` and remove `.` / `..` lexically.
pub fn canonicalize(path: &str, workspace_root: &Path) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&workspace_root.join(candidate))
    }
}

fn truncate(text: &str, max_chars: usize) -> Option<String> {
    let (cut, _) = text.char_indices().nth(max_chars)?;
    let original = text.chars().count();
    Some(format!(
        "{}\n... [output truncated: original length {} characters]",
        &text[..cut],
        original
    ))
}
