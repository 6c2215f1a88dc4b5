//! Error taxonomy shared by every build component.
//!
//! Configuration and resolution problems surface as [`BuildError`] before any
//! external tool runs. Stage code works in `anyhow` and carries these typed
//! errors inside it, so callers can recover them with `downcast_ref`.

use thiserror::Error;

/// Fatal errors raised while compiling a profile or executing its stages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("failed to parse {document}: {message}")]
    ConfigParse { document: String, message: String },

    #[error("invalid value for `{key_path}` in {document}: {message}")]
    ConfigSchema {
        document: String,
        key_path: String,
        message: String,
    },

    #[error("unknown flavor `{0}` (expected one of: minimal, desktop, server)")]
    UnknownFlavor(String),

    #[error("unknown architecture `{0}` (expected one of: amd64, arm64, armhf, mips, mipsel)")]
    UnknownArchitecture(String),

    #[error("invalid network section `{section}`: {message}")]
    NetworkConfig { section: String, message: String },

    #[error(
        "declared image size {declared} bytes is smaller than the required minimum of {required} bytes"
    )]
    InsufficientSize { declared: u64, required: u64 },

    #[error("stage `{stage}`: `{tool}` {}", exit_description(.exit_code))]
    StageExecution {
        stage: String,
        tool: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("stage `{stage}` cannot start: missing {missing}")]
    StagePrecondition { stage: String, missing: String },

    #[error("bootloader package(s) {} required for {architecture} are not in the resolved package set", .packages.join(", "))]
    MissingBootloader {
        architecture: String,
        packages: Vec<String>,
    },

    #[error("validation rejected the build with {fatal} fatal finding(s)")]
    ValidationFailed { fatal: usize },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("failed with exit code {}", code),
        None => "did not exit normally".to_string(),
    }
}

impl BuildError {
    /// Concrete next step for the operator.
    pub fn remediation(&self) -> String {
        match self {
            BuildError::ConfigParse { document, .. } => {
                format!("fix the syntax error in {}", document)
            }
            BuildError::ConfigSchema {
                document, key_path, ..
            } => format!("set `{}` in {} to a valid value", key_path, document),
            BuildError::UnknownFlavor(_) => {
                "set `build.flavor` to minimal, desktop or server".to_string()
            }
            BuildError::UnknownArchitecture(_) => {
                "set `build.architecture` to amd64, arm64, armhf, mips or mipsel".to_string()
            }
            BuildError::NetworkConfig { section, .. } => {
                format!("fix the `{}` section of the profile", section)
            }
            BuildError::InsufficientSize { required, .. } => format!(
                "raise `build.image_size` to at least {}M",
                required.div_ceil(1024 * 1024)
            ),
            BuildError::StageExecution { stage, stderr, .. } => {
                let mut hint = format!(
                    "fix the tool failure and re-run `fry-builder build`; completed stages are reused and the run resumes at `{}`",
                    stage
                );
                if let Some(line) = stderr.lines().rev().find(|line| !line.trim().is_empty()) {
                    hint.push_str(&format!(" (last tool output: {})", line.trim()));
                }
                hint
            }
            BuildError::StagePrecondition { .. } => {
                "run the earlier stages first with `fry-builder build`".to_string()
            }
            BuildError::MissingBootloader { packages, .. } => format!(
                "add {} to `packages.include` in the profile",
                packages.join(", ")
            ),
            BuildError::ValidationFailed { .. } => {
                "inspect validation.json in the output directory, fix the cause and re-run `fry-builder build`".to_string()
            }
        }
    }
}

/// Severity of a post-build validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fatal,
    Warning,
}

/// One post-build check result. Only `Fatal` findings reject a build.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationFinding {
    pub severity: Severity,
    pub check: String,
    pub message: String,
}

impl ValidationFinding {
    pub fn fatal(check: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            check: check.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(check: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            check: check.to_string(),
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_execution_message_keeps_exit_code() {
        let err = BuildError::StageExecution {
            stage: "bootstrap".to_string(),
            tool: "mmdebstrap".to_string(),
            exit_code: Some(100),
            stdout: String::new(),
            stderr: "E: Unable to locate package foo\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "stage `bootstrap`: `mmdebstrap` failed with exit code 100"
        );
        assert!(err.remediation().contains("resumes at `bootstrap`"));
        assert!(err.remediation().contains("Unable to locate package foo"));
    }

    #[test]
    fn test_insufficient_size_hint_rounds_up() {
        let err = BuildError::InsufficientSize {
            declared: 1024 * 1024 * 1024,
            required: 1536 * 1024 * 1024 + 1,
        };
        assert_eq!(err.remediation(), "raise `build.image_size` to at least 1537M");
    }

    #[test]
    fn test_schema_error_names_key_path() {
        let err = BuildError::ConfigSchema {
            document: "base-config.toml".to_string(),
            key_path: "debian.mirror".to_string(),
            message: "required key is missing".to_string(),
        };
        assert!(err.to_string().contains("`debian.mirror`"));
        assert!(err.remediation().contains("debian.mirror"));
    }
}
