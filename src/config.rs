//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// External script compiler invocation.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CompilerConfig {
    /// Compiler binary.
    pub cli: String,
    /// Arguments passed before the generated ones.
    #[serde(default)]
    pub args: Vec<String>,
    /// Upper bound on a single compilation.
    #[serde(default = "default_compile_timeout")]
    pub timeout_seconds: u64,
}

/// Host attach tool invocation.
///
/// `args` may contain the placeholders `{pid}`, `{agent}`, `{port}`,
/// `{options}` and `{aux}`; they are substituted per attach.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AttachConfig {
    /// Attach binary (e.g., `jattach`).
    pub cli: String,
    /// Argument template.
    #[serde(default = "default_attach_args")]
    pub args: Vec<String>,
    /// Upper bound on a single attach.
    #[serde(default = "default_attach_timeout")]
    pub timeout_seconds: u64,
}

/// Delays and fallbacks used by the start/stop sequences.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimingConfig {
    /// Pause between a successful attach and payload submission.
    #[serde(default = "default_attach_settle_millis")]
    pub attach_settle_millis: u64,
    /// Pause between sending exit and closing the channel.
    #[serde(default = "default_exit_settle_millis")]
    pub exit_settle_millis: u64,
    /// Bound on agent silence after attach; 0 means wait indefinitely.
    #[serde(default)]
    pub ready_timeout_seconds: u64,
    /// Port used when no free local port can be probed.
    #[serde(default = "default_fallback_port")]
    pub fallback_port: u16,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            attach_settle_millis: default_attach_settle_millis(),
            exit_settle_millis: default_exit_settle_millis(),
            ready_timeout_seconds: 0,
            fallback_port: default_fallback_port(),
        }
    }
}

impl TimingConfig {
    /// Attach settle delay as a [`Duration`].
    #[must_use]
    pub fn attach_settle(&self) -> Duration {
        Duration::from_millis(self.attach_settle_millis)
    }

    /// Exit settle delay as a [`Duration`].
    #[must_use]
    pub fn exit_settle(&self) -> Duration {
        Duration::from_millis(self.exit_settle_millis)
    }

    /// Ready timeout, or `None` when unbounded.
    #[must_use]
    pub fn ready_timeout(&self) -> Option<Duration> {
        (self.ready_timeout_seconds > 0).then(|| Duration::from_secs(self.ready_timeout_seconds))
    }
}

/// Agent-side debug and class-dump switches forwarded on attach.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TraceSettings {
    /// Verbose agent logging.
    #[serde(default)]
    pub debug: bool,
    /// Dump instrumented classes to disk.
    #[serde(default)]
    pub dump_classes: bool,
    /// Directory receiving dumped classes.
    #[serde(default)]
    pub dump_class_path: Option<PathBuf>,
}

/// Target process eligibility rules.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EligibilityConfig {
    /// Regex the target's command line must match; empty disables the check.
    #[serde(default = "default_command_pattern")]
    pub command_pattern: String,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            command_pattern: default_command_pattern(),
        }
    }
}

/// Ambient toolchain properties of the engine host.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ToolchainConfig {
    /// Runtime home used when the task snapshot yields nothing usable.
    /// Falls back to `JAVA_HOME` when unset.
    #[serde(default)]
    pub java_home: Option<PathBuf>,
}

fn default_compile_timeout() -> u64 {
    60
}

fn default_attach_timeout() -> u64 {
    30
}

fn default_attach_args() -> Vec<String> {
    ["{pid}", "load", "instrument", "false", "{agent}={options}"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

fn default_attach_settle_millis() -> u64 {
    200
}

fn default_exit_settle_millis() -> u64 {
    300
}

fn default_fallback_port() -> u16 {
    3456
}

fn default_command_pattern() -> String {
    "java".into()
}

fn default_agent_artifact() -> String {
    "trace-agent.jar".into()
}

fn default_client_artifact() -> String {
    "trace-client.jar".into()
}

fn default_ipc_name() -> String {
    "trace-engine".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directories searched for installed artifacts, in order.
    pub artifact_dirs: Vec<PathBuf>,
    /// File name of the agent artifact.
    #[serde(default = "default_agent_artifact")]
    pub agent_artifact: String,
    /// File name of the client artifact handed to the compiler.
    #[serde(default = "default_client_artifact")]
    pub client_artifact: String,
    /// Named pipe / Unix socket identifier.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Script compiler invocation.
    pub compiler: CompilerConfig,
    /// Attach tool invocation.
    pub attach: AttachConfig,
    /// Start/stop delays.
    #[serde(default)]
    pub timings: TimingConfig,
    /// Agent debug switches.
    #[serde(default)]
    pub trace: TraceSettings,
    /// Eligibility rules.
    #[serde(default)]
    pub eligibility: EligibilityConfig,
    /// Host toolchain properties.
    #[serde(default)]
    pub toolchain: ToolchainConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Runtime home of the engine host: configured value, then `JAVA_HOME`.
    #[must_use]
    pub fn ambient_java_home(&self) -> Option<PathBuf> {
        self.toolchain
            .java_home
            .clone()
            .or_else(|| std::env::var_os("JAVA_HOME").map(PathBuf::from))
    }

    fn validate(&mut self) -> Result<()> {
        if self.artifact_dirs.is_empty() {
            return Err(AppError::Config("artifact_dirs must not be empty".into()));
        }

        if self.compiler.cli.trim().is_empty() {
            return Err(AppError::Config("compiler.cli must not be empty".into()));
        }

        if self.attach.cli.trim().is_empty() {
            return Err(AppError::Config("attach.cli must not be empty".into()));
        }

        if self.timings.fallback_port == 0 {
            return Err(AppError::Config(
                "timings.fallback_port must be greater than zero".into(),
            ));
        }

        if !self.eligibility.command_pattern.is_empty() {
            regex::Regex::new(&self.eligibility.command_pattern).map_err(|err| {
                AppError::Config(format!("eligibility.command_pattern invalid: {err}"))
            })?;
        }

        Ok(())
    }
}
