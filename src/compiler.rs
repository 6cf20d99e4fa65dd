//! Script compilation.
//!
//! The engine treats the compiler as an external collaborator behind
//! [`ScriptCompiler`]. [`ExternalCompiler`] drives a configured compiler CLI:
//! the script is written to a temporary file, stderr lines are streamed to
//! the caller's [`DiagnosticSink`], and the output file becomes the payload.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::CompilerConfig;
use crate::{AppError, Result};

/// Receives compiler diagnostics line by line.
pub trait DiagnosticSink: Send + Sync {
    /// Record one diagnostic line.
    fn report(&self, line: &str);
}

/// Inputs for one compilation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileRequest {
    /// Script source text.
    pub script: String,
    /// Classpath the script is compiled against.
    pub classpath: Vec<PathBuf>,
    /// Allow unsafe constructs.
    pub unsafe_mode: bool,
    /// Auxiliary compiler library located for the target host.
    pub aux_classpath: Option<PathBuf>,
}

/// Turns script source into an instrumentation payload.
pub trait ScriptCompiler: Send + Sync {
    /// Compile `request`, reporting diagnostics to `diagnostics`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Compile`] when the script does not compile.
    fn compile<'a>(
        &'a self,
        request: &'a CompileRequest,
        diagnostics: &'a dyn DiagnosticSink,
    ) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// Compiler backed by an external command line tool.
#[derive(Debug, Clone)]
pub struct ExternalCompiler {
    config: CompilerConfig,
    client_path: PathBuf,
}

impl ExternalCompiler {
    /// Create a compiler running `config.cli` against the client artifact.
    #[must_use]
    pub fn new(config: CompilerConfig, client_path: PathBuf) -> Self {
        Self {
            config,
            client_path,
        }
    }

    async fn run(&self, request: &CompileRequest, diagnostics: &dyn DiagnosticSink) -> Result<Vec<u8>> {
        let workdir = tempfile::tempdir()
            .map_err(|err| AppError::Io(format!("failed to create compile dir: {err}")))?;
        let script_path = workdir.path().join("script.trace");
        let output_path = workdir.path().join("payload.bin");

        tokio::fs::write(&script_path, request.script.as_bytes())
            .await
            .map_err(|err| AppError::Io(format!("failed to write script: {err}")))?;

        let classpath = std::env::join_paths(&request.classpath)
            .map_err(|err| AppError::Compile(format!("invalid classpath: {err}")))?;

        let mut cmd = Command::new(&self.config.cli);
        cmd.args(&self.config.args)
            .arg("--classpath")
            .arg(&classpath)
            .arg("--client")
            .arg(&self.client_path);
        if let Some(ref aux) = request.aux_classpath {
            cmd.arg("--tools").arg(aux);
        }
        if request.unsafe_mode {
            cmd.arg("--unsafe");
        }
        cmd.arg("--output")
            .arg(&output_path)
            .arg(&script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Compile(format!("failed to spawn compiler: {err}")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Compile("failed to capture compiler stderr".into()))?;

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let status = tokio::time::timeout(timeout, async {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                diagnostics.report(&line);
            }
            child.wait().await
        })
        .await
        .map_err(|_| AppError::Compile(format!("compiler timed out after {timeout:?}")))?
        .map_err(|err| AppError::Compile(format!("compiler I/O failed: {err}")))?;

        if !status.success() {
            return Err(AppError::Compile(format!("compiler exited with {status}")));
        }

        let payload = tokio::fs::read(&output_path)
            .await
            .map_err(|err| AppError::Compile(format!("compiler produced no output: {err}")))?;
        if payload.is_empty() {
            return Err(AppError::Compile("compiler produced an empty payload".into()));
        }

        debug!(bytes = payload.len(), "compiler output read");
        Ok(payload)
    }
}

impl ScriptCompiler for ExternalCompiler {
    fn compile<'a>(
        &'a self,
        request: &'a CompileRequest,
        diagnostics: &'a dyn DiagnosticSink,
    ) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            info!(cli = %self.config.cli, unsafe_mode = request.unsafe_mode, "compiling trace script");
            self.run(request, diagnostics).await
        })
    }
}
