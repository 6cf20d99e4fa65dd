//! Host attach tool invocation.
//!
//! Loading an agent into a running process is delegated to an external tool
//! (for example `jattach`). The tool's argument template comes from
//! [`AttachConfig`]; placeholders are substituted per request:
//!
//! | Placeholder | Value                                   |
//! |-------------|-----------------------------------------|
//! | `{pid}`     | target process id                       |
//! | `{agent}`   | agent artifact path                     |
//! | `{port}`    | port the agent should listen on         |
//! | `{options}` | rendered agent option string            |
//! | `{aux}`     | auxiliary compiler library, or empty    |

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use crate::config::{AttachConfig, TraceSettings};
use crate::driver::{AttachRequest, Endpoint};
use crate::{AppError, Result};

/// Render the comma-separated option string the agent parses on load.
#[must_use]
pub fn render_agent_options(
    endpoint: &Endpoint,
    settings: &TraceSettings,
    request: &AttachRequest,
) -> String {
    let mut options = vec![
        format!("port={}", endpoint.port),
        format!("debug={}", settings.debug),
        format!("unsafe={}", request.unsafe_mode),
        format!("dumpClasses={}", settings.dump_classes),
    ];

    if settings.dump_classes {
        if let Some(ref dir) = settings.dump_class_path {
            options.push(format!("dumpDir={}", dir.display()));
        }
    }

    if let Some(ref aux) = request.aux_classpath {
        options.push(format!("systemClassPath={}", aux.display()));
    }

    if let Some(ref extra) = request.extra_options {
        if !extra.trim().is_empty() {
            options.push(extra.trim().to_owned());
        }
    }

    options.join(",")
}

/// Substitute the attach placeholders in every template argument.
#[must_use]
pub fn render_attach_args(
    template: &[String],
    endpoint: &Endpoint,
    settings: &TraceSettings,
    request: &AttachRequest,
) -> Vec<String> {
    let options = render_agent_options(endpoint, settings, request);
    let aux = request
        .aux_classpath
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    template
        .iter()
        .map(|arg| {
            arg.replace("{pid}", &request.pid.to_string())
                .replace("{agent}", &request.agent_path.display().to_string())
                .replace("{port}", &endpoint.port.to_string())
                .replace("{options}", &options)
                .replace("{aux}", &aux)
        })
        .collect()
}

/// Run the configured attach tool and wait for it to finish.
///
/// # Errors
///
/// - `AppError::Attach("failed to spawn attach tool: …")`: OS spawn failure.
/// - `AppError::Attach("attach timed out …")`: tool exceeded its timeout.
/// - `AppError::Attach("attach tool exited with …")`: non-zero exit.
pub async fn run_attach(
    config: &AttachConfig,
    endpoint: &Endpoint,
    settings: &TraceSettings,
    request: &AttachRequest,
) -> Result<()> {
    let args = render_attach_args(&config.args, endpoint, settings, request);
    debug!(cli = %config.cli, ?args, "invoking attach tool");

    let child = Command::new(&config.cli)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| AppError::Attach(format!("failed to spawn attach tool: {err}")))?;

    let timeout = Duration::from_secs(config.timeout_seconds);
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(AppError::Attach(format!("failed to wait for attach tool: {err}")));
        }
        Err(_elapsed) => {
            // Dropping the child future kills the process (kill_on_drop).
            return Err(AppError::Attach(format!(
                "attach timed out after {timeout:?} for pid {}",
                request.pid
            )));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Attach(format!(
            "attach tool exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    info!(pid = request.pid, %endpoint, "agent attached");
    Ok(())
}
