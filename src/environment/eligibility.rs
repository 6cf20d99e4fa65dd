//! Target process eligibility.

use regex::Regex;
use tracing::debug;

use crate::{AppError, Result};

/// Decides whether a process may be instrumented.
pub trait EligibilityProvider: Send + Sync {
    /// `true` when `pid` is a legal instrumentation target.
    fn can_be_traced(&self, pid: u32) -> bool;
}

/// Provider used when none is installed: nothing is traceable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEligibility;

impl EligibilityProvider for NullEligibility {
    fn can_be_traced(&self, _pid: u32) -> bool {
        false
    }
}

/// Checks liveness and command line of a local process.
///
/// A pid is eligible when it is not the engine itself, the process exists
/// and can be signalled, and its command line matches the configured
/// pattern. Hosts without `/proc` skip the command line check.
#[derive(Debug, Clone)]
pub struct ProcessEligibility {
    pattern: Option<Regex>,
    own_pid: u32,
}

impl ProcessEligibility {
    /// Build a provider; an empty `command_pattern` disables matching.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the pattern is not a valid regex.
    pub fn new(command_pattern: &str) -> Result<Self> {
        let pattern = if command_pattern.is_empty() {
            None
        } else {
            Some(Regex::new(command_pattern).map_err(|err| {
                AppError::Config(format!("invalid eligibility pattern: {err}"))
            })?)
        };

        Ok(Self {
            pattern,
            own_pid: std::process::id(),
        })
    }
}

impl EligibilityProvider for ProcessEligibility {
    fn can_be_traced(&self, pid: u32) -> bool {
        if pid == 0 || pid == self.own_pid {
            return false;
        }

        if !is_alive(pid) {
            debug!(pid, "process not alive or not signalable");
            return false;
        }

        let Some(ref pattern) = self.pattern else {
            return true;
        };

        match read_command_line(pid) {
            Some(cmdline) => {
                let eligible = pattern.is_match(&cmdline);
                debug!(pid, eligible, "command line checked");
                eligible
            }
            None => true,
        }
    }
}

#[cfg(unix)]
fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(not(unix))]
fn is_alive(_pid: u32) -> bool {
    // No cheap liveness probe; the attach tool reports dead targets.
    true
}

fn read_command_line(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let joined = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    Some(joined)
}
