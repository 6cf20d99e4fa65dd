//! Installed artifact resolution.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{AppError, Result};

/// Finds installed files by name across an ordered list of directories.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    dirs: Vec<PathBuf>,
}

impl ArtifactLocator {
    /// Create a locator searching `dirs` in order.
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Absolute path of the first regular file called `name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when no directory contains `name`.
    pub fn locate(&self, name: &str) -> Result<PathBuf> {
        for dir in &self.dirs {
            let candidate = dir.join(name);
            if candidate.is_file() {
                let resolved = absolutize(&candidate);
                debug!(artifact = name, path = %resolved.display(), "artifact located");
                return Ok(resolved);
            }
        }

        Err(AppError::NotFound(format!(
            "artifact {name} not found in {} search dir(s)",
            self.dirs.len()
        )))
    }
}

/// Agent and client artifacts resolved at engine construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    /// Agent loaded into target processes.
    pub agent_path: PathBuf,
    /// Client library handed to the compiler.
    pub client_path: PathBuf,
}

impl Artifacts {
    /// Resolve both artifacts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if either artifact is missing.
    pub fn resolve(locator: &ArtifactLocator, agent: &str, client: &str) -> Result<Self> {
        Ok(Self {
            agent_path: locator.locate(agent)?,
            client_path: locator.locate(client)?,
        })
    }
}

fn absolutize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
