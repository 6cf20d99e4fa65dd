//! Auxiliary compiler library lookup.
//!
//! The agent compiler needs the runtime's tools library on its classpath.
//! Its location depends on the OS family of the runtime that reports the
//! properties:
//!
//! | Family  | Path                                              |
//! |---------|---------------------------------------------------|
//! | `Mac`   | `<java.home up to /Home>/Classes/classes.jar`     |
//! | `Posix` | `<java.home without /jre>/lib/tools.jar`          |
//!
//! Properties supplied with the task are tried first; the engine host's own
//! properties are the fallback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Runtime home property key.
pub const JAVA_HOME: &str = "java.home";
/// Operating system name property key.
pub const OS_NAME: &str = "os.name";

/// OS family deciding the library layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    /// Apple runtimes with the `Contents/Home` bundle layout.
    Mac,
    /// Everything else.
    Posix,
}

impl OsFamily {
    /// Classify an `os.name` property value.
    #[must_use]
    pub fn from_os_name(os_name: &str) -> Self {
        if os_name.starts_with("Mac") {
            Self::Mac
        } else {
            Self::Posix
        }
    }

    /// Expected library path for a runtime installed at `java_home`.
    #[must_use]
    pub fn aux_library(self, java_home: &str) -> PathBuf {
        match self {
            Self::Mac => {
                let root = java_home
                    .find("/Home")
                    .map_or(java_home, |idx| &java_home[..idx]);
                PathBuf::from(format!("{root}/Classes/classes.jar"))
            }
            Self::Posix => {
                let root = java_home.replace("/jre", "");
                PathBuf::from(format!("{root}/lib/tools.jar"))
            }
        }
    }
}

/// Candidate library path derived from one property set.
#[must_use]
pub fn candidate(properties: &HashMap<String, String>) -> Option<PathBuf> {
    let java_home = properties.get(JAVA_HOME)?;
    let family = OsFamily::from_os_name(properties.get(OS_NAME).map_or("", String::as_str));
    Some(family.aux_library(java_home))
}

/// Locate the auxiliary library, task properties first, then ambient ones.
///
/// `exists` decides whether a candidate is usable; returns `None` when no
/// candidate passes.
pub fn locate_aux_library<F>(
    task_properties: &HashMap<String, String>,
    ambient_properties: &HashMap<String, String>,
    exists: F,
) -> Option<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    for (source, properties) in [("task", task_properties), ("ambient", ambient_properties)] {
        if let Some(path) = candidate(properties) {
            if exists(&path) {
                debug!(source, path = %path.display(), "auxiliary library located");
                return Some(path);
            }
            debug!(source, path = %path.display(), "auxiliary library candidate missing");
        }
    }
    None
}

/// Properties describing the engine host itself.
#[must_use]
pub fn ambient_properties(java_home: Option<&Path>) -> HashMap<String, String> {
    let os_name = match std::env::consts::OS {
        "macos" => "Mac OS X",
        "linux" => "Linux",
        "windows" => "Windows",
        other => other,
    };

    let mut properties = HashMap::new();
    properties.insert(OS_NAME.to_owned(), os_name.to_owned());
    if let Some(home) = java_home {
        properties.insert(JAVA_HOME.to_owned(), home.display().to_string());
    }
    properties
}
