//! Script-root sandbox.
//!
//! Jobs reference scripts by a path relative to an allow-listed directory.
//! Resolution is purely lexical: absolute paths and any `..` component are
//! rejected before the filesystem is touched, so a hostile path can never
//! name a file outside the root.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// The allow-listed directory that all job scripts must live under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRoot {
    root: PathBuf,
}

impl ScriptRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a job's `script_path` to an absolute path inside the root.
    pub fn resolve(&self, script_path: &str) -> Result<PathBuf> {
        if script_path.is_empty() {
            return Err(Error::InvalidScriptPath("empty path".into()));
        }
        let relative = Path::new(script_path);
        if relative.is_absolute() {
            return Err(Error::InvalidScriptPath(script_path.to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(Error::InvalidScriptPath(script_path.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> ScriptRoot {
        ScriptRoot::new("/srv/taskmill/scripts")
    }

    #[test]
    fn resolves_inside_root() {
        let path = root().resolve("backups/nightly.sh").unwrap();
        assert_eq!(path, Path::new("/srv/taskmill/scripts/backups/nightly.sh"));
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(root().resolve("/etc/passwd").is_err());
    }

    #[test]
    fn rejects_parent_traversal() {
        assert!(root().resolve("../secrets.sh").is_err());
        assert!(root().resolve("jobs/../../secrets.sh").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(root().resolve("").is_err());
    }

    #[test]
    fn allows_current_dir_components() {
        let path = root().resolve("./hello.sh").unwrap();
        assert_eq!(path, Path::new("/srv/taskmill/scripts/./hello.sh"));
    }
}
