//! Tool-server script targets.
//!
//! The interpreter for a tool server is decided once, from the script's file
//! extension, when the [`ScriptTarget`] is built. Anything outside the three
//! recognized kinds is rejected before a process is spawned.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::ConfigError;

/// Source kind of a tool-server script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// `.py`, run with `python3` (`python` on Windows).
    Python,
    /// `.js`, run with `node`.
    Node,
    /// `.sh`, run with `sh`.
    Shell,
}

impl ScriptKind {
    /// Recognized extensions, lowercase.
    pub const EXTENSIONS: [&'static str; 3] = ["py", "js", "sh"];

    /// Infer the kind from a path's extension (case-insensitive).
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("py") => Ok(Self::Python),
            Some("js") => Ok(Self::Node),
            Some("sh") => Ok(Self::Shell),
            _ => Err(ConfigError::UnsupportedScript {
                path: path.to_path_buf(),
            }),
        }
    }

    /// The interpreter executable used to run scripts of this kind.
    pub fn interpreter(self) -> &'static str {
        match self {
            Self::Python if cfg!(windows) => "python",
            Self::Python => "python3",
            Self::Node => "node",
            Self::Shell => "sh",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Python => write!(f, "python"),
            Self::Node => write!(f, "node"),
            Self::Shell => write!(f, "shell"),
        }
    }
}

/// A validated tool-server script path plus its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    path: PathBuf,
    kind: ScriptKind,
}

impl ScriptTarget {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let kind = ScriptKind::from_path(&path)?;
        Ok(Self { path, kind })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    /// Build the child-process command with piped stdio.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(self.kind.interpreter());
        cmd.arg(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}
