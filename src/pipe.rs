//! Session-owned named pipes

use std::path::{Path, PathBuf};

use crate::error::ProcessError;

/// A FIFO on disk, unlinked exactly once
#[derive(Debug)]
pub struct NamedPipe {
    path: PathBuf,
    removed: bool,
}

impl NamedPipe {
    /// Create a FIFO at `path`, replacing any stale file left by a previous run
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, ProcessError> {
        let path = path.into();

        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| pipe_error(&path, e))?;
        }
        make_fifo(&path)?;

        tracing::debug!("Created pipe {}", path.display());
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Unlink the pipe. Returns `true` only on the call that removed it.
    pub fn remove(&mut self) -> bool {
        if self.removed {
            return false;
        }
        self.removed = true;

        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed pipe {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove pipe {}: {}", self.path.display(), e),
        }
        true
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        self.remove();
    }
}

/// File-system safe form of a device name for pipe and config paths
pub fn sanitize_file_component(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<(), ProcessError> {
    use nix::sys::stat::Mode;

    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| ProcessError::Pipe {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
fn make_fifo(path: &Path) -> Result<(), ProcessError> {
    Err(ProcessError::Pipe {
        path: path.display().to_string(),
        reason: "named pipes require a unix platform".to_string(),
    })
}

fn pipe_error(path: &Path, e: std::io::Error) -> ProcessError {
    ProcessError::Pipe {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}
