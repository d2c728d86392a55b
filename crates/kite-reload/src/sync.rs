//! External file-sync step for workspaces whose sources are mirrored by a
//! build tool before the runtime can see them.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::process::Command;

use crate::error::SyncError;

/// A sync script run from the workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncScript {
    pub cwd: PathBuf,
    pub script: PathBuf,
}

impl SyncScript {
    /// `script` is resolved against `root` when relative.
    pub fn new(root: &Path, script: &Path) -> Self {
        Self {
            cwd: root.to_path_buf(),
            script: root.join(script),
        }
    }

    /// Run the script and wait at most `timeout` for it to exit. The process
    /// is killed when the wait is abandoned.
    pub async fn run(&self, timeout: Duration) -> Result<(), SyncError> {
        let child = Command::new(&self.script)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SyncError::Spawn {
                script: self.script.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(SyncError::Timeout {
                    script: self.script.clone(),
                    timeout,
                })
            }
        };

        for (stream, bytes) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
            if !bytes.is_empty() {
                tracing::debug!(
                    target: "kite.reload",
                    stream,
                    "{}",
                    String::from_utf8_lossy(bytes).trim_end()
                );
            }
        }

        if !output.status.success() {
            return Err(SyncError::Failed {
                script: self.script.clone(),
                status: output.status,
            });
        }
        Ok(())
    }
}

impl fmt::Display for SyncScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (in {})", self.script.display(), self.cwd.display())
    }
}
