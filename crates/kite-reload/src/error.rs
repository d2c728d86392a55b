use std::{io, path::PathBuf, process::ExitStatus, time::Duration};

use kite_vmservice::VmServiceError;
use thiserror::Error;

/// Why a reload or restart request to the running application failed.
///
/// The display text is what ends up in the user-facing error notification.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    VmService(#[from] VmServiceError),
    /// The runtime answered but refused the new sources.
    #[error("{message}")]
    Rejected { message: String },
    #[error("the application has no isolates to reload")]
    NoIsolates,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to start sync script {script}: {source}")]
    Spawn {
        script: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sync script {script} timed out after {timeout:?}")]
    Timeout { script: PathBuf, timeout: Duration },
    #[error("sync script {script} exited with {status}")]
    Failed { script: PathBuf, status: ExitStatus },
    #[error(transparent)]
    Io(#[from] io::Error),
}
