use kite_vmservice::{ConnectError, VmServiceError};
use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

#[derive(Debug, Error)]
pub enum DebugError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    VmService(#[from] VmServiceError),
    #[error("debug session closed")]
    SessionClosed,
}

impl DebugError {
    /// True when the failure means the session can no longer talk to the runtime.
    pub fn is_fatal(&self) -> bool {
        match self {
            DebugError::Connect(_) | DebugError::SessionClosed => true,
            DebugError::VmService(err) => err.is_disconnect(),
        }
    }
}
