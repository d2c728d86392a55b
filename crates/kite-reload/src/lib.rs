//! Hot reload and hot restart for applications attached over the runtime
//! service.
//!
//! [`ReloadManager`] owns the per-request flow. Each [`RunningApp`] allows at
//! most one reload or restart in flight; the host supplies notification,
//! save, and analysis collaborators.

pub mod app;
pub mod error;
pub mod manager;
pub mod notifications;
pub mod sync;
pub mod workspace;

pub use crate::app::{
    AppControl, AppState, Capabilities, ReloadKind, RunMode, RunningApp, VmServiceAppControl,
};
pub use crate::error::{ReloadError, SyncError};
pub use crate::manager::{
    ReloadCollaborators, ReloadManager, ReloadOptions, ReloadOutcome, SkipReason,
    RELOAD_REASON_MANUAL, RELOAD_REASON_SAVE,
};
pub use crate::notifications::{
    Channel, Notification, NotificationAction, NotificationId, NotificationSink,
    NotificationTracker, Severity, Tracked,
};
pub use crate::sync::SyncScript;
pub use crate::workspace::{AnalysisOracle, Document, DocumentSaver};
