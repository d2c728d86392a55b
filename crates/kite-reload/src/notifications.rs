//! User-facing notifications and tracking of the most recent one.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::app::{RunMode, RunningApp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Error,
}

/// Where a notification is anchored in the host UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Run,
    Debug,
    Analysis,
}

impl Channel {
    pub fn for_mode(mode: RunMode) -> Self {
        match mode {
            RunMode::Run => Channel::Run,
            RunMode::Debug => Channel::Debug,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    /// Open the analysis problems view.
    ViewIssues,
}

impl NotificationAction {
    pub fn label(self) -> &'static str {
        match self {
            NotificationAction::ViewIssues => "View Issues",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
    pub severity: Severity,
    pub channel: Channel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    pub fn info(channel: Channel, content: impl Into<String>) -> Self {
        Self {
            title: None,
            content: content.into(),
            severity: Severity::Info,
            channel,
            actions: Vec::new(),
        }
    }

    pub fn error(channel: Channel, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: content.into(),
            severity: Severity::Error,
            channel,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.actions.push(action);
        self
    }
}

/// Opaque handle the sink hands back for a shown notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(pub u64);

/// Host UI that displays notifications.
pub trait NotificationSink: Send + Sync {
    fn show(&self, notification: Notification) -> NotificationId;

    /// Dismiss a notification. Expiring an already expired one is a no-op.
    fn expire(&self, id: NotificationId);

    /// Hide whatever run-status indicator is still showing for `app`.
    fn clear_run_status(&self, app: &RunningApp);
}

/// A notification as remembered by the [`NotificationTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracked {
    pub id: NotificationId,
    generation: u64,
}

/// Remembers which notification was shown last.
///
/// Every `track` and `clear` bumps a generation counter, so a stale
/// [`Tracked`] never compares equal to the current one even if the sink
/// reuses ids.
#[derive(Debug, Default)]
pub struct NotificationTracker {
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    generation: u64,
    last: Option<Tracked>,
}

impl NotificationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, id: NotificationId) -> Tracked {
        let mut state = self.state.lock();
        state.generation += 1;
        let tracked = Tracked {
            id,
            generation: state.generation,
        };
        state.last = Some(tracked);
        tracked
    }

    /// Forget the last notification without dismissing it.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        state.last = None;
    }

    pub fn is_last(&self, tracked: &Tracked) -> bool {
        self.state.lock().last.as_ref() == Some(tracked)
    }

    pub fn last(&self) -> Option<Tracked> {
        self.state.lock().last
    }
}
