//! Hot reload and hot restart orchestration.
//!
//! A reload moves the application from `Started` to `Reloading`, optionally
//! runs the workspace sync script, consults static analysis for the saved
//! document, then asks the runtime to reload. The "Reloading…" notification
//! stays up for at least [`ReloadConfig::min_visibility`] after a success,
//! and the run-status indicator is only cleared if no newer notification
//! replaced it in the meantime.

use std::{path::PathBuf, sync::Arc, time::SystemTime};

use kite_config::ReloadConfig;
use tokio::time::Instant;

use crate::{
    app::{AppState, ReloadKind, RunningApp},
    notifications::{
        Channel, Notification, NotificationAction, NotificationSink, NotificationTracker, Tracked,
    },
    sync::SyncScript,
    workspace::{AnalysisOracle, Document, DocumentSaver},
};

pub const RELOAD_REASON_SAVE: &str = "save";
pub const RELOAD_REASON_MANUAL: &str = "manual";

const RELOADING: &str = "Reloading…";
const HOT_RELOAD_ERROR: &str = "Hot Reload Error";
const HOT_RESTART_ERROR: &str = "Hot Restart Error";
const RELOAD_NOT_PERFORMED: &str = "Reload not performed";
const ANALYSIS_ISSUES_FOUND: &str = "Analysis issues found";

/// What happened to a single reload or restart request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded,
    Restarted,
    /// The runtime was asked and reported an error; an error notification
    /// was shown.
    Failed { message: String },
    /// The saved document has structural errors; the runtime was not asked.
    AnalysisIssues,
    /// The application disconnected before the request could be sent.
    Aborted,
    Skipped(SkipReason),
}

/// Why a request was dropped before the application state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ReloadOnSaveDisabled,
    /// The saved document lives in an ignored directory such as the IDE's
    /// scratch files.
    IgnoredDocument,
    /// The document was not written recently enough to count as the save.
    StaleSave,
    Unsupported,
    NotStarted,
    /// Another reload or restart is still running for the application.
    InFlight,
}

/// Host services the manager talks to.
#[derive(Clone)]
pub struct ReloadCollaborators {
    pub notifications: Arc<dyn NotificationSink>,
    pub saver: Arc<dyn DocumentSaver>,
    pub analysis: Arc<dyn AnalysisOracle>,
}

/// Workspace-specific knobs that are not part of the user configuration.
#[derive(Debug, Clone, Default)]
pub struct ReloadOptions {
    /// Present when the workspace mirrors sources through an external tool.
    pub sync_script: Option<SyncScript>,
    /// Saves below these directories never trigger a reload.
    pub ignored_dirs: Vec<PathBuf>,
}

/// Drives reloads and restarts for any number of running applications.
///
/// Cheap to clone; clones share the notification tracking.
#[derive(Clone)]
pub struct ReloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ReloadConfig,
    options: ReloadOptions,
    notifications: Arc<dyn NotificationSink>,
    saver: Arc<dyn DocumentSaver>,
    analysis: Arc<dyn AnalysisOracle>,
    tracker: NotificationTracker,
}

impl ReloadManager {
    pub fn new(
        config: ReloadConfig,
        collaborators: ReloadCollaborators,
        options: ReloadOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                options,
                notifications: collaborators.notifications,
                saver: collaborators.saver,
                analysis: collaborators.analysis,
                tracker: NotificationTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &ReloadConfig {
        &self.inner.config
    }

    /// The most recently shown notification, if it is still tracked.
    pub fn last_notification(&self) -> Option<Tracked> {
        self.inner.tracker.last()
    }

    /// React to `document` having been saved while `app` is running.
    pub async fn handle_save(&self, app: &Arc<RunningApp>, document: &Document) -> ReloadOutcome {
        if let Some(reason) = self.inner.save_filter(document) {
            tracing::trace!(target: "kite.reload", path = %document.path.display(), ?reason, "save ignored");
            return ReloadOutcome::Skipped(reason);
        }
        self.inner
            .reload(app, RELOAD_REASON_SAVE, Some(document), true)
            .await
    }

    pub async fn save_all_and_reload(&self, app: &Arc<RunningApp>, reason: &str) -> ReloadOutcome {
        self.inner.saver.save_all().await;
        self.inner.tracker.clear();
        self.inner.reload(app, reason, None, false).await
    }

    pub async fn save_all_and_restart(&self, app: &Arc<RunningApp>, reason: &str) -> ReloadOutcome {
        self.inner.saver.save_all().await;
        self.inner.tracker.clear();
        self.inner.restart(app, reason).await
    }

    /// Reload every application concurrently. Outcomes are in `apps` order.
    pub async fn save_all_and_reload_all(
        &self,
        apps: &[Arc<RunningApp>],
        reason: &str,
    ) -> Vec<ReloadOutcome> {
        self.batch(apps, reason, ReloadKind::Reload).await
    }

    /// Restart every application concurrently. One failure does not stop
    /// the others.
    pub async fn save_all_and_restart_all(
        &self,
        apps: &[Arc<RunningApp>],
        reason: &str,
    ) -> Vec<ReloadOutcome> {
        self.batch(apps, reason, ReloadKind::Restart).await
    }

    async fn batch(
        &self,
        apps: &[Arc<RunningApp>],
        reason: &str,
        kind: ReloadKind,
    ) -> Vec<ReloadOutcome> {
        self.inner.saver.save_all().await;
        self.inner.tracker.clear();

        let tasks: Vec<_> = apps
            .iter()
            .map(|app| {
                let inner = self.inner.clone();
                let app = app.clone();
                let reason = reason.to_string();
                tokio::spawn(async move {
                    match kind {
                        ReloadKind::Reload => inner.reload(&app, &reason, None, false).await,
                        ReloadKind::Restart => inner.restart(&app, &reason).await,
                    }
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            outcomes.push(task.await.unwrap_or_else(|err| {
                tracing::warn!(target: "kite.reload", error = %err, "reload task failed");
                ReloadOutcome::Failed {
                    message: err.to_string(),
                }
            }));
        }
        outcomes
    }
}

impl Inner {
    fn save_filter(&self, document: &Document) -> Option<SkipReason> {
        if !self.config.reload_on_save {
            return Some(SkipReason::ReloadOnSaveDisabled);
        }
        if self
            .options
            .ignored_dirs
            .iter()
            .any(|dir| document.path.starts_with(dir))
        {
            return Some(SkipReason::IgnoredDocument);
        }
        // A timestamp in the future counts as fresh.
        let age = SystemTime::now()
            .duration_since(document.saved_at)
            .unwrap_or_default();
        if age > self.config.recently_saved() {
            return Some(SkipReason::StaleSave);
        }
        None
    }

    fn entry_check(app: &RunningApp, kind: ReloadKind) -> Option<SkipReason> {
        if !app.supports(kind) {
            Some(SkipReason::Unsupported)
        } else if app.is_reloading() {
            Some(SkipReason::InFlight)
        } else if !app.is_started() {
            Some(SkipReason::NotStarted)
        } else {
            None
        }
    }

    fn show(&self, notification: Notification) -> Tracked {
        let id = self.notifications.show(notification);
        self.tracker.track(id)
    }

    async fn reload(
        self: &Arc<Self>,
        app: &Arc<RunningApp>,
        reason: &str,
        document: Option<&Document>,
        clear_tracking: bool,
    ) -> ReloadOutcome {
        if let Some(skip) = Self::entry_check(app, ReloadKind::Reload) {
            return ReloadOutcome::Skipped(skip);
        }
        let Some(prior) = app.try_begin(ReloadKind::Reload) else {
            return ReloadOutcome::Skipped(SkipReason::InFlight);
        };

        if let Some(script) = &self.options.sync_script {
            // Best effort: a stale mirror is better than no reload.
            if let Err(err) = script.run(self.config.sync_timeout()).await {
                tracing::warn!(target: "kite.reload", %script, error = %err, "syncing files failed");
            }
        }

        if clear_tracking {
            self.tracker.clear();
        }

        if !app.is_connected() {
            app.restore(prior);
            tracing::debug!(target: "kite.reload", app = app.id(), "app disconnected before reload");
            return ReloadOutcome::Aborted;
        }

        if let Some(document) = document {
            if self.analysis.has_structural_errors(document).await {
                app.restore(prior);
                self.show(
                    Notification::error(
                        Channel::Analysis,
                        RELOAD_NOT_PERFORMED,
                        ANALYSIS_ISSUES_FOUND,
                    )
                    .with_action(NotificationAction::ViewIssues),
                );
                tracing::info!(target: "kite.reload", path = %document.path.display(), "reload skipped: analysis issues");
                return ReloadOutcome::AnalysisIssues;
            }
        }

        let channel = Channel::for_mode(app.mode());
        let reloading = self.show(Notification::info(channel, RELOADING));
        let started = Instant::now();
        tracing::info!(target: "kite.reload", app = app.id(), reason, "hot reload");

        let result = app.control().hot_reload(reason).await;
        app.finish();

        match result {
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(target: "kite.reload", app = app.id(), error = %message, "hot reload failed");
                self.notifications.expire(reloading.id);
                self.show(Notification::error(channel, HOT_RELOAD_ERROR, message.clone()));
                ReloadOutcome::Failed { message }
            }
            Ok(()) => {
                let elapsed = started.elapsed();
                tracing::info!(target: "kite.reload", app = app.id(), ?elapsed, "hot reload complete");

                let delay = self.config.min_visibility().saturating_sub(elapsed);
                let inner = self.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.notifications.expire(reloading.id);
                    let gone = matches!(app.state(), AppState::Terminating | AppState::Terminated);
                    if !gone && inner.tracker.is_last(&reloading) {
                        inner.notifications.clear_run_status(&app);
                    }
                });
                ReloadOutcome::Reloaded
            }
        }
    }

    async fn restart(&self, app: &Arc<RunningApp>, reason: &str) -> ReloadOutcome {
        if let Some(skip) = Self::entry_check(app, ReloadKind::Restart) {
            return ReloadOutcome::Skipped(skip);
        }
        let Some(prior) = app.try_begin(ReloadKind::Restart) else {
            return ReloadOutcome::Skipped(SkipReason::InFlight);
        };
        if !app.is_connected() {
            app.restore(prior);
            return ReloadOutcome::Aborted;
        }

        tracing::info!(target: "kite.reload", app = app.id(), reason, "hot restart");
        let restart = app.control().hot_restart(reason);
        app.control().bring_to_front();
        let result = restart.await;
        app.finish();

        match result {
            Ok(()) => ReloadOutcome::Restarted,
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(target: "kite.reload", app = app.id(), error = %message, "hot restart failed");
                self.show(Notification::error(
                    Channel::for_mode(app.mode()),
                    HOT_RESTART_ERROR,
                    message.clone(),
                ));
                ReloadOutcome::Failed { message }
            }
        }
    }
}
