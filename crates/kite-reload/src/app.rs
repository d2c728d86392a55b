use std::sync::Arc;

use async_trait::async_trait;
use kite_vmservice::VmServiceClient;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ReloadError;

/// Lifecycle of a launched application as seen by the reload machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Starting,
    Started,
    Reloading,
    Restarting,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadKind {
    Reload,
    Restart,
}

impl ReloadKind {
    fn in_flight_state(self) -> AppState {
        match self {
            ReloadKind::Reload => AppState::Reloading,
            ReloadKind::Restart => AppState::Restarting,
        }
    }
}

/// Whether the application was launched for running or debugging. Decides
/// which tool window its notifications are attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Run,
    Debug,
}

/// Launch-time capabilities of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_reload: bool,
    pub supports_restart: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_reload: true,
            supports_restart: true,
        }
    }
}

/// Operations a running application performs on request.
#[async_trait]
pub trait AppControl: Send + Sync {
    async fn hot_reload(&self, reason: &str) -> Result<(), ReloadError>;

    async fn hot_restart(&self, reason: &str) -> Result<(), ReloadError>;

    /// Bring the device or window hosting the application to the foreground.
    fn bring_to_front(&self) {}

    fn is_connected(&self) -> bool;
}

/// [`AppControl`] that talks to the application's runtime service directly.
pub struct VmServiceAppControl {
    client: VmServiceClient,
}

impl VmServiceAppControl {
    pub fn new(client: VmServiceClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &VmServiceClient {
        &self.client
    }
}

#[async_trait]
impl AppControl for VmServiceAppControl {
    async fn hot_reload(&self, reason: &str) -> Result<(), ReloadError> {
        let vm = self.client.get_vm().await?;
        if vm.isolates.is_empty() {
            return Err(ReloadError::NoIsolates);
        }

        for isolate in &vm.isolates {
            let report = self.client.reload_sources(&isolate.id, false).await?;
            if !report.success {
                let message = if report.notices.is_empty() {
                    format!("reload rejected by isolate {}", isolate.id)
                } else {
                    report.notices.join("\n")
                };
                return Err(ReloadError::Rejected { message });
            }
        }
        tracing::debug!(target: "kite.reload", reason, isolates = vm.isolates.len(), "sources reloaded");
        Ok(())
    }

    async fn hot_restart(&self, reason: &str) -> Result<(), ReloadError> {
        self.client
            .send("hotRestart", json!({ "pause": false, "reason": reason }))
            .await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.client.is_closed()
    }
}

/// A launched application together with its reload state.
///
/// The state is only moved into `Reloading`/`Restarting` through
/// [`RunningApp::try_begin`], which makes at most one operation in flight
/// per application.
pub struct RunningApp {
    id: String,
    mode: RunMode,
    capabilities: Capabilities,
    control: Arc<dyn AppControl>,
    state: Mutex<AppState>,
}

impl std::fmt::Debug for RunningApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningApp")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("capabilities", &self.capabilities)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl RunningApp {
    pub fn new(id: impl Into<String>, control: Arc<dyn AppControl>) -> Self {
        Self {
            id: id.into(),
            mode: RunMode::default(),
            capabilities: Capabilities::default(),
            control,
            state: Mutex::new(AppState::Starting),
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn control(&self) -> &Arc<dyn AppControl> {
        &self.control
    }

    pub fn state(&self) -> AppState {
        *self.state.lock()
    }

    /// Lifecycle transitions reported by whatever launched the application.
    pub fn set_state(&self, state: AppState) {
        let mut current = self.state.lock();
        tracing::trace!(target: "kite.reload", app = %self.id, from = ?*current, to = ?state, "app state");
        *current = state;
    }

    pub fn is_started(&self) -> bool {
        self.state() == AppState::Started
    }

    pub fn is_reloading(&self) -> bool {
        matches!(self.state(), AppState::Reloading | AppState::Restarting)
    }

    pub fn is_connected(&self) -> bool {
        self.control.is_connected()
    }

    pub fn supports(&self, kind: ReloadKind) -> bool {
        match kind {
            ReloadKind::Reload => self.capabilities.supports_reload,
            ReloadKind::Restart => self.capabilities.supports_restart,
        }
    }

    /// Move a started application into the in-flight state for `kind`.
    ///
    /// Returns the state it was in, for [`RunningApp::restore`], or `None`
    /// when the application is not idle.
    pub fn try_begin(&self, kind: ReloadKind) -> Option<AppState> {
        let mut state = self.state.lock();
        if *state != AppState::Started {
            return None;
        }
        let prior = *state;
        *state = kind.in_flight_state();
        Some(prior)
    }

    /// Roll back an operation that was abandoned before reaching the runtime.
    pub fn restore(&self, prior: AppState) {
        let mut state = self.state.lock();
        if matches!(*state, AppState::Reloading | AppState::Restarting) {
            *state = prior;
        }
    }

    /// Leave the in-flight state. An application that terminated meanwhile
    /// stays terminated.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        if matches!(*state, AppState::Reloading | AppState::Restarting) {
            *state = AppState::Started;
        }
    }
}
