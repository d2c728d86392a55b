use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use kite_config::ConnectConfig;
use kite_vmservice::{
    connect, Connection, EndpointProvider, ExceptionPauseMode, IsolateId, IsolateRef, PauseKind,
    ScriptRef, VmServiceClient, DEFAULT_STREAMS,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    breakpoints::{BreakpointCoordinator, BreakpointHandle},
    error::{DebugError, DebugResult},
    isolates::{IsolateRegistry, ResumeOutcome},
    listener,
    mapper::{LocalPosition, OutputSink, PositionMapper},
    stepping::{self, StepKind},
};

/// External pieces a session talks to besides the runtime.
#[derive(Clone)]
pub struct SessionCollaborators {
    pub mapper: Arc<dyn PositionMapper>,
    pub output: Option<Arc<dyn OutputSink>>,
}

pub(crate) struct Shared {
    pub(crate) client: VmServiceClient,
    pub(crate) registry: IsolateRegistry,
    pub(crate) breakpoints: BreakpointCoordinator,
    pub(crate) mapper: Arc<dyn PositionMapper>,
    pub(crate) output: Option<Arc<dyn OutputSink>>,
    /// Isolate selected by the user or by the latest pause.
    pub(crate) current: Mutex<Option<IsolateId>>,
    pub(crate) extensions: Mutex<HashMap<IsolateId, BTreeSet<String>>>,
    pub(crate) extension_values: Mutex<HashMap<String, bool>>,
    pub(crate) cancel: CancellationToken,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Install breakpoints and exception mode into a newly seen isolate, then
    /// resume it if it was held at its start.
    pub(crate) async fn handle_new_isolate(&self, isolate: &IsolateRef, paused_at_start: bool) {
        if self.is_closed() {
            return;
        }
        self.breakpoints.install_into(&isolate.id).await;
        if paused_at_start && !self.is_closed() {
            if let Err(err) = self.client.resume(&isolate.id, None).await {
                tracing::warn!(
                    target: "kite.debug",
                    isolate = %isolate.id,
                    error = %err,
                    "failed to resume isolate paused at start"
                );
            }
        }
    }

    pub(crate) async fn resume_all(&self) -> usize {
        let mut resumed = 0;
        for id in self.registry.suspended_ids() {
            if self.is_closed() {
                break;
            }
            match self.client.resume(&id, None).await {
                Ok(()) => resumed += 1,
                Err(err) => {
                    tracing::warn!(target: "kite.debug", isolate = %id, error = %err, "resume failed")
                }
            }
        }
        resumed
    }

    pub(crate) fn current_isolate(&self) -> Option<IsolateId> {
        let selected = self.current.lock().clone();
        selected.or_else(|| self.registry.snapshot_ids().into_iter().next())
    }

    /// Tear down once: dispose resume signals, reject pending requests.
    pub(crate) fn teardown(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        tracing::info!(target: "kite.debug", reason, "debug session ended");
        self.registry.dispose_all();
        self.client.shutdown(reason);
        self.mapper.shutdown();
    }
}

/// A debugging session against one running application.
///
/// Owns the isolate registry and breakpoint coordinator for its lifetime; both
/// are discarded when the session ends.
pub struct DebugSession {
    shared: Arc<Shared>,
    endpoint: Option<String>,
    listener: JoinHandle<()>,
}

impl DebugSession {
    /// Wait for the runtime endpoint, connect and start the session.
    ///
    /// Connection failures are fatal and returned as [`DebugError::Connect`].
    pub async fn connect(
        provider: &dyn EndpointProvider,
        config: &ConnectConfig,
        cancel: &CancellationToken,
        collaborators: SessionCollaborators,
    ) -> DebugResult<Self> {
        let connection = match connect(provider, cancel, config.poll_interval()).await {
            Ok(connection) => connection,
            Err(err) => {
                tracing::error!(target: "kite.debug", error = %err, "failed to connect to runtime service");
                return Err(err.into());
            }
        };
        Self::start(connection, collaborators).await
    }

    /// Subscribe to the runtime's streams, start the event listener and
    /// attach to the isolates that already exist.
    pub async fn start(connection: Connection, collaborators: SessionCollaborators) -> DebugResult<Self> {
        let Connection {
            endpoint,
            client,
            events,
        } = connection;
        let mut session = Self::from_client(client, events, collaborators).await?;
        session.endpoint = Some(endpoint);
        Ok(session)
    }

    pub async fn from_client(
        client: VmServiceClient,
        events: kite_vmservice::VmEventReceiver,
        collaborators: SessionCollaborators,
    ) -> DebugResult<Self> {
        let SessionCollaborators { mapper, output } = collaborators;
        let shared = Arc::new(Shared {
            breakpoints: BreakpointCoordinator::new(client.clone(), mapper.clone()),
            registry: IsolateRegistry::new(),
            mapper,
            output,
            current: Mutex::new(None),
            extensions: Mutex::new(HashMap::new()),
            extension_values: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            client,
        });

        for stream in DEFAULT_STREAMS {
            match shared.client.stream_listen(stream).await {
                Ok(()) => {}
                Err(err) if err.is_disconnect() => return Err(err.into()),
                Err(err) => {
                    tracing::warn!(target: "kite.debug", stream, error = %err, "stream subscription failed")
                }
            }
        }

        let listener = tokio::spawn(listener::run(shared.clone(), events));
        let session = Self {
            shared,
            endpoint: None,
            listener,
        };
        session.discover_isolates().await?;
        Ok(session)
    }

    async fn discover_isolates(&self) -> DebugResult<()> {
        let shared = &self.shared;
        let vm = shared.client.get_vm().await?;
        tracing::info!(
            target: "kite.debug",
            vm = %vm.name,
            version = %vm.version,
            isolates = vm.isolates.len(),
            "attached to runtime"
        );

        for isolate_ref in vm.isolates {
            let info = match shared.client.get_isolate(&isolate_ref.id).await {
                Ok(info) => info,
                Err(err) if err.is_disconnect() => return Err(err.into()),
                Err(err) => {
                    tracing::debug!(target: "kite.debug", isolate = %isolate_ref.id, error = %err, "isolate vanished during discovery");
                    continue;
                }
            };
            shared.mapper.on_libraries_downloaded(&info.libraries);
            if !info.extension_rpcs.is_empty() {
                shared
                    .extensions
                    .lock()
                    .entry(isolate_ref.id.clone())
                    .or_default()
                    .extend(info.extension_rpcs.iter().cloned());
            }

            match info.pause_kind {
                Some(PauseKind::Start) => {
                    shared.registry.mark_suspended(&isolate_ref, PauseKind::Start, false);
                    shared.handle_new_isolate(&isolate_ref, true).await;
                }
                Some(kind) => {
                    shared.registry.mark_suspended(&isolate_ref, kind, false);
                    // The first paused isolate found becomes current.
                    shared
                        .current
                        .lock()
                        .get_or_insert_with(|| isolate_ref.id.clone());
                    shared.handle_new_isolate(&isolate_ref, false).await;
                }
                None => {
                    shared.registry.upsert_running(&isolate_ref);
                    shared.handle_new_isolate(&isolate_ref, false).await;
                }
            }
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn client(&self) -> &VmServiceClient {
        &self.shared.client
    }

    pub fn registry(&self) -> &IsolateRegistry {
        &self.shared.registry
    }

    pub fn breakpoints(&self) -> &BreakpointCoordinator {
        &self.shared.breakpoints
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Cancelled when the session ends, by [`Self::teardown`] or because the
    /// runtime went away.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// The explicitly selected isolate, else any known isolate.
    pub fn current_isolate(&self) -> Option<IsolateId> {
        self.shared.current_isolate()
    }

    pub fn set_current_isolate(&self, isolate_id: Option<IsolateId>) {
        *self.shared.current.lock() = isolate_id;
    }

    pub async fn await_resumed(&self, isolate_id: &str) -> ResumeOutcome {
        self.shared.registry.await_resumed(isolate_id).await
    }

    pub async fn step(&self, isolate_id: &str, kind: StepKind) -> DebugResult<bool> {
        self.ensure_open()?;
        stepping::step(&self.shared.client, &self.shared.registry, isolate_id, kind).await
    }

    pub async fn step_over(&self, isolate_id: &str) -> DebugResult<bool> {
        self.step(isolate_id, StepKind::Over).await
    }

    pub async fn step_into(&self, isolate_id: &str) -> DebugResult<bool> {
        self.step(isolate_id, StepKind::Into).await
    }

    pub async fn step_out(&self, isolate_id: &str) -> DebugResult<bool> {
        self.step(isolate_id, StepKind::Out).await
    }

    pub async fn resume(&self, isolate_id: &str) -> DebugResult<()> {
        self.ensure_open()?;
        self.shared.client.resume(isolate_id, None).await?;
        Ok(())
    }

    pub async fn pause(&self, isolate_id: &str) -> DebugResult<()> {
        self.ensure_open()?;
        self.shared.client.pause(isolate_id).await?;
        Ok(())
    }

    /// Resume every suspended isolate. Returns how many resume requests
    /// succeeded; individual failures are logged.
    pub async fn resume_all(&self) -> DebugResult<usize> {
        self.ensure_open()?;
        Ok(self.shared.resume_all().await)
    }

    /// Pause every isolate that is not already suspended.
    pub async fn pause_all(&self) -> DebugResult<usize> {
        self.ensure_open()?;
        let mut paused = 0;
        for id in self.shared.registry.running_ids() {
            match self.shared.client.pause(&id).await {
                Ok(()) => paused += 1,
                Err(err) => {
                    tracing::warn!(target: "kite.debug", isolate = %id, error = %err, "pause failed")
                }
            }
        }
        Ok(paused)
    }

    /// Continue the current isolate until it reaches `position`.
    ///
    /// Does nothing unless the current isolate is suspended. The temporary
    /// breakpoint is removed on the isolate's next pause.
    pub async fn run_to_position(&self, position: &LocalPosition) -> DebugResult<bool> {
        self.ensure_open()?;
        let Some(isolate_id) = self.current_isolate() else {
            return Ok(false);
        };
        if !self.shared.registry.is_suspended(&isolate_id) {
            return Ok(false);
        }
        self.shared.breakpoints.add_temporary(&isolate_id, position).await;
        self.shared.client.resume(&isolate_id, None).await?;
        Ok(true)
    }

    pub async fn set_breakpoint(&self, position: LocalPosition) -> DebugResult<BreakpointHandle> {
        self.ensure_open()?;
        let isolates = self.shared.registry.snapshot_ids();
        Ok(self.shared.breakpoints.set_breakpoint(isolates, position).await)
    }

    pub async fn remove_breakpoint(&self, handle: BreakpointHandle) -> DebugResult<bool> {
        self.ensure_open()?;
        Ok(self.shared.breakpoints.remove_breakpoint(handle).await)
    }

    pub async fn set_exception_mode(&self, mode: ExceptionPauseMode) -> DebugResult<()> {
        self.ensure_open()?;
        let isolates = self.shared.registry.snapshot_ids();
        self.shared.breakpoints.set_exception_mode(isolates, mode).await;
        Ok(())
    }

    pub async fn source_position(
        &self,
        isolate_id: &str,
        script: &ScriptRef,
        token_pos: i64,
    ) -> Option<LocalPosition> {
        self.shared
            .mapper
            .source_position(&self.shared.client, isolate_id, script, token_pos)
            .await
    }

    /// Service extensions announced by `isolate_id`.
    pub fn service_extensions(&self, isolate_id: &str) -> BTreeSet<String> {
        self.shared
            .extensions
            .lock()
            .get(isolate_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_service_extension(&self, extension: &str) -> bool {
        self.shared
            .extensions
            .lock()
            .values()
            .any(|exts| exts.contains(extension))
    }

    pub fn extension_value(&self, extension: &str) -> Option<bool> {
        self.shared.extension_values.lock().get(extension).copied()
    }

    /// Set a boolean service extension on every isolate that provides it and
    /// remember the value for isolates that announce it later.
    pub async fn set_extension_value(&self, extension: &str, enabled: bool) -> DebugResult<usize> {
        self.ensure_open()?;
        self.shared
            .extension_values
            .lock()
            .insert(extension.to_string(), enabled);

        let targets: Vec<IsolateId> = self
            .shared
            .extensions
            .lock()
            .iter()
            .filter(|(_, exts)| exts.contains(extension))
            .map(|(id, _)| id.clone())
            .collect();

        let mut applied = 0;
        for isolate_id in targets {
            self.shared
                .client
                .call_service_extension(&isolate_id, extension, json!({ "enabled": enabled.to_string() }))
                .await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// End the session: dispose resume signals, reject outstanding requests,
    /// stop the listener. Later calls are no-ops.
    pub fn teardown(&self, reason: &str) {
        self.shared.teardown(reason);
    }

    fn ensure_open(&self) -> DebugResult<()> {
        if self.shared.is_closed() {
            Err(DebugError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.shared.teardown("debug session dropped");
        self.listener.abort();
    }
}
