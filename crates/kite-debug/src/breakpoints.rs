//! Line and exception breakpoints, fanned out to every isolate and every URI
//! the position mapper reports for a file.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use kite_vmservice::{BreakpointId, ExceptionPauseMode, IsolateId, VmServiceClient};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::mapper::{LocalPosition, PositionMapper};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointHandle(u64);

struct LineBreakpoint {
    position: LocalPosition,
    remote: HashMap<IsolateId, Vec<BreakpointId>>,
    /// Isolates an add was issued for, including ones still in flight.
    claimed: HashSet<IsolateId>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    breakpoints: HashMap<BreakpointHandle, LineBreakpoint>,
    exception_mode: ExceptionPauseMode,
    /// Run-to-position breakpoints, removed on the isolate's next pause.
    temporary: HashMap<IsolateId, Vec<BreakpointId>>,
    resolved: HashSet<BreakpointId>,
    installed: HashMap<IsolateId, Arc<OnceCell<()>>>,
}

pub struct BreakpointCoordinator {
    client: VmServiceClient,
    mapper: Arc<dyn PositionMapper>,
    state: Mutex<State>,
}

impl BreakpointCoordinator {
    pub fn new(client: VmServiceClient, mapper: Arc<dyn PositionMapper>) -> Self {
        Self {
            client,
            mapper,
            state: Mutex::new(State::default()),
        }
    }

    /// Register a line breakpoint and add it to each of `isolates`.
    ///
    /// Failures for individual isolates or URIs are logged; the handle stays
    /// registered and is applied to isolates that start later.
    pub async fn set_breakpoint(
        &self,
        isolates: impl IntoIterator<Item = IsolateId>,
        position: LocalPosition,
    ) -> BreakpointHandle {
        let claimed: HashSet<IsolateId> = isolates.into_iter().collect();
        let handle = {
            let mut state = self.state.lock();
            state.next_handle += 1;
            let handle = BreakpointHandle(state.next_handle);
            state.breakpoints.insert(
                handle,
                LineBreakpoint {
                    position: position.clone(),
                    remote: HashMap::new(),
                    claimed: claimed.clone(),
                },
            );
            handle
        };

        for isolate_id in claimed {
            self.add_remote(handle, &isolate_id, &position).await;
        }
        handle
    }

    /// Remove a breakpoint from every isolate it was added to.
    pub async fn remove_breakpoint(&self, handle: BreakpointHandle) -> bool {
        let Some(bp) = self.state.lock().breakpoints.remove(&handle) else {
            return false;
        };
        for (isolate_id, ids) in bp.remote {
            for id in ids {
                self.remove_remote(&isolate_id, &id).await;
            }
        }
        true
    }

    /// Switch between no exception breaks, uncaught-only and first-chance.
    pub async fn set_exception_mode(
        &self,
        isolates: impl IntoIterator<Item = IsolateId>,
        mode: ExceptionPauseMode,
    ) {
        self.state.lock().exception_mode = mode;
        for isolate_id in isolates {
            self.apply_exception_mode(&isolate_id, mode).await;
        }
    }

    /// Install every registered breakpoint and the exception mode into an
    /// isolate. Concurrent and repeated calls for the same isolate share one
    /// installation.
    pub async fn install_into(&self, isolate_id: &str) {
        let cell = self
            .state
            .lock()
            .installed
            .entry(isolate_id.to_string())
            .or_default()
            .clone();

        cell.get_or_init(|| async {
            let (pending, mode) = {
                let mut state = self.state.lock();
                let pending: Vec<_> = state
                    .breakpoints
                    .iter_mut()
                    .filter_map(|(handle, bp)| {
                        bp.claimed
                            .insert(isolate_id.to_string())
                            .then(|| (*handle, bp.position.clone()))
                    })
                    .collect();
                (pending, state.exception_mode)
            };

            for (handle, position) in pending {
                self.add_remote(handle, isolate_id, &position).await;
            }
            self.apply_exception_mode(isolate_id, mode).await;
        })
        .await;
    }

    /// Add a one-shot breakpoint for `isolate_id`, cleared by
    /// [`Self::clear_temporary`] on the isolate's next pause.
    pub async fn add_temporary(&self, isolate_id: &str, position: &LocalPosition) -> usize {
        let mut added = 0;
        for uri in self.mapper.uris_for_file(&position.file) {
            match self
                .client
                .add_breakpoint_with_script_uri(isolate_id, &uri, position.line)
                .await
            {
                Ok(bp) => {
                    self.state
                        .lock()
                        .temporary
                        .entry(isolate_id.to_string())
                        .or_default()
                        .push(bp.id);
                    added += 1;
                }
                Err(err) => {
                    tracing::debug!(target: "kite.debug", %uri, error = %err, "temporary breakpoint not set");
                }
            }
        }
        added
    }

    pub fn has_temporary(&self, isolate_id: &str) -> bool {
        self.state.lock().temporary.contains_key(isolate_id)
    }

    pub async fn clear_temporary(&self, isolate_id: &str) {
        let Some(ids) = self.state.lock().temporary.remove(isolate_id) else {
            return;
        };
        for id in ids {
            self.remove_remote(isolate_id, &id).await;
        }
    }

    /// Drop remote ids belonging to an isolate that exited.
    pub fn forget_isolate(&self, isolate_id: &str) {
        let mut state = self.state.lock();
        for bp in state.breakpoints.values_mut() {
            bp.remote.remove(isolate_id);
            bp.claimed.remove(isolate_id);
        }
        state.temporary.remove(isolate_id);
        state.installed.remove(isolate_id);
    }

    pub fn mark_resolved(&self, breakpoint_id: &str) {
        self.state.lock().resolved.insert(breakpoint_id.to_string());
    }

    /// A breakpoint is verified once any of its remote breakpoints resolved.
    pub fn is_resolved(&self, handle: BreakpointHandle) -> bool {
        let state = self.state.lock();
        state.breakpoints.get(&handle).is_some_and(|bp| {
            bp.remote
                .values()
                .flatten()
                .any(|id| state.resolved.contains(id))
        })
    }

    /// Remote breakpoint ids registered for `handle`, keyed by isolate.
    pub fn remote_ids(&self, handle: BreakpointHandle) -> HashMap<IsolateId, Vec<BreakpointId>> {
        self.state
            .lock()
            .breakpoints
            .get(&handle)
            .map(|bp| bp.remote.clone())
            .unwrap_or_default()
    }

    async fn add_remote(&self, handle: BreakpointHandle, isolate_id: &str, position: &LocalPosition) {
        for uri in self.mapper.uris_for_file(&position.file) {
            let bp = match self
                .client
                .add_breakpoint_with_script_uri(isolate_id, &uri, position.line)
                .await
            {
                Ok(bp) => bp,
                Err(err) => {
                    tracing::debug!(
                        target: "kite.debug",
                        isolate = isolate_id,
                        %uri,
                        line = position.line,
                        error = %err,
                        "breakpoint not added"
                    );
                    continue;
                }
            };

            let orphaned = {
                let mut state = self.state.lock();
                if bp.resolved {
                    state.resolved.insert(bp.id.clone());
                }
                match state.breakpoints.get_mut(&handle) {
                    Some(entry) => {
                        entry
                            .remote
                            .entry(isolate_id.to_string())
                            .or_default()
                            .push(bp.id.clone());
                        false
                    }
                    None => true,
                }
            };
            // Removed while the add was in flight.
            if orphaned {
                self.remove_remote(isolate_id, &bp.id).await;
            }
        }
    }

    async fn remove_remote(&self, isolate_id: &str, breakpoint_id: &str) {
        self.state.lock().resolved.remove(breakpoint_id);
        if let Err(err) = self.client.remove_breakpoint(isolate_id, breakpoint_id).await {
            tracing::debug!(
                target: "kite.debug",
                isolate = isolate_id,
                breakpoint = breakpoint_id,
                error = %err,
                "breakpoint not removed"
            );
        }
    }

    async fn apply_exception_mode(&self, isolate_id: &str, mode: ExceptionPauseMode) {
        if let Err(err) = self.client.set_exception_pause_mode(isolate_id, mode).await {
            tracing::debug!(
                target: "kite.debug",
                isolate = isolate_id,
                error = %err,
                "exception pause mode not applied"
            );
        }
    }
}
