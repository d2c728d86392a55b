//! Applies runtime events to the session, strictly in delivery order.
//!
//! Registry updates happen inline. Anything that needs a request to the
//! runtime runs on its own task so the next event is never held up.

use std::sync::Arc;

use kite_vmservice::{OutputStream, PauseKind, VmEvent, VmEventReceiver};
use serde_json::json;

use crate::session::Shared;

pub(crate) async fn run(shared: Arc<Shared>, mut events: VmEventReceiver) {
    loop {
        let event = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Some(event) => dispatch(&shared, event),
            None => break,
        }
    }
    // The receive task dropped its sender: the connection is gone.
    shared.teardown("runtime service connection closed");
}

pub(crate) fn dispatch(shared: &Arc<Shared>, event: VmEvent) {
    tracing::trace!(target: "kite.debug", ?event, "runtime event");
    match event {
        VmEvent::IsolateStart { isolate } | VmEvent::IsolateRunnable { isolate } => {
            if shared.registry.upsert_running(&isolate) {
                let shared = shared.clone();
                tokio::spawn(async move { shared.handle_new_isolate(&isolate, false).await });
            }
        }
        VmEvent::Pause {
            isolate,
            kind,
            at_async_suspension,
            ..
        } => {
            shared.registry.mark_suspended(&isolate, kind, at_async_suspension);

            if kind == PauseKind::Start {
                let shared = shared.clone();
                tokio::spawn(async move { shared.handle_new_isolate(&isolate, true).await });
                return;
            }

            *shared.current.lock() = Some(isolate.id.clone());
            if shared.breakpoints.has_temporary(&isolate.id) {
                let shared = shared.clone();
                tokio::spawn(async move { shared.breakpoints.clear_temporary(&isolate.id).await });
            }
        }
        VmEvent::Resume { isolate } => {
            shared.registry.mark_running(&isolate.id);
        }
        VmEvent::IsolateExit { isolate } => {
            let was_current = shared.current_isolate().as_deref() == Some(isolate.id.as_str());

            shared.registry.remove(&isolate.id);
            shared.breakpoints.forget_isolate(&isolate.id);
            shared.extensions.lock().remove(&isolate.id);
            shared.mapper.forget_isolate(&isolate.id);

            // Otherwise nothing would point at the remaining suspended isolates.
            if was_current {
                {
                    let mut current = shared.current.lock();
                    if current.as_deref() == Some(isolate.id.as_str()) {
                        *current = None;
                    }
                }
                let shared = shared.clone();
                tokio::spawn(async move {
                    let resumed = shared.resume_all().await;
                    tracing::debug!(target: "kite.debug", resumed, "current isolate exited; resumed the rest");
                });
            }
        }
        VmEvent::BreakpointResolved { breakpoint, .. } => {
            shared.breakpoints.mark_resolved(&breakpoint.id);
        }
        VmEvent::ServiceExtensionAdded { isolate, extension } => {
            shared
                .extensions
                .lock()
                .entry(isolate.id.clone())
                .or_default()
                .insert(extension.clone());

            let restore = shared.extension_values.lock().get(&extension).copied();
            if let Some(enabled) = restore {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if shared.is_closed() {
                        return;
                    }
                    let args = json!({ "enabled": enabled.to_string() });
                    if let Err(err) = shared
                        .client
                        .call_service_extension(&isolate.id, &extension, args)
                        .await
                    {
                        tracing::debug!(target: "kite.debug", %extension, error = %err, "failed to restore extension state");
                    }
                });
            }
        }
        VmEvent::Write { stream, bytes } => {
            let text = String::from_utf8_lossy(&bytes);
            let stream_name = match stream {
                OutputStream::Stdout => "stdout",
                OutputStream::Stderr => "stderr",
            };
            tracing::info!(target: "kite.debug.output", stream = stream_name, "{}", text.trim_end());
            if let Some(output) = &shared.output {
                output.write(stream, &text);
            }
        }
    }
}
