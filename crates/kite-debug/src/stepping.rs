use kite_vmservice::{StepOption, VmServiceClient};

use crate::{error::DebugResult, isolates::IsolateRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Over,
    Into,
    Out,
}

impl StepKind {
    /// Step-over from an async suspension point continues to the point where
    /// the awaited future completes.
    fn step_option(self, at_async_suspension: bool) -> StepOption {
        match self {
            StepKind::Over if at_async_suspension => StepOption::OverAsyncSuspension,
            StepKind::Over => StepOption::Over,
            StepKind::Into => StepOption::Into,
            StepKind::Out => StepOption::Out,
        }
    }
}

/// Issue a resume-with-step request if the isolate is currently suspended.
///
/// Returns `Ok(false)` without contacting the runtime otherwise. The
/// registry is not updated here; the runtime's resume and pause events do that.
pub(crate) async fn step(
    client: &VmServiceClient,
    registry: &IsolateRegistry,
    isolate_id: &str,
    kind: StepKind,
) -> DebugResult<bool> {
    let Some(isolate) = registry.get(isolate_id).filter(|isolate| isolate.is_suspended()) else {
        tracing::trace!(target: "kite.debug", isolate = isolate_id, ?kind, "step ignored: not suspended");
        return Ok(false);
    };

    let option = kind.step_option(isolate.at_async_suspension);
    tracing::debug!(target: "kite.debug", isolate = isolate_id, ?option, "stepping");
    client.resume(isolate_id, Some(option)).await?;
    Ok(true)
}
