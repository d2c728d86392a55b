use crate::{error::DebugResult, session::DebugSession, stepping::StepKind};

/// User-facing session commands, each exposing whether it can run now, its
/// toggle state if it has one, and how to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Step(StepKind),
    ResumeAll,
    PauseAll,
    /// Flip a boolean service extension such as `ext.app.debugPaint`.
    ToggleExtension { extension: String },
}

impl SessionAction {
    pub fn toggle(extension: impl Into<String>) -> Self {
        SessionAction::ToggleExtension {
            extension: extension.into(),
        }
    }

    pub fn is_enabled(&self, session: &DebugSession) -> bool {
        if session.is_closed() {
            return false;
        }
        let registry = session.registry();
        match self {
            SessionAction::Step(_) => session
                .current_isolate()
                .is_some_and(|id| registry.is_suspended(&id)),
            SessionAction::ResumeAll => !registry.suspended_ids().is_empty(),
            SessionAction::PauseAll => !registry.running_ids().is_empty(),
            SessionAction::ToggleExtension { extension } => session.has_service_extension(extension),
        }
    }

    /// Toggle state; `None` for actions that are not toggles.
    pub fn current_value(&self, session: &DebugSession) -> Option<bool> {
        match self {
            SessionAction::ToggleExtension { extension } => {
                Some(session.extension_value(extension).unwrap_or(false))
            }
            _ => None,
        }
    }

    /// Run the action. Returns `Ok(false)` when it was not applicable.
    pub async fn perform(&self, session: &DebugSession) -> DebugResult<bool> {
        if !self.is_enabled(session) {
            return Ok(false);
        }
        match self {
            SessionAction::Step(kind) => match session.current_isolate() {
                Some(id) => session.step(&id, *kind).await,
                None => Ok(false),
            },
            SessionAction::ResumeAll => Ok(session.resume_all().await? > 0),
            SessionAction::PauseAll => Ok(session.pause_all().await? > 0),
            SessionAction::ToggleExtension { extension } => {
                let next = !self.current_value(session).unwrap_or(false);
                session.set_extension_value(extension, next).await?;
                Ok(true)
            }
        }
    }
}
