//! Debug session model for applications exposing the runtime service
//! protocol.
//!
//! A [`DebugSession`] keeps an [`IsolateRegistry`] in sync with the events
//! the runtime pushes, fans breakpoints out to every isolate through the
//! [`BreakpointCoordinator`], and gates stepping on the registry's view of
//! which isolates are suspended.

pub mod actions;
pub mod breakpoints;
pub mod error;
pub mod isolates;
mod listener;
pub mod mapper;
pub mod session;
pub mod stepping;

pub use crate::actions::SessionAction;
pub use crate::breakpoints::{BreakpointCoordinator, BreakpointHandle};
pub use crate::error::{DebugError, DebugResult};
pub use crate::isolates::{Isolate, IsolateRegistry, IsolateStatus, ResumeOutcome};
pub use crate::mapper::{FileUriMapper, LocalPosition, OutputSink, PositionMapper};
pub use crate::session::{DebugSession, SessionCollaborators};
pub use crate::stepping::StepKind;
