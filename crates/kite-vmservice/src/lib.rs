//! Runtime service protocol client.
//!
//! The runtime publishes a service endpoint once it is up; [`connect`] waits
//! for it and returns a [`VmServiceClient`] plus the ordered stream of
//! [`VmEvent`]s pushed by the runtime. A single background task owns the
//! receive side of the connection and delivers both replies and events, so
//! callers never block event delivery.

mod client;
mod codec;
mod connector;
pub mod types;

pub use client::{VmEventReceiver, VmServiceClient};
pub use codec::MAX_MESSAGE_BYTES;
pub use connector::{connect, socket_address, ConnectError, Connection, EndpointProvider};
pub use types::{
    Breakpoint, BreakpointId, ExceptionPauseMode, IsolateId, IsolateInfo, IsolateRef, LibraryRef,
    OutputStream, PauseKind, ReloadReport, Result, Script, ScriptRef, StepOption, VmEvent, VmInfo,
    VmServiceError, DEFAULT_STREAMS,
};

// Compiled unconditionally for this crate's own tests and behind
// `test-support` for downstream suites.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
