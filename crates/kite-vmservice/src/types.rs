use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque isolate identifier assigned by the runtime (e.g. `isolates/1234`).
pub type IsolateId = String;
/// Opaque breakpoint identifier assigned by the runtime.
pub type BreakpointId = String;

pub type Result<T> = std::result::Result<T, VmServiceError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsolateRef {
    pub id: IsolateId,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRef {
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptRef {
    pub id: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInfo {
    pub name: String,
    pub version: String,
    pub isolates: Vec<IsolateRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolateInfo {
    pub isolate: IsolateRef,
    /// `None` when the isolate is running (or has not reported a pause).
    pub pause_kind: Option<PauseKind>,
    pub libraries: Vec<LibraryRef>,
    pub extension_rpcs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub resolved: bool,
    pub script_uri: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub id: String,
    pub uri: String,
    pub source: Option<String>,
    /// Rows of `[line, tokenPos, column, tokenPos, column, ...]`.
    pub token_pos_table: Vec<Vec<i64>>,
}

impl Script {
    /// Maps a token offset to a 1-based `(line, column)` pair.
    pub fn line_column(&self, token_pos: i64) -> Option<(u32, u32)> {
        for row in &self.token_pos_table {
            let Some((&line, rest)) = row.split_first() else {
                continue;
            };
            for pair in rest.chunks_exact(2) {
                if pair[0] == token_pos {
                    return Some((u32::try_from(line).ok()?, u32::try_from(pair[1]).ok()?));
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    pub success: bool,
    pub notices: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepOption {
    Into,
    Over,
    OverAsyncSuspension,
    Out,
}

impl StepOption {
    pub fn as_protocol_str(self) -> &'static str {
        match self {
            StepOption::Into => "Into",
            StepOption::Over => "Over",
            StepOption::OverAsyncSuspension => "OverAsyncSuspension",
            StepOption::Out => "Out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExceptionPauseMode {
    #[default]
    None,
    /// Break only on exceptions nothing catches.
    Unhandled,
    /// First-chance: break on every throw.
    All,
}

impl ExceptionPauseMode {
    pub fn as_protocol_str(self) -> &'static str {
        match self {
            ExceptionPauseMode::None => "None",
            ExceptionPauseMode::Unhandled => "Unhandled",
            ExceptionPauseMode::All => "All",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PauseKind {
    Start,
    Exit,
    Breakpoint,
    Exception,
    Interrupted,
    PostRequest,
}

impl PauseKind {
    pub fn from_event_kind(kind: &str) -> Option<Self> {
        Some(match kind {
            "PauseStart" => PauseKind::Start,
            "PauseExit" => PauseKind::Exit,
            "PauseBreakpoint" => PauseKind::Breakpoint,
            "PauseException" => PauseKind::Exception,
            "PauseInterrupted" => PauseKind::Interrupted,
            "PausePostRequest" => PauseKind::PostRequest,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Streams the session subscribes to after connecting.
pub const DEFAULT_STREAMS: &[&str] = &["Isolate", "Debug", "Stdout", "Stderr", "Extension"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmEvent {
    IsolateStart {
        isolate: IsolateRef,
    },
    IsolateRunnable {
        isolate: IsolateRef,
    },
    IsolateExit {
        isolate: IsolateRef,
    },
    Pause {
        isolate: IsolateRef,
        kind: PauseKind,
        at_async_suspension: bool,
        /// Breakpoints that caused a `PauseBreakpoint`, if any.
        breakpoint_ids: Vec<BreakpointId>,
    },
    Resume {
        isolate: IsolateRef,
    },
    BreakpointResolved {
        isolate: IsolateRef,
        breakpoint: Breakpoint,
    },
    ServiceExtensionAdded {
        isolate: IsolateRef,
        extension: String,
    },
    Write {
        stream: OutputStream,
        bytes: Vec<u8>,
    },
}

impl VmEvent {
    pub fn isolate(&self) -> Option<&IsolateRef> {
        match self {
            VmEvent::IsolateStart { isolate }
            | VmEvent::IsolateRunnable { isolate }
            | VmEvent::IsolateExit { isolate }
            | VmEvent::Pause { isolate, .. }
            | VmEvent::Resume { isolate }
            | VmEvent::BreakpointResolved { isolate, .. }
            | VmEvent::ServiceExtensionAdded { isolate, .. } => Some(isolate),
            VmEvent::Write { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum VmServiceError {
    #[error("runtime service connection closed: {reason}")]
    Disconnected { reason: String },
    #[error("runtime service error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("runtime service protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid JSON from runtime service: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmServiceError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, VmServiceError::Disconnected { .. })
    }
}
