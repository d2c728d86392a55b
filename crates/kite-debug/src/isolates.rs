//! Authoritative model of the isolates the runtime has reported.
//!
//! Status changes are applied only by the event listener, in delivery order.
//! Request calls (resume, step, pause) never touch the registry; the runtime's
//! next event does.

use std::collections::{BTreeSet, HashMap};

use kite_vmservice::{IsolateId, IsolateRef, PauseKind};
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateStatus {
    Running,
    Suspended,
}

/// How a wait on a suspended isolate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    /// The isolate exited while suspended.
    Exited,
    /// The session was torn down before the isolate resumed.
    Disposed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Isolate {
    pub isolate: IsolateRef,
    pub status: IsolateStatus,
    /// Kind of the pause that suspended the isolate, while suspended.
    pub pause_kind: Option<PauseKind>,
    pub at_async_suspension: bool,
}

impl Isolate {
    pub fn id(&self) -> &str {
        &self.isolate.id
    }

    pub fn is_suspended(&self) -> bool {
        self.status == IsolateStatus::Suspended
    }
}

type ResumeSignal = watch::Sender<Option<ResumeOutcome>>;

struct Entry {
    isolate: Isolate,
    /// Present exactly while the isolate is suspended.
    signal: Option<ResumeSignal>,
}

impl Entry {
    fn new(isolate: &IsolateRef) -> Self {
        Self {
            isolate: Isolate {
                isolate: isolate.clone(),
                status: IsolateStatus::Running,
                pause_kind: None,
                at_async_suspension: false,
            },
            signal: None,
        }
    }
}

#[derive(Default)]
struct State {
    isolates: HashMap<IsolateId, Entry>,
    disposed: bool,
}

#[derive(Default)]
pub struct IsolateRegistry {
    state: Mutex<State>,
}

impl IsolateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Isolate> {
        self.state
            .lock()
            .isolates
            .get(id)
            .map(|entry| entry.isolate.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().isolates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ensure the isolate is known. A newly created entry is Running; an
    /// existing entry keeps its status. Returns `true` if the isolate was new.
    pub fn upsert_running(&self, isolate: &IsolateRef) -> bool {
        let mut state = self.state.lock();
        if state.disposed || state.isolates.contains_key(&isolate.id) {
            return false;
        }
        state
            .isolates
            .insert(isolate.id.clone(), Entry::new(isolate));
        true
    }

    /// Running → Suspended, creating the resume signal. Repeated pauses of a
    /// suspended isolate are no-ops. Returns `true` on a transition.
    pub fn mark_suspended(
        &self,
        isolate: &IsolateRef,
        kind: PauseKind,
        at_async_suspension: bool,
    ) -> bool {
        let mut state = self.state.lock();
        if state.disposed {
            return false;
        }
        let entry = state
            .isolates
            .entry(isolate.id.clone())
            .or_insert_with(|| Entry::new(isolate));
        if entry.isolate.is_suspended() {
            return false;
        }

        entry.isolate.status = IsolateStatus::Suspended;
        entry.isolate.pause_kind = Some(kind);
        entry.isolate.at_async_suspension = at_async_suspension;
        if entry.signal.is_none() {
            entry.signal = Some(watch::channel(None).0);
        }
        true
    }

    /// Suspended → Running, completing the resume signal. Unknown or running
    /// isolates are left alone. Returns `true` on a transition.
    pub fn mark_running(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.isolates.get_mut(id) else {
            return false;
        };
        if !entry.isolate.is_suspended() {
            return false;
        }

        entry.isolate.status = IsolateStatus::Running;
        entry.isolate.pause_kind = None;
        entry.isolate.at_async_suspension = false;
        if let Some(signal) = entry.signal.take() {
            signal.send_replace(Some(ResumeOutcome::Resumed));
        }
        true
    }

    /// Forget an exited isolate. Waiters observe [`ResumeOutcome::Exited`].
    pub fn remove(&self, id: &str) -> Option<Isolate> {
        let entry = self.state.lock().isolates.remove(id)?;
        if let Some(signal) = entry.signal {
            signal.send_replace(Some(ResumeOutcome::Exited));
        }
        Some(entry.isolate)
    }

    pub fn is_suspended(&self, id: &str) -> bool {
        self.state
            .lock()
            .isolates
            .get(id)
            .is_some_and(|entry| entry.isolate.is_suspended())
    }

    /// Wait for a suspended isolate to resume.
    ///
    /// Resolves immediately with [`ResumeOutcome::Resumed`] when the isolate
    /// is unknown or not suspended, so a caller can never wait on an isolate it
    /// never saw paused. Once the registry is disposed every call resolves
    /// with [`ResumeOutcome::Disposed`]. May be awaited any number of times.
    pub async fn await_resumed(&self, id: &str) -> ResumeOutcome {
        let receiver = {
            let state = self.state.lock();
            if state.disposed {
                return ResumeOutcome::Disposed;
            }
            state
                .isolates
                .get(id)
                .and_then(|entry| entry.signal.as_ref())
                .map(watch::Sender::subscribe)
        };
        let Some(mut receiver) = receiver else {
            return ResumeOutcome::Resumed;
        };

        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(ResumeOutcome::Disposed),
            Err(_) => ResumeOutcome::Disposed,
        };
        outcome
    }

    /// Ids known at the time of the call, for iteration without holding the lock.
    pub fn snapshot_ids(&self) -> BTreeSet<IsolateId> {
        self.state.lock().isolates.keys().cloned().collect()
    }

    pub fn suspended_ids(&self) -> BTreeSet<IsolateId> {
        self.ids_where(|isolate| isolate.is_suspended())
    }

    pub fn running_ids(&self) -> BTreeSet<IsolateId> {
        self.ids_where(|isolate| !isolate.is_suspended())
    }

    fn ids_where(&self, pred: impl Fn(&Isolate) -> bool) -> BTreeSet<IsolateId> {
        self.state
            .lock()
            .isolates
            .values()
            .filter(|entry| pred(&entry.isolate))
            .map(|entry| entry.isolate.isolate.id.clone())
            .collect()
    }

    /// Complete every outstanding resume signal as disposed and forget all
    /// isolates. Later mutations are ignored.
    pub fn dispose_all(&self) {
        let drained: Vec<Entry> = {
            let mut state = self.state.lock();
            state.disposed = true;
            state.isolates.drain().map(|(_, entry)| entry).collect()
        };
        for signal in drained.into_iter().filter_map(|entry| entry.signal) {
            signal.send_replace(Some(ResumeOutcome::Disposed));
        }
    }
}
