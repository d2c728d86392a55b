use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{
        decode_message, decode_stream_notification, encode_request, params, parse_breakpoint,
        parse_isolate_ref, Incoming, MAX_MESSAGE_BYTES, STREAM_NOTIFY,
    },
    types::{
        Breakpoint, ExceptionPauseMode, IsolateInfo, LibraryRef, PauseKind,
        ReloadReport, Result, Script, StepOption, VmEvent, VmInfo, VmServiceError,
    },
};

type ReplySender = oneshot::Sender<Result<Value>>;

/// Drops the pending entry when a request future goes away before its reply.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().replies.remove(&self.id);
    }
}

/// Events in delivery order. The receive task is the only producer.
pub type VmEventReceiver = mpsc::UnboundedReceiver<VmEvent>;

#[derive(Default)]
struct Pending {
    /// Set once the channel is torn down; later sends fail immediately.
    closed: Option<String>,
    replies: HashMap<u64, ReplySender>,
}

struct Inner {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Inner {
    /// Rejects every outstanding request exactly once and refuses new ones.
    fn close(&self, reason: &str) {
        let drained = {
            let mut pending = self.pending.lock();
            if pending.closed.is_none() {
                pending.closed = Some(reason.to_string());
            }
            std::mem::take(&mut pending.replies)
        };
        self.shutdown.cancel();

        if !drained.is_empty() {
            tracing::debug!(
                target: "kite.vmservice",
                count = drained.len(),
                reason,
                "rejecting outstanding requests"
            );
        }
        for (_id, tx) in drained {
            let _ = tx.send(Err(VmServiceError::Disconnected {
                reason: reason.to_string(),
            }));
        }
    }
}

/// Request dispatcher for the runtime service protocol.
///
/// Every request gets a fresh correlation id; the reply is delivered by the
/// background receive task. There is no per-request timeout: a request stays
/// outstanding until its reply arrives or the channel is shut down.
#[derive(Clone)]
pub struct VmServiceClient {
    inner: Arc<Inner>,
}

impl VmServiceClient {
    /// Wrap an established byte stream and spawn its receive task.
    pub fn from_stream<S>(stream: S) -> (Self, VmEventReceiver)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(read_loop(BufReader::new(reader), inner.clone(), events_tx));

        (Self { inner }, events_rx)
    }

    /// Tear the channel down, rejecting all outstanding requests with
    /// [`VmServiceError::Disconnected`].
    pub fn shutdown(&self, reason: &str) {
        self.inner.close(reason);
    }

    /// Cancelled once the channel closes, either through [`Self::shutdown`]
    /// or because the remote end went away.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().replies.len()
    }

    /// Send a raw request and wait for its correlated reply.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock();
            if let Some(reason) = &pending.closed {
                return Err(VmServiceError::Disconnected {
                    reason: reason.clone(),
                });
            }
            pending.replies.insert(id, tx);
        }
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };

        tracing::trace!(target: "kite.vmservice", id, method, "sending request");
        let packet = encode_request(id, method, params);
        let written = {
            let mut writer = self.inner.writer.lock().await;
            match writer.write_all(&packet).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = written {
            self.inner.close(&format!("write failed: {err}"));
            return Err(err.into());
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_closed) => Err(VmServiceError::Disconnected {
                reason: "reply channel dropped".to_string(),
            }),
        }
    }

    pub async fn get_vm(&self) -> Result<VmInfo> {
        let vm = self.send("getVM", json!({})).await?;
        let isolates = vm
            .get("isolates")
            .and_then(Value::as_array)
            .map(|isolates| isolates.iter().map(parse_isolate_ref).collect::<Result<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        Ok(VmInfo {
            name: str_field(&vm, "name"),
            version: str_field(&vm, "version"),
            isolates,
        })
    }

    pub async fn get_isolate(&self, isolate_id: &str) -> Result<IsolateInfo> {
        let isolate = self
            .send("getIsolate", json!({ "isolateId": isolate_id }))
            .await?;
        if isolate.get("type").and_then(Value::as_str) == Some("Sentinel") {
            return Err(VmServiceError::Protocol(format!(
                "isolate {isolate_id} is no longer available"
            )));
        }

        let pause_kind = isolate
            .get("pauseEvent")
            .and_then(|event| event.get("kind"))
            .and_then(Value::as_str)
            .and_then(PauseKind::from_event_kind);
        let libraries = match isolate.get("libraries") {
            Some(libraries) => serde_json::from_value::<Vec<LibraryRef>>(libraries.clone())?,
            None => Vec::new(),
        };
        let extension_rpcs = isolate
            .get("extensionRPCs")
            .and_then(Value::as_array)
            .map(|rpcs| {
                rpcs.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(IsolateInfo {
            isolate: parse_isolate_ref(&isolate)?,
            pause_kind,
            libraries,
            extension_rpcs,
        })
    }

    pub async fn stream_listen(&self, stream_id: &str) -> Result<()> {
        match self.send("streamListen", json!({ "streamId": stream_id })).await {
            Ok(_) => Ok(()),
            // 103: stream already subscribed.
            Err(VmServiceError::Rpc { code: 103, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn add_breakpoint_with_script_uri(
        &self,
        isolate_id: &str,
        script_uri: &str,
        line: u32,
    ) -> Result<Breakpoint> {
        let bp = self
            .send(
                "addBreakpointWithScriptUri",
                json!({ "isolateId": isolate_id, "scriptUri": script_uri, "line": line }),
            )
            .await?;
        parse_breakpoint(&bp)
    }

    pub async fn remove_breakpoint(&self, isolate_id: &str, breakpoint_id: &str) -> Result<()> {
        self.send(
            "removeBreakpoint",
            json!({ "isolateId": isolate_id, "breakpointId": breakpoint_id }),
        )
        .await?;
        Ok(())
    }

    pub async fn resume(&self, isolate_id: &str, step: Option<StepOption>) -> Result<()> {
        let params = params([
            ("isolateId", Some(json!(isolate_id))),
            ("step", step.map(|step| json!(step.as_protocol_str()))),
        ]);
        self.send("resume", params).await?;
        Ok(())
    }

    pub async fn pause(&self, isolate_id: &str) -> Result<()> {
        self.send("pause", json!({ "isolateId": isolate_id })).await?;
        Ok(())
    }

    pub async fn set_exception_pause_mode(
        &self,
        isolate_id: &str,
        mode: ExceptionPauseMode,
    ) -> Result<()> {
        self.send(
            "setIsolatePauseMode",
            json!({ "isolateId": isolate_id, "exceptionPauseMode": mode.as_protocol_str() }),
        )
        .await?;
        Ok(())
    }

    pub async fn get_object(&self, isolate_id: &str, object_id: &str) -> Result<Value> {
        self.send(
            "getObject",
            json!({ "isolateId": isolate_id, "objectId": object_id }),
        )
        .await
    }

    pub async fn get_script(&self, isolate_id: &str, script_id: &str) -> Result<Script> {
        let script = self.get_object(isolate_id, script_id).await?;
        if script.get("type").and_then(Value::as_str) != Some("Script") {
            return Err(VmServiceError::Protocol(format!(
                "object {script_id} is not a script"
            )));
        }
        let token_pos_table = match script.get("tokenPosTable") {
            Some(table) => serde_json::from_value(table.clone())?,
            None => Vec::new(),
        };
        Ok(Script {
            id: str_field(&script, "id"),
            uri: str_field(&script, "uri"),
            source: script
                .get("source")
                .and_then(Value::as_str)
                .map(str::to_string),
            token_pos_table,
        })
    }

    pub async fn reload_sources(&self, isolate_id: &str, pause: bool) -> Result<ReloadReport> {
        let report = self
            .send(
                "reloadSources",
                json!({ "isolateId": isolate_id, "pause": pause }),
            )
            .await?;
        let notices = report
            .get("notices")
            .and_then(Value::as_array)
            .map(|notices| {
                notices
                    .iter()
                    .filter_map(|n| n.get("message").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ReloadReport {
            success: report
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            notices,
        })
    }

    pub async fn call_service_extension(
        &self,
        isolate_id: &str,
        method: &str,
        mut args: Value,
    ) -> Result<Value> {
        if let Value::Object(map) = &mut args {
            map.insert("isolateId".to_string(), json!(isolate_id));
        } else {
            args = json!({ "isolateId": isolate_id });
        }
        self.send(method, args).await
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn read_loop<R>(
    mut reader: BufReader<R>,
    inner: Arc<Inner>,
    events: mpsc::UnboundedSender<VmEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let reason = loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_MESSAGE_BYTES + 1);
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break "shut down".to_string(),
            res = limited.read_line(&mut line) => res,
        };
        match read {
            Ok(0) => break "connection closed by runtime".to_string(),
            Ok(n) if n as u64 > MAX_MESSAGE_BYTES => {
                break format!("message exceeds {MAX_MESSAGE_BYTES} bytes");
            }
            Ok(_) => {}
            Err(err) => break format!("read failed: {err}"),
        }

        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        match decode_message(text) {
            Ok(Incoming::Response { id, result }) => {
                let tx = inner.pending.lock().replies.remove(&id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(result.map_err(|err| VmServiceError::Rpc {
                            code: err.code,
                            message: err.message,
                        }));
                    }
                    None => {
                        tracing::debug!(target: "kite.vmservice", id, "reply for unknown request");
                    }
                }
            }
            Ok(Incoming::Notification { method, params }) if method == STREAM_NOTIFY => {
                match decode_stream_notification(&params) {
                    Ok(Some(event)) => {
                        let _ = events.send(event);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(target: "kite.vmservice", error = %err, "dropping malformed event");
                    }
                }
            }
            Ok(Incoming::Notification { method, .. }) => {
                tracing::trace!(target: "kite.vmservice", method, "ignoring notification");
            }
            Err(err) => {
                tracing::warn!(target: "kite.vmservice", error = %err, "dropping malformed message");
            }
        }
    };

    tracing::debug!(target: "kite.vmservice", reason, "receive loop finished");
    inner.close(&reason);
}
