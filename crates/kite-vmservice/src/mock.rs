use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;

/// A small in-process runtime service used by unit and integration tests.
///
/// It speaks the same line-delimited JSON-RPC as a real runtime, records
/// every request, answers with canned results unless a test scripted a
/// different reply, and can push stream events to connected clients.
pub struct MockVmService {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Debug, Clone)]
pub enum MockReply {
    Result(Value),
    Error { code: i64, message: String },
    Delayed(Duration, Box<MockReply>),
    /// Record the request but never answer it.
    NoReply,
}

impl MockReply {
    pub fn result(value: Value) -> Self {
        MockReply::Result(value)
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        MockReply::Error {
            code,
            message: message.into(),
        }
    }

    pub fn delayed(delay: Duration, reply: MockReply) -> Self {
        MockReply::Delayed(delay, Box::new(reply))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockRequest {
    pub method: String,
    pub params: Value,
}

struct Client {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

struct State {
    vm_isolates: Mutex<Vec<Value>>,
    isolates: Mutex<HashMap<String, Value>>,
    objects: Mutex<HashMap<String, Value>>,
    scripted: Mutex<HashMap<String, VecDeque<MockReply>>>,
    requests: Mutex<Vec<MockRequest>>,
    requests_seen: watch::Sender<usize>,
    clients: Mutex<Vec<Client>>,
    /// Connections accepted so far, including ones already dropped.
    clients_seen: watch::Sender<usize>,
    next_breakpoint: AtomicU64,
}

impl MockVmService {
    pub async fn spawn() -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State {
            vm_isolates: Mutex::new(Vec::new()),
            isolates: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            requests_seen: watch::channel(0).0,
            clients: Mutex::new(Vec::new()),
            clients_seen: watch::channel(0).0,
            next_breakpoint: AtomicU64::new(1),
        });

        tokio::spawn(accept_loop(listener, state.clone(), shutdown.clone()));

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Make `isolate` visible through `getVM` and answer `getIsolate` for it.
    ///
    /// `pause_kind` is the event kind reported as the isolate's pause event
    /// (e.g. `"PauseStart"`); `None` reports a running isolate.
    pub fn add_isolate(&self, id: &str, name: &str, pause_kind: Option<&str>, libraries: Vec<Value>) {
        let isolate_ref = json!({ "type": "@Isolate", "id": id, "name": name });
        self.state.vm_isolates.lock().push(isolate_ref);

        let pause_event = json!({ "type": "Event", "kind": pause_kind.unwrap_or("Resume") });
        self.state.isolates.lock().insert(
            id.to_string(),
            json!({
                "type": "Isolate",
                "id": id,
                "name": name,
                "pauseEvent": pause_event,
                "libraries": libraries,
                "extensionRPCs": [],
            }),
        );
    }

    /// Answer `getObject` for `id` with `value`.
    pub fn add_object(&self, id: &str, value: Value) {
        self.state.objects.lock().insert(id.to_string(), value);
    }

    /// Queue a reply for the next request of `method`, ahead of the default.
    pub fn reply_once(&self, method: &str, reply: MockReply) {
        self.state
            .scripted
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.state.requests.lock().clone()
    }

    pub fn requests_for(&self, method: &str) -> Vec<MockRequest> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|req| req.method == method)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` requests of `method` were received.
    pub async fn wait_for_requests(&self, method: &str, count: usize) {
        let mut seen = self.state.requests_seen.subscribe();
        let _ = seen
            .wait_for(|_| self.state.count(method) >= count)
            .await;
    }

    /// Wait until `count` connections have been accepted.
    pub async fn wait_for_clients(&self, count: usize) {
        let mut seen = self.state.clients_seen.subscribe();
        let _ = seen.wait_for(|accepted| *accepted >= count).await;
    }

    /// Push a `streamNotify` event to every connected client.
    pub fn push_event(&self, stream_id: &str, event: Value) {
        let line = json!({
            "jsonrpc": "2.0",
            "method": "streamNotify",
            "params": { "streamId": stream_id, "event": event },
        })
        .to_string();
        for client in self.state.clients.lock().iter() {
            let _ = client.outbound.send(line.clone());
        }
    }

    /// Drop every open connection, as a runtime that exits would.
    pub fn disconnect_clients(&self) {
        for client in self.state.clients.lock().drain(..) {
            client.cancel.cancel();
        }
    }
}

impl Drop for MockVmService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl State {
    fn count(&self, method: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|req| req.method == method)
            .count()
    }

    fn record(&self, method: &str, params: &Value) {
        let total = {
            let mut requests = self.requests.lock();
            requests.push(MockRequest {
                method: method.to_string(),
                params: params.clone(),
            });
            requests.len()
        };
        self.requests_seen.send_replace(total);
    }

    fn reply_for(&self, method: &str, params: &Value) -> MockReply {
        if let Some(reply) = self
            .scripted
            .lock()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }

        let isolate_id = params.get("isolateId").and_then(Value::as_str).unwrap_or_default();
        let result = match method {
            "getVM" => json!({
                "type": "VM",
                "name": "vm",
                "version": "3.4.0",
                "isolates": self.vm_isolates.lock().clone(),
            }),
            "getIsolate" => match self.isolates.lock().get(isolate_id) {
                Some(isolate) => isolate.clone(),
                None => json!({ "type": "Sentinel", "kind": "Collected" }),
            },
            "getObject" => {
                let object_id = params.get("objectId").and_then(Value::as_str).unwrap_or_default();
                self.objects
                    .lock()
                    .get(object_id)
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "Instance", "id": object_id }))
            }
            "addBreakpointWithScriptUri" => {
                let n = self.next_breakpoint.fetch_add(1, Ordering::Relaxed);
                json!({
                    "type": "Breakpoint",
                    "id": format!("breakpoints/{n}"),
                    "resolved": false,
                    "location": {
                        "type": "UnresolvedSourceLocation",
                        "scriptUri": params.get("scriptUri").cloned().unwrap_or(Value::Null),
                        "line": params.get("line").cloned().unwrap_or(Value::Null),
                    },
                })
            }
            "reloadSources" => json!({ "type": "ReloadReport", "success": true }),
            _ => json!({ "type": "Success" }),
        };
        MockReply::Result(result)
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<State>, shutdown: CancellationToken) {
    loop {
        let socket = tokio::select! {
            _ = shutdown.cancelled() => return,
            accept = listener.accept() => match accept {
                Ok((socket, _)) => socket,
                Err(_) => return,
            },
        };

        let cancel = shutdown.child_token();
        let (outbound, rx) = mpsc::unbounded_channel();
        state.clients.lock().push(Client {
            outbound: outbound.clone(),
            cancel: cancel.clone(),
        });
        state.clients_seen.send_modify(|accepted| *accepted += 1);
        tokio::spawn(serve(socket, state.clone(), outbound, rx, cancel));
    }
}

async fn serve(
    socket: TcpStream,
    state: Arc<State>,
    outbound: mpsc::UnboundedSender<String>,
    mut rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let (reader, mut writer) = socket.into_split();

    let writer_cancel = cancel.clone();
    let write_task = tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                line = rx.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            if writer.write_all(line.as_bytes()).await.is_err()
                || writer.write_all(b"\n").await.is_err()
                || writer.flush().await.is_err()
            {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            continue;
        };
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

        let reply = state.reply_for(method, &params);
        state.record(method, &params);
        send_reply(id, reply, outbound.clone(), cancel.clone());
    }

    cancel.cancel();
    let _ = write_task.await;
}

fn send_reply(
    id: Value,
    reply: MockReply,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    match reply {
        MockReply::NoReply => {}
        MockReply::Delayed(delay, reply) => {
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => send_reply(id, *reply, outbound, cancel.clone()),
                }
            });
        }
        MockReply::Result(result) => {
            let _ = outbound.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string());
        }
        MockReply::Error { code, message } => {
            let _ = outbound.send(
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": code, "message": message },
                })
                .to_string(),
            );
        }
    }
}
