use std::{sync::Arc, time::Duration};

use kite_debug::{BreakpointCoordinator, LocalPosition};
use kite_vmservice::{
    mock::{MockReply, MockVmService},
    ExceptionPauseMode, VmServiceClient,
};
use serde_json::json;

use crate::harness::{eventually, isolate_event, start, StaticMapper};

fn main_dart(line: u32) -> LocalPosition {
    LocalPosition::new("/app/lib/main.dart", line)
}

#[tokio::test]
async fn breakpoints_fan_out_to_every_isolate_and_uri() {
    let mock = MockVmService::spawn().await.unwrap();
    mock.add_isolate("isolates/1", "main", None, Vec::new());
    mock.add_isolate("isolates/2", "worker", None, Vec::new());
    let fx = start(mock).await;

    let handle = fx.session.set_breakpoint(main_dart(12)).await.unwrap();

    let adds = fx.mock.requests_for("addBreakpointWithScriptUri");
    assert_eq!(adds.len(), 4);
    assert!(adds.iter().all(|req| req.params["line"] == 12));
    let remote = fx.session.breakpoints().remote_ids(handle);
    assert_eq!(remote.len(), 2);
    assert!(remote.values().all(|ids| ids.len() == 2));

    assert!(fx.session.remove_breakpoint(handle).await.unwrap());
    assert_eq!(fx.mock.requests_for("removeBreakpoint").len(), 4);
    assert!(!fx.session.remove_breakpoint(handle).await.unwrap());
}

#[tokio::test]
async fn new_isolates_receive_existing_breakpoints_and_exception_mode() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;

    fx.session.set_breakpoint(main_dart(3)).await.unwrap();
    fx.session
        .set_exception_mode(ExceptionPauseMode::All)
        .await
        .unwrap();
    assert!(fx.mock.requests_for("addBreakpointWithScriptUri").is_empty());

    fx.mock.push_event("Isolate", isolate_event("isolates/3", "IsolateStart"));
    fx.mock.wait_for_requests("setIsolatePauseMode", 1).await;

    let adds = fx.mock.requests_for("addBreakpointWithScriptUri");
    assert_eq!(adds.len(), 2);
    assert!(adds.iter().all(|req| req.params["isolateId"] == "isolates/3"));
    assert_eq!(
        fx.mock.requests_for("setIsolatePauseMode")[0].params["exceptionPauseMode"],
        "All"
    );
}

#[tokio::test]
async fn installation_skips_breakpoints_already_being_added() {
    let mock = MockVmService::spawn().await.unwrap();
    let stream = tokio::net::TcpStream::connect(mock.addr()).await.unwrap();
    let (client, _events) = VmServiceClient::from_stream(stream);
    let coordinator = Arc::new(BreakpointCoordinator::new(
        client,
        StaticMapper::with_uris(&["package:app/main.dart"]),
    ));
    mock.reply_once(
        "addBreakpointWithScriptUri",
        MockReply::delayed(
            Duration::from_millis(100),
            MockReply::result(json!({"type": "Breakpoint", "id": "breakpoints/7", "resolved": false})),
        ),
    );

    let set = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .set_breakpoint(["isolates/1".to_string()], main_dart(9))
                .await
        }
    });
    mock.wait_for_requests("addBreakpointWithScriptUri", 1).await;
    coordinator.install_into("isolates/1").await;
    let handle = set.await.unwrap();

    assert_eq!(mock.requests_for("addBreakpointWithScriptUri").len(), 1);
    assert_eq!(
        coordinator.remote_ids(handle)["isolates/1"],
        vec!["breakpoints/7".to_string()]
    );
}

#[tokio::test]
async fn isolate_paused_at_start_is_resumed_after_installation() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    fx.session.set_breakpoint(main_dart(7)).await.unwrap();

    fx.mock.push_event("Isolate", isolate_event("isolates/4", "IsolateStart"));
    fx.mock.push_event("Debug", isolate_event("isolates/4", "PauseStart"));
    fx.mock.wait_for_requests("resume", 1).await;

    // Installation is shared between the start and pause handlers.
    assert_eq!(fx.mock.requests_for("addBreakpointWithScriptUri").len(), 2);
    let methods: Vec<_> = fx
        .mock
        .requests()
        .into_iter()
        .map(|req| req.method)
        .filter(|method| method != "streamListen" && method != "getVM")
        .collect();
    assert_eq!(methods.last().map(String::as_str), Some("resume"));
}

#[tokio::test]
async fn run_to_position_breakpoint_is_removed_on_next_pause() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    fx.mock.push_event("Debug", isolate_event("isolates/1", "PauseBreakpoint"));
    eventually(|| fx.session.registry().is_suspended("isolates/1")).await;

    assert!(fx.session.run_to_position(&main_dart(40)).await.unwrap());
    assert_eq!(fx.mock.requests_for("addBreakpointWithScriptUri").len(), 2);
    assert_eq!(fx.mock.requests_for("resume").len(), 1);
    assert!(fx.session.breakpoints().has_temporary("isolates/1"));

    fx.mock.push_event("Debug", isolate_event("isolates/1", "Resume"));
    fx.mock.push_event("Debug", isolate_event("isolates/1", "PauseBreakpoint"));
    fx.mock.wait_for_requests("removeBreakpoint", 2).await;
    assert!(!fx.session.breakpoints().has_temporary("isolates/1"));
}

#[tokio::test]
async fn run_to_position_needs_a_suspended_isolate() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    fx.mock.push_event("Isolate", isolate_event("isolates/1", "IsolateStart"));
    eventually(|| fx.session.registry().len() == 1).await;

    assert!(!fx.session.run_to_position(&main_dart(40)).await.unwrap());
    assert!(fx.mock.requests_for("resume").is_empty());
}

#[tokio::test]
async fn resolution_events_verify_breakpoints() {
    let mock = MockVmService::spawn().await.unwrap();
    mock.add_isolate("isolates/1", "main", None, Vec::new());
    let fx = start(mock).await;

    let handle = fx.session.set_breakpoint(main_dart(5)).await.unwrap();
    assert!(!fx.session.breakpoints().is_resolved(handle));

    let id = fx.session.breakpoints().remote_ids(handle)["isolates/1"][0].clone();
    fx.mock.push_event(
        "Debug",
        json!({
            "kind": "BreakpointResolved",
            "isolate": {"id": "isolates/1"},
            "breakpoint": {"type": "Breakpoint", "id": id, "resolved": true},
        }),
    );
    eventually(|| fx.session.breakpoints().is_resolved(handle)).await;
}
