use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use kite_config::ConnectConfig;
use kite_debug::{
    DebugError, DebugSession, ResumeOutcome, SessionAction, SessionCollaborators,
};
use kite_vmservice::{
    mock::{MockReply, MockVmService},
    OutputStream, ScriptRef,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::harness::{eventually, isolate_event, start, RecordingOutput, StaticMapper};

#[tokio::test]
async fn discovery_attaches_and_resumes_isolates_paused_at_start() {
    let mock = MockVmService::spawn().await.unwrap();
    mock.add_isolate(
        "isolates/1",
        "main",
        Some("PauseStart"),
        vec![json!({"type": "@Library", "id": "libraries/1", "uri": "package:app/main.dart"})],
    );
    mock.add_isolate("isolates/2", "worker", None, Vec::new());

    let fx = start(mock).await;

    assert_eq!(fx.mock.requests_for("streamListen").len(), 5);
    let resumes = fx.mock.requests_for("resume");
    assert_eq!(resumes.len(), 1);
    assert_eq!(resumes[0].params["isolateId"], "isolates/1");
    assert_eq!(fx.mock.requests_for("setIsolatePauseMode").len(), 2);
    assert_eq!(fx.mapper.libraries.lock().len(), 1);

    // Status only changes when the runtime reports the resume.
    assert!(fx.session.registry().is_suspended("isolates/1"));
    assert!(!fx.session.registry().is_suspended("isolates/2"));

    fx.mock.push_event("Debug", isolate_event("isolates/1", "Resume"));
    eventually(|| !fx.session.registry().is_suspended("isolates/1")).await;
}

#[tokio::test]
async fn pause_events_select_the_current_isolate() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    assert_eq!(fx.session.current_isolate(), None);

    fx.mock.push_event("Isolate", isolate_event("isolates/1", "IsolateStart"));
    fx.mock.push_event("Debug", isolate_event("isolates/2", "PauseBreakpoint"));
    eventually(|| fx.session.registry().is_suspended("isolates/2")).await;

    assert_eq!(fx.session.current_isolate().as_deref(), Some("isolates/2"));
    fx.session.set_current_isolate(Some("isolates/1".to_string()));
    assert_eq!(fx.session.current_isolate().as_deref(), Some("isolates/1"));
}

#[tokio::test]
async fn exit_of_current_isolate_resumes_the_others() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;

    fx.mock.push_event("Debug", isolate_event("isolates/2", "PauseBreakpoint"));
    fx.mock.push_event("Debug", isolate_event("isolates/1", "PauseException"));
    eventually(|| fx.session.registry().suspended_ids().len() == 2).await;
    assert_eq!(fx.session.current_isolate().as_deref(), Some("isolates/1"));

    fx.mock.push_event("Isolate", isolate_event("isolates/1", "IsolateExit"));
    fx.mock.wait_for_requests("resume", 1).await;

    let resumes = fx.mock.requests_for("resume");
    assert_eq!(resumes.len(), 1);
    assert_eq!(resumes[0].params["isolateId"], "isolates/2");
    assert!(fx.session.registry().get("isolates/1").is_none());
}

#[tokio::test]
async fn isolate_found_paused_at_attach_becomes_current() {
    let mock = MockVmService::spawn().await.unwrap();
    mock.add_isolate("isolates/1", "main", Some("PauseBreakpoint"), Vec::new());
    mock.add_isolate("isolates/2", "worker", Some("PauseBreakpoint"), Vec::new());
    let fx = start(mock).await;

    assert_eq!(fx.session.current_isolate().as_deref(), Some("isolates/1"));
    assert!(fx.mock.requests_for("resume").is_empty());

    fx.mock.push_event("Isolate", isolate_event("isolates/1", "IsolateExit"));
    fx.mock.wait_for_requests("resume", 1).await;

    let resumes = fx.mock.requests_for("resume");
    assert_eq!(resumes.len(), 1);
    assert_eq!(resumes[0].params["isolateId"], "isolates/2");
}

#[tokio::test]
async fn exit_of_another_isolate_resumes_nothing() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;

    fx.mock.push_event("Debug", isolate_event("isolates/1", "PauseBreakpoint"));
    fx.mock.push_event("Isolate", isolate_event("isolates/2", "IsolateStart"));
    fx.mock.push_event("Isolate", isolate_event("isolates/2", "IsolateExit"));
    eventually(|| {
        fx.session.registry().get("isolates/1").is_some()
            && fx.session.registry().get("isolates/2").is_none()
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fx.mock.requests_for("resume").is_empty());
}

#[tokio::test]
async fn waiters_observe_exit_separately_from_resume() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    fx.mock.push_event("Debug", isolate_event("isolates/1", "PauseBreakpoint"));
    eventually(|| fx.session.registry().is_suspended("isolates/1")).await;

    let waiter = tokio::spawn({
        let session = fx.session.clone();
        async move { session.await_resumed("isolates/1").await }
    });
    fx.mock.push_event("Isolate", isolate_event("isolates/1", "IsolateExit"));

    assert_eq!(waiter.await.unwrap(), ResumeOutcome::Exited);
}

#[tokio::test]
async fn teardown_disposes_waiters_and_rejects_requests() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    fx.mock.push_event("Debug", isolate_event("isolates/1", "PauseBreakpoint"));
    eventually(|| fx.session.registry().is_suspended("isolates/1")).await;

    fx.mock.reply_once("getObject", MockReply::NoReply);
    let waiter = tokio::spawn({
        let session = fx.session.clone();
        async move { session.await_resumed("isolates/1").await }
    });
    let request = tokio::spawn({
        let client = fx.session.client().clone();
        async move { client.get_object("isolates/1", "objects/1").await }
    });
    fx.mock.wait_for_requests("getObject", 1).await;

    fx.session.teardown("user stopped debugging");
    fx.session.teardown("second call is ignored");

    assert_eq!(waiter.await.unwrap(), ResumeOutcome::Disposed);
    let err = request.await.unwrap().unwrap_err();
    assert!(err.is_disconnect(), "{err:?}");
    assert!(fx.mapper.shut_down.load(Ordering::SeqCst));

    let err = fx.session.resume("isolates/1").await.unwrap_err();
    assert!(matches!(err, DebugError::SessionClosed), "{err:?}");
    assert!(fx.session.registry().is_empty());
    assert_eq!(
        fx.session.await_resumed("isolates/1").await,
        ResumeOutcome::Disposed
    );
}

#[tokio::test]
async fn runtime_disconnect_ends_the_session() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    fx.mock.push_event("Debug", isolate_event("isolates/1", "PauseInterrupted"));
    eventually(|| fx.session.registry().is_suspended("isolates/1")).await;

    let waiter = tokio::spawn({
        let session = fx.session.clone();
        async move { session.await_resumed("isolates/1").await }
    });
    fx.mock.disconnect_clients();

    tokio::time::timeout(Duration::from_secs(2), fx.session.closed_token().cancelled())
        .await
        .unwrap();
    assert_eq!(waiter.await.unwrap(), ResumeOutcome::Disposed);
}

#[tokio::test]
async fn application_output_is_forwarded() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;

    fx.mock.push_event("Stdout", json!({"kind": "WriteEvent", "bytes": "aGVsbG8K"}));
    fx.mock.push_event("Stderr", json!({"kind": "WriteEvent", "bytes": "b29wcwo="}));
    eventually(|| fx.output.lines.lock().len() == 2).await;

    let lines = fx.output.lines.lock().clone();
    assert_eq!(lines[0], (OutputStream::Stdout, "hello\n".to_string()));
    assert_eq!(lines[1], (OutputStream::Stderr, "oops\n".to_string()));
}

#[tokio::test]
async fn source_positions_come_from_the_mapper() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    let script = ScriptRef {
        id: "scripts/1".to_string(),
        uri: "package:app/main.dart".to_string(),
    };

    let position = fx
        .session
        .source_position("isolates/1", &script, 42)
        .await
        .unwrap();
    assert_eq!(position.line, 42);
}

#[tokio::test]
async fn extension_toggles_follow_announcements() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    let toggle = SessionAction::toggle("ext.app.debugPaint");
    assert!(!toggle.is_enabled(&fx.session));

    fx.mock.push_event(
        "Extension",
        json!({
            "kind": "ServiceExtensionAdded",
            "isolate": {"id": "isolates/1"},
            "extensionRPC": "ext.app.debugPaint",
        }),
    );
    eventually(|| toggle.is_enabled(&fx.session)).await;
    assert_eq!(toggle.current_value(&fx.session), Some(false));

    assert!(toggle.perform(&fx.session).await.unwrap());
    assert_eq!(toggle.current_value(&fx.session), Some(true));

    let calls = fx.mock.requests_for("ext.app.debugPaint");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params["isolateId"], "isolates/1");
    assert_eq!(calls[0].params["enabled"], "true");

    // A restarted isolate gets the remembered value re-applied.
    fx.mock.push_event(
        "Extension",
        json!({
            "kind": "ServiceExtensionAdded",
            "isolate": {"id": "isolates/9"},
            "extensionRPC": "ext.app.debugPaint",
        }),
    );
    fx.mock.wait_for_requests("ext.app.debugPaint", 2).await;
    assert_eq!(
        fx.mock.requests_for("ext.app.debugPaint")[1].params["isolateId"],
        "isolates/9"
    );
}

#[tokio::test]
async fn resume_all_and_pause_all_split_by_status() {
    let fx = start(MockVmService::spawn().await.unwrap()).await;
    fx.mock.push_event("Isolate", isolate_event("isolates/1", "IsolateStart"));
    fx.mock.push_event("Debug", isolate_event("isolates/2", "PauseBreakpoint"));
    eventually(|| fx.session.registry().len() == 2).await;

    assert!(SessionAction::ResumeAll.is_enabled(&fx.session));
    assert_eq!(fx.session.resume_all().await.unwrap(), 1);
    assert_eq!(fx.session.pause_all().await.unwrap(), 1);

    assert_eq!(fx.mock.requests_for("resume")[0].params["isolateId"], "isolates/2");
    assert_eq!(fx.mock.requests_for("pause")[0].params["isolateId"], "isolates/1");
}

#[tokio::test]
async fn connect_waits_for_the_endpoint() {
    let mock = MockVmService::spawn().await.unwrap();
    let addr = mock.addr().to_string();
    let polls = Arc::new(AtomicUsize::new(0));
    let provider = {
        let polls = polls.clone();
        move || (polls.fetch_add(1, Ordering::SeqCst) >= 2).then(|| addr.clone())
    };
    let config = ConnectConfig { poll_interval_ms: 5 };

    let session = DebugSession::connect(
        &provider,
        &config,
        &CancellationToken::new(),
        SessionCollaborators {
            mapper: StaticMapper::with_uris(&[]),
            output: Some(Arc::new(RecordingOutput::default())),
        },
    )
    .await
    .unwrap();

    assert_eq!(polls.load(Ordering::SeqCst), 3);
    assert_eq!(session.endpoint(), Some(mock.addr().to_string().as_str()));
    assert_eq!(mock.requests_for("getVM").len(), 1);
}

#[tokio::test]
async fn cancelled_connect_is_reported() {
    let provider = || None::<String>;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = DebugSession::connect(
        &provider,
        &ConnectConfig::default(),
        &cancel,
        SessionCollaborators {
            mapper: StaticMapper::with_uris(&[]),
            output: None,
        },
    )
    .await
    .err()
    .unwrap();
    assert!(err.is_fatal());
    assert!(matches!(err, DebugError::Connect(_)), "{err:?}");
}
