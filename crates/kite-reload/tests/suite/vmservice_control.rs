use std::time::Duration;

use kite_reload::{AppControl, ReloadError, VmServiceAppControl};
use kite_vmservice::{
    mock::{MockReply, MockVmService},
    VmServiceClient, VmServiceError,
};
use serde_json::json;

async fn attach(mock: &MockVmService) -> VmServiceAppControl {
    let stream = tokio::net::TcpStream::connect(mock.addr()).await.unwrap();
    let (client, _events) = VmServiceClient::from_stream(stream);
    VmServiceAppControl::new(client)
}

#[tokio::test]
async fn reload_covers_every_isolate() {
    let mock = MockVmService::spawn().await.unwrap();
    mock.add_isolate("isolates/1", "main", None, Vec::new());
    mock.add_isolate("isolates/2", "worker", None, Vec::new());
    let control = attach(&mock).await;

    control.hot_reload("save").await.unwrap();

    let isolates: Vec<_> = mock
        .requests_for("reloadSources")
        .iter()
        .map(|req| req.params["isolateId"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(isolates, vec!["isolates/1", "isolates/2"]);
}

#[tokio::test]
async fn rejected_reload_reports_the_runtime_notices() {
    let mock = MockVmService::spawn().await.unwrap();
    mock.add_isolate("isolates/1", "main", None, Vec::new());
    mock.reply_once(
        "reloadSources",
        MockReply::result(json!({
            "type": "ReloadReport",
            "success": false,
            "notices": [{"type": "ReasonForCancelling", "message": "const class changed"}],
        })),
    );
    let control = attach(&mock).await;

    let err = control.hot_reload("manual").await.unwrap_err();
    match err {
        ReloadError::Rejected { message } => assert_eq!(message, "const class changed"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn reload_without_isolates_fails() {
    let mock = MockVmService::spawn().await.unwrap();
    let control = attach(&mock).await;

    let err = control.hot_reload("manual").await.unwrap_err();
    assert!(matches!(err, ReloadError::NoIsolates), "{err:?}");
    assert!(mock.requests_for("reloadSources").is_empty());
}

#[tokio::test]
async fn restart_is_a_single_request() {
    let mock = MockVmService::spawn().await.unwrap();
    let control = attach(&mock).await;

    control.hot_restart("manual").await.unwrap();
    let calls = mock.requests_for("hotRestart");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params["reason"], "manual");

    mock.reply_once("hotRestart", MockReply::error(-32000, "restart failed"));
    let err = control.hot_restart("manual").await.unwrap_err();
    assert!(
        matches!(err, ReloadError::VmService(VmServiceError::Rpc { code: -32000, .. })),
        "{err:?}"
    );
    assert_eq!(err.to_string(), "runtime service error -32000: restart failed");
}

#[tokio::test]
async fn connection_loss_is_visible() {
    let mock = MockVmService::spawn().await.unwrap();
    let control = attach(&mock).await;
    assert!(control.is_connected());

    mock.wait_for_clients(1).await;
    mock.disconnect_clients();
    tokio::time::timeout(Duration::from_secs(2), control.client().shutdown_token().cancelled())
        .await
        .unwrap();
    assert!(!control.is_connected());
}
