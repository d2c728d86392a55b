use std::{
    path::Path,
    sync::{atomic::Ordering, Arc},
    time::{Duration, SystemTime},
};

use kite_config::ReloadConfig;
use kite_reload::{
    AppState, Capabilities, Channel, Document, NotificationAction, ReloadManager, ReloadOptions,
    ReloadOutcome, RunningApp, Severity, SkipReason, SyncScript, RELOAD_REASON_MANUAL,
};

use crate::harness::{fresh_document, started_app, FakeControl, Fixture};

#[tokio::test(start_paused = true)]
async fn reloading_notification_stays_up_for_the_minimum_window() {
    let fx = Fixture::new();
    let control = FakeControl::ok(Duration::from_millis(50));
    let app = started_app("app", control.clone());

    let outcome = fx
        .manager
        .handle_save(&app, &fresh_document("/work/lib/main.dart"))
        .await;
    assert_eq!(outcome, ReloadOutcome::Reloaded);
    assert_eq!(control.reloads(), 1);
    assert_eq!(app.state(), AppState::Started);

    let shown = fx.sink.shown();
    assert_eq!(shown.len(), 1);
    let (reloading, note) = &shown[0];
    assert_eq!(note.content, "Reloading…");
    assert_eq!(note.severity, Severity::Info);

    tokio::time::sleep(Duration::from_millis(1900)).await;
    assert!(!fx.sink.is_expired(*reloading));
    assert!(fx.sink.cleared.lock().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.sink.is_expired(*reloading));
    assert_eq!(*fx.sink.cleared.lock(), vec!["app".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn run_status_is_left_alone_once_the_app_terminates() {
    let fx = Fixture::new();
    let app = started_app("app", FakeControl::ok(Duration::from_millis(50)));

    let outcome = fx.manager.save_all_and_reload(&app, RELOAD_REASON_MANUAL).await;
    assert_eq!(outcome, ReloadOutcome::Reloaded);
    let (reloading, _) = fx.sink.shown()[0].clone();

    app.set_state(AppState::Terminated);
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(fx.sink.is_expired(reloading));
    assert!(fx.sink.cleared.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_reloads_are_not_held_back_further() {
    let fx = Fixture::new();
    let app = started_app("app", FakeControl::ok(Duration::from_secs(3)));

    let outcome = fx.manager.save_all_and_reload(&app, RELOAD_REASON_MANUAL).await;
    assert_eq!(outcome, ReloadOutcome::Reloaded);

    let (reloading, _) = fx.sink.shown()[0].clone();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(fx.sink.is_expired(reloading));
}

#[tokio::test(start_paused = true)]
async fn second_request_while_in_flight_is_ignored() {
    let fx = Fixture::new();
    let control = FakeControl::ok(Duration::from_secs(1));
    let app = started_app("app", control.clone());

    let first = tokio::spawn({
        let manager = fx.manager.clone();
        let app = app.clone();
        async move { manager.save_all_and_reload(&app, RELOAD_REASON_MANUAL).await }
    });
    while !app.is_reloading() {
        tokio::task::yield_now().await;
    }

    let second = fx
        .manager
        .handle_save(&app, &fresh_document("/work/lib/main.dart"))
        .await;
    assert_eq!(second, ReloadOutcome::Skipped(SkipReason::InFlight));
    let restart = fx.manager.save_all_and_restart(&app, RELOAD_REASON_MANUAL).await;
    assert_eq!(restart, ReloadOutcome::Skipped(SkipReason::InFlight));

    assert_eq!(first.await.unwrap(), ReloadOutcome::Reloaded);
    assert_eq!(control.reloads(), 1);
    assert_eq!(control.restarts(), 0);
}

#[tokio::test(start_paused = true)]
async fn analysis_errors_short_circuit_without_contacting_the_runtime() {
    let fx = Fixture::new();
    fx.analysis.has_errors.store(true, Ordering::SeqCst);
    let control = FakeControl::ok(Duration::from_millis(10));
    let app = started_app("app", control.clone());

    let outcome = fx
        .manager
        .handle_save(&app, &fresh_document("/work/lib/broken.dart"))
        .await;

    assert_eq!(outcome, ReloadOutcome::AnalysisIssues);
    assert_eq!(control.reloads(), 0);
    assert_eq!(app.state(), AppState::Started);
    assert_eq!(
        *fx.analysis.checked.lock(),
        vec![Path::new("/work/lib/broken.dart").to_path_buf()]
    );

    let shown = fx.sink.shown();
    assert_eq!(shown.len(), 1);
    let note = &shown[0].1;
    assert_eq!(note.title.as_deref(), Some("Reload not performed"));
    assert_eq!(note.content, "Analysis issues found");
    assert_eq!(note.channel, Channel::Analysis);
    assert_eq!(note.actions, vec![NotificationAction::ViewIssues]);
    assert_eq!(fx.manager.last_notification().map(|t| t.id), Some(shown[0].0));
}

#[tokio::test(start_paused = true)]
async fn failed_reload_replaces_the_progress_notification() {
    let fx = Fixture::new();
    let app = started_app("app", FakeControl::failing(Duration::from_millis(20), "compile error"));

    let outcome = fx.manager.save_all_and_reload(&app, RELOAD_REASON_MANUAL).await;
    assert_eq!(
        outcome,
        ReloadOutcome::Failed {
            message: "compile error".to_string()
        }
    );
    assert_eq!(app.state(), AppState::Started);

    let shown = fx.sink.shown();
    assert_eq!(shown.len(), 2);
    assert!(fx.sink.is_expired(shown[0].0));
    assert_eq!(shown[1].1.title.as_deref(), Some("Hot Reload Error"));
    assert_eq!(shown[1].1.content, "compile error");
    assert_eq!(shown[1].1.severity, Severity::Error);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!fx.sink.is_expired(shown[1].0));
    assert!(fx.sink.cleared.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn superseded_progress_notification_leaves_run_status_alone() {
    let fx = Fixture::new();
    let quick = started_app("quick", FakeControl::ok(Duration::from_millis(50)));
    let broken = started_app("broken", FakeControl::failing(Duration::from_millis(100), "boom"));

    let outcomes = fx
        .manager
        .save_all_and_reload_all(&[quick.clone(), broken.clone()], RELOAD_REASON_MANUAL)
        .await;
    assert_eq!(
        outcomes,
        vec![
            ReloadOutcome::Reloaded,
            ReloadOutcome::Failed {
                message: "boom".to_string()
            }
        ]
    );
    assert_eq!(fx.saves(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let shown = fx.sink.shown();
    assert_eq!(shown.len(), 3);
    let progress: Vec<_> = shown
        .iter()
        .filter(|(_, note)| note.content == "Reloading…")
        .map(|(id, _)| *id)
        .collect();
    assert_eq!(progress.len(), 2);
    assert!(progress.iter().all(|id| fx.sink.is_expired(*id)));

    // The error notification is the newest, so the quick app's status stays.
    assert!(fx.sink.cleared.lock().is_empty());
    assert_eq!(fx.manager.last_notification().map(|t| t.id), Some(shown[2].0));
}

#[tokio::test(start_paused = true)]
async fn save_filters_skip_irrelevant_saves() {
    let fx = Fixture::with(
        ReloadConfig::default(),
        ReloadOptions {
            sync_script: None,
            ignored_dirs: vec!["/home/me/.config/ide".into()],
        },
    );
    let control = FakeControl::ok(Duration::from_millis(10));
    let app = started_app("app", control.clone());

    let scratch = fresh_document("/home/me/.config/ide/scratches/scratch.dart");
    assert_eq!(
        fx.manager.handle_save(&app, &scratch).await,
        ReloadOutcome::Skipped(SkipReason::IgnoredDocument)
    );

    let old = Document::new(
        "/work/lib/main.dart",
        SystemTime::now() - Duration::from_secs(5),
    );
    assert_eq!(
        fx.manager.handle_save(&app, &old).await,
        ReloadOutcome::Skipped(SkipReason::StaleSave)
    );

    let starting = Arc::new(RunningApp::new("starting", control.clone()));
    assert_eq!(
        fx.manager
            .handle_save(&starting, &fresh_document("/work/lib/main.dart"))
            .await,
        ReloadOutcome::Skipped(SkipReason::NotStarted)
    );

    let profile = RunningApp::new("profile", control.clone()).with_capabilities(Capabilities {
        supports_reload: false,
        supports_restart: true,
    });
    profile.set_state(AppState::Started);
    assert_eq!(
        fx.manager
            .handle_save(&Arc::new(profile), &fresh_document("/work/lib/main.dart"))
            .await,
        ReloadOutcome::Skipped(SkipReason::Unsupported)
    );

    assert_eq!(control.reloads(), 0);
    assert!(fx.sink.shown().is_empty());
    assert!(fx.analysis.checked.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reload_on_save_can_be_disabled() {
    let config = ReloadConfig {
        reload_on_save: false,
        ..ReloadConfig::default()
    };
    let fx = Fixture::with(config, ReloadOptions::default());
    let control = FakeControl::ok(Duration::ZERO);
    let app = started_app("app", control.clone());

    assert_eq!(
        fx.manager
            .handle_save(&app, &fresh_document("/work/lib/main.dart"))
            .await,
        ReloadOutcome::Skipped(SkipReason::ReloadOnSaveDisabled)
    );
    // Explicit requests still go through.
    assert_eq!(
        fx.manager.save_all_and_reload(&app, RELOAD_REASON_MANUAL).await,
        ReloadOutcome::Reloaded
    );
    assert_eq!(control.reloads(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnected_app_is_restored_without_a_request() {
    let fx = Fixture::new();
    let control = FakeControl::ok(Duration::ZERO);
    control.disconnected.store(true, Ordering::SeqCst);
    let app = started_app("app", control.clone());

    let outcome = fx
        .manager
        .handle_save(&app, &fresh_document("/work/lib/main.dart"))
        .await;
    assert_eq!(outcome, ReloadOutcome::Aborted);
    assert_eq!(app.state(), AppState::Started);
    assert_eq!(control.reloads(), 0);
    assert!(fx.sink.shown().is_empty());
}

#[tokio::test(start_paused = true)]
async fn sync_failures_do_not_block_the_reload() {
    let dir = tempfile::tempdir().unwrap();
    let fx = Fixture::with(
        ReloadConfig::default(),
        ReloadOptions {
            sync_script: Some(SyncScript::new(dir.path(), Path::new("missing-sync.sh"))),
            ignored_dirs: Vec::new(),
        },
    );
    let control = FakeControl::ok(Duration::from_millis(10));
    let app = started_app("app", control.clone());

    let outcome = fx
        .manager
        .handle_save(&app, &fresh_document("/work/lib/main.dart"))
        .await;
    assert_eq!(outcome, ReloadOutcome::Reloaded);
    assert_eq!(control.reloads(), 1);
}

#[tokio::test(start_paused = true)]
async fn managers_share_tracking_across_clones() {
    let fx = Fixture::new();
    let other: ReloadManager = fx.manager.clone();
    let app = started_app("app", FakeControl::ok(Duration::ZERO));

    other.save_all_and_reload(&app, RELOAD_REASON_MANUAL).await;
    assert!(fx.manager.last_notification().is_some());

    fx.manager.save_all_and_reload_all(&[], RELOAD_REASON_MANUAL).await;
    assert_eq!(other.last_notification(), None);
}
