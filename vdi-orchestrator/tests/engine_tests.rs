mod common;

use std::sync::atomic::Ordering;

use common::{harness, insert_workspace};
use vdi_provider::stub::StubAdapter;
use vdi_provider::{ConnectionDetails, CreatedDesktop, DesktopState, ErrorCategory, ProviderError};
use vdi_orchestrator::operation::OperationKind;
use vdi_orchestrator::workspace::WorkspaceState;

fn throttled() -> ProviderError {
    ProviderError::new(ErrorCategory::Throttled, "Rate exceeded")
}

#[tokio::test]
async fn provision_succeeds_after_transient_failures() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, None).await;

    for _ in 0..3 {
        h.adapter.push_create(Err(throttled()));
    }
    // Fourth attempt uses the default success; describe defaults to Available.

    let result = h.engine.provision(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Available);
    assert!(result.provider_handle.is_some());
    assert!(result.diagnostic.is_none());
    assert_eq!(h.adapter.create_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn provision_persists_the_connection_string_on_availability() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, None).await;

    h.adapter.push_create(Ok(CreatedDesktop {
        handle: "ws-abc".to_string(),
    }));
    h.adapter.set_connection(ConnectionDetails {
        connection_string: "workspaces://ws-abc".to_string(),
        registration_code: None,
        ip_address: Some("10.0.0.9".to_string()),
        computer_name: Some("STUB-HOST".to_string()),
    });

    let result = h.engine.provision(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Available);
    assert_eq!(result.provider_handle.as_deref(), Some("ws-abc"));
    assert_eq!(
        result.connection_string.as_deref(),
        Some("workspaces://ws-abc")
    );
}

#[tokio::test]
async fn provision_gives_up_after_retry_budget() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, None).await;

    for _ in 0..4 {
        h.adapter.push_create(Err(throttled()));
    }

    let result = h.engine.provision(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Error);
    assert!(result.provider_handle.is_none());
    let diagnostic = result.diagnostic.unwrap();
    assert!(diagnostic.contains("4 attempt"), "got: {}", diagnostic);
    // Exactly the budget: no fifth attempt.
    assert_eq!(h.adapter.create_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, None).await;

    h.adapter.push_create(Err(ProviderError::bad_parameter(
        "InvalidParameterValue: bad bundle",
    )));

    let result = h.engine.provision(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Error);
    assert_eq!(h.adapter.create_calls.load(Ordering::SeqCst), 1);
    assert!(result.diagnostic.unwrap().contains("1 attempt"));
}

#[tokio::test]
async fn monitor_stops_at_poll_budget_and_leaves_workspace_pending() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, None).await;

    h.adapter
        .push_describe_n(Ok(StubAdapter::snapshot(DesktopState::Pending)), 60);
    // A 61st poll would hit the Available default and flip the state.

    let result = h.engine.provision(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Pending);
    assert!(result.provider_handle.is_some());
    assert!(result.diagnostic.unwrap().contains("did not settle"));
    assert_eq!(h.adapter.describe_calls.load(Ordering::SeqCst), 60);
}

#[tokio::test]
async fn monitor_respects_an_external_terminate() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, Some("ws-race1")).await;

    // Keep the desktop pending long enough for the terminate to land; the
    // queue then drains to the Available default, which must NOT win.
    h.adapter
        .push_describe_n(Ok(StubAdapter::snapshot(DesktopState::Pending)), 55);

    let engine = h.engine.clone();
    let id = ws.id.clone();
    let monitor = tokio::spawn(async move { engine.monitor_provisioning(&id).await });

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    h.store
        .set_state(&ws.id, WorkspaceState::Terminated)
        .await
        .unwrap();
    h.store
        .attach_diagnostic(&ws.id, "Forcibly terminated; provider cleanup failed")
        .await
        .unwrap();

    let result = monitor.await.unwrap().unwrap();
    assert_eq!(result.state, WorkspaceState::Terminated);

    let stored = h.store.get(&ws.id).await.unwrap();
    assert_eq!(stored.state, WorkspaceState::Terminated);
    assert!(stored.diagnostic.unwrap().contains("Forcibly terminated"));
}

#[tokio::test]
async fn monitor_surfaces_desktop_error_state() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, None).await;

    let mut snapshot = StubAdapter::snapshot(DesktopState::Error);
    snapshot.error_message = Some("Directory association failed".to_string());
    h.adapter.push_describe(Ok(snapshot));

    let result = h.engine.provision(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Error);
    assert_eq!(
        result.diagnostic.as_deref(),
        Some("Directory association failed")
    );
}

#[tokio::test]
async fn monitor_tolerates_transient_describe_failures() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, None).await;

    h.adapter.push_describe(Err(throttled()));
    h.adapter
        .push_describe(Ok(StubAdapter::snapshot(DesktopState::Pending)));
    // Then the Available default.

    let result = h.engine.provision(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Available);
    assert_eq!(h.adapter.describe_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn start_transition_runs_to_available() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Stopped, Some("ws-stopped1")).await;

    h.adapter
        .push_describe(Ok(StubAdapter::snapshot(DesktopState::Starting)));

    let result = h
        .engine
        .run_transition(&ws.id, OperationKind::Start)
        .await
        .unwrap();

    assert_eq!(result.state, WorkspaceState::Available);
    assert_eq!(h.adapter.start_calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.ip_address.as_deref(), Some("10.0.0.9"));
}

#[tokio::test]
async fn stop_transition_runs_to_stopped() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Available, Some("ws-run1")).await;

    h.adapter
        .push_describe(Ok(StubAdapter::snapshot(DesktopState::Stopping)));
    h.adapter
        .push_describe(Ok(StubAdapter::snapshot(DesktopState::Stopped)));

    let result = h
        .engine
        .run_transition(&ws.id, OperationKind::Stop)
        .await
        .unwrap();

    assert_eq!(result.state, WorkspaceState::Stopped);
    assert_eq!(h.adapter.stop_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn terminate_without_handle_skips_the_provider() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, None).await;

    let result = h.engine.terminate(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Terminated);
    assert_eq!(h.adapter.terminate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refresh_maps_observed_state_onto_the_record() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Available, Some("ws-refresh1")).await;

    h.adapter
        .push_describe(Ok(StubAdapter::snapshot(DesktopState::Stopped)));

    let result = h.engine.refresh(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Stopped);
}

#[tokio::test]
async fn refresh_leaves_state_alone_on_unknown_vendor_state() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Available, Some("ws-refresh2")).await;

    h.adapter
        .push_describe(Ok(StubAdapter::snapshot(DesktopState::Unknown)));

    let result = h.engine.refresh(&ws.id).await.unwrap();

    assert_eq!(result.state, WorkspaceState::Available);
}

#[tokio::test]
async fn resume_incomplete_picks_up_in_flight_workspaces() {
    let h = harness().await;
    let ws = insert_workspace(&h, WorkspaceState::Pending, Some("ws-resume1")).await;
    insert_workspace(&h, WorkspaceState::Available, Some("ws-settled1")).await;

    let resumed = h.engine.resume_incomplete().await.unwrap();
    assert_eq!(resumed, 1);

    // The spawned monitor hits the Available default almost immediately.
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        if h.store.get(&ws.id).await.unwrap().state == WorkspaceState::Available {
            return;
        }
    }
    panic!("resumed workspace never settled");
}

#[tokio::test]
async fn stale_pending_reports_old_handleless_rows_only() {
    let h = harness().await;
    let stale = insert_workspace(&h, WorkspaceState::Pending, None).await;
    insert_workspace(&h, WorkspaceState::Pending, Some("ws-hashandle")).await;

    // Grace of -1s makes "now" already past the cutoff.
    let report = h.store.stale_pending(-1).await.unwrap();

    assert_eq!(report.len(), 1);
    assert_eq!(report[0].id, stale.id);

    let report = h.store.stale_pending(3600).await.unwrap();
    assert!(report.is_empty());
}
