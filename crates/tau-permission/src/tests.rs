//! Permission service tests covering unit, functional, integration, and regression cases.
use std::{collections::BTreeMap, path::Path, thread, time::Duration};

use serde_json::json;
use tau_core::{CooperativeCancellationToken, EnvConfigError};
use tau_pubsub::{EventKind, Subscription};
use tempfile::tempdir;

use super::{
    CreatePermissionRequest, DecisionReason, PermissionConfig, PermissionDenied,
    PermissionNotification, PermissionRequest, PermissionService, PERMISSION_ALLOWED_TOOLS_ENV,
    PERMISSION_SKIP_REQUESTS_ENV,
};

fn service_in(dir: &Path) -> PermissionService {
    PermissionService::new(PermissionConfig::new(dir))
}

fn create_request(session_id: &str, tool_name: &str, action: &str) -> CreatePermissionRequest {
    CreatePermissionRequest {
        session_id: session_id.to_string(),
        tool_call_id: format!("call-{tool_name}-{action}"),
        tool_name: tool_name.to_string(),
        action: action.to_string(),
        description: format!("{tool_name} wants to {action}"),
        params: json!({ "command": "ls -la" }),
        path: None,
    }
}

async fn next_request(subscription: &mut Subscription<PermissionRequest>) -> PermissionRequest {
    let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("timed out waiting for permission request")
        .expect("request stream closed");
    assert_eq!(event.kind, EventKind::Created);
    (*event.payload).clone()
}

async fn next_notification(
    subscription: &mut Subscription<PermissionNotification>,
) -> PermissionNotification {
    let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("timed out waiting for permission notification")
        .expect("notification stream closed");
    (*event.payload).clone()
}

#[test]
fn unit_config_from_env_map_reads_skip_flag_and_allow_list() {
    let env = BTreeMap::from([
        (PERMISSION_SKIP_REQUESTS_ENV.to_string(), "yes".to_string()),
        (
            PERMISSION_ALLOWED_TOOLS_ENV.to_string(),
            "view, ls ,bash:read,".to_string(),
        ),
    ]);
    let config = PermissionConfig::from_env_map(&env, "/workspace").expect("config");
    assert!(config.skip_requests);
    assert_eq!(config.allowed_tools, vec!["view", "ls", "bash:read"]);
    assert_eq!(config.working_dir, Path::new("/workspace"));

    let defaults = PermissionConfig::from_env_map(&BTreeMap::new(), "/workspace").expect("defaults");
    assert_eq!(defaults, PermissionConfig::new("/workspace"));
}

#[test]
fn regression_config_from_env_map_rejects_unparseable_skip_flag() {
    let env = BTreeMap::from([(PERMISSION_SKIP_REQUESTS_ENV.to_string(), "maybe".to_string())]);
    let error = PermissionConfig::from_env_map(&env, "/workspace").expect_err("invalid bool");
    assert!(matches!(error, EnvConfigError::InvalidBool { .. }));
}

#[test]
fn unit_permission_denied_message_names_tool_and_session() {
    let denied = PermissionDenied {
        session_id: "s1".to_string(),
        tool_name: "bash".to_string(),
        action: "execute".to_string(),
    };
    assert_eq!(
        denied.to_string(),
        "permission denied for bash (execute) in session s1"
    );
}

#[tokio::test]
async fn functional_skip_requests_grants_without_publishing() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);

    service.set_skip_requests(true);
    assert!(service.skip_requests());
    assert!(service.request(create_request("s1", "bash", "execute"), &scope).await);
    assert!(requests.try_recv().is_err());
    assert!(service.pending_requests().is_empty());

    service.set_skip_requests(false);
    assert!(!service.skip_requests());
}

#[tokio::test]
async fn functional_auto_approved_session_skips_prompt_for_that_session_only() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);

    service.auto_approve_session("trusted");
    assert!(service.request(create_request("trusted", "edit", "write"), &scope).await);
    assert!(requests.try_recv().is_err());

    let waiter = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .request(create_request("other", "edit", "write"), &scope)
                .await
        })
    };
    let pending = next_request(&mut requests).await;
    assert_eq!(pending.session_id, "other");
    assert!(service.deny(&pending));
    assert!(!waiter.await.expect("waiter task"));
}

#[tokio::test]
async fn functional_allow_list_matches_tool_or_tool_action_pairs() {
    let dir = tempdir().expect("tempdir");
    let mut config = PermissionConfig::new(dir.path());
    config.allowed_tools = vec!["view".to_string(), "bash:read".to_string()];
    let service = PermissionService::new(config);
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);

    assert!(service.request(create_request("s1", "view", "read"), &scope).await);
    assert!(service.request(create_request("s1", "bash", "read"), &scope).await);
    assert!(requests.try_recv().is_err());

    let waiter = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .request(create_request("s1", "bash", "execute"), &scope)
                .await
        })
    };
    let pending = next_request(&mut requests).await;
    assert_eq!(pending.action, "execute");
    assert!(service.grant(&pending));
    assert!(waiter.await.expect("waiter task"));
}

#[tokio::test]
async fn integration_request_blocks_until_ui_grants() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);
    let mut notifications = service.subscribe_notifications(&scope);

    let waiter = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .request(create_request("s1", "bash", "execute"), &scope)
                .await
        })
    };
    let pending = next_request(&mut requests).await;
    assert_eq!(pending.tool_name, "bash");
    assert_eq!(pending.params["command"], "ls -la");
    assert!(!pending.id.is_empty());
    assert_eq!(service.pending_requests(), vec![pending.clone()]);
    assert!(!waiter.is_finished());

    assert!(service.grant(&pending));
    assert!(waiter.await.expect("waiter task"));
    assert!(service.pending_requests().is_empty());

    let notification = next_notification(&mut notifications).await;
    assert!(notification.granted);
    assert_eq!(notification.reason, DecisionReason::User);
    assert_eq!(notification.request, pending);
}

#[tokio::test]
async fn functional_first_decision_wins_and_later_ones_are_ignored() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);
    let mut notifications = service.subscribe_notifications(&scope);

    let waiter = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .request(create_request("s1", "write", "create"), &scope)
                .await
        })
    };
    let pending = next_request(&mut requests).await;

    assert!(service.deny(&pending));
    assert!(!service.grant(&pending));
    assert!(!service.deny(&pending));
    assert!(!waiter.await.expect("waiter task"));

    let notification = next_notification(&mut notifications).await;
    assert!(!notification.granted);
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn regression_decision_for_unknown_request_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let phantom = PermissionRequest {
        id: "not-pending".to_string(),
        session_id: "s1".to_string(),
        tool_call_id: "call".to_string(),
        tool_name: "bash".to_string(),
        action: "execute".to_string(),
        description: String::new(),
        params: serde_json::Value::Null,
        path: dir.path().to_path_buf(),
    };
    assert!(!service.grant(&phantom));
    assert!(!service.deny(&phantom));
}

#[tokio::test]
async fn functional_persistent_grant_short_circuits_matching_requests() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);
    let mut notifications = service.subscribe_notifications(&scope);

    let waiter = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .request(create_request("s1", "bash", "execute"), &scope)
                .await
        })
    };
    let pending = next_request(&mut requests).await;
    assert!(service.grant_persistent(&pending));
    assert!(waiter.await.expect("waiter task"));
    assert_eq!(
        next_notification(&mut notifications).await.reason,
        DecisionReason::Persistent
    );

    assert!(service.request(create_request("s1", "bash", "execute"), &scope).await);
    assert!(requests.try_recv().is_err());

    let other_session = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .request(create_request("s2", "bash", "execute"), &scope)
                .await
        })
    };
    let pending = next_request(&mut requests).await;
    assert_eq!(pending.session_id, "s2");
    assert!(service.deny(&pending));
    assert!(!other_session.await.expect("other session task"));
}

#[tokio::test]
async fn regression_persistent_grant_is_recorded_even_after_resolution() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);

    let waiter = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .request(create_request("s1", "fetch", "network"), &scope)
                .await
        })
    };
    let pending = next_request(&mut requests).await;
    assert!(service.deny(&pending));
    assert!(!waiter.await.expect("waiter task"));

    assert!(!service.grant_persistent(&pending));
    assert!(service.request(create_request("s1", "fetch", "network"), &scope).await);
}

#[tokio::test]
async fn functional_cancelling_caller_token_denies_and_notifies() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let caller = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);
    let mut notifications = service.subscribe_notifications(&scope);

    let waiter = {
        let service = service.clone();
        let caller = caller.clone();
        tokio::spawn(async move {
            service
                .request(create_request("s1", "bash", "execute"), &caller)
                .await
        })
    };
    let pending = next_request(&mut requests).await;
    caller.cancel();

    assert!(!waiter.await.expect("waiter task"));
    assert!(service.pending_requests().is_empty());
    let notification = next_notification(&mut notifications).await;
    assert!(!notification.granted);
    assert_eq!(notification.reason, DecisionReason::Cancelled);
    assert_eq!(notification.request.id, pending.id);
    assert!(!service.grant(&pending));
}

#[tokio::test]
async fn regression_timed_out_request_leaves_no_pending_entry() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);
    let mut notifications = service.subscribe_notifications(&scope);
    let caller = CooperativeCancellationToken::new();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        service.request(create_request("s1", "bash", "execute"), &caller),
    )
    .await;
    assert!(outcome.is_err());

    let abandoned = next_request(&mut requests).await;
    assert!(service.pending_requests().is_empty());
    let notification = next_notification(&mut notifications).await;
    assert!(!notification.granted);
    assert_eq!(notification.reason, DecisionReason::Cancelled);
    assert_eq!(notification.request.id, abandoned.id);

    assert!(!service.grant(&abandoned));
    assert!(notifications.try_recv().is_err());
}

#[tokio::test]
async fn regression_aborted_request_task_leaves_no_pending_entry() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);
    let mut notifications = service.subscribe_notifications(&scope);

    let waiter = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .request(
                    create_request("s1", "edit", "write"),
                    &CooperativeCancellationToken::new(),
                )
                .await
        })
    };
    let pending = next_request(&mut requests).await;
    waiter.abort();
    assert!(waiter.await.expect_err("aborted").is_cancelled());

    assert!(service.pending_requests().is_empty());
    let notification = next_notification(&mut notifications).await;
    assert_eq!(notification.reason, DecisionReason::Cancelled);
    assert_eq!(notification.request.id, pending.id);
    assert!(!service.deny(&pending));
}

#[tokio::test]
async fn regression_already_cancelled_token_denies_without_publishing() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);
    let cancelled = CooperativeCancellationToken::new();
    cancelled.cancel();

    assert!(!service.request(create_request("s1", "bash", "execute"), &cancelled).await);
    assert!(requests.try_recv().is_err());
    assert!(service.pending_requests().is_empty());
}

#[tokio::test]
async fn functional_pending_requests_are_listed_oldest_first() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);

    let mut waiters = Vec::new();
    let mut published = Vec::new();
    for tool in ["bash", "edit", "fetch"] {
        let service_handle = service.clone();
        let scope_handle = scope.clone();
        waiters.push(tokio::spawn(async move {
            service_handle
                .request(create_request("s1", tool, "run"), &scope_handle)
                .await
        }));
        published.push(next_request(&mut requests).await);
    }

    let listed = service
        .pending_requests()
        .into_iter()
        .map(|request| request.tool_name)
        .collect::<Vec<_>>();
    assert_eq!(listed, vec!["bash", "edit", "fetch"]);

    for request in &published {
        assert!(service.grant(request));
    }
    for waiter in waiters {
        assert!(waiter.await.expect("waiter task"));
    }
}

#[tokio::test]
async fn functional_ensure_granted_maps_denial_to_typed_error() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);

    let waiter = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .ensure_granted(create_request("s1", "bash", "execute"), &scope)
                .await
        })
    };
    let pending = next_request(&mut requests).await;
    assert!(service.deny(&pending));
    let error = waiter
        .await
        .expect("waiter task")
        .expect_err("denied request");
    assert_eq!(error.tool_name, "bash");
    assert_eq!(error.session_id, "s1");

    service.set_skip_requests(true);
    service
        .ensure_granted(create_request("s1", "bash", "execute"), &scope)
        .await
        .expect("granted by skip flag");
}

#[tokio::test]
async fn functional_request_paths_resolve_to_grant_directories() {
    let dir = tempdir().expect("tempdir");
    let src = dir.path().join("src");
    std::fs::create_dir_all(&src).expect("create src");
    std::fs::write(src.join("main.rs"), "fn main() {}\n").expect("write file");

    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);

    let cases = [
        (None, dir.path().to_path_buf()),
        (Some(""), dir.path().to_path_buf()),
        (Some("."), dir.path().to_path_buf()),
        (Some("src"), src.clone()),
        (Some("src/main.rs"), src.clone()),
        (Some("missing/notes.txt"), dir.path().join("missing")),
    ];
    for (path, expected) in cases {
        let mut create = create_request("s1", "edit", "write");
        create.path = path.map(Into::into);
        let waiter = {
            let service = service.clone();
            let scope = scope.clone();
            tokio::spawn(async move { service.request(create, &scope).await })
        };
        let pending = next_request(&mut requests).await;
        assert_eq!(pending.path, expected, "path input {path:?}");
        assert!(service.deny(&pending));
        assert!(!waiter.await.expect("waiter task"));
    }

    let absolute_file = src.join("main.rs");
    let mut create = create_request("s1", "edit", "write");
    create.path = Some(absolute_file);
    let waiter = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move { service.request(create, &scope).await })
    };
    let pending = next_request(&mut requests).await;
    assert_eq!(pending.path, src);
    assert!(service.grant_persistent(&pending));
    assert!(waiter.await.expect("waiter task"));

    let mut sibling = create_request("s1", "edit", "write");
    sibling.path = Some("src/lib.rs".into());
    assert!(service.request(sibling, &scope).await);
}

#[tokio::test]
async fn integration_shutdown_denies_in_flight_requests_and_closes_streams() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);
    let mut notifications = service.subscribe_notifications(&scope);

    let waiter = {
        let service = service.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            service
                .request(create_request("s1", "bash", "execute"), &scope)
                .await
        })
    };
    next_request(&mut requests).await;

    service.shutdown();
    service.shutdown();

    assert!(!waiter.await.expect("waiter task"));
    let notification = next_notification(&mut notifications).await;
    assert_eq!(notification.reason, DecisionReason::Shutdown);
    assert!(requests.recv().await.is_none());
    assert!(notifications.recv().await.is_none());
    assert!(!service.request(create_request("s1", "bash", "execute"), &scope).await);
}

#[test]
fn unit_notification_serializes_request_fields_flat() {
    let notification = PermissionNotification {
        request: PermissionRequest {
            id: "req-1".to_string(),
            session_id: "s1".to_string(),
            tool_call_id: "call-1".to_string(),
            tool_name: "bash".to_string(),
            action: "execute".to_string(),
            description: "run ls".to_string(),
            params: json!({ "command": "ls" }),
            path: "/workspace".into(),
        },
        granted: true,
        reason: DecisionReason::Persistent,
    };
    let value = serde_json::to_value(&notification).expect("serialize");
    assert_eq!(value["id"], "req-1");
    assert_eq!(value["tool_name"], "bash");
    assert_eq!(value["granted"], true);
    assert_eq!(value["reason"], "persistent");
}

#[test]
fn functional_request_blocking_waits_on_plain_thread() {
    let dir = tempdir().expect("tempdir");
    let service = service_in(dir.path());
    let scope = CooperativeCancellationToken::new();
    let mut requests = service.subscribe(&scope);

    let tool_thread = {
        let service = service.clone();
        let scope = scope.clone();
        thread::spawn(move || service.request_blocking(create_request("s1", "bash", "execute"), &scope))
    };
    let event = requests.blocking_recv().expect("published request");
    assert!(service.grant(&event.payload));
    assert!(tool_thread.join().expect("tool thread"));
}
