use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::json;
use tau_checkpoint::{CheckpointConfig, CheckpointService, SessionState, SqliteCheckpointStore};
use tau_core::CooperativeCancellationToken;
use tau_permission::{
    CreatePermissionRequest, DecisionReason, PermissionConfig, PermissionService,
};
use tau_pubsub::EventKind;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tool_request(session_id: &str, tool_name: &str, action: &str, command: &str) -> CreatePermissionRequest {
    CreatePermissionRequest {
        session_id: session_id.to_string(),
        tool_call_id: format!("{tool_name}-{command}"),
        tool_name: tool_name.to_string(),
        action: action.to_string(),
        description: format!("run `{command}`"),
        params: json!({ "command": command }),
        path: None,
    }
}

/// A tool loop that asks before each command, simulates usage, and checkpoints when due.
async fn run_tool_loop(
    permissions: PermissionService,
    checkpoints: Arc<CheckpointService>,
    mut session: SessionState,
    commands: Vec<&'static str>,
    token: CooperativeCancellationToken,
) -> Result<(Vec<(String, bool)>, SessionState, usize)> {
    let mut outcomes = Vec::new();
    let mut created = 0;
    for command in commands {
        let allowed = permissions
            .ensure_granted(tool_request(&session.id, "bash", "execute", command), &token)
            .await
            .is_ok();
        outcomes.push((command.to_string(), allowed));
        if allowed {
            session.message_count += 2;
            session.prompt_tokens += 3_000;
            session.completion_tokens += 1_000;
        }
        if checkpoints
            .checkpoint_if_due(&session, Utc::now())
            .await
            .context("checkpoint_if_due failed")?
            .is_some()
        {
            created += 1;
        }
    }
    Ok((outcomes, session, created))
}

#[tokio::test]
async fn integration_ui_decisions_unblock_tool_loop_and_checkpoint_on_threshold() -> Result<()> {
    init_test_tracing();
    let workspace = tempdir()?;
    let store = Arc::new(SqliteCheckpointStore::new(
        workspace.path().join(".tau").join("checkpoints.sqlite"),
    )?);
    let session = SessionState {
        title: "integration".to_string(),
        ..SessionState::new("session-1")
    };
    store.upsert_session(&session)?;

    let checkpoints = Arc::new(CheckpointService::with_config(
        store.clone(),
        CheckpointConfig {
            token_threshold: 7_000,
            max_checkpoints: 2,
            ..CheckpointConfig::default()
        },
    ));
    let permissions = PermissionService::new(PermissionConfig::new(workspace.path()));
    let ui_scope = CooperativeCancellationToken::new();
    let mut pending = permissions.subscribe(&ui_scope);
    let mut history = permissions.subscribe_notifications(&ui_scope);

    let tool = tokio::spawn(run_tool_loop(
        permissions.clone(),
        checkpoints.clone(),
        session,
        vec!["ls", "rm -rf /", "cargo test", "git status"],
        CooperativeCancellationToken::new(),
    ));

    // The UI denies anything destructive and grants the rest.
    for _ in 0..4 {
        let event = tokio::time::timeout(Duration::from_secs(5), pending.recv())
            .await
            .context("tool loop never asked for permission")?
            .context("pending stream closed early")?;
        assert_eq!(event.kind, EventKind::Created);
        let request = &event.payload;
        let command = request.params["command"].as_str().unwrap_or_default();
        let resolved = if command.starts_with("rm") {
            permissions.deny(request)
        } else {
            permissions.grant(request)
        };
        if !resolved {
            bail!("request {} was already resolved", request.id);
        }
    }

    let (outcomes, session, created) = tool.await??;
    assert_eq!(
        outcomes,
        vec![
            ("ls".to_string(), true),
            ("rm -rf /".to_string(), false),
            ("cargo test".to_string(), true),
            ("git status".to_string(), true),
        ]
    );
    assert_eq!(session.total_tokens(), 12_000);
    // Threshold is crossed at 8k after "cargo test" and again at 12k.
    assert_eq!(created, 2);

    let latest = checkpoints.get_latest("session-1").await?;
    assert_eq!(latest.token_count, 12_000);
    let restored = checkpoints.restore(&latest.id).await?;
    assert_eq!(restored, session);

    let mut reasons = Vec::new();
    while let Ok(event) = history.try_recv() {
        reasons.push((event.payload.granted, event.payload.reason));
    }
    assert_eq!(reasons.len(), 4);
    assert!(reasons.iter().all(|(_, reason)| *reason == DecisionReason::User));
    assert_eq!(reasons.iter().filter(|(granted, _)| !granted).count(), 1);

    ui_scope.cancel();
    assert!(pending.recv().await.is_none());
    permissions.shutdown();
    Ok(())
}

#[tokio::test]
async fn integration_cancelled_tool_scope_denies_and_leaves_no_pending_entries() -> Result<()> {
    init_test_tracing();
    let workspace = tempdir()?;
    let permissions = PermissionService::new(PermissionConfig::new(workspace.path()));
    let ui_scope = CooperativeCancellationToken::new();
    let mut pending = permissions.subscribe(&ui_scope);
    let mut history = permissions.subscribe_notifications(&ui_scope);

    let tool_scope = CooperativeCancellationToken::new();
    let tool = {
        let permissions = permissions.clone();
        let token = tool_scope.child_token();
        tokio::spawn(async move {
            permissions
                .request(tool_request("session-2", "bash", "execute", "sleep 1000"), &token)
                .await
        })
    };

    let event = tokio::time::timeout(Duration::from_secs(5), pending.recv())
        .await
        .context("request was never published")?
        .context("pending stream closed early")?;
    assert_eq!(permissions.pending_requests().len(), 1);

    tool_scope.cancel();
    assert!(!tool.await?);
    assert!(permissions.pending_requests().is_empty());
    assert!(!permissions.grant(&event.payload));

    let outcome = tokio::time::timeout(Duration::from_secs(5), history.recv())
        .await
        .context("cancellation was never reported")?
        .context("history stream closed early")?;
    assert_eq!(outcome.payload.reason, DecisionReason::Cancelled);
    assert!(!outcome.payload.granted);
    Ok(())
}
