//! Permission service state, policy short-circuits, and decision resolution.
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use tau_core::CooperativeCancellationToken;
use tau_pubsub::{Broker, EventKind, Subscription};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    CreatePermissionRequest, DecisionReason, PermissionConfig, PermissionDenied,
    PermissionNotification, PermissionRequest,
};

/// Arbitrates tool permission requests between tool tasks and the UI.
///
/// Cloning yields another handle to the same service. Separate
/// [`PermissionService::new`] calls never share policy or pending state.
#[derive(Clone)]
pub struct PermissionService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    working_dir: PathBuf,
    allowed_tools: HashSet<String>,
    skip_requests: AtomicBool,
    policy: Mutex<PolicyState>,
    pending: Mutex<PendingRequests>,
    requests: Broker<PermissionRequest>,
    notifications: Broker<PermissionNotification>,
}

#[derive(Default)]
struct PolicyState {
    auto_approved_sessions: HashSet<String>,
    persistent_grants: HashSet<PersistentGrant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PersistentGrant {
    session_id: String,
    tool_name: String,
    action: String,
    path: PathBuf,
}

impl PersistentGrant {
    fn for_request(request: &PermissionRequest) -> Self {
        Self {
            session_id: request.session_id.clone(),
            tool_name: request.tool_name.clone(),
            action: request.action.clone(),
            path: request.path.clone(),
        }
    }
}

#[derive(Default)]
struct PendingRequests {
    entries: HashMap<String, PendingRequest>,
    next_sequence: u64,
    closed: bool,
}

struct PendingRequest {
    sequence: u64,
    request: PermissionRequest,
    resolver: oneshot::Sender<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShortCircuit {
    SkipRequests,
    AutoApprovedSession,
    AllowedTool,
    PersistentGrant,
}

impl ShortCircuit {
    fn as_str(self) -> &'static str {
        match self {
            Self::SkipRequests => "skip_requests",
            Self::AutoApprovedSession => "auto_approved_session",
            Self::AllowedTool => "allowed_tool",
            Self::PersistentGrant => "persistent_grant",
        }
    }
}

/// Denies the in-flight entry when a `request` future is dropped before it resolves.
struct PendingGuard<'a> {
    service: &'a PermissionService,
    request_id: &'a str,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(service: &'a PermissionService, request_id: &'a str) -> Self {
        Self {
            service,
            request_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(pending) = self.service.take_pending(self.request_id) else {
            return;
        };
        let _ = pending.resolver.send(false);
        tracing::info!(
            request_id = self.request_id,
            tool_name = %pending.request.tool_name,
            "permission request abandoned by caller"
        );
        self.service
            .publish_outcome(pending.request, false, DecisionReason::Cancelled);
    }
}

impl PermissionService {
    pub fn new(config: PermissionConfig) -> Self {
        let allowed_tools = config.allowed_tool_set();
        Self {
            inner: Arc::new(ServiceInner {
                working_dir: config.working_dir,
                allowed_tools,
                skip_requests: AtomicBool::new(config.skip_requests),
                policy: Mutex::new(PolicyState::default()),
                pending: Mutex::new(PendingRequests::default()),
                requests: Broker::with_config(config.broker),
                notifications: Broker::with_config(config.broker),
            }),
        }
    }

    /// Waits for a decision on `create` and returns whether the action may proceed.
    ///
    /// Cancelling `token` while the request is pending resolves it as denied, as
    /// does dropping the returned future before a decision arrives.
    pub async fn request(
        &self,
        create: CreatePermissionRequest,
        token: &CooperativeCancellationToken,
    ) -> bool {
        if self.skip_requests() {
            tracing::debug!(
                tool_name = %create.tool_name,
                session_id = %create.session_id,
                short_circuit = ShortCircuit::SkipRequests.as_str(),
                "permission granted by policy"
            );
            return true;
        }

        let request = self.build_request(create);
        if let Some(short_circuit) = self.policy_short_circuit(&request) {
            tracing::debug!(
                request_id = %request.id,
                tool_name = %request.tool_name,
                session_id = %request.session_id,
                short_circuit = short_circuit.as_str(),
                "permission granted by policy"
            );
            return true;
        }
        if token.is_cancelled() {
            return false;
        }

        let Some(mut decision) = self.register_pending(&request) else {
            tracing::debug!(
                request_id = %request.id,
                "permission service is shut down; denying request"
            );
            return false;
        };
        let guard = PendingGuard::new(self, &request.id);
        self.inner
            .requests
            .publish(EventKind::Created, request.clone());

        let granted = tokio::select! {
            outcome = &mut decision => outcome.unwrap_or(false),
            _ = token.cancelled() => {
                match self.take_pending(&request.id) {
                    Some(pending) => {
                        tracing::info!(
                            request_id = %request.id,
                            tool_name = %request.tool_name,
                            "permission request cancelled by caller"
                        );
                        self.publish_outcome(pending.request, false, DecisionReason::Cancelled);
                        false
                    }
                    // A decision won the race; its value is already queued.
                    None => decision.await.unwrap_or(false),
                }
            }
        };
        guard.disarm();
        granted
    }

    /// Runs [`PermissionService::request`] to completion on the calling thread.
    ///
    /// For tool code on plain OS threads. Must not be called from inside a
    /// Tokio runtime.
    pub fn request_blocking(
        &self,
        create: CreatePermissionRequest,
        token: &CooperativeCancellationToken,
    ) -> bool {
        let runtime = match tokio::runtime::Builder::new_current_thread().build() {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::warn!(%error, "failed to build permission wait runtime; denying request");
                return false;
            }
        };
        runtime.block_on(self.request(create, token))
    }

    /// Like [`PermissionService::request`], but maps a denial to [`PermissionDenied`].
    pub async fn ensure_granted(
        &self,
        create: CreatePermissionRequest,
        token: &CooperativeCancellationToken,
    ) -> Result<(), PermissionDenied> {
        let denied = PermissionDenied {
            session_id: create.session_id.clone(),
            tool_name: create.tool_name.clone(),
            action: create.action.clone(),
        };
        if self.request(create, token).await {
            Ok(())
        } else {
            Err(denied)
        }
    }

    /// Grants a pending request. Returns false when it was unknown or already decided.
    pub fn grant(&self, request: &PermissionRequest) -> bool {
        self.resolve(&request.id, true, DecisionReason::User)
    }

    /// Denies a pending request. Returns false when it was unknown or already decided.
    pub fn deny(&self, request: &PermissionRequest) -> bool {
        self.resolve(&request.id, false, DecisionReason::User)
    }

    /// Grants the request and remembers the session/tool/action/path combination.
    ///
    /// The standing grant is recorded even when the request itself was already
    /// decided; the return value reports whether this call resolved it.
    pub fn grant_persistent(&self, request: &PermissionRequest) -> bool {
        lock_or_recover(&self.inner.policy)
            .persistent_grants
            .insert(PersistentGrant::for_request(request));
        self.resolve(&request.id, true, DecisionReason::Persistent)
    }

    /// Grants every later request from `session_id` without prompting.
    pub fn auto_approve_session(&self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        tracing::debug!(session_id = %session_id, "auto-approving session");
        lock_or_recover(&self.inner.policy)
            .auto_approved_sessions
            .insert(session_id);
    }

    pub fn set_skip_requests(&self, skip: bool) {
        self.inner.skip_requests.store(skip, Ordering::SeqCst);
    }

    pub fn skip_requests(&self) -> bool {
        self.inner.skip_requests.load(Ordering::SeqCst)
    }

    /// Subscribes to newly pending requests.
    pub fn subscribe(&self, token: &CooperativeCancellationToken) -> Subscription<PermissionRequest> {
        self.inner.requests.subscribe(token)
    }

    /// Subscribes to resolved outcomes.
    pub fn subscribe_notifications(
        &self,
        token: &CooperativeCancellationToken,
    ) -> Subscription<PermissionNotification> {
        self.inner.notifications.subscribe(token)
    }

    /// Requests still awaiting a decision, oldest first.
    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        let pending = lock_or_recover(&self.inner.pending);
        let mut entries = pending
            .entries
            .values()
            .map(|entry| (entry.sequence, entry.request.clone()))
            .collect::<Vec<_>>();
        entries.sort_by_key(|(sequence, _)| *sequence);
        entries.into_iter().map(|(_, request)| request).collect()
    }

    /// Denies everything in flight and closes both subscriber streams. Idempotent.
    pub fn shutdown(&self) {
        let drained = {
            let mut pending = lock_or_recover(&self.inner.pending);
            if pending.closed {
                return;
            }
            pending.closed = true;
            pending
                .entries
                .drain()
                .map(|(_, entry)| entry)
                .collect::<Vec<_>>()
        };
        for entry in drained {
            let _ = entry.resolver.send(false);
            self.publish_outcome(entry.request, false, DecisionReason::Shutdown);
        }
        self.inner.requests.shutdown();
        self.inner.notifications.shutdown();
        tracing::debug!("permission service shut down");
    }

    fn build_request(&self, create: CreatePermissionRequest) -> PermissionRequest {
        let path = self.resolve_grant_dir(create.path.as_deref());
        PermissionRequest {
            id: Uuid::new_v4().to_string(),
            session_id: create.session_id,
            tool_call_id: create.tool_call_id,
            tool_name: create.tool_name,
            action: create.action,
            description: create.description,
            params: create.params,
            path,
        }
    }

    /// Reduces a request path to the directory a grant covers.
    fn resolve_grant_dir(&self, path: Option<&Path>) -> PathBuf {
        let working_dir = &self.inner.working_dir;
        let Some(path) = path.filter(|path| !path.as_os_str().is_empty()) else {
            return working_dir.clone();
        };
        if path == Path::new(".") {
            return working_dir.clone();
        }
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            working_dir.join(path)
        };
        if absolute.is_dir() {
            return absolute;
        }
        match absolute.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => working_dir.clone(),
        }
    }

    fn policy_short_circuit(&self, request: &PermissionRequest) -> Option<ShortCircuit> {
        let policy = lock_or_recover(&self.inner.policy);
        if policy
            .auto_approved_sessions
            .contains(&request.session_id)
        {
            return Some(ShortCircuit::AutoApprovedSession);
        }
        let scoped_tool = format!("{}:{}", request.tool_name, request.action);
        if self.inner.allowed_tools.contains(&request.tool_name)
            || self.inner.allowed_tools.contains(&scoped_tool)
        {
            return Some(ShortCircuit::AllowedTool);
        }
        if policy
            .persistent_grants
            .contains(&PersistentGrant::for_request(request))
        {
            return Some(ShortCircuit::PersistentGrant);
        }
        None
    }

    fn register_pending(&self, request: &PermissionRequest) -> Option<oneshot::Receiver<bool>> {
        let mut pending = lock_or_recover(&self.inner.pending);
        if pending.closed {
            return None;
        }
        let (resolver, decision) = oneshot::channel();
        let sequence = pending.next_sequence;
        pending.next_sequence += 1;
        pending.entries.insert(
            request.id.clone(),
            PendingRequest {
                sequence,
                request: request.clone(),
                resolver,
            },
        );
        Some(decision)
    }

    fn take_pending(&self, request_id: &str) -> Option<PendingRequest> {
        lock_or_recover(&self.inner.pending)
            .entries
            .remove(request_id)
    }

    fn resolve(&self, request_id: &str, granted: bool, reason: DecisionReason) -> bool {
        let Some(pending) = self.take_pending(request_id) else {
            tracing::debug!(
                request_id,
                "ignoring decision for unknown or already resolved permission request"
            );
            return false;
        };
        let _ = pending.resolver.send(granted);
        tracing::info!(
            request_id,
            tool_name = %pending.request.tool_name,
            session_id = %pending.request.session_id,
            granted,
            reason = ?reason,
            "permission request resolved"
        );
        self.publish_outcome(pending.request, granted, reason);
        true
    }

    fn publish_outcome(&self, request: PermissionRequest, granted: bool, reason: DecisionReason) {
        let kind = if granted {
            EventKind::Updated
        } else {
            EventKind::Deleted
        };
        self.inner.notifications.publish(
            kind,
            PermissionNotification {
                request,
                granted,
                reason,
            },
        );
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
