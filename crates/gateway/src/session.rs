//! Client session lifecycle and in-flight call tracking.
//!
//! The session map lock is only held to insert, look up or remove an `Arc<Session>`; state
//! transitions happen under each session's own mutex. Closing a session cancels its token,
//! which every pending call's token is a child of.

use crate::error::SessionError;
use crate::protocol::RequestId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a session. Before `initialize` there is no session at all, so the first state
/// a session is ever in is `Initializing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Explicit,
    IdleTimeout,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::Explicit => "explicit",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Shutdown => "shutdown",
        })
    }
}

/// What a client declared in `initialize`, after version negotiation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitializeParams {
    pub protocol_version: String,
    /// Keys of the client's `capabilities` object.
    pub capabilities: BTreeSet<String>,
    pub client_info: Option<Value>,
}

impl InitializeParams {
    /// Read the client side of an `initialize` request. `protocol_version` is the negotiated one.
    #[must_use]
    pub fn from_request(params: &Map<String, Value>, protocol_version: &str) -> Self {
        let capabilities = params
            .get("capabilities")
            .and_then(Value::as_object)
            .map(|caps| caps.keys().cloned().collect())
            .unwrap_or_default();
        Self {
            protocol_version: protocol_version.to_string(),
            capabilities,
            client_info: params.get("clientInfo").cloned(),
        }
    }
}

#[derive(Debug)]
struct PendingCall {
    seq: u64,
    tool_name: String,
    started_at: Instant,
    token: CancellationToken,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    last_activity: Instant,
    pending: HashMap<RequestId, PendingCall>,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    params: InitializeParams,
    cancel: CancellationToken,
    inner: Mutex<SessionInner>,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn protocol_version(&self) -> &str {
        &self.params.protocol_version
    }

    #[must_use]
    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.params.capabilities
    }

    #[must_use]
    pub fn client_info(&self) -> Option<&Value> {
        self.params.client_info.as_ref()
    }

    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Registration of one in-flight `tools/call`. Dropping it deregisters the call, whether it
/// finished, failed, or its request future was dropped.
#[derive(Debug)]
pub struct PendingCallGuard {
    session: Arc<Session>,
    request_id: RequestId,
    seq: u64,
    token: CancellationToken,
}

impl PendingCallGuard {
    /// Cancelled when the call is cancelled or its session closes.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl Drop for PendingCallGuard {
    fn drop(&mut self) {
        let mut inner = self.session.inner.lock();
        if inner.pending.get(&self.request_id).is_some_and(|p| p.seq == self.seq) {
            if let Some(call) = inner.pending.remove(&self.request_id) {
                tracing::trace!(
                    session_id = %self.session.id,
                    request_id = %self.request_id,
                    tool = %call.tool_name,
                    elapsed = ?call.started_at.elapsed(),
                    "pending call finished"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub initializing: usize,
    pub ready: usize,
    pub total: usize,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    idle_timeout: Option<Duration>,
    next_seq: AtomicU64,
}

impl SessionManager {
    /// `idle_timeout = None` keeps sessions until they are closed explicitly.
    #[must_use]
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
            next_seq: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Start a session in the `initializing` state.
    pub fn create(&self, params: InitializeParams) -> Arc<Session> {
        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            params,
            cancel: CancellationToken::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Initializing,
                last_activity: Instant::now(),
                pending: HashMap::new(),
            }),
        });
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        tracing::info!(
            session_id = %session.id,
            protocol_version = %session.params.protocol_version,
            "session created"
        );
        session
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// `initializing -> ready`. Any other state, or an unknown id, is left alone.
    pub fn mark_initialized(&self, id: &str) -> bool {
        let Some(session) = self.get(id) else {
            tracing::debug!(session_id = %id, "initialized for unknown session");
            return false;
        };
        let mut inner = session.inner.lock();
        if inner.state == SessionState::Initializing {
            inner.state = SessionState::Ready;
            inner.last_activity = Instant::now();
            tracing::debug!(session_id = %id, "session ready");
            true
        } else {
            tracing::debug!(session_id = %id, state = ?inner.state, "ignoring initialized");
            false
        }
    }

    /// # Errors
    ///
    /// [`SessionError::NotFound`] for unknown or closed ids, [`SessionError::NotReady`] before
    /// `notifications/initialized`.
    pub fn require_ready(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let state = session.state();
        match state {
            SessionState::Ready => Ok(session),
            SessionState::Closed => Err(SessionError::NotFound(id.to_string())),
            SessionState::Initializing => Err(SessionError::NotReady(id.to_string())),
        }
    }

    /// Register an in-flight call.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotFound`] if the session closed in the meantime.
    pub fn begin_call(
        &self,
        session: &Arc<Session>,
        request_id: RequestId,
        tool_name: &str,
    ) -> Result<PendingCallGuard, SessionError> {
        let mut inner = session.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(SessionError::NotFound(session.id.clone()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = session.cancel.child_token();
        inner.last_activity = Instant::now();
        let previous = inner.pending.insert(
            request_id.clone(),
            PendingCall {
                seq,
                tool_name: tool_name.to_string(),
                started_at: Instant::now(),
                token: token.clone(),
            },
        );
        if previous.is_some() {
            tracing::debug!(
                session_id = %session.id,
                request_id = %request_id,
                "request id reused while a call is pending"
            );
        }
        drop(inner);

        Ok(PendingCallGuard {
            session: session.clone(),
            request_id,
            seq,
            token,
        })
    }

    /// Cancel one pending call. Returns whether a call was found.
    pub fn cancel_call(&self, id: &str, request_id: &RequestId) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        let inner = session.inner.lock();
        match inner.pending.get(request_id) {
            Some(call) => {
                call.token.cancel();
                tracing::info!(
                    session_id = %id,
                    request_id = %request_id,
                    tool = %call.tool_name,
                    "pending call cancelled"
                );
                true
            }
            None => false,
        }
    }

    /// Close a session and cancel everything in flight on it. Returns whether it existed.
    pub fn close(&self, id: &str, reason: CloseReason) -> bool {
        let Some(session) = self.sessions.write().remove(id) else {
            return false;
        };
        let pending = {
            let mut inner = session.inner.lock();
            inner.state = SessionState::Closed;
            std::mem::take(&mut inner.pending).len()
        };
        session.cancel.cancel();
        tracing::info!(session_id = %id, reason = %reason, pending, "session closed");
        true
    }

    /// Record activity on a session.
    pub fn touch(&self, id: &str) {
        if let Some(session) = self.get(id) {
            session.inner.lock().last_activity = Instant::now();
        }
    }

    /// Close sessions idle for longer than the idle timeout. Sessions with calls in flight are
    /// not idle. Returns the closed ids.
    pub fn reap_idle(&self, now: Instant) -> Vec<String> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let candidates: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let stale: Vec<String> = candidates
            .iter()
            .filter(|s| {
                let inner = s.inner.lock();
                inner.pending.is_empty() && now.saturating_duration_since(inner.last_activity) > timeout
            })
            .map(|s| s.id.clone())
            .collect();

        stale
            .into_iter()
            .filter(|id| self.close(id, CloseReason::IdleTimeout))
            .collect()
    }

    /// Periodically reap idle sessions until `shutdown` is cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let closed = manager.reap_idle(Instant::now());
                        if !closed.is_empty() {
                            tracing::info!(count = closed.len(), "reaped idle sessions");
                        }
                    }
                }
            }
            tracing::debug!("session reaper stopped");
        })
    }

    /// Close every session (process shutdown).
    pub fn close_all(&self, reason: CloseReason) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            self.close(&id, reason);
        }
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let mut stats = SessionStats {
            total: sessions.len(),
            ..SessionStats::default()
        };
        for s in sessions {
            match s.state() {
                SessionState::Ready => stats.ready += 1,
                SessionState::Initializing => stats.initializing += 1,
                SessionState::Closed => {}
            }
        }
        stats
    }
}
