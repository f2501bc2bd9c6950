//! Asynchronous operator approval for dangerous commands.
//!
//! Each request is a cancellable one-shot: the dispatcher stores a
//! [`PendingCommand`], emits a `permission.required` event upward, and
//! awaits the decision. Every id resolves exactly once — by operator
//! response, by timeout, or by session abort.

use std::{collections::HashMap, sync::Arc, time::Duration};

use {
    tokio::sync::{oneshot, RwLock},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use hearth_common::now_ms;

/// Default operator decision window. Must stay strictly below the host RPC
/// timeout so the host never sees a dangling request.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Pending entries older than this are swept even if never resolved.
const PENDING_TTL_MS: u64 = 5 * 60 * 1000;

/// A command awaiting operator consent.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingCommand {
    pub id: String,
    pub session_id: String,
    pub chat_id: String,
    pub command: String,
    pub cwd: String,
    pub reason: String,
    pub created_at_ms: u64,
}

struct PendingEntry {
    command: PendingCommand,
    tx: oneshot::Sender<bool>,
}

/// Owns all pending commands and resolves their futures.
pub struct ApprovalCoordinator {
    pending: RwLock<HashMap<String, PendingEntry>>,
    timeout: Duration,
}

impl Default for ApprovalCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT)
    }
}

impl ApprovalCoordinator {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Register a request. Returns the pending-command record (for the
    /// `permission.required` event) and a receiver for the decision.
    pub async fn request(
        &self,
        session_id: &str,
        chat_id: &str,
        command: &str,
        cwd: &str,
        reason: &str,
    ) -> (PendingCommand, oneshot::Receiver<bool>) {
        self.sweep_expired().await;

        let record = PendingCommand {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            chat_id: chat_id.to_string(),
            command: command.to_string(),
            cwd: cwd.to_string(),
            reason: reason.to_string(),
            created_at_ms: now_ms(),
        };
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(record.id.clone(), PendingEntry {
            command: record.clone(),
            tx,
        });
        debug!(id = %record.id, session = session_id, command, "approval requested");
        (record, rx)
    }

    /// Resolve a pending request. Returns false when the id is unknown or
    /// was already consumed — each entry fires at most once.
    pub async fn respond(&self, id: &str, approved: bool) -> bool {
        match self.pending.write().await.remove(id) {
            Some(entry) => {
                let _ = entry.tx.send(approved);
                debug!(id, approved, "approval resolved");
                true
            },
            None => {
                warn!(id, "approval response for unknown or consumed request");
                false
            },
        }
    }

    /// Pending commands for one session, oldest first.
    pub async fn list(&self, session_id: &str) -> Vec<PendingCommand> {
        let pending = self.pending.read().await;
        let mut out: Vec<PendingCommand> = pending
            .values()
            .filter(|e| e.command.session_id == session_id)
            .map(|e| e.command.clone())
            .collect();
        out.sort_by_key(|c| c.created_at_ms);
        out
    }

    /// Resolve every outstanding request for a session to denied. Used on
    /// session abort; the denial is silent (no operator notification).
    pub async fn cancel_all(&self, session_id: &str) {
        let mut pending = self.pending.write().await;
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, e)| e.command.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Some(entry) = pending.remove(&id) {
                let _ = entry.tx.send(false);
                debug!(id, session = session_id, "approval cancelled by abort");
            }
        }
    }

    /// Await a decision, resolving to denied on timeout, a dropped sender,
    /// or session abort — whichever comes first.
    pub async fn wait(&self, rx: oneshot::Receiver<bool>, abort: &CancellationToken) -> bool {
        tokio::select! {
            decision = tokio::time::timeout(self.timeout, rx) => match decision {
                Ok(Ok(approved)) => approved,
                Ok(Err(_)) => {
                    warn!("approval channel closed before decision");
                    false
                },
                Err(_) => {
                    warn!("approval timed out");
                    false
                },
            },
            () = abort.cancelled() => {
                debug!("approval wait aborted by session");
                false
            },
        }
    }

    /// Drop entries past the pending TTL, resolving them to denied.
    async fn sweep_expired(&self) {
        let cutoff = now_ms().saturating_sub(PENDING_TTL_MS);
        let mut pending = self.pending.write().await;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, e)| e.command.created_at_ms < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(entry) = pending.remove(&id) {
                let _ = entry.tx.send(false);
                debug!(id, "expired pending command swept");
            }
        }
    }
}
