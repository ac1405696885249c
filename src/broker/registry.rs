//! Session registry: the authoritative client id → session map.
//!
//! Invariants the registry maintains:
//! 1. at most one session per client id,
//! 2. at most one of those in the `Connected` state,
//! 3. a `Connected` session has a live delivery binding,
//! 4. clean sessions are removed on disconnect; persistent ones park in
//!    `Disconnected` with their queues and in-flight maps intact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::broker::session::{DeliveryRequest, Session, SessionState};
use crate::error::{MqttError, Result};
use crate::packet::connect::ConnectPacket;

/// How long a takeover waits for the previous connection to finish its
/// teardown before the session is reported corrupted.
const TAKEOVER_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_MAX_QUEUED: usize = 1024;

/// How the registry satisfied a CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationMode {
    /// No session existed; a fresh one was created
    CreatedNew,
    /// A persistent session existed and was reopened with state intact
    ReopenedExisting,
    /// A session existed but the CONNECT was clean; the old state was
    /// discarded and a fresh session created
    DroppedExistingCreatedNew,
}

/// Outcome of [`SessionRegistry::create_or_reopen`].
#[derive(Debug, Clone)]
pub struct SessionCreationResult {
    /// The session to bind
    pub session: Arc<Session>,
    /// Whether a session was already stored for this client id
    pub already_stored: bool,
    /// How the session was produced
    pub mode: CreationMode,
}

/// Authoritative mapping of client ids to sessions, shared by every
/// connection.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_queued: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }

    /// Sets the offline queue bound applied to sessions this registry
    /// creates.
    #[must_use]
    pub fn with_max_queued_messages(mut self, max: usize) -> Self {
        self.max_queued = max;
        self
    }

    /// Looks up the session for a client id.
    pub async fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    /// Number of stored sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Returns true when no session is stored.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Produces the session for a CONNECT, creating, reopening or replacing
    /// as the clean session flag demands. The returned session is in the
    /// `Connecting` state.
    ///
    /// When the client id is bound to a live connection, that connection is
    /// told to close (no DISCONNECT packet is written to it) and its
    /// teardown completes before this call returns.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::SessionCorrupted`] when the existing session
    /// cannot be reconciled: the previous binding did not finish its
    /// teardown in time, or the stored session is in an unexpected state.
    pub async fn create_or_reopen(
        &self,
        connect: &ConnectPacket,
        client_id: &str,
    ) -> Result<SessionCreationResult> {
        let existing = self.get(client_id).await;

        if let Some(ref session) = existing {
            if session.is_connected().await {
                self.disconnect_existing(session).await?;
            }
        }

        let mut sessions = self.sessions.write().await;

        // Re-check under the write lock: the map may have changed while the
        // takeover was in flight.
        let existing = sessions.get(client_id).cloned();
        let already_stored = existing.is_some();

        match existing {
            None => {
                trace!("Creating new session for {client_id}");
                let session = Arc::new(Session::new(
                    client_id,
                    connect.clean_session,
                    connect.will.clone(),
                    self.max_queued,
                ));
                sessions.insert(client_id.to_string(), session.clone());
                Ok(SessionCreationResult {
                    session,
                    already_stored,
                    mode: CreationMode::CreatedNew,
                })
            }
            Some(old) if connect.clean_session => {
                debug!("Clean CONNECT for {client_id}, dropping stored session");
                old.destroy().await;
                let session = Arc::new(Session::new(
                    client_id,
                    true,
                    connect.will.clone(),
                    self.max_queued,
                ));
                sessions.insert(client_id.to_string(), session.clone());
                Ok(SessionCreationResult {
                    session,
                    already_stored,
                    mode: CreationMode::DroppedExistingCreatedNew,
                })
            }
            Some(old) => {
                if !old.mark_connecting().await {
                    warn!("Stored session for {client_id} is not reopenable");
                    return Err(MqttError::SessionCorrupted);
                }
                trace!("Reopening stored session for {client_id}");
                // The reconnect replaces the will
                old.set_will(connect.will.clone()).await;
                Ok(SessionCreationResult {
                    session: old,
                    already_stored,
                    mode: CreationMode::ReopenedExisting,
                })
            }
        }
    }

    /// Removes a session. The entry is only dropped when it still maps to
    /// the same session instance.
    pub async fn remove(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        if let Some(stored) = sessions.get(session.client_id()) {
            if Arc::ptr_eq(stored, session) {
                debug!("Removing session for {}", session.client_id());
                sessions.remove(session.client_id());
            }
        }
        session.destroy().await;
    }

    /// Tells the connection currently bound to `session` to tear down and
    /// waits for it to finish.
    async fn disconnect_existing(&self, session: &Arc<Session>) -> Result<()> {
        debug!(
            "Session takeover: disconnecting existing connection for {}",
            session.client_id()
        );

        let Some(handle) = session.bound_handle().await else {
            // Connected without a binding should not happen; reconcile by
            // parking the session.
            session.disconnect().await;
            return Ok(());
        };

        let (done_tx, done_rx) = oneshot::channel();
        if handle
            .send(DeliveryRequest::Takeover { done: done_tx })
            .await
            .is_err()
        {
            // The old event loop is already gone; park the session directly.
            session.disconnect().await;
            return Ok(());
        }

        match timeout(TAKEOVER_TIMEOUT, done_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                warn!(
                    "Takeover of {} did not complete in time",
                    session.client_id()
                );
                return Err(MqttError::SessionCorrupted);
            }
        }

        if session.state().await == SessionState::Connected {
            return Err(MqttError::SessionCorrupted);
        }
        Ok(())
    }
}
