//! Session lifecycle management.
//!
//! Owns the set of live sessions: creation, lookup, enumeration, deletion
//! and startup rehydration from the durable store.
//!
//! Locks guard map mutation and snapshots only. No lock is held across an
//! engine or store call, so a slow disconnect on one session never stalls
//! work on another.

use super::client::{Session, SessionContext};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use wamux_core::{GatewayError, GatewayResult, ProtocolEngine, SessionStore};

/// Information returned when listing sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub client_id: String,
    pub phone_number: String,
    pub connected: bool,
}

impl SessionInfo {
    fn of(session: &Session) -> Self {
        Self {
            session_id: session.id().to_string(),
            client_id: session.client_id().to_string(),
            phone_number: session.phone_number(),
            connected: session.is_connected(),
        }
    }
}

/// Live sessions plus a `client_id -> session_id` index kept in step.
#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    by_client: HashMap<String, String>,
}

impl Registry {
    fn insert(&mut self, session: Arc<Session>) {
        self.by_client
            .insert(session.client_id().to_string(), session.id().to_string());
        self.sessions.insert(session.id().to_string(), session);
    }

    fn remove(&mut self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.remove(session_id)?;
        if self.by_client.get(session.client_id()).map(String::as_str) == Some(session_id) {
            self.by_client.remove(session.client_id());
        }
        Some(session)
    }
}

/// Manages all live sessions.
pub struct SessionManager {
    registry: RwLock<Registry>,
    /// One gate per `client_id` with a create in flight. Concurrent creates
    /// for the same client queue on it; other clients never see it.
    creating: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    engine: Arc<dyn ProtocolEngine>,
    ctx: SessionContext,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn ProtocolEngine>, ctx: SessionContext) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            creating: parking_lot::Mutex::new(HashMap::new()),
            engine,
            ctx,
        }
    }

    fn store(&self) -> &Arc<dyn SessionStore> {
        &self.ctx.store
    }

    /// Create a session for `client_id`, or return the live one it already has.
    pub async fn create_session(&self, client_id: &str) -> GatewayResult<Arc<Session>> {
        if client_id.trim().is_empty() {
            return Err(GatewayError::Validation("client_id is required".into()));
        }

        loop {
            let gate = self
                .creating
                .lock()
                .entry(client_id.to_string())
                .or_default()
                .clone();
            let _held = gate.lock().await;

            // The previous holder may have retired this gate while we waited.
            let current = matches!(
                self.creating.lock().get(client_id),
                Some(g) if Arc::ptr_eq(g, &gate)
            );
            if !current {
                continue;
            }

            let result = self.create_gated(client_id).await;
            self.creating.lock().remove(client_id);
            return result;
        }
    }

    async fn create_gated(&self, client_id: &str) -> GatewayResult<Arc<Session>> {
        if let Some(existing) = self.get_session_by_client_id(client_id).await {
            debug!(session_id = %existing.id(), client_id, "session already exists");
            return Ok(existing);
        }

        let session_id = generate_session_id();
        let device = self.store().new_device(&session_id).await?;

        let conn = match self.engine.open(&device).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "failed to open engine connection");
                self.release_device(&session_id).await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .store()
            .upsert_session(&session_id, client_id, "", false)
            .await
        {
            warn!(session_id = %session_id, error = %e, "failed to persist new session");
            self.release_device(&session_id).await;
            return Err(e);
        }

        let session = Session::new(session_id.clone(), client_id, conn, self.ctx.clone());
        self.registry.write().await.insert(session.clone());
        info!(session_id = %session_id, client_id, "session created");
        Ok(session)
    }

    async fn release_device(&self, session_id: &str) {
        if let Err(e) = self.store().delete_device(session_id).await {
            debug!(session_id, error = %e, "failed to release device");
        }
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.registry.read().await.sessions.get(session_id).cloned()
    }

    pub async fn get_session_by_client_id(&self, client_id: &str) -> Option<Arc<Session>> {
        let registry = self.registry.read().await;
        registry
            .by_client
            .get(client_id)
            .and_then(|id| registry.sessions.get(id))
            .cloned()
    }

    /// Forget a session, then disconnect it and delete its durable state.
    pub async fn delete_session(&self, session_id: &str) -> GatewayResult<()> {
        let session = self
            .registry
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {session_id}")))?;
        info!(session_id, client_id = %session.client_id(), "session removed");

        if let Err(e) = session.disconnect().await {
            debug!(session_id, error = %e, "disconnect before delete failed");
        }

        // No rollback: a row left behind here is reconciled on next startup.
        if let Err(e) = self.store().delete_session(session_id).await {
            warn!(session_id, error = %e, "failed to delete session record");
        }
        if let Err(e) = self.store().delete_device(session_id).await {
            warn!(session_id, error = %e, "failed to delete device binding");
        }
        Ok(())
    }

    /// Snapshot of all live sessions. Order is unspecified.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let registry = self.registry.read().await;
        registry
            .sessions
            .values()
            .map(|s| SessionInfo::of(s))
            .collect()
    }

    /// Rebuild sessions from the durable store and reconnect those that were
    /// connected at shutdown. Returns the number of sessions loaded.
    pub async fn load_existing_sessions(&self) -> GatewayResult<usize> {
        let records = self.store().list_sessions().await?;
        let devices = self.store().all_devices().await?;

        let mut loaded = 0;
        let mut reconnecting = 0;
        for record in records {
            let device = match devices.iter().find(|d| d.session_id == record.id) {
                Some(device) => device.clone(),
                None => {
                    warn!(session_id = %record.id, "no device binding, allocating a fresh one");
                    match self.store().new_device(&record.id).await {
                        Ok(device) => device,
                        Err(e) => {
                            warn!(session_id = %record.id, error = %e, "failed to allocate device");
                            continue;
                        }
                    }
                }
            };

            let conn = match self.engine.open(&device).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(session_id = %record.id, error = %e, "failed to open engine connection");
                    continue;
                }
            };

            let session = Session::new(record.id.clone(), record.client_id, conn, self.ctx.clone());
            self.registry.write().await.insert(session.clone());
            loaded += 1;

            if record.connected {
                reconnecting += 1;
                tokio::spawn(async move {
                    if let Err(e) = session.connect().await {
                        warn!(session_id = %session.id(), error = %e, "reconnect failed");
                    }
                });
            }
        }

        info!(loaded, reconnecting, "sessions restored");
        Ok(loaded)
    }

    /// Disconnect every live session at once. Durable state and the map are
    /// untouched.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self.registry.read().await.sessions.values().cloned().collect();
        join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.disconnect().await {
                debug!(session_id = %session.id(), error = %e, "disconnect on shutdown failed");
            }
        }))
        .await;
        info!(count = sessions.len(), "sessions disconnected");
    }

    pub async fn count(&self) -> usize {
        self.registry.read().await.sessions.len()
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
