//! In-process store for tests and `--ephemeral` runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use wamux_core::{DeviceHandle, GatewayResult, Jid, SessionRecord, SessionStore};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    devices: RwLock<HashMap<String, DeviceHandle>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert_session(
        &self,
        id: &str,
        client_id: &str,
        phone_number: &str,
        connected: bool,
    ) -> GatewayResult<()> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let created_at = sessions.get(id).map(|r| r.created_at).unwrap_or(now);
        sessions.insert(
            id.to_string(),
            SessionRecord {
                id: id.to_string(),
                client_id: client_id.to_string(),
                phone_number: phone_number.to_string(),
                connected,
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get_session(&self, id: &str) -> GatewayResult<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn get_session_by_client_id(
        &self,
        client_id: &str,
    ) -> GatewayResult<Option<SessionRecord>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|r| r.client_id == client_id)
            .cloned())
    }

    async fn delete_session(&self, id: &str) -> GatewayResult<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn list_sessions(&self) -> GatewayResult<Vec<SessionRecord>> {
        let mut records: Vec<_> = self.sessions.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn new_device(&self, session_id: &str) -> GatewayResult<DeviceHandle> {
        let device = DeviceHandle::new(session_id);
        self.devices
            .write()
            .await
            .insert(session_id.to_string(), device.clone());
        Ok(device)
    }

    async fn all_devices(&self) -> GatewayResult<Vec<DeviceHandle>> {
        Ok(self.devices.read().await.values().cloned().collect())
    }

    async fn delete_device(&self, session_id: &str) -> GatewayResult<()> {
        self.devices.write().await.remove(session_id);
        Ok(())
    }

    async fn set_device_identity(&self, session_id: &str, jid: Option<&Jid>) -> GatewayResult<()> {
        self.devices
            .write()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| DeviceHandle::new(session_id))
            .jid = jid.cloned();
        Ok(())
    }
}
