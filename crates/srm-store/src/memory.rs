//! In-process [`Store`] used by tests and single-binary setups.

use async_trait::async_trait;
use srm_types::{ActiveDeltas, Delta, DeltaState};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::error::{DbError, DbResult};
use crate::records::{
    ActiveDeltasRecord, DeltaConnection, DeltaTimeState, DeltaUpdate, HostRecord,
    HostStateRecord, InstanceStartEnd, ModelRecord, RefreshTokenRecord, ServiceAction,
    ServiceRecord, ServiceStateRecord, StateRecord, SwitchRecord, UserRecord,
};
use crate::store::Store;

#[derive(Default)]
struct Tables {
    next_id: i64,
    models: Vec<ModelRecord>,
    deltas: Vec<Delta>,
    connections: Vec<DeltaConnection>,
    states: Vec<StateRecord>,
    hoststates: Vec<HostStateRecord>,
    hoststateshistory: Vec<HostStateRecord>,
    hosts: BTreeMap<String, HostRecord>,
    switches: BTreeMap<(String, String), SwitchRecord>,
    services: BTreeMap<(String, String), ServiceRecord>,
    servicestates: BTreeMap<(String, String), ServiceStateRecord>,
    serviceactions: Vec<ServiceAction>,
    active: Option<ActiveDeltasRecord>,
    timestates: Vec<DeltaTimeState>,
    forceapply: Vec<String>,
    overrides: Vec<InstanceStartEnd>,
    users: BTreeMap<String, UserRecord>,
    refresh_tokens: BTreeMap<String, RefreshTokenRecord>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// [`Store`] backed by maps behind a tokio `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_model(&self, model: &ModelRecord) -> DbResult<()> {
        let mut t = self.tables.write().await;
        if t.models.iter().any(|m| m.uid == model.uid) {
            return Err(DbError::Conflict(format!("model {} already exists", model.uid)));
        }
        t.models.push(model.clone());
        Ok(())
    }

    async fn latest_model(&self) -> DbResult<Option<ModelRecord>> {
        Ok(self.tables.read().await.models.last().cloned())
    }

    async fn get_model(&self, uid: &str) -> DbResult<Option<ModelRecord>> {
        let t = self.tables.read().await;
        Ok(t.models.iter().find(|m| m.uid == uid).cloned())
    }

    async fn list_models(&self) -> DbResult<Vec<ModelRecord>> {
        let t = self.tables.read().await;
        Ok(t.models.iter().rev().cloned().collect())
    }

    async fn delete_models_before(&self, cutoff: i64) -> DbResult<Vec<ModelRecord>> {
        let mut t = self.tables.write().await;
        let (old, keep): (Vec<_>, Vec<_>) =
            t.models.drain(..).partition(|m| m.insertdate < cutoff);
        t.models = keep;
        Ok(old)
    }

    async fn insert_delta(&self, delta: &Delta) -> DbResult<()> {
        let mut t = self.tables.write().await;
        if t.deltas.iter().any(|d| d.uid == delta.uid) {
            return Err(DbError::Conflict(format!("delta {} already exists", delta.uid)));
        }
        t.deltas.push(delta.clone());
        Ok(())
    }

    async fn get_delta(&self, uid: &str) -> DbResult<Option<Delta>> {
        let t = self.tables.read().await;
        Ok(t.deltas.iter().find(|d| d.uid == uid).cloned())
    }

    async fn list_deltas(&self) -> DbResult<Vec<Delta>> {
        let t = self.tables.read().await;
        let mut deltas = t.deltas.clone();
        deltas.sort_by_key(|d| d.insertdate);
        Ok(deltas)
    }

    async fn deltas_in_state(&self, state: DeltaState) -> DbResult<Vec<Delta>> {
        let mut deltas = self.list_deltas().await?;
        deltas.retain(|d| d.state == state);
        Ok(deltas)
    }

    async fn update_delta(&self, uid: &str, update: &DeltaUpdate) -> DbResult<()> {
        let mut t = self.tables.write().await;
        let delta = t
            .deltas
            .iter_mut()
            .find(|d| d.uid == uid)
            .ok_or_else(|| DbError::NotFound(uid.to_string()))?;
        if let Some(state) = update.state {
            delta.state = state;
        }
        if let Some(modadd) = update.modadd {
            delta.modadd = modadd;
        }
        if let Some(error) = &update.error {
            delta.error = Some(error.clone());
        }
        delta.updatedate = update.updatedate;
        Ok(())
    }

    async fn delete_delta(&self, uid: &str) -> DbResult<u64> {
        let mut t = self.tables.write().await;
        let before = t.deltas.len();
        t.deltas.retain(|d| d.uid != uid);
        let removed = (before - t.deltas.len()) as u64;
        t.connections.retain(|c| c.deltaid != uid);
        t.states.retain(|s| s.deltaid != uid);
        t.hoststates.retain(|s| s.deltaid != uid);
        t.hoststateshistory.retain(|s| s.deltaid != uid);
        Ok(removed)
    }

    async fn insert_delta_connection(&self, connection: &DeltaConnection) -> DbResult<()> {
        let mut t = self.tables.write().await;
        if t.connections
            .iter()
            .any(|c| c.deltaid == connection.deltaid && c.connectionid == connection.connectionid)
        {
            return Err(DbError::Conflict(format!(
                "connection {} of delta {} already exists",
                connection.connectionid, connection.deltaid
            )));
        }
        t.connections.push(connection.clone());
        Ok(())
    }

    async fn delta_connections(&self, deltaid: &str) -> DbResult<Vec<DeltaConnection>> {
        let t = self.tables.read().await;
        Ok(t.connections
            .iter()
            .filter(|c| c.deltaid == deltaid)
            .cloned()
            .collect())
    }

    async fn connections_for(&self, connectionid: &str) -> DbResult<Vec<DeltaConnection>> {
        let t = self.tables.read().await;
        Ok(t.connections
            .iter()
            .filter(|c| c.connectionid == connectionid)
            .cloned()
            .collect())
    }

    async fn update_connection_state(
        &self,
        deltaid: &str,
        connectionid: &str,
        state: &str,
    ) -> DbResult<u64> {
        let mut t = self.tables.write().await;
        let mut updated = 0;
        for c in t
            .connections
            .iter_mut()
            .filter(|c| c.deltaid == deltaid && c.connectionid == connectionid)
        {
            c.state = state.to_string();
            updated += 1;
        }
        Ok(updated)
    }

    async fn insert_state(&self, state: &StateRecord) -> DbResult<()> {
        self.tables.write().await.states.push(state.clone());
        Ok(())
    }

    async fn delta_states(&self, deltaid: &str) -> DbResult<Vec<StateRecord>> {
        let t = self.tables.read().await;
        Ok(t.states
            .iter()
            .filter(|s| s.deltaid == deltaid)
            .cloned()
            .collect())
    }

    async fn upsert_host_state(&self, state: &HostStateRecord) -> DbResult<()> {
        let mut t = self.tables.write().await;
        match t
            .hoststates
            .iter_mut()
            .find(|s| s.deltaid == state.deltaid && s.hostname == state.hostname)
        {
            Some(existing) => {
                existing.state = state.state;
                existing.updatedate = state.updatedate;
            }
            None => t.hoststates.push(state.clone()),
        }
        t.hoststateshistory.push(state.clone());
        Ok(())
    }

    async fn host_states(&self, deltaid: &str) -> DbResult<Vec<HostStateRecord>> {
        let t = self.tables.read().await;
        Ok(t.hoststates
            .iter()
            .filter(|s| s.deltaid == deltaid)
            .cloned()
            .collect())
    }

    async fn host_state_history(&self, deltaid: &str) -> DbResult<Vec<HostStateRecord>> {
        let t = self.tables.read().await;
        Ok(t.hoststateshistory
            .iter()
            .filter(|s| s.deltaid == deltaid)
            .cloned()
            .collect())
    }

    async fn upsert_host(&self, host: &HostRecord) -> DbResult<()> {
        let mut t = self.tables.write().await;
        let insertdate = t
            .hosts
            .get(&host.hostname)
            .map(|h| h.insertdate)
            .unwrap_or(host.insertdate);
        let mut host = host.clone();
        host.insertdate = insertdate;
        t.hosts.insert(host.hostname.clone(), host);
        Ok(())
    }

    async fn get_host(&self, hostname: &str) -> DbResult<Option<HostRecord>> {
        Ok(self.tables.read().await.hosts.get(hostname).cloned())
    }

    async fn list_hosts(&self) -> DbResult<Vec<HostRecord>> {
        Ok(self.tables.read().await.hosts.values().cloned().collect())
    }

    async fn upsert_switch(&self, switch: &SwitchRecord) -> DbResult<()> {
        let mut t = self.tables.write().await;
        t.switches.insert(
            (switch.sitename.clone(), switch.device.clone()),
            switch.clone(),
        );
        Ok(())
    }

    async fn list_switches(&self, sitename: &str) -> DbResult<Vec<SwitchRecord>> {
        let t = self.tables.read().await;
        Ok(t.switches
            .values()
            .filter(|s| s.sitename == sitename)
            .cloned()
            .collect())
    }

    async fn upsert_service(&self, service: &ServiceRecord) -> DbResult<()> {
        let mut t = self.tables.write().await;
        t.services.insert(
            (service.hostname.clone(), service.servicename.clone()),
            service.clone(),
        );
        Ok(())
    }

    async fn list_services(&self, hostname: Option<&str>) -> DbResult<Vec<ServiceRecord>> {
        let t = self.tables.read().await;
        Ok(t.services
            .values()
            .filter(|s| hostname.map_or(true, |h| s.hostname == h))
            .cloned()
            .collect())
    }

    async fn upsert_service_state(&self, state: &ServiceStateRecord) -> DbResult<()> {
        let mut t = self.tables.write().await;
        t.servicestates.insert(
            (state.hostname.clone(), state.servicename.clone()),
            state.clone(),
        );
        Ok(())
    }

    async fn list_service_states(&self) -> DbResult<Vec<ServiceStateRecord>> {
        Ok(self.tables.read().await.servicestates.values().cloned().collect())
    }

    async fn insert_service_action(&self, action: &ServiceAction) -> DbResult<()> {
        let mut t = self.tables.write().await;
        let mut action = action.clone();
        action.id = t.next_id();
        t.serviceactions.push(action);
        Ok(())
    }

    async fn service_actions(
        &self,
        hostname: Option<&str>,
        servicename: Option<&str>,
    ) -> DbResult<Vec<ServiceAction>> {
        let t = self.tables.read().await;
        Ok(t.serviceactions
            .iter()
            .filter(|a| hostname.map_or(true, |h| a.hostname == h))
            .filter(|a| servicename.map_or(true, |s| a.servicename == s))
            .cloned()
            .collect())
    }

    async fn delete_service_actions(
        &self,
        hostname: &str,
        servicename: Option<&str>,
    ) -> DbResult<u64> {
        let mut t = self.tables.write().await;
        let before = t.serviceactions.len();
        t.serviceactions.retain(|a| {
            !(a.hostname == hostname && servicename.map_or(true, |s| a.servicename == s))
        });
        Ok((before - t.serviceactions.len()) as u64)
    }

    async fn get_active_deltas(&self) -> DbResult<ActiveDeltasRecord> {
        Ok(self.tables.read().await.active.clone().unwrap_or_default())
    }

    async fn compare_and_set_active_deltas(
        &self,
        expected_version: i64,
        doc: &ActiveDeltas,
        now: i64,
    ) -> DbResult<i64> {
        let mut t = self.tables.write().await;
        let current = t.active.as_ref().map(|a| a.version).unwrap_or(0);
        if current != expected_version {
            return Err(DbError::Conflict(format!(
                "active deltas version is {}, expected {}",
                current, expected_version
            )));
        }
        let insertdate = t.active.as_ref().map(|a| a.insertdate).unwrap_or(now);
        t.active = Some(ActiveDeltasRecord {
            insertdate,
            updatedate: now,
            version: current + 1,
            output: doc.clone(),
        });
        Ok(current + 1)
    }

    async fn insert_delta_time_state(&self, state: &DeltaTimeState) -> DbResult<()> {
        let mut t = self.tables.write().await;
        let mut state = state.clone();
        state.id = t.next_id();
        t.timestates.push(state);
        Ok(())
    }

    async fn list_delta_time_states(&self) -> DbResult<Vec<DeltaTimeState>> {
        let t = self.tables.read().await;
        let mut states = t.timestates.clone();
        states.sort_by_key(|s| (s.insertdate, s.id));
        Ok(states)
    }

    async fn delta_time_states(&self, uuid: &str) -> DbResult<Vec<DeltaTimeState>> {
        let mut states = self.list_delta_time_states().await?;
        states.retain(|s| s.uuid == uuid);
        Ok(states)
    }

    async fn delete_delta_time_states(&self, uuid: &str) -> DbResult<u64> {
        let mut t = self.tables.write().await;
        let before = t.timestates.len();
        t.timestates.retain(|s| s.uuid != uuid);
        Ok((before - t.timestates.len()) as u64)
    }

    async fn insert_force_apply(&self, uuid: &str) -> DbResult<()> {
        self.tables.write().await.forceapply.push(uuid.to_string());
        Ok(())
    }

    async fn take_force_apply(&self) -> DbResult<Vec<String>> {
        Ok(std::mem::take(&mut self.tables.write().await.forceapply))
    }

    async fn insert_instance_override(&self, entry: &InstanceStartEnd) -> DbResult<()> {
        let mut t = self.tables.write().await;
        let mut entry = entry.clone();
        entry.id = t.next_id();
        t.overrides.push(entry);
        Ok(())
    }

    async fn take_instance_overrides(&self) -> DbResult<Vec<InstanceStartEnd>> {
        let mut overrides = std::mem::take(&mut self.tables.write().await.overrides);
        overrides.sort_by_key(|o| (o.insertdate, o.id));
        Ok(overrides)
    }

    async fn upsert_user(&self, user: &UserRecord) -> DbResult<()> {
        let mut t = self.tables.write().await;
        t.users.insert(user.username.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, username: &str) -> DbResult<Option<UserRecord>> {
        Ok(self.tables.read().await.users.get(username).cloned())
    }

    async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> DbResult<()> {
        let mut t = self.tables.write().await;
        if t.refresh_tokens.contains_key(&token.token_hash) {
            return Err(DbError::Conflict("refresh token already exists".into()));
        }
        t.refresh_tokens
            .insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn get_refresh_token(&self, token_hash: &str) -> DbResult<Option<RefreshTokenRecord>> {
        Ok(self.tables.read().await.refresh_tokens.get(token_hash).cloned())
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> DbResult<bool> {
        let mut t = self.tables.write().await;
        match t.refresh_tokens.get_mut(token_hash) {
            Some(token) if !token.revoked => {
                token.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired_refresh_tokens(&self, now: i64) -> DbResult<u64> {
        let mut t = self.tables.write().await;
        let before = t.refresh_tokens.len();
        t.refresh_tokens.retain(|_, token| token.expires_at > now);
        Ok((before - t.refresh_tokens.len()) as u64)
    }
}
