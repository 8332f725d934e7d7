//! The storage seam used by every frontend component.

use async_trait::async_trait;
use srm_types::{ActiveDeltas, Delta, DeltaState};

use crate::error::DbResult;
use crate::records::{
    ActiveDeltasRecord, DeltaConnection, DeltaTimeState, DeltaUpdate, HostRecord,
    HostStateRecord, InstanceStartEnd, ModelRecord, RefreshTokenRecord, ServiceAction,
    ServiceRecord, ServiceStateRecord, StateRecord, SwitchRecord, UserRecord,
};

/// Persisted state of the site resource manager.
///
/// Implementations must make [`Store::compare_and_set_active_deltas`] atomic:
/// it is the only way the active-deltas document is written.
#[async_trait]
pub trait Store: Send + Sync {
    // Models

    async fn insert_model(&self, model: &ModelRecord) -> DbResult<()>;
    /// Most recently inserted model.
    async fn latest_model(&self) -> DbResult<Option<ModelRecord>>;
    async fn get_model(&self, uid: &str) -> DbResult<Option<ModelRecord>>;
    /// Newest first.
    async fn list_models(&self) -> DbResult<Vec<ModelRecord>>;
    /// Deletes models inserted strictly before `cutoff` and returns them.
    async fn delete_models_before(&self, cutoff: i64) -> DbResult<Vec<ModelRecord>>;

    // Deltas

    /// Fails with `Conflict` when the uid is already known.
    async fn insert_delta(&self, delta: &Delta) -> DbResult<()>;
    async fn get_delta(&self, uid: &str) -> DbResult<Option<Delta>>;
    /// Oldest first.
    async fn list_deltas(&self) -> DbResult<Vec<Delta>>;
    /// Deltas in `state`, oldest first.
    async fn deltas_in_state(&self, state: DeltaState) -> DbResult<Vec<Delta>>;
    async fn update_delta(&self, uid: &str, update: &DeltaUpdate) -> DbResult<()>;
    /// Deletes the delta and every row that references it.
    async fn delete_delta(&self, uid: &str) -> DbResult<u64>;

    // Delta connections

    async fn insert_delta_connection(&self, connection: &DeltaConnection) -> DbResult<()>;
    async fn delta_connections(&self, deltaid: &str) -> DbResult<Vec<DeltaConnection>>;
    /// Every delta row that references `connectionid`.
    async fn connections_for(&self, connectionid: &str) -> DbResult<Vec<DeltaConnection>>;
    async fn update_connection_state(
        &self,
        deltaid: &str,
        connectionid: &str,
        state: &str,
    ) -> DbResult<u64>;

    // State history

    async fn insert_state(&self, state: &StateRecord) -> DbResult<()>;
    async fn delta_states(&self, deltaid: &str) -> DbResult<Vec<StateRecord>>;

    // Host states

    /// Upserts the current row and appends to the history table.
    async fn upsert_host_state(&self, state: &HostStateRecord) -> DbResult<()>;
    async fn host_states(&self, deltaid: &str) -> DbResult<Vec<HostStateRecord>>;
    async fn host_state_history(&self, deltaid: &str) -> DbResult<Vec<HostStateRecord>>;

    // Facts

    async fn upsert_host(&self, host: &HostRecord) -> DbResult<()>;
    async fn get_host(&self, hostname: &str) -> DbResult<Option<HostRecord>>;
    async fn list_hosts(&self) -> DbResult<Vec<HostRecord>>;
    async fn upsert_switch(&self, switch: &SwitchRecord) -> DbResult<()>;
    async fn list_switches(&self, sitename: &str) -> DbResult<Vec<SwitchRecord>>;
    async fn upsert_service(&self, service: &ServiceRecord) -> DbResult<()>;
    async fn list_services(&self, hostname: Option<&str>) -> DbResult<Vec<ServiceRecord>>;

    // Service supervision

    async fn upsert_service_state(&self, state: &ServiceStateRecord) -> DbResult<()>;
    async fn list_service_states(&self) -> DbResult<Vec<ServiceStateRecord>>;
    async fn insert_service_action(&self, action: &ServiceAction) -> DbResult<()>;
    async fn service_actions(
        &self,
        hostname: Option<&str>,
        servicename: Option<&str>,
    ) -> DbResult<Vec<ServiceAction>>;
    async fn delete_service_actions(
        &self,
        hostname: &str,
        servicename: Option<&str>,
    ) -> DbResult<u64>;

    // Active deltas

    /// Current document; version 0 and an empty document when never written.
    async fn get_active_deltas(&self) -> DbResult<ActiveDeltasRecord>;
    /// Writes `doc` iff the stored version still equals `expected_version`.
    /// Returns the new version, or `Conflict` on a version mismatch.
    async fn compare_and_set_active_deltas(
        &self,
        expected_version: i64,
        doc: &ActiveDeltas,
        now: i64,
    ) -> DbResult<i64>;

    // Fine-grained states and operator overrides

    async fn insert_delta_time_state(&self, state: &DeltaTimeState) -> DbResult<()>;
    /// All reports, oldest first.
    async fn list_delta_time_states(&self) -> DbResult<Vec<DeltaTimeState>>;
    async fn delta_time_states(&self, uuid: &str) -> DbResult<Vec<DeltaTimeState>>;
    async fn delete_delta_time_states(&self, uuid: &str) -> DbResult<u64>;
    async fn insert_force_apply(&self, uuid: &str) -> DbResult<()>;
    /// Returns and deletes every pending force-apply request.
    async fn take_force_apply(&self) -> DbResult<Vec<String>>;
    async fn insert_instance_override(&self, entry: &InstanceStartEnd) -> DbResult<()>;
    /// Returns and deletes every pending lifetime override, oldest first.
    async fn take_instance_overrides(&self) -> DbResult<Vec<InstanceStartEnd>>;

    // Authentication

    async fn upsert_user(&self, user: &UserRecord) -> DbResult<()>;
    async fn get_user(&self, username: &str) -> DbResult<Option<UserRecord>>;
    async fn insert_refresh_token(&self, token: &RefreshTokenRecord) -> DbResult<()>;
    async fn get_refresh_token(&self, token_hash: &str) -> DbResult<Option<RefreshTokenRecord>>;
    /// Returns false when the token was unknown or already revoked.
    async fn revoke_refresh_token(&self, token_hash: &str) -> DbResult<bool>;
    async fn delete_expired_refresh_tokens(&self, now: i64) -> DbResult<u64>;
}
