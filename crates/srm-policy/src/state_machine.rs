//! Delta lifecycle state machine.
//!
//! ```text
//! accepting ─accept─▶ accepted ─commit─▶ committing ─▶ committed ─▶ activating
//!                                                                     │
//!        failed ◀── modadd=failed ──┤  modadd∈{added,removed} + barrier
//!                                   ▼
//!                               activated ─modadd=removed─▶ remove ─delay─▶ removed ─▶ (deleted)
//! ```
//!
//! Every transition is recorded in the `states` history table, and mirrored
//! per host in `hoststates` for the hosts the delta touches. Ticking is
//! idempotent: a delta only moves when its guard holds.

use std::collections::BTreeSet;
use std::sync::Arc;

use srm_common::config::ServicesConfig;
use srm_common::{SrmError, SrmResult};
use srm_store::{
    connection_state, DeltaConnection, DeltaUpdate, HostStateRecord, StateRecord, Store,
};
use srm_types::{
    aggregate_timed_states, Delta, DeltaState, DeltaType, HostState, ModAdd, TimedState,
};
use tracing::{debug, info, instrument, warn};

/// Guards of the time-based transitions, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timers {
    /// Minimum age of an `activating` delta before it is promoted.
    pub activation_barrier: i64,
    /// Minimum age of a `remove` delta before it becomes `removed`.
    pub remove_delay: i64,
    /// Minimum age of a `removed` delta before its row is deleted.
    pub removed_retention: i64,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            activation_barrier: 30,
            remove_delay: 600,
            removed_retention: 600,
        }
    }
}

impl From<&ServicesConfig> for Timers {
    fn from(services: &ServicesConfig) -> Self {
        let secs = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        Self {
            activation_barrier: secs(services.activation_barrier),
            remove_delay: secs(services.remove_delay),
            removed_retention: secs(services.removed_retention),
        }
    }
}

/// Host view of a delta state; states without one leave the host rows as is.
fn host_state(state: DeltaState) -> Option<HostState> {
    match state {
        DeltaState::Accepted => Some(HostState::Active),
        DeltaState::Activating => Some(HostState::Activating),
        DeltaState::Activated => Some(HostState::Activated),
        DeltaState::Remove => Some(HostState::Remove),
        DeltaState::Removed => Some(HostState::Removed),
        DeltaState::Failed | DeltaState::ActivateError => Some(HostState::Failed),
        DeltaState::Accepting | DeltaState::Committing | DeltaState::Committed => None,
    }
}

/// Drives deltas through their lifecycle.
#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn Store>,
    timers: Timers,
}

impl StateMachine {
    pub fn new(store: Arc<dyn Store>, timers: Timers) -> Self {
        Self { store, timers }
    }

    pub fn timers(&self) -> Timers {
        self.timers
    }

    async fn change_state(&self, delta: &Delta, state: DeltaState, now: i64) -> SrmResult<()> {
        info!(delta = %delta.uid, from = %delta.state, to = %state, "Changing delta state");
        self.store
            .update_delta(&delta.uid, &DeltaUpdate::state(state, now))
            .await?;
        self.store
            .insert_state(&StateRecord {
                deltaid: delta.uid.clone(),
                state,
                insertdate: now,
            })
            .await?;
        if let Some(host) = host_state(state) {
            let hosts = self.store.host_states(&delta.uid).await?;
            self.record_hosts(&delta.uid, hosts.into_iter().map(|h| h.hostname), host, now)
                .await?;
        }
        Ok(())
    }

    async fn record_hosts<I>(&self, uid: &str, hosts: I, state: HostState, now: i64) -> SrmResult<()>
    where
        I: IntoIterator<Item = String>,
    {
        for hostname in hosts {
            debug!(delta = %uid, host = %hostname, state = %state, "Recording host state");
            self.store
                .upsert_host_state(&HostStateRecord {
                    deltaid: uid.to_string(),
                    hostname,
                    state,
                    insertdate: now,
                    updatedate: now,
                })
                .await?;
        }
        Ok(())
    }

    async fn change_modadd(&self, uid: &str, modadd: ModAdd, now: i64) -> SrmResult<()> {
        debug!(delta = %uid, modadd = %modadd, "Changing model state");
        self.store
            .update_delta(uid, &DeltaUpdate::modadd(modadd, now))
            .await?;
        Ok(())
    }

    async fn set_connections(&self, delta: &Delta, state: &str) -> SrmResult<()> {
        for conn in self.store.delta_connections(&delta.uid).await? {
            self.store
                .update_connection_state(&delta.uid, &conn.connectionid, state)
                .await?;
        }
        Ok(())
    }

    /// Records a freshly submitted delta as `accepting`, then moves it to
    /// `accepted` with one connection row per touched connection id and one
    /// `active` host row per touched host.
    #[instrument(skip(self, delta, connections, hosts), fields(delta = %delta.uid))]
    pub async fn accepted(
        &self,
        delta: &Delta,
        connections: &BTreeSet<String>,
        hosts: &BTreeSet<String>,
        now: i64,
    ) -> SrmResult<()> {
        let mut row = delta.clone();
        row.state = DeltaState::Accepting;
        row.modadd = ModAdd::Idle;
        self.store.insert_delta(&row).await?;
        self.store
            .insert_state(&StateRecord {
                deltaid: row.uid.clone(),
                state: DeltaState::Accepting,
                insertdate: now,
            })
            .await?;
        for conn in connections {
            self.store
                .insert_delta_connection(&DeltaConnection {
                    deltaid: row.uid.clone(),
                    connectionid: conn.clone(),
                    state: connection_state::ACCEPTED.to_string(),
                })
                .await?;
        }
        self.change_state(&row, DeltaState::Accepted, now).await?;
        self.record_hosts(&row.uid, hosts.iter().cloned(), HostState::Active, now)
            .await
    }

    /// Records a submission that failed validation.
    #[instrument(skip(self, delta), fields(delta = %delta.uid))]
    pub async fn failed(&self, delta: &Delta, error: &SrmError, now: i64) -> SrmResult<()> {
        let mut row = delta.clone();
        row.state = DeltaState::Failed;
        row.modadd = ModAdd::Idle;
        row.error = Some(error.to_string());
        self.store.insert_delta(&row).await?;
        self.store
            .insert_state(&StateRecord {
                deltaid: row.uid.clone(),
                state: DeltaState::Failed,
                insertdate: now,
            })
            .await?;
        Ok(())
    }

    /// Handles `PUT .../actions/commit|forcecommit`.
    ///
    /// `commit` needs an `accepted` delta; `forcecommit` also takes
    /// `accepting` and `failed` ones. A delta already committing is left as
    /// is.
    #[instrument(skip(self))]
    pub async fn commit(&self, uid: &str, force: bool, now: i64) -> SrmResult<()> {
        let delta = self
            .store
            .get_delta(uid)
            .await?
            .ok_or_else(|| SrmError::not_found("delta", uid))?;
        let allowed = match delta.state {
            DeltaState::Accepted => true,
            DeltaState::Accepting | DeltaState::Failed => force,
            DeltaState::Committing => return Ok(()),
            _ => false,
        };
        if !allowed {
            return Err(SrmError::wrong_transition(format!(
                "Delta {} is in state {}; cannot {}",
                uid,
                delta.state,
                if force { "forcecommit" } else { "commit" }
            )));
        }
        if delta.state == DeltaState::Failed {
            // A forced retry goes through the model again.
            self.change_modadd(uid, ModAdd::Idle, now).await?;
        }
        self.change_state(&delta, DeltaState::Committing, now).await
    }

    /// Marks a pending delta as merged into the model.
    pub async fn model_applied(&self, delta: &Delta, now: i64) -> SrmResult<()> {
        self.change_modadd(&delta.uid, ModAdd::Added, now).await
    }

    /// Marks a pending delta as rejected by validation.
    pub async fn model_failed(&self, delta: &Delta, error: &SrmError, now: i64) -> SrmResult<()> {
        warn!(delta = %delta.uid, error = %error, "Delta could not be applied");
        self.store
            .update_delta(
                &delta.uid,
                &DeltaUpdate {
                    state: Some(DeltaState::Failed),
                    modadd: Some(ModAdd::Failed),
                    error: Some(error.to_string()),
                    updatedate: now,
                },
            )
            .await?;
        self.store
            .insert_state(&StateRecord {
                deltaid: delta.uid.clone(),
                state: DeltaState::Failed,
                insertdate: now,
            })
            .await?;
        let hosts = self.store.host_states(&delta.uid).await?;
        self.record_hosts(&delta.uid, hosts.into_iter().map(|h| h.hostname), HostState::Failed, now)
            .await
    }

    /// Connections left the active document (expiry or reduction): every
    /// activated delta whose connections are all gone is scheduled for
    /// removal.
    #[instrument(skip(self, connections))]
    pub async fn connections_removed(&self, connections: &[String], now: i64) -> SrmResult<()> {
        let mut deltas = BTreeSet::new();
        for conn in connections {
            for row in self.store.connections_for(conn).await? {
                if row.state != connection_state::CANCELLED {
                    self.store
                        .update_connection_state(&row.deltaid, conn, connection_state::CANCELLED)
                        .await?;
                }
                deltas.insert(row.deltaid);
            }
        }
        for uid in deltas {
            self.schedule_removal_if_cancelled(&uid, now).await?;
        }
        Ok(())
    }

    async fn schedule_removal_if_cancelled(&self, uid: &str, now: i64) -> SrmResult<()> {
        let Some(delta) = self.store.get_delta(uid).await? else {
            return Ok(());
        };
        if delta.deltat == DeltaType::Reduction || delta.modadd == ModAdd::Removed {
            return Ok(());
        }
        let rows = self.store.delta_connections(uid).await?;
        if rows.iter().all(|c| c.state == connection_state::CANCELLED) {
            self.change_modadd(uid, ModAdd::Removed, now).await?;
        }
        Ok(())
    }

    /// Derived status of a connection or delta from its fine-grained reports.
    /// The newest report per (host, port) wins.
    pub async fn timed_state(&self, uuid: &str) -> SrmResult<TimedState> {
        let reports = self.store.delta_time_states(uuid).await?;
        let mut latest: std::collections::BTreeMap<(String, String), (i64, TimedState)> =
            std::collections::BTreeMap::new();
        for report in reports {
            let key = (report.hostname.clone(), report.hostport.clone());
            match latest.get(&key) {
                Some((at, _)) if *at > report.insertdate => {}
                _ => {
                    latest.insert(key, (report.insertdate, report.uuidstate));
                }
            }
        }
        Ok(aggregate_timed_states(latest.into_values().map(|(_, s)| s)))
    }

    async fn committing(&self, now: i64) -> SrmResult<()> {
        for delta in self.store.deltas_in_state(DeltaState::Committing).await? {
            self.change_state(&delta, DeltaState::Committed, now).await?;
            self.change_modadd(&delta.uid, ModAdd::Add, now).await?;
            self.set_connections(&delta, connection_state::COMMITTED).await?;
        }
        Ok(())
    }

    async fn committed(&self, now: i64) -> SrmResult<()> {
        for delta in self.store.deltas_in_state(DeltaState::Committed).await? {
            self.change_state(&delta, DeltaState::Activating, now).await?;
        }
        Ok(())
    }

    async fn activating(&self, now: i64) -> SrmResult<()> {
        let barrier = now - self.timers.activation_barrier;
        for delta in self.store.deltas_in_state(DeltaState::Activating).await? {
            match delta.modadd {
                ModAdd::Failed => self.change_state(&delta, DeltaState::Failed, now).await?,
                ModAdd::Added | ModAdd::Removed if delta.updatedate < barrier => {
                    self.change_state(&delta, DeltaState::Activated, now).await?;
                    self.activated_connections(&delta, now).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Additions mark their connections activated; reductions cancel the
    /// activated connections of earlier deltas.
    async fn activated_connections(&self, delta: &Delta, now: i64) -> SrmResult<()> {
        if delta.deltat != DeltaType::Reduction {
            return self.set_connections(delta, connection_state::ACTIVATED).await;
        }
        let mut cancelled = Vec::new();
        for conn in self.store.delta_connections(&delta.uid).await? {
            for row in self.store.connections_for(&conn.connectionid).await? {
                if row.deltaid != delta.uid && row.state == connection_state::ACTIVATED {
                    self.store
                        .update_connection_state(
                            &row.deltaid,
                            &row.connectionid,
                            connection_state::CANCELLED,
                        )
                        .await?;
                    cancelled.push(row.deltaid);
                }
            }
        }
        for uid in cancelled {
            self.schedule_removal_if_cancelled(&uid, now).await?;
        }
        Ok(())
    }

    async fn activated(&self, now: i64) -> SrmResult<()> {
        for delta in self.store.deltas_in_state(DeltaState::Activated).await? {
            if delta.modadd == ModAdd::Removed {
                self.change_state(&delta, DeltaState::Remove, now).await?;
            }
        }
        Ok(())
    }

    async fn remove(&self, now: i64) -> SrmResult<()> {
        let cutoff = now - self.timers.remove_delay;
        for delta in self.store.deltas_in_state(DeltaState::Remove).await? {
            if delta.updatedate >= cutoff {
                continue;
            }
            self.change_state(&delta, DeltaState::Removed, now).await?;
            let modadd = match delta.modadd {
                ModAdd::Add | ModAdd::Added => ModAdd::Remove,
                _ => ModAdd::Removed,
            };
            self.change_modadd(&delta.uid, modadd, now).await?;
        }
        Ok(())
    }

    async fn removed(&self, now: i64) -> SrmResult<()> {
        let cutoff = now - self.timers.removed_retention;
        for delta in self.store.deltas_in_state(DeltaState::Removed).await? {
            if delta.updatedate <= cutoff {
                info!(delta = %delta.uid, "Deleting removed delta");
                self.store.delete_delta(&delta.uid).await?;
            }
        }
        Ok(())
    }

    /// Runs every time-driven transition once, in lifecycle order.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: i64) -> SrmResult<()> {
        self.committing(now).await?;
        self.committed(now).await?;
        self.activating(now).await?;
        self.activated(now).await?;
        self.remove(now).await?;
        self.removed(now).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use srm_store::{DeltaTimeState, MemoryStore};

    const NOW: i64 = 1_700_000_000;

    fn delta(uid: &str, deltat: DeltaType) -> Delta {
        Delta {
            uid: uid.to_string(),
            insertdate: NOW,
            updatedate: NOW,
            state: DeltaState::Accepting,
            deltat,
            content: "{}".to_string(),
            modelid: "model-1".to_string(),
            modadd: ModAdd::Idle,
            error: None,
        }
    }

    fn machine() -> (Arc<MemoryStore>, StateMachine) {
        let store = Arc::new(MemoryStore::new());
        let machine = StateMachine::new(store.clone(), Timers::default());
        (store, machine)
    }

    async fn state_of(store: &MemoryStore, uid: &str) -> (DeltaState, ModAdd) {
        let delta = store.get_delta(uid).await.unwrap().unwrap();
        (delta.state, delta.modadd)
    }

    fn names(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_accept_records_connections_and_history() {
        let (store, machine) = machine();
        machine
            .accepted(&delta("d1", DeltaType::Addition), &names(&["conn+a"]), &names(&["dtn01", "sw1"]), NOW)
            .await
            .unwrap();
        assert_eq!(state_of(&store, "d1").await.0, DeltaState::Accepted);
        let rows = store.delta_connections("d1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, connection_state::ACCEPTED);
        let history: Vec<_> = store
            .delta_states("d1")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.state)
            .collect();
        assert_eq!(history, vec![DeltaState::Accepting, DeltaState::Accepted]);
    }

    async fn host_view(store: &MemoryStore, uid: &str) -> Vec<(String, HostState)> {
        store
            .host_states(uid)
            .await
            .unwrap()
            .into_iter()
            .map(|h| (h.hostname, h.state))
            .collect()
    }

    #[tokio::test]
    async fn test_host_states_follow_transitions() {
        let (store, machine) = machine();
        machine
            .accepted(&delta("d1", DeltaType::Addition), &names(&["conn+a"]), &names(&["dtn01", "sw1"]), NOW)
            .await
            .unwrap();
        assert_eq!(
            host_view(&store, "d1").await,
            vec![("dtn01".to_string(), HostState::Active), ("sw1".to_string(), HostState::Active)]
        );

        machine.commit("d1", false, NOW).await.unwrap();
        machine.tick(NOW).await.unwrap();
        assert!(host_view(&store, "d1").await.iter().all(|(_, s)| *s == HostState::Activating));
        let pending = store.get_delta("d1").await.unwrap().unwrap();
        machine.model_applied(&pending, NOW).await.unwrap();
        machine.tick(NOW + 31).await.unwrap();
        assert!(host_view(&store, "d1").await.iter().all(|(_, s)| *s == HostState::Activated));

        // Committing and committed have no host view.
        let history: Vec<_> = store
            .host_state_history("d1")
            .await
            .unwrap()
            .into_iter()
            .filter(|h| h.hostname == "sw1")
            .map(|h| h.state)
            .collect();
        assert_eq!(history, vec![HostState::Active, HostState::Activating, HostState::Activated]);

        machine.connections_removed(&["conn+a".to_string()], NOW + 40).await.unwrap();
        machine.tick(NOW + 40).await.unwrap();
        assert!(host_view(&store, "d1").await.iter().all(|(_, s)| *s == HostState::Remove));
        machine.tick(NOW + 641).await.unwrap();
        assert!(host_view(&store, "d1").await.iter().all(|(_, s)| *s == HostState::Removed));
    }

    #[tokio::test]
    async fn test_failed_submission_has_no_host_rows() {
        let (store, machine) = machine();
        machine
            .failed(&delta("d1", DeltaType::Addition), &SrmError::overlap("taken"), NOW)
            .await
            .unwrap();
        assert!(host_view(&store, "d1").await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_requires_accepted() {
        let (store, machine) = machine();
        let err = SrmError::overlap("vlan 3001 in use");
        machine
            .failed(&delta("d1", DeltaType::Addition), &err, NOW)
            .await
            .unwrap();
        let err = machine.commit("d1", false, NOW).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
        machine.commit("d1", true, NOW).await.unwrap();
        assert_eq!(state_of(&store, "d1").await.0, DeltaState::Committing);
        assert_eq!(machine.commit("missing", false, NOW).await.unwrap_err().http_status(), 404);
    }

    #[tokio::test]
    async fn test_activation_waits_for_barrier() {
        let (store, machine) = machine();
        machine
            .accepted(&delta("d1", DeltaType::Addition), &names(&["conn+a"]), &names(&["dtn01", "sw1"]), NOW)
            .await
            .unwrap();
        machine.commit("d1", false, NOW).await.unwrap();

        machine.tick(NOW).await.unwrap();
        assert_eq!(state_of(&store, "d1").await, (DeltaState::Activating, ModAdd::Add));

        let pending = store.get_delta("d1").await.unwrap().unwrap();
        machine.model_applied(&pending, NOW + 5).await.unwrap();
        machine.tick(NOW + 30).await.unwrap();
        assert_eq!(state_of(&store, "d1").await.0, DeltaState::Activating);

        machine.tick(NOW + 36).await.unwrap();
        assert_eq!(state_of(&store, "d1").await.0, DeltaState::Activated);
        let rows = store.delta_connections("d1").await.unwrap();
        assert_eq!(rows[0].state, connection_state::ACTIVATED);

        // Ticking again changes nothing.
        let before = store.delta_states("d1").await.unwrap().len();
        machine.tick(NOW + 100).await.unwrap();
        assert_eq!(store.delta_states("d1").await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_failed_model_apply_fails_delta() {
        let (store, machine) = machine();
        machine
            .accepted(&delta("d1", DeltaType::Addition), &names(&["conn+a"]), &names(&["dtn01", "sw1"]), NOW)
            .await
            .unwrap();
        machine.commit("d1", false, NOW).await.unwrap();
        machine.tick(NOW).await.unwrap();
        let pending = store.get_delta("d1").await.unwrap().unwrap();
        machine
            .model_failed(&pending, &SrmError::overlap("taken"), NOW + 1)
            .await
            .unwrap();
        let delta = store.get_delta("d1").await.unwrap().unwrap();
        assert_eq!((delta.state, delta.modadd), (DeltaState::Failed, ModAdd::Failed));
        assert_eq!(delta.error.as_deref(), Some("taken"));
        assert_eq!(
            host_view(&store, "d1").await,
            vec![("dtn01".to_string(), HostState::Failed), ("sw1".to_string(), HostState::Failed)]
        );
    }

    async fn activate(store: &MemoryStore, machine: &StateMachine, uid: &str, deltat: DeltaType, at: i64) {
        machine
            .accepted(&delta(uid, deltat), &names(&["conn+a"]), &names(&["dtn01"]), at)
            .await
            .unwrap();
        machine.commit(uid, false, at).await.unwrap();
        machine.tick(at).await.unwrap();
        let pending = store.get_delta(uid).await.unwrap().unwrap();
        machine.model_applied(&pending, at).await.unwrap();
        machine.tick(at + 31).await.unwrap();
    }

    #[tokio::test]
    async fn test_reduction_removes_addition_after_delays() {
        let (store, machine) = machine();
        activate(&store, &machine, "add", DeltaType::Addition, NOW).await;
        assert_eq!(state_of(&store, "add").await.0, DeltaState::Activated);

        // Activated at NOW + 131; the same tick schedules the addition for removal.
        activate(&store, &machine, "red", DeltaType::Reduction, NOW + 100).await;
        assert_eq!(state_of(&store, "red").await.0, DeltaState::Activated);
        assert_eq!(state_of(&store, "add").await, (DeltaState::Remove, ModAdd::Removed));

        let removing = NOW + 131;
        machine.tick(removing + 600).await.unwrap();
        assert_eq!(state_of(&store, "add").await.0, DeltaState::Remove);
        machine.tick(removing + 601).await.unwrap();
        assert_eq!(state_of(&store, "add").await.0, DeltaState::Removed);

        let removed = removing + 601;
        machine.tick(removed + 599).await.unwrap();
        assert!(store.get_delta("add").await.unwrap().is_some());
        machine.tick(removed + 600).await.unwrap();
        assert!(store.get_delta("add").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expiry_schedules_removal() {
        let (store, machine) = machine();
        activate(&store, &machine, "add", DeltaType::Addition, NOW).await;
        machine
            .connections_removed(&["conn+a".to_string()], NOW + 3600)
            .await
            .unwrap();
        machine.tick(NOW + 3600).await.unwrap();
        assert_eq!(state_of(&store, "add").await.0, DeltaState::Remove);
    }

    #[tokio::test]
    async fn test_timed_state_uses_latest_report_per_port() {
        let (store, machine) = machine();
        let report = |port: &str, state, at| DeltaTimeState {
            id: 0,
            insertdate: at,
            uuid: "conn+a".to_string(),
            uuidtype: "vsw".to_string(),
            hostname: "dtn01".to_string(),
            hostport: port.to_string(),
            uuidstate: state,
        };
        store
            .insert_delta_time_state(&report("eth0", TimedState::ActivateError, NOW))
            .await
            .unwrap();
        store
            .insert_delta_time_state(&report("eth0", TimedState::Activated, NOW + 10))
            .await
            .unwrap();
        store
            .insert_delta_time_state(&report("eth1", TimedState::Activated, NOW + 5))
            .await
            .unwrap();
        assert_eq!(machine.timed_state("conn+a").await.unwrap(), TimedState::Activated);
        assert_eq!(machine.timed_state("conn+x").await.unwrap(), TimedState::Unknown);
    }
}
