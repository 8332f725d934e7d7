//! The policy service: validation of submitted deltas and the per-cycle
//! merge of committed deltas into the active document.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use srm_common::{FrontendConfig, SrmError, SrmResult};
use srm_model::{apply_delta, DeltaContent, Graph, ModelParser, ParserContext};
use srm_store::{DbError, Store};
use srm_types::{
    ActiveDeltas, Delta, DeltaState, ExistsDuring, HostFacts, ModAdd, SwitchedKind,
};
use tracing::{debug, info, instrument, warn};

use crate::conflict::{check_active_config, ConflictChecker};
use crate::state_machine::{StateMachine, Timers};

/// A delta as posted by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSubmission {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "modelId", default)]
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduction: Option<String>,
}

impl DeltaSubmission {
    /// Checks the mandatory fields and decodes the content.
    pub fn validate(&self) -> SrmResult<DeltaContent> {
        if self.id.trim().is_empty() {
            return Err(SrmError::bad_request("Delta id is missing"));
        }
        if self.model_id.trim().is_empty() {
            return Err(SrmError::bad_request("Delta modelId is missing"));
        }
        if self.addition.is_none() && self.reduction.is_none() {
            return Err(SrmError::bad_request(
                "Delta must carry an addition or a reduction",
            ));
        }
        Ok(DeltaContent::decode(
            self.addition.as_deref(),
            self.reduction.as_deref(),
        )?)
    }
}

/// Result of one policy cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutcome {
    /// True when the active document changed; the caller shortens its sleep.
    pub changes_applied: bool,
    pub active: ActiveDeltas,
}

/// Connection ids whose content differs between two documents, including
/// connections present in only one of them.
pub fn changed_connections(new: &ActiveDeltas, old: &ActiveDeltas) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for kind in SwitchedKind::ALL {
        let (n, o) = (new.switched(kind), old.switched(kind));
        for conn in n.keys().chain(o.keys()) {
            if n.get(conn) != o.get(conn) {
                changed.insert(conn.clone());
            }
        }
    }
    for conn in new.rst.keys().chain(old.rst.keys()) {
        if new.rst.get(conn) != old.rst.get(conn) {
            changed.insert(conn.clone());
        }
    }
    changed
}

/// Hosts carrying any of `connections` in either document.
pub fn touched_hosts(
    new: &ActiveDeltas,
    old: &ActiveDeltas,
    connections: &BTreeSet<String>,
) -> BTreeSet<String> {
    let mut hosts = BTreeSet::new();
    for doc in [new, old] {
        for kind in SwitchedKind::ALL {
            for (conn, path) in doc.switched(kind) {
                if connections.contains(conn) {
                    hosts.extend(path.hosts.keys().cloned());
                }
            }
        }
        for (conn, path) in &doc.rst {
            if connections.contains(conn) {
                hosts.extend(path.hosts.keys().cloned());
            }
        }
    }
    hosts
}

/// Validates and merges deltas for one site.
pub struct PolicyService {
    store: Arc<dyn Store>,
    config: Arc<FrontendConfig>,
    site: String,
    machine: StateMachine,
}

impl PolicyService {
    pub fn new(store: Arc<dyn Store>, config: Arc<FrontendConfig>, site: impl Into<String>) -> Self {
        let machine = StateMachine::new(store.clone(), Timers::from(&config.services));
        Self {
            store,
            config,
            site: site.into(),
            machine,
        }
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    /// Last facts of every host; rows that do not decode are skipped.
    async fn host_facts(&self) -> SrmResult<BTreeMap<String, HostFacts>> {
        let mut hosts = BTreeMap::new();
        for row in self.store.list_hosts().await? {
            match serde_json::from_value::<HostFacts>(row.hostinfo) {
                Ok(facts) => {
                    hosts.insert(row.hostname, facts);
                }
                Err(e) => warn!(host = %row.hostname, error = %e, "Ignoring undecodable host facts"),
            }
        }
        Ok(hosts)
    }

    fn parser(&self, hosts: &BTreeMap<String, HostFacts>, now: i64) -> SrmResult<ModelParser> {
        let mut ctx = ParserContext::from_config(&self.config, &self.site, now)?;
        for (host, facts) in hosts {
            ctx.add_host_facts(host, facts);
        }
        Ok(ModelParser::new(ctx))
    }

    fn checker(&self, hosts: BTreeMap<String, HostFacts>) -> SrmResult<ConflictChecker> {
        Ok(ConflictChecker::new(&self.config, &self.site)?.with_hosts(hosts))
    }

    /// Applies `content` to a copy of `graph` and validates the result
    /// against `baseline`. Returns the candidate graph and document.
    fn try_apply(
        parser: &ModelParser,
        checker: &ConflictChecker,
        graph: &Graph,
        baseline: &ActiveDeltas,
        content: &DeltaContent,
    ) -> SrmResult<(Graph, ActiveDeltas)> {
        let mut candidate = graph.clone();
        apply_delta(&mut candidate, content)?;
        let parsed = parser.parse(&candidate, Some(baseline))?;
        checker.check_conflicts(&parsed, baseline)?;
        Ok((candidate, parsed))
    }

    /// Validates a submission against the current model and records it as
    /// `accepted`, or as `failed` with the validation error.
    ///
    /// Validation errors are returned after the failed delta is recorded.
    #[instrument(skip(self, submission, graph), fields(delta = %submission.id))]
    pub async fn accept_delta(
        &self,
        submission: &DeltaSubmission,
        graph: &Graph,
        now: i64,
    ) -> SrmResult<Delta> {
        let content = submission.validate()?;
        if self.store.get_delta(&submission.id).await?.is_some() {
            return Err(SrmError::conflict(format!(
                "Delta {} already exists",
                submission.id
            )));
        }
        let mut delta = Delta {
            uid: submission.id.clone(),
            insertdate: now,
            updatedate: now,
            state: DeltaState::Accepting,
            deltat: content.delta_type(),
            content: content.to_json(),
            modelid: submission.model_id.clone(),
            modadd: ModAdd::Idle,
            error: None,
        };

        let current = self.store.get_active_deltas().await?.output;
        let hosts = self.host_facts().await?;
        let parser = self.parser(&hosts, now)?;
        let checker = self.checker(hosts)?;
        match Self::try_apply(&parser, &checker, graph, &current, &content) {
            Ok((_, candidate)) => {
                let connections = changed_connections(&candidate, &current);
                let hosts = touched_hosts(&candidate, &current, &connections);
                info!(
                    connections = %connections.iter().join(","),
                    hosts = %hosts.iter().join(","),
                    "Delta accepted"
                );
                self.machine.accepted(&delta, &connections, &hosts, now).await?;
                delta.state = DeltaState::Accepted;
                Ok(delta)
            }
            Err(err) => {
                info!(error = %err, "Delta rejected");
                self.machine.failed(&delta, &err, now).await?;
                Err(err)
            }
        }
    }

    /// Commits an accepted delta (or force-commits an earlier one).
    pub async fn commit(&self, uid: &str, force: bool, now: i64) -> SrmResult<()> {
        self.machine.commit(uid, force, now).await
    }

    /// One policy cycle over `graph`, the model the lookup service built
    /// from the current facts and active document.
    ///
    /// Pending deltas are applied oldest first, each to a copy of the graph
    /// validated against the running baseline; a failing delta is marked
    /// failed and the copy dropped. The result is reparsed, annotated with
    /// reported states, swept for expired entries, adjusted by operator
    /// lifetime overrides and written iff it differs from the stored
    /// document. State machine transitions run last.
    #[instrument(skip(self, graph))]
    pub async fn start_work_lookup(&self, graph: &Graph, now: i64) -> SrmResult<PolicyOutcome> {
        let record = self.store.get_active_deltas().await?;
        let current = record.output.clone();
        let hosts = self.host_facts().await?;
        let parser = self.parser(&hosts, now)?;
        let checker = self.checker(hosts)?;

        let mut pending = self.store.deltas_in_state(DeltaState::Activating).await?;
        pending.retain(|d| d.modadd == ModAdd::Add);
        pending.sort_by_key(|d| d.insertdate);
        pending.truncate(self.config.services.max_deltas_per_cycle);

        let mut baseline_graph = graph.clone();
        let mut baseline = current.clone();
        let mut changes_applied = false;
        for delta in &pending {
            let result = DeltaContent::from_json(&delta.content)
                .map_err(SrmError::from)
                .and_then(|content| {
                    Self::try_apply(&parser, &checker, &baseline_graph, &baseline, &content)
                });
            match result {
                Ok((candidate_graph, candidate)) => {
                    info!(delta = %delta.uid, "Delta merged into the model");
                    self.machine.model_applied(delta, now).await?;
                    baseline_graph = candidate_graph;
                    baseline = candidate;
                    changes_applied = true;
                }
                Err(err) => self.machine.model_failed(delta, &err, now).await?,
            }
        }

        let mut active = parser.parse(&baseline_graph, Some(&current))?;
        self.apply_timed_states(&mut active).await?;

        let (cleaned, expired) = check_active_config(&active, now);
        if !expired.is_empty() {
            active = cleaned;
            self.machine.connections_removed(&expired, now).await?;
        }
        let gone: Vec<String> = current
            .connection_ids()
            .difference(&active.connection_ids())
            .filter(|c| !expired.contains(*c))
            .cloned()
            .collect();
        if !gone.is_empty() {
            debug!(connections = %gone.iter().join(","), "Connections left the model");
            self.machine.connections_removed(&gone, now).await?;
        }

        self.apply_overrides(&mut active).await?;

        if active != current {
            match self
                .store
                .compare_and_set_active_deltas(record.version, &active, now)
                .await
            {
                Ok(version) => info!(version, "Active deltas updated"),
                Err(DbError::Conflict(message)) => {
                    warn!(%message, "Active deltas changed concurrently; retrying next cycle");
                    return Err(SrmError::conflict(message));
                }
                Err(e) => return Err(e.into()),
            }
            changes_applied = true;
        }

        self.machine.tick(now).await?;
        Ok(PolicyOutcome {
            changes_applied,
            active,
        })
    }

    /// Sets `_params.networkstatus` of every connection from its
    /// fine-grained reports.
    async fn apply_timed_states(&self, active: &mut ActiveDeltas) -> SrmResult<()> {
        for conn in active.connection_ids() {
            if self.store.delta_time_states(&conn).await?.is_empty() {
                continue;
            }
            let state = self.machine.timed_state(&conn).await?;
            if let Some(params) = active.params_mut(&conn) {
                params.networkstatus = Some(state.to_string());
            }
        }
        Ok(())
    }

    /// Applies pending operator overrides of instance lifetimes.
    async fn apply_overrides(&self, active: &mut ActiveDeltas) -> SrmResult<()> {
        for entry in self.store.take_instance_overrides().await? {
            let Some(params) = active.params_mut(&entry.instanceid) else {
                warn!(instance = %entry.instanceid, "Lifetime override for unknown instance");
                continue;
            };
            let uri = params
                .exists_during
                .as_ref()
                .and_then(|w| w.uri.clone())
                .unwrap_or_else(|| format!("{}:lifetime", entry.instanceid));
            info!(
                instance = %entry.instanceid,
                start = entry.starttimestamp,
                end = entry.endtimestamp,
                "Applying lifetime override"
            );
            params.exists_during = Some(ExistsDuring::new(
                Some(uri),
                entry.starttimestamp,
                entry.endtimestamp,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_validation() {
        let mut submission = DeltaSubmission {
            id: "d1".to_string(),
            model_id: "m1".to_string(),
            ..Default::default()
        };
        assert_eq!(submission.validate().unwrap_err().code().1, -9);
        submission.addition = Some("<urn:a> <urn:b> <urn:c> .".to_string());
        assert!(submission.validate().is_ok());
        submission.model_id.clear();
        assert!(submission.validate().is_err());
    }

    #[test]
    fn test_submission_json_names() {
        let submission: DeltaSubmission =
            serde_json::from_str(r#"{"id": "d1", "modelId": "m1", "reduction": "eA=="}"#).unwrap();
        assert_eq!(submission.model_id, "m1");
        assert!(submission.addition.is_none());
    }

    #[test]
    fn test_changed_connections() {
        let mut old = ActiveDeltas::default();
        old.vsw.insert("conn+a".to_string(), Default::default());
        old.vsw.insert("conn+b".to_string(), Default::default());
        let mut new = old.clone();
        new.vsw.remove("conn+b");
        new.rst.insert("conn+c".to_string(), Default::default());
        let changed: Vec<_> = changed_connections(&new, &old).into_iter().collect();
        assert_eq!(changed, vec!["conn+b".to_string(), "conn+c".to_string()]);
    }
}
