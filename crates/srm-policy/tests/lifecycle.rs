//! Submission-to-removal lifecycle against the in-memory store.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use srm_common::FrontendConfig;
use srm_model::{Graph, ModelWriter, ParserContext};
use srm_policy::{DeltaSubmission, PolicyService};
use srm_store::{HostRecord, InstanceStartEnd, MemoryStore, Store};
use srm_test::{deltas, frontend_config, host_facts_value, NOW, SITE_NAME};
use srm_types::{ActiveDeltas, DeltaState, HostState, ModAdd};

struct Site {
    store: Arc<MemoryStore>,
    config: Arc<FrontendConfig>,
    policy: PolicyService,
}

impl Site {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_host(&HostRecord {
                ip: "192.168.0.10".to_string(),
                hostname: "dtn01".to_string(),
                insertdate: NOW,
                updatedate: NOW,
                hostinfo: host_facts_value(),
            })
            .await
            .unwrap();
        let config = Arc::new(frontend_config());
        let policy = PolicyService::new(store.clone(), config.clone(), SITE_NAME);
        Self {
            store,
            config,
            policy,
        }
    }

    async fn active(&self) -> ActiveDeltas {
        self.store.get_active_deltas().await.unwrap().output
    }

    /// The published model: topology plus the active document.
    async fn model(&self, now: i64) -> Graph {
        let ctx = ParserContext::from_config(&self.config, SITE_NAME, now).unwrap();
        let mut writer = ModelWriter::new(ctx);
        writer.add_site();
        writer.add_node("sw1");
        writer.add_node("dtn01");
        writer.add_switching_service("sw1");
        writer.add_routing_service("sw1");
        writer.add_active_deltas(&self.active().await);
        writer.into_graph()
    }

    async fn submit(&self, submission: &DeltaSubmission, now: i64) -> srm_common::SrmResult<()> {
        let graph = self.model(now).await;
        self.policy.accept_delta(submission, &graph, now).await.map(|_| ())
    }

    async fn cycle(&self, now: i64) -> bool {
        let graph = self.model(now).await;
        self.policy
            .start_work_lookup(&graph, now)
            .await
            .unwrap()
            .changes_applied
    }

    async fn state(&self, uid: &str) -> (DeltaState, ModAdd) {
        let delta = self.store.get_delta(uid).await.unwrap().unwrap();
        (delta.state, delta.modadd)
    }
}

fn addition(id: &str, conn: &str, vlan: u16, start: i64, end: i64) -> DeltaSubmission {
    DeltaSubmission {
        id: id.to_string(),
        model_id: "model-1".to_string(),
        addition: Some(deltas::vsw_addition(conn, vlan, Some("10.1.1.2/24"), start, end)),
        reduction: None,
    }
}

/// Accepts, commits and activates `d1` carrying `conn+1`.
async fn activated_site() -> Site {
    let site = Site::new().await;
    site.submit(&addition("d1", "conn+1", 3001, NOW, NOW + 3600), NOW)
        .await
        .unwrap();
    assert_eq!(site.state("d1").await, (DeltaState::Accepted, ModAdd::Idle));
    site.policy.commit("d1", false, NOW).await.unwrap();

    assert!(!site.cycle(NOW + 1).await);
    assert_eq!(site.state("d1").await, (DeltaState::Activating, ModAdd::Add));
    assert!(site.cycle(NOW + 2).await);
    assert_eq!(site.state("d1").await, (DeltaState::Activating, ModAdd::Added));
    site.cycle(NOW + 40).await;
    assert_eq!(site.state("d1").await, (DeltaState::Activated, ModAdd::Added));
    site
}

#[tokio::test]
async fn addition_reaches_the_active_document() {
    let site = activated_site().await;
    let conn = deltas::connection_uri("conn+1");
    let active = site.active().await;
    let path = &active.vsw[&conn];
    assert_eq!(path.hosts["dtn01"]["eth0"].vlan().map(|v| v.as_u16()), Some(3001));
    assert!(path.hosts["sw1"].contains_key("Ethernet0"));
    assert!(active.subnet_mapping["dtn01"].provides_subnet.contains(&conn));

    let hosts: Vec<_> = site
        .store
        .host_states("d1")
        .await
        .unwrap()
        .into_iter()
        .map(|h| (h.hostname, h.state))
        .collect();
    assert_eq!(
        hosts,
        vec![
            ("dtn01".to_string(), HostState::Activated),
            ("sw1".to_string(), HostState::Activated)
        ]
    );

    // Reparsing an unchanged model does not rewrite the document.
    let version = site.store.get_active_deltas().await.unwrap().version;
    assert!(!site.cycle(NOW + 50).await);
    assert_eq!(site.store.get_active_deltas().await.unwrap().version, version);
}

#[tokio::test]
async fn overlapping_request_is_rejected() {
    let site = activated_site().await;
    let err = site
        .submit(&addition("d2", "conn+2", 3001, NOW + 1800, NOW + 7200), NOW + 60)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ("OverlapException", -7));
    let failed = site.store.get_delta("d2").await.unwrap().unwrap();
    assert_eq!(failed.state, DeltaState::Failed);
    assert!(failed.error.is_some());

    // Same vlan after the first window closes is fine.
    site.submit(&addition("d3", "conn+3", 3001, NOW + 3600, NOW + 7200), NOW + 60)
        .await
        .unwrap();
}

#[tokio::test]
async fn inverted_lifetime_is_rejected() {
    let site = Site::new().await;
    let err = site
        .submit(&addition("bad", "conn+bad", 3001, NOW + 3600, NOW), NOW)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ("BadRequestError", -9));
    assert_eq!(site.state("bad").await.0, DeltaState::Failed);
    assert!(site.active().await.is_empty());
}

#[tokio::test]
async fn duplicate_id_is_a_conflict() {
    let site = Site::new().await;
    let submission = addition("d1", "conn+1", 3001, NOW, NOW + 3600);
    site.submit(&submission, NOW).await.unwrap();
    let err = site.submit(&submission, NOW).await.unwrap_err();
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn address_outside_the_pool_is_rejected() {
    let site = Site::new().await;
    let mut submission = addition("d1", "conn+1", 3001, NOW, NOW + 3600);
    submission.addition = Some(deltas::vsw_addition(
        "conn+1",
        3001,
        Some("172.16.0.1/24"),
        NOW,
        NOW + 3600,
    ));
    let err = site.submit(&submission, NOW).await.unwrap_err();
    assert_eq!(err.code().1, -8);
}

#[tokio::test]
async fn reduction_removes_the_connection() {
    let site = activated_site().await;
    let conn = deltas::connection_uri("conn+1");
    site.submit(
        &DeltaSubmission {
            id: "r1".to_string(),
            model_id: "model-2".to_string(),
            addition: None,
            reduction: Some(deltas::vsw_reduction("conn+1")),
        },
        NOW + 100,
    )
    .await
    .unwrap();
    site.policy.commit("r1", false, NOW + 100).await.unwrap();

    site.cycle(NOW + 101).await;
    assert!(site.active().await.vsw.contains_key(&conn));
    assert!(site.cycle(NOW + 102).await);
    assert!(!site.active().await.vsw.contains_key(&conn));
    assert_eq!(site.state("d1").await, (DeltaState::Remove, ModAdd::Removed));

    site.cycle(NOW + 140).await;
    assert_eq!(site.state("r1").await.0, DeltaState::Activated);
}

#[tokio::test]
async fn lifetime_override_and_expiry() {
    let site = activated_site().await;
    let conn = deltas::connection_uri("conn+1");
    site.store
        .insert_instance_override(&InstanceStartEnd {
            id: 0,
            instanceid: conn.clone(),
            insertdate: NOW + 41,
            starttimestamp: NOW,
            endtimestamp: NOW + 100,
        })
        .await
        .unwrap();
    assert!(site.cycle(NOW + 45).await);
    let window = site.active().await.vsw[&conn].window();
    assert_eq!((window.start, window.end), (NOW, NOW + 100));

    site.cycle(NOW + 99).await;
    assert!(site.active().await.vsw.contains_key(&conn));
    assert!(site.cycle(NOW + 100).await);
    assert!(site.active().await.is_empty());
    assert_eq!(site.state("d1").await, (DeltaState::Remove, ModAdd::Removed));
}
