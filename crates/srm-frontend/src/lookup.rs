//! The model publisher.
//!
//! Each cycle rebuilds the site graph from switch and host facts plus the
//! active document, lets the policy merge pending deltas into it and
//! publishes a new model whenever the N-Triples hash changes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use srm_common::{
    now_epoch, ConfigCache, CycleOutcome, FrontendConfig, SrmError, SrmResult, Worker,
};
use srm_model::{
    Graph, ModelFormat, ModelWriter, ParserContext, PortDescription, Prefixes, SerializedModel,
};
use srm_policy::PolicyService;
use srm_store::{ModelRecord, Store};
use srm_switch::vlan_key;
use srm_types::{ActiveDeltas, HostFacts, IpFamily, SwitchFacts, VlanId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::provisioning::ProvisioningDispatcher;

pub const SERVICE_NAME: &str = "LookUpService";

/// Files whose presence disables the container probes; a present file is
/// reported as a disabled check.
const PROBE_DISABLE_FILES: [(&str, &str); 2] = [
    ("Liveness", "siterm-liveness-disable"),
    ("Readiness", "siterm-readiness-disable"),
];

/// Facts of one site, as read from the store.
#[derive(Debug, Default)]
pub struct SiteFacts {
    pub switches: BTreeMap<String, SwitchFacts>,
    pub hosts: BTreeMap<String, HostFacts>,
    pub warnings: Vec<String>,
}

/// Reads switch and host facts, leaving out rows older than `host_timeout`
/// seconds (zero keeps everything).
pub async fn load_site_facts(
    store: &dyn Store,
    site: &str,
    host_timeout: u64,
    now: i64,
) -> SrmResult<SiteFacts> {
    let cutoff = (host_timeout > 0).then(|| now - host_timeout as i64);
    let mut facts = SiteFacts::default();
    for row in store.list_switches(site).await? {
        if let Some(err) = row.error.as_deref().filter(|e| !e.is_empty()) {
            facts
                .warnings
                .push(format!("Switch {} reported errors: {}", row.device, err));
        }
        if cutoff.is_some_and(|c| row.updatedate < c) {
            facts.warnings.push(format!(
                "Facts of switch {} not updated since {}",
                row.device, row.updatedate
            ));
            continue;
        }
        match serde_json::from_value::<SwitchFacts>(row.output) {
            Ok(parsed) => {
                facts.switches.insert(row.device, parsed);
            }
            Err(e) => warn!(device = %row.device, error = %e, "Ignoring undecodable switch facts"),
        }
    }
    for row in store.list_hosts().await? {
        if cutoff.is_some_and(|c| row.updatedate < c) {
            facts.warnings.push(format!(
                "Host {} did not report since {}, left out of the model",
                row.hostname, row.updatedate
            ));
            continue;
        }
        match serde_json::from_value::<HostFacts>(row.hostinfo) {
            Ok(parsed) => {
                facts.hosts.insert(row.hostname, parsed);
            }
            Err(e) => warn!(host = %row.hostname, error = %e, "Ignoring undecodable host facts"),
        }
    }
    Ok(facts)
}

/// Builds the site graph. Returns the graph and the manual-drift warnings.
pub fn build_graph(
    config: &FrontendConfig,
    site: &str,
    facts: &SiteFacts,
    active: &ActiveDeltas,
    now: i64,
) -> SrmResult<(Graph, Vec<String>)> {
    let site_config = config.site(site)?;
    let mut ctx = ParserContext::from_config(config, site, now)?;
    for (host, host_facts) in &facts.hosts {
        ctx.add_host_facts(host, host_facts);
    }
    let mut writer = ModelWriter::new(ctx);
    let mut warnings = Vec::new();
    writer.add_site();

    for switch in &site_config.switch {
        let switch_config = config.switch(switch)?;
        writer.add_node(switch);
        writer.add_switching_service(switch);
        writer.add_routing_service(switch);

        let switch_facts = facts.switches.get(switch);
        let mut names: Vec<&String> = switch_config.ports.keys().collect();
        if let Some(sf) = switch_facts {
            names.extend(sf.ports.keys().filter(|p| vlan_key(p).is_none()));
        }
        names.sort();
        names.dedup();

        let mut port_uris = BTreeMap::new();
        for name in names {
            let port_config = switch_config.ports.get(name);
            let capacity = switch_facts
                .and_then(|sf| sf.ports.get(name))
                .and_then(|p| p.bandwidth)
                .or_else(|| port_config.and_then(|p| p.capacity));
            let description = PortDescription {
                name: name.clone(),
                vlan_range: Some(switch_config.port_vlan_range(name).clone()),
                capacity,
                addresses: Vec::new(),
                is_alias: port_config.and_then(|p| p.is_alias.clone()),
            };
            port_uris.insert(name.clone(), writer.add_port(switch, &description));
        }

        let Some(sf) = switch_facts else {
            continue;
        };
        let used = active.used_vlans.get(switch);
        for (name, vlan) in &sf.vlans {
            let Some(vlan_id) = vlan_key(name).and_then(|v| VlanId::new(v).ok()) else {
                continue;
            };
            if used.is_some_and(|u| u.contains(&vlan_id)) {
                continue;
            }
            warnings.push(format!(
                "Vlan {} on {} is not part of any delta and was configured manually",
                vlan_id.as_u16(),
                switch
            ));
            for member in &vlan.tagged {
                if let Some(uri) = port_uris.get(member) {
                    writer.add_vlan_port(uri, vlan_id);
                }
            }
        }
    }

    for (host, host_facts) in &facts.hosts {
        writer.add_node(host);
        for (name, iface) in &host_facts.net_info.interfaces {
            let capacity = match iface.bw_params.max_reservable_capacity {
                0 => iface.speed,
                max => Some(max),
            };
            let addresses = IpFamily::ALL
                .into_iter()
                .flat_map(|f| iface.addresses(f).iter().map(move |a| (f, a.clone())))
                .collect();
            writer.add_port(
                host,
                &PortDescription {
                    name: name.clone(),
                    vlan_range: Some(iface.vlan_range_list.clone()),
                    capacity,
                    addresses,
                    is_alias: iface.is_alias.clone(),
                },
            );
        }
    }

    writer.add_active_deltas(active);
    Ok((writer.into_graph(), warnings))
}

/// Where the serializations of a model live: `<dir>/<uid>.{ttl,nt,jsonld}`.
pub fn model_files(dir: &Path, uid: &str) -> [(ModelFormat, PathBuf); 3] {
    [
        (ModelFormat::Turtle, dir.join(format!("{}.ttl", uid))),
        (ModelFormat::NTriples, dir.join(format!("{}.nt", uid))),
        (ModelFormat::JsonLd, dir.join(format!("{}.jsonld", uid))),
    ]
}

/// Path of a stored model in the requested format.
pub fn model_path(record: &ModelRecord, format: ModelFormat) -> PathBuf {
    let ttl = PathBuf::from(&record.fileloc);
    match format {
        ModelFormat::Turtle => ttl,
        ModelFormat::NTriples => ttl.with_extension("nt"),
        ModelFormat::JsonLd => ttl.with_extension("jsonld"),
    }
}

fn write_model(dir: &Path, uid: &str, model: &SerializedModel) -> SrmResult<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| SrmError::io(dir.display().to_string(), e))?;
    let files = model_files(dir, uid);
    for (format, path) in &files {
        fs::write(path, model.get(*format))
            .map_err(|e| SrmError::io(path.display().to_string(), e))?;
    }
    Ok(files[0].1.clone())
}

fn remove_model_files(record: &ModelRecord) {
    for format in [ModelFormat::Turtle, ModelFormat::NTriples, ModelFormat::JsonLd] {
        let path = model_path(record, format);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove model file"),
        }
    }
}

/// Publishes the site model and keeps the switch workers running.
pub struct LookupService {
    store: Arc<dyn Store>,
    config: Arc<ConfigCache<FrontendConfig>>,
    site: String,
    policy: PolicyService,
    dispatcher: ProvisioningDispatcher,
    last_hash: Option<String>,
    first_run: bool,
}

impl LookupService {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<ConfigCache<FrontendConfig>>,
        site: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        let site = site.into();
        let current = config.get();
        let policy = PolicyService::new(Arc::clone(&store), Arc::clone(&current), site.clone());
        let dispatcher =
            ProvisioningDispatcher::new(Arc::clone(&store), current, site.clone(), shutdown);
        Self {
            store,
            config,
            site,
            policy,
            dispatcher,
            last_hash: None,
            first_run: true,
        }
    }

    pub fn dispatcher(&self) -> &ProvisioningDispatcher {
        &self.dispatcher
    }

    fn model_dir(config: &FrontendConfig) -> PathBuf {
        config.general.privatedir.join(SERVICE_NAME)
    }

    /// Hash of the latest published model, read back from its N-Triples file.
    async fn stored_hash(&self) -> SrmResult<Option<String>> {
        let Some(latest) = self.store.latest_model().await? else {
            return Ok(None);
        };
        let path = model_path(&latest, ModelFormat::NTriples);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(hex::encode(Sha256::digest(text.as_bytes())))),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Latest model file unreadable");
                Ok(None)
            }
        }
    }

    /// Stores `model` unless it matches the latest one and that one is still
    /// fresh. Returns true when a new model row was written.
    async fn publish(
        &mut self,
        config: &FrontendConfig,
        model: &SerializedModel,
        now: i64,
    ) -> SrmResult<bool> {
        if self.last_hash.is_none() {
            self.last_hash = self.stored_hash().await?;
        }
        let latest = self.store.latest_model().await?;
        let stale = latest
            .as_ref()
            .map_or(true, |m| now - m.insertdate >= config.services.force_rewrite as i64);
        if self.last_hash.as_deref() == Some(model.hash.as_str()) && !stale {
            debug!("Model unchanged");
            return Ok(false);
        }

        let uid = uuid::Uuid::new_v4().to_string();
        let fileloc = write_model(&Self::model_dir(config), &uid, model)?;
        self.store
            .insert_model(&ModelRecord {
                uid: uid.clone(),
                insertdate: now,
                fileloc: fileloc.display().to_string(),
            })
            .await?;
        let changed = self.last_hash.as_deref() != Some(model.hash.as_str());
        info!(model = %uid, hash = %model.hash, changed, "New model published");
        self.last_hash = Some(model.hash.clone());
        Ok(changed)
    }

    async fn collect_garbage(&self, config: &FrontendConfig, now: i64) -> SrmResult<()> {
        let cutoff = now - config.services.model_retention as i64;
        let removed = self.store.delete_models_before(cutoff).await?;
        if !removed.is_empty() {
            info!(count = removed.len(), "Removing expired models");
        }
        for record in &removed {
            remove_model_files(record);
        }
        Ok(())
    }

    fn probe_warnings(config: &FrontendConfig) -> Vec<String> {
        PROBE_DISABLE_FILES
            .iter()
            .filter(|(_, file)| config.general.probes.join(file).exists())
            .map(|(name, file)| {
                format!(
                    "{} check is disabled, {} is present",
                    name,
                    config.general.probes.join(file).display()
                )
            })
            .collect()
    }

    /// One publisher cycle at `now`.
    #[instrument(skip(self), fields(site = %self.site))]
    pub async fn cycle_at(&mut self, now: i64) -> SrmResult<CycleOutcome> {
        let config = self.config.get();
        let mut outcome = CycleOutcome::default();

        if self.first_run {
            outcome.warnings.extend(self.dispatcher.start_all().await);
            self.first_run = false;
        }
        outcome.warnings.extend(self.dispatcher.ensure_running().await);

        let active = self.store.get_active_deltas().await?.output;
        let facts =
            load_site_facts(self.store.as_ref(), &self.site, config.services.host_timeout, now)
                .await?;
        outcome.warnings.extend(facts.warnings.iter().cloned());

        let (mut graph, drift) = build_graph(&config, &self.site, &facts, &active, now)?;
        outcome.warnings.extend(drift);

        let policy = self.policy.start_work_lookup(&graph, now).await?;
        outcome.changes = policy.changes_applied;
        if policy.active != active {
            graph = build_graph(&config, &self.site, &facts, &policy.active, now)?.0;
        }

        let site_uri = config.site(&self.site)?.uri();
        let model = SerializedModel::new(&graph, &Prefixes::for_site(&site_uri));
        if self.publish(&config, &model, now).await? {
            outcome.changes = true;
            self.dispatcher.signal_all();
        }

        let forced = self.store.take_force_apply().await?;
        if !forced.is_empty() {
            info!(connections = ?forced, "Force apply requested");
            self.dispatcher
                .signal(&crate::provisioning::devices_of(&policy.active, &forced));
        }

        outcome.warnings.extend(Self::probe_warnings(&config));
        self.collect_garbage(&config, now).await?;
        Ok(outcome)
    }
}

#[async_trait]
impl Worker for LookupService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn run_once(&mut self) -> SrmResult<CycleOutcome> {
        self.cycle_at(now_epoch()).await
    }

    async fn reload(&mut self) -> SrmResult<()> {
        if self.config.reload()? {
            let config = self.config.get();
            self.policy = PolicyService::new(Arc::clone(&self.store), Arc::clone(&config), &self.site);
            self.dispatcher.update_config(config);
            info!("Configuration reloaded, switch workers will restart");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use srm_common::config::BackendKind;
    use srm_store::{HostRecord, MemoryStore, SwitchRecord};
    use srm_test::active_deltas::vsw;
    use srm_test::{frontend_config, host_facts, host_facts_value, NOW, SITE_NAME, SITE_URI};
    use srm_types::VlanData;

    fn facts_with_manual_vlan() -> SiteFacts {
        let mut switch = SwitchFacts::default();
        switch.ports.insert("Ethernet0".to_string(), Default::default());
        switch.vlans.insert(
            "Vlan3050".to_string(),
            VlanData {
                tagged: vec!["Ethernet0".to_string()],
                ..Default::default()
            },
        );
        SiteFacts {
            switches: BTreeMap::from([("sw1".to_string(), switch)]),
            hosts: BTreeMap::from([("dtn01".to_string(), host_facts())]),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_manual_vlan_reported_and_published() {
        let config = frontend_config();
        let (graph, warnings) = build_graph(
            &config,
            SITE_NAME,
            &facts_with_manual_vlan(),
            &ActiveDeltas::default(),
            NOW,
        )
        .unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("3050"));
        let nt = ModelFormat::NTriples.serialize(&graph, &Prefixes::for_site(SITE_URI));
        assert!(nt.contains("Ethernet0:vlanport+3050"));
        assert!(nt.contains("dtn01"));
    }

    #[test]
    fn test_vlan_of_active_delta_is_not_drift() {
        let config = frontend_config();
        let doc = vsw("conn-1", "sw1", "Ethernet0", 3050, None, NOW - 10, NOW + 3600);
        let (_, warnings) =
            build_graph(&config, SITE_NAME, &facts_with_manual_vlan(), &doc, NOW).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_same_input_same_hash() {
        let config = frontend_config();
        let facts = facts_with_manual_vlan();
        let prefixes = Prefixes::for_site(&config.site(SITE_NAME).unwrap().uri());
        let hash = |doc: &ActiveDeltas| {
            let (graph, _) = build_graph(&config, SITE_NAME, &facts, doc, NOW).unwrap();
            SerializedModel::new(&graph, &prefixes).hash
        };
        let empty = ActiveDeltas::default();
        let doc = vsw("conn-1", "sw1", "Ethernet0", 3001, None, NOW - 10, NOW + 3600);
        assert_eq!(hash(&empty), hash(&empty));
        assert_ne!(hash(&empty), hash(&doc));
    }

    #[tokio::test]
    async fn test_stale_rows_left_out() {
        let store = MemoryStore::new();
        store
            .upsert_host(&HostRecord {
                ip: "10.0.0.1".to_string(),
                hostname: "dtn01".to_string(),
                insertdate: NOW - 1000,
                updatedate: NOW - 1000,
                hostinfo: host_facts_value(),
            })
            .await
            .unwrap();
        store
            .upsert_switch(&SwitchRecord {
                sitename: SITE_NAME.to_string(),
                device: "sw1".to_string(),
                insertdate: NOW,
                updatedate: NOW,
                output: serde_json::to_value(SwitchFacts::default()).unwrap(),
                error: Some("ssh timeout".to_string()),
            })
            .await
            .unwrap();

        let facts = load_site_facts(&store, SITE_NAME, 600, NOW).await.unwrap();
        assert!(facts.hosts.is_empty());
        assert!(facts.switches.contains_key("sw1"));
        assert_eq!(facts.warnings.len(), 2);

        let facts = load_site_facts(&store, SITE_NAME, 0, NOW).await.unwrap();
        assert!(facts.hosts.contains_key("dtn01"));
    }

    fn service(dir: &tempfile::TempDir) -> (LookupService, Arc<MemoryStore>, CancellationToken) {
        let mut config = frontend_config();
        config.general.privatedir = dir.path().to_path_buf();
        config.general.probes = dir.path().join("probes");
        config.services.worker_start_grace = 0;
        config.switches.get_mut("sw1").unwrap().backend = BackendKind::Raw;
        let cache = Arc::new(ConfigCache::from_value(dir.path().join("main.yaml"), config));
        let store = Arc::new(MemoryStore::new());
        let shutdown = CancellationToken::new();
        let lookup = LookupService::new(store.clone(), cache, SITE_NAME, shutdown.clone());
        (lookup, store, shutdown)
    }

    #[tokio::test]
    async fn test_cycle_publishes_once_per_change() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lookup, store, shutdown) = service(&dir);
        let now = now_epoch();

        let outcome = lookup.cycle_at(now).await.unwrap();
        assert!(outcome.changes);
        let models = store.list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        for (_, path) in model_files(&dir.path().join(SERVICE_NAME), &models[0].uid) {
            assert!(path.exists(), "{} missing", path.display());
        }
        assert_eq!(lookup.dispatcher().running_devices(), vec!["sw1".to_string()]);

        lookup.cycle_at(now + 1).await.unwrap();
        assert_eq!(store.list_models().await.unwrap().len(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_force_rewrite_and_garbage_collection() {
        let dir = tempfile::tempdir().unwrap();
        let (mut lookup, store, shutdown) = service(&dir);
        let now = now_epoch();
        let config = lookup.config.get();
        let rewrite = config.services.force_rewrite as i64;
        let retention = config.services.model_retention as i64;

        lookup.cycle_at(now).await.unwrap();
        let first = store.latest_model().await.unwrap().unwrap();

        lookup.cycle_at(now + rewrite).await.unwrap();
        assert_eq!(store.list_models().await.unwrap().len(), 2);

        lookup.cycle_at(now + retention + rewrite + 1).await.unwrap();
        let remaining = store.list_models().await.unwrap();
        assert!(remaining.iter().all(|m| m.uid != first.uid));
        assert!(!model_path(&first, ModelFormat::Turtle).exists());
        shutdown.cancel();
    }

    #[test]
    fn test_probe_disable_files_warned() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = frontend_config();
        config.general.probes = dir.path().to_path_buf();
        assert!(LookupService::probe_warnings(&config).is_empty());
        fs::write(dir.path().join("siterm-readiness-disable"), "").unwrap();
        let warnings = LookupService::probe_warnings(&config);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("Readiness"));
    }
}
