//! Per-switch workers and the dispatcher that keeps them alive.
//!
//! Every configured device gets exactly one [`SwitchWorker`]. A worker
//! refreshes the device facts, renders the desired configuration from the
//! active document, diffs it against what it last applied and pushes the
//! difference through the device's backend.
//!
//! The [`ProvisioningDispatcher`] starts the workers, restarts the ones that
//! stopped and restarts all of them after a configuration change.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use itertools::Itertools;
use serde_yaml::Mapping;
use srm_common::{
    now_epoch, CycleOutcome, FrontendConfig, SrmError, SrmResult, Supervisor, SupervisorSettings,
    Worker,
};
use srm_store::{DeltaTimeState, Store, StoreHooks, SwitchRecord};
use srm_switch::{backend_for, SwitchBackend};
use srm_types::{ActiveDeltas, SwitchFacts, SwitchedKind, TimedState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::render::{mark_absent, render, strip_absent, RenderContext};

/// Directory below `privatedir` holding the applied configuration per device.
pub const PROVISIONING_DIR: &str = "ProvisioningService";

/// Path of the configuration last applied to `device`.
pub fn applied_config_path(privatedir: &Path, device: &str) -> PathBuf {
    privatedir
        .join(PROVISIONING_DIR)
        .join(format!("{}.yaml", device))
}

/// Reads the configuration last applied to a device; empty when none.
pub fn load_applied(path: &Path) -> SrmResult<Mapping> {
    match fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(Mapping::new()),
        Ok(text) => Ok(serde_yaml::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Mapping::new()),
        Err(e) => Err(SrmError::io(path.display().to_string(), e)),
    }
}

fn store_applied(path: &Path, doc: &Mapping) -> SrmResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SrmError::io(parent.display().to_string(), e))?;
    }
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, serde_yaml::to_string(doc)?)
        .map_err(|e| SrmError::io(tmp.display().to_string(), e))?;
    fs::rename(&tmp, path).map_err(|e| SrmError::io(path.display().to_string(), e))
}

/// Re-apply request shared between a worker and the dispatcher.
#[derive(Debug, Default)]
pub struct WorkerSignal {
    apply: AtomicBool,
}

impl WorkerSignal {
    pub fn request_apply(&self) {
        self.apply.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.apply.swap(false, Ordering::SeqCst)
    }
}

/// Devices a set of connections touches in the active document.
pub fn devices_of(active: &ActiveDeltas, connections: &[String]) -> BTreeSet<String> {
    let mut devices = BTreeSet::new();
    for conn in connections {
        for kind in SwitchedKind::ALL {
            if let Some(path) = active.switched(kind).get(conn) {
                devices.extend(path.hosts.keys().cloned());
            }
        }
        if let Some(path) = active.rst.get(conn) {
            devices.extend(path.hosts.keys().cloned());
        }
    }
    devices
}

/// Owns one switch: facts collection and configuration apply.
pub struct SwitchWorker {
    name: String,
    device: String,
    site: String,
    store: Arc<dyn Store>,
    config: Arc<FrontendConfig>,
    backend: Arc<dyn SwitchBackend>,
    signal: Arc<WorkerSignal>,
    first_run: bool,
    last_facts: Option<Instant>,
}

impl SwitchWorker {
    pub fn new(
        device: &str,
        site: &str,
        store: Arc<dyn Store>,
        config: Arc<FrontendConfig>,
        signal: Arc<WorkerSignal>,
    ) -> SrmResult<Self> {
        let backend = backend_for(&config, device, config.general.privatedir.clone())?;
        Ok(Self::with_backend(device, site, store, config, backend, signal))
    }

    pub fn with_backend(
        device: &str,
        site: &str,
        store: Arc<dyn Store>,
        config: Arc<FrontendConfig>,
        backend: Arc<dyn SwitchBackend>,
        signal: Arc<WorkerSignal>,
    ) -> Self {
        Self {
            name: format!("SwitchWorker-{}", device),
            device: device.to_string(),
            site: site.to_string(),
            store,
            config,
            backend,
            signal,
            first_run: true,
            last_facts: None,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    fn facts_due(&self) -> bool {
        self.last_facts
            .map_or(true, |t| t.elapsed() >= self.config.services.facts_refresh())
    }

    /// Collects facts from the device and stores them in the switch table.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn refresh_facts(&mut self, now: i64) -> SrmResult<()> {
        let report = self.backend.get_facts(&[self.device.clone()]).await?;
        let errors = report.errors.get(&self.device).map(|e| e.join("; "));
        let output = match report.facts.get(&self.device) {
            Some(facts) => serde_json::to_value(facts)?,
            None => {
                // Keep the previous facts, only record the error.
                self.stored_facts_value().await?.unwrap_or_default()
            }
        };
        if let Some(err) = &errors {
            warn!(error = %err, "Facts collection reported errors");
        }
        self.store
            .upsert_switch(&SwitchRecord {
                sitename: self.site.clone(),
                device: self.device.clone(),
                insertdate: now,
                updatedate: now,
                output,
                error: errors,
            })
            .await?;
        self.last_facts = Some(Instant::now());
        Ok(())
    }

    async fn stored_facts_value(&self) -> SrmResult<Option<serde_json::Value>> {
        Ok(self
            .store
            .list_switches(&self.site)
            .await?
            .into_iter()
            .find(|r| r.device == self.device)
            .map(|r| r.output))
    }

    async fn stored_facts(&self) -> SrmResult<Option<SwitchFacts>> {
        match self.stored_facts_value().await? {
            Some(value) => match serde_json::from_value(value) {
                Ok(facts) => Ok(Some(facts)),
                Err(e) => {
                    warn!(device = %self.device, error = %e, "Stored facts do not decode");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn record_states(
        &self,
        ports: &[crate::render::RenderedPort],
        state: TimedState,
        now: i64,
    ) -> SrmResult<()> {
        for port in ports {
            self.store
                .insert_delta_time_state(&DeltaTimeState {
                    id: 0,
                    insertdate: now,
                    uuid: port.uuid.clone(),
                    uuidtype: port.uuidtype.to_string(),
                    hostname: self.device.clone(),
                    hostport: port.hostport.clone(),
                    uuidstate: state,
                })
                .await?;
        }
        Ok(())
    }

    /// Renders, diffs and applies. Returns true when something was pushed.
    #[instrument(skip(self), fields(device = %self.device))]
    pub async fn apply(&mut self, now: i64) -> SrmResult<bool> {
        let forced = self.signal.take() || self.first_run;
        let active = self.store.get_active_deltas().await?.output;
        let facts = self.stored_facts().await?;
        let ctx = RenderContext::new(&self.config, &self.device, facts.as_ref(), now)?;
        let desired = render(&ctx, &active)?;

        let path = applied_config_path(&self.config.general.privatedir, &self.device);
        let running = load_applied(&path)?;
        let mut new = desired.to_mapping()?;
        mark_absent(&mut new, &running);

        if new == running && !forced && !desired.force_apply {
            debug!("Running configuration is up to date");
            return Ok(false);
        }
        info!(
            connections = %desired.ports.iter().map(|p| p.uuid.as_str()).dedup().join(","),
            forced,
            "Applying configuration"
        );
        let report = self
            .backend
            .apply_config(&BTreeMap::from([(self.device.clone(), new.clone())]))
            .await?;
        if report.is_ok(&self.device) {
            strip_absent(&mut new);
            store_applied(&path, &new)?;
            self.record_states(&desired.ports, TimedState::Activated, now)
                .await?;
            self.first_run = false;
            Ok(true)
        } else {
            self.record_states(&desired.ports, TimedState::ActivateError, now)
                .await?;
            let message = report
                .errors
                .get(&self.device)
                .map(|e| e.join("; "))
                .unwrap_or_else(|| "device missing from apply report".to_string());
            Err(SrmError::plugin(&self.device, message))
        }
    }
}

#[async_trait]
impl Worker for SwitchWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_once(&mut self) -> SrmResult<CycleOutcome> {
        let now = now_epoch();
        let mut outcome = CycleOutcome::default();
        if self.facts_due() {
            if let Err(e) = self.refresh_facts(now).await {
                if !e.is_retryable() {
                    return Err(e);
                }
                outcome
                    .warnings
                    .push(format!("Facts of {} not refreshed: {}", self.device, e));
            }
        }
        outcome.changes = self.apply(now).await?;
        Ok(outcome)
    }

    async fn reload(&mut self) -> SrmResult<()> {
        self.signal.request_apply();
        self.last_facts = None;
        Ok(())
    }
}

struct WorkerHandle {
    signal: Arc<WorkerSignal>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Cancels the worker and waits for its current cycle to finish, so a
    /// device never has two workers pushing configuration.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Switch worker task failed");
            }
        }
    }
}

/// Starts, watches and restarts the switch workers of one site.
pub struct ProvisioningDispatcher {
    store: Arc<dyn Store>,
    config: Arc<FrontendConfig>,
    site: String,
    workers: BTreeMap<String, WorkerHandle>,
    need_restart: bool,
    started: bool,
    shutdown: CancellationToken,

    /// Backend handed to every worker instead of the configured one
    #[cfg(test)]
    backend: Option<Arc<dyn SwitchBackend>>,
}

impl ProvisioningDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        config: Arc<FrontendConfig>,
        site: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            config,
            site: site.into(),
            workers: BTreeMap::new(),
            need_restart: false,
            started: false,
            shutdown,
            #[cfg(test)]
            backend: None,
        }
    }

    /// Uses `backend` for every device (for testing)
    #[cfg(test)]
    pub fn with_backend(mut self, backend: Arc<dyn SwitchBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    fn devices(&self) -> Vec<String> {
        self.config
            .sites
            .get(&self.site)
            .map(|s| s.switch.clone())
            .unwrap_or_default()
    }

    fn settings(&self) -> SupervisorSettings {
        let services = &self.config.services;
        SupervisorSettings {
            hostname: self.config.general.hostname.clone(),
            sleep_ok: services.sleep_ok(),
            sleep_failure: services.sleep_failure(),
            refresh_interval: services.refresh_check_interval(),
            sentinel_dir: self.config.general.privatedir.clone(),
            warning_threshold: services.warning_threshold,
        }
    }

    pub fn is_running(&self, device: &str) -> bool {
        self.workers
            .get(device)
            .is_some_and(|h| !h.task.is_finished())
    }

    pub fn running_devices(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(d, _)| d.clone())
            .collect()
    }

    /// Starts `worker` in the background. A worker already running for the
    /// device is stopped first.
    async fn spawn(&mut self, worker: SwitchWorker, signal: Arc<WorkerSignal>) {
        let device = worker.device().to_string();
        if let Some(old) = self.workers.remove(&device) {
            debug!(device = %device, "Waiting for the previous worker to stop");
            old.stop().await;
        }
        let cancel = self.shutdown.child_token();
        let supervisor = Supervisor::new(
            worker,
            StoreHooks::new(Arc::clone(&self.store)),
            self.settings(),
        );
        let token = cancel.clone();
        let task_device = device.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = supervisor.run(token).await {
                error!(device = %task_device, error = %e, "Switch worker stopped");
            }
        });
        self.workers.insert(
            device,
            WorkerHandle {
                signal,
                cancel,
                task,
            },
        );
    }

    fn new_worker(&self, device: &str) -> SrmResult<(SwitchWorker, Arc<WorkerSignal>)> {
        let signal = Arc::new(WorkerSignal::default());
        #[cfg(test)]
        if let Some(backend) = &self.backend {
            let worker = SwitchWorker::with_backend(
                device,
                &self.site,
                Arc::clone(&self.store),
                Arc::clone(&self.config),
                Arc::clone(backend),
                Arc::clone(&signal),
            );
            return Ok((worker, signal));
        }
        let worker = SwitchWorker::new(
            device,
            &self.site,
            Arc::clone(&self.store),
            Arc::clone(&self.config),
            Arc::clone(&signal),
        )?;
        Ok((worker, signal))
    }

    /// First start: every device gets one cycle in the foreground, then its
    /// worker runs in the background. Returns the devices that failed their
    /// first cycle.
    #[instrument(skip(self), fields(site = %self.site))]
    pub async fn start_all(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        for device in self.devices() {
            if self.is_running(&device) {
                continue;
            }
            let (mut worker, signal) = match self.new_worker(&device) {
                Ok(pair) => pair,
                Err(e) => {
                    warnings.push(format!("Cannot start worker for {}: {}", device, e));
                    continue;
                }
            };
            if let Err(e) = worker.run_once().await {
                warnings.push(format!("Initial apply on {} failed: {}", device, e));
            }
            info!(device = %device, "Switch worker started");
            self.spawn(worker, signal).await;
        }
        self.started = true;
        let grace = self.config.services.worker_grace();
        if !grace.is_zero() {
            info!(seconds = grace.as_secs(), "Waiting for switch workers to settle");
            tokio::time::sleep(grace).await;
        }
        warnings
    }

    /// Restarts stopped workers, and every worker when a restart was
    /// requested. Devices no longer configured are stopped.
    #[instrument(skip(self), fields(site = %self.site))]
    pub async fn ensure_running(&mut self) -> Vec<String> {
        if !self.started {
            return self.start_all().await;
        }
        let mut warnings = Vec::new();
        let devices = self.devices();
        let stale: Vec<String> = self
            .workers
            .keys()
            .filter(|d| !devices.contains(d))
            .cloned()
            .collect();
        for device in stale {
            if let Some(handle) = self.workers.remove(&device) {
                info!(device = %device, "Device no longer configured, stopping its worker");
                handle.stop().await;
            }
        }

        let restart_all = std::mem::take(&mut self.need_restart);
        for device in devices {
            let alive = self.is_running(&device);
            if alive && !restart_all {
                continue;
            }
            if !alive && self.workers.contains_key(&device) {
                warn!(device = %device, "Switch worker is not running, restarting");
                warnings.push(format!("Switch worker for {} was restarted", device));
            }
            match self.new_worker(&device) {
                Ok((worker, signal)) => self.spawn(worker, signal).await,
                Err(e) => warnings.push(format!("Cannot start worker for {}: {}", device, e)),
            }
        }
        warnings
    }

    /// Replaces the configuration; workers restart on the next check.
    pub fn update_config(&mut self, config: Arc<FrontendConfig>) {
        self.config = config;
        self.need_restart = true;
    }

    pub fn need_restart(&self) -> bool {
        self.need_restart
    }

    /// Asks every worker to push its configuration again.
    pub fn signal_all(&self) {
        for handle in self.workers.values() {
            handle.signal.request_apply();
        }
    }

    /// Asks the workers of `devices` to push their configuration again.
    pub fn signal(&self, devices: &BTreeSet<String>) {
        for (device, handle) in &self.workers {
            if devices.contains(device) {
                handle.signal.request_apply();
            }
        }
    }

    /// Stops every worker and waits for them.
    pub async fn stop_all(&mut self) {
        for (_, handle) in std::mem::take(&mut self.workers) {
            handle.stop().await;
        }
    }
}

impl Drop for ProvisioningDispatcher {
    fn drop(&mut self) {
        for handle in self.workers.values() {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use srm_common::config::BackendKind;
    use srm_store::MemoryStore;
    use srm_test::active_deltas::vsw;
    use srm_test::{frontend_config, SITE_NAME};

    fn raw_config(dir: &tempfile::TempDir) -> Arc<FrontendConfig> {
        let mut config = frontend_config();
        config.general.privatedir = dir.path().to_path_buf();
        config.services.worker_start_grace = 0;
        config.switches.get_mut("sw1").unwrap().backend = BackendKind::Raw;
        Arc::new(config)
    }

    async fn store_with(doc: &ActiveDeltas) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .compare_and_set_active_deltas(0, doc, 1)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_worker_applies_then_idles() {
        let dir = tempfile::tempdir().unwrap();
        let config = raw_config(&dir);
        let now = now_epoch();
        let doc = vsw("conn-1", "sw1", "Ethernet0", 3001, None, now - 10, now + 3600);
        let store = store_with(&doc).await;
        let mut worker = SwitchWorker::new(
            "sw1",
            SITE_NAME,
            store.clone(),
            config.clone(),
            Arc::new(WorkerSignal::default()),
        )
        .unwrap();

        assert!(worker.apply(now).await.unwrap());
        let applied = load_applied(&applied_config_path(dir.path(), "sw1")).unwrap();
        assert!(applied["interface"]
            .as_mapping()
            .unwrap()
            .contains_key("Vlan3001"));

        let states = store.delta_time_states("conn-1").await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].uuidstate, TimedState::Activated);
        assert_eq!(states[0].hostname, "sw1");

        // Nothing changed since the last apply.
        assert!(!worker.apply(now).await.unwrap());
    }

    #[tokio::test]
    async fn test_removed_connection_applied_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = raw_config(&dir);
        let now = now_epoch();
        let doc = vsw("conn-1", "sw1", "Ethernet0", 3001, None, now - 10, now + 3600);
        let store = store_with(&doc).await;
        let signal = Arc::new(WorkerSignal::default());
        let mut worker =
            SwitchWorker::new("sw1", SITE_NAME, store.clone(), config, signal).unwrap();
        worker.apply(now).await.unwrap();

        store
            .compare_and_set_active_deltas(1, &ActiveDeltas::default(), now)
            .await
            .unwrap();
        assert!(worker.apply(now).await.unwrap());

        // The raw backend keeps what it was asked to apply.
        let pushed = load_applied(
            &dir.path()
                .join(srm_switch::raw::RAW_CONFIG_DIR)
                .join("sw1.yaml"),
        )
        .unwrap();
        assert_eq!(
            pushed["interface"]["Vlan3001"]["state"],
            serde_yaml::Value::from("absent")
        );
        // Once applied, absent entries are dropped from the running copy.
        let running = load_applied(&applied_config_path(dir.path(), "sw1")).unwrap();
        assert!(running["interface"].as_mapping().unwrap().is_empty());

        // And the next cycle has nothing left to push.
        assert!(!worker.apply(now).await.unwrap());
    }

    #[tokio::test]
    async fn test_signal_forces_apply() {
        let dir = tempfile::tempdir().unwrap();
        let config = raw_config(&dir);
        let now = now_epoch();
        let store = store_with(&ActiveDeltas::default()).await;
        let signal = Arc::new(WorkerSignal::default());
        let mut worker =
            SwitchWorker::new("sw1", SITE_NAME, store, config, Arc::clone(&signal)).unwrap();
        assert!(worker.apply(now).await.unwrap());
        assert!(!worker.apply(now).await.unwrap());
        signal.request_apply();
        assert!(worker.apply(now).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_facts_stores_switch_row() {
        let dir = tempfile::tempdir().unwrap();
        let config = raw_config(&dir);
        let store = store_with(&ActiveDeltas::default()).await;
        let mut worker = SwitchWorker::new(
            "sw1",
            SITE_NAME,
            store.clone(),
            config,
            Arc::new(WorkerSignal::default()),
        )
        .unwrap();
        worker.refresh_facts(100).await.unwrap();
        let rows = store.list_switches(SITE_NAME).await.unwrap();
        assert_eq!(rows.len(), 1);
        let facts: SwitchFacts = serde_json::from_value(rows[0].output.clone()).unwrap();
        assert!(facts.ports.contains_key("Ethernet0"));
        assert!(!worker.facts_due());
    }

    #[tokio::test]
    async fn test_dispatcher_restarts_stopped_worker() {
        let dir = tempfile::tempdir().unwrap();
        let config = raw_config(&dir);
        let store = store_with(&ActiveDeltas::default()).await;
        let shutdown = CancellationToken::new();
        let mut dispatcher =
            ProvisioningDispatcher::new(store, config.clone(), SITE_NAME, shutdown.clone());

        let warnings = dispatcher.ensure_running().await;
        assert!(warnings.is_empty(), "{:?}", warnings);
        assert_eq!(dispatcher.running_devices(), vec!["sw1".to_string()]);

        dispatcher.workers["sw1"].task.abort();
        while !dispatcher.workers["sw1"].task.is_finished() {
            tokio::task::yield_now().await;
        }
        let warnings = dispatcher.ensure_running().await;
        assert_eq!(warnings.len(), 1);
        assert!(dispatcher.is_running("sw1"));

        dispatcher.update_config(config);
        assert!(dispatcher.need_restart());
        dispatcher.ensure_running().await;
        assert!(!dispatcher.need_restart());
        shutdown.cancel();
    }

    /// Backend whose applies take a while, counting how many run at once.
    #[derive(Default)]
    struct SlowBackend {
        active: std::sync::atomic::AtomicUsize,
        max_active: std::sync::atomic::AtomicUsize,
        applies: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl SwitchBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn get_facts(&self, _devices: &[String]) -> srm_switch::BackendResult<srm_switch::FactsReport> {
            Ok(srm_switch::FactsReport::default())
        }

        async fn apply_config(
            &self,
            desired: &BTreeMap<String, Mapping>,
        ) -> srm_switch::BackendResult<srm_switch::ApplyReport> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.applies.fetch_add(1, Ordering::SeqCst);
            Ok(srm_switch::ApplyReport {
                applied: desired.keys().cloned().collect(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_restart_waits_for_running_apply() {
        let dir = tempfile::tempdir().unwrap();
        let config = raw_config(&dir);
        let now = now_epoch();
        let doc = vsw("conn-1", "sw1", "Ethernet0", 3001, None, now - 10, now + 3600);
        let store = store_with(&doc).await;
        let backend = Arc::new(SlowBackend::default());
        let shutdown = CancellationToken::new();
        let mut dispatcher =
            ProvisioningDispatcher::new(store.clone(), config.clone(), SITE_NAME, shutdown.clone())
                .with_backend(backend.clone());

        // Foreground first apply, then the background worker gets a forced one.
        assert!(dispatcher.ensure_running().await.is_empty());
        dispatcher.signal_all();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Restart while that apply is still running.
        dispatcher.update_config(config);
        dispatcher.ensure_running().await;
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;

        assert_eq!(backend.applies.load(Ordering::SeqCst), 3);
        assert_eq!(backend.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.running_devices(), vec!["sw1".to_string()]);

        // The restart neither touches the active document nor fails anything.
        assert_eq!(store.get_active_deltas().await.unwrap().output, doc);
        let states = store.delta_time_states("conn-1").await.unwrap();
        assert_eq!(states.len(), 3);
        assert!(states.iter().all(|s| s.uuidstate == TimedState::Activated));

        dispatcher.stop_all().await;
        assert!(dispatcher.running_devices().is_empty());
        shutdown.cancel();
    }

    #[test]
    fn test_devices_of_connections() {
        let doc = vsw("conn-1", "sw1", "Ethernet0", 3001, None, 0, 100);
        let devices = devices_of(&doc, &["conn-1".to_string(), "other".to_string()]);
        assert_eq!(devices, BTreeSet::from(["sw1".to_string()]));
    }
}
