//! The Ruler: converges host networking on the frontend's active deltas.
//!
//! Each cycle fetches the active deltas and compares them with the copy
//! persisted by the previous cycle. Entries that disappeared or changed are
//! torn down (or re-created) first, then every entry live at this moment is
//! ensured: vlan interfaces for switched requests, ipv6 policy rules for
//! routed requests served from this host. Traffic shaping is rendered last
//! from the new state.

use async_trait::async_trait;
use srm_common::config::QosPolicy;
use srm_common::{
    now_epoch, AgentConfig, ConfigCache, CycleOutcome, SrmError, SrmResult, Worker,
};
use srm_types::{ActiveDeltas, PortRequest, SwitchedKind, SwitchedPath};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::client::{FrontendClient, TimeStateReport};
use crate::error::{AgentError, AgentResult};
use crate::facts::{self, HostLinks, SYSFS_NET};
use crate::overlap::OverlapLib;
use crate::qos::{self, QosApplier, QosInput};
use crate::routing::{self, Routing, Rules};
use crate::vinterfaces::{vlan_requests, VInterfaces};

pub const SERVICE_NAME: &str = "Ruler";

/// File under `privatedir` holding the last applied active deltas.
pub const STATE_FILE: &str = "activedeltas.json";

/// Switched categories that get host interfaces.
const HOST_SWITCHED: [SwitchedKind; 2] = [SwitchedKind::Vsw, SwitchedKind::Kube];

/// Observed host state a cycle works against.
#[derive(Debug, Clone, Default)]
pub struct HostView {
    pub links: HostLinks,
    pub rules: Rules,
    /// Link speeds in mbit of managed interfaces.
    pub speeds: BTreeMap<String, u64>,
}

impl HostView {
    /// Reads links, ipv6 rules and link speeds.
    pub async fn read(config: &AgentConfig) -> AgentResult<Self> {
        let links = facts::read_links().await?;
        let rules = routing::read_rules().await?;
        let speeds = config
            .agent
            .interfaces
            .iter()
            .filter_map(|name| {
                facts::link_attributes(Path::new(SYSFS_NET), name)
                    .speed
                    .map(|s| (name.clone(), s))
            })
            .collect();
        Ok(Self {
            links,
            rules,
            speeds,
        })
    }
}

/// What a cycle did.
#[derive(Debug, Clone, Default)]
pub struct Convergence {
    /// States to publish.
    pub reports: Vec<TimeStateReport>,
    /// The shaping configuration was replaced.
    pub qos_changed: bool,
}

/// Loads the persisted active deltas; a missing or unreadable file is an
/// empty document.
pub fn load_state(path: &Path) -> ActiveDeltas {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ActiveDeltas::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read applied state");
            return ActiveDeltas::default();
        }
    };
    serde_json::from_str(&text).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Applied state is corrupt, starting over");
        ActiveDeltas::default()
    })
}

pub fn save_state(path: &Path, state: &ActiveDeltas) -> AgentResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| AgentError::io(dir.display().to_string(), e))?;
    }
    let text = serde_json::to_string_pretty(state).map_err(|e| AgentError::parse("active deltas", e))?;
    std::fs::write(path, text).map_err(|e| AgentError::io(path.display().to_string(), e))
}

fn host_ports<'a>(path: &'a SwitchedPath, hostname: &str) -> Option<&'a BTreeMap<String, PortRequest>> {
    path.hosts.get(hostname)
}

pub struct Ruler {
    config: Arc<ConfigCache<AgentConfig>>,
    client: Arc<FrontendClient>,
    vinterfaces: VInterfaces,
    routing: Routing,
    qos: QosApplier,
}

impl Ruler {
    pub fn new(config: Arc<ConfigCache<AgentConfig>>, client: Arc<FrontendClient>) -> Self {
        let current = config.get();
        Self {
            vinterfaces: VInterfaces::new(&current.general.hostname),
            routing: Routing::new(&current.general.hostname),
            qos: QosApplier::new(&current),
            config,
            client,
        }
    }

    /// Enables mock mode on every component for testing
    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.vinterfaces = self.vinterfaces.with_mock_mode();
        self.routing = self.routing.with_mock_mode();
        self.qos = self.qos.with_mock_mode();
        self
    }

    pub fn state_path(config: &AgentConfig) -> PathBuf {
        config.general.privatedir.join(STATE_FILE)
    }

    async fn compare_switched(
        &mut self,
        config: &AgentConfig,
        previous: &ActiveDeltas,
        current: &ActiveDeltas,
        host: &mut HostView,
        now: i64,
    ) -> Vec<TimeStateReport> {
        let hostname = config.general.hostname.as_str();
        let mut reports = Vec::new();
        for kind in HOST_SWITCHED {
            for (uuid, path) in previous.switched(kind) {
                let Some(old_ports) = host_ports(path, hostname) else {
                    continue;
                };
                if !path.window().is_started(now) {
                    continue;
                }
                let old = vlan_requests(config, old_ports);
                match current.switched(kind).get(uuid).and_then(|p| host_ports(p, hostname)) {
                    Some(new_ports) if new_ports == old_ports => {}
                    Some(new_ports) => {
                        let new = vlan_requests(config, new_ports);
                        reports.extend(
                            self.vinterfaces
                                .modify(uuid, &old, &new, &mut host.links, now)
                                .await,
                        );
                    }
                    None => {
                        info!(uuid = %uuid, "Switched request removed");
                        reports.extend(
                            self.vinterfaces
                                .terminate(uuid, &old, &mut host.links, now)
                                .await,
                        );
                    }
                }
            }
        }
        reports
    }

    async fn ensure_switched(
        &mut self,
        config: &AgentConfig,
        current: &ActiveDeltas,
        host: &mut HostView,
        now: i64,
    ) -> Vec<TimeStateReport> {
        let hostname = config.general.hostname.as_str();
        let mut reports = Vec::new();
        for kind in HOST_SWITCHED {
            for (uuid, path) in current.switched(kind) {
                let Some(ports) = host_ports(path, hostname) else {
                    continue;
                };
                let window = path.window();
                // Ended requests are torn down once the frontend drops them.
                if !window.is_started(now) || window.is_ended(now) {
                    debug!(uuid = %uuid, "Switched request not live, skipping");
                    continue;
                }
                let requests = vlan_requests(config, ports);
                reports.extend(
                    self.vinterfaces
                        .activate(uuid, &requests, &mut host.links, now)
                        .await,
                );
            }
        }
        reports
    }

    /// One convergence pass against an observed host.
    pub async fn converge(
        &mut self,
        config: &AgentConfig,
        previous: &ActiveDeltas,
        current: &ActiveDeltas,
        totals: &BTreeMap<String, u64>,
        host: &mut HostView,
        now: i64,
    ) -> AgentResult<Convergence> {
        let mut out = Convergence::default();
        if config.agent.norules {
            info!("Agent is configured not to apply rules");
            return Ok(out);
        }
        let changed = previous != current;
        let lib = OverlapLib::new(config, &host.links);
        let served_before = lib.overlaps(previous);
        let served_now = lib.overlaps(current);

        if changed {
            out.reports
                .extend(self.compare_switched(config, previous, current, host, now).await);
        }
        out.reports
            .extend(self.ensure_switched(config, current, host, now).await);

        if config.qos.policy()? == Some(QosPolicy::Hostlevel) {
            if changed {
                for (intf, uri, service) in served_before.iter() {
                    let kept = served_now
                        .services
                        .get(intf)
                        .and_then(|by_uri| by_uri.get(uri));
                    if kept != Some(service) {
                        out.reports.extend(
                            self.routing
                                .terminate(config, service, &mut host.rules, now)
                                .await,
                        );
                    }
                }
            }
            for (_, _, service) in served_now.iter() {
                out.reports.extend(
                    self.routing
                        .activate(config, service, &mut host.rules, now)
                        .await,
                );
            }
        }

        if !config.agent.noqos {
            let rendered = qos::render(QosInput {
                config,
                hostname: &config.general.hostname,
                now,
                active: current,
                overlaps: &served_now,
                totals,
                speeds: &host.speeds,
            })?;
            out.qos_changed = self.qos.apply(&rendered).await?;
        }
        Ok(out)
    }

    /// Publishes states; failures are returned as warnings.
    async fn publish(&self, reports: &[TimeStateReport]) -> Vec<String> {
        let mut warnings = Vec::new();
        for report in reports {
            if let Err(e) = self.client.publish_time_state(report).await {
                warn!(uuid = %report.uuid, error = %e, "Failed to publish state");
                warnings.push(format!("state of {} not published: {}", report.uuid, e));
            }
        }
        warnings
    }

    #[instrument(skip(self))]
    async fn cycle_at(&mut self, now: i64) -> AgentResult<CycleOutcome> {
        let config = self.config.get();
        let state_path = Self::state_path(&config);
        let previous = load_state(&state_path);
        let current = self.client.active_deltas().await?.output;
        let changed = previous != current;
        if changed {
            save_state(&state_path, &current)?;
        }

        let totals = if config.agent.norules || config.agent.noqos {
            BTreeMap::new()
        } else {
            self.client.qos_totals().await?
        };
        let mut host = if config.agent.norules {
            HostView::default()
        } else {
            HostView::read(&config).await?
        };
        let convergence = self
            .converge(&config, &previous, &current, &totals, &mut host, now)
            .await?;
        let warnings = self.publish(&convergence.reports).await;
        Ok(CycleOutcome {
            changes: changed || convergence.qos_changed || !convergence.reports.is_empty(),
            warnings,
        })
    }
}

#[async_trait]
impl Worker for Ruler {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn run_once(&mut self) -> SrmResult<CycleOutcome> {
        self.cycle_at(now_epoch()).await.map_err(SrmError::from)
    }

    async fn reload(&mut self) -> SrmResult<()> {
        if self.config.reload()? {
            let config = self.config.get();
            self.vinterfaces = VInterfaces::new(&config.general.hostname);
            self.routing = Routing::new(&config.general.hostname);
            self.qos = QosApplier::new(&config);
            info!("Configuration reloaded");
        }
        Ok(())
    }
}
