//! Traffic shaping: renders the fireqos configuration of the host and
//! installs it when it changed.
//!
//! # Switched requests
//!
//! Every started switched request with a vlan and a bandwidth request gets
//! an `interface vlan.<id>` stanza. Its rate is taken from the parent
//! interface budget; a request that would exhaust the budget refuses the
//! whole file. Soft-capped and best-effort requests may borrow up to what is
//! left on the parent, best-effort ones a smaller fraction of it.
//!
//! # Routed requests
//!
//! Routed requests served from this host share what remains of the parent
//! interface. Each one gets a class whose commit is its fairshare: the
//! parent capacity in proportion to the site-wide total requested for the
//! same range, with a 1000 mbit floor.

use srm_common::shell;
use srm_common::config::QosPolicy;
use srm_common::AgentConfig;
use srm_types::{
    convert_to_rate, ActiveDeltas, IpFamily, IpPrefix, SwitchedKind, RATE_UNIT_MBIT,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::overlap::{OverlapService, Overlaps};

/// Placeholder for the parent capacity left once every stanza is known.
const REPLACE_ME: &str = "##REPLACEME##";

/// Smallest class commit for a routed request, in mbit.
pub const MIN_ROUTED_RATE: u64 = 1000;

/// Bandwidth of one parent interface, in mbit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceBudget {
    /// Capacity minus the reserve; shrinks as switched requests are placed.
    pub intf_max: u64,
    pub reserve: u64,
    /// Routed requests placed on this parent.
    pub total_allocated: u64,
    /// Routed requests per child interface.
    pub allocated: BTreeMap<String, u64>,
}

impl InterfaceBudget {
    fn new(config: &AgentConfig, speeds: &BTreeMap<String, u64>, name: &str) -> Self {
        let settings = config.interface(name);
        let capacity = settings
            .maximum_capacity
            .or_else(|| speeds.get(name).copied())
            .unwrap_or_else(|| {
                warn!(interface = %name, "No capacity configured or detected");
                0
            });
        Self {
            intf_max: capacity.saturating_sub(settings.reserved_capacity),
            reserve: settings.reserved_capacity,
            ..Default::default()
        }
    }
}

/// Everything a render needs.
#[derive(Debug, Clone, Copy)]
pub struct QosInput<'a> {
    pub config: &'a AgentConfig,
    pub hostname: &'a str,
    pub now: i64,
    pub active: &'a ActiveDeltas,
    pub overlaps: &'a Overlaps,
    /// Site-wide requested mbit per source range.
    pub totals: &'a BTreeMap<String, u64>,
    /// Detected link speeds, for interfaces without a configured capacity.
    pub speeds: &'a BTreeMap<String, u64>,
}

struct SwitchedStanza {
    port: String,
    rate: u64,
    class: String,
    lines: Vec<String>,
}

struct RoutedClass<'a> {
    uri: &'a str,
    share: u64,
    service: &'a OverlapService,
}

struct RoutedGroup<'a> {
    master: String,
    reserved: u64,
    total: u64,
    classes: Vec<RoutedClass<'a>>,
}

struct Renderer<'a> {
    input: QosInput<'a>,
    budgets: BTreeMap<String, InterfaceBudget>,
}

impl<'a> Renderer<'a> {
    fn new(input: QosInput<'a>) -> Self {
        let budgets = input
            .config
            .agent
            .interfaces
            .iter()
            .map(|name| (name.clone(), InterfaceBudget::new(input.config, input.speeds, name)))
            .collect();
        Self { input, budgets }
    }

    fn budget(&mut self, name: &str) -> &mut InterfaceBudget {
        let (config, speeds) = (self.input.config, self.input.speeds);
        self.budgets
            .entry(name.to_string())
            .or_insert_with(|| InterfaceBudget::new(config, speeds, name))
    }

    fn switched_stanzas(&mut self) -> AgentResult<Vec<SwitchedStanza>> {
        let input = self.input;
        let mut stanzas = Vec::new();
        for kind in SwitchedKind::ALL {
            for (uuid, path) in input.active.switched(kind) {
                let Some(ports) = path.hosts.get(input.hostname) else {
                    continue;
                };
                if !path.window().is_started(input.now) {
                    continue;
                }
                for (port, request) in ports {
                    let Some(vlan) = request.vlan() else {
                        warn!(uuid = %uuid, port = %port, "Request without vlan, no QoS for it");
                        continue;
                    };
                    let Some(service) = request.has_service.as_ref() else {
                        debug!(uuid = %uuid, port = %port, "Request without bandwidth, no QoS for it");
                        continue;
                    };
                    let rate = convert_to_rate(service)
                        .map_err(|e| AgentError::parse("service rate", e))?;
                    let mbit = rate.as_mbit();
                    let budget = self.budget(port);
                    if budget.intf_max <= mbit {
                        return Err(AgentError::OverSubscribe {
                            interface: port.clone(),
                            max: budget.intf_max,
                            requested: mbit,
                        });
                    }
                    budget.intf_max -= mbit;

                    let class = service.service_type.as_deref().unwrap_or("undefined");
                    let uri = service.uri.as_deref().unwrap_or("undefined");
                    let out = format!("{}{}", rate.value, rate.unit);
                    let name = format!("{}-{}", port, vlan);
                    let intf = vlan.interface_name();
                    let rule = format!("# {}", "-".repeat(80));
                    let mut lines = vec![
                        format!("# SENSE VLAN {} {} {} Class: {}", vlan, port, out, class),
                        format!("# Request: {}", uri),
                        rule.clone(),
                    ];
                    match class {
                        "guaranteedCapped" => {
                            lines.push(format!("interface {} {} bidirectional rate {}", intf, name, out));
                        }
                        "softCapped" | "bestEffort" => {
                            lines.push(format!(
                                "interface {} {} bidirectional rate {}{}",
                                intf, name, REPLACE_ME, RATE_UNIT_MBIT
                            ));
                            lines.push(format!("  class default rate {}", out));
                        }
                        _ => {
                            lines.push(format!("interface {} {} bidirectional rate {}", intf, name, out));
                            lines.push(format!("  class default rate {}", out));
                        }
                    }
                    lines.push(rule);
                    lines.push(String::new());
                    stanzas.push(SwitchedStanza {
                        port: port.clone(),
                        rate: mbit,
                        class: class.to_string(),
                        lines,
                    });
                }
            }
        }
        Ok(stanzas)
    }

    /// Parent rate a switched stanza may borrow up to.
    fn borrow_limit(&self, stanza: &SwitchedStanza) -> u64 {
        let left = self.budgets.get(&stanza.port).map_or(0, |b| b.intf_max);
        let mut limit = left + stanza.rate;
        if stanza.class == "bestEffort" {
            for divisor in (1..=10).rev() {
                limit = (limit / divisor).max(stanza.rate);
                if limit > stanza.rate {
                    break;
                }
            }
        }
        limit
    }

    fn site_total(&self, service: &OverlapService) -> Option<u64> {
        IpFamily::ALL.iter().find_map(|family| {
            let src = IpPrefix::host(*service.src.get(family)?);
            self.input.totals.iter().find_map(|(range, total)| {
                let range = IpPrefix::parse_lenient(range).ok()?;
                (range.overlaps(&src) && *total > 0).then_some(*total)
            })
        })
    }

    /// Commit of a routed request on its parent.
    fn fairshare(&self, service: &OverlapService) -> Option<u64> {
        let total = self.site_total(service)?;
        let budget = self.budgets.get(&service.master_intf)?;
        let requested = service.rate();
        let ratio = ((budget.intf_max as f64 / total as f64) * 10_000.0).round() / 10_000.0;
        let mut share = (ratio * requested as f64) as u64;
        if (share >= budget.intf_max || share > budget.total_allocated) && budget.total_allocated > 0 {
            share = budget.intf_max * requested / budget.total_allocated;
        }
        Some(share.max(MIN_ROUTED_RATE))
    }

    fn routed_groups(&mut self) -> BTreeMap<String, RoutedGroup<'a>> {
        let overlaps = self.input.overlaps;
        for (intf, _, service) in overlaps.iter() {
            let rate = service.rate();
            let budget = self.budget(&service.master_intf);
            budget.total_allocated += rate;
            *budget.allocated.entry(intf.clone()).or_default() += rate;
        }

        let mut groups: BTreeMap<String, RoutedGroup<'a>> = BTreeMap::new();
        for (intf, uri, service) in overlaps.iter() {
            let Some(share) = self.fairshare(service) else {
                debug!(uri = %uri, "No site total for the range, no QoS class");
                continue;
            };
            let reserved = self.budgets.get(&service.master_intf).map_or(0, |b| b.reserve);
            let group = groups.entry(intf.clone()).or_insert_with(|| RoutedGroup {
                master: service.master_intf.clone(),
                reserved,
                total: 0,
                classes: Vec::new(),
            });
            group.total += share;
            group.reserved = reserved;
            group.classes.push(RoutedClass {
                uri: uri.as_str(),
                share,
                service,
            });
        }

        let class_max = self.input.config.qos.class_max;
        for (intf, group) in groups.iter_mut() {
            let budget = self.budgets.get(&group.master).cloned().unwrap_or_default();
            let mut total = group.total + group.reserved;
            for class in &group.classes {
                let own = class.share + group.reserved;
                let max = if class_max && budget.total_allocated > 0 {
                    let allocated = budget.allocated.get(intf).copied().unwrap_or(0);
                    (budget.intf_max * allocated / budget.total_allocated + group.reserved).max(own)
                } else {
                    own
                };
                total = total.max(max);
            }
            group.total = total;
        }
        groups
    }

    fn write_routed(&self, out: &mut String, groups: &BTreeMap<String, RoutedGroup<'_>>) {
        let params = &self.input.config.qos.qos_params;
        for (direction, selector) in [("input", "src"), ("output", "dst")] {
            for (intf, group) in groups {
                let header = format!(
                    "interface46 {} {}-{} {} rate {}mbit {}",
                    intf, intf, direction, direction, group.total, params
                );
                let _ = writeln!(out, "\n# SENSE L3 Routing Private NS Request");
                let _ = writeln!(out, "{}", header.trim_end());
                let overcommit = self.input.config.interface(&group.master).allow_overcommit;
                for (priority, class) in group.classes.iter().enumerate() {
                    let max = if overcommit { group.total } else { class.share };
                    let _ = writeln!(out, "  # priority{} belongs to {} service", priority, class.uri);
                    let _ = writeln!(
                        out,
                        "  class priority{} commit {}mbit max {}mbit",
                        priority, class.share, max
                    );
                    for (family, keyword) in [(IpFamily::Ipv4, "match"), (IpFamily::Ipv6, "match6")] {
                        if let Some(dst) = class.service.dst.get(&family) {
                            let _ = writeln!(out, "    {} {} {}", keyword, selector, dst);
                        }
                    }
                }
                let _ = writeln!(out, "  # Default - all remaining traffic gets mapped to default class");
                let _ = writeln!(
                    out,
                    "  class default commit {}mbit max {}mbit",
                    group.reserved, group.total
                );
                let _ = writeln!(out, "    match all");
            }
        }
    }
}

/// Renders the fireqos configuration.
///
/// # Errors
///
/// `OverSubscribe` when a switched request does not fit its parent; an
/// unsupported `qos.policy` is a configuration error.
pub fn render(input: QosInput<'_>) -> AgentResult<String> {
    let mut renderer = Renderer::new(input);
    let mut out = String::new();

    let stanzas = renderer.switched_stanzas()?;
    for stanza in &stanzas {
        let limit = renderer.borrow_limit(stanza).to_string();
        for line in &stanza.lines {
            let _ = writeln!(out, "{}", line.replace(REPLACE_ME, &limit));
        }
    }

    match input.config.qos.policy()? {
        Some(QosPolicy::Hostlevel) | Some(QosPolicy::Privatens) => {
            let groups = renderer.routed_groups();
            if !groups.is_empty() {
                renderer.write_routed(&mut out, &groups);
            }
        }
        None => info!("QoS policy not set, routed requests get no classes"),
    }
    Ok(out)
}

/// Installs rendered configurations.
pub struct QosApplier {
    path: PathBuf,
    restart_commands: Vec<String>,

    /// Mock mode for testing (no shell commands executed)
    #[cfg(test)]
    mock_mode: bool,

    /// Captured commands in mock mode
    #[cfg(test)]
    captured_commands: Vec<String>,
}

impl QosApplier {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            path: config.qos.config_path.clone(),
            restart_commands: config.qos.restart_commands.clone(),
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: Vec::new(),
        }
    }

    /// Enables mock mode for testing
    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    /// Gets captured commands (for testing)
    #[cfg(test)]
    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn exec(&mut self, cmd: &str) -> AgentResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.push(cmd.to_string());
            info!("Mock exec: {}", cmd);
            return Ok(());
        }

        shell::exec_or_throw(cmd).await?;
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "fireqos.conf".to_string());
        self.path.with_file_name(format!(".{}.new", name))
    }

    /// Writes `rendered` next to the live file and swaps it in when the
    /// content differs, then restarts shaping. Returns whether it changed.
    pub async fn apply(&mut self, rendered: &str) -> AgentResult<bool> {
        let staging = self.staging_path();
        if let Some(dir) = staging.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| AgentError::io(dir.display().to_string(), e))?;
        }
        tokio::fs::write(&staging, rendered)
            .await
            .map_err(|e| AgentError::io(staging.display().to_string(), e))?;

        let live = tokio::fs::read_to_string(&self.path).await.ok();
        if live.as_deref() == Some(rendered) {
            debug!(path = %self.path.display(), "QoS rules unchanged");
            tokio::fs::remove_file(&staging)
                .await
                .map_err(|e| AgentError::io(staging.display().to_string(), e))?;
            return Ok(false);
        }

        info!(path = %self.path.display(), "QoS rules changed, installing");
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| AgentError::io(self.path.display().to_string(), e))?;
        for cmd in self.restart_commands.clone() {
            self.exec(&cmd).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::parse_ip_addr;
    use crate::overlap::tests::{deltas, rst_json, LINKS};
    use crate::overlap::OverlapLib;
    use pretty_assertions::assert_eq;
    use srm_test::{agent_config, NOW};

    fn switched(class: &str, mbps: u64) -> ActiveDeltas {
        serde_json::from_value(serde_json::json!({
            "vsw": {"vsw-1": {
                "_params": {"existsDuring": {"start": NOW - 60, "end": NOW + 3600}},
                "dtn01": {"eth0": {
                    "hasLabel": {"labeltype": "ethernet#vlan", "value": 3001},
                    "hasService": {"type": class, "unit": "mbps", "reservableCapacity": mbps,
                                   "bwuri": "urn:svc:vlan"}
                }}
            }}
        }))
        .unwrap()
    }

    fn render_with(
        config: &AgentConfig,
        active: &ActiveDeltas,
        overlaps: &Overlaps,
        totals: &BTreeMap<String, u64>,
    ) -> AgentResult<String> {
        render(QosInput {
            config,
            hostname: "dtn01",
            now: NOW,
            active,
            overlaps,
            totals,
            speeds: &BTreeMap::new(),
        })
    }

    fn small_config() -> AgentConfig {
        let mut config = agent_config();
        if let Some(eth0) = config.interfaces.get_mut("eth0") {
            eth0.maximum_capacity = Some(10000);
        }
        config
    }

    #[test]
    fn test_guaranteed_capped_stanza() {
        let config = small_config();
        let out = render_with(
            &config,
            &switched("guaranteedCapped", 2000),
            &Overlaps::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        let expected = format!(
            "# SENSE VLAN 3001 eth0 2000mbit Class: guaranteedCapped\n\
             # Request: urn:svc:vlan\n\
             # {dash}\n\
             interface vlan.3001 eth0-3001 bidirectional rate 2000mbit\n\
             # {dash}\n\n",
            dash = "-".repeat(80)
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn test_soft_capped_borrows_remaining() {
        let config = small_config();
        let out = render_with(
            &config,
            &switched("softCapped", 2000),
            &Overlaps::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        // 10000 capacity, 1000 reserve: 9000 left for the vlan.
        assert!(out.contains("interface vlan.3001 eth0-3001 bidirectional rate 9000mbit\n"));
        assert!(out.contains("  class default rate 2000mbit\n"));
        assert!(!out.contains(REPLACE_ME));
    }

    #[test]
    fn test_best_effort_takes_a_fraction() {
        let config = small_config();
        let out = render_with(
            &config,
            &switched("bestEffort", 500),
            &Overlaps::default(),
            &BTreeMap::new(),
        )
        .unwrap();
        // 9000 / 10 = 900 already exceeds the 500 requested.
        assert!(out.contains("bidirectional rate 900mbit\n"));
    }

    #[test]
    fn test_oversubscribe_refuses_file() {
        let config = small_config();
        let err = render_with(
            &config,
            &switched("guaranteedCapped", 9000),
            &Overlaps::default(),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AgentError::OverSubscribe {
                max: 9000,
                requested: 9000,
                ..
            }
        ));
    }

    #[test]
    fn test_not_started_request_ignored() {
        let config = small_config();
        let mut active = switched("guaranteedCapped", 2000);
        if let Some(path) = active.vsw.get_mut("vsw-1") {
            path.params.exists_during = Some(srm_types::ExistsDuring::new(None, NOW + 60, NOW + 3600));
        }
        let out = render_with(&config, &active, &Overlaps::default(), &BTreeMap::new()).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn test_routed_fairshare() {
        let config = small_config();
        let lib = OverlapLib::new(&config, &parse_ip_addr(LINKS).unwrap());
        let active = deltas(serde_json::json!({
            "rst-1": rst_json("urn:svc:1", "2001:db8:1::/64", "2001:db8:91::/64", 10000),
            "rst-2": rst_json("urn:svc:2", "2001:db8:1::/64", "2001:db8:92::/64", 20000),
            "rst-3": rst_json("urn:svc:3", "2001:db8:1::/64", "2001:db8:93::/64", 50000),
        }));
        let overlaps = lib.overlaps(&active);
        let totals = BTreeMap::from([("2001:db8:1::/64".to_string(), 90000)]);

        let out = render_with(&config, &ActiveDeltas::default(), &overlaps, &totals).unwrap();
        assert!(out.contains("interface46 eth0 eth0-input input rate 9000mbit\n"));
        assert!(out.contains("interface46 eth0 eth0-output output rate 9000mbit\n"));
        assert!(out.contains("  class priority0 commit 1000mbit max 9000mbit\n"));
        assert!(out.contains("  class priority1 commit 2000mbit max 9000mbit\n"));
        assert!(out.contains("  class priority2 commit 5000mbit max 9000mbit\n"));
        assert!(out.contains("    match6 src 2001:db8:91::/64\n"));
        assert!(out.contains("    match6 dst 2001:db8:93::/64\n"));
        assert!(out.contains("  class default commit 1000mbit max 9000mbit\n    match all\n"));
    }

    #[test]
    fn test_routed_without_overcommit() {
        let mut config = small_config();
        if let Some(eth0) = config.interfaces.get_mut("eth0") {
            eth0.allow_overcommit = false;
        }
        let lib = OverlapLib::new(&config, &parse_ip_addr(LINKS).unwrap());
        let active = deltas(serde_json::json!({
            "rst-1": rst_json("urn:svc:1", "2001:db8:1::/64", "2001:db8:91::/64", 2000),
        }));
        let totals = BTreeMap::from([("2001:db8:1::/64".to_string(), 18000)]);
        let out = render_with(&config, &ActiveDeltas::default(), &lib.overlaps(&active), &totals)
            .unwrap();
        // ratio 0.5: 1000 mbit commit, capped at its own commit.
        assert!(out.contains("  class priority0 commit 1000mbit max 1000mbit\n"));
    }

    #[test]
    fn test_routed_needs_site_total() {
        let config = small_config();
        let lib = OverlapLib::new(&config, &parse_ip_addr(LINKS).unwrap());
        let active = deltas(serde_json::json!({
            "rst-1": rst_json("urn:svc:1", "2001:db8:1::/64", "2001:db8:91::/64", 2000),
        }));
        let out = render_with(&config, &ActiveDeltas::default(), &lib.overlaps(&active), &BTreeMap::new())
            .unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn test_apply_installs_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = agent_config();
        config.qos.config_path = dir.path().join("fireqos.conf");
        let mut applier = QosApplier::new(&config).with_mock_mode();

        assert!(applier.apply("interface vlan.3001 a\n").await.unwrap());
        assert_eq!(
            std::fs::read_to_string(applier.path()).unwrap(),
            "interface vlan.3001 a\n"
        );
        assert_eq!(
            applier.captured_commands(),
            &[
                "/usr/sbin/fireqos clear_all_qos".to_string(),
                "/usr/sbin/fireqos start".to_string(),
            ]
        );

        assert!(!applier.apply("interface vlan.3001 a\n").await.unwrap());
        assert_eq!(applier.captured_commands().len(), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
