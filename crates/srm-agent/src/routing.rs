//! ipv6 policy routing for routed requests served by this host.
//!
//! A served request gets three rules pointing at the table of its source
//! interface: traffic towards the remote prefix, traffic from the local
//! address and traffic to the local address. Rules already present are left
//! alone, so re-applying is a no-op.

use once_cell::sync::Lazy;
use regex::Regex;
use srm_common::shell;
use srm_common::AgentConfig;
use srm_types::{IpAddress, IpFamily, IpPrefix, TimedState};
use tracing::{debug, info, warn};

use crate::client::TimeStateReport;
use crate::commands::{build_list_rules_cmd, build_rule_from_cmd, build_rule_to_cmd};
use crate::error::AgentResult;
use crate::overlap::OverlapService;

/// uuidtype of routed timed states.
pub const UUID_TYPE: &str = "rst";

/// hostport of routed timed states.
pub const HOST_PORT: &str = "ipv6";

static RULE_FROM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+):\s+from (\S+) lookup (\S+)$").expect("Invalid regex pattern")
});

static RULE_FROM_TO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+):\s+from (\S+) to (\S+) lookup (\S+)").expect("Invalid regex pattern")
});

/// One `ip -6 rule` entry; `all` selectors are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRule {
    pub priority: u32,
    pub from: Option<IpPrefix>,
    pub to: Option<IpPrefix>,
    pub table: String,
}

fn selector(value: &str) -> Option<IpPrefix> {
    if value == "all" {
        return None;
    }
    IpPrefix::parse_lenient(value).ok()
}

/// The ipv6 rule table of the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rules {
    rules: Vec<IpRule>,
}

impl Rules {
    /// Parses `ip -6 rule list` output; unknown lines are skipped.
    pub fn parse(output: &str) -> Self {
        let rules = output
            .lines()
            .map(str::trim_end)
            .filter_map(|line| {
                if let Some(c) = RULE_FROM_RE.captures(line) {
                    return Some(IpRule {
                        priority: c[1].parse().ok()?,
                        from: selector(&c[2]),
                        to: None,
                        table: c[3].to_string(),
                    });
                }
                let c = RULE_FROM_TO_RE.captures(line)?;
                Some(IpRule {
                    priority: c[1].parse().ok()?,
                    from: selector(&c[2]),
                    to: selector(&c[3]),
                    table: c[4].to_string(),
                })
            })
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Any rule for traffic towards `to`.
    pub fn has_to(&self, to: &IpPrefix) -> bool {
        self.rules.iter().any(|r| r.to.as_ref() == Some(to))
    }

    pub fn has_from_table(&self, from: &IpPrefix, table: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.from.as_ref() == Some(from) && r.table == table)
    }

    pub fn has_to_table(&self, to: &IpPrefix, table: &str) -> bool {
        self.rules
            .iter()
            .any(|r| r.to.as_ref() == Some(to) && r.table == table)
    }

    fn add(&mut self, from: Option<IpPrefix>, to: Option<IpPrefix>, table: &str) {
        self.rules.push(IpRule {
            priority: 0,
            from,
            to,
            table: table.to_string(),
        });
    }

    fn remove(&mut self, from: Option<IpPrefix>, to: Option<IpPrefix>, table: Option<&str>) {
        self.rules.retain(|r| {
            !(r.from == from && r.to == to && table.map_or(true, |t| r.table == t))
        });
    }
}

/// Reads the host rule table.
pub async fn read_rules() -> AgentResult<Rules> {
    let output = shell::exec_or_throw(&build_list_rules_cmd()).await?;
    Ok(Rules::parse(&output))
}

/// Table for a local address: the managed interface whose ipv6 pool holds
/// it, otherwise the interface the address was found on.
pub fn routing_table(config: &AgentConfig, src: &IpAddress, src_intf: &str) -> String {
    config
        .agent
        .interfaces
        .iter()
        .find(|intf| {
            config
                .interface(intf)
                .address_pool(IpFamily::Ipv6)
                .iter()
                .filter_map(|pool| IpPrefix::parse_lenient(pool).ok())
                .any(|pool| pool.contains(src))
        })
        .cloned()
        .unwrap_or_else(|| src_intf.to_string())
}

/// What a served request needs, resolved.
struct RulePlan {
    table: String,
    src: Option<IpPrefix>,
    dst: Option<IpPrefix>,
}

/// Adds and removes policy rules.
pub struct Routing {
    hostname: String,

    /// Mock mode for testing (no shell commands executed)
    #[cfg(test)]
    mock_mode: bool,

    /// Captured commands in mock mode
    #[cfg(test)]
    captured_commands: Vec<String>,
}

impl Routing {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
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

    fn plan(config: &AgentConfig, service: &OverlapService) -> Option<RulePlan> {
        let src_intf = service.src_intf.get(&IpFamily::Ipv6)?;
        let src = service.src.get(&IpFamily::Ipv6);
        let table = match src {
            Some(addr) => routing_table(config, addr, src_intf),
            None => src_intf.clone(),
        };
        Some(RulePlan {
            table,
            src: src.map(|a| IpPrefix::host(*a)),
            dst: service.dst.get(&IpFamily::Ipv6).copied(),
        })
    }

    fn report(&self, uuid: &str, state: TimedState, now: i64) -> TimeStateReport {
        TimeStateReport {
            uuidtype: UUID_TYPE.to_string(),
            uuid: uuid.to_string(),
            hostname: self.hostname.clone(),
            hostport: HOST_PORT.to_string(),
            uuidstate: state,
            insertdate: now,
        }
    }

    async fn add_missing(&mut self, plan: &RulePlan, rules: &mut Rules) -> AgentResult<bool> {
        let mut changed = false;
        if let Some(dst) = &plan.dst {
            if !rules.has_to(dst) {
                self.exec(&build_rule_to_cmd("add", dst, &plan.table)).await?;
                rules.add(None, Some(*dst), &plan.table);
                changed = true;
            }
        }
        if let Some(src) = &plan.src {
            if !rules.has_from_table(src, &plan.table) {
                self.exec(&build_rule_from_cmd("add", src, &plan.table)).await?;
                rules.add(Some(*src), None, &plan.table);
                changed = true;
            }
            if !rules.has_to_table(src, &plan.table) {
                self.exec(&build_rule_to_cmd("add", src, &plan.table)).await?;
                rules.add(None, Some(*src), &plan.table);
                changed = true;
            }
        }
        Ok(changed)
    }

    async fn delete_present(&mut self, plan: &RulePlan, rules: &mut Rules) -> AgentResult<bool> {
        let mut changed = false;
        if let Some(dst) = &plan.dst {
            if rules.has_to(dst) {
                self.exec(&build_rule_to_cmd("del", dst, &plan.table)).await?;
                rules.remove(None, Some(*dst), None);
                changed = true;
            }
        }
        if let Some(src) = &plan.src {
            if rules.has_from_table(src, &plan.table) {
                self.exec(&build_rule_from_cmd("del", src, &plan.table)).await?;
                rules.remove(Some(*src), None, Some(&plan.table));
                changed = true;
            }
            if rules.has_to_table(src, &plan.table) {
                self.exec(&build_rule_to_cmd("del", src, &plan.table)).await?;
                rules.remove(None, Some(*src), Some(&plan.table));
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Adds the missing rules of `service`. A state is reported only when a
    /// rule had to be added.
    pub async fn activate(
        &mut self,
        config: &AgentConfig,
        service: &OverlapService,
        rules: &mut Rules,
        now: i64,
    ) -> Option<TimeStateReport> {
        let Some(plan) = Self::plan(config, service) else {
            debug!(uuid = %service.uuid, "Routed request has no ipv6 source, no rules");
            return None;
        };
        match self.add_missing(&plan, rules).await {
            Ok(true) => {
                info!(uuid = %service.uuid, table = %plan.table, "Routing rules added");
                Some(self.report(&service.uuid, TimedState::Activated, now))
            }
            Ok(false) => None,
            Err(e) => {
                warn!(uuid = %service.uuid, error = %e, "Failed to add routing rules");
                Some(self.report(&service.uuid, TimedState::ActivateError, now))
            }
        }
    }

    /// Deletes the rules of `service` that are present.
    pub async fn terminate(
        &mut self,
        config: &AgentConfig,
        service: &OverlapService,
        rules: &mut Rules,
        now: i64,
    ) -> Option<TimeStateReport> {
        let plan = Self::plan(config, service)?;
        match self.delete_present(&plan, rules).await {
            Ok(true) => {
                info!(uuid = %service.uuid, table = %plan.table, "Routing rules removed");
                Some(self.report(&service.uuid, TimedState::Deactivated, now))
            }
            Ok(false) => None,
            Err(e) => {
                warn!(uuid = %service.uuid, error = %e, "Failed to remove routing rules");
                Some(self.report(&service.uuid, TimedState::DeactivateError, now))
            }
        }
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

    const RULE_LIST: &str = "\
0:\tfrom all lookup local
100:\tfrom 2001:db8:1::10 lookup eth0
101:\tfrom all to 2001:db8:1::10 lookup eth0
32766:\tfrom all lookup main
";

    fn served() -> OverlapService {
        let config = agent_config();
        let lib = OverlapLib::new(&config, &parse_ip_addr(LINKS).unwrap());
        let active = deltas(serde_json::json!({
            "rst-1": rst_json("urn:svc:1", "2001:db8:1::/64", "2001:db8:9::/64", 2000),
        }));
        lib.overlaps(&active).services["eth0"]["urn:svc:1"].clone()
    }

    #[test]
    fn test_parse_rules() {
        let rules = Rules::parse(RULE_LIST);
        assert_eq!(rules.len(), 4);
        let src: IpPrefix = "2001:db8:1::10/128".parse().unwrap();
        assert!(rules.has_from_table(&src, "eth0"));
        assert!(rules.has_to_table(&src, "eth0"));
        assert!(!rules.has_from_table(&src, "main"));
        assert!(!rules.has_to(&"2001:db8:9::/64".parse().unwrap()));
    }

    #[test]
    fn test_routing_table_prefers_pool_owner() {
        let config = agent_config();
        let in_pool: IpAddress = "2001:db8:1::42".parse().unwrap();
        assert_eq!(routing_table(&config, &in_pool, "ns1"), "eth0");
        let outside: IpAddress = "2001:db8:7::1".parse().unwrap();
        assert_eq!(routing_table(&config, &outside, "ns1"), "ns1");
    }

    #[tokio::test]
    async fn test_activate_adds_only_missing_rules() {
        let config = agent_config();
        let mut rules = Rules::parse(RULE_LIST);
        let mut routing = Routing::new("dtn01").with_mock_mode();

        let report = routing
            .activate(&config, &served(), &mut rules, NOW)
            .await
            .unwrap();
        assert_eq!(
            routing.captured_commands(),
            &["/sbin/ip -6 rule add to 2001:db8:9::/64 table \"eth0\"".to_string()]
        );
        assert_eq!(report.uuidstate, TimedState::Activated);
        assert_eq!(report.uuidtype, "rst");
        assert_eq!(report.hostport, "ipv6");
        assert_eq!(report.uuid, "rst-1");

        assert!(routing.activate(&config, &served(), &mut rules, NOW).await.is_none());
        assert_eq!(routing.captured_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_removes_rules() {
        let config = agent_config();
        let mut rules = Rules::parse(RULE_LIST);
        let mut routing = Routing::new("dtn01").with_mock_mode();

        let report = routing
            .terminate(&config, &served(), &mut rules, NOW)
            .await
            .unwrap();
        assert_eq!(
            routing.captured_commands(),
            &[
                "/sbin/ip -6 rule del from 2001:db8:1::10/128 table \"eth0\"".to_string(),
                "/sbin/ip -6 rule del to 2001:db8:1::10/128 table \"eth0\"".to_string(),
            ]
        );
        assert_eq!(report.uuidstate, TimedState::Deactivated);
        assert_eq!(rules.len(), 2);
        assert!(routing.terminate(&config, &served(), &mut rules, NOW).await.is_none());
    }
}
