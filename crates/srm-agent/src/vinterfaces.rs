//! Host vlan interfaces for switched requests.
//!
//! Each port request of a switched path that names this host becomes a
//! `vlan.<id>` interface on the requested port with the requested addresses.
//! Every apply produces a timed state for the (delta, port); the state is
//! only sent when it differs from what the frontend already recorded in the
//! request's `networkstatus`.

use srm_common::shell;
use srm_common::AgentConfig;
use srm_types::{IpFamily, IpPrefix, PortRequest, TimedState, VlanId};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::client::TimeStateReport;
use crate::commands::{
    build_add_address_cmd, build_add_vlan_cmd, build_del_vlan_cmd, build_vlan_down_cmd,
    build_vlan_up_cmd,
};
use crate::error::AgentResult;
use crate::facts::{HostLink, HostLinks};

/// uuidtype of switched timed states.
pub const UUID_TYPE: &str = "vsw";

/// What one port request asks of the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanRequest {
    /// Parent interface.
    pub port: String,
    pub vlan: VlanId,
    pub addresses: Vec<IpPrefix>,
    pub mtu: u32,
    pub txqueuelen: u32,
    /// State the frontend last recorded for this port.
    pub recorded: Option<String>,
}

/// Port requests of one host, skipping those without a vlan.
pub fn vlan_requests(
    config: &AgentConfig,
    ports: &BTreeMap<String, PortRequest>,
) -> Vec<VlanRequest> {
    ports
        .iter()
        .filter_map(|(port, request)| {
            let Some(vlan) = request.vlan() else {
                warn!(port = %port, "Port request without vlan, ignoring");
                return None;
            };
            Some(VlanRequest {
                port: port.clone(),
                vlan,
                addresses: IpFamily::ALL
                    .iter()
                    .filter_map(|f| request.address(*f))
                    .collect(),
                mtu: config.vlan_mtu(port),
                txqueuelen: config.txqueuelen(port),
                recorded: request.params.networkstatus.clone(),
            })
        })
        .collect()
}

/// Creates and removes vlan interfaces.
pub struct VInterfaces {
    hostname: String,

    /// Mock mode for testing (no shell commands executed)
    #[cfg(test)]
    mock_mode: bool,

    /// Captured commands in mock mode
    #[cfg(test)]
    captured_commands: Vec<String>,
}

impl VInterfaces {
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

    fn report(
        &self,
        uuid: &str,
        request: &VlanRequest,
        state: TimedState,
        now: i64,
    ) -> Option<TimeStateReport> {
        let recorded = request.recorded.as_deref().unwrap_or("unknown");
        if recorded == state.as_str() {
            return None;
        }
        Some(TimeStateReport {
            uuidtype: UUID_TYPE.to_string(),
            uuid: uuid.to_string(),
            hostname: self.hostname.clone(),
            hostport: request.port.clone(),
            uuidstate: state,
            insertdate: now,
        })
    }

    async fn bring_up(&mut self, request: &VlanRequest, links: &mut HostLinks) -> AgentResult<()> {
        let name = request.vlan.interface_name();
        if !links.contains_key(&name) {
            self.exec(&build_add_vlan_cmd(&request.port, request.vlan)).await?;
            links.insert(
                name.clone(),
                HostLink {
                    name: name.clone(),
                    parent: Some(request.port.clone()),
                    ..Default::default()
                },
            );
        }
        let missing: Vec<IpPrefix> = links
            .get(&name)
            .map(|link| {
                request
                    .addresses
                    .iter()
                    .filter(|a| !link.has_address(a))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for address in &missing {
            self.exec(&build_add_address_cmd(request.vlan, address)).await?;
        }
        let up = links.get(&name).is_some_and(HostLink::is_up);
        if !up {
            self.exec(&build_vlan_up_cmd(request.vlan, request.mtu, request.txqueuelen))
                .await?;
        }
        if let Some(link) = links.get_mut(&name) {
            link.addresses.extend(missing);
            link.operstate = Some("UP".to_string());
            link.mtu = Some(request.mtu);
            link.txqueuelen = Some(request.txqueuelen);
        }
        Ok(())
    }

    async fn tear_down(&mut self, vlan: VlanId, links: &mut HostLinks) -> AgentResult<()> {
        if links.contains_key(&vlan.interface_name()) {
            self.exec(&build_vlan_down_cmd(vlan)).await?;
            self.exec(&build_del_vlan_cmd(vlan)).await?;
            links.remove(&vlan.interface_name());
        }
        Ok(())
    }

    /// Ensures every requested interface exists, carries its addresses and is up.
    pub async fn activate(
        &mut self,
        uuid: &str,
        requests: &[VlanRequest],
        links: &mut HostLinks,
        now: i64,
    ) -> Vec<TimeStateReport> {
        let mut reports = Vec::new();
        for request in requests {
            let state = match self.bring_up(request, links).await {
                Ok(()) => TimedState::Activated,
                Err(e) => {
                    warn!(uuid = %uuid, vlan = %request.vlan, error = %e, "Failed to activate vlan interface");
                    TimedState::ActivateError
                }
            };
            reports.extend(self.report(uuid, request, state, now));
        }
        reports
    }

    /// Removes the interfaces of the requests.
    pub async fn terminate(
        &mut self,
        uuid: &str,
        requests: &[VlanRequest],
        links: &mut HostLinks,
        now: i64,
    ) -> Vec<TimeStateReport> {
        let mut reports = Vec::new();
        for request in requests {
            info!(uuid = %uuid, vlan = %request.vlan, port = %request.port, "Terminating vlan interface");
            let state = match self.tear_down(request.vlan, links).await {
                Ok(()) => TimedState::Deactivated,
                Err(e) => {
                    warn!(uuid = %uuid, vlan = %request.vlan, error = %e, "Failed to remove vlan interface");
                    TimedState::DeactivateError
                }
            };
            reports.extend(self.report(uuid, request, state, now));
        }
        reports
    }

    /// Replaces `old` by `new` when the vlan or address set changed; a
    /// change of bandwidth alone is left to QoS.
    pub async fn modify(
        &mut self,
        uuid: &str,
        old: &[VlanRequest],
        new: &[VlanRequest],
        links: &mut HostLinks,
        now: i64,
    ) -> Vec<TimeStateReport> {
        let key = |r: &VlanRequest| (r.port.clone(), r.vlan, r.addresses.clone());
        if old.iter().map(key).eq(new.iter().map(key)) {
            return Vec::new();
        }
        info!(uuid = %uuid, "Switched request changed, re-creating its interfaces");
        let mut reports = self.terminate(uuid, old, links, now).await;
        reports.extend(self.activate(uuid, new, links, now).await);
        reports
    }
}
