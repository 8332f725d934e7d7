//! Desired switch configuration rendered from the active document.
//!
//! A switch worker renders three sections for its device:
//!
//! - `interface`: one vlan interface per switched connection touching the
//!   switch ([`vsw`])
//! - `qos`: per port and vlan rate limits when the switch enforces them
//! - `sense_bgp`: neighbors, networks, prefix lists and route maps of the
//!   routed connections ([`bgp`])
//!
//! [`diff`] then marks what the device runs but the new rendering no longer
//! wants as `absent`.

pub mod bgp;
pub mod diff;
pub mod vsw;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use srm_common::config::SwitchConfig;
use srm_common::{FrontendConfig, SrmResult};
use srm_switch::Vendor;
use srm_types::{ActiveDeltas, IpPrefix, SwitchFacts};

pub use bgp::{render_bgp, route_uid, BgpConfig, Neighbor};
pub use diff::{mark_absent, strip_absent};
pub use vsw::{render_switched, QosEntry, VlanInterface};

pub const INTERFACE_KEY: &str = "interface";
pub const QOS_KEY: &str = "qos";
pub const BGP_KEY: &str = "sense_bgp";

/// State of a rendered item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Present,
    Absent,
}

/// Port of one rendered connection, as reported back in `deltatimestates`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RenderedPort {
    pub uuid: String,
    pub uuidtype: &'static str,
    pub hostport: String,
}

/// Everything the switch should run according to the active document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredConfig {
    pub interface: BTreeMap<String, VlanInterface>,
    pub qos: BTreeMap<String, QosEntry>,
    pub sense_bgp: Option<BgpConfig>,
    /// Connections and ports that ended up in the rendering.
    pub ports: Vec<RenderedPort>,
    /// A connection asked to be pushed again regardless of the diff.
    pub force_apply: bool,
}

impl DesiredConfig {
    /// The document handed to the switch backend.
    pub fn to_mapping(&self) -> SrmResult<Mapping> {
        let mut out = Mapping::new();
        out.insert(
            Value::from(INTERFACE_KEY),
            serde_yaml::to_value(&self.interface)?,
        );
        out.insert(Value::from(QOS_KEY), serde_yaml::to_value(&self.qos)?);
        if let Some(bgp) = &self.sense_bgp {
            out.insert(Value::from(BGP_KEY), serde_yaml::to_value(bgp)?);
        }
        Ok(out)
    }
}

/// Inputs of one rendering.
pub struct RenderContext<'a> {
    pub config: &'a FrontendConfig,
    pub switch: &'a str,
    pub switch_config: &'a SwitchConfig,
    pub vendor: Option<Vendor>,
    pub facts: Option<&'a SwitchFacts>,
    pub now: i64,
}

impl<'a> RenderContext<'a> {
    pub fn new(
        config: &'a FrontendConfig,
        switch: &'a str,
        facts: Option<&'a SwitchFacts>,
        now: i64,
    ) -> SrmResult<Self> {
        let switch_config = config.switch(switch)?;
        Ok(Self {
            config,
            switch,
            switch_config,
            vendor: switch_config.network_os.parse::<Vendor>().ok(),
            facts,
            now,
        })
    }

    /// Vendor spelling of a model port name.
    pub fn port_name(&self, port: &str) -> String {
        srm_switch::switch_port_name(self.vendor, self.facts, port, None)
    }

    /// Vendor name of the vlan interface.
    pub fn vlan_interface(&self, port: &str, vlan: u16) -> String {
        srm_switch::switch_port_name(self.vendor, self.facts, port, Some(vlan))
    }

    /// True when rate limits are pushed to `port`.
    pub fn rate_limited(&self, port: &str) -> bool {
        self.switch_config.rate_limit
            && self
                .switch_config
                .ports
                .get(port)
                .and_then(|p| p.rate_limit)
                .unwrap_or(true)
    }
}

/// Renders the full desired configuration of one switch.
pub fn render(ctx: &RenderContext<'_>, active: &ActiveDeltas) -> SrmResult<DesiredConfig> {
    let mut desired = DesiredConfig::default();
    render_switched(ctx, active, &mut desired);
    render_bgp(ctx, active, &mut desired)?;
    desired.ports.sort();
    desired.ports.dedup();
    Ok(desired)
}

/// Normalized spelling of an address or prefix, or the raw value when it
/// does not parse.
pub(crate) fn normalize_ip(value: &str) -> String {
    IpPrefix::parse_lenient(value)
        .map(|p| p.to_string())
        .unwrap_or_else(|_| value.to_string())
}

/// Address part of a value that may carry a prefix length.
pub(crate) fn host_address(value: &str) -> String {
    value.split('/').next().unwrap_or(value).to_string()
}
