//! Vlan interfaces and QoS entries of switched connections.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use srm_types::{convert_to_rate, ActiveDeltas, IpFamily, SwitchedKind, TimedState};
use tracing::{debug, warn};

use super::{normalize_ip, DesiredConfig, Presence, RenderContext, RenderedPort};

pub const DEFAULT_VLAN_MTU: u32 = 1500;
pub const NO_TAG: &str = "SENSE-VLAN-Without-Tag";
pub const NO_BELONGS_TO: &str = "SENSE-VLAN-Without-belongsTo";

/// One vlan interface on the switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlanInterface {
    pub name: String,
    pub vlanid: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf: Option<String>,
    pub mtu: u32,
    pub description: String,
    #[serde(rename = "belongsTo")]
    pub belongs_to: String,
    pub state: Presence,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tagged_members: BTreeMap<String, Presence>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ipv4_address: BTreeMap<String, Presence>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ipv6_address: BTreeMap<String, Presence>,
}

impl VlanInterface {
    fn addresses_mut(&mut self, family: IpFamily) -> &mut BTreeMap<String, Presence> {
        match family {
            IpFamily::Ipv4 => &mut self.ipv4_address,
            IpFamily::Ipv6 => &mut self.ipv6_address,
        }
    }
}

/// Rate limit of one port in one vlan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosEntry {
    pub port: String,
    pub vlan: u16,
    pub rate: u64,
    pub unit: String,
    pub qosnumber: u32,
    pub qosname: String,
    pub state: Presence,
}

fn uuid_type(kind: SwitchedKind) -> &'static str {
    kind.as_str()
}

/// Adds the vlan interfaces of every vsw, kube and singleport connection
/// that touches the switch and has started.
pub fn render_switched(ctx: &RenderContext<'_>, active: &ActiveDeltas, out: &mut DesiredConfig) {
    for kind in SwitchedKind::ALL {
        for (conn, path) in active.switched(kind) {
            let Some(ports) = path.hosts.get(ctx.switch) else {
                continue;
            };
            let window = path.window();
            if !window.is_started(ctx.now) {
                debug!(connection = %conn, start = window.start, "Connection not started yet");
                continue;
            }
            if window.is_ended(ctx.now) {
                continue;
            }
            let deactivated = TimedState::Deactivated.as_str();
            if path.params.networkstatus.as_deref() == Some(deactivated) {
                out.force_apply = true;
            }

            for (port, request) in ports {
                let Some(vlan) = request.vlan() else {
                    debug!(connection = %conn, port = %port, "Port request without vlan");
                    continue;
                };
                let vlan = vlan.as_u16();
                if request.params.networkstatus.as_deref() == Some(deactivated) {
                    out.force_apply = true;
                }
                let vendor_port = ctx.port_name(port);
                let tag = request.params.tag.as_ref().or(path.params.tag.as_ref());
                let belongs_to = request
                    .params
                    .belongs_to
                    .as_ref()
                    .or(path.params.belongs_to.as_ref());

                let entry = out
                    .interface
                    .entry(format!("Vlan{}", vlan))
                    .or_insert_with(|| VlanInterface {
                        name: ctx.vlan_interface(port, vlan),
                        vlanid: vlan,
                        vrf: ctx.switch_config.vrf.clone(),
                        mtu: ctx.switch_config.vlan_mtu.unwrap_or(DEFAULT_VLAN_MTU),
                        description: tag.cloned().unwrap_or_else(|| NO_TAG.to_string()),
                        belongs_to: belongs_to
                            .cloned()
                            .unwrap_or_else(|| NO_BELONGS_TO.to_string()),
                        state: Presence::Present,
                        tagged_members: BTreeMap::new(),
                        ipv4_address: BTreeMap::new(),
                        ipv6_address: BTreeMap::new(),
                    });
                entry
                    .tagged_members
                    .insert(vendor_port.clone(), Presence::Present);
                for family in IpFamily::ALL {
                    if let Some(address) = request.has_network_address.get(family) {
                        entry
                            .addresses_mut(family)
                            .insert(normalize_ip(&address.value), Presence::Present);
                    }
                }
                out.ports.push(RenderedPort {
                    uuid: conn.clone(),
                    uuidtype: uuid_type(kind),
                    hostport: vendor_port.clone(),
                });

                if ctx.rate_limited(port) {
                    add_qos(ctx, out, conn, request, &vendor_port, vlan);
                }
            }
        }
    }
}

fn add_qos(
    ctx: &RenderContext<'_>,
    out: &mut DesiredConfig,
    conn: &str,
    request: &srm_types::PortRequest,
    vendor_port: &str,
    vlan: u16,
) {
    let Some(service) = &request.has_service else {
        return;
    };
    let rate = match convert_to_rate(service) {
        Ok(rate) => rate,
        Err(e) => {
            warn!(connection = %conn, error = %e, "Cannot convert requested rate, no QoS entry");
            return;
        }
    };
    if rate.value == 0 {
        return;
    }
    let class = service.class();
    out.qos.insert(
        format!("{}-{}", vendor_port, vlan),
        QosEntry {
            port: vendor_port.to_string(),
            vlan,
            rate: rate.value,
            unit: rate.unit.to_string(),
            qosnumber: ctx.config.qos_number(class),
            qosname: service
                .service_type
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            state: Presence::Present,
        },
    );
}
