//! Shell command builders for host vlan interfaces and policy routing.

use srm_common::shell::{self, IP_CMD};
use srm_types::{IpAddress, IpPrefix, VlanId};

/// Create a tagged vlan interface on `parent`
pub fn build_add_vlan_cmd(parent: &str, vlan: VlanId) -> String {
    format!(
        "{} link add link {} name {} type vlan id {}",
        IP_CMD,
        shell::shellquote(parent),
        vlan.interface_name(),
        vlan
    )
}

/// Assign an address; ipv4 addresses also get their broadcast.
pub fn build_add_address_cmd(vlan: VlanId, address: &IpPrefix) -> String {
    match address.address() {
        IpAddress::V4(_) => format!(
            "{} addr add {} broadcast {} dev {}",
            IP_CMD,
            address,
            address.broadcast(),
            vlan.interface_name()
        ),
        IpAddress::V6(_) => format!(
            "{} -6 addr add {} dev {}",
            IP_CMD,
            address,
            vlan.interface_name()
        ),
    }
}

pub fn build_del_address_cmd(vlan: VlanId, address: &IpPrefix) -> String {
    let family = if address.address().is_ipv6() { " -6" } else { "" };
    format!(
        "{}{} addr del {} dev {}",
        IP_CMD,
        family,
        address,
        vlan.interface_name()
    )
}

/// Bring the vlan interface up with its MTU and queue length
pub fn build_vlan_up_cmd(vlan: VlanId, mtu: u32, txqueuelen: u32) -> String {
    format!(
        "{} link set dev {} mtu {} txqueuelen {} up",
        IP_CMD,
        vlan.interface_name(),
        mtu,
        txqueuelen
    )
}

pub fn build_vlan_down_cmd(vlan: VlanId) -> String {
    format!("{} link set dev {} down", IP_CMD, vlan.interface_name())
}

pub fn build_del_vlan_cmd(vlan: VlanId) -> String {
    format!("{} link delete dev {}", IP_CMD, vlan.interface_name())
}

/// List ipv6 policy rules
pub fn build_list_rules_cmd() -> String {
    format!("{} -6 rule list", IP_CMD)
}

/// Add (`add`) or delete (`del`) a rule for traffic towards `to`
pub fn build_rule_to_cmd(action: &str, to: &IpPrefix, table: &str) -> String {
    format!(
        "{} -6 rule {} to {} table {}",
        IP_CMD,
        action,
        to,
        shell::shellquote(table)
    )
}

/// Add (`add`) or delete (`del`) a rule for traffic from `from`
pub fn build_rule_from_cmd(action: &str, from: &IpPrefix, table: &str) -> String {
    format!(
        "{} -6 rule {} from {} table {}",
        IP_CMD,
        action,
        from,
        shell::shellquote(table)
    )
}
