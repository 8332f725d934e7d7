//! Vendor naming rules.
//!
//! Switches report ports and vlan interfaces with vendor-specific spelling
//! (`Vlan 100` on Dell OS9, `Vlan100` on SONiC, `bvi100` on FreeRTR). The
//! model only carries normalized names, so every rendered config must map
//! the names back through these rules.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Network operating systems the Ansible collections support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Sonic,
    DellOs9,
    Eos,
    FreeRtr,
    NxOs,
}

impl Vendor {
    pub const ALL: [Vendor; 5] = [
        Vendor::Sonic,
        Vendor::DellOs9,
        Vendor::Eos,
        Vendor::FreeRtr,
        Vendor::NxOs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::Sonic => "sonic",
            Vendor::DellOs9 => "dellos9",
            Vendor::Eos => "eos",
            Vendor::FreeRtr => "freertr",
            Vendor::NxOs => "nxos",
        }
    }

    /// Value written as `ansible_network_os` in the host vars.
    pub fn ansible_network_os(&self) -> &'static str {
        match self {
            Vendor::Sonic => "sense.sonic.sonic",
            Vendor::DellOs9 => "sense.dellos9.dellos9",
            Vendor::Eos => "arista.eos.eos",
            Vendor::FreeRtr => "sense.freertr.freertr",
            Vendor::NxOs => "sense.cisconx9.cisconx9",
        }
    }

    /// Task action that carries the facts in the playbook output.
    pub fn facts_module(&self) -> &'static str {
        match self {
            Vendor::Sonic => "sense.sonic.sonic_facts",
            Vendor::DellOs9 => "sense.dellos9.dellos9_facts",
            Vendor::Eos => "arista.eos.eos_facts",
            Vendor::FreeRtr => "sense.freertr.freertr_facts",
            Vendor::NxOs => "sense.cisconx9.cisconx9_facts",
        }
    }

    /// Finds the vendor whose collection owns a facts task action.
    pub fn from_facts_module(action: &str) -> Option<Vendor> {
        Vendor::ALL
            .into_iter()
            .find(|vendor| vendor.facts_module() == action)
    }

    /// Name of the vlan interface for `vlan` as the switch spells it.
    pub fn vlan_interface(&self, vlan: u16) -> String {
        match self {
            Vendor::DellOs9 => format!("Vlan {}", vlan),
            Vendor::FreeRtr => format!("bvi{}", vlan),
            Vendor::Sonic | Vendor::Eos | Vendor::NxOs => format!("Vlan{}", vlan),
        }
    }

    /// True when the vendor name denotes a vlan interface.
    pub fn is_vlan_interface(&self, name: &str) -> bool {
        match self {
            Vendor::FreeRtr => name.starts_with("bvi"),
            _ => vlan_key(name).is_some(),
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        if let Some(vendor) = Vendor::ALL
            .into_iter()
            .find(|v| v.ansible_network_os() == lowered)
        {
            return Ok(vendor);
        }
        match lowered.as_str() {
            "sonic" => Ok(Vendor::Sonic),
            "dellos9" | "dell_os9" | "os9" => Ok(Vendor::DellOs9),
            "eos" | "arista_eos" | "aristaeos" => Ok(Vendor::Eos),
            "freertr" => Ok(Vendor::FreeRtr),
            "nxos" | "cisconx9" | "cisconx" => Ok(Vendor::NxOs),
            _ => Err(BackendError::UnknownVendor(s.to_string())),
        }
    }
}

static VLAN_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:Vlan_|Vlan |Vlan|vlan|bvi)(\d{1,4})$").expect("valid vlan key regex")
});

/// Vlan id encoded in a vlan interface name, whatever the vendor spelling.
pub fn vlan_key(name: &str) -> Option<u16> {
    VLAN_KEY_RE
        .captures(name.trim())
        .and_then(|caps| caps[1].parse().ok())
}

/// Every spelling a vlan interface may be reported with.
pub fn vlan_aliases(vlan: u16) -> [String; 3] {
    [
        format!("Vlan {}", vlan),
        format!("Vlan{}", vlan),
        format!("vlan{}", vlan),
    ]
}

/// Name a vendor port carries inside the model: quotes dropped, `/` and
/// spaces replaced with `_`.
pub fn normalize_port_name(raw: &str) -> String {
    raw.trim()
        .replace(['"', '\''], "")
        .replace(['/', ' '], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network_os() {
        assert_eq!("sonic".parse::<Vendor>().unwrap(), Vendor::Sonic);
        assert_eq!("sense.dellos9.dellos9".parse::<Vendor>().unwrap(), Vendor::DellOs9);
        assert_eq!("arista.eos.eos".parse::<Vendor>().unwrap(), Vendor::Eos);
        assert_eq!("CiscoNX9".parse::<Vendor>().unwrap(), Vendor::NxOs);
        assert!("junos".parse::<Vendor>().is_err());
    }

    #[test]
    fn test_vlan_interface_names() {
        assert_eq!(Vendor::Sonic.vlan_interface(100), "Vlan100");
        assert_eq!(Vendor::DellOs9.vlan_interface(100), "Vlan 100");
        assert_eq!(Vendor::Eos.vlan_interface(100), "Vlan100");
        assert_eq!(Vendor::FreeRtr.vlan_interface(100), "bvi100");
        assert_eq!(Vendor::NxOs.vlan_interface(100), "Vlan100");
    }

    #[test]
    fn test_vlan_key_strips_prefixes() {
        assert_eq!(vlan_key("Vlan_3001"), Some(3001));
        assert_eq!(vlan_key("Vlan 3001"), Some(3001));
        assert_eq!(vlan_key("Vlan3001"), Some(3001));
        assert_eq!(vlan_key("vlan3001"), Some(3001));
        assert_eq!(vlan_key("bvi100"), Some(100));
        assert_eq!(vlan_key("Ethernet0"), None);
        assert_eq!(vlan_key("VlanX"), None);
    }

    #[test]
    fn test_vlan_interface_detection() {
        assert!(Vendor::DellOs9.is_vlan_interface("Vlan 100"));
        assert!(!Vendor::DellOs9.is_vlan_interface("hundredGigE 1/1"));
        assert!(Vendor::FreeRtr.is_vlan_interface("bvi100"));
    }

    #[test]
    fn test_normalize_port_name() {
        assert_eq!(normalize_port_name("hundredGigE 1/1"), "hundredGigE_1_1");
        assert_eq!(normalize_port_name("Port-channel 101"), "Port-channel_101");
        assert_eq!(normalize_port_name("\"Ethernet1/1\""), "Ethernet1_1");
        assert_eq!(normalize_port_name("Ethernet0"), "Ethernet0");
    }

    #[test]
    fn test_facts_module_lookup() {
        for vendor in Vendor::ALL {
            assert_eq!(Vendor::from_facts_module(vendor.facts_module()), Some(vendor));
        }
        assert_eq!(Vendor::from_facts_module("junos_facts"), None);
    }
}
