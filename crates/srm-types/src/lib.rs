//! Common Site Resource Manager types.
//!
//! This crate provides the typed data model shared by the frontend control
//! plane and the host agents:
//!
//! - [`VlanId`], [`VlanRange`]: IEEE 802.1Q identifiers and configured ranges
//! - [`IpAddress`], [`IpPrefix`], [`IpFamily`]: addresses, CIDR math, families
//! - [`ActiveDeltas`]: the authoritative document of approved requested state
//! - [`Delta`] and the lifecycle enums ([`DeltaState`], [`ModAdd`], ...)
//! - [`SwitchFacts`], [`HostFacts`]: last-known pictures of devices
//! - [`ServiceParams`]: bandwidth service requests and rate conversion

mod activedeltas;
mod delta;
mod facts;
mod ip;
mod service;
mod vlan;

pub use activedeltas::{
    ActiveDeltas, ExistsDuring, Label, NetworkAddresses, NetworkAddress, Params, PortRequest,
    Route, RouteEntry, RouteValue, RoutedPath, RoutingMapping, SubnetMapping, SwitchedPath,
    SwitchedKind, DEFAULT_LABEL_TYPE, MAX_TIMESTAMP,
};
pub use delta::{
    aggregate_timed_states, Delta, DeltaState, DeltaType, HostState, ModAdd, TimedState,
};
pub use facts::{
    ArpEntry, BwParams, CertInfo, HostFacts, InterfaceInfo, KubeInfo, LldpData, NetInfo,
    PortData, RouteData, Summary, SwitchFacts, VlanData,
};
pub use ip::{IpAddress, IpFamily, IpPrefix, Ipv4Address, Ipv6Address};
pub use service::{convert_to_rate, Rate, ServiceParams, RATE_UNIT_BIT, RATE_UNIT_MBIT};
pub use vlan::{VlanId, VlanRange};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid VLAN range: {0}")]
    InvalidVlanRange(String),

    #[error("invalid {kind}: {value}")]
    InvalidEnum {
        /// The enum being parsed (e.g. "delta state").
        kind: &'static str,
        /// The rejected input.
        value: String,
    },

    #[error("unknown bandwidth unit: {0}")]
    InvalidUnit(String),
}
