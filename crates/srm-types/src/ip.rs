//! IP address, prefix and family types with CIDR arithmetic.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Address family of a request or pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    Ipv4,
    Ipv6,
}

impl IpFamily {
    /// Both families, in processing order.
    pub const ALL: [IpFamily; 2] = [IpFamily::Ipv4, IpFamily::Ipv6];

    /// Returns `"ipv4"` or `"ipv6"`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            IpFamily::Ipv4 => "ipv4",
            IpFamily::Ipv6 => "ipv6",
        }
    }

    /// Key used for a single address of this family (`ipv4-address`).
    pub fn address_key(&self) -> String {
        format!("{}-address", self.as_str())
    }

    /// Key used for a prefix list of this family (`ipv6-prefix-list`).
    pub fn prefix_list_key(&self) -> String {
        format!("{}-prefix-list", self.as_str())
    }

    /// Configuration key of the address pool (`ipv4-address-pool-list`).
    pub fn address_pool_key(&self) -> String {
        format!("{}-address-pool-list", self.as_str())
    }

    /// Configuration key of the subnet pool (`ipv6-subnet-pool-list`).
    pub fn subnet_pool_key(&self) -> String {
        format!("{}-subnet-pool-list", self.as_str())
    }

    /// Maximum prefix length for the family.
    pub const fn max_prefix_len(&self) -> u8 {
        match self {
            IpFamily::Ipv4 => 32,
            IpFamily::Ipv6 => 128,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IpFamily {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ipv4" => Ok(IpFamily::Ipv4),
            "ipv6" => Ok(IpFamily::Ipv6),
            other => Err(ParseError::InvalidEnum {
                kind: "ip family",
                value: other.to_string(),
            }),
        }
    }
}

/// An IPv4 address wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv4Address(Ipv4Addr);

impl Ipv4Address {
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Address(Ipv4Addr::new(a, b, c, d))
    }

    pub const fn inner(&self) -> Ipv4Addr {
        self.0
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0.octets()
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv4Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>()
            .map(Ipv4Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

/// An IPv6 address wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ipv6Address(Ipv6Addr);

impl Ipv6Address {
    pub const fn inner(&self) -> Ipv6Addr {
        self.0
    }

    pub const fn segments(&self) -> [u16; 8] {
        self.0.segments()
    }

    /// Returns true if this is a link-local address (fe80::/10).
    pub fn is_link_local(&self) -> bool {
        let segments = self.segments();
        (segments[0] & 0xffc0) == 0xfe80
    }
}

impl fmt::Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Ipv6Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv6Addr>()
            .map(Ipv6Address)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

/// An IP address that can be either IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpAddress {
    V4(Ipv4Address),
    V6(Ipv6Address),
}

impl IpAddress {
    /// Returns the family of this address.
    pub const fn family(&self) -> IpFamily {
        match self {
            IpAddress::V4(_) => IpFamily::Ipv4,
            IpAddress::V6(_) => IpFamily::Ipv6,
        }
    }

    /// Returns true if this is an IPv4 address.
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    /// Returns true if this is an IPv6 address.
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, IpAddress::V6(_))
    }

    fn to_bits(self) -> u128 {
        match self {
            IpAddress::V4(a) => u128::from(u32::from(a.inner())),
            IpAddress::V6(a) => u128::from(a.inner()),
        }
    }

    fn from_bits(family: IpFamily, bits: u128) -> Self {
        match family {
            IpFamily::Ipv4 => IpAddress::V4(Ipv4Address(Ipv4Addr::from(bits as u32))),
            IpFamily::Ipv6 => IpAddress::V6(Ipv6Address(Ipv6Addr::from(bits))),
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse::<Ipv6Address>().map(IpAddress::V6)
        } else {
            s.parse::<Ipv4Address>().map(IpAddress::V4)
        }
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(Ipv4Address(addr))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(Ipv6Address(addr))
    }
}

/// An IP prefix in CIDR notation (e.g., 10.1.1.2/24 or 2001:db8::/32).
///
/// The address keeps its host bits, so an interface address such as
/// `10.1.1.2/24` prints back unchanged; [`IpPrefix::network`] masks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPrefix {
    address: IpAddress,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddress, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = address.family().max_prefix_len();

        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for address type",
                prefix_len, max_len
            )));
        }

        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    /// Creates a host prefix (/32 or /128) for the address.
    pub fn host(address: IpAddress) -> Self {
        IpPrefix {
            address,
            prefix_len: address.family().max_prefix_len(),
        }
    }

    /// Parses either CIDR notation or a bare address (treated as a host route).
    pub fn parse_lenient(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.contains('/') {
            s.parse()
        } else {
            s.parse::<IpAddress>().map(IpPrefix::host)
        }
    }

    /// Returns the address of this prefix as written.
    pub const fn address(&self) -> &IpAddress {
        &self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns the family of this prefix.
    pub const fn family(&self) -> IpFamily {
        self.address.family()
    }

    /// Returns true if this is a host route (/32 for IPv4, /128 for IPv6).
    pub const fn is_host_route(&self) -> bool {
        self.prefix_len == self.address.family().max_prefix_len()
    }

    fn mask(&self) -> u128 {
        let width = u32::from(self.family().max_prefix_len());
        let host_bits = width - u32::from(self.prefix_len);
        let full = if width == 128 {
            u128::MAX
        } else {
            (1u128 << width) - 1
        };
        if host_bits >= 128 {
            0
        } else {
            (full >> host_bits) << host_bits
        }
    }

    /// Returns the masked network prefix (host bits cleared).
    pub fn network(&self) -> IpPrefix {
        let bits = self.address.to_bits() & self.mask();
        IpPrefix {
            address: IpAddress::from_bits(self.family(), bits),
            prefix_len: self.prefix_len,
        }
    }

    /// Returns the last address in the prefix (the IPv4 broadcast address).
    pub fn broadcast(&self) -> IpAddress {
        let width = u32::from(self.family().max_prefix_len());
        let full = if width == 128 {
            u128::MAX
        } else {
            (1u128 << width) - 1
        };
        let bits = (self.address.to_bits() & self.mask()) | (full & !self.mask());
        IpAddress::from_bits(self.family(), bits)
    }

    /// Returns true if the address lies inside this prefix.
    pub fn contains(&self, addr: &IpAddress) -> bool {
        addr.family() == self.family()
            && (addr.to_bits() & self.mask()) == (self.address.to_bits() & self.mask())
    }

    /// Returns true if `other` is fully inside this prefix.
    pub fn contains_prefix(&self, other: &IpPrefix) -> bool {
        other.prefix_len >= self.prefix_len && self.contains(&other.network().address)
    }

    /// Returns true if the two prefixes share at least one address.
    /// Prefixes of different families never overlap.
    pub fn overlaps(&self, other: &IpPrefix) -> bool {
        if self.family() != other.family() {
            return false;
        }
        let (shorter, longer) = if self.prefix_len <= other.prefix_len {
            (self, other)
        } else {
            (other, self)
        };
        shorter.contains(&longer.address)
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddress = addr_str.parse()?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn p(s: &str) -> IpPrefix {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv6_link_local() {
        let link_local: Ipv6Address = "fe80::1".parse().unwrap();
        assert!(link_local.is_link_local());

        let global: Ipv6Address = "2001:db8::1".parse().unwrap();
        assert!(!global.is_link_local());
    }

    #[test]
    fn test_ip_address_family() {
        let v4: IpAddress = "10.0.0.1".parse().unwrap();
        assert_eq!(v4.family(), IpFamily::Ipv4);

        let v6: IpAddress = "::1".parse().unwrap();
        assert_eq!(v6.family(), IpFamily::Ipv6);
    }

    #[test]
    fn test_ip_prefix_keeps_host_bits() {
        let prefix = p("10.1.1.2/24");
        assert_eq!(prefix.to_string(), "10.1.1.2/24");
        assert_eq!(prefix.network().to_string(), "10.1.1.0/24");
        assert_eq!(prefix.broadcast().to_string(), "10.1.1.255");
    }

    #[test]
    fn test_ipv6_network() {
        let prefix = p("2001:db8:1:2::5/64");
        assert_eq!(prefix.network().to_string(), "2001:db8:1:2::/64");
        assert_eq!(
            prefix.broadcast().to_string(),
            "2001:db8:1:2:ffff:ffff:ffff:ffff"
        );
    }

    #[test]
    fn test_contains_pool_boundaries() {
        let pool = p("10.1.1.0/24");
        assert!(pool.contains(&"10.1.1.0".parse().unwrap()));
        assert!(pool.contains(&"10.1.1.255".parse().unwrap()));
        assert!(!pool.contains(&"10.1.2.0".parse().unwrap()));
        assert!(!pool.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_contains_prefix() {
        let pool = p("2001:db8::/48");
        assert!(pool.contains_prefix(&p("2001:db8:0:1::/64")));
        assert!(!pool.contains_prefix(&p("2001:db8::/32")));
    }

    #[test]
    fn test_overlaps() {
        assert!(p("10.1.1.2/24").overlaps(&p("10.1.1.3/24")));
        assert!(p("10.0.0.0/8").overlaps(&p("10.1.1.3/32")));
        assert!(p("10.1.1.3/32").overlaps(&p("10.0.0.0/8")));
        assert!(!p("10.1.1.0/24").overlaps(&p("10.1.2.0/24")));
        assert!(!p("10.1.1.0/24").overlaps(&p("2001:db8::/32")));
    }

    #[test]
    fn test_zero_length_prefix() {
        let any = p("0.0.0.0/0");
        assert!(any.contains(&"192.168.1.1".parse().unwrap()));
        assert_eq!(any.network().to_string(), "0.0.0.0/0");
        let any6 = p("::/0");
        assert!(any6.overlaps(&p("2001:db8::/64")));
    }

    #[test]
    fn test_parse_lenient() {
        assert_eq!(IpPrefix::parse_lenient("10.0.0.1").unwrap().prefix_len(), 32);
        assert_eq!(IpPrefix::parse_lenient("2001:db8::1").unwrap().prefix_len(), 128);
        assert!(IpPrefix::parse_lenient("not-an-ip").is_err());
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_family_keys() {
        assert_eq!(IpFamily::Ipv4.address_key(), "ipv4-address");
        assert_eq!(IpFamily::Ipv6.prefix_list_key(), "ipv6-prefix-list");
        assert_eq!(IpFamily::Ipv6.subnet_pool_key(), "ipv6-subnet-pool-list");
    }
}
