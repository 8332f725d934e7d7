//! VLAN ID and VLAN range types with validation.

use crate::ParseError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// IEEE 802.1Q VLAN identifier (1-4094).
///
/// VLAN 0 and 4095 are reserved and rejected.
///
/// # Examples
///
/// ```
/// use srm_types::VlanId;
///
/// let vlan = VlanId::new(3001).unwrap();
/// assert_eq!(vlan.as_u16(), 3001);
///
/// assert!(VlanId::new(0).is_err());
/// assert!(VlanId::new(4095).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    /// Minimum valid VLAN ID.
    pub const MIN: u16 = 1;

    /// Maximum valid VLAN ID.
    pub const MAX: u16 = 4094;

    /// Creates a new VLAN ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the VLAN ID is not in the valid range (1-4094).
    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id >= Self::MIN && id <= Self::MAX {
            Ok(VlanId(id))
        } else {
            Err(ParseError::InvalidVlanId(id))
        }
    }

    /// Returns the VLAN ID as a u16.
    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Name of the host sub-interface carrying this vlan (`vlan.<id>`).
    pub fn interface_name(&self) -> String {
        format!("vlan.{}", self.0)
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VlanId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Handle "Vlan100", "vlan.100" and "Vlan 100" formats
        let trimmed = s.trim();
        let id_str = if trimmed.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("vlan")) {
            trimmed[4..].trim_start_matches(['.', ' ', '_'])
        } else {
            trimmed
        };

        let id: u16 = id_str.parse().map_err(|_| ParseError::InvalidVlanId(0))?;

        VlanId::new(id)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}

/// A configured set of allowed vlans, e.g. `"3600-3619,3700"`.
///
/// Serialized in the compact comma/dash form. Deserializes from that form,
/// from a YAML/JSON list of ids or range strings, or from a single integer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VlanRange(BTreeSet<VlanId>);

impl VlanRange {
    /// Creates an empty range.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no vlans are configured.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of vlans in the range.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the vlan is part of the range.
    pub fn contains(&self, vlan: VlanId) -> bool {
        self.0.contains(&vlan)
    }

    /// Adds a single vlan.
    pub fn insert(&mut self, vlan: VlanId) {
        self.0.insert(vlan);
    }

    /// Iterates vlans in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = VlanId> + '_ {
        self.0.iter().copied()
    }

    fn push_item(&mut self, item: &str) -> Result<(), ParseError> {
        let item = item.trim();
        if item.is_empty() {
            return Ok(());
        }
        match item.split_once('-') {
            Some((lo, hi)) => {
                let lo: VlanId = lo.parse()?;
                let hi: VlanId = hi.parse()?;
                if lo > hi {
                    return Err(ParseError::InvalidVlanRange(item.to_string()));
                }
                for id in lo.as_u16()..=hi.as_u16() {
                    self.0.insert(VlanId(id));
                }
            }
            None => {
                self.0.insert(item.parse()?);
            }
        }
        Ok(())
    }
}

impl fmt::Display for VlanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        let mut iter = self.0.iter().map(|v| v.as_u16()).peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if start == end {
                parts.push(start.to_string());
            } else {
                parts.push(format!("{}-{}", start, end));
            }
        }
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for VlanRange {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut range = VlanRange::new();
        for item in s.split(',') {
            range.push_item(item)?;
        }
        Ok(range)
    }
}

impl FromIterator<VlanId> for VlanRange {
    fn from_iter<I: IntoIterator<Item = VlanId>>(iter: I) -> Self {
        VlanRange(iter.into_iter().collect())
    }
}

impl Serialize for VlanRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRangeItem {
    Int(u16),
    Str(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRange {
    One(RawRangeItem),
    Many(Vec<RawRangeItem>),
}

impl<'de> Deserialize<'de> for VlanRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = match RawRange::deserialize(deserializer)? {
            RawRange::One(item) => vec![item],
            RawRange::Many(items) => items,
        };
        let mut range = VlanRange::new();
        for item in items {
            let res = match item {
                RawRangeItem::Int(id) => VlanId::new(id).map(|v| range.insert(v)),
                RawRangeItem::Str(s) => s.split(',').try_for_each(|i| range.push_item(i)),
            };
            res.map_err(serde::de::Error::custom)?;
        }
        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_valid_vlan_ids() {
        assert!(VlanId::new(1).is_ok());
        assert!(VlanId::new(3001).is_ok());
        assert!(VlanId::new(4094).is_ok());
    }

    #[test]
    fn test_invalid_vlan_ids() {
        assert!(VlanId::new(0).is_err());
        assert!(VlanId::new(4095).is_err());
        assert!(VlanId::new(65535).is_err());
    }

    #[test]
    fn test_parse_vlan_prefix() {
        let vlan: VlanId = "Vlan100".parse().unwrap();
        assert_eq!(vlan.as_u16(), 100);

        let vlan2: VlanId = "vlan.3001".parse().unwrap();
        assert_eq!(vlan2.as_u16(), 3001);

        let vlan3: VlanId = "Vlan 200".parse().unwrap();
        assert_eq!(vlan3.as_u16(), 200);
    }

    #[test]
    fn test_deserialize_rejects_reserved() {
        assert!(serde_json::from_str::<VlanId>("0").is_err());
        assert!(serde_json::from_str::<VlanId>("4095").is_err());
        assert_eq!(serde_json::from_str::<VlanId>("4094").unwrap().as_u16(), 4094);
    }

    #[test]
    fn test_interface_name() {
        assert_eq!(VlanId::new(3001).unwrap().interface_name(), "vlan.3001");
    }

    #[test]
    fn test_range_parse_and_display() {
        let range: VlanRange = "3600-3603, 3610".parse().unwrap();
        assert_eq!(range.len(), 5);
        assert!(range.contains(VlanId::new(3602).unwrap()));
        assert!(!range.contains(VlanId::new(3604).unwrap()));
        assert_eq!(range.to_string(), "3600-3603,3610");
    }

    #[test]
    fn test_range_rejects_inverted() {
        assert!("3610-3600".parse::<VlanRange>().is_err());
    }

    #[test]
    fn test_range_deserialize_forms() {
        let from_str: VlanRange = serde_json::from_str(r#""100-102""#).unwrap();
        let from_list: VlanRange = serde_json::from_str(r#"[100, "101-102"]"#).unwrap();
        let from_int: VlanRange = serde_json::from_str("100").unwrap();
        assert_eq!(from_str, from_list);
        assert_eq!(from_int.to_string(), "100");
        assert_eq!(serde_json::to_string(&from_list).unwrap(), r#""100-102""#);
    }
}
