//! Pruning of configuration the device runs but no longer should.
//!
//! Both functions work on the YAML documents handed to the backend, so the
//! rules hold for every section alike:
//!
//! - a scalar `present` missing from the new document becomes `absent`
//! - a mapping with a `state` key missing from the new document is copied
//!   with `state: absent`
//! - other mappings recurse
//! - other scalars missing from the new document are carried over

use serde_yaml::{Mapping, Value};

const STATE: &str = "state";
const PRESENT: &str = "present";
const ABSENT: &str = "absent";

fn is_absent(value: &Value) -> bool {
    match value {
        Value::String(s) => s == ABSENT,
        Value::Mapping(map) => map.get(STATE).and_then(Value::as_str) == Some(ABSENT),
        _ => false,
    }
}

/// Marks everything `running` has and `new` lacks as absent in `new`.
pub fn mark_absent(new: &mut Mapping, running: &Mapping) {
    if new == running {
        return;
    }
    for (key, old) in running {
        if is_absent(old) {
            continue;
        }
        match old {
            Value::Mapping(old_map) => match new.get_mut(key) {
                Some(Value::Mapping(new_map)) => mark_absent(new_map, old_map),
                Some(_) => {}
                None if old_map.contains_key(STATE) => {
                    let mut gone = old_map.clone();
                    gone.insert(Value::from(STATE), Value::from(ABSENT));
                    new.insert(key.clone(), Value::Mapping(gone));
                }
                None => {
                    let mut nested = Mapping::new();
                    mark_absent(&mut nested, old_map);
                    if !nested.is_empty() {
                        new.insert(key.clone(), Value::Mapping(nested));
                    }
                }
            },
            Value::String(s) if s == PRESENT => {
                if !new.contains_key(key) {
                    new.insert(key.clone(), Value::from(ABSENT));
                }
            }
            other => {
                if !new.contains_key(key) {
                    new.insert(key.clone(), other.clone());
                }
            }
        }
    }
}

/// Drops absent entries from an applied document, so it can be stored as
/// what the device runs. Mappings left empty are kept, they match the next
/// rendering of the same section.
pub fn strip_absent(doc: &mut Mapping) {
    let keys: Vec<Value> = doc.keys().cloned().collect();
    for key in keys {
        let Some(value) = doc.get_mut(&key) else {
            continue;
        };
        if is_absent(value) {
            doc.remove(&key);
            continue;
        }
        if let Value::Mapping(nested) = value {
            strip_absent(nested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn yaml(text: &str) -> Mapping {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_equal_documents_untouched() {
        let running = yaml("interface:\n  Vlan3001:\n    vlanid: 3001\n    state: present\n");
        let mut new = running.clone();
        mark_absent(&mut new, &running);
        assert_eq!(new, running);
    }

    #[test]
    fn test_removed_interface_marked_absent() {
        let running = yaml(
            r#"
interface:
  Vlan3001:
    name: Vlan3001
    vlanid: 3001
    state: present
    tagged_members:
      Ethernet0: present
  Vlan3002:
    name: Vlan3002
    vlanid: 3002
    state: present
"#,
        );
        let mut new = yaml(
            r#"
interface:
  Vlan3001:
    name: Vlan3001
    vlanid: 3001
    state: present
    tagged_members:
      Ethernet4: present
"#,
        );
        mark_absent(&mut new, &running);
        let expected = yaml(
            r#"
interface:
  Vlan3001:
    name: Vlan3001
    vlanid: 3001
    state: present
    tagged_members:
      Ethernet4: present
      Ethernet0: absent
  Vlan3002:
    name: Vlan3002
    vlanid: 3002
    state: absent
"#,
        );
        assert_eq!(new, expected);
    }

    #[test]
    fn test_nested_maps_without_state_recurse() {
        let running = yaml(
            r#"
sense_bgp:
  asn: 65000
  state: present
  route_map:
    ipv6:
      sense-abc-mapin:
        10:
          sense-abc-from: present
"#,
        );
        let mut new = yaml("sense_bgp:\n  asn: 65000\n  state: present\n");
        mark_absent(&mut new, &running);
        let maps = &new["sense_bgp"]["route_map"]["ipv6"]["sense-abc-mapin"][10];
        assert_eq!(maps["sense-abc-from"], Value::from("absent"));
    }

    #[test]
    fn test_already_absent_entries_not_carried() {
        let running = yaml("interface:\n  Vlan3002:\n    vlanid: 3002\n    state: absent\n");
        let mut new = yaml("interface: {}\n");
        mark_absent(&mut new, &running);
        assert_eq!(new, yaml("interface: {}\n"));
    }

    #[test]
    fn test_strip_absent() {
        let mut doc = yaml(
            r#"
interface:
  Vlan3001:
    vlanid: 3001
    state: present
    tagged_members:
      Ethernet0: absent
      Ethernet4: present
  Vlan3002:
    vlanid: 3002
    state: absent
qos: {}
"#,
        );
        strip_absent(&mut doc);
        let expected = yaml(
            r#"
interface:
  Vlan3001:
    vlanid: 3001
    state: present
    tagged_members:
      Ethernet4: present
qos: {}
"#,
        );
        assert_eq!(doc, expected);
    }
}
