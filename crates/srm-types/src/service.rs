//! Bandwidth service parameters attached to port and route requests.

use crate::activedeltas::ExistsDuring;
use crate::ParseError;
use serde::{Deserialize, Serialize};

/// Output unit for rates in megabits.
pub const RATE_UNIT_MBIT: &str = "mbit";

/// Output unit for rates below one megabit.
pub const RATE_UNIT_BIT: &str = "bit";

/// A `hasService` block: bandwidth request and its own lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceParams {
    #[serde(rename = "availableCapacity", default, skip_serializing_if = "Option::is_none")]
    pub available_capacity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<u64>,
    #[serde(rename = "maximumCapacity", default, skip_serializing_if = "Option::is_none")]
    pub maximum_capacity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u64>,
    #[serde(rename = "reservableCapacity", default, skip_serializing_if = "Option::is_none")]
    pub reservable_capacity: Option<u64>,
    /// Service class: `guaranteedCapped`, `softCapped`, `bestEffort` or vendor specific.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "bwuri", default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(rename = "existsDuring", default, skip_serializing_if = "Option::is_none")]
    pub exists_during: Option<ExistsDuring>,
}

impl ServiceParams {
    /// Default service for requests that did not carry one.
    pub fn best_effort(bandwidth_mbps: u64) -> Self {
        Self {
            service_type: Some("bestEffort".to_string()),
            unit: Some("mbps".to_string()),
            reservable_capacity: Some(bandwidth_mbps),
            ..Default::default()
        }
    }

    /// Service class, defaulting to `bestEffort`.
    pub fn class(&self) -> &str {
        self.service_type.as_deref().unwrap_or("bestEffort")
    }
}

/// A rate understood by the QoS tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rate {
    pub value: u64,
    pub unit: &'static str,
}

impl Rate {
    /// Rate expressed in megabits (sub-megabit rates round down to zero).
    pub fn as_mbit(&self) -> u64 {
        if self.unit == RATE_UNIT_BIT {
            self.value / 1000
        } else {
            self.value
        }
    }
}

/// Converts a service request to a QoS rate.
///
/// `bps` becomes mbit (falling back to `bit` for sub-megabit rates), `mbps`
/// is kept, `gbps` is multiplied by 1000. A service without capacity and
/// unit yields a zero mbit rate.
///
/// # Errors
///
/// Returns an error for an unknown unit.
pub fn convert_to_rate(params: &ServiceParams) -> Result<Rate, ParseError> {
    let value = params.reservable_capacity.unwrap_or(0);
    let unit = match params.unit.as_deref() {
        None if value == 0 => {
            return Ok(Rate {
                value: 0,
                unit: RATE_UNIT_MBIT,
            })
        }
        None => "undef",
        Some(u) => u,
    };
    match unit {
        "bps" => {
            let mbit = value / 1_000_000;
            if mbit == 0 {
                Ok(Rate {
                    value: value / 1000,
                    unit: RATE_UNIT_BIT,
                })
            } else {
                Ok(Rate {
                    value: mbit,
                    unit: RATE_UNIT_MBIT,
                })
            }
        }
        "mbps" => Ok(Rate {
            value,
            unit: RATE_UNIT_MBIT,
        }),
        "gbps" => Ok(Rate {
            value: value * 1000,
            unit: RATE_UNIT_MBIT,
        }),
        other => Err(ParseError::InvalidUnit(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn svc(value: u64, unit: &str) -> ServiceParams {
        ServiceParams {
            reservable_capacity: Some(value),
            unit: Some(unit.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_convert_units() {
        assert_eq!(convert_to_rate(&svc(10, "gbps")).unwrap().value, 10000);
        assert_eq!(convert_to_rate(&svc(500, "mbps")).unwrap().value, 500);
        let rate = convert_to_rate(&svc(2_000_000_000, "bps")).unwrap();
        assert_eq!(rate, Rate { value: 2000, unit: RATE_UNIT_MBIT });
    }

    #[test]
    fn test_convert_sub_megabit() {
        let rate = convert_to_rate(&svc(500_000, "bps")).unwrap();
        assert_eq!(rate, Rate { value: 500, unit: RATE_UNIT_BIT });
        assert_eq!(rate.as_mbit(), 0);
    }

    #[test]
    fn test_convert_empty_service() {
        let rate = convert_to_rate(&ServiceParams::default()).unwrap();
        assert_eq!(rate.value, 0);
        assert_eq!(rate.unit, RATE_UNIT_MBIT);
    }

    #[test]
    fn test_convert_unknown_unit() {
        assert!(convert_to_rate(&svc(1, "furlongs")).is_err());
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(ServiceParams::best_effort(1000)).unwrap();
        assert_eq!(json["type"], "bestEffort");
        assert_eq!(json["reservableCapacity"], 1000);
        assert_eq!(json["unit"], "mbps");
    }
}
