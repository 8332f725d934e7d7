//! Row types of the persisted tables.
//!
//! Timestamps are UTC epoch seconds. Free-form payloads (facts, service
//! info) are kept as JSON values; the consumers give them a type.

use serde::{Deserialize, Serialize};
use srm_common::ServiceState;
use srm_types::{ActiveDeltas, DeltaState, HostState, ModAdd, TimedState};

/// One published model version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Hash of the N-Triples serialization.
    pub uid: String,
    pub insertdate: i64,
    /// Path of the turtle file; the other forms sit next to it.
    pub fileloc: String,
}

/// Partial update of a delta row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaUpdate {
    pub state: Option<DeltaState>,
    pub modadd: Option<ModAdd>,
    pub error: Option<String>,
    pub updatedate: i64,
}

impl DeltaUpdate {
    pub fn state(state: DeltaState, now: i64) -> Self {
        Self {
            state: Some(state),
            updatedate: now,
            ..Default::default()
        }
    }

    pub fn modadd(modadd: ModAdd, now: i64) -> Self {
        Self {
            modadd: Some(modadd),
            updatedate: now,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, now: i64) -> Self {
        Self {
            state: Some(DeltaState::Failed),
            error: Some(error.into()),
            updatedate: now,
            ..Default::default()
        }
    }
}

/// State of a connection id inside a delta.
pub mod connection_state {
    pub const ACCEPTED: &str = "accepted";
    pub const COMMITTED: &str = "committed";
    pub const ACTIVATED: &str = "activated";
    pub const CANCELLED: &str = "cancelled";
}

/// Link between a delta and one connection id it touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaConnection {
    pub deltaid: String,
    pub connectionid: String,
    pub state: String,
}

/// One entry of a delta's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub deltaid: String,
    pub state: DeltaState,
    pub insertdate: i64,
}

/// A host's view of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStateRecord {
    pub deltaid: String,
    pub hostname: String,
    pub state: HostState,
    pub insertdate: i64,
    pub updatedate: i64,
}

/// Last facts reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub ip: String,
    pub hostname: String,
    pub insertdate: i64,
    pub updatedate: i64,
    pub hostinfo: serde_json::Value,
}

/// Free-form per (host, service) information, e.g. monitoring stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub hostname: String,
    pub servicename: String,
    pub insertdate: i64,
    pub updatedate: i64,
    pub serviceinfo: serde_json::Value,
}

/// Last facts gathered from a switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub sitename: String,
    pub device: String,
    pub insertdate: i64,
    pub updatedate: i64,
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Heartbeat of one service on one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStateRecord {
    pub hostname: String,
    pub servicename: String,
    pub servicestate: ServiceState,
    pub version: String,
    pub runtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exc: Option<String>,
    pub insertdate: i64,
    pub updatedate: i64,
}

/// The single active-deltas row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveDeltasRecord {
    pub insertdate: i64,
    pub updatedate: i64,
    /// Incremented on every write; 0 when the row does not exist yet.
    pub version: i64,
    pub output: ActiveDeltas,
}

/// Fine-grained per (uuid, host, port) status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaTimeState {
    /// Assigned by the store; ignored on insert.
    #[serde(default)]
    pub id: i64,
    pub insertdate: i64,
    pub uuid: String,
    pub uuidtype: String,
    pub hostname: String,
    pub hostport: String,
    pub uuidstate: TimedState,
}

/// Action name asking a service to re-read its configuration.
pub const ACTION_RELOAD: &str = "reload";

/// Control request for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAction {
    #[serde(default)]
    pub id: i64,
    pub hostname: String,
    pub servicename: String,
    pub serviceaction: String,
    pub insertdate: i64,
}

/// Operator override of an instance lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStartEnd {
    #[serde(default)]
    pub id: i64,
    pub instanceid: String,
    pub insertdate: i64,
    pub starttimestamp: i64,
    pub endtimestamp: i64,
}

/// Permission overrides for an authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub permissions: Vec<String>,
    pub disabled: bool,
    pub insertdate: i64,
}

/// Issued refresh token, stored by hash only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token_hash: String,
    pub session_id: String,
    pub subject: String,
    pub permissions: Vec<String>,
    pub expires_at: i64,
    pub revoked: bool,
    pub insertdate: i64,
}

impl RefreshTokenRecord {
    pub fn is_usable(&self, now: i64) -> bool {
        !self.revoked && now < self.expires_at
    }
}
