//! `/api/{site}/*`: endpoints polled and fed by the host agents and the
//! frontend's own services.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use srm_common::{now_epoch, ServiceState, SrmError};
use srm_store::{HostRecord, InstanceStartEnd, ServiceAction, ServiceRecord, ServiceStateRecord};
use srm_types::HostFacts;
use tracing::{debug, info, instrument, warn};

use super::{ApiResult, AppState};

/// Service name under which monitoring stats are kept per host.
pub const MONITORING_SERVICE: &str = "MonitoringStats";

/// Longest exception text kept in the service state table.
const MAX_EXC_LEN: usize = 4096;

/// Wildcard accepted for hostname and servicename in service actions.
const ALL: &str = "ALL";

/// `GET /api/{site}/frontend/activedeltas`
pub async fn active_deltas(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> ApiResult<Json<Value>> {
    state.check_site(&site)?;
    let record = state.store.get_active_deltas().await?;
    Ok(Json(json!({
        "insertdate": record.insertdate,
        "updatedate": record.updatedate,
        "output": record.output,
    })))
}

fn as_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// Capacity an agent declares for `interface`: `maximumCapacity`, else the
/// `bwParams.maxReservableCapacity` of the interface.
fn interface_capacity(config: &Value, interface: &str) -> Option<u64> {
    let intf = config.get("interfaces")?.get(interface)?;
    intf.get("maximumCapacity")
        .and_then(Value::as_u64)
        .or_else(|| {
            intf.get("bwParams")?
                .get("maxReservableCapacity")
                .and_then(Value::as_u64)
        })
}

/// Sums the capacity of every QoS range over the agent summaries.
pub fn qos_totals(hosts: &[HostRecord]) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    for host in hosts {
        let facts: HostFacts = match serde_json::from_value(host.hostinfo.clone()) {
            Ok(facts) => facts,
            Err(e) => {
                warn!(host = %host.hostname, error = %e, "Unreadable host facts");
                continue;
            }
        };
        let Some(summary) = facts.summary else {
            continue;
        };
        let config = &summary.config;
        let Some(interfaces) = config
            .get("qos")
            .and_then(|q| q.get("interfaces"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        for (name, intf) in interfaces {
            let Some(master) = intf.get("master_intf").and_then(Value::as_str) else {
                continue;
            };
            let Some(capacity) = interface_capacity(config, master) else {
                warn!(
                    host = %host.hostname,
                    qos_interface = %name,
                    master = %master,
                    "QoS interface points at an interface without capacity"
                );
                continue;
            };
            for key in ["ipv4_range", "ipv6_range"] {
                for range in as_list(intf.get(key)) {
                    *out.entry(range).or_insert(0) += capacity;
                }
            }
        }
    }
    out
}

/// `GET /api/{site}/frontend/qosdata`: range → total declared capacity.
pub async fn qos_data(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> ApiResult<Json<BTreeMap<String, u64>>> {
    state.check_site(&site)?;
    let hosts = state.store.list_hosts().await?;
    Ok(Json(qos_totals(&hosts)))
}

#[derive(Debug, Default, Deserialize)]
pub struct HostQuery {
    pub hostname: Option<String>,
    #[serde(default)]
    pub details: bool,
}

/// `GET /api/{site}/hosts`
pub async fn list_hosts(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Query(query): Query<HostQuery>,
) -> ApiResult<Json<Vec<Value>>> {
    state.check_site(&site)?;
    let hosts = match &query.hostname {
        Some(name) => state.store.get_host(name).await?.into_iter().collect(),
        None => state.store.list_hosts().await?,
    };
    let out = hosts
        .into_iter()
        .map(|host| {
            let mut entry = json!({
                "hostname": host.hostname,
                "ip": host.ip,
                "insertdate": host.insertdate,
                "updatedate": host.updatedate,
            });
            if query.details {
                entry["hostinfo"] = host.hostinfo;
            }
            entry
        })
        .collect();
    Ok(Json(out))
}

/// Identity fields every host report carries; the full body is kept as the
/// host's facts.
#[derive(Debug, Deserialize)]
struct HostIdentity {
    hostname: String,
    ip: String,
    #[serde(default)]
    nodatachange: bool,
}

fn host_identity(body: &Value) -> ApiResult<HostIdentity> {
    let identity: HostIdentity = serde_json::from_value(body.clone())
        .map_err(|e| SrmError::bad_request(format!("host report: {}", e)))?;
    if identity.hostname.is_empty() || identity.ip.is_empty() {
        return Err(SrmError::bad_request("host report needs hostname and ip").into());
    }
    Ok(identity)
}

/// `POST /api/{site}/hosts`: registers a new host.
#[instrument(skip_all)]
pub async fn add_host(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    state.check_site(&site)?;
    let identity = host_identity(&body)?;
    if state.store.get_host(&identity.hostname).await?.is_some() {
        return Err(SrmError::bad_request(format!(
            "host {} is already registered, use PUT to update it",
            identity.hostname
        ))
        .into());
    }
    let now = now_epoch();
    state
        .store
        .upsert_host(&HostRecord {
            ip: identity.ip,
            hostname: identity.hostname.clone(),
            insertdate: now,
            updatedate: now,
            hostinfo: body,
        })
        .await?;
    info!(host = %identity.hostname, "Registered host");
    Ok(Json(json!({ "Status": "ADDED" })))
}

/// `PUT /api/{site}/hosts`: refreshes the facts of a known host.
#[instrument(skip_all)]
pub async fn update_host(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    state.check_site(&site)?;
    let identity = host_identity(&body)?;
    let mut record = state
        .store
        .get_host(&identity.hostname)
        .await?
        .ok_or_else(|| SrmError::not_found("host", &identity.hostname))?;
    record.updatedate = now_epoch();
    if !identity.nodatachange {
        record.ip = identity.ip;
        record.hostinfo = body;
    }
    state.store.upsert_host(&record).await?;
    debug!(host = %identity.hostname, nodatachange = identity.nodatachange, "Updated host");
    Ok(Json(json!({ "status": "UPDATED" })))
}

#[derive(Debug, Deserialize)]
pub struct StatsReport {
    pub hostname: String,
    #[serde(default)]
    pub output: Value,
}

/// `GET /api/{site}/monitoring/stats`
pub async fn list_stats(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> ApiResult<Json<Vec<Value>>> {
    state.check_site(&site)?;
    let out = state
        .store
        .list_services(None)
        .await?
        .into_iter()
        .filter(|s| s.servicename == MONITORING_SERVICE)
        .map(|s| {
            json!({
                "hostname": s.hostname,
                "insertdate": s.insertdate,
                "updatedate": s.updatedate,
                "output": s.serviceinfo,
            })
        })
        .collect();
    Ok(Json(out))
}

/// `POST /api/{site}/monitoring/stats`
pub async fn record_stats(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Json(report): Json<StatsReport>,
) -> ApiResult<Json<Value>> {
    state.check_site(&site)?;
    let now = now_epoch();
    let existing = state
        .store
        .list_services(Some(&report.hostname))
        .await?
        .into_iter()
        .find(|s| s.servicename == MONITORING_SERVICE);
    let status = if existing.is_some() { "UPDATED" } else { "INSERTED" };
    state
        .store
        .upsert_service(&ServiceRecord {
            hostname: report.hostname,
            servicename: MONITORING_SERVICE.to_string(),
            insertdate: existing.map_or(now, |s| s.insertdate),
            updatedate: now,
            serviceinfo: report.output,
        })
        .await?;
    Ok(Json(json!({ "Status": status })))
}

/// `GET /api/{site}/servicestates`: newest heartbeats first.
pub async fn list_service_states(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> ApiResult<Json<Vec<ServiceStateRecord>>> {
    state.check_site(&site)?;
    let mut states = state.store.list_service_states().await?;
    states.sort_by(|a, b| b.updatedate.cmp(&a.updatedate));
    Ok(Json(states))
}

#[derive(Debug, Deserialize)]
pub struct ServiceStateReport {
    pub hostname: String,
    pub servicename: String,
    pub servicestate: ServiceState,
    #[serde(default = "default_runtime")]
    pub runtime: i64,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub exc: Option<String>,
}

fn default_runtime() -> i64 {
    -1
}

fn default_version() -> String {
    "UNSET".to_string()
}

fn truncate(text: String) -> String {
    if text.len() <= MAX_EXC_LEN {
        return text;
    }
    let mut end = MAX_EXC_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// `POST /api/{site}/servicestates`
pub async fn record_service_state(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Json(report): Json<ServiceStateReport>,
) -> ApiResult<Json<Value>> {
    state.check_site(&site)?;
    let now = now_epoch();
    let insertdate = state
        .store
        .list_service_states()
        .await?
        .into_iter()
        .find(|s| s.hostname == report.hostname && s.servicename == report.servicename)
        .map_or(now, |s| s.insertdate);
    state
        .store
        .upsert_service_state(&ServiceStateRecord {
            hostname: report.hostname,
            servicename: report.servicename,
            servicestate: report.servicestate,
            version: report.version,
            runtime: report.runtime,
            exc: report.exc.map(truncate),
            insertdate,
            updatedate: now,
        })
        .await?;
    Ok(Json(json!({ "Status": "Updated" })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceActionQuery {
    pub hostname: Option<String>,
    pub servicename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceActionRequest {
    pub hostname: String,
    pub servicename: String,
    pub action: String,
}

/// `GET /api/{site}/serviceaction`: 404 when nothing is pending.
pub async fn list_service_actions(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Query(query): Query<ServiceActionQuery>,
) -> ApiResult<Json<Vec<ServiceAction>>> {
    state.check_site(&site)?;
    let actions = state
        .store
        .service_actions(query.hostname.as_deref(), query.servicename.as_deref())
        .await?;
    if actions.is_empty() {
        return Err(SrmError::not_found("service action", query.hostname.unwrap_or_default()).into());
    }
    Ok(Json(actions))
}

/// `POST /api/{site}/serviceaction`: queues an action for every running
/// service matching the request. `ALL` matches any host or service.
#[instrument(skip(state))]
pub async fn record_service_action(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Json(request): Json<ServiceActionRequest>,
) -> ApiResult<Json<Value>> {
    state.check_site(&site)?;
    if request.action.is_empty() {
        return Err(SrmError::bad_request("service action must not be empty").into());
    }
    let now = now_epoch();
    let mut recorded = Vec::new();
    for running in state.store.list_service_states().await? {
        let host_matches = request.hostname == ALL || running.hostname == request.hostname;
        let service_matches =
            request.servicename == ALL || running.servicename == request.servicename;
        if !(host_matches && service_matches) {
            continue;
        }
        let action = ServiceAction {
            id: 0,
            hostname: running.hostname,
            servicename: running.servicename,
            serviceaction: request.action.clone(),
            insertdate: now,
        };
        state.store.insert_service_action(&action).await?;
        recorded.push(action);
    }
    if recorded.is_empty() {
        return Err(SrmError::bad_request(format!(
            "no running service matches {}/{}",
            request.hostname, request.servicename
        ))
        .into());
    }
    info!(count = recorded.len(), action = %request.action, "Recorded service actions");
    Ok(Json(json!({ "Status": "Recorded", "DB": recorded })))
}

/// `DELETE /api/{site}/serviceaction?hostname=..[&servicename=..]`
pub async fn delete_service_actions(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Query(query): Query<ServiceActionQuery>,
) -> ApiResult<Json<Value>> {
    state.check_site(&site)?;
    let Some(hostname) = query.hostname.as_deref().filter(|h| !h.is_empty()) else {
        return Err(SrmError::bad_request("hostname is required").into());
    };
    let deleted = state
        .store
        .delete_service_actions(hostname, query.servicename.as_deref())
        .await?;
    if deleted == 0 {
        return Err(SrmError::not_found("service action", hostname).into());
    }
    Ok(Json(json!({ "Status": "Deleted", "count": deleted })))
}

#[derive(Debug, Deserialize)]
pub struct InstanceStartEndRequest {
    pub instanceid: String,
    pub starttimestamp: i64,
    pub endtimestamp: i64,
}

/// `POST /api/{site}/setinstancestartend`: overrides the lifetime of an
/// active instance on the next policy cycle.
#[instrument(skip(state))]
pub async fn set_instance_start_end(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Json(request): Json<InstanceStartEndRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    state.check_site(&site)?;
    if request.starttimestamp >= request.endtimestamp {
        return Err(SrmError::bad_request("starttimestamp must be before endtimestamp").into());
    }
    let active = state.store.get_active_deltas().await?.output;
    if !active.vsw.contains_key(&request.instanceid) && !active.rst.contains_key(&request.instanceid) {
        return Err(SrmError::not_found("instance", &request.instanceid).into());
    }
    state
        .store
        .insert_instance_override(&InstanceStartEnd {
            id: 0,
            instanceid: request.instanceid.clone(),
            insertdate: now_epoch(),
            starttimestamp: request.starttimestamp,
            endtimestamp: request.endtimestamp,
        })
        .await?;
    info!(instance = %request.instanceid, "Recorded lifetime override");
    Ok((StatusCode::OK, Json(json!({ "Status": "Recorded" }))))
}
