//! `/sitefe/v1/deltas*`: submission, lookup, commit and state history,
//! overall and per host.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use srm_common::timing::{http_date, parse_http_date};
use srm_common::{now_epoch, SrmError};
use srm_model::{DeltaContent, Graph, ModelFormat};
use srm_policy::DeltaSubmission;
use srm_store::{DeltaTimeState, HostStateRecord};
use srm_types::{Delta, TimedState};
use tracing::{info, instrument};

use super::{ApiResult, AppState};
use crate::lookup::model_path;

/// Listing of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub id: String,
    #[serde(rename = "lastModified")]
    pub last_modified: String,
    pub state: String,
    pub href: String,
    #[serde(rename = "modelId")]
    pub model_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeltaQuery {
    pub summary: Option<bool>,
    pub encode: Option<bool>,
}

pub fn delta_href(webdomain: &str, uid: &str) -> String {
    format!("{}/sitefe/v1/deltas/{}", webdomain.trim_end_matches('/'), uid)
}

fn summarize(webdomain: &str, delta: &Delta) -> DeltaSummary {
    DeltaSummary {
        id: delta.uid.clone(),
        last_modified: http_date(delta.updatedate),
        state: delta.state.to_string(),
        href: delta_href(webdomain, &delta.uid),
        model_id: delta.modelid.clone(),
    }
}

/// Summary plus the fragments, base64 encoded when `encode` is set.
fn expand(webdomain: &str, delta: &Delta, encode: bool) -> ApiResult<Value> {
    let mut value = serde_json::to_value(summarize(webdomain, delta))?;
    let content = DeltaContent::from_json(&delta.content).unwrap_or_default();
    let render = |text: Option<String>| {
        text.map(|t| if encode { STANDARD.encode(t) } else { t })
    };
    value["addition"] = json!(render(content.addition));
    value["reduction"] = json!(render(content.reduction));
    value["insertdate"] = json!(delta.insertdate);
    value["updatedate"] = json!(delta.updatedate);
    if let Some(error) = &delta.error {
        value["error"] = json!(error);
    }
    Ok(value)
}

fn if_modified_since(headers: &HeaderMap) -> ApiResult<Option<i64>> {
    match headers.get(header::IF_MODIFIED_SINCE) {
        Some(value) => {
            let text = value
                .to_str()
                .map_err(|e| SrmError::bad_request(format!("If-Modified-Since: {}", e)))?;
            Ok(Some(parse_http_date(text)?))
        }
        None => Ok(None),
    }
}

/// `GET /sitefe/v1/deltas`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<DeltaQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Value>>> {
    let (config, _) = state.primary_site()?;
    let since = if_modified_since(&headers)?;
    let summary = query.summary.unwrap_or(true);
    let encode = query.encode.unwrap_or(true);
    let mut out = Vec::new();
    for delta in state.store.list_deltas().await? {
        if since.is_some_and(|t| delta.updatedate < t) {
            continue;
        }
        out.push(if summary {
            serde_json::to_value(summarize(&config.general.webdomain, &delta))?
        } else {
            expand(&config.general.webdomain, &delta, encode)?
        });
    }
    Ok(Json(out))
}

/// `GET /sitefe/v1/deltas/{id}`
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeltaQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let (config, _) = state.primary_site()?;
    let delta = state
        .store
        .get_delta(&id)
        .await?
        .ok_or_else(|| SrmError::not_found("delta", &id))?;
    let last_modified = [(header::LAST_MODIFIED, http_date(delta.updatedate))];
    if if_modified_since(&headers)?.is_some_and(|t| delta.updatedate < t) {
        return Ok((StatusCode::NOT_MODIFIED, last_modified).into_response());
    }
    let body = if query.summary.unwrap_or(false) {
        serde_json::to_value(summarize(&config.general.webdomain, &delta))?
    } else {
        expand(
            &config.general.webdomain,
            &delta,
            query.encode.unwrap_or(true),
        )?
    };
    Ok((last_modified, Json(body)).into_response())
}

/// Graph of the latest published model.
async fn latest_graph(state: &AppState) -> ApiResult<(String, Graph)> {
    let latest = state
        .store
        .latest_model()
        .await?
        .ok_or_else(|| SrmError::not_found("model", "latest"))?;
    let path = model_path(&latest, ModelFormat::Turtle);
    let text = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| SrmError::io(path.display().to_string(), e))?;
    Ok((latest.uid, ModelFormat::Turtle.parse(&text)?))
}

/// `POST /sitefe/v1/deltas`
#[instrument(skip_all)]
pub async fn submit(
    State(state): State<AppState>,
    Json(mut submission): Json<DeltaSubmission>,
) -> ApiResult<Response> {
    let (config, _) = state.primary_site()?;
    let (latest_uid, graph) = latest_graph(&state).await?;
    if submission.model_id.trim().is_empty() {
        submission.model_id = latest_uid;
    } else if submission.model_id != latest_uid {
        info!(
            requested = %submission.model_id,
            latest = %latest_uid,
            "Delta refers to an older model, validating against the latest"
        );
    }
    let delta = state
        .policy()?
        .accept_delta(&submission, &graph, now_epoch())
        .await?;
    let summary = summarize(&config.general.webdomain, &delta);
    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

/// `PUT /sitefe/v1/deltas/{id}/actions/{action}`
#[instrument(skip(state))]
pub async fn action(
    State(state): State<AppState>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let now = now_epoch();
    match action.as_str() {
        "commit" => state.policy()?.commit(&id, false, now).await?,
        "forcecommit" => state.policy()?.commit(&id, true, now).await?,
        "forceapply" => {
            if state.store.get_delta(&id).await?.is_none() {
                return Err(SrmError::not_found("delta", &id).into());
            }
            state.store.insert_force_apply(&id).await?;
        }
        other => {
            return Err(SrmError::bad_request(format!(
                "Unknown action '{}', expected commit, forcecommit or forceapply",
                other
            ))
            .into())
        }
    }
    info!("Delta action completed");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /sitefe/v1/deltastates/{id}`
pub async fn states(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.store.get_delta(&id).await?.is_none() {
        return Err(SrmError::not_found("delta", &id).into());
    }
    let history = state.store.delta_states(&id).await?;
    Ok(Json(serde_json::to_value(history)?))
}

/// `GET /sitefe/v1/deltahoststates/{id}`
pub async fn host_states(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<HostStateRecord>>> {
    if state.store.get_delta(&id).await?.is_none() {
        return Err(SrmError::not_found("delta", &id).into());
    }
    Ok(Json(state.store.host_states(&id).await?))
}

/// `GET /sitefe/v1/deltahoststateshistory/{id}`
pub async fn host_state_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<HostStateRecord>>> {
    if state.store.get_delta(&id).await?.is_none() {
        return Err(SrmError::not_found("delta", &id).into());
    }
    Ok(Json(state.store.host_state_history(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct TimeStateQuery {
    pub uuid: Option<String>,
}

/// `GET /sitefe/v1/deltatimestates`
pub async fn time_states(
    State(state): State<AppState>,
    Query(query): Query<TimeStateQuery>,
) -> ApiResult<Json<Vec<DeltaTimeState>>> {
    let states = match query.uuid {
        Some(uuid) => state.store.delta_time_states(&uuid).await?,
        None => state.store.list_delta_time_states().await?,
    };
    Ok(Json(states))
}

/// Body of a per-port state report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStateReport {
    pub uuid: String,
    pub uuidtype: String,
    pub hostname: String,
    pub hostport: String,
    pub uuidstate: TimedState,
    #[serde(default)]
    pub insertdate: Option<i64>,
}

/// `POST /sitefe/v1/deltatimestates`
pub async fn record_time_state(
    State(state): State<AppState>,
    Json(report): Json<TimeStateReport>,
) -> ApiResult<Json<Value>> {
    if report.uuid.is_empty() || report.hostname.is_empty() {
        return Err(SrmError::bad_request("uuid and hostname are required").into());
    }
    state
        .store
        .insert_delta_time_state(&DeltaTimeState {
            id: 0,
            insertdate: report.insertdate.unwrap_or_else(now_epoch),
            uuid: report.uuid,
            uuidtype: report.uuidtype,
            hostname: report.hostname,
            hostport: report.hostport,
            uuidstate: report.uuidstate,
        })
        .await?;
    Ok(Json(json!({ "status": "Recorded" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::tests::{call, test_state};
    use axum::http::Method;
    use pretty_assertions::assert_eq;
    use srm_model::{ModelWriter, ParserContext, Prefixes};
    use srm_store::{HostRecord, MemoryStore, ModelRecord, Store};
    use srm_test::{deltas, frontend_config, host_facts_value, SITE_NAME, SITE_URI};
    use srm_types::DeltaState;
    use std::path::Path as FsPath;

    /// Publishes a topology-only model and registers the `dtn01` facts.
    async fn publish_model(store: &MemoryStore, dir: &FsPath, now: i64) {
        store
            .upsert_host(&HostRecord {
                ip: "192.168.0.10".to_string(),
                hostname: "dtn01".to_string(),
                insertdate: now,
                updatedate: now,
                hostinfo: host_facts_value(),
            })
            .await
            .unwrap();
        let ctx = ParserContext::from_config(&frontend_config(), SITE_NAME, now).unwrap();
        let mut writer = ModelWriter::new(ctx);
        writer.add_site();
        writer.add_node("sw1");
        writer.add_node("dtn01");
        writer.add_switching_service("sw1");
        writer.add_routing_service("sw1");
        let text = ModelFormat::Turtle.serialize(&writer.into_graph(), &Prefixes::for_site(SITE_URI));
        let path = dir.join("model-1.ttl");
        std::fs::write(&path, text).unwrap();
        store
            .insert_model(&ModelRecord {
                uid: "model-1".to_string(),
                insertdate: now,
                fileloc: path.display().to_string(),
            })
            .await
            .unwrap();
    }

    fn addition(id: &str, conn: &str, vlan: u16, now: i64) -> Value {
        json!({
            "id": id,
            "modelId": "model-1",
            "addition": STANDARD.encode(deltas::vsw_addition(conn, vlan, Some("10.1.1.2/24"), now, now + 3600)),
        })
    }

    #[tokio::test]
    async fn test_submit_without_model_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path());
        let (status, body) = call(
            &state,
            Method::POST,
            "/sitefe/v1/deltas",
            Some(addition("d1", "conn+1", 3001, now_epoch())),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errType"], "NotFound");
    }

    #[tokio::test]
    async fn test_submit_commit_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());
        let now = now_epoch();
        publish_model(&store, dir.path(), now).await;

        let (status, body) = call(
            &state,
            Method::POST,
            "/sitefe/v1/deltas",
            Some(addition("d1", "conn+1", 3001, now)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["state"], "accepted");
        assert_eq!(
            body["href"],
            "https://fe.example.org:8443/sitefe/v1/deltas/d1"
        );

        // The same id again is a conflict.
        let (status, body) = call(
            &state,
            Method::POST,
            "/sitefe/v1/deltas",
            Some(addition("d1", "conn+1", 3001, now)),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errType"], "ConflictEntries");

        let (status, _) = call(&state, Method::PUT, "/sitefe/v1/deltas/d1/actions/commit", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(
            store.get_delta("d1").await.unwrap().unwrap().state,
            DeltaState::Committing
        );

        let (status, body) = call(&state, Method::PUT, "/sitefe/v1/deltas/d1/actions/undo", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errType"], "BadRequestError");

        let (status, body) = call(&state, Method::GET, "/sitefe/v1/deltastates/d1", None).await;
        assert_eq!(status, StatusCode::OK);
        let states: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["state"].as_str().unwrap())
            .collect();
        assert!(states.contains(&"accepted"));
        assert!(states.contains(&"committing"));
    }

    #[tokio::test]
    async fn test_host_state_routes() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());
        let now = now_epoch();
        publish_model(&store, dir.path(), now).await;
        let (status, _) = call(
            &state,
            Method::POST,
            "/sitefe/v1/deltas",
            Some(addition("d1", "conn+1", 3001, now)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&state, Method::GET, "/sitefe/v1/deltahoststates/d1", None).await;
        assert_eq!(status, StatusCode::OK);
        let hosts: Vec<(&str, &str)> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|h| (h["hostname"].as_str().unwrap(), h["state"].as_str().unwrap()))
            .collect();
        assert_eq!(hosts, vec![("dtn01", "active"), ("sw1", "active")]);

        let (status, _) = call(&state, Method::PUT, "/sitefe/v1/deltas/d1/actions/commit", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        state.policy().unwrap().state_machine().tick(now).await.unwrap();

        let (_, body) = call(&state, Method::GET, "/sitefe/v1/deltahoststates/d1", None).await;
        assert!(body
            .as_array()
            .unwrap()
            .iter()
            .all(|h| h["state"] == "activating"));
        let (status, body) =
            call(&state, Method::GET, "/sitefe/v1/deltahoststateshistory/d1", None).await;
        assert_eq!(status, StatusCode::OK);
        let dtn: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .filter(|h| h["hostname"] == "dtn01")
            .map(|h| h["state"].as_str().unwrap())
            .collect();
        assert_eq!(dtn, vec!["active", "activating"]);

        for uri in ["/sitefe/v1/deltahoststates/nope", "/sitefe/v1/deltahoststateshistory/nope"] {
            let (status, body) = call(&state, Method::GET, uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["errType"], "NotFound");
        }
    }

    #[tokio::test]
    async fn test_vlan_outside_range_is_rejected_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());
        let now = now_epoch();
        publish_model(&store, dir.path(), now).await;

        // Vlan 4000 is outside every configured range.
        let (status, body) = call(
            &state,
            Method::POST,
            "/sitefe/v1/deltas",
            Some(addition("d2", "conn+2", 4000, now)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(
            store.get_delta("d2").await.unwrap().unwrap().state,
            DeltaState::Failed
        );

        // A failed delta only takes a forcecommit.
        let (status, body) = call(&state, Method::PUT, "/sitefe/v1/deltas/d2/actions/commit", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errType"], "WrongDeltaStatusTransition");
        let (status, _) = call(&state, Method::PUT, "/sitefe/v1/deltas/d2/actions/forcecommit", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_list_and_get_delta() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());
        store
            .insert_delta(&Delta {
                uid: "d1".to_string(),
                insertdate: 100,
                updatedate: 200,
                state: srm_types::DeltaState::Accepted,
                deltat: srm_types::DeltaType::Addition,
                content: DeltaContent {
                    addition: Some("<urn:a> <urn:b> <urn:c> .".to_string()),
                    reduction: None,
                }
                .to_json(),
                modelid: "model-1".to_string(),
                modadd: srm_types::ModAdd::Idle,
                error: None,
            })
            .await
            .unwrap();

        let (status, body) = call(&state, Method::GET, "/sitefe/v1/deltas", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([{
                "id": "d1",
                "lastModified": http_date(200),
                "state": "accepted",
                "href": "https://fe.example.org:8443/sitefe/v1/deltas/d1",
                "modelId": "model-1",
            }])
        );

        let (_, body) = call(&state, Method::GET, "/sitefe/v1/deltas/d1?encode=false", None).await;
        assert_eq!(body["addition"], "<urn:a> <urn:b> <urn:c> .");
        assert_eq!(body["reduction"], Value::Null);

        let (_, body) = call(&state, Method::GET, "/sitefe/v1/deltas/d1", None).await;
        assert_eq!(body["addition"], STANDARD.encode("<urn:a> <urn:b> <urn:c> ."));

        let (status, _) = call(&state, Method::GET, "/sitefe/v1/deltas/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_time_state_report() {
        let dir = tempfile::tempdir().unwrap();
        let (state, store) = test_state(dir.path());
        let (status, body) = call(
            &state,
            Method::POST,
            "/sitefe/v1/deltatimestates",
            Some(json!({
                "uuid": "conn+1",
                "uuidtype": "vsw",
                "hostname": "dtn01",
                "hostport": "vlan.3001",
                "uuidstate": "activated",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "Recorded" }));
        let stored = store.delta_time_states("conn+1").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].uuidstate, TimedState::Activated);

        let (status, _) = call(&state, Method::PUT, "/sitefe/v1/deltas/nope/actions/forceapply", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
