//! `/sitefe/v1/models*`: published model versions.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use srm_common::timing::{http_date, parse_http_date, rfc3339};
use srm_common::SrmError;
use srm_model::ModelFormat;
use srm_store::ModelRecord;

use super::{ApiResult, AppState};
use crate::lookup::model_path;

#[derive(Debug, Default, Deserialize)]
pub struct ModelQuery {
    #[serde(default)]
    pub current: bool,
    pub summary: Option<bool>,
    pub encode: Option<bool>,
    /// `turtle`, `ntriples` or `json-ld`.
    #[serde(alias = "rdfformat")]
    pub model: Option<String>,
}

impl ModelQuery {
    fn format(&self) -> ApiResult<ModelFormat> {
        Ok(match &self.model {
            Some(name) => name.parse::<ModelFormat>()?,
            None => ModelFormat::Turtle,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(rename = "creationTime")]
    pub creation_time: String,
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

async fn read_model(record: &ModelRecord, format: ModelFormat) -> ApiResult<String> {
    let path = model_path(record, format);
    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| SrmError::io(path.display().to_string(), e).into())
}

async fn entry(
    webdomain: &str,
    record: &ModelRecord,
    content: Option<(ModelFormat, bool)>,
) -> ApiResult<ModelEntry> {
    let model = match content {
        Some((format, encode)) => {
            let text = read_model(record, format).await?;
            Some(if encode { STANDARD.encode(text) } else { text })
        }
        None => None,
    };
    Ok(ModelEntry {
        id: record.uid.clone(),
        creation_time: rfc3339(record.insertdate),
        href: format!(
            "{}/sitefe/v1/models/{}",
            webdomain.trim_end_matches('/'),
            record.uid
        ),
        model,
    })
}

fn not_modified(headers: &HeaderMap, insertdate: i64) -> ApiResult<bool> {
    let Some(value) = headers.get(header::IF_MODIFIED_SINCE) else {
        return Ok(false);
    };
    let text = value
        .to_str()
        .map_err(|e| SrmError::bad_request(format!("If-Modified-Since: {}", e)))?;
    Ok(insertdate < parse_http_date(text)?)
}

/// `GET /sitefe/v1/models`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ModelQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let (config, _) = state.primary_site()?;
    let webdomain = &config.general.webdomain;
    let format = query.format()?;
    let content = (!query.summary.unwrap_or(true)).then(|| (format, query.encode.unwrap_or(true)));

    if query.current {
        let latest = state
            .store
            .latest_model()
            .await?
            .ok_or_else(|| SrmError::not_found("model", "latest"))?;
        let last_modified = [(header::LAST_MODIFIED, http_date(latest.insertdate))];
        if not_modified(&headers, latest.insertdate)? {
            return Ok((StatusCode::NOT_MODIFIED, last_modified).into_response());
        }
        let entry = entry(webdomain, &latest, content).await?;
        return Ok((last_modified, Json(vec![entry])).into_response());
    }

    let mut out = Vec::new();
    for record in state.store.list_models().await? {
        out.push(entry(webdomain, &record, content).await?);
    }
    Ok(Json(out).into_response())
}

/// `GET /sitefe/v1/models/{id}`: the model itself unless `summary` is set.
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ModelQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let (config, _) = state.primary_site()?;
    let record = state
        .store
        .get_model(&id)
        .await?
        .ok_or_else(|| SrmError::not_found("model", &id))?;
    let last_modified = (header::LAST_MODIFIED, http_date(record.insertdate));
    if not_modified(&headers, record.insertdate)? {
        return Ok((StatusCode::NOT_MODIFIED, [last_modified]).into_response());
    }
    if query.summary.unwrap_or(false) {
        let entry = entry(&config.general.webdomain, &record, None).await?;
        return Ok(([last_modified], Json(entry)).into_response());
    }
    let format = query.format()?;
    let text = read_model(&record, format).await?;
    if query.encode.unwrap_or(false) {
        return Ok(([last_modified], STANDARD.encode(text)).into_response());
    }
    Ok((
        [
            last_modified,
            (header::CONTENT_TYPE, format.content_type().to_string()),
        ],
        text,
    )
        .into_response())
}
