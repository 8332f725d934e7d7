//! Probes, OpenID documents and the certificate token exchange.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use srm_common::{now_epoch, SrmError};
use tracing::{info, instrument};

use super::{ApiResult, AppState};
use crate::auth::TokenPair;

/// `GET /api/alive`
pub async fn alive() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}

/// `GET /api/ready`: the store answers.
pub async fn ready(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.store.get_active_deltas().await?;
    Ok(Json(json!({ "status": "ready" })))
}

/// `GET /.well-known/openid-configuration`
pub async fn openid_configuration(State(state): State<AppState>) -> Json<Value> {
    let webdomain = state.config.get().general.webdomain.clone();
    Json(state.auth.issuer().openid_configuration(&webdomain))
}

/// `GET /.well-known/jwks.json`
pub async fn jwks(State(state): State<AppState>) -> Json<Value> {
    Json(state.auth.issuer().jwks())
}

/// Body of `POST /m2m/token`: a certificate to get a challenge for, or the
/// answer to one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub certificate: Option<String>,
    pub challenge_id: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge_id: String,
    pub challenge: String,
    pub ttl: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRequest {
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub session_id: String,
    pub refresh_token: String,
}

fn challenge(state: &AppState, certificate: &str) -> ApiResult<Json<Value>> {
    let issued = state.auth.issue_challenge(certificate)?;
    let body = ChallengeResponse {
        challenge_id: issued.challenge_id,
        challenge: issued.challenge,
        ttl: issued.ttl,
    };
    Ok(Json(serde_json::to_value(body)?))
}

async fn login(state: &AppState, challenge_id: &str, signature: &str) -> ApiResult<Json<Value>> {
    let pair: TokenPair = state.auth.login(challenge_id, signature, now_epoch()).await?;
    info!(session = %pair.session_id, "Issued tokens");
    Ok(Json(serde_json::to_value(pair)?))
}

/// `POST /m2m/token`
#[instrument(skip_all)]
pub async fn token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> ApiResult<Json<Value>> {
    match request {
        TokenRequest {
            challenge_id: Some(id),
            signature: Some(signature),
            ..
        } => login(&state, &id, &signature).await,
        TokenRequest {
            certificate: Some(certificate),
            ..
        } => challenge(&state, &certificate),
        _ => Err(SrmError::RequestWithoutCert.into()),
    }
}

/// `POST /m2m/token/{challenge_id}`
#[instrument(skip(state, request))]
pub async fn answer(
    State(state): State<AppState>,
    Path(challenge_id): Path<String>,
    Json(request): Json<AnswerRequest>,
) -> ApiResult<Json<Value>> {
    login(&state, &challenge_id, &request.signature).await
}

/// `POST /m2m/token/refresh`
#[instrument(skip_all)]
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<Value>> {
    let pair = state
        .auth
        .refresh(&request.session_id, &request.refresh_token, now_epoch())
        .await?;
    Ok(Json(serde_json::to_value(pair)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::x509::tests::{authenticator, sign, test_pki};
    use crate::auth::{jwt, AuthService};
    use crate::rest::tests::{send, test_state};
    use axum::http::{Method, StatusCode};
    use pretty_assertions::assert_eq;
    use srm_common::config::AuthConfig;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_well_known_documents() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path());
        let (status, body) = send(&state, Method::GET, "/.well-known/jwks.json", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["keys"].as_array().unwrap().len(), 2);

        let (_, body) = send(&state, Method::GET, "/.well-known/openid-configuration", None, None).await;
        assert_eq!(body["token_endpoint"], "https://fe.example.org:8443/m2m/token");

        let (status, body) = send(&state, Method::GET, "/api/ready", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }

    #[tokio::test]
    async fn test_certificate_exchange_then_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, store) = test_state(dir.path());
        let pki = test_pki("dtn01.example.org");
        let config = AuthConfig {
            allowed_dns: vec!["/CN=dtn01.example.org".to_string()],
            ..Default::default()
        };
        state.auth = Arc::new(AuthService::new(
            jwt::tests::issuer(),
            authenticator(&pki, &config),
            store,
            config.refresh_lifetime,
        ));

        let (status, body) = send(
            &state,
            Method::POST,
            "/m2m/token",
            None,
            Some(json!({ "certificate": pki.leaf_pem })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let challenge_id = body["challenge_id"].as_str().unwrap().to_string();
        let signature = sign(&pki.leaf_key, body["challenge"].as_str().unwrap());

        let (status, tokens) = send(
            &state,
            Method::POST,
            &format!("/m2m/token/{}", challenge_id),
            None,
            Some(json!({ "signature": signature })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tokens["session_id"], challenge_id.as_str());
        assert_eq!(tokens["token_type"], "Bearer");

        // The issued token opens the protected routes.
        let auth = format!("Bearer {}", tokens["access_token"].as_str().unwrap());
        let (status, _) = send(&state, Method::GET, "/sitefe/v1/models", Some(&auth), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, refreshed) = send(
            &state,
            Method::POST,
            "/m2m/token/refresh",
            None,
            Some(json!({
                "session_id": challenge_id,
                "refresh_token": tokens["refresh_token"],
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(refreshed["refresh_token"], tokens["refresh_token"]);

        // Challenges are single use.
        let (status, _) = send(
            &state,
            Method::POST,
            "/m2m/token",
            None,
            Some(json!({ "challenge_id": challenge_id, "signature": signature })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_without_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let (state, _) = test_state(dir.path());
        let (status, body) = send(&state, Method::POST, "/m2m/token", None, Some(json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errType"], "RequestWithoutCert");
    }
}
