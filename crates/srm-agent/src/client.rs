//! HTTP client of the frontend REST API.
//!
//! Every call carries a 60 second timeout and is retried with linear
//! backoff while the frontend is unreachable or answers 5xx.

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use srm_common::{now_epoch, retry, AgentConfig, RetryPolicy, StateReport};
use srm_types::{ActiveDeltas, TimedState};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::credentials::Credentials;
use crate::error::{AgentError, AgentResult};

/// Timeout of a single HTTP call.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Tokens are renewed this many seconds before they expire.
const TOKEN_SLACK: i64 = 30;

/// The active-deltas document as served to agents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveDeltasDoc {
    #[serde(default)]
    pub insertdate: i64,
    #[serde(default)]
    pub updatedate: i64,
    #[serde(default)]
    pub output: ActiveDeltas,
}

/// Fine-grained apply state of one (delta, host, port).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStateReport {
    pub uuidtype: String,
    pub uuid: String,
    pub hostname: String,
    pub hostport: String,
    pub uuidstate: TimedState,
    pub insertdate: i64,
}

/// A pending control action for one of this host's services.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceActionEntry {
    pub hostname: String,
    pub servicename: String,
    pub serviceaction: String,
}

#[derive(Debug, Deserialize)]
struct Challenge {
    challenge_id: String,
    challenge: String,
}

#[derive(Debug, Deserialize)]
struct TokenPair {
    session_id: String,
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct Session {
    session_id: String,
    access_token: String,
    refresh_token: String,
    expires_at: i64,
}

impl Session {
    fn from_pair(pair: TokenPair, now: i64) -> Self {
        Self {
            session_id: pair.session_id,
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_at: now + pair.expires_in,
        }
    }

    fn is_fresh(&self, now: i64) -> bool {
        now + TOKEN_SLACK < self.expires_at
    }
}

pub struct FrontendClient {
    http: reqwest::Client,
    base: String,
    site: String,
    credentials: Credentials,
    session: Mutex<Option<Session>>,
    retry: RetryPolicy,
}

impl FrontendClient {
    pub fn new(webdomain: &str, site: &str, credentials: Credentials) -> AgentResult<Self> {
        let base = webdomain.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Http {
                url: base.clone(),
                status: 0,
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base,
            site: site.to_string(),
            credentials,
            session: Mutex::new(None),
            retry: RetryPolicy::http(),
        })
    }

    pub fn from_config(config: &AgentConfig) -> AgentResult<Self> {
        Self::new(
            &config.general.webdomain,
            &config.general.sitename,
            Credentials::from_config(config)?,
        )
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// One unauthenticated-or-bearer call; the body of a success is parsed
    /// as JSON (`null` when empty).
    async fn send_once(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        bearer: Option<&str>,
    ) -> AgentResult<Value> {
        let url = self.url(path);
        let mut request = self.http.request(method, &url).query(query);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| AgentError::Http {
            url: url.clone(),
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            message: e.to_string(),
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| AgentError::Http {
            url: url.clone(),
            status: status.as_u16(),
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(AgentError::Http {
                url,
                status: status.as_u16(),
                message: text,
            });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| AgentError::Decode {
            url,
            message: e.to_string(),
        })
    }

    async fn exchange(&self, path: &str, body: Value) -> AgentResult<Value> {
        retry(self.retry, path, || {
            self.send_once(Method::POST, path, &[], Some(&body), None)
        })
        .await
    }

    async fn login(&self, certificate: &str, key: &crate::credentials::SigningKey) -> AgentResult<Session> {
        let challenge: Challenge = decode(
            "/m2m/token",
            self.exchange("/m2m/token", json!({ "certificate": certificate }))
                .await?,
        )?;
        let signature = key.answer(&challenge.challenge)?;
        let path = format!("/m2m/token/{}", challenge.challenge_id);
        let pair: TokenPair = decode(&path, self.exchange(&path, json!({ "signature": signature })).await?)?;
        info!(session = %pair.session_id, "Logged in to the frontend");
        Ok(Session::from_pair(pair, now_epoch()))
    }

    async fn refresh(&self, session: &Session) -> AgentResult<Session> {
        let body = json!({
            "session_id": session.session_id,
            "refresh_token": session.refresh_token,
        });
        let pair: TokenPair = decode(
            "/m2m/token/refresh",
            self.exchange("/m2m/token/refresh", body).await?,
        )?;
        debug!(session = %pair.session_id, "Refreshed frontend tokens");
        Ok(Session::from_pair(pair, now_epoch()))
    }

    /// Bearer token for the next call, logging in or refreshing as needed.
    async fn bearer(&self) -> AgentResult<Option<String>> {
        let (certificate, key) = match &self.credentials {
            Credentials::Anonymous => return Ok(None),
            Credentials::Token(token) => return Ok(Some(token.clone())),
            Credentials::Certificate { certificate, key } => (certificate, key),
        };
        let mut session = self.session.lock().await;
        let now = now_epoch();
        if let Some(current) = session.as_ref().filter(|s| s.is_fresh(now)) {
            return Ok(Some(current.access_token.clone()));
        }
        let renewed = match session.as_ref() {
            Some(stale) => match self.refresh(stale).await {
                Ok(renewed) => renewed,
                Err(e) => {
                    warn!(error = %e, "Token refresh failed, logging in again");
                    self.login(certificate, key).await?
                }
            },
            None => self.login(certificate, key).await?,
        };
        let token = renewed.access_token.clone();
        *session = Some(renewed);
        Ok(Some(token))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> AgentResult<Value> {
        let bearer = self.bearer().await?;
        let result = retry(self.retry, path, || {
            self.send_once(method.clone(), path, query, body, bearer.as_deref())
        })
        .await;
        if matches!(result, Err(AgentError::Http { status: 401, .. })) {
            // Revoked or expired early: start a new session next call.
            *self.session.lock().await = None;
        }
        result
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> AgentResult<T> {
        decode(path, self.request(Method::GET, path, query, None).await?)
    }

    /// `GET /api/{site}/frontend/activedeltas`
    #[instrument(skip(self))]
    pub async fn active_deltas(&self) -> AgentResult<ActiveDeltasDoc> {
        self.get(&format!("/api/{}/frontend/activedeltas", self.site), &[])
            .await
    }

    /// `GET /api/{site}/frontend/qosdata`: requested totals per prefix.
    #[instrument(skip(self))]
    pub async fn qos_totals(&self) -> AgentResult<BTreeMap<String, u64>> {
        self.get(&format!("/api/{}/frontend/qosdata", self.site), &[])
            .await
    }

    /// Updates the host facts, registering the host on first contact.
    #[instrument(skip_all)]
    pub async fn report_host(&self, facts: &Value) -> AgentResult<()> {
        let path = format!("/api/{}/hosts", self.site);
        match self.request(Method::PUT, &path, &[], Some(facts)).await {
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND.as_u16()) => {
                info!("Host unknown to the frontend, registering it");
                self.request(Method::POST, &path, &[], Some(facts)).await?;
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }

    /// `POST /api/{site}/monitoring/stats`
    pub async fn report_stats(&self, hostname: &str, output: &Value) -> AgentResult<()> {
        let path = format!("/api/{}/monitoring/stats", self.site);
        let body = json!({ "hostname": hostname, "output": output });
        self.request(Method::POST, &path, &[], Some(&body)).await?;
        Ok(())
    }

    /// `POST /sitefe/v1/deltatimestates`
    #[instrument(skip(self), fields(uuid = %report.uuid, state = %report.uuidstate))]
    pub async fn publish_time_state(&self, report: &TimeStateReport) -> AgentResult<()> {
        let body = serde_json::to_value(report).map_err(|e| AgentError::parse("time state", e))?;
        self.request(Method::POST, "/sitefe/v1/deltatimestates", &[], Some(&body))
            .await?;
        Ok(())
    }

    /// `POST /api/{site}/servicestates`
    pub async fn report_service_state(&self, report: &StateReport) -> AgentResult<()> {
        let path = format!("/api/{}/servicestates", self.site);
        let body = serde_json::to_value(report).map_err(|e| AgentError::parse("service state", e))?;
        self.request(Method::POST, &path, &[], Some(&body)).await?;
        Ok(())
    }

    /// Reads and deletes the pending actions of a service. Nothing pending
    /// is an empty list.
    pub async fn take_service_actions(
        &self,
        hostname: &str,
        servicename: &str,
    ) -> AgentResult<Vec<ServiceActionEntry>> {
        let path = format!("/api/{}/serviceaction", self.site);
        let query = [("hostname", hostname), ("servicename", servicename)];
        let actions: Vec<ServiceActionEntry> = match self.get(&path, &query).await {
            Ok(actions) => actions,
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND.as_u16()) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        if !actions.is_empty() {
            self.request(Method::DELETE, &path, &query, None).await?;
        }
        Ok(actions)
    }
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> AgentResult<T> {
    serde_json::from_value(value).map_err(|e| AgentError::Decode {
        url: path.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::ec_key;
    use pretty_assertions::assert_eq;
    use srm_common::ServiceState;
    use srm_test::{active_deltas, NOW, SITE_NAME};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, credentials: Credentials) -> FrontendClient {
        FrontendClient::new(&server.uri(), SITE_NAME, credentials)
            .unwrap()
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_active_deltas_with_token() {
        let server = MockServer::start().await;
        let doc = active_deltas::vsw("conn1", "dtn01", "eth0", 3001, None, NOW, NOW + 3600);
        Mock::given(method("GET"))
            .and(path(format!("/api/{}/frontend/activedeltas", SITE_NAME)))
            .and(header("authorization", "Bearer static"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "insertdate": NOW,
                "updatedate": NOW,
                "output": doc,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fetched = client(&server, Credentials::Token("static".into()))
            .active_deltas()
            .await
            .unwrap();
        assert_eq!(fetched.insertdate, NOW);
        assert_eq!(fetched.output, doc);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/api/{}/frontend/qosdata", SITE_NAME)))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/{}/frontend/qosdata", SITE_NAME)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "2001:db8:1::/64": 4000 })),
            )
            .mount(&server)
            .await;

        let totals = client(&server, Credentials::Anonymous).qos_totals().await.unwrap();
        assert_eq!(totals["2001:db8:1::/64"], 4000);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad"))
            .expect(1)
            .mount(&server)
            .await;
        let err = client(&server, Credentials::Anonymous)
            .active_deltas()
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
    }

    #[tokio::test]
    async fn test_report_host_registers_unknown_host() {
        let server = MockServer::start().await;
        let hosts = format!("/api/{}/hosts", SITE_NAME);
        Mock::given(method("PUT"))
            .and(path(hosts.clone()))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(hosts))
            .and(body_partial_json(json!({ "hostname": "dtn01" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Status": "ADDED" })))
            .expect(1)
            .mount(&server)
            .await;

        client(&server, Credentials::Anonymous)
            .report_host(&json!({ "hostname": "dtn01", "ip": "192.168.0.10" }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_certificate_login_then_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/m2m/token"))
            .and(body_partial_json(json!({ "certificate": "PEM" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "challenge_id": "c1",
                "challenge": "Y2hhbGxlbmdl",
                "ttl": 60,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/m2m/token/c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "session_id": "c1",
                "access_token": "access-1",
                "refresh_token": "refresh-1",
                "token_type": "Bearer",
                "expires_in": 900,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(2)
            .mount(&server)
            .await;

        let client = client(
            &server,
            Credentials::Certificate {
                certificate: "PEM".into(),
                key: ec_key(),
            },
        );
        // The session is reused while fresh.
        client.qos_totals().await.unwrap();
        client.qos_totals().await.unwrap();
    }

    #[tokio::test]
    async fn test_take_service_actions() {
        let server = MockServer::start().await;
        let action = format!("/api/{}/serviceaction", SITE_NAME);
        Mock::given(method("GET"))
            .and(path(action.clone()))
            .and(query_param("servicename", "Ruler"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": 1,
                "hostname": "dtn01",
                "servicename": "Ruler",
                "serviceaction": "reload",
                "insertdate": NOW,
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(action.clone()))
            .and(query_param("servicename", "Agent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(action))
            .and(query_param("hostname", "dtn01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Status": "Deleted" })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, Credentials::Anonymous);
        let actions = client.take_service_actions("dtn01", "Ruler").await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].serviceaction, "reload");
        assert!(client.take_service_actions("dtn01", "Agent").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_state_reports() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sitefe/v1/deltatimestates"))
            .and(body_partial_json(json!({ "uuidstate": "activated", "hostport": "eth0" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "Recorded" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/{}/servicestates", SITE_NAME)))
            .and(body_partial_json(json!({ "servicestate": "OK", "servicename": "Ruler" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Status": "Updated" })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, Credentials::Anonymous);
        client
            .publish_time_state(&TimeStateReport {
                uuidtype: "vsw".into(),
                uuid: "conn1".into(),
                hostname: "dtn01".into(),
                hostport: "eth0".into(),
                uuidstate: TimedState::Activated,
                insertdate: NOW,
            })
            .await
            .unwrap();
        client
            .report_service_state(&StateReport {
                hostname: "dtn01".into(),
                servicename: "Ruler".into(),
                servicestate: ServiceState::Ok,
                version: "0.1.0".into(),
                runtime: 2,
                exc: None,
            })
            .await
            .unwrap();
    }
}
