//! Supervisor hooks that report through the frontend REST API.

use async_trait::async_trait;
use srm_common::{SrmResult, StateReport, SupervisorHooks};
use std::sync::Arc;
use tracing::debug;

use crate::client::FrontendClient;

/// Service action asking a service to re-read its configuration.
pub const ACTION_RELOAD: &str = "reload";

/// Posts heartbeats to `servicestates` and consumes `serviceaction` rows.
#[derive(Clone)]
pub struct RestHooks {
    client: Arc<FrontendClient>,
}

impl RestHooks {
    pub fn new(client: Arc<FrontendClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SupervisorHooks for RestHooks {
    async fn report_state(&self, report: &StateReport) -> SrmResult<()> {
        self.client.report_service_state(report).await?;
        Ok(())
    }

    async fn take_refresh_request(&self, hostname: &str, servicename: &str) -> SrmResult<bool> {
        let actions = self.client.take_service_actions(hostname, servicename).await?;
        let reload = actions.iter().any(|a| a.serviceaction == ACTION_RELOAD);
        debug!(hostname, servicename, count = actions.len(), reload, "Consumed service actions");
        Ok(reload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use serde_json::json;
    use srm_common::{RetryPolicy, ServiceState};
    use srm_test::SITE_NAME;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hooks(server: &MockServer) -> RestHooks {
        let client = FrontendClient::new(&server.uri(), SITE_NAME, Credentials::Anonymous)
            .unwrap()
            .with_retry(RetryPolicy::new(1, Duration::from_millis(1)));
        RestHooks::new(Arc::new(client))
    }

    #[tokio::test]
    async fn test_report_state_posts_heartbeat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/api/{}/servicestates", SITE_NAME)))
            .and(body_partial_json(json!({ "servicename": "Ruler", "servicestate": "WARNING" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let report = StateReport {
            hostname: "dtn01".into(),
            servicename: "Ruler".into(),
            servicestate: ServiceState::Warning,
            version: "0.1.0".into(),
            runtime: 2,
            exc: Some("interface eth1 is not present".into()),
        };
        hooks(&server).report_state(&report).await.unwrap();
    }

    #[tokio::test]
    async fn test_report_state_failure_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let report = StateReport {
            hostname: "dtn01".into(),
            servicename: "Agent".into(),
            servicestate: ServiceState::Ok,
            version: "0.1.0".into(),
            runtime: 0,
            exc: None,
        };
        assert!(hooks(&server).report_state(&report).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_request_only_on_reload() {
        let server = MockServer::start().await;
        let action = format!("/api/{}/serviceaction", SITE_NAME);
        Mock::given(method("GET"))
            .and(path(action.clone()))
            .and(query_param("servicename", "Ruler"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"hostname": "dtn01", "servicename": "Ruler", "serviceaction": "reload"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(action.clone()))
            .and(query_param("servicename", "Agent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"hostname": "dtn01", "servicename": "Agent", "serviceaction": "restart"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(action))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Status": "Deleted" })))
            .expect(2)
            .mount(&server)
            .await;

        let hooks = hooks(&server);
        assert!(hooks.take_refresh_request("dtn01", "Ruler").await.unwrap());
        assert!(!hooks.take_refresh_request("dtn01", "Agent").await.unwrap());
    }
}
