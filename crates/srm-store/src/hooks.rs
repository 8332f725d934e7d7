//! Supervisor hooks that report into the store.

use async_trait::async_trait;
use srm_common::{now_epoch, SrmResult, StateReport, SupervisorHooks};
use std::sync::Arc;
use tracing::debug;

use crate::records::{ServiceStateRecord, ACTION_RELOAD};
use crate::store::Store;

/// Writes heartbeats to `servicestates` and reads refresh requests from
/// `serviceaction`.
pub struct StoreHooks<S: Store + ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized> StoreHooks<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S: Store + ?Sized> Clone for StoreHooks<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

#[async_trait]
impl<S: Store + ?Sized> SupervisorHooks for StoreHooks<S> {
    async fn report_state(&self, report: &StateReport) -> SrmResult<()> {
        let now = now_epoch();
        self.store
            .upsert_service_state(&ServiceStateRecord {
                hostname: report.hostname.clone(),
                servicename: report.servicename.clone(),
                servicestate: report.servicestate,
                version: report.version.clone(),
                runtime: i64::try_from(report.runtime).unwrap_or(i64::MAX),
                exc: report.exc.clone(),
                insertdate: now,
                updatedate: now,
            })
            .await?;
        Ok(())
    }

    async fn take_refresh_request(&self, hostname: &str, servicename: &str) -> SrmResult<bool> {
        let actions = self
            .store
            .service_actions(Some(hostname), Some(servicename))
            .await?;
        if actions.is_empty() {
            return Ok(false);
        }
        self.store
            .delete_service_actions(hostname, Some(servicename))
            .await?;
        let reload = actions.iter().any(|a| a.serviceaction == ACTION_RELOAD);
        debug!(hostname, servicename, count = actions.len(), reload, "Consumed service actions");
        Ok(reload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::records::ServiceAction;
    use srm_common::ServiceState;

    #[tokio::test]
    async fn test_report_state_upserts() {
        let store = Arc::new(MemoryStore::new());
        let hooks = StoreHooks::new(Arc::clone(&store));
        let mut report = StateReport {
            hostname: "fe01".into(),
            servicename: "LookUpService".into(),
            servicestate: ServiceState::Ok,
            version: "0.1.0".into(),
            runtime: 3,
            exc: None,
        };
        hooks.report_state(&report).await.unwrap();
        report.servicestate = ServiceState::Failed;
        report.exc = Some("boom".into());
        hooks.report_state(&report).await.unwrap();

        let states = store.list_service_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].servicestate, ServiceState::Failed);
        assert_eq!(states[0].exc.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_refresh_request_consumed_once() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_service_action(&ServiceAction {
                id: 0,
                hostname: "fe01".into(),
                servicename: "PolicyService".into(),
                serviceaction: ACTION_RELOAD.into(),
                insertdate: 1,
            })
            .await
            .unwrap();
        let hooks = StoreHooks::new(Arc::clone(&store));
        assert!(!hooks.take_refresh_request("fe01", "LookUpService").await.unwrap());
        assert!(hooks.take_refresh_request("fe01", "PolicyService").await.unwrap());
        assert!(!hooks.take_refresh_request("fe01", "PolicyService").await.unwrap());
    }
}
