//! The Agent worker: gathers host facts and reports them to the frontend.

use async_trait::async_trait;
use serde_json::{json, Value};
use srm_common::{now_epoch, AgentConfig, ConfigCache, CycleOutcome, SrmError, SrmResult, Worker};
use srm_types::HostFacts;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::client::FrontendClient;
use crate::error::{AgentError, AgentResult};
use crate::facts::{self, HostLinks, PROC_MEMINFO, SYSFS_NET};

pub const SERVICE_NAME: &str = "Agent";

/// Certificates expiring sooner than this raise a warning.
pub const CERT_WARNING_SECS: i64 = 7 * 24 * 3600;

/// One collected report, ready to send.
#[derive(Debug, Clone)]
pub struct HostReport {
    pub body: Value,
    pub warnings: Vec<String>,
}

pub struct Reporter {
    config: Arc<ConfigCache<AgentConfig>>,
    client: Arc<FrontendClient>,
    sysfs: PathBuf,
    meminfo: PathBuf,
}

impl Reporter {
    pub fn new(config: Arc<ConfigCache<AgentConfig>>, client: Arc<FrontendClient>) -> Self {
        Self {
            config,
            client,
            sysfs: PathBuf::from(SYSFS_NET),
            meminfo: PathBuf::from(PROC_MEMINFO),
        }
    }

    /// Reads link attributes and memory figures below other roots.
    pub fn with_roots(mut self, sysfs: impl Into<PathBuf>, meminfo: impl Into<PathBuf>) -> Self {
        self.sysfs = sysfs.into();
        self.meminfo = meminfo.into();
        self
    }

    fn cert_facts(config: &AgentConfig, facts: &mut HostFacts, now: i64, warnings: &mut Vec<String>) {
        let Some(path) = config.general.cert.as_ref() else {
            return;
        };
        let info = std::fs::read_to_string(path)
            .map_err(|e| AgentError::io(path.display().to_string(), e))
            .and_then(|pem| facts::cert_info(&pem));
        match info {
            Ok(info) => {
                if info.not_after <= now {
                    warnings.push(format!("host certificate {} has expired", path.display()));
                } else if info.not_after - now < CERT_WARNING_SECS {
                    warnings.push(format!(
                        "host certificate {} expires in {} hours",
                        path.display(),
                        (info.not_after - now) / 3600
                    ));
                }
                facts.cert_info = Some(info);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read host certificate");
                warnings.push(format!("host certificate unreadable: {}", e));
            }
        }
    }

    /// Builds the host report from already observed links and neighbours.
    pub fn collect(
        &self,
        config: &AgentConfig,
        links: &HostLinks,
        neighbours: Vec<srm_types::ArpEntry>,
        now: i64,
    ) -> AgentResult<HostReport> {
        let mut warnings = Vec::new();
        let mut facts = facts::host_facts(config, links, &self.sysfs)?;
        facts.arp_info = neighbours;
        Self::cert_facts(config, &mut facts, now, &mut warnings);

        for name in &config.agent.interfaces {
            if !links.contains_key(name) {
                warnings.push(format!("interface {} is not present", name));
            }
        }
        let ip = facts::host_ip(config, links).unwrap_or_else(|| {
            warnings.push("no address to register the host under".to_string());
            String::new()
        });
        let body = facts::report_body(&config.general.hostname, &ip, &facts, now)?;
        Ok(HostReport { body, warnings })
    }

    fn memory_stats(&self) -> Option<Value> {
        match std::fs::read_to_string(&self.meminfo) {
            Ok(text) => Some(json!({ "MemInfo": facts::parse_meminfo(&text) })),
            Err(e) => {
                debug!(path = %self.meminfo.display(), error = %e, "No memory figures");
                None
            }
        }
    }

    /// Sends a collected report and the memory figures.
    pub async fn send(&self, hostname: &str, report: &HostReport) -> AgentResult<()> {
        self.client.report_host(&report.body).await?;
        if let Some(stats) = self.memory_stats() {
            self.client.report_stats(hostname, &stats).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cycle_at(&self, now: i64) -> AgentResult<CycleOutcome> {
        let config = self.config.get();
        let links = facts::read_links().await?;
        let neighbours = facts::read_neighbours().await.unwrap_or_else(|e| {
            warn!(error = %e, "Cannot read neighbour table");
            Vec::new()
        });
        let report = self.collect(&config, &links, neighbours, now)?;
        self.send(&config.general.hostname, &report).await?;
        info!(host = %config.general.hostname, "Host facts reported");
        Ok(CycleOutcome {
            changes: false,
            warnings: report.warnings,
        })
    }
}

#[async_trait]
impl Worker for Reporter {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn run_once(&mut self) -> SrmResult<CycleOutcome> {
        self.cycle_at(now_epoch()).await.map_err(SrmError::from)
    }

    async fn reload(&mut self) -> SrmResult<()> {
        if self.config.reload()? {
            info!("Configuration reloaded");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::facts::parse_ip_addr;
    use pretty_assertions::assert_eq;
    use srm_common::RetryPolicy;
    use srm_test::{agent_config, NOW, SITE_NAME};
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LINKS: &str = r#"[
        {"ifname": "eth0", "mtu": 9000, "operstate": "UP",
         "addr_info": [{"local": "192.168.0.10", "prefixlen": 24}]}
    ]"#;

    fn reporter(webdomain: &str, dir: &Path) -> Reporter {
        let cache = Arc::new(ConfigCache::from_value(dir.join("agent.yaml"), agent_config()));
        let client = FrontendClient::new(webdomain, SITE_NAME, Credentials::Anonymous)
            .unwrap()
            .with_retry(RetryPolicy::new(1, Duration::from_millis(1)));
        Reporter::new(cache, Arc::new(client)).with_roots(dir.join("sys"), dir.join("meminfo"))
    }

    fn write_cert(dir: &Path, not_after: (i32, u8, u8)) -> PathBuf {
        let mut params = rcgen::CertificateParams::new(vec!["dtn01.example.org".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2023, 1, 1);
        params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let path = dir.join("cert.pem");
        std::fs::write(&path, cert.pem()).unwrap();
        path
    }

    #[test]
    fn test_collect_builds_host_body() {
        let dir = tempfile::tempdir().unwrap();
        let r = reporter("http://127.0.0.1:9", dir.path());
        let config = agent_config();
        let links = parse_ip_addr(LINKS).unwrap();

        let report = r.collect(&config, &links, Vec::new(), NOW).unwrap();
        assert_eq!(report.body["hostname"], "dtn01");
        assert_eq!(report.body["ip"], "192.168.0.10");
        assert_eq!(report.body["updateTime"], NOW);
        assert!(report.body["NetInfo"]["interfaces"]["eth0"].is_object());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_missing_interface_warns() {
        let dir = tempfile::tempdir().unwrap();
        let r = reporter("http://127.0.0.1:9", dir.path());
        let report = r
            .collect(&agent_config(), &HostLinks::new(), Vec::new(), NOW)
            .unwrap();
        assert_eq!(report.warnings, vec!["interface eth0 is not present".to_string()]);
        // general.ip still registers the host
        assert_eq!(report.body["ip"], "192.168.0.10");
    }

    #[test]
    fn test_certificate_near_expiry_warns() {
        let dir = tempfile::tempdir().unwrap();
        let r = reporter("http://127.0.0.1:9", dir.path());
        let mut config = agent_config();
        // NOW is 2023-11-14; the certificate ends two days later
        config.general.cert = Some(write_cert(dir.path(), (2023, 11, 16)));
        let links = parse_ip_addr(LINKS).unwrap();

        let report = r.collect(&config, &links, Vec::new(), NOW).unwrap();
        assert!(report.body["CertInfo"].is_object());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("expires in"));
    }

    #[test]
    fn test_valid_certificate_is_quiet() {
        let dir = tempfile::tempdir().unwrap();
        let r = reporter("http://127.0.0.1:9", dir.path());
        let mut config = agent_config();
        config.general.cert = Some(write_cert(dir.path(), (2030, 1, 1)));
        let links = parse_ip_addr(LINKS).unwrap();

        let report = r.collect(&config, &links, Vec::new(), NOW).unwrap();
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_send_reports_host_and_memory() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(format!("/api/{}/hosts", SITE_NAME)))
            .and(body_partial_json(json!({ "hostname": "dtn01" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/{}/monitoring/stats", SITE_NAME)))
            .and(body_partial_json(json!({ "hostname": "dtn01", "output": {"MemInfo": {"MemTotal": 1024}} })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), "MemTotal:       1024 kB\nMemFree: 512 kB\n").unwrap();
        let r = reporter(&server.uri(), dir.path());
        let report = r
            .collect(&agent_config(), &parse_ip_addr(LINKS).unwrap(), Vec::new(), NOW)
            .unwrap();

        r.send("dtn01", &report).await.unwrap();
    }
}
