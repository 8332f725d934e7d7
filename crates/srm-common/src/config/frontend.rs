//! Frontend (site controller) configuration.

use super::ConfigFile;
use crate::error::{SrmError, SrmResult};
use serde::{Deserialize, Serialize};
use srm_types::{IpFamily, VlanRange};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level frontend configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontendConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,
    #[serde(default)]
    pub switches: BTreeMap<String, SwitchConfig>,
    #[serde(default)]
    pub ansible: AnsibleConfig,
    /// Service class → switch QoS policy number.
    #[serde(default)]
    pub qos_policy: BTreeMap<String, u32>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rest: RestConfig,
}

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub sites: Vec<String>,
    #[serde(rename = "logLevel", default = "default_log_level")]
    pub log_level: String,
    /// Working directory for models, applied switch configs and sentinels.
    #[serde(default = "default_privatedir")]
    pub privatedir: PathBuf,
    #[serde(default)]
    pub webdomain: String,
    /// Directory holding liveness/readiness probe files.
    #[serde(default = "default_probes")]
    pub probes: PathBuf,
    #[serde(default = "default_database")]
    pub database: String,
    /// Name recorded in the service state table.
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

/// Cycle timings and limits of the frontend services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Sleep after a successful cycle, in seconds.
    #[serde(default = "default_sleeptimeok")]
    pub sleeptimeok: u64,
    /// Sleep after a failed cycle, in seconds.
    #[serde(default = "default_sleeptimefailure")]
    pub sleeptimefailure: u64,
    /// Delay between lookup cycles, in seconds.
    #[serde(default = "default_lookup_cycle")]
    pub lookup_cycle: u64,
    /// Minimum age of an `activating` delta before promotion.
    #[serde(default = "default_activation_barrier")]
    pub activation_barrier: u64,
    /// Age after which `remove` becomes `removed`.
    #[serde(default = "default_remove_delay")]
    pub remove_delay: u64,
    /// Age after which a `removed` delta row is deleted.
    #[serde(default = "default_remove_delay")]
    pub removed_retention: u64,
    #[serde(default = "default_model_retention")]
    pub model_retention: u64,
    /// A model is re-written at least this often even without changes.
    #[serde(default = "default_force_rewrite")]
    pub force_rewrite: u64,
    #[serde(default = "default_max_deltas")]
    pub max_deltas_per_cycle: usize,
    /// Facts older than this are ignored.
    #[serde(default = "default_host_timeout")]
    pub host_timeout: u64,
    /// Interval between switch facts collections of one worker.
    #[serde(default = "default_facts_interval")]
    pub facts_interval: u64,
    /// Pause after the first start of all switch workers.
    #[serde(default = "default_worker_start_grace")]
    pub worker_start_grace: u64,
    /// Minimum interval between refresh-signal checks.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Consecutive cycles before a warning is escalated.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
}

/// One site served by this frontend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub domain: String,
    #[serde(default = "default_year")]
    pub year: u32,
    /// Bandwidth in mbps used when a request carries no service.
    #[serde(default = "default_bandwidth")]
    pub default_bandwidth: u64,
    #[serde(default)]
    pub vlan_range_list: VlanRange,
    #[serde(rename = "ipv4-address-pool", default)]
    pub ipv4_address_pool: Vec<String>,
    #[serde(rename = "ipv6-address-pool", default)]
    pub ipv6_address_pool: Vec<String>,
    #[serde(rename = "ipv4-subnet-pool", default)]
    pub ipv4_subnet_pool: Vec<String>,
    #[serde(rename = "ipv6-subnet-pool", default)]
    pub ipv6_subnet_pool: Vec<String>,
    #[serde(default)]
    pub switch: Vec<String>,
    #[serde(default)]
    pub rate_limit: bool,
    #[serde(default)]
    pub private_asn: Option<u32>,
    #[serde(default)]
    pub vrf: Option<String>,
    #[serde(default)]
    pub vlan_mtu: Option<u32>,
}

impl SiteConfig {
    /// Site URI prefix, `urn:ogf:network:<domain>:<year>`.
    pub fn uri(&self) -> String {
        format!("urn:ogf:network:{}:{}", self.domain, self.year)
    }

    pub fn address_pool(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::Ipv4 => &self.ipv4_address_pool,
            IpFamily::Ipv6 => &self.ipv6_address_pool,
        }
    }

    pub fn subnet_pool(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::Ipv4 => &self.ipv4_subnet_pool,
            IpFamily::Ipv6 => &self.ipv6_subnet_pool,
        }
    }
}

/// Switch automation backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Ansible,
    Raw,
}

/// One managed switch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default)]
    pub backend: BackendKind,
    /// Vendor network OS (`sonic`, `dellos9`, `eos`, `freertr`, `nxos`).
    #[serde(default)]
    pub network_os: String,
    /// Name of the virtual switching service; defaults to the switch name.
    #[serde(default)]
    pub vsw: Option<String>,
    /// Whether the switch offers a routing service.
    #[serde(default)]
    pub rst: bool,
    #[serde(default)]
    pub vlan_range_list: VlanRange,
    #[serde(default)]
    pub vlan_mtu: Option<u32>,
    #[serde(default)]
    pub vrf: Option<String>,
    #[serde(default)]
    pub private_asn: Option<u32>,
    #[serde(default)]
    pub rate_limit: bool,
    #[serde(rename = "ipv4-address-pool", default)]
    pub ipv4_address_pool: Vec<String>,
    #[serde(rename = "ipv6-address-pool", default)]
    pub ipv6_address_pool: Vec<String>,
    #[serde(rename = "ipv4-subnet-pool", default)]
    pub ipv4_subnet_pool: Vec<String>,
    #[serde(rename = "ipv6-subnet-pool", default)]
    pub ipv6_subnet_pool: Vec<String>,
    /// Per-port overrides keyed by canonical port name.
    #[serde(default)]
    pub ports: BTreeMap<String, SwitchPortConfig>,
}

impl SwitchConfig {
    pub fn address_pool(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::Ipv4 => &self.ipv4_address_pool,
            IpFamily::Ipv6 => &self.ipv6_address_pool,
        }
    }

    pub fn subnet_pool(&self, family: IpFamily) -> &[String] {
        match family {
            IpFamily::Ipv4 => &self.ipv4_subnet_pool,
            IpFamily::Ipv6 => &self.ipv6_subnet_pool,
        }
    }

    /// Vlan range for a port: the port override wins over the switch range.
    pub fn port_vlan_range(&self, port: &str) -> &VlanRange {
        self.ports
            .get(port)
            .and_then(|p| p.vlan_range_list.as_ref())
            .unwrap_or(&self.vlan_range_list)
    }
}

/// Per-port override on a switch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchPortConfig {
    /// Remote endpoint URI this port connects to.
    #[serde(rename = "isAlias", default)]
    pub is_alias: Option<String>,
    /// Capacity in mbps.
    #[serde(default)]
    pub capacity: Option<u64>,
    /// Host cabled to this port.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<bool>,
    #[serde(default)]
    pub vlan_range_list: Option<VlanRange>,
    #[serde(rename = "ipv4-address-pool", default)]
    pub ipv4_address_pool: Option<Vec<String>>,
    #[serde(rename = "ipv6-address-pool", default)]
    pub ipv6_address_pool: Option<Vec<String>>,
    /// Vendor name of the port when it differs from the canonical name.
    #[serde(default)]
    pub realportname: Option<String>,
}

/// Switch automation runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnsibleConfig {
    #[serde(default = "default_playbook_dir")]
    pub playbook_dir: PathBuf,
    #[serde(default = "default_private_data_dir")]
    pub private_data_dir: PathBuf,
    #[serde(default = "default_ansible_command")]
    pub command: String,
    #[serde(default = "default_ansible_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_ansible_retries")]
    pub retries: u32,
    #[serde(default = "default_ansible_backoff")]
    pub retry_backoff_secs: u64,
    /// Number of artifact directories kept per device.
    #[serde(default = "default_rotate_artifacts")]
    pub rotate_artifacts: usize,
}

/// Token issuance and certificate authentication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_audience")]
    pub audience: String,
    /// PKCS#8 PEM RSA private key used to sign tokens.
    #[serde(default = "default_private_key")]
    pub private_key: PathBuf,
    /// Previous signing key, still published for verification.
    #[serde(default)]
    pub previous_private_key: Option<PathBuf>,
    #[serde(default = "default_access_lifetime")]
    pub access_lifetime: u64,
    #[serde(default = "default_refresh_lifetime")]
    pub refresh_lifetime: u64,
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl: u64,
    /// Directory of trusted CA certificates (PEM).
    #[serde(default = "default_ca_dir")]
    pub ca_dir: PathBuf,
    /// Exact subject DNs allowed to authenticate.
    #[serde(default)]
    pub allowed_dns: Vec<String>,
    /// Regular expressions matched against the subject DN.
    #[serde(default)]
    pub allowed_dn_regex: Vec<String>,
    /// Subject DNs granted admin permissions.
    #[serde(default)]
    pub admin_dns: Vec<String>,
}

/// REST server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_privatedir() -> PathBuf {
    PathBuf::from("/opt/siterm/config")
}

fn default_probes() -> PathBuf {
    PathBuf::from("/tmp/siterm-states")
}

fn default_database() -> String {
    "sqlite:///opt/siterm/siterm.db".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_sleeptimeok() -> u64 {
    10
}

fn default_sleeptimefailure() -> u64 {
    30
}

fn default_lookup_cycle() -> u64 {
    5
}

fn default_activation_barrier() -> u64 {
    30
}

fn default_remove_delay() -> u64 {
    600
}

fn default_model_retention() -> u64 {
    7 * 24 * 3600
}

fn default_force_rewrite() -> u64 {
    3600
}

fn default_max_deltas() -> usize {
    10
}

fn default_host_timeout() -> u64 {
    3600
}

fn default_facts_interval() -> u64 {
    60
}

fn default_worker_start_grace() -> u64 {
    60
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_warning_threshold() -> u32 {
    5
}

fn default_year() -> u32 {
    2024
}

fn default_bandwidth() -> u64 {
    10000
}

fn default_playbook_dir() -> PathBuf {
    PathBuf::from("/opt/siterm/ansible/playbooks")
}

fn default_private_data_dir() -> PathBuf {
    PathBuf::from("/opt/siterm/ansible/data")
}

fn default_ansible_command() -> String {
    crate::shell::ANSIBLE_PLAYBOOK_CMD.to_string()
}

fn default_ansible_timeout() -> u64 {
    120
}

fn default_ansible_retries() -> u32 {
    3
}

fn default_ansible_backoff() -> u64 {
    5
}

fn default_rotate_artifacts() -> usize {
    10
}

fn default_issuer() -> String {
    "https://siterm.local".to_string()
}

fn default_audience() -> String {
    "siterm".to_string()
}

fn default_private_key() -> PathBuf {
    PathBuf::from("/opt/siterm/jwt/private.pem")
}

fn default_access_lifetime() -> u64 {
    900
}

fn default_refresh_lifetime() -> u64 {
    86400
}

fn default_challenge_ttl() -> u64 {
    60
}

fn default_ca_dir() -> PathBuf {
    PathBuf::from("/etc/grid-security/certificates")
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            sites: Vec::new(),
            log_level: default_log_level(),
            privatedir: default_privatedir(),
            webdomain: String::new(),
            probes: default_probes(),
            database: default_database(),
            hostname: default_hostname(),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            sleeptimeok: default_sleeptimeok(),
            sleeptimefailure: default_sleeptimefailure(),
            lookup_cycle: default_lookup_cycle(),
            activation_barrier: default_activation_barrier(),
            remove_delay: default_remove_delay(),
            removed_retention: default_remove_delay(),
            model_retention: default_model_retention(),
            force_rewrite: default_force_rewrite(),
            max_deltas_per_cycle: default_max_deltas(),
            host_timeout: default_host_timeout(),
            facts_interval: default_facts_interval(),
            worker_start_grace: default_worker_start_grace(),
            refresh_interval: default_refresh_interval(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

impl Default for AnsibleConfig {
    fn default() -> Self {
        Self {
            playbook_dir: default_playbook_dir(),
            private_data_dir: default_private_data_dir(),
            command: default_ansible_command(),
            timeout_secs: default_ansible_timeout(),
            retries: default_ansible_retries(),
            retry_backoff_secs: default_ansible_backoff(),
            rotate_artifacts: default_rotate_artifacts(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            audience: default_audience(),
            private_key: default_private_key(),
            previous_private_key: None,
            access_lifetime: default_access_lifetime(),
            refresh_lifetime: default_refresh_lifetime(),
            challenge_ttl: default_challenge_ttl(),
            ca_dir: default_ca_dir(),
            allowed_dns: Vec::new(),
            allowed_dn_regex: Vec::new(),
            admin_dns: Vec::new(),
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl ServicesConfig {
    pub fn sleep_ok(&self) -> Duration {
        Duration::from_secs(self.sleeptimeok)
    }

    pub fn sleep_failure(&self) -> Duration {
        Duration::from_secs(self.sleeptimefailure)
    }

    pub fn lookup_interval(&self) -> Duration {
        Duration::from_secs(self.lookup_cycle)
    }

    pub fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    pub fn worker_grace(&self) -> Duration {
        Duration::from_secs(self.worker_start_grace)
    }

    pub fn facts_refresh(&self) -> Duration {
        Duration::from_secs(self.facts_interval)
    }
}

impl FrontendConfig {
    /// Site section by name.
    pub fn site(&self, name: &str) -> SrmResult<&SiteConfig> {
        self.sites
            .get(name)
            .ok_or_else(|| SrmError::invalid_config(format!("sites.{}", name), "site not configured"))
    }

    /// Switch section by name.
    pub fn switch(&self, name: &str) -> SrmResult<&SwitchConfig> {
        self.switches.get(name).ok_or_else(|| {
            SrmError::invalid_config(format!("switches.{}", name), "switch not configured")
        })
    }

    /// First configured site; most deployments serve exactly one.
    pub fn primary_site(&self) -> SrmResult<(&str, &SiteConfig)> {
        let name = self
            .general
            .sites
            .first()
            .ok_or_else(|| SrmError::invalid_config("general.sites", "no site configured"))?;
        Ok((name.as_str(), self.site(name)?))
    }

    /// QoS policy number for a service class (1 when unset).
    pub fn qos_number(&self, class: &str) -> u32 {
        self.qos_policy.get(class).copied().unwrap_or(1)
    }

    /// Name of the vsw service of a switch.
    pub fn vsw_name<'a>(&'a self, switch: &'a str) -> &'a str {
        self.switches
            .get(switch)
            .and_then(|s| s.vsw.as_deref())
            .unwrap_or(switch)
    }
}

impl ConfigFile for FrontendConfig {
    const DEFAULT_PATH: &'static str = "/etc/siterm.yaml";

    fn validate(&self) -> SrmResult<()> {
        if self.general.sites.is_empty() {
            return Err(SrmError::invalid_config(
                "general.sites",
                "at least one site must be configured",
            ));
        }
        for site_name in &self.general.sites {
            let site = self.site(site_name)?;
            if site.domain.is_empty() {
                return Err(SrmError::invalid_config(
                    format!("sites.{}.domain", site_name),
                    "must not be empty",
                ));
            }
            for switch in &site.switch {
                self.switch(switch)?;
            }
        }
        if self.services.sleeptimeok == 0 || self.services.sleeptimefailure == 0 {
            return Err(SrmError::invalid_config(
                "services",
                "sleeptimeok and sleeptimefailure must be > 0",
            ));
        }
        if self.services.max_deltas_per_cycle == 0 {
            return Err(SrmError::invalid_config(
                "services.max_deltas_per_cycle",
                "must be > 0",
            ));
        }
        for pattern in &self.auth.allowed_dn_regex {
            regex::Regex::new(pattern).map_err(|e| {
                SrmError::invalid_config("auth.allowed_dn_regex", format!("{}: {}", pattern, e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use srm_types::VlanId;

    const SAMPLE: &str = r#"
general:
  sites: [T2_US_TEST]
  webdomain: https://fe.example.org:8443
  logLevel: debug
sites:
  T2_US_TEST:
    domain: example.org
    year: 2023
    vlan_range_list: 3600-3610
    ipv6-address-pool: ["2001:db8:100::/48"]
    ipv6-subnet-pool: ["2001:db8:200::/40"]
    switch: [sw1]
switches:
  sw1:
    network_os: sonic
    vsw: sw1
    rst: true
    vlan_range_list: [3600, 3601, "3700-3705"]
    private_asn: 65000
    ports:
      Ethernet0:
        hostname: dtn01
        vlan_range_list: 3700-3701
qos_policy:
  guaranteedCapped: 7
"#;

    #[test]
    fn test_parse_sample() {
        let config = FrontendConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.general.log_level, "debug");
        let site = config.site("T2_US_TEST").unwrap();
        assert_eq!(site.uri(), "urn:ogf:network:example.org:2023");
        assert_eq!(site.default_bandwidth, 10000);
        assert_eq!(site.address_pool(IpFamily::Ipv6), ["2001:db8:100::/48".to_string()]);
        let sw = config.switch("sw1").unwrap();
        assert_eq!(sw.vlan_range_list.len(), 8);
        assert_eq!(sw.backend, BackendKind::Ansible);
        assert_eq!(config.qos_number("guaranteedCapped"), 7);
        assert_eq!(config.qos_number("bestEffort"), 1);
    }

    #[test]
    fn test_port_range_overrides_switch_range() {
        let config = FrontendConfig::from_yaml_str(SAMPLE).unwrap();
        let sw = config.switch("sw1").unwrap();
        let v3600 = VlanId::new(3600).unwrap();
        let v3701 = VlanId::new(3701).unwrap();
        assert!(sw.port_vlan_range("Ethernet4").contains(v3600));
        assert!(!sw.port_vlan_range("Ethernet0").contains(v3600));
        assert!(sw.port_vlan_range("Ethernet0").contains(v3701));
    }

    #[test]
    fn test_service_defaults() {
        let services = ServicesConfig::default();
        assert_eq!(services.sleep_ok(), Duration::from_secs(10));
        assert_eq!(services.sleep_failure(), Duration::from_secs(30));
        assert_eq!(services.activation_barrier, 30);
        assert_eq!(services.remove_delay, 600);
        assert_eq!(services.max_deltas_per_cycle, 10);
        assert_eq!(services.refresh_check_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_unknown_switch() {
        let yaml = SAMPLE.replace("switch: [sw1]", "switch: [sw1, sw9]");
        let err = FrontendConfig::from_yaml_str(&yaml).unwrap_err();
        assert!(err.to_string().contains("switches.sw9"));
    }

    #[test]
    fn test_validate_no_sites() {
        let err = FrontendConfig::from_yaml_str("general: {}").unwrap_err();
        assert!(matches!(err, SrmError::InvalidConfig { .. }));
    }

    #[test]
    fn test_validate_bad_dn_regex() {
        let yaml = format!("{}auth:\n  allowed_dn_regex: ['CN=(']\n", SAMPLE);
        assert!(FrontendConfig::from_yaml_str(&yaml).is_err());
    }
}
