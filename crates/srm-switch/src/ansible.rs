//! Ansible process-exec backend.
//!
//! Layout below `private_data_dir`:
//! - `inventory/hosts`: YAML inventory, one group per vendor
//! - `inventory/host_vars/<device>.yaml`: connection vars plus the desired
//!   config rendered by the provisioning workers
//! - `artifacts/<device>/`: JSON output of the last runs, rotated
//!
//! Playbooks `getfacts.yaml` and `applyconfig.yaml` live in `playbook_dir`
//! and run through `ansible-playbook` with the JSON stdout callback.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use serde_yaml::Mapping;
use srm_common::config::{AnsibleConfig, SwitchConfig};
use srm_common::shell::{self, shellquote};
use srm_common::{retry, RetryPolicy, SrmError};
use tracing::{debug, info, instrument, warn};

use crate::backend::{ApplyReport, FactsReport, SwitchBackend};
use crate::error::{BackendError, BackendResult};
use crate::facts::{build_switch_facts, INTERFACES_KEY};
use crate::vendor::Vendor;

pub const GETFACTS_PLAYBOOK: &str = "getfacts.yaml";
pub const APPLYCONFIG_PLAYBOOK: &str = "applyconfig.yaml";

/// `ansible-playbook` exits 2 when some hosts failed and 4 when some were
/// unreachable; the JSON output still carries the per-host results.
const PARSEABLE_EXIT_CODES: [i32; 3] = [0, 2, 4];

/// Per-host results of one playbook run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybookRun {
    /// Facts and the task action that produced them.
    pub facts: BTreeMap<String, (Option<String>, Value)>,
    pub errors: BTreeMap<String, Vec<String>>,
    pub ok: BTreeSet<String>,
}

impl PlaybookRun {
    /// Parses the JSON callback output. Anything printed before the
    /// document (deprecation warnings) is skipped.
    pub fn parse(playbook: &str, stdout: &str) -> BackendResult<Self> {
        let start = stdout
            .find('{')
            .ok_or_else(|| BackendError::parse(playbook, "no JSON document in output"))?;
        let doc: Value = serde_json::from_str(&stdout[start..])
            .map_err(|e| BackendError::parse(playbook, e))?;

        let mut run = PlaybookRun::default();
        let tasks = doc["plays"]
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|play| play["tasks"].as_array().into_iter().flatten());
        for task in tasks {
            let Some(hosts) = task["hosts"].as_object() else {
                continue;
            };
            for (host, result) in hosts {
                let failed = result["failed"].as_bool().unwrap_or(false);
                let unreachable = result["unreachable"].as_bool().unwrap_or(false);
                if failed || unreachable {
                    let message = result["msg"]
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| result.to_string());
                    let kind = if unreachable { "dark" } else { "failures" };
                    run.errors
                        .entry(host.clone())
                        .or_default()
                        .push(format!("{}: {}", kind, message));
                    continue;
                }
                let Some(facts) = result.get("ansible_facts") else {
                    continue;
                };
                if facts.get(INTERFACES_KEY).is_some() {
                    let action = result["action"].as_str().map(str::to_string);
                    run.facts.insert(host.clone(), (action, facts.clone()));
                }
            }
        }

        if let Some(stats) = doc["stats"].as_object() {
            for (host, counters) in stats {
                let failures = counters["failures"].as_u64().unwrap_or(0);
                let unreachable = counters["unreachable"].as_u64().unwrap_or(0);
                if failures == 0 && unreachable == 0 {
                    run.ok.insert(host.clone());
                } else if !run.errors.contains_key(host) {
                    run.errors.insert(
                        host.clone(),
                        vec![format!(
                            "failures: {}, unreachable: {}",
                            failures, unreachable
                        )],
                    );
                }
            }
        }
        Ok(run)
    }
}

/// Switch backend that drives devices through Ansible playbooks.
pub struct AnsibleBackend {
    settings: AnsibleConfig,
    devices: BTreeMap<String, (Vendor, SwitchConfig)>,
    #[cfg(test)]
    mock_mode: bool,
    #[cfg(test)]
    mock_outputs: BTreeMap<String, String>,
    #[cfg(test)]
    captured_commands: std::sync::Mutex<Vec<String>>,
}

impl AnsibleBackend {
    pub fn new(
        settings: AnsibleConfig,
        switches: BTreeMap<String, SwitchConfig>,
    ) -> BackendResult<Self> {
        let mut devices = BTreeMap::new();
        for (name, switch) in switches {
            let vendor: Vendor = switch.network_os.parse()?;
            devices.insert(name, (vendor, switch));
        }
        Ok(Self {
            settings,
            devices,
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            mock_outputs: BTreeMap::new(),
            #[cfg(test)]
            captured_commands: std::sync::Mutex::new(Vec::new()),
        })
    }

    #[cfg(test)]
    pub fn with_mock_mode(mut self) -> Self {
        self.mock_mode = true;
        self
    }

    /// Output returned for commands running `playbook` in mock mode.
    #[cfg(test)]
    pub fn with_mock_output(mut self, playbook: &str, stdout: impl Into<String>) -> Self {
        self.mock_outputs.insert(playbook.to_string(), stdout.into());
        self
    }

    #[cfg(test)]
    pub fn captured_commands(&self) -> Vec<String> {
        self.captured_commands
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn inventory_path(&self) -> PathBuf {
        self.settings.private_data_dir.join("inventory").join("hosts")
    }

    fn host_vars_path(&self, device: &str) -> PathBuf {
        self.settings
            .private_data_dir
            .join("inventory")
            .join("host_vars")
            .join(format!("{}.yaml", device))
    }

    fn artifacts_dir(&self, label: &str) -> PathBuf {
        self.settings.private_data_dir.join("artifacts").join(label)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.retries.max(1),
            Duration::from_secs(self.settings.retry_backoff_secs),
        )
    }

    /// Writes the inventory listing every managed device under its vendor
    /// group.
    pub fn write_inventory(&self) -> BackendResult<()> {
        let mut groups: BTreeMap<&str, BTreeMap<&str, Mapping>> = BTreeMap::new();
        for (device, (vendor, _)) in &self.devices {
            groups
                .entry(vendor.as_str())
                .or_default()
                .insert(device.as_str(), Mapping::new());
        }
        let inventory: BTreeMap<&str, BTreeMap<&str, BTreeMap<&str, Mapping>>> = groups
            .into_iter()
            .map(|(group, hosts)| (group, BTreeMap::from([("hosts", hosts)])))
            .collect();
        write_atomic(&self.inventory_path(), &serde_yaml::to_string(&inventory)?)
    }

    /// Current host vars of a device; a missing file reads as empty.
    pub fn host_config(&self, device: &str) -> BackendResult<Mapping> {
        let path = self.host_vars_path(device);
        if !path.exists() {
            return Ok(Mapping::new());
        }
        let content =
            fs::read_to_string(&path).map_err(|e| BackendError::io(path.display().to_string(), e))?;
        if content.trim().is_empty() {
            return Ok(Mapping::new());
        }
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Replaces the desired sections of a device's host vars, keeping its
    /// `ansible_*` connection settings.
    pub fn write_host_config(&self, device: &str, desired: &Mapping) -> BackendResult<()> {
        let (vendor, _) = self.device(device)?;
        let path = self.host_vars_path(device);
        if !path.exists() {
            warn!(device, path = %path.display(), "Host vars missing, connection settings must be added");
        }
        let mut config = self.host_config(device)?;
        config.retain(|key, _| key.as_str().is_some_and(|k| k.starts_with("ansible_")));
        config.insert(
            "ansible_network_os".into(),
            vendor.ansible_network_os().into(),
        );
        for (key, value) in desired {
            config.insert(key.clone(), value.clone());
        }
        write_atomic(&path, &serde_yaml::to_string(&config)?)
    }

    fn device(&self, device: &str) -> BackendResult<&(Vendor, SwitchConfig)> {
        self.devices
            .get(device)
            .ok_or_else(|| BackendError::NotConfigured {
                device: device.to_string(),
                message: "not managed by the ansible backend".to_string(),
            })
    }

    fn playbook_command(&self, playbook: &str, devices: &[String]) -> String {
        format!(
            "ANSIBLE_STDOUT_CALLBACK=json ANSIBLE_LOAD_CALLBACK_PLUGINS=1 \
             ANSIBLE_HOST_KEY_CHECKING=False {} -i {} --limit {} {}",
            self.settings.command,
            shellquote(&self.inventory_path().display().to_string()),
            shellquote(&devices.join(",")),
            shellquote(&self.settings.playbook_dir.join(playbook).display().to_string())
        )
    }

    async fn exec(&self, playbook: &str, cmd: &str) -> BackendResult<String> {
        #[cfg(test)]
        if self.mock_mode {
            if let Ok(mut captured) = self.captured_commands.lock() {
                captured.push(cmd.to_string());
            }
            info!("Mock exec: {}", cmd);
            return Ok(self.mock_outputs.get(playbook).cloned().unwrap_or_default());
        }

        let timeout = Duration::from_secs(self.settings.timeout_secs);
        let result = shell::exec_with_timeout(cmd, timeout)
            .await
            .map_err(|err| match err {
                SrmError::Timeout { seconds, .. } => BackendError::Timeout {
                    playbook: playbook.to_string(),
                    seconds,
                },
                other => BackendError::Run {
                    playbook: playbook.to_string(),
                    message: other.to_string(),
                },
            })?;
        if !PARSEABLE_EXIT_CODES.contains(&result.exit_code) {
            return Err(BackendError::Run {
                playbook: playbook.to_string(),
                message: format!("exit code {}: {}", result.exit_code, result.stderr.trim()),
            });
        }
        Ok(result.stdout)
    }

    /// Runs a playbook limited to `devices` and parses the results.
    #[instrument(skip(self))]
    pub async fn run_playbook(
        &self,
        playbook: &str,
        devices: &[String],
    ) -> BackendResult<PlaybookRun> {
        self.write_inventory()?;
        let cmd = self.playbook_command(playbook, devices);
        let stdout = retry(self.retry_policy(), playbook, || self.exec(playbook, &cmd)).await?;
        let label = match devices {
            [single] => single.as_str(),
            _ => "all",
        };
        if let Err(err) = self.store_artifact(label, playbook, &stdout) {
            warn!(playbook, error = %err, "Failed to store run artifact");
        }
        PlaybookRun::parse(playbook, &stdout)
    }

    /// Keeps the output of the run and drops the oldest artifacts beyond
    /// `rotate_artifacts`.
    fn store_artifact(&self, label: &str, playbook: &str, stdout: &str) -> BackendResult<()> {
        let dir = self.artifacts_dir(label);
        fs::create_dir_all(&dir).map_err(|e| BackendError::io(dir.display().to_string(), e))?;
        let stem = playbook.trim_end_matches(".yaml");
        let name = format!(
            "{}-{}.json",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            stem
        );
        let path = dir.join(name);
        fs::write(&path, stdout).map_err(|e| BackendError::io(path.display().to_string(), e))?;
        rotate(&dir, self.settings.rotate_artifacts)
    }
}

fn write_atomic(path: &Path, content: &str) -> BackendResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| BackendError::io(parent.display().to_string(), e))?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).map_err(|e| BackendError::io(tmp.display().to_string(), e))?;
    fs::rename(&tmp, path).map_err(|e| BackendError::io(path.display().to_string(), e))
}

/// Removes the oldest files of `dir` so at most `keep` remain. File names
/// start with a timestamp, so name order is age order.
fn rotate(dir: &Path, keep: usize) -> BackendResult<()> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| BackendError::io(dir.display().to_string(), e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    if files.len() <= keep {
        return Ok(());
    }
    files.sort();
    let excess = files.len() - keep;
    for path in files.into_iter().take(excess) {
        debug!(path = %path.display(), "Rotating artifact");
        fs::remove_file(&path).map_err(|e| BackendError::io(path.display().to_string(), e))?;
    }
    Ok(())
}

#[async_trait]
impl SwitchBackend for AnsibleBackend {
    fn name(&self) -> &'static str {
        "ansible"
    }

    async fn get_facts(&self, devices: &[String]) -> BackendResult<FactsReport> {
        let mut report = FactsReport::default();
        let managed: Vec<String> = devices
            .iter()
            .filter(|d| self.devices.contains_key(d.as_str()))
            .cloned()
            .collect();
        for device in devices.iter().filter(|d| !managed.contains(d)) {
            report.add_error(device, "not managed by the ansible backend");
        }
        if managed.is_empty() {
            return Ok(report);
        }

        let run = self.run_playbook(GETFACTS_PLAYBOOK, &managed).await?;
        for device in &managed {
            if let Some(errors) = run.errors.get(device) {
                for error in errors {
                    warn!(device = %device, error = %error, "Facts collection failed");
                    report.add_error(device, error.clone());
                }
                continue;
            }
            let Some((action, facts)) = run.facts.get(device) else {
                report.add_error(device, "no facts returned");
                continue;
            };
            let (vendor, config) = &self.devices[device];
            if let Some(action) = action {
                match Vendor::from_facts_module(action) {
                    Some(reported) if reported != *vendor => warn!(
                        device = %device,
                        configured = %vendor,
                        reported = %reported,
                        "Facts module does not match configured network OS"
                    ),
                    None => warn!(device = %device, action = %action, "Unsupported facts module"),
                    _ => {}
                }
            }
            report
                .facts
                .insert(device.clone(), build_switch_facts(device, *vendor, facts, config));
        }
        info!(
            devices = managed.len(),
            collected = report.facts.len(),
            "Collected switch facts"
        );
        Ok(report)
    }

    async fn apply_config(&self, desired: &BTreeMap<String, Mapping>) -> BackendResult<ApplyReport> {
        let mut report = ApplyReport::default();
        let mut targets = Vec::new();
        for (device, config) in desired {
            match self.write_host_config(device, config) {
                Ok(()) => targets.push(device.clone()),
                Err(err) => report.add_error(device, err.to_string()),
            }
        }
        if targets.is_empty() {
            return Ok(report);
        }

        let run = self.run_playbook(APPLYCONFIG_PLAYBOOK, &targets).await?;
        for device in targets {
            match run.errors.get(&device) {
                Some(errors) => {
                    for error in errors {
                        warn!(device = %device, error = %error, "Config apply failed");
                        report.add_error(&device, error.clone());
                    }
                }
                None => {
                    info!(device = %device, "Config applied");
                    report.applied.insert(device);
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const FACTS_OUTPUT: &str = r#"[DEPRECATION WARNING]: callback plugin setting is deprecated
{
  "plays": [{
    "play": {"name": "Get facts"},
    "tasks": [{
      "task": {"name": "Collect facts"},
      "hosts": {
        "sw1": {
          "action": "sense.sonic.sonic_facts",
          "changed": false,
          "ansible_facts": {
            "ansible_net_interfaces": {
              "Ethernet0": {"switchport": "yes", "bandwidth": 100000, "mtu": 9100},
              "Ethernet8": {"switchport": "no"},
              "Vlan3001": {"tagged": ["Ethernet0"]}
            },
            "ansible_net_info": {"macs": ["0c:42:a1:00:00:01"]}
          }
        },
        "sw2": {"unreachable": true, "msg": "ssh: connect to host sw2 port 22: No route to host"}
      }
    }]
  }],
  "stats": {
    "sw1": {"ok": 1, "failures": 0, "unreachable": 0},
    "sw2": {"ok": 0, "failures": 0, "unreachable": 1}
  }
}"#;

    const APPLY_OUTPUT: &str = r#"{
  "plays": [{"tasks": [{"hosts": {
    "sw1": {"action": "sense.sonic.sonic_config", "changed": true},
    "sw2": {"failed": true, "msg": "vlan 3001 does not exist"}
  }}]}],
  "stats": {
    "sw1": {"ok": 1, "failures": 0, "unreachable": 0},
    "sw2": {"ok": 0, "failures": 1, "unreachable": 0}
  }
}"#;

    fn backend(dir: &TempDir) -> AnsibleBackend {
        let settings = AnsibleConfig {
            playbook_dir: dir.path().join("playbooks"),
            private_data_dir: dir.path().join("data"),
            rotate_artifacts: 2,
            ..Default::default()
        };
        let switch = |os: &str| SwitchConfig {
            network_os: os.to_string(),
            ..Default::default()
        };
        let switches = BTreeMap::from([
            ("sw1".to_string(), switch("sonic")),
            ("sw2".to_string(), switch("dellos9")),
        ]);
        AnsibleBackend::new(settings, switches).unwrap().with_mock_mode()
    }

    fn desired(vlan: &str) -> Mapping {
        serde_yaml::from_str(&format!(
            "interface:\n  {}:\n    vlanid: 3001\n    state: present\n",
            vlan
        ))
        .unwrap()
    }

    #[test]
    fn test_unknown_network_os_is_rejected() {
        let switches = BTreeMap::from([(
            "sw9".to_string(),
            SwitchConfig {
                network_os: "junos".to_string(),
                ..Default::default()
            },
        )]);
        assert!(matches!(
            AnsibleBackend::new(AnsibleConfig::default(), switches),
            Err(BackendError::UnknownVendor(_))
        ));
    }

    #[test]
    fn test_parse_collects_facts_and_errors() {
        let run = PlaybookRun::parse(GETFACTS_PLAYBOOK, FACTS_OUTPUT).unwrap();
        assert!(run.facts.contains_key("sw1"));
        assert_eq!(
            run.facts["sw1"].0.as_deref(),
            Some("sense.sonic.sonic_facts")
        );
        assert_eq!(run.errors["sw2"].len(), 1);
        assert!(run.errors["sw2"][0].starts_with("dark: ssh"));
        assert_eq!(run.ok, BTreeSet::from(["sw1".to_string()]));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PlaybookRun::parse(GETFACTS_PLAYBOOK, "ERROR! no inventory").is_err());
    }

    #[tokio::test]
    async fn test_get_facts() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).with_mock_output(GETFACTS_PLAYBOOK, FACTS_OUTPUT);
        let devices = vec!["sw1".to_string(), "sw2".to_string(), "sw3".to_string()];

        let report = backend.get_facts(&devices).await.unwrap();

        let sw1 = &report.facts["sw1"];
        assert_eq!(sw1.ports.keys().collect::<Vec<_>>(), vec!["Ethernet0"]);
        assert!(sw1.vlans.contains_key("Vlan3001"));
        assert_eq!(sw1.nametomac["sw1"], "0c:42:a1:00:00:01");
        assert!(report.errors.contains_key("sw2"));
        assert!(report.errors.contains_key("sw3"));

        let commands = backend.captured_commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("ANSIBLE_STDOUT_CALLBACK=json"));
        assert!(commands[0].contains("--limit \"sw1,sw2\""));
        assert!(commands[0].ends_with("getfacts.yaml\""));

        let inventory = fs::read_to_string(dir.path().join("data/inventory/hosts")).unwrap();
        let inventory: serde_yaml::Value = serde_yaml::from_str(&inventory).unwrap();
        assert!(inventory["sonic"]["hosts"]["sw1"].is_mapping());
        assert!(inventory["dellos9"]["hosts"]["sw2"].is_mapping());
    }

    #[tokio::test]
    async fn test_apply_config_writes_host_vars() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).with_mock_output(APPLYCONFIG_PLAYBOOK, APPLY_OUTPUT);
        let host_vars = dir.path().join("data/inventory/host_vars/sw1.yaml");
        write_atomic(
            &host_vars,
            "ansible_host: 10.0.0.1\nansible_user: admin\ninterface:\n  Vlan100: {}\n",
        )
        .unwrap();

        let desired = BTreeMap::from([
            ("sw1".to_string(), desired("Vlan3001")),
            ("sw2".to_string(), desired("Vlan 3001")),
        ]);
        let report = backend.apply_config(&desired).await.unwrap();

        assert!(report.is_ok("sw1"));
        assert!(!report.is_ok("sw2"));
        assert!(report.errors["sw2"][0].contains("vlan 3001 does not exist"));

        let written = backend.host_config("sw1").unwrap();
        assert_eq!(written["ansible_host"], serde_yaml::Value::from("10.0.0.1"));
        assert_eq!(
            written["ansible_network_os"],
            serde_yaml::Value::from("sense.sonic.sonic")
        );
        let interfaces = written["interface"].as_mapping().unwrap();
        assert_eq!(interfaces.len(), 1);
        assert!(interfaces.contains_key("Vlan3001"));
        assert_eq!(
            backend.host_config("sw2").unwrap()["ansible_network_os"],
            serde_yaml::Value::from("sense.dellos9.dellos9")
        );
    }

    #[tokio::test]
    async fn test_artifacts_are_rotated() {
        let dir = TempDir::new().unwrap();
        let backend = backend(&dir).with_mock_output(GETFACTS_PLAYBOOK, FACTS_OUTPUT);
        let devices = vec!["sw1".to_string()];
        for _ in 0..4 {
            backend.get_facts(&devices).await.unwrap();
        }
        let artifacts = fs::read_dir(dir.path().join("data/artifacts/sw1"))
            .unwrap()
            .count();
        assert_eq!(artifacts, 2);
    }
}
