//! Process configuration (C13): `serde`/`toml`-backed configuration for
//! the agent and server binaries, plus the `SectionConfigRecord` shape
//! used to carry job/target/exclusion/token data as RPC payloads. The
//! flat-file `<type>: <id>` persistence format itself lives outside the
//! core (see SPEC_FULL.md, Out-of-scope).

use crate::error::{Error, Result};
use crate::session::reconnect::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_circuit_break_secs")]
    pub circuit_break_secs: u64,
}

fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_circuit_break_secs() -> u64 {
    60
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        ReconnectSettings {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_jitter: default_jitter(),
            circuit_break_secs: default_circuit_break_secs(),
        }
    }
}

impl ReconnectSettings {
    pub fn into_config(
        self,
        dial: crate::session::reconnect::DialFn,
        probe: crate::session::reconnect::ProbeFn,
    ) -> ReconnectConfig {
        ReconnectConfig {
            dial,
            probe,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_jitter: self.backoff_jitter,
            circuit_break_time: Duration::from_secs(self.circuit_break_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server_url: String,
    pub job_id: String,
    pub snapshot_path: PathBuf,
    pub drive_letter: String,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    pub tls: TlsMaterial,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub bootstrap_tokens: Vec<String>,
}

fn default_worker_count() -> usize {
    num_cpus_fallback()
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

pub fn load_agent_config(path: &std::path::Path) -> Result<AgentConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::from_os_error("read", &path.to_string_lossy(), e))?;
    toml::from_str(&text).map_err(|e| Error::Unknown(format!("invalid agent config: {e}")))
}

pub fn load_server_config(path: &std::path::Path) -> Result<ServerConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::from_os_error("read", &path.to_string_lossy(), e))?;
    toml::from_str(&text).map_err(|e| Error::Unknown(format!("invalid server config: {e}")))
}

/// In-memory shape of one `<type>: <id>\n\t<field> <value>\n...` block
/// from the flat-file section-config format. The core only carries this
/// shape across the RPC boundary; it does not read or write the file
/// format (out of scope).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionConfigRecord {
    pub section_type: String,
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_parses_minimal_toml() {
        let toml_text = r#"
            server_url = "https://backup.example.com"
            job_id = "job-1"
            snapshot_path = "/mnt/snapshot"
            drive_letter = "C"

            [tls]
            cert_path = "/etc/pbs-agent/cert.pem"
            key_path = "/etc/pbs-agent/key.pem"
            ca_path = "/etc/pbs-agent/ca.pem"
        "#;
        let cfg: AgentConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.job_id, "job-1");
        assert_eq!(cfg.reconnect.initial_backoff_ms, 100);
    }

    #[test]
    fn section_config_record_round_trips_via_json() {
        let mut fields = BTreeMap::new();
        fields.insert("path".to_string(), "/data".to_string());
        let record = SectionConfigRecord {
            section_type: "target".into(),
            id: "target-1".into(),
            fields,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: SectionConfigRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
