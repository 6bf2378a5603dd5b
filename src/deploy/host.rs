use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::model::HostType;

/// A target host a Deploy Task can resolve `(host_type, host_name)`
/// against (spec §4.9's supplemented host registry — no component in the
/// distilled spec owns creating these records, so one is added here
/// following the same atomic-JSON-file pattern as `PipelineStore`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub name: String,
    pub host_type: HostType,
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub portainer_endpoint: Option<String>,
    #[serde(default)]
    pub portainer_environment_id: Option<String>,
    #[serde(default)]
    pub ssh_address: Option<String>,
}

fn file_stem(host_type: HostType, name: &str) -> String {
    let kind = match host_type {
        HostType::Agent => "agent",
        HostType::Portainer => "portainer",
        HostType::Ssh => "ssh",
    };
    format!("{kind}__{name}")
}

pub struct HostRegistry {
    dir: PathBuf,
    inner: RwLock<BTreeMap<(HostType, String), HostRecord>>,
}

impl HostRegistry {
    pub fn load(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating hosts dir {}", dir.display()))?;

        let mut hosts = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let host: HostRecord = serde_json::from_str(&content)
                    .with_context(|| format!("parsing {}", path.display()))?;
                hosts.insert((host.host_type, host.name.clone()), host);
            }
        }

        Ok(Self {
            dir,
            inner: RwLock::new(hosts),
        })
    }

    fn write_through(dir: &std::path::Path, host: &HostRecord) -> Result<()> {
        let stem = file_stem(host.host_type, &host.name);
        let path = dir.join(format!("{stem}.json"));
        let tmp_path = dir.join(format!("{stem}.json.tmp"));
        let content = serde_json::to_string_pretty(host)?;
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn put(&self, host: HostRecord) -> Result<HostRecord> {
        Self::write_through(&self.dir, &host)?;
        self.inner
            .write()
            .unwrap()
            .insert((host.host_type, host.name.clone()), host.clone());
        Ok(host)
    }

    pub fn get(&self, host_type: HostType, name: &str) -> Option<HostRecord> {
        self.inner
            .read()
            .unwrap()
            .get(&(host_type, name.to_string()))
            .cloned()
    }

    pub fn delete(&self, host_type: HostType, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if inner.remove(&(host_type, name.to_string())).is_some() {
            let _ = std::fs::remove_file(self.dir.join(format!("{}.json", file_stem(host_type, name))));
            true
        } else {
            false
        }
    }

    pub fn list(&self) -> Vec<HostRecord> {
        self.inner.read().unwrap().values().cloned().collect()
    }
}
