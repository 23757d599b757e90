//! The ownership ledger: which VMs this tool created for a given config.
//!
//! One JSON file per config, written atomically (temp file + rename). A missing
//! file means "nothing created yet"; anything unreadable is `StateCorrupt`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use facet::Facet;

use crate::error::RagnatrampError;
use crate::identity;

/// Ledger schema version written by this build.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(rename_all = "camelCase")]
pub struct StateFile {
    pub version: u32,
    pub config_hash: String,
    pub config_path: String,
    pub project: String,
    pub created_at: String,
    pub updated_at: String,
    #[facet(default)]
    pub vms: BTreeMap<String, VmState>,
}

/// A VM this tool created, keyed by machine name in [`StateFile::vms`].
#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(rename_all = "camelCase")]
pub struct VmState {
    pub id: String,
    pub name: String,
    pub machine_name: String,
    pub disk_path: String,
    pub created_at: String,
    #[facet(default)]
    pub checkpoints: Vec<CheckpointState>,
}

#[derive(Debug, Clone, PartialEq, Facet)]
#[facet(rename_all = "camelCase")]
pub struct CheckpointState {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Facet)]
struct VersionProbe {
    #[facet(default)]
    version: Option<u32>,
}

/// RFC 3339 UTC timestamp used for every ledger field.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl StateFile {
    pub fn new(project: &str, config_path: &Path, config_hash: &str) -> Self {
        let ts = now();
        Self {
            version: STATE_VERSION,
            config_hash: config_hash.into(),
            config_path: config_path.display().to_string(),
            project: project.into(),
            created_at: ts.clone(),
            updated_at: ts,
            vms: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now();
    }

    pub fn upsert_vm(&mut self, machine_name: &str, vm: VmState) {
        self.vms.insert(machine_name.to_string(), vm);
        self.touch();
    }

    pub fn remove_vm(&mut self, machine_name: &str) -> Option<VmState> {
        let removed = self.vms.remove(machine_name);
        self.touch();
        removed
    }

    /// Record a checkpoint. Names are unique per VM.
    pub fn add_checkpoint(
        &mut self,
        machine_name: &str,
        checkpoint: CheckpointState,
    ) -> Result<(), RagnatrampError> {
        let Some(vm) = self.vms.get_mut(machine_name) else {
            return Err(RagnatrampError::NoSuchMachine {
                name: machine_name.into(),
                available: self.vms.keys().cloned().collect::<Vec<_>>().join(", "),
            });
        };
        if vm.has_checkpoint(&checkpoint.name) {
            return Err(RagnatrampError::CheckpointExists {
                machine: machine_name.into(),
                checkpoint: checkpoint.name,
            });
        }
        vm.checkpoints.push(checkpoint);
        self.touch();
        Ok(())
    }

    /// Drop the named checkpoints from a VM's record; unknown names are ignored.
    pub fn remove_checkpoints(&mut self, machine_name: &str, names: &[String]) {
        if let Some(vm) = self.vms.get_mut(machine_name) {
            vm.checkpoints.retain(|c| !names.contains(&c.name));
        }
        self.touch();
    }

    /// Entry whose deterministic name equals `name`.
    pub fn find_by_name(&self, name: &str) -> Option<&VmState> {
        self.vms.values().find(|vm| vm.name == name)
    }

    fn validate(&self, path: &Path) -> Result<(), RagnatrampError> {
        for (key, vm) in &self.vms {
            if key != &vm.machine_name {
                return Err(RagnatrampError::state_corrupt(
                    path.display(),
                    format!("entry '{key}' records machine name '{}'", vm.machine_name),
                ));
            }
            if !identity::is_managed_name(&vm.name) {
                return Err(RagnatrampError::state_corrupt(
                    path.display(),
                    format!("entry '{key}' has malformed VM name '{}'", vm.name),
                ));
            }
            let mut names: Vec<&str> = vm.checkpoints.iter().map(|c| c.name.as_str()).collect();
            names.sort_unstable();
            if names.windows(2).any(|w| w[0] == w[1]) {
                return Err(RagnatrampError::state_corrupt(
                    path.display(),
                    format!("entry '{key}' has duplicate checkpoint names"),
                ));
            }
        }
        Ok(())
    }
}

impl VmState {
    pub fn has_checkpoint(&self, name: &str) -> bool {
        self.checkpoints.iter().any(|c| c.name == name)
    }

    pub fn checkpoint(&self, name: &str) -> Option<&CheckpointState> {
        self.checkpoints.iter().find(|c| c.name == name)
    }
}

/// Read the ledger. `Ok(None)` when the file does not exist.
pub fn load(path: &Path) -> Result<Option<StateFile>, RagnatrampError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(RagnatrampError::state_corrupt(
                path.display(),
                format!("unreadable: {e}"),
            ));
        }
    };

    let probe: VersionProbe = facet_json::from_str(&contents)
        .map_err(|e| RagnatrampError::state_corrupt(path.display(), e.to_string()))?;
    match probe.version {
        Some(STATE_VERSION) => {}
        Some(v) => {
            return Err(RagnatrampError::state_corrupt(
                path.display(),
                format!("unsupported schema version {v} (expected {STATE_VERSION})"),
            ));
        }
        None => {
            return Err(RagnatrampError::state_corrupt(
                path.display(),
                "missing schema version",
            ));
        }
    }

    let state: StateFile = facet_json::from_str(&contents)
        .map_err(|e| RagnatrampError::state_corrupt(path.display(), e.to_string()))?;
    state.validate(path)?;

    tracing::debug!(path = %path.display(), vms = state.vms.len(), "loaded state file");
    Ok(Some(state))
}

/// Temp file used by [`save`]; lives next to the ledger so the rename is atomic.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write the ledger atomically.
pub fn save(path: &Path, state: &StateFile) -> Result<(), RagnatrampError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RagnatrampError::StateIo {
            context: format!("create directory {}", parent.display()),
            source,
        })?;
    }

    let json = facet_json::to_string_pretty(state).map_err(|e| RagnatrampError::StateIo {
        context: format!("serialize state for {}", path.display()),
        source: std::io::Error::other(e.to_string()),
    })?;

    let tmp = temp_path(path);
    write_synced(&tmp, json.as_bytes()).map_err(|source| RagnatrampError::StateIo {
        context: format!("write {}", tmp.display()),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| RagnatrampError::StateIo {
        context: format!("rename {} to {}", tmp.display(), path.display()),
        source,
    })?;

    tracing::debug!(path = %path.display(), vms = state.vms.len(), "saved state file");
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
