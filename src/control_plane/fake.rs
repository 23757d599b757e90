//! In-memory control plane for tests: canned inventory, injected failures,
//! and a call log.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::error::{ControlPlaneErrorKind, RagnatrampError};

use super::{CheckpointInfo, ControlPlane, CreateVmParams, LiveVm, PowerState};

#[derive(Default)]
struct Inner {
    vms: Vec<LiveVm>,
    checkpoints: BTreeMap<String, Vec<CheckpointInfo>>,
    files: BTreeSet<String>,
    failures: Vec<(String, String, ControlPlaneErrorKind)>,
    calls: Vec<String>,
    next_id: u32,
}

#[derive(Default)]
pub struct FakeControlPlane {
    inner: Mutex<Inner>,
    /// When set, graceful stops are accepted but the VM keeps running.
    pub ignore_graceful_stop: bool,
    /// When set, a graceful stop removes the VM from the inventory.
    pub vanish_on_graceful_stop: bool,
    pub unavailable: bool,
    pub no_default_switch: bool,
}

pub fn live_vm(name: &str, power_state: PowerState, notes: Option<&str>) -> LiveVm {
    LiveVm {
        id: format!("guid-{name}"),
        name: name.into(),
        power_state,
        notes: notes.map(String::from),
        memory_mb: 2048,
        cpu_count: 2,
    }
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vm(self, vm: LiveVm) -> Self {
        self.inner.lock().unwrap().vms.push(vm);
        self
    }

    pub fn with_file(self, path: &str) -> Self {
        self.inner.lock().unwrap().files.insert(path.into());
        self
    }

    /// Make `operation` on `target` fail with `kind`.
    pub fn fail(&self, operation: &str, target: &str, kind: ControlPlaneErrorKind) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .push((operation.into(), target.into(), kind));
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failures.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Calls excluding read-only inventory queries.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("list-") && !c.starts_with("check-"))
            .collect()
    }

    pub fn vm(&self, name: &str) -> Option<LiveVm> {
        self.inner
            .lock()
            .unwrap()
            .vms
            .iter()
            .find(|v| v.name == name)
            .cloned()
    }

    pub fn inventory(&self) -> Vec<LiveVm> {
        self.inner.lock().unwrap().vms.clone()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.inner.lock().unwrap().files.contains(path)
    }

    /// Drop a checkpoint behind the executor's back.
    pub fn forget_checkpoint(&self, vm: &str, checkpoint: &str) {
        if let Some(list) = self.inner.lock().unwrap().checkpoints.get_mut(vm) {
            list.retain(|c| c.name != checkpoint);
        }
    }

    pub fn checkpoint_names(&self, vm: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .checkpoints
            .get(vm)
            .map(|c| c.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    fn record(&self, operation: &str, target: &str) -> Result<(), RagnatrampError> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(format!("{operation} {target}").trim_end().to_string());
        self.injected(operation, target)
    }

    fn injected(&self, operation: &str, target: &str) -> Result<(), RagnatrampError> {
        let inner = self.inner.lock().unwrap();
        let failure = inner
            .failures
            .iter()
            .find(|(op, t, _)| op == operation && t == target)
            .map(|(_, _, kind)| *kind);
        match failure {
            Some(kind) => Err(RagnatrampError::control_plane(
                kind,
                format!("{operation} {target}: injected failure"),
            )),
            None => Ok(()),
        }
    }

    fn set_power(&self, name: &str, state: PowerState) -> Result<(), RagnatrampError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.vms.iter_mut().find(|v| v.name == name) {
            Some(vm) => {
                vm.power_state = state;
                Ok(())
            }
            None => Err(not_found(name)),
        }
    }
}

fn not_found(name: &str) -> RagnatrampError {
    RagnatrampError::control_plane(
        ControlPlaneErrorKind::NotFound,
        format!("unable to find a virtual machine with name '{name}'"),
    )
}

impl ControlPlane for FakeControlPlane {
    async fn list_vms(&self) -> Result<Vec<LiveVm>, RagnatrampError> {
        self.record("list-vms", "")?;
        Ok(self.inventory())
    }

    async fn create_vm(&self, params: &CreateVmParams) -> Result<LiveVm, RagnatrampError> {
        self.record("create-vm", &params.name)?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let vm = LiveVm {
            id: format!("guid-{}", inner.next_id),
            name: params.name.clone(),
            power_state: PowerState::Off,
            notes: Some(params.notes.clone()),
            memory_mb: params.memory_mb,
            cpu_count: params.cpu,
        };
        inner.vms.push(vm.clone());
        inner.files.insert(params.disk_path.display().to_string());
        Ok(vm)
    }

    async fn start_vm(&self, name: &str) -> Result<(), RagnatrampError> {
        self.record("start-vm", name)?;
        self.set_power(name, PowerState::Running)
    }

    async fn stop_vm(&self, name: &str) -> Result<(), RagnatrampError> {
        self.record("stop-vm", name)?;
        if self.vanish_on_graceful_stop {
            self.inner.lock().unwrap().vms.retain(|v| v.name != name);
            return Ok(());
        }
        if self.ignore_graceful_stop {
            return Ok(());
        }
        self.set_power(name, PowerState::Off)
    }

    async fn force_stop_vm(&self, name: &str) -> Result<(), RagnatrampError> {
        self.record("force-stop-vm", name)?;
        self.set_power(name, PowerState::Off)
    }

    async fn remove_vm(&self, name: &str) -> Result<(), RagnatrampError> {
        self.record("remove-vm", name)?;
        let mut inner = self.inner.lock().unwrap();
        let before = inner.vms.len();
        inner.vms.retain(|v| v.name != name);
        if inner.vms.len() == before {
            return Err(not_found(name));
        }
        inner.checkpoints.remove(name);
        Ok(())
    }

    async fn create_checkpoint(
        &self,
        vm: &str,
        checkpoint: &str,
    ) -> Result<CheckpointInfo, RagnatrampError> {
        self.record("create-checkpoint", vm)?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let info = CheckpointInfo {
            id: format!("snap-{}", inner.next_id),
            name: checkpoint.into(),
            created_at: "2026-01-01T00:00:00.0000000Z".into(),
        };
        inner.checkpoints.entry(vm.into()).or_default().push(info.clone());
        Ok(info)
    }

    async fn restore_checkpoint(&self, vm: &str, checkpoint: &str) -> Result<(), RagnatrampError> {
        self.record("restore-checkpoint", vm)?;
        let inner = self.inner.lock().unwrap();
        let exists = inner
            .checkpoints
            .get(vm)
            .is_some_and(|c| c.iter().any(|c| c.name == checkpoint));
        if exists {
            Ok(())
        } else {
            Err(not_found(checkpoint))
        }
    }

    async fn list_checkpoints(&self, vm: &str) -> Result<Vec<CheckpointInfo>, RagnatrampError> {
        self.record("list-checkpoints", vm)?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .checkpoints
            .get(vm)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_checkpoint(&self, vm: &str, checkpoint: &str) -> Result<(), RagnatrampError> {
        self.record("remove-checkpoint", vm)?;
        // Failures for a single checkpoint are keyed as `vm/checkpoint`.
        self.injected("remove-checkpoint", &format!("{vm}/{checkpoint}"))?;
        let mut inner = self.inner.lock().unwrap();
        let list = inner.checkpoints.entry(vm.into()).or_default();
        let before = list.len();
        list.retain(|c| c.name != checkpoint);
        if list.len() == before {
            return Err(not_found(checkpoint));
        }
        Ok(())
    }

    async fn is_available(&self) -> Result<bool, RagnatrampError> {
        self.record("check-available", "")?;
        Ok(!self.unavailable)
    }

    async fn default_switch_exists(&self) -> Result<bool, RagnatrampError> {
        self.record("check-default-switch", "")?;
        Ok(!self.no_default_switch)
    }

    async fn file_exists(&self, path: &str) -> Result<bool, RagnatrampError> {
        self.record("check-file", path)?;
        Ok(self.has_file(path))
    }

    async fn delete_file(&self, path: &str) -> Result<(), RagnatrampError> {
        self.record("delete-file", path)?;
        self.inner.lock().unwrap().files.remove(path);
        Ok(())
    }
}
