//! Applying a plan.
//!
//! Actions run one at a time, in order. Each one moves through
//! `pending → verifying → executing → completed | failed | skipped`;
//! verification is skipped only for a VM created earlier in the same batch.
//! The ledger is saved after every completed action, so an interrupted run
//! leaves it matching the work that actually happened. A failed action does
//! not stop the batch, but a ledger that cannot be saved does.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};

use crate::config::ResolvedConfig;
use crate::control_plane::{ControlPlane, CreateVmParams, LiveVm, PowerState, find_by_name};
use crate::error::{ControlPlaneErrorKind, RagnatrampError};
use crate::identity;
use crate::observer::ApplyObserver;
use crate::plan::{Action, ActionKind};
use crate::report::{ActionOutcome, ApplyReport};
use crate::state::{self, CheckpointState, StateFile, VmState};
use crate::verify::{self, Subject};

#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions {
    /// How long a graceful shutdown may take before the VM is powered off.
    pub stop_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct Applied {
    pub report: ApplyReport,
    /// Ledger after the run; `None` if there was none and nothing was created.
    pub state: Option<StateFile>,
}

enum Step {
    Done(Option<String>),
    Skipped(String),
}

pub struct Executor<'a, C> {
    client: &'a C,
    config: &'a ResolvedConfig,
    state_path: PathBuf,
    state: Option<StateFile>,
    options: ExecutorOptions,
    created: BTreeSet<String>,
    failed: BTreeSet<String>,
}

impl<'a, C: ControlPlane> Executor<'a, C> {
    pub fn new(client: &'a C, config: &'a ResolvedConfig, state: Option<StateFile>) -> Self {
        Self {
            client,
            config,
            state_path: config.state_path(),
            state,
            options: ExecutorOptions::default(),
            created: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn apply(
        mut self,
        actions: &[Action],
        observer: &mut dyn ApplyObserver,
    ) -> Result<Applied, RagnatrampError> {
        let mut report = ApplyReport::default();
        observer.batch_started(actions.len());

        for action in actions {
            observer.action_started(action);
            let outcome = if self.failed.contains(&action.target_name) {
                ActionOutcome::skipped(action, "an earlier action on this VM failed")
            } else {
                match self.run(action).await {
                    Ok(Step::Done(detail)) => {
                        tracing::info!(action = action.label(), vm = %action.target_name, "completed");
                        ActionOutcome::completed(action, detail)
                    }
                    Ok(Step::Skipped(reason)) => {
                        tracing::info!(action = action.label(), vm = %action.target_name, %reason, "skipped");
                        ActionOutcome::skipped(action, reason)
                    }
                    Err(e @ RagnatrampError::StateIo { .. }) => {
                        tracing::error!(error = %e, "could not save state file; aborting");
                        observer.action_finished(&ActionOutcome::failed(action, &e));
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(action = action.label(), vm = %action.target_name, error = %e, "failed");
                        self.failed.insert(action.target_name.clone());
                        ActionOutcome::failed(action, &e)
                    }
                }
            };
            observer.action_finished(&outcome);
            report.push(outcome);
        }

        Ok(Applied {
            report,
            state: self.state,
        })
    }

    async fn run(&mut self, action: &Action) -> Result<Step, RagnatrampError> {
        tracing::debug!(action = action.label(), vm = %action.target_name, phase = "pending");
        match &action.kind {
            ActionKind::Create {
                cpu,
                memory_mb,
                base_image,
                disk_path,
                disk_strategy,
            } => {
                let params = CreateVmParams {
                    name: action.target_name.clone(),
                    cpu: *cpu,
                    memory_mb: *memory_mb,
                    base_image: base_image.clone(),
                    disk_path: disk_path.clone(),
                    disk_strategy: *disk_strategy,
                    notes: identity::generate_marker(&self.config.config_path, crate::VERSION),
                };
                self.create(action, &params).await
            }
            ActionKind::Start => self.start(action).await,
            ActionKind::Stop => self.stop(action).await,
            ActionKind::Destroy => self.destroy(action).await,
            ActionKind::Checkpoint { name } => self.checkpoint(action, name).await,
            ActionKind::Restore { name } => self.restore(action, name).await,
        }
    }

    // ── Verification ────────────────────────────────────────────────

    async fn lookup(&self, name: &str) -> Result<Option<LiveVm>, RagnatrampError> {
        let inventory = self.client.list_vms().await?;
        Ok(find_by_name(&inventory, name).cloned())
    }

    /// Fresh inventory lookup plus the ownership check. The returned VM is
    /// guaranteed to exist.
    async fn verified(&self, action: &Action) -> Result<LiveVm, RagnatrampError> {
        tracing::debug!(action = action.label(), vm = %action.target_name, phase = "verifying");
        let live = self.lookup(&action.target_name).await?;
        let subject = Subject {
            project: &self.config.project,
            machine: &action.machine_name,
            config_path: &self.config.config_path,
        };
        let verification = verify::verify(
            &action.target_name,
            self.state.as_ref(),
            live.as_ref(),
            subject,
        );
        match live {
            Some(vm) if verification.owned => Ok(vm),
            _ => Err(RagnatrampError::OwnershipVerificationFailed {
                name: action.target_name.clone(),
                reason: verification.reason_or_default().to_string(),
            }),
        }
    }

    /// Verified VM, or just its live record when this batch created it.
    async fn target(&self, action: &Action) -> Result<LiveVm, RagnatrampError> {
        if action.is_destructive() || !self.created.contains(&action.target_name) {
            return self.verified(action).await;
        }
        self.lookup(&action.target_name).await?.ok_or_else(|| {
            RagnatrampError::control_plane(
                ControlPlaneErrorKind::NotFound,
                format!("'{}' disappeared after it was created", action.target_name),
            )
        })
    }

    fn executing(action: &Action) {
        tracing::debug!(action = action.label(), vm = %action.target_name, phase = "executing");
    }

    fn ledger(&mut self) -> &mut StateFile {
        let config = self.config;
        self.state.get_or_insert_with(|| {
            StateFile::new(&config.project, &config.config_path, &config.config_hash)
        })
    }

    fn persist(&self) -> Result<(), RagnatrampError> {
        match &self.state {
            Some(s) => state::save(&self.state_path, s),
            None => Ok(()),
        }
    }

    // ── Actions ─────────────────────────────────────────────────────

    async fn create(
        &mut self,
        action: &Action,
        params: &CreateVmParams,
    ) -> Result<Step, RagnatrampError> {
        Self::executing(action);
        let vm = self.client.create_vm(params).await?;
        let record = VmState {
            id: vm.id,
            name: action.target_name.clone(),
            machine_name: action.machine_name.clone(),
            disk_path: params.disk_path.display().to_string(),
            created_at: state::now(),
            checkpoints: Vec::new(),
        };
        self.ledger().upsert_vm(&action.machine_name, record);
        self.created.insert(action.target_name.clone());
        self.persist()?;
        Ok(Step::Done(None))
    }

    async fn start(&mut self, action: &Action) -> Result<Step, RagnatrampError> {
        let vm = self.target(action).await?;
        if vm.power_state == PowerState::Running {
            return Ok(Step::Skipped("already running".into()));
        }
        Self::executing(action);
        self.client.start_vm(&action.target_name).await?;
        self.ledger().touch();
        self.persist()?;
        Ok(Step::Done(None))
    }

    async fn stop(&mut self, action: &Action) -> Result<Step, RagnatrampError> {
        let vm = self.target(action).await?;
        if vm.power_state == PowerState::Off {
            return Ok(Step::Skipped("already off".into()));
        }
        Self::executing(action);

        let name = &action.target_name;
        let deadline = Instant::now() + self.options.stop_timeout;
        match timeout(self.options.stop_timeout, self.client.stop_vm(name)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(vm = %name, error = %e, "graceful shutdown failed"),
            Err(_) => tracing::warn!(vm = %name, "graceful shutdown request timed out"),
        }

        let mut detail = None;
        loop {
            let Some(vm) = self.lookup(name).await? else {
                return Err(RagnatrampError::control_plane(
                    ControlPlaneErrorKind::NotFound,
                    format!("'{name}' disappeared while stopping"),
                ));
            };
            if vm.power_state == PowerState::Off {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(vm = %name, timeout = ?self.options.stop_timeout, "still running; forcing power off");
                self.client.force_stop_vm(name).await?;
                detail = Some("forced power off".to_string());
                break;
            }
            sleep(self.options.poll_interval).await;
        }

        self.ledger().touch();
        self.persist()?;
        Ok(Step::Done(detail))
    }

    async fn destroy(&mut self, action: &Action) -> Result<Step, RagnatrampError> {
        let vm = self.verified(action).await?;
        Self::executing(action);
        let name = &action.target_name;

        if vm.power_state != PowerState::Off {
            self.client.force_stop_vm(name).await?;
        }

        let record = self
            .state
            .as_ref()
            .and_then(|s| s.find_by_name(name))
            .cloned();
        let Some(record) = record else {
            return Err(RagnatrampError::OwnershipVerificationFailed {
                name: name.clone(),
                reason: format!("'{name}' is not tracked in the state file"),
            });
        };

        if !record.checkpoints.is_empty() {
            self.remove_tracked_checkpoints(&record).await?;
        }

        self.client.remove_vm(name).await?;
        self.ledger().remove_vm(&record.machine_name);
        self.persist()?;

        // The VM is gone and forgotten; a stray disk is only a warning.
        let disk = record.disk_path.as_str();
        let detail = match self.remove_disk(disk).await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(disk, error = %e, "VM removed but its disk was not deleted");
                Some(format!("disk {disk} was not deleted: {e}"))
            }
        };
        Ok(Step::Done(detail))
    }

    /// Remove the ledger's checkpoints from the VM, saving after each one.
    /// Checkpoints already gone from the hypervisor are only forgotten.
    async fn remove_tracked_checkpoints(&mut self, record: &VmState) -> Result<(), RagnatrampError> {
        let name = &record.name;
        let live: BTreeSet<String> = self
            .client
            .list_checkpoints(name)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();

        let (present, stale): (Vec<String>, Vec<String>) = record
            .checkpoints
            .iter()
            .map(|c| c.name.clone())
            .partition(|c| live.contains(c));
        if !stale.is_empty() {
            tracing::warn!(vm = %name, checkpoints = ?stale, "tracked checkpoints missing on the hypervisor");
            self.ledger().remove_checkpoints(&record.machine_name, &stale);
            self.persist()?;
        }

        for checkpoint in present {
            self.client.remove_checkpoint(name, &checkpoint).await?;
            self.ledger()
                .remove_checkpoints(&record.machine_name, std::slice::from_ref(&checkpoint));
            self.persist()?;
        }
        Ok(())
    }

    async fn remove_disk(&self, disk: &str) -> Result<(), RagnatrampError> {
        if self.client.file_exists(disk).await? {
            self.client.delete_file(disk).await?;
        }
        Ok(())
    }

    async fn checkpoint(&mut self, action: &Action, checkpoint: &str) -> Result<Step, RagnatrampError> {
        let _vm = self.target(action).await?;
        let name = &action.target_name;
        let exists = || RagnatrampError::CheckpointExists {
            machine: action.machine_name.clone(),
            checkpoint: checkpoint.to_string(),
        };

        let tracked = self
            .state
            .as_ref()
            .and_then(|s| s.vms.get(&action.machine_name))
            .is_some_and(|vm| vm.has_checkpoint(checkpoint));
        if tracked {
            return Err(exists());
        }
        let live = self.client.list_checkpoints(name).await?;
        if live.iter().any(|c| c.name == checkpoint) {
            return Err(exists());
        }

        Self::executing(action);
        let info = self.client.create_checkpoint(name, checkpoint).await?;
        let created_at = if info.created_at.is_empty() {
            state::now()
        } else {
            info.created_at
        };
        self.ledger().add_checkpoint(
            &action.machine_name,
            CheckpointState {
                id: info.id,
                name: checkpoint.to_string(),
                created_at,
            },
        )?;
        self.persist()?;
        Ok(Step::Done(None))
    }

    async fn restore(&mut self, action: &Action, checkpoint: &str) -> Result<Step, RagnatrampError> {
        let _vm = self.verified(action).await?;
        let name = &action.target_name;
        let not_found = || RagnatrampError::CheckpointNotFound {
            machine: action.machine_name.clone(),
            checkpoint: checkpoint.to_string(),
        };

        let tracked = self
            .state
            .as_ref()
            .and_then(|s| s.vms.get(&action.machine_name))
            .is_some_and(|vm| vm.has_checkpoint(checkpoint));
        if !tracked {
            return Err(not_found());
        }
        let live = self.client.list_checkpoints(name).await?;
        if !live.iter().any(|c| c.name == checkpoint) {
            return Err(not_found());
        }

        Self::executing(action);
        self.client.restore_checkpoint(name, checkpoint).await?;
        self.ledger().touch();
        self.persist()?;
        Ok(Step::Done(None))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::config::tests::test_config;
    use crate::control_plane::fake::{FakeControlPlane, live_vm};
    use crate::observer::Silent;
    use crate::plan::{self, Selection};
    use crate::report::ActionStatus;

    fn config_in(dir: &Path, machines: &[&str]) -> ResolvedConfig {
        let mut config = test_config(machines);
        config.config_path = dir.join("demo.yaml");
        config.artifact_path = dir.join("disks");
        config
    }

    fn fast() -> ExecutorOptions {
        ExecutorOptions {
            stop_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        }
    }

    async fn apply(
        client: &FakeControlPlane,
        config: &ResolvedConfig,
        state: Option<StateFile>,
        actions: &[Action],
    ) -> Applied {
        Executor::new(client, config, state)
            .with_options(fast())
            .apply(actions, &mut Silent)
            .await
            .unwrap()
    }

    async fn up(client: &FakeControlPlane, config: &ResolvedConfig) -> Applied {
        let state = state::load(&config.state_path()).unwrap();
        let actions = plan::plan(config, state.as_ref(), &client.inventory()).unwrap();
        apply(client, config, state, &actions).await
    }

    fn statuses(report: &ApplyReport) -> Vec<(String, ActionStatus)> {
        report
            .outcomes
            .iter()
            .map(|o| (format!("{} {}", o.action, o.machine_name), o.status))
            .collect()
    }

    #[tokio::test]
    async fn up_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a", "b"]);
        let client = FakeControlPlane::new();

        let first = up(&client, &config).await;
        assert_eq!(first.report.completed(), 4);
        let saved = state::load(&config.state_path()).unwrap().unwrap();
        assert_eq!(saved.vms.len(), 2);
        assert_eq!(saved.vms["a"].name, config.vm_name("a").unwrap());

        let state = state::load(&config.state_path()).unwrap();
        let second = plan::plan(&config, state.as_ref(), &client.inventory()).unwrap();
        assert!(second.is_empty(), "{second:?}");
    }

    #[tokio::test]
    async fn created_vm_carries_marker_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let client = FakeControlPlane::new();
        up(&client, &config).await;

        let name = config.vm_name("a").unwrap();
        let vm = client.vm(&name).unwrap();
        assert_eq!(vm.power_state, PowerState::Running);
        let marker = identity::parse_marker(vm.notes.as_deref().unwrap()).unwrap();
        assert_eq!(marker.config_path, config.config_path.display().to_string());
        assert!(client.has_file(&config.disk_path(&name).display().to_string()));
    }

    #[tokio::test]
    async fn partial_failure_continues_and_ledger_matches() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a", "b", "c"]);
        let client = FakeControlPlane::new();
        let b = config.vm_name("b").unwrap();
        client.fail("create-vm", &b, ControlPlaneErrorKind::ExecutionFailed);

        let applied = up(&client, &config).await;
        assert_eq!(
            statuses(&applied.report),
            [
                ("create a".to_string(), ActionStatus::Completed),
                ("start a".to_string(), ActionStatus::Completed),
                ("create b".to_string(), ActionStatus::Failed),
                ("start b".to_string(), ActionStatus::Skipped),
                ("create c".to_string(), ActionStatus::Completed),
                ("start c".to_string(), ActionStatus::Completed),
            ]
        );
        assert_eq!(applied.report.exit_code(), 2);

        let saved = state::load(&config.state_path()).unwrap().unwrap();
        let machines: Vec<&str> = saved.vms.keys().map(String::as_str).collect();
        assert_eq!(machines, ["a", "c"]);
    }

    #[tokio::test]
    async fn destroy_refuses_unowned_vm_and_leaves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let name = config.vm_name("a").unwrap();
        // Same name, but someone else's VM.
        let client = FakeControlPlane::new().with_vm(live_vm(&name, PowerState::Running, Some("mine")));
        let mut ledger = StateFile::new(&config.project, &config.config_path, &config.config_hash);
        ledger.upsert_vm("a", crate::state::tests::sample_vm("a", &name));
        state::save(&config.state_path(), &ledger).unwrap();
        let before = std::fs::read_to_string(config.state_path()).unwrap();

        let action = Action {
            machine_name: "a".into(),
            target_name: name.clone(),
            kind: ActionKind::Destroy,
        };
        let applied = apply(&client, &config, Some(ledger), &[action]).await;

        let outcome = &applied.report.outcomes[0];
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("ragnatramp marker"));
        assert!(client.mutations().is_empty(), "{:?}", client.mutations());
        assert_eq!(client.vm(&name).unwrap().power_state, PowerState::Running);
        assert_eq!(std::fs::read_to_string(config.state_path()).unwrap(), before);
    }

    #[tokio::test]
    async fn destroy_removes_checkpoints_vm_disk_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a", "b"]);
        let client = FakeControlPlane::new();
        up(&client, &config).await;

        let state = state::load(&config.state_path()).unwrap();
        let cp = plan::plan_checkpoint(&config, &Selection::Machine("a".into()), "base", state.as_ref(), &client.inventory()).unwrap();
        apply(&client, &config, state, &cp.actions).await;

        let state = state::load(&config.state_path()).unwrap();
        let destroy = plan::plan_destroy(&config, &Selection::Machine("a".into()), state.as_ref(), &client.inventory()).unwrap();
        assert!(destroy.refusals.is_empty());
        let applied = apply(&client, &config, state, &destroy.actions).await;
        assert!(applied.report.success());

        let a = config.vm_name("a").unwrap();
        assert!(client.vm(&a).is_none());
        assert!(!client.has_file(&config.disk_path(&a).display().to_string()));
        let calls = client.mutations();
        let pos = |c: &str| calls.iter().position(|x| x == c).unwrap();
        assert!(pos(&format!("force-stop-vm {a}")) < pos(&format!("remove-checkpoint {a}")));
        assert!(pos(&format!("remove-checkpoint {a}")) < pos(&format!("remove-vm {a}")));

        let saved = state::load(&config.state_path()).unwrap().unwrap();
        assert!(!saved.vms.contains_key("a"));
        assert!(saved.vms.contains_key("b"));
    }

    #[tokio::test]
    async fn stop_of_off_vm_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path(), &["a"]);
        config.auto_start = false;
        let client = FakeControlPlane::new();
        up(&client, &config).await;

        let state = state::load(&config.state_path()).unwrap();
        let actions = plan::plan_halt(&config, &Selection::All, &client.inventory()).unwrap();
        let applied = apply(&client, &config, state, &actions).await;
        assert_eq!(applied.report.skipped(), 1);
        assert!(applied.report.success());
        assert!(!client.calls().iter().any(|c| c.starts_with("stop-vm")));
    }

    #[tokio::test]
    async fn graceful_stop_then_force() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let setup = FakeControlPlane::new();
        up(&setup, &config).await;

        let mut client = FakeControlPlane::new();
        for vm in setup.inventory() {
            client = client.with_vm(vm);
        }
        client.ignore_graceful_stop = true;

        let state = state::load(&config.state_path()).unwrap();
        let actions = plan::plan_halt(&config, &Selection::All, &client.inventory()).unwrap();
        let applied = apply(&client, &config, state, &actions).await;

        let outcome = &applied.report.outcomes[0];
        assert_eq!(outcome.status, ActionStatus::Completed);
        assert_eq!(outcome.detail.as_deref(), Some("forced power off"));
        let a = config.vm_name("a").unwrap();
        assert_eq!(client.mutations(), [format!("stop-vm {a}"), format!("force-stop-vm {a}")]);
        assert_eq!(client.vm(&a).unwrap().power_state, PowerState::Off);
    }

    #[tokio::test]
    async fn graceful_stop_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let client = FakeControlPlane::new();
        up(&client, &config).await;

        let state = state::load(&config.state_path()).unwrap();
        let actions = plan::plan_halt(&config, &Selection::All, &client.inventory()).unwrap();
        let applied = apply(&client, &config, state, &actions).await;
        assert_eq!(applied.report.outcomes[0].detail, None);
        assert!(!client.calls().iter().any(|c| c.starts_with("force-stop-vm")));
    }

    #[tokio::test]
    async fn duplicate_checkpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let client = FakeControlPlane::new();
        up(&client, &config).await;

        for expected in [ActionStatus::Completed, ActionStatus::Failed] {
            let state = state::load(&config.state_path()).unwrap();
            let cp = plan::plan_checkpoint(&config, &Selection::All, "base", state.as_ref(), &client.inventory()).unwrap();
            let applied = apply(&client, &config, state, &cp.actions).await;
            assert_eq!(applied.report.outcomes[0].status, expected);
        }
        let a = config.vm_name("a").unwrap();
        assert_eq!(client.checkpoint_names(&a), ["base"]);
        let saved = state::load(&config.state_path()).unwrap().unwrap();
        assert_eq!(saved.vms["a"].checkpoints.len(), 1);
    }

    #[tokio::test]
    async fn restore_requires_known_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let client = FakeControlPlane::new();
        up(&client, &config).await;

        let state = state::load(&config.state_path()).unwrap();
        let rs = plan::plan_restore(&config, &Selection::All, "nope", state.as_ref(), &client.inventory()).unwrap();
        let applied = apply(&client, &config, state, &rs.actions).await;
        let outcome = &applied.report.outcomes[0];
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("checkpoint 'nope' not found"));
        assert!(!client.calls().iter().any(|c| c.starts_with("restore-checkpoint")));
    }

    #[tokio::test]
    async fn restore_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let client = FakeControlPlane::new();
        up(&client, &config).await;

        let state = state::load(&config.state_path()).unwrap();
        let cp = plan::plan_checkpoint(&config, &Selection::All, "base", state.as_ref(), &client.inventory()).unwrap();
        apply(&client, &config, state, &cp.actions).await;

        let state = state::load(&config.state_path()).unwrap();
        let rs = plan::plan_restore(&config, &Selection::All, "base", state.as_ref(), &client.inventory()).unwrap();
        let applied = apply(&client, &config, state, &rs.actions).await;
        assert!(applied.report.success());
        let a = config.vm_name("a").unwrap();
        assert!(client.mutations().contains(&format!("restore-checkpoint {a}")));
    }

    async fn take_checkpoint(client: &FakeControlPlane, config: &ResolvedConfig, name: &str) {
        let state = state::load(&config.state_path()).unwrap();
        let cp = plan::plan_checkpoint(config, &Selection::All, name, state.as_ref(), &client.inventory()).unwrap();
        let applied = apply(client, config, state, &cp.actions).await;
        assert!(applied.report.success());
    }

    async fn destroy_all(client: &FakeControlPlane, config: &ResolvedConfig) -> Applied {
        let state = state::load(&config.state_path()).unwrap();
        let destroy = plan::plan_destroy(config, &Selection::All, state.as_ref(), &client.inventory()).unwrap();
        apply(client, config, state, &destroy.actions).await
    }

    fn tracked_checkpoints(config: &ResolvedConfig, machine: &str) -> Vec<String> {
        let saved = state::load(&config.state_path()).unwrap().unwrap();
        saved.vms[machine].checkpoints.iter().map(|c| c.name.clone()).collect()
    }

    #[tokio::test]
    async fn destroy_after_partial_checkpoint_removal_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let client = FakeControlPlane::new();
        up(&client, &config).await;
        take_checkpoint(&client, &config, "one").await;
        take_checkpoint(&client, &config, "two").await;
        let a = config.vm_name("a").unwrap();

        client.fail("remove-checkpoint", &format!("{a}/two"), ControlPlaneErrorKind::ExecutionFailed);
        let first = destroy_all(&client, &config).await;
        assert_eq!(first.report.outcomes[0].status, ActionStatus::Failed);
        assert_eq!(client.checkpoint_names(&a), ["two"]);
        assert_eq!(tracked_checkpoints(&config, "a"), ["two"]);

        client.clear_failures();
        let second = destroy_all(&client, &config).await;
        assert!(second.report.success(), "{:?}", second.report.outcomes);
        assert!(client.vm(&a).is_none());
        let saved = state::load(&config.state_path()).unwrap().unwrap();
        assert!(!saved.vms.contains_key("a"));
    }

    #[tokio::test]
    async fn destroy_forgets_checkpoints_missing_on_hypervisor() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let client = FakeControlPlane::new();
        up(&client, &config).await;
        take_checkpoint(&client, &config, "one").await;
        let a = config.vm_name("a").unwrap();
        client.forget_checkpoint(&a, "one");

        let applied = destroy_all(&client, &config).await;
        assert!(applied.report.success(), "{:?}", applied.report.outcomes);
        assert!(!client.calls().iter().any(|c| c.starts_with("remove-checkpoint")));
        assert!(client.vm(&a).is_none());
    }

    #[tokio::test]
    async fn stop_fails_when_vm_disappears() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let mut client = FakeControlPlane::new();
        up(&client, &config).await;
        client.vanish_on_graceful_stop = true;

        let state = state::load(&config.state_path()).unwrap();
        let actions = plan::plan_halt(&config, &Selection::All, &client.inventory()).unwrap();
        let applied = Executor::new(&client, &config, state)
            .with_options(ExecutorOptions {
                stop_timeout: Duration::from_secs(30),
                poll_interval: Duration::from_millis(5),
            })
            .apply(&actions, &mut Silent)
            .await
            .unwrap();

        let outcome = &applied.report.outcomes[0];
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("disappeared while stopping"));
        assert!(!client.calls().iter().any(|c| c.starts_with("force-stop-vm")));
    }

    #[tokio::test]
    async fn halt_refuses_unowned_vm_without_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let name = config.vm_name("a").unwrap();
        let client = FakeControlPlane::new().with_vm(live_vm(&name, PowerState::Running, None));

        let actions = plan::plan_halt(&config, &Selection::All, &client.inventory()).unwrap();
        let applied = apply(&client, &config, None, &actions).await;

        let outcome = &applied.report.outcomes[0];
        assert_eq!(outcome.status, ActionStatus::Failed);
        let error = outcome.error.as_deref().unwrap();
        assert!(error.contains("no state file exists for this config"), "{error}");
        assert!(error.contains("has no ownership marker"), "{error}");
        assert!(client.mutations().is_empty(), "{:?}", client.mutations());
        assert!(!config.state_path().exists());
    }

    #[tokio::test]
    async fn halt_refuses_tracked_vm_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let name = config.vm_name("a").unwrap();
        let client = FakeControlPlane::new().with_vm(live_vm(&name, PowerState::Running, Some("mine")));
        let mut ledger = StateFile::new(&config.project, &config.config_path, &config.config_hash);
        ledger.upsert_vm("a", crate::state::tests::sample_vm("a", &name));

        let actions = plan::plan_halt(&config, &Selection::All, &client.inventory()).unwrap();
        let applied = apply(&client, &config, Some(ledger), &actions).await;

        let outcome = &applied.report.outcomes[0];
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert!(outcome.error.as_deref().unwrap().contains("notes do not contain a ragnatramp marker"));
        assert!(client.mutations().is_empty(), "{:?}", client.mutations());
        assert_eq!(client.vm(&name).unwrap().power_state, PowerState::Running);
    }

    #[tokio::test]
    async fn restore_refuses_vm_of_another_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a"]);
        let name = config.vm_name("a").unwrap();
        let foreign = identity::generate_marker(&dir.path().join("other.yaml"), crate::VERSION);
        let client = FakeControlPlane::new().with_vm(live_vm(&name, PowerState::Running, Some(&foreign)));
        let mut ledger = StateFile::new(&config.project, &config.config_path, &config.config_hash);
        ledger.upsert_vm("a", crate::state::tests::sample_vm("a", &name));

        let action = Action {
            machine_name: "a".into(),
            target_name: name.clone(),
            kind: ActionKind::Restore { name: "base".into() },
        };
        let applied = apply(&client, &config, Some(ledger), &[action]).await;

        let outcome = &applied.report.outcomes[0];
        assert_eq!(outcome.status, ActionStatus::Failed);
        let error = outcome.error.as_deref().unwrap();
        assert!(error.contains("marker belongs to config"), "{error}");
        assert!(error.contains("other.yaml"), "{error}");
        assert!(client.mutations().is_empty(), "{:?}", client.mutations());
    }

    #[tokio::test]
    async fn unsaveable_ledger_aborts_batch() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), &["a", "b"]);
        // A file where the working directory should be.
        std::fs::write(dir.path().join(".ragnatramp"), "not a dir").unwrap();
        let client = FakeControlPlane::new();

        let actions = plan::plan(&config, None, &[]).unwrap();
        let result = Executor::new(&client, &config, None)
            .with_options(fast())
            .apply(&actions, &mut Silent)
            .await;
        assert!(matches!(result, Err(RagnatrampError::StateIo { .. })));
        let b = config.vm_name("b").unwrap();
        assert!(!client.calls().contains(&format!("create-vm {b}")));
    }
}
