//! One function per CLI command, independent of argument parsing and output.
//!
//! Each command loads the ledger itself, plans against a fresh inventory and
//! hands the plan to the [`Executor`]. Rendering is left to the caller.

use crate::config::ResolvedConfig;
use crate::control_plane::{ControlPlane, find_by_name, request::DEFAULT_SWITCH};
use crate::error::{ControlPlaneErrorKind, RagnatrampError};
use crate::executor::{Executor, ExecutorOptions};
use crate::observer::ApplyObserver;
use crate::plan::{self, Action, ActionKind, Selection, SelectionPlan};
use crate::report::{ActionOutcome, ApplyReport, Drift, MachineStatus, StatusReport};
use crate::state::{self, StateFile};

pub struct Context<'a, C> {
    pub client: &'a C,
    pub config: &'a ResolvedConfig,
    pub options: ExecutorOptions,
}

impl<'a, C: ControlPlane> Context<'a, C> {
    pub fn new(client: &'a C, config: &'a ResolvedConfig) -> Self {
        Self {
            client,
            config,
            options: ExecutorOptions::default(),
        }
    }

    fn load_state(&self) -> Result<Option<StateFile>, RagnatrampError> {
        let state = state::load(&self.config.state_path())?;
        if let Some(s) = &state
            && s.config_hash != self.config.config_hash
        {
            tracing::warn!(
                path = %self.config.config_path.display(),
                "config has changed since the state file was last written by `up`"
            );
        }
        Ok(state)
    }

    async fn ensure_available(&self) -> Result<(), RagnatrampError> {
        if self.client.is_available().await? {
            return Ok(());
        }
        Err(RagnatrampError::control_plane(
            ControlPlaneErrorKind::HypervisorUnavailable,
            "Hyper-V is not available on this host",
        ))
    }

    async fn apply(
        &self,
        state: Option<StateFile>,
        actions: &[Action],
        observer: &mut dyn ApplyObserver,
    ) -> Result<(ApplyReport, Option<StateFile>), RagnatrampError> {
        let applied = Executor::new(self.client, self.config, state)
            .with_options(self.options)
            .apply(actions, observer)
            .await?;
        Ok((applied.report, applied.state))
    }

    /// Refusals first, as failed outcomes, then the executed actions.
    async fn apply_selection(
        &self,
        state: Option<StateFile>,
        selection: SelectionPlan,
        observer: &mut dyn ApplyObserver,
    ) -> Result<ApplyReport, RagnatrampError> {
        let missing_state = state.is_none();
        let (executed, _) = self.apply(state, &selection.actions, observer).await?;

        let mut report = ApplyReport::default();
        for refusal in &selection.refusals {
            report.push(ActionOutcome::refused(refusal));
        }
        report.outcomes.extend(executed.outcomes);

        if report.outcomes.is_empty() {
            report.note(if missing_state {
                format!(
                    "No state file at {}; nothing is managed by this config.",
                    self.config.state_path().display()
                )
            } else {
                "Nothing to do.".to_string()
            });
        }
        Ok(report)
    }

    /// The reconcile plan, without touching anything.
    pub async fn plan(&self) -> Result<Vec<Action>, RagnatrampError> {
        self.ensure_available().await?;
        let state = self.load_state()?;
        let inventory = self.client.list_vms().await?;
        plan::plan(self.config, state.as_ref(), &inventory)
    }

    /// Checks that must pass before anything is created.
    async fn preflight(&self, actions: &[Action]) -> Result<(), RagnatrampError> {
        let creates: Vec<&Action> = actions
            .iter()
            .filter(|a| matches!(a.kind, ActionKind::Create { .. }))
            .collect();
        if creates.is_empty() {
            return Ok(());
        }

        if !self.client.default_switch_exists().await? {
            return Err(RagnatrampError::control_plane(
                ControlPlaneErrorKind::NotFound,
                format!("virtual switch '{DEFAULT_SWITCH}' does not exist"),
            ));
        }

        let mut checked = Vec::new();
        for action in creates {
            let ActionKind::Create { base_image, .. } = &action.kind else {
                continue;
            };
            let path = base_image.display().to_string();
            if checked.contains(&path) {
                continue;
            }
            if !self.client.file_exists(&path).await? {
                return Err(RagnatrampError::Validation {
                    message: format!(
                        "base image for machine '{}' does not exist: {path}",
                        action.machine_name
                    ),
                });
            }
            checked.push(path);
        }
        Ok(())
    }

    pub async fn up(&self, observer: &mut dyn ApplyObserver) -> Result<ApplyReport, RagnatrampError> {
        self.ensure_available().await?;
        let state = self.load_state()?;
        let inventory = self.client.list_vms().await?;
        let actions = plan::plan(self.config, state.as_ref(), &inventory)?;
        if actions.is_empty() {
            let mut report = ApplyReport::default();
            report.note("Nothing to do: every machine matches the config.");
            return Ok(report);
        }
        self.preflight(&actions).await?;

        let (report, state) = self.apply(state, &actions, observer).await?;
        if report.success()
            && let Some(mut state) = state
            && state.config_hash != self.config.config_hash
        {
            state.config_hash = self.config.config_hash.clone();
            state.touch();
            state::save(&self.config.state_path(), &state)?;
        }
        Ok(report)
    }

    pub async fn status(&self) -> Result<StatusReport, RagnatrampError> {
        self.ensure_available().await?;
        let state = self.load_state()?;
        let inventory = self.client.list_vms().await?;

        let mut machines = Vec::new();
        for machine in &self.config.machines {
            let vm_name = self.config.vm_name(&machine.name)?;
            let record = state.as_ref().and_then(|s| s.find_by_name(&vm_name));
            let live = find_by_name(&inventory, &vm_name);
            let drift = match (record.is_some(), live.is_some()) {
                (true, false) => Some(Drift::Missing),
                (false, true) => Some(Drift::Untracked),
                _ => None,
            };
            machines.push(MachineStatus {
                machine_name: machine.name.clone(),
                vm_name,
                tracked: record.is_some(),
                power_state: live.map(|vm| vm.power_state.to_string()),
                cpu: live.map(|vm| vm.cpu_count),
                memory_mb: live.map(|vm| vm.memory_mb),
                checkpoints: record
                    .map(|r| r.checkpoints.iter().map(|c| c.name.clone()).collect())
                    .unwrap_or_default(),
                drift,
            });
        }

        if let Some(s) = &state {
            for (machine, record) in &s.vms {
                if self.config.machine(machine).is_some() {
                    continue;
                }
                let live = find_by_name(&inventory, &record.name);
                machines.push(MachineStatus {
                    machine_name: machine.clone(),
                    vm_name: record.name.clone(),
                    tracked: true,
                    power_state: live.map(|vm| vm.power_state.to_string()),
                    cpu: live.map(|vm| vm.cpu_count),
                    memory_mb: live.map(|vm| vm.memory_mb),
                    checkpoints: record.checkpoints.iter().map(|c| c.name.clone()).collect(),
                    drift: Some(Drift::Orphaned),
                });
            }
        }

        Ok(StatusReport {
            project: self.config.project.clone(),
            state_exists: state.is_some(),
            config_changed: state
                .as_ref()
                .is_some_and(|s| s.config_hash != self.config.config_hash),
            machines,
        })
    }

    pub async fn halt(
        &self,
        selection: &Selection,
        observer: &mut dyn ApplyObserver,
    ) -> Result<ApplyReport, RagnatrampError> {
        plan::select(self.config, selection)?;
        self.ensure_available().await?;
        let state = self.load_state()?;
        let inventory = self.client.list_vms().await?;
        let actions = plan::plan_halt(self.config, selection, &inventory)?;
        let selection = SelectionPlan {
            actions,
            refusals: Vec::new(),
        };
        self.apply_selection(state, selection, observer).await
    }

    pub async fn destroy(
        &self,
        selection: &Selection,
        observer: &mut dyn ApplyObserver,
    ) -> Result<ApplyReport, RagnatrampError> {
        plan::select(self.config, selection)?;
        self.ensure_available().await?;
        let state = self.load_state()?;
        let inventory = self.client.list_vms().await?;
        let plan = plan::plan_destroy(self.config, selection, state.as_ref(), &inventory)?;
        self.apply_selection(state, plan, observer).await
    }

    pub async fn checkpoint(
        &self,
        selection: &Selection,
        name: &str,
        observer: &mut dyn ApplyObserver,
    ) -> Result<ApplyReport, RagnatrampError> {
        validate_checkpoint_name(name)?;
        plan::select(self.config, selection)?;
        self.ensure_available().await?;
        let state = self.load_state()?;
        let inventory = self.client.list_vms().await?;
        let plan = plan::plan_checkpoint(self.config, selection, name, state.as_ref(), &inventory)?;
        self.apply_selection(state, plan, observer).await
    }

    pub async fn restore(
        &self,
        selection: &Selection,
        name: &str,
        observer: &mut dyn ApplyObserver,
    ) -> Result<ApplyReport, RagnatrampError> {
        validate_checkpoint_name(name)?;
        plan::select(self.config, selection)?;
        self.ensure_available().await?;
        let state = self.load_state()?;
        let inventory = self.client.list_vms().await?;
        let plan = plan::plan_restore(self.config, selection, name, state.as_ref(), &inventory)?;
        self.apply_selection(state, plan, observer).await
    }
}

pub fn validate_checkpoint_name(name: &str) -> Result<(), RagnatrampError> {
    let message = if name.trim().is_empty() {
        "checkpoint name must not be empty"
    } else if name.len() > 100 {
        "checkpoint name must be at most 100 characters"
    } else if name.chars().any(char::is_control) {
        "checkpoint name must not contain control characters"
    } else {
        return Ok(());
    };
    Err(RagnatrampError::Validation {
        message: message.to_string(),
    })
}

/// One-paragraph summary printed by `validate`.
pub fn describe(config: &ResolvedConfig) -> String {
    let mut out = format!(
        "Config OK: project '{}', {} machine(s)\n",
        config.project,
        config.machines.len()
    );
    for m in &config.machines {
        out.push_str(&format!(
            "  {}: {} CPU, {} MB, {} disk from {}\n",
            m.name,
            m.cpu,
            m.memory_mb,
            m.disk_strategy.as_str(),
            m.base_image_path.display()
        ));
    }
    out
}
