//! Planning: desired config + ledger + live inventory → ordered actions.
//!
//! [`plan`] is the automatic reconcile used by `up`/`plan`; it only ever
//! creates and starts. Everything that stops, destroys or snapshots comes from
//! an explicit [`Selection`] through the `plan_*` functions. All of them are
//! pure: same inputs, same actions, no side effects.

use std::fmt;
use std::path::PathBuf;

use crate::config::{DiskStrategy, ResolvedConfig, ResolvedMachine};
use crate::control_plane::{LiveVm, PowerState, find_by_name};
use crate::error::RagnatrampError;
use crate::state::StateFile;
use crate::verify::{self, Subject};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Create {
        cpu: u32,
        memory_mb: u64,
        base_image: PathBuf,
        disk_path: PathBuf,
        disk_strategy: DiskStrategy,
    },
    Start,
    Stop,
    Destroy,
    Checkpoint { name: String },
    Restore { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub machine_name: String,
    pub target_name: String,
    pub kind: ActionKind,
}

impl Action {
    fn new(machine: &ResolvedMachine, target_name: &str, kind: ActionKind) -> Self {
        Self {
            machine_name: machine.name.clone(),
            target_name: target_name.into(),
            kind,
        }
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            ActionKind::Create { .. } => "create",
            ActionKind::Start => "start",
            ActionKind::Stop => "stop",
            ActionKind::Destroy => "destroy",
            ActionKind::Checkpoint { .. } => "checkpoint",
            ActionKind::Restore { .. } => "restore",
        }
    }

    /// Actions that can discard data and so always need verified ownership.
    pub fn is_destructive(&self) -> bool {
        matches!(self.kind, ActionKind::Destroy | ActionKind::Restore { .. })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.label(), self.target_name)?;
        match &self.kind {
            ActionKind::Create {
                cpu,
                memory_mb,
                disk_strategy,
                ..
            } => write!(f, " ({cpu} CPU, {memory_mb} MB, {} disk)", disk_strategy.as_str()),
            ActionKind::Checkpoint { name } | ActionKind::Restore { name } => {
                write!(f, " '{name}'")
            }
            _ => Ok(()),
        }
    }
}

/// Which configured machines a command applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Machine(String),
}

/// A machine the planner declined to act on, with every reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refusal {
    pub action: &'static str,
    pub machine_name: String,
    pub target_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPlan {
    pub actions: Vec<Action>,
    pub refusals: Vec<Refusal>,
}

/// Resolve a selection to machines, in config order.
pub fn select<'a>(
    config: &'a ResolvedConfig,
    selection: &Selection,
) -> Result<Vec<&'a ResolvedMachine>, RagnatrampError> {
    match selection {
        Selection::All => Ok(config.machines.iter().collect()),
        Selection::Machine(name) => match config.machine(name) {
            Some(m) => Ok(vec![m]),
            None => Err(RagnatrampError::NoSuchMachine {
                name: name.clone(),
                available: config.machine_names().join(", "),
            }),
        },
    }
}

fn subject<'a>(config: &'a ResolvedConfig, machine: &'a ResolvedMachine) -> Subject<'a> {
    Subject {
        project: &config.project,
        machine: &machine.name,
        config_path: &config.config_path,
    }
}

fn is_startable(vm: &LiveVm) -> bool {
    matches!(vm.power_state, PowerState::Off | PowerState::Saved)
}

/// Converge toward the config: create what is missing, start what is off
/// when the config asks for auto-start. Never destroys.
pub fn plan(
    config: &ResolvedConfig,
    state: Option<&StateFile>,
    inventory: &[LiveVm],
) -> Result<Vec<Action>, RagnatrampError> {
    let mut actions = Vec::new();

    for machine in &config.machines {
        let name = config.vm_name(&machine.name)?;
        let tracked = state.is_some_and(|s| s.find_by_name(&name).is_some());

        match find_by_name(inventory, &name) {
            None => {
                if tracked {
                    tracing::warn!(machine = %machine.name, name = %name, "tracked VM is missing; planning re-create");
                }
                actions.push(Action::new(
                    machine,
                    &name,
                    ActionKind::Create {
                        cpu: machine.cpu,
                        memory_mb: machine.memory_mb,
                        base_image: machine.base_image_path.clone(),
                        disk_path: config.disk_path(&name),
                        disk_strategy: machine.disk_strategy,
                    },
                ));
                if config.auto_start {
                    actions.push(Action::new(machine, &name, ActionKind::Start));
                }
            }
            Some(vm) => {
                if !tracked {
                    tracing::warn!(machine = %machine.name, name = %name, "VM exists but is not in the state file");
                }
                if config.auto_start && is_startable(vm) {
                    actions.push(Action::new(machine, &name, ActionKind::Start));
                }
            }
        }
    }

    Ok(actions)
}

/// Stop every selected machine that exists. Already-off VMs are still
/// planned so the executor can report them as skipped.
pub fn plan_halt(
    config: &ResolvedConfig,
    selection: &Selection,
    inventory: &[LiveVm],
) -> Result<Vec<Action>, RagnatrampError> {
    let mut actions = Vec::new();
    for machine in select(config, selection)? {
        let name = config.vm_name(&machine.name)?;
        if find_by_name(inventory, &name).is_some() {
            actions.push(Action::new(machine, &name, ActionKind::Stop));
        }
    }
    Ok(actions)
}

/// Shared shape of destroy/checkpoint/restore: only verified-owned VMs get
/// an action; anything that exists but fails verification is refused.
fn plan_owned(
    config: &ResolvedConfig,
    selection: &Selection,
    state: Option<&StateFile>,
    inventory: &[LiveVm],
    kind: impl Fn() -> ActionKind,
) -> Result<SelectionPlan, RagnatrampError> {
    let mut out = SelectionPlan::default();
    for machine in select(config, selection)? {
        let name = config.vm_name(&machine.name)?;
        let live = find_by_name(inventory, &name);
        let tracked = state.is_some_and(|s| s.find_by_name(&name).is_some());
        if live.is_none() && !tracked {
            continue;
        }

        let action = Action::new(machine, &name, kind());
        let verification = verify::verify(&name, state, live, subject(config, machine));
        if verification.owned {
            out.actions.push(action);
        } else {
            out.refusals.push(Refusal {
                action: action.label(),
                machine_name: machine.name.clone(),
                target_name: name,
                reason: verification.reason_or_default().to_string(),
            });
        }
    }
    Ok(out)
}

pub fn plan_destroy(
    config: &ResolvedConfig,
    selection: &Selection,
    state: Option<&StateFile>,
    inventory: &[LiveVm],
) -> Result<SelectionPlan, RagnatrampError> {
    plan_owned(config, selection, state, inventory, || ActionKind::Destroy)
}

pub fn plan_checkpoint(
    config: &ResolvedConfig,
    selection: &Selection,
    checkpoint: &str,
    state: Option<&StateFile>,
    inventory: &[LiveVm],
) -> Result<SelectionPlan, RagnatrampError> {
    plan_owned(config, selection, state, inventory, || ActionKind::Checkpoint {
        name: checkpoint.to_string(),
    })
}

pub fn plan_restore(
    config: &ResolvedConfig,
    selection: &Selection,
    checkpoint: &str,
    state: Option<&StateFile>,
    inventory: &[LiveVm],
) -> Result<SelectionPlan, RagnatrampError> {
    plan_owned(config, selection, state, inventory, || ActionKind::Restore {
        name: checkpoint.to_string(),
    })
}
