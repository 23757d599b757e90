//! Results of planning and applying, and how they are shown.
//!
//! Every renderer comes in a human form and a JSON form; the JSON documents
//! are facet structs so field names are stable for scripts.

use std::fmt::Write;

use facet::Facet;

use crate::error::{ControlPlaneErrorKind, RagnatrampError};
use crate::plan::{Action, Refusal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Completed,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
        }
    }
}

/// Terminal record for one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub action: &'static str,
    pub machine_name: String,
    pub target_name: String,
    pub status: ActionStatus,
    /// Skip reason or a non-fatal warning.
    pub detail: Option<String>,
    pub error: Option<String>,
    /// Set when the failure came from the control plane.
    pub control_plane: Option<ControlPlaneErrorKind>,
}

impl ActionOutcome {
    fn base(action: &Action, status: ActionStatus) -> Self {
        Self {
            action: action.label(),
            machine_name: action.machine_name.clone(),
            target_name: action.target_name.clone(),
            status,
            detail: None,
            error: None,
            control_plane: None,
        }
    }

    pub fn completed(action: &Action, detail: Option<String>) -> Self {
        Self {
            detail,
            ..Self::base(action, ActionStatus::Completed)
        }
    }

    pub fn skipped(action: &Action, reason: impl Into<String>) -> Self {
        Self {
            detail: Some(reason.into()),
            ..Self::base(action, ActionStatus::Skipped)
        }
    }

    pub fn failed(action: &Action, error: &RagnatrampError) -> Self {
        Self {
            error: Some(error.to_string()),
            control_plane: error.control_plane_kind(),
            ..Self::base(action, ActionStatus::Failed)
        }
    }

    /// A planner refusal, reported as a failed action that never ran.
    pub fn refused(refusal: &Refusal) -> Self {
        Self {
            action: refusal.action,
            machine_name: refusal.machine_name.clone(),
            target_name: refusal.target_name.clone(),
            status: ActionStatus::Failed,
            detail: None,
            error: Some(format!(
                "refusing to touch '{}': {}",
                refusal.target_name, refusal.reason
            )),
            control_plane: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub outcomes: Vec<ActionOutcome>,
    /// Informational lines (e.g. "nothing to do").
    pub notes: Vec<String>,
}

impl ApplyReport {
    pub fn push(&mut self, outcome: ActionOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    fn count(&self, status: ActionStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn completed(&self) -> usize {
        self.count(ActionStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(ActionStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(ActionStatus::Skipped)
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    /// 0 on success, 2 when any failure came from the control plane,
    /// 1 for every other failure.
    pub fn exit_code(&self) -> i32 {
        let failures = self.outcomes.iter().filter(|o| o.status == ActionStatus::Failed);
        let mut code = 0;
        for outcome in failures {
            if outcome.control_plane.is_some() {
                return 2;
            }
            code = 1;
        }
        code
    }

    pub fn summary(&self) -> String {
        format!(
            "{} completed, {} failed, {} skipped",
            self.completed(),
            self.failed(),
            self.skipped()
        )
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for note in &self.notes {
            let _ = writeln!(out, "{note}");
        }
        for o in self.outcomes.iter().filter(|o| o.status == ActionStatus::Failed) {
            let _ = writeln!(
                out,
                "{} {} ({}): {}",
                console::style("error:").red().bold(),
                o.action,
                o.machine_name,
                o.error.as_deref().unwrap_or("failed")
            );
        }
        if !self.outcomes.is_empty() {
            let _ = writeln!(out, "{}", self.summary());
        }
        out
    }

    pub fn to_json(&self) -> Result<String, RagnatrampError> {
        let doc = ReportDocument {
            success: self.success(),
            exit_code: self.exit_code(),
            notes: self.notes.clone(),
            actions: self
                .outcomes
                .iter()
                .map(|o| OutcomeDocument {
                    action: o.action.to_string(),
                    machine: o.machine_name.clone(),
                    target: o.target_name.clone(),
                    status: o.status.as_str().to_string(),
                    detail: o.detail.clone(),
                    error: o.error.clone(),
                    error_kind: o.control_plane.map(|k| k.as_str().to_string()),
                })
                .collect(),
        };
        to_json(&doc)
    }
}

#[derive(Facet)]
#[facet(rename_all = "camelCase")]
struct ReportDocument {
    success: bool,
    exit_code: i32,
    notes: Vec<String>,
    actions: Vec<OutcomeDocument>,
}

#[derive(Facet)]
#[facet(rename_all = "camelCase")]
struct OutcomeDocument {
    action: String,
    machine: String,
    target: String,
    status: String,
    detail: Option<String>,
    error: Option<String>,
    error_kind: Option<String>,
}

fn to_json<'a, T: Facet<'a>>(doc: &T) -> Result<String, RagnatrampError> {
    facet_json::to_string(doc).map_err(|e| RagnatrampError::Io {
        context: format!("failed to serialize output: {e}"),
        source: std::io::Error::other(e.to_string()),
    })
}

// ── Plan ────────────────────────────────────────────────────────────

pub fn render_plan(actions: &[Action]) -> String {
    let mut out = String::new();
    if actions.is_empty() {
        out.push_str("Nothing to do: every machine matches the config.\n");
        return out;
    }
    for action in actions {
        let marker = match action.kind {
            crate::plan::ActionKind::Create { .. } => console::style("+").green(),
            crate::plan::ActionKind::Destroy => console::style("-").red(),
            _ => console::style("~").yellow(),
        };
        let _ = writeln!(out, "  {marker} {action}");
    }
    let _ = writeln!(out, "\n{} action(s) planned", actions.len());
    out
}

#[derive(Facet)]
#[facet(rename_all = "camelCase")]
struct PlanDocument {
    actions: Vec<PlannedDocument>,
}

#[derive(Facet)]
#[facet(rename_all = "camelCase")]
struct PlannedDocument {
    action: String,
    machine: String,
    target: String,
    description: String,
}

pub fn plan_json(actions: &[Action]) -> Result<String, RagnatrampError> {
    let doc = PlanDocument {
        actions: actions
            .iter()
            .map(|a| PlannedDocument {
                action: a.label().to_string(),
                machine: a.machine_name.clone(),
                target: a.target_name.clone(),
                description: a.to_string(),
            })
            .collect(),
    };
    to_json(&doc)
}

// ── Status ──────────────────────────────────────────────────────────

/// How a machine's live presence disagrees with the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drift {
    /// Tracked in the ledger, gone from the hypervisor.
    Missing,
    /// Present on the hypervisor under our name, not in the ledger.
    Untracked,
    /// In the ledger, but the machine was removed from the config.
    Orphaned,
}

impl Drift {
    pub fn as_str(self) -> &'static str {
        match self {
            Drift::Missing => "missing",
            Drift::Untracked => "untracked",
            Drift::Orphaned => "not in config",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStatus {
    pub machine_name: String,
    pub vm_name: String,
    pub tracked: bool,
    pub power_state: Option<String>,
    pub cpu: Option<u32>,
    pub memory_mb: Option<u64>,
    pub checkpoints: Vec<String>,
    pub drift: Option<Drift>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub project: String,
    pub state_exists: bool,
    /// The config changed since the ledger was last written by `up`.
    pub config_changed: bool,
    pub machines: Vec<MachineStatus>,
}

impl StatusReport {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Project: {}", self.project);
        if !self.state_exists {
            let _ = writeln!(out, "No state file; nothing has been created from this config yet.");
        }
        if self.config_changed {
            let _ = writeln!(
                out,
                "{} config has changed since the last `up`",
                console::style("warning:").yellow().bold()
            );
        }
        let width = self
            .machines
            .iter()
            .map(|m| m.machine_name.len())
            .max()
            .unwrap_or(0);
        for m in &self.machines {
            let power = m.power_state.as_deref().unwrap_or("not created");
            let _ = write!(out, "  {:width$}  {}  {power}", m.machine_name, m.vm_name);
            if let (Some(cpu), Some(mem)) = (m.cpu, m.memory_mb) {
                let _ = write!(out, "  {cpu} CPU  {mem} MB");
            }
            if !m.checkpoints.is_empty() {
                let _ = write!(out, "  checkpoints: {}", m.checkpoints.join(", "));
            }
            if let Some(drift) = m.drift {
                let _ = write!(out, "  {}", console::style(format!("[{}]", drift.as_str())).red());
            }
            out.push('\n');
        }
        out
    }

    pub fn to_json(&self) -> Result<String, RagnatrampError> {
        let doc = StatusDocument {
            project: self.project.clone(),
            state_exists: self.state_exists,
            config_changed: self.config_changed,
            machines: self
                .machines
                .iter()
                .map(|m| MachineDocument {
                    machine: m.machine_name.clone(),
                    vm_name: m.vm_name.clone(),
                    tracked: m.tracked,
                    power_state: m.power_state.clone(),
                    cpu: m.cpu,
                    memory_mb: m.memory_mb,
                    checkpoints: m.checkpoints.clone(),
                    drift: m.drift.map(|d| d.as_str().to_string()),
                })
                .collect(),
        };
        to_json(&doc)
    }
}

#[derive(Facet)]
#[facet(rename_all = "camelCase")]
struct StatusDocument {
    project: String,
    state_exists: bool,
    config_changed: bool,
    machines: Vec<MachineDocument>,
}

#[derive(Facet)]
#[facet(rename_all = "camelCase")]
struct MachineDocument {
    machine: String,
    vm_name: String,
    tracked: bool,
    power_state: Option<String>,
    cpu: Option<u32>,
    #[facet(rename = "memoryMB")]
    memory_mb: Option<u64>,
    checkpoints: Vec<String>,
    drift: Option<String>,
}
