//! The hypervisor control plane, seen from the core.
//!
//! [`ControlPlane`] is the seam between planning/execution and the external
//! process that actually manages VMs. [`client::PowerShell`] drives Hyper-V;
//! tests drive a fake with canned inventories and injected failures.

pub mod client;
pub mod request;

#[cfg(test)]
pub mod fake;

use std::fmt;
use std::path::PathBuf;

use facet::Facet;

use crate::config::DiskStrategy;
use crate::error::{ControlPlaneErrorKind, RagnatrampError};

// ── Domain types ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Off,
    Paused,
    Saved,
    Starting,
    Stopping,
    Other(String),
}

impl PowerState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Running" => PowerState::Running,
            "Off" => PowerState::Off,
            "Paused" => PowerState::Paused,
            "Saved" => PowerState::Saved,
            "Starting" => PowerState::Starting,
            "Stopping" => PowerState::Stopping,
            other => PowerState::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Running => f.write_str("Running"),
            PowerState::Off => f.write_str("Off"),
            PowerState::Paused => f.write_str("Paused"),
            PowerState::Saved => f.write_str("Saved"),
            PowerState::Starting => f.write_str("Starting"),
            PowerState::Stopping => f.write_str("Stopping"),
            PowerState::Other(s) => f.write_str(s),
        }
    }
}

/// A VM as the control plane reports it right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveVm {
    pub id: String,
    pub name: String,
    pub power_state: PowerState,
    pub notes: Option<String>,
    pub memory_mb: u64,
    pub cpu_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct CreateVmParams {
    pub name: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub base_image: PathBuf,
    pub disk_path: PathBuf,
    pub disk_strategy: DiskStrategy,
    /// Ownership marker stored in the VM's notes.
    pub notes: String,
}

/// Find a VM in an inventory by exact name.
pub fn find_by_name<'a>(inventory: &'a [LiveVm], name: &str) -> Option<&'a LiveVm> {
    inventory.iter().find(|vm| vm.name == name)
}

// ── Trait ───────────────────────────────────────────────────────────

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait ControlPlane {
    async fn list_vms(&self) -> Result<Vec<LiveVm>, RagnatrampError>;
    /// Create the disk and the VM, stamp the notes, return the new VM.
    async fn create_vm(&self, params: &CreateVmParams) -> Result<LiveVm, RagnatrampError>;
    async fn start_vm(&self, name: &str) -> Result<(), RagnatrampError>;
    /// Ask the guest to shut down.
    async fn stop_vm(&self, name: &str) -> Result<(), RagnatrampError>;
    /// Power off immediately.
    async fn force_stop_vm(&self, name: &str) -> Result<(), RagnatrampError>;
    async fn remove_vm(&self, name: &str) -> Result<(), RagnatrampError>;
    async fn create_checkpoint(
        &self,
        vm: &str,
        checkpoint: &str,
    ) -> Result<CheckpointInfo, RagnatrampError>;
    async fn restore_checkpoint(&self, vm: &str, checkpoint: &str) -> Result<(), RagnatrampError>;
    async fn list_checkpoints(&self, vm: &str) -> Result<Vec<CheckpointInfo>, RagnatrampError>;
    async fn remove_checkpoint(&self, vm: &str, checkpoint: &str) -> Result<(), RagnatrampError>;
    async fn is_available(&self) -> Result<bool, RagnatrampError>;
    async fn default_switch_exists(&self) -> Result<bool, RagnatrampError>;
    async fn file_exists(&self, path: &str) -> Result<bool, RagnatrampError>;
    async fn delete_file(&self, path: &str) -> Result<(), RagnatrampError>;
}

// ── Error classification ────────────────────────────────────────────

const ACCESS_DENIED_PATTERNS: &[&str] = &[
    "access is denied",
    "access denied",
    "unauthorizedaccess",
    "permission",
    "requires elevation",
    "administrator",
];

const UNAVAILABLE_PATTERNS: &[&str] = &[
    "hyper-v is not installed",
    "hyper-v is not enabled",
    "hypervisor is not running",
    "virtual machine management service",
    "vmms",
    "is not recognized as the name of a cmdlet",
    "virtualization",
];

const NOT_FOUND_PATTERNS: &[&str] = &[
    "unable to find a virtual machine",
    "objectnotfound",
    "was not found",
    "not found",
    "cannot find",
    "does not exist",
];

/// Map raw failure text onto the error taxonomy. Unmatched text is
/// `ExecutionFailed`.
pub fn classify_error(text: &str) -> ControlPlaneErrorKind {
    let lower = text.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(ACCESS_DENIED_PATTERNS) {
        ControlPlaneErrorKind::AccessDenied
    } else if matches(UNAVAILABLE_PATTERNS) {
        ControlPlaneErrorKind::HypervisorUnavailable
    } else if matches(NOT_FOUND_PATTERNS) {
        ControlPlaneErrorKind::NotFound
    } else {
        ControlPlaneErrorKind::ExecutionFailed
    }
}

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Debug, Facet)]
struct VmRecord {
    #[facet(rename = "Id")]
    id: String,
    #[facet(rename = "Name")]
    name: String,
    #[facet(rename = "State")]
    state: String,
    #[facet(rename = "Notes")]
    #[facet(default)]
    notes: Option<String>,
    #[facet(rename = "MemoryMB")]
    #[facet(default)]
    memory_mb: u64,
    #[facet(rename = "CPUCount")]
    #[facet(default)]
    cpu_count: u32,
}

impl From<VmRecord> for LiveVm {
    fn from(r: VmRecord) -> Self {
        LiveVm {
            id: r.id,
            name: r.name,
            power_state: PowerState::parse(&r.state),
            notes: r.notes.filter(|n| !n.is_empty()),
            memory_mb: r.memory_mb,
            cpu_count: r.cpu_count,
        }
    }
}

#[derive(Debug, Facet)]
struct CheckpointRecord {
    #[facet(rename = "Id")]
    id: String,
    #[facet(rename = "Name")]
    name: String,
    #[facet(rename = "CreationTime")]
    #[facet(default)]
    creation_time: String,
}

impl From<CheckpointRecord> for CheckpointInfo {
    fn from(r: CheckpointRecord) -> Self {
        CheckpointInfo {
            id: r.id,
            name: r.name,
            created_at: r.creation_time,
        }
    }
}

fn invalid_response(operation: &str, detail: impl fmt::Display) -> RagnatrampError {
    RagnatrampError::control_plane(
        ControlPlaneErrorKind::InvalidResponse,
        format!("{operation}: {detail}"),
    )
}

fn is_blank(output: &str) -> bool {
    let t = output.trim();
    t.is_empty() || t == "null"
}

fn parse_json<T>(operation: &str, output: &str) -> Result<T, RagnatrampError>
where
    T: for<'a> Facet<'a>,
{
    facet_json::from_str(output.trim()).map_err(|e| invalid_response(operation, e))
}

/// Parse a list response. Empty output is an empty list; a lone object is a
/// one-element list.
fn parse_list<T>(operation: &str, output: &str) -> Result<Vec<T>, RagnatrampError>
where
    T: for<'a> Facet<'a>,
{
    if is_blank(output) {
        return Ok(Vec::new());
    }
    if output.trim_start().starts_with('{') {
        return parse_json::<T>(operation, output).map(|one| vec![one]);
    }
    parse_json::<Vec<T>>(operation, output)
}

fn parse_one<T>(operation: &str, output: &str) -> Result<T, RagnatrampError>
where
    T: for<'a> Facet<'a>,
{
    if is_blank(output) {
        return Err(invalid_response(operation, "expected JSON output, got nothing"));
    }
    parse_json(operation, output)
}

pub fn parse_vm_list(operation: &str, output: &str) -> Result<Vec<LiveVm>, RagnatrampError> {
    parse_list::<VmRecord>(operation, output).map(|v| v.into_iter().map(Into::into).collect())
}

pub fn parse_vm(operation: &str, output: &str) -> Result<LiveVm, RagnatrampError> {
    parse_one::<VmRecord>(operation, output).map(Into::into)
}

pub fn parse_checkpoint_list(
    operation: &str,
    output: &str,
) -> Result<Vec<CheckpointInfo>, RagnatrampError> {
    parse_list::<CheckpointRecord>(operation, output)
        .map(|v| v.into_iter().map(Into::into).collect())
}

pub fn parse_checkpoint(operation: &str, output: &str) -> Result<CheckpointInfo, RagnatrampError> {
    parse_one::<CheckpointRecord>(operation, output).map(Into::into)
}

pub fn parse_bool(operation: &str, output: &str) -> Result<bool, RagnatrampError> {
    match output.trim() {
        "true" | "True" => Ok(true),
        "false" | "False" => Ok(false),
        other => Err(invalid_response(
            operation,
            format!("expected true/false, got '{other}'"),
        )),
    }
}
