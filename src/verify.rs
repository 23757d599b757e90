//! Triple-check ownership gate.
//!
//! A VM may be mutated only when all three hold: the ledger tracks it, its
//! notes carry our marker for this exact config path, and its name is the one
//! we would generate. Each check is evaluated independently so the refusal
//! message can list every failure.

use std::path::Path;

use crate::control_plane::LiveVm;
use crate::identity;
use crate::state::StateFile;

/// Which project/machine/config a candidate VM is expected to belong to.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub project: &'a str,
    pub machine: &'a str,
    pub config_path: &'a Path,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipChecks {
    pub in_ledger: bool,
    pub marker_valid: bool,
    pub name_matches_pattern: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub owned: bool,
    pub checks: OwnershipChecks,
    /// Every failing check, joined. `None` when owned.
    pub reason: Option<String>,
}

impl Verification {
    pub fn reason_or_default(&self) -> &str {
        self.reason.as_deref().unwrap_or("ownership not established")
    }
}

pub fn verify(
    expected_name: &str,
    state: Option<&StateFile>,
    live: Option<&LiveVm>,
    subject: Subject<'_>,
) -> Verification {
    let mut failures: Vec<String> = Vec::new();

    let in_ledger = match state {
        Some(s) => s.find_by_name(expected_name).is_some(),
        None => false,
    };
    if !in_ledger {
        failures.push(match state {
            Some(_) => format!("'{expected_name}' is not tracked in the state file"),
            None => "no state file exists for this config".to_string(),
        });
    }

    let marker_valid = match live {
        Some(vm) => match marker_check(vm, subject.config_path) {
            Ok(()) => true,
            Err(why) => {
                failures.push(why);
                false
            }
        },
        None => {
            failures.push(format!("'{expected_name}' does not exist on the hypervisor"));
            false
        }
    };

    let name_matches_pattern = match live {
        Some(vm) => {
            let ok = identity::matches_expected_name(
                &vm.name,
                subject.project,
                subject.machine,
                subject.config_path,
            );
            if !ok {
                failures.push(format!(
                    "name '{}' is not the generated name for machine '{}' of this config",
                    vm.name, subject.machine
                ));
            }
            ok
        }
        None => false,
    };

    let checks = OwnershipChecks {
        in_ledger,
        marker_valid,
        name_matches_pattern,
    };
    let owned = in_ledger && marker_valid && name_matches_pattern;
    if !owned {
        tracing::debug!(name = expected_name, ?checks, "ownership verification failed");
    }

    Verification {
        owned,
        checks,
        reason: (!failures.is_empty()).then(|| failures.join("; ")),
    }
}

fn marker_check(vm: &LiveVm, config_path: &Path) -> Result<(), String> {
    let Some(notes) = vm.notes.as_deref() else {
        return Err(format!("'{}' has no ownership marker in its notes", vm.name));
    };
    let Some(marker) = identity::parse_marker(notes) else {
        return Err(format!("'{}' notes do not contain a ragnatramp marker", vm.name));
    };
    let expected = identity::normalize_path(&config_path.to_string_lossy());
    if identity::normalize_path(&marker.config_path) != expected {
        return Err(format!(
            "'{}' marker belongs to config '{}', not '{}'",
            vm.name,
            marker.config_path,
            config_path.display()
        ));
    }
    Ok(())
}
