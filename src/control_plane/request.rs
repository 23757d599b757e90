//! PowerShell request builders for Hyper-V.
//!
//! Free text (VM names, checkpoint names, paths, notes) only ever reaches a
//! script through [`quote`], which emits a single-quoted literal with every
//! quote character doubled. Numbers are formatted directly.

use std::fmt::Write;

use crate::config::DiskStrategy;

use super::CreateVmParams;

/// Virtual switch new VMs are attached to.
pub const DEFAULT_SWITCH: &str = "Default Switch";

const PRELUDE: &str = "$ErrorActionPreference = 'Stop'\n$ProgressPreference = 'SilentlyContinue'\n";

const VM_FIELDS: &str = "@{n='Id';e={$_.Id.ToString()}}, \
@{n='Name';e={$_.Name}}, \
@{n='State';e={$_.State.ToString()}}, \
@{n='Notes';e={$_.Notes}}, \
@{n='MemoryMB';e={[int64]($_.MemoryStartup / 1MB)}}, \
@{n='CPUCount';e={$_.ProcessorCount}}";

const CHECKPOINT_FIELDS: &str = "@{n='Id';e={$_.Id.ToString()}}, \
@{n='Name';e={$_.Name}}, \
@{n='CreationTime';e={$_.CreationTime.ToUniversalTime().ToString('o')}}";

/// One script destined for the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Short operation label used in logs and errors.
    pub operation: &'static str,
    pub script: String,
}

impl Request {
    fn new(operation: &'static str, body: &str) -> Self {
        Self {
            operation,
            script: format!("{PRELUDE}{body}"),
        }
    }

    /// A request whose script is sent verbatim, without the prelude.
    pub fn raw(operation: &'static str, script: impl Into<String>) -> Self {
        Self {
            operation,
            script: script.into(),
        }
    }
}

/// Escape text for the inside of a PowerShell single-quoted string.
///
/// PowerShell treats the typographic single quotes U+2018..U+201B as quote
/// characters too, so those are doubled along with `'`. NUL is dropped.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\'' | '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' => {
                out.push(c);
                out.push(c);
            }
            '\0' => {}
            _ => out.push(c),
        }
    }
    out
}

/// Single-quoted PowerShell literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", escape(value))
}

pub fn list_vms() -> Request {
    Request::new(
        "list-vms",
        &format!("ConvertTo-Json -Depth 3 -Compress -InputObject @(Get-VM | Select-Object {VM_FIELDS})"),
    )
}

pub fn create_vm(p: &CreateVmParams) -> Request {
    let disk = p.disk_path.display().to_string();
    let base = p.base_image.display().to_string();

    let mut body = String::new();
    let _ = writeln!(body, "$disk = {}", quote(&disk));
    body.push_str("New-Item -ItemType Directory -Force -Path (Split-Path -Parent $disk) | Out-Null\n");
    match p.disk_strategy {
        DiskStrategy::Differencing => {
            let _ = writeln!(
                body,
                "New-VHD -Path $disk -ParentPath {} -Differencing | Out-Null",
                quote(&base)
            );
        }
        DiskStrategy::Copy => {
            let _ = writeln!(body, "Copy-Item -LiteralPath {} -Destination $disk", quote(&base));
        }
    }
    let _ = writeln!(
        body,
        "$vm = New-VM -Name {} -Generation 2 -MemoryStartupBytes {}MB -VHDPath $disk -SwitchName {}",
        quote(&p.name),
        p.memory_mb,
        quote(DEFAULT_SWITCH)
    );
    let _ = writeln!(
        body,
        "Set-VM -VM $vm -ProcessorCount {} -Notes {} -AutomaticCheckpointsEnabled $false",
        p.cpu,
        quote(&p.notes)
    );
    let _ = write!(
        body,
        "Get-VM -Id $vm.Id | Select-Object {VM_FIELDS} | ConvertTo-Json -Depth 3 -Compress"
    );
    Request::new("create-vm", &body)
}

pub fn start_vm(name: &str) -> Request {
    Request::new("start-vm", &format!("Start-VM -Name {}", quote(name)))
}

pub fn stop_vm(name: &str) -> Request {
    Request::new("stop-vm", &format!("Stop-VM -Name {} -Force", quote(name)))
}

pub fn force_stop_vm(name: &str) -> Request {
    Request::new(
        "force-stop-vm",
        &format!("Stop-VM -Name {} -TurnOff -Force", quote(name)),
    )
}

pub fn remove_vm(name: &str) -> Request {
    Request::new("remove-vm", &format!("Remove-VM -Name {} -Force", quote(name)))
}

pub fn create_checkpoint(vm: &str, checkpoint: &str) -> Request {
    Request::new(
        "create-checkpoint",
        &format!(
            "Checkpoint-VM -Name {} -SnapshotName {} -Passthru | Select-Object {CHECKPOINT_FIELDS} | ConvertTo-Json -Compress",
            quote(vm),
            quote(checkpoint)
        ),
    )
}

pub fn restore_checkpoint(vm: &str, checkpoint: &str) -> Request {
    Request::new(
        "restore-checkpoint",
        &format!(
            "Restore-VMSnapshot -VMName {} -Name {} -Confirm:$false",
            quote(vm),
            quote(checkpoint)
        ),
    )
}

pub fn list_checkpoints(vm: &str) -> Request {
    Request::new(
        "list-checkpoints",
        &format!(
            "ConvertTo-Json -Compress -InputObject @(Get-VMSnapshot -VMName {} | Select-Object {CHECKPOINT_FIELDS})",
            quote(vm)
        ),
    )
}

pub fn remove_checkpoint(vm: &str, checkpoint: &str) -> Request {
    Request::new(
        "remove-checkpoint",
        &format!(
            "Remove-VMSnapshot -VMName {} -Name {} -Confirm:$false",
            quote(vm),
            quote(checkpoint)
        ),
    )
}

pub fn check_available() -> Request {
    Request::new(
        "check-available",
        "$cmd = Get-Command -Name Get-VM -ErrorAction SilentlyContinue\n\
         $svc = Get-Service -Name vmms -ErrorAction SilentlyContinue\n\
         ConvertTo-Json -InputObject ([bool]$cmd -and [bool]$svc -and $svc.Status -eq 'Running')",
    )
}

pub fn check_default_switch() -> Request {
    Request::new(
        "check-default-switch",
        &format!(
            "ConvertTo-Json -InputObject ([bool](Get-VMSwitch -Name {} -ErrorAction SilentlyContinue))",
            quote(DEFAULT_SWITCH)
        ),
    )
}

pub fn file_exists(path: &str) -> Request {
    Request::new(
        "check-file",
        &format!(
            "ConvertTo-Json -InputObject (Test-Path -LiteralPath {} -PathType Leaf)",
            quote(path)
        ),
    )
}

pub fn delete_file(path: &str) -> Request {
    Request::new(
        "delete-file",
        &format!("Remove-Item -LiteralPath {} -Force", quote(path)),
    )
}
