//! Process transport: one PowerShell invocation per request.

use std::io::{IsTerminal, Write};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{ControlPlaneErrorKind, RagnatrampError};

use super::request::{self, Request};
use super::{
    CheckpointInfo, ControlPlane, CreateVmParams, LiveVm, classify_error, parse_bool,
    parse_checkpoint, parse_checkpoint_list, parse_vm, parse_vm_list,
};

pub const DEFAULT_PROGRAM: &str = "powershell.exe";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_ARGS: &[&str] = &[
    "-NoProfile",
    "-NonInteractive",
    "-ExecutionPolicy",
    "Bypass",
    "-Command",
];

// ── CommandEcho ──────────────────────────────────────────

/// Writes each request's script to a diagnostic stream just before dispatch.
///
/// Dim-styled when the stream is a terminal, plain otherwise. Write errors
/// are ignored: this is a debugging aid and must not change results.
pub struct CommandEcho {
    sink: Option<Mutex<Box<dyn Write + Send>>>,
    styled: bool,
}

impl CommandEcho {
    pub fn disabled() -> Self {
        Self {
            sink: None,
            styled: false,
        }
    }

    pub fn stderr() -> Self {
        Self {
            styled: std::io::stderr().is_terminal(),
            sink: Some(Mutex::new(Box::new(std::io::stderr()))),
        }
    }

    pub fn to_writer(writer: impl Write + Send + 'static, styled: bool) -> Self {
        Self {
            sink: Some(Mutex::new(Box::new(writer))),
            styled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn emit(&self, request: &Request) {
        let Some(sink) = &self.sink else {
            return;
        };
        let Ok(mut w) = sink.lock() else {
            return;
        };
        let header = format!("> {}", request.operation);
        if self.styled {
            let _ = writeln!(w, "{}", console::style(header).dim().force_styling(true));
            let _ = writeln!(w, "{}", console::style(&request.script).dim().force_styling(true));
        } else {
            let _ = writeln!(w, "{header}");
            let _ = writeln!(w, "{}", request.script);
        }
        let _ = w.flush();
    }
}

// ── PowerShell ───────────────────────────────────────────

/// Hyper-V control plane reached through `powershell.exe -Command`.
pub struct PowerShell {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
    echo: CommandEcho,
}

impl Default for PowerShell {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerShell {
    pub fn new() -> Self {
        Self {
            program: DEFAULT_PROGRAM.into(),
            base_args: DEFAULT_ARGS.iter().map(|s| s.to_string()).collect(),
            timeout: DEFAULT_TIMEOUT,
            echo: CommandEcho::disabled(),
        }
    }

    /// Use a different executable. The script is appended after `base_args`.
    pub fn with_program(mut self, program: impl Into<String>, base_args: &[&str]) -> Self {
        self.program = program.into();
        self.base_args = base_args.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_echo(mut self, echo: CommandEcho) -> Self {
        self.echo = echo;
        self
    }

    /// Run one request and return its stdout.
    pub async fn execute(&self, request: &Request) -> Result<String, RagnatrampError> {
        self.echo.emit(request);
        tracing::debug!(operation = request.operation, "dispatching control plane request");

        let child = tokio::process::Command::new(&self.program)
            .args(&self.base_args)
            .arg(&request.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RagnatrampError::control_plane(
                    ControlPlaneErrorKind::ExecutionFailed,
                    format!(
                        "{}: failed to launch control plane `{}`: {e}",
                        request.operation, self.program
                    ),
                )
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RagnatrampError::control_plane(
                    ControlPlaneErrorKind::ExecutionFailed,
                    format!("{}: {e}", request.operation),
                ));
            }
            Err(_) => {
                tracing::warn!(operation = request.operation, "control plane request timed out");
                return Err(RagnatrampError::control_plane(
                    ControlPlaneErrorKind::ExecutionFailed,
                    format!(
                        "{}: timed out after {}s",
                        request.operation,
                        self.timeout.as_secs_f32()
                    ),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".into());
        let kind = classify_error(&detail);
        tracing::debug!(operation = request.operation, %kind, code = %code, "control plane request failed");
        Err(RagnatrampError::control_plane(
            kind,
            format!("{} (exit {code}): {detail}", request.operation),
        ))
    }
}

impl ControlPlane for PowerShell {
    async fn list_vms(&self) -> Result<Vec<LiveVm>, RagnatrampError> {
        let req = request::list_vms();
        parse_vm_list(req.operation, &self.execute(&req).await?)
    }

    async fn create_vm(&self, params: &CreateVmParams) -> Result<LiveVm, RagnatrampError> {
        let req = request::create_vm(params);
        parse_vm(req.operation, &self.execute(&req).await?)
    }

    async fn start_vm(&self, name: &str) -> Result<(), RagnatrampError> {
        self.execute(&request::start_vm(name)).await.map(drop)
    }

    async fn stop_vm(&self, name: &str) -> Result<(), RagnatrampError> {
        self.execute(&request::stop_vm(name)).await.map(drop)
    }

    async fn force_stop_vm(&self, name: &str) -> Result<(), RagnatrampError> {
        self.execute(&request::force_stop_vm(name)).await.map(drop)
    }

    async fn remove_vm(&self, name: &str) -> Result<(), RagnatrampError> {
        self.execute(&request::remove_vm(name)).await.map(drop)
    }

    async fn create_checkpoint(
        &self,
        vm: &str,
        checkpoint: &str,
    ) -> Result<CheckpointInfo, RagnatrampError> {
        let req = request::create_checkpoint(vm, checkpoint);
        parse_checkpoint(req.operation, &self.execute(&req).await?)
    }

    async fn restore_checkpoint(&self, vm: &str, checkpoint: &str) -> Result<(), RagnatrampError> {
        self.execute(&request::restore_checkpoint(vm, checkpoint))
            .await
            .map(drop)
    }

    async fn list_checkpoints(&self, vm: &str) -> Result<Vec<CheckpointInfo>, RagnatrampError> {
        let req = request::list_checkpoints(vm);
        parse_checkpoint_list(req.operation, &self.execute(&req).await?)
    }

    async fn remove_checkpoint(&self, vm: &str, checkpoint: &str) -> Result<(), RagnatrampError> {
        self.execute(&request::remove_checkpoint(vm, checkpoint))
            .await
            .map(drop)
    }

    async fn is_available(&self) -> Result<bool, RagnatrampError> {
        let req = request::check_available();
        parse_bool(req.operation, &self.execute(&req).await?)
    }

    async fn default_switch_exists(&self) -> Result<bool, RagnatrampError> {
        let req = request::check_default_switch();
        parse_bool(req.operation, &self.execute(&req).await?)
    }

    async fn file_exists(&self, path: &str) -> Result<bool, RagnatrampError> {
        let req = request::file_exists(path);
        parse_bool(req.operation, &self.execute(&req).await?)
    }

    async fn delete_file(&self, path: &str) -> Result<(), RagnatrampError> {
        self.execute(&request::delete_file(path)).await.map(drop)
    }
}
