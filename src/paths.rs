use std::path::{Path, PathBuf};

/// Per-config working directory: `<config dir>/.ragnatramp/`
pub fn work_dir(config_path: &Path) -> PathBuf {
    config_dir(config_path).join(".ragnatramp")
}

/// The ownership ledger for a config file.
pub fn state_path(config_path: &Path) -> PathBuf {
    work_dir(config_path).join("state.json")
}

/// Default location for VM disks when the config does not set `artifact_path`.
pub fn default_artifact_dir(config_path: &Path) -> PathBuf {
    work_dir(config_path).join("disks")
}

/// Disk image for a VM: `<artifacts>/<vm name>/<vm name>.vhdx`
pub fn disk_path(artifact_dir: &Path, vm_name: &str) -> PathBuf {
    artifact_dir.join(vm_name).join(format!("{vm_name}.vhdx"))
}

/// Directory containing the config file; `.` for a bare filename.
pub fn config_dir(config_path: &Path) -> &Path {
    match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Strip the Windows verbatim prefix (`\\?\`) that `canonicalize` adds, so
/// hashed and displayed paths look like the ones users type.
pub fn strip_verbatim(path: PathBuf) -> PathBuf {
    let stripped = {
        let s = path.to_string_lossy();
        if let Some(rest) = s.strip_prefix(r"\\?\UNC\") {
            Some(PathBuf::from(format!(r"\\{rest}")))
        } else {
            s.strip_prefix(r"\\?\").map(PathBuf::from)
        }
    };
    stripped.unwrap_or(path)
}
