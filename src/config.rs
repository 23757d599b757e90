use std::path::{Path, PathBuf};

use facet::Facet;
use sha2::{Digest, Sha256};

use crate::error::RagnatrampError;
use crate::{identity, paths};

pub const MAX_MACHINES: usize = 3;
pub const MAX_MACHINE_NAME_LEN: usize = 16;
pub const MAX_PROJECT_NAME_LEN: usize = 32;
pub const MIN_MEMORY_MB: u64 = 512;

const DEFAULT_CPU: u32 = 2;
const DEFAULT_MEMORY_MB: u64 = 2048;

// ── Document model ───────────────────────────────────────

#[derive(Debug, Clone, Facet)]
pub struct Config {
    pub project: ProjectConfig,
    #[facet(default)]
    pub defaults: MachineDefaults,
    #[facet(default)]
    pub machines: Vec<MachineConfig>,
    #[facet(default)]
    pub settings: SettingsConfig,
}

#[derive(Debug, Clone, Facet)]
pub struct ProjectConfig {
    pub name: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct MachineDefaults {
    pub cpu: Option<u32>,
    pub memory: Option<u64>,
    pub base_image: Option<String>,
    pub disk_strategy: Option<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct MachineConfig {
    pub name: String,
    pub cpu: Option<u32>,
    pub memory: Option<u64>,
    pub base_image: Option<String>,
    pub disk_strategy: Option<String>,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SettingsConfig {
    pub artifact_path: Option<String>,
    #[facet(default = true)]
    pub auto_start: bool,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            artifact_path: None,
            auto_start: true,
        }
    }
}

// ── Resolved model ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStrategy {
    /// Child disk storing deltas against a shared read-only base image.
    Differencing,
    /// Full copy of the base image.
    Copy,
}

impl DiskStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskStrategy::Differencing => "differencing",
            DiskStrategy::Copy => "copy",
        }
    }

    fn parse(s: &str) -> Result<Self, RagnatrampError> {
        match s {
            "differencing" => Ok(DiskStrategy::Differencing),
            "copy" => Ok(DiskStrategy::Copy),
            other => Err(RagnatrampError::Validation {
                message: format!("disk_strategy must be 'differencing' or 'copy' (got '{other}')"),
            }),
        }
    }
}

/// One machine with defaults applied and paths made absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMachine {
    pub name: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub base_image_path: PathBuf,
    pub disk_strategy: DiskStrategy,
}

/// Everything the planner and executor need about a config document.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub project: String,
    /// Canonical absolute path of the config file.
    pub config_path: PathBuf,
    /// SHA-256 of the config file contents, for drift detection.
    pub config_hash: String,
    pub artifact_path: PathBuf,
    pub auto_start: bool,
    pub machines: Vec<ResolvedMachine>,
}

impl ResolvedConfig {
    pub fn state_path(&self) -> PathBuf {
        paths::state_path(&self.config_path)
    }

    pub fn machine(&self, name: &str) -> Option<&ResolvedMachine> {
        self.machines.iter().find(|m| m.name == name)
    }

    pub fn machine_names(&self) -> Vec<&str> {
        self.machines.iter().map(|m| m.name.as_str()).collect()
    }

    /// Deterministic VM name for one of this config's machines.
    pub fn vm_name(&self, machine: &str) -> Result<String, RagnatrampError> {
        identity::generate_name(&self.project, machine, &self.config_path)
    }

    pub fn disk_path(&self, vm_name: &str) -> PathBuf {
        paths::disk_path(&self.artifact_path, vm_name)
    }
}

// ── Validation ───────────────────────────────────────────

fn validate_identifier(kind: &str, name: &str, max_len: usize) -> Result<(), RagnatrampError> {
    let valid = !name.is_empty()
        && name.len() <= max_len
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.ends_with('-');
    if !valid {
        return Err(RagnatrampError::Validation {
            message: format!(
                "{kind} name must match [A-Za-z][A-Za-z0-9-]* and be at most {max_len} characters (got '{name}')"
            ),
        });
    }
    Ok(())
}

fn validate_config(config: &Config) -> Result<(), RagnatrampError> {
    validate_identifier("project", &config.project.name, MAX_PROJECT_NAME_LEN)?;

    if config.machines.is_empty() || config.machines.len() > MAX_MACHINES {
        return Err(RagnatrampError::Validation {
            message: format!(
                "machines must list between 1 and {MAX_MACHINES} entries (got {})",
                config.machines.len()
            ),
        });
    }

    let mut seen: Vec<&str> = Vec::new();
    for m in &config.machines {
        validate_identifier("machine", &m.name, MAX_MACHINE_NAME_LEN)?;
        if seen.contains(&m.name.as_str()) {
            return Err(RagnatrampError::Validation {
                message: format!("duplicate machine name '{}'", m.name),
            });
        }
        seen.push(&m.name);
    }
    Ok(())
}

/// Whether a path is absolute on either Windows or Unix.
fn is_absolute_like(s: &str) -> bool {
    let b = s.as_bytes();
    Path::new(s).is_absolute()
        || s.starts_with('/')
        || s.starts_with(r"\\")
        || (b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && (b[2] == b'/' || b[2] == b'\\'))
}

fn absolutize(base_dir: &Path, s: &str) -> PathBuf {
    if is_absolute_like(s) {
        PathBuf::from(s)
    } else {
        base_dir.join(s)
    }
}

fn resolve_machine(
    m: &MachineConfig,
    defaults: &MachineDefaults,
    config_dir: &Path,
) -> Result<ResolvedMachine, RagnatrampError> {
    let cpu = m.cpu.or(defaults.cpu).unwrap_or(DEFAULT_CPU);
    if cpu < 1 {
        return Err(RagnatrampError::Validation {
            message: format!("machine '{}': cpu must be at least 1", m.name),
        });
    }

    let memory_mb = m.memory.or(defaults.memory).unwrap_or(DEFAULT_MEMORY_MB);
    if memory_mb < MIN_MEMORY_MB {
        return Err(RagnatrampError::Validation {
            message: format!(
                "machine '{}': memory must be at least {MIN_MEMORY_MB} MB (got {memory_mb})",
                m.name
            ),
        });
    }

    let base_image = m
        .base_image
        .as_deref()
        .or(defaults.base_image.as_deref())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RagnatrampError::Validation {
            message: format!(
                "machine '{}': base_image must be set on the machine or in defaults",
                m.name
            ),
        })?;

    let disk_strategy = match m.disk_strategy.as_deref().or(defaults.disk_strategy.as_deref()) {
        Some(s) => DiskStrategy::parse(s)?,
        None => DiskStrategy::Differencing,
    };

    Ok(ResolvedMachine {
        name: m.name.clone(),
        cpu,
        memory_mb,
        base_image_path: absolutize(config_dir, base_image),
        disk_strategy,
    })
}

/// Apply defaults and derive paths for an already-parsed document.
pub fn resolve(
    config: &Config,
    config_path: &Path,
    config_hash: &str,
) -> Result<ResolvedConfig, RagnatrampError> {
    validate_config(config)?;

    let config_dir = paths::config_dir(config_path);
    let machines = config
        .machines
        .iter()
        .map(|m| resolve_machine(m, &config.defaults, config_dir))
        .collect::<Result<Vec<_>, _>>()?;

    let artifact_path = match config.settings.artifact_path.as_deref() {
        Some(p) if !p.is_empty() => absolutize(config_dir, p),
        _ => paths::default_artifact_dir(config_path),
    };

    Ok(ResolvedConfig {
        project: config.project.name.clone(),
        config_path: config_path.to_path_buf(),
        config_hash: config_hash.into(),
        artifact_path,
        auto_start: config.settings.auto_start,
        machines,
    })
}

/// SHA-256 hex digest of the config document.
pub fn content_hash(contents: &str) -> String {
    format!("{:x}", Sha256::digest(contents.as_bytes()))
}

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, RagnatrampError> {
    facet_yaml::from_str(contents).map_err(|e| RagnatrampError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<ResolvedConfig, RagnatrampError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RagnatrampError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config = parse_config(&contents, path)?;

    let canonical = path.canonicalize().map_err(|source| RagnatrampError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    let canonical = paths::strip_verbatim(canonical);

    let resolved = resolve(&config, &canonical, &content_hash(&contents))?;
    tracing::debug!(
        path = %resolved.config_path.display(),
        project = %resolved.project,
        machines = resolved.machines.len(),
        "loaded config"
    );
    Ok(resolved)
}
