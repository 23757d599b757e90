//! Deterministic VM naming and ownership markers.
//!
//! A VM's name is `{project}-{machine}-{hash8}` where `hash8` is the first
//! eight hex characters of SHA-256 over the normalized config path. The same
//! config file always yields the same names; two config files declaring the
//! same project and machine never collide.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::RagnatrampError;

/// Length of the config-path hash suffix.
pub const HASH_LEN: usize = 8;

const MARKER_TOOL_PREFIX: &str = "ragnatramp:v";
const MARKER_CONFIG_PREFIX: &str = "config:";
const MARKER_MANAGED: &str = "managed:true";

/// Case-folded, forward-slash form of a path used for hashing and comparison.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

/// First [`HASH_LEN`] lowercase hex chars of SHA-256 over the normalized path.
pub fn path_hash(config_path: &Path) -> String {
    let normalized = normalize_path(&config_path.to_string_lossy());
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(HASH_LEN);
    hex
}

pub fn generate_name(
    project: &str,
    machine: &str,
    config_path: &Path,
) -> Result<String, RagnatrampError> {
    if project.is_empty() {
        return Err(RagnatrampError::Validation {
            message: "project name must not be empty".into(),
        });
    }
    if machine.is_empty() {
        return Err(RagnatrampError::Validation {
            message: "machine name must not be empty".into(),
        });
    }
    Ok(format!("{project}-{machine}-{}", path_hash(config_path)))
}

/// Text written to the VM's Notes field at creation time.
pub fn generate_marker(config_path: &Path, tool_version: &str) -> String {
    format!(
        "{MARKER_TOOL_PREFIX}{tool_version}\n{MARKER_CONFIG_PREFIX}{}\n{MARKER_MANAGED}",
        config_path.display()
    )
}

/// Ownership marker read back from a live VM's notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub tool_version: String,
    pub config_path: String,
}

/// Parse a marker out of free-form notes. Returns `None` unless the tool line,
/// a config line and the managed flag are all present.
pub fn parse_marker(notes: &str) -> Option<Marker> {
    let mut tool_version = None;
    let mut config_path = None;
    let mut managed = false;

    for line in notes.lines().map(str::trim) {
        if let Some(v) = line.strip_prefix(MARKER_TOOL_PREFIX) {
            tool_version = Some(v.to_string());
        } else if let Some(p) = line.strip_prefix(MARKER_CONFIG_PREFIX) {
            config_path = Some(p.to_string());
        } else if line == MARKER_MANAGED {
            managed = true;
        }
    }

    match (tool_version, config_path, managed) {
        (Some(tool_version), Some(config_path), true) => Some(Marker {
            tool_version,
            config_path,
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub project: String,
    pub machine: String,
    pub hash: String,
}

/// Split a managed name back into its parts.
///
/// Both project and machine may contain hyphens, so the split is ambiguous;
/// the machine is taken as the last segment. Use [`matches_expected_name`]
/// for anything that matters.
pub fn parse_name(name: &str) -> Option<ParsedName> {
    if !is_managed_name(name) {
        return None;
    }
    let (rest, hash) = name.rsplit_once('-')?;
    let split = last_segment_split(rest)?;
    Some(ParsedName {
        project: rest[..split].to_string(),
        machine: rest[split + 1..].to_string(),
        hash: hash.to_string(),
    })
}

/// Whether `name` has the shape `^[A-Za-z][A-Za-z0-9-]*-[A-Za-z][A-Za-z0-9-]*-[0-9a-f]{8}$`.
pub fn is_managed_name(name: &str) -> bool {
    let Some((rest, hash)) = name.rsplit_once('-') else {
        return false;
    };
    let hash_ok = hash.len() == HASH_LEN
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    let rest_ok = rest.starts_with(|c: char| c.is_ascii_alphabetic())
        && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    hash_ok && rest_ok && last_segment_split(rest).is_some()
}

/// Index of the last hyphen in `rest` that is followed by a letter and not
/// the first character.
fn last_segment_split(rest: &str) -> Option<usize> {
    let bytes = rest.as_bytes();
    (1..bytes.len().saturating_sub(1))
        .rev()
        .find(|&i| bytes[i] == b'-' && bytes[i + 1].is_ascii_alphabetic())
}

pub fn matches_expected_name(
    candidate: &str,
    project: &str,
    machine: &str,
    config_path: &Path,
) -> bool {
    match generate_name(project, machine, config_path) {
        Ok(expected) => is_managed_name(candidate) && candidate == expected,
        Err(_) => false,
    }
}
