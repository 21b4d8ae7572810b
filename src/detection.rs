//! Vulnerability descriptors ("detection files") and task metadata.

use crate::git_ops;
use anyhow::{Context, Result};
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DetectionError {
    #[error("invalid commit reference {0:?} (expected 40 lowercase hex characters)")]
    InvalidCommit(String),
    #[error("unsupported challenge mode {0:?}")]
    UnsupportedMode(String),
    #[error("delta mode requires a delta_ref")]
    MissingDeltaRef,
    #[error("blob for harness {harness} is not valid base64")]
    InvalidBlob { harness: String },
}

fn is_commit_hex(value: &str) -> bool {
    value.len() == 40
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn commit(value: String) -> Result<String, DetectionError> {
    if is_commit_hex(&value) {
        Ok(value)
    } else {
        Err(DetectionError::InvalidCommit(value))
    }
}

/// Which revisions of the project a vulnerability is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", try_from = "RawMode")]
pub enum ChallengeMode {
    /// The whole project at a single revision.
    Full { base_ref: String },
    /// A base revision plus an injected-bug revision on top of it.
    Delta { base_ref: String, delta_ref: String },
}

#[derive(Deserialize)]
struct RawMode {
    #[serde(rename = "type")]
    kind: String,
    base_ref: String,
    #[serde(default)]
    delta_ref: Option<String>,
}

impl TryFrom<RawMode> for ChallengeMode {
    type Error = DetectionError;

    fn try_from(raw: RawMode) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "full" => Ok(ChallengeMode::Full {
                base_ref: commit(raw.base_ref)?,
            }),
            "delta" => Ok(ChallengeMode::Delta {
                base_ref: commit(raw.base_ref)?,
                delta_ref: commit(raw.delta_ref.ok_or(DetectionError::MissingDeltaRef)?)?,
            }),
            other => Err(DetectionError::UnsupportedMode(other.to_string())),
        }
    }
}

impl ChallengeMode {
    pub fn kind(&self) -> &'static str {
        match self {
            ChallengeMode::Full { .. } => "full",
            ChallengeMode::Delta { .. } => "delta",
        }
    }

    pub fn base_ref(&self) -> &str {
        match self {
            ChallengeMode::Full { base_ref } | ChallengeMode::Delta { base_ref, .. } => base_ref,
        }
    }

    pub fn delta_ref(&self) -> Option<&str> {
        match self {
            ChallengeMode::Full { .. } => None,
            ChallengeMode::Delta { delta_ref, .. } => Some(delta_ref),
        }
    }

    /// The revision the vulnerable build is made from.
    pub fn target_ref(&self) -> &str {
        self.delta_ref().unwrap_or_else(|| self.base_ref())
    }

    /// Derive the mode from a checkout: full is `HEAD`; delta is `HEAD~1`
    /// (base) plus `HEAD` (delta).
    pub fn from_checkout(repo_dir: &Path, kind: &str) -> Result<Self> {
        let mode = match kind {
            "full" => ChallengeMode::Full {
                base_ref: git_ops::resolve_commit(repo_dir, "HEAD")?,
            },
            "delta" => ChallengeMode::Delta {
                base_ref: git_ops::resolve_commit(repo_dir, "HEAD~1")?,
                delta_ref: git_ops::resolve_commit(repo_dir, "HEAD")?,
            },
            other => return Err(DetectionError::UnsupportedMode(other.to_string()).into()),
        };
        Ok(mode)
    }
}

impl fmt::Display for ChallengeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChallengeMode::Full { base_ref } => write!(f, "full@{}", short(base_ref)),
            ChallengeMode::Delta {
                base_ref,
                delta_ref,
            } => write!(f, "delta@{}..{}", short(base_ref), short(delta_ref)),
        }
    }
}

fn short(commit: &str) -> &str {
    commit.get(..10).unwrap_or(commit)
}

/// One proof-of-vulnerability input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub harness_name: String,
    pub sanitizer_name: String,
    /// Base64-encoded PoV bytes.
    pub blob: String,
}

impl BlobInfo {
    pub fn decode(&self) -> Result<Vec<u8>, DetectionError> {
        base64::engine::general_purpose::STANDARD
            .decode(self.blob.trim())
            .map_err(|_| DetectionError::InvalidBlob {
                harness: self.harness_name.clone(),
            })
    }
}

/// A vulnerability to repair, as stored in a detection TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub vulnerability_identifier: String,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bug_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sarif_report: Option<String>,
    pub mode: ChallengeMode,
    #[serde(default)]
    pub blobs: Vec<BlobInfo>,
}

impl Detection {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let detection: Detection = toml::from_str(content)?;
        for blob in &detection.blobs {
            blob.decode()?;
        }
        Ok(detection)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read detection file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid detection file {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }
}

/// `metadata.json` of a prepared task directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub task_id: String,
    pub project_name: String,
    pub focus: String,
    /// Source checkout, relative to the task directory.
    pub source_directory: String,
    pub mode: String,
    pub base_commit: String,
    #[serde(default)]
    pub diff_commit: Option<String>,
    #[serde(default)]
    pub detections: Vec<String>,
}

impl TaskMetadata {
    pub fn load(task_dir: &Path) -> Result<Self> {
        let path = task_dir.join(METADATA_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid {}", path.display()))
    }

    /// Task directory owning a detection file (its grandparent).
    pub fn task_dir_for(detection_file: &Path) -> Option<PathBuf> {
        detection_file
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
    }

    pub fn source_path(&self, task_dir: &Path) -> PathBuf {
        task_dir.join(&self.source_directory)
    }
}

fn sanitizer_summary_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:==\d+==)?\s*ERROR:\s*(?:\w*Sanitizer|libFuzzer):\s*([A-Za-z][A-Za-z0-9_-]*)")
            .ok()
    })
    .as_ref()
}

/// Bug class from a sanitizer report, e.g. `heap-buffer-overflow`.
pub fn bug_class_from_crash_log(log: &str) -> Option<String> {
    sanitizer_summary_re()?
        .captures(log)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_ops::test_support::setup_repo;

    const BASE: &str = "0123456789abcdef0123456789abcdef01234567";
    const DELTA: &str = "89abcdef0123456789abcdef0123456789abcdef";

    fn delta_toml() -> String {
        format!(
            r#"
vulnerability_identifier = "cpv-1"
project_name = "libpng"

[mode]
type = "delta"
base_ref = "{BASE}"
delta_ref = "{DELTA}"

[[blobs]]
harness_name = "fuzz_read"
sanitizer_name = "address"
blob = "AAEC"
"#
        )
    }

    #[test]
    fn parses_delta_detection() {
        let detection = Detection::from_toml_str(&delta_toml()).unwrap();
        assert_eq!(detection.vulnerability_identifier, "cpv-1");
        assert_eq!(detection.mode.kind(), "delta");
        assert_eq!(detection.mode.base_ref(), BASE);
        assert_eq!(detection.mode.target_ref(), DELTA);
        assert_eq!(detection.blobs[0].decode().unwrap(), vec![0, 1, 2]);
        assert!(detection.bug_class.is_none());
    }

    #[test]
    fn full_mode_target_is_base() {
        let toml = format!(
            "vulnerability_identifier = \"v\"\nproject_name = \"p\"\n[mode]\ntype = \"full\"\nbase_ref = \"{BASE}\"\n"
        );
        let detection = Detection::from_toml_str(&toml).unwrap();
        assert_eq!(detection.mode.target_ref(), BASE);
        assert!(detection.blobs.is_empty());
    }

    #[test]
    fn rejects_bad_refs_and_modes() {
        let short = delta_toml().replace(DELTA, "abc123");
        assert!(Detection::from_toml_str(&short).is_err());
        let upper = delta_toml().replace(BASE, &BASE.to_uppercase());
        assert!(Detection::from_toml_str(&upper).is_err());
        let odd = delta_toml().replace("type = \"delta\"", "type = \"partial\"");
        let err = Detection::from_toml_str(&odd).unwrap_err();
        assert!(format!("{:#}", err).contains("unsupported challenge mode"));
    }

    #[test]
    fn rejects_invalid_blob() {
        let bad = delta_toml().replace("AAEC", "not base64!");
        assert!(Detection::from_toml_str(&bad).is_err());
    }

    #[test]
    fn toml_round_trip_keeps_mode_tag() {
        let detection = Detection::from_toml_str(&delta_toml()).unwrap();
        let text = detection.to_toml_string().unwrap();
        assert!(text.contains("type = \"delta\""));
        assert_eq!(Detection::from_toml_str(&text).unwrap(), detection);
    }

    #[test]
    fn mode_from_checkout() {
        let (_tmp, repo) = setup_repo();
        let full = ChallengeMode::from_checkout(&repo, "full").unwrap();
        let delta = ChallengeMode::from_checkout(&repo, "delta").unwrap();
        assert_eq!(full.base_ref(), delta.delta_ref().unwrap());
        assert_ne!(delta.base_ref(), full.base_ref());
        assert!(ChallengeMode::from_checkout(&repo, "other").is_err());
    }

    #[test]
    fn task_dir_is_grandparent() {
        let path = Path::new("/tasks/t1/detection/cpv-1.toml");
        assert_eq!(
            TaskMetadata::task_dir_for(path).unwrap(),
            PathBuf::from("/tasks/t1")
        );
    }

    #[test]
    fn metadata_loads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(METADATA_FILE),
            format!(
                r#"{{"task_id":"t1","project_name":"libpng","focus":"libpng",
                    "source_directory":"libpng","mode":"full","base_commit":"{BASE}",
                    "oss_fuzz_directory":"fuzz-tooling"}}"#
            ),
        )
        .unwrap();
        let meta = TaskMetadata::load(dir.path()).unwrap();
        assert_eq!(meta.source_path(dir.path()), dir.path().join("libpng"));
        assert!(meta.diff_commit.is_none());
    }

    #[test]
    fn bug_class_from_sanitizer_summary() {
        let log = "INFO: seed\n==12==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x1\nREAD of size 4";
        assert_eq!(
            bug_class_from_crash_log(log).as_deref(),
            Some("heap-buffer-overflow")
        );
        let msan = "==3==WARNING\nERROR: MemorySanitizer: use-of-uninitialized-value";
        assert_eq!(
            bug_class_from_crash_log(msan).as_deref(),
            Some("use-of-uninitialized-value")
        );
        assert!(bug_class_from_crash_log("all good").is_none());
    }
}
