//! Mount security: validates extra worker mounts against an external allowlist.
//!
//! The allowlist lives outside every sandboxed path
//! (`~/.config/groupvisor/mount-allowlist.json` by default) so a worker can
//! never edit it. A missing or unreadable allowlist rejects every extra mount.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use groupvisor_core::{AdditionalMount, VolumeMount};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Always merged into the allowlist's own patterns.
const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    ".ssh",
    ".gnupg",
    ".gpg",
    ".aws",
    ".azure",
    ".gcloud",
    ".kube",
    ".docker",
    "credentials",
    ".env",
    ".netrc",
    ".npmrc",
    ".pypirc",
    "id_rsa",
    "id_ed25519",
    "private_key",
    ".secret",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountAllowlist {
    #[serde(default, alias = "allowed_roots")]
    pub allowed_roots: Vec<AllowedRoot>,
    #[serde(default, alias = "blocked_patterns")]
    pub blocked_patterns: Vec<String>,
    #[serde(
        default,
        alias = "non_main_read_only",
        alias = "nonMainForcedReadonly",
        alias = "non_main_forced_readonly"
    )]
    pub non_main_read_only: bool,
}

/// A root directory under which mounts may be granted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoot {
    pub path: String,
    #[serde(default, alias = "allow_read_write")]
    pub allow_read_write: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl MountAllowlist {
    /// Add the built-in blocked patterns the file did not already list.
    fn with_default_patterns(mut self) -> Self {
        let mut merged: Vec<String> = DEFAULT_BLOCKED_PATTERNS
            .iter()
            .map(|s| s.to_string())
            .collect();
        for pattern in self.blocked_patterns.drain(..) {
            if !merged.contains(&pattern) {
                merged.push(pattern);
            }
        }
        self.blocked_patterns = merged;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MountRejected {
    #[error("no mount allowlist configured")]
    NoAllowlist,
    #[error("invalid container path {0:?}: must be relative, non-empty, and free of \"..\"")]
    InvalidContainerPath(String),
    #[error("host path does not exist: {requested:?} (expanded: {expanded:?})")]
    Missing { requested: String, expanded: String },
    #[error("path matches blocked pattern {pattern:?}: {path:?}")]
    BlockedPattern { pattern: String, path: String },
    #[error("path {path:?} is not under any allowed root (allowed: {roots})")]
    OutsideRoots { path: String, roots: String },
}

/// Mount that passed validation, with the effective access mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedMount {
    pub host_path: String,
    /// Relative name under `/workspace/extra`.
    pub container_name: String,
    pub readonly: bool,
    /// Which root granted the mount.
    pub granted_by: String,
}

impl ValidatedMount {
    pub fn to_volume(&self) -> VolumeMount {
        VolumeMount {
            host_path: self.host_path.clone(),
            container_path: format!("/workspace/extra/{}", self.container_name),
            readonly: self.readonly,
        }
    }
}

/// Loads the allowlist once and judges mount requests against it.
pub struct MountValidator {
    path: PathBuf,
    allowlist: OnceLock<Option<MountAllowlist>>,
}

impl MountValidator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            allowlist: OnceLock::new(),
        }
    }

    /// Validator with an already-loaded allowlist.
    pub fn with_allowlist(allowlist: Option<MountAllowlist>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(allowlist.map(MountAllowlist::with_default_patterns));
        Self {
            path: PathBuf::new(),
            allowlist: cell,
        }
    }

    pub fn allowlist_path(&self) -> &Path {
        &self.path
    }

    /// The cached allowlist; read from disk on first use.
    pub fn allowlist(&self) -> Option<&MountAllowlist> {
        self.allowlist
            .get_or_init(|| load_allowlist(&self.path))
            .as_ref()
    }

    pub fn validate(
        &self,
        mount: &AdditionalMount,
        is_main: bool,
    ) -> Result<ValidatedMount, MountRejected> {
        let allowlist = self.allowlist().ok_or(MountRejected::NoAllowlist)?;
        validate_mount(mount, is_main, allowlist)
    }

    /// Keep only mounts that pass; rejections are logged and skipped.
    pub fn validate_all(
        &self,
        mounts: &[AdditionalMount],
        group: &str,
        is_main: bool,
    ) -> Vec<ValidatedMount> {
        mounts
            .iter()
            .filter_map(|mount| match self.validate(mount, is_main) {
                Ok(validated) => {
                    debug!(
                        group,
                        host_path = %validated.host_path,
                        root = %validated.granted_by,
                        readonly = validated.readonly,
                        "extra mount allowed"
                    );
                    Some(validated)
                }
                Err(reason) => {
                    warn!(
                        group,
                        requested_path = %mount.host_path,
                        reason = %reason,
                        "extra mount rejected"
                    );
                    None
                }
            })
            .collect()
    }
}

fn load_allowlist(path: &Path) -> Option<MountAllowlist> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(err) => {
            warn!(
                path = %path.display(),
                err = %err,
                "mount allowlist unavailable, extra mounts will be rejected"
            );
            return None;
        }
    };

    let allowlist: MountAllowlist = match serde_json::from_str(&content) {
        Ok(a) => a,
        Err(err) => {
            warn!(
                path = %path.display(),
                err = %err,
                "failed to parse mount allowlist, extra mounts will be rejected"
            );
            return None;
        }
    };
    let allowlist = allowlist.with_default_patterns();

    info!(
        path = %path.display(),
        allowed_roots = allowlist.allowed_roots.len(),
        blocked_patterns = allowlist.blocked_patterns.len(),
        "mount allowlist loaded"
    );
    Some(allowlist)
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/root".to_string()))
}

fn expand_path(p: &str) -> PathBuf {
    if p == "~" {
        home_dir()
    } else if let Some(rest) = p.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(p)
    }
}

fn is_valid_container_path(p: &str) -> bool {
    !p.is_empty() && !p.contains("..") && !p.starts_with('/')
}

/// Substring match on the whole resolved path. This over-blocks on purpose:
/// `secretary` matches `secret`.
fn matches_blocked_pattern<'a>(real: &Path, patterns: &'a [String]) -> Option<&'a str> {
    let real = real.to_string_lossy();
    patterns
        .iter()
        .map(String::as_str)
        .find(|pattern| !pattern.is_empty() && real.contains(pattern))
}

fn find_allowed_root<'a>(real: &Path, roots: &'a [AllowedRoot]) -> Option<&'a AllowedRoot> {
    roots.iter().find(|root| {
        std::fs::canonicalize(expand_path(&root.path))
            .map(|root_real| real.starts_with(root_real))
            .unwrap_or(false)
    })
}

pub fn validate_mount(
    mount: &AdditionalMount,
    is_main: bool,
    allowlist: &MountAllowlist,
) -> Result<ValidatedMount, MountRejected> {
    let container_name = match &mount.container_path {
        Some(p) => p.clone(),
        None => Path::new(&mount.host_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("mount")
            .to_string(),
    };
    if !is_valid_container_path(&container_name) {
        return Err(MountRejected::InvalidContainerPath(container_name));
    }

    let expanded = expand_path(&mount.host_path);
    let real = std::fs::canonicalize(&expanded).map_err(|_| MountRejected::Missing {
        requested: mount.host_path.clone(),
        expanded: expanded.display().to_string(),
    })?;

    if let Some(pattern) = matches_blocked_pattern(&real, &allowlist.blocked_patterns) {
        return Err(MountRejected::BlockedPattern {
            pattern: pattern.to_string(),
            path: real.display().to_string(),
        });
    }

    let Some(root) = find_allowed_root(&real, &allowlist.allowed_roots) else {
        let roots = allowlist
            .allowed_roots
            .iter()
            .map(|r| expand_path(&r.path).display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(MountRejected::OutsideRoots {
            path: real.display().to_string(),
            roots,
        });
    };

    let readonly = if mount.readonly {
        true
    } else if !is_main && allowlist.non_main_read_only {
        info!(mount = %mount.host_path, "mount forced read-only for non-main group");
        true
    } else if !root.allow_read_write {
        info!(
            mount = %mount.host_path,
            root = %root.path,
            "mount forced read-only, root does not allow read-write"
        );
        true
    } else {
        false
    };

    Ok(ValidatedMount {
        host_path: real.to_string_lossy().into_owned(),
        container_name,
        readonly,
        granted_by: match &root.description {
            Some(d) => format!("{} ({d})", root.path),
            None => root.path.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn test_allowlist(root: &Path) -> MountAllowlist {
        MountAllowlist {
            allowed_roots: vec![AllowedRoot {
                path: root.to_string_lossy().into_owned(),
                allow_read_write: true,
                description: Some("test root".to_string()),
            }],
            blocked_patterns: vec![],
            non_main_read_only: true,
        }
        .with_default_patterns()
    }

    fn mount(host: &Path, container: Option<&str>, readonly: bool) -> AdditionalMount {
        AdditionalMount {
            host_path: host.to_string_lossy().into_owned(),
            container_path: container.map(str::to_string),
            readonly,
        }
    }

    #[test]
    fn allows_path_under_allowed_root() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("project");
        fs::create_dir_all(&sub).unwrap();

        let ok = validate_mount(&mount(&sub, Some("project"), true), true, &test_allowlist(tmp.path()))
            .unwrap();
        assert_eq!(ok.container_name, "project");
        assert!(ok.readonly);
        assert_eq!(ok.to_volume().container_path, "/workspace/extra/project");
        assert!(ok.granted_by.contains("test root"));
    }

    #[test]
    fn rejects_path_outside_roots() {
        let tmp = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let sub = other.path().join("elsewhere");
        fs::create_dir_all(&sub).unwrap();

        let err = validate_mount(&mount(&sub, None, true), true, &test_allowlist(tmp.path()))
            .unwrap_err();
        assert!(matches!(err, MountRejected::OutsideRoots { .. }));
    }

    #[test]
    fn blocked_pattern_wins_over_allowed_root() {
        let tmp = TempDir::new().unwrap();
        let ssh = tmp.path().join(".ssh");
        fs::create_dir_all(&ssh).unwrap();

        let err = validate_mount(&mount(&ssh, None, true), true, &test_allowlist(tmp.path()))
            .unwrap_err();
        assert_eq!(
            err,
            MountRejected::BlockedPattern {
                pattern: ".ssh".to_string(),
                path: fs::canonicalize(&ssh).unwrap().display().to_string(),
            }
        );
    }

    #[test]
    fn blocked_pattern_is_a_plain_substring() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("secretary-notes");
        fs::create_dir_all(&sub).unwrap();
        let mut allowlist = test_allowlist(tmp.path());
        allowlist.blocked_patterns.push("secret".to_string());

        let err = validate_mount(&mount(&sub, None, true), true, &allowlist).unwrap_err();
        assert!(matches!(err, MountRejected::BlockedPattern { .. }));
    }

    #[test]
    fn symlink_resolved_before_matching() {
        let tmp = TempDir::new().unwrap();
        let hidden = tmp.path().join(".aws");
        fs::create_dir_all(&hidden).unwrap();
        let link = tmp.path().join("innocent");
        std::os::unix::fs::symlink(&hidden, &link).unwrap();

        let err = validate_mount(&mount(&link, Some("innocent"), true), true, &test_allowlist(tmp.path()))
            .unwrap_err();
        assert!(matches!(err, MountRejected::BlockedPattern { .. }));
    }

    #[test]
    fn rejects_traversal_and_absolute_container_paths() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("ok");
        fs::create_dir_all(&sub).unwrap();
        let allowlist = test_allowlist(tmp.path());

        for bad in ["../../etc/passwd", "/etc/bad", ""] {
            let err = validate_mount(&mount(&sub, Some(bad), true), true, &allowlist).unwrap_err();
            assert_eq!(err, MountRejected::InvalidContainerPath(bad.to_string()));
        }
    }

    #[test]
    fn non_main_forced_read_only() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("data");
        fs::create_dir_all(&sub).unwrap();
        let allowlist = test_allowlist(tmp.path());

        let non_main = validate_mount(&mount(&sub, Some("data"), false), false, &allowlist).unwrap();
        assert!(non_main.readonly);

        let main = validate_mount(&mount(&sub, Some("data"), false), true, &allowlist).unwrap();
        assert!(!main.readonly);
    }

    #[test]
    fn read_only_root_caps_main_too() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("data");
        fs::create_dir_all(&sub).unwrap();
        let mut allowlist = test_allowlist(tmp.path());
        allowlist.allowed_roots[0].allow_read_write = false;

        let main = validate_mount(&mount(&sub, None, false), true, &allowlist).unwrap();
        assert!(main.readonly);
    }

    #[test]
    fn nonexistent_path_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = validate_mount(
            &mount(Path::new("/nonexistent/path/to/nowhere"), None, true),
            true,
            &test_allowlist(tmp.path()),
        )
        .unwrap_err();
        assert!(matches!(err, MountRejected::Missing { .. }));
    }

    #[test]
    fn container_name_defaults_to_basename() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("my-project");
        fs::create_dir_all(&sub).unwrap();

        let ok = validate_mount(&mount(&sub, None, true), true, &test_allowlist(tmp.path())).unwrap();
        assert_eq!(ok.container_name, "my-project");
    }

    #[test]
    fn missing_allowlist_rejects_everything() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("data");
        fs::create_dir_all(&sub).unwrap();

        let validator = MountValidator::new(tmp.path().join("absent.json"));
        assert!(validator.allowlist().is_none());
        assert_eq!(
            validator.validate(&mount(&sub, None, true), true),
            Err(MountRejected::NoAllowlist)
        );
        assert!(validator.validate_all(&[mount(&sub, None, true)], "main", true).is_empty());
    }

    #[test]
    fn allowlist_file_loaded_once_with_either_key_style() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("good")).unwrap();
        let path = tmp.path().join("allow.json");
        fs::write(
            &path,
            format!(
                r#"{{"allowed_roots":[{{"path":"{}","allow_read_write":true}}],
                    "blocked_patterns":["private"],
                    "non_main_forced_readonly":false}}"#,
                root.display()
            ),
        )
        .unwrap();

        let validator = MountValidator::new(&path);
        let allowlist = validator.allowlist().unwrap();
        assert!(!allowlist.non_main_read_only);
        assert!(allowlist.blocked_patterns.iter().any(|p| p == ".ssh"));
        assert!(allowlist.blocked_patterns.iter().any(|p| p == "private"));

        // Later edits are not picked up.
        fs::remove_file(&path).unwrap();
        let mounts = vec![
            mount(&root.join("good"), None, false),
            mount(Path::new("/nonexistent"), None, true),
        ];
        let validated = validator.validate_all(&mounts, "team", false);
        assert_eq!(validated.len(), 1);
        assert!(!validated[0].readonly);

        let camel: MountAllowlist = serde_json::from_str(
            r#"{"allowedRoots":[{"path":"~/src","allowReadWrite":false}],"blockedPatterns":[],"nonMainReadOnly":true}"#,
        )
        .unwrap();
        assert!(camel.non_main_read_only);
        assert!(!camel.allowed_roots[0].allow_read_write);
    }
}
