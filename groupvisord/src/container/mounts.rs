//! Volume mount builder: the sandbox a worker sees.
//!
//! Layout inside the worker:
//! - `/workspace/group`: the group's own folder (rw)
//! - `/workspace/ipc`: the group's mailbox (rw)
//! - `/workspace/store`: shared read-only configuration
//! - `/workspace/project`: project root, main group only (ro)
//! - `/workspace/global`: shared memory folder for non-main groups (ro, if present)
//! - `/workspace/extra/*`: extra mounts that passed the allowlist

use std::fs;
use std::path::{Path, PathBuf};

use groupvisor_core::ipc::group_ipc_dir;
use groupvisor_core::{Group, VolumeMount};
use tracing::{debug, warn};

use super::security::MountValidator;

/// Host directories the sandbox is assembled from.
#[derive(Debug, Clone)]
pub struct MountPaths {
    pub project_root: PathBuf,
    pub groups_dir: PathBuf,
    pub ipc_dir: PathBuf,
    pub store_dir: PathBuf,
}

fn bind(host: &Path, container: &str, readonly: bool) -> VolumeMount {
    VolumeMount {
        host_path: host.to_string_lossy().into_owned(),
        container_path: container.to_string(),
        readonly,
    }
}

fn ensure_dir(path: &Path) {
    if let Err(e) = fs::create_dir_all(path) {
        warn!(path = %path.display(), err = %e, "failed to create mount directory");
    }
}

pub fn build_volume_mounts(
    group: &Group,
    is_main: bool,
    paths: &MountPaths,
    validator: &MountValidator,
) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();

    let group_dir = paths.groups_dir.join(&group.folder);
    ensure_dir(&group_dir.join("logs"));
    mounts.push(bind(&group_dir, "/workspace/group", false));

    let ipc_dir = group_ipc_dir(&paths.ipc_dir, &group.folder);
    for sub in ["messages", "tasks", "input"] {
        ensure_dir(&ipc_dir.join(sub));
    }
    mounts.push(bind(&ipc_dir, "/workspace/ipc", false));

    ensure_dir(&paths.store_dir);
    mounts.push(bind(&paths.store_dir, "/workspace/store", true));

    if is_main {
        mounts.push(bind(&paths.project_root, "/workspace/project", true));
    } else {
        let global_dir = paths.groups_dir.join("global");
        if global_dir.is_dir() {
            mounts.push(bind(&global_dir, "/workspace/global", true));
        }
    }

    if let Some(config) = &group.container_config {
        if !config.additional_mounts.is_empty() {
            let validated =
                validator.validate_all(&config.additional_mounts, &group.folder, is_main);
            debug!(
                group = %group.folder,
                requested = config.additional_mounts.len(),
                granted = validated.len(),
                "extra mounts validated"
            );
            mounts.extend(validated.iter().map(|m| m.to_volume()));
        }
    }

    mounts
}

/// `groupvisor-{folder}-{millis}` with anything outside `[A-Za-z0-9-]` replaced.
pub fn container_name(group_folder: &str) -> String {
    let safe: String = group_folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!(
        "{}{}-{}",
        super::CONTAINER_NAME_PREFIX,
        safe,
        chrono::Utc::now().timestamp_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::security::{AllowedRoot, MountAllowlist};
    use groupvisor_core::{AdditionalMount, SandboxConfig};
    use tempfile::TempDir;

    fn paths(tmp: &TempDir) -> MountPaths {
        MountPaths {
            project_root: tmp.path().join("project"),
            groups_dir: tmp.path().join("groups"),
            ipc_dir: tmp.path().join("data/ipc"),
            store_dir: tmp.path().join("store"),
        }
    }

    fn group(folder: &str, config: Option<SandboxConfig>) -> Group {
        Group {
            chat_id: format!("{folder}@chat"),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: "@Andy".to_string(),
            added_at: "2025-01-01T00:00:00.000Z".to_string(),
            container_config: config,
            requires_trigger: None,
        }
    }

    fn find<'a>(mounts: &'a [VolumeMount], container: &str) -> Option<&'a VolumeMount> {
        mounts.iter().find(|m| m.container_path == container)
    }

    #[test]
    fn main_group_sees_project_read_only() {
        let tmp = TempDir::new().unwrap();
        let mounts = build_volume_mounts(
            &group("main", None),
            true,
            &paths(&tmp),
            &MountValidator::with_allowlist(None),
        );

        assert!(find(&mounts, "/workspace/project").unwrap().readonly);
        assert!(!find(&mounts, "/workspace/group").unwrap().readonly);
        assert!(!find(&mounts, "/workspace/ipc").unwrap().readonly);
        assert!(find(&mounts, "/workspace/store").unwrap().readonly);
        assert!(find(&mounts, "/workspace/global").is_none());
    }

    #[test]
    fn non_main_gets_global_but_not_project() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        fs::create_dir_all(p.groups_dir.join("global")).unwrap();

        let mounts = build_volume_mounts(
            &group("team", None),
            false,
            &p,
            &MountValidator::with_allowlist(None),
        );

        assert!(find(&mounts, "/workspace/project").is_none());
        assert!(find(&mounts, "/workspace/global").unwrap().readonly);
    }

    #[test]
    fn mailbox_and_log_dirs_created() {
        let tmp = TempDir::new().unwrap();
        let p = paths(&tmp);
        build_volume_mounts(
            &group("team", None),
            false,
            &p,
            &MountValidator::with_allowlist(None),
        );

        for sub in ["messages", "tasks", "input"] {
            assert!(p.ipc_dir.join("team").join(sub).is_dir(), "{sub}");
        }
        assert!(p.groups_dir.join("team/logs").is_dir());
    }

    #[test]
    fn rejected_extra_mounts_are_dropped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("shared");
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::create_dir_all(root.join(".ssh")).unwrap();

        let validator = MountValidator::with_allowlist(Some(MountAllowlist {
            allowed_roots: vec![AllowedRoot {
                path: root.to_string_lossy().into_owned(),
                allow_read_write: true,
                description: None,
            }],
            blocked_patterns: vec![],
            non_main_read_only: true,
        }));
        let config = SandboxConfig {
            additional_mounts: vec![
                AdditionalMount {
                    host_path: root.join("docs").to_string_lossy().into_owned(),
                    container_path: None,
                    readonly: false,
                },
                AdditionalMount {
                    host_path: root.join(".ssh").to_string_lossy().into_owned(),
                    container_path: None,
                    readonly: true,
                },
            ],
            timeout_ms: None,
        };

        let mounts = build_volume_mounts(&group("team", Some(config)), false, &paths(&tmp), &validator);
        let extras: Vec<_> = mounts
            .iter()
            .filter(|m| m.container_path.starts_with("/workspace/extra/"))
            .collect();
        assert_eq!(extras.len(), 1);
        assert_eq!(extras[0].container_path, "/workspace/extra/docs");
        assert!(extras[0].readonly);
        assert!(find(&mounts, "/workspace/group").is_some());
    }

    #[test]
    fn container_name_sanitizes_folder() {
        let name = container_name("team.eng/special");
        assert!(name.starts_with("groupvisor-team-eng-special-"));
        assert!(!name.contains('.'));
        assert!(!name.contains('/'));
    }
}
