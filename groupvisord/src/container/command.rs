//! Container runtime command line.

use groupvisor_core::VolumeMount;

/// Everything that varies between worker launches.
pub struct LaunchSpec<'a> {
    pub container_name: &'a str,
    pub image: &'a str,
    pub timezone: &'a str,
    pub group_folder: &'a str,
    pub is_main: bool,
    pub mounts: &'a [VolumeMount],
}

/// `run -i --rm --name {name} -e ... [--user uid:gid] -v ... {image}`.
pub fn build_container_args(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut args: Vec<String> = ["run", "-i", "--rm", "--name", spec.container_name]
        .into_iter()
        .map(String::from)
        .collect();

    for env in [
        format!("TZ={}", spec.timezone),
        format!("GROUP_FOLDER={}", spec.group_folder),
        format!("IS_MAIN={}", if spec.is_main { "1" } else { "0" }),
    ] {
        args.push("-e".to_string());
        args.push(env);
    }

    // Bind-mounted files stay owned by the host user.
    if let Some((uid, gid)) = host_user() {
        args.push("--user".to_string());
        args.push(format!("{uid}:{gid}"));
        args.push("-e".to_string());
        args.push("HOME=/home/worker".to_string());
    }

    for mount in spec.mounts {
        args.push("-v".to_string());
        if mount.readonly {
            args.push(format!("{}:{}:ro", mount.host_path, mount.container_path));
        } else {
            args.push(format!("{}:{}", mount.host_path, mount.container_path));
        }
    }

    args.push(spec.image.to_string());
    args
}

/// Host uid/gid, or `None` when running as root.
#[cfg(unix)]
fn host_user() -> Option<(u32, u32)> {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    (uid != 0).then_some((uid, gid))
}

#[cfg(not(unix))]
fn host_user() -> Option<(u32, u32)> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_carry_env_mounts_and_image_last() {
        let mounts = vec![
            VolumeMount {
                host_path: "/srv/project".to_string(),
                container_path: "/workspace/project".to_string(),
                readonly: true,
            },
            VolumeMount {
                host_path: "/srv/groups/main".to_string(),
                container_path: "/workspace/group".to_string(),
                readonly: false,
            },
        ];
        let args = build_container_args(&LaunchSpec {
            container_name: "groupvisor-main-1",
            image: "groupvisor-agent:latest",
            timezone: "Europe/Berlin",
            group_folder: "main",
            is_main: true,
            mounts: &mounts,
        });

        assert_eq!(&args[..5], ["run", "-i", "--rm", "--name", "groupvisor-main-1"]);
        assert!(args.contains(&"TZ=Europe/Berlin".to_string()));
        assert!(args.contains(&"GROUP_FOLDER=main".to_string()));
        assert!(args.contains(&"IS_MAIN=1".to_string()));
        assert!(args.contains(&"/srv/project:/workspace/project:ro".to_string()));
        assert!(args.contains(&"/srv/groups/main:/workspace/group".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("groupvisor-agent:latest"));

        let has_user = args.iter().any(|a| a == "--user");
        assert_eq!(has_user, host_user().is_some());
    }
}
