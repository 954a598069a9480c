use super::{Composer, MountOps};
use crate::config;
use anyhow::{Context, Result};
use nix::unistd::{Gid, Group};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Templates `/etc/passwd`, `/etc/group` and `/etc/resolv.conf` in the
/// session directory and binds them over the container's copies.
pub(super) fn stage<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let identity = composer.privileges.effective_identity();

    if identity.uid.is_root() {
        debug!("payload runs as root, leaving passwd and group alone");
    } else {
        if composer.config.get_bool(config::CONFIG_PASSWD)? {
            if let Err(err) = passwd(composer) {
                warn!("skipping /etc/passwd: {err:#}");
            }
        }

        if composer.config.get_bool(config::CONFIG_GROUP)? {
            if let Err(err) = group(composer) {
                warn!("skipping /etc/group: {err:#}");
            }
        }
    }

    if composer.config.get_bool(config::CONFIG_RESOLV_CONF)? {
        if let Err(err) = resolv_conf(composer) {
            warn!("skipping /etc/resolv.conf: {err:#}");
        }
    }

    Ok(())
}

fn passwd<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let privileges = composer.privileges;
    let identity = privileges.effective_identity();

    let entry = passwd_entry(
        privileges.username(),
        identity.uid.as_raw(),
        identity.gid.as_raw(),
        privileges.gecos(),
        privileges.home(),
        privileges.shell(),
    );

    let container = read_container_file(composer, "/etc/passwd")?;
    install(composer, "passwd", "/etc/passwd", &append_line(&container, &entry))
}

fn group<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let privileges = composer.privileges;
    let identity = privileges.effective_identity();

    let mut gids = vec![identity.gid];
    gids.extend(identity.groups.iter().copied().filter(|gid| *gid != identity.gid));

    let groups = gids
        .into_iter()
        .filter_map(|gid| lookup_group(gid).map(|name| (name, gid.as_raw())))
        .collect::<Vec<_>>();

    let container = read_container_file(composer, "/etc/group")?;
    let merged = merge_groups(&container, &groups, privileges.username());
    install(composer, "group", "/etc/group", &merged)
}

fn resolv_conf<O: MountOps>(composer: &Composer<'_, O>) -> Result<()> {
    let host = fs::read_to_string("/etc/resolv.conf").context("Failed to read host resolv.conf")?;
    install(composer, "resolv.conf", "/etc/resolv.conf", &host)
}

fn read_container_file<O: MountOps>(composer: &Composer<'_, O>, inner: &str) -> Result<String> {
    let path = composer.tree().in_container(Path::new(inner));
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Writes `contents` to the session directory and binds it over `inner`.
fn install<O: MountOps>(
    composer: &Composer<'_, O>,
    name: &str,
    inner: &str,
    contents: &str,
) -> Result<()> {
    let staged: PathBuf = composer.tree().session().join(name);
    fs::write(&staged, contents).with_context(|| format!("Failed to write {}", staged.display()))?;

    let Some(target) = composer.ensure_target(Path::new(inner), false)? else {
        debug!(path = inner, "container has no such file");
        return Ok(());
    };

    composer
        .mounter()
        .bind(&staged, &target, composer.restrictive_flags())?;
    Ok(())
}

pub fn passwd_entry(
    username: &str,
    uid: u32,
    gid: u32,
    gecos: &str,
    home: &Path,
    shell: &Path,
) -> String {
    format!(
        "{username}:x:{uid}:{gid}:{gecos}:{}:{}",
        home.display(),
        shell.display()
    )
}

fn append_line(contents: &str, line: &str) -> String {
    let mut out = contents.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(line);
    out.push('\n');
    out
}

/// Adds a line for every group whose gid the container file does not know.
pub fn merge_groups(contents: &str, groups: &[(String, u32)], username: &str) -> String {
    let known = contents
        .lines()
        .filter_map(|line| line.split(':').nth(2))
        .filter_map(|gid| gid.parse::<u32>().ok())
        .collect::<Vec<_>>();

    groups
        .iter()
        .filter(|(_, gid)| !known.contains(gid))
        .fold(contents.to_string(), |acc, (name, gid)| {
            append_line(&acc, &format!("{name}:x:{gid}:{username}"))
        })
}

fn lookup_group(gid: Gid) -> Option<String> {
    match Group::from_gid(gid) {
        Ok(Some(group)) => Some(group.name),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passwd_entry_format() {
        let entry = passwd_entry(
            "alice",
            1000,
            1000,
            "Alice",
            Path::new("/home/alice"),
            Path::new("/bin/bash"),
        );
        assert_eq!(entry, "alice:x:1000:1000:Alice:/home/alice:/bin/bash");
    }

    #[test]
    fn test_append_line_handles_missing_newline() {
        assert_eq!(append_line("root:x:0:0::/root:/bin/sh", "a"), "root:x:0:0::/root:/bin/sh\na\n");
        assert_eq!(append_line("", "a"), "a\n");
    }

    #[test]
    fn test_merge_groups_skips_known_gids() {
        let contents = "root:x:0:\nusers:x:100:\n";
        let groups = vec![
            ("alice".to_string(), 1000),
            ("users".to_string(), 100),
            ("hpc".to_string(), 2000),
        ];

        let merged = merge_groups(contents, &groups, "alice");
        assert_eq!(
            merged,
            "root:x:0:\nusers:x:100:\nalice:x:1000:alice\nhpc:x:2000:alice\n"
        );
    }
}
