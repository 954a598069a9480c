use anyhow::{Context, Result};
use nix::sched::CloneFlags;
use std::{fs, path::Path};

pub fn is_namespace_supported(flag: CloneFlags) -> bool {
    fn exists(ns: &str) -> bool {
        Path::new(&format!("/proc/self/ns/{}", ns)).exists()
    }

    match flag {
        CloneFlags::CLONE_NEWIPC => exists("ipc"),
        CloneFlags::CLONE_NEWNET => exists("net"),
        CloneFlags::CLONE_NEWNS => exists("mnt"),
        CloneFlags::CLONE_NEWPID => exists("pid"),
        CloneFlags::CLONE_NEWUSER => exists("user"),
        CloneFlags::CLONE_NEWUTS => exists("uts"),
        _ => false,
    }
}

/// Whether `/proc/filesystems` lists `name`.
pub fn is_filesystem_supported(name: &str) -> Result<bool> {
    let contents =
        fs::read_to_string("/proc/filesystems").context("Failed to read /proc/filesystems")?;
    Ok(filesystems_contains(&contents, name))
}

pub fn is_overlay_supported() -> bool {
    is_filesystem_supported("overlay").unwrap_or(false)
}

fn filesystems_contains(contents: &str, name: &str) -> bool {
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|fs| fs == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystems_parsing() {
        let contents = "nodev\tsysfs\nnodev\ttmpfs\n\text4\nnodev\toverlay\n\tsquashfs\n";
        assert!(filesystems_contains(contents, "overlay"));
        assert!(filesystems_contains(contents, "ext4"));
        assert!(!filesystems_contains(contents, "ext3"));
        assert!(!filesystems_contains(contents, "nodev"));
    }

    #[test]
    fn test_mount_namespace_is_always_present() {
        assert!(is_namespace_supported(CloneFlags::CLONE_NEWNS));
        assert!(!is_namespace_supported(CloneFlags::CLONE_VM));
    }
}
