//! `/proc/self/mounts` parsing.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub fstype: String,
    pub options: String,
}

pub fn parse(contents: &str) -> Vec<MountEntry> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some(MountEntry {
                source: unescape(fields.next()?),
                target: PathBuf::from(unescape(fields.next()?)),
                fstype: fields.next()?.to_string(),
                options: fields.next().unwrap_or_default().to_string(),
            })
        })
        .collect()
}

pub fn read() -> Result<Vec<MountEntry>> {
    let contents =
        fs::read_to_string("/proc/self/mounts").context("Failed to read /proc/self/mounts")?;
    Ok(parse(&contents))
}

/// Whether something is mounted exactly at `target`.
pub fn is_mounted(target: &Path) -> Result<bool> {
    Ok(read()?.iter().any(|entry| entry.target == target))
}

/// Reverses the kernel's octal escaping of space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\' && index + 3 < bytes.len() && is_octal(&bytes[index + 1..index + 4]) {
            let value = bytes[index + 1..index + 4]
                .iter()
                .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
            out.push(value as u8);
            index += 4;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|digit| (b'0'..=b'7').contains(digit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mounts() {
        let contents = "proc /proc proc rw,nosuid 0 0\n\
                        /dev/loop3 /var/singularity/mnt/source ext3 ro,nosuid,nodev 0 0\n\
                        /dev/sda1 /mnt/with\\040space ext4 rw 0 0\n";
        let entries = parse(contents);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].source, "/dev/loop3");
        assert_eq!(entries[1].fstype, "ext3");
        assert!(entries[1].options.contains("nodev"));
        assert_eq!(entries[2].target, PathBuf::from("/mnt/with space"));
    }

    #[test]
    fn test_unescape_leaves_plain_backslashes() {
        assert_eq!(unescape("a\\b"), "a\\b");
        assert_eq!(unescape("tab\\011x"), "tab\tx");
        assert_eq!(unescape("end\\04"), "end\\04");
    }

    #[test]
    fn test_root_is_mounted() -> Result<()> {
        assert!(is_mounted(Path::new("/"))?);
        Ok(())
    }
}
