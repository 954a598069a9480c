//! Format detection from the first bytes of an image file.

use super::ImageKind;
use std::path::Path;

/// Textual prelude written at byte 0 of ext-family images.
pub const LAUNCH_HEADER: &[u8] = b"#!/usr/bin/env run-singularity\n";

pub const SQUASHFS_MAGIC: &[u8] = b"hsqs";

/// Bytes read for detection.
pub const PROBE_LEN: usize = 1024;

/// The newline ending the launch header must appear within this many bytes.
const HEADER_SCAN_LEN: usize = 64;

/// Offset of the byte following the first newline in the leading
/// `HEADER_SCAN_LEN` bytes of an `#!` line.
pub fn header_offset(prefix: &[u8]) -> Option<u64> {
    if !prefix.starts_with(b"#!") {
        return None;
    }

    prefix
        .iter()
        .take(HEADER_SCAN_LEN)
        .position(|byte| *byte == b'\n')
        .map(|index| index as u64 + 1)
}

/// Classifies a regular file from its leading bytes. Directories are
/// recognised by the caller before this runs.
pub fn classify(prefix: &[u8], path: &Path) -> Option<(ImageKind, u64)> {
    if prefix.starts_with(SQUASHFS_MAGIC) {
        return Some((ImageKind::Squashfs, 0));
    }

    if prefix.starts_with(b"#!") {
        let window = &prefix[..prefix.len().min(PROBE_LEN)];
        if let Some(newline) = window.iter().position(|byte| *byte == b'\n') {
            let start = newline + 1;
            if window[start..].starts_with(SQUASHFS_MAGIC) {
                return Some((ImageKind::Squashfs, start as u64));
            }
        }
    }

    if prefix.starts_with(LAUNCH_HEADER) {
        return header_offset(prefix).map(|offset| (ImageKind::Ext, offset));
    }

    let is_img = path
        .extension()
        .map(|extension| extension == "img")
        .unwrap_or(false);

    is_img.then_some((ImageKind::Ext, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_bytes(header: &[u8], body: &[u8]) -> Vec<u8> {
        let mut bytes = header.to_vec();
        bytes.extend_from_slice(body);
        bytes.resize(PROBE_LEN, 0);
        bytes
    }

    #[test]
    fn test_ext_offset_recovers_header() {
        let bytes = image_bytes(LAUNCH_HEADER, &[0x53, 0xef]);
        let (kind, offset) = classify(&bytes, Path::new("/tmp/demo.sif")).expect("ext image");

        assert_eq!(kind, ImageKind::Ext);
        assert_eq!(offset as usize, LAUNCH_HEADER.len());
        assert_eq!(&bytes[..offset as usize], LAUNCH_HEADER);
    }

    #[test]
    fn test_squashfs_at_zero_and_after_header() {
        let bare = image_bytes(SQUASHFS_MAGIC, &[]);
        assert_eq!(classify(&bare, Path::new("x")), Some((ImageKind::Squashfs, 0)));

        let wrapped = image_bytes(LAUNCH_HEADER, SQUASHFS_MAGIC);
        assert_eq!(
            classify(&wrapped, Path::new("x")),
            Some((ImageKind::Squashfs, LAUNCH_HEADER.len() as u64))
        );
    }

    #[test]
    fn test_headerless_img_suffix_is_ext_at_zero() {
        let bytes = image_bytes(&[], &[]);
        assert_eq!(classify(&bytes, Path::new("/tmp/plain.img")), Some((ImageKind::Ext, 0)));
        assert_eq!(classify(&bytes, Path::new("/tmp/plain.bin")), None);
    }

    #[test]
    fn test_header_newline_must_be_early() {
        let mut long = b"#!".to_vec();
        long.extend(std::iter::repeat_n(b'a', 100));
        long.push(b'\n');
        assert_eq!(header_offset(&long), None);
        assert_eq!(header_offset(b"#!/bin/x\n"), Some(9));
        assert_eq!(header_offset(b"hsqs"), None);
    }
}
