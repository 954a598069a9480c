//! Checks an image against the SHA-384 digest carried in its trailing
//! clearsigned block. Checking the PGP signature itself is left to external
//! tooling.

use crate::error::Error;
use anyhow::{Context, Result, bail};
use memmap2::Mmap;
use sha2::{Digest, Sha384};
use std::fs::File;
use tracing::{debug, info};

pub const SIGNATURE_BEGIN: &[u8] = b"-----BEGIN PGP SIGNED MESSAGE-----";
pub const HASH_PREFIX: &[u8] = b"SIFHASH:";

const DIGEST_LEN: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationBlock {
    /// Bytes covered by the digest, from the start of the file.
    pub data_len: usize,
    pub digest: [u8; DIGEST_LEN],
}

/// Finds the last clearsigned block and the digest it carries.
pub fn locate(bytes: &[u8]) -> Result<VerificationBlock> {
    let start = rfind(bytes, SIGNATURE_BEGIN)
        .ok_or_else(|| Error::Policy("image carries no verification block".into()))?;

    let block = &bytes[start..];
    let hash_at = find(block, HASH_PREFIX)
        .ok_or_else(|| Error::Policy("verification block has no SIFHASH entry".into()))?;

    let hex = block[hash_at + HASH_PREFIX.len()..]
        .iter()
        .copied()
        .skip_while(u8::is_ascii_whitespace)
        .take_while(u8::is_ascii_hexdigit)
        .collect::<Vec<_>>();

    Ok(VerificationBlock {
        data_len: start,
        digest: decode_digest(&hex)?,
    })
}

/// Maps the file, re-hashes the covered region and compares.
pub fn verify(file: &File) -> Result<()> {
    let len = file.metadata().context("Failed to stat image")?.len();
    if len == 0 {
        bail!(Error::Policy("cannot verify an empty image".into()));
    }

    // SAFETY: the mapping is read-only and dropped before returning; the image
    // is not expected to change while the runtime holds it open.
    let map = unsafe { Mmap::map(file) }.context("Failed to map image")?;
    let block = locate(&map)?;
    debug!(data_len = block.data_len, "verification block found");

    let computed = Sha384::digest(&map[..block.data_len]);
    if computed.as_slice() != block.digest.as_slice() {
        bail!(Error::Policy(format!(
            "image digest mismatch: computed {}, signed {}",
            to_hex(computed.as_slice()),
            to_hex(&block.digest)
        )));
    }

    info!("image digest verified");
    Ok(())
}

fn decode_digest(hex: &[u8]) -> Result<[u8; DIGEST_LEN]> {
    if hex.len() != DIGEST_LEN * 2 {
        bail!(Error::Policy(format!(
            "SIFHASH must be {} hex digits, got {}",
            DIGEST_LEN * 2,
            hex.len()
        )));
    }

    let mut digest = [0u8; DIGEST_LEN];
    for (byte, pair) in digest.iter_mut().zip(hex.chunks_exact(2)) {
        *byte = (nibble(pair[0]) << 4) | nibble(pair[1]);
    }
    Ok(digest)
}

fn nibble(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => 0,
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn signed(data: &[u8], digest_hex: &str) -> Vec<u8> {
        let mut bytes = data.to_vec();
        bytes.extend_from_slice(SIGNATURE_BEGIN);
        bytes.extend_from_slice(b"\nHash: SHA384\n\nSIFHASH:\n");
        bytes.extend_from_slice(digest_hex.as_bytes());
        bytes.extend_from_slice(b"\n-----BEGIN PGP SIGNATURE-----\n...\n-----END PGP SIGNATURE-----\n");
        bytes
    }

    #[test]
    fn test_matching_digest_verifies() -> Result<()> {
        let data = b"filesystem bytes".repeat(100);
        let digest = to_hex(Sha384::digest(&data).as_slice());

        let mut file = tempfile::tempfile()?;
        file.write_all(&signed(&data, &digest))?;

        verify(&file)
    }

    #[test]
    fn test_tampered_data_is_rejected() -> Result<()> {
        let data = b"filesystem bytes".repeat(100);
        let digest = to_hex(Sha384::digest(&data).as_slice());

        let mut tampered = signed(&data, &digest);
        tampered[3] ^= 0xff;

        let mut file = tempfile::tempfile()?;
        file.write_all(&tampered)?;

        let error = verify(&file).unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Policy(_))));
        Ok(())
    }

    #[test]
    fn test_locate_reports_covered_length() -> Result<()> {
        let data = b"abc";
        let digest = "ab".repeat(DIGEST_LEN);
        let block = locate(&signed(data, &digest))?;
        assert_eq!(block.data_len, data.len());
        assert_eq!(block.digest, [0xab; DIGEST_LEN]);
        Ok(())
    }

    #[test]
    fn test_unsigned_and_short_hashes() {
        assert!(locate(b"plain image").is_err());
        assert!(locate(&signed(b"abc", "abcd")).is_err());
    }
}
