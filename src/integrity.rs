//! Hashing and canonical JSON.
//!
//! Every hash preimage in the repository is canonical JSON: keys sorted
//! ascending, UTF-8, no insignificant whitespace, shortest round-tripping
//! numbers, lowercase booleans and null. Two implementations must agree
//! bit-for-bit, so all hashing funnels through [`canonical_json_bytes`].
//!
//! The payload root hash is a Merkle-style digest over a sorted file walk:
//! for each regular file, `H(path) || H(content)` feeds an outer SHA-256 in
//! NFC-normalized path order (path bytes are normalized before both the
//! sort and the hash). Directory entries contribute nothing — their
//! existence is implied by file paths.

use std::fs::File;
use std::io::Read as _;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest as _, Sha256};
use unicode_normalization::UnicodeNormalization as _;

use crate::error::Result;
use crate::fsutil;

/// Lowercase hex SHA-256 of raw bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Serialize `value` to canonical JSON bytes.
///
/// Routing through `serde_json::Value` sorts object keys (the default map is
/// ordered) and `to_vec` emits no insignificant whitespace; numbers use
/// serde_json's shortest round-tripping form.
///
/// # Errors
/// Returns an error if the value cannot be represented as JSON.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> std::result::Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_vec(&value)
}

/// SHA-256 over the canonical JSON of `value`.
///
/// # Errors
/// Returns an error if the value cannot be represented as JSON.
pub fn canonical_json_sha256<T: Serialize>(value: &T) -> std::result::Result<String, serde_json::Error> {
    Ok(sha256_hex(&canonical_json_bytes(value)?))
}

/// SHA-256 over a JSON object with the named top-level fields removed.
///
/// This is the common shape for self-referential checksums: the stored hash
/// (and any mutable field) is excluded from its own preimage.
///
/// # Errors
/// Returns an error if the value cannot be represented as JSON.
pub fn checksum_excluding<T: Serialize>(
    value: &T,
    exclude: &[&str],
) -> std::result::Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(value)?;
    if let serde_json::Value::Object(map) = &mut value {
        for field in exclude {
            map.remove(*field);
        }
    }
    Ok(sha256_hex(&serde_json::to_vec(&value)?))
}

// ---------------------------------------------------------------------------
// Payload root hash
// ---------------------------------------------------------------------------

/// Compute the payload root hash of a directory tree.
///
/// Walk all regular files, NFC-normalize each `/`-separated relative path,
/// sort by the normalized bytes, then for each file feed the hash of those
/// normalized path bytes followed by `H(file_content_bytes)` into an outer
/// SHA-256. Two trees whose names differ only in Unicode normalization form
/// therefore hash identically. Symlinks, special files, and non-UTF-8 paths
/// are refused.
///
/// # Errors
/// Any I/O failure, or `E_NAME_INVALID` on an unsupported payload entry.
pub fn payload_root_hash(root: &Path) -> Result<String> {
    payload_root_hash_excluding(root, &[])
}

/// [`payload_root_hash`] with named top-level entries skipped.
///
/// Published snapshot directories carry the READY marker next to user data;
/// verification excludes it so the recomputed hash matches the one taken
/// over the staging tree.
///
/// # Errors
/// As [`payload_root_hash`].
pub fn payload_root_hash_excluding(root: &Path, exclude_top_level: &[&str]) -> Result<String> {
    // Pair each on-disk path with its NFC form: the normalized bytes are the
    // sort key and the path-hash input, the raw name is what gets read.
    let mut files: Vec<(String, String)> = fsutil::walk_regular_files(root)?
        .into_iter()
        .filter(|rel| !exclude_top_level.contains(&rel.as_str()))
        .map(|rel| (rel.nfc().collect::<String>(), rel))
        .collect();
    files.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut outer = Sha256::new();
    for (nfc_rel, raw_rel) in &files {
        outer.update(Sha256::digest(nfc_rel.as_bytes()));
        outer.update(hash_file(&root.join(raw_rel))?);
    }
    Ok(hex(&outer.finalize()))
}

/// Streaming SHA-256 of one file's content.
fn hash_file(path: &Path) -> Result<[u8; 32]> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Lowercase hex SHA-256 of one file's content (for snapshot diffs).
///
/// # Errors
/// Any I/O failure.
pub fn file_sha256_hex(path: &Path) -> Result<String> {
    Ok(hex(&hash_file(path)?))
}

/// Validate that a string looks like a lowercase hex SHA-256 digest.
#[must_use]
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64
        && s.chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
