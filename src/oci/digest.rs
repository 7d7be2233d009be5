use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub const SHA256_PREFIX: &str = "sha256:";

const HASH_BUFFER_SIZE: usize = 256 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn prefixed_sha256_digest(bytes: &[u8]) -> String {
    format!("{SHA256_PREFIX}{}", sha256_hex(bytes))
}

pub fn prefixed(hex_digest: &str) -> String {
    format!("{SHA256_PREFIX}{hex_digest}")
}

pub fn digest_hex_component(digest: &str) -> Option<&str> {
    digest.strip_prefix(SHA256_PREFIX)
}

pub fn is_valid_sha256_digest(digest: &str) -> bool {
    digest_hex_component(digest)
        .map(is_valid_sha256_hex)
        .unwrap_or(false)
}

pub fn is_valid_sha256_hex(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

/// Hashes everything `reader` yields, returning `(hex digest, byte count)`.
pub fn sha256_reader(mut reader: impl Read) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    sha256_reader(BufReader::with_capacity(HASH_BUFFER_SIZE, file))
        .with_context(|| format!("Failed to hash {}", path.display()))
}
