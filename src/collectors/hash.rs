use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::Path;

/// SHA-256 of a file's contents, or None when unreadable or larger than `limit` bytes
pub fn hash_file(path: &Path, limit: u64) -> Option<String> {
    let meta = std::fs::metadata(path).ok()?;
    if !meta.is_file() || meta.len() >= limit {
        return None;
    }
    let mut file = File::open(path).ok()?;
    let mut h = Sha256::new();
    std::io::copy(&mut file, &mut h).ok()?;
    Some(format!("{:x}", h.finalize()))
}
