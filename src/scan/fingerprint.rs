//! File fingerprints

use crate::storage::{Fingerprint, Tick};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// What goes into a fingerprint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    /// Size and modification time only
    #[default]
    SizeMtime,
    /// Size, modification time and a CRC32 of the content
    SizeMtimeCrc32,
}

impl FromStr for FingerprintMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "size_mtime" | "size+mtime" => Ok(FingerprintMode::SizeMtime),
            "size_mtime_crc32" | "size+mtime+crc32" | "crc32" => Ok(FingerprintMode::SizeMtimeCrc32),
            _ => Err(format!("Unknown fingerprint mode: {}", s)),
        }
    }
}

/// Compute the fingerprint of a file
pub fn fingerprint(path: &Path, mode: FingerprintMode) -> std::io::Result<Fingerprint> {
    let meta = std::fs::metadata(path)?;

    let hash = match mode {
        FingerprintMode::SizeMtime => None,
        FingerprintMode::SizeMtimeCrc32 => Some(crc32_file(path)?),
    };

    Ok(Fingerprint {
        size: meta.len(),
        mtime: system_time_to_tick(meta.modified()?),
        hash,
    })
}

/// Check size and modification time against a stored fingerprint
///
/// The content hash is not recomputed; this runs before every decode.
pub fn is_unchanged(path: &Path, stored: &Fingerprint) -> std::io::Result<bool> {
    let meta = std::fs::metadata(path)?;
    Ok(meta.len() == stored.size && system_time_to_tick(meta.modified()?) == stored.mtime)
}

fn crc32_file(path: &Path) -> std::io::Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

fn system_time_to_tick(time: SystemTime) -> Tick {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos().min(Tick::MAX as u128) as Tick,
        Err(e) => -(e.duration().as_nanos().min(Tick::MAX as u128) as Tick),
    }
}
