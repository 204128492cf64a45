//! Server configuration.
//!
//! Loaded with `figment` (env + TOML, layered) when the `figment_config`
//! feature is enabled, falling back to `Config::default()` otherwise, so
//! the crate still builds and tests run without pulling in a config
//! backend.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the metadata device (superblock, bitmaps, journal, B-tree).
    pub metadata_path: PathBuf,
    /// Path to the snapshot/exception store device. `None` means the
    /// "combined" layout: snapdata shares the metadata space
    /// (`snapdata.chunks == 0`).
    pub snapdata_path: Option<PathBuf>,
    /// Path to the origin device clients read/write through.
    pub origin_path: PathBuf,

    /// `1 << chunk_sector_bits` sectors per chunk.
    pub chunk_sector_bits: u32,
    /// Number of chunks reserved for the journal.
    pub journal_chunks: u32,
    /// Target size of the buffered block cache, in bytes.
    pub cache_budget_bytes: usize,
    /// `1 << snaplock_hash_bits` buckets in the read-lock arbiter's hash
    /// table.
    pub snaplock_hash_bits: u32,
    /// Verify bitmap free-chunk counts against the bitmap's popcount after
    /// every commit. Expensive; defaults off.
    pub self_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            metadata_path: PathBuf::from("/dev/null"),
            snapdata_path: None,
            origin_path: PathBuf::from("/dev/null"),
            chunk_sector_bits: 3, // 4 KiB chunks
            journal_chunks: 256,
            cache_budget_bytes: 32 * 1024 * 1024,
            snaplock_hash_bits: 10,
            self_check: false,
        }
    }
}

#[cfg(feature = "figment_config")]
impl Config {
    /// Loads configuration layered from defaults, an optional
    /// `snapcore.toml`, then environment variables prefixed `SNAPCORE_`.
    pub fn load(toml_path: Option<&std::path::Path>) -> Result<Config> {
        use figment::{
            providers::{Env, Format, Serialized, Toml},
            Figment,
        };

        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = toml_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("SNAPCORE_"));

        figment
            .extract()
            .map_err(|e| ErrorKind::Protocol(format!("invalid configuration: {}", e)).into())
    }
}
