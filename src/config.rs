//! Compression configuration.
//!
//! Everything is passed explicitly; the crate holds no global state. The
//! only process-wide lookup is the external 7-Zip discovery inside the
//! codec module.

use crate::codec::Backend;

pub const DEFAULT_TARGET_BLOCK_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_MAX_TEMPLATES: usize = 65_535;
pub const DEFAULT_SAMPLE_ROWS: usize = 256;
pub const DEFAULT_DICT_SIZE: u32 = 128 * 1024 * 1024;

/// How values inside a column stream are delimited on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColSep {
    /// Per block: 0x1F separators unless a variable field contains 0x1F,
    /// then varint length prefixes.
    Auto,
    /// Always 0x1F unit separators.
    Unit,
    /// Always varint length prefixes.
    Lengths,
}

/// Binary Guard thresholds. The container format does not depend on them.
#[derive(Debug, Clone, Copy)]
pub struct GuardTunables {
    /// Maximum tolerated fraction of non-printable bytes in the head sample.
    pub max_nonprintable_ratio: f64,
    /// Maximum tolerated NUL bytes in the head sample.
    pub max_nul_bytes: usize,
    /// Minimum LF-terminated rows the head sample must contain.
    pub min_sample_rows: usize,
}

impl Default for GuardTunables {
    fn default() -> Self {
        Self {
            max_nonprintable_ratio: 0.15,
            max_nul_bytes: 1,
            min_sample_rows: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Uncompressed bytes per block (solid mode), and the row-sizing budget
    /// for indexed mode.
    pub target_block_bytes: usize,
    /// Registry capacity; hitting it seals the block early.
    pub max_templates: usize,
    /// Rows sampled from the block head for strategy election.
    pub sample_rows: usize,
    /// LZMA2 dictionary size handed to the coder.
    pub dict_size: u32,
    /// Coder worker lanes. 1 = fully serial; 0 = one per CPU.
    pub threads: usize,
    /// Append a footer index for row-range random access.
    pub indexed: bool,
    pub colsep: ColSep,
    pub backend: Backend,
    pub guard: GuardTunables,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_block_bytes: DEFAULT_TARGET_BLOCK_BYTES,
            max_templates: DEFAULT_MAX_TEMPLATES,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            dict_size: DEFAULT_DICT_SIZE,
            threads: 1,
            indexed: false,
            colsep: ColSep::Auto,
            backend: Backend::NativeLzma2,
            guard: GuardTunables::default(),
        }
    }
}

impl Config {
    /// Effective worker-lane count.
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get().max(1)
        } else {
            self.threads
        }
    }
}
