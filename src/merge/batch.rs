//! Source batching.
//!
//! Sources are merged in groups of at most [`MAX_BATCH_SIZE`]. The cap
//! bounds how many databases are attached to the target at once and how
//! many writers contend for its lock.

use std::path::{Path, PathBuf};

/// Ceiling on simultaneously attached sources.
pub const MAX_BATCH_SIZE: usize = 10;

/// Configuration for source batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum number of sources in a group
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: MAX_BATCH_SIZE,
        }
    }
}

impl BatchConfig {
    /// Create a BatchConfig from a configured size, clamped to `1..=MAX_BATCH_SIZE`.
    pub fn from_config(batch_size: usize) -> Self {
        Self {
            max_batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }
}

/// A source path and its position in the full, unbatched input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub index: usize,
    pub path: PathBuf,
}

impl SourceEntry {
    /// Attach alias, unique across the whole run.
    pub fn alias(&self) -> String {
        source_alias(self.index)
    }
}

/// Alias for the source at `index` of the flat input list.
pub fn source_alias(index: usize) -> String {
    format!("src{index}")
}

/// An ordered group of sources merged together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeBatch {
    entries: Vec<SourceEntry>,
}

impl MergeBatch {
    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.path.as_path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Split `sources` into ordered groups of at most `config.max_batch_size`.
///
/// Order is preserved across and within groups; only the last group may be
/// short.
pub fn batch_sources<P: AsRef<Path>>(sources: &[P], config: BatchConfig) -> Vec<MergeBatch> {
    let size = config.max_batch_size.max(1);
    let entries: Vec<SourceEntry> = sources
        .iter()
        .enumerate()
        .map(|(index, path)| SourceEntry {
            index,
            path: path.as_ref().to_path_buf(),
        })
        .collect();

    entries
        .chunks(size)
        .map(|chunk| MergeBatch {
            entries: chunk.to_vec(),
        })
        .collect()
}
