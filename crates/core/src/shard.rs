//! Block-range shard arithmetic and object naming.
//!
//! Shards are closed block ranges `[base, base + shard_size - 1]` with
//! `base % shard_size == 0` (the genesis shard may start at 1). The object
//! name is the zero-padded base — it doubles as the ordering key in store
//! listings, so the padding width is part of the contract.

use crate::error::{SearchError, SearchResult};

/// Width of the zero-padded base in shard object names.
const SHARD_NAME_DIGITS: usize = 10;

/// Suffix of finalized shard objects. Partial uploads carry an extra
/// `.tmp` and must never appear in listings.
pub const SHARD_SUFFIX: &str = ".avro";

/// Pure shard-range arithmetic for one fixed `shard_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardModel {
    shard_size: u64,
}

impl ShardModel {
    pub fn new(shard_size: u64) -> SearchResult<Self> {
        if shard_size == 0 {
            return Err(SearchError::invalid_argument("shard size must be non-zero"));
        }
        Ok(Self { shard_size })
    }

    pub fn shard_size(&self) -> u64 {
        self.shard_size
    }

    /// Largest aligned base `<= block_num`.
    pub fn align(&self, block_num: u64) -> u64 {
        block_num - (block_num % self.shard_size)
    }

    /// Whether `base` is a valid shard base (aligned, or the genesis 1).
    pub fn is_valid_base(&self, base: u64) -> bool {
        base == 1 || base % self.shard_size == 0
    }

    /// Inclusive end block of the shard starting at `base`. The genesis
    /// shard `base == 1` ends where the first aligned shard begins.
    pub fn end_of(&self, base: u64) -> u64 {
        if base == 1 {
            self.shard_size - 1
        } else {
            self.align(base) + self.shard_size - 1
        }
    }

    /// Store prefix under which this tier's shards live.
    pub fn store_prefix(&self) -> String {
        format!("bigquery-shards-{}/", self.shard_size)
    }

    /// Object name for the shard starting at `base`, e.g. `0000005000.avro`.
    pub fn shard_name(&self, base: u64) -> String {
        format!("{:0width$}{}", base, SHARD_SUFFIX, width = SHARD_NAME_DIGITS)
    }

    /// Parse a listing entry back into a shard base.
    ///
    /// Returns `None` for anything that is not exactly ten digits followed
    /// by the shard suffix — partial uploads, foreign files, and nested
    /// paths are all skipped by callers.
    pub fn parse_shard_name(name: &str) -> Option<u64> {
        let file = name.rsplit('/').next()?;
        let digits = file.strip_suffix(SHARD_SUFFIX)?;
        if digits.len() != SHARD_NAME_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Scan a lexicographically-sorted remote listing and return the base
    /// the indexer should resume from: the highest contiguous base after
    /// `start`, stopping at the first gap wider than one shard.
    pub fn next_base_after(&self, start: u64, remote: &[String]) -> u64 {
        let mut next = start;
        let mut skipped = 0u64;

        for name in remote {
            let Some(file_base) = Self::parse_shard_name(name) else {
                tracing::debug!(name, "skipping non-shard object in remote listing");
                continue;
            };

            if file_base <= start {
                skipped += 1;
                continue;
            }

            if file_base > next + self.shard_size {
                tracing::info!(
                    file_base,
                    expected = next + self.shard_size,
                    "found a hole to fill, resuming before it"
                );
                break;
            }
            next = file_base;
        }

        if skipped > 0 {
            tracing::debug!(skipped, start, "ignored shard objects at or before start");
        }
        self.align(next)
    }

    /// Resolve a possibly-relative configured start block.
    ///
    /// Non-negative values must already sit on a shard boundary; negative
    /// values are an offset from the highest irreversible block published
    /// in the mesh, aligned down.
    pub fn resolve_start_block(&self, start_block: i64, irr_block_num: u64) -> SearchResult<u64> {
        if start_block >= 0 {
            let start = start_block as u64;
            if start % self.shard_size != 0 {
                return Err(SearchError::invalid_argument(format!(
                    "start block {start} misaligned with shard size {}",
                    self.shard_size
                )));
            }
            return Ok(start);
        }

        let absolute = irr_block_num as i64 + start_block;
        if absolute < 0 {
            return Err(SearchError::invalid_argument(format!(
                "relative start block {start_block} is too large, resolves below zero \
                 (irreversible block {irr_block_num})"
            )));
        }
        Ok(self.align(absolute as u64))
    }
}
