//! An opened on-disk shard.

use chainsift_core::{ParsedQuery, SearchError, SearchMatch, SearchResult};

use crate::artifact::decode_shard;
use crate::single::SingleIndex;

/// A shard loaded into memory, ready to serve queries.
///
/// `start_block..=end_block` is the *potential* interval of the shard: it
/// is derived from the base and shard size, never shrunk when trailing
/// blocks happen to be empty.
#[derive(Debug)]
pub struct ShardIndex {
    start_block: u64,
    end_block: u64,
    blocks: Vec<SingleIndex>,
}

impl ShardIndex {
    /// Decode an artifact downloaded for the shard starting at `base`.
    ///
    /// Every contained block must fall inside the shard interval and be in
    /// ascending order, else the artifact is corrupt.
    pub fn open(base: u64, shard_size: u64, artifact: &[u8]) -> SearchResult<Self> {
        let start_block = base;
        // The genesis shard starts at 1 and ends where the first aligned
        // shard begins.
        let end_block = if base == 1 {
            shard_size - 1
        } else {
            base + shard_size - 1
        };

        let blocks = decode_shard(artifact).map_err(|err| {
            SearchError::internal(format!("decoding shard {base}: {err}"))
        })?;

        let mut previous = None;
        for block in &blocks {
            let num = block.block_num();
            if num < start_block || num > end_block {
                return Err(SearchError::internal(format!(
                    "shard {base} contains out-of-range block {num}"
                )));
            }
            if previous.is_some_and(|p| p >= num) {
                return Err(SearchError::internal(format!(
                    "shard {base} blocks are not strictly ascending around {num}"
                )));
            }
            previous = Some(num);
        }

        Ok(Self {
            start_block,
            end_block,
            blocks,
        })
    }

    /// Build an in-memory shard directly, for the live tier and tests.
    pub fn from_indexes(start_block: u64, end_block: u64, blocks: Vec<SingleIndex>) -> Self {
        Self {
            start_block,
            end_block,
            blocks,
        }
    }

    pub fn start_block(&self) -> u64 {
        self.start_block
    }

    pub fn end_block(&self) -> u64 {
        self.end_block
    }

    pub fn contains_block_num(&self, block_num: u64) -> bool {
        (self.start_block..=self.end_block).contains(&block_num)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Highest block actually present, if any.
    pub fn last_block(&self) -> Option<&SingleIndex> {
        self.blocks.last()
    }

    /// Run `query` over every block in `[low, high]`, in the requested
    /// direction. Intra-block match order follows the direction too.
    pub fn run_query(
        &self,
        descending: bool,
        low: u64,
        high: u64,
        query: &ParsedQuery,
    ) -> Vec<SearchMatch> {
        let mut out = Vec::new();
        let in_range = |idx: &&SingleIndex| {
            let num = idx.block_num();
            num >= low && num <= high
        };

        if descending {
            for index in self.blocks.iter().rev().filter(in_range) {
                let mut matches = index.run_query(query);
                matches.reverse();
                out.extend(matches);
            }
        } else {
            for index in self.blocks.iter().filter(in_range) {
                out.extend(index.run_query(query));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::encode_shard;
    use chainsift_core::Document;

    fn single(num: u64, terms: &[(&str, u32)]) -> SingleIndex {
        let docs = terms
            .iter()
            .map(|(term, idx)| {
                Document::new(format!("{idx:016x}"), *idx).with_term("account", *term)
            })
            .collect();
        SingleIndex::build(num, format!("id{num}"), format!("id{}", num - 1), num - 1, docs)
    }

    fn shard() -> ShardIndex {
        let indexes = vec![
            single(5000, &[("alice", 0), ("bob", 1)]),
            single(5001, &[]),
            single(5002, &[("alice", 0)]),
        ];
        let bytes = encode_shard(&indexes).unwrap();
        ShardIndex::open(5000, 5000, &bytes).unwrap()
    }

    #[test]
    fn potential_interval_is_not_shrunk() {
        let s = shard();
        assert_eq!(s.start_block(), 5000);
        assert_eq!(s.end_block(), 9999);
        assert!(s.contains_block_num(9999));
        assert_eq!(s.block_count(), 3);
        assert_eq!(s.last_block().unwrap().block_num(), 5002);
    }

    #[test]
    fn query_ascending_and_descending() {
        let s = shard();
        let q = ParsedQuery::parse("account:alice").unwrap();

        let asc: Vec<u64> = s
            .run_query(false, 0, u64::MAX, &q)
            .iter()
            .map(|m| m.block_num)
            .collect();
        assert_eq!(asc, vec![5000, 5002]);

        let desc: Vec<u64> = s
            .run_query(true, 0, u64::MAX, &q)
            .iter()
            .map(|m| m.block_num)
            .collect();
        assert_eq!(desc, vec![5002, 5000]);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let s = shard();
        let q = ParsedQuery::parse("account:alice").unwrap();
        let hits: Vec<u64> = s
            .run_query(false, 5001, 5002, &q)
            .iter()
            .map(|m| m.block_num)
            .collect();
        assert_eq!(hits, vec![5002]);
    }

    #[test]
    fn out_of_range_block_is_corrupt() {
        let indexes = vec![single(4000, &[])];
        let bytes = encode_shard(&indexes).unwrap();
        assert!(ShardIndex::open(5000, 5000, &bytes).is_err());
    }

    #[test]
    fn descending_reverses_intra_block_order() {
        let indexes = vec![single(7000, &[("carol", 0), ("carol", 1), ("carol", 2)])];
        let bytes = encode_shard(&indexes).unwrap();
        let s = ShardIndex::open(7000, 5000, &bytes).unwrap();
        let q = ParsedQuery::parse("account:carol").unwrap();

        let desc: Vec<u32> = s
            .run_query(true, 0, u64::MAX, &q)
            .iter()
            .map(|m| m.trx_index)
            .collect();
        assert_eq!(desc, vec![2, 1, 0]);
    }
}
