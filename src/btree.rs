// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A block-addressed B+-tree, built bottom-up once and read-only thereafter.
//!
//! Every block is `block_size` bytes and starts with an 8-byte header
//! (`tag`, entry count or payload length) followed by an 8-byte link:
//! the right-sibling for leaves, the chain successor for data blocks,
//! the sentinel for everything else. Node bodies hold `(address, key)`
//! pairs; internal pairs point at children with their minimum reachable
//! key, leaf pairs point at the data chain storing the key's value.
//! Address 0 is the meta block recording the root.

use crate::storage::BlockStorage;
use crate::utils::{read_u64_at, write_u64_at};
use crate::{Address, BlockSize, Error, SalaryKey};
use log::debug;

/// Sentinel address: end of a chain, absent root, no sibling.
pub const EMPTY: Address = Address::MAX;

const META_TAG: u8 = 1;
const NODE_TAG: u8 = 2;
const LEAF_TAG: u8 = 3;
const DATA_TAG: u8 = 4;

const HEADER_SIZE: usize = 8;
const LINK_SIZE: usize = 8;
const BODY_OFFSET: usize = HEADER_SIZE + LINK_SIZE;
const PAIR_SIZE: usize = 16;

/// The node fanout a given block size supports.
pub fn fanout(block_size: BlockSize) -> usize {
    (block_size - BODY_OFFSET) / PAIR_SIZE
}

fn data_capacity(block_size: BlockSize) -> usize {
    block_size - BODY_OFFSET
}

fn check_block_size(block_size: BlockSize) -> Result<(), Error> {
    if fanout(block_size) < 2 || data_capacity(block_size) > u16::MAX as usize {
        return Err(Error::Configuration(format!(
            "tree block size {block_size} is unusable"
        )));
    }
    Ok(())
}

/// A persistent B+-tree over `(key, value)` pairs.
#[derive(Debug)]
pub struct Tree<S: BlockStorage> {
    storage: S,
    root: Address,
    fanout: usize,
    block_size: BlockSize,
}

impl<S: BlockStorage> Tree<S> {
    /// Builds a tree over pairs already sorted by key, in a single bottom-up
    /// pass over an empty storage. Pairs sharing a key are merged into one
    /// data chain, in input order.
    pub fn build(mut storage: S, pairs: &[(SalaryKey, Vec<u8>)]) -> Result<Self, Error> {
        let block_size = storage.block_size();
        check_block_size(block_size)?;
        if storage.capacity() != 0 {
            return Err(Error::Configuration(
                "tree build requires empty storage".into(),
            ));
        }

        let meta = storage.new_address()?;
        debug_assert_eq!(meta, 0);

        let mut tree = Self {
            storage,
            root: EMPTY,
            fanout: fanout(block_size),
            block_size,
        };

        // Group duplicate keys; each key owns exactly one data chain.
        let mut grouped: Vec<(SalaryKey, Vec<u8>)> = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match grouped.last_mut() {
                Some((last, merged)) if *last == *key => merged.extend_from_slice(value),
                Some((last, _)) if *last > *key => {
                    return Err(Error::Configuration(
                        "tree build input is not sorted by key".into(),
                    ));
                }
                _ => grouped.push((*key, value.clone())),
            }
        }

        // Data layer: one chain per key.
        let mut leaf_entries: Vec<(Address, SalaryKey)> = Vec::with_capacity(grouped.len());
        for (key, value) in &grouped {
            let head = tree.create_data_chain(value)?;
            leaf_entries.push((head, *key));
        }

        // Leaf layer, linked left to right.
        let leaf_chunks: Vec<&[(Address, SalaryKey)]> =
            leaf_entries.chunks(tree.fanout).collect();
        let mut leaf_addresses = Vec::with_capacity(leaf_chunks.len());
        for _ in 0..leaf_chunks.len() {
            leaf_addresses.push(tree.storage.new_address()?);
        }
        let mut layer: Vec<(Address, SalaryKey)> = Vec::with_capacity(leaf_chunks.len());
        for (i, chunk) in leaf_chunks.iter().enumerate() {
            let next = leaf_addresses.get(i + 1).copied().unwrap_or(EMPTY);
            tree.write_node(leaf_addresses[i], LEAF_TAG, next, chunk)?;
            layer.push((leaf_addresses[i], chunk[0].1));
        }

        // Internal layers until a single node remains.
        while layer.len() > 1 {
            layer = tree.push_layer(&layer)?;
        }
        tree.root = layer.first().map(|(address, _)| *address).unwrap_or(EMPTY);

        let mut meta_block = vec![0u8; block_size];
        meta_block[0] = META_TAG;
        write_u64_at(&mut meta_block, HEADER_SIZE, EMPTY);
        write_u64_at(&mut meta_block, BODY_OFFSET, tree.root);
        tree.storage.set(meta, &meta_block)?;
        tree.storage.sync()?;

        debug!(
            "Tree::build -- {} keys, fanout {}, root at {}",
            grouped.len(),
            tree.fanout,
            tree.root
        );
        Ok(tree)
    }

    /// Reopens a tree previously built over the same storage.
    pub fn open(mut storage: S) -> Result<Self, Error> {
        let block_size = storage.block_size();
        check_block_size(block_size)?;

        let meta = storage.get(0)?;
        if meta[0] != META_TAG {
            return Err(Error::Decrypt);
        }
        let root = read_u64_at(&meta, BODY_OFFSET);
        Ok(Self {
            storage,
            root,
            fanout: fanout(block_size),
            block_size,
        })
    }

    /// Returns the value of the greatest key `<= key`, if any.
    pub fn search(&mut self, key: SalaryKey) -> Result<Option<Vec<u8>>, Error> {
        if self.root == EMPTY {
            return Ok(None);
        }
        let (_, _, pairs) = self.descend_to_leaf(key)?;
        let hit = pairs.iter().rev().find(|(_, k)| *k <= key);
        match hit {
            Some((address, _)) => Ok(Some(self.read_data_chain(*address)?)),
            None => Ok(None),
        }
    }

    /// Returns the values of every key in `[lo, hi]`, walking leaf links
    /// rightward from the leaf containing `lo`. Both ends inclusive; an
    /// empty result is valid, and `lo > hi` short-circuits to it.
    pub fn search_range(
        &mut self,
        lo: SalaryKey,
        hi: SalaryKey,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let mut values = Vec::new();
        if lo > hi || self.root == EMPTY {
            return Ok(values);
        }

        let (_, mut next, mut pairs) = self.descend_to_leaf(lo)?;
        loop {
            for (address, key) in &pairs {
                if *key < lo {
                    continue;
                }
                if *key > hi {
                    return Ok(values);
                }
                values.push(self.read_data_chain(*address)?);
            }
            if next == EMPTY {
                return Ok(values);
            }
            let (tag, leaf_next, leaf_pairs) = self.read_node(next)?;
            if tag != LEAF_TAG {
                return Err(Error::Decrypt);
            }
            next = leaf_next;
            pairs = leaf_pairs;
        }
    }

    /// Descends from the root following the greatest separator `<= key`
    /// (or the first child when `key` undershoots every separator).
    fn descend_to_leaf(
        &mut self,
        key: SalaryKey,
    ) -> Result<(Address, Address, Vec<(Address, SalaryKey)>), Error> {
        let mut address = self.root;
        loop {
            let (tag, next, pairs) = self.read_node(address)?;
            match tag {
                LEAF_TAG => return Ok((address, next, pairs)),
                NODE_TAG => {
                    let child = pairs
                        .iter()
                        .rev()
                        .find(|(_, separator)| *separator <= key)
                        .or_else(|| pairs.first())
                        .map(|(child, _)| *child)
                        .ok_or(Error::Decrypt)?;
                    address = child;
                }
                _ => return Err(Error::Decrypt),
            }
        }
    }

    /// Packs one layer of `(address, min key)` entries into parent nodes.
    fn push_layer(
        &mut self,
        layer: &[(Address, SalaryKey)],
    ) -> Result<Vec<(Address, SalaryKey)>, Error> {
        let mut parents = Vec::with_capacity(layer.len() / self.fanout + 1);
        for chunk in layer.chunks(self.fanout) {
            let address = self.storage.new_address()?;
            self.write_node(address, NODE_TAG, EMPTY, chunk)?;
            parents.push((address, chunk[0].1));
        }
        Ok(parents)
    }

    fn write_node(
        &mut self,
        address: Address,
        tag: u8,
        next: Address,
        pairs: &[(Address, SalaryKey)],
    ) -> Result<(), Error> {
        debug_assert!(!pairs.is_empty() && pairs.len() <= self.fanout);
        debug_assert!(pairs.windows(2).all(|w| w[0].1 < w[1].1));

        let mut block = vec![0u8; self.block_size];
        block[0] = tag;
        block[2..4].copy_from_slice(&(pairs.len() as u16).to_le_bytes());
        write_u64_at(&mut block, HEADER_SIZE, next);
        for (i, (child, key)) in pairs.iter().enumerate() {
            let offset = BODY_OFFSET + i * PAIR_SIZE;
            write_u64_at(&mut block, offset, *child);
            write_u64_at(&mut block, offset + 8, *key);
        }
        self.storage.set(address, &block)
    }

    pub(crate) fn read_node(
        &mut self,
        address: Address,
    ) -> Result<(u8, Address, Vec<(Address, SalaryKey)>), Error> {
        let block = self.storage.get(address)?;
        let tag = block[0];
        if tag != NODE_TAG && tag != LEAF_TAG {
            return Err(Error::Decrypt);
        }
        let count = u16::from_le_bytes([block[2], block[3]]) as usize;
        if count == 0 || count > self.fanout {
            return Err(Error::Decrypt);
        }
        let next = read_u64_at(&block, HEADER_SIZE);
        let mut pairs = Vec::with_capacity(count);
        for i in 0..count {
            let offset = BODY_OFFSET + i * PAIR_SIZE;
            pairs.push((read_u64_at(&block, offset), read_u64_at(&block, offset + 8)));
        }
        Ok((tag, next, pairs))
    }

    /// Writes `value` as a chain of data blocks and returns the head address.
    fn create_data_chain(&mut self, value: &[u8]) -> Result<Address, Error> {
        let capacity = data_capacity(self.block_size);
        let chunks: Vec<&[u8]> = if value.is_empty() {
            vec![&[]]
        } else {
            value.chunks(capacity).collect()
        };

        let mut addresses = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            addresses.push(self.storage.new_address()?);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let next = addresses.get(i + 1).copied().unwrap_or(EMPTY);
            let mut block = vec![0u8; self.block_size];
            block[0] = DATA_TAG;
            block[2..4].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
            write_u64_at(&mut block, HEADER_SIZE, next);
            block[BODY_OFFSET..BODY_OFFSET + chunk.len()].copy_from_slice(chunk);
            self.storage.set(addresses[i], &block)?;
        }
        Ok(addresses[0])
    }

    /// Reassembles a value by following its chain to the sentinel.
    pub(crate) fn read_data_chain(&mut self, head: Address) -> Result<Vec<u8>, Error> {
        let mut value = Vec::new();
        let mut address = head;
        while address != EMPTY {
            let block = self.storage.get(address)?;
            if block[0] != DATA_TAG {
                return Err(Error::Decrypt);
            }
            let length = u16::from_le_bytes([block[2], block[3]]) as usize;
            if length > data_capacity(self.block_size) {
                return Err(Error::Decrypt);
            }
            value.extend_from_slice(&block[BODY_OFFSET..BODY_OFFSET + length]);
            address = read_u64_at(&block, HEADER_SIZE);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, InMemoryStorage};
    use crate::test_utils::init_logger;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    const BLOCK_SIZE: BlockSize = 64;

    fn build_tree(pairs: &[(SalaryKey, Vec<u8>)]) -> Tree<InMemoryStorage> {
        Tree::build(InMemoryStorage::new(BLOCK_SIZE, 0), pairs).unwrap()
    }

    fn letters() -> Vec<(SalaryKey, Vec<u8>)> {
        vec![
            (1, b"a".to_vec()),
            (3, b"c".to_vec()),
            (5, b"e".to_vec()),
            (7, b"g".to_vec()),
            (9, b"i".to_vec()),
        ]
    }

    #[test]
    fn range_search_over_letters() {
        init_logger();
        let mut tree = build_tree(&letters());

        let mut values = tree.search_range(3, 7).unwrap();
        values.sort();
        assert_eq!(values, vec![b"c".to_vec(), b"e".to_vec(), b"g".to_vec()]);
    }

    #[test]
    fn point_search_takes_greatest_key_not_above() {
        init_logger();
        let mut tree = build_tree(&letters());

        assert_eq!(tree.search(5).unwrap(), Some(b"e".to_vec()));
        assert_eq!(tree.search(6).unwrap(), Some(b"e".to_vec()));
        assert_eq!(tree.search(100).unwrap(), Some(b"i".to_vec()));
        assert_eq!(tree.search(0).unwrap(), None);
    }

    #[test]
    fn boundary_ranges() {
        init_logger();
        let mut tree = build_tree(&letters());

        assert!(tree.search_range(6, 2).unwrap().is_empty());
        assert!(tree.search_range(4, 4).unwrap().is_empty());
        assert_eq!(tree.search_range(0, u64::MAX).unwrap().len(), 5);
        assert_eq!(tree.search_range(9, 9).unwrap(), vec![b"i".to_vec()]);
    }

    #[test]
    fn empty_tree_searches_cleanly() {
        init_logger();
        let mut tree = build_tree(&[]);
        assert_eq!(tree.search(7).unwrap(), None);
        assert!(tree.search_range(0, u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn duplicate_keys_merge_into_one_chain() {
        init_logger();
        let mut tree = build_tree(&[
            (2, 10u64.to_le_bytes().to_vec()),
            (2, 11u64.to_le_bytes().to_vec()),
            (4, 12u64.to_le_bytes().to_vec()),
        ]);

        let values = tree.search_range(2, 2).unwrap();
        assert_eq!(values.len(), 1);
        let ids: Vec<u64> = values[0]
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(ids, vec![10, 11]);
    }

    #[test]
    fn long_values_chain_across_blocks() {
        init_logger();
        let value: Vec<u8> = (0..200u16).map(|i| i as u8).collect();
        let mut tree = build_tree(&[(1, value.clone())]);
        assert_eq!(tree.search(1).unwrap(), Some(value));
    }

    #[test]
    fn unsorted_input_is_rejected() {
        init_logger();
        let result = Tree::build(
            InMemoryStorage::new(BLOCK_SIZE, 0),
            &[(5, vec![1]), (3, vec![2])],
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn matches_ground_truth_on_random_corpus() {
        init_logger();
        let mut rng = StdRng::seed_from_u64(0);

        let mut keys: Vec<u64> = (0..500).map(|_| rng.gen_range(0..10_000)).collect();
        keys.sort_unstable();
        keys.dedup();
        let pairs: Vec<(SalaryKey, Vec<u8>)> = keys
            .iter()
            .map(|&k| (k, format!("value-{k}").into_bytes()))
            .collect();
        let mut tree = build_tree(&pairs);

        for _ in 0..100 {
            let a = rng.gen_range(0..10_000u64);
            let b = rng.gen_range(0..10_000u64);
            let (lo, hi) = (a.min(b), a.max(b));

            let mut expected: Vec<Vec<u8>> = pairs
                .iter()
                .filter(|(k, _)| (lo..=hi).contains(k))
                .map(|(_, v)| v.clone())
                .collect();
            let mut actual = tree.search_range(lo, hi).unwrap();
            expected.sort();
            actual.sort();
            assert_eq!(expected, actual, "[{lo}, {hi}]");
        }
    }

    #[test]
    fn reopen_from_file_storage() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.bin");

        let storage = FileStorage::create(&path, BLOCK_SIZE, 0).unwrap();
        let mut tree = Tree::build(storage, &letters()).unwrap();
        assert_eq!(tree.search(3).unwrap(), Some(b"c".to_vec()));
        drop(tree);

        let storage = FileStorage::open(&path, BLOCK_SIZE).unwrap();
        let mut reopened = Tree::open(storage).unwrap();
        let mut values = reopened.search_range(1, 9).unwrap();
        values.sort();
        assert_eq!(values.len(), 5);
        assert_eq!(values[0], b"a".to_vec());
    }

    // Whitebox: the leaf layer is a left-to-right chain covering every key.
    #[test]
    fn leaf_links_cover_all_keys_in_order() {
        init_logger();
        let pairs: Vec<(SalaryKey, Vec<u8>)> =
            (0..50u64).map(|k| (k * 2, vec![k as u8])).collect();
        let mut tree = build_tree(&pairs);

        let (_, mut next, mut node_pairs) = tree.descend_to_leaf(0).unwrap();
        let mut seen = Vec::new();
        loop {
            seen.extend(node_pairs.iter().map(|(_, k)| *k));
            if next == EMPTY {
                break;
            }
            let (tag, n, p) = tree.read_node(next).unwrap();
            assert_eq!(tag, LEAF_TAG);
            next = n;
            node_pairs = p;
        }
        let expected: Vec<u64> = (0..50u64).map(|k| k * 2).collect();
        assert_eq!(seen, expected);
    }
}
