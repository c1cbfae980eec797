// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The client-side Path ORAM position map.

use crate::utils::{is_leaf, random_leaf, read_u64, write_u64};
use crate::{Error, RecordId, TreeHeight, TreeIndex};
use rand::{CryptoRng, RngCore};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

const UNASSIGNED: TreeIndex = 0;

/// A mapping from logical block id to the leaf its block is assigned to.
///
/// Ids that were never assigned map to a fresh uniformly random leaf on every
/// [`get`](PositionMap::get); this is how new ids acquire a position (the
/// engine immediately remaps the id afterwards).
#[derive(Debug)]
pub struct PositionMap {
    /// Heap leaf index per id; `UNASSIGNED` marks ids never written.
    positions: Vec<TreeIndex>,
    height: TreeHeight,
}

impl PositionMap {
    /// Returns an empty position map for a tree of the given height.
    pub fn new(height: TreeHeight) -> Self {
        Self {
            positions: Vec::new(),
            height,
        }
    }

    /// Returns the leaf assigned to `id`, or a uniformly random leaf if none is.
    pub fn get<R: RngCore + CryptoRng>(&self, id: RecordId, rng: &mut R) -> TreeIndex {
        match self.positions.get(id as usize) {
            Some(&leaf) if leaf != UNASSIGNED => leaf,
            _ => random_leaf(self.height, rng),
        }
    }

    /// Assigns `id` to `leaf`.
    pub fn set(&mut self, id: RecordId, leaf: TreeIndex) {
        debug_assert!(is_leaf(leaf, self.height));
        let index = id as usize;
        if index >= self.positions.len() {
            self.positions.resize(index + 1, UNASSIGNED);
        }
        self.positions[index] = leaf;
    }

    /// Returns the assigned leaf of `id`, if any. Used by eviction, which must
    /// not disturb unassigned ids.
    pub(crate) fn leaf_of(&self, id: RecordId) -> Option<TreeIndex> {
        match self.positions.get(id as usize) {
            Some(&leaf) if leaf != UNASSIGNED => Some(leaf),
            _ => None,
        }
    }

    /// Iterates over `(id, leaf)` for every assigned id.
    pub(crate) fn assigned(&self) -> impl Iterator<Item = (RecordId, TreeIndex)> + '_ {
        self.positions
            .iter()
            .enumerate()
            .filter(|(_, &leaf)| leaf != UNASSIGNED)
            .map(|(id, &leaf)| (id as RecordId, leaf))
    }

    /// Serializes the map as a count-prefixed list of `(id, leaf)` pairs.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let mut writer = BufWriter::new(File::create(path)?);
        let assigned: Vec<(RecordId, TreeIndex)> = self.assigned().collect();
        write_u64(&mut writer, assigned.len() as u64)?;
        for (id, leaf) in assigned {
            write_u64(&mut writer, id)?;
            write_u64(&mut writer, leaf)?;
        }
        Ok(())
    }

    /// Loads a map previously written by [`save`](PositionMap::save).
    pub fn load<P: AsRef<Path>>(path: P, height: TreeHeight) -> Result<Self, Error> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut map = Self::new(height);
        let count = read_u64(&mut reader)?;
        for _ in 0..count {
            let id = read_u64(&mut reader)?;
            let leaf = read_u64(&mut reader)?;
            if !is_leaf(leaf, height) {
                return Err(Error::Decrypt);
            }
            map.set(id, leaf);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    #[test]
    fn unknown_ids_get_random_leaves() {
        let mut rng = OsRng;
        let map = PositionMap::new(4);
        for id in 0..32 {
            let leaf = map.get(id, &mut rng);
            assert!(is_leaf(leaf, 4));
        }
    }

    #[test]
    fn set_then_get() {
        let mut rng = OsRng;
        let mut map = PositionMap::new(3);
        map.set(5, 9);
        map.set(0, 15);
        assert_eq!(map.get(5, &mut rng), 9);
        assert_eq!(map.get(0, &mut rng), 15);
        assert_eq!(map.leaf_of(5), Some(9));
        assert_eq!(map.leaf_of(1), None);
    }

    #[test]
    fn save_load_round_trip() {
        let mut rng = OsRng;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oram-map-0.bin");

        let mut map = PositionMap::new(5);
        for id in [0u64, 3, 17, 40] {
            map.set(id, random_leaf(5, &mut rng));
        }
        map.save(&path).unwrap();

        let loaded = PositionMap::load(&path, 5).unwrap();
        let mut expected: Vec<_> = map.assigned().collect();
        let mut actual: Vec<_> = loaded.assigned().collect();
        expected.sort_unstable();
        actual.sort_unstable();
        assert_eq!(expected, actual);
    }
}
