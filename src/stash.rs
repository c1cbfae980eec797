// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The client-side Path ORAM stash.
//!
//! An unordered overflow buffer for blocks that did not fit on their target
//! path during eviction. Occupancy stays bounded in expectation; the engine
//! reserves `3 * height * Z` slots and treats exceeding them as fatal.

use crate::utils::{read_u64, write_u64};
use crate::{Error, RecordId};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// An unordered collection of `(id, payload)` blocks held client-side.
#[derive(Debug)]
pub struct Stash {
    entries: Vec<(RecordId, Vec<u8>)>,
    capacity: usize,
}

impl Stash {
    /// Returns an empty stash that tolerates up to `capacity` resident blocks.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// The number of blocks currently in the stash.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stash holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The bound the engine checks occupancy against after eviction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds a block. A duplicate id means the path/stash residency invariant
    /// is already broken; that is checked here in debug builds.
    pub fn add(&mut self, id: RecordId, payload: Vec<u8>) {
        debug_assert!(
            self.find(id).is_none(),
            "duplicate id {id} added to the stash"
        );
        self.entries.push((id, payload));
    }

    /// Removes and returns the block with the given id, if present.
    pub fn remove(&mut self, id: RecordId) -> Option<Vec<u8>> {
        let index = self.entries.iter().position(|(entry, _)| *entry == id)?;
        Some(self.entries.swap_remove(index).1)
    }

    /// Returns the payload of the block with the given id, if present.
    pub fn find(&self, id: RecordId) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, payload)| payload.as_slice())
    }

    /// Iterates over every resident `(id, payload)`.
    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &[u8])> {
        self.entries
            .iter()
            .map(|(id, payload)| (*id, payload.as_slice()))
    }

    /// Direct access for the engine's scan and eviction passes.
    pub(crate) fn entries_mut(&mut self) -> &mut Vec<(RecordId, Vec<u8>)> {
        &mut self.entries
    }

    /// Serializes the stash as a count-prefixed concatenation of `(id, payload)`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let mut writer = BufWriter::new(File::create(path)?);
        write_u64(&mut writer, self.entries.len() as u64)?;
        for (id, payload) in &self.entries {
            write_u64(&mut writer, *id)?;
            writer.write_all(payload)?;
        }
        Ok(())
    }

    /// Loads a stash previously written by [`save`](Stash::save). Payload
    /// length is not self-describing, so the block size must be supplied.
    pub fn load<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        capacity: usize,
    ) -> Result<Self, Error> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut stash = Self::new(capacity);
        let count = read_u64(&mut reader)?;
        for _ in 0..count {
            let id = read_u64(&mut reader)?;
            let mut payload = vec![0u8; block_size];
            reader.read_exact(&mut payload)?;
            stash.add(id, payload);
        }
        Ok(stash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_find_remove() {
        let mut stash = Stash::new(16);
        assert!(stash.is_empty());

        stash.add(3, vec![1, 2, 3]);
        stash.add(9, vec![9, 9, 9]);
        assert_eq!(stash.len(), 2);
        assert_eq!(stash.find(3), Some(&[1u8, 2, 3][..]));
        assert_eq!(stash.find(4), None);

        assert_eq!(stash.remove(3), Some(vec![1, 2, 3]));
        assert_eq!(stash.remove(3), None);
        assert_eq!(stash.len(), 1);
    }

    #[test]
    #[should_panic(expected = "duplicate id")]
    #[cfg(debug_assertions)]
    fn duplicate_id_is_fatal() {
        let mut stash = Stash::new(16);
        stash.add(1, vec![0; 4]);
        stash.add(1, vec![0; 4]);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oram-stash-0.bin");

        let block_size = 32;
        let mut stash = Stash::new(8);
        stash.add(7, vec![0xa; block_size]);
        stash.add(2, vec![0xb; block_size]);
        stash.save(&path).unwrap();

        let loaded = Stash::load(&path, block_size, 8).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.find(7), Some(&vec![0xa; block_size][..]));
        assert_eq!(loaded.find(2), Some(&vec![0xb; block_size][..]));
    }
}
