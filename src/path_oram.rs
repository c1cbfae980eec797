// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM engine.
//!
//! An oblivious key→value store over a fixed-depth binary tree of encrypted
//! buckets. The server sees `2^(height+1) - 1` ciphertext buckets in heap
//! order and, per access, one full root-to-leaf path being read and written
//! back; which block the client was after is hidden by remapping the block
//! to a fresh random leaf on every access.

use crate::crypto::{self, EncryptionKey, IV_SIZE};
use crate::position_map::PositionMap;
use crate::stash::Stash;
use crate::storage::BlockStorage;
use crate::utils::{
    bucket_address, node_on_path, random_leaf, read_u64_at, reverse_lexicographic, write_u64_at,
    MAXIMUM_TREE_HEIGHT,
};
use crate::{Address, BlockSize, BucketSize, Error, RecordId, TreeHeight, TreeIndex};
use log::debug;
use rand::{CryptoRng, RngCore};
use subtle::{Choice, ConditionallySelectable, ConstantTimeEq};

/// The parameter `Z` from the Path ORAM literature that sets the number of
/// blocks per bucket. The range query engine runs with 3.
pub const DEFAULT_BUCKET_SIZE: BucketSize = 3;

/// Sentinel id marking an empty bucket slot.
const EMPTY_SLOT: RecordId = RecordId::MAX;

/// Decrypted slot ids must be empty or below this bound. CTR mode carries no
/// authentication tag, so a wrong key or corrupted ciphertext is caught
/// structurally: garbage bytes clear this check with probability ~2^-16 per slot.
const MAX_SLOT_ID: RecordId = 1 << 48;

/// A Path ORAM over one storage adapter, position map, and stash.
#[derive(Debug)]
pub struct PathOram<S: BlockStorage> {
    storage: S,
    pub(crate) position_map: PositionMap,
    pub(crate) stash: Stash,
    key: EncryptionKey,
    height: TreeHeight,
    block_size: BlockSize,
    z: BucketSize,
}

/// The number of bytes of a serialized plaintext bucket.
pub fn bucket_plaintext_size(z: BucketSize, block_size: BlockSize) -> usize {
    z * (8 + block_size)
}

/// The number of bytes of a stored (encrypted) bucket: `IV ‖ ciphertext`.
pub fn bucket_ciphertext_size(z: BucketSize, block_size: BlockSize) -> usize {
    IV_SIZE + bucket_plaintext_size(z, block_size)
}

/// The stash reservation for a tree of the given height.
pub fn stash_capacity(height: TreeHeight, z: BucketSize) -> usize {
    3 * height as usize * z
}

impl<S: BlockStorage> PathOram<S> {
    /// Builds an engine over `storage`, which must hold exactly
    /// `2^(height+1) - 1` blocks of [`bucket_ciphertext_size`] bytes.
    ///
    /// With `initialize` set, every bucket is overwritten with an encrypted
    /// empty bucket (fresh build); otherwise the storage is assumed to hold
    /// ciphertext from a previous run under the same key.
    pub fn new<R: RngCore + CryptoRng>(
        height: TreeHeight,
        block_size: BlockSize,
        z: BucketSize,
        storage: S,
        position_map: PositionMap,
        stash: Stash,
        key: EncryptionKey,
        initialize: bool,
        rng: &mut R,
    ) -> Result<Self, Error> {
        if height == 0 || height >= MAXIMUM_TREE_HEIGHT {
            return Err(Error::Configuration(format!(
                "unsupported ORAM tree height {height}"
            )));
        }
        if z == 0 {
            return Err(Error::Configuration("bucket size Z must be positive".into()));
        }
        let bucket_count = (1u64 << (height + 1)) - 1;
        if storage.capacity() != bucket_count {
            return Err(Error::Configuration(format!(
                "storage holds {} blocks, tree of height {height} needs {bucket_count}",
                storage.capacity()
            )));
        }
        if storage.block_size() != bucket_ciphertext_size(z, block_size) {
            return Err(Error::Configuration(format!(
                "storage block size {} does not fit encrypted buckets of {} bytes",
                storage.block_size(),
                bucket_ciphertext_size(z, block_size)
            )));
        }

        debug!("PathOram::new -- height = {height}, Z = {z}, block size = {block_size}");

        let mut oram = Self {
            storage,
            position_map,
            stash,
            key,
            height,
            block_size,
            z,
        };

        if initialize {
            let writes: Vec<(Address, Vec<u8>)> = (1..=bucket_count)
                .map(|index| {
                    let plaintext = oram.encode_bucket(&[]);
                    (bucket_address(index), crypto::encrypt(&oram.key, &plaintext, rng))
                })
                .collect();
            oram.storage.set_batch(&writes)?;
        }

        Ok(oram)
    }

    /// The height of the bucket tree.
    pub fn height(&self) -> TreeHeight {
        self.height
    }

    /// The size in bytes of each logical block.
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Obliviously reads the block with the given id.
    ///
    /// An id that was never written reads as an all-zero block; the query
    /// layer relies on this when issuing dummy fetches.
    pub fn get<R: RngCore + CryptoRng>(
        &mut self,
        id: RecordId,
        rng: &mut R,
    ) -> Result<Vec<u8>, Error> {
        self.access(id, None, rng)
    }

    /// Obliviously writes a block. Payloads shorter than the block size are
    /// zero-padded; longer payloads are rejected.
    pub fn put<R: RngCore + CryptoRng>(
        &mut self,
        id: RecordId,
        payload: &[u8],
        rng: &mut R,
    ) -> Result<(), Error> {
        let padded = self.pad_payload(payload)?;
        self.access(id, Some(padded), rng)?;
        Ok(())
    }

    fn pad_payload(&self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        if payload.len() > self.block_size {
            return Err(Error::SizeMismatch {
                actual: payload.len(),
                expected: self.block_size,
            });
        }
        let mut padded = payload.to_vec();
        padded.resize(self.block_size, 0);
        Ok(padded)
    }

    /// One oblivious access. Reads and rewrites the full path to the block's
    /// old leaf; `get` and `put` are indistinguishable to the server.
    fn access<R: RngCore + CryptoRng>(
        &mut self,
        id: RecordId,
        new_value: Option<Vec<u8>>,
        rng: &mut R,
    ) -> Result<Vec<u8>, Error> {
        if id >= MAX_SLOT_ID {
            return Err(Error::Configuration(format!("block id {id} out of range")));
        }

        // Remap the block before touching the server, so the path about to be
        // read says nothing about future accesses.
        let old_leaf = self.position_map.get(id, rng);
        let new_leaf = random_leaf(self.height, rng);
        self.position_map.set(id, new_leaf);

        // Read the full path into the stash.
        let path: Vec<Address> = (0..=self.height)
            .map(|depth| bucket_address(node_on_path(old_leaf, depth, self.height)))
            .collect();
        let buckets = self.storage.get_batch(&path)?;
        for (_, stored) in &buckets {
            let slots = self.decode_bucket(&crypto::decrypt(&self.key, stored)?)?;
            for (slot_id, payload) in slots {
                self.stash.add(slot_id, payload);
            }
        }

        // Scan the stash for the target without early exit, reading its value
        // into `result` and conditionally writing the new value.
        let is_write = Choice::from(u8::from(new_value.is_some()));
        let value_to_write = match new_value {
            Some(value) => value,
            None => vec![0u8; self.block_size],
        };

        let mut result = vec![0u8; self.block_size];
        let mut found = Choice::from(0u8);
        for (slot_id, payload) in self.stash.entries_mut().iter_mut() {
            let hit = slot_id.ct_eq(&id);
            for (out, byte) in result.iter_mut().zip(payload.iter()) {
                out.conditional_assign(byte, hit);
            }
            let overwrite = hit & is_write;
            for (byte, new) in payload.iter_mut().zip(value_to_write.iter()) {
                byte.conditional_assign(new, overwrite);
            }
            found |= hit;
        }

        // A never-written id: reads return zeroes, writes enter the stash.
        if (!found).into() && bool::from(is_write) {
            self.stash.add(id, value_to_write);
        }

        self.evict(old_leaf, rng)?;
        Ok(result)
    }

    /// Writes the path back leaf→root, pulling up to `Z` stash blocks into
    /// each bucket. Working upward from the leaf gives the deepest shared
    /// prefix of a block's assigned path the first claim on slots.
    fn evict<R: RngCore + CryptoRng>(
        &mut self,
        leaf: TreeIndex,
        rng: &mut R,
    ) -> Result<(), Error> {
        let mut writes: Vec<(Address, Vec<u8>)> = Vec::with_capacity(self.height as usize + 1);

        for depth in (0..=self.height).rev() {
            let bucket_index = node_on_path(leaf, depth, self.height);

            let mut slots: Vec<(RecordId, Vec<u8>)> = Vec::with_capacity(self.z);
            let entries = self.stash.entries_mut();
            let mut i = 0;
            while slots.len() < self.z && i < entries.len() {
                let slot_id = entries[i].0;
                let on_this_bucket = self
                    .position_map
                    .leaf_of(slot_id)
                    .map(|assigned| node_on_path(assigned, depth, self.height) == bucket_index)
                    .unwrap_or(false);
                if on_this_bucket {
                    slots.push(entries.swap_remove(i));
                } else {
                    i += 1;
                }
            }

            let plaintext = self.encode_bucket(&slots);
            writes.push((
                bucket_address(bucket_index),
                crypto::encrypt(&self.key, &plaintext, rng),
            ));
        }

        self.storage.set_batch(&writes)?;

        if self.stash.len() > self.stash.capacity() {
            return Err(Error::StashOverflow {
                occupancy: self.stash.len(),
                capacity: self.stash.capacity(),
            });
        }
        Ok(())
    }

    /// Bulk build. Assigns every block a random leaf, sorts by the reversed
    /// binary representation of the leaves, and fills buckets from the leaves
    /// upward, overflowing into the stash. Leaves the stash near empty.
    pub fn load<R: RngCore + CryptoRng>(
        &mut self,
        pairs: Vec<(RecordId, Vec<u8>)>,
        rng: &mut R,
    ) -> Result<(), Error> {
        debug!("PathOram::load -- {} blocks", pairs.len());

        let mut placed: Vec<(u64, TreeIndex, RecordId, Vec<u8>)> = Vec::with_capacity(pairs.len());
        for (id, payload) in pairs {
            if id >= MAX_SLOT_ID {
                return Err(Error::Configuration(format!("block id {id} out of range")));
            }
            let leaf = random_leaf(self.height, rng);
            self.position_map.set(id, leaf);
            placed.push((
                reverse_lexicographic(leaf, self.height),
                leaf,
                id,
                self.pad_payload(&payload)?,
            ));
        }
        placed.sort_by_key(|(order, _, _, _)| *order);

        let bucket_count = (1u64 << (self.height + 1)) - 1;
        let mut buckets: Vec<Vec<(RecordId, Vec<u8>)>> =
            vec![Vec::new(); bucket_count as usize + 1];

        for (_, leaf, id, payload) in placed {
            let mut destination = None;
            for depth in (0..=self.height).rev() {
                let index = node_on_path(leaf, depth, self.height) as usize;
                if buckets[index].len() < self.z {
                    destination = Some(index);
                    break;
                }
            }
            match destination {
                Some(index) => buckets[index].push((id, payload)),
                None => self.stash.add(id, payload),
            }
        }

        let writes: Vec<(Address, Vec<u8>)> = (1..=bucket_count)
            .map(|index| {
                let plaintext = self.encode_bucket(&buckets[index as usize]);
                (bucket_address(index), crypto::encrypt(&self.key, &plaintext, rng))
            })
            .collect();
        self.storage.set_batch(&writes)?;

        if self.stash.len() > self.stash.capacity() {
            return Err(Error::StashOverflow {
                occupancy: self.stash.len(),
                capacity: self.stash.capacity(),
            });
        }
        Ok(())
    }

    /// Persists the client-side state and flushes the storage adapter.
    pub fn save_client_state<P: AsRef<std::path::Path>>(
        &mut self,
        map_path: P,
        stash_path: P,
    ) -> Result<(), Error> {
        self.position_map.save(map_path)?;
        self.stash.save(stash_path)?;
        self.storage.sync()
    }

    fn encode_bucket(&self, slots: &[(RecordId, Vec<u8>)]) -> Vec<u8> {
        debug_assert!(slots.len() <= self.z);
        let slot_size = 8 + self.block_size;
        let mut plaintext = vec![0u8; bucket_plaintext_size(self.z, self.block_size)];
        for (slot, chunk) in plaintext.chunks_exact_mut(slot_size).enumerate() {
            match slots.get(slot) {
                Some((id, payload)) => {
                    write_u64_at(chunk, 0, *id);
                    chunk[8..].copy_from_slice(payload);
                }
                None => write_u64_at(chunk, 0, EMPTY_SLOT),
            }
        }
        plaintext
    }

    fn decode_bucket(&self, plaintext: &[u8]) -> Result<Vec<(RecordId, Vec<u8>)>, Error> {
        if plaintext.len() != bucket_plaintext_size(self.z, self.block_size) {
            return Err(Error::Decrypt);
        }
        let slot_size = 8 + self.block_size;
        let mut slots = Vec::with_capacity(self.z);
        for chunk in plaintext.chunks_exact(slot_size) {
            let id = read_u64_at(chunk, 0);
            if id == EMPTY_SLOT {
                continue;
            }
            if id >= MAX_SLOT_ID {
                return Err(Error::Decrypt);
            }
            slots.push((id, chunk[8..].to_vec()));
        }
        Ok(slots)
    }

    /// Verifies that every stored block sits on the path to its mapped leaf
    /// (or in the stash), each exactly once, and no bucket exceeds `Z` slots.
    #[cfg(test)]
    pub(crate) fn check_invariants(&mut self) -> Result<(), Error> {
        use std::collections::HashSet;

        let mut seen: HashSet<RecordId> = HashSet::new();
        let stash_ids: Vec<RecordId> = self.stash.iter().map(|(id, _)| id).collect();
        for id in stash_ids {
            assert!(seen.insert(id), "id {id} duplicated in the stash");
            assert!(
                self.position_map.leaf_of(id).is_some(),
                "stash id {id} has no position"
            );
        }

        let bucket_count = (1u64 << (self.height + 1)) - 1;
        for index in 1..=bucket_count {
            let stored = self.storage.get(bucket_address(index))?;
            let slots = self.decode_bucket(&crypto::decrypt(&self.key, &stored)?)?;
            assert!(slots.len() <= self.z);
            for (id, _) in slots {
                assert!(seen.insert(id), "id {id} stored twice");
                let leaf = self
                    .position_map
                    .leaf_of(id)
                    .unwrap_or_else(|| panic!("stored id {id} has no position"));
                assert_eq!(
                    node_on_path(leaf, crate::utils::depth_of(index), self.height),
                    index,
                    "id {id} is off its assigned path"
                );
            }
        }
        Ok(())
    }
}
