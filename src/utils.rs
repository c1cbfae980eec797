// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Heap-shaped tree indexing utilities shared by the ORAM engine.

use crate::{Address, Error, TreeHeight, TreeIndex};
use rand::{CryptoRng, Rng, RngCore};
use static_assertions::const_assert_eq;
use std::io::{Read, Write};
use std::mem::size_of;

const_assert_eq!(size_of::<TreeIndex>(), 8);

/// The largest supported ORAM tree height; a `TreeIndex` must fit every leaf.
pub(crate) const MAXIMUM_TREE_HEIGHT: TreeHeight = 63;

/// Returns a uniformly random leaf of a tree of the given height, as a heap index.
///
/// Leaves of a tree of height `h` occupy heap indices `[2^h, 2^(h+1))`.
pub(crate) fn random_leaf<R: RngCore + CryptoRng>(height: TreeHeight, rng: &mut R) -> TreeIndex {
    2u64.pow(height) + rng.gen_range(0..2u64.pow(height))
}

/// Returns the heap index of the node at `depth` on the path from the root to `leaf`.
///
/// The root has depth 0 and `leaf` itself has depth `height`.
pub(crate) fn node_on_path(leaf: TreeIndex, depth: TreeHeight, height: TreeHeight) -> TreeIndex {
    debug_assert!(is_leaf(leaf, height));
    leaf >> (height - depth)
}

pub(crate) fn is_leaf(index: TreeIndex, height: TreeHeight) -> bool {
    index != 0 && depth_of(index) == height
}

pub(crate) fn depth_of(index: TreeIndex) -> TreeHeight {
    debug_assert_ne!(index, 0);
    63 - index.leading_zeros()
}

/// Maps a 1-based heap index to the 0-based storage address of its bucket.
pub(crate) fn bucket_address(index: TreeIndex) -> Address {
    debug_assert_ne!(index, 0);
    index - 1
}

/// Orders a leaf by the reversed binary representation of its ordinal.
///
/// Bulk loads sort blocks by this value so that leaves fill bottom-up in a
/// stable interleaved order, which keeps the post-load stash near empty.
pub(crate) fn reverse_lexicographic(leaf: TreeIndex, height: TreeHeight) -> u64 {
    debug_assert!(is_leaf(leaf, height));
    let ordinal = leaf - 2u64.pow(height);
    if height == 0 {
        return 0;
    }
    ordinal.reverse_bits() >> (64 - height)
}

// Little-endian integer plumbing for the client-state and index codecs.

pub(crate) fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<(), Error> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub(crate) fn read_u64<R: Read>(reader: &mut R) -> Result<u64, Error> {
    let mut buffer = [0u8; 8];
    reader.read_exact(&mut buffer)?;
    Ok(u64::from_le_bytes(buffer))
}

pub(crate) fn read_u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buffer)
}

pub(crate) fn write_u64_at(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
