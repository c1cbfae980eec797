// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Block storage adapters for the ORAM engine and the B+-tree.
//!
//! A storage adapter is a value-preserving map from addresses to fixed-size
//! byte blocks. It never interprets payloads; encryption happens above it,
//! on the client side. Each instance has a single owner (one ORAM shard or
//! one tree), so adapters carry no interior synchronization.

use crate::{Address, BlockSize, Error};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A block-granular storage backend.
///
/// Scalar `get`/`set` are the defaults; `get_batch`/`set_batch` exist so that
/// backends with per-operation latency (files, network stores) can amortize
/// round-trips, and fall back to scalar loops otherwise.
pub trait BlockStorage {
    /// Returns the number of allocated blocks.
    fn capacity(&self) -> Address;

    /// Returns the size in bytes of each block.
    fn block_size(&self) -> BlockSize;

    /// Allocates a fresh block of zeroes and returns its address.
    fn new_address(&mut self) -> Result<Address, Error>;

    /// Reads the block stored at `address`.
    fn get(&mut self, address: Address) -> Result<Vec<u8>, Error>;

    /// Overwrites the block stored at `address`. Writes always replace the
    /// full block; `data` must be exactly `block_size` bytes.
    fn set(&mut self, address: Address, data: &[u8]) -> Result<(), Error>;

    /// Reads a batch of blocks, returned in request order.
    fn get_batch(&mut self, addresses: &[Address]) -> Result<Vec<(Address, Vec<u8>)>, Error> {
        let mut result = Vec::with_capacity(addresses.len());
        for &address in addresses {
            result.push((address, self.get(address)?));
        }
        Ok(result)
    }

    /// Writes a batch of blocks.
    fn set_batch(&mut self, blocks: &[(Address, Vec<u8>)]) -> Result<(), Error> {
        for (address, data) in blocks {
            self.set(*address, data)?;
        }
        Ok(())
    }

    /// Flushes any buffered writes to durable storage.
    fn sync(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl BlockStorage for Box<dyn BlockStorage + Send> {
    fn capacity(&self) -> Address {
        (**self).capacity()
    }

    fn block_size(&self) -> BlockSize {
        (**self).block_size()
    }

    fn new_address(&mut self) -> Result<Address, Error> {
        (**self).new_address()
    }

    fn get(&mut self, address: Address) -> Result<Vec<u8>, Error> {
        (**self).get(address)
    }

    fn set(&mut self, address: Address, data: &[u8]) -> Result<(), Error> {
        (**self).set(address, data)
    }

    fn get_batch(&mut self, addresses: &[Address]) -> Result<Vec<(Address, Vec<u8>)>, Error> {
        (**self).get_batch(addresses)
    }

    fn set_batch(&mut self, blocks: &[(Address, Vec<u8>)]) -> Result<(), Error> {
        (**self).set_batch(blocks)
    }

    fn sync(&mut self) -> Result<(), Error> {
        (**self).sync()
    }
}

fn check_address(address: Address, capacity: Address) -> Result<(), Error> {
    if address >= capacity {
        return Err(Error::OutOfRange { address, capacity });
    }
    Ok(())
}

fn check_block_size(data: &[u8], block_size: BlockSize) -> Result<(), Error> {
    if data.len() != block_size {
        return Err(Error::SizeMismatch {
            actual: data.len(),
            expected: block_size,
        });
    }
    Ok(())
}

/// A storage adapter holding all blocks in memory.
#[derive(Debug)]
pub struct InMemoryStorage {
    blocks: Vec<Vec<u8>>,
    block_size: BlockSize,
}

impl InMemoryStorage {
    /// Returns a new in-memory storage with `initial_blocks` zeroed blocks.
    pub fn new(block_size: BlockSize, initial_blocks: Address) -> Self {
        Self {
            blocks: vec![vec![0u8; block_size]; initial_blocks as usize],
            block_size,
        }
    }
}

impl BlockStorage for InMemoryStorage {
    fn capacity(&self) -> Address {
        self.blocks.len() as Address
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn new_address(&mut self) -> Result<Address, Error> {
        self.blocks.push(vec![0u8; self.block_size]);
        Ok(self.blocks.len() as Address - 1)
    }

    fn get(&mut self, address: Address) -> Result<Vec<u8>, Error> {
        check_address(address, self.capacity())?;
        Ok(self.blocks[address as usize].clone())
    }

    fn set(&mut self, address: Address, data: &[u8]) -> Result<(), Error> {
        check_address(address, self.capacity())?;
        check_block_size(data, self.block_size)?;
        self.blocks[address as usize].copy_from_slice(data);
        Ok(())
    }
}

/// A storage adapter backed by a single flat file, one block per slot.
///
/// Block `a` lives at byte offset `a * block_size`. Not safe to share across
/// shards; every shard owns its own file.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
    block_size: BlockSize,
    allocated: Address,
}

impl FileStorage {
    /// Creates (or truncates) the backing file with `initial_blocks` zeroed blocks.
    pub fn create<P: AsRef<Path>>(
        path: P,
        block_size: BlockSize,
        initial_blocks: Address,
    ) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(initial_blocks * block_size as u64)?;
        Ok(Self {
            file,
            block_size,
            allocated: initial_blocks,
        })
    }

    /// Reopens an existing backing file; every block in it is considered allocated.
    pub fn open<P: AsRef<Path>>(path: P, block_size: BlockSize) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let length = file.metadata()?.len();
        if length % block_size as u64 != 0 {
            return Err(Error::Backend(format!(
                "{} has length {length} which is not a multiple of the block size {block_size}",
                path.as_ref().display()
            )));
        }
        Ok(Self {
            file,
            block_size,
            allocated: length / block_size as u64,
        })
    }

    fn offset(&self, address: Address) -> u64 {
        address * self.block_size as u64
    }
}

impl BlockStorage for FileStorage {
    fn capacity(&self) -> Address {
        self.allocated
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn new_address(&mut self) -> Result<Address, Error> {
        let address = self.allocated;
        self.allocated += 1;
        self.file.set_len(self.allocated * self.block_size as u64)?;
        Ok(address)
    }

    fn get(&mut self, address: Address) -> Result<Vec<u8>, Error> {
        check_address(address, self.allocated)?;
        let mut block = vec![0u8; self.block_size];
        self.file.seek(SeekFrom::Start(self.offset(address)))?;
        self.file.read_exact(&mut block)?;
        Ok(block)
    }

    fn set(&mut self, address: Address, data: &[u8]) -> Result<(), Error> {
        check_address(address, self.allocated)?;
        check_block_size(data, self.block_size)?;
        self.file.seek(SeekFrom::Start(self.offset(address)))?;
        self.file.write_all(data)?;
        Ok(())
    }

    // One seek-ordered pass over the file instead of request-ordered seeks.
    fn get_batch(&mut self, addresses: &[Address]) -> Result<Vec<(Address, Vec<u8>)>, Error> {
        let mut order: Vec<usize> = (0..addresses.len()).collect();
        order.sort_by_key(|&i| addresses[i]);

        let mut result: Vec<(Address, Vec<u8>)> = vec![(0, Vec::new()); addresses.len()];
        for i in order {
            let address = addresses[i];
            result[i] = (address, self.get(address)?);
        }
        Ok(result)
    }

    fn set_batch(&mut self, blocks: &[(Address, Vec<u8>)]) -> Result<(), Error> {
        let mut order: Vec<usize> = (0..blocks.len()).collect();
        order.sort_by_key(|&i| blocks[i].0);

        for i in order {
            let (address, data) = &blocks[i];
            self.set(*address, data)?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_logger;
    use tempfile::TempDir;

    const BLOCK_SIZE: BlockSize = 64;

    fn block(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_SIZE]
    }

    fn check_round_trip<S: BlockStorage>(storage: &mut S) {
        assert_eq!(storage.capacity(), 8);
        assert_eq!(storage.block_size(), BLOCK_SIZE);

        for address in 0..8 {
            assert_eq!(storage.get(address).unwrap(), block(0), "{address}");
        }

        storage.set(3, &block(0xab)).unwrap();
        storage.set(7, &block(0xcd)).unwrap();
        assert_eq!(storage.get(3).unwrap(), block(0xab));
        assert_eq!(storage.get(7).unwrap(), block(0xcd));
        assert_eq!(storage.get(4).unwrap(), block(0));

        // Writes replace the full block.
        storage.set(3, &block(0x11)).unwrap();
        assert_eq!(storage.get(3).unwrap(), block(0x11));
    }

    fn check_batch<S: BlockStorage>(storage: &mut S) {
        let writes: Vec<(Address, Vec<u8>)> =
            vec![(5, block(5)), (1, block(1)), (6, block(6)), (0, block(9))];
        storage.set_batch(&writes).unwrap();

        let reads = storage.get_batch(&[6, 0, 5, 1]).unwrap();
        let expected = vec![(6, block(6)), (0, block(9)), (5, block(5)), (1, block(1))];
        assert_eq!(reads, expected);
    }

    fn check_errors<S: BlockStorage>(storage: &mut S) {
        assert!(matches!(
            storage.get(8),
            Err(Error::OutOfRange {
                address: 8,
                capacity: 8
            })
        ));
        assert!(matches!(
            storage.set(8, &block(0)),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            storage.set(0, &[0u8; BLOCK_SIZE - 1]),
            Err(Error::SizeMismatch {
                actual: 63,
                expected: 64
            })
        ));
    }

    fn check_allocation<S: BlockStorage>(storage: &mut S) {
        let address = storage.new_address().unwrap();
        assert_eq!(address, 8);
        assert_eq!(storage.capacity(), 9);
        assert_eq!(storage.get(address).unwrap(), block(0));
        storage.set(address, &block(0x42)).unwrap();
        assert_eq!(storage.get(address).unwrap(), block(0x42));
    }

    macro_rules! create_block_storage_tests {
        ($name:ident, $make:expr) => {
            paste::paste! {
                #[test]
                fn [<$name _round_trip>]() {
                    init_logger();
                    let (_guard, mut storage) = $make;
                    check_round_trip(&mut storage);
                }

                #[test]
                fn [<$name _batch>]() {
                    init_logger();
                    let (_guard, mut storage) = $make;
                    check_batch(&mut storage);
                }

                #[test]
                fn [<$name _errors>]() {
                    init_logger();
                    let (_guard, mut storage) = $make;
                    check_errors(&mut storage);
                }

                #[test]
                fn [<$name _allocation>]() {
                    init_logger();
                    let (_guard, mut storage) = $make;
                    check_allocation(&mut storage);
                }
            }
        };
    }

    create_block_storage_tests!(in_memory, ((), InMemoryStorage::new(BLOCK_SIZE, 8)));
    create_block_storage_tests!(file_backed, {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::create(dir.path().join("blocks.bin"), BLOCK_SIZE, 8).unwrap();
        (dir, storage)
    });

    #[test]
    fn file_backed_reopen_preserves_blocks() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.bin");

        let mut storage = FileStorage::create(&path, BLOCK_SIZE, 4).unwrap();
        storage.set(2, &block(0x77)).unwrap();
        storage.sync().unwrap();
        drop(storage);

        let mut reopened = FileStorage::open(&path, BLOCK_SIZE).unwrap();
        assert_eq!(reopened.capacity(), 4);
        assert_eq!(reopened.get(2).unwrap(), block(0x77));
        assert_eq!(reopened.get(0).unwrap(), block(0));
    }

    #[test]
    fn file_backed_rejects_misaligned_file() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks.bin");
        std::fs::write(&path, vec![0u8; BLOCK_SIZE + 1]).unwrap();
        assert!(matches!(
            FileStorage::open(&path, BLOCK_SIZE),
            Err(Error::Backend(_))
        ));
    }
}
