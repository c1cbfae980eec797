// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Client-side block encryption.
//!
//! Every server-resident block is AES-256-CTR encrypted under a per-shard
//! long-term key, with a fresh random IV per write prepended to the stored
//! ciphertext. Keys are generated from the system CSPRNG at build time,
//! persisted to a raw key file, and reloaded on resume. The key never leaves
//! the client process except through that file.

use crate::Error;
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::{CryptoRng, RngCore};
use std::fs;
use std::path::Path;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// The size in bytes of a long-term encryption key.
pub const KEY_SIZE: usize = 32;
/// The size in bytes of the IV prefix carried by every stored block.
pub const IV_SIZE: usize = 16;

/// A long-term AES-256 key held client-side.
pub type EncryptionKey = [u8; KEY_SIZE];

/// Draws a fresh key from a cryptographic RNG.
pub fn generate_key<R: RngCore + CryptoRng>(rng: &mut R) -> EncryptionKey {
    let mut key = [0u8; KEY_SIZE];
    rng.fill_bytes(&mut key);
    key
}

/// Persists a key as a raw 32-byte file.
pub fn store_key<P: AsRef<Path>>(key: &EncryptionKey, path: P) -> Result<(), Error> {
    fs::write(path, key)?;
    Ok(())
}

/// Loads a key previously written by [`store_key`].
pub fn load_key<P: AsRef<Path>>(path: P) -> Result<EncryptionKey, Error> {
    let bytes = fs::read(&path)?;
    let key: EncryptionKey = bytes.try_into().map_err(|_| {
        Error::Configuration(format!(
            "key file {} does not hold exactly {KEY_SIZE} bytes",
            path.as_ref().display()
        ))
    })?;
    Ok(key)
}

/// Encrypts a block under a fresh IV; returns `IV ‖ ciphertext`.
pub fn encrypt<R: RngCore + CryptoRng>(
    key: &EncryptionKey,
    plaintext: &[u8],
    rng: &mut R,
) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    rng.fill_bytes(&mut iv);

    let mut output = Vec::with_capacity(IV_SIZE + plaintext.len());
    output.extend_from_slice(&iv);
    output.extend_from_slice(plaintext);

    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut output[IV_SIZE..]);
    output
}

/// Decrypts a stored block of the form `IV ‖ ciphertext`.
///
/// CTR mode carries no authentication tag; callers that know the plaintext
/// structure (the ORAM bucket codec) validate it and surface
/// [`Error::Decrypt`] on garbage.
pub fn decrypt(key: &EncryptionKey, stored: &[u8]) -> Result<Vec<u8>, Error> {
    if stored.len() < IV_SIZE {
        return Err(Error::Decrypt);
    }
    let (iv, ciphertext) = stored.split_at(IV_SIZE);

    let mut plaintext = ciphertext.to_vec();
    let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| Error::Decrypt)?;
    let mut cipher = Aes256Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use tempfile::TempDir;

    #[test]
    fn round_trip() {
        let mut rng = OsRng;
        let key = generate_key(&mut rng);
        let plaintext = b"attack at dawn".to_vec();

        let stored = encrypt(&key, &plaintext, &mut rng);
        assert_eq!(stored.len(), IV_SIZE + plaintext.len());
        assert_eq!(decrypt(&key, &stored).unwrap(), plaintext);
    }

    #[test]
    fn fresh_iv_per_write() {
        let mut rng = OsRng;
        let key = generate_key(&mut rng);
        let plaintext = vec![0u8; 64];

        let first = encrypt(&key, &plaintext, &mut rng);
        let second = encrypt(&key, &plaintext, &mut rng);
        assert_ne!(first[..IV_SIZE], second[..IV_SIZE]);
        assert_ne!(first[IV_SIZE..], second[IV_SIZE..]);
    }

    #[test]
    fn wrong_key_scrambles() {
        let mut rng = OsRng;
        let key = generate_key(&mut rng);
        let other = generate_key(&mut rng);
        let plaintext = vec![0x5au8; 64];

        let stored = encrypt(&key, &plaintext, &mut rng);
        assert_ne!(decrypt(&other, &stored).unwrap(), plaintext);
    }

    #[test]
    fn truncated_block_is_rejected() {
        let key = [0u8; KEY_SIZE];
        assert!(matches!(decrypt(&key, &[0u8; 4]), Err(Error::Decrypt)));
    }

    #[test]
    fn key_file_round_trip() {
        let mut rng = OsRng;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key-0.bin");

        let key = generate_key(&mut rng);
        store_key(&key, &path).unwrap();
        assert_eq!(load_key(&path).unwrap(), key);
    }

    #[test]
    fn short_key_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("key-0.bin");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(matches!(load_key(&path), Err(Error::Configuration(_))));
    }
}
