// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use rsa::RsaPrivateKey;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    crypto::{self, PassphraseSource},
    format::avb::{self, PublicKey},
};

/// File extensions that are considered when loading keys from a directory.
const KEY_EXTENSIONS: [&str; 2] = ["pem", "key"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to list directory: {0:?}")]
    ReadDir(PathBuf, #[source] io::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("AVB error")]
    Avb(#[from] avb::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// An RSA private key together with its AVB public key.
#[derive(Clone)]
pub struct KeyPair {
    public_key: PublicKey,
    private_key: RsaPrivateKey,
}

impl KeyPair {
    pub fn new(private_key: RsaPrivateKey) -> Result<Self> {
        let public_key = PublicKey::from_private_key(&private_key)?;

        Ok(Self {
            public_key,
            private_key,
        })
    }

    /// Generate a new key pair with a modulus of the specified size.
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key = crypto::generate_rsa_key_pair(bits)?;

        Self::new(private_key)
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Set of trusted key pairs, indexed by public key.
#[derive(Clone, Debug, Default)]
pub struct KeyRing {
    keys: HashMap<PublicKey, KeyPair>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key pair. Returns the previous entry for the same public key.
    pub fn insert(&mut self, key_pair: KeyPair) -> Option<KeyPair> {
        self.keys.insert(key_pair.public_key.clone(), key_pair)
    }

    pub fn get(&self, public_key: &PublicKey) -> Option<&KeyPair> {
        self.keys.get(public_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyPair> {
        self.keys.values()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load every `*.pem` and `*.key` file in a directory as a PKCS8 private
    /// key. Files that cannot be loaded are skipped.
    pub fn load_dir(path: &Path, source: &PassphraseSource) -> Result<Self> {
        let mut paths = fs::read_dir(path)
            .and_then(|iter| {
                iter.map(|entry| entry.map(|e| e.path()))
                    .collect::<io::Result<Vec<_>>>()
            })
            .map_err(|e| Error::ReadDir(path.to_owned(), e))?;
        paths.sort();

        let mut key_ring = Self::new();

        for key_path in paths {
            let is_key = key_path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| KEY_EXTENSIONS.contains(&e));
            if !is_key || !key_path.is_file() {
                continue;
            }

            let key_pair = match crypto::read_pem_key_file(&key_path, source)
                .map_err(Error::from)
                .and_then(KeyPair::new)
            {
                Ok(k) => k,
                Err(e) => {
                    warn!("Skipping {key_path:?}: {e}");
                    continue;
                }
            };

            debug!("Loaded {} from {key_path:?}", key_pair.public_key);
            key_ring.insert(key_pair);
        }

        Ok(key_ring)
    }
}

impl FromIterator<KeyPair> for KeyRing {
    fn from_iter<T: IntoIterator<Item = KeyPair>>(iter: T) -> Self {
        let mut key_ring = Self::new();
        for key_pair in iter {
            key_ring.insert(key_pair);
        }
        key_ring
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn keys_dir() -> &'static Path {
        Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/keys"))
    }

    #[test]
    fn load_keys_from_directory() {
        let key_ring = KeyRing::load_dir(keys_dir(), &PassphraseSource::None).unwrap();
        assert_eq!(key_ring.len(), 3);

        // The encrypted key is the same as the unencrypted one.
        let source =
            PassphraseSource::File(keys_dir().join("TEST_KEY_DO_NOT_USE_other.passphrase"));
        let key_ring_with_pass = KeyRing::load_dir(keys_dir(), &source).unwrap();
        assert_eq!(key_ring_with_pass.len(), 3);

        for key_pair in key_ring.iter() {
            let found = key_ring_with_pass.get(key_pair.public_key()).unwrap();
            assert_eq!(found.private_key(), key_pair.private_key());
        }
    }

    #[test]
    fn missing_directory_fails() {
        let path = keys_dir().join("does_not_exist");

        assert!(matches!(
            KeyRing::load_dir(&path, &PassphraseSource::None),
            Err(Error::ReadDir(p, _)) if p == path
        ));
    }
}
