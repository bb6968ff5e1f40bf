// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    env::{self, VarError},
    ffi::OsString,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey, traits::PublicKeyParts};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Largest RSA key that AVB defines an algorithm for.
pub const MAX_KEY_BITS: usize = 8192;

#[derive(Debug, Error)]
pub enum Error {
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("Invalid digest length ({0} bytes) for {1:?}")]
    InvalidDigestLength(usize, SignatureAlgorithm),
    #[error("Failed to read environment variable: {0:?}")]
    InvalidEnvVar(OsString, #[source] VarError),
    #[error("Private key is encrypted, but no passphrase was provided")]
    PassphraseRequired,
    #[error("Failed to load encrypted RSA private key")]
    LoadKeyEncrypted(#[source] pkcs8::Error),
    #[error("Failed to load unencrypted RSA private key")]
    LoadKeyUnencrypted(#[source] pkcs8::Error),
    #[error("Failed to generate {0}-bit RSA key")]
    RsaGenerate(usize, #[source] Box<rsa::Error>),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum SignatureAlgorithm {
    Sha256WithRsa,
    Sha512WithRsa,
}

impl SignatureAlgorithm {
    /// Length of digest required by the signing algorithm.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha256WithRsa => Sha256::output_size(),
            Self::Sha512WithRsa => Sha512::output_size(),
        }
    }

    /// Compute the digest of the specified data.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256WithRsa => Sha256::digest(data).to_vec(),
            Self::Sha512WithRsa => Sha512::digest(data).to_vec(),
        }
    }

    /// Compute the digest of several byte slices as if they were contiguous.
    pub fn hash_parts(self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Sha256WithRsa => {
                let mut hasher = Sha256::new();
                for p in parts {
                    hasher.update(p);
                }
                hasher.finalize().to_vec()
            }
            Self::Sha512WithRsa => {
                let mut hasher = Sha512::new();
                for p in parts {
                    hasher.update(p);
                }
                hasher.finalize().to_vec()
            }
        }
    }

    fn scheme(self) -> Pkcs1v15Sign {
        match self {
            Self::Sha256WithRsa => Pkcs1v15Sign::new::<Sha256>(),
            Self::Sha512WithRsa => Pkcs1v15Sign::new::<Sha512>(),
        }
    }
}

fn check_key_size(size: usize) -> Result<()> {
    if size > MAX_KEY_BITS / 8 {
        return Err(Error::UnsupportedKeySize(size));
    }

    Ok(())
}

/// Sign the digest with the specified signature algorithm. PKCS#1 v1.5
/// signatures are deterministic, so the same digest and key always produce the
/// same signature.
pub fn sign(key: &RsaPrivateKey, algo: SignatureAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
    if digest.len() != algo.digest_len() {
        return Err(Error::InvalidDigestLength(digest.len(), algo));
    }

    check_key_size(key.size())?;

    key.sign(algo.scheme(), digest)
        .map_err(|e| Error::RsaSign(Box::new(e)))
}

pub trait RsaPublicKeyExt {
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()>;
}

impl RsaPublicKeyExt for RsaPublicKey {
    /// Verify the signature against the specified key.
    fn verify_sig(&self, algo: SignatureAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()> {
        // Check this explicitly so we can provide a better error message.
        if digest.len() != algo.digest_len() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        check_key_size(self.size())?;

        self.verify(algo.scheme(), digest, signature)
            .map_err(|e| Error::RsaVerify(Box::new(e)))
    }
}

/// Generate an RSA key pair with the specified modulus size and the public
/// exponent 65537.
pub fn generate_rsa_key_pair(bits: usize) -> Result<RsaPrivateKey> {
    check_key_size(bits / 8)?;

    let mut rng = rand::thread_rng();

    RsaPrivateKey::new(&mut rng, bits).map_err(|e| Error::RsaGenerate(bits, Box::new(e)))
}

/// Where to get the passphrase for an encrypted private key from.
#[derive(Clone, Debug)]
pub enum PassphraseSource {
    None,
    EnvVar(OsString),
    File(PathBuf),
}

impl PassphraseSource {
    pub fn new(pass_file: Option<&Path>, env_var: Option<&OsString>) -> Self {
        if let Some(v) = env_var {
            Self::EnvVar(v.clone())
        } else if let Some(p) = pass_file {
            Self::File(p.to_owned())
        } else {
            Self::None
        }
    }

    pub fn acquire(&self) -> Result<String> {
        let passphrase = match self {
            Self::None => return Err(Error::PassphraseRequired),
            Self::EnvVar(v) => env::var(v).map_err(|e| Error::InvalidEnvVar(v.clone(), e))?,
            Self::File(p) => fs::read_to_string(p)
                .map_err(|e| Error::ReadFile(p.clone(), e))?
                .trim_end_matches(['\r', '\n'])
                .to_owned(),
        };

        Ok(passphrase)
    }
}

/// Read PEM-encoded PKCS8 private key from a reader.
pub fn read_pem_key(
    path: &Path,
    mut reader: impl Read,
    source: &PassphraseSource,
) -> Result<RsaPrivateKey> {
    let mut data = String::new();
    reader
        .read_to_string(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    if data.contains("ENCRYPTED") {
        let passphrase = source.acquire()?;

        RsaPrivateKey::from_pkcs8_encrypted_pem(&data, passphrase).map_err(Error::LoadKeyEncrypted)
    } else {
        RsaPrivateKey::from_pkcs8_pem(&data).map_err(Error::LoadKeyUnencrypted)
    }
}

/// Read PEM-encoded PKCS8 private key from a file.
pub fn read_pem_key_file(path: &Path, source: &PassphraseSource) -> Result<RsaPrivateKey> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_pem_key(path, reader, source)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use assert_matches::assert_matches;

    use super::*;

    const KEY: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/keys/TEST_KEY_DO_NOT_USE_other.pem",
    ));
    const KEY_ENCRYPTED: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/keys/TEST_KEY_DO_NOT_USE_other_encrypted.pem",
    ));

    #[test]
    fn sign_and_verify() {
        let key = read_pem_key(Path::new("key"), KEY.as_bytes(), &PassphraseSource::None).unwrap();

        for algo in [
            SignatureAlgorithm::Sha256WithRsa,
            SignatureAlgorithm::Sha512WithRsa,
        ] {
            let digest = algo.hash(b"payload");
            let signature = sign(&key, algo, &digest).unwrap();
            assert_eq!(signature, sign(&key, algo, &digest).unwrap());

            let public_key = key.to_public_key();
            public_key.verify_sig(algo, &digest, &signature).unwrap();

            let other = algo.hash(b"other payload");
            assert_matches!(
                public_key.verify_sig(algo, &other, &signature),
                Err(Error::RsaVerify(_))
            );
        }
    }

    #[test]
    fn hash_parts_matches_contiguous() {
        let algo = SignatureAlgorithm::Sha512WithRsa;
        assert_eq!(algo.hash_parts(&[b"ab", b"", b"cd"]), algo.hash(b"abcd"));
    }

    #[test]
    fn encrypted_key_needs_passphrase() {
        let path = Path::new("key");

        assert_matches!(
            read_pem_key(path, KEY_ENCRYPTED.as_bytes(), &PassphraseSource::None),
            Err(Error::PassphraseRequired)
        );

        let pass_file = Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/keys/TEST_KEY_DO_NOT_USE_other.passphrase",
        ));
        let source = PassphraseSource::File(pass_file.to_owned());
        let encrypted = read_pem_key(path, KEY_ENCRYPTED.as_bytes(), &source).unwrap();
        let plain = read_pem_key(path, KEY.as_bytes(), &PassphraseSource::None).unwrap();

        assert_eq!(encrypted, plain);
    }
}
