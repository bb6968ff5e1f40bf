// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt,
    hash::{Hash, Hasher},
    io::{self, Cursor, Read, Seek, Write},
};

use bstr::ByteSlice;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_bigint_dig::{ModInverse, ToBigInt};
use num_traits::{One, ToPrimitive};
use ring::digest::{Algorithm, Context};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey, traits::PublicKeyParts};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

use crate::{
    crypto::{self, SignatureAlgorithm},
    format::padding,
    stream::{
        self, CountingReader, FromReader, ReadDiscardExt, ReadFixedSizeExt, ReadStringExt,
        ToWriter, WriteStringExt, WriteZerosExt,
    },
    util,
};

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 0;

pub const FOOTER_VERSION_MAJOR: u32 = 1;
pub const FOOTER_VERSION_MINOR: u32 = 0;

pub const HEADER_MAGIC: [u8; 4] = *b"AVB0";
pub const FOOTER_MAGIC: [u8; 4] = *b"AVBf";

/// Maximum size of the header plus the authentication and auxiliary blocks.
/// This is the same limit as what avbtool enforces. This value is also used as
/// the limit for individual descriptor fields to allow for early fail.
pub const HEADER_MAX_SIZE: u64 = 64 * 1024;

/// Size of the tag and length fields that precede every descriptor body.
pub const DESCRIPTOR_HEADER_SIZE: usize = 16;

/// The only RSA public exponent that AVB supports.
pub const RSA_EXPONENT: u32 = 65537;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Could not read {0:?}: {1}")]
    ReadFieldError(&'static str, io::Error),
    #[error("Could not write {0:?}: {1}")]
    WriteFieldError(&'static str, io::Error),
    #[error("{0:?} is missing its NULL terminator")]
    StringNotNullTerminated(&'static str),
    #[error("{0:?} contains non-ASCII characters: {1:?}")]
    StringNotAscii(&'static str, String),
    #[error("vbmeta image is larger than {HEADER_MAX_SIZE} bytes")]
    HeaderTooLarge,
    #[error("Descriptor has unconsumed data beyond its padding")]
    PaddingTooLong,
    #[error("Padding after {0:?} is not zero")]
    PaddingNotZero(&'static str),
    #[error("{0:?} exceeds the bounds of its container")]
    FieldOutOfBounds(&'static str),
    #[error("{0:?} field is negative when interpreted as a signed integer: {1:#x}")]
    NegativeLength(&'static str, u64),
    #[error("Descriptor size is not a multiple of 8: {0}")]
    UnalignedDescriptor(u64),
    #[error("Bad vbmeta header magic: {0:?}")]
    InvalidHeaderMagic([u8; 4]),
    #[error("Bad vbmeta footer magic: {0:?}")]
    InvalidFooterMagic([u8; 4]),
    #[error("Public exponent must be {RSA_EXPONENT}, not {0}")]
    UnsupportedRsaPublicExponent(BigUint),
    #[error("Invalid RSA public key: bad {0:?}")]
    InvalidPublicKey(&'static str),
    #[error("Unsupported signing algorithm: {0:?}")]
    UnsupportedAlgorithm(AlgorithmType),
    #[error("Unsupported digest algorithm: {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("Cannot sign with algorithm type NONE")]
    SigningWithoutAlgorithm,
    #[error("{0}-bit RSA key is not compatible with any AVB signing algorithm")]
    UnsupportedKey(usize),
    #[error("Block size must be non-zero")]
    ZeroBlockSize,
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("RSA error")]
    Rsa(#[from] rsa::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Reject 64-bit length fields that would be negative if interpreted as a
/// signed integer, then apply the descriptor field size limit.
fn check_len_u64(field: &'static str, value: u64) -> Result<usize> {
    if i64::try_from(value).is_err() {
        return Err(Error::NegativeLength(field, value));
    } else if value > HEADER_MAX_SIZE {
        return Err(Error::FieldOutOfBounds(field));
    }

    Ok(value as usize)
}

/// Same as [`check_len_u64`], but for 32-bit length fields.
fn check_len_u32(field: &'static str, value: u32) -> Result<usize> {
    if i32::try_from(value).is_err() {
        return Err(Error::NegativeLength(field, value.into()));
    } else if u64::from(value) > HEADER_MAX_SIZE {
        return Err(Error::FieldOutOfBounds(field));
    }

    Ok(value as usize)
}

/// Reject 64-bit size or offset fields that would be negative if interpreted
/// as a signed integer. Unlike [`check_len_u64`], no upper limit is applied
/// because these describe partition contents.
fn check_non_negative(field: &'static str, value: u64) -> Result<u64> {
    if i64::try_from(value).is_err() {
        return Err(Error::NegativeLength(field, value));
    }

    Ok(value)
}

/// Apply the descriptor field size limit to a length that is about to be
/// written.
fn check_write_len(field: &'static str, len: usize) -> Result<()> {
    if len as u64 > HEADER_MAX_SIZE {
        return Err(Error::FieldOutOfBounds(field));
    }

    Ok(())
}

fn read_null_terminator(mut reader: impl Read, field: &'static str) -> Result<()> {
    let [byte] = reader
        .read_array_exact::<1>()
        .map_err(|e| Error::ReadFieldError(field, e))?;
    if byte != b'\0' {
        return Err(Error::StringNotNullTerminated(field));
    }

    Ok(())
}

/// Digest algorithm names live in a fixed size, NULL-padded field.
const HASH_ALGORITHM_FIELD_SIZE: usize = 32;

fn read_hash_algorithm(mut reader: impl Read) -> Result<String> {
    let name = reader
        .read_string_padded(HASH_ALGORITHM_FIELD_SIZE)
        .map_err(|e| Error::ReadFieldError("hash_algorithm", e))?;
    if !name.is_ascii() {
        return Err(Error::StringNotAscii("hash_algorithm", name));
    }

    Ok(name)
}

fn write_hash_algorithm(mut writer: impl Write, name: &str) -> Result<()> {
    if !name.is_ascii() {
        return Err(Error::StringNotAscii("hash_algorithm", name.to_owned()));
    }

    writer
        .write_string_padded(name, HASH_ALGORITHM_FIELD_SIZE)
        .map_err(|e| Error::WriteFieldError("hash_algorithm", e))
}

/// Fields that hash and hash tree descriptors share after the digest
/// algorithm name: three lengths, the flags, the reserved area and then the
/// variable length data.
struct DigestFields {
    partition_name: String,
    salt: Vec<u8>,
    root_digest: Vec<u8>,
    flags: u32,
    reserved: [u8; 60],
}

impl<R: Read> FromReader<R> for DigestFields {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let mut lens = [0usize; 3];
        for (len, field) in lens
            .iter_mut()
            .zip(["partition_name_len", "salt_len", "root_digest_len"])
        {
            *len = check_len_u32(field, reader.read_u32::<BigEndian>()?)?;
        }
        let [partition_name_len, salt_len, root_digest_len] = lens;

        let flags = reader.read_u32::<BigEndian>()?;
        let reserved = reader.read_array_exact::<60>()?;

        // The name has no NULL terminator.
        let partition_name = reader
            .read_string_exact(partition_name_len)
            .map_err(|e| Error::ReadFieldError("partition_name", e))?;
        let salt = reader
            .read_vec_exact(salt_len)
            .map_err(|e| Error::ReadFieldError("salt", e))?;
        let root_digest = reader
            .read_vec_exact(root_digest_len)
            .map_err(|e| Error::ReadFieldError("root_digest", e))?;

        Ok(Self {
            partition_name,
            salt,
            root_digest,
            flags,
            reserved,
        })
    }
}

fn write_digest_fields(
    mut writer: impl Write,
    partition_name: &str,
    salt: &[u8],
    root_digest: &[u8],
    flags: u32,
    reserved: &[u8; 60],
) -> Result<()> {
    let fields = [
        ("partition_name_len", partition_name.as_bytes()),
        ("salt_len", salt),
        ("root_digest_len", root_digest),
    ];

    for (name, data) in fields {
        check_write_len(name, data.len())?;
    }
    for (_, data) in fields {
        writer.write_u32::<BigEndian>(data.len() as u32)?;
    }
    writer.write_u32::<BigEndian>(flags)?;
    writer.write_all(reserved)?;
    for (_, data) in fields {
        writer.write_all(data)?;
    }

    Ok(())
}

pub(crate) fn ring_algorithm(name: &str) -> Result<&'static Algorithm> {
    match name {
        "sha1" => Ok(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY),
        "sha256" => Ok(&ring::digest::SHA256),
        "sha512" => Ok(&ring::digest::SHA512),
        a => Err(Error::UnsupportedHashAlgorithm(a.to_owned())),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub enum AlgorithmType {
    None,
    Sha256Rsa2048,
    Sha256Rsa4096,
    Sha256Rsa8192,
    Sha512Rsa2048,
    Sha512Rsa4096,
    Sha512Rsa8192,
    #[serde(untagged)]
    Unknown(u32),
}

impl AlgorithmType {
    pub fn from_raw(value: u32) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Sha256Rsa2048,
            2 => Self::Sha256Rsa4096,
            3 => Self::Sha256Rsa8192,
            4 => Self::Sha512Rsa2048,
            5 => Self::Sha512Rsa4096,
            6 => Self::Sha512Rsa8192,
            v => Self::Unknown(v),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Sha256Rsa2048 => 1,
            Self::Sha256Rsa4096 => 2,
            Self::Sha256Rsa8192 => 3,
            Self::Sha512Rsa2048 => 4,
            Self::Sha512Rsa4096 => 5,
            Self::Sha512Rsa8192 => 6,
            Self::Unknown(v) => v,
        }
    }

    /// Find the algorithm that uses the specified digest family and RSA key
    /// size.
    pub fn for_key(family: SignatureAlgorithm, key_bits: usize) -> Option<Self> {
        let algo = match (family, key_bits) {
            (SignatureAlgorithm::Sha256WithRsa, 2048) => Self::Sha256Rsa2048,
            (SignatureAlgorithm::Sha256WithRsa, 4096) => Self::Sha256Rsa4096,
            (SignatureAlgorithm::Sha256WithRsa, 8192) => Self::Sha256Rsa8192,
            (SignatureAlgorithm::Sha512WithRsa, 2048) => Self::Sha512Rsa2048,
            (SignatureAlgorithm::Sha512WithRsa, 4096) => Self::Sha512Rsa4096,
            (SignatureAlgorithm::Sha512WithRsa, 8192) => Self::Sha512Rsa8192,
            _ => return None,
        };

        Some(algo)
    }

    pub fn to_signature_algorithm(self) -> Option<SignatureAlgorithm> {
        match self {
            Self::Sha256Rsa2048 | Self::Sha256Rsa4096 | Self::Sha256Rsa8192 => {
                Some(SignatureAlgorithm::Sha256WithRsa)
            }
            Self::Sha512Rsa2048 | Self::Sha512Rsa4096 | Self::Sha512Rsa8192 => {
                Some(SignatureAlgorithm::Sha512WithRsa)
            }
            _ => None,
        }
    }

    pub fn key_bits(self) -> usize {
        match self {
            Self::None | Self::Unknown(_) => 0,
            Self::Sha256Rsa2048 | Self::Sha512Rsa2048 => 2048,
            Self::Sha256Rsa4096 | Self::Sha512Rsa4096 => 4096,
            Self::Sha256Rsa8192 | Self::Sha512Rsa8192 => 8192,
        }
    }

    pub fn digest_len(self) -> usize {
        self.to_signature_algorithm()
            .map(|a| a.digest_len())
            .unwrap_or_default()
    }

    pub fn signature_len(self) -> usize {
        self.key_bits() / 8
    }

    pub fn public_key_len(self) -> usize {
        match self.key_bits() {
            0 => 0,
            bits => PublicKey::encoded_len(bits),
        }
    }

    /// Size of the authentication block: the digest and signature, padded to
    /// a 64-byte boundary.
    pub fn auth_block_len(self) -> usize {
        let size = self.digest_len() + self.signature_len();
        size + padding::calc(size, 64)
    }
}

trait DescriptorTag {
    const TAG: u64;
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct PropertyDescriptor {
    pub key: String,
    #[serde(with = "hex")]
    pub value: Vec<u8>,
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("key", &self.key)
            .field("value", &self.value.as_bstr())
            .finish()
    }
}

impl DescriptorTag for PropertyDescriptor {
    const TAG: u64 = 0;
}

impl<R: Read> FromReader<R> for PropertyDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let key_size = check_len_u64("key_size", reader.read_u64::<BigEndian>()?)?;
        let value_size = check_len_u64("value_size", reader.read_u64::<BigEndian>()?)?;

        let key = reader
            .read_string_exact(key_size)
            .map_err(|e| Error::ReadFieldError("key", e))?;
        read_null_terminator(&mut reader, "key")?;

        // Values are arbitrary bytes, but are terminated like strings.
        let value = reader
            .read_vec_exact(value_size)
            .map_err(|e| Error::ReadFieldError("value", e))?;
        read_null_terminator(&mut reader, "value")?;

        Ok(Self { key, value })
    }
}

impl<W: Write> ToWriter<W> for PropertyDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        check_write_len("key_size", self.key.len())?;
        check_write_len("value_size", self.value.len())?;

        writer.write_u64::<BigEndian>(self.key.len() as u64)?;
        writer.write_u64::<BigEndian>(self.value.len() as u64)?;
        for data in [self.key.as_bytes(), self.value.as_slice()] {
            writer.write_all(data)?;
            writer.write_u8(0)?;
        }

        Ok(())
    }
}

/// Descriptor for a dm-verity protected partition. These are only parsed and
/// written back out. The hash tree itself is never verified.
#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct HashTreeDescriptor {
    pub dm_verity_version: u32,
    pub image_size: u64,
    pub tree_offset: u64,
    pub tree_size: u64,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub fec_num_roots: u32,
    pub fec_offset: u64,
    pub fec_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
    #[serde(with = "hex")]
    pub root_digest: Vec<u8>,
    pub flags: u32,
    #[serde(with = "hex")]
    pub reserved: [u8; 60],
}

impl fmt::Debug for HashTreeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTreeDescriptor")
            .field("dm_verity_version", &self.dm_verity_version)
            .field("image_size", &self.image_size)
            .field("tree_offset", &self.tree_offset)
            .field("tree_size", &self.tree_size)
            .field("data_block_size", &self.data_block_size)
            .field("hash_block_size", &self.hash_block_size)
            .field("fec_num_roots", &self.fec_num_roots)
            .field("fec_offset", &self.fec_offset)
            .field("fec_size", &self.fec_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("partition_name", &self.partition_name)
            .field("salt", &hex::encode(&self.salt))
            .field("root_digest", &hex::encode(&self.root_digest))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl HashTreeDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;
    pub const FLAG_CHECK_AT_MOST_ONCE: u32 = 1 << 1;
}

impl DescriptorTag for HashTreeDescriptor {
    const TAG: u64 = 1;
}

impl<R: Read> FromReader<R> for HashTreeDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let dm_verity_version = reader.read_u32::<BigEndian>()?;
        let image_size = check_non_negative("image_size", reader.read_u64::<BigEndian>()?)?;
        let tree_offset = check_non_negative("tree_offset", reader.read_u64::<BigEndian>()?)?;
        let tree_size = check_non_negative("tree_size", reader.read_u64::<BigEndian>()?)?;
        let data_block_size = reader.read_u32::<BigEndian>()?;
        let hash_block_size = reader.read_u32::<BigEndian>()?;
        let fec_num_roots = reader.read_u32::<BigEndian>()?;
        let fec_offset = check_non_negative("fec_offset", reader.read_u64::<BigEndian>()?)?;
        let fec_size = check_non_negative("fec_size", reader.read_u64::<BigEndian>()?)?;
        let hash_algorithm = read_hash_algorithm(&mut reader)?;
        let tail = DigestFields::from_reader(&mut reader)?;

        Ok(Self {
            dm_verity_version,
            image_size,
            tree_offset,
            tree_size,
            data_block_size,
            hash_block_size,
            fec_num_roots,
            fec_offset,
            fec_size,
            hash_algorithm,
            partition_name: tail.partition_name,
            salt: tail.salt,
            root_digest: tail.root_digest,
            flags: tail.flags,
            reserved: tail.reserved,
        })
    }
}

impl<W: Write> ToWriter<W> for HashTreeDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.dm_verity_version)?;
        for value in [self.image_size, self.tree_offset, self.tree_size] {
            writer.write_u64::<BigEndian>(value)?;
        }
        for value in [self.data_block_size, self.hash_block_size, self.fec_num_roots] {
            writer.write_u32::<BigEndian>(value)?;
        }
        for value in [self.fec_offset, self.fec_size] {
            writer.write_u64::<BigEndian>(value)?;
        }
        write_hash_algorithm(&mut writer, &self.hash_algorithm)?;

        write_digest_fields(
            writer,
            &self.partition_name,
            &self.salt,
            &self.root_digest,
            self.flags,
            &self.reserved,
        )
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct HashDescriptor {
    pub image_size: u64,
    pub hash_algorithm: String,
    pub partition_name: String,
    #[serde(with = "hex")]
    pub salt: Vec<u8>,
    #[serde(with = "hex")]
    pub root_digest: Vec<u8>,
    pub flags: u32,
    #[serde(with = "hex")]
    pub reserved: [u8; 60],
}

impl fmt::Debug for HashDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashDescriptor")
            .field("image_size", &self.image_size)
            .field("hash_algorithm", &self.hash_algorithm)
            .field("partition_name", &self.partition_name)
            .field("salt", &hex::encode(&self.salt))
            .field("root_digest", &hex::encode(&self.root_digest))
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl HashDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;

    /// Compute `digest(salt || data[..size])` with the descriptor's hash
    /// algorithm. The reader must be positioned at the start of the data.
    pub fn calculate(&self, reader: impl Read, size: u64) -> Result<Vec<u8>> {
        let algorithm = ring_algorithm(&self.hash_algorithm)?;
        let mut context = Context::new(algorithm);
        context.update(&self.salt);

        stream::copy_n_inspect(reader, io::sink(), size, |data| context.update(data))?;

        Ok(context.finish().as_ref().to_vec())
    }
}

impl DescriptorTag for HashDescriptor {
    const TAG: u64 = 2;
}

impl<R: Read> FromReader<R> for HashDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let image_size = check_non_negative("image_size", reader.read_u64::<BigEndian>()?)?;
        let hash_algorithm = read_hash_algorithm(&mut reader)?;
        let tail = DigestFields::from_reader(&mut reader)?;

        Ok(Self {
            image_size,
            hash_algorithm,
            partition_name: tail.partition_name,
            salt: tail.salt,
            root_digest: tail.root_digest,
            flags: tail.flags,
            reserved: tail.reserved,
        })
    }
}

impl<W: Write> ToWriter<W> for HashDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_u64::<BigEndian>(self.image_size)?;
        write_hash_algorithm(&mut writer, &self.hash_algorithm)?;

        write_digest_fields(
            writer,
            &self.partition_name,
            &self.salt,
            &self.root_digest,
            self.flags,
            &self.reserved,
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct KernelCmdlineDescriptor {
    pub flags: u32,
    pub cmdline: String,
}

impl KernelCmdlineDescriptor {
    pub const FLAG_USE_ONLY_IF_HASHTREE_NOT_DISABLED: u32 = 1 << 0;
    pub const FLAG_USE_ONLY_IF_HASHTREE_DISABLED: u32 = 1 << 1;
}

impl DescriptorTag for KernelCmdlineDescriptor {
    const TAG: u64 = 3;
}

impl<R: Read> FromReader<R> for KernelCmdlineDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let flags = reader.read_u32::<BigEndian>()?;
        let cmdline_len = check_len_u32("cmdline_len", reader.read_u32::<BigEndian>()?)?;

        let cmdline = reader
            .read_string_exact(cmdline_len)
            .map_err(|e| Error::ReadFieldError("cmdline", e))?;

        Ok(Self { flags, cmdline })
    }
}

impl<W: Write> ToWriter<W> for KernelCmdlineDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        check_write_len("cmdline_len", self.cmdline.len())?;

        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_u32::<BigEndian>(self.cmdline.len() as u32)?;
        writer.write_all(self.cmdline.as_bytes())?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct ChainPartitionDescriptor {
    pub rollback_index_location: u32,
    pub partition_name: String,
    pub public_key: PublicKey,
    pub flags: u32,
    #[serde(with = "hex")]
    pub reserved: [u8; 60],
}

impl ChainPartitionDescriptor {
    pub const FLAG_DO_NOT_USE_AB: u32 = 1 << 0;
}

impl fmt::Debug for ChainPartitionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainPartitionDescriptor")
            .field("rollback_index_location", &self.rollback_index_location)
            .field("partition_name", &self.partition_name)
            .field("public_key", &self.public_key)
            .field("flags", &self.flags)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl DescriptorTag for ChainPartitionDescriptor {
    const TAG: u64 = 4;
}

impl<R: Read> FromReader<R> for ChainPartitionDescriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let rollback_index_location = reader.read_u32::<BigEndian>()?;
        let partition_name_len =
            check_len_u32("partition_name_len", reader.read_u32::<BigEndian>()?)?;
        let public_key_len = check_len_u32("public_key_len", reader.read_u32::<BigEndian>()?)?;
        let flags = reader.read_u32::<BigEndian>()?;
        let reserved = reader.read_array_exact::<60>()?;

        let partition_name = reader
            .read_string_exact(partition_name_len)
            .map_err(|e| Error::ReadFieldError("partition_name", e))?;
        let public_key = reader
            .read_vec_exact(public_key_len)
            .map_err(|e| Error::ReadFieldError("public_key", e))
            .and_then(|data| PublicKey::decode(&data))?;

        Ok(Self {
            rollback_index_location,
            partition_name,
            public_key,
            flags,
            reserved,
        })
    }
}

impl<W: Write> ToWriter<W> for ChainPartitionDescriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        check_write_len("partition_name_len", self.partition_name.len())?;

        let public_key_raw = self.public_key.encode()?;

        writer.write_u32::<BigEndian>(self.rollback_index_location)?;
        writer.write_u32::<BigEndian>(self.partition_name.len() as u32)?;
        writer.write_u32::<BigEndian>(public_key_raw.len() as u32)?;
        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_all(&self.reserved)?;
        writer.write_all(self.partition_name.as_bytes())?;
        writer.write_all(&public_key_raw)?;

        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum Descriptor {
    Property(PropertyDescriptor),
    HashTree(HashTreeDescriptor),
    Hash(HashDescriptor),
    KernelCmdline(KernelCmdlineDescriptor),
    ChainPartition(ChainPartitionDescriptor),
    /// Descriptor with an unrecognized tag. `data` is the entire body,
    /// including padding, so its length must be a multiple of 8.
    Unknown {
        tag: u64,
        #[serde(with = "hex")]
        data: Vec<u8>,
    },
}

impl Descriptor {
    /// Value of the descriptor's tag field.
    pub fn tag(&self) -> u64 {
        match self {
            Self::Property(_) => PropertyDescriptor::TAG,
            Self::HashTree(_) => HashTreeDescriptor::TAG,
            Self::Hash(_) => HashDescriptor::TAG,
            Self::KernelCmdline(_) => KernelCmdlineDescriptor::TAG,
            Self::ChainPartition(_) => ChainPartitionDescriptor::TAG,
            Self::Unknown { tag, .. } => *tag,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Property(_) => "Property",
            Self::HashTree(_) => "HashTree",
            Self::Hash(_) => "Hash",
            Self::KernelCmdline(_) => "KernelCmdline",
            Self::ChainPartition(_) => "ChainPartition",
            Self::Unknown { .. } => "Unknown",
        }
    }

    pub fn partition_name(&self) -> Option<&str> {
        match self {
            Self::HashTree(d) => Some(&d.partition_name),
            Self::Hash(d) => Some(&d.partition_name),
            Self::ChainPartition(d) => Some(&d.partition_name),
            _ => None,
        }
    }

    /// Parse a list of descriptors. Records are consumed until fewer than
    /// [`DESCRIPTOR_HEADER_SIZE`] bytes remain.
    pub fn read_all(data: &[u8]) -> Result<Vec<Self>> {
        let mut reader = Cursor::new(data);
        let mut descriptors = vec![];

        while data.len() - reader.position() as usize >= DESCRIPTOR_HEADER_SIZE {
            descriptors.push(Self::from_reader(&mut reader)?);
        }

        Ok(descriptors)
    }

    /// Serialize a list of descriptors back to back.
    pub fn write_all(descriptors: &[Self]) -> Result<Vec<u8>> {
        let mut writer = Cursor::new(Vec::new());

        for d in descriptors {
            d.to_writer(&mut writer)?;
        }

        Ok(writer.into_inner())
    }
}

impl<R: Read> FromReader<R> for Descriptor {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let tag = reader.read_u64::<BigEndian>()?;
        let nbf_raw = reader.read_u64::<BigEndian>()?;
        let nbf = check_len_u64("num_bytes_following", nbf_raw)?;

        // The descriptor data is always aligned to 8 bytes.
        if nbf % 8 != 0 {
            return Err(Error::UnalignedDescriptor(nbf_raw));
        }

        let body = reader
            .read_vec_exact(nbf)
            .map_err(|e| Error::ReadFieldError("descriptor_body", e))?;
        let mut inner_reader = CountingReader::new(Cursor::new(&body));

        let r = &mut inner_reader;
        let descriptor = match tag {
            PropertyDescriptor::TAG => Self::Property(PropertyDescriptor::from_reader(r)?),
            HashTreeDescriptor::TAG => Self::HashTree(HashTreeDescriptor::from_reader(r)?),
            HashDescriptor::TAG => Self::Hash(HashDescriptor::from_reader(r)?),
            KernelCmdlineDescriptor::TAG => {
                Self::KernelCmdline(KernelCmdlineDescriptor::from_reader(r)?)
            }
            ChainPartitionDescriptor::TAG => {
                Self::ChainPartition(ChainPartitionDescriptor::from_reader(r)?)
            }
            // Kept as-is so that the image can be written back unchanged.
            _ => Self::Unknown {
                tag,
                data: r.read_vec_exact(nbf)?,
            },
        };

        let consumed = inner_reader.stream_position()? as usize;
        padding::read_discard(&mut inner_reader, 8)?;
        if inner_reader.stream_position()? != nbf as u64 {
            return Err(Error::PaddingTooLong);
        } else if !util::is_zero(&body[consumed..]) {
            return Err(Error::PaddingNotZero("descriptor"));
        }

        Ok(descriptor)
    }
}

impl<W: Write> ToWriter<W> for Descriptor {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        let mut body = Cursor::new(Vec::new());

        match self {
            Self::Property(d) => d.to_writer(&mut body)?,
            Self::HashTree(d) => d.to_writer(&mut body)?,
            Self::Hash(d) => d.to_writer(&mut body)?,
            Self::KernelCmdline(d) => d.to_writer(&mut body)?,
            Self::ChainPartition(d) => d.to_writer(&mut body)?,
            Self::Unknown { data, .. } => {
                if data.len() % 8 != 0 {
                    return Err(Error::UnalignedDescriptor(data.len() as u64));
                }
                body.write_all(data)?;
            }
        }

        let inner_data = body.into_inner();
        let padding_len = padding::calc(inner_data.len(), 8);
        let nbf = inner_data.len() + padding_len;
        check_write_len("num_bytes_following", nbf)?;

        writer.write_u64::<BigEndian>(self.tag())?;
        writer.write_u64::<BigEndian>(nbf as u64)?;
        writer.write_all(&inner_data)?;
        writer.write_zeros_exact(padding_len as u64)?;

        Ok(())
    }
}

/// The fixed-size vbmeta header. The offsets locate the digest and signature
/// within the authentication block and the descriptors, public key, and public
/// key metadata within the auxiliary block.
#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Header {
    pub required_libavb_version_major: u32,
    pub required_libavb_version_minor: u32,
    pub authentication_data_block_size: u64,
    pub auxiliary_data_block_size: u64,
    pub algorithm_type: AlgorithmType,
    pub hash_offset: u64,
    pub hash_size: u64,
    pub signature_offset: u64,
    pub signature_size: u64,
    pub public_key_offset: u64,
    pub public_key_size: u64,
    pub public_key_metadata_offset: u64,
    pub public_key_metadata_size: u64,
    pub descriptors_offset: u64,
    pub descriptors_size: u64,
    pub rollback_index: u64,
    pub flags: u32,
    pub rollback_index_location: u32,
    pub release_string: String,
    #[serde(with = "hex")]
    pub reserved: [u8; 80],
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field(
                "required_libavb_version_major",
                &self.required_libavb_version_major,
            )
            .field(
                "required_libavb_version_minor",
                &self.required_libavb_version_minor,
            )
            .field(
                "authentication_data_block_size",
                &self.authentication_data_block_size,
            )
            .field("auxiliary_data_block_size", &self.auxiliary_data_block_size)
            .field("algorithm_type", &self.algorithm_type)
            .field("hash_offset", &self.hash_offset)
            .field("hash_size", &self.hash_size)
            .field("signature_offset", &self.signature_offset)
            .field("signature_size", &self.signature_size)
            .field("public_key_offset", &self.public_key_offset)
            .field("public_key_size", &self.public_key_size)
            .field(
                "public_key_metadata_offset",
                &self.public_key_metadata_offset,
            )
            .field("public_key_metadata_size", &self.public_key_metadata_size)
            .field("descriptors_offset", &self.descriptors_offset)
            .field("descriptors_size", &self.descriptors_size)
            .field("rollback_index", &self.rollback_index)
            .field("flags", &self.flags)
            .field("rollback_index_location", &self.rollback_index_location)
            .field("release_string", &self.release_string)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            required_libavb_version_major: VERSION_MAJOR,
            required_libavb_version_minor: VERSION_MINOR,
            authentication_data_block_size: 0,
            auxiliary_data_block_size: 0,
            algorithm_type: AlgorithmType::None,
            hash_offset: 0,
            hash_size: 0,
            signature_offset: 0,
            signature_size: 0,
            public_key_offset: 0,
            public_key_size: 0,
            public_key_metadata_offset: 0,
            public_key_metadata_size: 0,
            descriptors_offset: 0,
            descriptors_size: 0,
            rollback_index: 0,
            flags: 0,
            rollback_index_location: 0,
            release_string: format!("avbchain {}", env!("CARGO_PKG_VERSION")),
            reserved: [0u8; 80],
        }
    }
}

impl Header {
    pub const SIZE: usize = 256;

    pub const FLAG_HASHTREE_DISABLED: u32 = 1 << 0;
    pub const FLAG_VERIFICATION_DISABLED: u32 = 1 << 1;
}

impl<R: Read> FromReader<R> for Header {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let magic = reader.read_array_exact::<4>()?;
        if magic != HEADER_MAGIC {
            return Err(Error::InvalidHeaderMagic(magic));
        }

        let required_libavb_version_major = reader.read_u32::<BigEndian>()?;
        let required_libavb_version_minor = reader.read_u32::<BigEndian>()?;

        let mut read_len = |field: &'static str| -> Result<u64> {
            check_len_u64(field, reader.read_u64::<BigEndian>()?).map(|v| v as u64)
        };

        let authentication_data_block_size = read_len("authentication_data_block_size")?;
        let auxiliary_data_block_size = read_len("auxiliary_data_block_size")?;

        let algorithm_type = AlgorithmType::from_raw(reader.read_u32::<BigEndian>()?);

        let mut read_len = |field: &'static str| -> Result<u64> {
            check_len_u64(field, reader.read_u64::<BigEndian>()?).map(|v| v as u64)
        };

        let hash_offset = read_len("hash_offset")?;
        let hash_size = read_len("hash_size")?;
        let signature_offset = read_len("signature_offset")?;
        let signature_size = read_len("signature_size")?;
        let public_key_offset = read_len("public_key_offset")?;
        let public_key_size = read_len("public_key_size")?;
        let public_key_metadata_offset = read_len("public_key_metadata_offset")?;
        let public_key_metadata_size = read_len("public_key_metadata_size")?;
        let descriptors_offset = read_len("descriptors_offset")?;
        let descriptors_size = read_len("descriptors_size")?;

        let rollback_index = reader.read_u64::<BigEndian>()?;
        let flags = reader.read_u32::<BigEndian>()?;
        let rollback_index_location = reader.read_u32::<BigEndian>()?;

        let release_string = reader
            .read_string_padded(48)
            .map_err(|e| Error::ReadFieldError("release_string", e))?;

        let reserved = reader.read_array_exact::<80>()?;

        let header = Self {
            required_libavb_version_major,
            required_libavb_version_minor,
            authentication_data_block_size,
            auxiliary_data_block_size,
            algorithm_type,
            hash_offset,
            hash_size,
            signature_offset,
            signature_size,
            public_key_offset,
            public_key_size,
            public_key_metadata_offset,
            public_key_metadata_size,
            descriptors_offset,
            descriptors_size,
            rollback_index,
            flags,
            rollback_index_location,
            release_string,
            reserved,
        };

        Ok(header)
    }
}

impl<W: Write> ToWriter<W> for Header {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_all(&HEADER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.required_libavb_version_major)?;
        writer.write_u32::<BigEndian>(self.required_libavb_version_minor)?;
        writer.write_u64::<BigEndian>(self.authentication_data_block_size)?;
        writer.write_u64::<BigEndian>(self.auxiliary_data_block_size)?;
        writer.write_u32::<BigEndian>(self.algorithm_type.to_raw())?;
        writer.write_u64::<BigEndian>(self.hash_offset)?;
        writer.write_u64::<BigEndian>(self.hash_size)?;
        writer.write_u64::<BigEndian>(self.signature_offset)?;
        writer.write_u64::<BigEndian>(self.signature_size)?;
        writer.write_u64::<BigEndian>(self.public_key_offset)?;
        writer.write_u64::<BigEndian>(self.public_key_size)?;
        writer.write_u64::<BigEndian>(self.public_key_metadata_offset)?;
        writer.write_u64::<BigEndian>(self.public_key_metadata_size)?;
        writer.write_u64::<BigEndian>(self.descriptors_offset)?;
        writer.write_u64::<BigEndian>(self.descriptors_size)?;
        writer.write_u64::<BigEndian>(self.rollback_index)?;
        writer.write_u32::<BigEndian>(self.flags)?;
        writer.write_u32::<BigEndian>(self.rollback_index_location)?;

        writer
            .write_string_padded(&self.release_string, 48)
            .map_err(|e| Error::WriteFieldError("release_string", e))?;

        writer.write_all(&self.reserved)?;

        Ok(())
    }
}

#[derive(Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct Footer {
    pub version_major: u32,
    pub version_minor: u32,
    pub original_image_size: u64,
    pub vbmeta_offset: u64,
    pub vbmeta_size: u64,
    #[serde(with = "hex")]
    pub reserved: [u8; 28],
}

impl fmt::Debug for Footer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Footer")
            .field("version_major", &self.version_major)
            .field("version_minor", &self.version_minor)
            .field("original_image_size", &self.original_image_size)
            .field("vbmeta_offset", &self.vbmeta_offset)
            .field("vbmeta_size", &self.vbmeta_size)
            .field("reserved", &hex::encode(self.reserved))
            .finish()
    }
}

impl Footer {
    pub const SIZE: usize = 64;

    pub fn new(original_image_size: u64) -> Self {
        Self {
            version_major: FOOTER_VERSION_MAJOR,
            version_minor: FOOTER_VERSION_MINOR,
            original_image_size,
            vbmeta_offset: 0,
            vbmeta_size: 0,
            reserved: [0u8; 28],
        }
    }

    /// Check that the footer only refers to data within a partition of the
    /// specified size.
    pub fn fits(&self, partition_size: u64) -> bool {
        self.original_image_size <= partition_size
            && self
                .vbmeta_offset
                .checked_add(self.vbmeta_size)
                .is_some_and(|end| end <= partition_size)
    }
}

impl<R: Read> FromReader<R> for Footer {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let magic = reader.read_array_exact::<4>()?;
        if magic != FOOTER_MAGIC {
            return Err(Error::InvalidFooterMagic(magic));
        }

        let version_major = reader.read_u32::<BigEndian>()?;
        let version_minor = reader.read_u32::<BigEndian>()?;
        let original_image_size =
            check_non_negative("original_image_size", reader.read_u64::<BigEndian>()?)?;
        let vbmeta_offset = check_non_negative("vbmeta_offset", reader.read_u64::<BigEndian>()?)?;
        let vbmeta_size = check_non_negative("vbmeta_size", reader.read_u64::<BigEndian>()?)?;

        let reserved = reader.read_array_exact::<28>()?;

        let footer = Self {
            version_major,
            version_minor,
            original_image_size,
            vbmeta_offset,
            vbmeta_size,
            reserved,
        };

        Ok(footer)
    }
}

impl<W: Write> ToWriter<W> for Footer {
    type Error = Error;

    fn to_writer(&self, mut writer: W) -> Result<()> {
        writer.write_all(&FOOTER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.version_major)?;
        writer.write_u32::<BigEndian>(self.version_minor)?;
        writer.write_u64::<BigEndian>(self.original_image_size)?;
        writer.write_u64::<BigEndian>(self.vbmeta_offset)?;
        writer.write_u64::<BigEndian>(self.vbmeta_size)?;
        writer.write_all(&self.reserved)?;
        Ok(())
    }
}

/// An RSA public key with the exponent 65537. Two keys are equal if their
/// moduli are equal.
#[derive(Clone, Eq, PartialEq)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    pub fn new(key: RsaPublicKey) -> Result<Self> {
        if key.e() != &BigUint::from(RSA_EXPONENT) {
            return Err(Error::UnsupportedRsaPublicExponent(key.e().clone()));
        }

        Ok(Self(key))
    }

    pub fn from_private_key(key: &RsaPrivateKey) -> Result<Self> {
        Self::new(key.to_public_key())
    }

    pub fn as_rsa(&self) -> &RsaPublicKey {
        &self.0
    }

    /// The modulus size rounded up to the next power of two.
    pub fn key_bits(&self) -> usize {
        self.0.n().bits().next_power_of_two()
    }

    /// Size of the AVB encoding of a key with the specified number of bits.
    pub fn encoded_len(key_bits: usize) -> usize {
        8 + 2 * key_bits / 8
    }

    /// Hex-encoded SHA256 digest of the AVB encoding. Used for identifying keys
    /// in log messages.
    pub fn fingerprint(&self) -> String {
        match self.encode() {
            Ok(data) => hex::encode(SignatureAlgorithm::Sha256WithRsa.hash(&data)),
            Err(_) => "<invalid>".to_owned(),
        }
    }

    /// Encode the key in the AVB binary format.
    pub fn encode(&self) -> Result<Vec<u8>> {
        // libavb expects certain values to be precomputed so that the
        // bootloader's verification operations can run faster.
        //
        // Values:
        //   n0inv = -1 / n[0] (mod 2 ^ 32)
        //     - Guaranteed to fit in a u32
        //   r = 2 ^ (modulus size in bits)
        //   rr = r^2 (mod N)
        //     - Guaranteed to fit in key size bits

        let n = self.0.n();
        let key_bits = self.key_bits();
        let key_bytes = key_bits / 8;

        let b = BigUint::one() << 32;
        let n0inv = n
            .mod_inverse(&b)
            .zip(b.to_bigint())
            .and_then(|(inv, b)| ((&b - inv) % &b).to_u32())
            .ok_or(Error::InvalidPublicKey("modulus"))?;
        let r = BigUint::one() << n.bits();
        let rrmodn = r.modpow(&BigUint::from(2u32), n);

        let key_bits_raw = key_bits
            .to_u32()
            .ok_or(Error::InvalidPublicKey("key_bits"))?;

        let mut data = Vec::with_capacity(Self::encoded_len(key_bits));
        data.extend_from_slice(&key_bits_raw.to_be_bytes());
        data.extend_from_slice(&n0inv.to_be_bytes());

        let modulus_raw = n.to_bytes_be();
        data.resize(data.len() + key_bytes - modulus_raw.len(), 0);
        data.extend_from_slice(&modulus_raw);

        let rrmodn_raw = rrmodn.to_bytes_be();
        data.resize(data.len() + key_bytes - rrmodn_raw.len(), 0);
        data.extend_from_slice(&rrmodn_raw);

        Ok(data)
    }

    /// Decode a key from the AVB binary format.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(data);
        let key_bits = check_len_u32("key_bits", reader.read_u32::<BigEndian>()?)?;

        if key_bits == 0 || key_bits % 8 != 0 || key_bits > crypto::MAX_KEY_BITS {
            return Err(Error::InvalidPublicKey("key_bits"));
        } else if data.len() != Self::encoded_len(key_bits) {
            return Err(Error::InvalidPublicKey("length"));
        }

        // Skip n0inv. It is derived from the modulus.
        reader.read_discard_exact(4)?;

        let modulus_raw = reader.read_vec_exact(key_bits / 8)?;
        let modulus = BigUint::from_bytes_be(&modulus_raw);

        let key = RsaPublicKey::new_with_max_size(
            modulus,
            BigUint::from(RSA_EXPONENT),
            crypto::MAX_KEY_BITS,
        )?;

        Ok(Self(key))
    }
}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.n().to_bytes_be().hash(state);
        self.0.e().to_bytes_be().hash(state);
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("key_bits", &self.key_bits())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RSA{}:{}", self.key_bits(), self.fingerprint())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let data = self.encode().map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&hex::encode(data))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let data: Vec<u8> = hex::serde::deserialize(deserializer)?;
        Self::decode(&data).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;
    use pkcs8::DecodePrivateKey;

    use super::*;

    fn test_public_key() -> PublicKey {
        let data = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/keys/TEST_KEY_DO_NOT_USE_root.pem",
        ));
        let key = RsaPrivateKey::from_pkcs8_pem(data).unwrap();

        PublicKey::from_private_key(&key).unwrap()
    }

    fn round_trip_descriptor(descriptor: Descriptor) -> Vec<u8> {
        let mut writer = Cursor::new(Vec::new());
        descriptor.to_writer(&mut writer).unwrap();
        let data = writer.into_inner();
        assert_eq!(data.len() % 8, 0);

        let new_descriptor = Descriptor::from_reader(Cursor::new(&data)).unwrap();
        assert_eq!(new_descriptor, descriptor);

        data
    }

    #[test]
    fn round_trip_property_descriptor() {
        let data = round_trip_descriptor(Descriptor::Property(PropertyDescriptor {
            key: "com.android.build.boot.os_version".to_owned(),
            value: b"15\xff".to_vec(),
        }));
        // 16 + 16 + 33 + 1 + 3 + 1 = 70, padded to 72.
        assert_eq!(data.len(), 72);

        round_trip_descriptor(Descriptor::Property(PropertyDescriptor {
            key: String::new(),
            value: vec![],
        }));
    }

    #[test]
    fn round_trip_hash_descriptor() {
        round_trip_descriptor(Descriptor::Hash(HashDescriptor {
            image_size: 12345,
            hash_algorithm: "sha256".to_owned(),
            partition_name: "boot".to_owned(),
            salt: vec![0xaa; 32],
            root_digest: vec![0x55; 32],
            flags: HashDescriptor::FLAG_DO_NOT_USE_AB,
            reserved: [0xff; 60],
        }));

        round_trip_descriptor(Descriptor::Hash(HashDescriptor {
            image_size: 0,
            hash_algorithm: "sha512".to_owned(),
            partition_name: String::new(),
            salt: vec![],
            root_digest: vec![],
            flags: 0,
            reserved: [0u8; 60],
        }));
    }

    #[test]
    fn round_trip_hash_tree_descriptor() {
        round_trip_descriptor(Descriptor::HashTree(HashTreeDescriptor {
            dm_verity_version: 1,
            image_size: 4096 * 100,
            tree_offset: 4096 * 100,
            tree_size: 4096,
            data_block_size: 4096,
            hash_block_size: 4096,
            fec_num_roots: 2,
            fec_offset: 4096 * 101,
            fec_size: 8192,
            hash_algorithm: "sha1".to_owned(),
            partition_name: "system".to_owned(),
            salt: vec![1, 2, 3],
            root_digest: vec![4, 5, 6, 7, 8],
            flags: HashTreeDescriptor::FLAG_CHECK_AT_MOST_ONCE,
            reserved: [0x11; 60],
        }));
    }

    #[test]
    fn round_trip_kernel_cmdline_descriptor() {
        round_trip_descriptor(Descriptor::KernelCmdline(KernelCmdlineDescriptor {
            flags: KernelCmdlineDescriptor::FLAG_USE_ONLY_IF_HASHTREE_DISABLED,
            cmdline: "root=PARTUUID=$(ANDROID_SYSTEM_PARTUUID)".to_owned(),
        }));
    }

    #[test]
    fn round_trip_chain_partition_descriptor() {
        let data = round_trip_descriptor(Descriptor::ChainPartition(ChainPartitionDescriptor {
            rollback_index_location: 2,
            partition_name: "vbmeta_system".to_owned(),
            public_key: test_public_key(),
            flags: ChainPartitionDescriptor::FLAG_DO_NOT_USE_AB,
            reserved: [0u8; 60],
        }));
        // 16 + 16 + 60 + 13 + 520 = 625, padded to 632.
        assert_eq!(data.len(), 632);
    }

    #[test]
    fn round_trip_unknown_descriptor() {
        round_trip_descriptor(Descriptor::Unknown {
            tag: 0x1234,
            data: vec![0xab; 24],
        });

        let unaligned = Descriptor::Unknown {
            tag: 0x1234,
            data: vec![0xab; 21],
        };
        assert_matches!(
            unaligned.to_writer(Cursor::new(Vec::new())),
            Err(Error::UnalignedDescriptor(21))
        );
    }

    #[test]
    fn reject_negative_lengths() {
        let mut data = vec![];
        data.extend_from_slice(&PropertyDescriptor::TAG.to_be_bytes());
        data.extend_from_slice(&u64::MAX.to_be_bytes());

        assert_matches!(
            Descriptor::from_reader(Cursor::new(&data)),
            Err(Error::NegativeLength("num_bytes_following", u64::MAX))
        );

        let mut body = vec![];
        body.extend_from_slice(&0u32.to_be_bytes());
        body.extend_from_slice(&0x8000_0000u32.to_be_bytes());
        body.resize(8, 0);
        let mut data = vec![];
        data.extend_from_slice(&KernelCmdlineDescriptor::TAG.to_be_bytes());
        data.extend_from_slice(&(body.len() as u64).to_be_bytes());
        data.extend_from_slice(&body);

        assert_matches!(
            Descriptor::from_reader(Cursor::new(&data)),
            Err(Error::NegativeLength("cmdline_len", 0x8000_0000))
        );
    }

    #[test]
    fn reject_missing_null_terminator() {
        let mut body = vec![];
        body.extend_from_slice(&1u64.to_be_bytes());
        body.extend_from_slice(&1u64.to_be_bytes());
        body.extend_from_slice(b"kXv\0");
        body.resize(24, 0);

        let mut data = vec![];
        data.extend_from_slice(&PropertyDescriptor::TAG.to_be_bytes());
        data.extend_from_slice(&(body.len() as u64).to_be_bytes());
        data.extend_from_slice(&body);

        assert_matches!(
            Descriptor::from_reader(Cursor::new(&data)),
            Err(Error::StringNotNullTerminated("key"))
        );
    }

    #[test]
    fn reject_unaligned_descriptor() {
        let mut data = vec![];
        data.extend_from_slice(&0x99u64.to_be_bytes());
        data.extend_from_slice(&5u64.to_be_bytes());
        data.extend_from_slice(&[0u8; 5]);

        assert_matches!(
            Descriptor::from_reader(Cursor::new(&data)),
            Err(Error::UnalignedDescriptor(5))
        );
    }

    #[test]
    fn read_all_ignores_short_tail() {
        let descriptors = vec![
            Descriptor::KernelCmdline(KernelCmdlineDescriptor {
                flags: 0,
                cmdline: "quiet".to_owned(),
            }),
            Descriptor::Unknown {
                tag: 77,
                data: vec![],
            },
        ];

        let mut data = Descriptor::write_all(&descriptors).unwrap();
        data.extend_from_slice(&[0u8; 15]);

        assert_eq!(Descriptor::read_all(&data).unwrap(), descriptors);
    }

    #[test]
    fn round_trip_header() {
        let header = Header {
            required_libavb_version_major: 1,
            required_libavb_version_minor: 3,
            authentication_data_block_size: 320,
            auxiliary_data_block_size: 1024,
            algorithm_type: AlgorithmType::Sha512Rsa4096,
            hash_offset: 0,
            hash_size: 64,
            signature_offset: 64,
            signature_size: 512,
            public_key_offset: 300,
            public_key_size: 1032,
            public_key_metadata_offset: 1332,
            public_key_metadata_size: 0,
            descriptors_offset: 0,
            descriptors_size: 300,
            rollback_index: u64::MAX,
            flags: Header::FLAG_VERIFICATION_DISABLED,
            rollback_index_location: 7,
            release_string: "x".repeat(48),
            reserved: [0xee; 80],
        };

        let mut writer = Cursor::new(Vec::new());
        header.to_writer(&mut writer).unwrap();
        let data = writer.into_inner();
        assert_eq!(data.len(), Header::SIZE);

        assert_eq!(Header::from_reader(Cursor::new(&data)).unwrap(), header);
    }

    #[test]
    fn reject_negative_header_sizes() {
        let header = Header {
            auxiliary_data_block_size: 1 << 63,
            ..Default::default()
        };

        let mut writer = Cursor::new(Vec::new());
        header.to_writer(&mut writer).unwrap();

        assert_matches!(
            Header::from_reader(Cursor::new(writer.into_inner())),
            Err(Error::NegativeLength("auxiliary_data_block_size", _))
        );
    }

    #[test]
    fn round_trip_footer() {
        let footer = Footer {
            version_major: 1,
            version_minor: 0,
            original_image_size: 1 << 40,
            vbmeta_offset: 1 << 40,
            vbmeta_size: 4096,
            reserved: [0u8; 28],
        };

        let mut writer = Cursor::new(Vec::new());
        footer.to_writer(&mut writer).unwrap();
        let data = writer.into_inner();
        assert_eq!(data.len(), Footer::SIZE);

        assert_eq!(Footer::from_reader(Cursor::new(&data)).unwrap(), footer);
        assert!(footer.fits((1 << 40) + 4096));
        assert!(!footer.fits(1 << 40));
    }

    #[test]
    fn reject_bad_footer_magic() {
        assert_matches!(
            Footer::from_reader(Cursor::new([0u8; Footer::SIZE])),
            Err(Error::InvalidFooterMagic([0, 0, 0, 0]))
        );
    }

    #[test]
    fn round_trip_public_key() {
        let key = test_public_key();
        assert_eq!(key.key_bits(), 2048);

        let data = key.encode().unwrap();
        assert_eq!(data.len(), AlgorithmType::Sha256Rsa2048.public_key_len());
        assert_eq!(&data[..4], &2048u32.to_be_bytes());

        let new_key = PublicKey::decode(&data).unwrap();
        assert_eq!(new_key, key);
        assert_eq!(new_key.encode().unwrap(), data);
    }

    #[test]
    fn reject_truncated_public_key() {
        let data = test_public_key().encode().unwrap();

        assert_matches!(
            PublicKey::decode(&data[..data.len() - 1]),
            Err(Error::InvalidPublicKey("length"))
        );
        assert_matches!(PublicKey::decode(&data[..3]), Err(Error::Io(_)));
    }

    #[test]
    fn algorithm_sizes() {
        assert_eq!(AlgorithmType::Sha256Rsa2048.auth_block_len(), 320);
        assert_eq!(AlgorithmType::Sha512Rsa4096.auth_block_len(), 576);
        assert_eq!(AlgorithmType::None.auth_block_len(), 0);
        assert_eq!(
            AlgorithmType::for_key(SignatureAlgorithm::Sha512WithRsa, 8192),
            Some(AlgorithmType::Sha512Rsa8192)
        );
        assert_eq!(
            AlgorithmType::for_key(SignatureAlgorithm::Sha256WithRsa, 3072),
            None
        );
        assert_eq!(AlgorithmType::from_raw(9), AlgorithmType::Unknown(9));
    }
}
