// SPDX-FileCopyrightText: 2023-2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{Cursor, Read, Write};

use rsa::{RsaPrivateKey, traits::PublicKeyParts};
use tracing::{debug, warn};

use crate::{
    crypto::{self, RsaPublicKeyExt, SignatureAlgorithm},
    format::{
        avb::{AlgorithmType, Descriptor, Error, HEADER_MAX_SIZE, Header, PublicKey},
        padding,
    },
    stream::{FromReader, ReadFixedSizeExt, ToWriter},
    util::NumBytes,
};

/// Default alignment for serialized vbmeta images. avbtool pads vbmeta
/// partition images to 4096 bytes.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

type Result<T> = std::result::Result<T, Error>;

/// Return the portion of a data block described by an (offset, size) pair
/// from the header.
fn block_slice<'a>(
    block: &'a [u8],
    field: &'static str,
    offset: u64,
    size: u64,
) -> Result<&'a [u8]> {
    let end = offset
        .checked_add(size)
        .filter(|e| *e <= block.len() as u64)
        .ok_or(Error::FieldOutOfBounds(field))?;

    Ok(&block[offset as usize..end as usize])
}

fn check_block_size(block_size: u64) -> Result<()> {
    if block_size == 0 {
        return Err(Error::ZeroBlockSize);
    }

    Ok(())
}

/// A parsed vbmeta image: the header plus the contents of the authentication
/// and auxiliary blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VbmetaImage {
    pub header: Header,
    pub descriptors: Vec<Descriptor>,
    pub public_key: Option<PublicKey>,
    pub public_key_metadata: Vec<u8>,
    pub digest: Vec<u8>,
    pub signature: Vec<u8>,
    /// Whether the digest and signature matched the header and auxiliary block
    /// when the image was parsed. This is not updated when the image is
    /// modified.
    pub signature_valid: bool,
}

impl VbmetaImage {
    pub fn new(algorithm_type: AlgorithmType) -> Self {
        Self {
            header: Header {
                algorithm_type,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Whether the image carries (or will carry) a signature. Rewriting a
    /// signed image requires a signing key.
    pub fn is_signed(&self) -> bool {
        self.public_key.is_some() || !self.signature.is_empty()
    }

    /// Select the algorithm for signing with a key of the specified size. The
    /// digest family of the current algorithm is kept. Unsigned images switch
    /// to SHA256.
    pub fn set_algorithm_for_key(&mut self, key_bits: usize) -> Result<()> {
        let family = self
            .header
            .algorithm_type
            .to_signature_algorithm()
            .unwrap_or(SignatureAlgorithm::Sha256WithRsa);

        self.header.algorithm_type =
            AlgorithmType::for_key(family, key_bits).ok_or(Error::UnsupportedKey(key_bits))?;

        Ok(())
    }

    fn check_signature(
        header: &Header,
        header_raw: &[u8],
        aux_block: &[u8],
        digest: &[u8],
        signature: &[u8],
        public_key: Option<&PublicKey>,
    ) -> bool {
        let Some(algo) = header.algorithm_type.to_signature_algorithm() else {
            if header.algorithm_type != AlgorithmType::None {
                warn!("Unsupported algorithm: {:?}", header.algorithm_type);
            }
            return false;
        };

        if digest.is_empty() {
            return false;
        }

        let computed = algo.hash_parts(&[header_raw, aux_block]);
        if computed != digest {
            debug!("Stored digest does not match computed digest");
            return false;
        }

        let Some(public_key) = public_key else {
            debug!("Image has digest, but no public key");
            return false;
        };

        match public_key.as_rsa().verify_sig(algo, &computed, signature) {
            Ok(()) => true,
            Err(e) => {
                debug!("Signature verification failed: {e}");
                false
            }
        }
    }

    /// Serialize the image without a signature. The algorithm is forced to
    /// `NONE` and the public key and its metadata are dropped. The output is
    /// padded to a multiple of `block_size`.
    pub fn serialize_unsigned(&self, block_size: u64) -> Result<Vec<u8>> {
        check_block_size(block_size)?;

        let descriptors_raw = Descriptor::write_all(&self.descriptors)?;
        let aux_size = padding::round(descriptors_raw.len(), 64)
            .ok_or(Error::FieldOutOfBounds("aux_block_size"))?;

        if (Header::SIZE + aux_size) as u64 > HEADER_MAX_SIZE {
            return Err(Error::HeaderTooLarge);
        }

        let header = Header {
            authentication_data_block_size: 0,
            auxiliary_data_block_size: aux_size as u64,
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
            descriptors_size: descriptors_raw.len() as u64,
            ..self.header.clone()
        };

        let mut writer = Cursor::new(Vec::new());
        header.to_writer(&mut writer)?;
        writer.write_all(&descriptors_raw)?;
        padding::write_zeros(&mut writer, 64)?;
        padding::write_zeros(&mut writer, block_size)?;

        Ok(writer.into_inner())
    }

    /// Serialize and sign the image with the specified key. The key's public
    /// half replaces the embedded public key in the output. If the key size
    /// does not match the current algorithm, the algorithm with the same
    /// digest family at the key's size is used. The output is padded to a
    /// multiple of `block_size`.
    pub fn serialize_signed(&self, key: &RsaPrivateKey, block_size: u64) -> Result<Vec<u8>> {
        check_block_size(block_size)?;

        let family = match self.header.algorithm_type {
            AlgorithmType::None => return Err(Error::SigningWithoutAlgorithm),
            a => a
                .to_signature_algorithm()
                .ok_or(Error::UnsupportedAlgorithm(a))?,
        };

        let public_key = PublicKey::from_private_key(key)?;
        let key_bits = public_key.key_bits();

        let mut algorithm = self.header.algorithm_type;
        if algorithm.key_bits() != key_bits {
            algorithm =
                AlgorithmType::for_key(family, key_bits).ok_or(Error::UnsupportedKey(key_bits))?;
            debug!(
                "Using {algorithm:?} instead of {:?} for {key_bits}-bit key",
                self.header.algorithm_type,
            );
        }

        // Moduli that are not a power of two in size produce signatures that
        // are shorter than what the algorithm type declares.
        if key.size() != algorithm.signature_len() {
            return Err(Error::UnsupportedKey(key.size() * 8));
        }

        let descriptors_raw = Descriptor::write_all(&self.descriptors)?;
        let public_key_raw = public_key.encode()?;

        let aux_data_size =
            descriptors_raw.len() + public_key_raw.len() + self.public_key_metadata.len();
        let aux_size = padding::round(aux_data_size, 64)
            .ok_or(Error::FieldOutOfBounds("aux_block_size"))?;
        let auth_size = algorithm.auth_block_len();

        if (Header::SIZE + auth_size + aux_size) as u64 > HEADER_MAX_SIZE {
            return Err(Error::HeaderTooLarge);
        }

        let public_key_offset = descriptors_raw.len();
        let public_key_metadata_offset = public_key_offset + public_key_raw.len();

        let header = Header {
            authentication_data_block_size: auth_size as u64,
            auxiliary_data_block_size: aux_size as u64,
            algorithm_type: algorithm,
            hash_offset: 0,
            hash_size: algorithm.digest_len() as u64,
            signature_offset: algorithm.digest_len() as u64,
            signature_size: algorithm.signature_len() as u64,
            public_key_offset: public_key_offset as u64,
            public_key_size: public_key_raw.len() as u64,
            public_key_metadata_offset: public_key_metadata_offset as u64,
            public_key_metadata_size: self.public_key_metadata.len() as u64,
            descriptors_offset: 0,
            descriptors_size: descriptors_raw.len() as u64,
            ..self.header.clone()
        };

        let mut header_writer = Cursor::new(Vec::new());
        header.to_writer(&mut header_writer)?;
        let header_raw = header_writer.into_inner();

        let mut aux_block = Vec::with_capacity(aux_size);
        aux_block.extend_from_slice(&descriptors_raw);
        aux_block.extend_from_slice(&public_key_raw);
        aux_block.extend_from_slice(&self.public_key_metadata);
        aux_block.resize(aux_size, 0);

        let signature_algorithm = algorithm
            .to_signature_algorithm()
            .ok_or(Error::UnsupportedAlgorithm(algorithm))?;
        let digest = signature_algorithm.hash_parts(&[&header_raw, &aux_block]);
        let signature = crypto::sign(key, signature_algorithm, &digest)?;

        let mut auth_block = Vec::with_capacity(auth_size);
        auth_block.extend_from_slice(&digest);
        auth_block.extend_from_slice(&signature);
        auth_block.resize(auth_size, 0);

        let mut writer = Cursor::new(Vec::new());
        writer.write_all(&header_raw)?;
        writer.write_all(&auth_block)?;
        writer.write_all(&aux_block)?;
        padding::write_zeros(&mut writer, block_size)?;

        debug!(
            "Signed {:?} image with {public_key}",
            NumBytes(writer.get_ref().len()),
        );

        Ok(writer.into_inner())
    }
}

impl<R: Read> FromReader<R> for VbmetaImage {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let header_raw = reader.read_array_exact::<{ Header::SIZE }>()?;
        let header = Header::from_reader(Cursor::new(&header_raw))?;

        let total_size = (Header::SIZE as u64)
            .checked_add(header.authentication_data_block_size)
            .and_then(|s| s.checked_add(header.auxiliary_data_block_size))
            .ok_or(Error::FieldOutOfBounds("total_size"))?;
        if total_size > HEADER_MAX_SIZE {
            return Err(Error::HeaderTooLarge);
        }

        let auth_block = reader
            .read_vec_exact(header.authentication_data_block_size as usize)
            .map_err(|e| Error::ReadFieldError("auth_block", e))?;
        let aux_block = reader
            .read_vec_exact(header.auxiliary_data_block_size as usize)
            .map_err(|e| Error::ReadFieldError("aux_block", e))?;

        let digest =
            block_slice(&auth_block, "hash", header.hash_offset, header.hash_size)?.to_vec();
        let signature = block_slice(
            &auth_block,
            "signature",
            header.signature_offset,
            header.signature_size,
        )?
        .to_vec();

        let public_key = if header.public_key_size != 0 {
            let data = block_slice(
                &aux_block,
                "public_key",
                header.public_key_offset,
                header.public_key_size,
            )?;
            Some(PublicKey::decode(data)?)
        } else {
            None
        };

        let public_key_metadata = block_slice(
            &aux_block,
            "public_key_metadata",
            header.public_key_metadata_offset,
            header.public_key_metadata_size,
        )?
        .to_vec();

        let descriptors_raw = block_slice(
            &aux_block,
            "descriptors",
            header.descriptors_offset,
            header.descriptors_size,
        )?;
        let descriptors = Descriptor::read_all(descriptors_raw)?;

        let signature_valid = Self::check_signature(
            &header,
            &header_raw,
            &aux_block,
            &digest,
            &signature,
            public_key.as_ref(),
        );

        Ok(Self {
            header,
            descriptors,
            public_key,
            public_key_metadata,
            digest,
            signature,
            signature_valid,
        })
    }
}
