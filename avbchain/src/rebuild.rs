// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    io::{self, Read, Seek, SeekFrom, Write},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    format::{
        avb::{self, Descriptor, Footer, PublicKey},
        vbmeta::VbmetaImage,
    },
    keyring::{self, KeyPair, KeyRing},
    stream::{self, ToWriter},
    util::NumBytes,
    verify::{PartitionRecord, PartitionReference, VerificationIssue, VerifyResult},
};

/// Upper bound on the number of issues processed in a single repair. Hitting
/// this means that fixing issues keeps producing new ones.
pub const MAX_ITERATIONS: usize = 1000;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Partition cannot be repaired: {0:?}")]
    UnrepairablePartition(String),
    #[error("No signing key for {0:?} and no other partition chains to it")]
    NoTrustPath(String),
    #[error("Repair did not converge after {0} iterations")]
    IterationLimit(usize),
    #[error("Descriptor {1} in {0:?} is not a {2} descriptor")]
    DescriptorTypeMismatch(String, usize, &'static str),
    #[error("Partition was not verified: {0:?}")]
    UnknownPartition(String),
    #[error("Signed partition {0:?} has no signing key")]
    MissingSigningKey(String),
    #[error("{1} byte vbmeta image does not fit in partition {0:?}")]
    PartitionTooSmall(String, u64),
    #[error("Key error")]
    KeyRing(#[from] keyring::Error),
    #[error("AVB error")]
    Avb(#[from] avb::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A repaired vbmeta image that needs to be written back to its partition.
#[derive(Clone, Debug)]
pub struct RebuildRequest {
    pub partition: String,
    pub image: VbmetaImage,
    /// If present, the vbmeta image is appended to the partition's data.
    /// Otherwise, the partition is a vbmeta partition.
    pub footer: Option<Footer>,
    /// Key to sign with. Never [`None`] for signed images.
    pub key: Option<KeyPair>,
}

impl RebuildRequest {
    /// Serialize the vbmeta image, signed if a key is present.
    pub fn serialize(&self, block_size: u64) -> Result<Vec<u8>> {
        match &self.key {
            Some(key) => Ok(self.image.serialize_signed(key.private_key(), block_size)?),
            None if self.image.is_signed() => Err(Error::MissingSigningKey(self.partition.clone())),
            None => Ok(self.image.serialize_unsigned(block_size)?),
        }
    }

    /// Compute where the vbmeta image and footer go in a partition of the
    /// specified size and update the footer to match. Returns the updated
    /// footer and its offset.
    fn place_appended(
        &mut self,
        partition_size: u64,
        vbmeta_size: usize,
    ) -> Result<Option<(Footer, u64)>> {
        let Some(footer) = &mut self.footer else {
            return Ok(None);
        };

        let vbmeta_offset = footer.original_image_size;
        let footer_offset = partition_size
            .checked_sub(Footer::SIZE as u64)
            .filter(|offset| {
                vbmeta_offset
                    .checked_add(vbmeta_size as u64)
                    .is_some_and(|end| end <= *offset)
            })
            .ok_or_else(|| Error::PartitionTooSmall(self.partition.clone(), vbmeta_size as u64))?;

        footer.vbmeta_offset = vbmeta_offset;
        footer.vbmeta_size = vbmeta_size as u64;

        Ok(Some((footer.clone(), footer_offset)))
    }

    /// Write the vbmeta image into an existing partition. For vbmeta
    /// partitions, the image is written at the start of the partition. For
    /// partitions with a footer, the image is written immediately after the
    /// original data and the footer is rewritten at the end of the partition.
    pub fn apply_in_place(
        &mut self,
        mut partition: impl Read + Write + Seek,
        block_size: u64,
    ) -> Result<()> {
        let data = self.serialize(block_size)?;
        let partition_size = partition.seek(SeekFrom::End(0))?;

        match self.place_appended(partition_size, data.len())? {
            None => {
                partition.rewind()?;
                partition.write_all(&data)?;
            }
            Some((footer, footer_offset)) => {
                partition.seek(SeekFrom::Start(footer.vbmeta_offset))?;
                partition.write_all(&data)?;

                partition.seek(SeekFrom::Start(footer_offset))?;
                footer.to_writer(&mut partition)?;
            }
        }

        partition.flush()?;

        info!(
            "Wrote {:?} vbmeta image to {:?}",
            NumBytes(data.len()),
            self.partition,
        );

        Ok(())
    }

    /// Write a new copy of the partition. The original data is copied from
    /// `source` if the partition has a footer. `dest` should be empty.
    pub fn apply_to_copy(
        &mut self,
        mut source: impl Read + Seek,
        mut dest: impl Write + Seek,
        block_size: u64,
    ) -> Result<()> {
        let data = self.serialize(block_size)?;
        let partition_size = source.seek(SeekFrom::End(0))?;

        match self.place_appended(partition_size, data.len())? {
            None => {
                dest.rewind()?;
                dest.write_all(&data)?;
            }
            Some((footer, footer_offset)) => {
                source.rewind()?;
                dest.rewind()?;
                stream::copy_n(&mut source, &mut dest, footer.original_image_size)?;

                dest.write_all(&data)?;

                dest.seek(SeekFrom::Start(footer_offset))?;
                footer.to_writer(&mut dest)?;
            }
        }

        dest.flush()?;

        info!(
            "Wrote copy of {:?} with {:?} vbmeta image",
            self.partition,
            NumBytes(data.len()),
        );

        Ok(())
    }
}

/// Per-call repair state. The partition records are private copies of the
/// verification result's records.
struct Rebuilder<'a> {
    records: BTreeMap<String, PartitionRecord>,
    references: &'a BTreeSet<PartitionReference>,
    queue: VecDeque<VerificationIssue>,
    key_ring: &'a KeyRing,
    generated_keys: BTreeMap<usize, KeyPair>,
    /// Partitions that need to be rewritten, in the order they were first
    /// modified.
    dirty_order: Vec<String>,
    dirty_keys: HashMap<String, Option<KeyPair>>,
}

impl<'a> Rebuilder<'a> {
    fn new(result: &'a VerifyResult, key_ring: &'a KeyRing) -> Self {
        let mut rebuilder = Self {
            records: result.records.clone(),
            references: &result.references,
            queue: VecDeque::new(),
            key_ring,
            generated_keys: BTreeMap::new(),
            dirty_order: vec![],
            dirty_keys: HashMap::new(),
        };

        for issue in &result.issues {
            rebuilder.add_issue(issue.clone());
        }

        rebuilder
    }

    /// Queue an issue unless it is already pending.
    fn add_issue(&mut self, issue: VerificationIssue) -> bool {
        if self.queue.contains(&issue) {
            return false;
        }

        self.queue.push_back(issue);
        true
    }

    fn record(&self, name: &str) -> Result<&PartitionRecord> {
        self.records
            .get(name)
            .ok_or_else(|| Error::UnknownPartition(name.to_owned()))
    }

    fn record_mut(&mut self, name: &str) -> Result<&mut PartitionRecord> {
        self.records
            .get_mut(name)
            .ok_or_else(|| Error::UnknownPartition(name.to_owned()))
    }

    fn find_key(&self, public_key: &PublicKey) -> Option<KeyPair> {
        self.key_ring
            .get(public_key)
            .or_else(|| {
                self.generated_keys
                    .values()
                    .find(|k| k.public_key() == public_key)
            })
            .cloned()
    }

    fn generated_key(&mut self, bits: usize) -> Result<KeyPair> {
        if let Some(key_pair) = self.generated_keys.get(&bits) {
            return Ok(key_pair.clone());
        }

        info!("Generating new {bits}-bit RSA key");
        let key_pair = KeyPair::generate(bits)?;
        info!("Generated {}", key_pair.public_key());

        self.generated_keys.insert(bits, key_pair.clone());

        Ok(key_pair)
    }

    /// Mark a partition as needing to be rewritten. If the partition is signed
    /// and no key is known for it yet, its signature is invalidated so that a
    /// key is resolved later.
    fn mark_dirty(&mut self, name: &str, key: Option<KeyPair>) -> Result<()> {
        let signed = self.record(name)?.image.is_signed();

        if !self.dirty_keys.contains_key(name) {
            self.dirty_order.push(name.to_owned());
        }

        match key {
            Some(k) => {
                self.dirty_keys.insert(name.to_owned(), Some(k));
            }
            None => {
                let has_key = self.dirty_keys.get(name).is_some_and(|k| k.is_some());

                if signed && !has_key {
                    let issue = VerificationIssue::InvalidSignature {
                        vbmeta_partition: name.to_owned(),
                    };
                    if self.add_issue(issue) {
                        info!("Invalidated signature of {name:?}");
                    }
                }

                self.dirty_keys.entry(name.to_owned()).or_insert(None);
            }
        }

        Ok(())
    }

    fn fix_hash_mismatch(
        &mut self,
        vbmeta_partition: &str,
        index: usize,
        actual_size: u64,
        actual_digest: Vec<u8>,
    ) -> Result<()> {
        let record = self.record_mut(vbmeta_partition)?;

        let Some(Descriptor::Hash(d)) = record.image.descriptors.get_mut(index) else {
            return Err(Error::DescriptorTypeMismatch(
                vbmeta_partition.to_owned(),
                index,
                "hash",
            ));
        };

        info!(
            "Updating hash descriptor {vbmeta_partition}[{index}] for {:?}",
            d.partition_name,
        );

        d.image_size = actual_size;
        d.root_digest = actual_digest;

        self.mark_dirty(vbmeta_partition, None)
    }

    fn fix_public_key_mismatch(
        &mut self,
        vbmeta_partition: &str,
        index: usize,
        actual_key: PublicKey,
    ) -> Result<()> {
        let record = self.record_mut(vbmeta_partition)?;

        let Some(Descriptor::ChainPartition(d)) = record.image.descriptors.get_mut(index) else {
            return Err(Error::DescriptorTypeMismatch(
                vbmeta_partition.to_owned(),
                index,
                "chain partition",
            ));
        };

        info!(
            "Updating chain partition descriptor {vbmeta_partition}[{index}] for {:?} to {actual_key}",
            d.partition_name,
        );

        d.public_key = actual_key;

        self.mark_dirty(vbmeta_partition, None)
    }

    fn fix_invalid_signature(&mut self, vbmeta_partition: &str) -> Result<()> {
        let record = self.record(vbmeta_partition)?;

        if let Some(key_pair) = record
            .image
            .public_key
            .as_ref()
            .and_then(|k| self.find_key(k))
        {
            info!("Re-signing {vbmeta_partition:?} with existing key {}", key_pair.public_key());
            return self.mark_dirty(vbmeta_partition, Some(key_pair));
        }

        debug!("No private key for {vbmeta_partition:?}, replacing its public key");

        // Other partitions that chain load this one. Their descriptors can be
        // pointed at a new key.
        let parents = self
            .references
            .iter()
            .filter(|r| r.partition == vbmeta_partition && r.vbmeta_partition != vbmeta_partition)
            .filter_map(|r| {
                let parent = self.records.get(&r.vbmeta_partition)?;
                match parent.image.descriptors.get(r.descriptor_index)? {
                    Descriptor::ChainPartition(d) => Some((
                        r.vbmeta_partition.clone(),
                        r.descriptor_index,
                        d.public_key.key_bits(),
                    )),
                    _ => None,
                }
            })
            .collect::<Vec<_>>();

        if parents.is_empty() {
            return Err(Error::NoTrustPath(vbmeta_partition.to_owned()));
        }

        // All parents are re-pointed at one key, sized for the first parent.
        let key_bits = parents[0].2;
        let key_pair = self.generated_key(key_bits)?;

        let record = self.record_mut(vbmeta_partition)?;
        record.image.public_key = Some(key_pair.public_key().clone());
        record.image.set_algorithm_for_key(key_bits)?;

        info!(
            "Replaced public key of {vbmeta_partition:?} with {}",
            key_pair.public_key(),
        );

        self.mark_dirty(vbmeta_partition, Some(key_pair.clone()))?;

        for (parent, index, _) in parents {
            self.add_issue(VerificationIssue::PublicKeyMismatch {
                vbmeta_partition: parent,
                descriptor_index: index,
                actual_key: key_pair.public_key().clone(),
            });
        }

        Ok(())
    }

    fn run(mut self) -> Result<Vec<RebuildRequest>> {
        let mut iterations = 0;

        while let Some(issue) = self.queue.pop_front() {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(Error::IterationLimit(MAX_ITERATIONS));
            }

            debug!("Fixing: {issue}");

            match issue {
                VerificationIssue::HashMismatch {
                    vbmeta_partition,
                    descriptor_index,
                    actual_size,
                    actual_digest,
                } => self.fix_hash_mismatch(
                    &vbmeta_partition,
                    descriptor_index,
                    actual_size,
                    actual_digest,
                )?,
                VerificationIssue::PublicKeyMismatch {
                    vbmeta_partition,
                    descriptor_index,
                    actual_key,
                } => self.fix_public_key_mismatch(&vbmeta_partition, descriptor_index, actual_key)?,
                VerificationIssue::InvalidSignature { vbmeta_partition } => {
                    self.fix_invalid_signature(&vbmeta_partition)?
                }
                VerificationIssue::InvalidPartitionData { partition } => {
                    return Err(Error::UnrepairablePartition(partition));
                }
            }
        }

        let mut requests = Vec::with_capacity(self.dirty_order.len());

        for name in self.dirty_order {
            let key = self.dirty_keys.remove(&name).flatten();
            let record = self
                .records
                .remove(&name)
                .ok_or_else(|| Error::UnknownPartition(name.clone()))?;

            if record.image.is_signed() && key.is_none() {
                return Err(Error::MissingSigningKey(name));
            }

            requests.push(RebuildRequest {
                partition: name,
                image: record.image,
                footer: record.footer,
                key,
            });
        }

        info!("{} partitions need to be rewritten", requests.len());

        Ok(requests)
    }
}

/// Compute the vbmeta images that need to be rewritten to fix every issue in
/// the verification result. Hashes and public keys in descriptors are updated
/// to match the actual data. Modified images are re-signed with a key from
/// `key_ring`. If no key is available for a signed image, a new key is
/// generated and every partition that chains to it is updated to trust the new
/// key. Either every issue is fixed or an error is returned.
pub fn rebuild_with_trusted_data(
    result: &VerifyResult,
    key_ring: &KeyRing,
) -> Result<Vec<RebuildRequest>> {
    Rebuilder::new(result, key_ring).run()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use crate::{
        format::{
            avb::{AlgorithmType, HashDescriptor, PropertyDescriptor},
            vbmeta::VbmetaImage,
        },
        stream::FromReader,
    };

    use super::*;

    fn unsigned_result(
        descriptors: Vec<Descriptor>,
        issues: Vec<VerificationIssue>,
    ) -> VerifyResult {
        let mut image = VbmetaImage::new(AlgorithmType::None);
        image.descriptors = descriptors;

        let record = PartitionRecord {
            name: "vbmeta".to_owned(),
            image,
            footer: None,
        };

        VerifyResult {
            root: "vbmeta".to_owned(),
            records: [("vbmeta".to_owned(), record)].into(),
            issues,
            references: BTreeSet::new(),
        }
    }

    fn hash_descriptor() -> Descriptor {
        Descriptor::Hash(HashDescriptor {
            image_size: 4,
            hash_algorithm: "sha256".to_owned(),
            partition_name: "dtbo".to_owned(),
            salt: vec![],
            root_digest: vec![0u8; 32],
            flags: 0,
            reserved: [0u8; 60],
        })
    }

    fn hash_mismatch(index: usize, digest: Vec<u8>) -> VerificationIssue {
        VerificationIssue::HashMismatch {
            vbmeta_partition: "vbmeta".to_owned(),
            descriptor_index: index,
            actual_size: 8,
            actual_digest: digest,
        }
    }

    #[test]
    fn unsigned_hash_fix() {
        let result = unsigned_result(vec![hash_descriptor()], vec![hash_mismatch(0, vec![1; 32])]);

        let mut requests = rebuild_with_trusted_data(&result, &KeyRing::new()).unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].key.is_none());
        assert_matches!(
            &requests[0].image.descriptors[0],
            Descriptor::Hash(d) if d.image_size == 8 && d.root_digest == [1; 32]
        );

        // The original result is untouched.
        assert_eq!(result.records["vbmeta"].image.descriptors[0], hash_descriptor());

        let mut partition = Cursor::new(vec![0xffu8; 8192]);
        requests[0].apply_in_place(&mut partition, 4096).unwrap();
        partition.rewind().unwrap();
        let image = VbmetaImage::from_reader(&mut partition).unwrap();
        assert_eq!(image.descriptors, requests[0].image.descriptors);
    }

    #[test]
    fn invalid_data_is_fatal() {
        let result = unsigned_result(
            vec![hash_descriptor()],
            vec![
                hash_mismatch(0, vec![1; 32]),
                VerificationIssue::InvalidPartitionData {
                    partition: "dtbo".to_owned(),
                },
            ],
        );

        assert_matches!(
            rebuild_with_trusted_data(&result, &KeyRing::new()),
            Err(Error::UnrepairablePartition(p)) if p == "dtbo"
        );
    }

    #[test]
    fn wrong_descriptor_type() {
        let property = Descriptor::Property(PropertyDescriptor {
            key: "k".to_owned(),
            value: b"v".to_vec(),
        });
        let result = unsigned_result(vec![property], vec![hash_mismatch(0, vec![1; 32])]);

        assert_matches!(
            rebuild_with_trusted_data(&result, &KeyRing::new()),
            Err(Error::DescriptorTypeMismatch(p, 0, "hash")) if p == "vbmeta"
        );
    }

    #[test]
    fn iteration_limit() {
        let issues = (0..=MAX_ITERATIONS)
            .map(|i| hash_mismatch(0, (i as u32).to_be_bytes().to_vec()))
            .collect();
        let result = unsigned_result(vec![hash_descriptor()], issues);

        assert_matches!(
            rebuild_with_trusted_data(&result, &KeyRing::new()),
            Err(Error::IterationLimit(MAX_ITERATIONS))
        );
    }

    #[test]
    fn appended_image_must_fit() {
        let result = unsigned_result(vec![hash_descriptor()], vec![hash_mismatch(0, vec![1; 32])]);
        let mut requests = rebuild_with_trusted_data(&result, &KeyRing::new()).unwrap();
        requests[0].footer = Some(Footer::new(4096));

        let mut partition = Cursor::new(vec![0u8; 4096 + 1024]);
        assert_matches!(
            requests[0].apply_in_place(&mut partition, 1),
            Err(Error::PartitionTooSmall(_, _))
        );

        let mut partition = Cursor::new(vec![0u8; 4096 * 2]);
        assert_matches!(
            requests[0].apply_in_place(&mut partition, 0),
            Err(Error::Avb(avb::Error::ZeroBlockSize))
        );
        assert!(partition.get_ref().iter().all(|b| *b == 0));

        let mut partition = Cursor::new(vec![0u8; 4096 * 2]);
        requests[0].apply_in_place(&mut partition, 1).unwrap();
        let footer = requests[0].footer.as_ref().unwrap();
        assert_eq!(footer.vbmeta_offset, 4096);
        assert!(footer.vbmeta_size > 0);
        assert_eq!(&partition.get_ref()[4096..4100], b"AVB0");
        assert_eq!(&partition.get_ref()[4096 * 2 - 64..4096 * 2 - 60], b"AVBf");
    }
}
