// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    io::{self, BufReader, Seek, SeekFrom},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    format::{
        avb::{self, ChainPartitionDescriptor, Descriptor, Footer, HashDescriptor, PublicKey},
        vbmeta::VbmetaImage,
    },
    partition::{PartitionInfo, PartitionProvider},
    stream::{FromReader, ReadSeek},
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open partition: {0:?}")]
    Open(String, #[source] io::Error),
    #[error("Failed to read partition: {0:?}")]
    Read(String, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A problem found while verifying the chain of trust. Issues are values: two
/// issues are the same if all of their fields are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum VerificationIssue {
    /// The partition has no parseable vbmeta image or its contents cannot be
    /// read. This cannot be repaired.
    InvalidPartitionData { partition: String },
    /// The hash descriptor at the index does not match the partition contents.
    HashMismatch {
        vbmeta_partition: String,
        descriptor_index: usize,
        actual_size: u64,
        #[serde(with = "hex")]
        actual_digest: Vec<u8>,
    },
    /// The chain partition descriptor at the index does not contain the public
    /// key that the chained partition is signed with.
    PublicKeyMismatch {
        vbmeta_partition: String,
        descriptor_index: usize,
        actual_key: PublicKey,
    },
    /// The vbmeta image's digest or signature is not valid.
    InvalidSignature { vbmeta_partition: String },
}

impl fmt::Display for VerificationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPartitionData { partition } => {
                write!(f, "{partition}: invalid or missing vbmeta data")
            }
            Self::HashMismatch {
                vbmeta_partition,
                descriptor_index,
                actual_size,
                actual_digest,
            } => write!(
                f,
                "{vbmeta_partition}[{descriptor_index}]: hash mismatch \
                (actual size: {actual_size}, actual digest: {})",
                hex::encode(actual_digest),
            ),
            Self::PublicKeyMismatch {
                vbmeta_partition,
                descriptor_index,
                actual_key,
            } => write!(
                f,
                "{vbmeta_partition}[{descriptor_index}]: public key mismatch \
                (actual key: {actual_key})",
            ),
            Self::InvalidSignature { vbmeta_partition } => {
                write!(f, "{vbmeta_partition}: invalid signature")
            }
        }
    }
}

/// An edge in the chain of trust: descriptor `descriptor_index` of
/// `vbmeta_partition` refers to `partition`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct PartitionReference {
    pub partition: String,
    pub vbmeta_partition: String,
    pub descriptor_index: usize,
}

/// Snapshot of a verified partition's vbmeta image and footer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionRecord {
    pub name: String,
    pub image: VbmetaImage,
    pub footer: Option<Footer>,
}

/// Outcome of [`recursive_verify`].
#[derive(Clone, Debug)]
pub struct VerifyResult {
    pub root: String,
    /// Every partition with a parsed vbmeta image that was visited.
    pub records: BTreeMap<String, PartitionRecord>,
    /// Issues in the order that they were first found.
    pub issues: Vec<VerificationIssue>,
    pub references: BTreeSet<PartitionReference>,
}

impl VerifyResult {
    /// Whether the chain of trust verified without issues.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Per-call verification state.
struct Verifier<'a> {
    provider: &'a dyn PartitionProvider,
    info_cache: HashMap<String, Option<PartitionInfo>>,
    image_cache: HashMap<String, Option<VbmetaImage>>,
    visited: HashSet<String>,
    issues: Vec<VerificationIssue>,
    references: BTreeSet<PartitionReference>,
}

impl<'a> Verifier<'a> {
    fn new(provider: &'a dyn PartitionProvider) -> Self {
        Self {
            provider,
            info_cache: HashMap::new(),
            image_cache: HashMap::new(),
            visited: HashSet::new(),
            issues: vec![],
            references: BTreeSet::new(),
        }
    }

    fn open(&self, name: &str) -> Result<Box<dyn ReadSeek>> {
        self.provider
            .open_read(name)
            .map_err(|e| Error::Open(name.to_owned(), e))
    }

    fn add_issue(&mut self, issue: VerificationIssue) {
        if !self.issues.contains(&issue) {
            error!("{issue}");
            self.issues.push(issue);
        }
    }

    fn add_reference(&mut self, partition: &str, vbmeta_partition: &str, descriptor_index: usize) {
        self.references.insert(PartitionReference {
            partition: partition.to_owned(),
            vbmeta_partition: vbmeta_partition.to_owned(),
            descriptor_index,
        });
    }

    fn partition_info(&mut self, name: &str) -> Result<Option<PartitionInfo>> {
        if let Some(info) = self.info_cache.get(name) {
            return Ok(info.clone());
        }

        let reader = self.open(name)?;
        let info = PartitionInfo::probe(reader).map_err(|e| Error::Read(name.to_owned(), e))?;
        if info.is_none() {
            warn!("No vbmeta header or footer in partition {name:?}");
        }

        self.info_cache.insert(name.to_owned(), info.clone());

        Ok(info)
    }

    fn vbmeta_image(&mut self, name: &str) -> Result<Option<VbmetaImage>> {
        if let Some(image) = self.image_cache.get(name) {
            return Ok(image.clone());
        }

        let Some(info) = self.partition_info(name)? else {
            return Ok(None);
        };

        let mut reader = BufReader::new(self.open(name)?);
        reader
            .seek(SeekFrom::Start(info.vbmeta_offset))
            .map_err(|e| Error::Read(name.to_owned(), e))?;

        let image = match VbmetaImage::from_reader(&mut reader) {
            Ok(image) => {
                debug!(
                    "Parsed vbmeta image in {name:?}: {} descriptors, signature valid: {}",
                    image.descriptors.len(),
                    image.signature_valid,
                );
                Some(image)
            }
            Err(avb::Error::Io(e)) if is_fatal_io(&e) => {
                return Err(Error::Read(name.to_owned(), e));
            }
            Err(e) => {
                warn!("Failed to parse vbmeta image in {name:?}: {e}");
                None
            }
        };

        self.image_cache.insert(name.to_owned(), image.clone());

        Ok(image)
    }

    /// Compute the digest of the first `size` bytes of a partition with the
    /// descriptor's salt and algorithm. Returns [`None`] if the digest cannot
    /// be computed because of the partition's or descriptor's contents.
    fn hash_partition(
        &self,
        name: &str,
        descriptor: &HashDescriptor,
        size: u64,
    ) -> Result<Option<Vec<u8>>> {
        let reader = self.open(name)?;

        debug!(
            "Hashing {:?} of {name:?} with {}",
            NumBytes(size),
            descriptor.hash_algorithm,
        );

        match descriptor.calculate(reader, size) {
            Ok(digest) => Ok(Some(digest)),
            Err(avb::Error::Io(e)) if is_fatal_io(&e) => Err(Error::Read(name.to_owned(), e)),
            Err(e) => {
                warn!("Failed to hash partition {name:?}: {e}");
                Ok(None)
            }
        }
    }

    fn verify_partition(&mut self, name: &str) -> Result<()> {
        if !self.visited.insert(name.to_owned()) {
            debug!("Partition {name:?} was already verified");
            return Ok(());
        }

        info!("Verifying vbmeta image in partition {name:?}");

        let Some(image) = self.vbmeta_image(name)? else {
            self.add_issue(VerificationIssue::InvalidPartitionData {
                partition: name.to_owned(),
            });
            return Ok(());
        };

        if image.public_key.is_some() && !image.signature_valid {
            self.add_issue(VerificationIssue::InvalidSignature {
                vbmeta_partition: name.to_owned(),
            });
        }

        for (index, descriptor) in image.descriptors.iter().enumerate() {
            match descriptor {
                Descriptor::Hash(d) => self.verify_hash(name, index, d)?,
                Descriptor::ChainPartition(d) => self.verify_chain(name, index, d)?,
                Descriptor::HashTree(d) => {
                    warn!(
                        "Ignoring hash tree descriptor for partition {:?}",
                        d.partition_name,
                    );
                }
                Descriptor::Property(_)
                | Descriptor::KernelCmdline(_)
                | Descriptor::Unknown { .. } => {}
            }
        }

        Ok(())
    }

    fn verify_chain(
        &mut self,
        vbmeta_partition: &str,
        index: usize,
        descriptor: &ChainPartitionDescriptor,
    ) -> Result<()> {
        let target = descriptor.partition_name.as_str();

        self.add_reference(target, vbmeta_partition, index);

        info!("Verifying chained partition {target:?}");

        let Some(image) = self.vbmeta_image(target)? else {
            self.add_issue(VerificationIssue::InvalidPartitionData {
                partition: target.to_owned(),
            });
            return Ok(());
        };

        if !image.signature_valid {
            self.add_issue(VerificationIssue::InvalidSignature {
                vbmeta_partition: target.to_owned(),
            });
        }

        match &image.public_key {
            Some(key) if *key != descriptor.public_key => {
                self.add_issue(VerificationIssue::PublicKeyMismatch {
                    vbmeta_partition: vbmeta_partition.to_owned(),
                    descriptor_index: index,
                    actual_key: key.clone(),
                });
            }
            Some(_) => {}
            None => debug!("Chained partition {target:?} has no public key"),
        }

        self.verify_partition(target)
    }

    fn verify_hash(
        &mut self,
        vbmeta_partition: &str,
        index: usize,
        descriptor: &HashDescriptor,
    ) -> Result<()> {
        let target = descriptor.partition_name.as_str();

        self.add_reference(target, vbmeta_partition, index);

        info!("Verifying hash of partition {target:?}");

        let mut actual_size = descriptor.image_size;
        let mut outer_mismatch = false;

        let footer = self.partition_info(target)?.and_then(|i| i.footer);

        if let Some(footer) = footer {
            // The footer is authoritative for the size of the data.
            if footer.original_image_size != actual_size {
                warn!(
                    "Footer image size ({}) does not match descriptor ({actual_size}) for {target:?}",
                    footer.original_image_size,
                );
                actual_size = footer.original_image_size;
                outer_mismatch = true;
            }

            let Some(image) = self.vbmeta_image(target)? else {
                self.add_issue(VerificationIssue::InvalidPartitionData {
                    partition: target.to_owned(),
                });
                return Ok(());
            };

            let inner = image
                .descriptors
                .iter()
                .enumerate()
                .rev()
                .find_map(|(i, d)| match d {
                    Descriptor::Hash(h) if h.partition_name == target => Some((i, h)),
                    _ => None,
                });
            let Some((inner_index, inner)) = inner else {
                error!("No hash descriptor for {target:?} in its own vbmeta image");
                self.add_issue(VerificationIssue::InvalidPartitionData {
                    partition: target.to_owned(),
                });
                return Ok(());
            };

            let Some(digest) = self.hash_partition(target, inner, actual_size)? else {
                self.add_issue(VerificationIssue::InvalidPartitionData {
                    partition: target.to_owned(),
                });
                return Ok(());
            };

            if inner.image_size != actual_size || digest != inner.root_digest {
                self.add_issue(VerificationIssue::HashMismatch {
                    vbmeta_partition: target.to_owned(),
                    descriptor_index: inner_index,
                    actual_size,
                    actual_digest: digest,
                });
            }

            // The descriptor being verified is the partition's own descriptor.
            if vbmeta_partition == target && inner_index == index {
                return Ok(());
            }
        }

        let Some(digest) = self.hash_partition(target, descriptor, actual_size)? else {
            self.add_issue(VerificationIssue::InvalidPartitionData {
                partition: target.to_owned(),
            });
            return Ok(());
        };

        if digest != descriptor.root_digest {
            outer_mismatch = true;
        }

        if outer_mismatch {
            self.add_issue(VerificationIssue::HashMismatch {
                vbmeta_partition: vbmeta_partition.to_owned(),
                descriptor_index: index,
                actual_size,
                actual_digest: digest,
            });
        }

        Ok(())
    }

    fn finish(self, root: &str) -> VerifyResult {
        let records = self
            .image_cache
            .into_iter()
            .filter_map(|(name, image)| {
                let image = image?;
                let footer = self
                    .info_cache
                    .get(&name)
                    .and_then(|i| i.as_ref())
                    .and_then(|i| i.footer.clone());

                Some((
                    name.clone(),
                    PartitionRecord {
                        name,
                        image,
                        footer,
                    },
                ))
            })
            .collect();

        VerifyResult {
            root: root.to_owned(),
            records,
            issues: self.issues,
            references: self.references,
        }
    }
}

/// I/O errors that are not caused by truncated or invalid data.
fn is_fatal_io(e: &io::Error) -> bool {
    !matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData
    )
}

/// Verify the chain of trust starting at the vbmeta image in the `root`
/// partition. Every partition reachable through hash and chain partition
/// descriptors is visited once. Problems with the images are reported as
/// issues in the result. Only failures to access partitions are errors.
pub fn recursive_verify(provider: &dyn PartitionProvider, root: &str) -> Result<VerifyResult> {
    let mut verifier = Verifier::new(provider);
    verifier.verify_partition(root)?;

    let result = verifier.finish(root);

    if result.is_clean() {
        info!("Successfully verified {} partitions", result.records.len());
    } else {
        warn!("Found {} issues", result.issues.len());
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use crate::partition::MemoryPartitions;

    use super::*;

    #[test]
    fn issues_are_deduplicated() {
        let provider = MemoryPartitions::new();
        let mut verifier = Verifier::new(&provider);

        let issue = VerificationIssue::HashMismatch {
            vbmeta_partition: "vbmeta".to_owned(),
            descriptor_index: 1,
            actual_size: 4096,
            actual_digest: vec![0xab; 32],
        };
        let other = VerificationIssue::InvalidSignature {
            vbmeta_partition: "vbmeta".to_owned(),
        };

        verifier.add_issue(issue.clone());
        verifier.add_issue(other.clone());
        verifier.add_issue(issue.clone());

        assert_eq!(verifier.issues, [issue, other]);
    }

    #[test]
    fn missing_root_is_fatal() {
        let provider = MemoryPartitions::new();

        assert!(matches!(
            recursive_verify(&provider, "vbmeta"),
            Err(Error::Open(name, _)) if name == "vbmeta"
        ));
    }

    #[test]
    fn garbage_root_is_invalid_data() {
        let provider = MemoryPartitions::new();
        provider.insert("vbmeta", vec![0xff; 8192]);

        let result = recursive_verify(&provider, "vbmeta").unwrap();
        assert_eq!(
            result.issues,
            [VerificationIssue::InvalidPartitionData {
                partition: "vbmeta".to_owned(),
            }],
        );
        assert!(result.records.is_empty());
    }

    #[test]
    fn display_issue() {
        let issue = VerificationIssue::HashMismatch {
            vbmeta_partition: "vbmeta".to_owned(),
            descriptor_index: 2,
            actual_size: 16,
            actual_digest: vec![0x01, 0x02],
        };

        assert_eq!(
            issue.to_string(),
            "vbmeta[2]: hash mismatch (actual size: 16, actual digest: 0102)",
        );
    }
}
