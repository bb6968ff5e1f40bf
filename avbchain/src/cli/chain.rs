// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeSet,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Args, Parser};
use serde::Serialize;

use crate::{
    cli::{status, warning},
    crypto::PassphraseSource,
    format::{
        avb::{AlgorithmType, PublicKey},
        vbmeta::DEFAULT_BLOCK_SIZE,
    },
    keyring::KeyRing,
    partition::{DirPartitions, PartitionProvider, PatternPartitions},
    rebuild,
    verify::{self, PartitionReference, VerificationIssue, VerifyResult},
};

/// Per-partition section of the `check` report.
#[derive(Serialize)]
struct PartitionSummary<'a> {
    name: &'a str,
    algorithm: AlgorithmType,
    public_key: Option<&'a PublicKey>,
    signature_valid: bool,
    descriptors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    original_image_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vbmeta_offset: Option<u64>,
}

#[derive(Serialize)]
struct Report<'a> {
    root: &'a str,
    clean: bool,
    partitions: Vec<PartitionSummary<'a>>,
    issues: &'a [VerificationIssue],
    references: &'a BTreeSet<PartitionReference>,
}

impl<'a> Report<'a> {
    fn new(result: &'a VerifyResult) -> Self {
        let partitions = result
            .records
            .values()
            .map(|r| PartitionSummary {
                name: &r.name,
                algorithm: r.image.header.algorithm_type,
                public_key: r.image.public_key.as_ref(),
                signature_valid: r.image.signature_valid,
                descriptors: r
                    .image
                    .descriptors
                    .iter()
                    .map(|d| match d.partition_name() {
                        Some(p) => format!("{}: {p}", d.type_name()),
                        None => d.type_name().to_owned(),
                    })
                    .collect(),
                original_image_size: r.footer.as_ref().map(|f| f.original_image_size),
                vbmeta_offset: r.footer.as_ref().map(|f| f.vbmeta_offset),
            })
            .collect();

        Self {
            root: &result.root,
            clean: result.is_clean(),
            partitions,
            issues: &result.issues,
            references: &result.references,
        }
    }
}

fn write_report(path: &Path, result: &VerifyResult) -> Result<()> {
    let data = toml_edit::ser::to_string_pretty(&Report::new(result))
        .with_context(|| format!("Failed to serialize report: {path:?}"))?;
    fs::write(path, data).with_context(|| format!("Failed to write report: {path:?}"))?;

    Ok(())
}

fn open_provider(source: &SourceGroup) -> Result<Box<dyn PartitionProvider>> {
    if let Some(pattern) = &source.pattern {
        if !pattern.contains(PatternPartitions::PLACEHOLDER) {
            bail!(
                "Pattern does not contain {:?}: {pattern:?}",
                PatternPartitions::PLACEHOLDER,
            );
        }

        Ok(Box::new(PatternPartitions::new(pattern.clone())))
    } else if let Some(dir) = &source.directory {
        let provider = DirPartitions::open_ambient(dir)
            .with_context(|| format!("Failed to open partition directory: {dir:?}"))?;

        Ok(Box::new(provider))
    } else {
        unreachable!()
    }
}

fn verify_chain(provider: &dyn PartitionProvider, root: &str) -> Result<VerifyResult> {
    let result = verify::recursive_verify(provider, root)
        .with_context(|| format!("Failed to verify chain of trust from {root:?}"))?;

    for issue in &result.issues {
        warning!("{issue}");
    }

    if result.is_clean() {
        status!(
            "Verified {} partitions from {root:?} without issues",
            result.records.len(),
        );
    } else {
        status!("Found {} issues", result.issues.len());
    }

    Ok(result)
}

pub fn check_main(cli: &CheckCli) -> Result<()> {
    let provider = open_provider(&cli.source)?;
    let result = verify_chain(provider.as_ref(), &cli.root)?;

    if let Some(path) = &cli.report {
        write_report(path, &result)?;
        status!("Wrote report to {path:?}");
    }

    if !result.is_clean() {
        bail!("Chain of trust from {:?} is broken", cli.root);
    }

    Ok(())
}

pub fn fix_main(cli: &FixCli) -> Result<()> {
    let passphrase_source =
        PassphraseSource::new(cli.pass_file.as_deref(), cli.pass_env_var.as_ref());

    let key_ring = match &cli.keys {
        Some(dir) => KeyRing::load_dir(dir, &passphrase_source)
            .with_context(|| format!("Failed to load keys: {dir:?}"))?,
        None => KeyRing::new(),
    };
    status!("Loaded {} trusted keys", key_ring.len());

    let provider = open_provider(&cli.source)?;
    let result = verify_chain(provider.as_ref(), &cli.root)?;

    if result.is_clean() {
        status!("Nothing to repair");
        return Ok(());
    }

    let requests = rebuild::rebuild_with_trusted_data(&result, &key_ring)
        .context("Failed to repair chain of trust")?;

    let output = match &cli.output {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {dir:?}"))?;
            let provider = DirPartitions::open_ambient(dir)
                .with_context(|| format!("Failed to open output directory: {dir:?}"))?;

            Some(provider)
        }
        None => None,
    };

    for mut request in requests {
        let name = request.partition.clone();

        if let Some(output) = &output {
            let source = provider
                .open_read(&name)
                .with_context(|| format!("Failed to open partition for reading: {name:?}"))?;
            let dest = output
                .create(&name)
                .with_context(|| format!("Failed to create output partition: {name:?}"))?;

            request
                .apply_to_copy(source, dest, cli.block_size)
                .with_context(|| format!("Failed to write copy of partition: {name:?}"))?;
        } else {
            let partition = provider
                .open_read_write(&name)
                .with_context(|| format!("Failed to open partition for writing: {name:?}"))?;

            request
                .apply_in_place(partition, cli.block_size)
                .with_context(|| format!("Failed to write partition: {name:?}"))?;
        }

        match &request.key {
            Some(key) => status!("Rebuilt {name:?}, signed with {}", key.public_key()),
            None => status!("Rebuilt {name:?}"),
        }
    }

    if let Some(dir) = &cli.output {
        status!("Wrote rebuilt partitions to {dir:?}");
    } else {
        let result = verify_chain(provider.as_ref(), &cli.root)?;
        if !result.is_clean() {
            bail!("Chain of trust from {:?} is still broken after repair", cli.root);
        }
    }

    Ok(())
}

#[derive(Debug, Args)]
#[command(group = ArgGroup::new("source").required(true).multiple(false))]
pub struct SourceGroup {
    /// Path template for partition images.
    ///
    /// Every `%s` is replaced by the partition name, eg.
    /// `/dev/block/by-name/%s_a`.
    #[arg(short, long, value_name = "PATTERN", group = "source")]
    pub pattern: Option<String>,

    /// Directory containing `<partition>.img` files.
    #[arg(short, long, value_name = "DIR", value_parser, group = "source")]
    pub directory: Option<PathBuf>,
}

/// Verify the chain of trust starting from the root vbmeta partition.
///
/// Every hash descriptor is checked against the partition data and every chain
/// partition descriptor is checked against the public key of the partition it
/// refers to. Signatures are checked for every partition with vbmeta metadata.
#[derive(Debug, Parser)]
pub struct CheckCli {
    #[command(flatten)]
    pub source: SourceGroup,

    /// Name of the root vbmeta partition.
    #[arg(short, long, value_name = "NAME", default_value = "vbmeta")]
    pub root: String,

    /// Path to output TOML report.
    #[arg(long, value_name = "FILE", value_parser)]
    pub report: Option<PathBuf>,
}

/// Repair the chain of trust starting from the root vbmeta partition.
///
/// Hash and chain partition descriptors are updated to match the actual
/// partition contents and every modified vbmeta image is re-signed. If no
/// private key is available for an image, a new key is generated and every
/// partition that chains to it is updated to trust the new key.
#[derive(Debug, Parser)]
pub struct FixCli {
    #[command(flatten)]
    pub source: SourceGroup,

    /// Name of the root vbmeta partition.
    #[arg(short, long, value_name = "NAME", default_value = "vbmeta")]
    pub root: String,

    /// Directory containing trusted private keys.
    ///
    /// Every `*.pem` and `*.key` file is loaded as a PKCS8 private key.
    #[arg(short, long, value_name = "DIR", value_parser)]
    pub keys: Option<PathBuf>,

    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass")]
    pub pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass")]
    pub pass_file: Option<PathBuf>,

    /// Write rebuilt partitions to this directory instead of in place.
    ///
    /// Only partitions that changed are written, as `<partition>.img`.
    #[arg(short, long, value_name = "DIR", value_parser)]
    pub output: Option<PathBuf>,

    /// Pad serialized vbmeta images to a multiple of this size.
    ///
    /// A value of 1 disables padding.
    #[arg(
        long,
        value_name = "BYTES",
        default_value_t = DEFAULT_BLOCK_SIZE,
        value_parser = clap::value_parser!(u64).range(1..),
    )]
    pub block_size: u64,
}
