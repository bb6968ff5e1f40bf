// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{self, Cursor, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use cap_std::{
    ambient_authority,
    fs::{Dir, OpenOptions as DirOpenOptions},
};
use tracing::{debug, warn};

use crate::{
    format::avb::{Footer, HEADER_MAGIC},
    stream::{FromReader, ReadFixedSizeExt, ReadSeek, ReadWriteSeek, SharedCursor},
    util,
};

fn check_name(name: &str) -> io::Result<()> {
    if !util::is_safe_name(name) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Unsafe partition name: {name:?}"),
        ));
    }

    Ok(())
}

/// Access to partitions by name. Every handle is closed when dropped.
pub trait PartitionProvider {
    /// Open a partition for reading.
    fn open_read(&self, name: &str) -> io::Result<Box<dyn ReadSeek>>;

    /// Open an existing partition for reading and writing without truncating
    /// it.
    fn open_read_write(&self, name: &str) -> io::Result<Box<dyn ReadWriteSeek>>;

    /// Create a new empty partition image, replacing any existing one.
    fn create(&self, name: &str) -> io::Result<Box<dyn ReadWriteSeek>>;
}

/// Partitions located by substituting the name into a path template. Every
/// `%s` in the template is replaced with the partition name.
#[derive(Clone, Debug)]
pub struct PatternPartitions {
    pattern: String,
}

impl PatternPartitions {
    pub const PLACEHOLDER: &'static str = "%s";

    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn path(&self, name: &str) -> io::Result<PathBuf> {
        check_name(name)?;

        Ok(PathBuf::from(self.pattern.replace(Self::PLACEHOLDER, name)))
    }
}

impl PartitionProvider for PatternPartitions {
    fn open_read(&self, name: &str) -> io::Result<Box<dyn ReadSeek>> {
        let file = File::open(self.path(name)?)?;
        Ok(Box::new(file))
    }

    fn open_read_write(&self, name: &str) -> io::Result<Box<dyn ReadWriteSeek>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path(name)?)?;
        Ok(Box::new(file))
    }

    fn create(&self, name: &str) -> io::Result<Box<dyn ReadWriteSeek>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path(name)?)?;
        Ok(Box::new(file))
    }
}

/// Partitions stored as `<name>.img` files inside a directory. Names that
/// would refer to paths outside of the directory are rejected.
#[derive(Debug)]
pub struct DirPartitions {
    dir: Dir,
}

impl DirPartitions {
    pub const EXTENSION: &'static str = "img";

    pub fn new(dir: Dir) -> Self {
        Self { dir }
    }

    pub fn open_ambient(path: &Path) -> io::Result<Self> {
        let dir = Dir::open_ambient_dir(path, ambient_authority())?;
        Ok(Self::new(dir))
    }

    fn file_name(name: &str) -> io::Result<String> {
        check_name(name)?;

        Ok(format!("{name}.{}", Self::EXTENSION))
    }
}

impl PartitionProvider for DirPartitions {
    fn open_read(&self, name: &str) -> io::Result<Box<dyn ReadSeek>> {
        let file = self.dir.open(Self::file_name(name)?)?;
        Ok(Box::new(file))
    }

    fn open_read_write(&self, name: &str) -> io::Result<Box<dyn ReadWriteSeek>> {
        let file = self.dir.open_with(
            Self::file_name(name)?,
            DirOpenOptions::new().read(true).write(true),
        )?;
        Ok(Box::new(file))
    }

    fn create(&self, name: &str) -> io::Result<Box<dyn ReadWriteSeek>> {
        let file = self.dir.open_with(
            Self::file_name(name)?,
            DirOpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true),
        )?;
        Ok(Box::new(file))
    }
}

/// In-memory partition images. Handles returned by the provider share the
/// underlying buffers, so writes are visible to later opens.
#[derive(Debug, Default)]
pub struct MemoryPartitions {
    partitions: Mutex<BTreeMap<String, SharedCursor>>,
}

impl MemoryPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, data: Vec<u8>) {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), SharedCursor::new(data));
    }

    /// Get a copy of the current contents of a partition.
    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|c| c.to_vec())
    }

    pub fn names(&self) -> Vec<String> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn open(&self, name: &str) -> io::Result<SharedCursor> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|c| c.reopen())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Partition not found: {name:?}"),
                )
            })
    }
}

impl PartitionProvider for MemoryPartitions {
    fn open_read(&self, name: &str) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(self.open(name)?))
    }

    fn open_read_write(&self, name: &str) -> io::Result<Box<dyn ReadWriteSeek>> {
        Ok(Box::new(self.open(name)?))
    }

    fn create(&self, name: &str) -> io::Result<Box<dyn ReadWriteSeek>> {
        self.insert(name, Vec::new());
        Ok(Box::new(self.open(name)?))
    }
}

/// Location of the vbmeta image within a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionInfo {
    /// Size of the whole partition.
    pub size: u64,
    /// Offset of the vbmeta header. This is 0 for vbmeta partitions.
    pub vbmeta_offset: u64,
    /// Offset of the footer. Only meaningful if [`Self::footer`] is set.
    pub footer_offset: u64,
    pub footer: Option<Footer>,
}

impl PartitionInfo {
    pub fn has_footer(&self) -> bool {
        self.footer.is_some()
    }

    /// Find the vbmeta image in a partition. The partition either starts with
    /// a vbmeta header or ends with a footer that points to one. Returns
    /// [`None`] if neither is the case or if the footer refers to data outside
    /// of the partition.
    pub fn probe(mut reader: impl Read + Seek) -> io::Result<Option<Self>> {
        let size = reader.seek(SeekFrom::End(0))?;

        if size >= HEADER_MAGIC.len() as u64 {
            reader.rewind()?;
            let magic = reader.read_array_exact::<4>()?;

            if magic == HEADER_MAGIC {
                return Ok(Some(Self {
                    size,
                    vbmeta_offset: 0,
                    footer_offset: 0,
                    footer: None,
                }));
            }
        }

        if size < Footer::SIZE as u64 {
            debug!("Partition is too small to contain a footer: {size}");
            return Ok(None);
        }

        let footer_offset = size - Footer::SIZE as u64;
        reader.seek(SeekFrom::Start(footer_offset))?;
        let footer_raw = reader.read_array_exact::<{ Footer::SIZE }>()?;

        let footer = match Footer::from_reader(Cursor::new(&footer_raw)) {
            Ok(f) => f,
            Err(e) => {
                debug!("No valid footer: {e}");
                return Ok(None);
            }
        };

        if !footer.fits(size) {
            warn!("Footer refers to data outside of {size} byte partition: {footer:?}");
            return Ok(None);
        }

        Ok(Some(Self {
            size,
            vbmeta_offset: footer.vbmeta_offset,
            footer_offset,
            footer: Some(footer),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Write};

    use crate::stream::ToWriter;

    use super::*;

    fn footed_image(size: usize, footer: &Footer) -> Vec<u8> {
        let mut data = vec![0u8; size];
        let mut writer = Cursor::new(Vec::new());
        footer.to_writer(&mut writer).unwrap();
        data[size - Footer::SIZE..].copy_from_slice(writer.get_ref());
        data
    }

    #[test]
    fn probe_vbmeta_partition() {
        let mut data = b"AVB0".to_vec();
        data.resize(4096, 0);

        let info = PartitionInfo::probe(Cursor::new(&data)).unwrap().unwrap();
        assert_eq!(info.vbmeta_offset, 0);
        assert!(!info.has_footer());
        assert_eq!(info.size, 4096);
    }

    #[test]
    fn probe_footer() {
        let footer = Footer {
            vbmeta_offset: 4096,
            vbmeta_size: 1024,
            ..Footer::new(4000)
        };
        let data = footed_image(8192, &footer);

        let info = PartitionInfo::probe(Cursor::new(&data)).unwrap().unwrap();
        assert_eq!(info.vbmeta_offset, 4096);
        assert_eq!(info.footer_offset, 8192 - 64);
        assert_eq!(info.footer, Some(footer));
    }

    #[test]
    fn probe_rejects_invalid() {
        assert_eq!(PartitionInfo::probe(Cursor::new(b"AV")).unwrap(), None);
        assert_eq!(PartitionInfo::probe(Cursor::new([0u8; 4096])).unwrap(), None);

        let footer = Footer {
            vbmeta_offset: 8000,
            vbmeta_size: 1024,
            ..Footer::new(4000)
        };
        let data = footed_image(8192, &footer);
        assert_eq!(PartitionInfo::probe(Cursor::new(&data)).unwrap(), None);

        let footer = Footer {
            vbmeta_offset: 4096,
            vbmeta_size: 1024,
            ..Footer::new(10000)
        };
        let data = footed_image(8192, &footer);
        assert_eq!(PartitionInfo::probe(Cursor::new(&data)).unwrap(), None);
    }

    #[test]
    fn memory_partitions_share_data() {
        let partitions = MemoryPartitions::new();
        partitions.insert("boot", b"original".to_vec());

        {
            let mut writer = partitions.open_read_write("boot").unwrap();
            writer.write_all(b"modified").unwrap();
        }

        let mut data = Vec::new();
        partitions
            .open_read("boot")
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"modified");

        partitions.create("copy").unwrap().write_all(b"x").unwrap();
        assert_eq!(partitions.get("copy").unwrap(), b"x");
        assert_eq!(partitions.names(), ["boot", "copy"]);

        let err = partitions.open_read("missing").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn file_partitions() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("vbmeta.img"), b"AVB0").unwrap();

        let dir_partitions = DirPartitions::open_ambient(temp_dir.path()).unwrap();
        let mut data = Vec::new();
        dir_partitions
            .open_read("vbmeta")
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"AVB0");

        let err = dir_partitions.open_read("../vbmeta").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let pattern = format!("{}/%s.img", temp_dir.path().display());
        let pattern_partitions = PatternPartitions::new(pattern);
        pattern_partitions
            .create("boot")
            .unwrap()
            .write_all(b"boot")
            .unwrap();
        assert_eq!(std::fs::read(temp_dir.path().join("boot.img")).unwrap(), b"boot");

        let err = pattern_partitions.open_read("a/b").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
