// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{Arc, Mutex, PoisonError},
};

use crate::util;

/// This is only needed because `dyn Read + Seek` is not a valid construct in
/// Rust yet.
pub trait ReadSeek: Read + Seek {}

impl<R: Read + Seek> ReadSeek for R {}

/// This is only needed because `dyn Read + Write + Seek` is not a valid
/// construct in Rust yet.
pub trait ReadWriteSeek: Read + Write + Seek {}

impl<F: Read + Write + Seek> ReadWriteSeek for F {}

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Common function for writing a structure to a writer.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// Extensions for readers to read and discard data (eg. for padding).
pub trait ReadDiscardExt {
    fn read_discard(&mut self, size: u64) -> io::Result<u64>;

    fn read_discard_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.read_discard(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to read {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<R: Read> ReadDiscardExt for R {
    fn read_discard(&mut self, size: u64) -> io::Result<u64> {
        io::copy(&mut self.take(size), &mut io::sink())
    }
}

/// Extensions for writers to easily write zeros (eg. for padding).
pub trait WriteZerosExt {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64>;

    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()> {
        let n = self.write_zeros(size)?;
        if n != size {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Expected to write {size} bytes, but reached EOF after {n} bytes"),
            ));
        }
        Ok(())
    }
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros(&mut self, size: u64) -> io::Result<u64> {
        // We don't use std::io::copy() on std::io::repeat(0) because it fails
        // if the writer hits EOF before all data is written.
        let mut written = 0;

        while written < size {
            let to_write = (size - written).min(util::ZEROS.len() as u64) as usize;
            let n = self.write(&util::ZEROS[..to_write])?;
            written += n as u64;

            if n < to_write {
                break;
            }
        }

        Ok(written)
    }
}

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for readers to read UTF-8 strings.
pub trait ReadStringExt {
    /// Read exactly `size` bytes as a UTF-8 string.
    fn read_string_exact(&mut self, size: usize) -> io::Result<String>;

    /// Read exactly `size` bytes as a UTF-8 string with trailing NULL bytes
    /// stripped.
    fn read_string_padded(&mut self, size: usize) -> io::Result<String>;
}

impl<R: Read> ReadStringExt for R {
    fn read_string_exact(&mut self, size: usize) -> io::Result<String> {
        let buf = self.read_vec_exact(size)?;

        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read_string_padded(&mut self, size: usize) -> io::Result<String> {
        let mut buf = self.read_vec_exact(size)?;
        let end = buf.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
        buf.truncate(end);

        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Extensions for writers to write strings.
pub trait WriteStringExt {
    /// Write a string padded with NULL bytes to `size` bytes. Fails if the
    /// string is longer than `size`.
    fn write_string_padded(&mut self, s: &str, size: usize) -> io::Result<()>;
}

impl<W: Write> WriteStringExt for W {
    fn write_string_padded(&mut self, s: &str, size: usize) -> io::Result<()> {
        if s.len() > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("String is {} bytes, but must fit in {size} bytes", s.len()),
            ));
        }

        self.write_all(s.as_bytes())?;
        self.write_zeros_exact((size - s.len()) as u64)?;

        Ok(())
    }
}

/// A reader wrapper that implements [`Seek`], but only for reporting the
/// current file position.
pub struct CountingReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn finish(self) -> (R, u64) {
        (self.inner, self.offset)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl<R: Read> Seek for CountingReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if pos == SeekFrom::Current(0) {
            Ok(self.offset)
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Can only report current offset",
            ))
        }
    }
}

/// An in-memory file whose contents are shared by every clone. Each clone has
/// its own file position.
#[derive(Clone, Debug, Default)]
pub struct SharedCursor {
    data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
}

impl SharedCursor {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
            pos: 0,
        }
    }

    /// Create a new handle to the same data with the position reset to 0.
    pub fn reopen(&self) -> Self {
        Self {
            data: self.data.clone(),
            pos: 0,
        }
    }

    /// Get a copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Read for SharedCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let Ok(start) = usize::try_from(self.pos) else {
            return Ok(0);
        };
        if start >= data.len() {
            return Ok(0);
        }

        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;

        Ok(n)
    }
}

impl Write for SharedCursor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let start = usize::try_from(self.pos)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Write out of range"))?;

        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.pos = end as u64;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SharedCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().unwrap_or_else(PoisonError::into_inner).len() as u64;

        let new_pos = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };

        let Some(new_pos) = new_pos else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Invalid seek to a negative or overflowing position",
            ));
        };

        self.pos = new_pos;
        Ok(new_pos)
    }
}

/// Copy exactly `size` bytes from `reader` to `writer`, calling `inspect` on
/// every chunk that passes through.
pub fn copy_n_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    mut inspect: impl FnMut(&[u8]),
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        let to_read = size.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..to_read])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Unexpected EOF with {size} bytes remaining"),
            ));
        }

        inspect(&buf[..n]);
        writer.write_all(&buf[..n])?;

        size -= n as u64;
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`.
pub fn copy_n(reader: impl Read, writer: impl Write, size: u64) -> io::Result<()> {
    copy_n_inspect(reader, writer, size, |_| {})
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Seek, SeekFrom, Write};

    use super::*;

    #[test]
    fn padded_strings() {
        let mut writer = Cursor::new(Vec::new());
        writer.write_string_padded("sha256", 32).unwrap();
        assert_eq!(writer.get_ref().len(), 32);

        writer.rewind().unwrap();
        assert_eq!(writer.read_string_padded(32).unwrap(), "sha256");

        assert!(writer.write_string_padded(&"x".repeat(33), 32).is_err());
    }

    #[test]
    fn shared_cursor_clones_share_data() {
        let mut a = SharedCursor::new(b"hello".to_vec());
        let mut b = a.reopen();

        a.seek(SeekFrom::Start(8)).unwrap();
        a.write_all(b"!").unwrap();

        let mut data = Vec::new();
        b.read_to_end(&mut data).unwrap();
        assert_eq!(data, b"hello\0\0\0!");
    }

    #[test]
    fn copy_n_detects_eof() {
        let reader = Cursor::new(b"abc");
        let err = copy_n(reader, std::io::sink(), 4).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
