// aff4 is a library implementing the AFF4 evidence container format.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::rdf::{Value, AFF4_SIZE};
use crate::resolver::Resolver;
use crate::urn::Urn;
use crate::Aff4Error;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// A `Mode` selects whether a stream or volume is materialised
/// for reading or for appending.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Mode {
    /// The object is read-only.
    Read,
    /// The object accepts appends until closed.
    Write,
}

/// A `Stream` is a seekable logical byte sequence named by a URN.
///
/// All concrete streams (backing files, segments, images, maps) expose
/// this one contract. Operations that touch other objects go through the
/// resolver passed per call; streams hold URNs of their collaborators,
/// never references to them.
pub trait Stream {
    /// Returns the URN naming the `Stream`.
    fn urn(&self) -> &Urn;

    /// Returns the current logical size in bytes.
    fn size(&self) -> u64;

    /// Returns the current read/write position.
    fn tell(&self) -> u64;

    /// Moves the read/write position, returning the new absolute offset.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, Aff4Error>;

    /// Reads up to `buf.len()` bytes at the current position.
    /// Returns 0 at end of stream.
    fn read(&mut self, resolver: &Arc<Resolver>, buf: &mut [u8]) -> Result<usize, Aff4Error>;

    /// Writes `buf` at the current position, extending the size
    /// past the write pointer as needed.
    fn write(&mut self, resolver: &Arc<Resolver>, buf: &[u8]) -> Result<usize, Aff4Error>;

    /// Seals the `Stream`. Closing an already-closed stream is a no-op.
    fn close(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error>;

    /// Reads exactly `buf.len()` bytes or fails with an EOF error.
    fn read_exact(&mut self, resolver: &Arc<Resolver>, buf: &mut [u8]) -> Result<(), Aff4Error> {
        let mut filled = 0;

        while filled < buf.len() {
            match self.read(resolver, &mut buf[filled..])? {
                0 => {
                    return Err(Aff4Error::IoError(io::Error::from(
                        io::ErrorKind::UnexpectedEof,
                    )))
                }
                n => filled += n,
            }
        }

        Ok(())
    }

    /// Writes the whole of `buf`.
    fn write_all(&mut self, resolver: &Arc<Resolver>, buf: &[u8]) -> Result<(), Aff4Error> {
        let mut written = 0;

        while written < buf.len() {
            match self.write(resolver, &buf[written..])? {
                0 => {
                    return Err(Aff4Error::IoError(io::Error::from(
                        io::ErrorKind::WriteZero,
                    )))
                }
                n => written += n,
            }
        }

        Ok(())
    }
}

/// Computes an absolute offset from a seek request against
/// the current position and size.
pub(crate) fn resolve_seek(pos: SeekFrom, tell: u64, size: u64) -> Result<u64, Aff4Error> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::Current(delta) => tell.checked_add_signed(delta),
        SeekFrom::End(delta) => size.checked_add_signed(delta),
    };

    target.ok_or_else(|| {
        Aff4Error::IoError(io::Error::from(io::ErrorKind::InvalidInput))
    })
}

/// A `FileStream` is the seekable byte channel over a local file that
/// everything else is ultimately stored on.
///
/// Concurrent reads from distinct handles on the same file are fine;
/// concurrent writers must hold the resolver's `w` lock on the file URN.
pub struct FileStream {
    urn: Urn,
    file: File,
    mode: Mode,
    readptr: u64,
    size: u64,
    closed: bool,
}

impl FileStream {
    /// Opens the local file named by a `file` scheme URN.
    ///
    /// If the resolver remembers a different size for this URN than the
    /// file currently has, every statement mentioning the URN is stale
    /// and is discarded before the size is republished.
    pub fn open(resolver: &Resolver, urn: &Urn, mode: Mode) -> Result<Self, Aff4Error> {
        let path = urn
            .to_file_path()
            .ok_or_else(|| Aff4Error::Unsupported(format!("scheme \"{}\"", urn.scheme())))?;

        let file = match mode {
            Mode::Read => File::open(&path)?,
            Mode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?,
        };

        let size = file.metadata()?.len();

        if let Ok(cached) = resolver.resolve_integer(urn, AFF4_SIZE) {
            if cached as u64 != size {
                tracing::debug!(%urn, cached, size, "backing file changed, discarding statements");
                resolver.expunge(urn);
            }
        }
        resolver.set(urn, AFF4_SIZE, Value::from(size));

        Ok(Self {
            urn: urn.clone(),
            file,
            mode,
            readptr: 0,
            size,
            closed: false,
        })
    }

    /// Returns the mode the `FileStream` was opened with.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Shrinks or extends the file to exactly `size` bytes.
    pub fn truncate(&mut self, size: u64) -> Result<(), Aff4Error> {
        self.file.set_len(size)?;
        self.size = size;
        self.readptr = self.readptr.min(size);

        Ok(())
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(self.readptr))?;
        let n = self.file.read(buf)?;
        self.readptr += n as u64;

        Ok(n)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(self.readptr))?;
        let n = self.file.write(buf)?;

        self.readptr += n as u64;
        self.size = self.size.max(self.readptr);

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Stream for FileStream {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn tell(&self) -> u64 {
        self.readptr
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64, Aff4Error> {
        self.readptr = resolve_seek(pos, self.readptr, self.size)?;
        Ok(self.readptr)
    }

    fn read(&mut self, _resolver: &Arc<Resolver>, buf: &mut [u8]) -> Result<usize, Aff4Error> {
        Ok(Read::read(self, buf)?)
    }

    fn write(&mut self, _resolver: &Arc<Resolver>, buf: &[u8]) -> Result<usize, Aff4Error> {
        if self.mode != Mode::Write {
            return Err(Aff4Error::IoError(io::Error::from(
                io::ErrorKind::PermissionDenied,
            )));
        }

        Ok(Write::write(self, buf)?)
    }

    fn close(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.mode == Mode::Write {
            self.file.flush()?;
        }
        resolver.set(&self.urn, AFF4_SIZE, Value::from(self.size));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_and_size_tracking() {
        let resolver = Arc::new(Resolver::new());
        let dir = tempfile::tempdir().unwrap();
        let urn = Urn::from_file_path(dir.path().join("scratch"));

        let mut stream = FileStream::open(&resolver, &urn, Mode::Write).unwrap();

        Stream::write(&mut stream, &resolver, b"hello world").unwrap();
        assert_eq!(stream.size(), 11);

        Stream::seek(&mut stream, SeekFrom::Start(6)).unwrap();
        let mut buf = [0; 5];
        Stream::read_exact(&mut stream, &resolver, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        // Overwrite in the middle does not shrink the stream.
        Stream::seek(&mut stream, SeekFrom::Start(0)).unwrap();
        Stream::write(&mut stream, &resolver, b"HELLO").unwrap();
        assert_eq!(stream.size(), 11);

        stream.close(&resolver).unwrap();
        assert_eq!(resolver.resolve_integer(&urn, AFF4_SIZE).unwrap(), 11);
    }

    #[test]
    fn stale_statements_discarded_on_reopen() {
        let resolver = Arc::new(Resolver::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grown");
        let urn = Urn::from_file_path(&path);

        let mut stream = FileStream::open(&resolver, &urn, Mode::Write).unwrap();
        Stream::write(&mut stream, &resolver, b"12345").unwrap();
        stream.close(&resolver).unwrap();

        resolver.set(&urn, "aff4:note", Value::from("stale"));

        // Grow the file behind the resolver's back.
        std::fs::write(&path, b"123456789").unwrap();

        let stream = FileStream::open(&resolver, &urn, Mode::Read).unwrap();
        assert_eq!(stream.size(), 9);
        assert!(resolver.resolve_value(&urn, "aff4:note").is_err());
        assert_eq!(resolver.resolve_integer(&urn, AFF4_SIZE).unwrap(), 9);
    }
}
