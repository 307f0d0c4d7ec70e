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

use crate::config::{COMPRESSION_DEFLATE, COMPRESSION_STORED};
use crate::rdf::{
    parse_properties, serialise_properties, Value, AFF4_COMPRESSED_SIZE, AFF4_CONTAINS, AFF4_CRC,
    AFF4_DIRECTORY_OFFSET, AFF4_DIRTY, AFF4_FILE_OFFSET, AFF4_HEADER_OFFSET, AFF4_SHA256,
    AFF4_SIZE, AFF4_STORED, AFF4_TIMESTAMP, AFF4_TYPE, AFF4_ZIP_COMPRESSION, TYPE_SEGMENT,
    TYPE_ZIP_VOLUME,
};
use crate::resolver::{Object, Resolver, Volume};
use crate::stream::{resolve_seek, FileStream, Mode, Stream};
use crate::urn::Urn;
use crate::Aff4Error;

use std::io::{Read, SeekFrom, Write};
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};

const LOCAL_MAGIC: u32 = 0x0403_4b50;
const CD_MAGIC: u32 = 0x0201_4b50;
const EOCD_MAGIC: u32 = 0x0605_4b50;
const DESCRIPTOR_MAGIC: u32 = 0x0807_4b50;
const ZIP64_EOCD_MAGIC: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_MAGIC: u32 = 0x0706_4b50;
const ZIP64_EXTRA_TAG: u16 = 0x0001;

const LOCAL_HEADER_LEN: usize = 30;
const CD_HEADER_LEN: usize = 46;
const EOCD_LEN: usize = 22;
const ZIP64_EOCD_LEN: usize = 56;
const ZIP64_LOCATOR_LEN: usize = 20;

/// The largest value representable without Zip64 extensions.
const ZIP64_LIMIT: u64 = (1 << 31) - 1;

/// How far from the end of the backing file the end-of-central-directory
/// record is searched for.
const EOCD_SCAN_WINDOW: u64 = 64 * 1024;

/// Member names keep only characters safe on every filesystem;
/// everything else is percent-escaped.
const MEMBER_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'_')
    .remove(b'/')
    .remove(b'-');

/// Escapes a relative member name for storage in the archive.
pub fn escape_member_name(name: &str) -> String {
    utf8_percent_encode(name, MEMBER_ESCAPE).to_string()
}

/// Reverses [`escape_member_name`].
pub fn unescape_member_name(name: &str) -> Result<String, Aff4Error> {
    percent_decode_str(name)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Aff4Error::InvalidFormat("member name escape"))
}

/// Converts a UTC instant into DOS (date, time) words.
fn to_dos(time: DateTime<Utc>) -> (u16, u16) {
    let year = (time.year().clamp(1980, 2107) - 1980) as u16;
    let date = year << 9 | (time.month() as u16) << 5 | time.day() as u16;
    let time = (time.hour() as u16) << 11 | (time.minute() as u16) << 5 | (time.second() as u16) / 2;

    (date, time)
}

/// Converts DOS (date, time) words, interpreted as UTC, back into an
/// instant. Returns `None` for nonsense field values.
fn from_dos(date: u16, time: u16) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(
        1980 + (date >> 9) as i32,
        ((date >> 5) & 0xF) as u32,
        (date & 0x1F) as u32,
        (time >> 11) as u32,
        ((time >> 5) & 0x3F) as u32,
        ((time & 0x1F) * 2) as u32,
    )
    .single()
}

/// A sequential little-endian reader over a parsed buffer.
struct Fields<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.bytes(8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }
}

/// One parsed central-directory entry.
struct CdEntry {
    compression: u16,
    timestamp: Option<DateTime<Utc>>,
    crc: u32,
    compress_size: u64,
    file_size: u64,
    header_offset: u64,
    name: String,
}

/// Reads `len` bytes at `offset` from a stream.
fn read_exact_at(
    stream: &mut dyn Stream,
    resolver: &Arc<Resolver>,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>, Aff4Error> {
    stream.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0; len];
    stream.read_exact(resolver, &mut buf)?;

    Ok(buf)
}

/// A `ZipVolume` is a Zip64-capable archive acting as an AFF4
/// container. The object itself is thin: everything the engine knows
/// about the archive (member offsets, sizes, the append position) lives
/// as statements in the resolver, so any number of instances can serve
/// the same volume.
pub struct ZipVolume {
    urn: Urn,
    backing: Urn,
    mode: Mode,
}

impl ZipVolume {
    /// Returns the URN naming the `ZipVolume`.
    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    /// Returns the URN of the backing file the archive is stored on.
    pub fn backing(&self) -> &Urn {
        &self.backing
    }

    /// Returns the [`Mode`] the `ZipVolume` was opened with.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Creates a fresh, empty volume on the backing file. The file is
    /// truncated; a missing `urn` is replaced by a random identity.
    pub fn create(
        resolver: &Arc<Resolver>,
        urn: Option<Urn>,
        backing: &Urn,
    ) -> Result<Self, Aff4Error> {
        let urn = urn.unwrap_or_else(Urn::random);

        let mut fd = resolver.open(backing, Mode::Write)?.into_file()?;
        fd.truncate(0)?;
        resolver.cache_return(Object::File(fd));

        Self::publish_fresh(resolver, &urn, backing);

        Ok(Self {
            urn,
            backing: backing.clone(),
            mode: Mode::Write,
        })
    }

    /// Opens the archive stored on a backing file, parsing its central
    /// directory and manifest. In write mode a missing or empty archive
    /// becomes a fresh volume instead of an error.
    pub fn open_file(
        resolver: &Arc<Resolver>,
        backing: &Urn,
        mode: Mode,
    ) -> Result<Self, Aff4Error> {
        Self::parse(resolver, None, backing, mode)
    }

    /// Materialises a volume whose URN is already known to the
    /// resolver. Used by the type dispatcher.
    pub fn load(resolver: &Arc<Resolver>, urn: &Urn, mode: Mode) -> Result<Self, Aff4Error> {
        let backing = resolver.resolve_urn(urn, AFF4_STORED)?;

        // A plausible append position means the directory was already
        // parsed (or is being written) in this process.
        if let Ok(offset) = resolver.resolve_integer(urn, AFF4_DIRECTORY_OFFSET) {
            if let Ok(size) = resolver.resolve_integer(&backing, AFF4_SIZE) {
                if offset >= 0 && offset <= size {
                    return Ok(Self {
                        urn: urn.clone(),
                        backing,
                        mode,
                    });
                }
            }
        }

        Self::parse(resolver, Some(urn), &backing, mode)
    }

    fn publish_fresh(resolver: &Resolver, urn: &Urn, backing: &Urn) {
        resolver.set(urn, AFF4_STORED, Value::Urn(backing.clone()));
        resolver.set(urn, AFF4_TYPE, Value::from(TYPE_ZIP_VOLUME));
        resolver.set(urn, AFF4_DIRECTORY_OFFSET, Value::Integer(0));
        resolver.set(urn, AFF4_DIRTY, Value::Integer(1));
    }

    fn parse(
        resolver: &Arc<Resolver>,
        urn_hint: Option<&Urn>,
        backing: &Urn,
        mode: Mode,
    ) -> Result<Self, Aff4Error> {
        let mut fd = resolver.open(backing, mode)?;
        let stream = fd
            .as_stream()
            .ok_or(Aff4Error::InvalidFormat("volume backing"))?;

        let size = stream.size();
        let window = size.min(EOCD_SCAN_WINDOW);
        let tail = read_exact_at(stream, resolver, size - window, window as usize)?;

        let eocd_pos = find_eocd(&tail);

        let Some(eocd_pos) = eocd_pos else {
            resolver.cache_return(fd);

            // No directory; only acceptable when starting a new volume.
            if mode == Mode::Write {
                let urn = urn_hint.cloned().unwrap_or_else(Urn::random);
                Self::publish_fresh(resolver, &urn, backing);

                return Ok(Self {
                    urn,
                    backing: backing.clone(),
                    mode,
                });
            }

            return Err(Aff4Error::InvalidFormat("end of central directory"));
        };

        let eocd_offset = size - window + eocd_pos as u64;

        let mut fields = Fields::new(&tail[eocd_pos + 4..]);
        let disk_number = fields.u16();
        let disk_with_cd = fields.u16();
        let _entries_on_disk = fields.u16();
        let entries = fields.u16();
        let _cd_size = fields.u32();
        let cd_offset = fields.u32();
        let comment_len = fields.u16();

        let (Some(disk_number), Some(disk_with_cd), Some(entries), Some(cd_offset), Some(comment_len)) =
            (disk_number, disk_with_cd, entries, cd_offset, comment_len)
        else {
            resolver.cache_return(fd);
            return Err(Aff4Error::InvalidFormat("end of central directory"));
        };

        if disk_number != 0 || disk_with_cd != 0 {
            resolver.cache_return(fd);
            return Err(Aff4Error::Unsupported("multi-disk archive".to_string()));
        }

        // The comment may carry the volume's own identity.
        let comment = tail
            .get(eocd_pos + EOCD_LEN..eocd_pos + EOCD_LEN + comment_len as usize)
            .and_then(|bytes| std::str::from_utf8(bytes).ok());
        let urn = comment
            .and_then(|c| Urn::try_from(c).ok())
            .or_else(|| urn_hint.cloned())
            .unwrap_or_else(Urn::random);

        resolver.set(&urn, AFF4_STORED, Value::Urn(backing.clone()));
        resolver.set(&urn, AFF4_TYPE, Value::from(TYPE_ZIP_VOLUME));

        let result = Self::parse_directory(
            resolver,
            &urn,
            fd.as_stream().expect("checked above"),
            eocd_offset,
            entries as u64,
            cd_offset,
        );

        resolver.cache_return(fd);

        let properties = result?;
        for member in properties {
            match read_member_bytes(resolver, &member) {
                Ok(bytes) => {
                    let base = member.join("..");
                    let text = String::from_utf8_lossy(&bytes);
                    parse_properties(resolver, &urn, &base, &text);
                }
                Err(e) => {
                    tracing::warn!(%member, error = %e, "unreadable properties segment");
                }
            }
        }

        Ok(Self {
            urn,
            backing: backing.clone(),
            mode,
        })
    }

    /// Parses the central directory, publishing one statement group per
    /// member. Returns the manifest segments encountered.
    fn parse_directory(
        resolver: &Arc<Resolver>,
        urn: &Urn,
        stream: &mut dyn Stream,
        eocd_offset: u64,
        mut entries: u64,
        cd_offset: u32,
    ) -> Result<Vec<Urn>, Aff4Error> {
        let cd_start = if cd_offset == u32::MAX || entries == u16::MAX as u64 {
            match locate_zip64(stream, resolver, eocd_offset)? {
                Some((entries_total, offset)) => {
                    entries = entries_total;
                    offset
                }
                // A saturated entry count without Zip64 records is
                // still a valid classical directory.
                None if cd_offset != u32::MAX => cd_offset as u64,
                None => return Err(Aff4Error::InvalidFormat("Zip64 locator")),
            }
        } else {
            cd_offset as u64
        };

        // The directory sits between cd_start and the trailing records.
        let cd_len = (eocd_offset - cd_start) as usize;
        let directory = read_exact_at(stream, resolver, cd_start, cd_len)?;

        let mut properties = Vec::new();
        let mut pos = 0;

        for _ in 0..entries {
            let (entry, next) = parse_cd_entry(&directory, pos)?;
            pos = next;

            let name = unescape_member_name(&entry.name)?;
            let member = if name.starts_with(&urn.to_string()) {
                Urn::try_from(name.as_str()).unwrap_or_else(|_| urn.join(&name))
            } else {
                urn.join(&name)
            };

            resolver.set(&member, AFF4_STORED, Value::Urn(urn.clone()));
            resolver.set(&member, AFF4_TYPE, Value::from(TYPE_SEGMENT));
            resolver.add(urn, AFF4_CONTAINS, Value::Urn(member.clone()), true);

            if let Some(timestamp) = entry.timestamp {
                resolver.set(&member, AFF4_TIMESTAMP, Value::from(timestamp));
            }
            resolver.set(&member, AFF4_ZIP_COMPRESSION, Value::UInt(entry.compression as u32));
            resolver.set(&member, AFF4_CRC, Value::UInt(entry.crc));
            resolver.set(&member, AFF4_SIZE, Value::from(entry.file_size));
            resolver.set(&member, AFF4_COMPRESSED_SIZE, Value::from(entry.compress_size));
            resolver.set(&member, AFF4_HEADER_OFFSET, Value::from(entry.header_offset));

            // The local header carries its own name and extra lengths,
            // which position the member's data.
            let local = read_exact_at(stream, resolver, entry.header_offset, LOCAL_HEADER_LEN)?;
            let mut fields = Fields::new(&local);
            if fields.u32() != Some(LOCAL_MAGIC) {
                return Err(Aff4Error::InvalidFormat("local file header"));
            }
            fields.bytes(22);
            let name_len = fields.u16().unwrap_or(0) as u64;
            let extra_len = fields.u16().unwrap_or(0) as u64;

            let file_offset = entry.header_offset + LOCAL_HEADER_LEN as u64 + name_len + extra_len;
            resolver.set(&member, AFF4_FILE_OFFSET, Value::from(file_offset));

            if name.ends_with("properties") {
                properties.push(member);
            }
        }

        tracing::debug!(volume = %urn, entries, "parsed central directory");

        // Appends overwrite the old directory, which is rewritten on close.
        resolver.set(urn, AFF4_DIRECTORY_OFFSET, Value::from(cd_start));

        Ok(properties)
    }

    /// Returns the fully-qualified URN of a member name.
    pub fn member_urn(&self, name: &str) -> Urn {
        if name.starts_with(&self.urn.to_string()) {
            Urn::try_from(name).unwrap_or_else(|_| self.urn.join(name))
        } else {
            self.urn.join(name)
        }
    }

    /// Opens a member for writing, starting its local header at the
    /// current append position. The backing file stays locked until the
    /// returned [`SegmentWriter`] is closed.
    ///
    /// Re-creating a member that already exists first discards every
    /// statement about it; the index then only ever references the
    /// newest copy.
    pub fn open_member_w(
        &self,
        resolver: &Arc<Resolver>,
        name: &str,
        compression: u16,
    ) -> Result<SegmentWriter, Aff4Error> {
        if self.mode != Mode::Write {
            return Err(Aff4Error::Unsupported(
                "volume is opened read-only".to_string(),
            ));
        }

        let member = self.member_urn(name);
        let escaped = escape_member_name(&member.relative_name(&self.urn));

        if resolver.resolve_value(&member, AFF4_FILE_OFFSET).is_ok() {
            resolver.del(&member, None);
        }

        resolver.set(&self.urn, AFF4_DIRTY, Value::Integer(1));
        let header_offset = resolver.resolve_integer(&self.urn, AFF4_DIRECTORY_OFFSET)? as u64;

        resolver.lock(&self.backing, 'w')?;
        match self.start_member(resolver, &member, &escaped, compression, header_offset) {
            Ok(writer) => Ok(writer),
            Err(e) => {
                resolver.unlock(&self.backing, 'w');
                Err(e)
            }
        }
    }

    fn start_member(
        &self,
        resolver: &Arc<Resolver>,
        member: &Urn,
        escaped: &str,
        compression: u16,
        header_offset: u64,
    ) -> Result<SegmentWriter, Aff4Error> {
        let mut fd = resolver.open(&self.backing, Mode::Write)?.into_file()?;
        Stream::seek(&mut fd, SeekFrom::Start(header_offset))?;

        let (dos_date, dos_time) = to_dos(Utc::now());

        let mut header = Vec::with_capacity(LOCAL_HEADER_LEN + escaped.len());
        header.extend_from_slice(&LOCAL_MAGIC.to_le_bytes());
        header.extend_from_slice(&0x14u16.to_le_bytes()); // version needed
        header.extend_from_slice(&0x08u16.to_le_bytes()); // sizes in data descriptor
        header.extend_from_slice(&compression.to_le_bytes());
        header.extend_from_slice(&dos_time.to_le_bytes());
        header.extend_from_slice(&dos_date.to_le_bytes());
        header.extend_from_slice(&[0; 12]); // crc32, compress_size, file_size
        header.extend_from_slice(&(escaped.len() as u16).to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes()); // extra field
        header.extend_from_slice(escaped.as_bytes());

        Write::write_all(&mut fd, &header)?;

        let file_offset = fd.tell();
        resolver.set(member, AFF4_ZIP_COMPRESSION, Value::UInt(compression as u32));
        resolver.set(member, AFF4_FILE_OFFSET, Value::from(file_offset));
        resolver.set(member, AFF4_HEADER_OFFSET, Value::from(header_offset));

        let sink = match compression {
            COMPRESSION_DEFLATE => {
                MemberSink::Deflate(DeflateEncoder::new(fd, Compression::best()))
            }
            COMPRESSION_STORED => MemberSink::Stored(fd),
            other => {
                return Err(Aff4Error::Unsupported(format!(
                    "compression method {other}"
                )))
            }
        };

        Ok(SegmentWriter {
            urn: member.clone(),
            volume: self.urn.clone(),
            backing: self.backing.clone(),
            compression,
            sink: Some(sink),
            crc: crc32fast::Hasher::new(),
            digest: Sha256::new(),
            size: 0,
            file_offset,
            closed: false,
        })
    }

    /// Opens a member of this volume for reading.
    pub fn open_member_r(
        &self,
        resolver: &Arc<Resolver>,
        name: &str,
    ) -> Result<SegmentStream, Aff4Error> {
        let member = self.member_urn(name);

        if !resolver.is_set(&self.urn, AFF4_CONTAINS, &Value::Urn(member.clone())) {
            return Err(Aff4Error::NotFound {
                subject: member,
                attribute: AFF4_CONTAINS.to_string(),
            });
        }

        SegmentStream::open(resolver, &member)
    }
}

impl Volume for ZipVolume {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn write_member(
        &mut self,
        resolver: &Arc<Resolver>,
        name: &str,
        data: &[u8],
        compression: u16,
    ) -> Result<Urn, Aff4Error> {
        let mut writer = self.open_member_w(resolver, name, compression)?;

        match writer.write(data) {
            Ok(()) => {
                writer.close(resolver)?;
                Ok(writer.urn)
            }
            Err(e) => {
                // Seal what we can so the backing lock is released.
                let _ = writer.close(resolver);
                Err(e)
            }
        }
    }

    fn read_member(
        &mut self,
        resolver: &Arc<Resolver>,
        member: &Urn,
    ) -> Result<Vec<u8>, Aff4Error> {
        read_member_bytes(resolver, member)
    }

    fn close(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        if resolver.resolve_value(&self.urn, AFF4_DIRTY).is_err() {
            return Ok(());
        }

        let manifest = serialise_properties(resolver, &self.urn);
        if !manifest.is_empty() {
            self.write_member(resolver, "properties", manifest.as_bytes(), COMPRESSION_STORED)?;
        }

        let directory_offset = resolver.resolve_integer(&self.urn, AFF4_DIRECTORY_OFFSET)? as u64;

        resolver.lock(&self.backing, 'w')?;
        let result = self.write_directory(resolver, directory_offset);
        resolver.unlock(&self.backing, 'w');
        result?;

        resolver.del(&self.urn, Some(AFF4_DIRTY));
        tracing::debug!(volume = %self.urn, "volume closed");

        Ok(())
    }
}

impl ZipVolume {
    fn write_directory(
        &self,
        resolver: &Arc<Resolver>,
        directory_offset: u64,
    ) -> Result<(), Aff4Error> {
        let mut fd = resolver.open(&self.backing, Mode::Write)?.into_file()?;
        Stream::seek(&mut fd, SeekFrom::Start(directory_offset))?;

        let mut entries: u64 = 0;

        for value in resolver.resolve_list(&self.urn, AFF4_CONTAINS) {
            let Value::Urn(member) = value else { continue };

            match resolver.resolve_string(&member, AFF4_TYPE) {
                Ok(stream_type) if stream_type == TYPE_SEGMENT => {}
                _ => continue,
            }

            let record = self.cd_record(resolver, &member)?;
            Write::write_all(&mut fd, &record)?;
            entries += 1;
        }

        let cd_end = fd.tell();
        let cd_size = cd_end - directory_offset;

        if directory_offset > ZIP64_LIMIT || entries >= u16::MAX as u64 {
            let mut zip64 = Vec::with_capacity(ZIP64_EOCD_LEN + ZIP64_LOCATOR_LEN);
            zip64.extend_from_slice(&ZIP64_EOCD_MAGIC.to_le_bytes());
            zip64.extend_from_slice(&((ZIP64_EOCD_LEN - 12) as u64).to_le_bytes());
            zip64.extend_from_slice(&0x2du16.to_le_bytes()); // version made by
            zip64.extend_from_slice(&0x2du16.to_le_bytes()); // version needed
            zip64.extend_from_slice(&0u32.to_le_bytes()); // this disk
            zip64.extend_from_slice(&0u32.to_le_bytes()); // disk with CD
            zip64.extend_from_slice(&entries.to_le_bytes());
            zip64.extend_from_slice(&entries.to_le_bytes());
            zip64.extend_from_slice(&cd_size.to_le_bytes());
            zip64.extend_from_slice(&directory_offset.to_le_bytes());

            zip64.extend_from_slice(&ZIP64_LOCATOR_MAGIC.to_le_bytes());
            zip64.extend_from_slice(&0u32.to_le_bytes()); // disk with Zip64 EoCD
            zip64.extend_from_slice(&cd_end.to_le_bytes());
            zip64.extend_from_slice(&1u32.to_le_bytes()); // total disks

            Write::write_all(&mut fd, &zip64)?;
        }

        let comment = self.urn.to_string();
        let eocd_cd_offset = if directory_offset > ZIP64_LIMIT {
            u32::MAX
        } else {
            directory_offset as u32
        };

        let mut eocd = Vec::with_capacity(EOCD_LEN + comment.len());
        eocd.extend_from_slice(&EOCD_MAGIC.to_le_bytes());
        eocd.extend_from_slice(&0u16.to_le_bytes()); // this disk
        eocd.extend_from_slice(&0u16.to_le_bytes()); // disk with CD
        eocd.extend_from_slice(&(entries.min(u16::MAX as u64) as u16).to_le_bytes());
        eocd.extend_from_slice(&(entries.min(u16::MAX as u64) as u16).to_le_bytes());
        eocd.extend_from_slice(&(cd_size.min(u32::MAX as u64) as u32).to_le_bytes());
        eocd.extend_from_slice(&eocd_cd_offset.to_le_bytes());
        eocd.extend_from_slice(&(comment.len() as u16).to_le_bytes());
        eocd.extend_from_slice(comment.as_bytes());

        Write::write_all(&mut fd, &eocd)?;

        // Drop anything a previous, longer directory left behind.
        let end = fd.tell();
        fd.truncate(end)?;
        Write::flush(&mut fd)?;

        resolver.cache_return(Object::File(fd));

        Ok(())
    }

    /// Builds one central-directory record, appending a Zip64 extra
    /// field when any of size, compressed size or header offset
    /// overflows the classical fields.
    fn cd_record(&self, resolver: &Arc<Resolver>, member: &Urn) -> Result<Vec<u8>, Aff4Error> {
        let escaped = escape_member_name(&member.relative_name(&self.urn));

        let size = resolver.resolve_integer(member, AFF4_SIZE)? as u64;
        let compress_size = resolver.resolve_integer(member, AFF4_COMPRESSED_SIZE)? as u64;
        let header_offset = resolver.resolve_integer(member, AFF4_HEADER_OFFSET)? as u64;
        let compression = resolver
            .resolve_uint(member, AFF4_ZIP_COMPRESSION)
            .unwrap_or(COMPRESSION_STORED as u32) as u16;
        let crc = resolver.resolve_uint(member, AFF4_CRC).unwrap_or(0);
        let timestamp = match resolver.resolve_value(member, AFF4_TIMESTAMP) {
            Ok(Value::Timestamp(t)) => t.with_timezone(&Utc),
            _ => Utc::now(),
        };

        // The extra field holds 64-bit values for every field up to the
        // last overflowing one; each spilled field is marked in the
        // classical record.
        let fields = [size, compress_size, header_offset];
        let spill = fields
            .iter()
            .rposition(|&v| v > ZIP64_LIMIT)
            .map(|i| i + 1)
            .unwrap_or(0);

        let mut extra = Vec::new();
        if spill > 0 {
            extra.extend_from_slice(&ZIP64_EXTRA_TAG.to_le_bytes());
            extra.extend_from_slice(&((spill * 8) as u16).to_le_bytes());
            for &value in &fields[..spill] {
                extra.extend_from_slice(&value.to_le_bytes());
            }
        }

        let classical = |index: usize, value: u64| -> u32 {
            if index < spill {
                u32::MAX
            } else {
                value as u32
            }
        };

        let (dos_date, dos_time) = to_dos(timestamp);

        let mut record = Vec::with_capacity(CD_HEADER_LEN + escaped.len() + extra.len());
        record.extend_from_slice(&CD_MAGIC.to_le_bytes());
        record.extend_from_slice(&0x0317u16.to_le_bytes()); // made by: Unix
        record.extend_from_slice(&0x14u16.to_le_bytes()); // version needed
        record.extend_from_slice(&0x08u16.to_le_bytes()); // data descriptor
        record.extend_from_slice(&compression.to_le_bytes());
        record.extend_from_slice(&dos_time.to_le_bytes());
        record.extend_from_slice(&dos_date.to_le_bytes());
        record.extend_from_slice(&crc.to_le_bytes());
        record.extend_from_slice(&classical(1, compress_size).to_le_bytes());
        record.extend_from_slice(&classical(0, size).to_le_bytes());
        record.extend_from_slice(&(escaped.len() as u16).to_le_bytes());
        record.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        record.extend_from_slice(&0u16.to_le_bytes()); // comment
        record.extend_from_slice(&0u16.to_le_bytes()); // disk number
        record.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        record.extend_from_slice(&(0o644u32 << 16).to_le_bytes()); // external attrs
        record.extend_from_slice(&classical(2, header_offset).to_le_bytes());
        record.extend_from_slice(escaped.as_bytes());
        record.extend_from_slice(&extra);

        Ok(record)
    }
}

/// Follows the Zip64 locator preceding the end-of-central-directory
/// record to the Zip64 record, returning the total entry count and the
/// directory offset. Returns `None` when no locator is present.
fn locate_zip64(
    stream: &mut dyn Stream,
    resolver: &Arc<Resolver>,
    eocd_offset: u64,
) -> Result<Option<(u64, u64)>, Aff4Error> {
    if eocd_offset < ZIP64_LOCATOR_LEN as u64 {
        return Ok(None);
    }

    let locator = read_exact_at(
        stream,
        resolver,
        eocd_offset - ZIP64_LOCATOR_LEN as u64,
        ZIP64_LOCATOR_LEN,
    )?;
    let mut fields = Fields::new(&locator);

    if fields.u32() != Some(ZIP64_LOCATOR_MAGIC) {
        return Ok(None);
    }
    let disk_with_eocd = fields.u32();
    let zip64_eocd_offset = fields.u64();
    let total_disks = fields.u32();

    if disk_with_eocd != Some(0) || total_disks.map(|d| d > 1).unwrap_or(true) {
        return Err(Aff4Error::Unsupported("multi-disk archive".to_string()));
    }

    let zip64_eocd_offset = zip64_eocd_offset.ok_or(Aff4Error::InvalidFormat("Zip64 locator"))?;
    let record = read_exact_at(stream, resolver, zip64_eocd_offset, ZIP64_EOCD_LEN)?;
    let mut fields = Fields::new(&record);

    if fields.u32() != Some(ZIP64_EOCD_MAGIC) {
        return Err(Aff4Error::InvalidFormat("Zip64 end of central directory"));
    }
    let _record_size = fields.u64();
    let _version_made_by = fields.u16();
    let _version_needed = fields.u16();
    let disk_number = fields.u32();
    let disk_with_cd = fields.u32();
    let entries_on_disk = fields.u64();
    let entries_total = fields.u64();
    let _cd_size = fields.u64();
    let offset = fields.u64();

    if disk_number != Some(0) || disk_with_cd != Some(0) || entries_on_disk != entries_total {
        return Err(Aff4Error::Unsupported("multi-disk archive".to_string()));
    }

    let entries_total =
        entries_total.ok_or(Aff4Error::InvalidFormat("Zip64 end of central directory"))?;
    let offset = offset.ok_or(Aff4Error::InvalidFormat("Zip64 end of central directory"))?;

    Ok(Some((entries_total, offset)))
}

/// Scans a trailing window backwards for the end-of-central-directory
/// signature, returning the offset of its last occurrence.
fn find_eocd(tail: &[u8]) -> Option<usize> {
    if tail.len() < EOCD_LEN {
        return None;
    }

    (0..=tail.len() - EOCD_LEN)
        .rev()
        .find(|&i| u32::from_le_bytes([tail[i], tail[i + 1], tail[i + 2], tail[i + 3]]) == EOCD_MAGIC)
}

/// Parses one central-directory entry starting at `pos`, resolving any
/// Zip64 extra field. Returns the entry and the offset of the next one.
fn parse_cd_entry(directory: &[u8], pos: usize) -> Result<(CdEntry, usize), Aff4Error> {
    let bad = || Aff4Error::InvalidFormat("central directory header");

    let header = directory.get(pos..pos + CD_HEADER_LEN).ok_or_else(bad)?;
    let mut fields = Fields::new(header);

    if fields.u32() != Some(CD_MAGIC) {
        return Err(bad());
    }
    let _version_made_by = fields.u16();
    let _version_needed = fields.u16();
    let _flags = fields.u16();
    let compression = fields.u16().ok_or_else(bad)?;
    let dos_time = fields.u16().ok_or_else(bad)?;
    let dos_date = fields.u16().ok_or_else(bad)?;
    let crc = fields.u32().ok_or_else(bad)?;
    let compress_size32 = fields.u32().ok_or_else(bad)?;
    let file_size32 = fields.u32().ok_or_else(bad)?;
    let name_len = fields.u16().ok_or_else(bad)? as usize;
    let extra_len = fields.u16().ok_or_else(bad)? as usize;
    let comment_len = fields.u16().ok_or_else(bad)? as usize;
    let _disk_number = fields.u16();
    let _internal_attrs = fields.u16();
    let _external_attrs = fields.u32();
    let header_offset32 = fields.u32().ok_or_else(bad)?;

    let name_start = pos + CD_HEADER_LEN;
    let name = directory
        .get(name_start..name_start + name_len)
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .ok_or_else(bad)?
        .to_string();

    let extra_start = name_start + name_len;
    let extra = directory
        .get(extra_start..extra_start + extra_len)
        .ok_or_else(bad)?;

    let (file_size, compress_size, header_offset) = resolve_zip64_extra(
        extra,
        file_size32,
        compress_size32,
        header_offset32,
    )?;

    let entry = CdEntry {
        compression,
        timestamp: from_dos(dos_date, dos_time),
        crc,
        compress_size,
        file_size,
        header_offset,
        name,
    };

    Ok((entry, extra_start + extra_len + comment_len))
}

/// Walks an extra-field blob for the Zip64 tag and substitutes the
/// 64-bit values for every classical field holding the overflow marker.
fn resolve_zip64_extra(
    extra: &[u8],
    file_size32: u32,
    compress_size32: u32,
    header_offset32: u32,
) -> Result<(u64, u64, u64), Aff4Error> {
    let mut file_size = file_size32 as u64;
    let mut compress_size = compress_size32 as u64;
    let mut header_offset = header_offset32 as u64;

    let mut fields = Fields::new(extra);
    while let (Some(tag), Some(len)) = (fields.u16(), fields.u16()) {
        let Some(data) = fields.bytes(len as usize) else {
            return Err(Aff4Error::InvalidFormat("Zip64 extra field"));
        };

        if tag != ZIP64_EXTRA_TAG {
            continue;
        }

        let mut values = Fields::new(data);
        if file_size32 == u32::MAX {
            file_size = values
                .u64()
                .ok_or(Aff4Error::InvalidFormat("Zip64 extra field"))?;
        }
        if compress_size32 == u32::MAX {
            compress_size = values
                .u64()
                .ok_or(Aff4Error::InvalidFormat("Zip64 extra field"))?;
        }
        if header_offset32 == u32::MAX {
            header_offset = values
                .u64()
                .ok_or(Aff4Error::InvalidFormat("Zip64 extra field"))?;
        }
    }

    Ok((file_size, compress_size, header_offset))
}

enum MemberSink {
    Stored(FileStream),
    Deflate(DeflateEncoder<FileStream>),
}

/// A `SegmentWriter` streams one member into the volume. The backing
/// file is held (and its `w` lock kept) until the writer is closed, so
/// nothing can interleave bytes into the member.
///
/// Sizes and the CRC are deferred to a trailing data descriptor, which
/// is what lets members stream without a known length.
pub struct SegmentWriter {
    urn: Urn,
    volume: Urn,
    backing: Urn,
    compression: u16,
    sink: Option<MemberSink>,
    crc: crc32fast::Hasher,
    digest: Sha256,
    size: u64,
    file_offset: u64,
    closed: bool,
}

impl SegmentWriter {
    /// Returns the URN naming the member being written.
    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    /// Appends bytes to the member.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Aff4Error> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(Aff4Error::IoError(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        };

        self.crc.update(buf);
        self.digest.update(buf);
        self.size += buf.len() as u64;

        match sink {
            MemberSink::Stored(fd) => Write::write_all(fd, buf)?,
            MemberSink::Deflate(encoder) => Write::write_all(encoder, buf)?,
        }

        Ok(())
    }

    /// Seals the member: flushes the compressor, writes the data
    /// descriptor, publishes the member's statements and releases the
    /// backing file. Closing twice is a no-op.
    pub fn close(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = self.finish(resolver);

        resolver.unlock(&self.backing, 'w');
        result
    }

    fn finish(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        let mut fd = match self.sink.take() {
            Some(MemberSink::Stored(fd)) => fd,
            Some(MemberSink::Deflate(encoder)) => encoder.finish()?,
            None => return Ok(()),
        };

        let compress_size = fd.tell() - self.file_offset;
        let crc = self.crc.clone().finalize();

        let mut descriptor = Vec::with_capacity(24);
        descriptor.extend_from_slice(&DESCRIPTOR_MAGIC.to_le_bytes());
        descriptor.extend_from_slice(&crc.to_le_bytes());

        if self.size > ZIP64_LIMIT || compress_size > ZIP64_LIMIT || self.file_offset > ZIP64_LIMIT
        {
            descriptor.extend_from_slice(&compress_size.to_le_bytes());
            descriptor.extend_from_slice(&self.size.to_le_bytes());
        } else {
            descriptor.extend_from_slice(&(compress_size as u32).to_le_bytes());
            descriptor.extend_from_slice(&(self.size as u32).to_le_bytes());
        }

        Write::write_all(&mut fd, &descriptor)?;

        resolver.add(&self.volume, AFF4_CONTAINS, Value::Urn(self.urn.clone()), true);
        resolver.set(&self.urn, AFF4_STORED, Value::Urn(self.volume.clone()));
        resolver.set(&self.urn, AFF4_TYPE, Value::from(TYPE_SEGMENT));
        resolver.set(&self.urn, AFF4_TIMESTAMP, Value::from(Utc::now()));
        resolver.set(&self.urn, AFF4_SIZE, Value::from(self.size));
        resolver.set(&self.urn, AFF4_COMPRESSED_SIZE, Value::from(compress_size));
        resolver.set(&self.urn, AFF4_CRC, Value::UInt(crc));
        resolver.set(
            &self.urn,
            AFF4_SHA256,
            Value::Bytes(self.digest.clone().finalize().to_vec()),
        );
        resolver.set(
            &self.urn,
            AFF4_ZIP_COMPRESSION,
            Value::UInt(self.compression as u32),
        );

        // The next member starts right after the descriptor.
        resolver.set(&self.volume, AFF4_DIRECTORY_OFFSET, Value::from(fd.tell()));

        resolver.cache_return(Object::File(fd));

        Ok(())
    }
}

/// Reads a whole member: seek to its data, inflate if compressed and
/// verify the CRC-32 over the uncompressed bytes.
pub fn read_member_bytes(resolver: &Arc<Resolver>, member: &Urn) -> Result<Vec<u8>, Aff4Error> {
    let size = resolver.resolve_integer(member, AFF4_SIZE)? as u64;
    let compression = resolver.resolve_uint(member, AFF4_ZIP_COMPRESSION)? as u16;
    let file_offset = resolver.resolve_integer(member, AFF4_FILE_OFFSET)? as u64;
    let volume = resolver.resolve_urn(member, AFF4_STORED)?;
    let backing = resolver.resolve_urn(&volume, AFF4_STORED)?;

    let mut fd = resolver.open(&backing, Mode::Read)?;
    let stream = fd
        .as_stream()
        .ok_or(Aff4Error::InvalidFormat("volume backing"))?;

    let result = (|| -> Result<Vec<u8>, Aff4Error> {
        match compression {
            COMPRESSION_STORED => read_exact_at(stream, resolver, file_offset, size as usize),
            COMPRESSION_DEFLATE => {
                let compress_size = resolver.resolve_integer(member, AFF4_COMPRESSED_SIZE)? as u64;
                let compressed =
                    read_exact_at(stream, resolver, file_offset, compress_size as usize)?;

                let mut data = Vec::with_capacity(size as usize);
                DeflateDecoder::new(compressed.as_slice()).read_to_end(&mut data)?;

                if data.len() as u64 != size {
                    return Err(Aff4Error::Corrupt(member.clone()));
                }

                Ok(data)
            }
            other => Err(Aff4Error::Unsupported(format!("compression method {other}"))),
        }
    })();

    resolver.cache_return(fd);
    let data = result?;

    if let Ok(expected) = resolver.resolve_uint(member, AFF4_CRC) {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data);

        if hasher.finalize() != expected {
            return Err(Aff4Error::Corrupt(member.clone()));
        }
    }

    Ok(data)
}

/// Reads `len` bytes at `offset` within a member's uncompressed
/// content. Uncompressed members are read in place without touching the
/// rest of the member; compressed members are inflated whole first.
pub fn read_member_slice(
    resolver: &Arc<Resolver>,
    member: &Urn,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>, Aff4Error> {
    let compression = resolver.resolve_uint(member, AFF4_ZIP_COMPRESSION)? as u16;

    if compression == COMPRESSION_STORED {
        let file_offset = resolver.resolve_integer(member, AFF4_FILE_OFFSET)? as u64;
        let volume = resolver.resolve_urn(member, AFF4_STORED)?;
        let backing = resolver.resolve_urn(&volume, AFF4_STORED)?;

        let mut fd = resolver.open(&backing, Mode::Read)?;
        let stream = fd
            .as_stream()
            .ok_or(Aff4Error::InvalidFormat("volume backing"))?;

        let result = read_exact_at(stream, resolver, file_offset + offset, len);
        resolver.cache_return(fd);

        return result;
    }

    let data = read_member_bytes(resolver, member)?;
    data.get(offset as usize..offset as usize + len)
        .map(|slice| slice.to_vec())
        .ok_or_else(|| Aff4Error::Corrupt(member.clone()))
}

/// A `SegmentStream` provides seekable read access to one member.
/// Uncompressed members read straight from the backing file;
/// compressed members are inflated whole on first read, which is also
/// when their CRC is verified.
pub struct SegmentStream {
    urn: Urn,
    size: u64,
    compression: u16,
    readptr: u64,
    data: Option<Vec<u8>>,
}

impl SegmentStream {
    /// Materialises read access to the member named by `urn` from its
    /// statements in the resolver.
    pub fn open(resolver: &Arc<Resolver>, urn: &Urn) -> Result<Self, Aff4Error> {
        let size = resolver.resolve_integer(urn, AFF4_SIZE)? as u64;
        let compression = resolver.resolve_uint(urn, AFF4_ZIP_COMPRESSION)? as u16;

        Ok(Self {
            urn: urn.clone(),
            size,
            compression,
            readptr: 0,
            data: None,
        })
    }
}

impl Stream for SegmentStream {
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

    fn read(&mut self, resolver: &Arc<Resolver>, buf: &mut [u8]) -> Result<usize, Aff4Error> {
        if self.readptr >= self.size {
            return Ok(0);
        }

        let want = (buf.len() as u64).min(self.size - self.readptr) as usize;

        if self.compression == COMPRESSION_STORED {
            let data = read_member_slice(resolver, &self.urn, self.readptr, want)?;
            buf[..want].copy_from_slice(&data);
        } else {
            if self.data.is_none() {
                self.data = Some(read_member_bytes(resolver, &self.urn)?);
            }

            let data = self.data.as_ref().expect("just populated");
            let start = self.readptr as usize;
            buf[..want].copy_from_slice(&data[start..start + want]);
        }

        self.readptr += want as u64;
        Ok(want)
    }

    fn write(&mut self, _resolver: &Arc<Resolver>, _buf: &[u8]) -> Result<usize, Aff4Error> {
        Err(Aff4Error::Unsupported(
            "segments are written through their volume".to_string(),
        ))
    }

    fn close(&mut self, _resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        self.data = None;
        Ok(())
    }
}
