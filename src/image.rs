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

use crate::cache::LruCache;
use crate::config::{ImagerConfig, COMPRESSION_DEFLATE, COMPRESSION_STORED};
use crate::rdf::{
    Value, AFF4_CHUNKS_IN_SEGMENT, AFF4_CHUNK_SIZE, AFF4_COMPRESSION, AFF4_SHA256, AFF4_SIZE,
    AFF4_STORED, AFF4_TIMESTAMP, AFF4_TYPE, TYPE_BROKEN, TYPE_IMAGE,
};
use crate::resolver::{Resolver, Volume as _};
use crate::stream::{resolve_seek, Mode, Stream};
use crate::urn::Urn;
use crate::zip::{read_member_bytes, read_member_slice};
use crate::Aff4Error;

use std::io::{Read, SeekFrom};
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, Sender};
use flate2::read::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;
use sha2::{Digest, Sha256};

/// How many bevy index arrays the read side keeps inflated.
const INDEX_CACHE_SIZE: usize = 32;
/// How many decompressed chunks the read side keeps.
const CHUNK_CACHE_SIZE: usize = 100;

/// A `Turnstile` admits workers to the hosting volume strictly in
/// bevy-id order, which is what makes bevies appear in the central
/// directory in the order they filled.
struct Turnstile {
    next: Mutex<u64>,
    advanced: Condvar,
}

impl Turnstile {
    fn new() -> Self {
        Self {
            next: Mutex::new(0),
            advanced: Condvar::new(),
        }
    }

    fn wait_for(&self, id: u64) {
        let mut next = self.next.lock().expect("turnstile mutex poisoned");
        while *next != id {
            next = self
                .advanced
                .wait(next)
                .expect("turnstile mutex poisoned");
        }
    }

    fn advance(&self) {
        *self.next.lock().expect("turnstile mutex poisoned") += 1;
        self.advanced.notify_all();
    }
}

/// One detached bevy on its way into the volume.
struct Bevy {
    stream: Urn,
    volume: Urn,
    id: u64,
    chunk_size: usize,
    data: Vec<u8>,
}

/// The fixed pool of compression workers behind one image stream.
///
/// Worker slots circulate as tokens on a bounded channel: taking a
/// token admits one bevy, and the worker thread returns it when the
/// bevy is on disk. Writers therefore block, rather than drop data,
/// while every worker is busy.
struct WorkerPool {
    tokens: Receiver<()>,
    returns: Sender<()>,
    turnstile: Arc<Turnstile>,
    error: Arc<Mutex<Option<Aff4Error>>>,
    workers: usize,
}

impl WorkerPool {
    fn new(workers: usize) -> Self {
        let (returns, tokens) = bounded(workers);
        for _ in 0..workers {
            returns.send(()).expect("fresh channel cannot be closed");
        }

        Self {
            tokens,
            returns,
            turnstile: Arc::new(Turnstile::new()),
            error: Arc::new(Mutex::new(None)),
            workers,
        }
    }

    /// Hands a bevy to the next free worker, blocking while all of
    /// them are busy.
    fn submit(&self, resolver: &Arc<Resolver>, bevy: Bevy) {
        self.tokens.recv().expect("worker pool channel closed");

        let resolver = Arc::clone(resolver);
        let turnstile = Arc::clone(&self.turnstile);
        let error = Arc::clone(&self.error);
        let returns = self.returns.clone();

        thread::spawn(move || {
            if let Err(e) = emit_bevy(&resolver, &turnstile, bevy) {
                error.lock().expect("pool error mutex poisoned").get_or_insert(e);
            }

            let _ = returns.send(());
        });
    }

    /// Waits until every busy worker has finished.
    fn drain(&self) {
        for _ in 0..self.workers {
            self.tokens.recv().expect("worker pool channel closed");
        }
        for _ in 0..self.workers {
            self.returns.send(()).expect("worker pool channel closed");
        }
    }

    /// Surfaces the first error any worker hit.
    fn take_error(&self) -> Option<Aff4Error> {
        self.error.lock().expect("pool error mutex poisoned").take()
    }
}

/// Compresses one bevy chunk by chunk and emits the bevy segment and
/// its index segment into the hosting volume, in bevy order, under the
/// volume's `w` lock.
fn emit_bevy(resolver: &Arc<Resolver>, turnstile: &Turnstile, bevy: Bevy) -> Result<(), Aff4Error> {
    let mut compressed = Vec::with_capacity(bevy.data.len() / 2);
    let mut index: Vec<u32> = Vec::with_capacity(bevy.data.len() / bevy.chunk_size + 2);

    let compress_result = (|| -> Result<(), Aff4Error> {
        for chunk in bevy.data.chunks(bevy.chunk_size) {
            index.push(compressed.len() as u32);
            DeflateEncoder::new(chunk, Compression::best()).read_to_end(&mut compressed)?;
        }
        index.push(compressed.len() as u32);

        Ok(())
    })();

    let index_bytes: Vec<u8> = index.iter().flat_map(|v| v.to_le_bytes()).collect();

    // Take the turn even if compression failed, otherwise every later
    // bevy waits forever.
    turnstile.wait_for(bevy.id);

    let result = compress_result.and_then(|()| {
        resolver.lock(&bevy.volume, 'w')?;

        let emit = (|| -> Result<(), Aff4Error> {
            let mut object = resolver.open(&bevy.volume, Mode::Write)?;
            let volume = object
                .as_volume()
                .ok_or(Aff4Error::InvalidFormat("hosting volume"))?;

            let bevy_urn = bevy.stream.join(&format!("{:08x}", bevy.id));
            volume.write_member(
                resolver,
                &bevy_urn.to_string(),
                &compressed,
                COMPRESSION_STORED,
            )?;

            let index_urn = bevy.stream.join(&format!("{:08x}.idx", bevy.id));
            volume.write_member(
                resolver,
                &index_urn.to_string(),
                &index_bytes,
                COMPRESSION_STORED,
            )?;

            resolver.cache_return(object);
            tracing::debug!(stream = %bevy.stream, bevy = bevy.id, "bevy emitted");

            Ok(())
        })();

        resolver.unlock(&bevy.volume, 'w');
        emit
    });

    turnstile.advance();
    result
}

/// An `ImageStream` is a logical byte sequence materialised as
/// chunked, per-chunk-deflated bevies inside a hosting volume.
///
/// The write side partitions appended bytes into fixed-size chunks,
/// groups them into bevies and compresses the bevies on a worker pool;
/// the read side reconstructs arbitrary byte ranges through a pair of
/// LRU caches over bevy indexes and decompressed chunks.
pub struct ImageStream {
    urn: Urn,
    stored: Urn,
    chunk_size: u32,
    chunks_in_segment: u32,
    compression: u16,
    size: u64,
    readptr: u64,
    mode: Mode,
    closed: bool,

    buffer: Vec<u8>,
    next_bevy: u64,
    pool: Option<WorkerPool>,
    digest: Option<Sha256>,

    index_cache: LruCache<Vec<u32>>,
    chunk_cache: LruCache<Vec<u8>>,
}

impl ImageStream {
    /// Creates a new image stream hosted by `volume`, publishing its
    /// chunking parameters and spinning up the worker pool.
    pub fn create(
        resolver: &Resolver,
        urn: &Urn,
        volume: &Urn,
        config: &ImagerConfig,
    ) -> Result<Self, Aff4Error> {
        if config.chunk_size == 0 || config.chunks_in_segment == 0 {
            return Err(Aff4Error::Unsupported(
                "zero-sized chunk geometry".to_string(),
            ));
        }

        resolver.set(urn, AFF4_STORED, Value::Urn(volume.clone()));
        resolver.set(urn, AFF4_TYPE, Value::from(TYPE_IMAGE));
        resolver.set(urn, AFF4_CHUNK_SIZE, Value::from(config.chunk_size as u64));
        resolver.set(
            urn,
            AFF4_CHUNKS_IN_SEGMENT,
            Value::from(config.chunks_in_segment as u64),
        );
        resolver.set(urn, AFF4_COMPRESSION, Value::UInt(COMPRESSION_DEFLATE as u32));
        resolver.set(urn, AFF4_TIMESTAMP, Value::from(Utc::now()));

        Ok(Self {
            urn: urn.clone(),
            stored: volume.clone(),
            chunk_size: config.chunk_size,
            chunks_in_segment: config.chunks_in_segment,
            compression: COMPRESSION_DEFLATE,
            size: 0,
            readptr: 0,
            mode: Mode::Write,
            closed: false,
            buffer: Vec::new(),
            next_bevy: 0,
            pool: Some(WorkerPool::new(config.workers.max(1))),
            digest: Some(Sha256::new()),
            index_cache: LruCache::new(INDEX_CACHE_SIZE),
            chunk_cache: LruCache::new(CHUNK_CACHE_SIZE),
        })
    }

    /// Materialises read access to a sealed image stream from its
    /// statements.
    pub fn load(resolver: &Arc<Resolver>, urn: &Urn) -> Result<Self, Aff4Error> {
        let stored = resolver.resolve_urn(urn, AFF4_STORED)?;
        let chunk_size = resolver.resolve_integer(urn, AFF4_CHUNK_SIZE)? as u32;
        let chunks_in_segment = resolver.resolve_integer(urn, AFF4_CHUNKS_IN_SEGMENT)? as u32;
        let size = resolver.resolve_integer(urn, AFF4_SIZE)? as u64;
        let compression = resolver
            .resolve_uint(urn, AFF4_COMPRESSION)
            .unwrap_or(COMPRESSION_DEFLATE as u32) as u16;

        if chunk_size == 0 || chunks_in_segment == 0 {
            return Err(Aff4Error::Corrupt(urn.clone()));
        }

        Ok(Self {
            urn: urn.clone(),
            stored,
            chunk_size,
            chunks_in_segment,
            compression,
            size,
            readptr: 0,
            mode: Mode::Read,
            closed: false,
            buffer: Vec::new(),
            next_bevy: 0,
            pool: None,
            digest: None,
            index_cache: LruCache::new(INDEX_CACHE_SIZE),
            chunk_cache: LruCache::new(CHUNK_CACHE_SIZE),
        })
    }

    /// Returns the [`Mode`] of the image stream.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn bevy_bytes(&self) -> usize {
        self.chunk_size as usize * self.chunks_in_segment as usize
    }

    fn submit_bevy(&mut self, resolver: &Arc<Resolver>, data: Vec<u8>) {
        let bevy = Bevy {
            stream: self.urn.clone(),
            volume: self.stored.clone(),
            id: self.next_bevy,
            chunk_size: self.chunk_size as usize,
            data,
        };
        self.next_bevy += 1;

        self.pool
            .as_ref()
            .expect("write mode implies a worker pool")
            .submit(resolver, bevy);
    }

    /// Demotes the stream so later opens refuse it, and surfaces the
    /// pool error that caused the demotion.
    fn poison(&mut self, resolver: &Resolver, error: Aff4Error) -> Aff4Error {
        resolver.set(&self.urn, AFF4_TYPE, Value::from(TYPE_BROKEN));
        self.closed = true;

        error
    }

    /// Fetches one decompressed chunk through the caches.
    fn fetch_chunk(
        &mut self,
        resolver: &Arc<Resolver>,
        chunk_number: u64,
    ) -> Result<&Vec<u8>, Aff4Error> {
        let key = chunk_number.to_le_bytes().to_vec();

        if self.chunk_cache.get(&key).is_none() {
            let chunk = self.load_chunk(resolver, chunk_number)?;
            self.chunk_cache.put(key.clone(), chunk);
        }

        Ok(self
            .chunk_cache
            .get(&key)
            .expect("chunk inserted just above"))
    }

    fn load_chunk(
        &mut self,
        resolver: &Arc<Resolver>,
        chunk_number: u64,
    ) -> Result<Vec<u8>, Aff4Error> {
        let per_bevy = self.chunks_in_segment as u64;
        let bevy_id = chunk_number / per_bevy;
        let chunk_in_bevy = (chunk_number % per_bevy) as usize;

        let bevy_urn = self.urn.join(&format!("{bevy_id:08x}"));

        let index_key = bevy_id.to_le_bytes().to_vec();
        if self.index_cache.get(&index_key).is_none() {
            let index_urn = self.urn.join(&format!("{bevy_id:08x}.idx"));
            let bytes = read_member_bytes(resolver, &index_urn)?;

            if bytes.len() % 4 != 0 {
                return Err(Aff4Error::Corrupt(index_urn));
            }
            let index: Vec<u32> = bytes
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();

            self.index_cache.put(index_key.clone(), index);
        }

        let index = self
            .index_cache
            .get(&index_key)
            .expect("index inserted just above");

        let start = *index
            .get(chunk_in_bevy)
            .ok_or_else(|| Aff4Error::Corrupt(bevy_urn.clone()))? as u64;
        let end = *index
            .get(chunk_in_bevy + 1)
            .ok_or_else(|| Aff4Error::Corrupt(bevy_urn.clone()))? as u64;

        if end < start {
            return Err(Aff4Error::Corrupt(bevy_urn));
        }

        let compressed = read_member_slice(resolver, &bevy_urn, start, (end - start) as usize)?;

        if self.compression == COMPRESSION_STORED {
            return Ok(compressed);
        }

        let mut chunk = Vec::with_capacity(self.chunk_size as usize);
        DeflateDecoder::new(compressed.as_slice()).read_to_end(&mut chunk)?;

        if chunk.len() > self.chunk_size as usize {
            return Err(Aff4Error::Corrupt(bevy_urn));
        }

        Ok(chunk)
    }
}

impl Stream for ImageStream {
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
        if self.mode == Mode::Write {
            return Err(Aff4Error::Unsupported(
                "image streams are append-only while open for writing".to_string(),
            ));
        }

        self.readptr = resolve_seek(pos, self.readptr, self.size)?;
        Ok(self.readptr)
    }

    fn read(&mut self, resolver: &Arc<Resolver>, buf: &mut [u8]) -> Result<usize, Aff4Error> {
        let chunk_size = self.chunk_size as u64;
        let mut produced = 0;

        while produced < buf.len() && self.readptr < self.size {
            let chunk_number = self.readptr / chunk_size;
            let offset_in_chunk = (self.readptr % chunk_size) as usize;

            let remaining_in_stream = (self.size - self.readptr) as usize;
            let chunk = self.fetch_chunk(resolver, chunk_number)?;

            let available = chunk.len().saturating_sub(offset_in_chunk);
            let n = available
                .min(buf.len() - produced)
                .min(remaining_in_stream);
            if n == 0 {
                break;
            }

            buf[produced..produced + n]
                .copy_from_slice(&chunk[offset_in_chunk..offset_in_chunk + n]);

            produced += n;
            self.readptr += n as u64;
        }

        Ok(produced)
    }

    fn write(&mut self, resolver: &Arc<Resolver>, buf: &[u8]) -> Result<usize, Aff4Error> {
        if self.mode != Mode::Write || self.closed {
            return Err(Aff4Error::Unsupported(
                "image stream is not open for writing".to_string(),
            ));
        }

        if let Some(e) = self.pool.as_ref().and_then(|p| p.take_error()) {
            return Err(self.poison(resolver, e));
        }

        if let Some(digest) = self.digest.as_mut() {
            digest.update(buf);
        }
        self.buffer.extend_from_slice(buf);
        self.size += buf.len() as u64;
        self.readptr = self.size;

        let bevy_bytes = self.bevy_bytes();
        while self.buffer.len() >= bevy_bytes {
            let rest = self.buffer.split_off(bevy_bytes);
            let full = mem::replace(&mut self.buffer, rest);
            self.submit_bevy(resolver, full);
        }

        Ok(buf.len())
    }

    fn close(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        if self.closed {
            return Ok(());
        }

        if self.mode == Mode::Read {
            self.closed = true;
            return Ok(());
        }

        // Flush the (possibly short) final bevy through the same
        // pipeline, then wait for every busy worker.
        if !self.buffer.is_empty() {
            let last = mem::take(&mut self.buffer);
            self.submit_bevy(resolver, last);
        }

        if let Some(pool) = self.pool.as_ref() {
            pool.drain();
            if let Some(e) = pool.take_error() {
                return Err(self.poison(resolver, e));
            }
        }
        self.closed = true;

        resolver.set(&self.urn, AFF4_SIZE, Value::from(self.size));
        resolver.set(&self.urn, AFF4_CHUNK_SIZE, Value::from(self.chunk_size as u64));
        resolver.set(
            &self.urn,
            AFF4_CHUNKS_IN_SEGMENT,
            Value::from(self.chunks_in_segment as u64),
        );
        resolver.set(&self.urn, AFF4_COMPRESSION, Value::UInt(self.compression as u32));
        if let Some(digest) = self.digest.take() {
            resolver.set(
                &self.urn,
                AFF4_SHA256,
                Value::Bytes(digest.finalize().to_vec()),
            );
        }

        tracing::debug!(stream = %self.urn, size = self.size, "image sealed");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turnstile_orders_threads() {
        let turnstile = Arc::new(Turnstile::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        // Start in reverse so the turnstile has to do the ordering.
        for id in (0..8u64).rev() {
            let turnstile = Arc::clone(&turnstile);
            let order = Arc::clone(&order);

            handles.push(thread::spawn(move || {
                turnstile.wait_for(id);
                order.lock().unwrap().push(id);
                turnstile.advance();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn pool_tokens_bound_concurrency() {
        let pool = WorkerPool::new(2);

        // Both tokens available up front, and drain restores them.
        pool.drain();
        pool.drain();
        assert!(pool.take_error().is_none());
    }
}
