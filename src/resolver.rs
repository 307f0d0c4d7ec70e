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
use crate::config::ImagerConfig;
use crate::dir::DirVolume;
use crate::image::ImageStream;
use crate::map::MapStream;
use crate::rdf::{
    Value, AFF4_MAP_TEXT, AFF4_STORED, AFF4_TARGET, AFF4_TYPE, RDF_URN, TYPE_BROKEN,
    TYPE_DIRECTORY_VOLUME, TYPE_IMAGE, TYPE_LINK, TYPE_MAP, TYPE_SEGMENT, TYPE_ZIP_VOLUME,
    XSD_HEX_BINARY, XSD_INTEGER, XSD_STRING, XSD_UNSIGNED_INT,
};
use crate::stream::{FileStream, Mode, Stream};
use crate::urn::Urn;
use crate::zip::{escape_member_name, SegmentStream, ZipVolume};
use crate::Aff4Error;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use fs2::FileExt;

/// An `Object` is any stream or volume materialised through the
/// resolver. Owning an `Object` *is* the borrow: while it is checked
/// out of the cache nothing can expire it, and returning it via
/// [`Resolver::cache_return`] reinserts it at the hot end.
pub enum Object {
    /// A backing file (`file` scheme).
    File(FileStream),
    /// A single Zip member opened for reading.
    Segment(SegmentStream),
    /// A Zip64 container.
    Zip(ZipVolume),
    /// A directory container.
    Dir(DirVolume),
    /// A chunked image stream opened for reading.
    Image(ImageStream),
    /// An offset-remapping stream opened for reading.
    Map(MapStream),
}

impl Object {
    /// Returns the URN naming the `Object`.
    pub fn urn(&self) -> &Urn {
        match self {
            Object::File(o) => Stream::urn(o),
            Object::Segment(o) => Stream::urn(o),
            Object::Zip(o) => o.urn(),
            Object::Dir(o) => o.urn(),
            Object::Image(o) => Stream::urn(o),
            Object::Map(o) => Stream::urn(o),
        }
    }

    /// Returns the [`Mode`] the `Object` was materialised with.
    pub fn mode(&self) -> Mode {
        match self {
            Object::File(o) => o.mode(),
            Object::Segment(_) => Mode::Read,
            Object::Zip(o) => o.mode(),
            Object::Dir(o) => o.mode(),
            Object::Image(o) => o.mode(),
            Object::Map(o) => o.mode(),
        }
    }

    /// Returns the `Object` as a byte stream, unless it is a volume.
    pub fn as_stream(&mut self) -> Option<&mut dyn Stream> {
        match self {
            Object::File(o) => Some(o),
            Object::Segment(o) => Some(o),
            Object::Image(o) => Some(o),
            Object::Map(o) => Some(o),
            Object::Zip(_) | Object::Dir(_) => None,
        }
    }

    /// Returns the `Object` as a container, unless it is a plain stream.
    pub fn as_volume(&mut self) -> Option<&mut dyn Volume> {
        match self {
            Object::Zip(o) => Some(o),
            Object::Dir(o) => Some(o),
            _ => None,
        }
    }

    /// Unwraps a backing [`FileStream`].
    pub fn into_file(self) -> Result<FileStream, Aff4Error> {
        match self {
            Object::File(file) => Ok(file),
            other => Err(Aff4Error::Unsupported(format!(
                "<{}> is not a backing file",
                other.urn()
            ))),
        }
    }
}

/// A `Volume` is a container of segments. Both the Zip64 and the
/// directory implementation expose this contract; streams address their
/// hosting volume through it without knowing which kind it is.
pub trait Volume {
    /// Returns the URN naming the `Volume`.
    fn urn(&self) -> &Urn;

    /// Writes a whole member in one call.
    fn write_member(
        &mut self,
        resolver: &Arc<Resolver>,
        name: &str,
        data: &[u8],
        compression: u16,
    ) -> Result<Urn, Aff4Error>;

    /// Reads a whole member, verifying its integrity where the
    /// container records it.
    fn read_member(&mut self, resolver: &Arc<Resolver>, member: &Urn)
        -> Result<Vec<u8>, Aff4Error>;

    /// Seals the `Volume`, persisting its manifest and index structures.
    /// Closing an already-closed volume is a no-op.
    fn close(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error>;
}

type StatementKey = (String, String);

/// The statement store behind the resolver, split into three
/// content-addressed maps: subject to predicate set, (subject,
/// predicate) to value-id sequence, and the append-only value table.
#[derive(Default)]
struct Store {
    subjects: BTreeMap<String, BTreeSet<String>>,
    statements: HashMap<StatementKey, Vec<u32>>,
    values: Vec<(&'static str, Vec<u8>)>,
    interned: HashMap<(&'static str, Vec<u8>), u32>,
}

impl Store {
    fn intern(&mut self, value: &Value) -> u32 {
        let key = (value.datatype(), value.encode());

        match self.interned.get(&key) {
            Some(&id) => id,
            None => {
                let id = self.values.len() as u32;
                self.values.push((key.0, key.1.clone()));
                self.interned.insert(key, id);
                id
            }
        }
    }

    fn decode(&self, id: u32) -> Result<Value, Aff4Error> {
        let (datatype, bytes) = &self.values[id as usize];
        Ok(Value::decode(datatype, bytes)?)
    }

    fn remove_pair(&mut self, subject: &str, attribute: &str) {
        self.statements
            .remove(&(subject.to_string(), attribute.to_string()));

        if let Some(set) = self.subjects.get_mut(subject) {
            set.remove(attribute);
            if set.is_empty() {
                self.subjects.remove(subject);
            }
        }
    }
}

/// A `Resolver` is the in-process oracle every operation is mediated
/// through: a typed attribute store keyed by (URN, attribute), an LRU
/// cache of materialised objects, and a table of named URN locks.
///
/// The store mutex serialises writes; reads take snapshots, so callers
/// that need a consistent multi-attribute view hold the relevant URN
/// lock instead.
pub struct Resolver {
    store: Mutex<Store>,
    cache: Mutex<LruCache<Object>>,
    locks: Mutex<HashMap<(String, char), Option<std::fs::File>>>,
    locks_changed: Condvar,
}

impl Resolver {
    /// Returns a new `Resolver` with the default object cache capacity.
    pub fn new() -> Self {
        Self::with_capacity(ImagerConfig::default().cache_capacity)
    }

    /// Returns a new `Resolver` whose object cache holds at most
    /// `cache_capacity` returned objects.
    pub fn with_capacity(cache_capacity: usize) -> Self {
        Self {
            store: Mutex::new(Store::default()),
            cache: Mutex::new(LruCache::new(cache_capacity)),
            locks: Mutex::new(HashMap::new()),
            locks_changed: Condvar::new(),
        }
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().expect("resolver store mutex poisoned")
    }

    /// Replaces all values of (subject, attribute) with a single value.
    pub fn set(&self, subject: &Urn, attribute: &str, value: Value) {
        let subject = subject.to_string();
        let mut store = self.store();

        let id = store.intern(&value);
        store
            .subjects
            .entry(subject.clone())
            .or_default()
            .insert(attribute.to_string());
        store
            .statements
            .insert((subject, attribute.to_string()), vec![id]);
    }

    /// Appends a value to (subject, attribute). With `unique` set the
    /// append silently does nothing when an equal value already exists.
    pub fn add(&self, subject: &Urn, attribute: &str, value: Value, unique: bool) {
        let subject = subject.to_string();
        let mut store = self.store();

        let id = store.intern(&value);
        store
            .subjects
            .entry(subject.clone())
            .or_default()
            .insert(attribute.to_string());

        let ids = store
            .statements
            .entry((subject, attribute.to_string()))
            .or_default();
        if unique && ids.contains(&id) {
            return;
        }
        ids.push(id);
    }

    /// Removes all values of (subject, attribute), or every statement
    /// about the subject when no attribute is given.
    pub fn del(&self, subject: &Urn, attribute: Option<&str>) {
        let subject = subject.to_string();
        let mut store = self.store();

        match attribute {
            Some(attribute) => store.remove_pair(&subject, attribute),
            None => {
                if let Some(set) = store.subjects.remove(&subject) {
                    for attribute in set {
                        store.statements.remove(&(subject.clone(), attribute));
                    }
                }
            }
        }
    }

    /// Returns the first value of (subject, attribute).
    pub fn resolve_value(&self, subject: &Urn, attribute: &str) -> Result<Value, Aff4Error> {
        let store = self.store();

        let ids = store
            .statements
            .get(&(subject.to_string(), attribute.to_string()))
            .filter(|ids| !ids.is_empty())
            .ok_or_else(|| Aff4Error::NotFound {
                subject: subject.clone(),
                attribute: attribute.to_string(),
            })?;

        store.decode(ids[0])
    }

    /// Returns all values of (subject, attribute) in insertion order.
    pub fn resolve_list(&self, subject: &Urn, attribute: &str) -> Vec<Value> {
        let store = self.store();

        store
            .statements
            .get(&(subject.to_string(), attribute.to_string()))
            .map(|ids| ids.iter().filter_map(|&id| store.decode(id).ok()).collect())
            .unwrap_or_default()
    }

    /// Reports whether (subject, attribute) carries a value equal to
    /// the one given.
    pub fn is_set(&self, subject: &Urn, attribute: &str, value: &Value) -> bool {
        self.resolve_list(subject, attribute).contains(value)
    }

    /// Returns the first value as a signed integer.
    pub fn resolve_integer(&self, subject: &Urn, attribute: &str) -> Result<i64, Aff4Error> {
        match self.resolve_value(subject, attribute)? {
            Value::Integer(i) => Ok(i),
            other => Err(mismatch(XSD_INTEGER, &other)),
        }
    }

    /// Returns the first value as an unsigned 32-bit integer.
    pub fn resolve_uint(&self, subject: &Urn, attribute: &str) -> Result<u32, Aff4Error> {
        match self.resolve_value(subject, attribute)? {
            Value::UInt(u) => Ok(u),
            other => Err(mismatch(XSD_UNSIGNED_INT, &other)),
        }
    }

    /// Returns the first value as a string.
    pub fn resolve_string(&self, subject: &Urn, attribute: &str) -> Result<String, Aff4Error> {
        match self.resolve_value(subject, attribute)? {
            Value::String(s) => Ok(s),
            other => Err(mismatch(XSD_STRING, &other)),
        }
    }

    /// Returns the first value as raw bytes.
    pub fn resolve_bytes(&self, subject: &Urn, attribute: &str) -> Result<Vec<u8>, Aff4Error> {
        match self.resolve_value(subject, attribute)? {
            Value::Bytes(b) => Ok(b),
            other => Err(mismatch(XSD_HEX_BINARY, &other)),
        }
    }

    /// Returns the first value as a URN.
    pub fn resolve_urn(&self, subject: &Urn, attribute: &str) -> Result<Urn, Aff4Error> {
        match self.resolve_value(subject, attribute)? {
            Value::Urn(urn) => Ok(urn),
            other => Err(mismatch(RDF_URN, &other)),
        }
    }

    /// Returns every subject the store has statements about.
    pub fn subjects(&self) -> Vec<Urn> {
        self.store()
            .subjects
            .keys()
            .filter_map(|s| Urn::try_from(s.as_str()).ok())
            .collect()
    }

    /// Returns the attributes asserted about a subject.
    pub fn attributes(&self, subject: &Urn) -> Vec<String> {
        self.store()
            .subjects
            .get(&subject.to_string())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Discards every statement mentioning the URN, whether as subject
    /// or as a URN-typed object. Invoked when a backing file no longer
    /// matches what the store remembers about it.
    pub fn expunge(&self, urn: &Urn) {
        self.del(urn, None);

        let encoded = urn.encode();
        let mut store = self.store();
        let store = &mut *store;

        let mut emptied: Vec<StatementKey> = Vec::new();
        let values = &store.values;
        for (key, ids) in store.statements.iter_mut() {
            ids.retain(|&id| {
                let (datatype, bytes) = &values[id as usize];
                !((*datatype == RDF_URN || *datatype == AFF4_MAP_TEXT) && *bytes == encoded)
            });

            if ids.is_empty() {
                emptied.push(key.clone());
            }
        }

        for (subject, attribute) in emptied {
            store.remove_pair(&subject, &attribute);
        }
    }

    /// Declares `link` to be an alias that opens `target`.
    pub fn add_link(&self, link: &Urn, target: &Urn) {
        self.set(link, AFF4_TYPE, Value::from(TYPE_LINK.to_string()));
        self.set(link, AFF4_TARGET, Value::Urn(target.clone()));
    }

    /// Acquires the named lock on a URN, blocking while another holder
    /// has it. For `file` scheme URNs the `w` lock is additionally
    /// backed by an advisory lock on the file itself, excluding writers
    /// in other processes.
    pub fn lock(&self, urn: &Urn, name: char) -> Result<(), Aff4Error> {
        let key = (urn.to_string(), name);

        let mut table = self.locks.lock().expect("lock table mutex poisoned");
        while table.contains_key(&key) {
            table = self
                .locks_changed
                .wait(table)
                .expect("lock table mutex poisoned");
        }
        table.insert(key.clone(), None);
        drop(table);

        if let Err(e) = self.flock(urn, name, true) {
            self.unlock(urn, name);
            return Err(e);
        }

        Ok(())
    }

    /// Acquires the named lock without blocking; fails with
    /// [`Aff4Error::Locked`] when another party holds it.
    pub fn try_lock(&self, urn: &Urn, name: char) -> Result<(), Aff4Error> {
        let key = (urn.to_string(), name);

        let mut table = self.locks.lock().expect("lock table mutex poisoned");
        if table.contains_key(&key) {
            return Err(Aff4Error::Locked {
                urn: urn.clone(),
                name,
            });
        }
        table.insert(key.clone(), None);
        drop(table);

        if let Err(e) = self.flock(urn, name, false) {
            self.unlock(urn, name);
            return Err(e);
        }

        Ok(())
    }

    /// Releases the named lock. Releasing a lock that is not held
    /// is a no-op.
    pub fn unlock(&self, urn: &Urn, name: char) {
        let key = (urn.to_string(), name);

        let mut table = self.locks.lock().expect("lock table mutex poisoned");
        if let Some(Some(file)) = table.remove(&key) {
            let _ = FileExt::unlock(&file);
        }
        drop(table);

        self.locks_changed.notify_all();
    }

    fn flock(&self, urn: &Urn, name: char, blocking: bool) -> Result<(), Aff4Error> {
        if name != 'w' {
            return Ok(());
        }
        let Some(path) = urn.to_file_path() else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if blocking {
            file.lock_exclusive()?;
        } else if file.try_lock_exclusive().is_err() {
            return Err(Aff4Error::Locked {
                urn: urn.clone(),
                name,
            });
        }

        let key = (urn.to_string(), name);
        let mut table = self.locks.lock().expect("lock table mutex poisoned");
        table.insert(key, Some(file));

        Ok(())
    }

    /// Materialises the object named by a URN, drawing on the cache
    /// when a compatible instance was returned earlier.
    ///
    /// Dispatch is by scheme for backing files and by the `aff4:type`
    /// statement for everything else. Streams demoted after a failed
    /// write refuse to open.
    pub fn open(self: &Arc<Self>, urn: &Urn, mode: Mode) -> Result<Object, Aff4Error> {
        let key = urn.to_string().into_bytes();

        if let Some(object) = self
            .cache
            .lock()
            .expect("object cache mutex poisoned")
            .take(&key)
        {
            if object.mode() == mode {
                return Ok(object);
            }
            // Wrong mode: drop the instance and materialise afresh.
        }

        if urn.scheme() == "file" {
            return Ok(Object::File(FileStream::open(self, urn, mode)?));
        }

        let stream_type = self.resolve_string(urn, AFF4_TYPE)?;
        match stream_type.as_str() {
            TYPE_ZIP_VOLUME => Ok(Object::Zip(ZipVolume::load(self, urn, mode)?)),
            TYPE_DIRECTORY_VOLUME => Ok(Object::Dir(DirVolume::load(self, urn, mode)?)),
            TYPE_SEGMENT => match mode {
                Mode::Read => {
                    // Directory-hosted segments are plain files.
                    let volume = self.resolve_urn(urn, AFF4_STORED)?;
                    if self.resolve_string(&volume, AFF4_TYPE)? == TYPE_DIRECTORY_VOLUME {
                        let root = self
                            .resolve_urn(&volume, AFF4_STORED)?
                            .to_file_path()
                            .ok_or(Aff4Error::InvalidFormat("volume directory"))?;
                        let path =
                            root.join(escape_member_name(&urn.relative_name(&volume)));

                        return Ok(Object::File(FileStream::open(
                            self,
                            &Urn::from_file_path(path),
                            Mode::Read,
                        )?));
                    }

                    Ok(Object::Segment(SegmentStream::open(self, urn)?))
                }
                Mode::Write => Err(Aff4Error::Unsupported(
                    "segments are written through their volume".to_string(),
                )),
            },
            TYPE_IMAGE => match mode {
                Mode::Read => Ok(Object::Image(ImageStream::load(self, urn)?)),
                Mode::Write => Err(Aff4Error::Unsupported(
                    "image streams are created, not reopened for writing".to_string(),
                )),
            },
            TYPE_MAP => match mode {
                Mode::Read => Ok(Object::Map(MapStream::load(self, urn)?)),
                Mode::Write => Err(Aff4Error::Unsupported(
                    "map streams are created, not reopened for writing".to_string(),
                )),
            },
            TYPE_LINK => {
                let target = self.resolve_urn(urn, AFF4_TARGET)?;
                if matches!(self.resolve_string(&target, AFF4_TYPE), Ok(t) if t == TYPE_LINK) {
                    return Err(Aff4Error::InvalidFormat("link chain"));
                }

                self.open(&target, mode)
            }
            TYPE_BROKEN => Err(Aff4Error::Corrupt(urn.clone())),
            other => Err(Aff4Error::Unsupported(format!("stream type \"{other}\""))),
        }
    }

    /// Returns a borrowed object to the cache, making it available to
    /// the next `open` and eligible for expiry.
    pub fn cache_return(&self, object: Object) {
        let key = object.urn().to_string().into_bytes();

        self.cache
            .lock()
            .expect("object cache mutex poisoned")
            .put(key, object);
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

fn mismatch(expected: &'static str, got: &Value) -> Aff4Error {
    Aff4Error::TypeMismatch {
        expected,
        got: got.datatype().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::Duration;

    fn urn(s: &str) -> Urn {
        Urn::try_from(s).unwrap()
    }

    #[test]
    fn set_replaces_add_appends() {
        let resolver = Resolver::new();
        let subject = urn("urn:x:a");

        resolver.add(&subject, "aff4:p", Value::Integer(1), false);
        resolver.add(&subject, "aff4:p", Value::Integer(2), false);
        assert_eq!(
            resolver.resolve_list(&subject, "aff4:p"),
            vec![Value::Integer(1), Value::Integer(2)]
        );

        resolver.set(&subject, "aff4:p", Value::Integer(9));
        assert_eq!(
            resolver.resolve_list(&subject, "aff4:p"),
            vec![Value::Integer(9)]
        );
    }

    #[test]
    fn del_then_add_yields_single_value() {
        let resolver = Resolver::new();
        let subject = urn("urn:x:a");

        resolver.add(&subject, "aff4:p", Value::Integer(1), false);
        resolver.add(&subject, "aff4:p", Value::Integer(2), false);
        resolver.del(&subject, Some("aff4:p"));
        resolver.add(&subject, "aff4:p", Value::Integer(3), false);

        assert_eq!(
            resolver.resolve_list(&subject, "aff4:p"),
            vec![Value::Integer(3)]
        );
    }

    #[test]
    fn unique_add_is_idempotent() {
        let resolver = Resolver::new();
        let subject = urn("urn:x:a");
        let target = Value::Urn(urn("urn:x:b"));

        resolver.add(&subject, "aff4:p", target.clone(), true);
        resolver.add(&subject, "aff4:p", target.clone(), true);

        assert_eq!(resolver.resolve_list(&subject, "aff4:p"), vec![target]);
    }

    #[test]
    fn del_subject_removes_everything() {
        let resolver = Resolver::new();
        let subject = urn("urn:x:a");

        resolver.set(&subject, "aff4:p", Value::Integer(1));
        resolver.set(&subject, "aff4:q", Value::Integer(2));
        resolver.del(&subject, None);

        assert!(resolver.resolve_value(&subject, "aff4:p").is_err());
        assert!(resolver.attributes(&subject).is_empty());
    }

    #[test]
    fn typed_resolve_refuses_other_datatypes() {
        let resolver = Resolver::new();
        let subject = urn("urn:x:a");

        resolver.set(&subject, "aff4:p", Value::from("text"));

        assert!(matches!(
            resolver.resolve_integer(&subject, "aff4:p"),
            Err(Aff4Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            resolver.resolve_integer(&subject, "aff4:missing"),
            Err(Aff4Error::NotFound { .. })
        ));
    }

    #[test]
    fn expunge_removes_object_references() {
        let resolver = Resolver::new();
        let volume = urn("aff4://vol");
        let member = urn("aff4://vol/seg");

        resolver.set(&member, "aff4:size", Value::Integer(5));
        resolver.add(
            &volume,
            "aff4volatile:contains",
            Value::Urn(member.clone()),
            true,
        );

        resolver.expunge(&member);

        assert!(resolver.resolve_value(&member, "aff4:size").is_err());
        assert!(resolver
            .resolve_list(&volume, "aff4volatile:contains")
            .is_empty());
    }

    #[test]
    fn try_lock_conflicts_until_unlocked() {
        let resolver = Resolver::new();
        let subject = urn("urn:x:a");

        resolver.lock(&subject, 'w').unwrap();
        assert!(matches!(
            resolver.try_lock(&subject, 'w'),
            Err(Aff4Error::Locked { .. })
        ));
        // A different lock name on the same URN is independent.
        resolver.try_lock(&subject, 'r').unwrap();

        resolver.unlock(&subject, 'w');
        resolver.try_lock(&subject, 'w').unwrap();
    }

    #[test]
    fn lock_blocks_other_threads() {
        let resolver = Arc::new(Resolver::new());
        let subject = urn("urn:x:a");

        resolver.lock(&subject, 'w').unwrap();

        let contender = {
            let resolver = Arc::clone(&resolver);
            let subject = subject.clone();
            thread::spawn(move || {
                resolver.lock(&subject, 'w').unwrap();
                resolver.unlock(&subject, 'w');
            })
        };

        // Give the contender time to block, then release.
        thread::sleep(Duration::from_millis(50));
        resolver.unlock(&subject, 'w');

        contender.join().unwrap();
    }

    #[test]
    fn open_dispatches_file_scheme() {
        let resolver = Arc::new(Resolver::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        std::fs::write(&path, b"abc").unwrap();

        let file = Urn::from_file_path(&path);
        let mut object = resolver.open(&file, Mode::Read).unwrap();
        assert_eq!(object.as_stream().unwrap().size(), 3);

        resolver.cache_return(object);

        // The second open draws the same instance from the cache.
        let object = resolver.open(&file, Mode::Read).unwrap();
        assert_eq!(object.urn(), &file);
    }

    #[test]
    fn open_unknown_subject_fails() {
        let resolver = Arc::new(Resolver::new());

        assert!(matches!(
            resolver.open(&urn("aff4://nowhere"), Mode::Read),
            Err(Aff4Error::NotFound { .. })
        ));
    }

    #[test]
    fn link_opens_target() {
        let resolver = Arc::new(Resolver::new());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        std::fs::write(&path, b"abcdef").unwrap();

        let target = Urn::from_file_path(&path);
        let link = urn("aff4://alias");

        resolver.add_link(&link, &target);

        let mut object = resolver.open(&link, Mode::Read).unwrap();
        assert_eq!(object.as_stream().unwrap().size(), 6);
    }
}
