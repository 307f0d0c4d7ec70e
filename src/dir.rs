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

use crate::rdf::{
    parse_properties, serialise_properties, Value, AFF4_CONTAINS, AFF4_DIRTY, AFF4_SIZE,
    AFF4_STORED, AFF4_TIMESTAMP, AFF4_TYPE, TYPE_DIRECTORY_VOLUME, TYPE_SEGMENT,
};
use crate::resolver::{Resolver, Volume};
use crate::stream::{FileStream, Mode};
use crate::urn::Urn;
use crate::zip::{escape_member_name, unescape_member_name};
use crate::Aff4Error;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

/// A `DirVolume` is the loose-file sibling of the Zip container: every
/// segment is a plain file under a root directory, named by its escaped
/// relative URN, and the manifest lives in a `properties` file at the
/// root. Members are stored raw.
pub struct DirVolume {
    urn: Urn,
    root: PathBuf,
    mode: Mode,
}

impl DirVolume {
    /// Returns the URN naming the `DirVolume`.
    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    /// Returns the [`Mode`] the `DirVolume` was opened with.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Creates an empty volume rooted at `root`, creating the
    /// directory as needed.
    pub fn create(
        resolver: &Resolver,
        urn: Option<Urn>,
        root: &Path,
    ) -> Result<Self, Aff4Error> {
        fs::create_dir_all(root)?;

        let urn = urn.unwrap_or_else(Urn::random);
        resolver.set(&urn, AFF4_STORED, Value::Urn(Urn::from_file_path(root)));
        resolver.set(&urn, AFF4_TYPE, Value::from(TYPE_DIRECTORY_VOLUME));
        resolver.set(&urn, AFF4_DIRTY, Value::Integer(1));

        Ok(Self {
            urn,
            root: root.to_path_buf(),
            mode: Mode::Write,
        })
    }

    /// Opens the volume rooted at `root`, publishing a segment per
    /// file and feeding any manifest file to the RDF parser.
    pub fn open_root(
        resolver: &Arc<Resolver>,
        urn_hint: Option<&Urn>,
        root: &Path,
        mode: Mode,
    ) -> Result<Self, Aff4Error> {
        if !root.is_dir() {
            if mode == Mode::Write {
                return Self::create(resolver, urn_hint.cloned(), root);
            }

            return Err(Aff4Error::InvalidFormat("volume directory"));
        }

        let urn = urn_hint.cloned().unwrap_or_else(Urn::random);
        resolver.set(&urn, AFF4_STORED, Value::Urn(Urn::from_file_path(root)));
        resolver.set(&urn, AFF4_TYPE, Value::from(TYPE_DIRECTORY_VOLUME));

        let volume = Self {
            urn,
            root: root.to_path_buf(),
            mode,
        };
        volume.scan(resolver)?;

        Ok(volume)
    }

    /// Materialises a volume whose URN is already known to the
    /// resolver. Used by the type dispatcher.
    pub fn load(resolver: &Arc<Resolver>, urn: &Urn, mode: Mode) -> Result<Self, Aff4Error> {
        let stored = resolver.resolve_urn(urn, AFF4_STORED)?;
        let root = stored
            .to_file_path()
            .ok_or(Aff4Error::InvalidFormat("volume directory"))?;

        Ok(Self {
            urn: urn.clone(),
            root,
            mode,
        })
    }

    fn scan(&self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        let mut pending = vec![self.root.clone()];
        let mut manifests: Vec<(Urn, PathBuf)> = Vec::new();

        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();

                if entry.file_type()?.is_dir() {
                    pending.push(path);
                    continue;
                }

                let relative = path
                    .strip_prefix(&self.root)
                    .map_err(|_| Aff4Error::InvalidFormat("volume directory"))?
                    .to_string_lossy()
                    .into_owned();
                let name = unescape_member_name(&relative)?;
                let member = self.urn.join(&name);

                resolver.set(&member, AFF4_STORED, Value::Urn(self.urn.clone()));
                resolver.set(&member, AFF4_TYPE, Value::from(TYPE_SEGMENT));
                resolver.set(
                    &member,
                    AFF4_SIZE,
                    Value::from(entry.metadata()?.len()),
                );
                resolver.add(&self.urn, AFF4_CONTAINS, Value::Urn(member.clone()), true);

                if name.ends_with("properties") {
                    manifests.push((member, path));
                }
            }
        }

        for (member, path) in manifests {
            let text = fs::read_to_string(&path)?;
            let base = member.join("..");
            parse_properties(resolver, &self.urn, &base, &text);
        }

        Ok(())
    }

    /// Returns the fully-qualified URN of a member name.
    pub fn member_urn(&self, name: &str) -> Urn {
        self.urn.join(name)
    }

    fn member_path(&self, member: &Urn) -> PathBuf {
        self.root
            .join(escape_member_name(&member.relative_name(&self.urn)))
    }

    /// Opens a member for writing as a plain seekable file.
    pub fn open_member_w(
        &self,
        resolver: &Arc<Resolver>,
        name: &str,
    ) -> Result<FileStream, Aff4Error> {
        if self.mode != Mode::Write {
            return Err(Aff4Error::Unsupported(
                "volume is opened read-only".to_string(),
            ));
        }

        let member = self.member_urn(name);
        let path = self.member_path(&member);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        resolver.set(&self.urn, AFF4_DIRTY, Value::Integer(1));
        resolver.set(&member, AFF4_STORED, Value::Urn(self.urn.clone()));
        resolver.set(&member, AFF4_TYPE, Value::from(TYPE_SEGMENT));
        resolver.set(&member, AFF4_TIMESTAMP, Value::from(Utc::now()));
        resolver.add(&self.urn, AFF4_CONTAINS, Value::Urn(member.clone()), true);

        FileStream::open(resolver, &Urn::from_file_path(path), Mode::Write)
    }

    /// Opens a member for reading as a plain seekable file.
    pub fn open_member_r(
        &self,
        resolver: &Arc<Resolver>,
        name: &str,
    ) -> Result<FileStream, Aff4Error> {
        let member = self.member_urn(name);
        FileStream::open(resolver, &Urn::from_file_path(self.member_path(&member)), Mode::Read)
    }
}

impl Volume for DirVolume {
    fn urn(&self) -> &Urn {
        &self.urn
    }

    fn write_member(
        &mut self,
        resolver: &Arc<Resolver>,
        name: &str,
        data: &[u8],
        _compression: u16,
    ) -> Result<Urn, Aff4Error> {
        let member = self.member_urn(name);
        let path = self.member_path(&member);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, data)?;

        resolver.set(&self.urn, AFF4_DIRTY, Value::Integer(1));
        resolver.set(&member, AFF4_STORED, Value::Urn(self.urn.clone()));
        resolver.set(&member, AFF4_TYPE, Value::from(TYPE_SEGMENT));
        resolver.set(&member, AFF4_SIZE, Value::from(data.len() as u64));
        resolver.set(&member, AFF4_TIMESTAMP, Value::from(Utc::now()));
        resolver.add(&self.urn, AFF4_CONTAINS, Value::Urn(member.clone()), true);

        Ok(member)
    }

    fn read_member(
        &mut self,
        _resolver: &Arc<Resolver>,
        member: &Urn,
    ) -> Result<Vec<u8>, Aff4Error> {
        Ok(fs::read(self.member_path(member))?)
    }

    fn close(&mut self, resolver: &Arc<Resolver>) -> Result<(), Aff4Error> {
        if resolver.resolve_value(&self.urn, AFF4_DIRTY).is_err() {
            return Ok(());
        }

        let manifest = serialise_properties(resolver, &self.urn);
        if !manifest.is_empty() {
            fs::write(self.root.join("properties"), manifest)?;
        }

        resolver.del(&self.urn, Some(AFF4_DIRTY));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::stream::Stream;

    #[test]
    fn members_round_trip_through_files() {
        let resolver = Arc::new(Resolver::new());
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("container");

        let urn = Urn::try_from("aff4://dir-volume").unwrap();
        let mut volume = DirVolume::create(&resolver, Some(urn.clone()), &root).unwrap();

        volume
            .write_member(&resolver, "logs/evidence.txt", b"exhibit A", 0)
            .unwrap();
        Volume::close(&mut volume, &resolver).unwrap();

        // Reopen from disk with a pristine resolver.
        let resolver = Arc::new(Resolver::new());
        let mut volume =
            DirVolume::open_root(&resolver, Some(&urn), &root, Mode::Read).unwrap();

        let member = volume.member_urn("logs/evidence.txt");
        assert_eq!(volume.read_member(&resolver, &member).unwrap(), b"exhibit A");
        assert_eq!(resolver.resolve_integer(&member, AFF4_SIZE).unwrap(), 9);
    }

    #[test]
    fn manifest_survives_reopen() {
        let resolver = Arc::new(Resolver::new());
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("container");

        let urn = Urn::try_from("aff4://dir-volume").unwrap();
        let mut volume = DirVolume::create(&resolver, Some(urn.clone()), &root).unwrap();
        volume.write_member(&resolver, "seg", b"x", 0).unwrap();

        let note = Urn::try_from("urn:x:note").unwrap();
        resolver.set(&note, "aff4:comment", Value::from("remember me"));
        Volume::close(&mut volume, &resolver).unwrap();

        let resolver = Arc::new(Resolver::new());
        DirVolume::open_root(&resolver, Some(&urn), &root, Mode::Read).unwrap();

        assert_eq!(
            resolver.resolve_string(&note, "aff4:comment").unwrap(),
            "remember me"
        );
    }

    #[test]
    fn streaming_member_write() {
        let resolver = Arc::new(Resolver::new());
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("container");

        let volume = DirVolume::create(&resolver, None, &root).unwrap();
        let mut member = volume.open_member_w(&resolver, "big").unwrap();

        member.write_all(&resolver, b"part one, ").unwrap();
        member.write_all(&resolver, b"part two").unwrap();
        member.close(&resolver).unwrap();

        let mut reader = volume.open_member_r(&resolver, "big").unwrap();
        let mut buf = vec![0; reader.size() as usize];
        reader.read_exact(&resolver, &mut buf).unwrap();

        assert_eq!(buf, b"part one, part two");
    }
}
