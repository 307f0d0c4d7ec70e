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

use crate::UrnParseError;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A `Urn` is the canonical globally-unique identifier naming any
/// addressable object in a container: volumes, segments, streams and
/// backing files.
///
/// A URN consists of a scheme, an optional authority, a path and an
/// optional fragment. The path is normalised on construction: `.` and
/// empty components are dropped and `..` collapses the preceding
/// component. Equality is string equality of the normalised form.
///
/// Two syntactic families are supported, matching what appears inside
/// real containers:
///
/// * authority form: `aff4://5aea2d01/image` or `file:///tmp/v.zip`
/// * opaque form: `urn:x:img`
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn {
    scheme: String,
    // `Some` for the `scheme://authority/path` family,
    // `None` for opaque `scheme:path` names.
    authority: Option<String>,
    path: String,
    fragment: String,
}

impl Urn {
    /// Returns the scheme of the `Urn`, e.g. `aff4` or `file`.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Returns the normalised path component of the `Urn`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns a fresh unique `Urn` in the `aff4` scheme.
    /// Used when a new volume or stream is created without an
    /// explicit identity.
    pub fn random() -> Self {
        Self {
            scheme: "aff4".to_string(),
            authority: Some(Uuid::new_v4().to_string()),
            path: String::new(),
            fragment: String::new(),
        }
    }

    /// Converts a local filesystem path to its `file` scheme `Urn`.
    pub fn from_file_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            scheme: "file".to_string(),
            authority: Some(String::new()),
            path: normalise_path(&path.as_ref().to_string_lossy(), true),
            fragment: String::new(),
        }
    }

    /// Converts a `file` scheme `Urn` back to a filesystem path.
    /// Returns `None` for any other scheme.
    pub fn to_file_path(&self) -> Option<PathBuf> {
        if self.scheme == "file" {
            Some(PathBuf::from(&self.path))
        } else {
            None
        }
    }

    /// Joins a name to the `Urn`.
    ///
    /// If `name` parses as a fully-qualified URN of its own it replaces
    /// the `Urn` entirely. Otherwise it is appended to the path and the
    /// result is re-normalised, so `join("..")` removes the last path
    /// component.
    pub fn join(&self, name: &str) -> Self {
        if let Ok(absolute) = Self::try_from(name) {
            return absolute;
        }

        let absolute = self.path.starts_with('/');
        let joined = if self.path.is_empty() {
            format!("/{}", name)
        } else {
            format!("{}/{}", self.path, name)
        };

        Self {
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
            path: normalise_path(&joined, absolute || self.path.is_empty()),
            fragment: self.fragment.clone(),
        }
    }

    /// Returns the name of the `Urn` relative to `base`:
    /// the path remainder if `base` is a proper prefix,
    /// the full canonical form otherwise.
    pub fn relative_name(&self, base: &Urn) -> String {
        let full = self.to_string();
        let prefix = base.to_string();

        match full.strip_prefix(&format!("{}/", prefix)) {
            Some(rest) => rest.to_string(),
            None => full,
        }
    }

    /// Reports whether `base` is the `Urn` itself or an ancestor of it.
    pub fn is_contained_in(&self, base: &Urn) -> bool {
        let full = self.to_string();
        let prefix = base.to_string();

        full == prefix || full.starts_with(&format!("{}/", prefix))
    }

    /// Returns the compact encoding of the `Urn` for the statement store:
    /// the canonical string followed by a NUL terminator.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.to_string().into_bytes();
        bytes.push(0);
        bytes
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.authority {
            Some(authority) => write!(f, "{}://{}{}", self.scheme, authority, self.path)?,
            None => write!(f, "{}:{}", self.scheme, self.path)?,
        }

        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }

        Ok(())
    }
}

impl TryFrom<&str> for Urn {
    type Error = UrnParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.is_empty() {
            return Err(UrnParseError::Empty);
        }

        let (value, fragment) = match value.split_once('#') {
            Some((head, fragment)) => (head, fragment.to_string()),
            None => (value, String::new()),
        };

        if let Some((scheme, rest)) = value.split_once("://") {
            if scheme.is_empty() {
                return Err(UrnParseError::MissingScheme(value.to_string()));
            }

            let (authority, path) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, ""),
            };

            return Ok(Self {
                scheme: scheme.to_ascii_lowercase(),
                authority: Some(authority.to_string()),
                path: normalise_path(path, true),
                fragment,
            });
        }

        match value.split_once(':') {
            Some((scheme, _)) if scheme.is_empty() => {
                Err(UrnParseError::MissingScheme(value.to_string()))
            }
            // A path component containing a colon (e.g. an escaped
            // filename) is not a scheme.
            Some((scheme, _)) if scheme.contains('/') => {
                Err(UrnParseError::MissingScheme(value.to_string()))
            }
            Some((scheme, rest)) => Ok(Self {
                scheme: scheme.to_ascii_lowercase(),
                authority: None,
                path: normalise_path(rest, false),
                fragment,
            }),
            None => Err(UrnParseError::MissingScheme(value.to_string())),
        }
    }
}

impl TryFrom<String> for Urn {
    type Error = UrnParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.to_string()
    }
}

/// Collapses `.`, `..` and empty components of a path.
/// `absolute` selects whether the result keeps a leading slash.
fn normalise_path(path: &str, absolute: bool) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    if absolute && !joined.is_empty() {
        format!("/{}", joined)
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_authority_form() {
        let urn = Urn::try_from("aff4://5aea2d01/image/0").unwrap();

        assert_eq!(urn.scheme(), "aff4");
        assert_eq!(urn.to_string(), "aff4://5aea2d01/image/0");
    }

    #[test]
    fn parses_opaque_form() {
        let urn = Urn::try_from("urn:x:img").unwrap();

        assert_eq!(urn.scheme(), "urn");
        assert_eq!(urn.to_string(), "urn:x:img");
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(Urn::try_from("no-scheme-here").is_err());
        assert!(Urn::try_from("").is_err());
    }

    #[test]
    fn normalises_dots() {
        let urn = Urn::try_from("aff4://host/a/./b/../c").unwrap();
        assert_eq!(urn.to_string(), "aff4://host/a/c");
    }

    #[test]
    fn join_then_parent_is_identity() {
        for base in ["aff4://host/a/b", "urn:x:img", "file:///tmp/v.zip"] {
            let urn = Urn::try_from(base).unwrap();
            assert_eq!(urn.join("seg").join(".."), urn, "base {base}");
        }
    }

    #[test]
    fn join_absolute_replaces() {
        let urn = Urn::try_from("aff4://host/a").unwrap();
        let other = urn.join("urn:x:img");
        assert_eq!(other.to_string(), "urn:x:img");
    }

    #[test]
    fn relative_name_strips_base() {
        let vol = Urn::try_from("aff4://host").unwrap();
        let member = vol.join("img/00000000.idx");

        assert_eq!(member.relative_name(&vol), "img/00000000.idx");
        assert!(member.is_contained_in(&vol));
        assert!(!vol.is_contained_in(&member));
    }

    #[test]
    fn file_path_round_trip() {
        let urn = Urn::from_file_path("/tmp/container.zip");

        assert_eq!(urn.to_string(), "file:///tmp/container.zip");
        assert_eq!(urn.to_file_path().unwrap(), PathBuf::from("/tmp/container.zip"));
    }

    #[test]
    fn encode_is_nul_terminated() {
        let urn = Urn::try_from("urn:x:img").unwrap();
        let bytes = urn.encode();

        assert_eq!(bytes.last(), Some(&0));
        assert_eq!(&bytes[..bytes.len() - 1], "urn:x:img".as_bytes());
    }
}
