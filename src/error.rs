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

use crate::urn::Urn;

use std::io;

use thiserror::Error;

/// A `UrnParseError` indicates a failure parsing a [`Urn`].
#[derive(Debug, Error)]
pub enum UrnParseError {
    /// The input is empty or consists only of whitespace.
    #[error("Empty URN")]
    Empty,
    /// The input does not carry a scheme, so it is at best a relative
    /// name that must be joined to a base URN by the caller.
    #[error("URN \"{0}\" has no scheme")]
    MissingScheme(String),
    /// The input contains a percent-escape that does not decode to UTF-8.
    #[error("URN \"{0}\" contains an invalid percent-escape")]
    InvalidEscape(String),
}

/// A `ValueError` indicates a failure converting an RDF value
/// between its in-memory, compact binary and serialised text forms.
#[derive(Debug, Error)]
pub enum ValueError {
    /// The compact binary form is shorter than the fixed width
    /// the datatype requires.
    #[error("Encoded \"{datatype}\" value is truncated ({got} of {expected} bytes)")]
    Truncated {
        /// The datatype IRI of the value being decoded.
        datatype: String,
        /// The width the datatype requires.
        expected: usize,
        /// The width that was available.
        got: usize,
    },
    /// The compact binary form does not decode to valid UTF-8
    /// even though the datatype calls for text.
    #[error("Encoded \"{datatype}\" value is not valid UTF-8")]
    InvalidUnicode {
        /// The datatype IRI of the value being decoded.
        datatype: String,
    },
    /// The serialised text form cannot be parsed back into a value
    /// of the tagged datatype.
    #[error("Unable to parse \"{text}\" as \"{datatype}\"")]
    Malformed {
        /// The datatype IRI the text claims to serialise.
        datatype: String,
        /// The offending text.
        text: String,
    },
}

/// An `Aff4Error` indicates an error condition in the container library.
/// It wraps the more specific parse errors and carries the I/O,
/// format and consistency failures of the volume and stream engines.
#[derive(Debug, Error)]
pub enum Aff4Error {
    /// A `std::io::Error` I/O error occured on a backing file.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// There was a failure parsing a [`Urn`].
    #[error("Failed to parse URN: {0}")]
    UrnParseError(#[from] UrnParseError),
    /// There was a failure decoding or parsing an RDF value.
    #[error("Value error: {0}")]
    ValueError(#[from] ValueError),

    /// A Zip signature, Zip64 extra field or manifest structure
    /// is malformed. The payload names the offending structure.
    #[error("Malformed {0}")]
    InvalidFormat(&'static str),

    /// The resolver holds no value for the requested subject and attribute.
    #[error("No value for <{subject}> {attribute}")]
    NotFound {
        /// The subject URN that was queried.
        subject: Urn,
        /// The attribute that was queried, or `*` for the whole subject.
        attribute: String,
    },

    /// A typed resolve refused a value of a different datatype.
    #[error("Expected value of type \"{expected}\", got \"{got}\"")]
    TypeMismatch {
        /// The datatype IRI the caller asked for.
        expected: &'static str,
        /// The datatype IRI of the stored value.
        got: String,
    },

    /// A named URN lock is held by another party
    /// and the caller requested a non-blocking acquisition.
    #[error("Lock '{name}' on <{urn}> is held elsewhere")]
    Locked {
        /// The URN the lock is attached to.
        urn: Urn,
        /// The single-character lock name.
        name: char,
    },

    /// Decompressed data failed CRC verification
    /// or a size recorded in the volume is inconsistent.
    #[error("Data of <{0}> failed verification")]
    Corrupt(Urn),

    /// The volume uses a feature the library does not implement,
    /// e.g. multi-disk archives or an unknown compression method.
    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    /// A `toml::ser::Error` TOML serialization error occured.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// A `toml::de::Error` TOML deserialization error occured.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
