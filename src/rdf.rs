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

use crate::resolver::Resolver;
use crate::urn::Urn;
use crate::ValueError;

use std::fmt;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};

/// Attributes in this namespace are persisted into the manifest segment.
pub const AFF4_NS: &str = "aff4:";
/// Attributes in this namespace are never persisted.
pub const VOLATILE_NS: &str = "aff4volatile:";

pub const AFF4_STORED: &str = "aff4:stored";
pub const AFF4_TYPE: &str = "aff4:type";
pub const AFF4_SIZE: &str = "aff4:size";
pub const AFF4_TIMESTAMP: &str = "aff4:timestamp";
pub const AFF4_SHA256: &str = "aff4:sha256";
pub const AFF4_CHUNK_SIZE: &str = "aff4:chunk_size";
pub const AFF4_CHUNKS_IN_SEGMENT: &str = "aff4:chunks_in_segment";
pub const AFF4_COMPRESSION: &str = "aff4:compression";
pub const AFF4_IMAGE_PERIOD: &str = "aff4:image_period";
pub const AFF4_TARGET_PERIOD: &str = "aff4:target_period";
pub const AFF4_BLOCKSIZE: &str = "aff4:blocksize";
pub const AFF4_TARGET: &str = "aff4:target";
pub const AFF4_MAP_DATA: &str = "aff4:map_data";

pub const AFF4_CONTAINS: &str = "aff4volatile:contains";
pub const AFF4_DIRTY: &str = "aff4volatile:dirty";
pub const AFF4_DIRECTORY_OFFSET: &str = "aff4volatile:directory_offset";
pub const AFF4_ZIP_COMPRESSION: &str = "aff4volatile:compression";
pub const AFF4_CRC: &str = "aff4volatile:crc32";
pub const AFF4_COMPRESSED_SIZE: &str = "aff4volatile:compress_size";
pub const AFF4_HEADER_OFFSET: &str = "aff4volatile:header_offset";
pub const AFF4_FILE_OFFSET: &str = "aff4volatile:file_offset";

/// The closed set of stream types a `aff4:type` statement may carry.
pub const TYPE_SEGMENT: &str = "segment";
pub const TYPE_IMAGE: &str = "image";
pub const TYPE_MAP: &str = "map";
pub const TYPE_ZIP_VOLUME: &str = "zip_volume";
pub const TYPE_DIRECTORY_VOLUME: &str = "directory";
pub const TYPE_LINK: &str = "link";
/// Streams that failed mid-write are demoted to this type
/// so that later opens refuse them.
pub const TYPE_BROKEN: &str = "broken";

pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_UNSIGNED_INT: &str = "http://www.w3.org/2001/XMLSchema#unsignedInt";
pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
pub const XSD_HEX_BINARY: &str = "http://www.w3.org/2001/XMLSchema#hexBinary";
pub const XSD_DATETIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
pub const RDF_URN: &str = "rdf:urn";
pub const AFF4_MAP_TEXT: &str = "aff4:map_text";

const DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

/// A `Value` is a typed RDF literal as held by the statement store.
///
/// Every variant converts four ways: `encode`/`decode` translate to the
/// compact binary form used inside the store, `serialise`/`parse`
/// translate to the text form used in manifest segments. The datatype
/// IRI tags both external forms so the variant survives the round trip.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Value {
    /// A signed 64-bit integer (sizes, offsets, tunables).
    Integer(i64),
    /// An unsigned 32-bit integer (CRCs, Zip method numbers).
    UInt(u32),
    /// A UTF-8 string.
    String(String),
    /// Raw bytes (digests). Serialised as lowercase hex.
    Bytes(Vec<u8>),
    /// A URN reference.
    Urn(Urn),
    /// A point in time with sub-second precision.
    Timestamp(DateTime<FixedOffset>),
    /// A reference to a map stream. The map content itself lives in the
    /// stream's `map` segment, so only the URN crosses the store.
    Map(Urn),
}

impl Value {
    /// Returns the datatype IRI used when serialising the `Value`.
    pub fn datatype(&self) -> &'static str {
        match self {
            Value::Integer(_) => XSD_INTEGER,
            Value::UInt(_) => XSD_UNSIGNED_INT,
            Value::String(_) => XSD_STRING,
            Value::Bytes(_) => XSD_HEX_BINARY,
            Value::Urn(_) => RDF_URN,
            Value::Timestamp(_) => XSD_DATETIME,
            Value::Map(_) => AFF4_MAP_TEXT,
        }
    }

    /// Returns the compact binary form of the `Value`
    /// for the statement store.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Integer(i) => i.to_le_bytes().to_vec(),
            Value::UInt(u) => u.to_le_bytes().to_vec(),
            Value::String(s) => s.clone().into_bytes(),
            Value::Bytes(b) => b.clone(),
            Value::Urn(urn) | Value::Map(urn) => urn.encode(),
            Value::Timestamp(t) => {
                let mut bytes = Vec::with_capacity(12);
                bytes.extend_from_slice(&t.timestamp().to_le_bytes());
                bytes.extend_from_slice(&t.timestamp_subsec_nanos().to_le_bytes());
                bytes
            }
        }
    }

    /// Decodes the compact binary form back into a `Value`.
    /// Unknown datatypes fall back to the string variant.
    pub fn decode(datatype: &str, bytes: &[u8]) -> Result<Self, ValueError> {
        match datatype {
            XSD_INTEGER => Ok(Value::Integer(i64::from_le_bytes(fixed(
                datatype, bytes,
            )?))),
            XSD_UNSIGNED_INT => Ok(Value::UInt(u32::from_le_bytes(fixed(datatype, bytes)?))),
            XSD_STRING => Ok(Value::String(utf8(datatype, bytes)?)),
            XSD_HEX_BINARY => Ok(Value::Bytes(bytes.to_vec())),
            RDF_URN => Ok(Value::Urn(decode_urn(datatype, bytes)?)),
            AFF4_MAP_TEXT => Ok(Value::Map(decode_urn(datatype, bytes)?)),
            XSD_DATETIME => {
                let secs = i64::from_le_bytes(fixed(datatype, bytes)?);
                let nanos = u32::from_le_bytes(fixed(datatype, bytes.get(8..).unwrap_or(&[]))?);
                let time = Utc
                    .timestamp_opt(secs, nanos)
                    .single()
                    .ok_or_else(|| ValueError::Malformed {
                        datatype: datatype.to_string(),
                        text: format!("{secs}.{nanos}"),
                    })?;

                Ok(Value::Timestamp(time.fixed_offset()))
            }
            _ => Ok(Value::String(
                String::from_utf8_lossy(bytes).into_owned(),
            )),
        }
    }

    /// Returns the human text form of the `Value`
    /// for the RDF manifest.
    pub fn serialise(&self) -> String {
        match self {
            Value::Integer(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => to_hex(b),
            Value::Urn(urn) | Value::Map(urn) => urn.to_string(),
            Value::Timestamp(t) => t.format(DATETIME_FMT).to_string(),
        }
    }

    /// Parses the text form back into a `Value` of the tagged datatype.
    /// Unknown datatypes fall back to the string variant.
    pub fn parse(datatype: &str, text: &str) -> Result<Self, ValueError> {
        let malformed = || ValueError::Malformed {
            datatype: datatype.to_string(),
            text: text.to_string(),
        };

        match datatype {
            XSD_INTEGER => text
                .trim()
                .parse()
                .map(Value::Integer)
                .map_err(|_| malformed()),
            XSD_UNSIGNED_INT => text.trim().parse().map(Value::UInt).map_err(|_| malformed()),
            XSD_STRING => Ok(Value::String(text.to_string())),
            XSD_HEX_BINARY => from_hex(text).map(Value::Bytes).ok_or_else(malformed),
            RDF_URN => Urn::try_from(text).map(Value::Urn).map_err(|_| malformed()),
            AFF4_MAP_TEXT => Urn::try_from(text).map(Value::Map).map_err(|_| malformed()),
            XSD_DATETIME => DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%:z")
                .map(Value::Timestamp)
                .map_err(|_| malformed()),
            _ => Ok(Value::String(text.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serialise())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::Integer(u as i64)
    }
}

impl From<u32> for Value {
    fn from(u: u32) -> Self {
        Value::UInt(u)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Urn> for Value {
    fn from(urn: Urn) -> Self {
        Value::Urn(urn)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(time: DateTime<Utc>) -> Self {
        Value::Timestamp(time.fixed_offset())
    }
}

/// A `Statement` is one (subject, attribute, object) triple.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Statement {
    /// The subject URN the statement is about.
    pub subject: Urn,
    /// The namespaced attribute name.
    pub attribute: String,
    /// The object value.
    pub object: Value,
}

/// Serialises every persistent statement of a volume into the
/// line-oriented triple form of a `properties` manifest segment.
///
/// A subject is included when its `aff4:stored` is the volume itself or
/// when it carries no `stored` statement at all; subjects stored in other
/// containers belong to those containers' manifests. Attributes in the
/// volatile namespace are never written.
pub fn serialise_properties(resolver: &Resolver, volume: &Urn) -> String {
    let mut text = String::new();

    for subject in resolver.subjects() {
        // Statements about backing files describe this machine,
        // not the evidence.
        if subject.scheme() == "file" {
            continue;
        }

        match resolver.resolve_urn(&subject, AFF4_STORED) {
            Ok(stored) if stored != *volume => continue,
            _ => {}
        }

        for attribute in resolver.attributes(&subject) {
            if attribute.starts_with(VOLATILE_NS) {
                continue;
            }

            for value in resolver.resolve_list(&subject, &attribute) {
                match value {
                    Value::Urn(ref target) => {
                        text.push_str(&format!("<{subject}> <{attribute}> <{target}> .\n"));
                    }
                    other => {
                        text.push_str(&format!(
                            "<{subject}> <{attribute}> \"{}\"^^<{}> .\n",
                            escape_literal(&other.serialise()),
                            other.datatype()
                        ));
                    }
                }
            }
        }
    }

    text
}

/// Parses a `properties` manifest segment, feeding its statements into
/// the resolver. `base` scopes relative subjects (the directory URN of
/// the segment); `volume` receives a `contains` assertion for every
/// subject that is not the volume itself.
///
/// A malformed triple is logged and skipped; parsing continues with the
/// next line. Returns the number of statements accepted.
pub fn parse_properties(resolver: &Resolver, volume: &Urn, base: &Urn, text: &str) -> usize {
    let mut accepted = 0;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_triple(line, base) {
            Some(statement) => {
                if statement.subject != *volume {
                    resolver.add(
                        volume,
                        AFF4_CONTAINS,
                        Value::Urn(statement.subject.clone()),
                        true,
                    );
                }

                resolver.add(&statement.subject, &statement.attribute, statement.object, true);
                accepted += 1;
            }
            None => {
                tracing::warn!(line, "skipping malformed manifest triple");
            }
        }
    }

    accepted
}

/// Parses one triple line. Returns `None` on any malformation.
fn parse_triple(line: &str, base: &Urn) -> Option<Statement> {
    let (subject_text, rest) = take_angle(line)?;
    let (attribute, rest) = take_angle(rest)?;

    let subject = match Urn::try_from(subject_text) {
        Ok(urn) => urn,
        Err(_) => base.join(subject_text),
    };

    let rest = rest.trim_start();
    let object = if rest.starts_with('<') {
        let (target, _) = take_angle(rest)?;
        Value::Urn(Urn::try_from(target).ok()?)
    } else {
        let (literal, rest) = take_quoted(rest)?;
        let datatype = match rest.strip_prefix("^^") {
            Some(tail) => take_angle(tail)?.0,
            None => XSD_STRING,
        };

        Value::parse(datatype, &unescape_literal(literal)?).ok()?
    };

    Some(Statement {
        subject,
        attribute: attribute.to_string(),
        object,
    })
}

/// Consumes a leading `<...>` token, returning its contents
/// and the remainder of the line.
fn take_angle(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    let inner = text.strip_prefix('<')?;
    let end = inner.find('>')?;

    Some((&inner[..end], &inner[end + 1..]))
}

/// Consumes a leading quoted literal, honouring backslash escapes.
fn take_quoted(text: &str) -> Option<(&str, &str)> {
    let inner = text.strip_prefix('"')?;
    let mut escaped = false;

    for (i, c) in inner.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some((&inner[..i], &inner[i + 1..]));
        }
    }

    None
}

fn escape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }

    out
}

fn unescape_literal(text: &str) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next()? {
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => return None,
        }
    }

    Some(out)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return None;
    }

    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

fn fixed<const N: usize>(datatype: &str, bytes: &[u8]) -> Result<[u8; N], ValueError> {
    bytes
        .get(..N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| ValueError::Truncated {
            datatype: datatype.to_string(),
            expected: N,
            got: bytes.len(),
        })
}

fn utf8(datatype: &str, bytes: &[u8]) -> Result<String, ValueError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ValueError::InvalidUnicode {
        datatype: datatype.to_string(),
    })
}

fn decode_urn(datatype: &str, bytes: &[u8]) -> Result<Urn, ValueError> {
    let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    let text = utf8(datatype, bytes)?;

    Urn::try_from(text.as_str()).map_err(|_| ValueError::Malformed {
        datatype: datatype.to_string(),
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Value> {
        vec![
            Value::Integer(-42),
            Value::Integer(1 << 40),
            Value::UInt(0xdead_beef),
            Value::String("hello world".to_string()),
            Value::Bytes(vec![0x00, 0xff, 0x10]),
            Value::Urn(Urn::try_from("aff4://host/img/00000001").unwrap()),
            Value::Timestamp(
                Utc.with_ymd_and_hms(2010, 3, 14, 15, 9, 26)
                    .unwrap()
                    .fixed_offset(),
            ),
            Value::Map(Urn::try_from("urn:x:map").unwrap()),
        ]
    }

    #[test]
    fn encode_decode_round_trip() {
        for value in samples() {
            let decoded = Value::decode(value.datatype(), &value.encode()).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn serialise_parse_round_trip() {
        for value in samples() {
            let parsed = Value::parse(value.datatype(), &value.serialise()).unwrap();
            assert_eq!(parsed, value);
        }
    }

    #[test]
    fn datetime_text_form() {
        let value = Value::Timestamp(
            Utc.with_ymd_and_hms(2010, 3, 14, 15, 9, 26)
                .unwrap()
                .fixed_offset(),
        );

        assert_eq!(value.serialise(), "2010-03-14T15:09:26.000000+00:00");
    }

    #[test]
    fn unknown_datatype_falls_back_to_string() {
        let value = Value::parse("example:custom", "anything at all").unwrap();
        assert_eq!(value, Value::String("anything at all".to_string()));
    }

    #[test]
    fn decode_rejects_short_integers() {
        assert!(Value::decode(XSD_INTEGER, &[1, 2, 3]).is_err());
    }

    #[test]
    fn literal_escaping_round_trip() {
        let nasty = "a \"quoted\"\nline \\ with extras";
        assert_eq!(unescape_literal(&escape_literal(nasty)).unwrap(), nasty);
    }

    #[test]
    fn triple_parses_urn_object() {
        let base = Urn::try_from("aff4://vol").unwrap();
        let statement =
            parse_triple("<aff4://vol/seg> <aff4:stored> <aff4://vol> .", &base).unwrap();

        assert_eq!(statement.attribute, AFF4_STORED);
        assert_eq!(statement.object, Value::Urn(base));
    }

    #[test]
    fn triple_parses_typed_literal() {
        let base = Urn::try_from("aff4://vol").unwrap();
        let statement = parse_triple(
            "<aff4://vol/seg> <aff4:size> \"123\"^^<http://www.w3.org/2001/XMLSchema#integer> .",
            &base,
        )
        .unwrap();

        assert_eq!(statement.object, Value::Integer(123));
    }

    #[test]
    fn triple_rejects_garbage() {
        let base = Urn::try_from("aff4://vol").unwrap();
        assert!(parse_triple("not a triple", &base).is_none());
        assert!(parse_triple("<urn:x:a> <p> \"unterminated", &base).is_none());
    }
}
