//! Hierarchical names.
//!
//! A [`Name`] is an ordered list of typed [`Component`]s. Names identify
//! everything the sync layer touches: participants, sync groups, published
//! items and storage keys.
//!
//! ## Text form
//!
//! Names print as `/`-separated components. Generic components print their
//! percent-escaped value, keywords print as `32=text`, and the numeric
//! conventions print as `seg=N`, `v=N` and `seq=N`. Any other type prints
//! as `<type>=<escaped value>`. [`Name::from_str`] parses the same form.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Well-known component types.
pub mod component_type {
    /// Opaque generic component.
    pub const GENERIC: u16 = 8;
    /// Reserved protocol keyword.
    pub const KEYWORD: u16 = 32;
    /// Segment number of a segmented object.
    pub const SEGMENT: u16 = 50;
    /// Version number.
    pub const VERSION: u16 = 54;
    /// Sequence number of a published item.
    pub const SEQUENCE: u16 = 58;
}

use component_type::{GENERIC, KEYWORD, SEGMENT, SEQUENCE, VERSION};

/// A single typed name component.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Component {
    typ: u16,
    value: Bytes,
}

impl Component {
    /// Create a component with an explicit type.
    pub fn new(typ: u16, value: impl Into<Bytes>) -> Self {
        Self {
            typ,
            value: value.into(),
        }
    }

    /// A generic component holding UTF-8 text.
    pub fn generic(text: &str) -> Self {
        Self::new(GENERIC, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// A keyword component.
    pub fn keyword(text: &str) -> Self {
        Self::new(KEYWORD, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// A segment number component.
    pub fn segment(n: u64) -> Self {
        Self::new(SEGMENT, encode_number(n))
    }

    /// A version number component.
    pub fn version(n: u64) -> Self {
        Self::new(VERSION, encode_number(n))
    }

    /// A sequence number component.
    pub fn sequence(n: u64) -> Self {
        Self::new(SEQUENCE, encode_number(n))
    }

    pub fn typ(&self) -> u16 {
        self.typ
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Interpret the value as a non-negative integer, regardless of type.
    pub fn as_number(&self) -> Option<u64> {
        decode_number(&self.value)
    }

    /// The sequence number, if this is a sequence component.
    pub fn as_sequence(&self) -> Option<u64> {
        (self.typ == SEQUENCE).then(|| self.as_number()).flatten()
    }

    /// The segment number, if this is a segment component.
    pub fn as_segment(&self) -> Option<u64> {
        (self.typ == SEGMENT).then(|| self.as_number()).flatten()
    }

    /// The version number, if this is a version component.
    pub fn as_version(&self) -> Option<u64> {
        (self.typ == VERSION).then(|| self.as_number()).flatten()
    }

    /// The value as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    pub(crate) fn parse(text: &str) -> Result<Self> {
        if let Some((prefix, rest)) = text.split_once('=') {
            let number = |rest: &str| {
                rest.parse::<u64>()
                    .map_err(|_| CoreError::InvalidName(format!("bad number in {text:?}")))
            };
            match prefix {
                "seg" => return Ok(Self::segment(number(rest)?)),
                "v" => return Ok(Self::version(number(rest)?)),
                "seq" => return Ok(Self::sequence(number(rest)?)),
                _ => {}
            }
            if !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()) {
                let typ = prefix
                    .parse::<u16>()
                    .map_err(|_| CoreError::InvalidName(format!("bad type in {text:?}")))?;
                return Ok(Self::new(typ, unescape(rest)?));
            }
        }
        let value = unescape(text)?;
        // "..." is the escaped form of the empty component; every run of
        // N+3 periods stands for N periods.
        if !value.is_empty() && value.iter().all(|&b| b == b'.') {
            if value.len() < 3 {
                return Err(CoreError::InvalidName(format!("bad component {text:?}")));
            }
            return Ok(Self::new(GENERIC, value.slice(3..)));
        }
        Ok(Self::new(GENERIC, value))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.typ, self.as_number()) {
            (SEGMENT, Some(n)) => return write!(f, "seg={n}"),
            (VERSION, Some(n)) => return write!(f, "v={n}"),
            (SEQUENCE, Some(n)) => return write!(f, "seq={n}"),
            _ => {}
        }
        if self.typ == GENERIC {
            if self.value.iter().all(|&b| b == b'.') {
                f.write_str("...")?;
            }
        } else {
            write!(f, "{}=", self.typ)?;
        }
        for &b in self.value.iter() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{b:02X}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// An ordered sequence of components.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Name(Vec<Component>);

impl Name {
    /// The empty name `/`.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_components(components: Vec<Component>) -> Self {
        Self(components)
    }

    /// Parse the text form. Shorthand for [`str::parse`].
    pub fn parse(text: &str) -> Result<Self> {
        text.parse()
    }

    pub fn components(&self) -> &[Component] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Component> {
        self.0.get(index)
    }

    pub fn last(&self) -> Option<&Component> {
        self.0.last()
    }

    /// Return a new name with `component` appended.
    pub fn append(&self, component: Component) -> Self {
        let mut components = self.0.clone();
        components.push(component);
        Self(components)
    }

    /// Return a new name with every component of `suffix` appended.
    pub fn join(&self, suffix: &Name) -> Self {
        let mut components = self.0.clone();
        components.extend(suffix.0.iter().cloned());
        Self(components)
    }

    pub fn push(&mut self, component: Component) {
        self.0.push(component);
    }

    /// The first `n` components (the whole name if `n >= len`).
    pub fn prefix(&self, n: usize) -> Self {
        Self(self.0[..n.min(self.0.len())].to_vec())
    }

    /// The name without its last `n` components.
    pub fn drop_last(&self, n: usize) -> Self {
        self.prefix(self.0.len().saturating_sub(n))
    }

    /// The components from `start` onwards.
    pub fn suffix_from(&self, start: usize) -> Self {
        Self(self.0[start.min(self.0.len())..].to_vec())
    }

    /// Whether `self` is a (non-strict) prefix of `other`.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }

    /// Sequence number carried by the last component, if any.
    pub fn sequence(&self) -> Option<u64> {
        self.last().and_then(Component::as_sequence)
    }

    /// Segment number carried by the last component, if any.
    pub fn segment(&self) -> Option<u64> {
        self.last().and_then(Component::as_segment)
    }

    /// Encode to CBOR.
    pub fn encode(&self) -> Bytes {
        crate::to_cbor(self)
    }

    /// Decode from CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        crate::from_cbor(bytes)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for component in &self.0 {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

impl FromStr for Name {
    type Err = CoreError;

    fn from_str(text: &str) -> Result<Self> {
        let trimmed = text.strip_prefix('/').unwrap_or(text);
        if trimmed.is_empty() {
            return Ok(Self::new());
        }
        trimmed
            .split('/')
            .filter(|part| !part.is_empty())
            .map(Component::parse)
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

impl From<Vec<Component>> for Name {
    fn from(components: Vec<Component>) -> Self {
        Self(components)
    }
}

impl<'a> IntoIterator for &'a Name {
    type Item = &'a Component;
    type IntoIter = std::slice::Iter<'a, Component>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Minimal big-endian encoding using 1, 2, 4 or 8 bytes.
pub(crate) fn encode_number(n: u64) -> Bytes {
    if n <= u8::MAX as u64 {
        Bytes::copy_from_slice(&[n as u8])
    } else if n <= u16::MAX as u64 {
        Bytes::copy_from_slice(&(n as u16).to_be_bytes())
    } else if n <= u32::MAX as u64 {
        Bytes::copy_from_slice(&(n as u32).to_be_bytes())
    } else {
        Bytes::copy_from_slice(&n.to_be_bytes())
    }
}

fn decode_number(value: &[u8]) -> Option<u64> {
    match value.len() {
        1 | 2 | 4 | 8 => Some(value.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)),
        _ => None,
    }
}

fn unescape(text: &str) -> Result<Bytes> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = text
                .get(i + 1..i + 3)
                .ok_or_else(|| CoreError::InvalidName(format!("truncated escape in {text:?}")))?;
            let b = u8::from_str_radix(hex, 16)
                .map_err(|_| CoreError::InvalidName(format!("bad escape in {text:?}")))?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let name: Name = "/test/32=node/seq=7".parse().unwrap();
        assert_eq!(name.len(), 3);
        assert_eq!(name.get(1), Some(&Component::keyword("node")));
        assert_eq!(name.sequence(), Some(7));
        assert_eq!(name.to_string(), "/test/32=node/seq=7");
    }

    #[test]
    fn test_escaping() {
        let name = Name::new().append(Component::generic("a b/c"));
        assert_eq!(name.to_string(), "/a%20b%2Fc");
        assert_eq!(Name::parse("/a%20b%2Fc").unwrap(), name);

        let empty = Name::new().append(Component::generic(""));
        assert_eq!(empty.to_string(), "/...");
        assert_eq!(Name::parse("/...").unwrap(), empty);
    }

    #[test]
    fn test_numeric_components() {
        for n in [0u64, 255, 256, 65_536, u64::MAX] {
            assert_eq!(Component::segment(n).as_segment(), Some(n));
            assert_eq!(Component::sequence(n).as_segment(), None);
        }
        assert_eq!(Component::segment(300).value(), &[0x01, 0x2c]);
        assert_eq!(Name::parse("/x/v=3").unwrap().last(), Some(&Component::version(3)));
    }

    #[test]
    fn test_prefix_relations() {
        let app = Name::parse("/app").unwrap();
        let node = Name::parse("/app/alice").unwrap();
        assert!(app.is_prefix_of(&node));
        assert!(node.is_prefix_of(&node));
        assert!(!node.is_prefix_of(&app));
        assert_eq!(node.drop_last(1), app);
        assert_eq!(node.suffix_from(1).to_string(), "/alice");
        assert_eq!(app.join(&Name::parse("/alice").unwrap()), node);
    }

    #[test]
    fn test_root_and_bad_input() {
        assert!(Name::parse("/").unwrap().is_empty());
        assert!(Name::parse("/a%2").is_err());
        assert!(Name::parse("/seq=abc").is_err());
    }

    #[test]
    fn test_cbor_roundtrip() {
        let name = Name::parse("/app/32=sync/seq=42").unwrap();
        assert_eq!(Name::decode(&name.encode()).unwrap(), name);
    }
}
